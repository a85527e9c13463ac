//! Store and control subcommands: create, set, ls, inspect, rm, disk,
//! export, import, and the QMP verbs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde_json::Value;
use vmctl::{ConnectPolicy, DiskFormat, Graphics, NetworkMode, Runtime, VmConfig, qmp};

use crate::{Global, human_size};

/// How long one-shot control verbs wait for the control socket.
const CONTROL_WINDOW: Duration = Duration::from_secs(3);

/// Output format for listing commands.
#[derive(Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

/// Settings accepted by both `create` and `set`.
#[derive(clap::Args, Default)]
pub struct ConfigArgs {
    /// Virtual CPU count.
    #[arg(long)]
    cpus: Option<u32>,

    /// Guest memory in MiB.
    #[arg(short, long, value_name = "MIB")]
    memory: Option<u32>,

    /// Size of the primary disk in GiB, allocated on first launch.
    #[arg(long, value_name = "GIB")]
    disk_size: Option<u64>,

    /// Format of the primary disk (raw, qcow2, qed, vmdk, vdi, vhdx).
    #[arg(long)]
    disk_format: Option<DiskFormat>,

    /// Installation ISO attached as a CD-ROM.
    #[arg(long, value_name = "PATH")]
    iso: Option<PathBuf>,

    /// Display backend (sdl, gtk, vnc, none).
    #[arg(long)]
    graphics: Option<Graphics>,

    /// Network attachment (user, bridge, host-only, none).
    #[arg(long)]
    network: Option<NetworkMode>,

    /// Use KVM acceleration.
    #[arg(long, value_name = "BOOL")]
    kvm: Option<bool>,

    /// Pass host CPU virtualization through (requires --kvm true).
    #[arg(long, value_name = "BOOL")]
    nested: Option<bool>,

    /// Boot with UEFI firmware.
    #[arg(long, value_name = "BOOL")]
    efi: Option<bool>,

    /// UEFI firmware image passed as -bios.
    #[arg(long, value_name = "PATH")]
    firmware: Option<PathBuf>,

    /// Boot device order, e.g. "cdrom,hd,menu".
    #[arg(long, value_name = "ORDER")]
    boot_order: Option<String>,

    /// QEMU machine type.
    #[arg(long)]
    machine: Option<String>,

    /// Tap interface for bridged networking.
    #[arg(long, value_name = "IFACE")]
    tap: Option<String>,

    /// Extra hypervisor arguments, split on whitespace.
    #[arg(long, value_name = "ARGS", allow_hyphen_values = true)]
    extra_args: Option<String>,

    /// Launch with `vmctl up`.
    #[arg(long, value_name = "BOOL")]
    autostart: Option<bool>,
}

impl ConfigArgs {
    /// Overwrites every field that was given on the command line.
    fn apply(self, config: &mut VmConfig) {
        if let Some(v) = self.cpus {
            config.cpu_cores = v;
        }
        if let Some(v) = self.memory {
            config.memory_mib = v;
        }
        if let Some(v) = self.disk_size {
            config.disk_gib = v;
        }
        if let Some(v) = self.disk_format {
            config.disk_format = v;
        }
        if let Some(v) = self.iso {
            config.iso_path = Some(v);
        }
        if let Some(v) = self.graphics {
            config.graphics = v;
        }
        if let Some(v) = self.network {
            config.network_mode = v;
        }
        if let Some(v) = self.kvm {
            config.enable_kvm = v;
        }
        if let Some(v) = self.nested {
            config.nested_virt = v;
        }
        if let Some(v) = self.efi {
            config.efi = v;
        }
        if let Some(v) = self.firmware {
            config.advanced.firmware = Some(v);
        }
        if let Some(v) = self.boot_order {
            config.boot_order = v;
        }
        if let Some(v) = self.machine {
            config.advanced.machine = Some(v);
        }
        if let Some(v) = self.tap {
            config.advanced.tap_name = Some(v);
        }
        if let Some(v) = self.extra_args {
            config.extra_args = v;
        }
        if let Some(v) = self.autostart {
            config.autostart = v;
        }
    }
}

#[derive(clap::Args)]
pub struct CreateArgs {
    /// VM name.
    name: String,

    #[command(flatten)]
    config: ConfigArgs,
}

impl CreateArgs {
    pub fn run(self, global: &Global) -> Result<()> {
        let rt = global.runtime()?;
        let mut vm = rt.create(&self.name)?;
        self.config.apply(vm.config_mut());
        vm.save()?;
        println!("{}", vm.name());
        Ok(())
    }
}

#[derive(clap::Args)]
pub struct SetArgs {
    /// VM name.
    name: String,

    /// Detach the installation ISO.
    #[arg(long, conflicts_with = "iso")]
    detach_iso: bool,

    #[command(flatten)]
    config: ConfigArgs,
}

impl SetArgs {
    pub fn run(self, global: &Global) -> Result<()> {
        let rt = global.runtime()?;
        let mut vm = rt.get(&self.name)?;
        self.config.apply(vm.config_mut());
        if self.detach_iso {
            vm.config_mut().iso_path = None;
        }
        vm.save()?;
        Ok(())
    }
}

#[derive(clap::Args)]
pub struct LsArgs {
    /// Output format.
    #[arg(long, default_value = "table")]
    format: OutputFormat,
}

impl LsArgs {
    pub fn run(self, global: &Global) -> Result<()> {
        let configs = global.runtime()?.list()?;
        match self.format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&configs)?);
            }
            OutputFormat::Table => {
                println!(
                    "{:<20} {:>4} {:>8} {:>5} {:<8} {:<10} AUTOSTART",
                    "NAME", "CPUS", "MEMORY", "DISKS", "GRAPHICS", "NETWORK"
                );
                for c in &configs {
                    println!(
                        "{:<20} {:>4} {:>8} {:>5} {:<8} {:<10} {}",
                        c.name,
                        c.cpu_cores,
                        format!("{}M", c.memory_mib),
                        c.disks.len(),
                        c.graphics,
                        c.network_mode,
                        if c.autostart { "yes" } else { "no" },
                    );
                }
            }
        }
        Ok(())
    }
}

pub fn inspect(global: &Global, names: &[String]) -> Result<()> {
    let rt = global.runtime()?;
    let configs = names
        .iter()
        .map(|n| Ok(rt.get(n)?.config().clone()))
        .collect::<Result<Vec<_>>>()?;
    println!("{}", serde_json::to_string_pretty(&configs)?);
    Ok(())
}

pub fn remove(global: &Global, names: &[String]) -> Result<()> {
    let rt = global.runtime()?;
    let mut errors = Vec::new();
    for name in names {
        match rt.remove(name) {
            Ok(()) => println!("{name}"),
            Err(e) => errors.push(format!("{name}: {e}")),
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("{}", errors.join("\n"))
    }
}

pub fn cmdline(global: &Global, name: &str) -> Result<()> {
    let mut vm = global.runtime()?.get(name)?;
    let cmd = vm.command(None)?;
    let mut line = cmd.program.display().to_string();
    for arg in &cmd.args {
        line.push(' ');
        line.push_str(arg);
    }
    println!("{line}");
    Ok(())
}

#[derive(clap::Subcommand)]
pub enum DiskCommand {
    /// Create an additional disk image.
    Create {
        /// VM name.
        vm: String,
        /// File name inside the VM's disks directory.
        name: String,
        /// Size in GiB.
        #[arg(long, value_name = "GIB")]
        size: u64,
        /// Image format.
        #[arg(long, default_value = "raw")]
        format: DiskFormat,
    },
    /// List the disks of a VM.
    Ls {
        /// VM name.
        vm: String,
    },
}

impl DiskCommand {
    pub fn run(self, global: &Global) -> Result<()> {
        let rt = global.runtime()?;
        match self {
            Self::Create {
                vm,
                name,
                size,
                format,
            } => {
                let spec = rt.get(&vm)?.create_disk(&name, size, format)?;
                println!("{}", spec.path.display());
            }
            Self::Ls { vm } => {
                let vm = rt.get(&vm)?;
                println!("{:<8} {:>10}  PATH", "FORMAT", "SIZE");
                for disk in &vm.config().disks {
                    let size = std::fs::metadata(&disk.path)
                        .map_or_else(|_| "missing".to_owned(), |m| human_size(m.len()));
                    println!("{:<8} {:>10}  {}", disk.format, size, disk.path.display());
                }
            }
        }
        Ok(())
    }
}

#[derive(clap::Args)]
pub struct ExportArgs {
    /// VM name.
    name: String,

    /// Destination file (defaults to the store's exports directory).
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Also pack the attached installation ISO.
    #[arg(long)]
    include_iso: bool,
}

impl ExportArgs {
    pub fn run(self, global: &Global) -> Result<()> {
        let rt = global.runtime()?;
        let path = rt
            .export(&self.name, self.output.as_deref(), self.include_iso)
            .with_context(|| format!("exporting {}", self.name))?;
        println!("{}", path.display());
        Ok(())
    }
}

pub fn import(global: &Global, bundle: &Path) -> Result<()> {
    let vm = global
        .runtime()?
        .import(bundle)
        .with_context(|| format!("importing {}", bundle.display()))?;
    println!("{}", vm.name());
    Ok(())
}

/// Control verbs that take no arguments.
#[derive(Clone, Copy)]
pub enum Verb {
    Stop,
    Pause,
    Resume,
    Reset,
}

impl Verb {
    const fn command(self) -> &'static str {
        match self {
            Self::Stop => qmp::commands::SYSTEM_POWERDOWN,
            Self::Pause => qmp::commands::STOP,
            Self::Resume => qmp::commands::CONT,
            Self::Reset => qmp::commands::SYSTEM_RESET,
        }
    }
}

/// Opens the store with a short control window for one-shot verbs.
fn control_runtime(global: &Global) -> Result<Runtime> {
    Ok(global
        .runtime()?
        .with_policy(ConnectPolicy::default().window(CONTROL_WINDOW)))
}

/// Connects to `name`, runs `cmd`, and closes the connection.
async fn execute(rt: &Runtime, name: &str, cmd: &qmp::Command) -> Result<Value> {
    let client = rt
        .control(name)
        .await
        .with_context(|| format!("connecting to {name}"))?;
    let reply = client.execute(cmd).await;
    client.close().await;
    Ok(reply?)
}

pub async fn control_all(global: &Global, names: &[String], verb: Verb) -> Result<()> {
    let rt = control_runtime(global)?;
    let cmd = qmp::Command::new(verb.command());
    let mut errors = Vec::new();
    for name in names {
        match execute(&rt, name, &cmd).await {
            Ok(_) => println!("{name}"),
            Err(e) => errors.push(format!("{name}: {e:#}")),
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("{}", errors.join("\n"))
    }
}

pub async fn snapshot(global: &Global, name: &str, tag: &str) -> Result<()> {
    let rt = control_runtime(global)?;
    let client = rt
        .control(name)
        .await
        .with_context(|| format!("connecting to {name}"))?;
    let saved = client.savevm(tag).await;
    client.close().await;
    Ok(saved?)
}

pub async fn status(global: &Global, name: &str) -> Result<()> {
    let rt = control_runtime(global)?;
    let reply = execute(&rt, name, &qmp::Command::new(qmp::commands::QUERY_STATUS)).await?;
    match reply.get("status").and_then(Value::as_str) {
        Some(status) => println!("{status}"),
        None => println!("{reply}"),
    }
    Ok(())
}

/// Prints the full reply, including `error` objects, then any events.
pub async fn qmp(global: &Global, name: &str, input: &str) -> Result<()> {
    let rt = control_runtime(global)?;
    let cmd = qmp::Command::parse(input)?;
    let client = rt.control(name).await?;
    let reply = client.send_command(&cmd).await;
    let events = client.take_events();
    client.close().await;
    println!("{}", serde_json::to_string_pretty(&reply?)?);
    for ev in events {
        eprintln!("{ev}");
    }
    Ok(())
}
