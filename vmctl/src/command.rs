//! Hypervisor command-line synthesis.
//!
//! [`CommandBuilder::build`] performs the side effects a launch needs
//! (hypervisor lookup, primary disk, port allocation) and then calls
//! [`render`], which maps a config to arguments without touching the host.
//! Ports already recorded in [`Advanced`](crate::Advanced) are reused, so
//! rebuilding an unchanged config yields the same arguments.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::{ConfigStore, DiskSpec, Graphics, NetworkMode, VmConfig};
use crate::disk::DiskManager;
use crate::layout::Hypervisor;
use crate::{Result, ports};

/// Machine type used when none is configured.
pub const DEFAULT_MACHINE: &str = "q35";

/// Tap interface used for bridged networking when none is configured.
pub const DEFAULT_TAP: &str = "tap0";

/// Guest NIC attached to `net0`.
const NIC: &str = "virtio-net-pci,netdev=net0";

/// A resolved hypervisor invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct LaunchCommand {
    /// Hypervisor binary.
    pub program: PathBuf,
    /// Arguments, in order.
    pub args: Vec<String>,
    /// Loopback port the control socket will listen on.
    pub control_port: u16,
}

impl LaunchCommand {
    /// Creates a command.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, control_port: u16) -> Self {
        Self {
            program: program.into(),
            args,
            control_port,
        }
    }
}

/// Builds launch commands for VMs in one store.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    /// Saves allocated ports.
    store: ConfigStore,
    /// Self-heals the primary disk and resolves disk paths.
    disks: DiskManager,
    /// Hypervisor lookup.
    hypervisor: Hypervisor,
}

impl CommandBuilder {
    /// Creates a builder.
    pub const fn new(store: ConfigStore, disks: DiskManager, hypervisor: Hypervisor) -> Self {
        Self {
            store,
            disks,
            hypervisor,
        }
    }

    /// Prepares `config` for launch and returns the command.
    ///
    /// Fails with [`Error::HypervisorNotFound`](crate::Error::HypervisorNotFound)
    /// before touching disks or ports. Newly allocated ports are saved.
    /// `embed` is a native window handle for an embedded SDL display.
    pub fn build(&self, config: &mut VmConfig, embed: Option<u64>) -> Result<LaunchCommand> {
        let program = self.hypervisor.locate()?;
        self.disks.ensure_primary_disk(config)?;

        let mut dirty = false;
        if config.graphics == Graphics::Vnc && config.advanced.vnc_port.is_none() {
            let port = ports::vnc()?;
            debug!(vm = %config.name, port, "allocated VNC port");
            config.advanced.vnc_port = Some(port);
            dirty = true;
        }
        let control_port = match config.advanced.control_port {
            Some(port) => port,
            None => {
                let port = ports::ephemeral()?;
                debug!(vm = %config.name, port, "allocated control port");
                config.advanced.control_port = Some(port);
                dirty = true;
                port
            }
        };
        if dirty {
            self.store.save(config)?;
        }

        if config.nested_virt && !config.enable_kvm {
            warn!(vm = %config.name, "nested virtualization ignored without KVM");
        }
        if config.efi && config.advanced.firmware.is_none() {
            debug!(vm = %config.name, "EFI requested but no firmware image configured");
        }

        let disks = self.disks.launch_disks(config);
        let launch = VmConfig {
            iso_path: self.disks.launch_iso(config),
            ..config.clone()
        };
        let log_file = self.store.layout().log_file(&config.name);
        Ok(LaunchCommand {
            program,
            args: render(&launch, &disks, &log_file, embed),
            control_port,
        })
    }
}

/// Maps a config to hypervisor arguments.
///
/// `disks` are the drives to attach (normally [`DiskManager::launch_disks`]);
/// `config.iso_path` is used as given.
pub fn render(
    config: &VmConfig,
    disks: &[DiskSpec],
    log_file: &Path,
    embed: Option<u64>,
) -> Vec<String> {
    let adv = &config.advanced;
    let mut args = Vec::new();

    opt(
        &mut args,
        "-machine",
        adv.machine.as_deref().unwrap_or(DEFAULT_MACHINE),
    );
    if config.enable_kvm {
        args.push("-enable-kvm".to_owned());
        if config.nested_virt {
            opt(&mut args, "-cpu", "host");
        }
    }
    opt(&mut args, "-smp", config.cpu_cores.to_string());
    opt(&mut args, "-m", config.memory_mib.to_string());

    for d in disks {
        let file = escape_opt(&d.path.to_string_lossy());
        opt(
            &mut args,
            "-drive",
            format!("file={file},format={},if=virtio", d.format),
        );
    }
    if let Some(iso) = &config.iso_path {
        opt(&mut args, "-cdrom", iso.to_string_lossy());
    }
    opt(&mut args, "-boot", config.boot_order.as_str());

    match config.graphics {
        Graphics::None => args.push("-nographic".to_owned()),
        Graphics::Sdl => match embed.filter(|_| config.display_embed) {
            Some(id) => opt(&mut args, "-display", format!("sdl,window-id={id}")),
            None => opt(&mut args, "-display", "sdl"),
        },
        Graphics::Gtk => opt(&mut args, "-display", "gtk"),
        Graphics::Vnc => {
            let display = adv.vnc_port.map_or(0, |p| p.saturating_sub(ports::VNC_BASE));
            opt(&mut args, "-vnc", format!("127.0.0.1:{display}"));
        }
    }

    match config.network_mode {
        NetworkMode::User => {
            opt(&mut args, "-netdev", "user,id=net0");
            opt(&mut args, "-device", NIC);
        }
        NetworkMode::Bridge => {
            let tap = adv.tap_name.as_deref().unwrap_or(DEFAULT_TAP);
            opt(
                &mut args,
                "-netdev",
                format!("tap,id=net0,ifname={tap},script=no,downscript=no"),
            );
            opt(&mut args, "-device", NIC);
        }
        NetworkMode::HostOnly => {
            opt(&mut args, "-netdev", "user,id=net0,restrict=on");
            opt(&mut args, "-device", NIC);
        }
        NetworkMode::None => opt(&mut args, "-net", "none"),
    }

    if let Some(port) = adv.control_port {
        opt(
            &mut args,
            "-qmp",
            format!("tcp:127.0.0.1:{port},server=on,wait=off"),
        );
    }
    if config.efi
        && let Some(fw) = &adv.firmware
    {
        opt(&mut args, "-bios", fw.to_string_lossy());
    }
    args.extend(config.extra_args.split_whitespace().map(str::to_owned));
    opt(&mut args, "-D", log_file.to_string_lossy());
    args
}

/// Appends a flag and its value.
fn opt(args: &mut Vec<String>, flag: &str, value: impl Into<String>) {
    args.push(flag.to_owned());
    args.push(value.into());
}

/// Doubles commas so a value survives QEMU's `key=value,...` option syntax.
fn escape_opt(value: &str) -> String {
    value.replace(',', ",,")
}
