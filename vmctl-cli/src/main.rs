//! CLI for the vmctl QEMU control plane.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod run;
mod vm;

use std::io::stdout;
use std::path::PathBuf;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use vmctl::{Hypervisor, Runtime, StoreLayout};

/// Environment variable holding the log filter.
const LOG_ENV: &str = "VMCTL_LOG";

#[derive(Parser)]
#[command(name = "vmctl", version, about = "Manage QEMU virtual machines")]
struct Cli {
    #[command(flatten)]
    global: Global,

    #[command(subcommand)]
    command: Command,
}

/// Options shared by every subcommand.
#[derive(clap::Args, Clone)]
pub struct Global {
    /// Store directory (defaults to $VMCTL_HOME, then the platform data directory).
    #[arg(long, global = true, value_name = "DIR")]
    home: Option<PathBuf>,

    /// Hypervisor binary (defaults to $VMCTL_HYPERVISOR, then a PATH search).
    #[arg(long, global = true, value_name = "PATH")]
    hypervisor: Option<PathBuf>,

    /// Log at debug level unless $VMCTL_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,
}

impl Global {
    /// Opens the store with the hypervisor override applied.
    pub fn runtime(&self) -> Result<Runtime> {
        let layout = self
            .home
            .clone()
            .map_or_else(StoreLayout::from_env, StoreLayout::new);
        let hypervisor = self
            .hypervisor
            .clone()
            .map_or_else(Hypervisor::from_env, Hypervisor::Path);
        Ok(Runtime::open(layout)?.with_hypervisor(hypervisor))
    }
}

#[derive(Subcommand)]
enum Command {
    /// Create a new VM.
    Create(vm::CreateArgs),
    /// Change settings of an existing VM.
    Set(vm::SetArgs),
    /// List VMs.
    #[command(alias = "list")]
    Ls(vm::LsArgs),
    /// Print the config document of one or more VMs.
    Inspect {
        /// VM names.
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Delete one or more VMs and their files.
    Rm {
        /// VM names.
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Manage disk images.
    #[command(subcommand)]
    Disk(vm::DiskCommand),
    /// Print the hypervisor command line for a VM.
    Cmdline {
        /// VM name.
        name: String,
    },
    /// Launch a VM in the foreground and stream its output.
    Run(run::RunArgs),
    /// Launch every VM flagged for autostart.
    Up,
    /// Send a raw QMP command to a running VM.
    Qmp {
        /// VM name.
        name: String,
        /// Command name or JSON command object.
        command: String,
    },
    /// Ask running VMs to power down.
    Stop {
        /// VM names.
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Pause running VMs.
    Pause {
        /// VM names.
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Resume paused VMs.
    Resume {
        /// VM names.
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Hard-reset running VMs.
    Reset {
        /// VM names.
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Save an internal snapshot of a running VM.
    Snapshot {
        /// VM name.
        name: String,
        /// Snapshot tag.
        tag: String,
    },
    /// Report the guest run state of a running VM.
    Status {
        /// VM name.
        name: String,
    },
    /// Pack a VM into a portable bundle.
    Export(vm::ExportArgs),
    /// Unpack a bundle into the store.
    Import {
        /// Bundle file (.tar.gz).
        bundle: PathBuf,
    },
    /// Generate shell completion scripts.
    Completion {
        /// Target shell.
        shell: clap_complete::Shell,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.global.verbose);
    if let Err(e) = dispatch(cli).await {
        eprintln!("vmctl: {e:#}");
        std::process::exit(1);
    }
}

/// Installs the stderr subscriber. `$VMCTL_LOG` wins over `--verbose`.
fn init_logging(verbose: bool) {
    let fallback = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn dispatch(cli: Cli) -> Result<()> {
    let global = cli.global;
    match cli.command {
        Command::Create(args) => args.run(&global),
        Command::Set(args) => args.run(&global),
        Command::Ls(args) => args.run(&global),
        Command::Inspect { names } => vm::inspect(&global, &names),
        Command::Rm { names } => vm::remove(&global, &names),
        Command::Disk(cmd) => cmd.run(&global),
        Command::Cmdline { name } => vm::cmdline(&global, &name),
        Command::Run(args) => args.run(&global).await,
        Command::Up => run::up(&global).await,
        Command::Qmp { name, command } => vm::qmp(&global, &name, &command).await,
        Command::Stop { names } => vm::control_all(&global, &names, vm::Verb::Stop).await,
        Command::Pause { names } => vm::control_all(&global, &names, vm::Verb::Pause).await,
        Command::Resume { names } => vm::control_all(&global, &names, vm::Verb::Resume).await,
        Command::Reset { names } => vm::control_all(&global, &names, vm::Verb::Reset).await,
        Command::Snapshot { name, tag } => vm::snapshot(&global, &name, &tag).await,
        Command::Status { name } => vm::status(&global, &name).await,
        Command::Export(args) => args.run(&global),
        Command::Import { bundle } => vm::import(&global, &bundle),
        Command::Completion { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "vmctl", &mut stdout());
            Ok(())
        }
    }
}

/// Formats a byte count with binary units.
#[allow(clippy::cast_precision_loss)]
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}
