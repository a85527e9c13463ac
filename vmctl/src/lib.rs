//! Control plane for QEMU virtual machines.
//!
//! `vmctl` keeps one JSON document per VM, provisions its disk images,
//! turns the document into a `qemu-system-x86_64` command line, supervises
//! the resulting process, and drives it over QMP (see [`vmctl_qmp`]). VMs
//! can be moved between hosts as gzip-compressed tar bundles.
//!
//! # Quick start
//!
//! ```no_run
//! use vmctl::{Runtime, StoreLayout, VmEvent};
//!
//! # async fn demo() -> vmctl::Result<()> {
//! let rt = Runtime::open(StoreLayout::from_env())?;
//! let mut vm = rt.vm("web01")?;
//! vm.config_mut().memory_mib = 2048;
//! vm.save()?;
//!
//! let mut events = vm.start(None)?;
//! while let Some(ev) = events.recv().await {
//!     if let VmEvent::Exited { code } = ev {
//!         println!("exited with {code:?}");
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod bundle;
mod command;
mod config;
mod disk;
mod error;
mod layout;
mod ports;
mod runtime;
mod supervisor;
mod vm;

pub use bundle::{BUNDLE_EXT, BundleCodec};
pub use command::{CommandBuilder, DEFAULT_MACHINE, DEFAULT_TAP, LaunchCommand, render};
pub use config::{Advanced, ConfigStore, DiskFormat, DiskSpec, Graphics, NetworkMode, VmConfig};
pub use disk::DiskManager;
pub use error::{Error, Result};
pub use layout::{
    HOME_ENV, HYPERVISOR_CANDIDATES, HYPERVISOR_ENV, Hypervisor, IMAGE_TOOL, ImageTool,
    StoreLayout, validate_name,
};
pub use runtime::Runtime;
pub use supervisor::{Process, VmEvent};
pub use vm::{Phase, RuntimeState, Vm};
pub use vmctl_qmp::{self as qmp, ConnState, ConnectPolicy};
