//! Error types for vmctl operations.

use std::path::PathBuf;
use std::process::ExitStatus;

use crate::config::DiskFormat;

/// Alias for `Result<T, vmctl::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by vmctl operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A stored VM document could not be parsed.
    #[error("corrupt config {}: {source}", path.display())]
    ConfigCorrupt {
        /// Path of the offending `config.json`.
        path: PathBuf,
        /// Underlying parse error.
        source: serde_json::Error,
    },

    /// No hypervisor binary was found.
    #[error("hypervisor not found (looked for {})", candidates.join(", "))]
    HypervisorNotFound {
        /// Names or paths that were tried.
        candidates: Vec<String>,
    },

    /// A non-raw disk was requested but no image tool is available.
    #[error("cannot create {0} disk: qemu-img is not available")]
    UnsupportedFormat(DiskFormat),

    /// The image tool ran and reported failure.
    #[error("qemu-img failed ({status}): {stderr}")]
    DiskTool {
        /// Exit status of the tool.
        status: ExitStatus,
        /// Captured standard error.
        stderr: String,
    },

    /// A disk file with this name already exists.
    #[error("disk image already exists: {}", .0.display())]
    DiskExists(PathBuf),

    /// The VM already has a live hypervisor process.
    #[error("VM {0} is already running")]
    AlreadyRunning(String),

    /// A VM with this name already exists in the store.
    #[error("VM {0} already exists")]
    AlreadyExists(String),

    /// No VM with this name exists in the store.
    #[error("no VM named {0}")]
    NotFound(String),

    /// A VM or disk name is not a single plain path component.
    #[error("invalid name {0:?}")]
    InvalidName(String),

    /// The bundle archive contains no entries.
    #[error("bundle {} is empty", .0.display())]
    EmptyBundle(PathBuf),

    /// A bundle entry escapes the VM directory or is not a plain file/directory.
    #[error("refusing bundle entry {}", .0.display())]
    UnsafeBundleEntry(PathBuf),

    /// No free loopback port in the requested range.
    #[error("no free loopback port in {0}..={1}")]
    PortAllocation(u16, u16),

    /// Control protocol failure, including [`vmctl_qmp::Error::NotConnected`].
    #[error(transparent)]
    Control(#[from] vmctl_qmp::Error),

    /// Filesystem or process I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON encoding error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns `true` for [`vmctl_qmp::Error::NotConnected`].
    pub const fn is_not_connected(&self) -> bool {
        matches!(self, Self::Control(vmctl_qmp::Error::NotConnected))
    }
}
