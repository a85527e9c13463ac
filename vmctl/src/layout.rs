//! On-disk layout of the VM store and host tool discovery.
//!
//! ```text
//! {home}/
//!   vms/
//!     {name}/
//!       config.json
//!       disks/        registered disk images
//!       logs/         hypervisor debug log ({name}.log)
//!       iso/          install media (imported bundles only)
//!   exports/          default bundle destination
//! ```

use std::path::{Component, Path, PathBuf};

use crate::{Error, Result};

/// Environment variable overriding the store home directory.
pub const HOME_ENV: &str = "VMCTL_HOME";

/// Environment variable overriding the hypervisor binary.
pub const HYPERVISOR_ENV: &str = "VMCTL_HYPERVISOR";

/// Executable names searched on `PATH` when no override is given.
pub const HYPERVISOR_CANDIDATES: &[&str] = &["qemu-system-x86_64", "qemu-system-x86_64.exe"];

/// Name of the disk image tool.
pub const IMAGE_TOOL: &str = "qemu-img";

/// Resolved store directories.
///
/// Constructed explicitly and passed to every component, so tests can
/// point a whole store at a temporary directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    /// Store home.
    home: PathBuf,
}

impl StoreLayout {
    /// Uses `home` as the store root.
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// Resolves the home from `$VMCTL_HOME`, falling back to
    /// `{data_local_dir}/vmctl`.
    pub fn from_env() -> Self {
        let home = std::env::var_os(HOME_ENV).map_or_else(
            || {
                dirs::data_local_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("vmctl")
            },
            PathBuf::from,
        );
        Self { home }
    }

    /// Store home directory.
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Directory holding one subdirectory per VM.
    pub fn vms_dir(&self) -> PathBuf {
        self.home.join("vms")
    }

    /// Default directory for exported bundles.
    pub fn exports_dir(&self) -> PathBuf {
        self.home.join("exports")
    }

    /// Directory of one VM.
    pub fn vm_dir(&self, name: &str) -> PathBuf {
        self.vms_dir().join(name)
    }

    /// Path of a VM's config document.
    pub fn config_path(&self, name: &str) -> PathBuf {
        self.vm_dir(name).join("config.json")
    }

    /// Disk image directory of a VM.
    pub fn disks_dir(&self, name: &str) -> PathBuf {
        self.vm_dir(name).join("disks")
    }

    /// Log directory of a VM.
    pub fn logs_dir(&self, name: &str) -> PathBuf {
        self.vm_dir(name).join("logs")
    }

    /// Hypervisor debug log of a VM.
    pub fn log_file(&self, name: &str) -> PathBuf {
        self.logs_dir(name).join(format!("{name}.log"))
    }

    /// Install media directory of a VM.
    pub fn iso_dir(&self, name: &str) -> PathBuf {
        self.vm_dir(name).join("iso")
    }
}

/// Rejects names that are not a single normal path component.
pub fn validate_name(name: &str) -> Result<()> {
    let mut parts = Path::new(name).components();
    match (parts.next(), parts.next()) {
        (Some(Component::Normal(_)), None) if !name.contains(['/', '\\']) => Ok(()),
        _ => Err(Error::InvalidName(name.to_owned())),
    }
}

/// Where to find the hypervisor binary.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum Hypervisor {
    /// Search [`HYPERVISOR_CANDIDATES`] on `PATH`.
    #[default]
    Search,
    /// Use this exact path.
    Path(PathBuf),
}

impl Hypervisor {
    /// `$VMCTL_HYPERVISOR` if set, otherwise [`Hypervisor::Search`].
    pub fn from_env() -> Self {
        std::env::var_os(HYPERVISOR_ENV).map_or(Self::Search, |p| Self::Path(p.into()))
    }

    /// Resolves the binary, failing with [`Error::HypervisorNotFound`].
    pub fn locate(&self) -> Result<PathBuf> {
        match self {
            Self::Search => HYPERVISOR_CANDIDATES
                .iter()
                .find_map(|name| which::which(name).ok())
                .ok_or_else(|| Error::HypervisorNotFound {
                    candidates: HYPERVISOR_CANDIDATES.iter().map(|s| (*s).to_owned()).collect(),
                }),
            Self::Path(p) if p.is_file() => Ok(p.clone()),
            Self::Path(p) => Err(Error::HypervisorNotFound {
                candidates: vec![p.display().to_string()],
            }),
        }
    }
}

/// Where to find the disk image tool.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum ImageTool {
    /// Search for `qemu-img` on `PATH`.
    #[default]
    Auto,
    /// Use this exact path.
    Path(PathBuf),
    /// Never run an image tool; only raw disks can be created.
    Disabled,
}

impl ImageTool {
    /// Resolves the tool, or `None` when unavailable.
    pub fn locate(&self) -> Option<PathBuf> {
        match self {
            Self::Auto => which::which(IMAGE_TOOL).ok(),
            Self::Path(p) => p.is_file().then(|| p.clone()),
            Self::Disabled => None,
        }
    }
}
