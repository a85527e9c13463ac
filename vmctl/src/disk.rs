//! Virtual disk provisioning.
//!
//! Raw disks are sparse files whose apparent size is exactly
//! `size_gib × 2^30` bytes. Other formats are created by `qemu-img`; when
//! the tool is unavailable creation fails instead of falling back to raw.
//!
//! Creating a disk and registering it in the VM's config are one step:
//! a failed creation never leaves a [`DiskSpec`] behind.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::config::{ConfigStore, DiskFormat, DiskSpec, VmConfig};
use crate::layout::{ImageTool, validate_name};
use crate::{Error, Result};

/// Bytes per GiB.
const GIB: u64 = 1 << 30;

/// Allocates disk images inside a VM's `disks/` directory.
#[derive(Debug, Clone)]
pub struct DiskManager {
    /// Config persistence, used to register new disks.
    store: ConfigStore,
    /// Image tool for non-raw formats.
    tool: ImageTool,
}

impl DiskManager {
    /// Creates a manager over `store`.
    pub const fn new(store: ConfigStore, tool: ImageTool) -> Self {
        Self { store, tool }
    }

    /// File name of a VM's self-healed primary disk.
    pub fn primary_name(config: &VmConfig) -> String {
        format!("{}-disk0.{}", config.name, config.disk_format)
    }

    /// Creates `name` in the VM's disk directory, appends it to
    /// `config.disks` and saves the config.
    pub fn create_disk(
        &self,
        config: &mut VmConfig,
        name: &str,
        size_gib: u64,
        format: DiskFormat,
    ) -> Result<DiskSpec> {
        validate_name(name)?;
        let dir = self.store.layout().disks_dir(&config.name);
        fs::create_dir_all(&dir)?;
        let path = std::path::absolute(dir.join(name))?;
        if path.exists() {
            return Err(Error::DiskExists(path));
        }

        if format == DiskFormat::Raw {
            let bytes = size_gib.checked_mul(GIB).ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "disk size overflows u64")
            })?;
            create_sparse(&path, bytes)?;
        } else {
            let tool = self
                .tool
                .locate()
                .ok_or(Error::UnsupportedFormat(format))?;
            run_image_tool(&tool, &path, size_gib, format)?;
        }
        debug!(vm = %config.name, disk = %path.display(), size_gib, %format, "created disk");

        let spec = DiskSpec::new(path, format);
        config.disks.push(spec.clone());
        self.store.save(config)?;
        Ok(spec)
    }

    /// Gives a VM with no disks exactly one primary disk.
    ///
    /// No-op when `config.disks` is non-empty. An existing primary disk
    /// file is registered as-is instead of being recreated.
    pub fn ensure_primary_disk(&self, config: &mut VmConfig) -> Result<Option<DiskSpec>> {
        if !config.disks.is_empty() {
            return Ok(None);
        }
        let name = Self::primary_name(config);
        let existing =
            std::path::absolute(self.store.layout().disks_dir(&config.name).join(&name))?;
        if existing.is_file() {
            let spec = DiskSpec::new(existing, config.disk_format);
            config.disks.push(spec.clone());
            self.store.save(config)?;
            return Ok(Some(spec));
        }
        let (size, format) = (config.disk_gib, config.disk_format);
        self.create_disk(config, &name, size, format).map(Some)
    }

    /// Disks as they should be attached on this host.
    ///
    /// A registered path outside the VM's own `disks/` directory resolves
    /// to the file of the same name inside it, when that file exists. This
    /// is the case for VMs imported from a bundle, even while the source
    /// VM's image is still present. The stored config is left unchanged.
    pub fn launch_disks(&self, config: &VmConfig) -> Vec<DiskSpec> {
        let dir = self.store.layout().disks_dir(&config.name);
        config
            .disks
            .iter()
            .map(|d| match relocated(&dir, &d.path) {
                Some(local) => {
                    debug!(vm = %config.name, from = %d.path.display(), to = %local.display(), "using local disk copy");
                    DiskSpec::new(local, d.format)
                }
                None => d.clone(),
            })
            .collect()
    }

    /// Install media as it should be attached on this host.
    ///
    /// Resolves against the VM's `iso/` directory by the same rule as
    /// [`launch_disks`](Self::launch_disks).
    pub fn launch_iso(&self, config: &VmConfig) -> Option<PathBuf> {
        let iso = config.iso_path.as_ref()?;
        let dir = self.store.layout().iso_dir(&config.name);
        Some(relocated(&dir, iso).map_or_else(
            || iso.clone(),
            |local| {
                debug!(vm = %config.name, from = %iso.display(), to = %local.display(), "using local install media");
                local
            },
        ))
    }
}

/// The copy of `path` inside `own_dir`, when `path` lives elsewhere and
/// that copy exists.
fn relocated(own_dir: &Path, path: &Path) -> Option<PathBuf> {
    let own_dir = std::path::absolute(own_dir).unwrap_or_else(|_| own_dir.to_path_buf());
    if path.starts_with(&own_dir) {
        return None;
    }
    let local = own_dir.join(path.file_name()?);
    local.is_file().then_some(local)
}

/// Creates a sparse file of exactly `bytes` apparent bytes.
fn create_sparse(path: &Path, bytes: u64) -> Result<()> {
    let file = OpenOptions::new().write(true).create_new(true).open(path)?;
    if let Err(e) = file.set_len(bytes) {
        drop(file);
        let _ = fs::remove_file(path);
        return Err(e.into());
    }
    Ok(())
}

/// Runs `qemu-img create -f <fmt> <path> <gib>G`.
fn run_image_tool(tool: &Path, path: &Path, size_gib: u64, format: DiskFormat) -> Result<()> {
    let output = Command::new(tool)
        .arg("create")
        .arg("-f")
        .arg(format.as_str())
        .arg(path)
        .arg(format!("{size_gib}G"))
        .output()?;
    if output.status.success() && path.is_file() {
        return Ok(());
    }
    let _ = fs::remove_file(path);
    Err(Error::DiskTool {
        status: output.status,
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
    })
}
