//! Portable VM bundles: gzip-compressed tar archives.
//!
//! ```text
//! {name}/config.json
//! {name}/disks/{file}      one per registered disk
//! {name}/iso/{file}        install media, only when requested
//! ```
//!
//! Import checks every entry before anything is written: paths must be
//! relative, made of normal components, and share one VM-named root, and
//! entries must be regular files or directories.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Component, Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::{info, warn};

use crate::config::{ConfigStore, VmConfig};
use crate::disk::DiskManager;
use crate::layout::validate_name;
use crate::{Error, Result};

/// File name suffix of bundles.
pub const BUNDLE_EXT: &str = "tar.gz";

/// Writes and reads VM bundles for one store.
#[derive(Debug, Clone)]
pub struct BundleCodec {
    /// Source of documents and destination of imports.
    store: ConfigStore,
    /// Resolves disk files of previously imported VMs.
    disks: DiskManager,
}

impl BundleCodec {
    /// Creates a codec.
    pub const fn new(store: ConfigStore, disks: DiskManager) -> Self {
        Self { store, disks }
    }

    /// Default bundle path for a VM: `{home}/exports/{name}.tar.gz`.
    pub fn default_path(&self, name: &str) -> PathBuf {
        self.store
            .layout()
            .exports_dir()
            .join(format!("{name}.{BUNDLE_EXT}"))
    }

    /// Writes the VM's stored document and every registered disk to `dest`.
    ///
    /// Install media is included only when `include_iso` is set. A partial
    /// archive is removed on failure.
    pub fn export(&self, config: &VmConfig, dest: &Path, include_iso: bool) -> Result<PathBuf> {
        if let Some(dir) = dest.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let result = self.write_archive(config, dest, include_iso);
        if result.is_err() {
            let _ = fs::remove_file(dest);
        }
        result?;
        info!(vm = %config.name, bundle = %dest.display(), "exported VM");
        Ok(dest.to_path_buf())
    }

    /// Streams the archive to `dest`.
    fn write_archive(&self, config: &VmConfig, dest: &Path, include_iso: bool) -> Result<()> {
        let name = &config.name;
        let file = BufWriter::new(File::create(dest)?);
        let mut tar = tar::Builder::new(GzEncoder::new(file, Compression::default()));

        tar.append_path_with_name(self.store.config_path(name), format!("{name}/config.json"))?;
        for disk in self.disks.launch_disks(config) {
            let file_name = entry_name(&disk.path)?;
            tar.append_path_with_name(&disk.path, format!("{name}/disks/{file_name}"))?;
        }
        if include_iso {
            match self.disks.launch_iso(config) {
                Some(iso) if iso.is_file() => {
                    let file_name = entry_name(&iso)?;
                    tar.append_path_with_name(&iso, format!("{name}/iso/{file_name}"))?;
                }
                Some(iso) => warn!(vm = %name, iso = %iso.display(), "install media missing, not bundled"),
                None => {}
            }
        }

        tar.into_inner()?.finish()?.into_inner().map_err(io::IntoInnerError::into_error)?;
        Ok(())
    }

    /// Extracts a bundle into the store and returns the VM name.
    ///
    /// Fails with [`Error::EmptyBundle`] for an archive without entries,
    /// [`Error::UnsafeBundleEntry`] for an entry that would land outside
    /// the VM directory, and [`Error::AlreadyExists`] when the VM is
    /// already present. A failed extraction leaves no VM directory behind.
    pub fn import(&self, bundle: &Path) -> Result<String> {
        let name = inspect(open(bundle)?, bundle)?;
        validate_name(&name)?;
        if self.store.vm_dir(&name).exists() {
            return Err(Error::AlreadyExists(name));
        }

        let vms_dir = self.store.layout().vms_dir();
        fs::create_dir_all(&vms_dir)?;
        let mut archive = tar::Archive::new(open(bundle)?);
        archive.set_overwrite(false);
        if let Err(e) = archive.unpack(&vms_dir) {
            let _ = fs::remove_dir_all(self.store.vm_dir(&name));
            return Err(e.into());
        }
        info!(vm = %name, bundle = %bundle.display(), "imported VM");
        Ok(name)
    }
}

/// Opens a gzip stream over `path`.
fn open(path: &Path) -> Result<GzDecoder<BufReader<File>>> {
    Ok(GzDecoder::new(BufReader::new(File::open(path)?)))
}

/// Validates every entry and returns the common root directory name.
fn inspect(reader: impl Read, bundle: &Path) -> Result<String> {
    let mut archive = tar::Archive::new(reader);
    let mut root: Option<String> = None;

    for entry in archive.entries()? {
        let entry = entry?;
        let path = entry.path()?.into_owned();
        let kind = entry.header().entry_type();
        if !(kind.is_file() || kind.is_dir() || kind.is_gnu_sparse()) {
            return Err(Error::UnsafeBundleEntry(path));
        }

        let Some(first) = root_of(&path) else {
            return Err(Error::UnsafeBundleEntry(path));
        };
        match &root {
            None => root = Some(first),
            Some(r) if *r == first => {}
            Some(_) => return Err(Error::UnsafeBundleEntry(path)),
        }
    }

    root.ok_or_else(|| Error::EmptyBundle(bundle.to_path_buf()))
}

/// First component of a relative path made only of normal components.
fn root_of(path: &Path) -> Option<String> {
    let mut first = None;
    for c in path.components() {
        match c {
            Component::Normal(p) if first.is_none() => first = Some(p.to_str()?.to_owned()),
            Component::Normal(_) | Component::CurDir => {}
            _ => return None,
        }
    }
    first
}

/// File name of `path` as an archive entry component.
fn entry_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_owned)
        .ok_or_else(|| Error::InvalidName(path.display().to_string()))
}
