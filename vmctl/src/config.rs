//! Persisted VM configuration and the store that loads and saves it.
//!
//! Each VM keeps one `config.json`. Reads fill defaults for any key an
//! older document lacks, and keys this version does not know are kept
//! in [`VmConfig::extra`] so a load/save cycle never strips them.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::{fs, io};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::layout::{StoreLayout, validate_name};
use crate::{Error, Result};

/// Virtual disk image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum DiskFormat {
    /// Flat sparse file.
    #[default]
    Raw,
    /// QEMU copy-on-write v2.
    Qcow2,
    /// QEMU enhanced disk.
    Qed,
    /// VMware.
    Vmdk,
    /// VirtualBox.
    Vdi,
    /// Hyper-V.
    Vhdx,
}

impl DiskFormat {
    /// Name as passed to `format=` and `qemu-img -f`, also the file extension.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Qcow2 => "qcow2",
            Self::Qed => "qed",
            Self::Vmdk => "vmdk",
            Self::Vdi => "vdi",
            Self::Vhdx => "vhdx",
        }
    }
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiskFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Ok(Self::Raw),
            "qcow2" => Ok(Self::Qcow2),
            "qed" => Ok(Self::Qed),
            "vmdk" => Ok(Self::Vmdk),
            "vdi" => Ok(Self::Vdi),
            "vhdx" => Ok(Self::Vhdx),
            _ => Err(format!("unknown disk format: {s}")),
        }
    }
}

/// Display backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum Graphics {
    /// SDL window, optionally embedded into a host surface.
    #[default]
    Sdl,
    /// GTK window.
    Gtk,
    /// VNC server on loopback.
    Vnc,
    /// Headless.
    None,
}

impl fmt::Display for Graphics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sdl => "sdl",
            Self::Gtk => "gtk",
            Self::Vnc => "vnc",
            Self::None => "none",
        })
    }
}

impl FromStr for Graphics {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sdl" => Ok(Self::Sdl),
            "gtk" => Ok(Self::Gtk),
            "vnc" => Ok(Self::Vnc),
            "none" => Ok(Self::None),
            _ => Err(format!("unknown graphics backend: {s}")),
        }
    }
}

/// Guest network attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum NetworkMode {
    /// User-mode NAT.
    #[default]
    User,
    /// Tap interface named by [`Advanced::tap_name`].
    Bridge,
    /// User-mode NAT with no route out of the host.
    HostOnly,
    /// No network device.
    None,
}

impl NetworkMode {
    /// Stored name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Bridge => "bridge",
            Self::HostOnly => "host-only",
            Self::None => "none",
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkMode {
    type Err = String;

    /// Any label starting with `user` selects user-mode NAT, so
    /// descriptive spellings such as `"user (NAT)"` are accepted.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s.starts_with("user") {
            return Ok(Self::User);
        }
        match s.as_str() {
            "bridge" => Ok(Self::Bridge),
            "host-only" | "hostonly" => Ok(Self::HostOnly),
            "none" => Ok(Self::None),
            _ => Err(format!("unknown network mode: {s}")),
        }
    }
}

impl Serialize for NetworkMode {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for NetworkMode {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A registered disk image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct DiskSpec {
    /// Absolute path of the image file.
    pub path: PathBuf,
    /// Image format.
    pub format: DiskFormat,
}

impl DiskSpec {
    /// Creates a disk spec.
    pub fn new(path: impl Into<PathBuf>, format: DiskFormat) -> Self {
        Self {
            path: path.into(),
            format,
        }
    }
}

/// Host-allocated values and overrides.
///
/// Key names match the stored document (`qmp_port`, `ovmf_code`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct Advanced {
    /// Loopback port of the control socket, allocated once.
    #[serde(rename = "qmp_port", skip_serializing_if = "Option::is_none")]
    pub control_port: Option<u16>,
    /// Loopback VNC port (5900 + display), allocated once.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vnc_port: Option<u16>,
    /// UEFI firmware image.
    #[serde(rename = "ovmf_code", skip_serializing_if = "Option::is_none")]
    pub firmware: Option<PathBuf>,
    /// Host tap interface for bridged networking.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tap_name: Option<String>,
    /// Machine type; `q35` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine: Option<String>,
    /// Unrecognized keys, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The persisted description of one VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct VmConfig {
    /// VM name, also its directory name.
    pub name: String,
    /// Creation time (RFC 3339).
    pub created: Option<String>,
    /// Version of the tool that created the document.
    pub version: String,
    /// Virtual CPUs.
    pub cpu_cores: u32,
    /// Guest memory in MiB.
    pub memory_mib: u32,
    /// Size of the self-healed primary disk in GiB.
    pub disk_gib: u64,
    /// Format of the self-healed primary disk.
    pub disk_format: DiskFormat,
    /// Boot with UEFI firmware when [`Advanced::firmware`] is set.
    pub efi: bool,
    /// Value of `-boot order=`-style string, passed verbatim.
    pub boot_order: String,
    /// Install media.
    pub iso_path: Option<PathBuf>,
    /// Extra hypervisor arguments, split on whitespace.
    pub extra_args: String,
    /// Guest networking.
    pub network_mode: NetworkMode,
    /// Hardware acceleration.
    pub enable_kvm: bool,
    /// Display backend.
    pub graphics: Graphics,
    /// Embed the SDL window into a host surface when one is supplied.
    pub display_embed: bool,
    /// Host-allocated values.
    pub advanced: Advanced,
    /// Registered disks, in attachment order.
    pub disks: Vec<DiskSpec>,
    /// Expose host CPU virtualization extensions (requires `enable_kvm`).
    pub nested_virt: bool,
    /// Start with `vmctl up`.
    pub autostart: bool,
    /// Unrecognized top-level keys, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            created: None,
            version: env!("CARGO_PKG_VERSION").to_owned(),
            cpu_cores: 2,
            memory_mib: 4096,
            disk_gib: 32,
            disk_format: DiskFormat::Raw,
            efi: true,
            boot_order: "cdrom,hd,menu".to_owned(),
            iso_path: None,
            extra_args: String::new(),
            network_mode: NetworkMode::User,
            enable_kvm: false,
            graphics: Graphics::Sdl,
            display_embed: true,
            advanced: Advanced::default(),
            disks: Vec::new(),
            nested_virt: false,
            autostart: false,
            extra: Map::new(),
        }
    }
}

impl VmConfig {
    /// A fresh document for `name`, stamped with the current time.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            created: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
            ..Self::default()
        }
    }
}

/// Loads and saves VM documents under a [`StoreLayout`].
#[derive(Debug, Clone)]
pub struct ConfigStore {
    /// Store directories.
    layout: StoreLayout,
}

impl ConfigStore {
    /// Creates a store over `layout`.
    pub const fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    /// Store directories.
    pub const fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Loads a VM, creating its directories and a default document on
    /// first access.
    ///
    /// A document without a `disks` key is rewritten with an empty list.
    /// An unparseable document fails with [`Error::ConfigCorrupt`].
    pub fn load(&self, name: &str) -> Result<VmConfig> {
        validate_name(name)?;
        fs::create_dir_all(self.layout.disks_dir(name))?;
        fs::create_dir_all(self.layout.logs_dir(name))?;

        let path = self.layout.config_path(name);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let config = VmConfig::new(name);
                self.save(&config)?;
                debug!(vm = name, "initialized default config");
                return Ok(config);
            }
            Err(e) => return Err(e.into()),
        };

        let corrupt = |source| Error::ConfigCorrupt {
            path: path.clone(),
            source,
        };
        let value: Value = serde_json::from_slice(&bytes).map_err(corrupt)?;
        let heal = value.get("disks").is_none();
        let mut config: VmConfig = serde_json::from_value(value).map_err(corrupt)?;
        if config.name != name {
            config.name = name.to_owned();
        }
        if heal {
            self.save(&config)?;
        }
        Ok(config)
    }

    /// Overwrites the VM's document.
    ///
    /// Writes a sibling temporary file and renames it into place.
    pub fn save(&self, config: &VmConfig) -> Result<()> {
        validate_name(&config.name)?;
        let path = self.layout.config_path(&config.name);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut json = serde_json::to_vec_pretty(config)?;
        json.push(b'\n');
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Returns `true` if a document exists for `name`.
    pub fn exists(&self, name: &str) -> bool {
        validate_name(name).is_ok() && self.layout.config_path(name).is_file()
    }

    /// Names of all VMs with a document, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let dir = self.layout.vms_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str()
                && entry.path().join("config.json").is_file()
            {
                names.push(name.to_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Loads every VM, skipping corrupt documents with a warning.
    pub fn load_all(&self) -> Result<Vec<VmConfig>> {
        let mut configs = Vec::new();
        for name in self.list()? {
            match self.load(&name) {
                Ok(c) => configs.push(c),
                Err(e @ Error::ConfigCorrupt { .. }) => warn!(vm = %name, error = %e, "skipping VM"),
                Err(e) => return Err(e),
            }
        }
        Ok(configs)
    }

    /// Deletes a VM directory with everything in it.
    pub fn remove(&self, name: &str) -> Result<()> {
        if !self.exists(name) {
            return Err(Error::NotFound(name.to_owned()));
        }
        fs::remove_dir_all(self.layout.vm_dir(name))?;
        Ok(())
    }

    /// Path of a VM's document.
    pub fn config_path(&self, name: &str) -> PathBuf {
        self.layout.config_path(name)
    }

    /// Directory of a VM.
    pub fn vm_dir(&self, name: &str) -> PathBuf {
        self.layout.vm_dir(name)
    }
}
