//! Store-level VM management: create, list, remove, export, import.
//!
//! The [`Runtime`] owns a [`StoreLayout`] and wires up the per-VM
//! components. VMs live under `{home}/vms/{name}/`.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;
use vmctl_qmp::{Client, ConnectPolicy};

use crate::bundle::BundleCodec;
use crate::command::CommandBuilder;
use crate::config::{ConfigStore, VmConfig};
use crate::disk::DiskManager;
use crate::layout::{Hypervisor, ImageTool, StoreLayout, validate_name};
use crate::vm::Vm;
use crate::{Error, Result};

/// Manages the VMs of one store.
#[derive(Debug, Clone)]
pub struct Runtime {
    /// Store directories.
    layout: StoreLayout,
    /// Hypervisor lookup.
    hypervisor: Hypervisor,
    /// Disk image tool lookup.
    image_tool: ImageTool,
    /// Control connection timing for launched VMs.
    policy: ConnectPolicy,
}

impl Runtime {
    /// Opens (or creates) the store at `layout`.
    pub fn open(layout: StoreLayout) -> Result<Self> {
        fs::create_dir_all(layout.vms_dir())?;
        fs::create_dir_all(layout.exports_dir())?;
        Ok(Self {
            layout,
            hypervisor: Hypervisor::default(),
            image_tool: ImageTool::default(),
            policy: ConnectPolicy::default(),
        })
    }

    /// Overrides hypervisor lookup.
    #[must_use]
    pub fn with_hypervisor(mut self, hypervisor: Hypervisor) -> Self {
        self.hypervisor = hypervisor;
        self
    }

    /// Overrides disk image tool lookup.
    #[must_use]
    pub fn with_image_tool(mut self, tool: ImageTool) -> Self {
        self.image_tool = tool;
        self
    }

    /// Overrides control connection timing.
    #[must_use]
    pub const fn with_policy(mut self, policy: ConnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Store directories.
    pub const fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Config persistence for this store.
    pub fn store(&self) -> ConfigStore {
        ConfigStore::new(self.layout.clone())
    }

    /// Disk provisioning for this store.
    pub fn disks(&self) -> DiskManager {
        DiskManager::new(self.store(), self.image_tool.clone())
    }

    /// Command synthesis for this store.
    pub fn builder(&self) -> CommandBuilder {
        CommandBuilder::new(self.store(), self.disks(), self.hypervisor.clone())
    }

    /// Bundle export and import for this store.
    pub fn bundles(&self) -> BundleCodec {
        BundleCodec::new(self.store(), self.disks())
    }

    /// Creates a new VM with default settings.
    pub fn create(&self, name: &str) -> Result<Vm> {
        validate_name(name)?;
        if self.store().exists(name) {
            return Err(Error::AlreadyExists(name.to_owned()));
        }
        let vm = self.vm(name)?;
        info!(vm = name, "created VM");
        Ok(vm)
    }

    /// Loads a VM, initializing it with defaults on first access.
    pub fn vm(&self, name: &str) -> Result<Vm> {
        let config = self.store().load(name)?;
        Ok(self.wrap(config))
    }

    /// Loads an existing VM, failing with [`Error::NotFound`].
    pub fn get(&self, name: &str) -> Result<Vm> {
        if !self.store().exists(name) {
            return Err(Error::NotFound(name.to_owned()));
        }
        self.vm(name)
    }

    /// All readable VM configs, sorted by name. Corrupt ones are skipped.
    pub fn list(&self) -> Result<Vec<VmConfig>> {
        self.store().load_all()
    }

    /// Names of VMs flagged for autostart.
    pub fn autostart(&self) -> Result<Vec<String>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|c| c.autostart)
            .map(|c| c.name)
            .collect())
    }

    /// Deletes a VM and all of its files.
    pub fn remove(&self, name: &str) -> Result<()> {
        self.store().remove(name)?;
        info!(vm = name, "removed VM");
        Ok(())
    }

    /// Exports a VM to `dest`, or to `{home}/exports/{name}.tar.gz`.
    pub fn export(&self, name: &str, dest: Option<&Path>, include_iso: bool) -> Result<PathBuf> {
        let vm = self.get(name)?;
        let codec = self.bundles();
        let dest = dest.map_or_else(|| codec.default_path(name), Path::to_path_buf);
        codec.export(vm.config(), &dest, include_iso)
    }

    /// Imports a bundle and returns the new VM.
    pub fn import(&self, bundle: &Path) -> Result<Vm> {
        let name = self.bundles().import(bundle)?;
        self.vm(&name)
    }

    /// Connects to the control socket of a VM launched elsewhere.
    ///
    /// Fails with `NotConnected` if the VM never had a control port or
    /// nothing answers within the policy window.
    pub async fn control(&self, name: &str) -> Result<Client> {
        let vm = self.get(name)?;
        let port = vm
            .config()
            .advanced
            .control_port
            .ok_or(Error::Control(vmctl_qmp::Error::NotConnected))?;
        Ok(Client::connect(port, self.policy).await?)
    }

    /// Wraps a loaded config into a [`Vm`].
    fn wrap(&self, config: VmConfig) -> Vm {
        Vm::new(config, self.store(), self.disks(), self.builder(), self.policy)
    }
}
