//! The VM aggregate: one config plus at most one running instance.

use std::path::PathBuf;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};
use vmctl_qmp::{Client, Command, ConnState, ConnectPolicy, commands};

use crate::command::{CommandBuilder, LaunchCommand};
use crate::config::{ConfigStore, DiskFormat, DiskSpec, VmConfig};
use crate::disk::DiskManager;
use crate::supervisor::{Process, VmEvent};
use crate::{Error, Result};

/// Lifecycle phase of a VM as seen from this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Phase {
    /// No live hypervisor process.
    Stopped,
    /// Process alive; the control connection is still being established.
    Launching,
    /// Process alive and the control connection is ready.
    Running,
    /// Process alive but the control connection gave up or was lost.
    ///
    /// A connect or handshake still inside its retry window reads as
    /// [`Phase::Launching`]; this phase starts once the window expires
    /// without a handshake, or a ready connection drops.
    Unreachable,
    /// A stop or kill was requested and the process has not exited yet.
    Stopping,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Stopped => "stopped",
            Self::Launching => "launching",
            Self::Running => "running",
            Self::Unreachable => "unreachable",
            Self::Stopping => "stopping",
        })
    }
}

/// Per-launch state, never persisted.
#[derive(Debug)]
pub struct RuntimeState {
    /// The hypervisor process.
    process: Process,
    /// Control connection to the process.
    control: Client,
    /// Set once a stop or kill has been requested.
    stopping: bool,
}

impl RuntimeState {
    /// The hypervisor process.
    pub const fn process(&self) -> &Process {
        &self.process
    }

    /// The control connection.
    pub const fn control(&self) -> &Client {
        &self.control
    }
}

/// One VM: its config and, while launched, its runtime state.
///
/// A second [`start`](Self::start) while the process is alive fails with
/// [`Error::AlreadyRunning`] and spawns nothing.
#[derive(Debug)]
pub struct Vm {
    /// The persisted document.
    config: VmConfig,
    /// Persistence.
    store: ConfigStore,
    /// Disk provisioning.
    disks: DiskManager,
    /// Command synthesis.
    builder: CommandBuilder,
    /// Control connection timing.
    policy: ConnectPolicy,
    /// Present after the first launch.
    runtime: Option<RuntimeState>,
}

impl Vm {
    /// Wraps a loaded config.
    pub(crate) const fn new(
        config: VmConfig,
        store: ConfigStore,
        disks: DiskManager,
        builder: CommandBuilder,
        policy: ConnectPolicy,
    ) -> Self {
        Self {
            config,
            store,
            disks,
            builder,
            policy,
            runtime: None,
        }
    }

    /// VM name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The current config.
    pub const fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Mutable config; call [`save`](Self::save) to persist edits.
    pub fn config_mut(&mut self) -> &mut VmConfig {
        &mut self.config
    }

    /// Overwrites the stored document with the current config.
    pub fn save(&self) -> Result<()> {
        self.store.save(&self.config)
    }

    /// Creates and registers a disk.
    pub fn create_disk(&mut self, name: &str, size_gib: u64, format: DiskFormat) -> Result<DiskSpec> {
        self.disks.create_disk(&mut self.config, name, size_gib, format)
    }

    /// Gives the VM a primary disk if it has none.
    pub fn ensure_primary_disk(&mut self) -> Result<Option<DiskSpec>> {
        self.disks.ensure_primary_disk(&mut self.config)
    }

    /// Builds the launch command without starting anything.
    pub fn command(&mut self, embed: Option<u64>) -> Result<LaunchCommand> {
        self.builder.build(&mut self.config, embed)
    }

    /// Attaches install media.
    pub fn attach_iso(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        self.config.iso_path = Some(path.into());
        self.save()
    }

    /// Detaches install media.
    pub fn detach_iso(&mut self) -> Result<()> {
        self.config.iso_path = None;
        self.save()
    }

    /// Launches the hypervisor and starts connecting to its control socket.
    ///
    /// Returns the receiver for output lines and the exit event. The
    /// control connection is established in the background; watch
    /// [`phase`](Self::phase) or [`wait_control`](Self::wait_control).
    pub fn start(&mut self, embed: Option<u64>) -> Result<mpsc::UnboundedReceiver<VmEvent>> {
        if self.is_alive() {
            return Err(Error::AlreadyRunning(self.config.name.clone()));
        }
        let cmd = self.builder.build(&mut self.config, embed)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let process = Process::spawn(&cmd, tx)?;
        let control = Client::spawn(cmd.control_port, self.policy);
        info!(vm = %self.config.name, pid = process.pid(), control_port = cmd.control_port, "VM launched");
        self.runtime = Some(RuntimeState {
            process,
            control,
            stopping: false,
        });
        Ok(rx)
    }

    /// Runtime state of the latest launch.
    pub const fn runtime(&self) -> Option<&RuntimeState> {
        self.runtime.as_ref()
    }

    /// Returns `true` while the hypervisor process is alive.
    pub fn is_alive(&self) -> bool {
        self.runtime.as_ref().is_some_and(|rt| rt.process.is_alive())
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        let Some(rt) = self.runtime.as_ref().filter(|rt| rt.process.is_alive()) else {
            return Phase::Stopped;
        };
        if rt.stopping {
            return Phase::Stopping;
        }
        match rt.control.state() {
            ConnState::Ready => Phase::Running,
            ConnState::Disconnected => Phase::Unreachable,
            _ => Phase::Launching,
        }
    }

    /// Waits until the control connection is ready or `limit` elapses.
    pub async fn wait_control(&self, limit: std::time::Duration) -> bool {
        match &self.runtime {
            Some(rt) => rt.control.wait_ready(limit).await,
            None => false,
        }
    }

    /// Requests a graceful stop.
    ///
    /// With a ready control connection this sends an ACPI power-down and
    /// returns without waiting for the guest. Otherwise, or if the request
    /// fails, the process is asked to terminate. Exit is reported on the
    /// event channel.
    pub async fn stop(&mut self) -> Result<()> {
        let name = self.config.name.clone();
        let Some(rt) = self.runtime.as_mut().filter(|rt| rt.process.is_alive()) else {
            return Ok(());
        };
        rt.stopping = true;
        if rt.control.is_ready() {
            match rt
                .control
                .execute(&Command::new(commands::SYSTEM_POWERDOWN))
                .await
            {
                Ok(_) => {
                    info!(vm = %name, "requested guest power-down");
                    return Ok(());
                }
                Err(e) => warn!(vm = %name, error = %e, "power-down failed, terminating"),
            }
        }
        info!(vm = %name, pid = rt.process.pid(), "terminating hypervisor");
        rt.process.terminate()
    }

    /// Kills the hypervisor immediately, bypassing the guest.
    pub fn kill(&mut self) -> Result<()> {
        let Some(rt) = self.runtime.as_mut().filter(|rt| rt.process.is_alive()) else {
            return Ok(());
        };
        rt.stopping = true;
        info!(vm = %self.config.name, pid = rt.process.pid(), "killing hypervisor");
        rt.process.kill()
    }

    /// Waits for the hypervisor to exit. Returns immediately when not launched.
    pub async fn wait(&self) -> Option<i32> {
        match &self.runtime {
            Some(rt) => rt.process.wait().await,
            None => None,
        }
    }

    /// Feeds bytes to the hypervisor's stdin (the serial console when headless).
    pub async fn write_stdin(&mut self, data: &[u8]) -> Result<()> {
        match self.runtime.as_mut() {
            Some(rt) => rt.process.write_stdin(data).await,
            None => Err(Error::Control(vmctl_qmp::Error::NotConnected)),
        }
    }

    /// The control connection, failing with `NotConnected` before a launch.
    fn control(&self) -> Result<&Client> {
        self.runtime
            .as_ref()
            .map(|rt| &rt.control)
            .ok_or(Error::Control(vmctl_qmp::Error::NotConnected))
    }

    /// Sends a command and returns the raw reply object.
    pub async fn send_command(&self, cmd: &Command) -> Result<Value> {
        Ok(self.control()?.send_command(cmd).await?)
    }

    /// Runs a bare command name or a JSON command object.
    pub async fn execute(&self, input: &str) -> Result<Value> {
        let cmd = Command::parse(input)?;
        Ok(self.control()?.execute(&cmd).await?)
    }

    /// Pauses the guest's vCPUs.
    pub async fn pause(&self) -> Result<Value> {
        self.run(Command::new(commands::STOP)).await
    }

    /// Resumes a paused guest.
    pub async fn resume(&self) -> Result<Value> {
        self.run(Command::new(commands::CONT)).await
    }

    /// Hard-resets the guest.
    pub async fn reset(&self) -> Result<Value> {
        self.run(Command::new(commands::SYSTEM_RESET)).await
    }

    /// Saves an internal snapshot named `tag`.
    ///
    /// Fails with [`Error::Control`] when the monitor reports an error.
    pub async fn snapshot(&self, tag: &str) -> Result<()> {
        Ok(self.control()?.savevm(tag).await?)
    }

    /// Reports the guest run state.
    pub async fn query_status(&self) -> Result<Value> {
        self.run(Command::new(commands::QUERY_STATUS)).await
    }

    /// Drains protocol events received while awaiting replies.
    pub fn take_events(&self) -> Vec<Value> {
        self.runtime
            .as_ref()
            .map(|rt| rt.control.take_events())
            .unwrap_or_default()
    }

    /// Executes `cmd` and returns its `return` payload.
    async fn run(&self, cmd: Command) -> Result<Value> {
        Ok(self.control()?.execute(&cmd).await?)
    }
}
