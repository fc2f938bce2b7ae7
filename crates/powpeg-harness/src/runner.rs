//! Supervised processes: one runner owns at most one OS process.

pub mod bitcoin;
pub mod federate;
pub mod hsm;
pub mod tcp_signer;

use crate::factory::{PlatformProcessHandle, PlatformProcessManager, PlatformProcessManagerFactory};
use async_trait::async_trait;
use derive_builder::Builder;
use powpeg_harness_core::{
    HarnessError, OutputSink, PortAllocator, PortLease, ProbeOptions, ProcessHandle, ProcessId,
    ProcessLifecycle, ProcessSpec, ProcessTermination, StopSignal, TerminationResult,
    wait_for_ports,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub use bitcoin::{BitcoinRunner, BitcoinRunnerOptions, BitcoinRunnerOptionsBuilder};
pub use federate::{ForkConfig, FederateRunner, FederateRunnerOptions, FederateRunnerOptionsBuilder};
pub use hsm::{
    HsmProtocolVersion, HsmRunner, HsmRunnerOptions, HsmRunnerOptionsBuilder, HsmSpawnStrategy,
};
pub use tcp_signer::{TcpSignerRunner, TcpSignerRunnerOptions, TcpSignerRunnerOptionsBuilder};

/// What a successful `start()` reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartInfo {
    pub pid: ProcessId,
    pub ports: Vec<u16>,
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    fn name(&self) -> &str;

    /// Spawns the process and blocks until its ports accept connections.
    /// Fails with `AlreadyRunning` if a previous start is still alive.
    async fn start(&mut self) -> Result<StartInfo, HarnessError>;

    /// Fails with `NotRunning` if the runner was never started.
    async fn stop(&mut self) -> Result<(), HarnessError>;

    /// `None` while nothing is running
    fn pid(&self) -> Option<ProcessId>;

    async fn is_running(&self) -> bool;

    fn data_dir(&self) -> Option<&Path>;

    /// Ports of the running process; empty before start and after stop
    fn ports(&self) -> &[u16];
}

/// Settings every runner shares
#[derive(Debug, Clone, Builder)]
#[builder(setter(into, strip_option), default)]
pub struct CommonOptions {
    /// Overrides the runner's default name in logs and output prefixes
    pub name: Option<String>,
    /// Address the process binds and the probe connects to
    pub host: String,
    /// Fixed data directory; a fresh temporary one is used otherwise
    pub data_dir: Option<PathBuf>,
    /// Parent for temporary data directories
    pub base_data_dir: Option<PathBuf>,
    pub remove_data_dir_on_stop: bool,
    pub probe: ProbeOptions,
    /// Time a stopping process gets before SIGKILL
    pub stop_grace: Duration,
    pub stdout: Option<OutputSink>,
    pub stderr: Option<OutputSink>,
    pub port_allocator: PortAllocator,
}

impl Default for CommonOptions {
    fn default() -> Self {
        Self {
            name: None,
            host: "127.0.0.1".to_string(),
            data_dir: None,
            base_data_dir: None,
            remove_data_dir_on_stop: true,
            probe: ProbeOptions::default(),
            stop_grace: Duration::from_secs(10),
            stdout: None,
            stderr: None,
            port_allocator: PortAllocator::default(),
        }
    }
}

impl CommonOptions {
    pub fn builder() -> CommonOptionsBuilder {
        CommonOptionsBuilder::default()
    }
}

/// How a runner's process is brought down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopMode {
    Signal(StopSignal),
    /// SIGTERM to every descendant, then to the root
    ProcessTree,
}

/// Lifecycle shared by every runner variant: running check, data directory,
/// port lease, spawn, readiness probe and stop.
pub(crate) struct RunnerCore {
    name: String,
    common: CommonOptions,
    stop_mode: StopMode,
    manager: PlatformProcessManager,
    handle: Option<PlatformProcessHandle>,
    lease: Option<PortLease>,
    ports: Vec<u16>,
    data_dir: Option<PathBuf>,
}

impl RunnerCore {
    pub(crate) fn new(default_name: &str, common: CommonOptions, stop_mode: StopMode) -> Self {
        let name = common.name.clone().unwrap_or_else(|| default_name.to_string());
        Self {
            name,
            common,
            stop_mode,
            manager: PlatformProcessManagerFactory::create_process_manager(),
            handle: None,
            lease: None,
            ports: Vec::new(),
            data_dir: None,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn host(&self) -> &str {
        &self.common.host
    }

    /// Fails if the previous process is still alive. A process that died on
    /// its own is forgotten so the runner can be started again.
    pub(crate) async fn ensure_not_running(&mut self) -> Result<(), HarnessError> {
        if let Some(handle) = &self.handle {
            if handle.is_running().await {
                return Err(HarnessError::AlreadyRunning {
                    resource: self.name.clone(),
                });
            }
            warn!(runner = %self.name, "process exited on its own, discarding handle");
            self.handle = None;
            self.lease = None;
            self.ports.clear();
        }
        Ok(())
    }

    pub(crate) fn provisioning(&self, reason: impl Into<String>) -> HarnessError {
        HarnessError::provisioning(&self.name, reason)
    }

    pub(crate) fn not_running(&self) -> HarnessError {
        HarnessError::NotRunning {
            resource: self.name.clone(),
        }
    }

    /// Uses the configured data directory, or creates a fresh temporary one
    pub(crate) async fn prepare_data_dir(&mut self) -> Result<PathBuf, HarnessError> {
        let dir = match &self.common.data_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|e| {
                        self.provisioning(format!("cannot create {}: {e}", dir.display()))
                    })?;
                dir.clone()
            }
            None => {
                let base = self
                    .common
                    .base_data_dir
                    .clone()
                    .unwrap_or_else(std::env::temp_dir);
                tokio::fs::create_dir_all(&base)
                    .await
                    .map_err(|e| {
                        self.provisioning(format!("cannot create {}: {e}", base.display()))
                    })?;
                tempfile::Builder::new()
                    .prefix(&format!("{}-", self.name))
                    .tempdir_in(&base)
                    .map_err(|e| self.provisioning(format!("cannot create data dir: {e}")))?
                    .keep()
            }
        };
        debug!(runner = %self.name, data_dir = %dir.display(), "using data directory");
        self.data_dir = Some(dir.clone());
        Ok(dir)
    }

    /// Resolves one port per slot: explicit ports are used as given, the
    /// rest are leased from the allocator.
    pub(crate) async fn resolve_ports(
        &mut self,
        explicit: &[Option<u16>],
    ) -> Result<Vec<u16>, HarnessError> {
        let missing = explicit.iter().filter(|port| port.is_none()).count();
        let lease = if missing > 0 {
            Some(
                self.common
                    .port_allocator
                    .reserve(&self.common.host, missing)
                    .await?,
            )
        } else {
            None
        };

        let mut leased = lease.iter().flat_map(|lease| lease.ports().iter().copied());
        let ports = explicit
            .iter()
            .map(|port| port.or_else(|| leased.next()))
            .collect::<Option<Vec<u16>>>()
            .ok_or_else(|| self.provisioning("port lease came back short"))?;

        self.lease = lease;
        self.ports = ports.clone();
        Ok(ports)
    }

    /// Spawns `spec` and waits until every port in `probe_ports` accepts a
    /// connection. A failed readiness check kills the process and leaves the
    /// runner stopped, see [`RunnerCore::abandon_start`].
    pub(crate) async fn launch(
        &mut self,
        spec: &ProcessSpec,
        probe_ports: &[u16],
    ) -> Result<StartInfo, HarnessError> {
        let result = self.spawn_until_ready(spec, probe_ports).await;
        if result.is_err() {
            self.abandon_start().await;
        }
        result
    }

    async fn spawn_until_ready(
        &mut self,
        spec: &ProcessSpec,
        probe_ports: &[u16],
    ) -> Result<StartInfo, HarnessError> {
        let handle = self
            .manager
            .spawn_process(spec, self.common.stdout.clone(), self.common.stderr.clone())
            .await
            .map_err(|e| self.provisioning(format!("{e:#}")))?;
        let pid = handle
            .pid()
            .ok_or_else(|| self.provisioning(format!("{} exited immediately", spec.command)))?;
        info!(runner = %self.name, pid = %pid, ports = ?self.ports, "process spawned");

        let endpoints: Vec<(String, u16)> = probe_ports
            .iter()
            .map(|port| (self.common.host.clone(), *port))
            .collect();
        if let Err(e) = wait_for_ports(&endpoints, self.common.probe).await {
            warn!(
                runner = %self.name,
                pid = %pid,
                error = %e,
                "process never became ready, killing it"
            );
            let killed = self
                .manager
                .terminate(&handle, StopSignal::Force, self.common.stop_grace)
                .await;
            if !killed.is_success() {
                warn!(
                    runner = %self.name,
                    pid = %pid,
                    result = ?killed,
                    "could not kill unready process"
                );
            }
            return Err(e);
        }

        info!(runner = %self.name, pid = %pid, "process ready");
        self.handle = Some(handle);
        Ok(StartInfo {
            pid,
            ports: self.ports.clone(),
        })
    }

    /// Rolls back a start that failed after `prepare_data_dir`. The port
    /// lease and ports are dropped and the data directory is deleted when
    /// `remove_data_dir_on_stop` is set.
    pub(crate) async fn abandon_start(&mut self) {
        self.lease = None;
        self.ports.clear();
        if let Err(e) = self.remove_data_dir().await {
            warn!(
                runner = %self.name,
                error = %e,
                "could not remove data directory after failed start"
            );
        }
    }

    /// Deletes the data directory when `remove_data_dir_on_stop` is set
    async fn remove_data_dir(&mut self) -> std::io::Result<()> {
        if !self.common.remove_data_dir_on_stop {
            return Ok(());
        }
        let Some(dir) = self.data_dir.take() else {
            return Ok(());
        };
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(runner = %self.name, data_dir = %dir.display(), "removed data directory");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                self.data_dir = Some(dir);
                Err(e)
            }
        }
    }

    pub(crate) async fn stop(&mut self) -> Result<(), HarnessError> {
        let handle = self.handle.take().ok_or_else(|| self.not_running())?;
        let grace = self.common.stop_grace;
        info!(runner = %self.name, pid = ?handle.pid(), mode = ?self.stop_mode, "stopping process");

        let result = match (self.stop_mode, handle.pid()) {
            (StopMode::Signal(signal), _) => self.manager.terminate(&handle, signal, grace).await,
            (StopMode::ProcessTree, Some(pid)) => {
                let result = self.manager.terminate_process_tree(pid).await;
                if result == TerminationResult::Success
                    && handle.wait_for_exit(Some(grace)).await.is_err()
                {
                    warn!(
                        runner = %self.name,
                        pid = %pid,
                        "process tree ignored SIGTERM, sending SIGKILL"
                    );
                    self.manager.force_kill(&handle).await
                } else {
                    result
                }
            }
            (StopMode::ProcessTree, None) => TerminationResult::ProcessNotFound,
        };
        self.lease = None;
        self.ports.clear();

        if !result.is_success() {
            return Err(HarnessError::Other(anyhow::anyhow!(
                "failed to stop {}: {:?}",
                self.name,
                result
            )));
        }

        self.remove_data_dir().await?;
        info!(runner = %self.name, "process stopped");
        Ok(())
    }

    pub(crate) fn pid(&self) -> Option<ProcessId> {
        self.handle.as_ref().and_then(|handle| handle.pid())
    }

    pub(crate) async fn is_running(&self) -> bool {
        match &self.handle {
            Some(handle) => handle.is_running().await,
            None => false,
        }
    }

    pub(crate) fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    pub(crate) fn ports(&self) -> &[u16] {
        &self.ports
    }
}

/// Copies `source` into `dir` as `file_name` and deletes the copy after
/// `cleanup_after`, once the signer has loaded it.
pub(crate) async fn stage_key_file(
    source: &Path,
    dir: &Path,
    file_name: &str,
    cleanup_after: Duration,
) -> Result<PathBuf, HarnessError> {
    let staged = dir.join(file_name);
    tokio::fs::copy(source, &staged).await.map_err(|e| {
        HarnessError::provisioning(
            file_name,
            format!("cannot stage key file {}: {e}", source.display()),
        )
    })?;
    debug!(source = %source.display(), staged = %staged.display(), "staged key file");

    let cleanup = staged.clone();
    tokio::spawn(async move {
        tokio::time::sleep(cleanup_after).await;
        match tokio::fs::remove_file(&cleanup).await {
            Ok(()) => debug!(staged = %cleanup.display(), "removed staged key file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                staged = %cleanup.display(),
                error = %e,
                "could not remove staged key file"
            ),
        }
    });
    Ok(staged)
}
