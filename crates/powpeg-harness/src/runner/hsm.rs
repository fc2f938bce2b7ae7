//! HSM signers. The protocol version decides once, at construction, which of
//! four launch strategies a runner uses.

use super::tcp_signer::{TcpSignerRunner, TcpSignerRunnerOptions};
use super::{CommonOptions, ProcessRunner, RunnerCore, StartInfo, StopMode, stage_key_file};
use crate::env::ExecEnv;
use async_trait::async_trait;
use derive_builder::Builder;
use powpeg_harness_core::{
    HarnessError, HsmClient, ProcessId, ProcessSpec, SignerPublicKeys, StopSignal,
};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const DOCKER_MOUNT: &str = "/hsm";
const STATE_FILE: &str = "state.json";
const UPGRADES_FILE: &str = "network-upgrades.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HsmProtocolVersion(pub u32);

impl fmt::Display for HsmProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Builder)]
#[builder(setter(into, strip_option), default)]
pub struct HsmRunnerOptions {
    /// Simulator or signer executable; unused by the docker strategy
    pub executable: Option<PathBuf>,
    pub protocol_version: HsmProtocolVersion,
    pub exec_env: ExecEnv,
    pub key_file: Option<PathBuf>,
    pub port: Option<u16>,
    pub checkpoint: Option<String>,
    pub difficulty: Option<String>,
    /// Network upgrade activation file for stateful simulators
    pub network_upgrades: Option<PathBuf>,
    pub docker_image: String,
    /// Defaults to `hsm-<port>`
    pub container_name: Option<String>,
    pub key_cleanup_delay: Duration,
    pub common: CommonOptions,
}

impl Default for HsmRunnerOptions {
    fn default() -> Self {
        Self {
            executable: None,
            protocol_version: HsmProtocolVersion(2),
            exec_env: ExecEnv::default(),
            key_file: None,
            port: None,
            checkpoint: None,
            difficulty: None,
            network_upgrades: None,
            docker_image: "hsm2-simulator".to_string(),
            container_name: None,
            key_cleanup_delay: Duration::from_secs(5),
            common: CommonOptions::default(),
        }
    }
}

impl HsmRunnerOptions {
    pub fn builder() -> HsmRunnerOptionsBuilder {
        HsmRunnerOptionsBuilder::default()
    }

    fn tcp_signer_options(&self) -> TcpSignerRunnerOptions {
        let mut common = self.common.clone();
        common.name.get_or_insert_with(|| "hsm".to_string());
        TcpSignerRunnerOptions {
            executable: self.executable.clone(),
            key_file: self.key_file.clone(),
            port: self.port,
            checkpoint: self.checkpoint.clone(),
            difficulty: self.difficulty.clone(),
            protocol_version: Some(self.protocol_version.0),
            key_cleanup_delay: self.key_cleanup_delay,
            common,
            ..TcpSignerRunnerOptions::default()
        }
    }
}

/// How an HSM process is launched
pub enum HsmSpawnStrategy {
    /// Protocol 1: a stateless executable
    Bare,
    /// Protocol 2 where the simulator only ships as an image
    DockerSimulator {
        image: String,
        container: Option<String>,
    },
    /// Protocol 2 with a native simulator binary
    LocalSimulator,
    /// Protocol 3 and later
    TcpSigner(Box<TcpSignerRunner>),
}

impl HsmSpawnStrategy {
    pub fn select(options: &HsmRunnerOptions) -> Result<Self, HarnessError> {
        match options.protocol_version.0 {
            0 => Err(HarnessError::InvalidArgument(
                "HSM protocol version must be at least 1".to_string(),
            )),
            1 => Ok(HsmSpawnStrategy::Bare),
            2 => Ok(match options.exec_env {
                ExecEnv::MacOs => HsmSpawnStrategy::DockerSimulator {
                    image: options.docker_image.clone(),
                    container: options.container_name.clone(),
                },
                ExecEnv::Ubuntu => HsmSpawnStrategy::LocalSimulator,
            }),
            _ => Ok(HsmSpawnStrategy::TcpSigner(Box::new(TcpSignerRunner::new(
                options.tcp_signer_options(),
            )))),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            HsmSpawnStrategy::Bare => "bare",
            HsmSpawnStrategy::DockerSimulator { .. } => "docker-simulator",
            HsmSpawnStrategy::LocalSimulator => "local-simulator",
            HsmSpawnStrategy::TcpSigner(_) => "tcpsigner",
        }
    }
}

impl fmt::Debug for HsmSpawnStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

pub struct HsmRunner {
    options: HsmRunnerOptions,
    strategy: HsmSpawnStrategy,
    core: RunnerCore,
}

impl HsmRunner {
    pub fn new(options: HsmRunnerOptions) -> Result<Self, HarnessError> {
        let strategy = HsmSpawnStrategy::select(&options)?;
        let stop_mode = match &strategy {
            HsmSpawnStrategy::DockerSimulator { .. } => StopMode::ProcessTree,
            _ => StopMode::Signal(StopSignal::Graceful),
        };
        let core = RunnerCore::new("hsm", options.common.clone(), stop_mode);
        debug!(
            runner = %core.name(),
            version = %options.protocol_version,
            strategy = ?strategy,
            "selected HSM strategy"
        );
        Ok(Self {
            options,
            strategy,
            core,
        })
    }

    pub fn strategy(&self) -> &HsmSpawnStrategy {
        &self.strategy
    }

    pub fn protocol_version(&self) -> HsmProtocolVersion {
        self.options.protocol_version
    }

    pub fn port(&self) -> Option<u16> {
        self.ports().first().copied()
    }

    pub fn host(&self) -> &str {
        match &self.strategy {
            HsmSpawnStrategy::TcpSigner(signer) => signer.host(),
            _ => self.core.host(),
        }
    }

    fn key_file_name(&self) -> String {
        format!("keys.{}.json", self.core.name())
    }

    fn require_executable(&self) -> Result<&Path, HarnessError> {
        self.options
            .executable
            .as_deref()
            .ok_or_else(|| self.core.provisioning("no HSM executable configured"))
    }

    fn chain_args(&self, state_file: String) -> Result<Vec<String>, HarnessError> {
        let (Some(checkpoint), Some(difficulty)) =
            (&self.options.checkpoint, &self.options.difficulty)
        else {
            return Err(self.core.provisioning(format!(
                "protocol {} needs a checkpoint and a difficulty",
                self.options.protocol_version
            )));
        };
        Ok(vec![
            format!("-s{state_file}"),
            format!("-c{checkpoint}"),
            format!("-d{difficulty}"),
        ])
    }

    /// Command line for the selected strategy, serving on `port` with its
    /// files under `data_dir`.
    pub fn command(&self, port: u16, data_dir: &Path) -> Result<ProcessSpec, HarnessError> {
        let host = self.core.host();
        let key = data_dir.join(self.key_file_name());

        let (command, args) = match &self.strategy {
            HsmSpawnStrategy::TcpSigner(signer) => return signer.command(port, data_dir),
            HsmSpawnStrategy::Bare => {
                let exe = self.require_executable()?;
                (
                    exe.display().to_string(),
                    vec![
                        format!("-b{host}"),
                        format!("-p{port}"),
                        format!("-k{}", key.display()),
                    ],
                )
            }
            HsmSpawnStrategy::LocalSimulator => {
                let exe = self.require_executable()?;
                let mut args = vec![
                    format!("-b{host}"),
                    format!("-p{port}"),
                    format!("-k{}", key.display()),
                ];
                if let Some(upgrades) = &self.options.network_upgrades {
                    args.push(format!("-n{}", upgrades.display()));
                }
                args.extend(self.chain_args(data_dir.join(STATE_FILE).display().to_string())?);
                (exe.display().to_string(), args)
            }
            HsmSpawnStrategy::DockerSimulator { image, container } => {
                let container = container.clone().unwrap_or_else(|| format!("hsm-{port}"));
                let mut args = vec![
                    "run".to_string(),
                    "--rm".to_string(),
                    "--name".to_string(),
                    container,
                    "-p".to_string(),
                    format!("{port}:{port}"),
                    "-v".to_string(),
                    format!("{}:{DOCKER_MOUNT}", data_dir.display()),
                    image.clone(),
                    "-b0.0.0.0".to_string(),
                    format!("-p{port}"),
                    format!("-k{DOCKER_MOUNT}/{}", self.key_file_name()),
                ];
                if self.options.network_upgrades.is_some() {
                    args.push(format!("-n{DOCKER_MOUNT}/{UPGRADES_FILE}"));
                }
                args.extend(self.chain_args(format!("{DOCKER_MOUNT}/{STATE_FILE}"))?);
                ("docker".to_string(), args)
            }
        };

        Ok(ProcessSpec {
            label: self.core.name().to_string(),
            command,
            args,
            working_directory: Some(data_dir.to_path_buf()),
            ..ProcessSpec::default()
        })
    }

    pub fn client(&self) -> Result<HsmClient, HarnessError> {
        match &self.strategy {
            HsmSpawnStrategy::TcpSigner(signer) => signer.client(),
            _ => {
                let port = self.port().ok_or_else(|| self.core.not_running())?;
                Ok(HsmClient::new(self.core.host(), port))
            }
        }
    }

    pub async fn get_public_keys(&self) -> Result<SignerPublicKeys, HarnessError> {
        self.client()?.get_public_keys(self.options.protocol_version.0).await
    }

    async fn launch_in(
        &mut self,
        key_file: &Path,
        data_dir: &Path,
    ) -> Result<StartInfo, HarnessError> {
        let ports = self.core.resolve_ports(&[self.options.port]).await?;
        let spec = self.command(ports[0], data_dir)?;

        stage_key_file(
            key_file,
            data_dir,
            &self.key_file_name(),
            self.options.key_cleanup_delay,
        )
        .await?;
        if let (HsmSpawnStrategy::DockerSimulator { .. }, Some(upgrades)) =
            (&self.strategy, &self.options.network_upgrades)
        {
            tokio::fs::copy(upgrades, data_dir.join(UPGRADES_FILE))
                .await
                .map_err(|e| {
                    self.core
                        .provisioning(format!("cannot copy {}: {e}", upgrades.display()))
                })?;
        }

        info!(
            runner = %self.core.name(),
            strategy = ?self.strategy,
            port = ports[0],
            "starting HSM"
        );
        self.core.launch(&spec, &ports).await
    }
}

#[async_trait]
impl ProcessRunner for HsmRunner {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn start(&mut self) -> Result<StartInfo, HarnessError> {
        if let HsmSpawnStrategy::TcpSigner(signer) = &mut self.strategy {
            return signer.start().await;
        }

        self.core.ensure_not_running().await?;
        let key_file = self
            .options
            .key_file
            .clone()
            .ok_or_else(|| self.core.provisioning("no key file configured"))?;

        let data_dir = self.core.prepare_data_dir().await?;
        let started = self.launch_in(&key_file, &data_dir).await;
        if started.is_err() {
            self.core.abandon_start().await;
        }
        started
    }

    async fn stop(&mut self) -> Result<(), HarnessError> {
        match &mut self.strategy {
            HsmSpawnStrategy::TcpSigner(signer) => signer.stop().await,
            _ => self.core.stop().await,
        }
    }

    fn pid(&self) -> Option<ProcessId> {
        match &self.strategy {
            HsmSpawnStrategy::TcpSigner(signer) => signer.pid(),
            _ => self.core.pid(),
        }
    }

    async fn is_running(&self) -> bool {
        match &self.strategy {
            HsmSpawnStrategy::TcpSigner(signer) => signer.is_running().await,
            _ => self.core.is_running().await,
        }
    }

    fn data_dir(&self) -> Option<&Path> {
        match &self.strategy {
            HsmSpawnStrategy::TcpSigner(signer) => signer.data_dir(),
            _ => self.core.data_dir(),
        }
    }

    fn ports(&self) -> &[u16] {
        match &self.strategy {
            HsmSpawnStrategy::TcpSigner(signer) => signer.ports(),
            _ => self.core.ports(),
        }
    }
}
