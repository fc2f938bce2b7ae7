use super::{CommonOptions, ProcessRunner, RunnerCore, StartInfo, StopMode, stage_key_file};
use async_trait::async_trait;
use derive_builder::Builder;
use powpeg_harness_core::{
    BlockchainState, HarnessError, HsmClient, ProcessId, ProcessSpec, SignerPublicKeys, StopSignal,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Name of the staged key inside the signer's working directory
pub const STAGED_KEY_FILE: &str = "key.json";

#[derive(Debug, Clone, Builder)]
#[builder(setter(into, strip_option), default)]
pub struct TcpSignerRunnerOptions {
    /// Signer executable; unused when running through docker
    pub executable: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub port: Option<u16>,
    /// Checkpoint block hash, for signers that track the chain
    pub checkpoint: Option<String>,
    /// Minimum cumulative difficulty, required together with `checkpoint`
    pub difficulty: Option<String>,
    /// Queried from the signer when unset
    pub protocol_version: Option<u32>,
    /// Runs the signer with `docker run --name <container>`
    pub docker_container_name: Option<String>,
    pub docker_image: String,
    pub key_cleanup_delay: Duration,
    pub common: CommonOptions,
}

impl Default for TcpSignerRunnerOptions {
    fn default() -> Self {
        Self {
            executable: None,
            key_file: None,
            port: None,
            checkpoint: None,
            difficulty: None,
            protocol_version: None,
            docker_container_name: None,
            docker_image: "tcpsigner".to_string(),
            key_cleanup_delay: Duration::from_secs(5),
            common: CommonOptions::default(),
        }
    }
}

impl TcpSignerRunnerOptions {
    pub fn builder() -> TcpSignerRunnerOptionsBuilder {
        TcpSignerRunnerOptionsBuilder::default()
    }
}

/// A TCP signer bundle speaking the HSM JSON protocol
pub struct TcpSignerRunner {
    options: TcpSignerRunnerOptions,
    core: RunnerCore,
}

impl TcpSignerRunner {
    pub fn new(options: TcpSignerRunnerOptions) -> Self {
        let stop_mode = if options.docker_container_name.is_some() {
            StopMode::ProcessTree
        } else {
            StopMode::Signal(StopSignal::Graceful)
        };
        let core = RunnerCore::new("tcpsigner", options.common.clone(), stop_mode);
        Self { options, core }
    }

    pub fn options(&self) -> &TcpSignerRunnerOptions {
        &self.options
    }

    pub fn port(&self) -> Option<u16> {
        self.core.ports().first().copied()
    }

    pub fn host(&self) -> &str {
        self.core.host()
    }

    /// Builds the command line for a signer listening on `port` with its
    /// key staged in `work_dir`.
    pub fn command(&self, port: u16, work_dir: &Path) -> Result<ProcessSpec, HarnessError> {
        let o = &self.options;
        let mut signer_args = vec![format!("-p{port}"), format!("--key={STAGED_KEY_FILE}")];
        match (&o.checkpoint, &o.difficulty) {
            (Some(checkpoint), Some(difficulty)) => signer_args.extend([
                format!("--checkpoint={checkpoint}"),
                format!("--difficulty={difficulty}"),
                "--network=regtest".to_string(),
            ]),
            (None, None) => {}
            _ => {
                return Err(self
                    .core
                    .provisioning("checkpoint and difficulty must be given together"));
            }
        }

        let (command, args) = match &o.docker_container_name {
            Some(container) => {
                let mut args = vec![
                    "run".to_string(),
                    "--rm".to_string(),
                    "--name".to_string(),
                    container.clone(),
                    "-p".to_string(),
                    format!("{port}:{port}"),
                    "-v".to_string(),
                    format!("{}:/signer", work_dir.display()),
                    "-w".to_string(),
                    "/signer".to_string(),
                    o.docker_image.clone(),
                ];
                args.extend(signer_args);
                ("docker".to_string(), args)
            }
            None => {
                let executable = o
                    .executable
                    .as_ref()
                    .ok_or_else(|| self.core.provisioning("no signer executable configured"))?;
                (executable.display().to_string(), signer_args)
            }
        };

        Ok(ProcessSpec {
            label: self.core.name().to_string(),
            command,
            args,
            working_directory: Some(work_dir.to_path_buf()),
            ..ProcessSpec::default()
        })
    }

    pub fn client(&self) -> Result<HsmClient, HarnessError> {
        let port = self.port().ok_or_else(|| self.core.not_running())?;
        Ok(HsmClient::new(self.core.host(), port))
    }

    pub async fn get_version(&self) -> Result<u32, HarnessError> {
        self.client()?.version().await
    }

    async fn protocol_version(&self) -> Result<u32, HarnessError> {
        match self.options.protocol_version {
            Some(version) => Ok(version),
            None => self.get_version().await,
        }
    }

    pub async fn get_public_key(&self, key_id: &str) -> Result<String, HarnessError> {
        let version = self.protocol_version().await?;
        self.client()?.get_public_key(version, key_id).await
    }

    pub async fn get_public_keys(&self) -> Result<SignerPublicKeys, HarnessError> {
        let version = self.protocol_version().await?;
        self.client()?.get_public_keys(version).await
    }

    pub async fn get_blockchain_state(&self) -> Result<BlockchainState, HarnessError> {
        let version = self.protocol_version().await?;
        self.client()?.blockchain_state(version).await
    }

    async fn launch_in(
        &mut self,
        key_file: &Path,
        work_dir: &Path,
    ) -> Result<StartInfo, HarnessError> {
        let ports = self.core.resolve_ports(&[self.options.port]).await?;
        let spec = self.command(ports[0], work_dir)?;
        stage_key_file(key_file, work_dir, STAGED_KEY_FILE, self.options.key_cleanup_delay).await?;
        debug!(runner = %self.core.name(), port = ports[0], "starting tcp signer");
        self.core.launch(&spec, &ports).await
    }
}

#[async_trait]
impl ProcessRunner for TcpSignerRunner {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn start(&mut self) -> Result<StartInfo, HarnessError> {
        self.core.ensure_not_running().await?;
        let key_file = self
            .options
            .key_file
            .clone()
            .ok_or_else(|| self.core.provisioning("no key file configured"))?;
        if !key_file.is_file() {
            return Err(self
                .core
                .provisioning(format!("key file {} does not exist", key_file.display())));
        }

        let work_dir = self.core.prepare_data_dir().await?;
        let started = self.launch_in(&key_file, &work_dir).await;
        if started.is_err() {
            self.core.abandon_start().await;
        }
        started
    }

    async fn stop(&mut self) -> Result<(), HarnessError> {
        self.core.stop().await
    }

    fn pid(&self) -> Option<ProcessId> {
        self.core.pid()
    }

    async fn is_running(&self) -> bool {
        self.core.is_running().await
    }

    fn data_dir(&self) -> Option<&Path> {
        self.core.data_dir()
    }

    fn ports(&self) -> &[u16] {
        self.core.ports()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(builder: &mut TcpSignerRunnerOptionsBuilder) -> TcpSignerRunner {
        TcpSignerRunner::new(builder.build().unwrap())
    }

    #[test]
    fn test_bare_command_without_checkpoint() {
        let runner = runner(TcpSignerRunnerOptions::builder().executable("/opt/signer/tcpsigner"));
        let spec = runner.command(9999, Path::new("/tmp/signer")).unwrap();

        assert_eq!(spec.command, "/opt/signer/tcpsigner");
        assert_eq!(spec.args, vec!["-p9999", "--key=key.json"]);
        assert_eq!(spec.working_directory.as_deref(), Some(Path::new("/tmp/signer")));
    }

    #[test]
    fn test_checkpoint_adds_chain_flags() {
        let runner = runner(
            TcpSignerRunnerOptions::builder()
                .executable("tcpsigner")
                .checkpoint("0xabc")
                .difficulty("0x14"),
        );
        let spec = runner.command(9000, Path::new("/tmp/s")).unwrap();
        assert_eq!(
            spec.args,
            vec![
                "-p9000",
                "--key=key.json",
                "--checkpoint=0xabc",
                "--difficulty=0x14",
                "--network=regtest"
            ]
        );
    }

    #[test]
    fn test_half_configured_checkpoint_is_rejected() {
        let runner = runner(
            TcpSignerRunnerOptions::builder()
                .executable("tcpsigner")
                .checkpoint("0xabc"),
        );
        assert!(matches!(
            runner.command(9000, Path::new("/tmp/s")),
            Err(HarnessError::Provisioning { .. })
        ));
    }

    #[test]
    fn test_docker_command() {
        let runner = runner(
            TcpSignerRunnerOptions::builder()
                .docker_container_name("signer-1")
                .docker_image("rsksmart/tcpsigner:latest"),
        );
        let spec = runner.command(9100, Path::new("/tmp/s1")).unwrap();
        assert_eq!(spec.command, "docker");
        assert_eq!(
            spec.args,
            vec![
                "run",
                "--rm",
                "--name",
                "signer-1",
                "-p",
                "9100:9100",
                "-v",
                "/tmp/s1:/signer",
                "-w",
                "/signer",
                "rsksmart/tcpsigner:latest",
                "-p9100",
                "--key=key.json",
            ]
        );
    }

    #[test]
    fn test_bare_mode_needs_executable() {
        let runner = runner(&mut TcpSignerRunnerOptions::builder());
        let err = runner.command(9000, Path::new("/tmp/s")).unwrap_err();
        assert!(format!("{err}").contains("tcpsigner"));
    }

    #[tokio::test]
    async fn test_start_without_key_file_fails_before_spawn() {
        let mut runner = runner(TcpSignerRunnerOptions::builder().executable("tcpsigner"));
        assert!(matches!(runner.start().await, Err(HarnessError::Provisioning { .. })));
        assert!(runner.data_dir().is_none());
        assert!(matches!(runner.client(), Err(HarnessError::NotRunning { .. })));
    }

    #[tokio::test]
    async fn test_bad_command_removes_work_dir() {
        let base = tempfile::tempdir().unwrap();
        let key = base.path().join("fed1.json");
        std::fs::write(&key, "{}").unwrap();
        let signers = base.path().join("signers");
        let mut runner = runner(
            TcpSignerRunnerOptions::builder()
                .executable("tcpsigner")
                .checkpoint("0xabc")
                .key_file(key)
                .common(CommonOptions::builder().base_data_dir(&signers).build().unwrap()),
        );

        assert!(matches!(runner.start().await, Err(HarnessError::Provisioning { .. })));
        assert!(runner.data_dir().is_none());
        assert!(runner.ports().is_empty());
        assert_eq!(std::fs::read_dir(&signers).unwrap().count(), 0);
    }
}
