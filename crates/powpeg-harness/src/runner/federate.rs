use super::{CommonOptions, ProcessRunner, RunnerCore, StartInfo, StopMode};
use crate::env::{JAVA_BIN_PATH, LOG_HOME, POWPEG_NODE_JAR_PATH, path_from_env};
use crate::rpc::RskRpcClient;
use async_trait::async_trait;
use derive_builder::Builder;
use powpeg_harness_core::{HarnessError, ProcessId, ProcessSpec, StopSignal};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const FEDERATE_MAIN_CLASS: &str = "co.rsk.federate.FederateRunner";

/// Fork name to activation height
pub type ForkConfig = BTreeMap<String, u64>;

#[derive(Debug, Clone, Default, Builder)]
#[builder(setter(into, strip_option), default)]
pub struct FederateRunnerOptions {
    /// `JAVA_BIN_PATH`, then `java` from `PATH`
    pub java: Option<PathBuf>,
    /// `POWPEG_NODE_JAR_PATH` when unset
    pub jar: Option<PathBuf>,
    pub config_file: Option<PathBuf>,
    /// Extra classpath entries, e.g. signer drivers
    #[builder(setter(custom))]
    pub signer_classpath: Vec<PathBuf>,
    pub p2p_port: Option<u16>,
    pub rpc_port: Option<u16>,
    /// Directory holding `logback.xml`; `LOG_HOME` when unset
    pub log_home: Option<PathBuf>,
    #[builder(setter(custom))]
    pub forks: ForkConfig,
    /// Passed as `-D<key>=<value>`
    #[builder(setter(custom))]
    pub custom_config: BTreeMap<String, String>,
    pub common: CommonOptions,
}

impl FederateRunnerOptions {
    pub fn builder() -> FederateRunnerOptionsBuilder {
        FederateRunnerOptionsBuilder::default()
    }
}

impl FederateRunnerOptionsBuilder {
    pub fn signer_classpath<P: Into<PathBuf>, I: IntoIterator<Item = P>>(
        &mut self,
        iter: I,
    ) -> &mut Self {
        self.signer_classpath = Some(iter.into_iter().map(Into::into).collect());
        self
    }

    pub fn fork(&mut self, name: impl Into<String>, height: u64) -> &mut Self {
        self.forks
            .get_or_insert_with(ForkConfig::new)
            .insert(name.into(), height);
        self
    }

    pub fn forks(&mut self, forks: ForkConfig) -> &mut Self {
        self.forks.get_or_insert_with(ForkConfig::new).extend(forks);
        self
    }

    pub fn config(&mut self, key: impl Into<String>, value: impl ToString) -> &mut Self {
        self.custom_config
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.to_string());
        self
    }
}

/// The JVM federate node
pub struct FederateRunner {
    options: FederateRunnerOptions,
    core: RunnerCore,
}

impl FederateRunner {
    pub fn new(options: FederateRunnerOptions) -> Self {
        // The node's shutdown hooks are unreliable under SIGTERM
        let core = RunnerCore::new(
            "federate",
            options.common.clone(),
            StopMode::Signal(StopSignal::Force),
        );
        Self { options, core }
    }

    pub fn options(&self) -> &FederateRunnerOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut FederateRunnerOptions {
        &mut self.options
    }

    pub fn p2p_port(&self) -> Option<u16> {
        self.core.ports().first().copied()
    }

    pub fn rpc_port(&self) -> Option<u16> {
        self.core.ports().get(1).copied()
    }

    /// RPC handle for the running node
    pub fn node(&self) -> Result<RskRpcClient, HarnessError> {
        let port = self.rpc_port().ok_or_else(|| self.core.not_running())?;
        Ok(RskRpcClient::local(self.core.host(), port))
    }

    fn java(&self) -> PathBuf {
        self.options
            .java
            .clone()
            .or_else(|| path_from_env(JAVA_BIN_PATH))
            .unwrap_or_else(|| PathBuf::from("java"))
    }

    fn jar(&self) -> Result<PathBuf, HarnessError> {
        self.options
            .jar
            .clone()
            .or_else(|| path_from_env(POWPEG_NODE_JAR_PATH))
            .ok_or_else(|| self.core.provisioning(format!("{POWPEG_NODE_JAR_PATH} is not set")))
    }

    fn config_file(&self) -> Result<&Path, HarnessError> {
        let config = self
            .options
            .config_file
            .as_deref()
            .ok_or_else(|| self.core.provisioning("no config file configured"))?;
        if !config.is_file() {
            return Err(self
                .core
                .provisioning(format!("config file {} does not exist", config.display())));
        }
        Ok(config)
    }

    pub fn classpath(&self, jar: &Path) -> String {
        std::iter::once(jar)
            .chain(self.options.signer_classpath.iter().map(PathBuf::as_path))
            .map(|entry| entry.display().to_string())
            .collect::<Vec<_>>()
            .join(":")
    }

    pub fn command(
        &self,
        java: &Path,
        jar: &Path,
        config: &Path,
        p2p_port: u16,
        rpc_port: u16,
        data_dir: &Path,
    ) -> ProcessSpec {
        let o = &self.options;
        let mut args = vec![
            "-cp".to_string(),
            self.classpath(jar),
            format!("-Drsk.conf.file={}", config.display()),
            format!("-Ddatabase.dir={}", data_dir.display()),
            format!("-Dpeer.port={p2p_port}"),
            format!("-Drpc.providers.web.http.port={rpc_port}"),
        ];
        if let Some(log_home) = o.log_home.clone().or_else(|| path_from_env(LOG_HOME)) {
            args.push(format!(
                "-Dlogback.configurationFile={}",
                log_home.join("logback.xml").display()
            ));
        }
        args.extend(
            o.forks
                .iter()
                .map(|(fork, height)| {
                    format!("-Dblockchain.config.consensusRules.{fork}={height}")
                }),
        );
        args.extend(o.custom_config.iter().map(|(key, value)| format!("-D{key}={value}")));
        args.push(FEDERATE_MAIN_CLASS.to_string());
        args.push("--regtest".to_string());

        ProcessSpec {
            label: self.core.name().to_string(),
            command: java.display().to_string(),
            args,
            ..ProcessSpec::default()
        }
    }

    async fn launch_in(
        &mut self,
        java: &Path,
        jar: &Path,
        config: &Path,
        data_dir: &Path,
    ) -> Result<StartInfo, HarnessError> {
        let ports = self
            .core
            .resolve_ports(&[self.options.p2p_port, self.options.rpc_port])
            .await?;
        let spec = self.command(java, jar, config, ports[0], ports[1], data_dir);
        // Peers connect lazily, only the RPC port says the node is up
        self.core.launch(&spec, &ports[1..]).await
    }
}

#[async_trait]
impl ProcessRunner for FederateRunner {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn start(&mut self) -> Result<StartInfo, HarnessError> {
        self.core.ensure_not_running().await?;
        let java = self.java();
        let jar = self.jar()?;
        let config = self.config_file()?.to_path_buf();

        let data_dir = self.core.prepare_data_dir().await?;
        let started = self.launch_in(&java, &jar, &config, &data_dir).await;
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

    #[test]
    fn test_command_line_carries_forks_and_config() {
        let options = FederateRunnerOptions::builder()
            .signer_classpath(["/opt/signers/hsm.jar"])
            .log_home("/var/log/fed")
            .fork("hop400", 150)
            .fork("arrowhead600", 0)
            .config("federator.enabled", true)
            .config("miner.client.enabled", false)
            .common(CommonOptions::builder().name("federate-1").build().unwrap())
            .build()
            .unwrap();
        let runner = FederateRunner::new(options);
        let spec = runner.command(
            Path::new("/usr/bin/java"),
            Path::new("/opt/powpeg.jar"),
            Path::new("/etc/fed1.conf"),
            30000,
            30001,
            Path::new("/tmp/federate-1-x"),
        );

        assert_eq!(spec.label, "federate-1");
        assert_eq!(spec.command, "/usr/bin/java");
        assert_eq!(
            spec.args,
            vec![
                "-cp",
                "/opt/powpeg.jar:/opt/signers/hsm.jar",
                "-Drsk.conf.file=/etc/fed1.conf",
                "-Ddatabase.dir=/tmp/federate-1-x",
                "-Dpeer.port=30000",
                "-Drpc.providers.web.http.port=30001",
                "-Dlogback.configurationFile=/var/log/fed/logback.xml",
                "-Dblockchain.config.consensusRules.arrowhead600=0",
                "-Dblockchain.config.consensusRules.hop400=150",
                "-Dfederator.enabled=true",
                "-Dminer.client.enabled=false",
                "co.rsk.federate.FederateRunner",
                "--regtest",
            ]
        );
    }

    #[test]
    fn test_fork_setters_merge() {
        let mut base = ForkConfig::new();
        base.insert("fingerroot500".to_string(), 1);
        base.insert("hop400".to_string(), 2);
        let options = FederateRunnerOptions::builder()
            .forks(base)
            .fork("hop400", 9)
            .build()
            .unwrap();
        assert_eq!(options.forks.get("hop400"), Some(&9));
        assert_eq!(options.forks.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_config_file_fails_before_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let options = FederateRunnerOptions::builder()
            .jar("/opt/powpeg.jar")
            .config_file(dir.path().join("missing.conf"))
            .common(CommonOptions::builder().base_data_dir(dir.path()).build().unwrap())
            .build()
            .unwrap();
        let mut runner = FederateRunner::new(options);

        let err = runner.start().await.unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Provisioning { ref reason, .. } if reason.contains("missing.conf")
        ));
        assert!(runner.data_dir().is_none());
        assert!(matches!(runner.node(), Err(HarnessError::NotRunning { .. })));
    }
}
