use super::{CommonOptions, ProcessRunner, RunnerCore, StartInfo, StopMode};
use crate::env::{BITCOIND_BIN_PATH, path_from_env};
use crate::rpc::BitcoinRpcClient;
use async_trait::async_trait;
use derive_builder::Builder;
use powpeg_harness_core::{HarnessError, ProcessId, ProcessSpec, StopSignal};
use std::path::{Path, PathBuf};

/// Options for a regtest bitcoind
#[derive(Debug, Clone, Builder)]
#[builder(setter(into, strip_option), default)]
pub struct BitcoinRunnerOptions {
    /// bitcoind binary; `BITCOIND_BIN_PATH` when unset
    pub bitcoind: Option<PathBuf>,
    pub rpc_user: String,
    pub rpc_password: String,
    pub p2p_port: Option<u16>,
    pub rpc_port: Option<u16>,
    #[builder(setter(custom))]
    pub extra_args: Vec<String>,
    pub common: CommonOptions,
}

impl Default for BitcoinRunnerOptions {
    fn default() -> Self {
        Self {
            bitcoind: None,
            rpc_user: "test".to_string(),
            rpc_password: "test".to_string(),
            p2p_port: None,
            rpc_port: None,
            extra_args: Vec::new(),
            common: CommonOptions::default(),
        }
    }
}

impl BitcoinRunnerOptions {
    pub fn builder() -> BitcoinRunnerOptionsBuilder {
        BitcoinRunnerOptionsBuilder::default()
    }
}

impl BitcoinRunnerOptionsBuilder {
    pub fn extra_args<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        self.extra_args = Some(iter.into_iter().map(|s| s.to_string()).collect());
        self
    }
}

pub struct BitcoinRunner {
    options: BitcoinRunnerOptions,
    core: RunnerCore,
}

impl BitcoinRunner {
    pub fn new(options: BitcoinRunnerOptions) -> Self {
        let core = RunnerCore::new(
            "bitcoind",
            options.common.clone(),
            StopMode::Signal(StopSignal::Graceful),
        );
        Self { options, core }
    }

    pub fn options(&self) -> &BitcoinRunnerOptions {
        &self.options
    }

    pub fn command(
        &self,
        bitcoind: &Path,
        p2p_port: u16,
        rpc_port: u16,
        data_dir: &Path,
    ) -> ProcessSpec {
        let o = &self.options;
        let mut args = vec![
            "-regtest".to_string(),
            "-txindex".to_string(),
            "-server".to_string(),
            format!("-rpcuser={}", o.rpc_user),
            format!("-rpcpassword={}", o.rpc_password),
            format!("-port={p2p_port}"),
            format!("-rpcport={rpc_port}"),
            format!("-datadir={}", data_dir.display()),
            "-printtoconsole".to_string(),
        ];
        args.extend(o.extra_args.iter().cloned());

        ProcessSpec {
            label: self.core.name().to_string(),
            command: bitcoind.display().to_string(),
            args,
            ..ProcessSpec::default()
        }
    }

    pub fn p2p_port(&self) -> Option<u16> {
        self.core.ports().first().copied()
    }

    pub fn rpc_port(&self) -> Option<u16> {
        self.core.ports().get(1).copied()
    }

    /// JSON-RPC client for the running daemon
    pub fn rpc_client(&self) -> Result<BitcoinRpcClient, HarnessError> {
        let port = self.rpc_port().ok_or_else(|| self.core.not_running())?;
        Ok(BitcoinRpcClient::new(
            format!("http://{}:{port}", self.core.host()),
            &self.options.rpc_user,
            &self.options.rpc_password,
        ))
    }

    async fn launch_in(
        &mut self,
        bitcoind: &Path,
        data_dir: &Path,
    ) -> Result<StartInfo, HarnessError> {
        let ports = self
            .core
            .resolve_ports(&[self.options.p2p_port, self.options.rpc_port])
            .await?;
        let spec = self.command(bitcoind, ports[0], ports[1], data_dir);
        self.core.launch(&spec, &ports).await
    }
}

#[async_trait]
impl ProcessRunner for BitcoinRunner {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn start(&mut self) -> Result<StartInfo, HarnessError> {
        self.core.ensure_not_running().await?;
        let bitcoind = self
            .options
            .bitcoind
            .clone()
            .or_else(|| path_from_env(BITCOIND_BIN_PATH))
            .ok_or_else(|| self.core.provisioning(format!("{BITCOIND_BIN_PATH} is not set")))?;

        let data_dir = self.core.prepare_data_dir().await?;
        let started = self.launch_in(&bitcoind, &data_dir).await;
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
