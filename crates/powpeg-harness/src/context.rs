//! Per-test state: environment, port allocator, fork heights, known hosts
//! and every runner started for the test.

use crate::env::HarnessEnv;
use crate::release::{ReleaseDriver, ReleaseOptions};
use crate::rpc::{BitcoinRpcClient, Bridge, NodeHandle};
use crate::runner::{BitcoinRunner, BitcoinRunnerOptions, ForkConfig, ProcessRunner};
use crate::sync::{SyncCoordinator, SyncOptions};
use powpeg_harness_core::{HarnessError, PortAllocator};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Position of a runner in its context, in start order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunnerId(usize);

/// Endpoints tests talk to
#[derive(Clone, Default)]
pub struct Hosts {
    pub bitcoin: Option<BitcoinRpcClient>,
    pub federates: Vec<NodeHandle>,
}

pub struct TestContext {
    env: HarnessEnv,
    ports: PortAllocator,
    forks: ForkConfig,
    hosts: Hosts,
    runners: Vec<Box<dyn ProcessRunner>>,
}

impl TestContext {
    pub fn new(env: HarnessEnv) -> Self {
        Self {
            env,
            ports: PortAllocator::default(),
            forks: ForkConfig::new(),
            hosts: Hosts::default(),
            runners: Vec::new(),
        }
    }

    pub fn from_env() -> Result<Self, HarnessError> {
        Ok(Self::new(HarnessEnv::from_env()?))
    }

    pub fn env(&self) -> &HarnessEnv {
        &self.env
    }

    /// Allocator shared by every runner this context starts
    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn with_ports(mut self, ports: PortAllocator) -> Self {
        self.ports = ports;
        self
    }

    pub fn forks(&self) -> &ForkConfig {
        &self.forks
    }

    pub fn forks_mut(&mut self) -> &mut ForkConfig {
        &mut self.forks
    }

    pub fn hosts(&self) -> &Hosts {
        &self.hosts
    }

    pub fn set_bitcoin(&mut self, client: BitcoinRpcClient) {
        debug!(endpoint = client.endpoint(), "bitcoin host set");
        self.hosts.bitcoin = Some(client);
    }

    pub fn bitcoin(&self) -> Result<&BitcoinRpcClient, HarnessError> {
        self.hosts.bitcoin.as_ref().ok_or_else(|| HarnessError::NotRunning {
            resource: "bitcoind".to_string(),
        })
    }

    pub fn add_federate_node(&mut self, node: NodeHandle) {
        debug!(endpoint = node.endpoint(), "federate node added");
        self.hosts.federates.push(node);
    }

    pub fn federate_nodes(&self) -> &[NodeHandle] {
        &self.hosts.federates
    }

    pub fn sync(&self) -> SyncCoordinator {
        SyncCoordinator::new(SyncOptions::from(&self.env))
    }

    /// Release driver over every federate node and the context's bitcoind
    pub fn release_driver(
        &self,
        bridge: Arc<dyn Bridge>,
        options: ReleaseOptions,
    ) -> Result<ReleaseDriver, HarnessError> {
        let bitcoin = Arc::new(self.bitcoin()?.clone());
        Ok(ReleaseDriver::new(
            self.hosts.federates.clone(),
            bridge,
            bitcoin,
            self.sync(),
            options,
        ))
    }

    /// Registers a runner so `teardown` stops it
    pub fn track(&mut self, runner: Box<dyn ProcessRunner>) -> RunnerId {
        debug!(runner = runner.name(), "tracking runner");
        self.runners.push(runner);
        RunnerId(self.runners.len() - 1)
    }

    pub fn runner(&self, id: RunnerId) -> Option<&dyn ProcessRunner> {
        self.runners.get(id.0).map(|runner| runner.as_ref())
    }

    pub fn runner_mut(&mut self, id: RunnerId) -> Option<&mut (dyn ProcessRunner + 'static)> {
        self.runners.get_mut(id.0).map(|runner| runner.as_mut())
    }

    pub fn runner_count(&self) -> usize {
        self.runners.len()
    }

    /// Starts bitcoind on the context's allocator and makes it the bitcoin host
    pub async fn start_bitcoin(
        &mut self,
        mut options: BitcoinRunnerOptions,
    ) -> Result<RunnerId, HarnessError> {
        if options.bitcoind.is_none() {
            options.bitcoind = self.env.bitcoind_bin_path.clone();
        }
        options.common.port_allocator = self.ports.clone();

        let mut runner = BitcoinRunner::new(options);
        runner.start().await?;
        let client = runner.rpc_client()?;
        self.set_bitcoin(client);
        Ok(self.track(Box::new(runner)))
    }

    /// Stops every running runner, newest first. Failures are logged and the
    /// rest still get stopped; the first one is returned.
    pub async fn teardown(&mut self) -> Result<(), HarnessError> {
        let mut first_error = None;
        while let Some(mut runner) = self.runners.pop() {
            if !runner.is_running().await {
                debug!(runner = runner.name(), "already stopped");
                continue;
            }
            match runner.stop().await {
                Ok(()) => info!(runner = runner.name(), "stopped"),
                Err(e) => {
                    warn!(runner = runner.name(), error = %e, "failed to stop runner");
                    first_error.get_or_insert(e);
                }
            }
        }
        self.hosts = Hosts::default();
        first_error.map_or(Ok(()), Err)
    }
}
