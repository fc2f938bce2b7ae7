//! Orchestration for powpeg bridge integration tests: supervised bitcoind,
//! federate and signer processes, block-height sync across nodes, and a
//! driver that pushes a release through the bridge.

pub mod context;
pub mod env;
mod factory;
pub mod release;
pub mod rpc;
pub mod runner;
pub mod starter;
pub mod sync;

pub use context::{Hosts, RunnerId, TestContext};
pub use env::{ExecEnv, HarnessEnv};
pub use factory::{PlatformProcessHandle, PlatformProcessManager, PlatformProcessManagerFactory};
pub use release::{
    NoopObserver, ReleaseCheckpoint, ReleaseDriver, ReleaseObserver, ReleaseOptions, ReleasePhase,
    ReleaseReport,
};
pub use rpc::{BitcoinChain, BitcoinRpcClient, Bridge, NodeHandle, RskNode, RskRpcClient};
pub use runner::{CommonOptions, CommonOptionsBuilder, ProcessRunner, StartInfo};
pub use starter::{
    FederateSpec, FederateSpecBuilder, FederateStarter, SignerEndpoint, SignerKind, StartedFederate,
};
pub use sync::{SyncCoordinator, SyncOptions};

// Re-export core functionality
pub use powpeg_harness_core::*;
