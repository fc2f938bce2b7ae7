//! Brings up a federate together with the signer it uses.

use crate::context::{RunnerId, TestContext};
use crate::rpc::{RskNode, RskRpcClient};
use crate::runner::{
    FederateRunner, FederateRunnerOptions, HsmRunner, HsmRunnerOptions, ProcessRunner,
    TcpSignerRunner, TcpSignerRunnerOptions,
};
use derive_builder::Builder;
use powpeg_harness_core::{HarnessError, KeyId};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Key types a federate signs with, and the derivation path of each
const SIGNER_KEYS: [(&str, &str); 3] =
    [("BTC", KeyId::BTC), ("RSK", KeyId::RSK), ("MST", KeyId::MST)];

/// Where a federate's keys live
#[derive(Debug, Clone)]
pub enum SignerKind {
    /// Keys read straight from a file by the node
    KeyFile(PathBuf),
    Hsm(HsmRunnerOptions),
    TcpSigner(TcpSignerRunnerOptions),
}

/// How the federate reaches its signer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignerEndpoint {
    KeyFile(PathBuf),
    Remote { host: String, port: u16 },
}

impl SignerEndpoint {
    /// `federator.signers.*` entries for the node config
    pub fn config(&self) -> BTreeMap<String, String> {
        let mut config = BTreeMap::new();
        for (key, key_id) in SIGNER_KEYS {
            let prefix = format!("federator.signers.{key}");
            match self {
                SignerEndpoint::KeyFile(path) => {
                    config.insert(format!("{prefix}.type"), "keyFile".to_string());
                    config.insert(format!("{prefix}.path"), path.display().to_string());
                }
                SignerEndpoint::Remote { host, port } => {
                    config.insert(format!("{prefix}.type"), "hsm".to_string());
                    config.insert(format!("{prefix}.host"), host.clone());
                    config.insert(format!("{prefix}.port"), port.to_string());
                    config.insert(format!("{prefix}.keyId"), key_id.to_string());
                }
            }
        }
        config
    }
}

#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct FederateSpec {
    pub name: String,
    pub signer: SignerKind,
    #[builder(default)]
    pub federate: FederateRunnerOptions,
}

impl FederateSpec {
    pub fn builder() -> FederateSpecBuilder {
        FederateSpecBuilder::default()
    }
}

#[derive(Debug, Clone)]
pub struct StartedFederate {
    pub name: String,
    pub federate: RunnerId,
    pub signer: Option<RunnerId>,
    pub signer_endpoint: SignerEndpoint,
    pub node: RskRpcClient,
}

pub struct FederateStarter;

impl FederateStarter {
    /// Starts the signer `spec` asks for, then the federate wired to it.
    /// The signer stays tracked by `ctx` when the federate fails to come up,
    /// so teardown still reaches it.
    pub async fn start(
        ctx: &mut TestContext,
        spec: FederateSpec,
    ) -> Result<StartedFederate, HarnessError> {
        let (signer, signer_endpoint) = Self::start_signer(ctx, &spec).await?;
        let options = Self::federate_options(ctx, &spec, &signer_endpoint);

        let mut federate = FederateRunner::new(options);
        federate.start().await?;
        let node = federate.node()?;
        ctx.add_federate_node(Arc::new(node.clone()));
        let federate = ctx.track(Box::new(federate));

        info!(federate = %spec.name, endpoint = node.endpoint(), "federate started");
        Ok(StartedFederate {
            name: spec.name,
            federate,
            signer,
            signer_endpoint,
            node,
        })
    }

    /// Starts federates one after another, in order
    pub async fn start_all(
        ctx: &mut TestContext,
        specs: impl IntoIterator<Item = FederateSpec>,
    ) -> Result<Vec<StartedFederate>, HarnessError> {
        let mut started = Vec::new();
        for spec in specs {
            started.push(Self::start(ctx, spec).await?);
        }
        Ok(started)
    }

    async fn start_signer(
        ctx: &mut TestContext,
        spec: &FederateSpec,
    ) -> Result<(Option<RunnerId>, SignerEndpoint), HarnessError> {
        match &spec.signer {
            SignerKind::KeyFile(path) => Ok((None, SignerEndpoint::KeyFile(path.clone()))),
            SignerKind::Hsm(options) => {
                let mut options = options.clone();
                options.exec_env = ctx.env().exec_env;
                options.common.port_allocator = ctx.ports().clone();
                options.common.name.get_or_insert_with(|| format!("hsm-{}", spec.name));

                let mut runner = HsmRunner::new(options)?;
                runner.start().await?;
                let endpoint = Self::remote(runner.host(), runner.port(), runner.name())?;
                Ok((Some(ctx.track(Box::new(runner))), endpoint))
            }
            SignerKind::TcpSigner(options) => {
                let mut options = options.clone();
                options.common.port_allocator = ctx.ports().clone();
                options.common.name.get_or_insert_with(|| format!("tcpsigner-{}", spec.name));

                let mut runner = TcpSignerRunner::new(options);
                runner.start().await?;
                let endpoint = Self::remote(runner.host(), runner.port(), runner.name())?;
                Ok((Some(ctx.track(Box::new(runner))), endpoint))
            }
        }
    }

    fn remote(host: &str, port: Option<u16>, name: &str) -> Result<SignerEndpoint, HarnessError> {
        let port = port.ok_or_else(|| HarnessError::NotRunning {
            resource: name.to_string(),
        })?;
        Ok(SignerEndpoint::Remote {
            host: host.to_string(),
            port,
        })
    }

    /// Federate options with context defaults filled in. Fork heights set in
    /// `spec.federate` win over the context's.
    fn federate_options(
        ctx: &TestContext,
        spec: &FederateSpec,
        signer: &SignerEndpoint,
    ) -> FederateRunnerOptions {
        let mut options = spec.federate.clone();
        let env = ctx.env();
        if options.java.is_none() {
            options.java = env.java_bin_path.clone();
        }
        if options.jar.is_none() {
            options.jar = env.powpeg_node_jar_path.clone();
        }
        if options.log_home.is_none() {
            options.log_home = env.log_home.clone();
        }

        let mut forks = ctx.forks().clone();
        forks.extend(std::mem::take(&mut options.forks));
        options.forks = forks;

        for (key, value) in signer.config() {
            options.custom_config.entry(key).or_insert(value);
        }
        options.common.port_allocator = ctx.ports().clone();
        options.common.name.get_or_insert_with(|| spec.name.clone());
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::HarnessEnv;
    use crate::runner::CommonOptions;

    #[test]
    fn test_key_file_config() {
        let config = SignerEndpoint::KeyFile(PathBuf::from("/keys/fed1.key")).config();
        assert_eq!(config.len(), 6);
        assert_eq!(config["federator.signers.BTC.type"], "keyFile");
        assert_eq!(config["federator.signers.MST.path"], "/keys/fed1.key");
    }

    #[test]
    fn test_remote_config_uses_key_ids() {
        let config = SignerEndpoint::Remote {
            host: "127.0.0.1".to_string(),
            port: 9999,
        }
        .config();
        assert_eq!(config.len(), 12);
        assert_eq!(config["federator.signers.RSK.type"], "hsm");
        assert_eq!(config["federator.signers.RSK.host"], "127.0.0.1");
        assert_eq!(config["federator.signers.RSK.port"], "9999");
        assert_eq!(config["federator.signers.BTC.keyId"], "m/44'/1'/0'/0/0");
        assert_eq!(config["federator.signers.MST.keyId"], "m/44'/1'/2'/0/0");
    }

    #[test]
    fn test_federate_options_merge_context() {
        let env = HarnessEnv {
            java_bin_path: Some(PathBuf::from("/jdk/bin/java")),
            powpeg_node_jar_path: Some(PathBuf::from("/opt/powpeg.jar")),
            ..HarnessEnv::default()
        };
        let mut ctx = TestContext::new(env);
        ctx.forks_mut().insert("hop400".to_string(), 100);
        ctx.forks_mut().insert("lovell700".to_string(), 200);

        let spec = FederateSpec::builder()
            .name("federate-2")
            .signer(SignerKind::KeyFile(PathBuf::from("/keys/fed2.key")))
            .federate(
                FederateRunnerOptions::builder()
                    .fork("lovell700", 5)
                    .config("federator.signers.BTC.path", "/override.key")
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        let signer = SignerEndpoint::KeyFile(PathBuf::from("/keys/fed2.key"));
        let options = FederateStarter::federate_options(&ctx, &spec, &signer);

        assert_eq!(options.java.as_deref(), Some(std::path::Path::new("/jdk/bin/java")));
        assert_eq!(options.jar.as_deref(), Some(std::path::Path::new("/opt/powpeg.jar")));
        assert_eq!(options.forks["hop400"], 100);
        assert_eq!(options.forks["lovell700"], 5);
        assert_eq!(options.custom_config["federator.signers.BTC.path"], "/override.key");
        assert_eq!(options.custom_config["federator.signers.RSK.path"], "/keys/fed2.key");
        assert_eq!(options.common.name.as_deref(), Some("federate-2"));
    }

    #[tokio::test]
    async fn test_failed_signer_leaves_nothing_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = TestContext::new(HarnessEnv::default());
        let spec = FederateSpec::builder()
            .name("federate-1")
            .signer(SignerKind::TcpSigner(
                TcpSignerRunnerOptions::builder()
                    .executable("/nonexistent/tcpsigner")
                    .key_file(dir.path().join("missing.json"))
                    .common(CommonOptions::builder().base_data_dir(dir.path()).build().unwrap())
                    .build()
                    .unwrap(),
            ))
            .build()
            .unwrap();

        let err = FederateStarter::start(&mut ctx, spec).await.unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Provisioning { ref resource, .. } if resource == "tcpsigner-federate-1"
        ));
        assert_eq!(ctx.runner_count(), 0);
        assert!(ctx.federate_nodes().is_empty());
    }
}
