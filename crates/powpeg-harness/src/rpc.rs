//! JSON-RPC handles for the chains the harness drives, plus the bridge seam.

use async_trait::async_trait;
use powpeg_harness_core::HarnessError;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);
const HARNESS_WALLET: &str = "harness";
/// bitcoind: "No wallet is loaded"
const RPC_WALLET_NOT_FOUND: i64 = -18;

/// A remote RSK node. Holding one does not own the process behind it.
#[async_trait]
pub trait RskNode: Send + Sync {
    fn endpoint(&self) -> &str;

    async fn block_number(&self) -> Result<u64, HarnessError>;

    async fn mine(&self, blocks: u32) -> Result<(), HarnessError>;
}

/// Shared, lookup-only reference to an RSK node
pub type NodeHandle = Arc<dyn RskNode>;

/// The bitcoind side of a release
#[async_trait]
pub trait BitcoinChain: Send + Sync {
    async fn mempool_txids(&self) -> Result<Vec<String>, HarnessError>;

    /// Mines `blocks` blocks and returns their hashes
    async fn mine(&self, blocks: u32) -> Result<Vec<String>, HarnessError>;
}

/// Bridge state as seen through RPC. Decoding the bridge ABI is left to
/// the implementor.
#[async_trait]
pub trait Bridge: Send + Sync {
    async fn next_pegout_creation_height(&self) -> Result<u64, HarnessError>;

    async fn queued_pegouts_count(&self) -> Result<u64, HarnessError>;

    async fn pending_signatures_count(&self) -> Result<u64, HarnessError>;

    async fn update_collections(&self) -> Result<(), HarnessError>;
}

#[derive(Debug)]
enum CallError {
    /// The server answered with a JSON-RPC error object
    Remote { code: i64, message: String },
    Local(HarnessError),
}

impl CallError {
    fn into_harness(self, endpoint: &str, method: &str) -> HarnessError {
        match self {
            CallError::Remote { code, message } => HarnessError::RpcRejected {
                endpoint: endpoint.to_string(),
                method: method.to_string(),
                code,
                message,
            },
            CallError::Local(e) => e,
        }
    }
}

#[derive(Debug, Clone)]
struct JsonRpc {
    url: String,
    auth: Option<(String, String)>,
    version: &'static str,
    http: reqwest::Client,
    ids: Arc<AtomicU64>,
}

impl JsonRpc {
    fn new(url: String, auth: Option<(String, String)>, version: &'static str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_RPC_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            url,
            auth,
            version,
            http,
            ids: Arc::new(AtomicU64::new(1)),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, HarnessError> {
        self.call_raw(method, params)
            .await
            .map_err(|e| e.into_harness(&self.url, method))
    }

    async fn call_raw<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, CallError> {
        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        debug!(url = %self.url, method, %params, "rpc call");

        let mut request = self.http.post(&self.url).json(&json!({
            "jsonrpc": self.version,
            "id": id,
            "method": method,
            "params": params,
        }));
        if let Some((user, password)) = &self.auth {
            request = request.basic_auth(user, Some(password));
        }

        let local = |reason: String| CallError::Local(HarnessError::rpc(&self.url, method, reason));
        let response = request.send().await.map_err(|e| local(e.to_string()))?;
        let status = response.status();
        // bitcoind reports RPC errors with a 500 and a JSON body, so parse first
        let body: Value = response
            .json()
            .await
            .map_err(|e| local(format!("HTTP {status}: {e}")))?;

        if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
            return Err(CallError::Remote {
                code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            });
        }
        let result = body.get("result").cloned().unwrap_or(Value::Null);
        serde_json::from_value(result).map_err(|e| local(format!("unexpected result: {e}")))
    }
}

/// HTTP JSON-RPC client for an RSK (federate) node
#[derive(Debug, Clone)]
pub struct RskRpcClient {
    rpc: JsonRpc,
}

impl RskRpcClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            rpc: JsonRpc::new(url.into(), None, "2.0"),
        }
    }

    pub fn local(host: &str, rpc_port: u16) -> Self {
        Self::new(format!("http://{host}:{rpc_port}"))
    }

    /// Raw passthrough for calls the typed surface does not cover
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, HarnessError> {
        self.rpc.call(method, params).await
    }
}

#[async_trait]
impl RskNode for RskRpcClient {
    fn endpoint(&self) -> &str {
        &self.rpc.url
    }

    async fn block_number(&self) -> Result<u64, HarnessError> {
        let hex: String = self.rpc.call("eth_blockNumber", json!([])).await?;
        parse_quantity(&hex).ok_or_else(|| {
            HarnessError::rpc(&self.rpc.url, "eth_blockNumber", format!("bad quantity {hex:?}"))
        })
    }

    async fn mine(&self, blocks: u32) -> Result<(), HarnessError> {
        for _ in 0..blocks {
            let _: Value = self.rpc.call("evm_mine", json!([])).await?;
        }
        debug!(endpoint = %self.rpc.url, blocks, "mined rsk blocks");
        Ok(())
    }
}

fn parse_quantity(hex: &str) -> Option<u64> {
    let digits = hex.strip_prefix("0x").unwrap_or(hex);
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

/// bitcoind JSON-RPC client using basic auth
#[derive(Debug, Clone)]
pub struct BitcoinRpcClient {
    rpc: JsonRpc,
    mining_address: Arc<OnceCell<String>>,
}

impl BitcoinRpcClient {
    pub fn new(
        url: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            rpc: JsonRpc::new(url.into(), Some((user.into(), password.into())), "1.0"),
            mining_address: Arc::new(OnceCell::new()),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.rpc.url
    }

    pub async fn block_count(&self) -> Result<u64, HarnessError> {
        self.rpc.call("getblockcount", json!([])).await
    }

    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, HarnessError> {
        self.rpc.call(method, params).await
    }

    /// Address that receives coinbase outputs, created on first use.
    ///
    /// A bitcoind without a loaded wallet gets one named `harness`.
    pub async fn mining_address(&self) -> Result<String, HarnessError> {
        self.mining_address
            .get_or_try_init(|| self.fetch_mining_address())
            .await
            .cloned()
    }

    async fn fetch_mining_address(&self) -> Result<String, HarnessError> {
        match self.rpc.call_raw("getnewaddress", json!([])).await {
            Ok(address) => Ok(address),
            Err(CallError::Remote { code: RPC_WALLET_NOT_FOUND, .. }) => {
                info!(endpoint = %self.rpc.url, "no wallet loaded, creating {}", HARNESS_WALLET);
                let _: Value = self.rpc.call("createwallet", json!([HARNESS_WALLET])).await?;
                self.rpc.call("getnewaddress", json!([])).await
            }
            Err(e) => Err(e.into_harness(&self.rpc.url, "getnewaddress")),
        }
    }
}

#[async_trait]
impl BitcoinChain for BitcoinRpcClient {
    async fn mempool_txids(&self) -> Result<Vec<String>, HarnessError> {
        self.rpc.call("getrawmempool", json!([])).await
    }

    async fn mine(&self, blocks: u32) -> Result<Vec<String>, HarnessError> {
        let address = self.mining_address().await?;
        let hashes: Vec<String> = self
            .rpc
            .call("generatetoaddress", json!([blocks, address]))
            .await?;
        debug!(endpoint = %self.rpc.url, blocks, "mined bitcoin blocks");
        Ok(hashes)
    }
}
