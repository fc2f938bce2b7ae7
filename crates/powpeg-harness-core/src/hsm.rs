//! Line-delimited JSON client for HSM simulators and TCP signers.
//!
//! Each call uses a fresh connection: one request line goes out, one response
//! line comes back, then the socket is closed.

use crate::error::HarnessError;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::debug;

pub const DEFAULT_HSM_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RESPONSE_LINE: usize = 1024 * 1024;

/// Derivation paths of the three federator keys
pub struct KeyId;

impl KeyId {
    pub const BTC: &'static str = "m/44'/1'/0'/0/0";
    pub const RSK: &'static str = "m/44'/1'/1'/0/0";
    pub const MST: &'static str = "m/44'/1'/2'/0/0";
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum HsmCommand {
    Version,
    #[serde(rename_all = "camelCase")]
    GetPubKey { version: u32, key_id: String },
    BlockchainState { version: u32 },
}

impl HsmCommand {
    pub fn name(&self) -> &'static str {
        match self {
            HsmCommand::Version => "version",
            HsmCommand::GetPubKey { .. } => "getPubKey",
            HsmCommand::BlockchainState { .. } => "blockchainState",
        }
    }
}

/// Chain-sync status reported by a stateful signer
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BlockchainState {
    #[serde(default)]
    pub best_block: Option<String>,
    #[serde(default)]
    pub newest_valid_block: Option<String>,
    #[serde(default)]
    pub updating: Option<Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerPublicKeys {
    pub btc: String,
    pub rsk: String,
    pub mst: String,
}

#[derive(Debug, Clone)]
pub struct HsmClient {
    host: String,
    port: u16,
    timeout: Duration,
}

impl HsmClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: DEFAULT_HSM_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Sends one command and returns the full response object once its
    /// `errorcode` is zero.
    pub async fn send(&self, command: &HsmCommand) -> Result<Value, HarnessError> {
        let name = command.name();
        let response = tokio::time::timeout(self.timeout, self.round_trip(command))
            .await
            .map_err(|_| HarnessError::Timeout {
                operation: format!("{name} on {}", self.endpoint()),
                after: self.timeout,
            })??;

        let code = response
            .get("errorcode")
            .and_then(Value::as_i64)
            .ok_or_else(|| HarnessError::MalformedResponse {
                command: name.to_string(),
                reason: format!("missing errorcode in {response}"),
            })?;
        if code != 0 {
            return Err(HarnessError::Protocol {
                command: name.to_string(),
                code,
            });
        }
        Ok(response)
    }

    async fn round_trip(&self, command: &HsmCommand) -> Result<Value, HarnessError> {
        let name = command.name();
        let transport = |source| HarnessError::Transport {
            resource: self.endpoint(),
            source,
        };

        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(transport)?;
        let (read, mut write) = stream.into_split();

        let mut line = serde_json::to_string(command).map_err(anyhow::Error::from)?;
        debug!(endpoint = %self.endpoint(), request = %line, "sending HSM command");
        line.push('\n');
        write.write_all(line.as_bytes()).await.map_err(transport)?;
        write.flush().await.map_err(transport)?;

        let mut frames =
            FramedRead::new(read, LinesCodec::new_with_max_length(MAX_RESPONSE_LINE));
        let reply = match frames.next().await {
            Some(Ok(reply)) => reply,
            Some(Err(e)) => {
                return Err(HarnessError::MalformedResponse {
                    command: name.to_string(),
                    reason: e.to_string(),
                });
            }
            None => {
                return Err(HarnessError::MalformedResponse {
                    command: name.to_string(),
                    reason: "connection closed before a response line".to_string(),
                });
            }
        };
        debug!(endpoint = %self.endpoint(), response = %reply, "received HSM response");

        serde_json::from_str(&reply).map_err(|e| HarnessError::MalformedResponse {
            command: name.to_string(),
            reason: e.to_string(),
        })
    }

    fn field<'a>(
        response: &'a Value,
        command: &str,
        field: &str,
    ) -> Result<&'a Value, HarnessError> {
        response
            .get(field)
            .ok_or_else(|| HarnessError::MalformedResponse {
                command: command.to_string(),
                reason: format!("missing {field}"),
            })
    }

    pub async fn version(&self) -> Result<u32, HarnessError> {
        let response = self.send(&HsmCommand::Version).await?;
        Self::field(&response, "version", "version")?
            .as_u64()
            .map(|v| v as u32)
            .ok_or_else(|| HarnessError::MalformedResponse {
                command: "version".to_string(),
                reason: "version is not a number".to_string(),
            })
    }

    pub async fn get_public_key(&self, version: u32, key_id: &str) -> Result<String, HarnessError> {
        let response = self
            .send(&HsmCommand::GetPubKey {
                version,
                key_id: key_id.to_string(),
            })
            .await?;
        Self::field(&response, "getPubKey", "pubKey")?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| HarnessError::MalformedResponse {
                command: "getPubKey".to_string(),
                reason: "pubKey is not a string".to_string(),
            })
    }

    pub async fn get_public_keys(&self, version: u32) -> Result<SignerPublicKeys, HarnessError> {
        Ok(SignerPublicKeys {
            btc: self.get_public_key(version, KeyId::BTC).await?,
            rsk: self.get_public_key(version, KeyId::RSK).await?,
            mst: self.get_public_key(version, KeyId::MST).await?,
        })
    }

    pub async fn blockchain_state(&self, version: u32) -> Result<BlockchainState, HarnessError> {
        let response = self.send(&HsmCommand::BlockchainState { version }).await?;
        let state = Self::field(&response, "blockchainState", "state")?.clone();
        serde_json::from_value(state).map_err(|e| HarnessError::MalformedResponse {
            command: "blockchainState".to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    /// Serves `connections` requests, answering each with `respond(request)`.
    async fn fake_signer<F>(
        connections: usize,
        respond: F,
    ) -> (u16, tokio::task::JoinHandle<Vec<Value>>)
    where
        F: Fn(&Value) -> String + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..connections {
                let (socket, _) = listener.accept().await.unwrap();
                let (read, mut write) = socket.into_split();
                let mut line = String::new();
                BufReader::new(read).read_line(&mut line).await.unwrap();
                let request: Value = serde_json::from_str(line.trim()).unwrap();
                let reply = respond(&request);
                write.write_all(reply.as_bytes()).await.unwrap();
                seen.push(request);
            }
            seen
        });
        (port, handle)
    }

    #[test]
    fn test_command_encoding() {
        let encoded = serde_json::to_value(HsmCommand::GetPubKey {
            version: 2,
            key_id: KeyId::BTC.to_string(),
        })
        .unwrap();
        assert_eq!(
            encoded,
            json!({"command": "getPubKey", "version": 2, "keyId": "m/44'/1'/0'/0/0"})
        );
        assert_eq!(
            serde_json::to_value(HsmCommand::Version).unwrap(),
            json!({"command": "version"})
        );
        assert_eq!(
            serde_json::to_value(HsmCommand::BlockchainState { version: 3 }).unwrap(),
            json!({"command": "blockchainState", "version": 3})
        );
    }

    #[tokio::test]
    async fn test_version_round_trip() {
        let (port, server) =
            fake_signer(1, |_| "{\"errorcode\":0,\"version\":3}\n".to_string()).await;
        let client = HsmClient::new("127.0.0.1", port);
        assert_eq!(client.version().await.unwrap(), 3);
        let seen = server.await.unwrap();
        assert_eq!(seen[0]["command"], "version");
    }

    #[tokio::test]
    async fn test_public_keys_use_all_key_ids() {
        let (port, server) = fake_signer(3, |request| {
            let key = match request["keyId"].as_str().unwrap() {
                KeyId::BTC => "02aa",
                KeyId::RSK => "02bb",
                _ => "02cc",
            };
            format!("{{\"errorcode\":0,\"pubKey\":\"{key}\"}}\n")
        })
        .await;

        let keys = HsmClient::new("127.0.0.1", port)
            .get_public_keys(2)
            .await
            .unwrap();
        assert_eq!(
            keys,
            SignerPublicKeys {
                btc: "02aa".into(),
                rsk: "02bb".into(),
                mst: "02cc".into()
            }
        );
        assert_eq!(server.await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_nonzero_errorcode_is_protocol_error() {
        let (port, _server) = fake_signer(1, |_| "{\"errorcode\":-301}\n".to_string()).await;
        let result = HsmClient::new("127.0.0.1", port)
            .get_public_key(2, KeyId::MST)
            .await;
        assert!(matches!(
            result,
            Err(HarnessError::Protocol { code: -301, ref command }) if command == "getPubKey"
        ));
    }

    #[tokio::test]
    async fn test_truncated_json_is_malformed() {
        let (port, _server) = fake_signer(1, |_| "{\"errorcode\":0,\"ver".to_string()).await;
        let result = HsmClient::new("127.0.0.1", port).version().await;
        assert!(matches!(result, Err(HarnessError::MalformedResponse { .. })));
    }

    #[tokio::test]
    async fn test_blockchain_state_unwraps_state() {
        let (port, _server) = fake_signer(1, |_| {
            json!({
                "errorcode": 0,
                "state": {
                    "best_block": "0xbb",
                    "newest_valid_block": "0xcc",
                    "updating": {"in_progress": false}
                }
            })
            .to_string()
                + "\n"
        })
        .await;

        let state = HsmClient::new("127.0.0.1", port)
            .blockchain_state(3)
            .await
            .unwrap();
        assert_eq!(state.best_block.as_deref(), Some("0xbb"));
        assert_eq!(state.newest_valid_block.as_deref(), Some("0xcc"));
        assert!(state.updating.is_some());
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let result = HsmClient::new("127.0.0.1", port)
            .with_timeout(Duration::from_millis(100))
            .version()
            .await;
        assert!(matches!(result, Err(HarnessError::Timeout { .. })));
    }
}
