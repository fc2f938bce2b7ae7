use std::time::Duration;
use thiserror::Error;

/// Error types for harness operations.
///
/// Every variant carries the resource it concerns so a failing test can be
/// traced back to a specific runner, node or phase.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("{resource} is already running")]
    AlreadyRunning { resource: String },

    #[error("{resource} is not running")]
    NotRunning { resource: String },

    #[error("cannot provision {resource}: {reason}")]
    Provisioning { resource: String, reason: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(
        "found {found} of {requested} free ports on {host} in range {range_start}..={range_end}"
    )]
    PortsExhausted {
        host: String,
        range_start: u16,
        range_end: u16,
        requested: usize,
        found: usize,
    },

    #[error("{host}:{port} did not accept connections after {attempts} attempts: {source}")]
    ReadinessTimeout {
        host: String,
        port: u16,
        attempts: usize,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "{node} stalled at block {last_seen} while waiting for block {target} \
         ({attempts} attempts without progress)"
    )]
    SyncStall {
        node: String,
        last_seen: u64,
        target: u64,
        attempts: u32,
    },

    #[error("{command} failed with errorcode {code}")]
    Protocol { command: String, code: i64 },

    #[error("malformed response to {command}: {reason}")]
    MalformedResponse { command: String, reason: String },

    #[error("transport error talking to {resource}: {source}")]
    Transport {
        resource: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("{operation} did not succeed after {attempts} attempts")]
    RetryExhausted { operation: String, attempts: u32 },

    #[error("release stalled in phase {phase} after {attempts} attempts")]
    ReleaseStalled { phase: String, attempts: u32 },

    #[error("rpc {method} on {endpoint} failed: {reason}")]
    Rpc {
        endpoint: String,
        method: String,
        reason: String,
    },

    /// The server answered with a JSON-RPC error object
    #[error("rpc {method} on {endpoint} rejected with error {code}: {message}")]
    RpcRejected {
        endpoint: String,
        method: String,
        code: i64,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HarnessError {
    pub fn provisioning(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        HarnessError::Provisioning {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    pub fn rpc(
        endpoint: impl Into<String>,
        method: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        HarnessError::Rpc {
            endpoint: endpoint.into(),
            method: method.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HarnessError::Transport { .. }
                | HarnessError::Timeout { .. }
                | HarnessError::Rpc { .. }
                | HarnessError::Io(_)
        )
    }

    /// Check if this error indicates a permanent failure
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            HarnessError::AlreadyRunning { .. }
                | HarnessError::NotRunning { .. }
                | HarnessError::Provisioning { .. }
                | HarnessError::InvalidArgument(_)
                | HarnessError::PortsExhausted { .. }
                | HarnessError::Protocol { .. }
                | HarnessError::RpcRejected { .. }
        )
    }
}
