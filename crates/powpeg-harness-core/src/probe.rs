use crate::error::HarnessError;
use backon::{ConstantBuilder, Retryable};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Bounds for [`wait_for_ports`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeOptions {
    /// Connection attempts per endpoint
    pub num_retries: usize,
    pub retry_interval: Duration,
    /// Timeout for a single connect attempt
    pub connect_timeout: Duration,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            num_retries: 60,
            retry_interval: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(1),
        }
    }
}

impl ProbeOptions {
    pub fn new(num_retries: usize, retry_interval: Duration) -> Self {
        Self {
            num_retries,
            retry_interval,
            ..Default::default()
        }
    }
}

async fn connect_once(host: &str, port: u16, timeout: Duration) -> std::io::Result<()> {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("connect to {host}:{port} timed out"),
        )),
    }
}

/// Blocks until every `(host, port)` pair accepts a TCP connection.
///
/// Endpoints are probed one after another, each with its own retry budget.
/// The first endpoint to run out of retries fails the whole call.
pub async fn wait_for_ports(
    endpoints: &[(String, u16)],
    options: ProbeOptions,
) -> Result<(), HarnessError> {
    for (host, port) in endpoints {
        wait_for_port(host, *port, options).await?;
    }
    Ok(())
}

pub async fn wait_for_port(
    host: &str,
    port: u16,
    options: ProbeOptions,
) -> Result<(), HarnessError> {
    info!(
        "Waiting for {}:{} (max {} attempts, {:?} interval)",
        host, port, options.num_retries, options.retry_interval
    );

    let attempts = AtomicUsize::new(0);
    let poll = ConstantBuilder::default()
        .with_delay(options.retry_interval)
        .with_max_times(options.num_retries.saturating_sub(1));

    (|| {
        attempts.fetch_add(1, Ordering::Relaxed);
        connect_once(host, port, options.connect_timeout)
    })
    .retry(poll)
    .notify(|e, _| debug!(host, port, error = %e, "endpoint not ready yet"))
    .await
    .map_err(|source| HarnessError::ReadinessTimeout {
        host: host.to_string(),
        port,
        attempts: attempts.load(Ordering::Relaxed),
        source,
    })?;

    info!("{}:{} is accepting connections", host, port);
    Ok(())
}
