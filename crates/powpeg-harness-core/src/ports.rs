use crate::error::HarnessError;
use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

pub const DEFAULT_PORT_RANGE: RangeInclusive<u16> = 30000..=39999;
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_millis(200);

/// Returns `true` if something on `host` accepts a connection on `port`
/// within `timeout`.
async fn port_in_use(host: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

/// Scans `range_start..=range_end` in ascending order and collects up to
/// `count` ports that refuse (or time out on) a TCP connect.
///
/// The result is shorter than `count` when the range runs out. Ports are
/// only free at scan time; nothing holds them until a child process binds.
pub async fn find_free_ports(
    range_start: u16,
    range_end: u16,
    count: usize,
    host: &str,
    timeout: Duration,
) -> Vec<u16> {
    find_free_ports_excluding(range_start, range_end, count, host, timeout, &BTreeSet::new())
        .await
}

async fn find_free_ports_excluding(
    range_start: u16,
    range_end: u16,
    count: usize,
    host: &str,
    timeout: Duration,
    excluded: &BTreeSet<u16>,
) -> Vec<u16> {
    let mut found = Vec::with_capacity(count);
    if count == 0 || range_start > range_end {
        return found;
    }

    for port in range_start..=range_end {
        if excluded.contains(&port) {
            continue;
        }
        if port_in_use(host, port, timeout).await {
            debug!(host, port, "port in use");
            continue;
        }
        found.push(port);
        if found.len() == count {
            break;
        }
    }
    found
}

/// Hands out ports from a scan range and remembers which ones are leased, so
/// two runners in the same process never receive the same port.
///
/// Other processes on the host can still take a port between the scan and
/// the child's bind.
#[derive(Clone, Debug)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    timeout: Duration,
    leased: Arc<Mutex<BTreeSet<u16>>>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::with_range(*DEFAULT_PORT_RANGE.start(), *DEFAULT_PORT_RANGE.end())
    }
}

impl PortAllocator {
    pub fn with_range(start: u16, end: u16) -> Self {
        Self {
            range: start..=end,
            timeout: DEFAULT_SCAN_TIMEOUT,
            leased: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn range(&self) -> RangeInclusive<u16> {
        self.range.clone()
    }

    /// Finds `count` free ports on `host` and leases them until the returned
    /// [`PortLease`] is released or dropped.
    pub async fn reserve(&self, host: &str, count: usize) -> Result<PortLease, HarnessError> {
        let excluded = self.snapshot();
        let mut ports = find_free_ports_excluding(
            *self.range.start(),
            *self.range.end(),
            count,
            host,
            self.timeout,
            &excluded,
        )
        .await;

        {
            let mut leased = self.leased.lock().unwrap_or_else(PoisonError::into_inner);
            // Another reservation may have raced us while scanning.
            ports.retain(|port| leased.insert(*port));
        }

        if ports.len() < count {
            let found = ports.len();
            self.give_back(&ports);
            return Err(HarnessError::PortsExhausted {
                host: host.to_string(),
                range_start: *self.range.start(),
                range_end: *self.range.end(),
                requested: count,
                found,
            });
        }

        info!(host, ports = ?ports, "reserved ports");
        Ok(PortLease {
            ports,
            allocator: Some(self.clone()),
        })
    }

    /// Ports currently leased by this allocator
    pub fn leased(&self) -> Vec<u16> {
        self.snapshot().into_iter().collect()
    }

    fn snapshot(&self) -> BTreeSet<u16> {
        self.leased
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn give_back(&self, ports: &[u16]) {
        let mut leased = self.leased.lock().unwrap_or_else(PoisonError::into_inner);
        for port in ports {
            leased.remove(port);
        }
    }
}

/// A set of distinct ports bound to one runner
#[derive(Debug)]
pub struct PortLease {
    ports: Vec<u16>,
    allocator: Option<PortAllocator>,
}

impl PortLease {
    /// A lease over ports the caller chose explicitly; releasing it is a no-op.
    pub fn fixed(ports: Vec<u16>) -> Self {
        Self {
            ports,
            allocator: None,
        }
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    pub fn port(&self, index: usize) -> Option<u16> {
        self.ports.get(index).copied()
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            debug!(ports = ?self.ports, "releasing ports");
            allocator.give_back(&self.ports);
        }
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}
