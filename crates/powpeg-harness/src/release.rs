//! Drives a queued pegout through the bridge release lifecycle.
//!
//! The bridge state is never touched directly. The driver mines blocks on
//! both chains, asks the bridge to refresh its collections and polls until
//! the next phase is observable.

use crate::rpc::{BitcoinChain, Bridge, NodeHandle};
use crate::sync::SyncCoordinator;
use async_trait::async_trait;
use powpeg_harness_core::{HarnessError, RetryOutcome, RetryPolicy, retry_with_check};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Boundaries at which an observer is notified, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReleasePhase {
    /// The queued request was bundled into a release transaction
    PegoutCreated,
    /// The release transaction has its RSK confirmations
    PegoutConfirmed,
    /// Federators finished signing and the transaction was broadcast
    ReleaseSigned,
    /// Bitcoin confirmed the payout and the change came back as a peg-in
    Settled,
}

impl ReleasePhase {
    pub const ALL: [ReleasePhase; 4] = [
        ReleasePhase::PegoutCreated,
        ReleasePhase::PegoutConfirmed,
        ReleasePhase::ReleaseSigned,
        ReleasePhase::Settled,
    ];
}

impl fmt::Display for ReleasePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReleasePhase::PegoutCreated => "pegout-created",
            ReleasePhase::PegoutConfirmed => "pegout-confirmed",
            ReleasePhase::ReleaseSigned => "release-signed",
            ReleasePhase::Settled => "settled",
        };
        f.write_str(name)
    }
}

/// What the driver observed when a phase completed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseCheckpoint {
    pub phase: ReleasePhase,
    pub rsk_height: u64,
    pub queued_pegouts: u64,
    pub pending_signatures: u64,
    /// Release transactions seen in the bitcoind mempool, if any yet
    pub release_txids: Vec<String>,
}

/// Receives every phase exactly once, in order. Returning an error aborts
/// the drive.
#[async_trait]
pub trait ReleaseObserver: Send + Sync {
    async fn on_phase(
        &self,
        phase: ReleasePhase,
        checkpoint: &ReleaseCheckpoint,
    ) -> anyhow::Result<()>;
}

/// Observer that ignores every phase
pub struct NoopObserver;

#[async_trait]
impl ReleaseObserver for NoopObserver {
    async fn on_phase(
        &self,
        _phase: ReleasePhase,
        _checkpoint: &ReleaseCheckpoint,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseOptions {
    /// RSK confirmations the bridge wants before collecting signatures
    pub pegout_confirmations: u32,
    /// Bitcoin blocks mined once the release is in the mempool
    pub btc_confirmations: u32,
    pub signature_attempts: u32,
    pub signature_interval: Duration,
    /// Pause before each `update_collections` call
    pub refresh_wait: Duration,
    /// How long to look for the release in the bitcoind mempool
    pub mempool_policy: RetryPolicy,
}

impl Default for ReleaseOptions {
    fn default() -> Self {
        Self {
            pegout_confirmations: 10,
            btc_confirmations: 3,
            signature_attempts: 20,
            signature_interval: Duration::from_secs(2),
            refresh_wait: Duration::from_secs(1),
            mempool_policy: RetryPolicy::fixed(10, Duration::from_secs(1)).failing_on_exhaustion(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseReport {
    pub queued_before: u64,
    pub queued_after: u64,
    pub release_txids: Vec<String>,
    pub final_height: u64,
    pub phases: Vec<ReleasePhase>,
}

pub struct ReleaseDriver {
    nodes: Vec<NodeHandle>,
    bridge: Arc<dyn Bridge>,
    bitcoin: Arc<dyn BitcoinChain>,
    sync: SyncCoordinator,
    options: ReleaseOptions,
}

impl ReleaseDriver {
    pub fn new(
        nodes: Vec<NodeHandle>,
        bridge: Arc<dyn Bridge>,
        bitcoin: Arc<dyn BitcoinChain>,
        sync: SyncCoordinator,
        options: ReleaseOptions,
    ) -> Self {
        Self {
            nodes,
            bridge,
            bitcoin,
            sync,
            options,
        }
    }

    pub fn options(&self) -> &ReleaseOptions {
        &self.options
    }

    fn miner(&self) -> Result<&NodeHandle, HarnessError> {
        self.nodes.first().ok_or_else(|| {
            HarnessError::InvalidArgument("release driver needs at least one node".to_string())
        })
    }

    /// Waits, asks the bridge to refresh its collections, then mines one
    /// block and syncs so the refresh is executed everywhere.
    pub async fn wait_and_refresh(&self) -> Result<(), HarnessError> {
        tokio::time::sleep(self.options.refresh_wait).await;
        self.bridge.update_collections().await?;
        self.sync.mine_and_sync(&self.nodes, 1).await?;
        Ok(())
    }

    /// Pushes the queued pegout through every phase and reports what it saw.
    ///
    /// Only the bounded loops inside a phase retry. A phase that fails aborts
    /// the drive and nothing is retried as a whole.
    pub async fn trigger_release(
        &self,
        observer: &dyn ReleaseObserver,
    ) -> Result<ReleaseReport, HarnessError> {
        let miner = self.miner()?;
        let queued_before = self.bridge.queued_pegouts_count().await?;
        let mut phases = Vec::with_capacity(ReleasePhase::ALL.len());
        info!(queued = queued_before, "triggering release");

        // Requested -> WaitingForConfirmations
        let height = miner.block_number().await?;
        let creation_height = self.bridge.next_pegout_creation_height().await?;
        if height < creation_height {
            let missing = creation_height - height;
            debug!(height, creation_height, "advancing to pegout creation height");
            self.sync.mine_and_sync(&self.nodes, to_blocks(missing)?).await?;
        }
        self.wait_and_refresh().await?;
        self.notify(observer, ReleasePhase::PegoutCreated, Vec::new(), &mut phases)
            .await?;

        // WaitingForConfirmations -> WaitingForSignatures; one block was
        // already mined by the refresh
        let remaining = self.options.pegout_confirmations.saturating_sub(1);
        if remaining > 0 {
            self.sync.mine_and_sync(&self.nodes, remaining).await?;
        }
        self.wait_and_refresh().await?;
        self.notify(observer, ReleasePhase::PegoutConfirmed, Vec::new(), &mut phases)
            .await?;

        // WaitingForSignatures -> Broadcasted
        self.wait_for_signatures().await?;
        self.notify(observer, ReleasePhase::ReleaseSigned, Vec::new(), &mut phases)
            .await?;

        // Broadcasted -> Settled
        let release_txids = self.wait_for_mempool().await?;
        let hashes = self.bitcoin.mine(self.options.btc_confirmations).await?;
        debug!(blocks = hashes.len(), "mined bitcoin confirmations");
        self.wait_and_refresh().await?;
        self.notify(observer, ReleasePhase::Settled, release_txids.clone(), &mut phases)
            .await?;

        let report = ReleaseReport {
            queued_before,
            queued_after: self.bridge.queued_pegouts_count().await?,
            release_txids,
            final_height: miner.block_number().await?,
            phases,
        };
        info!(
            queued_before = report.queued_before,
            queued_after = report.queued_after,
            txids = ?report.release_txids,
            height = report.final_height,
            "release settled"
        );
        Ok(report)
    }

    /// Polls until no release is waiting for signatures, mining a block
    /// between checks so the federators keep making progress.
    async fn wait_for_signatures(&self) -> Result<(), HarnessError> {
        let policy = RetryPolicy::fixed(
            self.options.signature_attempts,
            self.options.signature_interval,
        );
        let outcome = retry_with_check(
            &policy,
            "release signatures",
            || async {
                let pending = self.bridge.pending_signatures_count().await?;
                if pending > 0 {
                    debug!(pending, "releases still waiting for signatures");
                    self.sync.mine_and_sync(&self.nodes, 1).await?;
                    tokio::time::sleep(self.options.refresh_wait).await;
                }
                Ok::<_, anyhow::Error>(pending)
            },
            |pending, _| *pending == 0,
            None,
        )
        .await?;

        match outcome {
            RetryOutcome::Satisfied { attempts, .. } => {
                info!(attempts, "release signed");
                Ok(())
            }
            outcome => Err(HarnessError::ReleaseStalled {
                phase: ReleasePhase::ReleaseSigned.to_string(),
                attempts: outcome.attempts(),
            }),
        }
    }

    /// Looks for release transactions in the bitcoind mempool. What an empty
    /// mempool means after the last attempt is up to `mempool_policy`.
    async fn wait_for_mempool(&self) -> Result<Vec<String>, HarnessError> {
        let policy = &self.options.mempool_policy;
        let outcome = retry_with_check(
            policy,
            "release transaction in bitcoin mempool",
            || async { Ok::<_, anyhow::Error>(self.bitcoin.mempool_txids().await?) },
            |txids: &Vec<String>, _| !txids.is_empty(),
            None,
        )
        .await?;

        match outcome {
            RetryOutcome::Satisfied { value, .. } => {
                info!(txids = ?value, "release transaction in mempool");
                Ok(value)
            }
            outcome => {
                warn!(
                    attempts = outcome.attempts(),
                    "no release transaction in mempool, continuing"
                );
                Ok(outcome.into_last().unwrap_or_default())
            }
        }
    }

    async fn notify(
        &self,
        observer: &dyn ReleaseObserver,
        phase: ReleasePhase,
        release_txids: Vec<String>,
        phases: &mut Vec<ReleasePhase>,
    ) -> Result<(), HarnessError> {
        let checkpoint = ReleaseCheckpoint {
            phase,
            rsk_height: self.miner()?.block_number().await?,
            queued_pegouts: self.bridge.queued_pegouts_count().await?,
            pending_signatures: self.bridge.pending_signatures_count().await?,
            release_txids,
        };
        info!(%phase, height = checkpoint.rsk_height, "release phase reached");
        observer
            .on_phase(phase, &checkpoint)
            .await
            .map_err(|e| HarnessError::Other(e.context(format!("observer failed at {phase}"))))?;
        phases.push(phase);
        Ok(())
    }
}

fn to_blocks(count: u64) -> Result<u32, HarnessError> {
    u32::try_from(count)
        .map_err(|_| HarnessError::InvalidArgument(format!("cannot mine {count} blocks at once")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncOptions;
    use crate::sync::tests::FakeChain;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    /// Bitcoin side: a mempool the bridge fills and mining empties
    #[derive(Default)]
    struct FakeBitcoin {
        mempool: Mutex<Vec<String>>,
        mined: AtomicU32,
    }

    #[async_trait]
    impl BitcoinChain for FakeBitcoin {
        async fn mempool_txids(&self) -> Result<Vec<String>, HarnessError> {
            Ok(self.mempool.lock().unwrap().clone())
        }
        async fn mine(&self, blocks: u32) -> Result<Vec<String>, HarnessError> {
            self.mined.fetch_add(blocks, Ordering::SeqCst);
            self.mempool.lock().unwrap().clear();
            Ok((0..blocks).map(|i| format!("block{i}")).collect())
        }
    }

    /// Bridge that bundles the queued pegout once the chain reaches the
    /// creation height and releases it after `signature_polls` polls.
    struct FakeBridge {
        chain: FakeChain,
        bitcoin: Arc<FakeBitcoin>,
        creation_height: u64,
        queued: AtomicU64,
        pending: AtomicU64,
        signature_polls: Option<u32>,
        signature_error: Option<i64>,
        polls: AtomicU32,
        refreshes: AtomicU32,
    }

    impl FakeBridge {
        fn new(chain: FakeChain, bitcoin: Arc<FakeBitcoin>, signature_polls: Option<u32>) -> Self {
            Self {
                creation_height: chain.height() + 5,
                chain,
                bitcoin,
                queued: AtomicU64::new(1),
                pending: AtomicU64::new(0),
                signature_polls,
                signature_error: None,
                polls: AtomicU32::new(0),
                refreshes: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Bridge for FakeBridge {
        async fn next_pegout_creation_height(&self) -> Result<u64, HarnessError> {
            Ok(self.creation_height)
        }
        async fn queued_pegouts_count(&self) -> Result<u64, HarnessError> {
            Ok(self.queued.load(Ordering::SeqCst))
        }
        async fn pending_signatures_count(&self) -> Result<u64, HarnessError> {
            if let Some(code) = self.signature_error {
                return Err(HarnessError::Protocol {
                    command: "getStateForDebugging".to_string(),
                    code,
                });
            }
            let pending = self.pending.load(Ordering::SeqCst);
            if pending == 0 {
                return Ok(0);
            }
            let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            match self.signature_polls {
                Some(needed) if polls > needed => {
                    self.pending.store(0, Ordering::SeqCst);
                    self.bitcoin.mempool.lock().unwrap().push("releasetx".to_string());
                    Ok(0)
                }
                _ => Ok(pending),
            }
        }
        async fn update_collections(&self) -> Result<(), HarnessError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            if self.chain.height() >= self.creation_height
                && self.queued.load(Ordering::SeqCst) > 0
            {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                self.pending.store(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<ReleaseCheckpoint>>,
        fail_at: Option<ReleasePhase>,
    }

    #[async_trait]
    impl ReleaseObserver for Recorder {
        async fn on_phase(
            &self,
            phase: ReleasePhase,
            checkpoint: &ReleaseCheckpoint,
        ) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(checkpoint.clone());
            if self.fail_at == Some(phase) {
                anyhow::bail!("observer rejected {phase}");
            }
            Ok(())
        }
    }

    fn fast_options() -> ReleaseOptions {
        ReleaseOptions {
            pegout_confirmations: 4,
            btc_confirmations: 3,
            signature_attempts: 5,
            signature_interval: Duration::from_millis(1),
            refresh_wait: Duration::from_millis(1),
            mempool_policy: RetryPolicy::fixed(3, Duration::from_millis(1)).failing_on_exhaustion(),
        }
    }

    struct Setup {
        chain: FakeChain,
        bitcoin: Arc<FakeBitcoin>,
        bridge: Arc<FakeBridge>,
        driver: ReleaseDriver,
    }

    fn setup(signature_polls: Option<u32>, options: ReleaseOptions) -> Setup {
        let chain = FakeChain::at(100);
        let nodes: Vec<NodeHandle> =
            vec![chain.node("fed1"), chain.node("fed2"), chain.node("fed3")];
        let bitcoin = Arc::new(FakeBitcoin::default());
        let bridge = Arc::new(FakeBridge::new(chain.clone(), bitcoin.clone(), signature_polls));
        let sync = SyncCoordinator::new(SyncOptions {
            attempt_interval: Duration::from_millis(1),
            max_attempts: 3,
        });
        let driver = ReleaseDriver::new(nodes, bridge.clone(), bitcoin.clone(), sync, options);
        Setup { chain, bitcoin, bridge, driver }
    }

    #[tokio::test]
    async fn test_release_runs_all_phases_in_order() {
        let s = setup(Some(2), fast_options());
        let observer = Recorder::default();

        let report = s.driver.trigger_release(&observer).await.unwrap();

        assert_eq!(report.queued_before, 1);
        assert_eq!(report.queued_after, 0);
        assert_eq!(report.release_txids, vec!["releasetx"]);
        assert_eq!(report.phases, ReleasePhase::ALL.to_vec());
        assert_eq!(report.final_height, s.chain.height());

        let seen = observer.seen.lock().unwrap().clone();
        let phases: Vec<_> = seen.iter().map(|c| c.phase).collect();
        assert_eq!(phases, ReleasePhase::ALL.to_vec());
        assert_eq!(seen[0].queued_pegouts, 0);
        assert_eq!(seen[0].pending_signatures, 1);
        assert_eq!(seen[2].pending_signatures, 0);
        assert_eq!(seen[3].release_txids, vec!["releasetx"]);

        assert_eq!(s.bitcoin.mined.load(Ordering::SeqCst), 3);
        assert_eq!(s.bridge.refreshes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_release_mines_to_creation_height_and_confirmations() {
        let s = setup(Some(0), fast_options());
        s.driver.trigger_release(&NoopObserver).await.unwrap();

        // 5 to reach creation height, 3 refresh blocks, 3 more confirmations
        // and one block per unsigned signature poll (none here)
        assert_eq!(s.chain.height(), 100 + 5 + 3 + 3);
    }

    #[tokio::test]
    async fn test_missing_signatures_stall_the_release() {
        let s = setup(None, fast_options());
        let observer = Recorder::default();

        let err = s.driver.trigger_release(&observer).await.unwrap_err();
        match err {
            HarnessError::ReleaseStalled { phase, attempts } => {
                assert_eq!(phase, "release-signed");
                assert_eq!(attempts, 5);
            }
            other => panic!("unexpected error {other:?}"),
        }
        let phases: Vec<_> = observer.seen.lock().unwrap().iter().map(|c| c.phase).collect();
        assert_eq!(phases, vec![ReleasePhase::PegoutCreated, ReleasePhase::PegoutConfirmed]);
    }

    #[tokio::test]
    async fn test_bridge_error_keeps_its_kind_through_signature_poll() {
        let chain = FakeChain::at(100);
        let bitcoin = Arc::new(FakeBitcoin::default());
        let bridge = Arc::new(FakeBridge {
            signature_error: Some(-7),
            ..FakeBridge::new(chain.clone(), bitcoin.clone(), Some(0))
        });
        let nodes: Vec<NodeHandle> = vec![chain.node("fed1")];
        let driver = ReleaseDriver::new(
            nodes,
            bridge,
            bitcoin,
            SyncCoordinator::default(),
            fast_options(),
        );

        let err = driver.wait_for_signatures().await.unwrap_err();
        assert!(matches!(err, HarnessError::Protocol { code: -7, .. }));
    }

    #[tokio::test]
    async fn test_sync_stall_keeps_its_kind_through_signature_poll() {
        let s = setup(None, fast_options());
        s.bridge.pending.store(1, Ordering::SeqCst);
        let nodes: Vec<NodeHandle> =
            vec![s.chain.node("fed1"), FakeChain::at(0).lagging_node("fed-stuck", 0)];
        let driver = ReleaseDriver::new(
            nodes,
            s.bridge.clone(),
            s.bitcoin.clone(),
            s.driver.sync.clone(),
            fast_options(),
        );

        let err = driver.wait_for_signatures().await.unwrap_err();
        assert!(matches!(err, HarnessError::SyncStall { ref node, .. } if node == "fed-stuck"));
    }

    #[tokio::test]
    async fn test_empty_mempool_fails_under_fail_policy() {
        let s = setup(Some(0), fast_options());
        // Signatures complete but the transaction never reaches this bitcoind
        let bitcoin = Arc::new(FakeBitcoin::default());
        let driver = ReleaseDriver::new(
            s.driver.nodes.clone(),
            s.bridge.clone(),
            bitcoin,
            s.driver.sync.clone(),
            fast_options(),
        );

        let err = driver.trigger_release(&NoopObserver).await.unwrap_err();
        match err {
            HarnessError::RetryExhausted { operation, attempts } => {
                assert_eq!(operation, "release transaction in bitcoin mempool");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_mempool_tolerated_under_return_last_policy() {
        let mut options = fast_options();
        options.mempool_policy = RetryPolicy::fixed(2, Duration::from_millis(1));
        let s = setup(Some(0), options.clone());
        let driver = ReleaseDriver::new(
            s.driver.nodes.clone(),
            s.bridge.clone(),
            Arc::new(FakeBitcoin::default()),
            s.driver.sync.clone(),
            options,
        );

        let report = driver.trigger_release(&NoopObserver).await.unwrap();
        assert!(report.release_txids.is_empty());
        assert_eq!(report.phases.len(), 4);
    }

    #[tokio::test]
    async fn test_observer_error_aborts_drive() {
        let s = setup(Some(0), fast_options());
        let observer = Recorder {
            fail_at: Some(ReleasePhase::PegoutConfirmed),
            ..Recorder::default()
        };

        let err = s.driver.trigger_release(&observer).await.unwrap_err();
        assert!(err.to_string().contains("pegout-confirmed"));
        assert_eq!(observer.seen.lock().unwrap().len(), 2);
        assert_eq!(s.bitcoin.mined.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_nodes_is_invalid() {
        let bitcoin = Arc::new(FakeBitcoin::default());
        let bridge = Arc::new(FakeBridge::new(FakeChain::at(0), bitcoin.clone(), Some(0)));
        let driver = ReleaseDriver::new(
            Vec::new(),
            bridge,
            bitcoin,
            SyncCoordinator::default(),
            fast_options(),
        );
        assert!(matches!(
            driver.trigger_release(&NoopObserver).await,
            Err(HarnessError::InvalidArgument(_))
        ));
    }
}
