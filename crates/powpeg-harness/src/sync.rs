//! Block-height convergence across a set of RSK nodes.

use crate::env::HarnessEnv;
use crate::rpc::{NodeHandle, RskNode};
use futures::future::try_join_all;
use powpeg_harness_core::HarnessError;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Sleep between two height polls of the same node
    pub attempt_interval: Duration,
    /// Consecutive polls without progress before a node counts as stalled
    pub max_attempts: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from(&HarnessEnv::default())
    }
}

impl From<&HarnessEnv> for SyncOptions {
    fn from(env: &HarnessEnv) -> Self {
        Self {
            attempt_interval: env.wait_for_block_attempt_time,
            max_attempts: env.wait_for_block_max_attempts,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncCoordinator {
    options: SyncOptions,
}

impl SyncCoordinator {
    pub fn new(options: SyncOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> SyncOptions {
        self.options
    }

    /// Polls `node` until its height reaches `target` and returns the height
    /// it reported.
    ///
    /// Every poll that shows a higher block than the previous one resets the
    /// attempt counter. Only polls without progress count towards
    /// `max_attempts`, so a slow but advancing node never stalls.
    pub async fn wait_for_block(
        &self,
        node: &dyn RskNode,
        target: u64,
    ) -> Result<u64, HarnessError> {
        let mut last_seen = self.poll(node).await?;
        let mut attempts = 0u32;

        while last_seen.is_none_or(|height| height < target) {
            if attempts >= self.options.max_attempts {
                return Err(HarnessError::SyncStall {
                    node: node.endpoint().to_string(),
                    last_seen: last_seen.unwrap_or_default(),
                    target,
                    attempts,
                });
            }
            tokio::time::sleep(self.options.attempt_interval).await;

            let height = self.poll(node).await?;
            match (height, last_seen) {
                (Some(now), Some(before)) if now > before => attempts = 0,
                (Some(_), None) => attempts = 0,
                _ => attempts += 1,
            }
            if height.is_some() {
                last_seen = height;
            }
            debug!(
                node = node.endpoint(),
                height = ?last_seen,
                target,
                attempts,
                "waiting for block"
            );
        }

        let height = last_seen.unwrap_or(target);
        debug!(node = node.endpoint(), height, target, "node reached target");
        Ok(height)
    }

    /// A transient RPC failure counts as a poll without progress.
    async fn poll(&self, node: &dyn RskNode) -> Result<Option<u64>, HarnessError> {
        match node.block_number().await {
            Ok(height) => Ok(Some(height)),
            Err(e) if e.is_retryable() => {
                warn!(node = node.endpoint(), error = %e, "height poll failed");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Waits until every node has caught up with the highest block any of
    /// them reported when the call started. Heights come back in input order.
    pub async fn wait_for_sync(&self, nodes: &[NodeHandle]) -> Result<Vec<u64>, HarnessError> {
        if nodes.is_empty() {
            return Ok(Vec::new());
        }

        let heights = try_join_all(nodes.iter().map(|node| node.block_number())).await?;
        let target = heights.iter().copied().max().unwrap_or_default();
        debug!(?heights, target, "syncing nodes");

        let synced =
            try_join_all(nodes.iter().map(|node| self.wait_for_block(node.as_ref(), target)))
                .await?;
        info!(target, nodes = nodes.len(), "nodes in sync");
        Ok(synced)
    }

    /// Mines `blocks` on the first node and waits for the rest to follow.
    pub async fn mine_and_sync(
        &self,
        nodes: &[NodeHandle],
        blocks: u32,
    ) -> Result<Vec<u64>, HarnessError> {
        if blocks == 0 {
            return Err(HarnessError::InvalidArgument(
                "blocks to mine must be positive".to_string(),
            ));
        }
        let Some(miner) = nodes.first() else {
            return Err(HarnessError::InvalidArgument(
                "cannot mine without nodes".to_string(),
            ));
        };

        miner.mine(blocks).await?;
        info!(node = miner.endpoint(), blocks, "mined blocks");
        self.wait_for_sync(nodes).await
    }
}
