/// Block maturity tracking
///
/// A found block closes its payout window at once, but the window is only
/// paid when the block holds on the node's best chain. The tracker submits
/// each block, follows it, and reports its fate on the bus as a
/// `block_status` event:
/// - node refused the submission → `rejected`
/// - tip at `height + confirmations - 1` and our hash at `height` → `confirmed`
/// - another hash at `height` by then → `orphaned`
///
/// With zero confirmations an accepted block is confirmed on the spot.

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::blockchain::NodePeer;
use crate::bus::{BlockState, BlockStatusEvent, EventPublisher, PoolEvent};
use crate::metrics::prometheus as metrics;
use crate::shares::BlockCandidate;

#[derive(Debug, Clone)]
pub struct MaturitySettings {
    pub confirmations: u64,
    pub poll_interval: Duration,
}

/// A submitted block whose window is still unpaid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedBlock {
    pub window_id: u64,
    pub height: u64,
    pub hash: String,
}

#[derive(Clone)]
pub struct BlockTracker {
    node: Arc<dyn NodePeer>,
    publisher: EventPublisher,
    refresh: Arc<Notify>,
    settings: MaturitySettings,
    /// Keyed by window id
    tracked: Arc<Mutex<BTreeMap<u64, TrackedBlock>>>,
}

impl BlockTracker {
    pub fn new(
        node: Arc<dyn NodePeer>,
        publisher: EventPublisher,
        refresh: Arc<Notify>,
        settings: MaturitySettings,
    ) -> Self {
        Self {
            node,
            publisher,
            refresh,
            settings,
            tracked: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn tracked(&self) -> Vec<TrackedBlock> {
        self.tracked.lock().values().cloned().collect()
    }

    /// Submit the block that closed `window_id` in the background and
    /// follow it until it settles
    pub fn submit(&self, window_id: u64, block: BlockCandidate) {
        let tracker = self.clone();
        tokio::spawn(async move { tracker.submit_now(window_id, block).await });
    }

    async fn submit_now(&self, window_id: u64, block: BlockCandidate) {
        metrics::inc_block_submit_attempts();
        let tracked = TrackedBlock {
            window_id,
            height: block.height,
            hash: block.hash.clone(),
        };
        match self.node.submit_block(&block.block_hex).await {
            Ok(true) => {
                tracing::info!("Block {} accepted by node", block.hash);
                if self.settings.confirmations == 0 {
                    self.report(&tracked, BlockState::Confirmed);
                } else {
                    self.track(tracked);
                }
            }
            Ok(false) => {
                metrics::inc_block_submit_rejected();
                tracing::error!("Block {} at height {} rejected by node", block.hash, block.height);
                self.report(&tracked, BlockState::Rejected);
            }
            Err(e) => {
                // The node may still have it; the chain decides
                metrics::inc_block_submit_rejected();
                tracing::error!("Block {} submission failed: {:#}", block.hash, e);
                self.track(tracked);
            }
        }
        // Pick up the new tip without waiting for the next poll
        self.refresh.notify_one();
    }

    /// Follow a block already handed to the node, e.g. one left unsettled
    /// by a previous run
    pub fn track(&self, block: TrackedBlock) {
        tracing::debug!("Tracking block {} at height {} for window {}", block.hash, block.height, block.window_id);
        self.tracked.lock().insert(block.window_id, block);
    }

    /// Check every tracked block against the best chain; returns how many settled
    pub async fn poll_once(&self) -> Result<usize> {
        let blocks = self.tracked();
        if blocks.is_empty() {
            return Ok(0);
        }
        let tip = self.node.best_height().await?;
        let depth = self.settings.confirmations.max(1);

        let mut settled = 0;
        for block in blocks {
            if tip + 1 < block.height + depth {
                continue;
            }
            let state = match self.node.block_hash(block.height).await {
                Ok(hash) if hash.eq_ignore_ascii_case(&block.hash) => BlockState::Confirmed,
                Ok(hash) => {
                    tracing::warn!(
                        "Block {} at height {} orphaned, chain has {}",
                        block.hash,
                        block.height,
                        hash
                    );
                    BlockState::Orphaned
                }
                Err(e) => {
                    tracing::warn!("Cannot look up height {}: {:#}", block.height, e);
                    continue;
                }
            };
            self.tracked.lock().remove(&block.window_id);
            self.report(&block, state);
            settled += 1;
        }
        Ok(settled)
    }

    fn report(&self, block: &TrackedBlock, state: BlockState) {
        metrics::inc_block_status(state.as_str());
        tracing::info!(
            "Block {} at height {} (window {}) {}",
            block.hash,
            block.height,
            block.window_id,
            state.as_str()
        );
        self.publisher.publish(PoolEvent::BlockStatus(BlockStatusEvent {
            id: Uuid::new_v4(),
            window_id: block.window_id,
            height: block.height,
            hash: block.hash.clone(),
            state,
            timestamp: Utc::now(),
        }));
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        tracing::warn!("Block maturity poll failed: {:#}", e);
                    }
                }
                _ = shutdown.changed() => {
                    tracing::info!("BlockTracker stopping");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::template_manager::test_support::MockNode;
    use crate::bus::{EventSource, MemoryBus, MemorySource, RetryPolicy};

    fn tracker(node: Arc<MockNode>, confirmations: u64) -> (BlockTracker, MemorySource) {
        let bus = Arc::new(MemoryBus::new());
        let source = bus.subscribe("ledger");
        let (publisher, _handle) = EventPublisher::spawn(bus, RetryPolicy::default());
        let settings = MaturitySettings {
            confirmations,
            poll_interval: Duration::from_millis(10),
        };
        (BlockTracker::new(node, publisher, Arc::new(Notify::new()), settings), source)
    }

    fn candidate(height: u64, hash: &str) -> BlockCandidate {
        BlockCandidate {
            height,
            hash: hash.to_string(),
            block_hex: "00".into(),
            reward: 60,
        }
    }

    async fn next_status(source: &mut MemorySource) -> BlockStatusEvent {
        let delivery = tokio::time::timeout(Duration::from_secs(2), source.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match delivery.decode().unwrap() {
            PoolEvent::BlockStatus(ev) => ev,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejected_submission_is_reported() {
        let node = Arc::new(MockNode::default());
        *node.reject_blocks.lock() = true;
        let (tracker, mut source) = tracker(node, 3);

        tracker.submit_now(4, candidate(100, "aa")).await;
        let status = next_status(&mut source).await;
        assert_eq!(status.window_id, 4);
        assert_eq!(status.state, BlockState::Rejected);
        assert!(tracker.tracked().is_empty());
    }

    #[tokio::test]
    async fn test_block_confirms_once_buried() {
        let node = Arc::new(MockNode::default());
        node.chain.lock().insert(100, "aa".into());
        let (tracker, mut source) = tracker(node.clone(), 3);

        tracker.submit_now(2, candidate(100, "aa")).await;
        assert_eq!(tracker.poll_once().await.unwrap(), 0);
        assert_eq!(tracker.tracked().len(), 1);

        node.chain.lock().insert(101, "bb".into());
        node.chain.lock().insert(102, "cc".into());
        assert_eq!(tracker.poll_once().await.unwrap(), 1);
        let status = next_status(&mut source).await;
        assert_eq!(status.state, BlockState::Confirmed);
        assert_eq!(status.height, 100);
        assert!(tracker.tracked().is_empty());
    }

    #[tokio::test]
    async fn test_replaced_block_is_orphaned() {
        let node = Arc::new(MockNode::default());
        let (tracker, mut source) = tracker(node.clone(), 2);
        tracker.submit_now(5, candidate(100, "aa")).await;

        node.chain.lock().insert(100, "ff".into());
        node.chain.lock().insert(101, "bb".into());
        assert_eq!(tracker.poll_once().await.unwrap(), 1);
        assert_eq!(next_status(&mut source).await.state, BlockState::Orphaned);
    }

    #[tokio::test]
    async fn test_zero_confirmations_confirm_on_acceptance() {
        let node = Arc::new(MockNode::default());
        let (tracker, mut source) = tracker(node.clone(), 0);

        tracker.submit_now(0, candidate(100, "aa")).await;
        assert_eq!(next_status(&mut source).await.state, BlockState::Confirmed);
        assert_eq!(node.submitted.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_reseeded_block_is_checked_against_chain() {
        let node = Arc::new(MockNode::default());
        node.chain.lock().insert(100, "AA".into());
        let (tracker, mut source) = tracker(node, 0);

        tracker.track(TrackedBlock {
            window_id: 9,
            height: 100,
            hash: "aa".into(),
        });
        assert_eq!(tracker.poll_once().await.unwrap(), 1);
        let status = next_status(&mut source).await;
        assert_eq!(status.window_id, 9);
        assert_eq!(status.state, BlockState::Confirmed);
    }
}
