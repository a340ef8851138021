/// Ledger consumer
///
/// `LedgerConsumer` is the only writer of the share ledger. It pulls
/// deliveries from the ledger queue and applies them. A closed window waits
/// for the `block_status` event of its block: confirmed blocks are settled
/// and the record is appended to the payout sink, rejected or orphaned ones
/// have their scores carried into the open window.
///
/// Deliveries are acknowledged only after a checkpoint covering them is
/// committed to the ledger store, so a restart resumes from the checkpoint
/// and the redelivered tail rebuilds the rest. Read paths (HTTP API, stats)
/// take the shared read lock.

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::calculator::{PayoutCalculator, PayoutRecord};
use super::ledger::{ClosedWindow, ShareLedger};
use super::store::{LedgerCheckpoint, LedgerStore, RestoredLedger};
use crate::bus::{BlockState, BlockStatusEvent, Delivery, EventSource, PoolEvent};
use crate::metrics::prometheus as metrics;
use crate::payout::PayoutSink;
use crate::stratum::ShareCounters;

/// Deliveries applied before a checkpoint is forced
const CHECKPOINT_BATCH: usize = 128;
const RETRY_INITIAL: Duration = Duration::from_millis(100);
const RETRY_MAX: Duration = Duration::from_secs(30);

pub type SharedAccounting = Arc<RwLock<Accounting>>;

#[derive(Debug, Clone, Serialize)]
pub struct MinerView {
    pub miner: String,
    pub window_id: u64,
    pub score: Decimal,
    pub total_score: Decimal,
    /// `score / total_score`, zero for an empty window
    pub share_of_window: Decimal,
    pub workers: BTreeMap<String, ShareCounters>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PayoutEstimate {
    pub miner: String,
    pub window_id: u64,
    pub score: Decimal,
    pub total_score: Decimal,
    /// Reward the estimate assumes; `None` until a job or block is known
    pub reference_reward: Option<u64>,
    pub carried: u64,
    pub estimated: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MinerPayout {
    pub window_id: u64,
    pub block_height: u64,
    pub block_hash: String,
    pub amount: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerStats {
    pub window_id: u64,
    pub start_height: Option<u64>,
    pub shares_processed: u64,
    pub active_miners: usize,
    pub total_score: Decimal,
    pub blocks_found: u64,
    pub awaiting_blocks: usize,
    pub carried: u64,
    pub pending_events: usize,
    pub malformed_events: u64,
}

pub struct Accounting {
    ledger: ShareLedger,
    calculator: PayoutCalculator,
    payouts: VecDeque<PayoutRecord>,
    /// Closed windows waiting on their block, by window id
    awaiting: BTreeMap<u64, ClosedWindow>,
    history_len: usize,
    last_block_reward: Option<u64>,
    malformed: u64,
}

impl Accounting {
    pub fn new(window_id: u64, calculator: PayoutCalculator, history_len: usize) -> Self {
        Self {
            ledger: ShareLedger::new(window_id, history_len),
            calculator,
            payouts: VecDeque::new(),
            awaiting: BTreeMap::new(),
            history_len: history_len.max(1),
            last_block_reward: None,
            malformed: 0,
        }
    }

    pub fn restore(restored: RestoredLedger, calculator: PayoutCalculator, history_len: usize) -> Self {
        let cp = restored.checkpoint;
        let awaiting: BTreeMap<u64, ClosedWindow> =
            cp.awaiting.into_iter().map(|c| (c.window.id, c)).collect();
        metrics::set_blocks_awaiting(awaiting.len());
        tracing::info!(
            "Ledger restored at window {} ({} applied events, {} blocks awaiting)",
            cp.ledger.window.id,
            restored.seen.len(),
            awaiting.len()
        );
        Self {
            ledger: ShareLedger::restore(cp.ledger, restored.seen, history_len),
            calculator: calculator.with_carried(cp.carried),
            payouts: cp.payouts.into_iter().collect(),
            awaiting,
            history_len: history_len.max(1),
            last_block_reward: cp.last_block_reward,
            malformed: cp.malformed,
        }
    }

    /// Resume from the store's checkpoint, or start at window 0
    pub async fn load(
        store: &dyn LedgerStore,
        calculator: PayoutCalculator,
        history_len: usize,
    ) -> Result<Self> {
        Ok(match store.load().await? {
            Some(restored) => Self::restore(restored, calculator, history_len),
            None => Self::new(0, calculator, history_len),
        })
    }

    pub fn shared(self) -> SharedAccounting {
        Arc::new(RwLock::new(self))
    }

    pub fn ledger(&self) -> &ShareLedger {
        &self.ledger
    }

    pub fn calculator(&self) -> &PayoutCalculator {
        &self.calculator
    }

    /// Closed windows whose block has not settled, oldest first
    pub fn awaiting(&self) -> impl Iterator<Item = &ClosedWindow> {
        self.awaiting.values()
    }

    /// Current state plus the event ids applied since the previous call
    pub fn checkpoint(&mut self) -> (LedgerCheckpoint, Vec<Uuid>) {
        let checkpoint = LedgerCheckpoint {
            ledger: self.ledger.snapshot(),
            carried: self.calculator.carried(),
            last_block_reward: self.last_block_reward,
            malformed: self.malformed,
            payouts: self.payouts.iter().cloned().collect(),
            awaiting: self.awaiting.values().cloned().collect(),
        };
        (checkpoint, self.ledger.take_fresh_ids())
    }

    /// Apply one delivery; returns the payout records it settled
    pub fn handle(&mut self, delivery: &Delivery) -> Vec<PayoutRecord> {
        let event = match delivery.decode() {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("Skipping malformed bus event: {}", e);
                metrics::inc_ledger_skipped("malformed");
                self.malformed += 1;
                return Vec::new();
            }
        };

        if let PoolEvent::BlockStatus(status) = event {
            return self.settle_block(&status).into_iter().collect();
        }

        for closed in self.ledger.apply(event).closed {
            self.last_block_reward = Some(closed.block.reward);
            self.awaiting.insert(closed.window.id, closed);
        }
        metrics::set_blocks_awaiting(self.awaiting.len());
        Vec::new()
    }

    fn settle_block(&mut self, status: &BlockStatusEvent) -> Option<PayoutRecord> {
        let known = self
            .awaiting
            .get(&status.window_id)
            .is_some_and(|c| c.block.hash.eq_ignore_ascii_case(&status.hash));
        if !known {
            // Redelivered status of a window already settled
            tracing::debug!("No block {} awaiting for window {}", status.hash, status.window_id);
            metrics::inc_ledger_skipped("unknown_block");
            return None;
        }
        let closed = self.awaiting.remove(&status.window_id)?;
        metrics::set_blocks_awaiting(self.awaiting.len());

        match status.state {
            BlockState::Confirmed => {
                let record = self.calculator.settle(&closed);
                self.payouts.push_back(record.clone());
                while self.payouts.len() > self.history_len {
                    self.payouts.pop_front();
                }
                Some(record)
            }
            BlockState::Rejected | BlockState::Orphaned => {
                tracing::warn!(
                    "Block {} of window {} {}, scores move to window {}",
                    closed.block.hash,
                    closed.window.id,
                    status.state.as_str(),
                    self.ledger.current().id
                );
                self.ledger.carry_forward(&closed.window);
                None
            }
        }
    }

    pub fn miner_view(&self, miner: &str) -> MinerView {
        let window = self.ledger.current();
        let score = window.score_of(miner);
        let share_of_window = if window.total_score > Decimal::ZERO {
            score / window.total_score
        } else {
            Decimal::ZERO
        };
        let prefix = format!("{}.", miner);
        let workers = window
            .workers
            .iter()
            .filter(|(worker, _)| worker.starts_with(&prefix))
            .map(|(worker, counters)| (worker.clone(), counters.clone()))
            .collect();
        MinerView {
            miner: miner.to_string(),
            window_id: window.id,
            score,
            total_score: window.total_score,
            share_of_window,
            workers,
        }
    }

    /// Pending payout if the open window closed now on a block paying
    /// `current_reward` (or the last block's reward when unknown)
    pub fn estimate(&self, miner: &str, current_reward: Option<u64>) -> PayoutEstimate {
        let window = self.ledger.current();
        let score = window.score_of(miner);
        let reference_reward = current_reward.or(self.last_block_reward);
        let estimated = reference_reward
            .map(|reward| self.calculator.estimate(score, window.total_score, reward))
            .unwrap_or(0);
        PayoutEstimate {
            miner: miner.to_string(),
            window_id: window.id,
            score,
            total_score: window.total_score,
            reference_reward,
            carried: self.calculator.carried(),
            estimated,
        }
    }

    /// Newest first
    pub fn miner_payouts(&self, miner: &str) -> Vec<MinerPayout> {
        self.payouts
            .iter()
            .rev()
            .filter_map(|r| {
                r.rewards.get(miner).map(|amount| MinerPayout {
                    window_id: r.window_id,
                    block_height: r.block_height,
                    block_hash: r.block_hash.clone(),
                    amount: *amount,
                    created_at: r.created_at,
                })
            })
            .collect()
    }

    /// Newest first
    pub fn recent_payouts(&self, limit: usize) -> Vec<PayoutRecord> {
        self.payouts.iter().rev().take(limit).cloned().collect()
    }

    pub fn stats(&self) -> LedgerStats {
        let window = self.ledger.current();
        LedgerStats {
            window_id: window.id,
            start_height: window.start_height,
            shares_processed: window.shares_processed,
            active_miners: window.scores.len(),
            total_score: window.total_score,
            blocks_found: self.ledger.blocks_found(),
            awaiting_blocks: self.awaiting.len(),
            carried: self.calculator.carried(),
            pending_events: self.ledger.pending_events(),
            malformed_events: self.malformed,
        }
    }
}

/// Append until the sink takes the record
async fn store_record(sink: &dyn PayoutSink, record: &PayoutRecord) {
    let mut delay = RETRY_INITIAL;
    loop {
        match sink.append(record).await {
            Ok(()) => {
                metrics::inc_payouts_emitted();
                return;
            }
            Err(e) => {
                metrics::inc_payout_sink_errors();
                tracing::error!(
                    "Payout record for window {} not stored, retrying in {:?}: {:#}",
                    record.window_id,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RETRY_MAX);
            }
        }
    }
}

pub struct LedgerConsumer {
    accounting: SharedAccounting,
    source: Box<dyn EventSource>,
    sink: Arc<dyn PayoutSink>,
    store: Arc<dyn LedgerStore>,
    /// Applied but not yet covered by a committed checkpoint
    unacked: Vec<Delivery>,
}

impl LedgerConsumer {
    pub fn new(
        accounting: SharedAccounting,
        source: Box<dyn EventSource>,
        sink: Arc<dyn PayoutSink>,
        store: Arc<dyn LedgerStore>,
    ) -> Self {
        Self {
            accounting,
            source,
            sink,
            store,
            unacked: Vec::new(),
        }
    }

    /// Apply everything already queued and checkpoint it. Returns the
    /// number of deliveries applied.
    pub async fn catch_up(&mut self) -> usize {
        let mut applied = 0;
        loop {
            match self.source.try_recv().await {
                Ok(Some(delivery)) => {
                    self.process(delivery).await;
                    applied += 1;
                    if self.unacked.len() >= CHECKPOINT_BATCH {
                        self.checkpoint().await;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Ledger catch-up stopped early: {}", e);
                    break;
                }
            }
        }
        self.checkpoint().await;
        if applied > 0 {
            tracing::info!("Ledger caught up on {} queued events", applied);
        }
        applied
    }

    /// Consume the ledger queue until it closes
    pub async fn run(mut self) {
        loop {
            // Block only when nothing is waiting for a checkpoint
            let next = if self.unacked.is_empty() {
                self.source.recv().await
            } else {
                self.source.try_recv().await
            };
            match next {
                Ok(Some(delivery)) => {
                    let settled = self.process(delivery).await;
                    if !settled && self.unacked.len() < CHECKPOINT_BATCH {
                        continue;
                    }
                }
                Ok(None) if self.unacked.is_empty() => {
                    tracing::info!("Ledger queue closed");
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!("Ledger queue receive failed: {}", e);
                    if self.unacked.is_empty() {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                }
            }
            self.checkpoint().await;
        }
    }

    /// Apply one delivery and store its payout records; true if it settled any
    async fn process(&mut self, delivery: Delivery) -> bool {
        let records = self.accounting.write().handle(&delivery);
        self.unacked.push(delivery);
        for record in &records {
            store_record(self.sink.as_ref(), record).await;
        }
        !records.is_empty()
    }

    async fn checkpoint(&mut self) {
        if self.unacked.is_empty() {
            return;
        }
        let (checkpoint, applied) = self.accounting.write().checkpoint();
        let mut delay = RETRY_INITIAL;
        while let Err(e) = self.store.commit(&checkpoint, &applied).await {
            metrics::inc_checkpoint_errors();
            tracing::error!("Ledger checkpoint failed, retrying in {:?}: {:#}", delay, e);
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(RETRY_MAX);
        }

        for delivery in std::mem::take(&mut self.unacked) {
            if let Err(e) = self.source.ack(&delivery).await {
                tracing::warn!("Ledger ack failed, event will be redelivered: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BlockFoundEvent, EventBus, MemoryBus, ShareEvent};
    use crate::error::BusError;
    use crate::payout::MemoryPayoutSink;
    use crate::pplns::store::MemoryLedgerStore;
    use crate::shares::ShareStatus;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    const HASH: &str = "cdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcd";

    fn share(window_id: u64, miner: &str, score: Decimal) -> PoolEvent {
        PoolEvent::Share(ShareEvent {
            id: Uuid::new_v4(),
            window_id,
            miner: miner.into(),
            worker: format!("{}.rig", miner),
            tier: "low".into(),
            job_id: "1".into(),
            height: 10,
            status: ShareStatus::Accepted,
            score,
            timestamp: Utc::now(),
        })
    }

    fn block(window_id: u64, reward: u64) -> PoolEvent {
        PoolEvent::BlockFound(BlockFoundEvent {
            id: Uuid::new_v4(),
            window_id,
            height: 10,
            hash: HASH.into(),
            miner: "A".into(),
            worker: "A.rig".into(),
            reward,
            timestamp: Utc::now(),
        })
    }

    fn status(window_id: u64, state: BlockState) -> PoolEvent {
        PoolEvent::BlockStatus(BlockStatusEvent {
            id: Uuid::new_v4(),
            window_id,
            height: 10,
            hash: HASH.into(),
            state,
            timestamp: Utc::now(),
        })
    }

    fn delivery(event: &PoolEvent) -> Delivery {
        Delivery {
            payload: serde_json::to_string(event).unwrap(),
        }
    }

    fn accounting() -> Accounting {
        Accounting::new(0, PayoutCalculator::new(dec!(0.02)).unwrap(), 16)
    }

    /// Replays a fixed list of deliveries and logs every ack
    struct ScriptedSource {
        queue: VecDeque<Delivery>,
        acks: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedSource {
        fn new(events: &[PoolEvent]) -> (Self, Arc<Mutex<Vec<String>>>) {
            let acks = Arc::new(Mutex::new(Vec::new()));
            let source = Self {
                queue: events.iter().map(delivery).collect(),
                acks: acks.clone(),
            };
            (source, acks)
        }
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn recv(&mut self) -> Result<Option<Delivery>, BusError> {
            Ok(self.queue.pop_front())
        }

        async fn try_recv(&mut self) -> Result<Option<Delivery>, BusError> {
            Ok(self.queue.pop_front())
        }

        async fn ack(&mut self, delivery: &Delivery) -> Result<(), BusError> {
            self.acks.lock().push(delivery.payload.clone());
            Ok(())
        }
    }

    /// Fails the first `failures` appends, noting how many acks had
    /// happened when the record finally landed
    struct FlakySink {
        failures: Mutex<u32>,
        acks: Arc<Mutex<Vec<String>>>,
        stored: Mutex<Vec<(PayoutRecord, usize)>>,
    }

    #[async_trait]
    impl PayoutSink for FlakySink {
        async fn append(&self, record: &PayoutRecord) -> anyhow::Result<()> {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                anyhow::bail!("sink unavailable");
            }
            self.stored.lock().push((record.clone(), self.acks.lock().len()));
            Ok(())
        }
    }

    #[test]
    fn test_malformed_payload_is_skipped() {
        let mut acc = accounting();
        let out = acc.handle(&Delivery { payload: "{\"type\":\"share\",".into() });
        assert!(out.is_empty());
        assert_eq!(acc.stats().malformed_events, 1);
    }

    #[test]
    fn test_confirmed_block_produces_payout_and_history() {
        let mut acc = accounting();
        acc.handle(&delivery(&share(0, "A", dec!(300))));
        acc.handle(&delivery(&share(0, "B", dec!(700))));
        assert!(acc.handle(&delivery(&block(0, 60))).is_empty());
        assert_eq!(acc.stats().awaiting_blocks, 1);
        assert_eq!(acc.stats().window_id, 1);

        let records = acc.handle(&delivery(&status(0, BlockState::Confirmed)));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].rewards["A"], 17);
        assert_eq!(records[0].rewards["B"], 41);
        assert!(records[0].is_balanced());

        let history = acc.miner_payouts("B");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].amount, 41);
        assert_eq!(acc.stats().awaiting_blocks, 0);
        assert_eq!(acc.stats().carried, 1);

        // Redelivered status settles nothing
        assert!(acc.handle(&delivery(&status(0, BlockState::Confirmed))).is_empty());
    }

    #[test]
    fn test_orphaned_block_carries_scores_forward() {
        let mut acc = accounting();
        acc.handle(&delivery(&share(0, "A", dec!(300))));
        acc.handle(&delivery(&block(0, 60)));
        acc.handle(&delivery(&share(1, "B", dec!(100))));

        assert!(acc.handle(&delivery(&status(0, BlockState::Orphaned))).is_empty());
        let view = acc.miner_view("A");
        assert_eq!(view.window_id, 1);
        assert_eq!(view.score, dec!(300));
        assert_eq!(view.total_score, dec!(400));
        assert!(acc.recent_payouts(10).is_empty());
        assert_eq!(acc.stats().carried, 0);
    }

    #[test]
    fn test_status_with_foreign_hash_is_ignored() {
        let mut acc = accounting();
        acc.handle(&delivery(&share(0, "A", dec!(1))));
        acc.handle(&delivery(&block(0, 60)));

        let mut other = status(0, BlockState::Confirmed);
        if let PoolEvent::BlockStatus(ev) = &mut other {
            ev.hash = "ef".repeat(32);
        }
        assert!(acc.handle(&delivery(&other)).is_empty());
        assert_eq!(acc.stats().awaiting_blocks, 1);
    }

    #[test]
    fn test_miner_view_and_estimate() {
        let mut acc = accounting();
        acc.handle(&delivery(&share(0, "A", dec!(1))));
        acc.handle(&delivery(&share(0, "B", dec!(3))));

        let view = acc.miner_view("A");
        assert_eq!(view.share_of_window, dec!(0.25));
        assert_eq!(view.workers["A.rig"].accepted, 1);

        assert_eq!(acc.estimate("A", None).estimated, 0);
        // 58.8 / 4
        assert_eq!(acc.estimate("A", Some(60)).estimated, 14);
    }

    #[tokio::test]
    async fn test_consumer_over_memory_bus() {
        let bus = MemoryBus::new();
        let source = bus.subscribe("ledger");
        let sink = Arc::new(MemoryPayoutSink::new());
        let store = Arc::new(MemoryLedgerStore::new());
        let acc = accounting().shared();

        let consumer = tokio::spawn(
            LedgerConsumer::new(acc.clone(), Box::new(source), sink.clone(), store.clone()).run(),
        );

        bus.publish(&share(0, "A", dec!(300))).await.unwrap();
        bus.publish(&share(0, "B", dec!(700))).await.unwrap();
        bus.publish(&block(0, 60)).await.unwrap();
        bus.publish(&status(0, BlockState::Confirmed)).await.unwrap();
        drop(bus);
        consumer.await.unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fee, 1);
        assert_eq!(acc.read().recent_payouts(10).len(), 1);
        assert_eq!(store.committed_window(), Some(1));
    }

    #[tokio::test]
    async fn test_restart_resumes_from_checkpoint() {
        let store = Arc::new(MemoryLedgerStore::new());
        let sink = Arc::new(MemoryPayoutSink::new());
        let calc = || PayoutCalculator::new(dec!(0.02)).unwrap();

        let a = share(0, "A", dec!(300));
        let b = share(0, "B", dec!(700));
        let found = block(0, 60);
        let confirmed = status(0, BlockState::Confirmed);

        // First run: A is checkpointed, B and the block are applied, then the process dies
        let (source, first_acks) = ScriptedSource::new(&[a.clone(), b.clone(), found.clone()]);
        let mut first = LedgerConsumer::new(
            Accounting::new(0, calc(), 16).shared(),
            Box::new(source),
            sink.clone(),
            store.clone(),
        );
        let d = first.source.try_recv().await.unwrap().unwrap();
        first.process(d).await;
        first.checkpoint().await;
        for _ in 0..2 {
            let d = first.source.try_recv().await.unwrap().unwrap();
            first.process(d).await;
        }
        drop(first);
        assert_eq!(first_acks.lock().len(), 1);

        // Second run: the bus redelivers everything unacked, plus A whose ack was lost
        let acc = Accounting::load(store.as_ref(), calc(), 16).await.unwrap();
        assert_eq!(acc.stats().total_score, dec!(300));
        let acc = acc.shared();
        let (source, second_acks) = ScriptedSource::new(&[a, b, found, confirmed]);
        let mut second = LedgerConsumer::new(acc.clone(), Box::new(source), sink.clone(), store.clone());
        assert_eq!(second.catch_up().await, 4);

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].rewards["A"], 17);
        assert_eq!(records[0].rewards["B"], 41);
        assert_eq!(records[0].total_score, dec!(1000));
        assert_eq!(second_acks.lock().len(), 4);
        assert_eq!(acc.read().stats().window_id, 1);
        assert_eq!(store.committed_window(), Some(1));
    }

    #[tokio::test]
    async fn test_payout_record_survives_sink_outage() {
        let events = [
            share(0, "A", dec!(300)),
            share(0, "B", dec!(700)),
            block(0, 60),
            status(0, BlockState::Confirmed),
        ];
        let (source, acks) = ScriptedSource::new(&events);
        let sink = Arc::new(FlakySink {
            failures: Mutex::new(2),
            acks: acks.clone(),
            stored: Mutex::new(Vec::new()),
        });
        let consumer = LedgerConsumer::new(
            accounting().shared(),
            Box::new(source),
            sink.clone(),
            Arc::new(MemoryLedgerStore::new()),
        );
        tokio::time::timeout(Duration::from_secs(5), consumer.run())
            .await
            .expect("consumer finished");

        let stored = sink.stored.lock();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].0.rewards["B"], 41);
        // Nothing was acknowledged before the record landed
        assert_eq!(stored[0].1, 0);
        assert_eq!(acks.lock().len(), 4);
    }
}
