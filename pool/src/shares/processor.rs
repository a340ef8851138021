/// Share processing pipeline
///
/// 1. Validate the submit against the connection (validator.rs)
/// 2. Stamp the result with the open payout window and queue a share event
/// 3. On a block, rotate the window, queue the block-found event and hand
///    the block to the tracker, which submits it and reports its fate
///
/// Nothing here waits on the network; the connection gets its answer as
/// soon as the share is classified.

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use super::validator::{ShareOutcome, ShareValidator};
use crate::bus::{BlockFoundEvent, EventPublisher, PoolEvent, ShareEvent};
use crate::error::ProtocolError;
use crate::metrics::prometheus as metrics;
use crate::payout::BlockTracker;
use crate::pplns::WindowClock;
use crate::stratum::connection::Connection;
use crate::stratum::protocol::SubmitParams;

pub struct ShareProcessor {
    validator: ShareValidator,
    clock: Arc<WindowClock>,
    publisher: EventPublisher,
    tracker: BlockTracker,
}

impl ShareProcessor {
    pub fn new(
        validator: ShareValidator,
        clock: Arc<WindowClock>,
        publisher: EventPublisher,
        tracker: BlockTracker,
    ) -> Self {
        Self {
            validator,
            clock,
            publisher,
            tracker,
        }
    }

    pub fn clock(&self) -> &Arc<WindowClock> {
        &self.clock
    }

    /// Classify a submit and emit its events. Errors are protocol
    /// violations that end the connection.
    pub fn process(
        &self,
        conn: &mut Connection,
        submit: &SubmitParams,
    ) -> Result<ShareOutcome, ProtocolError> {
        let outcome = self.validator.validate(conn, submit, self.clock.current())?;
        metrics::inc_share(&conn.tier.name, outcome.status.as_str());

        let miner = conn.miner().unwrap_or_default().to_string();
        let worker = conn.worker_id().unwrap_or_default();
        let (job_id, height) = outcome
            .job
            .as_ref()
            .map(|j| (j.id.clone(), j.height))
            .unwrap_or_else(|| (submit.job_id.clone(), 0));

        let share_event = |window_id: u64| {
            PoolEvent::Share(ShareEvent {
                id: Uuid::new_v4(),
                window_id,
                miner: miner.clone(),
                worker: worker.clone(),
                tier: conn.tier.name.clone(),
                job_id: job_id.clone(),
                height,
                status: outcome.status,
                score: outcome.score,
                timestamp: Utc::now(),
            })
        };

        match &outcome.block {
            None => self.clock.stamp(|window_id| self.publisher.publish(share_event(window_id))),
            Some(block) => {
                let window_id = self.clock.rotate(|window_id| {
                    self.publisher.publish(share_event(window_id));
                    self.publisher.publish(PoolEvent::BlockFound(BlockFoundEvent {
                        id: Uuid::new_v4(),
                        window_id,
                        height: block.height,
                        hash: block.hash.clone(),
                        miner: miner.clone(),
                        worker: worker.clone(),
                        reward: block.reward,
                        timestamp: Utc::now(),
                    }));
                    window_id
                });
                metrics::inc_blocks_found();
                metrics::set_window_id(window_id + 1);
                tracing::info!(
                    "Block found at height {} by {} on tier {}: {} (window {} closed)",
                    block.height,
                    worker,
                    conn.tier.name,
                    block.hash,
                    window_id
                );
                self.tracker.submit(window_id, block.clone());
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::template_manager::test_support::MockNode;
    use crate::bus::{BlockState, EventSource, MemoryBus, MemorySource, RetryPolicy};
    use crate::jobs::test_support::{find_nonce, job, template};
    use crate::jobs::MiningJob;
    use crate::payout::{MaturitySettings, MemoryPayoutSink};
    use crate::pow::Target;
    use crate::pplns::{Accounting, LedgerConsumer, MemoryLedgerStore, PayoutCalculator};
    use crate::shares::ShareStatus;
    use crate::stratum::Tier;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::sync::Notify;

    const EN2: [u8; 4] = [0, 0, 0, 9];

    struct Rig {
        processor: ShareProcessor,
        node: Arc<MockNode>,
        source: MemorySource,
        refresh: Arc<Notify>,
    }

    fn tracker(node: Arc<MockNode>, publisher: EventPublisher, refresh: Arc<Notify>) -> BlockTracker {
        let settings = MaturitySettings {
            confirmations: 0,
            poll_interval: Duration::from_secs(1),
        };
        BlockTracker::new(node, publisher, refresh, settings)
    }

    fn rig() -> Rig {
        let bus = Arc::new(MemoryBus::new());
        let source = bus.subscribe("ledger");
        let (publisher, _handle) = EventPublisher::spawn(bus, RetryPolicy::default());
        let node = Arc::new(MockNode::serving(template(1, 1, 0)));
        let refresh = Arc::new(Notify::new());
        let processor = ShareProcessor::new(
            ShareValidator::new(600),
            Arc::new(WindowClock::new(0)),
            publisher.clone(),
            tracker(node.clone(), publisher, refresh.clone()),
        );
        Rig {
            processor,
            node,
            source,
            refresh,
        }
    }

    fn mining_conn(j: &Arc<MiningJob>, worker: &str) -> Connection {
        let tier = Arc::new(Tier::with_target("low", 3333, Target::from_leading_zero_bits(4)));
        let mut c = Connection::new(7, "127.0.0.1:40001".parse().unwrap(), tier);
        c.subscribe(None, 4).unwrap();
        c.authorize(worker).unwrap();
        c.issue_job(j.clone());
        c
    }

    fn submit(j: &MiningJob, worker: &str, en2: &[u8], nonce: u32) -> SubmitParams {
        SubmitParams {
            worker: worker.into(),
            job_id: j.id.clone(),
            extranonce2: hex::encode(en2),
            ntime: format!("{:08x}", j.ntime),
            nonce: format!("{:08x}", nonce),
        }
    }

    async fn next_event(source: &mut MemorySource) -> PoolEvent {
        tokio::time::timeout(Duration::from_secs(2), source.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .decode()
            .unwrap()
    }

    #[tokio::test]
    async fn test_accepted_share_is_published_with_open_window() {
        let mut rig = rig();
        let j = Arc::new(job(1, true, 24));
        let mut c = mining_conn(&j, "carol.rig");
        let en1 = c.extranonce1().to_vec();
        let (tier, network) = (c.tier.share_target, j.network_target);
        let nonce = find_nonce(&j, &en1, &EN2, |h| tier.is_met_by(h) && !network.is_met_by(h));

        let out = rig.processor.process(&mut c, &submit(&j, "carol.rig", &EN2, nonce)).unwrap();
        assert_eq!(out.status, ShareStatus::Accepted);

        match next_event(&mut rig.source).await {
            PoolEvent::Share(ev) => {
                assert_eq!(ev.window_id, 0);
                assert_eq!(ev.miner, "carol");
                assert_eq!(ev.worker, "carol.rig");
                assert_eq!(ev.score, out.score);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(rig.processor.clock().current(), 0);
    }

    #[tokio::test]
    async fn test_rejected_share_is_published_with_zero_score() {
        let mut rig = rig();
        let j = Arc::new(job(1, true, 24));
        let mut c = mining_conn(&j, "carol.rig");
        let mut bad = submit(&j, "carol.rig", &EN2, 0);
        bad.nonce = "xyz".into();

        let out = rig.processor.process(&mut c, &bad).unwrap();
        assert_eq!(out.status, ShareStatus::Invalid);

        match next_event(&mut rig.source).await {
            PoolEvent::Share(ev) => {
                assert_eq!(ev.status, ShareStatus::Invalid);
                assert!(ev.score.is_zero());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_block_rotates_window_and_submits() {
        let mut rig = rig();
        let j = Arc::new(job(1, true, 8));
        let mut c = mining_conn(&j, "carol.rig");
        let en1 = c.extranonce1().to_vec();
        let network = j.network_target;
        let nonce = find_nonce(&j, &en1, &EN2, |h| network.is_met_by(h));

        let notified = rig.refresh.clone();
        let out = rig.processor.process(&mut c, &submit(&j, "carol.rig", &EN2, nonce)).unwrap();
        let block = out.block.expect("block");

        match next_event(&mut rig.source).await {
            PoolEvent::Share(ev) => assert_eq!(ev.window_id, 0),
            other => panic!("unexpected {:?}", other),
        }
        match next_event(&mut rig.source).await {
            PoolEvent::BlockFound(ev) => {
                assert_eq!(ev.window_id, 0);
                assert_eq!(ev.hash, block.hash);
                assert_eq!(ev.reward, j.block_reward);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(rig.processor.clock().current(), 1);

        // Accepted with no confirmations required: confirmed straight away
        match next_event(&mut rig.source).await {
            PoolEvent::BlockStatus(ev) => {
                assert_eq!(ev.window_id, 0);
                assert_eq!(ev.hash, block.hash);
                assert_eq!(ev.state, BlockState::Confirmed);
            }
            other => panic!("unexpected {:?}", other),
        }
        tokio::time::timeout(Duration::from_secs(2), notified.notified())
            .await
            .unwrap();
        assert_eq!(rig.node.submitted.lock().as_slice(), &[block.block_hex]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_shares_credit_their_stamped_window() {
        const MINERS: usize = 6;
        const SHARES: u8 = 40;
        const BLOCKS: u8 = 5;

        let bus = Arc::new(MemoryBus::new());
        let mut audit = bus.subscribe("audit");
        let ledger_source = bus.subscribe("ledger");
        let (publisher, _handle) = EventPublisher::spawn(bus.clone(), RetryPolicy::default());
        let node = Arc::new(MockNode::serving(template(1, 1, 0)));
        let processor = Arc::new(ShareProcessor::new(
            ShareValidator::new(600),
            Arc::new(WindowClock::new(0)),
            publisher.clone(),
            tracker(node, publisher, Arc::new(Notify::new())),
        ));

        let accounting = Accounting::new(0, PayoutCalculator::new(dec!(0.01)).unwrap(), 64).shared();
        tokio::spawn(
            LedgerConsumer::new(
                accounting.clone(),
                Box::new(ledger_source),
                Arc::new(MemoryPayoutSink::new()),
                Arc::new(MemoryLedgerStore::new()),
            )
            .run(),
        );

        let mut tasks = Vec::new();
        for m in 0..MINERS {
            let processor = processor.clone();
            tasks.push(tokio::spawn(async move {
                let worker = format!("miner{}.rig", m);
                let j = Arc::new(job(1, true, 24));
                let mut c = mining_conn(&j, &worker);
                let en1 = c.extranonce1().to_vec();
                let (tier, network) = (c.tier.share_target, j.network_target);
                for i in 0..SHARES {
                    let en2 = [m as u8, i, 0, 0];
                    let nonce = find_nonce(&j, &en1, &en2, |h| tier.is_met_by(h) && !network.is_met_by(h));
                    let out = processor.process(&mut c, &submit(&j, &worker, &en2, nonce)).unwrap();
                    assert_eq!(out.status, ShareStatus::Accepted);
                    tokio::task::yield_now().await;
                }
            }));
        }
        let finder = processor.clone();
        tasks.push(tokio::spawn(async move {
            let j = Arc::new(job(2, true, 8));
            let mut c = mining_conn(&j, "finder.rig");
            let en1 = c.extranonce1().to_vec();
            let network = j.network_target;
            for i in 0..BLOCKS {
                let en2 = [0xff, i, 0, 0];
                let nonce = find_nonce(&j, &en1, &en2, |h| network.is_met_by(h));
                let out = finder.process(&mut c, &submit(&j, "finder.rig", &en2, nonce)).unwrap();
                assert!(out.block.is_some());
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }));
        for task in tasks {
            task.await.unwrap();
        }

        // Score of every share event, summed by the window it was stamped with
        let expected = MINERS * SHARES as usize + BLOCKS as usize;
        let mut stamped: BTreeMap<u64, Decimal> = BTreeMap::new();
        let mut seen = 0;
        while seen < expected {
            if let PoolEvent::Share(ev) = next_event(&mut audit).await {
                *stamped.entry(ev.window_id).or_default() += ev.score;
                seen += 1;
            }
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while accounting.read().recent_payouts(64).len() < BLOCKS as usize {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("every window settled");

        let acc = accounting.read();
        assert_eq!(acc.stats().window_id, BLOCKS as u64);
        assert_eq!(acc.stats().pending_events, 0);
        let mut credited: BTreeMap<u64, Decimal> =
            acc.ledger().history().map(|w| (w.id, w.total_score)).collect();
        credited.insert(acc.ledger().current().id, acc.ledger().current().total_score);
        for (window_id, total) in &stamped {
            assert_eq!(credited.get(window_id), Some(total), "window {}", window_id);
        }
        for record in acc.recent_payouts(64) {
            assert_eq!(Some(&record.total_score), stamped.get(&record.window_id));
            assert!(record.is_balanced());
        }
    }
}
