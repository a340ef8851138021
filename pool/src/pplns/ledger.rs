/// Share Accounting Ledger
///
/// Applies bus events in delivery order to the open payout window:
/// - share events add their score to `scores[miner]` and bump per-worker counters
/// - a repeated event id is a no-op
/// - a block-found event closes the window and opens the next one in the
///   same `&mut self` call, before any further event is applied
/// - events stamped for a window that is not open yet wait in `pending`
/// - events for an already closed window are skipped and metered
/// - a score that would overflow the window total is skipped and metered
///
/// Only the open window tracks applied event ids; closed windows keep their
/// totals and nothing else, since late events for them are skipped anyway.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use uuid::Uuid;

use crate::bus::{BlockFoundEvent, PoolEvent, ShareEvent};
use crate::metrics::prometheus as metrics;
use crate::shares::ShareStatus;
use crate::stratum::ShareCounters;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowState {
    Open,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutWindow {
    pub id: u64,
    pub state: WindowState,
    /// Height of the first job mined in this window
    pub start_height: Option<u64>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub scores: BTreeMap<String, Decimal>,
    pub total_score: Decimal,
    /// Keyed by `account.worker`
    pub workers: BTreeMap<String, ShareCounters>,
    pub shares_processed: u64,
}

impl PayoutWindow {
    fn open(id: u64, start_height: Option<u64>) -> Self {
        Self {
            id,
            state: WindowState::Open,
            start_height,
            opened_at: Utc::now(),
            closed_at: None,
            scores: BTreeMap::new(),
            total_score: Decimal::ZERO,
            workers: BTreeMap::new(),
            shares_processed: 0,
        }
    }

    pub fn score_of(&self, miner: &str) -> Decimal {
        self.scores.get(miner).copied().unwrap_or(Decimal::ZERO)
    }
}

/// Snapshot of a window at close, with the block that closed it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedWindow {
    pub window: PayoutWindow,
    pub block: BlockFoundEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStatus {
    Applied,
    /// Event id already applied
    Duplicate,
    /// Stamped for a window that is already closed
    Late,
    /// Stamped for a window that is not open yet
    Deferred,
    /// Score would overflow the window total
    Overflow,
    /// Not a ledger event
    Ignored,
}

#[derive(Debug)]
pub struct ApplyOutcome {
    pub status: ApplyStatus,
    /// Windows closed by this event, oldest first (replayed pending events
    /// can close more than one)
    pub closed: Vec<ClosedWindow>,
}

impl ApplyOutcome {
    fn status(status: ApplyStatus) -> Self {
        Self {
            status,
            closed: Vec::new(),
        }
    }
}

/// Durable part of the ledger. The applied ids of the open window are
/// persisted separately, a batch at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub window: PayoutWindow,
    pub blocks_found: u64,
    pub pending: BTreeMap<u64, Vec<PoolEvent>>,
}

pub struct ShareLedger {
    current: PayoutWindow,
    /// Event ids applied to `current`
    seen: HashSet<Uuid>,
    /// Ids applied to `current` since the last `take_fresh_ids`
    fresh: Vec<Uuid>,
    pending: BTreeMap<u64, Vec<PoolEvent>>,
    history: VecDeque<PayoutWindow>,
    history_len: usize,
    blocks_found: u64,
}

impl ShareLedger {
    pub fn new(window_id: u64, history_len: usize) -> Self {
        Self::restore(
            LedgerSnapshot {
                window: PayoutWindow::open(window_id, None),
                blocks_found: 0,
                pending: BTreeMap::new(),
            },
            HashSet::new(),
            history_len,
        )
    }

    /// Rebuild from a snapshot and the ids already applied to its window
    pub fn restore(snapshot: LedgerSnapshot, seen: HashSet<Uuid>, history_len: usize) -> Self {
        metrics::set_window_id(snapshot.window.id);
        Self {
            current: snapshot.window,
            seen,
            fresh: Vec::new(),
            pending: snapshot.pending,
            history: VecDeque::new(),
            history_len: history_len.max(1),
            blocks_found: snapshot.blocks_found,
        }
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            window: self.current.clone(),
            blocks_found: self.blocks_found,
            pending: self.pending.clone(),
        }
    }

    /// Ids applied to the open window since the previous call
    pub fn take_fresh_ids(&mut self) -> Vec<Uuid> {
        std::mem::take(&mut self.fresh)
    }

    pub fn current(&self) -> &PayoutWindow {
        &self.current
    }

    /// Recently closed windows, newest last
    pub fn history(&self) -> impl Iterator<Item = &PayoutWindow> {
        self.history.iter()
    }

    pub fn blocks_found(&self) -> u64 {
        self.blocks_found
    }

    pub fn pending_events(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    pub fn apply(&mut self, event: PoolEvent) -> ApplyOutcome {
        let (id, window_id) = match &event {
            PoolEvent::Share(e) => (e.id, e.window_id),
            PoolEvent::BlockFound(e) => (e.id, e.window_id),
            _ => return ApplyOutcome::status(ApplyStatus::Ignored),
        };

        if window_id > self.current.id {
            tracing::debug!("Deferring {} event {} for window {}", event.kind(), id, window_id);
            self.pending.entry(window_id).or_default().push(event);
            return ApplyOutcome::status(ApplyStatus::Deferred);
        }

        if window_id < self.current.id {
            // Redeliveries of applied events land here too
            tracing::debug!(
                "Late {} event {} for closed window {} (open: {})",
                event.kind(),
                id,
                window_id,
                self.current.id
            );
            metrics::inc_ledger_skipped("late");
            return ApplyOutcome::status(ApplyStatus::Late);
        }

        if self.seen.contains(&id) {
            metrics::inc_ledger_skipped("duplicate");
            return ApplyOutcome::status(ApplyStatus::Duplicate);
        }

        match event {
            PoolEvent::Share(share) => {
                let status = self.apply_share(&share);
                if status == ApplyStatus::Applied {
                    self.mark_applied(id);
                }
                ApplyOutcome::status(status)
            }
            PoolEvent::BlockFound(block) => {
                self.mark_applied(id);
                let mut closed = vec![self.close_current(block)];
                closed.extend(self.replay_pending());
                ApplyOutcome {
                    status: ApplyStatus::Applied,
                    closed,
                }
            }
            _ => ApplyOutcome::status(ApplyStatus::Ignored),
        }
    }

    fn mark_applied(&mut self, id: Uuid) {
        self.seen.insert(id);
        self.fresh.push(id);
        metrics::inc_ledger_applied();
    }

    fn apply_share(&mut self, share: &ShareEvent) -> ApplyStatus {
        let credit = share.status == ShareStatus::Accepted && share.score > Decimal::ZERO;
        let window = &mut self.current;
        let mut new_score = None;
        if credit {
            let sums = (
                window.score_of(&share.miner).checked_add(share.score),
                window.total_score.checked_add(share.score),
            );
            match sums {
                (Some(miner_score), Some(total)) => new_score = Some((miner_score, total)),
                _ => {
                    tracing::warn!(
                        "Share {} from {} would overflow window {} (score {}), skipped",
                        share.id,
                        share.miner,
                        window.id,
                        share.score
                    );
                    metrics::inc_ledger_skipped("overflow");
                    return ApplyStatus::Overflow;
                }
            }
        }

        window.start_height.get_or_insert(share.height);
        window.shares_processed += 1;

        let counters = window.workers.entry(share.worker.clone()).or_default();
        match share.status {
            ShareStatus::Accepted => counters.accepted += 1,
            ShareStatus::Stale => counters.stale += 1,
            ShareStatus::Duplicate => counters.duplicate += 1,
            ShareStatus::LowDifficulty => counters.low_difficulty += 1,
            ShareStatus::Invalid => counters.invalid += 1,
        }

        if let Some((miner_score, total)) = new_score {
            window.scores.insert(share.miner.clone(), miner_score);
            window.total_score = total;
        }
        ApplyStatus::Applied
    }

    /// Credit a closed window's scores to the open window. Used when the
    /// block that closed it never made it into the chain.
    pub fn carry_forward(&mut self, closed: &PayoutWindow) {
        let window = &mut self.current;
        for (miner, score) in &closed.scores {
            let sums = (
                window.score_of(miner).checked_add(*score),
                window.total_score.checked_add(*score),
            );
            match sums {
                (Some(miner_score), Some(total)) => {
                    window.scores.insert(miner.clone(), miner_score);
                    window.total_score = total;
                }
                _ => {
                    tracing::warn!("Carrying {} score of {} overflows window {}", score, miner, window.id);
                    metrics::inc_ledger_skipped("overflow");
                }
            }
        }
        tracing::info!(
            "Window {} scores carried into window {} ({} miners)",
            closed.id,
            window.id,
            closed.scores.len()
        );
    }

    fn close_current(&mut self, block: BlockFoundEvent) -> ClosedWindow {
        let next = PayoutWindow::open(self.current.id + 1, Some(block.height + 1));
        let mut window = std::mem::replace(&mut self.current, next);
        self.seen.clear();
        self.fresh.clear();
        window.state = WindowState::Closed;
        window.closed_at = Some(Utc::now());
        if let Some(counters) = window.workers.get_mut(&block.worker) {
            counters.blocks += 1;
        }
        self.blocks_found += 1;

        tracing::info!(
            "Window {} closed by block {} at height {}: {} miners, total score {}",
            window.id,
            block.hash,
            block.height,
            window.scores.len(),
            window.total_score
        );
        metrics::set_window_id(self.current.id);

        self.history.push_back(window.clone());
        while self.history.len() > self.history_len {
            self.history.pop_front();
        }
        ClosedWindow { window, block }
    }

    fn replay_pending(&mut self) -> Vec<ClosedWindow> {
        let mut closed = Vec::new();
        // Anything queued for windows we skipped past can never apply
        let stale: Vec<u64> = self.pending.range(..self.current.id).map(|(k, _)| *k).collect();
        for id in stale {
            if let Some(events) = self.pending.remove(&id) {
                tracing::warn!("Dropping {} pending events for window {}", events.len(), id);
                metrics::inc_ledger_skipped("late");
            }
        }
        if let Some(events) = self.pending.remove(&self.current.id) {
            for event in events {
                closed.extend(self.apply(event).closed);
            }
        }
        closed
    }
}
