/// Ledger checkpoints
///
/// The ledger consumer commits a checkpoint before it acknowledges the events
/// the checkpoint covers. After a restart the ledger resumes from the last
/// commit and the bus redelivers everything after it.
///
/// ## Redis Keys
/// - {prefix}:ledger:state → checkpoint JSON
/// - {prefix}:ledger:seen:{window_id} → SET of event ids applied to that open window

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use super::calculator::PayoutRecord;
use super::ledger::{ClosedWindow, LedgerSnapshot};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerCheckpoint {
    pub ledger: LedgerSnapshot,
    pub carried: u64,
    pub last_block_reward: Option<u64>,
    pub malformed: u64,
    /// Newest last
    pub payouts: Vec<PayoutRecord>,
    /// Closed windows whose block has not settled yet
    pub awaiting: Vec<ClosedWindow>,
}

/// Checkpoint plus the ids already applied to its open window
#[derive(Debug, Clone)]
pub struct RestoredLedger {
    pub checkpoint: LedgerCheckpoint,
    pub seen: HashSet<Uuid>,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn load(&self) -> Result<Option<RestoredLedger>>;

    /// Store `checkpoint` and add `applied` to the id set of its open
    /// window. Id sets of earlier windows may be dropped.
    async fn commit(&self, checkpoint: &LedgerCheckpoint, applied: &[Uuid]) -> Result<()>;
}

/// Process-local store; a restart inside the same process (tests) resumes
#[derive(Default)]
pub struct MemoryLedgerStore {
    state: Mutex<Option<RestoredLedger>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn committed_window(&self) -> Option<u64> {
        self.state.lock().as_ref().map(|s| s.checkpoint.ledger.window.id)
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn load(&self) -> Result<Option<RestoredLedger>> {
        Ok(self.state.lock().clone())
    }

    async fn commit(&self, checkpoint: &LedgerCheckpoint, applied: &[Uuid]) -> Result<()> {
        let mut state = self.state.lock();
        let window_id = checkpoint.ledger.window.id;
        let mut seen = match state.take() {
            Some(prev) if prev.checkpoint.ledger.window.id == window_id => prev.seen,
            _ => HashSet::new(),
        };
        seen.extend(applied.iter().copied());
        *state = Some(RestoredLedger {
            checkpoint: checkpoint.clone(),
            seen,
        });
        Ok(())
    }
}

pub fn state_key(prefix: &str) -> String {
    format!("{}:ledger:state", prefix)
}

pub fn seen_key(prefix: &str, window_id: u64) -> String {
    format!("{}:ledger:seen:{}", prefix, window_id)
}

pub struct RedisLedgerStore {
    conn: ConnectionManager,
    prefix: String,
    /// Open window of the last commit
    committed_window: Mutex<Option<u64>>,
}

impl RedisLedgerStore {
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| anyhow!("Failed to create Redis client: {}", e))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| anyhow!("Failed to connect ledger store: {}", e))?;
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
            committed_window: Mutex::new(None),
        })
    }
}

#[async_trait]
impl LedgerStore for RedisLedgerStore {
    async fn load(&self) -> Result<Option<RestoredLedger>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(state_key(&self.prefix))
            .await
            .map_err(|e| anyhow!("Failed to read ledger checkpoint: {}", e))?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let checkpoint: LedgerCheckpoint = serde_json::from_str(&raw)?;
        let window_id = checkpoint.ledger.window.id;

        let ids: Vec<String> = conn
            .smembers(seen_key(&self.prefix, window_id))
            .await
            .map_err(|e| anyhow!("Failed to read applied ids: {}", e))?;
        let seen = ids.iter().filter_map(|id| Uuid::parse_str(id).ok()).collect();

        *self.committed_window.lock() = Some(window_id);
        Ok(Some(RestoredLedger { checkpoint, seen }))
    }

    async fn commit(&self, checkpoint: &LedgerCheckpoint, applied: &[Uuid]) -> Result<()> {
        let window_id = checkpoint.ledger.window.id;
        let previous = *self.committed_window.lock();

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.set(state_key(&self.prefix), serde_json::to_string(checkpoint)?)
            .ignore();
        if !applied.is_empty() {
            let ids: Vec<String> = applied.iter().map(Uuid::to_string).collect();
            pipe.sadd(seen_key(&self.prefix, window_id), ids).ignore();
        }
        if let Some(prev) = previous.filter(|prev| *prev < window_id) {
            let retired: Vec<String> = (prev..window_id).map(|id| seen_key(&self.prefix, id)).collect();
            pipe.del(retired).ignore();
        }

        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to commit ledger checkpoint: {}", e))?;
        *self.committed_window.lock() = Some(window_id);
        Ok(())
    }
}
