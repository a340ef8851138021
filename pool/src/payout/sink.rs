/// Payout sink - append-only stream of payout records
///
/// At most one record is stored per window: a window settled again after a
/// restart is skipped.
///
/// ## Redis Keys
/// - payout:records → LIST of record JSON, oldest first
/// - payout:miner:{account} → LIST of `{window_id, height, amount}` JSON
/// - payout:settled → SET of window ids with a stored record

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::json;

use crate::pplns::PayoutRecord;

const SETTLED_KEY: &str = "payout:settled";

#[async_trait]
pub trait PayoutSink: Send + Sync {
    /// Store `record` unless its window already has one
    async fn append(&self, record: &PayoutRecord) -> Result<()>;
}

/// Keeps every record in memory; used by tests and single-node setups
#[derive(Default)]
pub struct MemoryPayoutSink {
    records: Mutex<Vec<PayoutRecord>>,
}

impl MemoryPayoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<PayoutRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl PayoutSink for MemoryPayoutSink {
    async fn append(&self, record: &PayoutRecord) -> Result<()> {
        let mut records = self.records.lock();
        if records.iter().any(|r| r.window_id == record.window_id) {
            tracing::debug!("Payout for window {} already stored", record.window_id);
            return Ok(());
        }
        records.push(record.clone());
        Ok(())
    }
}

pub struct RedisPayoutSink {
    conn: ConnectionManager,
}

impl RedisPayoutSink {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| anyhow!("Failed to create Redis client: {}", e))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| anyhow!("Failed to connect payout sink: {}", e))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl PayoutSink for RedisPayoutSink {
    async fn append(&self, record: &PayoutRecord) -> Result<()> {
        let mut conn = self.conn.clone();
        let settled: bool = conn
            .sismember(SETTLED_KEY, record.window_id)
            .await
            .map_err(|e| anyhow!("Failed to check settled windows: {}", e))?;
        if settled {
            tracing::debug!("Payout for window {} already stored", record.window_id);
            return Ok(());
        }

        let payload = serde_json::to_string(record)?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.sadd(SETTLED_KEY, record.window_id).ignore();
        pipe.rpush("payout:records", &payload).ignore();
        for (miner, amount) in &record.rewards {
            let entry = json!({
                "window_id": record.window_id,
                "height": record.block_height,
                "amount": amount,
            })
            .to_string();
            pipe.rpush(format!("payout:miner:{}", miner), entry).ignore();
        }

        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to store payout record: {}", e))?;
        Ok(())
    }
}
