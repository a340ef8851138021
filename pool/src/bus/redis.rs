/// Redis-backed exchange
///
/// Each named queue is a Redis list `{prefix}:queue:{name}`. Publishing
/// RPUSHes the payload to every queue in one MULTI block. A consumer moves
/// messages with BLMOVE into `{prefix}:processing:{name}` and removes them on
/// ack, so anything in flight when a consumer dies is requeued on restart.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{Delivery, EventBus, EventSource, PoolEvent};
use crate::error::BusError;

/// Seconds a BLMOVE waits before polling again
const BLOCK_SECS: u64 = 5;

pub fn queue_key(prefix: &str, queue: &str) -> String {
    format!("{}:queue:{}", prefix, queue)
}

pub fn processing_key(prefix: &str, queue: &str) -> String {
    format!("{}:processing:{}", prefix, queue)
}

pub struct RedisBus {
    conn: ConnectionManager,
    queue_keys: Vec<String>,
}

impl RedisBus {
    pub async fn connect(url: &str, prefix: &str, queues: &[String]) -> Result<Self, BusError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        tracing::info!("Redis bus connected: {} queues under {}", queues.len(), prefix);
        Ok(Self {
            conn,
            queue_keys: queues.iter().map(|q| queue_key(prefix, q)).collect(),
        })
    }
}

#[async_trait]
impl EventBus for RedisBus {
    async fn publish(&self, event: &PoolEvent) -> Result<(), BusError> {
        let payload = serde_json::to_string(event)?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for key in &self.queue_keys {
            pipe.rpush(key, &payload).ignore();
        }
        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

pub struct RedisSource {
    conn: ConnectionManager,
    queue: String,
    processing: String,
}

impl RedisSource {
    /// Opens a dedicated connection (BLMOVE blocks it) and requeues
    /// anything left unacknowledged by a previous consumer.
    pub async fn connect(url: &str, prefix: &str, queue: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        let mut source = Self {
            conn,
            queue: queue_key(prefix, queue),
            processing: processing_key(prefix, queue),
        };
        let requeued = source.requeue_in_flight().await?;
        if requeued > 0 {
            tracing::warn!("Requeued {} unacknowledged events on {}", requeued, source.queue);
        }
        Ok(source)
    }

    async fn requeue_in_flight(&mut self) -> Result<usize, BusError> {
        let mut moved = 0;
        loop {
            // Newest first, so the oldest in-flight message ends up at the head
            let item: Option<String> = redis::cmd("LMOVE")
                .arg(&self.processing)
                .arg(&self.queue)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut self.conn)
                .await?;
            match item {
                Some(_) => moved += 1,
                None => return Ok(moved),
            }
        }
    }
}

#[async_trait]
impl EventSource for RedisSource {
    async fn recv(&mut self) -> Result<Option<Delivery>, BusError> {
        loop {
            let item: Option<String> = redis::cmd("BLMOVE")
                .arg(&self.queue)
                .arg(&self.processing)
                .arg("LEFT")
                .arg("RIGHT")
                .arg(BLOCK_SECS)
                .query_async(&mut self.conn)
                .await?;
            if let Some(payload) = item {
                return Ok(Some(Delivery { payload }));
            }
        }
    }

    async fn try_recv(&mut self) -> Result<Option<Delivery>, BusError> {
        let item: Option<String> = redis::cmd("LMOVE")
            .arg(&self.queue)
            .arg(&self.processing)
            .arg("LEFT")
            .arg("RIGHT")
            .query_async(&mut self.conn)
            .await?;
        Ok(item.map(|payload| Delivery { payload }))
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        self.conn
            .lrem::<_, _, ()>(&self.processing, 1, &delivery.payload)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_namespaced() {
        assert_eq!(queue_key("tierpool", "ledger"), "tierpool:queue:ledger");
        assert_eq!(processing_key("tierpool", "ledger"), "tierpool:processing:ledger");
    }
}
