use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;

use super::{Delivery, EventBus, EventSource, PoolEvent};
use crate::error::BusError;

/// In-process exchange: each bound queue is an unbounded channel
#[derive(Default)]
pub struct MemoryBus {
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a queue. Rebinding a name replaces the previous consumer.
    pub fn subscribe(&self, queue: &str) -> MemorySource {
        let (tx, rx) = mpsc::unbounded_channel();
        self.queues.lock().insert(queue.to_string(), tx);
        MemorySource { rx }
    }

    /// Push a payload as-is to every queue
    pub fn publish_raw(&self, payload: &str) {
        let mut queues = self.queues.lock();
        queues.retain(|name, tx| {
            let open = tx.send(payload.to_string()).is_ok();
            if !open {
                tracing::debug!("Memory bus queue {} dropped its consumer", name);
            }
            open
        });
    }

    pub fn queue_count(&self) -> usize {
        self.queues.lock().len()
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, event: &PoolEvent) -> Result<(), BusError> {
        let payload = serde_json::to_string(event)?;
        self.publish_raw(&payload);
        Ok(())
    }
}

pub struct MemorySource {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl EventSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<Delivery>, BusError> {
        Ok(self.rx.recv().await.map(|payload| Delivery { payload }))
    }

    async fn try_recv(&mut self) -> Result<Option<Delivery>, BusError> {
        Ok(self.rx.try_recv().ok().map(|payload| Delivery { payload }))
    }

    async fn ack(&mut self, _delivery: &Delivery) -> Result<(), BusError> {
        Ok(())
    }
}
