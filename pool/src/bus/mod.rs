/// Pool message bus
///
/// One logical exchange fanning out to named queues. Delivery is
/// at-least-once, so consumers dedupe on the event id. Publishing goes
/// through `EventPublisher`, which owns the single FIFO publisher task.

pub mod event;
pub mod memory;
pub mod publisher;
pub mod redis;

use async_trait::async_trait;

use crate::error::BusError;

pub use event::{BlockFoundEvent, BlockState, BlockStatusEvent, JobEvent, PoolEvent, ShareEvent};
pub use memory::{MemoryBus, MemorySource};
pub use publisher::{EventPublisher, RetryPolicy};
pub use self::redis::{RedisBus, RedisSource};

/// Producer side of the exchange
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Deliver one event to every bound queue
    async fn publish(&self, event: &PoolEvent) -> Result<(), BusError>;
}

/// Consumer side of one named queue
#[async_trait]
pub trait EventSource: Send {
    /// Next message, or `None` once the queue is closed
    async fn recv(&mut self) -> Result<Option<Delivery>, BusError>;

    /// Next message if one is already queued; never waits
    async fn try_recv(&mut self) -> Result<Option<Delivery>, BusError>;

    /// Confirm a message was fully processed
    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BusError>;
}

/// Raw message as received. Decoding is left to the consumer so malformed
/// payloads can be skipped and still acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub payload: String,
}

impl Delivery {
    pub fn decode(&self) -> Result<PoolEvent, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}
