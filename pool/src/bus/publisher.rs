/// Event Publisher
///
/// Connection tasks hand events to `EventPublisher::publish`, which never
/// blocks. A single background task delivers them to the bus in FIFO order,
/// retrying with backoff. Events that still fail are kept in a local buffer,
/// flagged through the `bus_buffered_events` gauge, and flushed on a timer.
/// Nothing is dropped while the process lives.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{EventBus, PoolEvent};
use crate::error::BusError;
use crate::metrics::prometheus as metrics;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Publish attempts per event before it is buffered
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// How often a non-empty buffer is retried
    pub flush_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            flush_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::UnboundedSender<PoolEvent>,
}

impl EventPublisher {
    pub fn spawn(bus: Arc<dyn EventBus>, policy: RetryPolicy) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(bus, policy, rx));
        (Self { tx }, handle)
    }

    /// Queue an event for the publisher task
    pub fn publish(&self, event: PoolEvent) {
        if let Err(e) = self.tx.send(event) {
            tracing::error!("Publisher task gone, event {} not queued", e.0.id());
        }
    }
}

async fn run(bus: Arc<dyn EventBus>, policy: RetryPolicy, mut rx: mpsc::UnboundedReceiver<PoolEvent>) {
    let mut buffer: VecDeque<PoolEvent> = VecDeque::new();
    let mut flush = tokio::time::interval(policy.flush_interval);
    flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(event) => {
                    // With a backlog, new arrivals get one attempt; the timer retries the rest
                    let attempts = if buffer.is_empty() { policy.attempts } else { 1 };
                    buffer.push_back(event);
                    drain(bus.as_ref(), &policy, &mut buffer, attempts).await;
                }
                None => {
                    drain(bus.as_ref(), &policy, &mut buffer, policy.attempts).await;
                    if !buffer.is_empty() {
                        tracing::error!("Publisher stopping with {} undelivered events", buffer.len());
                    }
                    break;
                }
            },
            _ = flush.tick(), if !buffer.is_empty() => {
                drain(bus.as_ref(), &policy, &mut buffer, policy.attempts).await;
            }
        }
    }
}

async fn drain(bus: &dyn EventBus, policy: &RetryPolicy, buffer: &mut VecDeque<PoolEvent>, attempts: u32) {
    while let Some(event) = buffer.front() {
        match publish_with_retry(bus, policy, event, attempts).await {
            Ok(()) => {
                metrics::inc_bus_published();
                buffer.pop_front();
            }
            Err(e) => {
                tracing::warn!(
                    "Bus publish failed for {} event {}: {} ({} buffered)",
                    event.kind(),
                    event.id(),
                    e,
                    buffer.len()
                );
                break;
            }
        }
    }
    metrics::set_bus_buffered(buffer.len());
}

async fn publish_with_retry(
    bus: &dyn EventBus,
    policy: &RetryPolicy,
    event: &PoolEvent,
    attempts: u32,
) -> Result<(), BusError> {
    let mut backoff = policy.initial_backoff;
    let mut attempt = 1;
    loop {
        match bus.publish(event).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                metrics::inc_bus_publish_failures();
                if attempt >= attempts.max(1) {
                    return Err(e);
                }
                tracing::debug!("Bus publish attempt {} failed: {}", attempt, e);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(policy.max_backoff);
                attempt += 1;
            }
        }
    }
}
