//! Durable work-queue abstraction
//!
//! The delivery channel between the ingestion gateway, the processing
//! worker, and the notification fanout. Semantics:
//!
//! - `enqueue` publishes durably: a message is not removed from the
//!   broker's log until a consumer explicitly acknowledges it.
//! - `consume` hands out [`Delivery`] values; `max_in_flight` bounds the
//!   number of unacknowledged deliveries a single consumer holds at once
//!   (backpressure against slow consumers).
//! - A delivery must be settled exactly once: [`Delivery::ack`] removes
//!   the message, [`Delivery::reject`] drops it or requeues it for
//!   redelivery. Messages whose consumer disappears are redelivered.
//! - Delivery is at-least-once; consumers are idempotent. No ordering is
//!   guaranteed across different messages.
//!
//! Brokers: [`postgres::PgWorkQueue`] for production,
//! [`memory::MemoryWorkQueue`] as the substitutable in-process fake.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{PipelineError, Result};

pub use memory::MemoryWorkQueue;
pub use postgres::PgWorkQueue;

/// Settlement backend for one delivery. Implemented per broker.
#[async_trait]
pub trait Settle: Send {
    async fn ack(self: Box<Self>) -> Result<()>;
    async fn reject(self: Box<Self>, requeue: bool) -> Result<()>;
}

/// One message handed to a consumer, holding its in-flight slot until
/// settled.
pub struct Delivery {
    payload: String,
    attempt: u32,
    settle: Box<dyn Settle>,
}

impl Delivery {
    pub fn new(payload: String, attempt: u32, settle: Box<dyn Settle>) -> Self {
        Self {
            payload,
            attempt,
            settle,
        }
    }

    /// Raw message body (JSON text for pixelpipe envelopes).
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Delivery count for this message, 1 on first delivery.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Acknowledge: the message is done and removed from the queue.
    pub async fn ack(self) -> Result<()> {
        self.settle.ack().await
    }

    /// Reject: with `requeue` the message becomes eligible for
    /// redelivery, otherwise it is dropped permanently (poison messages,
    /// terminal failures).
    pub async fn reject(self, requeue: bool) -> Result<()> {
        self.settle.reject(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("payload", &self.payload)
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// Pull side of a consumer session.
pub struct QueueConsumer {
    deliveries: mpsc::Receiver<Delivery>,
}

impl QueueConsumer {
    pub fn new(deliveries: mpsc::Receiver<Delivery>) -> Self {
        Self { deliveries }
    }

    /// Next delivery, or `None` once the broker side has shut down.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.deliveries.recv().await
    }
}

/// A durable, ordered-per-consumer delivery channel.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Publish a message durably to the named queue.
    async fn enqueue(&self, queue: &str, payload: String) -> Result<()>;

    /// Open a consumer session on the named queue. `max_in_flight` bounds
    /// unacknowledged deliveries held concurrently.
    async fn consume(&self, queue: &str, max_in_flight: usize) -> Result<QueueConsumer>;

    /// Liveness probe for the health surface.
    async fn ping(&self) -> Result<()>;
}

/// Serialize a value and publish it to the named queue.
pub async fn enqueue_json<T: Serialize>(
    queue: &dyn WorkQueue,
    name: &str,
    value: &T,
) -> Result<()> {
    let payload = serde_json::to_string(value).map_err(PipelineError::Serialization)?;
    queue.enqueue(name, payload).await
}
