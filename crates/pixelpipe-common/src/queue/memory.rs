//! In-process broker with the full settle contract
//!
//! Used by unit tests and local single-process runs. Durability is the
//! process lifetime; everything else (manual acknowledgment, bounded
//! in-flight deliveries, redelivery on reject-with-requeue, dead messages
//! on reject-without-requeue) matches the Postgres broker.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify, OwnedSemaphorePermit, Semaphore};

use super::{Delivery, QueueConsumer, Settle, WorkQueue};
use crate::error::Result;

#[derive(Debug)]
struct StoredMessage {
    payload: String,
    /// Completed delivery count; incremented when the message is handed out.
    attempts: u32,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    dead: Vec<StoredMessage>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct Shared {
    queues: Mutex<HashMap<String, QueueState>>,
}

impl Shared {
    async fn queue_notify(&self, queue: &str) -> Arc<Notify> {
        let mut queues = self.queues.lock().await;
        queues.entry(queue.to_string()).or_default().notify.clone()
    }

    async fn pop_ready(&self, queue: &str) -> Option<StoredMessage> {
        let mut queues = self.queues.lock().await;
        queues.get_mut(queue)?.ready.pop_front()
    }

    async fn push_ready(&self, queue: &str, msg: StoredMessage, front: bool) {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        if front {
            state.ready.push_front(msg);
        } else {
            state.ready.push_back(msg);
        }
        state.notify.notify_one();
    }

    async fn push_dead(&self, queue: &str, msg: StoredMessage) {
        let mut queues = self.queues.lock().await;
        queues.entry(queue.to_string()).or_default().dead.push(msg);
    }
}

/// In-memory work queue; cheap to clone, all clones share state.
#[derive(Clone, Default)]
pub struct MemoryWorkQueue {
    shared: Arc<Shared>,
}

impl MemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages waiting for delivery (test introspection).
    pub async fn ready_len(&self, queue: &str) -> usize {
        let queues = self.shared.queues.lock().await;
        queues.get(queue).map_or(0, |s| s.ready.len())
    }

    /// Number of messages rejected without requeue (test introspection).
    pub async fn dead_len(&self, queue: &str) -> usize {
        let queues = self.shared.queues.lock().await;
        queues.get(queue).map_or(0, |s| s.dead.len())
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn enqueue(&self, queue: &str, payload: String) -> Result<()> {
        self.shared
            .push_ready(
                queue,
                StoredMessage {
                    payload,
                    attempts: 0,
                },
                false,
            )
            .await;
        Ok(())
    }

    async fn consume(&self, queue: &str, max_in_flight: usize) -> Result<QueueConsumer> {
        let (tx, rx) = mpsc::channel(1);
        let shared = self.shared.clone();
        let queue = queue.to_string();
        let slots = Arc::new(Semaphore::new(max_in_flight.max(1)));

        tokio::spawn(async move {
            loop {
                // Each in-flight delivery holds one slot until settled.
                let permit = match slots.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };

                let mut msg = loop {
                    let notify = shared.queue_notify(&queue).await;
                    let notified = notify.notified();
                    match shared.pop_ready(&queue).await {
                        Some(msg) => break msg,
                        None => notified.await,
                    }
                };

                msg.attempts += 1;
                let attempt = msg.attempts;
                let payload = msg.payload.clone();
                let delivery = Delivery::new(
                    payload,
                    attempt,
                    Box::new(MemorySettle {
                        shared: shared.clone(),
                        queue: queue.clone(),
                        msg,
                        _permit: permit,
                    }),
                );

                if let Err(returned) = tx.send(delivery).await {
                    // Consumer session closed; make the message eligible
                    // for redelivery to the next session.
                    let _ = returned.0.reject(true).await;
                    break;
                }
            }
        });

        Ok(QueueConsumer::new(rx))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

struct MemorySettle {
    shared: Arc<Shared>,
    queue: String,
    msg: StoredMessage,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl Settle for MemorySettle {
    async fn ack(self: Box<Self>) -> Result<()> {
        // Dropping the message removes it; dropping the permit frees the
        // in-flight slot.
        Ok(())
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<()> {
        let this = *self;
        if requeue {
            // Front of the queue, so a redelivered message keeps its
            // position relative to this consumer session.
            this.shared.push_ready(&this.queue, this.msg, true).await;
        } else {
            this.shared.push_dead(&this.queue, this.msg).await;
        }
        Ok(())
    }
}
