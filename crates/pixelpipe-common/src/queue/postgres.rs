//! Postgres-backed durable broker
//!
//! Messages live in the `queue_messages` table (see `migrations/`). A
//! consumer claims the oldest ready row with `FOR UPDATE SKIP LOCKED`,
//! so competing consumers on the same queue never double-claim. Claimed
//! rows keep a lease (`locked_at` + lease duration); rows whose lease
//! expired are swept back to ready, which is how messages from a crashed
//! consumer get redelivered. Acknowledged rows are deleted; rows rejected
//! without requeue are parked in the `dead` state for operator triage.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error};
use uuid::Uuid;

use super::{Delivery, QueueConsumer, Settle, WorkQueue};
use crate::error::Result;

/// Default lease before an in-flight message is considered abandoned.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(300);

/// Default pause between claim attempts on an empty queue.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Durable work queue on a Postgres connection pool.
#[derive(Clone)]
pub struct PgWorkQueue {
    pool: PgPool,
    consumer_id: String,
    lease: Duration,
    poll_interval: Duration,
}

impl PgWorkQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            consumer_id: format!("pixelpipe-{}", Uuid::new_v4()),
            lease: DEFAULT_LEASE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Requeue in-flight rows whose lease expired (crashed consumers).
    async fn sweep_expired(&self, queue: &str) -> Result<u64> {
        let swept = sqlx::query(
            r#"
            UPDATE queue_messages
            SET state = 'ready', locked_by = NULL, locked_at = NULL
            WHERE queue = $1
              AND state = 'inflight'
              AND locked_at < now() - $2::interval
            "#,
        )
        .bind(queue)
        .bind(format!("{} seconds", self.lease.as_secs()))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if swept > 0 {
            debug!(queue = %queue, swept, "Requeued expired in-flight messages");
        }
        Ok(swept)
    }

    /// Claim the oldest ready message, marking it in-flight.
    async fn claim(&self, queue: &str) -> Result<Option<(Uuid, String, i32)>> {
        let row = sqlx::query(
            r#"
            UPDATE queue_messages
            SET state = 'inflight',
                locked_by = $2,
                locked_at = now(),
                attempts = attempts + 1
            WHERE id = (
                SELECT id FROM queue_messages
                WHERE queue = $1 AND state = 'ready' AND run_at <= now()
                ORDER BY enqueued_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload, attempts
            "#,
        )
        .bind(queue)
        .bind(&self.consumer_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| (r.get("id"), r.get("payload"), r.get("attempts"))))
    }
}

#[async_trait]
impl WorkQueue for PgWorkQueue {
    async fn enqueue(&self, queue: &str, payload: String) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO queue_messages (id, queue, payload, state, attempts, enqueued_at, run_at)
            VALUES ($1, $2, $3, 'ready', 0, now(), now())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(queue)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, max_in_flight: usize) -> Result<QueueConsumer> {
        let (tx, rx) = mpsc::channel(1);
        let this = self.clone();
        let queue = queue.to_string();
        let slots = std::sync::Arc::new(Semaphore::new(max_in_flight.max(1)));

        tokio::spawn(async move {
            loop {
                let permit = match slots.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };

                let (id, payload, attempts) = loop {
                    if let Err(e) = this.sweep_expired(&queue).await {
                        error!(queue = %queue, error = %e, "Lease sweep failed");
                    }
                    match this.claim(&queue).await {
                        Ok(Some(claimed)) => break claimed,
                        Ok(None) => tokio::time::sleep(this.poll_interval).await,
                        Err(e) => {
                            error!(queue = %queue, error = %e, "Claim failed");
                            tokio::time::sleep(this.poll_interval).await;
                        },
                    }
                };

                let delivery = Delivery::new(
                    payload,
                    attempts.max(1) as u32,
                    Box::new(PgSettle {
                        pool: this.pool.clone(),
                        id,
                        _permit: permit,
                    }),
                );

                if let Err(returned) = tx.send(delivery).await {
                    let _ = returned.0.reject(true).await;
                    break;
                }
            }
        });

        Ok(QueueConsumer::new(rx))
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}

struct PgSettle {
    pool: PgPool,
    id: Uuid,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl Settle for PgSettle {
    async fn ack(self: Box<Self>) -> Result<()> {
        sqlx::query("DELETE FROM queue_messages WHERE id = $1")
            .bind(self.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<()> {
        let state = if requeue { "ready" } else { "dead" };
        sqlx::query(
            r#"
            UPDATE queue_messages
            SET state = $2, locked_by = NULL, locked_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(self.id)
        .bind(state)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
