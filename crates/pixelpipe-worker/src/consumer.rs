//! The processing consumer: consume, process, acknowledge
//!
//! One delivery at a time moves through the steps of the pipeline state
//! machine. The ordering invariants live here:
//!
//! - the `processing` write completes before transformation starts, so a
//!   mid-flight status query never sees a stale `pending`;
//! - the terminal status write completes before the message is
//!   acknowledged, so a crash in between redelivers the task instead of
//!   losing the outcome;
//! - events are enqueued only after acknowledgment and are best-effort.
//!
//! Failure routing: malformed payloads and store failures are rejected
//! without requeue (redelivery cannot heal them), a task for an unknown
//! or already-finalized record is acknowledged as a benign duplicate,
//! and transformation failures are split by [`TransformError::is_retriable`]
//! into a bounded requeue-with-backoff path and a terminal `failed` path.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use pixelpipe_common::queue::{enqueue_json, Delivery, WorkQueue};
use pixelpipe_common::store::ImageStore;
use pixelpipe_common::types::{
    EventEnvelope, ImageStatus, ProcessingLogEntry, TaskEnvelope, EVENT_QUEUE, TASK_QUEUE,
};
use pixelpipe_common::PipelineError;

use crate::transform::{Transform, TransformError};

/// How a delivery was settled. Returned for observability and tests; the
/// delivery itself is always settled before this is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Record completed, message acked, completion event enqueued.
    Completed,
    /// Record failed terminally, message rejected without requeue.
    FailedTerminal,
    /// Retriable failure, message requeued for another attempt.
    RetryScheduled,
    /// Unknown or already-finalized record; acked and dropped.
    DuplicateDropped,
    /// Undecodable payload; rejected without requeue.
    MalformedDropped,
    /// State store write failed; rejected without requeue.
    StoreFailure,
}

/// Retry/timeout knobs for the processing loop.
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub processed_dir: PathBuf,
    pub transform_timeout: Duration,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub max_in_flight: usize,
}

/// The pipeline's core state machine, owning its collaborators.
pub struct ProcessingWorker {
    store: Arc<dyn ImageStore>,
    queue: Arc<dyn WorkQueue>,
    transform: Arc<dyn Transform>,
    settings: ProcessorSettings,
}

impl ProcessingWorker {
    pub fn new(
        store: Arc<dyn ImageStore>,
        queue: Arc<dyn WorkQueue>,
        transform: Arc<dyn Transform>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            store,
            queue,
            transform,
            settings,
        }
    }

    /// Consume the task queue until the broker side shuts down.
    pub async fn run(self: Arc<Self>) -> Result<(), PipelineError> {
        let mut consumer = self
            .queue
            .consume(TASK_QUEUE, self.settings.max_in_flight)
            .await?;

        info!(queue = TASK_QUEUE, "Waiting for task messages");

        while let Some(delivery) = consumer.next().await {
            let outcome = self.handle_delivery(delivery).await;
            debug!(?outcome, "Task delivery settled");
        }

        info!(queue = TASK_QUEUE, "Task consumer stopped");
        Ok(())
    }

    /// Process one delivery to a settled outcome. Every path acks or
    /// rejects exactly once.
    pub async fn handle_delivery(&self, delivery: Delivery) -> TaskOutcome {
        let task: TaskEnvelope = match serde_json::from_str(delivery.payload()) {
            Ok(task) => task,
            Err(e) => {
                // Permanent: redelivery cannot fix a malformed payload.
                warn!(error = %e, "Dropping malformed task payload");
                settle_reject(delivery, false).await;
                return TaskOutcome::MalformedDropped;
            },
        };

        let image_id = task.image_id;

        let record = match self.store.get(image_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                // At-least-once delivery legitimately redelivers tasks
                // for records already finalized or removed.
                info!(image_id = %image_id, "No record for task, dropping as stale");
                settle_ack(delivery).await;
                return TaskOutcome::DuplicateDropped;
            },
            Err(e) => {
                error!(image_id = %image_id, error = %e, "State store lookup failed");
                settle_reject(delivery, false).await;
                return TaskOutcome::StoreFailure;
            },
        };

        if record.status.is_terminal() {
            info!(
                image_id = %image_id,
                status = %record.status,
                "Duplicate delivery for finalized record, dropping"
            );
            settle_ack(delivery).await;
            return TaskOutcome::DuplicateDropped;
        }

        // Status must read `processing` before any transformation work
        // begins.
        if let Err(e) = self
            .store
            .transition(
                image_id,
                ImageStatus::Processing,
                ProcessingLogEntry::info("Image processing started."),
                None,
            )
            .await
        {
            error!(image_id = %image_id, error = %e, "State store transition to processing failed");
            settle_reject(delivery, false).await;
            return TaskOutcome::StoreFailure;
        }

        let processed_filename = task.processed_filename();
        let dest = self.settings.processed_dir.join(&processed_filename);
        let original = PathBuf::from(&task.original_path);

        let result = match tokio::time::timeout(
            self.settings.transform_timeout,
            self.transform.transform(&original, &dest),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransformError::Timeout {
                path: original.clone(),
                timeout_ms: self.settings.transform_timeout.as_millis() as u64,
            }),
        };

        match result {
            Ok(()) => self.finish_completed(delivery, image_id, &processed_filename).await,
            Err(err) if err.is_retriable() && delivery.attempt() < self.settings.max_attempts => {
                warn!(
                    image_id = %image_id,
                    attempt = delivery.attempt(),
                    max_attempts = self.settings.max_attempts,
                    error = %err,
                    "Retriable transformation failure, requeueing"
                );
                // The in-flight slot is held through the backoff, which
                // is the sequential worker's natural pacing.
                tokio::time::sleep(self.settings.retry_backoff).await;
                settle_reject(delivery, true).await;
                TaskOutcome::RetryScheduled
            },
            Err(err) => self.finish_failed(delivery, image_id, err).await,
        }
    }

    async fn finish_completed(
        &self,
        delivery: Delivery,
        image_id: uuid::Uuid,
        processed_filename: &str,
    ) -> TaskOutcome {
        if let Err(e) = self
            .store
            .transition(
                image_id,
                ImageStatus::Completed,
                ProcessingLogEntry::info("Image processing completed successfully."),
                Some(processed_filename.to_string()),
            )
            .await
        {
            // Ack must not precede the durable completion write; without
            // it the outcome would be unrecoverable after a crash.
            error!(image_id = %image_id, error = %e, "State store transition to completed failed");
            settle_reject(delivery, false).await;
            return TaskOutcome::StoreFailure;
        }

        info!(image_id = %image_id, processed = %processed_filename, "Image processing completed");
        settle_ack(delivery).await;

        let event = EventEnvelope::completed(image_id, processed_filename);
        if let Err(e) = enqueue_json(self.queue.as_ref(), EVENT_QUEUE, &event).await {
            // Best-effort: status is already durable and re-derivable.
            warn!(image_id = %image_id, error = %e, "Failed to enqueue completion event");
        }

        TaskOutcome::Completed
    }

    async fn finish_failed(
        &self,
        delivery: Delivery,
        image_id: uuid::Uuid,
        err: TransformError,
    ) -> TaskOutcome {
        error!(image_id = %image_id, error = %err, "Image transformation failed");

        if let Err(store_err) = self
            .store
            .transition(
                image_id,
                ImageStatus::Failed,
                ProcessingLogEntry::error(format!("Image processing failed: {}", err)),
                None,
            )
            .await
        {
            error!(
                image_id = %image_id,
                error = %store_err,
                "State store transition to failed failed"
            );
            settle_reject(delivery, false).await;
            return TaskOutcome::StoreFailure;
        }

        settle_reject(delivery, false).await;

        let event = EventEnvelope::failed(image_id, err.to_string());
        if let Err(e) = enqueue_json(self.queue.as_ref(), EVENT_QUEUE, &event).await {
            warn!(image_id = %image_id, error = %e, "Failed to enqueue failure event");
        }

        TaskOutcome::FailedTerminal
    }
}

async fn settle_ack(delivery: Delivery) {
    if let Err(e) = delivery.ack().await {
        error!(error = %e, "Failed to acknowledge delivery");
    }
}

async fn settle_reject(delivery: Delivery, requeue: bool) {
    if let Err(e) = delivery.reject(requeue).await {
        error!(error = %e, requeue, "Failed to reject delivery");
    }
}
