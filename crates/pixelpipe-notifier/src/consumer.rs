//! The notification fanout consumer
//!
//! Pulls event envelopes off the notification queue and relays each one
//! to every configured sink. Sink delivery is best-effort: a failed sink
//! is logged and the event is still acknowledged, because an event is
//! derived state (the status record remains the source of truth) and a
//! requeue loop over a permanently broken sink would starve the queue.
//! Only undecodable payloads are rejected, without requeue.

use std::sync::Arc;

use tracing::{debug, info, warn};

use pixelpipe_common::queue::{Delivery, WorkQueue};
use pixelpipe_common::types::{EventEnvelope, EVENT_QUEUE};
use pixelpipe_common::PipelineError;

use crate::sink::NotificationSink;

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutOutcome {
    /// Event relayed; some sinks may still have failed individually.
    Relayed { failed_sinks: usize },
    /// Undecodable payload, rejected without requeue.
    MalformedDropped,
}

/// Relays events from the notification queue to a fixed set of sinks.
pub struct NotificationFanout {
    queue: Arc<dyn WorkQueue>,
    sinks: Vec<Arc<dyn NotificationSink>>,
    max_in_flight: usize,
}

impl NotificationFanout {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        sinks: Vec<Arc<dyn NotificationSink>>,
        max_in_flight: usize,
    ) -> Self {
        Self {
            queue,
            sinks,
            max_in_flight,
        }
    }

    /// Consume the notification queue until the broker side shuts down.
    pub async fn run(self: Arc<Self>) -> Result<(), PipelineError> {
        let mut consumer = self.queue.consume(EVENT_QUEUE, self.max_in_flight).await?;

        info!(
            queue = EVENT_QUEUE,
            sinks = self.sinks.len(),
            "Waiting for event messages"
        );

        while let Some(delivery) = consumer.next().await {
            let outcome = self.handle_delivery(delivery).await;
            debug!(?outcome, "Event delivery settled");
        }

        info!(queue = EVENT_QUEUE, "Event consumer stopped");
        Ok(())
    }

    /// Relay one delivery to every sink, then settle it.
    pub async fn handle_delivery(&self, delivery: Delivery) -> FanoutOutcome {
        let event: EventEnvelope = match serde_json::from_str(delivery.payload()) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Dropping malformed event payload");
                if let Err(e) = delivery.reject(false).await {
                    warn!(error = %e, "Failed to reject malformed event");
                }
                return FanoutOutcome::MalformedDropped;
            },
        };

        let mut failed_sinks = 0;
        for sink in &self.sinks {
            if let Err(e) = sink.deliver(&event).await {
                warn!(
                    sink = sink.name(),
                    image_id = %event.image_id,
                    error = %e,
                    "Sink delivery failed, skipping"
                );
                failed_sinks += 1;
            }
        }

        if let Err(e) = delivery.ack().await {
            warn!(image_id = %event.image_id, error = %e, "Failed to acknowledge event");
        }

        FanoutOutcome::Relayed { failed_sinks }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use uuid::Uuid;

    use pixelpipe_common::queue::{enqueue_json, MemoryWorkQueue};
    use crate::error::{NotifierError, NotifierResult};

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        async fn deliver(&self, event: &EventEnvelope) -> NotifierResult<()> {
            self.delivered.lock().unwrap().push(event.image_id);
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl NotificationSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        async fn deliver(&self, _event: &EventEnvelope) -> NotifierResult<()> {
            Err(NotifierError::Sink("endpoint down".to_string()))
        }
    }

    async fn next_event_delivery(queue: &MemoryWorkQueue) -> Delivery {
        let mut consumer = queue.consume(EVENT_QUEUE, 1).await.unwrap();
        consumer.next().await.unwrap()
    }

    #[tokio::test]
    async fn event_reaches_every_sink_and_is_acked() {
        let queue = MemoryWorkQueue::new();
        let first = Arc::new(RecordingSink::default());
        let second = Arc::new(RecordingSink::default());
        let fanout = NotificationFanout::new(
            Arc::new(queue.clone()),
            vec![first.clone(), second.clone()],
            1,
        );

        let image_id = Uuid::new_v4();
        let event = EventEnvelope::completed(image_id, "processed-u1.jpg");
        enqueue_json(&queue, EVENT_QUEUE, &event).await.unwrap();

        let delivery = next_event_delivery(&queue).await;
        let outcome = fanout.handle_delivery(delivery).await;
        assert_eq!(outcome, FanoutOutcome::Relayed { failed_sinks: 0 });

        assert_eq!(*first.delivered.lock().unwrap(), vec![image_id]);
        assert_eq!(*second.delivered.lock().unwrap(), vec![image_id]);
        assert_eq!(queue.ready_len(EVENT_QUEUE).await, 0);
        assert_eq!(queue.dead_len(EVENT_QUEUE).await, 0);
    }

    #[tokio::test]
    async fn failing_sink_does_not_block_others_or_requeue() {
        let queue = MemoryWorkQueue::new();
        let recording = Arc::new(RecordingSink::default());
        let fanout = NotificationFanout::new(
            Arc::new(queue.clone()),
            vec![Arc::new(FailingSink) as Arc<dyn NotificationSink>, recording.clone()],
            1,
        );

        let event = EventEnvelope::failed(Uuid::new_v4(), "decode error".to_string());
        enqueue_json(&queue, EVENT_QUEUE, &event).await.unwrap();

        let delivery = next_event_delivery(&queue).await;
        let outcome = fanout.handle_delivery(delivery).await;
        assert_eq!(outcome, FanoutOutcome::Relayed { failed_sinks: 1 });

        // The healthy sink still got it, and the event is not requeued
        assert_eq!(recording.delivered.lock().unwrap().len(), 1);
        assert_eq!(queue.ready_len(EVENT_QUEUE).await, 0);
        assert_eq!(queue.dead_len(EVENT_QUEUE).await, 0);
    }

    #[tokio::test]
    async fn malformed_event_is_rejected_without_requeue() {
        let queue = MemoryWorkQueue::new();
        let recording = Arc::new(RecordingSink::default());
        let fanout =
            NotificationFanout::new(Arc::new(queue.clone()), vec![recording.clone()], 1);

        queue
            .enqueue(EVENT_QUEUE, "{broken".to_string())
            .await
            .unwrap();

        let delivery = next_event_delivery(&queue).await;
        let outcome = fanout.handle_delivery(delivery).await;
        assert_eq!(outcome, FanoutOutcome::MalformedDropped);

        assert!(recording.delivered.lock().unwrap().is_empty());
        assert_eq!(queue.dead_len(EVENT_QUEUE).await, 1);
    }

    #[tokio::test]
    async fn duplicate_events_are_delivered_again() {
        let queue = MemoryWorkQueue::new();
        let recording = Arc::new(RecordingSink::default());
        let fanout =
            NotificationFanout::new(Arc::new(queue.clone()), vec![recording.clone()], 1);

        let image_id = Uuid::new_v4();
        let event = EventEnvelope::completed(image_id, "processed-u1.jpg");
        enqueue_json(&queue, EVENT_QUEUE, &event).await.unwrap();
        enqueue_json(&queue, EVENT_QUEUE, &event).await.unwrap();

        let mut consumer = queue.consume(EVENT_QUEUE, 1).await.unwrap();
        for _ in 0..2 {
            let delivery = consumer.next().await.unwrap();
            fanout.handle_delivery(delivery).await;
        }

        // At-least-once: the sink sees the duplicate too
        assert_eq!(*recording.delivered.lock().unwrap(), vec![image_id, image_id]);
    }
}
