//! In-process state store
//!
//! Backs unit tests and local single-process runs with the same
//! transition semantics as the Postgres store. Can be told to fail
//! transitions, which is how the worker's persistence-failure path is
//! exercised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ImageStore, TransitionOutcome};
use crate::error::{PipelineError, Result};
use crate::types::{ImageRecord, ImageStatus, NewImageRecord, ProcessingLogEntry};

/// In-memory image store; cheap to clone, all clones share state.
#[derive(Clone, Default)]
pub struct MemoryImageStore {
    records: Arc<RwLock<HashMap<Uuid, ImageRecord>>>,
    fail_transitions: Arc<AtomicBool>,
    fail_pings: Arc<AtomicBool>,
}

impl MemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `transition` call fail with a database
    /// error. Test hook for the persistence-failure path.
    pub fn set_fail_transitions(&self, fail: bool) {
        self.fail_transitions.store(fail, Ordering::SeqCst);
    }

    /// Make `ping` fail. Test hook for the health surface.
    pub fn set_fail_pings(&self, fail: bool) {
        self.fail_pings.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ImageStore for MemoryImageStore {
    async fn create(&self, new: NewImageRecord) -> Result<ImageRecord> {
        let record = ImageRecord {
            id: Uuid::new_v4(),
            unique_filename: new.unique_filename,
            original_filename: new.original_filename,
            mime_type: new.mime_type,
            size: new.size,
            status: ImageStatus::Pending,
            processed_filename: None,
            upload_date: Utc::now(),
            processing_log: Vec::new(),
        };

        let mut records = self.records.write().await;
        records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ImageRecord>> {
        let records = self.records.read().await;
        Ok(records.get(&id).cloned())
    }

    async fn transition(
        &self,
        id: Uuid,
        target: ImageStatus,
        log_entry: ProcessingLogEntry,
        processed_filename: Option<String>,
    ) -> Result<TransitionOutcome> {
        if self.fail_transitions.load(Ordering::SeqCst) {
            return Err(PipelineError::Database(sqlx::Error::PoolClosed));
        }

        let mut records = self.records.write().await;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| PipelineError::ImageNotFound(id.to_string()))?;

        if record.status == target {
            return Ok(TransitionOutcome::AlreadyApplied(record.clone()));
        }

        if !record.status.can_transition_to(target) {
            return Err(PipelineError::IllegalTransition {
                from: record.status.to_string(),
                to: target.to_string(),
            });
        }

        record.status = target;
        if target == ImageStatus::Completed {
            record.processed_filename = processed_filename;
        }
        record.processing_log.push(log_entry);

        Ok(TransitionOutcome::Applied(record.clone()))
    }

    async fn ping(&self) -> Result<()> {
        if self.fail_pings.load(Ordering::SeqCst) {
            return Err(PipelineError::Database(sqlx::Error::PoolClosed));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::status_view;

    fn new_record() -> NewImageRecord {
        NewImageRecord {
            unique_filename: "u1.jpg".to_string(),
            original_filename: "holiday.jpg".to_string(),
            mime_type: "image/jpeg".to_string(),
            size: 2048,
        }
    }

    #[tokio::test]
    async fn create_starts_pending_with_empty_log() {
        let store = MemoryImageStore::new();
        let record = store.create(new_record()).await.unwrap();

        assert_eq!(record.status, ImageStatus::Pending);
        assert!(record.processing_log.is_empty());
        assert!(record.processed_filename.is_none());

        let fetched = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(fetched.unique_filename, "u1.jpg");
    }

    #[tokio::test]
    async fn get_unknown_id_is_none() {
        let store = MemoryImageStore::new();
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn full_lifecycle_appends_log_in_order() {
        let store = MemoryImageStore::new();
        let record = store.create(new_record()).await.unwrap();

        store
            .transition(
                record.id,
                ImageStatus::Processing,
                ProcessingLogEntry::info("Image processing started."),
                None,
            )
            .await
            .unwrap();

        let outcome = store
            .transition(
                record.id,
                ImageStatus::Completed,
                ProcessingLogEntry::info("Image processing completed successfully."),
                Some("processed-u1.jpg".to_string()),
            )
            .await
            .unwrap();

        let record = outcome.record();
        assert_eq!(record.status, ImageStatus::Completed);
        assert_eq!(record.processed_filename.as_deref(), Some("processed-u1.jpg"));
        assert_eq!(record.processing_log.len(), 2);
        assert_eq!(record.processing_log[0].message, "Image processing started.");
        assert_eq!(
            record.processing_log[1].message,
            "Image processing completed successfully."
        );
    }

    #[tokio::test]
    async fn pending_cannot_jump_to_terminal() {
        let store = MemoryImageStore::new();
        let record = store.create(new_record()).await.unwrap();

        let err = store
            .transition(
                record.id,
                ImageStatus::Completed,
                ProcessingLogEntry::info("shortcut"),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::IllegalTransition { .. }));

        // Nothing was mutated
        let record = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(record.status, ImageStatus::Pending);
        assert!(record.processing_log.is_empty());
    }

    #[tokio::test]
    async fn terminal_states_never_revert() {
        let store = MemoryImageStore::new();
        let record = store.create(new_record()).await.unwrap();
        store
            .transition(
                record.id,
                ImageStatus::Processing,
                ProcessingLogEntry::info("start"),
                None,
            )
            .await
            .unwrap();
        store
            .transition(
                record.id,
                ImageStatus::Failed,
                ProcessingLogEntry::error("decode error"),
                None,
            )
            .await
            .unwrap();

        for target in [ImageStatus::Pending, ImageStatus::Processing, ImageStatus::Completed] {
            let err = store
                .transition(record.id, target, ProcessingLogEntry::info("revert"), None)
                .await
                .unwrap_err();
            assert!(matches!(err, PipelineError::IllegalTransition { .. }));
        }
    }

    #[tokio::test]
    async fn repeated_terminal_transition_is_a_no_op() {
        let store = MemoryImageStore::new();
        let record = store.create(new_record()).await.unwrap();
        store
            .transition(
                record.id,
                ImageStatus::Processing,
                ProcessingLogEntry::info("start"),
                None,
            )
            .await
            .unwrap();
        store
            .transition(
                record.id,
                ImageStatus::Completed,
                ProcessingLogEntry::info("done"),
                Some("processed-u1.jpg".to_string()),
            )
            .await
            .unwrap();

        let outcome = store
            .transition(
                record.id,
                ImageStatus::Completed,
                ProcessingLogEntry::info("done"),
                Some("processed-u1.jpg".to_string()),
            )
            .await
            .unwrap();

        assert!(matches!(outcome, TransitionOutcome::AlreadyApplied(_)));
        let record = store.get(record.id).await.unwrap().unwrap();
        // No extra log entry from the duplicate write
        assert_eq!(record.processing_log.len(), 2);
    }

    #[tokio::test]
    async fn transition_on_unknown_id_fails() {
        let store = MemoryImageStore::new();
        let err = store
            .transition(
                Uuid::new_v4(),
                ImageStatus::Processing,
                ProcessingLogEntry::info("start"),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ImageNotFound(_)));
    }

    #[tokio::test]
    async fn status_view_reflects_processed_path() {
        let store = MemoryImageStore::new();
        let record = store.create(new_record()).await.unwrap();

        let view = status_view(&store, record.id).await.unwrap().unwrap();
        assert_eq!(view.status, ImageStatus::Pending);
        assert_eq!(view.original_path, "original/u1.jpg");
        assert!(view.processed_path.is_none());

        assert!(status_view(&store, Uuid::new_v4()).await.unwrap().is_none());
    }
}
