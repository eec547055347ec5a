//! Image state-store client
//!
//! The store is the single source of truth for per-image status. The
//! worker writes status transitions through [`ImageStore::transition`],
//! which enforces the forward-only state machine and absorbs duplicate
//! terminal writes as no-ops, so an at-least-once queue can never corrupt
//! a record.
//!
//! Backends: [`postgres::PgImageStore`] for production,
//! [`memory::MemoryImageStore`] as the substitutable in-process fake.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{
    ImageRecord, ImageStatus, ImageStatusView, NewImageRecord, ProcessingLogEntry,
};

pub use memory::MemoryImageStore;
pub use postgres::PgImageStore;

/// Result of a [`ImageStore::transition`] call.
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    /// The transition was applied and one log entry appended.
    Applied(ImageRecord),
    /// The record was already in the target status; nothing changed.
    /// This is the duplicate-delivery path, not an error.
    AlreadyApplied(ImageRecord),
}

impl TransitionOutcome {
    pub fn record(&self) -> &ImageRecord {
        match self {
            TransitionOutcome::Applied(record) => record,
            TransitionOutcome::AlreadyApplied(record) => record,
        }
    }
}

/// Persistence of per-image status and the append-only processing log.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Create a record in `Pending` status. Called by the ingestion
    /// gateway before the task envelope is enqueued.
    async fn create(&self, new: NewImageRecord) -> Result<ImageRecord>;

    /// Fetch a record, `None` if it does not exist.
    async fn get(&self, id: Uuid) -> Result<Option<ImageRecord>>;

    /// Move a record to `target`, appending `log_entry`.
    ///
    /// - a repeat of the current status is an idempotent no-op
    ///   ([`TransitionOutcome::AlreadyApplied`]), with no log append;
    /// - an illegal transition (backwards, out of a terminal state,
    ///   `Pending` straight to a terminal state) fails without mutating
    ///   anything;
    /// - `processed_filename` is only honored on the transition into
    ///   `Completed`.
    async fn transition(
        &self,
        id: Uuid,
        target: ImageStatus,
        log_entry: ProcessingLogEntry,
        processed_filename: Option<String>,
    ) -> Result<TransitionOutcome>;

    /// Liveness probe for the health surface.
    async fn ping(&self) -> Result<()>;
}

/// The external status-query contract: `{id, status, originalPath,
/// processedPath|null}`.
pub async fn status_view(store: &dyn ImageStore, id: Uuid) -> Result<Option<ImageStatusView>> {
    Ok(store.get(id).await?.map(|r| ImageStatusView::from_record(&r)))
}
