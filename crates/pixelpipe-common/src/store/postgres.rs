//! Postgres-backed state store
//!
//! Records live in the `images` table (see `migrations/`); the processing
//! log is a jsonb array appended in SQL so an append can never drop or
//! reorder earlier entries. Transitions use a guarded UPDATE
//! (`WHERE status = <observed>`), so two workers racing on the same
//! record can only interleave into legal forward transitions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{ImageStore, TransitionOutcome};
use crate::error::{PipelineError, Result};
use crate::types::{ImageRecord, ImageStatus, NewImageRecord, ProcessingLogEntry};

/// Image store on a Postgres connection pool.
#[derive(Clone)]
pub struct PgImageStore {
    pool: PgPool,
}

impl PgImageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn record_from_row(row: &PgRow) -> Result<ImageRecord> {
        let status: String = row.get("status");
        let status = status
            .parse::<ImageStatus>()
            .map_err(PipelineError::Parse)?;

        let log_json: serde_json::Value = row.get("processing_log");
        let processing_log: Vec<ProcessingLogEntry> = serde_json::from_value(log_json)?;

        let upload_date: DateTime<Utc> = row.get("upload_date");

        Ok(ImageRecord {
            id: row.get("id"),
            unique_filename: row.get("unique_filename"),
            original_filename: row.get("original_filename"),
            mime_type: row.get("mime_type"),
            size: row.get("size"),
            status,
            processed_filename: row.get("processed_filename"),
            upload_date,
            processing_log,
        })
    }
}

#[async_trait]
impl ImageStore for PgImageStore {
    async fn create(&self, new: NewImageRecord) -> Result<ImageRecord> {
        let row = sqlx::query(
            r#"
            INSERT INTO images
                (id, unique_filename, original_filename, mime_type, size,
                 status, processed_filename, upload_date, processing_log)
            VALUES ($1, $2, $3, $4, $5, 'pending', NULL, now(), '[]'::jsonb)
            RETURNING id, unique_filename, original_filename, mime_type, size,
                      status, processed_filename, upload_date, processing_log
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.unique_filename)
        .bind(new.original_filename)
        .bind(new.mime_type)
        .bind(new.size)
        .fetch_one(&self.pool)
        .await?;

        Self::record_from_row(&row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ImageRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, unique_filename, original_filename, mime_type, size,
                   status, processed_filename, upload_date, processing_log
            FROM images
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::record_from_row).transpose()
    }

    async fn transition(
        &self,
        id: Uuid,
        target: ImageStatus,
        log_entry: ProcessingLogEntry,
        processed_filename: Option<String>,
    ) -> Result<TransitionOutcome> {
        let entry_json = serde_json::to_value(&log_entry)?;

        // Status only moves forward, so re-reading after a lost race
        // terminates: eventually the record is either already at the
        // target or the transition is illegal.
        loop {
            let current = self
                .get(id)
                .await?
                .ok_or_else(|| PipelineError::ImageNotFound(id.to_string()))?;

            if current.status == target {
                return Ok(TransitionOutcome::AlreadyApplied(current));
            }

            if !current.status.can_transition_to(target) {
                return Err(PipelineError::IllegalTransition {
                    from: current.status.to_string(),
                    to: target.to_string(),
                });
            }

            let processed = if target == ImageStatus::Completed {
                processed_filename.clone()
            } else {
                None
            };

            let row = sqlx::query(
                r#"
                UPDATE images
                SET status = $2,
                    processed_filename = COALESCE($3, processed_filename),
                    processing_log = processing_log || $4::jsonb
                WHERE id = $1 AND status = $5
                RETURNING id, unique_filename, original_filename, mime_type, size,
                          status, processed_filename, upload_date, processing_log
                "#,
            )
            .bind(id)
            .bind(target.to_string())
            .bind(processed)
            .bind(&entry_json)
            .bind(current.status.to_string())
            .fetch_optional(&self.pool)
            .await?;

            match row {
                Some(row) => return Ok(TransitionOutcome::Applied(Self::record_from_row(&row)?)),
                // Raced with a concurrent writer; observe the new status.
                None => continue,
            }
        }
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}
