//! Common types used across pixelpipe
//!
//! The wire contracts ([`TaskEnvelope`], [`EventEnvelope`]) serialize with
//! camelCase field names; external producers and consumers depend on that
//! exact shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name of the durable queue carrying task envelopes to workers.
pub const TASK_QUEUE: &str = "image_processing_queue";

/// Name of the durable queue carrying event envelopes to the fanout.
pub const EVENT_QUEUE: &str = "image_processing_notifications";

/// Prefix applied to derived artifacts. Deterministic, so reprocessing a
/// duplicate delivery overwrites the same file instead of leaking copies.
pub const PROCESSED_PREFIX: &str = "processed-";

/// MIME types accepted at upload (shared with the external gateway).
pub const ALLOWED_MIME_TYPES: &[&str] =
    &["image/jpeg", "image/png", "image/gif", "image/webp"];

/// Maximum accepted upload size in bytes (5 MB).
pub const MAX_UPLOAD_BYTES: u64 = 5 * 1024 * 1024;

// ============================================================================
// Status State Machine
// ============================================================================

/// Lifecycle status of an image record.
///
/// Transitions are monotonic and forward-only:
/// `Pending -> Processing -> {Completed, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ImageStatus {
    /// Whether this status admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, ImageStatus::Completed | ImageStatus::Failed)
    }

    /// Whether a transition from `self` to `target` is legal.
    ///
    /// Re-applying the current status is not a legal transition; callers
    /// that need idempotent terminal writes handle that case separately.
    pub fn can_transition_to(self, target: ImageStatus) -> bool {
        matches!(
            (self, target),
            (ImageStatus::Pending, ImageStatus::Processing)
                | (ImageStatus::Processing, ImageStatus::Completed)
                | (ImageStatus::Processing, ImageStatus::Failed)
        )
    }
}

impl std::fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageStatus::Pending => write!(f, "pending"),
            ImageStatus::Processing => write!(f, "processing"),
            ImageStatus::Completed => write!(f, "completed"),
            ImageStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for ImageStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ImageStatus::Pending),
            "processing" => Ok(ImageStatus::Processing),
            "completed" => Ok(ImageStatus::Completed),
            "failed" => Ok(ImageStatus::Failed),
            other => Err(format!("unknown image status: {}", other)),
        }
    }
}

// ============================================================================
// Processing Log
// ============================================================================

/// Severity of a processing log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingLogLevel {
    #[default]
    Info,
    Warn,
    Error,
}

/// One entry in an image record's append-only processing log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingLogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub level: ProcessingLogLevel,
}

impl ProcessingLogEntry {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
            level: ProcessingLogLevel::Info,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
            level: ProcessingLogLevel::Error,
        }
    }
}

// ============================================================================
// Image Record
// ============================================================================

/// Durable per-image record, the single source of truth for status.
///
/// Created by the ingestion gateway before the task envelope is enqueued;
/// mutated only by the worker afterwards. All failures end up in
/// `processing_log` rather than being thrown across service boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Unique identifier, assigned at creation, immutable
    pub id: Uuid,

    /// Unique storage key under the `original/` directory, immutable
    pub unique_filename: String,

    /// Filename as uploaded by the user
    pub original_filename: String,

    /// MIME type recorded at upload
    pub mime_type: String,

    /// Upload size in bytes
    pub size: i64,

    /// Current lifecycle status
    pub status: ImageStatus,

    /// Derived artifact name; set only on the transition into Completed
    pub processed_filename: Option<String>,

    /// Set once at creation
    pub upload_date: DateTime<Utc>,

    /// Ordered, append-only processing history
    pub processing_log: Vec<ProcessingLogEntry>,
}

/// Fields the gateway supplies when creating a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewImageRecord {
    pub unique_filename: String,
    pub original_filename: String,
    pub mime_type: String,
    pub size: i64,
}

/// Shape of the external status query: relative paths under the shared
/// storage root, `processed_path` null until the record completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStatusView {
    pub id: Uuid,
    pub status: ImageStatus,
    pub original_path: String,
    pub processed_path: Option<String>,
}

impl ImageStatusView {
    pub fn from_record(record: &ImageRecord) -> Self {
        Self {
            id: record.id,
            status: record.status,
            original_path: format!("original/{}", record.unique_filename),
            processed_path: record
                .processed_filename
                .as_ref()
                .map(|f| format!("processed/{}", f)),
        }
    }
}

// ============================================================================
// Queue Envelopes
// ============================================================================

/// Message instructing a worker to process one image.
///
/// Delivered at least once; the worker tolerates redelivery without
/// corrupting the image record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEnvelope {
    pub image_id: Uuid,
    pub unique_filename: String,
    pub original_path: String,
}

impl TaskEnvelope {
    /// Deterministic name of the derived artifact for this task.
    pub fn processed_filename(&self) -> String {
        format!("{}{}", PROCESSED_PREFIX, self.unique_filename)
    }
}

/// Message announcing a terminal outcome to subscribers.
///
/// Informational only; duplicate emission is acceptable and fanout is
/// idempotent at the application layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub image_id: Uuid,
    pub status: ImageStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EventEnvelope {
    /// Event for a successfully processed image.
    pub fn completed(image_id: Uuid, processed_filename: &str) -> Self {
        Self {
            image_id,
            status: ImageStatus::Completed,
            message: "Your image has been processed!".to_string(),
            processed_url: Some(format!("/images/processed/{}", processed_filename)),
            error: None,
        }
    }

    /// Event for an image whose processing failed terminally.
    pub fn failed(image_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            image_id,
            status: ImageStatus::Failed,
            message: "Image processing failed.".to_string(),
            processed_url: None,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_forward_only() {
        use ImageStatus::*;

        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));

        // No shortcut from pending to a terminal state
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));

        // No way out of a terminal state
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Failed.can_transition_to(Pending));

        // Self-transitions are not legal transitions
        assert!(!Processing.can_transition_to(Processing));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            ImageStatus::Pending,
            ImageStatus::Processing,
            ImageStatus::Completed,
            ImageStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<ImageStatus>(), Ok(status));
        }
        assert!("garbage".parse::<ImageStatus>().is_err());
    }

    #[test]
    fn task_envelope_wire_format_is_camel_case() {
        let task = TaskEnvelope {
            image_id: Uuid::nil(),
            unique_filename: "u1.jpg".to_string(),
            original_path: "/images/original/u1.jpg".to_string(),
        };

        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["imageId"], Uuid::nil().to_string());
        assert_eq!(json["uniqueFilename"], "u1.jpg");
        assert_eq!(json["originalPath"], "/images/original/u1.jpg");
    }

    #[test]
    fn task_envelope_derived_name_is_deterministic() {
        let task = TaskEnvelope {
            image_id: Uuid::new_v4(),
            unique_filename: "u1.jpg".to_string(),
            original_path: "/images/original/u1.jpg".to_string(),
        };

        assert_eq!(task.processed_filename(), "processed-u1.jpg");
        assert_eq!(task.processed_filename(), task.processed_filename());
    }

    #[test]
    fn completed_event_carries_url_and_no_error() {
        let id = Uuid::new_v4();
        let event = EventEnvelope::completed(id, "processed-u1.jpg");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["processedUrl"], "/images/processed/processed-u1.jpg");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn failed_event_carries_error_and_no_url() {
        let event = EventEnvelope::failed(Uuid::new_v4(), "decode error");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"], "decode error");
        assert!(json.get("processedUrl").is_none());
    }

    #[test]
    fn status_view_uses_relative_paths() {
        let record = ImageRecord {
            id: Uuid::new_v4(),
            unique_filename: "u1.jpg".to_string(),
            original_filename: "holiday.jpg".to_string(),
            mime_type: "image/jpeg".to_string(),
            size: 1024,
            status: ImageStatus::Completed,
            processed_filename: Some("processed-u1.jpg".to_string()),
            upload_date: Utc::now(),
            processing_log: Vec::new(),
        };

        let view = ImageStatusView::from_record(&record);
        assert_eq!(view.original_path, "original/u1.jpg");
        assert_eq!(view.processed_path.as_deref(), Some("processed/processed-u1.jpg"));

        let pending = ImageRecord {
            status: ImageStatus::Pending,
            processed_filename: None,
            ..record
        };
        assert!(ImageStatusView::from_record(&pending).processed_path.is_none());
    }
}
