//! Pixelpipe Common Library
//!
//! Shared building blocks for the pixelpipe services:
//!
//! - **Error Handling**: the [`PipelineError`] type shared by all members
//! - **Logging**: tracing-based logging setup used by every binary
//! - **Types**: image records, status state machine, queue envelopes
//! - **Queue**: the durable work-queue abstraction and its brokers
//! - **Store**: the image state-store client and its backends
//!
//! The ingestion gateway is an external collaborator; the interfaces it
//! needs ([`store::ImageStore::create`], [`queue::WorkQueue::enqueue`])
//! live here so producers and consumers agree on one contract.

pub mod error;
pub mod logging;
pub mod queue;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use error::{PipelineError, Result};
