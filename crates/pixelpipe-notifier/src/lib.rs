//! Pixelpipe Notification Fanout
//!
//! Consumes event envelopes from the notification queue and relays each
//! one to every configured sink. Delivery to sinks is best-effort: a
//! failing sink is logged and skipped, never blocks the others, and
//! never puts the event back on the queue. Duplicate events are
//! delivered again; sinks tolerate repeats.

pub mod config;
pub mod consumer;
pub mod error;
pub mod health;
pub mod sink;

pub use error::NotifierError;
