//! Pixelpipe Processing Worker
//!
//! Consumes task envelopes from the work queue and drives each image
//! through the processing state machine:
//!
//! `received -> processing -> transform -> {completed, failed}`
//!
//! Correctness hinges on ordering: the durable status write always
//! precedes acknowledgment, so a crash between the two redelivers the
//! task instead of silently losing the outcome. Horizontal scale-out is
//! competing consumers (more worker processes on the same queue), not
//! in-process concurrency.

pub mod config;
pub mod consumer;
pub mod health;
pub mod transform;
