//! Delivery confirmation tracking for outbound notifications.
//!
//! Every emitted event is registered with a [`DeliveryTracker`], marked sent
//! when the transport accepts it, and confirmed when the consumer
//! acknowledges it. Failed and timed-out events are retried with capped
//! exponential backoff through a registered [`RetryCallback`].
//!
//! # Lifecycle
//!
//! ```text
//! track --> pending --mark_sent--> pending(sent) --confirm--> confirmed
//!              |                        |
//!              |                      sweep (deadline passed)
//!              v                        v
//!            failed <---retry err--- timeout
//!              |                        |
//!              \------> retrying <------/
//!                          |
//!                       retry ok --> pending(sent)
//! ```
//!
//! # Invariants
//!
//! 1. **Unique ids**: event ids never repeat within one tracker
//! 2. **Bounded retries**: `retry_count` never exceeds `max_retries`
//! 3. **Bounded memory**: eviction keeps the table near `max_tracked_events`
//! 4. **Clean shutdown**: after `stop()` returns no background task mutates state
//!
//! This crate provides:
//! - DeliveryTracker: the event table, metrics, sweep loop and retry scheduler
//! - TrackedEmitter: track + send + retry wiring over a [`Notifier`]

mod callback;
mod config;
mod emitter;
mod error;
mod event;
mod metrics;
mod retry;
mod sweep;
mod tracker;

#[cfg(test)]
mod tests;

pub use callback::{retry_fn, FnRetryCallback, RetryCallback, RetryOutcome};
pub use config::TrackerConfig;
pub use emitter::{Notifier, OutboundNotification, TrackedEmitter, NOTIFIER_SEND_FAILED};
pub use error::{TrackerError, TrackerResult};
pub use event::{EventPayload, EventPriority, EventStatus, TrackRequest, TrackedEvent};
pub use metrics::DeliveryMetrics;
pub use retry::BackoffPolicy;
pub use sweep::SweepReport;
pub use tracker::{DeliveryTracker, RETRY_CANCELLED_BY_SHUTDOWN};
