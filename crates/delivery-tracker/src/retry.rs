//! Retry scheduling with capped exponential backoff.
//!
//! Each retry is a spawned task that sleeps for `backoff(retry_count)` and
//! then runs one attempt through the event's retry callback. At most one
//! retry task exists per event: scheduling again cancels the previous one.

use crate::callback::{RetryCallback, RetryOutcome};
use crate::error::{TrackerError, TrackerResult};
use crate::event::EventPayload;
use crate::tracker::{TrackerInner, TrackerState};
use chrono::Utc;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capped exponential backoff: `min(base * 2^retry_count, max)`.
///
/// | retry_count | delay (defaults) |
/// |-------------|------------------|
/// | 0           | 1s               |
/// | 1           | 2s               |
/// | 2           | 4s               |
/// | 3           | 8s               |
/// | 4           | 16s              |
/// | 5+          | 30s (capped)     |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before the retry that follows `retry_count` earlier attempts.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let multiplier = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.base
            .checked_mul(multiplier)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// A scheduled (or running) retry task for one event.
pub(crate) struct RetryTask {
    pub(crate) generation: u64,
    pub(crate) handle: JoinHandle<()>,
}

/// Everything a retry attempt needs once the lock is released.
struct RetryAttempt {
    callback: Arc<dyn RetryCallback>,
    event_type: String,
    payload: EventPayload,
    retry_count: u32,
}

impl TrackerInner {
    /// Schedule a retry for `event_id`, replacing any pending retry task.
    ///
    /// Fails with [`TrackerError::SchedulerUnavailable`] when the tracker is
    /// stopped or no tokio runtime is reachable from this thread.
    pub(crate) fn schedule_retry(
        self: &Arc<Self>,
        state: &mut TrackerState,
        event_id: &str,
    ) -> TrackerResult<Duration> {
        if !state.running {
            return Err(TrackerError::SchedulerUnavailable(
                "tracker is not running".to_string(),
            ));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TrackerError::SchedulerUnavailable(e.to_string()))?;

        let retry_count = state
            .events
            .get(event_id)
            .map(|event| event.retry_count)
            .ok_or_else(|| TrackerError::UnknownEvent(event_id.to_string()))?;
        let delay = self.backoff.delay(retry_count);

        state.cancel_retry(event_id);
        let generation = state.next_retry_generation();
        let handle = runtime.spawn(run_retry(
            Arc::downgrade(self),
            event_id.to_string(),
            generation,
            delay,
        ));
        state
            .retry_tasks
            .insert(event_id.to_string(), RetryTask { generation, handle });

        debug!(
            event_id = %event_id,
            retry_count = retry_count,
            delay_ms = delay.as_millis() as u64,
            "Retry scheduled"
        );
        Ok(delay)
    }

    /// Claim one unit of retry budget, or explain why the attempt is skipped.
    ///
    /// The budget unit is spent even when no callback is registered, so an
    /// event without one cannot be retried forever.
    fn begin_retry_attempt(&self, event_id: &str, generation: u64) -> Option<RetryAttempt> {
        let mut guard = self.lock_state();
        let state = &mut *guard;

        let Some(event) = state.events.get_mut(event_id) else {
            debug!(event_id = %event_id, "Retry fired for evicted event");
            state.finish_retry_task(event_id, generation);
            return None;
        };
        if !event.can_retry() {
            // Confirmed, re-sent or out of budget since scheduling
            state.finish_retry_task(event_id, generation);
            return None;
        }

        let prior_status = event.status;
        event.begin_retry();
        state.metrics.record_retry();

        let Some(callback) = state.callbacks.get(event_id).cloned() else {
            event.abandon_retry(prior_status);
            warn!(
                event_id = %event_id,
                status = %event.status,
                retry_count = event.retry_count,
                max_retries = event.max_retries,
                "No retry callback registered, cannot re-emit event"
            );
            state.finish_retry_task(event_id, generation);
            return None;
        };

        Some(RetryAttempt {
            callback,
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            retry_count: event.retry_count,
        })
    }

    /// Apply the callback outcome and re-schedule while budget remains.
    fn complete_retry_attempt(
        self: &Arc<Self>,
        event_id: &str,
        generation: u64,
        retry_count: u32,
        outcome: RetryOutcome,
    ) {
        let mut state = self.lock_state();
        state.finish_retry_task(event_id, generation);

        let now = Utc::now();
        let Some(event) = state.events.get_mut(event_id) else {
            debug!(event_id = %event_id, "Event evicted while retry was in flight");
            return;
        };
        if event.status != crate::EventStatus::Retrying {
            debug!(
                event_id = %event_id,
                status = %event.status,
                "Event changed during retry, discarding retry outcome"
            );
            return;
        }

        match outcome {
            RetryOutcome::Delivered => {
                event.retry_delivered(now);
                state.metrics.record_successful_retry();
                info!(
                    event_id = %event_id,
                    retry_count = retry_count,
                    "Retry delivered event"
                );
            }
            RetryOutcome::Failed(reason) => {
                warn!(
                    event_id = %event_id,
                    retry_count = retry_count,
                    error = %reason,
                    "Retry attempt failed"
                );
                event.retry_failed(reason, now);
                if event.can_retry() {
                    if let Err(e) = self.schedule_retry(&mut state, event_id) {
                        warn!(event_id = %event_id, error = %e, "Could not re-schedule retry");
                    }
                }
            }
        }
    }
}

/// Body of one retry task.
async fn run_retry(tracker: Weak<TrackerInner>, event_id: String, generation: u64, delay: Duration) {
    tokio::time::sleep(delay).await;

    let Some(tracker) = tracker.upgrade() else {
        return;
    };
    let Some(attempt) = tracker.begin_retry_attempt(&event_id, generation) else {
        return;
    };

    let outcome = AssertUnwindSafe(attempt.callback.retry(
        &event_id,
        &attempt.event_type,
        &attempt.payload,
    ))
    .catch_unwind()
    .await
    .unwrap_or_else(|panic| {
        RetryOutcome::Failed(format!("retry callback panicked: {}", panic_message(&panic)))
    });

    tracker.complete_retry_attempt(&event_id, generation, attempt.retry_count, outcome);
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
