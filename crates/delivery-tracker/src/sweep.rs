//! Periodic sweep: timeout promotion and capacity eviction.

use crate::config::TrackerConfig;
use crate::error::{TrackerError, TrackerResult};
use crate::tracker::{TrackerInner, TrackerState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What one sweep pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Pending events promoted to `timeout`.
    pub timed_out: usize,
    /// Retries scheduled for the timed-out events.
    pub retries_scheduled: usize,
    /// Terminal events evicted to get back under the cap.
    pub evicted: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.timed_out == 0 && self.evicted == 0
    }
}

/// The running sweep loop task.
pub(crate) struct SweepHandle {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl SweepHandle {
    pub(crate) fn spawn(tracker: &Arc<TrackerInner>) -> TrackerResult<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TrackerError::SchedulerUnavailable(e.to_string()))?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = runtime.spawn(run_sweep_loop(Arc::downgrade(tracker), shutdown_rx));
        Ok(Self {
            shutdown_tx,
            handle,
        })
    }

    /// Signal the loop and wait for it to exit.
    pub(crate) async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                error!(error = %e, "Sweep loop panicked");
            }
        }
    }

    pub(crate) fn abort(self) {
        self.handle.abort();
    }
}

async fn run_sweep_loop(tracker: Weak<TrackerInner>, mut shutdown_rx: oneshot::Receiver<()>) {
    let Some(interval) = tracker.upgrade().map(|t| t.config.cleanup_interval()) else {
        return;
    };
    let mut delay = interval;

    debug!(interval_ms = interval.as_millis() as u64, "Sweep loop started");

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                debug!("Sweep loop received shutdown signal");
                break;
            }
            _ = tokio::time::sleep(delay) => {
                let Some(tracker) = tracker.upgrade() else {
                    break;
                };
                match std::panic::catch_unwind(AssertUnwindSafe(|| tracker.sweep_once())) {
                    Ok(_) => delay = interval,
                    Err(_) => {
                        delay = tracker.config.sweep_error_backoff();
                        error!(
                            retry_in_ms = delay.as_millis() as u64,
                            "Sweep pass failed"
                        );
                    }
                }
            }
        }
    }

    debug!("Sweep loop stopped");
}

impl TrackerInner {
    /// One sweep pass: promote expired events to `timeout`, schedule their
    /// retries, then evict down to the configured cap.
    pub(crate) fn sweep_once(self: &Arc<Self>) -> SweepReport {
        let now = Utc::now();
        let mut state = self.lock_state();
        let mut report = SweepReport::default();

        let expired: Vec<String> = state
            .events
            .values()
            .filter(|event| event.is_expired_at(now))
            .map(|event| event.event_id.clone())
            .collect();

        for event_id in expired {
            let can_retry = {
                let state = &mut *state;
                let Some(event) = state.events.get_mut(&event_id) else {
                    continue;
                };
                event.mark_timeout();
                state.metrics.record_timeout();
                warn!(
                    event_id = %event_id,
                    event_type = %event.event_type,
                    subject_id = %event.subject_id,
                    timeout_ms = event.confirmation_timeout.as_millis() as u64,
                    "Event confirmation timed out"
                );
                event.can_retry()
            };
            report.timed_out += 1;

            if can_retry {
                match self.schedule_retry(&mut state, &event_id) {
                    Ok(_) => report.retries_scheduled += 1,
                    Err(e) => warn!(event_id = %event_id, error = %e, "Retry not scheduled"),
                }
            }
        }

        report.evicted = evict_if_needed(&mut state, &self.config);

        if report.is_empty() {
            debug!(tracked = state.events.len(), "Sweep pass found nothing to do");
        } else {
            info!(
                timed_out = report.timed_out,
                retries_scheduled = report.retries_scheduled,
                evicted = report.evicted,
                tracked = state.events.len(),
                "Sweep pass complete"
            );
        }
        report
    }
}

/// Evict the oldest confirmed or failed events once the table exceeds the cap.
///
/// Removes `count - max + buffer` events so eviction doesn't rerun on every
/// insert. Pending, timed-out and retrying events are never evicted, so the
/// table can stay above the cap when nothing is evictable.
pub(crate) fn evict_if_needed(state: &mut TrackerState, config: &TrackerConfig) -> usize {
    let count = state.events.len();
    if count <= config.max_tracked_events {
        return 0;
    }
    let to_remove = count - config.max_tracked_events + config.eviction_buffer;

    let mut candidates: Vec<(DateTime<Utc>, String)> = state
        .events
        .values()
        .filter(|event| event.status.is_evictable())
        .map(|event| (event.created_at, event.event_id.clone()))
        .collect();
    candidates.sort();

    let mut evicted = 0;
    for (_, event_id) in candidates.into_iter().take(to_remove) {
        if state.remove_event(&event_id).is_some() {
            evicted += 1;
        }
    }

    if evicted > 0 {
        info!(
            evicted = evicted,
            remaining = state.events.len(),
            max_tracked_events = config.max_tracked_events,
            "Evicted old tracked events"
        );
    } else {
        warn!(
            tracked = count,
            max_tracked_events = config.max_tracked_events,
            "Tracked events over capacity but none are evictable"
        );
    }
    evicted
}
