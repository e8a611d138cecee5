//! The `DeliveryTracker` facade.
//!
//! One tracker owns the event table, the subject index, retry callbacks,
//! metrics and the background tasks (sweep loop and retry timers). All
//! mutable state sits behind a single mutex that is never held across an
//! `.await`, so every public operation is a short critical section.

use crate::callback::RetryCallback;
use crate::config::TrackerConfig;
use crate::error::TrackerResult;
use crate::event::{EventIdGenerator, EventStatus, TrackRequest, TrackedEvent};
use crate::metrics::DeliveryMetrics;
use crate::retry::{BackoffPolicy, RetryTask};
use crate::sweep::{SweepHandle, SweepReport};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Error recorded on events whose retry was cut short by [`DeliveryTracker::stop`].
pub const RETRY_CANCELLED_BY_SHUTDOWN: &str = "retry cancelled by shutdown";

/// Tracks outbound events until they are confirmed, fail for good, or age out.
///
/// Cloning is cheap and every clone drives the same tracker. The composition
/// root calls [`start`](Self::start) once inside a tokio runtime and
/// [`stop`](Self::stop) on shutdown.
#[derive(Clone)]
pub struct DeliveryTracker {
    inner: Arc<TrackerInner>,
}

pub(crate) struct TrackerInner {
    pub(crate) config: TrackerConfig,
    pub(crate) backoff: BackoffPolicy,
    state: Mutex<TrackerState>,
}

/// Everything guarded by the tracker lock.
pub(crate) struct TrackerState {
    pub(crate) events: HashMap<String, TrackedEvent>,
    /// subject id -> ids of its tracked events
    pub(crate) subject_index: HashMap<String, HashSet<String>>,
    pub(crate) callbacks: HashMap<String, Arc<dyn RetryCallback>>,
    pub(crate) retry_tasks: HashMap<String, RetryTask>,
    /// Replaced retry tasks that may still be mid-poll; awaited by `stop`.
    cancelled_retries: Vec<JoinHandle<()>>,
    pub(crate) metrics: DeliveryMetrics,
    ids: EventIdGenerator,
    retry_generation: u64,
    pub(crate) running: bool,
    sweep: Option<SweepHandle>,
}

impl TrackerState {
    fn new() -> Self {
        Self {
            events: HashMap::new(),
            subject_index: HashMap::new(),
            callbacks: HashMap::new(),
            retry_tasks: HashMap::new(),
            cancelled_retries: Vec::new(),
            metrics: DeliveryMetrics::default(),
            ids: EventIdGenerator::default(),
            retry_generation: 0,
            running: false,
            sweep: None,
        }
    }

    pub(crate) fn next_retry_generation(&mut self) -> u64 {
        self.retry_generation += 1;
        self.retry_generation
    }

    /// Abort the pending retry task for `event_id`, if any.
    pub(crate) fn cancel_retry(&mut self, event_id: &str) {
        self.cancelled_retries.retain(|handle| !handle.is_finished());
        if let Some(task) = self.retry_tasks.remove(event_id) {
            task.handle.abort();
            self.cancelled_retries.push(task.handle);
        }
    }

    /// Drop the retry task entry if it still belongs to `generation`.
    pub(crate) fn finish_retry_task(&mut self, event_id: &str, generation: u64) {
        if self
            .retry_tasks
            .get(event_id)
            .is_some_and(|task| task.generation == generation)
        {
            self.retry_tasks.remove(event_id);
        }
    }

    /// Remove an event along with its index entry, callback and retry timer.
    pub(crate) fn remove_event(&mut self, event_id: &str) -> Option<TrackedEvent> {
        let event = self.events.remove(event_id)?;
        if let Some(ids) = self.subject_index.get_mut(&event.subject_id) {
            ids.remove(event_id);
            if ids.is_empty() {
                self.subject_index.remove(&event.subject_id);
            }
        }
        self.callbacks.remove(event_id);
        self.cancel_retry(event_id);
        Some(event)
    }

    /// Mark every event whose retry callback is mid-flight as failed.
    ///
    /// The tasks are about to be aborted, so their outcome will never land.
    fn fail_in_flight_retries(&mut self, reason: &str, now: DateTime<Utc>) -> usize {
        let mut abandoned = 0;
        for event in self.events.values_mut() {
            if event.status == EventStatus::Retrying {
                event.retry_failed(reason.to_string(), now);
                abandoned += 1;
            }
        }
        abandoned
    }

    /// Detach every background task so the caller can cancel and await them.
    fn take_background_tasks(&mut self) -> (Option<SweepHandle>, Vec<JoinHandle<()>>) {
        let mut handles: Vec<JoinHandle<()>> = self
            .retry_tasks
            .drain()
            .map(|(_, task)| task.handle)
            .collect();
        handles.append(&mut self.cancelled_retries);
        (self.sweep.take(), handles)
    }
}

impl TrackerInner {
    /// Lock the state, recovering from a poisoned lock.
    ///
    /// Every mutation under the lock leaves the maps consistent, so a
    /// panicking holder cannot leave a half-applied transition behind.
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            error!("Tracker state lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl Drop for TrackerInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let (sweep, handles) = state.take_background_tasks();
        if let Some(sweep) = sweep {
            sweep.abort();
        }
        for handle in handles {
            handle.abort();
        }
    }
}

impl DeliveryTracker {
    /// Create a stopped tracker. Fails only when `config` is invalid.
    pub fn new(config: TrackerConfig) -> TrackerResult<Self> {
        config.validate()?;
        Ok(Self::from_config(config))
    }

    pub fn with_defaults() -> Self {
        Self::from_config(TrackerConfig::default())
    }

    fn from_config(config: TrackerConfig) -> Self {
        let backoff = BackoffPolicy::new(config.retry_base_delay(), config.retry_max_delay());
        Self {
            inner: Arc::new(TrackerInner {
                config,
                backoff,
                state: Mutex::new(TrackerState::new()),
            }),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.inner.config
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the sweep loop. Idempotent.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> TrackerResult<()> {
        let mut state = self.inner.lock_state();
        if state.running {
            debug!("Delivery tracker already running");
            return Ok(());
        }

        let sweep = SweepHandle::spawn(&self.inner)?;
        state.sweep = Some(sweep);
        state.running = true;

        info!(
            cleanup_interval_ms = self.inner.config.cleanup_interval_ms,
            max_tracked_events = self.inner.config.max_tracked_events,
            "Delivery tracker started"
        );
        Ok(())
    }

    /// Stop the sweep loop and cancel all retry timers, awaiting each of them.
    ///
    /// Once this returns no background task touches the tracker again.
    /// Tracked events and metrics remain queryable.
    pub async fn stop(&self) {
        let (sweep, handles) = {
            let mut state = self.inner.lock_state();
            if !state.running && state.sweep.is_none() && state.retry_tasks.is_empty() {
                return;
            }
            state.running = false;
            let abandoned = state.fail_in_flight_retries(RETRY_CANCELLED_BY_SHUTDOWN, Utc::now());
            if abandoned > 0 {
                warn!(abandoned = abandoned, "In-flight retries cancelled by shutdown");
            }
            state.take_background_tasks()
        };

        if let Some(sweep) = sweep {
            sweep.shutdown().await;
        }

        let cancelled = handles.len();
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!(error = %e, "Retry task panicked during shutdown");
                }
            }
        }

        info!(cancelled_retries = cancelled, "Delivery tracker stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock_state().running
    }

    // ========================================================================
    // Mutators
    // ========================================================================

    /// Register a new event in `pending` state and return its id.
    pub fn track(&self, request: TrackRequest) -> String {
        let config = &self.inner.config;
        let now = Utc::now();
        let mut state = self.inner.lock_state();

        let event_id =
            state
                .ids
                .next_id(&request.event_type, &request.subject_id, &request.run_id, now);

        let event = TrackedEvent {
            event_id: event_id.clone(),
            event_type: request.event_type,
            subject_id: request.subject_id,
            run_id: request.run_id,
            thread_id: request.thread_id,
            priority: request.priority,
            payload: request.payload,
            status: EventStatus::Pending,
            created_at: now,
            sent_at: None,
            confirmed_at: None,
            failed_at: None,
            confirmation_timeout: request.timeout.unwrap_or_else(|| config.default_timeout()),
            max_retries: request.max_retries.unwrap_or(config.default_max_retries),
            retry_count: 0,
            last_error: None,
            retry_errors: Vec::new(),
        };

        debug!(
            event_id = %event_id,
            event_type = %event.event_type,
            subject_id = %event.subject_id,
            priority = %event.priority,
            "Tracking event"
        );

        state
            .subject_index
            .entry(event.subject_id.clone())
            .or_default()
            .insert(event_id.clone());
        if let Some(callback) = request.retry_callback {
            state.callbacks.insert(event_id.clone(), callback);
        }
        state.events.insert(event_id.clone(), event);
        state.metrics.record_tracked();

        crate::sweep::evict_if_needed(&mut state, config);

        event_id
    }

    /// Record that the event was handed to the transport.
    pub fn mark_sent(&self, event_id: &str) -> bool {
        let mut state = self.inner.lock_state();
        let Some(event) = state.events.get_mut(event_id) else {
            warn!(event_id = %event_id, "mark_sent for unknown event");
            return false;
        };
        event.mark_sent(Utc::now());
        debug!(event_id = %event_id, "Event marked sent");
        true
    }

    /// Record a consumer acknowledgement.
    pub fn confirm(&self, event_id: &str) -> bool {
        let mut state = self.inner.lock_state();
        let state = &mut *state;
        let Some(event) = state.events.get_mut(event_id) else {
            warn!(event_id = %event_id, "Confirmation for unknown event");
            return false;
        };
        if event.status == EventStatus::Confirmed {
            debug!(event_id = %event_id, "Duplicate confirmation ignored");
            return true;
        }
        event.mark_confirmed(Utc::now());
        state.metrics.record_confirmed(event);

        info!(
            event_id = %event_id,
            latency_ms = ?event.confirmation_latency_ms(),
            retry_count = event.retry_count,
            "Event confirmed"
        );
        true
    }

    /// Record a delivery failure, scheduling a retry while budget remains.
    pub fn fail(&self, event_id: &str, error: &str) -> bool {
        let mut state = self.inner.lock_state();
        let should_retry = {
            let state = &mut *state;
            let Some(event) = state.events.get_mut(event_id) else {
                warn!(event_id = %event_id, "Failure reported for unknown event");
                return false;
            };
            event.mark_failed(error, Utc::now());
            state.metrics.record_failed(event);

            warn!(
                event_id = %event_id,
                error = %error,
                retry_count = event.retry_count,
                max_retries = event.max_retries,
                "Event delivery failed"
            );
            event.can_retry()
        };

        if should_retry {
            if let Err(e) = self.inner.schedule_retry(&mut state, event_id) {
                warn!(event_id = %event_id, error = %e, "Retry not scheduled");
            }
        }
        true
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn status(&self, event_id: &str) -> Option<EventStatus> {
        self.inner
            .lock_state()
            .events
            .get(event_id)
            .map(|event| event.status)
    }

    /// Snapshot of one event.
    pub fn event(&self, event_id: &str) -> Option<TrackedEvent> {
        self.inner.lock_state().events.get(event_id).cloned()
    }

    /// Pending events, optionally restricted to one subject, oldest first.
    pub fn pending_events(&self, subject_id: Option<&str>) -> Vec<TrackedEvent> {
        let state = self.inner.lock_state();
        let mut pending: Vec<TrackedEvent> = match subject_id {
            Some(subject_id) => state
                .subject_index
                .get(subject_id)
                .into_iter()
                .flatten()
                .filter_map(|id| state.events.get(id))
                .filter(|event| event.status == EventStatus::Pending)
                .cloned()
                .collect(),
            None => state
                .events
                .values()
                .filter(|event| event.status == EventStatus::Pending)
                .cloned()
                .collect(),
        };
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pending
    }

    /// Pending events past their confirmation deadline.
    pub fn expired_events(&self) -> Vec<TrackedEvent> {
        let now = Utc::now();
        self.inner
            .lock_state()
            .events
            .values()
            .filter(|event| event.is_expired_at(now))
            .cloned()
            .collect()
    }

    pub fn events_for_run(&self, run_id: &str) -> Vec<TrackedEvent> {
        let state = self.inner.lock_state();
        let mut events: Vec<TrackedEvent> = state
            .events
            .values()
            .filter(|event| event.run_id == run_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        events
    }

    pub fn metrics(&self) -> DeliveryMetrics {
        self.inner.lock_state().metrics.clone()
    }

    pub fn tracked_count(&self) -> usize {
        self.inner.lock_state().events.len()
    }

    /// Run one sweep pass now: time out expired events, then evict.
    pub fn sweep_now(&self) -> SweepReport {
        self.inner.sweep_once()
    }

    #[cfg(test)]
    pub(crate) fn subject_index_len(&self) -> usize {
        self.inner.lock_state().subject_index.len()
    }

    #[cfg(test)]
    pub(crate) fn has_retry_callback(&self, event_id: &str) -> bool {
        self.inner.lock_state().callbacks.contains_key(event_id)
    }

    #[cfg(test)]
    pub(crate) fn scheduled_retry_count(&self) -> usize {
        self.inner.lock_state().retry_tasks.len()
    }
}

impl std::fmt::Debug for DeliveryTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock_state();
        f.debug_struct("DeliveryTracker")
            .field("running", &state.running)
            .field("tracked", &state.events.len())
            .field("scheduled_retries", &state.retry_tasks.len())
            .finish()
    }
}
