//! Notifier boundary and the tracked emitter.
//!
//! [`TrackedEmitter`] is the glue between an emission site and the tracker:
//! it registers the event, hands it to the [`Notifier`], and wires a
//! notifier-backed retry callback so failed or timed-out events are re-sent
//! through the same transport.

use crate::callback::{RetryCallback, RetryOutcome};
use crate::error::TrackerResult;
use crate::event::{EventPayload, TrackRequest};
use crate::tracker::DeliveryTracker;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Failure reason recorded when the notifier rejects a send.
pub const NOTIFIER_SEND_FAILED: &str = "notifier send failed";

/// The message pushed to a subject. Consumers echo `event_id` back to confirm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundNotification {
    pub event_id: String,
    pub event_type: String,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub payload: EventPayload,
}

impl OutboundNotification {
    pub fn to_json(&self) -> TrackerResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Transport that delivers notifications to subjects.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Push `notification` to `subject_id`. Returns whether the transport accepted it.
    async fn send(&self, subject_id: &str, notification: &OutboundNotification) -> bool;
}

/// Retry callback that re-sends the event through a [`Notifier`].
struct NotifierRetry {
    notifier: Arc<dyn Notifier>,
    subject_id: String,
    run_id: String,
    thread_id: Option<String>,
}

#[async_trait]
impl RetryCallback for NotifierRetry {
    async fn retry(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &EventPayload,
    ) -> RetryOutcome {
        let notification = OutboundNotification {
            event_id: event_id.to_string(),
            event_type: event_type.to_string(),
            run_id: self.run_id.clone(),
            thread_id: self.thread_id.clone(),
            payload: payload.clone(),
        };
        if self.notifier.send(&self.subject_id, &notification).await {
            RetryOutcome::Delivered
        } else {
            RetryOutcome::Failed(NOTIFIER_SEND_FAILED.to_string())
        }
    }
}

/// Emits notifications with delivery tracking.
#[derive(Clone)]
pub struct TrackedEmitter {
    tracker: DeliveryTracker,
    notifier: Arc<dyn Notifier>,
}

impl TrackedEmitter {
    pub fn new(tracker: DeliveryTracker, notifier: Arc<dyn Notifier>) -> Self {
        Self { tracker, notifier }
    }

    pub fn tracker(&self) -> &DeliveryTracker {
        &self.tracker
    }

    /// Track, send and record the send result. Returns the event id.
    ///
    /// Any retry callback on `request` is replaced by one that re-sends
    /// through this emitter's notifier.
    pub async fn emit(&self, request: TrackRequest) -> String {
        let subject_id = request.subject_id.clone();
        let event_type = request.event_type.clone();
        let run_id = request.run_id.clone();
        let thread_id = request.thread_id.clone();
        let payload = request.payload.clone();

        let callback = Arc::new(NotifierRetry {
            notifier: Arc::clone(&self.notifier),
            subject_id: subject_id.clone(),
            run_id: run_id.clone(),
            thread_id: thread_id.clone(),
        });
        let event_id = self.tracker.track(request.retry_callback(callback));

        let notification = OutboundNotification {
            event_id: event_id.clone(),
            event_type,
            run_id,
            thread_id,
            payload,
        };

        // Marked before the await so an early acknowledgement is not reset to pending
        self.tracker.mark_sent(&event_id);
        if self.notifier.send(&subject_id, &notification).await {
            debug!(event_id = %event_id, subject_id = %subject_id, "Notification sent");
        } else {
            self.tracker.fail(&event_id, NOTIFIER_SEND_FAILED);
        }
        event_id
    }

    /// Relay a consumer acknowledgement.
    pub fn acknowledge(&self, event_id: &str) -> bool {
        self.tracker.confirm(event_id)
    }
}
