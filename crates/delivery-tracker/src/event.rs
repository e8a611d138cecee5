//! Tracked event entity and its lifecycle transitions.

use crate::callback::RetryCallback;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Opaque caller data carried with an event and echoed back to retry callbacks.
pub type EventPayload = serde_json::Map<String, serde_json::Value>;

/// Lifecycle state of a tracked event.
///
/// ```text
/// pending --confirm--> confirmed
///    |  \--fail------> failed  --retry--> retrying --ok--> pending
///    |                   ^                    |
///    \--sweep--> timeout --retry--------------/--err--> failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Confirmed,
    Failed,
    Timeout,
    Retrying,
}

impl EventStatus {
    /// Convert to database-style string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Retrying => "retrying",
        }
    }

    /// Whether eviction may remove an event in this state.
    pub fn is_evictable(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery priority. Informational only; drives the critical-tier metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl EventPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for EventPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outbound notification and its delivery lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedEvent {
    pub event_id: String,
    pub event_type: String,
    pub subject_id: String,
    pub run_id: String,
    pub thread_id: Option<String>,
    pub priority: EventPriority,
    pub payload: EventPayload,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub confirmation_timeout: Duration,
    pub max_retries: u32,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub retry_errors: Vec<String>,
}

impl TrackedEvent {
    /// Whether the confirmation deadline passed at `now` without a confirmation.
    ///
    /// Only events that were actually handed to the transport can expire.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        if self.status != EventStatus::Pending {
            return false;
        }
        let Some(sent_at) = self.sent_at else {
            return false;
        };
        match (now - sent_at).to_std() {
            Ok(elapsed) => elapsed > self.confirmation_timeout,
            // sent_at is in the future relative to `now`
            Err(_) => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Whether the event is failed or timed out with retry budget remaining.
    pub fn can_retry(&self) -> bool {
        matches!(self.status, EventStatus::Failed | EventStatus::Timeout)
            && self.retry_count < self.max_retries
    }

    /// Confirmation latency in milliseconds, when both endpoints are known.
    pub fn confirmation_latency_ms(&self) -> Option<f64> {
        let sent_at = self.sent_at?;
        let confirmed_at = self.confirmed_at?;
        let latency = (confirmed_at - sent_at).num_microseconds()? as f64 / 1000.0;
        Some(latency.max(0.0))
    }

    pub(crate) fn mark_sent(&mut self, now: DateTime<Utc>) {
        self.sent_at = Some(now);
        self.status = EventStatus::Pending;
    }

    pub(crate) fn mark_confirmed(&mut self, now: DateTime<Utc>) {
        self.status = EventStatus::Confirmed;
        self.confirmed_at = Some(now);
    }

    pub(crate) fn mark_failed(&mut self, error: &str, now: DateTime<Utc>) {
        self.status = EventStatus::Failed;
        self.failed_at = Some(now);
        self.last_error = Some(error.to_string());
    }

    pub(crate) fn mark_timeout(&mut self) {
        self.status = EventStatus::Timeout;
    }

    /// Consume one unit of retry budget. Caller must have checked `can_retry`.
    pub(crate) fn begin_retry(&mut self) {
        self.retry_count += 1;
        self.status = EventStatus::Retrying;
    }

    /// The attempt could not run. The budget unit stays spent.
    pub(crate) fn abandon_retry(&mut self, prior_status: EventStatus) {
        self.status = prior_status;
    }

    /// The retry callback re-delivered the event; wait for a fresh confirmation.
    pub(crate) fn retry_delivered(&mut self, now: DateTime<Utc>) {
        self.status = EventStatus::Pending;
        self.sent_at = Some(now);
    }

    pub(crate) fn retry_failed(&mut self, reason: String, now: DateTime<Utc>) {
        self.retry_errors
            .push(format!("attempt {}: {}", self.retry_count, reason));
        self.status = EventStatus::Failed;
        self.failed_at = Some(now);
        self.last_error = Some(reason);
    }
}

/// Parameters for registering a new event with [`crate::DeliveryTracker::track`].
///
/// Unset optional fields fall back to the tracker configuration.
#[derive(Clone)]
pub struct TrackRequest {
    pub event_type: String,
    pub subject_id: String,
    pub run_id: String,
    pub thread_id: Option<String>,
    pub payload: EventPayload,
    pub priority: EventPriority,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub retry_callback: Option<Arc<dyn RetryCallback>>,
}

impl TrackRequest {
    pub fn new(
        event_type: impl Into<String>,
        subject_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            subject_id: subject_id.into(),
            run_id: run_id.into(),
            thread_id: None,
            payload: EventPayload::new(),
            priority: EventPriority::Normal,
            timeout: None,
            max_retries: None,
            retry_callback: None,
        }
    }

    pub fn thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn payload(mut self, payload: EventPayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Override the confirmation timeout for this event.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn retry_callback(mut self, callback: Arc<dyn RetryCallback>) -> Self {
        self.retry_callback = Some(callback);
        self
    }
}

impl fmt::Debug for TrackRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackRequest")
            .field("event_type", &self.event_type)
            .field("subject_id", &self.subject_id)
            .field("run_id", &self.run_id)
            .field("thread_id", &self.thread_id)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("has_retry_callback", &self.retry_callback.is_some())
            .finish()
    }
}

/// Generates `{type}_{subject}_{run}_{ms}_{suffix}` event ids.
///
/// The millisecond component never repeats within one generator, which
/// keeps ids unique for the owning tracker's lifetime.
#[derive(Debug, Default)]
pub(crate) struct EventIdGenerator {
    last_ms: i64,
}

impl EventIdGenerator {
    pub(crate) fn next_id(
        &mut self,
        event_type: &str,
        subject_id: &str,
        run_id: &str,
        now: DateTime<Utc>,
    ) -> String {
        let ms = now.timestamp_millis().max(self.last_ms + 1);
        self.last_ms = ms;

        let suffix = Uuid::new_v4().simple().to_string();
        format!(
            "{}_{}_{}_{}_{}",
            event_type,
            subject_id,
            run_id,
            ms,
            &suffix[..8]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn make_event(status: EventStatus) -> TrackedEvent {
        TrackedEvent {
            event_id: "tool_executing_u1_r1_1_abcdef01".to_string(),
            event_type: "tool_executing".to_string(),
            subject_id: "u1".to_string(),
            run_id: "r1".to_string(),
            thread_id: None,
            priority: EventPriority::Normal,
            payload: EventPayload::new(),
            status,
            created_at: Utc::now(),
            sent_at: None,
            confirmed_at: None,
            failed_at: None,
            confirmation_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_count: 0,
            last_error: None,
            retry_errors: Vec::new(),
        }
    }

    #[test]
    fn unsent_event_never_expires() {
        let event = make_event(EventStatus::Pending);
        let far_future = Utc::now() + chrono::Duration::days(1);
        assert!(!event.is_expired_at(far_future));
    }

    #[test]
    fn sent_event_expires_after_timeout() {
        let mut event = make_event(EventStatus::Pending);
        let sent = Utc::now();
        event.mark_sent(sent);

        assert!(!event.is_expired_at(sent + chrono::Duration::seconds(30)));
        assert!(event.is_expired_at(sent + chrono::Duration::milliseconds(30_001)));
    }

    #[test]
    fn only_pending_events_expire() {
        let sent = Utc::now();
        let later = sent + chrono::Duration::minutes(5);
        for status in [
            EventStatus::Confirmed,
            EventStatus::Failed,
            EventStatus::Timeout,
            EventStatus::Retrying,
        ] {
            let mut event = make_event(EventStatus::Pending);
            event.sent_at = Some(sent);
            event.status = status;
            assert!(!event.is_expired_at(later), "{} should not expire", status);
        }
    }

    #[test]
    fn sent_at_in_future_is_not_expired() {
        let mut event = make_event(EventStatus::Pending);
        let now = Utc::now();
        event.mark_sent(now + chrono::Duration::minutes(1));
        assert!(!event.is_expired_at(now));
    }

    #[test]
    fn can_retry_requires_failed_or_timeout_with_budget() {
        assert!(make_event(EventStatus::Failed).can_retry());
        assert!(make_event(EventStatus::Timeout).can_retry());
        assert!(!make_event(EventStatus::Pending).can_retry());
        assert!(!make_event(EventStatus::Confirmed).can_retry());
        assert!(!make_event(EventStatus::Retrying).can_retry());

        let mut exhausted = make_event(EventStatus::Failed);
        exhausted.retry_count = 3;
        assert!(!exhausted.can_retry());

        let mut no_budget = make_event(EventStatus::Timeout);
        no_budget.max_retries = 0;
        assert!(!no_budget.can_retry());
    }

    #[test]
    fn retry_transitions() {
        let mut event = make_event(EventStatus::Failed);
        event.begin_retry();
        assert_eq!(event.status, EventStatus::Retrying);
        assert_eq!(event.retry_count, 1);

        let now = Utc::now();
        event.retry_failed("relay unreachable".to_string(), now);
        assert_eq!(event.status, EventStatus::Failed);
        assert_eq!(event.last_error.as_deref(), Some("relay unreachable"));
        assert_eq!(event.retry_errors, vec!["attempt 1: relay unreachable"]);

        event.begin_retry();
        event.retry_delivered(now);
        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(event.sent_at, Some(now));
        assert_eq!(event.retry_count, 2);
    }

    #[test]
    fn confirmation_latency_requires_sent_at() {
        let mut event = make_event(EventStatus::Pending);
        let now = Utc::now();
        event.mark_confirmed(now);
        assert!(event.confirmation_latency_ms().is_none());

        event.sent_at = Some(now - chrono::Duration::milliseconds(250));
        let latency = event.confirmation_latency_ms().unwrap();
        assert!((latency - 250.0).abs() < 0.001);
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&EventStatus::Timeout).unwrap();
        assert_eq!(json, "\"timeout\"");
        let priority: EventPriority = serde_json::from_str("\"critical\"").unwrap();
        assert_eq!(priority, EventPriority::Critical);
        assert_eq!(EventPriority::default(), EventPriority::Normal);
    }

    #[test]
    fn id_generator_format() {
        let mut generator = EventIdGenerator::default();
        let now = Utc::now();
        let id = generator.next_id("tool_executing", "u1", "r1", now);

        assert!(id.starts_with("tool_executing_u1_r1_"));
        let suffix = id.rsplit('_').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn id_generator_millis_strictly_increase() {
        let mut generator = EventIdGenerator::default();
        let now = Utc::now();
        let mut seen = HashSet::new();
        let mut last_ms = 0i64;

        for _ in 0..1000 {
            // Same wall-clock instant every time
            let id = generator.next_id("t", "s", "r", now);
            let ms: i64 = id.split('_').nth(3).unwrap().parse().unwrap();
            assert!(ms > last_ms);
            last_ms = ms;
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn track_request_builder() {
        let request = TrackRequest::new("tool_finished", "u1", "r1")
            .thread_id("t1")
            .priority(EventPriority::High)
            .timeout(Duration::from_secs(5))
            .max_retries(7);

        assert_eq!(request.thread_id.as_deref(), Some("t1"));
        assert_eq!(request.priority, EventPriority::High);
        assert_eq!(request.timeout, Some(Duration::from_secs(5)));
        assert_eq!(request.max_retries, Some(7));
        assert!(request.retry_callback.is_none());
        assert!(format!("{:?}", request).contains("has_retry_callback: false"));
    }
}
