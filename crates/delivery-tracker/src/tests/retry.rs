//! II. Retry Scheduling tests.
//!
//! Rules covered:
//! - 7. A failed retry is re-scheduled with doubling delays until the budget runs out
//! - 8. retry_count never exceeds max_retries
//! - 9. A delivered retry returns the event to pending with a fresh send time
//! - 10. A retry that fires after confirmation does nothing
//! - 11. Failing again replaces the pending retry timer
//! - 12. A retry without a callback spends budget and leaves the event failed
//! - 13. A panicking callback is recorded as a failed attempt
//! - 14. The callback receives the tracked event type and payload
//!
//! Scenarios:
//! - C. One fail, two failed retries, then a delivered one

use super::harness::{payload, tool_event, tracker_with, ScriptedCallback, Step};
use crate::callback::RetryOutcome;
use crate::config::TrackerConfig;
use crate::event::EventStatus;
use crate::tracker::DeliveryTracker;
use serde_json::json;
use std::time::Duration;
use tokio::time::sleep;

fn failing() -> RetryOutcome {
    RetryOutcome::Failed("relay unreachable".to_string())
}

/// Rule 7: A failed retry is re-scheduled with doubling delays until the budget runs out
#[tokio::test(start_paused = true)]
async fn rule_07_retries_back_off_until_budget_exhausted() {
    let tracker = DeliveryTracker::with_defaults();
    tracker.start().unwrap();

    let callback = ScriptedCallback::always(failing());
    let id = tracker.track(tool_event().max_retries(3).retry_callback(callback.clone()));
    tracker.fail(&id, "send failed");

    // Attempts land at 1s, 1+2=3s and 3+4=7s
    sleep(Duration::from_millis(900)).await;
    assert_eq!(callback.call_count(), 0);

    sleep(Duration::from_millis(200)).await;
    assert_eq!(callback.call_count(), 1);

    sleep(Duration::from_secs(2)).await;
    assert_eq!(callback.call_count(), 2);

    sleep(Duration::from_secs(4)).await;
    assert_eq!(callback.call_count(), 3);

    sleep(Duration::from_secs(60)).await;
    assert_eq!(callback.call_count(), 3);

    let event = tracker.event(&id).unwrap();
    assert_eq!(event.status, EventStatus::Failed);
    assert_eq!(event.retry_count, 3);
    assert_eq!(
        event.retry_errors,
        vec![
            "attempt 1: relay unreachable",
            "attempt 2: relay unreachable",
            "attempt 3: relay unreachable",
        ]
    );
    assert_eq!(event.last_error.as_deref(), Some("relay unreachable"));
    assert!(!event.can_retry());

    let metrics = tracker.metrics();
    assert_eq!(metrics.total_retries, 3);
    assert_eq!(metrics.successful_retries, 0);
    assert_eq!(tracker.scheduled_retry_count(), 0);

    tracker.stop().await;
}

/// Rule 8: retry_count never exceeds max_retries
#[tokio::test(start_paused = true)]
async fn rule_08_zero_budget_never_retries() {
    let tracker = DeliveryTracker::with_defaults();
    tracker.start().unwrap();

    let callback = ScriptedCallback::always(RetryOutcome::Delivered);
    let id = tracker.track(tool_event().max_retries(0).retry_callback(callback.clone()));
    tracker.fail(&id, "send failed");
    assert_eq!(tracker.scheduled_retry_count(), 0);

    // Repeated failures don't buy more attempts either
    let bounded = ScriptedCallback::always(failing());
    let other = tracker.track(tool_event().max_retries(1).retry_callback(bounded.clone()));
    tracker.fail(&other, "send failed");
    sleep(Duration::from_secs(5)).await;
    tracker.fail(&other, "send failed again");
    sleep(Duration::from_secs(60)).await;

    assert_eq!(callback.call_count(), 0);
    assert_eq!(bounded.call_count(), 1);
    assert_eq!(tracker.event(&other).unwrap().retry_count, 1);
    assert_eq!(tracker.metrics().total_retries, 1);

    tracker.stop().await;
}

/// Rule 9: A delivered retry returns the event to pending with a fresh send time
#[tokio::test(start_paused = true)]
async fn rule_09_delivered_retry_returns_to_pending() {
    let tracker = DeliveryTracker::with_defaults();
    tracker.start().unwrap();

    let callback = ScriptedCallback::scripted(
        vec![Step::Outcome(failing())],
        Step::Outcome(RetryOutcome::Delivered),
    );
    let id = tracker.track(tool_event().retry_callback(callback.clone()));
    tracker.mark_sent(&id);
    let first_sent = tracker.event(&id).unwrap().sent_at;
    tracker.fail(&id, "send failed");

    sleep(Duration::from_secs(10)).await;

    let event = tracker.event(&id).unwrap();
    assert_eq!(callback.call_count(), 2);
    assert_eq!(event.status, EventStatus::Pending);
    assert_eq!(event.retry_count, 2);
    assert!(event.sent_at.is_some());
    assert!(event.sent_at >= first_sent);
    assert_eq!(event.retry_errors, vec!["attempt 1: relay unreachable"]);

    let metrics = tracker.metrics();
    assert_eq!(metrics.total_retries, 2);
    assert_eq!(metrics.successful_retries, 1);

    assert!(tracker.confirm(&id));
    assert_eq!(tracker.metrics().total_confirmed, 1);

    tracker.stop().await;
}

/// Rule 10: A retry that fires after confirmation does nothing
#[tokio::test(start_paused = true)]
async fn rule_10_confirmed_event_is_not_retried() {
    let tracker = DeliveryTracker::with_defaults();
    tracker.start().unwrap();

    let callback = ScriptedCallback::always(RetryOutcome::Delivered);
    let id = tracker.track(tool_event().retry_callback(callback.clone()));
    tracker.fail(&id, "send failed");
    tracker.confirm(&id);

    sleep(Duration::from_secs(5)).await;

    assert_eq!(callback.call_count(), 0);
    assert_eq!(tracker.status(&id), Some(EventStatus::Confirmed));
    assert_eq!(tracker.metrics().total_retries, 0);
    assert_eq!(tracker.scheduled_retry_count(), 0);

    tracker.stop().await;
}

/// Rule 11: Failing again replaces the pending retry timer
#[tokio::test(start_paused = true)]
async fn rule_11_refail_replaces_pending_timer() {
    let tracker = DeliveryTracker::with_defaults();
    tracker.start().unwrap();

    let callback = ScriptedCallback::always(RetryOutcome::Delivered);
    let id = tracker.track(tool_event().retry_callback(callback.clone()));

    tracker.fail(&id, "first");
    sleep(Duration::from_millis(500)).await;
    tracker.fail(&id, "second");
    assert_eq!(tracker.scheduled_retry_count(), 1);

    // The original timer would have fired at 1s
    sleep(Duration::from_millis(700)).await;
    assert_eq!(callback.call_count(), 0);

    // The replacement fires at 1.5s
    sleep(Duration::from_millis(400)).await;
    assert_eq!(callback.call_count(), 1);

    sleep(Duration::from_secs(30)).await;
    assert_eq!(callback.call_count(), 1);
    assert_eq!(tracker.status(&id), Some(EventStatus::Pending));

    tracker.stop().await;
}

/// Rule 12: A retry without a callback spends budget and leaves the event failed
#[tokio::test(start_paused = true)]
async fn rule_12_retry_without_callback_spends_budget() {
    let tracker = DeliveryTracker::with_defaults();
    tracker.start().unwrap();

    let id = tracker.track(tool_event().max_retries(3));
    tracker.fail(&id, "send failed");
    assert_eq!(tracker.scheduled_retry_count(), 1);

    sleep(Duration::from_secs(5)).await;

    let event = tracker.event(&id).unwrap();
    assert_eq!(event.status, EventStatus::Failed);
    assert_eq!(event.retry_count, 1);
    assert!(event.retry_errors.is_empty());
    assert_eq!(tracker.metrics().total_retries, 1);
    assert_eq!(tracker.scheduled_retry_count(), 0);

    // Later failures keep spending the budget until it runs out
    for _ in 0..10 {
        tracker.fail(&id, "send failed again");
        sleep(Duration::from_secs(60)).await;
    }

    let event = tracker.event(&id).unwrap();
    assert_eq!(event.status, EventStatus::Failed);
    assert_eq!(event.retry_count, 3);
    assert!(!event.can_retry());
    assert_eq!(tracker.metrics().total_retries, 3);
    assert_eq!(tracker.scheduled_retry_count(), 0);

    tracker.stop().await;
}

/// Rule 13: A panicking callback is recorded as a failed attempt
#[tokio::test(start_paused = true)]
async fn rule_13_callback_panic_is_captured() {
    let tracker = DeliveryTracker::with_defaults();
    tracker.start().unwrap();

    let callback = ScriptedCallback::scripted(
        vec![Step::Panic("relay client exploded")],
        Step::Outcome(RetryOutcome::Delivered),
    );
    let id = tracker.track(tool_event().max_retries(2).retry_callback(callback.clone()));
    tracker.fail(&id, "send failed");

    // First attempt at 1s panics, second at 1+2=3s delivers
    sleep(Duration::from_secs(2)).await;
    let event = tracker.event(&id).unwrap();
    assert_eq!(event.status, EventStatus::Failed);
    assert_eq!(
        event.last_error.as_deref(),
        Some("retry callback panicked: relay client exploded")
    );

    sleep(Duration::from_secs(2)).await;
    let event = tracker.event(&id).unwrap();
    assert_eq!(event.status, EventStatus::Pending);
    assert_eq!(event.retry_count, 2);
    assert_eq!(callback.call_count(), 2);

    tracker.stop().await;
}

/// Rule 14: The callback receives the tracked event type and payload
#[tokio::test(start_paused = true)]
async fn rule_14_callback_receives_event_data() {
    let tracker = tracker_with(TrackerConfig {
        retry_base_delay_ms: 10,
        retry_max_delay_ms: 100,
        ..Default::default()
    });
    tracker.start().unwrap();

    let callback = ScriptedCallback::always(RetryOutcome::Delivered);
    let id = tracker.track(
        tool_event()
            .payload(payload("tool", json!("grep")))
            .retry_callback(callback.clone()),
    );
    tracker.fail(&id, "send failed");

    sleep(Duration::from_millis(50)).await;

    let calls = callback.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].event_id, id);
    assert_eq!(calls[0].event_type, "tool_executing");
    assert_eq!(calls[0].payload["tool"], json!("grep"));

    tracker.stop().await;
}

/// Scenario C: One fail, two failed retries, then a delivered one
#[tokio::test(start_paused = true)]
async fn scenario_c_two_failed_retries_then_delivery() {
    let tracker = DeliveryTracker::with_defaults();
    tracker.start().unwrap();

    let callback = ScriptedCallback::scripted(
        vec![Step::Outcome(failing()), Step::Outcome(failing())],
        Step::Outcome(RetryOutcome::Delivered),
    );
    let id = tracker.track(tool_event().retry_callback(callback.clone()));
    tracker.mark_sent(&id);
    assert!(tracker.fail(&id, "send failed"));

    // Attempts land at 1s, 3s and 7s
    sleep(Duration::from_secs(10)).await;

    let event = tracker.event(&id).unwrap();
    assert_eq!(callback.call_count(), 3);
    assert_eq!(event.status, EventStatus::Pending);
    assert_eq!(event.retry_count, 3);
    assert_eq!(
        event.retry_errors,
        vec!["attempt 1: relay unreachable", "attempt 2: relay unreachable"]
    );

    let metrics = tracker.metrics();
    assert_eq!(metrics.total_failed, 1);
    assert_eq!(metrics.total_retries, 3);
    assert_eq!(metrics.successful_retries, 1);
    assert_eq!(tracker.scheduled_retry_count(), 0);

    tracker.stop().await;
}
