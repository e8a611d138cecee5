//! Aggregate delivery metrics.

use crate::event::{EventPriority, TrackedEvent};
use serde::Serialize;

/// Weight given to the newest latency sample in the running average.
const LATENCY_SAMPLE_WEIGHT: f64 = 0.1;

/// Counters and confirmation-latency stats for one tracker.
///
/// Counters only ever grow. Latency stats come exclusively from confirmed
/// events that had been marked sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeliveryMetrics {
    pub total_tracked: u64,
    pub total_confirmed: u64,
    pub total_failed: u64,
    pub total_timeout: u64,
    pub total_retries: u64,
    pub successful_retries: u64,
    pub critical_confirmed: u64,
    pub critical_failed: u64,
    /// Weighted running average in milliseconds.
    pub avg_confirmation_latency_ms: f64,
    pub max_confirmation_latency_ms: f64,
    /// `None` until the first latency sample arrives.
    pub min_confirmation_latency_ms: Option<f64>,
}

impl DeliveryMetrics {
    /// Percentage of tracked events that were confirmed (0 when nothing tracked).
    pub fn confirmation_rate(&self) -> f64 {
        if self.total_tracked == 0 {
            return 0.0;
        }
        self.total_confirmed as f64 / self.total_tracked as f64 * 100.0
    }

    /// Percentage of settled critical events that were confirmed.
    pub fn critical_confirmation_rate(&self) -> f64 {
        let settled = self.critical_confirmed + self.critical_failed;
        if settled == 0 {
            return 0.0;
        }
        self.critical_confirmed as f64 / settled as f64 * 100.0
    }

    pub(crate) fn record_tracked(&mut self) {
        self.total_tracked += 1;
    }

    pub(crate) fn record_confirmed(&mut self, event: &TrackedEvent) {
        self.total_confirmed += 1;
        if event.priority == EventPriority::Critical {
            self.critical_confirmed += 1;
        }
        if let Some(latency_ms) = event.confirmation_latency_ms() {
            self.record_latency(latency_ms);
        }
    }

    pub(crate) fn record_failed(&mut self, event: &TrackedEvent) {
        self.total_failed += 1;
        if event.priority == EventPriority::Critical {
            self.critical_failed += 1;
        }
    }

    pub(crate) fn record_timeout(&mut self) {
        self.total_timeout += 1;
    }

    pub(crate) fn record_retry(&mut self) {
        self.total_retries += 1;
    }

    pub(crate) fn record_successful_retry(&mut self) {
        self.successful_retries += 1;
    }

    fn record_latency(&mut self, latency_ms: f64) {
        let first_sample = self.min_confirmation_latency_ms.is_none();
        if first_sample {
            self.avg_confirmation_latency_ms = latency_ms;
        } else {
            self.avg_confirmation_latency_ms = (1.0 - LATENCY_SAMPLE_WEIGHT)
                * self.avg_confirmation_latency_ms
                + LATENCY_SAMPLE_WEIGHT * latency_ms;
        }

        self.max_confirmation_latency_ms = self.max_confirmation_latency_ms.max(latency_ms);
        self.min_confirmation_latency_ms = Some(
            self.min_confirmation_latency_ms
                .map_or(latency_ms, |min| min.min(latency_ms)),
        );
    }
}
