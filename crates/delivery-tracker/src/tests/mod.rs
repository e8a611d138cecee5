//! Behavioral suites for the delivery tracker.
//!
//! - `harness.rs`       - Scripted retry callbacks, recording notifier, helpers
//! - `state_machine.rs` - I. Event Lifecycle (Rules 1-6)
//! - `retry.rs`         - II. Retry Scheduling (Rules 7-14, Scenario C)
//! - `sweep.rs`         - III. Timeout Sweep (Rules 15-19, Scenario A)
//! - `eviction.rs`      - IV. Bounded Memory (Rules 20-24)
//! - `metrics.rs`       - V. Metrics (Rules 25-28)
//! - `lifecycle.rs`     - VI. Start / Stop (Rules 29-32)
//! - `emitter.rs`       - VII. Tracked Emission (Rules 33-36)

mod retry;
