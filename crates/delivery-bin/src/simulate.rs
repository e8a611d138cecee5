//! Simulated emission workload.
//!
//! Emits events through a [`TrackedEmitter`] over a notifier that randomly
//! rejects sends and randomly acknowledges accepted ones after a short
//! delay, then waits until every event is settled and reports metrics.

use anyhow::bail;
use async_trait::async_trait;
use clap::Args;
use delivery_tracker::{
    DeliveryMetrics, DeliveryTracker, EventPayload, EventPriority, EventStatus, Notifier,
    OutboundNotification, TrackRequest, TrackedEmitter, TrackedEvent, TrackerConfig,
};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

const EVENT_TYPES: &[&str] = &[
    "tool_executing",
    "tool_finished",
    "message_delta",
    "session_ready",
];
const PRIORITIES: &[EventPriority] = &[
    EventPriority::Critical,
    EventPriority::High,
    EventPriority::Normal,
    EventPriority::Low,
];
const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Number of events to emit
    #[arg(long, default_value_t = 100)]
    pub events: usize,

    /// Probability (0-1) that the notifier rejects a send
    #[arg(long, default_value_t = 0.2)]
    pub failure_rate: f64,

    /// Probability (0-1) that an accepted send is acknowledged
    #[arg(long, default_value_t = 0.8)]
    pub ack_rate: f64,

    /// Number of distinct subjects to spread events over
    #[arg(long, default_value_t = 5)]
    pub subjects: usize,

    /// Upper bound on the simulated acknowledgement delay
    #[arg(long, default_value_t = 200)]
    pub max_ack_delay_ms: u64,

    /// Confirmation timeout for simulated events
    #[arg(long, default_value_t = 1_000)]
    pub timeout_ms: u64,

    /// Sweep interval for the simulation run
    #[arg(long, default_value_t = 250)]
    pub sweep_interval_ms: u64,

    /// Pause between emissions
    #[arg(long, default_value_t = 5)]
    pub emit_interval_ms: u64,

    /// Give up waiting for events to settle after this long
    #[arg(long, default_value_t = 120)]
    pub max_duration_secs: u64,
}

impl SimulateArgs {
    fn validate(&self) -> anyhow::Result<()> {
        for (name, rate) in [
            ("failure-rate", self.failure_rate),
            ("ack-rate", self.ack_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                bail!("--{} must be between 0 and 1, got {}", name, rate);
            }
        }
        if self.subjects == 0 {
            bail!("--subjects must be at least 1");
        }
        Ok(())
    }
}

/// Acknowledgement the simulated consumer will send.
#[derive(Debug)]
struct PendingAck {
    event_id: String,
    delay: Duration,
}

/// Notifier that rejects sends at `failure_rate` and acknowledges accepted
/// ones at `ack_rate`.
struct SimulatedNotifier {
    failure_rate: f64,
    ack_rate: f64,
    max_ack_delay: Duration,
    acks: mpsc::UnboundedSender<PendingAck>,
}

#[async_trait]
impl Notifier for SimulatedNotifier {
    async fn send(&self, subject_id: &str, notification: &OutboundNotification) -> bool {
        let (rejected, ack_delay) = {
            let mut rng = rand::thread_rng();
            let rejected = rng.gen_bool(self.failure_rate);
            let acked = !rejected && rng.gen_bool(self.ack_rate);
            let max_ms = self.max_ack_delay.as_millis() as u64;
            let delay = acked.then(|| Duration::from_millis(rng.gen_range(0..=max_ms)));
            (rejected, delay)
        };

        if rejected {
            debug!(event_id = %notification.event_id, subject_id = %subject_id, "Simulated send rejected");
            return false;
        }
        if let Some(delay) = ack_delay {
            let _ = self.acks.send(PendingAck {
                event_id: notification.event_id.clone(),
                delay,
            });
        }
        true
    }
}

/// Final report printed by `simulate`.
#[derive(Debug, Serialize)]
pub struct SimulationSummary {
    pub events: usize,
    pub settled: bool,
    pub interrupted: bool,
    pub elapsed_ms: u64,
    pub by_status: BTreeMap<String, usize>,
    pub confirmation_rate: f64,
    pub critical_confirmation_rate: f64,
    pub metrics: DeliveryMetrics,
}

/// Whether an event will not change again without outside input.
fn is_settled(event: &TrackedEvent) -> bool {
    match event.status {
        EventStatus::Confirmed => true,
        EventStatus::Failed | EventStatus::Timeout => !event.can_retry(),
        EventStatus::Pending | EventStatus::Retrying => false,
    }
}

fn all_settled(tracker: &DeliveryTracker, event_ids: &[String]) -> bool {
    event_ids
        .iter()
        .all(|id| tracker.event(id).as_ref().map_or(true, is_settled))
}

/// Run the simulated workload to completion (or Ctrl-C).
pub async fn run(
    tracker_config: TrackerConfig,
    args: SimulateArgs,
) -> anyhow::Result<SimulationSummary> {
    run_until(tracker_config, args, tokio::signal::ctrl_c()).await
}

/// Run the simulated workload until it settles, times out, or `shutdown`
/// resolves. Events emitted before shutdown are still reported.
async fn run_until<F>(
    mut tracker_config: TrackerConfig,
    args: SimulateArgs,
    shutdown: F,
) -> anyhow::Result<SimulationSummary>
where
    F: Future,
{
    args.validate()?;
    tracker_config.default_timeout_ms = args.timeout_ms;
    tracker_config.cleanup_interval_ms = args.sweep_interval_ms;

    let tracker = DeliveryTracker::new(tracker_config)?;
    tracker.start()?;

    let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
    let notifier = Arc::new(SimulatedNotifier {
        failure_rate: args.failure_rate,
        ack_rate: args.ack_rate,
        max_ack_delay: Duration::from_millis(args.max_ack_delay_ms),
        acks: ack_tx,
    });
    let emitter = TrackedEmitter::new(tracker.clone(), notifier);

    let consumer = {
        let emitter = emitter.clone();
        tokio::spawn(async move {
            while let Some(ack) = ack_rx.recv().await {
                let emitter = emitter.clone();
                tokio::spawn(async move {
                    sleep(ack.delay).await;
                    emitter.acknowledge(&ack.event_id);
                });
            }
        })
    };

    info!(
        events = args.events,
        failure_rate = args.failure_rate,
        ack_rate = args.ack_rate,
        "Starting simulation"
    );

    let started = Instant::now();
    let mut event_ids = Vec::with_capacity(args.events);
    let (settled, interrupted) = tokio::select! {
        settled = emit_and_settle(&emitter, &args, &mut event_ids) => (settled, false),
        _ = shutdown => (false, true),
    };
    if interrupted {
        info!(
            emitted = event_ids.len(),
            "Received shutdown signal, stopping simulation"
        );
    }

    tracker.stop().await;
    consumer.abort();

    if !settled && !interrupted {
        warn!(
            max_duration_secs = args.max_duration_secs,
            "Simulation ended before every event settled"
        );
    }

    let mut by_status = BTreeMap::new();
    for id in &event_ids {
        if let Some(status) = tracker.status(id) {
            *by_status.entry(status.to_string()).or_insert(0) += 1;
        }
    }

    let metrics = tracker.metrics();
    Ok(SimulationSummary {
        events: metrics.total_tracked as usize,
        settled,
        interrupted,
        elapsed_ms: started.elapsed().as_millis() as u64,
        by_status,
        confirmation_rate: metrics.confirmation_rate(),
        critical_confirmation_rate: metrics.critical_confirmation_rate(),
        metrics,
    })
}

/// Emit every event into `event_ids`, then poll until all are settled or
/// time runs out.
async fn emit_and_settle(
    emitter: &TrackedEmitter,
    args: &SimulateArgs,
    event_ids: &mut Vec<String>,
) -> bool {
    for i in 0..args.events {
        let request = {
            let mut rng = rand::thread_rng();
            let event_type = EVENT_TYPES.choose(&mut rng).copied().unwrap_or("tool_executing");
            let priority = PRIORITIES
                .choose(&mut rng)
                .copied()
                .unwrap_or_default();
            let mut payload = EventPayload::new();
            payload.insert("sequence".to_string(), serde_json::json!(i));

            TrackRequest::new(
                event_type,
                format!("user-{}", i % args.subjects),
                format!("run-{}", i / 10),
            )
            .priority(priority)
            .payload(payload)
        };

        event_ids.push(emitter.emit(request).await);
        if args.emit_interval_ms > 0 {
            sleep(Duration::from_millis(args.emit_interval_ms)).await;
        }
    }

    let deadline = Instant::now() + Duration::from_secs(args.max_duration_secs);
    loop {
        if all_settled(emitter.tracker(), event_ids) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(SETTLE_POLL_INTERVAL).await;
    }
}
