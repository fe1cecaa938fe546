//! Run counters and periodic progress reporting

use crate::validate::models::ProbeResult;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Counters for one validation run.
///
/// Shared by every probe completion site (including shard threads) and
/// read by [`ProgressTracker`]. All counters only ever increase.
#[derive(Debug)]
pub struct RunState {
    total: u64,
    dispatched: AtomicU64,
    processed: AtomicU64,
    succeeded: AtomicU64,
    started_at: Instant,
}

impl RunState {
    pub fn new(total: usize) -> Self {
        Self {
            total: total as u64,
            dispatched: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// A probe was admitted and is about to run
    pub fn record_dispatch(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// A probe produced its result
    pub fn record(&self, result: &ProbeResult) {
        if result.is_success() {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        }
        self.processed.fetch_add(1, Ordering::Release);
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot::compute(self.total, self.processed(), self.succeeded(), self.elapsed())
    }
}

/// Point-in-time view of run progress
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub percent: f64,
    /// Completed probes per second since the run started
    pub throughput: f64,
    pub eta_secs: f64,
    pub elapsed_secs: f64,
}

impl ProgressSnapshot {
    pub fn compute(total: u64, processed: u64, succeeded: u64, elapsed: Duration) -> Self {
        let elapsed_secs = elapsed.as_secs_f64();
        let percent = if total == 0 {
            100.0
        } else {
            processed as f64 / total as f64 * 100.0
        };
        let throughput = if elapsed_secs > 0.0 {
            processed as f64 / elapsed_secs
        } else {
            0.0
        };
        let eta_secs = if throughput > 0.0 {
            total.saturating_sub(processed) as f64 / throughput
        } else {
            0.0
        };

        Self {
            total,
            processed,
            succeeded,
            percent,
            throughput,
            eta_secs,
            elapsed_secs,
        }
    }

    pub fn eta(&self) -> Duration {
        Duration::from_secs_f64(self.eta_secs)
    }
}

/// Receives progress snapshots for display
pub trait ProgressSink: Send + Sync {
    fn report(&self, snapshot: &ProgressSnapshot);
}

/// Logs each snapshot
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn report(&self, s: &ProgressSnapshot) {
        info!(
            "progress {:.1}% ({}/{}) | working: {} | {:.1}/s | eta {:.0}s",
            s.percent, s.processed, s.total, s.succeeded, s.throughput, s.eta_secs
        );
    }
}

/// Forwards snapshots to a channel
#[derive(Debug, Clone)]
pub struct ChannelProgressSink {
    tx: mpsc::UnboundedSender<ProgressSnapshot>,
}

impl ChannelProgressSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressSnapshot>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelProgressSink {
    fn report(&self, snapshot: &ProgressSnapshot) {
        // A closed receiver only means nobody is watching.
        let _ = self.tx.send(*snapshot);
    }
}

/// Samples a [`RunState`] on a fixed cadence, independent of how fast
/// probes complete, and pushes snapshots to a sink.
pub struct ProgressTracker {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl ProgressTracker {
    pub fn spawn(state: Arc<RunState>, interval: Duration, sink: Arc<dyn ProgressSink>) -> Self {
        let stop = CancellationToken::new();
        let task = tokio::spawn({
            let stop = stop.clone();
            async move {
                let mut ticker = time::interval_at(Instant::now() + interval, interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = ticker.tick() => sink.report(&state.snapshot()),
                    }
                }
                sink.report(&state.snapshot());
            }
        });

        Self { stop, task }
    }

    /// Stop sampling after emitting one final snapshot
    pub async fn finish(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            warn!("progress tracker ended abnormally: {}", e);
        }
    }
}
