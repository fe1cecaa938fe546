//! Validation run orchestration
//!
//! The engine owns one run at a time: it picks a scheduling strategy,
//! wires probes through the limiter or worker pool, feeds results to the
//! aggregator and progress tracker, and hands back the final ranking.

use crate::validate::aggregate::ResultAggregator;
use crate::validate::config::RunConfig;
use crate::validate::error::SetupError;
use crate::validate::limiter::ConcurrencyLimiter;
use crate::validate::models::{Endpoint, RankedResult};
use crate::validate::probe::{HttpProbe, Probe};
use crate::validate::progress::{ProgressSink, ProgressTracker, RunState, TracingProgressSink};
use crate::validate::worker::{probe_bounded, shard_plan, LoopEnd, ShardContext, ShardSummary, WorkerPool};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long shards get to report after a cancel before they are abandoned
const SHARD_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// How probes are scheduled for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Strategy {
    /// One cooperative context bounded by a single limiter
    SingleProcess,
    /// Parallel shards, each with its own limiter
    Sharded { shards: usize },
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::SingleProcess => write!(f, "single-process"),
            Strategy::Sharded { shards } => write!(f, "sharded x{}", shards),
        }
    }
}

/// Lifecycle of a validation run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    /// Candidates are being gathered by an outside collaborator
    Fetching,
    Validating(Strategy),
    Aggregating,
    Done,
    /// The run could not start
    Failed,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunPhase::Idle => write!(f, "idle"),
            RunPhase::Fetching => write!(f, "fetching"),
            RunPhase::Validating(strategy) => write!(f, "validating ({})", strategy),
            RunPhase::Aggregating => write!(f, "aggregating"),
            RunPhase::Done => write!(f, "done"),
            RunPhase::Failed => write!(f, "failed"),
        }
    }
}

/// Counters and accounting for a finished run
#[derive(Debug, Clone, Serialize)]
pub struct RunStats {
    pub strategy: Strategy,
    /// Candidates scheduled after truncation
    pub total: usize,
    pub dispatched: u64,
    pub processed: u64,
    pub succeeded: u64,
    /// Probes still in flight when the run was cancelled
    pub abandoned: u64,
    /// Probes lost with a shard that died while running them
    pub crashed: u64,
    /// Successful endpoints left out for exceeding the latency limit
    pub rejected_slow: usize,
    pub shards: Vec<ShardSummary>,
    pub faulted_shards: usize,
    pub cancelled: bool,
    pub elapsed: Duration,
}

/// Ranking plus run statistics
#[derive(Debug, Clone)]
pub struct RunReport {
    pub ranked: RankedResult,
    pub stats: RunStats,
}

struct Validated {
    cancelled: bool,
    shards: Vec<ShardSummary>,
}

/// Runs validation passes over candidate sets
pub struct ValidationEngine {
    config: RunConfig,
    probe: Arc<dyn Probe>,
    sink: Arc<dyn ProgressSink>,
    phase: watch::Sender<RunPhase>,
    shutdown: CancellationToken,
}

impl ValidationEngine {
    /// Create an engine that probes over HTTP
    pub fn new(config: RunConfig) -> Result<Self, SetupError> {
        let probe = HttpProbe::from_config(&config)?;
        Self::with_probe(config, Arc::new(probe))
    }

    /// Create an engine around any probe implementation
    pub fn with_probe(config: RunConfig, probe: Arc<dyn Probe>) -> Result<Self, SetupError> {
        config.validate()?;
        let (phase, _) = watch::channel(RunPhase::Idle);
        Ok(Self {
            config,
            probe,
            sink: Arc::new(TracingProgressSink),
            phase,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn phase(&self) -> RunPhase {
        *self.phase.borrow()
    }

    /// Watch phase transitions
    pub fn subscribe(&self) -> watch::Receiver<RunPhase> {
        self.phase.subscribe()
    }

    /// Token that cancels the current and any later run when triggered.
    /// Results gathered so far are still ranked.
    pub fn cancel_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Mark that candidates are being fetched
    pub fn begin_fetch(&self) {
        self.transition(RunPhase::Fetching);
    }

    /// Strategy for a run over `total` candidates
    pub fn select_strategy(&self, total: usize) -> Strategy {
        if self.config.shard_count <= 1 || total < self.config.shard_threshold {
            return Strategy::SingleProcess;
        }
        match shard_plan(total, self.config.shard_count) {
            0 | 1 => Strategy::SingleProcess,
            shards => Strategy::Sharded { shards },
        }
    }

    /// Validate candidates and return only the ranking
    pub async fn validate<I>(&self, candidates: I) -> Result<RankedResult, SetupError>
    where
        I: IntoIterator<Item = Endpoint>,
    {
        Ok(self.run(candidates).await?.ranked)
    }

    /// Validate candidates.
    ///
    /// Duplicates in the input are probed once per occurrence and collapsed
    /// by the aggregator. Fails only when the run cannot start.
    pub async fn run<I>(&self, candidates: I) -> Result<RunReport, SetupError>
    where
        I: IntoIterator<Item = Endpoint>,
    {
        let mut endpoints: Vec<Endpoint> = candidates.into_iter().collect();
        if endpoints.is_empty() {
            self.transition(RunPhase::Failed);
            return Err(SetupError::EmptyCandidateSet);
        }
        if let Some(max) = self.config.max_candidates {
            if endpoints.len() > max {
                info!("probing the first {} of {} candidates", max, endpoints.len());
                endpoints.truncate(max);
            }
        }

        let total = endpoints.len();
        let strategy = self.select_strategy(total);
        info!(
            "validating {} candidates ({}, concurrency {}, timeout {}ms, max latency {}ms, target {})",
            total,
            strategy,
            self.config.max_concurrency,
            self.config.per_probe_timeout.as_millis(),
            self.config.max_latency_ms(),
            self.config.test_target
        );
        self.transition(RunPhase::Validating(strategy));

        let state = Arc::new(RunState::new(total));
        let tracker = ProgressTracker::spawn(
            Arc::clone(&state),
            self.config.progress_interval,
            Arc::clone(&self.sink),
        );
        let cancel = self.shutdown.child_token();
        let deadline = self
            .config
            .run_deadline
            .map(|after| arm_deadline(cancel.clone(), after));

        let mut aggregator = ResultAggregator::new();
        let validated = match strategy {
            Strategy::SingleProcess => {
                self.run_single(endpoints, &state, &cancel, &mut aggregator)
                    .await
            }
            Strategy::Sharded { .. } => {
                self.run_sharded(endpoints, &state, &cancel, &mut aggregator)
                    .await
            }
        };

        if let Some(timer) = deadline {
            timer.abort();
        }
        tracker.finish().await;

        self.transition(RunPhase::Aggregating);
        let dispatched = state.dispatched();
        let processed = state.processed();
        let crashed: u64 = validated
            .shards
            .iter()
            .map(ShardSummary::crashed_in_flight)
            .sum();
        if !validated.cancelled && dispatched != processed + crashed {
            warn!(dispatched, processed, crashed, "probe accounting does not reconcile");
        }

        let max_latency_ms = self.config.max_latency_ms();
        let rejected_slow = aggregator.slower_than(max_latency_ms);
        let ranked = aggregator.finalize(max_latency_ms);

        let faulted_shards = validated.shards.iter().filter(|s| s.faulted).count();
        let stats = RunStats {
            strategy,
            total,
            dispatched,
            processed,
            succeeded: state.succeeded(),
            abandoned: dispatched.saturating_sub(processed).saturating_sub(crashed),
            crashed,
            rejected_slow,
            shards: validated.shards,
            faulted_shards,
            cancelled: validated.cancelled,
            elapsed: state.elapsed(),
        };

        info!(
            "run complete: {} ranked, {} working, {} too slow, {}/{} probed in {:.1}s{}",
            ranked.len(),
            stats.succeeded,
            stats.rejected_slow,
            stats.processed,
            stats.total,
            stats.elapsed.as_secs_f64(),
            if stats.cancelled { " (cancelled)" } else { "" }
        );
        self.transition(RunPhase::Done);

        Ok(RunReport { ranked, stats })
    }

    async fn run_single(
        &self,
        endpoints: Vec<Endpoint>,
        state: &Arc<RunState>,
        cancel: &CancellationToken,
        aggregator: &mut ResultAggregator,
    ) -> Validated {
        let limiter = ConcurrencyLimiter::new(self.config.max_concurrency);
        let end = probe_bounded(
            Arc::clone(&self.probe),
            endpoints,
            &limiter,
            state,
            None,
            cancel,
            |result| {
                aggregator.record(result);
            },
        )
        .await;

        Validated {
            cancelled: end == LoopEnd::Cancelled,
            shards: Vec::new(),
        }
    }

    async fn run_sharded(
        &self,
        endpoints: Vec<Endpoint>,
        state: &Arc<RunState>,
        cancel: &CancellationToken,
        aggregator: &mut ResultAggregator,
    ) -> Validated {
        let ctx = ShardContext {
            probe: Arc::clone(&self.probe),
            state: Arc::clone(state),
            cancel: cancel.clone(),
            max_concurrency: self.config.max_concurrency,
            batch_size: self.config.shard_batch_size,
        };
        let mut pool = WorkerPool::new(self.config.shard_count).launch(endpoints, ctx);

        let mut cancelled = false;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                batch = pool.next_batch() => match batch {
                    Some(results) => aggregator.extend(results),
                    None => break,
                },
            }
        }

        // Cancelled shards send what they still hold as they exit.
        let mut settled = !cancelled;
        if cancelled {
            let grace = Instant::now() + SHARD_DRAIN_GRACE;
            loop {
                match tokio::time::timeout_at(grace, pool.next_batch()).await {
                    Ok(Some(results)) => aggregator.extend(results),
                    Ok(None) => {
                        settled = true;
                        break;
                    }
                    Err(_) => {
                        debug!("shards still running after the drain grace period");
                        aggregator.extend(pool.drain_ready());
                        break;
                    }
                }
            }
        }
        let shards = pool.finish(!settled).await;

        Validated { cancelled, shards }
    }

    fn transition(&self, next: RunPhase) {
        let previous = self.phase.send_replace(next);
        if previous != next {
            info!("run phase: {} -> {}", previous, next);
        }
    }
}

fn arm_deadline(cancel: CancellationToken, after: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        warn!(
            "run deadline of {:.1}s reached; abandoning in-flight probes",
            after.as_secs_f64()
        );
        cancel.cancel();
    })
}

/// Validate `candidates` over HTTP with `config`
pub async fn validate<I>(candidates: I, config: RunConfig) -> Result<RankedResult, SetupError>
where
    I: IntoIterator<Item = Endpoint>,
{
    ValidationEngine::new(config)?.validate(candidates).await
}
