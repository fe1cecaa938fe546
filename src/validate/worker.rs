//! Sharded probing across OS threads

use crate::validate::limiter::ConcurrencyLimiter;
use crate::validate::models::{Endpoint, ProbeResult};
use crate::validate::probe::Probe;
use crate::validate::progress::RunState;
use futures::future::{BoxFuture, FutureExt};
use futures::StreamExt;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How a bounded probe loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopEnd {
    Drained,
    Cancelled,
}

/// Probe `endpoints` through `limiter`, handing each result to `on_result`
/// as it completes. Cancellation abandons whatever is still in flight.
///
/// `shard_dispatched`, when given, counts admissions for one shard on top
/// of the run-wide counter.
pub(crate) async fn probe_bounded<F>(
    probe: Arc<dyn Probe>,
    endpoints: Vec<Endpoint>,
    limiter: &ConcurrencyLimiter,
    state: &Arc<RunState>,
    shard_dispatched: Option<Arc<AtomicU64>>,
    cancel: &CancellationToken,
    mut on_result: F,
) -> LoopEnd
where
    F: FnMut(ProbeResult),
{
    let tasks: Vec<BoxFuture<'static, ProbeResult>> = endpoints
        .into_iter()
        .map(|endpoint| {
            let probe = Arc::clone(&probe);
            let state = Arc::clone(state);
            let shard_dispatched = shard_dispatched.clone();
            async move {
                state.record_dispatch();
                if let Some(counter) = shard_dispatched {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                probe.probe(&endpoint).await
            }
            .boxed()
        })
        .collect();

    let results = limiter.run(tasks).boxed();
    futures::pin_mut!(results);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                limiter.close();
                return LoopEnd::Cancelled;
            }
            next = results.next() => match next {
                Some(result) => {
                    state.record(&result);
                    on_result(result);
                }
                None => return LoopEnd::Drained,
            },
        }
    }
}

/// Split into contiguous shards of `ceil(N / shard_count)`; the last may be
/// shorter and no shard is empty.
pub fn partition(endpoints: Vec<Endpoint>, shard_count: usize) -> Vec<Vec<Endpoint>> {
    if endpoints.is_empty() {
        return Vec::new();
    }
    let size = endpoints.len().div_ceil(shard_count.max(1));
    endpoints.chunks(size).map(<[Endpoint]>::to_vec).collect()
}

/// Number of non-empty shards [`partition`] produces
pub fn shard_plan(total: usize, shard_count: usize) -> usize {
    if total == 0 {
        return 0;
    }
    let size = total.div_ceil(shard_count.max(1));
    total.div_ceil(size)
}

/// Incremental report from one shard
#[derive(Debug)]
pub struct ShardMessage {
    pub shard: usize,
    pub results: Vec<ProbeResult>,
    pub done: bool,
}

/// Accounting for one shard after the pool settles
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardSummary {
    pub index: usize,
    pub assigned: usize,
    /// Probes the shard admitted
    pub dispatched: u64,
    /// Results that reached the orchestrator
    pub reported: usize,
    pub done: bool,
    /// The shard died before signalling `done`
    pub faulted: bool,
}

impl ShardSummary {
    /// Assigned endpoints whose results never arrived
    pub fn lost(&self) -> usize {
        self.assigned.saturating_sub(self.reported)
    }

    /// Probes that were running when a faulted shard died
    pub fn crashed_in_flight(&self) -> u64 {
        if self.faulted {
            self.dispatched.saturating_sub(self.reported as u64)
        } else {
            0
        }
    }
}

/// Everything a shard needs to run on its own thread
#[derive(Clone)]
pub struct ShardContext {
    pub probe: Arc<dyn Probe>,
    pub state: Arc<RunState>,
    pub cancel: CancellationToken,
    pub max_concurrency: usize,
    pub batch_size: usize,
}

/// Runs each shard on a dedicated OS thread with its own single-threaded
/// runtime and limiter.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    shard_count: usize,
}

impl WorkerPool {
    pub fn new(shard_count: usize) -> Self {
        Self {
            shard_count: shard_count.max(1),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Partition `endpoints` and start one thread per shard
    pub fn launch(&self, endpoints: Vec<Endpoint>, ctx: ShardContext) -> PoolRun {
        let shards = partition(endpoints, self.shard_count);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut ledger = Vec::with_capacity(shards.len());
        let mut dispatched = Vec::with_capacity(shards.len());
        let mut handles = Vec::with_capacity(shards.len());

        for (index, shard) in shards.into_iter().enumerate() {
            ledger.push(ShardSummary {
                index,
                assigned: shard.len(),
                dispatched: 0,
                reported: 0,
                done: false,
                faulted: false,
            });
            let counter = Arc::new(AtomicU64::new(0));
            dispatched.push(Arc::clone(&counter));

            let ctx = ctx.clone();
            let tx = tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("probe-shard-{}", index))
                .spawn(move || run_shard_thread(index, shard, ctx, counter, tx));

            match spawned {
                Ok(handle) => handles.push((index, handle)),
                Err(e) => {
                    warn!(shard = index, "could not spawn shard thread: {}", e);
                    ledger[index].faulted = true;
                }
            }
        }

        debug!(shards = ledger.len(), "worker pool launched");
        PoolRun {
            rx,
            handles,
            dispatched,
            ledger,
        }
    }
}

fn run_shard_thread(
    index: usize,
    endpoints: Vec<Endpoint>,
    ctx: ShardContext,
    dispatched: Arc<AtomicU64>,
    tx: mpsc::UnboundedSender<ShardMessage>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            warn!(shard = index, "could not start shard runtime: {}", e);
            return;
        }
    };
    runtime.block_on(run_shard(index, endpoints, ctx, dispatched, tx));
}

/// Batches a shard's results for the orchestrator.
///
/// Whatever is still buffered is sent when the reporter is dropped, so a
/// shard that unwinds mid-run still hands over the probes it finished.
struct ShardReporter {
    index: usize,
    batch_size: usize,
    buffer: Vec<ProbeResult>,
    tx: mpsc::UnboundedSender<ShardMessage>,
}

impl ShardReporter {
    fn new(index: usize, batch_size: usize, tx: mpsc::UnboundedSender<ShardMessage>) -> Self {
        Self {
            index,
            batch_size,
            buffer: Vec::with_capacity(batch_size),
            tx,
        }
    }

    fn push(&mut self, result: ProbeResult) {
        self.buffer.push(result);
        if self.buffer.len() >= self.batch_size {
            self.flush(false);
        }
    }

    fn flush(&mut self, done: bool) {
        let results = std::mem::take(&mut self.buffer);
        // The orchestrator stops listening once it has finalized.
        let _ = self.tx.send(ShardMessage {
            shard: self.index,
            results,
            done,
        });
    }

    /// Send the remainder and mark the shard complete
    fn finish(mut self) {
        self.flush(true);
    }
}

impl Drop for ShardReporter {
    fn drop(&mut self) {
        if !self.buffer.is_empty() {
            self.flush(false);
        }
    }
}

async fn run_shard(
    index: usize,
    endpoints: Vec<Endpoint>,
    ctx: ShardContext,
    dispatched: Arc<AtomicU64>,
    tx: mpsc::UnboundedSender<ShardMessage>,
) {
    let ShardContext {
        probe,
        state,
        cancel,
        max_concurrency,
        batch_size,
    } = ctx;
    let limiter = ConcurrencyLimiter::new(max_concurrency);
    let mut reporter = ShardReporter::new(index, batch_size, tx);

    let end = probe_bounded(
        probe,
        endpoints,
        &limiter,
        &state,
        Some(dispatched),
        &cancel,
        |result| reporter.push(result),
    )
    .await;

    debug!(shard = index, ?end, "shard finished");
    reporter.finish();
}

/// A launched pool, read by the orchestrator until every shard settles
pub struct PoolRun {
    rx: mpsc::UnboundedReceiver<ShardMessage>,
    handles: Vec<(usize, thread::JoinHandle<()>)>,
    /// Per-shard admission counters, shared with the shard threads
    dispatched: Vec<Arc<AtomicU64>>,
    ledger: Vec<ShardSummary>,
}

impl PoolRun {
    pub fn shard_count(&self) -> usize {
        self.ledger.len()
    }

    /// Next batch of results from any shard.
    ///
    /// Returns `None` once every shard thread has exited, whether it
    /// signalled `done` or died, so a crashed shard cannot stall the run.
    pub async fn next_batch(&mut self) -> Option<Vec<ProbeResult>> {
        let message = self.rx.recv().await?;
        Some(self.absorb(message))
    }

    /// Batches already queued, without waiting for more
    pub fn drain_ready(&mut self) -> Vec<ProbeResult> {
        let mut results = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            results.extend(self.absorb(message));
        }
        results
    }

    fn absorb(&mut self, message: ShardMessage) -> Vec<ProbeResult> {
        if let Some(entry) = self.ledger.get_mut(message.shard) {
            entry.reported += message.results.len();
            entry.done |= message.done;
        }
        message.results
    }

    /// Settle shard accounting.
    ///
    /// After a normal drain every thread has already exited and is joined
    /// to collect panics. When `abandoned`, threads are left to wind down
    /// on their own and unfinished shards are not counted as faults.
    pub async fn finish(self, abandoned: bool) -> Vec<ShardSummary> {
        let PoolRun {
            rx,
            handles,
            dispatched,
            mut ledger,
        } = self;
        drop(rx);

        if !abandoned {
            let joined = tokio::task::spawn_blocking(move || {
                handles
                    .into_iter()
                    .map(|(index, handle)| (index, handle.join().is_err()))
                    .collect::<Vec<_>>()
            })
            .await;

            match joined {
                Ok(joined) => {
                    for (index, panicked) in joined {
                        if panicked {
                            warn!(shard = index, "shard thread panicked");
                        }
                    }
                }
                Err(e) => warn!("could not join shard threads: {}", e),
            }

            for entry in ledger.iter_mut().filter(|e| !e.done) {
                entry.faulted = true;
            }
        }

        for (entry, counter) in ledger.iter_mut().zip(&dispatched) {
            entry.dispatched = counter.load(Ordering::Relaxed);
        }

        for entry in ledger.iter().filter(|e| e.faulted) {
            warn!(
                shard = entry.index,
                assigned = entry.assigned,
                reported = entry.reported,
                lost = entry.lost(),
                in_flight = entry.crashed_in_flight(),
                "shard stopped early; its remaining endpoints are missing from the ranking"
            );
        }
        ledger
    }
}
