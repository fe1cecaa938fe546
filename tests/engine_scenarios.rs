use async_trait::async_trait;
use proxy_sieve::{
    ChannelProgressSink, Endpoint, FailureReason, Probe, ProbeResult, RankedResult, RunConfig,
    RunPhase, SetupError, Strategy, ValidationEngine,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
enum Script {
    Up(u64),
    /// First call answers with the first latency, later calls with the second
    Varying(u64, u64),
    Down(FailureReason),
    /// Never answers within any reasonable deadline
    Hang,
    Panic,
}

/// Probe double answering from a per-endpoint script
struct ScriptedProbe {
    script: HashMap<Endpoint, Script>,
    calls: AtomicUsize,
    seen: Mutex<HashMap<Endpoint, usize>>,
}

impl ScriptedProbe {
    fn new<I: IntoIterator<Item = (Endpoint, Script)>>(script: I) -> Self {
        Self {
            script: script.into_iter().collect(),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Probe for ScriptedProbe {
    async fn probe(&self, endpoint: &Endpoint) -> ProbeResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let attempt = {
            let mut seen = self.seen.lock().unwrap();
            let count = seen.entry(endpoint.clone()).or_insert(0);
            *count += 1;
            *count
        };
        match self.script.get(endpoint).copied() {
            Some(Script::Up(latency_ms)) => ProbeResult::success(endpoint.clone(), latency_ms, 200),
            Some(Script::Varying(first, later)) => {
                let latency_ms = if attempt == 1 { first } else { later };
                ProbeResult::success(endpoint.clone(), latency_ms, 200)
            }
            Some(Script::Down(reason)) => ProbeResult::failure(endpoint.clone(), reason),
            Some(Script::Hang) => {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                ProbeResult::timeout(endpoint.clone())
            }
            Some(Script::Panic) => panic!("probe crashed on {}", endpoint),
            None => ProbeResult::failure(endpoint.clone(), FailureReason::Other),
        }
    }
}

/// Probe double that records the peak number of concurrent calls
#[derive(Default)]
struct GaugeProbe {
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl Probe for GaugeProbe {
    async fn probe(&self, endpoint: &Endpoint) -> ProbeResult {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        ProbeResult::success(endpoint.clone(), 50, 200)
    }
}

fn ep(s: &str) -> Endpoint {
    s.parse().unwrap()
}

fn numbered(i: usize) -> Endpoint {
    Endpoint::new(format!("10.{}.{}.{}", i / 62_500, (i / 250) % 250, i % 250 + 1), 8080).unwrap()
}

fn single_process() -> RunConfig {
    RunConfig::new()
        .with_shard_count(1)
        .with_max_latency(Duration::from_millis(2_000))
}

fn sharded(shards: usize) -> RunConfig {
    RunConfig::new()
        .with_shard_count(shards)
        .with_shard_threshold(0)
        .with_shard_batch_size(3)
        .with_max_latency(Duration::from_millis(2_000))
}

fn assert_well_formed(ranked: &RankedResult, max_latency_ms: u64, candidates: usize) {
    assert!(ranked.len() <= candidates);
    assert!(ranked
        .entries()
        .windows(2)
        .all(|w| w[0].latency_ms <= w[1].latency_ms));
    let unique: HashSet<&Endpoint> = ranked.iter().map(|e| &e.endpoint).collect();
    assert_eq!(unique.len(), ranked.len());
    assert!(ranked.iter().all(|e| e.latency_ms <= max_latency_ms));
}

#[tokio::test]
async fn duplicate_candidates_collapse_to_one_entry() {
    let a = ep("1.1.1.1:80");
    let b = ep("2.2.2.2:80");
    let probe = Arc::new(ScriptedProbe::new([
        (a.clone(), Script::Varying(50, 30)),
        (b.clone(), Script::Down(FailureReason::ConnectionRefused)),
    ]));
    let engine = ValidationEngine::with_probe(single_process(), probe.clone()).unwrap();

    let report = engine.run(vec![a.clone(), b, a.clone()]).await.unwrap();

    assert_eq!(report.ranked.len(), 1);
    assert_eq!(report.ranked.entries()[0].endpoint, a);
    assert_eq!(report.ranked.entries()[0].latency_ms, 30);
    assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.stats.processed, 3);
    assert_eq!(report.stats.succeeded, 2);
    assert_eq!(report.stats.strategy, Strategy::SingleProcess);
}

#[tokio::test]
async fn slow_success_is_excluded() {
    let fast = ep("1.1.1.1:80");
    let slow = ep("2.2.2.2:80");
    let edge = ep("3.3.3.3:80");
    let probe = Arc::new(ScriptedProbe::new([
        (fast.clone(), Script::Up(400)),
        (slow.clone(), Script::Up(2_500)),
        (edge.clone(), Script::Up(2_000)),
    ]));
    let engine = ValidationEngine::with_probe(single_process(), probe).unwrap();

    let report = engine.run(vec![slow.clone(), fast.clone(), edge.clone()]).await.unwrap();

    let order: Vec<&Endpoint> = report.ranked.iter().map(|e| &e.endpoint).collect();
    assert_eq!(order, vec![&fast, &edge]);
    assert_eq!(report.stats.rejected_slow, 1);
}

#[tokio::test]
async fn empty_candidate_set_is_a_setup_error() {
    let probe = Arc::new(ScriptedProbe::new([]));
    let engine = ValidationEngine::with_probe(single_process(), probe.clone()).unwrap();

    let err = engine.run(Vec::new()).await.unwrap_err();

    assert_eq!(err, SetupError::EmptyCandidateSet);
    assert_eq!(engine.phase(), RunPhase::Failed);
    assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn all_failures_yield_empty_ranking() {
    let candidates: Vec<Endpoint> = (0..20).map(numbered).collect();
    let probe = Arc::new(ScriptedProbe::new(
        candidates
            .iter()
            .map(|e| (e.clone(), Script::Down(FailureReason::Timeout))),
    ));
    let engine = ValidationEngine::with_probe(single_process(), probe).unwrap();

    let report = engine.run(candidates).await.unwrap();

    assert!(report.ranked.is_empty());
    assert_eq!(report.stats.processed, 20);
    assert_eq!(engine.phase(), RunPhase::Done);
}

#[tokio::test(start_paused = true)]
async fn in_flight_probes_never_exceed_concurrency() {
    let probe = Arc::new(GaugeProbe::default());
    let config = single_process().with_concurrency(8);
    let engine = ValidationEngine::with_probe(config, probe.clone()).unwrap();

    let report = engine.run((0..100).map(numbered)).await.unwrap();

    assert_eq!(report.ranked.len(), 100);
    assert_eq!(probe.peak.load(Ordering::SeqCst), 8);
}

#[tokio::test]
async fn crashed_shard_does_not_stall_the_run() {
    let candidates: Vec<Endpoint> = (0..40).map(numbered).collect();
    // Shards are contiguous blocks of ten; the crash lands in the second.
    let probe = Arc::new(ScriptedProbe::new(candidates.iter().enumerate().map(
        |(i, e)| {
            let script = if i == 15 {
                Script::Panic
            } else {
                Script::Up(100 + i as u64)
            };
            (e.clone(), script)
        },
    )));
    // Default batch size exceeds a shard, so the crashed shard has sent
    // nothing before it dies.
    let config = RunConfig::new()
        .with_shard_count(4)
        .with_shard_threshold(0)
        .with_max_latency(Duration::from_millis(2_000))
        .with_concurrency(1);
    let engine = ValidationEngine::with_probe(config, probe).unwrap();

    let report = tokio::time::timeout(Duration::from_secs(30), engine.run(candidates.clone()))
        .await
        .expect("run hung after a shard crashed")
        .unwrap();

    assert_eq!(engine.phase(), RunPhase::Done);
    assert_eq!(report.stats.strategy, Strategy::Sharded { shards: 4 });
    assert_eq!(report.stats.faulted_shards, 1);
    assert!(!report.stats.cancelled);

    let faulted: Vec<_> = report.stats.shards.iter().filter(|s| s.faulted).collect();
    assert_eq!(faulted[0].index, 1);
    assert_eq!(faulted[0].reported, 5);
    assert_eq!(faulted[0].dispatched, 6);

    let reported: usize = report.stats.shards.iter().map(|s| s.reported).sum();
    assert_eq!(reported as u64, report.stats.processed);
    assert_eq!(report.stats.processed, 35);
    assert_eq!(report.stats.dispatched, 36);
    assert_eq!(report.stats.crashed, 1);
    assert_eq!(report.stats.abandoned, 0);

    // Shard 1 finished 10..=14 before the crash; 16..=19 never ran.
    let ranked: HashSet<&Endpoint> = report.ranked.iter().map(|e| &e.endpoint).collect();
    assert_eq!(ranked.len(), 35);
    for (i, endpoint) in candidates.iter().enumerate() {
        let expected = !(15..20).contains(&i);
        assert_eq!(ranked.contains(endpoint), expected, "endpoint {} ({})", i, endpoint);
    }
}

#[tokio::test]
async fn sharded_deadline_keeps_results_buffered_in_shards() {
    let candidates: Vec<Endpoint> = (0..40).map(numbered).collect();
    let probe = Arc::new(ScriptedProbe::new(candidates.iter().enumerate().map(
        |(i, e)| {
            let script = if i % 2 == 0 { Script::Up(20) } else { Script::Hang };
            (e.clone(), script)
        },
    )));
    let config = sharded(4)
        .with_concurrency(10)
        .with_run_deadline(Duration::from_millis(300));
    let engine = ValidationEngine::with_probe(config, probe).unwrap();

    let report = tokio::time::timeout(Duration::from_secs(30), engine.run(candidates))
        .await
        .expect("sharded run ignored its deadline")
        .unwrap();

    assert!(report.stats.cancelled);
    assert_eq!(report.stats.strategy, Strategy::Sharded { shards: 4 });
    assert_eq!(report.ranked.len(), 20);
    assert_eq!(report.stats.dispatched, 40);
    assert_eq!(report.stats.processed, 20);
    assert_eq!(report.stats.abandoned, 20);
    assert_eq!(report.stats.crashed, 0);
    assert_eq!(report.stats.faulted_shards, 0);
    assert!(report.stats.shards.iter().all(|s| s.done && s.reported == 5));
    assert_eq!(engine.phase(), RunPhase::Done);
}

#[tokio::test]
async fn run_can_be_spawned_onto_the_runtime() {
    let candidates: Vec<Endpoint> = (0..30).map(numbered).collect();
    let probe = Arc::new(ScriptedProbe::new(
        candidates.iter().map(|e| (e.clone(), Script::Up(15))),
    ));
    let engine = ValidationEngine::with_probe(sharded(2).with_concurrency(4), probe).unwrap();

    let handle = tokio::spawn(async move { engine.run(candidates).await });
    let report = handle.await.unwrap().unwrap();

    assert_eq!(report.ranked.len(), 30);
    assert_eq!(report.stats.strategy, Strategy::Sharded { shards: 2 });
    assert_eq!(report.stats.processed, 30);
}

#[tokio::test]
async fn strategy_does_not_change_the_ranking() {
    let candidates: Vec<Endpoint> = (0..300).map(numbered).collect();
    let script: Vec<(Endpoint, Script)> = candidates
        .iter()
        .enumerate()
        .map(|(i, e)| {
            let script = match i % 5 {
                0 => Script::Down(FailureReason::ConnectionRefused),
                1 => Script::Up(2_000 + (i as u64 * 7) % 900),
                _ => Script::Up((i as u64 * 37) % 1_999 + 1),
            };
            (e.clone(), script)
        })
        .collect();

    let mut input = candidates.clone();
    input.extend(candidates.iter().take(50).cloned());

    let single = ValidationEngine::with_probe(
        single_process().with_concurrency(16),
        Arc::new(ScriptedProbe::new(script.clone())),
    )
    .unwrap()
    .run(input.clone())
    .await
    .unwrap();

    let parallel = ValidationEngine::with_probe(
        sharded(3).with_concurrency(16),
        Arc::new(ScriptedProbe::new(script)),
    )
    .unwrap()
    .run(input)
    .await
    .unwrap();

    assert_eq!(parallel.stats.strategy, Strategy::Sharded { shards: 3 });
    assert_eq!(parallel.stats.faulted_shards, 0);
    assert_eq!(single.ranked, parallel.ranked);
    assert_well_formed(&single.ranked, 2_000, candidates.len());
    assert!(!single.ranked.is_empty());
}

#[tokio::test(start_paused = true)]
async fn deadline_returns_partial_ranking() {
    let candidates: Vec<Endpoint> = (0..10).map(numbered).collect();
    let probe = Arc::new(ScriptedProbe::new(candidates.iter().enumerate().map(
        |(i, e)| {
            let script = if i % 2 == 0 { Script::Up(20) } else { Script::Hang };
            (e.clone(), script)
        },
    )));
    let config = single_process()
        .with_concurrency(10)
        .with_run_deadline(Duration::from_millis(500));
    let engine = ValidationEngine::with_probe(config, probe).unwrap();

    let report = engine.run(candidates).await.unwrap();

    assert!(report.stats.cancelled);
    assert_eq!(report.ranked.len(), 5);
    assert_eq!(report.stats.dispatched, 10);
    assert_eq!(report.stats.processed, 5);
    assert_eq!(report.stats.abandoned, 5);
    assert_eq!(report.stats.crashed, 0);
    assert_eq!(engine.phase(), RunPhase::Done);
}

#[tokio::test]
async fn max_candidates_truncates_input() {
    let candidates: Vec<Endpoint> = (0..10).map(numbered).collect();
    let probe = Arc::new(ScriptedProbe::new(
        candidates.iter().map(|e| (e.clone(), Script::Up(10))),
    ));
    let config = single_process().with_max_candidates(4);
    let engine = ValidationEngine::with_probe(config, probe.clone()).unwrap();

    let report = engine.run(candidates.clone()).await.unwrap();

    assert_eq!(report.stats.total, 4);
    assert_eq!(probe.calls.load(Ordering::SeqCst), 4);
    let ranked: Vec<&Endpoint> = report.ranked.iter().map(|e| &e.endpoint).collect();
    assert!(ranked.iter().all(|e| candidates[..4].contains(e)));
}

#[tokio::test]
async fn progress_sink_sees_final_snapshot() {
    let candidates: Vec<Endpoint> = (0..25).map(numbered).collect();
    let probe = Arc::new(ScriptedProbe::new(
        candidates
            .iter()
            .enumerate()
            .map(|(i, e)| (e.clone(), if i < 10 { Script::Up(5) } else { Script::Down(FailureReason::DnsError) })),
    ));
    let (sink, mut rx) = ChannelProgressSink::new();
    let engine = ValidationEngine::with_probe(single_process(), probe)
        .unwrap()
        .with_progress_sink(Arc::new(sink));
    let mut phases = engine.subscribe();

    engine.run(candidates).await.unwrap();

    let mut last = None;
    while let Ok(snapshot) = rx.try_recv() {
        last = Some(snapshot);
    }
    let last = last.expect("no progress reported");
    assert_eq!(last.total, 25);
    assert_eq!(last.processed, 25);
    assert_eq!(last.succeeded, 10);
    assert_eq!(last.percent, 100.0);

    assert!(phases.has_changed().unwrap());
    assert_eq!(*phases.borrow_and_update(), RunPhase::Done);
}

#[tokio::test]
async fn cancel_token_stops_later_runs_immediately() {
    let candidates: Vec<Endpoint> = (0..5).map(numbered).collect();
    let probe = Arc::new(ScriptedProbe::new(
        candidates.iter().map(|e| (e.clone(), Script::Hang)),
    ));
    let engine = ValidationEngine::with_probe(single_process(), probe).unwrap();
    engine.cancel_token().cancel();

    let report = tokio::time::timeout(Duration::from_secs(5), engine.run(candidates))
        .await
        .expect("cancelled run did not return")
        .unwrap();

    assert!(report.stats.cancelled);
    assert!(report.ranked.is_empty());
}
