//! Deduplicating merge of probe results into a latency ranking

use crate::validate::models::{Endpoint, ProbeOutcome, ProbeResult, RankedEntry, RankedResult};
use futures::stream::{Stream, StreamExt};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Best {
    latency_ms: u64,
    status_code: u16,
}

/// Keeps the best observed success per endpoint.
///
/// Upserts are keyed by endpoint identity, so replaying a result or
/// receiving duplicates from several shards never adds entries. Failures
/// are counted and dropped; they never evict a success.
#[derive(Debug, Default)]
pub struct ResultAggregator {
    best: HashMap<Endpoint, Best>,
    received: u64,
    failures: u64,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one result, returning whether the ranking input changed
    pub fn record(&mut self, result: ProbeResult) -> bool {
        self.received += 1;

        let (latency_ms, status_code) = match result.outcome {
            ProbeOutcome::Success {
                latency_ms,
                status_code,
            } => (latency_ms, status_code),
            ProbeOutcome::Failure { .. } => {
                self.failures += 1;
                return false;
            }
        };

        let candidate = Best {
            latency_ms,
            status_code,
        };
        match self.best.get_mut(&result.endpoint) {
            Some(best) if best.latency_ms <= latency_ms => false,
            Some(best) => {
                *best = candidate;
                true
            }
            None => {
                self.best.insert(result.endpoint, candidate);
                true
            }
        }
    }

    pub fn extend<I: IntoIterator<Item = ProbeResult>>(&mut self, results: I) {
        for result in results {
            self.record(result);
        }
    }

    /// Endpoints with at least one success
    pub fn len(&self) -> usize {
        self.best.len()
    }

    pub fn is_empty(&self) -> bool {
        self.best.is_empty()
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn best_latency(&self, endpoint: &Endpoint) -> Option<u64> {
        self.best.get(endpoint).map(|b| b.latency_ms)
    }

    /// Endpoints whose best latency is still above the ceiling
    pub fn slower_than(&self, max_latency_ms: u64) -> usize {
        self.best
            .values()
            .filter(|b| b.latency_ms > max_latency_ms)
            .count()
    }

    /// Drop endpoints over the latency ceiling and sort the rest, fastest first.
    ///
    /// Consumes the aggregator, so results arriving afterwards have nowhere
    /// to go.
    pub fn finalize(self, max_latency_ms: u64) -> RankedResult {
        let mut entries: Vec<RankedEntry> = self
            .best
            .into_iter()
            .filter_map(|(endpoint, best)| {
                if best.latency_ms > max_latency_ms {
                    debug!(
                        %endpoint,
                        latency_ms = best.latency_ms,
                        max_latency_ms,
                        "rejected: over latency limit"
                    );
                    return None;
                }
                Some(RankedEntry {
                    endpoint,
                    latency_ms: best.latency_ms,
                    status_code: best.status_code,
                })
            })
            .collect();

        entries.sort_by(|a, b| {
            a.latency_ms
                .cmp(&b.latency_ms)
                .then_with(|| a.endpoint.cmp(&b.endpoint))
        });
        RankedResult::from_sorted(entries)
    }
}

/// Drain a stream of results and rank them
pub async fn merge<S>(results: S, max_latency_ms: u64) -> RankedResult
where
    S: Stream<Item = ProbeResult>,
{
    let mut aggregator = ResultAggregator::new();
    futures::pin_mut!(results);
    while let Some(result) = results.next().await {
        aggregator.record(result);
    }
    aggregator.finalize(max_latency_ms)
}
