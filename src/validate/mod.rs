//! Validation engine for HTTP forward proxy candidates
//!
//! This module provides:
//! - Endpoint identity and parsing
//! - A bounded-time HTTP probe per candidate
//! - Bounded concurrency within one context and sharding across threads
//! - Periodic progress snapshots
//! - A deduplicated latency ranking of working endpoints

pub mod aggregate;
pub mod config;
pub mod engine;
pub mod error;
pub mod limiter;
pub mod models;
pub mod probe;
pub mod progress;
pub mod worker;

pub use aggregate::ResultAggregator;
pub use config::{ConfigFile, ProbeMethod, RunConfig, DEFAULT_USER_AGENTS};
pub use engine::{validate, RunPhase, RunReport, RunStats, Strategy, ValidationEngine};
pub use error::SetupError;
pub use limiter::ConcurrencyLimiter;
pub use models::{
    CandidateSet, Endpoint, EndpointError, FailureReason, ProbeOutcome, ProbeResult, RankedEntry,
    RankedResult,
};
pub use probe::{HttpProbe, Probe};
pub use progress::{
    ChannelProgressSink, ProgressSink, ProgressSnapshot, ProgressTracker, RunState,
    TracingProgressSink,
};
pub use worker::{ShardSummary, WorkerPool};
