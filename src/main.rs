use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use proxy_sieve::{
    logging::init_logging,
    source::{save_ranked, CandidateSource, FetcherConfig, OutputFormat, SourceFetcher},
    tui::ValidationDashboard,
    CandidateSet, ChannelProgressSink, ConfigFile, ProbeMethod, RunConfig, RunReport,
    ValidationEngine,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Log file used when the dashboard owns the terminal
const DEFAULT_TUI_LOG: &str = "proxy-sieve.log";

/// Concurrent validator and latency ranker for public HTTP proxies
#[derive(Parser)]
#[command(name = "proxy-sieve")]
#[command(about = "Concurrent validator and latency ranker for public HTTP proxies")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level when RUST_LOG is unset (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Args)]
struct SourceArgs {
    /// Candidate lists to read: files or http(s) URLs
    inputs: Vec<String>,

    /// Also fetch the built-in public proxy lists
    #[arg(long)]
    common_sources: bool,

    /// Timeout in seconds for list downloads
    #[arg(long, default_value = "20")]
    fetch_timeout: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe candidates and save the working ones ranked by latency
    Check {
        #[command(flatten)]
        sources: SourceArgs,

        /// TOML file with run settings; flags override it
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output file for working proxies
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Maximum in-flight probes per execution context
        #[arg(short = 'n', long)]
        concurrency: Option<usize>,

        /// Per-probe timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Latency ceiling in milliseconds for ranked proxies
        #[arg(long)]
        max_latency_ms: Option<u64>,

        /// Number of parallel shards for large candidate sets
        #[arg(long)]
        shards: Option<usize>,

        /// Candidate count at which probing is sharded
        #[arg(long)]
        shard_threshold: Option<usize>,

        /// URL requested through each candidate
        #[arg(long)]
        test_url: Option<String>,

        /// Probe method (head, get, head-then-get)
        #[arg(short, long)]
        method: Option<String>,

        /// Stop probing after this many seconds and rank what came back
        #[arg(long)]
        deadline_secs: Option<u64>,

        /// Probe at most this many candidates
        #[arg(long)]
        max_candidates: Option<usize>,

        /// Show a live dashboard
        #[arg(long)]
        tui: bool,
    },
    /// Fetch and deduplicate candidates without probing
    Fetch {
        #[command(flatten)]
        sources: SourceArgs,

        /// Output file for candidates
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let tui = matches!(cli.command, Commands::Check { tui: true, .. });
    let log_file = match (&cli.log_file, tui) {
        (Some(path), _) => Some(path.clone()),
        (None, true) => Some(PathBuf::from(DEFAULT_TUI_LOG)),
        (None, false) => None,
    };
    init_logging(&cli.log_level, log_file.as_deref())?;

    match cli.command {
        Commands::Check {
            sources,
            config,
            output,
            format,
            concurrency,
            timeout_ms,
            max_latency_ms,
            shards,
            shard_threshold,
            test_url,
            method,
            deadline_secs,
            max_candidates,
            tui,
        } => {
            let format: OutputFormat = format.parse().map_err(|e: String| anyhow!(e))?;

            let mut run_config = RunConfig::new();
            if let Some(path) = config {
                run_config = ConfigFile::load(&path)?.apply(run_config);
                info!("loaded settings from {}", path.display());
            }
            if let Some(n) = concurrency {
                run_config = run_config.with_concurrency(n);
            }
            if let Some(ms) = timeout_ms {
                run_config = run_config.with_probe_timeout(Duration::from_millis(ms));
            }
            if let Some(ms) = max_latency_ms {
                run_config = run_config.with_max_latency(Duration::from_millis(ms));
            }
            if let Some(n) = shards {
                run_config = run_config.with_shard_count(n);
            }
            if let Some(n) = shard_threshold {
                run_config = run_config.with_shard_threshold(n);
            }
            if let Some(url) = test_url {
                run_config = run_config.with_test_target(url);
            }
            if let Some(method) = method {
                run_config = run_config.with_probe_method(parse_probe_method(&method)?);
            }
            if let Some(secs) = deadline_secs {
                run_config = run_config.with_run_deadline(Duration::from_secs(secs));
            }
            if let Some(n) = max_candidates {
                run_config = run_config.with_max_candidates(n);
            }

            let engine = ValidationEngine::new(run_config)?;
            engine.begin_fetch();
            let candidates = gather(&sources).await?;
            if candidates.is_empty() {
                return Err(anyhow!("no candidates found in the given sources"));
            }

            let report = if tui {
                let (sink, progress_rx) = ChannelProgressSink::new();
                let engine = engine.with_progress_sink(Arc::new(sink));
                ValidationDashboard::new(engine, candidates.into_iter().collect(), progress_rx)
                    .run()
                    .await?
            } else {
                let cancel = engine.cancel_token();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("interrupted; ranking the results gathered so far");
                        cancel.cancel();
                    }
                });
                engine.run(candidates).await?
            };

            print_report(&report);
            if let Some(path) = output {
                save_ranked(&report.ranked, &path, format)?;
            }
        }
        Commands::Fetch { sources, output } => {
            let candidates = gather(&sources).await?;
            eprintln!("Total unique candidates: {}", candidates.len());

            let content: String = candidates
                .iter()
                .map(|endpoint| format!("{}\n", endpoint))
                .collect();
            match output {
                Some(path) => {
                    std::fs::write(&path, &content)?;
                    eprintln!("Saved candidates to {:?}", path);
                }
                None => print!("{}", content),
            }
        }
    }

    Ok(())
}

async fn gather(args: &SourceArgs) -> Result<CandidateSet> {
    let mut sources: Vec<CandidateSource> =
        args.inputs.iter().map(|s| CandidateSource::parse(s)).collect();
    if args.common_sources {
        sources.extend(CandidateSource::common());
    }
    if sources.is_empty() {
        return Err(anyhow!(
            "no candidate sources given; pass files, URLs or --common-sources"
        ));
    }

    let fetcher = SourceFetcher::with_config(
        FetcherConfig::new().with_timeout(Duration::from_secs(args.fetch_timeout)),
    )?;
    Ok(fetcher.fetch_all(&sources).await)
}

fn print_report(report: &RunReport) {
    let stats = &report.stats;
    println!(
        "Probed {}/{} candidates ({}) in {:.1}s{}",
        stats.processed,
        stats.total,
        stats.strategy,
        stats.elapsed.as_secs_f64(),
        if stats.cancelled { ", cancelled" } else { "" }
    );
    println!(
        "Results: {} working, {} ranked, {} over the latency limit",
        stats.succeeded,
        report.ranked.len(),
        stats.rejected_slow
    );
    if stats.faulted_shards > 0 {
        println!(
            "Warning: {} shard(s) stopped early, {} probe(s) lost mid-flight",
            stats.faulted_shards, stats.crashed
        );
    }
    if let Some(avg) = report.ranked.average_latency_ms() {
        println!("Average latency: {}ms", avg);
    }

    if !report.ranked.is_empty() {
        println!("\nFastest proxies:");
        for entry in report.ranked.iter().take(10) {
            println!("  {} ({}ms)", entry.endpoint, entry.latency_ms);
        }
    }
}

fn parse_probe_method(s: &str) -> Result<ProbeMethod> {
    s.parse::<ProbeMethod>().map_err(|e| anyhow!(e))
}
