use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use fiber_bench::benchmark::Runner;
use fiber_bench::config::{Config, Overrides};
use fiber_bench::export::{self, health::HealthMetrics};
use fiber_bench::migrate;
use fiber_bench::observation::StreamKind;

/// Latency benchmark: Fiber against bloXroute, matched by hash per interval.
#[derive(Parser)]
#[command(name = "fiber-bench", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Benchmark the transaction streams.
    Transactions(Overrides),
    /// Benchmark the block streams.
    Blocks(Overrides),
    /// Create or upgrade the ClickHouse result tables.
    Migrate(Overrides),
    /// Print version information and exit.
    Version,
}

/// What a parsed command line asks for, after `version` is handled.
enum Job {
    Bench(StreamKind),
    Migrate,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    // Values from .env become visible to the env fallbacks of the flags.
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    let (job, overrides) = match cli.command {
        Command::Version => {
            println!("fiber-bench {}", version::full());
            return Ok(());
        }
        Command::Transactions(o) => (Job::Bench(StreamKind::Transactions), o),
        Command::Blocks(o) => (Job::Bench(StreamKind::Blocks), o),
        Command::Migrate(o) => (Job::Migrate, o),
    };

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    cfg.apply_overrides(overrides);
    if let Some(level) = cli.log_level {
        cfg.log_level = level;
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cfg.log_level)
        .with_context(|| format!("invalid log level: {}", cfg.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match job {
        Job::Bench(kind) => {
            cfg.ensure_benchmark_id(kind);
            cfg.validate(kind).context("invalid configuration")?;
            rt.block_on(async { run(cfg, kind).await })
        }
        Job::Migrate => rt.block_on(async { run_migrate(cfg).await }),
    }
}

async fn run(cfg: Config, kind: StreamKind) -> Result<()> {
    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        stream = %kind,
        benchmark_id = %cfg.benchmark.benchmark_id,
        intervals = cfg.benchmark.interval_count,
        interval = ?cfg.benchmark.interval,
        cross_check = cfg.benchmark.cross_check,
        fiber_only = cfg.fiber_only,
        sink = cfg.sink.kind.as_str(),
        "starting fiber-bench",
    );

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    // Start health metrics server, when enabled.
    let health = if cfg.health.enabled {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        health
            .start()
            .await
            .context("starting health metrics server")?;
        Some(health)
    } else {
        None
    };

    let mut runner = Runner::new(cfg, kind, cancel, health.clone());
    let result = runner.run().await;

    if let Some(health) = &health {
        health.stop().await?;
    }

    let summary = result?;
    tracing::info!(
        completed = summary.intervals_completed,
        skipped = summary.intervals_skipped,
        "fiber-bench stopped"
    );

    Ok(())
}

async fn run_migrate(cfg: Config) -> Result<()> {
    let ch_cfg = cfg.sink.clickhouse;
    anyhow::ensure!(
        !ch_cfg.endpoint.is_empty(),
        "sink.clickhouse.endpoint is required for migrate"
    );

    let pool = export::connect(&ch_cfg).await?;
    let version = migrate::apply(&pool)
        .await
        .context("applying result schema")?;

    println!("{}: schema version {version}", ch_cfg.database);

    Ok(())
}

/// Cancels the token on SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to register SIGTERM handler");
                    let _ = ctrl_c.await;
                    tracing::info!("received SIGINT, shutting down");
                    cancel.cancel();
                    return;
                }
            };

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        cancel.cancel();
    });
}
