//! Benchmark runner: repeats reconcile, aggregate, and flush for a fixed
//! number of intervals and reports an overall summary.

use std::fmt;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::observation::StreamKind;
use crate::reconcile::{
    ClassCounts, CloseReason, DuplicateCounts, IntervalBounds, IntervalOutcome,
    IntervalReconciler, Streams,
};
use crate::row::IntervalStatsRow;
use crate::sink::ResultSink;
use crate::source::SourcePair;
use crate::stats::{self, histogram, PercentileSet, StatsError, Summary};

/// Lifecycle of a benchmark run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Connecting,
    Running { interval: usize, of: usize },
    Flushing { interval: usize, of: usize },
    Complete,
}

impl RunnerState {
    /// Numeric value exported on the `runner_state` gauge.
    pub fn gauge_value(&self) -> f64 {
        match self {
            Self::Idle => 0.0,
            Self::Connecting => 1.0,
            Self::Running { .. } => 2.0,
            Self::Flushing { .. } => 3.0,
            Self::Complete => 4.0,
        }
    }
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Connecting => f.write_str("connecting"),
            Self::Running { interval, of } => write!(f, "running ({interval}/{of})"),
            Self::Flushing { interval, of } => write!(f, "flushing ({interval}/{of})"),
            Self::Complete => f.write_str("complete"),
        }
    }
}

/// Totals over every interval of a run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Intervals that produced a stats row.
    pub intervals_completed: usize,
    /// Intervals without a single matched difference.
    pub intervals_skipped: usize,
    pub counts: ClassCounts,
    pub duplicates: DuplicateCounts,
    pub primary_total: usize,
    pub secondary_total: usize,
    /// Statistics over all matched differences of the run.
    pub overall: Option<Summary>,
    /// Why the last interval closed.
    pub last_close: Option<CloseReason>,
}

impl RunSummary {
    pub fn intervals_run(&self) -> usize {
        self.intervals_completed + self.intervals_skipped
    }
}

/// Drives the benchmark: connect, run intervals, flush, complete.
pub struct Runner {
    cfg: Config,
    kind: StreamKind,
    sink: Option<ResultSink>,
    health: Option<Arc<HealthMetrics>>,
    cancel: CancellationToken,
    state: RunnerState,
}

impl Runner {
    pub fn new(
        cfg: Config,
        kind: StreamKind,
        cancel: CancellationToken,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            cfg,
            kind,
            sink: None,
            health,
            cancel,
            state: RunnerState::Idle,
        }
    }

    /// Uses an already built sink instead of the configured one.
    pub fn with_sink(mut self, sink: ResultSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// Runs the whole benchmark against the configured sources.
    ///
    /// Sink and connection failures are fatal. Failures inside an interval
    /// are logged and the run continues.
    pub async fn run(&mut self) -> Result<RunSummary> {
        // 1. Build the sink (connects and migrates for ClickHouse).
        if self.sink.is_none() {
            self.sink = ResultSink::from_config(
                &self.cfg,
                self.kind,
                self.cancel.clone(),
                self.health.clone(),
            )
            .await
            .context("creating result sink")?;
        }
        if let Some(sink) = &self.sink {
            info!(sink = sink.name(), "result sink ready");
        }

        // 2. Connect sources. Readers get their own token so they can be
        // stopped at the end without touching the caller's.
        self.transition(RunnerState::Connecting);
        let readers_cancel = self.cancel.child_token();
        let sources = SourcePair::from_config(&self.cfg);
        let opened = sources
            .open(
                self.kind,
                &self.cfg,
                readers_cancel.clone(),
                self.health.clone(),
            )
            .await
            .context("connecting sources");
        let mut open = match opened {
            Ok(open) => open,
            Err(e) => {
                self.close_sink().await;
                return Err(e);
            }
        };

        // 3. Run intervals.
        let reconciler = self.reconciler(sources.primary.name(), sources.secondary.name());
        let summary = self.run_intervals(&reconciler, &mut open.streams).await;

        // 4. Stop readers and close the sink.
        readers_cancel.cancel();
        for reader in open.readers {
            if let Err(e) = reader.await {
                warn!(error = %e, "source reader task failed");
            }
        }

        Ok(summary)
    }

    async fn close_sink(&mut self) {
        if let Some(sink) = &mut self.sink {
            if let Err(e) = sink.close().await {
                error!(sink = sink.name(), error = %format!("{e:#}"), "closing sink failed");
            }
        }
    }

    /// Builds the interval reconciler from configuration.
    pub fn reconciler(&self, primary: &str, secondary: &str) -> IntervalReconciler {
        let b = &self.cfg.benchmark;
        IntervalReconciler::new(
            IntervalBounds {
                duration: b.interval,
                max_primary: b.max_primary_observations,
            },
            b.cross_check,
            primary,
            secondary,
        )
        .with_log_missing(b.log_missing)
        .with_health(self.health.clone())
    }

    /// Runs up to `interval_count` intervals over already open streams,
    /// closes the sink, and returns the run summary.
    pub async fn run_intervals(
        &mut self,
        reconciler: &IntervalReconciler,
        streams: &mut Streams,
    ) -> RunSummary {
        let total = self.cfg.benchmark.interval_count;
        let mut summary = RunSummary::default();
        let mut all_differences = Vec::new();

        for index in 1..=total {
            self.transition(RunnerState::Running {
                interval: index,
                of: total,
            });
            self.log_depths(streams);

            let start_time = SystemTime::now();
            let (outcome, reason) = reconciler.run_interval(streams, &self.cancel).await;
            let end_time = SystemTime::now();

            info!(
                interval = index,
                of = total,
                reason = %reason,
                both = outcome.counts.both,
                only_primary = outcome.counts.only_primary,
                only_secondary = outcome.counts.only_secondary,
                excluded_primary = outcome.counts.excluded_primary,
                excluded_secondary = outcome.counts.excluded_secondary,
                unobserved = outcome.counts.unobserved,
                primary_total = outcome.primary_total,
                secondary_total = outcome.secondary_total,
                duplicates_primary = outcome.duplicates.primary,
                duplicates_secondary = outcome.duplicates.secondary,
                confirmed = outcome.confirmed,
                confirmation_batches = outcome.confirmation_batches,
                "interval closed",
            );

            self.transition(RunnerState::Flushing {
                interval: index,
                of: total,
            });

            let stats_row = self.process_interval(&outcome, start_time, end_time);
            match &stats_row {
                Some(_) => summary.intervals_completed += 1,
                None => summary.intervals_skipped += 1,
            }
            self.flush_sink(index).await;

            summary.counts += outcome.counts;
            summary.duplicates.primary += outcome.duplicates.primary;
            summary.duplicates.secondary += outcome.duplicates.secondary;
            summary.primary_total += outcome.primary_total;
            summary.secondary_total += outcome.secondary_total;
            summary.last_close = Some(reason);
            all_differences.extend_from_slice(&outcome.differences);

            if reason.is_terminal() {
                info!(reason = %reason, interval = index, "ending run early");
                break;
            }
        }

        self.close_sink().await;

        summary.overall = stats::summarize(&all_differences, &self.cfg.benchmark.percentiles).ok();
        self.transition(RunnerState::Complete);
        log_summary(&summary);

        summary
    }

    /// Records detail and stats rows for one interval and returns the stats
    /// row, or `None` when the interval had no matched differences.
    fn process_interval(
        &mut self,
        outcome: &IntervalOutcome,
        start_time: SystemTime,
        end_time: SystemTime,
    ) -> Option<IntervalStatsRow> {
        let benchmark_id = self.cfg.benchmark.benchmark_id.clone();

        if let Some(sink) = &mut self.sink {
            for classified in &outcome.classified {
                if let Err(e) = sink.record_detail_row(classified.to_detail_row(&benchmark_id)) {
                    error!(sink = sink.name(), error = %format!("{e:#}"), "recording detail row failed");
                    break;
                }
            }
        }

        if self.sink.as_ref().map_or(true, ResultSink::prints_histogram) {
            let rendered = histogram::render(&outcome.differences);
            if !rendered.is_empty() {
                println!("{rendered}");
            }
        }

        let summary = match summarize_interval(&outcome.differences, &self.cfg.benchmark.percentiles)
        {
            Ok(summary) => summary,
            Err(e) => {
                warn!(
                    samples = outcome.differences.len(),
                    error = %e,
                    "skipping stats row"
                );
                if let Some(health) = &self.health {
                    health.intervals_skipped.inc();
                }
                return None;
            }
        };

        info!(
            samples = summary.count,
            mean_ms = summary.mean,
            median_ms = summary.median,
            std_dev_ms = summary.std_dev,
            min_ms = summary.min,
            max_ms = summary.max,
            win_ratio = summary.win_ratio,
            "interval stats",
        );

        if let Some(health) = &self.health {
            health.intervals_completed.inc();
            health.last_win_ratio.set(summary.win_ratio);
            health.last_mean_ms.set(summary.mean);
        }

        let row = IntervalStatsRow::from_summary(summary, start_time, end_time, &benchmark_id);

        if let Some(sink) = &mut self.sink {
            if let Err(e) = sink.record_stats_row(row.clone()) {
                error!(sink = sink.name(), error = %format!("{e:#}"), "recording stats row failed");
            }
        }

        Some(row)
    }

    async fn flush_sink(&mut self, index: usize) {
        let Some(sink) = &mut self.sink else {
            return;
        };

        let start = Instant::now();
        match sink.flush().await {
            Ok(()) => debug!(sink = sink.name(), interval = index, took = ?start.elapsed(), "sink flushed"),
            Err(e) => error!(
                sink = sink.name(),
                interval = index,
                error = %format!("{e:#}"),
                "flushing sink failed"
            ),
        }
    }

    fn log_depths(&self, streams: &Streams) {
        let depths = streams.depths();
        info!(
            primary = depths.primary,
            secondary = depths.secondary,
            confirmations = depths.confirmations,
            "buffered channel depths",
        );

        if let Some(health) = &self.health {
            health
                .channel_depth
                .with_label_values(&["primary"])
                .set(depths.primary as f64);
            health
                .channel_depth
                .with_label_values(&["secondary"])
                .set(depths.secondary as f64);
            if let Some(confirmations) = depths.confirmations {
                health
                    .channel_depth
                    .with_label_values(&["confirmations"])
                    .set(confirmations as f64);
            }
        }
    }

    fn transition(&mut self, state: RunnerState) {
        self.state = state;
        info!(state = %state, "runner state");
        if let Some(health) = &self.health {
            health.runner_state.set(state.gauge_value());
        }
    }
}

/// Fewer matched differences than this and an interval gets no stats row.
const MIN_INTERVAL_SAMPLES: usize = 2;

/// Summarizes one interval. A lone difference has no dispersion and is
/// rejected as degenerate.
fn summarize_interval(differences: &[f64], set: &PercentileSet) -> Result<Summary, StatsError> {
    if differences.len() == 1 {
        return Err(StatsError::Degenerate {
            got: 1,
            need: MIN_INTERVAL_SAMPLES,
        });
    }
    stats::summarize(differences, set)
}

fn log_summary(summary: &RunSummary) {
    info!(
        intervals = summary.intervals_run(),
        completed = summary.intervals_completed,
        skipped = summary.intervals_skipped,
        both = summary.counts.both,
        only_primary = summary.counts.only_primary,
        only_secondary = summary.counts.only_secondary,
        duplicates_primary = summary.duplicates.primary,
        duplicates_secondary = summary.duplicates.secondary,
        "benchmark complete",
    );

    if let Some(overall) = &summary.overall {
        info!(
            samples = overall.count,
            mean_ms = overall.mean,
            median_ms = overall.median,
            min_ms = overall.min,
            max_ms = overall.max,
            win_ratio = overall.win_ratio,
            "overall stats",
        );
    }
}
