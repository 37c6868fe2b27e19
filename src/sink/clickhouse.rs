use std::fmt::Write;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clickhouse_rs::Pool;
use tokio_util::sync::CancellationToken;

use crate::config::ClickHouseConfig;
use crate::export::health::HealthMetrics;
use crate::export::{self, quote_ident};
use crate::migrate::{self, detail_columns, tables};
use crate::observation::{ObservationMeta, StreamKind};
use crate::row::{DetailRow, IntervalStatsRow};
use crate::stats::FULL_PERCENTILES;

const SINK_NAME: &str = "clickhouse";

/// Batches rows in memory and inserts them on flush, one INSERT per table.
///
/// Failed inserts are retried with exponential backoff until they succeed or
/// the run is cancelled, in which case the rows stay buffered. `flush` takes
/// `&mut self`, so a second flush cannot start while one is in flight.
pub struct ClickHouseSink {
    pool: Pool,
    kind: StreamKind,
    database: String,
    retry_backoff: Duration,
    max_retry_backoff: Duration,
    details: Vec<DetailRow>,
    stats: Vec<IntervalStatsRow>,
    cancel: CancellationToken,
    health: Option<Arc<HealthMetrics>>,
}

impl ClickHouseSink {
    /// Connects, creating the database if needed, and brings the result
    /// tables up to date when migrations are enabled.
    pub async fn connect(
        cfg: ClickHouseConfig,
        kind: StreamKind,
        cancel: CancellationToken,
        health: Option<Arc<HealthMetrics>>,
    ) -> Result<Self> {
        let pool = export::connect(&cfg).await?;

        if cfg.migrations.enabled {
            migrate::apply(&pool)
                .await
                .context("applying result schema")?;
        }

        if let Some(health) = &health {
            health
                .clickhouse_connected
                .with_label_values(&[SINK_NAME])
                .set(1.0);
        }

        Ok(Self::with_pool(pool, &cfg, kind, cancel, health))
    }

    fn with_pool(
        pool: Pool,
        cfg: &ClickHouseConfig,
        kind: StreamKind,
        cancel: CancellationToken,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            pool,
            kind,
            database: cfg.database.clone(),
            retry_backoff: cfg.retry_backoff,
            max_retry_backoff: cfg.max_retry_backoff,
            details: Vec::with_capacity(8192),
            stats: Vec::new(),
            cancel,
            health,
        }
    }

    pub fn name(&self) -> &str {
        SINK_NAME
    }

    pub fn record_detail_row(&mut self, row: DetailRow) {
        self.details.push(row);
    }

    pub fn record_stats_row(&mut self, row: IntervalStatsRow) {
        self.stats.push(row);
    }

    /// Rows buffered and not yet inserted.
    pub fn pending_rows(&self) -> usize {
        self.details.len() + self.stats.len()
    }

    /// Inserts the pending detail and stats batches concurrently.
    ///
    /// A batch whose insert is abandoned goes back into the buffer.
    pub async fn flush(&mut self) -> Result<()> {
        let details = std::mem::take(&mut self.details);
        let stats = std::mem::take(&mut self.stats);

        if details.is_empty() && stats.is_empty() {
            return Ok(());
        }

        let (detail_table, stats_table) = tables(self.kind);
        let detail_sql = detail_insert_sql(&self.database, self.kind, &details);
        let stats_sql = stats_insert_sql(&self.database, stats_table, &stats);

        let start = Instant::now();

        let (detail_result, stats_result) = tokio::join!(
            self.insert_with_retry(detail_table, detail_sql),
            self.insert_with_retry(stats_table, stats_sql),
        );

        if let Some(health) = &self.health {
            health
                .sink_flush_duration
                .with_label_values(&[SINK_NAME])
                .observe(start.elapsed().as_secs_f64());
            health
                .sink_batch_size
                .with_label_values(&[SINK_NAME])
                .observe((details.len() + stats.len()) as f64);
        }

        let (details_len, stats_len) = (details.len(), stats.len());
        if detail_result.is_err() {
            self.details = details;
        }
        if stats_result.is_err() {
            self.stats = stats;
        }
        detail_result?;
        stats_result?;

        tracing::debug!(
            details = details_len,
            stats = stats_len,
            took = ?start.elapsed(),
            "flushed ClickHouse batches"
        );

        Ok(())
    }

    /// Flushes pending rows and marks the sink disconnected. Rows that still
    /// cannot be inserted are dropped and counted in the log.
    pub async fn close(&mut self) -> Result<()> {
        let flushed = self.flush().await;

        if flushed.is_err() {
            tracing::warn!(
                details = self.details.len(),
                stats = self.stats.len(),
                "dropping rows that could not be inserted"
            );
            self.details.clear();
            self.stats.clear();
        }

        if let Some(health) = &self.health {
            health
                .clickhouse_connected
                .with_label_values(&[SINK_NAME])
                .set(0.0);
        }

        flushed
    }

    async fn insert_with_retry(&self, table: &str, sql: Option<String>) -> Result<()> {
        let Some(sql) = sql else {
            return Ok(());
        };

        let mut delay = self.retry_backoff;
        let mut attempt = 1u32;

        loop {
            match self.insert(&sql).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.record_batch_error(table);
                    tracing::error!(
                        table,
                        attempt,
                        retry_in = ?delay,
                        error = %format!("{e:#}"),
                        "sending batch failed, retrying"
                    );
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    bail!("insert into {table} abandoned after {attempt} attempts: run cancelled");
                }
                _ = tokio::time::sleep(delay) => {}
            }

            delay = next_backoff(delay, self.max_retry_backoff);
            attempt += 1;
        }
    }

    async fn insert(&self, sql: &str) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle")?;

        handle.execute(sql).await.context("executing insert")?;

        Ok(())
    }

    /// Records a batch error in health metrics.
    fn record_batch_error(&self, table: &str) {
        if let Some(health) = &self.health {
            health
                .export_batch_errors
                .with_label_values(&[SINK_NAME, table])
                .inc();
        }
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// Builds the detail INSERT, or `None` for an empty batch.
fn detail_insert_sql(database: &str, kind: StreamKind, rows: &[DetailRow]) -> Option<String> {
    if rows.is_empty() {
        return None;
    }

    let (table, _) = tables(kind);
    let columns = detail_columns(kind)
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(", ");

    let mut sql = String::with_capacity(128 + rows.len() * 200);
    let _ = write!(
        sql,
        "INSERT INTO {}.{table} ({columns}) VALUES ",
        quote_ident(database)
    );

    for (idx, row) in rows.iter().enumerate() {
        if idx > 0 {
            sql.push_str(", ");
        }

        let _ = write!(
            sql,
            "('{}', {}, {}, {}, '{}'",
            row.hash,
            row.primary_ts,
            row.secondary_ts,
            row.difference_us,
            escape_sql(&row.benchmark_id),
        );

        match (kind, &row.meta) {
            (
                StreamKind::Transactions,
                ObservationMeta::Transaction {
                    from,
                    to,
                    calldata_size,
                },
            ) => {
                let _ = write!(
                    sql,
                    ", '{}', '{}', {calldata_size})",
                    escape_sql(from),
                    escape_sql(to.as_deref().unwrap_or("")),
                );
            }
            (StreamKind::Transactions, _) => sql.push_str(", '', '', 0)"),
            (StreamKind::Blocks, ObservationMeta::Block { tx_count }) => {
                let _ = write!(sql, ", {tx_count})");
            }
            (StreamKind::Blocks, _) => sql.push_str(", 0)"),
        }
    }

    Some(sql)
}

/// Builds the stats INSERT, or `None` for an empty batch.
///
/// Only ranks that have a `pN` column are written; other configured ranks are
/// left to the console and CSV outputs.
fn stats_insert_sql(database: &str, table: &str, rows: &[IntervalStatsRow]) -> Option<String> {
    let first = rows.first()?;

    let ranks: Vec<f64> = first
        .percentiles
        .iter()
        .map(|p| p.rank)
        .filter(|rank| FULL_PERCENTILES.contains(rank))
        .collect();

    let mut sql = String::with_capacity(256 + rows.len() * 320);
    let _ = write!(
        sql,
        "INSERT INTO {}.{table} (start_time, end_time, min, max, benchmark_id, mean, \
         median, std_dev, sample_count, fiber_won",
        quote_ident(database)
    );
    for rank in &ranks {
        let _ = write!(sql, ", p{}", *rank as u32);
    }
    sql.push_str(") VALUES ");

    for (idx, row) in rows.iter().enumerate() {
        if idx > 0 {
            sql.push_str(", ");
        }

        let _ = write!(
            sql,
            "({}, {}, {}, {}, '{}', {}, {}, {}, {}, {}",
            format_datetime(row.start_time),
            format_datetime(row.end_time),
            row.min,
            row.max,
            escape_sql(&row.benchmark_id),
            row.mean,
            row.median,
            row.std_dev,
            row.sample_count,
            row.win_ratio,
        );
        for rank in &ranks {
            let _ = write!(sql, ", {}", row.percentile(*rank).unwrap_or(0.0));
        }
        sql.push(')');
    }

    Some(sql)
}

// --- SQL formatting helpers ---

/// Formats a SystemTime as a ClickHouse DateTime64(3) literal.
fn format_datetime(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    format!("'{}'", dt.format("%Y-%m-%d %H:%M:%S%.3f"))
}

/// Escapes a string value for SQL insertion (single-quote escaping).
fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}
