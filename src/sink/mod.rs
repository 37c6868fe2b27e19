pub mod clickhouse;
pub mod csv;
pub mod stdout;

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, SinkKind};
use crate::export::health::HealthMetrics;
use crate::observation::StreamKind;
use crate::row::{DetailRow, IntervalStatsRow};

use self::clickhouse::ClickHouseSink;
use self::csv::CsvSink;
use self::stdout::StdoutSink;

/// ResultSink records per-hash detail rows and per-interval stats rows.
///
/// Uses enum dispatch rather than trait objects so `flush` can stay a plain
/// `async fn`. Rows are buffered until `flush`, which is safe to call with
/// nothing pending.
pub enum ResultSink {
    Csv(CsvSink),
    ClickHouse(ClickHouseSink),
    Stdout(StdoutSink),
}

impl ResultSink {
    /// Builds the configured sink, or `None` for `sink.kind: none`.
    pub async fn from_config(
        cfg: &Config,
        kind: StreamKind,
        cancel: CancellationToken,
        health: Option<Arc<HealthMetrics>>,
    ) -> Result<Option<Self>> {
        let sink = match cfg.sink.kind {
            SinkKind::None => return Ok(None),
            SinkKind::Csv => Self::Csv(CsvSink::create(cfg.csv_prefix(), kind)?),
            SinkKind::Clickhouse => Self::ClickHouse(
                ClickHouseSink::connect(cfg.sink.clickhouse.clone(), kind, cancel, health).await?,
            ),
            SinkKind::Stdout => Self::Stdout(StdoutSink::new(cfg.sink.stdout.details)),
        };

        Ok(Some(sink))
    }

    /// Returns the sink's name for logging.
    pub fn name(&self) -> &str {
        match self {
            Self::Csv(s) => s.name(),
            Self::ClickHouse(s) => s.name(),
            Self::Stdout(s) => s.name(),
        }
    }

    /// Whether the runner should print the console histogram alongside.
    pub fn prints_histogram(&self) -> bool {
        !matches!(self, Self::ClickHouse(_))
    }

    pub fn record_detail_row(&mut self, row: DetailRow) -> Result<()> {
        match self {
            Self::Csv(s) => s.record_detail_row(&row),
            Self::ClickHouse(s) => {
                s.record_detail_row(row);
                Ok(())
            }
            Self::Stdout(s) => {
                s.record_detail_row(&row);
                Ok(())
            }
        }
    }

    pub fn record_stats_row(&mut self, row: IntervalStatsRow) -> Result<()> {
        match self {
            Self::Csv(s) => s.record_stats_row(&row),
            Self::ClickHouse(s) => {
                s.record_stats_row(row);
                Ok(())
            }
            Self::Stdout(s) => {
                s.record_stats_row(&row);
                Ok(())
            }
        }
    }

    /// Writes everything recorded since the last flush.
    pub async fn flush(&mut self) -> Result<()> {
        match self {
            Self::Csv(s) => s.flush(),
            Self::ClickHouse(s) => s.flush().await,
            Self::Stdout(s) => s.flush(),
        }
    }

    /// Flushes and releases the sink.
    pub async fn close(&mut self) -> Result<()> {
        match self {
            Self::Csv(s) => s.flush(),
            Self::ClickHouse(s) => s.close().await,
            Self::Stdout(s) => s.flush(),
        }
    }
}
