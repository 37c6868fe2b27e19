use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};

use crate::observation::{ObservationMeta, StreamKind};
use crate::row::{DetailRow, IntervalStatsRow};

const TRANSACTION_HEADER: [&str; 7] = [
    "tx_hash",
    "fiber_timestamp",
    "other_timestamp",
    "diff",
    "from",
    "to",
    "calldata_size",
];
const BLOCK_HEADER: [&str; 5] = [
    "block_hash",
    "fiber_timestamp",
    "other_timestamp",
    "diff",
    "tx_count",
];
const STATS_HEADER: [&str; 4] = ["mean", "p50", "min", "max"];

/// Writes detail rows to `<prefix>.observations.csv` and stats rows to
/// `<prefix>.stats.csv`.
pub struct CsvSink {
    kind: StreamKind,
    observations: csv::Writer<File>,
    stats: csv::Writer<File>,
}

impl CsvSink {
    /// Creates (truncating) both files and writes their headers.
    pub fn create(prefix: &str, kind: StreamKind) -> Result<Self> {
        let observations_path = format!("{prefix}.observations.csv");
        let stats_path = format!("{prefix}.stats.csv");

        let mut observations = open(Path::new(&observations_path))?;
        let mut stats = open(Path::new(&stats_path))?;

        match kind {
            StreamKind::Transactions => observations.write_record(TRANSACTION_HEADER),
            StreamKind::Blocks => observations.write_record(BLOCK_HEADER),
        }
        .context("writing observations header")?;
        stats
            .write_record(STATS_HEADER)
            .context("writing stats header")?;

        tracing::info!(
            observations = %observations_path,
            stats = %stats_path,
            "CSV sink created"
        );

        Ok(Self {
            kind,
            observations,
            stats,
        })
    }

    pub fn name(&self) -> &str {
        "csv"
    }

    pub fn record_detail_row(&mut self, row: &DetailRow) -> Result<()> {
        let mut fields = vec![
            row.hash.to_string(),
            row.primary_ts.to_string(),
            row.secondary_ts.to_string(),
            row.difference_us.to_string(),
        ];

        match (self.kind, &row.meta) {
            (
                StreamKind::Transactions,
                ObservationMeta::Transaction {
                    from,
                    to,
                    calldata_size,
                },
            ) => fields.extend([
                from.clone(),
                to.clone().unwrap_or_default(),
                calldata_size.to_string(),
            ]),
            (StreamKind::Transactions, _) => {
                fields.extend([String::new(), String::new(), "0".to_string()])
            }
            (StreamKind::Blocks, ObservationMeta::Block { tx_count }) => {
                fields.push(tx_count.to_string())
            }
            (StreamKind::Blocks, _) => fields.push("0".to_string()),
        }

        self.observations
            .write_record(&fields)
            .context("writing observation row")
    }

    pub fn record_stats_row(&mut self, row: &IntervalStatsRow) -> Result<()> {
        let p50 = row.percentile(50.0).unwrap_or(row.median);
        self.stats
            .write_record([row.mean, p50, row.min, row.max].map(|v| v.to_string()))
            .context("writing stats row")
    }

    /// Flushes both writers.
    pub fn flush(&mut self) -> Result<()> {
        self.observations
            .flush()
            .context("flushing observations file")?;
        self.stats.flush().context("flushing stats file")?;
        Ok(())
    }
}

fn open(path: &Path) -> Result<csv::Writer<File>> {
    csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))
}
