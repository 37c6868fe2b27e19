use std::fmt::Write as _;
use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::observation::ObservationMeta;
use crate::row::{DetailRow, IntervalStatsRow};

/// Prints stats rows as readable blocks, and detail rows when enabled.
pub struct StdoutSink {
    details: bool,
    pending: String,
}

impl StdoutSink {
    pub fn new(details: bool) -> Self {
        Self {
            details,
            pending: String::new(),
        }
    }

    pub fn name(&self) -> &str {
        "stdout"
    }

    pub fn record_detail_row(&mut self, row: &DetailRow) {
        if self.details {
            self.pending.push_str(&format_detail(row));
            self.pending.push('\n');
        }
    }

    pub fn record_stats_row(&mut self, row: &IntervalStatsRow) {
        self.pending.push_str(&format_stats(row));
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let mut out = std::io::stdout().lock();
        out.write_all(self.pending.as_bytes())
            .context("writing to stdout")?;
        out.flush().context("flushing stdout")?;
        self.pending.clear();

        Ok(())
    }
}

fn format_detail(row: &DetailRow) -> String {
    let mut line = format!(
        "{} primary={} secondary={} diff_us={}",
        row.hash, row.primary_ts, row.secondary_ts, row.difference_us
    );

    match &row.meta {
        ObservationMeta::Transaction {
            from,
            to,
            calldata_size,
        } => {
            let _ = write!(
                line,
                " from={from} to={} calldata={calldata_size}",
                to.as_deref().unwrap_or("-")
            );
        }
        ObservationMeta::Block { tx_count } => {
            let _ = write!(line, " txs={tx_count}");
        }
        ObservationMeta::None => {}
    }

    line
}

fn format_stats(row: &IntervalStatsRow) -> String {
    let start: DateTime<Utc> = row.start_time.into();
    let end: DateTime<Utc> = row.end_time.into();

    let mut out = String::with_capacity(512);
    let _ = writeln!(
        out,
        "interval {} -> {} ({})",
        start.format("%H:%M:%S%.3f"),
        end.format("%H:%M:%S%.3f"),
        row.benchmark_id
    );
    let _ = writeln!(out, "  samples:   {}", row.sample_count);
    let _ = writeln!(out, "  mean:      {:.3}ms", row.mean);
    let _ = writeln!(out, "  median:    {:.3}ms", row.median);
    let _ = writeln!(out, "  std dev:   {:.3}ms", row.std_dev);
    let _ = writeln!(out, "  min / max: {:.3}ms / {:.3}ms", row.min, row.max);
    let _ = writeln!(out, "  fiber won: {:.2}%", row.win_ratio * 100.0);
    for p in &row.percentiles {
        let _ = writeln!(out, "  p{:<8} {:.3}ms", p.rank, p.value);
    }

    out
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;
    use crate::observation::Hash;
    use crate::stats::Percentile;

    fn detail() -> DetailRow {
        DetailRow {
            hash: Hash::from_low_u64(3),
            primary_ts: 100,
            secondary_ts: 400,
            difference_us: 300,
            benchmark_id: "b".to_string(),
            meta: ObservationMeta::Block { tx_count: 12 },
        }
    }

    #[test]
    fn test_details_buffered_only_when_enabled() {
        let mut quiet = StdoutSink::new(false);
        quiet.record_detail_row(&detail());
        assert!(quiet.pending.is_empty());

        let mut verbose = StdoutSink::new(true);
        verbose.record_detail_row(&detail());
        assert!(verbose.pending.ends_with("diff_us=300 txs=12\n"));
    }

    #[test]
    fn test_format_stats() {
        let row = IntervalStatsRow {
            start_time: UNIX_EPOCH,
            end_time: UNIX_EPOCH + Duration::from_secs(12),
            sample_count: 4,
            mean: 25.0,
            median: 25.0,
            std_dev: 11.180,
            min: 10.0,
            max: 40.0,
            percentiles: vec![Percentile {
                rank: 25.0,
                value: 17.5,
            }],
            win_ratio: 0.75,
            benchmark_id: "run".to_string(),
        };

        let text = format_stats(&row);
        assert!(text.starts_with("interval 00:00:00.000 -> 00:00:12.000 (run)\n"));
        assert!(text.contains("  mean:      25.000ms\n"));
        assert!(text.contains("  fiber won: 75.00%\n"));
        assert!(text.contains("  p25       17.500ms\n"));
    }

    #[test]
    fn test_flush_empty_is_noop() {
        let mut sink = StdoutSink::new(false);
        sink.flush().unwrap();
        sink.flush().unwrap();
    }
}
