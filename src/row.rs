use std::time::SystemTime;

use crate::observation::{Hash, ObservationMeta};
use crate::stats::{Percentile, Summary};

/// Per-hash record written to the observations table or file.
#[derive(Debug, Clone, PartialEq)]
pub struct DetailRow {
    pub hash: Hash,
    /// Primary receipt time in microseconds, 0 if the primary never saw it.
    pub primary_ts: i64,
    /// Secondary receipt time in microseconds, 0 if the secondary never saw it.
    pub secondary_ts: i64,
    /// `secondary_ts - primary_ts` in microseconds, 0 for misses.
    pub difference_us: i64,
    pub benchmark_id: String,
    pub meta: ObservationMeta,
}

/// Per-interval statistics record.
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalStatsRow {
    pub start_time: SystemTime,
    pub end_time: SystemTime,
    pub sample_count: usize,
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub percentiles: Vec<Percentile>,
    pub win_ratio: f64,
    pub benchmark_id: String,
}

impl IntervalStatsRow {
    pub fn from_summary(
        summary: Summary,
        start_time: SystemTime,
        end_time: SystemTime,
        benchmark_id: &str,
    ) -> Self {
        Self {
            start_time,
            end_time,
            sample_count: summary.count,
            mean: summary.mean,
            median: summary.median,
            std_dev: summary.std_dev,
            min: summary.min,
            max: summary.max,
            percentiles: summary.percentiles,
            win_ratio: summary.win_ratio,
            benchmark_id: benchmark_id.to_string(),
        }
    }

    /// Value at the given rank, if that rank was computed.
    pub fn percentile(&self, rank: f64) -> Option<f64> {
        self.percentiles
            .iter()
            .find(|p| p.rank == rank)
            .map(|p| p.value)
    }
}
