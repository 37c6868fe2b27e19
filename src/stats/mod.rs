pub mod histogram;

use serde::Deserialize;
use thiserror::Error;

/// Errors produced while aggregating a difference list.
#[derive(Debug, Error, PartialEq)]
pub enum StatsError {
    #[error("insufficient data: no differences to aggregate")]
    InsufficientData,

    #[error("percentile {0} is outside [0, 100]")]
    InvalidPercentile(f64),

    #[error("degenerate: {got} difference(s), need at least {need}")]
    Degenerate { got: usize, need: usize },
}

/// Ranks used for the full percentile preset (1, 5, 10..95 step 5, 99).
pub const FULL_PERCENTILES: [f64; 21] = [
    1.0, 5.0, 10.0, 15.0, 20.0, 25.0, 30.0, 35.0, 40.0, 45.0, 50.0, 55.0, 60.0, 65.0, 70.0, 75.0,
    80.0, 85.0, 90.0, 95.0, 99.0,
];

/// Ranks used for the reduced percentile preset.
pub const REDUCED_PERCENTILES: [f64; 5] = [5.0, 25.0, 50.0, 75.0, 95.0];

/// Which percentiles are computed for each interval.
///
/// Written in YAML as `full`, `reduced`, or a `custom: [..]` map.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "PercentileSetRepr")]
pub enum PercentileSet {
    Full,
    Reduced,
    Custom(Vec<f64>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PercentileSetRepr {
    Preset(Preset),
    Custom { custom: Vec<f64> },
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum Preset {
    Full,
    Reduced,
}

impl From<PercentileSetRepr> for PercentileSet {
    fn from(repr: PercentileSetRepr) -> Self {
        match repr {
            PercentileSetRepr::Preset(Preset::Full) => Self::Full,
            PercentileSetRepr::Preset(Preset::Reduced) => Self::Reduced,
            PercentileSetRepr::Custom { custom } => Self::Custom(custom),
        }
    }
}

impl Default for PercentileSet {
    fn default() -> Self {
        Self::Full
    }
}

impl PercentileSet {
    /// Returns the ranks in ascending order.
    pub fn ranks(&self) -> Vec<f64> {
        match self {
            Self::Full => FULL_PERCENTILES.to_vec(),
            Self::Reduced => REDUCED_PERCENTILES.to_vec(),
            Self::Custom(ranks) => {
                let mut ranks = ranks.clone();
                ranks.sort_by(f64::total_cmp);
                ranks.dedup();
                ranks
            }
        }
    }

    /// Checks every rank lies within [0, 100].
    pub fn validate(&self) -> Result<(), StatsError> {
        if let Self::Custom(ranks) = self {
            if let Some(bad) = ranks.iter().find(|p| !(0.0..=100.0).contains(*p)) {
                return Err(StatsError::InvalidPercentile(*bad));
            }
        }
        Ok(())
    }
}

/// One computed percentile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Percentile {
    pub rank: f64,
    pub value: f64,
}

/// Distribution summary of one interval's differences (milliseconds).
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub percentiles: Vec<Percentile>,
    /// Fraction of differences where the primary was strictly faster.
    pub win_ratio: f64,
}

impl Summary {
    /// Returns the value computed for `rank`, if it was requested.
    pub fn percentile(&self, rank: f64) -> Option<f64> {
        self.percentiles
            .iter()
            .find(|p| p.rank == rank)
            .map(|p| p.value)
    }
}

/// Aggregates a non-empty difference list.
pub fn summarize(differences: &[f64], set: &PercentileSet) -> Result<Summary, StatsError> {
    if differences.is_empty() {
        return Err(StatsError::InsufficientData);
    }
    set.validate()?;

    let sorted = sorted_copy(differences);

    let percentiles = set
        .ranks()
        .into_iter()
        .map(|rank| Percentile {
            rank,
            value: interpolate(&sorted, rank),
        })
        .collect();

    Ok(Summary {
        count: differences.len(),
        mean: mean(differences)?,
        median: median_sorted(&sorted),
        std_dev: std_dev(differences)?,
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        percentiles,
        win_ratio: win_ratio(differences)?,
    })
}

pub fn mean(data: &[f64]) -> Result<f64, StatsError> {
    if data.is_empty() {
        return Err(StatsError::InsufficientData);
    }
    Ok(data.iter().sum::<f64>() / data.len() as f64)
}

/// Population standard deviation (divides by N).
pub fn std_dev(data: &[f64]) -> Result<f64, StatsError> {
    let m = mean(data)?;
    let variance = data.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / data.len() as f64;
    Ok(variance.sqrt())
}

pub fn min(data: &[f64]) -> Result<f64, StatsError> {
    data.iter()
        .copied()
        .min_by(f64::total_cmp)
        .ok_or(StatsError::InsufficientData)
}

pub fn max(data: &[f64]) -> Result<f64, StatsError> {
    data.iter()
        .copied()
        .max_by(f64::total_cmp)
        .ok_or(StatsError::InsufficientData)
}

/// Middle value, or the mean of the two middle values for even lengths.
pub fn median(data: &[f64]) -> Result<f64, StatsError> {
    if data.is_empty() {
        return Err(StatsError::InsufficientData);
    }
    Ok(median_sorted(&sorted_copy(data)))
}

/// Linear-interpolation percentile.
///
/// The rank is `p / 100 * (n - 1)` over the sorted data and the result
/// interpolates between the two closest order statistics. For
/// `[10, 20, 30, 40]` this gives p25 = 17.5 and p50 = 25.
pub fn percentile(data: &[f64], p: f64) -> Result<f64, StatsError> {
    if data.is_empty() {
        return Err(StatsError::InsufficientData);
    }
    if !(0.0..=100.0).contains(&p) {
        return Err(StatsError::InvalidPercentile(p));
    }
    Ok(interpolate(&sorted_copy(data), p))
}

/// Fraction of strictly positive differences. Zero is not a win.
pub fn win_ratio(data: &[f64]) -> Result<f64, StatsError> {
    if data.is_empty() {
        return Err(StatsError::InsufficientData);
    }
    let wins = data.iter().filter(|d| **d > 0.0).count();
    Ok(wins as f64 / data.len() as f64)
}

fn sorted_copy(data: &[f64]) -> Vec<f64> {
    let mut sorted = data.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted
}

fn median_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

// Caller guarantees `sorted` is non-empty and p is within [0, 100].
fn interpolate(sorted: &[f64], p: f64) -> f64 {
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }
    let weight = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}
