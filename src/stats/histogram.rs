use std::fmt::Write;

/// Number of histogram bins, including the two open-ended ones.
pub const NUM_BINS: usize = 22;

/// Width of each closed bin in milliseconds.
const BIN_SIZE: f64 = 1.0;
const MIN_VALUE: f64 = -10.0;
const MAX_VALUE: f64 = 10.0;

/// Renders a console histogram of differences in milliseconds.
///
/// Bin 0 collects everything below -10ms and the last bin everything above
/// 10ms. Returns an empty string for empty input.
pub fn render(differences: &[f64]) -> String {
    if differences.is_empty() {
        return String::new();
    }

    let counts = bin_counts(differences);
    let total = differences.len() as f64;

    let mut out = String::with_capacity(NUM_BINS * 48);
    for (i, count) in counts.iter().enumerate() {
        let pct = *count as f64 / total * 100.0;
        let _ = writeln!(
            out,
            "{:>3} <-> {:>3}  {:6.2}%  {:>4} {}",
            bin_start(i),
            bin_end(i),
            pct,
            count,
            bar(pct as usize),
        );
    }

    out
}

/// Counts differences per bin.
pub fn bin_counts(differences: &[f64]) -> [usize; NUM_BINS] {
    let mut counts = [0usize; NUM_BINS];
    for value in differences {
        if let Some(slot) = counts.get_mut(bin_index(*value)) {
            *slot += 1;
        }
    }
    counts
}

/// Returns the bin for a value. Values in (k-1, k] land in bin k+10.
fn bin_index(value: f64) -> usize {
    if value < MIN_VALUE {
        return 0;
    }
    if value > MAX_VALUE {
        return NUM_BINS - 1;
    }
    ((value + MAX_VALUE).ceil() / BIN_SIZE) as usize
}

fn bin_start(i: usize) -> String {
    if i == 0 {
        return "-∞".to_string();
    }
    format!("{}", MIN_VALUE as i64 + (i as i64 - 1) * BIN_SIZE as i64)
}

fn bin_end(i: usize) -> String {
    if i == 0 {
        return format!("{}", MIN_VALUE as i64);
    }
    if i == NUM_BINS - 1 {
        return "+∞".to_string();
    }
    format!("{}", MIN_VALUE as i64 + i as i64 * BIN_SIZE as i64)
}

/// One full block per two percent, a thin block for an odd remainder.
fn bar(pct: usize) -> String {
    let mut bar = "█".repeat(pct / 2);
    if pct % 2 > 0 {
        bar.push('▏');
    }
    bar
}
