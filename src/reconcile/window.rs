use std::collections::{HashMap, HashSet};
use std::ops::AddAssign;

use crate::observation::{ConfirmationBatch, Hash, Observation};
use crate::row::DetailRow;

/// Which observation stream an item arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Primary,
    Secondary,
}

/// Result of offering an observation to the interval maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    Inserted,
    Duplicate,
}

/// Duplicate arrivals discarded during one interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DuplicateCounts {
    pub primary: usize,
    pub secondary: usize,
}

/// Outcome class of one hash in the comparison universe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Both,
    OnlyPrimary,
    OnlySecondary,
}

/// Per-class counts plus hashes that fell outside the universe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassCounts {
    pub both: usize,
    pub only_primary: usize,
    pub only_secondary: usize,
    /// Confirmed hashes neither source observed.
    pub unobserved: usize,
    /// Primary observations outside the comparison universe.
    pub excluded_primary: usize,
    /// Secondary observations outside the comparison universe.
    pub excluded_secondary: usize,
}

impl AddAssign for ClassCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.both += rhs.both;
        self.only_primary += rhs.only_primary;
        self.only_secondary += rhs.only_secondary;
        self.unobserved += rhs.unobserved;
        self.excluded_primary += rhs.excluded_primary;
        self.excluded_secondary += rhs.excluded_secondary;
    }
}

/// A hash of the comparison universe with whatever each side observed.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedHash {
    pub hash: Hash,
    pub class: Classification,
    pub primary: Option<Observation>,
    pub secondary: Option<Observation>,
}

impl ClassifiedHash {
    /// `secondary - primary` in microseconds when both sides observed.
    pub fn difference_us(&self) -> Option<i64> {
        match (&self.primary, &self.secondary) {
            (Some(p), Some(s)) => Some(s.timestamp_us - p.timestamp_us),
            _ => None,
        }
    }

    /// Builds the sink row. Misses carry zeroed timestamps for the absent side
    /// and a zero difference.
    pub fn to_detail_row(&self, benchmark_id: &str) -> DetailRow {
        let meta = self
            .primary
            .as_ref()
            .or(self.secondary.as_ref())
            .map(|o| o.meta.clone())
            .unwrap_or_default();

        DetailRow {
            hash: self.hash,
            primary_ts: self.primary.as_ref().map_or(0, |o| o.timestamp_us),
            secondary_ts: self.secondary.as_ref().map_or(0, |o| o.timestamp_us),
            difference_us: self.difference_us().unwrap_or(0),
            benchmark_id: benchmark_id.to_string(),
            meta,
        }
    }
}

/// Everything one interval produced, ready for aggregation and sinks.
#[derive(Debug, Clone, Default)]
pub struct IntervalOutcome {
    /// Real differences (both-saw only), in milliseconds.
    pub differences: Vec<f64>,
    /// Every hash of the universe that at least one side observed, sorted by hash.
    pub classified: Vec<ClassifiedHash>,
    pub counts: ClassCounts,
    pub primary_total: usize,
    pub secondary_total: usize,
    pub duplicates: DuplicateCounts,
    /// Size of the ground-truth set, when cross-checking.
    pub confirmed: Option<usize>,
    pub confirmation_batches: usize,
}

/// Interval-scoped first-seen maps and ground-truth set.
///
/// Owned by a single reconciler loop; dropped or consumed by
/// [`IntervalMaps::reconcile`] when the interval closes.
#[derive(Debug, Default)]
pub struct IntervalMaps {
    primary: HashMap<Hash, Observation>,
    secondary: HashMap<Hash, Observation>,
    truth: Option<HashSet<Hash>>,
    duplicates: DuplicateCounts,
    confirmation_batches: usize,
}

impl IntervalMaps {
    /// Creates empty maps. With `cross_check` the universe is the
    /// ground-truth set, otherwise the primary's keys.
    pub fn new(cross_check: bool) -> Self {
        Self {
            truth: cross_check.then(HashSet::new),
            ..Default::default()
        }
    }

    /// Stores the observation unless its hash was already seen on that side.
    pub fn record(&mut self, side: Side, obs: Observation) -> Recorded {
        let (map, dupes) = match side {
            Side::Primary => (&mut self.primary, &mut self.duplicates.primary),
            Side::Secondary => (&mut self.secondary, &mut self.duplicates.secondary),
        };

        if map.contains_key(&obs.hash) {
            *dupes += 1;
            return Recorded::Duplicate;
        }
        map.insert(obs.hash, obs);
        Recorded::Inserted
    }

    /// Adds a confirmation batch to the ground-truth set. Returns the number
    /// of newly confirmed hashes; always 0 when not cross-checking.
    pub fn confirm(&mut self, batch: ConfirmationBatch) -> usize {
        let Some(truth) = self.truth.as_mut() else {
            return 0;
        };
        self.confirmation_batches += 1;
        let before = truth.len();
        truth.extend(batch.hashes);
        truth.len() - before
    }

    pub fn primary(&self) -> &HashMap<Hash, Observation> {
        &self.primary
    }

    pub fn secondary(&self) -> &HashMap<Hash, Observation> {
        &self.secondary
    }

    pub fn truth(&self) -> Option<&HashSet<Hash>> {
        self.truth.as_ref()
    }

    pub fn duplicates(&self) -> DuplicateCounts {
        self.duplicates
    }

    /// Classifies every hash of the comparison universe and collects the
    /// both-saw differences.
    pub fn reconcile(mut self) -> IntervalOutcome {
        let primary_total = self.primary.len();
        let secondary_total = self.secondary.len();

        let mut universe: Vec<Hash> = match &self.truth {
            Some(truth) => truth.iter().copied().collect(),
            None => self.primary.keys().copied().collect(),
        };
        universe.sort_unstable();

        let mut counts = ClassCounts::default();
        let mut classified = Vec::with_capacity(universe.len());
        let mut differences = Vec::with_capacity(universe.len());

        for hash in universe {
            let primary = self.primary.remove(&hash);
            let secondary = self.secondary.remove(&hash);

            let class = match (&primary, &secondary) {
                (Some(p), Some(s)) => {
                    differences.push((s.timestamp_us - p.timestamp_us) as f64 / 1000.0);
                    counts.both += 1;
                    Classification::Both
                }
                (Some(_), None) => {
                    counts.only_primary += 1;
                    Classification::OnlyPrimary
                }
                (None, Some(_)) => {
                    counts.only_secondary += 1;
                    Classification::OnlySecondary
                }
                (None, None) => {
                    counts.unobserved += 1;
                    continue;
                }
            };

            classified.push(ClassifiedHash {
                hash,
                class,
                primary,
                secondary,
            });
        }

        counts.excluded_primary = self.primary.len();
        counts.excluded_secondary = self.secondary.len();

        IntervalOutcome {
            differences,
            classified,
            counts,
            primary_total,
            secondary_total,
            duplicates: self.duplicates,
            confirmed: self.truth.as_ref().map(HashSet::len),
            confirmation_batches: self.confirmation_batches,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::ObservationMeta;

    fn h(n: u64) -> Hash {
        Hash::from_low_u64(n)
    }

    fn obs(n: u64, ts: i64) -> Observation {
        Observation::new(h(n), ts)
    }

    fn confirm(maps: &mut IntervalMaps, hashes: &[u64]) {
        maps.confirm(ConfirmationBatch {
            number: 1,
            hashes: hashes.iter().map(|n| h(*n)).collect(),
        });
    }

    #[test]
    fn test_first_arrival_wins() {
        let mut maps = IntervalMaps::new(false);
        assert_eq!(maps.record(Side::Primary, obs(1, 100)), Recorded::Inserted);
        assert_eq!(maps.record(Side::Primary, obs(1, 50)), Recorded::Duplicate);

        assert_eq!(maps.primary().len(), 1);
        assert_eq!(maps.primary()[&h(1)].timestamp_us, 100);
        assert_eq!(
            maps.duplicates(),
            DuplicateCounts {
                primary: 1,
                secondary: 0
            }
        );
    }

    #[test]
    fn test_same_hash_on_both_sides_is_not_a_duplicate() {
        let mut maps = IntervalMaps::new(false);
        maps.record(Side::Primary, obs(1, 100));
        assert_eq!(maps.record(Side::Secondary, obs(1, 90)), Recorded::Inserted);
        assert_eq!(maps.duplicates(), DuplicateCounts::default());
    }

    #[test]
    fn test_interleaving_order_independent() {
        let events = [
            (Side::Primary, obs(1, 10)),
            (Side::Secondary, obs(1, 15)),
            (Side::Primary, obs(2, 20)),
            (Side::Secondary, obs(3, 30)),
            (Side::Primary, obs(3, 40)),
        ];

        let mut forward = IntervalMaps::new(false);
        for (side, o) in events.iter().cloned() {
            forward.record(side, o);
        }
        let mut backward = IntervalMaps::new(false);
        for (side, o) in events.iter().rev().cloned() {
            backward.record(side, o);
        }

        assert_eq!(forward.primary(), backward.primary());
        assert_eq!(forward.secondary(), backward.secondary());
    }

    #[test]
    fn test_cross_check_both_saw() {
        let mut maps = IntervalMaps::new(true);
        maps.record(Side::Primary, obs(1, 1000));
        maps.record(Side::Secondary, obs(1, 1500));
        confirm(&mut maps, &[1]);

        let out = maps.reconcile();
        assert_eq!(out.differences, vec![0.5]);
        assert_eq!(out.counts.both, 1);
        assert_eq!(out.confirmed, Some(1));
        assert_eq!(out.classified[0].difference_us(), Some(500));
    }

    #[test]
    fn test_cross_check_only_primary_excluded_from_differences() {
        let mut maps = IntervalMaps::new(true);
        maps.record(Side::Primary, obs(2, 2000));
        confirm(&mut maps, &[2]);

        let out = maps.reconcile();
        assert!(out.differences.is_empty());
        assert_eq!(out.counts.only_primary, 1);
        assert_eq!(out.classified[0].class, Classification::OnlyPrimary);
    }

    #[test]
    fn test_cross_check_unconfirmed_excluded_but_counted() {
        let mut maps = IntervalMaps::new(true);
        maps.record(Side::Primary, obs(7, 100));
        maps.record(Side::Secondary, obs(7, 200));
        maps.record(Side::Primary, obs(8, 100));
        maps.record(Side::Secondary, obs(8, 300));
        confirm(&mut maps, &[8]);

        let out = maps.reconcile();
        assert_eq!(out.differences, vec![0.2]);
        assert_eq!(out.primary_total, 2);
        assert_eq!(out.secondary_total, 2);
        assert_eq!(out.counts.excluded_primary, 1);
        assert_eq!(out.counts.excluded_secondary, 1);
        assert_eq!(out.classified.len(), 1);
    }

    #[test]
    fn test_cross_check_only_secondary_and_unobserved() {
        let mut maps = IntervalMaps::new(true);
        maps.record(Side::Secondary, obs(3, 10));
        confirm(&mut maps, &[3, 4]);

        let out = maps.reconcile();
        assert_eq!(out.counts.only_secondary, 1);
        assert_eq!(out.counts.unobserved, 1);
        assert_eq!(out.classified.len(), 1);
    }

    #[test]
    fn test_confirm_ignored_without_cross_check() {
        let mut maps = IntervalMaps::new(false);
        assert_eq!(
            maps.confirm(ConfirmationBatch {
                number: 9,
                hashes: vec![h(1)],
            }),
            0
        );
        assert!(maps.truth().is_none());
        assert_eq!(maps.reconcile().confirmation_batches, 0);
    }

    #[test]
    fn test_confirm_counts_new_hashes_only() {
        let mut maps = IntervalMaps::new(true);
        let first = maps.confirm(ConfirmationBatch {
            number: 1,
            hashes: vec![h(1), h(2)],
        });
        let second = maps.confirm(ConfirmationBatch {
            number: 2,
            hashes: vec![h(2), h(3)],
        });
        assert_eq!((first, second), (2, 1));
        assert_eq!(maps.truth().map(HashSet::len), Some(3));
    }

    #[test]
    fn test_primary_universe_records_misses() {
        let mut maps = IntervalMaps::new(false);
        maps.record(Side::Primary, obs(1, 100));
        maps.record(Side::Secondary, obs(1, 50));
        maps.record(Side::Primary, obs(2, 100));
        maps.record(Side::Secondary, obs(9, 100));

        let out = maps.reconcile();
        assert_eq!(out.differences, vec![-0.05]);
        assert_eq!(out.counts.both, 1);
        assert_eq!(out.counts.only_primary, 1);
        assert_eq!(out.counts.only_secondary, 0);
        assert_eq!(out.counts.excluded_secondary, 1);
        assert_eq!(out.confirmed, None);
    }

    #[test]
    fn test_detail_row_for_miss_is_zeroed() {
        let meta = ObservationMeta::Transaction {
            from: "0xabc".to_string(),
            to: None,
            calldata_size: 4,
        };
        let classified = ClassifiedHash {
            hash: h(5),
            class: Classification::OnlySecondary,
            primary: None,
            secondary: Some(obs(5, 777).with_meta(meta.clone())),
        };

        let row = classified.to_detail_row("bench");
        assert_eq!(row.primary_ts, 0);
        assert_eq!(row.secondary_ts, 777);
        assert_eq!(row.difference_us, 0);
        assert_eq!(row.meta, meta);
        assert_eq!(row.benchmark_id, "bench");
    }

    #[test]
    fn test_detail_row_prefers_primary_meta() {
        let classified = ClassifiedHash {
            hash: h(6),
            class: Classification::Both,
            primary: Some(obs(6, 10).with_meta(ObservationMeta::Block { tx_count: 3 })),
            secondary: Some(obs(6, 25).with_meta(ObservationMeta::Block { tx_count: 99 })),
        };
        let row = classified.to_detail_row("b");
        assert_eq!(row.difference_us, 15);
        assert_eq!(row.meta, ObservationMeta::Block { tx_count: 3 });
    }

    #[test]
    fn test_classified_sorted_by_hash() {
        let mut maps = IntervalMaps::new(false);
        for n in [5u64, 1, 3] {
            maps.record(Side::Primary, obs(n, 0));
        }
        let hashes: Vec<Hash> = maps.reconcile().classified.iter().map(|c| c.hash).collect();
        assert_eq!(hashes, vec![h(1), h(3), h(5)]);
    }

    #[test]
    fn test_class_counts_add_assign() {
        let mut total = ClassCounts::default();
        total += ClassCounts {
            both: 2,
            only_primary: 1,
            ..Default::default()
        };
        total += ClassCounts {
            both: 1,
            unobserved: 4,
            ..Default::default()
        };
        assert_eq!(total.both, 3);
        assert_eq!(total.only_primary, 1);
        assert_eq!(total.unobserved, 4);
    }
}
