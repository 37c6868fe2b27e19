use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use fiber_bench::benchmark::Runner;
use fiber_bench::config::Config;
use fiber_bench::observation::{ConfirmationBatch, Hash, Observation, StreamKind};
use fiber_bench::reconcile::{
    Classification, CloseReason, IntervalBounds, IntervalMaps, IntervalReconciler, Side, Streams,
};
use fiber_bench::sink::csv::CsvSink;
use fiber_bench::sink::ResultSink;
use fiber_bench::stats::{self, PercentileSet};

fn h(n: u64) -> Hash {
    Hash::from_low_u64(n)
}

fn obs(n: u64, ts: i64) -> Observation {
    Observation::new(h(n), ts)
}

struct Channels {
    primary: mpsc::Sender<Observation>,
    secondary: mpsc::Sender<Observation>,
    confirmations: mpsc::Sender<ConfirmationBatch>,
    streams: Streams,
}

fn channels(cross_check: bool) -> Channels {
    let (primary, primary_rx) = mpsc::channel(256);
    let (secondary, secondary_rx) = mpsc::channel(256);
    let (confirmations, confirmations_rx) = mpsc::channel(16);
    Channels {
        primary,
        secondary,
        confirmations,
        streams: Streams {
            primary: primary_rx,
            secondary: secondary_rx,
            confirmations: cross_check.then_some(confirmations_rx),
        },
    }
}

fn bench_config(intervals: usize, cross_check: bool) -> Config {
    let mut cfg = Config::default();
    cfg.benchmark.interval = Duration::from_secs(10);
    cfg.benchmark.interval_count = intervals;
    cfg.benchmark.cross_check = cross_check;
    cfg.benchmark.benchmark_id = "scenario".to_string();
    cfg
}

#[test]
fn test_arrival_order_does_not_change_the_outcome() {
    let events: Vec<(Side, Observation)> = (0..50u64)
        .flat_map(|n| {
            let mut side_events = vec![(Side::Primary, obs(n, 1_000 * n as i64))];
            if n % 3 != 0 {
                side_events.push((Side::Secondary, obs(n, 1_000 * n as i64 + 250)));
            }
            side_events
        })
        .collect();

    let mut forward = IntervalMaps::new(false);
    for (side, o) in events.iter().cloned() {
        forward.record(side, o);
    }
    let mut backward = IntervalMaps::new(false);
    for (side, o) in events.iter().rev().cloned() {
        backward.record(side, o);
    }

    let a = forward.reconcile();
    let b = backward.reconcile();
    assert_eq!(a.counts, b.counts);
    assert_eq!(a.differences, b.differences);
    assert_eq!(a.counts.both, 33);
    assert_eq!(a.counts.only_primary, 17);
    assert!(a.differences.iter().all(|d| *d == 0.25));
}

#[test]
fn test_first_sighting_wins_within_an_interval() {
    let mut maps = IntervalMaps::new(false);
    maps.record(Side::Primary, obs(1, 100));
    maps.record(Side::Primary, obs(1, 50));
    maps.record(Side::Secondary, obs(1, 400));
    maps.record(Side::Secondary, obs(1, 900));

    let out = maps.reconcile();
    assert_eq!(out.differences, vec![0.3]);
    assert_eq!(out.duplicates.primary, 1);
    assert_eq!(out.duplicates.secondary, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cross_check_universe_is_ground_truth() {
    let mut ch = channels(true);
    let reconciler = IntervalReconciler::new(
        IntervalBounds {
            duration: Duration::from_secs(5),
            max_primary: None,
        },
        true,
        "fiber",
        "bloxroute",
    );

    // 1 confirmed and seen by both; 2 confirmed, primary only; 3 confirmed,
    // secondary only; 4 confirmed, nobody; 5 seen by both, never confirmed.
    ch.primary.send(obs(1, 1_000)).await.unwrap();
    ch.primary.send(obs(2, 1_000)).await.unwrap();
    ch.primary.send(obs(5, 1_000)).await.unwrap();
    ch.secondary.send(obs(1, 3_000)).await.unwrap();
    ch.secondary.send(obs(3, 3_000)).await.unwrap();
    ch.secondary.send(obs(5, 3_000)).await.unwrap();
    ch.confirmations
        .send(ConfirmationBatch {
            number: 1,
            hashes: vec![h(1), h(2)],
        })
        .await
        .unwrap();
    ch.confirmations
        .send(ConfirmationBatch {
            number: 2,
            hashes: vec![h(3), h(4), h(1)],
        })
        .await
        .unwrap();

    let (out, reason) = reconciler
        .run_interval(&mut ch.streams, &CancellationToken::new())
        .await;

    assert_eq!(reason, CloseReason::Deadline);
    assert_eq!(out.confirmed, Some(4));
    assert_eq!(out.confirmation_batches, 2);
    assert_eq!(out.counts.both, 1);
    assert_eq!(out.counts.only_primary, 1);
    assert_eq!(out.counts.only_secondary, 1);
    assert_eq!(out.counts.unobserved, 1);
    assert_eq!(out.counts.excluded_primary, 1);
    assert_eq!(out.counts.excluded_secondary, 1);
    assert_eq!(out.differences, vec![2.0]);

    let classes: Vec<(Hash, Classification)> =
        out.classified.iter().map(|c| (c.hash, c.class)).collect();
    assert_eq!(
        classes,
        vec![
            (h(1), Classification::Both),
            (h(2), Classification::OnlyPrimary),
            (h(3), Classification::OnlySecondary),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_count_bound_closes_interval_early() {
    let mut ch = channels(false);
    let reconciler = IntervalReconciler::new(
        IntervalBounds {
            duration: Duration::from_secs(3600),
            max_primary: Some(3),
        },
        false,
        "fiber",
        "bloxroute",
    );

    for n in 0..5 {
        ch.primary.send(obs(n, 0)).await.unwrap();
    }

    let (out, reason) = reconciler
        .run_interval(&mut ch.streams, &CancellationToken::new())
        .await;
    assert_eq!(reason, CloseReason::CountReached);
    assert_eq!(out.primary_total, 3);

    // The remaining observations belong to the next interval.
    let (out, _) = reconciler
        .run_interval(&mut ch.streams, &CancellationToken::new())
        .await;
    assert_eq!(out.primary_total, 2);
}

#[tokio::test(start_paused = true)]
async fn test_runner_writes_cross_checked_rows_to_csv() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("cross");
    let prefix = prefix.to_str().unwrap();

    let mut ch = channels(true);
    ch.primary.send(obs(1, 10_000)).await.unwrap();
    ch.primary.send(obs(2, 10_000)).await.unwrap();
    ch.primary.send(obs(3, 20_000)).await.unwrap();
    ch.secondary.send(obs(1, 12_500)).await.unwrap();
    ch.secondary.send(obs(3, 22_500)).await.unwrap();
    ch.secondary.send(obs(9, 12_500)).await.unwrap();
    ch.confirmations
        .send(ConfirmationBatch {
            number: 100,
            hashes: vec![h(1), h(2), h(3)],
        })
        .await
        .unwrap();

    let sink = CsvSink::create(prefix, StreamKind::Transactions).unwrap();
    let mut runner = Runner::new(
        bench_config(2, true),
        StreamKind::Transactions,
        CancellationToken::new(),
        None,
    )
    .with_sink(ResultSink::Csv(sink));
    let reconciler = runner.reconciler("fiber", "bloxroute");

    let summary = runner.run_intervals(&reconciler, &mut ch.streams).await;

    assert_eq!(summary.intervals_completed, 1);
    assert_eq!(summary.intervals_skipped, 1);
    assert_eq!(summary.counts.both, 2);
    assert_eq!(summary.counts.only_primary, 1);
    assert_eq!(summary.counts.excluded_secondary, 1);

    let observations = std::fs::read_to_string(format!("{prefix}.observations.csv")).unwrap();
    let lines: Vec<&str> = observations.lines().skip(1).collect();
    assert_eq!(
        lines,
        vec![
            format!("{},10000,12500,2500,,,0", h(1)),
            format!("{},10000,0,0,,,0", h(2)),
            format!("{},20000,22500,2500,,,0", h(3)),
        ]
    );

    let stats = std::fs::read_to_string(format!("{prefix}.stats.csv")).unwrap();
    assert_eq!(stats, "mean,p50,min,max\n2.5,2.5,2.5,2.5\n");
}

#[test]
fn test_summary_of_known_distribution() {
    let differences: Vec<f64> = (1..=100).map(|n| n as f64 - 20.0).collect();
    let summary = stats::summarize(&differences, &PercentileSet::Full).unwrap();

    assert_eq!(summary.count, 100);
    assert_eq!(summary.mean, 30.5);
    assert_eq!(summary.median, 30.5);
    assert_eq!(summary.min, -19.0);
    assert_eq!(summary.max, 80.0);
    assert_eq!(summary.win_ratio, 0.8);
    assert_eq!(summary.percentiles.len(), 21);
    assert!((summary.percentile(50.0).unwrap() - 30.5).abs() < 1e-9);
    assert!((summary.percentile(99.0).unwrap() - 79.01).abs() < 1e-9);
    assert!((summary.std_dev - 28.866_070_047_722_12).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_confirmed_miss_is_not_an_outlier() {
    let mut ch = channels(true);
    let reconciler = IntervalReconciler::new(
        IntervalBounds {
            duration: Duration::from_secs(1),
            max_primary: None,
        },
        true,
        "fiber",
        "bloxroute",
    );

    ch.primary.send(obs(1, 1_000)).await.unwrap();
    ch.secondary.send(obs(1, 1_500)).await.unwrap();
    ch.primary.send(obs(2, 2_000)).await.unwrap();
    ch.confirmations
        .send(ConfirmationBatch {
            number: 7,
            hashes: vec![h(1), h(2)],
        })
        .await
        .unwrap();

    let (out, _) = reconciler
        .run_interval(&mut ch.streams, &CancellationToken::new())
        .await;

    assert_eq!(out.differences, vec![0.5]);
    assert_eq!(out.counts.only_primary, 1);

    let summary = stats::summarize(&out.differences, &PercentileSet::Reduced).unwrap();
    assert_eq!(summary.win_ratio, 1.0);
    assert_eq!(summary.max, 0.5);
}
