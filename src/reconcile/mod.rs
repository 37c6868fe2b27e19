//! Interval reconciliation of two observation streams.
//!
//! One reconciler loop owns the interval maps. It multiplexes the primary,
//! secondary, and optional ground-truth channels with a deadline timer and
//! never drains after the deadline: unread items stay buffered for the next
//! interval.

pub mod window;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::export::health::HealthMetrics;
use crate::observation::{ConfirmationBatch, Observation};

pub use window::{
    ClassCounts, Classification, ClassifiedHash, DuplicateCounts, IntervalMaps, IntervalOutcome,
    Recorded, Side,
};

/// Receiving ends of the source channels. They outlive individual intervals.
pub struct Streams {
    pub primary: mpsc::Receiver<Observation>,
    pub secondary: mpsc::Receiver<Observation>,
    pub confirmations: Option<mpsc::Receiver<ConfirmationBatch>>,
}

/// Buffered item counts per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelDepths {
    pub primary: usize,
    pub secondary: usize,
    pub confirmations: Option<usize>,
}

impl Streams {
    pub fn depths(&self) -> ChannelDepths {
        ChannelDepths {
            primary: self.primary.len(),
            secondary: self.secondary.len(),
            confirmations: self.confirmations.as_ref().map(|rx| rx.len()),
        }
    }
}

/// How an interval may end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalBounds {
    pub duration: Duration,
    /// Also close once the primary map holds this many unique hashes.
    pub max_primary: Option<usize>,
}

/// Why the collection loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Deadline,
    CountReached,
    Cancelled,
    PrimaryClosed,
    SecondaryClosed,
    ConfirmationsClosed,
}

impl CloseReason {
    /// True when no further interval should run: the run was cancelled or a
    /// channel closed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::PrimaryClosed | Self::SecondaryClosed | Self::ConfirmationsClosed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deadline => "deadline",
            Self::CountReached => "count_reached",
            Self::Cancelled => "cancelled",
            Self::PrimaryClosed => "primary_closed",
            Self::SecondaryClosed => "secondary_closed",
            Self::ConfirmationsClosed => "confirmations_closed",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs interval windows over a pair of streams.
pub struct IntervalReconciler {
    bounds: IntervalBounds,
    cross_check: bool,
    log_missing: bool,
    primary_name: String,
    secondary_name: String,
    health: Option<Arc<HealthMetrics>>,
}

impl IntervalReconciler {
    pub fn new(
        bounds: IntervalBounds,
        cross_check: bool,
        primary_name: impl Into<String>,
        secondary_name: impl Into<String>,
    ) -> Self {
        Self {
            bounds,
            cross_check,
            log_missing: false,
            primary_name: primary_name.into(),
            secondary_name: secondary_name.into(),
            health: None,
        }
    }

    /// Log every hash that only one side observed.
    pub fn with_log_missing(mut self, log_missing: bool) -> Self {
        self.log_missing = log_missing;
        self
    }

    pub fn with_health(mut self, health: Option<Arc<HealthMetrics>>) -> Self {
        self.health = health;
        self
    }

    pub fn cross_check(&self) -> bool {
        self.cross_check
    }

    pub fn primary_name(&self) -> &str {
        &self.primary_name
    }

    pub fn secondary_name(&self) -> &str {
        &self.secondary_name
    }

    /// Collects one interval's worth of observations.
    ///
    /// Returns when the deadline fires, the count bound is reached, the token
    /// is cancelled, or any channel closes.
    pub async fn collect(
        &self,
        streams: &mut Streams,
        cancel: &CancellationToken,
    ) -> (IntervalMaps, CloseReason) {
        let mut maps = IntervalMaps::new(self.cross_check);

        let deadline = tokio::time::sleep(self.bounds.duration);
        tokio::pin!(deadline);

        let reason = loop {
            tokio::select! {
                _ = &mut deadline => break CloseReason::Deadline,
                _ = cancel.cancelled() => break CloseReason::Cancelled,
                obs = streams.primary.recv() => {
                    let Some(obs) = obs else {
                        break CloseReason::PrimaryClosed;
                    };
                    self.record(&mut maps, Side::Primary, obs);
                    if self
                        .bounds
                        .max_primary
                        .is_some_and(|max| maps.primary().len() >= max)
                    {
                        break CloseReason::CountReached;
                    }
                }
                obs = streams.secondary.recv() => {
                    let Some(obs) = obs else {
                        break CloseReason::SecondaryClosed;
                    };
                    self.record(&mut maps, Side::Secondary, obs);
                }
                batch = recv_confirmation(&mut streams.confirmations) => {
                    let Some(batch) = batch else {
                        break CloseReason::ConfirmationsClosed;
                    };
                    let number = batch.number;
                    let added = maps.confirm(batch);
                    debug!(
                        block_number = number,
                        added,
                        confirmed = maps.truth().map_or(0, |t| t.len()),
                        "recorded confirmation batch",
                    );
                }
            }
        };

        (maps, reason)
    }

    /// Classifies the collected maps, logging misses when configured.
    pub fn reconcile(&self, maps: IntervalMaps) -> IntervalOutcome {
        let outcome = maps.reconcile();

        if self.log_missing {
            for c in &outcome.classified {
                match c.class {
                    Classification::OnlyPrimary => warn!(
                        hash = %c.hash,
                        "{} saw hash but {} did not",
                        self.primary_name,
                        self.secondary_name,
                    ),
                    Classification::OnlySecondary => warn!(
                        hash = %c.hash,
                        "{} saw hash but {} did not",
                        self.secondary_name,
                        self.primary_name,
                    ),
                    Classification::Both => {}
                }
            }
        }

        outcome
    }

    /// Collects and reconciles in one step.
    pub async fn run_interval(
        &self,
        streams: &mut Streams,
        cancel: &CancellationToken,
    ) -> (IntervalOutcome, CloseReason) {
        let (maps, reason) = self.collect(streams, cancel).await;
        (self.reconcile(maps), reason)
    }

    fn record(&self, maps: &mut IntervalMaps, side: Side, obs: Observation) {
        let hash = obs.hash;
        if maps.record(side, obs) == Recorded::Duplicate {
            let source = match side {
                Side::Primary => self.primary_name.as_str(),
                Side::Secondary => self.secondary_name.as_str(),
            };
            warn!(hash = %hash, source, "duplicate hash during interval");
            if let Some(health) = &self.health {
                health
                    .duplicate_observations
                    .with_label_values(&[source])
                    .inc();
            }
        }
    }
}

async fn recv_confirmation(
    rx: &mut Option<mpsc::Receiver<ConfirmationBatch>>,
) -> Option<ConfirmationBatch> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
