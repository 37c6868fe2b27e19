//! Observation and ground-truth stream sources.
//!
//! Each connection gets its own reader task that timestamps frames on
//! receipt and forwards normalized observations into a bounded channel. The
//! channel closes once every reader feeding it has stopped.

pub mod bloxroute;
pub mod fiber;
pub mod ws;

use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::observation::{Observation, StreamKind};
use crate::reconcile::Streams;

use self::bloxroute::BloxrouteSource;
use self::fiber::FiberSource;

/// A feed that can be subscribed to for transactions or blocks.
#[derive(Debug, Clone)]
pub enum Source {
    Fiber(FiberSource),
    Bloxroute(BloxrouteSource),
}

impl Source {
    pub fn name(&self) -> &str {
        match self {
            Self::Fiber(s) => s.name(),
            Self::Bloxroute(s) => s.name(),
        }
    }

    /// Subscribes to the stream for `kind` and spawns its reader tasks.
    pub async fn subscribe(
        &self,
        kind: StreamKind,
        tx: mpsc::Sender<Observation>,
        cancel: CancellationToken,
        health: Option<Arc<HealthMetrics>>,
    ) -> Result<Vec<JoinHandle<()>>> {
        match (self, kind) {
            (Self::Fiber(s), StreamKind::Transactions) => s.transactions(tx, cancel, health).await,
            (Self::Fiber(s), StreamKind::Blocks) => s.blocks(tx, cancel, health).await,
            (Self::Bloxroute(s), StreamKind::Transactions) => {
                Ok(vec![s.transactions(tx, cancel, health).await?])
            }
            (Self::Bloxroute(s), StreamKind::Blocks) => {
                Ok(vec![s.blocks(tx, cancel, health).await?])
            }
        }
    }
}

/// The two compared feeds of a run.
#[derive(Debug, Clone)]
pub struct SourcePair {
    pub primary: Source,
    pub secondary: Source,
}

/// Open channels plus the reader tasks feeding them.
pub struct OpenStreams {
    pub streams: Streams,
    pub readers: Vec<JoinHandle<()>>,
}

impl SourcePair {
    /// Fiber against bloXroute, or in fiber-only mode the first Fiber
    /// endpoint against the second.
    pub fn from_config(cfg: &Config) -> Self {
        let timeout = cfg.sources.connect_timeout;

        if cfg.fiber_only {
            let endpoint = |i: usize| -> Vec<String> {
                cfg.fiber.endpoints.get(i).cloned().into_iter().collect()
            };
            return Self {
                primary: Source::Fiber(FiberSource::new(
                    "fiber",
                    endpoint(0),
                    cfg.fiber.api_key.clone(),
                    timeout,
                )),
                secondary: Source::Fiber(FiberSource::new(
                    "fiber-2",
                    endpoint(1),
                    cfg.fiber.api_key.clone(),
                    timeout,
                )),
            };
        }

        Self {
            primary: Source::Fiber(FiberSource::new(
                "fiber",
                cfg.fiber.endpoints.clone(),
                cfg.fiber.api_key.clone(),
                timeout,
            )),
            secondary: Source::Bloxroute(BloxrouteSource::new(
                "bloxroute",
                cfg.bloxroute.endpoint.clone(),
                cfg.bloxroute.api_key.clone(),
                timeout,
            )),
        }
    }

    /// Subscribes both feeds (and ground truth when cross-checking). Any
    /// subscription failure is returned and the run should abort.
    pub async fn open(
        &self,
        kind: StreamKind,
        cfg: &Config,
        cancel: CancellationToken,
        health: Option<Arc<HealthMetrics>>,
    ) -> Result<OpenStreams> {
        let capacity = match kind {
            StreamKind::Transactions => cfg.sources.channel_capacity,
            StreamKind::Blocks => cfg.sources.block_channel_capacity,
        };

        let (primary_tx, primary_rx) = mpsc::channel(capacity);
        let (secondary_tx, secondary_rx) = mpsc::channel(capacity);

        let mut readers = self
            .primary
            .subscribe(kind, primary_tx, cancel.clone(), health.clone())
            .await?;
        readers.extend(
            self.secondary
                .subscribe(kind, secondary_tx, cancel.clone(), health.clone())
                .await?,
        );

        let confirmations = if cfg.benchmark.cross_check {
            let Source::Fiber(fiber) = &self.primary else {
                bail!("ground truth requires a Fiber primary");
            };
            let (tx, rx) = mpsc::channel(cfg.sources.block_channel_capacity);
            readers.extend(fiber.confirmations(tx, cancel, health).await?);
            Some(rx)
        } else {
            None
        };

        tracing::info!(
            primary = self.primary.name(),
            secondary = self.secondary.name(),
            stream = %kind,
            cross_check = confirmations.is_some(),
            readers = readers.len(),
            "sources connected"
        );

        Ok(OpenStreams {
            streams: Streams {
                primary: primary_rx,
                secondary: secondary_rx,
                confirmations,
            },
            readers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BloxrouteConfig, FiberConfig};

    fn config() -> Config {
        Config {
            fiber: FiberConfig {
                endpoints: vec!["ws://a:1".to_string(), "ws://b:2".to_string()],
                api_key: "k".to_string(),
            },
            bloxroute: BloxrouteConfig {
                endpoint: "wss://blxr".to_string(),
                api_key: "b".to_string(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_fiber_against_bloxroute() {
        let pair = SourcePair::from_config(&config());
        assert_eq!(pair.primary.name(), "fiber");
        assert_eq!(pair.secondary.name(), "bloxroute");
        match &pair.primary {
            Source::Fiber(f) => assert_eq!(f.endpoints().len(), 2),
            other => panic!("unexpected primary {other:?}"),
        }
    }

    #[test]
    fn test_fiber_only_splits_endpoints() {
        let mut cfg = config();
        cfg.fiber_only = true;
        let pair = SourcePair::from_config(&cfg);
        assert_eq!(pair.primary.name(), "fiber");
        assert_eq!(pair.secondary.name(), "fiber-2");
        match (&pair.primary, &pair.secondary) {
            (Source::Fiber(a), Source::Fiber(b)) => {
                assert_eq!(a.endpoints(), ["ws://a:1".to_string()]);
                assert_eq!(b.endpoints(), ["ws://b:2".to_string()]);
            }
            other => panic!("unexpected sources {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_open_fails_when_unreachable() {
        let mut cfg = config();
        cfg.fiber.endpoints = vec!["ws://127.0.0.1:1".to_string()];
        cfg.sources.connect_timeout = std::time::Duration::from_millis(200);

        let pair = SourcePair::from_config(&cfg);
        let result = pair
            .open(StreamKind::Transactions, &cfg, CancellationToken::new(), None)
            .await;
        let err = result.err().unwrap();
        assert!(format!("{err:#}").contains("fiber"));
    }
}
