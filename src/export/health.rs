use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "fiber_bench";

/// Prometheus metrics for benchmark health.
///
/// All metrics use the "fiber_bench" namespace. Source metrics are labelled
/// by source name, sink metrics by sink name.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Sources ===
    /// Observations forwarded by each source.
    pub observations_received: CounterVec,
    /// Hashes seen more than once in an interval, by source.
    pub duplicate_observations: CounterVec,
    /// Messages that could not be decoded, by source.
    pub decode_errors: CounterVec,
    /// Sends that found the observation channel full, by source.
    pub channel_saturated: CounterVec,
    /// Buffered items per channel, sampled at interval boundaries.
    pub channel_depth: GaugeVec,

    // === Runner ===
    /// Intervals that produced a statistics row.
    pub intervals_completed: Counter,
    /// Intervals with no matched differences.
    pub intervals_skipped: Counter,
    /// Win ratio of the most recent interval.
    pub last_win_ratio: Gauge,
    /// Mean difference in milliseconds of the most recent interval.
    pub last_mean_ms: Gauge,
    /// Runner state (0=idle, 1=connecting, 2=running, 3=flushing, 4=complete).
    pub runner_state: Gauge,

    // === Sinks ===
    /// Sink flush duration.
    pub sink_flush_duration: HistogramVec,
    /// Rows per flushed batch.
    pub sink_batch_size: HistogramVec,
    /// Failed insert attempts by sink and table.
    pub export_batch_errors: CounterVec,
    /// ClickHouse connection state per sink (1=connected, 0=disconnected).
    pub clickhouse_connected: GaugeVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Sources ===
        let observations_received = CounterVec::new(
            Opts::new(
                "observations_received_total",
                "Observations forwarded by each source.",
            )
            .namespace(NAMESPACE),
            &["source"],
        )?;
        let duplicate_observations = CounterVec::new(
            Opts::new(
                "duplicate_observations_total",
                "Hashes observed more than once within an interval.",
            )
            .namespace(NAMESPACE),
            &["source"],
        )?;
        let decode_errors = CounterVec::new(
            Opts::new(
                "decode_errors_total",
                "Source messages that could not be decoded.",
            )
            .namespace(NAMESPACE),
            &["source"],
        )?;
        let channel_saturated = CounterVec::new(
            Opts::new(
                "channel_saturated_total",
                "Sends that found the observation channel full.",
            )
            .namespace(NAMESPACE),
            &["source"],
        )?;
        let channel_depth = GaugeVec::new(
            Opts::new(
                "channel_depth",
                "Buffered items per channel at the last interval boundary.",
            )
            .namespace(NAMESPACE),
            &["channel"],
        )?;

        // === Runner ===
        let intervals_completed = Counter::with_opts(
            Opts::new(
                "intervals_completed_total",
                "Intervals that produced a statistics row.",
            )
            .namespace(NAMESPACE),
        )?;
        let intervals_skipped = Counter::with_opts(
            Opts::new(
                "intervals_skipped_total",
                "Intervals with no matched differences.",
            )
            .namespace(NAMESPACE),
        )?;
        let last_win_ratio = Gauge::with_opts(
            Opts::new(
                "last_win_ratio",
                "Share of positive differences in the most recent interval.",
            )
            .namespace(NAMESPACE),
        )?;
        let last_mean_ms = Gauge::with_opts(
            Opts::new(
                "last_mean_milliseconds",
                "Mean difference of the most recent interval.",
            )
            .namespace(NAMESPACE),
        )?;
        let runner_state = Gauge::with_opts(
            Opts::new(
                "runner_state",
                "Runner state (0=idle, 1=connecting, 2=running, 3=flushing, 4=complete).",
            )
            .namespace(NAMESPACE),
        )?;

        // === Sinks ===
        let sink_flush_duration = HistogramVec::new(
            HistogramOpts::new(
                "sink_flush_duration_seconds",
                "Time to flush one interval to a sink.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
            &["sink"],
        )?;
        let sink_batch_size = HistogramVec::new(
            HistogramOpts::new("sink_batch_size", "Rows per flushed batch.")
                .namespace(NAMESPACE)
                .buckets(vec![1.0, 10.0, 100.0, 1000.0, 10000.0, 50000.0]),
            &["sink"],
        )?;
        let export_batch_errors = CounterVec::new(
            Opts::new(
                "export_batch_errors_total",
                "Failed insert attempts by sink and table.",
            )
            .namespace(NAMESPACE),
            &["sink", "table"],
        )?;
        let clickhouse_connected = GaugeVec::new(
            Opts::new(
                "clickhouse_connected",
                "ClickHouse connection state (1=connected, 0=disconnected).",
            )
            .namespace(NAMESPACE),
            &["sink"],
        )?;

        registry.register(Box::new(observations_received.clone()))?;
        registry.register(Box::new(duplicate_observations.clone()))?;
        registry.register(Box::new(decode_errors.clone()))?;
        registry.register(Box::new(channel_saturated.clone()))?;
        registry.register(Box::new(channel_depth.clone()))?;
        registry.register(Box::new(intervals_completed.clone()))?;
        registry.register(Box::new(intervals_skipped.clone()))?;
        registry.register(Box::new(last_win_ratio.clone()))?;
        registry.register(Box::new(last_mean_ms.clone()))?;
        registry.register(Box::new(runner_state.clone()))?;
        registry.register(Box::new(sink_flush_duration.clone()))?;
        registry.register(Box::new(sink_batch_size.clone()))?;
        registry.register(Box::new(export_batch_errors.clone()))?;
        registry.register(Box::new(clickhouse_connected.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            observations_received,
            duplicate_observations,
            decode_errors,
            channel_saturated,
            channel_depth,
            intervals_completed,
            intervals_skipped,
            last_win_ratio,
            last_mean_ms,
            runner_state,
            sink_flush_duration,
            sink_batch_size,
            export_batch_errors,
            clickhouse_connected,
        })
    }

    /// Renders all registered metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_use_namespace() {
        let metrics = HealthMetrics::new(":0").unwrap();
        metrics
            .observations_received
            .with_label_values(&["fiber"])
            .inc_by(3.0);
        metrics.intervals_completed.inc();
        metrics.runner_state.set(2.0);

        let text = metrics.render().unwrap();
        assert!(text.contains("fiber_bench_observations_received_total{source=\"fiber\"} 3"));
        assert!(text.contains("fiber_bench_intervals_completed_total 1"));
        assert!(text.contains("fiber_bench_runner_state 2"));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let metrics = HealthMetrics::new("127.0.0.1:0").unwrap();
        metrics.start().await.unwrap();
        assert!(metrics.shutdown.lock().is_some());
        metrics.stop().await.unwrap();
        assert!(metrics.shutdown.lock().is_none());
    }
}
