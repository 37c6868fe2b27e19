use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::Deserialize;

use crate::observation::StreamKind;
use crate::stats::PercentileSet;

/// Top-level configuration for a benchmark run.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Primary relay (Fiber) connection configuration.
    #[serde(default)]
    pub fiber: FiberConfig,

    /// Broadcast network (bloXroute) connection configuration.
    #[serde(default)]
    pub bloxroute: BloxrouteConfig,

    /// Compare the first two Fiber endpoints against each other instead of
    /// Fiber against bloXroute.
    #[serde(default)]
    pub fiber_only: bool,

    /// Interval and aggregation settings.
    #[serde(default)]
    pub benchmark: BenchmarkConfig,

    /// Source transport settings shared by all sources.
    #[serde(default)]
    pub sources: SourcesConfig,

    /// Result sink selection and settings.
    #[serde(default)]
    pub sink: SinkConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Primary relay connection configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FiberConfig {
    /// WebSocket endpoints. More than one endpoint is multiplexed into a
    /// single stream.
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// API key sent as `x-api-key`.
    #[serde(default)]
    pub api_key: String,
}

/// Broadcast network connection configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BloxrouteConfig {
    /// WebSocket endpoint (e.g. "wss://api.blxrbdn.com/ws").
    #[serde(default)]
    pub endpoint: String,

    /// Authorization header value.
    #[serde(default)]
    pub api_key: String,
}

/// Interval and aggregation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BenchmarkConfig {
    /// Length of one measurement interval. Default: 1m.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Number of intervals to run. Default: 10.
    #[serde(default = "default_interval_count")]
    pub interval_count: usize,

    /// Close an interval early once the primary has seen this many unique
    /// hashes.
    #[serde(default)]
    pub max_primary_observations: Option<usize>,

    /// Restrict the comparison to hashes confirmed by execution payloads.
    #[serde(default)]
    pub cross_check: bool,

    /// Log every hash only one side observed.
    #[serde(default)]
    pub log_missing: bool,

    /// Tag attached to every exported row. Generated when empty.
    #[serde(default)]
    pub benchmark_id: String,

    /// Percentiles computed per interval. Default: full.
    #[serde(default)]
    pub percentiles: PercentileSet,
}

/// Source transport settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SourcesConfig {
    /// Maximum time to establish each subscription. Default: 3s.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Buffered observations per transaction channel. Default: 8192.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Buffered observations per block channel. Default: 16.
    #[serde(default = "default_block_channel_capacity")]
    pub block_channel_capacity: usize,
}

/// Which result sink to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    #[default]
    None,
    Csv,
    Clickhouse,
    Stdout,
}

impl SinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Csv => "csv",
            Self::Clickhouse => "clickhouse",
            Self::Stdout => "stdout",
        }
    }
}

/// Result sink configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SinkConfig {
    #[serde(default)]
    pub kind: SinkKind,

    #[serde(default)]
    pub csv: CsvConfig,

    #[serde(default)]
    pub clickhouse: ClickHouseConfig,

    #[serde(default)]
    pub stdout: StdoutConfig,
}

/// CSV sink configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CsvConfig {
    /// Path prefix; files are `<prefix>.observations.csv` and
    /// `<prefix>.stats.csv`. Defaults to the benchmark id.
    #[serde(default)]
    pub prefix: String,
}

/// Stdout sink configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StdoutConfig {
    /// Also print every detail row.
    #[serde(default)]
    pub details: bool,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// Native protocol address (e.g. "localhost:9000").
    #[serde(default)]
    pub endpoint: String,

    /// Target database, created if missing. Default: "fiber_benchmarks".
    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Initial delay between failed insert attempts. Default: 500ms.
    #[serde(default = "default_retry_backoff", with = "humantime_serde")]
    pub retry_backoff: Duration,

    /// Upper bound for the retry delay. Default: 30s.
    #[serde(default = "default_max_retry_backoff", with = "humantime_serde")]
    pub max_retry_backoff: Duration,

    /// Schema migration settings.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

/// Schema migration settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Apply pending migrations when the sink starts. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Command-line and environment overrides applied on top of the file.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct Overrides {
    /// Fiber WebSocket endpoint(s), comma separated.
    #[arg(long = "fiber-endpoint", env = "FIBER_ENDPOINT", value_delimiter = ',')]
    pub fiber_endpoints: Vec<String>,

    /// Fiber API key.
    #[arg(long, env = "FIBER_KEY", hide_env_values = true)]
    pub fiber_key: Option<String>,

    /// bloXroute WebSocket endpoint.
    #[arg(long, env = "BLXR_ENDPOINT")]
    pub blxr_endpoint: Option<String>,

    /// bloXroute authorization header.
    #[arg(long, env = "BLXR_KEY", hide_env_values = true)]
    pub blxr_key: Option<String>,

    /// Compare two Fiber endpoints against each other.
    #[arg(long)]
    pub fiber_only: bool,

    /// Interval length (e.g. "30s", "5m").
    #[arg(long, value_parser = humantime::parse_duration)]
    pub interval: Option<Duration>,

    /// Number of intervals to run.
    #[arg(long)]
    pub interval_count: Option<usize>,

    /// Close an interval once the primary has seen this many hashes.
    #[arg(long)]
    pub max_primary_observations: Option<usize>,

    /// Only compare hashes confirmed by execution payloads.
    #[arg(long)]
    pub cross_check: bool,

    /// Log hashes only one side observed.
    #[arg(long)]
    pub log_missing: bool,

    /// Tag attached to exported rows.
    #[arg(long)]
    pub benchmark_id: Option<String>,

    /// Percentile preset.
    #[arg(long, value_enum)]
    pub percentiles: Option<PercentilePreset>,

    /// Result sink.
    #[arg(long, value_enum)]
    pub sink: Option<SinkKind>,

    /// CSV path prefix.
    #[arg(long)]
    pub csv_prefix: Option<String>,

    #[arg(long, env = "CLICKHOUSE_ENDPOINT")]
    pub clickhouse_endpoint: Option<String>,

    #[arg(long, env = "CLICKHOUSE_DB")]
    pub clickhouse_db: Option<String>,

    #[arg(long, env = "CLICKHOUSE_USERNAME")]
    pub clickhouse_username: Option<String>,

    #[arg(long, env = "CLICKHOUSE_PASSWORD", hide_env_values = true)]
    pub clickhouse_password: Option<String>,
}

/// Percentile presets selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PercentilePreset {
    Full,
    Reduced,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_interval_count() -> usize {
    10
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_channel_capacity() -> usize {
    8192
}

fn default_block_channel_capacity() -> usize {
    16
}

fn default_database() -> String {
    "fiber_benchmarks".to_string()
}

fn default_retry_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_max_retry_backoff() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            fiber: FiberConfig::default(),
            bloxroute: BloxrouteConfig::default(),
            fiber_only: false,
            benchmark: BenchmarkConfig::default(),
            sources: SourcesConfig::default(),
            sink: SinkConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            interval_count: default_interval_count(),
            max_primary_observations: None,
            cross_check: false,
            log_missing: false,
            benchmark_id: String::new(),
            percentiles: PercentileSet::default(),
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            channel_capacity: default_channel_capacity(),
            block_channel_capacity: default_block_channel_capacity(),
        }
    }
}

impl Default for CsvConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            database: default_database(),
            username: String::new(),
            password: String::new(),
            retry_backoff: default_retry_backoff(),
            max_retry_backoff: default_max_retry_backoff(),
            migrations: MigrationsConfig::default(),
        }
    }
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file. Call [`Config::validate`] once
    /// overrides have been applied.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        Ok(cfg)
    }

    /// Applies command-line and environment overrides.
    pub fn apply_overrides(&mut self, o: Overrides) {
        if !o.fiber_endpoints.is_empty() {
            self.fiber.endpoints = o.fiber_endpoints;
        }
        if let Some(key) = o.fiber_key {
            self.fiber.api_key = key;
        }
        if let Some(endpoint) = o.blxr_endpoint {
            self.bloxroute.endpoint = endpoint;
        }
        if let Some(key) = o.blxr_key {
            self.bloxroute.api_key = key;
        }
        self.fiber_only |= o.fiber_only;

        let b = &mut self.benchmark;
        if let Some(interval) = o.interval {
            b.interval = interval;
        }
        if let Some(count) = o.interval_count {
            b.interval_count = count;
        }
        if o.max_primary_observations.is_some() {
            b.max_primary_observations = o.max_primary_observations;
        }
        b.cross_check |= o.cross_check;
        b.log_missing |= o.log_missing;
        if let Some(id) = o.benchmark_id {
            b.benchmark_id = id;
        }
        match o.percentiles {
            Some(PercentilePreset::Full) => b.percentiles = PercentileSet::Full,
            Some(PercentilePreset::Reduced) => b.percentiles = PercentileSet::Reduced,
            None => {}
        }

        if let Some(kind) = o.sink {
            self.sink.kind = kind;
        }
        if let Some(prefix) = o.csv_prefix {
            self.sink.csv.prefix = prefix;
        }
        let ch = &mut self.sink.clickhouse;
        if let Some(endpoint) = o.clickhouse_endpoint {
            ch.endpoint = endpoint;
        }
        if let Some(db) = o.clickhouse_db {
            ch.database = db;
        }
        if let Some(username) = o.clickhouse_username {
            ch.username = username;
        }
        if let Some(password) = o.clickhouse_password {
            ch.password = password;
        }
    }

    /// Fills in a generated benchmark id when none was configured.
    pub fn ensure_benchmark_id(&mut self, kind: StreamKind) {
        if self.benchmark.benchmark_id.is_empty() {
            self.benchmark.benchmark_id =
                format!("{}-{}", kind, Utc::now().format("%Y%m%dT%H%M%SZ"));
        }
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self, kind: StreamKind) -> Result<()> {
        if self.fiber.endpoints.is_empty() || self.fiber.endpoints.iter().any(|e| e.is_empty()) {
            bail!("fiber.endpoints is required");
        }

        if self.fiber.api_key.is_empty() {
            bail!("fiber.api_key is required");
        }

        if self.fiber_only {
            if self.fiber.endpoints.len() < 2 {
                bail!("fiber_only requires two fiber.endpoints");
            }
        } else {
            if self.bloxroute.endpoint.is_empty() {
                bail!("bloxroute.endpoint is required");
            }
            if self.bloxroute.api_key.is_empty() {
                bail!("bloxroute.api_key is required");
            }
        }

        if self.benchmark.interval.is_zero() {
            bail!("benchmark.interval must be positive");
        }

        if self.benchmark.interval_count == 0 {
            bail!("benchmark.interval_count must be positive");
        }

        if self.benchmark.max_primary_observations == Some(0) {
            bail!("benchmark.max_primary_observations must be positive");
        }

        if self.benchmark.cross_check && kind == StreamKind::Blocks {
            bail!("benchmark.cross_check is only supported for transaction benchmarks");
        }

        if let Err(e) = self.benchmark.percentiles.validate() {
            bail!("benchmark.percentiles: {e}");
        }

        if self.sources.connect_timeout.is_zero() {
            bail!("sources.connect_timeout must be positive");
        }

        if self.sources.channel_capacity == 0 || self.sources.block_channel_capacity == 0 {
            bail!("sources channel capacities must be positive");
        }

        if self.sink.kind == SinkKind::Csv && self.csv_prefix().is_empty() {
            bail!("sink.csv.prefix is required when sink.kind is csv");
        }

        if self.sink.kind == SinkKind::Clickhouse {
            if self.sink.clickhouse.endpoint.is_empty() {
                bail!("sink.clickhouse.endpoint is required when sink.kind is clickhouse");
            }
            if self.sink.clickhouse.database.is_empty() {
                bail!("sink.clickhouse.database is required when sink.kind is clickhouse");
            }
        }

        Ok(())
    }

    /// CSV prefix, falling back to the benchmark id.
    pub fn csv_prefix(&self) -> &str {
        if self.sink.csv.prefix.is_empty() {
            &self.benchmark.benchmark_id
        } else {
            &self.sink.csv.prefix
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            fiber: FiberConfig {
                endpoints: vec!["ws://fiber:8080".to_string()],
                api_key: "fiber-key".to_string(),
            },
            bloxroute: BloxrouteConfig {
                endpoint: "wss://blxr/ws".to_string(),
                api_key: "blxr-key".to_string(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.benchmark.interval, Duration::from_secs(60));
        assert_eq!(cfg.benchmark.interval_count, 10);
        assert_eq!(cfg.sources.connect_timeout, Duration::from_secs(3));
        assert_eq!(cfg.sources.channel_capacity, 8192);
        assert_eq!(cfg.sink.kind, SinkKind::None);
        assert_eq!(cfg.sink.clickhouse.database, "fiber_benchmarks");
        assert!(cfg.sink.clickhouse.migrations.enabled);
        assert_eq!(cfg.health.addr, ":9090");
        assert!(!cfg.health.enabled);
    }

    #[test]
    fn test_valid_config_passes() {
        valid_config().validate(StreamKind::Transactions).unwrap();
    }

    #[test]
    fn test_validation_missing_fiber_endpoint() {
        let mut cfg = valid_config();
        cfg.fiber.endpoints.clear();
        let err = cfg.validate(StreamKind::Transactions).unwrap_err();
        assert!(err.to_string().contains("fiber.endpoints"));
    }

    #[test]
    fn test_validation_missing_fiber_key() {
        let mut cfg = valid_config();
        cfg.fiber.api_key.clear();
        let err = cfg.validate(StreamKind::Transactions).unwrap_err();
        assert!(err.to_string().contains("fiber.api_key"));
    }

    #[test]
    fn test_validation_missing_bloxroute() {
        let mut cfg = valid_config();
        cfg.bloxroute.endpoint.clear();
        let err = cfg.validate(StreamKind::Transactions).unwrap_err();
        assert!(err.to_string().contains("bloxroute.endpoint"));
    }

    #[test]
    fn test_validation_fiber_only_needs_two_endpoints() {
        let mut cfg = valid_config();
        cfg.fiber_only = true;
        cfg.bloxroute = BloxrouteConfig::default();
        let err = cfg.validate(StreamKind::Transactions).unwrap_err();
        assert!(err.to_string().contains("two fiber.endpoints"));

        cfg.fiber.endpoints.push("ws://fiber-2:8080".to_string());
        cfg.validate(StreamKind::Transactions).unwrap();
    }

    #[test]
    fn test_validation_zero_interval() {
        let mut cfg = valid_config();
        cfg.benchmark.interval = Duration::ZERO;
        let err = cfg.validate(StreamKind::Transactions).unwrap_err();
        assert!(err.to_string().contains("benchmark.interval"));
    }

    #[test]
    fn test_validation_zero_interval_count() {
        let mut cfg = valid_config();
        cfg.benchmark.interval_count = 0;
        let err = cfg.validate(StreamKind::Blocks).unwrap_err();
        assert!(err.to_string().contains("interval_count"));
    }

    #[test]
    fn test_validation_cross_check_blocks() {
        let mut cfg = valid_config();
        cfg.benchmark.cross_check = true;
        cfg.validate(StreamKind::Transactions).unwrap();
        let err = cfg.validate(StreamKind::Blocks).unwrap_err();
        assert!(err.to_string().contains("cross_check"));
    }

    #[test]
    fn test_validation_clickhouse_endpoint() {
        let mut cfg = valid_config();
        cfg.sink.kind = SinkKind::Clickhouse;
        let err = cfg.validate(StreamKind::Transactions).unwrap_err();
        assert!(err.to_string().contains("sink.clickhouse.endpoint"));
    }

    #[test]
    fn test_validation_empty_csv_prefix() {
        let mut cfg = valid_config();
        cfg.sink.kind = SinkKind::Csv;
        let err = cfg.validate(StreamKind::Transactions).unwrap_err();
        assert!(err.to_string().contains("sink.csv.prefix"));

        cfg.ensure_benchmark_id(StreamKind::Transactions);
        cfg.validate(StreamKind::Transactions).unwrap();
    }

    #[test]
    fn test_validation_bad_custom_percentile() {
        let mut cfg = valid_config();
        cfg.benchmark.percentiles = PercentileSet::Custom(vec![50.0, 120.0]);
        let err = cfg.validate(StreamKind::Transactions).unwrap_err();
        assert!(err.to_string().contains("percentiles"));
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
fiber:
  endpoints: ["ws://a:1", "ws://b:2"]
  api_key: k
fiber_only: true
benchmark:
  interval: 30s
  interval_count: 3
  cross_check: true
  percentiles: reduced
sink:
  kind: clickhouse
  clickhouse:
    endpoint: "localhost:9000"
    retry_backoff: 250ms
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.fiber.endpoints.len(), 2);
        assert!(cfg.fiber_only);
        assert_eq!(cfg.benchmark.interval, Duration::from_secs(30));
        assert_eq!(cfg.benchmark.interval_count, 3);
        assert_eq!(cfg.benchmark.percentiles, PercentileSet::Reduced);
        assert_eq!(cfg.sink.kind, SinkKind::Clickhouse);
        assert_eq!(cfg.sink.clickhouse.retry_backoff, Duration::from_millis(250));
        assert_eq!(cfg.sink.clickhouse.database, "fiber_benchmarks");
        cfg.validate(StreamKind::Transactions).unwrap();
    }

    #[test]
    fn test_load_yaml_with_custom_percentiles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.yaml");
        std::fs::write(
            &path,
            r#"
fiber:
  endpoints: ["ws://a:1"]
  api_key: k
bloxroute:
  endpoint: "wss://b:2/ws"
  api_key: b
benchmark:
  interval: 10s
  percentiles:
    custom: [50, 99.9, 1]
"#,
        )
        .unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(
            cfg.benchmark.percentiles,
            PercentileSet::Custom(vec![50.0, 99.9, 1.0])
        );
        assert_eq!(cfg.benchmark.percentiles.ranks(), vec![1.0, 50.0, 99.9]);
        cfg.validate(StreamKind::Transactions).unwrap();
    }

    #[test]
    fn test_overrides_replace_file_values() {
        let mut cfg = valid_config();
        cfg.apply_overrides(Overrides {
            fiber_endpoints: vec!["ws://x:1".to_string(), "ws://y:2".to_string()],
            blxr_key: Some("other".to_string()),
            interval: Some(Duration::from_secs(5)),
            cross_check: true,
            percentiles: Some(PercentilePreset::Reduced),
            sink: Some(SinkKind::Csv),
            clickhouse_db: Some("bench".to_string()),
            ..Default::default()
        });

        assert_eq!(cfg.fiber.endpoints, vec!["ws://x:1", "ws://y:2"]);
        assert_eq!(cfg.fiber.api_key, "fiber-key");
        assert_eq!(cfg.bloxroute.api_key, "other");
        assert_eq!(cfg.benchmark.interval, Duration::from_secs(5));
        assert!(cfg.benchmark.cross_check);
        assert_eq!(cfg.benchmark.percentiles, PercentileSet::Reduced);
        assert_eq!(cfg.sink.kind, SinkKind::Csv);
        assert_eq!(cfg.sink.clickhouse.database, "bench");
    }

    #[test]
    fn test_benchmark_id_generated_once() {
        let mut cfg = valid_config();
        cfg.ensure_benchmark_id(StreamKind::Blocks);
        assert!(cfg.benchmark.benchmark_id.starts_with("blocks-"));

        cfg.benchmark.benchmark_id = "fixed".to_string();
        cfg.ensure_benchmark_id(StreamKind::Blocks);
        assert_eq!(cfg.benchmark.benchmark_id, "fixed");
    }

    #[test]
    fn test_csv_prefix_falls_back_to_benchmark_id() {
        let mut cfg = valid_config();
        cfg.benchmark.benchmark_id = "run-1".to_string();
        assert_eq!(cfg.csv_prefix(), "run-1");
        cfg.sink.csv.prefix = "out/bench".to_string();
        assert_eq!(cfg.csv_prefix(), "out/bench");
    }
}
