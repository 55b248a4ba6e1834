use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

// Pipeline configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct SizewatchConfig {
    // Object-store container whose size is tracked and remediated.
    pub subject: String,
    // HTTP listener for metrics, health and query endpoints.
    pub http_bind: SocketAddr,
    // Max deliveries per consumer receive.
    pub batch_size: usize,
    // Time an unacked delivery stays hidden before redelivery.
    pub visibility_timeout_ms: u64,
    // Receives per message before it is dead-lettered.
    pub max_receive_count: u32,
    // Max queued messages per consumer group.
    pub queue_capacity: usize,
    // Long-poll wait per receive.
    pub receive_wait_ms: u64,
    pub tracker_workers: usize,
    pub logger_workers: usize,
    pub remediation_workers: usize,
    pub metric_name: String,
    // Aggregation window length.
    pub metric_period_ms: u64,
    // Closed windows kept for queries.
    pub metric_lookback_windows: usize,
    // How often the control loop checks for newly closed windows.
    pub evaluation_tick_ms: u64,
    pub alarm_name: String,
    pub alarm_threshold: f64,
    // Lines retained by the delta log stream.
    pub log_stream_capacity: usize,
    // When set, history is persisted as JSON lines at this path.
    pub history_path: Option<PathBuf>,
    // Fsync after every history append (file backend only).
    pub history_fsync: bool,
    // How long a remediation invocation id is remembered.
    pub dedupe_ttl_ms: u64,
}

const DEFAULT_SUBJECT: &str = "sizewatch-bucket";
const DEFAULT_HTTP_BIND: &str = "0.0.0.0:8080";
const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_VISIBILITY_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_MAX_RECEIVE_COUNT: u32 = 5;
const DEFAULT_QUEUE_CAPACITY: usize = 100_000;
const DEFAULT_RECEIVE_WAIT_MS: u64 = 1000;
const DEFAULT_TRACKER_WORKERS: usize = 2;
const DEFAULT_LOGGER_WORKERS: usize = 2;
const DEFAULT_REMEDIATION_WORKERS: usize = 1;
const DEFAULT_METRIC_NAME: &str = "TotalObjectSize";
const DEFAULT_METRIC_PERIOD_MS: u64 = 30_000;
const DEFAULT_METRIC_LOOKBACK_WINDOWS: usize = 120;
const DEFAULT_EVALUATION_TICK_MS: u64 = 1000;
const DEFAULT_ALARM_NAME: &str = "TotalObjectSizeAlarm";
const DEFAULT_ALARM_THRESHOLD: f64 = 20.0;
const DEFAULT_LOG_STREAM_CAPACITY: usize = 100_000;
const DEFAULT_DEDUPE_TTL_MS: u64 = 600_000;

impl Default for SizewatchConfig {
    fn default() -> Self {
        Self {
            subject: DEFAULT_SUBJECT.to_string(),
            http_bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            batch_size: DEFAULT_BATCH_SIZE,
            visibility_timeout_ms: DEFAULT_VISIBILITY_TIMEOUT_MS,
            max_receive_count: DEFAULT_MAX_RECEIVE_COUNT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            receive_wait_ms: DEFAULT_RECEIVE_WAIT_MS,
            tracker_workers: DEFAULT_TRACKER_WORKERS,
            logger_workers: DEFAULT_LOGGER_WORKERS,
            remediation_workers: DEFAULT_REMEDIATION_WORKERS,
            metric_name: DEFAULT_METRIC_NAME.to_string(),
            metric_period_ms: DEFAULT_METRIC_PERIOD_MS,
            metric_lookback_windows: DEFAULT_METRIC_LOOKBACK_WINDOWS,
            evaluation_tick_ms: DEFAULT_EVALUATION_TICK_MS,
            alarm_name: DEFAULT_ALARM_NAME.to_string(),
            alarm_threshold: DEFAULT_ALARM_THRESHOLD,
            log_stream_capacity: DEFAULT_LOG_STREAM_CAPACITY,
            history_path: None,
            history_fsync: false,
            dedupe_ttl_ms: DEFAULT_DEDUPE_TTL_MS,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SizewatchConfigOverride {
    subject: Option<String>,
    http_bind: Option<String>,
    batch_size: Option<usize>,
    visibility_timeout_ms: Option<u64>,
    max_receive_count: Option<u32>,
    queue_capacity: Option<usize>,
    receive_wait_ms: Option<u64>,
    tracker_workers: Option<usize>,
    logger_workers: Option<usize>,
    remediation_workers: Option<usize>,
    metric_name: Option<String>,
    metric_period_ms: Option<u64>,
    metric_lookback_windows: Option<usize>,
    evaluation_tick_ms: Option<u64>,
    alarm_name: Option<String>,
    alarm_threshold: Option<f64>,
    log_stream_capacity: Option<usize>,
    history_path: Option<PathBuf>,
    history_fsync: Option<bool>,
    dedupe_ttl_ms: Option<u64>,
}

fn env_positive<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + PartialOrd + Default,
{
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .filter(|value| *value > T::default())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

impl SizewatchConfig {
    pub fn from_env() -> Result<Self> {
        let http_bind = std::env::var("SIZEWATCH_HTTP_BIND")
            .unwrap_or_else(|_| DEFAULT_HTTP_BIND.to_string())
            .parse()
            .with_context(|| "parse SIZEWATCH_HTTP_BIND")?;
        let alarm_threshold = std::env::var("SIZEWATCH_ALARM_THRESHOLD")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| value.is_finite())
            .unwrap_or(DEFAULT_ALARM_THRESHOLD);
        let history_path = std::env::var("SIZEWATCH_HISTORY_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);
        let history_fsync = std::env::var("SIZEWATCH_HISTORY_FSYNC")
            .ok()
            .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        Ok(Self {
            subject: env_string("SIZEWATCH_SUBJECT", DEFAULT_SUBJECT),
            http_bind,
            batch_size: env_positive("SIZEWATCH_BATCH_SIZE", DEFAULT_BATCH_SIZE),
            visibility_timeout_ms: env_positive(
                "SIZEWATCH_VISIBILITY_TIMEOUT_MS",
                DEFAULT_VISIBILITY_TIMEOUT_MS,
            ),
            max_receive_count: env_positive(
                "SIZEWATCH_MAX_RECEIVE_COUNT",
                DEFAULT_MAX_RECEIVE_COUNT,
            ),
            queue_capacity: env_positive("SIZEWATCH_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY),
            receive_wait_ms: env_positive("SIZEWATCH_RECEIVE_WAIT_MS", DEFAULT_RECEIVE_WAIT_MS),
            tracker_workers: env_positive("SIZEWATCH_TRACKER_WORKERS", DEFAULT_TRACKER_WORKERS),
            logger_workers: env_positive("SIZEWATCH_LOGGER_WORKERS", DEFAULT_LOGGER_WORKERS),
            remediation_workers: env_positive(
                "SIZEWATCH_REMEDIATION_WORKERS",
                DEFAULT_REMEDIATION_WORKERS,
            ),
            metric_name: env_string("SIZEWATCH_METRIC_NAME", DEFAULT_METRIC_NAME),
            metric_period_ms: env_positive("SIZEWATCH_METRIC_PERIOD_MS", DEFAULT_METRIC_PERIOD_MS),
            metric_lookback_windows: env_positive(
                "SIZEWATCH_METRIC_LOOKBACK_WINDOWS",
                DEFAULT_METRIC_LOOKBACK_WINDOWS,
            ),
            evaluation_tick_ms: env_positive(
                "SIZEWATCH_EVALUATION_TICK_MS",
                DEFAULT_EVALUATION_TICK_MS,
            ),
            alarm_name: env_string("SIZEWATCH_ALARM_NAME", DEFAULT_ALARM_NAME),
            alarm_threshold,
            log_stream_capacity: env_positive(
                "SIZEWATCH_LOG_STREAM_CAPACITY",
                DEFAULT_LOG_STREAM_CAPACITY,
            ),
            history_path,
            history_fsync,
            dedupe_ttl_ms: env_positive("SIZEWATCH_DEDUPE_TTL_MS", DEFAULT_DEDUPE_TTL_MS),
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("SIZEWATCH_CONFIG") {
            // YAML overrides allow ops-friendly config files.
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read SIZEWATCH_CONFIG: {path}"))?;
            config.apply_yaml(&contents)?;
        }
        Ok(config)
    }

    pub fn apply_yaml(&mut self, contents: &str) -> Result<()> {
        let override_cfg: SizewatchConfigOverride =
            serde_yaml::from_str(contents).with_context(|| "parse sizewatch config yaml")?;
        if let Some(value) = override_cfg.subject
            && !value.trim().is_empty()
        {
            self.subject = value;
        }
        if let Some(value) = override_cfg.http_bind {
            self.http_bind = value.parse().with_context(|| "parse http_bind")?;
        }
        if let Some(value) = override_cfg.batch_size
            && value > 0
        {
            self.batch_size = value;
        }
        if let Some(value) = override_cfg.visibility_timeout_ms
            && value > 0
        {
            self.visibility_timeout_ms = value;
        }
        if let Some(value) = override_cfg.max_receive_count
            && value > 0
        {
            self.max_receive_count = value;
        }
        if let Some(value) = override_cfg.queue_capacity
            && value > 0
        {
            self.queue_capacity = value;
        }
        if let Some(value) = override_cfg.receive_wait_ms
            && value > 0
        {
            self.receive_wait_ms = value;
        }
        if let Some(value) = override_cfg.tracker_workers
            && value > 0
        {
            self.tracker_workers = value;
        }
        if let Some(value) = override_cfg.logger_workers
            && value > 0
        {
            self.logger_workers = value;
        }
        if let Some(value) = override_cfg.remediation_workers
            && value > 0
        {
            self.remediation_workers = value;
        }
        if let Some(value) = override_cfg.metric_name {
            self.metric_name = value;
        }
        if let Some(value) = override_cfg.metric_period_ms
            && value > 0
        {
            self.metric_period_ms = value;
        }
        if let Some(value) = override_cfg.metric_lookback_windows
            && value > 0
        {
            self.metric_lookback_windows = value;
        }
        if let Some(value) = override_cfg.evaluation_tick_ms
            && value > 0
        {
            self.evaluation_tick_ms = value;
        }
        if let Some(value) = override_cfg.alarm_name {
            self.alarm_name = value;
        }
        if let Some(value) = override_cfg.alarm_threshold
            && value.is_finite()
        {
            self.alarm_threshold = value;
        }
        if let Some(value) = override_cfg.log_stream_capacity
            && value > 0
        {
            self.log_stream_capacity = value;
        }
        if let Some(value) = override_cfg.history_path {
            self.history_path = Some(value);
        }
        if let Some(value) = override_cfg.history_fsync {
            self.history_fsync = value;
        }
        if let Some(value) = override_cfg.dedupe_ttl_ms
            && value > 0
        {
            self.dedupe_ttl_ms = value;
        }
        Ok(())
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    pub fn receive_wait(&self) -> Duration {
        Duration::from_millis(self.receive_wait_ms)
    }

    pub fn evaluation_tick(&self) -> Duration {
        Duration::from_millis(self.evaluation_tick_ms)
    }

    pub fn dedupe_ttl(&self) -> Duration {
        Duration::from_millis(self.dedupe_ttl_ms)
    }
}
