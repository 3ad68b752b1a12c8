//! Configuration for the delivery subsystem.

use crate::backoff::BackoffConfig;
use crate::{TransportError, TransportResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Default collector URL.
pub const DEFAULT_COLLECTOR_URL: &str = "http://localhost:8090";

/// Default queue capacity: 512 MiB of destinations and payloads.
pub const DEFAULT_QUEUE_CAPACITY_BYTES: u64 = 512 * 1024 * 1024;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

const ENV_COLLECTOR_URL: &str = "AGENT_TRANSPORT_COLLECTOR_URL";
const ENV_API_KEY: &str = "AGENT_TRANSPORT_API_KEY";
const ENV_LOG_LEVEL: &str = "AGENT_TRANSPORT_LOG_LEVEL";
const ENV_WORKERS: &str = "AGENT_TRANSPORT_WORKERS";
const ENV_QUEUE_CAPACITY: &str = "AGENT_TRANSPORT_QUEUE_CAPACITY";

/// Transport configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Base URL of the collector.
    pub collector_url: String,
    /// Sent as `X-Api-Key` when present.
    pub api_key: Option<String>,

    pub group_id: String,
    pub agent_id: String,
    pub build_version: String,
    /// Unique per agent process.
    pub instance_id: String,

    /// Byte budget of the delivery queue.
    pub queue_capacity_bytes: u64,
    /// Number of background delivery workers.
    pub worker_count: usize,
    /// How long an idle worker waits on the queue before re-checking for
    /// shutdown.
    pub poll_timeout_ms: u64,
    /// How long shutdown waits for workers before aborting them.
    pub shutdown_grace_ms: u64,
    /// Per-request HTTP timeout in seconds.
    pub request_timeout_secs: u64,
    /// Gzip request bodies and send `Content-Encoding: gzip`.
    pub gzip_compression: bool,
    /// PEM bundle of extra root certificates for an https collector.
    pub ssl_truststore: Option<PathBuf>,
    /// Accept any server certificate. Only for test collectors.
    pub ssl_trust_all: bool,

    /// Retry policy for queued messages.
    pub backoff: BackoffConfig,
    /// Fixed delay between registration attempts.
    pub metadata_retry_interval_ms: u64,
    /// Fixed delay between recovery probes.
    pub recovery_retry_interval_ms: u64,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            collector_url: DEFAULT_COLLECTOR_URL.to_string(),
            api_key: None,
            group_id: "default".to_string(),
            agent_id: "agent".to_string(),
            build_version: "0.0.0".to_string(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            queue_capacity_bytes: DEFAULT_QUEUE_CAPACITY_BYTES,
            worker_count: 1,
            poll_timeout_ms: 1000,
            shutdown_grace_ms: 5000,
            request_timeout_secs: 30,
            gzip_compression: true,
            ssl_truststore: None,
            ssl_trust_all: false,
            backoff: BackoffConfig::default(),
            metadata_retry_interval_ms: 500,
            recovery_retry_interval_ms: 500,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl TransportConfig {
    /// Load from `path` if given and present, otherwise defaults; then apply
    /// environment overrides and validate.
    pub fn load(path: Option<&Path>) -> TransportResult<Self> {
        let mut config = match path {
            Some(path) if path.exists() => Self::load_from_file(path)?,
            _ => Self::default(),
        };

        config.load_from_env();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific JSON file.
    pub fn load_from_file(path: &Path) -> TransportResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TransportConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Override configuration from `AGENT_TRANSPORT_*` environment variables.
    fn load_from_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_COLLECTOR_URL) {
            self.collector_url = url;
        }
        if let Some(key) = lookup(ENV_API_KEY) {
            self.api_key = Some(key).filter(|k| !k.is_empty());
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.log_level = level;
        }
        if let Some(workers) = lookup(ENV_WORKERS).and_then(|s| s.parse().ok()) {
            self.worker_count = workers;
        }
        if let Some(capacity) = lookup(ENV_QUEUE_CAPACITY).and_then(|s| s.parse().ok()) {
            self.queue_capacity_bytes = capacity;
        }
    }

    /// Reject settings the delivery components cannot run with.
    pub fn validate(&self) -> TransportResult<()> {
        if self.worker_count == 0 {
            return Err(TransportError::Config(
                "worker_count must be at least 1".to_string(),
            ));
        }
        if self.poll_timeout_ms == 0 {
            return Err(TransportError::Config(
                "poll_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.backoff.factor.is_nan() || self.backoff.factor < 1.0 {
            return Err(TransportError::Config(format!(
                "backoff.factor must be >= 1.0, got {}",
                self.backoff.factor
            )));
        }
        if self.backoff.max_retries == 0 {
            return Err(TransportError::Config(
                "backoff.max_retries must be at least 1".to_string(),
            ));
        }
        self.collector_url()?;
        Ok(())
    }

    /// Get the collector URL as a parsed URL.
    pub fn collector_url(&self) -> TransportResult<Url> {
        Url::parse(&self.collector_url).map_err(TransportError::from)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn metadata_retry_interval(&self) -> Duration {
        Duration::from_millis(self.metadata_retry_interval_ms)
    }

    pub fn recovery_retry_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_retry_interval_ms)
    }
}
