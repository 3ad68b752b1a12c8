//! # Observability
//!
//! Centralized logging initialization for the agent transport binaries.
//!
//! Components are **log producers** only. They use the standard `tracing`
//! macros and never decide where log lines end up; the binary calls
//! [`init`] or [`init_with_config`] once at startup and that single call
//! decides the sinks:
//!
//! - a compact, human readable stderr stream (on by default)
//! - an optional append-only JSONL file, one event per line, flushed per line
//!   so that `tail -f` and `jq` can follow it while the agent runs
//!
//! ## Usage
//!
//! ```rust,ignore
//! fn main() {
//!     observability::init("agent-transport");
//!     tracing::info!("ready");
//! }
//! ```
//!
//! Or with configuration:
//!
//! ```rust,ignore
//! observability::init_with_config(observability::LogConfig {
//!     service_name: "agent-transport".into(),
//!     default_level: "debug".into(),
//!     json_file: true,
//!     ..Default::default()
//! });
//! ```

mod writer;

pub use writer::{AppendLogWriter, AppendWriterFactory};

use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the service, used for the default log file name.
    pub service_name: String,

    /// Default log level filter (e.g., "debug", "info", "warn").
    /// Can be overridden by the `RUST_LOG` environment variable.
    pub default_level: String,

    /// Optional custom JSONL file path.
    /// Defaults to `~/.agent-transport/logs/<service>.jsonl`.
    pub log_path: Option<PathBuf>,

    /// Emit compact logs on stderr.
    pub also_stderr: bool,

    /// Write structured JSONL to `log_path`.
    pub json_file: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".into(),
            default_level: "info".into(),
            log_path: None,
            also_stderr: true,
            json_file: false,
        }
    }
}

impl LogConfig {
    /// Resolve the JSONL file location for this configuration.
    pub fn resolved_log_path(&self) -> Option<PathBuf> {
        self.log_path
            .clone()
            .or_else(|| default_log_path(&self.service_name))
    }
}

fn default_log_path(service_name: &str) -> Option<PathBuf> {
    dirs::home_dir().map(|home| {
        home.join(".agent-transport")
            .join("logs")
            .join(format!("{service_name}.jsonl"))
    })
}

/// Initialize logging with default settings for the given service.
///
/// Returns `false` when a global subscriber was already installed.
pub fn init(service_name: &str) -> bool {
    init_with_config(LogConfig {
        service_name: service_name.into(),
        ..Default::default()
    })
}

/// Initialize logging with custom configuration.
///
/// Safe to call more than once; only the first call installs a subscriber.
/// If the JSONL file cannot be opened the file sink is skipped and a warning
/// is logged through whichever sink did get installed.
pub fn init_with_config(config: LogConfig) -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.default_level));

    let mut file_error = None;
    let file_layer = if config.json_file {
        match config.resolved_log_path() {
            Some(path) => match AppendLogWriter::open(&path) {
                Ok(writer) => Some(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_target(true)
                        .with_writer(AppendWriterFactory::new(writer)),
                ),
                Err(e) => {
                    file_error = Some(format!("{}: {}", path.display(), e));
                    None
                }
            },
            None => {
                file_error = Some("home directory not found".to_string());
                None
            }
        }
    } else {
        None
    };

    let stderr_layer = config.also_stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .compact()
            .with_writer(std::io::stderr)
    });

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .is_ok();

    if installed {
        if let Some(err) = file_error {
            tracing::warn!(error = %err, "JSONL log file unavailable, continuing without it");
        }
        tracing::debug!(service = %config.service_name, "observability initialized");
    }

    installed
}

/// Re-export tracing macros for convenience.
pub use tracing::{debug, error, info, instrument, trace, warn};

/// Re-export Level for advanced filtering.
pub use tracing::Level;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.service_name, "unknown");
        assert_eq!(config.default_level, "info");
        assert!(config.log_path.is_none());
        assert!(config.also_stderr);
        assert!(!config.json_file);
    }

    #[test]
    fn test_explicit_log_path_wins() {
        let config = LogConfig {
            log_path: Some(PathBuf::from("/tmp/custom.jsonl")),
            ..Default::default()
        };
        assert_eq!(
            config.resolved_log_path(),
            Some(PathBuf::from("/tmp/custom.jsonl"))
        );
    }

    #[test]
    fn test_default_log_path_uses_service_name() {
        let config = LogConfig {
            service_name: "collector-probe".into(),
            ..Default::default()
        };
        if let Some(path) = config.resolved_log_path() {
            assert!(path.ends_with("collector-probe.jsonl"));
        }
    }
}
