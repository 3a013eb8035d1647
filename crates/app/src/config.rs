//! Application configuration loaded from environment variables.

use std::time::Duration;

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Process configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `DATABASE_URL` — PostgreSQL connection string; unset selects the
///   in-memory store
/// - `DATABASE_MAX_CONNECTIONS` — pool size (default: `5`)
/// - `WORKFLOW_TIMEOUT_MS` — per-workflow deadline (default: `5000`)
/// - `RUST_LOG` — tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT` — `json` for JSON lines, anything else for text
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub workflow_timeout: Duration,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from any key lookup. Unparsable values fall
    /// back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            max_connections: lookup("DATABASE_MAX_CONNECTIONS")
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_connections),
            workflow_timeout: lookup("WORKFLOW_TIMEOUT_MS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.workflow_timeout),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: match lookup("LOG_FORMAT").as_deref() {
                Some(format) if format.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        }
    }

    /// Whether the process should run against the in-memory store.
    pub fn uses_memory_store(&self) -> bool {
        self.database_url.is_none()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 5,
            workflow_timeout: Duration::from_millis(5000),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}
