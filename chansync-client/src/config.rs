//! Configuration loading for chansync-client.
//!
//! Configuration is loaded from a TOML file. Every section and every field is
//! optional; missing values fall back to the defaults below.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use chansync_core::ReconnectPolicy;

/// Root configuration for the chat engine.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    /// Connection and reconnect configuration.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Reconciliation configuration.
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    /// History paging configuration.
    #[serde(default)]
    pub history: HistoryConfig,
    /// Membership notice configuration.
    #[serde(default)]
    pub membership: MembershipConfig,
    /// Reaction merge configuration.
    #[serde(default)]
    pub reactions: ReactionsConfig,
    /// Typing indicator configuration.
    #[serde(default)]
    pub typing: TypingConfig,
    /// Local persistence configuration.
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

/// Connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Reconnect attempts before reporting unavailable (default: 10).
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnect attempt (default: 1000ms).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Cap on the exponential delay (default: 30000ms).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Random jitter added to each delay (default: up to 1000ms).
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    /// Heartbeat period while connected (default: 25s).
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

/// Reconciliation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    /// Window of the content-based duplicate test (default: 5000ms).
    #[serde(default = "default_dedup_window_ms")]
    pub dedup_window_ms: u64,
}

/// History paging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    /// Messages per page (default: 50).
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

/// Membership notice configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MembershipConfig {
    /// Width of the notice dedup bucket (default: 2000ms).
    #[serde(default = "default_notice_window_ms")]
    pub notice_window_ms: u64,
}

/// Reaction merge configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReactionsConfig {
    /// How long deltas are replayed onto snapshots (default: 30s).
    #[serde(default = "default_delta_retention_secs")]
    pub delta_retention_secs: u64,
}

/// Typing indicator configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TypingConfig {
    /// Idle period before `stopTyping` is sent (default: 3000ms).
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

/// Local persistence configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PersistenceConfig {
    /// Directory for the state file. In-memory only if unset.
    pub directory: Option<PathBuf>,
}

// Default value functions
fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_ms() -> u64 {
    1000
}

fn default_heartbeat_interval_secs() -> u64 {
    25
}

fn default_dedup_window_ms() -> u64 {
    5000
}

fn default_page_size() -> u32 {
    50
}

fn default_notice_window_ms() -> u64 {
    2000
}

fn default_delta_retention_secs() -> u64 {
    30
}

fn default_idle_timeout_ms() -> u64 {
    3000
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: default_max_reconnect_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            dedup_window_ms: default_dedup_window_ms(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
        }
    }
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            notice_window_ms: default_notice_window_ms(),
        }
    }
}

impl Default for ReactionsConfig {
    fn default() -> Self {
        Self {
            delta_retention_secs: default_delta_retention_secs(),
        }
    }
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

impl ConnectionConfig {
    /// Reconnect policy for the connection state machine.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_reconnect_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: Duration::from_millis(self.jitter_ms),
        }
    }

    /// Heartbeat period.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.connection.max_reconnect_attempts, 10);
        assert_eq!(config.reconcile.dedup_window_ms, 5000);
        assert_eq!(config.history.page_size, 50);
        assert!(config.persistence.directory.is_none());
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[connection]
max_reconnect_attempts = 3
base_delay_ms = 250

[history]
page_size = 20

[persistence]
directory = "/var/lib/chansync"
"#;

        let config: EngineConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.connection.max_reconnect_attempts, 3);
        assert_eq!(config.connection.base_delay_ms, 250);
        assert_eq!(config.connection.max_delay_ms, 30_000);
        assert_eq!(config.history.page_size, 20);
        assert_eq!(
            config.persistence.directory,
            Some(PathBuf::from("/var/lib/chansync"))
        );
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.membership.notice_window_ms, 2000);
        assert_eq!(config.reactions.delta_retention_secs, 30);
        assert_eq!(config.typing.idle_timeout_ms, 3000);
        assert_eq!(config.connection.heartbeat_interval(), Duration::from_secs(25));
    }

    #[test]
    fn reconnect_policy_mirrors_connection_section() {
        let config = ConnectionConfig {
            max_reconnect_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 8000,
            jitter_ms: 0,
            heartbeat_interval_secs: 25,
        };
        let policy = config.reconnect_policy();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.base_delay, Duration::from_millis(500));
        assert_eq!(policy.max_delay, Duration::from_secs(8));
        assert_eq!(policy.jitter, Duration::ZERO);
    }

    #[test]
    fn from_file_reads_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[reconcile]\ndedup_window_ms = 4000").unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.reconcile.dedup_window_ms, 4000);
    }

    #[test]
    fn from_file_reports_missing_and_malformed() {
        let missing = EngineConfig::from_file(std::path::Path::new("/nonexistent/chansync.toml"));
        assert!(matches!(missing, Err(ConfigError::ReadError { .. })));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[history]\npage_size = \"lots\"").unwrap();
        let malformed = EngineConfig::from_file(file.path());
        assert!(matches!(malformed, Err(ConfigError::ParseError { .. })));
    }
}
