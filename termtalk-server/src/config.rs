//! Host configuration.
//!
//! Every field has a default, so a TOML file only needs the keys it
//! overrides. The CLI applies its flags on top with the `with_*` methods.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use termtalk_core::frame::{DEFAULT_MAX_FRAME_LEN, FRAME_OVERHEAD};
use termtalk_transport::SessionConfig;
use thiserror::Error;

use crate::admission::MAX_TRACKED_ADDRESSES;

/// Default bind address. Loopback only; binding every interface is opt-in.
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";

/// Default listening port.
pub const DEFAULT_PORT: u16 = 12345;

/// Default room lifetime in seconds.
pub const DEFAULT_TTL_SECS: u64 = 300;

/// Default open connections allowed from one address.
pub const DEFAULT_MAX_CONNECTIONS_PER_IP: usize = 5;

/// Default open connections allowed in total.
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Default admissions per address within one rate window.
pub const DEFAULT_RATE_LIMIT: usize = 10;

/// Default rate window in seconds.
pub const DEFAULT_RATE_WINDOW_SECS: u64 = 60;

/// Default handshake deadline in seconds.
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Default idle-read window in seconds.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

/// Default bound on one accept wait, in milliseconds.
pub const DEFAULT_ACCEPT_TIMEOUT_MS: u64 = 1000;

/// Default time teardown waits for members to leave, in seconds.
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 5;

/// Longest room lifetime accepted, in seconds (one day).
pub const MAX_TTL_SECS: u64 = 86_400;

/// Longest handshake, idle or drain timeout accepted, in seconds.
pub const MAX_TIMEOUT_SECS: u64 = 3_600;

/// Longest accept wait accepted, in milliseconds.
pub const MAX_ACCEPT_TIMEOUT_MS: u64 = 60_000;

/// Errors loading or validating a [`HostConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// Path that was read.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Host settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    /// Address to listen on.
    pub bind_address: String,
    /// Port to listen on. `0` picks a free port.
    pub port: u16,
    /// Room lifetime in seconds.
    pub ttl_secs: u64,
    /// Open connections allowed from one address.
    pub max_connections_per_ip: usize,
    /// Open connections allowed in total.
    pub max_connections: usize,
    /// Admissions allowed per address within `rate_window_secs`.
    pub rate_limit: usize,
    /// Length of the sliding rate window in seconds.
    pub rate_window_secs: u64,
    /// Handshake deadline in seconds.
    pub handshake_timeout_secs: u64,
    /// Idle-read window in seconds.
    pub idle_timeout_secs: u64,
    /// Bound on one accept wait, in milliseconds.
    pub accept_timeout_ms: u64,
    /// Time teardown waits for members to leave, in seconds.
    pub drain_timeout_secs: u64,
    /// Ceiling for one decoded frame, in bytes.
    pub max_frame_len: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            ttl_secs: DEFAULT_TTL_SECS,
            max_connections_per_ip: DEFAULT_MAX_CONNECTIONS_PER_IP,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            rate_limit: DEFAULT_RATE_LIMIT,
            rate_window_secs: DEFAULT_RATE_WINDOW_SECS,
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            accept_timeout_ms: DEFAULT_ACCEPT_TIMEOUT_MS,
            drain_timeout_secs: DEFAULT_DRAIN_TIMEOUT_SECS,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl HostConfig {
    /// Parse from TOML text and validate.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_address.trim().is_empty() {
            return Err(ConfigError::Invalid("bind_address must not be empty"));
        }
        if self.ttl_secs == 0 || self.ttl_secs > MAX_TTL_SECS {
            return Err(ConfigError::Invalid("ttl_secs must be between 1 and 86400"));
        }
        if self.max_connections_per_ip == 0 || self.max_connections == 0 {
            return Err(ConfigError::Invalid("connection ceilings must be positive"));
        }
        if self.max_connections_per_ip > self.max_connections {
            return Err(ConfigError::Invalid(
                "max_connections_per_ip must not exceed max_connections",
            ));
        }
        if self.max_connections > MAX_TRACKED_ADDRESSES {
            return Err(ConfigError::Invalid("max_connections is too large"));
        }
        if self.rate_limit == 0 || self.rate_window_secs == 0 {
            return Err(ConfigError::Invalid("rate limit and window must be positive"));
        }
        if self.rate_window_secs > MAX_TTL_SECS {
            return Err(ConfigError::Invalid("rate_window_secs must not exceed 86400"));
        }
        if self.handshake_timeout_secs == 0
            || self.idle_timeout_secs == 0
            || self.accept_timeout_ms == 0
        {
            return Err(ConfigError::Invalid("timeouts must be positive"));
        }
        if self.handshake_timeout_secs > MAX_TIMEOUT_SECS
            || self.idle_timeout_secs > MAX_TIMEOUT_SECS
            || self.drain_timeout_secs > MAX_TIMEOUT_SECS
            || self.accept_timeout_ms > MAX_ACCEPT_TIMEOUT_MS
        {
            return Err(ConfigError::Invalid("timeouts must not exceed one hour"));
        }
        if self.max_frame_len <= FRAME_OVERHEAD {
            return Err(ConfigError::Invalid("max_frame_len must exceed frame overhead"));
        }
        Ok(())
    }

    /// Set the bind address.
    pub fn with_bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = address.into();
        self
    }

    /// Set the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the room lifetime.
    pub fn with_ttl_secs(mut self, secs: u64) -> Self {
        self.ttl_secs = secs;
        self
    }

    /// Set the per-address and global connection ceilings.
    pub fn with_connection_limits(mut self, per_ip: usize, global: usize) -> Self {
        self.max_connections_per_ip = per_ip;
        self.max_connections = global;
        self
    }

    /// Set the rate limit.
    pub fn with_rate_limit(mut self, limit: usize, window_secs: u64) -> Self {
        self.rate_limit = limit;
        self.rate_window_secs = window_secs;
        self
    }

    /// Set the handshake and idle timeouts.
    pub fn with_session_timeouts(mut self, handshake_secs: u64, idle_secs: u64) -> Self {
        self.handshake_timeout_secs = handshake_secs;
        self.idle_timeout_secs = idle_secs;
        self
    }

    /// `host:port` to bind.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// Room lifetime.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Sliding rate window.
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }

    /// Bound on one accept wait.
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    /// Time teardown waits for members to leave.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Per-session settings derived from this config.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::default()
            .with_handshake_timeout(Duration::from_secs(self.handshake_timeout_secs))
            .with_idle_timeout(Duration::from_secs(self.idle_timeout_secs))
            .with_max_frame_len(self.max_frame_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = HostConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_address(), "127.0.0.1:12345");
        assert_eq!(config.ttl(), Duration::from_secs(300));
        assert_eq!(config.rate_window(), Duration::from_secs(60));
    }

    #[test]
    fn test_partial_toml() {
        let config = HostConfig::from_toml_str(
            r#"
            port = 4000
            ttl_secs = 30
            max_connections_per_ip = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.ttl_secs, 30);
        assert_eq!(config.max_connections_per_ip, 2);
        assert_eq!(config.rate_limit, DEFAULT_RATE_LIMIT);
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(matches!(
            HostConfig::from_toml_str("colour = \"red\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_invalid_values() {
        let cases = [
            HostConfig::default().with_ttl_secs(0),
            HostConfig::default().with_connection_limits(0, 10),
            HostConfig::default().with_connection_limits(10, 5),
            HostConfig::default().with_rate_limit(0, 60),
            HostConfig::default().with_session_timeouts(0, 10),
            HostConfig::default().with_bind_address(" "),
            HostConfig::default().with_ttl_secs(u64::MAX),
            HostConfig::default().with_ttl_secs(MAX_TTL_SECS + 1),
            HostConfig::default().with_session_timeouts(10, u64::MAX),
            HostConfig::default().with_session_timeouts(u64::MAX, 10),
            HostConfig::default().with_rate_limit(10, u64::MAX),
            HostConfig::default().with_connection_limits(5, MAX_TRACKED_ADDRESSES + 1),
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid(_))),
                "{:?}",
                config
            );
        }
    }

    #[test]
    fn test_upper_bounds_are_inclusive() {
        let config = HostConfig::default()
            .with_ttl_secs(MAX_TTL_SECS)
            .with_session_timeouts(MAX_TIMEOUT_SECS, MAX_TIMEOUT_SECS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_oversized_ttl_in_toml_rejected() {
        assert!(matches!(
            HostConfig::from_toml_str("ttl_secs = 86401"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_session_config() {
        let session = HostConfig::default()
            .with_session_timeouts(3, 7)
            .session_config();
        assert_eq!(session.handshake_timeout, Duration::from_secs(3));
        assert_eq!(session.idle_timeout, Duration::from_secs(7));
        assert_eq!(session.max_frame_len, DEFAULT_MAX_FRAME_LEN);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            HostConfig::load("/nonexistent/termtalk.toml"),
            Err(ConfigError::Read { .. })
        ));
    }
}
