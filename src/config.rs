//! Runtime configuration for the sync pipeline.
//!
//! Defaults match the public exchange endpoints; every knob can be
//! overridden from the environment (`BOOKBOT_*`). Validation fails fast,
//! before any connection is attempted.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Depth limits the snapshot endpoint actually accepts.
const VALID_DEPTH_LIMITS: &[u32] = &[5, 10, 20, 50, 100, 500, 1000, 5000];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid market pair `{value}`: {reason}")]
    InvalidPair { value: String, reason: String },
    #[error("invalid {name} `{value}`: {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// How often the exchange pushes depth diffs on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateSpeed {
    /// One diff per second (`@depth`).
    #[default]
    Normal,
    /// One diff per 100 ms (`@depth@100ms`).
    Fast,
}

impl UpdateSpeed {
    /// Suffix appended to the depth stream name.
    pub fn stream_suffix(self) -> &'static str {
        match self {
            Self::Normal => "",
            Self::Fast => "@100ms",
        }
    }
}

impl FromStr for UpdateSpeed {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1000ms" | "1s" | "normal" => Ok(Self::Normal),
            "100ms" | "fast" => Ok(Self::Fast),
            other => Err(ConfigError::InvalidValue {
                name: "update speed",
                value: other.to_string(),
                reason: "expected `1000ms` or `100ms`".to_string(),
            }),
        }
    }
}

/// Configuration shared by every engine instance.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// REST endpoint base, e.g. `https://api.binance.com`.
    pub rest_base_url: String,
    /// Raw-stream endpoint base, e.g. `wss://stream.binance.com:9443/ws`.
    pub ws_base_url: String,
    /// Depth snapshot size.
    pub depth_limit: u32,
    /// Trade history page size for the baseline fetch.
    pub trade_limit: u32,
    /// Rolling trade history capacity.
    pub trade_capacity: usize,
    /// Depth stream push cadence.
    pub update_speed: UpdateSpeed,

    /// Max buffered updates while a snapshot is in flight. Overflow is
    /// treated as a continuity failure (full resync).
    pub max_buffer_len: usize,
    /// Pause between snapshot fetch attempts. 0 retries immediately.
    pub snapshot_retry_delay_ms: u64,

    // Transport timeouts
    pub connect_timeout_ms: u64,
    pub ping_interval_ms: u64,
    pub pong_timeout_ms: u64,
    /// A stream that stays silent this long is closed and resynced.
    pub stale_stream_timeout_ms: u64,

    // Reconnect backoff
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,

    /// Reachability probe cadence.
    pub probe_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            rest_base_url: "https://api.binance.com".to_string(),
            ws_base_url: "wss://stream.binance.com:9443/ws".to_string(),
            depth_limit: 500,
            trade_limit: 80,
            trade_capacity: 100,
            update_speed: UpdateSpeed::Normal,

            max_buffer_len: 10_000,
            snapshot_retry_delay_ms: 250,

            connect_timeout_ms: 10_000,
            ping_interval_ms: 30_000,
            pong_timeout_ms: 10_000,
            stale_stream_timeout_ms: 30_000,

            // 100ms base, 2x multiplier, 30s cap, ±30% jitter
            backoff_base_ms: 100,
            backoff_max_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.3,

            probe_interval_ms: 5_000,
        }
    }
}

impl SyncConfig {
    /// Load from environment with defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("BOOKBOT_REST_BASE_URL") {
            config.rest_base_url = v;
        }
        if let Ok(v) = std::env::var("BOOKBOT_WS_BASE_URL") {
            config.ws_base_url = v;
        }
        if let Ok(v) = std::env::var("BOOKBOT_DEPTH_LIMIT") {
            config.depth_limit = v.parse().unwrap_or(config.depth_limit);
        }
        if let Ok(v) = std::env::var("BOOKBOT_TRADE_LIMIT") {
            config.trade_limit = v.parse().unwrap_or(config.trade_limit);
        }
        if let Ok(v) = std::env::var("BOOKBOT_TRADE_CAPACITY") {
            config.trade_capacity = v.parse().unwrap_or(config.trade_capacity);
        }
        if let Ok(v) = std::env::var("BOOKBOT_UPDATE_SPEED") {
            config.update_speed = v.parse().unwrap_or(config.update_speed);
        }
        if let Ok(v) = std::env::var("BOOKBOT_MAX_BUFFER_LEN") {
            config.max_buffer_len = v.parse().unwrap_or(config.max_buffer_len);
        }
        if let Ok(v) = std::env::var("BOOKBOT_SNAPSHOT_RETRY_DELAY_MS") {
            config.snapshot_retry_delay_ms = v.parse().unwrap_or(config.snapshot_retry_delay_ms);
        }
        if let Ok(v) = std::env::var("BOOKBOT_CONNECT_TIMEOUT_MS") {
            config.connect_timeout_ms = v.parse().unwrap_or(config.connect_timeout_ms);
        }
        if let Ok(v) = std::env::var("BOOKBOT_PING_INTERVAL_MS") {
            config.ping_interval_ms = v.parse().unwrap_or(config.ping_interval_ms);
        }
        if let Ok(v) = std::env::var("BOOKBOT_PONG_TIMEOUT_MS") {
            config.pong_timeout_ms = v.parse().unwrap_or(config.pong_timeout_ms);
        }
        if let Ok(v) = std::env::var("BOOKBOT_STALE_STREAM_TIMEOUT_MS") {
            config.stale_stream_timeout_ms = v.parse().unwrap_or(config.stale_stream_timeout_ms);
        }
        if let Ok(v) = std::env::var("BOOKBOT_BACKOFF_BASE_MS") {
            config.backoff_base_ms = v.parse().unwrap_or(config.backoff_base_ms);
        }
        if let Ok(v) = std::env::var("BOOKBOT_BACKOFF_MAX_MS") {
            config.backoff_max_ms = v.parse().unwrap_or(config.backoff_max_ms);
        }
        if let Ok(v) = std::env::var("BOOKBOT_PROBE_INTERVAL_MS") {
            config.probe_interval_ms = v.parse().unwrap_or(config.probe_interval_ms);
        }

        config
    }

    /// Reject values the exchange or the engine cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !VALID_DEPTH_LIMITS.contains(&self.depth_limit) {
            return Err(ConfigError::InvalidValue {
                name: "depth limit",
                value: self.depth_limit.to_string(),
                reason: format!("must be one of {VALID_DEPTH_LIMITS:?}"),
            });
        }
        if self.trade_limit == 0 || self.trade_limit > 1000 {
            return Err(ConfigError::InvalidValue {
                name: "trade limit",
                value: self.trade_limit.to_string(),
                reason: "must be between 1 and 1000".to_string(),
            });
        }
        if self.trade_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                name: "trade capacity",
                value: self.trade_capacity.to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.max_buffer_len == 0 {
            return Err(ConfigError::InvalidValue {
                name: "buffer length",
                value: self.max_buffer_len.to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    pub fn stale_stream_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_stream_timeout_ms)
    }

    pub fn snapshot_retry_delay(&self) -> Duration {
        Duration::from_millis(self.snapshot_retry_delay_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SyncConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_unsupported_depth_limit() {
        let config = SyncConfig {
            depth_limit: 42,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let config = SyncConfig {
            trade_capacity: 0,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_update_speed_parsing() {
        assert_eq!("100ms".parse::<UpdateSpeed>().unwrap(), UpdateSpeed::Fast);
        assert_eq!(
            "1000ms".parse::<UpdateSpeed>().unwrap(),
            UpdateSpeed::Normal
        );
        assert!("50ms".parse::<UpdateSpeed>().is_err());
    }

    #[test]
    fn test_stream_suffix() {
        assert_eq!(UpdateSpeed::Normal.stream_suffix(), "");
        assert_eq!(UpdateSpeed::Fast.stream_suffix(), "@100ms");
    }
}
