//! Configuration
//!
//! Reconnect backoff and server timeouts are operator-tunable rather than
//! hardcoded, so reconnection storms can be tamed without code changes.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Server-side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP port to bind. 0 picks an ephemeral port.
    pub bind_port: u16,
    /// Interval between server pings to every connection.
    pub heartbeat_interval_ms: u64,
    /// A connection whose socket yields no frame within this window is
    /// forcibly disconnected and purged from all room membership. Clients
    /// apply the same window to server silence before reconnecting, so it
    /// must exceed the heartbeat interval.
    pub connection_timeout_ms: u64,
    /// A send with no server echo after this long is settled as failed.
    pub send_timeout_ms: u64,
    /// Consecutive store failures before room members are told the service
    /// is degraded.
    pub degraded_threshold: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_port: 7340,
            heartbeat_interval_ms: 2000,
            connection_timeout_ms: 6000,
            send_timeout_ms: 5000,
            degraded_threshold: 3,
        }
    }
}

/// Client reconnect policy: exponential backoff with jitter, unlimited
/// attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Fraction of the nominal delay randomized in either direction,
    /// in `0.0..=1.0`.
    pub jitter_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter_factor: 0.5,
        }
    }
}

/// Top-level configuration file layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub reconnect: ReconnectConfig,
}

impl Config {
    /// Load and validate a TOML config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&raw).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.heartbeat_interval_ms == 0 {
            return Err(Error::Config("heartbeat_interval_ms must be positive".into()));
        }
        if self.server.connection_timeout_ms <= self.server.heartbeat_interval_ms {
            return Err(Error::Config(
                "connection_timeout_ms must exceed heartbeat_interval_ms".into(),
            ));
        }
        if self.server.send_timeout_ms == 0 {
            return Err(Error::Config("send_timeout_ms must be positive".into()));
        }
        if self.reconnect.base_delay_ms == 0 {
            return Err(Error::Config("base_delay_ms must be positive".into()));
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(Error::Config("multiplier must be at least 1.0".into()));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(Error::Config(
                "max_delay_ms must be at least base_delay_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter_factor) {
            return Err(Error::Config("jitter_factor must be in 0.0..=1.0".into()));
        }
        Ok(())
    }
}
