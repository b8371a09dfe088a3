//! Client configuration loaded from TOML.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::network::ConnectionInfo;
use crate::state::MonitorSettings;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Where the bridge listens.
    pub bridge: EndpointConfig,
    /// Socket and command timeouts.
    pub timeouts: TimeoutConfig,
    /// Device monitor tuning.
    pub monitor: MonitorConfig,
}

/// Bridge endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    /// Handshake key for connections that do not target a device.
    pub connect_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Hard timeout for shell and control commands.
    pub command_ms: u64,
    /// Timeout for file transfers and package installs.
    pub transfer_ms: u64,
    /// Pause after a connection reset before reading again.
    pub read_retry_backoff_ms: u64,
    /// Pause between partial sends.
    pub write_pacing_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Consecutive failed connects before the monitor gives up.
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub poll_interval_ms: u64,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8710,
            connect_key: String::new(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            command_ms: 40_000,
            transfer_ms: 120_000,
            read_retry_backoff_ms: 1_000,
            write_pacing_ms: 5,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            retry_delay_ms: 2_000,
            poll_interval_ms: 1_000,
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl BridgeConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_toml_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| BridgeError::Config(e.to_string()))
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> Result<()> {
        let text = Self::default().to_toml_string()?;
        std::fs::write(path, text).map_err(|e| BridgeError::local(path, e))
    }

    // ── Derived values ───────────────────────────────────────────

    /// Endpoint with the configured socket tunables applied.
    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo::new(&self.bridge.host, self.bridge.port)
            .with_pacing(Duration::from_millis(self.timeouts.write_pacing_ms))
            .with_reset_backoff(Duration::from_millis(self.timeouts.read_retry_backoff_ms))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.command_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.transfer_ms)
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            max_attempts: self.monitor.max_attempts.max(1),
            retry_delay: Duration::from_millis(self.monitor.retry_delay_ms),
            poll_interval: Duration::from_millis(self.monitor.poll_interval_ms),
            timeout: self.command_timeout(),
            connect_key: self.bridge.connect_key.clone(),
            ..MonitorSettings::default()
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
