//! Bridge configuration

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use crate::protocol::{
    TargetMatcher, DEFAULT_ACK_WATCHDOG_MS, DEFAULT_BAUD_RATE, DISCOVERY_RETRY_MS,
    READY_TIMEOUT_MS, RECONNECT_DELAY_MS,
};

/// Serial bridge settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Baud rate of the controller link
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Always use this port instead of vendor matching
    #[serde(default)]
    pub port: Option<String>,

    /// Discovery poll interval while no device is found
    #[serde(default = "default_discovery_interval_ms")]
    pub discovery_interval_ms: u64,

    /// Wait before re-scanning after a device was lost
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Give up on a port that never reports ready and re-scan
    /// (`null` waits forever)
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: Option<u64>,

    /// Release the SMS queue if no terminal event arrives in time
    /// (`null` waits forever)
    #[serde(default = "default_ack_watchdog_ms")]
    pub ack_watchdog_ms: Option<u64>,

    /// Prefix stripped from phone numbers before sending
    #[serde(default = "default_country_code")]
    pub country_code: String,

    /// Extra descriptor substrings that identify the controller
    #[serde(default)]
    pub extra_match_patterns: Vec<String>,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_discovery_interval_ms() -> u64 {
    DISCOVERY_RETRY_MS
}

fn default_reconnect_delay_ms() -> u64 {
    RECONNECT_DELAY_MS
}

fn default_ready_timeout_ms() -> Option<u64> {
    Some(READY_TIMEOUT_MS)
}

fn default_ack_watchdog_ms() -> Option<u64> {
    Some(DEFAULT_ACK_WATCHDOG_MS)
}

fn default_country_code() -> String {
    "+91".to_string()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            port: None,
            discovery_interval_ms: default_discovery_interval_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            ready_timeout_ms: default_ready_timeout_ms(),
            ack_watchdog_ms: default_ack_watchdog_ms(),
            country_code: default_country_code(),
            extra_match_patterns: Vec::new(),
        }
    }
}

impl BridgeConfig {
    /// Load from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Save as pretty JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, content)
    }

    /// Interval between discovery polls
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    /// Pause before re-scanning after a loss
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Ready marker timeout, if enabled
    pub fn ready_timeout(&self) -> Option<Duration> {
        self.ready_timeout_ms.map(Duration::from_millis)
    }

    /// SMS ack watchdog, if enabled
    pub fn ack_watchdog(&self) -> Option<Duration> {
        self.ack_watchdog_ms.map(Duration::from_millis)
    }

    /// Port matcher for discovery
    pub fn matcher(&self) -> TargetMatcher {
        TargetMatcher::default()
            .with_patterns(&self.extra_match_patterns)
            .pinned(self.port.clone())
    }
}
