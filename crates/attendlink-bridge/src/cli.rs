use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use attendlink_core::config::BridgeConfig;
use attendlink_core::firmware::SimulatorConfig;
use clap::Parser;

/// Serial bridge for the biometric attendance controller.
///
/// Reads JSON-lines requests on stdin and writes status, responses and
/// errors as JSON lines on stdout. Logs go to stderr.
#[derive(Parser, Debug)]
#[command(name = "attendlink-bridge", version, about)]
pub struct Cli {
    /// Bridge settings (JSON)
    #[arg(long, value_name = "JSON")]
    pub config: Option<PathBuf>,

    /// Serial port to use instead of vendor matching
    #[arg(long, value_name = "PATH")]
    pub port: Option<String>,

    /// Serial baud rate
    #[arg(long, value_name = "N")]
    pub baud: Option<u32>,

    /// Talk to a simulated controller instead of real hardware
    #[arg(long, default_value_t = false)]
    pub simulate: bool,

    /// Print the serial ports found and exit
    #[arg(long, default_value_t = false)]
    pub list_ports: bool,

    /// Random extra modem latency of the simulator, in milliseconds
    #[arg(long, default_value_t = 1500, requires = "simulate")]
    pub sim_jitter_ms: u64,
}

impl Cli {
    /// Config file (or defaults) with command line overrides applied
    pub fn bridge_config(&self) -> Result<BridgeConfig> {
        let mut config = match &self.config {
            Some(path) => BridgeConfig::load(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => BridgeConfig::default(),
        };
        if let Some(port) = &self.port {
            config.port = Some(port.clone());
        }
        if let Some(baud) = self.baud {
            config.baud_rate = baud;
        }
        Ok(config)
    }

    pub fn simulator_config(&self) -> SimulatorConfig {
        SimulatorConfig {
            modem_jitter: Duration::from_millis(self.sim_jitter_ms),
            ..SimulatorConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_overrides() {
        let cli = Cli::try_parse_from(["attendlink-bridge", "--port", "COM5", "--baud", "115200"])
            .unwrap();
        let config = cli.bridge_config().unwrap();
        assert_eq!(config.port.as_deref(), Some("COM5"));
        assert_eq!(config.baud_rate, 115200);
        assert_eq!(config.country_code, "+91");
    }

    #[test]
    fn test_missing_config_file() {
        let cli =
            Cli::try_parse_from(["attendlink-bridge", "--config", "/nonexistent/bridge.json"])
                .unwrap();
        let err = cli.bridge_config().unwrap_err();
        assert!(err.to_string().contains("failed to load config"));
    }

    #[test]
    fn test_jitter_requires_simulate() {
        assert!(Cli::try_parse_from(["attendlink-bridge", "--sim-jitter-ms", "10"]).is_err());
        let cli = Cli::try_parse_from(["attendlink-bridge", "--simulate"]).unwrap();
        assert_eq!(
            cli.simulator_config().modem_jitter,
            Duration::from_millis(1500)
        );
    }
}
