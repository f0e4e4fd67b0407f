//! # Configuration
//!
//! TOML configuration for the gateway engine, loaded once at startup.
//!
//! - [`MeshConfig`] - MySensors serial gateway discovery and handshake
//! - [`ModemConfig`] - GSM modem port and initialization timing
//! - [`SettingsConfig`] - where persisted settings (last port, verbosity) live
//! - [`LoggingConfig`] - log level and optional log file
//!
//! ```toml
//! [mesh]
//! baud_rate = 115200
//! reserved_ports = ["ttyAMA0"]
//! handshake_marker = "Gateway startup complete"
//!
//! [modem]
//! enabled = true
//! port_pattern = "ttyAMA0"
//! baud_rate = 9600
//!
//! [settings]
//! dir = "./data/settings"
//!
//! [logging]
//! level = "info"
//! file = "homegate.log"
//! ```
//!
//! Every field has a default, so a partial file (or an empty one) is valid. The
//! protocol timings the devices depend on (retry counts, ack spacing, AT phase
//! timeouts) are fixed in code and deliberately absent here.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mesh: MeshConfig,
    #[serde(default)]
    pub modem: ModemConfig,
    #[serde(default)]
    pub settings: SettingsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub baud_rate: u32,
    /// Port name fragments never probed for the mesh gateway (the modem UART).
    pub reserved_ports: Vec<String>,
    /// Text the gateway prints once booted; matched case-insensitively.
    pub handshake_marker: String,
    pub handshake_timeout_ms: u64,
    /// Delay before the second discovery when the first one at startup fails.
    pub cold_start_backoff_ms: u64,
    /// Delay before rediscovery after a handshake timeout or lost link.
    pub reconnect_backoff_ms: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115200,
            reserved_ports: vec!["ttyAMA0".to_string()],
            handshake_marker: "Gateway startup complete".to_string(),
            handshake_timeout_ms: 5000,
            cold_start_backoff_ms: 8000,
            reconnect_backoff_ms: 17000,
        }
    }
}

impl MeshConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
    pub fn cold_start_backoff(&self) -> Duration {
        Duration::from_millis(self.cold_start_backoff_ms)
    }
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
    pub fn is_reserved(&self, port_name: &str) -> bool {
        self.reserved_ports
            .iter()
            .any(|r| !r.is_empty() && port_name.contains(r.as_str()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModemConfig {
    pub enabled: bool,
    /// The modem is opened on every available port whose name contains this.
    pub port_pattern: String,
    pub baud_rate: u32,
    /// Time the modem needs after the port opens before it accepts AT commands.
    pub init_delay_ms: u64,
    pub reconnect_backoff_ms: u64,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port_pattern: "ttyAMA0".to_string(),
            baud_rate: 9600,
            init_delay_ms: 4000,
            reconnect_backoff_ms: 30000,
        }
    }
}

impl ModemConfig {
    pub fn init_delay(&self) -> Duration {
        Duration::from_millis(self.init_delay_ms)
    }
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    pub dir: String,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            dir: "./data/settings".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("homegate.log".to_string()),
        }
    }
}

impl LoggingConfig {
    pub fn level_filter(&self) -> Option<log::LevelFilter> {
        self.level.parse().ok()
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.mesh.baud_rate, 115200);
        assert_eq!(cfg.mesh.handshake_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.modem.baud_rate, 9600);
        assert!(cfg.modem.enabled);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let cfg: Config = toml::from_str("[mesh]\nbaud_rate = 38400\n").unwrap();
        assert_eq!(cfg.mesh.baud_rate, 38400);
        assert_eq!(cfg.mesh.reconnect_backoff(), Duration::from_secs(17));
        assert_eq!(cfg.mesh.reserved_ports, vec!["ttyAMA0".to_string()]);
    }

    #[test]
    fn reserved_port_matching() {
        let mesh = MeshConfig::default();
        assert!(mesh.is_reserved("/dev/ttyAMA0"));
        assert!(!mesh.is_reserved("/dev/ttyUSB0"));
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.modem.port_pattern, "ttyAMA0");
        assert_eq!(back.logging.level_filter(), Some(log::LevelFilter::Info));
    }

    #[tokio::test]
    async fn load_reports_missing_file() {
        let err = Config::load("/nonexistent/homegate.toml").await.unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
