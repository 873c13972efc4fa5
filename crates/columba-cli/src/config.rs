//! Columba CLI Configuration
//!
//! A TOML file with two tables: `[service]` is handed to `initialize`
//! unchanged, `[simulation]` shapes the simulated mesh the CLI drives.
//! Missing keys fall back to defaults.

use std::path::Path;

use columba_core::ServiceConfig;
use serde::{Deserialize, Serialize};

use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// CLI Application Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliAppConfig {
    /// Configuration passed across the service boundary
    pub service: ServiceConfig,

    /// Behaviour of the simulated mesh
    pub simulation: SimulationConfig,
}

/// Shape of the simulated mesh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Number of propagation nodes announcing
    pub relays: u8,

    /// Interval between announce rounds (in milliseconds)
    pub announce_interval_ms: u64,

    /// Every this many rounds the hop counts rotate so a different relay wins
    pub churn_every_rounds: u32,

    /// Simulated engine bring-up latency (in milliseconds)
    pub engine_start_delay_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            relays: 4,
            announce_interval_ms: 500,
            churn_every_rounds: 4,
            engine_start_delay_ms: 250,
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Loading Logic
// ----------------------------------------------------------------------------

impl CliAppConfig {
    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: CliAppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        self.service.validate()?;

        if self.simulation.relays == 0 {
            return Err(CliError::Config(
                "At least one simulated relay is required".to_string(),
            ));
        }
        if self.simulation.announce_interval_ms == 0 {
            return Err(CliError::Config(
                "Announce interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CliAppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = CliAppConfig::from_toml(
            r#"
            [service.relay]
            debounce_ms = 250

            [simulation]
            relays = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.service.relay.debounce_ms, 250);
        assert_eq!(config.service.relay.cooldown_ms, 30_000);
        assert_eq!(config.simulation.relays, 2);
        assert_eq!(config.simulation.announce_interval_ms, 500);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(CliAppConfig::from_toml("[simulation]\nrelays = 0\n").is_err());
        assert!(CliAppConfig::from_toml("[service.poll]\nmin_interval_ms = 0\n").is_err());
        assert!(CliAppConfig::from_toml("[simulation\n").is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = CliAppConfig::default();
        let encoded = config.to_toml().unwrap();
        assert_eq!(CliAppConfig::from_toml(&encoded).unwrap(), config);
    }
}
