//! Centralized Configuration Management
//!
//! All tunables of the service core live here. Every section has sensible
//! defaults plus named presets, and `ServiceConfig::validate` rejects
//! combinations the runtime cannot honour.

use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::errors::{ColumbaError, ColumbaResult};

// ----------------------------------------------------------------------------
// Poll Configuration
// ----------------------------------------------------------------------------

/// Bounds and growth rate of the adaptive engine poll interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Interval used while a consumer is active
    pub min_interval_ms: u64,
    /// Ceiling reached after repeated idle polls
    pub max_interval_ms: u64,
    /// Growth factor applied on every idle poll
    pub backoff_multiplier: f64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 2_000,
            max_interval_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl PollConfig {
    /// Slower polling for devices on battery saver
    pub fn battery_saver() -> Self {
        Self {
            min_interval_ms: 5_000,
            max_interval_ms: 120_000,
            backoff_multiplier: 2.0,
        }
    }

    /// Tight bounds so tests observe several polls quickly
    pub fn testing() -> Self {
        Self {
            min_interval_ms: 10,
            max_interval_ms: 80,
            backoff_multiplier: 2.0,
        }
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn validate(&self) -> ColumbaResult<()> {
        if self.min_interval_ms == 0 {
            return Err(ColumbaError::config_error("Poll min interval cannot be zero"));
        }
        if self.min_interval_ms > self.max_interval_ms {
            return Err(ColumbaError::config_error(
                "Poll min interval cannot exceed max interval",
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ColumbaError::config_error(
                "Poll backoff multiplier must be a finite value >= 1.0",
            ));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Relay Selection Configuration
// ----------------------------------------------------------------------------

/// Timing of the automatic relay selection state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySelectionConfig {
    /// Quiet period that batches bursts of candidate updates
    pub debounce_ms: u64,
    /// How long a selection stays STABLE before new batches are considered
    pub cooldown_ms: u64,
    /// Trailing window inspected by the loop detector
    pub loop_window_ms: u64,
    /// Selections within the window that trip the loop detector
    pub loop_threshold: usize,
    /// Backoff applied when the detector first trips
    pub base_backoff_ms: u64,
    /// Upper bound on loop backoff
    pub max_backoff_ms: u64,
    /// Upper bound on a single apply (engine + store write)
    pub apply_timeout_ms: u64,
    /// Capacity of the selection history ring buffer
    pub history_capacity: usize,
}

impl Default for RelaySelectionConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1_000,
            cooldown_ms: 30_000,
            loop_window_ms: 60_000,
            loop_threshold: 3,
            base_backoff_ms: 1_000,
            max_backoff_ms: 600_000,
            apply_timeout_ms: 15_000,
            history_capacity: 10,
        }
    }
}

impl RelaySelectionConfig {
    /// Short cooldown so loop detection can be exercised with paused time
    pub fn testing() -> Self {
        Self {
            debounce_ms: 100,
            cooldown_ms: 2_000,
            ..Self::default()
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn loop_window(&self) -> Duration {
        Duration::from_millis(self.loop_window_ms)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    pub fn validate(&self) -> ColumbaResult<()> {
        if self.loop_threshold == 0 {
            return Err(ColumbaError::config_error("Loop threshold cannot be zero"));
        }
        if self.history_capacity < self.loop_threshold {
            return Err(ColumbaError::config_error(
                "Selection history must hold at least loop_threshold entries",
            ));
        }
        if self.base_backoff_ms > self.max_backoff_ms {
            return Err(ColumbaError::config_error(
                "Base backoff cannot exceed max backoff",
            ));
        }
        if self.apply_timeout_ms == 0 {
            return Err(ColumbaError::config_error("Apply timeout cannot be zero"));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Lifecycle Configuration
// ----------------------------------------------------------------------------

/// Deadlines and resources of the background process lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Upper bound on engine bring-up
    pub startup_timeout_ms: u64,
    /// Upper bound on engine teardown, and on waiting for a previous teardown
    pub teardown_timeout_ms: u64,
    /// Exclusive resources held for the engine's lifetime
    pub exclusive_resources: Vec<String>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            startup_timeout_ms: 60_000,
            teardown_timeout_ms: 10_000,
            exclusive_resources: vec!["multicast_lock".to_string(), "wake_lock".to_string()],
        }
    }
}

impl LifecycleConfig {
    pub fn testing() -> Self {
        Self {
            startup_timeout_ms: 2_000,
            teardown_timeout_ms: 2_000,
            ..Self::default()
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Engine Configuration
// ----------------------------------------------------------------------------

/// Network interface the engine should bring up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InterfaceConfig {
    /// Local link auto-discovery
    Auto { group_id: Option<String> },
    /// Outbound TCP connection to a transport node
    TcpClient { host: String, port: u16 },
    /// Bluetooth LE mesh
    Ble { max_connections: u8 },
}

/// Configuration handed to the engine at bring-up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding engine state and identities
    pub storage_path: String,
    /// Name announced with our delivery destination
    pub display_name: String,
    pub interfaces: Vec<InterfaceConfig>,
    /// Announce our delivery destination right after bring-up
    pub announce_on_start: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_path: "columba".to_string(),
            display_name: "Columba".to_string(),
            interfaces: vec![InterfaceConfig::Auto { group_id: None }],
            announce_on_start: true,
        }
    }
}

// ----------------------------------------------------------------------------
// Service Configuration
// ----------------------------------------------------------------------------

/// Complete configuration accepted by `initialize`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub engine: EngineConfig,
    pub poll: PollConfig,
    pub relay: RelaySelectionConfig,
    pub lifecycle: LifecycleConfig,
}

impl ServiceConfig {
    /// Configuration tuned for fast, deterministic tests
    pub fn testing() -> Self {
        Self {
            engine: EngineConfig {
                storage_path: "/tmp/columba-test".to_string(),
                announce_on_start: false,
                ..EngineConfig::default()
            },
            poll: PollConfig::testing(),
            relay: RelaySelectionConfig::testing(),
            lifecycle: LifecycleConfig::testing(),
        }
    }

    /// Parse a configuration crossing the call boundary as JSON
    pub fn from_json(json: &str) -> ColumbaResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> ColumbaResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn validate(&self) -> ColumbaResult<()> {
        self.poll.validate()?;
        self.relay.validate()?;
        if self.engine.interfaces.is_empty() {
            return Err(ColumbaError::config_error(
                "At least one interface must be configured",
            ));
        }
        Ok(())
    }
}
