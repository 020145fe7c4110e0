//! Configuration Management
//!
//! Provides functionality for:
//! - Loading/saving the node configuration as YAML
//! - Validating HA timing invariants before a node starts
//! - Default configuration

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::FleetError;
use crate::ha::{HighAvailabilityMode, RetryPolicy};
use crate::rebind::{RebindOptions, TransformerKind};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Stable node id; a random one is generated when absent
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaConfig {
    #[serde(default)]
    pub mode: HighAvailabilityMode,
    /// How often this node writes its heartbeat
    #[serde(default = "default_heartbeat_period_ms")]
    pub heartbeat_period_ms: u64,
    /// How often peers, the master claim and snapshots are read
    #[serde(default = "default_poll_period_ms")]
    pub poll_period_ms: u64,
    /// Silence after which a master is considered dead
    #[serde(default = "default_detection_timeout_ms")]
    pub detection_timeout_ms: u64,
    #[serde(default)]
    pub publish_retry: RetryPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RebindConfig {
    /// Transformers applied, in order, to every snapshot before rebind
    #[serde(default)]
    pub transformers: Vec<TransformerKind>,
    #[serde(default)]
    pub prune_orphaned_locations: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for the JSON log file; console only when absent
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_log_prefix")]
    pub file_prefix: String,
    /// Number of rotated log files to keep
    #[serde(default = "default_log_files")]
    pub files_to_keep: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub ha: HaConfig,
    #[serde(default)]
    pub rebind: RebindConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            mode: HighAvailabilityMode::default(),
            heartbeat_period_ms: default_heartbeat_period_ms(),
            poll_period_ms: default_poll_period_ms(),
            detection_timeout_ms: default_detection_timeout_ms(),
            publish_retry: RetryPolicy::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
            file_prefix: default_log_prefix(),
            files_to_keep: default_log_files(),
        }
    }
}

// Default value functions
fn default_heartbeat_period_ms() -> u64 { 1000 }
fn default_poll_period_ms() -> u64 { 1000 }
fn default_detection_timeout_ms() -> u64 { 5000 }
fn default_log_level() -> String { "info".to_string() }
fn default_log_prefix() -> String { "fleet".to_string() }
fn default_log_files() -> usize { 7 }

/// Smallest allowed detection timeout, in heartbeat periods
pub const MIN_DETECTION_MULTIPLE: u64 = 3;

impl HaConfig {
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms)
    }

    pub fn detection_timeout(&self) -> Duration {
        Duration::from_millis(self.detection_timeout_ms)
    }

    /// Checks the timing invariants failure detection relies on.
    pub fn validate(&self) -> Result<(), FleetError> {
        if self.heartbeat_period_ms == 0 || self.poll_period_ms == 0 {
            return Err(FleetError::config("heartbeat and poll periods must be non-zero"));
        }
        if self.detection_timeout_ms < MIN_DETECTION_MULTIPLE * self.heartbeat_period_ms {
            return Err(FleetError::config(format!(
                "detection_timeout_ms ({}) must be at least {}x heartbeat_period_ms ({})",
                self.detection_timeout_ms, MIN_DETECTION_MULTIPLE, self.heartbeat_period_ms
            )));
        }
        if self.poll_period_ms * 2 >= self.detection_timeout_ms {
            return Err(FleetError::config(format!(
                "poll_period_ms ({}) must be less than half of detection_timeout_ms ({})",
                self.poll_period_ms, self.detection_timeout_ms
            )));
        }
        if self.publish_retry.max_attempts == 0 {
            return Err(FleetError::config("publish_retry.max_attempts must be at least 1"));
        }
        Ok(())
    }
}

impl RebindConfig {
    pub fn options(&self) -> RebindOptions {
        RebindOptions {
            prune_orphaned_locations: self.prune_orphaned_locations,
        }
    }
}

impl Config {
    /// Load configuration from file; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, FleetError> {
        if !path.exists() {
            debug!("Configuration file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| FleetError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = serde_yaml::from_str(&contents)
            .map_err(|e| FleetError::Config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the first existing default location.
    pub fn discover() -> Result<Self, FleetError> {
        for path in Self::search_paths() {
            if path.exists() {
                return Self::load(&path);
            }
        }
        Ok(Config::default())
    }

    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("fleet.yml")];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("fleet").join("fleet.yml"));
        }
        paths.push(PathBuf::from("/etc/fleet/fleet.yml"));
        paths
    }

    pub fn validate(&self) -> Result<(), FleetError> {
        self.ha.validate()?;
        if self.logging.files_to_keep == 0 {
            return Err(FleetError::config("logging.files_to_keep must be at least 1"));
        }
        Ok(())
    }

    /// Save configuration to file, atomically via a temporary file
    pub fn save(&self, path: &Path) -> Result<(), FleetError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    FleetError::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }
        let contents = serde_yaml::to_string(&self)
            .map_err(|e| FleetError::Config(format!("Failed to serialize config: {}", e)))?;

        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, contents)
            .map_err(|e| FleetError::Config(format!("Failed to write config: {}", e)))?;
        fs::rename(&temp_path, path)
            .map_err(|e| FleetError::Config(format!("Failed to save config: {}", e)))?;
        Ok(())
    }

    /// Configured node id, or a fresh random one
    pub fn node_id(&self) -> String {
        self.node
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn detection_timeout_must_cover_three_heartbeats() {
        let ha = HaConfig {
            heartbeat_period_ms: 1000,
            detection_timeout_ms: 2500,
            poll_period_ms: 500,
            ..HaConfig::default()
        };
        assert!(matches!(ha.validate(), Err(FleetError::Config(_))));
    }

    #[test]
    fn poll_period_must_be_under_half_the_timeout() {
        let ha = HaConfig {
            poll_period_ms: 2500,
            ..HaConfig::default()
        };
        assert!(ha.validate().is_err());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("fleet.yml");
        let mut config = Config::default();
        config.node.id = Some("node-a".into());
        config.ha.mode = HighAvailabilityMode::HotStandby;
        config.rebind.transformers = vec![TransformerKind::DeleteOrphanedLocations];
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.node_id(), "node-a");
        assert_eq!(loaded.ha, config.ha);
        assert_eq!(loaded.rebind.transformers, config.rebind.transformers);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let config: Config = serde_yaml::from_str("ha:\n  mode: HOT_BACKUP\n").unwrap();
        assert_eq!(config.ha.mode, HighAvailabilityMode::HotBackup);
        assert_eq!(config.ha.heartbeat_period_ms, 1000);
        assert!(config.rebind.transformers.is_empty());
    }

    #[test]
    fn missing_file_uses_defaults() {
        let config = Config::load(Path::new("/nonexistent/fleet.yml")).unwrap();
        assert_eq!(config.ha.mode, HighAvailabilityMode::Auto);
    }
}
