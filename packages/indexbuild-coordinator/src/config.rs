//! Coordinator configuration
//!
//! Loaded from YAML; every field has a default so an empty document is valid.
//!
//! ```yaml
//! scan_chunk_size: 1000
//! yield_every_chunks: 1
//! event_channel_capacity: 1024
//! conflict:
//!   wait_timeout_ms: 0
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const MIN_SCAN_CHUNK_SIZE: usize = 1;
pub const MAX_SCAN_CHUNK_SIZE: usize = 100_000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{field} = {value} out of range [{min}, {max}]")]
    Range {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// What the replication applier does when an incoming build collides with a live one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConflictPolicy {
    /// How long to wait for the colliding build to retire before halting.
    /// `0` halts on the first conflict.
    pub wait_timeout_ms: u64,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self { wait_timeout_ms: 0 }
    }
}

impl ConflictPolicy {
    pub fn immediate() -> Self {
        Self::default()
    }

    pub fn wait_for(timeout: Duration) -> Self {
        Self {
            wait_timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// Documents per scan chunk; interrupts are observed between chunks
    pub scan_chunk_size: usize,
    /// Yield to the runtime after this many chunks
    pub yield_every_chunks: u32,
    /// Capacity of the registry event broadcast channel
    pub event_channel_capacity: usize,
    pub conflict: ConflictPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            scan_chunk_size: 1000,
            yield_every_chunks: 1,
            event_channel_capacity: 1024,
            conflict: ConflictPolicy::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }

    pub fn with_scan_chunk_size(mut self, size: usize) -> Self {
        self.scan_chunk_size = size;
        self
    }

    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict = policy;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range(
            "scan_chunk_size",
            self.scan_chunk_size as u64,
            MIN_SCAN_CHUNK_SIZE as u64,
            MAX_SCAN_CHUNK_SIZE as u64,
        )?;
        check_range(
            "yield_every_chunks",
            self.yield_every_chunks as u64,
            1,
            u32::MAX as u64,
        )?;
        check_range(
            "event_channel_capacity",
            self.event_channel_capacity as u64,
            1,
            1 << 20,
        )?;
        check_range(
            "conflict.wait_timeout_ms",
            self.conflict.wait_timeout_ms,
            0,
            3_600_000,
        )?;
        Ok(())
    }
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::Range {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}
