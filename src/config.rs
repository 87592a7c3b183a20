//! TOML configuration with defaults for every field.
//!
//! ```
//! use std::str::FromStr;
//! use trigstore::config::Config;
//!
//! let config = Config::from_str("[storage]\npath = \"/dev/nvme0n1\"").unwrap();
//! assert_eq!(config.storage.block_size, 1 << 20);
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::core::Timestamp;

/// Hard ceiling on in-flight capacity units.
pub const MAX_CONCURRENT_OPS_LIMIT: usize = 32_768;

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{field} = {value} must be a multiple of alignment {alignment}")]
    Misaligned {
        field: &'static str,
        value: u64,
        alignment: usize,
    },

    #[error("alignment {0} is not a power of two")]
    Alignment(usize),

    #[error("{field} = {value} out of range {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("block of {block_size} bytes needs {units} capacity units, only {capacity} configured")]
    BlockExceedsCapacity {
        block_size: usize,
        units: usize,
        capacity: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// io_uring.
    #[default]
    Uring,
    /// Synchronous `pwrite`/`pread`.
    Sync,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Target file or block device.
    pub path: PathBuf,
    pub block_size: usize,
    /// Reserved head region, never written.
    pub min_offset: u64,
    pub alignment: usize,
    pub max_concurrent_ops: usize,
    pub preferred_block_size: usize,
    pub direct_io: bool,
    pub driver: DriverKind,
    pub core_affinity_id: Option<usize>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("trigstore.bin"),
            block_size: 1 << 20,
            min_offset: 4096,
            alignment: 4096,
            max_concurrent_ops: 128,
            preferred_block_size: 65_536,
            direct_io: true,
            driver: DriverKind::Uring,
            core_affinity_id: None,
        }
    }
}

impl StorageConfig {
    fn units_for(&self, size: usize) -> usize {
        if size <= self.preferred_block_size {
            1
        } else {
            size.div_ceil(self.preferred_block_size)
        }
    }

    fn validate(&self) -> Result<()> {
        let alignment = self.alignment;
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(ConfigError::Alignment(alignment));
        }

        for (field, value) in [
            ("block_size", self.block_size as u64),
            ("min_offset", self.min_offset),
            ("preferred_block_size", self.preferred_block_size as u64),
        ] {
            if value % alignment as u64 != 0 {
                return Err(ConfigError::Misaligned {
                    field,
                    value,
                    alignment,
                });
            }
        }

        if self.block_size == 0 || self.block_size as u64 > u32::MAX as u64 {
            return Err(ConfigError::OutOfRange {
                field: "block_size",
                value: self.block_size as u64,
                min: alignment as u64,
                max: u32::MAX as u64,
            });
        }
        if self.preferred_block_size == 0 {
            return Err(ConfigError::OutOfRange {
                field: "preferred_block_size",
                value: 0,
                min: alignment as u64,
                max: u32::MAX as u64,
            });
        }
        if self.max_concurrent_ops == 0 || self.max_concurrent_ops > MAX_CONCURRENT_OPS_LIMIT {
            return Err(ConfigError::OutOfRange {
                field: "max_concurrent_ops",
                value: self.max_concurrent_ops as u64,
                min: 1,
                max: MAX_CONCURRENT_OPS_LIMIT as u64,
            });
        }

        let units = self.units_for(self.block_size);
        if units > self.max_concurrent_ops {
            return Err(ConfigError::BlockExceedsCapacity {
                block_size: self.block_size,
                units,
                capacity: self.max_concurrent_ops,
            });
        }
        Ok(())
    }

    #[cfg(all(feature = "persistence", target_os = "linux"))]
    pub fn writer_config(&self) -> crate::core::persistence::WriterConfig {
        use crate::core::persistence::{EngineConfig, WriterConfig};

        WriterConfig {
            path: self.path.clone(),
            block_size: self.block_size,
            min_offset: self.min_offset,
            direct_io: self.direct_io,
            engine: EngineConfig {
                max_concurrent_ops: self.max_concurrent_ops,
                preferred_block_size: self.preferred_block_size,
                alignment: self.alignment,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    /// Maximum decision age, in timestamp ticks, before eviction.
    pub staleness_threshold: Timestamp,
    /// Decisions popped per cycle.
    pub decision_batch: usize,
    /// Fragments popped per cycle.
    pub fragment_batch: usize,
    /// Fragments kept while waiting for their decision. The oldest goes first.
    pub max_held_fragments: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            staleness_threshold: 62_500_000,
            decision_batch: 16,
            fragment_batch: 256,
            max_held_fragments: 4096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub queue_timeout_ms: u64,
    pub record_queue_capacity: usize,
    pub progress_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_timeout_ms: 100,
            record_queue_capacity: 1024,
            progress_interval_secs: 5,
        }
    }
}

impl PipelineConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub correlator: CorrelatorConfig,
    pub pipeline: PipelineConfig,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;

        for (field, value) in [
            ("decision_batch", self.correlator.decision_batch),
            ("fragment_batch", self.correlator.fragment_batch),
            ("max_held_fragments", self.correlator.max_held_fragments),
            ("record_queue_capacity", self.pipeline.record_queue_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::OutOfRange {
                    field,
                    value: 0,
                    min: 1,
                    max: u64::MAX,
                });
            }
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.storage.block_size, 1_048_576);
        assert_eq!(config.storage.min_offset, 4096);
        assert_eq!(config.storage.max_concurrent_ops, 128);
        assert_eq!(config.storage.driver, DriverKind::Uring);
        assert_eq!(config.pipeline.progress_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_full_config() {
        let config = Config::from_str(
            r#"
            [storage]
            path = "/dev/nvme1n1"
            block_size = 65536
            min_offset = 8192
            max_concurrent_ops = 64
            preferred_block_size = 16384
            direct_io = false
            driver = "sync"
            core_affinity_id = 3

            [correlator]
            staleness_threshold = 1000
            decision_batch = 4
            fragment_batch = 32

            [pipeline]
            queue_timeout_ms = 10
            record_queue_capacity = 8
            progress_interval_secs = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.storage.path, PathBuf::from("/dev/nvme1n1"));
        assert_eq!(config.storage.driver, DriverKind::Sync);
        assert_eq!(config.storage.core_affinity_id, Some(3));
        assert_eq!(config.correlator.staleness_threshold, 1000);
        assert_eq!(config.pipeline.queue_timeout(), Duration::from_millis(10));
    }

    #[test]
    fn test_misaligned_block_rejected() {
        let err = Config::from_str("[storage]\nblock_size = 5000").unwrap_err();
        assert!(matches!(err, ConfigError::Misaligned { field: "block_size", .. }));

        let err = Config::from_str("[storage]\nmin_offset = 100").unwrap_err();
        assert!(matches!(err, ConfigError::Misaligned { field: "min_offset", .. }));
    }

    #[test]
    fn test_bad_alignment_rejected() {
        let err = Config::from_str("[storage]\nalignment = 3000").unwrap_err();
        assert!(matches!(err, ConfigError::Alignment(3000)));
    }

    #[test]
    fn test_capacity_bounds() {
        let err = Config::from_str("[storage]\nmax_concurrent_ops = 0").unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { field: "max_concurrent_ops", .. }));

        // 1 MiB at 4 KiB units needs 256 units.
        let err = Config::from_str("[storage]\nmax_concurrent_ops = 128\npreferred_block_size = 4096")
            .unwrap_err();
        assert!(matches!(err, ConfigError::BlockExceedsCapacity { units: 256, .. }));

        let err = Config::from_str("[correlator]\nmax_held_fragments = 0").unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { field: "max_held_fragments", .. }));
        assert_eq!(Config::default().correlator.max_held_fragments, 4096);
    }

    #[test]
    fn test_unknown_driver_rejected() {
        assert!(matches!(
            Config::from_str("[storage]\ndriver = \"aio\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/trigstore.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
