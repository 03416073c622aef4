use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{BlobError, BlobResult};

/// Default size of a single block in the log
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Number of full blocks a write session buffers before appending
pub const DEFAULT_MAX_BATCH_BLOCKS: usize = 16;

/// Configuration for blob operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobConfig {
    /// Size of every block except possibly the last block of a blob
    pub block_size: usize,

    /// Full blocks accumulated by a write session before one append call
    pub max_batch_blocks: usize,

    /// Read-ahead behaviour of read pipelines
    pub prefetch: PrefetchConfig,

    /// Decay window of the monitor speed estimator
    #[serde(with = "duration_millis")]
    pub speed_window: Duration,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_batch_blocks: DEFAULT_MAX_BATCH_BLOCKS,
            prefetch: PrefetchConfig::default(),
            speed_window: Duration::from_secs(5),
        }
    }
}

/// Rules for the read-ahead window of a read pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Disable to never issue background downloads
    pub enabled: bool,

    /// Max blocks that may be missing and in flight at once
    pub max: u64,

    /// Hint to the log that access is sequential
    pub linear: bool,

    /// Fraction of the blob the window may run ahead of the cursor
    pub read_ahead_ratio: f64,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max: 64,
            linear: true,
            read_ahead_ratio: 0.05,
        }
    }
}

impl BlobConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON document; missing fields fall back to defaults
    pub fn from_json(json: &str) -> BlobResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Set block size
    pub fn with_block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    /// Set how many blocks a write session batches per append
    pub fn with_max_batch_blocks(mut self, blocks: usize) -> Self {
        self.max_batch_blocks = blocks;
        self
    }

    /// Set prefetch rules
    pub fn with_prefetch(mut self, prefetch: PrefetchConfig) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Set the decay window of the speed estimator
    pub fn with_speed_window(mut self, window: Duration) -> Self {
        self.speed_window = window;
        self
    }

    /// Reject values the pipelines cannot work with
    pub fn validate(&self) -> BlobResult<()> {
        if self.block_size == 0 {
            return Err(BlobError::invalid("block_size must be greater than zero"));
        }
        if self.max_batch_blocks == 0 {
            return Err(BlobError::invalid(
                "max_batch_blocks must be greater than zero",
            ));
        }
        if self.speed_window.is_zero() {
            return Err(BlobError::invalid("speed_window must be non-zero"));
        }
        if !(0.0..=1.0).contains(&self.prefetch.read_ahead_ratio) {
            return Err(BlobError::invalid(
                "prefetch.read_ahead_ratio must be within 0.0..=1.0",
            ));
        }
        Ok(())
    }
}

impl PrefetchConfig {
    /// Create new prefetch rules
    pub fn new() -> Self {
        Self::default()
    }

    /// Never prefetch
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Set max missing blocks in flight
    pub fn with_max(mut self, max: u64) -> Self {
        self.max = max;
        self
    }

    /// Mark access as scattered rather than sequential
    pub fn scattered(mut self) -> Self {
        self.linear = false;
        self
    }

    /// Set read-ahead ratio
    pub fn with_read_ahead_ratio(mut self, ratio: f64) -> Self {
        self.read_ahead_ratio = ratio;
        self
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = BlobConfig::default();
        assert_eq!(config.block_size, 65536);
        assert_eq!(config.max_batch_blocks, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config = BlobConfig::from_json(r#"{ "block_size": 10, "prefetch": { "max": 4 } }"#)
            .unwrap();
        assert_eq!(config.block_size, 10);
        assert_eq!(config.max_batch_blocks, 16);
        assert_eq!(config.prefetch.max, 4);
        assert!(config.prefetch.linear);
        assert_eq!(config.speed_window, Duration::from_secs(5));
    }

    #[test]
    fn zero_block_size_is_rejected() {
        let err = BlobConfig::from_json(r#"{ "block_size": 0 }"#).unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
        assert!(BlobConfig::new().with_max_batch_blocks(0).validate().is_err());
    }
}
