//! Heap and cache configuration
//!
//! Both structs deserialize from TOML with every field optional:
//!
//! ```toml
//! max_size = 1048576
//! allocation_retries = 10
//! eviction_slack = 0.2
//!
//! [heap]
//! handle_growth = 64
//! verify_guards = true
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Largest payload a block header can describe.
pub const MAX_BLOCK_SIZE: usize = i32::MAX as usize;

/// Largest heap capacity whose arena still fits in one block header.
pub const MAX_HEAP_CAPACITY: usize = MAX_BLOCK_SIZE - (MAX_BLOCK_SIZE >> 10);

/// Tuning knobs for a [`Heap`](crate::allocator::Heap)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapConfig {
    /// Number of handle slots added each time the handle table is full
    pub handle_growth: usize,

    /// Smallest payload worth carving into a separate free block when splitting
    pub min_split_payload: usize,

    /// Check header/footer guard words on lock and deallocate
    pub verify_guards: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        HeapConfig {
            handle_growth: 64,
            min_split_payload: 128,
            verify_guards: true,
        }
    }
}

impl HeapConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.handle_growth == 0 {
            return Err(ConfigError::Invalid(
                "handle_growth must be greater than zero".to_string(),
            ));
        }

        if self.min_split_payload > MAX_BLOCK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "min_split_payload ({}) exceeds maximum block size",
                self.min_split_payload
            )));
        }

        Ok(())
    }
}

/// Configuration for a [`Cache`](crate::cache::Cache)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Upper bound on the summed size of cached resources, also the heap capacity
    pub max_size: usize,

    /// Allocation attempts made on a miss before falling back to a full flush
    pub allocation_retries: u32,

    /// Fraction of the resource size added to the eviction target per retry
    pub retry_growth: f64,

    /// Fraction of the current cache size evicted on top of the request
    pub eviction_slack: f64,

    /// Entry slots reserved up front
    pub initial_entries: usize,

    /// Entry slots added when the entry array fills up
    pub entry_growth: usize,

    pub heap: HeapConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_size: 1024 * 1024,
            allocation_retries: 10,
            retry_growth: 0.25,
            eviction_slack: 0.2,
            initial_entries: 100,
            entry_growth: 50,
            heap: HeapConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Default configuration with the given size bound
    pub fn with_max_size(max_size: usize) -> Self {
        CacheConfig {
            max_size,
            ..Self::default()
        }
    }

    /// Parse configuration from a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: CacheConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Validate all fields
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::Invalid(
                "max_size must be greater than zero".to_string(),
            ));
        }

        if self.max_size > MAX_HEAP_CAPACITY {
            return Err(ConfigError::Invalid(format!(
                "max_size ({}) exceeds maximum block size",
                self.max_size
            )));
        }

        if !(0.0..=1.0).contains(&self.retry_growth) || !(0.0..=1.0).contains(&self.eviction_slack)
        {
            return Err(ConfigError::Invalid(
                "retry_growth and eviction_slack must be within 0.0..=1.0".to_string(),
            ));
        }

        if self.entry_growth == 0 {
            return Err(ConfigError::Invalid(
                "entry_growth must be greater than zero".to_string(),
            ));
        }

        self.heap.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.allocation_retries, 10);
        assert_eq!(config.heap.handle_growth, 64);
        assert_eq!(config.heap.min_split_payload, 128);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = CacheConfig::from_toml_str(
            r#"
            max_size = 4096
            eviction_slack = 0.5

            [heap]
            verify_guards = false
            "#,
        )
        .unwrap();

        assert_eq!(config.max_size, 4096);
        assert_eq!(config.eviction_slack, 0.5);
        assert_eq!(config.retry_growth, 0.25);
        assert!(!config.heap.verify_guards);
        assert_eq!(config.heap.handle_growth, 64);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(CacheConfig::from_toml_str("max_size = 0").is_err());
        assert!(CacheConfig::from_toml_str("eviction_slack = 1.5").is_err());
        assert!(CacheConfig::from_toml_str("[heap]\nhandle_growth = 0").is_err());
        assert!(matches!(
            CacheConfig::from_toml_str("max_size = \"big\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.toml");
        std::fs::write(&path, "max_size = 2048\nallocation_retries = 3\n").unwrap();

        let config = CacheConfig::load(&path).unwrap();
        assert_eq!(config.max_size, 2048);
        assert_eq!(config.allocation_retries, 3);

        assert!(matches!(
            CacheConfig::load(dir.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
