//! # assetheap - Compacting Heap and Asset Cache
//!
//! `assetheap` manages resource memory the way classic game engines do:
//!
//! - **Handle-based heap**: clients hold handles, never addresses, so the heap
//!   can move live blocks to defragment its arena
//! - **Pinning**: a locked block is never moved until it is unlocked
//! - **System fallback**: requests the arena cannot satisfy can spill over to
//!   the process allocator
//! - **Bounded cache**: resources fetched from a [`ResourceSource`] by integer
//!   key, evicted by hit count with an MRU tie-break
//!
//! ## Quick Start
//!
//! ```rust
//! use assetheap::{CacheBuilder, FnSource, Result};
//!
//! # fn main() -> Result<()> {
//! let source = FnSource::new(
//!     |_key| Ok(16),
//!     |key, buf: &mut [u8]| {
//!         buf.fill(key as u8);
//!         Ok(buf.len())
//!     },
//! );
//!
//! let mut cache = CacheBuilder::new().max_size(64 * 1024).build(source)?;
//!
//! let handle = cache.lock(3)?;
//! assert_eq!(cache.data(handle)?, &[3u8; 16][..]);
//! cache.unlock(handle)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Using the heap directly
//!
//! ```rust
//! use assetheap::{Heap, HeapResult};
//!
//! # fn main() -> HeapResult<()> {
//! let mut heap = Heap::new(4096)?;
//!
//! let block = heap.allocate(100, false)?;
//! heap.lock(block)?;
//! heap.data_mut(block)?[..5].copy_from_slice(b"hello");
//! heap.unlock(block)?;
//!
//! heap.deallocate(block)?;
//! assert!(heap.validate().is_ok());
//! # Ok(())
//! # }
//! ```

pub mod core;

// Re-export core modules internally so crate:: paths in core still work
pub(crate) use crate::core::{allocator, cache, config, error, source};

pub use crate::core::{
    allocator::{BlockCounters, BlockLocation, BlockState, Heap, HeapHandle, HeapStats},
    cache::{Cache, CacheEntry, CacheKey, CacheStats, EntryHandle},
    config::{CacheConfig, HeapConfig, MAX_HEAP_CAPACITY},
    error::{CacheError, ConfigError, HeapError, HeapResult, Result, SourceError},
    source::{DirSource, FnSource, ResourceSource},
};

use std::path::Path;
use tracing::info;

/// Builder for configuring a [`Cache`]
///
/// # Example
///
/// ```rust,no_run
/// use assetheap::{CacheBuilder, DirSource};
///
/// # fn main() -> assetheap::Result<()> {
/// let cache = CacheBuilder::new()
///     .max_size(4 * 1024 * 1024)
///     .eviction_slack(0.1)
///     .verify_guards(false)
///     .build(DirSource::new("assets/art", "frm"))?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CacheBuilder {
    config: CacheConfig,
}

impl CacheBuilder {
    /// Create a builder with default settings
    pub fn new() -> Self {
        CacheBuilder {
            config: CacheConfig::default(),
        }
    }

    /// Start from an existing configuration
    pub fn with_config(config: CacheConfig) -> Self {
        CacheBuilder { config }
    }

    /// Start from a TOML configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::with_config(CacheConfig::load(path)?))
    }

    /// Set the cache size bound, which is also the heap capacity
    pub fn max_size(mut self, bytes: usize) -> Self {
        self.config.max_size = bytes;
        self
    }

    /// Set how many allocation attempts a miss makes before flushing
    pub fn allocation_retries(mut self, retries: u32) -> Self {
        self.config.allocation_retries = retries;
        self
    }

    /// Set the fraction of the cached size evicted on top of a request
    pub fn eviction_slack(mut self, fraction: f64) -> Self {
        self.config.eviction_slack = fraction;
        self
    }

    /// Set the handle table growth increment
    pub fn handle_growth(mut self, slots: usize) -> Self {
        self.config.heap.handle_growth = slots;
        self
    }

    /// Enable or disable footer guard checks on lock and deallocate
    pub fn verify_guards(mut self, enabled: bool) -> Self {
        self.config.heap.verify_guards = enabled;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Build the cache over `source`
    pub fn build<S: ResourceSource>(self, source: S) -> Result<Cache<S>> {
        info!("Building cache with max size {} bytes", self.config.max_size);
        Cache::new(self.config, source)
    }
}

impl Default for CacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}
