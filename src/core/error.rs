use crate::allocator::{BlockState, HeapHandle};
use crate::cache::CacheKey;
use thiserror::Error;

/// Error reported by a [`ResourceSource`](crate::source::ResourceSource) collaborator.
pub type SourceError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum HeapError {
    #[error("Requested {requested} bytes exceeds heap capacity of {capacity} bytes")]
    CapacityExceeded { requested: usize, capacity: usize },

    #[error("Handle table could not grow")]
    HandleExhausted,

    #[error("Could not allocate block of {size} bytes")]
    AllocationFailed { size: usize },

    #[error("Corruption detected at offset {offset}: {reason}")]
    CorruptionDetected { offset: usize, reason: &'static str },

    #[error("Cannot {operation} handle {handle} in state {state:?}")]
    InvalidState {
        handle: HeapHandle,
        state: BlockState,
        operation: &'static str,
    },

    #[error("Unknown handle: {0}")]
    UnknownHandle(HeapHandle),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Heap error: {0}")]
    Heap(#[from] HeapError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Resource {key} of {size} bytes exceeds cache size of {max_size} bytes")]
    TooLarge {
        key: CacheKey,
        size: usize,
        max_size: usize,
    },

    #[error("Insufficient space: requested {requested} bytes, {available} bytes available")]
    InsufficientSpace { requested: usize, available: usize },

    #[error("Resource source failed for key {key}: {source}")]
    Source {
        key: CacheKey,
        #[source]
        source: SourceError,
    },

    #[error("Entry is not locked: {0}")]
    NotLocked(CacheKey),

    #[error("Unknown cache entry: {0}")]
    UnknownEntry(CacheKey),

    #[error("Entry already present: {0}")]
    DuplicateKey(CacheKey),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type HeapResult<T> = std::result::Result<T, HeapError>;

pub type Result<T> = std::result::Result<T, CacheError>;
