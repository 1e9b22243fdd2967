//! Heap, cache and their supporting types

pub mod allocator;
pub mod cache;
pub mod config;
pub mod error;
pub mod source;
