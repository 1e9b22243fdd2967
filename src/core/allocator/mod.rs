//! Handle-based heap allocation
//!
//! The heap is layered:
//! - `block`: arena layout, guard words and block states
//! - `handle`: the handle table clients reference blocks through
//! - `compaction`: free-block search and relocation of movable extents
//! - `heap`: the public [`Heap`] façade

pub mod block;
pub mod compaction;
pub mod handle;
pub mod heap;

pub use block::{BlockState, BLOCK_OVERHEAD};
pub use handle::HeapHandle;
pub use heap::{BlockCounters, BlockLocation, Heap, HeapStats};
