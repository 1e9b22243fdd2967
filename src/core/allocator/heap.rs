//! Compacting heap with handle indirection
//!
//! `Heap` composes the [`BlockStore`], the [`HandleTable`] and the
//! [`CompactionEngine`]. Movable blocks may be relocated by any call to
//! [`Heap::allocate`]; locked blocks stay put until unlocked. Block contents
//! are only reachable through [`Heap::data`] / [`Heap::data_mut`] on a locked
//! handle, and the returned slice borrows the heap, so it cannot be held
//! across a call that might move blocks.

use crate::allocator::block::{
    BlockHeader, BlockState, BlockStore, SystemBlock, BLOCK_OVERHEAD,
};
use crate::allocator::compaction::CompactionEngine;
use crate::allocator::handle::{HandleSlot, HandleTable, HeapHandle, Location};
use crate::config::{HeapConfig, MAX_HEAP_CAPACITY};
use crate::error::{HeapError, HeapResult};
use serde::Serialize;
use std::fmt;
use tracing::{debug, error, warn};

/// Running block counts and payload sizes, by state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BlockCounters {
    pub free_blocks: usize,
    pub free_size: usize,
    pub movable_blocks: usize,
    pub movable_size: usize,
    pub locked_blocks: usize,
    pub locked_size: usize,
    pub system_blocks: usize,
    pub system_size: usize,
}

impl BlockCounters {
    /// Number of blocks inside the arena
    pub fn arena_blocks(&self) -> usize {
        self.free_blocks + self.movable_blocks + self.locked_blocks
    }

    /// Bytes covered by arena blocks, overhead included
    pub fn arena_bytes(&self) -> usize {
        self.free_size + self.movable_size + self.locked_size + BLOCK_OVERHEAD * self.arena_blocks()
    }
}

/// Heap statistics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeapStats {
    #[serde(flatten)]
    pub counters: BlockCounters,
    pub handles: usize,
    pub arena_size: usize,
    pub capacity: usize,
}

impl fmt::Display for HeapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counters;
        writeln!(f, "[Heap]")?;
        writeln!(f, "Total free blocks: {}", c.free_blocks)?;
        writeln!(f, "Total free size: {}", c.free_size)?;
        writeln!(f, "Total movable blocks: {}", c.movable_blocks)?;
        writeln!(f, "Total movable size: {}", c.movable_size)?;
        writeln!(f, "Total locked blocks: {}", c.locked_blocks)?;
        writeln!(f, "Total locked size: {}", c.locked_size)?;
        writeln!(f, "Total system blocks: {}", c.system_blocks)?;
        writeln!(f, "Total system size: {}", c.system_size)?;
        write!(f, "Total handles: {}", self.handles)
    }
}

/// Where a locked block's payload lives
///
/// Arena offsets of locked blocks are stable until the block is unlocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockLocation {
    Arena { offset: usize },
    System,
}

/// Round a request up to the 4-byte allocation granularity
fn round_size(size: usize) -> Option<usize> {
    size.max(1).checked_next_multiple_of(4)
}

pub struct Heap {
    store: BlockStore,
    handles: HandleTable,
    engine: CompactionEngine,
    counters: BlockCounters,
    capacity: usize,
    config: HeapConfig,
}

impl Heap {
    /// Create a heap able to hold `capacity` bytes, with default tuning
    pub fn new(capacity: usize) -> HeapResult<Self> {
        Self::with_config(capacity, HeapConfig::default())
    }

    /// Create a heap able to hold `capacity` bytes
    ///
    /// The arena is `capacity + capacity / 1024` bytes and starts out as a
    /// single free block. Capacities above [`MAX_HEAP_CAPACITY`] are rejected,
    /// since block headers could not describe the arena.
    pub fn with_config(capacity: usize, config: HeapConfig) -> HeapResult<Self> {
        config.validate()?;

        let arena_size = match capacity.checked_add(capacity >> 10) {
            Some(arena_size) if capacity <= MAX_HEAP_CAPACITY => arena_size,
            _ => {
                warn!("Heap capacity {} exceeds {}", capacity, MAX_HEAP_CAPACITY);
                return Err(HeapError::CapacityExceeded {
                    requested: capacity,
                    capacity: MAX_HEAP_CAPACITY,
                });
            }
        };
        let store = BlockStore::new(arena_size).map_err(|e| {
            error!("Could not allocate heap arena of {} bytes", arena_size);
            e
        })?;
        let handles = HandleTable::new(config.handle_growth).map_err(|e| {
            error!("Could not initialize handles");
            e
        })?;

        debug!("Created heap: capacity={}, arena={}", capacity, arena_size);

        Ok(Heap {
            store,
            handles,
            engine: CompactionEngine::new(),
            counters: BlockCounters {
                free_blocks: 1,
                free_size: arena_size - BLOCK_OVERHEAD,
                ..BlockCounters::default()
            },
            capacity,
            config,
        })
    }

    /// Largest request the heap accepts
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Arena length in bytes
    pub fn arena_size(&self) -> usize {
        self.store.len()
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn counters(&self) -> BlockCounters {
        self.counters
    }

    fn min_split_size(&self) -> usize {
        self.config.min_split_payload + BLOCK_OVERHEAD
    }

    /// Allocate a movable block of at least `size` bytes
    ///
    /// Searches the free list, then tries compaction, then (if allowed) the
    /// process heap.
    pub fn allocate(&mut self, size: usize, allow_system_fallback: bool) -> HeapResult<HeapHandle> {
        let size = match round_size(size) {
            Some(rounded) if rounded <= self.capacity => rounded,
            _ => {
                warn!(
                    "Could not allocate block of {} bytes: exceeds capacity {}",
                    size, self.capacity
                );
                return Err(HeapError::CapacityExceeded {
                    requested: size,
                    capacity: self.capacity,
                });
            }
        };

        let min_split = self.min_split_size();
        let found = self.engine.find_free_block(
            &mut self.store,
            &mut self.handles,
            &mut self.counters,
            size,
            min_split,
        )?;

        if let Some(offset) = found {
            return self.bind_arena_block(offset, size);
        }

        debug!("Arena exhausted\n{}", self.stats());

        if allow_system_fallback {
            return self.bind_system_block(size);
        }

        warn!("Could not allocate block of {} bytes", size);
        Err(HeapError::AllocationFailed { size })
    }

    fn bind_arena_block(&mut self, offset: usize, size: usize) -> HeapResult<HeapHandle> {
        let mut header = self.store.header(offset)?;
        if header.state != BlockState::Free {
            return Err(HeapError::CorruptionDetected {
                offset,
                reason: "selected block is not free",
            });
        }

        let handle = self
            .handles
            .acquire(HandleSlot {
                state: BlockState::Movable,
                location: Location::Arena(offset),
            })
            .map_err(|e| {
                warn!("Could not acquire handle for new block");
                e
            })?;

        let remaining = header.size - size;
        if remaining > self.min_split_size() {
            header.size = size;
            self.store.write(
                offset + header.span(),
                &BlockHeader::free(remaining - BLOCK_OVERHEAD),
            );

            self.counters.free_blocks += 1;
            self.counters.free_size -= BLOCK_OVERHEAD;
        }

        header.state = BlockState::Movable;
        header.owner = Some(handle);
        self.store.write(offset, &header);

        self.counters.free_blocks -= 1;
        self.counters.movable_blocks += 1;
        self.counters.free_size -= header.size;
        self.counters.movable_size += header.size;

        Ok(handle)
    }

    fn bind_system_block(&mut self, size: usize) -> HeapResult<HeapHandle> {
        debug!("Allocating block of {} bytes from system memory", size);

        let handle = self
            .handles
            .acquire(HandleSlot {
                state: BlockState::System,
                location: Location::System(SystemBlock::allocate(size)),
            })
            .map_err(|e| {
                warn!("Could not acquire handle for new block");
                e
            })?;

        if let Location::System(block) = &mut self.handles.get_mut(handle)?.location {
            block.write(&BlockHeader {
                size,
                state: BlockState::System,
                owner: Some(handle),
            });
        }

        self.counters.system_blocks += 1;
        self.counters.system_size += size;

        Ok(handle)
    }

    /// Decode the block behind `handle` and check it against the handle
    fn inspect(&self, handle: HeapHandle, operation: &'static str) -> HeapResult<BlockHeader> {
        let slot = self.handles.get(handle)?;

        let (offset, header) = match &slot.location {
            Location::Arena(offset) => {
                let header = if self.config.verify_guards {
                    self.store.checked_header(*offset)
                } else {
                    self.store.header(*offset)
                };
                (*offset, header)
            }
            Location::System(block) => {
                let header = if self.config.verify_guards {
                    block.checked_header()
                } else {
                    block.header()
                };
                (0, header)
            }
        };

        let header = header.map_err(|e| {
            error!("Bad guard detected during {} of {}: {}", operation, handle, e);
            e
        })?;

        if self.config.verify_guards && header.state != slot.state {
            error!("Mismatched block states detected during {} of {}", operation, handle);
            return Err(HeapError::CorruptionDetected {
                offset,
                reason: "handle and block header disagree on state",
            });
        }

        Ok(header)
    }

    /// Move a block to `state`, updating both the handle and the header
    fn set_state(&mut self, handle: HeapHandle, mut header: BlockHeader, state: BlockState) -> HeapResult<()> {
        header.state = state;

        let slot = self.handles.get_mut(handle)?;
        slot.state = state;
        match &mut slot.location {
            Location::Arena(offset) => self.store.write(*offset, &header),
            Location::System(block) => block.write(&header),
        }

        Ok(())
    }

    fn invalid_state(handle: HeapHandle, state: BlockState, operation: &'static str) -> HeapError {
        warn!("Cannot {} handle {} in state {:?}", operation, handle, state);
        HeapError::InvalidState {
            handle,
            state,
            operation,
        }
    }

    /// Pin a block so that compaction leaves it in place
    pub fn lock(&mut self, handle: HeapHandle) -> HeapResult<BlockLocation> {
        let header = self.inspect(handle, "lock")?;
        let locked = header
            .state
            .locked()
            .ok_or_else(|| Self::invalid_state(handle, header.state, "lock"))?;

        self.set_state(handle, header, locked)?;

        if header.state == BlockState::Movable {
            self.counters.movable_blocks -= 1;
            self.counters.locked_blocks += 1;
            self.counters.movable_size -= header.size;
            self.counters.locked_size += header.size;
        }

        self.location(handle)
    }

    /// Release a pin taken with [`Heap::lock`]
    pub fn unlock(&mut self, handle: HeapHandle) -> HeapResult<()> {
        let header = self.inspect(handle, "unlock")?;
        let unlocked = header
            .state
            .unlocked()
            .ok_or_else(|| Self::invalid_state(handle, header.state, "unlock"))?;

        self.set_state(handle, header, unlocked)?;

        if header.state == BlockState::Locked {
            self.counters.locked_blocks -= 1;
            self.counters.movable_blocks += 1;
            self.counters.locked_size -= header.size;
            self.counters.movable_size += header.size;
        }

        Ok(())
    }

    /// Release a block
    ///
    /// Arena blocks become free; merging with free neighbours happens on the
    /// next free-list rebuild. System blocks go straight back to the process.
    pub fn deallocate(&mut self, handle: HeapHandle) -> HeapResult<()> {
        let header = self.inspect(handle, "deallocate")?;

        match header.state {
            BlockState::Movable => {
                let slot = self.handles.release(handle)?;
                if let Location::Arena(offset) = slot.location {
                    self.store.write(offset, &BlockHeader::free(header.size));
                }

                self.counters.movable_blocks -= 1;
                self.counters.free_blocks += 1;
                self.counters.movable_size -= header.size;
                self.counters.free_size += header.size;
                Ok(())
            }
            BlockState::System => {
                self.handles.release(handle)?;

                self.counters.system_blocks -= 1;
                self.counters.system_size -= header.size;
                Ok(())
            }
            state => Err(Self::invalid_state(handle, state, "deallocate")),
        }
    }

    pub fn state(&self, handle: HeapHandle) -> HeapResult<BlockState> {
        Ok(self.handles.get(handle)?.state)
    }

    /// Current location of a block; only stable while the block is locked
    pub fn location(&self, handle: HeapHandle) -> HeapResult<BlockLocation> {
        Ok(match &self.handles.get(handle)?.location {
            Location::Arena(offset) => BlockLocation::Arena { offset: *offset },
            Location::System(_) => BlockLocation::System,
        })
    }

    /// Payload size of a block, which may exceed the requested size
    pub fn block_size(&self, handle: HeapHandle) -> HeapResult<usize> {
        match &self.handles.get(handle)?.location {
            Location::Arena(offset) => Ok(self.store.header(*offset)?.size),
            Location::System(block) => Ok(block.size()),
        }
    }

    /// Payload of a locked block
    pub fn data(&self, handle: HeapHandle) -> HeapResult<&[u8]> {
        let slot = self.handles.get(handle)?;
        if !slot.state.is_locked() {
            return Err(Self::invalid_state(handle, slot.state, "read"));
        }

        match &slot.location {
            Location::Arena(offset) => {
                let header = self.store.header(*offset)?;
                Ok(self.store.payload(*offset, header.size))
            }
            Location::System(block) => Ok(block.payload()),
        }
    }

    /// Mutable payload of a locked block
    pub fn data_mut(&mut self, handle: HeapHandle) -> HeapResult<&mut [u8]> {
        let slot = self.handles.get_mut(handle)?;
        if !slot.state.is_locked() {
            return Err(Self::invalid_state(handle, slot.state, "write"));
        }

        match &mut slot.location {
            Location::Arena(offset) => {
                let offset = *offset;
                let header = self.store.header(offset)?;
                Ok(self.store.payload_mut(offset, header.size))
            }
            Location::System(block) => Ok(block.payload_mut()),
        }
    }

    /// Walk every block and cross-check guards, handles and counters
    pub fn validate(&self) -> HeapResult<()> {
        debug!("Validating heap...");

        let mut seen = BlockCounters::default();
        let mut end = 0;

        for block in self.store.blocks() {
            let (offset, header) = block.map_err(|e| {
                error!("Heap validation failed: {}", e);
                e
            })?;
            self.store.checked_header(offset)?;

            match header.state {
                BlockState::Free => {
                    seen.free_blocks += 1;
                    seen.free_size += header.size;
                }
                BlockState::Movable => {
                    seen.movable_blocks += 1;
                    seen.movable_size += header.size;
                }
                BlockState::Locked => {
                    seen.locked_blocks += 1;
                    seen.locked_size += header.size;
                }
                _ => return Err(self.validation_error(offset, "system block inside arena")),
            }

            if header.state != BlockState::Free {
                let owned = header
                    .owner
                    .and_then(|owner| self.handles.get(owner).ok())
                    .is_some_and(|slot| {
                        slot.state == header.state
                            && matches!(slot.location, Location::Arena(at) if at == offset)
                    });
                if !owned {
                    return Err(self.validation_error(offset, "block not bound to its handle"));
                }
            }

            end = offset + header.span();
        }

        if end != self.store.len() {
            return Err(self.validation_error(end, "blocks do not tile the arena"));
        }

        for (handle, slot) in self.handles.iter() {
            if let Location::System(block) = &slot.location {
                let header = block.checked_header()?;
                if header.state != slot.state || header.owner != Some(handle) {
                    return Err(self.validation_error(0, "system block not bound to its handle"));
                }
                seen.system_blocks += 1;
                seen.system_size += header.size;
            }
        }

        let checks = [
            (seen.free_blocks == self.counters.free_blocks, "invalid number of free blocks"),
            (seen.free_size == self.counters.free_size, "invalid size of free blocks"),
            (seen.movable_blocks == self.counters.movable_blocks, "invalid number of movable blocks"),
            (seen.movable_size == self.counters.movable_size, "invalid size of movable blocks"),
            (seen.locked_blocks == self.counters.locked_blocks, "invalid number of locked blocks"),
            (seen.locked_size == self.counters.locked_size, "invalid size of locked blocks"),
            (seen.system_blocks == self.counters.system_blocks, "invalid number of system blocks"),
            (seen.system_size == self.counters.system_size, "invalid size of system blocks"),
            (self.counters.arena_bytes() == self.store.len(), "counters do not cover the arena"),
        ];
        if let Some(&(_, reason)) = checks.iter().find(|(ok, _)| !ok) {
            return Err(self.validation_error(0, reason));
        }

        debug!("Heap is O.K.");
        Ok(())
    }

    fn validation_error(&self, offset: usize, reason: &'static str) -> HeapError {
        error!("Heap validation failed at {}: {}", offset, reason);
        HeapError::CorruptionDetected { offset, reason }
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            counters: self.counters,
            handles: self.handles.len(),
            arena_size: self.store.len(),
            capacity: self.capacity,
        }
    }

    /// Human-readable statistics report
    pub fn print_stats(&self) -> String {
        self.stats().to_string()
    }

    #[cfg(test)]
    pub(crate) fn raw_arena_mut(&mut self) -> &mut [u8] {
        self.store.raw_mut()
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("capacity", &self.capacity)
            .field("arena_size", &self.store.len())
            .field("counters", &self.counters)
            .finish()
    }
}
