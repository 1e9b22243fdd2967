//! Free-block search and relocation planning
//!
//! When no single free block can hold a request, the engine looks for a
//! *movable extent*: a maximal run of free and movable blocks bounded by
//! locked blocks, system blocks or the arena edges. If every movable block in
//! the extent can be parked in a free block outside of it, the blocks are
//! moved and the whole extent collapses into one free block.
//!
//! Locked blocks are never touched, so a locked handle keeps its address
//! until it is unlocked.

use crate::allocator::block::{BlockHeader, BlockState, BlockStore, BLOCK_OVERHEAD};
use crate::allocator::handle::{HandleTable, Location};
use crate::allocator::heap::BlockCounters;
use crate::error::{HeapError, HeapResult};
use tracing::debug;

/// Offset and payload size of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    pub offset: usize,
    pub size: usize,
}

/// A maximal run of free and movable blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MovableExtent {
    /// Offset of the first block in the run
    pub offset: usize,
    /// Number of free or movable blocks in the run
    pub blocks: usize,
    /// Number of movable blocks in the run
    pub movable_blocks: usize,
    /// Summed payload size, excluding overhead
    pub size: usize,
}

impl MovableExtent {
    /// Payload of the single free block the extent becomes once emptied
    pub fn capacity(&self) -> usize {
        self.size + BLOCK_OVERHEAD * (self.blocks - 1)
    }

    /// One past the last byte of the extent
    pub fn end(&self) -> usize {
        self.offset + self.capacity() + BLOCK_OVERHEAD
    }

    fn contains(&self, offset: usize) -> bool {
        offset >= self.offset && offset < self.end()
    }
}

/// Scratch state for block searches, owned by one heap
#[derive(Debug, Default)]
pub struct CompactionEngine {
    free_blocks: Vec<BlockSpan>,
    extents: Vec<MovableExtent>,
    movable_blocks: Vec<BlockSpan>,
    reserved: Vec<bool>,
    /// `(movable block index, free block index)` pairs of the current plan
    plan: Vec<(usize, usize)>,
}

impl CompactionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find a free block of at least `size` bytes, relocating movable blocks
    /// if that is the only way to get one
    ///
    /// Returns the offset of a `Free` block, or `None` when neither the free
    /// list nor any extent can satisfy the request.
    pub fn find_free_block(
        &mut self,
        store: &mut BlockStore,
        handles: &mut HandleTable,
        counters: &mut BlockCounters,
        size: usize,
        min_split_size: usize,
    ) -> HeapResult<Option<usize>> {
        self.build_free_blocks(store, counters)?;
        if self.free_blocks.is_empty() {
            return Ok(None);
        }

        self.free_blocks.sort_by_key(|block| block.size);

        if let Some(block) = self.free_blocks.iter().find(|block| block.size >= size) {
            return Ok(Some(block.offset));
        }

        self.build_extents(store)?;
        self.extents.sort_by(|a, b| b.size.cmp(&a.size));

        for index in 0..self.extents.len() {
            let extent = self.extents[index];
            if extent.capacity() < size {
                continue;
            }

            self.build_movable_blocks(store, &extent)?;
            if !self.plan_relocation(&extent) {
                continue;
            }

            debug!(
                "Compacting extent at {} ({} blocks, {} movable) for {} bytes",
                extent.offset, extent.blocks, extent.movable_blocks, size
            );
            self.relocate(store, handles, counters, &extent, min_split_size)?;
            return Ok(Some(extent.offset));
        }

        debug!("No movable extent can hold {} bytes", size);
        Ok(None)
    }

    /// Collect free blocks, joining physically adjacent ones
    fn build_free_blocks(
        &mut self,
        store: &mut BlockStore,
        counters: &mut BlockCounters,
    ) -> HeapResult<()> {
        self.free_blocks.clear();

        let mut cursor = Some(0);
        while let Some(offset) = cursor {
            let mut header = store.header(offset)?;

            if header.state == BlockState::Free {
                let mut merged = false;
                while let Some(next) = store.next(offset, &header) {
                    let next_header = store.header(next)?;
                    if next_header.state != BlockState::Free {
                        break;
                    }

                    header.size += next_header.span();
                    counters.free_blocks -= 1;
                    counters.free_size += BLOCK_OVERHEAD;
                    merged = true;
                }

                if merged {
                    store.write(offset, &header);
                }

                self.free_blocks.push(BlockSpan {
                    offset,
                    size: header.size,
                });
            }

            cursor = store.next(offset, &header);
        }

        Ok(())
    }

    fn build_extents(&mut self, store: &BlockStore) -> HeapResult<()> {
        self.extents.clear();

        let mut current: Option<MovableExtent> = None;
        for block in store.blocks() {
            let (offset, header) = block?;

            if header.state.is_relocatable() {
                let movable = usize::from(header.state == BlockState::Movable);
                match current.as_mut() {
                    Some(extent) => {
                        extent.blocks += 1;
                        extent.movable_blocks += movable;
                        extent.size += header.size;
                    }
                    None => {
                        current = Some(MovableExtent {
                            offset,
                            blocks: 1,
                            movable_blocks: movable,
                            size: header.size,
                        });
                    }
                }
            } else if let Some(extent) = current.take() {
                self.extents.push(extent);
            }
        }

        if let Some(extent) = current {
            self.extents.push(extent);
        }

        Ok(())
    }

    /// Collect the extent's movable blocks, smallest first
    fn build_movable_blocks(&mut self, store: &BlockStore, extent: &MovableExtent) -> HeapResult<()> {
        self.movable_blocks.clear();

        let mut offset = extent.offset;
        for _ in 0..extent.blocks {
            let header = store.header(offset)?;
            if header.state == BlockState::Movable {
                self.movable_blocks.push(BlockSpan {
                    offset,
                    size: header.size,
                });
            }
            offset += header.span();
        }

        if self.movable_blocks.len() != extent.movable_blocks {
            return Err(HeapError::CorruptionDetected {
                offset: extent.offset,
                reason: "movable extent changed while planning",
            });
        }

        self.movable_blocks.sort_by_key(|block| block.size);
        Ok(())
    }

    /// Reserve, for each movable block, the smallest unreserved free block
    /// outside the extent that can hold it
    fn plan_relocation(&mut self, extent: &MovableExtent) -> bool {
        self.plan.clear();
        self.reserved.clear();
        self.reserved.resize(self.free_blocks.len(), false);

        for (movable_index, movable) in self.movable_blocks.iter().enumerate() {
            let reserved = &self.reserved;
            let candidate = self.free_blocks.iter().enumerate().position(|(index, free)| {
                !reserved[index] && free.size >= movable.size && !extent.contains(free.offset)
            });

            match candidate {
                Some(free_index) => {
                    self.reserved[free_index] = true;
                    self.plan.push((movable_index, free_index));
                }
                None => return false,
            }
        }

        true
    }

    fn relocate(
        &mut self,
        store: &mut BlockStore,
        handles: &mut HandleTable,
        counters: &mut BlockCounters,
        extent: &MovableExtent,
        min_split_size: usize,
    ) -> HeapResult<()> {
        for &(movable_index, free_index) in &self.plan {
            let movable = self.movable_blocks[movable_index];
            let target = self.free_blocks[free_index];

            store.copy_block(movable.offset, target.offset, movable.size);

            let mut header = store.header(target.offset)?;
            let owner = header.owner.ok_or(HeapError::CorruptionDetected {
                offset: movable.offset,
                reason: "movable block without owning handle",
            })?;
            handles.get_mut(owner)?.location = Location::Arena(target.offset);

            let remaining = target.size - movable.size;
            if remaining != 0 {
                if remaining < min_split_size {
                    header.size += remaining;
                    store.write(target.offset, &header);

                    counters.free_size -= remaining;
                    counters.movable_size += remaining;
                } else {
                    store.write(
                        target.offset + header.span(),
                        &BlockHeader::free(remaining - BLOCK_OVERHEAD),
                    );

                    counters.free_blocks += 1;
                    counters.free_size -= BLOCK_OVERHEAD;
                }
            }

            debug!(
                "Moved block {} from {} to {}",
                owner, movable.offset, target.offset
            );
        }

        // Every block of the extent is now free; fold them into one.
        counters.free_blocks -= extent.blocks - 1;
        counters.free_size += (extent.blocks - 1) * BLOCK_OVERHEAD;
        store.write(extent.offset, &BlockHeader::free(extent.capacity()));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent_capacity_and_bounds() {
        let extent = MovableExtent {
            offset: 100,
            blocks: 3,
            movable_blocks: 2,
            size: 300,
        };

        assert_eq!(extent.capacity(), 300 + 2 * BLOCK_OVERHEAD);
        assert_eq!(extent.end(), 100 + 300 + 3 * BLOCK_OVERHEAD);
        assert!(extent.contains(100));
        assert!(extent.contains(extent.end() - 1));
        assert!(!extent.contains(extent.end()));
        assert!(!extent.contains(99));
    }

    #[test]
    fn test_plan_prefers_smallest_fitting_free_block() {
        let mut engine = CompactionEngine::new();
        engine.free_blocks = vec![
            BlockSpan { offset: 0, size: 40 },
            BlockSpan { offset: 2000, size: 64 },
            BlockSpan { offset: 3000, size: 128 },
            BlockSpan { offset: 4000, size: 512 },
        ];
        engine.movable_blocks = vec![
            BlockSpan { offset: 1000, size: 60 },
            BlockSpan { offset: 1100, size: 100 },
        ];
        let extent = MovableExtent {
            offset: 1000,
            blocks: 2,
            movable_blocks: 2,
            size: 160,
        };

        assert!(engine.plan_relocation(&extent));
        assert_eq!(engine.plan, vec![(0, 1), (1, 2)]);
    }

    #[test]
    fn test_plan_skips_free_blocks_inside_extent() {
        let mut engine = CompactionEngine::new();
        engine.free_blocks = vec![BlockSpan { offset: 1200, size: 500 }];
        engine.movable_blocks = vec![BlockSpan { offset: 1000, size: 100 }];
        let extent = MovableExtent {
            offset: 1000,
            blocks: 2,
            movable_blocks: 1,
            size: 600,
        };

        assert!(!engine.plan_relocation(&extent));
    }

    #[test]
    fn test_plan_fails_when_free_blocks_run_out() {
        let mut engine = CompactionEngine::new();
        engine.free_blocks = vec![BlockSpan { offset: 0, size: 200 }];
        engine.movable_blocks = vec![
            BlockSpan { offset: 1000, size: 100 },
            BlockSpan { offset: 1200, size: 100 },
        ];
        let extent = MovableExtent {
            offset: 1000,
            blocks: 2,
            movable_blocks: 2,
            size: 200,
        };

        assert!(!engine.plan_relocation(&extent));
    }
}
