//! Handle table
//!
//! Clients only ever hold a [`HeapHandle`]. The table maps it to the block's
//! current location, which compaction is free to change for movable blocks.

use crate::allocator::block::{BlockState, SystemBlock};
use crate::error::{HeapError, HeapResult};
use std::fmt;

/// Opaque reference to a heap block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapHandle(u32);

impl HeapHandle {
    pub(crate) fn new(index: u32) -> Self {
        HeapHandle(index)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for HeapHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a block currently lives
#[derive(Debug)]
pub enum Location {
    /// Offset of the block header inside the arena
    Arena(usize),
    /// Block allocated from the process heap
    System(SystemBlock),
}

#[derive(Debug)]
pub struct HandleSlot {
    pub state: BlockState,
    pub location: Location,
}

/// Growable table of handle slots; `None` marks an unused slot
#[derive(Debug)]
pub struct HandleTable {
    slots: Vec<Option<HandleSlot>>,
    growth: usize,
}

impl HandleTable {
    pub fn new(growth: usize) -> HeapResult<Self> {
        let mut table = HandleTable {
            slots: Vec::new(),
            growth,
        };
        table.grow()?;
        Ok(table)
    }

    fn grow(&mut self) -> HeapResult<()> {
        if self.slots.len() + self.growth > u32::MAX as usize {
            return Err(HeapError::HandleExhausted);
        }

        self.slots
            .try_reserve_exact(self.growth)
            .map_err(|_| HeapError::HandleExhausted)?;
        self.slots
            .extend(std::iter::repeat_with(|| None).take(self.growth));
        Ok(())
    }

    /// Bind `slot` to the first unused handle, growing the table if needed
    pub fn acquire(&mut self, slot: HandleSlot) -> HeapResult<HeapHandle> {
        let index = match self.slots.iter().position(Option::is_none) {
            Some(index) => index,
            None => {
                let index = self.slots.len();
                self.grow()?;
                index
            }
        };

        self.slots[index] = Some(slot);
        Ok(HeapHandle::new(index as u32))
    }

    pub fn release(&mut self, handle: HeapHandle) -> HeapResult<HandleSlot> {
        self.slots
            .get_mut(handle.index())
            .and_then(Option::take)
            .ok_or(HeapError::UnknownHandle(handle))
    }

    pub fn get(&self, handle: HeapHandle) -> HeapResult<&HandleSlot> {
        self.slots
            .get(handle.index())
            .and_then(Option::as_ref)
            .ok_or(HeapError::UnknownHandle(handle))
    }

    pub fn get_mut(&mut self, handle: HeapHandle) -> HeapResult<&mut HandleSlot> {
        self.slots
            .get_mut(handle.index())
            .and_then(Option::as_mut)
            .ok_or(HeapError::UnknownHandle(handle))
    }

    /// Number of slots, used or not
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Iterate over bound handles
    pub fn iter(&self) -> impl Iterator<Item = (HeapHandle, &HandleSlot)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|s| (HeapHandle::new(i as u32), s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena_slot(offset: usize) -> HandleSlot {
        HandleSlot {
            state: BlockState::Movable,
            location: Location::Arena(offset),
        }
    }

    #[test]
    fn test_acquire_reuses_released_slots() {
        let mut table = HandleTable::new(4).unwrap();

        let a = table.acquire(arena_slot(0)).unwrap();
        let b = table.acquire(arena_slot(100)).unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);

        table.release(a).unwrap();
        let c = table.acquire(arena_slot(200)).unwrap();
        assert_eq!(c, a);
        assert!(matches!(table.get(c).unwrap().location, Location::Arena(200)));
    }

    #[test]
    fn test_table_grows_by_increment() {
        let mut table = HandleTable::new(4).unwrap();
        assert_eq!(table.len(), 4);

        for i in 0..5 {
            table.acquire(arena_slot(i * 32)).unwrap();
        }

        assert_eq!(table.len(), 8);
        assert_eq!(table.iter().count(), 5);
    }

    #[test]
    fn test_unknown_handles() {
        let mut table = HandleTable::new(4).unwrap();
        let stale = HeapHandle::new(2);
        let beyond = HeapHandle::new(99);

        assert!(matches!(table.get(stale), Err(HeapError::UnknownHandle(_))));
        assert!(matches!(table.get_mut(beyond), Err(HeapError::UnknownHandle(_))));
        assert!(matches!(table.release(stale), Err(HeapError::UnknownHandle(_))));
    }
}
