//! Block layout inside the heap arena
//!
//! Every block is `header | payload | footer`, and blocks tile the arena with
//! no gaps: the footer of the last block ends exactly at the arena length.
//!
//! ```text
//! ┌──────────────────────────────┬───────────────┬──────────┐
//! │ guard | size | state | owner │ payload (size) │  guard   │
//! │  u32    u32    u32     i32   │                │   u32    │
//! └──────────────────────────────┴───────────────┴──────────┘
//! ```

use crate::allocator::HeapHandle;
use crate::error::{HeapError, HeapResult};

pub const HEADER_GUARD: u32 = 0xDEAD_C0DE;
pub const FOOTER_GUARD: u32 = 0xACDC_ACDC;

pub const HEADER_SIZE: usize = 16;
pub const FOOTER_SIZE: usize = 4;
pub const BLOCK_OVERHEAD: usize = HEADER_SIZE + FOOTER_SIZE;

const NO_OWNER: i32 = -1;

/// Block state
///
/// The only combined state is `SystemLocked`. Transitions go through
/// [`BlockState::locked`] and [`BlockState::unlocked`].
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockState {
    Free = 0x00,
    Movable = 0x01,
    Locked = 0x02,
    System = 0x04,
    SystemLocked = 0x06,
}

impl BlockState {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0x00 => Some(Self::Free),
            0x01 => Some(Self::Movable),
            0x02 => Some(Self::Locked),
            0x04 => Some(Self::System),
            0x06 => Some(Self::SystemLocked),
            _ => None,
        }
    }

    pub fn is_locked(self) -> bool {
        matches!(self, Self::Locked | Self::SystemLocked)
    }

    pub fn is_system(self) -> bool {
        matches!(self, Self::System | Self::SystemLocked)
    }

    /// Free and movable blocks may take part in relocation
    pub fn is_relocatable(self) -> bool {
        matches!(self, Self::Free | Self::Movable)
    }

    /// State after a successful lock, or `None` if the block cannot be locked
    pub fn locked(self) -> Option<Self> {
        match self {
            Self::Movable => Some(Self::Locked),
            Self::System => Some(Self::SystemLocked),
            _ => None,
        }
    }

    /// State after a successful unlock, or `None` if the block is not locked
    pub fn unlocked(self) -> Option<Self> {
        match self {
            Self::Locked => Some(Self::Movable),
            Self::SystemLocked => Some(Self::System),
            _ => None,
        }
    }
}

/// Decoded block header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Payload size in bytes, excluding overhead
    pub size: usize,
    pub state: BlockState,
    pub owner: Option<HeapHandle>,
}

impl BlockHeader {
    pub fn free(size: usize) -> Self {
        BlockHeader {
            size,
            state: BlockState::Free,
            owner: None,
        }
    }

    /// Total bytes occupied including header and footer
    pub fn span(&self) -> usize {
        self.size + BLOCK_OVERHEAD
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn write_u32(bytes: &mut [u8], at: usize, value: u32) {
    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

/// Write header and footer for a block starting at `offset` in `bytes`
pub fn encode_block(bytes: &mut [u8], offset: usize, header: &BlockHeader) {
    let owner = header.owner.map_or(NO_OWNER, |h| h.index() as i32);

    write_u32(bytes, offset, HEADER_GUARD);
    write_u32(bytes, offset + 4, header.size as u32);
    write_u32(bytes, offset + 8, header.state as u32);
    bytes[offset + 12..offset + 16].copy_from_slice(&owner.to_le_bytes());

    write_u32(bytes, offset + HEADER_SIZE + header.size, FOOTER_GUARD);
}

/// Decode and check the header of the block starting at `offset`
///
/// Fails with `CorruptionDetected` on a bad guard word, an unknown state, or a
/// size that runs past the end of `bytes`.
pub fn decode_header(bytes: &[u8], offset: usize) -> HeapResult<BlockHeader> {
    if offset + HEADER_SIZE > bytes.len() {
        return Err(corruption(offset, "block header past end of arena"));
    }

    if read_u32(bytes, offset) != HEADER_GUARD {
        return Err(corruption(offset, "bad header guard"));
    }

    let size = read_u32(bytes, offset + 4) as usize;
    if offset + HEADER_SIZE + size + FOOTER_SIZE > bytes.len() {
        return Err(corruption(offset, "block size runs off end of arena"));
    }

    let state = BlockState::from_u32(read_u32(bytes, offset + 8))
        .ok_or_else(|| corruption(offset, "unknown block state"))?;

    let owner = i32::from_le_bytes([
        bytes[offset + 12],
        bytes[offset + 13],
        bytes[offset + 14],
        bytes[offset + 15],
    ]);
    let owner = if owner < 0 {
        None
    } else {
        Some(HeapHandle::new(owner as u32))
    };

    Ok(BlockHeader { size, state, owner })
}

/// Check the footer guard of a block whose header has already been decoded
pub fn check_footer(bytes: &[u8], offset: usize, header: &BlockHeader) -> HeapResult<()> {
    if read_u32(bytes, offset + HEADER_SIZE + header.size) != FOOTER_GUARD {
        return Err(corruption(offset, "bad footer guard"));
    }
    Ok(())
}

fn corruption(offset: usize, reason: &'static str) -> HeapError {
    HeapError::CorruptionDetected { offset, reason }
}

/// The raw arena
///
/// Pure layout logic: the store knows how to read and write blocks, but
/// keeps no counters and no handle bookkeeping.
#[derive(Debug)]
pub struct BlockStore {
    data: Vec<u8>,
}

impl BlockStore {
    /// Allocate an arena of `size` bytes formatted as one free block
    pub fn new(size: usize) -> HeapResult<Self> {
        if size < BLOCK_OVERHEAD {
            return Err(HeapError::AllocationFailed { size });
        }

        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| HeapError::AllocationFailed { size })?;
        data.resize(size, 0);

        let mut store = BlockStore { data };
        store.write(0, &BlockHeader::free(size - BLOCK_OVERHEAD));
        Ok(store)
    }

    /// Arena length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn header(&self, offset: usize) -> HeapResult<BlockHeader> {
        decode_header(&self.data, offset)
    }

    /// Decode the header and check the footer
    pub fn checked_header(&self, offset: usize) -> HeapResult<BlockHeader> {
        let header = decode_header(&self.data, offset)?;
        check_footer(&self.data, offset, &header)?;
        Ok(header)
    }

    pub fn write(&mut self, offset: usize, header: &BlockHeader) {
        encode_block(&mut self.data, offset, header);
    }

    /// Offset of the block following the one at `offset`, if any
    pub fn next(&self, offset: usize, header: &BlockHeader) -> Option<usize> {
        let next = offset + header.span();
        (next < self.data.len()).then_some(next)
    }

    /// Copy a whole block (header, payload and footer) to a new offset
    pub fn copy_block(&mut self, from: usize, to: usize, size: usize) {
        self.data.copy_within(from..from + size + BLOCK_OVERHEAD, to);
    }

    pub fn payload(&self, offset: usize, size: usize) -> &[u8] {
        let start = offset + HEADER_SIZE;
        &self.data[start..start + size]
    }

    pub fn payload_mut(&mut self, offset: usize, size: usize) -> &mut [u8] {
        let start = offset + HEADER_SIZE;
        &mut self.data[start..start + size]
    }

    /// Walk the arena from the first block
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            store: self,
            offset: Some(0),
        }
    }

    #[cfg(test)]
    pub(crate) fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Iterator over `(offset, header)` pairs
///
/// Yields an error and stops at the first corrupted header.
pub struct Blocks<'a> {
    store: &'a BlockStore,
    offset: Option<usize>,
}

impl Iterator for Blocks<'_> {
    type Item = HeapResult<(usize, BlockHeader)>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.offset?;
        match self.store.header(offset) {
            Ok(header) => {
                self.offset = self.store.next(offset, &header);
                Some(Ok((offset, header)))
            }
            Err(e) => {
                self.offset = None;
                Some(Err(e))
            }
        }
    }
}

/// A block allocated from the process heap when the arena is exhausted
///
/// Uses the same header/footer layout as arena blocks so that guard checks
/// and validation treat both kinds alike.
#[derive(Debug)]
pub struct SystemBlock {
    bytes: Box<[u8]>,
}

impl SystemBlock {
    /// Allocate a system block; aborts the process if the allocation fails
    pub fn allocate(size: usize) -> Self {
        let total = size + BLOCK_OVERHEAD;
        let mut bytes = Vec::new();
        if bytes.try_reserve_exact(total).is_err() {
            tracing::error!("System allocation of {} bytes failed, aborting", total);
            std::process::abort();
        }
        bytes.resize(total, 0);

        let mut block = SystemBlock {
            bytes: bytes.into_boxed_slice(),
        };
        block.write(&BlockHeader {
            size,
            state: BlockState::System,
            owner: None,
        });
        block
    }

    pub fn header(&self) -> HeapResult<BlockHeader> {
        decode_header(&self.bytes, 0)
    }

    pub fn checked_header(&self) -> HeapResult<BlockHeader> {
        let header = decode_header(&self.bytes, 0)?;
        check_footer(&self.bytes, 0, &header)?;
        Ok(header)
    }

    pub fn write(&mut self, header: &BlockHeader) {
        encode_block(&mut self.bytes, 0, header);
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_SIZE..self.bytes.len() - FOOTER_SIZE]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let end = self.bytes.len() - FOOTER_SIZE;
        &mut self.bytes[HEADER_SIZE..end]
    }

    pub fn size(&self) -> usize {
        self.bytes.len() - BLOCK_OVERHEAD
    }
}
