//! Size-bounded resource cache
//!
//! Entries are kept sorted by key and each one owns a single heap block.
//! Locking an entry pins its block; unreferenced entries may be evicted to
//! make room for new ones.
//!
//! Eviction is frequency first: entries with fewer hits go first, and among
//! equal hit counts the one with the lower MRU rank goes first. Referenced
//! entries are never evicted.

use crate::allocator::{Heap, HeapHandle, HeapStats};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::source::ResourceSource;
use serde::Serialize;
use std::cmp::Ordering;
use tracing::{debug, warn};

/// Key identifying a resource
pub type CacheKey = i32;

/// Pin on a cache entry returned by [`Cache::lock`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle {
    key: CacheKey,
    id: u64,
}

impl EntryHandle {
    pub fn key(&self) -> CacheKey {
        self.key
    }
}

/// A cached resource
#[derive(Debug, Clone)]
pub struct CacheEntry {
    key: CacheKey,
    id: u64,
    size: usize,
    handle: HeapHandle,
    reference_count: u32,
    hits: u32,
    mru: u32,
    marked: bool,
}

impl CacheEntry {
    pub fn key(&self) -> CacheKey {
        self.key
    }

    /// Bytes recorded for the entry
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn reference_count(&self) -> u32 {
        self.reference_count
    }

    /// Hits after the initial fetch
    pub fn hits(&self) -> u32 {
        self.hits
    }

    pub fn mru(&self) -> u32 {
        self.mru
    }
}

/// Referenced entries sort last; then fewer hits, then lower MRU rank
fn eviction_order(a: &CacheEntry, b: &CacheEntry) -> Ordering {
    (a.reference_count != 0)
        .cmp(&(b.reference_count != 0))
        .then(a.hits.cmp(&b.hits))
        .then(a.mru.cmp(&b.mru))
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub referenced_entries: usize,
    pub total_size: usize,
    pub max_size: usize,
    pub hit_counter: u32,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub heap: HeapStats,
}

impl CacheStats {
    /// Hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

pub struct Cache<S: ResourceSource> {
    /// Sorted by key, no duplicates
    entries: Vec<CacheEntry>,
    heap: Heap,
    source: S,
    config: CacheConfig,
    total_size: usize,
    hit_counter: u32,
    next_id: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<S: ResourceSource> Cache<S> {
    /// Create a cache whose heap can hold `config.max_size` bytes
    pub fn new(config: CacheConfig, source: S) -> Result<Self> {
        config.validate()?;

        let heap = Heap::with_config(config.max_size, config.heap.clone())?;
        let entries = Vec::with_capacity(config.initial_entries);

        debug!("Created cache: max_size={}", config.max_size);

        Ok(Cache {
            entries,
            heap,
            source,
            config,
            total_size: 0,
            hit_counter: 0,
            next_id: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Summed size of all entries
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn contains(&self, key: CacheKey) -> bool {
        self.find(key).is_ok()
    }

    pub fn entry(&self, key: CacheKey) -> Option<&CacheEntry> {
        self.find(key).ok().map(|index| &self.entries[index])
    }

    /// Entries in key order
    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.iter()
    }

    fn find(&self, key: CacheKey) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by_key(&key, |entry| entry.key)
    }

    /// Pin the resource for `key`, fetching it from the source on a miss
    pub fn lock(&mut self, key: CacheKey) -> Result<EntryHandle> {
        let index = match self.find(key) {
            Ok(index) => {
                self.hits += 1;
                self.entries[index].hits += 1;
                index
            }
            Err(_) => {
                self.misses += 1;
                let entry = self.fetch(key)?;
                self.insert(entry)?
            }
        };

        self.pin(index)
    }

    fn pin(&mut self, index: usize) -> Result<EntryHandle> {
        let entry = &mut self.entries[index];
        if entry.reference_count == 0 {
            self.heap.lock(entry.handle)?;
        }

        entry.reference_count += 1;

        self.hit_counter += 1;
        entry.mru = self.hit_counter;

        let handle = EntryHandle {
            key: entry.key,
            id: entry.id,
        };

        if self.hit_counter == u32::MAX {
            self.reset_statistics();
        }

        Ok(handle)
    }

    /// Read a resource into a fresh heap block
    fn fetch(&mut self, key: CacheKey) -> Result<CacheEntry> {
        let size = self.source.size_of(key).map_err(|source| {
            warn!("Could not size resource {}: {}", key, source);
            CacheError::Source { key, source }
        })?;

        if size > self.config.max_size {
            warn!(
                "Resource {} of {} bytes does not fit in cache of {} bytes",
                key, size, self.config.max_size
            );
            return Err(CacheError::TooLarge {
                key,
                size,
                max_size: self.config.max_size,
            });
        }

        self.ensure_size(size)?;

        let handle = self.allocate_block(size)?;

        let read = match self.read_block(key, handle, size) {
            Ok(read) => read,
            Err(e) => {
                if let Err(err) = self.heap.deallocate(handle) {
                    warn!("Could not release block for resource {}: {}", key, err);
                }
                return Err(e);
            }
        };

        let id = self.next_id;
        self.next_id += 1;

        debug!("Fetched resource {} ({} bytes)", key, read);

        Ok(CacheEntry {
            key,
            id,
            size: read,
            handle,
            reference_count: 0,
            hits: 0,
            mru: 0,
            marked: false,
        })
    }

    /// Allocate a block, evicting progressively more before giving up
    fn allocate_block(&mut self, size: usize) -> Result<HeapHandle> {
        let max_size = self.config.max_size;
        let mut target = size;

        for _ in 0..self.config.allocation_retries {
            if let Ok(handle) = self.heap.allocate(size, false) {
                return Ok(handle);
            }

            target += (size as f64 * self.config.retry_growth) as usize;
            if target > max_size || self.ensure_size(target).is_err() {
                break;
            }
        }

        debug!("Flushing cache to make room for {} bytes", size);
        self.flush();

        self.heap
            .allocate(size, false)
            .or_else(|_| self.heap.allocate(size, true))
            .map_err(|e| {
                warn!("Could not allocate {} bytes for cache entry: {}", size, e);
                e.into()
            })
    }

    fn read_block(&mut self, key: CacheKey, handle: HeapHandle, size: usize) -> Result<usize> {
        self.heap.lock(handle)?;

        let read = match self.heap.data_mut(handle) {
            Ok(buf) => self
                .source
                .read_into(key, &mut buf[..size])
                .map(|read| read.min(size))
                .map_err(|source| {
                    warn!("Could not read resource {}: {}", key, source);
                    CacheError::Source { key, source }
                }),
            Err(e) => Err(e.into()),
        };

        self.heap.unlock(handle)?;
        read
    }

    fn insert(&mut self, entry: CacheEntry) -> Result<usize> {
        let index = match self.find(entry.key) {
            Ok(_) => return Err(CacheError::DuplicateKey(entry.key)),
            Err(index) => index,
        };

        if self.entries.len() + 1 >= self.entries.capacity() {
            self.entries.reserve_exact(self.config.entry_growth);
        }

        self.total_size += entry.size;
        self.entries.insert(index, entry);
        Ok(index)
    }

    /// Release a pin taken with [`Cache::lock`]
    pub fn unlock(&mut self, handle: EntryHandle) -> Result<()> {
        let index = self.resolve(handle)?;
        let entry = &mut self.entries[index];

        if entry.reference_count == 0 {
            warn!("Resource {} is not locked", handle.key);
            return Err(CacheError::NotLocked(handle.key));
        }

        entry.reference_count -= 1;
        if entry.reference_count == 0 {
            self.heap.unlock(entry.handle)?;
        }

        Ok(())
    }

    /// Bytes of a pinned entry
    pub fn data(&self, handle: EntryHandle) -> Result<&[u8]> {
        let entry = &self.entries[self.resolve(handle)?];
        if entry.reference_count == 0 {
            return Err(CacheError::NotLocked(handle.key));
        }

        Ok(&self.heap.data(entry.handle)?[..entry.size])
    }

    fn resolve(&self, handle: EntryHandle) -> Result<usize> {
        match self.find(handle.key) {
            Ok(index) if self.entries[index].id == handle.id => Ok(index),
            _ => Err(CacheError::UnknownEntry(handle.key)),
        }
    }

    /// Evict every unreferenced entry, returning how many were evicted
    ///
    /// Flushing cannot fail: a block that cannot be released is logged and
    /// its entry is dropped anyway.
    pub fn flush(&mut self) -> usize {
        let before = self.entries.len();
        for entry in self.entries.iter_mut() {
            if entry.reference_count == 0 {
                entry.marked = true;
            }
        }

        self.sweep();
        let evicted = before - self.entries.len();

        let limit = self.entries.len() + self.config.entry_growth;
        if self.entries.capacity() > limit {
            self.entries.shrink_to(limit);
        }

        evicted
    }

    /// Evict until `size` more bytes fit under `max_size`
    fn ensure_size(&mut self, size: usize) -> Result<()> {
        let max_size = self.config.max_size;
        let available = max_size.saturating_sub(self.total_size);

        if size > max_size {
            return Err(CacheError::InsufficientSpace {
                requested: size,
                available,
            });
        }

        if available >= size {
            return Ok(());
        }

        let mut order: Vec<usize> = (0..self.entries.len()).collect();
        order.sort_by(|&a, &b| eviction_order(&self.entries[a], &self.entries[b]));

        let threshold = size + (self.total_size as f64 * self.config.eviction_slack) as usize;

        let mut accumulated = 0;
        let mut stop = 0;
        while stop < order.len() {
            let entry = &mut self.entries[order[stop]];
            if entry.reference_count == 0 {
                if entry.size >= threshold {
                    entry.marked = true;
                    accumulated = 0;
                    break;
                }

                accumulated += entry.size;
                if accumulated >= threshold {
                    break;
                }
            }
            stop += 1;
        }

        if accumulated != 0 {
            let stop = stop.min(order.len() - 1);
            for &index in &order[..=stop] {
                let entry = &mut self.entries[index];
                if entry.reference_count == 0 {
                    entry.marked = true;
                }
            }
        }

        debug!(
            "Evicting for {} bytes: threshold {}, cache holds {} bytes",
            size, threshold, self.total_size
        );
        self.sweep();

        let available = max_size.saturating_sub(self.total_size);
        if available < size {
            warn!(
                "Could not make room for {} bytes, {} available",
                size, available
            );
            return Err(CacheError::InsufficientSpace {
                requested: size,
                available,
            });
        }

        Ok(())
    }

    /// Remove marked entries that are still unreferenced
    fn sweep(&mut self) {
        let mut index = 0;
        while index < self.entries.len() {
            let entry = &mut self.entries[index];
            if !entry.marked {
                index += 1;
                continue;
            }

            if entry.reference_count != 0 {
                entry.marked = false;
                index += 1;
                continue;
            }

            let entry = self.entries.remove(index);
            self.release(&entry);
            self.total_size -= entry.size;
            self.evictions += 1;
        }
    }

    fn release(&mut self, entry: &CacheEntry) {
        match self.heap.lock(entry.handle) {
            Ok(_) => {
                if let Ok(data) = self.heap.data(entry.handle) {
                    self.source.free_item(entry.key, &data[..entry.size]);
                }
                if let Err(e) = self.heap.unlock(entry.handle) {
                    warn!("Could not unlock resource {}: {}", entry.key, e);
                }
            }
            Err(e) => warn!("Could not lock resource {} for release: {}", entry.key, e),
        }

        if let Err(e) = self.heap.deallocate(entry.handle) {
            warn!("Could not free block of resource {}: {}", entry.key, e);
        }

        debug!("Evicted resource {} ({} bytes)", entry.key, entry.size);
    }

    /// Re-rank MRU values once the hit counter is exhausted
    fn reset_statistics(&mut self) {
        let mut order: Vec<usize> = (0..self.entries.len()).collect();
        order.sort_by(|&a, &b| self.entries[b].mru.cmp(&self.entries[a].mru));

        for (rank, &index) in order.iter().enumerate() {
            self.entries[index].mru = rank as u32;
        }

        self.hit_counter = self.entries.len() as u32;
        debug!("Reset cache statistics for {} entries", self.entries.len());
    }

    /// Drop every pin without touching the entries' hit statistics
    fn clean(&mut self) {
        for entry in self.entries.iter_mut() {
            if entry.reference_count != 0 {
                if let Err(e) = self.heap.unlock(entry.handle) {
                    warn!("Could not unlock resource {}: {}", entry.key, e);
                }
                entry.reference_count = 0;
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            referenced_entries: self
                .entries
                .iter()
                .filter(|entry| entry.reference_count != 0)
                .count(),
            total_size: self.total_size,
            max_size: self.config.max_size,
            hit_counter: self.hit_counter,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            heap: self.heap.stats(),
        }
    }

    pub fn print_stats(&self) -> String {
        "Cache stats are disabled.\n".to_string()
    }

    #[cfg(test)]
    pub(crate) fn set_hit_counter(&mut self, value: u32) {
        self.hit_counter = value;
    }
}

impl<S: ResourceSource> Drop for Cache<S> {
    fn drop(&mut self) {
        self.clean();
        self.flush();
    }
}
