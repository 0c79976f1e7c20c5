use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::entry::LogEntryRef;

/// Failure captured for a single prefetched entry. Cloneable so every reader
/// blocked on the same slot observes the same error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("prefetch failed for entry {index}: {message}")]
pub struct PrefetchError {
    pub index: u64,
    pub message: String,
}

impl PrefetchError {
    pub fn new(index: u64, message: impl Into<String>) -> Self {
        Self {
            index,
            message: message.into(),
        }
    }

    pub fn evicted(index: u64) -> Self {
        Self::new(index, "entry evicted before prefetch completed")
    }
}

/// Single-assignment slot for one in-flight prefetch. The prefetch thread
/// fulfills it exactly once; readers block on `wait` until it resolves.
#[derive(Debug)]
pub struct PrefetchSlot {
    state: Mutex<SlotState>,
    resolved: Condvar,
}

#[derive(Debug)]
enum SlotState {
    Pending,
    Ready(LogEntryRef),
    Failed(PrefetchError),
}

impl PrefetchSlot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState::Pending),
            resolved: Condvar::new(),
        })
    }

    /// First fulfillment wins; a second one (eviction racing the prefetch
    /// thread) is ignored.
    pub fn fulfill(&self, result: Result<LogEntryRef, PrefetchError>) {
        let mut state = self.state.lock();
        if matches!(*state, SlotState::Pending) {
            *state = match result {
                Ok(entry) => SlotState::Ready(entry),
                Err(err) => SlotState::Failed(err),
            };
            self.resolved.notify_all();
        }
    }

    pub fn wait(&self) -> Result<LogEntryRef, PrefetchError> {
        let mut state = self.state.lock();
        loop {
            match &*state {
                SlotState::Ready(entry) => return Ok(entry.clone()),
                SlotState::Failed(err) => return Err(err.clone()),
                SlotState::Pending => {}
            }
            self.resolved.wait(&mut state);
        }
    }
}

/// Outcome of a non-blocking cache probe.
pub enum CacheLookup {
    Ready(LogEntryRef),
    /// Reserved by a prefetch that has not resolved yet; wait on the slot
    /// outside the cache lock.
    Pending(Arc<PrefetchSlot>),
    Failed(PrefetchError),
    Miss,
}

#[derive(Debug)]
enum CacheEntry {
    Ready(LogEntryRef),
    Prefetching(Arc<PrefetchSlot>),
    Failed(PrefetchError),
}

#[derive(Debug)]
struct CacheSlot {
    entry: CacheEntry,
    /// Bytes charged against the threshold, fixed at insertion time.
    charged: u64,
}

/// Bounded index → entry mapping. Eviction is strict FIFO by index: the log
/// is sequential and the apply path only moves forward, so the numerically
/// oldest entry is also the least likely to be re-read. The owning store
/// drives eviction through `has_space_available`/`pop_oldest_entry`, which
/// lets it refuse to evict entries that are not yet durable.
#[derive(Debug)]
pub struct InMemoryCache {
    cache: HashMap<u64, CacheSlot>,
    cache_size: u64,
    min_index: u64,
    max_index: u64,
    size_threshold: u64,
}

impl InMemoryCache {
    pub fn new(size_threshold: u64) -> Self {
        Self {
            cache: HashMap::new(),
            cache_size: 0,
            min_index: 0,
            max_index: 0,
            size_threshold,
        }
    }

    pub fn add_entry(&mut self, index: u64, entry: LogEntryRef) {
        let charged = entry.approx_size() as u64;
        self.insert(
            index,
            CacheSlot {
                entry: CacheEntry::Ready(entry),
                charged,
            },
        );
    }

    /// Reserves a slot for an in-flight prefetch. The size is charged
    /// immediately so worst-case memory stays bounded while the read is
    /// still on disk.
    pub fn add_prefetched_entry(&mut self, index: u64, size: u64) -> Arc<PrefetchSlot> {
        let slot = PrefetchSlot::new();
        self.insert(
            index,
            CacheSlot {
                entry: CacheEntry::Prefetching(slot.clone()),
                charged: size,
            },
        );
        slot
    }

    /// Resolves a reserved slot, waking blocked readers. A slot evicted in
    /// the meantime makes this a no-op.
    pub fn set_prefetched_entry(&mut self, index: u64, result: Result<LogEntryRef, PrefetchError>) {
        let Some(slot) = self.cache.get_mut(&index) else {
            return;
        };
        if !matches!(slot.entry, CacheEntry::Prefetching(_)) {
            return;
        }
        let resolved = match result.clone() {
            Ok(entry) => CacheEntry::Ready(entry),
            Err(err) => CacheEntry::Failed(err),
        };
        if let CacheEntry::Prefetching(pending) = std::mem::replace(&mut slot.entry, resolved) {
            pending.fulfill(result);
        }
    }

    pub fn lookup(&self, index: u64) -> CacheLookup {
        match self.cache.get(&index) {
            Some(slot) => match &slot.entry {
                CacheEntry::Ready(entry) => CacheLookup::Ready(entry.clone()),
                CacheEntry::Prefetching(pending) => CacheLookup::Pending(pending.clone()),
                CacheEntry::Failed(err) => CacheLookup::Failed(err.clone()),
            },
            None => CacheLookup::Miss,
        }
    }

    pub fn contains(&self, index: u64) -> bool {
        self.cache.contains_key(&index)
    }

    /// Removes the numerically oldest entry, returning its index.
    pub fn pop_oldest_entry(&mut self) -> Option<u64> {
        if self.cache.is_empty() {
            return None;
        }
        let index = self.min_index;
        self.remove(index);
        Some(index)
    }

    /// Evicts every entry below `index`.
    pub fn clean_up_to(&mut self, index: u64) {
        while !self.cache.is_empty() && self.min_index < index {
            let oldest = self.min_index;
            self.remove(oldest);
        }
    }

    /// Evicts every entry above `index`.
    pub fn clean_after(&mut self, index: u64) {
        while !self.cache.is_empty() && self.max_index > index {
            let newest = self.max_index;
            self.remove(newest);
        }
    }

    pub fn clear(&mut self) {
        let indices: Vec<u64> = self.cache.keys().copied().collect();
        for index in indices {
            self.remove(index);
        }
        self.cache_size = 0;
    }

    pub fn has_space_available(&self, size: u64) -> bool {
        self.cache_size + size <= self.size_threshold
    }

    pub fn over_threshold(&self) -> bool {
        self.cache_size > self.size_threshold
    }

    pub fn size_bytes(&self) -> u64 {
        self.cache_size
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn min_index(&self) -> Option<u64> {
        (!self.cache.is_empty()).then_some(self.min_index)
    }

    pub fn max_index(&self) -> Option<u64> {
        (!self.cache.is_empty()).then_some(self.max_index)
    }

    fn insert(&mut self, index: u64, slot: CacheSlot) {
        if let Some(previous) = self.cache.remove(&index) {
            self.cache_size -= previous.charged;
            self.abort_pending(index, previous);
        }
        if self.cache.is_empty() {
            self.min_index = index;
            self.max_index = index;
        } else {
            self.min_index = self.min_index.min(index);
            self.max_index = self.max_index.max(index);
        }
        self.cache_size += slot.charged;
        self.cache.insert(index, slot);
    }

    fn remove(&mut self, index: u64) {
        let Some(slot) = self.cache.remove(&index) else {
            return;
        };
        self.cache_size -= slot.charged;
        self.abort_pending(index, slot);
        if self.cache.is_empty() {
            self.min_index = 0;
            self.max_index = 0;
            return;
        }
        while self.min_index <= self.max_index && !self.cache.contains_key(&self.min_index) {
            self.min_index += 1;
        }
        while self.max_index >= self.min_index && !self.cache.contains_key(&self.max_index) {
            self.max_index -= 1;
        }
    }

    /// Readers blocked on an evicted reservation must not hang.
    fn abort_pending(&self, index: u64, slot: CacheSlot) {
        if let CacheEntry::Prefetching(pending) = slot.entry {
            pending.fulfill(Err(PrefetchError::evicted(index)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{EntryValueType, LogEntry};
    use std::thread;
    use std::time::Duration;

    fn entry(term: u64, bytes: usize) -> LogEntryRef {
        Arc::new(LogEntry::new(
            term,
            EntryValueType::Application,
            vec![0u8; bytes],
        ))
    }

    #[test]
    fn tracks_byte_size_and_bounds() {
        let mut cache = InMemoryCache::new(1_000);
        cache.add_entry(1, entry(1, 100));
        cache.add_entry(2, entry(1, 100));
        assert_eq!(cache.size_bytes(), 2 * (100 + 64) as u64);
        assert!(cache.has_space_available(500));
        assert!(!cache.has_space_available(800));
        assert_eq!(cache.min_index(), Some(1));
        assert_eq!(cache.max_index(), Some(2));
    }

    #[test]
    fn pops_oldest_first() {
        let mut cache = InMemoryCache::new(u64::MAX);
        for index in 10..15 {
            cache.add_entry(index, entry(1, 8));
        }
        assert_eq!(cache.pop_oldest_entry(), Some(10));
        assert_eq!(cache.pop_oldest_entry(), Some(11));
        assert_eq!(cache.min_index(), Some(12));
    }

    #[test]
    fn clean_ranges_evict_prefix_and_suffix() {
        let mut cache = InMemoryCache::new(u64::MAX);
        for index in 1..=10 {
            cache.add_entry(index, entry(1, 8));
        }
        cache.clean_up_to(4);
        assert!(!cache.contains(3));
        assert!(cache.contains(4));
        cache.clean_after(7);
        assert!(cache.contains(7));
        assert!(!cache.contains(8));
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn prefetch_slot_wakes_blocked_reader() {
        let mut cache = InMemoryCache::new(u64::MAX);
        let slot = cache.add_prefetched_entry(5, 128);
        let waiter = {
            let slot = slot.clone();
            thread::spawn(move || slot.wait())
        };
        thread::sleep(Duration::from_millis(20));
        cache.set_prefetched_entry(5, Ok(entry(2, 16)));
        let resolved = waiter.join().unwrap().unwrap();
        assert_eq!(resolved.term, 2);
        assert!(matches!(cache.lookup(5), CacheLookup::Ready(_)));
    }

    #[test]
    fn failed_prefetch_is_reraised() {
        let mut cache = InMemoryCache::new(u64::MAX);
        let slot = cache.add_prefetched_entry(7, 64);
        cache.set_prefetched_entry(7, Err(PrefetchError::new(7, "disk unplugged")));
        assert_eq!(
            slot.wait().unwrap_err(),
            PrefetchError::new(7, "disk unplugged")
        );
        assert!(matches!(cache.lookup(7), CacheLookup::Failed(_)));
    }

    #[test]
    fn evicting_a_reservation_unblocks_readers() {
        let mut cache = InMemoryCache::new(u64::MAX);
        let slot = cache.add_prefetched_entry(3, 64);
        cache.clean_after(2);
        assert_eq!(slot.wait().unwrap_err(), PrefetchError::evicted(3));
        assert!(cache.is_empty());
        assert_eq!(cache.size_bytes(), 0);
    }

    #[test]
    fn reservation_charges_bytes_immediately() {
        let mut cache = InMemoryCache::new(100);
        cache.add_prefetched_entry(1, 80);
        assert!(!cache.has_space_available(30));
        cache.set_prefetched_entry(1, Ok(entry(1, 8)));
        // Charged size stays at the reservation, keeping accounting stable.
        assert_eq!(cache.size_bytes(), 80);
    }
}
