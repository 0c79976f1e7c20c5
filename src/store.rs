use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::cache::{CacheLookup, InMemoryCache, PrefetchError};
use crate::config::{ChecksumAlgorithm, LogFileSettings};
use crate::disk::{DiskError, LogDisk};
use crate::entry::LogEntryRef;
use crate::queue::BoundedQueue;
use crate::record::{RecordCodec, RecordError};
use crate::segment::LogLocation;

const PREFETCH_QUEUE_CAPACITY: usize = 64;

/// Owns the two bounded caches and the location map backing them.
///
/// The *latest* cache is fed directly by appends and never evicts an entry
/// until its on-disk location is known; the *commit* cache is warmed by the
/// background prefetcher ahead of the consensus apply cursor. Entries absent
/// from both are resolved through `logs_location` with a targeted disk read.
pub struct LogEntryStorage {
    meta: Mutex<StoreMeta>,
    latest: Mutex<InMemoryCache>,
    commit: Mutex<InMemoryCache>,
    prefetch_queue: Arc<BoundedQueue<Arc<PrefetchTask>>>,
    current_prefetch: Mutex<Option<Arc<PrefetchTask>>>,
    prefetch_thread: Mutex<Option<JoinHandle<()>>>,
    is_shutdown: AtomicBool,
    disk: Arc<dyn LogDisk>,
    checksum: ChecksumAlgorithm,
    commit_cache_enabled: bool,
}

struct StoreMeta {
    logs_location: HashMap<u64, LogLocation>,
    max_index_with_location: u64,
    conf_indices: HashSet<u64>,
    latest_config: Option<(u64, LogEntryRef)>,
    first_log: Option<(u64, LogEntryRef)>,
}

struct PrefetchTask {
    reads: Vec<FileReadInfo>,
    first_index: u64,
    last_index: u64,
    cancel: AtomicBool,
    done: AtomicBool,
}

struct FileReadInfo {
    location: LogLocation,
    first_index: u64,
    count: u64,
}

impl LogEntryStorage {
    pub fn new(disk: Arc<dyn LogDisk>, settings: &LogFileSettings) -> Arc<Self> {
        let storage = Arc::new(Self {
            meta: Mutex::new(StoreMeta {
                logs_location: HashMap::new(),
                max_index_with_location: 0,
                conf_indices: HashSet::new(),
                latest_config: None,
                first_log: None,
            }),
            latest: Mutex::new(InMemoryCache::new(settings.latest_logs_cache_size_threshold)),
            commit: Mutex::new(InMemoryCache::new(settings.commit_logs_cache_size_threshold)),
            prefetch_queue: Arc::new(BoundedQueue::new(PREFETCH_QUEUE_CAPACITY)),
            current_prefetch: Mutex::new(None),
            prefetch_thread: Mutex::new(None),
            is_shutdown: AtomicBool::new(false),
            disk,
            checksum: settings.checksum,
            commit_cache_enabled: settings.commit_logs_cache_size_threshold > 0,
        });
        // The thread holds only a weak reference so dropping the storage
        // without an explicit shutdown still tears the loop down.
        let worker = Arc::downgrade(&storage);
        let queue = storage.prefetch_queue.clone();
        let handle = thread::spawn(move || {
            while let Some(task) = queue.pop() {
                let Some(storage) = worker.upgrade() else {
                    break;
                };
                storage.run_prefetch_task(&task);
                task.done.store(true, Ordering::Release);
            }
        });
        *storage.prefetch_thread.lock() = Some(handle);
        storage
    }

    /// Records a freshly appended entry. The entry stays pinned in the
    /// latest cache until a location for it arrives.
    pub fn add_entry(&self, index: u64, entry: LogEntryRef) {
        let mut meta = self.meta.lock();
        meta.note_entry(index, &entry);
        let mut latest = self.latest.lock();
        latest.add_entry(index, entry);
        evict_latest_overflow(&meta, &mut latest);
    }

    /// Records an entry whose on-disk location is already known (recovery
    /// replay path).
    pub fn add_entry_with_location(&self, index: u64, entry: LogEntryRef, location: LogLocation) {
        let mut meta = self.meta.lock();
        meta.note_entry(index, &entry);
        meta.logs_location.insert(index, location);
        meta.max_index_with_location = meta.max_index_with_location.max(index);
        let mut latest = self.latest.lock();
        latest.add_entry(index, entry);
        evict_latest_overflow(&meta, &mut latest);
    }

    /// Publishes locations for a batch of entries the writer just fsynced.
    /// Only after this do the corresponding latest-cache entries become
    /// evictable.
    pub fn add_log_locations(&self, locations: Vec<(u64, LogLocation)>) {
        if locations.is_empty() {
            return;
        }
        let mut meta = self.meta.lock();
        for (index, location) in locations {
            meta.max_index_with_location = meta.max_index_with_location.max(index);
            meta.logs_location.insert(index, location);
        }
        let mut latest = self.latest.lock();
        evict_latest_overflow(&meta, &mut latest);
    }

    pub fn contains(&self, index: u64) -> bool {
        {
            let meta = self.meta.lock();
            if meta.logs_location.contains_key(&index) {
                return true;
            }
            if matches!(meta.first_log, Some((first, _)) if first == index) {
                return true;
            }
        }
        if self.commit.lock().contains(index) {
            return true;
        }
        self.latest.lock().contains(index)
    }

    pub fn location_of(&self, index: u64) -> Option<LogLocation> {
        self.meta.lock().logs_location.get(&index).cloned()
    }

    pub fn get_entry(&self, index: u64) -> Result<LogEntryRef, StoreError> {
        let location = {
            let meta = self.meta.lock();
            if let Some((first, entry)) = &meta.first_log {
                if *first == index {
                    return Ok(entry.clone());
                }
            }
            if let Some((config_index, entry)) = &meta.latest_config {
                if *config_index == index {
                    return Ok(entry.clone());
                }
            }
            meta.logs_location.get(&index).cloned()
        };

        let pending = match self.commit.lock().lookup(index) {
            CacheLookup::Ready(entry) => return Ok(entry),
            CacheLookup::Failed(err) => return Err(StoreError::Prefetch(err)),
            CacheLookup::Pending(slot) => Some(slot),
            CacheLookup::Miss => None,
        };
        if let Some(slot) = pending {
            // Block outside the cache lock until the prefetcher resolves it.
            return slot.wait().map_err(StoreError::Prefetch);
        }

        if let CacheLookup::Ready(entry) = self.latest.lock().lookup(index) {
            return Ok(entry);
        }

        let Some(location) = location else {
            return Err(StoreError::EntryNotFound { index });
        };
        let entry = self.read_location(&location, index)?;
        let mut commit = self.commit.lock();
        if commit.has_space_available(entry.approx_size() as u64) {
            commit.add_entry(index, entry.clone());
        }
        Ok(entry)
    }

    /// Returns the contiguous run `[start, end)`. Any index that resolves
    /// through neither cache nor location is a hard error: the consensus
    /// layer only asks for ranges it knows to be live.
    pub fn get_entries_between(&self, start: u64, end: u64) -> Result<Vec<LogEntryRef>, StoreError> {
        let mut entries: Vec<Option<LogEntryRef>> = Vec::with_capacity((end - start) as usize);
        let mut misses: Vec<(usize, LogLocation)> = Vec::new();

        for index in start..end {
            let pending = match self.commit.lock().lookup(index) {
                CacheLookup::Ready(entry) => {
                    entries.push(Some(entry));
                    continue;
                }
                CacheLookup::Failed(err) => return Err(StoreError::Prefetch(err)),
                CacheLookup::Pending(slot) => Some(slot),
                CacheLookup::Miss => None,
            };
            if let Some(slot) = pending {
                entries.push(Some(slot.wait().map_err(StoreError::Prefetch)?));
                continue;
            }
            if let CacheLookup::Ready(entry) = self.latest.lock().lookup(index) {
                entries.push(Some(entry));
                continue;
            }
            let Some(location) = self.location_of(index) else {
                return Err(StoreError::RangeGap { index });
            };
            misses.push((entries.len(), location));
            entries.push(None);
        }

        for batch in group_contiguous(&misses) {
            let (slot_offset, first_location) = &misses[batch.start];
            let total: u64 = misses[batch.clone()].iter().map(|(_, l)| l.size).sum();
            let segment = &first_location.segment;
            let codec = RecordCodec::new(self.checksum, segment.compressed);
            let bytes = {
                let _guard = segment.file_mutex.lock();
                if segment.is_deleted() {
                    return Err(StoreError::EntryNotFound {
                        index: start + *slot_offset as u64,
                    });
                }
                self.disk
                    .read_range(&segment.path, first_location.position, total)?
            };
            let mut offset = 0u64;
            for (slot, location) in &misses[batch] {
                let record = codec
                    .decode_at(&bytes, offset)?
                    .ok_or(RecordError::Truncated { offset })?;
                let expected = start + *slot as u64;
                if record.index != expected {
                    return Err(StoreError::UnexpectedRecord {
                        expected,
                        found: record.index,
                    });
                }
                entries[*slot] = Some(Arc::new(record.into_entry()));
                offset += location.size;
            }
        }

        Ok(entries.into_iter().flatten().collect())
    }

    pub fn latest_config_change(&self) -> Option<(u64, LogEntryRef)> {
        self.meta.lock().latest_config.clone()
    }

    pub fn is_conf_log(&self, index: u64) -> bool {
        self.meta.lock().conf_indices.contains(&index)
    }

    /// Pins the entry at the log's first index so compaction-boundary reads
    /// never hit disk.
    pub fn cache_first_log(&self, index: u64, entry: LogEntryRef) {
        self.meta.lock().first_log = Some((index, entry));
    }

    pub fn first_log(&self) -> Option<(u64, LogEntryRef)> {
        self.meta.lock().first_log.clone()
    }

    /// Evicts everything below `index` (compaction).
    pub fn clean_up_to(&self, index: u64) {
        self.cancel_prefetch();
        {
            let mut meta = self.meta.lock();
            meta.logs_location.retain(|i, _| *i >= index);
            meta.conf_indices.retain(|i| *i >= index);
            if matches!(meta.latest_config, Some((i, _)) if i < index) {
                meta.latest_config = None;
            }
            if matches!(meta.first_log, Some((i, _)) if i < index) {
                meta.first_log = None;
            }
            if meta.max_index_with_location < index {
                meta.max_index_with_location = 0;
            }
        }
        self.latest.lock().clean_up_to(index);
        self.commit.lock().clean_up_to(index);
    }

    /// Evicts everything above `index` (truncating overwrite).
    pub fn clean_after(&self, index: u64) {
        self.cancel_prefetch();
        let restore_config = {
            let mut meta = self.meta.lock();
            meta.logs_location.retain(|i, _| *i <= index);
            meta.conf_indices.retain(|i| *i <= index);
            meta.max_index_with_location = meta.max_index_with_location.min(index);
            if matches!(meta.first_log, Some((i, _)) if i > index) {
                meta.first_log = None;
            }
            if matches!(meta.latest_config, Some((i, _)) if i > index) {
                meta.latest_config = None;
                meta.conf_indices.iter().max().copied()
            } else {
                None
            }
        };
        self.latest.lock().clean_after(index);
        self.commit.lock().clean_after(index);

        // The truncated tail may have carried the latest configuration;
        // fall back to the highest surviving one.
        if let Some(config_index) = restore_config {
            match self.get_entry(config_index) {
                Ok(entry) => self.meta.lock().latest_config = Some((config_index, entry)),
                Err(err) => warn!(
                    "event=latest_config_reload_failed index={config_index} error={err}"
                ),
            }
        }
    }

    pub fn clear(&self) {
        self.cancel_prefetch();
        let mut meta = self.meta.lock();
        meta.logs_location.clear();
        meta.max_index_with_location = 0;
        meta.conf_indices.clear();
        meta.latest_config = None;
        meta.first_log = None;
        self.latest.lock().clear();
        self.commit.lock().clear();
    }

    /// Schedules warming of the commit cache for the window just past the
    /// apply cursor. At most one prefetch task is in flight; entries already
    /// applied are evicted to make room for the window ahead.
    pub fn start_commit_logs_prefetch(&self, last_committed_index: u64) {
        if !self.commit_cache_enabled || self.is_shutdown.load(Ordering::Acquire) {
            return;
        }
        {
            let current = self.current_prefetch.lock();
            if let Some(task) = current.as_ref() {
                if !task.done.load(Ordering::Acquire) && !task.cancel.load(Ordering::Acquire) {
                    return;
                }
            }
        }

        let task = {
            let meta = self.meta.lock();
            let mut commit = self.commit.lock();
            commit.clean_up_to(last_committed_index + 1);

            let mut index = match commit.max_index() {
                Some(max) => max + 1,
                None => last_committed_index + 1,
            };
            let first_index = index;
            let mut reads: Vec<FileReadInfo> = Vec::new();
            while index <= meta.max_index_with_location {
                let Some(location) = meta.logs_location.get(&index) else {
                    break;
                };
                if commit.contains(index) || !commit.has_space_available(location.size) {
                    break;
                }
                commit.add_prefetched_entry(index, location.size);
                match reads.last_mut() {
                    Some(last)
                        if Arc::ptr_eq(&last.location.segment, &location.segment)
                            && last.location.position + last.location.size == location.position =>
                    {
                        last.location.size += location.size;
                        last.count += 1;
                    }
                    _ => reads.push(FileReadInfo {
                        location: location.clone(),
                        first_index: index,
                        count: 1,
                    }),
                }
                index += 1;
            }
            if reads.is_empty() {
                return;
            }
            Arc::new(PrefetchTask {
                reads,
                first_index,
                last_index: index - 1,
                cancel: AtomicBool::new(false),
                done: AtomicBool::new(false),
            })
        };

        debug!(
            "event=commit_prefetch_scheduled first={} last={}",
            task.first_index, task.last_index
        );
        *self.current_prefetch.lock() = Some(task.clone());
        if !self.prefetch_queue.push(task) {
            debug!("event=commit_prefetch_rejected reason=queue_closed");
        }
    }

    /// Stops the prefetcher: cancels in-flight work, drains the queue and
    /// wakes every reader still blocked on a reserved slot.
    pub fn shutdown(&self) {
        if self.is_shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel_prefetch();
        self.prefetch_queue.close();
        let handle = self.prefetch_thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("event=prefetch_thread_panic");
            }
        }
        self.commit.lock().clear();
    }

    pub fn latest_cache_size_bytes(&self) -> u64 {
        self.latest.lock().size_bytes()
    }

    pub fn commit_cache_size_bytes(&self) -> u64 {
        self.commit.lock().size_bytes()
    }

    fn cancel_prefetch(&self) {
        if let Some(task) = self.current_prefetch.lock().as_ref() {
            task.cancel.store(true, Ordering::Release);
        }
    }

    fn read_location(&self, location: &LogLocation, index: u64) -> Result<LogEntryRef, StoreError> {
        let segment = &location.segment;
        let bytes = {
            let _guard = segment.file_mutex.lock();
            if segment.is_deleted() {
                return Err(StoreError::EntryNotFound { index });
            }
            self.disk
                .read_range(&segment.path, location.position, location.size)?
        };
        let codec = RecordCodec::new(self.checksum, segment.compressed);
        let record = codec
            .decode_at(&bytes, 0)?
            .ok_or(RecordError::Truncated { offset: 0 })?;
        if record.index != index {
            return Err(StoreError::UnexpectedRecord {
                expected: index,
                found: record.index,
            });
        }
        Ok(Arc::new(record.into_entry()))
    }

    fn run_prefetch_task(&self, task: &PrefetchTask) {
        for read in &task.reads {
            if task.cancel.load(Ordering::Acquire) {
                // Whoever cancelled also evicted the reserved slots, which
                // unblocks their readers; nothing to resolve here.
                return;
            }
            let segment = &read.location.segment;
            let bytes = {
                let _guard = segment.file_mutex.lock();
                if segment.is_deleted() {
                    Err(DiskError::NotFound {
                        name: segment.path.clone(),
                    })
                } else {
                    self.disk
                        .read_range(&segment.path, read.location.position, read.location.size)
                }
            };
            let bytes = match bytes {
                Ok(bytes) => bytes,
                Err(err) => {
                    self.fail_prefetch_from(task, read.first_index, &err.to_string());
                    return;
                }
            };

            let codec = RecordCodec::new(self.checksum, segment.compressed);
            let mut offset = 0u64;
            for expected in read.first_index..read.first_index + read.count {
                if task.cancel.load(Ordering::Acquire) {
                    return;
                }
                let record = match codec.decode_at(&bytes, offset) {
                    Ok(Some(record)) if record.index == expected => record,
                    Ok(Some(record)) => {
                        self.fail_prefetch_from(
                            task,
                            expected,
                            &format!("unexpected record index {}", record.index),
                        );
                        return;
                    }
                    Ok(None) => {
                        self.fail_prefetch_from(task, expected, "short prefetch read");
                        return;
                    }
                    Err(err) => {
                        self.fail_prefetch_from(task, expected, &err.to_string());
                        return;
                    }
                };
                offset += record.consumed;
                self.commit
                    .lock()
                    .set_prefetched_entry(expected, Ok(Arc::new(record.into_entry())));
            }
        }
    }

    /// A failed read poisons only the slots it covered; unrelated entries
    /// and later prefetches are unaffected.
    fn fail_prefetch_from(&self, task: &PrefetchTask, from_index: u64, message: &str) {
        warn!(
            "event=commit_prefetch_failed first={from_index} last={} error={message}",
            task.last_index
        );
        let mut commit = self.commit.lock();
        for index in from_index..=task.last_index {
            commit.set_prefetched_entry(index, Err(PrefetchError::new(index, message)));
        }
    }
}

impl Drop for LogEntryStorage {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn evict_latest_overflow(meta: &StoreMeta, latest: &mut InMemoryCache) {
    while latest.over_threshold() {
        let Some(oldest) = latest.min_index() else {
            break;
        };
        // An entry with no recorded location exists nowhere but here; it
        // must stay resident until the writer makes it durable.
        if !meta.logs_location.contains_key(&oldest) {
            break;
        }
        latest.pop_oldest_entry();
    }
}

impl StoreMeta {
    fn note_entry(&mut self, index: u64, entry: &LogEntryRef) {
        if entry.value_type.is_config() {
            self.conf_indices.insert(index);
            if self
                .latest_config
                .as_ref()
                .map_or(true, |(latest, _)| index >= *latest)
            {
                self.latest_config = Some((index, entry.clone()));
            }
        }
    }
}

fn group_contiguous(misses: &[(usize, LogLocation)]) -> Vec<std::ops::Range<usize>> {
    let mut groups = Vec::new();
    let mut start = 0;
    for i in 1..misses.len() {
        let (prev_slot, prev) = &misses[i - 1];
        let (slot, current) = &misses[i];
        let adjacent = *slot == prev_slot + 1
            && Arc::ptr_eq(&prev.segment, &current.segment)
            && prev.position + prev.size == current.position;
        if !adjacent {
            groups.push(start..i);
            start = i;
        }
    }
    if !misses.is_empty() {
        groups.push(start..misses.len());
    }
    groups
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("log entry {index} not found")]
    EntryNotFound { index: u64 },
    #[error("gap in requested log range at index {index}")]
    RangeGap { index: u64 },
    #[error(transparent)]
    Prefetch(#[from] PrefetchError),
    #[error("record index mismatch: expected {expected}, found {found}")]
    UnexpectedRecord { expected: u64, found: u64 },
    #[error(transparent)]
    Disk(#[from] DiskError),
    #[error(transparent)]
    Record(#[from] RecordError),
}
