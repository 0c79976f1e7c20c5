use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::config::{FlushSettings, LogFileSettings, SettingsError};
use crate::disk::{DiskError, LogDisk};
use crate::entry::{
    read_entry_from_buffer, write_entry_to_buffer, EntryDecodeError, LogEntry, LogEntryRef,
};
use crate::queue::{BoundedQueue, TryPushError};
use crate::record::{RecordCodec, RecordError};
use crate::segment::{
    parse_segment_file_name, LogLocation, SegmentDescriptor, SegmentError, SegmentWriter,
};
use crate::store::{LogEntryStorage, StoreError};

const WRITE_QUEUE_CAPACITY: usize = 4096;
const COMPLETION_QUEUE_CAPACITY: usize = 4096;
/// Deletions are best-effort; a dropped one only wastes disk space.
const DELETION_QUEUE_CAPACITY: usize = 128;

/// Non-owning hook through which the consensus library learns that its
/// appends and flushes completed. Invoked from a dedicated thread, never
/// from the writer's call stack, so a callback that takes the consensus
/// library's own lock cannot deadlock against a caller blocked on us.
pub trait CompletionListener: Send + Sync {
    fn on_append_completion(&self, success: bool);
}

/// Completion flag returned by `flush_async`. The writer thread fulfills it
/// exactly once after the covered appends are durable.
pub struct FlushWaiter {
    state: Mutex<Option<bool>>,
    done: Condvar,
}

impl FlushWaiter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(None),
            done: Condvar::new(),
        })
    }

    fn complete(&self, failed: bool) {
        let mut state = self.state.lock();
        if state.is_none() {
            *state = Some(failed);
            self.done.notify_all();
        }
    }

    pub fn wait(&self) -> Result<(), ChangelogError> {
        let mut state = self.state.lock();
        loop {
            match *state {
                Some(false) => return Ok(()),
                Some(true) => return Err(ChangelogError::FlushFailed),
                None => self.done.wait(&mut state),
            }
        }
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().is_some()
    }
}

/// Index/term summary of the live log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangelogLogInfo {
    pub first_log_index: u64,
    pub first_log_term: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
    pub last_durable_index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Uninitialized,
    Recovering,
    Ready,
    ShuttingDown,
    Shutdown,
}

enum WriteOperation {
    Append { index: u64, entry: LogEntryRef },
    Flush { waiter: Arc<FlushWaiter> },
}

struct DurableIndex {
    value: Mutex<u64>,
    advanced: Condvar,
}

impl DurableIndex {
    fn new() -> Self {
        Self {
            value: Mutex::new(0),
            advanced: Condvar::new(),
        }
    }

    fn get(&self) -> u64 {
        *self.value.lock()
    }

    fn advance(&self, index: u64) {
        let mut value = self.value.lock();
        if index > *value {
            *value = index;
            self.advanced.notify_all();
        }
    }

    /// Truncating writes are the one path allowed to move the floor down.
    fn reset_to(&self, index: u64) {
        let mut value = self.value.lock();
        if index < *value {
            *value = index;
        }
    }

    fn wait_for(&self, target: u64, timeout: Duration) -> u64 {
        let deadline = Instant::now() + timeout;
        let mut value = self.value.lock();
        while *value < target {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if self
                .advanced
                .wait_for(&mut value, deadline - now)
                .timed_out()
            {
                break;
            }
        }
        *value
    }
}

struct ChangelogCore {
    state: LifecycleState,
    segments: BTreeMap<u64, Arc<SegmentDescriptor>>,
    current_writer: Option<SegmentWriter>,
    /// First live index; `max_log_id == min_log_id - 1` means the log is empty.
    min_log_id: u64,
    max_log_id: u64,
    /// Locations appended since the last fsync, published to the store once
    /// the fsync makes them real.
    pending_locations: Vec<(u64, LogLocation)>,
    /// Set on the first disk write failure; the node is considered failed
    /// and every later flush reports failure.
    writer_failed: bool,
}

impl ChangelogCore {
    fn is_empty(&self) -> bool {
        self.max_log_id < self.min_log_id
    }
}

/// Shared context the writer thread operates on.
struct WriterContext {
    queue: Arc<BoundedQueue<WriteOperation>>,
    core: Arc<Mutex<ChangelogCore>>,
    storage: Arc<LogEntryStorage>,
    completion_queue: Arc<BoundedQueue<bool>>,
    durable: Arc<DurableIndex>,
    disk: Arc<dyn LogDisk>,
    settings: LogFileSettings,
    flush_settings: FlushSettings,
}

/// The durable, ordered log of consensus entries, physically realized as
/// rotating segment files.
///
/// A single writer thread consumes one FIFO queue of append/flush
/// operations; that serialization is the only ordering mechanism the on-disk
/// state needs. Completion callbacks are delivered from their own thread,
/// segment deletions from another. `shutdown` stops the pipelines in
/// dependency order: prefetcher, writer, completion, cleanup.
pub struct Changelog {
    disk: Arc<dyn LogDisk>,
    settings: LogFileSettings,
    flush_settings: FlushSettings,
    core: Arc<Mutex<ChangelogCore>>,
    entry_storage: Arc<LogEntryStorage>,
    write_operations: Arc<BoundedQueue<WriteOperation>>,
    completion_queue: Arc<BoundedQueue<bool>>,
    deletion_queue: Arc<BoundedQueue<String>>,
    durable: Arc<DurableIndex>,
    write_thread: Mutex<Option<JoinHandle<()>>>,
    completion_thread: Mutex<Option<JoinHandle<()>>>,
    clean_thread: Mutex<Option<JoinHandle<()>>>,
    listener: Arc<Mutex<Option<Weak<dyn CompletionListener>>>>,
}

impl Changelog {
    pub fn new(
        disk: Arc<dyn LogDisk>,
        settings: LogFileSettings,
        flush_settings: FlushSettings,
    ) -> Result<Self, ChangelogError> {
        settings.validate()?;
        flush_settings.validate()?;

        let core = Arc::new(Mutex::new(ChangelogCore {
            state: LifecycleState::Uninitialized,
            segments: BTreeMap::new(),
            current_writer: None,
            min_log_id: 1,
            max_log_id: 0,
            pending_locations: Vec::new(),
            writer_failed: false,
        }));
        let entry_storage = LogEntryStorage::new(disk.clone(), &settings);
        let write_operations = Arc::new(BoundedQueue::new(WRITE_QUEUE_CAPACITY));
        let completion_queue = Arc::new(BoundedQueue::new(COMPLETION_QUEUE_CAPACITY));
        let deletion_queue = Arc::new(BoundedQueue::<String>::new(DELETION_QUEUE_CAPACITY));
        let durable = Arc::new(DurableIndex::new());
        let listener: Arc<Mutex<Option<Weak<dyn CompletionListener>>>> = Arc::new(Mutex::new(None));

        let context = WriterContext {
            queue: write_operations.clone(),
            core: core.clone(),
            storage: entry_storage.clone(),
            completion_queue: completion_queue.clone(),
            durable: durable.clone(),
            disk: disk.clone(),
            settings: settings.clone(),
            flush_settings: flush_settings.clone(),
        };
        let write_thread = thread::spawn(move || write_thread_loop(context));

        let completion_listener = listener.clone();
        let completion_source = completion_queue.clone();
        let completion_thread = thread::spawn(move || {
            while let Some(success) = completion_source.pop() {
                let registered = completion_listener.lock().clone();
                if let Some(handle) = registered.and_then(|weak| weak.upgrade()) {
                    handle.on_append_completion(success);
                }
            }
        });

        let clean_disk = disk.clone();
        let clean_source = deletion_queue.clone();
        let clean_thread = thread::spawn(move || {
            while let Some(path) = clean_source.pop() {
                match clean_disk.remove(&path) {
                    Ok(()) => debug!("event=changelog_segment_removed path={path}"),
                    Err(err) if err.is_not_found() => {
                        debug!("event=changelog_segment_already_gone path={path}")
                    }
                    Err(err) => warn!("event=changelog_segment_remove_failed path={path} error={err}"),
                }
            }
        });

        Ok(Self {
            disk,
            settings,
            flush_settings,
            core,
            entry_storage,
            write_operations,
            completion_queue,
            deletion_queue,
            durable,
            write_thread: Mutex::new(Some(write_thread)),
            completion_thread: Mutex::new(Some(completion_thread)),
            clean_thread: Mutex::new(Some(clean_thread)),
            listener,
        })
    }

    /// Reads the changelog from disk and initializes the writer on its tail.
    ///
    /// Entries below `last_committed_index - logs_to_keep + 1` are skipped.
    /// Replay stops at the first invalid or torn record: that record is
    /// discarded and every segment starting after it is deleted, so a crash
    /// mid-write resolves to the last fully written, checksum-valid record.
    pub fn init(
        &self,
        last_committed_index: u64,
        logs_to_keep: u64,
    ) -> Result<(), ChangelogError> {
        {
            let mut core = self.core.lock();
            match core.state {
                LifecycleState::Uninitialized => core.state = LifecycleState::Recovering,
                LifecycleState::Recovering | LifecycleState::Ready => {
                    return Err(ChangelogError::ContractViolation {
                        message: "changelog initialized twice".to_string(),
                    })
                }
                LifecycleState::ShuttingDown | LifecycleState::Shutdown => {
                    return Err(ChangelogError::ShutDown)
                }
            }
        }
        let result = self.recover(last_committed_index, logs_to_keep);
        let mut core = self.core.lock();
        match &result {
            Ok(()) => core.state = LifecycleState::Ready,
            Err(_) => core.state = LifecycleState::Uninitialized,
        }
        result
    }

    fn recover(&self, last_committed_index: u64, logs_to_keep: u64) -> Result<(), ChangelogError> {
        let start_to_read_from = if last_committed_index > logs_to_keep {
            last_committed_index - logs_to_keep + 1
        } else {
            1
        };

        let mut discovered: BTreeMap<u64, Arc<SegmentDescriptor>> = BTreeMap::new();
        for name in self.disk.list()? {
            match parse_segment_file_name(&name) {
                Some(parsed) => {
                    discovered.insert(
                        parsed.from_log_index,
                        SegmentDescriptor::from_existing(&name, parsed),
                    );
                }
                None => debug!("event=changelog_foreign_file_skipped path={name}"),
            }
        }

        let mut core = self.core.lock();
        let mut first_seen: Option<u64> = None;
        let mut max_seen: u64 = 0;
        let mut expected_next: Option<u64> = None;
        let mut broken_from: Option<u64> = None;
        let mut tail_state: Option<(u64, u64)> = None; // (valid_len, entries)

        for (from, descriptor) in &discovered {
            if let Some(expected) = expected_next {
                if *from != expected {
                    warn!(
                        "event=changelog_recovery_hole expected={expected} found={from} path={}",
                        descriptor.path
                    );
                    broken_from = Some(*from);
                    break;
                }
            }

            let bytes = self.disk.read_all(&descriptor.path)?;
            let codec = RecordCodec::new(self.settings.checksum, descriptor.compressed);
            let mut offset = 0u64;
            let mut entries_in_file = 0u64;
            let mut file_expected = descriptor.from_log_index;
            let mut file_broken = false;

            loop {
                match codec.decode_at(&bytes, offset) {
                    Ok(Some(record)) => {
                        if record.index != file_expected {
                            warn!(
                                "event=changelog_recovery_out_of_order path={} expected={file_expected} found={}",
                                descriptor.path, record.index
                            );
                            file_broken = true;
                            break;
                        }
                        let location = LogLocation {
                            segment: descriptor.clone(),
                            position: offset,
                            size: record.consumed,
                        };
                        offset += record.consumed;
                        if record.index >= start_to_read_from {
                            self.entry_storage.add_entry_with_location(
                                record.index,
                                Arc::new(record.into_entry()),
                                location,
                            );
                        }
                        first_seen.get_or_insert(file_expected);
                        max_seen = file_expected;
                        file_expected += 1;
                        entries_in_file += 1;
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(
                            "event=changelog_recovery_truncated path={} offset={offset} error={err}",
                            descriptor.path
                        );
                        file_broken = true;
                        break;
                    }
                }
            }

            descriptor.set_to_log_index(file_expected.saturating_sub(1));
            tail_state = Some((offset, entries_in_file));
            core.segments.insert(*from, descriptor.clone());
            expected_next = Some(file_expected);

            if file_broken {
                broken_from = Some(file_expected);
                break;
            }
        }

        // Everything starting past the break point is unrecoverable.
        if let Some(broken_from) = broken_from {
            let stale: Vec<Arc<SegmentDescriptor>> = discovered
                .range(broken_from..)
                .map(|(_, descriptor)| descriptor.clone())
                .collect();
            for descriptor in stale {
                core.segments.remove(&descriptor.from_log_index);
                self.remove_segment_file(&descriptor);
            }
        }

        if first_seen.is_none() || max_seen < start_to_read_from {
            // Nothing usable: either a fresh disk, or every surviving entry
            // predates what the snapshot already covers.
            if first_seen.is_some() {
                warn!(
                    "event=changelog_recovery_stale max={max_seen} required={start_to_read_from}"
                );
            }
            let stale: Vec<Arc<SegmentDescriptor>> = core.segments.values().cloned().collect();
            core.segments.clear();
            self.entry_storage.clear();
            for descriptor in stale {
                self.remove_segment_file(&descriptor);
            }
            core.min_log_id = start_to_read_from;
            core.max_log_id = start_to_read_from - 1;
            info!(
                "event=changelog_recovered entries=0 min={} next={}",
                core.min_log_id,
                core.max_log_id + 1
            );
            return Ok(());
        }

        core.min_log_id = first_seen.unwrap_or(1).max(start_to_read_from);
        core.max_log_id = max_seen;
        self.durable.advance(core.max_log_id);

        // Reuse the tail segment unless it is full or was written with a
        // different compression setting than we are configured for now.
        if let Some((tail_from, descriptor)) = core.segments.iter().next_back() {
            let tail_from = *tail_from;
            let descriptor = descriptor.clone();
            let (valid_len, entries_in_file) = tail_state.unwrap_or((0, 0));
            let reusable = descriptor.compressed == self.settings.compress_logs
                && entries_in_file < descriptor.expected_entries();
            if reusable {
                let codec = RecordCodec::new(self.settings.checksum, descriptor.compressed);
                let writer = SegmentWriter::open_existing(
                    self.disk.as_ref(),
                    descriptor,
                    codec,
                    valid_len,
                    entries_in_file,
                )?;
                core.current_writer = Some(writer);
            } else {
                // Cut torn bytes even when the tail stays read-only, or the
                // next recovery would mistake them for corruption and drop
                // the segments we are about to write after it.
                if let Ok(file_size) = self.disk.file_size(&descriptor.path) {
                    if file_size > valid_len {
                        self.disk.open_for_append(&descriptor.path, Some(valid_len))?;
                    }
                }
                debug!("event=changelog_tail_not_reused from={tail_from}");
            }
        }

        let min_log_id = core.min_log_id;
        drop(core);
        match self.entry_storage.get_entry(min_log_id) {
            Ok(entry) => self.entry_storage.cache_first_log(min_log_id, entry),
            Err(err) => warn!("event=changelog_first_log_pin_failed index={min_log_id} error={err}"),
        }
        info!(
            "event=changelog_recovered min={} max={} segments={}",
            min_log_id,
            max_seen,
            self.core.lock().segments.len()
        );
        Ok(())
    }

    /// Appends an entry and returns without waiting for durability. The
    /// entry is readable immediately; `flush` or the completion callback
    /// report when it is on disk.
    pub fn append_entry(&self, index: u64, entry: LogEntryRef) -> Result<(), ChangelogError> {
        {
            let mut core = self.lock_ready()?;
            if index == 0 {
                return Err(ChangelogError::ContractViolation {
                    message: "log indices start at 1".to_string(),
                });
            }
            if core.is_empty() {
                core.min_log_id = index;
            } else if index != core.max_log_id + 1 {
                return Err(ChangelogError::ContractViolation {
                    message: format!(
                        "append at index {index} but next expected index is {}",
                        core.max_log_id + 1
                    ),
                });
            }
            core.max_log_id = index;
        }
        self.entry_storage.add_entry(index, entry.clone());
        if !self
            .write_operations
            .push(WriteOperation::Append { index, entry })
        {
            return Err(ChangelogError::ShutDown);
        }
        Ok(())
    }

    /// Writes `entry` at `index`, first discarding every entry above it.
    /// Synchronous: the truncated state and the new entry are durable when
    /// this returns, which callers rely on before taking snapshots.
    pub fn write_at(&self, index: u64, entry: LogEntryRef) -> Result<(), ChangelogError> {
        self.flush()?;
        let mut core = self.lock_ready()?;
        if index > core.max_log_id + 1 {
            return Err(ChangelogError::ContractViolation {
                message: format!(
                    "write_at index {index} is past the next slot {}",
                    core.max_log_id + 1
                ),
            });
        }
        if !core.is_empty() && index < core.min_log_id {
            return Err(ChangelogError::ContractViolation {
                message: format!(
                    "write_at index {index} is below the first live index {}",
                    core.min_log_id
                ),
            });
        }

        if index <= core.max_log_id {
            self.truncate_tail(&mut core, index)?;
        }

        // Append the overwriting entry synchronously through the same
        // segment machinery the writer thread uses.
        let context = self.writer_context();
        if core.is_empty() {
            core.min_log_id = index;
        }
        append_to_segment(&context, &mut core, index, &entry)?;
        let sync_ok = sync_pending(&context, &mut core);
        if !sync_ok {
            return Err(ChangelogError::FlushFailed);
        }
        core.max_log_id = index;
        drop(core);
        self.entry_storage.add_entry(index, entry);
        self.completion_queue.push(true);
        Ok(())
    }

    /// Discards entries `> index - 1` ahead of an overwrite at `index`.
    /// Segments wholly beyond the new tail are deleted; the segment holding
    /// `index` is truncated to its byte offset and becomes the write target.
    fn truncate_tail(
        &self,
        core: &mut ChangelogCore,
        index: u64,
    ) -> Result<(), ChangelogError> {
        let location =
            self.entry_storage
                .location_of(index)
                .ok_or(ChangelogError::ContractViolation {
                    message: format!("no durable location for overwritten index {index}"),
                })?;
        let target = location.segment.clone();

        let truncating_current = core
            .current_writer
            .as_ref()
            .map_or(false, |writer| {
                Arc::ptr_eq(writer.descriptor(), &target)
            });
        if !truncating_current {
            // Release the tail writer's handle before its file is unlinked.
            core.current_writer = None;
        }

        // Rotation may later recreate these exact file names, so the
        // truncation path unlinks synchronously instead of racing the
        // cleanup thread.
        let beyond: Vec<Arc<SegmentDescriptor>> = core
            .segments
            .range(target.from_log_index + 1..)
            .map(|(_, descriptor)| descriptor.clone())
            .collect();
        for descriptor in beyond {
            core.segments.remove(&descriptor.from_log_index);
            self.remove_segment_file(&descriptor);
        }
        let entries_kept = index - target.from_log_index;
        if truncating_current {
            if let Some(writer) = core.current_writer.as_mut() {
                let _guard = target.file_mutex.lock();
                writer.truncate_to(location.position, entries_kept)?;
            }
        } else {
            let codec = RecordCodec::new(self.settings.checksum, target.compressed);
            let _guard = target.file_mutex.lock();
            let writer = SegmentWriter::open_existing(
                self.disk.as_ref(),
                target.clone(),
                codec,
                location.position,
                entries_kept,
            )?;
            core.current_writer = Some(writer);
        }
        target.set_to_log_index(index.saturating_sub(1));

        self.entry_storage.clean_after(index.saturating_sub(1));
        core.max_log_id = index - 1;
        self.durable.reset_to(index - 1);
        debug!("event=changelog_truncated new_max={}", core.max_log_id);
        Ok(())
    }

    /// Removes segments whose whole range is `<= up_to_index`, freeing disk
    /// space once the entries are covered by a snapshot. Physical unlinks
    /// happen on the cleanup thread.
    pub fn compact(&self, up_to_index: u64) -> Result<(), ChangelogError> {
        let mut core = self.lock_ready()?;
        if core.is_empty() && up_to_index < core.min_log_id {
            return Ok(());
        }

        let removable: Vec<Arc<SegmentDescriptor>> = core
            .segments
            .values()
            .filter(|descriptor| {
                !descriptor.is_empty() && descriptor.to_log_index() <= up_to_index
            })
            .cloned()
            .collect();
        for descriptor in &removable {
            core.segments.remove(&descriptor.from_log_index);
            if core
                .current_writer
                .as_ref()
                .map_or(false, |writer| Arc::ptr_eq(writer.descriptor(), descriptor))
            {
                core.current_writer = None;
            }
            self.enqueue_segment_deletion(descriptor);
        }

        if up_to_index >= core.max_log_id {
            core.min_log_id = up_to_index + 1;
            core.max_log_id = up_to_index;
        } else {
            core.min_log_id = core.min_log_id.max(up_to_index + 1);
        }
        let min_log_id = core.min_log_id;
        let empty = core.is_empty();
        drop(core);

        self.entry_storage.clean_up_to(min_log_id);
        if !empty {
            match self.entry_storage.get_entry(min_log_id) {
                Ok(entry) => self.entry_storage.cache_first_log(min_log_id, entry),
                Err(err) => {
                    warn!("event=changelog_first_log_pin_failed index={min_log_id} error={err}")
                }
            }
        }
        info!(
            "event=changelog_compacted up_to={up_to_index} removed={}",
            removable.len()
        );
        Ok(())
    }

    /// Blocks until every append enqueued before this call is fsynced.
    pub fn flush(&self) -> Result<(), ChangelogError> {
        self.flush_async()?.wait()
    }

    /// Enqueues a flush marker and returns its completion flag. Queue order
    /// is durability order, so the flag covers every earlier append.
    pub fn flush_async(&self) -> Result<Arc<FlushWaiter>, ChangelogError> {
        self.lock_ready()?;
        let waiter = FlushWaiter::new();
        if !self.write_operations.push(WriteOperation::Flush {
            waiter: waiter.clone(),
        }) {
            return Err(ChangelogError::ShutDown);
        }
        Ok(waiter)
    }

    pub fn entry_at(&self, index: u64) -> Result<LogEntryRef, ChangelogError> {
        self.lock_ready()?;
        Ok(self.entry_storage.get_entry(index)?)
    }

    /// Entries in `[start, end)`. The range must lie inside the live log.
    pub fn get_entries_between(
        &self,
        start: u64,
        end: u64,
    ) -> Result<Vec<LogEntryRef>, ChangelogError> {
        {
            let core = self.lock_ready()?;
            if start > end || start < core.min_log_id || end > core.max_log_id + 1 {
                return Err(ChangelogError::ContractViolation {
                    message: format!(
                        "range [{start}, {end}) outside live log [{}, {}]",
                        core.min_log_id, core.max_log_id
                    ),
                });
            }
        }
        Ok(self.entry_storage.get_entries_between(start, end)?)
    }

    /// Last entry in the log, or a term-0 placeholder if it is empty.
    pub fn last_entry(&self) -> LogEntryRef {
        let max_log_id = {
            let core = self.core.lock();
            if core.is_empty() {
                return Arc::new(LogEntry::empty());
            }
            core.max_log_id
        };
        match self.entry_storage.get_entry(max_log_id) {
            Ok(entry) => entry,
            Err(err) => {
                warn!("event=changelog_last_entry_read_failed index={max_log_id} error={err}");
                Arc::new(LogEntry::empty())
            }
        }
    }

    pub fn latest_config_change(&self) -> Option<(u64, LogEntryRef)> {
        self.entry_storage.latest_config_change()
    }

    pub fn is_conf_log(&self, index: u64) -> bool {
        self.entry_storage.is_conf_log(index)
    }

    /// Serializes `count` entries starting at `index` into a transferable
    /// buffer for snapshot catch-up.
    pub fn serialize_entries_to_buffer(
        &self,
        index: u64,
        count: u64,
    ) -> Result<Vec<u8>, ChangelogError> {
        let entries = self.get_entries_between(index, index + count)?;
        let mut buf = Vec::new();
        buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        for (offset, entry) in entries.iter().enumerate() {
            write_entry_to_buffer(&mut buf, index + offset as u64, entry);
        }
        Ok(buf)
    }

    /// Applies entries from a transfer buffer, overwriting any overlap with
    /// the existing log.
    pub fn apply_entries_from_buffer(
        &self,
        index: u64,
        buffer: &[u8],
    ) -> Result<(), ChangelogError> {
        let mut cursor = buffer;
        if cursor.len() < 4 {
            return Err(ChangelogError::Entry(EntryDecodeError::Truncated));
        }
        let mut count_bytes = [0u8; 4];
        count_bytes.copy_from_slice(&cursor[..4]);
        cursor = &cursor[4..];
        let count = u32::from_le_bytes(count_bytes) as u64;

        for offset in 0..count {
            let (entry_index, entry) = read_entry_from_buffer(&mut cursor)?;
            let expected = index + offset;
            if entry_index != expected {
                return Err(ChangelogError::ContractViolation {
                    message: format!(
                        "buffer entry index {entry_index} does not match expected {expected}"
                    ),
                });
            }
            let entry = Arc::new(entry);
            let overlaps = {
                let core = self.lock_ready()?;
                !core.is_empty() && entry_index <= core.max_log_id
            };
            if overlaps {
                self.write_at(entry_index, entry)?;
            } else {
                self.append_entry(entry_index, entry)?;
            }
        }
        Ok(())
    }

    pub fn start_index(&self) -> u64 {
        self.core.lock().min_log_id
    }

    pub fn next_entry_index(&self) -> u64 {
        self.core.lock().max_log_id + 1
    }

    pub fn size(&self) -> u64 {
        let core = self.core.lock();
        core.max_log_id + 1 - core.min_log_id
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.core.lock().state, LifecycleState::Ready)
    }

    /// Highest index guaranteed fsynced, the only synchronized view of
    /// durability the consensus layer gets.
    pub fn last_durable_index(&self) -> u64 {
        self.durable.get()
    }

    /// Waits (caller-bounded) for the durable index to reach `target` and
    /// returns the value observed.
    pub fn wait_for_durable(&self, target: u64, timeout: Duration) -> u64 {
        self.durable.wait_for(target, timeout)
    }

    pub fn log_info(&self) -> ChangelogLogInfo {
        let (first_log_index, last_log_index, empty) = {
            let core = self.core.lock();
            (core.min_log_id, core.max_log_id, core.is_empty())
        };
        let first_log_term = if empty {
            0
        } else {
            match self.entry_storage.first_log() {
                Some((index, entry)) if index == first_log_index => entry.term,
                _ => self
                    .entry_storage
                    .get_entry(first_log_index)
                    .map_or(0, |entry| entry.term),
            }
        };
        let last_log_term = if empty { 0 } else { self.last_entry().term };
        ChangelogLogInfo {
            first_log_index,
            first_log_term,
            last_log_index,
            last_log_term,
            last_durable_index: self.durable.get(),
        }
    }

    /// Actual `[from, to]` ranges of the live segments, in order.
    pub fn segment_ranges(&self) -> Vec<(u64, u64)> {
        self.core
            .lock()
            .segments
            .values()
            .filter(|descriptor| !descriptor.is_empty())
            .map(|descriptor| (descriptor.from_log_index, descriptor.to_log_index()))
            .collect()
    }

    /// Warms the commit cache ahead of the consensus apply cursor.
    pub fn set_last_committed_index(&self, last_committed_index: u64) {
        self.entry_storage
            .start_commit_logs_prefetch(last_committed_index);
    }

    /// Registers the consensus-side callback target. Held weakly: the
    /// changelog must never keep the consensus engine alive.
    pub fn set_completion_listener(&self, handle: Weak<dyn CompletionListener>) {
        *self.listener.lock() = Some(handle);
    }

    /// Stops the pipelines in dependency order and releases the threads.
    /// Queued writer operations are drained, not abandoned; in-flight
    /// prefetches are cancelled.
    pub fn shutdown(&self) {
        {
            let mut core = self.core.lock();
            match core.state {
                LifecycleState::ShuttingDown | LifecycleState::Shutdown => return,
                _ => core.state = LifecycleState::ShuttingDown,
            }
        }
        self.entry_storage.shutdown();

        self.write_operations.close();
        join_pipeline_thread(&self.write_thread, "write");

        self.completion_queue.close();
        join_pipeline_thread(&self.completion_thread, "completion");

        self.deletion_queue.close();
        join_pipeline_thread(&self.clean_thread, "clean");

        self.core.lock().state = LifecycleState::Shutdown;
        info!("event=changelog_shutdown_complete");
    }

    fn lock_ready(&self) -> Result<parking_lot::MutexGuard<'_, ChangelogCore>, ChangelogError> {
        let core = self.core.lock();
        match core.state {
            LifecycleState::Ready => Ok(core),
            LifecycleState::Uninitialized | LifecycleState::Recovering => {
                Err(ChangelogError::NotInitialized)
            }
            LifecycleState::ShuttingDown | LifecycleState::Shutdown => {
                warn!("event=changelog_operation_after_shutdown");
                Err(ChangelogError::ShutDown)
            }
        }
    }

    fn writer_context(&self) -> WriterContext {
        WriterContext {
            queue: self.write_operations.clone(),
            core: self.core.clone(),
            storage: self.entry_storage.clone(),
            completion_queue: self.completion_queue.clone(),
            durable: self.durable.clone(),
            disk: self.disk.clone(),
            settings: self.settings.clone(),
            flush_settings: self.flush_settings.clone(),
        }
    }

    fn enqueue_segment_deletion(&self, descriptor: &Arc<SegmentDescriptor>) {
        descriptor.mark_deleted();
        let mut path = descriptor.path.clone();
        loop {
            match self.deletion_queue.try_push(path) {
                Ok(()) => return,
                Err(TryPushError::Full(returned)) => {
                    // Silently losing the oldest pending unlink is fine; it
                    // only leaves a file behind.
                    if let Some(dropped) = self.deletion_queue.pop_oldest() {
                        debug!("event=changelog_deletion_dropped path={dropped}");
                    }
                    path = returned;
                }
                Err(TryPushError::Closed(returned)) => {
                    debug!("event=changelog_deletion_after_shutdown path={returned}");
                    return;
                }
            }
        }
    }

    /// Synchronous removal used during recovery, before the pipelines matter.
    fn remove_segment_file(&self, descriptor: &Arc<SegmentDescriptor>) {
        descriptor.mark_deleted();
        match self.disk.remove(&descriptor.path) {
            Ok(()) => info!("event=changelog_broken_segment_removed path={}", descriptor.path),
            Err(err) if err.is_not_found() => {}
            Err(err) => warn!(
                "event=changelog_broken_segment_remove_failed path={} error={err}",
                descriptor.path
            ),
        }
    }
}

impl Drop for Changelog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn join_pipeline_thread(slot: &Mutex<Option<JoinHandle<()>>>, name: &str) {
    let handle = slot.lock().take();
    if let Some(handle) = handle {
        if handle.join().is_err() {
            warn!("event=changelog_thread_panic thread={name}");
        }
    }
}

/// Sole consumer of the write-operation queue. FIFO consumption is the
/// entire ordering story: enqueue order = on-disk order = durability order =
/// completion-notification order.
fn write_thread_loop(context: WriterContext) {
    while let Some(operation) = context.queue.pop() {
        match operation {
            WriteOperation::Append { index, entry } => {
                let mut core = context.core.lock();
                if let Err(err) = append_to_segment(&context, &mut core, index, &entry) {
                    error!("event=changelog_append_failed index={index} error={err}");
                    core.writer_failed = true;
                    core.pending_locations.clear();
                }
                let batch_full = core.pending_locations.len() as u64
                    >= context.flush_settings.max_flush_batch_size;
                if batch_full || context.queue.is_empty() {
                    let ok = sync_pending(&context, &mut core);
                    drop(core);
                    if !ok {
                        context.completion_queue.push(false);
                    }
                }
            }
            WriteOperation::Flush { waiter } => {
                let mut core = context.core.lock();
                let ok = sync_pending(&context, &mut core) && !core.writer_failed;
                drop(core);
                waiter.complete(!ok);
                context.completion_queue.push(ok);
            }
        }
    }
    // Shutdown drains: everything already queued still reaches disk.
    let mut core = context.core.lock();
    sync_pending(&context, &mut core);
}

fn append_to_segment(
    context: &WriterContext,
    core: &mut ChangelogCore,
    index: u64,
    entry: &LogEntryRef,
) -> Result<(), ChangelogError> {
    if core.writer_failed {
        return Err(ChangelogError::FlushFailed);
    }
    let needs_rotation = core.current_writer.as_ref().map_or(true, |writer| {
        writer.is_full(context.settings.rotate_interval, context.settings.max_size)
    });
    if needs_rotation {
        rotate_segment(context, core, index)?;
    }
    let Some(writer) = core.current_writer.as_mut() else {
        return Err(ChangelogError::ContractViolation {
            message: "no writable segment after rotation".to_string(),
        });
    };
    let location = writer.append(index, entry)?;
    core.pending_locations.push((index, location));
    Ok(())
}

fn rotate_segment(
    context: &WriterContext,
    core: &mut ChangelogCore,
    from: u64,
) -> Result<(), ChangelogError> {
    if let Some(previous) = core.current_writer.take() {
        let path = previous.descriptor().path.clone();
        previous.close(context.settings.force_sync)?;
        debug!("event=changelog_segment_closed path={path}");
    }
    let expected_to = from + context.settings.rotate_interval - 1;
    let descriptor = SegmentDescriptor::create(from, expected_to, context.settings.compress_logs);
    let codec = RecordCodec::new(context.settings.checksum, context.settings.compress_logs);
    let writer = SegmentWriter::create(
        context.disk.as_ref(),
        descriptor.clone(),
        codec,
        context.settings.overallocate_size,
    )?;
    core.segments.insert(from, descriptor.clone());
    core.current_writer = Some(writer);
    info!("event=changelog_rotated path={}", descriptor.path);
    Ok(())
}

/// Flushes buffered bytes, fsyncs, then publishes the batch's locations and
/// advances the durable index. Locations become visible only after the
/// fsync that made them true.
fn sync_pending(context: &WriterContext, core: &mut ChangelogCore) -> bool {
    if core.writer_failed {
        core.pending_locations.clear();
        return false;
    }
    if let Some(writer) = core.current_writer.as_mut() {
        if let Err(err) = writer.flush(context.settings.force_sync) {
            error!("event=changelog_flush_failed error={err}");
            core.writer_failed = true;
            core.pending_locations.clear();
            return false;
        }
    }
    let pending = std::mem::take(&mut core.pending_locations);
    if let Some((last_index, _)) = pending.last() {
        let last_index = *last_index;
        context.storage.add_log_locations(pending);
        context.durable.advance(last_index);
    }
    true
}

#[derive(Debug, Error)]
pub enum ChangelogError {
    #[error("changelog is not initialized")]
    NotInitialized,
    #[error("changelog is shut down")]
    ShutDown,
    #[error("changelog contract violation: {message}")]
    ContractViolation { message: String },
    #[error("flush failed, entries could not be made durable")]
    FlushFailed,
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Segment(#[from] SegmentError),
    #[error(transparent)]
    Disk(#[from] DiskError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Entry(#[from] EntryDecodeError),
}
