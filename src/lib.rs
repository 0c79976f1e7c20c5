//! Persistent changelog backing a Raft-style coordination service.
//!
//! Consensus log entries live in rotating on-disk segment files behind a
//! bounded two-tier cache. Appends, flushes, compaction and completion
//! callbacks run on dedicated background threads so disk latency and
//! callback locking never block the consensus library's call stack.

pub mod cache;
pub mod changelog;
pub mod config;
pub mod disk;
pub mod entry;
pub mod queue;
pub mod record;
pub mod segment;
pub mod store;

pub use cache::{CacheLookup, InMemoryCache, PrefetchError, PrefetchSlot};
pub use changelog::{
    Changelog, ChangelogError, ChangelogLogInfo, CompletionListener, FlushWaiter,
};
pub use config::{ChecksumAlgorithm, FlushSettings, LogFileSettings, SettingsError};
pub use disk::{DiskError, DiskFile, LocalDisk, LogDisk};
pub use entry::{EntryValueType, LogEntry, LogEntryRef};
pub use queue::BoundedQueue;
pub use record::{RecordCodec, RecordError, RecordHeader, CURRENT_FORMAT_VERSION};
pub use segment::{
    parse_segment_file_name, segment_file_name, LogLocation, SegmentDescriptor, SegmentError,
    SegmentWriter,
};
pub use store::{LogEntryStorage, StoreError};
