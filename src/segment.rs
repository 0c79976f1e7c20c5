use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::disk::{DiskError, DiskFile, LogDisk};
use crate::entry::LogEntry;
use crate::record::{RecordCodec, RecordError};

pub const SEGMENT_PREFIX: &str = "changelog";
const PLAIN_SUFFIX: &str = ".bin";
const COMPRESSED_SUFFIX: &str = ".bin.zst";

/// Builds `changelog_<from>_<to>.bin[.zst]`. The `to` in the name is the
/// range the segment was sized for; the descriptor tracks how far writes
/// actually got.
pub fn segment_file_name(from: u64, to: u64, compressed: bool) -> String {
    let suffix = if compressed {
        COMPRESSED_SUFFIX
    } else {
        PLAIN_SUFFIX
    };
    format!("{SEGMENT_PREFIX}_{from}_{to}{suffix}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedSegmentName {
    pub from_log_index: u64,
    pub to_log_index: u64,
    pub compressed: bool,
}

pub fn parse_segment_file_name(name: &str) -> Option<ParsedSegmentName> {
    let rest = name.strip_prefix(SEGMENT_PREFIX)?.strip_prefix('_')?;
    let (range, compressed) = if let Some(range) = rest.strip_suffix(COMPRESSED_SUFFIX) {
        (range, true)
    } else {
        (rest.strip_suffix(PLAIN_SUFFIX)?, false)
    };
    let (from, to) = range.split_once('_')?;
    let from_log_index: u64 = from.parse().ok()?;
    let to_log_index: u64 = to.parse().ok()?;
    if to_log_index < from_log_index {
        return None;
    }
    Some(ParsedSegmentName {
        from_log_index,
        to_log_index,
        compressed,
    })
}

/// Metadata for one on-disk segment file. Shared between the live segment
/// map, log locations and in-flight reads, so the mutable pieces are atomics
/// plus a file mutex serializing readers against truncation.
#[derive(Debug)]
pub struct SegmentDescriptor {
    pub from_log_index: u64,
    /// Highest index actually written; `from_log_index - 1` while empty.
    to_log_index: AtomicU64,
    /// Range end encoded in the filename.
    pub expected_to_log_index: u64,
    pub compressed: bool,
    pub path: String,
    pub file_mutex: Mutex<()>,
    deleted: AtomicBool,
}

impl SegmentDescriptor {
    pub fn create(from: u64, expected_to: u64, compressed: bool) -> Arc<Self> {
        Arc::new(Self {
            from_log_index: from,
            to_log_index: AtomicU64::new(from.saturating_sub(1)),
            expected_to_log_index: expected_to,
            compressed,
            path: segment_file_name(from, expected_to, compressed),
            file_mutex: Mutex::new(()),
            deleted: AtomicBool::new(false),
        })
    }

    pub fn from_existing(path: &str, parsed: ParsedSegmentName) -> Arc<Self> {
        Arc::new(Self {
            from_log_index: parsed.from_log_index,
            to_log_index: AtomicU64::new(parsed.from_log_index.saturating_sub(1)),
            expected_to_log_index: parsed.to_log_index,
            compressed: parsed.compressed,
            path: path.to_string(),
            file_mutex: Mutex::new(()),
            deleted: AtomicBool::new(false),
        })
    }

    pub fn to_log_index(&self) -> u64 {
        self.to_log_index.load(Ordering::Acquire)
    }

    pub fn set_to_log_index(&self, index: u64) {
        self.to_log_index.store(index, Ordering::Release);
    }

    pub fn is_empty(&self) -> bool {
        self.to_log_index() < self.from_log_index
    }

    pub fn expected_entries(&self) -> u64 {
        self.expected_to_log_index - self.from_log_index + 1
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }
}

/// Byte span of one record inside a segment, kept so entries evicted from
/// the caches stay retrievable from disk.
#[derive(Debug, Clone)]
pub struct LogLocation {
    pub segment: Arc<SegmentDescriptor>,
    pub position: u64,
    pub size: u64,
}

/// Appends records to the tail segment. Bytes accumulate in a memory buffer
/// until `flush`, so a record's location is known at append time while disk
/// writes stay batched.
pub struct SegmentWriter {
    descriptor: Arc<SegmentDescriptor>,
    file: Box<dyn DiskFile>,
    codec: RecordCodec,
    buf: Vec<u8>,
    file_len: u64,
    preallocated_len: u64,
    entries_written: u64,
}

impl SegmentWriter {
    /// Creates a fresh segment file, optionally preallocating disk space.
    pub fn create(
        disk: &dyn LogDisk,
        descriptor: Arc<SegmentDescriptor>,
        codec: RecordCodec,
        overallocate_size: u64,
    ) -> Result<Self, SegmentError> {
        let mut file = disk.open_for_append(&descriptor.path, Some(0))?;
        let mut preallocated_len = 0;
        if overallocate_size > 0 {
            // Best-effort latency hint; failure to grow the file is harmless.
            match file.set_len(overallocate_size) {
                Ok(()) => preallocated_len = overallocate_size,
                Err(err) => {
                    log::warn!(
                        "event=segment_preallocate_failed path={} error={err}",
                        descriptor.path
                    );
                }
            }
        }
        Ok(Self {
            descriptor,
            file,
            codec,
            buf: Vec::new(),
            file_len: 0,
            preallocated_len,
            entries_written: 0,
        })
    }

    /// Reopens the tail segment after recovery, cutting any torn bytes past
    /// the last valid record.
    pub fn open_existing(
        disk: &dyn LogDisk,
        descriptor: Arc<SegmentDescriptor>,
        codec: RecordCodec,
        valid_len: u64,
        entries_written: u64,
    ) -> Result<Self, SegmentError> {
        let file = disk.open_for_append(&descriptor.path, Some(valid_len))?;
        Ok(Self {
            descriptor,
            file,
            codec,
            buf: Vec::new(),
            file_len: valid_len,
            preallocated_len: valid_len,
            entries_written,
        })
    }

    pub fn append(&mut self, index: u64, entry: &LogEntry) -> Result<LogLocation, SegmentError> {
        let position = self.file_len + self.buf.len() as u64;
        let size = self.codec.encode(index, entry, &mut self.buf)?;
        self.entries_written += 1;
        self.descriptor.set_to_log_index(index);
        Ok(LogLocation {
            segment: self.descriptor.clone(),
            position,
            size,
        })
    }

    /// Writes buffered records to the file, fsyncing when `force_sync`.
    pub fn flush(&mut self, force_sync: bool) -> Result<(), SegmentError> {
        if !self.buf.is_empty() {
            self.file.write_all_at(&self.buf, self.file_len)?;
            self.file_len += self.buf.len() as u64;
            self.buf.clear();
        }
        if force_sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Cuts the segment back to `len` bytes after a truncating overwrite.
    /// Buffered bytes must already be flushed.
    pub fn truncate_to(&mut self, len: u64, entries_written: u64) -> Result<(), SegmentError> {
        debug_assert!(self.buf.is_empty());
        self.file.set_len(len)?;
        self.file_len = len;
        self.preallocated_len = self.preallocated_len.min(len);
        self.entries_written = entries_written;
        Ok(())
    }

    /// Flushes and trims the preallocated tail before the segment goes
    /// read-only.
    pub fn close(mut self, force_sync: bool) -> Result<(), SegmentError> {
        self.flush(force_sync)?;
        if self.preallocated_len > self.file_len {
            self.file.set_len(self.file_len)?;
            if force_sync {
                self.file.sync_data()?;
            }
        }
        Ok(())
    }

    pub fn descriptor(&self) -> &Arc<SegmentDescriptor> {
        &self.descriptor
    }

    pub fn written_bytes(&self) -> u64 {
        self.file_len + self.buf.len() as u64
    }

    pub fn entries_written(&self) -> u64 {
        self.entries_written
    }

    pub fn is_full(&self, rotate_interval: u64, max_size: u64) -> bool {
        if self.entries_written >= rotate_interval {
            return true;
        }
        max_size > 0 && self.written_bytes() >= max_size
    }
}

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error(transparent)]
    Disk(#[from] DiskError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("segment I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChecksumAlgorithm;
    use crate::disk::LocalDisk;
    use crate::entry::EntryValueType;
    use tempfile::TempDir;

    fn codec() -> RecordCodec {
        RecordCodec::new(ChecksumAlgorithm::Crc32, false)
    }

    fn entry(term: u64, data: &[u8]) -> LogEntry {
        LogEntry::new(term, EntryValueType::Application, data.to_vec())
    }

    #[test]
    fn file_name_round_trip() {
        let name = segment_file_name(1, 100_000, false);
        assert_eq!(name, "changelog_1_100000.bin");
        let parsed = parse_segment_file_name(&name).unwrap();
        assert_eq!(parsed.from_log_index, 1);
        assert_eq!(parsed.to_log_index, 100_000);
        assert!(!parsed.compressed);

        let compressed = segment_file_name(5, 9, true);
        assert_eq!(compressed, "changelog_5_9.bin.zst");
        assert!(parse_segment_file_name(&compressed).unwrap().compressed);
    }

    #[test]
    fn rejects_malformed_names() {
        for name in [
            "changelog_1.bin",
            "changelog_a_b.bin",
            "changelog_9_5.bin",
            "snapshot_1_5.bin",
            "changelog_1_5.log",
        ] {
            assert!(parse_segment_file_name(name).is_none(), "{name}");
        }
    }

    #[test]
    fn append_positions_are_contiguous() {
        let tmp = TempDir::new().unwrap();
        let disk = LocalDisk::new(tmp.path()).unwrap();
        let descriptor = SegmentDescriptor::create(1, 10, false);
        let mut writer = SegmentWriter::create(&disk, descriptor, codec(), 0).unwrap();

        let first = writer.append(1, &entry(1, b"aa")).unwrap();
        let second = writer.append(2, &entry(1, b"bbb")).unwrap();
        assert_eq!(first.position, 0);
        assert_eq!(second.position, first.size);
        writer.flush(true).unwrap();
        assert_eq!(writer.written_bytes(), first.size + second.size);
        assert_eq!(writer.descriptor().to_log_index(), 2);

        let bytes = disk.read_range(&writer.descriptor().path, second.position, second.size);
        let decoded = codec().decode_at(&bytes.unwrap(), 0).unwrap().unwrap();
        assert_eq!(decoded.index, 2);
        assert_eq!(decoded.data, b"bbb");
    }

    #[test]
    fn close_trims_preallocated_tail() {
        let tmp = TempDir::new().unwrap();
        let disk = LocalDisk::new(tmp.path()).unwrap();
        let descriptor = SegmentDescriptor::create(1, 10, false);
        let path = descriptor.path.clone();
        let mut writer = SegmentWriter::create(&disk, descriptor, codec(), 4096).unwrap();
        assert_eq!(disk.file_size(&path).unwrap(), 4096);
        let location = writer.append(1, &entry(1, b"x")).unwrap();
        writer.close(true).unwrap();
        assert_eq!(disk.file_size(&path).unwrap(), location.size);
    }

    #[test]
    fn rotation_triggers_on_entries_or_bytes() {
        let tmp = TempDir::new().unwrap();
        let disk = LocalDisk::new(tmp.path()).unwrap();
        let descriptor = SegmentDescriptor::create(1, 2, false);
        let mut writer = SegmentWriter::create(&disk, descriptor, codec(), 0).unwrap();
        writer.append(1, &entry(1, b"a")).unwrap();
        assert!(!writer.is_full(2, 0));
        writer.append(2, &entry(1, b"b")).unwrap();
        assert!(writer.is_full(2, 0));
        assert!(writer.is_full(100, 10));
    }
}
