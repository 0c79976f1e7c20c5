use std::sync::Arc;

use thiserror::Error;

/// Wire tag distinguishing application payloads from configuration changes.
/// Unknown tags are carried through untouched so a newer peer's entries
/// survive a round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryValueType {
    Application,
    Configuration,
    Other(i32),
}

impl EntryValueType {
    pub fn to_wire(self) -> i32 {
        match self {
            EntryValueType::Application => 0,
            EntryValueType::Configuration => 1,
            EntryValueType::Other(raw) => raw,
        }
    }

    pub fn from_wire(raw: i32) -> Self {
        match raw {
            0 => EntryValueType::Application,
            1 => EntryValueType::Configuration,
            other => EntryValueType::Other(other),
        }
    }

    pub fn is_config(self) -> bool {
        matches!(self, EntryValueType::Configuration)
    }
}

/// One consensus log entry. Shared as `Arc<LogEntry>` between the caches,
/// the store and callers; the payload is never copied on the hot path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub term: u64,
    pub value_type: EntryValueType,
    pub data: Vec<u8>,
}

pub type LogEntryRef = Arc<LogEntry>;

/// Fixed per-entry bookkeeping cost charged against cache thresholds in
/// addition to the payload bytes.
pub const ENTRY_SIZE_OVERHEAD: usize = 64;

impl LogEntry {
    pub fn new(term: u64, value_type: EntryValueType, data: Vec<u8>) -> Self {
        Self {
            term,
            value_type,
            data,
        }
    }

    /// Placeholder returned for reads of an empty log.
    pub fn empty() -> Self {
        Self::new(0, EntryValueType::Application, Vec::new())
    }

    pub fn approx_size(&self) -> usize {
        self.data.len() + ENTRY_SIZE_OVERHEAD
    }
}

const BUFFER_ENTRY_HEADER_BYTES: usize = 8 + 8 + 4 + 8;

/// Appends `(index, entry)` in the flat little-endian transfer format used
/// for snapshot catch-up buffers.
pub fn write_entry_to_buffer(out: &mut Vec<u8>, index: u64, entry: &LogEntry) {
    out.reserve(BUFFER_ENTRY_HEADER_BYTES + entry.data.len());
    out.extend_from_slice(&index.to_le_bytes());
    out.extend_from_slice(&entry.term.to_le_bytes());
    out.extend_from_slice(&entry.value_type.to_wire().to_le_bytes());
    out.extend_from_slice(&(entry.data.len() as u64).to_le_bytes());
    out.extend_from_slice(&entry.data);
}

/// Reads one `(index, entry)` pair, advancing the cursor past it.
pub fn read_entry_from_buffer(cursor: &mut &[u8]) -> Result<(u64, LogEntry), EntryDecodeError> {
    let index = read_u64(cursor)?;
    let term = read_u64(cursor)?;
    let value_type = EntryValueType::from_wire(read_i32(cursor)?);
    let len = read_u64(cursor)? as usize;
    if cursor.len() < len {
        return Err(EntryDecodeError::Truncated);
    }
    let (data, rest) = cursor.split_at(len);
    let data = data.to_vec();
    *cursor = rest;
    Ok((index, LogEntry::new(term, value_type, data)))
}

fn read_u64(cursor: &mut &[u8]) -> Result<u64, EntryDecodeError> {
    if cursor.len() < 8 {
        return Err(EntryDecodeError::Truncated);
    }
    let (head, tail) = cursor.split_at(8);
    *cursor = tail;
    let mut array = [0u8; 8];
    array.copy_from_slice(head);
    Ok(u64::from_le_bytes(array))
}

fn read_i32(cursor: &mut &[u8]) -> Result<i32, EntryDecodeError> {
    if cursor.len() < 4 {
        return Err(EntryDecodeError::Truncated);
    }
    let (head, tail) = cursor.split_at(4);
    *cursor = tail;
    let mut array = [0u8; 4];
    array.copy_from_slice(head);
    Ok(i32::from_le_bytes(array))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EntryDecodeError {
    #[error("truncated entry buffer")]
    Truncated,
}
