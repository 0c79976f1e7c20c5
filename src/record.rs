use std::io;

use thiserror::Error;

use crate::config::ChecksumAlgorithm;
use crate::entry::{EntryValueType, LogEntry};

/// On-disk record format version. Bumped when the byte layout changes.
pub const CURRENT_FORMAT_VERSION: u8 = 2;

/// Upper bound on a single payload; anything larger in a header is either
/// corruption or a caller breaking its contract.
pub const MAX_RECORD_PAYLOAD: u64 = 1 << 30;

/// version + index + term + value_type + blob_size
pub const RECORD_HEADER_BYTES: usize = 1 + 8 + 8 + 4 + 8;

const CHECKSUM_TRAILER_BYTES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub version: u8,
    pub index: u64,
    pub term: u64,
    pub value_type: i32,
    pub blob_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    pub index: u64,
    pub term: u64,
    pub value_type: EntryValueType,
    pub data: Vec<u8>,
    /// Total bytes the record occupies on disk, trailer included.
    pub consumed: u64,
}

impl DecodedRecord {
    pub fn into_entry(self) -> LogEntry {
        LogEntry::new(self.term, self.value_type, self.data)
    }
}

/// Serializes and deserializes single records. Compression applies to the
/// payload of each record so the recovery scan can stop byte-exactly at the
/// first bad record without losing anything before it.
#[derive(Debug, Clone, Copy)]
pub struct RecordCodec {
    checksum: ChecksumAlgorithm,
    compress: bool,
}

impl RecordCodec {
    pub fn new(checksum: ChecksumAlgorithm, compress: bool) -> Self {
        Self { checksum, compress }
    }

    /// Appends the encoded record to `out`, returning the encoded length.
    pub fn encode(
        &self,
        index: u64,
        entry: &LogEntry,
        out: &mut Vec<u8>,
    ) -> Result<u64, RecordError> {
        if entry.data.len() as u64 > MAX_RECORD_PAYLOAD {
            return Err(RecordError::PayloadTooLarge {
                declared: entry.data.len() as u64,
            });
        }
        let compressed;
        let payload: &[u8] = if self.compress {
            compressed = zstd::encode_all(entry.data.as_slice(), zstd::DEFAULT_COMPRESSION_LEVEL)
                .map_err(RecordError::Compression)?;
            &compressed
        } else {
            &entry.data
        };

        let start = out.len();
        out.push(CURRENT_FORMAT_VERSION);
        out.extend_from_slice(&index.to_le_bytes());
        out.extend_from_slice(&entry.term.to_le_bytes());
        out.extend_from_slice(&entry.value_type.to_wire().to_le_bytes());
        out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        out.extend_from_slice(payload);
        if self.checksum == ChecksumAlgorithm::Crc32 {
            let crc = crc32fast::hash(&out[start..]);
            out.extend_from_slice(&crc.to_le_bytes());
        }
        Ok((out.len() - start) as u64)
    }

    /// Decodes the record starting at `offset`. `Ok(None)` marks a clean end
    /// of data; every malformed shape (short header, short payload, bad
    /// version, checksum mismatch) is an error the recovery scan treats as
    /// the effective end of the log.
    pub fn decode_at(
        &self,
        bytes: &[u8],
        offset: u64,
    ) -> Result<Option<DecodedRecord>, RecordError> {
        let offset_usize = offset as usize;
        if offset_usize == bytes.len() {
            return Ok(None);
        }
        if offset_usize > bytes.len() {
            return Err(RecordError::Truncated { offset });
        }
        let remaining = &bytes[offset_usize..];
        if remaining.len() < RECORD_HEADER_BYTES {
            return Err(RecordError::Truncated { offset });
        }
        let header = parse_header(remaining);
        if header.version != CURRENT_FORMAT_VERSION {
            return Err(RecordError::UnsupportedVersion {
                version: header.version,
                offset,
            });
        }
        if header.blob_size > MAX_RECORD_PAYLOAD {
            return Err(RecordError::PayloadTooLarge {
                declared: header.blob_size,
            });
        }
        let payload_end = RECORD_HEADER_BYTES + header.blob_size as usize;
        let record_end = payload_end + self.trailer_len();
        if remaining.len() < record_end {
            return Err(RecordError::Truncated { offset });
        }
        if self.checksum == ChecksumAlgorithm::Crc32 {
            let mut trailer = [0u8; CHECKSUM_TRAILER_BYTES];
            trailer.copy_from_slice(&remaining[payload_end..payload_end + CHECKSUM_TRAILER_BYTES]);
            let stored = u32::from_le_bytes(trailer);
            let computed = crc32fast::hash(&remaining[..payload_end]);
            if stored != computed {
                return Err(RecordError::ChecksumMismatch {
                    index: header.index,
                    offset,
                });
            }
        }
        let payload = &remaining[RECORD_HEADER_BYTES..payload_end];
        let data = if self.compress {
            zstd::decode_all(payload).map_err(RecordError::Compression)?
        } else {
            payload.to_vec()
        };
        Ok(Some(DecodedRecord {
            index: header.index,
            term: header.term,
            value_type: EntryValueType::from_wire(header.value_type),
            data,
            consumed: record_end as u64,
        }))
    }

    fn trailer_len(&self) -> usize {
        match self.checksum {
            ChecksumAlgorithm::None => 0,
            ChecksumAlgorithm::Crc32 => CHECKSUM_TRAILER_BYTES,
        }
    }
}

fn parse_header(bytes: &[u8]) -> RecordHeader {
    let version = bytes[0];
    let mut u64_bytes = [0u8; 8];
    u64_bytes.copy_from_slice(&bytes[1..9]);
    let index = u64::from_le_bytes(u64_bytes);
    u64_bytes.copy_from_slice(&bytes[9..17]);
    let term = u64::from_le_bytes(u64_bytes);
    let mut i32_bytes = [0u8; 4];
    i32_bytes.copy_from_slice(&bytes[17..21]);
    let value_type = i32::from_le_bytes(i32_bytes);
    u64_bytes.copy_from_slice(&bytes[21..29]);
    let blob_size = u64::from_le_bytes(u64_bytes);
    RecordHeader {
        version,
        index,
        term,
        value_type,
        blob_size,
    }
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("truncated record at offset {offset}")]
    Truncated { offset: u64 },
    #[error("checksum mismatch for record {index} at offset {offset}")]
    ChecksumMismatch { index: u64, offset: u64 },
    #[error("unsupported record version {version} at offset {offset}")]
    UnsupportedVersion { version: u8, offset: u64 },
    #[error("record payload size {declared} exceeds limit")]
    PayloadTooLarge { declared: u64 },
    #[error("compression error: {0}")]
    Compression(#[source] io::Error),
}
