// Journal snapshot: the head of every journal file
//
// Snapshot format (binary, little-endian):
// [magic: u32] [version: u16] [reserved: u16] [body_len: u32] [crc32: u32] [body]
//
// The body is a bincode-encoded `JournalSnapshot`: the write-sequence
// counter, the next segment id, every live segment with its provenance
// range and entry count, and the resumable state of every running
// compaction. Tail records start right after the body.

use crc32fast::Hasher;
use mergetable_core::format_version::{journal_version, magic, JOURNAL_FORMAT_VERSION};
use mergetable_core::{Error, Result, SegmentId};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Bytes before the snapshot body
pub const SNAPSHOT_HEADER_SIZE: usize = 16;

/// One live segment as recorded in a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentEntry {
    pub id: SegmentId,
    pub first_input_seq: u64,
    pub input_count: u64,
    pub entry_count: u64,
}

impl SegmentEntry {
    /// Half-open range of write sequence numbers this segment derives from
    pub fn input_range(&self) -> Range<u64> {
        self.first_input_seq..self.first_input_seq + self.input_count
    }
}

/// One running compaction as recorded in a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEntry {
    /// Older (left) input segment
    pub older: SegmentId,
    /// Newer (right) input segment
    pub newer: SegmentId,
    /// Segment id of the output being built
    pub output: SegmentId,
    /// Resumable position of the left reader
    pub left_state: Vec<u8>,
    /// Resumable position of the right reader
    pub right_state: Vec<u8>,
    /// Resumable progress of the output builder
    pub builder_state: Vec<u8>,
}

/// Complete engine state at the moment the journal was last reset
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalSnapshot {
    /// Global write-sequence counter
    pub write_seq: u64,
    /// Next segment id to hand out
    pub next_segment_id: SegmentId,
    /// Live segments, oldest first
    pub segments: Vec<SegmentEntry>,
    /// Running compactions, in scheduler order
    pub tasks: Vec<TaskEntry>,
    /// Name of the segment backend that wrote the segment files
    pub backend: String,
}

impl JournalSnapshot {
    /// Encode header + body
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)
            .map_err(|e| Error::Serialization(format!("Failed to serialize snapshot: {}", e)))?;

        let mut hasher = Hasher::new();
        hasher.update(&body);
        let crc = hasher.finalize();

        let mut out = Vec::with_capacity(SNAPSHOT_HEADER_SIZE + body.len());
        out.extend_from_slice(&magic::JOURNAL.to_le_bytes());
        out.extend_from_slice(&JOURNAL_FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        let body_len = u32::try_from(body.len())
            .map_err(|_| Error::Serialization(format!("snapshot body of {} bytes", body.len())))?;
        out.extend_from_slice(&body_len.to_le_bytes());
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parse the fixed header, returning `(body_len, crc)`
    pub fn decode_header(header: &[u8]) -> Result<(usize, u32)> {
        if header.len() < SNAPSHOT_HEADER_SIZE {
            return Err(Error::Corrupt("journal header truncated".to_string()));
        }

        let found_magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if found_magic != magic::JOURNAL {
            return Err(Error::Corrupt(format!(
                "bad journal magic: {:#010x}",
                found_magic
            )));
        }

        let version = u16::from_le_bytes([header[4], header[5]]);
        if !journal_version().can_read(version) {
            return Err(Error::Corrupt(format!(
                "unsupported journal version: {}",
                version
            )));
        }

        let body_len = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;
        let crc = u32::from_le_bytes([header[12], header[13], header[14], header[15]]);
        Ok((body_len, crc))
    }

    /// Decode a snapshot body checked against the header's CRC
    pub fn decode_body(body: &[u8], expected_crc: u32) -> Result<Self> {
        let mut hasher = Hasher::new();
        hasher.update(body);
        let actual = hasher.finalize();
        if actual != expected_crc {
            return Err(Error::Corrupt(format!(
                "journal snapshot CRC mismatch: expected {}, got {}",
                expected_crc, actual
            )));
        }

        bincode::deserialize(body)
            .map_err(|e| Error::Corrupt(format!("undecodable journal snapshot: {}", e)))
    }

    /// Decode header + body from the start of `data`, returning the
    /// snapshot and the number of bytes consumed
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let (body_len, crc) = Self::decode_header(data)?;
        let end = SNAPSHOT_HEADER_SIZE + body_len;
        if data.len() < end {
            return Err(Error::Corrupt("journal snapshot truncated".to_string()));
        }
        let snapshot = Self::decode_body(&data[SNAPSHOT_HEADER_SIZE..end], crc)?;
        Ok((snapshot, end))
    }
}
