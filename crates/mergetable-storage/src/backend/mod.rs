//! Segment file backends
//!
//! A backend stores one immutable sorted run of entries per file and reads
//! it back, either by point lookup or through a sequential reader. Files
//! are built incrementally and a build in progress can be checkpointed and
//! resumed after a crash, which is what lets compaction proceed in small
//! slices across restarts.
//!
//! Two backends ship with the engine:
//!
//! - [`BlockBackend`]: lz4-compressed, checksummed blocks with key-prefix
//!   compaction and a sparse block index. Compact, cheap to write
//!   sequentially.
//! - [`TreeBackend`]: plain records under a static multi-level B-tree.
//!   Bigger, but a point lookup touches one node per level.

use mergetable_core::{Comparator, Error, Result, SegmentId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub mod block;
pub mod tree;

pub use block::{BlockBackend, BlockCompression};
pub use tree::TreeBackend;

/// Sizing hints passed when a segment is created
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildHints {
    /// Upper bound on entries that will be fed
    pub expected_entries: u64,
}

/// Factory for segment files of one format
pub trait SegmentBackend: Send + Sync + fmt::Debug {
    /// Short backend name, for logs
    fn name(&self) -> &'static str;

    /// File extension of this backend's segment files
    fn file_extension(&self) -> &'static str;

    /// Start building a new segment file, truncating any existing file
    fn create(&self, dir: &Path, id: SegmentId, hints: BuildHints) -> Result<Box<dyn BuildingFile>>;

    /// Resume a build from a state returned by [`BuildingFile::checkpoint`]
    fn open_building(&self, dir: &Path, id: SegmentId, state: &[u8])
        -> Result<Box<dyn BuildingFile>>;

    /// Open a finished segment file
    fn open(&self, dir: &Path, id: SegmentId) -> Result<Box<dyn SegmentFile>>;
}

/// A segment file under construction.
///
/// Entries must be fed in non-decreasing key order under the table's
/// comparator.
pub trait BuildingFile: Send {
    /// Append one entry
    fn feed(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Entries fed so far
    fn entry_count(&self) -> u64;

    /// Make everything fed so far durable and return a state from which
    /// the build can be resumed
    fn checkpoint(&mut self) -> Result<Vec<u8>>;

    /// Complete the file and open it for reading
    fn finish(self: Box<Self>) -> Result<Box<dyn SegmentFile>>;
}

/// A finished, immutable segment file
pub trait SegmentFile: Send + Sync {
    /// Segment id the file was created under
    fn id(&self) -> SegmentId;

    /// Number of entries stored
    fn entry_count(&self) -> u64;

    /// On-disk size in bytes
    fn file_size(&self) -> u64;

    /// Point lookup
    fn query(&self, key: &[u8], comparator: &Comparator) -> Result<Option<Vec<u8>>>;

    /// Sequential reader positioned at the first entry
    fn create_reader(&self) -> Result<Box<dyn SegmentReader>>;

    /// Sequential reader positioned where [`SegmentReader::checkpoint`] was taken
    fn reopen_reader(&self, state: &[u8]) -> Result<Box<dyn SegmentReader>>;

    /// Release the file; with `erase` the file is also deleted
    fn destroy(&mut self, erase: bool) -> Result<()>;
}

/// Forward cursor over one segment file
pub trait SegmentReader: Send {
    /// Current entry, `None` once the reader is exhausted
    fn entry(&self) -> Option<(&[u8], &[u8])>;

    /// Move to the next entry; returns false once exhausted
    fn advance(&mut self) -> Result<bool>;

    /// Resumable position of the current entry
    fn checkpoint(&self) -> Result<Vec<u8>>;

    /// True once every entry has been visited
    fn is_eof(&self) -> bool {
        self.entry().is_none()
    }
}

/// Path of segment `id` with extension `ext` inside `dir`
pub fn segment_path(dir: &Path, id: SegmentId, ext: &str) -> PathBuf {
    dir.join(format!("{:016x}.{}", id, ext))
}

/// Parse a segment file name of the form `{id:016x}.{ext}`, any extension
pub fn parse_segment_file_name(name: &str) -> Option<(SegmentId, &str)> {
    let (stem, ext) = name.split_once('.')?;
    if stem.len() != 16 || ext.is_empty() {
        return None;
    }
    let id = u64::from_str_radix(stem, 16).ok()?;
    Some((id, ext))
}

// Framed records shared by both backends:
// [payload_len: u32] [payload] [crc32(payload): u32]

pub(crate) const FRAME_OVERHEAD: u64 = 8;

/// Little-endian u32 length field, refusing lengths that would wrap
pub(crate) fn len_prefix(len: usize, what: &str) -> Result<[u8; 4]> {
    u32::try_from(len).map(u32::to_le_bytes).map_err(|_| {
        Error::InvalidArgument(format!("{} of {} bytes does not fit a segment file", what, len))
    })
}

/// Write one framed payload, returning the bytes written
pub(crate) fn write_framed<W: Write>(writer: &mut W, payload: &[u8]) -> Result<u64> {
    let len = len_prefix(payload.len(), "framed payload")?;
    let crc = crc32fast::hash(payload);
    writer.write_all(&len)?;
    writer.write_all(payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(payload.len() as u64 + FRAME_OVERHEAD)
}

/// Read one framed payload from the current position of `reader`
pub(crate) fn read_framed<R: Read>(reader: &mut R, what: &str) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    read_exact_or_corrupt(reader, &mut len_buf, what)?;
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    read_exact_or_corrupt(reader, &mut payload, what)?;

    let mut crc_buf = [0u8; 4];
    read_exact_or_corrupt(reader, &mut crc_buf, what)?;
    let stored = u32::from_le_bytes(crc_buf);
    let computed = crc32fast::hash(&payload);
    if stored != computed {
        return Err(Error::Corrupt(format!("{} CRC mismatch", what)));
    }
    Ok(payload)
}

pub(crate) fn read_exact_or_corrupt<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Corrupt(format!("truncated {}", what))
        } else {
            Error::Io(e)
        }
    })
}

/// Append a bincode footer followed by its framed length
pub(crate) fn write_footer<W: Write, T: Serialize>(writer: &mut W, footer: &T) -> Result<()> {
    let encoded = bincode::serialize(footer)
        .map_err(|e| Error::Serialization(format!("Failed to serialize footer: {}", e)))?;
    let len = len_prefix(encoded.len(), "footer")?;
    let crc = crc32fast::hash(&encoded);
    writer.write_all(&encoded)?;
    writer.write_all(&crc.to_le_bytes())?;
    writer.write_all(&len)?;
    Ok(())
}

/// Read the footer written by [`write_footer`] from the end of `file`
pub(crate) fn read_footer<T: DeserializeOwned>(file: &mut File, file_size: u64) -> Result<T> {
    if file_size < 8 {
        return Err(Error::Corrupt("segment file too small".to_string()));
    }

    file.seek(SeekFrom::End(-4))?;
    let mut len_buf = [0u8; 4];
    file.read_exact(&mut len_buf)?;
    let footer_len = u32::from_le_bytes(len_buf) as u64;
    if footer_len + 8 > file_size {
        return Err(Error::Corrupt("segment footer length out of range".to_string()));
    }

    file.seek(SeekFrom::End(-(footer_len as i64) - 8))?;
    let mut encoded = vec![0u8; footer_len as usize];
    file.read_exact(&mut encoded)?;
    let mut crc_buf = [0u8; 4];
    file.read_exact(&mut crc_buf)?;
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&encoded) {
        return Err(Error::Corrupt("segment footer CRC mismatch".to_string()));
    }

    bincode::deserialize(&encoded)
        .map_err(|e| Error::Corrupt(format!("undecodable segment footer: {}", e)))
}

pub(crate) fn encode_state<T: Serialize>(state: &T) -> Result<Vec<u8>> {
    bincode::serialize(state)
        .map_err(|e| Error::Serialization(format!("Failed to serialize segment state: {}", e)))
}

pub(crate) fn decode_state<T: DeserializeOwned>(state: &[u8]) -> Result<T> {
    bincode::deserialize(state)
        .map_err(|e| Error::Corrupt(format!("undecodable segment state: {}", e)))
}

/// Delete a segment file, tolerating one that is already gone
pub(crate) fn erase_file(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
