//! Block segment backend
//!
//! ## File Format
//!
//! ```text
//! +------------------+
//! | Data Blocks      |  <- framed, checksummed, lz4, key-prefix compacted
//! +------------------+
//! | Index Block      |  <- framed bincode: first key + offset per block
//! +------------------+
//! | Footer           |  <- bincode footer + CRC + footer length
//! +------------------+
//! ```
//!
//! A block frame holds a one-byte compression tag followed by the block
//! body, lz4-compressed (size prepended) when that makes it smaller.
//! Inside the decompressed body every entry is
//! `[shared: u32] [unshared: u32] [value_len: u32] [unshared key bytes] [value]`
//! where `shared` is the length of the prefix it has in common with the
//! previous key of the same block. The first entry of a block always has
//! `shared == 0`, so any block decodes on its own.

use super::{
    decode_state, encode_state, erase_file, len_prefix, read_footer, read_framed,
    segment_path, write_footer, write_framed, BuildHints, BuildingFile, SegmentBackend,
    SegmentFile, SegmentReader, FRAME_OVERHEAD,
};
use mergetable_core::format_version::{block_segment_version, magic, BLOCK_SEGMENT_FORMAT_VERSION};
use mergetable_core::{Comparator, Error, Result, SegmentId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Default block size (4KB)
const DEFAULT_BLOCK_SIZE: usize = 4096;

const ENTRY_HEADER_SIZE: usize = 12;

/// Block compression applied when a block is closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockCompression {
    None = 0,
    Lz4 = 1,
}

impl BlockCompression {
    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(BlockCompression::None),
            1 => Ok(BlockCompression::Lz4),
            other => Err(Error::Corrupt(format!("unknown block compression {}", other))),
        }
    }
}

/// Compressed, sequential-write-optimized backend
#[derive(Debug, Clone)]
pub struct BlockBackend {
    /// Uncompressed bytes after which a block is closed
    pub block_size: usize,
    pub compression: BlockCompression,
}

impl Default for BlockBackend {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            compression: BlockCompression::Lz4,
        }
    }
}

impl BlockBackend {
    /// Backend with a custom block size
    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
            ..Self::default()
        }
    }

    pub fn with_compression(mut self, compression: BlockCompression) -> Self {
        self.compression = compression;
        self
    }
}

impl SegmentBackend for BlockBackend {
    fn name(&self) -> &'static str {
        "block"
    }

    fn file_extension(&self) -> &'static str {
        "blk"
    }

    fn create(&self, dir: &Path, id: SegmentId, _hints: BuildHints) -> Result<Box<dyn BuildingFile>> {
        let path = segment_path(dir, id, self.file_extension());
        Ok(Box::new(BlockBuilder::create(path, id, self.block_size, self.compression)?))
    }

    fn open_building(
        &self,
        dir: &Path,
        id: SegmentId,
        state: &[u8],
    ) -> Result<Box<dyn BuildingFile>> {
        let path = segment_path(dir, id, self.file_extension());
        let state: BlockBuildState = decode_state(state)?;
        Ok(Box::new(BlockBuilder::resume(
            path,
            id,
            self.block_size,
            self.compression,
            state,
        )?))
    }

    fn open(&self, dir: &Path, id: SegmentId) -> Result<Box<dyn SegmentFile>> {
        let path = segment_path(dir, id, self.file_extension());
        Ok(Box::new(BlockFile::open(path, id)?))
    }
}

/// Index entry pointing to a data block
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlockHandle {
    /// First key in the block
    first_key: Vec<u8>,
    /// Offset of the block in the file
    offset: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlockFooter {
    index_offset: u64,
    entry_count: u64,
    version: u16,
    magic: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlockBuildState {
    data_len: u64,
    entry_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlockReaderState {
    block_offset: u64,
    entry_index: u32,
}

fn shared_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

fn encode_entry(block: &mut Vec<u8>, shared: usize, key: &[u8], value: &[u8]) -> Result<()> {
    let unshared = &key[shared..];
    let header = [
        len_prefix(shared, "shared prefix")?,
        len_prefix(unshared.len(), "key")?,
        len_prefix(value.len(), "value")?,
    ];
    for field in header {
        block.extend_from_slice(&field);
    }
    block.extend_from_slice(unshared);
    block.extend_from_slice(value);
    Ok(())
}

/// Tag and, if it pays off, compress a finished block body
fn pack_block(body: &[u8], compression: BlockCompression) -> Vec<u8> {
    let (tag, bytes) = match compression {
        BlockCompression::Lz4 => match lz4_flex::compress_prepend_size(body) {
            compressed if compressed.len() < body.len() => (BlockCompression::Lz4, compressed),
            _ => (BlockCompression::None, body.to_vec()),
        },
        BlockCompression::None => (BlockCompression::None, body.to_vec()),
    };

    let mut framed = Vec::with_capacity(1 + bytes.len());
    framed.push(tag as u8);
    framed.extend_from_slice(&bytes);
    framed
}

/// Strip the compression tag and decode the block's entries
fn unpack_block(framed: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let (&tag, bytes) = framed
        .split_first()
        .ok_or_else(|| Error::Corrupt("empty segment block frame".to_string()))?;
    match BlockCompression::from_tag(tag)? {
        BlockCompression::None => decode_block(bytes),
        BlockCompression::Lz4 => {
            let body = lz4_flex::decompress_size_prepended(bytes)
                .map_err(|e| Error::Corrupt(format!("lz4 block does not decompress: {}", e)))?;
            decode_block(&body)
        }
    }
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

/// Decode every entry of one block payload
fn decode_block(payload: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    let mut offset = 0;

    while offset < payload.len() {
        if offset + ENTRY_HEADER_SIZE > payload.len() {
            return Err(Error::Corrupt("truncated block entry header".to_string()));
        }
        let shared = read_u32(payload, offset) as usize;
        let unshared = read_u32(payload, offset + 4) as usize;
        let value_len = read_u32(payload, offset + 8) as usize;
        offset += ENTRY_HEADER_SIZE;

        if offset + unshared + value_len > payload.len() {
            return Err(Error::Corrupt("block entry overruns its block".to_string()));
        }

        let mut key = match entries.last() {
            Some((prev, _)) if shared <= prev.len() => prev[..shared].to_vec(),
            None if shared == 0 => Vec::with_capacity(unshared),
            _ => {
                return Err(Error::Corrupt(format!(
                    "block entry shares {} bytes with a shorter key",
                    shared
                )))
            }
        };
        key.extend_from_slice(&payload[offset..offset + unshared]);
        offset += unshared;
        let value = payload[offset..offset + value_len].to_vec();
        offset += value_len;

        entries.push((key, value));
    }

    if entries.is_empty() {
        return Err(Error::Corrupt("empty segment block".to_string()));
    }
    Ok(entries)
}

fn read_block_at(file: &mut File, offset: u64) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    file.seek(SeekFrom::Start(offset))?;
    let payload = read_framed(file, "segment block")?;
    unpack_block(&payload)
}

/// Segment file under construction
pub struct BlockBuilder {
    id: SegmentId,
    path: PathBuf,
    writer: BufWriter<File>,
    /// Bytes of closed blocks written so far
    data_len: u64,
    block: Vec<u8>,
    block_first_key: Option<Vec<u8>>,
    last_key: Vec<u8>,
    block_size: usize,
    compression: BlockCompression,
    index: Vec<BlockHandle>,
    entry_count: u64,
}

impl BlockBuilder {
    fn create(
        path: PathBuf,
        id: SegmentId,
        block_size: usize,
        compression: BlockCompression,
    ) -> Result<Self> {
        let file = File::create(&path)?;
        Ok(Self {
            id,
            path,
            writer: BufWriter::new(file),
            data_len: 0,
            block: Vec::with_capacity(block_size),
            block_first_key: None,
            last_key: Vec::new(),
            block_size,
            compression,
            index: Vec::new(),
            entry_count: 0,
        })
    }

    /// Reopen a partial file: cut it back to the checkpointed data and
    /// rebuild the block index by rescanning it.
    fn resume(
        path: PathBuf,
        id: SegmentId,
        block_size: usize,
        compression: BlockCompression,
        state: BlockBuildState,
    ) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        if len < state.data_len {
            return Err(Error::Corrupt(format!(
                "segment {:016x} is {} bytes, checkpoint needs {}",
                id, len, state.data_len
            )));
        }
        file.set_len(state.data_len)?;

        let mut index = Vec::new();
        let mut entry_count = 0u64;
        let mut offset = 0u64;
        {
            let mut reader = BufReader::new(file.try_clone()?);
            reader.seek(SeekFrom::Start(0))?;
            while offset < state.data_len {
                let payload = read_framed(&mut reader, "segment block")?;
                let entries = unpack_block(&payload)?;
                index.push(BlockHandle {
                    first_key: entries[0].0.clone(),
                    offset,
                });
                entry_count += entries.len() as u64;
                offset += payload.len() as u64 + FRAME_OVERHEAD;
            }
        }

        if offset != state.data_len || entry_count != state.entry_count {
            return Err(Error::Corrupt(format!(
                "segment {:016x} checkpoint mismatch: {} entries in {} bytes, expected {} in {}",
                id, entry_count, offset, state.entry_count, state.data_len
            )));
        }

        let mut file = file;
        file.seek(SeekFrom::End(0))?;

        Ok(Self {
            id,
            path,
            writer: BufWriter::new(file),
            data_len: state.data_len,
            block: Vec::with_capacity(block_size),
            block_first_key: None,
            last_key: Vec::new(),
            block_size,
            compression,
            index,
            entry_count,
        })
    }

    fn close_block(&mut self) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }

        let packed = pack_block(&self.block, self.compression);
        let written = write_framed(&mut self.writer, &packed)?;
        if let Some(first_key) = self.block_first_key.take() {
            self.index.push(BlockHandle {
                first_key,
                offset: self.data_len,
            });
        }
        self.data_len += written;
        self.block.clear();
        Ok(())
    }
}

impl BuildingFile for BlockBuilder {
    fn feed(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let shared = if self.block_first_key.is_none() {
            self.block_first_key = Some(key.to_vec());
            0
        } else {
            shared_prefix_len(&self.last_key, key)
        };

        encode_entry(&mut self.block, shared, key, value)?;
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.entry_count += 1;

        if self.block.len() >= self.block_size {
            self.close_block()?;
        }
        Ok(())
    }

    fn entry_count(&self) -> u64 {
        self.entry_count
    }

    fn checkpoint(&mut self) -> Result<Vec<u8>> {
        self.close_block()?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        encode_state(&BlockBuildState {
            data_len: self.data_len,
            entry_count: self.entry_count,
        })
    }

    fn finish(self: Box<Self>) -> Result<Box<dyn SegmentFile>> {
        let mut this = *self;
        this.close_block()?;

        let index_offset = this.data_len;
        let index = bincode::serialize(&this.index)
            .map_err(|e| Error::Serialization(format!("Failed to serialize block index: {}", e)))?;
        write_framed(&mut this.writer, &index)?;

        write_footer(
            &mut this.writer,
            &BlockFooter {
                index_offset,
                entry_count: this.entry_count,
                version: BLOCK_SEGMENT_FORMAT_VERSION,
                magic: magic::BLOCK_SEGMENT,
            },
        )?;

        this.writer.flush()?;
        this.writer.get_ref().sync_all()?;
        drop(this.writer);

        Ok(Box::new(BlockFile::open(this.path, this.id)?))
    }
}

/// Finished block segment
pub struct BlockFile {
    id: SegmentId,
    path: PathBuf,
    file: Mutex<File>,
    index: Vec<BlockHandle>,
    entry_count: u64,
    data_len: u64,
    file_size: u64,
}

impl BlockFile {
    /// Open a finished block segment at `path`
    pub fn open(path: PathBuf, id: SegmentId) -> Result<Self> {
        let mut file = File::open(&path)?;
        let file_size = file.metadata()?.len();

        let footer: BlockFooter = read_footer(&mut file, file_size)?;
        if footer.magic != magic::BLOCK_SEGMENT {
            return Err(Error::Corrupt(format!(
                "bad block segment magic in {}",
                path.display()
            )));
        }
        if !block_segment_version().can_read(footer.version) {
            return Err(Error::Corrupt(format!(
                "unsupported block segment version {}",
                footer.version
            )));
        }
        if footer.index_offset > file_size {
            return Err(Error::Corrupt("block index offset out of range".to_string()));
        }

        file.seek(SeekFrom::Start(footer.index_offset))?;
        let encoded = read_framed(&mut file, "block index")?;
        let index: Vec<BlockHandle> = bincode::deserialize(&encoded)
            .map_err(|e| Error::Corrupt(format!("undecodable block index: {}", e)))?;

        Ok(Self {
            id,
            path,
            file: Mutex::new(file),
            index,
            entry_count: footer.entry_count,
            data_len: footer.index_offset,
            file_size,
        })
    }
}

impl SegmentFile for BlockFile {
    fn id(&self) -> SegmentId {
        self.id
    }

    fn entry_count(&self) -> u64 {
        self.entry_count
    }

    fn file_size(&self) -> u64 {
        self.file_size
    }

    fn query(&self, key: &[u8], comparator: &Comparator) -> Result<Option<Vec<u8>>> {
        // Last block whose first key is <= key
        let block_idx = self
            .index
            .partition_point(|h| comparator.compare(&h.first_key, key) != Ordering::Greater);
        if block_idx == 0 {
            return Ok(None);
        }

        let entries = {
            let mut file = self.file.lock().map_err(|_| Error::LockPoisoned)?;
            read_block_at(&mut file, self.index[block_idx - 1].offset)?
        };

        for (k, v) in entries {
            match comparator.compare(&k, key) {
                Ordering::Less => continue,
                Ordering::Equal => return Ok(Some(v)),
                Ordering::Greater => break,
            }
        }
        Ok(None)
    }

    fn create_reader(&self) -> Result<Box<dyn SegmentReader>> {
        let mut reader = BlockReader::new(&self.path, self.data_len)?;
        reader.load_block(0)?;
        Ok(Box::new(reader))
    }

    fn reopen_reader(&self, state: &[u8]) -> Result<Box<dyn SegmentReader>> {
        let state: BlockReaderState = decode_state(state)?;
        if state.block_offset > self.data_len {
            return Err(Error::Corrupt(format!(
                "reader position {} beyond data of segment {:016x}",
                state.block_offset, self.id
            )));
        }

        let mut reader = BlockReader::new(&self.path, self.data_len)?;
        reader.load_block(state.block_offset)?;
        let entry_index = state.entry_index as usize;
        if !reader.entries.is_empty() && entry_index >= reader.entries.len() {
            return Err(Error::Corrupt(format!(
                "reader position {} beyond block of {} entries",
                entry_index,
                reader.entries.len()
            )));
        }
        reader.entry_index = entry_index;
        Ok(Box::new(reader))
    }

    fn destroy(&mut self, erase: bool) -> Result<()> {
        if erase {
            erase_file(&self.path)?;
        }
        Ok(())
    }
}

/// Sequential reader over the data blocks of a block segment
pub struct BlockReader {
    reader: BufReader<File>,
    /// Offset the underlying reader is positioned at
    pos: u64,
    data_len: u64,
    block_offset: u64,
    next_block_offset: u64,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    entry_index: usize,
}

impl BlockReader {
    fn new(path: &Path, data_len: u64) -> Result<Self> {
        Ok(Self {
            reader: BufReader::new(File::open(path)?),
            pos: 0,
            data_len,
            block_offset: 0,
            next_block_offset: 0,
            entries: Vec::new(),
            entry_index: 0,
        })
    }

    fn load_block(&mut self, offset: u64) -> Result<()> {
        self.block_offset = offset;
        self.entries.clear();
        self.entry_index = 0;

        if offset >= self.data_len {
            self.next_block_offset = offset;
            return Ok(());
        }

        if self.pos != offset {
            self.reader.seek(SeekFrom::Start(offset))?;
        }
        let payload = read_framed(&mut self.reader, "segment block")?;
        self.pos = offset + payload.len() as u64 + FRAME_OVERHEAD;
        self.next_block_offset = self.pos;
        self.entries = unpack_block(&payload)?;
        Ok(())
    }
}

impl SegmentReader for BlockReader {
    fn entry(&self) -> Option<(&[u8], &[u8])> {
        self.entries
            .get(self.entry_index)
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    fn advance(&mut self) -> Result<bool> {
        if self.is_eof() {
            return Ok(false);
        }

        self.entry_index += 1;
        if self.entry_index >= self.entries.len() {
            self.load_block(self.next_block_offset)?;
        }
        Ok(!self.is_eof())
    }

    fn checkpoint(&self) -> Result<Vec<u8>> {
        encode_state(&BlockReaderState {
            block_offset: self.block_offset,
            entry_index: self.entry_index as u32,
        })
    }
}
