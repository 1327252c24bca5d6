//! Tree segment backend
//!
//! ## File Format
//!
//! ```text
//! +------------------+
//! | Data Records     |  <- [key_len u32][value_len u32][key][value][crc u32]
//! +------------------+
//! | Leaf Nodes       |  <- one (key, record offset) pair per record
//! +------------------+
//! | Inner Nodes      |  <- (first key, child node offset), level by level
//! +------------------+
//! | Footer           |  <- root offset, height, counts, magic
//! +------------------+
//! ```
//!
//! Records are written as they are fed, so a build in progress is just a
//! prefix of records. The tree is laid down by `finish` in one pass over
//! the records, bottom level first; the root is the last node written.

use super::{
    decode_state, encode_state, erase_file, len_prefix, read_exact_or_corrupt, read_footer,
    read_framed, segment_path, write_footer, write_framed, BuildHints, BuildingFile,
    SegmentBackend, SegmentFile, SegmentReader,
};
use mergetable_core::format_version::{magic, tree_segment_version, TREE_SEGMENT_FORMAT_VERSION};
use mergetable_core::{Comparator, Error, Result, SegmentId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Default children per node
const DEFAULT_FANOUT: usize = 64;

const RECORD_OVERHEAD: u64 = 12;

/// Randomly-readable, tree-structured backend
#[derive(Debug, Clone)]
pub struct TreeBackend {
    /// Maximum entries per tree node
    pub fanout: usize,
}

impl Default for TreeBackend {
    fn default() -> Self {
        Self {
            fanout: DEFAULT_FANOUT,
        }
    }
}

impl TreeBackend {
    /// Backend with a custom node fanout (at least 2)
    pub fn with_fanout(fanout: usize) -> Self {
        Self {
            fanout: fanout.max(2),
        }
    }
}

impl SegmentBackend for TreeBackend {
    fn name(&self) -> &'static str {
        "tree"
    }

    fn file_extension(&self) -> &'static str {
        "btr"
    }

    fn create(&self, dir: &Path, id: SegmentId, _hints: BuildHints) -> Result<Box<dyn BuildingFile>> {
        let path = segment_path(dir, id, self.file_extension());
        let file = File::create(&path)?;
        Ok(Box::new(TreeBuilder {
            id,
            path,
            writer: BufWriter::new(file),
            data_len: 0,
            entry_count: 0,
            fanout: self.fanout,
        }))
    }

    fn open_building(
        &self,
        dir: &Path,
        id: SegmentId,
        state: &[u8],
    ) -> Result<Box<dyn BuildingFile>> {
        let path = segment_path(dir, id, self.file_extension());
        let state: TreeBuildState = decode_state(state)?;
        Ok(Box::new(TreeBuilder::resume(path, id, self.fanout, state)?))
    }

    fn open(&self, dir: &Path, id: SegmentId) -> Result<Box<dyn SegmentFile>> {
        let path = segment_path(dir, id, self.file_extension());
        Ok(Box::new(TreeFile::open(path, id)?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TreeFooter {
    root_offset: u64,
    /// Node levels above the records; 0 for an empty segment
    height: u32,
    data_len: u64,
    entry_count: u64,
    version: u16,
    magic: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TreeBuildState {
    data_len: u64,
    entry_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TreeReaderState {
    offset: u64,
}

fn write_record<W: Write>(writer: &mut W, key: &[u8], value: &[u8]) -> Result<u64> {
    let key_len = len_prefix(key.len(), "key")?;
    let value_len = len_prefix(value.len(), "value")?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&key_len);
    hasher.update(&value_len);
    hasher.update(key);
    hasher.update(value);

    writer.write_all(&key_len)?;
    writer.write_all(&value_len)?;
    writer.write_all(key)?;
    writer.write_all(value)?;
    writer.write_all(&hasher.finalize().to_le_bytes())?;
    Ok(RECORD_OVERHEAD + key.len() as u64 + value.len() as u64)
}

/// Read the record at the reader's position, returning it and its size
fn read_record<R: Read>(reader: &mut R) -> Result<(Vec<u8>, Vec<u8>, u64)> {
    let mut header = [0u8; 8];
    read_exact_or_corrupt(reader, &mut header, "tree record")?;
    let key_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let value_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;

    let mut key = vec![0u8; key_len];
    read_exact_or_corrupt(reader, &mut key, "tree record")?;
    let mut value = vec![0u8; value_len];
    read_exact_or_corrupt(reader, &mut value, "tree record")?;
    let mut crc_buf = [0u8; 4];
    read_exact_or_corrupt(reader, &mut crc_buf, "tree record")?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header);
    hasher.update(&key);
    hasher.update(&value);
    if hasher.finalize() != u32::from_le_bytes(crc_buf) {
        return Err(Error::Corrupt("tree record CRC mismatch".to_string()));
    }

    let size = RECORD_OVERHEAD + key_len as u64 + value_len as u64;
    Ok((key, value, size))
}

fn encode_node(entries: &[(Vec<u8>, u64)]) -> Result<Vec<u8>> {
    let mut node = Vec::new();
    node.extend_from_slice(&len_prefix(entries.len(), "tree node")?);
    for (key, child) in entries {
        node.extend_from_slice(&len_prefix(key.len(), "separator key")?);
        node.extend_from_slice(key);
        node.extend_from_slice(&child.to_le_bytes());
    }
    Ok(node)
}

fn decode_node(payload: &[u8]) -> Result<Vec<(Vec<u8>, u64)>> {
    let corrupt = || Error::Corrupt("malformed tree node".to_string());

    let count_bytes: [u8; 4] = payload.get(..4).ok_or_else(corrupt)?.try_into().map_err(|_| corrupt())?;
    let count = u32::from_le_bytes(count_bytes) as usize;

    let mut entries = Vec::with_capacity(count);
    let mut offset = 4;
    for _ in 0..count {
        let len_bytes: [u8; 4] = payload
            .get(offset..offset + 4)
            .ok_or_else(corrupt)?
            .try_into()
            .map_err(|_| corrupt())?;
        let key_len = u32::from_le_bytes(len_bytes) as usize;
        offset += 4;

        let key = payload.get(offset..offset + key_len).ok_or_else(corrupt)?.to_vec();
        offset += key_len;

        let child_bytes: [u8; 8] = payload
            .get(offset..offset + 8)
            .ok_or_else(corrupt)?
            .try_into()
            .map_err(|_| corrupt())?;
        offset += 8;

        entries.push((key, u64::from_le_bytes(child_bytes)));
    }

    if entries.is_empty() || offset != payload.len() {
        return Err(corrupt());
    }
    Ok(entries)
}

/// Tree segment under construction
pub struct TreeBuilder {
    id: SegmentId,
    path: PathBuf,
    writer: BufWriter<File>,
    data_len: u64,
    entry_count: u64,
    fanout: usize,
}

impl TreeBuilder {
    fn resume(path: PathBuf, id: SegmentId, fanout: usize, state: TreeBuildState) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        if len < state.data_len {
            return Err(Error::Corrupt(format!(
                "segment {:016x} is {} bytes, checkpoint needs {}",
                id, len, state.data_len
            )));
        }
        file.set_len(state.data_len)?;

        // Walk the kept records so a checkpoint that does not line up with
        // record boundaries is caught now rather than at read time
        let mut offset = 0u64;
        let mut entry_count = 0u64;
        {
            let mut reader = BufReader::new(File::open(&path)?);
            while offset < state.data_len {
                let (_, _, size) = read_record(&mut reader)?;
                offset += size;
                entry_count += 1;
            }
        }
        if offset != state.data_len || entry_count != state.entry_count {
            return Err(Error::Corrupt(format!(
                "segment {:016x} checkpoint mismatch: {} records in {} bytes, expected {} in {}",
                id, entry_count, offset, state.entry_count, state.data_len
            )));
        }

        file.seek(SeekFrom::End(0))?;
        Ok(Self {
            id,
            path,
            writer: BufWriter::new(file),
            data_len: state.data_len,
            entry_count,
            fanout,
        })
    }

    /// Write one level of nodes over `children`, returning the entries of
    /// the level above
    fn write_level(
        writer: &mut BufWriter<File>,
        position: &mut u64,
        children: Vec<(Vec<u8>, u64)>,
        fanout: usize,
    ) -> Result<Vec<(Vec<u8>, u64)>> {
        let mut parents = Vec::with_capacity(children.len() / fanout + 1);
        for chunk in children.chunks(fanout) {
            let node_offset = *position;
            *position += write_framed(writer, &encode_node(chunk)?)?;
            parents.push((chunk[0].0.clone(), node_offset));
        }
        Ok(parents)
    }
}

impl BuildingFile for TreeBuilder {
    fn feed(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.data_len += write_record(&mut self.writer, key, value)?;
        self.entry_count += 1;
        Ok(())
    }

    fn entry_count(&self) -> u64 {
        self.entry_count
    }

    fn checkpoint(&mut self) -> Result<Vec<u8>> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        encode_state(&TreeBuildState {
            data_len: self.data_len,
            entry_count: self.entry_count,
        })
    }

    fn finish(self: Box<Self>) -> Result<Box<dyn SegmentFile>> {
        let mut this = *self;
        this.writer.flush()?;

        let mut position = this.data_len;
        let mut height = 0u32;
        let mut root_offset = 0u64;

        if this.entry_count > 0 {
            // Leaf level: stream the records back and emit nodes as they fill
            let mut reader = BufReader::new(File::open(&this.path)?);
            let mut leaves: Vec<(Vec<u8>, u64)> = Vec::with_capacity(this.fanout);
            let mut parents = Vec::new();
            let mut offset = 0u64;
            while offset < this.data_len {
                let (key, _, size) = read_record(&mut reader)?;
                leaves.push((key, offset));
                offset += size;
                if leaves.len() == this.fanout {
                    parents.extend(Self::write_level(
                        &mut this.writer,
                        &mut position,
                        std::mem::take(&mut leaves),
                        this.fanout,
                    )?);
                }
            }
            if !leaves.is_empty() {
                parents.extend(Self::write_level(
                    &mut this.writer,
                    &mut position,
                    leaves,
                    this.fanout,
                )?);
            }
            height = 1;

            while parents.len() > 1 {
                parents = Self::write_level(&mut this.writer, &mut position, parents, this.fanout)?;
                height += 1;
            }
            root_offset = parents[0].1;
        }

        write_footer(
            &mut this.writer,
            &TreeFooter {
                root_offset,
                height,
                data_len: this.data_len,
                entry_count: this.entry_count,
                version: TREE_SEGMENT_FORMAT_VERSION,
                magic: magic::TREE_SEGMENT,
            },
        )?;
        this.writer.flush()?;
        this.writer.get_ref().sync_all()?;
        drop(this.writer);

        debug!(id = this.id, entries = this.entry_count, height, "Finished tree segment");
        Ok(Box::new(TreeFile::open(this.path, this.id)?))
    }
}

/// Finished tree segment
pub struct TreeFile {
    id: SegmentId,
    path: PathBuf,
    file: Mutex<File>,
    footer: TreeFooter,
    file_size: u64,
}

impl TreeFile {
    /// Open a finished tree segment at `path`
    pub fn open(path: PathBuf, id: SegmentId) -> Result<Self> {
        let mut file = File::open(&path)?;
        let file_size = file.metadata()?.len();

        let footer: TreeFooter = read_footer(&mut file, file_size)?;
        if footer.magic != magic::TREE_SEGMENT {
            return Err(Error::Corrupt(format!(
                "bad tree segment magic in {}",
                path.display()
            )));
        }
        if !tree_segment_version().can_read(footer.version) {
            return Err(Error::Corrupt(format!(
                "unsupported tree segment version {}",
                footer.version
            )));
        }
        if footer.data_len > file_size || footer.root_offset > file_size {
            return Err(Error::Corrupt("tree footer offsets out of range".to_string()));
        }

        Ok(Self {
            id,
            path,
            file: Mutex::new(file),
            footer,
            file_size,
        })
    }

    fn read_node(file: &mut File, offset: u64) -> Result<Vec<(Vec<u8>, u64)>> {
        file.seek(SeekFrom::Start(offset))?;
        let payload = read_framed(file, "tree node")?;
        decode_node(&payload)
    }
}

impl SegmentFile for TreeFile {
    fn id(&self) -> SegmentId {
        self.id
    }

    fn entry_count(&self) -> u64 {
        self.footer.entry_count
    }

    fn file_size(&self) -> u64 {
        self.file_size
    }

    fn query(&self, key: &[u8], comparator: &Comparator) -> Result<Option<Vec<u8>>> {
        if self.footer.height == 0 {
            return Ok(None);
        }

        let mut file = self.file.lock().map_err(|_| Error::LockPoisoned)?;
        let mut offset = self.footer.root_offset;

        for _ in 1..self.footer.height {
            let node = Self::read_node(&mut file, offset)?;
            let idx = node.partition_point(|(k, _)| comparator.compare(k, key) != Ordering::Greater);
            if idx == 0 {
                return Ok(None);
            }
            offset = node[idx - 1].1;
        }

        let leaf = Self::read_node(&mut file, offset)?;
        let idx = leaf.partition_point(|(k, _)| comparator.compare(k, key) == Ordering::Less);
        match leaf.get(idx) {
            Some((k, record_offset)) if comparator.compare(k, key) == Ordering::Equal => {
                file.seek(SeekFrom::Start(*record_offset))?;
                let (_, value, _) = read_record(&mut *file)?;
                Ok(Some(value))
            }
            _ => Ok(None),
        }
    }

    fn create_reader(&self) -> Result<Box<dyn SegmentReader>> {
        let mut reader = TreeReader::new(&self.path, self.footer.data_len)?;
        reader.load_at(0)?;
        Ok(Box::new(reader))
    }

    fn reopen_reader(&self, state: &[u8]) -> Result<Box<dyn SegmentReader>> {
        let state: TreeReaderState = decode_state(state)?;
        if state.offset > self.footer.data_len {
            return Err(Error::Corrupt(format!(
                "reader position {} beyond data of segment {:016x}",
                state.offset, self.id
            )));
        }
        let mut reader = TreeReader::new(&self.path, self.footer.data_len)?;
        reader.load_at(state.offset)?;
        Ok(Box::new(reader))
    }

    fn destroy(&mut self, erase: bool) -> Result<()> {
        if erase {
            erase_file(&self.path)?;
        }
        Ok(())
    }
}

/// Sequential reader over the records of a tree segment
pub struct TreeReader {
    reader: BufReader<File>,
    pos: u64,
    data_len: u64,
    offset: u64,
    next_offset: u64,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl TreeReader {
    fn new(path: &Path, data_len: u64) -> Result<Self> {
        Ok(Self {
            reader: BufReader::new(File::open(path)?),
            pos: 0,
            data_len,
            offset: 0,
            next_offset: 0,
            current: None,
        })
    }

    fn load_at(&mut self, offset: u64) -> Result<()> {
        self.offset = offset;
        self.current = None;

        if offset >= self.data_len {
            self.next_offset = offset;
            return Ok(());
        }

        if self.pos != offset {
            self.reader.seek(SeekFrom::Start(offset))?;
        }
        let (key, value, size) = read_record(&mut self.reader)?;
        self.pos = offset + size;
        self.next_offset = self.pos;
        self.current = Some((key, value));
        Ok(())
    }
}

impl SegmentReader for TreeReader {
    fn entry(&self) -> Option<(&[u8], &[u8])> {
        self.current
            .as_ref()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    fn advance(&mut self) -> Result<bool> {
        if self.current.is_none() {
            return Ok(false);
        }
        self.load_at(self.next_offset)?;
        Ok(self.current.is_some())
    }

    fn checkpoint(&self) -> Result<Vec<u8>> {
        encode_state(&TreeReaderState {
            offset: self.offset,
        })
    }
}
