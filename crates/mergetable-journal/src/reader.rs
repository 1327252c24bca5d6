// Journal reader module - parses the snapshot header and walks the tail
//
// The reader handles:
// 1. Snapshot decoding - magic, version and checksum of the header
// 2. Record reading - length-prefixed records until a zero length or EOF
// 3. Torn-append detection - a zero length followed by non-zero bytes is
//    an append that never got its length written, and is discarded

use crate::record::{JournalRecord, LENGTH_SIZE, MAX_PAYLOAD_SIZE, PAYLOAD_OVERHEAD};
use crate::snapshot::{JournalSnapshot, SNAPSHOT_HEADER_SIZE};
use mergetable_core::{Error, Result};
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Sequential reader over the tail records of one journal file
pub struct JournalReader {
    reader: BufReader<File>,
    path: PathBuf,
    /// Offset one past the last complete record
    valid_end: u64,
    finished: bool,
}

impl JournalReader {
    /// Open a journal file and decode its snapshot header.
    ///
    /// Returns the snapshot and a reader positioned at the first tail record.
    pub fn open(path: &Path) -> Result<(JournalSnapshot, Self)> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut header = [0u8; SNAPSHOT_HEADER_SIZE];
        read_exact_or_corrupt(&mut reader, &mut header, "journal header")?;
        let (body_len, crc) = JournalSnapshot::decode_header(&header)?;

        let mut body = vec![0u8; body_len];
        read_exact_or_corrupt(&mut reader, &mut body, "journal snapshot")?;
        let snapshot = JournalSnapshot::decode_body(&body, crc)?;

        Ok((
            snapshot,
            Self {
                reader,
                path: path.to_path_buf(),
                valid_end: (SNAPSHOT_HEADER_SIZE + body_len) as u64,
                finished: false,
            },
        ))
    }

    /// Read the next tail record
    ///
    /// Returns `Ok(None)` at the end of the valid log and an error when a
    /// record with a non-zero length prefix is damaged.
    pub fn next_record(&mut self) -> Result<Option<JournalRecord>> {
        if self.finished {
            return Ok(None);
        }

        let mut len_buf = [0u8; LENGTH_SIZE];
        if !read_or_eof(&mut self.reader, &mut len_buf)? {
            self.finished = true;
            return Ok(None);
        }

        let length = u32::from_le_bytes(len_buf) as usize;
        if length == 0 {
            self.finished = true;
            self.check_torn_append()?;
            return Ok(None);
        }

        if length > MAX_PAYLOAD_SIZE {
            return Err(Error::Corrupt(format!(
                "journal record at offset {} claims {} bytes",
                self.valid_end, length
            )));
        }

        let mut payload = vec![0u8; length];
        read_exact_or_corrupt(&mut self.reader, &mut payload, "journal record")?;
        let record = JournalRecord::decode_payload(&payload)?;

        self.valid_end += (LENGTH_SIZE + length) as u64;
        Ok(Some(record))
    }

    /// Read every remaining record
    pub fn read_all(&mut self) -> Result<Vec<JournalRecord>> {
        let mut records = Vec::new();
        while let Some(record) = self.next_record()? {
            records.push(record);
        }
        Ok(records)
    }

    /// Offset one past the last complete record read so far
    pub fn valid_end(&self) -> u64 {
        self.valid_end
    }

    /// Path of the journal file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_torn_append(&mut self) -> Result<()> {
        let mut trailing = [0u8; PAYLOAD_OVERHEAD];
        let mut filled = 0;
        while filled < trailing.len() {
            match self.reader.read(&mut trailing[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        if trailing[..filled].iter().any(|b| *b != 0) {
            warn!(
                path = %self.path.display(),
                offset = self.valid_end,
                "Discarding torn journal append"
            );
        }
        Ok(())
    }
}

impl Iterator for JournalReader {
    type Item = Result<JournalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Fill `buf` completely, or report a clean EOF before the first byte
fn read_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            // A partial length prefix at EOF is the zero-filled end of the
            // file being cut short.
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

fn read_exact_or_corrupt<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            Error::Corrupt(format!("truncated {}", what))
        } else {
            Error::Io(e)
        }
    })
}
