// Journal tail record format and encoding/decoding
//
// Record format (binary, little-endian):
// [length: u32] [crc32: u32] [value_len: u32] [key bytes] [value bytes]
//
// `length` counts every byte after the length field itself. The journal
// file is zero-filled ahead of the write position, so a zero length marks
// the end of the log. Writers put the payload down first and the length
// last, which makes a torn append look like the end of the log rather
// than like a damaged record.

use crc32fast::Hasher;
use mergetable_core::{Error, Result};

/// Size of the length prefix
pub const LENGTH_SIZE: usize = 4;

/// Fixed bytes inside the payload: crc + value length
pub const PAYLOAD_OVERHEAD: usize = 8;

/// Largest payload a reader accepts (256 MiB). Writers refuse anything
/// bigger, so every acknowledged write can be replayed.
pub const MAX_PAYLOAD_SIZE: usize = 256 * 1024 * 1024;

/// Largest combined key and value length a single record can carry
pub const MAX_RECORD_DATA: usize = MAX_PAYLOAD_SIZE - PAYLOAD_OVERHEAD;

/// Reject a key/value pair the journal could not replay
pub fn check_record_size(key_len: usize, value_len: usize) -> Result<()> {
    match key_len.checked_add(value_len) {
        Some(total) if total <= MAX_RECORD_DATA => Ok(()),
        _ => Err(Error::InvalidArgument(format!(
            "record of {} key bytes and {} value bytes exceeds the {} byte journal limit",
            key_len, value_len, MAX_RECORD_DATA
        ))),
    }
}

/// One journaled write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Outcome of decoding bytes at a record boundary
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// A complete record and the number of bytes it occupied
    Record(JournalRecord, usize),
    /// Zero length prefix, or not even a length prefix left
    End,
}

impl JournalRecord {
    pub fn new(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self { key, value }
    }

    /// Total on-disk size of a record for the given key and value lengths
    pub fn frame_len(key_len: usize, value_len: usize) -> usize {
        LENGTH_SIZE + PAYLOAD_OVERHEAD + key_len + value_len
    }

    /// Encode everything that follows the length prefix
    pub fn encode_payload(key: &[u8], value: &[u8]) -> Result<Vec<u8>> {
        check_record_size(key.len(), value.len())?;
        let value_len = payload_length(value)?;

        let mut hasher = Hasher::new();
        hasher.update(&value_len);
        hasher.update(key);
        hasher.update(value);
        let crc = hasher.finalize();

        let mut payload = Vec::with_capacity(PAYLOAD_OVERHEAD + key.len() + value.len());
        payload.extend_from_slice(&crc.to_le_bytes());
        payload.extend_from_slice(&value_len);
        payload.extend_from_slice(key);
        payload.extend_from_slice(value);
        Ok(payload)
    }

    /// Encode a full frame: length prefix followed by the payload
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = Self::encode_payload(&self.key, &self.value)?;
        let mut frame = Vec::with_capacity(LENGTH_SIZE + payload.len());
        frame.extend_from_slice(&payload_length(&payload)?);
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decode a payload (the bytes after a non-zero length prefix)
    pub fn decode_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() < PAYLOAD_OVERHEAD {
            return Err(Error::Corrupt(format!(
                "journal record payload too short: {} bytes",
                payload.len()
            )));
        }

        let stored_crc = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let value_len =
            u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]) as usize;

        let body = &payload[PAYLOAD_OVERHEAD..];
        if value_len > body.len() {
            return Err(Error::Corrupt(format!(
                "journal record value length {} exceeds payload of {} bytes",
                value_len,
                body.len()
            )));
        }

        let mut hasher = Hasher::new();
        hasher.update(&payload[4..]);
        let actual_crc = hasher.finalize();
        if actual_crc != stored_crc {
            return Err(Error::Corrupt(format!(
                "journal record CRC mismatch: expected {}, got {}",
                stored_crc, actual_crc
            )));
        }

        let key_len = body.len() - value_len;
        Ok(Self {
            key: body[..key_len].to_vec(),
            value: body[key_len..].to_vec(),
        })
    }

    /// Decode one record from the start of `data`
    pub fn decode(data: &[u8]) -> Result<Decoded> {
        if data.len() < LENGTH_SIZE {
            return Ok(Decoded::End);
        }

        let length = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if length == 0 {
            return Ok(Decoded::End);
        }

        if length > MAX_PAYLOAD_SIZE {
            return Err(Error::Corrupt(format!(
                "journal record length too large: {} bytes",
                length
            )));
        }

        let total = LENGTH_SIZE + length;
        if data.len() < total {
            return Err(Error::Corrupt(format!(
                "truncated journal record: expected {} bytes, got {}",
                total,
                data.len()
            )));
        }

        let record = Self::decode_payload(&data[LENGTH_SIZE..total])?;
        Ok(Decoded::Record(record, total))
    }
}

/// Little-endian length prefix for an encoded payload
pub fn payload_length(payload: &[u8]) -> Result<[u8; LENGTH_SIZE]> {
    u32::try_from(payload.len())
        .map(u32::to_le_bytes)
        .map_err(|_| Error::InvalidArgument(format!("journal payload of {} bytes", payload.len())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_encode_decode() {
        let record = JournalRecord::new(b"key1".to_vec(), b"value1".to_vec());

        let encoded = record.encode().unwrap();
        assert_eq!(encoded.len(), JournalRecord::frame_len(4, 6));

        match JournalRecord::decode(&encoded).unwrap() {
            Decoded::Record(decoded, size) => {
                assert_eq!(decoded, record);
                assert_eq!(size, encoded.len());
            }
            Decoded::End => panic!("expected a record"),
        }
    }

    #[test]
    fn test_empty_key_and_value() {
        let record = JournalRecord::new(Vec::new(), Vec::new());
        let encoded = record.encode().unwrap();
        assert!(matches!(
            JournalRecord::decode(&encoded).unwrap(),
            Decoded::Record(ref r, _) if r == &record
        ));
    }

    #[test]
    fn test_zero_length_is_end() {
        assert_eq!(JournalRecord::decode(&[0u8; 32]).unwrap(), Decoded::End);
        assert_eq!(JournalRecord::decode(&[0u8; 2]).unwrap(), Decoded::End);
    }

    #[test]
    fn test_crc_validation() {
        let record = JournalRecord::new(b"key".to_vec(), b"value".to_vec());
        let mut encoded = record.encode().unwrap();

        // Flip a byte inside the key
        encoded[13] ^= 0xFF;

        let err = JournalRecord::decode(&encoded).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_truncated_record() {
        let record = JournalRecord::new(b"key".to_vec(), b"value".to_vec());
        let encoded = record.encode().unwrap();

        let err = JournalRecord::decode(&encoded[..encoded.len() - 2]).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_record_size_limit() {
        assert!(check_record_size(16, MAX_RECORD_DATA - 16).is_ok());
        assert!(matches!(
            check_record_size(16, MAX_RECORD_DATA - 15),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            check_record_size(usize::MAX, 1),
            Err(Error::InvalidArgument(_))
        ));

        // The largest accepted record still fits under the reader's limit
        assert!(JournalRecord::frame_len(0, MAX_RECORD_DATA) - LENGTH_SIZE <= MAX_PAYLOAD_SIZE);
    }
}
