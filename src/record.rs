use std::io::Cursor;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::Error;

/// Fixed header: version(1) + op(1) + value_offset(4) + value_size(4) +
/// timestamp(4) + keylen(2).
pub const HEADER_SIZE: usize = 16;

/// Current record format version.
pub const FORMAT_VERSION: u8 = 0;

/// Op code of a set record.
pub const OP_SET: u8 = 0;
/// Op code of a delete record (tombstone).
pub const OP_DELETE: u8 = 1;

/// Largest encodable key: keylen is stored as a u16.
pub const MAX_KEY_LEN: usize = u16::MAX as usize;

/// One entry of the keys log. The op code is kept raw so replay can skip
/// codes it does not recognize without failing the decode.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRecord {
    pub op: u8,
    pub value_offset: u32,
    pub value_size: u32,
    pub timestamp: u32,
    pub key: Vec<u8>,
}

impl KeyRecord {
    /// A set record pointing at the value slot `(value_offset, value_size)`.
    pub fn set(key: &[u8], value_offset: u32, value_size: u32) -> Self {
        KeyRecord {
            op: OP_SET,
            value_offset,
            value_size,
            timestamp: unix_seconds(),
            key: key.to_vec(),
        }
    }

    /// A tombstone for `key`. Offset and size are zero by convention.
    pub fn delete(key: &[u8]) -> Self {
        KeyRecord {
            op: OP_DELETE,
            value_offset: 0,
            value_size: 0,
            timestamp: unix_seconds(),
            key: key.to_vec(),
        }
    }

    /// Total encoded size, header plus key bytes.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.key.len()
    }

    /// Encodes the record into `buf`. The buffer is cleared first so one
    /// scratch allocation can be reused across calls.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        if self.key.is_empty() || self.key.len() > MAX_KEY_LEN {
            return Err(Error::InvalidKey);
        }
        buf.clear();
        buf.reserve(self.encoded_len());
        buf.write_u8(FORMAT_VERSION)?;
        buf.write_u8(self.op)?;
        buf.write_u32::<BigEndian>(self.value_offset)?;
        buf.write_u32::<BigEndian>(self.value_size)?;
        buf.write_u32::<BigEndian>(self.timestamp)?;
        buf.write_u16::<BigEndian>(self.key.len() as u16)?;
        buf.extend_from_slice(&self.key);
        Ok(())
    }
}

fn unix_seconds() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

/// Forward-only reader over a keys-log buffer.
///
/// Yields `(record_offset, record)` pairs, where `record_offset` is the byte
/// position of the record's first header byte. Iteration ends cleanly at the
/// end of the buffer, at a truncated trailing header, or at a keylen that
/// runs past the buffer; `truncated()` tells the two apart so the caller can
/// log what was abandoned. The version byte is not interpreted: keylen alone
/// frames the record.
pub struct LogReader<'a> {
    buf: &'a [u8],
    cursor: usize,
    done: bool,
}

impl<'a> LogReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        LogReader {
            buf,
            cursor: 0,
            done: false,
        }
    }

    /// Byte position of the next undecoded record.
    pub fn offset(&self) -> usize {
        self.cursor
    }

    /// True if iteration stopped with undecodable bytes left over.
    pub fn truncated(&self) -> bool {
        self.done && self.cursor < self.buf.len()
    }
}

impl<'a> Iterator for LogReader<'a> {
    type Item = (u32, KeyRecord);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let remaining = &self.buf[self.cursor..];
        if remaining.len() < HEADER_SIZE {
            self.done = true;
            return None;
        }

        let mut reader = Cursor::new(remaining);
        let _version = reader.read_u8().ok()?;
        let op = reader.read_u8().ok()?;
        let value_offset = reader.read_u32::<BigEndian>().ok()?;
        let value_size = reader.read_u32::<BigEndian>().ok()?;
        let timestamp = reader.read_u32::<BigEndian>().ok()?;
        let keylen = reader.read_u16::<BigEndian>().ok()? as usize;

        if remaining.len() < HEADER_SIZE + keylen {
            // Partial trailing record, e.g. a crash mid-append.
            self.done = true;
            return None;
        }
        let key = remaining[HEADER_SIZE..HEADER_SIZE + keylen].to_vec();

        let record_offset = self.cursor as u32;
        self.cursor += HEADER_SIZE + keylen;

        Some((
            record_offset,
            KeyRecord {
                op,
                value_offset,
                value_size,
                timestamp,
                key,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(record: &KeyRecord) -> Vec<u8> {
        let mut buf = Vec::new();
        record.encode_into(&mut buf).expect("Failed to encode");
        buf
    }

    #[test]
    fn test_record_round_trip() {
        let record = KeyRecord::set(b"answer", 1024, 42);
        let buf = encode(&record);
        assert_eq!(buf.len(), HEADER_SIZE + 6);
        assert_eq!(buf[0], FORMAT_VERSION);
        assert_eq!(buf[1], OP_SET);

        let mut reader = LogReader::new(&buf);
        let (offset, decoded) = reader.next().expect("Expected one record");
        assert_eq!(offset, 0);
        assert_eq!(decoded, record);
        assert!(reader.next().is_none());
        assert!(!reader.truncated());
    }

    #[test]
    fn test_tombstone_round_trip() {
        let record = KeyRecord::delete(b"gone");
        let buf = encode(&record);

        let (_, decoded) = LogReader::new(&buf).next().expect("Expected one record");
        assert_eq!(decoded.op, OP_DELETE);
        assert_eq!(decoded.value_offset, 0);
        assert_eq!(decoded.value_size, 0);
        assert_eq!(decoded.key, b"gone");
    }

    #[test]
    fn test_reader_offsets_advance_by_record_size() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&encode(&KeyRecord::set(b"aa", 0, 3)));
        buf.extend_from_slice(&encode(&KeyRecord::set(b"bbbb", 3, 5)));
        buf.extend_from_slice(&encode(&KeyRecord::delete(b"aa")));

        let offsets: Vec<u32> = LogReader::new(&buf).map(|(off, _)| off).collect();
        assert_eq!(
            offsets,
            vec![
                0,
                (HEADER_SIZE + 2) as u32,
                (HEADER_SIZE + 2 + HEADER_SIZE + 4) as u32
            ]
        );
    }

    #[test]
    fn test_truncated_header_stops_cleanly() {
        let mut buf = encode(&KeyRecord::set(b"key", 0, 1));
        buf.extend_from_slice(&[0u8; 7]); // less than a header

        let mut reader = LogReader::new(&buf);
        assert!(reader.next().is_some());
        assert!(reader.next().is_none());
        assert!(reader.truncated());
    }

    #[test]
    fn test_truncated_key_stops_cleanly() {
        let mut buf = encode(&KeyRecord::set(b"first", 0, 1));
        let second = encode(&KeyRecord::set(b"second-key", 1, 2));
        buf.extend_from_slice(&second[..second.len() - 4]); // chop the key

        let records: Vec<_> = LogReader::new(&buf).collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].1.key, b"first");

        let mut reader = LogReader::new(&buf);
        reader.by_ref().count();
        assert!(reader.truncated());
    }

    #[test]
    fn test_unknown_version_is_tolerated() {
        let mut buf = encode(&KeyRecord::set(b"old", 7, 7));
        buf[0] = 9; // future version, same framing
        buf.extend_from_slice(&encode(&KeyRecord::set(b"new", 14, 7)));

        let records: Vec<_> = LogReader::new(&buf).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].1.key, b"new");
    }

    #[test]
    fn test_unknown_op_is_surfaced_raw() {
        let mut buf = encode(&KeyRecord::set(b"k", 0, 0));
        buf[1] = 0xee;

        let (_, record) = LogReader::new(&buf).next().expect("Expected one record");
        assert_eq!(record.op, 0xee);
    }

    #[test]
    fn test_empty_and_oversized_keys_are_rejected() {
        let mut buf = Vec::new();
        let empty = KeyRecord::set(b"", 0, 0);
        assert_eq!(empty.encode_into(&mut buf), Err(Error::InvalidKey));

        let huge = KeyRecord::set(&vec![b'x'; MAX_KEY_LEN + 1], 0, 0);
        assert_eq!(huge.encode_into(&mut buf), Err(Error::InvalidKey));

        let max = KeyRecord::set(&vec![b'x'; MAX_KEY_LEN], 0, 0);
        assert!(max.encode_into(&mut buf).is_ok());
    }

    #[test]
    fn test_empty_log() {
        let mut reader = LogReader::new(&[]);
        assert!(reader.next().is_none());
        assert!(!reader.truncated());
    }
}
