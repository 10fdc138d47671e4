//! WAL record framing (length + crc32c + index + kind)
//!
//! ```text
//! [len u32 LE][crc32c u32 LE][index u64 LE][kind u8][body ...len bytes]
//! ```
//! The checksum covers `index`, `kind` and `body`.

use std::io::Read;

use crc32c::crc32c_append;

use super::WalError;

pub const RECORD_HEADER_LEN: usize = 4 + 4 + 8 + 1;

/// Upper bound for a single record body
pub const MAX_RECORD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Header = 1,
    Event = 2,
    Footer = 3,
}

impl RecordKind {
    fn from_byte(b: u8) -> Result<Self, WalError> {
        match b {
            1 => Ok(RecordKind::Header),
            2 => Ok(RecordKind::Event),
            3 => Ok(RecordKind::Footer),
            other => Err(WalError::Corrupted {
                reason: format!("unknown record kind {other}"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub index: u64,
    pub kind: RecordKind,
    pub body: Vec<u8>,
}

fn checksum(index: u64, kind: RecordKind, body: &[u8]) -> u32 {
    let crc = crc32c_append(0, &index.to_le_bytes());
    let crc = crc32c_append(crc, &[kind as u8]);
    crc32c_append(crc, body)
}

pub fn encode_record(index: u64, kind: RecordKind, body: &[u8]) -> Result<Vec<u8>, WalError> {
    if body.len() > MAX_RECORD_BYTES {
        return Err(WalError::RecordTooLarge {
            max: MAX_RECORD_BYTES,
            got: body.len(),
        });
    }
    let mut out = Vec::with_capacity(RECORD_HEADER_LEN + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&checksum(index, kind, body).to_le_bytes());
    out.extend_from_slice(&index.to_le_bytes());
    out.push(kind as u8);
    out.extend_from_slice(body);
    Ok(out)
}

/// Outcome of reading one record
#[derive(Debug)]
pub enum ReadNext {
    Record(Record),
    /// Clean end of file
    End,
    /// File ends in the middle of a record (crash during write)
    TornTail,
}

pub struct RecordReader<R> {
    reader: R,
}

impl<R: Read> RecordReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    pub fn read_next(&mut self) -> Result<ReadNext, WalError> {
        let mut header = [0u8; RECORD_HEADER_LEN];
        let got = read_full(&mut self.reader, &mut header)?;
        if got == 0 {
            return Ok(ReadNext::End);
        }
        if got < header.len() {
            return Ok(ReadNext::TornTail);
        }

        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if len > MAX_RECORD_BYTES {
            return Err(WalError::Corrupted {
                reason: format!("record length {len} exceeds {MAX_RECORD_BYTES}"),
            });
        }
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let mut index_bytes = [0u8; 8];
        index_bytes.copy_from_slice(&header[8..16]);
        let index = u64::from_le_bytes(index_bytes);
        let kind = RecordKind::from_byte(header[16])?;

        let mut body = vec![0u8; len];
        if read_full(&mut self.reader, &mut body)? < len {
            return Ok(ReadNext::TornTail);
        }

        let actual_crc = checksum(index, kind, &body);
        if actual_crc != expected_crc {
            return Err(WalError::Corrupted {
                reason: format!(
                    "crc mismatch at index {index}: expected {expected_crc} got {actual_crc}"
                ),
            });
        }
        Ok(ReadNext::Record(Record { index, kind, body }))
    }
}

/// Read until `buf` is full or EOF, returning the number of bytes read
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, WalError> {
    let mut read = 0usize;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(read)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn read_all(bytes: Vec<u8>) -> Vec<ReadNext> {
        let mut reader = RecordReader::new(Cursor::new(bytes));
        let mut out = Vec::new();
        loop {
            let next = reader.read_next().unwrap();
            let stop = !matches!(next, ReadNext::Record(_));
            out.push(next);
            if stop {
                break;
            }
        }
        out
    }

    #[test]
    fn test_records_read_back_in_order() {
        let mut bytes = encode_record(1, RecordKind::Header, b"{}").unwrap();
        bytes.extend(encode_record(2, RecordKind::Event, b"abc").unwrap());
        let out = read_all(bytes);
        assert_eq!(out.len(), 3);
        match &out[1] {
            ReadNext::Record(r) => {
                assert_eq!(r.index, 2);
                assert_eq!(r.kind, RecordKind::Event);
                assert_eq!(r.body, b"abc");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(out[2], ReadNext::End));
    }

    #[test]
    fn test_torn_tail_detected() {
        let mut bytes = encode_record(1, RecordKind::Header, b"{}").unwrap();
        let second = encode_record(2, RecordKind::Event, b"hello world").unwrap();
        bytes.extend_from_slice(&second[..second.len() - 4]);
        let out = read_all(bytes);
        assert!(matches!(out.last(), Some(ReadNext::TornTail)));
    }

    #[test]
    fn test_crc_mismatch_is_corruption() {
        let mut bytes = encode_record(7, RecordKind::Event, b"payload").unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let mut reader = RecordReader::new(Cursor::new(bytes));
        assert!(matches!(
            reader.read_next(),
            Err(WalError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_unknown_kind_is_corruption() {
        let mut bytes = encode_record(1, RecordKind::Header, b"").unwrap();
        bytes[16] = 42;
        let mut reader = RecordReader::new(Cursor::new(bytes));
        assert!(matches!(
            reader.read_next(),
            Err(WalError::Corrupted { .. })
        ));
    }
}
