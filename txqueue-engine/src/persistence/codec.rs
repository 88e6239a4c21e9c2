//! Binary encoding for persisted records.
//!
//! Record layout, shared by every durable backend:
//!
//! ```text
//! [type: u8][id: 16 bytes][body?]
//! body = [queue_len: u16 LE][queue: utf8][payload bytes]
//! ```
//!
//! `type` is one of [`RecordType`]; a DELETE record carries no body.
//!
//! The journal and log backends wrap every record in a frame:
//!
//! ```text
//! [len: u32 LE][crc32: u32 LE][lsn: u64 LE][record: len bytes]
//! ```
//!
//! The CRC covers the lsn and the record so that a torn or bit-flipped
//! frame is never replayed.

use super::types::{Holder, PersistenceError, Result};
use crate::core::types::{ObjectId, Payload};
use crc32fast::Hasher;
use std::io::{self, Read, Write};

pub const RECORD_HEADER_SIZE: usize = 1 + ObjectId::LEN;
pub const FRAME_HEADER_SIZE: usize = 4 + 4 + 8;

/// Upper bound on a single record, guards against reading a garbage length
pub const MAX_RECORD_SIZE: usize = 256 * 1024 * 1024;

/// Log sequence number: position of a frame in a journal or log
pub type Lsn = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    StoreObject = 0,
    StoreBytes = 1,
    StoreString = 2,
    Delete = 3,
}

impl TryFrom<u8> for RecordType {
    type Error = PersistenceError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(RecordType::StoreObject),
            1 => Ok(RecordType::StoreBytes),
            2 => Ok(RecordType::StoreString),
            3 => Ok(RecordType::Delete),
            other => Err(PersistenceError::SerializationError(format!(
                "unknown record type {other}"
            ))),
        }
    }
}

/// One decoded log record
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Store { id: ObjectId, holder: Holder },
    Delete { id: ObjectId },
}

impl Record {
    pub fn id(&self) -> ObjectId {
        match self {
            Record::Store { id, .. } | Record::Delete { id } => *id,
        }
    }

    pub fn record_type(&self) -> RecordType {
        match self {
            Record::Store { holder, .. } => store_type(&holder.payload),
            Record::Delete { .. } => RecordType::Delete,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Record::Store { id, holder } => encode_store(*id, holder),
            Record::Delete { id } => Ok(encode_delete(*id)),
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Err(PersistenceError::SerializationError(format!(
                "record too short: {} bytes",
                buf.len()
            )));
        }

        let record_type = RecordType::try_from(buf[0])?;
        let mut id_bytes = [0u8; ObjectId::LEN];
        id_bytes.copy_from_slice(&buf[1..RECORD_HEADER_SIZE]);
        let id = ObjectId::from_bytes(id_bytes);
        let body = &buf[RECORD_HEADER_SIZE..];

        if record_type == RecordType::Delete {
            if !body.is_empty() {
                return Err(PersistenceError::SerializationError(
                    "delete record carries a body".to_string(),
                ));
            }
            return Ok(Record::Delete { id });
        }

        if body.len() < 2 {
            return Err(PersistenceError::SerializationError(
                "store record missing queue name".to_string(),
            ));
        }
        let queue_len = u16::from_le_bytes([body[0], body[1]]) as usize;
        let rest = &body[2..];
        if rest.len() < queue_len {
            return Err(PersistenceError::SerializationError(
                "store record queue name truncated".to_string(),
            ));
        }
        let queue = std::str::from_utf8(&rest[..queue_len])
            .map_err(|e| PersistenceError::SerializationError(e.to_string()))?
            .to_string();
        let data = &rest[queue_len..];

        let payload = match record_type {
            RecordType::StoreBytes => Payload::Bytes(data.to_vec()),
            RecordType::StoreString => Payload::Text(
                String::from_utf8(data.to_vec())
                    .map_err(|e| PersistenceError::SerializationError(e.to_string()))?,
            ),
            RecordType::StoreObject => Payload::Object(serde_json::from_slice(data)?),
            RecordType::Delete => return Ok(Record::Delete { id }),
        };

        Ok(Record::Store {
            id,
            holder: Holder { queue, payload },
        })
    }
}

fn store_type(payload: &Payload) -> RecordType {
    match payload {
        Payload::Object(_) => RecordType::StoreObject,
        Payload::Bytes(_) => RecordType::StoreBytes,
        Payload::Text(_) => RecordType::StoreString,
    }
}

/// Encode a STORE record without cloning the holder
pub fn encode_store(id: ObjectId, holder: &Holder) -> Result<Vec<u8>> {
    let queue = holder.queue.as_bytes();
    let queue_len = u16::try_from(queue.len())
        .map_err(|_| PersistenceError::InvalidQueueName(holder.queue.clone()))?;

    let mut out = Vec::with_capacity(RECORD_HEADER_SIZE + 2 + queue.len() + 64);
    out.push(store_type(&holder.payload) as u8);
    out.extend_from_slice(id.as_bytes());
    out.extend_from_slice(&queue_len.to_le_bytes());
    out.extend_from_slice(queue);

    match &holder.payload {
        Payload::Bytes(b) => out.extend_from_slice(b),
        Payload::Text(s) => out.extend_from_slice(s.as_bytes()),
        Payload::Object(v) => serde_json::to_writer(&mut out, v)?,
    }
    Ok(out)
}

pub fn encode_delete(id: ObjectId) -> Vec<u8> {
    let mut out = Vec::with_capacity(RECORD_HEADER_SIZE);
    out.push(RecordType::Delete as u8);
    out.extend_from_slice(id.as_bytes());
    out
}

#[inline]
pub(crate) fn frame_crc(lsn: Lsn, record: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&lsn.to_le_bytes());
    hasher.update(record);
    hasher.finalize()
}

/// Write one frame, returning the number of bytes written
pub fn write_frame<W: Write>(writer: &mut W, lsn: Lsn, record: &[u8]) -> Result<u64> {
    let len = u32::try_from(record.len()).map_err(|_| {
        PersistenceError::SerializationError(format!("record too large: {}", record.len()))
    })?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&frame_crc(lsn, record).to_le_bytes())?;
    writer.write_all(&lsn.to_le_bytes())?;
    writer.write_all(record)?;
    Ok((FRAME_HEADER_SIZE + record.len()) as u64)
}

/// Result of reading the next frame from a stream
#[derive(Debug, PartialEq)]
pub enum FrameRead {
    Frame { lsn: Lsn, record: Vec<u8> },
    /// Clean end of stream on a frame boundary
    End,
    /// The stream ends inside a frame: a torn write
    Torn,
}

/// Sequential frame reader that tracks the byte offset of the last good frame
pub struct FrameReader<R> {
    inner: R,
    offset: u64,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, offset: 0 }
    }

    /// Byte offset just past the last complete frame
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn next_frame(&mut self) -> Result<FrameRead> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        match read_full(&mut self.inner, &mut header)? {
            0 => return Ok(FrameRead::End),
            n if n < FRAME_HEADER_SIZE => return Ok(FrameRead::Torn),
            _ => {}
        }

        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let expected = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let mut lsn_bytes = [0u8; 8];
        lsn_bytes.copy_from_slice(&header[8..16]);
        let lsn = Lsn::from_le_bytes(lsn_bytes);

        if len > MAX_RECORD_SIZE {
            return Err(PersistenceError::Corrupted {
                offset: self.offset,
                reason: format!("frame length {len} exceeds limit"),
            });
        }

        let mut record = vec![0u8; len];
        if read_full(&mut self.inner, &mut record)? < len {
            return Ok(FrameRead::Torn);
        }

        let actual = frame_crc(lsn, &record);
        if actual != expected {
            return Err(PersistenceError::ChecksumMismatch { expected, actual });
        }

        self.offset += (FRAME_HEADER_SIZE + len) as u64;
        Ok(FrameRead::Frame { lsn, record })
    }
}

/// Read until `buf` is full or the stream ends, returning the bytes read
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    fn id(n: u128) -> ObjectId {
        ObjectId::from_u128(n)
    }

    #[test]
    fn test_store_string_layout() {
        let record = Record::Store {
            id: id(1),
            holder: Holder::new("orders", "item1"),
        };
        let bytes = record.encode().unwrap();

        assert_eq!(bytes[0], RecordType::StoreString as u8);
        assert_eq!(&bytes[1..17], id(1).as_bytes());
        assert_eq!(&bytes[17..19], &6u16.to_le_bytes());
        assert_eq!(&bytes[19..25], b"orders");
        assert_eq!(&bytes[25..], b"item1");
        assert_eq!(Record::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn test_delete_has_no_body() {
        let bytes = Record::Delete { id: id(9) }.encode().unwrap();
        assert_eq!(bytes.len(), RECORD_HEADER_SIZE);
        assert_eq!(bytes[0], 3);
        assert_eq!(Record::decode(&bytes).unwrap(), Record::Delete { id: id(9) });
    }

    #[test]
    fn test_type_tags_follow_payload() {
        let raw = Record::Store {
            id: id(2),
            holder: Holder::new("q", vec![0xffu8, 0x00]),
        };
        assert_eq!(raw.record_type(), RecordType::StoreBytes);

        let object = Record::Store {
            id: id(3),
            holder: Holder::new("q", json!({"sku": "A-1", "qty": 2})),
        };
        assert_eq!(object.record_type(), RecordType::StoreObject);
        let decoded = Record::decode(&object.encode().unwrap()).unwrap();
        assert_eq!(decoded, object);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Record::decode(&[0u8; 3]).is_err());
        let mut bytes = Record::Delete { id: id(1) }.encode().unwrap();
        bytes[0] = 42;
        assert!(Record::decode(&bytes).is_err());
        bytes[0] = RecordType::StoreString as u8;
        assert!(Record::decode(&bytes).is_err());
    }

    #[test]
    fn test_frames_read_back_in_order() {
        let mut buf = Vec::new();
        write_frame(&mut buf, 1, b"first").unwrap();
        write_frame(&mut buf, 2, b"second").unwrap();

        let mut reader = FrameReader::new(Cursor::new(buf.clone()));
        assert_eq!(
            reader.next_frame().unwrap(),
            FrameRead::Frame {
                lsn: 1,
                record: b"first".to_vec()
            }
        );
        assert_eq!(
            reader.next_frame().unwrap(),
            FrameRead::Frame {
                lsn: 2,
                record: b"second".to_vec()
            }
        );
        assert_eq!(reader.next_frame().unwrap(), FrameRead::End);
        assert_eq!(reader.offset(), buf.len() as u64);
    }

    #[test]
    fn test_torn_tail_detected() {
        let mut buf = Vec::new();
        let first = write_frame(&mut buf, 1, b"complete").unwrap();
        write_frame(&mut buf, 2, b"partial").unwrap();
        buf.truncate(buf.len() - 3);

        let mut reader = FrameReader::new(Cursor::new(buf));
        assert!(matches!(reader.next_frame().unwrap(), FrameRead::Frame { .. }));
        assert_eq!(reader.next_frame().unwrap(), FrameRead::Torn);
        assert_eq!(reader.offset(), first);
    }

    #[test]
    fn test_checksum_mismatch_is_an_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, 7, b"payload").unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0x01;

        let mut reader = FrameReader::new(Cursor::new(buf));
        assert!(matches!(
            reader.next_frame(),
            Err(PersistenceError::ChecksumMismatch { .. })
        ));
    }
}
