//! # log
//!
//! why: define the unit of replicated history and the exact bytes it occupies on disk
//! relations: persisted by kvdb-storage, converted to and from raft entries by kvdb
//! what: LogEntry struct, LogType, fixed-layout big-endian codec

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// index (8) + term (8) + type (1) + data length (8)
pub const HEADER_LEN: usize = 25;

/// What a log entry carries. The discriminants are the persisted type byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LogType {
    /// An application command for the state machine
    #[default]
    Command = 0,
    /// Appended by a new leader to commit entries from earlier terms
    NoOp = 1,
    /// Forces everything before it to be applied
    Barrier = 4,
    /// A change to the voting member set
    Configuration = 5,
}

impl LogType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Command),
            1 => Some(Self::NoOp),
            4 => Some(Self::Barrier),
            5 => Some(Self::Configuration),
            _ => None,
        }
    }
}

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u64,
    /// The index of this entry in the log (1-indexed)
    pub index: u64,
    /// How `data` should be interpreted
    pub log_type: LogType,
    /// Opaque payload, an encoded command for `LogType::Command`
    pub data: Vec<u8>,
}

impl LogEntry {
    /// Create a new command entry
    pub fn new(term: u64, index: u64, data: Vec<u8>) -> Self {
        Self {
            term,
            index,
            log_type: LogType::Command,
            data,
        }
    }

    pub fn with_type(mut self, log_type: LogType) -> Self {
        self.log_type = log_type;
        self
    }

    /// Serialize into the persisted layout:
    ///
    /// ```text
    /// [0:8)   index, big-endian u64
    /// [8:16)  term,  big-endian u64
    /// [16]    type
    /// [17:25) len(data), big-endian u64
    /// [25..)  data
    /// ```
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.data.len());
        buf.extend_from_slice(&self.index.to_be_bytes());
        buf.extend_from_slice(&self.term.to_be_bytes());
        buf.push(self.log_type.as_u8());
        buf.extend_from_slice(&(self.data.len() as u64).to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Parse the layout written by [`LogEntry::encode`]. Bytes past the
    /// declared data length are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_LEN {
            return Err(CodecError::Truncated { len: buf.len() });
        }

        let index = read_u64(&buf[0..8]);
        let term = read_u64(&buf[8..16]);
        let log_type =
            LogType::from_u8(buf[16]).ok_or(CodecError::UnknownLogType(buf[16]))?;
        let declared = read_u64(&buf[17..25]);

        let body = &buf[HEADER_LEN..];
        if declared > body.len() as u64 {
            return Err(CodecError::LengthOverflow {
                declared,
                available: body.len(),
            });
        }

        Ok(Self {
            term,
            index,
            log_type,
            data: body[..declared as usize].to_vec(),
        })
    }
}

/// Big-endian u64 from an 8-byte slice.
pub fn read_u64(bytes: &[u8]) -> u64 {
    let mut num = [0u8; 8];
    num.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(num)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_layout_is_bit_exact() {
        let entry = LogEntry::new(2, 1, b"ab".to_vec()).with_type(LogType::NoOp);
        let bytes = entry.encode();

        assert_eq!(&bytes[0..8], &[0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(&bytes[8..16], &[0, 0, 0, 0, 0, 0, 0, 2]);
        assert_eq!(bytes[16], 1);
        assert_eq!(&bytes[17..25], &[0, 0, 0, 0, 0, 0, 0, 2]);
        assert_eq!(&bytes[25..], b"ab");
    }

    #[test]
    fn empty_data_round_trips() {
        let entry = LogEntry::new(u64::MAX, 7, Vec::new()).with_type(LogType::Configuration);
        let decoded = LogEntry::decode(&entry.encode()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn short_buffer_is_truncated() {
        assert_eq!(
            LogEntry::decode(&[0u8; 24]),
            Err(CodecError::Truncated { len: 24 })
        );
    }

    #[test]
    fn declared_length_past_end_is_rejected() {
        let mut bytes = LogEntry::new(1, 1, b"abc".to_vec()).encode();
        bytes.truncate(HEADER_LEN + 2);
        assert_eq!(
            LogEntry::decode(&bytes),
            Err(CodecError::LengthOverflow {
                declared: 3,
                available: 2
            })
        );
    }

    #[test]
    fn unknown_type_byte_is_rejected() {
        let mut bytes = LogEntry::new(1, 1, vec![]).encode();
        bytes[16] = 9;
        assert_eq!(LogEntry::decode(&bytes), Err(CodecError::UnknownLogType(9)));
    }
}
