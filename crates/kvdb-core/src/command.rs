//! # command
//!
//! why: define the only mutation the replicated log carries for the application
//! relations: encoded by the kvdb store facade, decoded by the fsm on apply
//! what: Command enum, versioned payload encoding

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// First byte of every encoded command.
pub const COMMAND_VERSION: u8 = 1;

/// A mutation of the replicated map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Command {
    /// Insert or overwrite `key`
    Set { key: String, value: String },
    /// Remove `key` if present
    Delete { key: String },
}

impl Command {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. } | Self::Delete { key } => key,
        }
    }

    /// `[version][json body]`
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = vec![COMMAND_VERSION];
        serde_json::to_writer(&mut buf, self).map_err(|e| CodecError::Malformed(e.to_string()))?;
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let (&version, body) = buf.split_first().ok_or(CodecError::Empty)?;
        if version != COMMAND_VERSION {
            return Err(CodecError::UnknownVersion(version));
        }
        serde_json::from_slice(body).map_err(|e| CodecError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_round_trips() {
        let cmd = Command::set("k1", "v1");
        assert_eq!(Command::decode(&cmd.encode().unwrap()).unwrap(), cmd);
    }

    #[test]
    fn body_is_tagged_by_op() {
        let bytes = Command::delete("k").encode().unwrap();
        assert_eq!(bytes[0], COMMAND_VERSION);
        assert_eq!(&bytes[1..], br#"{"op":"delete","key":"k"}"#);
    }

    #[test]
    fn unknown_op_is_malformed() {
        let mut bytes = vec![COMMAND_VERSION];
        bytes.extend_from_slice(br#"{"op":"incr","key":"k"}"#);
        assert!(matches!(
            Command::decode(&bytes),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn empty_and_unversioned_payloads_fail() {
        assert_eq!(Command::decode(&[]), Err(CodecError::Empty));
        assert_eq!(
            Command::decode(br#"{"op":"set"}"#),
            Err(CodecError::UnknownVersion(b'{'))
        );
    }
}
