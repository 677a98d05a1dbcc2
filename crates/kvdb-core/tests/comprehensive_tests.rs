//! # comprehensive core tests
//!
//! why: verify the byte formats every node must agree on
//! relations: tests kvdb-core
//! what: log entry layout, corrupt input handling, command payloads, member identity

use kvdb_core::{ClusterMember, CodecError, Command, LogEntry, LogType, NodeState};

// =============================================================================
// SECTION 1: LOG ENTRY CODEC
// =============================================================================

mod log_codec {
    use super::*;

    #[test]
    fn entry_survives_encode_decode() {
        let entry = LogEntry::new(3, 42, b"payload".to_vec());
        let decoded = LogEntry::decode(&entry.encode()).unwrap();

        assert_eq!(decoded.index, 42);
        assert_eq!(decoded.term, 3);
        assert_eq!(decoded.log_type, LogType::Command);
        assert_eq!(decoded.data, b"payload".to_vec());
    }

    #[test]
    fn every_log_type_keeps_its_byte() {
        for (log_type, byte) in [
            (LogType::Command, 0u8),
            (LogType::NoOp, 1),
            (LogType::Barrier, 4),
            (LogType::Configuration, 5),
        ] {
            let bytes = LogEntry::new(1, 1, vec![]).with_type(log_type).encode();
            assert_eq!(bytes[16], byte);
            assert_eq!(LogEntry::decode(&bytes).unwrap().log_type, log_type);
        }
    }

    #[test]
    fn zero_length_data_is_header_only() {
        let bytes = LogEntry::new(1, 1, vec![]).encode();
        assert_eq!(bytes.len(), 25);
        assert!(LogEntry::decode(&bytes).unwrap().data.is_empty());
    }

    #[test]
    fn binary_data_is_preserved() {
        let data = vec![0x00, 0xFF, 0x7F, 0x80, 0xFE];
        let decoded = LogEntry::decode(&LogEntry::new(1, 1, data.clone()).encode()).unwrap();
        assert_eq!(decoded.data, data);
    }

    #[test]
    fn trailing_bytes_past_declared_length_are_ignored() {
        let mut bytes = LogEntry::new(1, 1, b"ab".to_vec()).encode();
        bytes.extend_from_slice(b"junk");
        assert_eq!(LogEntry::decode(&bytes).unwrap().data, b"ab".to_vec());
    }
}

// =============================================================================
// SECTION 2: CORRUPT INPUT
// =============================================================================

mod corrupt_input {
    use super::*;

    #[test]
    fn every_short_buffer_is_truncated() {
        for len in 0..25 {
            let buf = vec![0u8; len];
            assert_eq!(LogEntry::decode(&buf), Err(CodecError::Truncated { len }));
        }
    }

    #[test]
    fn huge_declared_length_does_not_allocate_or_panic() {
        let mut bytes = LogEntry::new(1, 1, vec![]).encode();
        bytes[17..25].copy_from_slice(&u64::MAX.to_be_bytes());

        assert_eq!(
            LogEntry::decode(&bytes),
            Err(CodecError::LengthOverflow {
                declared: u64::MAX,
                available: 0
            })
        );
    }
}

// =============================================================================
// SECTION 3: COMMAND PAYLOADS
// =============================================================================

mod commands {
    use super::*;

    #[test]
    fn delete_round_trips() {
        let cmd = Command::delete("gone");
        assert_eq!(Command::decode(&cmd.encode().unwrap()).unwrap(), cmd);
    }

    #[test]
    fn unicode_keys_and_values() {
        let cmd = Command::set("键", "值 🎉");
        assert_eq!(Command::decode(&cmd.encode().unwrap()).unwrap(), cmd);
    }

    #[test]
    fn key_accessor_covers_both_ops() {
        assert_eq!(Command::set("a", "1").key(), "a");
        assert_eq!(Command::delete("b").key(), "b");
    }

    #[test]
    fn future_version_is_rejected() {
        let mut bytes = Command::set("a", "1").encode().unwrap();
        bytes[0] = 2;
        assert_eq!(Command::decode(&bytes), Err(CodecError::UnknownVersion(2)));
    }

    #[test]
    fn set_without_value_is_malformed() {
        let mut bytes = vec![1u8];
        bytes.extend_from_slice(br#"{"op":"set","key":"k"}"#);
        assert!(matches!(Command::decode(&bytes), Err(CodecError::Malformed(_))));
    }
}

// =============================================================================
// SECTION 4: CLUSTER IDENTITY
// =============================================================================

mod identity {
    use super::*;

    #[test]
    fn raft_id_depends_only_on_node_id() {
        let ids: Vec<u64> = ["node0", "node1", "node2"]
            .iter()
            .map(|id| ClusterMember::new(*id, "addr").raft_id())
            .collect();

        assert_eq!(ids[0], ClusterMember::new("node0", "elsewhere").raft_id());
        assert_ne!(ids[0], ids[1]);
        assert_ne!(ids[1], ids[2]);
    }

    #[test]
    fn node_state_display() {
        assert_eq!(NodeState::Leader.to_string(), "Leader");
        assert_eq!(NodeState::Shutdown.to_string(), "Shutdown");
    }
}
