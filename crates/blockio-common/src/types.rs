//! Protocol and volume types shared by client and store
//!
//! The message head travels with every command; the reply travels back on
//! the same connection and is matched to its iocb by `(command_id,
//! command_seq)`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sector size; every offset and length on the data path is a multiple of it
pub const SECTOR_SIZE: u64 = 512;

/// Largest single I/O accepted by the submission API
pub const MAX_IO_SIZE: usize = 128 * 1024;

/// Shards are 64 GiB: `shard_index = offset >> SHARD_SIZE_ORDER`
pub const SHARD_SIZE_ORDER: u32 = 36;

/// Mask selecting the in-shard part of a volume offset
pub const SHARD_OFFSET_MASK: u64 = (1 << SHARD_SIZE_ORDER) - 1;

/// Maximum number of per-replica subtasks a server iocb can carry
pub const MAX_SUBTASK_CNT: usize = 5;

/// Compute the shard index for a volume offset
#[must_use]
pub const fn shard_index(offset: u64) -> usize {
    (offset >> SHARD_SIZE_ORDER) as usize
}

/// Check sector alignment of an offset/length pair
#[must_use]
pub const fn is_sector_aligned(offset: u64, length: u64) -> bool {
    offset % SECTOR_SIZE == 0 && length % SECTOR_SIZE == 0
}

/// Command opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpCode {
    Read,
    Write,
    /// Write forwarded from a primary store to a peer replica
    ReplicateWrite,
    Heartbeat,
}

impl OpCode {
    /// True for opcodes that carry a data payload to the store
    #[must_use]
    pub const fn carries_payload(self) -> bool {
        matches!(self, Self::Write | Self::ReplicateWrite)
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::ReplicateWrite => "replicate_write",
            Self::Heartbeat => "heartbeat",
        };
        f.write_str(s)
    }
}

/// Status carried in a reply or a subtask completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    #[default]
    Success,
    InvalidOp,
    InvalidField,
    /// The store runs a newer metadata generation; the client must reopen
    Reopen,
    /// Low-level I/O failure or short transfer on the store
    MediaError,
    /// No replica of the shard was eligible for the operation
    NoReplica,
    /// The store had no free iocb for the command
    NoResource,
    /// The forwarding connection to a peer replica was lost
    ConnectionLost,
}

impl MessageStatus {
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::InvalidOp => "invalid_op",
            Self::InvalidField => "invalid_field",
            Self::Reopen => "reopen",
            Self::MediaError => "media_error",
            Self::NoReplica => "no_replica",
            Self::NoResource => "no_resource",
            Self::ConnectionLost => "connection_lost",
        };
        f.write_str(s)
    }
}

/// Replica health as reported by the metadata service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    #[default]
    Ok,
    Recovering,
    Error,
    Offline,
}

impl HealthStatus {
    /// Replicas in this state take part in write fan-out
    #[must_use]
    pub const fn accepts_writes(self) -> bool {
        matches!(self, Self::Ok | Self::Recovering)
    }
}

/// Client-side volume state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum VolumeState {
    #[default]
    Opened = 0,
    Disconnected = 1,
    ReopenFail = 2,
    Closed = 3,
}

impl VolumeState {
    #[must_use]
    pub const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Opened,
            1 => Self::Disconnected,
            2 => Self::ReopenFail,
            _ => Self::Closed,
        }
    }

    /// States from which a full reconnect may be attempted
    #[must_use]
    pub const fn can_reconnect(self) -> bool {
        matches!(self, Self::Opened | Self::ReopenFail | Self::Disconnected)
    }
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Opened => "OPENED",
            Self::Disconnected => "DISCONNECTED",
            Self::ReopenFail => "REOPEN_FAIL",
            Self::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// Command header sent ahead of every request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHead {
    pub opcode: OpCode,
    /// Client iocb slot index
    pub command_id: u16,
    /// Bumped on every resend of the same slot
    pub command_seq: u32,
    pub volume_id: u64,
    pub offset: u64,
    pub length: u32,
    pub snap_seq: u32,
    pub meta_ver: u16,
    /// Target replica for forwarded writes
    pub rep_index: u8,
}

impl MessageHead {
    #[must_use]
    pub const fn new(opcode: OpCode, command_id: u16) -> Self {
        Self {
            opcode,
            command_id,
            command_seq: 0,
            volume_id: 0,
            offset: 0,
            length: 0,
            snap_seq: 0,
            meta_ver: 0,
            rep_index: 0,
        }
    }

    /// Build the reply header for this command
    #[must_use]
    pub const fn reply(&self, status: MessageStatus, meta_ver: u16) -> MessageReply {
        MessageReply {
            command_id: self.command_id,
            command_seq: self.command_seq,
            status,
            meta_ver,
        }
    }
}

impl Default for MessageHead {
    fn default() -> Self {
        Self::new(OpCode::Read, 0)
    }
}

/// Reply header sent back for every command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessageReply {
    pub command_id: u16,
    pub command_seq: u32,
    pub status: MessageStatus,
    pub meta_ver: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_index() {
        assert_eq!(shard_index(0), 0);
        assert_eq!(shard_index((1 << SHARD_SIZE_ORDER) - 1), 0);
        assert_eq!(shard_index(1 << SHARD_SIZE_ORDER), 1);
        assert_eq!(((1u64 << SHARD_SIZE_ORDER) + 4096) & SHARD_OFFSET_MASK, 4096);
    }

    #[test]
    fn test_alignment() {
        assert!(is_sector_aligned(0, 4096));
        assert!(is_sector_aligned(512, 512));
        assert!(!is_sector_aligned(100, 512));
        assert!(!is_sector_aligned(0, 100));
    }

    #[test]
    fn test_volume_state_round_trip() {
        for state in [
            VolumeState::Opened,
            VolumeState::Disconnected,
            VolumeState::ReopenFail,
            VolumeState::Closed,
        ] {
            assert_eq!(VolumeState::from_u8(state as u8), state);
        }
        assert!(!VolumeState::Closed.can_reconnect());
    }

    #[test]
    fn test_reply_echoes_command() {
        let mut head = MessageHead::new(OpCode::Write, 7);
        head.command_seq = 42;
        let reply = head.reply(MessageStatus::MediaError, 3);
        assert_eq!(reply.command_id, 7);
        assert_eq!(reply.command_seq, 42);
        assert_eq!(reply.status, MessageStatus::MediaError);
        assert_eq!(reply.meta_ver, 3);
    }

    #[test]
    fn test_health_write_eligibility() {
        assert!(HealthStatus::Ok.accepts_writes());
        assert!(HealthStatus::Recovering.accepts_writes());
        assert!(!HealthStatus::Error.accepts_writes());
        assert!(!HealthStatus::Offline.accepts_writes());
    }
}
