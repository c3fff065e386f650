//! Error types for BlockIO
//!
//! This module defines the common error type used across the client and
//! store data paths.

use crate::types::{MessageStatus, VolumeState};
use thiserror::Error;

/// Common result type for BlockIO operations
pub type Result<T> = std::result::Result<T, Error>;

const EINVAL: i32 = 22;
const EAGAIN: i32 = 11;
const EIO: i32 = 5;
const ETIMEDOUT: i32 = 110;
const ESHUTDOWN: i32 = 108;

/// Common error type for BlockIO
#[derive(Debug, Error)]
pub enum Error {
    // Device errors
    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("media error: {0}")]
    MediaError(String),

    // Submission errors
    #[error("unaligned request: offset {offset}, length {length}")]
    Misaligned { offset: u64, length: u64 },

    #[error("request too large: {length} bytes, max {max} bytes")]
    IoTooLarge { length: usize, max: usize },

    #[error("request [{offset}, +{length}) beyond volume size {size}")]
    OutOfRange { offset: u64, length: u64, size: u64 },

    #[error("no free I/O control block, try again")]
    TryAgain,

    #[error("volume is {0}")]
    VolumeState(VolumeState),

    // Queue errors
    #[error("event queue {0} is full")]
    QueueFull(String),

    #[error("event queue {0} is closed")]
    QueueClosed(String),

    // Network errors
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("no reachable store for shard {shard}")]
    NoConnection { shard: usize },

    #[error("request timeout")]
    Timeout,

    #[error("store replied {0}")]
    Remote(MessageStatus),

    // Metadata errors
    #[error("metadata error: {0}")]
    Metadata(String),

    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a metadata error
    pub fn metadata(msg: impl Into<String>) -> Self {
        Self::Metadata(msg.into())
    }

    /// Create a connection failure
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TryAgain
                | Self::QueueFull(_)
                | Self::Timeout
                | Self::ConnectionFailed(_)
                | Self::ConnectionClosed(_)
                | Self::Remote(MessageStatus::NoResource)
        )
    }

    /// Negative errno value returned by the submission API
    #[must_use]
    pub const fn errno(&self) -> i32 {
        let code = match self {
            Self::Misaligned { .. }
            | Self::IoTooLarge { .. }
            | Self::OutOfRange { .. }
            | Self::Configuration(_)
            | Self::Remote(MessageStatus::InvalidOp | MessageStatus::InvalidField) => EINVAL,

            Self::TryAgain | Self::QueueFull(_) | Self::Remote(MessageStatus::NoResource) => {
                EAGAIN
            }

            Self::Timeout => ETIMEDOUT,

            Self::VolumeState(_) | Self::QueueClosed(_) => ESHUTDOWN,

            Self::Io(_)
            | Self::MediaError(_)
            | Self::ConnectionFailed(_)
            | Self::ConnectionClosed(_)
            | Self::NoConnection { .. }
            | Self::Remote(_)
            | Self::Metadata(_)
            | Self::VolumeNotFound(_)
            | Self::Internal(_) => EIO,
        };
        -code
    }
}

impl From<MessageStatus> for Error {
    fn from(status: MessageStatus) -> Self {
        match status {
            MessageStatus::MediaError => Self::MediaError("reported by store".into()),
            other => Self::Remote(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::TryAgain.is_retryable());
        assert!(Error::Timeout.is_retryable());
        assert!(Error::QueueFull("vol".into()).is_retryable());
        assert!(!Error::Misaligned { offset: 1, length: 512 }.is_retryable());
        assert!(!Error::MediaError("bad sector".into()).is_retryable());
    }

    #[test]
    fn test_error_errno() {
        assert_eq!(Error::Misaligned { offset: 1, length: 512 }.errno(), -EINVAL);
        assert_eq!(
            Error::IoTooLarge { length: 1 << 20, max: 128 << 10 }.errno(),
            -EINVAL
        );
        assert_eq!(Error::TryAgain.errno(), -EAGAIN);
        assert_eq!(Error::VolumeState(VolumeState::Closed).errno(), -ESHUTDOWN);
        assert_eq!(Error::NoConnection { shard: 0 }.errno(), -EIO);
        assert_eq!(Error::from(MessageStatus::MediaError).errno(), -EIO);
    }

    #[test]
    fn test_status_conversion() {
        assert!(matches!(
            Error::from(MessageStatus::MediaError),
            Error::MediaError(_)
        ));
        assert!(matches!(
            Error::from(MessageStatus::NoReplica),
            Error::Remote(MessageStatus::NoReplica)
        ));
    }
}
