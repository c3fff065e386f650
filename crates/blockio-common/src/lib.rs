//! BlockIO Common - Shared types and utilities
//!
//! This crate provides the error type, configuration, wire-level protocol
//! types and the fixed-capacity object pool used by both the client and the
//! store server data paths.

pub mod config;
pub mod error;
pub mod pool;
pub mod time;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use pool::{LastRef, ObjectPool, PoolRef, Recycle};
pub use types::*;
