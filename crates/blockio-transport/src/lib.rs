//! BlockIO Transport - connections between clients and stores
//!
//! The transport layer moves [`WireMessage`]s between two [`Connection`]s.
//! Receives are pre-posted as pooled [`BufferDescriptor`]s; when a message
//! arrives it fills the oldest posted descriptor and the connection's
//! [`CompletionHandler`] is called on the transport's poller thread.
//! Handlers only post events to their owning worker.

pub mod buffer;
pub mod conn_pool;
pub mod connection;
pub mod loopback;

pub use buffer::{BdRef, BufferDescriptor, BufferKind, BufferPool, WorkRequest, buffer_pool};
pub use conn_pool::{ConnectionPool, HeartbeatSweep, ShardRoute};
pub use connection::{
    Acceptor, CompletionHandler, ConnState, Connection, Link, Transport, WcStatus, WireMessage,
};
pub use loopback::LoopbackNetwork;
