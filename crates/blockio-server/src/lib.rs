//! BlockIO Server - store-side dispatch and replicated write fan-out
//!
//! A [`StoreServer`] runs one or more [`Dispatcher`] workers. Commands
//! arrive on pre-posted receive buffers, are validated against the store's
//! view of the volume, and are split into one [`SubTask`] per eligible
//! replica. Local replicas run on the store's [`IoEngine`]; remote ones are
//! forwarded to the peer store. The reply is sent once, when the last
//! subtask has reported in.

pub mod dispatcher;
pub mod engine;
pub mod forward;
pub mod iocb;
pub mod replica;
pub mod server;

pub use dispatcher::{Dispatcher, DispatcherStats, ServerEvent};
pub use engine::{EngineCallback, EngineIo, FileEngine, IoEngine, MemoryEngine};
pub use forward::Forwarder;
pub use iocb::{ServerIocb, SubTask, SubTaskHandle};
pub use replica::{LocalReplica, RemoteReplica, Replica, ReplicaBackend, ServerVolume, Shard};
pub use server::{ServerEndpoint, StoreServer};
