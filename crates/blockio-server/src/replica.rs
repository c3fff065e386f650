//! Replica backends and the store-side volume layout

use crate::engine::{EngineIo, IoEngine};
use crate::forward::Forwarder;
use crate::iocb::SubTaskHandle;
use blockio_common::{HealthStatus, MessageHead, MessageStatus, SHARD_OFFSET_MASK};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Where one replica's subtasks are executed
///
/// `submit` must eventually complete `handle`, from any thread.
pub trait ReplicaBackend: Send + Sync {
    fn submit(&self, head: &MessageHead, data: Option<Bytes>, handle: SubTaskHandle);

    /// Whether the replica lives on this store's own engine
    fn is_local(&self) -> bool;

    fn describe(&self) -> String;
}

/// Replica stored on the local engine at a fixed shard base
pub struct LocalReplica {
    engine: Arc<dyn IoEngine>,
    shard_base: u64,
}

impl LocalReplica {
    pub fn new(engine: Arc<dyn IoEngine>, shard_base: u64) -> Self {
        Self { engine, shard_base }
    }

    /// Device offset of a volume offset
    #[must_use]
    pub const fn device_offset(&self, offset: u64) -> u64 {
        (offset & SHARD_OFFSET_MASK) + self.shard_base
    }
}

impl ReplicaBackend for LocalReplica {
    fn submit(&self, head: &MessageHead, data: Option<Bytes>, handle: SubTaskHandle) {
        let io = EngineIo {
            opcode: head.opcode,
            offset: self.device_offset(head.offset),
            length: head.length as usize,
            data,
        };
        let engine = self.engine.name().to_string();
        self.engine.submit(
            io,
            Box::new(move |res| match res {
                Ok(data) => handle.complete(MessageStatus::Success, data),
                Err(e) => {
                    warn!("{}: replica {} failed: {}", engine, handle.rep_index(), e);
                    handle.complete(MessageStatus::MediaError, None);
                }
            }),
        );
    }

    fn is_local(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        format!("local:{}@{}", self.engine.name(), self.shard_base)
    }
}

/// Replica on a peer store, reached by forwarding
pub struct RemoteReplica {
    addr: String,
    forwarder: Arc<Forwarder>,
}

impl RemoteReplica {
    pub fn new(addr: impl Into<String>, forwarder: Arc<Forwarder>) -> Self {
        Self {
            addr: addr.into(),
            forwarder,
        }
    }
}

impl ReplicaBackend for RemoteReplica {
    fn submit(&self, head: &MessageHead, data: Option<Bytes>, handle: SubTaskHandle) {
        self.forwarder.forward(&self.addr, head, data, handle);
    }

    fn is_local(&self) -> bool {
        false
    }

    fn describe(&self) -> String {
        format!("remote:{}", self.addr)
    }
}

#[derive(Clone)]
pub struct Replica {
    pub rep_index: u8,
    pub status: HealthStatus,
    pub backend: Arc<dyn ReplicaBackend>,
}

impl fmt::Debug for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replica")
            .field("rep_index", &self.rep_index)
            .field("status", &self.status)
            .field("backend", &self.backend.describe())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Shard {
    pub index: usize,
    pub replicas: Vec<Replica>,
}

/// A volume as served by this store
#[derive(Debug, Clone)]
pub struct ServerVolume {
    pub volume_id: u64,
    pub size: u64,
    /// Metadata generation the store currently serves
    pub meta_ver: u16,
    pub shards: Vec<Shard>,
}

impl ServerVolume {
    /// Replica health, for maintenance paths
    pub fn set_replica_status(&mut self, shard: usize, rep_index: u8, status: HealthStatus) -> bool {
        self.shards
            .get_mut(shard)
            .and_then(|s| s.replicas.iter_mut().find(|r| r.rep_index == rep_index))
            .map(|r| r.status = status)
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_offset_strips_shard_bits() {
        let engine: Arc<dyn IoEngine> = Arc::new(crate::engine::MemoryEngine::new("mem", 1 << 20));
        let replica = LocalReplica::new(engine, 4096);
        assert_eq!(replica.device_offset(512), 4608);
        assert_eq!(replica.device_offset((1 << 36) + 512), 4608);
        assert!(replica.is_local());
    }
}
