//! Forwarding of replicated writes to peer stores
//!
//! Each forwarded subtask is parked under `(connection id, tag)` until the
//! peer replies. Tags wrap, so a tag still parked on the same connection is
//! skipped rather than reused. A peer that cannot be reached, or a connection that closes
//! with subtasks still parked, completes them with `ConnectionLost`.

use crate::iocb::SubTaskHandle;
use blockio_common::config::TransportKind;
use blockio_common::{MessageHead, MessageStatus, OpCode};
use blockio_transport::{
    BdRef, BufferKind, BufferPool, CompletionHandler, Connection, ConnectionPool, Transport,
    WcStatus, WireMessage, buffer_pool,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use tracing::{debug, warn};

type Parked = Arc<Mutex<HashMap<(u64, u16), SubTaskHandle>>>;

struct ForwardCompletion {
    parked: Parked,
}

impl CompletionHandler for ForwardCompletion {
    fn on_work_complete(&self, bd: BdRef, status: WcStatus, conn: &Arc<Connection>) {
        if status != WcStatus::Success {
            return;
        }
        let reply = bd.lock().reply;
        drop(bd);
        let handle = self.parked.lock().remove(&(conn.id(), reply.command_id));
        match handle {
            Some(handle) => handle.complete_with(reply.status, reply.meta_ver, None),
            None => debug!("{}: reply for unknown tag {}", conn, reply.command_id),
        }
    }

    fn on_close(&self, conn: &Arc<Connection>) {
        let lost: Vec<SubTaskHandle> = {
            let mut parked = self.parked.lock();
            let keys: Vec<(u64, u16)> = parked
                .keys()
                .filter(|(id, _)| *id == conn.id())
                .copied()
                .collect();
            keys.iter().filter_map(|k| parked.remove(k)).collect()
        };
        if !lost.is_empty() {
            warn!("{} closed with {} forwarded subtasks outstanding", conn, lost.len());
        }
        for handle in lost {
            handle.complete(MessageStatus::ConnectionLost, None);
        }
    }
}

pub struct Forwarder {
    conns: ConnectionPool,
    reply_pool: BufferPool,
    parked: Parked,
    next_tag: AtomicU16,
}

impl Forwarder {
    pub fn new(name: &str, transport: Arc<dyn Transport>, depth: usize) -> Self {
        let parked: Parked = Arc::default();
        let handler = Arc::new(ForwardCompletion {
            parked: Arc::clone(&parked),
        });
        let kind = TransportKind::default();
        Self {
            conns: ConnectionPool::new(format!("{name}-fwd"), kind, handler)
                .with_transport(kind, transport),
            // replies to forwarded writes carry no payload
            reply_pool: buffer_pool(&format!("{name}-fwd-reply"), BufferKind::Reply, depth, 0),
            parked,
            next_tag: AtomicU16::new(0),
        }
    }

    /// Subtasks waiting for a peer reply
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.parked.lock().len()
    }

    /// Send a write for replica `handle.rep_index()` to the store at `addr`
    pub fn forward(
        &self,
        addr: &str,
        head: &MessageHead,
        data: Option<Bytes>,
        handle: SubTaskHandle,
    ) {
        let conn = match self.conns.get_conn(addr, TransportKind::default()) {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Cannot forward replica {} to {}: {}", handle.rep_index(), addr, e);
                handle.complete(MessageStatus::ConnectionLost, None);
                return;
            }
        };
        let Some(bd) = self.reply_pool.alloc() else {
            handle.complete(MessageStatus::NoResource, None);
            return;
        };
        if let Err(e) = conn.post_recv(bd) {
            debug!("{}: reply buffer not posted: {}", conn, e);
            handle.complete(MessageStatus::ConnectionLost, None);
            return;
        }

        let rep_index = handle.rep_index();
        let tag = match self.park(conn.id(), handle) {
            Ok(tag) => tag,
            Err(handle) => {
                warn!("{}: every forward tag is in use", conn);
                handle.complete(MessageStatus::NoResource, None);
                return;
            }
        };
        let mut fwd = *head;
        fwd.opcode = OpCode::ReplicateWrite;
        fwd.command_id = tag;
        fwd.command_seq = 0;
        fwd.rep_index = rep_index;

        if let Err(e) = conn.post_send(WireMessage::request(fwd, data)) {
            warn!("{}: forward of tag {} failed: {}", conn, tag, e);
            let handle = self.parked.lock().remove(&(conn.id(), tag));
            if let Some(handle) = handle {
                handle.complete(MessageStatus::ConnectionLost, None);
            }
        }
    }

    /// Park `handle` under the next tag not in use on `conn_id`
    fn park(&self, conn_id: u64, handle: SubTaskHandle) -> Result<u16, SubTaskHandle> {
        let mut parked = self.parked.lock();
        for _ in 0..=u16::MAX {
            let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
            if let Entry::Vacant(slot) = parked.entry((conn_id, tag)) {
                slot.insert(handle);
                return Ok(tag);
            }
        }
        Err(handle)
    }

    pub fn close_all(&self) {
        self.conns.close_all();
    }
}
