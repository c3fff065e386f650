//! Shareable connection state machine over a pluggable link

use crate::buffer::{BdRef, WorkRequest};
use blockio_common::{Error, MessageHead, MessageReply, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use tracing::{debug, error, info, warn};

/// Message as it travels between two connections
#[derive(Debug, Clone)]
pub enum WireMessage {
    Request {
        head: MessageHead,
        data: Option<Bytes>,
    },
    Reply {
        reply: MessageReply,
        data: Option<Bytes>,
    },
}

impl WireMessage {
    #[must_use]
    pub const fn request(head: MessageHead, data: Option<Bytes>) -> Self {
        Self::Request { head, data }
    }

    #[must_use]
    pub const fn reply(reply: MessageReply, data: Option<Bytes>) -> Self {
        Self::Reply { reply, data }
    }
}

/// Completion status of a posted descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    /// The connection closed while the descriptor was posted
    FlushError,
    /// The incoming payload did not fit the posted descriptor
    LengthError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Init = 0,
    Ok = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnState {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Init,
            1 => Self::Ok,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Raw byte pipe underneath a connection
pub trait Link: Send + Sync {
    fn send(&self, msg: WireMessage) -> Result<()>;
    fn close(&self);
}

/// Receives descriptor completions, on the transport's poller thread
pub trait CompletionHandler: Send + Sync {
    fn on_work_complete(&self, bd: BdRef, status: WcStatus, conn: &Arc<Connection>);

    fn on_close(&self, _conn: &Arc<Connection>) {}
}

/// Notified of connections accepted by a listener
pub trait Acceptor: Send + Sync {
    fn on_accept(&self, conn: &Arc<Connection>);
}

/// Establishes outbound connections
pub trait Transport: Send + Sync {
    fn connect(&self, peer: &str, handler: Arc<dyn CompletionHandler>) -> Result<Arc<Connection>>;
}

pub struct Connection {
    id: u64,
    peer: String,
    state: AtomicU8,
    inflight_heartbeats: AtomicU32,
    link: Box<dyn Link>,
    handler: Arc<dyn CompletionHandler>,
    recv_queue: Mutex<VecDeque<BdRef>>,
}

impl Connection {
    pub fn new(
        id: u64,
        peer: impl Into<String>,
        link: Box<dyn Link>,
        handler: Arc<dyn CompletionHandler>,
    ) -> Self {
        Self {
            id,
            peer: peer.into(),
            state: AtomicU8::new(ConnState::Init as u8),
            inflight_heartbeats: AtomicU32::new(0),
            link,
            handler,
            recv_queue: Mutex::new(VecDeque::new()),
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    #[must_use]
    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.state() == ConnState::Ok
    }

    /// Move from INIT to OK once the link is usable
    pub fn mark_ready(&self) {
        let _ = self.state.compare_exchange(
            ConnState::Init as u8,
            ConnState::Ok as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    #[must_use]
    pub fn inflight_heartbeats(&self) -> u32 {
        self.inflight_heartbeats.load(Ordering::Acquire)
    }

    pub fn heartbeat_sent(&self) {
        self.inflight_heartbeats.fetch_add(1, Ordering::AcqRel);
    }

    pub fn heartbeat_answered(&self) {
        let _ = self
            .inflight_heartbeats
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Number of receive descriptors currently posted
    #[must_use]
    pub fn posted_recvs(&self) -> usize {
        self.recv_queue.lock().len()
    }

    pub fn post_send(&self, msg: WireMessage) -> Result<()> {
        if !self.is_ok() {
            return Err(Error::ConnectionClosed(self.to_string()));
        }
        self.link.send(msg)
    }

    /// Post a descriptor to receive the next incoming message
    pub fn post_recv(&self, bd: BdRef) -> Result<()> {
        if matches!(self.state(), ConnState::Closing | ConnState::Closed) {
            return Err(Error::ConnectionClosed(self.to_string()));
        }
        bd.lock().wr_op = WorkRequest::Recv;
        self.recv_queue.lock().push_back(bd);
        Ok(())
    }

    /// Hand an incoming message to the oldest posted descriptor
    ///
    /// Called by the transport's poller thread.
    pub fn deliver(self: &Arc<Self>, msg: WireMessage) {
        if !self.is_ok() {
            debug!("{}: dropping message on closed connection", self);
            return;
        }
        let Some(bd) = self.recv_queue.lock().pop_front() else {
            warn!("{}: no receive posted, message dropped", self);
            return;
        };
        let fitted = {
            let mut b = bd.lock();
            let data = match msg {
                WireMessage::Request { head, data } => {
                    b.head = head;
                    data
                }
                WireMessage::Reply { reply, data } => {
                    b.reply = reply;
                    data
                }
            };
            b.set_conn(self);
            match data {
                Some(payload) => b.set_payload(&payload),
                None => {
                    b.data_len = 0;
                    Ok(())
                }
            }
        };
        let status = match fitted {
            Ok(()) => WcStatus::Success,
            Err(e) => {
                error!("{}: incoming message refused: {}", self, e);
                WcStatus::LengthError
            }
        };
        self.handler.on_work_complete(bd, status, self);
    }

    /// Close the link, flush posted receives and notify the handler
    ///
    /// Idempotent; only the first call has any effect.
    pub fn close(self: &Arc<Self>) {
        let prev = self.state.swap(ConnState::Closing as u8, Ordering::AcqRel);
        if matches!(ConnState::from_u8(prev), ConnState::Closing | ConnState::Closed) {
            self.state.store(prev, Ordering::Release);
            return;
        }
        info!("Closing {}", self);
        self.link.close();
        let flushed: Vec<BdRef> = self.recv_queue.lock().drain(..).collect();
        for bd in flushed {
            bd.lock().set_conn(self);
            self.handler.on_work_complete(bd, WcStatus::FlushError, self);
        }
        self.state.store(ConnState::Closed as u8, Ordering::Release);
        self.handler.on_close(self);
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}({})", self.id, self.peer)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
