//! Pooled buffer descriptors
//!
//! A descriptor is one fixed-size buffer (command, data or reply) taken from
//! a typed pool. It is owned by one iocb for one network operation. The
//! connection it was last used on is held weakly, since a connection keeps
//! its posted descriptors alive.

use crate::connection::Connection;
use blockio_common::{Error, MessageHead, MessageReply, ObjectPool, PoolRef, Recycle, Result};
use bytes::BytesMut;
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Command,
    Data,
    Reply,
}

/// Network operation a descriptor is posted for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkRequest {
    #[default]
    Idle,
    Send,
    Recv,
}

pub struct BufferDescriptor {
    pub kind: BufferKind,
    /// Fixed payload capacity
    pub capacity: usize,
    pub wr_op: WorkRequest,
    /// Valid payload bytes in `data`
    pub data_len: usize,
    pub head: MessageHead,
    pub reply: MessageReply,
    pub data: BytesMut,
    conn: Option<Weak<Connection>>,
    /// Slot index of the iocb that issued the operation
    pub owner: Option<usize>,
}

impl BufferDescriptor {
    #[must_use]
    pub fn new(kind: BufferKind, capacity: usize) -> Self {
        Self {
            kind,
            capacity,
            wr_op: WorkRequest::Idle,
            data_len: 0,
            head: MessageHead::default(),
            reply: MessageReply::default(),
            data: BytesMut::with_capacity(capacity),
            conn: None,
            owner: None,
        }
    }

    /// Replace the payload; fails without touching the buffer when it does not fit
    pub fn set_payload(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.capacity {
            return Err(Error::IoTooLarge {
                length: payload.len(),
                max: self.capacity,
            });
        }
        self.data.clear();
        self.data.extend_from_slice(payload);
        self.data_len = payload.len();
        Ok(())
    }

    /// Connection the descriptor was last used on, if it is still alive
    #[must_use]
    pub fn conn(&self) -> Option<Arc<Connection>> {
        self.conn.as_ref().and_then(Weak::upgrade)
    }

    pub fn set_conn(&mut self, conn: &Arc<Connection>) {
        self.conn = Some(Arc::downgrade(conn));
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.data_len]
    }
}

impl Recycle for BufferDescriptor {
    fn recycle(&mut self) {
        self.wr_op = WorkRequest::Idle;
        self.data_len = 0;
        self.data.clear();
        self.head = MessageHead::default();
        self.reply = MessageReply::default();
        self.conn = None;
        self.owner = None;
    }
}

pub type BufferPool = ObjectPool<BufferDescriptor>;
pub type BdRef = PoolRef<BufferDescriptor>;

/// Create a pool of `count` descriptors of one kind
#[must_use]
pub fn buffer_pool(name: &str, kind: BufferKind, count: usize, capacity: usize) -> BufferPool {
    ObjectPool::new(name, count, |_| BufferDescriptor::new(kind, capacity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockio_common::OpCode;

    #[test]
    fn test_oversized_payload_refused() {
        let mut bd = BufferDescriptor::new(BufferKind::Data, 4);
        bd.set_payload(b"ab").unwrap();
        assert!(matches!(
            bd.set_payload(b"abcdef"),
            Err(Error::IoTooLarge { length: 6, max: 4 })
        ));
        assert_eq!(bd.payload(), b"ab");
        bd.set_payload(b"wxyz").unwrap();
        assert_eq!(bd.payload(), b"wxyz");
    }

    #[test]
    fn test_recycle_clears_operation_state() {
        let pool = buffer_pool("reply", BufferKind::Reply, 1, 16);
        {
            let bd = pool.alloc().unwrap();
            let mut b = bd.lock();
            b.wr_op = WorkRequest::Recv;
            b.head = MessageHead::new(OpCode::Write, 3);
            b.set_payload(b"xyz").unwrap();
            b.owner = Some(3);
        }
        let bd = pool.alloc().unwrap();
        let b = bd.lock();
        assert_eq!(b.wr_op, WorkRequest::Idle);
        assert_eq!(b.data_len, 0);
        assert!(b.owner.is_none());
        assert_eq!(b.kind, BufferKind::Reply);
        assert!(b.data.capacity() >= 16);
    }
}
