//! Client I/O control blocks
//!
//! One iocb tracks one request from `submit` to its callback. Each slot
//! keeps its command and data descriptors for the lifetime of the volume;
//! the command head's `command_id` is the slot index and its
//! `command_seq` keeps counting across reuse, so a late reply for an
//! earlier use of the slot never matches.

use blockio_common::time::{is_expired, now_usec};
use blockio_common::{Error, MessageHead, OpCode, Recycle, Result};
use blockio_transport::{BdRef, BufferPool, Connection};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Completion callback; receives read data for reads
pub type IoCallback = Box<dyn FnOnce(Result<Option<Bytes>>) + Send>;

#[derive(Default)]
pub struct ClientIocb {
    pub cmd_bd: Option<BdRef>,
    pub data_bd: Option<BdRef>,
    pub reply_bd: Option<BdRef>,
    pub submit_time: u64,
    pub reply_time: u64,
    pub callback: Option<IoCallback>,
    pub conn: Option<Arc<Connection>>,
}

impl ClientIocb {
    /// Attach the slot's permanent command and data descriptors
    pub fn prewarm(
        &mut self,
        index: usize,
        cmd_pool: &BufferPool,
        data_pool: &BufferPool,
    ) -> Result<()> {
        let command_id = u16::try_from(index)
            .map_err(|_| Error::internal(format!("iocb index {index} exceeds command id range")))?;
        let cmd = cmd_pool
            .alloc()
            .ok_or_else(|| Error::internal("command descriptor pool exhausted"))?;
        let data = data_pool
            .alloc()
            .ok_or_else(|| Error::internal("data descriptor pool exhausted"))?;
        {
            let mut c = cmd.lock();
            c.head = MessageHead::new(OpCode::Read, command_id);
            c.owner = Some(index);
        }
        data.lock().owner = Some(index);
        self.cmd_bd = Some(cmd);
        self.data_bd = Some(data);
        Ok(())
    }

    /// Copy of the command head
    #[must_use]
    pub fn head(&self) -> MessageHead {
        self.cmd_bd
            .as_ref()
            .map(|bd| bd.lock().head)
            .unwrap_or_default()
    }

    pub fn update_head(&self, f: impl FnOnce(&mut MessageHead)) {
        if let Some(bd) = &self.cmd_bd {
            f(&mut bd.lock().head);
        }
    }

    /// Advance the sequence number; the request is logically new
    pub fn bump_seq(&self) -> u32 {
        let mut seq = 0;
        self.update_head(|h| {
            h.command_seq = h.command_seq.wrapping_add(1);
            seq = h.command_seq;
        });
        seq
    }

    /// Write payload to send with the command
    #[must_use]
    pub fn payload(&self) -> Option<Bytes> {
        self.data_bd
            .as_ref()
            .map(|bd| Bytes::copy_from_slice(bd.lock().payload()))
    }

    /// Fill the slot for a new request and give it a fresh sequence number
    ///
    /// Fails, leaving the slot as it was, when `data` does not fit the
    /// data buffer.
    pub fn prepare(
        &mut self,
        opcode: OpCode,
        offset: u64,
        length: u32,
        data: Option<&[u8]>,
        callback: IoCallback,
    ) -> Result<()> {
        if let Some(bd) = &self.data_bd {
            let mut b = bd.lock();
            match data {
                Some(data) => b.set_payload(data)?,
                None => b.data_len = 0,
            }
        }
        self.update_head(|h| {
            h.opcode = opcode;
            h.offset = offset;
            h.length = length;
            h.command_seq = h.command_seq.wrapping_add(1);
        });
        self.callback = Some(callback);
        self.submit_time = now_usec();
        self.reply_time = 0;
        Ok(())
    }
}

impl Recycle for ClientIocb {
    fn recycle(&mut self) {
        self.reply_bd = None;
        self.submit_time = 0;
        self.reply_time = 0;
        self.callback = None;
        self.conn = None;
    }
}

/// Send timestamp of one slot, shared with the timeout scanner
#[derive(Debug, Default)]
pub struct IoTimer {
    sent_time: AtomicU64,
    flagged: AtomicBool,
}

impl IoTimer {
    pub fn arm(&self, now: u64) {
        self.flagged.store(false, Ordering::Release);
        self.sent_time.store(now, Ordering::Release);
    }

    pub fn disarm(&self) {
        self.sent_time.store(0, Ordering::Release);
        self.flagged.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn sent_time(&self) -> u64 {
        self.sent_time.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_flagged(&self) -> bool {
        self.flagged.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_expired(&self, timeout: Duration) -> bool {
        is_expired(self.sent_time(), timeout)
    }

    /// Flag an expired, not yet flagged timer; true if this call flagged it
    pub fn try_flag_expired(&self, timeout: Duration) -> bool {
        self.is_expired(timeout) && !self.flagged.swap(true, Ordering::AcqRel)
    }

    pub fn clear_flag(&self) {
        self.flagged.store(false, Ordering::Release);
    }
}
