//! Server I/O control blocks and replica subtasks
//!
//! A write fans out into one [`SubTask`] per eligible replica. Every
//! dispatched subtask holds its own counted reference to the parent iocb
//! through a [`SubTaskHandle`]; the dispatcher's reference is released once
//! fan-out is done. Whoever releases the last reference on the dispatcher
//! thread gets the [`LastRef`](blockio_common::LastRef) and sends the one
//! reply.

use crate::dispatcher::{Dispatcher, ServerEvent};
use blockio_common::{MAX_SUBTASK_CNT, MessageHead, MessageStatus, OpCode, PoolRef, Recycle};
use blockio_event::EventPoster;
use blockio_transport::{BdRef, Connection};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{error, warn};

/// Replica-scoped part of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubTask {
    pub opcode: OpCode,
    pub rep_index: u8,
    pub task_mask: u32,
    pub status: Option<MessageStatus>,
}

impl SubTask {
    #[must_use]
    pub const fn new(opcode: OpCode, rep_index: u8) -> Self {
        Self {
            opcode,
            rep_index,
            task_mask: 1 << rep_index,
            status: None,
        }
    }
}

#[derive(Default)]
pub struct ServerIocb {
    pub cmd_bd: Option<BdRef>,
    pub conn: Option<Arc<Connection>>,
    pub volume_id: u64,
    /// Write payload
    pub data: Option<Bytes>,
    /// Read result
    pub read_data: Option<Bytes>,
    pub subtasks: [Option<SubTask>; MAX_SUBTASK_CNT],
    /// Bits of subtasks dispatched and not yet completed
    pub task_mask: u32,
    pub status: MessageStatus,
    pub complete_meta_ver: u16,
}

impl ServerIocb {
    #[must_use]
    pub fn head(&self) -> MessageHead {
        self.cmd_bd
            .as_ref()
            .map(|bd| bd.lock().head)
            .unwrap_or_default()
    }

    /// Register a subtask before it is dispatched
    pub fn add_subtask(&mut self, task: SubTask) -> bool {
        let Some(slot) = self.subtasks.get_mut(usize::from(task.rep_index)) else {
            return false;
        };
        if self.task_mask & task.task_mask != 0 {
            return false;
        }
        *slot = Some(task);
        self.task_mask |= task.task_mask;
        true
    }

    /// Fold one subtask result into the aggregate
    ///
    /// The first failure is kept; later results never overwrite it. The
    /// completion meta_ver is the highest seen. Returns false for a
    /// subtask that is not outstanding.
    pub fn fold(&mut self, rep_index: u8, status: MessageStatus, meta_ver: u16) -> bool {
        let Some(Some(task)) = self.subtasks.get_mut(usize::from(rep_index)) else {
            return false;
        };
        if self.task_mask & task.task_mask == 0 {
            return false;
        }
        self.task_mask &= !task.task_mask;
        task.status = Some(status);
        if self.status.is_success() && !status.is_success() {
            self.status = status;
        }
        self.complete_meta_ver = self.complete_meta_ver.max(meta_ver);
        true
    }

    /// Number of subtasks dispatched for the current request
    #[must_use]
    pub fn subtask_count(&self) -> usize {
        self.subtasks.iter().flatten().count()
    }
}

impl Recycle for ServerIocb {
    fn recycle(&mut self) {
        *self = Self::default();
    }
}

/// Completion token of one dispatched subtask
///
/// Completing (or dropping) it posts the result to the owning dispatcher
/// together with the iocb reference it holds.
pub struct SubTaskHandle {
    iocb: Option<PoolRef<ServerIocb>>,
    rep_index: u8,
    meta_ver: u16,
    poster: EventPoster<Dispatcher>,
}

impl SubTaskHandle {
    pub(crate) const fn new(
        iocb: PoolRef<ServerIocb>,
        rep_index: u8,
        meta_ver: u16,
        poster: EventPoster<Dispatcher>,
    ) -> Self {
        Self {
            iocb: Some(iocb),
            rep_index,
            meta_ver,
            poster,
        }
    }

    #[must_use]
    pub const fn rep_index(&self) -> u8 {
        self.rep_index
    }

    /// Complete with the store's own metadata generation
    pub fn complete(self, status: MessageStatus, data: Option<Bytes>) {
        let meta_ver = self.meta_ver;
        self.complete_with(status, meta_ver, data);
    }

    /// Complete with a generation reported by a peer store
    pub fn complete_with(mut self, status: MessageStatus, meta_ver: u16, data: Option<Bytes>) {
        self.post(status, meta_ver, data);
    }

    fn post(&mut self, status: MessageStatus, meta_ver: u16, data: Option<Bytes>) {
        let Some(iocb) = self.iocb.take() else {
            return;
        };
        let event = ServerEvent::SubtaskDone {
            iocb,
            rep_index: self.rep_index,
            status,
            meta_ver,
            data,
        };
        // only a stopped dispatcher refuses a completion
        if let Err(r) = self.poster.post_completion(event) {
            error!(
                "Subtask of replica {} lost, {} refused it: {}",
                self.rep_index,
                self.poster.name(),
                r.reason
            );
        }
    }
}

impl Drop for SubTaskHandle {
    fn drop(&mut self) {
        if self.iocb.is_some() {
            warn!("Subtask of replica {} dropped by its backend", self.rep_index);
            let meta_ver = self.meta_ver;
            self.post(MessageStatus::MediaError, meta_ver, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iocb_with(reps: &[u8]) -> ServerIocb {
        let mut io = ServerIocb::default();
        for rep in reps {
            assert!(io.add_subtask(SubTask::new(OpCode::Write, *rep)));
        }
        io
    }

    #[test]
    fn test_first_failure_wins_in_any_order() {
        let outcomes = [
            (0, MessageStatus::Success),
            (1, MessageStatus::MediaError),
            (2, MessageStatus::Success),
        ];
        let orders = [[0, 1, 2], [1, 0, 2], [2, 0, 1], [2, 1, 0], [0, 2, 1], [1, 2, 0]];
        for order in orders {
            let mut io = iocb_with(&[0, 1, 2]);
            for i in order {
                let (rep, status) = outcomes[i];
                assert!(io.fold(rep, status, 0));
            }
            assert_eq!(io.status, MessageStatus::MediaError, "order {order:?}");
            assert_eq!(io.task_mask, 0);
        }
    }

    #[test]
    fn test_later_failure_does_not_replace_first() {
        let mut io = iocb_with(&[0, 1]);
        io.fold(1, MessageStatus::ConnectionLost, 0);
        io.fold(0, MessageStatus::MediaError, 0);
        assert_eq!(io.status, MessageStatus::ConnectionLost);
    }

    #[test]
    fn test_bit_cleared_once_and_meta_ver_max() {
        let mut io = iocb_with(&[0, 2]);
        assert_eq!(io.task_mask, 0b101);
        assert!(io.fold(2, MessageStatus::Success, 4));
        assert!(!io.fold(2, MessageStatus::MediaError, 9));
        assert!(!io.fold(1, MessageStatus::Success, 9));
        assert!(io.fold(0, MessageStatus::Success, 3));
        assert_eq!(io.status, MessageStatus::Success);
        assert_eq!(io.complete_meta_ver, 4);
        assert_eq!(io.subtask_count(), 2);
    }

    #[test]
    fn test_duplicate_subtask_refused() {
        let mut io = iocb_with(&[1]);
        assert!(!io.add_subtask(SubTask::new(OpCode::Write, 1)));
        assert!(!io.add_subtask(SubTask::new(OpCode::Write, MAX_SUBTASK_CNT as u8)));
    }
}
