use crate::iocb::ClientIocb;
use crate::processor::VolumeProcessor;
use blockio_common::PoolRef;
use blockio_event::{Event, EventKind, EventPoster};
use blockio_transport::{BdRef, CompletionHandler, Connection, WcStatus};
use std::sync::Arc;
use tracing::error;

/// Events handled by a volume's worker
pub enum ClientEvent {
    /// New or resent request
    IoRequest(PoolRef<ClientIocb>),
    IoComplete {
        bd: BdRef,
        status: WcStatus,
        conn: Arc<Connection>,
    },
    IoTimeout {
        command_id: u16,
    },
    SendHeartbeat,
    /// Reopen requested at `requested_at` (usec), for generation `meta_ver`
    Reopen {
        meta_ver: u16,
        requested_at: u64,
    },
    Reconnect,
    ConnClosed(Arc<Connection>),
}

impl Event for ClientEvent {
    fn kind(&self) -> EventKind {
        match self {
            Self::IoRequest(_) => EventKind::IoRequest,
            Self::IoComplete { .. } => EventKind::IoComplete,
            Self::IoTimeout { .. } => EventKind::IoTimeout,
            Self::SendHeartbeat => EventKind::Heartbeat,
            Self::Reopen { .. } => EventKind::Reopen,
            Self::Reconnect => EventKind::Reconnect,
            Self::ConnClosed(_) => EventKind::ConnClosed,
        }
    }
}

/// Routes transport completions of a volume's connections to its worker
pub(crate) struct VolumeCompletion {
    pub poster: EventPoster<VolumeProcessor>,
}

impl CompletionHandler for VolumeCompletion {
    fn on_work_complete(&self, bd: BdRef, status: WcStatus, conn: &Arc<Connection>) {
        let event = ClientEvent::IoComplete {
            bd,
            status,
            conn: Arc::clone(conn),
        };
        if let Err(r) = self.poster.post_completion(event) {
            error!("{}: completion on {} dropped: {}", self.poster.name(), conn, r.reason);
        }
    }

    fn on_close(&self, conn: &Arc<Connection>) {
        let event = ClientEvent::ConnClosed(Arc::clone(conn));
        if let Err(r) = self.poster.post_completion(event) {
            error!("{}: close of {} not delivered: {}", self.poster.name(), conn, r.reason);
        }
    }
}
