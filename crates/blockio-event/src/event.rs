//! Event envelope carried by worker queues

use std::fmt;

/// Event categories, used for diagnostics and per-kind accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    IoRequest,
    IoComplete,
    IoTimeout,
    ConnClosed,
    Heartbeat,
    Reopen,
    Reconnect,
    SyncInvoke,
    Wake,
    ThreadExit,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::IoRequest => "io_request",
            Self::IoComplete => "io_complete",
            Self::IoTimeout => "io_timeout",
            Self::ConnClosed => "conn_closed",
            Self::Heartbeat => "heartbeat",
            Self::Reopen => "reopen",
            Self::Reconnect => "reconnect",
            Self::SyncInvoke => "sync_invoke",
            Self::Wake => "wake",
            Self::ThreadExit => "thread_exit",
        };
        f.write_str(s)
    }
}

/// Implemented by each subsystem's event enum
pub trait Event: Send + 'static {
    fn kind(&self) -> EventKind;
}

/// Closure run on the worker thread with exclusive access to the handler
pub type SyncCall<H> = Box<dyn FnOnce(&mut H) + Send>;

/// What actually travels through a worker queue
pub enum Message<H, E> {
    Event(E),
    SyncInvoke(SyncCall<H>),
    /// Nudge the worker to look at its overflow lane
    Wake,
    ThreadExit,
}

impl<H, E: Event> Message<H, E> {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Event(e) => e.kind(),
            Self::SyncInvoke(_) => EventKind::SyncInvoke,
            Self::Wake => EventKind::Wake,
            Self::ThreadExit => EventKind::ThreadExit,
        }
    }

    /// Unwrap a subsystem event
    pub fn into_event(self) -> Option<E> {
        match self {
            Self::Event(e) => Some(e),
            _ => None,
        }
    }
}

impl<H, E: Event> fmt::Debug for Message<H, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Message({})", self.kind())
    }
}
