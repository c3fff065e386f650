//! Single-consumer event queues
//!
//! Two implementations share the [`EventQueue`] interface:
//!
//! - [`DoubleBufferQueue`]: producers append to a lock-guarded vector; the
//!   consumer swaps it with its (empty) batch vector in one step.
//! - [`RingQueue`]: a lock-free bounded ring of message cells drawn from a
//!   pre-allocated cache, with an owner-local arena and a locked shared one.
//!
//! A failed post hands the item back inside [`Rejected`]; nothing is
//! dropped silently.

mod double_buffer;
mod ring;

pub use double_buffer::DoubleBufferQueue;
pub use ring::RingQueue;

use blockio_common::config::{QueueConfig, QueueKind};
use std::fmt;
use std::sync::Arc;
use std::thread::ThreadId;
use thiserror::Error;

/// Why a post was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue full")]
    Full,

    #[error("message cache exhausted")]
    CacheExhausted,

    #[error("queue closed")]
    Closed,

    #[error("batch taken by a thread other than the queue owner")]
    NotOwner,
}

/// A refused item together with the reason
pub struct Rejected<T> {
    pub queue: Arc<str>,
    pub reason: QueueError,
    pub item: T,
}

impl<T> Rejected<T> {
    pub(crate) fn new(queue: &Arc<str>, reason: QueueError, item: T) -> Self {
        Self {
            queue: Arc::clone(queue),
            reason,
            item,
        }
    }

    pub fn into_inner(self) -> T {
        self.item
    }

    /// Split into the error to report and the item to clean up
    pub fn into_parts(self) -> (blockio_common::Error, T) {
        let error = match self.reason {
            QueueError::Closed => blockio_common::Error::QueueClosed(self.queue.to_string()),
            QueueError::NotOwner => blockio_common::Error::internal(format!(
                "post to {} rejected: {}",
                self.queue, self.reason
            )),
            QueueError::Full | QueueError::CacheExhausted => {
                blockio_common::Error::QueueFull(self.queue.to_string())
            }
        };
        (error, self.item)
    }

    /// Transform the carried item, keeping queue and reason
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Rejected<U> {
        Rejected {
            queue: self.queue,
            reason: self.reason,
            item: f(self.item),
        }
    }
}

impl<T> fmt::Debug for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("queue", &self.queue)
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "post to {} rejected: {}", self.queue, self.reason)
    }
}

impl<T> std::error::Error for Rejected<T> {}

impl<T> From<Rejected<T>> for blockio_common::Error {
    fn from(r: Rejected<T>) -> Self {
        r.into_parts().0
    }
}

/// Multi-producer, single-consumer event queue
pub trait EventQueue<T>: Send + Sync {
    /// Diagnostic name
    fn name(&self) -> &str;

    /// Enqueue from any thread
    fn post(&self, item: T) -> Result<(), Rejected<T>>;

    /// Move up to `max` items into the empty `batch`, blocking until at
    /// least one is available. Fails with [`QueueError::Closed`] once the
    /// queue is closed and drained.
    ///
    /// The first thread to take a batch becomes the queue's only consumer.
    fn take_batch(&self, batch: &mut Vec<T>, max: usize) -> Result<(), QueueError>;

    /// Refuse further posts and wake the consumer
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Number of queued items
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Thread bound as consumer, if any
    fn consumer(&self) -> Option<ThreadId>;
}

/// Build the queue implementation selected by configuration
pub fn new_queue<T: Send + 'static>(
    name: impl Into<Arc<str>>,
    config: &QueueConfig,
) -> Arc<dyn EventQueue<T>> {
    match config.kind {
        QueueKind::DoubleBuffer => Arc::new(DoubleBufferQueue::new(name, config.depth)),
        QueueKind::Ring => Arc::new(RingQueue::new(name, config.depth, config.msg_cache_size)),
    }
}

/// Bind the calling thread as consumer, or check that it already is
pub(crate) fn check_consumer(owner: &std::sync::OnceLock<ThreadId>) -> Result<(), QueueError> {
    let me = std::thread::current().id();
    if *owner.get_or_init(|| me) == me {
        Ok(())
    } else {
        Err(QueueError::NotOwner)
    }
}
