//! BlockIO Event - single-consumer event queues and their worker threads
//!
//! All mutation of an in-flight request happens on the worker that owns its
//! queue. Network pollers, storage completions and timers only post events.
//!
//! ```text
//!  producers (any thread)          owner thread
//!  ───────────────────────         ─────────────────────────────────────
//!  post(Event) ──┐
//!  post(Event) ──┼──▶ EventQueue ──▶ take_batch ──▶ EventHandler::handle_event
//!  sync_invoke ──┘                              └─▶ closure(&mut handler)
//! ```

pub mod event;
pub mod queue;
pub mod worker;

pub use event::{Event, EventKind, Message};
pub use queue::{
    DoubleBufferQueue, EventQueue, QueueError, Rejected, RingQueue, new_queue,
};
pub use worker::{EventHandler, EventPoster, EventWorker, WorkerStats};
