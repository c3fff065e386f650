//! Event-driven worker: one queue, one thread, one handler
//!
//! The worker thread owns its handler outright. Other threads reach it by
//! posting events through an [`EventPoster`], or by running a closure on it
//! with [`EventPoster::sync_invoke`] and blocking until it has run.
//!
//! Completions that must not be lost go through
//! [`EventPoster::post_completion`]: when the queue is full they wait in an
//! unbounded overflow lane that the worker empties after every batch.
//!
//! Once the worker leaves its loop the queue is closed. Whatever is still
//! queued is handed to [`EventHandler::on_discard`] on the worker thread,
//! and pending `sync_invoke` callers get [`Error::QueueClosed`].

use crate::event::{Event, Message};
use crate::queue::{EventQueue, QueueError, Rejected, new_queue};
use blockio_common::config::QueueConfig;
use blockio_common::{Error, Result};
use crossbeam_queue::SegQueue;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Per-subsystem event handler run on the worker thread
pub trait EventHandler: Send + 'static {
    type Event: Event;

    fn handle_event(&mut self, event: Self::Event);

    /// Called after each batch, before blocking for the next one
    fn on_batch_end(&mut self) {}

    /// Called for each event still queued when the worker stops
    fn on_discard(&mut self, event: Self::Event) {
        drop(event);
    }

    /// Called once on the worker thread before it exits
    fn on_exit(&mut self) {}
}

type WorkerQueue<H> = Arc<dyn EventQueue<Message<H, <H as EventHandler>::Event>>>;
type Overflow<H> = Arc<SegQueue<<H as EventHandler>::Event>>;

/// Counters maintained by the worker thread
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub batches: AtomicU64,
    pub events: AtomicU64,
    pub sync_calls: AtomicU64,
    /// Completions parked in the overflow lane
    pub deferred: AtomicU64,
    /// Events handed to `on_discard` at exit
    pub discarded: AtomicU64,
}

/// Cloneable handle for posting into a worker's queue
pub struct EventPoster<H: EventHandler> {
    queue: WorkerQueue<H>,
    overflow: Overflow<H>,
    stats: Arc<WorkerStats>,
}

impl<H: EventHandler> Clone for EventPoster<H> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            overflow: Arc::clone(&self.overflow),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<H: EventHandler> EventPoster<H> {
    #[must_use]
    pub fn name(&self) -> &str {
        self.queue.name()
    }

    /// Post an event; on failure the event is handed back
    pub fn post(&self, event: H::Event) -> std::result::Result<(), Rejected<H::Event>> {
        self.queue.post(Message::Event(event)).map_err(|r| {
            r.map(|m| match m.into_event() {
                Some(e) => e,
                None => unreachable!("posted an event, got another message kind back"),
            })
        })
    }

    /// Post a completion the handler must see
    ///
    /// A full queue parks the event in the overflow lane instead of
    /// refusing it. Only a closed queue hands the event back.
    pub fn post_completion(&self, event: H::Event) -> std::result::Result<(), Rejected<H::Event>> {
        let rejected = match self.post(event) {
            Ok(()) => return Ok(()),
            Err(r) if r.reason == QueueError::Closed => return Err(r),
            Err(r) => r,
        };
        self.overflow.push(rejected.into_inner());
        self.stats.deferred.fetch_add(1, Ordering::Relaxed);
        // a refused wake means the queue still holds messages, and the
        // worker empties the lane after taking them
        let _ = self.queue.post(Message::Wake);
        Ok(())
    }

    /// Events waiting in the queue and the overflow lane
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len() + self.overflow.len()
    }

    /// Whether the caller is running on the worker thread
    #[must_use]
    pub fn on_worker_thread(&self) -> bool {
        self.queue.consumer() == Some(std::thread::current().id())
    }

    /// Run `f` on the worker thread and wait for its result
    ///
    /// Fails if called from the worker itself, if the queue refuses the
    /// call, or if the worker exits before running it.
    pub fn sync_invoke<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut H) -> R + Send + 'static,
    {
        if self.on_worker_thread() {
            return Err(Error::internal(format!(
                "sync_invoke on {} from its own worker thread",
                self.queue.name()
            )));
        }
        let (tx, rx) = crossbeam_channel::bounded(1);
        let call = Box::new(move |handler: &mut H| {
            let _ = tx.send(f(handler));
        });
        self.queue.post(Message::SyncInvoke(call))?;
        rx.recv()
            .map_err(|_| Error::QueueClosed(self.queue.name().to_string()))
    }
}

/// A worker thread draining one event queue into one handler
pub struct EventWorker<H: EventHandler> {
    name: String,
    queue: WorkerQueue<H>,
    overflow: Overflow<H>,
    batch_size: usize,
    stats: Arc<WorkerStats>,
    thread: Option<JoinHandle<H>>,
}

impl<H: EventHandler> EventWorker<H> {
    /// Create the worker and its queue; the thread starts with [`Self::start`]
    pub fn new(name: impl Into<String>, config: &QueueConfig) -> Self {
        let name = name.into();
        Self {
            queue: new_queue(name.as_str(), config),
            overflow: Arc::new(SegQueue::new()),
            name,
            batch_size: config.batch_size.max(1),
            stats: Arc::new(WorkerStats::default()),
            thread: None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn poster(&self) -> EventPoster<H> {
        EventPoster {
            queue: Arc::clone(&self.queue),
            overflow: Arc::clone(&self.overflow),
            stats: Arc::clone(&self.stats),
        }
    }

    #[must_use]
    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Take every event queued on a worker that was never started
    ///
    /// For stepping a handler by hand. The calling thread becomes the
    /// queue's consumer, so the worker can no longer be started.
    /// Queued `sync_invoke` calls are failed.
    pub fn take_pending(&self) -> Vec<H::Event> {
        let mut events = Vec::new();
        if self.thread.is_some() {
            return events;
        }
        let mut batch = Vec::new();
        while !self.queue.is_empty() || !self.overflow.is_empty() {
            if !self.queue.is_empty() {
                if self.queue.take_batch(&mut batch, self.batch_size).is_err() {
                    break;
                }
                events.extend(batch.drain(..).filter_map(Message::into_event));
            }
            while let Some(event) = self.overflow.pop() {
                events.push(event);
            }
        }
        events
    }

    /// Spawn the worker thread with `handler`
    pub fn start(&mut self, handler: H) -> Result<()> {
        if self.thread.is_some() {
            return Err(Error::internal(format!("worker {} already started", self.name)));
        }
        if self.queue.is_closed() {
            return Err(Error::QueueClosed(self.name.clone()));
        }
        if self.queue.consumer().is_some() {
            return Err(Error::internal(format!(
                "queue of worker {} is consumed by another thread",
                self.name
            )));
        }
        let worker = RunLoop {
            queue: Arc::clone(&self.queue),
            overflow: Arc::clone(&self.overflow),
            stats: Arc::clone(&self.stats),
            batch_size: self.batch_size,
        };
        let handle = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || worker.run(handler))?;
        self.thread = Some(handle);
        info!("Started worker {}", self.name);
        Ok(())
    }

    /// Post thread-exit, join, and hand the handler back
    ///
    /// Events queued behind the exit marker are not processed; the handler
    /// sees them through `on_discard`. Later posts are refused.
    pub fn stop(&mut self) -> Option<H> {
        let handle = self.thread.take()?;
        if let Err(r) = self.queue.post(Message::ThreadExit) {
            warn!("Worker {} exit marker rejected ({}), closing queue", self.name, r.reason);
            self.queue.close();
        }
        let joined = handle.join();
        self.queue.close();
        match joined {
            Ok(handler) => {
                info!("Stopped worker {}", self.name);
                Some(handler)
            }
            Err(_) => {
                error!("Worker {} panicked", self.name);
                None
            }
        }
    }

    /// Close the queue, let the worker drain everything already queued,
    /// then join and hand the handler back
    pub fn shutdown(&mut self) -> Option<H> {
        let handle = self.thread.take();
        self.queue.close();
        let handler = handle?.join();
        match handler {
            Ok(handler) => {
                info!("Worker {} drained and stopped", self.name);
                Some(handler)
            }
            Err(_) => {
                error!("Worker {} panicked", self.name);
                None
            }
        }
    }
}

impl<H: EventHandler> Drop for EventWorker<H> {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.stop();
        }
        self.queue.close();
        // a worker that never started still holds what was posted to it
        let mut batch = Vec::new();
        while self.queue.take_batch(&mut batch, self.batch_size).is_ok() {
            batch.clear();
        }
    }
}

/// State moved onto the worker thread
struct RunLoop<H: EventHandler> {
    queue: WorkerQueue<H>,
    overflow: Overflow<H>,
    stats: Arc<WorkerStats>,
    batch_size: usize,
}

impl<H: EventHandler> RunLoop<H> {
    fn run(self, mut handler: H) -> H {
        let mut batch = Vec::with_capacity(self.batch_size);
        'dispatch: loop {
            if let Err(e) = self.queue.take_batch(&mut batch, self.batch_size) {
                // closed: completions still parked are handled, not dropped
                if self.handle_overflow(&mut handler) > 0 {
                    continue;
                }
                debug!("Worker {} leaving dispatch loop: {}", self.queue.name(), e);
                break;
            }
            self.stats.batches.fetch_add(1, Ordering::Relaxed);
            let mut msgs = batch.drain(..);
            while let Some(msg) = msgs.next() {
                match msg {
                    Message::Event(event) => {
                        self.stats.events.fetch_add(1, Ordering::Relaxed);
                        handler.handle_event(event);
                    }
                    Message::SyncInvoke(call) => {
                        self.stats.sync_calls.fetch_add(1, Ordering::Relaxed);
                        call(&mut handler);
                    }
                    Message::Wake => {}
                    Message::ThreadExit => {
                        debug!("Worker {} got thread-exit", self.queue.name());
                        for rest in msgs.by_ref() {
                            self.discard(&mut handler, rest);
                        }
                        break 'dispatch;
                    }
                }
            }
            drop(msgs);
            self.handle_overflow(&mut handler);
            handler.on_batch_end();
        }

        self.queue.close();
        while self.queue.take_batch(&mut batch, self.batch_size).is_ok() {
            for msg in batch.drain(..) {
                self.discard(&mut handler, msg);
            }
        }
        while let Some(event) = self.overflow.pop() {
            self.discard(&mut handler, Message::Event(event));
        }
        let discarded = self.stats.discarded.load(Ordering::Relaxed);
        if discarded > 0 {
            warn!("Worker {} discarded {} events on exit", self.queue.name(), discarded);
        }
        handler.on_exit();
        handler
    }

    fn handle_overflow(&self, handler: &mut H) -> usize {
        let mut handled = 0;
        while let Some(event) = self.overflow.pop() {
            self.stats.events.fetch_add(1, Ordering::Relaxed);
            handler.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Unrun sync calls drop their reply sender, failing the caller
    fn discard(&self, handler: &mut H, msg: Message<H, H::Event>) {
        if let Message::Event(event) = msg {
            self.stats.discarded.fetch_add(1, Ordering::Relaxed);
            handler.on_discard(event);
        }
    }
}
