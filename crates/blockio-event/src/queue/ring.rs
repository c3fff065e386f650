use super::{EventQueue, QueueError, Rejected, check_consumer};
use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering, fence};
use std::sync::{Arc, OnceLock};
use std::thread::ThreadId;

/// Lock-free MPSC ring backed by a message-object cache
///
/// The ring carries indices of message cells. Cells come from two arenas:
/// cells `0..cache` form the owner's arena, which only the consumer thread
/// allocates from (it also frees every cell, so this arena never needs a
/// lock); cells `cache..2*cache` form the shared arena behind a mutex, used
/// by foreign producers and by the owner once its own arena runs dry. A
/// cell's index decides which arena it goes back to.
pub struct RingQueue<T> {
    name: Arc<str>,
    ring: ArrayQueue<usize>,
    cells: Box<[Mutex<Option<T>>]>,
    cache_size: usize,
    local_free: ArrayQueue<usize>,
    shared_free: Mutex<Vec<usize>>,
    owner: OnceLock<ThreadId>,
    closed: AtomicBool,
    sleeping: AtomicBool,
    wake_lock: Mutex<()>,
    wake: Condvar,
}

impl<T> RingQueue<T> {
    pub fn new(name: impl Into<Arc<str>>, depth: usize, cache_size: usize) -> Self {
        let cache_size = cache_size.max(1);
        let cells = (0..cache_size * 2).map(|_| Mutex::new(None)).collect();
        let local_free = ArrayQueue::new(cache_size);
        for i in 0..cache_size {
            let _ = local_free.push(i);
        }
        Self {
            name: name.into(),
            ring: ArrayQueue::new(depth.max(1)),
            cells,
            cache_size,
            local_free,
            shared_free: Mutex::new((cache_size..cache_size * 2).collect()),
            owner: OnceLock::new(),
            closed: AtomicBool::new(false),
            sleeping: AtomicBool::new(false),
            wake_lock: Mutex::new(()),
            wake: Condvar::new(),
        }
    }

    fn is_owner(&self) -> bool {
        self.owner.get() == Some(&std::thread::current().id())
    }

    fn alloc_cell(&self) -> Option<usize> {
        if self.is_owner() {
            if let Some(i) = self.local_free.pop() {
                return Some(i);
            }
        }
        self.shared_free.lock().pop()
    }

    fn free_cell(&self, index: usize) {
        if index < self.cache_size {
            let _ = self.local_free.push(index);
        } else {
            self.shared_free.lock().push(index);
        }
    }

    fn wake_consumer(&self) {
        fence(Ordering::SeqCst);
        if self.sleeping.load(Ordering::SeqCst) {
            let _guard = self.wake_lock.lock();
            self.wake.notify_one();
        }
    }

    /// Cells free in the owner's and the shared arena
    #[must_use]
    pub fn free_cells(&self) -> (usize, usize) {
        (self.local_free.len(), self.shared_free.lock().len())
    }
}

impl<T: Send> EventQueue<T> for RingQueue<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn post(&self, item: T) -> Result<(), Rejected<T>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Rejected::new(&self.name, QueueError::Closed, item));
        }
        let Some(cell) = self.alloc_cell() else {
            return Err(Rejected::new(&self.name, QueueError::CacheExhausted, item));
        };
        *self.cells[cell].lock() = Some(item);
        if self.ring.push(cell).is_err() {
            let item = self.cells[cell].lock().take();
            self.free_cell(cell);
            return match item {
                Some(item) => Err(Rejected::new(&self.name, QueueError::Full, item)),
                None => Ok(()),
            };
        }
        self.wake_consumer();
        Ok(())
    }

    fn take_batch(&self, batch: &mut Vec<T>, max: usize) -> Result<(), QueueError> {
        check_consumer(&self.owner)?;
        debug_assert!(batch.is_empty());
        loop {
            while batch.len() < max {
                let Some(cell) = self.ring.pop() else { break };
                let item = self.cells[cell].lock().take();
                self.free_cell(cell);
                if let Some(item) = item {
                    batch.push(item);
                }
            }
            if !batch.is_empty() {
                return Ok(());
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(QueueError::Closed);
            }

            let mut guard = self.wake_lock.lock();
            self.sleeping.store(true, Ordering::SeqCst);
            fence(Ordering::SeqCst);
            if self.ring.is_empty() && !self.closed.load(Ordering::SeqCst) {
                self.wake.wait(&mut guard);
            }
            self.sleeping.store(false, Ordering::SeqCst);
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _guard = self.wake_lock.lock();
        self.wake.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn len(&self) -> usize {
        self.ring.len()
    }

    fn consumer(&self) -> Option<ThreadId> {
        self.owner.get().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_owner_uses_local_arena_first() {
        let q = RingQueue::new("arena", 64, 2);
        let mut batch = Vec::new();
        q.post(0u32).unwrap();
        q.take_batch(&mut batch, 8).unwrap();
        batch.clear();
        assert_eq!(q.free_cells(), (2, 2));

        // owner posts: local arena, then overflow into the shared one
        q.post(1).unwrap();
        q.post(2).unwrap();
        assert_eq!(q.free_cells(), (0, 2));
        q.post(3).unwrap();
        assert_eq!(q.free_cells(), (0, 1));

        q.take_batch(&mut batch, 8).unwrap();
        assert_eq!(batch, vec![1, 2, 3]);
        assert_eq!(q.free_cells(), (2, 2));
    }

    #[test]
    fn test_foreign_producer_exhausts_shared_cache() {
        let q = Arc::new(RingQueue::new("shared", 64, 2));
        let mut batch = Vec::new();
        q.post(0u32).unwrap();
        q.take_batch(&mut batch, 8).unwrap();

        let q2 = Arc::clone(&q);
        let reasons = thread::spawn(move || {
            (0..3)
                .map(|i| q2.post(i).err().map(|r| r.reason))
                .collect::<Vec<_>>()
        })
        .join()
        .unwrap();
        assert_eq!(reasons, vec![None, None, Some(QueueError::CacheExhausted)]);
        // foreign posts never touch the owner's arena
        assert_eq!(q.free_cells(), (2, 0));
    }

    #[test]
    fn test_full_ring_returns_cell() {
        let q = RingQueue::new("full", 1, 4);
        q.post(1u32).unwrap();
        let r = q.post(2).unwrap_err();
        assert_eq!(r.reason, QueueError::Full);
        assert_eq!(r.into_inner(), 2);
        assert_eq!(q.free_cells(), (4, 3));
    }
}
