use super::{EventQueue, QueueError, Rejected, check_consumer};
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, OnceLock};
use std::thread::ThreadId;

struct State<T> {
    pending: Vec<T>,
    closed: bool,
}

/// Bounded double-buffer queue
///
/// Producers push into the pending vector under a short lock. The consumer
/// swaps the pending vector with its own empty batch vector, so a whole
/// backlog changes hands without copying and the two buffers alternate.
pub struct DoubleBufferQueue<T> {
    name: Arc<str>,
    depth: usize,
    state: Mutex<State<T>>,
    ready: Condvar,
    owner: OnceLock<ThreadId>,
}

impl<T> DoubleBufferQueue<T> {
    pub fn new(name: impl Into<Arc<str>>, depth: usize) -> Self {
        Self {
            name: name.into(),
            depth: depth.max(1),
            state: Mutex::new(State {
                pending: Vec::with_capacity(depth),
                closed: false,
            }),
            ready: Condvar::new(),
            owner: OnceLock::new(),
        }
    }
}

impl<T: Send> EventQueue<T> for DoubleBufferQueue<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn post(&self, item: T) -> Result<(), Rejected<T>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Rejected::new(&self.name, QueueError::Closed, item));
        }
        if state.pending.len() >= self.depth {
            return Err(Rejected::new(&self.name, QueueError::Full, item));
        }
        let was_empty = state.pending.is_empty();
        state.pending.push(item);
        drop(state);
        if was_empty {
            self.ready.notify_one();
        }
        Ok(())
    }

    fn take_batch(&self, batch: &mut Vec<T>, max: usize) -> Result<(), QueueError> {
        check_consumer(&self.owner)?;
        debug_assert!(batch.is_empty());
        let mut state = self.state.lock();
        while state.pending.is_empty() {
            if state.closed {
                return Err(QueueError::Closed);
            }
            self.ready.wait(&mut state);
        }
        if state.pending.len() <= max {
            std::mem::swap(&mut state.pending, batch);
        } else {
            batch.extend(state.pending.drain(..max));
        }
        Ok(())
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn consumer(&self) -> Option<ThreadId> {
        self.owner.get().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swap_hands_over_backlog() {
        let q = DoubleBufferQueue::new("swap", 16);
        for i in 0..5 {
            q.post(i).unwrap();
        }
        let mut batch = Vec::with_capacity(16);
        q.take_batch(&mut batch, 16).unwrap();
        assert_eq!(batch, vec![0, 1, 2, 3, 4]);
        // the batch's old allocation now backs the pending side
        assert!(q.state.lock().pending.capacity() >= 16);
        assert!(q.is_empty());
    }

    #[test]
    fn test_partial_take_keeps_rest() {
        let q = DoubleBufferQueue::new("partial", 16);
        for i in 0..5 {
            q.post(i).unwrap();
        }
        let mut batch = Vec::new();
        q.take_batch(&mut batch, 2).unwrap();
        assert_eq!(batch, vec![0, 1]);
        assert_eq!(q.len(), 3);
    }
}
