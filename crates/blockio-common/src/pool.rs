//! Fixed-capacity object pool with counted handles
//!
//! Every slot is created up front and never freed; the pool only hands out
//! slot indices from a lock-free free list. A slot is reachable through
//! [`PoolRef`] handles that share one atomic reference count. Dropping the
//! last handle resets the slot via [`Recycle`] and pushes it back onto the
//! free list, so a slot can never be returned while a reference exists.
//!
//! ```text
//!            alloc()                 clone()/add_ref()
//!  free list ───────▶ PoolRef(refs=1) ──────────────▶ PoolRef(refs=n)
//!      ▲                                                  │
//!      │ recycle()             release() == Some(LastRef) │ drop / release
//!      └──────────── LastRef (refs=0) ◀───────────────────┘
//! ```

use crossbeam_queue::ArrayQueue;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Reset hook run when a slot goes back to the free list
pub trait Recycle {
    fn recycle(&mut self);
}

struct Slot<T> {
    refs: AtomicU32,
    value: Mutex<T>,
}

struct Inner<T> {
    name: String,
    slots: Box<[Slot<T>]>,
    free: ArrayQueue<usize>,
}

impl<T: Recycle> Inner<T> {
    fn give_back(&self, index: usize) {
        self.slots[index].value.lock().recycle();
        let pushed = self.free.push(index);
        debug_assert!(pushed.is_ok(), "pool {} free list overflow", self.name);
    }
}

/// Fixed-capacity pool of reusable objects
pub struct ObjectPool<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Recycle> ObjectPool<T> {
    /// Create a pool with `capacity` slots built by `init(slot_index)`
    pub fn new(name: impl Into<String>, capacity: usize, mut init: impl FnMut(usize) -> T) -> Self {
        let slots: Box<[Slot<T>]> = (0..capacity)
            .map(|i| Slot {
                refs: AtomicU32::new(0),
                value: Mutex::new(init(i)),
            })
            .collect();
        let free = ArrayQueue::new(capacity.max(1));
        for i in 0..capacity {
            let _ = free.push(i);
        }
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                slots,
                free,
            }),
        }
    }

    /// Take a free slot; `None` when the pool is exhausted. Never blocks.
    #[must_use]
    pub fn alloc(&self) -> Option<PoolRef<T>> {
        let index = self.inner.free.pop()?;
        let prev = self.inner.slots[index].refs.swap(1, Ordering::AcqRel);
        debug_assert_eq!(prev, 0, "pool {} slot {index} allocated while referenced", self.inner.name);
        Some(PoolRef {
            inner: Arc::clone(&self.inner),
            index,
            armed: true,
        })
    }

    /// Run `f` on a slot regardless of its allocation state
    ///
    /// Used for one-time setup of slots after construction.
    pub fn with_slot<R>(&self, index: usize, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.inner.slots.get(index).map(|s| f(&mut s.value.lock()))
    }
}

impl<T> ObjectPool<T> {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.slots.len()
    }

    /// Number of slots currently on the free list
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.inner.free.len()
    }

    /// Current reference count of a slot
    #[must_use]
    pub fn ref_count_of(&self, index: usize) -> Option<u32> {
        self.inner
            .slots
            .get(index)
            .map(|s| s.refs.load(Ordering::Acquire))
    }
}

impl<T> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.slots.len())
            .field("remaining", &self.inner.free.len())
            .finish()
    }
}

/// Counted handle to an allocated pool slot
pub struct PoolRef<T: Recycle> {
    inner: Arc<Inner<T>>,
    index: usize,
    armed: bool,
}

impl<T: Recycle> PoolRef<T> {
    /// Slot index, stable for the lifetime of the pool
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Lock the slot contents
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.slots[self.index].value.lock()
    }

    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.inner.slots[self.index].refs.load(Ordering::Acquire)
    }

    /// Take an additional reference
    #[must_use]
    pub fn add_ref(&self) -> Self {
        self.clone()
    }

    /// Drop this reference explicitly
    ///
    /// Returns the slot when this was the last reference. The slot goes back
    /// to the pool when the returned [`LastRef`] is dropped, which lets the
    /// caller finish with the contents first.
    #[must_use]
    pub fn release(mut self) -> Option<LastRef<T>> {
        self.armed = false;
        let prev = self.inner.slots[self.index].refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
        (prev == 1).then(|| LastRef {
            inner: Arc::clone(&self.inner),
            index: self.index,
        })
    }
}

impl<T: Recycle> Clone for PoolRef<T> {
    fn clone(&self) -> Self {
        self.inner.slots[self.index].refs.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: Arc::clone(&self.inner),
            index: self.index,
            armed: true,
        }
    }
}

impl<T: Recycle> Drop for PoolRef<T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let prev = self.inner.slots[self.index].refs.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            self.inner.give_back(self.index);
        }
    }
}

impl<T: Recycle> fmt::Debug for PoolRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolRef")
            .field("pool", &self.inner.name)
            .field("index", &self.index)
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// A slot whose reference count reached zero; returns to the pool on drop
pub struct LastRef<T: Recycle> {
    inner: Arc<Inner<T>>,
    index: usize,
}

impl<T: Recycle> LastRef<T> {
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.slots[self.index].value.lock()
    }
}

impl<T: Recycle> Drop for LastRef<T> {
    fn drop(&mut self) {
        self.inner.give_back(self.index);
    }
}
