// src/queue.rs
//! Fixed-capacity blocking queue shared by the worker pool and the log writer.
//!
//! Producers never block: a push against a full queue hands the item back.
//! Consumers block in [`BoundedQueue::pop`] until an item arrives or the
//! queue is closed.

use crate::error::{EtudeError, EtudeResult};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

struct Ring<T> {
    slots: Box<[Option<T>]>,
    front: usize,
    len: usize,
    closed: bool,
}

impl<T> Ring<T> {
    #[inline(always)]
    fn index(&self, offset: usize) -> usize {
        (self.front + offset) % self.slots.len()
    }

    fn take_front(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let idx = self.front;
        let item = self.slots[idx].take();
        self.front = (self.front + 1) % self.slots.len();
        self.len -= 1;
        item
    }
}

pub struct BoundedQueue<T> {
    ring: Mutex<Ring<T>>,
    ready: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Allocate the circular buffer once. A zero capacity is rejected.
    pub fn new(capacity: usize) -> EtudeResult<Self> {
        if capacity == 0 {
            return Err(EtudeError::ZeroCapacity);
        }
        let slots = (0..capacity).map(|_| None).collect::<Vec<_>>();
        Ok(Self {
            ring: Mutex::new(Ring {
                slots: slots.into_boxed_slice(),
                front: 0,
                len: 0,
                closed: false,
            }),
            ready: Condvar::new(),
            capacity,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Ring<T>> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append at the tail. Returns the item back when the queue is full or
    /// closed; waiters are woken either way.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut ring = self.lock();
        if ring.closed || ring.len >= self.capacity {
            self.ready.notify_all();
            return Err(item);
        }
        let tail = ring.index(ring.len);
        ring.slots[tail] = Some(item);
        ring.len += 1;
        self.ready.notify_all();
        Ok(())
    }

    /// Block until an item is available. Returns `None` only after
    /// [`close`](Self::close) once the remaining items are drained.
    pub fn pop(&self) -> Option<T> {
        let mut ring = self.lock();
        while ring.len == 0 {
            if ring.closed {
                return None;
            }
            ring = self.ready.wait(ring).unwrap_or_else(PoisonError::into_inner);
        }
        ring.take_front()
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut ring = self.lock();
        while ring.len == 0 {
            if ring.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .ready
                .wait_timeout(ring, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            ring = guard;
        }
        ring.take_front()
    }

    /// Refuse further pushes and wake every blocked consumer.
    pub fn close(&self) {
        let mut ring = self.lock();
        ring.closed = true;
        self.ready.notify_all();
    }

    /// Drop queued items and rewind the cursors. The backing store keeps its size.
    pub fn clear(&self) {
        let mut ring = self.lock();
        for slot in ring.slots.iter_mut() {
            *slot = None;
        }
        ring.front = 0;
        ring.len = 0;
    }

    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.lock().len == 0
    }

    pub fn is_full(&self) -> bool {
        self.lock().len >= self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: Clone> BoundedQueue<T> {
    pub fn front(&self) -> Option<T> {
        let ring = self.lock();
        if ring.len == 0 {
            return None;
        }
        ring.slots[ring.front].clone()
    }

    pub fn back(&self) -> Option<T> {
        let ring = self.lock();
        if ring.len == 0 {
            return None;
        }
        ring.slots[ring.index(ring.len - 1)].clone()
    }
}
