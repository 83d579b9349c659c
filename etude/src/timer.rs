// src/timer.rs
//! Idle-connection expiry ledger.
//!
//! Records live in an arena and are chained into a doubly-linked list kept
//! in ascending expiry order, so the head is always the next record to fire.
//! Links are arena indices; a [`TimerId`] also carries a generation so a
//! handle to a removed record can never touch its successor in the slot.

use std::time::Instant;

const NIL: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    index: usize,
    generation: u32,
}

struct Node<T> {
    expire: Instant,
    data: Option<T>,
    prev: usize,
    next: usize,
    generation: u32,
}

pub struct TimerLedger<T> {
    nodes: Vec<Node<T>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    len: usize,
}

impl<T> Default for TimerLedger<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerLedger<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn live(&self, id: TimerId) -> bool {
        self.nodes
            .get(id.index)
            .is_some_and(|n| n.generation == id.generation && n.data.is_some())
    }

    /// Add a record, scanning from the head for the first later expiry.
    pub fn insert(&mut self, expire: Instant, data: T) -> TimerId {
        let index = match self.free.pop() {
            Some(index) => {
                let node = &mut self.nodes[index];
                node.expire = expire;
                node.data = Some(data);
                index
            }
            None => {
                self.nodes.push(Node {
                    expire,
                    data: Some(data),
                    prev: NIL,
                    next: NIL,
                    generation: 0,
                });
                self.nodes.len() - 1
            }
        };

        let mut cursor = self.head;
        while cursor != NIL && self.nodes[cursor].expire <= expire {
            cursor = self.nodes[cursor].next;
        }
        self.link_before(index, cursor);
        self.len += 1;

        TimerId {
            index,
            generation: self.nodes[index].generation,
        }
    }

    /// Move a record to its place for a new expiry. Later expiries scan
    /// forward from the old position, earlier ones scan backward, so the
    /// usual "push to the tail" case only walks the records it passes.
    pub fn adjust(&mut self, id: TimerId, expire: Instant) -> bool {
        if !self.live(id) {
            return false;
        }
        let old = self.nodes[id.index].expire;
        self.nodes[id.index].expire = expire;

        let prev = self.nodes[id.index].prev;
        let next = self.nodes[id.index].next;
        let in_order = (prev == NIL || self.nodes[prev].expire <= expire)
            && (next == NIL || expire <= self.nodes[next].expire);
        if in_order {
            return true;
        }

        self.unlink(id.index);
        if expire >= old {
            let mut cursor = next;
            while cursor != NIL && self.nodes[cursor].expire <= expire {
                cursor = self.nodes[cursor].next;
            }
            self.link_before(id.index, cursor);
        } else {
            let mut cursor = prev;
            while cursor != NIL && self.nodes[cursor].expire > expire {
                cursor = self.nodes[cursor].prev;
            }
            let before = if cursor == NIL {
                self.head
            } else {
                self.nodes[cursor].next
            };
            self.link_before(id.index, before);
        }
        true
    }

    pub fn remove(&mut self, id: TimerId) -> Option<T> {
        if !self.live(id) {
            return None;
        }
        self.unlink(id.index);
        self.release(id.index)
    }

    pub fn expiry(&self, id: TimerId) -> Option<Instant> {
        self.live(id).then(|| self.nodes[id.index].expire)
    }

    /// Soonest expiry in the ledger.
    pub fn next_expiry(&self) -> Option<Instant> {
        (self.head != NIL).then(|| self.nodes[self.head].expire)
    }

    /// Detach the head if it has expired by `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Option<(TimerId, T)> {
        if self.head == NIL || self.nodes[self.head].expire > now {
            return None;
        }
        let index = self.head;
        let id = TimerId {
            index,
            generation: self.nodes[index].generation,
        };
        self.unlink(index);
        self.release(index).map(|data| (id, data))
    }

    /// Fire every record with `expire <= now`, head first. Stops at the
    /// first live record.
    pub fn sweep<F>(&mut self, now: Instant, mut on_expire: F) -> usize
    where
        F: FnMut(TimerId, T),
    {
        let mut fired = 0;
        while let Some((id, data)) = self.pop_expired(now) {
            on_expire(id, data);
            fired += 1;
        }
        fired
    }

    /// Records in firing order.
    pub fn iter(&self) -> impl Iterator<Item = (TimerId, Instant, &T)> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            if cursor == NIL {
                return None;
            }
            let node = &self.nodes[cursor];
            let id = TimerId {
                index: cursor,
                generation: node.generation,
            };
            cursor = node.next;
            node.data.as_ref().map(|d| (id, node.expire, d))
        })
    }

    fn link_before(&mut self, index: usize, before: usize) {
        let prev = if before == NIL {
            self.tail
        } else {
            self.nodes[before].prev
        };
        self.nodes[index].prev = prev;
        self.nodes[index].next = before;
        if prev == NIL {
            self.head = index;
        } else {
            self.nodes[prev].next = index;
        }
        if before == NIL {
            self.tail = index;
        } else {
            self.nodes[before].prev = index;
        }
    }

    fn unlink(&mut self, index: usize) {
        let prev = self.nodes[index].prev;
        let next = self.nodes[index].next;
        if prev == NIL {
            self.head = next;
        } else {
            self.nodes[prev].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.nodes[next].prev = prev;
        }
        self.nodes[index].prev = NIL;
        self.nodes[index].next = NIL;
    }

    fn release(&mut self, index: usize) -> Option<T> {
        let node = &mut self.nodes[index];
        let data = node.data.take()?;
        node.generation = node.generation.wrapping_add(1);
        self.free.push(index);
        self.len -= 1;
        Some(data)
    }
}
