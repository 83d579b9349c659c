// src/slab.rs
use crate::conn::Conn;
use crate::error::{EtudeError, EtudeResult};
use crate::timer::TimerId;
use std::net::SocketAddr;
use std::os::fd::RawFd;

const NIL: usize = usize::MAX;

/// Who currently owns the connection of an occupied slot.
pub enum Holder {
    /// Held by the dispatcher, waiting on readiness.
    Parked(Box<Conn>),
    /// Handed to a worker. `evict_on_return` asks the dispatcher to close it
    /// as soon as the worker gives it back.
    Lent { evict_on_return: bool },
}

pub struct Entry {
    pub holder: Holder,
    pub timer: Option<TimerId>,
    pub fd: RawFd,
    pub peer: SocketAddr,
}

enum State {
    Free { next: usize },
    Occupied(Entry),
}

struct Slot {
    generation: u32,
    state: State,
}

/// Pack a slot index and its generation into an epoll token.
#[inline(always)]
pub fn token(index: usize, generation: u32) -> u64 {
    ((generation as u64) << 32) | index as u64
}

#[inline(always)]
fn split_token(token: u64) -> (usize, u32) {
    ((token & 0xFFFF_FFFF) as usize, (token >> 32) as u32)
}

/// Fixed-size table of live connections keyed by epoll token.
pub struct ConnectionSlab {
    slots: Box<[Slot]>,
    head_free: usize,
    active_count: usize,
    lent_count: usize,
}

impl ConnectionSlab {
    /// Allocate every slot once, threading the free list through them.
    pub fn new(capacity: usize) -> Self {
        let slots: Vec<Slot> = (0..capacity)
            .map(|i| Slot {
                generation: 0,
                state: State::Free {
                    next: if i + 1 == capacity { NIL } else { i + 1 },
                },
            })
            .collect();

        Self {
            slots: slots.into_boxed_slice(),
            head_free: if capacity == 0 { NIL } else { 0 },
            active_count: 0,
            lent_count: 0,
        }
    }

    /// O(1) allocation. Returns the token that addresses the new entry.
    pub fn insert(&mut self, conn: Box<Conn>) -> EtudeResult<u64> {
        if self.head_free == NIL {
            return Err(EtudeError::SlabFull);
        }
        let index = self.head_free;
        let slot = &mut self.slots[index];
        if let State::Free { next } = slot.state {
            self.head_free = next;
        }
        slot.state = State::Occupied(Entry {
            fd: conn.raw_fd(),
            peer: conn.peer(),
            holder: Holder::Parked(conn),
            timer: None,
        });
        self.active_count += 1;
        Ok(token(index, slot.generation))
    }

    fn slot(&self, token: u64) -> Option<&Slot> {
        let (index, generation) = split_token(token);
        self.slots
            .get(index)
            .filter(|s| s.generation == generation && matches!(s.state, State::Occupied(_)))
    }

    pub fn get(&self, token: u64) -> Option<&Entry> {
        match &self.slot(token)?.state {
            State::Occupied(entry) => Some(entry),
            State::Free { .. } => None,
        }
    }

    pub fn get_mut(&mut self, token: u64) -> Option<&mut Entry> {
        let (index, generation) = split_token(token);
        let slot = self.slots.get_mut(index)?;
        if slot.generation != generation {
            return None;
        }
        match &mut slot.state {
            State::Occupied(entry) => Some(entry),
            State::Free { .. } => None,
        }
    }

    /// O(1) deallocation. The slot's generation moves on so the old token
    /// no longer resolves.
    pub fn remove(&mut self, token: u64) -> Option<Entry> {
        self.slot(token)?;
        let (index, _) = split_token(token);
        let slot = &mut self.slots[index];
        let old = std::mem::replace(
            &mut slot.state,
            State::Free {
                next: self.head_free,
            },
        );
        slot.generation = slot.generation.wrapping_add(1);
        self.head_free = index;
        self.active_count -= 1;
        match old {
            State::Occupied(entry) => {
                if matches!(entry.holder, Holder::Lent { .. }) {
                    self.lent_count -= 1;
                }
                Some(entry)
            }
            State::Free { .. } => None,
        }
    }

    /// Move a parked connection out to a worker.
    pub fn lend(&mut self, token: u64) -> Option<Box<Conn>> {
        let entry = self.get_mut(token)?;
        match std::mem::replace(
            &mut entry.holder,
            Holder::Lent {
                evict_on_return: false,
            },
        ) {
            Holder::Parked(conn) => {
                self.lent_count += 1;
                Some(conn)
            }
            lent @ Holder::Lent { .. } => {
                entry.holder = lent;
                None
            }
        }
    }

    /// Park a connection a worker has finished with. Returns its
    /// `evict_on_return` flag, or hands the connection back when the token
    /// does not name a lent slot.
    pub fn give_back(&mut self, token: u64, conn: Box<Conn>) -> Result<bool, Box<Conn>> {
        let Some(entry) = self.get_mut(token) else {
            return Err(conn);
        };
        match entry.holder {
            Holder::Lent { evict_on_return } => {
                entry.holder = Holder::Parked(conn);
                self.lent_count -= 1;
                Ok(evict_on_return)
            }
            Holder::Parked(_) => Err(conn),
        }
    }

    /// Ask for a lent connection to be closed when it comes back.
    pub fn mark_evict(&mut self, token: u64) -> bool {
        match self.get_mut(token) {
            Some(Entry {
                holder: Holder::Lent { evict_on_return },
                ..
            }) => {
                *evict_on_return = true;
                true
            }
            _ => false,
        }
    }

    pub fn is_lent(&self, token: u64) -> bool {
        matches!(
            self.get(token),
            Some(Entry {
                holder: Holder::Lent { .. },
                ..
            })
        )
    }

    /// Tokens of every occupied slot.
    pub fn tokens(&self) -> Vec<u64> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s.state, State::Occupied(_)))
            .map(|(i, s)| token(i, s.generation))
            .collect()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.active_count
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.active_count == 0
    }

    #[inline(always)]
    pub fn lent(&self) -> usize {
        self.lent_count
    }

    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.head_free == NIL
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscalls::Trigger;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;

    fn conn() -> Box<Conn> {
        let (a, _b) = UnixStream::pair().unwrap();
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        Box::new(Conn::open(OwnedFd::from(a), peer, Trigger::Level))
    }

    #[test]
    fn test_slab_operations() {
        let mut slab = ConnectionSlab::new(2);
        assert_eq!(slab.capacity(), 2);

        let t1 = slab.insert(conn()).unwrap();
        let t2 = slab.insert(conn()).unwrap();
        assert!(slab.is_full());
        assert!(matches!(slab.insert(conn()), Err(EtudeError::SlabFull)));
        assert_eq!(slab.len(), 2);

        assert!(slab.remove(t1).is_some());
        assert!(slab.remove(t1).is_none());
        assert_eq!(slab.len(), 1);

        // Slot 0 is reused under a new generation; the stale token misses.
        let t3 = slab.insert(conn()).unwrap();
        assert_eq!(t3 & 0xFFFF_FFFF, t1 & 0xFFFF_FFFF);
        assert_ne!(t3, t1);
        assert!(slab.get(t1).is_none());
        assert!(slab.get(t3).is_some());
        assert_eq!(slab.tokens().len(), 2);
        assert!(slab.get(t2).is_some());
    }

    #[test]
    fn lend_and_give_back() {
        let mut slab = ConnectionSlab::new(4);
        let t = slab.insert(conn()).unwrap();

        let c = slab.lend(t).unwrap();
        assert!(slab.is_lent(t));
        assert_eq!(slab.lent(), 1);
        assert!(slab.lend(t).is_none());

        assert!(slab.mark_evict(t));
        assert_eq!(slab.give_back(t, c).ok(), Some(true));
        assert!(!slab.is_lent(t));
        assert_eq!(slab.lent(), 0);

        // Giving back to a parked slot is refused.
        assert!(slab.give_back(t, conn()).is_err());
    }

    #[test]
    fn removing_a_lent_slot_refuses_the_return() {
        let mut slab = ConnectionSlab::new(1);
        let t = slab.insert(conn()).unwrap();
        let c = slab.lend(t).unwrap();
        slab.remove(t).unwrap();
        assert_eq!(slab.lent(), 0);
        assert!(slab.give_back(t, c).is_err());
    }
}
