// src/pool.rs
//! Fixed pool of worker threads fed through a [`BoundedQueue`].
//!
//! A task carries the connection itself, so exactly one thread owns it at a
//! time. The worker sends it back in a [`Completion`] over an `mpsc` channel
//! and rings the dispatcher's wake pipe; the dispatcher decides what happens
//! to the connection next.

use crate::conn::{Conn, Interest, WriteProgress};
use crate::error::EtudeResult;
use crate::queue::BoundedQueue;
use crate::router::Router;
use crate::syscalls::Notifier;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Byte a worker writes to the wake pipe after sending a completion.
pub const COMPLETION_WAKE: u8 = b'c';

/// Which side performs socket I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    /// The dispatcher reads and writes; workers only parse and route.
    Proactor,
    /// Workers read and write themselves.
    Reactor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

pub struct Task {
    pub token: u64,
    pub conn: Box<Conn>,
    pub direction: Direction,
}

/// A connection handed back to the dispatcher. `conn` is `None` only when
/// the pipeline panicked and the connection was dropped with it.
pub struct Completion {
    pub token: u64,
    pub conn: Option<Box<Conn>>,
    pub next: Interest,
}

/// Shared by every worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub router: Router,
    pub completions: Sender<Completion>,
    pub waker: Notifier,
    pub pin_cores: bool,
}

/// Run one task through the request pipeline.
pub fn run_task(task: Task, actor: Actor, router: &Router) -> Completion {
    let Task {
        token,
        mut conn,
        direction,
    } = task;

    let next = match (actor, direction) {
        (Actor::Proactor, _) => conn.process(router),
        (Actor::Reactor, Direction::Read) => match conn.read_once() {
            Ok(true) => conn.process(router),
            Ok(false) => Interest::Close,
            Err(e) => {
                debug!(peer = %conn.peer(), error = %e, "read failed");
                Interest::Close
            }
        },
        (Actor::Reactor, Direction::Write) => match conn.write() {
            Ok(WriteProgress::Partial) => Interest::Write,
            Ok(WriteProgress::Complete { keep_alive: true }) => Interest::Read,
            Ok(WriteProgress::Complete { keep_alive: false }) => Interest::Close,
            Err(e) => {
                debug!(peer = %conn.peer(), error = %e, "write failed");
                Interest::Close
            }
        },
    };

    Completion {
        token,
        conn: Some(conn),
        next,
    }
}

pub struct WorkerPool {
    queue: Arc<BoundedQueue<Task>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `threads` named workers sharing a queue of `queue_capacity` tasks.
    pub fn new(
        threads: usize,
        queue_capacity: usize,
        actor: Actor,
        context: WorkerContext,
    ) -> EtudeResult<Self> {
        let queue = Arc::new(BoundedQueue::new(queue_capacity)?);
        let core_ids = if context.pin_cores {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let queue = queue.clone();
            let ctx = context.clone();
            let core_id = if core_ids.is_empty() {
                None
            } else {
                core_ids.get(i % core_ids.len()).copied()
            };

            let handle = thread::Builder::new()
                .name(format!("etude-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            debug!(worker = i, cpu = id.id, "worker pinned");
                        } else {
                            warn!(worker = i, cpu = id.id, "failed to pin worker");
                        }
                    }
                    work(i, &queue, actor, &ctx);
                })?;
            handles.push(handle);
        }

        info!(threads, queue_capacity, ?actor, "worker pool started");
        Ok(Self { queue, handles })
    }

    /// Enqueue without blocking. A full queue hands the task back.
    pub fn submit(&self, task: Task) -> Result<(), Task> {
        self.queue.push(task)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Close the queue and wait for every worker to finish what it holds.
    pub fn shutdown(&mut self) {
        self.queue.close();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn work(id: usize, queue: &BoundedQueue<Task>, actor: Actor, ctx: &WorkerContext) {
    debug!(worker = id, "worker entering loop");
    while let Some(task) = queue.pop() {
        let token = task.token;
        let completion = catch_unwind(AssertUnwindSafe(|| run_task(task, actor, &ctx.router)))
            .unwrap_or_else(|_| {
                error!(worker = id, token, "request pipeline panicked");
                Completion {
                    token,
                    conn: None,
                    next: Interest::Close,
                }
            });
        if ctx.completions.send(completion).is_err() {
            break;
        }
        ctx.waker.notify(COMPLETION_WAKE);
    }
    debug!(worker = id, "worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CredentialCache, MemoryStore};
    use crate::syscalls::{Trigger, self_pipe};
    use std::fs;
    use std::fs::Permissions;
    use std::io::{Read, Write};
    use std::net::SocketAddr;
    use std::os::fd::OwnedFd;
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::net::UnixStream;
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn router() -> (TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let page = dir.path().join("a.html");
        fs::write(&page, "A").unwrap();
        fs::set_permissions(&page, Permissions::from_mode(0o644)).unwrap();
        let cache = CredentialCache::load(Box::new(MemoryStore::new())).unwrap();
        let router = Router::new(dir.path(), Arc::new(cache));
        (dir, router)
    }

    fn task(direction: Direction) -> (Task, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let conn = Box::new(Conn::open(OwnedFd::from(ours), peer, Trigger::Level));
        (
            Task {
                token: 7,
                conn,
                direction,
            },
            theirs,
        )
    }

    #[test]
    fn reactor_reads_then_writes() {
        let (_dir, router) = router();
        let (t, mut peer) = task(Direction::Read);
        peer.write_all(b"GET /a.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();

        let done = run_task(t, Actor::Reactor, &router);
        assert_eq!(done.token, 7);
        assert_eq!(done.next, Interest::Write);

        let t = Task {
            token: 7,
            conn: done.conn.unwrap(),
            direction: Direction::Write,
        };
        let done = run_task(t, Actor::Reactor, &router);
        assert_eq!(done.next, Interest::Read);

        let mut buf = [0u8; 512];
        let n = peer.read(&mut buf).unwrap();
        assert!(buf[..n].starts_with(b"HTTP/1.1 200 OK"));
        assert!(buf[..n].ends_with(b"\r\n\r\nA"));
    }

    #[test]
    fn reactor_closes_on_eof() {
        let (_dir, router) = router();
        let (t, peer) = task(Direction::Read);
        drop(peer);
        assert_eq!(run_task(t, Actor::Reactor, &router).next, Interest::Close);
    }

    #[test]
    fn proactor_only_computes() {
        let (_dir, router) = router();
        let (mut t, mut peer) = task(Direction::Read);
        peer.write_all(b"GET /a.html HTTP/1.1\r\n").unwrap();

        // The dispatcher has already drained the socket.
        assert!(t.conn.read_once().unwrap());
        let done = run_task(t, Actor::Proactor, &router);
        assert_eq!(done.next, Interest::Read);

        // Nothing was written to the peer.
        peer.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 16];
        assert!(peer.read(&mut buf).is_err());
    }

    #[test]
    fn pool_returns_completions_and_wakes() {
        let (_dir, router) = router();
        let (tx, rx) = mpsc::channel();
        let (reader, waker) = self_pipe().unwrap();
        let ctx = WorkerContext {
            router,
            completions: tx,
            waker,
            pin_cores: false,
        };
        let mut pool = WorkerPool::new(2, 8, Actor::Reactor, ctx).unwrap();

        let (t, mut peer) = task(Direction::Read);
        peer.write_all(b"GET /a.html HTTP/1.1\r\n\r\n").unwrap();
        assert!(pool.submit(t).is_ok());

        let done = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(done.token, 7);
        assert_eq!(done.next, Interest::Write);
        assert!(done.conn.is_some());

        let mut wake = Vec::new();
        for _ in 0..100 {
            reader.drain(&mut wake).unwrap();
            if !wake.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(wake, vec![COMPLETION_WAKE]);
        pool.shutdown();
    }

    #[test]
    fn full_queue_hands_the_task_back() {
        let (_dir, router) = router();
        let (tx, _rx) = mpsc::channel();
        let (_reader, waker) = self_pipe().unwrap();
        let ctx = WorkerContext {
            router,
            completions: tx,
            waker,
            pin_cores: false,
        };
        // No threads, so nothing drains the queue.
        let pool = WorkerPool::new(0, 1, Actor::Proactor, ctx).unwrap();
        let (first, _p1) = task(Direction::Read);
        let (second, _p2) = task(Direction::Read);
        assert!(pool.submit(first).is_ok());
        assert_eq!(pool.queued(), 1);
        assert!(pool.submit(second).is_err());
    }
}
