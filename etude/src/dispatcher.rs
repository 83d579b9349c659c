// src/dispatcher.rs
//! The single event-loop thread.
//!
//! It alone touches the epoll set, the connection slab and the timer ledger.
//! Connections are registered one-shot: after an event fires nothing more is
//! reported for that socket until the dispatcher re-arms it, which it only
//! does while holding the connection.

use crate::config::Config;
use crate::conn::{Conn, Interest, WriteProgress};
use crate::error::EtudeResult;
use crate::pool::{Actor, Completion, Direction, Task, WorkerContext, WorkerPool};
use crate::router::Router;
use crate::slab::{ConnectionSlab, Holder};
use crate::syscalls::{
    self, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, Epoll, PipeReader, Trigger,
    epoll_event,
};
use crate::timer::TimerLedger;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Signal byte: run the idle sweep after the current batch.
pub const TICK: u8 = b't';
/// Signal byte: leave the event loop after the current batch.
pub const STOP: u8 = b's';

const LISTEN_TOKEN: u64 = u64::MAX;
const SIGNAL_TOKEN: u64 = u64::MAX - 1;
const WAKE_TOKEN: u64 = u64::MAX - 2;

const MAX_EVENTS: usize = 10_000;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
pub const BUSY_MESSAGE: &str = "Internal server busy";

pub struct Dispatcher {
    epoll: Epoll,
    listener: OwnedFd,
    signals: PipeReader,
    wake: PipeReader,
    completions: Receiver<Completion>,
    pool: WorkerPool,
    slab: ConnectionSlab,
    timers: TimerLedger<u64>,

    listen_trigger: Trigger,
    conn_trigger: Trigger,
    actor: Actor,
    idle: Duration,

    timeout_pending: bool,
    stop: bool,
}

impl Dispatcher {
    /// Register the listener and the signal pipe and start the worker pool.
    pub fn new(
        listener: OwnedFd,
        signals: PipeReader,
        config: &Config,
        router: Router,
    ) -> EtudeResult<Self> {
        let (listen_trigger, conn_trigger) = config.triggers();
        let epoll = Epoll::new()?;
        epoll.add(
            listener.as_raw_fd(),
            LISTEN_TOKEN,
            EPOLLIN,
            listen_trigger,
            false,
        )?;
        epoll.add(signals.raw_fd(), SIGNAL_TOKEN, EPOLLIN, Trigger::Level, false)?;

        let (wake, waker) = syscalls::self_pipe()?;
        epoll.add(wake.raw_fd(), WAKE_TOKEN, EPOLLIN, Trigger::Level, false)?;

        let (tx, rx) = mpsc::channel();
        let pool = WorkerPool::new(
            config.threads,
            config.queue_capacity,
            config.actor,
            WorkerContext {
                router,
                completions: tx,
                waker,
                pin_cores: config.pin_workers,
            },
        )?;

        Ok(Self {
            epoll,
            listener,
            signals,
            wake,
            completions: rx,
            pool,
            slab: ConnectionSlab::new(config.max_connections),
            timers: TimerLedger::with_capacity(config.max_connections.min(4096)),
            listen_trigger,
            conn_trigger,
            actor: config.actor,
            idle: config.idle_timeout(),
            timeout_pending: false,
            stop: false,
        })
    }

    /// Connections currently tracked.
    pub fn active(&self) -> usize {
        self.slab.len()
    }

    pub fn local_addr(&self) -> EtudeResult<SocketAddr> {
        syscalls::local_addr(self.listener.as_raw_fd())
    }

    /// Serve until a `STOP` byte arrives, then close every connection.
    pub fn run(&mut self) -> EtudeResult<()> {
        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        info!(addr = ?self.local_addr().ok(), actor = ?self.actor, "dispatcher running");

        while !self.stop {
            let n = self.epoll.wait(&mut events, -1)?;

            for ev in &events[..n] {
                let token = ev.u64;
                let flags = ev.events;

                match token {
                    LISTEN_TOKEN => self.accept_clients(),
                    SIGNAL_TOKEN => self.read_signals(),
                    WAKE_TOKEN => self.collect_completions(),
                    _ if flags & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) as u32 != 0 => {
                        self.close(token, "peer hung up")
                    }
                    _ if flags & EPOLLIN as u32 != 0 => self.on_readable(token),
                    _ if flags & EPOLLOUT as u32 != 0 => self.on_writable(token),
                    _ => {}
                }
            }

            if self.timeout_pending {
                self.sweep(Instant::now());
                self.timeout_pending = false;
            }
        }

        self.drain();
        info!("dispatcher stopped");
        Ok(())
    }

    fn accept_clients(&mut self) {
        loop {
            match syscalls::accept_connection(self.listener.as_raw_fd()) {
                Ok(Some((fd, peer))) => self.admit(fd, peer),
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            }
            if self.listen_trigger == Trigger::Level {
                break;
            }
        }
    }

    fn admit(&mut self, fd: OwnedFd, peer: SocketAddr) {
        if self.slab.is_full() {
            warn!(%peer, active = self.slab.len(), "connection limit reached");
            syscalls::show_error(fd.as_raw_fd(), BUSY_MESSAGE);
            return;
        }

        let raw = fd.as_raw_fd();
        let conn = Box::new(Conn::open(fd, peer, self.conn_trigger));
        let token = match self.slab.insert(conn) {
            Ok(token) => token,
            Err(e) => {
                warn!(%peer, error = %e, "no slot for connection");
                return;
            }
        };
        if let Err(e) = self.epoll.add(
            raw,
            token,
            EPOLLIN | EPOLLRDHUP,
            self.conn_trigger,
            true,
        ) {
            error!(%peer, error = %e, "failed to register connection");
            self.slab.remove(token);
            return;
        }

        let timer = self.timers.insert(Instant::now() + self.idle, token);
        if let Some(entry) = self.slab.get_mut(token) {
            entry.timer = Some(timer);
        }
        debug!(%peer, fd = raw, active = self.slab.len(), "accepted");
    }

    fn read_signals(&mut self) {
        let mut bytes = Vec::new();
        if let Err(e) = self.signals.drain(&mut bytes) {
            error!(error = %e, "signal pipe failed");
            self.stop = true;
        }
        for b in bytes {
            match b {
                TICK => self.timeout_pending = true,
                STOP => self.stop = true,
                other => debug!(byte = other, "unknown signal byte"),
            }
        }
    }

    fn collect_completions(&mut self) {
        let mut scratch = Vec::new();
        if let Err(e) = self.wake.drain(&mut scratch) {
            error!(error = %e, "completion pipe failed");
        }
        while let Ok(done) = self.completions.try_recv() {
            self.complete(done);
        }
    }

    /// Take a connection back from a worker and act on what it needs next.
    fn complete(&mut self, done: Completion) {
        let Completion { token, conn, next } = done;
        let Some(conn) = conn else {
            self.force_close(token, "worker lost the connection");
            return;
        };
        match self.slab.give_back(token, conn) {
            Ok(false) => {}
            Ok(true) => {
                self.close(token, "evicted while lent");
                return;
            }
            Err(_stale) => return,
        }
        match next {
            Interest::Read => self.rearm(token, EPOLLIN),
            Interest::Write => self.rearm(token, EPOLLOUT),
            Interest::Close => self.close(token, "request finished"),
        }
    }

    fn on_readable(&mut self, token: u64) {
        match self.actor {
            Actor::Proactor => {
                let outcome = match self.parked(token) {
                    Some(conn) => conn.read_once(),
                    None => return,
                };
                match outcome {
                    Ok(true) => {
                        self.touch(token);
                        self.dispatch(token, Direction::Read);
                    }
                    Ok(false) => self.close(token, "peer closed"),
                    Err(e) => {
                        debug!(error = %e, "read failed");
                        self.close(token, "read error");
                    }
                }
            }
            Actor::Reactor => {
                if self.parked(token).is_some() {
                    self.touch(token);
                    self.dispatch(token, Direction::Read);
                }
            }
        }
    }

    fn on_writable(&mut self, token: u64) {
        match self.actor {
            Actor::Proactor => {
                let (progress, advanced) = match self.parked(token) {
                    Some(conn) => {
                        let (before, _) = conn.current_write_progress();
                        let progress = conn.write();
                        let (after, _) = conn.current_write_progress();
                        (progress, after > before)
                    }
                    None => return,
                };
                match progress {
                    Ok(WriteProgress::Partial) => {
                        if advanced {
                            self.touch(token);
                        }
                        self.rearm(token, EPOLLOUT);
                    }
                    Ok(WriteProgress::Complete { keep_alive: true }) => {
                        self.touch(token);
                        self.rearm(token, EPOLLIN);
                    }
                    Ok(WriteProgress::Complete { keep_alive: false }) => {
                        self.close(token, "response sent")
                    }
                    Err(e) => {
                        debug!(error = %e, "write failed");
                        self.close(token, "write error");
                    }
                }
            }
            Actor::Reactor => {
                if self.parked(token).is_some() {
                    self.touch(token);
                    self.dispatch(token, Direction::Write);
                }
            }
        }
    }

    fn parked(&mut self, token: u64) -> Option<&mut Conn> {
        match &mut self.slab.get_mut(token)?.holder {
            Holder::Parked(conn) => Some(&mut **conn),
            Holder::Lent { .. } => None,
        }
    }

    /// Lend a connection to the pool. A full queue costs the connection.
    fn dispatch(&mut self, token: u64, direction: Direction) {
        let Some(conn) = self.slab.lend(token) else {
            return;
        };
        if let Err(task) = self.pool.submit(Task {
            token,
            conn,
            direction,
        }) {
            warn!(queued = self.pool.queued(), "task queue full, dropping connection");
            let _ = self.slab.give_back(token, task.conn);
            self.close(token, "task queue full");
        }
    }

    fn rearm(&mut self, token: u64, interest: i32) {
        let Some(entry) = self.slab.get(token) else {
            return;
        };
        if let Err(e) = self
            .epoll
            .modify(entry.fd, token, interest | EPOLLRDHUP, self.conn_trigger)
        {
            debug!(error = %e, "re-arm failed");
            self.close(token, "re-arm failed");
        }
    }

    /// Push the connection's expiry out by a full idle period.
    fn touch(&mut self, token: u64) {
        if let Some(timer) = self.slab.get(token).and_then(|e| e.timer) {
            self.timers.adjust(timer, Instant::now() + self.idle);
        }
    }

    /// Close a parked connection; a lent one is closed when it returns.
    fn close(&mut self, token: u64, reason: &'static str) {
        if self.slab.mark_evict(token) {
            return;
        }
        self.force_close(token, reason);
    }

    fn force_close(&mut self, token: u64, reason: &'static str) {
        let Some(entry) = self.slab.remove(token) else {
            return;
        };
        if let Err(e) = self.epoll.delete(entry.fd) {
            debug!(error = %e, "epoll delete failed");
        }
        if let Some(timer) = entry.timer {
            self.timers.remove(timer);
        }
        debug!(peer = %entry.peer, reason, active = self.slab.len(), "closed");
        // Dropping a parked connection closes its socket.
        drop(entry);
    }

    /// Evict every connection idle past its expiry. A lent connection gets
    /// a fresh record instead; its request runs to completion.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let mut expired = Vec::new();
        self.timers.sweep(now, |_, token| expired.push(token));

        let mut evicted = 0;
        for token in expired {
            if self.slab.is_lent(token) {
                let timer = self.timers.insert(now + self.idle, token);
                if let Some(entry) = self.slab.get_mut(token) {
                    entry.timer = Some(timer);
                }
                continue;
            }
            if let Some(entry) = self.slab.get_mut(token) {
                entry.timer = None;
                info!(peer = %entry.peer, "closing idle connection");
            }
            self.force_close(token, "idle timeout");
            evicted += 1;
        }
        evicted
    }

    /// Close parked connections, wait briefly for lent ones, stop the pool.
    fn drain(&mut self) {
        for token in self.slab.tokens() {
            self.close(token, "server stopping");
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while self.slab.lent() > 0 {
            let now = Instant::now();
            if now >= deadline {
                warn!(lent = self.slab.lent(), "giving up on in-flight requests");
                break;
            }
            match self.completions.recv_timeout(deadline - now) {
                Ok(done) => self.complete(done),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.pool.shutdown();
        for token in self.slab.tokens() {
            self.force_close(token, "server stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CredentialCache, MemoryStore};
    use crate::syscalls::Notifier;
    use std::fs::{self, Permissions};
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;

    fn dispatcher(max_connections: usize) -> (Dispatcher, Notifier, tempfile::TempDir) {
        let root = tempfile::tempdir().unwrap();
        let config = Config {
            host: "127.0.0.1".into(),
            port: 0,
            doc_root: root.path().to_path_buf(),
            threads: 1,
            max_connections,
            ..Config::default()
        };
        let listener = syscalls::create_listen_socket(config.listen_addr().unwrap(), false).unwrap();
        let (signals, notifier) = syscalls::self_pipe().unwrap();
        let cache = CredentialCache::load(Box::new(MemoryStore::new())).unwrap();
        let router = Router::new(root.path(), Arc::new(cache));
        let d = Dispatcher::new(listener, signals, &config, router).unwrap();
        (d, notifier, root)
    }

    fn dial(d: &Dispatcher) -> TcpStream {
        let client = TcpStream::connect(d.local_addr().unwrap()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        client
    }

    /// Connect and wait until the dispatcher has admitted the connection.
    fn connect(d: &mut Dispatcher) -> TcpStream {
        let before = d.active();
        let client = dial(d);
        for _ in 0..100 {
            d.accept_clients();
            if d.active() > before {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(d.active(), before + 1);
        client
    }

    /// Collect completions until no connection is out with a worker.
    fn settle(d: &mut Dispatcher) {
        for _ in 0..400 {
            d.collect_completions();
            if d.slab.lent() == 0 {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("worker never returned the connection");
    }

    fn expiry(d: &Dispatcher, token: u64) -> Instant {
        let timer = d.slab.get(token).and_then(|e| e.timer).unwrap();
        d.timers.expiry(timer).unwrap()
    }

    #[test]
    fn reads_and_partial_writes_push_the_expiry_forward() {
        let (mut d, _notifier, root) = dispatcher(8);
        let big = root.path().join("big.bin");
        fs::write(&big, vec![b'x'; 16 << 20]).unwrap();
        fs::set_permissions(&big, Permissions::from_mode(0o644)).unwrap();

        let mut client = connect(&mut d);
        let token = d.slab.tokens()[0];
        let admitted = expiry(&d, token);
        client.write_all(b"GET /big.bin HTTP/1.1\r\n\r\n").unwrap();

        let mut prepared = false;
        for _ in 0..100 {
            std::thread::sleep(Duration::from_millis(5));
            d.on_readable(token);
            settle(&mut d);
            if d.parked(token).is_some_and(|c| c.current_write_progress().1 > 0) {
                prepared = true;
                break;
            }
        }
        assert!(prepared);
        let after_read = expiry(&d, token);
        assert!(after_read > admitted);

        // The client is not reading, so the socket fills part way.
        std::thread::sleep(Duration::from_millis(10));
        d.on_writable(token);
        let (sent, total) = d.parked(token).unwrap().current_write_progress();
        assert!(sent > 0 && sent < total, "sent {sent} of {total}");
        assert!(expiry(&d, token) > after_read);

        // A sweep at the original deadline leaves the connection alone.
        assert_eq!(d.sweep(after_read), 0);
        assert_eq!(d.active(), 1);
    }

    #[test]
    fn sweep_evicts_idle_connections() {
        let (mut d, _notifier, _root) = dispatcher(8);
        let mut client = connect(&mut d);
        assert_eq!(d.active(), 1);

        assert_eq!(d.sweep(Instant::now()), 0);
        assert_eq!(d.active(), 1);

        assert_eq!(d.sweep(Instant::now() + d.idle + Duration::from_secs(1)), 1);
        assert_eq!(d.active(), 0);
        assert!(d.timers.is_empty());

        let mut buf = [0u8; 4];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn sweep_spares_lent_connections() {
        let (mut d, _notifier, _root) = dispatcher(8);
        let _client = connect(&mut d);
        let token = d.slab.tokens()[0];
        let conn = d.slab.lend(token).unwrap();

        let later = Instant::now() + d.idle + Duration::from_secs(1);
        assert_eq!(d.sweep(later), 0);
        assert_eq!(d.active(), 1);
        assert_eq!(d.timers.len(), 1);
        assert!(d.timers.next_expiry().unwrap() > later);

        assert_eq!(d.slab.give_back(token, conn).ok(), Some(false));
    }

    #[test]
    fn closing_a_lent_connection_waits_for_its_return() {
        let (mut d, _notifier, _root) = dispatcher(8);
        let _client = connect(&mut d);
        let token = d.slab.tokens()[0];
        let conn = d.slab.lend(token).unwrap();

        d.close(token, "test");
        assert_eq!(d.active(), 1);

        d.complete(Completion {
            token,
            conn: Some(conn),
            next: Interest::Read,
        });
        assert_eq!(d.active(), 0);
    }

    #[test]
    fn full_slab_turns_clients_away() {
        let (mut d, _notifier, _root) = dispatcher(1);
        let _first = connect(&mut d);
        let mut second = dial(&d);
        for _ in 0..20 {
            d.accept_clients();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(d.active(), 1);

        let mut out = Vec::new();
        second.read_to_end(&mut out).unwrap();
        assert_eq!(out, BUSY_MESSAGE.as_bytes());
    }

    #[test]
    fn signal_bytes_set_flags() {
        let (mut d, notifier, _root) = dispatcher(8);
        assert!(notifier.notify(TICK));
        d.read_signals();
        assert!(d.timeout_pending);
        assert!(!d.stop);

        assert!(notifier.notify(b'?'));
        assert!(notifier.notify(STOP));
        d.read_signals();
        assert!(d.stop);
    }
}
