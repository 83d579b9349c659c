// src/conn.rs
use crate::error::{EtudeError, EtudeResult};
use crate::file::StaticFile;
use crate::http::{Outcome, Status};
use crate::parser::{ParseError, RequestParser};
use crate::router::Router;
use crate::syscalls::{self, Trigger};
use std::fmt;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::SystemTime;
use tracing::{debug, warn};

pub const WRITE_BUF_SIZE: usize = 1024;

/// What the connection needs next from the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteProgress {
    /// The socket would block; wait for writability.
    Partial,
    /// The response is fully sent. A keep-alive connection has already been
    /// reset for its next request.
    Complete { keep_alive: bool },
}

/// One accepted client. Dropping it closes the socket.
pub struct Conn {
    fd: OwnedFd,
    peer: SocketAddr,
    trigger: Trigger,
    parser: RequestParser,

    write_buf: Box<[u8; WRITE_BUF_SIZE]>,
    write_len: usize,
    file: Option<StaticFile>,
    bytes_sent: usize,
    bytes_to_send: usize,
    keep_alive: bool,
    requests_served: u32,
}

impl Conn {
    pub fn open(fd: OwnedFd, peer: SocketAddr, trigger: Trigger) -> Self {
        Self {
            fd,
            peer,
            trigger,
            parser: RequestParser::new(),
            write_buf: Box::new([0; WRITE_BUF_SIZE]),
            write_len: 0,
            file: None,
            bytes_sent: 0,
            bytes_to_send: 0,
            keep_alive: false,
            requests_served: 0,
        }
    }

    /// Clear parse and response state so the socket can carry another request.
    pub fn reset_for_next_request(&mut self) {
        self.parser.reset();
        self.write_len = 0;
        self.file = None;
        self.bytes_sent = 0;
        self.bytes_to_send = 0;
        self.keep_alive = false;
    }

    /// (bytes sent, bytes in the prepared response).
    #[inline(always)]
    pub fn current_write_progress(&self) -> (usize, usize) {
        (self.bytes_sent, self.bytes_to_send)
    }

    #[inline(always)]
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    #[inline(always)]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    #[inline(always)]
    pub fn trigger(&self) -> Trigger {
        self.trigger
    }

    #[inline(always)]
    pub fn requests_served(&self) -> u32 {
        self.requests_served
    }

    /// Pull bytes off the socket into the read buffer. Level mode issues a
    /// single read; edge mode drains until the socket would block.
    ///
    /// Returns `Ok(false)` when the peer has closed.
    pub fn read_once(&mut self) -> EtudeResult<bool> {
        loop {
            if self.parser.is_full() {
                return Ok(true);
            }
            let fd = self.fd.as_raw_fd();
            match syscalls::read_nonblocking(fd, self.parser.spare_mut())? {
                Some(0) => return Ok(false),
                Some(n) => self.parser.commit(n),
                None => return Ok(true),
            }
            if self.trigger == Trigger::Level {
                return Ok(true);
            }
        }
    }

    /// Parse whatever has arrived and, once a request is complete or
    /// rejected, prepare the response.
    pub fn process(&mut self, router: &Router) -> Interest {
        let outcome = match self.parser.parse() {
            Err(ParseError::Incomplete) => return Interest::Read,
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "rejecting request");
                match e.status() {
                    Status::InternalError => Outcome::InternalError,
                    _ => Outcome::BadRequest,
                }
            }
            Ok(req) => {
                debug!(peer = %self.peer, method = req.method.as_str(), path = %req.path, "request");
                router.resolve(&req)
            }
        };

        match self.prepare(outcome) {
            Ok(()) => Interest::Write,
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "failed to build response");
                Interest::Close
            }
        }
    }

    /// Send as much of the response as the socket takes.
    pub fn write(&mut self) -> EtudeResult<WriteProgress> {
        while self.bytes_sent < self.bytes_to_send {
            let head_from = self.bytes_sent.min(self.write_len);
            let file_from = self.bytes_sent.saturating_sub(self.write_len);
            let head = &self.write_buf[head_from..self.write_len];
            let body = match &self.file {
                Some(f) => &f.as_bytes()[file_from..],
                None => &[][..],
            };

            match syscalls::writev_nonblocking(self.fd.as_raw_fd(), &[head, body])? {
                None | Some(0) => return Ok(WriteProgress::Partial),
                Some(n) => self.bytes_sent += n,
            }
        }

        self.file = None;
        self.requests_served += 1;
        let keep_alive = self.keep_alive;
        if keep_alive {
            self.reset_for_next_request();
        }
        Ok(WriteProgress::Complete { keep_alive })
    }

    fn prepare(&mut self, outcome: Outcome) -> EtudeResult<()> {
        self.write_len = 0;
        self.bytes_sent = 0;
        self.keep_alive = self.parser.keep_alive();
        let status = outcome.status();

        match outcome {
            Outcome::File(file) if !file.is_empty() => {
                debug!(peer = %self.peer, file = %file.path().display(), len = file.len(), "serving file");
                self.add_headers(status, file.len(), &file.content_type())?;
                self.bytes_to_send = self.write_len + file.len();
                self.file = Some(file);
            }
            _ => {
                let body = status.form();
                self.add_headers(status, body.len(), "text/html")?;
                self.add_response(format_args!("{body}"))?;
                self.bytes_to_send = self.write_len;
            }
        }
        Ok(())
    }

    fn add_headers(&mut self, status: Status, len: usize, content_type: &str) -> EtudeResult<()> {
        self.add_response(format_args!(
            "HTTP/1.1 {} {}\r\n",
            status.code(),
            status.reason()
        ))?;
        self.add_response(format_args!(
            "Date: {}\r\n",
            httpdate::fmt_http_date(SystemTime::now())
        ))?;
        self.add_response(format_args!("Content-Length: {len}\r\n"))?;
        self.add_response(format_args!("Content-Type: {content_type}\r\n"))?;
        self.add_response(format_args!(
            "Connection: {}\r\n",
            if self.keep_alive { "keep-alive" } else { "close" }
        ))?;
        self.add_response(format_args!("\r\n"))
    }

    fn add_response(&mut self, args: fmt::Arguments<'_>) -> EtudeResult<()> {
        let text = fmt::format(args);
        let end = self.write_len + text.len();
        if end > WRITE_BUF_SIZE {
            return Err(EtudeError::WriteBufferOverflow(WRITE_BUF_SIZE));
        }
        self.write_buf[self.write_len..end].copy_from_slice(text.as_bytes());
        self.write_len = end;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CredentialCache, MemoryStore};
    use std::fs;
    use std::fs::Permissions;
    use std::io::{Read, Write};
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn site() -> (TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let page = dir.path().join("index.html");
        fs::write(&page, "<h1>hello</h1>").unwrap();
        fs::set_permissions(&page, Permissions::from_mode(0o644)).unwrap();
        let cache = CredentialCache::load(Box::new(MemoryStore::new())).unwrap();
        let router = Router::new(dir.path(), Arc::new(cache));
        (dir, router)
    }

    fn pair(trigger: Trigger) -> (Conn, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        (Conn::open(OwnedFd::from(ours), peer, trigger), theirs)
    }

    fn response_text(peer: &mut UnixStream) -> String {
        peer.set_read_timeout(Some(std::time::Duration::from_secs(1)))
            .unwrap();
        let mut buf = vec![0u8; 4096];
        let n = peer.read(&mut buf).unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[test]
    fn serves_a_file_and_closes() {
        let (_dir, router) = site();
        let (mut conn, mut peer) = pair(Trigger::Level);

        peer.write_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        assert!(conn.read_once().unwrap());
        assert_eq!(conn.process(&router), Interest::Write);

        let (sent, total) = conn.current_write_progress();
        assert_eq!(sent, 0);
        assert!(total > 14);

        assert_eq!(
            conn.write().unwrap(),
            WriteProgress::Complete { keep_alive: false }
        );
        let text = response_text(&mut peer);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 14\r\n"));
        assert!(text.contains("Content-Type: text/html\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\n<h1>hello</h1>"));
    }

    #[test]
    fn keep_alive_resets_for_the_next_request() {
        let (_dir, router) = site();
        let (mut conn, mut peer) = pair(Trigger::Edge);

        peer.write_all(b"GET /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        assert!(conn.read_once().unwrap());
        assert_eq!(conn.process(&router), Interest::Write);
        assert_eq!(
            conn.write().unwrap(),
            WriteProgress::Complete { keep_alive: true }
        );
        assert_eq!(conn.current_write_progress(), (0, 0));
        assert_eq!(conn.requests_served(), 1);
        assert!(response_text(&mut peer).contains("Connection: keep-alive\r\n"));

        // Nothing buffered after the reset.
        assert_eq!(conn.process(&router), Interest::Read);
    }

    #[test]
    fn split_request_waits_for_more() {
        let (_dir, router) = site();
        let (mut conn, mut peer) = pair(Trigger::Level);

        peer.write_all(b"GET /index.html HT").unwrap();
        assert!(conn.read_once().unwrap());
        assert_eq!(conn.process(&router), Interest::Read);

        peer.write_all(b"TP/1.1\r\n\r\n").unwrap();
        assert!(conn.read_once().unwrap());
        assert_eq!(conn.process(&router), Interest::Write);
    }

    #[test]
    fn malformed_request_gets_400() {
        let (_dir, router) = site();
        let (mut conn, mut peer) = pair(Trigger::Level);

        peer.write_all(b"BREW /pot HTTP/1.1\r\n\r\n").unwrap();
        conn.read_once().unwrap();
        assert_eq!(conn.process(&router), Interest::Write);
        conn.write().unwrap();

        let text = response_text(&mut peer);
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.ends_with(Status::BadRequest.form()));
    }

    #[test]
    fn peer_close_is_reported() {
        let (mut conn, peer) = pair(Trigger::Edge);
        drop(peer);
        assert!(!conn.read_once().unwrap());
    }

    #[test]
    fn nothing_to_read_is_not_an_error() {
        let (mut conn, _peer) = pair(Trigger::Level);
        assert!(conn.read_once().unwrap());
    }
}
