// src/parser.rs
//! Incremental HTTP/1.1 request parser.
//!
//! The parser owns the connection's read buffer. Bytes are appended at
//! `filled`; the line scanner advances `scanned`; `processed` marks the start
//! of the line (or body) currently being assembled. Every call to
//! [`RequestParser::parse`] resumes where the previous one stopped.

use crate::http::{DEFAULT_DOCUMENT, Method, Request, Status};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

pub const READ_BUF_SIZE: usize = 2048;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("request is incomplete")]
    Incomplete,
    #[error("malformed line terminator")]
    MalformedLine,
    #[error("malformed request line")]
    BadRequestLine,
    #[error("unsupported method")]
    UnsupportedMethod,
    #[error("unsupported HTTP version")]
    UnsupportedVersion,
    #[error("request target is not an absolute path")]
    BadTarget,
    #[error("invalid Content-Length")]
    BadContentLength,
    #[error("request exceeds the read buffer")]
    TooLarge,
    #[error("parser reached an unexpected state")]
    Internal,
}

impl ParseError {
    /// Status sent to the peer for a terminal parse failure.
    pub fn status(&self) -> Status {
        match self {
            ParseError::Internal => Status::InternalError,
            _ => Status::BadRequest,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineStatus {
    Complete,
    Open,
    Bad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    RequestLine,
    Headers,
    Body,
    Done,
}

pub struct RequestParser {
    buf: Box<[u8]>,
    filled: usize,
    scanned: usize,
    processed: usize,
    line_end: usize,
    state: CheckState,

    method: Option<Method>,
    path: String,
    version: String,
    headers: HashMap<String, String>,
    host: Option<String>,
    content_length: usize,
    keep_alive: bool,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; READ_BUF_SIZE].into_boxed_slice(),
            filled: 0,
            scanned: 0,
            processed: 0,
            line_end: 0,
            state: CheckState::RequestLine,
            method: None,
            path: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            host: None,
            content_length: 0,
            keep_alive: false,
        }
    }

    /// Rewind every cursor and forget the partial request.
    pub fn reset(&mut self) {
        self.buf.fill(0);
        self.filled = 0;
        self.scanned = 0;
        self.processed = 0;
        self.line_end = 0;
        self.state = CheckState::RequestLine;
        self.method = None;
        self.path.clear();
        self.version.clear();
        self.headers.clear();
        self.host = None;
        self.content_length = 0;
        self.keep_alive = false;
    }

    #[inline(always)]
    pub fn state(&self) -> CheckState {
        self.state
    }

    #[inline(always)]
    pub fn filled(&self) -> usize {
        self.filled
    }

    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.filled == self.buf.len()
    }

    /// Keep-alive flag of the request seen so far.
    #[inline(always)]
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Unfilled tail of the read buffer, for a socket read to land in.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.filled..]
    }

    /// Mark `n` bytes of [`spare_mut`](Self::spare_mut) as received.
    pub fn commit(&mut self, n: usize) {
        self.filled = (self.filled + n).min(self.buf.len());
    }

    /// Copy as much of `data` as fits. Returns the number of bytes taken.
    pub fn feed(&mut self, data: &[u8]) -> usize {
        let spare = self.spare_mut();
        let n = data.len().min(spare.len());
        spare[..n].copy_from_slice(&data[..n]);
        self.commit(n);
        n
    }

    /// Drive the state machine over everything buffered so far.
    ///
    /// `Err(ParseError::Incomplete)` leaves all state in place for the next
    /// read; any other error is terminal for this request.
    pub fn parse(&mut self) -> Result<Request, ParseError> {
        loop {
            match self.state {
                CheckState::Done => return Err(ParseError::Internal),
                CheckState::Body => {
                    let end = self.processed + self.content_length;
                    if self.filled < end {
                        return Err(ParseError::Incomplete);
                    }
                    let body = self.buf[self.processed..end].to_vec();
                    return Ok(self.finish(body));
                }
                CheckState::RequestLine | CheckState::Headers => {}
            }

            match self.scan_line() {
                LineStatus::Open if self.is_full() => return Err(ParseError::TooLarge),
                LineStatus::Open => return Err(ParseError::Incomplete),
                LineStatus::Bad => return Err(ParseError::MalformedLine),
                LineStatus::Complete => {}
            }

            let (start, end) = (self.processed, self.line_end);
            self.processed = self.scanned;

            if self.state == CheckState::RequestLine {
                let (method, path, version) = parse_request_line(&self.buf[start..end])?;
                self.method = Some(method);
                self.path = path;
                self.version = version;
                self.state = CheckState::Headers;
                continue;
            }

            match parse_header(&self.buf[start..end])? {
                HeaderLine::Field(name, value) => self.apply_header(name, value)?,
                HeaderLine::Skipped => {}
                HeaderLine::End if self.content_length > 0 => {
                    if self.processed + self.content_length > self.buf.len() {
                        return Err(ParseError::TooLarge);
                    }
                    self.state = CheckState::Body;
                }
                HeaderLine::End => return Ok(self.finish(Vec::new())),
            }
        }
    }

    /// Find the next `\r\n` at or after `scanned`. A trailing `\r` stays
    /// unscanned so the following read can complete the pair.
    fn scan_line(&mut self) -> LineStatus {
        let mut i = self.scanned;
        while i < self.filled {
            match self.buf[i] {
                b'\r' => {
                    if i + 1 == self.filled {
                        self.scanned = i;
                        return LineStatus::Open;
                    }
                    if self.buf[i + 1] != b'\n' {
                        return LineStatus::Bad;
                    }
                    self.buf[i] = 0;
                    self.buf[i + 1] = 0;
                    self.line_end = i;
                    self.scanned = i + 2;
                    return LineStatus::Complete;
                }
                b'\n' => {
                    if i > self.processed && self.buf[i - 1] == b'\r' {
                        self.buf[i - 1] = 0;
                        self.buf[i] = 0;
                        self.line_end = i - 1;
                        self.scanned = i + 1;
                        return LineStatus::Complete;
                    }
                    return LineStatus::Bad;
                }
                _ => i += 1,
            }
        }
        self.scanned = self.filled;
        LineStatus::Open
    }

    fn apply_header(&mut self, name: String, value: String) -> Result<(), ParseError> {
        match name.as_str() {
            "connection" => {
                if value.eq_ignore_ascii_case("keep-alive") {
                    self.keep_alive = true;
                }
            }
            "content-length" => {
                self.content_length = value
                    .parse::<usize>()
                    .map_err(|_| ParseError::BadContentLength)?;
            }
            "host" => self.host = Some(value.clone()),
            _ => debug!(header = %name, "unknown header"),
        }
        self.headers.insert(name, value);
        Ok(())
    }

    fn finish(&mut self, body: Vec<u8>) -> Request {
        self.state = CheckState::Done;
        Request {
            method: self.method.unwrap_or(Method::Get),
            path: std::mem::take(&mut self.path),
            version: std::mem::take(&mut self.version),
            headers: std::mem::take(&mut self.headers),
            host: self.host.take(),
            content_length: self.content_length,
            keep_alive: self.keep_alive,
            body,
        }
    }
}

fn parse_request_line(line: &[u8]) -> Result<(Method, String, String), ParseError> {
    let mut parts = line
        .split(|b| *b == b' ' || *b == b'\t')
        .filter(|p| !p.is_empty());
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseError::BadRequestLine);
    };

    let method = Method::from_bytes(method).ok_or(ParseError::UnsupportedMethod)?;
    if !version.eq_ignore_ascii_case(b"HTTP/1.1") {
        return Err(ParseError::UnsupportedVersion);
    }

    let target = std::str::from_utf8(target).map_err(|_| ParseError::BadRequestLine)?;
    let path = normalize_target(target).ok_or(ParseError::BadTarget)?;
    Ok((method, path, "HTTP/1.1".to_owned()))
}

/// Strip an absolute-form scheme and authority, then map `/` to the
/// default document.
fn normalize_target(target: &str) -> Option<String> {
    let mut rest = target;
    for scheme in ["http://", "https://"] {
        if rest
            .get(..scheme.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(scheme))
        {
            let after = &rest[scheme.len()..];
            rest = &after[after.find('/')?..];
            break;
        }
    }
    if !rest.starts_with('/') {
        return None;
    }
    if rest == "/" {
        return Some(DEFAULT_DOCUMENT.to_owned());
    }
    Some(rest.to_owned())
}

enum HeaderLine {
    Field(String, String),
    Skipped,
    /// The blank line that ends the header block.
    End,
}

fn parse_header(line: &[u8]) -> Result<HeaderLine, ParseError> {
    if line.is_empty() {
        return Ok(HeaderLine::End);
    }
    let line = std::str::from_utf8(line).map_err(|_| ParseError::MalformedLine)?;
    match line.split_once(':') {
        Some((name, value)) => Ok(HeaderLine::Field(
            name.trim().to_ascii_lowercase(),
            value.trim_matches(|c| c == ' ' || c == '\t').to_owned(),
        )),
        None => {
            debug!(line, "header without a colon ignored");
            Ok(HeaderLine::Skipped)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POST: &[u8] = b"POST /2CGISQL.cgi HTTP/1.1\r\n\
Host: localhost:9006\r\n\
Connection: keep-alive\r\n\
Content-Length: 23\r\n\
\r\n\
user=alice&passwd=abcde";

    fn parse_all(bytes: &[u8]) -> Result<Request, ParseError> {
        let mut p = RequestParser::new();
        p.feed(bytes);
        p.parse()
    }

    #[test]
    fn bare_slash_maps_to_default_document() {
        let req = parse_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, DEFAULT_DOCUMENT);
        assert!(!req.keep_alive);
        assert!(req.body.is_empty());
    }

    #[test]
    fn wrong_version_is_rejected() {
        assert_eq!(
            parse_all(b"GET /x HTTP/1.0\r\nHost: a\r\n\r\n"),
            Err(ParseError::UnsupportedVersion)
        );
    }

    #[test]
    fn request_line_errors() {
        assert_eq!(
            parse_all(b"PUT /x HTTP/1.1\r\n\r\n"),
            Err(ParseError::UnsupportedMethod)
        );
        assert_eq!(
            parse_all(b"GET HTTP/1.1\r\n\r\n"),
            Err(ParseError::BadRequestLine)
        );
        assert_eq!(
            parse_all(b"GET index.html HTTP/1.1\r\n\r\n"),
            Err(ParseError::BadTarget)
        );
        assert_eq!(
            parse_all(b"GET /a\rb HTTP/1.1\r\n\r\n"),
            Err(ParseError::MalformedLine)
        );
        assert_eq!(parse_all(b"GET /a HTTP/1.1\n\n"), Err(ParseError::MalformedLine));
    }

    #[test]
    fn absolute_form_target_keeps_only_the_path() {
        let req = parse_all(b"get HTTP://example.com/picture.html http/1.1\r\n\r\n").unwrap();
        assert_eq!(req.path, "/picture.html");
        let req = parse_all(b"GET https://example.com/ HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.path, DEFAULT_DOCUMENT);
    }

    #[test]
    fn body_waits_for_content_length() {
        let split = POST.len() - 5;
        let mut p = RequestParser::new();
        p.feed(&POST[..split]);
        assert_eq!(p.parse(), Err(ParseError::Incomplete));
        assert_eq!(p.state(), CheckState::Body);

        p.feed(&POST[split..]);
        let req = p.parse().unwrap();
        assert_eq!(req.method, Method::Post);
        assert_eq!(req.content_length, 23);
        assert_eq!(req.body, b"user=alice&passwd=abcde");
        assert!(req.keep_alive);
        assert_eq!(req.host.as_deref(), Some("localhost:9006"));
        assert_eq!(req.header("Content-Length"), Some("23"));
    }

    #[test]
    fn any_split_yields_the_same_request() {
        let whole = parse_all(POST).unwrap();
        for chunk in 1..8 {
            let mut p = RequestParser::new();
            let mut result = Err(ParseError::Incomplete);
            for piece in POST.chunks(chunk) {
                assert_eq!(result, Err(ParseError::Incomplete));
                p.feed(piece);
                result = p.parse();
            }
            assert_eq!(result.as_ref(), Ok(&whole), "chunk size {chunk}");
        }
    }

    #[test]
    fn unknown_headers_are_ignored() {
        let req = parse_all(b"GET /a HTTP/1.1\r\nX-Thing: 1\r\nnocolon\r\n\r\n").unwrap();
        assert_eq!(req.path, "/a");
        assert_eq!(req.header("x-thing"), Some("1"));
    }

    #[test]
    fn bad_content_length() {
        assert_eq!(
            parse_all(b"POST /a HTTP/1.1\r\nContent-Length: lots\r\n\r\n"),
            Err(ParseError::BadContentLength)
        );
        assert_eq!(
            parse_all(b"POST /a HTTP/1.1\r\nContent-Length: 99999\r\n\r\n"),
            Err(ParseError::TooLarge)
        );
    }

    #[test]
    fn full_buffer_without_a_line_is_too_large() {
        let mut p = RequestParser::new();
        let junk = vec![b'a'; READ_BUF_SIZE + 10];
        assert_eq!(p.feed(&junk), READ_BUF_SIZE);
        assert!(p.is_full());
        assert_eq!(p.parse(), Err(ParseError::TooLarge));
    }

    #[test]
    fn reset_allows_a_second_request() {
        let mut p = RequestParser::new();
        p.feed(b"GET /one HTTP/1.1\r\n\r\n");
        assert_eq!(p.parse().unwrap().path, "/one");
        assert_eq!(p.parse(), Err(ParseError::Internal));

        p.reset();
        assert_eq!(p.filled(), 0);
        p.feed(b"GET /two HTTP/1.1\r\n\r\n");
        assert_eq!(p.parse().unwrap().path, "/two");
    }
}
