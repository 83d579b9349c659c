// src/http.rs
use crate::file::StaticFile;
use std::collections::HashMap;

/// Document served for a bare `/` target.
pub const DEFAULT_DOCUMENT: &str = "/judge.html";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    /// Case-insensitive match against the two supported verbs.
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.eq_ignore_ascii_case(b"GET") {
            Some(Method::Get)
        } else if b.eq_ignore_ascii_case(b"POST") {
            Some(Method::Post)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

/// A fully parsed request. Only produced once the parser reaches a
/// terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub version: String,
    /// Header names are stored lowercased; a repeated header keeps its last value.
    pub headers: HashMap<String, String>,
    pub host: Option<String>,
    pub content_length: usize,
    pub keep_alive: bool,
    pub body: Vec<u8>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    Forbidden,
    NotFound,
    InternalError,
}

impl Status {
    pub fn code(&self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::InternalError => 500,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::InternalError => "Internal Error",
        }
    }

    /// Body text sent with an error status.
    pub fn form(&self) -> &'static str {
        match self {
            Status::Ok => "<html><body></body></html>",
            Status::BadRequest => {
                "Your request has bad syntax or is inherently impossible to satisfy.\n"
            }
            Status::Forbidden => "You do not have permission to get file from this server.\n",
            Status::NotFound => "The requested file was not found on this server.\n",
            Status::InternalError => "There was an unusual problem serving the request file.\n",
        }
    }
}

/// What the router decided for a complete (or failed) request.
#[derive(Debug)]
pub enum Outcome {
    File(StaticFile),
    BadRequest,
    Forbidden,
    NotFound,
    InternalError,
}

impl Outcome {
    pub fn status(&self) -> Status {
        match self {
            Outcome::File(_) => Status::Ok,
            Outcome::BadRequest => Status::BadRequest,
            Outcome::Forbidden => Status::Forbidden,
            Outcome::NotFound => Status::NotFound,
            Outcome::InternalError => Status::InternalError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_matching_ignores_case() {
        assert_eq!(Method::from_bytes(b"GET"), Some(Method::Get));
        assert_eq!(Method::from_bytes(b"post"), Some(Method::Post));
        assert_eq!(Method::from_bytes(b"PUT"), None);
        assert_eq!(Method::Post.as_str(), "POST");
    }

    #[test]
    fn status_lines() {
        assert_eq!(Status::BadRequest.code(), 400);
        assert_eq!(Status::Forbidden.reason(), "Forbidden");
        assert_eq!(Outcome::NotFound.status().code(), 404);
        assert!(Status::InternalError.form().contains("unusual problem"));
    }
}
