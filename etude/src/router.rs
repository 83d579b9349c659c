// src/router.rs
use crate::credentials::{CredentialCache, RegisterError};
use crate::file::StaticFile;
use crate::http::{Method, Outcome, Request};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Pages the numbered actions lead to.
pub mod pages {
    pub const REGISTER: &str = "/register.html";
    pub const LOGIN: &str = "/log.html";
    pub const WELCOME: &str = "/welcome.html";
    pub const LOGIN_ERROR: &str = "/logError.html";
    pub const REGISTER_ERROR: &str = "/registerError.html";
    pub const PICTURE: &str = "/picture.html";
    pub const VIDEO: &str = "/video.html";
    pub const FANS: &str = "/fans.html";
}

/// Single-character action encoded at the start of the last path segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    RegisterPage,
    LoginPage,
    Login,
    Register,
    Picture,
    Video,
    Fans,
}

impl Action {
    fn from_path(path: &str) -> Option<Self> {
        let last = path.rsplit('/').next()?;
        match last.as_bytes().first()? {
            b'0' => Some(Action::RegisterPage),
            b'1' => Some(Action::LoginPage),
            b'2' => Some(Action::Login),
            b'3' => Some(Action::Register),
            b'5' => Some(Action::Picture),
            b'6' => Some(Action::Video),
            b'7' => Some(Action::Fans),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AccountForm {
    user: String,
    passwd: String,
}

#[derive(Clone)]
pub struct Router {
    doc_root: PathBuf,
    credentials: Arc<CredentialCache>,
}

impl Router {
    pub fn new(doc_root: impl Into<PathBuf>, credentials: Arc<CredentialCache>) -> Self {
        Self {
            doc_root: doc_root.into(),
            credentials,
        }
    }

    /// Decide what a complete request is answered with.
    pub fn resolve(&self, req: &Request) -> Outcome {
        let page = self.page_for(req);
        if page.split('/').any(|seg| seg == "..") {
            warn!(path = %req.path, "rejected path traversal");
            return Outcome::Forbidden;
        }
        StaticFile::resolve(&self.doc_root.join(page.trim_start_matches('/')))
    }

    fn page_for<'a>(&self, req: &'a Request) -> &'a str {
        match Action::from_path(&req.path) {
            Some(Action::RegisterPage) => pages::REGISTER,
            Some(Action::LoginPage) => pages::LOGIN,
            Some(Action::Picture) => pages::PICTURE,
            Some(Action::Video) => pages::VIDEO,
            Some(Action::Fans) => pages::FANS,
            Some(Action::Login) if req.method == Method::Post => self.login(&req.body),
            Some(Action::Register) if req.method == Method::Post => self.register(&req.body),
            _ => req.path.as_str(),
        }
    }

    fn login(&self, body: &[u8]) -> &'static str {
        match serde_urlencoded::from_bytes::<AccountForm>(body) {
            Ok(form) if self.credentials.verify(&form.user, &form.passwd) => {
                info!(user = %form.user, "login accepted");
                pages::WELCOME
            }
            Ok(form) => {
                info!(user = %form.user, "login rejected");
                pages::LOGIN_ERROR
            }
            Err(e) => {
                warn!(error = %e, "undecodable login form");
                pages::LOGIN_ERROR
            }
        }
    }

    fn register(&self, body: &[u8]) -> &'static str {
        let form = match serde_urlencoded::from_bytes::<AccountForm>(body) {
            Ok(form) => form,
            Err(e) => {
                warn!(error = %e, "undecodable registration form");
                return pages::REGISTER_ERROR;
            }
        };
        match self.credentials.register(&form.user, &form.passwd) {
            Ok(()) => {
                info!(user = %form.user, "registered");
                pages::LOGIN
            }
            Err(RegisterError::Taken) => {
                info!(user = %form.user, "user name already taken");
                pages::REGISTER_ERROR
            }
            Err(RegisterError::Store(e)) => {
                warn!(user = %form.user, error = %e, "credential store rejected registration");
                pages::REGISTER_ERROR
            }
        }
    }
}
