// src/credentials.rs
use crate::error::{EtudeError, EtudeResult};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info};

/// Backing store for user accounts, read once at startup and appended to
/// on registration.
pub trait CredentialStore: Send + Sync {
    /// Every (username, password) pair in the store.
    fn load_all(&self) -> EtudeResult<Vec<(String, String)>>;

    /// Persist a new account.
    fn insert(&self, user: &str, password: &str) -> EtudeResult<()>;
}

// ── In-Memory Store ──

/// Store that lives only as long as the process. Good for tests and the default setup.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<(String, String)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users<I, U, P>(users: I) -> Self
    where
        I: IntoIterator<Item = (U, P)>,
        U: Into<String>,
        P: Into<String>,
    {
        Self {
            rows: Mutex::new(
                users
                    .into_iter()
                    .map(|(u, p)| (u.into(), p.into()))
                    .collect(),
            ),
        }
    }
}

impl CredentialStore for MemoryStore {
    fn load_all(&self) -> EtudeResult<Vec<(String, String)>> {
        Ok(self
            .rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn insert(&self, user: &str, password: &str) -> EtudeResult<()> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((user.to_owned(), password.to_owned()));
        Ok(())
    }
}

// ── File Store ──

/// Accounts kept as `user\tpassword` lines in a plain text file.
pub struct FileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

impl CredentialStore for FileStore {
    fn load_all(&self) -> EtudeResult<Vec<(String, String)>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut rows = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            match line.split_once('\t') {
                Some((user, password)) if !user.is_empty() => {
                    rows.push((user.to_owned(), password.to_owned()))
                }
                _ => debug!(line, "skipping malformed credential line"),
            }
        }
        Ok(rows)
    }

    fn insert(&self, user: &str, password: &str) -> EtudeResult<()> {
        if user.contains(['\t', '\n']) || password.contains(['\t', '\n']) {
            return Err(EtudeError::Credentials(
                "user names and passwords may not contain tabs or newlines".into(),
            ));
        }
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{user}\t{password}")?;
        Ok(())
    }
}

// ── Cache ──

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("user name is already taken")]
    Taken,
    #[error(transparent)]
    Store(#[from] EtudeError),
}

/// In-memory view of every account, shared as `Arc<CredentialCache>`.
pub struct CredentialCache {
    users: Mutex<HashMap<String, String>>,
    store: Box<dyn CredentialStore>,
}

impl CredentialCache {
    /// Fill the cache from `store`.
    pub fn load(store: Box<dyn CredentialStore>) -> EtudeResult<Self> {
        let users: HashMap<String, String> = store.load_all()?.into_iter().collect();
        info!(users = users.len(), "credential cache loaded");
        Ok(Self {
            users: Mutex::new(users),
            store,
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.users.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lookup(&self, user: &str) -> Option<String> {
        self.lock().get(user).cloned()
    }

    pub fn verify(&self, user: &str, password: &str) -> bool {
        self.lock().get(user).is_some_and(|p| p == password)
    }

    /// Add an account. The backing store is written first; the cache only
    /// changes once it has accepted the row.
    pub fn register(&self, user: &str, password: &str) -> Result<(), RegisterError> {
        let mut users = self.lock();
        if users.contains_key(user) {
            return Err(RegisterError::Taken);
        }
        self.store.insert(user, password)?;
        users.insert(user.to_owned(), password.to_owned());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenStore;

    impl CredentialStore for BrokenStore {
        fn load_all(&self) -> EtudeResult<Vec<(String, String)>> {
            Ok(Vec::new())
        }

        fn insert(&self, _: &str, _: &str) -> EtudeResult<()> {
            Err(EtudeError::Credentials("read-only".into()))
        }
    }

    #[test]
    fn register_then_lookup() {
        let cache = CredentialCache::load(Box::new(MemoryStore::new())).unwrap();
        cache.register("alice", "secret").unwrap();
        assert_eq!(cache.lookup("alice").as_deref(), Some("secret"));
        assert!(cache.verify("alice", "secret"));
        assert!(!cache.verify("alice", "nope"));

        assert!(matches!(
            cache.register("alice", "other"),
            Err(RegisterError::Taken)
        ));
        assert_eq!(cache.len(), 1);
        assert!(cache.verify("alice", "secret"));
    }

    #[test]
    fn store_failure_leaves_cache_untouched() {
        let cache = CredentialCache::load(Box::new(BrokenStore)).unwrap();
        assert!(matches!(
            cache.register("bob", "pw"),
            Err(RegisterError::Store(_))
        ));
        assert!(cache.is_empty());
        assert_eq!(cache.lookup("bob"), None);
    }

    #[test]
    fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.tsv");
        std::fs::write(&path, "carol\tpw1\nbroken line\n").unwrap();

        let cache = CredentialCache::load(Box::new(FileStore::new(&path))).unwrap();
        assert!(cache.verify("carol", "pw1"));
        cache.register("dave", "pw2").unwrap();

        let reloaded = FileStore::new(&path).load_all().unwrap();
        assert_eq!(
            reloaded,
            vec![
                ("carol".to_owned(), "pw1".to_owned()),
                ("dave".to_owned(), "pw2".to_owned()),
            ]
        );
    }

    #[test]
    fn memory_store_seeds_the_cache() {
        let cache =
            CredentialCache::load(Box::new(MemoryStore::with_users([("erin", "pw")]))).unwrap();
        assert!(cache.verify("erin", "pw"));
        assert_eq!(cache.len(), 1);
    }
}
