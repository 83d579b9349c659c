// src/lib.rs
pub mod config;
pub mod conn;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod file;
pub mod http;
pub mod logging;
pub mod parser;
pub mod pool;
pub mod queue;
pub mod router;
pub mod server;
pub mod slab;
pub mod syscalls;
pub mod timer;

// Re-exports for users
pub use config::Config;
pub use credentials::{CredentialCache, CredentialStore, FileStore, MemoryStore};
pub use error::{EtudeError, EtudeResult};
pub use http::{Method, Outcome, Request, Status};
pub use logging::{LogConfig, LogGuard, init_logging};
pub use pool::Actor;
pub use queue::BoundedQueue;
pub use router::Router;
pub use server::{BoundServer, Server, ShutdownHandle};
pub use timer::{TimerId, TimerLedger};
