// src/server.rs
use crate::config::Config;
use crate::credentials::{CredentialCache, CredentialStore, FileStore, MemoryStore};
use crate::dispatcher::{Dispatcher, STOP, TICK};
use crate::error::{EtudeError, EtudeResult};
use crate::router::Router;
use crate::syscalls::{self, Notifier, PipeReader};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct Server {
    config: Config,
    store: Option<Box<dyn CredentialStore>>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: None,
        }
    }

    /// Back the account cache with `store` instead of the configured one.
    pub fn with_store(mut self, store: Box<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Validate the configuration, open the listener and load accounts.
    pub fn bind(self) -> EtudeResult<BoundServer> {
        let Server { config, store } = self;
        config.validate()?;

        let cores = num_cpus::get();
        if config.pin_workers && config.threads > cores {
            warn!(
                threads = config.threads,
                cores, "more workers than cores, some will share a core"
            );
        }

        let store: Box<dyn CredentialStore> = match (store, &config.users_file) {
            (Some(store), _) => store,
            (None, Some(path)) => Box::new(FileStore::new(path)),
            (None, None) => Box::new(MemoryStore::new()),
        };
        let credentials = Arc::new(CredentialCache::load(store)?);

        let addr = config.listen_addr()?;
        let listener = syscalls::create_listen_socket(addr, config.linger)?;
        let local = syscalls::local_addr(listener.as_raw_fd())?;
        let (signals, notifier) = syscalls::self_pipe()?;
        let router = Router::new(config.doc_root.clone(), credentials);

        info!(addr = %local, root = %config.doc_root.display(), "listening");
        Ok(BoundServer {
            config,
            listener,
            local,
            signals,
            notifier,
            router,
        })
    }

    /// Bind, stop on SIGINT/SIGTERM, and serve until stopped.
    pub fn run(self) -> EtudeResult<()> {
        let bound = self.bind()?;
        let handle = bound.shutdown_handle();
        ctrlc::set_handler(move || {
            info!("termination signal received, shutting down");
            handle.shutdown();
        })
        .map_err(|e| EtudeError::Config(format!("signal handler: {e}")))?;
        bound.run()
    }
}

/// A listening server that has not started its event loop yet.
pub struct BoundServer {
    config: Config,
    listener: OwnedFd,
    local: SocketAddr,
    signals: PipeReader,
    notifier: Notifier,
    router: Router,
}

/// Stops a running server from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    notifier: Notifier,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        if !self.notifier.notify(STOP) {
            debug!("stop signal not delivered, server already gone");
        }
    }
}

impl BoundServer {
    /// Bound address; resolves port 0 to the one the kernel picked.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            notifier: self.notifier.clone(),
        }
    }

    /// Serve until a shutdown is requested. Returns once every worker has
    /// stopped and every connection is closed.
    pub fn run(self) -> EtudeResult<()> {
        let BoundServer {
            config,
            listener,
            signals,
            notifier,
            router,
            ..
        } = self;

        let mut dispatcher = Dispatcher::new(listener, signals, &config, router)?;
        let ticker = Ticker::start(config.timeslot, notifier)?;
        let result = dispatcher.run();
        ticker.stop();

        info!("server shut down");
        result
    }
}

/// Writes `TICK` into the signal pipe once per timer slot.
struct Ticker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Ticker {
    fn start(slot: Duration, notifier: Notifier) -> EtudeResult<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name("etude-ticker".to_string())
            .spawn(move || {
                loop {
                    thread::park_timeout(slot);
                    if flag.load(Ordering::Acquire) {
                        break;
                    }
                    notifier.notify(TICK);
                }
            })?;
        Ok(Self { stop, handle })
    }

    fn stop(self) {
        self.stop.store(true, Ordering::Release);
        self.handle.thread().unpark();
        let _ = self.handle.join();
    }
}
