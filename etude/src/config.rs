// src/config.rs
use crate::error::{EtudeError, EtudeResult};
use crate::logging::LogConfig;
use crate::pool::Actor;
use crate::syscalls::Trigger;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Idle connections are evicted after this many timer slots.
pub const IDLE_SLOTS: u32 = 3;

/// Server configuration, loaded from `ETUDE_*` environment variables (with
/// `.env` support) and then overridden by command-line flags.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address (default: 0.0.0.0)
    pub host: String,

    /// Listen port (default: 9006)
    pub port: u16,

    /// Directory documents are served from (default: ./root)
    pub doc_root: PathBuf,

    /// Trigger combination for (listener, connections):
    /// 0 = LT+LT, 1 = LT+ET, 2 = ET+LT, 3 = ET+ET.
    pub trig_mode: u8,

    /// Who performs socket I/O (default: proactor)
    pub actor: Actor,

    /// Worker threads (default: 8)
    pub threads: usize,

    /// Task queue slots (default: 10000)
    pub queue_capacity: usize,

    /// Simultaneous connections before new ones are turned away (default: 65536)
    pub max_connections: usize,

    /// Sweep cadence; idle timeout is `IDLE_SLOTS` of these (default: 5s)
    pub timeslot: Duration,

    /// Graceful close with SO_LINGER on the listener (default: off)
    pub linger: bool,

    /// Pin worker threads to CPU cores (default: off)
    pub pin_workers: bool,

    /// Tab-separated account file; accounts live in memory when unset.
    pub users_file: Option<PathBuf>,

    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9006,
            doc_root: PathBuf::from("./root"),
            trig_mode: 0,
            actor: Actor::Proactor,
            threads: 8,
            queue_capacity: 10_000,
            max_connections: 65_536,
            timeslot: Duration::from_secs(5),
            linger: false,
            pin_workers: false,
            users_file: None,
            log: LogConfig::default(),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "on"),
        Err(_) => default,
    }
}

/// `0`/`proactor` or `1`/`reactor`.
pub fn parse_actor(s: &str) -> Option<Actor> {
    match s.trim().to_lowercase().as_str() {
        "0" | "proactor" => Some(Actor::Proactor),
        "1" | "reactor" => Some(Actor::Reactor),
        _ => None,
    }
}

impl Config {
    /// Load configuration from environment variables (with .env support).
    pub fn from_env() -> Self {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();

        let d = Config::default();
        Config {
            host: std::env::var("ETUDE_HOST").unwrap_or(d.host),
            port: env_or("ETUDE_PORT", d.port),
            doc_root: std::env::var("ETUDE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(d.doc_root),
            trig_mode: env_or("ETUDE_TRIG_MODE", d.trig_mode),
            actor: std::env::var("ETUDE_ACTOR")
                .ok()
                .and_then(|v| parse_actor(&v))
                .unwrap_or(d.actor),
            threads: env_or("ETUDE_THREADS", d.threads),
            queue_capacity: env_or("ETUDE_QUEUE_CAPACITY", d.queue_capacity),
            max_connections: env_or("ETUDE_MAX_CONNECTIONS", d.max_connections),
            timeslot: Duration::from_secs(env_or("ETUDE_TIMESLOT_SECS", d.timeslot.as_secs())),
            linger: env_flag("ETUDE_LINGER", d.linger),
            pin_workers: env_flag("ETUDE_PIN_WORKERS", d.pin_workers),
            users_file: std::env::var("ETUDE_USERS_FILE").ok().map(PathBuf::from),
            log: LogConfig {
                close_log: env_flag("ETUDE_CLOSE_LOG", d.log.close_log),
                level: std::env::var("ETUDE_LOG_LEVEL").unwrap_or(d.log.level),
                dir: std::env::var("ETUDE_LOG_DIR").ok().map(PathBuf::from),
                file_name: std::env::var("ETUDE_LOG_NAME").unwrap_or(d.log.file_name),
                split_lines: env_or("ETUDE_LOG_SPLIT_LINES", d.log.split_lines),
                async_write: env_flag("ETUDE_LOG_ASYNC", d.log.async_write),
                queue_capacity: env_or("ETUDE_LOG_QUEUE", d.log.queue_capacity),
            },
        }
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> EtudeResult<()> {
        if self.threads == 0 {
            return Err(EtudeError::Config("threads must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(EtudeError::Config("queue capacity must be at least 1".into()));
        }
        if self.max_connections == 0 {
            return Err(EtudeError::Config("max connections must be at least 1".into()));
        }
        if self.timeslot.is_zero() {
            return Err(EtudeError::Config("timer slot must be positive".into()));
        }
        if self.trig_mode > 3 {
            return Err(EtudeError::Config(format!(
                "trigger mode {} is not one of 0-3",
                self.trig_mode
            )));
        }
        self.listen_addr()?;
        Ok(())
    }

    /// (listener, connection) trigger modes.
    pub fn triggers(&self) -> (Trigger, Trigger) {
        match self.trig_mode {
            0 => (Trigger::Level, Trigger::Level),
            1 => (Trigger::Level, Trigger::Edge),
            2 => (Trigger::Edge, Trigger::Level),
            _ => (Trigger::Edge, Trigger::Edge),
        }
    }

    pub fn listen_addr(&self) -> EtudeResult<SocketAddr> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| EtudeError::Config(format!("invalid host {:?}", self.host)))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn idle_timeout(&self) -> Duration {
        self.timeslot * IDLE_SLOTS
    }
}
