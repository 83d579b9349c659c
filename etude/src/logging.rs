// src/logging.rs
//! Logging and tracing initialization.
//!
//! Events go through `tracing`. Without a log directory they are printed to
//! stdout; with one they are appended to a daily file named
//! `YYYY_MM_DD_<name>`, which is split into `.1`, `.2`, ... parts every
//! `split_lines` lines.
//!
//! In asynchronous mode formatted lines are pushed onto a
//! [`BoundedQueue`] and a background `etude-log` thread appends them. When
//! the queue is full the producing thread writes the line itself.
//!
//! The filter honours `RUST_LOG` and falls back to the configured level:
//!
//! ```bash
//! RUST_LOG=etude=debug etude -p 9006
//! ```

use crate::error::{EtudeError, EtudeResult};
use crate::queue::BoundedQueue;
use chrono::{Local, NaiveDate};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Turn logging off completely (default: false)
    pub close_log: bool,
    /// Fallback filter when `RUST_LOG` is unset (default: info)
    pub level: String,
    /// Log directory; stdout when unset.
    pub dir: Option<PathBuf>,
    /// Suffix of the daily file name (default: ServerLog)
    pub file_name: String,
    /// Lines per file part (default: 800000)
    pub split_lines: u64,
    /// Hand lines to a background writer (default: false)
    pub async_write: bool,
    /// Lines the background writer may fall behind by (default: 2000)
    pub queue_capacity: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            close_log: false,
            level: "info".to_string(),
            dir: None,
            file_name: "ServerLog".to_string(),
            split_lines: 800_000,
            async_write: false,
            queue_capacity: 2000,
        }
    }
}

/// Local wall-clock timestamps with microseconds.
struct LocalTime;

impl FormatTime for LocalTime {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%d %H:%M:%S%.6f"))
    }
}

// ── Daily file ──

/// Append-only log file that rolls over on a new day and every
/// `split_lines` lines.
pub struct LogFile {
    dir: PathBuf,
    name: String,
    split_lines: u64,
    today: NaiveDate,
    count: u64,
    path: PathBuf,
    file: File,
}

fn part_path(dir: &Path, name: &str, date: NaiveDate, part: u64) -> PathBuf {
    let base = format!("{}_{}", date.format("%Y_%m_%d"), name);
    if part == 0 {
        dir.join(base)
    } else {
        dir.join(format!("{base}.{part}"))
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl LogFile {
    pub fn open(dir: impl Into<PathBuf>, name: &str, split_lines: u64) -> io::Result<Self> {
        Self::open_on(dir.into(), name, split_lines, Local::now().date_naive())
    }

    fn open_on(dir: PathBuf, name: &str, split_lines: u64, today: NaiveDate) -> io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let path = part_path(&dir, name, today, 0);
        let file = open_append(&path)?;
        Ok(Self {
            dir,
            name: name.to_string(),
            split_lines: split_lines.max(1),
            today,
            count: 0,
            path,
            file,
        })
    }

    /// File currently being appended to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        self.write_on(Local::now().date_naive(), line)
    }

    fn write_on(&mut self, date: NaiveDate, line: &[u8]) -> io::Result<()> {
        self.count += 1;
        if date != self.today {
            self.today = date;
            self.count = 0;
            self.roll(part_path(&self.dir, &self.name, date, 0))?;
        } else if self.count % self.split_lines == 0 {
            let part = self.count / self.split_lines;
            self.roll(part_path(&self.dir, &self.name, date, part))?;
        }
        self.file.write_all(line)
    }

    fn roll(&mut self, path: PathBuf) -> io::Result<()> {
        self.file.flush()?;
        self.file = open_append(&path)?;
        self.path = path;
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

// ── Sink ──

struct SinkInner {
    file: Mutex<LogFile>,
    queue: Option<Arc<BoundedQueue<Vec<u8>>>>,
}

impl SinkInner {
    fn submit(&self, line: Vec<u8>) {
        let line = match &self.queue {
            Some(queue) => match queue.push(line) {
                Ok(()) => return,
                Err(line) => line,
            },
            None => line,
        };
        self.write_now(&line);
    }

    fn write_now(&self, line: &[u8]) {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = file.write_line(line) {
            eprintln!("etude: failed to write log line: {e}");
        }
    }
}

/// `MakeWriter` handing each formatted event to the log file.
#[derive(Clone)]
pub struct FileSink {
    inner: Arc<SinkInner>,
}

/// One event's bytes; submitted as a unit when dropped.
pub struct EventBuffer {
    buf: Vec<u8>,
    sink: Arc<SinkInner>,
}

impl Write for EventBuffer {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for EventBuffer {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            self.sink.submit(std::mem::take(&mut self.buf));
        }
    }
}

impl<'a> MakeWriter<'a> for FileSink {
    type Writer = EventBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        EventBuffer {
            buf: Vec::with_capacity(256),
            sink: self.inner.clone(),
        }
    }
}

impl FileSink {
    /// Open the log file and, in asynchronous mode, start the writer thread.
    pub fn open(config: &LogConfig, dir: &Path) -> EtudeResult<(Self, LogGuard)> {
        let file = LogFile::open(dir, &config.file_name, config.split_lines)?;
        let queue = if config.async_write && config.queue_capacity > 0 {
            Some(Arc::new(BoundedQueue::new(config.queue_capacity)?))
        } else {
            None
        };
        let inner = Arc::new(SinkInner {
            file: Mutex::new(file),
            queue: queue.clone(),
        });

        let writer = match &queue {
            Some(queue) => {
                let queue = queue.clone();
                let sink = inner.clone();
                Some(
                    thread::Builder::new()
                        .name("etude-log".to_string())
                        .spawn(move || {
                            while let Some(line) = queue.pop() {
                                sink.write_now(&line);
                            }
                        })?,
                )
            }
            None => None,
        };

        let guard = LogGuard {
            queue,
            writer,
            sink: Some(inner.clone()),
        };
        Ok((Self { inner }, guard))
    }
}

/// Keeps the log writer alive. Dropping it drains the queue and flushes the file.
#[must_use = "dropping the guard stops the log writer"]
pub struct LogGuard {
    queue: Option<Arc<BoundedQueue<Vec<u8>>>>,
    writer: Option<JoinHandle<()>>,
    sink: Option<Arc<SinkInner>>,
}

impl LogGuard {
    fn inert() -> Self {
        Self {
            queue: None,
            writer: None,
            sink: None,
        }
    }
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.take() {
            queue.close();
        }
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
        if let Some(sink) = self.sink.take() {
            let _ = sink
                .file
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .flush();
        }
    }
}

/// Install the global subscriber. Call once, before starting the server.
pub fn init_logging(config: &LogConfig) -> EtudeResult<LogGuard> {
    if config.close_log {
        return Ok(LogGuard::inert());
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match &config.dir {
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_timer(LocalTime))
                .try_init()
                .map_err(|e| EtudeError::Config(format!("logging: {e}")))?;
            Ok(LogGuard::inert())
        }
        Some(dir) => {
            let (sink, guard) = FileSink::open(config, dir)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_timer(LocalTime)
                        .with_writer(sink),
                )
                .try_init()
                .map_err(|e| EtudeError::Config(format!("logging: {e}")))?;
            Ok(guard)
        }
    }
}
