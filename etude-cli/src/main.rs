use anyhow::{Context, Result, bail};
use clap::Parser;
use etude::config::parse_actor;
use etude::{Config, Server, init_logging};
use std::path::PathBuf;
use tracing::info;

/// Flags override `ETUDE_*` environment variables and `.env`.
#[derive(Parser)]
#[command(name = "etude")]
#[command(about = "Event-driven HTTP/1.1 static file server")]
#[command(version)]
struct Cli {
    /// Listen port
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Log write mode: 0 synchronous, 1 asynchronous
    #[arg(short = 'l', long = "log-write", value_parser = clap::value_parser!(u8).range(0..=1))]
    log_write: Option<u8>,

    /// Trigger mode: 0 LT+LT, 1 LT+ET, 2 ET+LT, 3 ET+ET
    #[arg(short = 'm', long = "trig-mode", value_parser = clap::value_parser!(u8).range(0..=3))]
    trig_mode: Option<u8>,

    /// Graceful close with SO_LINGER: 0 off, 1 on
    #[arg(short = 'o', long = "linger", value_parser = clap::value_parser!(u8).range(0..=1))]
    linger: Option<u8>,

    /// Worker threads
    #[arg(short = 't', long)]
    threads: Option<usize>,

    /// Close the log: 0 keep logging, 1 no logging
    #[arg(short = 'c', long = "close-log", value_parser = clap::value_parser!(u8).range(0..=1))]
    close_log: Option<u8>,

    /// Actor model: 0 proactor, 1 reactor
    #[arg(short = 'a', long)]
    actor: Option<String>,

    /// Document root
    #[arg(long)]
    root: Option<PathBuf>,

    /// Write logs into this directory instead of stdout
    #[arg(long = "log-dir")]
    log_dir: Option<PathBuf>,
}

impl Cli {
    fn apply(self, config: &mut Config) -> Result<()> {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(mode) = self.log_write {
            config.log.async_write = mode == 1;
        }
        if let Some(mode) = self.trig_mode {
            config.trig_mode = mode;
        }
        if let Some(linger) = self.linger {
            config.linger = linger == 1;
        }
        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if let Some(close) = self.close_log {
            config.log.close_log = close == 1;
        }
        if let Some(actor) = self.actor {
            match parse_actor(&actor) {
                Some(actor) => config.actor = actor,
                None => bail!("unknown actor model {actor:?}, expected 0 or 1"),
            }
        }
        if let Some(root) = self.root {
            config.doc_root = root;
        }
        if let Some(dir) = self.log_dir {
            config.log.dir = Some(dir);
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env();
    cli.apply(&mut config)?;

    let _guard = init_logging(&config.log).context("failed to start logging")?;
    info!(
        port = config.port,
        trig_mode = config.trig_mode,
        actor = ?config.actor,
        threads = config.threads,
        root = %config.doc_root.display(),
        "starting etude"
    );

    Server::new(config).run().context("server failed")?;
    Ok(())
}
