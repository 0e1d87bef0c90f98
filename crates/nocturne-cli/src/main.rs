use anyhow::Context;
use clap::Parser;
use nocturne_auth::{AuthConfig, UserStore};
use nocturne_core::{Server, ServerConfig, init_logging};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "nocturne")]
#[command(about = "Static file and form-login HTTP server on an epoll reactor")]
#[command(version)]
struct Cli {
    /// TOML file with `[server]`, `[server.log]` and `[auth]` tables
    #[arg(short, long, env = "NOCTURNE_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "NOCTURNE_HOST")]
    host: Option<String>,

    #[arg(short, long, env = "NOCTURNE_PORT")]
    port: Option<u16>,

    /// 0: all level-triggered, 1: connections ET, 2: listener ET, 3: both ET
    #[arg(short = 'm', long, env = "NOCTURNE_TRIGGER_MODE")]
    trigger_mode: Option<u8>,

    /// Idle timeout in milliseconds (0 disables eviction)
    #[arg(long, env = "NOCTURNE_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Close client sockets with SO_LINGER
    #[arg(long, env = "NOCTURNE_LINGER")]
    linger: Option<bool>,

    /// Worker threads
    #[arg(short, long, env = "NOCTURNE_THREADS")]
    threads: Option<usize>,

    #[arg(long, env = "NOCTURNE_MAX_CONNECTIONS")]
    max_connections: Option<usize>,

    /// Concurrent password hash computations
    #[arg(short = 's', long, env = "NOCTURNE_POOL_SIZE")]
    pool_size: Option<usize>,

    /// JSON file holding registered users
    #[arg(long, env = "NOCTURNE_USERS_FILE")]
    users_file: Option<PathBuf>,

    #[arg(short, long, env = "NOCTURNE_DOCUMENT_ROOT")]
    document_root: Option<PathBuf>,

    /// Default filter when RUST_LOG is unset
    #[arg(long, env = "NOCTURNE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Write daily log files into this directory instead of stdout
    #[arg(long, env = "NOCTURNE_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Split a day's log file after this many lines (0 never splits)
    #[arg(long, env = "NOCTURNE_LOG_MAX_LINES")]
    log_max_lines: Option<usize>,

    /// Async log queue depth (0 writes synchronously)
    #[arg(long, env = "NOCTURNE_LOG_QUEUE")]
    log_queue: Option<usize>,

    /// Disable logging
    #[arg(long)]
    no_log: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    server: ServerConfig,
    auth: AuthConfig,
}

impl Cli {
    /// Defaults, then the TOML file, then flags and environment.
    fn load(&self) -> anyhow::Result<FileConfig> {
        let mut cfg = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                toml::from_str(&text)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => FileConfig::default(),
        };
        self.apply(&mut cfg);
        Ok(cfg)
    }

    fn apply(&self, cfg: &mut FileConfig) {
        let server = &mut cfg.server;
        if let Some(host) = &self.host {
            server.host = host.clone();
        }
        if let Some(port) = self.port {
            server.port = port;
        }
        if let Some(mode) = self.trigger_mode {
            server.trigger_mode = mode;
        }
        if let Some(ms) = self.timeout_ms {
            server.timeout_ms = ms;
        }
        if let Some(linger) = self.linger {
            server.linger = linger;
        }
        if let Some(threads) = self.threads {
            server.worker_threads = threads;
        }
        if let Some(max) = self.max_connections {
            server.max_connections = max;
        }
        if let Some(root) = &self.document_root {
            server.document_root = root.clone();
        }
        if let Some(level) = &self.log_level {
            server.log.level = level.clone();
        }
        if let Some(dir) = &self.log_dir {
            server.log.directory = Some(dir.clone());
        }
        if let Some(lines) = self.log_max_lines {
            server.log.max_lines = lines;
        }
        if let Some(depth) = self.log_queue {
            server.log.queue_capacity = depth;
        }
        if self.no_log {
            server.log.enabled = false;
        }

        if let Some(size) = self.pool_size {
            cfg.auth.pool_size = size;
        }
        if let Some(path) = &self.users_file {
            cfg.auth.users_file = Some(path.clone());
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = cli.load()?;
    cfg.server.validate().context("invalid server configuration")?;

    let _log_guard = init_logging(&cfg.server.log)?;

    let store = UserStore::open(&cfg.auth).context("opening user store")?;
    let mut server = Server::new(cfg.server, Arc::new(store)).context("starting server")?;

    let handle = server.shutdown_handle();
    ctrlc::set_handler(move || {
        tracing::info!("signal received, shutting down");
        handle.shutdown();
    })
    .context("installing signal handler")?;

    server.run()?;
    Ok(())
}

fn main() {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("nocturne: {:#}", e);
        std::process::exit(1);
    }
}
