// src/config.rs
use crate::error::{NocturneError, NocturneResult};
use crate::parser::DEFAULT_MAX_REQUEST_BYTES;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Which sockets are registered edge-triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerMode {
    pub listener_edge: bool,
    pub conn_edge: bool,
}

impl TriggerMode {
    /// 0: both level-triggered, 1: connections edge-triggered,
    /// 2: listener edge-triggered, 3: both edge-triggered.
    pub fn from_code(code: u8) -> Option<Self> {
        let (listener_edge, conn_edge) = match code {
            0 => (false, false),
            1 => (false, true),
            2 => (true, false),
            3 => (true, true),
            _ => return None,
        };
        Some(Self {
            listener_edge,
            conn_edge,
        })
    }
}

/// Log sink settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub enabled: bool,
    /// Default filter directive, e.g. `info` or `nocturne_core=debug`.
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Depth of the asynchronous write queue. Zero writes synchronously.
    pub queue_capacity: usize,
    /// Directory for the daily log files. Logs go to stdout when unset.
    pub directory: Option<PathBuf>,
    /// Lines per file before the day's log is split. Zero never splits.
    pub max_lines: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
            queue_capacity: 1024,
            directory: None,
            max_lines: 50_000,
        }
    }
}

/// Server configuration, threaded through the reactor's constructors.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub trigger_mode: u8,
    /// Idle timeout in milliseconds. Zero disables idle eviction.
    pub timeout_ms: u64,
    /// Close accepted sockets with `SO_LINGER`.
    pub linger: bool,
    pub worker_threads: usize,
    pub max_connections: usize,
    /// Events collected per multiplexer wait.
    pub max_events: usize,
    pub max_request_bytes: usize,
    pub document_root: PathBuf,
    pub log: LogConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 1316,
            trigger_mode: 3,
            timeout_ms: 60_000,
            linger: false,
            worker_threads: num_cpus::get(),
            max_connections: 65_536,
            max_events: 1024,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            document_root: PathBuf::from("./resources"),
            log: LogConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> NocturneResult<()> {
        if self.port < 1024 {
            return Err(NocturneError::InvalidPort(self.port));
        }
        if TriggerMode::from_code(self.trigger_mode).is_none() {
            return Err(NocturneError::Config(format!(
                "trigger_mode must be 0..=3, got {}",
                self.trigger_mode
            )));
        }
        if self.worker_threads == 0 {
            return Err(NocturneError::Config("worker_threads must be at least 1".into()));
        }
        if self.max_connections == 0 || self.max_events == 0 || self.max_request_bytes == 0 {
            return Err(NocturneError::Config(
                "max_connections, max_events and max_request_bytes must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn trigger(&self) -> TriggerMode {
        TriggerMode::from_code(self.trigger_mode).unwrap_or(TriggerMode {
            listener_edge: true,
            conn_edge: true,
        })
    }

    /// `None` when idle eviction is disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}
