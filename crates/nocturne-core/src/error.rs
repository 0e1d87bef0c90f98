// src/error.rs
use crate::parser::ParseError;
use std::io;
use thiserror::Error;

/// Central error type for the nocturne engine.
#[derive(Debug, Error)]
pub enum NocturneError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error during HTTP request parsing.
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Listen port outside the unprivileged range.
    #[error("Port {0} is outside 1024..=65535")]
    InvalidPort(u16),

    /// Connection registry reached its maximum capacity.
    #[error("Connection registry is full")]
    RegistryFull,

    /// A task was submitted after the worker pool shut down.
    #[error("Worker pool is shut down")]
    PoolClosed,

    /// Rejected configuration value.
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type NocturneResult<T> = Result<T, NocturneError>;
