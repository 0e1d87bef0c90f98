// src/error.rs
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("username and password must not be empty")]
    EmptyCredentials,

    #[error("user {0:?} already exists")]
    UserExists(String),

    /// No hasher handle became free within the acquire timeout.
    #[error("no hasher available within {0} ms")]
    PoolExhausted(u64),

    #[error("invalid auth configuration: {0}")]
    Config(String),

    #[error("password hashing failed: {0}")]
    Hash(String),

    #[error("user store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("user store file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

pub type AuthResult<T> = Result<T, AuthError>;
