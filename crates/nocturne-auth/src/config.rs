// src/config.rs
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Number of hasher handles, i.e. concurrent hash computations.
    pub pool_size: usize,
    pub acquire_timeout_ms: u64,
    /// JSON file the users are loaded from and saved to. In-memory only when unset.
    pub users_file: Option<PathBuf>,
    /// Argon2 memory cost in KiB.
    pub memory_kib: u32,
    /// Argon2 time cost.
    pub iterations: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            pool_size: 12,
            acquire_timeout_ms: 500,
            users_file: None,
            memory_kib: argon2::Params::DEFAULT_M_COST,
            iterations: argon2::Params::DEFAULT_T_COST,
        }
    }
}

impl AuthConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}
