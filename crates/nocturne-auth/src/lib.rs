// src/lib.rs
//! Credential backend for the nocturne server: argon2-hashed users kept in
//! memory, optionally persisted to a JSON file, with hashing bounded by a
//! fixed pool of hasher handles.

pub mod config;
pub mod error;
pub mod password;
pub mod pool;
pub mod store;

pub use config::AuthConfig;
pub use error::{AuthError, AuthResult};
pub use pool::{HandlePool, PooledHandle};
pub use store::UserStore;
