// src/store.rs
use argon2::Argon2;
use nocturne_core::Authenticator;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::config::AuthConfig;
use crate::error::{AuthError, AuthResult};
use crate::password::{build_hasher, hash_password, verify_password};
use crate::pool::{HandlePool, PooledHandle};

#[derive(Debug, Serialize, Deserialize)]
struct UserRecord {
    username: String,
    password_hash: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UsersFile {
    users: Vec<UserRecord>,
}

/// Registered users keyed by name, each with an argon2 PHC hash.
///
/// Hash computations check a hasher out of a fixed [`HandlePool`], which caps
/// how many run at once (and how much memory argon2 may claim). A caller that
/// cannot get a hasher within the acquire timeout fails instead of queueing.
pub struct UserStore {
    users: RwLock<HashMap<String, String>>,
    hashers: HandlePool<Argon2<'static>>,
    acquire_timeout: Duration,
    users_file: Option<PathBuf>,
}

impl UserStore {
    /// Build the store, loading `users_file` when it is configured and exists.
    pub fn open(config: &AuthConfig) -> AuthResult<Self> {
        if config.pool_size == 0 {
            return Err(AuthError::Config("pool_size must be at least 1".to_string()));
        }
        let hashers = HandlePool::try_with(config.pool_size, || {
            build_hasher(config.memory_kib, config.iterations)
        })?;

        let users = match &config.users_file {
            Some(path) => load(path)?,
            None => HashMap::new(),
        };
        tracing::info!(
            users = users.len(),
            hashers = hashers.size(),
            file = ?config.users_file,
            "user store ready"
        );

        Ok(Self {
            users: RwLock::new(users),
            hashers,
            acquire_timeout: config.acquire_timeout(),
            users_file: config.users_file.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, username: &str) -> bool {
        self.read().contains_key(username)
    }

    /// Add a new user and persist the store. On a persistence failure the
    /// user is removed again so memory and disk agree.
    pub fn register(&self, username: &str, password: &str) -> AuthResult<()> {
        if username.is_empty() || password.is_empty() {
            return Err(AuthError::EmptyCredentials);
        }
        if self.contains(username) {
            return Err(AuthError::UserExists(username.to_string()));
        }

        let hash = {
            let hasher = self.hasher()?;
            hash_password(&hasher, password)?
        };

        let mut users = self.write();
        // Another registration may have won while we were hashing.
        if users.contains_key(username) {
            return Err(AuthError::UserExists(username.to_string()));
        }
        users.insert(username.to_string(), hash);

        if let Some(path) = &self.users_file {
            if let Err(e) = save(path, &users) {
                users.remove(username);
                return Err(e);
            }
        }
        tracing::info!(user = username, "registered user");
        Ok(())
    }

    /// Check a password against the stored hash. Unknown users fail.
    pub fn login(&self, username: &str, password: &str) -> AuthResult<bool> {
        if username.is_empty() || password.is_empty() {
            return Err(AuthError::EmptyCredentials);
        }
        let Some(hash) = self.read().get(username).cloned() else {
            return Ok(false);
        };
        let hasher = self.hasher()?;
        verify_password(&hasher, password, &hash)
    }

    fn hasher(&self) -> AuthResult<PooledHandle<'_, Argon2<'static>>> {
        self.hashers
            .acquire(self.acquire_timeout)
            .ok_or(AuthError::PoolExhausted(self.acquire_timeout.as_millis() as u64))
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, String>> {
        self.users.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, String>> {
        self.users.write().unwrap_or_else(|p| p.into_inner())
    }
}

impl Authenticator for UserStore {
    fn verify(&self, username: &str, password: &str, is_login: bool) -> bool {
        let res = if is_login {
            self.login(username, password)
        } else {
            self.register(username, password).map(|()| true)
        };
        match res {
            Ok(ok) => {
                if !ok {
                    tracing::debug!(user = username, "login rejected");
                }
                ok
            }
            Err(AuthError::PoolExhausted(ms)) => {
                tracing::warn!(user = username, waited_ms = ms, "user store busy");
                false
            }
            Err(e @ (AuthError::EmptyCredentials | AuthError::UserExists(_))) => {
                tracing::debug!(user = username, error = %e, "credentials rejected");
                false
            }
            Err(e) => {
                tracing::error!(user = username, is_login, error = %e, "user store failure");
                false
            }
        }
    }
}

fn load(path: &Path) -> AuthResult<HashMap<String, String>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };
    let file: UsersFile = serde_json::from_str(&text)?;
    Ok(file
        .users
        .into_iter()
        .map(|r| (r.username, r.password_hash))
        .collect())
}

/// Write the whole store to a sibling temp file, then rename it into place.
fn save(path: &Path, users: &HashMap<String, String>) -> AuthResult<()> {
    let mut records: Vec<UserRecord> = users
        .iter()
        .map(|(name, hash)| UserRecord {
            username: name.clone(),
            password_hash: hash.clone(),
        })
        .collect();
    records.sort_by(|a, b| a.username.cmp(&b.username));

    let json = serde_json::to_vec_pretty(&UsersFile { users: records })?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, json)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}
