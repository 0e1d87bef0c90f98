// src/password.rs
use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};

use crate::error::{AuthError, AuthResult};

/// Argon2id hasher with the given memory (KiB) and time cost.
pub fn build_hasher(memory_kib: u32, iterations: u32) -> AuthResult<Argon2<'static>> {
    let params = Params::new(memory_kib, iterations, 1, None)
        .map_err(|e| AuthError::Hash(format!("Invalid argon2 parameters: {}", e)))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Hash a plaintext password into a PHC string.
pub fn hash_password(hasher: &Argon2<'_>, password: &str) -> AuthResult<String> {
    let salt = SaltString::generate(&mut OsRng);

    hasher
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::Hash(format!("Failed to hash password: {}", e)))
}

/// Verify a plaintext password against a stored PHC string. The cost
/// parameters come from the hash itself.
pub fn verify_password(hasher: &Argon2<'_>, password: &str, hash: &str) -> AuthResult<bool> {
    let parsed_hash = PasswordHash::new(hash)
        .map_err(|e| AuthError::Hash(format!("Invalid password hash: {}", e)))?;

    Ok(hasher
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}
