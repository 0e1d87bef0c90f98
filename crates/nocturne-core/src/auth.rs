// src/auth.rs

/// Credential backend consulted for login and registration form posts.
///
/// Called synchronously on a worker thread while the request is being parsed,
/// so its latency is part of the request's latency.
pub trait Authenticator: Send + Sync {
    /// `is_login == true` checks existing credentials; `false` registers a new
    /// user. Returns whether the operation succeeded.
    fn verify(&self, username: &str, password: &str, is_login: bool) -> bool;
}

impl<F> Authenticator for F
where
    F: Fn(&str, &str, bool) -> bool + Send + Sync,
{
    fn verify(&self, username: &str, password: &str, is_login: bool) -> bool {
        self(username, password, is_login)
    }
}

/// Backend that refuses every login and registration.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectAll;

impl Authenticator for RejectAll {
    fn verify(&self, _username: &str, _password: &str, _is_login: bool) -> bool {
        false
    }
}
