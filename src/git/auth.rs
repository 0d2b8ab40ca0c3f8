//! Git authentication configuration
//!
//! This module handles:
//! - Basic-auth credentials resolved from a repository's secret reference
//! - Setting up SSH authentication
//! - Credential helper integration
//!
//! When explicit credentials are configured they are offered first;
//! otherwise authentication falls back to git's native credential system
//! (SSH agent, keys in ~/.ssh/, credential helpers).

use std::cell::Cell;

use git2::{Cred, CredentialType, Error, ErrorClass, RemoteCallbacks};
use serde::{Deserialize, Serialize};

/// How many times libgit2 may ask for credentials before giving up
const MAX_AUTH_ATTEMPTS: u32 = 3;

/// Username and password (or token) for basic auth
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Value of an HTTP `Authorization` header
    pub fn basic_auth_header(&self) -> String {
        use base64::Engine;
        let raw = format!("{}:{}", self.username, self.password);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw)
        )
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

fn auth_failed(message: &str) -> Error {
    Error::new(git2::ErrorCode::Auth, ErrorClass::Http, message)
}

fn try_default_credentials() -> Option<Cred> {
    for username in &["git", "anonymous"] {
        if let Ok(cred) = Cred::userpass_plaintext(username, "") {
            return Some(cred);
        }
    }
    None
}

fn try_ssh_credentials(username: &str) -> std::result::Result<Cred, git2::Error> {
    let home = dirs::home_dir().unwrap_or_default();
    let ssh_dir = home.join(".ssh");

    for key_name in &["id_ed25519", "id_rsa", "id_ecdsa"] {
        let private_key = ssh_dir.join(key_name);
        let public_key = ssh_dir.join(format!("{key_name}.pub"));

        if !private_key.exists() {
            continue;
        }

        let public_key_path = public_key.exists().then_some(public_key.as_path());

        if let Ok(cred) = Cred::ssh_key(username, public_key_path, &private_key, None) {
            return Ok(cred);
        }
    }

    Err(auth_failed("SSH key not found"))
}

fn try_user_pass_credentials(
    url: &str,
    username_from_url: Option<&str>,
) -> std::result::Result<Cred, git2::Error> {
    if let Ok(config) = git2::Config::open_default() {
        if let Ok(cred) = Cred::credential_helper(&config, url, username_from_url) {
            return Ok(cred);
        }
    }

    if let Some(username) = username_from_url {
        if let Ok(cred) = Cred::userpass_plaintext(username, "") {
            return Ok(cred);
        }
    }

    try_default_credentials().ok_or_else(|| auth_failed("authentication failed"))
}

/// Set up authentication callbacks for git operations
///
/// `credentials`, when given, answer user/password challenges. libgit2
/// re-invokes the callback after every rejected attempt, so the number of
/// attempts is bounded to avoid looping against a server that keeps
/// answering 401.
pub fn setup_auth_callbacks<'a>(callbacks: &mut RemoteCallbacks<'a>, credentials: Option<&'a Credentials>) {
    let attempts = Cell::new(0u32);
    callbacks.credentials(move |url, username_from_url, allowed_types| {
        attempts.set(attempts.get() + 1);
        if attempts.get() > MAX_AUTH_ATTEMPTS {
            return Err(auth_failed("authentication failed: credentials rejected"));
        }

        if allowed_types.contains(CredentialType::USER_PASS_PLAINTEXT) {
            if let Some(creds) = credentials {
                return Cred::userpass_plaintext(&creds.username, &creds.password);
            }
        }

        if allowed_types.contains(CredentialType::DEFAULT) {
            return Cred::default();
        }

        if allowed_types.contains(CredentialType::SSH_KEY) {
            return match username_from_url {
                Some(username) => {
                    Cred::ssh_key_from_agent(username).or_else(|_| try_ssh_credentials(username))
                }
                None => try_default_credentials().ok_or_else(|| auth_failed("authentication failed")),
            };
        }

        if allowed_types.contains(CredentialType::USER_PASS_PLAINTEXT) {
            return try_user_pass_credentials(url, username_from_url);
        }

        Err(auth_failed("authentication failed"))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_auth_header() {
        let creds = Credentials::new("porch", "s3cret");
        assert_eq!(creds.basic_auth_header(), "Basic cG9yY2g6czNjcmV0");
    }

    #[test]
    fn test_debug_redacts_password() {
        let creds = Credentials::new("porch", "s3cret");
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("porch"));
        assert!(!rendered.contains("s3cret"));
    }
}
