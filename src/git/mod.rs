//! Git operations for package repositories
//!
//! This module handles:
//! - Maintaining bare mirrors of registered repositories
//! - Fetching all branches and tags with pruning
//! - Pushing ref updates and deletions, reporting per-ref rejections
//! - Authentication via explicit credentials or git's native system
//!
//! All operations are blocking and honor a [`CancellationToken`]: fetches
//! abort from the transfer-progress callback, pushes check the token before
//! any network I/O.

pub mod auth;
pub mod objects;
pub mod refs;
pub mod url;

use std::cell::RefCell;
use std::path::Path;

use git2::{
    AutotagOption, ErrorClass, FetchOptions, FetchPrune, PushOptions, RemoteCallbacks, Repository,
    Signature,
};

pub use auth::Credentials;

use crate::cancel::CancellationToken;
use crate::error::{PorchError, Result};

/// Refspecs mirroring every branch and tag
pub const MIRROR_REFSPECS: [&str; 2] = ["+refs/heads/*:refs/heads/*", "+refs/tags/*:refs/tags/*"];

/// Interpret a git2 error and provide a more user-friendly message
pub fn interpret_git_error(err: &git2::Error) -> String {
    let class = err.class();
    let message = err.message().to_lowercase();

    if message.contains("not found") || message.contains("404") {
        "Repository not found".to_string()
    } else if message.contains("too many redirects") || message.contains("authentication replays") {
        "Repository not found".to_string()
    } else if message.contains("authentication") || message.contains("credentials") || message.contains("401") {
        "Authentication failed".to_string()
    } else if message.contains("permission denied") || message.contains("access denied") {
        "Permission denied".to_string()
    } else if message.contains("connection")
        || message.contains("network")
        || message.contains("timeout")
        || message.contains("timed out")
    {
        format!("Network error: {}", err.message())
    } else if class == ErrorClass::Http {
        if message.contains("certificate") {
            "Certificate error".to_string()
        } else if message.contains("ssl") {
            "SSL error".to_string()
        } else {
            format!("HTTP error: {}", err.message())
        }
    } else if class == ErrorClass::Ssh {
        format!("SSH error: {}", err.message())
    } else {
        err.message().to_string()
    }
}

/// Open an existing repository
pub fn open(path: &Path) -> Result<Repository> {
    Repository::open(path).map_err(|e| PorchError::GitOpenFailed {
        path: path.display().to_string(),
        reason: e.message().to_string(),
    })
}

/// Open a bare repository, creating it when missing
pub fn open_or_init_bare(path: &Path) -> Result<Repository> {
    if path.join("HEAD").exists() {
        return open(path);
    }
    std::fs::create_dir_all(path)
        .map_err(|e| crate::file_error_context!("Failed to create directory", path.display(), e))?;
    Repository::init_bare(path).map_err(|e| PorchError::GitOpenFailed {
        path: path.display().to_string(),
        reason: e.message().to_string(),
    })
}

/// Committer identity
pub fn signature(name: &str, email: &str) -> Result<Signature<'static>> {
    Ok(Signature::now(name, email)?)
}

/// Translate a failed transfer into cancellation, timeout or a fetch error
fn transfer_error(token: &CancellationToken, operation: &str, url: &str, err: &git2::Error) -> PorchError {
    if let Err(cancelled) = token.check(operation) {
        return cancelled;
    }
    PorchError::GitFetchFailed {
        url: url.to_string(),
        reason: interpret_git_error(err),
    }
}

/// Fetch `refspecs` from `url` into `repo`, pruning refs deleted remotely
pub fn fetch(
    repo: &Repository,
    url: &str,
    refspecs: &[&str],
    credentials: Option<&Credentials>,
    token: &CancellationToken,
) -> Result<()> {
    token.check("git fetch")?;
    let transport_url = url::for_transport(url);
    tracing::debug!(url, "fetching");

    let mut callbacks = RemoteCallbacks::new();
    auth::setup_auth_callbacks(&mut callbacks, credentials);
    callbacks.transfer_progress(|_| !token.is_cancelled() && !token.is_expired());

    let mut options = FetchOptions::new();
    options.remote_callbacks(callbacks);
    options.prune(FetchPrune::On);
    options.download_tags(AutotagOption::None);

    let mut remote = repo.remote_anonymous(&transport_url)?;
    remote
        .fetch(refspecs, Some(&mut options), None)
        .map_err(|e| transfer_error(token, "git fetch", url, &e))?;
    Ok(())
}

/// Mirror every branch and tag of `url` into `repo`
pub fn fetch_mirror(
    repo: &Repository,
    url: &str,
    credentials: Option<&Credentials>,
    token: &CancellationToken,
) -> Result<()> {
    fetch(repo, url, &MIRROR_REFSPECS, credentials, token)
}

/// Push `refspecs` to `url`
///
/// A refspec of the form `:refs/...` deletes the remote ref. Any ref the
/// server refuses is reported as [`PorchError::PushRejected`]; an existing
/// tag surfaces as [`PorchError::TagExists`].
pub fn push(
    repo: &Repository,
    url: &str,
    refspecs: &[String],
    credentials: Option<&Credentials>,
    token: &CancellationToken,
) -> Result<()> {
    token.check("git push")?;
    let transport_url = url::for_transport(url);
    tracing::debug!(url, refspecs = ?refspecs, "pushing");

    let rejected: RefCell<Vec<(String, String)>> = RefCell::new(Vec::new());
    {
        let mut callbacks = RemoteCallbacks::new();
        auth::setup_auth_callbacks(&mut callbacks, credentials);
        callbacks.push_update_reference(|refname, status| {
            if let Some(reason) = status {
                rejected
                    .borrow_mut()
                    .push((refname.to_string(), reason.to_string()));
            }
            Ok(())
        });

        let mut options = PushOptions::new();
        options.remote_callbacks(callbacks);

        let mut remote = repo.remote_anonymous(&transport_url)?;
        remote
            .push(refspecs, Some(&mut options))
            .map_err(|e| push_error(token, refspecs, &e))?;
    }

    if let Some((refname, reason)) = rejected.into_inner().into_iter().next() {
        return Err(rejection_error(refname, reason));
    }
    Ok(())
}

fn push_error(token: &CancellationToken, refspecs: &[String], err: &git2::Error) -> PorchError {
    if let Err(cancelled) = token.check("git push") {
        return cancelled;
    }
    let refname = refspecs
        .first()
        .map(|s| s.rsplit(':').next().unwrap_or(s).to_string())
        .unwrap_or_default();
    let message = err.message().to_lowercase();
    if err.code() == git2::ErrorCode::NotFastForward || message.contains("already exists") {
        return rejection_error(refname, err.message().to_string());
    }
    PorchError::PushRejected {
        refname,
        reason: interpret_git_error(err),
    }
}

fn rejection_error(refname: String, reason: String) -> PorchError {
    if refname.starts_with(refs::TAGS_PREFIX) && reason.contains("exist") {
        PorchError::TagExists {
            tag: refname.trim_start_matches(refs::TAGS_PREFIX).to_string(),
        }
    } else {
        PorchError::PushRejected { refname, reason }
    }
}
