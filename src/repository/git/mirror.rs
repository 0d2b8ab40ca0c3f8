//! Local bare mirrors of remote repositories
//!
//! Each remote URL is mirrored once under `<cache>/git/<slug>`. Every user
//! of a mirror (registered repositories and direct upstream fetches alike)
//! goes through the same process-local lock for that slug.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::git::{self, Credentials};
use crate::retry::{Backoff, retry_transient};

static MIRROR_LOCKS: LazyLock<DashMap<PathBuf, Arc<Mutex<()>>>> = LazyLock::new(DashMap::new);

/// A bare mirror of `url`
#[derive(Debug, Clone)]
pub struct Mirror {
    url: String,
    path: PathBuf,
    lock: Arc<Mutex<()>>,
    credentials: Option<Credentials>,
    backoff: Backoff,
    timeout: Option<Duration>,
}

impl Mirror {
    pub fn new(cache_dir: &Path, url: &str, credentials: Option<Credentials>, backoff: Backoff) -> Self {
        let path = cache_dir.join("git").join(git::url::url_to_slug(url));
        let lock = MIRROR_LOCKS.entry(path.clone()).or_default().clone();
        Self {
            url: url.to_string(),
            path,
            lock,
            credentials,
            backoff,
            timeout: None,
        }
    }

    /// Bound every fetch and push by `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn deadline(&self, token: &CancellationToken) -> CancellationToken {
        match self.timeout {
            Some(timeout) => token.with_deadline(timeout),
            None => token.clone(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Take the mirror lock and open the bare repository
    pub fn open(&self) -> Result<(MutexGuard<'_, ()>, git2::Repository)> {
        let guard = self.lock.lock();
        let repo = git::open_or_init_bare(&self.path)?;
        Ok((guard, repo))
    }

    /// Fetch every branch and tag, retrying transient failures
    pub fn sync(&self, repo: &git2::Repository, token: &CancellationToken) -> Result<()> {
        retry_transient(token, &self.backoff, || {
            git::fetch_mirror(repo, &self.url, self.credentials.as_ref(), &self.deadline(token))
        })
    }

    /// Push refspecs to the remote
    pub fn push(&self, repo: &git2::Repository, refspecs: &[String], token: &CancellationToken) -> Result<()> {
        git::push(repo, &self.url, refspecs, self.credentials.as_ref(), &self.deadline(token))
    }
}
