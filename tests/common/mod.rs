//! Common test utilities for porch integration tests

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use porch::api::Porch;
use porch::api::objects::RepositoryObject;
use porch::cancel::CancellationToken;
use porch::engine::Engine;
use porch::engine::function::BuiltinRuntime;
use porch::gitserver::{BackgroundServer, GitServer};
use porch::metadata::MetadataStore;
use porch::repository::{BackendContext, RepositorySet, RepositorySpec};
use porch::retry::Backoff;
use tempfile::TempDir;

pub const NS: &str = "default";

pub const KPTFILE: &str = "apiVersion: kpt.dev/v1\nkind: Kptfile\nmetadata:\n  name: pkg-a\ninfo:\n  description: sample package\n";

pub const DEPLOYMENT: &str = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\nspec:\n  replicas: 1\n";

/// A git server over a temp directory plus a porch instance with its own cache
pub struct TestEnv {
    pub temp: TempDir,
    pub server: BackgroundServer,
    pub porch: Arc<Porch>,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp = TempDir::new().expect("Failed to create temp directory");
        let git = GitServer::new(temp.path().join("git"));
        for name in ["r1", "r2"] {
            git.create_repository(name).expect("Failed to create repository");
        }
        let server = BackgroundServer::start(git).expect("Failed to start git server");
        let porch = Arc::new(porch_at(&temp.path().join("porch")));
        Self { temp, server, porch }
    }

    /// Server-side path of a hosted repository
    pub fn repo_path(&self, name: &str) -> PathBuf {
        self.temp.path().join("git").join(format!("{name}.git"))
    }

    pub fn create_repository(&self, name: &str) {
        GitServer::new(self.temp.path().join("git"))
            .create_repository(name)
            .expect("Failed to create repository");
    }

    /// Register a hosted repository with porch
    pub fn register(&self, name: &str, labels: &[(&str, &str)]) -> RepositoryObject {
        let mut object = RepositoryObject::new(NS, name, RepositorySpec::git(self.server.repository_url(name)));
        for (key, value) in labels {
            object.metadata.labels.insert((*key).to_string(), (*value).to_string());
        }
        self.porch
            .register_repository(&object, &CancellationToken::none())
            .expect("Failed to register repository")
    }
}

/// Porch with an in-memory metadata store and quick retries
pub fn porch_at(root: &Path) -> Porch {
    let mut ctx = BackendContext::new(root.join("cache"));
    ctx.backoff = Backoff {
        base_ms: 10,
        cap_ms: 100,
        max_attempts: 2,
        ..Backoff::default()
    };
    ctx.git_timeout = Duration::from_secs(30);
    let engine = Engine::new(Arc::new(RepositorySet::new()), ctx, Arc::new(BuiltinRuntime::new()));
    Porch::new(Arc::new(engine), MetadataStore::in_memory(), Duration::from_secs(10))
}

/// Commit `files` under `<package>/` on main and tag it `<package>/<revision>`
pub fn publish_plain(repo_path: &Path, package: &str, revision: &str, files: &[(&str, &str)]) -> git2::Oid {
    let repo = git2::Repository::open(repo_path).expect("Failed to open repository");
    let parent = repo
        .refname_to_id("refs/heads/main")
        .ok()
        .map(|id| repo.find_commit(id).unwrap());

    let mut index = git2::Index::new().unwrap();
    if let Some(parent) = &parent {
        index.read_tree(&parent.tree().unwrap()).unwrap();
        let stale: Vec<PathBuf> = index
            .iter()
            .map(|e| PathBuf::from(String::from_utf8(e.path).unwrap()))
            .filter(|p| p.starts_with(package))
            .collect();
        for path in stale {
            index.remove_path(&path).unwrap();
        }
    }
    for (path, content) in files {
        let blob = repo.blob(content.as_bytes()).unwrap();
        index
            .add(&git2::IndexEntry {
                ctime: git2::IndexTime::new(0, 0),
                mtime: git2::IndexTime::new(0, 0),
                dev: 0,
                ino: 0,
                mode: 0o100_644,
                uid: 0,
                gid: 0,
                file_size: 0,
                id: blob,
                flags: 0,
                flags_extended: 0,
                path: format!("{package}/{path}").into_bytes(),
            })
            .unwrap();
    }
    let tree = repo.find_tree(index.write_tree_to(&repo).unwrap()).unwrap();
    let sig = git2::Signature::now("test", "test@example.com").unwrap();
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
    let commit = repo
        .commit(
            Some("refs/heads/main"),
            &sig,
            &sig,
            &format!("publish {package}/{revision}"),
            &tree,
            &parents,
        )
        .unwrap();
    repo.reference(&format!("refs/tags/{package}/{revision}"), commit, false, "tag")
        .unwrap();
    commit
}
