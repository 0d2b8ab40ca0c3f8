//! Repository adapters
//!
//! A [`Repository`] presents a backend (git, OCI registry, local directory)
//! as a set of package revisions. Every backend supports the same
//! capabilities, so the engine never needs to know which one it talks to.
//!
//! Drafts are created from a list of [`TaskStep`]s: the engine replays the
//! task list and hands over the resources after every step, and backends
//! that keep history (git) record one snapshot per step.

pub mod dir;
pub mod fetch;
pub mod git;
pub mod lease;
pub mod oci;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::cancel::CancellationToken;
use crate::error::{PorchError, Result};
use crate::git::Credentials;
use crate::model::{Lifecycle, PackageRevisionKey, Resources, RevisionFilter, RevisionHead, Task};
use crate::retry::Backoff;

pub use lease::Leases;

/// Backend type of a registered repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryType {
    Git,
    Oci,
    Dir,
}

impl std::fmt::Display for RepositoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RepositoryType::Git => "git",
            RepositoryType::Oci => "oci",
            RepositoryType::Dir => "dir",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitSpec {
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Directory holding the packages, `""` for the repository root
    #[serde(default)]
    pub directory: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
}

fn default_branch() -> String {
    crate::reference::git::DEFAULT_GIT_REF.to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciSpec {
    /// Registry host and path prefix, e.g. `registry.example.com/packages`
    pub registry: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirSpec {
    pub directory: PathBuf,
}

/// Backend part of a Repository registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositorySpec {
    #[serde(rename = "type")]
    pub repo_type: RepositoryType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oci: Option<OciSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<DirSpec>,
    #[serde(default)]
    pub deployment: bool,
}

impl RepositorySpec {
    pub fn git(repo: impl Into<String>) -> Self {
        Self {
            repo_type: RepositoryType::Git,
            git: Some(GitSpec {
                repo: repo.into(),
                branch: default_branch(),
                ..GitSpec::default()
            }),
            oci: None,
            dir: None,
            deployment: false,
        }
    }

    pub fn dir(directory: impl Into<PathBuf>) -> Self {
        Self {
            repo_type: RepositoryType::Dir,
            git: None,
            oci: None,
            dir: Some(DirSpec {
                directory: directory.into(),
            }),
            deployment: false,
        }
    }

    pub fn oci(registry: impl Into<String>) -> Self {
        Self {
            repo_type: RepositoryType::Oci,
            git: None,
            oci: Some(OciSpec {
                registry: registry.into(),
                secret_ref: None,
            }),
            dir: None,
            deployment: false,
        }
    }

    /// Secret holding credentials for the backend, if any
    pub fn secret_ref(&self) -> Option<&SecretRef> {
        match self.repo_type {
            RepositoryType::Git => self.git.as_ref().and_then(|g| g.secret_ref.as_ref()),
            RepositoryType::Oci => self.oci.as_ref().and_then(|o| o.secret_ref.as_ref()),
            RepositoryType::Dir => None,
        }
    }

    /// Location used to match upstream locks against this repository
    pub fn location(&self) -> Option<String> {
        match self.repo_type {
            RepositoryType::Git => self.git.as_ref().map(|g| g.repo.clone()),
            RepositoryType::Oci => self.oci.as_ref().map(|o| o.registry.clone()),
            RepositoryType::Dir => self.dir.as_ref().map(|d| d.directory.display().to_string()),
        }
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        let mut errors = crate::error::FieldErrors::new();
        match self.repo_type {
            RepositoryType::Git => match &self.git {
                Some(git) if git.repo.trim().is_empty() => errors.push("spec.git.repo", "repository URL is required"),
                Some(_) => {}
                None => errors.push("spec.git", "git section is required for type git"),
            },
            RepositoryType::Oci => match &self.oci {
                Some(oci) if oci.registry.trim().is_empty() => errors.push("spec.oci.registry", "registry is required"),
                Some(_) => {}
                None => errors.push("spec.oci", "oci section is required for type oci"),
            },
            RepositoryType::Dir => {
                if self.dir.is_none() {
                    errors.push("spec.dir", "dir section is required for type dir");
                }
            }
        }
        errors.into_result("Repository", name)
    }
}

/// Resources of a draft after one task was applied
#[derive(Debug, Clone, PartialEq)]
pub struct TaskStep {
    /// Task that produced the resources; `None` for out-of-band edits
    pub task: Option<Task>,
    pub resources: Resources,
}

impl TaskStep {
    pub fn new(task: Task, resources: Resources) -> Self {
        Self {
            task: Some(task),
            resources,
        }
    }
}

/// Backend-neutral view of a repository of packages
pub trait Repository: Send + Sync {
    /// Registered name of the repository
    fn name(&self) -> &str;

    fn repo_type(&self) -> RepositoryType;

    /// URL, registry or directory of the backend
    fn location(&self) -> String;

    /// All revisions matching `filter`
    fn list_revisions(&self, filter: &RevisionFilter, token: &CancellationToken) -> Result<Vec<RevisionHead>>;

    /// Full file map of a revision
    fn get_resources(&self, key: &PackageRevisionKey, token: &CancellationToken) -> Result<Resources>;

    /// Create a new draft from replayed task steps
    ///
    /// Fails with `AlreadyExists` when the workspace is already used by any
    /// revision of the package.
    fn create_draft(
        &self,
        package: &str,
        workspace: &str,
        steps: Vec<TaskStep>,
        token: &CancellationToken,
    ) -> Result<RevisionHead>;

    /// Record new resources on a draft
    fn update_resources(&self, key: &PackageRevisionKey, step: TaskStep, token: &CancellationToken) -> Result<RevisionHead>;

    /// Move a revision to another lifecycle state
    ///
    /// Approving assigns the next `v<N>` revision when the key carries none.
    fn update_lifecycle(
        &self,
        key: &PackageRevisionKey,
        lifecycle: Lifecycle,
        token: &CancellationToken,
    ) -> Result<RevisionHead>;

    fn delete_revision(&self, key: &PackageRevisionKey, token: &CancellationToken) -> Result<()>;

    /// Every ref (or tag) the backend exposes
    fn list_refs(&self, token: &CancellationToken) -> Result<Vec<String>>;

    /// Re-read remote state
    fn refresh(&self, token: &CancellationToken) -> Result<()>;

    /// Revision addressed by `(package, workspace)`
    fn get_revision(&self, key: &PackageRevisionKey, token: &CancellationToken) -> Result<RevisionHead> {
        let filter = RevisionFilter::package(&key.package);
        self.list_revisions(&filter, token)?
            .into_iter()
            .find(|head| head.key.workspace == key.workspace)
            .ok_or_else(|| PorchError::PackageRevisionNotFound { name: key.object_name() })
    }

    fn propose(&self, key: &PackageRevisionKey, token: &CancellationToken) -> Result<RevisionHead> {
        self.update_lifecycle(key, Lifecycle::Proposed, token)
    }

    fn approve(&self, key: &PackageRevisionKey, token: &CancellationToken) -> Result<RevisionHead> {
        self.update_lifecycle(key, Lifecycle::Published, token)
    }

    fn reject(&self, key: &PackageRevisionKey, token: &CancellationToken) -> Result<RevisionHead> {
        self.update_lifecycle(key, Lifecycle::Draft, token)
    }

    fn propose_deletion(&self, key: &PackageRevisionKey, token: &CancellationToken) -> Result<RevisionHead> {
        self.update_lifecycle(key, Lifecycle::DeletionProposed, token)
    }
}

/// Fail unless `workspace` is unused among `heads`
pub(crate) fn ensure_workspace_free(heads: &[RevisionHead], package: &str, workspace: &str) -> Result<()> {
    if heads
        .iter()
        .any(|h| h.key.package == package && h.key.workspace == workspace)
    {
        return Err(PorchError::AlreadyExists {
            kind: "PackageRevision".to_string(),
            name: format!("{package}/{workspace}"),
        });
    }
    Ok(())
}

/// Fail unless the lifecycle allows resource edits
pub(crate) fn ensure_draft(head: &RevisionHead) -> Result<()> {
    if head.lifecycle.is_mutable() {
        Ok(())
    } else {
        Err(PorchError::LifecycleConflict {
            name: head.object_name(),
            message: format!("resources can only change while Draft, revision is {}", head.lifecycle),
        })
    }
}

/// Resolves `secretRef` names to credentials
pub trait CredentialResolver: Send + Sync {
    fn resolve(&self, namespace: &str, secret: &str) -> Result<Option<Credentials>>;
}

/// Credentials kept in memory, keyed by `(namespace, secret name)`
#[derive(Debug, Default)]
pub struct StaticCredentials {
    secrets: DashMap<(String, String), Credentials>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, namespace: &str, secret: &str, credentials: Credentials) {
        self.secrets
            .insert((namespace.to_string(), secret.to_string()), credentials);
    }
}

impl CredentialResolver for StaticCredentials {
    fn resolve(&self, namespace: &str, secret: &str) -> Result<Option<Credentials>> {
        Ok(self
            .secrets
            .get(&(namespace.to_string(), secret.to_string()))
            .map(|c| c.value().clone()))
    }
}

/// What backends need from the process environment
#[derive(Clone)]
pub struct BackendContext {
    pub cache_dir: PathBuf,
    pub credentials: Arc<dyn CredentialResolver>,
    pub committer: crate::config::Committer,
    pub backoff: Backoff,
    /// Upper bound for a single git fetch or push
    pub git_timeout: Duration,
    /// Registries used by OCI repositories, keyed by registry host;
    /// hosts not listed use the HTTP distribution API
    pub registries: HashMap<String, Arc<dyn oci::Registry>>,
}

impl BackendContext {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            credentials: Arc::new(StaticCredentials::new()),
            committer: crate::config::Committer::default(),
            backoff: Backoff::default(),
            git_timeout: Duration::from_secs(60),
            registries: HashMap::new(),
        }
    }

    /// Registry client for `host`
    pub fn registry(&self, host: &str, credentials: Option<Credentials>) -> Arc<dyn oci::Registry> {
        self.registries
            .get(host)
            .cloned()
            .unwrap_or_else(|| Arc::new(oci::HttpRegistry::new(host, credentials)))
    }
}

/// Open the backend described by `spec`
pub fn open(
    namespace: &str,
    name: &str,
    spec: &RepositorySpec,
    ctx: &BackendContext,
    token: &CancellationToken,
) -> Result<Arc<dyn Repository>> {
    spec.validate(name)?;
    let credentials = match spec.secret_ref() {
        Some(secret) => ctx.credentials.resolve(namespace, &secret.name)?,
        None => None,
    };
    let missing = |section: &str| PorchError::internal(format!("validated spec without {section}"));
    let repo: Arc<dyn Repository> = match spec.repo_type {
        RepositoryType::Git => {
            let git = spec.git.as_ref().ok_or_else(|| missing("git"))?;
            Arc::new(git::GitRepository::open(name, git, credentials, ctx, token)?)
        }
        RepositoryType::Oci => {
            let oci = spec.oci.as_ref().ok_or_else(|| missing("oci"))?;
            let host = oci.registry.split('/').next().unwrap_or_default();
            let registry = ctx.registry(host, credentials);
            Arc::new(oci::OciRepository::new(name, &oci.registry, registry))
        }
        RepositoryType::Dir => {
            let dir = spec.dir.as_ref().ok_or_else(|| missing("dir"))?;
            Arc::new(dir::DirRepository::open(name, &dir.directory)?)
        }
    };
    tracing::info!(repo = %name, namespace, backend = %spec.repo_type, "opened repository");
    Ok(repo)
}

/// Open repositories keyed by `(namespace, name)`
#[derive(Default)]
pub struct RepositorySet {
    repos: DashMap<(String, String), Arc<dyn Repository>>,
}

impl RepositorySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, namespace: &str, repo: Arc<dyn Repository>) {
        self.repos
            .insert((namespace.to_string(), repo.name().to_string()), repo);
    }

    pub fn remove(&self, namespace: &str, name: &str) -> Option<Arc<dyn Repository>> {
        self.repos
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|(_, repo)| repo)
    }

    pub fn get(&self, namespace: &str, name: &str) -> Result<Arc<dyn Repository>> {
        self.repos
            .get(&(namespace.to_string(), name.to_string()))
            .map(|r| r.value().clone())
            .ok_or_else(|| PorchError::RepositoryNotFound {
                name: format!("{namespace}/{name}"),
            })
    }

    /// Repositories of a namespace, sorted by name
    pub fn in_namespace(&self, namespace: &str) -> Vec<Arc<dyn Repository>> {
        let mut repos: Vec<Arc<dyn Repository>> = self
            .repos
            .iter()
            .filter(|entry| entry.key().0 == namespace)
            .map(|entry| entry.value().clone())
            .collect();
        repos.sort_by(|a, b| a.name().cmp(b.name()));
        repos
    }

    /// Find the revision whose object name is `name`
    ///
    /// Package names may contain dots, so candidates are narrowed by the
    /// repository-name prefix and then matched on the full object name.
    pub fn find_revision(
        &self,
        namespace: &str,
        name: &str,
        token: &CancellationToken,
    ) -> Result<(Arc<dyn Repository>, RevisionHead)> {
        for repo in self.in_namespace(namespace) {
            if !name.starts_with(&format!("{}.", repo.name())) {
                continue;
            }
            let heads = repo.list_revisions(&RevisionFilter::default(), token)?;
            if let Some(head) = heads.into_iter().find(|h| h.object_name() == name) {
                return Ok((repo, head));
            }
        }
        Err(PorchError::PackageRevisionNotFound {
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_validation() {
        assert!(RepositorySpec::git("https://example.com/r1.git").validate("r1").is_ok());
        assert!(RepositorySpec::git(" ").validate("r1").is_err());
        let mut broken = RepositorySpec::oci("registry.local/pkgs");
        broken.oci = None;
        let err = broken.validate("r2").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Invalid);
    }

    #[test]
    fn test_spec_serde_shape() {
        let spec: RepositorySpec = serde_yaml::from_str(
            "type: git\ngit:\n  repo: https://example.com/r1.git\n  directory: pkgs\n  secretRef:\n    name: creds\n",
        )
        .unwrap();
        assert_eq!(spec.repo_type, RepositoryType::Git);
        let git = spec.git.as_ref().unwrap();
        assert_eq!(git.branch, "main");
        assert_eq!(spec.secret_ref().map(|s| s.name.as_str()), Some("creds"));
    }

    #[test]
    fn test_static_credentials() {
        let creds = StaticCredentials::new();
        creds.insert("default", "git", Credentials::new("u", "p"));
        assert!(creds.resolve("default", "git").unwrap().is_some());
        assert!(creds.resolve("other", "git").unwrap().is_none());
    }

    #[test]
    fn test_repository_set_lookup() {
        let temp = tempfile::TempDir::new().unwrap();
        let set = RepositorySet::new();
        let repo = dir::DirRepository::open("r1", temp.path()).unwrap();
        set.insert("default", Arc::new(repo));
        assert!(set.get("default", "r1").is_ok());
        assert!(set.get("other", "r1").is_err());
        assert_eq!(set.in_namespace("default").len(), 1);
        assert!(set.remove("default", "r1").is_some());
        assert!(set.in_namespace("default").is_empty());
    }
}
