//! Direct fetches of upstream packages
//!
//! Clone and update tasks may point at a source that is not a registered
//! repository: a git URL with ref and directory, an OCI image or a local
//! directory. Fetching yields the package files plus the lock that pins
//! exactly what was read.

use crate::cancel::CancellationToken;
use crate::error::{PorchError, Result};
use crate::git::{self, Credentials};
use crate::hash::{hash_resources, read_tree};
use crate::model::{Resources, UpstreamLock};
use crate::reference::{DirReference, GitReference, OciReference, Reference};
use crate::reference::git::DEFAULT_GIT_REF;
use crate::reference::oci::DEFAULT_OCI_TAG;
use crate::model::kptfile::{DirLock, GitLock, OciLock};

use super::BackendContext;
use super::git::mirror::Mirror;
use super::oci::layers;

/// Files of an upstream package and the lock pinning them
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub resources: Resources,
    pub lock: UpstreamLock,
}

/// Fetch the current content of `reference`
pub fn fetch_reference(
    reference: &Reference,
    ctx: &BackendContext,
    credentials: Option<Credentials>,
    token: &CancellationToken,
) -> Result<Fetched> {
    token.check("fetch upstream")?;
    match reference {
        Reference::Git(r) => fetch_git(r, ctx, credentials, token),
        Reference::Oci(r) => fetch_oci(r, None, ctx, credentials),
        Reference::Dir(r) => fetch_dir(r),
        other => Err(PorchError::ReferenceParseFailed {
            input: other.to_string(),
            reason: "only git, oci and directory sources can be fetched".to_string(),
        }),
    }
}

/// Fetch exactly the content pinned by `lock`
pub fn fetch_lock(
    lock: &UpstreamLock,
    ctx: &BackendContext,
    credentials: Option<Credentials>,
    token: &CancellationToken,
) -> Result<Resources> {
    token.check("fetch upstream")?;
    let missing = || PorchError::ReferenceParseFailed {
        input: format!("upstreamLock of type {}", lock.lock_type),
        reason: "lock has no content".to_string(),
    };
    if let Some(GitLock { repo, directory, commit, .. }) = &lock.git {
        let reference = GitReference::new(repo, directory, commit);
        return fetch_git(&reference, ctx, credentials, token).map(|f| f.resources);
    }
    if let Some(OciLock { image, directory, digest }) = &lock.oci {
        let reference = OciReference::new(image, directory);
        return fetch_oci(&reference, Some(digest), ctx, credentials).map(|f| f.resources);
    }
    if let Some(DirLock { directory, digest, .. }) = &lock.dir {
        let fetched = fetch_dir(&DirReference::new(directory))?;
        if fetched.lock.id() != Some(digest.as_str()) {
            tracing::warn!(directory, "directory content changed since it was locked");
        }
        return Ok(fetched.resources);
    }
    Err(missing())
}

fn fetch_git(
    reference: &GitReference,
    ctx: &BackendContext,
    credentials: Option<Credentials>,
    token: &CancellationToken,
) -> Result<Fetched> {
    let git_ref = if reference.git_ref.is_empty() {
        DEFAULT_GIT_REF
    } else {
        reference.git_ref.as_str()
    };
    let mirror = Mirror::new(&ctx.cache_dir, &reference.repo, credentials, ctx.backoff.clone()).with_timeout(ctx.git_timeout);
    let (_guard, repo) = mirror.open()?;
    // A commit already present in the mirror needs no network round trip.
    let cached = git2::Oid::from_str(git_ref)
        .ok()
        .filter(|oid| git_ref.len() == 40 && repo.find_commit(*oid).is_ok());
    if cached.is_none() {
        mirror
            .sync(&repo, token)
            .map_err(|e| crate::backend_error!(&reference.repo, git_ref, e))?;
    }
    let commit = git::refs::resolve_commit(&repo, git_ref)?;
    let tree = commit.tree()?;
    let resources = git::objects::read_files(&repo, &tree, &reference.directory)?;
    if resources.is_empty() {
        return Err(PorchError::FileNotFound {
            path: format!("{}//{}@{git_ref}", reference.repo, reference.directory),
        });
    }
    tracing::debug!(repo = %reference.repo, git_ref, commit = %commit.id(), "fetched git upstream");
    Ok(Fetched {
        resources,
        lock: UpstreamLock::git(&reference.repo, &reference.directory, git_ref, &commit.id().to_string()),
    })
}

fn fetch_oci(
    reference: &OciReference,
    digest: Option<&str>,
    ctx: &BackendContext,
    credentials: Option<Credentials>,
) -> Result<Fetched> {
    let (host, repository) = reference.registry_and_repository();
    let registry = ctx.registry(&host, credentials);
    let wanted = digest
        .or(reference.digest())
        .or(reference.tag())
        .unwrap_or(DEFAULT_OCI_TAG);
    let (manifest, manifest_digest) = registry
        .get_manifest(&repository, wanted)?
        .ok_or_else(|| PorchError::OciFailed {
            image: reference.image.clone(),
            reason: format!("manifest {wanted} not found"),
        })?;
    let mut all = Resources::new();
    for layer in &manifest.layers {
        all.extend(layers::unpack(&registry.get_blob(&repository, &layer.digest)?)?);
    }
    let resources = subdirectory(all, &reference.directory);
    if resources.is_empty() {
        return Err(PorchError::FileNotFound {
            path: reference.to_string(),
        });
    }
    Ok(Fetched {
        resources,
        lock: UpstreamLock::oci(&reference.image, &reference.directory, &manifest_digest),
    })
}

fn fetch_dir(reference: &DirReference) -> Result<Fetched> {
    let resources = read_tree(&reference.directory, &[])?;
    let directory = reference.directory.display().to_string();
    Ok(Fetched {
        lock: UpstreamLock::dir(&directory, "", &hash_resources(&resources)),
        resources,
    })
}

/// Files under `dir`, with paths relative to it
fn subdirectory(resources: Resources, dir: &str) -> Resources {
    if dir.is_empty() {
        return resources;
    }
    let prefix = format!("{}/", dir.trim_end_matches('/'));
    resources
        .into_iter()
        .filter_map(|(path, content)| path.strip_prefix(&prefix).map(|p| (p.to_string(), content)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::oci::{Descriptor, Manifest, MemoryRegistry, Registry};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_fetch_dir_locks_content_hash() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("Kptfile"), "kind: Kptfile\n").unwrap();
        let ctx = BackendContext::new(temp.path().join("cache"));
        let reference = Reference::Dir(DirReference::new(temp.path()));
        let fetched = fetch_reference(&reference, &ctx, None, &CancellationToken::none()).unwrap();
        assert!(fetched.resources.contains_key("Kptfile"));
        let again = fetch_lock(&fetched.lock, &ctx, None, &CancellationToken::none()).unwrap();
        assert_eq!(again, fetched.resources);
    }

    #[test]
    fn test_fetch_oci_subdirectory() {
        let registry = Arc::new(MemoryRegistry::new());
        let files: Resources = [
            ("pkg/Kptfile".to_string(), "kind: Kptfile\n".to_string()),
            ("other/x.yaml".to_string(), "a: 1\n".to_string()),
        ]
        .into();
        let layer = layers::pack(&files).unwrap();
        registry.put_blob("org/bundle", &layer).unwrap();
        registry.put_blob("org/bundle", b"{}").unwrap();
        let manifest = Manifest::new(
            Descriptor::new("application/json", b"{}"),
            vec![Descriptor::new(layers::LAYER_MEDIA_TYPE, &layer)],
        );
        let digest = registry.put_manifest("org/bundle", "v1", &manifest).unwrap();

        let temp = TempDir::new().unwrap();
        let mut ctx = BackendContext::new(temp.path());
        ctx.registries.insert("registry.local".to_string(), registry);
        let reference = Reference::Oci(OciReference::new("registry.local/org/bundle:v1", "pkg"));
        let fetched = fetch_reference(&reference, &ctx, None, &CancellationToken::none()).unwrap();
        assert_eq!(fetched.resources.keys().collect::<Vec<_>>(), vec!["Kptfile"]);
        assert_eq!(fetched.lock.id(), Some(digest.as_str()));
    }

    #[test]
    fn test_fetch_git_by_branch_and_commit() {
        let remote = TempDir::new().unwrap();
        let repo = git2::Repository::init_bare(remote.path()).unwrap();
        let files: Resources = [("pkg-a/Kptfile".to_string(), "kind: Kptfile\n".to_string())].into();
        let tree_id = git::objects::write_files(&repo, &files).unwrap().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = git2::Signature::now("Test", "test@test.com").unwrap();
        let commit = repo
            .commit(Some("refs/heads/main"), &sig, &sig, "init", &tree, &[])
            .unwrap();

        let cache = TempDir::new().unwrap();
        let ctx = BackendContext::new(cache.path());
        let url = format!("file://{}", remote.path().display());
        let reference = Reference::Git(GitReference::new(&url, "pkg-a", "main"));
        let fetched = fetch_reference(&reference, &ctx, None, &CancellationToken::none()).unwrap();
        assert_eq!(fetched.lock.id(), Some(commit.to_string().as_str()));
        let pinned = fetch_lock(&fetched.lock, &ctx, None, &CancellationToken::none()).unwrap();
        assert_eq!(pinned, fetched.resources);
    }
}
