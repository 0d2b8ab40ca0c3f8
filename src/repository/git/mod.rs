//! Git repository backend
//!
//! Revisions are encoded as refs of the remote repository (see
//! [`crate::git::refs`]). All work happens in a local bare mirror that is
//! fetched before every operation; mutations build commits locally and push
//! them. A local ref created for a push is removed again if the push fails.
//!
//! Publishing tags the draft head with an annotated tag whose message
//! carries the package, workspace and revision, pushes the tag, and only
//! then deletes the draft branch. If the branch cannot be deleted the tag is
//! withdrawn again, so a revision is never both draft and published.

pub mod commit;
pub mod mirror;

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use git2::{ObjectType, Oid, Repository as GitRepo};

use super::{BackendContext, GitSpec, Repository, RepositoryType, TaskStep, ensure_draft, ensure_workspace_free};
use crate::cancel::CancellationToken;
use crate::error::{PorchError, Result};
use crate::git::refs::{self, PackageRef};
use crate::git::{self, Credentials, objects};
use crate::model::{
    Lifecycle, PackageRevisionKey, Resources, RevisionFilter, RevisionHead, UpstreamLock, next_revision,
};
use commit::{CommitAnnotation, format_message, parse_annotation, step_summary, tasks_of};
use mirror::Mirror;

pub struct GitRepository {
    name: String,
    spec: GitSpec,
    mirror: Mirror,
    committer: crate::config::Committer,
}

impl GitRepository {
    /// Open the repository and fetch it once
    pub fn open(
        name: &str,
        spec: &GitSpec,
        credentials: Option<Credentials>,
        ctx: &BackendContext,
        token: &CancellationToken,
    ) -> Result<Self> {
        let repo = Self {
            name: name.to_string(),
            spec: spec.clone(),
            mirror: Mirror::new(&ctx.cache_dir, &spec.repo, credentials, ctx.backoff.clone()).with_timeout(ctx.git_timeout),
            committer: ctx.committer.clone(),
        };
        repo.refresh(token)
            .map_err(|e| crate::backend_error!(spec.repo, spec.branch, e))?;
        Ok(repo)
    }

    /// Path of a package inside the repository tree
    fn package_dir(&self, package: &str) -> String {
        let directory = self.spec.directory.trim_matches('/');
        if directory.is_empty() {
            package.to_string()
        } else {
            format!("{directory}/{package}")
        }
    }

    /// Lock the mirror, fetch, and run `f` against it
    fn synced<T>(&self, token: &CancellationToken, f: impl FnOnce(&GitRepo) -> Result<T>) -> Result<T> {
        let (_guard, repo) = self.mirror.open()?;
        self.mirror.sync(&repo, token)?;
        f(&repo)
    }

    fn signature(&self) -> Result<git2::Signature<'static>> {
        git::signature(&self.committer.name, &self.committer.email)
    }

    fn lock_for(&self, package: &str, git_ref: String, commit: Oid) -> UpstreamLock {
        UpstreamLock::git(&self.spec.repo, &self.package_dir(package), &git_ref, &commit.to_string())
    }

    fn load_heads(&self, repo: &GitRepo) -> Result<Vec<RevisionHead>> {
        let mut classified = Vec::new();
        let mut deletion_proposed = HashSet::new();
        for reference in repo.references()? {
            let reference = reference?;
            let Some(name) = reference.name() else {
                continue;
            };
            match PackageRef::parse(name) {
                Some(PackageRef::DeletionProposed { package, revision }) => {
                    deletion_proposed.insert((package, revision));
                }
                Some(parsed) => classified.push(parsed),
                None => {}
            }
        }

        let mut heads = Vec::with_capacity(classified.len());
        for parsed in classified {
            let loaded = match &parsed {
                PackageRef::Draft { package, workspace } => self.branch_head(repo, package, workspace, Lifecycle::Draft),
                PackageRef::Proposed { package, workspace } => {
                    self.branch_head(repo, package, workspace, Lifecycle::Proposed)
                }
                PackageRef::Published { package, revision } => {
                    let marked = deletion_proposed.contains(&(package.clone(), revision.clone()));
                    self.tag_head(repo, package, revision, marked)
                }
                PackageRef::DeletionProposed { .. } => Ok(None),
            };
            match loaded {
                Ok(head) => heads.extend(head),
                Err(err) => {
                    tracing::warn!(repo = %self.name, reference = ?parsed, error = %err, "skipping unreadable package ref");
                }
            }
        }
        heads.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(heads)
    }

    fn branch_head(&self, repo: &GitRepo, package: &str, workspace: &str, lifecycle: Lifecycle) -> Result<Option<RevisionHead>> {
        let refname = match lifecycle {
            Lifecycle::Proposed => refs::proposed_ref(package, workspace),
            _ => refs::draft_ref(package, workspace),
        };
        let commit = repo.find_reference(&refname)?.peel_to_commit()?;
        let upstream_lock = self.upstream_lock_of(repo, &commit, package);
        Ok(Some(RevisionHead {
            key: PackageRevisionKey::new(&self.name, package, workspace, ""),
            lifecycle,
            tasks: tasks_of(repo, &commit)?,
            upstream_lock,
            self_lock: Some(self.lock_for(package, refs::lock_ref_for_draft(package, workspace), commit.id())),
            resource_version: commit.id().to_string(),
            published_by: None,
            published_at: None,
        }))
    }

    fn tag_head(&self, repo: &GitRepo, package: &str, revision: &str, deletion_proposed: bool) -> Result<Option<RevisionHead>> {
        let reference = repo.find_reference(&refs::tag_ref(package, revision))?;
        let commit = reference.peel_to_commit()?;
        let tag = reference.peel(ObjectType::Tag).ok().and_then(|o| o.into_tag().ok());

        let annotation = tag
            .as_ref()
            .and_then(|t| t.message())
            .and_then(parse_annotation)
            .filter(|a| a.package == package);
        let workspace = annotation
            .map(|a| a.workspace_name)
            .filter(|w| !w.is_empty())
            .unwrap_or_else(|| revision.to_string());
        let tagger = tag.as_ref().and_then(|t| t.tagger().map(|s| (s.name().map(ToString::to_string), s.when())));
        let (published_by, published_at) = match tagger {
            Some((name, when)) => (name, DateTime::<Utc>::from_timestamp(when.seconds(), 0)),
            None => (None, None),
        };

        Ok(Some(RevisionHead {
            key: PackageRevisionKey::new(&self.name, package, workspace, revision),
            lifecycle: if deletion_proposed {
                Lifecycle::DeletionProposed
            } else {
                Lifecycle::Published
            },
            tasks: tasks_of(repo, &commit)?,
            upstream_lock: self.upstream_lock_of(repo, &commit, package),
            self_lock: Some(self.lock_for(package, refs::lock_ref_for_published(package, revision), commit.id())),
            resource_version: commit.id().to_string(),
            published_by,
            published_at,
        }))
    }

    /// `upstreamLock` from the package Kptfile at `commit`
    fn upstream_lock_of(&self, repo: &GitRepo, commit: &git2::Commit<'_>, package: &str) -> Option<UpstreamLock> {
        let tree = commit.tree().ok()?;
        let files = objects::read_files(repo, &tree, &self.package_dir(package)).ok()?;
        crate::model::Kptfile::from_resources(&files, "")
            .ok()
            .flatten()
            .and_then(|k| k.upstream_lock)
    }

    fn find_head(&self, repo: &GitRepo, key: &PackageRevisionKey) -> Result<RevisionHead> {
        self.load_heads(repo)?
            .into_iter()
            .find(|h| h.key.package == key.package && h.key.workspace == key.workspace)
            .ok_or_else(|| PorchError::PackageRevisionNotFound { name: key.object_name() })
    }

    fn commit_step(
        &self,
        repo: &GitRepo,
        parent: Option<&git2::Commit<'_>>,
        package: &str,
        workspace: &str,
        step: &TaskStep,
    ) -> Result<Oid> {
        let base = parent.map(git2::Commit::tree).transpose()?;
        let tree_id = objects::replace_dir(repo, base.as_ref(), &self.package_dir(package), &step.resources)?;
        let tree = repo.find_tree(tree_id)?;
        let annotation = CommitAnnotation::new(package, workspace, "", step.task.clone());
        let message = format_message(&step_summary(package, step.task.as_ref()), &annotation)?;
        let sig = self.signature()?;
        let parents: Vec<&git2::Commit<'_>> = parent.into_iter().collect();
        Ok(repo.commit(None, &sig, &sig, &message, &tree, &parents)?)
    }

    /// Point a local ref at `target` and push it; undo the local ref on failure
    fn push_new_ref(&self, repo: &GitRepo, refname: &str, target: Oid, extra: &[String], token: &CancellationToken) -> Result<()> {
        repo.reference(refname, target, true, "porch")?;
        let mut refspecs = vec![format!("{refname}:{refname}")];
        refspecs.extend_from_slice(extra);
        if let Err(err) = self.mirror.push(repo, &refspecs, token) {
            delete_local_ref(repo, refname);
            return Err(err);
        }
        Ok(())
    }

    fn push_deletes(&self, repo: &GitRepo, refnames: &[String], token: &CancellationToken) -> Result<()> {
        let refspecs: Vec<String> = refnames.iter().map(|r| format!(":{r}")).collect();
        self.mirror.push(repo, &refspecs, token)?;
        for refname in refnames {
            delete_local_ref(repo, refname);
        }
        Ok(())
    }

    fn publish_tag(&self, repo: &GitRepo, head: &RevisionHead, token: &CancellationToken) -> Result<()> {
        let package = &head.key.package;
        let revision = if head.key.revision.is_empty() {
            let heads = self.load_heads(repo)?;
            next_revision(
                heads
                    .iter()
                    .filter(|h| h.key.package == *package && h.lifecycle.is_published())
                    .map(|h| h.key.revision.as_str()),
            )
        } else {
            head.key.revision.clone()
        };
        let tag_name = format!("{package}/{revision}");
        let tag_ref = refs::tag_ref(package, &revision);
        if repo.find_reference(&tag_ref).is_ok() {
            return Err(PorchError::TagExists { tag: tag_name });
        }

        let commit_id = Oid::from_str(&head.resource_version)?;
        let target = repo.find_object(commit_id, Some(ObjectType::Commit))?;
        let annotation = CommitAnnotation::new(package, &head.key.workspace, &revision, None);
        let message = format_message(&format!("Publish {tag_name}"), &annotation)?;
        repo.tag(&tag_name, &target, &self.signature()?, &message, false)?;
        if let Err(err) = self.mirror.push(repo, &[format!("{tag_ref}:{tag_ref}")], token) {
            delete_local_ref(repo, &tag_ref);
            return Err(err);
        }

        let source = match head.lifecycle {
            Lifecycle::Proposed => refs::proposed_ref(package, &head.key.workspace),
            _ => refs::draft_ref(package, &head.key.workspace),
        };
        if let Err(err) = self.push_deletes(repo, std::slice::from_ref(&source), token) {
            tracing::warn!(repo = %self.name, tag = %tag_name, error = %err, "rolling back published tag");
            if let Err(rollback) = self.push_deletes(repo, std::slice::from_ref(&tag_ref), token) {
                tracing::warn!(repo = %self.name, tag = %tag_name, error = %rollback, "rollback of tag failed");
            }
            delete_local_ref(repo, &tag_ref);
            return Err(err);
        }
        tracing::info!(repo = %self.name, package = %package, revision = %revision, "published revision");

        if let Err(err) = self.publish_to_branch(repo, package, commit_id, &revision, token) {
            tracing::warn!(repo = %self.name, branch = %self.spec.branch, error = %err, "could not update branch with published package");
        }
        Ok(())
    }

    /// Copy the published package onto the repository branch
    fn publish_to_branch(&self, repo: &GitRepo, package: &str, commit_id: Oid, revision: &str, token: &CancellationToken) -> Result<()> {
        let dir = self.package_dir(package);
        let published = repo.find_commit(commit_id)?;
        let files = objects::read_files(repo, &published.tree()?, &dir)?;
        let branch_ref = refs::branch_ref(&self.spec.branch);
        let parent = repo
            .find_reference(&branch_ref)
            .ok()
            .and_then(|r| r.peel_to_commit().ok());
        let base = parent.as_ref().map(git2::Commit::tree).transpose()?;
        let tree = repo.find_tree(objects::replace_dir(repo, base.as_ref(), &dir, &files)?)?;
        let sig = self.signature()?;
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let oid = repo.commit(None, &sig, &sig, &format!("Publish {package}/{revision}"), &tree, &parents)?;
        self.push_new_ref(repo, &branch_ref, oid, &[], token)
    }
}

fn delete_local_ref(repo: &GitRepo, refname: &str) {
    if let Ok(mut reference) = repo.find_reference(refname) {
        if let Err(err) = reference.delete() {
            tracing::warn!(refname, error = %err, "failed to delete local ref");
        }
    }
}

impl Repository for GitRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn repo_type(&self) -> RepositoryType {
        RepositoryType::Git
    }

    fn location(&self) -> String {
        self.spec.repo.clone()
    }

    fn list_revisions(&self, filter: &RevisionFilter, token: &CancellationToken) -> Result<Vec<RevisionHead>> {
        self.synced(token, |repo| {
            Ok(self
                .load_heads(repo)?
                .into_iter()
                .filter(|h| filter.matches(h))
                .collect())
        })
    }

    fn get_resources(&self, key: &PackageRevisionKey, token: &CancellationToken) -> Result<Resources> {
        self.synced(token, |repo| {
            let head = self.find_head(repo, key)?;
            let commit = repo.find_commit(Oid::from_str(&head.resource_version)?)?;
            objects::read_files(repo, &commit.tree()?, &self.package_dir(&key.package))
        })
    }

    fn create_draft(&self, package: &str, workspace: &str, steps: Vec<TaskStep>, token: &CancellationToken) -> Result<RevisionHead> {
        if steps.is_empty() {
            return Err(PorchError::internal("draft without any task step"));
        }
        self.synced(token, |repo| {
            ensure_workspace_free(&self.load_heads(repo)?, package, workspace)?;
            let mut parent = repo
                .find_reference(&refs::branch_ref(&self.spec.branch))
                .ok()
                .and_then(|r| r.peel_to_commit().ok());
            for step in &steps {
                token.check("create draft")?;
                let oid = self.commit_step(repo, parent.as_ref(), package, workspace, step)?;
                parent = Some(repo.find_commit(oid)?);
            }
            let head = parent.ok_or_else(|| PorchError::internal("no commit written"))?;
            self.push_new_ref(repo, &refs::draft_ref(package, workspace), head.id(), &[], token)?;
            tracing::info!(repo = %self.name, package, workspace, "created draft");
            self.find_head(repo, &PackageRevisionKey::new(&self.name, package, workspace, ""))
        })
    }

    fn update_resources(&self, key: &PackageRevisionKey, step: TaskStep, token: &CancellationToken) -> Result<RevisionHead> {
        self.synced(token, |repo| {
            let head = self.find_head(repo, key)?;
            ensure_draft(&head)?;
            let parent = repo.find_commit(Oid::from_str(&head.resource_version)?)?;
            let oid = self.commit_step(repo, Some(&parent), &key.package, &key.workspace, &step)?;
            self.push_new_ref(repo, &refs::draft_ref(&key.package, &key.workspace), oid, &[], token)?;
            self.find_head(repo, key)
        })
    }

    fn update_lifecycle(&self, key: &PackageRevisionKey, lifecycle: Lifecycle, token: &CancellationToken) -> Result<RevisionHead> {
        self.synced(token, |repo| {
            let head = self.find_head(repo, key)?;
            if head.lifecycle == lifecycle {
                return Ok(head);
            }
            let (package, workspace) = (&head.key.package, &head.key.workspace);
            let commit = Oid::from_str(&head.resource_version)?;
            let draft = refs::draft_ref(package, workspace);
            let proposed = refs::proposed_ref(package, workspace);
            match (head.lifecycle, lifecycle) {
                (Lifecycle::Draft, Lifecycle::Proposed) => {
                    self.push_new_ref(repo, &proposed, commit, &[format!(":{draft}")], token)?;
                    delete_local_ref(repo, &draft);
                }
                (Lifecycle::Proposed, Lifecycle::Draft) => {
                    self.push_new_ref(repo, &draft, commit, &[format!(":{proposed}")], token)?;
                    delete_local_ref(repo, &proposed);
                }
                (Lifecycle::Draft | Lifecycle::Proposed, Lifecycle::Published) => self.publish_tag(repo, &head, token)?,
                (Lifecycle::Published, Lifecycle::DeletionProposed) => {
                    let marker = refs::deletion_proposed_ref(package, &head.key.revision);
                    self.push_new_ref(repo, &marker, commit, &[], token)?;
                }
                (Lifecycle::DeletionProposed, Lifecycle::Published) => {
                    let marker = refs::deletion_proposed_ref(package, &head.key.revision);
                    self.push_deletes(repo, &[marker], token)?;
                }
                (from, to) => {
                    return Err(PorchError::LifecycleConflict {
                        name: head.object_name(),
                        message: format!("cannot move from {from} to {to}"),
                    });
                }
            }
            self.find_head(repo, key)
        })
    }

    fn delete_revision(&self, key: &PackageRevisionKey, token: &CancellationToken) -> Result<()> {
        self.synced(token, |repo| {
            let head = self.find_head(repo, key)?;
            let (package, workspace, revision) = (&head.key.package, &head.key.workspace, &head.key.revision);
            let refnames = match head.lifecycle {
                Lifecycle::Draft => vec![refs::draft_ref(package, workspace)],
                Lifecycle::Proposed => vec![refs::proposed_ref(package, workspace)],
                Lifecycle::DeletionProposed => vec![
                    refs::tag_ref(package, revision),
                    refs::deletion_proposed_ref(package, revision),
                ],
                Lifecycle::Published => {
                    return Err(PorchError::LifecycleConflict {
                        name: head.object_name(),
                        message: "published revisions must be proposed for deletion first".to_string(),
                    });
                }
            };
            self.push_deletes(repo, &refnames, token)?;
            tracing::info!(repo = %self.name, revision = %head.key, "deleted revision");
            Ok(())
        })
    }

    fn list_refs(&self, token: &CancellationToken) -> Result<Vec<String>> {
        self.synced(token, |repo| {
            let mut names = Vec::new();
            for reference in repo.references()? {
                if let Some(name) = reference?.name() {
                    names.push(name.to_string());
                }
            }
            names.sort();
            Ok(names)
        })
    }

    fn refresh(&self, token: &CancellationToken) -> Result<()> {
        self.synced(token, |_| Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Task;
    use crate::model::task::InitTask;
    use tempfile::TempDir;

    struct Fixture {
        remote: TempDir,
        _cache: TempDir,
        repo: GitRepository,
    }

    fn fixture() -> Fixture {
        let remote = TempDir::new().unwrap();
        git2::Repository::init_bare(remote.path()).unwrap();
        let cache = TempDir::new().unwrap();
        let ctx = BackendContext::new(cache.path());
        let url = format!("file://{}", remote.path().display());
        let repo = GitRepository::open("r1", &crate::repository::RepositorySpec::git(url).git.unwrap(), None, &ctx, &CancellationToken::none()).unwrap();
        Fixture {
            remote,
            _cache: cache,
            repo,
        }
    }

    fn step(files: &[(&str, &str)]) -> TaskStep {
        TaskStep::new(
            Task::Init(InitTask::default()),
            files
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_draft_lifecycle_to_published() {
        let fx = fixture();
        let token = CancellationToken::none();
        let head = fx.repo.create_draft("pkg-a", "ws1", vec![step(&[("Kptfile", "kind: Kptfile\n")])], &token).unwrap();
        assert_eq!(head.lifecycle, Lifecycle::Draft);
        assert_eq!(head.tasks.len(), 1);
        assert_eq!(head.self_lock.as_ref().and_then(|l| l.git_ref()), Some("drafts/pkg-a/ws1"));

        let proposed = fx.repo.propose(&head.key, &token).unwrap();
        assert_eq!(proposed.lifecycle, Lifecycle::Proposed);
        let published = fx.repo.approve(&head.key, &token).unwrap();
        assert_eq!(published.lifecycle, Lifecycle::Published);
        assert_eq!(published.key.revision, "v1");
        assert_eq!(published.key.workspace, "ws1");
        assert_eq!(published.tasks.len(), 1);

        let refs = fx.repo.list_refs(&token).unwrap();
        assert!(refs.contains(&"refs/tags/pkg-a/v1".to_string()));
        assert!(!refs.iter().any(|r| r.starts_with("refs/heads/proposed/")));
        assert!(refs.contains(&"refs/heads/main".to_string()));

        let resources = fx.repo.get_resources(&published.key, &token).unwrap();
        assert_eq!(resources["Kptfile"], "kind: Kptfile\n");
    }

    #[test]
    fn test_workspace_must_be_unique() {
        let fx = fixture();
        let token = CancellationToken::none();
        fx.repo.create_draft("pkg-a", "ws1", vec![step(&[("a.txt", "a")])], &token).unwrap();
        let err = fx
            .repo
            .create_draft("pkg-a", "ws1", vec![step(&[("a.txt", "b")])], &token)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }

    #[test]
    fn test_update_resources_appends_step() {
        let fx = fixture();
        let token = CancellationToken::none();
        let head = fx.repo.create_draft("pkg-a", "ws1", vec![step(&[("a.txt", "a")])], &token).unwrap();
        let updated = fx
            .repo
            .update_resources(&head.key, TaskStep { task: None, resources: [("a.txt".to_string(), "b".to_string())].into() }, &token)
            .unwrap();
        assert_ne!(updated.resource_version, head.resource_version);
        assert_eq!(updated.tasks.len(), 1);
        assert_eq!(fx.repo.get_resources(&head.key, &token).unwrap()["a.txt"], "b");
    }

    #[test]
    fn test_second_publish_gets_next_revision_and_deletion_flow() {
        let fx = fixture();
        let token = CancellationToken::none();
        let first = fx.repo.create_draft("pkg-a", "ws1", vec![step(&[("a.txt", "1")])], &token).unwrap();
        fx.repo.approve(&first.key, &token).unwrap();
        let second = fx.repo.create_draft("pkg-a", "ws2", vec![step(&[("a.txt", "2")])], &token).unwrap();
        let v2 = fx.repo.approve(&second.key, &token).unwrap();
        assert_eq!(v2.key.revision, "v2");

        let published_err = fx.repo.delete_revision(&v2.key, &token).unwrap_err();
        assert_eq!(published_err.kind(), crate::error::ErrorKind::Conflict);
        let marked = fx.repo.propose_deletion(&v2.key, &token).unwrap();
        assert_eq!(marked.lifecycle, Lifecycle::DeletionProposed);
        fx.repo.delete_revision(&v2.key, &token).unwrap();
        let remaining = fx.repo.list_revisions(&RevisionFilter::package("pkg-a"), &token).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].key.revision, "v1");
    }

    #[test]
    fn test_plain_tags_are_listed_without_tasks() {
        let fx = fixture();
        let token = CancellationToken::none();
        let remote = git2::Repository::open(fx.remote.path()).unwrap();
        let files: Resources = [("pkg-b/Kptfile".to_string(), "kind: Kptfile\n".to_string())].into();
        let tree_id = objects::write_files(&remote, &files).unwrap().unwrap();
        let tree = remote.find_tree(tree_id).unwrap();
        let sig = git2::Signature::now("t", "t@t").unwrap();
        let oid = remote.commit(Some("refs/heads/main"), &sig, &sig, "init", &tree, &[]).unwrap();
        remote.reference("refs/tags/pkg-b/v1", oid, false, "tag").unwrap();

        let heads = fx.repo.list_revisions(&RevisionFilter::package("pkg-b"), &token).unwrap();
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].key.workspace, "v1");
        assert_eq!(heads[0].lifecycle, Lifecycle::Published);
        assert!(heads[0].tasks.is_empty());
        assert_eq!(heads[0].object_name(), "r1.pkg-b.v1");
    }

    fn tag_blob(fx: &Fixture, refname: &str) {
        let remote = git2::Repository::open(fx.remote.path()).unwrap();
        let blob = remote.blob(b"not a package").unwrap();
        remote.reference(refname, blob, true, "tag").unwrap();
    }

    #[test]
    fn test_unreadable_ref_is_skipped() {
        let fx = fixture();
        let token = CancellationToken::none();
        fx.repo.create_draft("pkg-a", "ws1", vec![step(&[("a.txt", "a")])], &token).unwrap();
        tag_blob(&fx, "refs/tags/pkg-a/v9");

        let heads = fx.repo.list_revisions(&RevisionFilter::package("pkg-a"), &token).unwrap();
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].lifecycle, Lifecycle::Draft);
    }

    #[test]
    fn test_publish_onto_existing_tag_leaves_draft() {
        let fx = fixture();
        let token = CancellationToken::none();
        let draft = fx.repo.create_draft("pkg-a", "ws1", vec![step(&[("a.txt", "a")])], &token).unwrap();
        tag_blob(&fx, "refs/tags/pkg-a/v1");

        let err = fx.repo.approve(&draft.key, &token).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
        assert!(matches!(err, PorchError::TagExists { ref tag } if tag == "pkg-a/v1"));

        let heads = fx.repo.list_revisions(&RevisionFilter::package("pkg-a"), &token).unwrap();
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].lifecycle, Lifecycle::Draft);
        assert_eq!(heads[0].resource_version, draft.resource_version);
        assert!(fx.repo.list_refs(&token).unwrap().contains(&"refs/heads/drafts/pkg-a/ws1".to_string()));
    }
}
