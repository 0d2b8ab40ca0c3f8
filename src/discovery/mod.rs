//! Update discovery
//!
//! A downstream revision records where it came from in its upstream lock.
//! Matching the lock's location against the registered repositories and
//! comparing the locked revision with the upstream package's published
//! revisions yields the updates a downstream could take. Inverting that
//! table answers which downstreams lag behind a given upstream revision.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::git::refs::parse_lock_ref;
use crate::git::url::with_git_suffix;
use crate::model::{Lifecycle, RevisionFilter, RevisionHead, UpstreamLock, compare_revisions};
use crate::reference::ReferenceType;
use crate::repository::Repository;

/// Newer upstream revisions available to one downstream revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamUpdates {
    /// Object name of the downstream revision
    pub downstream: String,
    pub upstream_repository: String,
    pub upstream_package: String,
    /// Locked upstream revision; the workspace name when a draft was cloned
    pub current: String,
    #[serde(default)]
    pub draft: bool,
    /// Newer published revisions, oldest first
    pub available: Vec<String>,
}

/// Downstream revisions that could move to one upstream revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownstreamUpdates {
    pub upstream_repository: String,
    pub upstream_package: String,
    pub revision: String,
    /// Upstream draft the downstreams were cloned from, empty when they
    /// track a published revision
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub draft_name: String,
    pub downstreams: Vec<String>,
}

impl DownstreamUpdates {
    /// `upstream-name:upstream-rev:draft-name` grouping key
    pub fn group(&self) -> String {
        format!(
            "{}.{}:{}:{}",
            self.upstream_repository, self.upstream_package, self.revision, self.draft_name
        )
    }
}

/// Available upstream updates of every downstream in `downstreams`
///
/// Downstreams without an upstream lock, or whose upstream is not a
/// registered repository, are left out, as are those already on the latest
/// revision.
pub fn upstream_updates(
    downstreams: &[RevisionHead],
    repositories: &[Arc<dyn Repository>],
    token: &CancellationToken,
) -> Result<Vec<UpstreamUpdates>> {
    let mut published: HashMap<(String, String), Vec<String>> = HashMap::new();
    let mut updates = Vec::new();
    for head in downstreams {
        token.check("discover updates")?;
        let Some(lock) = &head.upstream_lock else { continue };
        let Some(git_ref) = lock.git_ref().filter(|r| !r.is_empty()) else {
            continue;
        };
        let locked = match parse_lock_ref(git_ref) {
            Ok(locked) => locked,
            Err(e) => {
                tracing::debug!(downstream = %head.object_name(), error = %e, "unparsable upstream lock ref");
                continue;
            }
        };
        let Some(repo) = repositories.iter().find(|r| lock_in_repository(lock, r.as_ref())) else {
            continue;
        };

        let cache_key = (repo.name().to_string(), locked.package.clone());
        let revisions = match published.get(&cache_key) {
            Some(revisions) => revisions.clone(),
            None => {
                let revisions = published_revisions(repo.as_ref(), &locked.package, token)?;
                published.insert(cache_key, revisions.clone());
                revisions
            }
        };
        // Drafts compare as v0.
        let current = if locked.draft { "" } else { locked.revision.as_str() };
        let available: Vec<String> = revisions
            .into_iter()
            .filter(|r| compare_revisions(r, current) == Ordering::Greater)
            .collect();
        if available.is_empty() {
            continue;
        }
        updates.push(UpstreamUpdates {
            downstream: head.object_name(),
            upstream_repository: repo.name().to_string(),
            upstream_package: locked.package,
            current: locked.revision,
            draft: locked.draft,
            available,
        });
    }
    Ok(updates)
}

/// Invert upstream updates: per upstream revision, the downstreams behind it
pub fn downstream_updates(updates: &[UpstreamUpdates]) -> Vec<DownstreamUpdates> {
    let mut grouped: BTreeMap<(String, String, String, String), Vec<String>> = BTreeMap::new();
    for update in updates {
        let draft_name = if update.draft { update.current.clone() } else { String::new() };
        for revision in &update.available {
            grouped
                .entry((
                    update.upstream_repository.clone(),
                    update.upstream_package.clone(),
                    revision.clone(),
                    draft_name.clone(),
                ))
                .or_default()
                .push(update.downstream.clone());
        }
    }
    let mut result: Vec<DownstreamUpdates> = grouped
        .into_iter()
        .map(|((upstream_repository, upstream_package, revision, draft_name), mut downstreams)| {
            downstreams.sort();
            downstreams.dedup();
            DownstreamUpdates {
                upstream_repository,
                upstream_package,
                revision,
                draft_name,
                downstreams,
            }
        })
        .collect();
    result.sort_by(|a, b| {
        (&a.upstream_repository, &a.upstream_package)
            .cmp(&(&b.upstream_repository, &b.upstream_package))
            .then_with(|| compare_revisions(&a.revision, &b.revision))
            .then_with(|| a.draft_name.cmp(&b.draft_name))
    });
    result
}

fn published_revisions(repo: &dyn Repository, package: &str, token: &CancellationToken) -> Result<Vec<String>> {
    let filter = RevisionFilter {
        lifecycle: Some(Lifecycle::Published),
        ..RevisionFilter::package(package)
    };
    let mut revisions: Vec<String> = repo
        .list_revisions(&filter, token)?
        .into_iter()
        .map(|h| h.key.revision)
        .filter(|r| !r.is_empty())
        .collect();
    revisions.sort_by(|a, b| compare_revisions(a, b));
    revisions.dedup();
    Ok(revisions)
}

/// Whether the locked source lives in `repo`
fn lock_in_repository(lock: &UpstreamLock, repo: &dyn Repository) -> bool {
    let Some(location) = lock.location() else {
        return false;
    };
    let repo_location = repo.location();
    match lock.lock_type {
        ReferenceType::Git => with_git_suffix(location) == with_git_suffix(&repo_location),
        ReferenceType::Dir => Path::new(location).starts_with(&repo_location),
        ReferenceType::Oci => location.starts_with(&format!("{}/", repo_location.trim_end_matches('/'))),
        ReferenceType::Stream => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::function::BuiltinRuntime;
    use crate::engine::{Engine, NewRevision};
    use crate::model::Task;
    use crate::model::lifecycle::TransitionStrategy;
    use crate::model::task::{CloneTask, InitTask, PackageRevisionRef};
    use crate::repository::dir::DirRepository;
    use crate::repository::{BackendContext, RepositorySet};
    use tempfile::TempDir;

    const NS: &str = "default";

    fn engine(temp: &TempDir) -> Engine {
        let repos = Arc::new(RepositorySet::new());
        for name in ["up", "down"] {
            repos.insert(NS, Arc::new(DirRepository::open(name, &temp.path().join(name)).unwrap()));
        }
        Engine::new(repos, BackendContext::new(temp.path().join("cache")), Arc::new(BuiltinRuntime::new()))
    }

    fn publish(engine: &Engine, repo: &str, package: &str, workspace: &str, task: Task) -> RevisionHead {
        let token = CancellationToken::none();
        let head = engine
            .create_package_revision(NS, &NewRevision::draft(repo, package, workspace, vec![task]), &token)
            .unwrap();
        engine
            .update_lifecycle(NS, &head.key, Lifecycle::Proposed, TransitionStrategy::Update, &token)
            .unwrap();
        engine
            .update_lifecycle(NS, &head.key, Lifecycle::Published, TransitionStrategy::Approval, &token)
            .unwrap()
    }

    fn clone_of(name: &str) -> Task {
        Task::Clone(CloneTask {
            upstream_ref: Some(PackageRevisionRef::new(name)),
            ..CloneTask::default()
        })
    }

    #[test]
    fn test_newer_revisions_are_reported() {
        let temp = TempDir::new().unwrap();
        let engine = engine(&temp);
        let token = CancellationToken::none();
        let v1 = publish(&engine, "up", "web", "a", Task::Init(InitTask::default()));
        let downstream = publish(&engine, "down", "web", "ws1", clone_of(&v1.object_name()));
        publish(&engine, "up", "web", "b", Task::Init(InitTask::default()));
        publish(&engine, "up", "web", "c", Task::Init(InitTask::default()));

        let repos = engine.repositories().in_namespace(NS);
        let heads = repos[0].list_revisions(&RevisionFilter::default(), &token).unwrap();
        let updates = upstream_updates(&heads, &repos, &token).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].downstream, downstream.object_name());
        assert_eq!(updates[0].current, "v1");
        assert_eq!(updates[0].available, vec!["v2", "v3"]);

        let inverted = downstream_updates(&updates);
        assert_eq!(inverted.len(), 2);
        assert_eq!(inverted[0].group(), "up.web:v2:");
        assert_eq!(inverted[1].downstreams, vec![downstream.object_name()]);
    }

    #[test]
    fn test_cloned_draft_counts_as_v0() {
        let temp = TempDir::new().unwrap();
        let engine = engine(&temp);
        let token = CancellationToken::none();
        let draft = engine
            .create_package_revision(NS, &NewRevision::draft("up", "web", "a", vec![Task::Init(InitTask::default())]), &token)
            .unwrap();
        engine
            .create_package_revision(NS, &NewRevision::draft("down", "web", "ws1", vec![clone_of(&draft.object_name())]), &token)
            .unwrap();
        publish(&engine, "up", "web", "b", Task::Init(InitTask::default()));

        let repos = engine.repositories().in_namespace(NS);
        let heads = repos[0].list_revisions(&RevisionFilter::default(), &token).unwrap();
        let updates = upstream_updates(&heads, &repos, &token).unwrap();
        assert_eq!(updates.len(), 1);
        assert!(updates[0].draft);
        assert_eq!(updates[0].available, vec!["v1"]);
        assert_eq!(downstream_updates(&updates)[0].group(), "up.web:v1:a");
    }

    #[test]
    fn test_downstreams_of_different_drafts_are_grouped_apart() {
        let update = |downstream: &str, current: &str, draft: bool| UpstreamUpdates {
            downstream: downstream.to_string(),
            upstream_repository: "up".to_string(),
            upstream_package: "web".to_string(),
            current: current.to_string(),
            draft,
            available: vec!["v2".to_string()],
        };
        let inverted = downstream_updates(&[
            update("down.web.a", "a", true),
            update("down.web.b", "b", true),
            update("down.web.c", "v1", false),
            update("down.web.d", "a", true),
        ]);
        let groups: Vec<(String, Vec<String>)> = inverted.iter().map(|d| (d.group(), d.downstreams.clone())).collect();
        assert_eq!(
            groups,
            vec![
                ("up.web:v2:".to_string(), vec!["down.web.c".to_string()]),
                ("up.web:v2:a".to_string(), vec!["down.web.a".to_string(), "down.web.d".to_string()]),
                ("up.web:v2:b".to_string(), vec!["down.web.b".to_string()]),
            ]
        );
    }

    #[test]
    fn test_git_urls_match_with_or_without_suffix() {
        let lock = UpstreamLock::git("https://example.com/r1", "pkg-a", "pkg-a/v1", "abc");
        assert_eq!(with_git_suffix(lock.location().unwrap()), with_git_suffix("https://example.com/r1.git"));
    }
}
