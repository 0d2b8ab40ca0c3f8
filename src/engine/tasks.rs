//! Task application
//!
//! Each task maps the resources produced by the previous task to new
//! resources. Revisions referenced by a task (clone sources, edit sources,
//! update targets) are resolved at replay time through the registered
//! repositories; direct upstreams are fetched.

use std::collections::BTreeMap;

use serde_yaml::Value;

use super::Engine;
use super::function::{config_map, run_function};
use super::init::init_package;
use super::patch::apply_patch;
use crate::cancel::CancellationToken;
use crate::error::{PorchError, Result};
use crate::git::url::same_repo;
use crate::model::kptfile::KPTFILE_NAME;
use crate::model::task::{CloneTask, EditTask, EvalTask, PackageRevisionRef, UpdateTask};
use crate::model::{Kptfile, RevisionFilter, Resources, Task, UpdateStrategy, Upstream, UpstreamLock};
use crate::repository::fetch::{fetch_lock, fetch_reference};
use crate::resources::{self, add_merge_comments};

const KIND: &str = "PackageRevision";

/// Upstream content together with where it came from
struct Source {
    resources: Resources,
    lock: UpstreamLock,
    upstream: Upstream,
}

impl Engine {
    /// Apply one task to `current`
    pub(crate) fn apply_task(
        &self,
        namespace: &str,
        package: &str,
        task: &Task,
        current: Resources,
        token: &CancellationToken,
    ) -> Result<Resources> {
        token.check("apply task")?;
        match task {
            Task::Init(init) => init_package(package, init),
            Task::Clone(clone) => self.clone_package(namespace, package, clone, token),
            Task::Edit(edit) => self.edit_package(namespace, package, edit, token),
            Task::Patch(patch) => {
                let mut resources = current;
                apply_patch(&mut resources, patch)?;
                Ok(resources)
            }
            Task::Eval(eval) => self.eval(eval, current, token),
            Task::Update(update) => self.update_package(namespace, package, update, current, token),
        }
    }

    fn clone_package(
        &self,
        namespace: &str,
        package: &str,
        task: &CloneTask,
        token: &CancellationToken,
    ) -> Result<Resources> {
        let source = self.resolve_source(namespace, task.upstream_ref.as_ref(), task.upstream.as_ref(), token)?;
        let mut resources = add_merge_comments(&source.resources);
        let name = package.rsplit('/').next().unwrap_or(package);
        let mut kptfile = Kptfile::from_resources(&resources, "")?.unwrap_or_else(|| Kptfile::new(name));
        kptfile.metadata.name = name.to_string();
        let mut upstream = source.upstream;
        upstream.update_strategy = Some(task.strategy.unwrap_or_default());
        kptfile.upstream = Some(upstream);
        kptfile.upstream_lock = Some(source.lock);
        kptfile.store(&mut resources, "")?;
        tracing::debug!(package, files = resources.len(), "cloned package");
        Ok(resources)
    }

    fn edit_package(&self, namespace: &str, package: &str, task: &EditTask, token: &CancellationToken) -> Result<Resources> {
        let (repo, head) = self
            .repositories()
            .find_revision(namespace, &task.source_ref.name, token)?;
        if head.key.package != package {
            return Err(PorchError::invalid_field(
                KIND,
                package,
                "spec.tasks.edit.sourceRef",
                format!("source {} belongs to package {}", task.source_ref.name, head.key.package),
            ));
        }
        repo.get_resources(&head.key, token)
    }

    fn eval(&self, task: &EvalTask, current: Resources, token: &CancellationToken) -> Result<Resources> {
        let config = match &task.config {
            Some(config) => Some(serde_yaml::to_value(config)?),
            None if task.config_map.is_empty() => None,
            None => Some(config_map(&task.config_map)),
        };
        let parsed = resources::parse_package(&current);
        let docs = run_function(self.runtime.as_ref(), &task.image, config, &parsed.docs, token)?;
        let mut files = parsed.opaque;
        files.extend(resources::write_documents(&docs)?);
        Ok(files)
    }

    fn update_package(
        &self,
        namespace: &str,
        package: &str,
        task: &UpdateTask,
        current: Resources,
        token: &CancellationToken,
    ) -> Result<Resources> {
        let missing = |what: &str| PorchError::invalid_field(KIND, package, "spec.tasks.update", format!("package has no {what}"));
        let mut kptfile = Kptfile::from_resources(&current, "")?.ok_or_else(|| missing(KPTFILE_NAME))?;
        let old_lock = kptfile.upstream_lock.clone().ok_or_else(|| missing("upstreamLock"))?;
        let source = self.resolve_source(namespace, task.upstream_ref.as_ref(), task.upstream.as_ref(), token)?;
        if same_lock(&old_lock, &source.lock) {
            tracing::debug!(package, "upstream unchanged, nothing to update");
            return Ok(current);
        }

        let strategy = task
            .strategy
            .or_else(|| kptfile.upstream.as_ref().and_then(|u| u.update_strategy))
            .unwrap_or_default();
        let original = add_merge_comments(&self.fetch_locked(namespace, &old_lock, token)?);
        let updated = add_merge_comments(&source.resources);
        let mut merged = match strategy {
            UpdateStrategy::ResourceMerge => {
                // The root Kptfile is renamed on clone; it is rebuilt below.
                let without_root = |r: &Resources| {
                    let mut r = r.clone();
                    r.remove(KPTFILE_NAME);
                    r
                };
                self.merger
                    .merge(&without_root(&original), &without_root(&updated), &without_root(&current))?
            }
            UpdateStrategy::FastForward => {
                if content_without_kptfiles(&original) != content_without_kptfiles(&current) {
                    return Err(PorchError::invalid_field(
                        KIND,
                        package,
                        "spec.tasks.update.strategy",
                        "fast-forward is not possible, the package has local changes",
                    ));
                }
                updated
            }
            UpdateStrategy::ForceDeleteReplace => updated,
        };

        let mut upstream = source.upstream;
        upstream.update_strategy = Some(strategy);
        kptfile.upstream = Some(upstream);
        kptfile.upstream_lock = Some(source.lock);
        kptfile.store(&mut merged, "")?;
        tracing::info!(package, ?strategy, "updated package from upstream");
        Ok(merged)
    }

    fn resolve_source(
        &self,
        namespace: &str,
        upstream_ref: Option<&PackageRevisionRef>,
        upstream: Option<&Upstream>,
        token: &CancellationToken,
    ) -> Result<Source> {
        if let Some(upstream_ref) = upstream_ref {
            let (repo, head) = self
                .repositories()
                .find_revision(namespace, &upstream_ref.name, token)?;
            let lock = head
                .self_lock
                .clone()
                .ok_or_else(|| PorchError::internal(format!("revision {} has no lock", upstream_ref.name)))?;
            return Ok(Source {
                resources: repo.get_resources(&head.key, token)?,
                upstream: lock.to_upstream()?,
                lock,
            });
        }
        let upstream = upstream.ok_or_else(|| {
            PorchError::invalid_field(KIND, "", "spec.tasks", "one of upstreamRef and upstream is required")
        })?;
        let fetched = fetch_reference(&upstream.to_reference()?, self.context(), None, token)?;
        Ok(Source {
            resources: fetched.resources,
            lock: fetched.lock,
            upstream: upstream.clone(),
        })
    }

    /// Content pinned by `lock`, read through a registered repository when
    /// one holds the locked revision
    pub(crate) fn fetch_locked(&self, namespace: &str, lock: &UpstreamLock, token: &CancellationToken) -> Result<Resources> {
        for repo in self.repositories().in_namespace(namespace) {
            let heads = repo.list_revisions(&RevisionFilter::default(), token)?;
            let hit = heads
                .into_iter()
                .find(|h| h.self_lock.as_ref().is_some_and(|l| same_lock(l, lock)));
            if let Some(head) = hit {
                return repo.get_resources(&head.key, token);
            }
        }
        fetch_lock(lock, self.context(), None, token)
    }
}

/// Whether two locks pin the same content at the same location
fn same_lock(a: &UpstreamLock, b: &UpstreamLock) -> bool {
    let same_location = match (a.location(), b.location()) {
        (Some(x), Some(y)) => same_repo(x, y),
        _ => false,
    };
    a.lock_type == b.lock_type
        && a.id() == b.id()
        && same_location
        && a.git.as_ref().map(|g| g.directory.as_str()) == b.git.as_ref().map(|g| g.directory.as_str())
}

/// Parsed documents and opaque files, Kptfiles excluded
fn content_without_kptfiles(resources: &Resources) -> BTreeMap<String, Vec<Value>> {
    let parsed = resources::parse_package(resources);
    let is_kptfile = |path: &str| path == KPTFILE_NAME || path.ends_with(&format!("/{KPTFILE_NAME}"));
    let mut content: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for doc in parsed.docs.into_iter().filter(|d| !is_kptfile(&d.file)) {
        content.entry(doc.file).or_default().push(doc.value);
    }
    for (path, text) in parsed.opaque.into_iter().filter(|(p, _)| !is_kptfile(p)) {
        content.entry(path).or_default().push(Value::String(text));
    }
    content
}
