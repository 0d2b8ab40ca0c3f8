use std::collections::BTreeSet;
use std::sync::Arc;

use super::{
    AdoptionPolicy, DeletionPolicy, DownstreamPackage, DownstreamTarget, FINALIZER, PACKAGE_VARIANT_KIND,
    PackageVariant, UpstreamPackage, validate,
};
use crate::api::Porch;
use crate::api::objects::PackageRevision;
use crate::cancel::CancellationToken;
use crate::controllers::cluster::{ClusterStore, ObjectKey};
use crate::controllers::runtime::Reconciler;
use crate::error::{PorchError, Result};
use crate::git::refs::parse_lock_ref;
use crate::model::meta::set_condition;
use crate::model::task::{CloneTask, EditTask, PackageRevisionRef, UpdateTask};
use crate::model::{Condition, Lifecycle, Task, compare_revisions};

const WORKSPACE_PREFIX: &str = "packagevariant";

/// Keeps the downstream revisions of each PackageVariant current
pub struct DownstreamReconciler {
    porch: Arc<Porch>,
    cluster: Arc<ClusterStore>,
}

impl DownstreamReconciler {
    pub fn new(porch: Arc<Porch>, cluster: Arc<ClusterStore>) -> Self {
        Self { porch, cluster }
    }

    fn reconcile_variant(&self, variant: PackageVariant, token: &CancellationToken) -> Result<Vec<String>> {
        validate(&variant.spec).into_result(PACKAGE_VARIANT_KIND, &variant.metadata.name)?;
        let (Some(upstream), Some(downstream)) = (&variant.spec.upstream, &variant.spec.downstream) else {
            return Err(PorchError::internal("validated variant without upstream or downstream"));
        };
        let namespace = &variant.metadata.namespace;
        let source = self.upstream_revision(namespace, upstream, token)?;
        let owned = self.owned_revisions(&variant, downstream, token)?;
        let mut targets: Vec<String> = owned.iter().map(|r| r.metadata.name.clone()).collect();

        if owned.is_empty() {
            let clone = Task::Clone(CloneTask {
                upstream_ref: Some(PackageRevisionRef::new(&source.metadata.name)),
                ..CloneTask::default()
            });
            let workspace = self.free_workspace(namespace, downstream, &format!("{WORKSPACE_PREFIX}-1"), token)?;
            let created = self.create_owned(&variant, downstream, &workspace, clone, token)?;
            tracing::info!(variant = %variant.metadata.name, downstream = %created.metadata.name, "created downstream draft");
            targets.push(created.metadata.name);
            return Ok(targets);
        }

        let draft = owned.iter().find(|r| !r.spec.lifecycle.is_published());
        let latest_published = owned
            .iter()
            .filter(|r| r.spec.lifecycle == Lifecycle::Published)
            .max_by(|a, b| compare_revisions(&a.spec.revision, &b.spec.revision));
        let Some(working) = draft.or(latest_published) else {
            return Ok(targets);
        };
        if !is_stale(working, upstream) {
            return Ok(targets);
        }

        let working = if working.spec.lifecycle == Lifecycle::Published {
            let workspace = self.free_workspace(namespace, downstream, &next_workspace(&working.spec.workspace_name), token)?;
            let edit = Task::Edit(EditTask {
                source_ref: PackageRevisionRef::new(&working.metadata.name),
            });
            let created = self.create_owned(&variant, downstream, &workspace, edit, token)?;
            tracing::info!(variant = %variant.metadata.name, from = %working.metadata.name, draft = %created.metadata.name, "opened draft from published downstream");
            targets.push(created.metadata.name.clone());
            created
        } else {
            working.clone()
        };

        if working.spec.lifecycle != Lifecycle::Draft {
            tracing::debug!(downstream = %working.metadata.name, "stale downstream is under review, not updating");
            return Ok(targets);
        }
        let mut updated = working;
        updated.spec.tasks.push(Task::Update(UpdateTask {
            upstream_ref: Some(PackageRevisionRef::new(&source.metadata.name)),
            ..UpdateTask::default()
        }));
        let updated = self.porch.update_package_revision(&updated, token)?;
        tracing::info!(downstream = %updated.metadata.name, upstream = %source.metadata.name, "updated downstream to new upstream");
        Ok(targets)
    }

    /// The published upstream revision a variant declares
    fn upstream_revision(&self, namespace: &str, upstream: &UpstreamPackage, token: &CancellationToken) -> Result<PackageRevision> {
        self.porch
            .list_package_revisions(namespace, Some(&upstream.repo), token)?
            .into_iter()
            .find(|r| {
                r.spec.package_name == upstream.package
                    && r.spec.revision == upstream.revision
                    && r.spec.lifecycle == Lifecycle::Published
            })
            .ok_or_else(|| PorchError::PackageRevisionNotFound {
                name: format!("{}.{}:{}", upstream.repo, upstream.package, upstream.revision),
            })
    }

    /// Downstream revisions owned by `variant`, adopting unowned ones when
    /// the adoption policy allows it
    fn owned_revisions(
        &self,
        variant: &PackageVariant,
        downstream: &DownstreamPackage,
        token: &CancellationToken,
    ) -> Result<Vec<PackageRevision>> {
        let owner = variant.owner_reference();
        let mut owned = Vec::new();
        for revision in self.revisions_of(&variant.metadata.namespace, downstream, token)? {
            if revision.metadata.is_owned_by(&owner.uid) {
                owned.push(revision);
                continue;
            }
            let unowned = !revision
                .metadata
                .owner_references
                .iter()
                .any(|r| r.kind == PACKAGE_VARIANT_KIND);
            if unowned && variant.spec.adoption_policy == AdoptionPolicy::AdoptExisting {
                let mut adopted = revision;
                adopted.metadata.owner_references.push(owner.clone());
                let adopted = self.porch.update_package_revision(&adopted, token)?;
                tracing::info!(variant = %variant.metadata.name, downstream = %adopted.metadata.name, "adopted downstream revision");
                owned.push(adopted);
            }
        }
        Ok(owned)
    }

    fn revisions_of(&self, namespace: &str, downstream: &DownstreamPackage, token: &CancellationToken) -> Result<Vec<PackageRevision>> {
        Ok(self
            .porch
            .list_package_revisions(namespace, Some(&downstream.repo), token)?
            .into_iter()
            .filter(|r| r.spec.package_name == downstream.package)
            .collect())
    }

    /// `wanted`, or the next numbered workspace not taken in the package
    fn free_workspace(
        &self,
        namespace: &str,
        downstream: &DownstreamPackage,
        wanted: &str,
        token: &CancellationToken,
    ) -> Result<String> {
        let taken: BTreeSet<String> = self
            .revisions_of(namespace, downstream, token)?
            .into_iter()
            .map(|r| r.spec.workspace_name)
            .collect();
        let mut workspace = wanted.to_string();
        while taken.contains(&workspace) {
            workspace = next_workspace(&workspace);
        }
        Ok(workspace)
    }

    fn create_owned(
        &self,
        variant: &PackageVariant,
        downstream: &DownstreamPackage,
        workspace: &str,
        task: Task,
        token: &CancellationToken,
    ) -> Result<PackageRevision> {
        let mut object = PackageRevision::draft(
            &variant.metadata.namespace,
            &downstream.repo,
            &downstream.package,
            workspace,
            vec![task],
        );
        object.metadata.owner_references.push(variant.owner_reference());
        object.metadata.labels.clone_from(&variant.spec.labels);
        object.metadata.annotations.clone_from(&variant.spec.annotations);
        self.porch.create_package_revision(&object, token)
    }

    /// Apply the deletion policy to owned revisions and release the variant
    fn finalize(&self, mut variant: PackageVariant, token: &CancellationToken) -> Result<()> {
        if let Some(downstream) = variant.spec.downstream.clone() {
            let uid = variant.metadata.uid.clone();
            let namespace = variant.metadata.namespace.clone();
            for revision in self.revisions_of(&namespace, &downstream, token)? {
                if !revision.metadata.is_owned_by(&uid) {
                    continue;
                }
                match variant.spec.deletion_policy {
                    DeletionPolicy::Delete => self.delete_revision(revision, token)?,
                    DeletionPolicy::Orphan => {
                        let mut orphan = revision;
                        orphan.metadata.owner_references.retain(|r| r.uid != uid);
                        self.porch.update_package_revision(&orphan, token)?;
                    }
                }
            }
        }
        variant.metadata.finalizers.retain(|f| f != FINALIZER);
        variant.metadata.resource_version.clear();
        self.cluster.variants.update(variant)?;
        Ok(())
    }

    fn delete_revision(&self, revision: PackageRevision, token: &CancellationToken) -> Result<()> {
        let namespace = revision.metadata.namespace.clone();
        let name = revision.metadata.name.clone();
        if revision.spec.lifecycle == Lifecycle::Published {
            let mut proposed = revision;
            proposed.spec.lifecycle = Lifecycle::DeletionProposed;
            self.porch.update_package_revision(&proposed, token)?;
        }
        self.porch.delete_package_revision(&namespace, &name, token)?;
        tracing::info!(downstream = %name, "deleted downstream revision");
        Ok(())
    }
}

impl Reconciler for DownstreamReconciler {
    fn kind(&self) -> &'static str {
        PACKAGE_VARIANT_KIND
    }

    fn keys(&self) -> Vec<ObjectKey> {
        self.cluster.variants.keys()
    }

    fn reconcile(&self, key: &ObjectKey, token: &CancellationToken) -> Result<()> {
        let Some(mut variant) = self.cluster.variants.get(key) else {
            return Ok(());
        };
        if variant.metadata.deletion_timestamp.is_some() {
            return self.finalize(variant, token);
        }
        if !variant.metadata.finalizers.iter().any(|f| f == FINALIZER) {
            variant.metadata.finalizers.push(FINALIZER.to_string());
            variant.metadata.resource_version.clear();
            variant = self.cluster.variants.update(variant)?;
        }

        let targets = self.reconcile_variant(variant, token)?;
        self.cluster.variants.update_status(key, |v| {
            v.status.downstream_targets = targets.into_iter().map(|name| DownstreamTarget { name }).collect();
            set_condition(&mut v.status.conditions, Condition::new("Ready", true, "NoErrors", ""));
        })
    }

    fn record_failure(&self, key: &ObjectKey, error: &PorchError) {
        let condition = Condition::new("Ready", false, error.kind().reason(), error.to_string());
        if let Err(e) = self
            .cluster
            .variants
            .update_status(key, |v| set_condition(&mut v.status.conditions, condition))
        {
            tracing::debug!(%key, error = %e, "could not record failure");
        }
    }
}

/// Whether the upstream lock of `revision` lags behind `upstream`
///
/// A lock on a draft is always stale.
fn is_stale(revision: &PackageRevision, upstream: &UpstreamPackage) -> bool {
    let Some(git_ref) = revision.status.upstream_lock.as_ref().and_then(|l| l.git_ref()) else {
        return true;
    };
    match parse_lock_ref(git_ref) {
        Ok(locked) => locked.draft || locked.package != upstream.package || locked.revision != upstream.revision,
        Err(_) => true,
    }
}

/// `ws-3` → `ws-4`; a name without a numeric suffix gets `-1`
fn next_workspace(workspace: &str) -> String {
    let stem = workspace.trim_end_matches(|c: char| c.is_ascii_digit());
    match workspace[stem.len()..].parse::<u64>() {
        Ok(n) if !stem.is_empty() => format!("{stem}{}", n + 1),
        _ => format!("{workspace}-1"),
    }
}
