//! OCI registry backend
//!
//! Each package is one registry repository `<prefix>/<package>`. Published
//! revisions are tags named after the revision; drafts and proposed
//! revisions live under `drafts.<workspace>`, and a revision proposed for
//! deletion carries an extra `deletion-proposed.<revision>` tag.
//!
//! The image config blob records lifecycle, workspace, revision, tasks and
//! the upstream lock, so listing never has to download layers. Registries
//! keep no history: only the latest task step's resources are stored.

pub mod layers;
pub mod registry;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use registry::{Descriptor, HttpRegistry, Manifest, MemoryRegistry, Registry};

use super::{Repository, RepositoryType, TaskStep, ensure_draft, ensure_workspace_free};
use crate::cancel::CancellationToken;
use crate::error::{PorchError, Result};
use crate::model::{
    Kptfile, Lifecycle, PackageRevisionKey, Resources, RevisionFilter, RevisionHead, Task, UpstreamLock,
    next_revision,
};

pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.porch.package.config.v1+json";
const DRAFT_TAG_PREFIX: &str = "drafts.";
const DELETION_TAG_PREFIX: &str = "deletion-proposed.";

/// Revision metadata stored as the image config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevisionConfig {
    package: String,
    workspace: String,
    #[serde(default)]
    revision: String,
    lifecycle: Lifecycle,
    #[serde(default)]
    tasks: Vec<Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    upstream_lock: Option<UpstreamLock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    published_at: Option<DateTime<Utc>>,
}

/// One tagged manifest of a package
struct Tagged {
    tag: String,
    digest: String,
    manifest: Manifest,
    config: Option<RevisionConfig>,
}

pub struct OciRepository {
    name: String,
    /// Registry host plus repository prefix, e.g. `registry.local/packages`
    location: String,
    prefix: String,
    registry: Arc<dyn Registry>,
}

impl OciRepository {
    pub fn new(name: &str, location: &str, registry: Arc<dyn Registry>) -> Self {
        let location = location.trim_end_matches('/').to_string();
        let prefix = location
            .split_once('/')
            .map(|(_, path)| path.to_string())
            .unwrap_or_default();
        Self {
            name: name.to_string(),
            location,
            prefix,
            registry,
        }
    }

    fn image_repository(&self, package: &str) -> String {
        if self.prefix.is_empty() {
            package.to_string()
        } else {
            format!("{}/{package}", self.prefix)
        }
    }

    fn package_of(&self, repository: &str) -> Option<String> {
        if self.prefix.is_empty() {
            return Some(repository.to_string());
        }
        repository
            .strip_prefix(&format!("{}/", self.prefix))
            .map(ToString::to_string)
    }

    fn backend_error(&self, reference: &str, err: PorchError) -> PorchError {
        crate::backend_error!(&self.location, reference, err)
    }

    fn packages(&self) -> Result<Vec<String>> {
        let prefix = if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        };
        Ok(self
            .registry
            .list_repositories(&prefix)
            .map_err(|e| self.backend_error("catalog", e))?
            .iter()
            .filter_map(|r| self.package_of(r))
            .collect())
    }

    fn tagged(&self, package: &str, tag: &str) -> Result<Option<Tagged>> {
        let repository = self.image_repository(package);
        let Some((manifest, digest)) = self
            .registry
            .get_manifest(&repository, tag)
            .map_err(|e| self.backend_error(tag, e))?
        else {
            return Ok(None);
        };
        let config = if manifest.config.media_type == CONFIG_MEDIA_TYPE {
            let blob = self.registry.get_blob(&repository, &manifest.config.digest)?;
            Some(serde_json::from_slice(&blob)?)
        } else {
            None
        };
        Ok(Some(Tagged {
            tag: tag.to_string(),
            digest,
            manifest,
            config,
        }))
    }

    fn heads_of(&self, package: &str) -> Result<Vec<(RevisionHead, Tagged)>> {
        let repository = self.image_repository(package);
        let tags = self
            .registry
            .list_tags(&repository)
            .map_err(|e| self.backend_error(&repository, e))?;
        let deletion_marked: BTreeSet<&str> = tags
            .iter()
            .filter_map(|t| t.strip_prefix(DELETION_TAG_PREFIX))
            .collect();
        let mut heads = Vec::new();
        for tag in &tags {
            if tag.starts_with(DELETION_TAG_PREFIX) {
                continue;
            }
            let Some(tagged) = self.tagged(package, tag)? else {
                continue;
            };
            let head = self.head_of(package, &tagged, deletion_marked.contains(tag.as_str()));
            heads.push((head, tagged));
        }
        Ok(heads)
    }

    fn head_of(&self, package: &str, tagged: &Tagged, deletion_marked: bool) -> RevisionHead {
        let (workspace, revision, lifecycle, tasks, upstream_lock, published_at) = match &tagged.config {
            Some(config) => (
                config.workspace.clone(),
                config.revision.clone(),
                config.lifecycle,
                config.tasks.clone(),
                config.upstream_lock.clone(),
                config.published_at,
            ),
            None => (
                tagged.tag.clone(),
                tagged.tag.clone(),
                Lifecycle::Published,
                Vec::new(),
                None,
                None,
            ),
        };
        let lifecycle = if lifecycle == Lifecycle::Published && deletion_marked {
            Lifecycle::DeletionProposed
        } else {
            lifecycle
        };
        let image = format!("{}/{package}:{}", self.location, tagged.tag);
        RevisionHead {
            key: PackageRevisionKey::new(&self.name, package, workspace, revision),
            lifecycle,
            tasks,
            upstream_lock,
            self_lock: Some(UpstreamLock::oci(&image, "", &tagged.digest)),
            resource_version: tagged.digest.clone(),
            published_by: None,
            published_at,
        }
    }

    fn find(&self, key: &PackageRevisionKey) -> Result<(RevisionHead, Tagged)> {
        self.heads_of(&key.package)?
            .into_iter()
            .find(|(h, _)| h.key.workspace == key.workspace)
            .ok_or_else(|| PorchError::PackageRevisionNotFound { name: key.object_name() })
    }

    /// Upload resources and config, then tag the manifest
    fn write(&self, tag: &str, config: &RevisionConfig, resources: &Resources) -> Result<String> {
        let repository = self.image_repository(&config.package);
        let layer = layers::pack(resources)?;
        self.registry
            .put_blob(&repository, &layer)
            .map_err(|e| self.backend_error(tag, e))?;
        self.write_config(tag, config, Descriptor::new(layers::LAYER_MEDIA_TYPE, &layer))
    }

    fn write_config(&self, tag: &str, config: &RevisionConfig, layer: Descriptor) -> Result<String> {
        let repository = self.image_repository(&config.package);
        let config_bytes = serde_json::to_vec(config)?;
        self.registry
            .put_blob(&repository, &config_bytes)
            .map_err(|e| self.backend_error(tag, e))?;
        let manifest = Manifest::new(Descriptor::new(CONFIG_MEDIA_TYPE, &config_bytes), vec![layer]);
        self.registry
            .put_manifest(&repository, tag, &manifest)
            .map_err(|e| self.backend_error(tag, e))
    }

    fn read_layers(&self, package: &str, manifest: &Manifest) -> Result<Resources> {
        let repository = self.image_repository(package);
        let mut resources = Resources::new();
        for layer in &manifest.layers {
            let blob = self
                .registry
                .get_blob(&repository, &layer.digest)
                .map_err(|e| self.backend_error(&layer.digest, e))?;
            resources.extend(layers::unpack(&blob)?);
        }
        Ok(resources)
    }

    fn config_of(tagged: &Tagged, head: &RevisionHead) -> RevisionConfig {
        tagged.config.clone().unwrap_or_else(|| RevisionConfig {
            package: head.key.package.clone(),
            workspace: head.key.workspace.clone(),
            revision: head.key.revision.clone(),
            lifecycle: Lifecycle::Published,
            tasks: Vec::new(),
            upstream_lock: None,
            published_at: None,
        })
    }

    fn upstream_lock_of(resources: &Resources) -> Option<UpstreamLock> {
        Kptfile::from_resources(resources, "")
            .ok()
            .flatten()
            .and_then(|k| k.upstream_lock)
    }
}

fn draft_tag(workspace: &str) -> String {
    format!("{DRAFT_TAG_PREFIX}{workspace}")
}

fn deletion_tag(revision: &str) -> String {
    format!("{DELETION_TAG_PREFIX}{revision}")
}

impl Repository for OciRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn repo_type(&self) -> RepositoryType {
        RepositoryType::Oci
    }

    fn location(&self) -> String {
        self.location.clone()
    }

    fn list_revisions(&self, filter: &RevisionFilter, token: &CancellationToken) -> Result<Vec<RevisionHead>> {
        let packages = match &filter.package {
            Some(package) => vec![package.clone()],
            None => self.packages()?,
        };
        let mut heads = Vec::new();
        for package in packages {
            token.check("list revisions")?;
            heads.extend(
                self.heads_of(&package)?
                    .into_iter()
                    .map(|(h, _)| h)
                    .filter(|h| filter.matches(h)),
            );
        }
        heads.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(heads)
    }

    fn get_resources(&self, key: &PackageRevisionKey, token: &CancellationToken) -> Result<Resources> {
        token.check("read resources")?;
        let (_, tagged) = self.find(key)?;
        self.read_layers(&key.package, &tagged.manifest)
    }

    fn create_draft(&self, package: &str, workspace: &str, steps: Vec<TaskStep>, token: &CancellationToken) -> Result<RevisionHead> {
        token.check("create draft")?;
        let heads: Vec<RevisionHead> = self.heads_of(package)?.into_iter().map(|(h, _)| h).collect();
        ensure_workspace_free(&heads, package, workspace)?;
        let Some(last) = steps.last() else {
            return Err(PorchError::internal("draft without any task step"));
        };
        let config = RevisionConfig {
            package: package.to_string(),
            workspace: workspace.to_string(),
            revision: String::new(),
            lifecycle: Lifecycle::Draft,
            tasks: steps.iter().filter_map(|s| s.task.clone()).collect(),
            upstream_lock: Self::upstream_lock_of(&last.resources),
            published_at: None,
        };
        self.write(&draft_tag(workspace), &config, &last.resources)?;
        tracing::info!(repo = %self.name, package, workspace, "created draft");
        self.get_revision(&PackageRevisionKey::new(&self.name, package, workspace, ""), token)
    }

    fn update_resources(&self, key: &PackageRevisionKey, step: TaskStep, token: &CancellationToken) -> Result<RevisionHead> {
        token.check("update resources")?;
        let (head, tagged) = self.find(key)?;
        ensure_draft(&head)?;
        let mut config = Self::config_of(&tagged, &head);
        config.tasks.extend(step.task);
        config.upstream_lock = Self::upstream_lock_of(&step.resources);
        self.write(&tagged.tag, &config, &step.resources)?;
        self.get_revision(key, token)
    }

    fn update_lifecycle(&self, key: &PackageRevisionKey, lifecycle: Lifecycle, token: &CancellationToken) -> Result<RevisionHead> {
        token.check("update lifecycle")?;
        let (head, tagged) = self.find(key)?;
        if head.lifecycle == lifecycle {
            return Ok(head);
        }
        let repository = self.image_repository(&key.package);
        let mut config = Self::config_of(&tagged, &head);
        let layer = tagged
            .manifest
            .layers
            .first()
            .cloned()
            .ok_or_else(|| PorchError::internal(format!("{} has no layer", tagged.tag)))?;
        match (head.lifecycle, lifecycle) {
            (Lifecycle::Draft, Lifecycle::Proposed) | (Lifecycle::Proposed, Lifecycle::Draft) => {
                config.lifecycle = lifecycle;
                self.write_config(&tagged.tag, &config, layer)?;
            }
            (Lifecycle::Draft | Lifecycle::Proposed, Lifecycle::Published) => {
                let heads = self.heads_of(&key.package)?;
                let revision = if head.key.revision.is_empty() {
                    next_revision(
                        heads
                            .iter()
                            .filter(|(h, _)| h.lifecycle.is_published())
                            .map(|(h, _)| h.key.revision.as_str()),
                    )
                } else {
                    head.key.revision.clone()
                };
                if heads.iter().any(|(_, t)| t.tag == revision) {
                    return Err(PorchError::TagExists {
                        tag: format!("{}:{revision}", self.image_repository(&key.package)),
                    });
                }
                config.lifecycle = Lifecycle::Published;
                config.revision = revision.clone();
                config.published_at = Some(Utc::now());
                self.write_config(&revision, &config, layer)?;
                self.registry
                    .delete_tag(&repository, &tagged.tag)
                    .map_err(|e| self.backend_error(&tagged.tag, e))?;
                tracing::info!(repo = %self.name, package = %key.package, revision, "published revision");
            }
            (Lifecycle::Published, Lifecycle::DeletionProposed) => {
                self.registry
                    .put_manifest(&repository, &deletion_tag(&tagged.tag), &tagged.manifest)
                    .map_err(|e| self.backend_error(&tagged.tag, e))?;
            }
            (Lifecycle::DeletionProposed, Lifecycle::Published) => {
                self.registry
                    .delete_tag(&repository, &deletion_tag(&tagged.tag))
                    .map_err(|e| self.backend_error(&tagged.tag, e))?;
            }
            (from, to) => {
                return Err(PorchError::LifecycleConflict {
                    name: head.object_name(),
                    message: format!("cannot move from {from} to {to}"),
                });
            }
        }
        self.get_revision(key, token)
    }

    fn delete_revision(&self, key: &PackageRevisionKey, token: &CancellationToken) -> Result<()> {
        token.check("delete revision")?;
        let (head, tagged) = self.find(key)?;
        let repository = self.image_repository(&key.package);
        match head.lifecycle {
            Lifecycle::Published => Err(PorchError::LifecycleConflict {
                name: head.object_name(),
                message: "published revisions must be proposed for deletion first".to_string(),
            }),
            Lifecycle::DeletionProposed => {
                self.registry
                    .delete_tag(&repository, &deletion_tag(&tagged.tag))
                    .map_err(|e| self.backend_error(&tagged.tag, e))?;
                self.registry
                    .delete_tag(&repository, &tagged.tag)
                    .map_err(|e| self.backend_error(&tagged.tag, e))
            }
            Lifecycle::Draft | Lifecycle::Proposed => self
                .registry
                .delete_tag(&repository, &tagged.tag)
                .map_err(|e| self.backend_error(&tagged.tag, e)),
        }
    }

    fn list_refs(&self, token: &CancellationToken) -> Result<Vec<String>> {
        let mut refs = Vec::new();
        for package in self.packages()? {
            token.check("list refs")?;
            let repository = self.image_repository(&package);
            refs.extend(
                self.registry
                    .list_tags(&repository)?
                    .into_iter()
                    .map(|tag| format!("{repository}:{tag}")),
            );
        }
        Ok(refs)
    }

    fn refresh(&self, token: &CancellationToken) -> Result<()> {
        token.check("refresh")?;
        self.packages().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::task::InitTask;

    fn repo() -> OciRepository {
        OciRepository::new("oci-repo", "registry.local/packages", Arc::new(MemoryRegistry::new()))
    }

    fn step(content: &str) -> TaskStep {
        TaskStep::new(
            Task::Init(InitTask::default()),
            [("Kptfile".to_string(), content.to_string())].into(),
        )
    }

    #[test]
    fn test_draft_to_published() {
        let repo = repo();
        let token = CancellationToken::none();
        let draft = repo.create_draft("web", "ws1", vec![step("kind: Kptfile\n")], &token).unwrap();
        assert_eq!(draft.lifecycle, Lifecycle::Draft);
        assert_eq!(repo.list_refs(&token).unwrap(), vec!["packages/web:drafts.ws1"]);

        repo.propose(&draft.key, &token).unwrap();
        let published = repo.approve(&draft.key, &token).unwrap();
        assert_eq!(published.key.revision, "v1");
        assert!(published.published_at.is_some());
        assert_eq!(repo.list_refs(&token).unwrap(), vec!["packages/web:v1"]);
        assert_eq!(
            repo.get_resources(&published.key, &token).unwrap().get("Kptfile").map(String::as_str),
            Some("kind: Kptfile\n")
        );
    }

    #[test]
    fn test_deletion_marker() {
        let repo = repo();
        let token = CancellationToken::none();
        let draft = repo.create_draft("web", "ws1", vec![step("a")], &token).unwrap();
        let published = repo.approve(&draft.key, &token).unwrap();
        assert!(repo.delete_revision(&published.key, &token).is_err());
        let marked = repo.propose_deletion(&published.key, &token).unwrap();
        assert_eq!(marked.lifecycle, Lifecycle::DeletionProposed);
        let restored = repo.update_lifecycle(&published.key, Lifecycle::Published, &token).unwrap();
        assert_eq!(restored.lifecycle, Lifecycle::Published);
        repo.propose_deletion(&published.key, &token).unwrap();
        repo.delete_revision(&published.key, &token).unwrap();
        assert!(repo.list_revisions(&RevisionFilter::default(), &token).unwrap().is_empty());
    }

    #[test]
    fn test_workspace_is_unique_per_package() {
        let repo = repo();
        let token = CancellationToken::none();
        let draft = repo.create_draft("web", "ws1", vec![step("a")], &token).unwrap();
        repo.approve(&draft.key, &token).unwrap();
        let err = repo.create_draft("web", "ws1", vec![step("b")], &token).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
        assert!(repo.create_draft("db", "ws1", vec![step("b")], &token).is_ok());
    }

    #[test]
    fn test_update_keeps_task_history() {
        let repo = repo();
        let token = CancellationToken::none();
        let draft = repo.create_draft("web", "ws1", vec![step("a")], &token).unwrap();
        let updated = repo
            .update_resources(&draft.key, TaskStep { task: None, resources: [("Kptfile".to_string(), "b".to_string())].into() }, &token)
            .unwrap();
        assert_eq!(updated.tasks.len(), 1);
        assert_ne!(updated.resource_version, draft.resource_version);
    }
}
