//! Local directory backend
//!
//! Layout under the repository root:
//!
//! ```text
//! <root>/<package>/<revision>/            published revisions
//! <root>/<package>/.drafts/<workspace>/   drafts and proposed revisions
//! ```
//!
//! Every revision directory holds a `.porch-revision.yaml` sidecar with the
//! lifecycle, workspace, revision, task list and a generation counter that
//! serves as the resource version.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use super::{Repository, RepositoryType, TaskStep, ensure_draft, ensure_workspace_free};
use crate::cancel::CancellationToken;
use crate::error::{PorchError, Result};
use crate::git::refs::{lock_ref_for_draft, lock_ref_for_published};
use crate::hash::{hash_resources, read_tree, write_tree};
use crate::model::{
    Kptfile, Lifecycle, PackageRevisionKey, Resources, RevisionFilter, RevisionHead, Task, UpstreamLock,
    next_revision,
};

const SIDECAR: &str = ".porch-revision.yaml";
const DRAFTS_DIR: &str = ".drafts";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Sidecar {
    lifecycle: Lifecycle,
    workspace: String,
    #[serde(default)]
    revision: String,
    #[serde(default)]
    tasks: Vec<Task>,
    #[serde(default)]
    generation: u64,
}

pub struct DirRepository {
    name: String,
    root: PathBuf,
    lock: Mutex<()>,
}

impl DirRepository {
    pub fn open(name: &str, root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)
            .map_err(|e| crate::file_error_context!("Failed to create repository directory", root.display(), e))?;
        Ok(Self {
            name: name.to_string(),
            root: root.to_path_buf(),
            lock: Mutex::new(()),
        })
    }

    fn draft_dir(&self, package: &str, workspace: &str) -> PathBuf {
        self.root.join(package).join(DRAFTS_DIR).join(workspace)
    }

    fn published_dir(&self, package: &str, revision: &str) -> PathBuf {
        self.root.join(package).join(revision)
    }

    fn load(&self) -> Result<Vec<(RevisionHead, PathBuf)>> {
        let mut heads = Vec::new();
        for entry in WalkDir::new(&self.root).into_iter().filter_map(std::result::Result::ok) {
            if entry.file_name() != SIDECAR {
                continue;
            }
            let Some(dir) = entry.path().parent() else {
                continue;
            };
            let content = std::fs::read_to_string(entry.path())?;
            let sidecar: Sidecar = serde_yaml::from_str(&content).map_err(|e| PorchError::ParseFailed {
                path: entry.path().display().to_string(),
                reason: e.to_string(),
            })?;
            let Some(package) = self.package_of(dir) else {
                continue;
            };
            heads.push((self.head_of(&package, dir, sidecar)?, dir.to_path_buf()));
        }
        heads.sort_by(|(a, _), (b, _)| a.key.cmp(&b.key));
        Ok(heads)
    }

    /// Package path of a revision directory
    fn package_of(&self, dir: &Path) -> Option<String> {
        let relative = dir.strip_prefix(&self.root).ok()?;
        let components: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        let package_end = match components.iter().rposition(|c| c == DRAFTS_DIR) {
            Some(i) => i,
            None => components.len().checked_sub(1)?,
        };
        (package_end > 0).then(|| components[..package_end].join("/"))
    }

    fn head_of(&self, package: &str, dir: &Path, sidecar: Sidecar) -> Result<RevisionHead> {
        let resources = read_tree(dir, &[DRAFTS_DIR])?;
        let git_ref = if sidecar.lifecycle.is_published() {
            lock_ref_for_published(package, &sidecar.revision)
        } else {
            lock_ref_for_draft(package, &sidecar.workspace)
        };
        let upstream_lock = Kptfile::from_resources(&resources, "")
            .ok()
            .flatten()
            .and_then(|k| k.upstream_lock);
        Ok(RevisionHead {
            key: PackageRevisionKey::new(&self.name, package, &sidecar.workspace, &sidecar.revision),
            lifecycle: sidecar.lifecycle,
            tasks: sidecar.tasks,
            upstream_lock,
            self_lock: Some(UpstreamLock::dir(
                &dir.display().to_string(),
                &git_ref,
                &hash_resources(&resources),
            )),
            resource_version: sidecar.generation.to_string(),
            published_by: None,
            published_at: None,
        })
    }

    fn find(&self, key: &PackageRevisionKey) -> Result<(RevisionHead, PathBuf)> {
        self.load()?
            .into_iter()
            .find(|(h, _)| h.key.package == key.package && h.key.workspace == key.workspace)
            .ok_or_else(|| PorchError::PackageRevisionNotFound { name: key.object_name() })
    }

    fn read_sidecar(dir: &Path) -> Result<Sidecar> {
        let content = std::fs::read_to_string(dir.join(SIDECAR))?;
        Ok(serde_yaml::from_str(&content)?)
    }

    fn write_sidecar(dir: &Path, sidecar: &Sidecar) -> Result<()> {
        std::fs::write(dir.join(SIDECAR), serde_yaml::to_string(sidecar)?)?;
        Ok(())
    }

    fn reload(&self, key: &PackageRevisionKey) -> Result<RevisionHead> {
        self.find(key).map(|(head, _)| head)
    }
}

impl Repository for DirRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn repo_type(&self) -> RepositoryType {
        RepositoryType::Dir
    }

    fn location(&self) -> String {
        self.root.display().to_string()
    }

    fn list_revisions(&self, filter: &RevisionFilter, token: &CancellationToken) -> Result<Vec<RevisionHead>> {
        token.check("list revisions")?;
        let _guard = self.lock.lock();
        Ok(self
            .load()?
            .into_iter()
            .map(|(head, _)| head)
            .filter(|h| filter.matches(h))
            .collect())
    }

    fn get_resources(&self, key: &PackageRevisionKey, token: &CancellationToken) -> Result<Resources> {
        token.check("read resources")?;
        let _guard = self.lock.lock();
        let (_, dir) = self.find(key)?;
        read_tree(&dir, &[DRAFTS_DIR])
    }

    fn create_draft(&self, package: &str, workspace: &str, steps: Vec<TaskStep>, token: &CancellationToken) -> Result<RevisionHead> {
        token.check("create draft")?;
        let _guard = self.lock.lock();
        let heads: Vec<RevisionHead> = self.load()?.into_iter().map(|(h, _)| h).collect();
        ensure_workspace_free(&heads, package, workspace)?;
        let Some(last) = steps.last() else {
            return Err(PorchError::internal("draft without any task step"));
        };
        let dir = self.draft_dir(package, workspace);
        write_tree(&dir, &last.resources)?;
        let sidecar = Sidecar {
            lifecycle: Lifecycle::Draft,
            workspace: workspace.to_string(),
            revision: String::new(),
            tasks: steps.iter().filter_map(|s| s.task.clone()).collect(),
            generation: 1,
        };
        Self::write_sidecar(&dir, &sidecar)?;
        tracing::info!(repo = %self.name, package, workspace, "created draft");
        self.reload(&PackageRevisionKey::new(&self.name, package, workspace, ""))
    }

    fn update_resources(&self, key: &PackageRevisionKey, step: TaskStep, token: &CancellationToken) -> Result<RevisionHead> {
        token.check("update resources")?;
        let _guard = self.lock.lock();
        let (head, dir) = self.find(key)?;
        ensure_draft(&head)?;
        let mut sidecar = Self::read_sidecar(&dir)?;
        write_tree(&dir, &step.resources)?;
        sidecar.tasks.extend(step.task);
        sidecar.generation += 1;
        Self::write_sidecar(&dir, &sidecar)?;
        self.reload(key)
    }

    fn update_lifecycle(&self, key: &PackageRevisionKey, lifecycle: Lifecycle, token: &CancellationToken) -> Result<RevisionHead> {
        token.check("update lifecycle")?;
        let _guard = self.lock.lock();
        let (head, dir) = self.find(key)?;
        if head.lifecycle == lifecycle {
            return Ok(head);
        }
        let mut sidecar = Self::read_sidecar(&dir)?;
        match (head.lifecycle, lifecycle) {
            (Lifecycle::Draft, Lifecycle::Proposed)
            | (Lifecycle::Proposed, Lifecycle::Draft)
            | (Lifecycle::Published, Lifecycle::DeletionProposed)
            | (Lifecycle::DeletionProposed, Lifecycle::Published) => {
                sidecar.lifecycle = lifecycle;
                sidecar.generation += 1;
                Self::write_sidecar(&dir, &sidecar)?;
            }
            (Lifecycle::Draft | Lifecycle::Proposed, Lifecycle::Published) => {
                let revision = if head.key.revision.is_empty() {
                    let heads = self.load()?;
                    next_revision(
                        heads
                            .iter()
                            .filter(|(h, _)| h.key.package == key.package && h.lifecycle.is_published())
                            .map(|(h, _)| h.key.revision.as_str()),
                    )
                } else {
                    head.key.revision.clone()
                };
                let target = self.published_dir(&key.package, &revision);
                if target.exists() {
                    return Err(PorchError::TagExists {
                        tag: format!("{}/{revision}", key.package),
                    });
                }
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::rename(&dir, &target)?;
                sidecar.lifecycle = Lifecycle::Published;
                sidecar.revision = revision;
                sidecar.generation += 1;
                Self::write_sidecar(&target, &sidecar)?;
            }
            (from, to) => {
                return Err(PorchError::LifecycleConflict {
                    name: head.object_name(),
                    message: format!("cannot move from {from} to {to}"),
                });
            }
        }
        self.reload(key)
    }

    fn delete_revision(&self, key: &PackageRevisionKey, token: &CancellationToken) -> Result<()> {
        token.check("delete revision")?;
        let _guard = self.lock.lock();
        let (head, dir) = self.find(key)?;
        if head.lifecycle == Lifecycle::Published {
            return Err(PorchError::LifecycleConflict {
                name: head.object_name(),
                message: "published revisions must be proposed for deletion first".to_string(),
            });
        }
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    fn list_refs(&self, token: &CancellationToken) -> Result<Vec<String>> {
        token.check("list refs")?;
        let _guard = self.lock.lock();
        Ok(self
            .load()?
            .into_iter()
            .filter_map(|(h, _)| h.self_lock.and_then(|l| l.git_ref().map(ToString::to_string)))
            .collect())
    }

    fn refresh(&self, token: &CancellationToken) -> Result<()> {
        token.check("refresh")
    }
}
