//! The aggregated package API
//!
//! [`Porch`] is the in-process API: repository registration, package
//! revision CRUD with optimistic concurrency on `resourceVersion`, the
//! approval subresource, resources, package listing and update discovery.
//! [`rest`] serves it over HTTP.

pub mod objects;
pub mod rest;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::cancel::CancellationToken;
use crate::discovery::{self, DownstreamUpdates, UpstreamUpdates};
use crate::engine::{Engine, NewRevision};
use crate::error::{ErrorKind, PorchError, Result};
use crate::metadata::MetadataStore;
use crate::model::lifecycle::TransitionStrategy;
use crate::model::{ObjectMeta, RevisionFilter, RevisionHead, packages_of};
use crate::repository::{self, Repository};

use objects::{
    ApprovalRequest, PackageObject, PackageRevision, PackageRevisionResources, RepositoryObject,
};

const REVISION_KIND: &str = "PackageRevision";

pub struct Porch {
    engine: Arc<Engine>,
    metadata: MetadataStore,
    registrations: DashMap<(String, String), RepositoryObject>,
    read_timeout: Duration,
}

impl Porch {
    pub fn new(engine: Arc<Engine>, metadata: MetadataStore, read_timeout: Duration) -> Self {
        Self {
            engine,
            metadata,
            registrations: DashMap::new(),
            read_timeout,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    // Repositories

    /// Register a repository and open its backend
    pub fn register_repository(&self, object: &RepositoryObject, token: &CancellationToken) -> Result<RepositoryObject> {
        let namespace = object.metadata.namespace.clone();
        let name = object.metadata.name.clone();
        if name.is_empty() || name.contains(['.', '/']) {
            return Err(PorchError::invalid_field(
                "Repository",
                &name,
                "metadata.name",
                "name must be non-empty and contain neither '.' nor '/'",
            ));
        }
        let key = (namespace.clone(), name.clone());
        if self.registrations.contains_key(&key) {
            return Err(PorchError::AlreadyExists {
                kind: "Repository".to_string(),
                name: format!("{namespace}/{name}"),
            });
        }
        let opened = repository::open(&namespace, &name, &object.spec, self.engine.context(), token)?;
        self.engine.repositories().insert(&namespace, opened);

        let mut registered = object.clone();
        registered.metadata.uid = uuid::Uuid::new_v4().to_string();
        registered.metadata.creation_timestamp = Some(chrono::Utc::now());
        registered.metadata.resource_version = "1".to_string();
        crate::model::meta::set_condition(
            &mut registered.status.conditions,
            crate::model::Condition::new("Ready", true, "Ready", ""),
        );
        self.registrations.insert(key, registered.clone());
        Ok(registered)
    }

    pub fn get_repository(&self, namespace: &str, name: &str) -> Result<RepositoryObject> {
        self.registrations
            .get(&(namespace.to_string(), name.to_string()))
            .map(|r| r.value().clone())
            .ok_or_else(|| PorchError::RepositoryNotFound {
                name: format!("{namespace}/{name}"),
            })
    }

    pub fn list_repositories(&self, namespace: &str) -> Vec<RepositoryObject> {
        let mut repos: Vec<RepositoryObject> = self
            .registrations
            .iter()
            .filter(|r| r.key().0 == namespace)
            .map(|r| r.value().clone())
            .collect();
        repos.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        repos
    }

    /// Unregister a repository; metadata records of its revisions go with it
    pub fn delete_repository(&self, namespace: &str, name: &str) -> Result<()> {
        if self
            .registrations
            .remove(&(namespace.to_string(), name.to_string()))
            .is_none()
        {
            return Err(PorchError::RepositoryNotFound {
                name: format!("{namespace}/{name}"),
            });
        }
        self.engine.repositories().remove(namespace, name);
        for record in self.metadata.list(namespace, name)? {
            self.metadata.delete(namespace, &record.name, true)?;
        }
        tracing::info!(namespace, repo = %name, "unregistered repository");
        Ok(())
    }

    // Package revisions

    /// Package revisions of a namespace, optionally of one repository
    pub fn list_package_revisions(
        &self,
        namespace: &str,
        repository: Option<&str>,
        token: &CancellationToken,
    ) -> Result<Vec<PackageRevision>> {
        let token = token.with_deadline(self.read_timeout);
        let mut items = Vec::new();
        for repo in self.repositories(namespace, repository) {
            let records: HashMap<String, ObjectMeta> = self
                .metadata
                .list(namespace, repo.name())?
                .into_iter()
                .map(|m| (m.name.clone(), m))
                .collect();
            let deployment = self.is_deployment(namespace, repo.name());
            for head in repo.list_revisions(&RevisionFilter::default(), &token)? {
                let meta = records
                    .get(&head.object_name())
                    .cloned()
                    .unwrap_or_else(|| ObjectMeta::named(namespace, head.object_name()));
                items.push(PackageRevision::from_head(&head, meta, deployment));
            }
        }
        items.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(items)
    }

    pub fn get_package_revision(&self, namespace: &str, name: &str, token: &CancellationToken) -> Result<PackageRevision> {
        let token = token.with_deadline(self.read_timeout);
        let (_, head) = self.engine.repositories().find_revision(namespace, name, &token)?;
        Ok(self.object_of(namespace, &head))
    }

    pub fn create_package_revision(&self, object: &PackageRevision, token: &CancellationToken) -> Result<PackageRevision> {
        let namespace = &object.metadata.namespace;
        let spec = &object.spec;
        let request = NewRevision {
            repository: spec.repository_name.clone(),
            package: spec.package_name.clone(),
            workspace: spec.workspace_name.clone(),
            revision: spec.revision.clone(),
            lifecycle: spec.lifecycle,
            tasks: spec.tasks.clone(),
        };
        let head = self.engine.create_package_revision(namespace, &request, token)?;
        let mut meta = object.metadata.clone();
        meta.name = head.object_name();
        let record = self.metadata.create(&meta, &head.key.repository)?;
        Ok(PackageRevision::from_head(
            &head,
            record,
            self.is_deployment(namespace, &head.key.repository),
        ))
    }

    /// Regular update: append one task, change lifecycle, replace metadata
    pub fn update_package_revision(&self, object: &PackageRevision, token: &CancellationToken) -> Result<PackageRevision> {
        let namespace = &object.metadata.namespace;
        let name = &object.metadata.name;
        let (_, mut head) = self.engine.repositories().find_revision(namespace, name, token)?;
        check_resource_version(name, &object.metadata.resource_version, &head.resource_version)?;
        check_immutable_fields(object, &head)?;

        let tasks = &object.spec.tasks;
        if *tasks != head.tasks {
            let appended = tasks.len() == head.tasks.len() + 1 && tasks[..head.tasks.len()] == head.tasks[..];
            let Some(task) = tasks.last().filter(|_| appended) else {
                return Err(PorchError::invalid_field(
                    REVISION_KIND,
                    name,
                    "spec.tasks",
                    "tasks are append-only and one task can be added per update",
                ));
            };
            head = self.engine.append_task(namespace, &head.key, task.clone(), token)?;
        }
        if object.spec.lifecycle != head.lifecycle {
            head = self
                .engine
                .update_lifecycle(namespace, &head.key, object.spec.lifecycle, TransitionStrategy::Update, token)?;
        }

        let record = self.save_metadata(object, &head)?;
        if record.deletion_timestamp.is_some() && record.finalizers.is_empty() {
            self.delete_package_revision(namespace, name, token)?;
        }
        Ok(PackageRevision::from_head(
            &head,
            record,
            self.is_deployment(namespace, &head.key.repository),
        ))
    }

    /// The approval subresource: lifecycle changes only
    pub fn update_approval(
        &self,
        namespace: &str,
        name: &str,
        request: &ApprovalRequest,
        token: &CancellationToken,
    ) -> Result<PackageRevision> {
        let (_, head) = self.engine.repositories().find_revision(namespace, name, token)?;
        check_resource_version(name, &request.metadata.resource_version, &head.resource_version)?;
        let head = self.engine.update_lifecycle(
            namespace,
            &head.key,
            request.spec.lifecycle,
            TransitionStrategy::Approval,
            token,
        )?;
        Ok(self.object_of(namespace, &head))
    }

    /// Delete a revision; with finalizers present it is only marked
    pub fn delete_package_revision(&self, namespace: &str, name: &str, token: &CancellationToken) -> Result<()> {
        let (_, head) = self.engine.repositories().find_revision(namespace, name, token)?;
        let has_finalizers = match self.metadata.get(namespace, name) {
            Ok(meta) => !meta.finalizers.is_empty(),
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(e),
        };
        if has_finalizers {
            self.metadata.delete(namespace, name, false)?;
            tracing::debug!(namespace, name, "deletion pending on finalizers");
            return Ok(());
        }
        self.engine.delete_package_revision(namespace, &head.key, token)?;
        self.metadata.delete(namespace, name, true)?;
        Ok(())
    }

    // Resources

    pub fn get_resources(&self, namespace: &str, name: &str, token: &CancellationToken) -> Result<PackageRevisionResources> {
        let token = token.with_deadline(self.read_timeout);
        let (repo, head) = self.engine.repositories().find_revision(namespace, name, &token)?;
        let resources = repo.get_resources(&head.key, &token)?;
        Ok(PackageRevisionResources::from_head(&head, namespace, resources))
    }

    pub fn update_resources(
        &self,
        object: &PackageRevisionResources,
        token: &CancellationToken,
    ) -> Result<PackageRevisionResources> {
        let namespace = &object.metadata.namespace;
        let name = &object.metadata.name;
        let (repo, head) = self.engine.repositories().find_revision(namespace, name, token)?;
        check_resource_version(name, &object.metadata.resource_version, &head.resource_version)?;
        let head = self
            .engine
            .update_package_resources(namespace, &head.key, &object.spec.resources, token)?;
        let resources = repo.get_resources(&head.key, token)?;
        Ok(PackageRevisionResources::from_head(&head, namespace, resources))
    }

    // Packages and discovery

    pub fn list_packages(&self, namespace: &str, token: &CancellationToken) -> Result<Vec<PackageObject>> {
        let heads = self.heads(namespace, &token.with_deadline(self.read_timeout))?;
        Ok(packages_of(&heads)
            .iter()
            .map(|p| PackageObject::from_package(namespace, p))
            .collect())
    }

    pub fn upstream_updates(&self, namespace: &str, token: &CancellationToken) -> Result<Vec<UpstreamUpdates>> {
        let heads = self.heads(namespace, token)?;
        discovery::upstream_updates(&heads, &self.engine.repositories().in_namespace(namespace), token)
    }

    pub fn downstream_updates(&self, namespace: &str, token: &CancellationToken) -> Result<Vec<DownstreamUpdates>> {
        Ok(discovery::downstream_updates(&self.upstream_updates(namespace, token)?))
    }

    fn heads(&self, namespace: &str, token: &CancellationToken) -> Result<Vec<RevisionHead>> {
        let mut heads = Vec::new();
        for repo in self.engine.repositories().in_namespace(namespace) {
            heads.extend(repo.list_revisions(&RevisionFilter::default(), token)?);
        }
        Ok(heads)
    }

    fn repositories(&self, namespace: &str, only: Option<&str>) -> Vec<Arc<dyn Repository>> {
        self.engine
            .repositories()
            .in_namespace(namespace)
            .into_iter()
            .filter(|r| only.is_none_or(|name| r.name() == name))
            .collect()
    }

    fn is_deployment(&self, namespace: &str, repository: &str) -> bool {
        self.registrations
            .get(&(namespace.to_string(), repository.to_string()))
            .is_some_and(|r| r.spec.deployment)
    }

    fn object_of(&self, namespace: &str, head: &RevisionHead) -> PackageRevision {
        let meta = self
            .metadata
            .get(namespace, &head.object_name())
            .unwrap_or_else(|_| ObjectMeta::named(namespace, head.object_name()));
        PackageRevision::from_head(head, meta, self.is_deployment(namespace, &head.key.repository))
    }

    fn save_metadata(&self, object: &PackageRevision, head: &RevisionHead) -> Result<ObjectMeta> {
        let mut meta = object.metadata.clone();
        meta.name = head.object_name();
        match self.metadata.update(&meta) {
            Err(e) if e.kind() == ErrorKind::NotFound => self.metadata.create(&meta, &head.key.repository),
            other => other,
        }
    }
}

fn check_resource_version(name: &str, expected: &str, actual: &str) -> Result<()> {
    if expected.is_empty() || expected == actual {
        Ok(())
    } else {
        Err(PorchError::ResourceVersionMismatch {
            name: name.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

fn check_immutable_fields(object: &PackageRevision, head: &RevisionHead) -> Result<()> {
    let mut errors = crate::error::FieldErrors::new();
    let spec = &object.spec;
    let fields = [
        ("spec.packageName", &spec.package_name, &head.key.package),
        ("spec.workspaceName", &spec.workspace_name, &head.key.workspace),
        ("spec.repositoryName", &spec.repository_name, &head.key.repository),
        ("spec.revision", &spec.revision, &head.key.revision),
    ];
    for (field, submitted, current) in fields {
        if !submitted.is_empty() && submitted != current {
            errors.push(field, format!("field is immutable (is '{current}')"));
        }
    }
    errors.into_result(REVISION_KIND, head.object_name())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::function::BuiltinRuntime;
    use crate::model::task::InitTask;
    use crate::model::{Lifecycle, Task};
    use crate::repository::{BackendContext, RepositorySet, RepositorySpec};
    use objects::ApprovalSpec;
    use tempfile::TempDir;

    const NS: &str = "default";

    fn porch(temp: &TempDir) -> Porch {
        let engine = Engine::new(
            Arc::new(RepositorySet::new()),
            BackendContext::new(temp.path().join("cache")),
            Arc::new(BuiltinRuntime::new()),
        );
        let porch = Porch::new(Arc::new(engine), MetadataStore::in_memory(), Duration::from_secs(10));
        let spec = RepositorySpec::dir(temp.path().join("r1"));
        porch
            .register_repository(&RepositoryObject::new(NS, "r1", spec), &CancellationToken::none())
            .unwrap();
        porch
    }

    fn init_draft(porch: &Porch) -> PackageRevision {
        let object = PackageRevision::draft(NS, "r1", "web", "ws1", vec![Task::Init(InitTask::default())]);
        porch.create_package_revision(&object, &CancellationToken::none()).unwrap()
    }

    #[test]
    fn test_create_get_list() {
        let temp = TempDir::new().unwrap();
        let porch = porch(&temp);
        let created = init_draft(&porch);
        assert_eq!(created.metadata.name, "r1.web.ws1");
        assert!(!created.metadata.uid.is_empty());

        let token = CancellationToken::none();
        let fetched = porch.get_package_revision(NS, "r1.web.ws1", &token).unwrap();
        assert_eq!(fetched.metadata.uid, created.metadata.uid);
        assert_eq!(porch.list_package_revisions(NS, None, &token).unwrap().len(), 1);
        assert!(porch.list_package_revisions(NS, Some("other"), &token).unwrap().is_empty());
    }

    #[test]
    fn test_stale_resource_version_conflicts() {
        let temp = TempDir::new().unwrap();
        let porch = porch(&temp);
        let mut object = init_draft(&porch);
        object.metadata.resource_version = "stale".to_string();
        object.spec.lifecycle = Lifecycle::Proposed;
        let err = porch
            .update_package_revision(&object, &CancellationToken::none())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_approval_flow() {
        let temp = TempDir::new().unwrap();
        let porch = porch(&temp);
        let token = CancellationToken::none();
        let mut object = init_draft(&porch);
        object.spec.lifecycle = Lifecycle::Proposed;
        let proposed = porch.update_package_revision(&object, &token).unwrap();
        assert_eq!(proposed.spec.lifecycle, Lifecycle::Proposed);

        let approve = ApprovalRequest {
            metadata: ObjectMeta::default(),
            spec: ApprovalSpec {
                lifecycle: Lifecycle::Published,
            },
        };
        let published = porch.update_approval(NS, "r1.web.ws1", &approve, &token).unwrap();
        assert_eq!(published.spec.revision, "v1");

        let reject = ApprovalRequest {
            metadata: ObjectMeta::default(),
            spec: ApprovalSpec {
                lifecycle: Lifecycle::Draft,
            },
        };
        let err = porch.update_approval(NS, "r1.web.ws1", &reject, &token).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
        assert!(err.to_string().contains("spec.lifecycle"));
    }

    #[test]
    fn test_tasks_are_append_only() {
        let temp = TempDir::new().unwrap();
        let porch = porch(&temp);
        let mut object = init_draft(&porch);
        object.spec.tasks.clear();
        let err = porch
            .update_package_revision(&object, &CancellationToken::none())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }

    #[test]
    fn test_finalizers_defer_delete() {
        let temp = TempDir::new().unwrap();
        let porch = porch(&temp);
        let token = CancellationToken::none();
        let mut object = init_draft(&porch);
        object.metadata.finalizers.push("example.com/hold".to_string());
        let mut object = porch.update_package_revision(&object, &token).unwrap();

        porch.delete_package_revision(NS, "r1.web.ws1", &token).unwrap();
        assert!(porch.get_package_revision(NS, "r1.web.ws1", &token).is_ok());

        object.metadata.finalizers.clear();
        porch.update_package_revision(&object, &token).unwrap();
        let err = porch.get_package_revision(NS, "r1.web.ws1", &token).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_resources_round_trip() {
        let temp = TempDir::new().unwrap();
        let porch = porch(&temp);
        let token = CancellationToken::none();
        init_draft(&porch);
        let mut resources = porch.get_resources(NS, "r1.web.ws1", &token).unwrap();
        resources
            .spec
            .resources
            .insert("cm.yaml".to_string(), "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n".to_string());
        let updated = porch.update_resources(&resources, &token).unwrap();
        assert!(updated.spec.resources.contains_key("cm.yaml"));
        let revision = porch.get_package_revision(NS, "r1.web.ws1", &token).unwrap();
        assert_eq!(revision.spec.tasks.len(), 2);
    }

    #[test]
    fn test_delete_repository_drops_metadata() {
        let temp = TempDir::new().unwrap();
        let porch = porch(&temp);
        init_draft(&porch);
        porch.delete_repository(NS, "r1").unwrap();
        assert!(porch.metadata.list(NS, "r1").unwrap().is_empty());
        assert!(porch.list_repositories(NS).is_empty());
    }
}
