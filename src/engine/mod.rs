//! Package engine
//!
//! The engine creates and mutates package revisions. A new revision's task
//! list is replayed in order, each task consuming the resources of the one
//! before it, and the per-step snapshots are handed to the repository.
//! Later mutations append a single task. Mutations of one package are
//! serialized through [`Leases`].

pub mod function;
pub mod init;
pub mod patch;
pub mod render;
mod tasks;

use std::sync::Arc;

use crate::cancel::CancellationToken;
use crate::error::{FieldErrors, PorchError, Result, ResultExt};
use crate::merge::{Merger, SchemaSet};
use crate::model::lifecycle::{TransitionStrategy, validate_transition};
use crate::model::task::validate_tasks;
use crate::model::{Lifecycle, PackageRevisionKey, Resources, RevisionHead, Task, revision_object_name};
use crate::repository::{BackendContext, Leases, RepositorySet, TaskStep};
use crate::resources::validate_path;

use function::FunctionRuntime;
use patch::compute_patch;

/// Request to create a package revision
#[derive(Debug, Clone, PartialEq)]
pub struct NewRevision {
    pub repository: String,
    pub package: String,
    pub workspace: String,
    /// Must be empty: revisions are assigned on approval
    pub revision: String,
    pub lifecycle: Lifecycle,
    pub tasks: Vec<Task>,
}

impl NewRevision {
    pub fn draft(repository: &str, package: &str, workspace: &str, tasks: Vec<Task>) -> Self {
        Self {
            repository: repository.to_string(),
            package: package.to_string(),
            workspace: workspace.to_string(),
            revision: String::new(),
            lifecycle: Lifecycle::Draft,
            tasks,
        }
    }

    fn object_name(&self) -> String {
        revision_object_name(&self.repository, &self.package, &self.workspace)
    }

    fn validate(&self) -> Result<()> {
        let mut errors = FieldErrors::new();
        if self.repository.trim().is_empty() {
            errors.push("spec.repositoryName", "repository is required");
        }
        if self.package.trim().is_empty() {
            errors.push("spec.packageName", "package name is required");
        } else if let Err(e) = validate_path(&self.package) {
            errors.push("spec.packageName", e.to_string());
        }
        if self.workspace.trim().is_empty() {
            errors.push("spec.workspaceName", "workspace name is required");
        } else if self.workspace.contains(['/', ' ', ':', '~', '^']) {
            errors.push("spec.workspaceName", "workspace name must be a single ref component");
        }
        if !self.revision.is_empty() {
            errors.push("spec.revision", "revision is assigned on approval and must be empty");
        }
        if !matches!(self.lifecycle, Lifecycle::Draft | Lifecycle::Proposed) {
            errors.push("spec.lifecycle", format!("new revisions cannot start as {}", self.lifecycle));
        }
        errors.extend(validate_tasks(&self.tasks));
        errors.into_result("PackageRevision", self.object_name())
    }
}

pub struct Engine {
    repos: Arc<RepositorySet>,
    ctx: BackendContext,
    leases: Leases,
    runtime: Arc<dyn FunctionRuntime>,
    merger: Merger,
}

impl Engine {
    pub fn new(repos: Arc<RepositorySet>, ctx: BackendContext, runtime: Arc<dyn FunctionRuntime>) -> Self {
        Self {
            repos,
            ctx,
            leases: Leases::new(),
            runtime,
            merger: Merger::new(SchemaSet::with_defaults()),
        }
    }

    pub fn repositories(&self) -> &Arc<RepositorySet> {
        &self.repos
    }

    pub fn context(&self) -> &BackendContext {
        &self.ctx
    }

    pub fn create_package_revision(
        &self,
        namespace: &str,
        request: &NewRevision,
        token: &CancellationToken,
    ) -> Result<RevisionHead> {
        request.validate()?;
        let repo = self.repos.get(namespace, &request.repository)?;
        self.leases.with_lease(&request.repository, &request.package, || {
            let steps = self.replay(namespace, &request.package, &request.tasks, token)?;
            token.check("create draft")?;
            let mut head = repo.create_draft(&request.package, &request.workspace, steps, token)?;
            if request.lifecycle == Lifecycle::Proposed {
                head = repo.propose(&head.key, token)?;
            }
            tracing::info!(
                repo = %request.repository,
                package = %request.package,
                workspace = %request.workspace,
                tasks = request.tasks.len(),
                "created package revision"
            );
            Ok(head)
        })
    }

    /// Replay `tasks` from nothing, keeping the resources after every step
    pub fn replay(
        &self,
        namespace: &str,
        package: &str,
        tasks: &[Task],
        token: &CancellationToken,
    ) -> Result<Vec<TaskStep>> {
        let mut steps: Vec<TaskStep> = Vec::with_capacity(tasks.len());
        let mut current = Resources::new();
        for (i, task) in tasks.iter().enumerate() {
            current = self
                .apply_task(namespace, package, task, current, token)
                .with_context(|| format!("task {i} ({}) of package {package}", task.task_type()))?;
            steps.push(TaskStep::new(task.clone(), current.clone()));
        }
        Ok(steps)
    }

    /// Replace the resources of a draft, recording the change as a patch
    ///
    /// Identical resources leave the revision untouched.
    pub fn update_package_resources(
        &self,
        namespace: &str,
        key: &PackageRevisionKey,
        resources: &Resources,
        token: &CancellationToken,
    ) -> Result<RevisionHead> {
        for path in resources.keys() {
            validate_path(path)?;
        }
        let repo = self.repos.get(namespace, &key.repository)?;
        self.leases.with_lease(&key.repository, &key.package, || {
            let head = repo.get_revision(key, token)?;
            ensure_mutable(&head)?;
            let old = repo.get_resources(key, token)?;
            let Some(patch) = compute_patch(&old, resources) else {
                tracing::debug!(revision = %key, "resources unchanged");
                return Ok(head);
            };
            tracing::debug!(revision = %key, files = patch.patches.len(), "patching resources");
            repo.update_resources(key, TaskStep::new(Task::Patch(patch), resources.clone()), token)
        })
    }

    /// Append one task to an existing draft
    pub fn append_task(
        &self,
        namespace: &str,
        key: &PackageRevisionKey,
        task: Task,
        token: &CancellationToken,
    ) -> Result<RevisionHead> {
        if task.is_initial() {
            return Err(PorchError::invalid_field(
                "PackageRevision",
                key.object_name(),
                "spec.tasks",
                format!("{} is only allowed as the first task", task.task_type()),
            ));
        }
        let mut errors = FieldErrors::new();
        crate::model::task::validate_task(&task, "spec.tasks", &mut errors);
        errors.into_result("PackageRevision", key.object_name())?;

        let repo = self.repos.get(namespace, &key.repository)?;
        self.leases.with_lease(&key.repository, &key.package, || {
            let head = repo.get_revision(key, token)?;
            ensure_mutable(&head)?;
            let current = repo.get_resources(key, token)?;
            let resources = self
                .apply_task(namespace, &key.package, &task, current, token)
                .with_context(|| format!("{} task on {key}", task.task_type()))?;
            repo.update_resources(key, TaskStep::new(task, resources), token)
        })
    }

    /// Move a revision to `lifecycle` if `strategy` allows it
    pub fn update_lifecycle(
        &self,
        namespace: &str,
        key: &PackageRevisionKey,
        lifecycle: Lifecycle,
        strategy: TransitionStrategy,
        token: &CancellationToken,
    ) -> Result<RevisionHead> {
        let repo = self.repos.get(namespace, &key.repository)?;
        self.leases.with_lease(&key.repository, &key.package, || {
            let head = repo.get_revision(key, token)?;
            validate_transition(strategy, head.lifecycle, lifecycle).into_result("PackageRevision", head.object_name())?;
            if head.lifecycle == lifecycle {
                return Ok(head);
            }
            let updated = repo.update_lifecycle(&head.key, lifecycle, token)?;
            tracing::info!(
                revision = %updated.key,
                from = %head.lifecycle,
                to = %updated.lifecycle,
                "lifecycle changed"
            );
            Ok(updated)
        })
    }

    pub fn delete_package_revision(
        &self,
        namespace: &str,
        key: &PackageRevisionKey,
        token: &CancellationToken,
    ) -> Result<()> {
        let repo = self.repos.get(namespace, &key.repository)?;
        self.leases.with_lease(&key.repository, &key.package, || {
            let head = repo.get_revision(key, token)?;
            if head.lifecycle == Lifecycle::Published {
                return Err(PorchError::LifecycleConflict {
                    name: head.object_name(),
                    message: "published revisions must be proposed for deletion first".to_string(),
                });
            }
            repo.delete_revision(&head.key, token)?;
            tracing::info!(revision = %head.key, "deleted package revision");
            Ok(())
        })
    }

    /// Render the Kptfile pipelines of `resources`
    pub fn render(&self, resources: &Resources, token: &CancellationToken) -> Result<Resources> {
        render::render(resources, self.runtime.as_ref(), token)
    }
}

fn ensure_mutable(head: &RevisionHead) -> Result<()> {
    if head.lifecycle.is_mutable() {
        Ok(())
    } else {
        Err(PorchError::LifecycleConflict {
            name: head.object_name(),
            message: format!("only Draft revisions can change, revision is {}", head.lifecycle),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::model::task::{CloneTask, EvalTask, InitTask, PackageRevisionRef, UpdateTask};
    use crate::model::{Kptfile, UpdateStrategy};
    use crate::repository::dir::DirRepository;
    use function::BuiltinRuntime;
    use pretty_assertions::assert_eq;
    use serde_yaml::Value;
    use tempfile::TempDir;

    const NS: &str = "default";
    const DEPLOYMENT: &str = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\nspec:\n  replicas: 1\n";

    fn runtime() -> BuiltinRuntime {
        let mut runtime = BuiltinRuntime::new();
        runtime.register("set-namespace", |list| {
            let namespace = list["functionConfig"]["data"]["namespace"].clone();
            let mut out = list.clone();
            if let Some(items) = out.get_mut("items").and_then(Value::as_sequence_mut) {
                for item in items.iter_mut().filter(|i| i["kind"] != "Kptfile") {
                    item["metadata"]["namespace"] = namespace.clone();
                }
            }
            Ok(out)
        });
        runtime
    }

    fn engine(temp: &TempDir) -> Engine {
        let repos = Arc::new(RepositorySet::new());
        for name in ["up", "down"] {
            let repo = DirRepository::open(name, &temp.path().join(name)).unwrap();
            repos.insert(NS, Arc::new(repo));
        }
        Engine::new(repos, BackendContext::new(temp.path().join("cache")), Arc::new(runtime()))
    }

    fn init() -> Task {
        Task::Init(InitTask {
            description: "web app".to_string(),
            ..InitTask::default()
        })
    }

    fn clone_of(name: &str) -> Task {
        Task::Clone(CloneTask {
            upstream_ref: Some(PackageRevisionRef::new(name)),
            ..CloneTask::default()
        })
    }

    /// Publish `files` as the next revision of `up/web` and return its object name
    fn publish_upstream(engine: &Engine, workspace: &str, files: &[(&str, &str)]) -> String {
        let token = CancellationToken::none();
        let head = engine
            .create_package_revision(NS, &NewRevision::draft("up", "web", workspace, vec![init()]), &token)
            .unwrap();
        let mut resources = engine
            .repositories()
            .get(NS, "up")
            .unwrap()
            .get_resources(&head.key, &token)
            .unwrap();
        for (path, content) in files {
            resources.insert(path.to_string(), content.to_string());
        }
        engine.update_package_resources(NS, &head.key, &resources, &token).unwrap();
        engine
            .update_lifecycle(NS, &head.key, Lifecycle::Proposed, TransitionStrategy::Update, &token)
            .unwrap();
        let published = engine
            .update_lifecycle(NS, &head.key, Lifecycle::Published, TransitionStrategy::Approval, &token)
            .unwrap();
        published.object_name()
    }

    fn resources_of(engine: &Engine, key: &PackageRevisionKey) -> Resources {
        engine
            .repositories()
            .get(NS, &key.repository)
            .unwrap()
            .get_resources(key, &CancellationToken::none())
            .unwrap()
    }

    #[test]
    fn test_create_with_init() {
        let temp = TempDir::new().unwrap();
        let engine = engine(&temp);
        let head = engine
            .create_package_revision(NS, &NewRevision::draft("up", "web", "ws1", vec![init()]), &CancellationToken::none())
            .unwrap();
        assert_eq!(head.lifecycle, Lifecycle::Draft);
        assert_eq!(head.key.revision, "");
        assert_eq!(head.tasks.len(), 1);
        let kptfile = Kptfile::from_resources(&resources_of(&engine, &head.key), "").unwrap().unwrap();
        assert_eq!(kptfile.metadata.name, "web");
    }

    #[test]
    fn test_create_rejects_bad_requests() {
        let temp = TempDir::new().unwrap();
        let engine = engine(&temp);
        let token = CancellationToken::none();

        let empty = NewRevision::draft("up", "web", "ws1", Vec::new());
        let err = engine.create_package_revision(NS, &empty, &token).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);

        let mut with_revision = NewRevision::draft("up", "web", "ws1", vec![init()]);
        with_revision.revision = "v1".to_string();
        let err = engine.create_package_revision(NS, &with_revision, &token).unwrap_err();
        assert!(err.to_string().contains("spec.revision"));

        let unknown = NewRevision::draft("missing", "web", "ws1", vec![init()]);
        let err = engine.create_package_revision(NS, &unknown, &token).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_duplicate_workspace_conflicts() {
        let temp = TempDir::new().unwrap();
        let engine = engine(&temp);
        let token = CancellationToken::none();
        let request = NewRevision::draft("up", "web", "ws1", vec![init()]);
        engine.create_package_revision(NS, &request, &token).unwrap();
        let err = engine.create_package_revision(NS, &request, &token).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_resource_update_appends_patch() {
        let temp = TempDir::new().unwrap();
        let engine = engine(&temp);
        let token = CancellationToken::none();
        let head = engine
            .create_package_revision(NS, &NewRevision::draft("up", "web", "ws1", vec![init()]), &token)
            .unwrap();
        let mut resources = resources_of(&engine, &head.key);

        let unchanged = engine.update_package_resources(NS, &head.key, &resources, &token).unwrap();
        assert_eq!(unchanged.tasks.len(), 1);

        resources.insert("deployment.yaml".to_string(), DEPLOYMENT.to_string());
        let updated = engine.update_package_resources(NS, &head.key, &resources, &token).unwrap();
        assert_eq!(updated.tasks.len(), 2);
        assert!(matches!(updated.tasks[1], Task::Patch(_)));
        assert_eq!(resources_of(&engine, &head.key), resources);
    }

    #[test]
    fn test_clone_records_upstream_lock() {
        let temp = TempDir::new().unwrap();
        let engine = engine(&temp);
        let token = CancellationToken::none();
        let upstream = publish_upstream(&engine, "v1", &[("deployment.yaml", DEPLOYMENT)]);

        let head = engine
            .create_package_revision(NS, &NewRevision::draft("down", "web-dev", "ws1", vec![clone_of(&upstream)]), &token)
            .unwrap();
        let resources = resources_of(&engine, &head.key);
        let kptfile = Kptfile::from_resources(&resources, "").unwrap().unwrap();
        assert_eq!(kptfile.metadata.name, "web-dev");
        let lock = kptfile.upstream_lock.unwrap();
        assert_eq!(lock.git_ref(), Some("web/v1"));
        assert!(resources["deployment.yaml"].contains("kpt-merge: /web"));
        assert_eq!(head.upstream_lock.as_ref().and_then(|l| l.git_ref()), Some("web/v1"));
    }

    #[test]
    fn test_update_merges_upstream_changes() {
        let temp = TempDir::new().unwrap();
        let engine = engine(&temp);
        let token = CancellationToken::none();
        let v1 = publish_upstream(&engine, "v1", &[("deployment.yaml", DEPLOYMENT)]);
        let v2_deployment = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\nspec:\n  replicas: 3\n  image: x\n";
        let v2 = publish_upstream(&engine, "v2", &[("deployment.yaml", v2_deployment)]);

        let head = engine
            .create_package_revision(NS, &NewRevision::draft("down", "web", "ws1", vec![clone_of(&v1)]), &token)
            .unwrap();
        let mut resources = resources_of(&engine, &head.key);
        let local = resources["deployment.yaml"].replace("replicas: 1", "replicas: 5");
        resources.insert("deployment.yaml".to_string(), local);
        engine.update_package_resources(NS, &head.key, &resources, &token).unwrap();

        let update = Task::Update(UpdateTask {
            upstream_ref: Some(PackageRevisionRef::new(&v2)),
            ..UpdateTask::default()
        });
        let updated = engine.append_task(NS, &head.key, update, &token).unwrap();
        assert_eq!(updated.tasks.len(), 3);
        let merged = resources_of(&engine, &head.key);
        let deployment: Value = serde_yaml::from_str(&merged["deployment.yaml"]).unwrap();
        assert_eq!(deployment["spec"]["replicas"], Value::from(5));
        assert_eq!(deployment["spec"]["image"], Value::from("x"));
        let kptfile = Kptfile::from_resources(&merged, "").unwrap().unwrap();
        assert_eq!(kptfile.upstream_lock.unwrap().git_ref(), Some("web/v2"));
    }

    #[test]
    fn test_update_to_same_lock_is_noop() {
        let temp = TempDir::new().unwrap();
        let engine = engine(&temp);
        let token = CancellationToken::none();
        let v1 = publish_upstream(&engine, "v1", &[("deployment.yaml", DEPLOYMENT)]);
        let head = engine
            .create_package_revision(NS, &NewRevision::draft("down", "web", "ws1", vec![clone_of(&v1)]), &token)
            .unwrap();
        let before = resources_of(&engine, &head.key);
        let update = Task::Update(UpdateTask {
            upstream_ref: Some(PackageRevisionRef::new(&v1)),
            ..UpdateTask::default()
        });
        engine.append_task(NS, &head.key, update, &token).unwrap();
        assert_eq!(resources_of(&engine, &head.key), before);
    }

    #[test]
    fn test_fast_forward_rejects_local_changes() {
        let temp = TempDir::new().unwrap();
        let engine = engine(&temp);
        let token = CancellationToken::none();
        let v1 = publish_upstream(&engine, "v1", &[("deployment.yaml", DEPLOYMENT)]);
        let v2 = publish_upstream(&engine, "v2", &[("deployment.yaml", &DEPLOYMENT.replace("replicas: 1", "replicas: 2"))]);
        let head = engine
            .create_package_revision(NS, &NewRevision::draft("down", "web", "ws1", vec![clone_of(&v1)]), &token)
            .unwrap();
        let mut resources = resources_of(&engine, &head.key);
        resources.insert("local.yaml".to_string(), "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: local\n".to_string());
        engine.update_package_resources(NS, &head.key, &resources, &token).unwrap();

        let update = Task::Update(UpdateTask {
            upstream_ref: Some(PackageRevisionRef::new(&v2)),
            strategy: Some(UpdateStrategy::FastForward),
            ..UpdateTask::default()
        });
        let err = engine.append_task(NS, &head.key, update, &token).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }

    #[test]
    fn test_eval_runs_function() {
        let temp = TempDir::new().unwrap();
        let engine = engine(&temp);
        let token = CancellationToken::none();
        let v1 = publish_upstream(&engine, "v1", &[("deployment.yaml", DEPLOYMENT), ("README.md", "# web\n")]);
        let head = engine
            .create_package_revision(NS, &NewRevision::draft("down", "web", "ws1", vec![clone_of(&v1)]), &token)
            .unwrap();
        let eval = Task::Eval(EvalTask {
            image: "set-namespace".to_string(),
            config_map: [("namespace".to_string(), "prod".to_string())].into(),
            config: None,
        });
        engine.append_task(NS, &head.key, eval, &token).unwrap();
        let resources = resources_of(&engine, &head.key);
        assert!(resources["deployment.yaml"].contains("namespace: prod"));
        assert_eq!(resources["README.md"], "# web\n");
        assert!(resources["deployment.yaml"].contains("metadata: # kpt-merge: /web"));
    }

    #[test]
    fn test_update_after_eval_keeps_merge_identity() {
        let temp = TempDir::new().unwrap();
        let engine = engine(&temp);
        let token = CancellationToken::none();
        let v1 = publish_upstream(&engine, "v1", &[("deployment.yaml", DEPLOYMENT)]);
        let v2 = publish_upstream(&engine, "v2", &[("deployment.yaml", &format!("{DEPLOYMENT}  image: x\n"))]);
        let head = engine
            .create_package_revision(NS, &NewRevision::draft("down", "web", "ws1", vec![clone_of(&v1)]), &token)
            .unwrap();
        let eval = Task::Eval(EvalTask {
            image: "set-namespace".to_string(),
            config_map: [("namespace".to_string(), "prod".to_string())].into(),
            config: None,
        });
        engine.append_task(NS, &head.key, eval, &token).unwrap();

        let update = Task::Update(UpdateTask {
            upstream_ref: Some(PackageRevisionRef::new(&v2)),
            ..UpdateTask::default()
        });
        engine.append_task(NS, &head.key, update, &token).unwrap();
        let merged = resources_of(&engine, &head.key);
        let deployment: Value = serde_yaml::from_str(&merged["deployment.yaml"]).unwrap();
        assert_eq!(deployment["metadata"]["namespace"], Value::from("prod"));
        assert_eq!(deployment["spec"]["image"], Value::from("x"));
        assert!(!merged.keys().any(|k| k.starts_with("resource-")));
    }

    #[test]
    fn test_eval_keeps_patch_files_in_place() {
        let temp = TempDir::new().unwrap();
        let engine = engine(&temp);
        let token = CancellationToken::none();
        let patch = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n  annotations:\n    config.kubernetes.io/path: base/cm.yaml\n";
        let v1 = publish_upstream(&engine, "v1", &[("patch.yaml", patch)]);
        let head = engine
            .create_package_revision(NS, &NewRevision::draft("down", "web", "ws1", vec![clone_of(&v1)]), &token)
            .unwrap();
        let eval = Task::Eval(EvalTask {
            image: "set-namespace".to_string(),
            config_map: [("namespace".to_string(), "prod".to_string())].into(),
            config: None,
        });
        engine.append_task(NS, &head.key, eval, &token).unwrap();
        let resources = resources_of(&engine, &head.key);
        assert!(!resources.contains_key("base/cm.yaml"));
        assert!(resources["patch.yaml"].contains("config.kubernetes.io/path: base/cm.yaml"));
        assert!(resources["patch.yaml"].contains("namespace: prod"));
    }

    #[test]
    fn test_lifecycle_rules() {
        let temp = TempDir::new().unwrap();
        let engine = engine(&temp);
        let token = CancellationToken::none();
        let head = engine
            .create_package_revision(NS, &NewRevision::draft("up", "web", "ws1", vec![init()]), &token)
            .unwrap();
        let err = engine
            .update_lifecycle(NS, &head.key, Lifecycle::Published, TransitionStrategy::Update, &token)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
        assert!(err.to_string().contains("spec.lifecycle"));

        engine
            .update_lifecycle(NS, &head.key, Lifecycle::Proposed, TransitionStrategy::Update, &token)
            .unwrap();
        let published = engine
            .update_lifecycle(NS, &head.key, Lifecycle::Published, TransitionStrategy::Approval, &token)
            .unwrap();
        assert_eq!(published.key.revision, "v1");

        let err = engine.delete_package_revision(NS, &published.key, &token).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        let err = engine
            .update_package_resources(NS, &published.key, &Resources::new(), &token)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }
}
