//! Tasks: the steps that assemble a package revision
//!
//! On the wire a task is `{type: <kind>, <kind>: {...}}`; in memory it is the
//! [`Task`] sum type.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::kptfile::{Upstream, UpdateStrategy};
use crate::error::FieldErrors;

/// Reference to another package revision by object name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageRevisionRef {
    pub name: String,
}

impl PackageRevisionRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryInit {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitTask {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub site: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory: Option<InventoryInit>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneTask {
    /// Registered package revision to clone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_ref: Option<PackageRevisionRef>,
    /// Direct git or OCI upstream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<Upstream>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<UpdateStrategy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchType {
    CreateFile,
    DeleteFile,
    PatchFile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePatch {
    pub file: String,
    #[serde(default)]
    pub contents: String,
    pub patch_type: PatchType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchTask {
    #[serde(default)]
    pub patches: Vec<FilePatch>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditTask {
    pub source_ref: PackageRevisionRef,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalTask {
    pub image: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config_map: BTreeMap<String, String>,
    /// Inline function config object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTask {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_ref: Option<PackageRevisionRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<Upstream>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<UpdateStrategy>,
}

/// Discriminant of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Init,
    Clone,
    Patch,
    Edit,
    Eval,
    Update,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskType::Init => "init",
            TaskType::Clone => "clone",
            TaskType::Patch => "patch",
            TaskType::Edit => "edit",
            TaskType::Eval => "eval",
            TaskType::Update => "update",
        };
        f.write_str(name)
    }
}

/// One step in the construction of a package revision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TaskWire", into = "TaskWire")]
pub enum Task {
    Init(InitTask),
    Clone(CloneTask),
    Patch(PatchTask),
    Edit(EditTask),
    Eval(EvalTask),
    Update(UpdateTask),
}

impl Task {
    pub fn task_type(&self) -> TaskType {
        match self {
            Task::Init(_) => TaskType::Init,
            Task::Clone(_) => TaskType::Clone,
            Task::Patch(_) => TaskType::Patch,
            Task::Edit(_) => TaskType::Edit,
            Task::Eval(_) => TaskType::Eval,
            Task::Update(_) => TaskType::Update,
        }
    }

    /// Tasks that create a package from nothing and must come first
    pub fn is_initial(&self) -> bool {
        matches!(self, Task::Init(_) | Task::Clone(_) | Task::Edit(_))
    }
}

#[derive(Serialize, Deserialize)]
struct TaskWire {
    #[serde(rename = "type")]
    task_type: TaskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    init: Option<InitTask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    clone: Option<CloneTask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    patch: Option<PatchTask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    edit: Option<EditTask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    eval: Option<EvalTask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    update: Option<UpdateTask>,
}

impl TaskWire {
    fn of(task_type: TaskType) -> Self {
        Self {
            task_type,
            init: None,
            clone: None,
            patch: None,
            edit: None,
            eval: None,
            update: None,
        }
    }
}

impl TryFrom<TaskWire> for Task {
    type Error = String;

    fn try_from(wire: TaskWire) -> Result<Self, Self::Error> {
        let missing = |t: TaskType| format!("task of type {t} is missing its '{t}' section");
        match wire.task_type {
            TaskType::Init => Ok(Task::Init(wire.init.unwrap_or_default())),
            TaskType::Clone => wire.clone.map(Task::Clone).ok_or_else(|| missing(TaskType::Clone)),
            TaskType::Patch => Ok(Task::Patch(wire.patch.unwrap_or_default())),
            TaskType::Edit => wire.edit.map(Task::Edit).ok_or_else(|| missing(TaskType::Edit)),
            TaskType::Eval => wire.eval.map(Task::Eval).ok_or_else(|| missing(TaskType::Eval)),
            TaskType::Update => wire.update.map(Task::Update).ok_or_else(|| missing(TaskType::Update)),
        }
    }
}

impl From<Task> for TaskWire {
    fn from(task: Task) -> Self {
        let mut wire = TaskWire::of(task.task_type());
        match task {
            Task::Init(t) => wire.init = Some(t),
            Task::Clone(t) => wire.clone = Some(t),
            Task::Patch(t) => wire.patch = Some(t),
            Task::Edit(t) => wire.edit = Some(t),
            Task::Eval(t) => wire.eval = Some(t),
            Task::Update(t) => wire.update = Some(t),
        }
        wire
    }
}

/// Validate a task list submitted for a new revision
pub fn validate_tasks(tasks: &[Task]) -> FieldErrors {
    let mut errors = FieldErrors::new();
    if tasks.is_empty() {
        errors.push("spec.tasks", "at least one task is required");
        return errors;
    }
    for (i, task) in tasks.iter().enumerate() {
        let field = format!("spec.tasks[{i}]");
        if i == 0 && !task.is_initial() {
            errors.push(&field, format!("first task must be init, clone or edit, not {}", task.task_type()));
        }
        if i > 0 && task.is_initial() {
            errors.push(&field, format!("{} is only allowed as the first task", task.task_type()));
        }
        validate_task(task, &field, &mut errors);
    }
    errors
}

/// Validate the fields of a single task
pub fn validate_task(task: &Task, field: &str, errors: &mut FieldErrors) {
    match task {
        Task::Init(_) => {}
        Task::Clone(t) => {
            if t.upstream_ref.is_some() == t.upstream.is_some() {
                errors.push(
                    format!("{field}.clone"),
                    "exactly one of upstreamRef and upstream is required",
                );
            }
        }
        Task::Patch(t) => {
            for (j, p) in t.patches.iter().enumerate() {
                if p.file.trim().is_empty() {
                    errors.push(format!("{field}.patch.patches[{j}].file"), "file is required");
                }
            }
        }
        Task::Edit(t) => {
            if t.source_ref.name.is_empty() {
                errors.push(format!("{field}.edit.sourceRef.name"), "name is required");
            }
        }
        Task::Eval(t) => {
            if t.image.trim().is_empty() {
                errors.push(format!("{field}.eval.image"), "image is required");
            }
        }
        Task::Update(t) => {
            if t.upstream_ref.is_some() == t.upstream.is_some() {
                errors.push(
                    format!("{field}.update"),
                    "exactly one of upstreamRef and upstream is required",
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clone_ref(name: &str) -> Task {
        Task::Clone(CloneTask {
            upstream_ref: Some(PackageRevisionRef::new(name)),
            ..CloneTask::default()
        })
    }

    #[test]
    fn test_wire_format() {
        let json = r#"{"type":"clone","clone":{"upstreamRef":{"name":"r1.pkg-a.v1"}}}"#;
        let task: Task = serde_json::from_str(json).unwrap();
        assert_eq!(task, clone_ref("r1.pkg-a.v1"));
        assert_eq!(serde_json::to_string(&task).unwrap(), json);
    }

    #[test]
    fn test_missing_section_rejected() {
        let result: Result<Task, _> = serde_json::from_str(r#"{"type":"eval"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_init_section_optional() {
        let task: Task = serde_json::from_str(r#"{"type":"init"}"#).unwrap();
        assert_eq!(task, Task::Init(InitTask::default()));
    }

    #[test]
    fn test_empty_task_list_invalid() {
        assert!(validate_tasks(&[]).contains_field("spec.tasks"));
    }

    #[test]
    fn test_clone_must_be_first() {
        let tasks = vec![Task::Init(InitTask::default()), clone_ref("r1.a.v1")];
        assert!(validate_tasks(&tasks).contains_field("spec.tasks[1]"));
    }

    #[test]
    fn test_first_task_must_be_initial() {
        let tasks = vec![Task::Patch(PatchTask::default())];
        assert!(validate_tasks(&tasks).contains_field("spec.tasks[0]"));
    }

    #[test]
    fn test_clone_needs_exactly_one_source() {
        let tasks = vec![Task::Clone(CloneTask::default())];
        assert!(validate_tasks(&tasks).contains_field("spec.tasks[0].clone"));
    }

    #[test]
    fn test_valid_list() {
        let tasks = vec![
            clone_ref("r1.a.v1"),
            Task::Eval(EvalTask {
                image: "set-labels:v0.1".to_string(),
                ..EvalTask::default()
            }),
        ];
        assert!(validate_tasks(&tasks).is_empty());
    }
}
