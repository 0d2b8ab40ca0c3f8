//! Wire objects of the aggregated API

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Condition, Lifecycle, ObjectMeta, Package, RevisionHead, Task, UpstreamLock};
use crate::repository::RepositorySpec;

pub const PORCH_API_VERSION: &str = "porch.kpt.dev/v1alpha1";
pub const CONFIG_API_VERSION: &str = "config.porch.kpt.dev/v1alpha1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryObject {
    #[serde(default = "config_api_version")]
    pub api_version: String,
    #[serde(default = "repository_kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: RepositorySpec,
    #[serde(default)]
    pub status: RepositoryStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl RepositoryObject {
    pub fn new(namespace: &str, name: &str, spec: RepositorySpec) -> Self {
        Self {
            api_version: config_api_version(),
            kind: repository_kind(),
            metadata: ObjectMeta::named(namespace, name),
            spec,
            status: RepositoryStatus::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRevisionSpec {
    #[serde(default)]
    pub package_name: String,
    #[serde(default)]
    pub workspace_name: String,
    #[serde(default)]
    pub revision: String,
    #[serde(default)]
    pub repository_name: String,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRevisionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_lock: Option<UpstreamLock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deployment: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRevision {
    #[serde(default = "porch_api_version")]
    pub api_version: String,
    #[serde(default = "package_revision_kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PackageRevisionSpec,
    #[serde(default)]
    pub status: PackageRevisionStatus,
}

impl PackageRevision {
    /// Object for `head` with side-band metadata `meta`
    pub fn from_head(head: &RevisionHead, mut meta: ObjectMeta, deployment: bool) -> Self {
        meta.name = head.object_name();
        meta.resource_version = head.resource_version.clone();
        Self {
            api_version: porch_api_version(),
            kind: package_revision_kind(),
            metadata: meta,
            spec: PackageRevisionSpec {
                package_name: head.key.package.clone(),
                workspace_name: head.key.workspace.clone(),
                revision: head.key.revision.clone(),
                repository_name: head.key.repository.clone(),
                lifecycle: head.lifecycle,
                tasks: head.tasks.clone(),
            },
            status: PackageRevisionStatus {
                upstream_lock: head.upstream_lock.clone(),
                published_by: head.published_by.clone(),
                published_at: head.published_at,
                deployment,
            },
        }
    }

    /// A new revision request
    pub fn draft(namespace: &str, repository: &str, package: &str, workspace: &str, tasks: Vec<Task>) -> Self {
        Self {
            api_version: porch_api_version(),
            kind: package_revision_kind(),
            metadata: ObjectMeta::named(namespace, ""),
            spec: PackageRevisionSpec {
                package_name: package.to_string(),
                workspace_name: workspace.to_string(),
                revision: String::new(),
                repository_name: repository.to_string(),
                lifecycle: Lifecycle::Draft,
                tasks,
            },
            status: PackageRevisionStatus::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRevisionResourcesSpec {
    #[serde(default)]
    pub package_name: String,
    #[serde(default)]
    pub workspace_name: String,
    #[serde(default)]
    pub revision: String,
    #[serde(default)]
    pub repository_name: String,
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRevisionResources {
    #[serde(default = "porch_api_version")]
    pub api_version: String,
    #[serde(default = "resources_kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PackageRevisionResourcesSpec,
}

impl PackageRevisionResources {
    pub fn from_head(head: &RevisionHead, namespace: &str, resources: BTreeMap<String, String>) -> Self {
        let mut metadata = ObjectMeta::named(namespace, head.object_name());
        metadata.resource_version = head.resource_version.clone();
        Self {
            api_version: porch_api_version(),
            kind: resources_kind(),
            metadata,
            spec: PackageRevisionResourcesSpec {
                package_name: head.key.package.clone(),
                workspace_name: head.key.workspace.clone(),
                revision: head.key.revision.clone(),
                repository_name: head.key.repository.clone(),
                resources,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageObject {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: PackageObjectSpec,
    pub status: PackageObjectStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageObjectSpec {
    pub package_name: String,
    pub repository_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageObjectStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_revision: Option<String>,
}

impl PackageObject {
    pub fn from_package(namespace: &str, package: &Package) -> Self {
        let name = format!("{}.{}", package.repository, package.name.replace('/', "."));
        Self {
            api_version: porch_api_version(),
            kind: "PorchPackage".to_string(),
            metadata: ObjectMeta::named(namespace, name),
            spec: PackageObjectSpec {
                package_name: package.name.clone(),
                repository_name: package.repository.clone(),
            },
            status: PackageObjectStatus {
                latest_revision: package.latest_revision.clone(),
            },
        }
    }
}

/// Body of an approval update: only the lifecycle is read
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: ApprovalSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApprovalSpec {
    pub lifecycle: Lifecycle,
}

/// Kubernetes-style list envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct List<T> {
    pub api_version: String,
    pub kind: String,
    pub items: Vec<T>,
}

impl<T> List<T> {
    pub fn new(api_version: &str, kind: &str, items: Vec<T>) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: format!("{kind}List"),
            items,
        }
    }
}

/// Kubernetes-style error body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub api_version: String,
    pub kind: String,
    pub status: String,
    pub message: String,
    pub reason: String,
    pub code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<StatusDetails>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusDetails {
    pub causes: Vec<StatusCause>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCause {
    pub field: String,
    pub message: String,
}

fn porch_api_version() -> String {
    PORCH_API_VERSION.to_string()
}

fn config_api_version() -> String {
    CONFIG_API_VERSION.to_string()
}

fn repository_kind() -> String {
    "Repository".to_string()
}

fn package_revision_kind() -> String {
    "PackageRevision".to_string()
}

fn resources_kind() -> String {
    "PackageRevisionResources".to_string()
}
