//! Package revision model
//!
//! A package revision is identified by `(repository, package, workspace,
//! revision)`. Drafts have an empty revision and are addressed by workspace;
//! published revisions carry a `v<N>` style revision.

pub mod kptfile;
pub mod lifecycle;
pub mod meta;
pub mod task;

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use kptfile::{Kptfile, UpdateStrategy, Upstream, UpstreamLock};
pub use lifecycle::Lifecycle;
pub use meta::{Condition, ObjectMeta, OwnerReference};
pub use task::{Task, TaskType};

/// A package's files: path relative to the package root to UTF-8 content
pub type Resources = BTreeMap<String, String>;

/// Revision value used by drafts in comparisons
pub const DRAFT_REVISION: &str = "v0";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRevisionKey {
    pub repository: String,
    pub package: String,
    pub workspace: String,
    #[serde(default)]
    pub revision: String,
}

impl PackageRevisionKey {
    pub fn new(
        repository: impl Into<String>,
        package: impl Into<String>,
        workspace: impl Into<String>,
        revision: impl Into<String>,
    ) -> Self {
        Self {
            repository: repository.into(),
            package: package.into(),
            workspace: workspace.into(),
            revision: revision.into(),
        }
    }

    /// Object name of the revision: `<repository>.<package>.<workspace>`
    pub fn object_name(&self) -> String {
        revision_object_name(&self.repository, &self.package, &self.workspace)
    }
}

impl std::fmt::Display for PackageRevisionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.repository, self.package)?;
        if self.revision.is_empty() {
            write!(f, "@{}", self.workspace)
        } else {
            write!(f, "@{}", self.revision)
        }
    }
}

/// Object name for a revision; `/` in nested package paths becomes `.`
pub fn revision_object_name(repository: &str, package: &str, workspace: &str) -> String {
    format!("{repository}.{}.{workspace}", package.replace('/', "."))
}

/// What a backend knows about one revision, without its resources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionHead {
    pub key: PackageRevisionKey,
    pub lifecycle: Lifecycle,
    #[serde(default)]
    pub tasks: Vec<Task>,
    /// Source this revision was cloned or last updated from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_lock: Option<UpstreamLock>,
    /// Coordinate of this revision when used as an upstream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_lock: Option<UpstreamLock>,
    pub resource_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

impl RevisionHead {
    pub fn object_name(&self) -> String {
        self.key.object_name()
    }
}

/// Criteria for listing revisions; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevisionFilter {
    pub package: Option<String>,
    pub workspace: Option<String>,
    pub revision: Option<String>,
    pub lifecycle: Option<Lifecycle>,
}

impl RevisionFilter {
    pub fn package(package: impl Into<String>) -> Self {
        Self {
            package: Some(package.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, head: &RevisionHead) -> bool {
        self.package.as_ref().is_none_or(|p| *p == head.key.package)
            && self.workspace.as_ref().is_none_or(|w| *w == head.key.workspace)
            && self.revision.as_ref().is_none_or(|r| *r == head.key.revision)
            && self.lifecycle.is_none_or(|l| l == head.lifecycle)
    }
}

/// All revisions sharing `(repository, package)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    pub repository: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_revision: Option<String>,
}

/// Group revision heads into packages
pub fn packages_of(heads: &[RevisionHead]) -> Vec<Package> {
    let mut packages: BTreeMap<(String, String), Option<String>> = BTreeMap::new();
    for head in heads {
        let entry = packages
            .entry((head.key.repository.clone(), head.key.package.clone()))
            .or_default();
        if head.lifecycle.is_published() {
            let newer = entry
                .as_deref()
                .is_none_or(|current| compare_revisions(&head.key.revision, current) == Ordering::Greater);
            if newer {
                *entry = Some(head.key.revision.clone());
            }
        }
    }
    packages
        .into_iter()
        .map(|((repository, name), latest_revision)| Package {
            repository,
            name,
            latest_revision,
        })
        .collect()
}

/// Parse a `v1`, `v1.2` or `1.2.3` revision as semver, padding missing parts
pub fn parse_revision(revision: &str) -> Option<semver::Version> {
    let trimmed = revision.trim().trim_start_matches(['v', 'V']);
    if trimmed.is_empty() {
        return None;
    }
    let core_end = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(core_end);
    let parts = core.split('.').count();
    let padded = match parts {
        1 => format!("{core}.0.0{suffix}"),
        2 => format!("{core}.0{suffix}"),
        _ => trimmed.to_string(),
    };
    semver::Version::parse(&padded).ok()
}

/// Order revisions by semver; drafts (`""`) count as `v0`
///
/// Non-semver revisions sort below semver ones and compare lexically among
/// themselves.
pub fn compare_revisions(a: &str, b: &str) -> Ordering {
    let a = if a.is_empty() { DRAFT_REVISION } else { a };
    let b = if b.is_empty() { DRAFT_REVISION } else { b };
    match (parse_revision(a), parse_revision(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => a.cmp(b),
    }
}

/// Next `v<N>` after the highest `v<N>` in `existing`
pub fn next_revision<'a>(existing: impl IntoIterator<Item = &'a str>) -> String {
    let highest = existing
        .into_iter()
        .filter_map(|r| r.strip_prefix('v'))
        .filter_map(|n| n.parse::<u64>().ok())
        .max()
        .unwrap_or(0);
    format!("v{}", highest + 1)
}
