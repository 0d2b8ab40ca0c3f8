//! Git reference layout and resolution
//!
//! Package revisions live under fixed ref namespaces:
//! - drafts: `refs/heads/drafts/<package>/<workspace>`
//! - proposed: `refs/heads/proposed/<package>/<workspace>`
//! - published: `refs/tags/<package>/<revision>`
//! - deletion proposed: the tag plus `refs/heads/deletionProposed/<package>/<revision>`
//!
//! Package names may contain `/` (nested package paths), so every parse
//! splits on the right-most `/`.

use git2::Repository;

use crate::error::{PorchError, Result};

pub const HEADS_PREFIX: &str = "refs/heads/";
pub const TAGS_PREFIX: &str = "refs/tags/";
pub const DRAFTS_PREFIX: &str = "refs/heads/drafts/";
pub const PROPOSED_PREFIX: &str = "refs/heads/proposed/";
pub const DELETION_PROPOSED_PREFIX: &str = "refs/heads/deletionProposed/";

/// Short prefix that marks a draft in an upstream lock ref
pub const DRAFTS_SHORT_PREFIX: &str = "drafts/";

pub fn draft_ref(package: &str, workspace: &str) -> String {
    format!("{DRAFTS_PREFIX}{package}/{workspace}")
}

pub fn proposed_ref(package: &str, workspace: &str) -> String {
    format!("{PROPOSED_PREFIX}{package}/{workspace}")
}

pub fn deletion_proposed_ref(package: &str, revision: &str) -> String {
    format!("{DELETION_PROPOSED_PREFIX}{package}/{revision}")
}

pub fn tag_ref(package: &str, revision: &str) -> String {
    format!("{TAGS_PREFIX}{package}/{revision}")
}

pub fn branch_ref(branch: &str) -> String {
    if branch.starts_with("refs/") {
        branch.to_string()
    } else {
        format!("{HEADS_PREFIX}{branch}")
    }
}

/// A ref classified by the namespace it lives in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageRef {
    Draft { package: String, workspace: String },
    Proposed { package: String, workspace: String },
    Published { package: String, revision: String },
    DeletionProposed { package: String, revision: String },
}

impl PackageRef {
    /// Classify a full ref name; `None` for refs outside the package namespaces
    pub fn parse(refname: &str) -> Option<Self> {
        if let Some(rest) = refname.strip_prefix(DRAFTS_PREFIX) {
            let (package, workspace) = split_last(rest)?;
            return Some(PackageRef::Draft { package, workspace });
        }
        if let Some(rest) = refname.strip_prefix(PROPOSED_PREFIX) {
            let (package, workspace) = split_last(rest)?;
            return Some(PackageRef::Proposed { package, workspace });
        }
        if let Some(rest) = refname.strip_prefix(DELETION_PROPOSED_PREFIX) {
            let (package, revision) = split_last(rest)?;
            return Some(PackageRef::DeletionProposed { package, revision });
        }
        if let Some(rest) = refname.strip_prefix(TAGS_PREFIX) {
            let (package, revision) = split_last(rest)?;
            return Some(PackageRef::Published { package, revision });
        }
        None
    }

    pub fn package(&self) -> &str {
        match self {
            PackageRef::Draft { package, .. }
            | PackageRef::Proposed { package, .. }
            | PackageRef::Published { package, .. }
            | PackageRef::DeletionProposed { package, .. } => package,
        }
    }

    pub fn refname(&self) -> String {
        match self {
            PackageRef::Draft { package, workspace } => draft_ref(package, workspace),
            PackageRef::Proposed { package, workspace } => proposed_ref(package, workspace),
            PackageRef::Published { package, revision } => tag_ref(package, revision),
            PackageRef::DeletionProposed { package, revision } => {
                deletion_proposed_ref(package, revision)
            }
        }
    }
}

fn split_last(rest: &str) -> Option<(String, String)> {
    let (package, last) = rest.rsplit_once('/')?;
    if package.is_empty() || last.is_empty() {
        return None;
    }
    Some((package.to_string(), last.to_string()))
}

/// Parsed `upstreamLock.git.ref` value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRef {
    pub package: String,
    /// Revision, or workspace name when `draft` is set
    pub revision: String,
    pub draft: bool,
}

/// Parse `[drafts/]<package-path>/<revision-or-workspace>`
///
/// Everything after the right-most `/` is the revision. A ref without any
/// `/` is rejected.
pub fn parse_lock_ref(git_ref: &str) -> Result<LockRef> {
    let (draft, rest) = match git_ref.strip_prefix(DRAFTS_SHORT_PREFIX) {
        Some(rest) => (true, rest),
        None => (false, git_ref),
    };
    let Some((package, revision)) = rest.rsplit_once('/') else {
        return Err(PorchError::GitRefResolveFailed {
            git_ref: git_ref.to_string(),
            reason: "expected <package>/<revision>".to_string(),
        });
    };
    if package.is_empty() || revision.is_empty() {
        return Err(PorchError::GitRefResolveFailed {
            git_ref: git_ref.to_string(),
            reason: "package and revision must not be empty".to_string(),
        });
    }
    Ok(LockRef {
        package: package.to_string(),
        revision: revision.to_string(),
        draft,
    })
}

/// Short ref recorded in upstream locks for a published revision
pub fn lock_ref_for_published(package: &str, revision: &str) -> String {
    format!("{package}/{revision}")
}

/// Short ref recorded in upstream locks for a draft
pub fn lock_ref_for_draft(package: &str, workspace: &str) -> String {
    format!("{DRAFTS_SHORT_PREFIX}{package}/{workspace}")
}

/// Resolve a git ref (branch, tag, or partial SHA) to a commit
pub fn resolve_commit<'a>(repo: &'a Repository, refname: &str) -> Result<git2::Commit<'a>> {
    let ref_candidates = [
        refname.to_string(),
        format!("{HEADS_PREFIX}{refname}"),
        format!("{TAGS_PREFIX}{refname}"),
        format!("refs/remotes/origin/{refname}"),
    ];

    for candidate in &ref_candidates {
        if let Ok(reference) = repo.find_reference(candidate) {
            if let Ok(commit) = reference.peel_to_commit() {
                return Ok(commit);
            }
        }
    }

    if let Ok(oid) = git2::Oid::from_str(refname) {
        if let Ok(commit) = repo.find_commit(oid) {
            return Ok(commit);
        }
    }

    if let Ok(obj) = repo.revparse_single(refname) {
        if let Ok(commit) = obj.peel_to_commit() {
            return Ok(commit);
        }
    }

    Err(PorchError::GitRefResolveFailed {
        git_ref: refname.to_string(),
        reason: "Could not resolve reference".to_string(),
    })
}

/// Resolve a git ref (branch, tag, or partial SHA) to a full SHA
pub fn resolve_ref(repo: &Repository, git_ref: &str) -> Result<String> {
    Ok(resolve_commit(repo, git_ref)?.id().to_string())
}
