//! The `Kptfile` package manifest
//!
//! ```yaml
//! apiVersion: kpt.dev/v1
//! kind: Kptfile
//! metadata:
//!   name: pkg-a
//! upstream:
//!   type: git
//!   git: {repo: https://example.com/r1.git, directory: pkg-a, ref: pkg-a/v1}
//!   updateStrategy: resource-merge
//! upstreamLock:
//!   type: git
//!   git: {repo: https://example.com/r1.git, directory: pkg-a, ref: pkg-a/v1, commit: 3f2a...}
//! info: {description: ...}
//! pipeline: {mutators: [...], validators: [...]}
//! inventory: {namespace: ..., name: ..., inventoryID: ...}
//! ```
//!
//! Unknown top-level sections are preserved on round trip.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{PorchError, Result};
use crate::reference::{DirReference, GitReference, OciReference, Reference, ReferenceLock, ReferenceType};

pub const KPTFILE_NAME: &str = "Kptfile";
pub const KPTFILE_API_VERSION: &str = "kpt.dev/v1";
pub const KPTFILE_KIND: &str = "Kptfile";

/// How a downstream package is brought up to date with its upstream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateStrategy {
    #[default]
    ResourceMerge,
    FastForward,
    ForceDeleteReplace,
}

/// Origin of a package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Upstream {
    #[serde(rename = "type")]
    pub upstream_type: ReferenceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oci: Option<OciReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<DirReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_strategy: Option<UpdateStrategy>,
}

impl Upstream {
    pub fn from_reference(reference: &Reference) -> Result<Self> {
        let mut upstream = Self {
            upstream_type: reference.reference_type(),
            git: None,
            oci: None,
            dir: None,
            update_strategy: None,
        };
        match reference {
            Reference::Git(r) => upstream.git = Some(r.clone()),
            Reference::Oci(r) => upstream.oci = Some(r.clone()),
            Reference::Dir(r) => upstream.dir = Some(r.clone()),
            Reference::InputStream(_) | Reference::OutputStream(_) | Reference::DuplexStream(_) => {
                return Err(PorchError::ReferenceParseFailed {
                    input: reference.to_string(),
                    reason: "stream references cannot be recorded as an upstream".to_string(),
                });
            }
        }
        Ok(upstream)
    }

    pub fn to_reference(&self) -> Result<Reference> {
        let reference = match self.upstream_type {
            ReferenceType::Git => self.git.clone().map(Reference::Git),
            ReferenceType::Oci => self.oci.clone().map(Reference::Oci),
            ReferenceType::Dir => self.dir.clone().map(Reference::Dir),
            ReferenceType::Stream => None,
        };
        reference.ok_or_else(|| PorchError::ReferenceParseFailed {
            input: format!("upstream of type {}", self.upstream_type),
            reason: format!("missing '{}' section", self.upstream_type),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitLock {
    pub repo: String,
    #[serde(default)]
    pub directory: String,
    #[serde(rename = "ref", default)]
    pub git_ref: String,
    pub commit: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciLock {
    pub image: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub directory: String,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirLock {
    pub directory: String,
    #[serde(rename = "ref", default)]
    pub git_ref: String,
    pub digest: String,
}

/// Exact coordinate of the source a package was cloned or updated from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamLock {
    #[serde(rename = "type")]
    pub lock_type: ReferenceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitLock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oci: Option<OciLock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<DirLock>,
}

impl UpstreamLock {
    pub fn git(repo: &str, directory: &str, git_ref: &str, commit: &str) -> Self {
        Self {
            lock_type: ReferenceType::Git,
            git: Some(GitLock {
                repo: repo.to_string(),
                directory: directory.to_string(),
                git_ref: git_ref.to_string(),
                commit: commit.to_string(),
            }),
            oci: None,
            dir: None,
        }
    }

    pub fn oci(image: &str, directory: &str, digest: &str) -> Self {
        Self {
            lock_type: ReferenceType::Oci,
            git: None,
            oci: Some(OciLock {
                image: image.to_string(),
                directory: directory.to_string(),
                digest: digest.to_string(),
            }),
            dir: None,
        }
    }

    pub fn dir(directory: &str, git_ref: &str, digest: &str) -> Self {
        Self {
            lock_type: ReferenceType::Dir,
            git: None,
            oci: None,
            dir: Some(DirLock {
                directory: directory.to_string(),
                git_ref: git_ref.to_string(),
                digest: digest.to_string(),
            }),
        }
    }

    pub fn from_lock(lock: &ReferenceLock) -> Result<Self> {
        match lock.reference() {
            Reference::Git(r) => Ok(Self::git(&r.repo, &r.directory, &r.git_ref, lock.lock())),
            Reference::Oci(r) => Ok(Self::oci(&r.image, &r.directory, lock.lock())),
            Reference::Dir(r) => Ok(Self::dir(
                &r.directory.to_string_lossy(),
                "",
                lock.lock(),
            )),
            Reference::InputStream(_) | Reference::OutputStream(_) | Reference::DuplexStream(_) => {
                Err(PorchError::internal("stream references cannot be locked"))
            }
        }
    }

    pub fn to_lock(&self) -> Result<ReferenceLock> {
        let missing = || PorchError::ReferenceParseFailed {
            input: format!("upstreamLock of type {}", self.lock_type),
            reason: format!("missing '{}' section", self.lock_type),
        };
        match self.lock_type {
            ReferenceType::Git => {
                let git = self.git.as_ref().ok_or_else(missing)?;
                ReferenceLock::new(
                    Reference::Git(GitReference::new(&git.repo, &git.directory, &git.git_ref)),
                    &git.commit,
                )
            }
            ReferenceType::Oci => {
                let oci = self.oci.as_ref().ok_or_else(missing)?;
                ReferenceLock::new(
                    Reference::Oci(OciReference::new(&oci.image, &oci.directory)),
                    &oci.digest,
                )
            }
            ReferenceType::Dir => {
                let dir = self.dir.as_ref().ok_or_else(missing)?;
                ReferenceLock::new(Reference::Dir(DirReference::new(&dir.directory)), &dir.digest)
            }
            ReferenceType::Stream => Err(missing()),
        }
    }

    /// The unlocked origin this lock pins
    pub fn to_upstream(&self) -> Result<Upstream> {
        let reference = match self.lock_type {
            ReferenceType::Dir => {
                let dir = self.dir.as_ref().map(|d| DirReference::new(&d.directory));
                dir.map(Reference::Dir)
            }
            _ => Some(self.to_lock()?.into_reference()),
        };
        match reference {
            Some(r) => Upstream::from_reference(&r),
            None => Err(PorchError::internal("upstream lock without content")),
        }
    }

    /// `git.ref` or `dir.ref`
    pub fn git_ref(&self) -> Option<&str> {
        match self.lock_type {
            ReferenceType::Git => self.git.as_ref().map(|g| g.git_ref.as_str()),
            ReferenceType::Dir => self.dir.as_ref().map(|d| d.git_ref.as_str()),
            ReferenceType::Oci | ReferenceType::Stream => None,
        }
    }

    /// Repository URL, image name or directory
    pub fn location(&self) -> Option<&str> {
        match self.lock_type {
            ReferenceType::Git => self.git.as_ref().map(|g| g.repo.as_str()),
            ReferenceType::Oci => self.oci.as_ref().map(|o| o.image.as_str()),
            ReferenceType::Dir => self.dir.as_ref().map(|d| d.directory.as_str()),
            ReferenceType::Stream => None,
        }
    }

    /// Commit, digest or content hash
    pub fn id(&self) -> Option<&str> {
        match self.lock_type {
            ReferenceType::Git => self.git.as_ref().map(|g| g.commit.as_str()),
            ReferenceType::Oci => self.oci.as_ref().map(|o| o.digest.as_str()),
            ReferenceType::Dir => self.dir.as_ref().map(|d| d.digest.as_str()),
            ReferenceType::Stream => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KptMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub site: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emails: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub license: String,
}

/// A function invocation in the pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Function {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config_map: BTreeMap<String, String>,
    /// Path of a config resource relative to the package
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mutators: Vec<Function>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validators: Vec<Function>,
}

impl Pipeline {
    pub fn is_empty(&self) -> bool {
        self.mutators.is_empty() && self.validators.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inventory {
    pub namespace: String,
    pub name: String,
    #[serde(rename = "inventoryID")]
    pub inventory_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kptfile {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: KptMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<Upstream>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_lock: Option<UpstreamLock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<PackageInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<Pipeline>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory: Option<Inventory>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl Kptfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            api_version: KPTFILE_API_VERSION.to_string(),
            kind: KPTFILE_KIND.to_string(),
            metadata: KptMetadata {
                name: name.into(),
                ..KptMetadata::default()
            },
            upstream: None,
            upstream_lock: None,
            info: None,
            pipeline: None,
            inventory: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        let kptfile: Kptfile =
            serde_yaml::from_str(content).map_err(|e| PorchError::ParseFailed {
                path: KPTFILE_NAME.to_string(),
                reason: e.to_string(),
            })?;
        if kptfile.kind != KPTFILE_KIND {
            return Err(PorchError::ParseFailed {
                path: KPTFILE_NAME.to_string(),
                reason: format!("expected kind {KPTFILE_KIND}, found {}", kptfile.kind),
            });
        }
        Ok(kptfile)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| PorchError::ParseFailed {
            path: KPTFILE_NAME.to_string(),
            reason: e.to_string(),
        })
    }

    /// Kptfile at `dir` (package root when empty) in a resource map
    pub fn from_resources(resources: &BTreeMap<String, String>, dir: &str) -> Result<Option<Self>> {
        let path = kptfile_path(dir);
        resources.get(&path).map(|c| Self::parse(c)).transpose()
    }

    /// Write this Kptfile into a resource map at `dir`
    pub fn store(&self, resources: &mut BTreeMap<String, String>, dir: &str) -> Result<()> {
        resources.insert(kptfile_path(dir), self.to_yaml()?);
        Ok(())
    }

    pub fn pipeline(&self) -> Pipeline {
        self.pipeline.clone().unwrap_or_default()
    }
}

/// Path of the Kptfile of the package at `dir`
pub fn kptfile_path(dir: &str) -> String {
    let dir = dir.trim_matches('/');
    if dir.is_empty() || dir == "." {
        KPTFILE_NAME.to_string()
    } else {
        format!("{dir}/{KPTFILE_NAME}")
    }
}
