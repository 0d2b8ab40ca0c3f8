//! Package references
//!
//! A [`Reference`] says where a package lives: a git repository, an OCI
//! image, a local directory or a stream. A [`ReferenceLock`] pins a
//! reference to an immutable identifier (commit, digest or content hash)
//! and is only ever produced by a backend after its I/O succeeded.
//!
//! Strings are turned into references by the [`parser::ParserRegistry`].

pub mod dir;
pub mod git;
pub mod oci;
pub mod parser;
pub mod stream;

pub use dir::DirReference;
pub use git::GitReference;
pub use oci::OciReference;
pub use parser::{ParseOptions, ParserRegistry, ReferenceParser};
pub use stream::StreamReference;

use serde::{Deserialize, Serialize};

use crate::error::{PorchError, Result};

/// Kind of a reference, as written in `upstream.type` of a Kptfile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceType {
    Git,
    Oci,
    Dir,
    Stream,
}

impl std::fmt::Display for ReferenceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ReferenceType::Git => "git",
            ReferenceType::Oci => "oci",
            ReferenceType::Dir => "dir",
            ReferenceType::Stream => "stream",
        };
        f.write_str(name)
    }
}

/// Where a package lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Git(GitReference),
    Oci(OciReference),
    Dir(DirReference),
    InputStream(StreamReference),
    OutputStream(StreamReference),
    DuplexStream(StreamReference),
}

impl Reference {
    pub fn reference_type(&self) -> ReferenceType {
        match self {
            Reference::Git(_) => ReferenceType::Git,
            Reference::Oci(_) => ReferenceType::Oci,
            Reference::Dir(_) => ReferenceType::Dir,
            Reference::InputStream(_) | Reference::OutputStream(_) | Reference::DuplexStream(_) => {
                ReferenceType::Stream
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Reference::Git(r) => r.validate(),
            Reference::Oci(r) => r.validate(),
            Reference::Dir(r) => r.validate(),
            Reference::InputStream(s) => require_handle(s.reader.is_some(), "input stream has no reader"),
            Reference::OutputStream(s) => require_handle(s.writer.is_some(), "output stream has no writer"),
            Reference::DuplexStream(s) => require_handle(
                s.reader.is_some() && s.writer.is_some(),
                "duplex stream needs a reader and a writer",
            ),
        }
    }

    /// Branch, tag or commit for git; tag for OCI
    pub fn revision(&self) -> Option<&str> {
        match self {
            Reference::Git(r) => Some(r.git_ref.as_str()),
            Reference::Oci(r) => r.tag(),
            Reference::Dir(_)
            | Reference::InputStream(_)
            | Reference::OutputStream(_)
            | Reference::DuplexStream(_) => None,
        }
    }

    /// Same location at another revision
    pub fn with_revision(&self, revision: &str) -> Result<Reference> {
        match self {
            Reference::Git(r) => Ok(Reference::Git(GitReference {
                git_ref: revision.to_string(),
                ..r.clone()
            })),
            Reference::Oci(r) => Ok(Reference::Oci(r.with_tag(revision))),
            Reference::Dir(_)
            | Reference::InputStream(_)
            | Reference::OutputStream(_)
            | Reference::DuplexStream(_) => Err(PorchError::ReferenceParseFailed {
                input: self.to_string(),
                reason: format!("{} references have no revision", self.reference_type()),
            }),
        }
    }

    pub fn default_revision(&self) -> Option<&'static str> {
        match self {
            Reference::Git(_) => Some(git::DEFAULT_GIT_REF),
            Reference::Oci(_) => Some(oci::DEFAULT_OCI_TAG),
            Reference::Dir(_)
            | Reference::InputStream(_)
            | Reference::OutputStream(_)
            | Reference::DuplexStream(_) => None,
        }
    }

    pub fn default_directory_name(&self) -> Option<String> {
        match self {
            Reference::Git(r) => Some(r.default_directory_name()),
            Reference::Oci(r) => Some(r.default_directory_name()),
            Reference::Dir(r) => Some(r.default_directory_name()),
            Reference::InputStream(_) | Reference::OutputStream(_) | Reference::DuplexStream(_) => None,
        }
    }

    /// Package directory within its repository or image
    pub fn directory(&self) -> Option<String> {
        match self {
            Reference::Git(r) => Some(r.directory.clone()),
            Reference::Oci(r) => Some(r.directory.clone()),
            Reference::Dir(r) => Some(r.directory.to_string_lossy().into_owned()),
            Reference::InputStream(_) | Reference::OutputStream(_) | Reference::DuplexStream(_) => None,
        }
    }

    /// Path of `target` relative to `self`
    ///
    /// Both references must point into the same repository, image or
    /// filesystem.
    pub fn rel(&self, target: &Reference) -> Result<String> {
        let same_root = match (self, target) {
            (Reference::Git(a), Reference::Git(b)) => crate::git::url::same_repo(&a.repo, &b.repo),
            (Reference::Oci(a), Reference::Oci(b)) => a.name() == b.name(),
            (Reference::Dir(_), Reference::Dir(_)) => true,
            _ => false,
        };
        let (Some(from), Some(to)) = (self.directory(), target.directory()) else {
            return Err(self.rel_error(target));
        };
        if !same_root {
            return Err(self.rel_error(target));
        }
        Ok(dir::relative_path(&from, &to))
    }

    fn rel_error(&self, target: &Reference) -> PorchError {
        PorchError::ReferenceParseFailed {
            input: target.to_string(),
            reason: format!("not relative to {self}"),
        }
    }
}

fn require_handle(present: bool, reason: &str) -> Result<()> {
    if present {
        Ok(())
    } else {
        Err(PorchError::ReferenceParseFailed {
            input: "-".to_string(),
            reason: reason.to_string(),
        })
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reference::Git(r) => r.fmt(f),
            Reference::Oci(r) => r.fmt(f),
            Reference::Dir(r) => r.fmt(f),
            Reference::InputStream(_) | Reference::OutputStream(_) | Reference::DuplexStream(_) => {
                f.write_str("-")
            }
        }
    }
}

/// A reference pinned to an immutable identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceLock {
    reference: Reference,
    lock: String,
}

impl ReferenceLock {
    /// Pin `reference` to `lock`
    ///
    /// Git locks are 40 hex commit ids, OCI locks are `sha256:` digests and
    /// dir locks are 64 hex content hashes. Streams cannot be locked.
    pub fn new(reference: Reference, lock: impl Into<String>) -> Result<Self> {
        let lock = lock.into();
        let valid = match &reference {
            Reference::Git(_) => is_hex(&lock, 40),
            Reference::Oci(_) => oci::is_valid_digest(&lock),
            Reference::Dir(_) => is_hex(&lock, 64),
            Reference::InputStream(_) | Reference::OutputStream(_) | Reference::DuplexStream(_) => false,
        };
        if !valid {
            return Err(PorchError::ReferenceParseFailed {
                input: reference.to_string(),
                reason: format!("invalid {} lock '{lock}'", reference.reference_type()),
            });
        }
        Ok(Self { reference, lock })
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub fn lock(&self) -> &str {
        &self.lock
    }

    /// Re-pin the same location to another identifier
    pub fn with_lock(&self, lock: impl Into<String>) -> Result<Self> {
        Self::new(self.reference.clone(), lock)
    }

    /// Setting a revision drops the lock
    pub fn with_revision(&self, revision: &str) -> Result<Reference> {
        self.reference.with_revision(revision)
    }

    pub fn into_reference(self) -> Reference {
        self.reference
    }
}

impl std::fmt::Display for ReferenceLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.reference, self.lock)
    }
}

fn is_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.chars().all(|c| c.is_ascii_hexdigit())
}
