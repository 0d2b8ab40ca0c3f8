//! Error types and handling for Porch
//!
//! Uses `thiserror` for error definitions and `miette` for pretty diagnostics.
//!
//! Every variant belongs to one of five [`ErrorKind`]s which decide how the
//! error travels: API callers see an HTTP status, controllers either requeue
//! (retryable kinds) or record a permanent failure condition.
//!
//! This module is organized into sub-modules:
//! - [`field`]: aggregated field validation errors
//! - [`macros`]: helpers for building errors with context

#![allow(dead_code, unused_assignments)]

pub mod field;
pub mod macros;

pub use field::{FieldError, FieldErrors};

use miette::Diagnostic;
use thiserror::Error;

/// Classification of errors shared by every component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Referenced package, revision, repository or object is absent
    NotFound,
    /// Optimistic concurrency or lifecycle-rule violation
    Conflict,
    /// Validation failure
    Invalid,
    /// Git, OCI or network failure
    Backend,
    /// Invariant violation
    Internal,
}

impl ErrorKind {
    /// Whether a controller should requeue on this kind of error
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Conflict | ErrorKind::Backend)
    }

    /// HTTP status used by the API surface
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Invalid => 422,
            ErrorKind::Backend => 503,
            ErrorKind::Internal => 500,
        }
    }

    /// Kubernetes-style reason string
    pub fn reason(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::Invalid => "Invalid",
            ErrorKind::Backend => "ServiceUnavailable",
            ErrorKind::Internal => "InternalError",
        }
    }
}

/// Main error type for Porch operations
#[derive(Error, Diagnostic, Debug)]
pub enum PorchError {
    // Not found
    #[error("Repository '{name}' not found")]
    #[diagnostic(
        code(porch::repository::not_found),
        help("Register the repository before referencing it")
    )]
    RepositoryNotFound { name: String },

    #[error("Package revision '{name}' not found")]
    #[diagnostic(code(porch::revision::not_found))]
    PackageRevisionNotFound { name: String },

    #[error("{kind} '{name}' not found")]
    #[diagnostic(code(porch::object::not_found))]
    ObjectNotFound { kind: String, name: String },

    #[error("File not found: {path}")]
    #[diagnostic(code(porch::fs::not_found))]
    FileNotFound { path: String },

    // Conflict
    #[error("{kind} '{name}' already exists")]
    #[diagnostic(code(porch::object::already_exists))]
    AlreadyExists { kind: String, name: String },

    #[error("Resource version mismatch for '{name}': expected {expected}, found {actual}")]
    #[diagnostic(
        code(porch::api::conflict),
        help("Re-read the object and retry the update")
    )]
    ResourceVersionMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Tag '{tag}' already exists")]
    #[diagnostic(
        code(porch::git::tag_exists),
        help("Published revisions are immutable; choose a new revision")
    )]
    TagExists { tag: String },

    #[error("Push of '{refname}' was rejected: {reason}")]
    #[diagnostic(code(porch::git::push_rejected))]
    PushRejected { refname: String, reason: String },

    #[error("Package revision '{name}' cannot be modified: {message}")]
    #[diagnostic(code(porch::lifecycle::conflict))]
    LifecycleConflict { name: String, message: String },

    // Invalid
    #[error("{kind} '{name}' is invalid: {errors}")]
    #[diagnostic(code(porch::validation::invalid))]
    Invalid {
        kind: String,
        name: String,
        errors: FieldErrors,
    },

    #[error("Failed to parse reference '{input}': {reason}")]
    #[diagnostic(code(porch::reference::parse_failed))]
    ReferenceParseFailed { input: String, reason: String },

    #[error("Failed to parse {path}: {reason}")]
    #[diagnostic(code(porch::resources::parse_failed))]
    ParseFailed { path: String, reason: String },

    #[error("Duplicate resource {id} in {input} input (file {path})")]
    #[diagnostic(
        code(porch::merge::duplicate),
        help("Each resource must be declared once per package")
    )]
    DuplicateResource {
        input: String,
        id: String,
        path: String,
    },

    #[error("Failed to apply patch to {file}: {reason}")]
    #[diagnostic(code(porch::engine::patch_failed))]
    PatchFailed { file: String, reason: String },

    #[error("Function {image} failed: {reason}")]
    #[diagnostic(code(porch::engine::function_failed))]
    FunctionFailed { image: String, reason: String },

    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(porch::config::invalid))]
    ConfigInvalid { message: String },

    #[error("Failed to parse configuration file: {path}")]
    #[diagnostic(code(porch::config::parse_failed))]
    ConfigParseFailed { path: String, reason: String },

    // Backend
    #[error("Git operation failed: {message}")]
    #[diagnostic(code(porch::git::operation_failed))]
    GitOperationFailed { message: String },

    #[error("Failed to fetch repository {url}: {reason}")]
    #[diagnostic(
        code(porch::git::fetch_failed),
        help("Check that URL is correct and you have access to repository")
    )]
    GitFetchFailed { url: String, reason: String },

    #[error("Failed to resolve git ref '{git_ref}': {reason}")]
    #[diagnostic(code(porch::git::ref_resolve_failed))]
    GitRefResolveFailed { git_ref: String, reason: String },

    #[error("Failed to open repository at '{path}': {reason}")]
    #[diagnostic(code(porch::git::open_failed))]
    GitOpenFailed { path: String, reason: String },

    #[error("Backend {url} ({reference}) failed: {reason}")]
    #[diagnostic(code(porch::backend::failed))]
    Backend {
        url: String,
        reference: String,
        reason: String,
    },

    #[error("OCI registry operation on {image} failed: {reason}")]
    #[diagnostic(code(porch::oci::failed))]
    OciFailed { image: String, reason: String },

    #[error("IO error: {message}")]
    #[diagnostic(code(porch::fs::io_error))]
    IoError { message: String },

    #[error("Operation cancelled")]
    #[diagnostic(code(porch::cancelled))]
    Cancelled,

    #[error("Operation timed out: {operation}")]
    #[diagnostic(code(porch::timeout))]
    Timeout { operation: String },

    // Internal
    #[error("Internal error: {message}")]
    #[diagnostic(code(porch::internal))]
    Internal { message: String },

    #[error("{context}: {source}")]
    #[diagnostic(code(porch::context))]
    Context {
        context: String,
        source: Box<PorchError>,
    },
}

impl PorchError {
    /// The kind of this error, looking through any context wrappers
    pub fn kind(&self) -> ErrorKind {
        match self {
            PorchError::RepositoryNotFound { .. }
            | PorchError::PackageRevisionNotFound { .. }
            | PorchError::ObjectNotFound { .. }
            | PorchError::FileNotFound { .. } => ErrorKind::NotFound,

            PorchError::AlreadyExists { .. }
            | PorchError::ResourceVersionMismatch { .. }
            | PorchError::TagExists { .. }
            | PorchError::PushRejected { .. }
            | PorchError::LifecycleConflict { .. } => ErrorKind::Conflict,

            PorchError::Invalid { .. }
            | PorchError::ReferenceParseFailed { .. }
            | PorchError::ParseFailed { .. }
            | PorchError::DuplicateResource { .. }
            | PorchError::PatchFailed { .. }
            | PorchError::FunctionFailed { .. }
            | PorchError::ConfigInvalid { .. }
            | PorchError::ConfigParseFailed { .. } => ErrorKind::Invalid,

            PorchError::GitOperationFailed { .. }
            | PorchError::GitFetchFailed { .. }
            | PorchError::GitRefResolveFailed { .. }
            | PorchError::GitOpenFailed { .. }
            | PorchError::Backend { .. }
            | PorchError::OciFailed { .. }
            | PorchError::IoError { .. }
            | PorchError::Cancelled
            | PorchError::Timeout { .. } => ErrorKind::Backend,

            PorchError::Internal { .. } => ErrorKind::Internal,

            PorchError::Context { source, .. } => source.kind(),
        }
    }

    /// Strip context wrappers and return the innermost error
    pub fn root(&self) -> &PorchError {
        match self {
            PorchError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Wrap this error with operation context
    pub fn with_context(self, context: impl Into<String>) -> Self {
        PorchError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Build an `Invalid` error from a single field error
    pub fn invalid_field(
        kind: impl Into<String>,
        name: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let mut errors = FieldErrors::new();
        errors.push(field, message);
        PorchError::Invalid {
            kind: kind.into(),
            name: name.into(),
            errors,
        }
    }

    /// Build an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        PorchError::Internal {
            message: message.into(),
        }
    }
}

/// Extension trait adding operation context to results
pub trait ResultExt<T> {
    /// Wrap the error (if any) with lazily computed context
    fn with_context<F, C>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T> ResultExt<T> for Result<T> {
    fn with_context<F, C>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|e| e.with_context(context()))
    }
}

impl From<std::io::Error> for PorchError {
    fn from(err: std::io::Error) -> Self {
        PorchError::IoError {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for PorchError {
    fn from(err: serde_yaml::Error) -> Self {
        PorchError::ParseFailed {
            path: "unknown".to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for PorchError {
    fn from(err: serde_json::Error) -> Self {
        PorchError::ParseFailed {
            path: "unknown".to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<git2::Error> for PorchError {
    fn from(err: git2::Error) -> Self {
        PorchError::GitOperationFailed {
            message: err.message().to_string(),
        }
    }
}

impl From<reqwest::Error> for PorchError {
    fn from(err: reqwest::Error) -> Self {
        PorchError::OciFailed {
            image: err
                .url()
                .map(ToString::to_string)
                .unwrap_or_else(|| "unknown".to_string()),
            reason: err.to_string(),
        }
    }
}

/// Result type alias using miette for error handling
pub type Result<T> = miette::Result<T, PorchError>;
