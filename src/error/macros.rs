//! Error context macros for consistent error messages
//!
//! This module provides macros to help construct error messages
//! with consistent formatting and context across the codebase.

/// Macro for creating backend errors carrying the backend URL and ref
///
/// # Example
/// ```rust,ignore
/// use porch::backend_error;
///
/// let result = remote.fetch(..).map_err(|e| backend_error!(url, "refs/tags/*", e))?;
/// ```
#[macro_export]
macro_rules! backend_error {
    ($url:expr, $reference:expr, $err:expr) => {
        $crate::error::PorchError::Backend {
            url: $url.to_string(),
            reference: $reference.to_string(),
            reason: $err.to_string(),
        }
    };
}

/// Macro for adding context to file operations
///
/// # Example
/// ```rust,ignore
/// use porch::file_error_context;
///
/// let result = std::fs::read_to_string(path)
///     .map_err(|e| file_error_context!("Failed to read file", path.display(), e))?;
/// ```
#[macro_export]
macro_rules! file_error_context {
    ($operation:expr, $path:expr, $err:expr) => {
        $crate::error::PorchError::IoError {
            message: format!("{} {}: {}", $operation, $path, $err),
        }
    };
}

#[cfg(test)]
mod tests {
    use crate::error::{ErrorKind, PorchError};

    #[test]
    fn test_backend_error_macro() {
        let error = backend_error!("http://example.com/r1.git", "refs/tags/a/v1", "boom");
        assert!(matches!(error, PorchError::Backend { .. }));
        assert_eq!(error.kind(), ErrorKind::Backend);
        assert!(error.to_string().contains("refs/tags/a/v1"));
    }

    #[test]
    fn test_file_error_context_macro() {
        let error = file_error_context!("Failed to read", "/tmp/x", "denied");
        assert_eq!(error.to_string(), "IO error: Failed to read /tmp/x: denied");
    }
}
