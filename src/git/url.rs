//! URL normalization for git operations
//!
//! This module handles:
//! - Normalizing SSH URLs from SCP-style to ssh:// format
//! - Normalizing file:// URLs for libgit2 compatibility
//! - Comparing repository URLs modulo the `.git` suffix and trailing `/`
//! - Deriving cache directory slugs from URLs

use std::borrow::Cow;

/// Normalize SSH URLs from SCP-style (git@host:path) to ssh:// format.
///
/// libgit2 may have issues with SCP-style SSH URLs, so we convert them to
/// the explicit ssh:// format for better compatibility.
pub fn normalize_ssh_url_for_clone(url: &str) -> Cow<'_, str> {
    if !url.starts_with("git@") || url.starts_with("ssh://") {
        return Cow::Borrowed(url);
    }

    if let Some(colon_pos) = url.find(':') {
        let host_part = &url[..colon_pos];
        let path_part = &url[colon_pos + 1..];

        // The colon becomes a slash in the path part
        let normalized_path = if path_part.starts_with('/') {
            path_part.to_string()
        } else {
            format!("/{path_part}")
        };
        return Cow::Owned(format!("ssh://{host_part}{normalized_path}"));
    }

    Cow::Borrowed(url)
}

/// Normalize file:// URLs so libgit2 can resolve them on Unix.
pub fn normalize_file_url_for_clone(url: &str) -> Cow<'_, str> {
    if !url.starts_with("file://") {
        return Cow::Borrowed(url);
    }
    let after = &url[7..];
    if after.contains('\\') {
        let path = after.replace('\\', "/");
        return Cow::Owned(format!("file:///{path}"));
    }
    if !after.is_empty() && !after.starts_with('/') {
        return Cow::Owned(format!("file:///{after}"));
    }
    Cow::Borrowed(url)
}

/// URL in the form libgit2 expects
pub fn for_transport(url: &str) -> String {
    let url = normalize_ssh_url_for_clone(url);
    normalize_file_url_for_clone(&url).into_owned()
}

/// Strip a trailing `/` and `.git` suffix
pub fn strip_git_suffix(url: &str) -> &str {
    let url = url.trim_end_matches('/');
    url.strip_suffix(".git").unwrap_or(url)
}

/// Ensure the URL ends with `.git`
pub fn with_git_suffix(url: &str) -> String {
    format!("{}.git", strip_git_suffix(url))
}

/// Whether two URLs name the same repository, ignoring the `.git` suffix
pub fn same_repo(a: &str, b: &str) -> bool {
    strip_git_suffix(a) == strip_git_suffix(b)
}

/// Last path segment of a repository URL without the `.git` suffix
pub fn repo_name(url: &str) -> String {
    let stripped = strip_git_suffix(url);
    stripped
        .rsplit(['/', ':'])
        .find(|s| !s.is_empty())
        .unwrap_or(stripped)
        .to_string()
}

/// Generate a directory slug from a git URL
///
/// Example: "https://github.com/author/repo.git" -> "github.com-author-repo"
pub fn url_to_slug(url: &str) -> String {
    strip_git_suffix(url)
        .replace("https://", "")
        .replace("http://", "")
        .replace("file://", "")
        .replace("ssh://", "")
        .replace("git@", "")
        .replace([':', '/', '@'], "-")
        .trim_matches('-')
        .to_string()
}
