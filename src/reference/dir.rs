//! Local directory references

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PorchError, Result};

/// A package on the local filesystem
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirReference {
    pub directory: PathBuf,
}

impl DirReference {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: normalize_path(&directory.into()),
        }
    }

    /// Parse a local path; `None` when the input does not look like one
    ///
    /// Recognized: `./x`, `../x`, `.`, `..`, absolute paths, `file://` URLs
    /// without a `.git` repository part, and existing directories.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.is_empty() || input == "-" {
            return None;
        }
        if let Some(after) = input.strip_prefix("file://") {
            if after.contains(".git") {
                return None;
            }
            return Some(Self::new(after));
        }
        if input.contains("://") || input.starts_with("git@") {
            return None;
        }
        let path = Path::new(input);
        let is_local_path = input.starts_with("./")
            || input.starts_with("../")
            || input == "."
            || input == ".."
            || path.is_absolute()
            || (path.is_dir() && !input.contains(':'));
        is_local_path.then(|| Self::new(input))
    }

    pub fn validate(&self) -> Result<()> {
        if self.directory.as_os_str().is_empty() {
            return Err(PorchError::ReferenceParseFailed {
                input: String::new(),
                reason: "directory is empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn default_directory_name(&self) -> String {
        self.directory
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| ".".to_string())
    }
}

impl std::fmt::Display for DirReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.directory.display())
    }
}

/// Lexically normalize a path: drop `.` components, trailing separators and
/// resolve `..` against preceding normal components
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    if out.is_empty() {
        return PathBuf::from(".");
    }
    out.iter().collect()
}

/// Relative path from directory `from` to directory `to`
pub fn relative_path(from: &str, to: &str) -> String {
    let from: Vec<&str> = from.split('/').filter(|c| !c.is_empty() && *c != ".").collect();
    let to: Vec<&str> = to.split('/').filter(|c| !c.is_empty() && *c != ".").collect();
    let common = from.iter().zip(&to).take_while(|(a, b)| a == b).count();
    let mut parts: Vec<&str> = std::iter::repeat_n("..", from.len() - common).collect();
    parts.extend(&to[common..]);
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_relative_paths() {
        assert_eq!(
            DirReference::parse("./pkgs/a").unwrap().directory,
            PathBuf::from("pkgs/a")
        );
        assert!(DirReference::parse("../shared").is_some());
        assert!(DirReference::parse(".").is_some());
    }

    #[test]
    fn test_parse_absolute_and_file_url() {
        assert_eq!(
            DirReference::parse("/srv/pkgs/").unwrap().directory,
            PathBuf::from("/srv/pkgs")
        );
        assert_eq!(
            DirReference::parse("file:///srv/pkgs").unwrap().directory,
            PathBuf::from("/srv/pkgs")
        );
    }

    #[test]
    fn test_parse_rejects_remote() {
        assert!(DirReference::parse("https://github.com/org/repo.git").is_none());
        assert!(DirReference::parse("file:///srv/repo.git/pkg").is_none());
        assert!(DirReference::parse("-").is_none());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(Path::new("a/./b/../c/")), PathBuf::from("a/c"));
        assert_eq!(normalize_path(Path::new("./")), PathBuf::from("."));
        assert_eq!(normalize_path(Path::new("../x")), PathBuf::from("../x"));
    }

    #[test]
    fn test_relative_path() {
        assert_eq!(relative_path("a/b", "a/c/d"), "../c/d");
        assert_eq!(relative_path("a", "a"), ".");
        assert_eq!(relative_path("", "pkg"), "pkg");
    }
}
