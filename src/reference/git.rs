//! Git package references
//!
//! String form: `<repo>.git[/<directory>][@<ref>]`, for example
//! `https://github.com/org/blueprints.git/networking/vpc@v3`.
//! The `.git` suffix marks where the repository URL ends and the package
//! directory begins; `@<ref>` is optional and defaults to `main`.

use serde::{Deserialize, Serialize};

use crate::error::{PorchError, Result};
use crate::git::url;

/// Default ref used when none is given
pub const DEFAULT_GIT_REF: &str = "main";

/// Location of a package inside a git repository
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitReference {
    /// Repository URL (HTTPS, SSH or file)
    pub repo: String,
    /// Package directory within the repository, without leading or trailing `/`
    #[serde(default)]
    pub directory: String,
    /// Branch, tag or commit
    #[serde(rename = "ref", default)]
    pub git_ref: String,
}

impl GitReference {
    pub fn new(
        repo: impl Into<String>,
        directory: impl Into<String>,
        git_ref: impl Into<String>,
    ) -> Self {
        Self {
            repo: repo.into(),
            directory: normalize_directory(&directory.into()),
            git_ref: git_ref.into(),
        }
    }

    /// Parse a git reference string; `Ok(None)` when the input is not git-shaped
    pub fn parse(input: &str) -> Result<Option<Self>> {
        let input = input.trim();
        if !looks_like_git(input) {
            return Ok(None);
        }

        let Some(boundary) = find_repo_boundary(input) else {
            return Err(PorchError::ReferenceParseFailed {
                input: input.to_string(),
                reason: "git references must contain '.git' to separate repository and directory"
                    .to_string(),
            });
        };

        let repo = &input[..boundary];
        let rest = &input[boundary..];

        let (directory, git_ref) = match rest.rfind('@') {
            Some(at) => (&rest[..at], &rest[at + 1..]),
            None => (rest, ""),
        };

        if rest.contains('@') && git_ref.is_empty() {
            return Err(PorchError::ReferenceParseFailed {
                input: input.to_string(),
                reason: "empty ref after '@'".to_string(),
            });
        }

        let reference = Self {
            repo: repo.to_string(),
            directory: normalize_directory(directory),
            git_ref: if git_ref.is_empty() {
                DEFAULT_GIT_REF.to_string()
            } else {
                git_ref.to_string()
            },
        };
        reference.validate()?;
        Ok(Some(reference))
    }

    pub fn validate(&self) -> Result<()> {
        if self.repo.trim().is_empty() {
            return Err(self.parse_error("repository URL is empty"));
        }
        if self.directory.split('/').any(|c| c == "..") {
            return Err(self.parse_error("directory must not escape the repository"));
        }
        if self.git_ref.contains(char::is_whitespace) {
            return Err(self.parse_error("ref must not contain whitespace"));
        }
        Ok(())
    }

    fn parse_error(&self, reason: &str) -> PorchError {
        PorchError::ReferenceParseFailed {
            input: self.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Repository URL with a `.git` suffix
    pub fn repo_with_suffix(&self) -> String {
        url::with_git_suffix(&self.repo)
    }

    /// Last path component of the directory, or the repository name
    pub fn default_directory_name(&self) -> String {
        if let Some(last) = self.directory.rsplit('/').find(|c| !c.is_empty()) {
            return last.to_string();
        }
        url::repo_name(&self.repo)
    }
}

impl std::fmt::Display for GitReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.repo_with_suffix())?;
        if !self.directory.is_empty() {
            write!(f, "/{}", self.directory)?;
        }
        if !self.git_ref.is_empty() {
            write!(f, "@{}", self.git_ref)?;
        }
        Ok(())
    }
}

fn looks_like_git(input: &str) -> bool {
    input.starts_with("https://")
        || input.starts_with("http://")
        || input.starts_with("ssh://")
        || input.starts_with("git@")
        || input.starts_with("file://")
}

/// Byte offset just past the repository part (after `.git`)
fn find_repo_boundary(input: &str) -> Option<usize> {
    let mut search_from = 0;
    while let Some(pos) = input[search_from..].find(".git") {
        let end = search_from + pos + ".git".len();
        match input[end..].chars().next() {
            None | Some('/') | Some('@') => return Some(end),
            Some(_) => search_from = end,
        }
    }
    None
}

/// Trim slashes and collapse `.` so directories compare reliably
pub fn normalize_directory(directory: &str) -> String {
    directory
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect::<Vec<_>>()
        .join("/")
}
