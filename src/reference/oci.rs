//! OCI image package references
//!
//! String form: `oci://<registry>/<name>[:<tag>|@<digest>][//<directory>]`.
//! A missing tag normalizes to `:latest`.

use serde::{Deserialize, Serialize};

use crate::error::{PorchError, Result};

use super::git::normalize_directory;

pub const OCI_PREFIX: &str = "oci://";
pub const DEFAULT_OCI_TAG: &str = "latest";

/// Location of a package inside an OCI image
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciReference {
    /// Image name including tag or digest
    pub image: String,
    /// Directory within the image filesystem
    #[serde(default)]
    pub directory: String,
}

impl OciReference {
    pub fn new(image: impl Into<String>, directory: impl Into<String>) -> Self {
        Self {
            image: normalize_image(&image.into()),
            directory: normalize_directory(&directory.into()),
        }
    }

    /// Parse an `oci://` string; `Ok(None)` when the prefix is absent
    pub fn parse(input: &str) -> Result<Option<Self>> {
        let Some(rest) = input.trim().strip_prefix(OCI_PREFIX) else {
            return Ok(None);
        };
        let (image, directory) = match rest.find("//") {
            Some(pos) => (&rest[..pos], &rest[pos + 2..]),
            None => (rest, ""),
        };
        let reference = Self::new(image, directory);
        reference.validate()?;
        Ok(Some(reference))
    }

    pub fn validate(&self) -> Result<()> {
        let name = self.name();
        if name.is_empty() {
            return Err(self.parse_error("image name is empty"));
        }
        let valid = name.chars().all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-' | '/' | ':')
        });
        if !valid {
            return Err(self.parse_error("image name must be lowercase alphanumerics, '.', '_', '-' or '/'"));
        }
        if let Some(digest) = self.digest() {
            if !is_valid_digest(digest) {
                return Err(self.parse_error("digest must be sha256:<64 hex>"));
            }
        }
        if self.directory.split('/').any(|c| c == "..") {
            return Err(self.parse_error("directory must not escape the image"));
        }
        Ok(())
    }

    fn parse_error(&self, reason: &str) -> PorchError {
        PorchError::ReferenceParseFailed {
            input: self.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Image name without tag or digest (registry host included)
    pub fn name(&self) -> &str {
        if let Some(at) = self.image.find('@') {
            return &self.image[..at];
        }
        match tag_separator(&self.image) {
            Some(pos) => &self.image[..pos],
            None => &self.image,
        }
    }

    /// Tag, if the image is addressed by tag
    pub fn tag(&self) -> Option<&str> {
        if self.image.contains('@') {
            return None;
        }
        tag_separator(&self.image).map(|pos| &self.image[pos + 1..])
    }

    /// Digest, if the image is addressed by digest
    pub fn digest(&self) -> Option<&str> {
        self.image.find('@').map(|at| &self.image[at + 1..])
    }

    /// Registry host and repository path
    pub fn registry_and_repository(&self) -> (String, String) {
        let name = self.name();
        match name.split_once('/') {
            Some((host, repo)) if host.contains('.') || host.contains(':') || host == "localhost" => {
                (host.to_string(), repo.to_string())
            }
            _ => ("docker.io".to_string(), name.to_string()),
        }
    }

    /// Replace the tag (dropping any digest)
    pub fn with_tag(&self, tag: &str) -> Self {
        Self {
            image: format!("{}:{tag}", self.name()),
            directory: self.directory.clone(),
        }
    }

    /// Address the same image by digest
    pub fn with_digest(&self, digest: &str) -> Self {
        Self {
            image: format!("{}@{digest}", self.name()),
            directory: self.directory.clone(),
        }
    }

    pub fn default_directory_name(&self) -> String {
        if let Some(last) = self.directory.rsplit('/').find(|c| !c.is_empty()) {
            return last.to_string();
        }
        self.name()
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string()
    }
}

impl std::fmt::Display for OciReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{OCI_PREFIX}{}", self.image)?;
        if !self.directory.is_empty() {
            write!(f, "//{}", self.directory)?;
        }
        Ok(())
    }
}

/// Position of the `:` separating a tag, ignoring a registry port
fn tag_separator(image: &str) -> Option<usize> {
    let last_slash = image.rfind('/').map_or(0, |p| p + 1);
    image[last_slash..].rfind(':').map(|p| last_slash + p)
}

fn normalize_image(image: &str) -> String {
    let image = image.trim().trim_end_matches('/');
    if image.contains('@') || tag_separator(image).is_some() {
        image.to_string()
    } else if image.is_empty() {
        String::new()
    } else {
        format!("{image}:{DEFAULT_OCI_TAG}")
    }
}

/// Whether `digest` is a well-formed `sha256:<64 hex>` digest
pub fn is_valid_digest(digest: &str) -> bool {
    digest
        .strip_prefix("sha256:")
        .is_some_and(|hex| hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()))
}
