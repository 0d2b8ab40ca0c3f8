//! OCI distribution clients
//!
//! [`HttpRegistry`] speaks the distribution HTTP API with a blocking reqwest
//! client. [`MemoryRegistry`] keeps everything in process and backs tests and
//! embedded setups.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, LOCATION};
use serde::{Deserialize, Serialize};

use super::layers::digest_of;
use crate::error::{PorchError, Result};
use crate::git::Credentials;

pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const DIGEST_HEADER: &str = "Docker-Content-Digest";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    pub fn new(media_type: &str, data: &[u8]) -> Self {
        Self {
            media_type: media_type.to_string(),
            digest: digest_of(data),
            size: data.len() as u64,
            annotations: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: String,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Manifest {
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: MANIFEST_MEDIA_TYPE.to_string(),
            config,
            layers,
            annotations: BTreeMap::new(),
        }
    }
}

/// Minimal view of an OCI registry
///
/// Repository names exclude the registry host.
pub trait Registry: Send + Sync {
    /// Repositories whose name starts with `prefix`
    fn list_repositories(&self, prefix: &str) -> Result<Vec<String>>;

    /// Tags of a repository, empty when the repository does not exist
    fn list_tags(&self, repository: &str) -> Result<Vec<String>>;

    /// Manifest and its digest, `None` when the tag or digest is unknown
    fn get_manifest(&self, repository: &str, reference: &str) -> Result<Option<(Manifest, String)>>;

    fn get_blob(&self, repository: &str, digest: &str) -> Result<Vec<u8>>;

    /// Upload a blob and return its digest
    fn put_blob(&self, repository: &str, data: &[u8]) -> Result<String>;

    /// Tag a manifest and return its digest
    fn put_manifest(&self, repository: &str, tag: &str, manifest: &Manifest) -> Result<String>;

    fn delete_tag(&self, repository: &str, tag: &str) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
    blobs: HashMap<String, Vec<u8>>,
    manifests: HashMap<String, Vec<u8>>,
    /// `(repository, tag)` to manifest digest
    tags: BTreeMap<(String, String), String>,
}

/// In-process registry
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    state: Mutex<MemoryState>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Registry for MemoryRegistry {
    fn list_repositories(&self, prefix: &str) -> Result<Vec<String>> {
        let state = self.state.lock();
        let mut repos: Vec<String> = state
            .tags
            .keys()
            .map(|(repo, _)| repo.clone())
            .filter(|repo| repo.starts_with(prefix))
            .collect();
        repos.dedup();
        Ok(repos)
    }

    fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        let state = self.state.lock();
        Ok(state
            .tags
            .keys()
            .filter(|(repo, _)| repo == repository)
            .map(|(_, tag)| tag.clone())
            .collect())
    }

    fn get_manifest(&self, repository: &str, reference: &str) -> Result<Option<(Manifest, String)>> {
        let state = self.state.lock();
        let digest = if reference.starts_with("sha256:") {
            reference.to_string()
        } else {
            match state.tags.get(&(repository.to_string(), reference.to_string())) {
                Some(digest) => digest.clone(),
                None => return Ok(None),
            }
        };
        match state.manifests.get(&digest) {
            Some(bytes) => Ok(Some((serde_json::from_slice(bytes)?, digest))),
            None => Ok(None),
        }
    }

    fn get_blob(&self, repository: &str, digest: &str) -> Result<Vec<u8>> {
        self.state
            .lock()
            .blobs
            .get(digest)
            .cloned()
            .ok_or_else(|| PorchError::OciFailed {
                image: format!("{repository}@{digest}"),
                reason: "blob not found".to_string(),
            })
    }

    fn put_blob(&self, _repository: &str, data: &[u8]) -> Result<String> {
        let digest = digest_of(data);
        self.state.lock().blobs.insert(digest.clone(), data.to_vec());
        Ok(digest)
    }

    fn put_manifest(&self, repository: &str, tag: &str, manifest: &Manifest) -> Result<String> {
        let bytes = serde_json::to_vec(manifest)?;
        let digest = digest_of(&bytes);
        let mut state = self.state.lock();
        state.manifests.insert(digest.clone(), bytes);
        state
            .tags
            .insert((repository.to_string(), tag.to_string()), digest.clone());
        Ok(digest)
    }

    fn delete_tag(&self, repository: &str, tag: &str) -> Result<()> {
        self.state
            .lock()
            .tags
            .remove(&(repository.to_string(), tag.to_string()));
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct Catalog {
    #[serde(default)]
    repositories: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// Client for the OCI distribution HTTP API
pub struct HttpRegistry {
    base_url: String,
    credentials: Option<Credentials>,
    client: Client,
}

impl HttpRegistry {
    pub fn new(host: &str, credentials: Option<Credentials>) -> Self {
        let scheme = if host.starts_with("localhost") || host.starts_with("127.0.0.1") {
            "http"
        } else {
            "https"
        };
        Self::with_base_url(&format!("{scheme}://{host}"), credentials)
    }

    pub fn with_base_url(base_url: &str, credentials: Option<Credentials>) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v2/{path}", self.base_url)
    }

    fn request(&self, builder: reqwest::blocking::RequestBuilder) -> Result<Response> {
        let builder = match &self.credentials {
            Some(creds) => builder.header(AUTHORIZATION, creds.basic_auth_header()),
            None => builder,
        };
        Ok(builder.send()?)
    }

    fn fail(&self, what: &str, response: Response) -> PorchError {
        let status = response.status();
        let body = response.text().unwrap_or_default();
        PorchError::OciFailed {
            image: format!("{}/{what}", self.base_url),
            reason: format!("{status}: {}", body.trim()),
        }
    }

    /// Resolve an upload `Location` header against the registry URL
    fn absolute(&self, location: &str) -> String {
        if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else {
            format!("{}{location}", self.base_url)
        }
    }
}

impl Registry for HttpRegistry {
    fn list_repositories(&self, prefix: &str) -> Result<Vec<String>> {
        let response = self.request(self.client.get(self.url("_catalog")))?;
        if !response.status().is_success() {
            return Err(self.fail("_catalog", response));
        }
        let catalog: Catalog = response.json()?;
        Ok(catalog
            .repositories
            .into_iter()
            .filter(|r| r.starts_with(prefix))
            .collect())
    }

    fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        let response = self.request(self.client.get(self.url(&format!("{repository}/tags/list"))))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(self.fail(repository, response));
        }
        let list: TagList = response.json()?;
        Ok(list.tags.unwrap_or_default())
    }

    fn get_manifest(&self, repository: &str, reference: &str) -> Result<Option<(Manifest, String)>> {
        let request = self
            .client
            .get(self.url(&format!("{repository}/manifests/{reference}")))
            .header(ACCEPT, MANIFEST_MEDIA_TYPE);
        let response = self.request(request)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(self.fail(repository, response));
        }
        let header_digest = response
            .headers()
            .get(DIGEST_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let bytes = response.bytes()?;
        let digest = header_digest.unwrap_or_else(|| digest_of(&bytes));
        Ok(Some((serde_json::from_slice(&bytes)?, digest)))
    }

    fn get_blob(&self, repository: &str, digest: &str) -> Result<Vec<u8>> {
        let response = self.request(self.client.get(self.url(&format!("{repository}/blobs/{digest}"))))?;
        if !response.status().is_success() {
            return Err(self.fail(repository, response));
        }
        let bytes = response.bytes()?.to_vec();
        if digest_of(&bytes) != digest {
            return Err(PorchError::OciFailed {
                image: format!("{repository}@{digest}"),
                reason: "blob content does not match its digest".to_string(),
            });
        }
        Ok(bytes)
    }

    fn put_blob(&self, repository: &str, data: &[u8]) -> Result<String> {
        let digest = digest_of(data);
        let head = self.request(self.client.head(self.url(&format!("{repository}/blobs/{digest}"))))?;
        if head.status().is_success() {
            return Ok(digest);
        }
        let start = self.request(self.client.post(self.url(&format!("{repository}/blobs/uploads/"))))?;
        if !start.status().is_success() {
            return Err(self.fail(repository, start));
        }
        let location = start
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|l| self.absolute(l))
            .ok_or_else(|| PorchError::OciFailed {
                image: repository.to_string(),
                reason: "upload session without Location header".to_string(),
            })?;
        let separator = if location.contains('?') { '&' } else { '?' };
        let upload = self
            .client
            .put(format!("{location}{separator}digest={digest}"))
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(data.to_vec());
        let response = self.request(upload)?;
        if !response.status().is_success() {
            return Err(self.fail(repository, response));
        }
        Ok(digest)
    }

    fn put_manifest(&self, repository: &str, tag: &str, manifest: &Manifest) -> Result<String> {
        let bytes = serde_json::to_vec(manifest)?;
        let digest = digest_of(&bytes);
        let request = self
            .client
            .put(self.url(&format!("{repository}/manifests/{tag}")))
            .header(CONTENT_TYPE, MANIFEST_MEDIA_TYPE)
            .body(bytes);
        let response = self.request(request)?;
        if !response.status().is_success() {
            return Err(self.fail(repository, response));
        }
        Ok(digest)
    }

    fn delete_tag(&self, repository: &str, tag: &str) -> Result<()> {
        // The distribution API deletes manifests by digest only.
        let Some((_, digest)) = self.get_manifest(repository, tag)? else {
            return Ok(());
        };
        let response = self.request(
            self.client
                .delete(self.url(&format!("{repository}/manifests/{digest}"))),
        )?;
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(self.fail(repository, response))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_registry_tags_and_manifests() {
        let registry = MemoryRegistry::new();
        let blob = registry.put_blob("pkgs/web", b"layer").unwrap();
        assert_eq!(registry.get_blob("pkgs/web", &blob).unwrap(), b"layer");
        let manifest = Manifest::new(
            Descriptor::new("application/json", b"{}"),
            vec![Descriptor::new("application/octet-stream", b"layer")],
        );
        let digest = registry.put_manifest("pkgs/web", "v1", &manifest).unwrap();
        let (fetched, fetched_digest) = registry.get_manifest("pkgs/web", "v1").unwrap().unwrap();
        assert_eq!(fetched, manifest);
        assert_eq!(fetched_digest, digest);
        assert!(registry.get_manifest("pkgs/web", &digest).unwrap().is_some());

        assert_eq!(registry.list_repositories("pkgs/").unwrap(), vec!["pkgs/web"]);
        registry.delete_tag("pkgs/web", "v1").unwrap();
        assert!(registry.get_manifest("pkgs/web", "v1").unwrap().is_none());
        assert!(registry.list_tags("pkgs/web").unwrap().is_empty());
    }

    #[test]
    fn test_http_scheme_for_local_registries() {
        assert_eq!(HttpRegistry::new("localhost:5000", None).url("_catalog"), "http://localhost:5000/v2/_catalog");
        assert_eq!(HttpRegistry::new("ghcr.io", None).url("_catalog"), "https://ghcr.io/v2/_catalog");
    }
}
