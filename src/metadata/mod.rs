//! Side-band metadata of package revisions
//!
//! Backends cannot carry labels, annotations, finalizers or owner
//! references, so they live in one record per revision keyed by
//! `(namespace, object name)`. On create the store adds a repository label
//! and a self owner reference (used to cascade deletes); both are stripped
//! again on read.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{PorchError, Result};
use crate::model::{ObjectMeta, OwnerReference};

pub const REPOSITORY_LABEL: &str = "internal.porch.kpt.dev/repository";
pub const RECORD_KIND: &str = "PackageRev";
const OWNER_API_VERSION: &str = "porch.kpt.dev/v1alpha1";
const OWNER_KIND: &str = "PackageRevision";

/// Persistence of raw records
pub trait MetadataBackend: Send + Sync {
    fn load(&self, namespace: &str, name: &str) -> Result<Option<ObjectMeta>>;
    fn save(&self, meta: &ObjectMeta) -> Result<()>;
    fn remove(&self, namespace: &str, name: &str) -> Result<()>;
    fn list(&self, namespace: &str) -> Result<Vec<ObjectMeta>>;
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: DashMap<(String, String), ObjectMeta>,
}

impl MetadataBackend for MemoryBackend {
    fn load(&self, namespace: &str, name: &str) -> Result<Option<ObjectMeta>> {
        Ok(self
            .records
            .get(&(namespace.to_string(), name.to_string()))
            .map(|r| r.value().clone()))
    }

    fn save(&self, meta: &ObjectMeta) -> Result<()> {
        self.records
            .insert((meta.namespace.clone(), meta.name.clone()), meta.clone());
        Ok(())
    }

    fn remove(&self, namespace: &str, name: &str) -> Result<()> {
        self.records.remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    fn list(&self, namespace: &str) -> Result<Vec<ObjectMeta>> {
        let mut records: Vec<ObjectMeta> = self
            .records
            .iter()
            .filter(|r| r.key().0 == namespace)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }
}

/// One YAML file per record under `<root>/<namespace>/<name>.yaml`
#[derive(Debug)]
pub struct FsBackend {
    root: PathBuf,
    lock: Mutex<()>,
}

impl FsBackend {
    pub fn new(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)
            .map_err(|e| crate::file_error_context!("Failed to create metadata directory", root.display(), e))?;
        Ok(Self {
            root: root.to_path_buf(),
            lock: Mutex::new(()),
        })
    }

    fn path(&self, namespace: &str, name: &str) -> PathBuf {
        self.root.join(namespace).join(format!("{name}.yaml"))
    }
}

impl MetadataBackend for FsBackend {
    fn load(&self, namespace: &str, name: &str) -> Result<Option<ObjectMeta>> {
        let _guard = self.lock.lock();
        let path = self.path(namespace, name);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        serde_yaml::from_str(&content).map(Some).map_err(|e| PorchError::ParseFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    fn save(&self, meta: &ObjectMeta) -> Result<()> {
        let _guard = self.lock.lock();
        let path = self.path(&meta.namespace, &meta.name);
        let dir = self.root.join(&meta.namespace);
        std::fs::create_dir_all(&dir)?;
        // Readers never see a partial record.
        let mut file = tempfile::NamedTempFile::new_in(&dir)?;
        file.write_all(serde_yaml::to_string(meta)?.as_bytes())?;
        file.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    fn remove(&self, namespace: &str, name: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let path = self.path(namespace, name);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn list(&self, namespace: &str) -> Result<Vec<ObjectMeta>> {
        let _guard = self.lock.lock();
        let dir = self.root.join(namespace);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "yaml") {
                let content = std::fs::read_to_string(&path)?;
                records.push(serde_yaml::from_str::<ObjectMeta>(&content)?);
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }
}

pub struct MetadataStore {
    backend: Box<dyn MetadataBackend>,
}

impl MetadataStore {
    pub fn in_memory() -> Self {
        Self {
            backend: Box::new(MemoryBackend::default()),
        }
    }

    pub fn on_disk(root: &Path) -> Result<Self> {
        Ok(Self {
            backend: Box::new(FsBackend::new(root)?),
        })
    }

    pub fn get(&self, namespace: &str, name: &str) -> Result<ObjectMeta> {
        self.backend
            .load(namespace, name)?
            .map(strip)
            .ok_or_else(|| PorchError::ObjectNotFound {
                kind: RECORD_KIND.to_string(),
                name: format!("{namespace}/{name}"),
            })
    }

    /// Records of one repository
    pub fn list(&self, namespace: &str, repository: &str) -> Result<Vec<ObjectMeta>> {
        Ok(self
            .backend
            .list(namespace)?
            .into_iter()
            .filter(|m| m.labels.get(REPOSITORY_LABEL).is_some_and(|r| r == repository))
            .map(strip)
            .collect())
    }

    /// Create the record of a revision of `repository`
    ///
    /// An existing record is updated instead, so a create repeated after a
    /// crash succeeds.
    pub fn create(&self, meta: &ObjectMeta, repository: &str) -> Result<ObjectMeta> {
        if self.backend.load(&meta.namespace, &meta.name)?.is_some() {
            tracing::debug!(namespace = %meta.namespace, name = %meta.name, "metadata record exists, updating");
            return self.update(meta);
        }
        let mut record = meta.clone();
        if record.uid.is_empty() {
            record.uid = uuid::Uuid::new_v4().to_string();
        }
        record.generation = 1;
        record.resource_version = "1".to_string();
        record.creation_timestamp.get_or_insert_with(Utc::now);
        record
            .labels
            .insert(REPOSITORY_LABEL.to_string(), repository.to_string());
        record.owner_references.push(self_owner(&record));
        self.backend.save(&record)?;
        Ok(strip(record))
    }

    /// Replace labels, annotations, finalizers and owner references
    pub fn update(&self, meta: &ObjectMeta) -> Result<ObjectMeta> {
        let existing = self
            .backend
            .load(&meta.namespace, &meta.name)?
            .ok_or_else(|| PorchError::ObjectNotFound {
                kind: RECORD_KIND.to_string(),
                name: format!("{}/{}", meta.namespace, meta.name),
            })?;
        let mut record = meta.clone();
        record.uid = existing.uid.clone();
        record.creation_timestamp = existing.creation_timestamp;
        record.deletion_timestamp = existing.deletion_timestamp;
        record.generation = existing.generation + 1;
        record.resource_version = record.generation.to_string();
        if let Some(repository) = existing.labels.get(REPOSITORY_LABEL) {
            record
                .labels
                .insert(REPOSITORY_LABEL.to_string(), repository.clone());
        }
        let own = self_owner(&existing);
        if !record.owner_references.contains(&own) {
            record.owner_references.push(own);
        }
        self.backend.save(&record)?;
        Ok(strip(record))
    }

    /// Delete a record
    ///
    /// A record with finalizers is only marked for deletion unless
    /// `clear_finalizers` is set. Returns whether the record is gone.
    pub fn delete(&self, namespace: &str, name: &str, clear_finalizers: bool) -> Result<bool> {
        let Some(mut record) = self.backend.load(namespace, name)? else {
            return Ok(true);
        };
        if !record.finalizers.is_empty() && !clear_finalizers {
            record.deletion_timestamp.get_or_insert_with(Utc::now);
            self.backend.save(&record)?;
            return Ok(false);
        }
        self.backend.remove(namespace, name)?;
        Ok(true)
    }
}

fn self_owner(record: &ObjectMeta) -> OwnerReference {
    OwnerReference {
        api_version: OWNER_API_VERSION.to_string(),
        kind: OWNER_KIND.to_string(),
        name: record.name.clone(),
        uid: record.uid.clone(),
        controller: None,
    }
}

fn strip(mut meta: ObjectMeta) -> ObjectMeta {
    meta.labels.remove(REPOSITORY_LABEL);
    let own = self_owner(&meta);
    meta.owner_references.retain(|o| *o != own);
    meta
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn meta(name: &str) -> ObjectMeta {
        let mut meta = ObjectMeta::named("default", name);
        meta.labels.insert("team".to_string(), "a".to_string());
        meta
    }

    fn stores() -> (TempDir, Vec<MetadataStore>) {
        let temp = TempDir::new().unwrap();
        let disk = MetadataStore::on_disk(temp.path()).unwrap();
        (temp, vec![MetadataStore::in_memory(), disk])
    }

    #[test]
    fn test_internal_fields_are_stripped() {
        let (_temp, stores) = stores();
        for store in stores {
            let created = store.create(&meta("r1.pkg.ws1"), "r1").unwrap();
            assert!(!created.labels.contains_key(REPOSITORY_LABEL));
            assert!(created.owner_references.is_empty());
            assert!(!created.uid.is_empty());
            let read = store.get("default", "r1.pkg.ws1").unwrap();
            assert_eq!(read.labels.get("team").map(String::as_str), Some("a"));
            assert!(read.owner_references.is_empty());
        }
    }

    #[test]
    fn test_create_collision_updates() {
        let (_temp, stores) = stores();
        for store in stores {
            let first = store.create(&meta("r1.pkg.ws1"), "r1").unwrap();
            let mut again = meta("r1.pkg.ws1");
            again.annotations.insert("note".to_string(), "x".to_string());
            let second = store.create(&again, "r1").unwrap();
            assert_eq!(second.uid, first.uid);
            assert_eq!(second.generation, 2);
            assert!(second.annotations.contains_key("note"));
            assert_eq!(store.list("default", "r1").unwrap().len(), 1);
        }
    }

    #[test]
    fn test_list_by_repository() {
        let (_temp, stores) = stores();
        for store in stores {
            store.create(&meta("r1.a.ws"), "r1").unwrap();
            store.create(&meta("r2.a.ws"), "r2").unwrap();
            let names: Vec<String> = store.list("default", "r1").unwrap().into_iter().map(|m| m.name).collect();
            assert_eq!(names, vec!["r1.a.ws"]);
        }
    }

    #[test]
    fn test_finalizers_block_delete() {
        let (_temp, stores) = stores();
        for store in stores {
            let mut m = meta("r1.a.ws");
            m.finalizers.push("example.com/hold".to_string());
            store.create(&m, "r1").unwrap();
            assert!(!store.delete("default", "r1.a.ws", false).unwrap());
            assert!(store.get("default", "r1.a.ws").unwrap().deletion_timestamp.is_some());
            assert!(store.delete("default", "r1.a.ws", true).unwrap());
            assert_eq!(
                store.get("default", "r1.a.ws").unwrap_err().kind(),
                crate::error::ErrorKind::NotFound
            );
        }
    }
}
