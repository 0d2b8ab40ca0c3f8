//! In-memory object store for controller-owned kinds
//!
//! Holds PackageVariant and PackageVariantSet objects plus arbitrary
//! objects matched by `objects` target selectors. Writes broadcast a
//! [`StoreEvent`] so controllers can enqueue the changed key. Status writes
//! are silent so a controller recording its own status does not retrigger
//! itself.

use std::collections::BTreeMap;
use std::fmt;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;

use super::packagevariant::PackageVariant;
use super::variantset::PackageVariantSet;
use crate::error::{PorchError, Result};
use crate::model::ObjectMeta;

const EVENT_CAPACITY: usize = 256;

/// Namespaced object name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn of(meta: &ObjectMeta) -> Self {
        Self::new(meta.namespace.clone(), meta.name.clone())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Access to the standard metadata of a stored object
pub trait Object: Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
}

/// A change to a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub kind: &'static str,
    pub key: ObjectKey,
}

/// Objects of one kind
pub struct Store<T: Object> {
    objects: DashMap<ObjectKey, T>,
    events: broadcast::Sender<StoreEvent>,
}

impl<T: Object> Store<T> {
    fn new(events: broadcast::Sender<StoreEvent>) -> Self {
        Self {
            objects: DashMap::new(),
            events,
        }
    }

    pub fn get(&self, key: &ObjectKey) -> Option<T> {
        self.objects.get(key).map(|o| o.value().clone())
    }

    /// Objects of a namespace, sorted by name
    pub fn list(&self, namespace: &str) -> Vec<T> {
        let mut items: Vec<T> = self
            .objects
            .iter()
            .filter(|o| o.key().namespace == namespace)
            .map(|o| o.value().clone())
            .collect();
        items.sort_by(|a, b| a.meta().name.cmp(&b.meta().name));
        items
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self.objects.iter().map(|o| o.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn create(&self, object: T) -> Result<T> {
        let key = ObjectKey::of(object.meta());
        if key.name.is_empty() {
            return Err(PorchError::invalid_field(T::KIND, "", "metadata.name", "name is required"));
        }
        let mut object = object;
        {
            let meta = object.meta_mut();
            meta.uid = uuid::Uuid::new_v4().to_string();
            meta.generation = 1;
            meta.resource_version = "1".to_string();
            meta.creation_timestamp = Some(Utc::now());
            meta.deletion_timestamp = None;
        }
        match self.objects.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(PorchError::AlreadyExists {
                    kind: T::KIND.to_string(),
                    name: key.to_string(),
                });
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(object.clone());
            }
        }
        self.notify(key);
        Ok(object)
    }

    /// Replace an object; a non-empty `resourceVersion` must match
    ///
    /// Clearing the last finalizer of an object marked for deletion
    /// removes it.
    pub fn update(&self, object: T) -> Result<T> {
        let key = ObjectKey::of(object.meta());
        let mut entry = self.objects.get_mut(&key).ok_or_else(|| self.not_found(&key))?;
        let current = entry.meta().clone();
        let submitted = &object.meta().resource_version;
        if !submitted.is_empty() && *submitted != current.resource_version {
            return Err(PorchError::ResourceVersionMismatch {
                name: key.to_string(),
                expected: submitted.clone(),
                actual: current.resource_version,
            });
        }
        let mut object = object;
        {
            let meta = object.meta_mut();
            meta.uid = current.uid;
            meta.creation_timestamp = current.creation_timestamp;
            meta.deletion_timestamp = current.deletion_timestamp;
            meta.generation = current.generation + 1;
            meta.resource_version = next_version(&current.resource_version);
        }
        let gone = object.meta().deletion_timestamp.is_some() && object.meta().finalizers.is_empty();
        if gone {
            drop(entry);
            self.objects.remove(&key);
        } else {
            *entry = object.clone();
            drop(entry);
        }
        self.notify(key);
        Ok(object)
    }

    /// Mutate an object in place without emitting an event
    pub fn update_status(&self, key: &ObjectKey, mutate: impl FnOnce(&mut T)) -> Result<()> {
        let mut entry = self.objects.get_mut(key).ok_or_else(|| self.not_found(key))?;
        mutate(entry.value_mut());
        let meta = entry.meta_mut();
        meta.resource_version = next_version(&meta.resource_version);
        Ok(())
    }

    /// Delete an object; with finalizers it is only marked
    ///
    /// Returns whether the object is gone.
    pub fn delete(&self, key: &ObjectKey) -> Result<bool> {
        let mut entry = self.objects.get_mut(key).ok_or_else(|| self.not_found(key))?;
        let gone = if entry.meta().finalizers.is_empty() {
            drop(entry);
            self.objects.remove(key);
            true
        } else {
            let meta = entry.meta_mut();
            meta.deletion_timestamp.get_or_insert_with(Utc::now);
            meta.resource_version = next_version(&meta.resource_version);
            false
        };
        self.notify(key.clone());
        Ok(gone)
    }

    fn notify(&self, key: ObjectKey) {
        // No receivers is fine; resync covers missed events.
        let _ = self.events.send(StoreEvent { kind: T::KIND, key });
    }

    fn not_found(&self, key: &ObjectKey) -> PorchError {
        PorchError::ObjectNotFound {
            kind: T::KIND.to_string(),
            name: key.to_string(),
        }
    }
}

fn next_version(current: &str) -> String {
    (current.parse::<u64>().unwrap_or(0) + 1).to_string()
}

/// An object of any kind, addressed by `apiVersion`, `kind` and metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicObject {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(flatten)]
    pub fields: BTreeMap<String, serde_yaml::Value>,
}

impl DynamicObject {
    pub fn parse(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| PorchError::ParseFailed {
            path: "<object>".to_string(),
            reason: e.to_string(),
        })
    }

    /// The whole object as a YAML value, for field-path lookups
    pub fn to_value(&self) -> Result<serde_yaml::Value> {
        Ok(serde_yaml::to_value(self)?)
    }
}

/// Dynamic objects live in one store keyed by kind as well as name
impl Object for DynamicObject {
    const KIND: &'static str = "Object";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// The controllers' view of the cluster
pub struct ClusterStore {
    pub variants: Store<PackageVariant>,
    pub variant_sets: Store<PackageVariantSet>,
    objects: DashMap<(String, String), Store<DynamicObject>>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for ClusterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            variants: Store::new(events.clone()),
            variant_sets: Store::new(events.clone()),
            objects: DashMap::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Store an arbitrary object, replacing one with the same identity
    pub fn apply_object(&self, object: DynamicObject) -> Result<DynamicObject> {
        let gvk = (object.api_version.clone(), object.kind.clone());
        let store = self
            .objects
            .entry(gvk)
            .or_insert_with(|| Store::new(self.events.clone()));
        let key = ObjectKey::of(&object.metadata);
        if store.get(&key).is_some() {
            let mut object = object;
            object.metadata.resource_version.clear();
            store.update(object)
        } else {
            store.create(object)
        }
    }

    pub fn delete_object(&self, api_version: &str, kind: &str, key: &ObjectKey) -> Result<bool> {
        let store = self
            .objects
            .get(&(api_version.to_string(), kind.to_string()))
            .ok_or_else(|| PorchError::ObjectNotFound {
                kind: kind.to_string(),
                name: key.to_string(),
            })?;
        store.delete(key)
    }

    /// Objects of one kind in a namespace
    pub fn list_objects(&self, namespace: &str, api_version: &str, kind: &str) -> Vec<DynamicObject> {
        self.objects
            .get(&(api_version.to_string(), kind.to_string()))
            .map(|store| store.list(namespace))
            .unwrap_or_default()
    }
}

/// Load a typed object from YAML
pub fn from_yaml<T: Object + DeserializeOwned>(yaml: &str) -> Result<T> {
    serde_yaml::from_str(yaml).map_err(|e| PorchError::ParseFailed {
        path: format!("<{}>", T::KIND),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_map(name: &str, env: &str) -> DynamicObject {
        DynamicObject::parse(&format!(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {name}\n  namespace: default\n  labels:\n    env: {env}\ndata:\n  region: eu\n"
        ))
        .unwrap()
    }

    #[test]
    fn test_create_assigns_identity() {
        let cluster = ClusterStore::new();
        let object = cluster.apply_object(config_map("a", "dev")).unwrap();
        assert!(!object.metadata.uid.is_empty());
        assert_eq!(object.metadata.resource_version, "1");
        assert_eq!(object.fields["data"]["region"], serde_yaml::Value::from("eu"));
    }

    #[test]
    fn test_objects_are_listed_by_kind() {
        let cluster = ClusterStore::new();
        cluster.apply_object(config_map("b", "dev")).unwrap();
        cluster.apply_object(config_map("a", "prod")).unwrap();
        let listed = cluster.list_objects("default", "v1", "ConfigMap");
        let names: Vec<&str> = listed.iter().map(|o| o.metadata.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(cluster.list_objects("default", "v1", "Secret").is_empty());
    }

    #[test]
    fn test_stale_update_is_rejected() {
        let cluster = ClusterStore::new();
        let store: Store<DynamicObject> = Store::new(cluster.events.clone());
        let created = store.create(config_map("a", "dev")).unwrap();
        store.update(created.clone()).unwrap();
        let err = store.update(created).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }

    #[test]
    fn test_finalizers_hold_deletion() {
        let cluster = ClusterStore::new();
        let store: Store<DynamicObject> = Store::new(cluster.events.clone());
        let mut object = config_map("a", "dev");
        object.metadata.finalizers.push("hold".to_string());
        let created = store.create(object).unwrap();
        let key = ObjectKey::of(&created.metadata);

        assert!(!store.delete(&key).unwrap());
        let mut marked = store.get(&key).unwrap();
        assert!(marked.metadata.deletion_timestamp.is_some());

        marked.metadata.finalizers.clear();
        store.update(marked).unwrap();
        assert!(store.get(&key).is_none());
    }

    #[test]
    fn test_writes_emit_events() {
        let cluster = ClusterStore::new();
        let mut events = cluster.subscribe();
        cluster.apply_object(config_map("a", "dev")).unwrap();
        let event = events.try_recv().unwrap();
        assert_eq!(event.key, ObjectKey::new("default", "a"));
    }
}
