//! List merge strategies for known kinds
//!
//! A [`SchemaSet`] answers one question for the merger: how should the list
//! at a given field path of a given kind be merged? Entries are keyed by
//! `group.version.kind` (`version.kind` for the core group) and a path in
//! which `[]` stands for "every element of a list", e.g.
//! `spec.template.spec.containers[].ports`.
//!
//! Lists with no entry fall back to a small set of well-known field names
//! (`containers` merge by `name`, `ports` by `containerPort`, ...) and then
//! to additive merging.

use std::collections::{BTreeMap, HashMap};

use serde_yaml::Value;

use crate::resources::{ResourceDoc, gvk_key};

/// How a list is merged
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListStrategy {
    /// Associative list; elements match by the values of these keys
    Merge { keys: Vec<String> },
    /// Destination list wins as a whole
    Replace,
}

impl ListStrategy {
    pub fn merge_by(key: &str) -> Self {
        ListStrategy::Merge {
            keys: vec![key.to_string()],
        }
    }
}

/// Explicit schema registry handed to a merger
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaSet {
    kinds: HashMap<String, BTreeMap<String, ListStrategy>>,
    by_field: BTreeMap<String, ListStrategy>,
}

impl SchemaSet {
    /// Empty registry: every list merges additively
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the well-known workload list fields
    pub fn with_defaults() -> Self {
        let mut set = Self::empty();
        for field in ["containers", "initContainers", "ephemeralContainers", "env", "volumes", "imagePullSecrets"] {
            set.by_field.insert(field.to_string(), ListStrategy::merge_by("name"));
        }
        set.by_field
            .insert("ports".to_string(), ListStrategy::merge_by("containerPort"));
        set.by_field
            .insert("volumeMounts".to_string(), ListStrategy::merge_by("mountPath"));
        set.by_field.insert(
            "tolerations".to_string(),
            ListStrategy::Replace,
        );
        set
    }

    /// Register a strategy; a duplicate entry replaces the earlier one
    pub fn insert(&mut self, gvk: &str, path: &str, strategy: ListStrategy) {
        let paths = self.kinds.entry(gvk.to_string()).or_default();
        if let Some(previous) = paths.insert(path.to_string(), strategy) {
            tracing::warn!(gvk, path, ?previous, "duplicate schema entry; keeping the latest");
        }
    }

    /// Strategy for the list at `path` of `gvk`
    ///
    /// `field` is the last key of the path, used for the well-known fallbacks.
    pub fn lookup(&self, gvk: &str, path: &str, field: &str) -> Option<&ListStrategy> {
        self.kinds
            .get(gvk)
            .and_then(|paths| paths.get(path))
            .or_else(|| self.by_field.get(field))
    }

    pub fn len(&self) -> usize {
        self.kinds.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Register the list strategies declared by every CRD in `docs`
    pub fn extend_from_crds<'d>(&mut self, docs: impl IntoIterator<Item = &'d ResourceDoc>) {
        for doc in docs {
            if doc.kind() == "CustomResourceDefinition" && doc.api_version().starts_with("apiextensions.k8s.io/") {
                self.add_crd(&doc.value);
            }
        }
    }

    /// Register the list strategies of one CRD document
    pub fn add_crd(&mut self, crd: &Value) {
        let Some(spec) = crd.get("spec") else {
            return;
        };
        let group = spec.get("group").and_then(Value::as_str).unwrap_or_default();
        let Some(kind) = spec
            .get("names")
            .and_then(|n| n.get("kind"))
            .and_then(Value::as_str)
        else {
            return;
        };
        let Some(versions) = spec.get("versions").and_then(Value::as_sequence) else {
            return;
        };
        for version in versions {
            let Some(name) = version.get("name").and_then(Value::as_str) else {
                continue;
            };
            let Some(schema) = version
                .get("schema")
                .and_then(|s| s.get("openAPIV3Schema"))
            else {
                continue;
            };
            let api_version = if group.is_empty() {
                name.to_string()
            } else {
                format!("{group}/{name}")
            };
            let gvk = gvk_key(&api_version, kind);
            let mut found = Vec::new();
            collect_list_strategies(schema, "", &mut found);
            for (path, strategy) in found {
                self.insert(&gvk, &path, strategy);
            }
        }
    }
}

fn collect_list_strategies(node: &Value, path: &str, found: &mut Vec<(String, ListStrategy)>) {
    if let Some(properties) = node.get("properties").and_then(Value::as_mapping) {
        for (key, child) in properties {
            let Some(key) = key.as_str() else {
                continue;
            };
            let child_path = if path.is_empty() {
                key.to_string()
            } else {
                format!("{path}.{key}")
            };
            collect_list_strategies(child, &child_path, found);
        }
    }

    if node.get("type").and_then(Value::as_str) == Some("array") {
        if let Some(strategy) = list_strategy_of(node) {
            found.push((path.to_string(), strategy));
        }
        if let Some(items) = node.get("items") {
            collect_list_strategies(items, &format!("{path}[]"), found);
        }
    }
}

fn list_strategy_of(node: &Value) -> Option<ListStrategy> {
    let str_field = |name: &str| node.get(name).and_then(Value::as_str);

    let replace = str_field("x-kubernetes-patch-strategy").is_some_and(|s| s.split(',').any(|p| p.trim() == "replace"));
    if replace || str_field("x-kubernetes-list-type") == Some("atomic") {
        return Some(ListStrategy::Replace);
    }
    if let Some(keys) = node
        .get("x-kubernetes-list-map-keys")
        .and_then(Value::as_sequence)
    {
        let keys: Vec<String> = keys
            .iter()
            .filter_map(Value::as_str)
            .map(ToString::to_string)
            .collect();
        if !keys.is_empty() {
            return Some(ListStrategy::Merge { keys });
        }
    }
    str_field("x-kubernetes-patch-merge-key").map(ListStrategy::merge_by)
}
