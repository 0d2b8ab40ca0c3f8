//! Structural 3-way merge of one document
//!
//! Every node is merged from `(original, updated, destination)`, where
//! `None` means "absent". The rules, applied top-down:
//!
//! - destination unchanged from original: take updated
//! - updated unchanged from original: keep destination
//! - both changed mappings: merge every key
//! - both changed lists: merge by schema key, replace, or additively
//! - both changed scalars: destination wins
//!
//! A field deleted locally stays deleted even if upstream changed it.

use std::collections::HashSet;

use serde_yaml::{Mapping, Value};

use super::schema::{ListStrategy, SchemaSet};
use crate::resources::fieldpath::scalar_to_string;

pub(crate) struct Walker<'s> {
    schema: &'s SchemaSet,
    gvk: String,
}

impl<'s> Walker<'s> {
    pub(crate) fn new(schema: &'s SchemaSet, gvk: impl Into<String>) -> Self {
        Self {
            schema,
            gvk: gvk.into(),
        }
    }

    pub(crate) fn merge_document(&self, original: Option<&Value>, updated: Option<&Value>, destination: Option<&Value>) -> Option<Value> {
        self.merge(original, updated, destination, "", "")
    }

    fn merge(&self, o: Option<&Value>, u: Option<&Value>, d: Option<&Value>, path: &str, field: &str) -> Option<Value> {
        if d == o {
            return u.cloned();
        }
        if u == o {
            return d.cloned();
        }
        match (u, d) {
            (_, None) => None,
            (None, Some(d)) => Some(d.clone()),
            (Some(Value::Mapping(u)), Some(Value::Mapping(d))) => {
                let o = o.and_then(Value::as_mapping);
                Some(Value::Mapping(self.merge_mapping(o, u, d, path)))
            }
            (Some(Value::Sequence(u)), Some(Value::Sequence(d))) => {
                let o = o.and_then(Value::as_sequence).map(Vec::as_slice).unwrap_or_default();
                Some(Value::Sequence(self.merge_list(o, u, d, path, field)))
            }
            (Some(_), Some(d)) => Some(d.clone()),
        }
    }

    fn merge_mapping(&self, o: Option<&Mapping>, u: &Mapping, d: &Mapping, path: &str) -> Mapping {
        let mut merged = Mapping::new();
        let keys = d.keys().chain(u.keys().filter(|k| !d.contains_key(*k)));
        for key in keys {
            let name = scalar_to_string(key).unwrap_or_default();
            let child_path = if path.is_empty() {
                name.clone()
            } else {
                format!("{path}.{name}")
            };
            let value = self.merge(o.and_then(|o| o.get(key)), u.get(key), d.get(key), &child_path, &name);
            if let Some(value) = value {
                merged.insert(key.clone(), value);
            }
        }
        merged
    }

    fn merge_list(&self, o: &[Value], u: &[Value], d: &[Value], path: &str, field: &str) -> Vec<Value> {
        match self.schema.lookup(&self.gvk, path, field) {
            Some(ListStrategy::Replace) => d.to_vec(),
            Some(ListStrategy::Merge { keys }) => self
                .merge_keyed(o, u, d, keys, path, field)
                .unwrap_or_else(|| merge_additive(o, u, d)),
            None => merge_additive(o, u, d),
        }
    }

    /// Associative merge; `None` when some element lacks the merge keys
    fn merge_keyed(&self, o: &[Value], u: &[Value], d: &[Value], keys: &[String], path: &str, field: &str) -> Option<Vec<Value>> {
        let key_of = |v: &Value| -> Option<Vec<String>> { keys.iter().map(|k| v.get(k.as_str()).and_then(scalar_to_string)).collect() };
        let keyed = |items: &[Value]| -> Option<Vec<(Vec<String>, Value)>> { items.iter().map(|v| key_of(v).map(|k| (k, v.clone()))).collect() };
        let (o, u, d) = (keyed(o)?, keyed(u)?, keyed(d)?);
        let find = |items: &[(Vec<String>, Value)], key: &[String]| items.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone());

        let element_path = format!("{path}[]");
        let mut merged = Vec::new();
        for (key, d_item) in &d {
            let o_item = find(&o, key);
            let u_item = find(&u, key);
            if let Some(value) = self.merge(o_item.as_ref(), u_item.as_ref(), Some(d_item), &element_path, field) {
                merged.push(value);
            }
        }
        for (key, u_item) in &u {
            let known = o.iter().any(|(k, _)| k == key) || d.iter().any(|(k, _)| k == key);
            if !known {
                merged.push(u_item.clone());
            }
        }
        Some(merged)
    }
}

/// Keep destination items unless upstream removed them, then append upstream additions
fn merge_additive(o: &[Value], u: &[Value], d: &[Value]) -> Vec<Value> {
    let fingerprint = |v: &Value| serde_yaml::to_string(v).unwrap_or_default();
    let o_set: HashSet<String> = o.iter().map(fingerprint).collect();
    let u_set: HashSet<String> = u.iter().map(fingerprint).collect();
    let d_set: HashSet<String> = d.iter().map(fingerprint).collect();

    let mut merged: Vec<Value> = d
        .iter()
        .filter(|item| {
            let f = fingerprint(item);
            !(o_set.contains(&f) && !u_set.contains(&f))
        })
        .cloned()
        .collect();
    merged.extend(
        u.iter()
            .filter(|item| {
                let f = fingerprint(item);
                !o_set.contains(&f) && !d_set.contains(&f)
            })
            .cloned(),
    );
    merged
}
