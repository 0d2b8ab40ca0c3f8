//! 3-way merge of package resources
//!
//! Used by the update task: `original` is the upstream the package was
//! cloned from, `updated` the new upstream, `destination` the local package.
//!
//! ## Per-resource rules
//!
//! | original | updated | destination | result |
//! |----------|---------|-------------|--------|
//! | yes | yes | yes | structural merge |
//! | no | no | yes | keep destination |
//! | no | yes | no | take updated |
//! | yes | no | yes | drop, unless destination changed it |
//! | yes | yes | no | drop (deleted locally) |
//! | no | yes | yes | structural merge against an empty original |
//!
//! Resources match by `(group, kind, namespace, name, path)`; see
//! [`crate::resources::ResourceId`]. Non-KRM files get a line-based 3-way
//! merge where the destination wins on conflict.

pub mod schema;
mod walk;

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{PorchError, Result};
use crate::model::Resources;
use crate::resources::{self, ResourceDoc, ResourceId};

pub use schema::{ListStrategy, SchemaSet};
use walk::Walker;

/// Which side of the merge an input is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeInput {
    Original,
    Updated,
    Destination,
}

impl MergeInput {
    pub fn as_str(self) -> &'static str {
        match self {
            MergeInput::Original => "original",
            MergeInput::Updated => "updated",
            MergeInput::Destination => "destination",
        }
    }
}

/// Merges package resources with an explicit schema registry
#[derive(Debug, Clone, Default)]
pub struct Merger {
    schema: SchemaSet,
}

impl Merger {
    pub fn new(schema: SchemaSet) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &SchemaSet {
        &self.schema
    }

    pub fn merge(&self, original: &Resources, updated: &Resources, destination: &Resources) -> Result<Resources> {
        let original = resources::parse_package(original);
        let updated = resources::parse_package(updated);
        let destination = resources::parse_package(destination);

        let mut schema = self.schema.clone();
        schema.extend_from_crds(updated.docs.iter().chain(&destination.docs));

        let o = index(&original.docs, MergeInput::Original)?;
        let u = index(&updated.docs, MergeInput::Updated)?;
        let d = index(&destination.docs, MergeInput::Destination)?;

        let ids: BTreeSet<&ResourceId> = o.keys().chain(u.keys()).chain(d.keys()).collect();
        let mut output: Vec<(usize, ResourceDoc)> = Vec::new();
        for id in ids {
            let merged = merge_tuple(&schema, o.get(id).copied(), u.get(id).copied(), d.get(id).copied());
            if let Some((doc, rank)) = merged {
                output.push((rank, doc));
            }
        }
        output.sort_by(|(ra, a), (rb, b)| a.file.cmp(&b.file).then(ra.cmp(rb)));
        let docs: Vec<ResourceDoc> = output.into_iter().map(|(_, doc)| doc).collect();

        let mut merged = merge_opaque(&original.opaque, &updated.opaque, &destination.opaque);
        merged.extend(resources::write_documents(&docs)?);
        Ok(merged)
    }
}

fn index(docs: &[ResourceDoc], input: MergeInput) -> Result<BTreeMap<ResourceId, &ResourceDoc>> {
    let mut by_id = BTreeMap::new();
    for doc in docs {
        let id = doc.id();
        if by_id.contains_key(&id) {
            return Err(PorchError::DuplicateResource {
                input: input.as_str().to_string(),
                id: id.to_string(),
                path: doc.file.clone(),
            });
        }
        by_id.insert(id, doc);
    }
    Ok(by_id)
}

/// Merge one identity tuple; the rank orders the output within its file
fn merge_tuple(
    schema: &SchemaSet,
    o: Option<&ResourceDoc>,
    u: Option<&ResourceDoc>,
    d: Option<&ResourceDoc>,
) -> Option<(ResourceDoc, usize)> {
    const APPENDED: usize = 1 << 20;
    match (o, u, d) {
        (_, None, None) | (Some(_), Some(_), None) => None,
        (None, None, Some(d)) => Some((d.clone(), d.index)),
        (None, Some(u), None) => Some((u.clone(), APPENDED + u.index)),
        (Some(o), None, Some(d)) => (o.value != d.value).then(|| (d.clone(), d.index)),
        (o, Some(u), Some(d)) => {
            let walker = Walker::new(schema, d.gvk_key());
            let value = walker.merge_document(o.map(|o| &o.value), Some(&u.value), Some(&d.value))?;
            let doc = ResourceDoc {
                file: d.file.clone(),
                index: d.index,
                value,
                merge_comment: d.merge_comment.clone().or_else(|| u.merge_comment.clone()),
            };
            Some((doc, d.index))
        }
    }
}

/// 3-way merge of non-KRM files
fn merge_opaque(o: &Resources, u: &Resources, d: &Resources) -> Resources {
    let paths: BTreeSet<&String> = o.keys().chain(u.keys()).chain(d.keys()).collect();
    let mut merged = Resources::new();
    for path in paths {
        let (of, uf, df) = (o.get(path), u.get(path), d.get(path));
        let content = if df == of {
            uf.cloned()
        } else if uf == of {
            df.cloned()
        } else {
            match (of, uf, df) {
                (Some(base), Some(theirs), Some(ours)) => Some(diffy::merge(base, ours, theirs).unwrap_or_else(|_| {
                    tracing::warn!(path = %path, "conflicting edits to file; keeping local content");
                    ours.clone()
                })),
                (_, _, ours) => ours.cloned(),
            }
        };
        if let Some(content) = content {
            merged.insert(path.clone(), content);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn pkg(entries: &[(&str, &str)]) -> Resources {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn deployment(body: &str) -> String {
        format!("apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\nspec:\n{body}")
    }

    fn value(content: &str) -> serde_yaml::Value {
        serde_yaml::from_str(content).unwrap()
    }

    #[test]
    fn test_upstream_edit_merges_with_local_edit() {
        let merger = Merger::new(SchemaSet::with_defaults());
        let merged = merger
            .merge(
                &pkg(&[("deploy.yaml", &deployment("  replicas: 1\n"))]),
                &pkg(&[("deploy.yaml", &deployment("  replicas: 3\n  image: x\n"))]),
                &pkg(&[("deploy.yaml", &deployment("  replicas: 5\n"))]),
            )
            .unwrap();
        let spec = value(&merged["deploy.yaml"])["spec"].clone();
        assert_eq!(spec, value("replicas: 5\nimage: x"));
    }

    #[test]
    fn test_same_upstream_is_noop() {
        let upstream = pkg(&[("deploy.yaml", &deployment("  replicas: 1\n"))]);
        let local = pkg(&[
            ("deploy.yaml", &deployment("  replicas: 7\n")),
            ("README.md", "local notes\n"),
        ]);
        let merged = Merger::default().merge(&upstream, &upstream, &local).unwrap();
        assert_eq!(value(&merged["deploy.yaml"]), value(&local["deploy.yaml"]));
        assert_eq!(merged["README.md"], "local notes\n");
    }

    #[test]
    fn test_tuple_rules() {
        let cm = |name: &str, v: &str| format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {name}\ndata:\n  k: {v}\n");
        let original = pkg(&[("gone.yaml", &cm("gone", "1")), ("kept.yaml", &cm("kept", "1")), ("local-del.yaml", &cm("ld", "1"))]);
        let updated = pkg(&[("new.yaml", &cm("new", "1")), ("local-del.yaml", &cm("ld", "2"))]);
        let destination = pkg(&[
            ("gone.yaml", &cm("gone", "1")),
            ("kept.yaml", &cm("kept", "changed")),
            ("mine.yaml", &cm("mine", "1")),
        ]);
        let merged = Merger::default().merge(&original, &updated, &destination).unwrap();
        let files: Vec<&str> = merged.keys().map(String::as_str).collect();
        assert_eq!(files, vec!["kept.yaml", "mine.yaml", "new.yaml"]);
    }

    #[test]
    fn test_merge_comment_identity() {
        let original = pkg(&[("cm.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: app\ndata:\n  a: '1'\n")]);
        let updated = pkg(&[("cm.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: app\ndata:\n  a: '1'\n  b: '2'\n")]);
        let destination = pkg(&[(
            "cm.yaml",
            "apiVersion: v1\nkind: ConfigMap\nmetadata: # kpt-merge: /app\n  name: app-prod\ndata:\n  a: '1'\n",
        )]);
        let merged = Merger::default().merge(&original, &updated, &destination).unwrap();
        let content = &merged["cm.yaml"];
        assert!(content.contains("kpt-merge: /app"));
        let v = value(content);
        assert_eq!(v["metadata"]["name"].as_str(), Some("app-prod"));
        assert_eq!(v["data"]["b"].as_str(), Some("2"));
    }

    #[test]
    fn test_duplicate_resource_names_input_and_file() {
        let cm = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n";
        let dup = pkg(&[("a.yaml", &format!("{cm}---\n{cm}"))]);
        let err = Merger::default().merge(&Resources::new(), &dup, &Resources::new()).unwrap_err();
        match err {
            PorchError::DuplicateResource { input, path, .. } => {
                assert_eq!(input, "updated");
                assert_eq!(path, "a.yaml");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_opaque_file_merge() {
        let merged = merge_opaque(
            &pkg(&[("notes.txt", "a\nb\nc\n")]),
            &pkg(&[("notes.txt", "a\nb\nc\nd\n")]),
            &pkg(&[("notes.txt", "z\nb\nc\n")]),
        );
        assert_eq!(merged["notes.txt"], "z\nb\nc\nd\n");
    }

    type Versions = (Option<u8>, Option<u8>, Option<u8>);

    fn config_maps(entries: &[(String, Versions)], pick: fn(&Versions) -> Option<u8>) -> Resources {
        let docs: Vec<String> = entries
            .iter()
            .filter_map(|(name, versions)| {
                pick(versions).map(|v| format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {name}\ndata:\n  k: '{v}'\n"))
            })
            .collect();
        if docs.is_empty() {
            return Resources::new();
        }
        pkg(&[("cms.yaml", &docs.join("---\n"))])
    }

    fn merged_docs(o: &[(String, Versions)], u: &[(String, Versions)], d: &[(String, Versions)]) -> Vec<(String, serde_yaml::Value)> {
        let merged = Merger::default()
            .merge(&config_maps(o, |v| v.0), &config_maps(u, |v| v.1), &config_maps(d, |v| v.2))
            .unwrap();
        let mut docs: Vec<(String, serde_yaml::Value)> = resources::parse_package(&merged)
            .docs
            .into_iter()
            .map(|doc| (doc.name().to_string(), doc.value))
            .collect();
        docs.sort_by(|a, b| a.0.cmp(&b.0));
        docs
    }

    type Entries = Vec<(String, Versions)>;

    fn arb_inputs() -> impl Strategy<Value = (Entries, (Entries, Entries, Entries))> {
        let version = || prop::option::of(0u8..3);
        prop::collection::btree_map("cm-[a-z]{1,6}", (version(), version(), version()), 1..8).prop_flat_map(|entries| {
            let entries: Entries = entries.into_iter().collect();
            let shuffled = || Just(entries.clone()).prop_shuffle();
            (Just(entries.clone()), (shuffled(), shuffled(), shuffled()))
        })
    }

    proptest! {
        #[test]
        fn test_document_order_does_not_change_merge((entries, (o, u, d)) in arb_inputs()) {
            prop_assert_eq!(merged_docs(&entries, &entries, &entries), merged_docs(&o, &u, &d));
        }
    }
}
