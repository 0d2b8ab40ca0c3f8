//! KRM resources inside a package
//!
//! A package file is either KRM YAML (one or more documents that each carry
//! `apiVersion` and `kind`) or opaque content that is carried verbatim.
//! Identity of a KRM document is `(group, kind, namespace, name, path)`,
//! where a `# kpt-merge: <namespace>/<name>` comment on the `metadata:` line
//! overrides the namespace and name.

pub mod fieldpath;

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_yaml::{Mapping, Value};

use crate::error::{PorchError, Result};
use crate::model::Resources;

pub const PATH_ANNOTATION: &str = "config.kubernetes.io/path";
pub const FILE_ANNOTATION: &str = "internal.porch.kpt.dev/file";
pub const MERGE_KEY_ANNOTATION: &str = "internal.porch.kpt.dev/merge-key";
pub const RESOURCE_LIST_API_VERSION: &str = "config.kubernetes.io/v1";
pub const RESOURCE_LIST_KIND: &str = "ResourceList";

static MERGE_COMMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^metadata:[ \t]*#[ \t]*kpt-merge:[ \t]*([^/\s]*)/(\S+)[ \t]*$")
        .unwrap_or_else(|_| unreachable!("static regex"))
});

static METADATA_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^metadata:[ \t]*(#.*)?$").unwrap_or_else(|_| unreachable!("static regex"))
});

static DOCUMENT_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^---[ \t]*(#.*)?$").unwrap_or_else(|_| unreachable!("static regex")));

/// Identity of a KRM document
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub path: String,
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let group = if self.group.is_empty() { "core" } else { &self.group };
        write!(f, "{group}/{}", self.kind)?;
        if !self.namespace.is_empty() {
            write!(f, " {}/{}", self.namespace, self.name)
        } else {
            write!(f, " {}", self.name)
        }
    }
}

/// `(namespace, name)` taken from a merge identity comment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeComment {
    pub namespace: String,
    pub name: String,
}

/// One KRM document of a package file
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDoc {
    /// File the document was read from
    pub file: String,
    /// Position within the file
    pub index: usize,
    pub value: Value,
    pub merge_comment: Option<MergeComment>,
}

impl ResourceDoc {
    pub fn api_version(&self) -> &str {
        str_at(&self.value, &["apiVersion"]).unwrap_or_default()
    }

    pub fn kind(&self) -> &str {
        str_at(&self.value, &["kind"]).unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        str_at(&self.value, &["metadata", "name"]).unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        str_at(&self.value, &["metadata", "namespace"]).unwrap_or_default()
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        str_at(&self.value, &["metadata", "annotations", key])
    }

    /// `group.version.kind` used for schema lookups
    pub fn gvk_key(&self) -> String {
        gvk_key(self.api_version(), self.kind())
    }

    pub fn id(&self) -> ResourceId {
        let (namespace, name) = match &self.merge_comment {
            Some(c) => (c.namespace.clone(), c.name.clone()),
            None => (self.namespace().to_string(), self.name().to_string()),
        };
        ResourceId {
            group: group_of(self.api_version()).to_string(),
            kind: self.kind().to_string(),
            namespace,
            name,
            path: self
                .annotation(PATH_ANNOTATION)
                .unwrap_or(&self.file)
                .to_string(),
        }
    }

    /// Serialize, restoring the merge identity comment
    pub fn to_yaml(&self) -> Result<String> {
        let rendered = serde_yaml::to_string(&self.value)?;
        Ok(match &self.merge_comment {
            Some(c) => set_merge_comment(&rendered, &c.namespace, &c.name),
            None => rendered,
        })
    }
}

/// API group of an `apiVersion` (`""` for the core group)
pub fn group_of(api_version: &str) -> &str {
    api_version.rsplit_once('/').map_or("", |(group, _)| group)
}

pub fn gvk_key(api_version: &str, kind: &str) -> String {
    match api_version.rsplit_once('/') {
        Some((group, version)) => format!("{group}.{version}.{kind}"),
        None => format!("{api_version}.{kind}"),
    }
}

fn str_at<'v>(value: &'v Value, keys: &[&str]) -> Option<&'v str> {
    let mut current = value;
    for key in keys {
        current = current.get(*key)?;
    }
    current.as_str()
}

/// A package split into KRM documents and opaque files
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedPackage {
    pub docs: Vec<ResourceDoc>,
    pub opaque: Resources,
}

/// Whether a file is a candidate for KRM parsing
pub fn is_yaml_file(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    name == "Kptfile" || name.ends_with(".yaml") || name.ends_with(".yml")
}

/// Split file content on `---` document separators
pub fn split_documents(content: &str) -> Vec<&str> {
    DOCUMENT_SEPARATOR
        .split(content)
        .filter(|doc| doc.lines().any(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#')))
        .collect()
}

/// Merge identity comment of a document, if present
pub fn merge_comment_of(document: &str) -> Option<MergeComment> {
    MERGE_COMMENT.captures(document).map(|caps| MergeComment {
        namespace: caps[1].to_string(),
        name: caps[2].to_string(),
    })
}

/// Put `# kpt-merge: ns/name` on the top-level `metadata:` line
pub fn set_merge_comment(document: &str, namespace: &str, name: &str) -> String {
    METADATA_LINE
        .replace(document, format!("metadata: # kpt-merge: {namespace}/{name}").as_str())
        .into_owned()
}

/// Parse one file into KRM documents; `None` when the file is opaque
pub fn parse_file(path: &str, content: &str) -> Option<Vec<ResourceDoc>> {
    if !is_yaml_file(path) {
        return None;
    }
    let mut docs = Vec::new();
    for (index, text) in split_documents(content).into_iter().enumerate() {
        let value: Value = serde_yaml::from_str(text).ok()?;
        let is_krm = value.get("apiVersion").and_then(Value::as_str).is_some()
            && value.get("kind").and_then(Value::as_str).is_some();
        if !is_krm {
            return None;
        }
        docs.push(ResourceDoc {
            file: path.to_string(),
            index,
            value,
            merge_comment: merge_comment_of(text),
        });
    }
    Some(docs)
}

/// Parse every file of a package
pub fn parse_package(resources: &Resources) -> ParsedPackage {
    let mut parsed = ParsedPackage::default();
    for (path, content) in resources {
        match parse_file(path, content) {
            Some(docs) => parsed.docs.extend(docs),
            None => {
                parsed.opaque.insert(path.clone(), content.clone());
            }
        }
    }
    parsed
}

/// Write documents back into files, in the given order per file
pub fn write_documents(docs: &[ResourceDoc]) -> Result<Resources> {
    let mut files: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for doc in docs {
        files.entry(doc.file.clone()).or_default().push(doc.to_yaml()?);
    }
    Ok(files
        .into_iter()
        .map(|(path, docs)| (path, docs.join("---\n")))
        .collect())
}

/// Add merge identity comments to documents that lack one
///
/// Files are rewritten only when a comment was added.
pub fn add_merge_comments(resources: &Resources) -> Resources {
    resources
        .iter()
        .map(|(path, content)| {
            let updated = parse_file(path, content)
                .filter(|docs| docs.iter().any(|d| d.merge_comment.is_none() && d.kind() != "Kptfile"))
                .map(|_| {
                    split_documents(content)
                        .into_iter()
                        .map(|text| annotate_document(text))
                        .collect::<Vec<_>>()
                        .join("---\n")
                });
            (path.clone(), updated.unwrap_or_else(|| content.clone()))
        })
        .collect()
}

fn annotate_document(text: &str) -> String {
    let text = text.trim_start_matches('\n');
    if merge_comment_of(text).is_some() {
        return text.to_string();
    }
    let Ok(value) = serde_yaml::from_str::<Value>(text) else {
        return text.to_string();
    };
    if value.get("kind").and_then(Value::as_str) == Some("Kptfile") {
        return text.to_string();
    }
    let namespace = str_at(&value, &["metadata", "namespace"]).unwrap_or_default();
    let name = str_at(&value, &["metadata", "name"]).unwrap_or_default();
    set_merge_comment(text, namespace, name)
}

/// Check that a resource path is relative and stays inside the package
pub fn validate_path(path: &str) -> Result<()> {
    let invalid = |reason: &str| PorchError::ParseFailed {
        path: path.to_string(),
        reason: reason.to_string(),
    };
    if path.is_empty() {
        return Err(invalid("empty path"));
    }
    if path.starts_with('/') || path.contains('\\') {
        return Err(invalid("path must be relative"));
    }
    if path.split('/').any(|c| c.is_empty() || c == "." || c == "..") {
        return Err(invalid("path must not contain empty, '.' or '..' components"));
    }
    Ok(())
}

/// Build a `ResourceList` for a function invocation
///
/// Every item carries its source file and merge identity in porch-internal
/// annotations so the output maps back to the same files and tuples. The
/// document's own annotations are left as they are.
pub fn to_resource_list(docs: &[ResourceDoc], function_config: Option<Value>) -> Value {
    let items: Vec<Value> = docs
        .iter()
        .map(|doc| {
            let mut value = doc.value.clone();
            let annotations = ensure_mapping(&mut value, &["metadata", "annotations"]);
            annotations.insert(Value::from(FILE_ANNOTATION), Value::from(doc.file.clone()));
            if let Some(comment) = &doc.merge_comment {
                annotations.insert(
                    Value::from(MERGE_KEY_ANNOTATION),
                    Value::from(format!("{}/{}", comment.namespace, comment.name)),
                );
            }
            value
        })
        .collect();

    let mut list = Mapping::new();
    list.insert("apiVersion".into(), RESOURCE_LIST_API_VERSION.into());
    list.insert("kind".into(), RESOURCE_LIST_KIND.into());
    list.insert("items".into(), Value::Sequence(items));
    if let Some(config) = function_config {
        list.insert("functionConfig".into(), config);
    }
    Value::Mapping(list)
}

/// Read the items of a `ResourceList` back into documents
///
/// Items keep the file and merge identity they went in with. Items a
/// function created land in the file named by their path annotation, or in
/// `resource-<i>.yaml`.
pub fn from_resource_list(list: &Value) -> Result<Vec<ResourceDoc>> {
    let items = list
        .get("items")
        .and_then(Value::as_sequence)
        .ok_or_else(|| PorchError::ParseFailed {
            path: RESOURCE_LIST_KIND.to_string(),
            reason: "missing items".to_string(),
        })?;

    let mut per_file: BTreeMap<String, usize> = BTreeMap::new();
    let mut docs = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let mut value = item.clone();
        let file = str_at(&value, &["metadata", "annotations", FILE_ANNOTATION])
            .or_else(|| str_at(&value, &["metadata", "annotations", PATH_ANNOTATION]))
            .map_or_else(|| format!("resource-{i}.yaml"), ToString::to_string);
        validate_path(&file)?;
        let merge_comment = str_at(&value, &["metadata", "annotations", MERGE_KEY_ANNOTATION])
            .and_then(|key| key.split_once('/'))
            .map(|(namespace, name)| MergeComment {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        if let Some(annotations) = value
            .get_mut("metadata")
            .and_then(|m| m.get_mut("annotations"))
            .and_then(Value::as_mapping_mut)
        {
            annotations.remove(FILE_ANNOTATION);
            annotations.remove(MERGE_KEY_ANNOTATION);
            if annotations.is_empty() {
                if let Some(metadata) = value.get_mut("metadata").and_then(Value::as_mapping_mut) {
                    metadata.remove("annotations");
                }
            }
        }
        let index = per_file.entry(file.clone()).or_default();
        docs.push(ResourceDoc {
            file,
            index: *index,
            value,
            merge_comment,
        });
        *index += 1;
    }
    Ok(docs)
}

/// Mapping at `keys`, creating intermediate mappings as needed
fn ensure_mapping<'v>(value: &'v mut Value, keys: &[&str]) -> &'v mut Mapping {
    let mut current = value;
    for key in keys {
        if !current.is_mapping() {
            *current = Value::Mapping(Mapping::new());
        }
        let Value::Mapping(map) = current else {
            unreachable!("just ensured mapping")
        };
        current = map
            .entry(Value::from(*key))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
    }
    if !current.is_mapping() {
        *current = Value::Mapping(Mapping::new());
    }
    match current {
        Value::Mapping(map) => map,
        _ => unreachable!("just ensured mapping"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEPLOY: &str = "apiVersion: apps/v1\nkind: Deployment\nmetadata: # kpt-merge: prod/web\n  name: web-dev\n  namespace: dev\nspec:\n  replicas: 1\n";

    fn resources(entries: &[(&str, &str)]) -> Resources {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_identity_uses_merge_comment() {
        let docs = parse_file("deploy.yaml", DEPLOY).unwrap();
        let id = docs[0].id();
        assert_eq!(id.group, "apps");
        assert_eq!(id.namespace, "prod");
        assert_eq!(id.name, "web");
        assert_eq!(id.path, "deploy.yaml");
    }

    #[test]
    fn test_path_annotation_overrides_file() {
        let content = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n  annotations:\n    config.kubernetes.io/path: base/cm.yaml\n";
        let docs = parse_file("patch.yaml", content).unwrap();
        assert_eq!(docs[0].id().path, "base/cm.yaml");
    }

    #[test]
    fn test_multi_document_file() {
        let content = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: b\n";
        let docs = parse_file("cms.yaml", content).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1].name(), "b");
        assert_eq!(docs[1].index, 1);
    }

    #[test]
    fn test_non_krm_is_opaque() {
        let parsed = parse_package(&resources(&[
            ("README.md", "# pkg\n"),
            ("values.yaml", "replicas: 3\n"),
            ("cm.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n"),
        ]));
        assert_eq!(parsed.docs.len(), 1);
        assert_eq!(parsed.opaque.len(), 2);
    }

    #[test]
    fn test_round_trip_keeps_comment() {
        let docs = parse_file("deploy.yaml", DEPLOY).unwrap();
        let written = write_documents(&docs).unwrap();
        assert!(written["deploy.yaml"].contains("metadata: # kpt-merge: prod/web"));
    }

    #[test]
    fn test_add_merge_comments() {
        let input = resources(&[("cm.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n  namespace: ns\n")]);
        let output = add_merge_comments(&input);
        assert!(output["cm.yaml"].contains("metadata: # kpt-merge: ns/a"));
        let again = add_merge_comments(&output);
        assert_eq!(again, output);
    }

    #[test]
    fn test_kptfile_not_annotated() {
        let input = resources(&[("Kptfile", "apiVersion: kpt.dev/v1\nkind: Kptfile\nmetadata:\n  name: a\n")]);
        assert_eq!(add_merge_comments(&input), input);
    }

    #[test]
    fn test_resource_list_keeps_files_and_identity() {
        let docs = parse_file("deploy.yaml", DEPLOY).unwrap();
        let list = to_resource_list(&docs, None);
        let items = list.get("items").unwrap().as_sequence().unwrap();
        assert_eq!(items[0]["metadata"]["annotations"][FILE_ANNOTATION].as_str(), Some("deploy.yaml"));
        let back = from_resource_list(&list).unwrap();
        assert_eq!(back[0].file, "deploy.yaml");
        assert_eq!(back[0].id(), docs[0].id());
        assert!(back[0].value["metadata"].get("annotations").is_none());
        assert!(write_documents(&back).unwrap()["deploy.yaml"].contains("metadata: # kpt-merge: prod/web"));
    }

    #[test]
    fn test_resource_list_leaves_path_annotation_alone() {
        let content = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n  annotations:\n    config.kubernetes.io/path: base/cm.yaml\n";
        let docs = parse_file("patch.yaml", content).unwrap();
        let back = from_resource_list(&to_resource_list(&docs, None)).unwrap();
        assert_eq!(back[0].file, "patch.yaml");
        assert_eq!(back[0].annotation(PATH_ANNOTATION), Some("base/cm.yaml"));
        assert_eq!(back[0].id(), docs[0].id());
    }

    #[test]
    fn test_new_items_use_path_annotation() {
        let list: Value = serde_yaml::from_str(
            "items:\n- apiVersion: v1\n  kind: ConfigMap\n  metadata:\n    name: gen\n    annotations:\n      config.kubernetes.io/path: gen/cm.yaml\n- apiVersion: v1\n  kind: ConfigMap\n  metadata:\n    name: other\n",
        )
        .unwrap();
        let docs = from_resource_list(&list).unwrap();
        assert_eq!(docs[0].file, "gen/cm.yaml");
        assert_eq!(docs[1].file, "resource-1.yaml");
        assert!(docs[1].merge_comment.is_none());
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("a/b.yaml").is_ok());
        assert!(validate_path("../x").is_err());
        assert!(validate_path("/etc/passwd").is_err());
        assert!(validate_path("a//b").is_err());
    }

    #[test]
    fn test_gvk_key() {
        assert_eq!(gvk_key("apps/v1", "Deployment"), "apps.v1.Deployment");
        assert_eq!(gvk_key("v1", "ConfigMap"), "v1.ConfigMap");
    }
}
