//! Target unrolling
//!
//! Each target expands to downstream `(repo, package)` pairs: a `package`
//! target names one directly, a `repositories` target yields one per
//! matching registered repository, and an `objects` target yields one per
//! matching cluster object with names read from the object.

use std::collections::BTreeSet;

use serde_yaml::Value;

use super::{PackageVariantSetSpec, ValueOrFromField};
use crate::api::objects::RepositoryObject;
use crate::controllers::cluster::ClusterStore;
use crate::controllers::packagevariant::DownstreamPackage;
use crate::error::{PorchError, Result};
use crate::resources::fieldpath::FieldPath;

const KIND: &str = "PackageVariantSet";

/// Downstream packages of every target, deduplicated and sorted
pub fn unroll(
    spec: &PackageVariantSetSpec,
    upstream_package: &str,
    namespace: &str,
    repositories: &[RepositoryObject],
    cluster: &ClusterStore,
) -> Result<Vec<DownstreamPackage>> {
    let mut downstreams = BTreeSet::new();
    for (i, target) in spec.targets.iter().enumerate() {
        let field = format!("spec.targets[{i}]");
        if let Some(package) = &target.package {
            let name = if package.name.is_empty() { upstream_package } else { &package.name };
            downstreams.insert(downstream(&package.repo, name));
        }
        if let Some(selector) = &target.repositories {
            for repo in repositories.iter().filter(|r| {
                r.metadata.matches_labels(&selector.labels)
                    && (selector.names.is_empty() || selector.names.contains(&r.metadata.name))
            }) {
                let package = match &selector.package_name {
                    Some(name) => {
                        let object = serde_yaml::to_value(repo)?;
                        resolve(name, &object, &format!("{field}.repositories.packageName"))?
                    }
                    None => upstream_package.to_string(),
                };
                downstreams.insert(downstream(&repo.metadata.name, &package));
            }
        }
        if let Some(objects) = &target.objects {
            let repo_name = objects.repo_name.as_ref().ok_or_else(|| {
                PorchError::invalid_field(KIND, "", format!("{field}.objects.repoName"), "value is required")
            })?;
            for selector in &objects.selectors {
                let matches = cluster
                    .list_objects(namespace, &selector.api_version, &selector.kind)
                    .into_iter()
                    .filter(|o| selector.name.is_empty() || o.metadata.name == selector.name)
                    .filter(|o| o.metadata.matches_labels(&selector.labels));
                for object in matches {
                    let value = object.to_value()?;
                    let repo = resolve(repo_name, &value, &format!("{field}.objects.repoName"))?;
                    let package = match &objects.package_name {
                        Some(name) => resolve(name, &value, &format!("{field}.objects.packageName"))?,
                        None => upstream_package.to_string(),
                    };
                    downstreams.insert(downstream(&repo, &package));
                }
            }
        }
    }
    Ok(downstreams
        .into_iter()
        .map(|(repo, package)| DownstreamPackage { repo, package })
        .collect())
}

fn downstream(repo: &str, package: &str) -> (String, String) {
    (repo.to_string(), package.to_string())
}

/// A literal value, or the scalar at `fromField` in `object`
fn resolve(value: &ValueOrFromField, object: &Value, field: &str) -> Result<String> {
    if !value.value.is_empty() {
        return Ok(value.value.clone());
    }
    let path = FieldPath::parse(&value.from_field)?;
    path.get_string(object)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            let name = object
                .get("metadata")
                .and_then(|m| m.get("name"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            PorchError::invalid_field(
                KIND,
                "",
                format!("{field}.fromField"),
                format!("{path} does not resolve to a value in {name}"),
            )
        })
}
