//! PackageVariant objects
//!
//! A PackageVariant declares that package `downstream.package` in
//! repository `downstream.repo` tracks revision `upstream.revision` of
//! `upstream.package` in `upstream.repo`. [`DownstreamReconciler`] keeps
//! the downstream revisions it owns in step with that declaration.

mod downstream;

pub use downstream::DownstreamReconciler;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::cluster::Object;
use crate::api::objects::CONFIG_API_VERSION;
use crate::error::FieldErrors;
use crate::model::{Condition, ObjectMeta, OwnerReference};

pub const PACKAGE_VARIANT_KIND: &str = "PackageVariant";

/// Held on every PackageVariant until its downstreams are cleaned up
pub const FINALIZER: &str = "config.porch.kpt.dev/packagevariants";

/// Whether downstream revisions without an owner are taken over
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AdoptionPolicy {
    #[default]
    AdoptNone,
    AdoptExisting,
}

/// What happens to owned downstream revisions when the owner goes away
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeletionPolicy {
    #[default]
    Delete,
    Orphan,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamPackage {
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub package: String,
    #[serde(default)]
    pub revision: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownstreamPackage {
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub package: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageVariantSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<UpstreamPackage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downstream: Option<DownstreamPackage>,
    #[serde(default)]
    pub adoption_policy: AdoptionPolicy,
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
    /// Labels put on downstream revisions this variant creates
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownstreamTarget {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageVariantStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub downstream_targets: Vec<DownstreamTarget>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageVariant {
    #[serde(default = "api_version")]
    pub api_version: String,
    #[serde(default = "kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PackageVariantSpec,
    #[serde(default)]
    pub status: PackageVariantStatus,
}

impl PackageVariant {
    pub fn new(namespace: &str, name: &str, spec: PackageVariantSpec) -> Self {
        Self {
            api_version: api_version(),
            kind: kind(),
            metadata: ObjectMeta::named(namespace, name),
            spec,
            status: PackageVariantStatus::default(),
        }
    }

    /// Owner reference pointing at this variant
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: CONFIG_API_VERSION.to_string(),
            kind: PACKAGE_VARIANT_KIND.to_string(),
            name: self.metadata.name.clone(),
            uid: self.metadata.uid.clone(),
            controller: Some(true),
        }
    }
}

impl Object for PackageVariant {
    const KIND: &'static str = PACKAGE_VARIANT_KIND;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

pub fn validate(spec: &PackageVariantSpec) -> FieldErrors {
    let mut errors = FieldErrors::new();
    match &spec.upstream {
        None => errors.push("spec.upstream", "upstream is required"),
        Some(upstream) => {
            for (field, value) in [
                ("spec.upstream.repo", &upstream.repo),
                ("spec.upstream.package", &upstream.package),
                ("spec.upstream.revision", &upstream.revision),
            ] {
                if value.is_empty() {
                    errors.push(field, "value is required");
                }
            }
        }
    }
    match &spec.downstream {
        None => errors.push("spec.downstream", "downstream is required"),
        Some(downstream) => {
            if downstream.repo.is_empty() {
                errors.push("spec.downstream.repo", "value is required");
            }
            if downstream.package.is_empty() {
                errors.push("spec.downstream.package", "value is required");
            }
        }
    }
    errors
}

fn api_version() -> String {
    CONFIG_API_VERSION.to_string()
}

fn kind() -> String {
    PACKAGE_VARIANT_KIND.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_reports_every_missing_field() {
        let spec = PackageVariantSpec {
            upstream: Some(UpstreamPackage {
                repo: "blueprints".to_string(),
                ..UpstreamPackage::default()
            }),
            ..PackageVariantSpec::default()
        };
        let errors = validate(&spec);
        assert!(errors.contains_field("spec.upstream.package"));
        assert!(errors.contains_field("spec.upstream.revision"));
        assert!(errors.contains_field("spec.downstream"));
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_policies_parse_from_yaml() {
        let yaml = "adoptionPolicy: adoptExisting\ndeletionPolicy: orphan\n";
        let spec: PackageVariantSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.adoption_policy, AdoptionPolicy::AdoptExisting);
        assert_eq!(spec.deletion_policy, DeletionPolicy::Orphan);
    }
}
