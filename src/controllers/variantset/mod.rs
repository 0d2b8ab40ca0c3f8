//! PackageVariantSet objects
//!
//! A set fans one upstream out to many downstreams. Its targets are
//! unrolled into downstream packages and each becomes a PackageVariant
//! named `<set>-<hash>`, where the hash covers the variant's spec. Variants
//! carry the `packagevariantset` label with the set's UID; the reconciler
//! creates the missing ones and deletes those no longer wanted.

mod unroll;
mod validation;

pub use unroll::unroll;
pub use validation::validate;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::cluster::{ClusterStore, Object, ObjectKey};
use super::packagevariant::{
    AdoptionPolicy, DeletionPolicy, PackageVariant, PackageVariantSpec, UpstreamPackage,
};
use super::runtime::Reconciler;
use crate::api::Porch;
use crate::api::objects::CONFIG_API_VERSION;
use crate::cancel::CancellationToken;
use crate::error::{ErrorKind, PorchError, Result};
use crate::git::refs::parse_lock_ref;
use crate::model::meta::set_condition;
use crate::model::{Condition, ObjectMeta, OwnerReference};

pub const PACKAGE_VARIANT_SET_KIND: &str = "PackageVariantSet";

/// Label on generated variants carrying the owning set's UID
pub const SET_LABEL: &str = "packagevariantset";

const FINALIZER: &str = "config.porch.kpt.dev/packagevariantsets";
const ADOPTION_POLICIES: [&str; 2] = ["adoptNone", "adoptExisting"];
const DELETION_POLICIES: [&str; 2] = ["delete", "orphan"];
const HASH_LEN: usize = 12;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageName {
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<PackageName>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub revision: String,
    /// `<package>/<revision>` tag, as an alternative to `revision`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
}

/// A literal or a field path read from the target object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueOrFromField {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from_field: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageTarget {
    #[serde(default)]
    pub repo: String,
    /// Downstream package name; the upstream's when empty
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryTarget {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_name: Option<ValueOrFromField>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSelector {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectsTarget {
    #[serde(default)]
    pub selectors: Vec<ObjectSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_name: Option<ValueOrFromField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_name: Option<ValueOrFromField>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<PackageTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repositories: Option<RepositoryTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objects: Option<ObjectsTarget>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageVariantSetSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<UpstreamSpec>,
    #[serde(default)]
    pub targets: Vec<Target>,
    /// `adoptNone` (default) or `adoptExisting`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub adoption_policy: String,
    /// `delete` (default) or `orphan`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deletion_policy: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageVariantSetStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageVariantSet {
    #[serde(default = "api_version")]
    pub api_version: String,
    #[serde(default = "kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PackageVariantSetSpec,
    #[serde(default)]
    pub status: PackageVariantSetStatus,
}

impl PackageVariantSet {
    pub fn new(namespace: &str, name: &str, spec: PackageVariantSetSpec) -> Self {
        Self {
            api_version: api_version(),
            kind: kind(),
            metadata: ObjectMeta::named(namespace, name),
            spec,
            status: PackageVariantSetStatus::default(),
        }
    }
}

impl Object for PackageVariantSet {
    const KIND: &'static str = PACKAGE_VARIANT_SET_KIND;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Name of the variant generated for `spec` by set `set`
pub fn variant_name(set: &str, spec: &PackageVariantSpec) -> Result<String> {
    let canonical = serde_json::to_string(spec)?;
    let hash = blake3::hash(canonical.as_bytes()).to_hex();
    Ok(format!("{set}-{}", &hash.as_str()[..HASH_LEN]))
}

/// Keeps the generated variants of each set in step with its targets
pub struct VariantSetReconciler {
    porch: Arc<Porch>,
    cluster: Arc<ClusterStore>,
}

impl VariantSetReconciler {
    pub fn new(porch: Arc<Porch>, cluster: Arc<ClusterStore>) -> Self {
        Self { porch, cluster }
    }

    /// Variants the set should have, keyed by name
    fn desired(&self, set: &PackageVariantSet) -> Result<BTreeMap<String, PackageVariantSpec>> {
        validate(&set.spec).into_result(PACKAGE_VARIANT_SET_KIND, &set.metadata.name)?;
        let Some(upstream) = &set.spec.upstream else {
            return Err(PorchError::internal("validated set without upstream"));
        };
        let Some(package) = &upstream.package else {
            return Err(PorchError::internal("validated set without upstream package"));
        };
        let revision = upstream_revision(upstream, &package.name, &set.metadata.name)?;
        let adoption_policy = match set.spec.adoption_policy.as_str() {
            "adoptExisting" => AdoptionPolicy::AdoptExisting,
            _ => AdoptionPolicy::AdoptNone,
        };
        let deletion_policy = match set.spec.deletion_policy.as_str() {
            "orphan" => DeletionPolicy::Orphan,
            _ => DeletionPolicy::Delete,
        };

        let namespace = &set.metadata.namespace;
        let repositories = self.porch.list_repositories(namespace);
        let mut desired = BTreeMap::new();
        for downstream in unroll(&set.spec, &package.name, namespace, &repositories, &self.cluster)? {
            let spec = PackageVariantSpec {
                upstream: Some(UpstreamPackage {
                    repo: package.repo.clone(),
                    package: package.name.clone(),
                    revision: revision.clone(),
                }),
                downstream: Some(downstream),
                adoption_policy,
                deletion_policy,
                ..PackageVariantSpec::default()
            };
            desired.insert(variant_name(&set.metadata.name, &spec)?, spec);
        }
        Ok(desired)
    }

    fn converge(&self, set: &PackageVariantSet) -> Result<usize> {
        let desired = self.desired(set)?;
        let namespace = &set.metadata.namespace;
        let existing: BTreeSet<String> = self
            .owned_variants(set)
            .into_iter()
            .map(|v| v.metadata.name)
            .collect();

        for (name, spec) in &desired {
            if existing.contains(name) {
                continue;
            }
            let mut variant = PackageVariant::new(namespace, name, spec.clone());
            variant
                .metadata
                .labels
                .insert(SET_LABEL.to_string(), set.metadata.uid.clone());
            variant.metadata.owner_references.push(owner_reference(set));
            match self.cluster.variants.create(variant) {
                Ok(_) => tracing::info!(set = %set.metadata.name, variant = %name, "created package variant"),
                Err(e) if e.kind() == ErrorKind::Conflict && set.spec.adoption_policy == "adoptExisting" => {
                    self.adopt(set, name)?;
                }
                Err(e) => return Err(e),
            }
        }

        for name in existing.iter().filter(|n| !desired.contains_key(*n)) {
            self.cluster.variants.delete(&ObjectKey::new(namespace.clone(), name.clone()))?;
            tracing::info!(set = %set.metadata.name, variant = %name, "deleted package variant");
        }
        Ok(desired.len())
    }

    /// Take over a same-named variant that no set owns
    fn adopt(&self, set: &PackageVariantSet, name: &str) -> Result<()> {
        let key = ObjectKey::new(set.metadata.namespace.clone(), name);
        let Some(mut variant) = self.cluster.variants.get(&key) else {
            return Ok(());
        };
        if variant.metadata.labels.contains_key(SET_LABEL) {
            return Err(PorchError::AlreadyExists {
                kind: super::packagevariant::PACKAGE_VARIANT_KIND.to_string(),
                name: key.to_string(),
            });
        }
        variant
            .metadata
            .labels
            .insert(SET_LABEL.to_string(), set.metadata.uid.clone());
        variant.metadata.owner_references.push(owner_reference(set));
        self.cluster.variants.update(variant)?;
        tracing::info!(set = %set.metadata.name, variant = %name, "adopted package variant");
        Ok(())
    }

    fn owned_variants(&self, set: &PackageVariantSet) -> Vec<PackageVariant> {
        self.cluster
            .variants
            .list(&set.metadata.namespace)
            .into_iter()
            .filter(|v| v.metadata.labels.get(SET_LABEL) == Some(&set.metadata.uid))
            .collect()
    }

    fn finalize(&self, mut set: PackageVariantSet) -> Result<()> {
        for variant in self.owned_variants(&set) {
            if set.spec.deletion_policy == "orphan" {
                let mut orphan = variant;
                orphan.metadata.labels.remove(SET_LABEL);
                orphan.metadata.owner_references.retain(|r| r.uid != set.metadata.uid);
                orphan.metadata.resource_version.clear();
                self.cluster.variants.update(orphan)?;
            } else {
                self.cluster.variants.delete(&ObjectKey::of(&variant.metadata))?;
            }
        }
        set.metadata.finalizers.retain(|f| f != FINALIZER);
        set.metadata.resource_version.clear();
        self.cluster.variant_sets.update(set)?;
        Ok(())
    }
}

impl Reconciler for VariantSetReconciler {
    fn kind(&self) -> &'static str {
        PACKAGE_VARIANT_SET_KIND
    }

    fn keys(&self) -> Vec<ObjectKey> {
        self.cluster.variant_sets.keys()
    }

    fn reconcile(&self, key: &ObjectKey, token: &CancellationToken) -> Result<()> {
        token.check("reconcile package variant set")?;
        let Some(mut set) = self.cluster.variant_sets.get(key) else {
            return Ok(());
        };
        if set.metadata.deletion_timestamp.is_some() {
            return self.finalize(set);
        }
        if !set.metadata.finalizers.iter().any(|f| f == FINALIZER) {
            set.metadata.finalizers.push(FINALIZER.to_string());
            set.metadata.resource_version.clear();
            set = self.cluster.variant_sets.update(set)?;
        }
        let count = self.converge(&set)?;
        self.cluster.variant_sets.update_status(key, |s| {
            let message = format!("{count} package variants");
            set_condition(&mut s.status.conditions, Condition::new("Ready", true, "NoErrors", message));
        })
    }

    fn record_failure(&self, key: &ObjectKey, error: &PorchError) {
        let condition = Condition::new("Ready", false, error.kind().reason(), error.to_string());
        if let Err(e) = self
            .cluster
            .variant_sets
            .update_status(key, |s| set_condition(&mut s.status.conditions, condition))
        {
            tracing::debug!(%key, error = %e, "could not record failure");
        }
    }
}

/// Revision named by `revision`, or the revision part of `tag`
fn upstream_revision(upstream: &UpstreamSpec, package: &str, set: &str) -> Result<String> {
    if !upstream.revision.is_empty() {
        return Ok(upstream.revision.clone());
    }
    if !upstream.tag.contains('/') {
        return Ok(upstream.tag.clone());
    }
    let locked = parse_lock_ref(&upstream.tag)?;
    if locked.draft || locked.package != package {
        return Err(PorchError::invalid_field(
            PACKAGE_VARIANT_SET_KIND,
            set,
            "spec.upstream.tag",
            format!("tag {} does not name a published revision of {package}", upstream.tag),
        ));
    }
    Ok(locked.revision)
}

fn owner_reference(set: &PackageVariantSet) -> OwnerReference {
    OwnerReference {
        api_version: CONFIG_API_VERSION.to_string(),
        kind: PACKAGE_VARIANT_SET_KIND.to_string(),
        name: set.metadata.name.clone(),
        uid: set.metadata.uid.clone(),
        controller: Some(true),
    }
}

fn api_version() -> String {
    CONFIG_API_VERSION.to_string()
}

fn kind() -> String {
    PACKAGE_VARIANT_SET_KIND.to_string()
}
