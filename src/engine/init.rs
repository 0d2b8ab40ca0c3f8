//! Init task: a fresh package with only a Kptfile

use chrono::{DateTime, Utc};
use sha1::{Digest, Sha1};

use crate::error::{FieldErrors, Result};
use crate::model::kptfile::{Inventory, PackageInfo};
use crate::model::task::InitTask;
use crate::model::{Kptfile, Resources};

/// Inventory id: SHA-1 of `namespace:name`, then the Unix-nano timestamp
pub fn inventory_id(namespace: &str, name: &str, at: DateTime<Utc>) -> Result<String> {
    let mut errors = FieldErrors::new();
    if namespace.trim().is_empty() {
        errors.push("spec.tasks.init.inventory.namespace", "namespace is required");
    }
    if name.trim().is_empty() {
        errors.push("spec.tasks.init.inventory.name", "name is required");
    }
    errors.into_result("Inventory", format!("{namespace}/{name}"))?;
    let digest = Sha1::digest(format!("{namespace}:{name}").as_bytes());
    let nanos = at.timestamp_nanos_opt().unwrap_or_default();
    Ok(format!("{}-{nanos}", hex::encode(digest)))
}

/// Resources of a new package named after the last path segment
pub fn init_package(package: &str, task: &InitTask) -> Result<Resources> {
    let name = package.rsplit('/').next().unwrap_or(package);
    let mut kptfile = Kptfile::new(name);
    if !task.description.is_empty() || !task.keywords.is_empty() || !task.site.is_empty() {
        kptfile.info = Some(PackageInfo {
            description: task.description.clone(),
            keywords: task.keywords.clone(),
            site: task.site.clone(),
            ..PackageInfo::default()
        });
    }
    if let Some(inventory) = &task.inventory {
        kptfile.inventory = Some(Inventory {
            namespace: inventory.namespace.clone(),
            name: inventory.name.clone(),
            inventory_id: inventory_id(&inventory.namespace, &inventory.name, Utc::now())?,
        });
    }
    let mut resources = Resources::new();
    kptfile.store(&mut resources, "")?;
    Ok(resources)
}
