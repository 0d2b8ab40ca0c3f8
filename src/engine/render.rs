//! Kptfile pipeline rendering
//!
//! Packages are rendered depth-first: every sub-package runs its own
//! pipeline before its parent, and a parent's functions see the already
//! rendered sub-package resources. Mutators replace the package's
//! documents; validators only get to fail the render.

use serde_yaml::Value;

use super::function::{FunctionRuntime, config_map, run_function};
use crate::cancel::CancellationToken;
use crate::error::{PorchError, Result, ResultExt};
use crate::model::kptfile::{Function, KPTFILE_NAME};
use crate::model::{Kptfile, Resources};
use crate::resources;

/// Render every pipeline in `resources`
pub fn render(resources: &Resources, runtime: &dyn FunctionRuntime, token: &CancellationToken) -> Result<Resources> {
    let mut packages: Vec<String> = resources
        .keys()
        .filter_map(|path| package_dir_of_kptfile(path))
        .collect();
    // Deepest packages first.
    packages.sort_by_key(|dir| std::cmp::Reverse(depth(dir)));

    let mut current = resources.clone();
    for dir in packages {
        token.check("render")?;
        let Some(kptfile) = Kptfile::from_resources(&current, &dir)? else {
            continue;
        };
        let pipeline = kptfile.pipeline();
        if pipeline.is_empty() {
            continue;
        }
        current = render_package(&current, &dir, &pipeline.mutators, &pipeline.validators, runtime, token)
            .with_context(|| format!("rendering package '{}'", display_dir(&dir)))?;
    }
    Ok(current)
}

fn render_package(
    resources: &Resources,
    dir: &str,
    mutators: &[Function],
    validators: &[Function],
    runtime: &dyn FunctionRuntime,
    token: &CancellationToken,
) -> Result<Resources> {
    let (inside, mut outside) = split_at_dir(resources, dir);
    let parsed = resources::parse_package(&inside);
    let mut docs = parsed.docs;
    for function in mutators {
        let config = function_config(function, &inside, dir)?;
        docs = run_function(runtime, &function.image, config, &docs, token)?;
    }
    for function in validators {
        let config = function_config(function, &inside, dir)?;
        run_function(runtime, &function.image, config, &docs, token)?;
    }
    outside.extend(parsed.opaque);
    outside.extend(resources::write_documents(&docs)?);
    Ok(outside)
}

fn function_config(function: &Function, resources: &Resources, dir: &str) -> Result<Option<Value>> {
    if let Some(path) = &function.config_path {
        let full = if dir.is_empty() { path.clone() } else { format!("{dir}/{path}") };
        let content = resources.get(&full).ok_or_else(|| PorchError::FunctionFailed {
            image: function.image.clone(),
            reason: format!("config file {full} not found"),
        })?;
        return Ok(Some(serde_yaml::from_str(content)?));
    }
    if function.config_map.is_empty() {
        Ok(None)
    } else {
        Ok(Some(config_map(&function.config_map)))
    }
}

/// Split files into those under `dir` and the rest
fn split_at_dir(resources: &Resources, dir: &str) -> (Resources, Resources) {
    if dir.is_empty() {
        return (resources.clone(), Resources::new());
    }
    let prefix = format!("{dir}/");
    resources
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .partition(|(path, _)| path.starts_with(&prefix))
}

fn package_dir_of_kptfile(path: &str) -> Option<String> {
    if path == KPTFILE_NAME {
        return Some(String::new());
    }
    path.strip_suffix(&format!("/{KPTFILE_NAME}")).map(ToString::to_string)
}

fn depth(dir: &str) -> usize {
    if dir.is_empty() { 0 } else { dir.split('/').count() }
}

fn display_dir(dir: &str) -> &str {
    if dir.is_empty() { "." } else { dir }
}
