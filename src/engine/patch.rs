//! File patches between resource maps

use crate::error::{PorchError, Result};
use crate::model::Resources;
use crate::model::task::{FilePatch, PatchTask, PatchType};
use crate::resources::validate_path;

/// Patch turning `old` into `new`; `None` when they are equal
pub fn compute_patch(old: &Resources, new: &Resources) -> Option<PatchTask> {
    let mut patches = Vec::new();
    for (path, content) in new {
        match old.get(path) {
            None => patches.push(FilePatch {
                file: path.clone(),
                contents: content.clone(),
                patch_type: PatchType::CreateFile,
            }),
            Some(previous) if previous != content => patches.push(FilePatch {
                file: path.clone(),
                contents: diffy::create_patch(previous, content).to_string(),
                patch_type: PatchType::PatchFile,
            }),
            Some(_) => {}
        }
    }
    for path in old.keys().filter(|p| !new.contains_key(*p)) {
        patches.push(FilePatch {
            file: path.clone(),
            contents: String::new(),
            patch_type: PatchType::DeleteFile,
        });
    }
    (!patches.is_empty()).then_some(PatchTask { patches })
}

/// Apply a patch task to a resource map
pub fn apply_patch(resources: &mut Resources, task: &PatchTask) -> Result<()> {
    for patch in &task.patches {
        validate_path(&patch.file)?;
        let failed = |reason: String| PorchError::PatchFailed {
            file: patch.file.clone(),
            reason,
        };
        match patch.patch_type {
            PatchType::CreateFile => {
                if resources.contains_key(&patch.file) {
                    return Err(failed("file already exists".to_string()));
                }
                resources.insert(patch.file.clone(), patch.contents.clone());
            }
            PatchType::DeleteFile => {
                if resources.remove(&patch.file).is_none() {
                    return Err(failed("file does not exist".to_string()));
                }
            }
            PatchType::PatchFile => {
                let current = resources
                    .get(&patch.file)
                    .ok_or_else(|| failed("file does not exist".to_string()))?;
                let diff = diffy::Patch::from_str(&patch.contents)
                    .map_err(|e| failed(format!("invalid unified diff: {e}")))?;
                let patched = diffy::apply(current, &diff).map_err(|e| failed(e.to_string()))?;
                resources.insert(patch.file.clone(), patched);
            }
        }
    }
    Ok(())
}
