//! BLAKE3 content hashes for package resources
//!
//! Dir-backed revisions are locked by the hash of their files, computed over
//! sorted `(path, content)` pairs so the result does not depend on
//! filesystem iteration order.

use std::path::Path;

use blake3::Hasher;
use walkdir::WalkDir;

use crate::error::{PorchError, Result};
use crate::model::Resources;

/// Hash of a package's resources as 64 lowercase hex characters
pub fn hash_resources(resources: &Resources) -> String {
    let mut hasher = Hasher::new();
    for (path, content) in resources {
        hasher.update(path.as_bytes());
        hasher.update(b"\0");
        hasher.update(content.as_bytes());
        hasher.update(b"\0");
    }
    hasher.finalize().to_hex().to_string()
}

/// Read every regular file below `root` into a resource map
///
/// Paths are relative to `root` with `/` separators. Entries whose name
/// starts with `.porch` are sidecar bookkeeping and are skipped, as is
/// anything listed in `skip_dirs`.
pub fn read_tree(root: &Path, skip_dirs: &[&str]) -> Result<Resources> {
    if !root.is_dir() {
        return Err(PorchError::FileNotFound {
            path: root.display().to_string(),
        });
    }

    let mut resources = Resources::new();
    let walker = WalkDir::new(root).into_iter().filter_entry(|e| {
        let name = e.file_name().to_string_lossy();
        e.depth() == 0 || !(name.starts_with(".porch") || skip_dirs.contains(&name.as_ref()))
    });
    for entry in walker {
        let entry = entry.map_err(|e| PorchError::IoError {
            message: e.to_string(),
        })?;
        if entry.file_type().is_symlink() {
            tracing::warn!(path = %entry.path().display(), "ignoring symlink");
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| PorchError::internal(e.to_string()))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let content = std::fs::read(entry.path())
            .map_err(|e| crate::file_error_context!("Failed to read", entry.path().display(), e))?;
        resources.insert(relative, String::from_utf8_lossy(&content).into_owned());
    }
    Ok(resources)
}

/// Replace the contents of `root` with `resources`
///
/// Sidecar files (`.porch*`) at the top level are preserved.
pub fn write_tree(root: &Path, resources: &Resources) -> Result<()> {
    if root.exists() {
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(".porch") {
                continue;
            }
            let path = entry.path();
            if path.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }
    }
    std::fs::create_dir_all(root)?;
    for (relative, content) in resources {
        crate::resources::validate_path(relative)?;
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)
            .map_err(|e| crate::file_error_context!("Failed to write", path.display(), e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Resources {
        [
            ("Kptfile".to_string(), "kind: Kptfile\n".to_string()),
            ("sub/cm.yaml".to_string(), "kind: ConfigMap\n".to_string()),
        ]
        .into()
    }

    #[test]
    fn test_hash_is_hex_and_stable() {
        let hash = hash_resources(&sample());
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, hash_resources(&sample()));
    }

    #[test]
    fn test_hash_changes_with_content() {
        let mut other = sample();
        other.insert("Kptfile".to_string(), "kind: Other\n".to_string());
        assert_ne!(hash_resources(&sample()), hash_resources(&other));
    }

    #[test]
    fn test_write_then_read_tree() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("pkg");
        write_tree(&root, &sample()).unwrap();
        std::fs::write(root.join(".porch-revision.yaml"), "x").unwrap();
        assert_eq!(read_tree(&root, &[]).unwrap(), sample());
    }

    #[test]
    fn test_write_tree_removes_stale_files() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("pkg");
        write_tree(&root, &sample()).unwrap();
        let mut smaller = sample();
        smaller.remove("sub/cm.yaml");
        write_tree(&root, &smaller).unwrap();
        assert!(!root.join("sub").exists());
        assert_eq!(read_tree(&root, &[]).unwrap(), smaller);
    }

    #[test]
    fn test_read_missing_dir() {
        assert!(read_tree(Path::new("/nonexistent/porch"), &[]).is_err());
    }
}
