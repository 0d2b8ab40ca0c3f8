//! Reading and writing package trees
//!
//! A package is a directory inside a commit tree. Reading flattens the
//! directory into a `path -> content` map; writing replaces that directory
//! inside a base tree while preserving everything else.

use std::collections::BTreeMap;
use std::path::Path;

use git2::{ObjectType, Oid, Repository, Tree, TreeWalkMode, TreeWalkResult};

use crate::error::{PorchError, Result};

const FILE_MODE: i32 = 0o100_644;
const DIR_MODE: i32 = 0o040_000;

/// Subtree at `dir`, or `None` when the directory does not exist
pub fn subtree<'r>(repo: &'r Repository, tree: &Tree<'r>, dir: &str) -> Result<Option<Tree<'r>>> {
    if dir.is_empty() {
        return Ok(Some(tree.clone()));
    }
    let entry = match tree.get_path(Path::new(dir)) {
        Ok(entry) => entry,
        Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if entry.kind() != Some(ObjectType::Tree) {
        return Ok(None);
    }
    Ok(Some(repo.find_tree(entry.id())?))
}

/// Flatten the files below `dir` into a map keyed by path relative to `dir`
pub fn read_files(repo: &Repository, tree: &Tree<'_>, dir: &str) -> Result<BTreeMap<String, String>> {
    let Some(root) = subtree(repo, tree, dir)? else {
        return Ok(BTreeMap::new());
    };

    let mut blobs: Vec<(String, Oid)> = Vec::new();
    root.walk(TreeWalkMode::PreOrder, |parent, entry| {
        if entry.kind() == Some(ObjectType::Blob) {
            if let Some(name) = entry.name() {
                blobs.push((format!("{parent}{name}"), entry.id()));
            }
        }
        TreeWalkResult::Ok
    })?;

    let mut files = BTreeMap::new();
    for (path, oid) in blobs {
        let blob = repo.find_blob(oid)?;
        files.insert(path, String::from_utf8_lossy(blob.content()).into_owned());
    }
    Ok(files)
}

/// Names of the immediate subdirectories of `dir`
pub fn list_dirs(repo: &Repository, tree: &Tree<'_>, dir: &str) -> Result<Vec<String>> {
    let Some(root) = subtree(repo, tree, dir)? else {
        return Ok(Vec::new());
    };
    Ok(root
        .iter()
        .filter(|e| e.kind() == Some(ObjectType::Tree))
        .filter_map(|e| e.name().map(ToString::to_string))
        .collect())
}

/// Write `files` as a nested tree; `None` when there are no files
pub fn write_files(repo: &Repository, files: &BTreeMap<String, String>) -> Result<Option<Oid>> {
    let mut blobs: Vec<(&str, Oid)> = Vec::new();
    let mut dirs: BTreeMap<&str, BTreeMap<String, String>> = BTreeMap::new();

    for (path, content) in files {
        let path = path.trim_start_matches('/');
        match path.split_once('/') {
            Some((dir, rest)) if !dir.is_empty() => {
                dirs.entry(dir)
                    .or_default()
                    .insert(rest.to_string(), content.clone());
            }
            Some(_) => {
                return Err(PorchError::ParseFailed {
                    path: path.to_string(),
                    reason: "empty path component".to_string(),
                });
            }
            None if path.is_empty() => {}
            None => blobs.push((path, repo.blob(content.as_bytes())?)),
        }
    }

    if blobs.is_empty() && dirs.is_empty() {
        return Ok(None);
    }

    let mut builder = repo.treebuilder(None)?;
    for (name, oid) in blobs {
        builder.insert(name, oid, FILE_MODE)?;
    }
    for (name, children) in &dirs {
        if let Some(oid) = write_files(repo, children)? {
            builder.insert(name, oid, DIR_MODE)?;
        }
    }
    Ok(Some(builder.write()?))
}

/// Replace the directory `dir` inside `base` with `files`
///
/// The rest of `base` is preserved. An empty `files` map removes the
/// directory. Returns the id of the new root tree.
pub fn replace_dir(
    repo: &Repository,
    base: Option<&Tree<'_>>,
    dir: &str,
    files: &BTreeMap<String, String>,
) -> Result<Oid> {
    let content = write_files(repo, files)?;
    let components: Vec<&str> = dir.split('/').filter(|c| !c.is_empty()).collect();
    match splice(repo, base, &components, content)? {
        Some(oid) => Ok(oid),
        None => Ok(repo.treebuilder(None)?.write()?),
    }
}

fn splice(
    repo: &Repository,
    base: Option<&Tree<'_>>,
    components: &[&str],
    content: Option<Oid>,
) -> Result<Option<Oid>> {
    let Some((first, rest)) = components.split_first() else {
        return Ok(content);
    };

    let child = match base.and_then(|b| b.get_name(first)) {
        Some(entry) if entry.kind() == Some(ObjectType::Tree) => Some(repo.find_tree(entry.id())?),
        _ => None,
    };
    let replaced = splice(repo, child.as_ref(), rest, content)?;

    let mut builder = repo.treebuilder(base)?;
    match replaced {
        Some(oid) => {
            builder.insert(first, oid, DIR_MODE)?;
        }
        None => {
            if builder.get(first)?.is_some() {
                builder.remove(first)?;
            }
        }
    }
    if builder.is_empty() {
        return Ok(None);
    }
    Ok(Some(builder.write()?))
}
