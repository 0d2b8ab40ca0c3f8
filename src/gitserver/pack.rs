//! Packfile encoding and ingestion
//!
//! Outgoing packs hold every object reachable from the wanted tips as a
//! full zlib-deflated entry, without deltas. Incoming packs are handed to
//! the object database's indexer, which resolves deltas against objects
//! already stored.

use std::collections::HashSet;
use std::io::Write;

use flate2::Compression;
use flate2::write::ZlibEncoder;
use git2::{ObjectType, Oid, Repository};
use sha1::{Digest, Sha1};

use crate::error::{PorchError, Result};

/// Objects reachable from `tips`, parents before the trees they point at
pub fn reachable(repo: &Repository, tips: &[Oid]) -> Result<Vec<Oid>> {
    let mut seen = HashSet::new();
    let mut order = Vec::new();
    let mut walk = repo.revwalk()?;
    let mut has_commits = false;

    for tip in tips {
        let mut id = *tip;
        loop {
            let object = repo.find_object(id, None)?;
            match object.kind() {
                Some(ObjectType::Tag) => {
                    if seen.insert(id) {
                        order.push(id);
                    }
                    id = repo.find_tag(id)?.target_id();
                }
                Some(ObjectType::Commit) => {
                    walk.push(id)?;
                    has_commits = true;
                    break;
                }
                Some(ObjectType::Tree) => {
                    add_tree(repo, id, &mut seen, &mut order)?;
                    break;
                }
                _ => {
                    if seen.insert(id) {
                        order.push(id);
                    }
                    break;
                }
            }
        }
    }

    if has_commits {
        for commit in walk {
            let commit = repo.find_commit(commit?)?;
            if seen.insert(commit.id()) {
                order.push(commit.id());
            }
            add_tree(repo, commit.tree_id(), &mut seen, &mut order)?;
        }
    }
    Ok(order)
}

fn add_tree(repo: &Repository, id: Oid, seen: &mut HashSet<Oid>, order: &mut Vec<Oid>) -> Result<()> {
    if !seen.insert(id) {
        return Ok(());
    }
    order.push(id);
    let tree = repo.find_tree(id)?;
    for entry in &tree {
        match entry.kind() {
            Some(ObjectType::Tree) => add_tree(repo, entry.id(), seen, order)?,
            Some(ObjectType::Blob) => {
                if seen.insert(entry.id()) {
                    order.push(entry.id());
                }
            }
            // gitlinks point into other repositories
            _ => {}
        }
    }
    Ok(())
}

/// Encode `objects` as a version 2 packfile
pub fn write_pack(repo: &Repository, objects: &[Oid]) -> Result<Vec<u8>> {
    let odb = repo.odb()?;
    let count = u32::try_from(objects.len())
        .map_err(|_| PorchError::internal("too many objects for one pack"))?;

    let mut out = Vec::new();
    out.extend_from_slice(b"PACK");
    out.extend_from_slice(&2u32.to_be_bytes());
    out.extend_from_slice(&count.to_be_bytes());

    for id in objects {
        let object = odb.read(*id)?;
        let code = match object.kind() {
            ObjectType::Commit => 1,
            ObjectType::Tree => 2,
            ObjectType::Blob => 3,
            ObjectType::Tag => 4,
            other => return Err(PorchError::internal(format!("cannot pack {other} object {id}"))),
        };
        write_header(&mut out, code, object.data().len());
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(object.data())?;
        out.extend_from_slice(&encoder.finish()?);
    }

    let checksum = Sha1::digest(&out);
    out.extend_from_slice(&checksum);
    Ok(out)
}

/// Type and inflated size, little-endian base-128 after the first nibble
fn write_header(out: &mut Vec<u8>, code: u8, size: usize) {
    #[allow(clippy::cast_possible_truncation)]
    let mut byte = (code << 4) | (size & 0x0f) as u8;
    let mut size = size >> 4;
    while size > 0 {
        out.push(byte | 0x80);
        #[allow(clippy::cast_possible_truncation)]
        {
            byte = (size & 0x7f) as u8;
        }
        size >>= 7;
    }
    out.push(byte);
}

/// Store every object of `pack` in `repo`
pub fn unpack(repo: &Repository, pack: &[u8]) -> Result<()> {
    if pack.is_empty() {
        return Ok(());
    }
    let odb = repo.odb()?;
    let mut writer = odb.packwriter()?;
    writer.write_all(pack)?;
    writer.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn commit_files(repo: &Repository, files: &[(&str, &str)]) -> Oid {
        let mut index = git2::Index::new().unwrap();
        for (path, content) in files {
            let blob = repo.blob(content.as_bytes()).unwrap();
            let entry = git2::IndexEntry {
                ctime: git2::IndexTime::new(0, 0),
                mtime: git2::IndexTime::new(0, 0),
                dev: 0,
                ino: 0,
                mode: 0o100_644,
                uid: 0,
                gid: 0,
                file_size: 0,
                id: blob,
                flags: 0,
                flags_extended: 0,
                path: path.as_bytes().to_vec(),
            };
            index.add(&entry).unwrap();
        }
        let tree = repo.find_tree(index.write_tree_to(repo).unwrap()).unwrap();
        let sig = git2::Signature::now("test", "test@example.com").unwrap();
        repo.commit(Some("refs/heads/main"), &sig, &sig, "init", &tree, &[])
            .unwrap()
    }

    #[test]
    fn test_header_encodes_large_sizes() {
        let mut out = Vec::new();
        write_header(&mut out, 3, 10);
        assert_eq!(out, vec![0x3a]);

        out.clear();
        write_header(&mut out, 1, 300);
        // 300 = 0b1_0010_1100: low nibble 0xc, then 0b1_0010 = 18
        assert_eq!(out, vec![0x80 | 0x10 | 0x0c, 18]);
    }

    #[test]
    fn test_reachable_walks_nested_trees() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init_bare(dir.path()).unwrap();
        let head = commit_files(&repo, &[("Kptfile", "kind: Kptfile\n"), ("app/deploy.yaml", "kind: Deployment\n")]);
        let objects = reachable(&repo, &[head]).unwrap();
        // commit, root tree, app tree, two blobs
        assert_eq!(objects.len(), 5);
        assert_eq!(objects[0], head);
    }

    #[test]
    fn test_pack_is_readable_by_another_repository() {
        let src_dir = TempDir::new().unwrap();
        let src = Repository::init_bare(src_dir.path()).unwrap();
        let head = commit_files(&src, &[("Kptfile", "kind: Kptfile\n")]);
        let pack = write_pack(&src, &reachable(&src, &[head]).unwrap()).unwrap();

        let dst_dir = TempDir::new().unwrap();
        let dst = Repository::init_bare(dst_dir.path()).unwrap();
        unpack(&dst, &pack).unwrap();
        let commit = dst.find_commit(head).unwrap();
        assert_eq!(commit.message(), Some("init"));
        assert!(commit.tree().unwrap().get_name("Kptfile").is_some());
    }
}
