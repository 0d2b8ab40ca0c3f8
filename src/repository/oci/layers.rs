//! Package layers: deterministic gzip-compressed tarballs of a file map

use std::io::{Read, Write};
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use tar::{EntryType, Header};

use crate::error::{PorchError, Result};
use crate::model::Resources;

pub const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// `sha256:<hex>` digest of `data`
pub fn digest_of(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Pack resources into a gzip tarball with zeroed metadata
pub fn pack(resources: &Resources) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, content) in resources {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(0o644);
        header.set_size(content.len() as u64);
        builder.append_data(&mut header, Path::new(path), content.as_bytes())?;
    }
    builder.finish()?;
    let tar_bytes = builder.into_inner()?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar_bytes)?;
    Ok(encoder.finish()?)
}

/// Unpack a layer into a file map
///
/// Only regular files are kept; links are skipped with a warning and
/// directories are implied by their files.
pub fn unpack(layer: &[u8]) -> Result<Resources> {
    let mut archive = tar::Archive::new(GzDecoder::new(layer));
    let mut resources = Resources::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().trim_start_matches("./").to_string();
        match entry.header().entry_type() {
            EntryType::Regular => {
                let mut content = String::new();
                entry.read_to_string(&mut content).map_err(|e| PorchError::ParseFailed {
                    path: path.clone(),
                    reason: format!("not UTF-8 text: {e}"),
                })?;
                resources.insert(path, content);
            }
            EntryType::Symlink | EntryType::Link => {
                tracing::warn!(path, "skipping link in package layer");
            }
            _ => {}
        }
    }
    Ok(resources)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_is_deterministic() {
        let resources: Resources = [
            ("Kptfile".to_string(), "kind: Kptfile\n".to_string()),
            ("sub/cm.yaml".to_string(), "kind: ConfigMap\n".to_string()),
        ]
        .into();
        let a = pack(&resources).unwrap();
        let b = pack(&resources).unwrap();
        assert_eq!(digest_of(&a), digest_of(&b));
        assert_eq!(unpack(&a).unwrap(), resources);
    }

    #[test]
    fn test_digest_format() {
        let digest = digest_of(b"");
        assert_eq!(
            digest,
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
