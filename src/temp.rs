//! Temp directory base
//!
//! Temp dirs are never created under the current working directory (e.g.
//! when TMPDIR=tmp).

use std::env;
use std::path::PathBuf;

/// Returns a directory path suitable for creating temporary directories.
/// Never returns a relative path.
pub fn temp_dir_base() -> PathBuf {
    let t = env::temp_dir();
    if t.is_absolute() {
        t
    } else {
        PathBuf::from("/tmp")
    }
}
