//! Write-to-temp-then-rename for the transfer-state slot and received files.
//!
//! Invariants:
//! - Content lands in a sibling `.tmp` file first, then a rename replaces the
//!   target, so readers never observe a half-written slot.
//! - On rename failure the temp file is removed.
//! - Parent directories are created if absent.

use std::path::{Path, PathBuf};
use tracing::error;

/// Sibling temp path: `name.ext` becomes `name.ext.tmp`.
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Atomically replace `path` with `content`.
pub fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = temp_path(path);

    std::fs::write(&tmp_path, content).map_err(|e| {
        error!(
            event = "atomic_write_failure",
            path = %tmp_path.display(),
            error = %e,
            "Failed to write temp file"
        );
        e
    })?;

    std::fs::rename(&tmp_path, path).map_err(|e| {
        error!(
            event = "atomic_rename_failure",
            from = %tmp_path.display(),
            to = %path.display(),
            error = %e,
            "Failed to rename temp file"
        );
        let _ = std::fs::remove_file(&tmp_path);
        e
    })
}
