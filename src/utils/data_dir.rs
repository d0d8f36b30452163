//! Global data directory for persistent storage.
//!
//! Defaults to `~/.peerlink/` but can be overridden via `--data-dir`.
//! Initialized once at startup; library callers that never initialize it
//! get the default.

use crate::core::config::DATA_DIR_NAME;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

fn default_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(DATA_DIR_NAME)
}

/// Set the global data directory. Returns `false` if it was already set.
pub fn init(custom: Option<&Path>) -> bool {
    let dir = custom.map(Path::to_path_buf).unwrap_or_else(default_dir);
    DATA_DIR.set(dir).is_ok()
}

/// The global data directory path.
pub fn get() -> &'static Path {
    DATA_DIR.get_or_init(default_dir)
}
