//! Process-wide per-path locks.
//!
//! Two jobs touching the same file (the same bundle signed twice
//! concurrently, or a bundle and one of its binaries) serialize their whole
//! read, patch, sign and write cycle on the file's lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

type Registry = Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>;

static LOCKS: OnceLock<Registry> = OnceLock::new();

/// Lock for `path`, keyed by its canonical form when it exists.
pub(crate) fn path_lock(path: &Path) -> Arc<Mutex<()>> {
    let key = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let mut registry = LOCKS
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner);

    // Drop entries nobody holds any more.
    registry.retain(|_, lock| Arc::strong_count(lock) > 1);
    registry.entry(key).or_default().clone()
}
