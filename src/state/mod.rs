// src/state/mod.rs
//! Durable relay state: per-checker cursors and governance snapshots.

pub mod cursor;
pub mod snapshot;

pub use cursor::{CursorKey, CursorStore};
pub use snapshot::{Snapshot, SnapshotCache, SnapshotDiff};

use anyhow::{Context, Result};
use std::path::Path;

/// Write `bytes` next to `path` and rename over it, so a concurrent reader
/// sees either the old file or the new one.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating state dir {}", dir.display()))?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}
