//! Sidecar management, atomic finalization, and transient cleanup

use crate::disk_writer::part_path;
use crate::error::{DiskError, Result};
use crate::types::SidecarMetadata;
use std::path::{Path, PathBuf};

/// Path of the sidecar metadata file for a destination
pub fn meta_path(dest: &Path) -> PathBuf {
    suffixed(dest, ".meta")
}

/// Path of the scratch file for a destination
pub fn tmp_path(dest: &Path) -> PathBuf {
    suffixed(dest, ".tmp")
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

/// Write the sidecar next to the destination. Happens before any payload
/// bytes flow, so an observer always finds the metadata first.
pub async fn write_sidecar(meta: &SidecarMetadata) -> Result<()> {
    let path = meta_path(&meta.dest);
    let json = serde_json::to_vec_pretty(meta)?;
    tokio::fs::write(&path, json).await?;
    Ok(())
}

/// Read a sidecar for an observed artifact, if one exists.
pub async fn read_sidecar(dest: &Path) -> Option<SidecarMetadata> {
    let raw = tokio::fs::read(meta_path(dest)).await.ok()?;
    serde_json::from_slice(&raw).ok()
}

/// Fsync the part file and atomically rename it into place.
///
/// The rename is the only way `dest` ever appears, so a reader sees either
/// absence or the complete, fsync'd payload.
pub async fn finalize(dest: &Path) -> Result<()> {
    let part = part_path(dest);
    let file = tokio::fs::OpenOptions::new().write(true).open(&part).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&part, dest)
        .await
        .map_err(|e| DiskError::FinalizeFailed {
            path: dest.to_path_buf(),
            source: e,
        })?;
    Ok(())
}

/// Remove every transient sibling of `dest` (`.part`, `.tmp`, `.meta`).
///
/// Idempotent: missing files are fine, and failures downgrade to warnings
/// so cleanup can never mask the download's own outcome.
pub async fn cleanup_transients(dest: &Path) {
    for path in [part_path(dest), tmp_path(dest), meta_path(dest)] {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => tracing::debug!(path = %path.display(), "Removed transient file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove transient file")
            }
        }
    }
}
