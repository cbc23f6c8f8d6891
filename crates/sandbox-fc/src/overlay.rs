//! Per-VM writable overlay images.
//!
//! The guest merges the shared read-only squashfs base with this ext4 layer
//! via overlayfs. Sparse allocation keeps the host cost at actual usage
//! rather than the nominal 2 GiB.

use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("overlay creation failed: {0}")]
    Creation(String),
}

/// Nominal size of each overlay image.
const OVERLAY_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Create a sparse ext4 image at `path`.
pub async fn create_overlay(path: &Path) -> Result<(), OverlayError> {
    let display = path.display().to_string();

    tokio::fs::File::create(path)
        .await
        .map_err(|e| OverlayError::Creation(format!("create {display}: {e}")))?
        .set_len(OVERLAY_SIZE)
        .await
        .map_err(|e| OverlayError::Creation(format!("truncate {display}: {e}")))?;

    // Direct invocation: no shell between us and a configured path.
    let output = tokio::process::Command::new("mkfs.ext4")
        .args(["-F", "-q"])
        .arg(path)
        .output()
        .await
        .map_err(|e| OverlayError::Creation(format!("mkfs.ext4: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(OverlayError::Creation(format!(
            "mkfs.ext4 {display}: {}",
            stderr.trim()
        )));
    }
    Ok(())
}
