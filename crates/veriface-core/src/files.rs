//! Filesystem helpers shared by the pipeline stages.

use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// True if `path` has an extension in `allowed` (case-insensitive).
pub fn has_allowed_extension(path: &Path, allowed: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| allowed.iter().any(|a| a.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// Regular files directly under `dir` with an allowed image extension,
/// sorted by name so callers start from a stable order.
pub fn list_images(dir: &Path, allowed: &[String]) -> std::io::Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && has_allowed_extension(&path, allowed) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// Write `bytes` to `path` through a sibling temp file and a rename, so
/// readers never observe a partially written artifact. The temp file is
/// removed if any step fails.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
