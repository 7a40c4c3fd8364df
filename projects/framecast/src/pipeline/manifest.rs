// Buffer directory manifest
//
// Every buffer directory carries a small `manifest.json` naming the
// (source, target) pair it was filled for, so tools can list and check
// buffers without knowing the original paths.

use crate::error::{FramecastError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BufferManifest {
    pub source: String,
    pub target: String,
    pub frames_count: u64,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub buffer_dir: PathBuf,
}

/// Writes the manifest unless one with the same frame count already exists.
pub fn write_manifest(
    buffer_dir: &Path,
    source: &str,
    target: &str,
    frames_count: u64,
) -> Result<BufferManifest> {
    if let Some(existing) = read_manifest(buffer_dir)? {
        if existing.frames_count == frames_count {
            return Ok(existing);
        }
    }

    let manifest = BufferManifest {
        source: source.to_string(),
        target: target.to_string(),
        frames_count,
        created_at: Utc::now(),
        buffer_dir: buffer_dir.to_path_buf(),
    };

    let path = buffer_dir.join(MANIFEST_FILE);
    let content = serde_json::to_string_pretty(&manifest)?;
    fs::write(&path, content).map_err(|e| FramecastError::io(&path, e))?;

    Ok(manifest)
}

pub fn read_manifest(buffer_dir: &Path) -> Result<Option<BufferManifest>> {
    let path = buffer_dir.join(MANIFEST_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path).map_err(|e| FramecastError::io(&path, e))?;
    let mut manifest: BufferManifest = serde_json::from_str(&content)?;
    manifest.buffer_dir = buffer_dir.to_path_buf();
    Ok(Some(manifest))
}

/// Lists every buffer under `<temp_dir>/preview/<target>/<source>/`.
pub fn list_buffers(temp_dir: &Path) -> Result<Vec<BufferManifest>> {
    let preview_root = temp_dir.join(super::buffer::PREVIEW_DIR);
    let mut buffers = Vec::new();

    if !preview_root.exists() {
        return Ok(buffers);
    }

    for entry in WalkDir::new(&preview_root)
        .min_depth(2)
        .max_depth(2)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
    {
        match read_manifest(entry.path()) {
            Ok(Some(manifest)) => buffers.push(manifest),
            Ok(None) => {}
            Err(e) => tracing::warn!("Skipping unreadable manifest in {:?}: {}", entry.path(), e),
        }
    }

    Ok(buffers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_round_trip_and_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_manifest(dir.path(), "source.jpg", "target.mp4", 10).unwrap();
        let again = write_manifest(dir.path(), "source.jpg", "target.mp4", 10).unwrap();
        assert_eq!(first.created_at, again.created_at);

        let read = read_manifest(dir.path()).unwrap().unwrap();
        assert_eq!(read.target, "target.mp4");
        assert_eq!(read.frames_count, 10);
        assert_eq!(read.buffer_dir, dir.path());
    }

    #[test]
    fn test_list_buffers_finds_nested_manifests() {
        let temp = tempfile::tempdir().unwrap();
        let a = temp.path().join("preview").join("target.mp4").join("a.jpg");
        let b = temp.path().join("preview").join("target.mp4").join("b.jpg");
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();
        write_manifest(&a, "a.jpg", "target.mp4", 10).unwrap();

        let buffers = list_buffers(temp.path()).unwrap();
        assert_eq!(buffers.len(), 1);
        assert_eq!(buffers[0].source, "a.jpg");
    }

    #[test]
    fn test_list_buffers_without_preview_dir() {
        let temp = tempfile::tempdir().unwrap();
        assert!(list_buffers(temp.path()).unwrap().is_empty());
    }
}
