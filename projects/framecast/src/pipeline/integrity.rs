// Buffer integrity check: zero-byte files and holes in the stored range.

use crate::error::{FramecastError, Result};
use crate::pipeline::buffer::FrameBuffer;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct IntegrityReport {
    pub buffer_dir: PathBuf,
    /// Indices whose file exists but is empty.
    pub zero_sized: Vec<u64>,
    /// Indices in `[1, max stored]` with no stored frame.
    pub missing_in_range: Vec<u64>,
    pub stored: u64,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.zero_sized.is_empty()
    }
}

pub fn check(buffer: &FrameBuffer) -> Result<IntegrityReport> {
    let dir = buffer.path();
    let mut zero_sized = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| FramecastError::io(dir, e))? {
        let entry = entry.map_err(|e| FramecastError::io(dir, e))?;
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("png") {
            continue;
        }
        let Some(index) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| buffer.index_of_stem(s))
        else {
            continue;
        };
        let len = entry
            .metadata()
            .map_err(|e| FramecastError::io(&path, e))?
            .len();
        if len == 0 {
            zero_sized.push(index);
        }
    }
    zero_sized.sort_unstable();

    let indices = buffer.indices();
    let stored = indices.len() as u64;
    let missing_in_range = match indices.last() {
        Some(&max) => (1..=max).filter(|i| !buffer.has(*i)).collect(),
        None => Vec::new(),
    };

    Ok(IntegrityReport {
        buffer_dir: dir.to_path_buf(),
        zero_sized,
        missing_in_range,
        stored,
    })
}

/// Deletes zero-byte files so they are recomputed. Returns how many were
/// removed.
pub fn repair(buffer: &FrameBuffer, report: &IntegrityReport) -> Result<usize> {
    let mut removed = 0;
    for &index in &report.zero_sized {
        let present = buffer.frame_path(index).exists();
        buffer.remove(index)?;
        if present {
            removed += 1;
        }
    }
    if removed > 0 {
        tracing::info!("Integrity: removed {} empty frames from {:?}", removed, buffer.path());
    }
    Ok(removed)
}
