// Frame preparation: extracts every raw frame of a target to PNG once so
// later random access is a file read instead of a decoder seek.

use super::{DirectoryHandler, Extracted, FrameHandler};
use crate::error::{FramecastError, Result};
use crate::pipeline::buffer::zfill_width;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::{Path, PathBuf};

pub const FRAMES_DIR: &str = "frames";

/// `<temp>/frames/<basename(target)>`
pub fn prepared_dir(temp_dir: &Path, target_id: &str) -> PathBuf {
    temp_dir.join(FRAMES_DIR).join(target_id)
}

fn progress_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} extracting ({per_sec:.1.yellow}, {eta})")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

/// Writes frames `1..=frame_count` of `handler` into `dir`, skipping files
/// that already exist, and returns a directory handler over them.
pub fn prepare_frames(handler: &dyn FrameHandler, dir: &Path) -> Result<DirectoryHandler> {
    fs::create_dir_all(dir).map_err(|e| FramecastError::io(dir, e))?;

    let frame_count = handler.frame_count();
    let width = zfill_width(frame_count);
    let pb = progress_bar(frame_count);
    let mut written = 0u64;

    for index in 1..=frame_count {
        let path = dir.join(format!("{:0width$}.png", index, width = width));
        let present = fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);
        if !present {
            match handler.extract_frame(index)? {
                Extracted::Frame(nf) => {
                    nf.frame.save(&path)?;
                    written += 1;
                }
                Extracted::OutOfRange { .. } => break,
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    tracing::info!(
        "Prepared {} frames of {:?} into {:?} ({} newly extracted)",
        frame_count,
        handler.path(),
        dir,
        written
    );

    DirectoryHandler::open(dir, handler.fps())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::PatternHandler;

    #[test]
    fn test_prepare_frames_builds_directory_handler() {
        let temp = tempfile::tempdir().unwrap();
        let source = PatternHandler::new(8, 6, 10.0, 12);
        let dir = prepared_dir(temp.path(), "target.mp4");

        let prepared = prepare_frames(&source, &dir).unwrap();
        assert_eq!(prepared.frame_count(), 12);
        assert_eq!(prepared.fps(), 10.0);
        assert!(dir.join("01.png").exists());
        assert!(dir.join("12.png").exists());

        let nf = prepared.extract_frame(5).unwrap().into_result().unwrap();
        assert_eq!(nf.frame, source.render(5));
    }

    #[test]
    fn test_prepare_frames_keeps_existing_files() {
        let temp = tempfile::tempdir().unwrap();
        let source = PatternHandler::new(8, 6, 10.0, 3);
        let dir = prepared_dir(temp.path(), "target.mp4");
        prepare_frames(&source, &dir).unwrap();

        let before = fs::metadata(dir.join("2.png")).unwrap().modified().unwrap();
        prepare_frames(&source, &dir).unwrap();
        let after = fs::metadata(dir.join("2.png")).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }
}
