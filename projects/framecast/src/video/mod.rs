// Frame handlers: decoders producing raw frames by 1-based index

pub mod directory_handler;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg_handler;
pub mod image_handler;
pub mod pattern;
pub mod prepare;

use crate::error::{FramecastError, Result};
use crate::frame::NumberedFrame;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

pub use directory_handler::DirectoryHandler;
pub use image_handler::ImageHandler;
pub use pattern::PatternHandler;

pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "webp", "tif", "tiff"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    Image,
    Directory,
    Video,
    Pattern,
}

/// Result of asking a handler for a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Extracted {
    Frame(NumberedFrame),
    OutOfRange { index: u64, frames_count: u64 },
}

impl Extracted {
    pub fn into_result(self) -> Result<NumberedFrame> {
        match self {
            Extracted::Frame(nf) => Ok(nf),
            Extracted::OutOfRange {
                index,
                frames_count,
            } => Err(FramecastError::OutOfRange {
                index,
                frames_count,
            }),
        }
    }
}

pub trait FrameHandler: Send + Sync {
    fn kind(&self) -> HandlerKind;
    fn path(&self) -> &Path;
    fn fps(&self) -> f64;
    fn frame_count(&self) -> u64;
    /// `(width, height)`
    fn resolution(&self) -> (u32, u32);
    fn extract_frame(&self, index: u64) -> Result<Extracted>;

    fn frame_time(&self) -> f64 {
        let fps = self.fps();
        if fps > 0.0 {
            1.0 / fps
        } else {
            1.0
        }
    }

    fn length_secs(&self) -> f64 {
        self.frame_count() as f64 * self.frame_time()
    }

    /// `Some(OutOfRange)` when `index` is outside `[1, frame_count]`.
    fn out_of_range(&self, index: u64) -> Option<Extracted> {
        let frames_count = self.frame_count();
        (index == 0 || index > frames_count).then_some(Extracted::OutOfRange {
            index,
            frames_count,
        })
    }
}

pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| IMAGE_EXTENSIONS.contains(&s.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Picks a handler by what `path` is: a directory of PNGs, a still image,
/// a `pattern:` test source or, with the `ffmpeg` feature, a video.
pub fn open_handler(path: &Path) -> Result<Arc<dyn FrameHandler>> {
    if let Some(desc) = path.to_str().and_then(|s| s.strip_prefix(pattern::SCHEME)) {
        return Ok(Arc::new(PatternHandler::parse(desc)?));
    }
    if !path.exists() {
        return Err(FramecastError::invalid(format!(
            "target {:?} does not exist",
            path
        )));
    }
    if path.is_dir() {
        return Ok(Arc::new(DirectoryHandler::open(path, 1.0)?));
    }
    if is_image(path) {
        return Ok(Arc::new(ImageHandler::open(path)?));
    }
    open_video(path)
}

#[cfg(feature = "ffmpeg")]
fn open_video(path: &Path) -> Result<Arc<dyn FrameHandler>> {
    Ok(Arc::new(ffmpeg_handler::VideoHandler::open(path)?))
}

#[cfg(not(feature = "ffmpeg"))]
fn open_video(path: &Path) -> Result<Arc<dyn FrameHandler>> {
    Err(FramecastError::invalid(format!(
        "{:?} looks like a video; rebuild with the `ffmpeg` feature to open it",
        path
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use std::path::PathBuf;

    #[test]
    fn test_open_handler_dispatch() {
        let temp = tempfile::tempdir().unwrap();
        let image_path = temp.path().join("target.png");
        RgbImage::new(8, 6).save(&image_path).unwrap();

        let handler = open_handler(&image_path).unwrap();
        assert_eq!(handler.kind(), HandlerKind::Image);
        assert_eq!(handler.frame_count(), 1);

        let handler = open_handler(temp.path()).unwrap();
        assert_eq!(handler.kind(), HandlerKind::Directory);

        let handler = open_handler(Path::new("pattern:640x360@10:10")).unwrap();
        assert_eq!(handler.kind(), HandlerKind::Pattern);
        assert_eq!(handler.resolution(), (640, 360));
    }

    #[test]
    fn test_open_handler_missing_target() {
        let err = open_handler(&PathBuf::from("/definitely/not/here.png"))
            .err()
            .unwrap();
        assert!(matches!(err, FramecastError::InvalidArgument(_)));
    }

    #[test]
    fn test_out_of_range_bounds() {
        let handler = PatternHandler::new(4, 4, 10.0, 10);
        assert!(handler.out_of_range(0).is_some());
        assert!(handler.out_of_range(1).is_none());
        assert!(handler.out_of_range(10).is_none());
        assert_eq!(
            handler.out_of_range(11),
            Some(Extracted::OutOfRange {
                index: 11,
                frames_count: 10
            })
        );
        assert!((handler.frame_time() - 0.1).abs() < 1e-9);
        assert!((handler.length_secs() - 1.0).abs() < 1e-9);
    }
}
