use super::{Extracted, FrameHandler, HandlerKind};
use crate::error::{FramecastError, Result};
use crate::frame::NumberedFrame;
use std::path::{Path, PathBuf};

/// A still image: one frame at 1 fps.
#[derive(Debug, Clone)]
pub struct ImageHandler {
    path: PathBuf,
    resolution: (u32, u32),
}

impl ImageHandler {
    pub fn open(path: &Path) -> Result<Self> {
        let resolution = image::image_dimensions(path).map_err(|e| {
            FramecastError::decode(format!("cannot read image header of {:?}: {}", path, e))
        })?;
        tracing::info!(
            "ImageHandler: opened {:?} ({}x{})",
            path,
            resolution.0,
            resolution.1
        );
        Ok(Self {
            path: path.to_path_buf(),
            resolution,
        })
    }
}

impl FrameHandler for ImageHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Image
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn fps(&self) -> f64 {
        1.0
    }

    fn frame_count(&self) -> u64 {
        1
    }

    fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    fn extract_frame(&self, index: u64) -> Result<Extracted> {
        if let Some(out) = self.out_of_range(index) {
            return Ok(out);
        }
        let img = image::open(&self.path)
            .map_err(|e| FramecastError::decode(format!("{:?}: {}", self.path, e)))?;
        Ok(Extracted::Frame(
            NumberedFrame::new(index, img.to_rgb8()).with_frame_time(1.0),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_single_frame_image() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("target.png");
        RgbImage::from_pixel(861, 1080, Rgb([1, 2, 3]))
            .save(&path)
            .unwrap();

        let handler = ImageHandler::open(&path).unwrap();
        assert_eq!(handler.resolution(), (861, 1080));
        assert_eq!(handler.frame_count(), 1);
        assert_eq!(handler.frame_time(), 1.0);

        let nf = handler.extract_frame(1).unwrap().into_result().unwrap();
        assert_eq!(nf.shape(), (1080, 861, 3));
        assert!(matches!(
            handler.extract_frame(2).unwrap(),
            Extracted::OutOfRange {
                index: 2,
                frames_count: 1
            }
        ));
    }

    #[test]
    fn test_broken_image_is_a_decode_error() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("broken.png");
        std::fs::write(&path, b"nope").unwrap();
        assert!(matches!(
            ImageHandler::open(&path),
            Err(FramecastError::Decode(_))
        ));
    }
}
