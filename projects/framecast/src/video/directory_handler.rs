use super::{Extracted, FrameHandler, HandlerKind};
use crate::error::{FramecastError, Result};
use crate::frame::NumberedFrame;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// A directory of `.png` frames, ordered by file name.
#[derive(Debug, Clone)]
pub struct DirectoryHandler {
    path: PathBuf,
    files: Vec<PathBuf>,
    fps: f64,
    resolution: (u32, u32),
}

pub fn list_png_files(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|s| s.to_str())
                .map(|s| s.to_lowercase() == "png")
                .unwrap_or(false)
        })
        .map(|e| e.path().to_path_buf())
        .collect()
}

impl DirectoryHandler {
    pub fn open(dir: &Path, fps: f64) -> Result<Self> {
        let files = list_png_files(dir);
        let resolution = match files.first() {
            Some(first) => image::image_dimensions(first).map_err(|e| {
                FramecastError::decode(format!("cannot read image header of {:?}: {}", first, e))
            })?,
            None => {
                return Err(FramecastError::invalid(format!(
                    "directory {:?} holds no .png frames",
                    dir
                )))
            }
        };

        tracing::info!(
            "DirectoryHandler: opened {:?}, frames={}, fps={:.2}, {}x{}",
            dir,
            files.len(),
            fps,
            resolution.0,
            resolution.1
        );

        Ok(Self {
            path: dir.to_path_buf(),
            files,
            fps: if fps > 0.0 { fps } else { 1.0 },
            resolution,
        })
    }
}

impl FrameHandler for DirectoryHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Directory
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn frame_count(&self) -> u64 {
        self.files.len() as u64
    }

    fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    fn extract_frame(&self, index: u64) -> Result<Extracted> {
        if let Some(out) = self.out_of_range(index) {
            return Ok(out);
        }
        let file = &self.files[(index - 1) as usize];
        let img = image::open(file)
            .map_err(|e| FramecastError::decode(format!("{:?}: {}", file, e)))?;
        // The buffer keys frames by index, so the source file name stays here.
        let nf = NumberedFrame::new(index, img.to_rgb8()).with_frame_time(self.frame_time());
        Ok(Extracted::Frame(nf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_frames_ordered_by_name() {
        let temp = tempfile::tempdir().unwrap();
        for (name, shade) in [("03", 30u8), ("01", 10), ("02", 20)] {
            RgbImage::from_pixel(4, 3, Rgb([shade, 0, 0]))
                .save(temp.path().join(format!("{name}.png")))
                .unwrap();
        }
        std::fs::write(temp.path().join("readme.txt"), b"x").unwrap();

        let handler = DirectoryHandler::open(temp.path(), 25.0).unwrap();
        assert_eq!(handler.frame_count(), 3);
        assert_eq!(handler.resolution(), (4, 3));
        assert_eq!(handler.fps(), 25.0);

        let nf = handler.extract_frame(2).unwrap().into_result().unwrap();
        assert_eq!(nf.frame.get_pixel(0, 0), &Rgb([20, 0, 0]));
        assert_eq!(nf.index, 2);
        assert_eq!(nf.name, None);
        assert!(handler.extract_frame(4).unwrap().into_result().is_err());
    }

    #[test]
    fn test_empty_directory_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        assert!(matches!(
            DirectoryHandler::open(temp.path(), 1.0),
            Err(FramecastError::InvalidArgument(_))
        ));
    }
}
