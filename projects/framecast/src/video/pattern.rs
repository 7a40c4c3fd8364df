// Synthetic target: `pattern:<W>x<H>@<FPS>:<COUNT>`
//
// Generates deterministic gradient frames with no decoding cost. Useful for
// benchmarking the scheduler and for running the pipeline without media.

use super::{Extracted, FrameHandler, HandlerKind};
use crate::error::{FramecastError, Result};
use crate::frame::NumberedFrame;
use image::{Rgb, RgbImage};
use std::path::{Path, PathBuf};

pub const SCHEME: &str = "pattern:";

#[derive(Debug, Clone)]
pub struct PatternHandler {
    path: PathBuf,
    width: u32,
    height: u32,
    fps: f64,
    frame_count: u64,
}

impl PatternHandler {
    pub fn new(width: u32, height: u32, fps: f64, frame_count: u64) -> Self {
        Self {
            path: PathBuf::from(format!("{SCHEME}{width}x{height}@{fps}:{frame_count}")),
            width,
            height,
            fps,
            frame_count,
        }
    }

    /// Parses the part after `pattern:`, e.g. `640x360@10:10`.
    pub fn parse(desc: &str) -> Result<Self> {
        let invalid = || {
            FramecastError::invalid(format!(
                "bad pattern target '{desc}', expected <W>x<H>@<FPS>:<COUNT>"
            ))
        };
        let (size, rest) = desc.split_once('@').ok_or_else(invalid)?;
        let (width, height) = size.split_once('x').ok_or_else(invalid)?;
        let (fps, count) = rest.split_once(':').ok_or_else(invalid)?;

        let width: u32 = width.parse().map_err(|_| invalid())?;
        let height: u32 = height.parse().map_err(|_| invalid())?;
        let fps: f64 = fps.parse().map_err(|_| invalid())?;
        let frame_count: u64 = count.parse().map_err(|_| invalid())?;

        if width == 0 || height == 0 || fps <= 0.0 || frame_count == 0 {
            return Err(invalid());
        }
        Ok(Self::new(width, height, fps, frame_count))
    }

    /// Red channel of pixel (0, 0) carries `index % 256`.
    pub fn render(&self, index: u64) -> RgbImage {
        let shift = (index * 7) as u32;
        let mut img = RgbImage::from_fn(self.width, self.height, |x, y| {
            Rgb([
                ((x + shift) % 256) as u8,
                ((y + shift) % 256) as u8,
                ((x + y) % 256) as u8,
            ])
        });
        img.put_pixel(0, 0, Rgb([(index % 256) as u8, 0, 0]));
        img
    }
}

impl FrameHandler for PatternHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Pattern
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn frame_count(&self) -> u64 {
        self.frame_count
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn extract_frame(&self, index: u64) -> Result<Extracted> {
        if let Some(out) = self.out_of_range(index) {
            return Ok(out);
        }
        Ok(Extracted::Frame(
            NumberedFrame::new(index, self.render(index)).with_frame_time(self.frame_time()),
        ))
    }
}
