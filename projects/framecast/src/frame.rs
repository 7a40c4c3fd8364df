// Frame types shared by handlers, transforms, the buffer and the player.

use image::imageops::FilterType;
use image::RgbImage;

/// An 8-bit RGB pixel buffer, shape `(height, width, 3)`.
pub type Frame = RgbImage;

/// A frame tagged with its 1-based position inside a target.
#[derive(Debug, Clone, PartialEq)]
pub struct NumberedFrame {
    pub index: u64,
    pub frame: Frame,
    /// Overrides the zero-padded index as the buffer file name.
    pub name: Option<String>,
    pub frame_time: Option<f64>,
}

impl NumberedFrame {
    pub fn new(index: u64, frame: Frame) -> Self {
        Self {
            index,
            frame,
            name: None,
            frame_time: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_frame_time(mut self, frame_time: f64) -> Self {
        self.frame_time = Some(frame_time);
        self
    }

    /// `(height, width, channels)`
    pub fn shape(&self) -> (u32, u32, u32) {
        frame_shape(&self.frame)
    }

    pub fn map_frame(self, f: impl FnOnce(Frame) -> Frame) -> Self {
        Self {
            frame: f(self.frame),
            ..self
        }
    }
}

/// `(height, width, channels)` of a frame.
pub fn frame_shape(frame: &Frame) -> (u32, u32, u32) {
    (frame.height(), frame.width(), 3)
}

/// Width and height a frame of `resolution` is rendered at for `quality`
/// percent. Never collapses an axis to zero.
pub fn render_resolution(resolution: (u32, u32), quality: u8) -> (u32, u32) {
    let quality = quality.clamp(1, 100) as u64;
    let scale = |v: u32| ((v as u64 * quality) / 100).max(1) as u32;
    (scale(resolution.0), scale(resolution.1))
}

/// Proportionally resizes a frame to `quality` percent of its size.
pub fn scale_quality(frame: Frame, quality: u8) -> Frame {
    if quality >= 100 {
        return frame;
    }
    let (w, h) = render_resolution((frame.width(), frame.height()), quality);
    if (w, h) == (frame.width(), frame.height()) {
        return frame;
    }
    image::imageops::resize(&frame, w, h, FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_render_resolution_scales_proportionally() {
        assert_eq!(render_resolution((640, 360), 100), (640, 360));
        assert_eq!(render_resolution((640, 360), 50), (320, 180));
        assert_eq!(render_resolution((861, 1080), 10), (86, 108));
    }

    #[test]
    fn test_render_resolution_never_zero() {
        assert_eq!(render_resolution((3, 2), 1), (1, 1));
        assert_eq!(render_resolution((640, 360), 0), (6, 3));
    }

    #[test]
    fn test_scale_quality_keeps_full_quality_untouched() {
        let frame = RgbImage::from_pixel(8, 4, Rgb([10, 20, 30]));
        let scaled = scale_quality(frame.clone(), 100);
        assert_eq!(scaled, frame);

        let half = scale_quality(frame, 50);
        assert_eq!(frame_shape(&half), (2, 4, 3));
    }

    #[test]
    fn test_numbered_frame_builders() {
        let nf = NumberedFrame::new(3, RgbImage::new(4, 2))
            .with_name("0003")
            .with_frame_time(0.1);
        assert_eq!(nf.shape(), (2, 4, 3));
        assert_eq!(nf.name.as_deref(), Some("0003"));
        assert_eq!(nf.frame_time, Some(0.1));
    }
}
