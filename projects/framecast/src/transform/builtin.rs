// Builtin transforms implemented with plain `image` operations.

use super::{FrameTransform, TransformRegistry};
use crate::error::Result;
use crate::frame::Frame;
use image::imageops;

const BLUR_SIGMA: f32 = 2.0;
const SHARPEN_SIGMA: f32 = 1.0;
const SHARPEN_THRESHOLD: i32 = 4;

pub fn register_builtins(registry: &mut TransformRegistry) {
    registry.register("Identity", |_| Ok(Box::new(Identity)));
    registry.register("Grayscale", |_| Ok(Box::new(Grayscale)));
    registry.register("Invert", |_| Ok(Box::new(Invert)));
    registry.register("Blur", |_| Ok(Box::new(Blur { sigma: BLUR_SIGMA })));
    registry.register("Sharpen", |_| {
        Ok(Box::new(Sharpen {
            sigma: SHARPEN_SIGMA,
            threshold: SHARPEN_THRESHOLD,
        }))
    });
}

pub struct Identity;

impl FrameTransform for Identity {
    fn name(&self) -> &str {
        "Identity"
    }

    fn apply(&self, frame: Frame) -> Result<Frame> {
        Ok(frame)
    }
}

pub struct Grayscale;

impl FrameTransform for Grayscale {
    fn name(&self) -> &str {
        "Grayscale"
    }

    fn apply(&self, frame: Frame) -> Result<Frame> {
        let gray = imageops::grayscale(&frame);
        Ok(image::DynamicImage::ImageLuma8(gray).to_rgb8())
    }
}

pub struct Invert;

impl FrameTransform for Invert {
    fn name(&self) -> &str {
        "Invert"
    }

    fn apply(&self, mut frame: Frame) -> Result<Frame> {
        imageops::invert(&mut frame);
        Ok(frame)
    }
}

pub struct Blur {
    sigma: f32,
}

impl FrameTransform for Blur {
    fn name(&self) -> &str {
        "Blur"
    }

    fn apply(&self, frame: Frame) -> Result<Frame> {
        Ok(imageops::blur(&frame, self.sigma))
    }
}

pub struct Sharpen {
    sigma: f32,
    threshold: i32,
}

impl FrameTransform for Sharpen {
    fn name(&self) -> &str {
        "Sharpen"
    }

    fn apply(&self, frame: Frame) -> Result<Frame> {
        Ok(imageops::unsharpen(&frame, self.sigma, self.threshold))
    }
}
