//! Super-resolution collaborator
//!
//! When a tile is displayed larger than its source region, the engine can ask
//! an [`Upscaler`] for a higher-detail buffer before resampling to the exact
//! target. Model inference lives outside this crate; [`ResampleUpscaler`] is a
//! plain interpolating stand-in.

use image::imageops;
use image::RgbaImage;
use thiserror::Error;

use crate::image_rs::ResampleKernel;
use crate::pixels::{PixelBuffer, RgbaPixels, SharedPixels};

/// Errors from an upscaler
#[derive(Debug, Error)]
pub enum UpscaleError {
    #[error("upscaler does not accept this input: {0}")]
    UnsupportedInput(String),

    #[error("upscaler failed: {0}")]
    Failed(String),
}

/// Blocking upscale of one tile, run on a worker thread
pub trait Upscaler: Send + Sync {
    fn upscale(&self, input: &dyn PixelBuffer) -> Result<SharedPixels, UpscaleError>;

    /// Short name used in log lines
    fn name(&self) -> &str {
        "upscaler"
    }
}

/// Enlarges by a fixed integer factor with an interpolating kernel
#[derive(Debug, Clone, Copy)]
pub struct ResampleUpscaler {
    factor: u32,
    kernel: ResampleKernel,
}

impl ResampleUpscaler {
    pub fn new(factor: u32) -> Self {
        Self {
            factor: factor.max(1),
            kernel: ResampleKernel::CatmullRom,
        }
    }

    pub fn with_kernel(mut self, kernel: ResampleKernel) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn factor(&self) -> u32 {
        self.factor
    }
}

impl Upscaler for ResampleUpscaler {
    fn upscale(&self, input: &dyn PixelBuffer) -> Result<SharedPixels, UpscaleError> {
        let bytes = input.as_rgba8().ok_or_else(|| {
            UpscaleError::UnsupportedInput("pixels are not resident in memory".to_string())
        })?;
        let source = RgbaImage::from_raw(input.width(), input.height(), bytes.to_vec())
            .ok_or_else(|| UpscaleError::UnsupportedInput("pixel length mismatch".to_string()))?;

        let width = input.width().checked_mul(self.factor);
        let height = input.height().checked_mul(self.factor);
        let (Some(width), Some(height)) = (width, height) else {
            return Err(UpscaleError::Failed(format!(
                "{}x{} times {} overflows",
                input.width(),
                input.height(),
                self.factor
            )));
        };

        let upscaled = imageops::resize(&source, width, height, self.kernel.filter_type());
        RgbaPixels::new(width, height, upscaled.into_raw())
            .map(RgbaPixels::into_shared)
            .ok_or_else(|| UpscaleError::Failed("resampled buffer has wrong length".to_string()))
    }

    fn name(&self) -> &str {
        "resample"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_upscaler_multiplies_dimensions() {
        let upscaler = ResampleUpscaler::new(3);
        let input = RgbaPixels::filled(4, 2, [10, 20, 30, 255]);
        let output = upscaler.upscale(&input).unwrap();
        assert_eq!((output.width(), output.height()), (12, 6));
        assert_eq!(&output.as_rgba8().unwrap()[..4], &[10, 20, 30, 255]);
    }

    #[test]
    fn test_zero_factor_is_identity() {
        let upscaler = ResampleUpscaler::new(0);
        assert_eq!(upscaler.factor(), 1);
    }
}
