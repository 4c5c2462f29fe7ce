//! [`ImageBackend`] implementation over the `image` crate
//!
//! Decoded images are held as RGBA8 in a handle table. Headers are probed with
//! `imagesize`, which reads only the first few bytes of the file.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use image::imageops::{self, FilterType};
use image::{ImageError, Rgba, Rgba32FImage, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::backend::{BackendResult, DecodeError, ImageBackend, RawHandle, RawImage};
use crate::geometry::{resize_dimensions, PixelRect, Resolution, SourceDimensions};
use crate::pixels::{PixelBuffer, RgbaPixels, SharedPixels};
use crate::source::ImageSource;

/// Resampling kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResampleKernel {
    Nearest,
    Linear,
    CatmullRom,
    Gaussian,
    Lanczos3,
}

impl ResampleKernel {
    pub fn filter_type(self) -> FilterType {
        match self {
            ResampleKernel::Nearest => FilterType::Nearest,
            ResampleKernel::Linear => FilterType::Triangle,
            ResampleKernel::CatmullRom => FilterType::CatmullRom,
            ResampleKernel::Gaussian => FilterType::Gaussian,
            ResampleKernel::Lanczos3 => FilterType::Lanczos3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResampleKernel::Nearest => "nearest",
            ResampleKernel::Linear => "linear",
            ResampleKernel::CatmullRom => "catmull-rom",
            ResampleKernel::Gaussian => "gaussian",
            ResampleKernel::Lanczos3 => "lanczos3",
        }
    }
}

impl fmt::Display for ResampleKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResampleKernel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nearest" => Ok(ResampleKernel::Nearest),
            "linear" | "bilinear" | "triangle" => Ok(ResampleKernel::Linear),
            "catmull-rom" | "catmullrom" | "bicubic" => Ok(ResampleKernel::CatmullRom),
            "gaussian" => Ok(ResampleKernel::Gaussian),
            "lanczos3" | "lanczos" => Ok(ResampleKernel::Lanczos3),
            other => Err(format!("unknown resample kernel '{}'", other)),
        }
    }
}

/// Kernels used when shrinking and when enlarging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResampleConfig {
    pub downscale: ResampleKernel,
    pub upscale: ResampleKernel,

    /// Average in linear light when shrinking, so fine high-contrast
    /// detail keeps its perceived brightness
    pub linear_light: bool,
}

impl Default for ResampleConfig {
    fn default() -> Self {
        Self {
            downscale: ResampleKernel::Lanczos3,
            upscale: ResampleKernel::CatmullRom,
            linear_light: false,
        }
    }
}

fn srgb_to_linear(value: u8) -> f32 {
    let c = value as f32 / 255.0;
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_to_srgb(value: f32) -> u8 {
    let c = value.clamp(0.0, 1.0);
    let encoded = if c <= 0.003_130_8 {
        c * 12.92
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    };
    (encoded * 255.0).round() as u8
}

/// Resample with the colour channels decoded to linear light. Alpha is
/// already linear and only rescaled to `[0, 1]`.
fn resize_linear_light(image: &RgbaImage, width: u32, height: u32, filter: FilterType) -> RgbaImage {
    let lut: Vec<f32> = (0..=255u8).map(srgb_to_linear).collect();
    let linear = Rgba32FImage::from_fn(image.width(), image.height(), |x, y| {
        let Rgba([r, g, b, a]) = *image.get_pixel(x, y);
        Rgba([
            lut[r as usize],
            lut[g as usize],
            lut[b as usize],
            a as f32 / 255.0,
        ])
    });
    let resized = imageops::resize(&linear, width, height, filter);
    RgbaImage::from_fn(width, height, |x, y| {
        let Rgba([r, g, b, a]) = *resized.get_pixel(x, y);
        Rgba([
            linear_to_srgb(r),
            linear_to_srgb(g),
            linear_to_srgb(b),
            (a.clamp(0.0, 1.0) * 255.0).round() as u8,
        ])
    })
}

/// Backend decoding with the `image` crate
pub struct ImageRsBackend {
    images: Mutex<HashMap<RawHandle, Arc<RgbaImage>>>,
    next_handle: AtomicU64,
    resample: ResampleConfig,
}

impl ImageRsBackend {
    pub fn new() -> Self {
        Self::with_resample(ResampleConfig::default())
    }

    pub fn with_resample(resample: ResampleConfig) -> Self {
        Self {
            images: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            resample,
        }
    }

    pub fn resample(&self) -> ResampleConfig {
        self.resample
    }

    /// Number of handles not yet released
    pub fn live_handles(&self) -> usize {
        self.images.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn insert(&self, image: RgbaImage) -> RawImage {
        let handle = RawHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let (width, height) = image.dimensions();
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, Arc::new(image));
        RawImage::new(handle, width, height)
    }

    fn get(&self, handle: RawHandle) -> BackendResult<Arc<RgbaImage>> {
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle)
            .cloned()
            .ok_or_else(|| DecodeError::CorruptData(format!("unknown image handle {}", handle.0)))
    }

    fn kernel_for(&self, source: Resolution, target: Resolution) -> FilterType {
        if target.exceeds(source) {
            self.resample.upscale.filter_type()
        } else {
            self.resample.downscale.filter_type()
        }
    }

    fn scale(&self, image: &RgbaImage, target: Resolution) -> RgbaImage {
        let source = Resolution::new(image.width(), image.height());
        let filter = self.kernel_for(source, target);
        if self.resample.linear_light && !target.exceeds(source) {
            resize_linear_light(image, target.width, target.height, filter)
        } else {
            imageops::resize(image, target.width, target.height, filter)
        }
    }
}

impl Default for ImageRsBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn map_image_error(err: ImageError) -> DecodeError {
    match err {
        ImageError::Unsupported(e) => DecodeError::UnsupportedFormat(e.to_string()),
        ImageError::Decoding(e) => DecodeError::CorruptData(e.to_string()),
        ImageError::Limits(e) => DecodeError::NativeAllocationFailure(e.to_string()),
        ImageError::IoError(e) => DecodeError::Io(e),
        other => DecodeError::CorruptData(other.to_string()),
    }
}

fn map_probe_error(err: imagesize::ImageError) -> DecodeError {
    match err {
        imagesize::ImageError::NotSupported => {
            DecodeError::UnsupportedFormat("unrecognised image header".to_string())
        }
        imagesize::ImageError::CorruptedImage => {
            DecodeError::CorruptData("truncated or malformed image header".to_string())
        }
        imagesize::ImageError::IoError(e) => DecodeError::Io(e),
        #[allow(unreachable_patterns)]
        other => DecodeError::CorruptData(other.to_string()),
    }
}

impl ImageBackend for ImageRsBackend {
    fn probe_dimensions(&self, source: &ImageSource) -> BackendResult<SourceDimensions> {
        let size = match source {
            ImageSource::Memory(bytes) => imagesize::blob_size(bytes),
            ImageSource::File(path) => imagesize::size(path),
        }
        .map_err(map_probe_error)?;

        let width = u32::try_from(size.width)
            .map_err(|_| DecodeError::CorruptData(format!("width {} out of range", size.width)))?;
        let height = u32::try_from(size.height)
            .map_err(|_| DecodeError::CorruptData(format!("height {} out of range", size.height)))?;
        if width == 0 || height == 0 {
            return Err(DecodeError::CorruptData(format!(
                "image header reports empty size {}x{}",
                width, height
            )));
        }
        Ok(SourceDimensions::new(width, height))
    }

    fn decode(&self, source: &ImageSource) -> BackendResult<RawImage> {
        let decoded = match source {
            ImageSource::Memory(bytes) => image::load_from_memory(bytes).map_err(map_image_error)?,
            ImageSource::File(path) => image::ImageReader::open(path)?
                .with_guessed_format()?
                .decode()
                .map_err(map_image_error)?,
        };
        Ok(self.insert(decoded.into_rgba8()))
    }

    fn extract_region(&self, handle: RawHandle, rect: PixelRect) -> BackendResult<RawImage> {
        let image = self.get(handle)?;
        if !rect.fits_within(image.width(), image.height()) {
            return Err(DecodeError::OutOfBounds {
                rect,
                width: image.width(),
                height: image.height(),
            });
        }
        let region = imageops::crop_imm(image.as_ref(), rect.x, rect.y, rect.width, rect.height)
            .to_image();
        Ok(self.insert(region))
    }

    fn resize(
        &self,
        handle: RawHandle,
        width: u32,
        height: u32,
        crop_to_fill: bool,
    ) -> BackendResult<RawImage> {
        let image = self.get(handle)?;
        let source = Resolution::new(image.width(), image.height());
        let target = resize_dimensions(source, Resolution::new(width, height), crop_to_fill);

        if !crop_to_fill {
            let resized = self.scale(&image, target);
            return Ok(self.insert(resized));
        }

        // Scale until both axes cover the target, then crop the centre
        let ratio = (target.width as f64 / source.width as f64)
            .max(target.height as f64 / source.height as f64);
        let cover = Resolution::new(
            ((source.width as f64 * ratio).ceil() as u32).max(target.width),
            ((source.height as f64 * ratio).ceil() as u32).max(target.height),
        );
        let scaled = self.scale(&image, cover);
        let x = (cover.width - target.width) / 2;
        let y = (cover.height - target.height) / 2;
        let cropped = imageops::crop_imm(&scaled, x, y, target.width, target.height).to_image();
        Ok(self.insert(cropped))
    }

    fn import_pixels(&self, pixels: &dyn PixelBuffer) -> BackendResult<RawImage> {
        let bytes = pixels.as_rgba8().ok_or_else(|| {
            DecodeError::UnsupportedFormat("pixel buffer is not resident in memory".to_string())
        })?;
        let image = RgbaImage::from_raw(pixels.width(), pixels.height(), bytes.to_vec())
            .ok_or_else(|| {
                DecodeError::CorruptData(format!(
                    "{} bytes do not form a {}x{} RGBA image",
                    bytes.len(),
                    pixels.width(),
                    pixels.height()
                ))
            })?;
        Ok(self.insert(image))
    }

    fn to_pixel_buffer(&self, handle: RawHandle) -> BackendResult<SharedPixels> {
        let image = self.get(handle)?;
        let pixels = RgbaPixels::new(image.width(), image.height(), image.as_raw().clone())
            .ok_or_else(|| DecodeError::CorruptData("pixel data length mismatch".to_string()))?;
        Ok(pixels.into_shared())
    }

    fn release(&self, handle: RawHandle) {
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::ImageFormat;
    use std::io::Cursor;

    fn encode_png(width: u32, height: u32) -> Vec<u8> {
        let image = RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255])
        });
        let mut bytes = Cursor::new(Vec::new());
        image.write_to(&mut bytes, ImageFormat::Png).unwrap();
        bytes.into_inner()
    }

    #[test]
    fn test_probe_reads_header_only() {
        let backend = ImageRsBackend::new();
        let source = ImageSource::from_bytes(encode_png(300, 200));
        assert_eq!(
            backend.probe_dimensions(&source).unwrap(),
            SourceDimensions::new(300, 200)
        );
        assert_eq!(backend.live_handles(), 0);
    }

    #[test]
    fn test_probe_rejects_garbage() {
        let backend = ImageRsBackend::new();
        let source = ImageSource::from_bytes(vec![0x13u8; 64]);
        assert!(matches!(
            backend.probe_dimensions(&source),
            Err(DecodeError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_decode_truncated_png_is_corrupt() {
        let backend = ImageRsBackend::new();
        let mut bytes = encode_png(64, 64);
        bytes.truncate(bytes.len() / 2);
        let result = backend.decode(&ImageSource::from_bytes(bytes));
        assert!(matches!(
            result,
            Err(DecodeError::CorruptData(_)) | Err(DecodeError::Io(_))
        ));
    }

    #[test]
    fn test_decode_extract_resize() {
        let backend = ImageRsBackend::new();
        let full = backend
            .decode(&ImageSource::from_bytes(encode_png(200, 100)))
            .unwrap();
        assert_eq!((full.width, full.height), (200, 100));

        let region = backend
            .extract_region(full.handle, PixelRect::new(100, 0, 100, 100))
            .unwrap();
        assert_eq!((region.width, region.height), (100, 100));

        let fitted = backend.resize(full.handle, 50, 50, false).unwrap();
        assert_eq!((fitted.width, fitted.height), (50, 25));

        let filled = backend.resize(full.handle, 50, 50, true).unwrap();
        assert_eq!((filled.width, filled.height), (50, 50));

        let upscaled = backend.resize(region.handle, 300, 300, false).unwrap();
        assert_eq!((upscaled.width, upscaled.height), (300, 300));

        for raw in [full, region, fitted, filled, upscaled] {
            backend.release(raw.handle);
        }
        assert_eq!(backend.live_handles(), 0);
    }

    #[test]
    fn test_release_is_idempotent() {
        let backend = ImageRsBackend::new();
        let raw = backend
            .import_pixels(&RgbaPixels::filled(4, 4, [1, 2, 3, 4]))
            .unwrap();
        backend.release(raw.handle);
        backend.release(raw.handle);
        backend.release(RawHandle(9999));
        assert_eq!(backend.live_handles(), 0);
    }

    #[test]
    fn test_to_pixel_buffer_round_trips_pixels() {
        let backend = ImageRsBackend::new();
        let raw = backend
            .import_pixels(&RgbaPixels::filled(3, 3, [9, 8, 7, 255]))
            .unwrap();
        let pixels = backend.to_pixel_buffer(raw.handle).unwrap();
        assert_eq!(pixels.byte_size(), 36);
        assert_eq!(&pixels.as_rgba8().unwrap()[..4], &[9, 8, 7, 255]);
        backend.release(raw.handle);
    }

    fn checkerboard(size: u32) -> RgbaPixels {
        let image = RgbaImage::from_fn(size, size, |x, y| {
            let v = if (x + y) % 2 == 0 { 0 } else { 255 };
            Rgba([v, v, v, 255])
        });
        RgbaPixels::new(size, size, image.into_raw()).unwrap()
    }

    fn halved_centre(linear_light: bool) -> [u8; 4] {
        let backend = ImageRsBackend::with_resample(ResampleConfig {
            downscale: ResampleKernel::Linear,
            linear_light,
            ..ResampleConfig::default()
        });
        let raw = backend.import_pixels(&checkerboard(64)).unwrap();
        let half = backend.resize(raw.handle, 32, 32, false).unwrap();
        let pixels = backend.to_pixel_buffer(half.handle).unwrap();
        let bytes = pixels.as_rgba8().unwrap();
        let offset = (16 * 32 + 16) * 4;
        let mut centre = [0u8; 4];
        centre.copy_from_slice(&bytes[offset..offset + 4]);
        backend.release(raw.handle);
        backend.release(half.handle);
        centre
    }

    #[test]
    fn test_linear_light_downscale_keeps_checkerboard_brightness() {
        let gamma = halved_centre(false);
        assert!((120..=135).contains(&gamma[0]), "gamma-space grey {:?}", gamma);

        // Half-intensity light encodes to about 188 in sRGB
        let linear = halved_centre(true);
        assert!((180..=195).contains(&linear[0]), "linear-light grey {:?}", linear);
        assert_eq!(linear[0], linear[1]);
        assert_eq!(linear[3], 255);
    }

    #[test]
    fn test_linear_light_leaves_upscaling_alone() {
        let plain = ImageRsBackend::new();
        let linear = ImageRsBackend::with_resample(ResampleConfig {
            linear_light: true,
            ..ResampleConfig::default()
        });
        let pixels = checkerboard(8);
        let mut outputs = Vec::new();
        for backend in [&plain, &linear] {
            let raw = backend.import_pixels(&pixels).unwrap();
            let big = backend.resize(raw.handle, 24, 24, false).unwrap();
            outputs.push(backend.to_pixel_buffer(big.handle).unwrap());
        }
        assert_eq!(outputs[0].as_rgba8(), outputs[1].as_rgba8());
    }

    #[test]
    fn test_kernel_parsing() {
        assert_eq!("Lanczos3".parse::<ResampleKernel>(), Ok(ResampleKernel::Lanczos3));
        assert_eq!("catmull-rom".parse::<ResampleKernel>(), Ok(ResampleKernel::CatmullRom));
        assert_eq!("bilinear".parse::<ResampleKernel>(), Ok(ResampleKernel::Linear));
        assert!("box".parse::<ResampleKernel>().is_err());
    }
}
