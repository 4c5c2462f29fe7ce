//! Image backend adapter
//!
//! The engine never talks to a codec directly. Decoding, resampling and
//! region extraction go through an [`ImageBackend`] which hands out opaque
//! [`RawHandle`]s. [`NativeImage`] owns one handle and releases it exactly
//! once, so an early return on any worker path cannot leak native memory.
//!
//! # Example
//!
//! ```ignore
//! let backend: Arc<dyn ImageBackend> = Arc::new(ImageRsBackend::new());
//! let full = NativeImage::decode(&backend, &source)?;
//! let region = full.extract_region(PixelRect::new(0, 0, 512, 512))?;
//! let tile = region.resize(Resolution::new(256, 256), false)?;
//! let pixels = tile.to_pixel_buffer()?;
//! ```

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::geometry::{PixelRect, Resolution, SourceDimensions};
use crate::pixels::{PixelBuffer, SharedPixels};
use crate::source::ImageSource;

/// Errors raised by an image backend
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("corrupt image data: {0}")]
    CorruptData(String),

    #[error("region {rect:?} is outside a {width}x{height} image")]
    OutOfBounds {
        rect: PixelRect,
        width: u32,
        height: u32,
    },

    #[error("native allocation failed: {0}")]
    NativeAllocationFailure(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, DecodeError>;

/// Opaque backend-owned image handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle(pub u64);

/// A handle together with the dimensions of the image behind it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawImage {
    pub handle: RawHandle,
    pub width: u32,
    pub height: u32,
}

impl RawImage {
    pub fn new(handle: RawHandle, width: u32, height: u32) -> Self {
        Self {
            handle,
            width,
            height,
        }
    }
}

/// Native decode, resample and region primitives
///
/// Implementations must be callable from any worker thread. Every handle
/// returned from `decode`, `extract_region`, `resize` or `import_pixels` is
/// owned by the caller until passed to `release`.
pub trait ImageBackend: Send + Sync {
    /// Read the full-resolution size from the encoded header without decoding
    fn probe_dimensions(&self, source: &ImageSource) -> BackendResult<SourceDimensions>;

    /// Decode the whole image at full resolution
    fn decode(&self, source: &ImageSource) -> BackendResult<RawImage>;

    /// Copy `rect` out of `handle` into a new image
    fn extract_region(&self, handle: RawHandle, rect: PixelRect) -> BackendResult<RawImage>;

    /// Resample `handle` to `width` x `height`.
    ///
    /// With `crop_to_fill` the output is exactly the target and overflow is
    /// cropped; otherwise the image is fitted inside the target box.
    fn resize(
        &self,
        handle: RawHandle,
        width: u32,
        height: u32,
        crop_to_fill: bool,
    ) -> BackendResult<RawImage>;

    /// Bring an external pixel buffer into the backend
    fn import_pixels(&self, pixels: &dyn PixelBuffer) -> BackendResult<RawImage>;

    /// Produce a drawable buffer from `handle`
    fn to_pixel_buffer(&self, handle: RawHandle) -> BackendResult<SharedPixels>;

    /// Free the native resources behind `handle`. Releasing an unknown or
    /// already released handle is a no-op.
    fn release(&self, handle: RawHandle);
}

/// Owned native image, released on drop
pub struct NativeImage {
    backend: Arc<dyn ImageBackend>,
    raw: RawImage,
    released: bool,
}

impl NativeImage {
    /// Take ownership of a handle returned by `backend`
    pub fn from_raw(backend: Arc<dyn ImageBackend>, raw: RawImage) -> Self {
        Self {
            backend,
            raw,
            released: false,
        }
    }

    /// Decode `source` in full
    pub fn decode(backend: &Arc<dyn ImageBackend>, source: &ImageSource) -> BackendResult<Self> {
        let raw = backend.decode(source)?;
        Ok(Self::from_raw(Arc::clone(backend), raw))
    }

    /// Import an external buffer
    pub fn from_pixels(
        backend: &Arc<dyn ImageBackend>,
        pixels: &dyn PixelBuffer,
    ) -> BackendResult<Self> {
        let raw = backend.import_pixels(pixels)?;
        Ok(Self::from_raw(Arc::clone(backend), raw))
    }

    pub fn width(&self) -> u32 {
        self.raw.width
    }

    pub fn height(&self) -> u32 {
        self.raw.height
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.raw.width, self.raw.height)
    }

    pub fn handle(&self) -> RawHandle {
        self.raw.handle
    }

    /// Copy a region into a new image.
    ///
    /// Fails with [`DecodeError::OutOfBounds`] before reaching the backend if
    /// `rect` is not contained in this image.
    pub fn extract_region(&self, rect: PixelRect) -> BackendResult<NativeImage> {
        if rect.width == 0 || rect.height == 0 || !rect.fits_within(self.raw.width, self.raw.height)
        {
            return Err(DecodeError::OutOfBounds {
                rect,
                width: self.raw.width,
                height: self.raw.height,
            });
        }
        let raw = self.backend.extract_region(self.raw.handle, rect)?;
        Ok(Self::from_raw(Arc::clone(&self.backend), raw))
    }

    pub fn resize(&self, target: Resolution, crop_to_fill: bool) -> BackendResult<NativeImage> {
        let raw = self
            .backend
            .resize(self.raw.handle, target.width, target.height, crop_to_fill)?;
        Ok(Self::from_raw(Arc::clone(&self.backend), raw))
    }

    pub fn to_pixel_buffer(&self) -> BackendResult<SharedPixels> {
        self.backend.to_pixel_buffer(self.raw.handle)
    }

    /// Release the handle now instead of waiting for drop
    pub fn close(self) {
        drop(self)
    }
}

impl Drop for NativeImage {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.backend.release(self.raw.handle);
        }
    }
}

impl fmt::Debug for NativeImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeImage")
            .field("handle", &self.raw.handle)
            .field("width", &self.raw.width)
            .field("height", &self.raw.height)
            .finish()
    }
}
