//! Decoded pixel buffers
//!
//! A [`PixelBuffer`] is the drawable result of a decode. The engine only needs
//! its dimensions and byte size for accounting; surfaces that can blit raw
//! RGBA bytes ask for them through [`PixelBuffer::as_rgba8`].

use std::fmt;
use std::sync::Arc;

use crate::geometry::Resolution;

/// A drawable block of decoded pixels
pub trait PixelBuffer: Send + Sync {
    fn width(&self) -> u32;

    fn height(&self) -> u32;

    /// Resident size in bytes, counted against the memory budget
    fn byte_size(&self) -> usize {
        self.width() as usize * self.height() as usize * 4
    }

    /// Tightly packed RGBA8 rows, if this buffer lives in process memory
    fn as_rgba8(&self) -> Option<&[u8]> {
        None
    }

    fn resolution(&self) -> Resolution {
        Resolution::new(self.width(), self.height())
    }
}

/// Reference-counted pixel buffer shared between the cache and render passes
pub type SharedPixels = Arc<dyn PixelBuffer>;

/// Heap-allocated RGBA8 pixels
#[derive(Clone)]
pub struct RgbaPixels {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl RgbaPixels {
    /// Wrap packed RGBA8 bytes. Returns `None` if the length does not match
    /// `width * height * 4`.
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        if data.len() != width as usize * height as usize * 4 {
            return None;
        }
        Some(Self {
            width,
            height,
            data,
        })
    }

    /// A buffer filled with one colour
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let data = rgba
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 4)
            .collect();
        Self {
            width,
            height,
            data,
        }
    }

    pub fn into_shared(self) -> SharedPixels {
        Arc::new(self)
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl PixelBuffer for RgbaPixels {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn byte_size(&self) -> usize {
        self.data.len()
    }

    fn as_rgba8(&self) -> Option<&[u8]> {
        Some(&self.data)
    }
}

impl fmt::Debug for RgbaPixels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RgbaPixels")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}
