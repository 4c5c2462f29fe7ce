//! pagetile render library
//!
//! Geometry, the image backend adapter, tile planning and the render surface
//! adapter. Everything here is either pure or talks to a backend through
//! [`ImageBackend`]; scheduling and caching live in the sibling crates.

pub mod backend;
pub mod geometry;
pub mod image_rs;
pub mod pixels;
pub mod source;
pub mod surface;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod tile;
pub mod upscale;

pub use backend::{BackendResult, DecodeError, ImageBackend, NativeImage, RawHandle, RawImage};
pub use geometry::{
    fit_display_size, resize_dimensions, DisplayRect, DisplaySize, PixelRect, Resolution,
    SourceDimensions,
};
pub use image_rs::{ImageRsBackend, ResampleConfig, ResampleKernel};
pub use pixels::{PixelBuffer, RgbaPixels, SharedPixels};
pub use source::ImageSource;
pub use surface::{
    DrawStats, PlaceholderKind, RenderSurface, RgbaCanvas, ScreenTransform, SurfaceContent,
    SurfaceTile, TileCompositor,
};
pub use tile::{plan, ImageId, TileDescriptor, TileGrid, TileKey, TilePlanner, DEFAULT_MAX_TILE_PIXELS};
pub use upscale::{ResampleUpscaler, UpscaleError, Upscaler};
