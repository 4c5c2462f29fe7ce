//! Render surface adapter
//!
//! [`TileCompositor`] maps each tile of a snapshot from display space to the
//! screen and asks a [`RenderSurface`] to draw it. Tiles without pixels get a
//! placeholder so the visible area is always covered. [`RgbaCanvas`] is a CPU
//! surface backed by an `image::RgbaImage`, used by the CLI and by tests.

use image::imageops;
use image::{Rgba, RgbaImage};

use crate::geometry::DisplayRect;
use crate::image_rs::ResampleKernel;
use crate::pixels::{PixelBuffer, SharedPixels};
use crate::tile::TileKey;

/// What a tile currently has to show
#[derive(Clone)]
pub enum SurfaceContent {
    /// Decoded pixels. `fallback` is set when they come from an older
    /// resolution that is still being refined.
    Pixels {
        pixels: SharedPixels,
        fallback: bool,
    },
    Loading,
    Error,
}

/// One tile handed to the compositor
#[derive(Clone)]
pub struct SurfaceTile {
    pub key: TileKey,
    pub display_rect: DisplayRect,
    pub content: SurfaceContent,
}

/// Placeholder variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderKind {
    Loading,
    Error,
}

/// Display-space to screen-space mapping for one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenTransform {
    pub scale: f32,
    pub pan_x: f32,
    pub pan_y: f32,
    pub surface_width: f32,
    pub surface_height: f32,
}

impl ScreenTransform {
    pub fn to_screen(&self, rect: &DisplayRect) -> DisplayRect {
        rect.transform(self.scale, self.pan_x, self.pan_y)
    }

    pub fn surface_rect(&self) -> DisplayRect {
        DisplayRect::new(0.0, 0.0, self.surface_width, self.surface_height)
    }
}

/// Host drawing primitives
pub trait RenderSurface {
    fn draw_pixels(&mut self, pixels: &dyn PixelBuffer, dest: DisplayRect, sampling: ResampleKernel);

    fn draw_placeholder(&mut self, dest: DisplayRect, kind: PlaceholderKind);

    fn draw_outline(&mut self, dest: DisplayRect, color: [u8; 4]);
}

/// Counts from one compositor pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrawStats {
    pub drawn: usize,
    pub fallbacks: usize,
    pub placeholders: usize,
    pub skipped: usize,
}

const GRID_COLOR: [u8; 4] = [255, 0, 255, 255];

/// Draws tile snapshots onto a surface
#[derive(Debug, Clone, Copy)]
pub struct TileCompositor {
    upsampling: ResampleKernel,
    debug_grid: bool,
}

impl TileCompositor {
    pub fn new() -> Self {
        Self {
            upsampling: ResampleKernel::CatmullRom,
            debug_grid: false,
        }
    }

    /// Filter used when a tile is drawn larger than its buffer
    pub fn with_upsampling(mut self, kernel: ResampleKernel) -> Self {
        self.upsampling = kernel;
        self
    }

    pub fn with_debug_grid(mut self, enabled: bool) -> Self {
        self.debug_grid = enabled;
        self
    }

    /// Sampling mode for drawing `pixels` into `dest`
    pub fn sampling_for(&self, pixels: &dyn PixelBuffer, dest: &DisplayRect) -> ResampleKernel {
        if dest.width > pixels.width() as f32 || dest.height > pixels.height() as f32 {
            self.upsampling
        } else {
            ResampleKernel::Linear
        }
    }

    pub fn draw(
        &self,
        tiles: &[SurfaceTile],
        transform: ScreenTransform,
        surface: &mut dyn RenderSurface,
    ) -> DrawStats {
        let bounds = transform.surface_rect();
        let mut stats = DrawStats::default();

        for tile in tiles {
            let dest = transform.to_screen(&tile.display_rect);
            if !dest.intersects(&bounds) {
                stats.skipped += 1;
                continue;
            }

            match &tile.content {
                SurfaceContent::Pixels { pixels, fallback } => {
                    let sampling = self.sampling_for(pixels.as_ref(), &dest);
                    surface.draw_pixels(pixels.as_ref(), dest, sampling);
                    stats.drawn += 1;
                    if *fallback {
                        stats.fallbacks += 1;
                    }
                }
                SurfaceContent::Loading => {
                    surface.draw_placeholder(dest, PlaceholderKind::Loading);
                    stats.placeholders += 1;
                }
                SurfaceContent::Error => {
                    surface.draw_placeholder(dest, PlaceholderKind::Error);
                    stats.placeholders += 1;
                }
            }

            if self.debug_grid {
                surface.draw_outline(dest, GRID_COLOR);
            }
        }

        stats
    }
}

impl Default for TileCompositor {
    fn default() -> Self {
        Self::new()
    }
}

/// CPU render surface
pub struct RgbaCanvas {
    image: RgbaImage,
    loading_color: [u8; 4],
    error_color: [u8; 4],
}

impl RgbaCanvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_background(width, height, [0, 0, 0, 255])
    }

    pub fn with_background(width: u32, height: u32, background: [u8; 4]) -> Self {
        Self {
            image: RgbaImage::from_pixel(width, height, Rgba(background)),
            loading_color: [96, 96, 96, 255],
            error_color: [160, 32, 32, 255],
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        self.image.get_pixel(x, y).0
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn into_image(self) -> RgbaImage {
        self.image
    }

    /// Clip `dest` to the canvas, returning integer pixel bounds
    fn clip(&self, dest: &DisplayRect) -> Option<(u32, u32, u32, u32)> {
        let x0 = dest.x.max(0.0).round() as u32;
        let y0 = dest.y.max(0.0).round() as u32;
        let x1 = (dest.right().min(self.image.width() as f32).round().max(0.0)) as u32;
        let y1 = (dest.bottom().min(self.image.height() as f32).round().max(0.0)) as u32;
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some((x0, y0, x1, y1))
    }

    fn fill(&mut self, dest: &DisplayRect, color: [u8; 4]) {
        if let Some((x0, y0, x1, y1)) = self.clip(dest) {
            for y in y0..y1 {
                for x in x0..x1 {
                    self.image.put_pixel(x, y, Rgba(color));
                }
            }
        }
    }
}

/// Copy a `width` x `height` window of a packed RGBA8 buffer
fn crop_rows(bytes: &[u8], stride: usize, x: u32, y: u32, width: u32, height: u32) -> RgbaImage {
    let row_len = width as usize * 4;
    let mut region = RgbaImage::new(width, height);
    for (row, target) in region.chunks_exact_mut(row_len).enumerate() {
        let start = (y as usize + row) * stride + x as usize * 4;
        target.copy_from_slice(&bytes[start..start + row_len]);
    }
    region
}

impl RenderSurface for RgbaCanvas {
    fn draw_pixels(&mut self, pixels: &dyn PixelBuffer, dest: DisplayRect, sampling: ResampleKernel) {
        let Some(bytes) = pixels.as_rgba8() else {
            self.draw_placeholder(dest, PlaceholderKind::Loading);
            return;
        };
        let (width, height) = (pixels.width(), pixels.height());
        let stride = width as usize * 4;
        if width == 0 || height == 0 || bytes.len() < stride * height as usize {
            self.draw_placeholder(dest, PlaceholderKind::Error);
            return;
        }
        let Some((x0, y0, x1, y1)) = self.clip(&dest) else {
            return;
        };
        if dest.width <= 0.0 || dest.height <= 0.0 {
            return;
        }

        // Only resample the part of the buffer that lands on the canvas
        let fx = width as f32 / dest.width;
        let fy = height as f32 / dest.height;
        let sx0 = (((x0 as f32 - dest.x) * fx).floor().max(0.0) as u32).min(width - 1);
        let sy0 = (((y0 as f32 - dest.y) * fy).floor().max(0.0) as u32).min(height - 1);
        let sx1 = (((x1 as f32 - dest.x) * fx).ceil() as u32).clamp(sx0 + 1, width);
        let sy1 = (((y1 as f32 - dest.y) * fy).ceil() as u32).clamp(sy0 + 1, height);

        let region = crop_rows(bytes, stride, sx0, sy0, sx1 - sx0, sy1 - sy0);
        let scaled = imageops::resize(&region, x1 - x0, y1 - y0, sampling.filter_type());
        imageops::replace(&mut self.image, &scaled, x0 as i64, y0 as i64);
    }

    fn draw_placeholder(&mut self, dest: DisplayRect, kind: PlaceholderKind) {
        let color = match kind {
            PlaceholderKind::Loading => self.loading_color,
            PlaceholderKind::Error => self.error_color,
        };
        self.fill(&dest, color);
    }

    fn draw_outline(&mut self, dest: DisplayRect, color: [u8; 4]) {
        let Some((x0, y0, x1, y1)) = self.clip(&dest) else {
            return;
        };
        for x in x0..x1 {
            self.image.put_pixel(x, y0, Rgba(color));
            self.image.put_pixel(x, y1 - 1, Rgba(color));
        }
        for y in y0..y1 {
            self.image.put_pixel(x0, y, Rgba(color));
            self.image.put_pixel(x1 - 1, y, Rgba(color));
        }
    }
}
