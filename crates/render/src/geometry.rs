//! Geometry primitives shared by the planner, resolver and compositor
//!
//! Two coordinate spaces exist:
//! - source space: integer pixels of the fully decoded image
//! - display space: logical `f32` units of the page laid out at scale 1.0

use serde::Serialize;

/// Full-resolution size of a decoded image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SourceDimensions {
    pub width: u32,
    pub height: u32,
}

impl SourceDimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Total pixel count
    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// The rectangle covering the whole image
    pub fn bounds(&self) -> PixelRect {
        PixelRect::new(0, 0, self.width, self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Pixel resolution a tile is decoded at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Size in bytes of an RGBA8 buffer at this resolution
    pub fn rgba_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    /// True if either axis is larger than `other`
    pub fn exceeds(&self, other: Resolution) -> bool {
        self.width > other.width || self.height > other.height
    }
}

/// Axis-aligned rectangle in source pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> u64 {
        self.x as u64 + self.width as u64
    }

    pub fn bottom(&self) -> u64 {
        self.y as u64 + self.height as u64
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn size(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// True if this rectangle lies entirely inside a `width` x `height` image
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.right() <= width as u64 && self.bottom() <= height as u64
    }

    /// True if the two rectangles share at least one pixel
    pub fn overlaps(&self, other: &PixelRect) -> bool {
        (self.x as u64) < other.right()
            && (other.x as u64) < self.right()
            && (self.y as u64) < other.bottom()
            && (other.y as u64) < self.bottom()
    }
}

/// Logical size of the area a page is laid out in
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DisplaySize {
    pub width: f32,
    pub height: f32,
}

impl DisplaySize {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }

    pub fn is_valid(&self) -> bool {
        self.width.is_finite() && self.height.is_finite() && self.width > 0.0 && self.height > 0.0
    }
}

/// Rectangle in display (or screen) coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DisplayRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl DisplayRect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    /// Strict intersection test; rectangles that only touch along an edge
    /// do not intersect.
    pub fn intersects(&self, other: &DisplayRect) -> bool {
        self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }

    /// Grow the rectangle by `dx` on the left and right and `dy` on the top
    /// and bottom
    pub fn expand(&self, dx: f32, dy: f32) -> DisplayRect {
        DisplayRect::new(
            self.x - dx,
            self.y - dy,
            self.width + 2.0 * dx,
            self.height + 2.0 * dy,
        )
    }

    /// Apply a uniform scale followed by a translation
    pub fn transform(&self, scale: f32, offset_x: f32, offset_y: f32) -> DisplayRect {
        DisplayRect::new(
            self.x * scale + offset_x,
            self.y * scale + offset_y,
            self.width * scale,
            self.height * scale,
        )
    }
}

/// Lay a page of `dimensions` out inside `area`, preserving aspect ratio.
///
/// Without `stretch`, a page smaller than the area keeps its natural size
/// instead of being blown up to fill it.
pub fn fit_display_size(dimensions: SourceDimensions, area: DisplaySize, stretch: bool) -> DisplaySize {
    if dimensions.is_empty() || !area.is_valid() {
        return DisplaySize::new(dimensions.width as f32, dimensions.height as f32);
    }

    let width_ratio = area.width as f64 / dimensions.width as f64;
    let height_ratio = area.height as f64 / dimensions.height as f64;
    let mut ratio = width_ratio.min(height_ratio);
    if !stretch {
        ratio = ratio.min(1.0);
    }

    DisplaySize::new(
        (dimensions.width as f64 * ratio) as f32,
        (dimensions.height as f64 * ratio) as f32,
    )
}

/// Output size for an aspect-preserving resize of `source` into `target`.
///
/// With `crop_to_fill` the result is always `target` (the overflow is cropped
/// by the backend). Otherwise the image is scaled to fit inside the target
/// box; when the target aspect matches the source within one pixel of
/// rounding on each axis, the exact target is returned so tile buffers land at
/// the requested resolution.
pub fn resize_dimensions(source: Resolution, target: Resolution, crop_to_fill: bool) -> Resolution {
    let target = Resolution::new(target.width.max(1), target.height.max(1));
    if crop_to_fill || source.width == 0 || source.height == 0 {
        return target;
    }

    let ratio = (target.width as f64 / source.width as f64)
        .min(target.height as f64 / source.height as f64);
    let fit_width = ((source.width as f64 * ratio).round() as u32).clamp(1, target.width);
    let fit_height = ((source.height as f64 * ratio).round() as u32).clamp(1, target.height);

    if target.width - fit_width <= 1 && target.height - fit_height <= 1 {
        target
    } else {
        Resolution::new(fit_width, fit_height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_rect_fits_within() {
        let rect = PixelRect::new(10, 10, 90, 40);
        assert!(rect.fits_within(100, 50));
        assert!(!rect.fits_within(99, 50));
        assert!(!PixelRect::new(u32::MAX, 0, 2, 1).fits_within(u32::MAX, 1));
    }

    #[test]
    fn test_pixel_rect_overlap() {
        let a = PixelRect::new(0, 0, 10, 10);
        assert!(a.overlaps(&PixelRect::new(9, 9, 5, 5)));
        assert!(!a.overlaps(&PixelRect::new(10, 0, 5, 5)));
    }

    #[test]
    fn test_display_rect_edge_touch_is_not_intersection() {
        let a = DisplayRect::new(0.0, 0.0, 10.0, 10.0);
        let b = DisplayRect::new(10.0, 0.0, 10.0, 10.0);
        assert!(!a.intersects(&b));
        assert!(a.intersects(&DisplayRect::new(9.5, 9.5, 1.0, 1.0)));
    }

    #[test]
    fn test_display_rect_transform() {
        let rect = DisplayRect::new(10.0, 20.0, 30.0, 40.0).transform(2.0, -5.0, 5.0);
        assert_eq!(rect, DisplayRect::new(15.0, 45.0, 60.0, 80.0));
    }

    #[test]
    fn test_fit_display_size_keeps_aspect() {
        let fitted = fit_display_size(
            SourceDimensions::new(4000, 6000),
            DisplaySize::new(1000.0, 1000.0),
            true,
        );
        assert!((fitted.width - 666.666).abs() < 0.01);
        assert_eq!(fitted.height, 1000.0);
    }

    #[test]
    fn test_fit_display_size_without_stretch() {
        let small = SourceDimensions::new(400, 300);
        let area = DisplaySize::new(1600.0, 1200.0);
        assert_eq!(fit_display_size(small, area, false), DisplaySize::new(400.0, 300.0));
        assert_eq!(fit_display_size(small, area, true), DisplaySize::new(1600.0, 1200.0));
    }

    #[test]
    fn test_resize_dimensions_exact_for_matching_aspect() {
        // 2000x1333 scaled by 0.3 rounds to 600x400 on one axis and 599.9 on the other
        let out = resize_dimensions(Resolution::new(2000, 1333), Resolution::new(600, 400), false);
        assert_eq!(out, Resolution::new(600, 400));
    }

    #[test]
    fn test_resize_dimensions_fit_and_fill() {
        let source = Resolution::new(1000, 500);
        let target = Resolution::new(400, 400);
        assert_eq!(resize_dimensions(source, target, false), Resolution::new(400, 200));
        assert_eq!(resize_dimensions(source, target, true), target);
    }
}
