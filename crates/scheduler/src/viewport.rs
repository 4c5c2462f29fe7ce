//! Viewport state and the visibility resolver
//!
//! The resolver maps a viewport onto a page's tile plan and answers which
//! tiles are needed, at what resolution, and how urgently:
//! 1. Visible tiles (intersecting the screen) - decoded first
//! 2. Margin tiles (inside the prefetch band around the screen) - decoded
//!    ahead of panning
//!
//! Tiles outside both are not needed at all.

use std::collections::HashMap;

use pagetile_render::{
    DisplayRect, DisplaySize, Resolution, ScreenTransform, TileDescriptor, TileKey,
};

use crate::priority::JobPriority;

/// Default prefetch band, as a fraction of the visible extent per side
pub const DEFAULT_PREFETCH_MARGIN: f32 = 0.5;

/// Zoom and pan of one page on a surface
///
/// Screen position of a display-space point `p` is `p * scale + pan`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportState {
    pub scale: f32,
    pub pan_x: f32,
    pub pan_y: f32,
    pub surface_width: f32,
    pub surface_height: f32,
}

impl ViewportState {
    /// Scale 1.0, no pan
    pub fn new(surface_width: f32, surface_height: f32) -> Self {
        Self {
            scale: 1.0,
            pan_x: 0.0,
            pan_y: 0.0,
            surface_width,
            surface_height,
        }
    }

    /// Page of `display` centred on the surface at `scale`
    pub fn centered(display: DisplaySize, surface_width: f32, surface_height: f32, scale: f32) -> Self {
        Self {
            scale,
            pan_x: (surface_width - display.width * scale) / 2.0,
            pan_y: (surface_height - display.height * scale) / 2.0,
            surface_width,
            surface_height,
        }
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_pan(mut self, pan_x: f32, pan_y: f32) -> Self {
        self.pan_x = pan_x;
        self.pan_y = pan_y;
        self
    }

    pub fn is_valid(&self) -> bool {
        self.scale.is_finite()
            && self.scale > 0.0
            && self.pan_x.is_finite()
            && self.pan_y.is_finite()
            && self.surface_width > 0.0
            && self.surface_height > 0.0
    }

    /// The on-screen area in display space
    pub fn visible_rect(&self) -> DisplayRect {
        DisplayRect::new(
            -self.pan_x / self.scale,
            -self.pan_y / self.scale,
            self.surface_width / self.scale,
            self.surface_height / self.scale,
        )
    }

    pub fn transform(&self) -> ScreenTransform {
        ScreenTransform {
            scale: self.scale,
            pan_x: self.pan_x,
            pan_y: self.pan_y,
            surface_width: self.surface_width,
            surface_height: self.surface_height,
        }
    }
}

/// What the decode scheduler needs to know about one tile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeededTile {
    /// Buffer resolution that fills the tile's screen rect at this scale
    pub target: Resolution,

    /// The target is larger than the source region on at least one axis
    pub upscale: bool,

    pub priority: JobPriority,
}

/// Computes the needed tile set for a viewport
///
/// # Example
///
/// ```
/// use pagetile_render::{plan, SourceDimensions};
/// use pagetile_scheduler::{JobPriority, ViewportState, VisibilityResolver};
///
/// let tiles = plan(SourceDimensions::new(4000, 4000), 1_000_000);
/// let viewport = ViewportState::new(1000.0, 1000.0);
///
/// let needed = VisibilityResolver::new().resolve(&tiles, &viewport);
/// let visible = needed.values().filter(|t| t.priority == JobPriority::Visible).count();
/// assert_eq!(visible, 1);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct VisibilityResolver {
    prefetch_margin: f32,
}

impl VisibilityResolver {
    pub fn new() -> Self {
        Self {
            prefetch_margin: DEFAULT_PREFETCH_MARGIN,
        }
    }

    /// Prefetch band as a fraction of the visible width/height on each side
    pub fn with_prefetch_margin(mut self, margin: f32) -> Self {
        self.prefetch_margin = if margin.is_finite() { margin.max(0.0) } else { 0.0 };
        self
    }

    pub fn prefetch_margin(&self) -> f32 {
        self.prefetch_margin
    }

    pub fn resolve(
        &self,
        tiles: &[TileDescriptor],
        viewport: &ViewportState,
    ) -> HashMap<TileKey, NeededTile> {
        let mut needed = HashMap::new();
        if !viewport.is_valid() {
            return needed;
        }

        let visible = viewport.visible_rect();
        let prefetch = visible.expand(
            visible.width * self.prefetch_margin,
            visible.height * self.prefetch_margin,
        );

        for tile in tiles {
            if !tile.display_rect.intersects(&prefetch) {
                continue;
            }
            let priority = if tile.display_rect.intersects(&visible) {
                JobPriority::Visible
            } else {
                JobPriority::Margin
            };

            let target = target_resolution(&tile.display_rect, viewport.scale);
            needed.insert(
                tile.key,
                NeededTile {
                    target,
                    upscale: target.exceeds(tile.source_rect.size()),
                    priority,
                },
            );
        }

        needed
    }
}

impl Default for VisibilityResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// On-screen pixel size of a display rect, at least 1 px per axis
pub fn target_resolution(display_rect: &DisplayRect, scale: f32) -> Resolution {
    let width = (display_rect.width as f64 * scale as f64).round().max(1.0);
    let height = (display_rect.height as f64 * scale as f64).round().max(1.0);
    Resolution::new(width.min(u32::MAX as f64) as u32, height.min(u32::MAX as f64) as u32)
}
