//! Tile geometry planning
//!
//! Partitions a source image into a grid of tiles, each at most
//! `max_tile_pixels` pixels, so no single decode exceeds the native
//! allocation ceiling. The grid is chosen to keep tiles close to square with
//! as few tiles as possible.

use serde::Serialize;

use crate::geometry::{DisplayRect, DisplaySize, PixelRect, SourceDimensions};

/// Default per-tile pixel ceiling (2048 x 2048)
pub const DEFAULT_MAX_TILE_PIXELS: u64 = 2048 * 2048;

/// Widest tile aspect ratio preferred by the planner
const MAX_PREFERRED_ASPECT: f64 = 2.0;

/// Identity of an open page within one engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ImageId(pub u64);

impl std::fmt::Display for ImageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "image#{}", self.0)
    }
}

/// Tile position within the page grid
///
/// (0, 0) is the top-left tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TileKey {
    pub row: u32,
    pub col: u32,
}

impl TileKey {
    pub fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }
}

/// One cell of a tile plan
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TileDescriptor {
    pub key: TileKey,

    /// Region of the full-resolution source
    pub source_rect: PixelRect,

    /// Where the tile sits in the page's display space at scale 1.0
    pub display_rect: DisplayRect,
}

impl TileDescriptor {
    /// True if the tile covers the whole source
    pub fn is_whole_image(&self, dimensions: SourceDimensions) -> bool {
        self.source_rect == dimensions.bounds()
    }
}

/// Grid shape chosen by the planner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TileGrid {
    pub cols: u32,
    pub rows: u32,
    pub tile_width: u32,
    pub tile_height: u32,
}

impl TileGrid {
    pub fn tile_count(&self) -> u64 {
        self.cols as u64 * self.rows as u64
    }

    fn aspect(&self) -> f64 {
        let long = self.tile_width.max(self.tile_height) as f64;
        let short = self.tile_width.min(self.tile_height).max(1) as f64;
        long / short
    }
}

/// Choose the grid for `dimensions` under a per-tile pixel ceiling
pub fn choose_grid(dimensions: SourceDimensions, max_tile_pixels: u64) -> TileGrid {
    let max = max_tile_pixels.max(1);
    let (w, h) = (dimensions.width.max(1), dimensions.height.max(1));

    if dimensions.pixel_count() <= max {
        return TileGrid {
            cols: 1,
            rows: 1,
            tile_width: w,
            tile_height: h,
        };
    }

    let mut best: Option<TileGrid> = None;
    let mut best_in_bounds = false;

    for cols in 1..=w {
        let tile_width = w.div_ceil(cols);
        if tile_width as u64 > max {
            continue;
        }
        // No later column count can produce fewer tiles than this
        if best_in_bounds {
            if let Some(current) = best {
                if cols as u64 > current.tile_count() {
                    break;
                }
            }
        }

        let tallest = (max / tile_width as u64).min(h as u64) as u32;
        let rows = h.div_ceil(tallest);
        let tile_height = h.div_ceil(rows);
        let candidate = TileGrid {
            cols: w.div_ceil(tile_width),
            rows,
            tile_width,
            tile_height,
        };

        let in_bounds = candidate.aspect() <= MAX_PREFERRED_ASPECT;
        let better = match best {
            None => true,
            Some(current) => {
                if in_bounds != best_in_bounds {
                    in_bounds
                } else if candidate.tile_count() != current.tile_count() {
                    candidate.tile_count() < current.tile_count()
                } else {
                    candidate.aspect() < current.aspect()
                }
            }
        };
        if better {
            best = Some(candidate);
            best_in_bounds = in_bounds;
        }
    }

    best.unwrap_or(TileGrid {
        cols: w,
        rows: h,
        tile_width: 1,
        tile_height: 1,
    })
}

/// Partition `dimensions` into tiles of at most `max_tile_pixels` pixels.
///
/// Display space equals source space. Tiles are returned in row-major order.
pub fn plan(dimensions: SourceDimensions, max_tile_pixels: u64) -> Vec<TileDescriptor> {
    let display = DisplaySize::new(dimensions.width as f32, dimensions.height as f32);
    plan_grid(dimensions, display, choose_grid(dimensions, max_tile_pixels))
}

fn plan_grid(
    dimensions: SourceDimensions,
    display: DisplaySize,
    grid: TileGrid,
) -> Vec<TileDescriptor> {
    if dimensions.is_empty() {
        return Vec::new();
    }

    let sx = display.width as f64 / dimensions.width as f64;
    let sy = display.height as f64 / dimensions.height as f64;
    let mut tiles = Vec::with_capacity(grid.tile_count() as usize);

    for row in 0..grid.rows {
        let y = row * grid.tile_height;
        let height = grid.tile_height.min(dimensions.height - y);
        for col in 0..grid.cols {
            let x = col * grid.tile_width;
            let width = grid.tile_width.min(dimensions.width - x);

            // Edges are mapped individually so neighbouring tiles share them
            let left = x as f64 * sx;
            let top = y as f64 * sy;
            let right = (x + width) as f64 * sx;
            let bottom = (y + height) as f64 * sy;

            tiles.push(TileDescriptor {
                key: TileKey::new(row, col),
                source_rect: PixelRect::new(x, y, width, height),
                display_rect: DisplayRect::new(
                    left as f32,
                    top as f32,
                    (right - left) as f32,
                    (bottom - top) as f32,
                ),
            });
        }
    }

    tiles
}

/// Tiling policy for pages laid out at a display size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePlanner {
    max_tile_pixels: u64,
}

impl TilePlanner {
    pub fn new(max_tile_pixels: u64) -> Self {
        Self {
            max_tile_pixels: max_tile_pixels.max(1),
        }
    }

    pub fn max_tile_pixels(&self) -> u64 {
        self.max_tile_pixels
    }

    /// Plan tiles for a page of `dimensions` laid out at `display_size`
    pub fn plan(&self, dimensions: SourceDimensions, display_size: DisplaySize) -> Vec<TileDescriptor> {
        plan_grid(
            dimensions,
            display_size,
            choose_grid(dimensions, self.max_tile_pixels),
        )
    }

    pub fn grid(&self, dimensions: SourceDimensions) -> TileGrid {
        choose_grid(dimensions, self.max_tile_pixels)
    }
}

impl Default for TilePlanner {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TILE_PIXELS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn assert_exact_cover(dimensions: SourceDimensions, tiles: &[TileDescriptor], max: u64) {
        let total: u64 = tiles.iter().map(|t| t.source_rect.area()).sum();
        assert_eq!(total, dimensions.pixel_count(), "area mismatch for {:?}", dimensions);

        for tile in tiles {
            assert!(tile.source_rect.fits_within(dimensions.width, dimensions.height));
            assert!(tile.source_rect.width > 0 && tile.source_rect.height > 0);
            assert!(tile.source_rect.area() <= max.max(1));
        }

        // Equal area plus pairwise disjointness means exact coverage
        for (i, a) in tiles.iter().enumerate() {
            for b in &tiles[i + 1..] {
                assert!(!a.source_rect.overlaps(&b.source_rect), "{:?} overlaps {:?}", a, b);
            }
        }
    }

    #[test]
    fn test_single_tile_when_it_fits() {
        let dims = SourceDimensions::new(1000, 800);
        let tiles = plan(dims, DEFAULT_MAX_TILE_PIXELS);
        assert_eq!(tiles.len(), 1);
        assert!(tiles[0].is_whole_image(dims));
        assert_eq!(tiles[0].display_rect, DisplayRect::new(0.0, 0.0, 1000.0, 800.0));
    }

    #[test]
    fn test_large_page_under_four_megapixels() {
        let dims = SourceDimensions::new(8000, 6000);
        let tiles = plan(dims, 4_000_000);
        assert_exact_cover(dims, &tiles, 4_000_000);
        assert_eq!(tiles.len(), 12);
    }

    #[test]
    fn test_tall_strip_prefers_bounded_aspect() {
        let dims = SourceDimensions::new(1000, 10_000);
        let grid = choose_grid(dims, 1_000_000);
        assert!(grid.aspect() <= MAX_PREFERRED_ASPECT);
        assert_exact_cover(dims, &plan(dims, 1_000_000), 1_000_000);
    }

    #[test]
    fn test_remainder_goes_to_last_row_and_column() {
        let dims = SourceDimensions::new(1001, 999);
        let tiles = plan(dims, 250_000);
        let grid = choose_grid(dims, 250_000);
        for tile in &tiles {
            assert!(tile.source_rect.width <= grid.tile_width);
            assert!(tile.source_rect.height <= grid.tile_height);
            assert_eq!(tile.source_rect.x, tile.key.col * grid.tile_width);
            assert_eq!(tile.source_rect.y, tile.key.row * grid.tile_height);
        }
        assert_exact_cover(dims, &tiles, 250_000);
    }

    #[test]
    fn test_zero_budget_is_treated_as_one() {
        let dims = SourceDimensions::new(3, 2);
        let tiles = plan(dims, 0);
        assert_eq!(tiles.len(), 6);
        assert_exact_cover(dims, &tiles, 1);
    }

    #[test]
    fn test_randomized_coverage() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let dims = SourceDimensions::new(rng.gen_range(1..3000), rng.gen_range(1..3000));
            let max = rng.gen_range(1..2_000_000u64);
            let tiles = plan(dims, max);
            let total: u64 = tiles.iter().map(|t| t.source_rect.area()).sum();
            assert_eq!(total, dims.pixel_count());
            assert!(tiles.iter().all(|t| t.source_rect.area() <= max));
            assert!(tiles
                .iter()
                .all(|t| t.source_rect.fits_within(dims.width, dims.height)));
        }
    }

    #[test]
    fn test_randomized_no_overlap_small() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let dims = SourceDimensions::new(rng.gen_range(1..400), rng.gen_range(1..400));
            let max = rng.gen_range(1_000..40_000u64);
            assert_exact_cover(dims, &plan(dims, max), max);
        }
    }

    #[test]
    fn test_planner_scales_display_rects() {
        let dims = SourceDimensions::new(4000, 4000);
        let planner = TilePlanner::new(4_000_000);
        let tiles = planner.plan(dims, DisplaySize::new(1000.0, 1000.0));
        assert_eq!(tiles.len(), 4);

        let covered: f32 = tiles
            .iter()
            .map(|t| t.display_rect.width * t.display_rect.height)
            .sum();
        assert!((covered - 1_000_000.0).abs() < 1.0);

        let last = tiles.last().unwrap();
        assert_eq!(last.key, TileKey::new(1, 1));
        assert_eq!(last.display_rect.right(), 1000.0);
        assert_eq!(last.display_rect.bottom(), 1000.0);
    }
}
