use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use pagetile_core::{EngineConfig, TileEngine};
use pagetile_render::{
    DisplaySize, ImageBackend, ImageRsBackend, ImageSource, RgbaCanvas, SourceDimensions, TileDescriptor,
    TileGrid, TilePlanner,
};
use pagetile_scheduler::ViewportState;
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "pagetile")]
#[command(about = "Tiled progressive image viewer engine")]
pub struct Cli {
    /// Engine configuration file (TOML)
    #[arg(long, global = true, value_name = "TOML")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the image dimensions as JSON.
    Probe {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Print the tile plan as JSON.
    Plan {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        /// Pixel ceiling per tile (defaults to the configured value)
        #[arg(long)]
        max_tile_pixels: Option<u64>,
        /// Display size the page is laid out at (defaults to the source size)
        #[arg(long, value_name = "WxH", value_parser = parse_size)]
        display: Option<(u32, u32)>,
    },
    /// Render a viewport through the engine to a PNG.
    Render {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(long, value_name = "WxH", value_parser = parse_size)]
        surface: (u32, u32),
        #[arg(long, default_value_t = 1.0)]
        scale: f32,
        /// Screen offset of the page; centred when omitted
        #[arg(long, value_name = "X,Y", value_parser = parse_pan, allow_hyphen_values = true)]
        pan: Option<(f32, f32)>,
        #[arg(long)]
        output: Option<PathBuf>,
        /// Give up if tiles are still decoding after this many seconds
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
    /// Print CLI version.
    Version,
}

#[derive(Debug, Serialize)]
struct ProbeOutput {
    path: String,
    width: u32,
    height: u32,
    pixel_count: u64,
}

#[derive(Debug, Serialize)]
struct PlanOutput {
    path: String,
    width: u32,
    height: u32,
    max_tile_pixels: u64,
    display: DisplaySize,
    grid: TileGrid,
    tiles: Vec<TileDescriptor>,
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    let config = EngineConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Probe { file } => run_probe(&file),
        Commands::Plan {
            file,
            max_tile_pixels,
            display,
        } => run_plan(&file, &config, max_tile_pixels, display),
        Commands::Render {
            file,
            surface,
            scale,
            pan,
            output,
            timeout_secs,
        } => run_render(
            &file,
            config,
            surface,
            scale,
            pan,
            output.as_deref(),
            Duration::from_secs(timeout_secs),
        ),
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn run_probe(file: &Path) -> Result<()> {
    let dimensions = probe(file)?;
    let payload = ProbeOutput {
        path: file.display().to_string(),
        width: dimensions.width,
        height: dimensions.height,
        pixel_count: dimensions.pixel_count(),
    };

    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn run_plan(
    file: &Path,
    config: &EngineConfig,
    max_tile_pixels: Option<u64>,
    display: Option<(u32, u32)>,
) -> Result<()> {
    let dimensions = probe(file)?;
    let max_tile_pixels = max_tile_pixels.unwrap_or(config.max_tile_pixels);
    if max_tile_pixels == 0 {
        anyhow::bail!("--max-tile-pixels must be >= 1");
    }

    let display = match display {
        Some((width, height)) => DisplaySize::new(width as f32, height as f32),
        None => DisplaySize::new(dimensions.width as f32, dimensions.height as f32),
    };
    let planner = TilePlanner::new(max_tile_pixels);
    let payload = PlanOutput {
        path: file.display().to_string(),
        width: dimensions.width,
        height: dimensions.height,
        max_tile_pixels,
        display,
        grid: planner.grid(dimensions),
        tiles: planner.plan(dimensions, display),
    };

    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn run_render(
    file: &Path,
    config: EngineConfig,
    surface: (u32, u32),
    scale: f32,
    pan: Option<(f32, f32)>,
    output: Option<&Path>,
    timeout: Duration,
) -> Result<()> {
    ensure_file_exists(file)?;
    if !(scale.is_finite() && scale > 0.0) {
        anyhow::bail!("--scale must be a positive number");
    }

    let (surface_width, surface_height) = (surface.0 as f32, surface.1 as f32);
    let engine = TileEngine::image_rs(config).context("failed to start engine")?;
    let mut page = engine
        .open_fitted(
            ImageSource::from_path(file),
            DisplaySize::new(surface_width, surface_height),
        )
        .context("failed to open image")?;

    let mut viewport = ViewportState::centered(page.display_size(), surface_width, surface_height, scale);
    if let Some((x, y)) = pan {
        viewport = viewport.with_pan(x, y);
    }

    let summary = page.update(&viewport)?;
    info!(
        "rendering {} of {} tiles at scale {}",
        summary.needed,
        page.tiles().len(),
        scale
    );
    if !page.wait_until_settled(timeout) {
        anyhow::bail!("timed out after {}s waiting for tiles", timeout.as_secs());
    }

    let mut canvas = RgbaCanvas::new(surface.0, surface.1);
    let stats = page.draw(&mut canvas, &viewport);
    info!(
        "drew {} tiles, {} placeholders, {} off-surface",
        stats.drawn, stats.placeholders, stats.skipped
    );
    page.close();

    let output = output
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| default_render_output(file));
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }

    canvas
        .into_image()
        .save(&output)
        .with_context(|| format!("failed to write image to {}", output.display()))?;

    println!("{}", output.display());
    Ok(())
}

fn probe(file: &Path) -> Result<SourceDimensions> {
    ensure_file_exists(file)?;
    let dimensions = ImageRsBackend::new()
        .probe_dimensions(&ImageSource::from_path(file))
        .context("failed to read image header")?;
    if dimensions.is_empty() {
        anyhow::bail!("image has no pixels: {}", file.display());
    }
    Ok(dimensions)
}

fn ensure_file_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("file does not exist: {}", path.display());
    }

    if !path.is_file() {
        anyhow::bail!("path is not a file: {}", path.display());
    }

    Ok(())
}

fn default_render_output(file: &Path) -> PathBuf {
    let stem = file.file_stem().and_then(|name| name.to_str()).unwrap_or("page");

    file.with_file_name(format!("{stem}-render.png"))
}

fn parse_size(value: &str) -> Result<(u32, u32), String> {
    let (width, height) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WxH, got {value:?}"))?;
    let width: u32 = width.trim().parse().map_err(|_| format!("invalid width in {value:?}"))?;
    let height: u32 = height.trim().parse().map_err(|_| format!("invalid height in {value:?}"))?;
    if width == 0 || height == 0 {
        return Err(format!("size must be non-zero, got {value:?}"));
    }
    Ok((width, height))
}

fn parse_pan(value: &str) -> Result<(f32, f32), String> {
    let (x, y) = value
        .split_once(',')
        .ok_or_else(|| format!("expected X,Y, got {value:?}"))?;
    let x: f32 = x.trim().parse().map_err(|_| format!("invalid x offset in {value:?}"))?;
    let y: f32 = y.trim().parse().map_err(|_| format!("invalid y offset in {value:?}"))?;
    if !(x.is_finite() && y.is_finite()) {
        return Err(format!("offsets must be finite, got {value:?}"));
    }
    Ok((x, y))
}
