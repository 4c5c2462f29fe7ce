//! Engine configuration
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! `PAGETILE_*` environment variables, then builder calls.
//!
//! ```toml
//! max_tile_pixels = 4194304
//! memory_ceiling_bytes = 536870912
//! worker_count = 4
//! prefetch_margin = 0.5
//! upsampling_filter = "catmull-rom"
//! downscale_kernel = "lanczos3"
//! ```

use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use pagetile_render::{ResampleConfig, ResampleKernel, DEFAULT_MAX_TILE_PIXELS};
use pagetile_scheduler::{default_worker_count, ScaleLimits, WorkerPoolConfig, DEFAULT_PREFETCH_MARGIN};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

const MB: usize = 1024 * 1024;

/// Tunables for a [`TileEngine`](crate::TileEngine)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Pixel ceiling per tile
    pub max_tile_pixels: u64,

    /// Ceiling on resident tile buffers across all open pages
    pub memory_ceiling_bytes: usize,

    pub worker_count: usize,

    /// Prefetch band per side, as a fraction of the visible extent
    pub prefetch_margin: f32,

    pub min_scale: f32,
    pub max_scale: f32,

    /// Filter for tiles drawn larger than their buffer
    pub upsampling_filter: ResampleKernel,

    pub downscale_kernel: ResampleKernel,
    pub upscale_kernel: ResampleKernel,

    /// Shrink tiles in linear light instead of sRGB space
    pub linear_light_downscale: bool,

    /// Largest factor an upscaler may enlarge a tile's source region by
    pub max_upscale_factor: f32,

    /// Lay pages out to fill the display area even when smaller
    pub stretch_to_fit: bool,

    pub show_debug_grid: bool,

    /// Idle wait of a worker between shutdown checks
    pub poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let resample = ResampleConfig::default();
        Self {
            max_tile_pixels: DEFAULT_MAX_TILE_PIXELS,
            memory_ceiling_bytes: 512 * MB,
            worker_count: default_worker_count(),
            prefetch_margin: DEFAULT_PREFETCH_MARGIN,
            min_scale: ScaleLimits::default().min,
            max_scale: ScaleLimits::default().max,
            upsampling_filter: ResampleKernel::CatmullRom,
            downscale_kernel: resample.downscale,
            upscale_kernel: resample.upscale,
            linear_light_downscale: resample.linear_light,
            max_upscale_factor: 4.0,
            stretch_to_fit: false,
            show_debug_grid: false,
            poll_interval_ms: 100,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml(contents: &str) -> ConfigResult<Self> {
        let config: EngineConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    /// Defaults overridden by the environment
    ///
    /// Environment variables:
    /// - `PAGETILE_MAX_TILE_PIXELS`
    /// - `PAGETILE_MEMORY_CEILING_MB`
    /// - `PAGETILE_WORKERS`
    /// - `PAGETILE_PREFETCH_MARGIN`
    /// - `PAGETILE_MIN_SCALE`, `PAGETILE_MAX_SCALE`
    /// - `PAGETILE_UPSAMPLING_FILTER`, `PAGETILE_DOWNSCALE_KERNEL`,
    ///   `PAGETILE_UPSCALE_KERNEL` (`nearest`, `linear`, `catmull-rom`,
    ///   `gaussian`, `lanczos3`)
    /// - `PAGETILE_LINEAR_LIGHT` (`true`/`false`)
    /// - `PAGETILE_MAX_UPSCALE_FACTOR`
    /// - `PAGETILE_STRETCH_TO_FIT`, `PAGETILE_DEBUG_GRID` (`true`/`false`)
    /// - `PAGETILE_POLL_INTERVAL_MS`
    pub fn from_env() -> ConfigResult<Self> {
        Self::default().apply_env()
    }

    /// Optional file, then environment overrides
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        base.apply_env()
    }

    /// Apply any `PAGETILE_*` variables that are set
    pub fn apply_env(mut self) -> ConfigResult<Self> {
        if let Some(value) = env_value("PAGETILE_MAX_TILE_PIXELS")? {
            self.max_tile_pixels = value;
        }
        if let Some(value) = env_value::<usize>("PAGETILE_MEMORY_CEILING_MB")? {
            self.memory_ceiling_bytes = value.saturating_mul(MB);
        }
        if let Some(value) = env_value("PAGETILE_WORKERS")? {
            self.worker_count = value;
        }
        if let Some(value) = env_value("PAGETILE_PREFETCH_MARGIN")? {
            self.prefetch_margin = value;
        }
        if let Some(value) = env_value("PAGETILE_MIN_SCALE")? {
            self.min_scale = value;
        }
        if let Some(value) = env_value("PAGETILE_MAX_SCALE")? {
            self.max_scale = value;
        }
        if let Some(value) = env_value("PAGETILE_UPSAMPLING_FILTER")? {
            self.upsampling_filter = value;
        }
        if let Some(value) = env_value("PAGETILE_DOWNSCALE_KERNEL")? {
            self.downscale_kernel = value;
        }
        if let Some(value) = env_value("PAGETILE_UPSCALE_KERNEL")? {
            self.upscale_kernel = value;
        }
        if let Some(value) = env_value("PAGETILE_LINEAR_LIGHT")? {
            self.linear_light_downscale = value;
        }
        if let Some(value) = env_value("PAGETILE_MAX_UPSCALE_FACTOR")? {
            self.max_upscale_factor = value;
        }
        if let Some(value) = env_value("PAGETILE_STRETCH_TO_FIT")? {
            self.stretch_to_fit = value;
        }
        if let Some(value) = env_value("PAGETILE_DEBUG_GRID")? {
            self.show_debug_grid = value;
        }
        if let Some(value) = env_value("PAGETILE_POLL_INTERVAL_MS")? {
            self.poll_interval_ms = value;
        }

        self.validate()?;
        Ok(self)
    }

    /// Serialize as TOML
    pub fn to_toml(&self) -> ConfigResult<String> {
        Ok(toml::to_string(self)?)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        fs::write(path.as_ref(), self.to_toml()?)?;
        Ok(())
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_tile_pixels == 0 {
            return Err(ConfigError::invalid("max_tile_pixels", "must be at least 1"));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::invalid("worker_count", "must be at least 1"));
        }
        if !self.prefetch_margin.is_finite() || self.prefetch_margin < 0.0 {
            return Err(ConfigError::invalid(
                "prefetch_margin",
                format!("{} is not a non-negative number", self.prefetch_margin),
            ));
        }
        if !(self.min_scale.is_finite() && self.min_scale > 0.0) {
            return Err(ConfigError::invalid("min_scale", "must be positive"));
        }
        if !self.max_scale.is_finite() || self.max_scale < self.min_scale {
            return Err(ConfigError::invalid(
                "max_scale",
                format!("{} is below min_scale {}", self.max_scale, self.min_scale),
            ));
        }
        if !self.max_upscale_factor.is_finite() || self.max_upscale_factor < 1.0 {
            return Err(ConfigError::invalid("max_upscale_factor", "must be at least 1.0"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("poll_interval_ms", "must be at least 1"));
        }
        Ok(())
    }

    pub fn with_max_tile_pixels(mut self, pixels: u64) -> Self {
        self.max_tile_pixels = pixels;
        self
    }

    pub fn with_memory_ceiling_bytes(mut self, bytes: usize) -> Self {
        self.memory_ceiling_bytes = bytes;
        self
    }

    pub fn with_memory_ceiling_mb(mut self, mb: usize) -> Self {
        self.memory_ceiling_bytes = mb.saturating_mul(MB);
        self
    }

    pub fn with_worker_count(mut self, workers: usize) -> Self {
        self.worker_count = workers;
        self
    }

    pub fn with_prefetch_margin(mut self, margin: f32) -> Self {
        self.prefetch_margin = margin;
        self
    }

    pub fn with_scale_limits(mut self, min: f32, max: f32) -> Self {
        self.min_scale = min;
        self.max_scale = max;
        self
    }

    pub fn with_upsampling_filter(mut self, kernel: ResampleKernel) -> Self {
        self.upsampling_filter = kernel;
        self
    }

    pub fn with_downscale_kernel(mut self, kernel: ResampleKernel) -> Self {
        self.downscale_kernel = kernel;
        self
    }

    pub fn with_upscale_kernel(mut self, kernel: ResampleKernel) -> Self {
        self.upscale_kernel = kernel;
        self
    }

    pub fn with_linear_light_downscale(mut self, enabled: bool) -> Self {
        self.linear_light_downscale = enabled;
        self
    }

    pub fn with_max_upscale_factor(mut self, factor: f32) -> Self {
        self.max_upscale_factor = factor;
        self
    }

    pub fn with_stretch_to_fit(mut self, stretch: bool) -> Self {
        self.stretch_to_fit = stretch;
        self
    }

    pub fn with_debug_grid(mut self, enabled: bool) -> Self {
        self.show_debug_grid = enabled;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis().max(1) as u64;
        self
    }

    pub fn memory_ceiling_mb(&self) -> usize {
        self.memory_ceiling_bytes / MB
    }

    pub fn scale_limits(&self) -> ScaleLimits {
        ScaleLimits::new(self.min_scale, self.max_scale)
    }

    pub fn resample_config(&self) -> ResampleConfig {
        ResampleConfig {
            downscale: self.downscale_kernel,
            upscale: self.upscale_kernel,
            linear_light: self.linear_light_downscale,
        }
    }

    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::new(self.worker_count)
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
    }
}

fn env_value<T>(name: &str) -> ConfigResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|error| ConfigError::invalid(name, format!("'{}': {}", raw, error))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const ENV_VARS: &[&str] = &[
        "PAGETILE_MAX_TILE_PIXELS",
        "PAGETILE_MEMORY_CEILING_MB",
        "PAGETILE_WORKERS",
        "PAGETILE_PREFETCH_MARGIN",
        "PAGETILE_MIN_SCALE",
        "PAGETILE_MAX_SCALE",
        "PAGETILE_UPSAMPLING_FILTER",
        "PAGETILE_DOWNSCALE_KERNEL",
        "PAGETILE_UPSCALE_KERNEL",
        "PAGETILE_LINEAR_LIGHT",
        "PAGETILE_MAX_UPSCALE_FACTOR",
        "PAGETILE_STRETCH_TO_FIT",
        "PAGETILE_DEBUG_GRID",
        "PAGETILE_POLL_INTERVAL_MS",
    ];

    // Saves and restores environment variables around a test
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(var_names: &[&str]) -> Self {
            let vars = var_names
                .iter()
                .map(|name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in var_names {
                env::remove_var(name);
            }
            Self { vars }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in &self.vars {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_tile_pixels, 2048 * 2048);
        assert_eq!(config.memory_ceiling_mb(), 512);
        assert!((2..=4).contains(&config.worker_count));
        assert_eq!(config.prefetch_margin, 0.5);
        assert_eq!(config.upsampling_filter, ResampleKernel::CatmullRom);
        assert_eq!(config.downscale_kernel, ResampleKernel::Lanczos3);
        assert!(!config.linear_light_downscale);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = EngineConfig::new()
            .with_max_tile_pixels(1_000_000)
            .with_memory_ceiling_mb(64)
            .with_worker_count(2)
            .with_scale_limits(0.5, 8.0)
            .with_upsampling_filter(ResampleKernel::Nearest)
            .with_debug_grid(true)
            .with_poll_interval(Duration::from_millis(5));

        assert_eq!(config.max_tile_pixels, 1_000_000);
        assert_eq!(config.memory_ceiling_bytes, 64 * MB);
        assert_eq!(config.scale_limits(), ScaleLimits::new(0.5, 8.0));
        assert_eq!(config.worker_pool_config().num_workers, 2);
        assert_eq!(config.worker_pool_config().poll_interval, Duration::from_millis(5));
        assert!(config.show_debug_grid);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = EngineConfig::from_toml(
            r#"
            # Small tiles, tight budget
            max_tile_pixels = 65536
            memory_ceiling_bytes = 1048576
            upsampling_filter = "nearest"
            "#,
        )
        .unwrap();

        assert_eq!(config.max_tile_pixels, 65536);
        assert_eq!(config.memory_ceiling_mb(), 1);
        assert_eq!(config.upsampling_filter, ResampleKernel::Nearest);
        assert_eq!(config.downscale_kernel, ResampleKernel::Lanczos3);
    }

    #[test]
    fn test_from_toml_rejects_bad_values() {
        assert!(matches!(
            EngineConfig::from_toml("worker_count = 0"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            EngineConfig::from_toml("upsampling_filter = \"sharpest\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml("min_scale = 2.0\nmax_scale = 1.0"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_linear_light_reaches_resample_config() {
        let config = EngineConfig::from_toml("linear_light_downscale = true").unwrap();
        assert!(config.linear_light_downscale);
        assert!(config.resample_config().linear_light);
        assert!(!EngineConfig::default().resample_config().linear_light);
    }

    #[test]
    fn test_file_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pagetile.toml");

        let config = EngineConfig::new()
            .with_worker_count(3)
            .with_prefetch_margin(0.25)
            .with_downscale_kernel(ResampleKernel::Gaussian);
        config.save_to_file(&path).unwrap();

        assert_eq!(EngineConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            EngineConfig::from_file("/nonexistent/pagetile.toml"),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    #[serial]
    fn test_from_env() {
        let _guard = EnvGuard::new(ENV_VARS);

        env::set_var("PAGETILE_MAX_TILE_PIXELS", "1000000");
        env::set_var("PAGETILE_MEMORY_CEILING_MB", "128");
        env::set_var("PAGETILE_WORKERS", "3");
        env::set_var("PAGETILE_UPSAMPLING_FILTER", "bilinear");
        env::set_var("PAGETILE_DEBUG_GRID", "true");
        env::set_var("PAGETILE_LINEAR_LIGHT", "true");

        let config = EngineConfig::from_env().unwrap();
        assert!(config.linear_light_downscale);
        assert_eq!(config.max_tile_pixels, 1_000_000);
        assert_eq!(config.memory_ceiling_bytes, 128 * MB);
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.upsampling_filter, ResampleKernel::Linear);
        assert!(config.show_debug_grid);
        assert_eq!(config.prefetch_margin, 0.5);
    }

    #[test]
    #[serial]
    fn test_from_env_invalid() {
        let _guard = EnvGuard::new(ENV_VARS);

        env::set_var("PAGETILE_WORKERS", "many");
        let error = EngineConfig::from_env().unwrap_err();
        assert!(error.to_string().contains("PAGETILE_WORKERS"));
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let _guard = EnvGuard::new(ENV_VARS);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pagetile.toml");
        std::fs::write(&path, "worker_count = 2\nprefetch_margin = 1.0\n").unwrap();

        env::set_var("PAGETILE_WORKERS", "4");
        let config = EngineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.prefetch_margin, 1.0);
    }
}
