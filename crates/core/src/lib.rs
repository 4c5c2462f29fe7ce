//! pagetile core library
//!
//! The tiled progressive image viewer engine. A [`TileEngine`] shares one
//! backend, worker pool and memory-bounded tile cache between every page it
//! opens; each open page is a [`ReaderImage`] driven by viewport updates.
//!
//! # Example
//!
//! ```no_run
//! use pagetile_core::{EngineConfig, TileEngine};
//! use pagetile_render::{DisplaySize, ImageSource, RgbaCanvas};
//! use pagetile_scheduler::ViewportState;
//! use std::time::Duration;
//!
//! let engine = TileEngine::image_rs(EngineConfig::default()).unwrap();
//! let mut page = engine
//!     .open_fitted(ImageSource::from_path("page-001.png"), DisplaySize::new(1080.0, 1920.0))
//!     .unwrap();
//!
//! let viewport = ViewportState::new(1080.0, 1920.0);
//! page.update(&viewport).unwrap();
//! page.wait_until_settled(Duration::from_secs(10));
//!
//! let mut canvas = RgbaCanvas::new(1080, 1920);
//! page.draw(&mut canvas, &viewport);
//! ```

pub mod config;
pub mod decode;
pub mod engine;
pub mod error;
pub mod reader;

pub use config::EngineConfig;
pub use decode::UpdateSummary;
pub use engine::{TileEngine, TileEngineBuilder, TileReadyCallback};
pub use error::{ConfigError, ConfigResult, EngineError, PageError, PageResult};
pub use reader::ReaderImage;
