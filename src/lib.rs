//! verdure — memory-bounded vegetation image analysis core
//!
//! Loads station imagery with memory-estimation-driven adaptive downscaling,
//! computes per-pixel analytical bands (RGB separation, chromatic
//! coordinates, vegetation index), rasterizes polygon regions into masks,
//! aggregates per-region statistics, and keeps decoded artifacts behind a
//! weak-reference size-bounded LRU cache with live memory telemetry.
//!
//! # Architecture
//!
//! - [`buffer`] — decoded RGB raster with byte-exact memory accounting
//! - [`region`] — polygon regions and rasterized membership masks
//! - [`bands`] — chunked band computation (RGB split, chromatic coordinates)
//! - [`stats`] — streaming per-channel statistics and region aggregates
//! - [`engine`] — single-image state: buffers, overlays, analysis
//! - [`telemetry`] — process/system memory sampling over `sysinfo`
//! - [`cache`] — weak-reference LRU cache bounded in MB
//! - [`loader`] — adaptive decode path feeding engine and cache
//! - [`batch`] — panic-isolated runs over image lists
//! - [`config`] — serde configuration and region-map loading
//!
//! The only cross-call shared structure is the cache: construct one
//! `Arc<BoundedCache<Artifact>>` per process and hand it to the loader.
//!
//! ```no_run
//! use std::sync::Arc;
//! use verdure::{AdaptiveLoader, BoundedCache, CoreConfig, ImageProcessingEngine};
//!
//! let config = CoreConfig::default();
//! let cache = Arc::new(BoundedCache::new(config.cache_max_mb));
//! let mut loader = AdaptiveLoader::new(cache, config.memory_threshold_mb);
//! let mut engine = ImageProcessingEngine::new();
//!
//! if loader.load(&mut engine, "frame.jpg".as_ref(), config.downscale_factor, true) {
//!     engine.overlay_regions_from_map(&Default::default());
//!     let stats = engine.analyze_all_regions(&[], false, false);
//!     for (name, s) in &stats {
//!         println!("{}: {} px", name, s.pixel_count);
//!     }
//! }
//! ```

pub mod bands;
pub mod batch;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod engine;
pub mod loader;
pub mod region;
pub mod stats;
pub mod telemetry;

pub use bands::{ChromaticBands, RgbBands, vegetation_index};
pub use batch::{BatchOptions, BatchOutcome, BatchReport, BatchRunner};
pub use buffer::{ImageBuffer, MemSize};
pub use cache::{BoundedCache, CacheStats};
pub use config::{CoreConfig, load_regions, regions_from_json};
pub use engine::{DEFAULT_REGION, EngineError, ImageProcessingEngine};
pub use loader::{AdaptiveLoader, Artifact, MemoryEstimate, estimate_memory_mb};
pub use region::{Rect, Region, RegionMask};
pub use stats::{BandStats, ChannelStats, Histograms, RegionStats};
pub use telemetry::{BYTES_PER_MB, MemorySample, MemoryTelemetry, TelemetryError};
