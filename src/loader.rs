//! Adaptive image loading with memory-estimation-driven downscaling
//!
//! **Why**: A multi-megapixel frame costs several times its base size once
//! bands and masks exist. The loader peeks dimensions before any full decode,
//! estimates the processing footprint with fixed multipliers, consults live
//! telemetry, and shrinks the decode factor when the frame would not fit the
//! configured budget. Decoded buffers and derived artifacts are admitted to
//! the shared cache so repeated loads of the same path+scale skip the decode.
//!
//! **Used by**: BatchRunner, host application
//!
//! # Cache keys
//!
//! `"{path}:{downscale}"` for the decoded image; `":rgb"`, `":chromatic"`
//! and `":region:{name}@{generation}"` suffixes for derived artifacts, where
//! the generation comes from the engine and changes on region redefinition.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use log::{debug, info, warn};

use crate::bands::{ChromaticBands, RgbBands};
use crate::buffer::{CHANNELS, ImageBuffer, MemSize};
use crate::cache::BoundedCache;
use crate::engine::ImageProcessingEngine;
use crate::stats::RegionStats;
use crate::telemetry::{BYTES_PER_MB, MemoryTelemetry};

/// Factor at or below which decode goes through the reduced-decode fast path
/// instead of full decode + resize.
const REDUCED_DECODE_MAX_FACTOR: f64 = 0.5;

/// Accounted size for stats artifacts, whose byte length is not meaningful.
const STATS_FALLBACK_BYTES: usize = 1_000_000;

/// One cacheable product of a load: the decoded image or a derived artifact.
///
/// Inner payloads stay behind their own `Arc` so the engine can hold the
/// buffer directly while the cache tracks the wrapper weakly.
#[derive(Debug)]
pub enum Artifact {
    Image(Arc<ImageBuffer>),
    RgbBands(Arc<RgbBands>),
    Chromatic(Arc<ChromaticBands>),
    Stats(Arc<RegionStats>),
}

impl MemSize for Artifact {
    fn mem(&self) -> usize {
        match self {
            Artifact::Image(b) => b.mem(),
            Artifact::RgbBands(b) => b.mem(),
            Artifact::Chromatic(b) => b.mem(),
            Artifact::Stats(_) => STATS_FALLBACK_BYTES,
        }
    }
}

/// Projected memory cost of one image at a given resolution, all in MB.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryEstimate {
    /// Raw pixel buffer.
    pub base_mb: f64,
    /// Buffer as loaded (same as base; decode scratch is transient).
    pub loaded_mb: f64,
    /// Active + pristine original.
    pub with_copy_mb: f64,
    /// Buffers + band planes.
    pub with_processing_mb: f64,
    /// Buffers + bands + masks.
    pub with_masks_mb: f64,
    /// Recommended headroom to process comfortably.
    pub recommended_min_mb: f64,
}

/// Fixed-multiplier footprint estimate: copy 2x, processing 3x, masks 4x,
/// recommended = processing x 1.5.
pub fn estimate_memory_mb(
    width: usize,
    height: usize,
    channels: usize,
    bytes_per_sample: usize,
) -> MemoryEstimate {
    let base = (width * height * channels * bytes_per_sample) as f64 / BYTES_PER_MB;
    MemoryEstimate {
        base_mb: base,
        loaded_mb: base,
        with_copy_mb: base * 2.0,
        with_processing_mb: base * 3.0,
        with_masks_mb: base * 4.0,
        recommended_min_mb: base * 3.0 * 1.5,
    }
}

/// Downscale needed to fit the processing footprint into the budget.
///
/// Shrinks only when the footprint exceeds both the configured threshold and
/// half the currently available memory; memory scales with the square of a
/// linear factor, hence the square root. Result always stays within
/// `[0.1, requested]`.
fn adaptive_downscale(
    estimate: &MemoryEstimate,
    available_mb: f64,
    threshold_mb: f64,
    requested: f64,
) -> f64 {
    if estimate.with_processing_mb > threshold_mb
        && estimate.with_processing_mb > available_mb * 0.5
    {
        let target_mb = threshold_mb.min(available_mb * 0.5);
        (target_mb / estimate.with_processing_mb)
            .sqrt()
            .clamp(0.1, requested)
    } else {
        requested
    }
}

fn artifact_key(path: &Path, downscale: f64) -> String {
    format!("{}:{:.3}", path.display(), downscale)
}

/// Memory-aware front end for [`ImageProcessingEngine::adopt`]
///
/// Holds strong handles to the current image's admitted artifacts so their
/// cache entries stay live exactly as long as the image is current.
#[derive(Debug)]
pub struct AdaptiveLoader {
    memory_threshold_mb: f64,
    cache: Arc<BoundedCache<Artifact>>,
    telemetry: MemoryTelemetry,
    current: Vec<Arc<Artifact>>,
    current_key: Option<String>,
}

impl AdaptiveLoader {
    pub fn new(cache: Arc<BoundedCache<Artifact>>, memory_threshold_mb: f64) -> Self {
        Self {
            memory_threshold_mb,
            cache,
            telemetry: MemoryTelemetry::new(),
            current: Vec::new(),
            current_key: None,
        }
    }

    pub fn cache(&self) -> &Arc<BoundedCache<Artifact>> {
        &self.cache
    }

    /// Cache key of the currently loaded image.
    pub fn current_key(&self) -> Option<&str> {
        self.current_key.as_deref()
    }

    /// Drop strong handles to the current image's artifacts. Their cache
    /// entries expire once no other owner remains.
    pub fn reset_current(&mut self) {
        self.current.clear();
        self.current_key = None;
    }

    /// Load an image through the adaptive path.
    ///
    /// Dimension peek happens without a full decode; the effective downscale
    /// is the requested one unless the estimated processing footprint busts
    /// the budget. Telemetry failure falls back to the requested factor
    /// unchanged. Returns false only on decode failure.
    pub fn load(
        &mut self,
        engine: &mut ImageProcessingEngine,
        path: &Path,
        requested_downscale: f64,
        keep_original: bool,
    ) -> bool {
        let requested = requested_downscale.clamp(0.1, 1.0);

        let (w, h) = match peek_dimensions(path) {
            Ok(dims) => dims,
            Err(e) => {
                // No header, no estimate: let the engine's plain path decide.
                // The previous image's key must not survive the handoff
                warn!("dimension peek failed for {}: {:#}", path.display(), e);
                self.reset_current();
                return engine.load(path, requested, keep_original);
            }
        };

        let estimate = estimate_memory_mb(w as usize, h as usize, CHANNELS, 1);
        let effective = self.effective_downscale(&estimate, requested);
        if effective < requested {
            info!(
                "{}: {:.1} MB processing footprint over budget, downscale {:.3} -> {:.3}",
                path.display(),
                estimate.with_processing_mb,
                requested,
                effective
            );
        }

        let key = artifact_key(path, effective);
        if let Some(artifact) = self.cache.get(&key) {
            if let Artifact::Image(buffer) = &*artifact {
                debug!("cache hit for {}", key);
                engine.adopt(Arc::clone(buffer), keep_original);
                self.current = vec![artifact];
                self.current_key = Some(key);
                return true;
            }
        }

        let buffer = match decode(path, (w, h), effective) {
            Ok(buffer) => Arc::new(buffer),
            Err(e) => {
                warn!("decode failed for {}: {:#}", path.display(), e);
                return false;
            }
        };

        engine.adopt(Arc::clone(&buffer), keep_original);
        let artifact = Arc::new(Artifact::Image(buffer));
        self.cache.put(&key, &artifact, None);
        self.current = vec![artifact];
        self.current_key = Some(key);
        true
    }

    fn effective_downscale(&self, estimate: &MemoryEstimate, requested: f64) -> f64 {
        match self.telemetry.sample() {
            Ok(sample) => adaptive_downscale(
                estimate,
                sample.system_available_mb(),
                self.memory_threshold_mb,
                requested,
            ),
            Err(e) => {
                warn!("{}; keeping requested downscale {:.3}", e, requested);
                requested
            }
        }
    }

    /// Compute both band families through the engine and admit them under
    /// the current image's sub-keys.
    pub fn admit_bands(&mut self, engine: &mut ImageProcessingEngine) {
        let Some(base) = self.current_key.clone() else {
            return;
        };
        if let Some(bands) = engine.compute_rgb_bands(false) {
            let artifact = Arc::new(Artifact::RgbBands(bands));
            self.cache.put(&format!("{}:rgb", base), &artifact, None);
            self.current.push(artifact);
        }
        if let Some(bands) = engine.compute_chromatic_coordinates(false) {
            let artifact = Arc::new(Artifact::Chromatic(bands));
            self.cache.put(&format!("{}:chromatic", base), &artifact, None);
            self.current.push(artifact);
        }
    }

    /// Full per-region statistics, served from the cache when the same
    /// path+scale+region was analyzed before.
    pub fn region_stats(
        &mut self,
        engine: &mut ImageProcessingEngine,
        name: &str,
    ) -> RegionStats {
        let Some(base) = self.current_key.clone() else {
            return engine.analyze_region(name, false, false);
        };

        // Generation in the key: redefining a region under the same name
        // must never serve the old polygon's statistics
        let key = format!(
            "{}:region:{}@{}",
            base,
            name,
            engine.region_generation(name)
        );
        if let Some(artifact) = self.cache.get(&key) {
            if let Artifact::Stats(stats) = &*artifact {
                debug!("cache hit for {}", key);
                return (**stats).clone();
            }
        }

        let stats = engine.analyze_region(name, false, false);
        if !stats.is_empty() {
            let artifact = Arc::new(Artifact::Stats(Arc::new(stats.clone())));
            self.cache.put(&key, &artifact, None);
            self.current.push(artifact);
        }
        stats
    }
}

/// Header-only dimension read, no pixel decode.
fn peek_dimensions(path: &Path) -> anyhow::Result<(u32, u32)> {
    let reader = image::ImageReader::open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    reader
        .into_dimensions()
        .with_context(|| format!("reading header of {}", path.display()))
}

/// Decode at the effective factor. Small factors take the reduced-decode
/// fast path (thumbnail); moderate ones decode fully and resample bilinear.
fn decode(path: &Path, dims: (u32, u32), factor: f64) -> anyhow::Result<ImageBuffer> {
    let img = image::open(path).with_context(|| format!("decoding {}", path.display()))?;

    if factor >= 1.0 {
        return Ok(ImageBuffer::from_dynamic(img));
    }

    if factor <= REDUCED_DECODE_MAX_FACTOR {
        let nw = ((dims.0 as f64 * factor).round() as u32).max(1);
        let nh = ((dims.1 as f64 * factor).round() as u32).max(1);
        Ok(ImageBuffer::from_rgb(img.thumbnail(nw, nh).to_rgb8()))
    } else {
        Ok(ImageBuffer::from_dynamic(img).resized(factor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Region;
    use std::path::PathBuf;

    fn temp_png(name: &str, w: u32, h: u32, rgb: [u8; 3]) -> PathBuf {
        let path = std::env::temp_dir().join(name);
        image::RgbImage::from_pixel(w, h, image::Rgb(rgb))
            .save(&path)
            .unwrap();
        path
    }

    /// Test: Estimate multipliers and monotonicity
    /// Validates: Fixed 2x/3x/4x/1.5x chain, smaller frames never estimate larger
    #[test]
    fn test_estimate_memory() {
        let e = estimate_memory_mb(1000, 1000, 3, 1);
        assert!((e.base_mb - 3.0).abs() < 1e-9);
        assert_eq!(e.loaded_mb, e.base_mb);
        assert!((e.with_copy_mb - 6.0).abs() < 1e-9);
        assert!((e.with_processing_mb - 9.0).abs() < 1e-9);
        assert!((e.with_masks_mb - 12.0).abs() < 1e-9);
        assert!((e.recommended_min_mb - 13.5).abs() < 1e-9);

        let half = estimate_memory_mb(500, 500, 3, 1);
        assert!(half.base_mb <= e.base_mb);
    }

    /// Test: Adaptive downscale bounds
    /// Validates: Result never leaves [0.1, requested]; small frames untouched
    #[test]
    fn test_adaptive_downscale() {
        // Huge frame, tiny budget: clamps at the floor
        let big = estimate_memory_mb(20000, 20000, 3, 1);
        let factor = adaptive_downscale(&big, 1000.0, 100.0, 1.0);
        assert!((0.1..=1.0).contains(&factor));
        assert!(factor < 1.0);

        // sqrt relation: 9 MB footprint into a 4 MB target -> 2/3
        let e = estimate_memory_mb(1000, 1000, 3, 1);
        let factor = adaptive_downscale(&e, 8.0, 4.0, 1.0);
        assert!((factor - (4.0f64 / 9.0).sqrt()).abs() < 1e-9);

        // Under budget: requested passes through
        let small = estimate_memory_mb(100, 100, 3, 1);
        assert_eq!(adaptive_downscale(&small, 100_000.0, 1000.0, 0.8), 0.8);

        // Never above requested even when nothing shrinks
        let factor = adaptive_downscale(&big, 1e12, 1e12, 0.4);
        assert_eq!(factor, 0.4);
    }

    /// Test: Cache key format
    /// Validates: path + fixed-precision downscale, stable across calls
    #[test]
    fn test_artifact_key() {
        let path = Path::new("/data/site/img_0001.jpg");
        assert_eq!(artifact_key(path, 1.0), "/data/site/img_0001.jpg:1.000");
        assert_eq!(artifact_key(path, 0.5), "/data/site/img_0001.jpg:0.500");
        assert_ne!(artifact_key(path, 0.5), artifact_key(path, 0.25));
    }

    /// Test: Load round-trip and cache hit
    /// Validates: Second load of the same path+scale adopts the cached buffer
    #[test]
    fn test_load_and_cache_hit() {
        let path = temp_png("verdure_loader_hit.png", 64, 48, [200, 100, 50]);
        let cache = Arc::new(BoundedCache::new(100.0));
        let mut loader = AdaptiveLoader::new(Arc::clone(&cache), 1e9);
        let mut engine = ImageProcessingEngine::new();

        assert!(loader.load(&mut engine, &path, 1.0, true));
        assert_eq!(engine.resolution(), Some((64, 48)));
        assert_eq!(cache.stats().count, 1);
        let first = engine.original().unwrap();

        assert!(loader.load(&mut engine, &path, 1.0, true));
        let second = engine.original().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.stats().count, 1);

        std::fs::remove_file(&path).ok();
    }

    /// Test: Distinct downscales are distinct entries
    /// Validates: Key includes the effective factor; thumbnail path dimensions
    #[test]
    fn test_load_downscaled() {
        let path = temp_png("verdure_loader_scale.png", 64, 48, [10, 20, 30]);
        let cache = Arc::new(BoundedCache::new(100.0));
        let mut loader = AdaptiveLoader::new(Arc::clone(&cache), 1e9);
        let mut engine = ImageProcessingEngine::new();

        assert!(loader.load(&mut engine, &path, 1.0, true));
        assert!(loader.load(&mut engine, &path, 0.5, true));
        assert_eq!(engine.resolution(), Some((32, 24)));
        assert_eq!(cache.stats().count, 2);

        std::fs::remove_file(&path).ok();
    }

    /// Test: Missing file
    /// Validates: false, never a panic
    #[test]
    fn test_load_missing() {
        let cache = Arc::new(BoundedCache::new(100.0));
        let mut loader = AdaptiveLoader::new(cache, 1e9);
        let mut engine = ImageProcessingEngine::new();
        assert!(!loader.load(&mut engine, Path::new("/nonexistent/x.jpg"), 1.0, true));
        assert!(!engine.has_image());
    }

    /// Test: Region stats admission
    /// Validates: Second request is served from the cache, values match
    #[test]
    fn test_region_stats_cached() {
        let path = temp_png("verdure_loader_stats.png", 32, 32, [10, 20, 30]);
        let cache = Arc::new(BoundedCache::new(100.0));
        let mut loader = AdaptiveLoader::new(Arc::clone(&cache), 1e9);
        let mut engine = ImageProcessingEngine::new();

        assert!(loader.load(&mut engine, &path, 1.0, true));
        engine.overlay_region("roi", Region::rect(0.0, 0.0, 31.0, 31.0));

        let first = loader.region_stats(&mut engine, "roi");
        assert_eq!(first.pixel_count, 32 * 32);
        let count_after_first = cache.stats().count;
        assert!(count_after_first >= 2); // image + stats

        let second = loader.region_stats(&mut engine, "roi");
        assert_eq!(second.pixel_count, first.pixel_count);
        assert_eq!(second.rgb, first.rgb);
        assert_eq!(cache.stats().count, count_after_first);

        std::fs::remove_file(&path).ok();
    }

    /// Test: Region redefinition under a reused name
    /// Validates: Cached statistics never outlive the polygon they describe
    #[test]
    fn test_region_stats_not_stale_after_redefine() {
        let path = temp_png("verdure_loader_redefine.png", 16, 16, [10, 20, 30]);
        let cache = Arc::new(BoundedCache::new(100.0));
        let mut loader = AdaptiveLoader::new(Arc::clone(&cache), 1e9);
        let mut engine = ImageProcessingEngine::new();

        assert!(loader.load(&mut engine, &path, 1.0, true));
        engine.overlay_region("A", Region::rect(0.0, 0.0, 15.0, 15.0));
        let first = loader.region_stats(&mut engine, "A");
        assert_eq!(first.pixel_count, 256);

        engine.overlay_region("A", Region::rect(0.0, 0.0, 7.0, 7.0));
        assert_eq!(engine.analyze_region("A", false, false).pixel_count, 64);
        let second = loader.region_stats(&mut engine, "A");
        assert_eq!(second.pixel_count, 64);

        std::fs::remove_file(&path).ok();
    }

    /// Test: Peek-failure fallback
    /// Validates: The previous image's cache key does not survive the handoff
    /// to the plain engine load path
    #[test]
    fn test_peek_failure_resets_current() {
        let path = temp_png("verdure_loader_fallback.png", 16, 16, [10, 20, 30]);
        let cache = Arc::new(BoundedCache::new(100.0));
        let mut loader = AdaptiveLoader::new(Arc::clone(&cache), 1e9);
        let mut engine = ImageProcessingEngine::new();

        assert!(loader.load(&mut engine, &path, 1.0, true));
        assert!(loader.current_key().is_some());

        assert!(!loader.load(&mut engine, Path::new("/nonexistent/y.jpg"), 1.0, true));
        assert!(loader.current_key().is_none());

        std::fs::remove_file(&path).ok();
    }

    /// Test: Band admission
    /// Validates: rgb/chromatic sub-keys appear, reset_current expires them
    #[test]
    fn test_admit_bands_and_reset() {
        let path = temp_png("verdure_loader_bands.png", 16, 16, [60, 120, 30]);
        let cache = Arc::new(BoundedCache::new(100.0));
        let mut loader = AdaptiveLoader::new(Arc::clone(&cache), 1e9);
        let mut engine = ImageProcessingEngine::new();

        assert!(loader.load(&mut engine, &path, 1.0, true));
        loader.admit_bands(&mut engine);
        assert_eq!(cache.stats().count, 3);

        let key = loader.current_key().unwrap().to_string();
        assert!(cache.get(&format!("{}:rgb", key)).is_some());

        // Engine still owns the buffer and bands; dropping them plus the
        // loader handles expires everything
        engine.reset();
        loader.reset_current();
        assert!(cache.get(&format!("{}:rgb", key)).is_none());
        assert!(cache.get(&key).is_none());

        std::fs::remove_file(&path).ok();
    }
}
