//! Image processing engine: buffers, regions, bands, per-region statistics
//!
//! **Why**: The engine owns exactly one image worth of state. Overlays are
//! drawn on an active buffer while an optional duplicate "original" stays
//! pristine as the source of truth for analysis, so display never corrupts
//! statistics. Derived bands and masks are computed lazily and cached until
//! the image or a region changes.
//!
//! **Used by**: AdaptiveLoader (buffer adoption), BatchRunner (per-image
//! processing), host UI (display buffers)
//!
//! # Memory shape
//!
//! Heavy passes (chromatic coordinates, extended region statistics, sky
//! detection) walk the frame in row windows of at most
//! [`crate::bands::CHUNK_ROWS`] rows; nothing materializes a second
//! full-resolution derived array beyond the band planes themselves.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use log::{debug, info, warn};

use crate::bands::{self, CHUNK_ROWS, ChromaticBands, RgbBands};
use crate::buffer::{ImageBuffer, rgb_to_hsv};
use crate::region::{Region, RegionMask, draw_outline};
use crate::stats::{BandStats, Histograms, RegionStats, StatsAcc};

/// Name of the region synthesized when no region map is supplied.
pub const DEFAULT_REGION: &str = "ROI_00";

// Sky-exclusion heuristic. Empirically tuned constants, reproduced as-is;
// approximate by design, see `detect_sky_line`.
const SKY_ROW_FRACTION: f32 = 0.30;
const SKY_MARGIN_FRACTION: f64 = 0.10;
const SKY_BLUE_HUE: (f32, f32) = (180.0, 260.0);
const SKY_BLUE_MIN_SAT: f32 = 0.2;
const SKY_BLUE_MIN_VAL: f32 = 0.3;
const SKY_WHITE_MAX_SAT: f32 = 0.15;
const SKY_WHITE_MIN_VAL: f32 = 0.6;

/// Load-time errors. Recovered locally: `load` logs and returns false.
#[derive(Debug)]
pub enum EngineError {
    FileNotFound(PathBuf),
    Decode(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::FileNotFound(p) => write!(f, "file not found: {}", p.display()),
            EngineError::Decode(e) => write!(f, "decode failure: {}", e),
        }
    }
}

impl std::error::Error for EngineError {}

/// Single-image processing engine
///
/// Buffers are exclusively owned by one instance and never shared; the one
/// cross-call shared structure in this crate is [`crate::cache::BoundedCache`].
#[derive(Debug, Default)]
pub struct ImageProcessingEngine {
    /// Display buffer; overlays are drawn here.
    active: Option<ImageBuffer>,
    /// Pristine duplicate used for band/statistics computation. Shared so the
    /// loader can admit it to the cache without a copy.
    original: Option<Arc<ImageBuffer>>,
    /// Resolution remembered after `release_original`.
    prior_resolution: Option<(usize, usize)>,

    regions: IndexMap<String, Region>,
    masks: HashMap<String, Arc<RegionMask>>,
    /// Per-name definition generation, bumped on every store/replace so
    /// external caches can detect redefinition under a reused name.
    region_generations: HashMap<String, u64>,
    next_generation: u64,

    rgb_bands: Option<Arc<RgbBands>>,
    chromatic: Option<Arc<ChromaticBands>>,
    stats_cache: HashMap<String, Arc<RegionStats>>,
}

impl ImageProcessingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode an image from disk and make it the current buffer.
    ///
    /// `downscale` < 1.0 resizes after decode (bilinear). `keep_original`
    /// stores a pristine duplicate for analysis. Returns false (and logs) on
    /// a missing file or decode failure; never panics for a missing file.
    pub fn load(&mut self, path: &Path, downscale: f64, keep_original: bool) -> bool {
        match self.try_load(path, downscale) {
            Ok(buffer) => {
                let (w, h) = buffer.resolution();
                info!("loaded {} ({}x{}, downscale {:.2})", path.display(), w, h, downscale);
                self.install(Arc::new(buffer), keep_original);
                true
            }
            Err(e) => {
                warn!("load failed for {}: {}", path.display(), e);
                false
            }
        }
    }

    fn try_load(&self, path: &Path, downscale: f64) -> Result<ImageBuffer, EngineError> {
        if !path.exists() {
            return Err(EngineError::FileNotFound(path.to_path_buf()));
        }
        let img = image::open(path).map_err(|e| EngineError::Decode(e.to_string()))?;
        let buffer = ImageBuffer::from_dynamic(img);
        if downscale < 1.0 {
            Ok(buffer.resized(downscale))
        } else {
            Ok(buffer)
        }
    }

    /// Take ownership of an already-decoded buffer (the AdaptiveLoader path,
    /// where decode and downscale happened upstream).
    pub fn adopt(&mut self, buffer: Arc<ImageBuffer>, keep_original: bool) {
        self.install(buffer, keep_original);
    }

    fn install(&mut self, buffer: Arc<ImageBuffer>, keep_original: bool) {
        self.active = Some((*buffer).clone());
        self.original = if keep_original { Some(buffer) } else { None };
        self.prior_resolution = None;
        self.invalidate_derived();
    }

    /// Drop every derived artifact tied to the previous buffer. Masks and
    /// bands must never outlive a dimension change.
    fn invalidate_derived(&mut self) {
        self.masks.clear();
        self.rgb_bands = None;
        self.chromatic = None;
        self.stats_cache.clear();
    }

    /// Analysis source of truth: the pristine original when kept, otherwise
    /// the active buffer.
    fn source(&self) -> Option<&ImageBuffer> {
        self.original.as_deref().or(self.active.as_ref())
    }

    /// Shared handle to the pristine buffer, if kept.
    pub fn original(&self) -> Option<Arc<ImageBuffer>> {
        self.original.clone()
    }

    pub fn has_image(&self) -> bool {
        self.active.is_some()
    }

    /// Resolution of the analysis source.
    pub fn resolution(&self) -> Option<(usize, usize)> {
        self.source().map(|b| b.resolution())
    }

    /// Display buffer with overlays, or the pristine buffer without.
    ///
    /// If the original was released to save memory, the overlaid active
    /// buffer is returned with a warning instead of failing.
    pub fn get_image(&self, with_overlays: bool) -> Option<&ImageBuffer> {
        if with_overlays {
            return self.active.as_ref();
        }
        if let Some(orig) = self.original.as_deref() {
            return Some(orig);
        }
        if self.active.is_some() {
            warn!("original buffer was released; returning active buffer (with overlays)");
        }
        self.active.as_ref()
    }

    /// Drop the pristine duplicate once overlays are final. Only the prior
    /// resolution is remembered.
    pub fn release_original(&mut self) {
        if let Some(orig) = self.original.take() {
            self.prior_resolution = Some(orig.resolution());
            debug!("released original buffer ({} bytes)", crate::buffer::MemSize::mem(&*orig));
        }
    }

    /// Resolution recorded by `release_original`.
    pub fn prior_resolution(&self) -> Option<(usize, usize)> {
        self.prior_resolution
    }

    /// Store/replace a named region and draw it onto the active buffer.
    ///
    /// Replacing a region under an existing name invalidates its cached mask
    /// and statistics. Fill (alpha > 0) builds the mask eagerly; outline-only
    /// regions leave mask building to the first statistics request.
    pub fn overlay_region(&mut self, name: &str, region: Region) {
        self.masks.remove(name);
        self.stats_cache.remove(name);
        self.next_generation += 1;
        self.region_generations
            .insert(name.to_string(), self.next_generation);

        if let Some(active) = self.active.as_mut() {
            draw_outline(&region, active);
            if region.alpha > 0.0 {
                let (w, h) = active.resolution();
                let mask = Arc::new(RegionMask::build(&region, w, h));
                for y in 0..h {
                    for x in 0..w {
                        if mask.contains(x, y) {
                            active.blend_pixel(x, y, region.color, region.alpha);
                        }
                    }
                }
                self.masks.insert(name.to_string(), mask);
            }
        }

        self.regions.insert(name.to_string(), region);
    }

    /// Reset overlays to the pristine image, clear all regions, then apply
    /// each entry of the map.
    ///
    /// An empty map synthesizes one default region named [`DEFAULT_REGION`]
    /// covering the frame minus the detected sky band.
    pub fn overlay_regions_from_map(&mut self, regions: &IndexMap<String, Region>) {
        if let Some(orig) = self.original.as_deref() {
            self.active = Some(orig.clone());
        }
        self.regions.clear();
        self.masks.clear();
        self.region_generations.clear();
        self.stats_cache.clear();

        if regions.is_empty() {
            if let Some(region) = self.synthesize_default_region() {
                debug!("no regions supplied, synthesizing {}", DEFAULT_REGION);
                self.overlay_region(DEFAULT_REGION, region);
            } else {
                warn!("no regions supplied and no image loaded; nothing to overlay");
            }
        } else {
            for (name, region) in regions {
                self.overlay_region(name, region.clone());
            }
        }
    }

    /// Remove every region, mask and cached statistic. Buffers stay.
    pub fn clear_regions(&mut self) {
        self.regions.clear();
        self.masks.clear();
        self.region_generations.clear();
        self.stats_cache.clear();
    }

    pub fn regions(&self) -> &IndexMap<String, Region> {
        &self.regions
    }

    /// Definition generation of a named region: changes every time the name
    /// is stored or replaced, 0 for unknown names. External caches key on
    /// this so stale statistics never survive a redefinition.
    pub fn region_generation(&self, name: &str) -> u64 {
        self.region_generations.get(name).copied().unwrap_or(0)
    }

    /// Full per-image teardown: buffers, regions, masks, bands, statistics.
    pub fn reset(&mut self) {
        self.active = None;
        self.original = None;
        self.prior_resolution = None;
        self.regions.clear();
        self.region_generations.clear();
        self.invalidate_derived();
    }

    // ===== Derived bands =====

    /// Channel-split bands of the source buffer, cached until reload.
    pub fn compute_rgb_bands(&mut self, force_recompute: bool) -> Option<Arc<RgbBands>> {
        if force_recompute {
            self.rgb_bands = None;
        }
        if self.rgb_bands.is_none() {
            let bands = Arc::new(RgbBands::compute(self.source()?));
            self.rgb_bands = Some(bands);
        }
        self.rgb_bands.clone()
    }

    /// Chromatic coordinates of the source buffer, cached until reload.
    pub fn compute_chromatic_coordinates(
        &mut self,
        force_recompute: bool,
    ) -> Option<Arc<ChromaticBands>> {
        if force_recompute {
            self.chromatic = None;
        }
        if self.chromatic.is_none() {
            let bands = Arc::new(ChromaticBands::compute(self.source()?));
            self.chromatic = Some(bands);
        }
        self.chromatic.clone()
    }

    // ===== Region masks =====

    /// Cached mask for a named region, built on first request. Returns None
    /// for unknown regions or when no image is loaded. A cached mask whose
    /// canvas no longer matches the source resolution is rebuilt.
    fn mask_for(&mut self, name: &str) -> Option<Arc<RegionMask>> {
        let (w, h) = self.source()?.resolution();

        if let Some(mask) = self.masks.get(name) {
            if mask.width() == w && mask.height() == h {
                return Some(Arc::clone(mask));
            }
        }

        let region = self.regions.get(name)?.clone();
        let mask = Arc::new(RegionMask::build(&region, w, h));
        self.masks.insert(name.to_string(), Arc::clone(&mask));
        Some(mask)
    }

    // ===== Statistics =====

    /// Per-band statistics over a region's masked pixels.
    ///
    /// Unknown region names yield the empty default (check
    /// [`RegionStats::is_empty`]), never an error. The full variant (neither
    /// band family skipped) is cached per name; skip variants are computed
    /// fresh.
    pub fn analyze_region(
        &mut self,
        name: &str,
        skip_chromatic: bool,
        skip_rgb: bool,
    ) -> RegionStats {
        if !self.regions.contains_key(name) {
            debug!("analyze_region: unknown region '{}'", name);
            return RegionStats::default();
        }

        let cacheable = !skip_chromatic && !skip_rgb;
        if cacheable {
            if let Some(stats) = self.stats_cache.get(name) {
                return (**stats).clone();
            }
        }

        let Some(mask) = self.mask_for(name) else {
            return RegionStats::default();
        };

        let mut stats = RegionStats {
            pixel_count: mask.count(),
            ..RegionStats::default()
        };

        if !skip_rgb {
            if let Some(bands) = self.compute_rgb_bands(false) {
                stats.rgb = Some(band_stats_u8(&bands.r, &bands.g, &bands.b, &mask));
            }
        }
        if !skip_chromatic {
            if let Some(bands) = self.compute_chromatic_coordinates(false) {
                stats.chromatic = Some(band_stats_f32(&bands.r, &bands.g, &bands.b, &mask));
            }
        }

        if cacheable {
            self.stats_cache.insert(name.to_string(), Arc::new(stats.clone()));
        }
        stats
    }

    /// Extended per-region analysis: mean color and channel sums, mask
    /// bounding rectangle, vegetation index statistics, optional 256-bin
    /// histograms. Walks the frame in row windows of at most CHUNK_ROWS.
    pub fn analyze_region_extended(
        &mut self,
        name: &str,
        compute_histograms: bool,
        compute_vegetation: bool,
    ) -> RegionStats {
        let mut stats = self.analyze_region(name, false, false);
        if !self.regions.contains_key(name) {
            return stats;
        }
        let Some(mask) = self.mask_for(name) else {
            return stats;
        };
        let Some(src) = self.source() else {
            return stats;
        };

        let (w, h) = src.resolution();
        let mut sums = [0f64; 3];
        let mut count = 0usize;
        let mut veg = StatsAcc::new();
        let mut hist = Histograms::new();

        let chunk = CHUNK_ROWS.min(h.max(1));
        let mut row = 0;
        while row < h {
            let end = (row + chunk).min(h);
            for y in row..end {
                for x in 0..w {
                    if !mask.contains(x, y) {
                        continue;
                    }
                    let [r, g, b] = src.pixel(x, y);
                    sums[0] += r as f64;
                    sums[1] += g as f64;
                    sums[2] += b as f64;
                    count += 1;

                    if compute_vegetation {
                        veg.push(bands::vegetation_index(r, g) as f64);
                    }
                    if compute_histograms {
                        hist.r[r as usize] += 1;
                        hist.g[g as usize] += 1;
                        hist.b[b as usize] += 1;
                    }
                }
            }
            row = end;
        }

        stats.pixel_count = count;
        stats.channel_sums = Some(sums);
        stats.mean_color = Some(if count > 0 {
            let n = count as f64;
            [sums[0] / n, sums[1] / n, sums[2] / n]
        } else {
            [0.0; 3]
        });
        stats.bounding_rect = mask.bounding_rect();
        if compute_vegetation {
            stats.vegetation = Some(veg.finish());
        }
        if compute_histograms {
            stats.histograms = Some(hist);
        }
        stats
    }

    /// Crop the source to the mask's bounding rectangle, zeroing pixels
    /// outside the mask. None for unknown regions or empty masks.
    pub fn extract_region(&mut self, name: &str) -> Option<ImageBuffer> {
        let mask = self.mask_for(name)?;
        let rect = mask.bounding_rect()?;
        let src = self.source()?;

        let mut out = ImageBuffer::new(rect.width, rect.height);
        for y in 0..rect.height {
            for x in 0..rect.width {
                let (sx, sy) = (rect.x + x, rect.y + y);
                if mask.contains(sx, sy) {
                    out.set_pixel(x, y, src.pixel(sx, sy));
                }
            }
        }
        Some(out)
    }

    /// Analyze every stored region, computing bands once up front. Names in
    /// `skip` are left out of the result map.
    pub fn analyze_all_regions(
        &mut self,
        skip: &[String],
        skip_chromatic: bool,
        skip_rgb: bool,
    ) -> IndexMap<String, RegionStats> {
        if !skip_rgb {
            self.compute_rgb_bands(false);
        }
        if !skip_chromatic {
            self.compute_chromatic_coordinates(false);
        }

        let names: Vec<String> = self.regions.keys().cloned().collect();
        let mut results = IndexMap::new();
        for name in names {
            if skip.iter().any(|s| s == &name) {
                continue;
            }
            let stats = self.analyze_region(&name, skip_chromatic, skip_rgb);
            results.insert(name, stats);
        }
        results
    }

    // ===== Sky-exclusion default region =====

    /// Synthesize the default region: the frame minus the detected sky band.
    fn synthesize_default_region(&self) -> Option<Region> {
        let src = self.source()?;
        let (w, h) = src.resolution();
        if w == 0 || h == 0 {
            return None;
        }

        let top = match detect_sky_line(src) {
            Some(lowest_sky_row) => {
                let margin = (h as f64 * SKY_MARGIN_FRACTION).round() as usize;
                (lowest_sky_row + margin).min(h - 1)
            }
            None => 0,
        };

        debug!("default region starts at row {} of {}", top, h);
        Some(Region::rect(0.0, top as f32, (w - 1) as f32, (h - 1) as f32))
    }
}

/// Scan the top third of the frame for sky rows.
///
/// A row is "sky" when more than SKY_ROW_FRACTION of its pixels fall in
/// either the blue-sky or the white/overcast HSV range. Rows are visited in
/// windows of at most CHUNK_ROWS; the lowest matching row (closest to the
/// horizon) wins. Heuristic, not a contract: thresholds are empirically
/// tuned and deterministic, nothing more.
fn detect_sky_line(src: &ImageBuffer) -> Option<usize> {
    let (w, h) = src.resolution();
    if w == 0 || h < 3 {
        return None;
    }

    let limit = h / 3;
    let chunk = CHUNK_ROWS.min(limit.max(1));
    let mut lowest: Option<usize> = None;

    let mut row = 0;
    while row < limit {
        let end = (row + chunk).min(limit);
        for y in row..end {
            let mut sky_pixels = 0usize;
            for x in 0..w {
                let [r, g, b] = src.pixel(x, y);
                if is_sky_color(r, g, b) {
                    sky_pixels += 1;
                }
            }
            if sky_pixels as f32 > w as f32 * SKY_ROW_FRACTION {
                lowest = Some(y);
            }
        }
        row = end;
    }

    lowest
}

#[inline]
fn is_sky_color(r: u8, g: u8, b: u8) -> bool {
    let (h, s, v) = rgb_to_hsv(r, g, b);
    let blue =
        h >= SKY_BLUE_HUE.0 && h <= SKY_BLUE_HUE.1 && s >= SKY_BLUE_MIN_SAT && v >= SKY_BLUE_MIN_VAL;
    let white = s <= SKY_WHITE_MAX_SAT && v >= SKY_WHITE_MIN_VAL;
    blue || white
}

fn band_stats_u8(r: &[u8], g: &[u8], b: &[u8], mask: &RegionMask) -> BandStats {
    let mut accs = [StatsAcc::new(), StatsAcc::new(), StatsAcc::new()];
    for (p, &m) in mask.data().iter().enumerate() {
        if m != 0 {
            accs[0].push(r[p] as f64);
            accs[1].push(g[p] as f64);
            accs[2].push(b[p] as f64);
        }
    }
    BandStats {
        r: accs[0].finish(),
        g: accs[1].finish(),
        b: accs[2].finish(),
    }
}

fn band_stats_f32(r: &[f32], g: &[f32], b: &[f32], mask: &RegionMask) -> BandStats {
    let mut accs = [StatsAcc::new(), StatsAcc::new(), StatsAcc::new()];
    for (p, &m) in mask.data().iter().enumerate() {
        if m != 0 {
            accs[0].push(r[p] as f64);
            accs[1].push(g[p] as f64);
            accs[2].push(b[p] as f64);
        }
    }
    BandStats {
        r: accs[0].finish(),
        g: accs[1].finish(),
        b: accs[2].finish(),
    }
}
