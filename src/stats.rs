//! Aggregate statistics over masked pixels
//!
//! Accumulators stream values chunk by chunk (no per-region value arrays are
//! materialized), then freeze into serializable stats the calling layer can
//! export however it likes.

use serde::Serialize;

use crate::region::Rect;

/// Streaming accumulator: one pass, O(1) state.
#[derive(Debug, Clone)]
pub struct StatsAcc {
    sum: f64,
    sum_sq: f64,
    min: f64,
    max: f64,
    count: usize,
}

impl StatsAcc {
    pub fn new() -> Self {
        Self {
            sum: 0.0,
            sum_sq: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            count: 0,
        }
    }

    #[inline]
    pub fn push(&mut self, v: f64) {
        self.sum += v;
        self.sum_sq += v * v;
        self.min = self.min.min(v);
        self.max = self.max.max(v);
        self.count += 1;
    }

    /// Freeze into stats. An empty accumulator (degenerate mask) freezes to
    /// all-zero stats rather than NaN.
    pub fn finish(&self) -> ChannelStats {
        if self.count == 0 {
            return ChannelStats::default();
        }
        let n = self.count as f64;
        let mean = self.sum / n;
        let variance = (self.sum_sq / n - mean * mean).max(0.0);
        ChannelStats {
            mean,
            std: variance.sqrt(),
            min: self.min,
            max: self.max,
            sum: self.sum,
            count: self.count,
        }
    }
}

impl Default for StatsAcc {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-channel aggregate over a masked region.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChannelStats {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub count: usize,
}

/// One stats triple per band family, channel order RGB.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BandStats {
    pub r: ChannelStats,
    pub g: ChannelStats,
    pub b: ChannelStats,
}

/// 256-bin per-channel histograms.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Histograms {
    pub r: Vec<u32>,
    pub g: Vec<u32>,
    pub b: Vec<u32>,
}

impl Histograms {
    pub fn new() -> Self {
        Self {
            r: vec![0; 256],
            g: vec![0; 256],
            b: vec![0; 256],
        }
    }
}

impl Default for Histograms {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregate statistics for one region
///
/// Every field is optional because callers choose which passes to run; an
/// unknown region name yields the all-`None` default, checked via
/// [`RegionStats::is_empty`] instead of an error.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegionStats {
    /// Raw RGB channel stats over masked pixels.
    pub rgb: Option<BandStats>,
    /// Chromatic-coordinate stats over masked pixels.
    pub chromatic: Option<BandStats>,
    /// Vegetation index (G-R)/(G+R) stats over masked pixels.
    pub vegetation: Option<ChannelStats>,
    /// Mean color of the masked region, RGB.
    pub mean_color: Option<[f64; 3]>,
    /// Per-channel pixel sums over the masked region, RGB.
    pub channel_sums: Option<[f64; 3]>,
    /// Tight bounding rectangle of the mask.
    pub bounding_rect: Option<Rect>,
    /// Full-frame histograms restricted by the mask.
    pub histograms: Option<Histograms>,
    /// Member pixel count of the mask.
    pub pixel_count: usize,
}

impl RegionStats {
    /// True when no pass populated anything and no pixels were counted —
    /// the "unknown region" result shape. A known region analyzed with every
    /// band pass skipped still carries its pixel count and is not empty.
    pub fn is_empty(&self) -> bool {
        self.pixel_count == 0
            && self.rgb.is_none()
            && self.chromatic.is_none()
            && self.vegetation.is_none()
            && self.mean_color.is_none()
            && self.bounding_rect.is_none()
            && self.histograms.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test: Accumulator basics
    /// Validates: mean/std/min/max/sum/count over a known series
    #[test]
    fn test_acc_series() {
        let mut acc = StatsAcc::new();
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            acc.push(v);
        }
        let s = acc.finish();
        assert_eq!(s.count, 8);
        assert!((s.mean - 5.0).abs() < 1e-9);
        assert!((s.std - 2.0).abs() < 1e-9);
        assert_eq!(s.min, 2.0);
        assert_eq!(s.max, 9.0);
        assert_eq!(s.sum, 40.0);
    }

    /// Test: Empty accumulator
    /// Validates: Degenerate masks freeze to zeroed stats, not NaN
    #[test]
    fn test_acc_empty() {
        let s = StatsAcc::new().finish();
        assert_eq!(s, ChannelStats::default());
        assert_eq!(s.count, 0);
        assert!(!s.mean.is_nan());
    }

    /// Test: Constant input
    /// Validates: std is exactly zero for a uniform region
    #[test]
    fn test_acc_constant() {
        let mut acc = StatsAcc::new();
        for _ in 0..1000 {
            acc.push(10.0);
        }
        let s = acc.finish();
        assert_eq!(s.mean, 10.0);
        assert_eq!(s.std, 0.0);
    }

    /// Test: Emptiness check
    /// Validates: is_empty flips once any pass populates a field or pixels
    /// are counted, so a counted-but-unanalyzed region is distinguishable
    /// from the unknown-region shape
    #[test]
    fn test_region_stats_empty() {
        let mut stats = RegionStats::default();
        assert!(stats.is_empty());

        stats.rgb = Some(BandStats::default());
        assert!(!stats.is_empty());

        let mut counted = RegionStats::default();
        counted.pixel_count = 42;
        assert!(!counted.is_empty());
    }
}
