//! Runtime configuration and region-map loading
//!
//! Plain serde structs with field-level defaults; every knob is optional in
//! the JSON and out-of-range values are normalized, not rejected. Region
//! styling defaults resolve here at the boundary, never inside the engine.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::region::Region;

fn default_memory_threshold_mb() -> f64 {
    1000.0
}

fn default_cache_max_mb() -> f64 {
    500.0
}

fn default_sampling_interval_sec() -> u64 {
    30
}

fn default_downscale_factor() -> f64 {
    1.0
}

/// Core knobs consumed from host configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Processing-footprint budget driving adaptive downscale.
    #[serde(default = "default_memory_threshold_mb")]
    pub memory_threshold_mb: f64,
    /// Shared artifact cache bound.
    #[serde(default = "default_cache_max_mb")]
    pub cache_max_mb: f64,
    /// Background telemetry sampling period.
    #[serde(default = "default_sampling_interval_sec")]
    pub sampling_interval_sec: u64,
    /// Default requested downscale, valid range [0.1, 1.0].
    #[serde(default = "default_downscale_factor")]
    pub downscale_factor: f64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            memory_threshold_mb: default_memory_threshold_mb(),
            cache_max_mb: default_cache_max_mb(),
            sampling_interval_sec: default_sampling_interval_sec(),
            downscale_factor: default_downscale_factor(),
        }
    }
}

impl CoreConfig {
    /// Parse from a JSON string. Missing fields take defaults; the downscale
    /// factor is clamped into its valid range.
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let mut config: CoreConfig =
            serde_json::from_str(text).context("parsing core configuration")?;
        config.normalize();
        Ok(config)
    }

    /// Read and parse a JSON configuration file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_json(&text)
    }

    fn normalize(&mut self) {
        self.downscale_factor = self.downscale_factor.clamp(0.1, 1.0);
    }

    pub fn sampling_interval(&self) -> Duration {
        Duration::from_secs(self.sampling_interval_sec)
    }
}

/// Parse a `name -> Region` map from JSON, preserving declaration order.
/// Styling defaults (green, 2px, no fill, closed) resolve during parsing.
pub fn regions_from_json(text: &str) -> anyhow::Result<IndexMap<String, Region>> {
    serde_json::from_str(text).context("parsing region map")
}

/// Read and parse a region-map file.
pub fn load_regions(path: &Path) -> anyhow::Result<IndexMap<String, Region>> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    regions_from_json(&text)
}
