//! Batch processing over image lists
//!
//! **Why**: Unattended runs over thousands of frames must hold memory at
//! O(one image), survive any single bad file, and leave nothing cached when
//! they finish. The runner resets all per-image engine state before every
//! load, isolates panics per item, samples memory in the background for the
//! duration of the run, and clears the shared cache at the end.
//!
//! **Used by**: host application (timelapse/station processing loops)

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use log::{info, warn};

use crate::engine::ImageProcessingEngine;
use crate::loader::AdaptiveLoader;
use crate::region::Region;
use crate::stats::RegionStats;
use crate::telemetry::MemoryTelemetry;

/// Per-run knobs. Defaults process full-scale with every analysis pass on.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Requested downscale factor; the loader may shrink it further.
    pub downscale: f64,
    /// Keep a pristine original per image for analysis.
    pub keep_original: bool,
    /// Region names excluded from analysis.
    pub skip_regions: Vec<String>,
    pub skip_chromatic: bool,
    pub skip_rgb: bool,
    /// Run the extended pass (mean color, vegetation, histograms) per region.
    pub extended: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            downscale: 1.0,
            keep_original: true,
            skip_regions: Vec::new(),
            skip_chromatic: false,
            skip_rgb: false,
            extended: false,
        }
    }
}

/// Result for one image, pushed to the sink as soon as it is known.
#[derive(Debug)]
pub struct BatchOutcome {
    pub path: PathBuf,
    pub ok: bool,
    pub regions: IndexMap<String, RegionStats>,
}

impl BatchOutcome {
    fn failed(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            ok: false,
            regions: IndexMap::new(),
        }
    }
}

/// Whole-run tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub processed: usize,
    pub failed: usize,
}

/// Drives loader + engine over a path list.
#[derive(Debug)]
pub struct BatchRunner {
    loader: AdaptiveLoader,
    telemetry: MemoryTelemetry,
    sampling_interval: Duration,
    sampling_threshold_mb: f64,
}

impl BatchRunner {
    pub fn new(
        loader: AdaptiveLoader,
        sampling_interval: Duration,
        sampling_threshold_mb: f64,
    ) -> Self {
        Self {
            loader,
            telemetry: MemoryTelemetry::new(),
            sampling_interval,
            sampling_threshold_mb,
        }
    }

    pub fn loader(&mut self) -> &mut AdaptiveLoader {
        &mut self.loader
    }

    /// Process every path, invoking `sink` once per image in order.
    ///
    /// A failed or panicking image is reported through the sink with
    /// `ok = false` and never aborts the rest of the batch. The shared cache
    /// is cleared when the run completes.
    pub fn run(
        &mut self,
        engine: &mut ImageProcessingEngine,
        paths: &[PathBuf],
        regions: &IndexMap<String, Region>,
        options: &BatchOptions,
        sink: &mut dyn FnMut(BatchOutcome),
    ) -> BatchReport {
        info!("batch start: {} images", paths.len());
        let threshold = self.sampling_threshold_mb;
        self.telemetry
            .start_sampling(self.sampling_interval, threshold, move |sample| {
                warn!(
                    "process memory {:.1} MB exceeds batch threshold {:.1} MB",
                    sample.process_used_mb, threshold
                );
            });

        let mut report = BatchReport::default();
        for path in paths {
            // Per-image teardown bounds growth to one image, not the batch
            engine.reset();
            self.loader.reset_current();

            let outcome =
                catch_unwind(AssertUnwindSafe(|| self.process_one(engine, path, regions, options)));
            match outcome {
                Ok(Some(outcome)) => {
                    report.processed += 1;
                    sink(outcome);
                }
                Ok(None) => {
                    report.failed += 1;
                    sink(BatchOutcome::failed(path));
                }
                Err(_) => {
                    warn!("panic while processing {}; continuing batch", path.display());
                    report.failed += 1;
                    sink(BatchOutcome::failed(path));
                }
            }
        }

        self.telemetry.stop_sampling();
        self.loader.reset_current();
        self.loader.cache().clear();
        info!("batch done: {} processed, {} failed", report.processed, report.failed);
        report
    }

    fn process_one(
        &mut self,
        engine: &mut ImageProcessingEngine,
        path: &Path,
        regions: &IndexMap<String, Region>,
        options: &BatchOptions,
    ) -> Option<BatchOutcome> {
        if !self.loader.load(engine, path, options.downscale, options.keep_original) {
            return None;
        }
        engine.overlay_regions_from_map(regions);

        let stats = if options.extended {
            let names: Vec<String> = engine.regions().keys().cloned().collect();
            let mut results = IndexMap::new();
            for name in names {
                if options.skip_regions.iter().any(|s| s == &name) {
                    continue;
                }
                let stats = engine.analyze_region_extended(&name, true, true);
                results.insert(name, stats);
            }
            results
        } else {
            engine.analyze_all_regions(
                &options.skip_regions,
                options.skip_chromatic,
                options.skip_rgb,
            )
        };

        Some(BatchOutcome {
            path: path.to_path_buf(),
            ok: true,
            regions: stats,
        })
    }
}
