//! Process and system memory telemetry
//!
//! **Why**: Loading decisions (adaptive downscale) and batch guardrails need
//! live memory numbers; `sysinfo` provides both the process RSS and the
//! system totals without platform-specific code.
//!
//! **Used by**: AdaptiveLoader (pre-load headroom check), BatchRunner
//! (background threshold sampling)

use std::sync::Mutex;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::warn;
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Megabyte used for all reporting in this crate: 1e6 bytes, not 2^20.
pub const BYTES_PER_MB: f64 = 1_000_000.0;

/// Telemetry failure (pid not resolvable, process not visible, refresh
/// returned nothing usable). Callers degrade gracefully.
#[derive(Debug)]
pub struct TelemetryError(pub String);

impl std::fmt::Display for TelemetryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "telemetry error: {}", self.0)
    }
}

impl std::error::Error for TelemetryError {}

/// One point-in-time memory reading, all values in MB (1e6 bytes).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemorySample {
    /// Process resident set size.
    pub process_used_mb: f64,
    /// Process virtual size.
    pub process_virtual_mb: f64,
    /// System-wide used memory.
    pub system_used_mb: f64,
    /// System-wide total memory.
    pub system_total_mb: f64,
    /// Used fraction of system memory, in percent.
    pub system_used_pct: f64,
}

impl MemorySample {
    /// System memory still available, floored at zero.
    pub fn system_available_mb(&self) -> f64 {
        (self.system_total_mb - self.system_used_mb).max(0.0)
    }
}

struct SamplerHandle {
    stop_tx: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

/// Memory probe with an optional background sampling thread
///
/// `sample()` is synchronous and cheap enough for per-image use. The
/// background sampler owns its own `System` so refreshes never contend with
/// foreground sampling.
pub struct MemoryTelemetry {
    sys: Mutex<System>,
    pid: Option<Pid>,
    sampler: Option<SamplerHandle>,
}

impl std::fmt::Debug for MemoryTelemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTelemetry")
            .field("pid", &self.pid)
            .field("sampling", &self.sampler.is_some())
            .finish()
    }
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
            sampler: None,
        }
    }

    /// Take one synchronous reading of process and system memory.
    pub fn sample(&self) -> Result<MemorySample, TelemetryError> {
        let pid = self
            .pid
            .ok_or_else(|| TelemetryError("current pid unavailable".into()))?;

        let mut sys = self.sys.lock().unwrap();
        sys.refresh_memory();
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

        let total = sys.total_memory() as f64 / BYTES_PER_MB;
        if total <= 0.0 {
            return Err(TelemetryError("system reports zero total memory".into()));
        }
        let used = sys.used_memory() as f64 / BYTES_PER_MB;

        let process = sys
            .process(pid)
            .ok_or_else(|| TelemetryError(format!("process {} not visible", pid)))?;

        Ok(MemorySample {
            process_used_mb: process.memory() as f64 / BYTES_PER_MB,
            process_virtual_mb: process.virtual_memory() as f64 / BYTES_PER_MB,
            system_used_mb: used,
            system_total_mb: total,
            system_used_pct: used / total * 100.0,
        })
    }

    /// Start a background thread that samples every `interval` and invokes
    /// `on_threshold` whenever process memory exceeds `threshold_mb`.
    ///
    /// A sampler already running is stopped and replaced.
    pub fn start_sampling<F>(&mut self, interval: Duration, threshold_mb: f64, on_threshold: F)
    where
        F: Fn(MemorySample) + Send + 'static,
    {
        if self.sampler.is_some() {
            warn!("sampler already running, restarting");
            self.stop_sampling();
        }

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let thread = std::thread::spawn(move || {
            // Thread-local probe: no lock sharing with the foreground
            let probe = MemoryTelemetry::new();
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        if let Ok(sample) = probe.sample() {
                            if sample.process_used_mb > threshold_mb {
                                on_threshold(sample);
                            }
                        }
                    }
                    // Stop requested or sender dropped
                    _ => break,
                }
            }
        });

        self.sampler = Some(SamplerHandle { stop_tx, thread });
    }

    /// Stop the background sampler and join its thread. Idempotent.
    pub fn stop_sampling(&mut self) {
        if let Some(handle) = self.sampler.take() {
            let _ = handle.stop_tx.send(());
            if handle.thread.join().is_err() {
                warn!("sampler thread panicked");
            }
        }
    }

    pub fn is_sampling(&self) -> bool {
        self.sampler.is_some()
    }
}

impl Default for MemoryTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryTelemetry {
    fn drop(&mut self) {
        self.stop_sampling();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Test: Synchronous sample
    /// Validates: Plausible non-negative readings, percent within [0, 100]
    #[test]
    fn test_sample_plausible() {
        let telemetry = MemoryTelemetry::new();
        let sample = telemetry.sample().unwrap();

        assert!(sample.process_used_mb > 0.0);
        assert!(sample.system_total_mb > 0.0);
        assert!(sample.system_used_mb <= sample.system_total_mb);
        assert!(sample.system_used_pct >= 0.0 && sample.system_used_pct <= 100.0);
        assert!(sample.system_available_mb() >= 0.0);
    }

    /// Test: Background sampler threshold callback
    /// Validates: Callback fires above threshold, stop is deterministic
    #[test]
    fn test_sampler_threshold_fires() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_cb = Arc::clone(&hits);

        let mut telemetry = MemoryTelemetry::new();
        // Threshold 0: every sample is over it
        telemetry.start_sampling(Duration::from_millis(10), 0.0, move |_| {
            hits_cb.fetch_add(1, Ordering::SeqCst);
        });
        assert!(telemetry.is_sampling());

        std::thread::sleep(Duration::from_millis(80));
        telemetry.stop_sampling();
        assert!(!telemetry.is_sampling());

        let fired = hits.load(Ordering::SeqCst);
        assert!(fired >= 1, "expected at least one threshold hit, got {}", fired);

        // Joined thread fires no further callbacks
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(hits.load(Ordering::SeqCst), fired);
    }

    /// Test: Threshold not reached
    /// Validates: Callback stays silent under an unreachable threshold
    #[test]
    fn test_sampler_threshold_silent() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_cb = Arc::clone(&hits);

        let mut telemetry = MemoryTelemetry::new();
        telemetry.start_sampling(Duration::from_millis(10), f64::MAX, move |_| {
            hits_cb.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(50));
        telemetry.stop_sampling();

        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
