// src/pipeline/metrics.rs
//
// Run counters shared between the lane manager and the alert path.
// Summarised to the log at shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub calibration_frames: Arc<AtomicU64>,
    pub frames_processed: Arc<AtomicU64>,
    pub records_dropped: Arc<AtomicU64>,
    pub possible_spills: Arc<AtomicU64>,
    pub spills_suspected: Arc<AtomicU64>,
    pub alerts_posted: Arc<AtomicU64>,
    pub alert_failures: Arc<AtomicU64>,
    pub frame_time_us: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            calibration_frames: Arc::new(AtomicU64::new(0)),
            frames_processed: Arc::new(AtomicU64::new(0)),
            records_dropped: Arc::new(AtomicU64::new(0)),
            possible_spills: Arc::new(AtomicU64::new(0)),
            spills_suspected: Arc::new(AtomicU64::new(0)),
            alerts_posted: Arc::new(AtomicU64::new(0)),
            alert_failures: Arc::new(AtomicU64::new(0)),
            frame_time_us: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_timing(&self, counter: &AtomicU64, duration_us: u64) {
        counter.store(duration_us, Ordering::Relaxed);
    }

    pub fn fps(&self) -> f64 {
        let frames = self.frames_processed.load(Ordering::Relaxed)
            + self.calibration_frames.load(Ordering::Relaxed);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.01 {
            frames as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            calibration_frames: self.calibration_frames.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            fps: self.fps(),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            possible_spills: self.possible_spills.load(Ordering::Relaxed),
            spills_suspected: self.spills_suspected.load(Ordering::Relaxed),
            alerts_posted: self.alerts_posted.load(Ordering::Relaxed),
            alert_failures: self.alert_failures.load(Ordering::Relaxed),
            last_frame_us: self.frame_time_us.load(Ordering::Relaxed),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSummary {
    pub calibration_frames: u64,
    pub frames_processed: u64,
    pub fps: f64,
    pub records_dropped: u64,
    pub possible_spills: u64,
    pub spills_suspected: u64,
    pub alerts_posted: u64,
    pub alert_failures: u64,
    pub last_frame_us: u64,
    pub elapsed_secs: f64,
}
