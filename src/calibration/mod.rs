// src/calibration/mod.rs

pub mod calibrator;
pub mod record;

pub use calibrator::{Calibrator, CalibratorConfig};
pub use record::{CalibrationRecord, CalibrationStore};
