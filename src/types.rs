// src/types.rs

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SchemaError;

/// Sensors encode the travel direction by adding this bias to the lane id.
pub const LANE_ID_BIAS: i64 = 100;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub calibration: CalibrationConfig,
    pub cell: CellConfig,
    pub manager: ManagerConfig,
    pub alerts: AlertConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Sensor frame rate (frames per second)
    pub fps: f64,
    /// Carriageway lane width in meters
    pub lane_width: f64,
    /// Emergency lane width in meters
    pub emergency_width: f64,
    /// Longitudinal cell length in meters
    pub cell_length: f64,
    /// Frames accumulated before `calibrate()` runs
    pub calibration_frames: usize,
    pub store_path: String,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            fps: 20.0,
            lane_width: 3.75,
            emergency_width: 3.5,
            cell_length: 50.0,
            calibration_frames: 6000, // 5 min at 20fps
            store_path: "calibration/clb.yml".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CellConfig {
    /// Seconds an empty cell is tolerated at standard flow before the
    /// time-driven danger reaches 1.0 (tt in r1s = 1 / (tt * fps))
    pub time_tolerance: f64,
    /// Sensor frame rate, copied from the calibration section at start-up
    pub fps: f64,
    /// Reference lane flow (veh/h) at which r1 == r1s
    pub q_standard: f64,
    /// Danger added to cells ahead of a swerving vehicle
    pub r2: f64,
    /// |vx| above this (m/s) is treated as an evasive swerve
    pub lateral_velocity_threshold: f64,
    /// Number of frames kept in each cell cache
    pub cache_retention: usize,
    /// Upper bound of the time-driven danger component
    pub danger_time_cap: f64,
}

impl Default for CellConfig {
    fn default() -> Self {
        Self {
            time_tolerance: 60.0,
            fps: 20.0,
            q_standard: 1000.0,
            r2: 0.1,
            lateral_velocity_threshold: 2.0,
            cache_retention: 100, // 5s at 20fps
            danger_time_cap: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Frames between traffic-state refreshes
    pub traffic_interval_frames: u64,
    /// Number of valid cells ahead of a swerve that receive the r2 boost
    pub boost_reach: usize,
    /// Danger at which a cell is reported as a suspected spill. Keep it at
    /// or below `cell.danger_time_cap` or a vacant cell alone never alarms.
    pub alarm_threshold: f64,
    /// Pending events kept on the bus before the oldest is dropped
    pub max_pending_events: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            traffic_interval_frames: 20,
            boost_reach: 2,
            alarm_threshold: 0.5,
            max_pending_events: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub enabled: bool,
    pub url: String,
    pub device_id: String,
    pub timeout_secs: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "http://127.0.0.1:5000/events".to_string(),
            device_id: "K0+000".to_string(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ============================================================================
// LANES
// ============================================================================

/// Validated, bias-free lane number (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LaneId(u32);

impl LaneId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Strip the direction bias (ids above 100 are `id - 100`) and reject
    /// non-positive lane numbers.
    pub fn from_raw(raw: i64) -> Result<Self, SchemaError> {
        let id = if raw > LANE_ID_BIAS { raw - LANE_ID_BIAS } else { raw };
        if id <= 0 || id > u32::MAX as i64 {
            return Err(SchemaError::InvalidLane(raw));
        }
        Ok(Self(id as u32))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for LaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Signed unit direction of travel along each sensor axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneDirection {
    pub x: i8,
    pub y: i8,
}

impl Default for LaneDirection {
    fn default() -> Self {
        Self { x: 1, y: 1 }
    }
}

impl LaneDirection {
    /// A negative tally flips the axis; zero keeps the positive default.
    pub fn from_votes(votes: &VelocityVotes) -> Self {
        Self {
            x: if votes.x < 0 { -1 } else { 1 },
            y: if votes.y < 0 { -1 } else { 1 },
        }
    }
}

/// Per-frame signed tally of velocity components: +1 for every positive
/// component, -1 for every negative one, nothing for zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VelocityVotes {
    pub x: i64,
    pub y: i64,
}

impl VelocityVotes {
    pub fn record(&mut self, vx: f64, vy: f64) {
        self.x += vote(vx);
        self.y += vote(vy);
    }
}

fn vote(v: f64) -> i64 {
    if v > 0.0 {
        1
    } else if v < 0.0 {
        -1
    } else {
        0
    }
}

// ============================================================================
// DETECTIONS
// ============================================================================

/// Detection record as delivered by the sensor, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawDetection {
    #[serde(rename = "laneID")]
    pub lane_id: Option<i64>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub vx: Option<f64>,
    pub vy: Option<f64>,
}

/// One vehicle in one frame, with a normalized lane id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub lane: LaneId,
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
}

impl TryFrom<&RawDetection> for Detection {
    type Error = SchemaError;

    fn try_from(raw: &RawDetection) -> Result<Self, Self::Error> {
        let lane = raw.lane_id.ok_or(SchemaError::MissingField("laneID"))?;
        Ok(Self {
            lane: LaneId::from_raw(lane)?,
            x: raw.x.ok_or(SchemaError::MissingField("x"))?,
            y: raw.y.ok_or(SchemaError::MissingField("y"))?,
            vx: raw.vx.ok_or(SchemaError::MissingField("vx"))?,
            vy: raw.vy.ok_or(SchemaError::MissingField("vy"))?,
        })
    }
}
