// src/traffic/mod.rs
//
// Operational phase: per-cell traffic state and spill confidence, driven
// frame by frame by the lane manager from a loaded calibration store.

pub mod cell;
pub mod lane_manager;

pub use cell::{Cell, CellGeometry};
pub use lane_manager::{FrameOutcome, LaneCells, LaneManager};
