// src/error.rs
//
// Typed failures of the calibration and cell-state layers. The binary and
// the I/O edges (config, store, replay, HTTP) wrap these in anyhow.

use thiserror::Error;

use crate::types::LaneId;

/// A detection record could not be turned into a typed `Detection`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    #[error("detection record is missing required field `{0}`")]
    MissingField(&'static str),

    #[error("lane id {0} is not a positive lane number")]
    InvalidLane(i64),
}

/// Degenerate least-squares curve fits.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FitError {
    #[error("need at least {required} distinct along-lane values, got {found}")]
    InsufficientPoints { required: usize, found: usize },

    #[error("normal equations are singular")]
    Singular,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalibrationError {
    #[error("lane {0} has no accumulated samples")]
    InsufficientData(LaneId),

    #[error("lane count {0} leaves no carriageway lane between the emergency lanes")]
    TooFewLanes(u32),

    #[error("curve fit failed for lane {lane}: {source}")]
    Fit {
        lane: LaneId,
        #[source]
        source: FitError,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CellError {
    #[error("cell {order} of lane {lane} has an empty cache")]
    EmptyCache { lane: LaneId, order: usize },
}
