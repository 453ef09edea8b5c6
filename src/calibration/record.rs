// src/calibration/record.rs
//
// Finalized per-lane calibration and its on-disk YAML form. The store is the
// contract between the calibration run and the monitoring run: field names
// below are what the lane manager expects to read back.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::geometry::Quadratic;
use crate::types::{LaneDirection, LaneId};

/// Calibration result for one lane. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    #[serde(rename = "emgc")]
    pub is_emergency: bool,
    #[serde(rename = "vDir")]
    pub direction: LaneDirection,
    /// y where travel along this lane begins
    pub start: f64,
    #[serde(rename = "len")]
    pub length: f64,
    pub end: f64,
    /// Boundary curve x(y) as [c2, c1, c0], written rounded to 3 decimals
    #[serde(rename = "coef", serialize_with = "serialize_rounded")]
    pub curve_coefficients: Quadratic,
    /// Cell validity in travel order (index 0 is the first cell a vehicle
    /// in this lane reaches)
    #[serde(rename = "cells")]
    pub cell_validity: Vec<bool>,
}

impl CalibrationRecord {
    pub fn cell_count(&self) -> usize {
        self.cell_validity.len()
    }

    pub fn valid_cells(&self) -> usize {
        self.cell_validity.iter().filter(|v| **v).count()
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

fn serialize_rounded<S: Serializer>(coef: &Quadratic, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(coef.iter().map(|c| round3(*c)))
}

// ============================================================================
// STORE
// ============================================================================

/// All lane records of one calibration run, keyed by lane id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CalibrationStore {
    lanes: BTreeMap<LaneId, CalibrationRecord>,
}

impl CalibrationStore {
    pub fn new(lanes: BTreeMap<LaneId, CalibrationRecord>) -> Self {
        Self { lanes }
    }

    pub fn get(&self, lane: LaneId) -> Option<&CalibrationRecord> {
        self.lanes.get(&lane)
    }

    pub fn iter(&self) -> impl Iterator<Item = (LaneId, &CalibrationRecord)> {
        self.lanes.iter().map(|(id, rec)| (*id, rec))
    }

    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    pub fn emergency_lanes(&self) -> Vec<LaneId> {
        self.iter()
            .filter(|(_, rec)| rec.is_emergency)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        fs::write(path, self.to_yaml()?)
            .with_context(|| format!("writing calibration store {}", path.display()))?;
        info!("💾 Calibration saved: {} lanes → {}", self.len(), path.display());
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading calibration store {}", path.display()))?;
        Self::from_yaml(&contents)
            .with_context(|| format!("parsing calibration store {}", path.display()))
    }
}
