// src/calibration/calibrator.rs
//
// One-shot inference of the monitored roadway layout from accumulated
// trajectory samples.
//
// Pipeline (run by `calibrate()`, in order):
//   1. Lane layout: lanes 1..=m, m = max observed id rounded up to even.
//      Lanes 1 and m are the emergency lanes.
//   2. Inner/outer: of lanes 2 and m-1, the one with the tighter point
//      scatter is the inner (shorter, more curved) lane.
//   3. Direction: sign of each lane's velocity vote tally; emergency lanes
//      copy their carriageway neighbour.
//   4. Bounding boxes per lane and over the whole road.
//   5. Quartile feature points per carriageway lane.
//   6. Curves: free fit for the outer lane, curvature-frozen fit for every
//      other carriageway lane, emergency curves offset from the edge lanes.
//   7. Cells: global y-range cut into `cell_length` slices; a cell is valid
//      when it carries more than 1/(5·cells) of the lane's samples.
//
// Assumption: the physical emergency lanes are numbered first and last.
// Isolated invalid cells are reported as computed; no smoothing is applied.

use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use super::record::{CalibrationRecord, CalibrationStore};
use crate::error::{CalibrationError, SchemaError};
use crate::geometry::{self, Point, Quadratic};
use crate::types::{CalibrationConfig, Detection, LaneDirection, LaneId, RawDetection, VelocityVotes};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct CalibratorConfig {
    pub fps: f64,
    /// Carriageway lane width (m)
    pub lane_width: f64,
    /// Emergency lane width (m)
    pub emergency_width: f64,
    /// Longitudinal cell length (m)
    pub cell_length: f64,
}

impl Default for CalibratorConfig {
    fn default() -> Self {
        Self::from(&CalibrationConfig::default())
    }
}

impl From<&CalibrationConfig> for CalibratorConfig {
    fn from(c: &CalibrationConfig) -> Self {
        Self {
            fps: c.fps,
            lane_width: c.lane_width,
            emergency_width: c.emergency_width,
            cell_length: c.cell_length,
        }
    }
}

// ============================================================================
// ACCUMULATION
// ============================================================================

#[derive(Debug, Clone, Default)]
struct LaneAccumulator {
    samples: Vec<Point>,
    votes: VelocityVotes,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct BoundingBox {
    x_min: f64,
    x_max: f64,
    y_min: f64,
    y_max: f64,
}

impl BoundingBox {
    fn of(points: &[Point]) -> Option<Self> {
        let first = points.first()?;
        let mut bb = Self {
            x_min: first.0,
            x_max: first.0,
            y_min: first.1,
            y_max: first.1,
        };
        for &(x, y) in &points[1..] {
            bb.x_min = bb.x_min.min(x);
            bb.x_max = bb.x_max.max(x);
            bb.y_min = bb.y_min.min(y);
            bb.y_max = bb.y_max.max(y);
        }
        Some(bb)
    }

    fn union(self, other: Self) -> Self {
        Self {
            x_min: self.x_min.min(other.x_min),
            x_max: self.x_max.max(other.x_max),
            y_min: self.y_min.min(other.y_min),
            y_max: self.y_max.max(other.y_max),
        }
    }
}

/// Lane numbering derived from the observed lane ids.
#[derive(Debug, Clone, Copy)]
struct LaneLayout {
    max: u32,
    inner: LaneId,
    outer: LaneId,
}

impl LaneLayout {
    fn lanes(&self) -> impl Iterator<Item = LaneId> {
        (1..=self.max).map(LaneId::new)
    }

    fn is_emergency(&self, lane: LaneId) -> bool {
        lane.get() == 1 || lane.get() == self.max
    }

    fn carriageway(&self) -> impl Iterator<Item = LaneId> + '_ {
        self.lanes().filter(move |l| !self.is_emergency(*l))
    }
}

pub struct Calibrator {
    config: CalibratorConfig,
    lanes: BTreeMap<LaneId, LaneAccumulator>,
    frames: usize,
}

impl Calibrator {
    pub fn new(config: CalibratorConfig) -> Self {
        Self {
            config,
            lanes: BTreeMap::new(),
            frames: 0,
        }
    }

    /// Feed one sensor frame. Malformed records are logged and skipped;
    /// returns how many were skipped.
    pub fn ingest(&mut self, frame: &[RawDetection]) -> usize {
        self.frames += 1;
        let mut skipped = 0;
        for raw in frame {
            if let Err(e) = self.ingest_record(raw) {
                warn!("Skipping detection in frame {}: {}", self.frames, e);
                skipped += 1;
            }
        }
        skipped
    }

    /// Normalize, validate and accumulate a single record.
    pub fn ingest_record(&mut self, raw: &RawDetection) -> Result<(), SchemaError> {
        let det = Detection::try_from(raw)?;
        let acc = self.accumulator(det.lane);
        acc.samples.push((det.x, det.y));
        acc.votes.record(det.vx, det.vy);
        Ok(())
    }

    pub fn frames_ingested(&self) -> usize {
        self.frames
    }

    pub fn observed_lanes(&self) -> Vec<LaneId> {
        self.lanes.keys().copied().collect()
    }

    pub fn sample_count(&self, lane: LaneId) -> usize {
        self.lanes.get(&lane).map_or(0, |a| a.samples.len())
    }

    fn accumulator(&mut self, lane: LaneId) -> &mut LaneAccumulator {
        self.lanes.entry(lane).or_default()
    }

    fn samples(&self, lane: LaneId) -> &[Point] {
        self.lanes.get(&lane).map_or(&[][..], |a| a.samples.as_slice())
    }

    /// Run the full inference pipeline. Accumulated data is left untouched,
    /// so a failed run can be retried after more frames are ingested; drop
    /// the calibrator once a store has been produced.
    pub fn calibrate(&self) -> Result<CalibrationStore, CalibrationError> {
        let layout = self.lane_layout()?;
        let directions = self.lane_directions(&layout);
        let road = self.bounding_boxes(&layout)?;
        let features = self.feature_points(&layout);
        let curves = self.lane_curves(&layout, &features)?;
        let cells = self.cell_validity(&layout, &directions, &road);

        let mut records = BTreeMap::new();
        for lane in layout.lanes() {
            let direction = directions.get(&lane).copied().unwrap_or_default();
            let (start, end) = if direction.y < 0 {
                (road.y_max, road.y_min)
            } else {
                (road.y_min, road.y_max)
            };
            records.insert(
                lane,
                CalibrationRecord {
                    is_emergency: layout.is_emergency(lane),
                    direction,
                    start,
                    length: (start - end).abs(),
                    end,
                    curve_coefficients: curves.get(&lane).copied().unwrap_or_default(),
                    cell_validity: cells.get(&lane).cloned().unwrap_or_default(),
                },
            );
        }

        info!(
            "✓ Calibration complete: {} lanes (emergency 1 & {}), inner={}, outer={}, {} frames ({:.0}s)",
            layout.max,
            layout.max,
            layout.inner,
            layout.outer,
            self.frames,
            self.frames as f64 / self.config.fps
        );
        Ok(CalibrationStore::new(records))
    }

    // ------------------------------------------------------------------------
    // Steps 1-2: layout and inner/outer distinction
    // ------------------------------------------------------------------------

    fn lane_layout(&self) -> Result<LaneLayout, CalibrationError> {
        let observed_max = self.lanes.keys().next_back().map_or(0, |l| l.get());
        let max = if observed_max % 2 == 1 {
            observed_max + 1
        } else {
            observed_max
        };
        if max < 4 {
            return Err(CalibrationError::TooFewLanes(max));
        }

        for id in 2..max {
            let lane = LaneId::new(id);
            if self.samples(lane).is_empty() {
                return Err(CalibrationError::InsufficientData(lane));
            }
        }

        let near_first = LaneId::new(2);
        let near_last = LaneId::new(max - 1);
        let d_first = geometry::dispersion(self.samples(near_first));
        let d_last = geometry::dispersion(self.samples(near_last));
        let (inner, outer) = if d_first < d_last {
            (near_first, near_last)
        } else {
            (near_last, near_first)
        };
        debug!(
            "Lane layout: m={} | dispersion lane {}={:.2}, lane {}={:.2} → inner={}, outer={}",
            max, near_first, d_first, near_last, d_last, inner, outer
        );

        Ok(LaneLayout { max, inner, outer })
    }

    // ------------------------------------------------------------------------
    // Step 3: direction of travel
    // ------------------------------------------------------------------------

    fn lane_directions(&self, layout: &LaneLayout) -> BTreeMap<LaneId, LaneDirection> {
        let mut dirs: BTreeMap<LaneId, LaneDirection> = layout
            .carriageway()
            .map(|lane| {
                let votes = self.lanes.get(&lane).map(|a| a.votes).unwrap_or_default();
                (lane, LaneDirection::from_votes(&votes))
            })
            .collect();

        // Emergency lanes see too little traffic to vote.
        let first = dirs.get(&LaneId::new(2)).copied().unwrap_or_default();
        let last = dirs
            .get(&LaneId::new(layout.max - 1))
            .copied()
            .unwrap_or_default();
        dirs.insert(LaneId::new(1), first);
        dirs.insert(LaneId::new(layout.max), last);
        dirs
    }

    // ------------------------------------------------------------------------
    // Steps 4-5: extents and feature points
    // ------------------------------------------------------------------------

    fn bounding_boxes(&self, layout: &LaneLayout) -> Result<BoundingBox, CalibrationError> {
        let mut road: Option<BoundingBox> = None;
        for lane in layout.lanes() {
            let Some(bb) = BoundingBox::of(self.samples(lane)) else {
                continue;
            };
            debug!(
                "Lane {} extent: x=[{:.2}, {:.2}] y=[{:.2}, {:.2}]",
                lane, bb.x_min, bb.x_max, bb.y_min, bb.y_max
            );
            road = Some(road.map_or(bb, |r| r.union(bb)));
        }
        road.ok_or(CalibrationError::InsufficientData(layout.inner))
    }

    fn feature_points(&self, layout: &LaneLayout) -> BTreeMap<LaneId, Vec<Point>> {
        layout
            .carriageway()
            .map(|lane| (lane, geometry::quartile_feature_points(self.samples(lane))))
            .collect()
    }

    // ------------------------------------------------------------------------
    // Step 6: boundary curves
    // ------------------------------------------------------------------------

    fn lane_curves(
        &self,
        layout: &LaneLayout,
        features: &BTreeMap<LaneId, Vec<Point>>,
    ) -> Result<BTreeMap<LaneId, Quadratic>, CalibrationError> {
        let points = |lane: LaneId| features.get(&lane).map_or(&[][..], |p| p.as_slice());

        let outer = geometry::fit_quadratic(points(layout.outer)).map_err(|source| {
            CalibrationError::Fit {
                lane: layout.outer,
                source,
            }
        })?;

        let mut curves = BTreeMap::new();
        curves.insert(layout.outer, outer);
        for lane in layout.carriageway().filter(|l| *l != layout.outer) {
            let coef = geometry::fit_quadratic_frozen(points(lane), outer[0])
                .map_err(|source| CalibrationError::Fit { lane, source })?;
            curves.insert(lane, coef);
        }

        // Emergency boundaries sit (lane + emergency)/2 beyond the edge lanes,
        // measured perpendicular to the outer curve at y = 0 and projected
        // onto x.
        let inner = curves[&layout.inner];
        let half_gap = (self.config.lane_width + self.config.emergency_width) / 2.0;
        let k = geometry::slope(&outer, 0.0);
        let dx = half_gap * (1.0 + k * k).sqrt();

        let (outer_emergency, inner_emergency) = if outer[2] > inner[2] {
            (
                [outer[0], outer[1], outer[2] + dx],
                [inner[0], inner[1], inner[2] - dx],
            )
        } else {
            (
                [outer[0], outer[1], outer[2] - dx],
                [inner[0], inner[1], inner[2] + dx],
            )
        };

        let (first, last) = if layout.inner.get() == 2 {
            (inner_emergency, outer_emergency)
        } else {
            (outer_emergency, inner_emergency)
        };
        curves.insert(LaneId::new(1), first);
        curves.insert(LaneId::new(layout.max), last);

        for (lane, c) in &curves {
            debug!(
                "Lane {} curve: x = {:.6}·y² + {:.4}·y + {:.3}",
                lane, c[0], c[1], c[2]
            );
        }
        Ok(curves)
    }

    // ------------------------------------------------------------------------
    // Step 7: cell partition and validity
    // ------------------------------------------------------------------------

    fn cell_validity(
        &self,
        layout: &LaneLayout,
        directions: &BTreeMap<LaneId, LaneDirection>,
        road: &BoundingBox,
    ) -> BTreeMap<LaneId, Vec<bool>> {
        let cuts = geometry::partition_axis(road.y_min, road.y_max, self.config.cell_length);
        let cell_count = cuts.len() - 1;
        let min_share = 1.0 / (cell_count as f64 * 5.0);

        let mut cells = BTreeMap::new();
        for lane in layout.lanes() {
            if layout.is_emergency(lane) {
                cells.insert(lane, vec![false; cell_count]);
                continue;
            }

            let samples = self.samples(lane);
            let mut counts = vec![0usize; cell_count];
            for &(_, y) in samples {
                counts[geometry::interval_index(&cuts, y)] += 1;
            }

            let total = samples.len() as f64;
            let mut valid: Vec<bool> = counts
                .iter()
                .map(|&c| c as f64 / total > min_share)
                .collect();
            if directions.get(&lane).is_some_and(|d| d.y < 0) {
                valid.reverse();
            }

            debug!(
                "Lane {} cells: {}/{} valid (counts {:?})",
                lane,
                valid.iter().filter(|v| **v).count(),
                cell_count,
                counts
            );
            cells.insert(lane, valid);
        }
        cells
    }
}

// ============================================================================
// TESTS
// ============================================================================
