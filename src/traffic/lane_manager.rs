// src/traffic/lane_manager.rs
//
// Owns every cell of every carriageway lane and drives them frame by frame.
//
// Frame protocol (process_frame):
//   1. Route records to (lane, cell) by their y position along the lane's
//      direction of travel. Emergency lanes, unknown lanes and positions
//      outside the calibrated span are dropped.
//   2. update_cache on every cell, with an empty list for vacant cells.
//   3. Every `traffic_interval_frames`: refresh traffic on all cells, then
//      feed the lane's mean flow over valid cells back as the r1 driver.
//   4. evaluate_danger on every valid cell. A swerve publishes
//      PossibleSpillAhead and boosts the next `boost_reach` valid cells.
//      Boosts are applied after every cell has been evaluated so an
//      occupied cell ahead cannot wipe them in the same frame.
//   5. Cells whose danger reached `alarm_threshold` publish SpillSuspected
//      and are reset; the alert path owns the event from there.
//   6. reset_boost_guard on every cell, exactly once.

use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::cell::{Cell, CellGeometry};
use crate::calibration::{CalibrationRecord, CalibrationStore};
use crate::error::CellError;
use crate::geometry;
use crate::pipeline::{EventBus, PipelineMetrics, SpillEvent};
use crate::types::{CellConfig, Detection, LaneId, ManagerConfig, RawDetection};

/// Cells of one carriageway lane, in travel order.
///
/// Cells are cut from the same `partition_axis` grid the calibrator counted
/// samples on, so validity flags land on the segments they were measured
/// over. The grid always runs upward from the low end of the span; a lane
/// travelling toward -y takes its intervals in reverse, which puts the short
/// remainder interval first.
#[derive(Debug, Clone)]
pub struct LaneCells {
    lane: LaneId,
    /// +1 when travel runs toward increasing y
    dir_y: f64,
    start: f64,
    length: f64,
    /// Ascending cut points over [min(start, end), max(start, end)]
    cuts: Vec<f64>,
    flow: f64,
    cells: Vec<Cell>,
}

impl LaneCells {
    fn from_record(
        lane: LaneId,
        record: &CalibrationRecord,
        cell_length: f64,
        config: &CellConfig,
    ) -> Self {
        let dir_y = if record.direction.y < 0 { -1.0 } else { 1.0 };
        let low = record.start.min(record.end);
        let high = record.start.max(record.end);
        let step = if cell_length > 0.0 {
            cell_length
        } else {
            (high - low).max(1.0)
        };
        let cuts = geometry::partition_axis(low, high, step);
        let intervals = cuts.len() - 1;

        if intervals != record.cell_count() {
            warn!(
                "Lane {}: {} cells calibrated but {:.1}m/{:.1}m gives {}; missing cells are invalid",
                lane,
                record.cell_count(),
                high - low,
                cell_length,
                intervals
            );
        }

        let cells = (0..intervals)
            .map(|order| {
                let (start, end) = if dir_y < 0.0 {
                    let j = intervals - 1 - order;
                    (cuts[j + 1], cuts[j])
                } else {
                    (cuts[order], cuts[order + 1])
                };
                let geometry = CellGeometry {
                    valid: record.cell_validity.get(order).copied().unwrap_or(false),
                    length: (end - start).abs(),
                    start,
                    end,
                };
                Cell::new(lane, order, geometry, config)
            })
            .collect();

        Self {
            lane,
            dir_y,
            start: record.start,
            length: record.length,
            cuts,
            flow: 0.0,
            cells,
        }
    }

    /// Cell index for a y position, or None when outside the lane span.
    fn cell_index(&self, y: f64) -> Option<usize> {
        let (Some(&low), Some(&high)) = (self.cuts.first(), self.cuts.last()) else {
            return None;
        };
        if self.cells.is_empty() || !(low..=high).contains(&y) {
            return None;
        }
        let interval = geometry::interval_index(&self.cuts, y);
        if self.dir_y < 0.0 {
            Some(self.cells.len() - 1 - interval.min(self.cells.len() - 1))
        } else {
            Some(interval.min(self.cells.len() - 1))
        }
    }

    fn refresh_traffic(&mut self) {
        for cell in &mut self.cells {
            cell.update_traffic();
        }
        let (sum, n) = self
            .cells
            .iter()
            .filter(|c| c.is_valid())
            .fold((0.0, 0usize), |(s, n), c| (s + c.flow(), n + 1));
        self.flow = if n == 0 { 0.0 } else { sum / n as f64 };
        for cell in &mut self.cells {
            cell.update_confidence_rate(self.flow);
        }
    }

    pub fn lane(&self) -> LaneId {
        self.lane
    }

    pub fn flow(&self) -> f64 {
        self.flow
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }
}

/// What happened during one `process_frame` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameOutcome {
    pub routed: usize,
    pub dropped: usize,
    pub possible_spills: usize,
    pub spills_suspected: usize,
    pub traffic_refreshed: bool,
}

pub struct LaneManager {
    config: ManagerConfig,
    lanes: BTreeMap<LaneId, LaneCells>,
    events: EventBus,
    metrics: PipelineMetrics,
    frame: u64,
}

impl LaneManager {
    pub fn new(
        store: &CalibrationStore,
        cell_length: f64,
        cell_config: &CellConfig,
        config: ManagerConfig,
        metrics: PipelineMetrics,
    ) -> Self {
        let lanes: BTreeMap<LaneId, LaneCells> = store
            .iter()
            .filter(|(_, rec)| !rec.is_emergency)
            .map(|(lane, rec)| {
                (
                    lane,
                    LaneCells::from_record(lane, rec, cell_length, cell_config),
                )
            })
            .collect();

        for lane in lanes.values() {
            info!(
                "✓ Lane {}: {} cells ({} valid), {:.1}m from y={:.1} dir={}",
                lane.lane,
                lane.cells.len(),
                lane.cells.iter().filter(|c| c.is_valid()).count(),
                lane.length,
                lane.start,
                lane.dir_y
            );
        }

        let events = EventBus::new(config.max_pending_events);
        Self {
            config,
            lanes,
            events,
            metrics,
            frame: 0,
        }
    }

    pub fn process_frame(&mut self, frame: &[RawDetection]) -> Result<FrameOutcome, CellError> {
        let started = Instant::now();
        self.frame += 1;
        let mut outcome = FrameOutcome::default();

        // 1. Route
        let mut buckets: BTreeMap<LaneId, Vec<Vec<Detection>>> = self
            .lanes
            .iter()
            .map(|(id, lane)| (*id, vec![Vec::new(); lane.cells.len()]))
            .collect();

        for raw in frame {
            let det = match Detection::try_from(raw) {
                Ok(det) => det,
                Err(e) => {
                    warn!("Skipping detection in frame {}: {}", self.frame, e);
                    outcome.dropped += 1;
                    continue;
                }
            };
            let slot = self
                .lanes
                .get(&det.lane)
                .and_then(|lane| lane.cell_index(det.y))
                .and_then(|idx| buckets.get_mut(&det.lane).map(|b| &mut b[idx]));
            match slot {
                Some(bucket) => {
                    bucket.push(det);
                    outcome.routed += 1;
                }
                None => {
                    debug!(
                        "Frame {}: lane {} y={:.1} outside monitored cells",
                        self.frame, det.lane, det.y
                    );
                    outcome.dropped += 1;
                }
            }
        }

        // 2. Cache
        for (id, lane) in &mut self.lanes {
            let Some(frames) = buckets.remove(id) else {
                continue;
            };
            for (cell, vehicles) in lane.cells.iter_mut().zip(frames) {
                cell.update_cache(vehicles);
            }
        }

        // 3. Traffic
        if self.frame % self.config.traffic_interval_frames.max(1) == 0 {
            for lane in self.lanes.values_mut() {
                lane.refresh_traffic();
                debug!("Lane {} flow: {:.0} veh/h", lane.lane, lane.flow);
            }
            outcome.traffic_refreshed = true;
        }

        // 4. Danger and upstream boosts
        let mut boosts: Vec<(LaneId, usize)> = Vec::new();
        for lane in self.lanes.values_mut() {
            for cell in lane.cells.iter_mut().filter(|c| c.is_valid()) {
                let (possible_spill_ahead, order) = cell.evaluate_danger()?;
                if possible_spill_ahead {
                    boosts.push((lane.lane, order));
                }
            }
        }

        for &(lane_id, order) in &boosts {
            info!(
                "⚠️ Frame {}: swerve in lane {} cell {}, possible spill ahead",
                self.frame, lane_id, order
            );
            self.events.publish(SpillEvent::PossibleSpillAhead {
                lane: lane_id,
                order,
                frame: self.frame,
            });
            outcome.possible_spills += 1;

            if let Some(lane) = self.lanes.get_mut(&lane_id) {
                for ahead in lane
                    .cells
                    .iter_mut()
                    .skip(order + 1)
                    .filter(|c| c.is_valid())
                    .take(self.config.boost_reach)
                {
                    ahead.apply_upstream_boost();
                }
            }
        }

        // 5. Alarms
        for lane in self.lanes.values_mut() {
            for cell in lane.cells.iter_mut().filter(|c| c.is_valid()) {
                if cell.danger() >= self.config.alarm_threshold {
                    warn!(
                        "🚨 Frame {}: spill suspected in lane {} cell {} (danger={:.3})",
                        self.frame,
                        lane.lane,
                        cell.order(),
                        cell.danger()
                    );
                    self.events.publish(SpillEvent::SpillSuspected {
                        lane: lane.lane,
                        order: cell.order(),
                        danger: cell.danger(),
                        frame: self.frame,
                    });
                    cell.reset_danger();
                    outcome.spills_suspected += 1;
                }
            }
        }

        // 6. Re-arm boosts for the next frame
        for lane in self.lanes.values_mut() {
            for cell in &mut lane.cells {
                cell.reset_boost_guard();
            }
        }

        self.metrics.inc(&self.metrics.frames_processed);
        self.metrics
            .add(&self.metrics.records_dropped, outcome.dropped as u64);
        self.metrics
            .add(&self.metrics.possible_spills, outcome.possible_spills as u64);
        self.metrics
            .add(&self.metrics.spills_suspected, outcome.spills_suspected as u64);
        self.metrics.set_timing(
            &self.metrics.frame_time_us,
            started.elapsed().as_micros() as u64,
        );

        Ok(outcome)
    }

    /// The caller resolved an event in this cell: clear its danger.
    pub fn clear_event(&mut self, lane: LaneId, order: usize) -> bool {
        match self.cell_mut(lane, order) {
            Some(cell) => {
                cell.reset_danger();
                true
            }
            None => false,
        }
    }

    pub fn drain_events(&mut self) -> Vec<SpillEvent> {
        self.events.drain()
    }

    pub fn pending_events(&self) -> usize {
        self.events.pending_count()
    }

    pub fn lane(&self, lane: LaneId) -> Option<&LaneCells> {
        self.lanes.get(&lane)
    }

    pub fn lane_flow(&self, lane: LaneId) -> Option<f64> {
        self.lanes.get(&lane).map(|l| l.flow)
    }

    pub fn cell(&self, lane: LaneId, order: usize) -> Option<&Cell> {
        self.lanes.get(&lane)?.cells.get(order)
    }

    fn cell_mut(&mut self, lane: LaneId, order: usize) -> Option<&mut Cell> {
        self.lanes.get_mut(&lane)?.cells.get_mut(order)
    }

    pub fn frames_processed(&self) -> u64 {
        self.frame
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LaneDirection;

    fn record(emergency: bool, dir_y: i8, cells: Vec<bool>) -> CalibrationRecord {
        let (start, end) = if dir_y < 0 { (150.0, 0.0) } else { (0.0, 150.0) };
        CalibrationRecord {
            is_emergency: emergency,
            direction: LaneDirection { x: 1, y: dir_y },
            start,
            length: 150.0,
            end,
            curve_coefficients: [0.0, 0.0, 0.0],
            cell_validity: cells,
        }
    }

    /// Lanes 1 and 4 emergency; lane 2 toward +y, lane 3 toward -y; three
    /// 50 m cells each.
    fn store() -> CalibrationStore {
        let mut lanes = BTreeMap::new();
        lanes.insert(LaneId::new(1), record(true, 1, vec![false; 3]));
        lanes.insert(LaneId::new(2), record(false, 1, vec![true; 3]));
        lanes.insert(LaneId::new(3), record(false, -1, vec![true, false, true]));
        lanes.insert(LaneId::new(4), record(true, -1, vec![false; 3]));
        CalibrationStore::new(lanes)
    }

    fn cell_config() -> CellConfig {
        CellConfig {
            time_tolerance: 1.0,
            fps: 10.0,
            q_standard: 1000.0,
            r2: 0.2,
            lateral_velocity_threshold: 2.0,
            cache_retention: 10,
            danger_time_cap: 0.5,
        }
    }

    fn manager(config: ManagerConfig) -> LaneManager {
        LaneManager::new(&store(), 50.0, &cell_config(), config, PipelineMetrics::new())
    }

    fn raw(lane: i64, y: f64, vx: f64) -> RawDetection {
        RawDetection {
            lane_id: Some(lane),
            x: Some(0.0),
            y: Some(y),
            vx: Some(vx),
            vy: Some(25.0),
        }
    }

    #[test]
    fn test_emergency_lanes_get_no_cells() {
        let m = manager(ManagerConfig::default());
        assert!(m.lane(LaneId::new(1)).is_none());
        assert!(m.lane(LaneId::new(4)).is_none());
        assert_eq!(m.lane(LaneId::new(2)).unwrap().cells().len(), 3);
    }

    #[test]
    fn test_cell_geometry_follows_travel_direction() {
        let m = manager(ManagerConfig::default());
        let first = m.cell(LaneId::new(3), 0).unwrap().geometry();
        assert_eq!((first.start, first.end, first.length), (150.0, 100.0, 50.0));
        let last = m.cell(LaneId::new(2), 2).unwrap().geometry();
        assert_eq!((last.start, last.end), (100.0, 150.0));
    }

    #[test]
    fn test_routing_by_position_and_direction() {
        let mut m = manager(ManagerConfig::default());
        let outcome = m
            .process_frame(&[
                raw(2, 10.0, 0.0),
                raw(103, 140.0, 0.0), // biased id → lane 3, first cell in its travel order
                raw(1, 10.0, 0.0),    // emergency lane
                raw(2, 200.0, 0.0),   // beyond the lane end
            ])
            .unwrap();
        assert_eq!(outcome.routed, 2);
        assert_eq!(outcome.dropped, 2);

        let lane3_first: Vec<usize> = m
            .cell(LaneId::new(3), 0)
            .unwrap()
            .cached_frames()
            .map(|f| f.len())
            .collect();
        assert_eq!(lane3_first, vec![1]);
        // Vacant cells still receive a frame slot
        assert_eq!(m.cell(LaneId::new(2), 2).unwrap().cache_len(), 1);
    }

    #[test]
    fn test_traffic_refresh_sets_lane_flow() {
        let mut m = manager(ManagerConfig {
            traffic_interval_frames: 2,
            ..ManagerConfig::default()
        });
        let first = m.process_frame(&[raw(2, 10.0, 0.0)]).unwrap();
        assert!(!first.traffic_refreshed);
        let second = m.process_frame(&[raw(2, 10.0, 0.0)]).unwrap();
        assert!(second.traffic_refreshed);

        // Cell 0: one vehicle per frame at 25 m/s → k = 20 veh/km, q = 1800 veh/h.
        let flow = m.lane_flow(LaneId::new(2)).unwrap();
        assert!((flow - 600.0).abs() < 1e-9, "lane flow = {}", flow);
        let r1 = m.cell(LaneId::new(2), 1).unwrap().confidence_rate();
        assert!((r1 - 0.06).abs() < 1e-12);
    }

    #[test]
    fn test_swerve_boosts_cells_ahead_once() {
        let mut m = manager(ManagerConfig {
            boost_reach: 1,
            ..ManagerConfig::default()
        });
        let outcome = m.process_frame(&[raw(2, 10.0, 3.0)]).unwrap();
        assert_eq!(outcome.possible_spills, 1);

        assert!((m.cell(LaneId::new(2), 1).unwrap().danger_change() - 0.2).abs() < 1e-12);
        assert_eq!(m.cell(LaneId::new(2), 2).unwrap().danger_change(), 0.0);

        let events = m.drain_events();
        assert_eq!(
            events,
            vec![SpillEvent::PossibleSpillAhead {
                lane: LaneId::new(2),
                order: 0,
                frame: 1
            }]
        );
    }

    #[test]
    fn test_boost_skips_invalid_cells() {
        let mut m = manager(ManagerConfig {
            boost_reach: 1,
            ..ManagerConfig::default()
        });
        // Lane 3 travels toward -y: y=140 is cell 0; cell 1 is invalid.
        m.process_frame(&[raw(3, 140.0, -3.0)]).unwrap();
        assert_eq!(m.cell(LaneId::new(3), 1).unwrap().danger_change(), 0.0);
        assert!((m.cell(LaneId::new(3), 2).unwrap().danger_change() - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_repeated_swerves_raise_alarm() {
        let mut m = manager(ManagerConfig {
            boost_reach: 1,
            alarm_threshold: 0.5,
            ..ManagerConfig::default()
        });
        let mut suspected = 0;
        for _ in 0..3 {
            suspected += m.process_frame(&[raw(2, 10.0, 3.0)]).unwrap().spills_suspected;
        }
        // 0.2 per frame (r1 is still zero before the first traffic refresh)
        assert_eq!(suspected, 1);
        assert_eq!(m.cell(LaneId::new(2), 1).unwrap().danger(), 0.0);

        let alarms: Vec<SpillEvent> = m
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, SpillEvent::SpillSuspected { .. }))
            .collect();
        assert_eq!(alarms.len(), 1);
        assert_eq!(alarms[0].order(), 1);
    }

    #[test]
    fn test_reverse_lane_cells_match_calibrated_grid() {
        // 130 m span: grid [0,50) [50,100) [100,130]. Travelling toward -y,
        // the 30 m remainder is the first cell and only [50,100) was busy.
        let mut lanes = BTreeMap::new();
        lanes.insert(LaneId::new(1), record(true, 1, vec![false; 3]));
        lanes.insert(LaneId::new(2), record(false, 1, vec![true; 3]));
        lanes.insert(
            LaneId::new(3),
            CalibrationRecord {
                is_emergency: false,
                direction: LaneDirection { x: 1, y: -1 },
                start: 130.0,
                length: 130.0,
                end: 0.0,
                curve_coefficients: [0.0, 0.0, 0.0],
                cell_validity: vec![false, true, false],
            },
        );
        lanes.insert(LaneId::new(4), record(true, -1, vec![false; 3]));
        let mut m = LaneManager::new(
            &CalibrationStore::new(lanes),
            50.0,
            &cell_config(),
            ManagerConfig {
                boost_reach: 1,
                ..ManagerConfig::default()
            },
            PipelineMetrics::new(),
        );

        let first = m.cell(LaneId::new(3), 0).unwrap().geometry();
        assert_eq!((first.start, first.end, first.length), (130.0, 100.0, 30.0));
        assert!(!first.valid);
        let second = m.cell(LaneId::new(3), 1).unwrap().geometry();
        assert_eq!((second.start, second.end, second.length), (100.0, 50.0, 50.0));
        assert!(second.valid);

        let outcome = m.process_frame(&[raw(103, 90.0, -3.0)]).unwrap();
        assert_eq!(outcome.routed, 1);
        assert_eq!(outcome.possible_spills, 1);
        assert_eq!(m.cell(LaneId::new(3), 1).unwrap().cache_len(), 1);
        let routed: usize = m
            .cell(LaneId::new(3), 1)
            .unwrap()
            .cached_frames()
            .map(|f| f.len())
            .sum();
        assert_eq!(routed, 1);
    }

    #[test]
    fn test_vacancy_alone_raises_alarm_with_defaults() {
        let mut m = manager(ManagerConfig {
            traffic_interval_frames: 1,
            ..ManagerConfig::default()
        });
        // Cell 0 stays busy (lane flow 600 → r1 = 0.06); cells 1 and 2 of
        // lane 2 stay empty and saturate at the time cap on frame 9.
        for _ in 0..8 {
            let outcome = m.process_frame(&[raw(2, 10.0, 0.0)]).unwrap();
            assert_eq!(outcome.spills_suspected, 0);
        }
        let outcome = m.process_frame(&[raw(2, 10.0, 0.0)]).unwrap();
        assert_eq!(outcome.spills_suspected, 2);
    }

    #[test]
    fn test_clear_event_resets_cell() {
        let mut m = manager(ManagerConfig {
            boost_reach: 1,
            ..ManagerConfig::default()
        });
        m.process_frame(&[raw(2, 10.0, 3.0)]).unwrap();
        assert!(m.cell(LaneId::new(2), 1).unwrap().danger() > 0.0);
        assert!(m.clear_event(LaneId::new(2), 1));
        assert_eq!(m.cell(LaneId::new(2), 1).unwrap().danger(), 0.0);
        assert!(!m.clear_event(LaneId::new(9), 0));
    }
}
