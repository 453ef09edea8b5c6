// src/traffic/cell.rs
//
// Per-segment traffic state and spill confidence.
//
// Each cell keeps the vehicle lists of its last `cache_retention` frames.
// An empty list is still pushed when the cell is vacant: the cache index
// stands in for the frame clock, so vacancy has to take up a slot.
//
// Danger has two parts:
//   - danger_time:   grows by r1 every vacant frame, capped at
//                    danger_time_cap. r1 scales with lane flow, so a busy
//                    lane that suddenly leaves a cell empty gets suspicious
//                    faster than a quiet one.
//   - danger_change: grows by r2 whenever a vehicle upstream swerves
//                    (|vx| over the lateral threshold), at most once per
//                    frame.
// Any vehicle in the latest frame clears both parts.
//
// Per-frame protocol (owned by the lane manager):
//   update_cache → evaluate_danger → apply_upstream_boost* → reset_boost_guard

use std::collections::VecDeque;

use crate::error::CellError;
use crate::types::{CellConfig, Detection, LaneId};

/// Fixed placement of a cell on its lane, taken from the calibration record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellGeometry {
    pub valid: bool,
    /// Segment length in meters
    pub length: f64,
    /// y where the segment begins in the lane's direction of travel
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone)]
pub struct Cell {
    lane: LaneId,
    order: usize,
    geometry: CellGeometry,

    // Traffic state
    q: f64,
    k: f64,
    v: f64,
    average_vehicle_count: f64,

    // Confidence rates
    r1_standard: f64,
    q_standard: f64,
    r1: f64,
    r2: f64,
    lateral_velocity_threshold: f64,

    // Danger
    danger_time: f64,
    danger_change: f64,
    danger: f64,
    danger_time_cap: f64,
    boosted: bool,

    cache: VecDeque<Vec<Detection>>,
    cache_retention: usize,
}

impl Cell {
    pub fn new(lane: LaneId, order: usize, geometry: CellGeometry, config: &CellConfig) -> Self {
        let cache_retention = config.cache_retention.max(1);
        Self {
            lane,
            order,
            geometry,
            q: 0.0,
            k: 0.0,
            v: 0.0,
            average_vehicle_count: 0.0,
            r1_standard: 1.0 / (config.time_tolerance * config.fps),
            q_standard: config.q_standard,
            r1: 0.0,
            r2: config.r2,
            lateral_velocity_threshold: config.lateral_velocity_threshold,
            danger_time: 0.0,
            danger_change: 0.0,
            danger: 0.0,
            danger_time_cap: config.danger_time_cap,
            boosted: false,
            cache: VecDeque::with_capacity(cache_retention + 1),
            cache_retention,
        }
    }

    // ========================================================================
    // CACHE
    // ========================================================================

    /// Append this frame's vehicles (already routed to this cell), evicting
    /// the oldest frame once the window is full.
    pub fn update_cache(&mut self, vehicles: Vec<Detection>) {
        self.cache.push_back(vehicles);
        if self.cache.len() > self.cache_retention {
            self.cache.pop_front();
        }
    }

    // ========================================================================
    // TRAFFIC
    // ========================================================================

    /// Recompute flow, density and speed over the cached window.
    pub fn update_traffic(&mut self) {
        let base_t = self.cache.len().min(self.cache_retention);
        if base_t == 0 || self.geometry.length <= 0.0 {
            self.average_vehicle_count = 0.0;
            self.k = 0.0;
            self.v = 0.0;
            self.q = 0.0;
            return;
        }

        let (count, speed_sum) = self
            .cache
            .iter()
            .flatten()
            .fold((0usize, 0.0f64), |(n, s), d| (n + 1, s + d.vy.abs()));

        self.average_vehicle_count = count as f64 / base_t as f64;
        self.k = self.average_vehicle_count / self.geometry.length * 1000.0; // veh/km
        self.v = if count == 0 {
            0.0
        } else {
            speed_sum / count as f64
        }; // m/s
        self.q = self.k * self.v * 3.6; // veh/h
    }

    /// Scale the vacancy rate with the current lane flow (veh/h).
    pub fn update_confidence_rate(&mut self, segment_flow: f64) {
        self.r1 = self.r1_standard * segment_flow / self.q_standard;
    }

    // ========================================================================
    // DANGER
    // ========================================================================

    /// Per-frame danger update. Returns `(possible_spill_ahead, order)`:
    /// true when a vehicle in the latest frame is swerving.
    pub fn evaluate_danger(&mut self) -> Result<(bool, usize), CellError> {
        let latest = self.cache.back().ok_or(CellError::EmptyCache {
            lane: self.lane,
            order: self.order,
        })?;

        if !latest.is_empty() {
            let swerving = latest
                .iter()
                .any(|d| d.vx.abs() > self.lateral_velocity_threshold);
            self.reset_danger();
            return Ok((swerving, self.order));
        }

        self.danger_time = (self.danger_time + self.r1).min(self.danger_time_cap).max(0.0);
        self.danger = self.danger_time + self.danger_change;
        Ok((false, self.order))
    }

    /// Add r2 once per frame; repeated calls before `reset_boost_guard` are
    /// ignored.
    pub fn apply_upstream_boost(&mut self) {
        if self.boosted {
            return;
        }
        self.danger_change += self.r2;
        self.boosted = true;
        self.danger = self.danger_time + self.danger_change;
    }

    /// Must run exactly once per frame, after every boost of that frame.
    pub fn reset_boost_guard(&mut self) {
        self.boosted = false;
    }

    pub fn reset_danger(&mut self) {
        self.danger_time = 0.0;
        self.danger_change = 0.0;
        self.danger = 0.0;
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn lane(&self) -> LaneId {
        self.lane
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn is_valid(&self) -> bool {
        self.geometry.valid
    }

    pub fn geometry(&self) -> &CellGeometry {
        &self.geometry
    }

    pub fn flow(&self) -> f64 {
        self.q
    }

    pub fn density(&self) -> f64 {
        self.k
    }

    pub fn speed(&self) -> f64 {
        self.v
    }

    pub fn average_vehicle_count(&self) -> f64 {
        self.average_vehicle_count
    }

    pub fn confidence_rate(&self) -> f64 {
        self.r1
    }

    pub fn danger(&self) -> f64 {
        self.danger
    }

    pub fn danger_time(&self) -> f64 {
        self.danger_time
    }

    pub fn danger_change(&self) -> f64 {
        self.danger_change
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn cached_frames(&self) -> impl Iterator<Item = &[Detection]> {
        self.cache.iter().map(|f| f.as_slice())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn car(vx: f64, vy: f64) -> Detection {
        Detection {
            lane: LaneId::new(2),
            x: 3.75,
            y: 10.0,
            vx,
            vy,
        }
    }

    /// tt=1s at 10fps gives r1 = 0.1 once the lane runs at standard flow.
    fn config(retention: usize) -> CellConfig {
        CellConfig {
            time_tolerance: 1.0,
            fps: 10.0,
            q_standard: 1000.0,
            r2: 0.2,
            lateral_velocity_threshold: 2.0,
            cache_retention: retention,
            danger_time_cap: 0.5,
        }
    }

    fn cell(retention: usize) -> Cell {
        let geometry = CellGeometry {
            valid: true,
            length: 50.0,
            start: 0.0,
            end: 50.0,
        };
        let mut c = Cell::new(LaneId::new(2), 4, geometry, &config(retention));
        c.update_confidence_rate(1000.0);
        c
    }

    #[test]
    fn test_cache_keeps_last_retention_frames() {
        let mut c = cell(3);
        for i in 0..5 {
            c.update_cache(vec![car(0.0, i as f64)]);
            assert!(c.cache_len() <= 3);
        }
        let kept: Vec<f64> = c.cached_frames().map(|f| f[0].vy).collect();
        assert_eq!(kept, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_empty_frames_take_a_slot() {
        let mut c = cell(3);
        c.update_cache(vec![car(0.0, 1.0)]);
        c.update_cache(Vec::new());
        c.update_cache(Vec::new());
        c.update_cache(Vec::new());
        assert_eq!(c.cache_len(), 3);
        assert!(c.cached_frames().all(|f| f.is_empty()));
    }

    #[test]
    fn test_traffic_from_window() {
        let mut c = cell(3);
        c.update_cache(vec![car(0.0, 10.0)]);
        c.update_cache(vec![car(0.0, -10.0)]);
        c.update_cache(Vec::new());
        c.update_traffic();

        assert!((c.average_vehicle_count() - 2.0 / 3.0).abs() < 1e-12);
        assert!((c.speed() - 10.0).abs() < 1e-12);
        assert!((c.density() - 13.333_333).abs() < 1e-4);
        assert!((c.flow() - 480.0).abs() < 1e-9);
    }

    #[test]
    fn test_traffic_without_cache_is_zero() {
        let mut c = cell(3);
        c.update_traffic();
        assert_eq!(c.flow(), 0.0);
        assert_eq!(c.density(), 0.0);
        assert_eq!(c.speed(), 0.0);
    }

    #[test]
    fn test_confidence_rate_tracks_flow() {
        let mut c = cell(3);
        assert!((c.confidence_rate() - 0.1).abs() < 1e-12);
        c.update_confidence_rate(500.0);
        assert!((c.confidence_rate() - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_evaluate_before_cache_fails() {
        let mut c = cell(3);
        assert_eq!(
            c.evaluate_danger(),
            Err(CellError::EmptyCache {
                lane: LaneId::new(2),
                order: 4
            })
        );
    }

    #[test]
    fn test_vacancy_accumulates_after_occupied_frame() {
        let mut c = cell(3);
        for frame in [vec![car(0.0, 20.0)], Vec::new(), Vec::new()] {
            c.update_cache(frame);
            assert_eq!(c.evaluate_danger().unwrap(), (false, 4));
        }
        assert!((c.danger_time() - 0.2).abs() < 1e-12);
        assert_eq!(c.danger(), c.danger_time() + c.danger_change());
    }

    #[test]
    fn test_danger_time_is_capped() {
        let mut c = cell(3);
        for _ in 0..20 {
            c.update_cache(Vec::new());
            c.evaluate_danger().unwrap();
            assert!(c.danger_time() >= 0.0 && c.danger_time() <= 0.5);
        }
        assert_eq!(c.danger_time(), 0.5);
    }

    #[test]
    fn test_occupied_frame_clears_danger() {
        let mut c = cell(3);
        c.update_cache(Vec::new());
        c.evaluate_danger().unwrap();
        c.apply_upstream_boost();
        assert!(c.danger() > 0.0);

        c.update_cache(vec![car(0.5, 20.0)]);
        assert_eq!(c.evaluate_danger().unwrap(), (false, 4));
        assert_eq!(c.danger(), 0.0);
        assert_eq!(c.danger_time(), 0.0);
        assert_eq!(c.danger_change(), 0.0);
    }

    #[test]
    fn test_swerving_vehicle_signals_spill_ahead() {
        let mut c = cell(3);
        c.update_cache(Vec::new());
        c.evaluate_danger().unwrap();
        c.update_cache(vec![car(0.1, 20.0), car(-2.5, 18.0)]);
        assert_eq!(c.evaluate_danger().unwrap(), (true, 4));
        assert_eq!(c.danger(), 0.0);
    }

    #[test]
    fn test_boost_applies_once_per_frame() {
        let mut c = cell(3);
        c.apply_upstream_boost();
        c.apply_upstream_boost();
        assert!((c.danger_change() - 0.2).abs() < 1e-12);

        c.reset_boost_guard();
        c.apply_upstream_boost();
        assert!((c.danger_change() - 0.4).abs() < 1e-12);
        assert_eq!(c.danger(), c.danger_time() + c.danger_change());
    }

    #[test]
    fn test_reset_danger_zeroes_everything() {
        let mut c = cell(3);
        c.update_cache(Vec::new());
        c.evaluate_danger().unwrap();
        c.apply_upstream_boost();
        c.reset_danger();
        assert_eq!(
            (c.danger(), c.danger_time(), c.danger_change()),
            (0.0, 0.0, 0.0)
        );
    }
}
