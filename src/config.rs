use crate::types::Config;
use anyhow::{bail, Context, Result};
use std::fs;

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("reading config {}", path))?;
        let mut config: Config = serde_yaml::from_str(&contents)?;
        // Cells decay per frame, so they share the sensor rate with calibration
        config.cell.fps = config.calibration.fps;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.calibration;
        if c.fps <= 0.0 {
            bail!("calibration.fps must be positive, got {}", c.fps);
        }
        if c.cell_length <= 0.0 {
            bail!("calibration.cell_length must be positive, got {}", c.cell_length);
        }
        if c.lane_width <= 0.0 || c.emergency_width <= 0.0 {
            bail!("lane and emergency widths must be positive");
        }

        let cell = &self.cell;
        if cell.cache_retention == 0 {
            bail!("cell.cache_retention must be at least one frame");
        }
        if cell.time_tolerance <= 0.0 || cell.q_standard <= 0.0 {
            bail!("cell.time_tolerance and cell.q_standard must be positive");
        }
        if cell.danger_time_cap < 0.0 || cell.r2 < 0.0 {
            bail!("cell.danger_time_cap and cell.r2 must not be negative");
        }

        if self.manager.traffic_interval_frames == 0 {
            bail!("manager.traffic_interval_frames must be at least 1");
        }
        Ok(())
    }
}
