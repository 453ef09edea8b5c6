// src/main.rs

use anyhow::{bail, Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use spill_watch::calibration::{CalibrationStore, Calibrator, CalibratorConfig};
use spill_watch::connector::HttpPoster;
use spill_watch::pipeline::PipelineMetrics;
use spill_watch::replay::FrameReader;
use spill_watch::traffic::LaneManager;
use spill_watch::types::{Config, RawDetection};

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| "config.yaml".to_string());
    let Some(recording_path) = args.next() else {
        bail!("usage: spill-watch <config.yaml> <recording.jsonl>");
    };

    let config = Config::load(&config_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("spill_watch={}", config.logging.level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🛣️  Spill Watch Starting");
    info!("✓ Configuration loaded from {}", config_path);

    let metrics = PipelineMetrics::new();
    let mut frames = FrameReader::open(&recording_path)?;

    // ── Calibration phase ────────────────────────────────────────────────
    let store = if config.calibration.calibration_frames == 0 {
        info!(
            "Skipping calibration, loading {}",
            config.calibration.store_path
        );
        CalibrationStore::load(&config.calibration.store_path)?
    } else {
        let store = calibrate(&config, &mut frames, &metrics)?;
        store.save(&config.calibration.store_path)?;
        store
    };

    info!(
        "✓ {} lanes calibrated (emergency: {:?})",
        store.len(),
        store.emergency_lanes()
    );

    // ── Monitoring phase ─────────────────────────────────────────────────
    let mut manager = LaneManager::new(
        &store,
        config.calibration.cell_length,
        &config.cell,
        config.manager.clone(),
        metrics.clone(),
    );

    let poster = if config.alerts.enabled {
        info!("📡 Alert endpoint: {}", config.alerts.url);
        Some(HttpPoster::new(&config.alerts)?)
    } else {
        None
    };

    for frame in frames {
        let outcome = manager.process_frame(&frame)?;
        if outcome.possible_spills == 0 && outcome.spills_suspected == 0 {
            continue;
        }

        let events = manager.drain_events();
        for event in &events {
            warn!(
                "⚠️  {} lane {} cell {} (frame {})",
                event.as_str(),
                event.lane(),
                event.order(),
                manager.frames_processed()
            );
        }
        if let Some(poster) = &poster {
            let failures = poster.run(&events, &metrics).await;
            if failures > 0 {
                error!("{} of {} alerts failed to deliver", failures, events.len());
            }
        }
    }

    let summary = metrics.summary();
    info!("\n========================================");
    info!("✓ Recording processed");
    info!(
        "{}",
        serde_json::to_string_pretty(&summary).context("serializing metrics summary")?
    );
    info!("========================================\n");

    Ok(())
}

fn calibrate<I>(config: &Config, frames: &mut I, metrics: &PipelineMetrics) -> Result<CalibrationStore>
where
    I: Iterator<Item = Vec<RawDetection>>,
{
    let target = config.calibration.calibration_frames;
    let mut calibrator = Calibrator::new(CalibratorConfig::from(&config.calibration));
    info!(
        "📐 Calibrating on {} frames ({:.0}s)",
        target,
        target as f64 / config.calibration.fps
    );

    for frame in frames.by_ref().take(target) {
        let dropped = calibrator.ingest(&frame);
        metrics.inc(&metrics.calibration_frames);
        metrics.add(&metrics.records_dropped, dropped as u64);
    }

    if calibrator.frames_ingested() < target {
        warn!(
            "Recording ended after {} of {} calibration frames",
            calibrator.frames_ingested(),
            target
        );
    }

    calibrator
        .calibrate()
        .with_context(|| format!("calibrating on {} frames", calibrator.frames_ingested()))
}
