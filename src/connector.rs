// src/connector.rs
//
// HTTP delivery of spill events to the downstream event server.
// One JSON POST per event; any non-2xx status counts as a failed delivery.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::pipeline::{PipelineMetrics, SpillEvent};
use crate::types::AlertConfig;

// ============================================================================
// PAYLOAD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpillAlert {
    pub device_id: String,
    pub kind: &'static str,
    pub lane: u32,
    pub cell: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub danger: Option<f64>,
    pub frame: u64,
}

impl SpillAlert {
    pub fn from_event(event: &SpillEvent, device_id: &str) -> Self {
        let (danger, frame) = match event {
            SpillEvent::PossibleSpillAhead { frame, .. } => (None, *frame),
            SpillEvent::SpillSuspected { danger, frame, .. } => (Some(*danger), *frame),
        };
        Self {
            device_id: device_id.to_string(),
            kind: event.as_str(),
            lane: event.lane().get(),
            cell: event.order(),
            danger,
            frame,
        }
    }
}

// ============================================================================
// CLIENT
// ============================================================================

pub struct HttpPoster {
    url: String,
    device_id: String,
    http_client: reqwest::Client,
}

impl HttpPoster {
    pub fn new(config: &AlertConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            url: config.url.clone(),
            device_id: config.device_id.clone(),
            http_client,
        })
    }

    pub async fn send(&self, alert: &SpillAlert) -> Result<()> {
        let resp = self
            .http_client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .with_context(|| format!("posting to {}", self.url))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("HTTP {}: {}", status, body);
        }
        debug!("🌐 Posted {} lane {} cell {}", alert.kind, alert.lane, alert.cell);
        Ok(())
    }

    /// Deliver every event in order. Failures are logged and counted but do
    /// not stop the remaining deliveries. Returns the number of failures.
    pub async fn run(&self, events: &[SpillEvent], metrics: &PipelineMetrics) -> usize {
        let mut failures = 0;
        for event in events {
            let alert = SpillAlert::from_event(event, &self.device_id);
            match self.send(&alert).await {
                Ok(()) => metrics.inc(&metrics.alerts_posted),
                Err(e) => {
                    warn!("🌐 Failed to deliver {}: {:#}", alert.kind, e);
                    metrics.inc(&metrics.alert_failures);
                    failures += 1;
                }
            }
        }
        failures
    }
}
