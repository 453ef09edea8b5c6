// src/pipeline/event_bus.rs
//
// Decoupled event queue. The lane manager publishes spill events here and
// the alert path drains them; the core never performs I/O itself.

use serde::Serialize;
use std::collections::VecDeque;
use tracing::warn;

use crate::types::LaneId;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SpillEvent {
    /// A vehicle swerved in this cell: something may lie further ahead.
    PossibleSpillAhead { lane: LaneId, order: usize, frame: u64 },

    /// A cell's danger crossed the alarm threshold.
    SpillSuspected {
        lane: LaneId,
        order: usize,
        danger: f64,
        frame: u64,
    },
}

impl SpillEvent {
    pub fn lane(&self) -> LaneId {
        match self {
            Self::PossibleSpillAhead { lane, .. } | Self::SpillSuspected { lane, .. } => *lane,
        }
    }

    pub fn order(&self) -> usize {
        match self {
            Self::PossibleSpillAhead { order, .. } | Self::SpillSuspected { order, .. } => *order,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PossibleSpillAhead { .. } => "possible_spill_ahead",
            Self::SpillSuspected { .. } => "spill_suspected",
        }
    }
}

pub struct EventBus {
    events: VecDeque<SpillEvent>,
    max_pending: usize,
}

impl EventBus {
    pub fn new(max_pending: usize) -> Self {
        let max_pending = max_pending.max(1);
        Self {
            events: VecDeque::with_capacity(max_pending),
            max_pending,
        }
    }

    pub fn publish(&mut self, event: SpillEvent) {
        if self.events.len() >= self.max_pending {
            warn!(
                "Event bus full ({} events), dropping oldest",
                self.max_pending
            );
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn drain(&mut self) -> Vec<SpillEvent> {
        self.events.drain(..).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.events.len()
    }
}
