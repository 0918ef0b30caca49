//! Engine phases and the per-tick status the engine publishes.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::time::Timestamp;

/// Control loop phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Watching demand; curtailment may start.
    Idle,
    /// Devices held curtailed; demand re-checked every confirm interval.
    Curtailing,
    /// Reverting curtailed devices, possibly in staggered groups.
    Releasing,
    /// Cool-down; no curtailment may start.
    Break,
    /// Kill switch observed. Permanent for this engine instance.
    Halted,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Curtailing => "curtailing",
            Phase::Releasing => "releasing",
            Phase::Break => "break",
            Phase::Halted => "halted",
        };
        f.write_str(s)
    }
}

/// Whether the engine is actively holding any curtailment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ApplicationState {
    Active,
    Inactive,
}

/// Release batching fixed when an episode enters [`Phase::Releasing`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StaggerPlan {
    pub group_size: usize,
    pub interval: Duration,
}

impl StaggerPlan {
    /// Group size `max(1, round(min_window * count / window))`, interval
    /// `max(min_window, window * group_size / count)`.
    ///
    /// # Arguments
    ///
    /// * `count` - Records held curtailed when releasing starts (> 0)
    /// * `min_window` - Smallest allowed spacing between groups
    /// * `window` - Time the whole release should span
    pub fn compute(count: usize, min_window: Duration, window: Duration) -> Self {
        let count = count.max(1);
        let min_secs = min_window.as_secs_f64();
        let window_secs = window.as_secs_f64().max(f64::EPSILON);
        let group_size = ((min_secs * count as f64 / window_secs).round() as usize).max(1);
        let interval_secs = (window_secs * group_size as f64 / count as f64).max(min_secs);
        Self {
            group_size,
            interval: Duration::from_secs_f64(interval_secs),
        }
    }

    /// Number of batches needed to release `count` records.
    pub fn batches(&self, count: usize) -> usize {
        count.div_ceil(self.group_size)
    }
}

/// One curtailed command, as published in status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurtailedCommand {
    pub device: String,
    pub command: String,
    pub point: String,
    pub prior_value: f64,
    pub load: f64,
}

/// Snapshot published after every power sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub timestamp: Timestamp,
    pub phase: Phase,
    pub application_state: ApplicationState,
    /// Raw meter reading.
    pub power: f64,
    /// Mean of the raw power window.
    pub average_power: f64,
    /// Exponentially smoothed power that drives decisions.
    pub load_control_power: f64,
    pub demand_limit: Option<f64>,
    /// Sum of estimated reductions for commands held curtailed.
    pub estimated_reduction: f64,
    pub curtailed: Vec<CurtailedCommand>,
    /// Human-readable decision for this tick.
    pub message: String,
}
