//! Replay records.

use std::fmt;

use serde::Serialize;

use crate::control::{ApplicationState, EngineStatus, Phase};

/// Everything observed on one replay tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickRecord {
    /// Tick index.
    pub step: usize,
    /// Replay time in minutes.
    pub time_min: f64,
    /// Raw whole-building power (kW).
    pub power_kw: f64,
    /// Smoothed power the engine decided on (kW).
    pub load_control_kw: f64,
    /// Mean of the engine's power window (kW).
    pub average_kw: f64,
    /// Active demand limit, if any (kW).
    pub demand_limit_kw: Option<f64>,
    pub phase: Phase,
    pub application_state: ApplicationState,
    /// Commands held curtailed after the tick.
    pub curtailed: usize,
    /// Reduction the engine credits itself with (kW).
    pub estimated_reduction_kw: f64,
    /// Reduction the plant actually shows (kW).
    pub shed_kw: f64,
    pub message: String,
}

impl TickRecord {
    pub fn from_status(step: usize, time_min: f64, shed_kw: f64, status: &EngineStatus) -> Self {
        Self {
            step,
            time_min,
            power_kw: status.power,
            load_control_kw: status.load_control_power,
            average_kw: status.average_power,
            demand_limit_kw: status.demand_limit,
            phase: status.phase,
            application_state: status.application_state,
            curtailed: status.curtailed.len(),
            estimated_reduction_kw: status.estimated_reduction,
            shed_kw,
            message: status.message.clone(),
        }
    }

    /// Smoothed power is above the active limit.
    pub fn above_limit(&self) -> bool {
        self.demand_limit_kw.is_some_and(|limit| self.load_control_kw > limit)
    }
}

impl fmt::Display for TickRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let limit = self
            .demand_limit_kw
            .map_or_else(|| "-".to_string(), |l| format!("{l:.1}"));
        write!(
            f,
            "t={:>4} ({:>6.1}m) | power={:>7.2} kW  smoothed={:>7.2} kW  limit={:>6} | \
             {:<10} curtailed={:<2} est={:>6.2} shed={:>6.2} | {}",
            self.step,
            self.time_min,
            self.power_kw,
            self.load_control_kw,
            limit,
            self.phase.to_string(),
            self.curtailed,
            self.estimated_reduction_kw,
            self.shed_kw,
            self.message,
        )
    }
}
