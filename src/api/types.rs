//! API response and query types.

use serde::{Deserialize, Serialize};

use crate::config::ScenarioConfig;
use crate::sim::kpi::KpiReport;
use crate::sim::types::TickRecord;

/// The parts of a scenario worth reporting alongside results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioSummary {
    pub steps: usize,
    pub step_seconds: u64,
    pub seed: u64,
    pub demand_limit: Option<f64>,
    pub stagger_release: bool,
    pub clusters: Vec<String>,
    pub devices: usize,
}

impl ScenarioSummary {
    pub fn from_config(cfg: &ScenarioConfig) -> Self {
        Self {
            steps: cfg.simulation.steps,
            step_seconds: cfg.simulation.step_seconds,
            seed: cfg.simulation.seed,
            demand_limit: cfg.engine.demand_limit,
            stagger_release: cfg.engine.stagger_release,
            clusters: cfg.clusters.iter().map(|c| c.name.clone()).collect(),
            devices: cfg.clusters.iter().map(|c| c.devices.len()).sum(),
        }
    }
}

/// Combined state response: scenario, KPIs, and latest tick.
#[derive(Debug, Serialize)]
pub struct StateResponse {
    pub scenario: ScenarioSummary,
    pub kpi: KpiReport,
    /// Last tick of the replay; `null` for an empty run.
    pub latest_tick: Option<TickRecord>,
}

/// Optional range query parameters for the telemetry endpoint.
#[derive(Debug, Deserialize)]
pub struct TelemetryQuery {
    /// First step (inclusive).
    pub from: Option<usize>,
    /// Last step (inclusive).
    pub to: Option<usize>,
}

/// Error response body for 400-class errors.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
