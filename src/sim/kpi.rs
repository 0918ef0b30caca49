//! Post-hoc KPI computation from replay results.

use std::fmt;

use serde::Serialize;

use super::types::TickRecord;
use crate::control::EngineCounters;

/// Aggregate indicators for a complete replay.
///
/// Computed from the tick records and the engine's counters after the
/// run, so reported figures always agree with the exported telemetry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct KpiReport {
    /// Highest raw building power (kW).
    pub peak_power_kw: f64,
    /// Highest smoothed power (kW).
    pub peak_smoothed_kw: f64,
    /// Ticks whose smoothed power exceeded the active limit.
    pub ticks_above_limit: usize,
    /// Ticks with at least one command curtailed.
    pub ticks_curtailed: usize,
    /// Most commands held curtailed at once.
    pub max_concurrent_curtailed: usize,
    /// Energy the plant actually shed (kWh).
    pub energy_shed_kwh: f64,
    pub episodes: usize,
    pub curtailments: usize,
    pub releases: usize,
    pub contingency_releases: usize,
    pub actuation_failures: usize,
    pub abandoned_reverts: usize,
}

impl KpiReport {
    /// Computes the report.
    ///
    /// # Arguments
    ///
    /// * `results` - Complete replay tick records
    /// * `counters` - The engine's counters at the end of the run
    /// * `step_hours` - Tick length in hours
    pub fn from_results(results: &[TickRecord], counters: &EngineCounters, step_hours: f64) -> Self {
        let mut report = Self {
            episodes: counters.episodes,
            curtailments: counters.curtailments,
            releases: counters.releases,
            contingency_releases: counters.contingency_releases,
            actuation_failures: counters.actuation_failures,
            abandoned_reverts: counters.abandoned_reverts,
            ..Self::default()
        };

        for r in results {
            report.peak_power_kw = report.peak_power_kw.max(r.power_kw);
            report.peak_smoothed_kw = report.peak_smoothed_kw.max(r.load_control_kw);
            if r.above_limit() {
                report.ticks_above_limit += 1;
            }
            if r.curtailed > 0 {
                report.ticks_curtailed += 1;
            }
            report.max_concurrent_curtailed = report.max_concurrent_curtailed.max(r.curtailed);
            report.energy_shed_kwh += r.shed_kw * step_hours;
        }
        report
    }
}

impl fmt::Display for KpiReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- KPI Report ---")?;
        writeln!(f, "Peak power:            {:.2} kW", self.peak_power_kw)?;
        writeln!(f, "Peak smoothed power:   {:.2} kW", self.peak_smoothed_kw)?;
        writeln!(f, "Ticks above limit:     {}", self.ticks_above_limit)?;
        writeln!(
            f,
            "Ticks curtailed:       {} (max {} at once)",
            self.ticks_curtailed, self.max_concurrent_curtailed
        )?;
        writeln!(f, "Energy shed:           {:.2} kWh", self.energy_shed_kwh)?;
        writeln!(f, "Episodes:              {}", self.episodes)?;
        writeln!(
            f,
            "Curtailments/releases: {}/{} ({} contingency)",
            self.curtailments, self.releases, self.contingency_releases
        )?;
        write!(
            f,
            "Actuation failures:    {} ({} reverts abandoned)",
            self.actuation_failures, self.abandoned_reverts
        )
    }
}
