//! Replay loop that drives the orchestrator against the simulated plant.

use tracing::{info, warn};

use crate::PointMap;
use crate::config::{ConfigError, PointAddress, ScenarioConfig, SimulationConfig};
use crate::control::{EngineCounters, Orchestrator};
use crate::time::Timestamp;

use super::clock::Clock;
use super::kpi::KpiReport;
use super::plant::Plant;
use super::types::TickRecord;

/// A scenario wired up for replay.
///
/// Each tick publishes every plant device's points, then the meter
/// reading, exactly as they would arrive on a telemetry bus.
pub struct Simulation {
    config: SimulationConfig,
    meter: PointAddress,
    engine: Orchestrator<Plant>,
}

impl Simulation {
    /// Builds the plant and the engine from a scenario.
    ///
    /// # Errors
    ///
    /// Returns the first `ConfigError` from validation or engine
    /// construction.
    pub fn from_config(cfg: &ScenarioConfig) -> Result<Self, ConfigError> {
        if let Some(first) = cfg.validate().into_iter().next() {
            return Err(first);
        }
        let plant = Plant::from_config(&cfg.building, &cfg.plant, cfg.simulation.seed);
        let engine = Orchestrator::from_config(cfg, plant)?;
        for device in engine.registry().devices() {
            if engine.actuator().device(device.name()).is_none() {
                warn!(device = %device.name(), "managed device has no simulated counterpart");
            }
        }
        Ok(Self {
            config: cfg.simulation.clone(),
            meter: cfg.engine.power_meter.clone(),
            engine,
        })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn engine(&self) -> &Orchestrator<Plant> {
        &self.engine
    }

    pub fn counters(&self) -> &EngineCounters {
        self.engine.counters()
    }

    /// Tick length in hours.
    pub fn step_hours(&self) -> f64 {
        self.config.step_seconds as f64 / 3600.0
    }

    /// Runs one tick.
    pub fn step(&mut self, step: usize, now: Timestamp) -> TickRecord {
        if self.config.kill_at_step == Some(step) {
            info!(step, "raising kill switch");
            self.engine.kill_switch().raise();
        }

        let publishes: Vec<(String, PointMap)> = self
            .engine
            .actuator()
            .devices()
            .iter()
            .map(|d| (d.name().to_string(), d.publish()))
            .collect();
        for (device, points) in publishes {
            self.engine.on_telemetry(&device, now, &points);
        }

        let power = self.engine.actuator_mut().power_kw(step);
        let reading = PointMap::from([(self.meter.point.clone(), power)]);
        let status = match self.engine.on_telemetry(&self.meter.device, now, &reading) {
            Some(status) => status,
            None => self.engine.on_power(now, power),
        };

        self.engine.actuator_mut().advance();
        let time_min = now.as_secs_f64() / 60.0;
        TickRecord::from_status(step, time_min, self.engine.actuator().shed_kw(), &status)
    }

    /// Runs every tick and returns the records.
    pub fn run(&mut self) -> Vec<TickRecord> {
        let mut clock = Clock::new(self.config.steps, self.config.step_seconds);
        let mut results = Vec::with_capacity(self.config.steps);
        clock.run(|step, now| results.push(self.step(step, now)));
        results
    }

    /// KPIs for `results` produced by this simulation.
    pub fn report(&self, results: &[TickRecord]) -> KpiReport {
        KpiReport::from_results(results, self.counters(), self.step_hours())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::Phase;

    const SCENARIO: &str = r#"
[simulation]
steps = 60
step_seconds = 60
seed = 3

[building]
base_kw = 100.0
amp_kw = 0.0
noise_std = 0.0

[engine]
demand_limit = 120.0
minimum_power_samples = 1
smoothing_alpha = 1.0
curtailment_time = 10.0
curtailment_confirm = 2.0
curtailment_break = 10.0

[[clusters]]
name = "hvac"
criteria_labels = ["zone"]
comparison_matrix = [[1.0]]

[[clusters.devices]]
name = "AHU1"
[[clusters.devices.commands]]
name = "fan"
device_status = { condition = "FanSpeed > 0" }
curtail = { point = "FanSpeed", value = 40, load = 15, revert_priority = 1 }
[[clusters.devices.commands.criteria]]
name = "zone"
operation_type = "constant"
value = 1.0

[[plant]]
name = "AHU1"
load_kw = 30.0
shed_kw = 15.0
shed_points = ["FanSpeed"]
points = { FanSpeed = 100.0 }
"#;

    fn scenario() -> ScenarioConfig {
        ScenarioConfig::from_toml_str(SCENARIO).expect("fixture parses")
    }

    #[test]
    fn curtailment_brings_power_under_limit() {
        let mut sim = Simulation::from_config(&scenario()).expect("builds");
        let results = sim.run();
        assert_eq!(results.len(), 60);
        assert_eq!(results[0].power_kw, 130.0);
        assert_eq!(results[0].phase, Phase::Curtailing);
        assert_eq!(results[1].power_kw, 115.0);
        assert_eq!(results[1].shed_kw, 15.0);
        assert!(sim.counters().episodes >= 1);
    }

    #[test]
    fn released_device_restored_to_nominal() {
        let mut sim = Simulation::from_config(&scenario()).expect("builds");
        let results = sim.run();
        let released = results.iter().position(|r| r.phase == Phase::Break);
        assert_eq!(released, Some(10));
        assert_eq!(results[11].power_kw, 130.0);
        // Episodes start at steps 0, 20 and 40; the last release is at 50.
        assert_eq!(results[20].phase, Phase::Curtailing);
        assert_eq!(sim.counters().episodes, 3);
        assert_eq!(
            sim.engine().actuator().device("AHU1").and_then(|d| d.point("FanSpeed")),
            Some(100.0)
        );
    }

    #[test]
    fn kill_at_step_halts_and_restores() {
        let mut cfg = scenario();
        cfg.simulation.kill_at_step = Some(5);
        let mut sim = Simulation::from_config(&cfg).expect("builds");
        let results = sim.run();
        assert_eq!(results[4].phase, Phase::Curtailing);
        assert!(results[5..].iter().all(|r| r.phase == Phase::Halted));
        assert_eq!(
            sim.engine().actuator().device("AHU1").and_then(|d| d.point("FanSpeed")),
            Some(100.0)
        );
        assert_eq!(results[6].power_kw, 130.0);
    }

    #[test]
    fn same_seed_same_run() {
        let mut cfg = scenario();
        cfg.building.noise_std = 2.0;
        let a = Simulation::from_config(&cfg).expect("builds").run();
        let b = Simulation::from_config(&cfg).expect("builds").run();
        assert_eq!(a, b);
    }

    #[test]
    fn invalid_scenario_rejected() {
        let mut cfg = scenario();
        cfg.simulation.steps = 0;
        assert!(Simulation::from_config(&cfg).is_err());
    }
}
