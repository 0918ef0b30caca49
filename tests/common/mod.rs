//! Shared test fixtures for integration tests.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use ilc_engine::PointMap;
use ilc_engine::config::ScenarioConfig;
use ilc_engine::control::{Actuator, Orchestrator};
use ilc_engine::error::ActuationError;
use ilc_engine::time::Timestamp;

/// Three fans in one cluster, ranked A > B > C. Shared with the
/// orchestrator unit tests.
pub const SITE: &str = include_str!("../fixtures/site.toml");

pub fn site() -> ScenarioConfig {
    ScenarioConfig::from_toml_str(SITE).expect("fixture parses")
}

pub fn at(minute: f64) -> Timestamp {
    Timestamp::from_minutes(minute)
}

pub fn points(values: &[(&str, f64)]) -> PointMap {
    values.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

/// Point store standing in for the actuation service.
#[derive(Debug, Clone, Default)]
pub struct Bus {
    pub values: HashMap<(String, String), f64>,
    pub reserved: BTreeSet<String>,
    pub writes: usize,
}

impl Bus {
    /// Fans A, B and C running at 100, 90 and 80 percent.
    pub fn fans() -> Self {
        let mut bus = Self::default();
        for (device, speed) in [("A", 100.0), ("B", 90.0), ("C", 80.0)] {
            bus.values.insert((device.into(), "Speed".into()), speed);
        }
        bus
    }

    pub fn value(&self, device: &str, point: &str) -> Option<f64> {
        self.values
            .get(&(device.to_string(), point.to_string()))
            .copied()
    }
}

impl Actuator for Bus {
    fn reserve(
        &mut self,
        device: &str,
        _start: Timestamp,
        _end: Timestamp,
        _timeout: Duration,
    ) -> Result<(), ActuationError> {
        self.reserved.insert(device.to_string());
        Ok(())
    }

    fn read_point(&mut self, device: &str, point: &str, _timeout: Duration) -> Result<f64, ActuationError> {
        self.value(device, point)
            .ok_or_else(|| ActuationError::Unavailable(format!("{device}/{point}")))
    }

    fn set_point(
        &mut self,
        device: &str,
        point: &str,
        value: f64,
        _timeout: Duration,
    ) -> Result<(), ActuationError> {
        self.writes += 1;
        self.values.insert((device.to_string(), point.to_string()), value);
        Ok(())
    }

    fn revert_point(&mut self, _device: &str, _point: &str, _timeout: Duration) -> Result<(), ActuationError> {
        Ok(())
    }

    fn release(&mut self, device: &str, _timeout: Duration) -> Result<(), ActuationError> {
        self.reserved.remove(device);
        Ok(())
    }
}

/// Builds an engine over [`Bus::fans`] with every fan reporting running.
pub fn engine(cfg: &ScenarioConfig) -> Orchestrator<Bus> {
    let mut engine = Orchestrator::from_config(cfg, Bus::fans()).expect("engine builds");
    for device in ["A", "B", "C"] {
        engine.on_telemetry(device, at(0.0), &points(&[("Status", 1.0)]));
    }
    engine
}
