//! Simulated building used to replay the engine.
//!
//! The plant is the engine's actuator during replay: point writes land on
//! in-memory devices, and a device draws less power while any of its shed
//! points sits off its nominal value.

use std::collections::BTreeMap;
use std::time::Duration;

use rand::{Rng, SeedableRng, rngs::StdRng};
use tracing::debug;

use crate::PointMap;
use crate::config::{BuildingConfig, PlantDeviceConfig};
use crate::control::Actuator;
use crate::error::ActuationError;
use crate::time::Timestamp;

/// Uncontrolled building demand: a sinusoid with gaussian noise.
///
/// # Examples
///
/// ```
/// use ilc_engine::config::BuildingConfig;
/// use ilc_engine::sim::plant::BaseLoad;
///
/// let cfg = BuildingConfig { noise_std: 0.0, ..BuildingConfig::default() };
/// let mut load = BaseLoad::new(&cfg, 42);
/// assert!(load.demand_kw(0) >= 0.0);
/// ```
#[derive(Debug, Clone)]
pub struct BaseLoad {
    base_kw: f64,
    amp_kw: f64,
    phase_rad: f64,
    noise_std: f64,
    period_steps: usize,
    rng: StdRng,
}

impl BaseLoad {
    pub fn new(cfg: &BuildingConfig, seed: u64) -> Self {
        Self {
            base_kw: cfg.base_kw,
            amp_kw: cfg.amp_kw,
            phase_rad: cfg.phase_rad,
            noise_std: cfg.noise_std,
            period_steps: cfg.period_steps.max(1),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Demand at `step`, never negative.
    pub fn demand_kw(&mut self, step: usize) -> f64 {
        let pos = (step % self.period_steps) as f64 / self.period_steps as f64;
        let angle = 2.0 * std::f64::consts::PI * pos + self.phase_rad;

        let noise = if self.noise_std > 0.0 {
            // Box-Muller
            let u1: f64 = self.rng.random::<f64>().clamp(1e-9, 1.0);
            let u2: f64 = self.rng.random::<f64>();
            (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos() * self.noise_std
        } else {
            0.0
        };

        (self.base_kw + self.amp_kw * angle.sin() + noise).max(0.0)
    }
}

/// One controllable device in the plant.
#[derive(Debug, Clone)]
pub struct SimDevice {
    name: String,
    load_kw: f64,
    shed_kw: f64,
    shed_points: Vec<String>,
    nominal: BTreeMap<String, f64>,
    points: BTreeMap<String, f64>,
    drift: BTreeMap<String, f64>,
    reject_sets: u32,
    refuse_reservation: bool,
    reserved: bool,
}

impl SimDevice {
    pub fn from_config(cfg: &PlantDeviceConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            load_kw: cfg.load_kw,
            shed_kw: cfg.shed_kw,
            shed_points: cfg.shed_points.clone(),
            nominal: cfg.points.clone(),
            points: cfg.points.clone(),
            drift: cfg.drift.clone(),
            reject_sets: cfg.reject_sets,
            refuse_reservation: cfg.refuse_reservation,
            reserved: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn point(&self, point: &str) -> Option<f64> {
        self.points.get(point).copied()
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved
    }

    /// True while any shed point is away from its nominal value.
    pub fn is_shed(&self) -> bool {
        self.shed_points.iter().any(|p| {
            match (self.points.get(p), self.nominal.get(p)) {
                (Some(now), Some(nominal)) => (now - nominal).abs() > 1e-9,
                _ => false,
            }
        })
    }

    pub fn draw_kw(&self) -> f64 {
        if self.is_shed() {
            (self.load_kw - self.shed_kw).max(0.0)
        } else {
            self.load_kw
        }
    }

    /// Current point values as a telemetry publish.
    pub fn publish(&self) -> PointMap {
        self.points.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }

    fn advance(&mut self) {
        let shed = self.is_shed();
        for (point, rate) in &self.drift {
            let Some(value) = self.points.get_mut(point) else {
                continue;
            };
            let nominal = self.nominal.get(point).copied().unwrap_or(*value);
            if shed {
                *value += rate;
            } else if (*value - nominal).abs() > rate.abs() {
                // Recover toward nominal at the same rate.
                *value -= rate.abs().copysign(*value - nominal);
            } else {
                *value = nominal;
            }
        }
    }
}

/// Calls the engine made against the plant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActuationCounts {
    pub reservations: usize,
    pub reads: usize,
    pub writes: usize,
    pub reverts: usize,
    pub releases: usize,
    pub rejections: usize,
}

/// Building load plus simulated devices, driven through [`Actuator`].
#[derive(Debug, Clone)]
pub struct Plant {
    building: BaseLoad,
    devices: Vec<SimDevice>,
    counts: ActuationCounts,
}

impl Plant {
    pub fn from_config(building: &BuildingConfig, devices: &[PlantDeviceConfig], seed: u64) -> Self {
        Self {
            building: BaseLoad::new(building, seed),
            devices: devices.iter().map(SimDevice::from_config).collect(),
            counts: ActuationCounts::default(),
        }
    }

    pub fn devices(&self) -> &[SimDevice] {
        &self.devices
    }

    pub fn device(&self, name: &str) -> Option<&SimDevice> {
        self.devices.iter().find(|d| d.name == name)
    }

    pub fn counts(&self) -> ActuationCounts {
        self.counts
    }

    /// Whole-building draw at `step`.
    pub fn power_kw(&mut self, step: usize) -> f64 {
        self.building.demand_kw(step) + self.devices.iter().map(SimDevice::draw_kw).sum::<f64>()
    }

    /// Draw currently removed by shed devices.
    pub fn shed_kw(&self) -> f64 {
        self.devices
            .iter()
            .filter(|d| d.is_shed())
            .map(|d| d.load_kw - d.draw_kw())
            .sum()
    }

    /// Applies one tick of point drift.
    pub fn advance(&mut self) {
        for device in &mut self.devices {
            device.advance();
        }
    }

    fn device_mut(&mut self, name: &str) -> Result<&mut SimDevice, ActuationError> {
        self.devices
            .iter_mut()
            .find(|d| d.name == name)
            .ok_or_else(|| ActuationError::Unavailable(name.to_string()))
    }
}

fn unknown_point(device: &str, operation: &'static str, point: &str) -> ActuationError {
    ActuationError::Rejected {
        device: device.to_string(),
        operation,
        reason: format!("no point named {point}"),
    }
}

impl Actuator for Plant {
    fn reserve(
        &mut self,
        device: &str,
        start: Timestamp,
        end: Timestamp,
        _timeout: Duration,
    ) -> Result<(), ActuationError> {
        self.counts.reservations += 1;
        let d = self.device_mut(device)?;
        if d.refuse_reservation {
            self.counts.rejections += 1;
            return Err(ActuationError::Rejected {
                device: device.to_string(),
                operation: "reserve",
                reason: "schedule conflict".into(),
            });
        }
        d.reserved = true;
        debug!(device, %start, %end, "reserved");
        Ok(())
    }

    fn read_point(&mut self, device: &str, point: &str, _timeout: Duration) -> Result<f64, ActuationError> {
        self.counts.reads += 1;
        self.device_mut(device)?
            .point(point)
            .ok_or_else(|| unknown_point(device, "read_point", point))
    }

    fn set_point(
        &mut self,
        device: &str,
        point: &str,
        value: f64,
        _timeout: Duration,
    ) -> Result<(), ActuationError> {
        self.counts.writes += 1;
        let d = self.device_mut(device)?;
        if d.reject_sets > 0 {
            d.reject_sets -= 1;
            self.counts.rejections += 1;
            return Err(ActuationError::Timeout {
                device: device.to_string(),
                operation: "set_point",
            });
        }
        let slot = d
            .points
            .get_mut(point)
            .ok_or_else(|| unknown_point(device, "set_point", point))?;
        *slot = value;
        Ok(())
    }

    fn revert_point(&mut self, device: &str, point: &str, _timeout: Duration) -> Result<(), ActuationError> {
        self.counts.reverts += 1;
        let d = self.device_mut(device)?;
        let nominal = d
            .nominal
            .get(point)
            .copied()
            .ok_or_else(|| unknown_point(device, "revert_point", point))?;
        d.points.insert(point.to_string(), nominal);
        Ok(())
    }

    fn release(&mut self, device: &str, _timeout: Duration) -> Result<(), ActuationError> {
        self.counts.releases += 1;
        self.device_mut(device)?.reserved = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn ahu() -> PlantDeviceConfig {
        PlantDeviceConfig {
            name: "AHU1".into(),
            load_kw: 30.0,
            shed_kw: 12.0,
            shed_points: vec!["FanSpeed".into()],
            points: [("FanSpeed".to_string(), 100.0), ("ZoneTemp".to_string(), 72.0)]
                .into_iter()
                .collect(),
            drift: [("ZoneTemp".to_string(), 0.5)].into_iter().collect(),
            reject_sets: 0,
            refuse_reservation: false,
        }
    }

    fn quiet() -> BuildingConfig {
        BuildingConfig {
            noise_std: 0.0,
            amp_kw: 0.0,
            ..BuildingConfig::default()
        }
    }

    #[test]
    fn baseload_is_deterministic_per_seed() {
        let cfg = BuildingConfig::default();
        let mut a = BaseLoad::new(&cfg, 7);
        let mut b = BaseLoad::new(&cfg, 7);
        for step in 0..50 {
            assert_eq!(a.demand_kw(step), b.demand_kw(step));
        }
    }

    #[test]
    fn baseload_never_negative() {
        let cfg = BuildingConfig {
            base_kw: 1.0,
            amp_kw: 5.0,
            noise_std: 2.0,
            ..BuildingConfig::default()
        };
        let mut load = BaseLoad::new(&cfg, 1);
        assert!((0..500).all(|s| load.demand_kw(s) >= 0.0));
    }

    #[test]
    fn shedding_lowers_draw_until_reverted() {
        let mut plant = Plant::from_config(&quiet(), &[ahu()], 1);
        assert_eq!(plant.power_kw(0), 90.0);
        plant.set_point("AHU1", "FanSpeed", 40.0, TIMEOUT).expect("write accepted");
        assert_eq!(plant.power_kw(1), 78.0);
        assert_eq!(plant.shed_kw(), 12.0);
        plant.revert_point("AHU1", "FanSpeed", TIMEOUT).expect("revert accepted");
        assert_eq!(plant.power_kw(2), 90.0);
    }

    #[test]
    fn drift_while_shed_then_recovers() {
        let mut plant = Plant::from_config(&quiet(), &[ahu()], 1);
        plant.set_point("AHU1", "FanSpeed", 40.0, TIMEOUT).expect("write accepted");
        plant.advance();
        plant.advance();
        assert_eq!(plant.device("AHU1").and_then(|d| d.point("ZoneTemp")), Some(73.0));
        plant.set_point("AHU1", "FanSpeed", 100.0, TIMEOUT).expect("write accepted");
        plant.advance();
        plant.advance();
        assert_eq!(plant.device("AHU1").and_then(|d| d.point("ZoneTemp")), Some(72.0));
    }

    #[test]
    fn failure_injection() {
        let mut cfg = ahu();
        cfg.reject_sets = 1;
        cfg.refuse_reservation = true;
        let mut plant = Plant::from_config(&quiet(), &[cfg], 1);
        let now = Timestamp::from_secs(0);
        assert!(plant.reserve("AHU1", now, now, TIMEOUT).is_err());
        assert!(plant.set_point("AHU1", "FanSpeed", 40.0, TIMEOUT).is_err());
        assert!(plant.set_point("AHU1", "FanSpeed", 40.0, TIMEOUT).is_ok());
        assert_eq!(plant.counts().rejections, 2);
        assert!(matches!(
            plant.read_point("RTU9", "FanSpeed", TIMEOUT),
            Err(ActuationError::Unavailable(_))
        ));
    }
}
