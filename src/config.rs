//! TOML-based scenario configuration and preset definitions.
//!
//! A scenario bundles the engine settings, device clusters and lookup
//! tables the decision engine is built from, plus the simulated building
//! the replay harness drives it with.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

pub use crate::error::ConfigError;

/// Top-level scenario configuration parsed from TOML.
///
/// Load from TOML with [`ScenarioConfig::from_toml_file`] or use
/// [`ScenarioConfig::from_preset`] for a built-in scenario.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioConfig {
    /// Replay timing and seed.
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// Simulated uncontrolled building load.
    #[serde(default)]
    pub building: BuildingConfig,
    /// Decision engine settings.
    #[serde(default)]
    pub engine: EngineSettings,
    /// Named lookup tables for mapper criteria (table → key → score).
    #[serde(default)]
    pub mappers: BTreeMap<String, BTreeMap<String, f64>>,
    /// Device clusters, each with its own comparison matrix.
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
    /// Simulated devices backing the clusters during replay.
    #[serde(default)]
    pub plant: Vec<PlantDeviceConfig>,
}

/// Replay timing and global parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    /// Number of power-sample ticks to replay (must be > 0).
    pub steps: usize,
    /// Seconds between ticks (must be > 0).
    pub step_seconds: u64,
    /// Master random seed.
    pub seed: u64,
    /// Tick at which the kill switch is raised, if any.
    pub kill_at_step: Option<usize>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            steps: 480,
            step_seconds: 60,
            seed: 42,
            kill_at_step: None,
        }
    }
}

/// Uncontrolled building load: a daily sinusoid plus gaussian noise.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildingConfig {
    /// Baseline consumption (kW).
    pub base_kw: f64,
    /// Sinusoidal amplitude (kW).
    pub amp_kw: f64,
    /// Phase offset (radians).
    pub phase_rad: f64,
    /// Gaussian noise standard deviation (kW).
    pub noise_std: f64,
    /// Length of one sinusoid period, in ticks.
    pub period_steps: usize,
}

impl Default for BuildingConfig {
    fn default() -> Self {
        Self {
            base_kw: 60.0,
            amp_kw: 20.0,
            phase_rad: -1.57,
            noise_std: 1.0,
            period_steps: 480,
        }
    }
}

/// A `(device, point)` address on the telemetry bus.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PointAddress {
    pub device: String,
    pub point: String,
}

/// A scheduled demand target: `target` applies from `start` until `end`
/// (minutes since the replay epoch).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DemandTargetConfig {
    pub id: Option<String>,
    pub start: f64,
    pub end: Option<f64>,
    pub target: f64,
}

/// Decision engine timing, limits and bus addresses.
///
/// Durations are minutes unless noted otherwise.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSettings {
    /// Identity presented to the actuation service.
    pub agent_id: String,
    /// Static demand limit (kW). `None` means no curtailment until a
    /// scheduled demand target becomes active.
    pub demand_limit: Option<f64>,
    /// How long a curtailment episode holds devices curtailed.
    pub curtailment_time: f64,
    /// Delay between starting curtailment and re-checking demand.
    pub curtailment_confirm: f64,
    /// Cool-down after an episode during which no curtailment may start.
    pub curtailment_break: f64,
    /// Length of the raw power averaging window.
    pub average_building_power_window: f64,
    /// Extra time added to every device reservation.
    pub actuator_schedule_buffer: f64,
    /// Hours after an episode ends before daily counters are zeroed.
    pub reset_curtail_count_time: f64,
    /// Release curtailed devices in time-spaced groups.
    pub stagger_release: bool,
    /// Stagger window; defaults to `curtailment_break`.
    pub stagger_window: Option<f64>,
    /// Exponential smoothing factor for building power.
    pub smoothing_alpha: f64,
    /// Samples required in the power window before curtailment may start.
    pub minimum_power_samples: usize,
    /// Timeout for a single actuation call, in seconds.
    pub actuation_timeout: f64,
    /// Allowed deviation from `m[i][j] * m[j][i] == 1`.
    pub matrix_tolerance: f64,
    /// Largest acceptable AHP consistency ratio.
    pub max_consistency_ratio: f64,
    /// Whole-building meter.
    pub power_meter: PointAddress,
    /// Optional kill switch point.
    pub kill_switch: Option<PointAddress>,
    /// Scheduled demand targets.
    pub demand_targets: Vec<DemandTargetConfig>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            agent_id: "ilc".to_string(),
            demand_limit: None,
            curtailment_time: 15.0,
            curtailment_confirm: 5.0,
            curtailment_break: 15.0,
            average_building_power_window: 5.0,
            actuator_schedule_buffer: 15.0,
            reset_curtail_count_time: 6.0,
            stagger_release: false,
            stagger_window: None,
            smoothing_alpha: 0.125,
            minimum_power_samples: 15,
            actuation_timeout: 5.0,
            matrix_tolerance: 0.01,
            max_consistency_ratio: 0.2,
            power_meter: PointAddress {
                device: "building_meter".to_string(),
                point: "WholeBuildingPower".to_string(),
            },
            kill_switch: None,
            demand_targets: Vec::new(),
        }
    }
}

/// One device cluster sharing a pairwise comparison matrix.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub name: String,
    /// Multiplier applied to every composite score in this cluster.
    #[serde(default = "default_priority")]
    pub priority: f64,
    /// Criterion names, in matrix row/column order.
    pub criteria_labels: Vec<String>,
    /// Square pairwise comparison matrix; `m[i][j]` rates criterion `i`
    /// against criterion `j`.
    pub comparison_matrix: Vec<Vec<f64>>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

fn default_priority() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(default)]
    pub commands: Vec<CommandConfig>,
}

/// One curtailable command on a device.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandConfig {
    pub name: String,
    /// Eligibility ("is this command on") expression.
    pub device_status: DeviceStatusConfig,
    /// Default curtailment setting.
    pub curtail: CurtailmentConfig,
    /// Conditional settings, checked in order before the default.
    #[serde(default)]
    pub conditional_curtail: Vec<ConditionalCurtailmentConfig>,
    #[serde(default = "default_max_daily_curtailments")]
    pub maximum_daily_curtailments: u32,
    #[serde(default)]
    pub criteria: Vec<CriterionConfig>,
}

fn default_max_daily_curtailments() -> u32 {
    50
}

/// Expression text, either whole or as fragments joined with `&` / `|`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ConditionText {
    Single(String),
    Fragments(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceStatusConfig {
    pub condition: ConditionText,
    /// Points the condition reads; inferred from the expression when empty.
    #[serde(default)]
    pub device_status_args: Vec<String>,
}

/// How the curtailed value is derived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurtailmentMethod {
    /// Write a fixed value.
    #[default]
    Value,
    /// Read the current value and add an offset.
    Offset,
    /// Evaluate an equation over points read from the device.
    Equation,
}

/// An expression over device points, optionally clamped.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EquationConfig {
    pub operation: String,
    #[serde(default)]
    pub equation_args: Vec<String>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
}

/// Estimated load reduction: a constant or an equation over device points.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum LoadConfig {
    Fixed(f64),
    Equation(EquationConfig),
}

/// Curtailment setting. Required fields are optional here so a missing
/// one is reported with its field path rather than as a TOML error.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CurtailmentConfig {
    pub point: Option<String>,
    #[serde(default)]
    pub curtailment_method: CurtailmentMethod,
    pub value: Option<f64>,
    pub offset: Option<f64>,
    pub equation: Option<EquationConfig>,
    pub load: Option<LoadConfig>,
    pub revert_priority: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConditionalCurtailmentConfig {
    pub condition: ConditionText,
    #[serde(default)]
    pub conditional_args: Vec<String>,
    #[serde(flatten)]
    pub curtail: CurtailmentConfig,
}

/// One criterion attached to a command.
#[derive(Debug, Clone, Deserialize)]
pub struct CriterionConfig {
    pub name: String,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    #[serde(flatten)]
    pub kind: CriterionKind,
}

/// Variant-specific criterion parameters, selected by `operation_type`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "operation_type", rename_all = "snake_case")]
pub enum CriterionKind {
    Status {
        point_name: Option<String>,
        on_value: Option<f64>,
        #[serde(default)]
        off_value: f64,
    },
    Constant {
        value: Option<f64>,
    },
    Formula {
        operation: Option<String>,
        operation_args: Option<OperationArgs>,
    },
    Mapper {
        dict_name: Option<String>,
        map_key: Option<String>,
    },
    History {
        comparison_type: Option<String>,
        point_name: Option<String>,
        /// Minutes into the past to compare against.
        previous_time: Option<f64>,
    },
}

/// Formula arguments: a plain list (every point live) or a map of point
/// name to `"always"` / `"nc"` (freeze while curtailed).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum OperationArgs {
    List(Vec<String>),
    Tagged(BTreeMap<String, String>),
}

/// A simulated device used by the replay harness.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlantDeviceConfig {
    pub name: String,
    /// Draw while operating normally (kW).
    pub load_kw: f64,
    /// Draw removed while any shed point is off its nominal value (kW).
    pub shed_kw: f64,
    /// Points whose deviation from nominal counts as shed.
    pub shed_points: Vec<String>,
    /// Initial (nominal) point values.
    pub points: BTreeMap<String, f64>,
    /// Per-tick change applied to points while the device is shed.
    #[serde(default)]
    pub drift: BTreeMap<String, f64>,
    /// Number of `set_point` calls to reject before succeeding.
    #[serde(default)]
    pub reject_sets: u32,
    /// Refuse every reservation request.
    #[serde(default)]
    pub refuse_reservation: bool,
}

impl ScenarioConfig {
    /// Available preset names.
    pub const PRESETS: &[&str] = &["office", "stagger"];

    /// Loads a scenario from a named preset.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the preset name is unknown.
    pub fn from_preset(name: &str) -> Result<Self, ConfigError> {
        let text = match name {
            "office" => include_str!("../scenarios/office.toml"),
            "stagger" => include_str!("../scenarios/stagger.toml"),
            _ => {
                return Err(ConfigError::new(
                    "preset",
                    format!(
                        "unknown preset \"{name}\", available: {}",
                        Self::PRESETS.join(", ")
                    ),
                ));
            }
        };
        Self::from_toml_str(text).map_err(|e| e.within(&format!("preset.{name}")))
    }

    /// Parses a scenario from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be read or the TOML is invalid.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| {
            ConfigError::new("scenario", format!("cannot read \"{}\": {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses a scenario from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the TOML is invalid or contains unknown fields.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::new("toml", e.to_string()))
    }

    /// Validates field ranges and shapes and returns every problem found.
    ///
    /// Expression syntax, mapper lookups and matrix consistency are checked
    /// when the engine is built, since they need compiled state.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        let s = &self.simulation;
        if s.steps == 0 {
            errors.push(ConfigError::new("simulation.steps", "must be > 0"));
        }
        if s.step_seconds == 0 {
            errors.push(ConfigError::new("simulation.step_seconds", "must be > 0"));
        }
        if self.building.period_steps == 0 {
            errors.push(ConfigError::new("building.period_steps", "must be > 0"));
        }

        errors.extend(self.engine.validate());

        if self.clusters.is_empty() {
            errors.push(ConfigError::new("clusters", "at least one cluster is required"));
        }
        for (ci, cluster) in self.clusters.iter().enumerate() {
            let scope = format!("clusters[{ci}]");
            errors.extend(cluster.validate().into_iter().map(|e| e.within(&scope)));
        }

        for (pi, device) in self.plant.iter().enumerate() {
            for point in &device.shed_points {
                if !device.points.contains_key(point) {
                    errors.push(ConfigError::new(
                        format!("plant[{pi}].shed_points"),
                        format!("\"{point}\" has no initial value in points"),
                    ));
                }
            }
        }

        errors
    }
}

impl EngineSettings {
    /// Validates timing and smoothing parameters.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        let positive = [
            ("engine.curtailment_time", self.curtailment_time),
            ("engine.curtailment_confirm", self.curtailment_confirm),
            ("engine.average_building_power_window", self.average_building_power_window),
            ("engine.actuation_timeout", self.actuation_timeout),
        ];
        for (field, value) in positive {
            if value <= 0.0 || !value.is_finite() {
                errors.push(ConfigError::new(field, "must be > 0"));
            }
        }
        let non_negative = [
            ("engine.curtailment_break", self.curtailment_break),
            ("engine.actuator_schedule_buffer", self.actuator_schedule_buffer),
            ("engine.reset_curtail_count_time", self.reset_curtail_count_time),
            ("engine.matrix_tolerance", self.matrix_tolerance),
            ("engine.max_consistency_ratio", self.max_consistency_ratio),
        ];
        for (field, value) in non_negative {
            if value < 0.0 || !value.is_finite() {
                errors.push(ConfigError::new(field, "must be >= 0"));
            }
        }
        if !(self.smoothing_alpha > 0.0 && self.smoothing_alpha <= 1.0) {
            errors.push(ConfigError::new("engine.smoothing_alpha", "must be in (0.0, 1.0]"));
        }
        if let Some(limit) = self.demand_limit {
            if limit <= 0.0 || !limit.is_finite() {
                errors.push(ConfigError::new("engine.demand_limit", "must be > 0"));
            }
        }
        if let Some(window) = self.stagger_window {
            if window <= 0.0 || !window.is_finite() {
                errors.push(ConfigError::new("engine.stagger_window", "must be > 0"));
            }
        }
        for (i, target) in self.demand_targets.iter().enumerate() {
            if target.end.is_some_and(|end| end <= target.start) {
                errors.push(ConfigError::new(
                    format!("engine.demand_targets[{i}].end"),
                    "must be > start",
                ));
            }
            if target.target <= 0.0 {
                errors.push(ConfigError::new(
                    format!("engine.demand_targets[{i}].target"),
                    "must be > 0",
                ));
            }
        }
        errors
    }
}

impl ClusterConfig {
    /// Checks matrix shape and label agreement.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        let n = self.criteria_labels.len();
        if n == 0 {
            errors.push(ConfigError::new("criteria_labels", "must not be empty"));
        }
        if self.comparison_matrix.len() != n
            || self.comparison_matrix.iter().any(|row| row.len() != n)
        {
            errors.push(ConfigError::new(
                "comparison_matrix",
                format!("must be a square {n}x{n} matrix matching criteria_labels"),
            ));
        }
        if self.priority <= 0.0 || !self.priority.is_finite() {
            errors.push(ConfigError::new("priority", "must be > 0"));
        }
        for (di, device) in self.devices.iter().enumerate() {
            if device.commands.is_empty() {
                errors.push(ConfigError::new(
                    format!("devices[{di}].commands"),
                    "a device needs at least one command",
                ));
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[engine]
demand_limit = 100.0

[[clusters]]
name = "hvac"
criteria_labels = ["age", "size"]
comparison_matrix = [[1.0, 3.0], [0.3333333333, 1.0]]

[[clusters.devices]]
name = "AHU1"

[[clusters.devices.commands]]
name = "fan"
device_status = { condition = "SupplyFanStatus == 1" }
curtail = { point = "SupplyFanSpeed", value = 40, load = 12, revert_priority = 1 }

[[clusters.devices.commands.criteria]]
name = "age"
operation_type = "constant"
value = 0.8

[[clusters.devices.commands.criteria]]
name = "size"
operation_type = "formula"
operation = "SupplyFanSpeed / 100"
operation_args = { SupplyFanSpeed = "nc" }
minimum = 0.0
maximum = 1.0
"#;

    #[test]
    fn all_presets_parse_and_validate() {
        for name in ScenarioConfig::PRESETS {
            let cfg = ScenarioConfig::from_preset(name).expect("preset loads");
            let errors = cfg.validate();
            assert!(errors.is_empty(), "preset \"{name}\" should be valid: {errors:?}");
        }
    }

    #[test]
    fn from_preset_unknown() {
        let err = ScenarioConfig::from_preset("nonexistent");
        assert!(err.is_err_and(|e| e.message.contains("unknown preset")));
    }

    #[test]
    fn minimal_toml_parses_nested_clusters() {
        let cfg = ScenarioConfig::from_toml_str(MINIMAL).expect("minimal TOML parses");
        assert_eq!(cfg.engine.demand_limit, Some(100.0));
        assert_eq!(cfg.clusters.len(), 1);
        let command = &cfg.clusters[0].devices[0].commands[0];
        assert_eq!(command.maximum_daily_curtailments, 50);
        assert_eq!(command.curtail.load, Some(LoadConfig::Fixed(12.0)));
        assert_eq!(command.curtail.curtailment_method, CurtailmentMethod::Value);
        assert_eq!(
            command.criteria[1].kind,
            CriterionKind::Formula {
                operation: Some("SupplyFanSpeed / 100".into()),
                operation_args: Some(OperationArgs::Tagged(BTreeMap::from([(
                    "SupplyFanSpeed".to_string(),
                    "nc".to_string()
                )]))),
            }
        );
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn condition_accepts_fragments() {
        let toml = r#"
condition = ["a > 1", "&", "b < 2"]
"#;
        let parsed: Result<DeviceStatusConfig, _> = toml::from_str(toml);
        assert_eq!(
            parsed.map(|d| d.condition).ok(),
            Some(ConditionText::Fragments(vec![
                "a > 1".into(),
                "&".into(),
                "b < 2".into()
            ]))
        );
    }

    #[test]
    fn load_accepts_equation() {
        let toml = r#"
point = "Damper"
load = { operation = "Amps * 0.2", equation_args = ["Amps"] }
"#;
        let parsed: Result<CurtailmentConfig, _> = toml::from_str(toml);
        let load = parsed.ok().and_then(|c| c.load);
        assert!(matches!(load, Some(LoadConfig::Equation(ref eq)) if eq.operation == "Amps * 0.2"));
    }

    #[test]
    fn unknown_engine_field_is_rejected() {
        let toml = r#"
[engine]
demand_limit = 10.0
bogus_field = true
"#;
        assert!(ScenarioConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn validation_catches_bad_matrix_shape() {
        let mut cfg = ScenarioConfig::from_toml_str(MINIMAL).expect("fixture parses");
        cfg.clusters[0].comparison_matrix.pop();
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "clusters[0].comparison_matrix"));
    }

    #[test]
    fn validation_catches_bad_alpha_and_limit() {
        let mut cfg = ScenarioConfig::from_toml_str(MINIMAL).expect("fixture parses");
        cfg.engine.smoothing_alpha = 0.0;
        cfg.engine.demand_limit = Some(-5.0);
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "engine.smoothing_alpha"));
        assert!(errors.iter().any(|e| e.field == "engine.demand_limit"));
    }

    #[test]
    fn rejects_non_finite_stagger_window() {
        let mut cfg = ScenarioConfig::from_toml_str(MINIMAL).expect("fixture parses");
        cfg.engine.stagger_window = Some(f64::INFINITY);
        assert!(cfg.validate().iter().any(|e| e.field == "engine.stagger_window"));
        cfg.engine.stagger_window = Some(f64::NAN);
        assert!(cfg.validate().iter().any(|e| e.field == "engine.stagger_window"));
        cfg.engine.stagger_window = Some(12.0);
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn validation_catches_inverted_target_window() {
        let mut cfg = ScenarioConfig::from_toml_str(MINIMAL).expect("fixture parses");
        cfg.engine.demand_targets.push(DemandTargetConfig {
            id: None,
            start: 30.0,
            end: Some(10.0),
            target: 80.0,
        });
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "engine.demand_targets[0].end"));
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let cfg = ScenarioConfig::from_toml_str(MINIMAL).expect("fixture parses");
        assert_eq!(cfg.engine.curtailment_time, 15.0);
        assert_eq!(cfg.engine.smoothing_alpha, 0.125);
        assert_eq!(cfg.simulation.step_seconds, 60);
        assert!(!cfg.engine.stagger_release);
    }
}
