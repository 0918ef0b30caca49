//! Curtailable devices, their commands and curtailment settings.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, warn};

use crate::PointMap;
use crate::config::{
    CommandConfig, ConditionText, CurtailmentConfig, CurtailmentMethod, DeviceConfig,
    EquationConfig, LoadConfig,
};
use crate::criteria::{Criteria, MapperTables};
use crate::error::{ConfigError, ExprError};
use crate::expr::{CompiledExpr, normalize_point_name};
use crate::time::Timestamp;

/// Score label exposing a command's remaining daily quota.
pub const CURTAIL_COUNT: &str = "curtail_count";

/// An expression over device points with optional clamping.
#[derive(Debug, Clone)]
pub struct Equation {
    expr: CompiledExpr,
    minimum: Option<f64>,
    maximum: Option<f64>,
}

impl Equation {
    fn from_config(cfg: &EquationConfig) -> Result<Self, ConfigError> {
        let expr = CompiledExpr::compile(&normalize_point_name(&cfg.operation))
            .map_err(|e| ConfigError::new("operation", e.to_string()))?;
        check_args(&expr, &cfg.equation_args, "equation_args")?;
        Ok(Self {
            expr,
            minimum: cfg.minimum,
            maximum: cfg.maximum,
        })
    }

    pub fn variables(&self) -> &[String] {
        self.expr.variables()
    }

    fn evaluate(&self, points: &PointMap) -> Result<f64, ExprError> {
        let mut value = self.expr.evaluate(points)?.as_f64();
        if let Some(min) = self.minimum {
            value = value.max(min);
        }
        if let Some(max) = self.maximum {
            value = value.min(max);
        }
        Ok(value)
    }
}

/// How the curtailed value is produced.
#[derive(Debug, Clone)]
pub enum Method {
    Value(f64),
    Offset(f64),
    Equation(Equation),
}

/// Estimated load reduction, in demand-limit units.
#[derive(Debug, Clone)]
pub enum LoadEstimate {
    Fixed(f64),
    Equation(Equation),
}

/// Where and how a command curtails.
#[derive(Debug, Clone)]
pub struct CurtailmentSetting {
    pub point: String,
    pub method: Method,
    pub load: LoadEstimate,
    pub revert_priority: Option<u32>,
}

impl CurtailmentSetting {
    /// # Errors
    ///
    /// Returns a `ConfigError` naming the missing or malformed field.
    pub fn from_config(cfg: &CurtailmentConfig) -> Result<Self, ConfigError> {
        let point = cfg
            .point
            .as_deref()
            .map(normalize_point_name)
            .ok_or_else(|| ConfigError::new("point", "required parameter is missing"))?;
        let method = match cfg.curtailment_method {
            CurtailmentMethod::Value => Method::Value(
                cfg.value
                    .ok_or_else(|| ConfigError::new("value", "required for curtailment_method \"value\""))?,
            ),
            CurtailmentMethod::Offset => Method::Offset(
                cfg.offset
                    .ok_or_else(|| ConfigError::new("offset", "required for curtailment_method \"offset\""))?,
            ),
            CurtailmentMethod::Equation => {
                let eq = cfg.equation.as_ref().ok_or_else(|| {
                    ConfigError::new("equation", "required for curtailment_method \"equation\"")
                })?;
                Method::Equation(Equation::from_config(eq).map_err(|e| e.within("equation"))?)
            }
        };
        let load = match &cfg.load {
            Some(LoadConfig::Fixed(v)) => LoadEstimate::Fixed(*v),
            Some(LoadConfig::Equation(eq)) => {
                LoadEstimate::Equation(Equation::from_config(eq).map_err(|e| e.within("load"))?)
            }
            None => return Err(ConfigError::new("load", "required parameter is missing")),
        };
        Ok(Self {
            point,
            method,
            load,
            revert_priority: cfg.revert_priority,
        })
    }

    /// Points that must be read from the device before curtailing.
    pub fn required_points(&self) -> BTreeSet<String> {
        let mut points = BTreeSet::new();
        match &self.method {
            Method::Value(_) => {}
            Method::Offset(_) => {
                points.insert(self.point.clone());
            }
            Method::Equation(eq) => points.extend(eq.variables().iter().cloned()),
        }
        if let LoadEstimate::Equation(eq) = &self.load {
            points.extend(eq.variables().iter().cloned());
        }
        points
    }

    /// Value to write, given freshly read device points.
    ///
    /// # Errors
    ///
    /// Returns `ExprError::MissingBinding` if a needed point was not read.
    pub fn curtailed_value(&self, read: &PointMap) -> Result<f64, ExprError> {
        match &self.method {
            Method::Value(v) => Ok(*v),
            Method::Offset(offset) => read
                .get(&self.point)
                .map(|current| current + offset)
                .ok_or_else(|| ExprError::MissingBinding(self.point.clone())),
            Method::Equation(eq) => eq.evaluate(read),
        }
    }

    /// # Errors
    ///
    /// Returns `ExprError::MissingBinding` if a needed point was not read.
    pub fn load_estimate(&self, read: &PointMap) -> Result<f64, ExprError> {
        match &self.load {
            LoadEstimate::Fixed(v) => Ok(*v),
            LoadEstimate::Equation(eq) => eq.evaluate(read),
        }
    }
}

#[derive(Debug, Clone)]
struct ConditionalSetting {
    condition: CompiledExpr,
    setting: CurtailmentSetting,
}

/// A named curtailable action on a device.
#[derive(Debug, Clone)]
pub struct Command {
    name: String,
    eligibility: CompiledExpr,
    default_setting: CurtailmentSetting,
    conditional: Vec<ConditionalSetting>,
    criteria: Criteria,
    curtail_count: u32,
    max_daily: u32,
    curtailed: bool,
}

impl Command {
    /// # Errors
    ///
    /// Returns the first `ConfigError` found in the command's expressions,
    /// settings or criteria.
    pub fn from_config(cfg: &CommandConfig, mappers: &MapperTables) -> Result<Self, ConfigError> {
        let eligibility = compile_condition(&cfg.device_status.condition)
            .map_err(|e| e.within("device_status"))?;
        check_args(&eligibility, &cfg.device_status.device_status_args, "device_status_args")
            .map_err(|e| e.within("device_status"))?;
        let default_setting =
            CurtailmentSetting::from_config(&cfg.curtail).map_err(|e| e.within("curtail"))?;

        let mut conditional = Vec::with_capacity(cfg.conditional_curtail.len());
        for (i, c) in cfg.conditional_curtail.iter().enumerate() {
            let scope = format!("conditional_curtail[{i}]");
            let condition = compile_condition(&c.condition).map_err(|e| e.within(&scope))?;
            check_args(&condition, &c.conditional_args, "conditional_args").map_err(|e| e.within(&scope))?;
            let setting = CurtailmentSetting::from_config(&c.curtail).map_err(|e| e.within(&scope))?;
            conditional.push(ConditionalSetting { condition, setting });
        }

        Ok(Self {
            name: cfg.name.clone(),
            eligibility,
            default_setting,
            conditional,
            criteria: Criteria::from_config(&cfg.criteria, mappers)?,
            curtail_count: 0,
            max_daily: cfg.maximum_daily_curtailments,
            curtailed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn criteria(&self) -> &Criteria {
        &self.criteria
    }

    /// Whether the eligibility expression holds. A point missing from
    /// `points` makes the command ineligible.
    pub fn is_eligible(&self, points: &PointMap) -> bool {
        match self.eligibility.evaluate(points) {
            Ok(v) => v.truthy(),
            Err(e) => {
                debug!(command = %self.name, error = %e, "eligibility not evaluable");
                false
            }
        }
    }

    /// The first conditional setting whose condition holds, else the default.
    pub fn active_setting(&self, points: &PointMap) -> &CurtailmentSetting {
        self.conditional
            .iter()
            .find(|c| c.condition.evaluate(points).is_ok_and(|v| v.truthy()))
            .map_or(&self.default_setting, |c| &c.setting)
    }

    /// Criterion scores plus the remaining daily quota under [`CURTAIL_COUNT`].
    pub fn evaluate(&self) -> HashMap<String, f64> {
        let mut scores = self.criteria.evaluate();
        scores.insert(CURTAIL_COUNT.to_string(), self.remaining_quota() as f64);
        scores
    }

    pub fn curtail_count(&self) -> u32 {
        self.curtail_count
    }

    pub fn remaining_quota(&self) -> u32 {
        self.max_daily.saturating_sub(self.curtail_count)
    }

    pub fn quota_exhausted(&self) -> bool {
        self.curtail_count >= self.max_daily
    }

    pub fn is_curtailed(&self) -> bool {
        self.curtailed
    }

    pub fn mark_curtailed(&mut self) {
        self.curtail_count += 1;
        self.curtailed = true;
        self.criteria.set_curtailed(true);
    }

    pub fn mark_released(&mut self) {
        self.curtailed = false;
        self.criteria.set_curtailed(false);
    }

    pub fn reset_count(&mut self) {
        self.curtail_count = 0;
    }
}

/// A device with one or more commands sharing its telemetry.
#[derive(Debug, Clone)]
pub struct Device {
    name: String,
    commands: Vec<Command>,
    points: PointMap,
    point_set: Option<BTreeSet<String>>,
}

impl Device {
    /// # Errors
    ///
    /// Returns the first command's `ConfigError`, scoped by index.
    pub fn from_config(cfg: &DeviceConfig, mappers: &MapperTables) -> Result<Self, ConfigError> {
        let mut commands: Vec<Command> = Vec::with_capacity(cfg.commands.len());
        for (i, c) in cfg.commands.iter().enumerate() {
            let scope = format!("commands[{i}]");
            if commands.iter().any(|existing| existing.name == c.name) {
                return Err(ConfigError::new("name", format!("duplicate command \"{}\"", c.name)).within(&scope));
            }
            commands.push(Command::from_config(c, mappers).map_err(|e| e.within(&scope))?);
        }
        Ok(Self {
            name: cfg.name.clone(),
            commands,
            points: PointMap::new(),
            point_set: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn command(&self, name: &str) -> Option<&Command> {
        self.commands.iter().find(|c| c.name == name)
    }

    pub fn command_mut(&mut self, name: &str) -> Option<&mut Command> {
        self.commands.iter_mut().find(|c| c.name == name)
    }

    /// Latest telemetry, keyed by normalised point name.
    pub fn points(&self) -> &PointMap {
        &self.points
    }

    /// Takes a telemetry publish. Point names are normalised; a publish
    /// whose point set differs from the previous one resets ingestion
    /// state before it is applied.
    pub fn ingest(&mut self, now: Timestamp, raw: &PointMap) {
        let points: PointMap = raw
            .iter()
            .map(|(k, v)| (normalize_point_name(k), *v))
            .collect();
        let shape: BTreeSet<String> = points.keys().cloned().collect();

        match &self.point_set {
            Some(expected) if *expected != shape => {
                warn!(device = %self.name, "telemetry point set changed, reinitialising");
                for command in &mut self.commands {
                    command.criteria.reset();
                }
                self.point_set = Some(shape);
            }
            Some(_) => {}
            None => self.point_set = Some(shape),
        }

        self.points = points;
        for command in &mut self.commands {
            command.criteria.ingest(now, &self.points);
        }
    }

    /// Names of commands whose eligibility currently holds, in declaration order.
    pub fn on_commands(&self) -> Vec<&str> {
        self.commands
            .iter()
            .filter(|c| c.is_eligible(&self.points))
            .map(Command::name)
            .collect()
    }

    /// Score inputs for one command.
    pub fn evaluate_command(&self, command: &str) -> Option<HashMap<String, f64>> {
        self.command(command).map(Command::evaluate)
    }

    pub fn reset_counts(&mut self) {
        for command in &mut self.commands {
            command.reset_count();
        }
    }
}

fn compile_condition(text: &ConditionText) -> Result<CompiledExpr, ConfigError> {
    let compiled = match text {
        ConditionText::Single(s) => CompiledExpr::compile(&normalize_point_name(s)),
        ConditionText::Fragments(parts) => {
            let parts: Vec<String> = parts.iter().map(|p| normalize_point_name(p)).collect();
            CompiledExpr::compile_fragments(&parts)
        }
    };
    compiled.map_err(|e| ConfigError::new("condition", e.to_string()))
}

/// When argument names are listed they must cover every expression variable.
fn check_args(expr: &CompiledExpr, args: &[String], field: &str) -> Result<(), ConfigError> {
    if args.is_empty() {
        return Ok(());
    }
    let listed: BTreeSet<String> = args.iter().map(|a| normalize_point_name(a)).collect();
    match expr.variables().iter().find(|v| !listed.contains(*v)) {
        Some(missing) => Err(ConfigError::new(
            field,
            format!("\"{missing}\" is used in \"{}\" but not listed", expr.source()),
        )),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConditionalCurtailmentConfig, CriterionConfig, CriterionKind, DeviceStatusConfig};

    fn points(pairs: &[(&str, f64)]) -> PointMap {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn curtail(point: &str, value: f64, load: f64) -> CurtailmentConfig {
        CurtailmentConfig {
            point: Some(point.into()),
            value: Some(value),
            load: Some(LoadConfig::Fixed(load)),
            revert_priority: Some(1),
            ..CurtailmentConfig::default()
        }
    }

    fn command(name: &str, condition: &str) -> CommandConfig {
        CommandConfig {
            name: name.into(),
            device_status: DeviceStatusConfig {
                condition: ConditionText::Single(condition.into()),
                device_status_args: Vec::new(),
            },
            curtail: curtail("FanSpeed", 40.0, 10.0),
            conditional_curtail: Vec::new(),
            maximum_daily_curtailments: 2,
            criteria: vec![CriterionConfig {
                name: "zone".into(),
                minimum: Some(0.0),
                maximum: Some(10.0),
                kind: CriterionKind::Formula {
                    operation: Some("Zone Temp - 70".into()),
                    operation_args: None,
                },
            }],
        }
    }

    fn device(commands: Vec<CommandConfig>) -> Device {
        let cfg = DeviceConfig {
            name: "AHU1".into(),
            commands,
        };
        Device::from_config(&cfg, &MapperTables::default()).expect("device builds")
    }

    #[test]
    fn on_commands_follow_eligibility() {
        let mut d = device(vec![command("fan", "FanStatus == 1"), command("cool", "CoolCall > 0")]);
        d.ingest(Timestamp::from_secs(0), &points(&[("FanStatus", 1.0), ("CoolCall", 0.0), ("ZoneTemp", 74.0)]));
        assert_eq!(d.on_commands(), vec!["fan"]);
    }

    #[test]
    fn missing_point_makes_command_ineligible() {
        let mut d = device(vec![command("fan", "FanStatus == 1")]);
        d.ingest(Timestamp::from_secs(0), &points(&[("ZoneTemp", 74.0)]));
        assert!(d.on_commands().is_empty());
    }

    #[test]
    fn names_with_spaces_are_normalised() {
        let mut d = device(vec![command("fan", "Fan Status == 1")]);
        d.ingest(Timestamp::from_secs(0), &points(&[("Fan Status", 1.0), ("Zone Temp", 74.0)]));
        assert_eq!(d.on_commands(), vec!["fan"]);
        let scores = d.evaluate_command("fan").expect("fan is a command");
        assert_eq!(scores.get("zone"), Some(&4.0));
    }

    #[test]
    fn evaluation_includes_remaining_quota() {
        let mut d = device(vec![command("fan", "FanStatus == 1")]);
        if let Some(c) = d.command_mut("fan") {
            c.mark_curtailed();
        }
        let scores = d.evaluate_command("fan").expect("fan is a command");
        assert_eq!(scores.get(CURTAIL_COUNT), Some(&1.0));
    }

    #[test]
    fn quota_exhausts_and_resets() {
        let mut d = device(vec![command("fan", "FanStatus == 1")]);
        let Some(c) = d.command_mut("fan") else {
            panic!("fan command should exist");
        };
        c.mark_curtailed();
        c.mark_released();
        assert!(!c.quota_exhausted());
        c.mark_curtailed();
        assert!(c.quota_exhausted());
        d.reset_counts();
        assert!(d.command("fan").is_some_and(|c| !c.quota_exhausted()));
    }

    #[test]
    fn conditional_setting_first_match_wins() {
        let mut cfg = command("fan", "FanStatus == 1");
        cfg.conditional_curtail = vec![
            ConditionalCurtailmentConfig {
                condition: ConditionText::Single("OAT > 90".into()),
                conditional_args: Vec::new(),
                curtail: curtail("FanSpeed", 60.0, 5.0),
            },
            ConditionalCurtailmentConfig {
                condition: ConditionText::Single("OAT > 80".into()),
                conditional_args: Vec::new(),
                curtail: curtail("FanSpeed", 50.0, 7.0),
            },
        ];
        let d = device(vec![cfg]);
        let Some(c) = d.command("fan") else {
            panic!("fan command should exist");
        };
        let value = |oat: f64| {
            c.active_setting(&points(&[("OAT", oat)]))
                .curtailed_value(&PointMap::new())
                .ok()
        };
        assert_eq!(value(95.0), Some(60.0));
        assert_eq!(value(85.0), Some(50.0));
        assert_eq!(value(70.0), Some(40.0));
        assert_eq!(
            c.active_setting(&PointMap::new()).curtailed_value(&PointMap::new()).ok(),
            Some(40.0)
        );
    }

    #[test]
    fn offset_and_equation_methods() {
        let offset = CurtailmentSetting::from_config(&CurtailmentConfig {
            point: Some("ZoneSetpoint".into()),
            curtailment_method: CurtailmentMethod::Offset,
            offset: Some(2.0),
            load: Some(LoadConfig::Equation(EquationConfig {
                operation: "Amps * 0.5".into(),
                equation_args: vec!["Amps".into()],
                minimum: None,
                maximum: None,
            })),
            ..CurtailmentConfig::default()
        });
        let Ok(offset) = offset else {
            panic!("offset setting should build");
        };
        let read = points(&[("ZoneSetpoint", 72.0), ("Amps", 30.0)]);
        assert_eq!(
            offset.required_points().into_iter().collect::<Vec<_>>(),
            vec!["Amps".to_string(), "ZoneSetpoint".to_string()]
        );
        assert_eq!(offset.curtailed_value(&read), Ok(74.0));
        assert_eq!(offset.load_estimate(&read), Ok(15.0));

        let equation = CurtailmentSetting::from_config(&CurtailmentConfig {
            point: Some("Damper".into()),
            curtailment_method: CurtailmentMethod::Equation,
            equation: Some(EquationConfig {
                operation: "Damper - 30".into(),
                equation_args: Vec::new(),
                minimum: Some(20.0),
                maximum: None,
            }),
            load: Some(LoadConfig::Fixed(4.0)),
            ..CurtailmentConfig::default()
        });
        let Ok(equation) = equation else {
            panic!("equation setting should build");
        };
        assert_eq!(equation.curtailed_value(&points(&[("Damper", 80.0)])), Ok(50.0));
        assert_eq!(equation.curtailed_value(&points(&[("Damper", 40.0)])), Ok(20.0));
        assert!(equation.curtailed_value(&PointMap::new()).is_err());
    }

    #[test]
    fn missing_value_for_method_is_config_error() {
        let err = CurtailmentSetting::from_config(&CurtailmentConfig {
            point: Some("FanSpeed".into()),
            curtailment_method: CurtailmentMethod::Offset,
            load: Some(LoadConfig::Fixed(1.0)),
            ..CurtailmentConfig::default()
        });
        assert!(err.is_err_and(|e| e.field == "offset"));
    }

    #[test]
    fn unlisted_condition_argument_is_rejected() {
        let mut cfg = command("fan", "FanStatus == 1 & Occupied == 1");
        cfg.device_status.device_status_args = vec!["FanStatus".into()];
        let err = Device::from_config(
            &DeviceConfig {
                name: "AHU1".into(),
                commands: vec![cfg],
            },
            &MapperTables::default(),
        );
        assert!(err.is_err_and(|e| e.field == "commands[0].device_status.device_status_args"));
    }

    #[test]
    fn point_set_change_resets_criteria() {
        let mut d = device(vec![command("fan", "FanStatus == 1")]);
        d.ingest(Timestamp::from_secs(0), &points(&[("FanStatus", 1.0), ("ZoneTemp", 75.0)]));
        assert_eq!(d.evaluate_command("fan").and_then(|s| s.get("zone").copied()), Some(5.0));
        d.ingest(Timestamp::from_secs(60), &points(&[("FanStatus", 1.0)]));
        assert_eq!(d.evaluate_command("fan").and_then(|s| s.get("zone").copied()), Some(0.0));
        assert_eq!(d.on_commands(), vec!["fan"]);
    }
}
