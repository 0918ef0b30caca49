use crate::PointMap;
use crate::config::{CriterionConfig, CriterionKind, OperationArgs};
use crate::error::ConfigError;
use crate::expr::{CompiledExpr, normalize_point_name};
use crate::time::{Timestamp, minutes};

use super::MapperTables;
use super::history::{Comparison, HistoryCriterion};

/// Per-input policy for formula criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    /// Use every newly ingested value.
    Always,
    /// Keep the last value seen before the command was curtailed.
    FreezeWhenCurtailed,
}

impl InputMode {
    fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "always" => Some(InputMode::Always),
            "nc" | "freeze" | "freeze_when_curtailed" => Some(InputMode::FreezeWhenCurtailed),
            _ => None,
        }
    }
}

/// On/off point mapped to one of two scores.
#[derive(Debug, Clone)]
pub struct StatusCriterion {
    point: String,
    on_value: f64,
    off_value: f64,
    status: Option<bool>,
}

/// Expression over named points with per-input freeze policy.
#[derive(Debug, Clone)]
pub struct FormulaCriterion {
    expr: CompiledExpr,
    /// Parallel to `expr.variables()`.
    modes: Vec<InputMode>,
    /// Parallel to `expr.variables()`; `None` until the point is seen.
    values: Vec<Option<f64>>,
    curtailed: bool,
}

impl FormulaCriterion {
    fn ingest(&mut self, points: &PointMap) {
        for (idx, name) in self.expr.variables().iter().enumerate() {
            let frozen = self.curtailed
                && self.modes[idx] == InputMode::FreezeWhenCurtailed
                && self.values[idx].is_some();
            if !frozen {
                self.values[idx] = points.get(name).copied();
            }
        }
    }

    fn evaluate(&self, fallback: Option<f64>) -> Option<f64> {
        let values: Option<Vec<f64>> = self.values.iter().copied().collect();
        let Some(values) = values else {
            return fallback;
        };
        self.expr
            .evaluate_positional(&values)
            .ok()
            .and_then(|v| v.finite_number())
    }
}

/// The closed set of criterion kinds.
#[derive(Debug, Clone)]
pub enum Evaluator {
    Status(StatusCriterion),
    Constant(f64),
    Formula(FormulaCriterion),
    Mapper(f64),
    History(HistoryCriterion),
}

/// A named, bounded score input for one command.
#[derive(Debug, Clone)]
pub struct Criterion {
    name: String,
    minimum: Option<f64>,
    maximum: Option<f64>,
    evaluator: Evaluator,
}

fn required<T: Clone>(value: &Option<T>, field: &str) -> Result<T, ConfigError> {
    value
        .clone()
        .ok_or_else(|| ConfigError::new(field, "required parameter is missing"))
}

impl Criterion {
    pub fn new(
        name: impl Into<String>,
        minimum: Option<f64>,
        maximum: Option<f64>,
        evaluator: Evaluator,
    ) -> Self {
        Self {
            name: name.into(),
            minimum,
            maximum,
            evaluator,
        }
    }

    /// Builds a criterion from configuration, resolving mapper lookups
    /// and compiling formulas up front.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` for a missing variant parameter, an
    /// unparseable formula, an undefined mapper table or key, or
    /// `minimum > maximum`.
    pub fn from_config(config: &CriterionConfig, mappers: &MapperTables) -> Result<Self, ConfigError> {
        if let (Some(min), Some(max)) = (config.minimum, config.maximum) {
            if min > max {
                return Err(ConfigError::new("minimum", format!("{min} exceeds maximum {max}")));
            }
        }

        let evaluator = match &config.kind {
            CriterionKind::Status {
                point_name,
                on_value,
                off_value,
            } => Evaluator::Status(StatusCriterion {
                point: normalize_point_name(&required(point_name, "point_name")?),
                on_value: required(on_value, "on_value")?,
                off_value: *off_value,
                status: None,
            }),
            CriterionKind::Constant { value } => Evaluator::Constant(required(value, "value")?),
            CriterionKind::Formula {
                operation,
                operation_args,
            } => {
                let text = normalize_point_name(&required(operation, "operation")?);
                let expr = CompiledExpr::compile(&text)
                    .map_err(|e| ConfigError::new("operation", e.to_string()))?;
                let modes = formula_modes(&expr, operation_args.as_ref())?;
                let values = vec![None; expr.variables().len()];
                Evaluator::Formula(FormulaCriterion {
                    expr,
                    modes,
                    values,
                    curtailed: false,
                })
            }
            CriterionKind::Mapper { dict_name, map_key } => {
                let table = required(dict_name, "dict_name")?;
                let key = required(map_key, "map_key")?;
                Evaluator::Mapper(mappers.lookup(&table, &key)?)
            }
            CriterionKind::History {
                comparison_type,
                point_name,
                previous_time,
            } => {
                let text = required(comparison_type, "comparison_type")?;
                let comparison = Comparison::parse(&text).ok_or_else(|| {
                    ConfigError::new(
                        "comparison_type",
                        format!("\"{text}\" is not \"direct\" or \"inverse\""),
                    )
                })?;
                let point = normalize_point_name(&required(point_name, "point_name")?);
                let lookback = required(previous_time, "previous_time")?;
                if lookback <= 0.0 || !lookback.is_finite() {
                    return Err(ConfigError::new("previous_time", "must be > 0"));
                }
                Evaluator::History(HistoryCriterion::new(point, comparison, minutes(lookback)))
            }
        };

        Ok(Self::new(&config.name, config.minimum, config.maximum, evaluator))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    pub fn ingest(&mut self, now: Timestamp, points: &PointMap) {
        match &mut self.evaluator {
            Evaluator::Status(s) => {
                s.status = points.get(&s.point).map(|v| *v != 0.0);
            }
            Evaluator::Formula(f) => f.ingest(points),
            Evaluator::History(h) => h.ingest(now, points),
            Evaluator::Constant(_) | Evaluator::Mapper(_) => {}
        }
    }

    /// Forwards the owning command's curtailed flag.
    pub fn set_curtailed(&mut self, curtailed: bool) {
        if let Evaluator::Formula(f) = &mut self.evaluator {
            f.curtailed = curtailed;
        }
    }

    /// Raw, unclamped score. `None` means non-numeric.
    pub fn evaluate(&self) -> Option<f64> {
        match &self.evaluator {
            Evaluator::Status(s) => match s.status {
                Some(true) => Some(s.on_value),
                Some(false) => Some(s.off_value),
                None => self.minimum,
            },
            Evaluator::Constant(v) | Evaluator::Mapper(v) => Some(*v),
            Evaluator::Formula(f) => f.evaluate(self.minimum),
            Evaluator::History(h) => h.evaluate(self.minimum),
        }
    }

    /// Score clamped to `[minimum, maximum]`; non-numeric and non-finite
    /// raw results count as `0.0` before clamping.
    pub fn evaluate_criterion(&self) -> f64 {
        let mut value = self.evaluate().filter(|v| v.is_finite()).unwrap_or(0.0);
        if let Some(min) = self.minimum {
            value = value.max(min);
        }
        if let Some(max) = self.maximum {
            value = value.min(max);
        }
        value
    }

    /// Clears ingested state.
    pub fn reset(&mut self) {
        match &mut self.evaluator {
            Evaluator::Status(s) => s.status = None,
            Evaluator::Formula(f) => f.values.iter_mut().for_each(|v| *v = None),
            Evaluator::History(h) => h.reset(),
            Evaluator::Constant(_) | Evaluator::Mapper(_) => {}
        }
    }
}

fn formula_modes(expr: &CompiledExpr, args: Option<&OperationArgs>) -> Result<Vec<InputMode>, ConfigError> {
    let mut modes = vec![InputMode::Always; expr.variables().len()];
    let Some(OperationArgs::Tagged(tagged)) = args else {
        return Ok(modes);
    };
    for (point, tag) in tagged {
        let mode = InputMode::parse(tag).ok_or_else(|| {
            ConfigError::new(
                format!("operation_args.{point}"),
                format!("\"{tag}\" is not \"always\" or \"nc\""),
            )
        })?;
        let point = normalize_point_name(point);
        if let Some(idx) = expr.variables().iter().position(|v| *v == point) {
            modes[idx] = mode;
        }
    }
    Ok(modes)
}
