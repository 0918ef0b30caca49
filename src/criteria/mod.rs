//! Per-command score inputs for the AHP ranking.
//!
//! Each command owns a [`Criteria`] set built from configuration. Telemetry
//! flows in through [`Criteria::ingest`]; [`Criteria::evaluate`] yields one
//! bounded score per criterion name.

mod criterion;
mod history;

use std::collections::{BTreeMap, HashMap};

pub use criterion::{Criterion, Evaluator, FormulaCriterion, InputMode, StatusCriterion};
pub use history::{Comparison, HistoryCriterion};

use crate::PointMap;
use crate::config::CriterionConfig;
use crate::error::ConfigError;
use crate::time::Timestamp;

/// Named lookup tables consulted by mapper criteria.
///
/// Passed to every mapper at construction, so lookups are resolved once.
#[derive(Debug, Clone, Default)]
pub struct MapperTables {
    tables: HashMap<String, HashMap<String, f64>>,
}

impl MapperTables {
    pub fn from_config(config: &BTreeMap<String, BTreeMap<String, f64>>) -> Self {
        let tables = config
            .iter()
            .map(|(name, entries)| {
                let entries = entries.iter().map(|(k, v)| (k.clone(), *v)).collect();
                (name.clone(), entries)
            })
            .collect();
        Self { tables }
    }

    pub fn insert(&mut self, table: &str, key: &str, value: f64) {
        self.tables
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    /// # Errors
    ///
    /// Returns a `ConfigError` when the table or the key is undefined.
    pub fn lookup(&self, table: &str, key: &str) -> Result<f64, ConfigError> {
        let entries = self
            .tables
            .get(table)
            .ok_or_else(|| ConfigError::new("dict_name", format!("undefined mapper table \"{table}\"")))?;
        entries.get(key).copied().ok_or_else(|| {
            ConfigError::new("map_key", format!("key \"{key}\" not found in mapper table \"{table}\""))
        })
    }
}

/// All criteria attached to one command.
#[derive(Debug, Clone, Default)]
pub struct Criteria {
    criteria: Vec<Criterion>,
}

impl Criteria {
    pub fn new(criteria: Vec<Criterion>) -> Self {
        Self { criteria }
    }

    /// # Errors
    ///
    /// Returns the first criterion's `ConfigError`, scoped by its name, or
    /// an error for a duplicated name.
    pub fn from_config(configs: &[CriterionConfig], mappers: &MapperTables) -> Result<Self, ConfigError> {
        let mut criteria: Vec<Criterion> = Vec::with_capacity(configs.len());
        for (i, cfg) in configs.iter().enumerate() {
            let scope = format!("criteria[{i}]");
            if criteria.iter().any(|c| c.name() == cfg.name) {
                return Err(ConfigError::new("name", format!("duplicate criterion \"{}\"", cfg.name)).within(&scope));
            }
            criteria.push(Criterion::from_config(cfg, mappers).map_err(|e| e.within(&scope))?);
        }
        Ok(Self { criteria })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.criteria.iter().map(Criterion::name)
    }

    pub fn len(&self) -> usize {
        self.criteria.len()
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    pub fn ingest(&mut self, now: Timestamp, points: &PointMap) {
        for criterion in &mut self.criteria {
            criterion.ingest(now, points);
        }
    }

    pub fn set_curtailed(&mut self, curtailed: bool) {
        for criterion in &mut self.criteria {
            criterion.set_curtailed(curtailed);
        }
    }

    /// Bounded score per criterion name.
    pub fn evaluate(&self) -> HashMap<String, f64> {
        self.criteria
            .iter()
            .map(|c| (c.name().to_string(), c.evaluate_criterion()))
            .collect()
    }

    pub fn reset(&mut self) {
        for criterion in &mut self.criteria {
            criterion.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CriterionKind;

    fn constant(name: &str, value: f64) -> CriterionConfig {
        CriterionConfig {
            name: name.into(),
            minimum: None,
            maximum: None,
            kind: CriterionKind::Constant { value: Some(value) },
        }
    }

    #[test]
    fn evaluates_every_criterion_by_name() {
        let criteria = Criteria::from_config(
            &[constant("age", 0.8), constant("size", 0.2)],
            &MapperTables::default(),
        );
        let scores = criteria.map(|c| c.evaluate()).expect("criteria build");
        assert_eq!(scores.get("age"), Some(&0.8));
        assert_eq!(scores.get("size"), Some(&0.2));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = Criteria::from_config(
            &[constant("age", 0.8), constant("age", 0.2)],
            &MapperTables::default(),
        );
        assert!(err.is_err_and(|e| e.field == "criteria[1].name"));
    }

    #[test]
    fn errors_are_scoped_by_index() {
        let bad = CriterionConfig {
            name: "zone".into(),
            minimum: None,
            maximum: None,
            kind: CriterionKind::Mapper {
                dict_name: Some("missing".into()),
                map_key: Some("k".into()),
            },
        };
        let err = Criteria::from_config(&[constant("age", 1.0), bad], &MapperTables::default());
        assert!(err.is_err_and(|e| e.field == "criteria[1].dict_name"));
    }

    #[test]
    fn mapper_tables_from_config() {
        let cfg = BTreeMap::from([(
            "zone_type".to_string(),
            BTreeMap::from([("office".to_string(), 0.4)]),
        )]);
        let tables = MapperTables::from_config(&cfg);
        assert_eq!(tables.lookup("zone_type", "office"), Ok(0.4));
        assert!(tables.lookup("zone_type", "lab").is_err());
        assert!(tables.lookup("other", "office").is_err());
    }
}
