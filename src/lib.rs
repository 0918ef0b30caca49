//! Intelligent load curtailment: a demand-limiting decision engine.
//!
//! The engine watches whole-building power, ranks controllable device
//! commands with the Analytic Hierarchy Process, sheds the best-ranked
//! loads until demand is back under the limit, and later restores them.

/// Analytic Hierarchy Process weights and composite scoring.
pub mod ahp;
pub mod cluster;
pub mod config;
/// Curtailment state machine, revert bookkeeping and actuator contract.
pub mod control;
/// Per-device criteria and their evaluators.
pub mod criteria;
pub mod device;
pub mod error;
/// Boolean and arithmetic expressions over named points.
pub mod expr;
pub mod io;
pub mod service;
/// Replay harness driving the engine against a simulated building.
pub mod sim;
pub mod time;

#[cfg(feature = "api")]
pub mod api;

/// Point name to value, as published by a device.
pub type PointMap = std::collections::HashMap<String, f64>;
