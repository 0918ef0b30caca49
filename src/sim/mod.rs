//! Replay harness: a simulated building, a clock, and KPIs over the run.

/// Replay clock for timestep management.
pub mod clock;
pub mod engine;
pub mod kpi;
/// Simulated building load and devices.
pub mod plant;
pub mod types;
