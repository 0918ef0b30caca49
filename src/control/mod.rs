//! Curtailment orchestration.
//!
//! [`Orchestrator`] is the control loop's state machine. It consumes
//! telemetry and power samples, decides when to curtail, confirm and
//! release, and drives an [`Actuator`]. Every input carries its own
//! timestamp, so the same sequence of events always produces the same
//! decisions.
//!
//! ```text
//!  Idle --power > limit--> Curtailing --curtail_end--> Releasing --all reverted--> Break
//!   ^                                                                               |
//!   +---------------------------------break_end-------------------------------------+
//! ```
//!
//! A kill switch moves any phase to [`Phase::Halted`] after reverting
//! everything.

mod actuator;
mod revert;
mod smoothing;
mod state;
mod target;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

pub use actuator::Actuator;
pub use revert::{CurtailmentRecord, RevertAction, RevertManager, RevertPlan};
pub use smoothing::PowerSmoother;
pub use state::{ApplicationState, CurtailedCommand, EngineStatus, Phase, StaggerPlan};
pub use target::{DemandSchedule, DemandTarget, LimitUpdate};

use actuator::with_retry;

#[cfg(test)]
pub(crate) use actuator::mock;

use crate::PointMap;
use crate::cluster::ClusterRegistry;
use crate::config::{EngineSettings, PointAddress, ScenarioConfig};
use crate::criteria::MapperTables;
use crate::device::CurtailmentSetting;
use crate::error::{ActuationError, ConfigError, CurtailmentError};
use crate::expr::normalize_point_name;
use crate::time::{Timestamp, hours, minutes};

/// Shared flag that stops the engine.
///
/// Cloned handles observe the same flag; once raised it stays raised.
#[derive(Debug, Clone, Default)]
pub struct KillSwitch(Arc<AtomicBool>);

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Durations derived once from [`EngineSettings`].
#[derive(Debug, Clone)]
struct Timing {
    curtail: Duration,
    confirm: Duration,
    cool_down: Duration,
    reset: Duration,
    reservation: Duration,
    actuation_timeout: Duration,
    /// `(minimum spacing, window)` when staggered release is usable.
    stagger: Option<(Duration, Duration)>,
    minimum_samples: usize,
}

impl Timing {
    fn from_settings(settings: &EngineSettings, device_count: usize) -> Self {
        let curtail = minutes(settings.curtailment_time);
        let confirm = minutes(settings.curtailment_confirm);
        let cool_down = minutes(settings.curtailment_break);

        let stagger = if settings.stagger_release {
            let min_window = confirm + Duration::from_secs(2);
            let total = minutes(settings.stagger_window.unwrap_or(settings.curtailment_break));
            match total.checked_sub(min_window) {
                Some(window) if window >= min_window => Some((min_window, window)),
                _ => {
                    warn!(
                        ?total,
                        ?min_window,
                        "stagger window too short for the confirm interval, releasing all at once"
                    );
                    None
                }
            }
        } else {
            None
        };

        let longest_episode = curtail * 2 * u32::try_from(device_count.max(1)).unwrap_or(u32::MAX);
        Self {
            curtail,
            confirm,
            cool_down,
            reset: hours(settings.reset_curtail_count_time),
            reservation: longest_episode + minutes(settings.actuator_schedule_buffer),
            actuation_timeout: Duration::from_secs_f64(settings.actuation_timeout.max(0.0)),
            stagger,
            minimum_samples: settings.minimum_power_samples,
        }
    }
}

/// Running totals, reported alongside replay results.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineCounters {
    pub episodes: usize,
    pub curtailments: usize,
    pub releases: usize,
    pub contingency_releases: usize,
    pub actuation_failures: usize,
    pub abandoned_reverts: usize,
    pub quota_resets: usize,
}

/// The curtailment state machine.
pub struct Orchestrator<A: Actuator> {
    registry: ClusterRegistry,
    actuator: A,
    timing: Timing,
    power_meter: PointAddress,
    kill_point: Option<PointAddress>,
    smoother: PowerSmoother,
    schedule: DemandSchedule,
    base_limit: Option<f64>,
    demand_limit: Option<f64>,
    phase: Phase,
    curtail_end: Option<Timestamp>,
    break_end: Option<Timestamp>,
    next_confirm: Option<Timestamp>,
    next_release: Option<Timestamp>,
    reset_at: Option<Timestamp>,
    stagger: Option<StaggerPlan>,
    records: RevertManager,
    reserved: BTreeSet<String>,
    /// Points whose revert was given up on; restored to device defaults
    /// when the episode closes.
    abandoned: Vec<(String, String)>,
    kill: KillSwitch,
    counters: EngineCounters,
    last_status: Option<EngineStatus>,
}

impl<A: Actuator> Orchestrator<A> {
    /// Creates an engine over an already-built registry.
    ///
    /// # Errors
    ///
    /// Returns the first `ConfigError` found in `settings`.
    pub fn new(settings: &EngineSettings, registry: ClusterRegistry, actuator: A) -> Result<Self, ConfigError> {
        if let Some(first) = settings.validate().into_iter().next() {
            return Err(first);
        }
        let device_count = registry.devices().count();
        let normalize = |a: &PointAddress| PointAddress {
            device: a.device.clone(),
            point: normalize_point_name(&a.point),
        };
        Ok(Self {
            timing: Timing::from_settings(settings, device_count),
            power_meter: normalize(&settings.power_meter),
            kill_point: settings.kill_switch.as_ref().map(normalize),
            smoother: PowerSmoother::new(
                minutes(settings.average_building_power_window),
                settings.smoothing_alpha,
            ),
            schedule: DemandSchedule::from_config(&settings.demand_targets),
            base_limit: settings.demand_limit,
            demand_limit: settings.demand_limit,
            registry,
            actuator,
            phase: Phase::Idle,
            curtail_end: None,
            break_end: None,
            next_confirm: None,
            next_release: None,
            reset_at: None,
            stagger: None,
            records: RevertManager::new(),
            reserved: BTreeSet::new(),
            abandoned: Vec::new(),
            kill: KillSwitch::new(),
            counters: EngineCounters::default(),
            last_status: None,
        })
    }

    /// Builds clusters, mapper tables and the engine from a scenario.
    ///
    /// # Errors
    ///
    /// Returns the first structural `ConfigError`: a bad matrix, an
    /// unparseable expression, a missing criterion parameter or an
    /// undefined mapper entry.
    pub fn from_config(config: &ScenarioConfig, actuator: A) -> Result<Self, ConfigError> {
        let mappers = MapperTables::from_config(&config.mappers);
        let registry = ClusterRegistry::from_config(&config.clusters, &mappers, &config.engine)?;
        Self::new(&config.engine, registry, actuator)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn registry(&self) -> &ClusterRegistry {
        &self.registry
    }

    pub fn records(&self) -> &RevertManager {
        &self.records
    }

    pub fn actuator(&self) -> &A {
        &self.actuator
    }

    pub fn actuator_mut(&mut self) -> &mut A {
        &mut self.actuator
    }

    pub fn counters(&self) -> &EngineCounters {
        &self.counters
    }

    pub fn demand_limit(&self) -> Option<f64> {
        self.demand_limit
    }

    /// Replaces the static limit (and the current one if no target is active).
    pub fn set_demand_limit(&mut self, limit: Option<f64>) {
        self.base_limit = limit;
        self.demand_limit = limit;
    }

    /// Adds a scheduled demand target.
    pub fn schedule_target(&mut self, target: DemandTarget) {
        self.schedule.add(target);
    }

    pub fn stagger_plan(&self) -> Option<StaggerPlan> {
        self.stagger
    }

    pub fn reserved_devices(&self) -> impl Iterator<Item = &str> {
        self.reserved.iter().map(String::as_str)
    }

    /// A handle that halts the engine when raised, checked before every
    /// event and between candidates.
    pub fn kill_switch(&self) -> KillSwitch {
        self.kill.clone()
    }

    pub fn last_status(&self) -> Option<&EngineStatus> {
        self.last_status.as_ref()
    }

    /// Takes a telemetry publish from `device`.
    ///
    /// Publishes from the power meter are treated as power samples and
    /// return the resulting status. A truthy kill switch point halts the
    /// engine.
    pub fn on_telemetry(&mut self, device: &str, now: Timestamp, points: &PointMap) -> Option<EngineStatus> {
        if let Some(kill) = &self.kill_point {
            if kill.device == device && lookup(points, &kill.point).is_some_and(|v| v != 0.0) {
                info!(device, "kill signal received");
                self.kill(now);
                return None;
            }
        }
        if self.phase == Phase::Halted {
            return None;
        }
        if device == self.power_meter.device {
            return match lookup(points, &self.power_meter.point) {
                Some(power) => Some(self.on_power(now, power)),
                None => {
                    warn!(device, point = %self.power_meter.point, "meter publish without power point");
                    None
                }
            };
        }
        if !self.registry.ingest(device, now, points) {
            debug!(device, "telemetry for unmanaged device ignored");
        }
        None
    }

    /// Takes one whole-building power sample and advances the state machine.
    pub fn on_power(&mut self, now: Timestamp, power: f64) -> EngineStatus {
        if self.kill.is_raised() && self.phase != Phase::Halted {
            self.kill(now);
        }
        if self.phase == Phase::Halted {
            return self.publish(now, power, "halted by kill signal".into());
        }

        match self.schedule.check(now) {
            LimitUpdate::Set(target) if self.demand_limit != Some(target) => {
                info!(target, "demand target active");
                self.demand_limit = Some(target);
            }
            LimitUpdate::Cleared => {
                info!(limit = ?self.base_limit, "demand target ended");
                self.demand_limit = self.base_limit;
            }
            _ => {}
        }

        self.smoother.push(now, power);
        let smoothed = self.smoother.smoothed().unwrap_or(power);

        if self.reset_at.is_some_and(|at| now >= at) {
            info!("resetting daily curtailment counts");
            self.registry.reset_counts();
            self.reset_at = None;
            self.counters.quota_resets += 1;
        }

        let message = self.step(now, smoothed);
        self.publish(now, power, message)
    }

    fn step(&mut self, now: Timestamp, power: f64) -> String {
        match self.phase {
            Phase::Curtailing => {
                if self.curtail_end.is_some_and(|end| now >= end) {
                    self.begin_release(now);
                    return format!("curtailment ended, {} still curtailed", self.records.len());
                }
                if self.next_confirm.is_some_and(|at| now >= at) {
                    return self.confirm(now, power);
                }
                return format!("holding {} curtailed", self.records.len());
            }
            Phase::Releasing => {
                self.release_step(now);
                return format!("releasing, {} still curtailed", self.records.len());
            }
            Phase::Break => {
                if let Some(end) = self.break_end.filter(|end| now < *end) {
                    return format!("break until {end}");
                }
                info!("break over");
                self.phase = Phase::Idle;
                self.break_end = None;
            }
            Phase::Idle | Phase::Halted => {}
        }

        if self.smoother.sample_count() < self.timing.minimum_samples {
            return format!(
                "collecting power samples ({}/{})",
                self.smoother.sample_count(),
                self.timing.minimum_samples
            );
        }
        self.check_load(now, power)
    }

    fn check_load(&mut self, now: Timestamp, power: f64) -> String {
        let Some(limit) = self.demand_limit else {
            return format!("no demand limit set, load {power:.1}");
        };
        if power <= limit {
            return format!("load {power:.1} is below limit {limit:.1}");
        }

        info!(power, limit, "demand limit exceeded");
        let curtailed = self.curtail(now, power - limit);
        if curtailed == 0 {
            self.release_reservations();
            return format!("load {power:.1} exceeds limit {limit:.1}, nothing to curtail");
        }

        let curtail_end = self.hold_from(now);
        self.phase = Phase::Curtailing;
        self.next_confirm = Some(now + self.timing.confirm);
        self.counters.episodes += 1;
        info!(curtailed, until = %curtail_end, "curtailment started");
        format!("load {power:.1} exceeds limit {limit:.1}, curtailed {curtailed}")
    }

    fn confirm(&mut self, now: Timestamp, power: f64) -> String {
        self.next_confirm = Some(now + self.timing.confirm);
        match self.demand_limit {
            Some(limit) if power > limit => {
                let added = self.curtail(now, power - limit);
                info!(power, limit, added, "demand goal not met");
                if added > 0 {
                    let curtail_end = self.hold_from(now);
                    debug!(until = %curtail_end, "curtailment extended");
                }
                format!("load {power:.1} still exceeds limit {limit:.1}, curtailed {added} more")
            }
            _ => {
                info!(power, "demand goal met");
                format!("load {power:.1} within limit")
            }
        }
    }

    /// Holds the episode for a full curtailment time from `now`, moving the
    /// break and the pending count reset with it.
    fn hold_from(&mut self, now: Timestamp) -> Timestamp {
        let curtail_end = now + self.timing.curtail;
        self.curtail_end = Some(curtail_end);
        self.break_end = Some(curtail_end + self.timing.cool_down);
        self.reset_at = Some(curtail_end + self.timing.reset);
        curtail_end
    }

    /// Curtails ranked candidates until the estimated reduction covers
    /// `need`. Returns how many commands were curtailed.
    fn curtail(&mut self, now: Timestamp, need: f64) -> usize {
        let order = self.registry.score_order();
        if order.is_empty() {
            info!("no eligible commands");
            return 0;
        }

        let mut refused: BTreeSet<String> = BTreeSet::new();
        let mut reduction = 0.0;
        let mut count = 0;

        for candidate in order {
            if self.kill.is_raised() {
                warn!("kill signal raised during curtailment");
                break;
            }
            if refused.contains(&candidate.device)
                || self.records.is_curtailed(&candidate.device, &candidate.command)
            {
                continue;
            }
            let Some(device) = self.registry.device(&candidate.device) else {
                continue;
            };
            let Some(command) = device.command(&candidate.command) else {
                continue;
            };
            if command.quota_exhausted() {
                debug!(device = %candidate.device, command = %candidate.command, "daily quota exhausted");
                continue;
            }
            let setting = command.active_setting(device.points()).clone();

            if !self.ensure_reserved(&candidate.device, now) {
                refused.insert(candidate.device.clone());
                continue;
            }

            match self.actuate(&candidate.device, &setting) {
                Ok((prior, value, load)) => {
                    self.records.record(
                        &candidate.device,
                        &candidate.command,
                        &setting.point,
                        prior,
                        setting.revert_priority,
                        now,
                        load,
                    );
                    if let Some(command) = self
                        .registry
                        .device_mut(&candidate.device)
                        .and_then(|d| d.command_mut(&candidate.command))
                    {
                        command.mark_curtailed();
                    }
                    self.counters.curtailments += 1;
                    reduction += load;
                    count += 1;
                    info!(
                        device = %candidate.device,
                        command = %candidate.command,
                        point = %setting.point,
                        prior,
                        value,
                        load,
                        score = candidate.score,
                        "curtailed"
                    );
                    if reduction >= need {
                        break;
                    }
                }
                Err(e) => {
                    self.counters.actuation_failures += 1;
                    warn!(
                        device = %candidate.device,
                        command = %candidate.command,
                        point = %setting.point,
                        error = %e,
                        "curtailment skipped"
                    );
                }
            }
        }
        debug!(count, reduction, need, "curtailment pass complete");
        count
    }

    fn ensure_reserved(&mut self, device: &str, now: Timestamp) -> bool {
        if self.reserved.contains(device) {
            return true;
        }
        let end = now + self.timing.reservation;
        let timeout = self.timing.actuation_timeout;
        let actuator = &mut self.actuator;
        match with_retry(device, "reserve", || actuator.reserve(device, now, end, timeout)) {
            Ok(()) => {
                self.reserved.insert(device.to_string());
                true
            }
            Err(e) => {
                self.counters.actuation_failures += 1;
                warn!(device, error = %e, "reservation refused, skipping device");
                false
            }
        }
    }

    /// Reads what the setting needs, writes the curtailed value, and
    /// returns `(prior value, written value, estimated load)`.
    fn actuate(&mut self, device: &str, setting: &CurtailmentSetting) -> Result<(f64, f64, f64), CurtailmentError> {
        let timeout = self.timing.actuation_timeout;
        let actuator = &mut self.actuator;
        let mut needed = setting.required_points();
        needed.insert(setting.point.clone());

        let mut read = PointMap::new();
        for point in &needed {
            let value = with_retry(device, "read_point", || actuator.read_point(device, point, timeout))?;
            read.insert(point.clone(), value);
        }
        let prior = read
            .get(&setting.point)
            .copied()
            .ok_or_else(|| ActuationError::Unavailable(format!("{device}/{}", setting.point)))?;
        let value = setting.curtailed_value(&read)?;
        let load = setting.load_estimate(&read)?;

        with_retry(device, "set_point", || actuator.set_point(device, &setting.point, value, timeout))?;
        Ok((prior, value, load))
    }

    fn begin_release(&mut self, now: Timestamp) {
        self.phase = Phase::Releasing;
        self.next_confirm = None;
        self.next_release = None;
        let count = self.records.len();
        self.stagger = match self.timing.stagger {
            Some((min_window, window)) if count > 0 => {
                let plan = StaggerPlan::compute(count, min_window, window);
                info!(count, group_size = plan.group_size, interval = ?plan.interval, "staggered release");
                Some(plan)
            }
            _ => None,
        };
        self.release_step(now);
    }

    fn release_step(&mut self, now: Timestamp) {
        if !self.records.is_empty() {
            let contingency = self.break_end.is_some_and(|end| now >= end);
            match self.stagger {
                Some(plan) if !contingency => {
                    if self.next_release.is_some_and(|at| now < at) {
                        return;
                    }
                    self.revert_records(self.records.oldest(plan.group_size), false);
                    self.next_release = Some(now + plan.interval);
                }
                Some(_) => {
                    warn!(remaining = self.records.len(), "break reached before release finished, releasing all");
                    self.counters.contingency_releases += 1;
                    self.revert_records(self.records.oldest(self.records.len()), false);
                    self.stagger = None;
                }
                None => self.revert_records(self.records.oldest(self.records.len()), false),
            }
        }
        if self.records.is_empty() {
            self.finish_episode(now);
        }
    }

    /// Reverts the given records. A failed revert is kept for one later
    /// attempt unless `final_pass` is set; a second failure abandons it.
    fn revert_records(&mut self, ids: Vec<u64>, final_pass: bool) {
        let timeout = self.timing.actuation_timeout;
        for id in ids {
            let Some(plan) = self.records.plan(id) else {
                continue;
            };
            let actuator = &mut self.actuator;
            let attempt = || match plan.action {
                RevertAction::Restore(value) => actuator.set_point(&plan.device, &plan.point, value, timeout),
                RevertAction::RevertPoint => actuator.revert_point(&plan.device, &plan.point, timeout),
            };
            let result = if final_pass {
                with_retry(&plan.device, "revert", attempt)
            } else {
                let mut attempt = attempt;
                attempt()
            };

            match result {
                Ok(()) => {
                    if let Some(record) = self.records.commit(&plan) {
                        self.mark_released(&record);
                        self.counters.releases += 1;
                        info!(
                            device = %record.device,
                            command = %record.command,
                            point = %record.point,
                            action = ?plan.action,
                            "released"
                        );
                    }
                }
                Err(e) => {
                    self.counters.actuation_failures += 1;
                    if final_pass || self.records.mark_failed(id) {
                        warn!(device = %plan.device, point = %plan.point, error = %e, "revert abandoned");
                        if let Some(record) = self.records.discard(id) {
                            self.mark_released(&record);
                            self.abandoned.push((record.device, record.point));
                            self.counters.abandoned_reverts += 1;
                        }
                    } else {
                        warn!(device = %plan.device, point = %plan.point, error = %e, "revert failed, will retry");
                    }
                }
            }
        }
    }

    fn mark_released(&mut self, record: &CurtailmentRecord) {
        let still_curtailed = self.records.is_curtailed(&record.device, &record.command);
        if let Some(command) = self
            .registry
            .device_mut(&record.device)
            .and_then(|d| d.command_mut(&record.command))
        {
            if !still_curtailed {
                command.mark_released();
            }
        }
    }

    fn finish_episode(&mut self, now: Timestamp) {
        self.restore_abandoned();
        self.release_reservations();
        self.phase = Phase::Break;
        self.stagger = None;
        self.next_release = None;
        self.next_confirm = None;
        self.curtail_end = None;
        let reset_at = now + self.timing.reset;
        self.reset_at = Some(reset_at);
        debug!(%reset_at, "curtailment counts reset scheduled");
        info!(break_end = ?self.break_end.map(|t| t.to_string()), "curtailment episode complete");
    }

    fn restore_abandoned(&mut self) {
        let timeout = self.timing.actuation_timeout;
        for (device, point) in std::mem::take(&mut self.abandoned) {
            if let Err(e) = self.actuator.revert_point(&device, &point, timeout) {
                warn!(device = %device, point = %point, error = %e, "device default restore failed");
            }
        }
    }

    fn release_reservations(&mut self) {
        let timeout = self.timing.actuation_timeout;
        for device in std::mem::take(&mut self.reserved) {
            let actuator = &mut self.actuator;
            if let Err(e) = with_retry(&device, "release", || actuator.release(&device, timeout)) {
                warn!(device = %device, error = %e, "reservation release failed");
            }
        }
    }

    /// Reverts everything immediately and halts for good.
    pub fn kill(&mut self, now: Timestamp) {
        if self.phase == Phase::Halted {
            return;
        }
        warn!(at = %now, curtailed = self.records.len(), "kill switch: reverting all curtailments");
        self.kill.raise();
        self.revert_records(self.records.oldest(self.records.len()), true);
        self.restore_abandoned();
        self.release_reservations();
        self.phase = Phase::Halted;
        self.stagger = None;
        self.curtail_end = None;
        self.break_end = None;
        self.next_confirm = None;
        self.next_release = None;
        self.reset_at = None;
    }

    fn publish(&mut self, now: Timestamp, power: f64, message: String) -> EngineStatus {
        let curtailed = self
            .records
            .records()
            .iter()
            .map(|r| CurtailedCommand {
                device: r.device.clone(),
                command: r.command.clone(),
                point: r.point.clone(),
                prior_value: r.prior_value,
                load: r.load,
            })
            .collect();
        let application_state = match self.phase {
            Phase::Curtailing | Phase::Releasing => ApplicationState::Active,
            _ => ApplicationState::Inactive,
        };
        let status = EngineStatus {
            timestamp: now,
            phase: self.phase,
            application_state,
            power,
            average_power: self.smoother.window_average(),
            load_control_power: self.smoother.smoothed().unwrap_or(power),
            demand_limit: self.demand_limit,
            estimated_reduction: self.records.total_load(),
            curtailed,
            message,
        };
        debug!(at = %now, phase = %status.phase, message = %status.message, "tick");
        self.last_status = Some(status.clone());
        status
    }
}

fn lookup(points: &PointMap, point: &str) -> Option<f64> {
    points.get(point).copied().or_else(|| {
        points
            .iter()
            .find(|(k, _)| normalize_point_name(k) == point)
            .map(|(_, v)| *v)
    })
}
