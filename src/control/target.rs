//! Scheduled demand targets.

use tracing::debug;

use crate::config::DemandTargetConfig;
use crate::time::Timestamp;

/// A target limit active over `[start, end)`.
#[derive(Debug, Clone, PartialEq)]
pub struct DemandTarget {
    pub id: String,
    pub start: Timestamp,
    pub end: Option<Timestamp>,
    pub target: f64,
}

impl DemandTarget {
    fn overlaps(&self, other: &DemandTarget) -> bool {
        let self_end_after = other.end.is_none_or(|end| self.start < end);
        let other_end_after = self.end.is_none_or(|end| other.start < end);
        self_end_after && other_end_after
    }
}

/// Pending targets; a newly added target replaces any it overlaps.
#[derive(Debug, Clone, Default)]
pub struct DemandSchedule {
    targets: Vec<DemandTarget>,
}

/// What the schedule says about the limit right now.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LimitUpdate {
    /// Nothing changed.
    Unchanged,
    /// A target is active.
    Set(f64),
    /// A target ended; the limit clears.
    Cleared,
}

impl DemandSchedule {
    pub fn from_config(targets: &[DemandTargetConfig]) -> Self {
        let mut schedule = Self::default();
        for (i, cfg) in targets.iter().enumerate() {
            schedule.add(DemandTarget {
                id: cfg.id.clone().unwrap_or_else(|| format!("target-{i}")),
                start: Timestamp::from_minutes(cfg.start),
                end: cfg.end.map(Timestamp::from_minutes),
                target: cfg.target,
            });
        }
        schedule
    }

    /// Adds `target`, dropping pending targets that share its id or
    /// overlap its window.
    pub fn add(&mut self, target: DemandTarget) {
        self.targets.retain(|existing| {
            let keep = existing.id != target.id && !existing.overlaps(&target);
            if !keep {
                debug!(replaced = %existing.id, by = %target.id, "demand target replaced");
            }
            keep
        });
        self.targets.push(target);
    }

    pub fn targets(&self) -> &[DemandTarget] {
        &self.targets
    }

    /// Applies the schedule at `now`. Expired targets are removed.
    pub fn check(&mut self, now: Timestamp) -> LimitUpdate {
        let mut update = LimitUpdate::Unchanged;
        self.targets.retain(|t| {
            if t.end.is_some_and(|end| now >= end) {
                update = LimitUpdate::Cleared;
                return false;
            }
            true
        });
        if let Some(active) = self.targets.iter().find(|t| t.start <= now) {
            update = LimitUpdate::Set(active.target);
        }
        update
    }
}
