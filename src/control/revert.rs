//! Bookkeeping for what to restore when curtailments are released.
//!
//! Records are kept in curtailment order. Records on the same device are
//! also indexed by revert priority, so releasing a device curtailed by
//! several commands restores the lowest-priority record's prior value first.

use std::collections::{BTreeMap, BTreeSet};

use crate::time::Timestamp;

/// One curtailed command and the value it displaced.
#[derive(Debug, Clone, PartialEq)]
pub struct CurtailmentRecord {
    pub id: u64,
    pub device: String,
    pub command: String,
    pub point: String,
    pub prior_value: f64,
    pub revert_priority: Option<u32>,
    pub curtailed_at: Timestamp,
    /// Estimated reduction credited when curtailed.
    pub load: f64,
    /// A revert of this record already failed once.
    pub retry_pending: bool,
}

/// What to send to the device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RevertAction {
    /// Write the recorded value.
    Restore(f64),
    /// No priority was configured; let the device restore its default.
    RevertPoint,
}

/// A revert worked out but not yet applied.
#[derive(Debug, Clone, PartialEq)]
pub struct RevertPlan {
    pub id: u64,
    pub device: String,
    pub point: String,
    pub action: RevertAction,
    /// Record that inherits the reverted record's value and priority.
    inherit: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct RevertManager {
    records: Vec<CurtailmentRecord>,
    by_device: BTreeMap<String, BTreeSet<(Option<u32>, u64)>>,
    next_id: u64,
}

impl RevertManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a record and returns its id.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &mut self,
        device: &str,
        command: &str,
        point: &str,
        prior_value: f64,
        revert_priority: Option<u32>,
        curtailed_at: Timestamp,
        load: f64,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.by_device
            .entry(device.to_string())
            .or_default()
            .insert((revert_priority, id));
        self.records.push(CurtailmentRecord {
            id,
            device: device.to_string(),
            command: command.to_string(),
            point: point.to_string(),
            prior_value,
            revert_priority,
            curtailed_at,
            load,
            retry_pending: false,
        });
        id
    }

    /// Active records in curtailment order.
    pub fn records(&self) -> &[CurtailmentRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&CurtailmentRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn is_curtailed(&self, device: &str, command: &str) -> bool {
        self.records
            .iter()
            .any(|r| r.device == device && r.command == command)
    }

    pub fn total_load(&self) -> f64 {
        self.records.iter().map(|r| r.load).sum()
    }

    /// Ids of the first `n` records in curtailment order.
    pub fn oldest(&self, n: usize) -> Vec<u64> {
        self.records.iter().take(n).map(|r| r.id).collect()
    }

    /// Works out the revert for `id` without changing bookkeeping.
    ///
    /// With no revert priority the device default is restored. When the
    /// device has a single record its prior value is restored. Otherwise the
    /// lowest-priority record on the device supplies the value, and inherits
    /// the reverted record's value and priority once committed.
    pub fn plan(&self, id: u64) -> Option<RevertPlan> {
        let record = self.get(id)?;
        let mut plan = RevertPlan {
            id,
            device: record.device.clone(),
            point: record.point.clone(),
            action: RevertAction::Restore(record.prior_value),
            inherit: None,
        };
        if record.revert_priority.is_none() {
            plan.action = RevertAction::RevertPoint;
            return Some(plan);
        }

        let Some(entries) = self.by_device.get(&record.device) else {
            return Some(plan);
        };
        if entries.len() <= 1 {
            return Some(plan);
        }
        if let Some(&(_, lowest)) = entries.first() {
            if lowest != id {
                let donor = self.get(lowest)?;
                plan.action = RevertAction::Restore(donor.prior_value);
                plan.inherit = Some(lowest);
            }
        }
        Some(plan)
    }

    /// Applies a plan after the device accepted it and returns the
    /// removed record.
    pub fn commit(&mut self, plan: &RevertPlan) -> Option<CurtailmentRecord> {
        let idx = self.records.iter().position(|r| r.id == plan.id)?;
        let record = self.records.remove(idx);
        if let Some(entries) = self.by_device.get_mut(&record.device) {
            entries.remove(&(record.revert_priority, record.id));
        }

        if let Some(heir_id) = plan.inherit {
            if let Some(heir) = self.records.iter_mut().find(|r| r.id == heir_id) {
                if let Some(entries) = self.by_device.get_mut(&record.device) {
                    entries.remove(&(heir.revert_priority, heir.id));
                    entries.insert((record.revert_priority, heir.id));
                }
                heir.prior_value = record.prior_value;
                heir.revert_priority = record.revert_priority;
            }
        }

        if self.by_device.get(&record.device).is_some_and(BTreeSet::is_empty) {
            self.by_device.remove(&record.device);
        }
        Some(record)
    }

    /// Notes a failed revert. Returns `true` if the record had already
    /// failed once, meaning the caller should give up on it.
    pub fn mark_failed(&mut self, id: u64) -> bool {
        match self.records.iter_mut().find(|r| r.id == id) {
            Some(r) if r.retry_pending => true,
            Some(r) => {
                r.retry_pending = true;
                false
            }
            None => true,
        }
    }

    /// Drops a record without reverting it.
    pub fn discard(&mut self, id: u64) -> Option<CurtailmentRecord> {
        let idx = self.records.iter().position(|r| r.id == id)?;
        let record = self.records.remove(idx);
        if let Some(entries) = self.by_device.get_mut(&record.device) {
            entries.remove(&(record.revert_priority, record.id));
            if entries.is_empty() {
                self.by_device.remove(&record.device);
            }
        }
        Some(record)
    }
}
