//! Device clusters and the merged candidate ranking.

use std::collections::HashMap;

use tracing::debug;

use crate::PointMap;
use crate::ahp::{Candidate, CriteriaMatrix, rank};
use crate::config::{ClusterConfig, EngineSettings};
use crate::criteria::MapperTables;
use crate::device::{CURTAIL_COUNT, Device};
use crate::error::ConfigError;
use crate::time::Timestamp;

/// Devices sharing one comparison matrix and priority.
#[derive(Debug, Clone)]
pub struct Cluster {
    name: String,
    priority: f64,
    matrix: CriteriaMatrix,
    devices: Vec<Device>,
}

impl Cluster {
    /// Builds the matrix and devices, and checks that every command can
    /// supply a score for every label.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` for an invalid matrix, a device error, or a
    /// label some command has no criterion for.
    pub fn from_config(
        cfg: &ClusterConfig,
        mappers: &MapperTables,
        settings: &EngineSettings,
    ) -> Result<Self, ConfigError> {
        if cfg.priority <= 0.0 || !cfg.priority.is_finite() {
            return Err(ConfigError::new("priority", "must be > 0"));
        }
        let matrix = CriteriaMatrix::new(
            &cfg.criteria_labels,
            &cfg.comparison_matrix,
            settings.matrix_tolerance,
            settings.max_consistency_ratio,
        )?;

        let mut devices = Vec::with_capacity(cfg.devices.len());
        for (di, device_cfg) in cfg.devices.iter().enumerate() {
            let scope = format!("devices[{di}]");
            let device = Device::from_config(device_cfg, mappers).map_err(|e| e.within(&scope))?;
            for (ci, command) in device.commands().iter().enumerate() {
                let known: Vec<&str> = command.criteria().names().collect();
                if let Some(label) = matrix
                    .labels()
                    .iter()
                    .find(|l| l.as_str() != CURTAIL_COUNT && !known.contains(&l.as_str()))
                {
                    return Err(ConfigError::new(
                        "criteria",
                        format!("no criterion named \"{label}\" for matrix label"),
                    )
                    .within(&format!("{scope}.commands[{ci}]")));
                }
            }
            devices.push(device);
        }

        Ok(Self {
            name: cfg.name.clone(),
            priority: cfg.priority,
            matrix,
            devices,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> f64 {
        self.priority
    }

    pub fn matrix(&self) -> &CriteriaMatrix {
        &self.matrix
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Scores every eligible command, in declaration order.
    pub fn candidates(&self) -> Vec<Candidate> {
        let mut out = Vec::new();
        for device in &self.devices {
            for command in device.on_commands() {
                let Some(scores) = device.evaluate_command(command) else {
                    continue;
                };
                let row = self.matrix.input_row(&scores);
                let score = self.matrix.composite(&row, self.priority);
                debug!(
                    cluster = %self.name,
                    device = %device.name(),
                    command,
                    ?row,
                    score,
                    "scored candidate"
                );
                out.push(Candidate {
                    device: device.name().to_string(),
                    command: command.to_string(),
                    score,
                });
            }
        }
        out
    }
}

/// Every cluster, with a device name index across them.
#[derive(Debug, Clone, Default)]
pub struct ClusterRegistry {
    clusters: Vec<Cluster>,
    index: HashMap<String, (usize, usize)>,
}

impl ClusterRegistry {
    /// # Errors
    ///
    /// Returns the first cluster's `ConfigError`, or an error if a device
    /// name appears in more than one place.
    pub fn from_config(
        clusters: &[ClusterConfig],
        mappers: &MapperTables,
        settings: &EngineSettings,
    ) -> Result<Self, ConfigError> {
        let mut registry = Self::default();
        for (ci, cfg) in clusters.iter().enumerate() {
            let scope = format!("clusters[{ci}]");
            let cluster = Cluster::from_config(cfg, mappers, settings).map_err(|e| e.within(&scope))?;
            registry.push(cluster).map_err(|e| e.within(&scope))?;
        }
        Ok(registry)
    }

    /// Adds a cluster.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if one of its devices is already registered.
    pub fn push(&mut self, cluster: Cluster) -> Result<(), ConfigError> {
        let ci = self.clusters.len();
        for (di, device) in cluster.devices.iter().enumerate() {
            if self.index.contains_key(device.name()) {
                return Err(ConfigError::new(
                    format!("devices[{di}].name"),
                    format!("device \"{}\" is defined more than once", device.name()),
                ));
            }
            self.index.insert(device.name().to_string(), (ci, di));
        }
        self.clusters.push(cluster);
        Ok(())
    }

    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.clusters.iter().flat_map(|c| c.devices.iter())
    }

    pub fn device(&self, name: &str) -> Option<&Device> {
        let (ci, di) = *self.index.get(name)?;
        self.clusters.get(ci)?.devices.get(di)
    }

    pub fn device_mut(&mut self, name: &str) -> Option<&mut Device> {
        let (ci, di) = *self.index.get(name)?;
        self.clusters.get_mut(ci)?.devices.get_mut(di)
    }

    /// Routes a telemetry publish. Returns `false` for an unknown device.
    pub fn ingest(&mut self, device: &str, now: Timestamp, points: &PointMap) -> bool {
        match self.device_mut(device) {
            Some(d) => {
                d.ingest(now, points);
                true
            }
            None => false,
        }
    }

    /// Ranked candidates across every cluster.
    pub fn score_order(&self) -> Vec<Candidate> {
        rank(self.clusters.iter().flat_map(Cluster::candidates).collect())
    }

    pub fn reset_counts(&mut self) {
        for cluster in &mut self.clusters {
            for device in &mut cluster.devices {
                device.reset_counts();
            }
        }
    }
}
