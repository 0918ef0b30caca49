//! Background worker that owns an [`Orchestrator`].
//!
//! Events are handled one at a time in arrival order, so no two decisions
//! ever interleave. The kill flag is shared with every [`EngineHandle`]
//! and checked before each event, which lets a kill pre-empt work already
//! queued behind it.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use tracing::{debug, info};

use crate::PointMap;
use crate::control::{Actuator, EngineStatus, KillSwitch, Orchestrator};
use crate::error::ServiceError;
use crate::time::Timestamp;

/// Input accepted by the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Telemetry {
        device: String,
        now: Timestamp,
        points: PointMap,
    },
    Power {
        now: Timestamp,
        power: f64,
    },
    Kill {
        now: Timestamp,
    },
    Shutdown,
}

impl Event {
    fn timestamp(&self) -> Option<Timestamp> {
        match self {
            Event::Telemetry { now, .. } | Event::Power { now, .. } | Event::Kill { now } => Some(*now),
            Event::Shutdown => None,
        }
    }
}

/// Cloneable sender side of the worker queue.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    events: Sender<Event>,
    kill: KillSwitch,
}

impl EngineHandle {
    /// Queues a device publish.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Stopped`] once the worker has exited.
    pub fn telemetry(&self, device: &str, now: Timestamp, points: PointMap) -> Result<(), ServiceError> {
        self.send(Event::Telemetry {
            device: device.to_string(),
            now,
            points,
        })
    }

    /// Queues a whole-building power sample.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Stopped`] once the worker has exited.
    pub fn power(&self, now: Timestamp, power: f64) -> Result<(), ServiceError> {
        self.send(Event::Power { now, power })
    }

    /// Raises the kill flag at once, then queues the kill so the worker
    /// acts on it even while idle.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Stopped`] once the worker has exited.
    pub fn kill(&self, now: Timestamp) -> Result<(), ServiceError> {
        self.kill.raise();
        self.send(Event::Kill { now })
    }

    pub fn is_killed(&self) -> bool {
        self.kill.is_raised()
    }

    fn send(&self, event: Event) -> Result<(), ServiceError> {
        self.events.send(event).map_err(|_| ServiceError::Stopped)
    }
}

/// A running engine worker.
pub struct EngineService<A: Actuator + Send + 'static> {
    handle: EngineHandle,
    statuses: Receiver<EngineStatus>,
    worker: JoinHandle<Orchestrator<A>>,
}

impl<A: Actuator + Send + 'static> EngineService<A> {
    /// Moves `orchestrator` onto a dedicated thread.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Spawn`] if the thread cannot be started.
    pub fn spawn(orchestrator: Orchestrator<A>) -> Result<Self, ServiceError> {
        let (events, inbox) = mpsc::channel();
        let (outbox, statuses) = mpsc::channel();
        let kill = orchestrator.kill_switch();
        let worker = thread::Builder::new()
            .name("ilc-engine".into())
            .spawn(move || run(orchestrator, inbox, outbox))?;
        Ok(Self {
            handle: EngineHandle { events, kill },
            statuses,
            worker,
        })
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Statuses published after each power sample, in order.
    pub fn statuses(&self) -> &Receiver<EngineStatus> {
        &self.statuses
    }

    /// Drains the queue, stops the worker and hands the engine back.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Panicked`] if the worker thread panicked.
    pub fn shutdown(self) -> Result<Orchestrator<A>, ServiceError> {
        // The worker may already be gone; joining reports how it ended.
        let _ = self.handle.send(Event::Shutdown);
        self.worker.join().map_err(|_| ServiceError::Panicked)
    }
}

fn run<A: Actuator>(
    mut engine: Orchestrator<A>,
    inbox: Receiver<Event>,
    outbox: Sender<EngineStatus>,
) -> Orchestrator<A> {
    let kill = engine.kill_switch();
    let mut last_seen = Timestamp::from_millis(0);

    for event in inbox {
        if let Some(now) = event.timestamp() {
            last_seen = last_seen.max(now);
        }
        if kill.is_raised() {
            engine.kill(last_seen);
        }
        match event {
            Event::Telemetry { device, now, points } => {
                if let Some(status) = engine.on_telemetry(&device, now, &points) {
                    let _ = outbox.send(status);
                }
            }
            Event::Power { now, power } => {
                let _ = outbox.send(engine.on_power(now, power));
            }
            Event::Kill { now } => engine.kill(now),
            Event::Shutdown => {
                debug!("engine worker shutting down");
                break;
            }
        }
    }
    info!(phase = %engine.phase(), "engine worker stopped");
    engine
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScenarioConfig;
    use crate::control::Phase;
    use crate::control::mock::MockActuator;

    const SITE: &str = r#"
[engine]
demand_limit = 100.0
minimum_power_samples = 1
smoothing_alpha = 1.0

[[clusters]]
name = "hvac"
criteria_labels = ["rank"]
comparison_matrix = [[1.0]]

[[clusters.devices]]
name = "AHU1"
[[clusters.devices.commands]]
name = "fan"
device_status = { condition = "Status == 1" }
curtail = { point = "Speed", value = 40, load = 50, revert_priority = 1 }
[[clusters.devices.commands.criteria]]
name = "rank"
operation_type = "constant"
value = 1.0
"#;

    fn service() -> EngineService<MockActuator> {
        let cfg = ScenarioConfig::from_toml_str(SITE).expect("fixture parses");
        let actuator = MockActuator::default().with_point("AHU1", "Speed", 100.0);
        let engine = Orchestrator::from_config(&cfg, actuator).expect("engine builds");
        EngineService::spawn(engine).expect("worker starts")
    }

    fn on(points: &[(&str, f64)]) -> PointMap {
        points.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn events_processed_in_order() {
        let svc = service();
        let h = svc.handle();
        h.telemetry("AHU1", Timestamp::from_secs(0), on(&[("Status", 1.0)]))
            .expect("queued");
        h.power(Timestamp::from_secs(0), 90.0).expect("queued");
        h.power(Timestamp::from_secs(60), 130.0).expect("queued");

        let first = svc.statuses().recv().expect("status");
        let second = svc.statuses().recv().expect("status");
        assert_eq!(first.phase, Phase::Idle);
        assert_eq!(second.phase, Phase::Curtailing);

        let engine = svc.shutdown().expect("clean shutdown");
        assert_eq!(engine.actuator().value("AHU1", "Speed"), Some(40.0));
    }

    #[test]
    fn kill_preempts_queued_work() {
        let svc = service();
        let h = svc.handle();
        h.telemetry("AHU1", Timestamp::from_secs(0), on(&[("Status", 1.0)]))
            .expect("queued");
        h.power(Timestamp::from_secs(0), 130.0).expect("queued");
        assert_eq!(svc.statuses().recv().map(|s| s.phase), Ok(Phase::Curtailing));

        h.kill(Timestamp::from_secs(30)).expect("queued");
        assert!(h.is_killed());
        h.power(Timestamp::from_secs(60), 500.0).expect("queued");
        assert_eq!(svc.statuses().recv().map(|s| s.phase), Ok(Phase::Halted));

        let engine = svc.shutdown().expect("clean shutdown");
        assert_eq!(engine.phase(), Phase::Halted);
        assert!(engine.records().is_empty());
        assert_eq!(engine.actuator().value("AHU1", "Speed"), Some(100.0));
    }

    #[test]
    fn handle_reports_stopped_worker() {
        let svc = service();
        let h = svc.handle();
        let _ = svc.shutdown();
        assert!(matches!(
            h.power(Timestamp::from_secs(0), 1.0),
            Err(ServiceError::Stopped)
        ));
    }
}
