//! Contract with the external actuation service.

use std::time::Duration;

use tracing::warn;

use crate::error::ActuationError;
use crate::time::Timestamp;

/// Operations the engine needs from whatever drives the physical devices.
///
/// Every call carries the configured timeout. Implementations must return
/// [`ActuationError::Timeout`] instead of blocking past it.
pub trait Actuator {
    /// Requests exclusive control of `device` for `[start, end)`.
    fn reserve(
        &mut self,
        device: &str,
        start: Timestamp,
        end: Timestamp,
        timeout: Duration,
    ) -> Result<(), ActuationError>;

    fn read_point(&mut self, device: &str, point: &str, timeout: Duration) -> Result<f64, ActuationError>;

    fn set_point(
        &mut self,
        device: &str,
        point: &str,
        value: f64,
        timeout: Duration,
    ) -> Result<(), ActuationError>;

    /// Restores the device's own default for `point`.
    fn revert_point(&mut self, device: &str, point: &str, timeout: Duration) -> Result<(), ActuationError>;

    /// Gives up the reservation on `device`.
    fn release(&mut self, device: &str, timeout: Duration) -> Result<(), ActuationError>;
}

/// Runs `call`, retrying once on failure.
pub(crate) fn with_retry<T>(
    device: &str,
    operation: &'static str,
    mut call: impl FnMut() -> Result<T, ActuationError>,
) -> Result<T, ActuationError> {
    match call() {
        Ok(v) => Ok(v),
        Err(first) => {
            warn!(device, operation, error = %first, "actuation failed, retrying once");
            call()
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::{BTreeSet, HashMap};

    use super::*;

    /// In-memory actuator that logs every call.
    #[derive(Debug, Default)]
    pub struct MockActuator {
        pub points: HashMap<(String, String), f64>,
        pub reserved: BTreeSet<String>,
        pub refuse: BTreeSet<String>,
        /// Remaining failures per device for `set_point`.
        pub failing_sets: HashMap<String, u32>,
        pub log: Vec<String>,
    }

    impl MockActuator {
        pub fn with_point(mut self, device: &str, point: &str, value: f64) -> Self {
            self.points.insert((device.to_string(), point.to_string()), value);
            self
        }

        pub fn value(&self, device: &str, point: &str) -> Option<f64> {
            self.points.get(&(device.to_string(), point.to_string())).copied()
        }

        pub fn count(&self, prefix: &str) -> usize {
            self.log.iter().filter(|l| l.starts_with(prefix)).count()
        }
    }

    impl Actuator for MockActuator {
        fn reserve(
            &mut self,
            device: &str,
            _start: Timestamp,
            _end: Timestamp,
            _timeout: Duration,
        ) -> Result<(), ActuationError> {
            self.log.push(format!("reserve {device}"));
            if self.refuse.contains(device) {
                return Err(ActuationError::Rejected {
                    device: device.to_string(),
                    operation: "reserve",
                    reason: "busy".into(),
                });
            }
            self.reserved.insert(device.to_string());
            Ok(())
        }

        fn read_point(&mut self, device: &str, point: &str, _timeout: Duration) -> Result<f64, ActuationError> {
            self.log.push(format!("read {device}/{point}"));
            self.value(device, point)
                .ok_or_else(|| ActuationError::Unavailable(format!("{device}/{point}")))
        }

        fn set_point(
            &mut self,
            device: &str,
            point: &str,
            value: f64,
            _timeout: Duration,
        ) -> Result<(), ActuationError> {
            self.log.push(format!("set {device}/{point}={value}"));
            if let Some(left) = self.failing_sets.get_mut(device) {
                if *left > 0 {
                    *left -= 1;
                    return Err(ActuationError::Timeout {
                        device: device.to_string(),
                        operation: "set_point",
                    });
                }
            }
            self.points.insert((device.to_string(), point.to_string()), value);
            Ok(())
        }

        fn revert_point(&mut self, device: &str, point: &str, _timeout: Duration) -> Result<(), ActuationError> {
            self.log.push(format!("revert {device}/{point}"));
            Ok(())
        }

        fn release(&mut self, device: &str, _timeout: Duration) -> Result<(), ActuationError> {
            self.log.push(format!("release {device}"));
            self.reserved.remove(device);
            Ok(())
        }
    }
}
