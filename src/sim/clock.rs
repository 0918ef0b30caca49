use crate::time::Timestamp;

/// A replay clock that ticks a fixed number of evenly spaced steps.
///
/// # Examples
///
/// ```
/// use ilc_engine::sim::clock::Clock;
/// use ilc_engine::time::Timestamp;
///
/// let mut clock = Clock::new(3, 60);
/// let mut seen = Vec::new();
///
/// clock.run(|step, now| seen.push((step, now)));
/// assert_eq!(seen[2], (2, Timestamp::from_secs(120)));
/// ```
pub struct Clock {
    /// Next step to hand out
    current: usize,
    /// Total steps in the replay
    total: usize,
    /// Seconds between steps
    step_seconds: u64,
}

impl Clock {
    /// Creates a clock.
    ///
    /// # Arguments
    ///
    /// * `total` - Number of steps the clock will run
    /// * `step_seconds` - Spacing between consecutive steps
    pub fn new(total: usize, step_seconds: u64) -> Self {
        Self {
            current: 0,
            total,
            step_seconds,
        }
    }

    /// Timestamp of `step`.
    pub fn time_of(&self, step: usize) -> Timestamp {
        let secs = (step as u64).saturating_mul(self.step_seconds);
        Timestamp::from_secs(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
    }

    /// Advances one step.
    ///
    /// # Returns
    ///
    /// * `Some((step, now))` - The step taken and its timestamp
    /// * `None` - If every step has been taken
    pub fn tick(&mut self) -> Option<(usize, Timestamp)> {
        if self.current < self.total {
            let step = self.current;
            self.current += 1;
            Some((step, self.time_of(step)))
        } else {
            None
        }
    }

    /// Runs `f` for each remaining step.
    pub fn run(&mut self, mut f: impl FnMut(usize, Timestamp)) {
        while let Some((step, now)) = self.tick() {
            f(step, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_spacing() {
        let mut clock = Clock::new(2, 30);
        assert_eq!(clock.tick(), Some((0, Timestamp::from_secs(0))));
        assert_eq!(clock.tick(), Some((1, Timestamp::from_secs(30))));
        assert_eq!(clock.tick(), None);
    }

    #[test]
    fn empty_clock() {
        let mut clock = Clock::new(0, 60);
        let mut was_called = false;
        clock.run(|_, _| was_called = true);
        assert!(!was_called);
    }
}
