//! Building power smoothing.

use std::collections::VecDeque;
use std::time::Duration;

use crate::time::Timestamp;

/// Windowed raw buffer plus an exponential moving average.
///
/// Only positive readings enter the window. Every reading, positive or
/// not, feeds the average.
#[derive(Debug, Clone)]
pub struct PowerSmoother {
    window: Duration,
    alpha: f64,
    samples: VecDeque<(Timestamp, f64)>,
    smoothed: Option<f64>,
}

impl PowerSmoother {
    pub fn new(window: Duration, alpha: f64) -> Self {
        Self {
            window,
            alpha,
            samples: VecDeque::new(),
            smoothed: None,
        }
    }

    pub fn push(&mut self, now: Timestamp, power: f64) {
        if power > 0.0 {
            self.samples.push_back((now, power));
            while self.samples.len() > 1 && self.span() >= self.window {
                self.samples.pop_front();
            }
        }
        let previous = self.smoothed.unwrap_or(power);
        self.smoothed = Some(previous * (1.0 - self.alpha) + power * self.alpha);
    }

    fn span(&self) -> Duration {
        match (self.samples.front(), self.samples.back()) {
            (Some(first), Some(last)) => {
                Duration::from_secs_f64(last.0.seconds_since(first.0).max(0.0))
            }
            _ => Duration::ZERO,
        }
    }

    /// Exponentially smoothed power; `None` before the first sample.
    pub fn smoothed(&self) -> Option<f64> {
        self.smoothed
    }

    /// Plain mean over the trimmed window, for diagnostics. Samples older
    /// than the window no longer count.
    pub fn window_average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|(_, p)| p).sum::<f64>() / self.samples.len() as f64
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}
