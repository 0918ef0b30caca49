//! Compares a point against its own value some time ago.

use std::collections::VecDeque;
use std::time::Duration;

use crate::PointMap;
use crate::time::Timestamp;

/// How the historical delta is turned into a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// `|previous - current|`
    Direct,
    /// `1 / |previous - current|`
    Inverse,
}

impl Comparison {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "direct" => Some(Comparison::Direct),
            "inverse" => Some(Comparison::Inverse),
            _ => None,
        }
    }
}

/// Chronological sample buffer for one point.
///
/// Samples older than the one straddling `now - lookback` are dropped on
/// ingest, so the buffer stays bounded by the lookback span.
#[derive(Debug, Clone)]
pub struct HistoryCriterion {
    point: String,
    comparison: Comparison,
    lookback: Duration,
    samples: VecDeque<(Timestamp, f64)>,
    current: Option<(Timestamp, f64)>,
}

impl HistoryCriterion {
    pub fn new(point: impl Into<String>, comparison: Comparison, lookback: Duration) -> Self {
        Self {
            point: point.into(),
            comparison,
            lookback,
            samples: VecDeque::new(),
            current: None,
        }
    }

    pub fn point(&self) -> &str {
        &self.point
    }

    /// Appends the point's value if present. Samples older than the newest
    /// buffered one are ignored.
    pub fn ingest(&mut self, now: Timestamp, points: &PointMap) {
        let Some(&value) = points.get(&self.point) else {
            return;
        };
        if self.samples.back().is_some_and(|(t, _)| *t > now) {
            return;
        }
        self.samples.push_back((now, value));
        self.current = Some((now, value));

        let horizon = now - self.lookback;
        while self.samples.len() > 1 && self.samples[1].0 <= horizon {
            self.samples.pop_front();
        }
    }

    /// Raw score, or `fallback` until there is a current value and the
    /// buffer reaches back far enough.
    pub fn evaluate(&self, fallback: Option<f64>) -> Option<f64> {
        let Some((now, current)) = self.current else {
            return fallback;
        };
        let Some(previous) = self.value_at(now - self.lookback) else {
            return fallback;
        };
        let delta = (previous - current).abs();
        match self.comparison {
            Comparison::Direct => Some(delta),
            Comparison::Inverse => Some(1.0 / delta),
        }
    }

    /// Linear interpolation between the two samples straddling `target`.
    fn value_at(&self, target: Timestamp) -> Option<f64> {
        let first = self.samples.front()?;
        if first.0 > target {
            return None;
        }
        let post_idx = self.samples.iter().position(|(t, _)| *t >= target)?;
        let post = self.samples[post_idx];
        if post.0 == target {
            return Some(post.1);
        }
        let pre = *self.samples.get(post_idx.checked_sub(1)?)?;
        let fraction = target.seconds_since(pre.0) / post.0.seconds_since(pre.0);
        Some(pre.1 + (post.1 - pre.1) * fraction)
    }

    /// Drops all buffered state.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.current = None;
    }

    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.samples.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(point: &str, value: f64) -> PointMap {
        PointMap::from([(point.to_string(), value)])
    }

    fn feed(h: &mut HistoryCriterion, secs: i64, value: f64) {
        h.ingest(Timestamp::from_secs(secs), &sample("ZoneTemp", value));
    }

    #[test]
    fn returns_fallback_until_history_reaches_back() {
        let mut h = HistoryCriterion::new("ZoneTemp", Comparison::Direct, Duration::from_secs(600));
        assert_eq!(h.evaluate(Some(0.5)), Some(0.5));
        feed(&mut h, 0, 70.0);
        feed(&mut h, 300, 71.0);
        assert_eq!(h.evaluate(Some(0.5)), Some(0.5));
        feed(&mut h, 600, 73.0);
        assert_eq!(h.evaluate(Some(0.5)), Some(3.0));
    }

    #[test]
    fn interpolates_between_straddling_samples() {
        let mut h = HistoryCriterion::new("ZoneTemp", Comparison::Direct, Duration::from_secs(300));
        feed(&mut h, 0, 70.0);
        feed(&mut h, 200, 72.0);
        feed(&mut h, 400, 74.0);
        // now=400, target=100: halfway between 70.0 and 72.0.
        let score = h.evaluate(None).unwrap_or(f64::NAN);
        assert!((score - 3.0).abs() < 1e-9, "got {score}");
    }

    #[test]
    fn inverse_comparison() {
        let mut h = HistoryCriterion::new("ZoneTemp", Comparison::Inverse, Duration::from_secs(60));
        feed(&mut h, 0, 70.0);
        feed(&mut h, 60, 74.0);
        assert_eq!(h.evaluate(None), Some(0.25));
    }

    #[test]
    fn missing_point_is_skipped() {
        let mut h = HistoryCriterion::new("ZoneTemp", Comparison::Direct, Duration::from_secs(60));
        feed(&mut h, 0, 70.0);
        h.ingest(Timestamp::from_secs(30), &sample("Other", 1.0));
        feed(&mut h, 60, 71.0);
        assert_eq!(h.evaluate(None), Some(1.0));
    }

    #[test]
    fn buffer_is_pruned_to_lookback() {
        let mut h = HistoryCriterion::new("ZoneTemp", Comparison::Direct, Duration::from_secs(60));
        for i in 0..100 {
            feed(&mut h, i * 10, 70.0 + i as f64);
        }
        assert!(h.buffered() <= 8, "buffer grew to {}", h.buffered());
        assert_eq!(h.evaluate(None), Some(6.0));
    }

    #[test]
    fn reset_clears_state() {
        let mut h = HistoryCriterion::new("ZoneTemp", Comparison::Direct, Duration::from_secs(60));
        feed(&mut h, 0, 70.0);
        feed(&mut h, 60, 71.0);
        h.reset();
        assert_eq!(h.evaluate(Some(0.0)), Some(0.0));
    }

    #[test]
    fn parses_comparison_names() {
        assert_eq!(Comparison::parse("Direct"), Some(Comparison::Direct));
        assert_eq!(Comparison::parse("inverse"), Some(Comparison::Inverse));
        assert_eq!(Comparison::parse("ratio"), None);
    }
}
