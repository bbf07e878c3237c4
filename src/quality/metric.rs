//! Rolling time windows over media statistics.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// A metric sampled over time, e.g. a cumulative freeze counter.
///
/// Stores `(Instant, value)` pairs in arrival order. Window queries only
/// answer once the metric covers the whole window; until then they return
/// `None`.
#[derive(Debug, Clone, Default)]
pub struct TimedMetric {
    entries: VecDeque<(Instant, f64)>,
}

impl TimedMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: f64) {
        self.push_at(Instant::now(), value);
    }

    pub fn push_at(&mut self, at: Instant, value: f64) {
        self.entries.push_back((at, value));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<f64> {
        self.entries.back().map(|&(_, v)| v)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drop entries older than `horizon`. A zero horizon drops everything.
    pub fn purge_older_than(&mut self, horizon: Duration) {
        if horizon.is_zero() {
            self.entries.clear();
            return;
        }
        let now = Instant::now();
        while let Some(&(at, _)) = self.entries.front() {
            if now.saturating_duration_since(at) > horizon {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Time since the oldest entry.
    pub fn range(&self) -> Duration {
        self.entries
            .front()
            .map_or(Duration::ZERO, |&(at, _)| Instant::now().saturating_duration_since(at))
    }

    fn covers(&self, window: Duration) -> bool {
        !window.is_zero() && !self.entries.is_empty() && self.range() >= window
    }

    fn within(&self, window: Duration) -> impl Iterator<Item = &(Instant, f64)> {
        let now = Instant::now();
        self.entries
            .iter()
            .skip_while(move |&&(at, _)| now.saturating_duration_since(at) > window)
    }

    /// Growth of the value over the last `window`: the last value minus the
    /// newest value recorded before the window started (or the oldest one).
    pub fn difference(&self, window: Duration) -> Option<f64> {
        if !self.covers(window) {
            return None;
        }
        let reference = Instant::now().checked_sub(window)?;
        let (_, start) = self
            .entries
            .iter()
            .rev()
            .find(|&&(at, _)| at < reference)
            .or_else(|| self.entries.front())?;
        let (_, last) = self.entries.back()?;
        Some(last - start)
    }

    /// Mean of the values recorded within the last `window`.
    pub fn average(&self, window: Duration) -> Option<f64> {
        if !self.covers(window) {
            return None;
        }
        let (count, sum) = self
            .within(window)
            .fold((0usize, 0.0), |(count, sum), &(_, v)| (count + 1, sum + v));
        (count > 0).then(|| sum / count as f64)
    }

    /// How long the trailing run of entries satisfying `predicate` lasts.
    ///
    /// The run starts one sample after the first satisfying entry, so a single
    /// matching interval at the edge of the run is not counted. If every entry
    /// matches, the run spans the whole metric.
    pub fn duration_while<F>(&self, predicate: F) -> Duration
    where
        F: Fn(f64) -> bool,
    {
        let Some(&(last, _)) = self.entries.back() else {
            return Duration::ZERO;
        };
        let start = self
            .entries
            .iter()
            .rposition(|&(_, v)| !predicate(v))
            .map_or(0, |failing| (failing + 2).min(self.entries.len() - 1));
        last.saturating_duration_since(self.entries[start].0)
    }

    /// Growth over the last `count` entries and the time it took.
    pub fn difference_over_count(&self, count: usize) -> (Duration, f64) {
        let (Some(&(last_at, last)), true) = (self.entries.back(), count > 0) else {
            return (Duration::ZERO, 0.0);
        };
        let (start_at, start) = self.entries[self.entries.len().saturating_sub(count)];
        (last_at.saturating_duration_since(start_at), last - start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[tokio::test(start_paused = true)]
    async fn test_difference_needs_full_window() {
        let mut metric = TimedMetric::new();
        for v in 0..4 {
            metric.push(f64::from(v) * 2.0);
            tokio::time::advance(secs(1)).await;
        }
        // Entries at t=0..3, now t=4
        assert_eq!(metric.difference(secs(5)), None);
        assert_eq!(metric.difference(secs(2)), Some(4.0));
        assert_eq!(metric.difference(secs(4)), Some(6.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_average_over_window() {
        let mut metric = TimedMetric::new();
        for v in [10.0, 20.0, 30.0, 40.0] {
            metric.push(v);
            tokio::time::advance(secs(1)).await;
        }
        assert_eq!(metric.average(secs(2)), Some(35.0));
        assert_eq!(metric.average(secs(10)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge() {
        let mut metric = TimedMetric::new();
        for v in 0..10 {
            metric.push(f64::from(v));
            tokio::time::advance(secs(1)).await;
        }
        metric.purge_older_than(secs(5));
        assert_eq!(metric.len(), 5);
        assert_eq!(metric.last(), Some(9.0));

        metric.purge_older_than(Duration::ZERO);
        assert!(metric.is_empty());
        assert_eq!(metric.range(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trailing_run_duration() {
        let mut metric = TimedMetric::new();
        // Packet counter stalls at 30 from t=3
        for v in [10.0, 20.0, 25.0, 30.0, 30.0, 30.0, 30.0] {
            metric.push(v);
            tokio::time::advance(secs(1)).await;
        }
        let current = 30.0;
        let stalled = metric.duration_while(|v| current - v <= 0.0);
        assert_eq!(stalled, secs(2));

        let mut flowing = TimedMetric::new();
        for v in [1.0, 2.0, 3.0] {
            flowing.push(v);
            tokio::time::advance(secs(1)).await;
        }
        assert_eq!(flowing.duration_while(|v| 3.0 - v <= 0.0), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_difference_over_count() {
        let mut metric = TimedMetric::new();
        for v in [1.0, 1.5, 4.0] {
            metric.push(v);
            tokio::time::advance(secs(1)).await;
        }
        assert_eq!(metric.difference_over_count(2), (secs(1), 2.5));
        assert_eq!(metric.difference_over_count(0), (Duration::ZERO, 0.0));
    }
}
