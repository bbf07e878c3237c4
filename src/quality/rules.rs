//! Penalty and reward rules for inbound media.
//!
//! Each rule set keeps its own rolling metrics. A report is recorded, the
//! rules are evaluated over several horizons, and expired samples are purged.
//! Rewards (negative penalties) are only considered when no penalty fired.

use std::time::Duration;

use super::metric::TimedMetric;
use super::stats::{AudioStats, VideoStats};

const FREEZE_RETENTION: Duration = Duration::from_secs(60);
const PACKET_RETENTION: Duration = Duration::from_secs(5);
const ONGOING_FREEZE_LIMIT: Duration = Duration::from_secs(2);

/// A single penalty decision. Negative values are rewards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Penalty {
    pub value: f64,
    /// Critical penalties also apply during the grace period after a switch.
    pub critical: bool,
    pub description: &'static str,
}

impl Penalty {
    pub const fn critical(value: f64, description: &'static str) -> Self {
        Self {
            value,
            critical: true,
            description,
        }
    }

    pub const fn non_critical(value: f64, description: &'static str) -> Self {
        Self {
            value,
            critical: false,
            description,
        }
    }
}

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

fn grew_by(metric: &TimedMetric, window: u64, threshold: f64) -> bool {
    metric.difference(secs(window)).is_some_and(|d| d >= threshold)
}

fn grew_less_than(metric: &TimedMetric, window: u64, threshold: f64) -> bool {
    metric.difference(secs(window)).is_some_and(|d| d < threshold)
}

fn average_matches(metric: &TimedMetric, window: u64, predicate: impl Fn(f64) -> bool) -> bool {
    metric.average(secs(window)).is_some_and(predicate)
}

/// Time since the packet counter last moved.
fn ongoing_freeze(packets: &TimedMetric, current: u64) -> Duration {
    let current = current as f64;
    let frozen = packets.duration_while(|v| current - v <= 0.0);
    if frozen > Duration::from_millis(500) {
        tracing::debug!(frozen = ?frozen, "Ongoing freeze");
    }
    frozen
}

/// Rules shared by audio and video: frequent freezes, long freezes and an
/// ongoing freeze.
fn freeze_penalties(count: &TimedMetric, duration: &TimedMetric, ongoing: Duration) -> Vec<Penalty> {
    let mut penalties = Vec::new();

    if grew_by(count, 5, 5.0) || grew_by(count, 10, 8.0) || grew_by(count, 30, 10.0) {
        tracing::debug!("Freeze count threshold matched");
        penalties.push(Penalty::critical(0.4, "Freezes"));
    }

    if grew_by(duration, 5, 2.0) || grew_by(duration, 10, 3.0) || grew_by(duration, 30, 7.0) {
        tracing::debug!("Freeze duration threshold matched");
        penalties.push(Penalty::non_critical(0.4, "Freezes"));
    }

    if ongoing >= ONGOING_FREEZE_LIMIT {
        penalties.push(Penalty::critical(0.4, "Ongoing Freeze"));
    }

    penalties
}

/// Rolling metrics and rules of a video monitor.
#[derive(Debug, Clone, Default)]
pub struct VideoRules {
    freeze_count: TimedMetric,
    freeze_duration: TimedMetric,
    packets_received: TimedMetric,
    resolution: TimedMetric,
    fps: TimedMetric,
}

impl VideoRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `stats` and return the resulting penalties.
    pub fn evaluate(&mut self, stats: &VideoStats) -> Vec<Penalty> {
        self.freeze_count.push(stats.freeze_count as f64);
        self.freeze_duration.push(stats.total_freezes_duration);
        self.resolution.push(f64::from(stats.frame_height.unwrap_or(0)));
        self.fps.push(f64::from(stats.frames_per_second.unwrap_or(0)));
        self.packets_received.push(stats.packets_received as f64);

        let ongoing = ongoing_freeze(&self.packets_received, stats.packets_received);
        let mut penalties = freeze_penalties(&self.freeze_count, &self.freeze_duration, ongoing);

        if average_matches(&self.fps, 30, |fps| fps < 13.0) {
            penalties.push(Penalty::non_critical(0.2, "Low FPS"));
        }

        if average_matches(&self.fps, 4, |fps| fps <= 5.0) && self.fps.last().unwrap_or(5.0) <= 5.0 {
            penalties.push(Penalty::non_critical(0.3, "Very Low FPS"));
        }

        if penalties.is_empty() {
            if grew_less_than(&self.freeze_count, 45, 1.0)
                && ongoing.is_zero()
                && average_matches(&self.resolution, 60, |height| height > 450.0)
                && average_matches(&self.fps, 30, |fps| fps > 19.0)
            {
                penalties.push(Penalty::non_critical(-0.2, "Good Resolution + FPS + No Freeze"));
            }

            let sharp = average_matches(&self.resolution, 60, |height| height > 700.0)
                && self.resolution.last().unwrap_or(0.0) > 700.0;
            if sharp || average_matches(&self.fps, 30, |fps| fps > 24.0) {
                penalties.push(Penalty::non_critical(-0.1, "Very Good Resolution + FPS"));
            }
        }

        self.purge_expired();
        penalties
    }

    fn metrics_mut(&mut self) -> [(&mut TimedMetric, Duration); 5] {
        [
            (&mut self.freeze_count, FREEZE_RETENTION),
            (&mut self.freeze_duration, FREEZE_RETENTION),
            (&mut self.packets_received, PACKET_RETENTION),
            (&mut self.resolution, FREEZE_RETENTION),
            (&mut self.fps, FREEZE_RETENTION),
        ]
    }

    fn purge_expired(&mut self) {
        for (metric, retention) in self.metrics_mut() {
            metric.purge_older_than(retention);
        }
    }

    /// Drop every recorded sample.
    pub fn reset(&mut self) {
        for (metric, _) in self.metrics_mut() {
            metric.clear();
        }
    }

    /// Freeze time added by the last sample.
    pub fn last_freeze_delta(&self) -> f64 {
        self.freeze_duration.difference_over_count(2).1
    }
}

/// Rolling metrics and rules of an audio monitor.
#[derive(Debug, Clone, Default)]
pub struct AudioRules {
    interruption_count: TimedMetric,
    interruption_duration: TimedMetric,
    packets_received: TimedMetric,
}

impl AudioRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `stats` and return the resulting penalties.
    pub fn evaluate(&mut self, stats: &AudioStats) -> Vec<Penalty> {
        self.interruption_count.push(stats.interruption_count as f64);
        self.interruption_duration.push(stats.total_interruption_duration);
        self.packets_received.push(stats.packets_received as f64);

        let ongoing = ongoing_freeze(&self.packets_received, stats.packets_received);
        let mut penalties = freeze_penalties(&self.interruption_count, &self.interruption_duration, ongoing);

        if penalties.is_empty()
            && grew_less_than(&self.interruption_duration, 45, 0.5)
            && grew_less_than(&self.interruption_count, 45, 2.0)
            && ongoing.is_zero()
        {
            penalties.push(Penalty::non_critical(-0.1, "Low Freezes"));
        }

        self.purge_expired();
        penalties
    }

    fn metrics_mut(&mut self) -> [(&mut TimedMetric, Duration); 3] {
        [
            (&mut self.interruption_count, FREEZE_RETENTION),
            (&mut self.interruption_duration, FREEZE_RETENTION),
            (&mut self.packets_received, PACKET_RETENTION),
        ]
    }

    fn purge_expired(&mut self) {
        for (metric, retention) in self.metrics_mut() {
            metric.purge_older_than(retention);
        }
    }

    pub fn reset(&mut self) {
        for (metric, _) in self.metrics_mut() {
            metric.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(freezes: u64, freeze_secs: f64, packets: u64, height: u32, fps: u32) -> VideoStats {
        VideoStats {
            freeze_count: freezes,
            total_freezes_duration: freeze_secs,
            packets_received: packets,
            frame_height: Some(height),
            frames_per_second: Some(fps),
        }
    }

    async fn tick() {
        tokio::time::advance(Duration::from_secs(1)).await;
    }

    fn has(penalties: &[Penalty], description: &str, value: f64) -> bool {
        penalties
            .iter()
            .any(|p| p.description == description && (p.value - value).abs() < f64::EPSILON)
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_video_is_rewarded() {
        let mut rules = VideoRules::new();
        let mut last = Vec::new();
        for i in 0..62 {
            last = rules.evaluate(&video(0, 0.0, 100 * (i + 1), 720, 30));
            tick().await;
        }
        assert!(has(&last, "Good Resolution + FPS + No Freeze", -0.2));
        assert!(has(&last, "Very Good Resolution + FPS", -0.1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_freeze_burst_is_critical() {
        let mut rules = VideoRules::new();
        let mut result = Vec::new();
        for i in 0..7u64 {
            result = rules.evaluate(&video(i * 2, 0.0, 100 * (i + 1), 720, 30));
            tick().await;
        }
        let freezes = result.iter().find(|p| p.description == "Freezes").unwrap();
        assert!(freezes.critical);
        assert!(result.iter().all(|p| p.value > 0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ongoing_freeze() {
        let mut rules = VideoRules::new();
        for i in 0..4u64 {
            assert!(rules.evaluate(&video(0, 0.0, 100 * (i + 1), 720, 30)).is_empty());
            tick().await;
        }
        // Packets stop arriving
        let mut result = Vec::new();
        for _ in 0..4 {
            result = rules.evaluate(&video(0, 0.0, 400, 720, 30));
            tick().await;
        }
        assert!(result.contains(&Penalty::critical(0.4, "Ongoing Freeze")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_very_low_fps() {
        let mut rules = VideoRules::new();
        let mut result = Vec::new();
        for i in 0..6u64 {
            result = rules.evaluate(&video(0, 0.0, 100 * (i + 1), 360, 4));
            tick().await;
        }
        assert!(has(&result, "Very Low FPS", 0.3));
        assert!(result.iter().all(|p| !p.critical));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_forgets_history() {
        let mut rules = VideoRules::new();
        for i in 0..6u64 {
            rules.evaluate(&video(i * 2, 0.0, 100 * (i + 1), 720, 30));
            tick().await;
        }
        rules.reset();
        assert!(rules.evaluate(&video(12, 0.0, 700, 720, 30)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_audio_rules() {
        let mut rules = AudioRules::new();
        let mut last = Vec::new();
        for i in 0..47u64 {
            last = rules.evaluate(&AudioStats {
                interruption_count: 0,
                total_interruption_duration: 0.0,
                packets_received: 50 * (i + 1),
            });
            tick().await;
        }
        assert_eq!(last, vec![Penalty::non_critical(-0.1, "Low Freezes")]);

        let mut result = Vec::new();
        for i in 0..6u64 {
            result = rules.evaluate(&AudioStats {
                interruption_count: i,
                total_interruption_duration: i as f64,
                packets_received: 5000 + 50 * i,
            });
            tick().await;
        }
        assert!(result.contains(&Penalty::non_critical(0.4, "Freezes")));
    }
}
