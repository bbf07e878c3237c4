//! Opt-in timeline recorder for video call experiments.
//!
//! Recording starts once more than five consecutive 720p samples were seen,
//! so the timeline begins after the call settled. Every following report adds
//! one tick.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::stats::VideoStats;

const SETTLED_HEIGHT: u32 = 720;
const SETTLED_SAMPLES: u32 = 5;

/// A freeze observed between two ticks. Offsets are seconds since the
/// recording started.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FreezePair {
    pub start: f64,
    pub duration: f64,
}

/// Recorded timeline so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestSnapshot {
    /// Seconds since the recording started, one per tick.
    pub timestamps: Vec<f64>,
    pub resolution_timeline: Vec<u32>,
    pub fps_timeline: Vec<u32>,
    pub freezes: Vec<FreezePair>,
    pub penalty_times: Vec<f64>,
}

impl TestSnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Debug, Default)]
pub struct SnapshotRecorder {
    started_at: Option<Instant>,
    consecutive_settled: u32,
    ticks: u64,
    snapshot: TestSnapshot,
}

impl SnapshotRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_recording(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn snapshot(&self) -> &TestSnapshot {
        &self.snapshot
    }

    /// Feed one report. `freeze_delta` is the freeze time (seconds) added
    /// since the previous report. Returns the updated snapshot while recording.
    pub fn observe(&mut self, stats: &VideoStats, freeze_delta: f64, penalized: bool) -> Option<&TestSnapshot> {
        if stats.frame_height == Some(SETTLED_HEIGHT) {
            self.consecutive_settled += 1;
        } else {
            self.consecutive_settled = 0;
        }

        let Some(started_at) = self.started_at else {
            if self.consecutive_settled > SETTLED_SAMPLES {
                tracing::info!("Snapshot recording started");
                self.started_at = Some(Instant::now());
            }
            return None;
        };

        self.ticks += 1;
        let now = Instant::now().saturating_duration_since(started_at).as_secs_f64();

        self.snapshot.timestamps.push(now);
        self.snapshot.resolution_timeline.push(stats.frame_height.unwrap_or(0));
        self.snapshot.fps_timeline.push(stats.frames_per_second.unwrap_or(0));
        if penalized {
            self.snapshot.penalty_times.push(now);
        }
        if freeze_delta > 0.0 {
            self.snapshot.freezes.push(FreezePair {
                start: now - freeze_delta,
                duration: freeze_delta,
            });
        }

        Some(&self.snapshot)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn stats(height: u32) -> VideoStats {
        VideoStats {
            frame_height: Some(height),
            frames_per_second: Some(30),
            ..VideoStats::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_after_settling() {
        let mut recorder = SnapshotRecorder::new();
        for _ in 0..5 {
            assert!(recorder.observe(&stats(720), 0.0, false).is_none());
        }
        // A dip restarts the count
        assert!(recorder.observe(&stats(480), 0.0, false).is_none());
        for _ in 0..6 {
            assert!(recorder.observe(&stats(720), 0.0, false).is_none());
        }
        assert!(recorder.is_recording());

        tokio::time::advance(Duration::from_secs(2)).await;
        let snapshot = recorder.observe(&stats(360), 0.5, true).unwrap().clone();
        assert_eq!(snapshot.resolution_timeline, vec![360]);
        assert_eq!(snapshot.penalty_times, vec![2.0]);
        assert_eq!(snapshot.freezes, vec![FreezePair { start: 1.5, duration: 0.5 }]);
        assert_eq!(recorder.ticks(), 1);

        let json = snapshot.to_json().unwrap();
        assert!(json.contains("resolution_timeline"));
    }
}
