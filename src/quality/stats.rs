//! Media statistics input.
//!
//! The media engine is external. It is polled once per interval through a
//! [`StatsSource`] and every report is handed to the quality monitors.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::CallQualityMonitor;

/// Inbound video statistics of one report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoStats {
    /// Cumulative number of completed freezes.
    pub freeze_count: u64,
    /// Cumulative freeze time in seconds.
    pub total_freezes_duration: f64,
    /// Cumulative packets received on the transport.
    pub packets_received: u64,
    pub frame_height: Option<u32>,
    pub frames_per_second: Option<u32>,
}

/// Inbound audio statistics of one report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioStats {
    /// Cumulative number of playout interruptions.
    pub interruption_count: u64,
    /// Cumulative interruption time in seconds.
    pub total_interruption_duration: f64,
    pub packets_received: u64,
}

/// One statistics poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatisticsReport {
    pub video: Option<VideoStats>,
    pub audio: Option<AudioStats>,
}

/// Source of media statistics.
pub trait StatsSource: Send + Sync {
    /// Latest statistics, `None` if the engine has nothing yet.
    fn poll_stats(&self) -> Option<StatisticsReport>;
}

impl<F> StatsSource for F
where
    F: Fn() -> Option<StatisticsReport> + Send + Sync,
{
    fn poll_stats(&self) -> Option<StatisticsReport> {
        self()
    }
}

/// Poll `source` every `interval` and feed each report to all `monitors`
/// until `cancel` fires.
pub fn spawn_stats_poller(
    source: Arc<dyn StatsSource>,
    monitors: Vec<Arc<CallQualityMonitor>>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(report) = source.poll_stats() else {
                tracing::trace!("No statistics available");
                continue;
            };
            for monitor in &monitors {
                monitor.consume(&report);
            }
        }

        tracing::debug!("Statistics poller stopped");
    })
}
