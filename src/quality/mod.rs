//! Call quality feedback.
//!
//! Media statistics are polled from an external engine ([`stats`]), turned
//! into penalties by rolling rule sets ([`rules`] over [`metric`]) and sent to
//! the peer by a [`CallQualityMonitor`]. The peer's [`PenaltyReceiver`] feeds
//! them into per-channel penalizers ([`ChannelPenalizers`]), which reorder the
//! paths its own media is sent over.

pub mod metric;
pub mod monitor;
pub mod receiver;
pub mod rules;
pub mod snapshot;
pub mod stats;

pub use metric::TimedMetric;
pub use monitor::{AppliedPenalty, CallQualityMonitor};
pub use receiver::{ChannelPenalizers, PenaltyReceiver};
pub use rules::{AudioRules, Penalty, VideoRules};
pub use snapshot::{FreezePair, SnapshotRecorder, TestSnapshot};
pub use stats::{spawn_stats_poller, AudioStats, StatisticsReport, StatsSource, VideoStats};
