//! Call quality monitor.
//!
//! Turns periodic media statistics into penalty decisions for the paths the
//! inbound media currently arrives on, applies them to the local penalizer
//! and notifies the peer, who steers its outbound traffic away from them.
//!
//! ```text
//!   stats ──► rules ──► grace filter ──► repeat check ──► local penalizer
//!                                                    └──► penalty batch ──► peer
//!                                                           (1 + repeat + 2 sends)
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;

use super::rules::{AudioRules, Penalty, VideoRules};
use super::snapshot::{SnapshotRecorder, TestSnapshot};
use super::stats::StatisticsReport;
use crate::config::{PenaltyConfig, QualityConfig};
use crate::connection::PathAwareConnection;
use crate::events::{EventSource, Listener};
use crate::path::{Path, PathSet};
use crate::processor::{penalize_bounded, OverlapPathProcessor, PathPenalizer, PathProcessor, Stage};
use crate::protocol::{PenaltyBatch, PenaltyNotification, PenaltySequence};
use crate::types::{ChannelType, PathSetToken, ProcessContext, Toggle};

/// A penalty that went out to the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedPenalty {
    pub channel: ChannelType,
    pub seq_id: u32,
    /// Sum of the applied penalty values.
    pub punishment: f64,
    /// The batch named no paths and asked the peer to penalize its current
    /// ones.
    pub broadcast: bool,
    pub paths: PathSet,
    pub repeat: u32,
}

enum ChannelRules {
    Video(VideoRules),
    Audio(AudioRules),
}

impl ChannelRules {
    fn reset(&mut self) {
        match self {
            ChannelRules::Video(rules) => rules.reset(),
            ChannelRules::Audio(rules) => rules.reset(),
        }
    }
}

struct MonitorState {
    rules: ChannelRules,
    current_paths: PathSet,
    token: PathSetToken,
    last_penalized: PathSet,
    last_penalized_token: Option<PathSetToken>,
    last_penalized_at: Option<Instant>,
    repeat_count: u32,
    no_noncritical_until: Option<Instant>,
    ignore_stalls_until: Option<Instant>,
    recorder: Option<SnapshotRecorder>,
}

impl MonitorState {
    fn roll_token(&mut self) {
        self.token = PathSetToken::generate();
        self.repeat_count = 0;
        self.last_penalized_at = None;
    }
}

/// What `apply` decided while holding the state lock.
struct Decision {
    connection: Arc<PathAwareConnection>,
    punishment: f64,
    broadcast: bool,
    paths: PathSet,
    repeat: u32,
}

/// Penalty decisions for one media channel.
pub struct CallQualityMonitor {
    channel: ChannelType,
    grace: Duration,
    quality: QualityConfig,
    penalties: PenaltyConfig,
    sequence: PenaltySequence,
    sending: RwLock<Toggle>,
    local_penalizer: RwLock<Option<Arc<PathPenalizer>>>,
    notifier: RwLock<Option<Weak<PathAwareConnection>>>,
    reference_video: RwLock<Option<Weak<CallQualityMonitor>>>,
    state: Mutex<MonitorState>,
    trackers: Mutex<Vec<Listener>>,
    applied: EventSource<AppliedPenalty>,
    snapshots: EventSource<TestSnapshot>,
    weak_self: Weak<Self>,
}

impl CallQualityMonitor {
    /// Create a monitor for an audio or video channel.
    ///
    /// # Panics
    ///
    /// If `channel` is not a media channel.
    pub fn new(
        channel: ChannelType,
        quality: QualityConfig,
        penalties: PenaltyConfig,
        sequence: PenaltySequence,
    ) -> Arc<Self> {
        assert!(channel.is_media(), "no quality rules for {channel} channels");

        let (rules, grace) = match channel {
            ChannelType::Video => (ChannelRules::Video(VideoRules::new()), quality.video_grace),
            _ => (ChannelRules::Audio(AudioRules::new()), quality.audio_grace),
        };
        // Read before `penalties` moves into the monitor
        let sending_enabled = penalties.sending_enabled;
        let recorder = (quality.record_snapshots && channel == ChannelType::Video).then(SnapshotRecorder::new);

        Arc::new_cyclic(|weak_self| Self {
            channel,
            grace,
            quality,
            penalties,
            sequence,
            sending: RwLock::new(Toggle::new(sending_enabled)),
            local_penalizer: RwLock::new(None),
            notifier: RwLock::new(None),
            reference_video: RwLock::new(None),
            state: Mutex::new(MonitorState {
                rules,
                current_paths: Vec::new(),
                token: PathSetToken::generate(),
                last_penalized: Vec::new(),
                last_penalized_token: None,
                last_penalized_at: None,
                repeat_count: 0,
                no_noncritical_until: None,
                ignore_stalls_until: None,
                recorder,
            }),
            trackers: Mutex::new(Vec::new()),
            applied: EventSource::new(),
            snapshots: EventSource::new(),
            weak_self: weak_self.clone(),
        })
    }

    pub fn channel(&self) -> ChannelType {
        self.channel
    }

    /// Replace the sending switch, e.g. with one shared by a session or the
    /// process-wide [`Toggle::penalty_sending`].
    pub fn set_sending_toggle(&self, toggle: Toggle) {
        *self.sending.write() = toggle;
    }

    pub fn sending_toggle(&self) -> Toggle {
        self.sending.read().clone()
    }

    /// Penalizer that receives every outgoing penalty for the current paths.
    pub fn set_local_penalizer(&self, penalizer: Option<Arc<PathPenalizer>>) {
        *self.local_penalizer.write() = penalizer;
    }

    /// Connection the notifications are sent on.
    pub fn set_notifier(&self, connection: &Arc<PathAwareConnection>) {
        *self.notifier.write() = Some(Arc::downgrade(connection));
    }

    /// Stop following connections and drop the notifier. Penalties decided
    /// afterwards are not sent.
    pub fn detach(&self) {
        self.trackers.lock().clear();
        *self.notifier.write() = None;
        tracing::debug!(channel = %self.channel, "Monitor detached");
    }

    /// Whether the monitor follows the reply paths of any connection.
    pub fn is_tracking(&self) -> bool {
        !self.trackers.lock().is_empty()
    }

    pub fn notifier(&self) -> Option<Arc<PathAwareConnection>> {
        self.notifier.read().as_ref().and_then(Weak::upgrade)
    }

    /// Audio monitors stay quiet while the video monitor has just penalized
    /// the same paths: video dominates a shared path, so audio gets a chance
    /// to recover without it.
    pub fn set_reference_video(&self, video: &Arc<CallQualityMonitor>) {
        *self.reference_video.write() = Some(Arc::downgrade(video));
    }

    /// Derive the current paths from the mirror reply paths of `connections`
    /// and notify over the one with the fewest pipeline stages.
    pub fn track_connections(&self, connections: &[Arc<PathAwareConnection>]) {
        if let Some(notifier) = connections.iter().min_by_key(|c| c.stage_count()) {
            self.set_notifier(notifier);
        }

        let weak_connections: Arc<Vec<Weak<PathAwareConnection>>> =
            Arc::new(connections.iter().map(Arc::downgrade).collect());

        let mut trackers = self.trackers.lock();
        for connection in connections {
            let monitor = Weak::clone(&self.weak_self);
            let all = Arc::clone(&weak_connections);
            trackers.push(connection.mirror_reply_changes().listen(move |_| {
                if let Some(monitor) = monitor.upgrade() {
                    monitor.set_current_paths(Self::reply_paths(&all));
                }
            }));
        }
        drop(trackers);

        self.set_current_paths(Self::reply_paths(&weak_connections));
    }

    fn reply_paths(connections: &[Weak<PathAwareConnection>]) -> PathSet {
        connections
            .iter()
            .filter_map(Weak::upgrade)
            .filter_map(|c| c.mirror_reply_path())
            .collect()
    }

    pub fn current_paths(&self) -> PathSet {
        self.state.lock().current_paths.clone()
    }

    /// Paths named by the last penalty that went out; empty if the last
    /// decision was suppressed.
    pub fn last_penalized(&self) -> PathSet {
        self.state.lock().last_penalized.clone()
    }

    pub fn repeat_count(&self) -> u32 {
        self.state.lock().repeat_count
    }

    /// Fires for every penalty sent to the peer.
    pub fn applied(&self) -> &EventSource<AppliedPenalty> {
        &self.applied
    }

    /// Fires with the recorded timeline when snapshot recording is on.
    pub fn snapshots(&self) -> &EventSource<TestSnapshot> {
        &self.snapshots
    }

    /// The inbound media switched paths.
    ///
    /// The first assignment only records the paths. A genuine switch starts a
    /// new path identity and drops all samples now and once more after a
    /// short delay, so late samples from the old paths are not held against
    /// the new ones.
    pub fn set_current_paths(&self, paths: PathSet) {
        let switched = {
            let mut state = self.state.lock();
            if state.current_paths == paths {
                return;
            }

            tracing::info!(
                channel = %self.channel,
                from = %describe(&state.current_paths),
                to = %describe(&paths),
                "Inbound paths changed"
            );

            let switched = !state.current_paths.is_empty();
            state.current_paths = paths;
            if switched {
                state.roll_token();
                state.rules.reset();
            }
            switched
        };

        if !switched {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let monitor = Weak::clone(&self.weak_self);
            let delay = self.quality.switch_purge_delay;
            handle.spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(monitor) = monitor.upgrade() {
                    monitor.reset_stats();
                }
            });
        }
    }

    /// Drop every recorded sample.
    pub fn reset_stats(&self) {
        self.state.lock().rules.reset();
    }

    /// Evaluate one statistics report and act on the result.
    pub fn consume(&self, report: &StatisticsReport) {
        let evaluated = {
            let mut state = self.state.lock();
            match &mut state.rules {
                ChannelRules::Video(rules) => report.video.map(|stats| rules.evaluate(&stats)),
                ChannelRules::Audio(rules) => report.audio.map(|stats| rules.evaluate(&stats)),
            }
        };
        let Some(mut penalties) = evaluated else {
            return;
        };

        let reference = self.reference_video.read().as_ref().and_then(Weak::upgrade);
        if let Some(video) = reference {
            let current = self.current_paths();
            if !current.is_empty() && current == video.last_penalized() {
                tracing::debug!(channel = %self.channel, "Video penalized the shared paths, resetting");
                self.reset_stats();
                penalties.clear();
            }
        }

        self.apply(&penalties, None);

        if let Some(stats) = report.video {
            let penalized = penalties.iter().any(|p| p.value > 0.0);
            let snapshot = {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                let freeze_delta = match &state.rules {
                    ChannelRules::Video(rules) => rules.last_freeze_delta(),
                    ChannelRules::Audio(_) => 0.0,
                };
                state
                    .recorder
                    .as_mut()
                    .and_then(|recorder| recorder.observe(&stats, freeze_delta, penalized).cloned())
            };
            if let Some(snapshot) = snapshot {
                self.snapshots.emit(snapshot);
            }
        }
    }

    /// The media pipeline reported a stall. Applies a critical penalty unless
    /// another stall was handled within the cooldown.
    pub fn report_stall(&self) -> bool {
        let now = Instant::now();
        {
            let mut state = self.state.lock();
            if state.ignore_stalls_until.is_some_and(|until| now <= until) {
                return false;
            }
            state.ignore_stalls_until = Some(now + self.quality.stall_cooldown);
        }

        tracing::info!(channel = %self.channel, "Applying stall penalty");
        self.apply(&[Penalty::critical(self.quality.stall_penalty, "Stall")], None)
    }

    /// Apply `penalties` to the current paths and notify the peer.
    ///
    /// Inside the grace period only critical penalties count. Returns whether
    /// a notification went out.
    pub fn apply(&self, penalties: &[Penalty], grace_override: Option<Duration>) -> bool {
        let Some(decision) = self.decide(penalties, grace_override) else {
            return false;
        };

        let local = self.local_penalizer.read().clone();
        if let (Some(local), true) = (local, self.penalties.apply_locally) {
            for path in &decision.paths {
                penalize_bounded(&local, path, decision.punishment, self.penalties.bounds());
            }
        }

        let seq_id = self.sequence.next();
        let notifications = if decision.broadcast {
            vec![PenaltyNotification::broadcast(decision.punishment, self.channel)]
        } else {
            decision
                .paths
                .iter()
                .map(|path| PenaltyNotification::for_path(decision.punishment, self.channel, path))
                .collect()
        };

        tracing::info!(
            channel = %self.channel,
            punishment = decision.punishment,
            paths = %if decision.broadcast { "BROADCAST".to_string() } else { describe(&decision.paths) },
            repeat = decision.repeat,
            seq_id,
            "Applying penalty"
        );

        let encoded = match PenaltyBatch::new(seq_id, notifications).encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode penalty batch");
                return false;
            }
        };

        let used_path = match decision.connection.send_default(&encoded) {
            Ok(outcome) => outcome.used_path,
            Err(e) => {
                tracing::warn!(channel = %self.channel, error = %e, "Failed to send penalty");
                return false;
            }
        };
        tracing::debug!(path = ?used_path.as_ref().map(Path::display_id), "Sent penalty");

        self.spawn_resends(&decision.connection, encoded, used_path, decision.repeat + 2);

        self.applied.emit(AppliedPenalty {
            channel: self.channel,
            seq_id,
            punishment: decision.punishment,
            broadcast: decision.broadcast,
            paths: decision.paths,
            repeat: decision.repeat,
        });
        true
    }

    fn decide(&self, penalties: &[Penalty], grace_override: Option<Duration>) -> Option<Decision> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let in_grace = state.no_noncritical_until.is_some_and(|until| now < until);
        let penalties: Vec<&Penalty> = penalties.iter().filter(|p| !in_grace || p.critical).collect();

        if penalties.is_empty() || !self.sending.read().get() {
            state.last_penalized.clear();
            return None;
        }

        let Some(connection) = self.notifier() else {
            tracing::warn!(channel = %self.channel, "No connection to send penalties on");
            state.last_penalized.clear();
            return None;
        };

        let punishment: f64 = penalties.iter().map(|p| p.value).sum();

        if punishment < 0.0 {
            // A reward is a fresh start as well
            state.rules.reset();
            state.repeat_count = 0;
        } else {
            let repeated = state.last_penalized_token == Some(state.token)
                && state
                    .last_penalized_at
                    .is_some_and(|at| now.saturating_duration_since(at) < self.penalties.repeat_window);
            state.repeat_count = if repeated { state.repeat_count + 1 } else { 0 };
        }

        state.last_penalized_token = Some(state.token);
        state.last_penalized_at = Some(now);

        if state.repeat_count >= self.penalties.max_repeats {
            tracing::info!(channel = %self.channel, repeats = state.repeat_count, "Not sending penalty, repeat limit reached");
            state.last_penalized.clear();
            return None;
        }

        state.last_penalized = state.current_paths.clone();
        if punishment >= 0.0 {
            state.no_noncritical_until = Some(now + grace_override.unwrap_or(self.grace));
        }

        Some(Decision {
            connection,
            punishment,
            broadcast: state.repeat_count > 1,
            paths: state.current_paths.clone(),
            repeat: state.repeat_count,
        })
    }

    /// Resend `encoded` up to `remaining` times. Each copy goes over the best
    /// path of the connection pipeline extended with an overlap penalizer
    /// that accumulates every path used so far, so copies spread over
    /// disjoint infrastructure.
    fn spawn_resends(
        &self,
        connection: &Arc<PathAwareConnection>,
        encoded: Bytes,
        used_path: Option<Path>,
        remaining: u32,
    ) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let overlap = Arc::new(OverlapPathProcessor::new());
        let pipeline = connection.root().pipeline().joined(Stage::Penalizer(overlap.clone()));
        let connection = Arc::downgrade(connection);
        let interval = self.penalties.resend_interval;

        handle.spawn(async move {
            let mut previous = used_path;
            for _ in 0..remaining {
                tokio::time::sleep(interval).await;
                let Some(connection) = connection.upgrade() else {
                    break;
                };
                if connection.is_closed() {
                    break;
                }

                let path = previous.take().and_then(|used| {
                    overlap.add_reference(used, 1.0);
                    pipeline
                        .process(connection.root_paths(), ProcessContext::ROUTINE)
                        .into_iter()
                        .next()
                });

                match connection.send(&encoded, path.as_ref()) {
                    Ok(_) => tracing::debug!(path = ?path.as_ref().map(Path::display_id), "Resent penalty"),
                    Err(e) => tracing::debug!(error = %e, "Failed to resend penalty"),
                }

                match path {
                    Some(path) => previous = Some(path),
                    None => break,
                }
            }
        });
    }
}

fn describe(paths: &[Path]) -> String {
    paths
        .iter()
        .map(Path::display_id)
        .collect::<Vec<_>>()
        .join(", ")
}

impl std::fmt::Debug for CallQualityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallQualityMonitor")
            .field("channel", &self.channel)
            .field("grace", &self.grace)
            .finish_non_exhaustive()
    }
}
