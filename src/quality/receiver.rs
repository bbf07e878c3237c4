//! Receiving side of penalty feedback.
//!
//! [`PenaltyReceiver`] is a receive extension that collects penalty batches
//! for a short window, orders them by sequence id, drops everything already
//! seen and publishes the surviving entries. [`ChannelPenalizers`] applies
//! them to one shared penalizer per channel type.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::connection::PathAwareConnection;
use crate::events::{EventSource, Listener};
use crate::path::Path;
use crate::processor::{penalize_bounded, PathPenalizer, Penalizer, WeightBounds};
use crate::protocol::{PenaltyBatch, PenaltyNotification, ReceiveExtension};
use crate::transport::Message;
use crate::types::ChannelType;

#[derive(Default)]
struct ReceiverState {
    buffer: Vec<PenaltyBatch>,
    last_known: u32,
    flush_scheduled: bool,
}

struct ReceiverInner {
    window: Duration,
    state: Mutex<ReceiverState>,
    notifications: EventSource<PenaltyNotification>,
}

impl ReceiverInner {
    fn flush(&self) -> Vec<PenaltyNotification> {
        let batches = {
            let mut state = self.state.lock();
            state.flush_scheduled = false;
            let mut batches = std::mem::take(&mut state.buffer);

            batches.sort_by_key(|b| b.seq_id);
            batches.dedup_by_key(|b| b.seq_id);
            let last_known = state.last_known;
            batches.retain(|b| b.seq_id > last_known);

            if let Some(newest) = batches.last() {
                state.last_known = newest.seq_id;
            }
            batches
        };

        let mut entries = Vec::new();
        for batch in batches {
            tracing::debug!(seq_id = batch.seq_id, entries = batch.penalties.len(), "Handling path penalty");
            entries.extend(batch.penalties);
        }

        for entry in &entries {
            self.notifications.emit(entry.clone());
        }
        entries
    }
}

/// Receive extension consuming penalty batches.
#[derive(Clone)]
pub struct PenaltyReceiver {
    inner: Arc<ReceiverInner>,
}

impl PenaltyReceiver {
    pub fn new(window: Duration) -> Self {
        Self {
            inner: Arc::new(ReceiverInner {
                window,
                state: Mutex::new(ReceiverState::default()),
                notifications: EventSource::new(),
            }),
        }
    }

    /// Entries of applied batches, in sequence order.
    pub fn notifications(&self) -> &EventSource<PenaltyNotification> {
        &self.inner.notifications
    }

    /// Highest sequence id applied so far (0 before the first).
    pub fn last_known_seq(&self) -> u32 {
        self.inner.state.lock().last_known
    }

    /// Buffer `batch`. The first batch of a window schedules the flush;
    /// without a runtime the batch is applied right away.
    pub fn enqueue(&self, batch: PenaltyBatch) {
        let schedule = {
            let mut state = self.inner.state.lock();
            state.buffer.push(batch);
            !std::mem::replace(&mut state.flush_scheduled, true)
        };
        if !schedule {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::downgrade(&self.inner);
                let window = self.inner.window;
                handle.spawn(async move {
                    tokio::time::sleep(window).await;
                    if let Some(inner) = inner.upgrade() {
                        inner.flush();
                    }
                });
            }
            Err(_) => {
                self.inner.flush();
            }
        }
    }

    /// Apply everything buffered now.
    pub fn flush(&self) -> Vec<PenaltyNotification> {
        self.inner.flush()
    }
}

impl Default for PenaltyReceiver {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

impl ReceiveExtension for PenaltyReceiver {
    fn handle_receive(&self, message: Message, _connection: &PathAwareConnection) -> Option<Message> {
        match PenaltyBatch::decode(&message.payload) {
            Ok(None) => Some(message),
            Ok(Some(batch)) => {
                self.enqueue(batch);
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to decode path penalty notifications");
                None
            }
        }
    }
}

impl std::fmt::Debug for PenaltyReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PenaltyReceiver")
            .field("window", &self.inner.window)
            .field("last_known", &self.last_known_seq())
            .finish()
    }
}

/// One failover-aware penalizer per channel type, shared by all connections
/// of that type.
///
/// A path may carry audio fine and still break down under video load, so
/// weights are never shared across channel types.
pub struct ChannelPenalizers {
    bounds: WeightBounds,
    penalizers: HashMap<ChannelType, Arc<PathPenalizer>>,
    connections: RwLock<HashMap<ChannelType, Vec<Weak<PathAwareConnection>>>>,
}

impl ChannelPenalizers {
    pub fn new(channels: impl IntoIterator<Item = ChannelType>, bounds: WeightBounds) -> Self {
        let penalizers = channels
            .into_iter()
            .map(|channel| {
                let name = format!("{channel} penalties");
                (channel, Arc::new(PathPenalizer::named(name, true)))
            })
            .collect();

        Self {
            bounds,
            penalizers,
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn penalizer(&self, channel: ChannelType) -> Option<Arc<PathPenalizer>> {
        self.penalizers.get(&channel).cloned()
    }

    /// Make `connection` a target for penalties of `channel`. The first
    /// registered connection of a channel resolves fingerprints.
    pub fn register(&self, channel: ChannelType, connection: &Arc<PathAwareConnection>) {
        self.connections
            .write()
            .entry(channel)
            .or_default()
            .push(Arc::downgrade(connection));
    }

    fn live_connections(&self, channel: ChannelType) -> Vec<Arc<PathAwareConnection>> {
        self.connections
            .read()
            .get(&channel)
            .map(|conns| conns.iter().filter_map(Weak::upgrade).collect())
            .unwrap_or_default()
    }

    /// Resolve the paths `notification` targets.
    ///
    /// A broadcast targets the effective path of every connection of the
    /// channel. Otherwise the short canonical fingerprint is looked up among
    /// the paths of the first connection; unknown fingerprints resolve to
    /// nothing.
    pub fn resolve(&self, notification: &PenaltyNotification) -> Vec<Path> {
        let connections = self.live_connections(notification.channel_type);

        if notification.is_broadcast() {
            tracing::debug!(channel = %notification.channel_type, "Handling broadcast penalty");
            return connections.iter().filter_map(|c| c.effective_path()).collect();
        }

        let found = connections.first().and_then(|connection| {
            connection
                .transport()
                .current_paths()
                .into_iter()
                .find(|p| p.canonical_fingerprint_short() == notification.path_fingerprint)
        });
        if found.is_none() {
            tracing::debug!(fingerprint = %notification.path_fingerprint, "Path for penalty not found");
        }
        found.into_iter().collect()
    }

    /// Apply `notification`. Returns the number of paths whose weight changed.
    pub fn apply(&self, notification: &PenaltyNotification) -> usize {
        let Some(penalizer) = self.penalizers.get(&notification.channel_type) else {
            tracing::debug!(channel = %notification.channel_type, "No penalizer for channel");
            return 0;
        };

        self.resolve(notification)
            .iter()
            .filter(|path| {
                tracing::info!(
                    path = %path.display_id(),
                    channel = %notification.channel_type,
                    weight = notification.weight,
                    "Applying received penalty"
                );
                penalize_bounded(penalizer, path, notification.weight, self.bounds)
            })
            .count()
    }

    /// Apply every entry published by `receiver` until the returned listener
    /// is dropped.
    pub fn attach(self: &Arc<Self>, receiver: &PenaltyReceiver) -> Listener {
        let penalizers = Arc::downgrade(self);
        receiver.notifications().listen(move |notification| {
            if let Some(penalizers) = penalizers.upgrade() {
                penalizers.apply(notification);
            }
        })
    }

    /// Current weight of `path` for `channel`.
    pub fn weight(&self, channel: ChannelType, path: &Path) -> f64 {
        self.penalizers.get(&channel).map_or(0.0, |p| p.weight(path))
    }
}

impl std::fmt::Debug for ChannelPenalizers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPenalizers")
            .field("channels", &self.penalizers.keys().collect::<Vec<_>>())
            .field("bounds", &self.bounds)
            .finish_non_exhaustive()
    }
}
