//! Path-aware connection.
//!
//! A [`PathAwareConnection`] sits on top of a [`PathTransport`] and owns the
//! path selection for it: the user's pipeline stages, always followed by the
//! connection's own path-down penalizer, wrapped in a [`RootPathProcessor`].
//! Ordering changes from any active stage trigger a policy update, which
//! re-ranks the transport's current paths and installs the result.
//!
//! The effective path is, in order of priority, the fixed path, the last
//! mirror reply path (when mirroring) or the path the transport chose.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::events::{EventSource, Listener};
use crate::path::{Path, PathSet};
use crate::processor::{
    ActivePathProcessor, Failover, PathPenalizer, PathProcessor, RootPathProcessor, Stage,
};
use crate::protocol::{LatencyProbeResponder, ReceiveExtension};
use crate::transport::{Message, PathTransport, SendOutcome};
use crate::types::{ConnectionId, Endpoint, ProcessContext};

type MirrorFilter = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// Per-connection options.
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Offer this connection to latency probers.
    pub wants_latency_probing: bool,
    /// Runs on every message the pipeline did not consume.
    pub receive_extension: Arc<dyn ReceiveExtension>,
    pub config: ConnectionConfig,
}

impl ConnectionOptions {
    pub fn new() -> Self {
        Self {
            wants_latency_probing: false,
            receive_extension: Arc::new(LatencyProbeResponder),
            config: ConnectionConfig::default(),
        }
    }

    pub fn with_latency_probing(mut self, wants: bool) -> Self {
        self.wants_latency_probing = wants;
        self
    }

    pub fn with_receive_extension(mut self, extension: Arc<dyn ReceiveExtension>) -> Self {
        self.receive_extension = extension;
        self
    }

    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("wants_latency_probing", &self.wants_latency_probing)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

struct PipelineSlot {
    /// User stages, without the path-down penalizer.
    stages: Vec<Stage>,
    root: Arc<RootPathProcessor>,
    mirroring: bool,
    _listeners: Vec<Listener>,
}

#[derive(Default)]
struct PathState {
    chosen: Option<Path>,
    fixed: Option<Path>,
    mirror_reply: Option<Path>,
    effective: Option<Path>,
}

#[derive(Default)]
struct PolicyQueue {
    running: bool,
    pending: VecDeque<ProcessContext>,
}

/// A connection whose path is chosen by a processor pipeline.
pub struct PathAwareConnection {
    id: ConnectionId,
    transport: Arc<dyn PathTransport>,
    wants_latency_probing: bool,
    config: ConnectionConfig,
    receive_extension: RwLock<Arc<dyn ReceiveExtension>>,
    path_down: Arc<PathPenalizer>,
    pipeline: RwLock<PipelineSlot>,
    state: RwLock<PathState>,
    mirror_filter: RwLock<Option<MirrorFilter>>,
    policy: Mutex<PolicyQueue>,
    path_down_seen: DashMap<Path, Instant>,
    path_down_pending: Mutex<Vec<Path>>,
    effective_path_changed: EventSource<Option<Path>>,
    mirror_reply_changed: EventSource<Option<Path>>,
    failovers: EventSource<Failover>,
    cancel: CancellationToken,
    weak_self: Weak<Self>,
}

impl PathAwareConnection {
    /// Create a connection running `stages` over `transport` and run the
    /// first policy update.
    pub fn new(
        transport: Arc<dyn PathTransport>,
        stages: Vec<Stage>,
        options: ConnectionOptions,
    ) -> Arc<Self> {
        let connection = Arc::new_cyclic(|weak_self| Self {
            id: ConnectionId::new(),
            transport,
            wants_latency_probing: options.wants_latency_probing,
            config: options.config,
            receive_extension: RwLock::new(options.receive_extension),
            path_down: Arc::new(PathPenalizer::named("Path Down", false)),
            pipeline: RwLock::new(PipelineSlot {
                stages: Vec::new(),
                root: Arc::new(RootPathProcessor::new(Vec::new())),
                mirroring: false,
                _listeners: Vec::new(),
            }),
            state: RwLock::new(PathState::default()),
            mirror_filter: RwLock::new(None),
            policy: Mutex::new(PolicyQueue::default()),
            path_down_seen: DashMap::new(),
            path_down_pending: Mutex::new(Vec::new()),
            effective_path_changed: EventSource::new(),
            mirror_reply_changed: EventSource::new(),
            failovers: EventSource::new(),
            cancel: CancellationToken::new(),
            weak_self: weak_self.clone(),
        });

        tracing::debug!(
            connection = %connection.id,
            local = %connection.local_endpoint(),
            remote = %connection.remote_endpoint(),
            "Connection created"
        );

        connection.set_path_processor(stages);
        connection
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn transport(&self) -> &Arc<dyn PathTransport> {
        &self.transport
    }

    pub fn local_endpoint(&self) -> Endpoint {
        self.transport.local_endpoint()
    }

    pub fn remote_endpoint(&self) -> Endpoint {
        self.transport.remote_endpoint()
    }

    /// Whether the peer lives in a different AS.
    pub fn is_foreign(&self) -> bool {
        self.local_endpoint().is_foreign_to(&self.remote_endpoint())
    }

    pub fn wants_latency_probing(&self) -> bool {
        self.wants_latency_probing
    }

    /// Replace the user pipeline. The path-down penalizer is always appended.
    /// Mirroring is enabled when the pipeline is exactly the mirror marker and
    /// the peer is foreign.
    pub fn set_path_processor(&self, stages: Vec<Stage>) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };

        let mirroring = matches!(stages.as_slice(), [Stage::Mirror]) && self.is_foreign();

        let mut full = stages.clone();
        full.push(Stage::Penalizer(self.path_down.clone()));
        let root = Arc::new(RootPathProcessor::new(full));

        let ordering = {
            let weak = Weak::clone(&self.weak_self);
            root.ordering_changed().listen(move |context: &ProcessContext| {
                if let Some(connection) = weak.upgrade() {
                    connection.force_policy_update(*context);
                }
            })
        };
        let failovers = root.failovers().forward_to(&self.failovers);

        {
            let mut slot = self.pipeline.write();
            *slot = PipelineSlot {
                stages,
                root: Arc::clone(&root),
                mirroring,
                _listeners: vec![ordering, failovers],
            };
        }

        tracing::debug!(connection = %self.id, pipeline = %root.name(), mirroring, "Pipeline installed");

        root.connect(&this);
        self.force_policy_update(ProcessContext::ROUTINE);
        self.update_effective_path();
    }

    /// The current root processor.
    pub fn root(&self) -> Arc<RootPathProcessor> {
        Arc::clone(&self.pipeline.read().root)
    }

    /// Number of user stages.
    pub fn stage_count(&self) -> usize {
        self.pipeline.read().stages.len()
    }

    pub fn is_mirroring(&self) -> bool {
        self.pipeline.read().mirroring
    }

    /// Unfiltered candidate paths of the last policy update.
    pub fn root_paths(&self) -> PathSet {
        self.root().root_paths()
    }

    pub fn path_down_penalizer(&self) -> &Arc<PathPenalizer> {
        &self.path_down
    }

    /// Paths whose path-down reports are currently suppressed.
    pub fn suppressed_path_downs(&self) -> usize {
        self.path_down_seen.len()
    }

    pub fn effective_path(&self) -> Option<Path> {
        self.state.read().effective.clone()
    }

    pub fn chosen_path(&self) -> Option<Path> {
        self.state.read().chosen.clone()
    }

    pub fn fixed_path(&self) -> Option<Path> {
        self.state.read().fixed.clone()
    }

    pub fn mirror_reply_path(&self) -> Option<Path> {
        self.state.read().mirror_reply.clone()
    }

    pub fn effective_path_changes(&self) -> &EventSource<Option<Path>> {
        &self.effective_path_changed
    }

    pub fn mirror_reply_changes(&self) -> &EventSource<Option<Path>> {
        &self.mirror_reply_changed
    }

    pub fn failovers(&self) -> &EventSource<Failover> {
        &self.failovers
    }

    /// Pin all unpinned sends to `path`.
    pub fn set_fixed_path(&self, path: Option<Path>) {
        self.state.write().fixed = path;
        self.update_effective_path();
    }

    /// Only messages passing `filter` may update the mirror reply path.
    pub fn set_mirror_reply_filter<F>(&self, filter: F)
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        *self.mirror_filter.write() = Some(Arc::new(filter));
    }

    pub fn set_receive_extension(&self, extension: Arc<dyn ReceiveExtension>) {
        *self.receive_extension.write() = extension;
    }

    /// Re-rank the transport's paths now.
    ///
    /// Updates requested while one is running are queued (identical pending
    /// contexts collapse) and run by the caller already inside, so pipelines
    /// never run concurrently or reentrantly for one connection.
    pub fn force_policy_update(&self, context: ProcessContext) {
        {
            let mut policy = self.policy.lock();
            if !policy.pending.contains(&context) {
                policy.pending.push_back(context);
            }
            if policy.running {
                return;
            }
            policy.running = true;
        }

        loop {
            let context = {
                let mut policy = self.policy.lock();
                match policy.pending.pop_front() {
                    Some(context) => context,
                    None => {
                        policy.running = false;
                        return;
                    }
                }
            };
            self.run_policy(context);
        }
    }

    fn run_policy(&self, context: ProcessContext) {
        if self.is_closed() {
            return;
        }

        let root = self.root();
        let ranked = root.process(self.transport.current_paths(), context);
        self.transport.apply_ordering(&ranked);

        let chosen = self.transport.chosen_path();
        tracing::trace!(
            connection = %self.id,
            %context,
            candidates = ranked.len(),
            chosen = ?chosen.as_ref().map(Path::display_id),
            "Policy updated"
        );

        self.state.write().chosen = chosen;
        self.update_effective_path();
    }

    /// The transport's path set changed.
    pub fn paths_changed(&self) {
        self.force_policy_update(ProcessContext::ROUTINE);
    }

    /// The transport reported `path` as down.
    ///
    /// Reports for a path within the suppression window of its last accepted
    /// report are ignored. Accepted reports are collected for a short batch
    /// window and then penalize each path once, without counting as failover.
    pub fn path_down(&self, path: &Path) {
        let now = Instant::now();
        let suppression = self.config.path_down_suppression;

        let recent = self
            .path_down_seen
            .get(path)
            .is_some_and(|last| now.saturating_duration_since(*last) <= suppression);
        if recent {
            tracing::debug!(path = %path.display_id(), "Path down suppressed");
            return;
        }
        self.path_down_seen.insert(path.clone(), now);

        let first_in_batch = {
            let mut pending = self.path_down_pending.lock();
            pending.push(path.clone());
            pending.len() == 1
        };
        if !first_in_batch {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let weak = Weak::clone(&self.weak_self);
                let delay = self.config.path_down_batch;
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(connection) = weak.upgrade() {
                        connection.flush_path_down();
                    }
                });
            }
            Err(_) => self.flush_path_down(),
        }
    }

    fn flush_path_down(&self) {
        let batch = std::mem::take(&mut *self.path_down_pending.lock());
        if batch.is_empty() {
            return;
        }

        let now = Instant::now();
        let suppression = self.config.path_down_suppression;
        self.path_down_seen
            .retain(|_, last| now.saturating_duration_since(*last) <= suppression);

        let weight = self.config.path_down_weight;
        self.path_down.mutate(
            |mut weights| {
                for path in &batch {
                    tracing::info!(connection = %self.id, path = %path.display_id(), "Path down");
                    *weights.entry(path.clone()).or_insert(0.0) += weight;
                }
                weights
            },
            false,
        );
    }

    /// Run an incoming message through the pipeline hooks and the receive
    /// extension. Returns the message if nothing consumed it.
    pub fn handle_incoming(&self, message: Message) -> Option<Message> {
        if !self.root().handle_receive(&message, self) {
            return None;
        }

        let extension = Arc::clone(&*self.receive_extension.read());
        let message = extension.handle_receive(message, self)?;

        self.update_mirror_reply(&message);
        Some(message)
    }

    fn update_mirror_reply(&self, message: &Message) {
        let Some(reply_path) = message.reply_path.as_ref() else {
            return;
        };
        let accepted = self.mirror_filter.read().as_ref().map_or(true, |f| f(message));
        if !accepted {
            return;
        }

        let changed = {
            let mut state = self.state.write();
            let changed = state.mirror_reply.as_ref().map_or(true, |current| {
                current.fingerprint() != reply_path.fingerprint()
                    || (reply_path.has_metadata() && !current.has_metadata())
            });
            if changed {
                state.mirror_reply = Some(reply_path.clone());
            }
            changed
        };

        if changed {
            tracing::debug!(connection = %self.id, path = %reply_path.display_id(), "Mirror reply path updated");
            self.mirror_reply_changed.emit(Some(reply_path.clone()));
            self.update_effective_path();
        }
    }

    fn update_effective_path(&self) {
        let mirroring = self.is_mirroring();

        let changed = {
            let mut state = self.state.write();
            let effective = if state.fixed.is_some() {
                state.fixed.clone()
            } else if mirroring {
                state.mirror_reply.clone()
            } else {
                state.chosen.clone()
            };

            let changed = match (&state.effective, &effective) {
                (None, None) => false,
                (Some(old), Some(new)) => {
                    old.fingerprint() != new.fingerprint() || (new.has_metadata() && !old.has_metadata())
                }
                _ => true,
            };
            state.effective = effective.clone();
            changed.then_some(effective)
        };

        if let Some(effective) = changed {
            tracing::debug!(
                connection = %self.id,
                path = ?effective.as_ref().map(Path::display_id),
                "Effective path changed"
            );
            self.effective_path_changed.emit(effective);
        }
    }

    /// Feed datagrams from `inbound` through [`Self::handle_incoming`] on a
    /// spawned task. Returns the messages nothing consumed.
    pub fn listen(&self, mut inbound: mpsc::UnboundedReceiver<Message>) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let weak = Weak::clone(&self.weak_self);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    () = cancel.cancelled() => break,
                    message = inbound.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };

                let Some(connection) = weak.upgrade() else {
                    break;
                };
                if let Some(message) = connection.handle_incoming(message) {
                    if tx.send(message).is_err() {
                        break;
                    }
                }
            }
        });

        rx
    }

    /// Send over `path`, or over the transport's choice.
    pub fn send(&self, payload: &[u8], path: Option<&Path>) -> Result<SendOutcome> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        self.transport.send(payload, path)
    }

    /// Send the way application data goes: over the mirror reply path when
    /// mirroring, else over the fixed path if set, else unpinned.
    pub fn send_default(&self, payload: &[u8]) -> Result<SendOutcome> {
        if self.is_mirroring() {
            let path = self.mirror_reply_path().ok_or(Error::NoPath)?;
            return self.send(payload, Some(&path));
        }
        let fixed = self.fixed_path();
        self.send(payload, fixed.as_ref())
    }

    pub fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.transport.close();
        tracing::info!(connection = %self.id, "Connection closed");
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token cancelled when the connection closes.
    pub fn closed(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for PathAwareConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// Intentionally abbreviated Debug output - pipeline and path state are behind locks
#[allow(clippy::missing_fields_in_debug)]
impl fmt::Debug for PathAwareConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathAwareConnection")
            .field("id", &self.id)
            .field("remote", &self.remote_endpoint())
            .field("effective", &self.effective_path())
            .field("closed", &self.is_closed())
            .finish()
    }
}
