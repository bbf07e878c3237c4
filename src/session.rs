//! Call path session.
//!
//! Wires the path selection of one call together: one connection per media
//! or data endpoint, a latency prober shared by all of them, a failover-aware
//! penalizer per channel type fed by the peer's penalty notifications, and
//! call quality monitors reporting back to the peer.
//!
//! ```text
//!   preprocessing ─► latency prober ─► channel penalizer ─► overlap with
//!   siblings ─► failover history ─► (path down)
//! ```
//!
//! Connections of the same channel type avoid each other's effective path:
//! every connection after the first gets an overlap penalizer following each
//! earlier sibling. The failover history of a channel steers failovers away
//! from the links of the paths recently abandoned.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::connection::{ConnectionOptions, PathAwareConnection};
use crate::events::Listener;
use crate::processor::{
    FailoverHistory, LatencyProbingPathProcessor, OverlapPathProcessor, Stage,
};
use crate::protocol::{LatencyProbeResponder, PenaltySequence, ReceiveChain, ReceiveExtension};
use crate::quality::{spawn_stats_poller, CallQualityMonitor, ChannelPenalizers, PenaltyReceiver, StatsSource};
use crate::transport::{Message, PathTransport};
use crate::types::{ChannelType, ConnectionId, Toggle};

const RTP_VERSION: u8 = 2;
const RTP_HEADER_LEN: usize = 12;

/// Whether `message` looks like an RTP (not RTCP) packet.
pub fn is_rtp(message: &Message) -> bool {
    let payload = &message.payload;
    if payload.len() < RTP_HEADER_LEN || payload[0] >> 6 != RTP_VERSION {
        return false;
    }
    // RTCP packet types 192..=223 overlap the marker bit + payload type byte
    !(192..=223).contains(&payload[1])
}

/// Builds a [`CallPathSession`].
#[derive(Default)]
pub struct CallPathSessionBuilder {
    config: Config,
    preprocessing: Vec<Stage>,
    endpoints: Vec<(ChannelType, Arc<dyn PathTransport>)>,
}

impl CallPathSessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Stage run before the latency prober on every connection.
    pub fn preprocess(mut self, stage: Stage) -> Self {
        self.preprocessing.push(stage);
        self
    }

    /// Add an endpoint. Connections are created in insertion order.
    pub fn channel(mut self, channel: ChannelType, transport: Arc<dyn PathTransport>) -> Self {
        self.endpoints.push((channel, transport));
        self
    }

    pub fn build(self) -> CallPathSession {
        CallPathSession::new(self.config, self.preprocessing, self.endpoints)
    }
}

impl std::fmt::Debug for CallPathSessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallPathSessionBuilder")
            .field("preprocessing", &self.preprocessing)
            .field("endpoints", &self.endpoints.len())
            .finish_non_exhaustive()
    }
}

/// Path selection state of one call.
pub struct CallPathSession {
    config: Config,
    prober: Arc<LatencyProbingPathProcessor>,
    penalizers: Arc<ChannelPenalizers>,
    receiver: PenaltyReceiver,
    histories: HashMap<ChannelType, Arc<FailoverHistory>>,
    channels: Vec<(ChannelType, Arc<PathAwareConnection>)>,
    monitors: HashMap<ChannelType, Arc<CallQualityMonitor>>,
    probing_paused: Toggle,
    penalty_sending: Toggle,
    cancel: CancellationToken,
    listeners: Mutex<Vec<Listener>>,
}

impl CallPathSession {
    pub fn builder() -> CallPathSessionBuilder {
        CallPathSessionBuilder::new()
    }

    fn new(
        config: Config,
        preprocessing: Vec<Stage>,
        endpoints: Vec<(ChannelType, Arc<dyn PathTransport>)>,
    ) -> Self {
        let channel_types: Vec<ChannelType> = ChannelType::ALL
            .into_iter()
            .filter(|c| endpoints.iter().any(|(e, _)| e == c))
            .collect();

        let probing_paused = Toggle::new(config.probing.start_paused);
        let penalty_sending = Toggle::new(config.penalties.sending_enabled);

        // Shared: all channels run over the same end-to-end path options
        let prober = Arc::new(LatencyProbingPathProcessor::with_pause_toggle(
            config.probing.clone(),
            probing_paused.clone(),
        ));
        let penalizers = Arc::new(ChannelPenalizers::new(
            channel_types.iter().copied(),
            config.penalties.bounds(),
        ));
        let receiver = PenaltyReceiver::new(config.penalties.receive_window);
        let histories: HashMap<_, _> = channel_types
            .iter()
            .map(|&c| (c, Arc::new(FailoverHistory::new())))
            .collect();

        let extensions: Vec<Arc<dyn ReceiveExtension>> =
            vec![Arc::new(LatencyProbeResponder), Arc::new(receiver.clone())];
        let receive_chain: Arc<dyn ReceiveExtension> = Arc::new(ReceiveChain::new(extensions));

        let prober_channel = if channel_types.contains(&ChannelType::Audio) {
            Some(ChannelType::Audio)
        } else {
            endpoints.first().map(|(c, _)| *c)
        };

        let mut listeners = vec![penalizers.attach(&receiver)];
        let mut channels: Vec<(ChannelType, Arc<PathAwareConnection>)> = Vec::new();
        let mut followers: HashMap<ConnectionId, Arc<OverlapPathProcessor>> = HashMap::new();
        let mut prober_assigned = false;

        for (channel, transport) in endpoints {
            let mut stages = preprocessing.clone();
            stages.push(Stage::Active(prober.clone()));
            if let Some(penalizer) = penalizers.penalizer(channel) {
                stages.push(Stage::Penalizer(penalizer));
            }

            for (_, sibling) in channels.iter().filter(|(c, _)| *c == channel) {
                let follower = followers
                    .entry(sibling.id())
                    .or_insert_with(|| OverlapPathProcessor::following(sibling, 1.0));
                stages.push(Stage::Penalizer(follower.clone()));
            }

            let history = histories.get(&channel).cloned().unwrap_or_default();
            stages.push(Stage::Penalizer(history.processor()));

            let wants_probing = !prober_assigned && prober_channel == Some(channel);
            prober_assigned |= wants_probing;

            let options = ConnectionOptions::new()
                .with_latency_probing(wants_probing)
                .with_receive_extension(Arc::clone(&receive_chain))
                .with_config(config.connection.clone());
            let connection = PathAwareConnection::new(transport, stages, options);
            connection.set_mirror_reply_filter(is_rtp);

            listeners.push(connection.failovers().listen(move |failover| {
                if history.record(&failover.old) {
                    tracing::info!(
                        channel = %channel,
                        old = %failover.old.display_id(),
                        new = %failover.new.display_id(),
                        "Connection failed over"
                    );
                }
            }));

            penalizers.register(channel, &connection);
            channels.push((channel, connection));
        }

        let sequence = PenaltySequence::new();
        let mut monitors: HashMap<ChannelType, Arc<CallQualityMonitor>> = HashMap::new();
        for &channel in channel_types.iter().filter(|c| c.is_media()) {
            let monitor = CallQualityMonitor::new(
                channel,
                config.quality.clone(),
                config.penalties.clone(),
                sequence.clone(),
            );
            monitor.set_sending_toggle(penalty_sending.clone());
            if config.penalties.apply_locally {
                monitor.set_local_penalizer(penalizers.penalizer(channel));
            }

            let connections: Vec<_> = channels
                .iter()
                .filter(|(c, _)| *c == channel)
                .map(|(_, conn)| Arc::clone(conn))
                .collect();
            monitor.track_connections(&connections);
            monitors.insert(channel, monitor);
        }

        if let (Some(audio), Some(video)) = (
            monitors.get(&ChannelType::Audio),
            monitors.get(&ChannelType::Video),
        ) {
            audio.set_reference_video(video);
        }

        tracing::info!(
            connections = channels.len(),
            monitors = monitors.len(),
            "Call path session created"
        );

        Self {
            config,
            prober,
            penalizers,
            receiver,
            histories,
            channels,
            monitors,
            probing_paused,
            penalty_sending,
            cancel: CancellationToken::new(),
            listeners: Mutex::new(listeners),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// All connections with their channel type, in creation order.
    pub fn channels(&self) -> &[(ChannelType, Arc<PathAwareConnection>)] {
        &self.channels
    }

    pub fn connections(&self, channel: ChannelType) -> Vec<Arc<PathAwareConnection>> {
        self.channels
            .iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, conn)| Arc::clone(conn))
            .collect()
    }

    pub fn monitor(&self, channel: ChannelType) -> Option<&Arc<CallQualityMonitor>> {
        self.monitors.get(&channel)
    }

    pub fn penalizers(&self) -> &Arc<ChannelPenalizers> {
        &self.penalizers
    }

    pub fn prober(&self) -> &Arc<LatencyProbingPathProcessor> {
        &self.prober
    }

    pub fn receiver(&self) -> &PenaltyReceiver {
        &self.receiver
    }

    pub fn failover_history(&self, channel: ChannelType) -> Option<&Arc<FailoverHistory>> {
        self.histories.get(&channel)
    }

    /// Pause switch of this session's latency prober.
    pub fn probing_paused(&self) -> &Toggle {
        &self.probing_paused
    }

    /// Switch for penalty notifications sent by this session's monitors.
    pub fn penalty_sending(&self) -> &Toggle {
        &self.penalty_sending
    }

    /// Poll `source` at the configured interval and feed every monitor until
    /// the session is closed.
    pub fn spawn_stats_poller(&self, source: Arc<dyn StatsSource>) -> JoinHandle<()> {
        spawn_stats_poller(
            source,
            self.monitors.values().cloned().collect(),
            self.config.quality.stats_interval,
            self.cancel.child_token(),
        )
    }

    /// Close every connection, stop polling, detach the monitors and stop
    /// applying received penalties.
    pub fn close(&self) {
        self.cancel.cancel();
        for monitor in self.monitors.values() {
            monitor.detach();
        }
        self.listeners.lock().clear();
        for (_, connection) in &self.channels {
            connection.close();
        }
        tracing::info!("Call path session closed");
    }
}

impl Drop for CallPathSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// Intentionally abbreviated Debug output - connections and monitors have their own
#[allow(clippy::missing_fields_in_debug)]
impl std::fmt::Debug for CallPathSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallPathSession")
            .field("channels", &self.channels.iter().map(|(c, _)| *c).collect::<Vec<_>>())
            .field("monitors", &self.monitors.keys().collect::<Vec<_>>())
            .field("penalizers", &self.penalizers)
            .finish()
    }
}
