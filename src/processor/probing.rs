//! Active latency probing.
//!
//! The prober binds to one connection and periodically sends bursts of probe
//! requests over every known path. Round trip samples, with timeouts folded
//! in as losses, give each path an overall score; paths are ranked by
//! `(score, hops, short canonical fingerprint)` with unscored paths last.
//!
//! Rounds run on a dedicated tokio task fed by a command channel, so probe
//! scheduling never runs on the caller of [`PathProcessor::process`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{ActivePathProcessor, PathProcessor};
use crate::config::ProbingConfig;
use crate::connection::PathAwareConnection;
use crate::events::EventSource;
use crate::path::{Path, PathSet};
use crate::protocol::ProbeMessage;
use crate::transport::Message;
use crate::types::{ProcessContext, Toggle};

/// One round trip sample; `None` is a loss.
pub type ProbeSample = Option<Duration>;

/// Measurement history and score of one path.
#[derive(Debug, Clone, Default)]
pub struct ProbeResult {
    samples: VecDeque<ProbeSample>,
    score_ms: Option<u64>,
}

impl ProbeResult {
    pub fn samples(&self) -> impl Iterator<Item = &ProbeSample> {
        self.samples.iter()
    }

    /// Overall score in milliseconds, `None` if the path has no valid score.
    pub fn score_ms(&self) -> Option<u64> {
        self.score_ms
    }

    pub fn losses(&self) -> usize {
        self.samples.iter().filter(|s| s.is_none()).count()
    }

    fn push(&mut self, sample: ProbeSample, capacity: usize) {
        self.samples.push_back(sample);
        while self.samples.len() > capacity {
            self.samples.pop_front();
        }
    }

    fn update_score(&mut self) {
        self.score_ms = overall_score(self.samples.iter());
    }
}

/// Score over a full history.
///
/// At least half of the samples lost means no score. Otherwise the sum of the
/// valid round trip times is divided by `valid - losses` (at least 1), so
/// losses inflate the score even at equal mean latency.
pub fn overall_score<'a>(samples: impl IntoIterator<Item = &'a ProbeSample>) -> Option<u64> {
    let (count, losses, sum) = tally(samples);
    if count == 0 || losses as f64 / count as f64 >= 0.5 {
        return None;
    }

    let valid = count - losses;
    let divisor = valid.saturating_sub(losses).max(1);
    Some((sum / divisor as f64 * 1000.0).round() as u64)
}

/// Score of a single burst, for diagnostics:
/// `(n + losses^2) / n * mean_valid`, in milliseconds.
pub fn burst_score<'a>(samples: impl IntoIterator<Item = &'a ProbeSample>) -> Option<u64> {
    let (count, losses, sum) = tally(samples);
    let valid = count - losses;
    if valid == 0 {
        return None;
    }

    let inflation = (count + losses * losses) as f64 / count as f64;
    Some((inflation * (sum / valid as f64) * 1000.0).round() as u64)
}

fn tally<'a>(samples: impl IntoIterator<Item = &'a ProbeSample>) -> (usize, usize, f64) {
    samples
        .into_iter()
        .fold((0, 0, 0.0), |(count, losses, sum), sample| match sample {
            Some(rtt) => (count + 1, losses, sum + rtt.as_secs_f64()),
            None => (count + 1, losses + 1, sum),
        })
}

#[derive(Default)]
struct ProbeState {
    results: HashMap<Path, ProbeResult>,
    /// Known paths in canonical order.
    paths: PathSet,
    mask: HashSet<Path>,
    probing: bool,
    wants_again: bool,
    first_round: bool,
    registered: usize,
    timeouts: usize,
}

impl ProbeState {
    fn probe_targets(&self) -> PathSet {
        if self.mask.is_empty() {
            return self.paths.clone();
        }
        self.paths.iter().filter(|p| self.mask.contains(*p)).cloned().collect()
    }
}

struct ProberShared {
    config: ProbingConfig,
    state: Mutex<ProbeState>,
    probe_table: Mutex<HashMap<u64, (Path, Instant)>>,
    next_probe_id: AtomicU64,
    connection: RwLock<Option<Weak<PathAwareConnection>>>,
    commands: Mutex<Option<mpsc::UnboundedSender<()>>>,
    ordering_changed: EventSource<ProcessContext>,
    completed: EventSource<()>,
    paused: Toggle,
    cancel: CancellationToken,
}

/// Ranks paths by actively measured round trip time.
pub struct LatencyProbingPathProcessor {
    shared: Arc<ProberShared>,
}

impl LatencyProbingPathProcessor {
    /// Prober with its own pause switch, initially `config.start_paused`.
    pub fn new(config: ProbingConfig) -> Self {
        let paused = Toggle::new(config.start_paused);
        Self::with_pause_toggle(config, paused)
    }

    /// Prober paused and resumed through the process-wide switch
    /// ([`Toggle::probing_paused`]).
    pub fn with_global_pause(config: ProbingConfig) -> Self {
        Self::with_pause_toggle(config, Toggle::probing_paused())
    }

    pub fn with_pause_toggle(config: ProbingConfig, paused: Toggle) -> Self {
        Self {
            shared: Arc::new(ProberShared {
                config,
                state: Mutex::new(ProbeState {
                    first_round: true,
                    ..ProbeState::default()
                }),
                probe_table: Mutex::new(HashMap::new()),
                next_probe_id: AtomicU64::new(0),
                connection: RwLock::new(None),
                commands: Mutex::new(None),
                ordering_changed: EventSource::new(),
                completed: EventSource::new(),
                paused,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Fires after every completed round.
    pub fn completed(&self) -> &EventSource<()> {
        &self.shared.completed
    }

    /// Restrict probing to `paths`. An empty mask probes everything.
    pub fn set_path_mask(&self, paths: impl IntoIterator<Item = Path>) {
        self.shared.state.lock().mask = paths.into_iter().collect();
    }

    /// Request a round now. Coalesced with a round already in flight.
    pub fn probe_now(&self) {
        self.shared.request_probe();
    }

    /// Switch that pauses this prober.
    pub fn pause_toggle(&self) -> &Toggle {
        &self.shared.paused
    }

    pub fn is_bound(&self) -> bool {
        self.shared.bound_connection().is_some()
    }

    /// Overall score in seconds, infinite if the path has none.
    pub fn score(&self, path: &Path) -> f64 {
        self.shared
            .state
            .lock()
            .results
            .get(path)
            .and_then(ProbeResult::score_ms)
            .map_or(f64::INFINITY, |ms| ms as f64 / 1000.0)
    }

    /// Samples of the latest burst.
    pub fn most_recent_measurements(&self, path: &Path) -> Vec<ProbeSample> {
        let burst = self.shared.config.burst_size;
        self.shared
            .state
            .lock()
            .results
            .get(path)
            .map(|r| {
                let skip = r.samples.len().saturating_sub(burst);
                r.samples.iter().skip(skip).copied().collect()
            })
            .unwrap_or_default()
    }

    /// Burst score of the latest burst.
    pub fn most_recent_score(&self, path: &Path) -> Option<Duration> {
        burst_score(self.most_recent_measurements(path).iter()).map(Duration::from_millis)
    }

    /// Snapshot of all measurement results.
    pub fn results(&self) -> HashMap<Path, ProbeResult> {
        self.shared.state.lock().results.clone()
    }

    pub(crate) fn register_sample(&self, path: &Path, sample: ProbeSample) {
        self.shared.register(path, sample);
    }

    pub(crate) fn finish_round(&self) {
        self.shared.complete_round();
    }
}

impl Default for LatencyProbingPathProcessor {
    fn default() -> Self {
        Self::new(ProbingConfig::default())
    }
}

impl Drop for LatencyProbingPathProcessor {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl ProberShared {
    fn bound_connection(&self) -> Option<Arc<PathAwareConnection>> {
        self.connection.read().as_ref().and_then(Weak::upgrade)
    }

    fn request_probe(&self) {
        {
            let mut state = self.state.lock();
            if state.probing {
                tracing::debug!("Probe round in progress, deferring");
                state.wants_again = true;
                return;
            }
        }
        if let Some(commands) = self.commands.lock().as_ref() {
            // Task gone means the prober is shutting down
            let _ = commands.send(());
        }
    }

    fn spawn_task(self: &Arc<Self>) {
        let mut commands = self.commands.lock();
        if commands.is_some() {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No tokio runtime, latency probing disabled");
            return;
        };

        let (tx, rx) = mpsc::unbounded_channel();
        *commands = Some(tx);
        handle.spawn(Arc::clone(self).run(rx));
    }

    async fn run(self: Arc<Self>, mut commands: mpsc::UnboundedReceiver<()>) {
        let mut next_round: Option<Instant> = None;

        loop {
            let timer = async move {
                match next_round {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                () = self.cancel.cancelled() => break,
                command = commands.recv() => {
                    if command.is_none() {
                        break;
                    }
                }
                () = timer => {}
            }
            while commands.try_recv().is_ok() {}

            next_round = self.round().await;
        }

        tracing::debug!("Latency prober stopped");
    }

    /// Run one probe round. Returns when the next round is due.
    async fn round(&self) -> Option<Instant> {
        let config = &self.config;

        if self.paused.get() {
            return Some(Instant::now() + config.reprobe_interval);
        }

        let targets = {
            let mut state = self.state.lock();
            let targets = state.probe_targets();
            if targets.is_empty() {
                tracing::debug!("No paths to probe");
                return None;
            }
            state.probing = true;
            state.registered = 0;
            state.timeouts = 0;
            targets
        };

        tracing::debug!(paths = targets.len(), burst = config.burst_size, "Starting probe round");
        let total = config.burst_size * targets.len();

        for sent in 0..total {
            let path = &targets[sent % targets.len()];

            let connection = match self.bound_connection() {
                Some(c) if !c.is_closed() => c,
                _ => {
                    tracing::info!("Connection closed, stopping latency probing");
                    self.probe_table.lock().clear();
                    self.state.lock().probing = false;
                    return None;
                }
            };

            let id = self.next_probe_id.fetch_add(1, Ordering::Relaxed) + 1;
            let request = ProbeMessage::Request(id).encode();
            self.probe_table.lock().insert(id, (path.clone(), Instant::now()));

            if let Err(e) = connection.send(&request, Some(path)) {
                self.probe_table.lock().remove(&id);
                tracing::warn!(path = %path.display_id(), error = %e, "Failed to send probe");
            }
            drop(connection);

            if sent + 1 < total {
                tokio::time::sleep(config.inter_probe_interval).await;
            }
        }

        tokio::time::sleep(config.timeout).await;

        let outstanding: Vec<Path> = self.probe_table.lock().drain().map(|(_, (path, _))| path).collect();
        {
            let mut state = self.state.lock();
            state.timeouts += outstanding.len();
        }
        for path in &outstanding {
            self.register(path, None);
        }

        let again = self.complete_round();
        let delay = if again { Duration::ZERO } else { config.reprobe_interval };
        Some(Instant::now() + delay)
    }

    /// Recompute scores and announce the round. Returns whether another
    /// round was requested meanwhile.
    fn complete_round(&self) -> bool {
        let (again, timeouts, probed) = {
            let mut state = self.state.lock();
            for result in state.results.values_mut() {
                result.update_score();
            }
            state.first_round = false;
            state.probing = false;
            let probed = state.probe_targets().len();
            (std::mem::take(&mut state.wants_again), state.timeouts, probed)
        };

        let total = (self.config.burst_size * probed).max(1);
        tracing::info!(
            timeouts,
            timeout_rate = timeouts as f64 / total as f64,
            "Probe round complete"
        );

        self.ordering_changed.emit(ProcessContext::ROUTINE);
        self.completed.emit(());
        again
    }

    fn register(&self, path: &Path, sample: ProbeSample) {
        let capacity = self.config.burst_size * 2;
        let emit = {
            let mut state = self.state.lock();
            let first_round = state.first_round;

            let result = state.results.entry(path.clone()).or_default();
            result.push(sample, capacity);
            if first_round {
                result.update_score();
            }

            state.registered += 1;
            first_round && state.registered % self.config.first_round_emit_every.max(1) == 0
        };

        if emit {
            self.ordering_changed.emit(ProcessContext::ROUTINE);
        }
    }

    fn handle_response(&self, id: u64) {
        let Some((path, sent)) = self.probe_table.lock().remove(&id) else {
            tracing::debug!(id, "Unexpected probe response");
            return;
        };
        self.register(&path, Some(Instant::now().saturating_duration_since(sent)));
    }
}

impl PathProcessor for LatencyProbingPathProcessor {
    fn process(&self, paths: PathSet, _context: ProcessContext) -> PathSet {
        let mut canonical = paths.clone();
        canonical.sort_by(|a, b| a.canonical_fingerprint().cmp(b.canonical_fingerprint()));

        let changed = {
            let mut state = self.shared.state.lock();
            let changed = state.paths.len() != canonical.len()
                || state
                    .paths
                    .iter()
                    .zip(&canonical)
                    .any(|(a, b)| a.fingerprint() != b.fingerprint());
            if changed {
                state.paths = canonical;
            }
            changed
        };
        if changed && self.is_bound() {
            self.shared.request_probe();
        }

        let state = self.shared.state.lock();
        let mut ranked = paths;
        ranked.sort_by_cached_key(|p| {
            let score = state.results.get(p).and_then(ProbeResult::score_ms);
            (
                score.unwrap_or(u64::MAX),
                p.hops(),
                p.canonical_fingerprint_short().to_string(),
            )
        });
        ranked
    }

    fn name(&self) -> &str {
        "Latency Probing"
    }
}

impl ActivePathProcessor for LatencyProbingPathProcessor {
    fn ordering_changed(&self) -> &EventSource<ProcessContext> {
        &self.shared.ordering_changed
    }

    /// Bind to `connection` if it wants latency probing.
    ///
    /// # Panics
    ///
    /// If the prober is already bound to a connection whose local or remote
    /// endpoint lies in a different AS.
    fn connect(&self, connection: &Arc<PathAwareConnection>) {
        if !connection.wants_latency_probing() {
            return;
        }

        {
            let mut slot = self.shared.connection.write();
            if let Some(existing) = slot.as_ref().and_then(Weak::upgrade) {
                assert!(
                    !existing.local_endpoint().is_foreign_to(&connection.local_endpoint())
                        && !existing.remote_endpoint().is_foreign_to(&connection.remote_endpoint()),
                    "latency prober already bound to {} -> {}, cannot bind to {} -> {}",
                    existing.local_endpoint(),
                    existing.remote_endpoint(),
                    connection.local_endpoint(),
                    connection.remote_endpoint(),
                );
                return;
            }
            *slot = Some(Arc::downgrade(connection));
        }

        tracing::debug!(remote = %connection.remote_endpoint(), "Latency prober bound");
        self.shared.spawn_task();
        self.shared.request_probe();
    }

    fn handle_receive(&self, message: &Message, connection: &PathAwareConnection) -> bool {
        let Some(bound) = self.shared.bound_connection() else {
            return true;
        };
        if !std::ptr::eq(Arc::as_ptr(&bound), connection) {
            return true;
        }

        match ProbeMessage::decode(&message.payload) {
            Ok(Some(ProbeMessage::Response(id))) => {
                self.shared.handle_response(id);
                false
            }
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to decode probe response");
                false
            }
        }
    }
}

// Intentionally abbreviated Debug output - measurement tables are large
#[allow(clippy::missing_fields_in_debug)]
impl fmt::Debug for LatencyProbingPathProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("LatencyProbingPathProcessor")
            .field("paths", &state.paths.len())
            .field("probing", &state.probing)
            .field("first_round", &state.first_round)
            .finish()
    }
}
