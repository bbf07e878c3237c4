//! In-process transport.
//!
//! Records every datagram sent and can play the remote peer for latency
//! probes: requests sent over a path with an [`EchoProfile`] come back as
//! responses after the profile's round trip time, with a deterministic share
//! of them dropped. Used by the simulation command and the tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};

use super::{Message, PathTransport, SendOutcome};
use crate::error::{Error, ProtocolError, Result, TransportError};
use crate::path::{Path, PathSet};
use crate::protocol::{ControlCodec, ControlMessage, ProbeMessage};
use crate::types::Endpoint;

/// Simulated behaviour of one path towards probes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EchoProfile {
    pub rtt: Duration,
    /// Fraction of probes lost, in `[0, 1]`.
    pub loss_ratio: f64,
}

impl EchoProfile {
    pub fn new(rtt: Duration) -> Self {
        Self { rtt, loss_ratio: 0.0 }
    }

    pub fn with_loss(mut self, loss_ratio: f64) -> Self {
        self.loss_ratio = loss_ratio.clamp(0.0, 1.0);
        self
    }
}

/// A datagram handed to the transport.
#[derive(Debug, Clone)]
pub struct SentDatagram {
    pub payload: Bytes,
    /// Path the caller pinned, if any.
    pub pinned: Option<Path>,
    pub used_path: Path,
}

#[derive(Default)]
struct LoopbackState {
    paths: PathSet,
    ordering: PathSet,
    sent: Vec<SentDatagram>,
    echo: HashMap<Path, EchoProfile>,
    loss_credit: HashMap<Path, f64>,
}

/// Transport that loops probe traffic back locally.
pub struct LoopbackTransport {
    local: Endpoint,
    remote: Endpoint,
    codec: Mutex<ControlCodec>,
    state: Mutex<LoopbackState>,
    failing: AtomicBool,
    closed: AtomicBool,
    inbound_tx: mpsc::UnboundedSender<Message>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
}

impl LoopbackTransport {
    pub fn new(local: Endpoint, remote: Endpoint) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            local,
            remote,
            codec: Mutex::new(ControlCodec::new()),
            state: Mutex::new(LoopbackState::default()),
            failing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        }
    }

    /// Reject datagrams larger than `mtu`.
    pub fn with_mtu(self, mtu: usize) -> Self {
        *self.codec.lock() = ControlCodec::with_max_datagram(mtu);
        self
    }

    pub fn with_paths(self, paths: PathSet) -> Self {
        self.set_paths(paths);
        self
    }

    /// Replace the candidate paths. The ranked order is reset.
    pub fn set_paths(&self, paths: PathSet) {
        let mut state = self.state.lock();
        state.ordering.clear();
        state.paths = paths;
    }

    /// Answer probes sent over `path`.
    pub fn set_echo(&self, path: &Path, profile: EchoProfile) {
        let mut state = self.state.lock();
        state.echo.insert(path.clone(), profile);
        state.loss_credit.remove(path);
    }

    /// Make every send fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Ranked order last installed by the connection.
    pub fn ordering(&self) -> PathSet {
        self.state.lock().ordering.clone()
    }

    pub fn sent(&self) -> Vec<SentDatagram> {
        self.state.lock().sent.clone()
    }

    pub fn take_sent(&self) -> Vec<SentDatagram> {
        std::mem::take(&mut self.state.lock().sent)
    }

    /// Receiver of datagrams coming back from the simulated peer. Can be taken
    /// once.
    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.inbound_rx.lock().take()
    }

    /// Inject a datagram as if it came from the peer.
    pub fn deliver(&self, message: Message) {
        // Receiver dropped means nobody listens anymore
        let _ = self.inbound_tx.send(message);
    }

    fn echo(&self, path: &Path, id: u64) {
        let profile = {
            let mut state = self.state.lock();
            let Some(profile) = state.echo.get(path).copied() else {
                return;
            };

            let credit = state.loss_credit.entry(path.clone()).or_insert(0.0);
            *credit += profile.loss_ratio;
            if *credit >= 1.0 - f64::EPSILON {
                *credit -= 1.0;
                return;
            }
            profile
        };

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let tx = self.inbound_tx.clone();
        let mut frame = BytesMut::new();
        let response = ControlMessage::Probe(ProbeMessage::Response(id));
        if let Err(e) = self.codec.lock().encode(response, &mut frame) {
            tracing::debug!(error = %e, "Failed to frame probe response");
            return;
        }
        let message = Message::new(frame.freeze())
            .with_source(self.remote)
            .with_reply_path(path.clone());
        handle.spawn(async move {
            tokio::time::sleep(profile.rtt).await;
            let _ = tx.send(message);
        });
    }
}

impl PathTransport for LoopbackTransport {
    fn local_endpoint(&self) -> Endpoint {
        self.local
    }

    fn remote_endpoint(&self) -> Endpoint {
        self.remote
    }

    fn current_paths(&self) -> PathSet {
        self.state.lock().paths.clone()
    }

    fn chosen_path(&self) -> Option<Path> {
        let state = self.state.lock();
        state.ordering.first().or_else(|| state.paths.first()).cloned()
    }

    fn apply_ordering(&self, ranked: &[Path]) {
        self.state.lock().ordering = ranked.to_vec();
    }

    fn send(&self, payload: &[u8], path: Option<&Path>) -> Result<SendOutcome> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed.into());
        }
        if self.failing.load(Ordering::Relaxed) {
            return Err(TransportError::WriteFailed("simulated failure".to_string()).into());
        }
        let frame = self.codec.lock().decode(&mut BytesMut::from(payload));
        let control = match frame {
            Ok(control) => control,
            Err(Error::Protocol(ProtocolError::PayloadTooLarge { size, max })) => {
                return Err(TransportError::MtuExceeded { size, max }.into());
            }
            Err(e) => {
                tracing::trace!(error = %e, "Sending unclassified datagram");
                None
            }
        };

        let used = match path {
            Some(p) => p.clone(),
            None => self
                .chosen_path()
                .ok_or_else(|| TransportError::NoPathToDestination(self.remote.to_string()))?,
        };

        self.state.lock().sent.push(SentDatagram {
            payload: Bytes::copy_from_slice(payload),
            pinned: path.cloned(),
            used_path: used.clone(),
        });

        if let Some(ControlMessage::Probe(ProbeMessage::Request(id))) = control {
            self.echo(&used, id);
        }

        Ok(SendOutcome {
            used_path: Some(used),
            bytes: payload.len(),
        })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> (Endpoint, Endpoint) {
        (
            "1-ff00:0:110,127.0.0.1:4000".parse().unwrap(),
            "1-ff00:0:112,127.0.0.1:5000".parse().unwrap(),
        )
    }

    #[test]
    fn test_send_uses_ordering() {
        let (local, remote) = endpoints();
        let a = Path::new("a", 1);
        let b = Path::new("b", 1);
        let transport = LoopbackTransport::new(local, remote).with_paths(vec![a.clone(), b.clone()]);

        assert_eq!(transport.chosen_path(), Some(a));
        transport.apply_ordering(&[b.clone()]);
        let outcome = transport.send(b"x", None).unwrap();
        assert_eq!(outcome.used_path, Some(b));
        assert_eq!(outcome.bytes, 1);
    }

    #[test]
    fn test_send_errors() {
        let (local, remote) = endpoints();
        let transport = LoopbackTransport::new(local, remote);
        assert!(transport.send(b"x", None).unwrap_err().is_recoverable());

        transport.set_paths(vec![Path::new("a", 1)]);
        transport.set_failing(true);
        assert!(transport.send(b"x", None).is_err());

        transport.set_failing(false);
        transport.close();
        assert!(transport.send(b"x", None).unwrap_err().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_echo_with_loss() {
        let (local, remote) = endpoints();
        let path = Path::new("a", 1);
        let transport = LoopbackTransport::new(local, remote).with_paths(vec![path.clone()]);
        transport.set_echo(&path, EchoProfile::new(Duration::from_millis(20)).with_loss(0.5));
        let mut inbound = transport.take_inbound().unwrap();

        for id in 1..=4 {
            transport
                .send(&ProbeMessage::Request(id).encode(), Some(&path))
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut ids = Vec::new();
        while let Ok(message) = inbound.try_recv() {
            if let Ok(Some(ProbeMessage::Response(id))) = ProbeMessage::decode(&message.payload) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_frames_checked_against_mtu() {
        let (local, remote) = endpoints();
        let path = Path::new("a", 1);
        let transport = LoopbackTransport::new(local, remote)
            .with_mtu(4)
            .with_paths(vec![path.clone()]);

        let err = transport.send(b"too long", None).unwrap_err();
        assert!(matches!(
            err,
            Error::Transport(TransportError::MtuExceeded { size: 8, max: 4 })
        ));

        // Not a valid probe, still delivered as plain data
        assert!(transport.send(b"0x69", Some(&path)).is_ok());
        assert_eq!(transport.take_sent().len(), 1);
    }
}
