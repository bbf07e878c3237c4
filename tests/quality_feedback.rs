//! Call quality feedback between two peers.
//!
//! The sending peer runs a call quality monitor on its connection; its
//! datagrams are carried by hand into the receiving peer's session, whose
//! channel penalizers steer that peer's outbound paths.

mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use pathsteer::config::{Config, PenaltyConfig, QualityConfig};
use pathsteer::connection::{ConnectionOptions, PathAwareConnection};
use pathsteer::path::Path;
use pathsteer::protocol::{PenaltyBatch, PenaltyNotification, PenaltySequence};
use pathsteer::quality::{CallQualityMonitor, Penalty};
use pathsteer::session::CallPathSession;
use pathsteer::transport::{LoopbackTransport, Message};
use pathsteer::types::{ChannelType, Toggle};

use common::{loopback, three_paths};

const FREEZE: Penalty = Penalty::critical(0.4, "Freezes");

struct Peers {
    paths: Vec<Path>,
    sender_transport: Arc<LoopbackTransport>,
    _sender: Arc<PathAwareConnection>,
    monitor: Arc<CallQualityMonitor>,
    receiver: CallPathSession,
}

fn peers() -> Peers {
    let paths = three_paths();

    let sender_transport = loopback(paths.clone());
    let sender = PathAwareConnection::new(sender_transport.clone(), Vec::new(), ConnectionOptions::default());
    let monitor = CallQualityMonitor::new(
        ChannelType::Video,
        QualityConfig::default(),
        PenaltyConfig::default(),
        PenaltySequence::new(),
    );
    monitor.set_sending_toggle(Toggle::new(true));
    monitor.set_notifier(&sender);
    monitor.set_current_paths(vec![paths[0].clone()]);

    let mut config = Config::default();
    config.probing.start_paused = true;
    let receiver = CallPathSession::builder()
        .config(config)
        .channel(ChannelType::Video, loopback(paths.clone()))
        .build();

    Peers {
        paths,
        sender_transport,
        _sender: sender,
        monitor,
        receiver,
    }
}

impl Peers {
    fn video(&self) -> Arc<PathAwareConnection> {
        Arc::clone(&self.receiver.connections(ChannelType::Video)[0])
    }

    fn weight(&self, path: &Path) -> f64 {
        self.receiver.penalizers().weight(ChannelType::Video, path)
    }

    /// Carry everything the sender sent so far to the receiver.
    fn transfer(&self) -> usize {
        let video = self.video();
        let sent = self.sender_transport.take_sent();
        for datagram in &sent {
            let message = Message::new(datagram.payload.clone()).with_reply_path(datagram.used_path.clone());
            assert!(video.handle_incoming(message).is_none());
        }
        sent.len()
    }

    /// Apply one penalty and let resends and the receive window run out.
    async fn penalize_once(&self) -> bool {
        let sent = self.monitor.apply(&[FREEZE], None);
        tokio::time::sleep(Duration::from_millis(300)).await;
        self.transfer();
        tokio::time::sleep(Duration::from_millis(600)).await;
        sent
    }
}

#[tokio::test(start_paused = true)]
async fn test_penalty_moves_peer_off_path() {
    let peers = peers();
    let video = peers.video();
    assert_eq!(video.effective_path(), Some(peers.paths[0].clone()));

    assert!(peers.monitor.apply(&[FREEZE], None));
    tokio::time::sleep(Duration::from_millis(300)).await;
    // First send plus two resends, all carrying the same batch
    assert_eq!(peers.transfer(), 3);
    tokio::time::sleep(Duration::from_millis(600)).await;

    // Resends carry the same sequence id and are applied once
    assert!((peers.weight(&peers.paths[0]) - 0.4).abs() < 1e-9);
    assert_ne!(video.effective_path(), Some(peers.paths[0].clone()));
    assert_eq!(peers.receiver.receiver().last_known_seq(), 1);

    let history = peers.receiver.failover_history(ChannelType::Video).unwrap();
    assert_eq!(history.processor().references()[0].0, peers.paths[0]);
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_penalizes_current_peer_path() {
    // Heuristic: once penalties repeat, the sender stops naming paths and the
    // receiver penalizes whatever it currently uses, here a path the sender
    // never complained about.
    let peers = peers();
    let video = peers.video();

    assert!(peers.penalize_once().await);
    assert!(peers.penalize_once().await);
    assert!((peers.weight(&peers.paths[0]) - 0.8).abs() < 1e-9);

    let current = video.effective_path().unwrap();
    assert_ne!(current, peers.paths[0]);
    assert!(peers.weight(&current).abs() < f64::EPSILON);

    assert!(peers.penalize_once().await);
    assert!((peers.weight(&current) - 0.4).abs() < 1e-9);
    assert!((peers.weight(&peers.paths[0]) - 0.8).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_repeats_stop_after_limit() {
    let peers = peers();
    let mut sent = Vec::new();
    for _ in 0..7 {
        sent.push(peers.penalize_once().await);
    }
    assert_eq!(sent, vec![true, true, true, true, true, false, false]);
    assert_eq!(peers.receiver.receiver().last_known_seq(), 5);

    // A reward starts over once the grace period is past
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(peers.monitor.apply(&[Penalty::non_critical(-0.1, "Low Freezes")], None));
    assert_eq!(peers.monitor.repeat_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_out_of_order_batches_apply_once_in_order() {
    let peers = peers();
    let video = peers.video();

    let applied = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&applied);
    let _l = peers
        .receiver
        .receiver()
        .notifications()
        .listen(move |n: &PenaltyNotification| sink.lock().push(n.weight));

    let batch = |seq: u32| {
        let entry = PenaltyNotification::for_path(f64::from(seq) / 10.0, ChannelType::Video, &peers.paths[2]);
        Message::new(PenaltyBatch::new(seq, vec![entry]).encode().unwrap())
    };

    video.handle_incoming(batch(2));
    tokio::time::sleep(Duration::from_millis(600)).await;
    applied.lock().clear();

    for seq in [3, 1, 2, 5, 4] {
        assert!(video.handle_incoming(batch(seq)).is_none());
    }
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(*applied.lock(), vec![0.3, 0.4, 0.5]);
    // 0.2 + 0.3 + 0.4 + 0.5
    assert!((peers.weight(&peers.paths[2]) - 1.4).abs() < 1e-9);
}
