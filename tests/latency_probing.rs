//! Latency probing over an in-process transport.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use pathsteer::config::ProbingConfig;
use pathsteer::connection::{ConnectionOptions, PathAwareConnection};
use pathsteer::path::Path;
use pathsteer::processor::{LatencyProbingPathProcessor, Stage};
use pathsteer::transport::{EchoProfile, LoopbackTransport, Message};
use pathsteer::types::Toggle;

use common::loopback;

struct Probed {
    transport: Arc<LoopbackTransport>,
    connection: Arc<PathAwareConnection>,
    prober: Arc<LatencyProbingPathProcessor>,
    paused: Toggle,
    _unconsumed: mpsc::UnboundedReceiver<Message>,
}

fn probed(paths: &[(Path, EchoProfile)]) -> Probed {
    let transport = loopback(paths.iter().map(|(p, _)| p.clone()).collect());
    for (path, profile) in paths {
        transport.set_echo(path, *profile);
    }

    let paused = Toggle::new(false);
    let prober = Arc::new(LatencyProbingPathProcessor::with_pause_toggle(
        ProbingConfig::default(),
        paused.clone(),
    ));
    let inbound = transport.take_inbound().unwrap();
    let connection = PathAwareConnection::new(
        transport.clone(),
        vec![Stage::Active(prober.clone())],
        ConnectionOptions::new().with_latency_probing(true),
    );
    let unconsumed = connection.listen(inbound);

    Probed {
        transport,
        connection,
        prober,
        paused,
        _unconsumed: unconsumed,
    }
}

fn rtt(ms: u64) -> EchoProfile {
    EchoProfile::new(Duration::from_millis(ms))
}

#[tokio::test(start_paused = true)]
async fn test_loss_ratio_ranks_paths() {
    let a = Path::new("a", 2);
    let b = Path::new("b", 1);
    let c = Path::new("c", 1);
    let d = Path::new("d", 3);

    let p = probed(&[
        (c.clone(), rtt(20).with_loss(0.6)),
        (b.clone(), rtt(20).with_loss(7.0 / 15.0)),
        (d.clone(), rtt(40)),
        (a.clone(), rtt(20)),
    ]);
    let mut completed = p.prober.completed().subscribe();

    tokio::time::timeout(Duration::from_secs(10), completed.recv())
        .await
        .unwrap()
        .unwrap();

    // Equal average latency, but B lost probes
    assert!(p.prober.score(&a) < p.prober.score(&b));
    assert!((p.prober.score(&a) - 0.020).abs() < 1e-3);
    assert!(p.prober.score(&d) < p.prober.score(&b));
    // At least half lost: no score at all
    assert!(p.prober.score(&c).is_infinite());

    assert_eq!(p.connection.effective_path(), Some(a.clone()));
    assert_eq!(p.transport.ordering(), vec![a, d, b, c]);
}

#[tokio::test(start_paused = true)]
async fn test_pause_and_close_stop_sending() {
    let a = Path::new("a", 1);
    let p = probed(&[(a.clone(), rtt(10))]);
    let mut completed = p.prober.completed().subscribe();

    tokio::time::timeout(Duration::from_secs(10), completed.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(!p.transport.take_sent().is_empty());

    // Paused: the scheduler keeps ticking but nothing goes out
    p.paused.set(true);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(p.transport.take_sent().is_empty());
    assert!(completed.try_recv().is_err());

    // Resumed rounds probe again until the connection closes
    p.paused.set(false);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!p.transport.take_sent().is_empty());

    p.connection.close();
    tokio::time::sleep(Duration::from_secs(1)).await;
    p.transport.take_sent();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(p.transport.take_sent().is_empty());
}
