//! Path ranking through processor pipelines and connections.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;

use pathsteer::connection::{ConnectionOptions, PathAwareConnection};
use pathsteer::path::Path;
use pathsteer::processor::{
    penalize_bounded, Failover, HopPathSorter, PathPenalizer, PathProcessor, PipelineBuilder,
    Stage, WeightBounds,
};
use pathsteer::types::ProcessContext;

use common::{loopback, three_paths};

#[test]
fn test_hop_sorter_then_penalizer() {
    let p1 = Path::new("aaa", 2);
    let p2 = Path::new("bbb", 3);
    let penalizer = Arc::new(PathPenalizer::new(false));
    let pipeline = PipelineBuilder::new()
        .passive(HopPathSorter)
        .penalizer(penalizer.clone())
        .build();

    let ranked = pipeline.process(vec![p2.clone(), p1.clone()], ProcessContext::ROUTINE);
    assert_eq!(ranked, vec![p1.clone(), p2.clone()]);

    // Keys (0 + 2, 1, 0) and (1 + 0, 0, 1)
    penalizer.set_weight(&p1, 1.0, false);
    let ranked = pipeline.process(vec![p2.clone(), p1.clone()], ProcessContext::ROUTINE);
    assert_eq!(ranked, vec![p2, p1]);
}

#[test]
fn test_penalizer_is_permutation_for_random_weights() {
    let mut rng = rand::thread_rng();

    for round in 0..50 {
        let n = rng.gen_range(0..12);
        let mut paths: Vec<Path> = (0..n).map(|i| Path::new(format!("r{round} p{i}"), 1 + i % 4)).collect();
        paths.shuffle(&mut rng);

        let penalizer = PathPenalizer::new(false);
        for path in &paths {
            if rng.gen_bool(0.6) {
                penalizer.set_weight(path, rng.gen_range(-1.0..3.0), false);
            }
        }

        let first = penalizer.process(paths.clone(), ProcessContext::ROUTINE);
        let second = penalizer.process(paths.clone(), ProcessContext::ROUTINE);
        assert_eq!(first, second);

        let input: HashSet<_> = paths.iter().cloned().collect();
        let output: HashSet<_> = first.iter().cloned().collect();
        assert_eq!(first.len(), paths.len());
        assert_eq!(input, output);
    }
}

#[test]
fn test_reversed_paths_share_identity() {
    let forward = Path::new("1-ff00:0:110#1 1-ff00:0:111#2 1-ff00:0:112", 2);
    let backward = forward.reversed();

    let mut set = HashSet::new();
    set.insert(forward.clone());
    assert!(set.contains(&backward));
    assert!(!set.insert(backward.clone()));

    // A weight set for one direction applies to the other
    let penalizer = PathPenalizer::new(false);
    assert!(penalize_bounded(&penalizer, &forward, 0.5, WeightBounds::default()));
    let ranked = penalizer.process(vec![backward.clone(), Path::new("x", 1)], ProcessContext::ROUTINE);
    assert_eq!(ranked[1], backward);
}

#[test]
fn test_connection_fails_over_on_penalty() {
    let paths = three_paths();
    let transport = loopback(paths.clone());
    let penalizer = Arc::new(PathPenalizer::new(true));
    let connection = PathAwareConnection::new(
        transport.clone(),
        vec![Stage::Penalizer(penalizer.clone())],
        ConnectionOptions::default(),
    );

    let failovers = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&failovers);
    let _l = connection.failovers().listen(move |f: &Failover| sink.lock().push(f.clone()));

    assert_eq!(connection.effective_path(), Some(paths[0].clone()));
    assert!(penalize_bounded(&penalizer, &paths[0], 2.0, WeightBounds::default()));

    assert_eq!(connection.effective_path(), Some(paths[1].clone()));
    assert_eq!(transport.ordering().last(), Some(&paths[0]));
    assert_eq!(
        *failovers.lock(),
        vec![Failover { old: paths[0].clone(), new: paths[1].clone() }]
    );

    // Rewards alone never count as a failover
    assert!(penalize_bounded(&penalizer, &paths[2], -0.5, WeightBounds::default()));
    assert_eq!(failovers.lock().len(), 1);
}

#[test]
fn test_path_down_penalizes_without_failover() {
    let paths = three_paths();
    let connection = PathAwareConnection::new(loopback(paths.clone()), Vec::new(), ConnectionOptions::default());

    let failovers = Arc::new(Mutex::new(0));
    let sink = Arc::clone(&failovers);
    let _l = connection.failovers().listen(move |_| *sink.lock() += 1);

    // Without a runtime the batch is applied right away
    connection.path_down(&paths[0]);
    assert_eq!(connection.effective_path(), Some(paths[1].clone()));
    assert_eq!(*failovers.lock(), 0);
}
