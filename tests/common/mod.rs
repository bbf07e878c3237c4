//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use pathsteer::path::{LinkMetadata, Path, PathMetadata};
use pathsteer::transport::LoopbackTransport;
use pathsteer::types::{Endpoint, IsdAs};

pub fn endpoint(s: &str) -> Endpoint {
    s.parse().unwrap()
}

pub fn ia(s: &str) -> IsdAs {
    s.parse().unwrap()
}

/// Path over the given `(from_ifid, to_ifid)` links between two fixed ASes.
pub fn path_with_links(fingerprint: &str, links: &[(u64, u64)]) -> Path {
    let links: Vec<_> = links
        .iter()
        .map(|&(from, to)| LinkMetadata::new(ia("1-ff00:0:110"), from, ia("1-ff00:0:111"), to))
        .collect();
    let hops = links.len();
    Path::new(fingerprint, hops).with_metadata(PathMetadata::new(links, 1472))
}

/// Three paths, the first two sharing a link.
pub fn three_paths() -> Vec<Path> {
    vec![
        path_with_links("1-ff00:0:110#1 1-ff00:0:111#1", &[(1, 1), (2, 2)]),
        path_with_links("1-ff00:0:110#1 1-ff00:0:111#3", &[(1, 1), (3, 3)]),
        path_with_links("1-ff00:0:110#4 1-ff00:0:111#5", &[(4, 4), (5, 5)]),
    ]
}

/// Loopback transport between two hosts of the same AS.
pub fn loopback(paths: Vec<Path>) -> Arc<LoopbackTransport> {
    Arc::new(
        LoopbackTransport::new(
            endpoint("1-ff00:0:110,127.0.0.1:4000"),
            endpoint("1-ff00:0:110,127.0.0.1:5000"),
        )
        .with_paths(paths),
    )
}
