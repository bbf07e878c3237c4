//! Stateless sorters and filters.

use std::collections::HashSet;
use std::time::Duration;

use super::PathProcessor;
use crate::path::{PathMetadata, PathSet};
use crate::types::ProcessContext;

/// Sorts by hop count, fewest first. Stable.
#[derive(Debug, Default, Clone, Copy)]
pub struct HopPathSorter;

impl PathProcessor for HopPathSorter {
    fn process(&self, mut paths: PathSet, _context: ProcessContext) -> PathSet {
        paths.sort_by_key(crate::path::Path::hops);
        paths
    }

    fn name(&self) -> &str {
        "Hop Count"
    }
}

/// Sorts by the static latency advertised in path metadata. Paths without
/// metadata count as zero latency.
#[derive(Debug, Default, Clone, Copy)]
pub struct LatencyPathSorter;

impl PathProcessor for LatencyPathSorter {
    fn process(&self, mut paths: PathSet, _context: ProcessContext) -> PathSet {
        paths.sort_by_cached_key(|p| {
            p.metadata()
                .map_or(Duration::ZERO, |m| m.path_latency())
        });
        paths
    }

    fn name(&self) -> &str {
        "Latency"
    }
}

/// Moves paths over labelled (traffic controlled) links to the back.
#[derive(Debug, Default, Clone, Copy)]
pub struct LabeledLinkSorter;

impl PathProcessor for LabeledLinkSorter {
    fn process(&self, mut paths: PathSet, _context: ProcessContext) -> PathSet {
        paths.sort_by_cached_key(|p| p.metadata().map_or(0, |m| m.labeled_links()));
        paths
    }

    fn name(&self) -> &str {
        "No Labeled Links"
    }
}

/// Which end of the path [`InterfaceFilter`] inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceSide {
    /// Egress interface of the first link.
    First,
    /// Ingress interface of the last link.
    Last,
}

/// Keeps only paths leaving (or entering) through one of a fixed set of
/// interfaces. Used to pin both peers of a test setup onto the same links.
///
/// If any path lacks metadata the input is returned unchanged, since the
/// filter cannot be evaluated consistently.
#[derive(Debug, Clone)]
pub struct InterfaceFilter {
    side: InterfaceSide,
    allowed: HashSet<u64>,
}

impl InterfaceFilter {
    pub fn new(side: InterfaceSide, allowed: impl IntoIterator<Item = u64>) -> Self {
        Self {
            side,
            allowed: allowed.into_iter().collect(),
        }
    }

    fn interface(&self, meta: &PathMetadata) -> Option<u64> {
        match self.side {
            InterfaceSide::First => meta.links.first().map(|l| l.from_interface),
            InterfaceSide::Last => meta.links.last().map(|l| l.to_interface),
        }
    }
}

impl PathProcessor for InterfaceFilter {
    fn process(&self, paths: PathSet, _context: ProcessContext) -> PathSet {
        if paths.is_empty() || self.allowed.is_empty() {
            return paths;
        }
        if paths.iter().any(|p| !p.has_metadata()) {
            tracing::debug!(count = paths.len(), "Interface filter skipped, metadata missing");
            return paths;
        }

        paths
            .into_iter()
            .filter(|p| {
                p.metadata()
                    .and_then(|m| self.interface(&m))
                    .is_some_and(|ifid| self.allowed.contains(&ifid))
            })
            .collect()
    }

    fn name(&self) -> &str {
        "Interface Filter"
    }
}
