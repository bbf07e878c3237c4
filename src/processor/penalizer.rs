//! Penalty based processors.
//!
//! All penalizers share one ordering rule, [`penalty_order`]: the path at
//! input offset `i` with weight `w` in a set of `n` paths gets the sort key
//! `(i + round(n * w), signum(round(n * w)), i)`. Zero weights keep the input
//! order, positive weights push a path back by roughly `w * n` places and
//! negative weights pull it forward.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};

use super::{ActivePathProcessor, PathProcessor, Penalizer};
use crate::connection::PathAwareConnection;
use crate::events::{EventSource, Listener};
use crate::path::{Path, PathSet};
use crate::types::ProcessContext;

/// Weight per path.
pub type PenaltyWeights = HashMap<Path, f64>;

/// Reorder `paths` by penalty weight.
pub fn penalty_order<F>(paths: PathSet, weight: F) -> PathSet
where
    F: Fn(&Path) -> f64,
{
    let n = paths.len() as f64;

    let mut keyed: Vec<((i64, i64, i64), Path)> = paths
        .into_iter()
        .enumerate()
        .map(|(offset, path)| {
            let penalty = (n * weight(&path)).round() as i64;
            let offset = offset as i64;
            ((offset + penalty, penalty.signum(), offset), path)
        })
        .collect();

    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    keyed.into_iter().map(|(_, path)| path).collect()
}

/// Clamp range for externally driven penalty updates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightBounds {
    pub min: f64,
    pub max: f64,
}

impl Default for WeightBounds {
    fn default() -> Self {
        Self {
            min: crate::MIN_PENALTY_WEIGHT,
            max: crate::MAX_PENALTY_WEIGHT,
        }
    }
}

/// Add `weight` to the penalty of `path`, clamped to `bounds`.
///
/// A positive weight first discards any reward (negative weight) the path had
/// collected. Only positive weights count as failover-worthy. Returns whether
/// the stored weight changed; unchanged weights emit nothing.
pub fn penalize_bounded(
    penalizer: &PathPenalizer,
    path: &Path,
    weight: f64,
    bounds: WeightBounds,
) -> bool {
    penalizer.update(
        |weights| {
            let stored = weights.get(path).copied().unwrap_or(0.0);
            let old = if weight > 0.0 { stored.max(0.0) } else { stored };
            let bounded = (old + weight).clamp(bounds.min, bounds.max);
            if (bounded - stored).abs() < f64::EPSILON {
                return false;
            }

            tracing::debug!(
                path = %path.display_id(),
                weight,
                bounded,
                "Applying penalty"
            );
            weights.insert(path.clone(), bounded);
            true
        },
        weight > 0.0,
    )
}

/// Reorders paths by a mutable map of penalty weights.
pub struct PathPenalizer {
    name: String,
    considers_failover: bool,
    weights: ReentrantMutex<RefCell<PenaltyWeights>>,
    ordering_changed: EventSource<ProcessContext>,
}

impl PathPenalizer {
    pub fn new(considers_failover: bool) -> Self {
        Self::named("Penalizer", considers_failover)
    }

    pub fn named(name: impl Into<String>, considers_failover: bool) -> Self {
        Self {
            name: name.into(),
            considers_failover,
            weights: ReentrantMutex::new(RefCell::new(HashMap::new())),
            ordering_changed: EventSource::new(),
        }
    }

    /// Replace the weight map with `f(current)` and announce the change.
    ///
    /// The change is tagged [`ProcessContext::FAILOVER`] only if this penalizer
    /// considers failovers and the caller marks the mutation as one. `f` may
    /// read weights of this penalizer again.
    pub fn mutate<F>(&self, f: F, counts_as_failover: bool)
    where
        F: FnOnce(PenaltyWeights) -> PenaltyWeights,
    {
        self.update(
            |weights| {
                let current = std::mem::take(weights);
                *weights = f(current);
                true
            },
            counts_as_failover,
        );
    }

    /// Set a single weight.
    pub fn set_weight(&self, path: &Path, weight: f64, counts_as_failover: bool) {
        let path = path.clone();
        self.mutate(
            move |mut weights| {
                weights.insert(path, weight);
                weights
            },
            counts_as_failover,
        );
    }

    /// Snapshot of all weights.
    pub fn weights(&self) -> PenaltyWeights {
        self.weights.lock().borrow().clone()
    }

    fn update<F>(&self, f: F, counts_as_failover: bool) -> bool
    where
        F: FnOnce(&mut PenaltyWeights) -> bool,
    {
        let changed = {
            let guard = self.weights.lock();
            let mut working = guard.borrow().clone();
            let changed = f(&mut working);
            if changed {
                *guard.borrow_mut() = working;
            }
            changed
        };

        if changed {
            let context = if self.considers_failover && counts_as_failover {
                ProcessContext::FAILOVER
            } else {
                ProcessContext::ROUTINE
            };
            self.ordering_changed.emit(context);
        }
        changed
    }
}

impl PathProcessor for PathPenalizer {
    fn process(&self, paths: PathSet, _context: ProcessContext) -> PathSet {
        penalty_order(paths, |p| self.weight(p))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl ActivePathProcessor for PathPenalizer {
    fn ordering_changed(&self) -> &EventSource<ProcessContext> {
        &self.ordering_changed
    }
}

impl Penalizer for PathPenalizer {
    fn weight(&self, path: &Path) -> f64 {
        self.weights.lock().borrow().get(path).copied().unwrap_or(0.0)
    }

    fn considers_failover(&self) -> bool {
        self.considers_failover
    }
}

// Intentionally abbreviated Debug output - the weight map can be large
#[allow(clippy::missing_fields_in_debug)]
impl fmt::Debug for PathPenalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathPenalizer")
            .field("name", &self.name)
            .field("considers_failover", &self.considers_failover)
            .field("entries", &self.weights.lock().borrow().len())
            .finish()
    }
}

/// Penalizes paths by how many links they share with a set of reference
/// paths.
///
/// The weight of a path is the mean over all `(reference, scale)` pairs of
/// `link_overlap(path, reference) * scale`. Paths without metadata, or an
/// empty reference set, give zero.
pub struct OverlapPathProcessor {
    references: Mutex<Vec<(Path, f64)>>,
    ordering_changed: EventSource<ProcessContext>,
    follower: Mutex<Option<Listener>>,
}

impl OverlapPathProcessor {
    pub fn new() -> Self {
        Self {
            references: Mutex::new(Vec::new()),
            ordering_changed: EventSource::new(),
            follower: Mutex::new(None),
        }
    }

    /// Track the effective path of `connection` as the only reference.
    pub fn following(connection: &PathAwareConnection, scale: f64) -> Arc<Self> {
        let this = Arc::new(Self::new());
        let weak: Weak<Self> = Arc::downgrade(&this);

        let listener = connection.effective_path_changes().listen(move |path: &Option<Path>| {
            if let Some(this) = weak.upgrade() {
                this.set_references(path.iter().map(|p| (p.clone(), scale)).collect());
            }
        });
        *this.follower.lock() = Some(listener);

        if let Some(path) = connection.effective_path() {
            this.set_references(vec![(path, scale)]);
        }
        this
    }

    pub fn references(&self) -> Vec<(Path, f64)> {
        self.references.lock().clone()
    }

    /// Replace the reference set. Emits a routine change unless nothing
    /// changed; metadata arriving for a reference counts as a change.
    pub fn set_references(&self, references: Vec<(Path, f64)>) {
        {
            let mut current = self.references.lock();
            let unchanged = current.len() == references.len()
                && references.iter().zip(current.iter()).all(|(new, old)| {
                    (new.1 - old.1).abs() < f64::EPSILON
                        && new.0 == old.0
                        && !(new.0.has_metadata() && !old.0.has_metadata())
                });
            if unchanged {
                return;
            }
            *current = references;
        }
        self.ordering_changed.emit(ProcessContext::ROUTINE);
    }

    /// Append one reference.
    pub fn add_reference(&self, path: Path, scale: f64) {
        self.references.lock().push((path, scale));
        self.ordering_changed.emit(ProcessContext::ROUTINE);
    }
}

impl Default for OverlapPathProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl PathProcessor for OverlapPathProcessor {
    fn process(&self, paths: PathSet, _context: ProcessContext) -> PathSet {
        penalty_order(paths, |p| self.weight(p))
    }

    fn name(&self) -> &str {
        "Overlap"
    }
}

impl ActivePathProcessor for OverlapPathProcessor {
    fn ordering_changed(&self) -> &EventSource<ProcessContext> {
        &self.ordering_changed
    }
}

impl Penalizer for OverlapPathProcessor {
    fn weight(&self, path: &Path) -> f64 {
        let references = self.references.lock();
        let Some(meta) = path.metadata() else {
            return 0.0;
        };
        if references.is_empty() {
            return 0.0;
        }

        let total: f64 = references
            .iter()
            .map(|(reference, scale)| {
                reference.metadata().map_or(0.0, |r| meta.link_overlap(&r)) * scale
            })
            .sum();
        total / references.len() as f64
    }

    fn considers_failover(&self) -> bool {
        false
    }
}

/// Steers failovers away from infrastructure shared with recently abandoned
/// paths.
///
/// Keeps the last three paths failed away from as overlap references,
/// weighted 1.0, 0.6 and 0.3 from newest to oldest.
pub struct FailoverHistory {
    processor: Arc<OverlapPathProcessor>,
}

impl FailoverHistory {
    pub fn new() -> Self {
        Self {
            processor: Arc::new(OverlapPathProcessor::new()),
        }
    }

    /// The overlap penalizer to place in pipelines.
    pub fn processor(&self) -> Arc<OverlapPathProcessor> {
        Arc::clone(&self.processor)
    }

    /// Record a failover away from `old`. Returns `false` if `old` already is
    /// the newest reference.
    pub fn record(&self, old: &Path) -> bool {
        let previous = self.processor.references();
        if previous.first().is_some_and(|(p, _)| p == old) {
            return false;
        }

        let mut references = vec![(old.clone(), 1.0)];
        references.extend(
            previous
                .into_iter()
                .take(2)
                .enumerate()
                .map(|(i, (path, _))| (path, (2 - i) as f64 * 0.3)),
        );
        self.processor.set_references(references);
        true
    }
}

impl Default for FailoverHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// Several penalizers folded into one stage: weights are summed, so one
/// ordering pass replaces one pass per member.
pub struct CollectedPenalizer {
    name: String,
    members: Vec<Arc<dyn Penalizer>>,
    considers_failover: bool,
    ordering_changed: EventSource<ProcessContext>,
    _forwarders: Vec<Listener>,
}

impl CollectedPenalizer {
    pub fn new(members: Vec<Arc<dyn Penalizer>>) -> Self {
        let ordering_changed = EventSource::new();
        let forwarders = members
            .iter()
            .map(|m| m.ordering_changed().forward_to(&ordering_changed))
            .collect();
        let name = members.iter().map(|m| m.name()).collect::<Vec<_>>().join(" + ");

        Self {
            name,
            considers_failover: members.iter().any(|m| m.considers_failover()),
            members,
            ordering_changed,
            _forwarders: forwarders,
        }
    }

    pub fn members(&self) -> &[Arc<dyn Penalizer>] {
        &self.members
    }
}

impl PathProcessor for CollectedPenalizer {
    fn process(&self, paths: PathSet, _context: ProcessContext) -> PathSet {
        penalty_order(paths, |p| self.weight(p))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl ActivePathProcessor for CollectedPenalizer {
    fn ordering_changed(&self) -> &EventSource<ProcessContext> {
        &self.ordering_changed
    }
}

impl Penalizer for CollectedPenalizer {
    fn weight(&self, path: &Path) -> f64 {
        self.members.iter().map(|m| m.weight(path)).sum()
    }

    fn considers_failover(&self) -> bool {
        self.considers_failover
    }
}
