//! Path processors.
//!
//! A path processor turns a candidate [`PathSet`] into a ranked (and possibly
//! filtered) one. Processors are composed into pipelines from [`Stage`]s:
//!
//! ```text
//!   root paths ──► preprocess ──► latency probing ──► penalizers ──► ranked paths
//!                                      │                   │
//!                                      └── ordering changed events ──► connection
//! ```
//!
//! Every processor is total: any input, including the empty set, yields a
//! usable ordering and no path identity is ever altered.

mod penalizer;
mod pipeline;
mod probing;
mod sorters;

use std::fmt;
use std::sync::Arc;

pub use penalizer::{
    penalize_bounded, penalty_order, CollectedPenalizer, FailoverHistory, OverlapPathProcessor,
    PathPenalizer, PenaltyWeights, WeightBounds,
};
pub use pipeline::{Failover, RootPathProcessor, SequentialPathProcessor};
pub use probing::{
    burst_score, overall_score, LatencyProbingPathProcessor, ProbeResult,
    ProbeSample,
};
pub use sorters::{
    HopPathSorter, InterfaceFilter, InterfaceSide, LabeledLinkSorter, LatencyPathSorter,
};

use crate::connection::PathAwareConnection;
use crate::events::EventSource;
use crate::path::{Path, PathSet};
use crate::transport::Message;
use crate::types::ProcessContext;

/// Pure ranking/filtering step.
pub trait PathProcessor: Send + Sync {
    /// Reorder and/or filter `paths`.
    fn process(&self, paths: PathSet, context: ProcessContext) -> PathSet;

    /// Human readable name for logs.
    fn name(&self) -> &str;
}

/// A processor that can trigger re-evaluation by itself and take part in
/// traffic on the connection it is bound to.
pub trait ActivePathProcessor: PathProcessor {
    /// Fires whenever the ordering this processor would produce changed.
    fn ordering_changed(&self) -> &EventSource<ProcessContext>;

    /// Bind to a connection.
    fn connect(&self, _connection: &Arc<PathAwareConnection>) {}

    /// Inspect an incoming message. Returning `false` consumes it.
    fn handle_receive(&self, _message: &Message, _connection: &PathAwareConnection) -> bool {
        true
    }
}

/// A weight based processor. Its ordering is fully determined by
/// [`penalty_order`] over [`Penalizer::weight`].
pub trait Penalizer: ActivePathProcessor {
    /// Current penalty weight of `path` (0 if unknown).
    fn weight(&self, path: &Path) -> f64;

    /// Whether failover-worthy mutations of this penalizer are reported with
    /// [`ProcessContext::FAILOVER`].
    fn considers_failover(&self) -> bool;
}

/// One element of a pipeline.
#[derive(Clone)]
pub enum Stage {
    /// Stateless ranking or filtering.
    Passive(Arc<dyn PathProcessor>),
    /// Processor with its own events and traffic hooks.
    Active(Arc<dyn ActivePathProcessor>),
    /// Weight based processor; adjacent penalizers can be collected into one.
    Penalizer(Arc<dyn Penalizer>),
    /// Marker asking the connection to answer on the path the peer last used.
    /// Leaves the ordering untouched.
    Mirror,
}

impl Stage {
    pub fn passive(processor: impl PathProcessor + 'static) -> Self {
        Stage::Passive(Arc::new(processor))
    }

    pub fn process(&self, paths: PathSet, context: ProcessContext) -> PathSet {
        match self {
            Stage::Passive(p) => p.process(paths, context),
            Stage::Active(p) => p.process(paths, context),
            Stage::Penalizer(p) => p.process(paths, context),
            Stage::Mirror => paths,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Stage::Passive(p) => p.name(),
            Stage::Active(p) => p.name(),
            Stage::Penalizer(p) => p.name(),
            Stage::Mirror => "Mirror",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Stage::Active(_) | Stage::Penalizer(_))
    }

    pub fn is_mirror(&self) -> bool {
        matches!(self, Stage::Mirror)
    }

    pub(crate) fn ordering_changed(&self) -> Option<&EventSource<ProcessContext>> {
        match self {
            Stage::Active(p) => Some(p.ordering_changed()),
            Stage::Penalizer(p) => Some(p.ordering_changed()),
            Stage::Passive(_) | Stage::Mirror => None,
        }
    }

    pub(crate) fn connect(&self, connection: &Arc<PathAwareConnection>) {
        match self {
            Stage::Active(p) => p.connect(connection),
            Stage::Penalizer(p) => p.connect(connection),
            Stage::Passive(_) | Stage::Mirror => {}
        }
    }

    pub(crate) fn handle_receive(&self, message: &Message, connection: &PathAwareConnection) -> bool {
        match self {
            Stage::Active(p) => p.handle_receive(message, connection),
            Stage::Penalizer(p) => p.handle_receive(message, connection),
            Stage::Passive(_) | Stage::Mirror => true,
        }
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Stage::Passive(_) => "Passive",
            Stage::Active(_) => "Active",
            Stage::Penalizer(_) => "Penalizer",
            Stage::Mirror => "Mirror",
        };
        write!(f, "{kind}({})", self.name())
    }
}

impl<P: Penalizer + 'static> From<Arc<P>> for Stage {
    fn from(penalizer: Arc<P>) -> Self {
        Stage::Penalizer(penalizer)
    }
}

/// Builds pipelines stage by stage.
#[derive(Debug, Default, Clone)]
pub struct PipelineBuilder {
    stages: Vec<Stage>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn passive(mut self, processor: impl PathProcessor + 'static) -> Self {
        self.stages.push(Stage::passive(processor));
        self
    }

    pub fn active(mut self, processor: Arc<dyn ActivePathProcessor>) -> Self {
        self.stages.push(Stage::Active(processor));
        self
    }

    pub fn penalizer(mut self, penalizer: Arc<dyn Penalizer>) -> Self {
        self.stages.push(Stage::Penalizer(penalizer));
        self
    }

    pub fn mirror(mut self) -> Self {
        self.stages.push(Stage::Mirror);
        self
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// The collected stages, for handing to a connection.
    pub fn into_stages(self) -> Vec<Stage> {
        self.stages
    }

    pub fn build(self) -> SequentialPathProcessor {
        SequentialPathProcessor::new(self.stages)
    }

    pub fn build_root(self) -> RootPathProcessor {
        RootPathProcessor::new(self.stages)
    }
}
