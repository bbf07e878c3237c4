//! Pipeline composition and failover detection.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{ActivePathProcessor, CollectedPenalizer, PathProcessor, Penalizer, Stage};
use crate::connection::PathAwareConnection;
use crate::events::{EventSource, Listener};
use crate::path::{Path, PathSet};
use crate::transport::Message;
use crate::types::ProcessContext;

/// Applies its stages left to right.
///
/// Ordering changes of all active stages are merged into one stream. Receive
/// hooks go to every active stage and a message passes only if all of them
/// accept it.
pub struct SequentialPathProcessor {
    stages: Vec<Stage>,
    name: String,
    ordering_changed: EventSource<ProcessContext>,
    _forwarders: Vec<Listener>,
}

impl SequentialPathProcessor {
    pub fn new(stages: Vec<Stage>) -> Self {
        let ordering_changed = EventSource::new();
        let forwarders = stages
            .iter()
            .filter_map(Stage::ordering_changed)
            .map(|source| source.forward_to(&ordering_changed))
            .collect();
        let name = stages.iter().map(Stage::name).collect::<Vec<_>>().join(", ");

        Self {
            stages,
            name,
            ordering_changed,
            _forwarders: forwarders,
        }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// A new pipeline running this one followed by `stage`.
    pub fn joined(&self, stage: Stage) -> Self {
        let mut stages = self.stages.clone();
        stages.push(stage);
        Self::new(stages)
    }

    /// Fold runs of adjacent penalizers into single [`CollectedPenalizer`]
    /// stages. The resulting ordering is the same with fewer sort passes.
    pub fn collect_penalties(&self) -> Self {
        let mut stages = Vec::with_capacity(self.stages.len());
        let mut run: Vec<Arc<dyn Penalizer>> = Vec::new();

        let flush = |run: &mut Vec<Arc<dyn Penalizer>>, stages: &mut Vec<Stage>| match run.len() {
            0 => {}
            1 => stages.push(Stage::Penalizer(run.remove(0))),
            _ => {
                let members = std::mem::take(run);
                stages.push(Stage::Penalizer(Arc::new(CollectedPenalizer::new(members))));
            }
        };

        for stage in &self.stages {
            if let Stage::Penalizer(p) = stage {
                run.push(Arc::clone(p));
            } else {
                flush(&mut run, &mut stages);
                stages.push(stage.clone());
            }
        }
        flush(&mut run, &mut stages);

        Self::new(stages)
    }
}

impl PathProcessor for SequentialPathProcessor {
    fn process(&self, paths: PathSet, context: ProcessContext) -> PathSet {
        self.stages
            .iter()
            .fold(paths, |paths, stage| stage.process(paths, context))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl ActivePathProcessor for SequentialPathProcessor {
    fn ordering_changed(&self) -> &EventSource<ProcessContext> {
        &self.ordering_changed
    }

    fn connect(&self, connection: &Arc<PathAwareConnection>) {
        for stage in &self.stages {
            stage.connect(connection);
        }
    }

    fn handle_receive(&self, message: &Message, connection: &PathAwareConnection) -> bool {
        // Every stage sees the message, even after one consumed it
        self.stages
            .iter()
            .fold(true, |accepted, stage| stage.handle_receive(message, connection) && accepted)
    }
}

impl fmt::Debug for SequentialPathProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequentialPathProcessor")
            .field("stages", &self.stages)
            .finish_non_exhaustive()
    }
}

/// A completed failover: the top ranked path moved from `old` to `new`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failover {
    pub old: Path,
    pub new: Path,
}

#[derive(Default)]
struct RootState {
    root_paths: PathSet,
    last_selected: Option<Path>,
    path_at_failover_start: Option<Path>,
}

/// Outermost pipeline wrapper.
///
/// Remembers the unfiltered input and the last top ranked path. After every
/// failover run it compares the new top path with the previous one and emits
/// a [`Failover`] if they differ. A failover signalled by a stage also records
/// the path selected at that moment, so a switch that happened through a
/// routine run in between is still reported once.
pub struct RootPathProcessor {
    pipeline: SequentialPathProcessor,
    state: Arc<Mutex<RootState>>,
    ordering_changed: EventSource<ProcessContext>,
    failovers: EventSource<Failover>,
    _forwarder: Listener,
}

impl RootPathProcessor {
    pub fn new(stages: Vec<Stage>) -> Self {
        let pipeline = SequentialPathProcessor::new(stages);
        let state = Arc::new(Mutex::new(RootState::default()));
        let ordering_changed = EventSource::new();

        let forwarder = {
            let state = Arc::clone(&state);
            let target = ordering_changed.clone();
            pipeline.ordering_changed().listen(move |context: &ProcessContext| {
                if context.is_failover() {
                    let mut state = state.lock();
                    state.path_at_failover_start = state.last_selected.clone();
                }
                target.emit(*context);
            })
        };

        Self {
            pipeline,
            state,
            ordering_changed,
            failovers: EventSource::new(),
            _forwarder: forwarder,
        }
    }

    /// The wrapped pipeline.
    pub fn pipeline(&self) -> &SequentialPathProcessor {
        &self.pipeline
    }

    pub fn stage_count(&self) -> usize {
        self.pipeline.stages().len()
    }

    /// The unfiltered input of the last run.
    pub fn root_paths(&self) -> PathSet {
        self.state.lock().root_paths.clone()
    }

    pub fn last_selected(&self) -> Option<Path> {
        self.state.lock().last_selected.clone()
    }

    pub fn failovers(&self) -> &EventSource<Failover> {
        &self.failovers
    }
}

impl PathProcessor for RootPathProcessor {
    fn process(&self, paths: PathSet, context: ProcessContext) -> PathSet {
        self.state.lock().root_paths = paths.clone();

        let ranked = self.pipeline.process(paths, context);
        let selected = ranked.first().cloned();

        let failover = {
            let mut state = self.state.lock();
            let failover = if context.is_failover() {
                let start = state.path_at_failover_start.take();
                match (&state.last_selected, &selected) {
                    (Some(last), Some(new)) if last != new => Some(Failover {
                        old: last.clone(),
                        new: new.clone(),
                    }),
                    (_, Some(new)) => match start {
                        Some(start) if &start != new => Some(Failover {
                            old: start,
                            new: new.clone(),
                        }),
                        _ => {
                            tracing::debug!(path = %new.display_id(), "Failover run kept the selected path");
                            None
                        }
                    },
                    (_, None) => None,
                }
            } else {
                None
            };
            state.last_selected = selected;
            failover
        };

        if let Some(failover) = failover {
            tracing::info!(
                old = %failover.old.display_id(),
                new = %failover.new.display_id(),
                "Failover completed"
            );
            self.failovers.emit(failover);
        }

        ranked
    }

    fn name(&self) -> &str {
        self.pipeline.name()
    }
}

impl ActivePathProcessor for RootPathProcessor {
    fn ordering_changed(&self) -> &EventSource<ProcessContext> {
        &self.ordering_changed
    }

    fn connect(&self, connection: &Arc<PathAwareConnection>) {
        self.pipeline.connect(connection);
    }

    fn handle_receive(&self, message: &Message, connection: &PathAwareConnection) -> bool {
        self.pipeline.handle_receive(message, connection)
    }
}

impl fmt::Debug for RootPathProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootPathProcessor")
            .field("pipeline", &self.pipeline)
            .field("last_selected", &self.last_selected())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{HopPathSorter, PathPenalizer, PipelineBuilder};

    fn ids(paths: &[Path]) -> Vec<&str> {
        paths.iter().map(Path::fingerprint).collect()
    }

    fn collect_failovers(root: &RootPathProcessor) -> (Arc<Mutex<Vec<Failover>>>, Listener) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener = root.failovers().listen(move |f: &Failover| sink.lock().push(f.clone()));
        (seen, listener)
    }

    #[test]
    fn test_sequential_applies_in_order() {
        let penalizer = Arc::new(PathPenalizer::new(false));
        let p1 = Path::new("p1", 2);
        let p2 = Path::new("p2", 3);
        penalizer.set_weight(&p1, 1.0, false);

        let pipeline = PipelineBuilder::new()
            .passive(HopPathSorter)
            .penalizer(penalizer)
            .build();

        let out = pipeline.process(vec![p2.clone(), p1.clone()], ProcessContext::ROUTINE);
        assert_eq!(out, vec![p2, p1]);
        assert_eq!(pipeline.name(), "Hop Count, Penalizer");
    }

    #[test]
    fn test_empty_pipeline_passes_through() {
        let pipeline = SequentialPathProcessor::new(Vec::new());
        let input = vec![Path::new("a", 1), Path::new("b", 1)];
        assert_eq!(pipeline.process(input.clone(), ProcessContext::FAILOVER), input);
    }

    #[test]
    fn test_ordering_changes_are_merged() {
        let a = Arc::new(PathPenalizer::new(false));
        let b = Arc::new(PathPenalizer::new(true));
        let pipeline = PipelineBuilder::new().penalizer(a.clone()).penalizer(b.clone()).build();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _l = pipeline.ordering_changed().listen(move |c| sink.lock().push(*c));

        a.set_weight(&Path::new("x", 1), 1.0, true);
        b.set_weight(&Path::new("x", 1), 1.0, true);
        assert_eq!(*seen.lock(), vec![ProcessContext::ROUTINE, ProcessContext::FAILOVER]);
    }

    #[test]
    fn test_collect_penalties_keeps_ordering() {
        let input: Vec<Path> = (0..6).map(|i| Path::new(format!("p{i}"), 6 - i)).collect();
        let a = Arc::new(PathPenalizer::new(false));
        let b = Arc::new(PathPenalizer::new(false));
        a.set_weight(&input[0], 0.2, false);
        b.set_weight(&input[0], 0.2, false);
        b.set_weight(&input[3], -0.5, false);

        let pipeline = PipelineBuilder::new()
            .passive(HopPathSorter)
            .penalizer(a)
            .penalizer(b)
            .build();
        let collected = pipeline.collect_penalties();

        assert_eq!(collected.stages().len(), 2);
        assert_eq!(
            ids(&collected.process(input.clone(), ProcessContext::ROUTINE)),
            ids(&PipelineBuilder::new()
                .passive(HopPathSorter)
                .penalizer(Arc::new({
                    let summed = PathPenalizer::new(false);
                    summed.set_weight(&input[0], 0.4, false);
                    summed.set_weight(&input[3], -0.5, false);
                    summed
                }))
                .build()
                .process(input, ProcessContext::ROUTINE))
        );
    }

    #[test]
    fn test_root_remembers_input() {
        let root = PipelineBuilder::new().passive(HopPathSorter).build_root();
        let input = vec![Path::new("long", 5), Path::new("short", 1)];
        let out = root.process(input.clone(), ProcessContext::ROUTINE);

        assert_eq!(out[0].fingerprint(), "short");
        assert_eq!(root.root_paths(), input);
        assert_eq!(root.last_selected().unwrap().fingerprint(), "short");
    }

    #[test]
    fn test_root_failover_event() {
        let penalizer = Arc::new(PathPenalizer::new(true));
        let root = PipelineBuilder::new().penalizer(penalizer.clone()).build_root();
        let (seen, _l) = collect_failovers(&root);

        let a = Path::new("a", 1);
        let b = Path::new("b", 1);
        let paths = vec![a.clone(), b.clone()];

        root.process(paths.clone(), ProcessContext::ROUTINE);
        root.process(paths.clone(), ProcessContext::FAILOVER);
        assert!(seen.lock().is_empty());

        penalizer.set_weight(&a, 1.0, true);
        root.process(paths.clone(), ProcessContext::FAILOVER);
        assert_eq!(*seen.lock(), vec![Failover { old: a, new: b.clone() }]);

        // Same top path again: nothing new
        root.process(paths, ProcessContext::FAILOVER);
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(root.last_selected(), Some(b));
    }

    #[test]
    fn test_root_routine_switch_is_not_a_failover() {
        let penalizer = Arc::new(PathPenalizer::new(false));
        let root = PipelineBuilder::new().penalizer(penalizer.clone()).build_root();
        let (seen, _l) = collect_failovers(&root);

        let a = Path::new("a", 1);
        let paths = vec![a.clone(), Path::new("b", 1)];
        root.process(paths.clone(), ProcessContext::ROUTINE);
        penalizer.set_weight(&a, 1.0, false);
        root.process(paths, ProcessContext::ROUTINE);

        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_root_reports_switch_since_failover_start() {
        let penalizer = Arc::new(PathPenalizer::new(true));
        let root = PipelineBuilder::new().penalizer(penalizer.clone()).build_root();
        let (seen, _l) = collect_failovers(&root);

        let a = Path::new("a", 1);
        let b = Path::new("b", 1);
        let paths = vec![a.clone(), b.clone()];
        root.process(paths.clone(), ProcessContext::ROUTINE);

        // Failover signalled while `a` is selected, then a routine run moves on
        penalizer.set_weight(&a, 1.0, true);
        root.process(paths.clone(), ProcessContext::ROUTINE);
        root.process(paths, ProcessContext::FAILOVER);

        assert_eq!(*seen.lock(), vec![Failover { old: a, new: b }]);
    }

    #[test]
    fn test_root_failover_on_empty_set() {
        let root = PipelineBuilder::new().build_root();
        let (seen, _l) = collect_failovers(&root);
        assert!(root.process(vec![], ProcessContext::FAILOVER).is_empty());
        assert!(seen.lock().is_empty());
    }
}
