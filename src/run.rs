//! Run coordinator
//!
//! Executes a [`Plan`] against an [`Executor`], writing busy flags and
//! outcomes back into the tree. Cancellation is cooperative: it is checked
//! before each dequeue and never interrupts a call already in flight. Every
//! run emits exactly one [`RunEvent::Ended`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use uuid::Uuid;

use crate::executor::{strip_ansi, Executor, NodeReport, NodeTarget, SuiteReport};
use crate::id::NodeId;
use crate::loader::BusyGuard;
use crate::selection::Plan;
use crate::test_model::{NodeOutcome, Outcome};
use crate::tree::SharedTree;

/// Lifecycle of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Cancelled,
    /// Stopped early because the executor became unavailable
    Aborted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Cancelled | RunState::Aborted)
    }
}

/// Progress notification for a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Started { run_id: Uuid, nodes: Option<usize> },
    NodeStarted { run_id: Uuid, id: NodeId },
    NodeFinished { run_id: Uuid, result: NodeResult },
    SuiteFinished { run_id: Uuid, report: SuiteReport },
    Ended { run_id: Uuid, state: RunState },
}

/// Sending half of a cancellation channel
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// Receiving half, polled by the coordinator between dequeues
#[derive(Debug, Clone)]
pub struct CancelToken(watch::Receiver<bool>);

impl CancelToken {
    pub fn new() -> (CancelHandle, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle(Arc::new(tx)), CancelToken(rx))
    }

    /// A token that is never cancelled
    pub fn never() -> Self {
        Self::new().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}

/// Outcome of one executed node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeResult {
    pub id: NodeId,
    pub label: String,
    pub outcome: Outcome,
    pub duration_ms: u64,
    pub message: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub raw_output: String,
}

/// Everything a caller learns about a finished run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub state: RunState,
    pub results: Vec<NodeResult>,
    /// Set for whole-suite runs that reached the executor
    pub suite: Option<SuiteReport>,
    /// Why the run was aborted
    pub aborted: Option<String>,
    /// Queued nodes that were never started
    pub not_started: usize,
    /// Requested ids that matched nothing in the tree
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unresolved: Vec<NodeId>,
    pub duration_ms: u64,
}

impl RunSummary {
    pub fn count(&self, outcome: Outcome) -> usize {
        self.results.iter().filter(|r| r.outcome == outcome).count()
    }

    pub fn success(&self) -> bool {
        self.state == RunState::Completed
            && self.unresolved.is_empty()
            && self.results.iter().all(|r| r.outcome == Outcome::Passed)
            && self.suite.as_ref().map_or(true, |s| s.success)
    }
}

/// Drives plans through an executor
#[derive(Clone)]
pub struct RunCoordinator {
    tree: SharedTree,
    executor: Arc<dyn Executor>,
    event_tx: Option<UnboundedSender<RunEvent>>,
}

impl RunCoordinator {
    pub fn new(tree: SharedTree, executor: Arc<dyn Executor>) -> Self {
        Self {
            tree,
            executor,
            event_tx: None,
        }
    }

    /// Set the event sender for real-time updates
    pub fn with_event_sender(mut self, tx: UnboundedSender<RunEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub async fn execute(&self, plan: Plan, cancel: CancelToken) -> RunSummary {
        let mut run = Run::new(self.event_tx.clone());
        run.start(plan.len());

        match plan {
            Plan::RunAll => self.execute_suite(&mut run, &cancel).await,
            Plan::Queue(queue) => self.execute_queue(&mut run, queue, &cancel).await,
        }

        run.into_summary()
    }

    async fn execute_suite(&self, run: &mut Run, cancel: &CancelToken) {
        if cancel.is_cancelled() {
            run.end(RunState::Cancelled);
            return;
        }

        tracing::info!("running all tests");
        match self.executor.run_all().await {
            Ok(mut report) => {
                report.raw_output = strip_ansi(&report.raw_output);
                tracing::debug!("test output:\n{}", report.raw_output);
                run.emit(RunEvent::SuiteFinished {
                    run_id: run.id,
                    report: report.clone(),
                });
                run.suite = Some(report);
                run.end(RunState::Completed);
            }
            Err(e) => {
                tracing::error!("run errored with reason: {}", e);
                run.aborted = Some(e.to_string());
                run.end(RunState::Aborted);
            }
        }
    }

    async fn execute_queue(&self, run: &mut Run, mut queue: Vec<NodeId>, cancel: &CancelToken) {
        loop {
            if cancel.is_cancelled() {
                tracing::info!("run cancelled, {} node(s) not started", queue.len());
                run.not_started = queue.len();
                run.end(RunState::Cancelled);
                return;
            }

            let Some(id) = queue.pop() else {
                break;
            };

            let target = {
                let mut tree = self.tree.lock();
                let Some(node) = tree.get(&id) else {
                    tracing::debug!(id = %id, "node disappeared before it could run");
                    continue;
                };
                let target = NodeTarget::from_node(node);
                tree.set_busy(&id, true);
                target
            };

            let result = {
                let _busy = BusyGuard::new(&self.tree, &id);
                run.emit(RunEvent::NodeStarted {
                    run_id: run.id,
                    id: id.clone(),
                });
                tracing::info!("running test with label \"{}\"", target.label);

                let started = Instant::now();
                let report = self.executor.run_one(&target).await;
                (report, started.elapsed().as_millis() as u64)
            };

            match result {
                (Ok(report), duration_ms) => self.record(run, &target, report, duration_ms),
                (Err(e), duration_ms) => {
                    tracing::error!("run of \"{}\" errored with reason: {}", target.label, e);
                    let fatal = e.is_fatal();
                    let report = NodeReport {
                        outcome: Outcome::Errored,
                        message: Some(e.to_string()),
                        raw_output: String::new(),
                    };
                    self.record(run, &target, report, duration_ms);

                    if fatal {
                        run.aborted = Some(e.to_string());
                        run.not_started = queue.len();
                        run.end(RunState::Aborted);
                        return;
                    }
                }
            }
        }

        run.end(RunState::Completed);
    }

    fn record(&self, run: &mut Run, target: &NodeTarget, report: NodeReport, duration_ms: u64) {
        let message = report.message.map(|m| strip_ansi(&m));
        let result = NodeResult {
            id: target.id.clone(),
            label: target.label.clone(),
            outcome: report.outcome,
            duration_ms,
            message: message.clone(),
            raw_output: strip_ansi(&report.raw_output),
        };

        self.tree.lock().record_outcome(
            &target.id,
            NodeOutcome {
                outcome: report.outcome,
                duration_ms,
                message,
            },
        );

        run.emit(RunEvent::NodeFinished {
            run_id: run.id,
            result: result.clone(),
        });
        run.results.push(result);
    }
}

/// Ephemeral per-request aggregate
struct Run {
    id: Uuid,
    started_at: DateTime<Utc>,
    clock: Instant,
    state: RunState,
    results: Vec<NodeResult>,
    suite: Option<SuiteReport>,
    aborted: Option<String>,
    not_started: usize,
    event_tx: Option<UnboundedSender<RunEvent>>,
}

impl Run {
    fn new(event_tx: Option<UnboundedSender<RunEvent>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            clock: Instant::now(),
            state: RunState::Pending,
            results: Vec::new(),
            suite: None,
            aborted: None,
            not_started: 0,
            event_tx,
        }
    }

    fn emit(&self, event: RunEvent) {
        if let Some(ref tx) = self.event_tx {
            let _ = tx.send(event);
        }
    }

    fn start(&mut self, nodes: Option<usize>) {
        tracing::info!(run_id = %self.id, "test run started");
        self.state = RunState::Running;
        self.emit(RunEvent::Started {
            run_id: self.id,
            nodes,
        });
    }

    /// Move to a terminal state; only the first call has any effect
    fn end(&mut self, state: RunState) {
        if self.state.is_terminal() {
            return;
        }
        self.state = state;
        tracing::info!(run_id = %self.id, ?state, "test run ended");
        self.emit(RunEvent::Ended {
            run_id: self.id,
            state,
        });
    }

    fn into_summary(self) -> RunSummary {
        RunSummary {
            run_id: self.id,
            started_at: self.started_at,
            state: self.state,
            duration_ms: self.clock.elapsed().as_millis() as u64,
            results: self.results,
            suite: self.suite,
            aborted: self.aborted,
            not_started: self.not_started,
            unresolved: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutionError;
    use crate::id::encode;
    use crate::selection::resolve;
    use crate::test_model::CaseSpan;
    use crate::tree::TreeStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex;
    use tokio::sync::mpsc::unbounded_channel;

    /// Executor whose per-node behaviour is scripted by label
    #[derive(Default)]
    struct ScriptedExecutor {
        outcomes: HashMap<String, Result<Outcome, ExecutionError>>,
        calls: Mutex<Vec<String>>,
        cancel_on_first_call: Option<CancelHandle>,
        suite: Option<Result<SuiteReport, ExecutionError>>,
    }

    impl ScriptedExecutor {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Executor for ScriptedExecutor {
        async fn run_one(&self, target: &NodeTarget) -> Result<NodeReport, ExecutionError> {
            let first = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(target.label.clone());
                calls.len() == 1
            };
            if first {
                if let Some(ref handle) = self.cancel_on_first_call {
                    handle.cancel();
                }
            }
            tokio::task::yield_now().await;

            let outcome = self
                .outcomes
                .get(&target.label)
                .cloned()
                .unwrap_or(Ok(Outcome::Passed))?;
            Ok(NodeReport {
                outcome,
                message: (outcome == Outcome::Failed).then(|| "\x1b[31mexpected 1\x1b[0m".to_string()),
                raw_output: format!("ran {}", target.label),
            })
        }

        async fn run_all(&self) -> Result<SuiteReport, ExecutionError> {
            self.calls.lock().unwrap().push("<suite>".to_string());
            self.suite.clone().unwrap_or(Ok(SuiteReport {
                success: true,
                raw_output: "all good".into(),
            }))
        }
    }

    fn sample_tree() -> SharedTree {
        let mut store = TreeStore::new();
        let a = store.upsert_file(Path::new("A")).unwrap().id;
        let b = store.upsert_file(Path::new("B")).unwrap().id;
        store
            .set_children(&a, &[CaseSpan::new("A1", 1), CaseSpan::new("A2", 2), CaseSpan::new("A3", 3)])
            .unwrap();
        store.set_children(&b, &[CaseSpan::new("B1", 1)]).unwrap();
        SharedTree::new(store)
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<RunEvent>) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn ended_count(events: &[RunEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, RunEvent::Ended { .. }))
            .count()
    }

    #[tokio::test]
    async fn test_run_all_issues_single_suite_call() {
        let tree = sample_tree();
        let executor = Arc::new(ScriptedExecutor::default());
        let (tx, mut rx) = unbounded_channel();
        let coordinator = RunCoordinator::new(tree.clone(), executor.clone()).with_event_sender(tx);

        let plan = resolve(&tree.lock(), &[], &[]);
        let summary = coordinator.execute(plan, CancelToken::never()).await;

        assert_eq!(executor.calls(), vec!["<suite>"]);
        assert_eq!(summary.state, RunState::Completed);
        assert!(summary.results.is_empty());
        assert_eq!(summary.suite.unwrap().raw_output, "all good");
        assert_eq!(ended_count(&drain(&mut rx)), 1);
    }

    #[tokio::test]
    async fn test_queue_records_outcomes_and_clears_busy() {
        let tree = sample_tree();
        let executor = Arc::new(ScriptedExecutor {
            outcomes: HashMap::from([("A1".to_string(), Ok(Outcome::Failed))]),
            ..Default::default()
        });
        let coordinator = RunCoordinator::new(tree.clone(), executor.clone());

        let plan = resolve(&tree.lock(), &[encode("A", None)], &[encode("A", Some("A2"))]);
        let summary = coordinator.execute(plan, CancelToken::never()).await;

        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(summary.results.len(), 2);
        assert_eq!(summary.count(Outcome::Failed), 1);
        assert!(!summary.success());

        let failed = summary.results.iter().find(|r| r.label == "A1").unwrap();
        assert_eq!(failed.message.as_deref(), Some("expected 1"));

        let tree = tree.lock();
        let a1 = tree.get(&encode("A", Some("A1"))).unwrap();
        assert!(!a1.busy);
        assert_eq!(a1.last_outcome.as_ref().unwrap().outcome, Outcome::Failed);
        assert!(tree.get(&encode("A", Some("A2"))).unwrap().last_outcome.is_none());
    }

    #[tokio::test]
    async fn test_node_failure_is_isolated() {
        let tree = sample_tree();
        let executor = Arc::new(ScriptedExecutor {
            outcomes: HashMap::from([(
                "A1".to_string(),
                Err(ExecutionError::Failed("process crashed".into())),
            )]),
            ..Default::default()
        });
        let coordinator = RunCoordinator::new(tree.clone(), executor.clone());

        let plan = Plan::Queue(vec![encode("A", Some("A1")), encode("B", Some("B1"))]);
        let summary = coordinator.execute(plan, CancelToken::never()).await;

        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(summary.count(Outcome::Errored), 1);
        assert_eq!(summary.count(Outcome::Passed), 1);

        let tree = tree.lock();
        let a1 = tree.get(&encode("A", Some("A1"))).unwrap();
        assert_eq!(a1.error.as_deref(), Some("process crashed"));
        assert_eq!(
            tree.get(&encode("B", Some("B1"))).unwrap().last_outcome.as_ref().unwrap().outcome,
            Outcome::Passed
        );
    }

    #[tokio::test]
    async fn test_cancellation_stops_further_dequeues() {
        let tree = sample_tree();
        let (handle, token) = CancelToken::new();
        let executor = Arc::new(ScriptedExecutor {
            cancel_on_first_call: Some(handle),
            ..Default::default()
        });
        let (tx, mut rx) = unbounded_channel();
        let coordinator = RunCoordinator::new(tree.clone(), executor.clone()).with_event_sender(tx);

        let plan = Plan::Queue(vec![
            encode("A", Some("A1")),
            encode("A", Some("A2")),
            encode("A", Some("A3")),
        ]);
        let summary = coordinator.execute(plan, token).await;

        assert_eq!(executor.calls().len(), 1);
        assert_eq!(summary.results.len(), 1);
        assert_eq!(summary.not_started, 2);
        assert_eq!(summary.state, RunState::Cancelled);

        let events = drain(&mut rx);
        assert_eq!(ended_count(&events), 1);
        assert!(matches!(
            events.last(),
            Some(RunEvent::Ended {
                state: RunState::Cancelled,
                ..
            })
        ));

        let tree = tree.lock();
        assert!(tree.files().all(|f| !f.busy));
        for name in ["A1", "A2", "A3"] {
            assert!(!tree.get(&encode("A", Some(name))).unwrap().busy);
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let tree = sample_tree();
        let (handle, token) = CancelToken::new();
        handle.cancel();
        let executor = Arc::new(ScriptedExecutor::default());
        let coordinator = RunCoordinator::new(tree, executor.clone());

        let summary = coordinator.execute(Plan::RunAll, token).await;
        assert!(executor.calls().is_empty());
        assert_eq!(summary.state, RunState::Cancelled);
    }

    #[tokio::test]
    async fn test_unavailable_executor_aborts_run() {
        let tree = sample_tree();
        let executor = Arc::new(ScriptedExecutor {
            outcomes: HashMap::from([(
                "A3".to_string(),
                Err(ExecutionError::Unavailable("runtime went away".into())),
            )]),
            ..Default::default()
        });
        let (tx, mut rx) = unbounded_channel();
        let coordinator = RunCoordinator::new(tree.clone(), executor.clone()).with_event_sender(tx);

        // Queue pops from the back, so A3 runs first
        let plan = Plan::Queue(vec![
            encode("A", Some("A1")),
            encode("A", Some("A2")),
            encode("A", Some("A3")),
        ]);
        let summary = coordinator.execute(plan, CancelToken::never()).await;

        assert_eq!(summary.state, RunState::Aborted);
        assert_eq!(summary.not_started, 2);
        assert!(summary.aborted.unwrap().contains("runtime went away"));
        assert_eq!(ended_count(&drain(&mut rx)), 1);
    }

    #[tokio::test]
    async fn test_suite_failure_still_ends_run() {
        let tree = sample_tree();
        let executor = Arc::new(ScriptedExecutor {
            suite: Some(Err(ExecutionError::Unavailable("no runtime".into()))),
            ..Default::default()
        });
        let (tx, mut rx) = unbounded_channel();
        let coordinator = RunCoordinator::new(tree, executor).with_event_sender(tx);

        let summary = coordinator.execute(Plan::RunAll, CancelToken::never()).await;
        assert_eq!(summary.state, RunState::Aborted);
        assert_eq!(ended_count(&drain(&mut rx)), 1);
    }

    #[tokio::test]
    async fn test_removed_node_is_skipped() {
        let tree = sample_tree();
        tree.lock().remove_file(Path::new("B"));
        let executor = Arc::new(ScriptedExecutor::default());
        let coordinator = RunCoordinator::new(tree, executor.clone());

        let plan = Plan::Queue(vec![encode("B", None), encode("A", None)]);
        let summary = coordinator.execute(plan, CancelToken::never()).await;
        assert_eq!(executor.calls(), vec!["A"]);
        assert_eq!(summary.state, RunState::Completed);
    }
}
