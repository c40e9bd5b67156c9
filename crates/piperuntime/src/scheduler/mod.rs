//! Demand-driven execution of a workflow graph.
//!
//! No topological order is computed up front. Starting from the entry step,
//! a ready node runs and pushes its output forward along its fan-out; a node
//! that is not ready pulls execution backward, one missing predecessor at a
//! time, until the missing deliveries arrive.

mod delegate;

use crate::graph::{StepIndex, WorkflowGraph};
use crate::registry::FunctionResolver;
use crate::runtime::EngineConfig;
use futures::future::{join_all, BoxFuture, FutureExt};
use pipecore::{
    normalize_output, EventChannel, NodeEvent, NodeState, PipelineNode, RunConfig, RunId,
    StepContext, StepError,
};
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// What caused a node to be advanced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Via {
    /// External `run` call
    Entry,
    /// A predecessor just delivered an output record
    Delivery,
    /// A waiting successor needs this node's output
    Pull,
    /// Output was filled in by a delegated run
    Resume,
}

/// Working copy of the graph owned by one run
struct RunState {
    id: RunId,
    parent: Option<RunId>,
    scope: Arc<Value>,
    global: Arc<Value>,
    nodes: Mutex<Vec<PipelineNode>>,
}

impl RunState {
    fn new(graph: &WorkflowGraph, config: &RunConfig, parent: Option<RunId>) -> Self {
        Self {
            id: RunId::new_v4(),
            parent,
            scope: Arc::new(config.scope.clone()),
            global: Arc::new(config.global.clone()),
            nodes: Mutex::new(graph.instantiate()),
        }
    }

    fn context(&self, node: &PipelineNode) -> StepContext {
        StepContext {
            run_id: self.id,
            workflow: node.workflow().to_string(),
            step: node.name().to_string(),
            scope: self.scope.clone(),
            global: self.global.clone(),
        }
    }
}

/// Outcome of the locked readiness check
enum Readiness {
    Execute(PipelineNode),
    Pull(PipelineNode, Option<StepIndex>),
    Exhausted(PipelineNode),
}

/// Drives runs over a shared, immutable graph
#[derive(Clone)]
pub struct Scheduler {
    graph: Arc<WorkflowGraph>,
    resolver: Arc<dyn FunctionResolver>,
    events: EventChannel,
    max_activations: usize,
}

impl Scheduler {
    pub fn new(
        graph: Arc<WorkflowGraph>,
        resolver: Arc<dyn FunctionResolver>,
        events: EventChannel,
        config: &EngineConfig,
    ) -> Self {
        Self {
            graph,
            resolver,
            events,
            max_activations: config.max_activations_per_step.max(1),
        }
    }

    /// Run `workflow` from its entry step `step`.
    ///
    /// Returns every node that finished DONE or FAILED. Node failures never
    /// fail the run; an unknown or non-entry step yields an empty result.
    pub async fn run(&self, workflow: &str, step: &str, config: RunConfig) -> Vec<PipelineNode> {
        self.run_nested(workflow, step, config, None).await
    }

    fn run_nested<'a>(
        &'a self,
        workflow: &'a str,
        step: &'a str,
        config: RunConfig,
        parent: Option<RunId>,
    ) -> BoxFuture<'a, Vec<PipelineNode>> {
        async move {
            let Some(entry) = self.graph.entrypoint(workflow, step) else {
                tracing::debug!("No entrypoint {}.{}, nothing to run", workflow, step);
                return Vec::new();
            };

            let run = RunState::new(&self.graph, &config, parent);
            let run_id = run.id;
            if let Some(args) = &config.args {
                run.nodes.lock().await[entry.get()].merge_args(args);
            }

            tracing::info!(%run_id, parent = ?parent, "Starting run at {}.{}", workflow, step);
            let started = Instant::now();

            self.advance(&run, entry, Via::Entry).await;

            let terminal: Vec<PipelineNode> = run
                .nodes
                .into_inner()
                .into_iter()
                .filter(|node| node.is_terminal())
                .collect();
            let failed = terminal
                .iter()
                .filter(|node| node.state == NodeState::Failed)
                .count();
            tracing::info!(
                %run_id,
                "Run finished in {}ms: {} done, {} failed",
                started.elapsed().as_millis(),
                terminal.len() - failed,
                failed
            );
            terminal
        }
        .boxed()
    }

    fn advance<'a>(&'a self, run: &'a RunState, index: StepIndex, via: Via) -> BoxFuture<'a, ()> {
        async move {
            let (state, delegated) = {
                let nodes = run.nodes.lock().await;
                let node = &nodes[index.get()];
                (node.state, node.path().is_some())
            };

            match state {
                NodeState::Failed | NodeState::Exec => {}
                NodeState::Done | NodeState::Skip => {
                    // a delivery that finds the node finished was consumed by another branch
                    if via != Via::Delivery {
                        self.propagate(run, index).await;
                    }
                }
                NodeState::Idle | NodeState::Wait if delegated => {
                    self.advance_delegate(run, index).await
                }
                NodeState::Idle | NodeState::Wait => self.advance_local(run, index).await,
            }
        }
        .boxed()
    }

    async fn advance_local(&self, run: &RunState, index: StepIndex) {
        let readiness = {
            let mut nodes = run.nodes.lock().await;
            let node = &mut nodes[index.get()];
            if !node.can_execute() {
                return;
            }
            if node.is_ready() {
                if self.try_begin(node) {
                    Readiness::Execute(node.clone())
                } else {
                    Readiness::Exhausted(node.clone())
                }
            } else {
                node.state = NodeState::Wait;
                let waiting = node.clone();
                let predecessor = self.select_predecessor(&mut nodes, &waiting);
                Readiness::Pull(waiting, predecessor)
            }
        };

        match readiness {
            Readiness::Execute(snapshot) => {
                if self.execute(run, index, snapshot).await {
                    self.propagate(run, index).await;
                }
                self.drain_queued(run, index).await;
            }
            Readiness::Exhausted(snapshot) => self.report_exhausted(run, snapshot),
            Readiness::Pull(waiting, predecessor) => {
                let label = waiting.to_string();
                self.publish(run, waiting);
                if let Some(predecessor) = predecessor {
                    tracing::debug!("{} <- [{}]", label, self.graph.step(predecessor).name);
                    self.advance(run, predecessor, Via::Pull).await;
                }
            }
        }
    }

    /// Mark the node EXEC, or fail it once it used up its activations
    fn try_begin(&self, node: &mut PipelineNode) -> bool {
        if node.activations >= self.max_activations {
            node.fail(&StepError::ActivationLimit {
                limit: self.max_activations,
            });
            return false;
        }
        node.begin();
        true
    }

    /// Replay deliveries that reached the node while it was executing, each
    /// as its own activation.
    pub(super) async fn drain_queued(&self, run: &RunState, index: StepIndex) {
        loop {
            let resumed = {
                let mut nodes = run.nodes.lock().await;
                nodes[index.get()].take_queued()
            };
            if !resumed {
                break;
            }
            self.advance(run, index, Via::Delivery).await;
        }
    }

    fn report_exhausted(&self, run: &RunState, node: PipelineNode) {
        tracing::error!(
            "Node {} failed after {} activations",
            node,
            node.activations
        );
        self.publish(run, node);
    }

    /// Pick the first predecessor that has not delivered yet and aim its
    /// next propagation at the waiting node.
    ///
    /// Predecessors that are executing or waiting themselves are not pulled
    /// again. They remember the waiting node and deliver to it when they
    /// next propagate, even without a declared edge towards it.
    fn select_predecessor(
        &self,
        nodes: &mut [PipelineNode],
        waiting: &PipelineNode,
    ) -> Option<StepIndex> {
        let missing = waiting
            .fan_in()
            .iter()
            .find(|name| !waiting.fan_in_check.contains(*name))?;
        let index = self.graph.lookup(waiting.workflow(), missing)?;
        let predecessor = &mut nodes[index.get()];
        match predecessor.state {
            NodeState::Exec | NodeState::Wait => {
                predecessor.pulled_by.insert(waiting.name().to_string());
                tracing::debug!(
                    "{} waits on {} ({})",
                    waiting,
                    predecessor,
                    predecessor.state
                );
                None
            }
            NodeState::Failed => {
                tracing::debug!(
                    "{} waits on {} ({})",
                    waiting,
                    predecessor,
                    predecessor.state
                );
                None
            }
            NodeState::Idle | NodeState::Done | NodeState::Skip => {
                predecessor.fan_out_pending = Some(waiting.name().to_string());
                Some(index)
            }
        }
    }

    /// Invoke the node's function. Returns whether there is output to propagate.
    async fn execute(&self, run: &RunState, index: StepIndex, snapshot: PipelineNode) -> bool {
        let ctx = run.context(&snapshot);
        let input = snapshot.effective_input();
        let workflow = snapshot.workflow().to_string();
        let function = snapshot.function().to_string();
        self.publish(run, snapshot);

        let started = Instant::now();
        let result = match self.resolver.resolve(&workflow, &function).await {
            Ok(callable) => match AssertUnwindSafe(callable.call(input, ctx)).catch_unwind().await {
                Ok(returned) => returned.and_then(normalize_output),
                Err(panic) => Err(StepError::Runtime(panic_message(panic))),
            },
            Err(e) => Err(e),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let (finished, forward) = {
            let mut nodes = run.nodes.lock().await;
            let node = &mut nodes[index.get()];
            let forward = match result {
                Ok(output) => {
                    let forward = output.as_ref().map_or(false, |records| !records.is_empty());
                    node.complete(output);
                    forward
                }
                Err(e) => {
                    node.fail(&e);
                    false
                }
            };
            (node.clone(), forward)
        };

        match &finished.error {
            None => tracing::info!(
                "Node {} completed in {}ms ({} records)",
                finished,
                elapsed_ms,
                finished.output.as_ref().map_or(0, Vec::len)
            ),
            Some(error) => tracing::error!("Node {} failed: {}", finished, error),
        }
        self.publish(run, finished);
        forward
    }

    /// Push the node's stored output to its successors, one record at a time.
    ///
    /// A pending pull narrows the successors to the node that asked. Nodes
    /// that pulled while this one was busy are added on top. For
    /// every record all successors are updated before any is advanced, and
    /// the advances of one record finish before the next record is delivered.
    async fn propagate(&self, run: &RunState, index: StepIndex) {
        let (source, records, targets) = {
            let mut nodes = run.nodes.lock().await;
            let node = &mut nodes[index.get()];
            let pending = node.fan_out_pending.take();
            let pulled_by = std::mem::take(&mut node.pulled_by);
            let Some(records) = node.output.clone().filter(|records| !records.is_empty()) else {
                return;
            };
            let mut targets: Vec<StepIndex> = match pending {
                Some(name) => self.graph.lookup(node.workflow(), &name).into_iter().collect(),
                None => self.graph.fan_out(index).to_vec(),
            };
            for waiter in pulled_by.iter().filter_map(|name| self.graph.lookup(node.workflow(), name)) {
                if !targets.contains(&waiter) {
                    targets.push(waiter);
                }
            }
            (node.name().to_string(), records, targets)
        };

        for record in &records {
            let ready = {
                let mut nodes = run.nodes.lock().await;
                let mut ready = Vec::with_capacity(targets.len());
                for &target in &targets {
                    let successor = &mut nodes[target.get()];
                    if successor.deliver(&source, record) && !ready.contains(&target) {
                        tracing::debug!("[{}] -> {}", source, successor);
                        ready.push(target);
                    }
                }
                ready
            };

            join_all(
                ready
                    .into_iter()
                    .map(|target| self.advance(run, target, Via::Delivery)),
            )
            .await;
        }
    }

    fn publish(&self, run: &RunState, node: PipelineNode) {
        self.events.publish(NodeEvent::new(run.id, run.parent, node));
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "step panicked".to_string()
    }
}
