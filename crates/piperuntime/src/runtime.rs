use crate::graph::WorkflowGraph;
use crate::registry::{FunctionResolver, ModuleRegistry};
use crate::scheduler::Scheduler;
use pipecore::{EventChannel, NodeEvent, NodeState, PipelineNode, RunConfig, Subscription};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Main entry point: a loaded graph, its function modules and an event channel
pub struct PipelineRuntime {
    graph: Arc<WorkflowGraph>,
    events: EventChannel,
    scheduler: Scheduler,
}

impl PipelineRuntime {
    /// Create a runtime with default settings
    pub fn new(graph: WorkflowGraph, registry: ModuleRegistry) -> Self {
        Self::with_config(graph, Arc::new(registry), EngineConfig::default())
    }

    /// Create a runtime with a custom resolver and configuration
    pub fn with_config(
        graph: WorkflowGraph,
        resolver: Arc<dyn FunctionResolver>,
        config: EngineConfig,
    ) -> Self {
        let graph = Arc::new(graph);
        let events = EventChannel::new(config.event_buffer_size);
        let scheduler = Scheduler::new(graph.clone(), resolver, events.clone(), &config);

        Self {
            graph,
            events,
            scheduler,
        }
    }

    pub fn graph(&self) -> &Arc<WorkflowGraph> {
        &self.graph
    }

    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    /// Subscribe a callback to state transitions of every run, nested ones included
    pub fn subscribe<F>(&self, step: Option<&str>, state: Option<NodeState>, callback: F) -> Subscription
    where
        F: Fn(&NodeEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(step, state, callback)
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.stream()
    }

    /// Run `workflow` from its entry step `step`, returning the DONE and FAILED nodes
    pub async fn run(&self, workflow: &str, step: &str, config: RunConfig) -> Vec<PipelineNode> {
        self.scheduler.run(workflow, step, config).await
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub event_buffer_size: usize,
    /// Executions of one node within one run before it is failed
    pub max_activations_per_step: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 1000,
            max_activations_per_step: 10_000,
        }
    }
}
