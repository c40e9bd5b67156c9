use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use pipecore::{PipelineError, PipelineNode, StepDef, WorkflowError};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Stable position of a step in the graph arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepIndex(usize);

impl StepIndex {
    pub fn get(self) -> usize {
        self.0
    }
}

/// Immutable arena of every declared step across all loaded workflows.
///
/// Runs instantiate a fresh working copy from it; the definitions themselves
/// are shared and never mutated.
#[derive(Debug)]
pub struct WorkflowGraph {
    steps: Vec<Arc<StepDef>>,
    index: HashMap<String, HashMap<String, StepIndex>>,
    fan_out: Vec<Vec<StepIndex>>,
}

impl WorkflowGraph {
    pub fn new(defs: impl IntoIterator<Item = StepDef>) -> Result<Self, WorkflowError> {
        let mut steps = Vec::new();
        let mut index: HashMap<String, HashMap<String, StepIndex>> = HashMap::new();

        for def in defs {
            if def.name.is_empty() || def.workflow.is_empty() {
                return Err(WorkflowError::Invalid(format!(
                    "step '{}' of workflow '{}' needs a name and a workflow",
                    def.name, def.workflow
                )));
            }
            let workflow = index.entry(def.workflow.clone()).or_default();
            if workflow.contains_key(&def.name) {
                return Err(WorkflowError::DuplicateStep {
                    workflow: def.workflow,
                    name: def.name,
                });
            }
            workflow.insert(def.name.clone(), StepIndex(steps.len()));
            steps.push(Arc::new(def));
        }

        let fan_out = steps
            .iter()
            .map(|def| {
                def.fan_out
                    .iter()
                    .filter_map(|target| {
                        let found = index
                            .get(&def.workflow)
                            .and_then(|names| names.get(target))
                            .copied();
                        if found.is_none() {
                            tracing::warn!(
                                "Step {}.{} fans out to unknown step '{}'",
                                def.workflow,
                                def.name,
                                target
                            );
                        }
                        found
                    })
                    .collect()
            })
            .collect();

        Ok(Self {
            steps,
            index,
            fan_out,
        })
    }

    /// Parse a graph definition document: a JSON array of step records
    pub fn from_json(json: &str) -> Result<Self, PipelineError> {
        let defs: Vec<StepDef> = serde_json::from_str(json)?;
        Ok(Self::new(defs)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        Self::from_paths([path])
    }

    /// Load several definition files into one graph
    pub fn from_paths<I, P>(paths: I) -> Result<Self, PipelineError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut defs = Vec::new();
        for path in paths {
            let raw = std::fs::read_to_string(path.as_ref())?;
            let mut parsed: Vec<StepDef> = serde_json::from_str(&raw)?;
            tracing::debug!("Loaded {} steps from {}", parsed.len(), path.as_ref().display());
            defs.append(&mut parsed);
        }
        Ok(Self::new(defs)?)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, index: StepIndex) -> &Arc<StepDef> {
        &self.steps[index.0]
    }

    pub fn steps(&self) -> impl Iterator<Item = (StepIndex, &Arc<StepDef>)> {
        self.steps.iter().enumerate().map(|(i, def)| (StepIndex(i), def))
    }

    /// Names of all loaded workflows, sorted
    pub fn workflows(&self) -> Vec<&str> {
        let names: BTreeSet<&str> = self.index.keys().map(String::as_str).collect();
        names.into_iter().collect()
    }

    pub fn lookup(&self, workflow: &str, name: &str) -> Option<StepIndex> {
        self.index.get(workflow)?.get(name).copied()
    }

    /// The step `name` of `workflow`, only if it is declared as an entrypoint
    pub fn entrypoint(&self, workflow: &str, name: &str) -> Option<StepIndex> {
        self.lookup(workflow, name)
            .filter(|index| self.steps[index.0].entrypoint)
    }

    /// The step of `workflow` bound to `function`, preferring entrypoints
    pub fn find_by_function(&self, workflow: &str, function: &str) -> Option<StepIndex> {
        let mut candidates = self
            .steps()
            .filter(|(_, def)| def.workflow == workflow && def.function == function);
        let (first, def) = candidates.next()?;
        if def.entrypoint {
            return Some(first);
        }
        Some(candidates.find(|(_, def)| def.entrypoint).map_or(first, |(index, _)| index))
    }

    /// Resolved successors of a step, in declaration order
    pub fn fan_out(&self, index: StepIndex) -> &[StepIndex] {
        &self.fan_out[index.0]
    }

    /// Fresh run state for every declared step
    pub fn instantiate(&self) -> Vec<PipelineNode> {
        self.steps.iter().cloned().map(PipelineNode::new).collect()
    }

    /// Report structural problems. None of them prevent a run.
    pub fn validate(&self) -> Vec<GraphIssue> {
        let mut issues = Vec::new();

        for def in &self.steps {
            let label = label(def);
            for target in &def.fan_out {
                match self.lookup(&def.workflow, target) {
                    None => issues.push(GraphIssue::UnknownFanOut {
                        step: label.clone(),
                        target: target.clone(),
                    }),
                    Some(index) if !accepts(&self.steps[index.0], &def.name) => {
                        issues.push(GraphIssue::AsymmetricEdge {
                            from: label.clone(),
                            to: label_of(&def.workflow, target),
                        })
                    }
                    Some(_) => {}
                }
            }
            for source in &def.fan_in {
                match self.lookup(&def.workflow, source) {
                    None => issues.push(GraphIssue::UnknownFanIn {
                        step: label.clone(),
                        source: source.clone(),
                    }),
                    Some(index) if !self.steps[index.0].fan_out.contains(&def.name) => {
                        issues.push(GraphIssue::AsymmetricEdge {
                            from: label_of(&def.workflow, source),
                            to: label.clone(),
                        })
                    }
                    Some(_) => {}
                }
            }
            if let Some(path) = &def.path {
                if !self.index.contains_key(path) {
                    issues.push(GraphIssue::UnknownPath {
                        step: label.clone(),
                        workflow: path.clone(),
                    });
                }
            }
        }

        let mut graph: DiGraph<StepIndex, ()> = DiGraph::with_capacity(self.steps.len(), 0);
        let nodes: Vec<NodeIndex> = (0..self.steps.len())
            .map(|i| graph.add_node(StepIndex(i)))
            .collect();
        for (from, targets) in self.fan_out.iter().enumerate() {
            for to in targets {
                graph.add_edge(nodes[from], nodes[to.0], ());
            }
        }
        for component in tarjan_scc(&graph) {
            let cyclic = component.len() > 1
                || component
                    .first()
                    .is_some_and(|&node| graph.contains_edge(node, node));
            if cyclic {
                let mut steps: Vec<String> = component
                    .iter()
                    .map(|node| label(&self.steps[graph[*node].0]))
                    .collect();
                steps.sort();
                issues.push(GraphIssue::Cycle(steps));
            }
        }

        issues
    }
}

/// A consumer without declared fan-in takes input from anyone
fn accepts(consumer: &StepDef, producer: &str) -> bool {
    consumer.fan_in.is_empty() || consumer.fan_in.contains(producer)
}

fn label(def: &StepDef) -> String {
    label_of(&def.workflow, &def.name)
}

fn label_of(workflow: &str, name: &str) -> String {
    format!("{}.{}", workflow, name)
}

/// A structural problem found by `WorkflowGraph::validate`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphIssue {
    UnknownFanOut { step: String, target: String },
    UnknownFanIn { step: String, source: String },
    /// Only one side declares the edge; it can still be satisfied by a pull
    AsymmetricEdge { from: String, to: String },
    UnknownPath { step: String, workflow: String },
    Cycle(Vec<String>),
}

impl fmt::Display for GraphIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphIssue::UnknownFanOut { step, target } => {
                write!(f, "{} fans out to unknown step '{}'", step, target)
            }
            GraphIssue::UnknownFanIn { step, source } => {
                write!(f, "{} waits on unknown step '{}'", step, source)
            }
            GraphIssue::AsymmetricEdge { from, to } => {
                write!(f, "edge {} -> {} is declared on one side only", from, to)
            }
            GraphIssue::UnknownPath { step, workflow } => {
                write!(f, "{} delegates to unknown workflow '{}'", step, workflow)
            }
            GraphIssue::Cycle(steps) => write!(f, "cycle through {}", steps.join(", ")),
        }
    }
}
