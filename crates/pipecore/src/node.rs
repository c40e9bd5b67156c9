use crate::StepError;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

/// A keyword record flowing between steps
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Records produced by one execution; each element propagates independently
pub type Output = Vec<Record>;

/// Lifecycle of a node within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Idle,
    Wait,
    Exec,
    Done,
    Failed,
    /// Output was supplied by a delegated run; never executed locally
    Skip,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NodeState::Idle => "idle",
            NodeState::Wait => "wait",
            NodeState::Exec => "exec",
            NodeState::Done => "done",
            NodeState::Failed => "failed",
            NodeState::Skip => "skip",
        };
        f.write_str(label)
    }
}

/// Static definition of one step, as declared in a graph definition file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDef {
    pub name: String,
    pub function: String,
    #[serde(default)]
    pub path: Option<String>,
    pub workflow: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub args: Record,
    #[serde(default, deserialize_with = "null_as_default")]
    pub fan_in: BTreeSet<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub fan_out: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub entrypoint: bool,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl StepDef {
    pub fn new(
        workflow: impl Into<String>,
        name: impl Into<String>,
        function: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            function: function.into(),
            path: None,
            workflow: workflow.into(),
            args: Record::new(),
            fan_in: BTreeSet::new(),
            fan_out: Vec::new(),
            entrypoint: false,
        }
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    pub fn with_fan_in<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fan_in.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_fan_out<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fan_out.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_path(mut self, workflow: impl Into<String>) -> Self {
        self.path = Some(workflow.into());
        self
    }

    pub fn entrypoint(mut self) -> Self {
        self.entrypoint = true;
        self
    }
}

/// One step's static definition plus its mutable state for a single run.
///
/// Instances are created fresh from the shared `StepDef` at the start of
/// every run and only mutated by that run's scheduler. Snapshots handed to
/// event subscribers and returned from a run are plain clones.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineNode {
    #[serde(flatten)]
    def: Arc<StepDef>,
    /// Static args overlaid with run-supplied ones
    pub run_args: Record,
    pub fan_in_check: BTreeSet<String>,
    pub fan_out_pending: Option<String>,
    /// Waiting nodes that asked for this node's output while it was busy
    pub pulled_by: BTreeSet<String>,
    /// Deliveries that arrived during execution, applied one activation at a time
    #[serde(skip)]
    pub queued: VecDeque<(String, Record)>,
    pub state: NodeState,
    pub input: Record,
    pub output: Option<Output>,
    pub error: Option<String>,
    pub activations: usize,
}

impl PipelineNode {
    pub fn new(def: Arc<StepDef>) -> Self {
        let run_args = def.args.clone();
        Self {
            def,
            run_args,
            fan_in_check: BTreeSet::new(),
            fan_out_pending: None,
            pulled_by: BTreeSet::new(),
            queued: VecDeque::new(),
            state: NodeState::Idle,
            input: Record::new(),
            output: None,
            error: None,
            activations: 0,
        }
    }

    pub fn def(&self) -> &Arc<StepDef> {
        &self.def
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn function(&self) -> &str {
        &self.def.function
    }

    pub fn workflow(&self) -> &str {
        &self.def.workflow
    }

    pub fn path(&self) -> Option<&str> {
        self.def.path.as_deref()
    }

    pub fn is_entrypoint(&self) -> bool {
        self.def.entrypoint
    }

    pub fn fan_in(&self) -> &BTreeSet<String> {
        &self.def.fan_in
    }

    pub fn fan_out(&self) -> &[String] {
        &self.def.fan_out
    }

    pub fn args(&self) -> &Record {
        &self.run_args
    }

    /// Every declared predecessor has delivered, and nothing else has
    pub fn is_ready(&self) -> bool {
        self.fan_in_check == self.def.fan_in
    }

    pub fn can_execute(&self) -> bool {
        matches!(self.state, NodeState::Idle | NodeState::Wait)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, NodeState::Done | NodeState::Failed)
    }

    /// Accumulated input overlaid with args; args win on collision
    pub fn effective_input(&self) -> Record {
        let mut merged = self.input.clone();
        merged.extend(self.run_args.clone());
        merged
    }

    /// Overlay run-supplied args on top of the declared ones
    pub fn merge_args(&mut self, args: &Record) {
        self.run_args.extend(args.clone());
    }

    /// Accept one output record from predecessor `from`.
    ///
    /// Returns true when the node should be advanced now. A failed or
    /// mirrored node drops the record; an executing one queues it for the
    /// activation after the current one.
    pub fn deliver(&mut self, from: &str, record: &Record) -> bool {
        match self.state {
            NodeState::Failed | NodeState::Skip => return false,
            NodeState::Exec => {
                self.queued.push_back((from.to_string(), record.clone()));
                return false;
            }
            NodeState::Idle | NodeState::Wait | NodeState::Done => {}
        }
        self.state = NodeState::Idle;
        self.input.extend(record.clone());
        if self.def.fan_in.contains(from) {
            self.fan_in_check.insert(from.to_string());
        }
        true
    }

    /// Apply the oldest delivery queued during execution.
    ///
    /// Returns true when the node took it and should be advanced. A failed
    /// node discards whatever is left.
    pub fn take_queued(&mut self) -> bool {
        while let Some((from, record)) = self.queued.pop_front() {
            if self.deliver(&from, &record) {
                return true;
            }
        }
        false
    }

    pub fn begin(&mut self) {
        self.state = NodeState::Exec;
        self.activations += 1;
    }

    pub fn complete(&mut self, output: Option<Output>) {
        self.output = output;
        self.error = None;
        self.state = NodeState::Done;
        self.fan_in_check.clear();
    }

    pub fn fail(&mut self, error: &StepError) {
        self.fail_with(error.to_string());
    }

    pub fn fail_with(&mut self, error: impl Into<String>) {
        self.output = None;
        self.error = Some(error.into());
        self.state = NodeState::Failed;
    }

    /// Copy the data-bearing fields of a node from another run
    pub fn mirror(&mut self, other: &PipelineNode) {
        self.input = other.input.clone();
        self.run_args = other.run_args.clone();
        self.output = other.output.clone();
        self.error = other.error.clone();
    }
}

impl fmt::Display for PipelineNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.def.path {
            Some(_) => write!(f, "[{}]", self.def.name),
            None => write!(f, "[{}.{}]", self.def.workflow, self.def.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(def: StepDef) -> PipelineNode {
        PipelineNode::new(Arc::new(def))
    }

    #[test]
    fn readiness_requires_exact_fan_in() {
        let mut n = node(StepDef::new("w", "c", "c").with_fan_in(["a", "b"]));
        assert!(!n.is_ready());

        n.deliver("a", &Record::new());
        assert!(!n.is_ready());

        // deliveries from undeclared producers never count
        n.deliver("x", &Record::new());
        assert!(!n.is_ready());
        assert!(!n.fan_in_check.contains("x"));

        n.deliver("b", &Record::new());
        assert!(n.is_ready());
    }

    #[test]
    fn duplicate_fan_in_collapses() {
        let n = node(StepDef::new("w", "c", "c").with_fan_in(["a", "a"]));
        assert_eq!(n.fan_in().len(), 1);
    }

    #[test]
    fn args_win_over_input() {
        let mut n = node(StepDef::new("w", "a", "a").with_arg("foo", "bar"));
        let record = json!({"foo": "input", "other": 1});
        n.deliver("p", record.as_object().unwrap());

        let merged = n.effective_input();
        assert_eq!(merged["foo"], json!("bar"));
        assert_eq!(merged["other"], json!(1));
    }

    #[test]
    fn failed_and_skipped_nodes_refuse_delivery() {
        let mut n = node(StepDef::new("w", "a", "a"));
        n.fail_with("boom");
        assert!(!n.deliver("p", &Record::new()));
        assert_eq!(n.state, NodeState::Failed);

        let mut s = node(StepDef::new("w", "b", "b"));
        s.state = NodeState::Skip;
        assert!(!s.deliver("p", &Record::new()));
    }

    #[test]
    fn deliveries_during_execution_are_queued() {
        let mut n = node(StepDef::new("w", "e", "e"));
        assert!(n.deliver("b", json!({"from_b": 1}).as_object().unwrap()));
        n.begin();

        assert!(!n.deliver("c", json!({"from_c": 1}).as_object().unwrap()));
        assert_eq!(n.queued.len(), 1);
        assert!(!n.input.contains_key("from_c"));

        n.complete(None);
        assert!(n.take_queued());
        assert_eq!(n.state, NodeState::Idle);
        assert_eq!(n.input["from_c"], json!(1));
        assert!(!n.take_queued());
    }

    #[test]
    fn failed_node_discards_queued_deliveries() {
        let mut n = node(StepDef::new("w", "e", "e"));
        n.begin();
        n.deliver("c", &Record::new());
        n.fail_with("boom");

        assert!(!n.take_queued());
        assert!(n.queued.is_empty());
        assert_eq!(n.state, NodeState::Failed);
    }

    #[test]
    fn display_uses_path_for_delegates() {
        let local = node(StepDef::new("w", "a", "a"));
        assert_eq!(local.to_string(), "[w.a]");

        let delegate = node(StepDef::new("w", "other.c", "c").with_path("other"));
        assert_eq!(delegate.to_string(), "[other.c]");
    }

    #[test]
    fn step_def_parses_definition_format() {
        let def: StepDef = serde_json::from_value(json!({
            "name": "b",
            "function": "b",
            "path": null,
            "workflow": "a-b",
            "args": null,
            "fanIn": ["a", "a"],
            "fanOut": [],
            "entrypoint": false
        }))
        .unwrap();

        assert_eq!(def.fan_in.len(), 1);
        assert!(def.args.is_empty());
        assert!(def.path.is_none());
    }
}
