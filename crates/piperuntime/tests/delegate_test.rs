use pipecore::{NodeEvent, NodeState, PipelineNode, Record, RunConfig, StepContext, StepDef, StepError};
use piperuntime::{FunctionModule, ModuleRegistry, PipelineRuntime, WorkflowGraph};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

fn find<'a>(nodes: &'a [PipelineNode], name: &str) -> Option<&'a PipelineNode> {
    nodes.iter().find(|n| n.name() == name)
}

/// `outer.start -> [inner.ia] -> tail`, with `[inner.ib] -> after` mirrored
/// from the nested `inner` run of `ia -> ib`.
fn composed_graph() -> WorkflowGraph {
    WorkflowGraph::new(vec![
        StepDef::new("outer", "start", "start")
            .with_fan_out(["inner.ia"])
            .entrypoint(),
        StepDef::new("outer", "inner.ia", "ia")
            .with_path("inner")
            .with_fan_in(["start"])
            .with_fan_out(["inner.ib", "tail"]),
        StepDef::new("outer", "inner.ib", "ib")
            .with_fan_in(["inner.ia"])
            .with_fan_out(["after"]),
        StepDef::new("outer", "tail", "tail").with_fan_in(["inner.ia"]),
        StepDef::new("outer", "after", "after").with_fan_in(["inner.ib"]),
        StepDef::new("inner", "ia", "ia").with_fan_out(["ib"]).entrypoint(),
        StepDef::new("inner", "ib", "ib").with_fan_in(["ia"]),
    ])
    .expect("valid graph")
}

struct Counters {
    tail: Arc<AtomicUsize>,
    after: Arc<AtomicUsize>,
    seen_after: Arc<Mutex<Option<Record>>>,
}

fn composed_runtime(ia_fails: bool) -> (PipelineRuntime, Counters) {
    init_tracing();
    let counters = Counters {
        tail: Arc::default(),
        after: Arc::default(),
        seen_after: Arc::default(),
    };

    let tail = counters.tail.clone();
    let after = counters.after.clone();
    let seen_after = counters.seen_after.clone();
    let outer = FunctionModule::new()
        .with_fn("start", |_input: Record, _ctx: StepContext| async {
            Ok(json!({ "seed": 5 }))
        })
        .with_fn("tail", move |_input: Record, _ctx: StepContext| {
            tail.fetch_add(1, Ordering::SeqCst);
            async { Ok(json!({})) }
        })
        .with_fn("after", move |input: Record, _ctx: StepContext| {
            after.fetch_add(1, Ordering::SeqCst);
            *seen_after.lock().unwrap() = Some(input);
            async { Ok(json!({})) }
        });

    let inner = FunctionModule::new()
        .with_fn("ia", move |input: Record, _ctx: StepContext| async move {
            if ia_fails {
                return Err(StepError::runtime("ia failed"));
            }
            let seed = input.get("seed").and_then(Value::as_i64).unwrap_or(0);
            Ok(json!({ "doubled": seed * 2 }))
        })
        .with_fn("ib", |input: Record, _ctx: StepContext| async move {
            let doubled = input.get("doubled").and_then(Value::as_i64).unwrap_or(0);
            Ok(json!({ "ib": doubled + 1 }))
        });

    let mut registry = ModuleRegistry::new();
    registry.bind("outer", outer);
    registry.bind("inner", inner);
    (PipelineRuntime::new(composed_graph(), registry), counters)
}

#[tokio::test]
async fn test_delegate_runs_nested_workflow() {
    let (rt, counters) = composed_runtime(false);
    let events: Arc<Mutex<Vec<NodeEvent>>> = Arc::default();
    let e = events.clone();
    rt.subscribe(None, None, move |event| e.lock().unwrap().push(event.clone()));

    let result = rt.run("outer", "start", RunConfig::default()).await;

    let names: Vec<&str> = result.iter().map(|n| n.name()).collect();
    assert_eq!(result.len(), 4, "got {:?}", names);
    assert!(result.iter().all(|n| n.state == NodeState::Done));
    assert!(find(&result, "inner.ib").is_none(), "mirrored nodes are not terminal");

    let delegate = find(&result, "inner.ia").unwrap();
    assert_eq!(delegate.output.as_ref().unwrap()[0]["doubled"], json!(10));
    assert_eq!(counters.tail.load(Ordering::SeqCst), 1);
    assert_eq!(counters.after.load(Ordering::SeqCst), 1);
    let seen = counters.seen_after.lock().unwrap().clone().unwrap();
    assert_eq!(seen["ib"], json!(11));

    let events = events.lock().unwrap();
    let outer_run = events
        .iter()
        .find(|e| e.node.name() == "start")
        .map(|e| e.run_id)
        .unwrap();
    let nested: Vec<&NodeEvent> = events.iter().filter(|e| e.node.workflow() == "inner").collect();
    assert_eq!(nested.len(), 4, "EXEC and DONE for ia and ib");
    assert!(nested.iter().all(|e| e.parent_run_id == Some(outer_run)));
    assert!(nested.iter().all(|e| e.run_id != outer_run));

    let skipped: Vec<&NodeEvent> = events
        .iter()
        .filter(|e| e.state() == NodeState::Skip)
        .collect();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].node.name(), "inner.ib");
}

#[tokio::test]
async fn test_delegate_round_trip_matches_nested_nodes() {
    let (rt, _counters) = composed_runtime(false);
    let nested_done: Arc<Mutex<Vec<PipelineNode>>> = Arc::default();
    let n = nested_done.clone();
    rt.subscribe(None, Some(NodeState::Done), move |event| {
        if event.parent_run_id.is_some() {
            n.lock().unwrap().push(event.node.clone());
        }
    });
    let mirrored: Arc<Mutex<Option<PipelineNode>>> = Arc::default();
    let m = mirrored.clone();
    rt.subscribe(Some("inner.ib"), Some(NodeState::Skip), move |event| {
        *m.lock().unwrap() = Some(event.node.clone());
    });

    let result = rt.run("outer", "start", RunConfig::default()).await;

    let nested = nested_done.lock().unwrap();
    let ia = find(&nested, "ia").unwrap();
    let ib = find(&nested, "ib").unwrap();

    let delegate = find(&result, "inner.ia").unwrap();
    assert_eq!(delegate.input, ia.input);
    assert_eq!(delegate.output, ia.output);
    assert_eq!(delegate.args()["seed"], json!(5));

    let mirror = mirrored.lock().unwrap().clone().unwrap();
    assert_eq!(mirror.input, ib.input);
    assert_eq!(mirror.output, ib.output);
}

#[tokio::test]
async fn test_nested_failure_fails_delegate() {
    let (rt, counters) = composed_runtime(true);

    let result = rt.run("outer", "start", RunConfig::default()).await;

    let delegate = find(&result, "inner.ia").unwrap();
    assert_eq!(delegate.state, NodeState::Failed);
    assert_eq!(delegate.error.as_deref(), Some("ia failed"));
    assert_eq!(counters.tail.load(Ordering::SeqCst), 0);
    assert_eq!(counters.after.load(Ordering::SeqCst), 0);
    assert!(find(&result, "tail").is_none());
}

#[tokio::test]
async fn test_non_entrypoint_target_runs_locally() {
    init_tracing();
    let graph = WorkflowGraph::new(vec![
        StepDef::new("outer", "s", "s").with_fan_out(["inner.helper"]).entrypoint(),
        StepDef::new("outer", "inner.helper", "helper")
            .with_path("inner")
            .with_fan_in(["s"]),
        StepDef::new("inner", "helper", "helper"),
    ])
    .unwrap();

    let local = Arc::new(AtomicUsize::new(0));
    let nested = Arc::new(AtomicUsize::new(0));
    let l = local.clone();
    let n = nested.clone();
    let mut registry = ModuleRegistry::new();
    registry.bind(
        "outer",
        FunctionModule::new()
            .with_fn("s", |_input: Record, _ctx: StepContext| async { Ok(json!({})) })
            .with_fn("helper", move |_input: Record, _ctx: StepContext| {
                l.fetch_add(1, Ordering::SeqCst);
                async { Ok(json!({ "local": true })) }
            }),
    );
    registry.bind(
        "inner",
        FunctionModule::new().with_fn("helper", move |_input: Record, _ctx: StepContext| {
            n.fetch_add(1, Ordering::SeqCst);
            async { Ok(json!({})) }
        }),
    );
    let rt = PipelineRuntime::new(graph, registry);

    let result = rt.run("outer", "s", RunConfig::default()).await;

    assert_eq!(local.load(Ordering::SeqCst), 1);
    assert_eq!(nested.load(Ordering::SeqCst), 0);
    let helper = find(&result, "inner.helper").unwrap();
    assert_eq!(helper.state, NodeState::Done);
    assert_eq!(helper.output.as_ref().unwrap()[0]["local"], json!(true));
}

#[tokio::test]
async fn test_event_stream_sees_nested_runs() {
    let (rt, _counters) = composed_runtime(false);
    let mut rx = rt.subscribe_events();

    rt.run("outer", "start", RunConfig::default()).await;

    let mut nested = 0;
    let mut total = 0;
    while let Ok(event) = rx.try_recv() {
        total += 1;
        if event.parent_run_id.is_some() {
            nested += 1;
        }
    }
    assert_eq!(nested, 4);
    // start, delegate, tail and after each EXEC + DONE, plus one SKIP
    assert_eq!(total, 13);
}
