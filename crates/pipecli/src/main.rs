use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pipecore::{NodeEvent, NodeState, Record, RunConfig, StepDef, WorkflowError};
use piperuntime::{ModuleRegistry, PipelineRuntime, WorkflowGraph};
use serde_json::Value;
use std::path::PathBuf;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pipe")]
#[command(about = "Pipeline Engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow from one of its entry steps
    Run {
        /// Graph definition files (JSON arrays of steps)
        #[arg(short, long = "file", required = true)]
        files: Vec<PathBuf>,

        /// Workflow to run
        #[arg(short, long)]
        workflow: String,

        /// Entry step name
        #[arg(short, long)]
        step: String,

        /// Args for the entry step as a JSON object
        #[arg(long)]
        args: Option<String>,

        /// Run scope as JSON
        #[arg(long)]
        scope: Option<String>,

        /// Global context as JSON
        #[arg(long)]
        global: Option<String>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Check graph definition files for structural problems
    Validate {
        /// Graph definition files
        #[arg(short, long = "file", required = true)]
        files: Vec<PathBuf>,
    },

    /// List the standard step functions
    Functions,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            files,
            workflow,
            step,
            args,
            scope,
            global,
            verbose,
        } => {
            let default_level = if verbose { "debug" } else { "info" };
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| EnvFilter::new(default_level)),
                )
                .init();

            let config = RunConfig {
                args: args.as_deref().map(parse_object).transpose()?,
                scope: scope.as_deref().map(parse_json).transpose()?.unwrap_or_default(),
                global: global.as_deref().map(parse_json).transpose()?.unwrap_or_default(),
            };
            run_workflow(files, &workflow, &step, config).await?;
        }

        Commands::Validate { files } => {
            validate_graph(files)?;
        }

        Commands::Functions => {
            list_functions();
        }

        Commands::Init { output } => {
            create_example_workflow(output)?;
        }
    }

    Ok(())
}

fn parse_json(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("Invalid JSON: {}", raw))
}

fn parse_object(raw: &str) -> Result<Record> {
    match parse_json(raw)? {
        Value::Object(record) => Ok(record),
        _ => bail!("Args must be a JSON object"),
    }
}

fn load_graph(files: &[PathBuf]) -> Result<WorkflowGraph> {
    for file in files {
        println!("🚀 Loading graph from: {}", file.display());
    }
    WorkflowGraph::from_paths(files).context("Failed to load graph")
}

async fn run_workflow(files: Vec<PathBuf>, workflow: &str, step: &str, config: RunConfig) -> Result<()> {
    let graph = load_graph(&files)?;
    println!("📋 Steps: {}", graph.len());
    println!("   Workflows: {}", graph.workflows().join(", "));
    println!();

    if graph.entrypoint(workflow, step).is_none() {
        return Err(WorkflowError::NotFound(format!("entry step {}.{}", workflow, step)).into());
    }

    // Every workflow gets the standard library
    let mut registry = ModuleRegistry::new();
    for name in graph.workflows() {
        pipenodes::register_all(&mut registry, name);
    }
    tracing::debug!("Standard library bound to {} workflow(s)", registry.workflows().len());

    let runtime = PipelineRuntime::new(graph, registry);

    // Subscribe to events for real-time output
    let events = runtime.subscribe_events();
    let event_task = tokio::spawn(print_events(events));

    let result = runtime.run(workflow, step, config).await;

    // Closing the channel lets the printer drain and exit
    drop(runtime);
    event_task.await?;

    let failed = result.iter().filter(|n| n.state == NodeState::Failed).count();
    println!();
    println!("📊 Execution Summary:");
    println!("   Completed: {}/{} nodes", result.len() - failed, result.len());

    if !result.is_empty() {
        println!();
        println!("📤 Outputs:");
        for node in &result {
            match (&node.output, &node.error) {
                (_, Some(error)) => println!("   {}: error: {}", node, error),
                (Some(output), None) => println!("   {}: {}", node, serde_json::to_string(output)?),
                (None, None) => println!("   {}: (no output)", node),
            }
        }
    }

    if failed > 0 {
        println!();
        println!("💥 {} node(s) failed", failed);
    }

    Ok(())
}

/// Print events until the channel closes. Returns how many were printed.
async fn print_events(mut events: broadcast::Receiver<NodeEvent>) -> usize {
    let mut printed = 0;
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                println!("  ⚠️  {} events dropped", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        printed += 1;
        let indent = if event.parent_run_id.is_some() { "    " } else { "  " };
        let node = &event.node;
        match node.state {
            NodeState::Exec => println!("{}⚡ Starting {}", indent, node),
            NodeState::Wait => println!("{}⏳ {} waiting", indent, node),
            NodeState::Done => println!("{}✅ {} done", indent, node),
            NodeState::Skip => println!("{}↪️  {} filled from nested run", indent, node),
            NodeState::Failed => println!(
                "{}❌ {} failed: {}",
                indent,
                node,
                node.error.as_deref().unwrap_or_default()
            ),
            NodeState::Idle => {}
        }
    }
    printed
}

fn validate_graph(files: Vec<PathBuf>) -> Result<()> {
    let graph = load_graph(&files)?;
    println!("🔍 Validating {} steps", graph.len());

    let issues = graph.validate();
    if issues.is_empty() {
        println!("✅ Graph is valid:");
        println!("   Workflows: {}", graph.workflows().join(", "));
        return Ok(());
    }

    println!("⚠️  {} issue(s) found:", issues.len());
    for issue in &issues {
        println!("   • {}", issue);
    }
    Ok(())
}

fn list_functions() {
    println!("📦 Standard Functions:");
    println!();

    for (name, metadata) in pipenodes::module().list() {
        if let Some(metadata) = metadata {
            println!("  • {} ({})", name, metadata.category);
            println!("    {}", metadata.description);
        } else {
            println!("  • {}", name);
        }
    }
}

fn create_example_workflow(output: PathBuf) -> Result<()> {
    let steps = vec![
        StepDef::new("example", "numbers", "seq.range")
            .with_arg("end", 3)
            .with_fan_out(["log"])
            .entrypoint(),
        StepDef::new("example", "log", "debug.log")
            .with_arg("message", "got a number")
            .with_fan_in(["numbers"]),
    ];

    let json = serde_json::to_string_pretty(&steps)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  pipe run --file {} --workflow example --step numbers", output.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipecore::{PipelineNode, RunId};
    use std::sync::Arc;

    #[tokio::test]
    async fn printer_survives_lagging_behind() {
        let (sender, receiver) = broadcast::channel(2);
        let node = PipelineNode::new(Arc::new(StepDef::new("w", "a", "a")));
        for _ in 0..5 {
            sender.send(NodeEvent::new(RunId::nil(), None, node.clone())).unwrap();
        }
        drop(sender);

        // the three oldest events were overwritten
        assert_eq!(print_events(receiver).await, 2);
    }
}
