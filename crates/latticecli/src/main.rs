use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use latticecore::{
    ExecutionEvent, Graph, InputPort, Item, MergeMode, NodeEvent, NodeSpec, NodeStatus, Workflow,
};
use latticeruntime::{FlowRuntime, NodeRegistry, RunResult, RuntimeConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lattice")]
#[command(about = "Lattice workflow engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Initial items as a JSON array (a single object is one item)
        #[arg(short, long)]
        input: Option<String>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,

        /// Disable coalescing of identical nodes
        #[arg(long)]
        no_batching: bool,
    },

    /// Validate a workflow file
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List available node types
    Nodes,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    latticenodes::register_all(&mut registry);
    registry
}

fn load_workflow(file: &Path) -> Result<Workflow> {
    let workflow_json = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let workflow: Workflow = serde_json::from_str(&workflow_json)
        .with_context(|| format!("parsing {}", file.display()))?;
    Ok(workflow)
}

fn parse_items(input: Option<String>) -> Result<Vec<Item>> {
    let Some(input) = input else {
        return Ok(vec![Item::new()]);
    };
    let json: serde_json::Value = serde_json::from_str(&input).context("parsing --input")?;
    Ok(match json {
        serde_json::Value::Array(values) => values.into_iter().map(Item::from).collect(),
        other => vec![Item::from(other)],
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            input,
            verbose,
            no_batching,
        } => {
            init_logging(verbose);
            let succeeded = run_workflow(file, input, no_batching).await?;
            if !succeeded {
                std::process::exit(1);
            }
        }

        Commands::Validate { file } => {
            init_logging(false);
            validate_workflow(file)?;
        }

        Commands::Nodes => {
            list_nodes();
        }

        Commands::Init { output } => {
            create_example_workflow(output)?;
        }
    }

    Ok(())
}

async fn run_workflow(file: PathBuf, input: Option<String>, no_batching: bool) -> Result<bool> {
    println!("🚀 Loading workflow from: {}", file.display());

    let workflow = load_workflow(&file)?;
    println!("📋 Workflow: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Connections: {}", workflow.connections.len());
    println!();

    let items = parse_items(input)?;

    let mut config = RuntimeConfig::from_env();
    if no_batching {
        config.batching = false;
    }
    tracing::debug!("Runtime configuration: {:?}", config);
    let runtime = FlowRuntime::with_registry(Arc::new(registry()), config);

    let names: std::collections::HashMap<_, _> = workflow
        .nodes
        .iter()
        .map(|n| (n.id, n.display_name().to_string()))
        .collect();
    let name_of = move |id| names.get(&id).cloned().unwrap_or_else(|| format!("{}", id));

    // Subscribe to events for real-time output
    let mut events = runtime.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExecutionEvent::RunStarted { node_count, .. } => {
                    println!("▶️  Run started ({} nodes)", node_count);
                }
                ExecutionEvent::NodeStateChanged {
                    node_id, status, ..
                } => match status {
                    NodeStatus::Dispatched => println!("  ⚡ Dispatching {}", name_of(node_id)),
                    NodeStatus::Succeeded => println!("  ✅ {} succeeded", name_of(node_id)),
                    NodeStatus::Failed => println!("  ❌ {} failed", name_of(node_id)),
                    NodeStatus::Skipped { reason } => {
                        println!("  ⏭️  {} skipped ({:?})", name_of(node_id), reason)
                    }
                    NodeStatus::Pending | NodeStatus::Ready => {}
                },
                ExecutionEvent::AttemptFailed {
                    node_id,
                    attempt,
                    error,
                    retry_in_ms,
                    ..
                } => {
                    println!(
                        "  🔁 {} attempt {} failed: {} (retrying in {}ms)",
                        name_of(node_id),
                        attempt,
                        error.message,
                        retry_in_ms
                    );
                }
                ExecutionEvent::NodeEvent { node_id, event, .. } => match event {
                    NodeEvent::Info { message } => {
                        println!("     ℹ️  [{}] {}", name_of(node_id), message);
                    }
                    NodeEvent::Warning { message } => {
                        println!("     ⚠️  [{}] {}", name_of(node_id), message);
                    }
                    NodeEvent::Progress { percent, message } => {
                        if let Some(msg) = message {
                            println!("     📊 [{}] {}% - {}", name_of(node_id), percent, msg);
                        } else {
                            println!("     📊 [{}] {}%", name_of(node_id), percent);
                        }
                    }
                },
                ExecutionEvent::RunCompleted {
                    finished,
                    duration_ms,
                    ..
                } => {
                    if finished {
                        println!("✨ Run finished in {}ms", duration_ms);
                    } else {
                        println!("💥 Run stopped after {}ms", duration_ms);
                    }
                    break;
                }
            }
        }
    });

    let result = runtime.execute(&workflow, items).await?;
    let _ = event_task.await;

    print_summary(&workflow, &result)?;
    Ok(result.finished && result.error.is_none())
}

fn print_summary(workflow: &Workflow, result: &RunResult) -> Result<()> {
    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", result.execution_id);
    println!(
        "   Succeeded: {}, failed: {}, skipped: {} (of {} nodes)",
        result.succeeded(),
        result.failed(),
        result.skipped(),
        workflow.nodes.len()
    );
    if let Some(error) = &result.error {
        println!("   Error: {} ({:?})", error.message, error.class);
    }

    println!();
    println!("📤 Outputs:");
    for node in &workflow.nodes {
        let Some(record) = result.run_data.latest(node.id) else {
            continue;
        };
        let Some(outputs) = record.outputs() else {
            continue;
        };
        println!("   {}:", node.display_name());
        for (port, items) in node.outputs.iter().zip(outputs) {
            let fields: Vec<_> = items.iter().map(|item| &item.fields).collect();
            println!("     {}: {}", port, serde_json::to_string(&fields)?);
        }
    }
    Ok(())
}

fn validate_workflow(file: PathBuf) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());

    let workflow = load_workflow(&file)?;
    let graph = Graph::from_workflow(&workflow)?;
    graph.topological_order()?;

    let registry = registry();
    for node in &workflow.nodes {
        registry
            .create_node(&node.node_type, &node.parameters)
            .with_context(|| format!("node '{}'", node.display_name()))?;
    }

    println!("✅ Workflow is valid:");
    println!("   Name: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Connections: {}", workflow.connections.len());

    Ok(())
}

fn list_nodes() {
    println!("📦 Available Node Types:");
    println!();

    let registry = registry();
    for node_type in registry.list_node_types() {
        if let Some(metadata) = registry.get_metadata(&node_type) {
            let batching = if metadata.batchable { ", batchable" } else { "" };
            println!("  • {} ({}{})", node_type, metadata.category, batching);
            println!("    {}", metadata.description);
        } else {
            println!("  • {}", node_type);
        }
    }
}

fn create_example_workflow(output: PathBuf) -> Result<()> {
    let mut workflow = Workflow::new("Example Fan-out Workflow");
    workflow.description =
        Some("Tags items on two branches and merges them back pairwise".to_string());

    let log_input = NodeSpec::new("debug.log")
        .with_name("Log Input")
        .with_parameter("label", "input")
        .with_position(100.0, 200.0);
    let tag_left = NodeSpec::new("transform.set")
        .with_name("Tag Left")
        .with_parameter("fields", serde_json::json!({ "branch": "left" }))
        .with_position(300.0, 100.0);
    let tag_right = NodeSpec::new("transform.set")
        .with_name("Tag Right")
        .with_parameter("fields", serde_json::json!({ "checked": true }))
        .with_position(300.0, 300.0);
    let merge = NodeSpec::new("debug.log")
        .with_name("Merge")
        .with_parameter("label", "merged")
        .with_inputs(vec![InputPort::new("left"), InputPort::new("right")])
        .with_merge(MergeMode::Pairwise)
        .with_position(500.0, 200.0);

    let log_id = workflow.add_node(log_input);
    let left_id = workflow.add_node(tag_left);
    let right_id = workflow.add_node(tag_right);
    let merge_id = workflow.add_node(merge);

    workflow.connect_main(log_id, left_id);
    workflow.connect_main(log_id, right_id);
    workflow.connect(left_id, "main", merge_id, "left");
    workflow.connect(right_id, "main", merge_id, "right");

    let json = serde_json::to_string_pretty(&workflow)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  lattice run --file {} --input '[{{\"name\": \"a\"}}, {{\"name\": \"b\"}}]'",
        output.display()
    );

    Ok(())
}
