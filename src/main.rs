mod builtin;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nodeflow_core::config::AppConfig;
use nodeflow_core::event::{drain, EventBus};
use nodeflow_core::graph::{parse_node_map, to_wire, NodeMap};
use nodeflow_core::queue::JobQueue;
use nodeflow_core::types::{NodeId, RunEvent};
use nodeflow_engine::{resolve, JobRunner, RunMode, RunOutput};
use nodeflow_queue::LocalQueue;

#[derive(Parser)]
#[command(name = "nodeflow", version, about = "Run node-graph workflows")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "nodeflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node map file and print the resulting nodes as JSON
    Run {
        /// Node map JSON file
        file: PathBuf,
        /// Only run these nodes and what they depend on
        #[arg(short, long)]
        select: Vec<NodeId>,
        /// sync, async, distributed or async_distributed
        #[arg(short, long, env = "NODEFLOW_MODE")]
        mode: Option<String>,
        /// Submit the whole run as one job (distributed modes only)
        #[arg(long)]
        same_worker: bool,
        /// Print the run's status changes to stderr when it ends
        #[arg(long)]
        events: bool,
    },
    /// Print the dependency closure of a selection
    Resolve {
        /// Node map JSON file
        file: PathBuf,
        #[arg(short, long, required = true)]
        select: Vec<NodeId>,
    },
    /// List the available node types
    Types,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "nodeflow", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;
    let default_filter = config
        .log
        .filter
        .clone()
        .unwrap_or_else(|| "nodeflow=info,warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            file,
            select,
            mode,
            same_worker,
            events,
        } => {
            let mut runner_config = config.runner.clone();
            if let Some(mode) = mode {
                runner_config.mode = mode;
            }
            runner_config.same_worker |= same_worker;
            run_file(&config, runner_config, &file, &select, events)?;
        }
        Commands::Resolve { file, select } => {
            let nodes = read_node_map(&file)?;
            let mut closure: Vec<NodeId> = resolve(&select, &nodes).into_iter().collect();
            closure.sort();
            for id in closure {
                println!("{}", id);
            }
        }
        Commands::Types => {
            let registry = builtin::registry();
            for name in registry.list() {
                if let Some(entry) = registry.get(name) {
                    println!(
                        "{:<16} [{}]{}  {}",
                        name,
                        entry.outputs.join(", "),
                        if entry.is_async() { " async" } else { "" },
                        entry.description.as_deref().unwrap_or("")
                    );
                }
            }
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        Ok(AppConfig::load(path)?)
    } else {
        Ok(AppConfig::default())
    }
}

fn read_node_map(path: &Path) -> anyhow::Result<NodeMap> {
    let raw = std::fs::read_to_string(path)?;
    Ok(parse_node_map(&raw)?)
}

fn run_file(
    config: &AppConfig,
    runner_config: nodeflow_core::config::RunnerConfig,
    file: &Path,
    select: &[NodeId],
    events: bool,
) -> anyhow::Result<()> {
    let nodes = read_node_map(file)?;
    let registry = Arc::new(builtin::registry());

    let distributed = runner_config
        .mode
        .parse::<RunMode>()
        .map(|m| m.is_distributed())
        .unwrap_or(false);
    let default_queue = distributed
        .then(|| Arc::new(LocalQueue::new(config.queue.name.clone())) as Arc<dyn JobQueue>);

    let event_bus = Arc::new(EventBus::new(4096));
    let mut rx = event_bus.subscribe();
    let runner = JobRunner::from_config(&runner_config, registry, default_queue)?
        .with_event_bus(event_bus);
    info!(file = %file.display(), mode = %runner.mode(), "Starting run");

    let selected = (!select.is_empty()).then_some(select);
    let output = runner.run(nodes, selected)?;
    let output = match output {
        RunOutput::Pending(_) | RunOutput::PendingJob(_) => drive(output)?,
        done => done,
    };

    if events {
        for event in drain(&mut rx) {
            print_event(&event);
        }
    }

    match output {
        RunOutput::Empty => warn!("Node map is empty, nothing to run"),
        RunOutput::Completed(nodes) => {
            for node in nodes.values() {
                if let Some(job) = &node.job {
                    info!(
                        node_id = %node.id,
                        job_id = %job.id(),
                        status = ?job.status(),
                        "Job state"
                    );
                }
            }
            println!("{}", serde_json::to_string_pretty(&to_wire(&nodes)?)?);
        }
        RunOutput::Job(job) => {
            info!(job_id = %job.id(), status = ?job.status(), "Same-worker job state");
            match (job.result(), job.error()) {
                (Some(result), _) => println!("{}", serde_json::to_string_pretty(&result)?),
                (None, Some(error)) => anyhow::bail!("job {} failed: {}", job.id(), error),
                (None, None) => println!("job {} is {:?}", job.id(), job.status()),
            }
        }
        RunOutput::Pending(_) | RunOutput::PendingJob(_) => {
            unreachable!("pending outputs are driven above")
        }
    }
    Ok(())
}

/// Drive an async-mode run on a runtime owned by the command.
fn drive(output: RunOutput) -> anyhow::Result<RunOutput> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let done = match output {
        RunOutput::Pending(fut) => RunOutput::Completed(runtime.block_on(fut)?),
        RunOutput::PendingJob(fut) => RunOutput::Job(runtime.block_on(fut)?),
        other => other,
    };
    Ok(done)
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::RunStarted { mode, nodes } => eprintln!("run started: {} nodes ({})", nodes, mode),
        RunEvent::NodeStatus { node_id, status } => eprintln!("  {} -> {}", node_id, status),
        RunEvent::JobSubmitted { node_id, job_id } => {
            eprintln!("  {} submitted as job {}", node_id, job_id)
        }
        RunEvent::RunFinished { nodes, failed } => {
            eprintln!("run finished: {} nodes, {} failed", nodes, failed)
        }
    }
}
