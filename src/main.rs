use clap::{Parser, Subcommand};
use clusterweave::config::ClusterRunDescriptor;
use clusterweave::distributed::agent_server::{AgentState, DryRunRuntime, serve};
use clusterweave::distributed::{
  CoordinatorConfig, GraphSplitter, HttpNodeAgent, PortAllocator, RunCoordinator, RunScope,
};
use clusterweave::sequence::{FileSequenceStore, SequenceService};
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "clusterweave")]
#[command(about = "Run dataflow graphs across a cluster of node agents")]
struct Cli {
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Print the physical sub-graphs a run descriptor splits into.
  Split {
    /// Run descriptor (JSON).
    descriptor: PathBuf,
  },
  /// Execute a run descriptor against the cluster's node agents.
  Run {
    /// Run descriptor (JSON).
    descriptor: PathBuf,
    /// Run id, unique per execution of the graph.
    #[arg(long)]
    run_id: String,
  },
  /// Serve a node agent that records the run lifecycle without executing steps.
  ///
  /// With `--sequences` the agent also hands out sequence blocks. Serve
  /// sequences from one node per cluster, usually the coordinator.
  Agent {
    /// Address the control surface listens on.
    #[arg(long, default_value = "0.0.0.0:8081")]
    bind: String,
    /// Node id reported in status replies.
    #[arg(long)]
    node_id: String,
    /// File backing the node's sequences.
    ///
    /// Only one node may serve a given file. The store locks within a single
    /// process, so two agents sharing the file can hand out overlapping blocks.
    #[arg(long)]
    sequences: Option<PathBuf>,
    /// Create unknown sequences starting at this value.
    #[arg(long)]
    auto_create: Option<i64>,
  },
}

#[tokio::main]
async fn main() -> ExitCode {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    )
    .init();

  let cli = Cli::parse();
  let outcome = match cli.command {
    Command::Split { descriptor } => split(descriptor),
    Command::Run { descriptor, run_id } => run(descriptor, run_id).await,
    Command::Agent {
      bind,
      node_id,
      sequences,
      auto_create,
    } => agent(bind, node_id, sequences, auto_create).await,
  };

  match outcome {
    Ok(code) => code,
    Err(e) => {
      error!(error = %e, "clusterweave failed");
      ExitCode::FAILURE
    }
  }
}

fn split(descriptor: PathBuf) -> Result<ExitCode, Box<dyn Error>> {
  let descriptor = ClusterRunDescriptor::from_path(descriptor)?.apply_env();
  descriptor.validate()?;
  let plan = GraphSplitter::default().split(
    &descriptor.graph,
    &descriptor.cluster,
    &descriptor.partition_schemas,
  )?;
  println!("{}", serde_json::to_string_pretty(&plan)?);
  Ok(ExitCode::SUCCESS)
}

async fn run(descriptor: PathBuf, run_id: String) -> Result<ExitCode, Box<dyn Error>> {
  let descriptor = ClusterRunDescriptor::from_path(descriptor)?.apply_env();
  descriptor.validate()?;
  let scope = RunScope::new(run_id, descriptor.graph.name());

  let coordinator = Arc::new(RunCoordinator::new(
    Arc::new(HttpNodeAgent::new()),
    Arc::new(PortAllocator::new()),
    CoordinatorConfig::from_env(),
  ));

  let interrupt = {
    let coordinator = Arc::clone(&coordinator);
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        warn!("Interrupted, stopping the run");
        coordinator.stop().await;
      }
    })
  };

  let result = coordinator
    .execute(
      &descriptor.graph,
      &descriptor.cluster,
      &descriptor.partition_schemas,
      &scope,
    )
    .await;
  interrupt.abort();

  let result = result?;
  println!("{}", serde_json::to_string_pretty(&result)?);
  info!(
    scope = %scope,
    phase = %result.phase,
    errors = result.errors,
    rows_read = result.health.rows_read,
    rows_written = result.health.rows_written,
    "Run complete"
  );
  if result.is_success() {
    Ok(ExitCode::SUCCESS)
  } else {
    Ok(ExitCode::FAILURE)
  }
}

async fn agent(
  bind: String,
  node_id: String,
  sequences: Option<PathBuf>,
  auto_create: Option<i64>,
) -> Result<ExitCode, Box<dyn Error>> {
  let mut state = AgentState::new(node_id, Arc::new(DryRunRuntime::new()));
  if let Some(path) = sequences {
    let mut service = SequenceService::new(Arc::new(FileSequenceStore::new(path)));
    if let Some(initial) = auto_create {
      service = service.with_auto_create(initial);
    }
    state = state.with_sequences(service);
  }

  let shutdown = CancellationToken::new();
  {
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutting down node agent");
        shutdown.cancel();
      }
    });
  }

  let listener = tokio::net::TcpListener::bind(&bind).await?;
  serve(listener, state, shutdown).await?;
  Ok(ExitCode::SUCCESS)
}
