//! Node side of the control surface.
//!
//! [`router`] exposes the routes [`HttpNodeAgent`](super::http_agent::HttpNodeAgent)
//! calls and forwards them to a [`StepRuntime`], the collaborator that
//! actually executes sub-graphs (adapters included) on this node. When a
//! [`SequenceService`] is attached, the node also serves sequence blocks.
//!
//! ```rust,no_run
//! use clusterweave::distributed::agent_server::{AgentState, DryRunRuntime, serve};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> std::io::Result<()> {
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8081").await?;
//! let state = AgentState::new("slave1", Arc::new(DryRunRuntime::new()));
//! serve(listener, state, CancellationToken::new()).await
//! # }
//! ```

use crate::distributed::agent::{AgentReply, NodePhase, NodeRunStatus, RunScope, SequenceReply};
use crate::distributed::splitter::PhysicalSubgraph;
use crate::sequence::{SequenceError, SequenceService};
use async_trait::async_trait;
use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Error type returned by a [`StepRuntime`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
  /// No sub-graph was prepared for the scope.
  #[error("Unknown run: {0}")]
  UnknownRun(RunScope),
  /// The call is not valid in the run's current phase.
  #[error("Invalid state: {0}")]
  InvalidState(String),
  /// The runtime could not carry out the call.
  #[error("Runtime failure: {0}")]
  Failed(String),
}

impl RuntimeError {
  fn status_code(&self) -> StatusCode {
    match self {
      RuntimeError::UnknownRun(_) => StatusCode::NOT_FOUND,
      RuntimeError::InvalidState(_) => StatusCode::CONFLICT,
      RuntimeError::Failed(_) => StatusCode::UNPROCESSABLE_ENTITY,
    }
  }
}

/// Executes physical sub-graphs on a node.
///
/// Writer and reader adapters are ordinary steps to the runtime. It must
/// report row and error counters through [`status`](Self::status).
#[async_trait]
pub trait StepRuntime: Send + Sync {
  /// Accepts a sub-graph. Preparing the same scope again before it starts
  /// replaces the sub-graph.
  async fn prepare(&self, scope: &RunScope, subgraph: PhysicalSubgraph) -> Result<(), RuntimeError>;

  /// Starts a prepared sub-graph.
  async fn start(&self, scope: &RunScope) -> Result<(), RuntimeError>;

  /// Reports the sub-graph's status.
  async fn status(&self, scope: &RunScope) -> Result<NodeRunStatus, RuntimeError>;

  /// Stops the sub-graph. Stopping an unknown or terminal run succeeds.
  async fn stop(&self, scope: &RunScope) -> Result<(), RuntimeError>;
}

/// Shared state of the agent server.
#[derive(Clone)]
pub struct AgentState {
  node_id: String,
  runtime: Arc<dyn StepRuntime>,
  sequences: Option<SequenceService>,
}

impl AgentState {
  /// Creates the state for node `node_id`.
  pub fn new(node_id: impl Into<String>, runtime: Arc<dyn StepRuntime>) -> Self {
    Self {
      node_id: node_id.into(),
      runtime,
      sequences: None,
    }
  }

  /// Serves sequence blocks from `service`.
  #[must_use]
  pub fn with_sequences(mut self, service: SequenceService) -> Self {
    self.sequences = Some(service);
    self
  }
}

/// Builds the control surface router.
pub fn router(state: AgentState) -> Router {
  Router::new()
    .route("/runs/:graph/:run_id/prepare", post(prepare))
    .route("/runs/:graph/:run_id/start", post(start))
    .route("/runs/:graph/:run_id/status", get(status))
    .route("/runs/:graph/:run_id/stop", post(stop))
    .route("/sequences/:name/next", get(next_sequence))
    .with_state(state)
}

/// Serves the control surface on `listener` until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(
  listener: TcpListener,
  state: AgentState,
  shutdown: CancellationToken,
) -> std::io::Result<()> {
  info!(node = %state.node_id, addr = ?listener.local_addr().ok(), "Node agent listening");
  axum::serve(listener, router(state))
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
}

type Reply = (StatusCode, Json<AgentReply>);

fn reply(result: Result<(), RuntimeError>) -> Reply {
  match result {
    Ok(()) => (StatusCode::OK, Json(AgentReply::ok())),
    Err(e) => (e.status_code(), Json(AgentReply::error(e.to_string()))),
  }
}

async fn prepare(
  State(state): State<AgentState>,
  Path((graph, run_id)): Path<(String, String)>,
  Json(subgraph): Json<PhysicalSubgraph>,
) -> Reply {
  let scope = RunScope::new(run_id, graph);
  info!(node = %state.node_id, scope = %scope, subgraph = %subgraph.name, "Preparing sub-graph");
  reply(state.runtime.prepare(&scope, subgraph).await)
}

async fn start(
  State(state): State<AgentState>,
  Path((graph, run_id)): Path<(String, String)>,
) -> Reply {
  let scope = RunScope::new(run_id, graph);
  info!(node = %state.node_id, scope = %scope, "Starting sub-graph");
  reply(state.runtime.start(&scope).await)
}

async fn status(
  State(state): State<AgentState>,
  Path((graph, run_id)): Path<(String, String)>,
) -> Result<Json<NodeRunStatus>, Reply> {
  let scope = RunScope::new(run_id, graph);
  match state.runtime.status(&scope).await {
    Ok(mut status) => {
      status.node = state.node_id.clone();
      Ok(Json(status))
    }
    Err(e) => Err(reply(Err(e))),
  }
}

async fn stop(
  State(state): State<AgentState>,
  Path((graph, run_id)): Path<(String, String)>,
) -> Reply {
  let scope = RunScope::new(run_id, graph);
  info!(node = %state.node_id, scope = %scope, "Stopping sub-graph");
  reply(state.runtime.stop(&scope).await)
}

#[derive(Debug, Deserialize)]
struct SequenceQuery {
  #[serde(default = "default_increment")]
  increment: i64,
}

fn default_increment() -> i64 {
  1
}

async fn next_sequence(
  State(state): State<AgentState>,
  Path(name): Path<String>,
  Query(query): Query<SequenceQuery>,
) -> Result<Json<SequenceReply>, Reply> {
  let Some(service) = state.sequences.clone() else {
    return Err((
      StatusCode::NOT_FOUND,
      Json(AgentReply::error("no sequences are served by this node")),
    ));
  };

  let increment = query.increment;
  let lookup = name.clone();
  let result = tokio::task::spawn_blocking(move || service.next(&lookup, increment))
    .await
    .unwrap_or_else(|e| Err(SequenceError::StoreUnavailable(e.to_string())));

  match result {
    Ok(value) => Ok(Json(SequenceReply {
      name,
      value,
      increment,
    })),
    Err(e) => {
      warn!(node = %state.node_id, sequence = %name, error = %e, "Sequence request failed");
      let code = match e {
        SequenceError::UnknownSequence(_) => StatusCode::NOT_FOUND,
        SequenceError::InvalidBlockSize(_) => StatusCode::BAD_REQUEST,
        SequenceError::Overflow(_) => StatusCode::CONFLICT,
        SequenceError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
      };
      Err((code, Json(AgentReply::error(e.to_string()))))
    }
  }
}

struct DryRun {
  steps: usize,
  phase: NodePhase,
}

/// A [`StepRuntime`] that executes nothing.
///
/// It records the lifecycle only: a started run finishes at once with zero
/// rows. Useful for exercising a cluster's control plane end to end.
#[derive(Default)]
pub struct DryRunRuntime {
  runs: Mutex<HashMap<RunScope, DryRun>>,
}

impl DryRunRuntime {
  /// Creates an empty runtime.
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl StepRuntime for DryRunRuntime {
  async fn prepare(&self, scope: &RunScope, subgraph: PhysicalSubgraph) -> Result<(), RuntimeError> {
    let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(run) = runs.get(scope)
      && run.phase != NodePhase::Prepared
    {
      return Err(RuntimeError::InvalidState(format!(
        "{scope} is already {:?}",
        run.phase
      )));
    }
    runs.insert(
      scope.clone(),
      DryRun {
        steps: subgraph.steps.len(),
        phase: NodePhase::Prepared,
      },
    );
    Ok(())
  }

  async fn start(&self, scope: &RunScope) -> Result<(), RuntimeError> {
    let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
    let run = runs
      .get_mut(scope)
      .ok_or_else(|| RuntimeError::UnknownRun(scope.clone()))?;
    match run.phase {
      NodePhase::Prepared => {
        run.phase = NodePhase::Finished;
        Ok(())
      }
      NodePhase::Running | NodePhase::Finished => Ok(()),
      other => Err(RuntimeError::InvalidState(format!("{scope} is {other:?}"))),
    }
  }

  async fn status(&self, scope: &RunScope) -> Result<NodeRunStatus, RuntimeError> {
    let runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
    let run = runs
      .get(scope)
      .ok_or_else(|| RuntimeError::UnknownRun(scope.clone()))?;
    Ok(
      NodeRunStatus::new(String::new(), run.phase)
        .with_log_tail(format!("dry run of {} steps", run.steps)),
    )
  }

  async fn stop(&self, scope: &RunScope) -> Result<(), RuntimeError> {
    let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(run) = runs.get_mut(scope)
      && !run.phase.is_terminal()
    {
      run.phase = NodePhase::Stopped;
    }
    Ok(())
  }
}
