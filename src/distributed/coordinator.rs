//! # Run Coordinator
//!
//! Drives one clustered run through its lifecycle:
//!
//! ```text
//! Built -> Prepared -> Running -> { Finished | Stopped | Error }
//! ```
//!
//! - [`prepare`](RunCoordinator::prepare) splits the graph, leases a port per
//!   transport link and prepares every node concurrently. Any failure leaves
//!   the run `Built`; retrying with the same [`RunScope`] reuses the leased
//!   ports.
//! - [`start`](RunCoordinator::start) starts every node. If one fails, the
//!   nodes already started are stopped and the run ends in `Error`.
//! - [`monitor`](RunCoordinator::monitor) polls the non-terminal nodes until
//!   all are terminal, the deadline passes or [`stop`](RunCoordinator::stop)
//!   is called, and returns the aggregated error count. `0` with every node
//!   `Finished` is the only success.
//! - [`cleanup`](RunCoordinator::cleanup) stops every node and releases the
//!   run's ports exactly once.
//!
//! Node calls go through the configured [`RetryPolicy`]. A node that stays
//! unreachable while monitored is marked `Error` and the whole run is
//! stopped.

use crate::cluster::{ClusterSchema, Node};
use crate::cluster_health::{RunHealthReport, aggregate_run_health};
use crate::distributed::agent::{AgentError, NodeAgent, NodePhase, NodeRunStatus, RunScope};
use crate::distributed::port_allocator::{PortAllocator, PortError, ScopeRelease};
use crate::distributed::retry::RetryPolicy;
use crate::distributed::splitter::{GraphSplitter, PhysicalSubgraph, SplitError, TransportAdapterPair};
use crate::graph::ProcessingGraph;
use crate::partitioning::PartitionSchema;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Lifecycle phase of a clustered run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
  /// Nothing sent to any node yet.
  Built,
  /// Every node acknowledged its sub-graph.
  Prepared,
  /// Every node was started.
  Running,
  /// Every node finished without errors.
  Finished,
  /// The run was stopped on request.
  Stopped,
  /// The run failed.
  Error,
}

impl RunPhase {
  /// Returns true for phases a run never leaves.
  pub fn is_terminal(&self) -> bool {
    matches!(self, RunPhase::Finished | RunPhase::Stopped | RunPhase::Error)
  }
}

impl fmt::Display for RunPhase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      RunPhase::Built => "built",
      RunPhase::Prepared => "prepared",
      RunPhase::Running => "running",
      RunPhase::Finished => "finished",
      RunPhase::Stopped => "stopped",
      RunPhase::Error => "error",
    };
    f.write_str(name)
  }
}

/// Error type for run coordination.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
  /// The graph, cluster or partition schemas are inconsistent. Nothing was
  /// leased or sent.
  #[error("Configuration error: {0}")]
  Configuration(#[from] SplitError),
  /// A node could not be driven, after retries.
  #[error("Communication with node {node} failed: {source}")]
  Communication {
    /// Node id.
    node: String,
    /// Last agent error.
    #[source]
    source: AgentError,
  },
  /// The requested operation is not valid in the current phase.
  #[error("Cannot move run from {from} to {to}")]
  InvalidTransition {
    /// Current phase.
    from: RunPhase,
    /// Requested phase.
    to: RunPhase,
  },
  /// No port was left to lease.
  #[error("Port leasing failed: {0}")]
  PortExhausted(#[from] PortError),
  /// The run was stopped while the operation was in progress.
  #[error("Run was cancelled")]
  Cancelled,
}

/// Coordinator settings.
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
  /// Retry policy for every node call.
  pub retry: RetryPolicy,
  /// Wait between two status polling rounds.
  pub poll_interval: Duration,
  /// Overall monitoring deadline, if any.
  pub deadline: Option<Duration>,
}

impl Default for CoordinatorConfig {
  fn default() -> Self {
    Self {
      retry: RetryPolicy::default(),
      poll_interval: Duration::from_secs(1),
      deadline: None,
    }
  }
}

impl CoordinatorConfig {
  /// Default settings with the retry policy read from the environment.
  pub fn from_env() -> Self {
    Self {
      retry: RetryPolicy::from_env(),
      ..Self::default()
    }
  }

  /// Sets the retry policy.
  #[must_use]
  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  /// Sets the polling interval.
  #[must_use]
  pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
    self.poll_interval = poll_interval;
    self
  }

  /// Sets the monitoring deadline.
  #[must_use]
  pub fn with_deadline(mut self, deadline: Duration) -> Self {
    self.deadline = Some(deadline);
    self
  }
}

/// Outcome of a clustered run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResult {
  /// Run scope, once prepared.
  pub scope: Option<RunScope>,
  /// Final phase.
  pub phase: RunPhase,
  /// Aggregated error count.
  pub errors: u64,
  /// Nodes that could not be stopped during cleanup.
  pub cleanup_errors: usize,
  /// Cluster-wide counters.
  pub health: RunHealthReport,
  /// Last status of every participating node.
  pub nodes: Vec<NodeRunStatus>,
  /// Transport adapter pairs with their ports.
  pub pairs: Vec<TransportAdapterPair>,
  /// When the run was started.
  pub started_at: Option<DateTime<Utc>>,
  /// When monitoring ended.
  pub finished_at: Option<DateTime<Utc>>,
}

impl RunResult {
  /// Returns true if every node finished and no errors were reported.
  pub fn is_success(&self) -> bool {
    self.phase == RunPhase::Finished && self.errors == 0
  }
}

#[derive(Clone)]
struct Participant {
  node: Node,
  subgraph: PhysicalSubgraph,
}

struct RunState {
  phase: RunPhase,
  scope: Option<RunScope>,
  participants: Vec<Participant>,
  statuses: BTreeMap<String, NodeRunStatus>,
  pairs: Vec<TransportAdapterPair>,
  errors: u64,
  cleanup_errors: usize,
  started_at: Option<DateTime<Utc>>,
  finished_at: Option<DateTime<Utc>>,
}

impl RunState {
  fn transition(&mut self, to: RunPhase) {
    if self.phase != to {
      info!(
        scope = %self.scope.as_ref().map(ToString::to_string).unwrap_or_default(),
        from = %self.phase,
        to = %to,
        "Run phase changed"
      );
      self.phase = to;
    }
  }

  fn set_all(&mut self, nodes: &[String], phase: NodePhase) {
    for node in nodes {
      self
        .statuses
        .insert(node.clone(), NodeRunStatus::new(node.clone(), phase));
    }
  }

  fn mark_error(&mut self, node: &str, reason: String) {
    let status = self
      .statuses
      .entry(node.to_string())
      .or_insert_with(|| NodeRunStatus::new(node, NodePhase::Error));
    status.phase = NodePhase::Error;
    status.error_count = status.error_count.max(1);
    status.log_tail = reason;
  }

  fn pending(&self) -> Vec<Participant> {
    self
      .participants
      .iter()
      .filter(|p| {
        self
          .statuses
          .get(&p.node.id)
          .is_none_or(|s| !s.phase.is_terminal())
      })
      .cloned()
      .collect()
  }
}

/// Coordinates one clustered run.
///
/// Share it behind an [`Arc`] to call [`stop`](Self::stop) from another task
/// while [`monitor`](Self::monitor) or [`execute`](Self::execute) runs.
pub struct RunCoordinator {
  agent: Arc<dyn NodeAgent>,
  allocator: Arc<PortAllocator>,
  splitter: GraphSplitter,
  config: CoordinatorConfig,
  state: Mutex<RunState>,
  release: Mutex<Option<ScopeRelease>>,
  cancel: CancellationToken,
}

impl fmt::Debug for RunCoordinator {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RunCoordinator")
      .field("phase", &self.phase())
      .field("config", &self.config)
      .finish_non_exhaustive()
  }
}

impl RunCoordinator {
  /// Creates a coordinator in phase `Built`.
  pub fn new(agent: Arc<dyn NodeAgent>, allocator: Arc<PortAllocator>, config: CoordinatorConfig) -> Self {
    Self {
      agent,
      allocator,
      splitter: GraphSplitter::default(),
      config,
      state: Mutex::new(RunState {
        phase: RunPhase::Built,
        scope: None,
        participants: Vec::new(),
        statuses: BTreeMap::new(),
        pairs: Vec::new(),
        errors: 0,
        cleanup_errors: 0,
        started_at: None,
        finished_at: None,
      }),
      release: Mutex::new(None),
      cancel: CancellationToken::new(),
    }
  }

  /// Uses a custom splitter, for example one with another assignment policy.
  #[must_use]
  pub fn with_splitter(mut self, splitter: GraphSplitter) -> Self {
    self.splitter = splitter;
    self
  }

  fn state(&self) -> MutexGuard<'_, RunState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Returns the current phase.
  pub fn phase(&self) -> RunPhase {
    self.state().phase
  }

  /// Returns the last known status of every participating node.
  pub fn node_statuses(&self) -> Vec<NodeRunStatus> {
    self.state().statuses.values().cloned().collect()
  }

  /// Returns a token cancelled when the run is stopped.
  pub fn cancellation_token(&self) -> CancellationToken {
    self.cancel.clone()
  }

  /// Splits the graph, leases ports and prepares every node.
  ///
  /// # Errors
  ///
  /// - [`RunError::Configuration`] before anything is leased or sent
  /// - [`RunError::Communication`] if a node cannot be prepared; the run
  ///   stays `Built` and may be prepared again with the same scope
  /// - [`RunError::InvalidTransition`] unless the run is `Built`
  pub async fn prepare(
    &self,
    graph: &ProcessingGraph,
    cluster: &ClusterSchema,
    partition_schemas: &[PartitionSchema],
    scope: &RunScope,
  ) -> Result<Vec<TransportAdapterPair>, RunError> {
    {
      let state = self.state();
      if state.phase != RunPhase::Built {
        return Err(RunError::InvalidTransition {
          from: state.phase,
          to: RunPhase::Prepared,
        });
      }
    }

    let mut plan = self.splitter.split(graph, cluster, partition_schemas)?;
    let nodes = plan
      .subgraphs
      .keys()
      .map(|id| cluster.node(id).cloned().map_err(SplitError::from))
      .collect::<Result<Vec<Node>, SplitError>>()?;

    self.arm_release(scope);
    let pairs = plan.bind_ports(|link| self.allocator.lease(scope, cluster.base_port, &link.lease_key()))?;
    let participants: Vec<Participant> = nodes
      .into_iter()
      .zip(plan.subgraphs.into_values())
      .map(|(node, subgraph)| Participant { node, subgraph })
      .collect();

    {
      let mut state = self.state();
      state.scope = Some(scope.clone());
      state.participants = participants.clone();
      state.pairs = pairs.clone();
    }
    info!(
      scope = %scope,
      nodes = participants.len(),
      links = pairs.len(),
      "Preparing clustered run"
    );

    let results = join_all(participants.iter().map(|p| async move {
      let outcome = self
        .config
        .retry
        .run_cancellable("prepare", &p.node.id, &self.cancel, || {
          self.agent.prepare(&p.node, scope, &p.subgraph)
        })
        .await;
      (p.node.id.clone(), outcome)
    }))
    .await;

    let mut state = self.state();
    if self.cancel.is_cancelled() {
      return Err(RunError::Cancelled);
    }
    if let Some((node, source)) = first_failure(results.iter()) {
      error!(scope = %scope, node = %node, error = %source, "Prepare failed");
      for (failed, outcome) in &results {
        if let Err(e) = outcome {
          state.mark_error(failed, e.to_string());
        }
      }
      return Err(RunError::Communication { node, source });
    }
    let nodes: Vec<String> = results.into_iter().map(|(node, _)| node).collect();
    state.set_all(&nodes, NodePhase::Prepared);
    state.transition(RunPhase::Prepared);
    Ok(pairs)
  }

  fn arm_release(&self, scope: &RunScope) {
    let mut release = self.release.lock().unwrap_or_else(PoisonError::into_inner);
    let armed_for_scope = release.as_ref().is_some_and(|guard| &guard.1 == scope);
    if !armed_for_scope {
      // Dropping a guard for another scope releases that scope.
      *release = Some(self.allocator.release_guard(scope.clone()));
    }
  }

  /// Starts every prepared node.
  ///
  /// # Errors
  ///
  /// - [`RunError::Communication`] if a node cannot be started; the nodes
  ///   already started are stopped and the run ends in `Error`
  /// - [`RunError::Cancelled`] if the run was stopped meanwhile; every
  ///   participant is then stopped, started or not
  /// - [`RunError::InvalidTransition`] unless the run is `Prepared`
  pub async fn start(&self) -> Result<(), RunError> {
    let (scope, participants) = {
      let mut state = self.state();
      if state.phase != RunPhase::Prepared {
        return Err(RunError::InvalidTransition {
          from: state.phase,
          to: RunPhase::Running,
        });
      }
      let Some(scope) = state.scope.clone() else {
        return Err(RunError::InvalidTransition {
          from: state.phase,
          to: RunPhase::Running,
        });
      };
      state.started_at = Some(Utc::now());
      (scope, state.participants.clone())
    };

    info!(scope = %scope, nodes = participants.len(), "Starting clustered run");
    let results = join_all(participants.iter().map(|p| {
      let scope = &scope;
      async move {
        let outcome = self
          .config
          .retry
          .run_cancellable("start", &p.node.id, &self.cancel, || self.agent.start(&p.node, scope))
          .await;
        (p, outcome)
      }
    }))
    .await;

    if self.cancel.is_cancelled() {
      // A cancelled start may still have reached its node.
      let stopped = self.stop_nodes(&scope, participants.iter()).await;
      let mut state = self.state();
      state.set_all(&stopped, NodePhase::Stopped);
      state.finished_at = Some(Utc::now());
      state.transition(RunPhase::Stopped);
      return Err(RunError::Cancelled);
    }

    let started: Vec<&Participant> = results
      .iter()
      .filter(|(_, outcome)| outcome.is_ok())
      .map(|(p, _)| *p)
      .collect();
    let failure = results
      .iter()
      .find_map(|(p, outcome)| outcome.as_ref().err().map(|e| (p.node.id.clone(), e.clone())));

    if let Some((node, source)) = failure {
      error!(scope = %scope, node = %node, error = %source, "Start failed, stopping started nodes");
      let stopped = self.stop_nodes(&scope, started.iter().copied()).await;
      let mut state = self.state();
      for (p, outcome) in &results {
        match outcome {
          Ok(()) if stopped.contains(&p.node.id) => {
            state.set_all(std::slice::from_ref(&p.node.id), NodePhase::Stopped);
          }
          Ok(()) => state.mark_error(&p.node.id, "could not be stopped".to_string()),
          Err(e) => state.mark_error(&p.node.id, e.to_string()),
        }
      }
      state.errors = aggregate_run_health(state.statuses.values()).error_count;
      state.finished_at = Some(Utc::now());
      state.transition(RunPhase::Error);
      return Err(RunError::Communication { node, source });
    }

    let mut state = self.state();
    let nodes: Vec<String> = participants.iter().map(|p| p.node.id.clone()).collect();
    state.set_all(&nodes, NodePhase::Running);
    state.transition(RunPhase::Running);
    Ok(())
  }

  /// Polls every non-terminal node until the run ends and returns the
  /// aggregated error count.
  ///
  /// A node contributes its reported `error_count` if it `Finished`, and at
  /// least 1 otherwise. Unreachable nodes are marked `Error` and stop the
  /// whole run. When `deadline` passes, the nodes still running are marked
  /// `Error` and the run is stopped. A concurrent [`stop`](Self::stop) ends
  /// monitoring at once, even mid-wait or while a status call hangs.
  ///
  /// # Errors
  ///
  /// Returns [`RunError::InvalidTransition`] if the run was never started.
  pub async fn monitor(&self, poll_interval: Duration, deadline: Option<Duration>) -> Result<u64, RunError> {
    let scope = {
      let state = self.state();
      match state.phase {
        RunPhase::Running => {}
        phase if phase.is_terminal() => return Ok(state.errors),
        phase => {
          return Err(RunError::InvalidTransition {
            from: phase,
            to: RunPhase::Finished,
          });
        }
      }
      state.scope.clone().ok_or(RunError::InvalidTransition {
        from: state.phase,
        to: RunPhase::Finished,
      })?
    };
    let deadline_at = deadline.map(|d| Instant::now() + d);
    let mut stopping = false;

    loop {
      if self.cancel.is_cancelled() {
        break;
      }
      let pending = self.state().pending();
      if pending.is_empty() {
        break;
      }
      if deadline_at.is_some_and(|at| Instant::now() >= at) {
        warn!(scope = %scope, pending = pending.len(), "Monitoring deadline exceeded");
        {
          let mut state = self.state();
          for p in &pending {
            state.mark_error(&p.node.id, "monitoring deadline exceeded".to_string());
          }
        }
        self.stop_run(&scope).await;
        break;
      }

      let polled = join_all(pending.iter().map(|p| {
        let scope = &scope;
        async move {
          let outcome = self
            .config
            .retry
            .run_cancellable("status", &p.node.id, &self.cancel, || self.agent.status(&p.node, scope))
            .await;
          (p.node.id.clone(), outcome)
        }
      }))
      .await;
      if self.cancel.is_cancelled() {
        break;
      }

      let mut failed = false;
      {
        let mut state = self.state();
        for (node, outcome) in polled {
          match outcome {
            Ok(mut status) => {
              status.node = node.clone();
              if status.phase == NodePhase::Error {
                error!(scope = %scope, node = %node, log = %status.log_tail, "Node reported an error");
                failed = true;
              }
              state.statuses.insert(node, status);
            }
            Err(e) => {
              error!(scope = %scope, node = %node, error = %e, "Node unreachable");
              state.mark_error(&node, format!("unreachable: {e}"));
              failed = true;
            }
          }
        }
      }

      if failed && !stopping {
        stopping = true;
        self.stop_run(&scope).await;
        continue;
      }

      if self.state().pending().is_empty() {
        break;
      }
      let mut wait = poll_interval;
      if let Some(at) = deadline_at {
        wait = wait.min(at.saturating_duration_since(Instant::now()));
      }
      tokio::select! {
        _ = self.cancel.cancelled() => {}
        _ = tokio::time::sleep(wait) => {}
      }
    }

    let mut state = self.state();
    let report = aggregate_run_health(state.statuses.values());
    state.errors = report.error_count;
    state.finished_at = Some(Utc::now());
    let phase = if self.cancel.is_cancelled() {
      RunPhase::Stopped
    } else if report.all_finished() && report.error_count == 0 {
      RunPhase::Finished
    } else {
      RunPhase::Error
    };
    state.transition(phase);
    info!(scope = %scope, errors = report.error_count, phase = %phase, "Clustered run ended");
    Ok(report.error_count)
  }

  /// Stops the run.
  ///
  /// A `Built` run becomes `Stopped` without contacting any node. A
  /// `Prepared` or `Running` run stops every node and becomes `Stopped`; an
  /// in-progress [`monitor`](Self::monitor) returns promptly. Stopping a
  /// finished run does nothing.
  pub async fn stop(&self) {
    let (phase, scope) = {
      let state = self.state();
      (state.phase, state.scope.clone())
    };
    if phase.is_terminal() {
      return;
    }
    self.cancel.cancel();
    if let Some(scope) = scope
      && phase != RunPhase::Built
    {
      self.stop_run(&scope).await;
    }
    let mut state = self.state();
    if !state.phase.is_terminal() {
      state.transition(RunPhase::Stopped);
    }
  }

  /// Stops every node and releases the run's ports. Safe to call on any exit
  /// path and more than once; ports are released exactly once.
  ///
  /// Returns the number of nodes that could not be stopped.
  pub async fn cleanup(&self) -> usize {
    let (scope, participants) = {
      let state = self.state();
      (state.scope.clone(), state.participants.clone())
    };

    let mut failures = 0;
    if let Some(scope) = &scope {
      let stopped = self.stop_nodes(scope, participants.iter()).await;
      failures = participants.len() - stopped.len();
      if failures > 0 {
        warn!(scope = %scope, failures, "Some nodes could not be stopped during cleanup");
      }
    }

    let guard = self
      .release
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    drop(guard);

    let mut state = self.state();
    state.cleanup_errors = failures;
    if matches!(state.phase, RunPhase::Prepared | RunPhase::Running) {
      state.transition(RunPhase::Stopped);
    }
    failures
  }

  /// Runs prepare, start and monitor with the configured poll interval and
  /// deadline, then always cleans up.
  ///
  /// # Errors
  ///
  /// Returns the prepare or start error, after cleanup ran.
  pub async fn execute(
    &self,
    graph: &ProcessingGraph,
    cluster: &ClusterSchema,
    partition_schemas: &[PartitionSchema],
    scope: &RunScope,
  ) -> Result<RunResult, RunError> {
    let outcome = async {
      self.prepare(graph, cluster, partition_schemas, scope).await?;
      self.start().await?;
      self
        .monitor(self.config.poll_interval, self.config.deadline)
        .await
    }
    .await;
    self.cleanup().await;
    if let Err(e) = outcome {
      let mut state = self.state();
      if !state.phase.is_terminal() {
        state.transition(RunPhase::Error);
      }
      return Err(e);
    }
    Ok(self.run_result())
  }

  /// Returns the outcome of the run so far.
  pub fn run_result(&self) -> RunResult {
    let state = self.state();
    RunResult {
      scope: state.scope.clone(),
      phase: state.phase,
      errors: state.errors,
      cleanup_errors: state.cleanup_errors,
      health: aggregate_run_health(state.statuses.values()),
      nodes: state.statuses.values().cloned().collect(),
      pairs: state.pairs.clone(),
      started_at: state.started_at,
      finished_at: state.finished_at,
    }
  }

  /// Stops every participant and marks those still running as stopped.
  async fn stop_run(&self, scope: &RunScope) {
    let participants = self.state().participants.clone();
    let stopped = self.stop_nodes(scope, participants.iter()).await;
    let mut state = self.state();
    for p in &participants {
      let terminal = state
        .statuses
        .get(&p.node.id)
        .is_some_and(|s| s.phase.is_terminal());
      if terminal {
        continue;
      }
      if stopped.contains(&p.node.id) {
        if let Some(status) = state.statuses.get_mut(&p.node.id) {
          status.phase = NodePhase::Stopped;
        }
      } else {
        state.mark_error(&p.node.id, "could not be stopped".to_string());
      }
    }
  }

  /// Calls stop on the given nodes concurrently and returns the ids that
  /// acknowledged.
  async fn stop_nodes<'a>(
    &self,
    scope: &RunScope,
    participants: impl Iterator<Item = &'a Participant>,
  ) -> Vec<String> {
    let results = join_all(participants.map(|p| async move {
      let outcome = self
        .config
        .retry
        .run("stop", &p.node.id, || self.agent.stop(&p.node, scope))
        .await;
      (p.node.id.clone(), outcome)
    }))
    .await;

    results
      .into_iter()
      .filter_map(|(node, outcome)| match outcome {
        Ok(()) => Some(node),
        Err(e) => {
          warn!(scope = %scope, node = %node, error = %e, "Stop failed");
          None
        }
      })
      .collect()
  }
}

fn first_failure<'a, T: 'a>(
  mut results: impl Iterator<Item = &'a (String, Result<T, AgentError>)>,
) -> Option<(String, AgentError)> {
  results.find_map(|(node, outcome)| outcome.as_ref().err().map(|e| (node.clone(), e.clone())))
}
