//! Node agent boundary.
//!
//! Each node exposes a small control surface the coordinator drives:
//! `prepare`, `start`, `status` and `stop`, all keyed by a [`RunScope`].
//! [`NodeAgent`] is the coordinator's typed view of that surface; the HTTP
//! implementation lives in [`crate::distributed::http_agent`].

use crate::cluster::Node;
use crate::distributed::splitter::PhysicalSubgraph;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one execution attempt of a graph.
///
/// Scopes port leases and every node agent call. The run id is chosen by the
/// caller so that `prepare` can be retried under the same scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunScope {
  /// Caller supplied run id.
  pub run_id: String,
  /// Name of the logical graph being run.
  pub graph_name: String,
}

impl RunScope {
  /// Creates a run scope.
  pub fn new(run_id: impl Into<String>, graph_name: impl Into<String>) -> Self {
    Self {
      run_id: run_id.into(),
      graph_name: graph_name.into(),
    }
  }
}

impl fmt::Display for RunScope {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.graph_name, self.run_id)
  }
}

/// Lifecycle phase of a node's part of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodePhase {
  /// Sub-graph accepted, not yet started.
  Prepared,
  /// Sub-graph executing.
  Running,
  /// Sub-graph completed.
  Finished,
  /// Sub-graph stopped on request.
  Stopped,
  /// Sub-graph failed, or the node became unreachable.
  Error,
}

impl NodePhase {
  /// Returns true for phases a node never leaves.
  pub fn is_terminal(&self) -> bool {
    matches!(self, NodePhase::Finished | NodePhase::Stopped | NodePhase::Error)
  }
}

/// Status of one node's part of a run, as last reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRunStatus {
  /// Node id.
  pub node: String,
  /// Current phase.
  pub phase: NodePhase,
  /// Rows read by the node's steps.
  #[serde(default)]
  pub rows_read: u64,
  /// Rows written by the node's steps.
  #[serde(default)]
  pub rows_written: u64,
  /// Runtime errors reported by the node's steps.
  #[serde(default)]
  pub error_count: u64,
  /// Tail of the node's log.
  #[serde(default)]
  pub log_tail: String,
}

impl NodeRunStatus {
  /// Creates a status with zero counters.
  pub fn new(node: impl Into<String>, phase: NodePhase) -> Self {
    Self {
      node: node.into(),
      phase,
      rows_read: 0,
      rows_written: 0,
      error_count: 0,
      log_tail: String::new(),
    }
  }

  /// Sets the row counters.
  #[must_use]
  pub fn with_rows(mut self, rows_read: u64, rows_written: u64) -> Self {
    self.rows_read = rows_read;
    self.rows_written = rows_written;
    self
  }

  /// Sets the error count.
  #[must_use]
  pub fn with_errors(mut self, error_count: u64) -> Self {
    self.error_count = error_count;
    self
  }

  /// Sets the log tail.
  #[must_use]
  pub fn with_log_tail(mut self, log_tail: impl Into<String>) -> Self {
    self.log_tail = log_tail.into();
    self
  }
}

/// Error type for node agent calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
  /// The call did not complete in time.
  #[error("Node agent call timed out")]
  Timeout,
  /// The node could not be reached.
  #[error("Node agent unavailable: {0}")]
  Unavailable(String),
  /// The node answered and refused the request.
  #[error("Node agent rejected the request: {0}")]
  Rejected(String),
  /// The node answered with something that could not be understood.
  #[error("Node agent protocol error: {0}")]
  Protocol(String),
  /// The run was stopped before the call completed.
  #[error("Node agent call was cancelled")]
  Cancelled,
}

impl AgentError {
  /// Returns true if retrying the same call may succeed.
  pub fn is_transient(&self) -> bool {
    matches!(self, AgentError::Timeout | AgentError::Unavailable(_))
  }
}

/// Acknowledgement body returned by the control surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReply {
  /// Whether the request was accepted.
  pub ok: bool,
  /// Error or informational message.
  #[serde(default)]
  pub message: String,
}

impl AgentReply {
  /// An accepting reply.
  pub fn ok() -> Self {
    Self {
      ok: true,
      message: String::new(),
    }
  }

  /// A refusing reply.
  pub fn error(message: impl Into<String>) -> Self {
    Self {
      ok: false,
      message: message.into(),
    }
  }
}

/// Body of a sequence block reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceReply {
  /// Sequence name.
  pub name: String,
  /// First value of the allocated block.
  pub value: i64,
  /// Block size.
  pub increment: i64,
}

/// Typed client for a node's control surface.
///
/// Every call is fallible. Implementations report unreachable nodes and
/// timeouts as transient [`AgentError`]s; retrying is up to the caller.
#[async_trait]
pub trait NodeAgent: Send + Sync {
  /// Hands the node its physical sub-graph for `scope`.
  async fn prepare(
    &self,
    node: &Node,
    scope: &RunScope,
    subgraph: &PhysicalSubgraph,
  ) -> Result<(), AgentError>;

  /// Starts the prepared sub-graph.
  async fn start(&self, node: &Node, scope: &RunScope) -> Result<(), AgentError>;

  /// Reports the node's status for `scope`.
  async fn status(&self, node: &Node, scope: &RunScope) -> Result<NodeRunStatus, AgentError>;

  /// Stops the node's sub-graph. Stopping a terminal sub-graph succeeds.
  async fn stop(&self, node: &Node, scope: &RunScope) -> Result<(), AgentError>;
}
