//! # Cluster Schema
//!
//! The set of nodes a graph runs on: exactly one coordinator (the "master")
//! plus the workers, in registration order. The schema also carries the
//! transport options every inter-node link uses: the base port leases start
//! from, the socket buffer size and whether streams are compressed.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Default first port leased for a run scope.
pub const DEFAULT_BASE_PORT: u16 = 40000;
/// Default transport socket buffer size in bytes.
pub const DEFAULT_SOCKET_BUFFER_SIZE: usize = 50_000;

/// Error type for cluster schema validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
  /// The schema has no nodes.
  #[error("Cluster {0} has no nodes")]
  NoNodes(String),
  /// No node carries the coordinator role.
  #[error("Cluster {0} has no coordinator node")]
  NoCoordinator(String),
  /// More than one node carries the coordinator role.
  #[error("Cluster {cluster} has {count} coordinator nodes")]
  MultipleCoordinators {
    /// Cluster name.
    cluster: String,
    /// Coordinators found.
    count: usize,
  },
  /// `coordinator_node_id` names a node that is not the coordinator.
  #[error("Coordinator id {0} does not match the coordinator node")]
  CoordinatorMismatch(String),
  /// Two nodes share an id.
  #[error("Duplicate node id: {0}")]
  DuplicateNode(String),
  /// A referenced node id is not part of the cluster.
  #[error("Unknown node: {0}")]
  UnknownNode(String),
}

/// Role a node plays in a clustered run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
  /// Hosts the steps pinned to it and drives nothing else.
  Coordinator,
  /// Hosts unpinned and partitioned steps.
  Worker,
}

/// A process participating in a clustered run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
  /// Unique node id. Identity is by id.
  pub id: String,
  /// Host the node's transport adapters bind to.
  pub host: String,
  /// Base URL of the node's control surface.
  pub control_endpoint: String,
  /// Coordinator or worker.
  pub role: NodeRole,
}

impl Node {
  /// Creates a coordinator node.
  pub fn coordinator(
    id: impl Into<String>,
    host: impl Into<String>,
    control_endpoint: impl Into<String>,
  ) -> Self {
    Self {
      id: id.into(),
      host: host.into(),
      control_endpoint: control_endpoint.into(),
      role: NodeRole::Coordinator,
    }
  }

  /// Creates a worker node.
  pub fn worker(
    id: impl Into<String>,
    host: impl Into<String>,
    control_endpoint: impl Into<String>,
  ) -> Self {
    Self {
      id: id.into(),
      host: host.into(),
      control_endpoint: control_endpoint.into(),
      role: NodeRole::Worker,
    }
  }

  /// Returns true for the coordinator node.
  pub fn is_coordinator(&self) -> bool {
    self.role == NodeRole::Coordinator
  }
}

fn default_base_port() -> u16 {
  DEFAULT_BASE_PORT
}

fn default_socket_buffer_size() -> usize {
  DEFAULT_SOCKET_BUFFER_SIZE
}

fn default_compressed() -> bool {
  true
}

/// Nodes of a cluster plus transport options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSchema {
  /// Cluster name, used when naming physical sub-graphs.
  pub name: String,
  /// Nodes in registration order.
  #[serde(default)]
  pub nodes: Vec<Node>,
  /// Id of the coordinator node. Filled from the nodes when left empty.
  #[serde(default)]
  pub coordinator_node_id: String,
  /// First port leased for each run scope.
  #[serde(default = "default_base_port")]
  pub base_port: u16,
  /// Transport socket buffer size in bytes.
  #[serde(default = "default_socket_buffer_size")]
  pub socket_buffer_size: usize,
  /// Whether transport streams are gzip compressed.
  #[serde(default = "default_compressed")]
  pub compressed: bool,
}

impl ClusterSchema {
  /// Creates an empty cluster schema with default transport options.
  pub fn new(name: impl Into<String>, base_port: u16) -> Self {
    Self {
      name: name.into(),
      nodes: Vec::new(),
      coordinator_node_id: String::new(),
      base_port,
      socket_buffer_size: DEFAULT_SOCKET_BUFFER_SIZE,
      compressed: true,
    }
  }

  /// Registers a node. Registering a coordinator also sets
  /// `coordinator_node_id`.
  #[must_use]
  pub fn with_node(mut self, node: Node) -> Self {
    if node.is_coordinator() {
      self.coordinator_node_id = node.id.clone();
    }
    self.nodes.push(node);
    self
  }

  /// Sets the socket buffer size.
  #[must_use]
  pub fn with_socket_buffer_size(mut self, size: usize) -> Self {
    self.socket_buffer_size = size;
    self
  }

  /// Enables or disables stream compression.
  #[must_use]
  pub fn with_compression(mut self, compressed: bool) -> Self {
    self.compressed = compressed;
    self
  }

  /// Checks the schema invariants: at least one node, unique ids and exactly
  /// one coordinator whose id matches `coordinator_node_id` (when set).
  pub fn validate(&self) -> Result<(), ClusterError> {
    if self.nodes.is_empty() {
      return Err(ClusterError::NoNodes(self.name.clone()));
    }
    let mut ids = HashSet::new();
    for node in &self.nodes {
      if !ids.insert(node.id.as_str()) {
        return Err(ClusterError::DuplicateNode(node.id.clone()));
      }
    }
    let coordinators: Vec<&Node> = self.nodes.iter().filter(|n| n.is_coordinator()).collect();
    match coordinators.as_slice() {
      [] => Err(ClusterError::NoCoordinator(self.name.clone())),
      [c] => {
        if self.coordinator_node_id.is_empty() || self.coordinator_node_id == c.id {
          Ok(())
        } else {
          Err(ClusterError::CoordinatorMismatch(
            self.coordinator_node_id.clone(),
          ))
        }
      }
      many => Err(ClusterError::MultipleCoordinators {
        cluster: self.name.clone(),
        count: many.len(),
      }),
    }
  }

  /// Returns the coordinator node.
  pub fn coordinator(&self) -> Result<&Node, ClusterError> {
    self
      .nodes
      .iter()
      .find(|n| n.is_coordinator())
      .ok_or_else(|| ClusterError::NoCoordinator(self.name.clone()))
  }

  /// Returns the worker nodes in registration order.
  pub fn workers(&self) -> Vec<&Node> {
    self.nodes.iter().filter(|n| !n.is_coordinator()).collect()
  }

  /// Looks up a node by id.
  pub fn node(&self, id: &str) -> Result<&Node, ClusterError> {
    self
      .nodes
      .iter()
      .find(|n| n.id == id)
      .ok_or_else(|| ClusterError::UnknownNode(id.to_string()))
  }
}
