//! Run descriptors.
//!
//! A [`ClusterRunDescriptor`] bundles everything a clustered run needs from
//! the outside: the logical graph, the cluster schema and the partition
//! schemas the graph references. It is read from JSON:
//!
//! ```json
//! {
//!   "graph": {
//!     "name": "orders",
//!     "steps": [
//!       { "name": "read", "copy_count": 1, "pinned_node": "master" },
//!       { "name": "aggregate", "copy_count": 4, "partition_schema": "by_customer" }
//!     ],
//!     "edges": [
//!       { "from_step": "read", "from_copy": 0, "to_step": "aggregate", "to_copy": 0 }
//!     ]
//!   },
//!   "cluster": {
//!     "name": "cluster",
//!     "nodes": [
//!       { "id": "master", "host": "10.0.0.1", "control_endpoint": "http://10.0.0.1:8081", "role": "coordinator" },
//!       { "id": "slave1", "host": "10.0.0.2", "control_endpoint": "http://10.0.0.2:8081", "role": "worker" }
//!     ]
//!   },
//!   "partition_schemas": [
//!     { "name": "by_customer", "partition_count": 4, "key_field": "customer_id", "hash_fn_id": "mod" }
//!   ]
//! }
//! ```
//!
//! Transport options left out of the cluster object take their defaults.
//! [`apply_env`](ClusterRunDescriptor::apply_env) lets the environment
//! override the base port and socket buffer size.

use crate::cluster::{ClusterError, ClusterSchema};
use crate::distributed::retry::read_env;
use crate::graph::{GraphError, ProcessingGraph};
use crate::partitioning::{PartitionError, PartitionSchema};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Overrides [`ClusterSchema::base_port`].
pub const BASE_PORT_ENV: &str = "CLUSTERWEAVE_BASE_PORT";
/// Overrides [`ClusterSchema::socket_buffer_size`].
pub const SOCKET_BUFFER_ENV: &str = "CLUSTERWEAVE_SOCKET_BUFFER_SIZE";

/// Error type for loading run descriptors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  /// The descriptor file could not be read.
  #[error("Cannot read {path}: {source}")]
  Io {
    /// Descriptor path.
    path: String,
    /// Underlying error.
    #[source]
    source: std::io::Error,
  },
  /// The descriptor is not valid JSON for a run.
  #[error("Invalid run descriptor: {0}")]
  Parse(#[from] serde_json::Error),
  /// The graph is inconsistent.
  #[error(transparent)]
  Graph(#[from] GraphError),
  /// The cluster schema is inconsistent.
  #[error(transparent)]
  Cluster(#[from] ClusterError),
  /// A partition schema is inconsistent.
  #[error(transparent)]
  Partition(#[from] PartitionError),
}

/// Graph, cluster and partition schemas of one clustered run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRunDescriptor {
  /// The logical graph.
  pub graph: ProcessingGraph,
  /// The cluster to run on.
  pub cluster: ClusterSchema,
  /// Partition schemas referenced by the graph's steps.
  #[serde(default)]
  pub partition_schemas: Vec<PartitionSchema>,
}

impl ClusterRunDescriptor {
  /// Parses a descriptor from a JSON string.
  pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
    Ok(serde_json::from_str(json)?)
  }

  /// Reads a descriptor from a JSON file.
  pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.display().to_string(),
      source,
    })?;
    let descriptor = Self::from_json_str(&json)?;
    info!(
      path = %path.display(),
      graph = %descriptor.graph.name(),
      nodes = descriptor.cluster.nodes.len(),
      "Loaded run descriptor"
    );
    Ok(descriptor)
  }

  /// Applies environment overrides for transport options.
  #[must_use]
  pub fn apply_env(mut self) -> Self {
    if let Some(port) = read_env(BASE_PORT_ENV) {
      self.cluster.base_port = port;
    }
    if let Some(size) = read_env(SOCKET_BUFFER_ENV) {
      self.cluster.socket_buffer_size = size;
    }
    self
  }

  /// Validates the graph, the cluster and every partition schema.
  ///
  /// Cross-references between them are checked by the splitter.
  pub fn validate(&self) -> Result<(), ConfigError> {
    self.graph.validate()?;
    self.cluster.validate()?;
    for schema in &self.partition_schemas {
      schema.validate()?;
    }
    Ok(())
  }
}
