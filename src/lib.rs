//! # ClusterWeave
//!
//! Clustered execution for dataflow graphs.
//!
//! ClusterWeave takes one logical processing graph (steps connected by row
//! streams) and runs it across a coordinator node plus N worker nodes. It
//! rewrites the graph into one physical sub-graph per node, leases a port for
//! every link that crosses a node boundary, and drives the distributed run
//! through prepare, start, monitor and cleanup.
//!
//! ## Key Features
//!
//! - **Graph Splitting**: Partition-aware placement and transport adapter insertion
//! - **Idempotent Port Leasing**: Retrying `prepare` reuses the same ports
//! - **Fallible Remote Control**: Bounded retries with backoff against every node
//! - **Failure Aggregation**: One error count for the whole cluster
//! - **Cluster Sequences**: Block-allocated unique ids without a round trip per value
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use clusterweave::cluster::{ClusterSchema, Node};
//! use clusterweave::graph::GraphBuilder;
//! use clusterweave::partitioning::PartitionSchema;
//! use clusterweave::distributed::split;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cluster = ClusterSchema::new("cluster", 40000)
//!   .with_node(Node::coordinator("master", "10.0.0.1", "http://10.0.0.1:8081"))
//!   .with_node(Node::worker("slave1", "10.0.0.2", "http://10.0.0.2:8081"))
//!   .with_node(Node::worker("slave2", "10.0.0.3", "http://10.0.0.3:8081"));
//! let by_customer = PartitionSchema::new("by_customer", 4, "customer_id");
//!
//! let graph = GraphBuilder::new("orders")
//!   .pinned_step("read", 1, "master")
//!   .partitioned_step("aggregate", 4, "by_customer")
//!   .hop("read", "aggregate")
//!   .build()?;
//!
//! let plan = split(&graph, &cluster, &[by_customer])?;
//! assert_eq!(plan.occurrences("aggregate"), 4);
//! # Ok(())
//! # }
//! ```

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// Cluster schema: nodes, coordinator, base port and transport options.
pub mod cluster;
/// Cluster health aggregation over per-node run status.
pub mod cluster_health;
/// Run descriptors loaded from JSON.
pub mod config;
/// Distributed execution: splitting, port leasing, node agents and the run coordinator.
pub mod distributed;
/// Logical processing graph model.
pub mod graph;
/// Partition schemas and row hashing.
pub mod partitioning;
/// Cluster-wide block-allocated sequences.
pub mod sequence;
/// Ordered row streams between writer and reader adapters.
pub mod transport;
