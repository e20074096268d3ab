//! Distributed execution of a processing graph.
//!
//! A clustered run flows through this module in order:
//!
//! 1. [`splitter`] rewrites the logical graph into one physical sub-graph per
//!    node and lists the transport links that cross nodes
//! 2. [`port_allocator`] leases a port for every link, per run scope
//! 3. [`coordinator`] prepares, starts, monitors and cleans up every node
//!    through a [`NodeAgent`](agent::NodeAgent), retrying with [`retry`]
//!
//! [`http_agent`] and [`agent_server`] are the two ends of the HTTP control
//! surface between the coordinator and a node.

pub mod agent;
pub mod agent_server;
pub mod assignment;
pub mod coordinator;
pub mod http_agent;
pub mod port_allocator;
pub mod retry;
pub mod splitter;

#[cfg(test)]
mod splitter_test;

pub use agent::{AgentError, NodeAgent, NodePhase, NodeRunStatus, RunScope};
pub use assignment::{NodeAssignment, RoundRobinAssignment};
pub use coordinator::{CoordinatorConfig, RunCoordinator, RunError, RunPhase, RunResult};
pub use http_agent::HttpNodeAgent;
pub use port_allocator::{PortAllocator, PortError, PortLeaseKey, ScopeRelease};
pub use retry::RetryPolicy;
pub use splitter::{
  GraphSplitter, PhysicalSubgraph, SplitError, SplitPlan, StepKind, TransportAdapterPair,
  TransportLink, split,
};
