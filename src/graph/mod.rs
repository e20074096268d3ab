//! # Processing Graph
//!
//! The logical dataflow graph submitted for clustered execution.
//!
//! A graph is a set of [`Step`]s, each running in one or more copies, and a
//! set of copy-level [`Edge`]s carrying rows from one step copy to another.
//! Steps may be bound to a partition schema (one copy per partition) or pinned
//! to a specific node of the cluster.
//!
//! Graphs are usually assembled with [`GraphBuilder`], or deserialized from a
//! run descriptor and checked with [`ProcessingGraph::validate`].

#[allow(clippy::module_inception)]
pub mod graph;
pub mod graph_builder;


pub use graph::{Edge, GraphError, ProcessingGraph, Step, StepCopy};
pub use graph_builder::GraphBuilder;
