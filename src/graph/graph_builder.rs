//! # Graph Builder
//!
//! Fluent construction of [`ProcessingGraph`]s.
//!
//! Every builder method is infallible; the first construction error is kept
//! and returned from [`GraphBuilder::build`], so a whole graph can be declared
//! in one expression.
//!
//! ```rust
//! use clusterweave::graph::GraphBuilder;
//!
//! let graph = GraphBuilder::new("sales")
//!   .pinned_step("read", 1, "master")
//!   .step("clean", 3)
//!   .pinned_step("write", 1, "master")
//!   .hop("read", "clean")
//!   .hop("clean", "write")
//!   .build()
//!   .unwrap();
//!
//! assert_eq!(graph.edges().len(), 6);
//! ```

use super::graph::{Edge, GraphError, ProcessingGraph, Step};

/// Builder for constructing processing graphs with a fluent API.
pub struct GraphBuilder {
  graph: ProcessingGraph,
  error: Option<GraphError>,
}

impl GraphBuilder {
  /// Starts a new graph with the given name.
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      graph: ProcessingGraph::new(name),
      error: None,
    }
  }

  /// Adds an arbitrary step.
  #[must_use]
  pub fn with_step(mut self, step: Step) -> Self {
    if self.error.is_none() {
      if let Err(e) = self.graph.add_step(step) {
        self.error = Some(e);
      }
    }
    self
  }

  /// Adds an unpartitioned, unpinned step.
  #[must_use]
  pub fn step(self, name: &str, copies: usize) -> Self {
    self.with_step(Step::new(name, copies))
  }

  /// Adds a step pinned to the given node.
  #[must_use]
  pub fn pinned_step(self, name: &str, copies: usize, node: &str) -> Self {
    self.with_step(Step::new(name, copies).with_pinned_node(node))
  }

  /// Adds a step bound to a partition schema. `copies` must equal the
  /// schema's partition count; the splitter enforces this.
  #[must_use]
  pub fn partitioned_step(self, name: &str, copies: usize, schema: &str) -> Self {
    self.with_step(Step::new(name, copies).with_partition_schema(schema))
  }

  /// Adds a single copy-level edge.
  #[must_use]
  pub fn edge(mut self, from: &str, from_copy: usize, to: &str, to_copy: usize) -> Self {
    if self.error.is_none() {
      if let Err(e) = self.graph.add_edge(Edge::new(from, from_copy, to, to_copy)) {
        self.error = Some(e);
      }
    }
    self
  }

  /// Connects two steps. See [`ProcessingGraph::add_hop`].
  #[must_use]
  pub fn hop(mut self, from: &str, to: &str) -> Self {
    if self.error.is_none() {
      if let Err(e) = self.graph.add_hop(from, to) {
        self.error = Some(e);
      }
    }
    self
  }

  /// Finishes the graph.
  ///
  /// # Errors
  ///
  /// Returns the first error raised while building.
  pub fn build(self) -> Result<ProcessingGraph, GraphError> {
    match self.error {
      Some(e) => Err(e),
      None => Ok(self.graph),
    }
  }
}
