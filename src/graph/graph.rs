//! Graph structure: steps, copies and copy-level edges.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Error type for graph construction and validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
  /// A step with this name already exists.
  #[error("Duplicate step: {0}")]
  DuplicateStep(String),
  /// A step must run in at least one copy.
  #[error("Step {0} has zero copies")]
  ZeroCopies(String),
  /// An edge references a step that is not in the graph.
  #[error("Unknown step: {0}")]
  UnknownStep(String),
  /// An edge references a copy number the step does not have.
  #[error("Step {step} has no copy {copy} (copy count {copy_count})")]
  UnknownCopy {
    /// Step name.
    step: String,
    /// Requested copy.
    copy: usize,
    /// Copies the step actually runs.
    copy_count: usize,
  },
  /// The same edge was added twice.
  #[error("Duplicate edge: {0}")]
  DuplicateEdge(Edge),
}

/// A processing step of the logical graph.
///
/// Business logic is not modelled here; the cluster coordinator only needs
/// the step's identity, its copy multiplicity and its placement constraints.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
  /// Unique step name within the graph.
  pub name: String,
  /// Number of parallel copies of the step.
  pub copy_count: usize,
  /// Name of the partition schema the step is bound to, if any.
  #[serde(default)]
  pub partition_schema: Option<String>,
  /// Node id the step is explicitly pinned to, if any.
  #[serde(default)]
  pub pinned_node: Option<String>,
}

impl Step {
  /// Creates an unpartitioned, unpinned step.
  pub fn new(name: impl Into<String>, copy_count: usize) -> Self {
    Self {
      name: name.into(),
      copy_count,
      partition_schema: None,
      pinned_node: None,
    }
  }

  /// Binds the step to a partition schema.
  #[must_use]
  pub fn with_partition_schema(mut self, schema: impl Into<String>) -> Self {
    self.partition_schema = Some(schema.into());
    self
  }

  /// Pins the step to a node.
  #[must_use]
  pub fn with_pinned_node(mut self, node: impl Into<String>) -> Self {
    self.pinned_node = Some(node.into());
    self
  }

  /// Returns true if the step is bound to a partition schema.
  pub fn is_partitioned(&self) -> bool {
    self.partition_schema.is_some()
  }
}

/// One copy of a step.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepCopy {
  /// Step name.
  pub step: String,
  /// Copy number, `0..copy_count`.
  pub copy: usize,
}

impl StepCopy {
  /// Creates a step copy reference.
  pub fn new(step: impl Into<String>, copy: usize) -> Self {
    Self {
      step: step.into(),
      copy,
    }
  }
}

impl fmt::Display for StepCopy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{}", self.step, self.copy)
  }
}

/// A row stream from one step copy to another.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
  /// Source step name.
  pub from_step: String,
  /// Source copy number.
  pub from_copy: usize,
  /// Target step name.
  pub to_step: String,
  /// Target copy number.
  pub to_copy: usize,
}

impl Edge {
  /// Creates an edge between two step copies.
  pub fn new(
    from_step: impl Into<String>,
    from_copy: usize,
    to_step: impl Into<String>,
    to_copy: usize,
  ) -> Self {
    Self {
      from_step: from_step.into(),
      from_copy,
      to_step: to_step.into(),
      to_copy,
    }
  }

  /// Returns the source step copy.
  pub fn source(&self) -> StepCopy {
    StepCopy::new(self.from_step.clone(), self.from_copy)
  }

  /// Returns the target step copy.
  pub fn target(&self) -> StepCopy {
    StepCopy::new(self.to_step.clone(), self.to_copy)
  }
}

impl fmt::Display for Edge {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}.{} -> {}.{}",
      self.from_step, self.from_copy, self.to_step, self.to_copy
    )
  }
}

/// A logical processing graph.
///
/// # Invariants
///
/// - step names are unique
/// - every step has `copy_count >= 1`
/// - every edge references existing step/copy pairs
///
/// These hold for graphs built through [`add_step`](Self::add_step) and
/// [`add_edge`](Self::add_edge). Deserialized graphs should be checked with
/// [`validate`](Self::validate) before use; the splitter does this itself.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingGraph {
  name: String,
  #[serde(default)]
  steps: Vec<Step>,
  #[serde(default)]
  edges: Vec<Edge>,
}

impl ProcessingGraph {
  /// Creates an empty graph.
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      steps: Vec::new(),
      edges: Vec::new(),
    }
  }

  /// Returns the graph name.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Returns the steps in insertion order.
  pub fn steps(&self) -> &[Step] {
    &self.steps
  }

  /// Returns the edges in insertion order.
  pub fn edges(&self) -> &[Edge] {
    &self.edges
  }

  /// Looks up a step by name.
  pub fn step(&self, name: &str) -> Option<&Step> {
    self.steps.iter().find(|s| s.name == name)
  }

  /// Adds a step.
  ///
  /// # Errors
  ///
  /// Returns [`GraphError::DuplicateStep`] or [`GraphError::ZeroCopies`].
  pub fn add_step(&mut self, step: Step) -> Result<(), GraphError> {
    if step.copy_count == 0 {
      return Err(GraphError::ZeroCopies(step.name));
    }
    if self.step(&step.name).is_some() {
      return Err(GraphError::DuplicateStep(step.name));
    }
    self.steps.push(step);
    Ok(())
  }

  /// Adds an edge between two existing step copies.
  ///
  /// # Errors
  ///
  /// Returns an error if either endpoint does not exist or the edge is
  /// already present.
  pub fn add_edge(&mut self, edge: Edge) -> Result<(), GraphError> {
    self.check_copy(&edge.from_step, edge.from_copy)?;
    self.check_copy(&edge.to_step, edge.to_copy)?;
    if self.edges.contains(&edge) {
      return Err(GraphError::DuplicateEdge(edge));
    }
    self.edges.push(edge);
    Ok(())
  }

  /// Connects every copy of `from` to `to`.
  ///
  /// Steps with equal copy counts are connected copy-to-copy (`i -> i`);
  /// otherwise every source copy is connected to every target copy.
  pub fn add_hop(&mut self, from: &str, to: &str) -> Result<(), GraphError> {
    let from_copies = self
      .step(from)
      .ok_or_else(|| GraphError::UnknownStep(from.to_string()))?
      .copy_count;
    let to_copies = self
      .step(to)
      .ok_or_else(|| GraphError::UnknownStep(to.to_string()))?
      .copy_count;

    if from_copies == to_copies {
      for copy in 0..from_copies {
        self.add_edge(Edge::new(from, copy, to, copy))?;
      }
    } else {
      for from_copy in 0..from_copies {
        for to_copy in 0..to_copies {
          self.add_edge(Edge::new(from, from_copy, to, to_copy))?;
        }
      }
    }
    Ok(())
  }

  /// Returns a copy of the graph with the copy counts of some steps replaced.
  ///
  /// Edges between unchanged steps are kept as they are. Steps connected to
  /// a resized step are reconnected with [`add_hop`](Self::add_hop).
  ///
  /// # Errors
  ///
  /// Returns [`GraphError::ZeroCopies`] if a new copy count is zero.
  pub fn with_copy_counts(&self, counts: &HashMap<String, usize>) -> Result<ProcessingGraph, GraphError> {
    let mut resized = ProcessingGraph::new(self.name.clone());
    for step in &self.steps {
      let mut step = step.clone();
      if let Some(count) = counts.get(&step.name) {
        step.copy_count = *count;
      }
      resized.add_step(step)?;
    }

    let mut hops: Vec<(&str, &str)> = Vec::new();
    for edge in &self.edges {
      if counts.contains_key(&edge.from_step) || counts.contains_key(&edge.to_step) {
        let hop = (edge.from_step.as_str(), edge.to_step.as_str());
        if !hops.contains(&hop) {
          hops.push(hop);
        }
      } else {
        resized.add_edge(edge.clone())?;
      }
    }
    for (from, to) in hops {
      resized.add_hop(from, to)?;
    }
    Ok(resized)
  }

  /// Returns the edges leaving the given step.
  pub fn outgoing<'a>(&'a self, step: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
    self.edges.iter().filter(move |e| e.from_step == step)
  }

  /// Returns the edges entering the given step.
  pub fn incoming<'a>(&'a self, step: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
    self.edges.iter().filter(move |e| e.to_step == step)
  }

  /// Checks every graph invariant.
  pub fn validate(&self) -> Result<(), GraphError> {
    let mut names = HashSet::new();
    for step in &self.steps {
      if step.copy_count == 0 {
        return Err(GraphError::ZeroCopies(step.name.clone()));
      }
      if !names.insert(step.name.as_str()) {
        return Err(GraphError::DuplicateStep(step.name.clone()));
      }
    }

    let mut seen = HashSet::new();
    for edge in &self.edges {
      self.check_copy(&edge.from_step, edge.from_copy)?;
      self.check_copy(&edge.to_step, edge.to_copy)?;
      if !seen.insert(edge) {
        return Err(GraphError::DuplicateEdge(edge.clone()));
      }
    }
    Ok(())
  }

  fn check_copy(&self, step: &str, copy: usize) -> Result<(), GraphError> {
    let found = self
      .step(step)
      .ok_or_else(|| GraphError::UnknownStep(step.to_string()))?;
    if copy >= found.copy_count {
      return Err(GraphError::UnknownCopy {
        step: step.to_string(),
        copy,
        copy_count: found.copy_count,
      });
    }
    Ok(())
  }
}
