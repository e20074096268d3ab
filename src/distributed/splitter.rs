//! # Graph Splitter
//!
//! Rewrites one logical [`ProcessingGraph`] into one [`PhysicalSubgraph`] per
//! node of a [`ClusterSchema`].
//!
//! ## Placement
//!
//! - a step pinned to a node runs every copy on that node
//! - copy `i` of a partitioned step runs on the worker owning partition `i`
//! - any other step runs every copy on one worker chosen by the
//!   [`NodeAssignment`] policy (round-robin by default)
//!
//! The coordinator node only hosts steps pinned to it.
//!
//! ## Edge cutting
//!
//! An edge whose endpoints land on the same node is kept as is. An edge that
//! crosses nodes is cut: a writer adapter is appended downstream of the source
//! copy, a reader adapter upstream of the target copy, and the two are joined
//! by a [`TransportLink`]. After ports are leased the link becomes a
//! [`TransportAdapterPair`].
//!
//! ## Repartitioning
//!
//! When an edge enters a step bound to a partition schema the source is not
//! already partitioned by, the source copy fans out to every partition of the
//! target. It gets a [`RowDistribution`] that routes each row to
//! `hash_fn(row[key_field]) mod partition_count`, either to a local copy or to
//! the writer adapter for that partition.
//!
//! ## Per-worker schemas
//!
//! A schema declared with `partitions_per_worker` is resolved against the
//! number of workers first. Steps bound to it are resized to the resolved
//! partition count before placement, whatever copy count they declared.
//!
//! All configuration errors are raised here, before anything is leased or
//! any node is contacted.

use crate::cluster::{ClusterError, ClusterSchema, Node};
use crate::distributed::assignment::{NodeAssignment, RoundRobinAssignment};
use crate::distributed::port_allocator::PortLeaseKey;
use crate::graph::{Edge, GraphError, ProcessingGraph, Step, StepCopy};
use crate::partitioning::{PartitionError, PartitionSchema, Row};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Configuration errors detected while splitting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SplitError {
  /// The logical graph is invalid.
  #[error("Invalid graph: {0}")]
  Graph(#[from] GraphError),
  /// The cluster schema is invalid.
  #[error("Invalid cluster: {0}")]
  Cluster(#[from] ClusterError),
  /// A partition schema is invalid.
  #[error("Invalid partition schema: {0}")]
  Partition(#[from] PartitionError),
  /// A step references a partition schema that was not supplied.
  #[error("Step {step} references unknown partition schema {schema}")]
  UnresolvedPartitionSchema {
    /// Step name.
    step: String,
    /// Referenced schema.
    schema: String,
  },
  /// A partitioned step's copy count differs from its schema's partition count.
  #[error("Step {step} runs {copy_count} copies but its schema has {partition_count} partitions")]
  CopyCountMismatch {
    /// Step name.
    step: String,
    /// Copies declared by the step.
    copy_count: usize,
    /// Partitions declared by the schema.
    partition_count: usize,
  },
  /// A partitioned step has fewer partitions than the cluster has workers.
  #[error(
    "Step {step} has {partition_count} partitions but the cluster has {workers} worker nodes"
  )]
  FewerPartitionsThanWorkers {
    /// Step name.
    step: String,
    /// Partitions declared by the schema.
    partition_count: usize,
    /// Worker nodes in the cluster.
    workers: usize,
  },
  /// The step needs a worker node but the cluster has none.
  #[error("Step {0} needs a worker node but the cluster has none")]
  NoWorkerNodes(String),
  /// A step is pinned to a node that is not in the cluster.
  #[error("Step {step} is pinned to unknown node {node}")]
  UnknownPinnedNode {
    /// Step name.
    step: String,
    /// Pinned node id.
    node: String,
  },
}

/// Connection details of one side of a transport link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterEndpoint {
  /// Link id.
  pub link: String,
  /// Node on the other side of the link.
  pub peer_node: String,
  /// Host the writer listens on and the reader connects to.
  pub host: String,
  /// Leased port, set once ports are bound.
  pub port: Option<u16>,
  /// Socket buffer size in bytes.
  pub buffer_size: usize,
  /// Whether the stream is gzip compressed.
  pub compressed: bool,
}

/// What a physical step does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
  /// A step of the logical graph.
  Ordinary,
  /// Sends the rows it receives to a remote reader adapter.
  WriterAdapter(AdapterEndpoint),
  /// Emits the rows received from a remote writer adapter.
  ReaderAdapter(AdapterEndpoint),
}

/// Routes the rows of a source copy over the partitions of a target step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowDistribution {
  /// Logical target step.
  pub target_step: String,
  /// Schema the target step is partitioned by.
  pub schema: PartitionSchema,
  /// Step inside the same sub-graph receiving each partition, indexed by
  /// partition id.
  pub destinations: Vec<StepCopy>,
}

impl RowDistribution {
  /// Returns the step that receives `row`.
  ///
  /// # Errors
  ///
  /// Returns an error if the row lacks the key field.
  pub fn route(&self, row: &Row) -> Result<&StepCopy, PartitionError> {
    let partition = self.schema.partition_for(row)?;
    self
      .destinations
      .get(partition)
      .ok_or_else(|| PartitionError::ZeroPartitions(self.schema.name.clone()))
  }
}

/// A step of a physical sub-graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalStep {
  /// Step name. Adapters are named after their link.
  pub name: String,
  /// Copy number within the logical step.
  pub copy: usize,
  /// Ordinary step or transport adapter.
  pub kind: StepKind,
  /// Partition this copy processes, for partitioned steps.
  #[serde(default)]
  pub partition: Option<usize>,
  /// Repartitioning routes for the rows this copy emits.
  #[serde(default)]
  pub distributions: Vec<RowDistribution>,
}

impl PhysicalStep {
  fn ordinary(name: &str, copy: usize, partition: Option<usize>) -> Self {
    Self {
      name: name.to_string(),
      copy,
      kind: StepKind::Ordinary,
      partition,
      distributions: Vec::new(),
    }
  }

  fn adapter(name: String, kind: StepKind) -> Self {
    Self {
      name,
      copy: 0,
      kind,
      partition: None,
      distributions: Vec::new(),
    }
  }

  /// Returns a reference to this step copy.
  pub fn reference(&self) -> StepCopy {
    StepCopy::new(self.name.clone(), self.copy)
  }

  /// Returns true for writer and reader adapters.
  pub fn is_adapter(&self) -> bool {
    !matches!(self.kind, StepKind::Ordinary)
  }

  /// Returns the transport endpoint of an adapter step.
  pub fn endpoint(&self) -> Option<&AdapterEndpoint> {
    match &self.kind {
      StepKind::Ordinary => None,
      StepKind::WriterAdapter(endpoint) | StepKind::ReaderAdapter(endpoint) => Some(endpoint),
    }
  }
}

/// A row stream between two steps of the same sub-graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalEdge {
  /// Upstream step copy.
  pub from: StepCopy,
  /// Downstream step copy.
  pub to: StepCopy,
}

/// The part of a graph one node executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalSubgraph {
  /// Display name, `"<graph> (master)"` or `"<graph> (<cluster>:<node>)"`.
  pub name: String,
  /// Node executing the sub-graph.
  pub node_id: String,
  /// Logical graph the sub-graph was split from.
  pub graph_name: String,
  /// Steps, logical steps first in graph order, then adapters.
  pub steps: Vec<PhysicalStep>,
  /// Local row streams.
  pub edges: Vec<PhysicalEdge>,
  /// Cluster context handed to the node's runtime.
  pub variables: BTreeMap<String, String>,
}

impl PhysicalSubgraph {
  fn empty(node_id: &str, graph_name: &str) -> Self {
    Self {
      name: String::new(),
      node_id: node_id.to_string(),
      graph_name: graph_name.to_string(),
      steps: Vec::new(),
      edges: Vec::new(),
      variables: BTreeMap::new(),
    }
  }

  /// Looks up a step copy.
  pub fn step(&self, name: &str, copy: usize) -> Option<&PhysicalStep> {
    self.steps.iter().find(|s| s.name == name && s.copy == copy)
  }

  fn step_mut(&mut self, name: &str, copy: usize) -> Option<&mut PhysicalStep> {
    self
      .steps
      .iter_mut()
      .find(|s| s.name == name && s.copy == copy)
  }

  /// Returns the writer and reader adapters of this sub-graph.
  pub fn adapters(&self) -> impl Iterator<Item = &PhysicalStep> {
    self.steps.iter().filter(|s| s.is_adapter())
  }
}

/// A logical edge that crosses two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportLink {
  /// Link id, unique within a plan.
  pub id: String,
  /// The (possibly fanned-out) logical edge.
  pub edge: Edge,
  /// Node hosting the writer adapter.
  pub source_node: String,
  /// Node hosting the reader adapter.
  pub target_node: String,
  /// Host the writer listens on.
  pub source_host: String,
  /// True if the link was created by repartition fan-out.
  pub repartition: bool,
}

impl TransportLink {
  /// Name of the writer adapter step.
  pub fn writer_name(&self) -> String {
    format!("Writer : {}", self.id)
  }

  /// Name of the reader adapter step.
  pub fn reader_name(&self) -> String {
    format!("Reader : {}", self.id)
  }

  /// Key under which the link's port is leased.
  pub fn lease_key(&self) -> PortLeaseKey {
    PortLeaseKey::new(
      self.source_node.clone(),
      self.edge.from_step.clone(),
      self.edge.from_copy,
      self.target_node.clone(),
      self.edge.to_step.clone(),
      self.edge.to_copy,
    )
  }
}

/// A transport link bound to its leased port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportAdapterPair {
  /// Link id.
  pub link: String,
  /// Logical edge carried by the pair.
  pub edge: Edge,
  /// Node hosting the writer adapter.
  pub source_node: String,
  /// Copy of the source step.
  pub source_copy: usize,
  /// Node hosting the reader adapter.
  pub target_node: String,
  /// Copy of the target step.
  pub target_copy: usize,
  /// Leased port.
  pub port: u16,
}

impl TransportAdapterPair {
  fn new(link: &TransportLink, port: u16) -> Self {
    Self {
      link: link.id.clone(),
      edge: link.edge.clone(),
      source_node: link.source_node.clone(),
      source_copy: link.edge.from_copy,
      target_node: link.target_node.clone(),
      target_copy: link.edge.to_copy,
      port,
    }
  }
}

/// Result of splitting a graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SplitPlan {
  /// Logical graph name.
  pub graph_name: String,
  /// Sub-graph per node id. Nodes hosting nothing are absent.
  pub subgraphs: BTreeMap<String, PhysicalSubgraph>,
  /// Links that need a port, in creation order.
  pub links: Vec<TransportLink>,
  #[serde(skip)]
  placement: BTreeMap<StepCopy, String>,
}

impl SplitPlan {
  /// Returns the node a logical step copy was placed on.
  pub fn node_of(&self, step: &str, copy: usize) -> Option<&str> {
    self
      .placement
      .get(&StepCopy::new(step, copy))
      .map(String::as_str)
  }

  /// Counts the copies of a logical step across all sub-graphs.
  pub fn occurrences(&self, step: &str) -> usize {
    self
      .subgraphs
      .values()
      .flat_map(|sg| sg.steps.iter())
      .filter(|s| s.name == step && !s.is_adapter())
      .count()
  }

  /// Returns the sub-graph of a node.
  pub fn subgraph(&self, node_id: &str) -> Option<&PhysicalSubgraph> {
    self.subgraphs.get(node_id)
  }

  /// Leases a port for every link and writes it into both adapters.
  ///
  /// # Arguments
  ///
  /// * `lease` - Returns the port for a link, typically by asking the
  ///   [`PortAllocator`](crate::distributed::port_allocator::PortAllocator).
  ///
  /// # Errors
  ///
  /// Stops at, and returns, the first leasing error.
  pub fn bind_ports<E>(
    &mut self,
    mut lease: impl FnMut(&TransportLink) -> Result<u16, E>,
  ) -> Result<Vec<TransportAdapterPair>, E> {
    let mut pairs = Vec::with_capacity(self.links.len());
    for link in &self.links {
      let port = lease(link)?;
      for node in [&link.source_node, &link.target_node] {
        if let Some(subgraph) = self.subgraphs.get_mut(node) {
          for step in &mut subgraph.steps {
            match &mut step.kind {
              StepKind::WriterAdapter(ep) | StepKind::ReaderAdapter(ep) if ep.link == link.id => {
                ep.port = Some(port);
              }
              _ => {}
            }
          }
        }
      }
      pairs.push(TransportAdapterPair::new(link, port));
    }
    Ok(pairs)
  }
}

/// Splits graphs using a node assignment policy.
#[derive(Clone)]
pub struct GraphSplitter {
  assignment: Arc<dyn NodeAssignment>,
}

impl Default for GraphSplitter {
  fn default() -> Self {
    Self::new(Arc::new(RoundRobinAssignment))
  }
}

impl std::fmt::Debug for GraphSplitter {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("GraphSplitter").finish_non_exhaustive()
  }
}

/// Splits a graph with the default round-robin assignment.
///
/// See [`GraphSplitter::split`].
pub fn split(
  graph: &ProcessingGraph,
  cluster: &ClusterSchema,
  partition_schemas: &[PartitionSchema],
) -> Result<SplitPlan, SplitError> {
  GraphSplitter::default().split(graph, cluster, partition_schemas)
}

impl GraphSplitter {
  /// Creates a splitter with a custom assignment policy.
  pub fn new(assignment: Arc<dyn NodeAssignment>) -> Self {
    Self { assignment }
  }

  /// Splits `graph` over `cluster`.
  ///
  /// # Errors
  ///
  /// Returns a [`SplitError`] for any configuration problem: an invalid
  /// graph, cluster or schema, an unresolvable partition schema, a copy count
  /// mismatch, an unknown pinned node, a partitioned step with fewer
  /// partitions than workers, or a step that needs a worker when the cluster
  /// has none.
  pub fn split(
    &self,
    graph: &ProcessingGraph,
    cluster: &ClusterSchema,
    partition_schemas: &[PartitionSchema],
  ) -> Result<SplitPlan, SplitError> {
    graph.validate()?;
    cluster.validate()?;
    let workers = cluster.workers().len();
    let resolved: Vec<PartitionSchema> = partition_schemas
      .iter()
      .map(|schema| schema.resolve_for_workers(workers))
      .collect();
    let mut schemas = HashMap::new();
    for schema in &resolved {
      schema.validate()?;
      schemas.insert(schema.name.as_str(), schema);
    }

    let expanded;
    let graph = match dynamic_copy_counts(graph, &schemas) {
      counts if counts.is_empty() => graph,
      counts => {
        debug!(graph = %graph.name(), steps = counts.len(), "Expanding per-worker partitioned steps");
        expanded = graph.with_copy_counts(&counts)?;
        &expanded
      }
    };

    let placement = self.place(graph, cluster, &schemas)?;
    let mut builder = PlanBuilder {
      graph,
      cluster,
      placement,
      subgraphs: BTreeMap::new(),
      links: Vec::new(),
    };
    builder.add_steps();
    builder.add_edges(&schemas)?;
    let plan = builder.finish();

    info!(
      graph = %plan.graph_name,
      subgraphs = plan.subgraphs.len(),
      links = plan.links.len(),
      "Split graph"
    );
    Ok(plan)
  }

  fn place(
    &self,
    graph: &ProcessingGraph,
    cluster: &ClusterSchema,
    schemas: &HashMap<&str, &PartitionSchema>,
  ) -> Result<BTreeMap<StepCopy, String>, SplitError> {
    let workers = cluster.workers();
    let mut placement = BTreeMap::new();
    let mut ordinal = 0;

    for step in graph.steps() {
      if let Some(schema_name) = &step.partition_schema {
        let schema = resolve_schema(step, schema_name, schemas)?;
        if step.copy_count != schema.partition_count {
          return Err(SplitError::CopyCountMismatch {
            step: step.name.clone(),
            copy_count: step.copy_count,
            partition_count: schema.partition_count,
          });
        }
      }

      if let Some(pinned) = &step.pinned_node {
        let node = cluster
          .node(pinned)
          .map_err(|_| SplitError::UnknownPinnedNode {
            step: step.name.clone(),
            node: pinned.clone(),
          })?;
        for copy in 0..step.copy_count {
          placement.insert(StepCopy::new(step.name.clone(), copy), node.id.clone());
        }
        continue;
      }

      if workers.is_empty() {
        return Err(SplitError::NoWorkerNodes(step.name.clone()));
      }

      if step.is_partitioned() {
        if step.copy_count < workers.len() {
          return Err(SplitError::FewerPartitionsThanWorkers {
            step: step.name.clone(),
            partition_count: step.copy_count,
            workers: workers.len(),
          });
        }
        for copy in 0..step.copy_count {
          let node: &Node = self.assignment.assign_partition(copy, &workers);
          placement.insert(StepCopy::new(step.name.clone(), copy), node.id.clone());
        }
      } else {
        let node = self.assignment.assign_step(step, ordinal, &workers);
        ordinal += 1;
        for copy in 0..step.copy_count {
          placement.insert(StepCopy::new(step.name.clone(), copy), node.id.clone());
        }
      }
    }
    Ok(placement)
  }
}

// Steps bound to a per-worker schema whose copy count differs from the
// resolved partition count.
fn dynamic_copy_counts(
  graph: &ProcessingGraph,
  schemas: &HashMap<&str, &PartitionSchema>,
) -> HashMap<String, usize> {
  graph
    .steps()
    .iter()
    .filter_map(|step| {
      let schema = schemas.get(step.partition_schema.as_deref()?)?;
      (schema.is_dynamic() && schema.partition_count != step.copy_count)
        .then(|| (step.name.clone(), schema.partition_count))
    })
    .collect()
}

fn resolve_schema<'a>(
  step: &Step,
  schema_name: &str,
  schemas: &HashMap<&str, &'a PartitionSchema>,
) -> Result<&'a PartitionSchema, SplitError> {
  schemas
    .get(schema_name)
    .copied()
    .ok_or_else(|| SplitError::UnresolvedPartitionSchema {
      step: step.name.clone(),
      schema: schema_name.to_string(),
    })
}

struct PlanBuilder<'a> {
  graph: &'a ProcessingGraph,
  cluster: &'a ClusterSchema,
  placement: BTreeMap<StepCopy, String>,
  subgraphs: BTreeMap<String, PhysicalSubgraph>,
  links: Vec<TransportLink>,
}

impl PlanBuilder<'_> {
  fn subgraph_mut(&mut self, node_id: &str) -> &mut PhysicalSubgraph {
    let graph_name = self.graph.name();
    self
      .subgraphs
      .entry(node_id.to_string())
      .or_insert_with(|| PhysicalSubgraph::empty(node_id, graph_name))
  }

  fn node_of(&self, copy: &StepCopy) -> String {
    self.placement.get(copy).cloned().unwrap_or_default()
  }

  fn add_steps(&mut self) {
    for step in self.graph.steps() {
      for copy in 0..step.copy_count {
        let node = self.node_of(&StepCopy::new(step.name.clone(), copy));
        let partition = step.is_partitioned().then_some(copy);
        self
          .subgraph_mut(&node)
          .steps
          .push(PhysicalStep::ordinary(&step.name, copy, partition));
      }
    }
  }

  fn add_edges(&mut self, schemas: &HashMap<&str, &PartitionSchema>) -> Result<(), SplitError> {
    let graph = self.graph;
    let mut fanned_out = HashSet::new();

    for edge in graph.edges() {
      let (Some(source), Some(target)) = (graph.step(&edge.from_step), graph.step(&edge.to_step))
      else {
        return Err(GraphError::UnknownStep(edge.to_string()).into());
      };

      let Some(schema) = repartition_schema(source, target, schemas)? else {
        self.connect(edge, false)?;
        continue;
      };
      if !fanned_out.insert((edge.from_step.as_str(), edge.from_copy, edge.to_step.as_str())) {
        continue;
      }

      let mut destinations = Vec::with_capacity(schema.partition_count);
      for partition in 0..schema.partition_count {
        let fanned = Edge::new(&edge.from_step, edge.from_copy, &edge.to_step, partition);
        destinations.push(self.connect(&fanned, true)?);
      }
      let node = self.node_of(&edge.source());
      if let Some(step) = self
        .subgraph_mut(&node)
        .step_mut(&edge.from_step, edge.from_copy)
      {
        step.distributions.push(RowDistribution {
          target_step: edge.to_step.clone(),
          schema: schema.clone(),
          destinations,
        });
      }
    }
    Ok(())
  }

  /// Connects one copy-level edge, cutting it if it crosses nodes. Returns
  /// the step in the source's sub-graph that receives the rows.
  fn connect(&mut self, edge: &Edge, repartition: bool) -> Result<StepCopy, SplitError> {
    let source_node = self.node_of(&edge.source());
    let target_node = self.node_of(&edge.target());

    if source_node == target_node {
      self.subgraph_mut(&source_node).edges.push(PhysicalEdge {
        from: edge.source(),
        to: edge.target(),
      });
      return Ok(edge.target());
    }

    let source_host = self.cluster.node(&source_node)?.host.clone();
    let link = TransportLink {
      id: edge.to_string(),
      edge: edge.clone(),
      source_node: source_node.clone(),
      target_node: target_node.clone(),
      source_host: source_host.clone(),
      repartition,
    };
    let endpoint = |peer: &str| AdapterEndpoint {
      link: link.id.clone(),
      peer_node: peer.to_string(),
      host: source_host.clone(),
      port: None,
      buffer_size: self.cluster.socket_buffer_size,
      compressed: self.cluster.compressed,
    };

    let writer = PhysicalStep::adapter(link.writer_name(), StepKind::WriterAdapter(endpoint(&target_node)));
    let reader = PhysicalStep::adapter(link.reader_name(), StepKind::ReaderAdapter(endpoint(&source_node)));
    let writer_ref = writer.reference();
    let reader_ref = reader.reference();

    let source_subgraph = self.subgraph_mut(&source_node);
    source_subgraph.steps.push(writer);
    source_subgraph.edges.push(PhysicalEdge {
      from: edge.source(),
      to: writer_ref.clone(),
    });

    let target_subgraph = self.subgraph_mut(&target_node);
    target_subgraph.steps.push(reader);
    target_subgraph.edges.push(PhysicalEdge {
      from: reader_ref,
      to: edge.target(),
    });

    debug!(link = %link.id, source = %source_node, target = %target_node, repartition, "Cut edge");
    self.links.push(link);
    Ok(writer_ref)
  }

  fn finish(mut self) -> SplitPlan {
    let workers: Vec<&str> = self.cluster.workers().iter().map(|n| n.id.as_str()).collect();
    let graph_name = self.graph.name().to_string();

    for (node_id, subgraph) in &mut self.subgraphs {
      let worker_number = workers.iter().position(|w| *w == node_id.as_str());
      let vars = &mut subgraph.variables;
      vars.insert("cluster.name".to_string(), self.cluster.name.clone());
      vars.insert("cluster.size".to_string(), workers.len().to_string());
      match worker_number {
        Some(number) => {
          subgraph.name = format!("{} ({}:{})", graph_name, self.cluster.name, node_id);
          vars.insert("cluster.master".to_string(), "N".to_string());
          vars.insert("slave.number".to_string(), number.to_string());
          vars.insert("slave.name".to_string(), node_id.clone());
        }
        None => {
          subgraph.name = format!("{} (master)", graph_name);
          vars.insert("cluster.master".to_string(), "Y".to_string());
        }
      }
    }

    SplitPlan {
      graph_name,
      subgraphs: self.subgraphs,
      links: self.links,
      placement: self.placement,
    }
  }
}

fn repartition_schema<'a>(
  source: &Step,
  target: &Step,
  schemas: &HashMap<&str, &'a PartitionSchema>,
) -> Result<Option<&'a PartitionSchema>, SplitError> {
  match &target.partition_schema {
    Some(name) if source.partition_schema.as_ref() != Some(name) => {
      resolve_schema(target, name, schemas).map(Some)
    }
    _ => Ok(None),
  }
}
