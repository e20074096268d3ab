//! Tests for graph splitting.

use crate::cluster::{ClusterSchema, Node};
use crate::distributed::assignment::NodeAssignment;
use crate::distributed::splitter::{GraphSplitter, SplitError, StepKind, split};
use crate::graph::{GraphBuilder, Step, StepCopy};
use crate::partitioning::{PartitionSchema, Row};
use serde_json::json;
use std::sync::Arc;

fn cluster(workers: usize) -> ClusterSchema {
  let mut cluster = ClusterSchema::new("cluster", 40000)
    .with_node(Node::coordinator("master", "10.0.0.1", "http://10.0.0.1:8081"));
  for i in 1..=workers {
    cluster = cluster.with_node(Node::worker(
      format!("slave{i}"),
      format!("10.0.0.{}", i + 1),
      format!("http://10.0.0.{}:8081", i + 1),
    ));
  }
  cluster
}

fn twelve() -> PartitionSchema {
  PartitionSchema::new("twelve", 12, "customer_id")
}

#[test]
fn test_twelve_partitions_over_three_workers() {
  let graph = GraphBuilder::new("sales")
    .pinned_step("input", 1, "master")
    .partitioned_step("calc", 12, "twelve")
    .pinned_step("output", 1, "master")
    .hop("input", "calc")
    .hop("calc", "output")
    .build()
    .unwrap();

  let plan = split(&graph, &cluster(3), &[twelve()]).unwrap();

  assert_eq!(plan.occurrences("calc"), 12);
  for worker in ["slave1", "slave2", "slave3"] {
    let sg = plan.subgraph(worker).unwrap();
    let calc = sg.steps.iter().filter(|s| s.name == "calc").count();
    assert_eq!(calc, 4, "{worker}");
  }
  assert_eq!(plan.node_of("calc", 0), Some("slave1"));
  assert_eq!(plan.node_of("calc", 4), Some("slave2"));
  assert_eq!(plan.node_of("calc", 11), Some("slave3"));

  // 12 fan-out links into calc plus 12 links back to the master.
  assert_eq!(plan.links.len(), 24);
  assert_eq!(plan.links.iter().filter(|l| l.repartition).count(), 12);

  let master = plan.subgraph("master").unwrap();
  assert_eq!(master.adapters().count(), 24);
  let input = master.step("input", 0).unwrap();
  assert_eq!(input.distributions.len(), 1);
  assert_eq!(input.distributions[0].destinations.len(), 12);
}

#[test]
fn test_ports_bind_into_both_adapters() {
  let graph = GraphBuilder::new("g")
    .pinned_step("a", 1, "master")
    .step("b", 1)
    .hop("a", "b")
    .build()
    .unwrap();
  let mut plan = split(&graph, &cluster(1), &[]).unwrap();

  let mut next = 40000;
  let pairs = plan
    .bind_ports(|_| -> Result<u16, ()> {
      next += 1;
      Ok(next - 1)
    })
    .unwrap();
  assert_eq!(pairs.len(), 1);
  assert_eq!(pairs[0].port, 40000);
  assert_eq!(pairs[0].source_node, "master");
  assert_eq!(pairs[0].target_node, "slave1");

  let writer = plan.subgraph("master").unwrap().adapters().next().unwrap();
  let reader = plan.subgraph("slave1").unwrap().adapters().next().unwrap();
  match (&writer.kind, &reader.kind) {
    (StepKind::WriterAdapter(w), StepKind::ReaderAdapter(r)) => {
      assert_eq!(w.port, Some(40000));
      assert_eq!(r.port, Some(40000));
      assert_eq!(r.host, "10.0.0.1");
      assert_eq!(w.peer_node, "slave1");
    }
    other => panic!("unexpected adapters {other:?}"),
  }
  assert!(writer.name.starts_with("Writer : "));
  assert!(reader.name.starts_with("Reader : "));
}

#[test]
fn test_same_node_edges_stay_local() {
  let graph = GraphBuilder::new("g")
    .step("a", 2)
    .step("b", 2)
    .hop("a", "b")
    .build()
    .unwrap();
  let plan = split(&graph, &cluster(2), &[]).unwrap();

  // a and b are unpinned steps placed round-robin on different workers.
  assert_eq!(plan.node_of("a", 0), Some("slave1"));
  assert_eq!(plan.node_of("b", 0), Some("slave2"));
  assert_eq!(plan.links.len(), 2);

  let local = GraphBuilder::new("g")
    .pinned_step("a", 2, "slave1")
    .pinned_step("b", 2, "slave1")
    .hop("a", "b")
    .build()
    .unwrap();
  let plan = split(&local, &cluster(2), &[]).unwrap();
  assert!(plan.links.is_empty());
  assert_eq!(plan.subgraphs.len(), 1);
  assert_eq!(plan.subgraph("slave1").unwrap().edges.len(), 2);
}

#[test]
fn test_subgraph_names_and_variables() {
  let graph = GraphBuilder::new("sales")
    .pinned_step("input", 1, "master")
    .step("work", 1)
    .hop("input", "work")
    .build()
    .unwrap();
  let plan = split(&graph, &cluster(2), &[]).unwrap();

  let master = plan.subgraph("master").unwrap();
  assert_eq!(master.name, "sales (master)");
  assert_eq!(master.variables["cluster.master"], "Y");
  assert_eq!(master.variables["cluster.size"], "2");

  let worker = plan.subgraph("slave1").unwrap();
  assert_eq!(worker.name, "sales (cluster:slave1)");
  assert_eq!(worker.variables["cluster.master"], "N");
  assert_eq!(worker.variables["slave.number"], "0");
  assert_eq!(worker.variables["slave.name"], "slave1");

  // slave2 hosts nothing and gets no sub-graph.
  assert!(plan.subgraph("slave2").is_none());
}

#[test]
fn test_master_without_steps_is_not_contacted() {
  let graph = GraphBuilder::new("g").step("a", 1).build().unwrap();
  let plan = split(&graph, &cluster(1), &[]).unwrap();
  assert!(plan.subgraph("master").is_none());
}

#[test]
fn test_configuration_errors() {
  let unresolved = GraphBuilder::new("g")
    .partitioned_step("p", 4, "missing")
    .build()
    .unwrap();
  assert_eq!(
    split(&unresolved, &cluster(2), &[]),
    Err(SplitError::UnresolvedPartitionSchema {
      step: "p".to_string(),
      schema: "missing".to_string(),
    })
  );

  let mismatch = GraphBuilder::new("g")
    .partitioned_step("p", 4, "twelve")
    .build()
    .unwrap();
  assert!(matches!(
    split(&mismatch, &cluster(2), &[twelve()]),
    Err(SplitError::CopyCountMismatch { copy_count: 4, partition_count: 12, .. })
  ));

  let needs_workers = GraphBuilder::new("g")
    .pinned_step("a", 1, "master")
    .partitioned_step("p", 12, "twelve")
    .hop("a", "p")
    .build()
    .unwrap();
  assert_eq!(
    split(&needs_workers, &cluster(0), &[twelve()]),
    Err(SplitError::NoWorkerNodes("p".to_string()))
  );

  let bad_pin = GraphBuilder::new("g")
    .pinned_step("a", 1, "elsewhere")
    .build()
    .unwrap();
  assert!(matches!(
    split(&bad_pin, &cluster(1), &[]),
    Err(SplitError::UnknownPinnedNode { .. })
  ));
}

#[test]
fn test_same_schema_does_not_repartition() {
  let graph = GraphBuilder::new("g")
    .partitioned_step("a", 12, "twelve")
    .partitioned_step("b", 12, "twelve")
    .hop("a", "b")
    .build()
    .unwrap();
  let plan = split(&graph, &cluster(3), &[twelve()]).unwrap();
  assert!(plan.links.is_empty());
  for sg in plan.subgraphs.values() {
    assert!(sg.steps.iter().all(|s| s.distributions.is_empty()));
  }
}

#[test]
fn test_repartition_routes_deterministically() {
  let by_region = PartitionSchema::new("by_region", 3, "region");
  let graph = GraphBuilder::new("g")
    .partitioned_step("a", 12, "twelve")
    .partitioned_step("b", 3, "by_region")
    .hop("a", "b")
    .build()
    .unwrap();
  let plan = split(&graph, &cluster(3), &[twelve(), by_region.clone()]).unwrap();

  let source = plan.subgraph("slave1").unwrap().step("a", 0).unwrap();
  let distribution = &source.distributions[0];
  assert_eq!(distribution.destinations.len(), 3);
  // a.0 and b.0 share slave1, so partition 0 stays local.
  assert_eq!(distribution.destinations[0], StepCopy::new("b", 0));

  let row: Row = json!({"region": 7}).as_object().cloned().unwrap();
  let first = distribution.route(&row).unwrap().clone();
  let second = distribution.route(&row).unwrap().clone();
  assert_eq!(first, second);
  assert_eq!(by_region.partition_for(&row).unwrap(), 1);
  assert!(first.name.starts_with("Writer : "));
}

struct EverythingOnLastWorker;

impl NodeAssignment for EverythingOnLastWorker {
  fn assign_step<'a>(&self, _step: &Step, _ordinal: usize, workers: &[&'a Node]) -> &'a Node {
    workers[workers.len() - 1]
  }

  fn assign_partition<'a>(&self, _partition: usize, workers: &[&'a Node]) -> &'a Node {
    workers[workers.len() - 1]
  }
}

#[test]
fn test_custom_assignment_policy() {
  let graph = GraphBuilder::new("g")
    .step("a", 1)
    .step("b", 1)
    .hop("a", "b")
    .build()
    .unwrap();
  let plan = GraphSplitter::new(Arc::new(EverythingOnLastWorker))
    .split(&graph, &cluster(3), &[])
    .unwrap();
  assert_eq!(plan.node_of("a", 0), Some("slave3"));
  assert_eq!(plan.node_of("b", 0), Some("slave3"));
  assert!(plan.links.is_empty());
}

#[test]
fn test_per_worker_schema_expands_with_the_cluster() {
  let by_customer = PartitionSchema::per_worker("by_customer", 2, "customer_id");
  let graph = GraphBuilder::new("sales")
    .pinned_step("input", 1, "master")
    .partitioned_step("calc", 1, "by_customer")
    .pinned_step("output", 1, "master")
    .hop("input", "calc")
    .hop("calc", "output")
    .build()
    .unwrap();

  let plan = split(&graph, &cluster(3), &[by_customer.clone()]).unwrap();
  assert_eq!(plan.occurrences("calc"), 6);
  for worker in ["slave1", "slave2", "slave3"] {
    let sg = plan.subgraph(worker).unwrap();
    assert_eq!(sg.steps.iter().filter(|s| s.name == "calc").count(), 2, "{worker}");
  }
  let input = plan.subgraph("master").unwrap().step("input", 0).unwrap();
  assert_eq!(input.distributions[0].schema.partition_count, 6);
  assert_eq!(input.distributions[0].destinations.len(), 6);
  // Every calc copy sends its rows back to the single output copy.
  assert_eq!(plan.links.len(), 12);

  let smaller = split(&graph, &cluster(1), &[by_customer]).unwrap();
  assert_eq!(smaller.occurrences("calc"), 2);
  assert_eq!(smaller.node_of("calc", 1), Some("slave1"));
}

#[test]
fn test_fewer_partitions_than_workers_is_rejected() {
  let three = PartitionSchema::new("three", 3, "customer_id");
  let graph = GraphBuilder::new("g")
    .pinned_step("a", 1, "master")
    .partitioned_step("p", 3, "three")
    .hop("a", "p")
    .build()
    .unwrap();

  assert!(split(&graph, &cluster(3), &[three.clone()]).is_ok());
  let err = split(&graph, &cluster(4), &[three.clone()]).unwrap_err();
  assert_eq!(
    err,
    SplitError::FewerPartitionsThanWorkers {
      step: "p".to_string(),
      partition_count: 3,
      workers: 4,
    }
  );
  assert!(err.to_string().contains("4 worker nodes"));

  // A pinned partitioned step does not spread over the workers.
  let pinned = GraphBuilder::new("g")
    .with_step(Step::new("p", 3).with_partition_schema("three").with_pinned_node("slave1"))
    .build()
    .unwrap();
  assert!(split(&pinned, &cluster(4), &[three]).is_ok());
}
