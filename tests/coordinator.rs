use async_trait::async_trait;
use clusterweave::cluster::{ClusterSchema, Node};
use clusterweave::distributed::splitter::PhysicalSubgraph;
use clusterweave::distributed::{
  AgentError, CoordinatorConfig, GraphSplitter, NodeAgent, NodeAssignment, NodePhase, NodeRunStatus,
  PortAllocator, RetryPolicy, RunCoordinator, RunError, RunPhase, RunScope,
};
use clusterweave::graph::{GraphBuilder, ProcessingGraph, Step};
use clusterweave::partitioning::PartitionSchema;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// Node agent double answering from per-node scripts.
#[derive(Default)]
struct ScriptedAgent {
  calls: Mutex<Vec<(String, String)>>,
  prepared: Mutex<HashMap<String, PhysicalSubgraph>>,
  prepare_failures: Mutex<HashMap<String, VecDeque<AgentError>>>,
  start_failures: Mutex<HashSet<String>>,
  statuses: Mutex<HashMap<String, VecDeque<Result<NodeRunStatus, AgentError>>>>,
  transient_start_failures: Mutex<HashSet<String>>,
  hung: Mutex<HashSet<String>>,
}

impl ScriptedAgent {
  fn fail_prepare(&self, node: &str, errors: Vec<AgentError>) {
    self
      .prepare_failures
      .lock()
      .unwrap()
      .insert(node.to_string(), errors.into());
  }

  fn fail_start(&self, node: &str) {
    self.start_failures.lock().unwrap().insert(node.to_string());
  }

  fn fail_start_transiently(&self, node: &str) {
    self.transient_start_failures.lock().unwrap().insert(node.to_string());
  }

  // The last scripted reply repeats forever.
  fn script_status(&self, node: &str, replies: Vec<Result<NodeRunStatus, AgentError>>) {
    self
      .statuses
      .lock()
      .unwrap()
      .insert(node.to_string(), replies.into());
  }

  // Status calls to `node` never return.
  fn hang_status(&self, node: &str) {
    self.hung.lock().unwrap().insert(node.to_string());
  }

  fn calls(&self, call: &str) -> Vec<String> {
    let mut nodes: Vec<String> = self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|(c, _)| c == call)
      .map(|(_, n)| n.clone())
      .collect();
    nodes.sort();
    nodes
  }

  fn record(&self, call: &str, node: &Node) {
    self
      .calls
      .lock()
      .unwrap()
      .push((call.to_string(), node.id.clone()));
  }
}

#[async_trait]
impl NodeAgent for ScriptedAgent {
  async fn prepare(
    &self,
    node: &Node,
    _scope: &RunScope,
    subgraph: &PhysicalSubgraph,
  ) -> Result<(), AgentError> {
    self.record("prepare", node);
    if let Some(errors) = self.prepare_failures.lock().unwrap().get_mut(&node.id)
      && let Some(e) = errors.pop_front()
    {
      return Err(e);
    }
    self
      .prepared
      .lock()
      .unwrap()
      .insert(node.id.clone(), subgraph.clone());
    Ok(())
  }

  async fn start(&self, node: &Node, _scope: &RunScope) -> Result<(), AgentError> {
    self.record("start", node);
    if self.start_failures.lock().unwrap().contains(&node.id) {
      return Err(AgentError::Rejected("start refused".to_string()));
    }
    if self.transient_start_failures.lock().unwrap().contains(&node.id) {
      return Err(AgentError::Unavailable("connection refused".to_string()));
    }
    Ok(())
  }

  async fn status(&self, node: &Node, _scope: &RunScope) -> Result<NodeRunStatus, AgentError> {
    self.record("status", node);
    let hung = self.hung.lock().unwrap().contains(&node.id);
    if hung {
      std::future::pending::<()>().await;
    }
    let mut statuses = self.statuses.lock().unwrap();
    match statuses.get_mut(&node.id) {
      Some(replies) if replies.len() > 1 => replies.pop_front().unwrap(),
      Some(replies) => replies.front().cloned().unwrap(),
      None => Ok(NodeRunStatus::new(node.id.clone(), NodePhase::Finished)),
    }
  }

  async fn stop(&self, node: &Node, _scope: &RunScope) -> Result<(), AgentError> {
    self.record("stop", node);
    Ok(())
  }
}

fn cluster() -> ClusterSchema {
  ClusterSchema::new("cluster", 40000)
    .with_node(Node::coordinator("master", "10.0.0.1", "http://10.0.0.1:8081"))
    .with_node(Node::worker("slave1", "10.0.0.2", "http://10.0.0.2:8081"))
    .with_node(Node::worker("slave2", "10.0.0.3", "http://10.0.0.3:8081"))
}

fn schemas() -> Vec<PartitionSchema> {
  vec![PartitionSchema::new("by_id", 2, "id")]
}

// read (master) fans out to two partitioned copies on slave1 and slave2.
fn graph() -> ProcessingGraph {
  GraphBuilder::new("orders")
    .pinned_step("read", 1, "master")
    .partitioned_step("calc", 2, "by_id")
    .hop("read", "calc")
    .build()
    .unwrap()
}

fn scope() -> RunScope {
  RunScope::new("run-1", "orders")
}

fn config() -> CoordinatorConfig {
  CoordinatorConfig::default()
    .with_retry(RetryPolicy::none())
    .with_poll_interval(Duration::from_millis(10))
}

fn coordinator(agent: &Arc<ScriptedAgent>, allocator: &Arc<PortAllocator>) -> RunCoordinator {
  RunCoordinator::new(agent.clone(), allocator.clone(), config())
}

fn running(node: &str) -> Result<NodeRunStatus, AgentError> {
  Ok(NodeRunStatus::new(node, NodePhase::Running))
}

#[tokio::test]
async fn test_successful_run() {
  let agent = Arc::new(ScriptedAgent::default());
  let allocator = Arc::new(PortAllocator::new());
  agent.script_status("slave1", vec![
    running("slave1"),
    Ok(NodeRunStatus::new("slave1", NodePhase::Finished).with_rows(10, 10)),
  ]);
  let coordinator = coordinator(&agent, &allocator);

  let result = coordinator
    .execute(&graph(), &cluster(), &schemas(), &scope())
    .await
    .unwrap();

  assert!(result.is_success());
  assert_eq!(result.phase, RunPhase::Finished);
  assert_eq!(result.errors, 0);
  assert_eq!(result.health.rows_read, 10);
  assert_eq!(result.pairs.len(), 2);
  assert!(result.started_at.is_some());
  assert!(result.finished_at.is_some());
  assert_eq!(agent.calls("prepare"), vec!["master", "slave1", "slave2"]);
  assert_eq!(agent.calls("start"), vec!["master", "slave1", "slave2"]);
  assert_eq!(agent.calls("stop"), vec!["master", "slave1", "slave2"]);
  assert_eq!(allocator.lease_count(&scope()), 0);
}

#[tokio::test]
async fn test_node_errors_are_aggregated() {
  let agent = Arc::new(ScriptedAgent::default());
  let allocator = Arc::new(PortAllocator::new());
  agent.script_status("slave1", vec![Ok(
    NodeRunStatus::new("slave1", NodePhase::Finished).with_errors(2),
  )]);
  agent.script_status("slave2", vec![Ok(NodeRunStatus::new("slave2", NodePhase::Stopped))]);
  let coordinator = coordinator(&agent, &allocator);

  let result = coordinator
    .execute(&graph(), &cluster(), &schemas(), &scope())
    .await
    .unwrap();

  assert_eq!(result.errors, 3);
  assert_eq!(result.phase, RunPhase::Error);
  assert!(!result.is_success());
  assert_eq!(result.health.stopped, 1);
}

#[tokio::test]
async fn test_prepare_retry_reuses_ports() {
  let agent = Arc::new(ScriptedAgent::default());
  let allocator = Arc::new(PortAllocator::new());
  agent.fail_prepare("slave2", vec![AgentError::Rejected("not ready".to_string())]);
  let coordinator = coordinator(&agent, &allocator);

  let err = coordinator
    .prepare(&graph(), &cluster(), &schemas(), &scope())
    .await
    .unwrap_err();
  assert!(matches!(err, RunError::Communication { ref node, .. } if node == "slave2"));
  assert_eq!(coordinator.phase(), RunPhase::Built);
  assert_eq!(allocator.lease_count(&scope()), 2);

  let first: Vec<u16> = agent.prepared.lock().unwrap()["slave1"]
    .adapters()
    .filter_map(|s| s.endpoint().and_then(|e| e.port))
    .collect();

  let pairs = coordinator
    .prepare(&graph(), &cluster(), &schemas(), &scope())
    .await
    .unwrap();
  assert_eq!(coordinator.phase(), RunPhase::Prepared);
  assert_eq!(allocator.lease_count(&scope()), 2);
  let mut ports: Vec<u16> = pairs.iter().map(|p| p.port).collect();
  ports.sort();
  assert_eq!(ports, vec![40000, 40001]);

  let second: Vec<u16> = agent.prepared.lock().unwrap()["slave1"]
    .adapters()
    .filter_map(|s| s.endpoint().and_then(|e| e.port))
    .collect();
  assert_eq!(first, second);

  coordinator.cleanup().await;
  assert_eq!(allocator.lease_count(&scope()), 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_prepare_failure_is_retried() {
  let agent = Arc::new(ScriptedAgent::default());
  let allocator = Arc::new(PortAllocator::new());
  agent.fail_prepare("slave1", vec![
    AgentError::Unavailable("connection refused".to_string()),
    AgentError::Timeout,
  ]);
  let config = config().with_retry(
    RetryPolicy::default()
      .with_max_retries(2)
      .with_backoff_increment(Duration::from_millis(100)),
  );
  let coordinator = RunCoordinator::new(agent.clone(), allocator.clone(), config);

  coordinator
    .prepare(&graph(), &cluster(), &schemas(), &scope())
    .await
    .unwrap();
  assert_eq!(agent.calls("prepare").iter().filter(|n| *n == "slave1").count(), 3);
  assert_eq!(coordinator.phase(), RunPhase::Prepared);
}

#[tokio::test]
async fn test_start_failure_stops_started_nodes() {
  let agent = Arc::new(ScriptedAgent::default());
  let allocator = Arc::new(PortAllocator::new());
  agent.fail_start("slave2");
  let coordinator = coordinator(&agent, &allocator);

  let err = coordinator
    .execute(&graph(), &cluster(), &schemas(), &scope())
    .await
    .unwrap_err();

  assert!(matches!(err, RunError::Communication { ref node, .. } if node == "slave2"));
  assert_eq!(coordinator.phase(), RunPhase::Error);
  assert!(agent.calls("status").is_empty());
  let stops = agent.calls("stop");
  assert!(stops.contains(&"master".to_string()));
  assert!(stops.contains(&"slave1".to_string()));
  assert_eq!(allocator.lease_count(&scope()), 0);
  assert!(coordinator.run_result().errors >= 1);
}

#[tokio::test]
async fn test_configuration_error_contacts_no_node() {
  let agent = Arc::new(ScriptedAgent::default());
  let allocator = Arc::new(PortAllocator::new());
  let coordinator = coordinator(&agent, &allocator);

  let err = coordinator
    .execute(&graph(), &cluster(), &[], &scope())
    .await
    .unwrap_err();

  assert!(matches!(err, RunError::Configuration(_)));
  assert!(agent.calls.lock().unwrap().is_empty());
  assert_eq!(allocator.lease_count(&scope()), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_interrupts_monitor() {
  let agent = Arc::new(ScriptedAgent::default());
  let allocator = Arc::new(PortAllocator::new());
  for node in ["master", "slave1", "slave2"] {
    agent.script_status(node, vec![running(node)]);
  }
  let coordinator = Arc::new(coordinator(&agent, &allocator));
  coordinator
    .prepare(&graph(), &cluster(), &schemas(), &scope())
    .await
    .unwrap();
  coordinator.start().await.unwrap();

  let monitor = {
    let coordinator = coordinator.clone();
    tokio::spawn(async move { coordinator.monitor(Duration::from_secs(1), None).await })
  };
  tokio::time::sleep(Duration::from_millis(2500)).await;
  coordinator.stop().await;

  let errors = monitor.await.unwrap().unwrap();
  assert_eq!(errors, 3);
  assert_eq!(coordinator.phase(), RunPhase::Stopped);
  assert_eq!(agent.calls("stop"), vec!["master", "slave1", "slave2"]);

  coordinator.cleanup().await;
  assert_eq!(allocator.lease_count(&scope()), 0);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_marks_running_nodes_failed() {
  let agent = Arc::new(ScriptedAgent::default());
  let allocator = Arc::new(PortAllocator::new());
  agent.script_status("slave2", vec![running("slave2")]);
  let coordinator = coordinator(&agent, &allocator);
  coordinator
    .prepare(&graph(), &cluster(), &schemas(), &scope())
    .await
    .unwrap();
  coordinator.start().await.unwrap();

  let errors = coordinator
    .monitor(Duration::from_millis(100), Some(Duration::from_secs(1)))
    .await
    .unwrap();

  assert_eq!(errors, 1);
  assert_eq!(coordinator.phase(), RunPhase::Error);
  let slave2 = coordinator
    .node_statuses()
    .into_iter()
    .find(|s| s.node == "slave2")
    .unwrap();
  assert_eq!(slave2.phase, NodePhase::Error);
  assert!(agent.calls("stop").contains(&"slave2".to_string()));
}

#[tokio::test]
async fn test_unreachable_node_fails_the_run() {
  let agent = Arc::new(ScriptedAgent::default());
  let allocator = Arc::new(PortAllocator::new());
  agent.script_status("master", vec![running("master")]);
  agent.script_status("slave1", vec![Err(AgentError::Unavailable(
    "connection refused".to_string(),
  ))]);
  agent.script_status("slave2", vec![running("slave2")]);
  let coordinator = coordinator(&agent, &allocator);

  let result = coordinator
    .execute(&graph(), &cluster(), &schemas(), &scope())
    .await
    .unwrap();

  assert_eq!(result.phase, RunPhase::Error);
  assert_eq!(result.errors, 3);
  assert_eq!(result.health.failed, 1);
  assert_eq!(result.health.stopped, 2);
  assert_eq!(allocator.lease_count(&scope()), 0);
}

#[tokio::test]
async fn test_stop_before_prepare_contacts_no_node() {
  let agent = Arc::new(ScriptedAgent::default());
  let allocator = Arc::new(PortAllocator::new());
  let coordinator = coordinator(&agent, &allocator);

  coordinator.stop().await;

  assert_eq!(coordinator.phase(), RunPhase::Stopped);
  assert!(agent.calls.lock().unwrap().is_empty());
  assert!(matches!(
    coordinator
      .prepare(&graph(), &cluster(), &schemas(), &scope())
      .await,
    Err(RunError::InvalidTransition { .. })
  ));
}

#[tokio::test]
async fn test_cleanup_is_idempotent() {
  let agent = Arc::new(ScriptedAgent::default());
  let allocator = Arc::new(PortAllocator::new());
  let coordinator = coordinator(&agent, &allocator);
  coordinator
    .prepare(&graph(), &cluster(), &schemas(), &scope())
    .await
    .unwrap();

  assert_eq!(coordinator.cleanup().await, 0);
  assert_eq!(coordinator.phase(), RunPhase::Stopped);
  assert_eq!(coordinator.cleanup().await, 0);
  assert_eq!(allocator.lease_count(&scope()), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_interrupts_a_hanging_status_call() {
  let agent = Arc::new(ScriptedAgent::default());
  let allocator = Arc::new(PortAllocator::new());
  agent.script_status("master", vec![running("master")]);
  agent.script_status("slave2", vec![running("slave2")]);
  agent.hang_status("slave1");
  let coordinator = Arc::new(RunCoordinator::new(
    agent.clone(),
    allocator.clone(),
    CoordinatorConfig::default().with_poll_interval(Duration::from_millis(10)),
  ));
  coordinator
    .prepare(&graph(), &cluster(), &schemas(), &scope())
    .await
    .unwrap();
  coordinator.start().await.unwrap();

  let token = coordinator.cancellation_token();
  let stopper = {
    let coordinator = coordinator.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(100)).await;
      coordinator.stop().await;
    })
  };

  let started = tokio::time::Instant::now();
  let errors = coordinator.monitor(Duration::from_millis(10), None).await.unwrap();
  assert!(started.elapsed() < Duration::from_secs(1));
  assert!(token.is_cancelled());
  assert_eq!(errors, 3);

  stopper.await.unwrap();
  assert_eq!(coordinator.phase(), RunPhase::Stopped);
  let slave1 = coordinator
    .node_statuses()
    .into_iter()
    .find(|s| s.node == "slave1")
    .unwrap();
  assert_eq!(slave1.phase, NodePhase::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_start_stops_every_node() {
  let agent = Arc::new(ScriptedAgent::default());
  let allocator = Arc::new(PortAllocator::new());
  // slave2 keeps refusing connections, so start sits in backoff.
  let coordinator = Arc::new(RunCoordinator::new(
    agent.clone(),
    allocator.clone(),
    CoordinatorConfig::default().with_retry(RetryPolicy::default().with_max_retries(10)),
  ));
  coordinator
    .prepare(&graph(), &cluster(), &schemas(), &scope())
    .await
    .unwrap();
  agent.fail_start_transiently("slave2");

  let stopper = {
    let coordinator = coordinator.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(100)).await;
      coordinator.stop().await;
    })
  };

  let started = tokio::time::Instant::now();
  assert_eq!(coordinator.start().await, Err(RunError::Cancelled));
  assert!(started.elapsed() < Duration::from_secs(1));
  stopper.await.unwrap();

  assert_eq!(coordinator.phase(), RunPhase::Stopped);
  assert!(agent.calls("stop").contains(&"slave2".to_string()));
  coordinator.cleanup().await;
  assert_eq!(allocator.lease_count(&scope()), 0);
}

struct FirstWorkerOnly;

impl NodeAssignment for FirstWorkerOnly {
  fn assign_step<'a>(&self, _step: &Step, _ordinal: usize, workers: &[&'a Node]) -> &'a Node {
    workers[0]
  }

  fn assign_partition<'a>(&self, _partition: usize, workers: &[&'a Node]) -> &'a Node {
    workers[0]
  }
}

#[tokio::test]
async fn test_custom_assignment_limits_participants() {
  let agent = Arc::new(ScriptedAgent::default());
  let allocator = Arc::new(PortAllocator::new());
  let coordinator = coordinator(&agent, &allocator)
    .with_splitter(GraphSplitter::new(Arc::new(FirstWorkerOnly)));

  let result = coordinator
    .execute(&graph(), &cluster(), &schemas(), &scope())
    .await
    .unwrap();

  assert!(result.is_success());
  assert_eq!(agent.calls("prepare"), vec!["master", "slave1"]);
  assert_eq!(result.pairs.len(), 2);
  assert!(result.pairs.iter().all(|p| p.target_node == "slave1"));
}
