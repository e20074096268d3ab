//! Node assignment policies.
//!
//! Decides which worker hosts an unpinned step and which worker owns each
//! partition. Steps pinned to a node never reach the policy, and the
//! coordinator node is never offered: it only hosts what is pinned to it.

use crate::cluster::Node;
use crate::graph::Step;

/// Places steps and partitions on worker nodes.
pub trait NodeAssignment: Send + Sync {
  /// Returns the worker that hosts every copy of an unpinned, unpartitioned
  /// step.
  ///
  /// # Arguments
  ///
  /// * `step` - The step being placed.
  /// * `ordinal` - Position of the step among unpinned steps, in graph order.
  /// * `workers` - Worker nodes in registration order, never empty.
  fn assign_step<'a>(&self, step: &Step, ordinal: usize, workers: &[&'a Node]) -> &'a Node;

  /// Returns the worker that owns `partition`.
  fn assign_partition<'a>(&self, partition: usize, workers: &[&'a Node]) -> &'a Node;
}

/// Round-robin over workers in registration order.
///
/// Partition `i` lives on worker `i mod n`; the `k`-th unpinned step lives
/// on worker `k mod n`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobinAssignment;

impl NodeAssignment for RoundRobinAssignment {
  fn assign_step<'a>(&self, _step: &Step, ordinal: usize, workers: &[&'a Node]) -> &'a Node {
    workers[ordinal % workers.len()]
  }

  fn assign_partition<'a>(&self, partition: usize, workers: &[&'a Node]) -> &'a Node {
    workers[partition % workers.len()]
  }
}
