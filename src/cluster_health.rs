//! Cluster health aggregation for clustered runs.
//!
//! Combines the per-node [`NodeRunStatus`] the coordinator collects into one
//! run-level report: how many nodes finished, failed or were stopped, the
//! summed row counters and the run's error count.
//!
//! The error count is the number that decides success. A node contributes
//! its reported `error_count` if it finished, and at least 1 in any other
//! phase, so a stopped, failed or unreachable node can never yield a
//! successful run.

use crate::distributed::agent::{NodePhase, NodeRunStatus};
use serde::Serialize;

/// Run-level view over node statuses.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunHealthReport {
  /// Nodes reporting.
  pub total: u32,
  /// Nodes that finished.
  pub finished: u32,
  /// Nodes still prepared or running.
  pub active: u32,
  /// Nodes that were stopped.
  pub stopped: u32,
  /// Nodes in error, including unreachable ones.
  pub failed: u32,
  /// Aggregated error count.
  pub error_count: u64,
  /// Rows read across the cluster.
  pub rows_read: u64,
  /// Rows written across the cluster.
  pub rows_written: u64,
}

impl RunHealthReport {
  /// Returns true if every node finished.
  pub fn all_finished(&self) -> bool {
    self.finished == self.total
  }

  /// Returns true if every node finished without errors.
  pub fn is_success(&self) -> bool {
    self.all_finished() && self.error_count == 0
  }
}

/// Error contribution of one node.
pub fn node_errors(status: &NodeRunStatus) -> u64 {
  match status.phase {
    NodePhase::Finished => status.error_count,
    _ => status.error_count.max(1),
  }
}

/// Aggregates node statuses into a report.
///
/// # Example
///
/// ```rust
/// use clusterweave::cluster_health::aggregate_run_health;
/// use clusterweave::distributed::{NodePhase, NodeRunStatus};
///
/// let statuses = vec![
///   NodeRunStatus::new("slave1", NodePhase::Finished).with_rows(10, 10),
///   NodeRunStatus::new("slave2", NodePhase::Finished).with_rows(5, 5),
///   NodeRunStatus::new("slave3", NodePhase::Error).with_errors(2),
/// ];
/// let report = aggregate_run_health(&statuses);
/// assert_eq!(report.finished, 2);
/// assert_eq!(report.failed, 1);
/// assert_eq!(report.error_count, 2);
/// assert_eq!(report.rows_read, 15);
/// assert!(!report.is_success());
/// ```
pub fn aggregate_run_health<'a>(statuses: impl IntoIterator<Item = &'a NodeRunStatus>) -> RunHealthReport {
  statuses
    .into_iter()
    .fold(RunHealthReport::default(), |mut report, status| {
      report.total += 1;
      match status.phase {
        NodePhase::Finished => report.finished += 1,
        NodePhase::Prepared | NodePhase::Running => report.active += 1,
        NodePhase::Stopped => report.stopped += 1,
        NodePhase::Error => report.failed += 1,
      }
      report.error_count = report.error_count.saturating_add(node_errors(status));
      report.rows_read = report.rows_read.saturating_add(status.rows_read);
      report.rows_written = report.rows_written.saturating_add(status.rows_written);
      report
    })
}

/// Returns the aggregated error count of `statuses`.
pub fn aggregate_errors<'a>(statuses: impl IntoIterator<Item = &'a NodeRunStatus>) -> u64 {
  statuses.into_iter().map(node_errors).fold(0, u64::saturating_add)
}
