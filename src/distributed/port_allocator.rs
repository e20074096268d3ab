//! Port leasing for inter-node transport links.
//!
//! Every link that crosses a node boundary needs a TCP port on the writer's
//! host. The [`PortAllocator`] hands those ports out per [`RunScope`]:
//!
//! - leasing the same key twice in one scope returns the same port, so a
//!   retried `prepare` reuses what it already leased
//! - new keys get the next port, starting at the cluster's base port and
//!   counting up in first-seen order
//! - [`PortAllocator::release_all`] forgets the whole scope; the next lease
//!   starts again from the base port
//!
//! The allocator is process-local and never touches the network. Leasing
//! takes one short lock.

use crate::distributed::agent::RunScope;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Error type for port leasing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
  /// Every port above the base port is already leased in this scope.
  #[error("No free port left for {scope} above base port {base_port}")]
  Exhausted {
    /// Scope that ran out.
    scope: RunScope,
    /// Base port of the scope.
    base_port: u16,
  },
}

/// Identity of one leased port within a run scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortLeaseKey {
  /// Node hosting the writer adapter.
  pub source_node: String,
  /// Step feeding the writer.
  pub source_step: String,
  /// Copy of the source step.
  pub source_copy: usize,
  /// Node hosting the reader adapter.
  pub target_node: String,
  /// Step fed by the reader.
  pub target_step: String,
  /// Copy of the target step.
  pub target_copy: usize,
}

impl PortLeaseKey {
  /// Creates a lease key.
  pub fn new(
    source_node: impl Into<String>,
    source_step: impl Into<String>,
    source_copy: usize,
    target_node: impl Into<String>,
    target_step: impl Into<String>,
    target_copy: usize,
  ) -> Self {
    Self {
      source_node: source_node.into(),
      source_step: source_step.into(),
      source_copy,
      target_node: target_node.into(),
      target_step: target_step.into(),
      target_copy,
    }
  }
}

#[derive(Debug)]
struct ScopeTable {
  base_port: u16,
  next: Option<u16>,
  leases: HashMap<PortLeaseKey, u16>,
}

/// Releases a scope's leases when dropped. Created by
/// [`PortAllocator::release_guard`].
pub type ScopeRelease =
  scopeguard::ScopeGuard<(Arc<PortAllocator>, RunScope), fn((Arc<PortAllocator>, RunScope))>;

fn release_scope((allocator, scope): (Arc<PortAllocator>, RunScope)) {
  allocator.release_all(&scope);
}

/// Leases ports for transport links, scoped per run.
#[derive(Debug, Default)]
pub struct PortAllocator {
  tables: Mutex<HashMap<RunScope, ScopeTable>>,
}

impl PortAllocator {
  /// Creates an empty allocator.
  pub fn new() -> Self {
    Self::default()
  }

  /// Leases the port for `key` within `scope`.
  ///
  /// The first lease in a scope fixes its base port; later calls ignore
  /// `base_port` until the scope is released.
  ///
  /// # Errors
  ///
  /// Returns [`PortError::Exhausted`] when no port is left above the base.
  pub fn lease(&self, scope: &RunScope, base_port: u16, key: &PortLeaseKey) -> Result<u16, PortError> {
    let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
    let table = tables.entry(scope.clone()).or_insert_with(|| ScopeTable {
      base_port,
      next: Some(base_port),
      leases: HashMap::new(),
    });

    if let Some(port) = table.leases.get(key) {
      return Ok(*port);
    }

    let port = table.next.ok_or_else(|| PortError::Exhausted {
      scope: scope.clone(),
      base_port: table.base_port,
    })?;
    table.next = port.checked_add(1);
    table.leases.insert(key.clone(), port);
    debug!(
      run_id = %scope.run_id,
      graph = %scope.graph_name,
      port,
      source = %key.source_node,
      target = %key.target_node,
      "Leased transport port"
    );
    Ok(port)
  }

  /// Returns the port already leased for `key`, if any.
  pub fn leased(&self, scope: &RunScope, key: &PortLeaseKey) -> Option<u16> {
    let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
    tables.get(scope).and_then(|t| t.leases.get(key).copied())
  }

  /// Returns how many ports are leased in `scope`.
  pub fn lease_count(&self, scope: &RunScope) -> usize {
    let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
    tables.get(scope).map_or(0, |t| t.leases.len())
  }

  /// Forgets every lease of `scope` and returns how many there were.
  pub fn release_all(&self, scope: &RunScope) -> usize {
    let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
    let released = tables.remove(scope).map_or(0, |t| t.leases.len());
    info!(
      run_id = %scope.run_id,
      graph = %scope.graph_name,
      released,
      "Released transport ports"
    );
    released
  }

  /// Returns a guard that calls [`release_all`](Self::release_all) for
  /// `scope` exactly once, when it is dropped.
  pub fn release_guard(self: &Arc<Self>, scope: RunScope) -> ScopeRelease {
    scopeguard::guard((Arc::clone(self), scope), release_scope as fn(_))
  }
}
