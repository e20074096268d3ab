//! # Cluster Sequences
//!
//! Block-allocated, persistently backed counters shared by every node of a
//! cluster.
//!
//! [`SequenceService::next`] reserves `block_size` consecutive values with one
//! atomic update of the store and returns the first of them. The caller then
//! hands the values out locally ([`SequenceBlock`]) without a round trip per
//! value. Two concurrent calls never receive overlapping blocks, because the
//! store's own atomic update is the only serialization point.
//!
//! ```rust
//! use clusterweave::sequence::{InMemorySequenceStore, SequenceService};
//! use std::sync::Arc;
//!
//! let service = SequenceService::new(Arc::new(InMemorySequenceStore::new()))
//!   .with_auto_create(1);
//! assert_eq!(service.next("order_id", 1000).unwrap(), 1);
//! assert_eq!(service.next("order_id", 1000).unwrap(), 1001);
//! ```

mod store;

pub use store::{FileSequenceStore, InMemorySequenceStore, SequenceStore};

use std::sync::Arc;
use tracing::{debug, info};

/// Error type for sequence operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SequenceError {
  /// The sequence does not exist and auto-creation is disabled.
  #[error("Unknown sequence: {0}")]
  UnknownSequence(String),
  /// The backing store could not be read or written.
  #[error("Sequence store unavailable: {0}")]
  StoreUnavailable(String),
  /// Blocks must hold at least one value.
  #[error("Invalid block size: {0}")]
  InvalidBlockSize(i64),
  /// Advancing the sequence would overflow.
  #[error("Sequence {0} overflowed")]
  Overflow(String),
}

impl SequenceError {
  /// Returns true if the caller may retry the same request.
  pub fn is_retryable(&self) -> bool {
    matches!(self, SequenceError::StoreUnavailable(_))
  }
}

/// Allocates blocks of sequence values.
#[derive(Clone)]
pub struct SequenceService {
  store: Arc<dyn SequenceStore>,
  auto_create: Option<i64>,
}

impl std::fmt::Debug for SequenceService {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SequenceService")
      .field("auto_create", &self.auto_create)
      .finish_non_exhaustive()
  }
}

impl SequenceService {
  /// Creates a service over `store` with auto-creation disabled.
  pub fn new(store: Arc<dyn SequenceStore>) -> Self {
    Self {
      store,
      auto_create: None,
    }
  }

  /// Creates missing sequences at `initial_value` instead of failing.
  #[must_use]
  pub fn with_auto_create(mut self, initial_value: i64) -> Self {
    self.auto_create = Some(initial_value);
    self
  }

  /// Reserves `block_size` values of `name` and returns the first one.
  ///
  /// # Errors
  ///
  /// - [`SequenceError::InvalidBlockSize`] if `block_size < 1`
  /// - [`SequenceError::UnknownSequence`] if the sequence is missing and
  ///   auto-creation is disabled
  /// - [`SequenceError::StoreUnavailable`] if the store fails (retryable)
  pub fn next(&self, name: &str, block_size: i64) -> Result<i64, SequenceError> {
    if block_size < 1 {
      return Err(SequenceError::InvalidBlockSize(block_size));
    }
    if let Some(start) = self.store.fetch_add(name, block_size)? {
      debug!(sequence = name, start, block_size, "Allocated sequence block");
      return Ok(start);
    }

    let Some(initial) = self.auto_create else {
      return Err(SequenceError::UnknownSequence(name.to_string()));
    };
    if self.store.create_if_absent(name, initial)? {
      info!(sequence = name, initial, "Created sequence");
    }
    let start = self
      .store
      .fetch_add(name, block_size)?
      .ok_or_else(|| SequenceError::UnknownSequence(name.to_string()))?;
    debug!(sequence = name, start, block_size, "Allocated sequence block");
    Ok(start)
  }
}

/// Hands out sequence values locally, fetching a new block when the current
/// one runs out.
#[derive(Debug)]
pub struct SequenceBlock {
  service: SequenceService,
  name: String,
  block_size: i64,
  next: i64,
  remaining: i64,
}

impl SequenceBlock {
  /// Creates an empty block; the first call to
  /// [`next_value`](Self::next_value) fetches from the service.
  pub fn new(service: SequenceService, name: impl Into<String>, block_size: i64) -> Self {
    Self {
      service,
      name: name.into(),
      block_size,
      next: 0,
      remaining: 0,
    }
  }

  /// Returns the next value.
  ///
  /// # Errors
  ///
  /// Propagates errors from refilling the block.
  pub fn next_value(&mut self) -> Result<i64, SequenceError> {
    if self.remaining == 0 {
      self.next = self.service.next(&self.name, self.block_size)?;
      self.remaining = self.block_size;
    }
    let value = self.next;
    self.next += 1;
    self.remaining -= 1;
    Ok(value)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;
  use tempfile::TempDir;

  fn memory() -> SequenceService {
    SequenceService::new(Arc::new(InMemorySequenceStore::new()))
  }

  #[test]
  fn test_blocks_start_at_initial_value() {
    let service = memory().with_auto_create(1);
    assert_eq!(service.next("s", 1000).unwrap(), 1);
    assert_eq!(service.next("s", 1000).unwrap(), 1001);
    assert_eq!(service.next("s", 1).unwrap(), 2001);
  }

  #[test]
  fn test_unknown_sequence_without_auto_create() {
    let service = memory();
    let err = service.next("unknown", 1000).unwrap_err();
    assert_eq!(err, SequenceError::UnknownSequence("unknown".to_string()));
    assert!(!err.is_retryable());
  }

  #[test]
  fn test_existing_sequence_without_auto_create() {
    let store = Arc::new(InMemorySequenceStore::new());
    store.create_if_absent("s", 50).unwrap();
    let service = SequenceService::new(store);
    assert_eq!(service.next("s", 10).unwrap(), 50);
    assert_eq!(service.next("s", 10).unwrap(), 60);
  }

  #[test]
  fn test_invalid_block_size() {
    let service = memory().with_auto_create(1);
    assert_eq!(
      service.next("s", 0),
      Err(SequenceError::InvalidBlockSize(0))
    );
    assert_eq!(
      service.next("s", -5),
      Err(SequenceError::InvalidBlockSize(-5))
    );
  }

  #[test]
  fn test_sequence_block_refills() {
    let service = memory().with_auto_create(1);
    let mut block = SequenceBlock::new(service.clone(), "s", 3);
    let values: Vec<i64> = (0..7).map(|_| block.next_value().unwrap()).collect();
    assert_eq!(values, vec![1, 2, 3, 4, 5, 6, 7]);
    // Three blocks were fetched: 1, 4 and 7.
    assert_eq!(service.next("s", 1).unwrap(), 10);
  }

  fn assert_disjoint_blocks(service: SequenceService) {
    let handles: Vec<_> = (0..8)
      .map(|_| {
        let service = service.clone();
        std::thread::spawn(move || {
          (0..25)
            .map(|_| service.next("shared", 100).unwrap())
            .collect::<Vec<i64>>()
        })
      })
      .collect();
    let starts: Vec<i64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    let unique: HashSet<i64> = starts.iter().copied().collect();
    assert_eq!(unique.len(), 200);
    for start in &starts {
      assert_eq!((start - 1) % 100, 0);
    }
  }

  #[test]
  fn test_concurrent_calls_never_overlap_in_memory() {
    assert_disjoint_blocks(memory().with_auto_create(1));
  }

  #[test]
  fn test_concurrent_calls_never_overlap_on_file() {
    let tmp = TempDir::new().unwrap();
    let store = FileSequenceStore::new(tmp.path().join("sequences.json"));
    assert_disjoint_blocks(SequenceService::new(Arc::new(store)).with_auto_create(1));
  }
}
