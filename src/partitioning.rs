//! # Partition Schemas
//!
//! A partition schema declares that a step is **partitioned by key**: the step
//! runs exactly `partition_count` copies and copy `i` receives only the rows
//! whose key maps to partition `i`.
//!
//! The partition of a row is a pure function of the row's key value and the
//! schema (`hash_fn(row[key_field]) mod partition_count`). It holds no run-local
//! state, so redistribution is reproducible across retries and across nodes.
//!
//! A schema can also be declared per worker: it then resolves to
//! `partitions_per_worker * workers` partitions once the cluster is known.
//!
//! ## Usage
//!
//! ```rust
//! use clusterweave::partitioning::{PartitionSchema, Row};
//! use serde_json::json;
//!
//! let schema = PartitionSchema::new("by_customer", 4, "customer_id");
//! let row: Row = json!({"customer_id": 10, "amount": 3.5})
//!   .as_object()
//!   .cloned()
//!   .unwrap();
//!
//! assert_eq!(schema.partition_for(&row).unwrap(), 2);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// A row flowing between steps: field name to value.
pub type Row = serde_json::Map<String, Value>;

/// Error type for partition schema operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartitionError {
  /// A schema must declare at least one partition.
  #[error("Partition schema {0} has zero partitions")]
  ZeroPartitions(String),
  /// The row does not carry the schema's key field.
  #[error("Row is missing partition key field {0}")]
  MissingKeyField(String),
  /// The hash function id is not recognised.
  #[error("Unknown hash function: {0}")]
  UnknownHashFunction(String),
}

/// Hash function used to map a key value onto a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum HashFunction {
  /// Integer keys are taken modulo the partition count directly; other keys
  /// fall back to FNV-1a over their text.
  #[default]
  Mod,
  /// FNV-1a over the key's canonical text, for every key type.
  Fnv1a,
}

impl HashFunction {
  /// Returns the descriptor id of this function.
  pub fn id(&self) -> &'static str {
    match self {
      HashFunction::Mod => "mod",
      HashFunction::Fnv1a => "fnv1a",
    }
  }

  /// Hashes a key value.
  ///
  /// The result only depends on the value itself, never on process state
  /// such as a random hasher seed.
  pub fn hash(&self, value: &Value) -> u64 {
    match self {
      HashFunction::Mod => match value {
        Value::Null => 0,
        Value::Bool(b) => u64::from(*b),
        Value::Number(n) => match n.as_i64() {
          Some(i) => i.unsigned_abs(),
          None => n.as_u64().unwrap_or_else(|| fnv1a(n.to_string().as_bytes())),
        },
        Value::String(s) => match s.trim().parse::<i64>() {
          Ok(i) => i.unsigned_abs(),
          Err(_) => fnv1a(s.as_bytes()),
        },
        other => fnv1a(other.to_string().as_bytes()),
      },
      HashFunction::Fnv1a => match value {
        Value::String(s) => fnv1a(s.as_bytes()),
        other => fnv1a(other.to_string().as_bytes()),
      },
    }
  }
}

impl fmt::Display for HashFunction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.id())
  }
}

impl FromStr for HashFunction {
  type Err = PartitionError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "mod" | "modulo" => Ok(HashFunction::Mod),
      "fnv" | "fnv1a" | "fnv-1a" => Ok(HashFunction::Fnv1a),
      _ => Err(PartitionError::UnknownHashFunction(s.to_string())),
    }
  }
}

impl TryFrom<String> for HashFunction {
  type Error = PartitionError;

  fn try_from(s: String) -> Result<Self, Self::Error> {
    s.parse()
  }
}

impl From<HashFunction> for String {
  fn from(h: HashFunction) -> Self {
    h.id().to_string()
  }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
  bytes.iter().fold(FNV_OFFSET, |hash, b| {
    (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME)
  })
}

/// Declares how rows of a partitioned step are distributed over its copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSchema {
  /// Schema name referenced by steps.
  pub name: String,
  /// Number of partitions. Steps bound to this schema run this many copies.
  #[serde(default)]
  pub partition_count: usize,
  /// When set, the partition count is derived from the cluster size.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub partitions_per_worker: Option<usize>,
  /// Row field whose value selects the partition.
  pub key_field: String,
  /// Hash function applied to the key value.
  #[serde(default, rename = "hash_fn_id")]
  pub hash_fn: HashFunction,
}

impl PartitionSchema {
  /// Creates a schema using the default [`HashFunction::Mod`].
  pub fn new(name: impl Into<String>, partition_count: usize, key_field: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      partition_count,
      partitions_per_worker: None,
      key_field: key_field.into(),
      hash_fn: HashFunction::default(),
    }
  }

  /// Creates a schema with `per_worker` partitions on every worker node.
  ///
  /// Until [`resolve_for_workers`](Self::resolve_for_workers) is called the
  /// schema behaves as if the cluster had a single worker.
  pub fn per_worker(name: impl Into<String>, per_worker: usize, key_field: impl Into<String>) -> Self {
    Self {
      partitions_per_worker: Some(per_worker),
      ..Self::new(name, per_worker, key_field)
    }
  }

  /// Returns true if the partition count follows the cluster size.
  pub fn is_dynamic(&self) -> bool {
    self.partitions_per_worker.is_some()
  }

  /// Returns the schema with its partition count fixed for `workers` worker
  /// nodes. Static schemas are returned unchanged.
  ///
  /// A cluster without workers resolves as if it had one.
  #[must_use]
  pub fn resolve_for_workers(&self, workers: usize) -> Self {
    let mut resolved = self.clone();
    if let Some(per_worker) = self.partitions_per_worker {
      resolved.partition_count = per_worker.saturating_mul(workers.max(1));
    }
    resolved
  }

  /// Sets the hash function.
  #[must_use]
  pub fn with_hash_fn(mut self, hash_fn: HashFunction) -> Self {
    self.hash_fn = hash_fn;
    self
  }

  /// Checks that the schema declares at least one partition.
  pub fn validate(&self) -> Result<(), PartitionError> {
    let declared = self.partitions_per_worker.unwrap_or(self.partition_count);
    if declared == 0 {
      return Err(PartitionError::ZeroPartitions(self.name.clone()));
    }
    Ok(())
  }

  /// Returns the partition a key value maps to.
  ///
  /// # Errors
  ///
  /// Returns [`PartitionError::ZeroPartitions`] for an invalid schema.
  pub fn partition_for_value(&self, value: &Value) -> Result<usize, PartitionError> {
    if self.partition_count == 0 {
      return Err(PartitionError::ZeroPartitions(self.name.clone()));
    }
    Ok((self.hash_fn.hash(value) % self.partition_count as u64) as usize)
  }

  /// Returns the partition a row maps to.
  ///
  /// # Errors
  ///
  /// Returns [`PartitionError::MissingKeyField`] if the row has no value for
  /// the key field.
  pub fn partition_for(&self, row: &Row) -> Result<usize, PartitionError> {
    let value = row
      .get(&self.key_field)
      .ok_or_else(|| PartitionError::MissingKeyField(self.key_field.clone()))?;
    self.partition_for_value(value)
  }
}
