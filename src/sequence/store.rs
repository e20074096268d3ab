//! Persistence for sequences.
//!
//! A [`SequenceStore`] owns the atomic read-modify-write of one sequence
//! value. The service above it never serializes access itself.

use super::SequenceError;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tempfile::NamedTempFile;

/// Storage backend for cluster sequences.
pub trait SequenceStore: Send + Sync {
  /// Atomically adds `delta` to the sequence and returns the value stored
  /// before the addition, or `None` if the sequence does not exist.
  fn fetch_add(&self, name: &str, delta: i64) -> Result<Option<i64>, SequenceError>;

  /// Creates the sequence at `initial` unless it already exists. Returns
  /// true if it was created.
  fn create_if_absent(&self, name: &str, initial: i64) -> Result<bool, SequenceError>;

  /// Returns the stored value without changing it.
  fn current(&self, name: &str) -> Result<Option<i64>, SequenceError>;
}

fn add(name: &str, value: i64, delta: i64) -> Result<i64, SequenceError> {
  value
    .checked_add(delta)
    .ok_or_else(|| SequenceError::Overflow(name.to_string()))
}

/// Process-local sequence store.
#[derive(Debug, Default)]
pub struct InMemorySequenceStore {
  values: Mutex<HashMap<String, i64>>,
}

impl InMemorySequenceStore {
  /// Creates an empty store.
  pub fn new() -> Self {
    Self::default()
  }
}

impl SequenceStore for InMemorySequenceStore {
  fn fetch_add(&self, name: &str, delta: i64) -> Result<Option<i64>, SequenceError> {
    let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
    match values.get_mut(name) {
      Some(value) => {
        let current = *value;
        *value = add(name, current, delta)?;
        Ok(Some(current))
      }
      None => Ok(None),
    }
  }

  fn create_if_absent(&self, name: &str, initial: i64) -> Result<bool, SequenceError> {
    let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
    if values.contains_key(name) {
      return Ok(false);
    }
    values.insert(name.to_string(), initial);
    Ok(true)
  }

  fn current(&self, name: &str) -> Result<Option<i64>, SequenceError> {
    let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
    Ok(values.get(name).copied())
  }
}

/// Sequence store persisted as one JSON document.
///
/// Every update rewrites the document through a temporary file renamed over
/// the existing one, so a crash never leaves a half written file behind. Updates
/// are serialized by an in-process lock; the file must not be shared by
/// several processes.
#[derive(Debug)]
pub struct FileSequenceStore {
  path: PathBuf,
  lock: Mutex<()>,
}

impl FileSequenceStore {
  /// Opens (or lazily creates) the store at `path`.
  pub fn new<P: AsRef<Path>>(path: P) -> Self {
    Self {
      path: path.as_ref().to_path_buf(),
      lock: Mutex::new(()),
    }
  }

  /// Returns the backing file path.
  pub fn path(&self) -> &Path {
    &self.path
  }

  fn load(&self) -> Result<BTreeMap<String, i64>, SequenceError> {
    match std::fs::read_to_string(&self.path) {
      Ok(json) if json.trim().is_empty() => Ok(BTreeMap::new()),
      Ok(json) => serde_json::from_str(&json).map_err(|e| {
        SequenceError::StoreUnavailable(format!("{}: {e}", self.path.display()))
      }),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
      Err(e) => Err(unavailable(&self.path, e)),
    }
  }

  fn save(&self, values: &BTreeMap<String, i64>) -> Result<(), SequenceError> {
    let dir = match self.path.parent() {
      Some(dir) if !dir.as_os_str().is_empty() => dir,
      _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|e| unavailable(dir, e))?;
    let json = serde_json::to_string_pretty(values)
      .map_err(|e| SequenceError::StoreUnavailable(e.to_string()))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| unavailable(dir, e))?;
    tmp
      .write_all(json.as_bytes())
      .and_then(|()| tmp.as_file().sync_all())
      .map_err(|e| unavailable(tmp.path(), e))?;
    tmp
      .persist(&self.path)
      .map_err(|e| unavailable(&self.path, e.error))?;
    Ok(())
  }
}

fn unavailable(path: &Path, e: std::io::Error) -> SequenceError {
  SequenceError::StoreUnavailable(format!("{}: {e}", path.display()))
}

impl SequenceStore for FileSequenceStore {
  fn fetch_add(&self, name: &str, delta: i64) -> Result<Option<i64>, SequenceError> {
    let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
    let mut values = self.load()?;
    let Some(current) = values.get(name).copied() else {
      return Ok(None);
    };
    values.insert(name.to_string(), add(name, current, delta)?);
    self.save(&values)?;
    Ok(Some(current))
  }

  fn create_if_absent(&self, name: &str, initial: i64) -> Result<bool, SequenceError> {
    let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
    let mut values = self.load()?;
    if values.contains_key(name) {
      return Ok(false);
    }
    values.insert(name.to_string(), initial);
    self.save(&values)?;
    Ok(true)
  }

  fn current(&self, name: &str) -> Result<Option<i64>, SequenceError> {
    let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
    Ok(self.load()?.get(name).copied())
  }
}
