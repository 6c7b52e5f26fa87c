//! Versioned state store boundary.
//!
//! The engine never touches persisted state except through these four
//! operations: snapshot, rollback, get, set. [`MemoryStore`] is the
//! reference implementation used by tests and single-process runs; a
//! production deployment substitutes its own backend behind the same
//! trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use thiserror::Error;
use uuid::Uuid;

/// Opaque handle to one stored snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotId(Uuid);

impl SnapshotId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SnapshotId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown snapshot: {0}")]
    UnknownSnapshot(SnapshotId),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Snapshot metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub id: SnapshotId,
    pub label: String,
    /// Seconds-since-epoch creation time.
    pub timestamp: String,
}

/// The four-operation persistence boundary.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Capture the current state under a label; returns the handle.
    async fn snapshot(&self, label: &str) -> Result<SnapshotId, StoreError>;

    /// Restore the state captured by the given snapshot.
    async fn rollback(&self, id: SnapshotId) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn set(&self, key: &str, value: Value, meta: Option<Value>) -> Result<(), StoreError>;
}

/// In-memory reference implementation.
pub struct MemoryStore {
    data: RwLock<HashMap<String, Value>>,
    snapshots: RwLock<Vec<(SnapshotInfo, HashMap<String, Value>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(Vec::new()),
        }
    }

    /// Metadata for every snapshot taken, in order.
    pub fn snapshot_history(&self) -> Vec<SnapshotInfo> {
        self.snapshots
            .read()
            .expect("snapshot lock poisoned")
            .iter()
            .map(|(info, _)| info.clone())
            .collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn snapshot(&self, label: &str) -> Result<SnapshotId, StoreError> {
        let data = self.data.read().expect("data lock poisoned").clone();
        let info = SnapshotInfo {
            id: SnapshotId::new(),
            label: label.to_string(),
            timestamp: crate::story::epoch_timestamp(),
        };
        let id = info.id;
        self.snapshots
            .write()
            .expect("snapshot lock poisoned")
            .push((info, data));
        Ok(id)
    }

    async fn rollback(&self, id: SnapshotId) -> Result<(), StoreError> {
        let snapshots = self.snapshots.read().expect("snapshot lock poisoned");
        let (_, data) = snapshots
            .iter()
            .find(|(info, _)| info.id == id)
            .ok_or(StoreError::UnknownSnapshot(id))?;
        let restored = data.clone();
        drop(snapshots);

        *self.data.write().expect("data lock poisoned") = restored;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.data.read().expect("data lock poisoned").get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value, _meta: Option<Value>) -> Result<(), StoreError> {
        self.data
            .write()
            .expect("data lock poisoned")
            .insert(key.to_string(), value);
        Ok(())
    }
}
