//! Offset bookkeeping shared by the container's tasks.
//!
//! The run loop records the offset of every successfully processed
//! envelope here; checkpointing those offsets durably is the commit
//! implementation's concern, behind this trait.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::partition::{PartitionId, TaskName};

/// Failure recording an offset. Fatal to the run loop: advancing past a
/// message whose offset could not be recorded would break at-least-once
/// delivery.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct OffsetError {
    pub message: String,
}

impl OffsetError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Records the latest processed offset per (task, partition).
///
/// Implementations must be thread-safe; completions can be applied while
/// a commit snapshot is being taken.
pub trait OffsetManager: Send + Sync {
    fn update(
        &self,
        task: &TaskName,
        partition: &PartitionId,
        offset: &str,
    ) -> Result<(), OffsetError>;
}

/// In-memory offset manager with one lock shard per task, so concurrent
/// tasks never contend and writes stay serialized per (task, partition).
#[derive(Default)]
pub struct InMemoryOffsetManager {
    tasks: RwLock<HashMap<TaskName, Arc<Mutex<HashMap<PartitionId, String>>>>>,
}

impl InMemoryOffsetManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently recorded offset, if any.
    pub fn last_offset(&self, task: &TaskName, partition: &PartitionId) -> Option<String> {
        let tasks = self.tasks.read().expect("offset shard map poisoned");
        let shard = tasks.get(task)?;
        let offsets = shard.lock().expect("offset shard poisoned");
        offsets.get(partition).cloned()
    }

    fn shard(&self, task: &TaskName) -> Arc<Mutex<HashMap<PartitionId, String>>> {
        if let Some(shard) = self
            .tasks
            .read()
            .expect("offset shard map poisoned")
            .get(task)
        {
            return Arc::clone(shard);
        }
        let mut tasks = self.tasks.write().expect("offset shard map poisoned");
        Arc::clone(tasks.entry(task.clone()).or_default())
    }
}

impl OffsetManager for InMemoryOffsetManager {
    fn update(
        &self,
        task: &TaskName,
        partition: &PartitionId,
        offset: &str,
    ) -> Result<(), OffsetError> {
        let shard = self.shard(task);
        let mut offsets = shard.lock().expect("offset shard poisoned");
        offsets.insert(partition.clone(), offset.to_string());
        Ok(())
    }
}
