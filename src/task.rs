//! The per-task capability set driven by the run loop.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::callback::CallbackFactory;
use crate::coordinator::Coordinator;
use crate::envelope::Envelope;
use crate::metrics::TaskMetrics;
use crate::offsets::OffsetManager;
use crate::partition::{PartitionId, TaskName};

/// Failure signalled by a task. A single task failure is fatal to the
/// container run: the loop never retries a message, so offsets cannot
/// advance past the failed envelope.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct TaskError {
    pub message: String,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

/// A task hosted by the container.
///
/// `process` runs its synchronous portion on the loop task and signals
/// completion through a callback created from the factory, immediately or
/// later from any thread. The other operations are invoked on the loop
/// task only while the task is quiesced (see the run loop's commit and
/// window rules); an error return from any of them is fatal.
#[async_trait]
pub trait StreamTask: Send + Sync {
    fn task_name(&self) -> &TaskName;

    /// The partitions this task owns within the container, key buckets
    /// included when elasticity is enabled.
    fn partitions(&self) -> &HashSet<PartitionId>;

    fn is_windowable(&self) -> bool {
        false
    }

    fn offset_manager(&self) -> Arc<dyn OffsetManager>;

    fn metrics(&self) -> Arc<TaskMetrics>;

    async fn process(&self, envelope: Envelope, coordinator: Coordinator, callbacks: CallbackFactory);

    async fn window(&self, _coordinator: Coordinator) -> Result<(), TaskError> {
        Ok(())
    }

    /// Snapshots and durably records this task's processed offsets.
    async fn commit(&self) -> Result<(), TaskError>;

    /// Invoked once, after every partition the task owns has reached
    /// end-of-stream and all prior callbacks have completed.
    async fn end_of_stream(&self, _coordinator: Coordinator) -> Result<(), TaskError> {
        Ok(())
    }
}
