//! Millrace - the per-container message run loop of a stream-processing
//! worker.
//!
//! A container hosts a fixed set of tasks, each bound to one or more
//! stream partitions. This crate provides the coordinator that drives
//! them:
//!
//! ## Run loop
//!
//! - [`RunLoop`]: single fetch loop - pulls envelopes from the consumer
//!   multiplexer, routes them to the owning task, fires window and commit
//!   timers, and exits on shutdown consensus or the first fatal error
//! - [`RunLoopConfig`]: in-flight bound, timer periods, idle bound,
//!   async-commit mode, elasticity factor
//!
//! ## Task surface
//!
//! - [`StreamTask`]: the capability set the loop drives (process, window,
//!   commit, end-of-stream, plus introspection)
//! - [`Coordinator`]: per-dispatch token for commit/shutdown requests
//! - [`CallbackFactory`] / [`ProcessCallback`]: completion signalling,
//!   usable from any thread
//!
//! ## Data model
//!
//! - [`Envelope`]: message plus partition, offset, key, and timestamps,
//!   with end-of-stream and watermark sentinels and the elasticity
//!   routing function

pub mod callback;
pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod envelope;
pub mod metrics;
pub mod observability;
pub mod offsets;
pub mod partition;
pub mod pending;
pub mod runloop;
pub mod task;
pub mod test_support;
mod worker;

// Configuration
pub use config::ContainerConfig;

// Run loop
pub use runloop::{
    Clock, RunLoop, RunLoopConfig, RunLoopError, ShutdownHandle, wall_clock,
};

// Task surface
pub use callback::{CallbackFactory, ProcessCallback};
pub use coordinator::{Coordinator, RequestScope};
pub use task::{StreamTask, TaskError};

// Collaborator interfaces
pub use consumer::{ConsumerMux, MuxError};
pub use offsets::{InMemoryOffsetManager, OffsetError, OffsetManager};

// Data model
pub use envelope::{
    END_OF_STREAM_OFFSET, EndOfStreamMessage, Envelope, Payload, WatermarkMessage, key_bucket_for,
};
pub use partition::{Partition, PartitionId, TaskName};

// Metrics
pub use metrics::{ContainerMetrics, TaskMetrics};
