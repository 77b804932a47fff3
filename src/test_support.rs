//! Scripted collaborators for exercising the run loop.
//!
//! `TestTask` plays the part of a task handle with canned per-envelope
//! behavior, `ScriptedMux` replays a fixed `choose` sequence, and
//! `TestClock` drives schedules deterministically. Integration tests under
//! `tests/` build whole containers out of these.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;

use crate::callback::CallbackFactory;
use crate::consumer::{ConsumerMux, MuxError};
use crate::coordinator::Coordinator;
use crate::envelope::{Envelope, key_bucket_for};
use crate::metrics::TaskMetrics;
use crate::offsets::{OffsetError, OffsetManager};
use crate::partition::{PartitionId, TaskName};
use crate::runloop::Clock;
use crate::task::{StreamTask, TaskError};

/// Canned behavior for one dispatched envelope.
pub type ProcessHandler =
    Arc<dyn Fn(Envelope, Coordinator, CallbackFactory) -> BoxFuture<'static, ()> + Send + Sync>;

pub type WindowHandler = Arc<dyn Fn(Coordinator) + Send + Sync>;
pub type CommitHandler = Arc<dyn Fn() + Send + Sync>;
pub type EndOfStreamHandler = Arc<dyn Fn(Coordinator) + Send + Sync>;

/// Placeholder recorded for dispatched envelopes with no offset.
pub const WATERMARK_MARKER: &str = "<watermark>";

/// Controllable clock. Every read advances it by the configured tick, so
/// schedules make progress without real waiting.
#[derive(Clone)]
pub struct TestClock {
    now: Arc<AtomicI64>,
    tick: i64,
}

impl TestClock {
    pub fn ticking(tick: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(0)),
            tick,
        }
    }

    pub fn fixed(value: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(value)),
            tick: 0,
        }
    }

    pub fn clock(&self) -> Clock {
        let now = Arc::clone(&self.now);
        let tick = self.tick;
        Arc::new(move || now.fetch_add(tick, Ordering::SeqCst))
    }

    pub fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Offset manager that records every update for assertions.
#[derive(Default)]
pub struct RecordingOffsetManager {
    updates: Mutex<Vec<(TaskName, PartitionId, String)>>,
}

impl RecordingOffsetManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<(TaskName, PartitionId, String)> {
        self.updates.lock().expect("updates lock poisoned").clone()
    }

    /// Just the offsets, in update order.
    pub fn offsets(&self) -> Vec<String> {
        self.updates()
            .into_iter()
            .map(|(_, _, offset)| offset)
            .collect()
    }
}

impl OffsetManager for RecordingOffsetManager {
    fn update(
        &self,
        task: &TaskName,
        partition: &PartitionId,
        offset: &str,
    ) -> Result<(), OffsetError> {
        self.updates
            .lock()
            .expect("updates lock poisoned")
            .push((task.clone(), partition.clone(), offset.to_string()));
        Ok(())
    }
}

enum ScriptStep {
    Deliver(Envelope),
    Run(Box<dyn Fn() + Send + Sync>),
    Fail(String),
}

/// Multiplexer replaying a fixed script; once exhausted it reports no
/// messages forever (yielding briefly when asked to block).
#[derive(Default)]
pub struct ScriptedMux {
    steps: Mutex<VecDeque<ScriptStep>>,
}

impl ScriptedMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deliver(self, envelope: Envelope) -> Self {
        self.steps
            .lock()
            .expect("script lock poisoned")
            .push_back(ScriptStep::Deliver(envelope));
        self
    }

    /// Runs a side effect in place of a message; `choose` returns `None`
    /// for this step. Mirrors scripting a reaction to the nth fetch.
    pub fn trigger(self, effect: impl Fn() + Send + Sync + 'static) -> Self {
        self.steps
            .lock()
            .expect("script lock poisoned")
            .push_back(ScriptStep::Run(Box::new(effect)));
        self
    }

    pub fn fail(self, message: impl Into<String>) -> Self {
        self.steps
            .lock()
            .expect("script lock poisoned")
            .push_back(ScriptStep::Fail(message.into()));
        self
    }
}

#[async_trait]
impl ConsumerMux for ScriptedMux {
    async fn choose(&self, block: bool) -> Result<Option<Envelope>, MuxError> {
        let step = self.steps.lock().expect("script lock poisoned").pop_front();
        match step {
            Some(ScriptStep::Deliver(envelope)) => Ok(Some(envelope)),
            Some(ScriptStep::Run(effect)) => {
                effect();
                Ok(None)
            }
            Some(ScriptStep::Fail(message)) => Err(MuxError::new(message)),
            None => {
                if block {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                Ok(None)
            }
        }
    }
}

/// Task double with canned behavior per envelope offset.
///
/// Unscripted envelopes complete their callback immediately on the loop
/// task. Every invocation is recorded for assertions.
pub struct TestTask {
    name: TaskName,
    partitions: HashSet<PartitionId>,
    windowable: bool,
    offset_manager: Arc<dyn OffsetManager>,
    metrics: Arc<TaskMetrics>,
    handlers: Mutex<HashMap<String, ProcessHandler>>,
    window_handler: Mutex<Option<WindowHandler>>,
    commit_handler: Mutex<Option<CommitHandler>>,
    eos_handler: Mutex<Option<EndOfStreamHandler>>,
    processed: Mutex<Vec<String>>,
    commits: AtomicUsize,
    windows: AtomicUsize,
    end_of_streams: AtomicUsize,
}

impl TestTask {
    pub fn new(name: impl Into<TaskName>, partitions: impl IntoIterator<Item = PartitionId>) -> Self {
        Self {
            name: name.into(),
            partitions: partitions.into_iter().collect(),
            windowable: false,
            offset_manager: Arc::new(RecordingOffsetManager::new()),
            metrics: Arc::new(TaskMetrics::new()),
            handlers: Mutex::new(HashMap::new()),
            window_handler: Mutex::new(None),
            commit_handler: Mutex::new(None),
            eos_handler: Mutex::new(None),
            processed: Mutex::new(Vec::new()),
            commits: AtomicUsize::new(0),
            windows: AtomicUsize::new(0),
            end_of_streams: AtomicUsize::new(0),
        }
    }

    pub fn windowable(mut self) -> Self {
        self.windowable = true;
        self
    }

    pub fn with_offset_manager(mut self, offset_manager: Arc<dyn OffsetManager>) -> Self {
        self.offset_manager = offset_manager;
        self
    }

    /// Scripts the behavior for the envelope with the given offset.
    pub fn on_process(
        self,
        offset: &str,
        handler: impl Fn(Envelope, Coordinator, CallbackFactory) -> BoxFuture<'static, ()>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.handlers
            .lock()
            .expect("handlers lock poisoned")
            .insert(offset.to_string(), Arc::new(handler));
        self
    }

    pub fn on_window(self, handler: impl Fn(Coordinator) + Send + Sync + 'static) -> Self {
        *self.window_handler.lock().expect("window lock poisoned") = Some(Arc::new(handler));
        self
    }

    pub fn on_commit(self, handler: impl Fn() + Send + Sync + 'static) -> Self {
        *self.commit_handler.lock().expect("commit lock poisoned") = Some(Arc::new(handler));
        self
    }

    pub fn on_end_of_stream(self, handler: impl Fn(Coordinator) + Send + Sync + 'static) -> Self {
        *self.eos_handler.lock().expect("eos lock poisoned") = Some(Arc::new(handler));
        self
    }

    /// Offsets of dispatched envelopes in dispatch order.
    pub fn processed(&self) -> Vec<String> {
        self.processed.lock().expect("processed lock poisoned").clone()
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn window_count(&self) -> usize {
        self.windows.load(Ordering::SeqCst)
    }

    pub fn end_of_stream_count(&self) -> usize {
        self.end_of_streams.load(Ordering::SeqCst)
    }

    pub fn task_metrics(&self) -> Arc<TaskMetrics> {
        Arc::clone(&self.metrics)
    }
}

#[async_trait]
impl StreamTask for TestTask {
    fn task_name(&self) -> &TaskName {
        &self.name
    }

    fn partitions(&self) -> &HashSet<PartitionId> {
        &self.partitions
    }

    fn is_windowable(&self) -> bool {
        self.windowable
    }

    fn offset_manager(&self) -> Arc<dyn OffsetManager> {
        Arc::clone(&self.offset_manager)
    }

    fn metrics(&self) -> Arc<TaskMetrics> {
        Arc::clone(&self.metrics)
    }

    async fn process(&self, envelope: Envelope, coordinator: Coordinator, callbacks: CallbackFactory) {
        let key = envelope
            .offset()
            .unwrap_or(WATERMARK_MARKER)
            .to_string();
        self.processed
            .lock()
            .expect("processed lock poisoned")
            .push(key.clone());

        let handler = self
            .handlers
            .lock()
            .expect("handlers lock poisoned")
            .get(&key)
            .cloned();
        match handler {
            Some(handler) => handler(envelope, coordinator, callbacks).await,
            None => callbacks.create().complete(),
        }
    }

    async fn window(&self, coordinator: Coordinator) -> Result<(), TaskError> {
        self.windows.fetch_add(1, Ordering::SeqCst);
        let handler = self.window_handler.lock().expect("window lock poisoned").clone();
        if let Some(handler) = handler {
            handler(coordinator);
        }
        Ok(())
    }

    async fn commit(&self) -> Result<(), TaskError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        let handler = self.commit_handler.lock().expect("commit lock poisoned").clone();
        if let Some(handler) = handler {
            handler();
        }
        Ok(())
    }

    async fn end_of_stream(&self, coordinator: Coordinator) -> Result<(), TaskError> {
        self.end_of_streams.fetch_add(1, Ordering::SeqCst);
        let handler = self.eos_handler.lock().expect("eos lock poisoned").clone();
        if let Some(handler) = handler {
            handler(coordinator);
        }
        Ok(())
    }
}

/// Polls a condition until it holds, panicking after five seconds.
pub async fn wait_until(description: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {description}",
        );
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Finds a key that the elasticity fold routes to the given bucket.
pub fn key_for_bucket(bucket: u32, elasticity_factor: u32) -> Bytes {
    for candidate in 0..10_000u32 {
        let key = format!("key-{candidate}");
        if key_bucket_for(key.as_bytes(), elasticity_factor) == bucket {
            return Bytes::from(key);
        }
    }
    panic!("no key maps to bucket {bucket} of {elasticity_factor}");
}
