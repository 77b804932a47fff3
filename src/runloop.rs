//! The container's message run loop.
//!
//! One async task coordinates everything: it pulls envelopes from the
//! consumer multiplexer, routes them to the owning task worker (fanning
//! end-of-stream and watermark sentinels out to every key bucket of their
//! partition), dispatches with bounded in-flight concurrency, fires window
//! and commit timers, and exits when every worker has finished or the
//! first one fails.
//!
//! Task `process` handlers may finish their work on any thread; completion
//! comes back over an mpsc channel, which also wakes the loop out of its
//! idle parking.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::callback::{
    CallbackOutcome, CompletionReceiver, completion_channel,
};
use crate::consumer::{ConsumerMux, MuxError};
use crate::coordinator::{RequestScope, TaskRequests};
use crate::envelope::Envelope;
use crate::metrics::ContainerMetrics;
use crate::offsets::OffsetError;
use crate::partition::{PartitionId, TaskName};
use crate::task::{StreamTask, TaskError};
use crate::worker::TaskWorker;

/// Supplier of the current time in milliseconds. Injected so schedules
/// and timeouts are testable without waiting on a wall clock.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// The default clock: wall time as epoch milliseconds.
pub fn wall_clock() -> Clock {
    use std::time::{SystemTime, UNIX_EPOCH};
    Arc::new(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as i64)
            .unwrap_or(0)
    })
}

#[derive(Debug, thiserror::Error)]
pub enum RunLoopError {
    #[error("task {task} failed: {source}")]
    Task {
        task: TaskName,
        #[source]
        source: TaskError,
    },
    #[error("callback for task {task} timed out after {timeout_ms} ms")]
    CallbackTimeout { task: TaskName, timeout_ms: i64 },
    #[error(transparent)]
    Mux(#[from] MuxError),
    #[error("offset update for task {task} failed: {source}")]
    Offset {
        task: TaskName,
        #[source]
        source: OffsetError,
    },
}

#[derive(Clone, Debug)]
pub struct RunLoopConfig {
    /// Upper bound on concurrently dispatched messages per task. 1 gives
    /// strict FIFO processing per task.
    pub max_messages_in_flight: usize,
    /// Window period for windowable tasks; <= 0 disables windowing.
    pub window_ms: i64,
    /// Periodic commit period; <= 0 disables periodic commits.
    pub commit_ms: i64,
    /// Per-dispatch callback deadline; <= 0 disables the timeout.
    pub callback_timeout_ms: i64,
    /// Upper bound applied by external throttlers; caps idle parking
    /// when positive.
    pub max_throttling_delay_ms: i64,
    /// Maximum time to sit idle (blocked in `choose` or parked) when no
    /// task has ready work.
    pub max_idle_ms: i64,
    /// Allow a commit to overlap the same task's other in-flight
    /// messages.
    pub async_commit: bool,
    /// Key-bucket fan-out factor; 1 disables elasticity.
    pub elasticity_factor: u32,
}

impl Default for RunLoopConfig {
    fn default() -> Self {
        Self {
            max_messages_in_flight: 1,
            window_ms: -1,
            commit_ms: 60_000,
            callback_timeout_ms: -1,
            max_throttling_delay_ms: 0,
            max_idle_ms: 10,
            async_commit: false,
            elasticity_factor: 1,
        }
    }
}

/// Handle for requesting loop termination from outside. Workers drain
/// their in-flight messages before the loop exits.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

enum Wake {
    Outcome(CallbackOutcome),
    Pass,
}

pub struct RunLoop {
    workers: HashMap<TaskName, TaskWorker>,
    owners: HashMap<PartitionId, TaskName>,
    consumer: Arc<dyn ConsumerMux>,
    config: RunLoopConfig,
    metrics: Arc<ContainerMetrics>,
    clock: Clock,
    completion_rx: CompletionReceiver,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    stop_fetching: bool,
}

impl RunLoop {
    pub fn new(
        tasks: HashMap<TaskName, Arc<dyn StreamTask>>,
        consumer: Arc<dyn ConsumerMux>,
        config: RunLoopConfig,
        metrics: Arc<ContainerMetrics>,
        clock: Clock,
    ) -> Self {
        let (completion_tx, completion_rx) = completion_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let now = clock();

        let mut workers = HashMap::new();
        let mut owners: HashMap<PartitionId, TaskName> = HashMap::new();
        for (name, task) in tasks {
            for partition in task.partitions() {
                if let Some(existing) = owners.insert(partition.clone(), name.clone()) {
                    warn!(
                        partition = %partition,
                        first = %existing,
                        second = %name,
                        "partition assigned to more than one task; last assignment wins",
                    );
                }
            }
            let worker = TaskWorker::new(
                name.clone(),
                task,
                completion_tx.clone(),
                Arc::clone(&metrics),
                config.clone(),
                now,
            );
            workers.insert(name, worker);
        }

        Self {
            workers,
            owners,
            consumer,
            config,
            metrics,
            clock,
            completion_rx,
            shutdown_tx,
            shutdown_rx,
            stop_fetching: false,
        }
    }

    /// A handle that interrupts the loop from outside; safe to clone into
    /// signal handlers or supervisors.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Runs until every task has finished (consensus shutdown) or the
    /// first fatal error. The error of the first failed worker is
    /// returned verbatim.
    pub async fn run(&mut self) -> Result<(), RunLoopError> {
        info!(
            tasks = self.workers.len(),
            max_messages_in_flight = self.config.max_messages_in_flight,
            elasticity_factor = self.config.elasticity_factor,
            "starting run loop",
        );

        loop {
            let now = (self.clock)();
            let mut progressed = self.drain_completions();
            self.fail_fast()?;

            if !self.stop_fetching && *self.shutdown_rx.borrow() {
                info!("shutdown signal received; draining tasks");
                self.stop_fetching = true;
                for worker in self.workers.values_mut() {
                    worker.request_shutdown();
                }
            }

            for worker in self.workers.values_mut() {
                worker.check_timeout(now);
            }
            self.fail_fast()?;

            if !self.stop_fetching {
                progressed |= self.fetch(now).await?;
            }

            for worker in self.workers.values_mut() {
                progressed |= worker.drain_dispatchable(now).await;
            }

            let mut requests: Vec<(TaskName, TaskRequests)> = Vec::new();
            for (name, worker) in self.workers.iter_mut() {
                if let Some(window_requests) = worker.maybe_window(now).await {
                    progressed = true;
                    if !window_requests.is_empty() {
                        requests.push((name.clone(), window_requests));
                    }
                }
            }
            for (name, window_requests) in requests.drain(..) {
                self.apply_requests(&name, window_requests);
            }

            for worker in self.workers.values_mut() {
                progressed |= worker.maybe_commit(now).await;
            }

            for (name, worker) in self.workers.iter_mut() {
                let (advanced, eos_requests) = worker.advance(now).await;
                progressed |= advanced;
                if !eos_requests.is_empty() {
                    requests.push((name.clone(), eos_requests));
                }
            }
            for (name, eos_requests) in requests.drain(..) {
                self.apply_requests(&name, eos_requests);
            }
            self.fail_fast()?;

            if self.workers.values().all(TaskWorker::is_finished) {
                info!("all tasks finished; run loop exiting");
                return Ok(());
            }

            if !progressed {
                self.park(now).await;
            }
        }
    }

    /// Applies every callback outcome already queued. Returns whether any
    /// were applied.
    fn drain_completions(&mut self) -> bool {
        let mut progressed = false;
        while let Ok(outcome) = self.completion_rx.try_recv() {
            progressed = true;
            self.handle_outcome(outcome);
        }
        progressed
    }

    fn handle_outcome(&mut self, outcome: CallbackOutcome) {
        let CallbackOutcome { task, seq, result } = outcome;
        let Some(worker) = self.workers.get_mut(&task) else {
            warn!(task = %task, "callback for unknown task");
            return;
        };
        let requests = worker.apply_outcome(seq, result);
        if !requests.is_empty() {
            self.apply_requests(&task, requests);
        }
    }

    fn apply_requests(&mut self, origin: &TaskName, requests: TaskRequests) {
        if let Some(scope) = requests.commit {
            match scope {
                RequestScope::CurrentTask => {
                    if let Some(worker) = self.workers.get_mut(origin) {
                        worker.request_commit();
                    }
                }
                RequestScope::AllTasksInContainer => {
                    for worker in self.workers.values_mut() {
                        worker.request_commit();
                    }
                }
            }
        }
        if let Some(scope) = requests.shutdown {
            match scope {
                RequestScope::CurrentTask => {
                    if let Some(worker) = self.workers.get_mut(origin) {
                        worker.request_shutdown();
                    }
                }
                RequestScope::AllTasksInContainer => {
                    for worker in self.workers.values_mut() {
                        worker.request_shutdown();
                    }
                }
            }
        }
    }

    /// Surfaces the first recorded worker error. Callbacks already queued
    /// behind an abort are ignored but logged.
    fn fail_fast(&mut self) -> Result<(), RunLoopError> {
        let first_error = self
            .workers
            .values_mut()
            .find_map(TaskWorker::take_error);
        let Some(error) = first_error else {
            return Ok(());
        };
        error!(%error, "aborting run loop");
        while let Ok(outcome) = self.completion_rx.try_recv() {
            debug!(task = %outcome.task, seq = outcome.seq, "ignoring callback after abort");
        }
        Err(error)
    }

    /// One `choose` call against the multiplexer, blocking only when no
    /// task has buffered or in-flight work and no timer is near due.
    async fn fetch(&mut self, now: i64) -> Result<bool, RunLoopError> {
        let block = self.should_block(now);
        let consumer = Arc::clone(&self.consumer);
        let started = Instant::now();

        let chosen = tokio::select! {
            chosen = consumer.choose(block) => chosen?,
            _ = self.shutdown_rx.changed(), if block => None,
        };
        if block {
            self.metrics.record_idle(started.elapsed().as_millis() as u64);
        }

        match chosen {
            Some(envelope) => {
                self.metrics.record_envelope();
                self.route(envelope);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn should_block(&self, now: i64) -> bool {
        if !self.workers.values().all(TaskWorker::is_idle) {
            return false;
        }
        match self.next_timer_due(now) {
            Some(due) => due > now + self.config.max_idle_ms.max(0),
            None => true,
        }
    }

    fn next_timer_due(&self, now: i64) -> Option<i64> {
        self.workers
            .values()
            .filter_map(|worker| worker.next_timer_due(now))
            .min()
    }

    /// Delivers an envelope to its owning worker. End-of-stream and
    /// watermark sentinels go to every task owning a key bucket of the
    /// raw stream partition; ordinary envelopes route through the
    /// elasticity function to a single owner. Envelopes for partitions
    /// this container does not own are dropped.
    fn route(&mut self, envelope: Envelope) {
        if envelope.is_end_of_stream() || envelope.is_watermark() {
            let raw = envelope.partition().clone();
            let targets: HashSet<TaskName> = self
                .owners
                .iter()
                .filter(|(partition, _)| partition.same_stream_partition(&raw))
                .map(|(_, name)| name.clone())
                .collect();
            if targets.is_empty() {
                debug!(partition = %raw, "dropping sentinel for unassigned partition");
                return;
            }
            for name in targets {
                if let Some(worker) = self.workers.get_mut(&name) {
                    worker.accept(envelope.clone());
                }
            }
            return;
        }

        let effective = envelope.effective_partition(self.config.elasticity_factor);
        match self.owners.get(&effective) {
            Some(name) => {
                if let Some(worker) = self.workers.get_mut(name) {
                    worker.accept(envelope);
                }
            }
            None => {
                debug!(
                    partition = %effective,
                    offset = ?envelope.offset(),
                    "dropping envelope for unassigned partition",
                );
            }
        }
    }

    /// Parks until a callback completes, a timer comes due, or the idle
    /// bound elapses. Keeps the loop from spinning while work is in
    /// flight elsewhere.
    async fn park(&mut self, now: i64) {
        let mut wait_ms = self.config.max_idle_ms.max(1);
        if let Some(due) = self.next_timer_due(now) {
            wait_ms = wait_ms.min((due - now).max(1));
        }
        if self.config.max_throttling_delay_ms > 0 {
            wait_ms = wait_ms.min(self.config.max_throttling_delay_ms);
        }

        let started = Instant::now();
        let wake = tokio::select! {
            outcome = self.completion_rx.recv() => {
                outcome.map(Wake::Outcome).unwrap_or(Wake::Pass)
            }
            _ = tokio::time::sleep(Duration::from_millis(wait_ms as u64)) => Wake::Pass,
            _ = self.shutdown_rx.changed() => Wake::Pass,
        };
        self.metrics.record_idle(started.elapsed().as_millis() as u64);

        if let Wake::Outcome(outcome) = wake {
            self.handle_outcome(outcome);
        }
    }
}
