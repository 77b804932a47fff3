//! Per-task state machine driven by the run loop.
//!
//! A worker buffers envelopes for one task, dispatches them subject to the
//! in-flight bound, applies callback completions, and walks the task
//! through `Running → Draining → Finished`. A callback failure, timeout,
//! or error return from any task operation moves it to the terminal
//! `Failed` state, which the run loop surfaces on its next turn.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::callback::{CallbackFactory, CallbackResult, CompletionSender};
use crate::coordinator::{Coordinator, TaskRequests};
use crate::envelope::Envelope;
use crate::metrics::{ContainerMetrics, TaskMetrics};
use crate::partition::{PartitionId, TaskName};
use crate::pending::PendingEnvelopeQueue;
use crate::runloop::{RunLoopConfig, RunLoopError};
use crate::task::StreamTask;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WorkerState {
    /// Accepting and dispatching envelopes.
    Running,
    /// Every owned partition has ended; waiting for in-flight callbacks.
    Draining,
    /// Idle; counts toward shutdown consensus.
    Finished,
    /// Terminal error recorded; the run loop aborts on its next turn.
    Failed,
}

struct InFlightDispatch {
    partition: PartitionId,
    offset: Option<String>,
    coordinator: Coordinator,
    deadline: Option<i64>,
}

pub(crate) struct TaskWorker {
    name: TaskName,
    task: Arc<dyn StreamTask>,
    partitions: HashSet<PartitionId>,
    metrics: Arc<TaskMetrics>,
    container_metrics: Arc<ContainerMetrics>,
    completion_tx: CompletionSender,
    config: RunLoopConfig,
    queue: PendingEnvelopeQueue,
    state: WorkerState,
    eos_seen: HashSet<PartitionId>,
    eos_delivered: bool,
    shutdown_requested: bool,
    commit_requested: bool,
    last_window_at: i64,
    last_commit_at: i64,
    next_seq: u64,
    in_flight: HashMap<u64, InFlightDispatch>,
    error: Option<RunLoopError>,
}

impl TaskWorker {
    pub fn new(
        name: TaskName,
        task: Arc<dyn StreamTask>,
        completion_tx: CompletionSender,
        container_metrics: Arc<ContainerMetrics>,
        config: RunLoopConfig,
        now: i64,
    ) -> Self {
        let partitions = task.partitions().clone();
        let metrics = task.metrics();
        let queue = PendingEnvelopeQueue::new(config.max_messages_in_flight);
        Self {
            name,
            task,
            partitions,
            metrics,
            container_metrics,
            completion_tx,
            config,
            queue,
            state: WorkerState::Running,
            eos_seen: HashSet::new(),
            eos_delivered: false,
            shutdown_requested: false,
            commit_requested: false,
            last_window_at: now,
            last_commit_at: now,
            next_seq: 0,
            in_flight: HashMap::new(),
            error: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state == WorkerState::Finished
    }

    pub fn take_error(&mut self) -> Option<RunLoopError> {
        self.error.take()
    }

    /// Nothing buffered and nothing in flight.
    pub fn is_idle(&self) -> bool {
        self.queue.is_idle()
    }

    pub fn request_commit(&mut self) {
        self.commit_requested = true;
    }

    pub fn request_shutdown(&mut self) {
        self.shutdown_requested = true;
    }

    /// Buffers an envelope routed to this worker. Draining workers accept
    /// only end-of-stream sentinels (fan-out copies arrive once); finished
    /// or failed workers drop everything.
    pub fn accept(&mut self, envelope: Envelope) {
        match self.state {
            WorkerState::Running => self.queue.push(envelope),
            WorkerState::Draining if envelope.is_end_of_stream() => self.queue.push(envelope),
            _ => {
                debug!(
                    task = %self.name,
                    state = ?self.state,
                    offset = ?envelope.offset(),
                    "dropping envelope routed to inactive worker",
                );
            }
        }
    }

    /// Dispatches buffered envelopes while the in-flight bound allows.
    /// End-of-stream sentinels at the head are consumed to mark their
    /// partitions as ended, which keeps them ordered after every earlier
    /// envelope of the partition. Returns whether any progress was made.
    pub async fn drain_dispatchable(&mut self, now: i64) -> bool {
        let mut progressed = false;
        while self.state == WorkerState::Running {
            let Some(head) = self.queue.peek() else { break };
            if head.is_end_of_stream() {
                let envelope = self.queue.pop().expect("peeked envelope vanished");
                self.mark_end_of_stream(envelope.partition());
                progressed = true;
                continue;
            }
            // A pending synchronous commit quiesces the task before the
            // next dispatch.
            if self.commit_requested && !self.config.async_commit {
                break;
            }
            if !self.queue.has_capacity() {
                break;
            }
            let envelope = self.queue.pop().expect("peeked envelope vanished");
            self.dispatch(envelope, now).await;
            progressed = true;
        }
        progressed
    }

    fn mark_end_of_stream(&mut self, ended: &PartitionId) {
        let matching: Vec<PartitionId> = self
            .partitions
            .iter()
            .filter(|owned| owned.same_stream_partition(ended))
            .cloned()
            .collect();
        for partition in matching {
            debug!(task = %self.name, partition = %partition, "end of stream observed");
            self.eos_seen.insert(partition);
        }
    }

    async fn dispatch(&mut self, envelope: Envelope, now: i64) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let coordinator = Coordinator::new();
        let callbacks = CallbackFactory::new(self.name.clone(), seq, self.completion_tx.clone());
        let partition = envelope.effective_partition(self.config.elasticity_factor);
        let offset = envelope.offset().map(str::to_string);
        let deadline =
            (self.config.callback_timeout_ms > 0).then(|| now + self.config.callback_timeout_ms);

        self.queue.begin_dispatch();
        self.metrics.incr_in_flight();
        self.in_flight.insert(
            seq,
            InFlightDispatch {
                partition,
                offset,
                coordinator: coordinator.clone(),
                deadline,
            },
        );

        let task = Arc::clone(&self.task);
        task.process(envelope, coordinator, callbacks).await;
    }

    /// Applies one callback outcome and returns the coordinator requests
    /// recorded during that dispatch. Late or duplicate callbacks are
    /// logged and ignored.
    pub fn apply_outcome(&mut self, seq: u64, result: CallbackResult) -> TaskRequests {
        let Some(dispatch) = self.in_flight.remove(&seq) else {
            warn!(task = %self.name, seq, "ignoring late or duplicate callback");
            return TaskRequests::default();
        };

        self.queue.complete_dispatch();
        self.metrics.decr_in_flight();
        self.metrics.record_callback_completed();

        match result {
            CallbackResult::Complete => {
                if let Some(offset) = &dispatch.offset {
                    let update =
                        self.task
                            .offset_manager()
                            .update(&self.name, &dispatch.partition, offset);
                    if let Err(source) = update {
                        self.fail(RunLoopError::Offset {
                            task: self.name.clone(),
                            source,
                        });
                        return TaskRequests::default();
                    }
                }
                self.container_metrics.record_process();
            }
            CallbackResult::Failure(source) => {
                self.fail(RunLoopError::Task {
                    task: self.name.clone(),
                    source,
                });
                return TaskRequests::default();
            }
        }

        dispatch.coordinator.take_requests()
    }

    /// Fails the worker if any in-flight callback has outlived its
    /// deadline.
    pub fn check_timeout(&mut self, now: i64) {
        if self.state == WorkerState::Failed || self.config.callback_timeout_ms <= 0 {
            return;
        }
        let overdue = self
            .in_flight
            .iter()
            .find(|(_, dispatch)| dispatch.deadline.is_some_and(|deadline| now >= deadline))
            .map(|(seq, _)| *seq);
        if let Some(seq) = overdue {
            self.in_flight.remove(&seq);
            self.queue.complete_dispatch();
            self.metrics.decr_in_flight();
            self.fail(RunLoopError::CallbackTimeout {
                task: self.name.clone(),
                timeout_ms: self.config.callback_timeout_ms,
            });
        }
    }

    /// Fires the window callback when due. Windows run only on quiesced,
    /// running workers with no shutdown pending.
    pub async fn maybe_window(&mut self, now: i64) -> Option<TaskRequests> {
        if self.state != WorkerState::Running
            || self.shutdown_requested
            || self.config.window_ms <= 0
            || !self.task.is_windowable()
            || self.queue.in_flight() > 0
            || now - self.last_window_at < self.config.window_ms
        {
            return None;
        }

        let coordinator = Coordinator::new();
        let task = Arc::clone(&self.task);
        match task.window(coordinator.clone()).await {
            Ok(()) => {
                self.last_window_at = now;
                self.metrics.record_window();
                Some(coordinator.take_requests())
            }
            Err(source) => {
                self.fail(RunLoopError::Task {
                    task: self.name.clone(),
                    source,
                });
                None
            }
        }
    }

    /// Schedules the periodic commit and executes any requested commit
    /// once allowed: immediately in async-commit mode, otherwise only
    /// when the task has nothing in flight. Returns whether a commit ran.
    pub async fn maybe_commit(&mut self, now: i64) -> bool {
        if matches!(self.state, WorkerState::Finished | WorkerState::Failed) {
            return false;
        }
        if self.config.commit_ms > 0 && now - self.last_commit_at >= self.config.commit_ms {
            self.commit_requested = true;
        }
        if !self.commit_requested {
            return false;
        }
        if !self.config.async_commit && self.queue.in_flight() > 0 {
            return false;
        }
        self.run_commit(now).await
    }

    async fn run_commit(&mut self, now: i64) -> bool {
        debug!(task = %self.name, "committing");
        let task = Arc::clone(&self.task);
        match task.commit().await {
            Ok(()) => {
                self.commit_requested = false;
                self.last_commit_at = now;
                self.metrics.record_commit();
                true
            }
            Err(source) => {
                self.fail(RunLoopError::Task {
                    task: self.name.clone(),
                    source,
                });
                false
            }
        }
    }

    /// Walks the state machine forward: into `Draining` once every owned
    /// partition has ended and the buffer is empty, through `end_of_stream`
    /// once in-flight work is gone, and into `Finished`. Returns whether
    /// anything changed plus any coordinator requests from
    /// `end_of_stream`.
    pub async fn advance(&mut self, now: i64) -> (bool, TaskRequests) {
        let mut progressed = false;

        if self.state == WorkerState::Running {
            let all_ended =
                !self.partitions.is_empty() && self.partitions.is_subset(&self.eos_seen);
            if all_ended && self.queue.is_empty() {
                debug!(task = %self.name, "all partitions at end of stream; draining");
                self.state = WorkerState::Draining;
                progressed = true;
            } else if self.shutdown_requested && self.queue.is_idle() {
                debug!(task = %self.name, "shutdown request honored");
                self.state = WorkerState::Finished;
                return (true, TaskRequests::default());
            }
        }

        if self.state == WorkerState::Draining
            && self.queue.in_flight() == 0
            && !self.eos_delivered
        {
            let coordinator = Coordinator::new();
            let task = Arc::clone(&self.task);
            if let Err(source) = task.end_of_stream(coordinator.clone()).await {
                self.fail(RunLoopError::Task {
                    task: self.name.clone(),
                    source,
                });
                return (true, TaskRequests::default());
            }
            self.eos_delivered = true;
            let requests = coordinator.take_requests();
            // A commit requested while handling end-of-stream runs before
            // the transition; container-wide scopes still go back to the
            // loop for the other workers.
            if requests.commit.is_some() && !self.run_commit(now).await {
                return (true, TaskRequests::default());
            }
            debug!(task = %self.name, "finished");
            self.state = WorkerState::Finished;
            return (true, requests);
        }

        (progressed, TaskRequests::default())
    }

    /// The earliest future instant at which this worker has timer work:
    /// a due window, a due periodic commit, or an in-flight deadline.
    pub fn next_timer_due(&self, _now: i64) -> Option<i64> {
        let mut due: Option<i64> = None;
        let mut consider = |candidate: i64| {
            due = Some(due.map_or(candidate, |current| current.min(candidate)));
        };

        if self.state == WorkerState::Running
            && self.config.window_ms > 0
            && self.task.is_windowable()
        {
            consider(self.last_window_at + self.config.window_ms);
        }
        if !matches!(self.state, WorkerState::Finished | WorkerState::Failed)
            && self.config.commit_ms > 0
        {
            consider(self.last_commit_at + self.config.commit_ms);
        }
        for dispatch in self.in_flight.values() {
            if let Some(deadline) = dispatch.deadline {
                consider(deadline);
            }
        }
        due
    }

    fn fail(&mut self, error: RunLoopError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
        self.state = WorkerState::Failed;
    }
}
