//! Completion signalling between task executors and the run loop.
//!
//! Every dispatch hands the task a factory that materializes exactly one
//! callback. Completing or failing the callback posts an outcome onto the
//! loop's completion channel; the callback is single-use by move, and the
//! loop deduplicates on the dispatch sequence in case a task misuses the
//! factory.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tracing::warn;

use crate::partition::TaskName;
use crate::task::TaskError;

/// Result of one dispatch, as reported by the task.
#[derive(Debug)]
pub(crate) enum CallbackResult {
    Complete,
    Failure(TaskError),
}

/// Message posted to the run loop when a dispatch finishes.
#[derive(Debug)]
pub(crate) struct CallbackOutcome {
    pub task: TaskName,
    pub seq: u64,
    pub result: CallbackResult,
}

pub(crate) type CompletionSender = mpsc::UnboundedSender<CallbackOutcome>;
pub(crate) type CompletionReceiver = mpsc::UnboundedReceiver<CallbackOutcome>;

pub(crate) fn completion_channel() -> (CompletionSender, CompletionReceiver) {
    mpsc::unbounded_channel()
}

/// Single-use completion handle for one dispatched envelope.
///
/// `Send + 'static`: the task may complete it from whatever thread its
/// work finishes on. If the run loop has already aborted, the outcome is
/// silently dropped.
pub struct ProcessCallback {
    task: TaskName,
    seq: u64,
    tx: CompletionSender,
}

impl ProcessCallback {
    pub fn complete(self) {
        self.send(CallbackResult::Complete);
    }

    pub fn failure(self, error: TaskError) {
        self.send(CallbackResult::Failure(error));
    }

    fn send(self, result: CallbackResult) {
        let outcome = CallbackOutcome {
            task: self.task,
            seq: self.seq,
            result,
        };
        let _ = self.tx.send(outcome);
    }
}

/// Creates the callback for one dispatch.
///
/// A well-behaved task calls `create` exactly once. A second call is
/// logged and handed a callback for the same dispatch; whichever outcome
/// arrives first wins and the loop discards the rest.
pub struct CallbackFactory {
    task: TaskName,
    seq: u64,
    tx: CompletionSender,
    created: AtomicBool,
}

impl CallbackFactory {
    pub(crate) fn new(task: TaskName, seq: u64, tx: CompletionSender) -> Self {
        Self {
            task,
            seq,
            tx,
            created: AtomicBool::new(false),
        }
    }

    pub fn create(&self) -> ProcessCallback {
        if self.created.swap(true, Ordering::SeqCst) {
            warn!(task = %self.task, seq = self.seq, "callback created twice for one dispatch");
        }
        ProcessCallback {
            task: self.task.clone(),
            seq: self.seq,
            tx: self.tx.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_posts_an_outcome() {
        let (tx, mut rx) = completion_channel();
        let factory = CallbackFactory::new(TaskName::from("task-0"), 7, tx);

        factory.create().complete();

        let outcome = rx.try_recv().unwrap();
        assert_eq!(outcome.task, TaskName::from("task-0"));
        assert_eq!(outcome.seq, 7);
        assert!(matches!(outcome.result, CallbackResult::Complete));
    }

    #[test]
    fn failure_carries_the_task_error() {
        let (tx, mut rx) = completion_channel();
        let factory = CallbackFactory::new(TaskName::from("task-0"), 1, tx);

        factory.create().failure(TaskError::new("intentional failure"));

        let outcome = rx.try_recv().unwrap();
        match outcome.result {
            CallbackResult::Failure(error) => assert_eq!(error.message, "intentional failure"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn dropped_receiver_is_tolerated() {
        let (tx, rx) = completion_channel();
        drop(rx);
        let factory = CallbackFactory::new(TaskName::from("task-0"), 1, tx);
        factory.create().complete();
    }
}
