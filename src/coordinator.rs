//! Task-facing control token for commit and shutdown requests.
//!
//! A fresh coordinator is minted for every dispatch (`process`, `window`,
//! `end_of_stream`). The task records requests on it, from any thread; the
//! run loop drains the requests once the dispatch's callback has completed
//! (or, for callback-less operations, once the invocation returns). This
//! keeps the task surface free of reentrancy into the loop.

use std::sync::{Arc, Mutex};

/// How far a commit or shutdown request reaches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestScope {
    CurrentTask,
    AllTasksInContainer,
}

impl RequestScope {
    fn widest(a: RequestScope, b: RequestScope) -> RequestScope {
        if a == RequestScope::AllTasksInContainer || b == RequestScope::AllTasksInContainer {
            RequestScope::AllTasksInContainer
        } else {
            RequestScope::CurrentTask
        }
    }
}

/// Requests recorded on a coordinator during one dispatch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct TaskRequests {
    pub commit: Option<RequestScope>,
    pub shutdown: Option<RequestScope>,
}

impl TaskRequests {
    pub fn is_empty(&self) -> bool {
        self.commit.is_none() && self.shutdown.is_none()
    }
}

/// Control handle passed into a single dispatch.
///
/// Cheap to clone; a task may move it into whatever executor finishes the
/// work. Repeated calls within one dispatch are idempotent, keeping the
/// widest requested scope.
#[derive(Clone)]
pub struct Coordinator {
    requests: Arc<Mutex<TaskRequests>>,
}

impl Coordinator {
    pub(crate) fn new() -> Self {
        Self {
            requests: Arc::new(Mutex::new(TaskRequests::default())),
        }
    }

    /// Requests a commit at the given scope.
    pub fn commit(&self, scope: RequestScope) {
        let mut requests = self.requests.lock().expect("coordinator lock poisoned");
        requests.commit = Some(match requests.commit {
            Some(existing) => RequestScope::widest(existing, scope),
            None => scope,
        });
    }

    /// Requests a shutdown at the given scope.
    pub fn shutdown(&self, scope: RequestScope) {
        let mut requests = self.requests.lock().expect("coordinator lock poisoned");
        requests.shutdown = Some(match requests.shutdown {
            Some(existing) => RequestScope::widest(existing, scope),
            None => scope,
        });
    }

    /// Drains the recorded requests. Called by the run loop exactly when
    /// the owning dispatch has completed.
    pub(crate) fn take_requests(&self) -> TaskRequests {
        let mut requests = self.requests.lock().expect("coordinator lock poisoned");
        std::mem::take(&mut *requests)
    }
}
