//! In-process metric registries for the container and its tasks.
//!
//! Counters and gauges are plain atomics so tests and operators can read
//! them from any thread; the run loop additionally mirrors the headline
//! counters to the `metrics` facade for whatever exporter the host
//! process installed.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Container-wide counters maintained by the run loop.
#[derive(Debug, Default)]
pub struct ContainerMetrics {
    envelopes: AtomicU64,
    processes: AtomicU64,
    idle_ms: AtomicU64,
}

impl ContainerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total envelopes pulled from the multiplexer.
    pub fn envelopes(&self) -> u64 {
        self.envelopes.load(Ordering::Relaxed)
    }

    /// Total successful `process` completions.
    pub fn processes(&self) -> u64 {
        self.processes.load(Ordering::Relaxed)
    }

    /// Cumulative time the loop spent parked or blocked waiting for work.
    pub fn idle_ms(&self) -> u64 {
        self.idle_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn record_envelope(&self) {
        self.envelopes.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("millrace_envelopes_total").increment(1);
    }

    pub(crate) fn record_process(&self) {
        self.processes.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("millrace_process_completions_total").increment(1);
    }

    pub(crate) fn record_idle(&self, elapsed_ms: u64) {
        self.idle_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
    }
}

/// Per-task metrics, owned by the task handle and updated by the loop.
#[derive(Debug, Default)]
pub struct TaskMetrics {
    messages_in_flight: AtomicI64,
    async_callback_completed: AtomicU64,
    commits: AtomicU64,
    windows: AtomicU64,
}

impl TaskMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages dispatched to the task whose callback has not completed.
    pub fn messages_in_flight(&self) -> i64 {
        self.messages_in_flight.load(Ordering::SeqCst)
    }

    /// Callbacks the loop has applied, successful or not.
    pub fn async_callback_completed(&self) -> u64 {
        self.async_callback_completed.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    pub fn windows(&self) -> u64 {
        self.windows.load(Ordering::Relaxed)
    }

    pub(crate) fn incr_in_flight(&self) {
        self.messages_in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decr_in_flight(&self) {
        self.messages_in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn record_callback_completed(&self) {
        self.async_callback_completed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("millrace_commits_total").increment(1);
    }

    pub(crate) fn record_window(&self) {
        self.windows.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_gauge_tracks_increments_and_decrements() {
        let metrics = TaskMetrics::new();
        metrics.incr_in_flight();
        metrics.incr_in_flight();
        assert_eq!(metrics.messages_in_flight(), 2);
        metrics.decr_in_flight();
        assert_eq!(metrics.messages_in_flight(), 1);
    }

    #[test]
    fn container_counters_accumulate() {
        let metrics = ContainerMetrics::new();
        metrics.record_envelope();
        metrics.record_envelope();
        metrics.record_process();
        metrics.record_idle(5);
        assert_eq!(metrics.envelopes(), 2);
        assert_eq!(metrics.processes(), 1);
        assert_eq!(metrics.idle_ms(), 5);
    }
}
