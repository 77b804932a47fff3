//! Per-task envelope buffering and in-flight accounting.

use std::collections::VecDeque;

use crate::envelope::Envelope;

/// FIFO of envelopes awaiting dispatch for one task, plus the count of
/// dispatches whose callback has not yet completed. The in-flight count
/// never exceeds the configured maximum.
#[derive(Debug)]
pub struct PendingEnvelopeQueue {
    pending: VecDeque<Envelope>,
    in_flight: usize,
    max_in_flight: usize,
}

impl PendingEnvelopeQueue {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: 0,
            max_in_flight: max_in_flight.max(1),
        }
    }

    pub fn push(&mut self, envelope: Envelope) {
        self.pending.push_back(envelope);
    }

    pub fn peek(&self) -> Option<&Envelope> {
        self.pending.front()
    }

    pub fn pop(&mut self) -> Option<Envelope> {
        self.pending.pop_front()
    }

    /// Whether another dispatch may start without exceeding the bound.
    pub fn has_capacity(&self) -> bool {
        self.in_flight < self.max_in_flight
    }

    /// Accounts for a dispatch that just started.
    pub fn begin_dispatch(&mut self) {
        debug_assert!(self.in_flight < self.max_in_flight);
        self.in_flight += 1;
    }

    /// Accounts for one completed callback.
    pub fn complete_dispatch(&mut self) {
        debug_assert!(self.in_flight > 0);
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True when nothing is buffered and nothing is in flight.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{Partition, PartitionId};
    use bytes::Bytes;

    fn envelope(offset: &str) -> Envelope {
        let ssp = PartitionId::new("test-system", "test-stream", Partition(0));
        Envelope::new(ssp, offset, None, Bytes::new())
    }

    #[test]
    fn preserves_fifo_order() {
        let mut queue = PendingEnvelopeQueue::new(1);
        queue.push(envelope("0"));
        queue.push(envelope("1"));

        assert_eq!(queue.pop().unwrap().offset(), Some("0"));
        assert_eq!(queue.pop().unwrap().offset(), Some("1"));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn capacity_tracks_in_flight_dispatches() {
        let mut queue = PendingEnvelopeQueue::new(2);
        assert!(queue.has_capacity());

        queue.begin_dispatch();
        assert!(queue.has_capacity());
        queue.begin_dispatch();
        assert!(!queue.has_capacity());
        assert_eq!(queue.in_flight(), 2);

        queue.complete_dispatch();
        assert!(queue.has_capacity());
        assert_eq!(queue.in_flight(), 1);
    }

    #[test]
    fn max_in_flight_is_at_least_one() {
        let queue = PendingEnvelopeQueue::new(0);
        assert!(queue.has_capacity());
    }

    #[test]
    fn idle_requires_empty_queue_and_no_in_flight() {
        let mut queue = PendingEnvelopeQueue::new(1);
        assert!(queue.is_idle());

        queue.push(envelope("0"));
        assert!(!queue.is_idle());

        queue.pop();
        queue.begin_dispatch();
        assert!(!queue.is_idle());

        queue.complete_dispatch();
        assert!(queue.is_idle());
    }
}
