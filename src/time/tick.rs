//! Deterministic tick-driven time source.

use super::{ns_to_ticks, TimeSource, TimerEvent};
use core::cmp::Reverse;
use portable_atomic::{AtomicU64, Ordering};
use spin::Mutex;
use std::collections::BinaryHeap;

/// A queued event. Ties on the deadline fire in scheduling order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Scheduled {
    deadline: u64,
    sequence: u64,
    event: TimerEvent,
}

/// Tick counter plus event queue.
///
/// Time only moves when cores charge executed instructions through
/// [`TimeSource::add_ticks`] or when an idle core skips ahead with
/// [`TimeSource::idle`], so runs are reproducible.
pub struct CoreTiming {
    /// Ticks since start
    ticks: AtomicU64,
    /// Monotonic insertion counter for stable ordering
    sequence: AtomicU64,
    /// Pending events, earliest first
    events: Mutex<BinaryHeap<Reverse<Scheduled>>>,
}

impl CoreTiming {
    pub fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
            events: Mutex::new(BinaryHeap::new()),
        }
    }

    /// Number of queued events.
    pub fn pending_events(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether `event` is queued.
    pub fn is_scheduled(&self, event: TimerEvent) -> bool {
        self.events.lock().iter().any(|Reverse(s)| s.event == event)
    }

    fn next_deadline(&self) -> Option<u64> {
        self.events.lock().peek().map(|Reverse(s)| s.deadline)
    }
}

impl Default for CoreTiming {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for CoreTiming {
    fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    fn add_ticks(&self, ticks: u64) {
        self.ticks.fetch_add(ticks, Ordering::AcqRel);
    }

    fn downcount(&self) -> u64 {
        match self.next_deadline() {
            Some(deadline) => deadline.saturating_sub(self.ticks()),
            None => u64::MAX,
        }
    }

    fn idle(&self) -> bool {
        let Some(deadline) = self.next_deadline() else {
            return false;
        };
        self.ticks.fetch_max(deadline, Ordering::AcqRel);
        true
    }

    fn schedule_event(&self, delay_ns: u64, event: TimerEvent) {
        let deadline = self.ticks().saturating_add(ns_to_ticks(delay_ns));
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(?event, deadline, "timer event scheduled");
        self.events.lock().push(Reverse(Scheduled {
            deadline,
            sequence,
            event,
        }));
    }

    fn unschedule_event(&self, event: TimerEvent) {
        self.events.lock().retain(|Reverse(s)| s.event != event);
    }

    fn advance(&self) -> Vec<TimerEvent> {
        let now = self.ticks();
        let mut events = self.events.lock();
        let mut due = Vec::new();
        while let Some(Reverse(next)) = events.peek() {
            if next.deadline > now {
                break;
            }
            due.push(next.event);
            events.pop();
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ThreadId;

    fn wakeup(id: u64) -> TimerEvent {
        TimerEvent::ThreadWakeup(ThreadId::new(id).unwrap())
    }

    #[test]
    fn events_fire_in_deadline_order() {
        let timing = CoreTiming::new();
        timing.schedule_event(2_000, wakeup(2));
        timing.schedule_event(1_000, wakeup(1));
        timing.schedule_event(1_000, wakeup(3));

        assert!(timing.advance().is_empty());
        timing.add_ticks(ns_to_ticks(1_000));
        assert_eq!(timing.advance(), vec![wakeup(1), wakeup(3)]);
        timing.add_ticks(ns_to_ticks(1_000));
        assert_eq!(timing.advance(), vec![wakeup(2)]);
        assert_eq!(timing.pending_events(), 0);
    }

    #[test]
    fn downcount_tracks_nearest_event() {
        let timing = CoreTiming::new();
        assert_eq!(timing.downcount(), u64::MAX);
        timing.schedule_event(1_000_000, wakeup(1));
        let expected = ns_to_ticks(1_000_000);
        assert_eq!(timing.downcount(), expected);
        timing.add_ticks(10);
        assert_eq!(timing.downcount(), expected - 10);
    }

    #[test]
    fn idle_jumps_to_next_deadline() {
        let timing = CoreTiming::new();
        assert!(!timing.idle());
        assert_eq!(timing.ticks(), 0);

        timing.schedule_event(5_000, wakeup(7));
        assert!(timing.idle());
        assert_eq!(timing.ticks(), ns_to_ticks(5_000));
        assert_eq!(timing.advance(), vec![wakeup(7)]);
    }

    #[test]
    fn unschedule_removes_every_instance() {
        let timing = CoreTiming::new();
        timing.schedule_event(10, wakeup(1));
        timing.schedule_event(20, wakeup(1));
        timing.schedule_event(30, wakeup(2));
        timing.unschedule_event(wakeup(1));
        assert!(!timing.is_scheduled(wakeup(1)));
        assert!(timing.is_scheduled(wakeup(2)));
    }
}
