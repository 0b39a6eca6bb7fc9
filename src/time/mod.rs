//! Guest time keeping.
//!
//! The scheduler reaches time only through [`TimeSource`]: a monotonically
//! increasing tick counter plus a queue of timed [`TimerEvent`]s. Due events
//! are handed back as data by [`TimeSource::advance`] so they can be
//! dispatched under the kernel lock by whoever owns it.

pub mod tick;

pub use tick::CoreTiming;

use crate::thread::ThreadId;

/// Guest CPU clock rate in Hz.
pub const BASE_CLOCK_RATE: u64 = 1_019_215_872;

const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// Convert nanoseconds to clock ticks.
pub fn ns_to_ticks(ns: u64) -> u64 {
    (ns as u128 * BASE_CLOCK_RATE as u128 / NANOS_PER_SECOND) as u64
}

/// Convert clock ticks to nanoseconds.
pub fn ticks_to_ns(ticks: u64) -> u64 {
    (ticks as u128 * NANOS_PER_SECOND / BASE_CLOCK_RATE as u128) as u64
}

/// An event scheduled on a [`TimeSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerEvent {
    /// End a thread's timed wait or sleep
    ThreadWakeup(ThreadId),
}

/// Source of guest time and timed events.
///
/// Implementations must be usable from every core's host thread.
pub trait TimeSource: Send + Sync {
    /// Current tick count.
    fn ticks(&self) -> u64;

    /// Advance the tick counter.
    fn add_ticks(&self, ticks: u64);

    /// Ticks until the next scheduled event, `u64::MAX` when none is queued.
    fn downcount(&self) -> u64;

    /// Jump the counter forward to the next scheduled event.
    ///
    /// Returns `false` when no event is queued.
    fn idle(&self) -> bool;

    /// Schedule `event` to fire `delay_ns` nanoseconds from now.
    fn schedule_event(&self, delay_ns: u64, event: TimerEvent);

    /// Remove every pending instance of `event`.
    fn unschedule_event(&self, event: TimerEvent);

    /// Pop all events whose deadline has passed, in deadline order.
    fn advance(&self) -> Vec<TimerEvent>;
}
