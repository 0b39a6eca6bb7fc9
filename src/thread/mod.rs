//! Guest thread records.
//!
//! A [`Thread`] is plain data owned by the kernel's thread arena. Other
//! structures (ready queues, wait lists, handle tables, mutex owner chains)
//! refer to threads by [`ThreadId`] and look them up under the kernel lock.

pub mod builder;

pub use builder::ThreadParams;

use crate::arch::ThreadContext;
use crate::kernel::{ProcessId, SyncObject};
use core::fmt;
use core::num::NonZeroU64;

/// Highest thread priority.
pub const PRIORITY_HIGHEST: u32 = 0;
/// Lowest thread priority.
pub const PRIORITY_LOWEST: u32 = 63;
/// Number of distinct priority levels.
pub const PRIORITY_LEVELS: usize = 64;

/// Processor id that resolves to the owning process's ideal core.
pub const PROCESSOR_ID_IDEAL: i32 = -2;
/// Ideal-core argument that leaves the ideal core unchanged.
pub const PROCESSOR_ID_DONT_UPDATE: i32 = -3;

/// Unique thread identifier. Never zero and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(NonZeroU64);

impl ThreadId {
    pub fn new(id: u64) -> Option<Self> {
        NonZeroU64::new(id).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling status of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadStatus {
    /// Created but never started
    Dormant,
    /// Queued for a core
    Ready,
    /// Current on a core
    Running,
    /// Waiting for any of several objects
    WaitSynchAny,
    /// Waiting for all of several objects
    WaitSynchAll,
    /// Waiting on a host-side event
    WaitHleEvent,
    /// Sleeping on a timer
    WaitSleep,
    /// Waiting for a request reply
    WaitIpc,
    /// Waiting for a mutex owner to release
    WaitMutex,
    /// Waiting on an address arbiter
    WaitArb,
    /// Suspended by SetThreadActivity
    Paused,
    /// Terminated
    Dead,
}

impl ThreadStatus {
    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            ThreadStatus::WaitSynchAny
                | ThreadStatus::WaitSynchAll
                | ThreadStatus::WaitHleEvent
                | ThreadStatus::WaitSleep
                | ThreadStatus::WaitIpc
                | ThreadStatus::WaitMutex
                | ThreadStatus::WaitArb
        )
    }

    /// Waiting on synchronization objects.
    pub fn is_sync_wait(self) -> bool {
        matches!(
            self,
            ThreadStatus::WaitSynchAny | ThreadStatus::WaitSynchAll | ThreadStatus::WaitHleEvent
        )
    }
}

/// Guest-requested activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadActivity {
    #[default]
    Runnable,
    Paused,
}

impl ThreadActivity {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(ThreadActivity::Runnable),
            1 => Some(ThreadActivity::Paused),
            _ => None,
        }
    }
}

/// Why a waiting thread is being woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeupReason {
    Signal,
    Timeout,
}

/// Action run when a synchronization wait ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeupCallback {
    /// Report the outcome of WaitSynchronization in x0/x1.
    SynchronizationWait,
}

/// A guest thread.
#[derive(Debug, Clone)]
pub struct Thread {
    pub id: ThreadId,
    pub name: String,
    pub status: ThreadStatus,
    pub nominal_priority: u32,
    /// Effective priority after inheritance and boosts.
    pub current_priority: u32,
    pub affinity_mask: u64,
    pub ideal_core: i32,
    /// Core whose scheduler owns the thread.
    pub processor_id: i32,
    pub owner: ProcessId,
    pub wait_objects: Vec<SyncObject>,
    pub lock_owner: Option<ThreadId>,
    /// Threads blocked on mutexes this thread holds, best priority first.
    pub wait_mutex_threads: Vec<ThreadId>,
    pub mutex_wait_address: u64,
    pub wakeup_callback: Option<WakeupCallback>,
    pub context: ThreadContext,
    pub activity: ThreadActivity,
    /// Open guest handles naming this thread.
    pub handle_count: u32,
    pub total_ticks: u64,
    pub last_scheduled_tick: u64,
    pub entry_point: u64,
    pub stack_top: u64,
    /// Result written to x0 when the thread is next switched in.
    pub wait_result: Option<u32>,
    /// Signaled object index written to x1 alongside `wait_result`.
    pub wait_index: Option<u32>,
}

impl Thread {
    pub(crate) fn new(
        id: ThreadId,
        params: &ThreadParams,
        core: i32,
        tls_address: u64,
        now: u64,
    ) -> Self {
        Self {
            id,
            name: params.name.clone(),
            status: ThreadStatus::Dormant,
            nominal_priority: params.priority,
            current_priority: params.priority,
            affinity_mask: 1 << core,
            ideal_core: core,
            processor_id: core,
            owner: params.owner,
            wait_objects: Vec::new(),
            lock_owner: None,
            wait_mutex_threads: Vec::new(),
            mutex_wait_address: 0,
            wakeup_callback: None,
            context: ThreadContext::for_entry(params.entry, params.stack_top, params.arg, tls_address),
            activity: ThreadActivity::Runnable,
            handle_count: 0,
            total_ticks: 0,
            last_scheduled_tick: now,
            entry_point: params.entry,
            stack_top: params.stack_top,
            wait_result: None,
            wait_index: None,
        }
    }

    pub fn tls_address(&self) -> u64 {
        self.context.tls_address
    }

    pub fn is_dead(&self) -> bool {
        self.status == ThreadStatus::Dead
    }

    /// Core as an index, if the thread is bound to one.
    pub fn core(&self) -> Option<usize> {
        usize::try_from(self.processor_id).ok()
    }

    pub fn allows_core(&self, core: usize) -> bool {
        core < 64 && self.affinity_mask & (1 << core) != 0
    }

    /// Store a synchronization outcome for the next switch-in.
    pub fn set_wait_result(&mut self, result: u32, index: Option<u32>) {
        self.wait_result = Some(result);
        self.wait_index = index;
    }

    /// Move a pending synchronization outcome into the saved registers.
    pub(crate) fn apply_wait_result(&mut self) {
        if let Some(result) = self.wait_result.take() {
            self.context.x[0] = u64::from(result);
        }
        if let Some(index) = self.wait_index.take() {
            self.context.x[1] = u64::from(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread() -> Thread {
        let params = ThreadParams::new(ProcessId::new(1), 0x1000)
            .with_arg(7)
            .with_stack_top(0x8000)
            .with_priority(30);
        Thread::new(ThreadId::new(1).unwrap(), &params, 1, 0x4000_0200, 0)
    }

    #[test]
    fn thread_id_is_non_zero() {
        assert!(ThreadId::new(0).is_none());
        assert_eq!(ThreadId::new(5).map(ThreadId::get), Some(5));
    }

    #[test]
    fn new_thread_is_dormant_on_its_core() {
        let t = thread();
        assert_eq!(t.status, ThreadStatus::Dormant);
        assert_eq!(t.current_priority, t.nominal_priority);
        assert_eq!(t.affinity_mask, 0b10);
        assert_eq!(t.ideal_core, 1);
        assert!(t.allows_core(1));
        assert!(!t.allows_core(0));
        assert_eq!(t.context.x[0], 7);
        assert_eq!(t.context.pc, 0x1000);
        assert_eq!(t.context.sp, 0x8000);
        assert_eq!(t.tls_address(), 0x4000_0200);
    }

    #[test]
    fn wait_result_lands_in_registers_once() {
        let mut t = thread();
        t.set_wait_result(0x1234, Some(2));
        t.apply_wait_result();
        assert_eq!((t.context.x[0], t.context.x[1]), (0x1234, 2));
        t.context.x[0] = 9;
        t.apply_wait_result();
        assert_eq!(t.context.x[0], 9);
    }

    #[test]
    fn waiting_statuses() {
        assert!(ThreadStatus::WaitSleep.is_waiting());
        assert!(ThreadStatus::WaitMutex.is_waiting());
        assert!(!ThreadStatus::WaitMutex.is_sync_wait());
        assert!(ThreadStatus::WaitSynchAll.is_sync_wait());
        assert!(!ThreadStatus::Paused.is_waiting());
        assert!(!ThreadStatus::Ready.is_waiting());
    }
}
