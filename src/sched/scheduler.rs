//! Per-core and system-wide scheduler bookkeeping.
//!
//! These types only track membership, queue order and the current thread of
//! each core. Thread data lives in the kernel's arena, and selection policy
//! runs in the kernel under its lock.

use super::queue::MultiLevelQueue;
use crate::config::NUM_CPU_CORES;
use crate::thread::ThreadId;

/// Scheduling state of one core.
#[derive(Debug, Clone)]
pub struct Scheduler {
    core_id: usize,
    ready: MultiLevelQueue<ThreadId>,
    current: Option<ThreadId>,
    members: Vec<ThreadId>,
    last_switch_ticks: u64,
    switches: u64,
}

impl Scheduler {
    pub fn new(core_id: usize) -> Self {
        Self {
            core_id,
            ready: MultiLevelQueue::new(),
            current: None,
            members: Vec::new(),
            last_switch_ticks: 0,
            switches: 0,
        }
    }

    pub fn core_id(&self) -> usize {
        self.core_id
    }

    /// Thread currently bound to the core.
    pub fn current(&self) -> Option<ThreadId> {
        self.current
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none()
    }

    /// Bind `thread` to the core, recording the switch time.
    pub fn set_current(&mut self, thread: Option<ThreadId>, now: u64) {
        if thread != self.current {
            self.switches += 1;
        }
        self.current = thread;
        self.last_switch_ticks = now;
    }

    pub fn last_switch_ticks(&self) -> u64 {
        self.last_switch_ticks
    }

    /// Number of times the current thread has changed.
    pub fn context_switches(&self) -> u64 {
        self.switches
    }

    pub fn add_thread(&mut self, thread: ThreadId) {
        if !self.members.contains(&thread) {
            self.members.push(thread);
        }
    }

    pub fn remove_thread(&mut self, thread: ThreadId) {
        self.members.retain(|member| *member != thread);
    }

    pub fn members(&self) -> &[ThreadId] {
        &self.members
    }

    pub fn ready(&self) -> &MultiLevelQueue<ThreadId> {
        &self.ready
    }

    /// Queue `thread` at the back of its level.
    pub fn schedule(&mut self, priority: u32, thread: ThreadId) {
        debug_assert!(
            !self.ready.contains(priority, thread),
            "thread {thread} already queued on core {}",
            self.core_id
        );
        self.ready.push_back(priority, thread);
    }

    pub fn unschedule(&mut self, priority: u32, thread: ThreadId) -> bool {
        self.ready.remove(priority, thread)
    }

    /// Re-queue `thread` after its priority changed.
    pub fn set_thread_priority(&mut self, thread: ThreadId, old: u32, new: u32) {
        if old != new {
            self.ready.adjust(thread, old, new);
        }
    }
}

/// View across every core's scheduler plus the global thread list.
#[derive(Debug, Clone)]
pub struct GlobalScheduler {
    schedulers: [Scheduler; NUM_CPU_CORES],
    thread_list: Vec<ThreadId>,
}

impl GlobalScheduler {
    pub fn new() -> Self {
        Self {
            schedulers: core::array::from_fn(Scheduler::new),
            thread_list: Vec::new(),
        }
    }

    pub fn scheduler(&self, core: usize) -> &Scheduler {
        &self.schedulers[core]
    }

    pub fn scheduler_mut(&mut self, core: usize) -> &mut Scheduler {
        &mut self.schedulers[core]
    }

    pub fn schedulers(&self) -> impl Iterator<Item = &Scheduler> {
        self.schedulers.iter()
    }

    pub fn add_thread(&mut self, thread: ThreadId) {
        self.thread_list.push(thread);
    }

    pub fn remove_thread(&mut self, thread: ThreadId) {
        self.thread_list.retain(|listed| *listed != thread);
        for scheduler in &mut self.schedulers {
            scheduler.remove_thread(thread);
        }
    }

    pub fn thread_list(&self) -> &[ThreadId] {
        &self.thread_list
    }

    /// Core on which `thread` is current, if any.
    pub fn current_core_of(&self, thread: ThreadId) -> Option<usize> {
        self.schedulers
            .iter()
            .position(|scheduler| scheduler.current == Some(thread))
    }

    pub fn is_idle(&self, core: usize) -> bool {
        self.schedulers[core].is_idle()
    }
}

impl Default for GlobalScheduler {
    fn default() -> Self {
        Self::new()
    }
}
