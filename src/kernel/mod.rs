//! Guest kernel state shared by every core.
//!
//! All mutation goes through [`Kernel::lock`], a single spin lock over
//! [`KernelState`]. The state owns the thread arena, the process table,
//! synchronization objects and every core's scheduler, so each operation
//! observes one consistent snapshot of the system.
//!
//! Operations are split by concern:
//!
//! - [`thread`]: creation, start/stop, waits, activity and core affinity
//! - [`mutex`]: mutex waits and priority inheritance
//! - [`wait`]: events and WaitSynchronization
//! - [`process`]: processes, TLS slots and handle tables
//! - [`svc`]: supervisor call dispatch

pub mod mutex;
pub mod process;
pub mod svc;
pub mod thread;
pub mod wait;

pub use process::{
    HandleTable, KernelObject, Process, ProcessId, CURRENT_PROCESS_HANDLE, CURRENT_THREAD_HANDLE,
};
pub use svc::{SvcHandler, ThreadSvcHandler};
pub use wait::{Event, EventId, ResetType, SyncObject, WaitOutcome};

use crate::arch::{HaltHandle, HaltReason};
use crate::config::NUM_CPU_CORES;
use crate::mem::AddressSpace;
use crate::sched::GlobalScheduler;
use crate::thread::{Thread, ThreadId, ThreadStatus};
use crate::time::TimeSource;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// Outcome of [`KernelState::select_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// The core keeps its current thread.
    Keep,
    /// The core's thread changes. Save `prev`, then load `next`; the two
    /// are equal when a thread woke up before its core switched it out.
    Switch {
        prev: Option<ThreadId>,
        next: Option<ThreadId>,
    },
}

/// Handle to the kernel-wide lock.
pub struct Kernel {
    state: spin::Mutex<KernelState>,
    time: Arc<dyn TimeSource>,
}

impl Kernel {
    pub fn new(time: Arc<dyn TimeSource>) -> Self {
        Self {
            state: spin::Mutex::new(KernelState::new(Arc::clone(&time))),
            time,
        }
    }

    /// Acquire the kernel-wide lock.
    pub fn lock(&self) -> spin::MutexGuard<'_, KernelState> {
        self.state.lock()
    }

    /// Time source, usable without the lock.
    pub fn time(&self) -> &Arc<dyn TimeSource> {
        &self.time
    }

    /// Pop due timer events and dispatch them under the lock.
    ///
    /// Must not be called while holding [`lock`](Self::lock).
    pub fn dispatch_timer_events(&self) -> usize {
        let events = self.time.advance();
        if events.is_empty() {
            return 0;
        }
        let mut state = self.lock();
        for event in &events {
            state.on_timer_event(*event);
        }
        events.len()
    }
}

/// Everything guarded by the kernel lock.
pub struct KernelState {
    time: Arc<dyn TimeSource>,
    threads: BTreeMap<ThreadId, Thread>,
    next_thread_id: u64,
    processes: BTreeMap<ProcessId, Process>,
    next_process_id: u32,
    events: BTreeMap<EventId, Event>,
    next_event_id: u64,
    waiters: BTreeMap<SyncObject, Vec<ThreadId>>,
    scheduler: GlobalScheduler,
    halts: [Option<HaltHandle>; NUM_CPU_CORES],
}

impl KernelState {
    fn new(time: Arc<dyn TimeSource>) -> Self {
        Self {
            time,
            threads: BTreeMap::new(),
            next_thread_id: 0,
            processes: BTreeMap::new(),
            next_process_id: 0,
            events: BTreeMap::new(),
            next_event_id: 0,
            waiters: BTreeMap::new(),
            scheduler: GlobalScheduler::new(),
            halts: Default::default(),
        }
    }

    pub fn time(&self) -> &Arc<dyn TimeSource> {
        &self.time
    }

    /// Register the halt handle through which `core` is asked to reschedule.
    pub fn register_core(&mut self, core: usize, halt: HaltHandle) {
        self.halts[core] = Some(halt);
    }

    /// Ask `core` to reselect its thread at its next instruction boundary.
    pub fn request_reschedule(&self, core: usize) {
        if let Some(halt) = self.halts.get(core).and_then(Option::as_ref) {
            halt.request(HaltReason::RESCHEDULE);
        }
    }

    pub fn create_process(
        &mut self,
        name: impl Into<String>,
        space: Arc<AddressSpace>,
    ) -> ProcessId {
        self.next_process_id += 1;
        let id = ProcessId::new(self.next_process_id);
        self.processes.insert(id, Process::new(id, name, space));
        id
    }

    pub fn process(&self, id: ProcessId) -> Option<&Process> {
        self.processes.get(&id)
    }

    pub fn process_mut(&mut self, id: ProcessId) -> Option<&mut Process> {
        self.processes.get_mut(&id)
    }

    pub fn thread(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.get(&id)
    }

    pub fn thread_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.threads.get_mut(&id)
    }

    pub fn threads(&self) -> impl Iterator<Item = &Thread> {
        self.threads.values()
    }

    pub fn scheduler(&self) -> &GlobalScheduler {
        &self.scheduler
    }

    /// Thread bound to `core`.
    pub fn current_thread(&self, core: usize) -> Option<ThreadId> {
        self.scheduler.scheduler(core).current()
    }

    /// Whether any thread is alive.
    pub fn has_live_threads(&self) -> bool {
        self.threads.values().any(|t| !t.is_dead())
    }

    /// Charge CPU time to `id`.
    pub fn account_ticks(&mut self, id: ThreadId, ticks: u64) {
        if let Some(thread) = self.threads.get_mut(&id) {
            thread.total_ticks += ticks;
        }
    }

    /// Best queued thread for `core`, skipping threads still bound to
    /// another core that has not switched them out yet.
    fn best_ready(&self, core: usize) -> Option<(u32, ThreadId)> {
        self.scheduler
            .scheduler(core)
            .ready()
            .iter()
            .find(|(_, id)| {
                self.scheduler
                    .current_core_of(*id)
                    .map_or(true, |other| other == core)
            })
    }

    /// Pick or confirm the thread of `core`.
    ///
    /// The running thread keeps the core unless a ready thread of higher
    /// or equal priority is queued, in which case it goes to the back of
    /// its level. A thread that stopped running, or whose affinity no
    /// longer includes `core`, is switched out.
    pub fn select_next(&mut self, core: usize) -> Selection {
        let now = self.time.ticks();
        let current = self.current_thread(core);
        let keeper = current
            .and_then(|id| self.threads.get(&id))
            .filter(|t| t.status == ThreadStatus::Running && t.allows_core(core))
            .map(|t| t.current_priority);
        let best = self.best_ready(core);

        match (current, keeper) {
            (Some(id), Some(priority)) => {
                if !best.map_or(false, |(p, _)| p <= priority) {
                    return Selection::Keep;
                }
                if let Some(t) = self.threads.get_mut(&id) {
                    t.status = ThreadStatus::Ready;
                }
                self.scheduler.scheduler_mut(core).schedule(priority, id);
                trace!(core, thread = %id, "preempted");
            }
            (Some(id), None) => {
                let migrating = self
                    .threads
                    .get(&id)
                    .map_or(false, |t| t.status == ThreadStatus::Running);
                if migrating {
                    if let Some(t) = self.threads.get_mut(&id) {
                        t.status = ThreadStatus::Ready;
                    }
                    // Unbind first so the new core sees it as available.
                    self.scheduler.scheduler_mut(core).set_current(None, now);
                    self.change_core(id);
                }
            }
            (None, _) if best.is_none() => return Selection::Keep,
            (None, _) => {}
        }

        let next = best.map(|(priority, id)| {
            self.scheduler.scheduler_mut(core).unschedule(priority, id);
            if let Some(t) = self.threads.get_mut(&id) {
                t.status = ThreadStatus::Running;
                t.processor_id = core as i32;
                t.last_scheduled_tick = now;
            }
            id
        });
        self.scheduler.scheduler_mut(core).set_current(next, now);
        trace!(core, prev = ?current, next = ?next, "context switch");
        Selection::Switch {
            prev: current,
            next,
        }
    }

    /// Finish switching `id` in: deliver any pending wait result into its
    /// saved registers and return the thread.
    pub fn switch_in(&mut self, id: ThreadId) -> Option<&Thread> {
        let thread = self.threads.get_mut(&id)?;
        thread.apply_wait_result();
        Some(thread)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::errors::RESULT_SUCCESS;
    use crate::mem::{VmaPermission, PAGE_SIZE};
    use crate::thread::ThreadParams;
    use crate::time::{CoreTiming, TimerEvent};

    pub const ENTRY: u64 = 0x10_0000;

    pub fn kernel_with_process() -> (Kernel, ProcessId) {
        let kernel = Kernel::new(Arc::new(CoreTiming::new()));
        let space = AddressSpace::new();
        space
            .map_anonymous(ENTRY, 4 * PAGE_SIZE, VmaPermission::ALL)
            .unwrap();
        let process = kernel.lock().create_process("test", Arc::new(space));
        (kernel, process)
    }

    pub fn spawn_dormant(
        state: &mut KernelState,
        process: ProcessId,
        core: i32,
        priority: u32,
    ) -> ThreadId {
        let params = ThreadParams::new(process, ENTRY)
            .with_priority(priority)
            .with_processor_id(core);
        state.create_thread(params).unwrap()
    }

    /// Create a thread and make it current on `core`.
    pub fn spawn_running(
        state: &mut KernelState,
        process: ProcessId,
        core: usize,
        priority: u32,
    ) -> ThreadId {
        let id = spawn_dormant(state, process, core as i32, priority);
        state.start_thread(id).unwrap();
        let selection = state.select_next(core);
        assert!(
            matches!(selection, Selection::Switch { next: Some(next), .. } if next == id),
            "{selection:?}"
        );
        id
    }

    #[test]
    fn idle_core_without_work_keeps_idle() {
        let (kernel, _) = kernel_with_process();
        assert_eq!(kernel.lock().select_next(0), Selection::Keep);
    }

    #[test]
    fn running_thread_keeps_core_against_lower_priority() {
        let (kernel, process) = kernel_with_process();
        let mut state = kernel.lock();
        let high = spawn_running(&mut state, process, 0, 10);
        let low = spawn_dormant(&mut state, process, 0, 20);
        state.start_thread(low).unwrap();
        assert_eq!(state.select_next(0), Selection::Keep);
        assert_eq!(state.current_thread(0), Some(high));
    }

    #[test]
    fn equal_priority_round_robins() {
        let (kernel, process) = kernel_with_process();
        let mut state = kernel.lock();
        let first = spawn_running(&mut state, process, 0, 20);
        let second = spawn_dormant(&mut state, process, 0, 20);
        state.start_thread(second).unwrap();
        assert_eq!(
            state.select_next(0),
            Selection::Switch {
                prev: Some(first),
                next: Some(second)
            }
        );
        assert_eq!(state.thread(first).unwrap().status, ThreadStatus::Ready);
        assert_eq!(state.thread(second).unwrap().status, ThreadStatus::Running);
        assert!(state.scheduler().scheduler(0).ready().contains(20, first));
    }

    #[test]
    fn waiting_thread_is_switched_out() {
        let (kernel, process) = kernel_with_process();
        let mut state = kernel.lock();
        let id = spawn_running(&mut state, process, 0, 20);
        state.sleep_thread(0, 1_000).unwrap();
        assert_eq!(
            state.select_next(0),
            Selection::Switch {
                prev: Some(id),
                next: None
            }
        );
        assert!(state.scheduler().is_idle(0));
    }

    #[test]
    fn woken_thread_reselected_with_wait_result() {
        let (kernel, process) = kernel_with_process();
        let mut state = kernel.lock();
        let event = state.create_event("e", ResetType::OneShot);
        let id = spawn_running(&mut state, process, 0, 20);
        state
            .wait_synchronization(0, &[SyncObject::Event(event)], false, -1)
            .unwrap();
        state.signal_event(event).unwrap();
        assert_eq!(
            state.select_next(0),
            Selection::Switch {
                prev: Some(id),
                next: Some(id)
            }
        );
        // Registers as saved when the thread was switched out.
        let saved = &mut state.thread_mut(id).unwrap().context;
        saved.x[0] = 0xff;
        saved.x[1] = 0xff;
        let thread = state.switch_in(id).unwrap();
        assert_eq!(thread.context.x[0], u64::from(RESULT_SUCCESS));
        assert_eq!(thread.context.x[1], 0);
        assert_eq!(thread.wait_result, None);
    }

    #[test]
    fn thread_bound_elsewhere_is_not_taken() {
        let (kernel, process) = kernel_with_process();
        let mut state = kernel.lock();
        let id = spawn_running(&mut state, process, 0, 20);
        state.sleep_thread(0, 1_000).unwrap();
        state.thread_mut(id).unwrap().affinity_mask = 0b11;
        state.on_timer_event(TimerEvent::ThreadWakeup(id));
        // Core 1 was idle, so the thread was placed there while core 0
        // still holds it.
        assert_eq!(state.thread(id).unwrap().processor_id, 1);
        assert_eq!(state.select_next(1), Selection::Keep);
        assert!(matches!(state.select_next(0), Selection::Switch { next: None, .. }));
        assert_eq!(
            state.select_next(1),
            Selection::Switch {
                prev: None,
                next: Some(id)
            }
        );
    }

    #[test]
    fn affinity_change_migrates_running_thread() {
        let (kernel, process) = kernel_with_process();
        let mut state = kernel.lock();
        let id = spawn_running(&mut state, process, 0, 20);
        state.set_core_and_affinity_mask(id, 3, 0b1000).unwrap();
        assert!(matches!(
            state.select_next(0),
            Selection::Switch { prev: Some(prev), next: None } if prev == id
        ));
        assert_eq!(state.thread(id).unwrap().processor_id, 3);
        assert_eq!(
            state.select_next(3),
            Selection::Switch {
                prev: None,
                next: Some(id)
            }
        );
    }

    #[test]
    fn exited_thread_is_reaped_after_switch_out() {
        let (kernel, process) = kernel_with_process();
        let mut state = kernel.lock();
        let id = spawn_running(&mut state, process, 2, 20);
        state.exit_thread(2).unwrap();
        assert_eq!(state.reap_threads(), 0);
        state.select_next(2);
        assert_eq!(state.reap_threads(), 1);
        assert!(state.thread(id).is_none());
        assert!(!state.has_live_threads());
        assert!(state.scheduler().thread_list().is_empty());
    }
}
