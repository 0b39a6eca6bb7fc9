//! Thread lifecycle operations.

use super::wait::SyncObject;
use super::KernelState;
use crate::config::NUM_CPU_CORES;
use crate::errors::{KernelError, KernelResult};
use crate::thread::{
    Thread, ThreadActivity, ThreadId, ThreadParams, ThreadStatus, WakeupReason, PRIORITY_LOWEST,
    PROCESSOR_ID_DONT_UPDATE, PROCESSOR_ID_IDEAL,
};
use crate::time::TimerEvent;
use tracing::{debug, error, warn};

impl KernelState {
    /// Create a dormant thread.
    ///
    /// Nothing is created when validation fails.
    pub fn create_thread(&mut self, params: ThreadParams) -> KernelResult<ThreadId> {
        if params.priority > PRIORITY_LOWEST {
            error!(name = %params.name, priority = params.priority, "invalid thread priority");
            return Err(KernelError::InvalidPriority(params.priority));
        }
        let process = self
            .processes
            .get_mut(&params.owner)
            .ok_or(KernelError::InvalidHandle(params.owner.get()))?;

        let core = if params.processor_id == PROCESSOR_ID_IDEAL {
            process.ideal_core
        } else {
            params.processor_id
        };
        let allowed = usize::try_from(core).map_or(false, |c| process.allows_core(c));
        if !allowed {
            error!(name = %params.name, processor_id = params.processor_id, "invalid processor id");
            return Err(KernelError::InvalidCoreId(params.processor_id));
        }
        if !process.space().is_mapped(params.entry) {
            error!(name = %params.name, entry = params.entry, "invalid entry point");
            return Err(KernelError::InvalidAddress(params.entry));
        }
        let tls_address = process.allocate_tls_slot()?;

        self.next_thread_id += 1;
        let id = ThreadId::new(self.next_thread_id).ok_or(KernelError::OutOfResource)?;
        let now = self.time.ticks();
        let thread = Thread::new(id, &params, core, tls_address, now);
        let core = core as usize;

        self.scheduler.scheduler_mut(core).add_thread(id);
        self.scheduler.add_thread(id);
        self.threads.insert(id, thread);
        debug!(thread = %id, name = %params.name, core, priority = params.priority, "thread created");
        Ok(id)
    }

    /// Move a dormant thread into scheduling.
    pub fn start_thread(&mut self, id: ThreadId) -> KernelResult<()> {
        let thread = self.threads.get(&id).ok_or(KernelError::InvalidHandle(0))?;
        if thread.status != ThreadStatus::Dormant {
            return Err(KernelError::InvalidState);
        }
        debug!(thread = %id, "thread started");
        self.resume_from_wait(id);
        Ok(())
    }

    /// End a wait (or dormancy) and make the thread schedulable.
    ///
    /// # Panics
    ///
    /// Panics if the thread is running or dead, or still waits on objects.
    pub fn resume_from_wait(&mut self, id: ThreadId) {
        let Some(thread) = self.threads.get_mut(&id) else {
            return;
        };
        match thread.status {
            ThreadStatus::Running | ThreadStatus::Dead => {
                panic!("thread {id} cannot resume from {:?}", thread.status)
            }
            ThreadStatus::Ready => {
                // Woken twice before being scheduled.
                assert!(
                    thread.wakeup_callback.is_none(),
                    "ready thread {id} still has a wakeup callback"
                );
                return;
            }
            ThreadStatus::Paused => return,
            _ => {}
        }
        assert!(
            thread.wait_objects.is_empty(),
            "thread {id} resumed while waiting on objects"
        );
        thread.wakeup_callback = None;
        let paused = thread.activity == ThreadActivity::Paused;
        self.cancel_wakeup_timer(id);

        if paused {
            if let Some(thread) = self.threads.get_mut(&id) {
                thread.status = ThreadStatus::Paused;
            }
            return;
        }
        self.make_ready(id);
    }

    fn make_ready(&mut self, id: ThreadId) {
        if let Some(thread) = self.threads.get_mut(&id) {
            thread.status = ThreadStatus::Ready;
        }
        self.change_core(id);
    }

    /// Place a ready thread on a core and queue it there.
    ///
    /// An idle core allowed by the affinity mask is preferred, the ideal
    /// core first. Otherwise the thread stays on its last core, or moves to
    /// the lowest allowed one when the last core is no longer allowed.
    pub(crate) fn change_core(&mut self, id: ThreadId) {
        let Some(thread) = self.threads.get(&id) else {
            return;
        };
        let allowed: Vec<usize> = (0..NUM_CPU_CORES).filter(|c| thread.allows_core(*c)).collect();
        assert!(!allowed.is_empty(), "thread {id} has an empty affinity mask");

        let idle = |core: usize| self.scheduler.is_idle(core);
        let ideal = usize::try_from(thread.ideal_core)
            .ok()
            .filter(|c| allowed.contains(c) && idle(*c));
        let old = thread.core();
        let target = ideal
            .or_else(|| allowed.iter().copied().find(|c| idle(*c)))
            .or_else(|| old.filter(|c| allowed.contains(c)))
            .unwrap_or(allowed[0]);
        let priority = thread.current_priority;

        if let Some(old) = old {
            self.scheduler.scheduler_mut(old).unschedule(priority, id);
            if old != target {
                self.scheduler.scheduler_mut(old).remove_thread(id);
            }
        }
        if old != Some(target) {
            self.scheduler.scheduler_mut(target).add_thread(id);
            if let Some(thread) = self.threads.get_mut(&id) {
                thread.processor_id = target as i32;
            }
            debug!(thread = %id, from = ?old, to = target, "thread migrated");
        }
        self.scheduler.scheduler_mut(target).schedule(priority, id);
        self.request_reschedule(target);
    }

    /// Schedule a timed wakeup. Negative delays wait forever.
    pub fn wake_after_delay(&mut self, id: ThreadId, ns: i64) {
        if ns < 0 {
            return;
        }
        self.time.schedule_event(ns as u64, TimerEvent::ThreadWakeup(id));
    }

    pub fn cancel_wakeup_timer(&mut self, id: ThreadId) {
        self.time.unschedule_event(TimerEvent::ThreadWakeup(id));
    }

    /// Dispatch a due timer event.
    pub fn on_timer_event(&mut self, event: TimerEvent) {
        let TimerEvent::ThreadWakeup(id) = event;
        let Some(thread) = self.threads.get(&id) else {
            warn!(thread = %id, "wakeup for a thread that no longer exists");
            return;
        };
        let status = thread.status;
        if !status.is_waiting() {
            warn!(thread = %id, ?status, "wakeup for a thread that is not waiting");
            return;
        }

        let mut resume = true;
        if status.is_sync_wait() {
            self.detach_wait_objects(id);
            resume = self.invoke_wakeup_callback(id, WakeupReason::Timeout, None);
        }
        if status == ThreadStatus::WaitMutex {
            if let Some(owner) = self.threads.get(&id).and_then(|t| t.lock_owner) {
                self.remove_mutex_waiter(owner, id);
            }
            if let Some(thread) = self.threads.get_mut(&id) {
                thread.mutex_wait_address = 0;
                thread.set_wait_result(KernelError::TimedOut.result_code(), None);
            }
        }
        debug!(thread = %id, ?status, "timed wait expired");
        if resume {
            self.resume_from_wait(id);
        }
    }

    /// Terminate a thread. Stopping a dead thread does nothing.
    pub fn stop_thread(&mut self, id: ThreadId) -> KernelResult<()> {
        let thread = self.threads.get(&id).ok_or(KernelError::InvalidHandle(0))?;
        if thread.is_dead() {
            return Ok(());
        }
        let (status, core, priority) = (thread.status, thread.core(), thread.current_priority);
        let lock_owner = thread.lock_owner;
        let mut held: Vec<u64> = thread
            .wait_mutex_threads
            .iter()
            .filter_map(|w| self.threads.get(w).map(|t| t.mutex_wait_address))
            .collect();
        held.sort_unstable();
        held.dedup();

        self.cancel_wakeup_timer(id);
        if status == ThreadStatus::Ready {
            if let Some(core) = core {
                self.scheduler.scheduler_mut(core).unschedule(priority, id);
            }
        }
        if let Some(owner) = lock_owner {
            self.remove_mutex_waiter(owner, id);
        }
        for address in held {
            self.release_mutex(id, address);
        }

        let Some(thread) = self.threads.get_mut(&id) else {
            return Ok(());
        };
        thread.status = ThreadStatus::Dead;
        thread.wakeup_callback = None;
        thread.mutex_wait_address = 0;
        let (owner, tls) = (thread.owner, thread.tls_address());

        self.wakeup_waiters(SyncObject::Thread(id));
        self.detach_wait_objects(id);
        if let Some(process) = self.processes.get_mut(&owner) {
            process.free_tls_slot(tls);
        }
        if let Some(core) = self.scheduler.current_core_of(id) {
            self.request_reschedule(core);
        }
        debug!(thread = %id, "thread stopped");
        Ok(())
    }

    /// Remove dead threads that are neither current nor referenced by a
    /// handle.
    pub fn reap_threads(&mut self) -> usize {
        let reapable: Vec<ThreadId> = self
            .threads
            .values()
            .filter(|t| t.is_dead() && t.handle_count == 0)
            .map(|t| t.id)
            .filter(|id| self.scheduler.current_core_of(*id).is_none())
            .filter(|id| self.waiters(SyncObject::Thread(*id)).is_empty())
            .collect();
        for id in &reapable {
            self.threads.remove(id);
            self.scheduler.remove_thread(*id);
            debug!(thread = %id, "thread reaped");
        }
        reapable.len()
    }

    /// Pause or resume a thread at the guest's request.
    pub fn set_thread_activity(
        &mut self,
        id: ThreadId,
        activity: ThreadActivity,
    ) -> KernelResult<()> {
        let thread = self.threads.get_mut(&id).ok_or(KernelError::InvalidHandle(0))?;
        let status = thread.status;
        if matches!(status, ThreadStatus::Dormant | ThreadStatus::Dead) {
            return Err(KernelError::InvalidState);
        }
        thread.activity = activity;
        let (core, priority) = (thread.core(), thread.current_priority);

        match (activity, status) {
            (ThreadActivity::Paused, ThreadStatus::Ready) => {
                thread.status = ThreadStatus::Paused;
                if let Some(core) = core {
                    self.scheduler.scheduler_mut(core).unschedule(priority, id);
                }
            }
            (ThreadActivity::Paused, ThreadStatus::Running) => {
                thread.status = ThreadStatus::Paused;
                if let Some(core) = core {
                    self.request_reschedule(core);
                }
            }
            (ThreadActivity::Runnable, ThreadStatus::Paused) => self.make_ready(id),
            // Waiting threads pick up the activity when they resume.
            _ => {}
        }
        debug!(thread = %id, ?activity, "thread activity set");
        Ok(())
    }

    /// Change a thread's ideal core and affinity mask.
    pub fn set_core_and_affinity_mask(
        &mut self,
        id: ThreadId,
        core: i32,
        mask: u64,
    ) -> KernelResult<()> {
        let thread = self.threads.get(&id).ok_or(KernelError::InvalidHandle(0))?;
        let process = self
            .processes
            .get(&thread.owner)
            .ok_or(KernelError::InvalidState)?;

        let ideal = match core {
            PROCESSOR_ID_DONT_UPDATE => thread.ideal_core,
            PROCESSOR_ID_IDEAL => process.ideal_core,
            core => {
                let valid = usize::try_from(core).map_or(false, |c| process.allows_core(c));
                if !valid {
                    return Err(KernelError::InvalidCoreId(core));
                }
                core
            }
        };
        if mask == 0 {
            return Err(KernelError::InvalidCombination);
        }
        if mask & !process.core_mask != 0 {
            return Err(KernelError::InvalidCoreId(core));
        }
        if ideal >= 0 && mask & (1 << ideal) == 0 {
            return Err(KernelError::InvalidCombination);
        }

        let Some(thread) = self.threads.get_mut(&id) else {
            return Err(KernelError::InvalidHandle(0));
        };
        thread.ideal_core = ideal;
        thread.affinity_mask = mask;
        let (status, current) = (thread.status, thread.core());
        debug!(thread = %id, ideal, mask, "affinity changed");

        match status {
            ThreadStatus::Ready => self.change_core(id),
            ThreadStatus::Running => {
                if let Some(core) = current.filter(|c| mask & (1 << c) == 0) {
                    self.request_reschedule(core);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Put the current thread of `core` to sleep. Non-positive durations
    /// yield instead.
    pub fn sleep_thread(&mut self, core: usize, ns: i64) -> KernelResult<()> {
        let id = self.current_thread(core).ok_or(KernelError::InvalidState)?;
        if ns <= 0 {
            return self.yield_thread(core);
        }
        if let Some(thread) = self.threads.get_mut(&id) {
            thread.status = ThreadStatus::WaitSleep;
        }
        self.wake_after_delay(id, ns);
        self.request_reschedule(core);
        debug!(thread = %id, ns, "thread sleeping");
        Ok(())
    }

    /// Give up the rest of the slice to ready threads of equal or better
    /// priority.
    pub fn yield_thread(&mut self, core: usize) -> KernelResult<()> {
        self.current_thread(core).ok_or(KernelError::InvalidState)?;
        self.request_reschedule(core);
        Ok(())
    }

    /// Terminate the current thread of `core`.
    pub fn exit_thread(&mut self, core: usize) -> KernelResult<()> {
        let id = self.current_thread(core).ok_or(KernelError::InvalidState)?;
        self.stop_thread(id)
    }
}
