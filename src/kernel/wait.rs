//! Synchronization objects and WaitSynchronization.
//!
//! Threads wait on [`SyncObject`]s. A thread object is signaled once the
//! thread is dead; an event is signaled by `signal_event` until cleared
//! (sticky) or until one waiter consumes it (one-shot).

use super::KernelState;
use crate::errors::{KernelError, KernelResult, RESULT_SUCCESS};
use crate::thread::{ThreadId, ThreadStatus, WakeupCallback, WakeupReason};
use core::fmt;
use tracing::debug;

/// Most objects a single wait may name.
pub const MAX_WAIT_OBJECTS: usize = 64;

/// Event identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(u64);

impl EventId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How an event behaves once a waiter observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetType {
    /// Cleared by the first waiter it releases
    OneShot,
    /// Stays signaled until cleared
    Sticky,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub signaled: bool,
    pub reset_type: ResetType,
    pub(crate) handle_count: u32,
}

/// Anything a thread can wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SyncObject {
    Thread(ThreadId),
    Event(EventId),
}

/// Result of [`KernelState::wait_synchronization`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Satisfied immediately by the object at this index
    Signaled(u32),
    /// The thread is now waiting; the outcome arrives with its next switch-in
    Blocked,
}

impl KernelState {
    pub fn create_event(&mut self, name: impl Into<String>, reset_type: ResetType) -> EventId {
        self.next_event_id += 1;
        let id = EventId::new(self.next_event_id);
        self.events.insert(
            id,
            Event {
                name: name.into(),
                signaled: false,
                reset_type,
                handle_count: 0,
            },
        );
        id
    }

    pub fn event(&self, id: EventId) -> Option<&Event> {
        self.events.get(&id)
    }

    /// Signal `id` and release whichever waiters it satisfies.
    pub fn signal_event(&mut self, id: EventId) -> KernelResult<()> {
        let event = self
            .events
            .get_mut(&id)
            .ok_or(KernelError::InvalidHandle(id.get() as u32))?;
        event.signaled = true;
        debug!(event = %id, "event signaled");
        self.wakeup_waiters(SyncObject::Event(id));
        Ok(())
    }

    pub fn clear_event(&mut self, id: EventId) -> KernelResult<()> {
        let event = self
            .events
            .get_mut(&id)
            .ok_or(KernelError::InvalidHandle(id.get() as u32))?;
        event.signaled = false;
        Ok(())
    }

    /// Drop one handle reference, destroying the event with the last one.
    pub(crate) fn release_event(&mut self, id: EventId) {
        let Some(event) = self.events.get_mut(&id) else {
            return;
        };
        event.handle_count = event.handle_count.saturating_sub(1);
        if event.handle_count == 0 && self.waiters(SyncObject::Event(id)).is_empty() {
            self.events.remove(&id);
        }
    }

    pub fn is_signaled(&self, object: SyncObject) -> bool {
        match object {
            SyncObject::Thread(id) => self.threads.get(&id).map_or(true, |t| t.is_dead()),
            SyncObject::Event(id) => self.events.get(&id).map_or(false, |e| e.signaled),
        }
    }

    /// Consume a signal observed by a waiter.
    fn acquire(&mut self, object: SyncObject) {
        if let SyncObject::Event(id) = object {
            if let Some(event) = self.events.get_mut(&id) {
                if event.reset_type == ResetType::OneShot {
                    event.signaled = false;
                }
            }
        }
    }

    /// Threads waiting on `object`, in arrival order.
    pub fn waiters(&self, object: SyncObject) -> &[ThreadId] {
        self.waiters.get(&object).map_or(&[], Vec::as_slice)
    }

    pub(crate) fn add_waiter(&mut self, object: SyncObject, thread: ThreadId) {
        let list = self.waiters.entry(object).or_default();
        if !list.contains(&thread) {
            list.push(thread);
        }
    }

    pub(crate) fn remove_waiter(&mut self, object: SyncObject, thread: ThreadId) {
        if let Some(list) = self.waiters.get_mut(&object) {
            list.retain(|waiter| *waiter != thread);
            if list.is_empty() {
                self.waiters.remove(&object);
            }
        }
    }

    /// Remove `thread` from every object it waits on.
    pub(crate) fn detach_wait_objects(&mut self, thread: ThreadId) {
        let objects = match self.threads.get_mut(&thread) {
            Some(t) => core::mem::take(&mut t.wait_objects),
            None => return,
        };
        for object in objects {
            self.remove_waiter(object, thread);
        }
    }

    /// Wait for the objects in `objects` on behalf of the current thread of
    /// `core`.
    ///
    /// With `wait_all` false the first signaled object satisfies the wait;
    /// otherwise every object must be signaled at once. A zero timeout
    /// polls, a negative one waits forever.
    pub fn wait_synchronization(
        &mut self,
        core: usize,
        objects: &[SyncObject],
        wait_all: bool,
        timeout_ns: i64,
    ) -> KernelResult<WaitOutcome> {
        if objects.len() > MAX_WAIT_OBJECTS {
            return Err(KernelError::OutOfRange);
        }
        let thread = self.current_thread(core).ok_or(KernelError::InvalidState)?;

        if wait_all {
            if !objects.is_empty() && objects.iter().all(|o| self.is_signaled(*o)) {
                for object in objects {
                    self.acquire(*object);
                }
                return Ok(WaitOutcome::Signaled(0));
            }
        } else if let Some(index) = objects.iter().position(|o| self.is_signaled(*o)) {
            self.acquire(objects[index]);
            return Ok(WaitOutcome::Signaled(index as u32));
        }

        if timeout_ns == 0 {
            return Err(KernelError::TimedOut);
        }

        let Some(t) = self.threads.get_mut(&thread) else {
            return Err(KernelError::InvalidState);
        };
        t.status = if wait_all {
            ThreadStatus::WaitSynchAll
        } else {
            ThreadStatus::WaitSynchAny
        };
        t.wait_objects = objects.to_vec();
        t.wakeup_callback = Some(WakeupCallback::SynchronizationWait);
        for object in objects {
            self.add_waiter(*object, thread);
        }
        self.wake_after_delay(thread, timeout_ns);
        self.request_reschedule(core);
        debug!(%thread, core, objects = objects.len(), wait_all, "thread waiting");
        Ok(WaitOutcome::Blocked)
    }

    /// Release every waiter that `object` now satisfies, best priority first.
    pub(crate) fn wakeup_waiters(&mut self, object: SyncObject) {
        let mut candidates = self.waiters(object).to_vec();
        candidates.sort_by_key(|id| self.threads.get(id).map_or(u32::MAX, |t| t.current_priority));

        for id in candidates {
            if !self.is_signaled(object) {
                break;
            }
            let Some(thread) = self.threads.get(&id) else {
                continue;
            };
            let index = match thread.status {
                ThreadStatus::WaitSynchAny => {
                    let Some(index) = thread.wait_objects.iter().position(|o| *o == object) else {
                        continue;
                    };
                    self.acquire(object);
                    index as u32
                }
                ThreadStatus::WaitSynchAll => {
                    let objects = thread.wait_objects.clone();
                    if !objects.iter().all(|o| self.is_signaled(*o)) {
                        continue;
                    }
                    for o in objects {
                        self.acquire(o);
                    }
                    0
                }
                _ => continue,
            };
            self.detach_wait_objects(id);
            self.invoke_wakeup_callback(id, WakeupReason::Signal, Some(index));
            self.resume_from_wait(id);
        }
    }

    /// Run and clear the thread's wakeup callback. Returns whether the
    /// thread should resume.
    pub(crate) fn invoke_wakeup_callback(
        &mut self,
        id: ThreadId,
        reason: WakeupReason,
        index: Option<u32>,
    ) -> bool {
        let Some(thread) = self.threads.get_mut(&id) else {
            return false;
        };
        match thread.wakeup_callback.take() {
            Some(WakeupCallback::SynchronizationWait) => {
                match reason {
                    WakeupReason::Signal => thread.set_wait_result(RESULT_SUCCESS, index),
                    WakeupReason::Timeout => {
                        thread.set_wait_result(KernelError::TimedOut.result_code(), None)
                    }
                }
                true
            }
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::kernel::tests::{kernel_with_process, spawn_running};
    use crate::kernel::{ResetType, SyncObject, WaitOutcome};
    use crate::errors::{KernelError, RESULT_SUCCESS};
    use crate::thread::ThreadStatus;

    #[test]
    fn signaled_sticky_event_satisfies_immediately() {
        let (kernel, process) = kernel_with_process();
        let mut state = kernel.lock();
        let thread = spawn_running(&mut state, process, 0, 30);
        let event = state.create_event("e", ResetType::Sticky);
        state.signal_event(event).unwrap();
        let objects = [SyncObject::Thread(thread), SyncObject::Event(event)];
        assert_eq!(
            state.wait_synchronization(0, &objects, false, -1),
            Ok(WaitOutcome::Signaled(1))
        );
        assert!(state.event(event).unwrap().signaled);
    }

    #[test]
    fn poll_without_signal_times_out() {
        let (kernel, process) = kernel_with_process();
        let mut state = kernel.lock();
        spawn_running(&mut state, process, 0, 30);
        let event = state.create_event("e", ResetType::OneShot);
        assert_eq!(
            state.wait_synchronization(0, &[SyncObject::Event(event)], false, 0),
            Err(KernelError::TimedOut)
        );
    }

    #[test]
    fn one_shot_event_releases_best_waiter_only() {
        let (kernel, process) = kernel_with_process();
        let mut state = kernel.lock();
        let event = state.create_event("e", ResetType::OneShot);
        let low = spawn_running(&mut state, process, 0, 40);
        state.wait_synchronization(0, &[SyncObject::Event(event)], false, -1).unwrap();
        let high = spawn_running(&mut state, process, 1, 10);
        state.wait_synchronization(1, &[SyncObject::Event(event)], false, -1).unwrap();

        state.signal_event(event).unwrap();
        let high_thread = state.thread(high).unwrap();
        assert_eq!(high_thread.status, ThreadStatus::Ready);
        assert_eq!(high_thread.wait_result, Some(RESULT_SUCCESS));
        assert_eq!(high_thread.wait_index, Some(0));
        assert_eq!(state.thread(low).unwrap().status, ThreadStatus::WaitSynchAny);
        assert!(!state.event(event).unwrap().signaled);
        assert_eq!(state.waiters(SyncObject::Event(event)), &[low]);
    }

    #[test]
    fn wait_all_needs_every_object() {
        let (kernel, process) = kernel_with_process();
        let mut state = kernel.lock();
        let a = state.create_event("a", ResetType::Sticky);
        let b = state.create_event("b", ResetType::Sticky);
        let waiter = spawn_running(&mut state, process, 0, 30);
        let objects = [SyncObject::Event(a), SyncObject::Event(b)];
        assert_eq!(
            state.wait_synchronization(0, &objects, true, -1),
            Ok(WaitOutcome::Blocked)
        );
        state.signal_event(a).unwrap();
        assert_eq!(state.thread(waiter).unwrap().status, ThreadStatus::WaitSynchAll);
        state.signal_event(b).unwrap();
        assert_eq!(state.thread(waiter).unwrap().status, ThreadStatus::Ready);
        assert!(state.waiters(SyncObject::Event(a)).is_empty());
    }
}
