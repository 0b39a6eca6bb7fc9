//! Guest mutex waits and priority inheritance.
//!
//! A thread blocked on a mutex is linked to the holder through
//! `lock_owner`, and the holder lists it in `wait_mutex_threads`. The
//! holder's effective priority is the best of its own nominal priority and
//! every waiter's effective priority, pushed up the owner chain whenever the
//! links change.

use super::KernelState;
use crate::errors::{KernelError, KernelResult, RESULT_SUCCESS};
use crate::thread::{ThreadId, ThreadStatus, PRIORITY_LOWEST};
use tracing::debug;

impl KernelState {
    fn priority_of(&self, id: ThreadId) -> u32 {
        self.threads
            .get(&id)
            .map_or(PRIORITY_LOWEST, |t| t.current_priority)
    }

    /// Insert `waiter` into `owner`'s list, keeping best priority first and
    /// arrival order among equals.
    fn insert_mutex_waiter(&mut self, owner: ThreadId, waiter: ThreadId) {
        let priority = self.priority_of(waiter);
        let pos = {
            let list = &self.threads[&owner].wait_mutex_threads;
            list.iter()
                .position(|other| self.priority_of(*other) > priority)
                .unwrap_or(list.len())
        };
        if let Some(owner) = self.threads.get_mut(&owner) {
            owner.wait_mutex_threads.insert(pos, waiter);
        }
    }

    /// Record that `waiter` is blocked on a mutex held by `owner`.
    ///
    /// # Panics
    ///
    /// Panics if `waiter` already has a lock owner, if it is `owner`, or if
    /// the link would close a cycle.
    pub fn add_mutex_waiter(&mut self, owner: ThreadId, waiter: ThreadId) {
        assert_ne!(owner, waiter, "thread {waiter} cannot wait on itself");
        assert!(
            self.threads.contains_key(&owner),
            "mutex owner {owner} does not exist"
        );
        let current_owner = self.threads.get(&waiter).and_then(|t| t.lock_owner);
        assert!(
            current_owner.is_none(),
            "thread {waiter} already waits on {current_owner:?}"
        );

        let mut cursor = Some(owner);
        while let Some(id) = cursor {
            assert_ne!(id, waiter, "lock owner cycle through thread {waiter}");
            cursor = self.threads.get(&id).and_then(|t| t.lock_owner);
        }

        self.insert_mutex_waiter(owner, waiter);
        if let Some(t) = self.threads.get_mut(&waiter) {
            t.lock_owner = Some(owner);
        }
        self.update_priority(owner);
    }

    /// Undo [`add_mutex_waiter`](Self::add_mutex_waiter).
    ///
    /// # Panics
    ///
    /// Panics if `waiter` is not linked to `owner`.
    pub fn remove_mutex_waiter(&mut self, owner: ThreadId, waiter: ThreadId) {
        let linked = self.threads.get(&waiter).and_then(|t| t.lock_owner);
        assert_eq!(
            linked,
            Some(owner),
            "thread {waiter} is not waiting on {owner}"
        );
        if let Some(t) = self.threads.get_mut(&owner) {
            t.wait_mutex_threads.retain(|other| *other != waiter);
        }
        if let Some(t) = self.threads.get_mut(&waiter) {
            t.lock_owner = None;
        }
        self.update_priority(owner);
    }

    /// Recompute `id`'s effective priority from its nominal priority and
    /// its mutex waiters, then repeat for each owner up the chain.
    pub fn update_priority(&mut self, id: ThreadId) {
        let mut cursor = Some(id);
        let mut hops = 0;
        while let Some(id) = cursor {
            hops += 1;
            assert!(hops <= self.threads.len(), "lock owner cycle through thread {id}");

            let Some(thread) = self.threads.get(&id) else {
                return;
            };
            let best = thread
                .wait_mutex_threads
                .iter()
                .map(|waiter| self.priority_of(*waiter))
                .fold(thread.nominal_priority, u32::min);
            if best == thread.current_priority {
                return;
            }
            let owner = thread.lock_owner;
            self.boost_priority(id, best);

            // The owner's waiter list is ordered by priority; re-place `id`.
            if let Some(owner) = owner {
                if let Some(o) = self.threads.get_mut(&owner) {
                    o.wait_mutex_threads.retain(|other| *other != id);
                }
                self.insert_mutex_waiter(owner, id);
            }
            cursor = owner;
        }
    }

    /// Set the effective priority of `id` and requeue it.
    ///
    /// One step of [`KernelState::update_priority`]; the next recompute
    /// replaces whatever is set here.
    pub(crate) fn boost_priority(&mut self, id: ThreadId, priority: u32) {
        let Some(thread) = self.threads.get_mut(&id) else {
            return;
        };
        let old = thread.current_priority;
        thread.current_priority = priority;
        let (status, core) = (thread.status, thread.core());
        let Some(core) = core else {
            return;
        };
        match status {
            ThreadStatus::Ready => {
                self.scheduler
                    .scheduler_mut(core)
                    .set_thread_priority(id, old, priority);
                self.request_reschedule(core);
            }
            ThreadStatus::Running => self.request_reschedule(core),
            _ => {}
        }
    }

    /// Set the nominal priority of `id`.
    pub fn set_thread_priority(&mut self, id: ThreadId, priority: u32) -> KernelResult<()> {
        if priority > PRIORITY_LOWEST {
            return Err(KernelError::InvalidPriority(priority));
        }
        let thread = self
            .threads
            .get_mut(&id)
            .ok_or(KernelError::InvalidHandle(0))?;
        thread.nominal_priority = priority;
        debug!(thread = %id, priority, "nominal priority set");
        self.update_priority(id);
        Ok(())
    }

    /// Block the current thread of `core` on the mutex at `address` held by
    /// `owner`.
    ///
    /// A dead owner can never release, so waiting on it is rejected with
    /// [`KernelError::InvalidState`].
    pub fn wait_for_mutex(
        &mut self,
        core: usize,
        owner: ThreadId,
        address: u64,
        timeout_ns: i64,
    ) -> KernelResult<()> {
        let waiter = self.current_thread(core).ok_or(KernelError::InvalidState)?;
        let owner_thread = self.threads.get(&owner);
        if waiter == owner || owner_thread.is_none() {
            return Err(KernelError::InvalidHandle(0));
        }
        if owner_thread.map_or(false, |t| t.is_dead()) {
            return Err(KernelError::InvalidState);
        }
        if let Some(t) = self.threads.get_mut(&waiter) {
            t.status = ThreadStatus::WaitMutex;
            t.mutex_wait_address = address;
        }
        self.add_mutex_waiter(owner, waiter);
        self.wake_after_delay(waiter, timeout_ns);
        self.request_reschedule(core);
        debug!(thread = %waiter, %owner, address, "waiting for mutex");
        Ok(())
    }

    /// Hand the mutex at `address` from `owner` to its best waiter.
    ///
    /// The remaining waiters for that address move to the new owner, which
    /// is resumed. Returns the new owner, if any thread was waiting.
    pub fn release_mutex(&mut self, owner: ThreadId, address: u64) -> Option<ThreadId> {
        let waiters: Vec<ThreadId> = self
            .threads
            .get(&owner)?
            .wait_mutex_threads
            .iter()
            .copied()
            .filter(|w| self.threads.get(w).map(|t| t.mutex_wait_address) == Some(address))
            .collect();
        let (&next, rest) = waiters.split_first()?;

        for waiter in &waiters {
            self.remove_mutex_waiter(owner, *waiter);
        }
        for waiter in rest {
            self.add_mutex_waiter(next, *waiter);
        }
        if let Some(t) = self.threads.get_mut(&next) {
            t.mutex_wait_address = 0;
            t.set_wait_result(RESULT_SUCCESS, None);
        }
        debug!(%owner, new_owner = %next, address, "mutex handed over");
        self.resume_from_wait(next);
        Some(next)
    }
}
