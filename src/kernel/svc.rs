//! Supervisor call dispatch.
//!
//! Both execution backends halt with `SVC` and leave the immediate in
//! [`ArmCore::svc_number`]; the run loop hands it to a [`SvcHandler`]
//! together with the halted core. Arguments and results travel in the
//! guest's general registers.

use super::process::{KernelObject, ProcessId, CURRENT_THREAD_HANDLE};
use super::wait::{EventId, ResetType, SyncObject, WaitOutcome, MAX_WAIT_OBJECTS};
use super::{Kernel, KernelState};
use crate::arch::ArmCore;
use crate::errors::{KernelError, KernelResult, RESULT_SUCCESS};
use crate::thread::{ThreadActivity, ThreadId, ThreadParams};
use std::sync::Arc;
use tracing::{debug, warn};

pub const SVC_CREATE_THREAD: u32 = 0x08;
pub const SVC_START_THREAD: u32 = 0x09;
pub const SVC_EXIT_THREAD: u32 = 0x0A;
pub const SVC_SLEEP_THREAD: u32 = 0x0B;
pub const SVC_GET_THREAD_PRIORITY: u32 = 0x0C;
pub const SVC_SET_THREAD_PRIORITY: u32 = 0x0D;
pub const SVC_GET_THREAD_CORE_MASK: u32 = 0x0E;
pub const SVC_SET_THREAD_CORE_MASK: u32 = 0x0F;
pub const SVC_GET_CURRENT_PROCESSOR_NUMBER: u32 = 0x10;
pub const SVC_SIGNAL_EVENT: u32 = 0x11;
pub const SVC_CLEAR_EVENT: u32 = 0x12;
pub const SVC_CLOSE_HANDLE: u32 = 0x16;
pub const SVC_WAIT_SYNCHRONIZATION: u32 = 0x18;
pub const SVC_SET_THREAD_ACTIVITY: u32 = 0x32;
pub const SVC_CREATE_EVENT: u32 = 0x45;

/// Receiver of guest supervisor calls.
pub trait SvcHandler: Send + Sync {
    /// Handle SVC `number` raised by the current thread of `core`.
    fn call_svc(&self, core: usize, arm: &mut dyn ArmCore, number: u32);
}

fn raw_result<T>(result: &KernelResult<T>) -> u64 {
    match result {
        Ok(_) => u64::from(RESULT_SUCCESS),
        Err(err) => u64::from(err.result_code()),
    }
}

fn set_result(arm: &mut dyn ArmCore, result: KernelResult<()>) {
    arm.set_reg(0, raw_result(&result));
}

impl KernelState {
    fn current_process(&self, core: usize) -> KernelResult<ProcessId> {
        self.current_thread(core)
            .and_then(|id| self.threads.get(&id))
            .map(|t| t.owner)
            .ok_or(KernelError::InvalidState)
    }

    fn resolve(&self, core: usize, handle: u32) -> KernelResult<KernelObject> {
        if handle == CURRENT_THREAD_HANDLE {
            let id = self.current_thread(core).ok_or(KernelError::InvalidState)?;
            return Ok(KernelObject::Thread(id));
        }
        let process = self.current_process(core)?;
        self.processes
            .get(&process)
            .and_then(|p| p.handles().get(handle))
            .ok_or(KernelError::InvalidHandle(handle))
    }

    /// Thread named by `handle` in the process of `core`'s current thread.
    pub fn resolve_thread(&self, core: usize, handle: u32) -> KernelResult<ThreadId> {
        match self.resolve(core, handle)? {
            KernelObject::Thread(id) => Ok(id),
            _ => Err(KernelError::InvalidHandle(handle)),
        }
    }

    pub fn resolve_event(&self, core: usize, handle: u32) -> KernelResult<EventId> {
        match self.resolve(core, handle)? {
            KernelObject::Event(id) => Ok(id),
            _ => Err(KernelError::InvalidHandle(handle)),
        }
    }

    /// Open a handle to `object` in `process`.
    pub fn create_handle(&mut self, process: ProcessId, object: KernelObject) -> KernelResult<u32> {
        let handles = self
            .processes
            .get_mut(&process)
            .ok_or(KernelError::InvalidState)?
            .handles_mut();
        let handle = handles.create(object)?;
        match object {
            KernelObject::Thread(id) => {
                if let Some(t) = self.threads.get_mut(&id) {
                    t.handle_count += 1;
                }
            }
            KernelObject::Event(id) => {
                if let Some(e) = self.events.get_mut(&id) {
                    e.handle_count += 1;
                }
            }
        }
        Ok(handle)
    }

    /// Close `handle` in `process`, releasing the object with its last
    /// reference.
    pub fn close_handle(&mut self, process: ProcessId, handle: u32) -> KernelResult<()> {
        let object = self
            .processes
            .get_mut(&process)
            .ok_or(KernelError::InvalidState)?
            .handles_mut()
            .close(handle)?;
        match object {
            KernelObject::Thread(id) => {
                if let Some(t) = self.threads.get_mut(&id) {
                    t.handle_count = t.handle_count.saturating_sub(1);
                }
                self.reap_threads();
            }
            KernelObject::Event(id) => self.release_event(id),
        }
        Ok(())
    }
}

/// Thread-management supervisor calls.
pub struct ThreadSvcHandler {
    kernel: Arc<Kernel>,
}

impl ThreadSvcHandler {
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self { kernel }
    }

    fn create_thread(&self, core: usize, arm: &mut dyn ArmCore) {
        let params = |owner| {
            ThreadParams::new(owner, arm.reg(1))
                .with_name(format!("guest@{:#x}", arm.reg(1)))
                .with_arg(arm.reg(2))
                .with_stack_top(arm.reg(3))
                .with_priority(arm.reg(4) as u32)
                .with_processor_id(arm.reg(5) as u32 as i32)
        };
        let mut state = self.kernel.lock();
        let result = state.current_process(core).and_then(|owner| {
            let id = state.create_thread(params(owner))?;
            state
                .create_handle(owner, KernelObject::Thread(id))
                .map_err(|err| {
                    if let Err(stop) = state.stop_thread(id) {
                        warn!(thread = %id, error = %stop, "rollback of created thread failed");
                    }
                    state.reap_threads();
                    err
                })
        });
        drop(state);
        arm.set_reg(0, raw_result(&result));
        if let Ok(handle) = result {
            arm.set_reg(1, u64::from(handle));
        }
    }

    fn get_thread_priority(&self, core: usize, arm: &mut dyn ArmCore) {
        let state = self.kernel.lock();
        let result = state
            .resolve_thread(core, arm.reg(1) as u32)
            .and_then(|id| state.thread(id).ok_or(KernelError::InvalidState))
            .map(|t| t.current_priority);
        drop(state);
        arm.set_reg(0, raw_result(&result));
        if let Ok(priority) = result {
            arm.set_reg(1, u64::from(priority));
        }
    }

    fn get_thread_core_mask(&self, core: usize, arm: &mut dyn ArmCore) {
        let state = self.kernel.lock();
        let result = state
            .resolve_thread(core, arm.reg(2) as u32)
            .and_then(|id| state.thread(id).ok_or(KernelError::InvalidState))
            .map(|t| (t.ideal_core, t.affinity_mask));
        drop(state);
        arm.set_reg(0, raw_result(&result));
        if let Ok((ideal, mask)) = result {
            arm.set_reg(1, u64::from(ideal as u32));
            arm.set_reg(2, mask);
        }
    }

    fn wait_synchronization(&self, core: usize, arm: &mut dyn ArmCore) {
        let (ptr, count, timeout) = (arm.reg(1), arm.reg(2) as u32 as usize, arm.reg(3) as i64);
        let mut handles = Vec::with_capacity(count.min(MAX_WAIT_OBJECTS));
        let read: KernelResult<()> = if count > MAX_WAIT_OBJECTS {
            Err(KernelError::OutOfRange)
        } else {
            (0..count as u64).try_for_each(|i| {
                let handle = arm
                    .address_space()
                    .read_u32(ptr + 4 * i)
                    .map_err(|_| KernelError::InvalidAddress(ptr))?;
                handles.push(handle);
                Ok::<(), KernelError>(())
            })
        };

        let mut state = self.kernel.lock();
        let result = read.and_then(|()| {
            let objects = handles
                .iter()
                .map(|handle| -> KernelResult<SyncObject> {
                    match state.resolve(core, *handle)? {
                        KernelObject::Thread(id) => Ok(SyncObject::Thread(id)),
                        KernelObject::Event(id) => Ok(SyncObject::Event(id)),
                    }
                })
                .collect::<KernelResult<Vec<_>>>()?;
            state.wait_synchronization(core, &objects, false, timeout)
        });
        drop(state);

        match result {
            Ok(WaitOutcome::Signaled(index)) => {
                arm.set_reg(0, u64::from(RESULT_SUCCESS));
                arm.set_reg(1, u64::from(index));
            }
            // Delivered when the thread is switched back in.
            Ok(WaitOutcome::Blocked) => {}
            Err(err) => arm.set_reg(0, u64::from(err.result_code())),
        }
    }

    fn create_event(&self, core: usize, arm: &mut dyn ArmCore) {
        let mut state = self.kernel.lock();
        let result = state.current_process(core).and_then(|owner| {
            let event = state.create_event(format!("guest-event-{core}"), ResetType::Sticky);
            let write = state.create_handle(owner, KernelObject::Event(event))?;
            match state.create_handle(owner, KernelObject::Event(event)) {
                Ok(read) => Ok((write, read)),
                Err(err) => {
                    let _ = state.close_handle(owner, write);
                    Err(err)
                }
            }
        });
        drop(state);
        arm.set_reg(0, raw_result(&result));
        if let Ok((write, read)) = result {
            arm.set_reg(1, u64::from(write));
            arm.set_reg(2, u64::from(read));
        }
    }
}

impl SvcHandler for ThreadSvcHandler {
    fn call_svc(&self, core: usize, arm: &mut dyn ArmCore, number: u32) {
        debug!(core, svc = number, pc = arm.pc(), "supervisor call");
        let w = |arm: &dyn ArmCore, index: usize| arm.reg(index) as u32;

        match number {
            SVC_CREATE_THREAD => self.create_thread(core, arm),
            SVC_START_THREAD => {
                let handle = w(arm, 0);
                let mut state = self.kernel.lock();
                let result = state
                    .resolve_thread(core, handle)
                    .and_then(|id| state.start_thread(id));
                drop(state);
                set_result(arm, result);
            }
            SVC_EXIT_THREAD => {
                let mut state = self.kernel.lock();
                if let Err(err) = state.exit_thread(core) {
                    warn!(core, %err, "exit without a current thread");
                }
            }
            SVC_SLEEP_THREAD => {
                let ns = arm.reg(0) as i64;
                if let Err(err) = self.kernel.lock().sleep_thread(core, ns) {
                    warn!(core, %err, "sleep without a current thread");
                }
            }
            SVC_GET_THREAD_PRIORITY => self.get_thread_priority(core, arm),
            SVC_SET_THREAD_PRIORITY => {
                let (handle, priority) = (w(arm, 0), w(arm, 1));
                let mut state = self.kernel.lock();
                let result = state
                    .resolve_thread(core, handle)
                    .and_then(|id| state.set_thread_priority(id, priority));
                drop(state);
                set_result(arm, result);
            }
            SVC_GET_THREAD_CORE_MASK => self.get_thread_core_mask(core, arm),
            SVC_SET_THREAD_CORE_MASK => {
                let (handle, ideal, mask) = (w(arm, 0), w(arm, 1) as i32, arm.reg(2));
                let mut state = self.kernel.lock();
                let result = state
                    .resolve_thread(core, handle)
                    .and_then(|id| state.set_core_and_affinity_mask(id, ideal, mask));
                drop(state);
                set_result(arm, result);
            }
            SVC_GET_CURRENT_PROCESSOR_NUMBER => arm.set_reg(0, core as u64),
            SVC_SIGNAL_EVENT | SVC_CLEAR_EVENT => {
                let handle = w(arm, 0);
                let mut state = self.kernel.lock();
                let result = state.resolve_event(core, handle).and_then(|id| {
                    if number == SVC_SIGNAL_EVENT {
                        state.signal_event(id)
                    } else {
                        state.clear_event(id)
                    }
                });
                drop(state);
                set_result(arm, result);
            }
            SVC_CLOSE_HANDLE => {
                let handle = w(arm, 0);
                let mut state = self.kernel.lock();
                let result = state
                    .current_process(core)
                    .and_then(|process| state.close_handle(process, handle));
                drop(state);
                set_result(arm, result);
            }
            SVC_WAIT_SYNCHRONIZATION => self.wait_synchronization(core, arm),
            SVC_SET_THREAD_ACTIVITY => {
                let (handle, raw) = (w(arm, 0), w(arm, 1));
                let mut state = self.kernel.lock();
                let result = ThreadActivity::from_raw(raw)
                    .ok_or(KernelError::InvalidCombination)
                    .and_then(|activity| {
                        let id = state.resolve_thread(core, handle)?;
                        state.set_thread_activity(id, activity)
                    });
                drop(state);
                set_result(arm, result);
            }
            SVC_CREATE_EVENT => self.create_event(core, arm),
            _ => {
                warn!(core, svc = number, pc = arm.pc(), "unimplemented supervisor call");
                set_result(arm, Err(KernelError::NotImplemented));
            }
        }
    }
}
