//! Per-core run loop.
//!
//! A [`Cpu`] binds one [`ArmCore`] to its scheduler slot. Each iteration of
//! [`Cpu::run_loop`] meets the other cores at the [`CpuBarrier`], lets the
//! kernel pick the core's thread, executes one slice and reacts to the halt
//! reason. The kernel lock is never held while guest code runs, so SVC
//! handlers and other cores can take it freely.

pub mod barrier;
pub mod manager;

pub use barrier::CpuBarrier;
pub use manager::{current_core_index, CpuCoreManager};

use crate::arch::{new_core, ArmCore, ExclusiveMonitor, HaltReason};
use crate::config::{CoreConfig, NUM_CPU_CORES};
use crate::errors::CpuFault;
use crate::kernel::{Kernel, ProcessId, Selection, SvcHandler};
use crate::mem::AddressSpace;
use crate::thread::ThreadId;
use std::sync::Arc;
use tracing::{debug, error, trace};

/// One emulated core and the state its loop carries between slices.
pub struct Cpu {
    core_index: usize,
    arm: Box<dyn ArmCore>,
    kernel: Arc<Kernel>,
    svc: Arc<dyn SvcHandler>,
    barrier: Arc<CpuBarrier>,
    config: CoreConfig,
    hard_halted: bool,
    fault: Option<CpuFault>,
    current_process: Option<ProcessId>,
}

impl Cpu {
    pub fn new(
        core_index: usize,
        config: CoreConfig,
        kernel: Arc<Kernel>,
        monitor: Arc<ExclusiveMonitor>,
        svc: Arc<dyn SvcHandler>,
        barrier: Arc<CpuBarrier>,
    ) -> Self {
        assert!(core_index < NUM_CPU_CORES, "core {core_index} out of range");
        let arm = new_core(
            config.backend,
            core_index,
            Arc::new(AddressSpace::new()),
            monitor,
            &config,
        );
        kernel
            .lock()
            .register_core(core_index, arm.halt_handle().clone());
        Self {
            core_index,
            arm,
            kernel,
            svc,
            barrier,
            config,
            hard_halted: false,
            fault: None,
            current_process: None,
        }
    }

    pub fn core_index(&self) -> usize {
        self.core_index
    }

    pub fn arm(&self) -> &dyn ArmCore {
        self.arm.as_ref()
    }

    pub fn arm_mut(&mut self) -> &mut dyn ArmCore {
        self.arm.as_mut()
    }

    /// Whether a guest fault stopped this core for good.
    pub fn is_hard_halted(&self) -> bool {
        self.hard_halted
    }

    /// The fault that hard-halted this core.
    pub fn fault(&self) -> Option<&CpuFault> {
        self.fault.as_ref()
    }

    pub fn current_thread(&self) -> Option<ThreadId> {
        self.kernel.lock().current_thread(self.core_index)
    }

    /// Run one iteration. Returns `false` once the barrier has ended.
    ///
    /// `tight` runs the slice with [`ArmCore::run`]; otherwise a single
    /// instruction is stepped.
    pub fn run_loop(&mut self, tight: bool) -> bool {
        if !self.barrier.rendezvous() {
            return false;
        }
        self.reschedule();

        let primary = self.core_index == 0;
        if self.current_thread().is_none() {
            if primary {
                self.kernel.time().idle();
                self.kernel.dispatch_timer_events();
            }
        } else {
            if primary {
                self.kernel.dispatch_timer_events();
            }
            if !self.hard_halted {
                self.execute(tight);
            }
        }

        self.reschedule();
        true
    }

    fn execute(&mut self, tight: bool) {
        let Some(thread) = self.current_thread() else {
            return;
        };
        let time = Arc::clone(self.kernel.time());
        let budget = self.config.slice_ticks.min(time.downcount()).max(1);
        self.arm.set_ticks_remaining(budget);

        let halt = if tight { self.arm.run() } else { self.arm.step() };

        let retired = budget.saturating_sub(self.arm.ticks_remaining());
        time.add_ticks((retired / NUM_CPU_CORES as u64).max(1));
        self.kernel.lock().account_ticks(thread, retired);
        trace!(
            core = self.core_index,
            %thread,
            retired,
            halt = ?halt,
            "slice done"
        );

        if halt.is_fault() {
            self.hard_halt(thread);
        } else if halt.contains(HaltReason::SVC) {
            let number = self.arm.svc_number();
            self.svc.call_svc(self.core_index, self.arm.as_mut(), number);
        }
    }

    fn hard_halt(&mut self, thread: ThreadId) {
        self.hard_halted = true;
        let fault = self.arm.take_fault();
        match &fault {
            Some(fault) => {
                error!(core = self.core_index, %thread, %fault, "guest fault, core halted");
                debug!(core = self.core_index, context = ?fault.context(), "faulting context");
            }
            None => error!(core = self.core_index, %thread, "core halted without a fault record"),
        }
        if let Some(t) = self.kernel.lock().thread_mut(thread) {
            self.arm.save_context(&mut t.context);
        }
        self.fault = fault;
    }

    /// Let the kernel pick or confirm this core's thread and switch the
    /// backend to it.
    pub fn reschedule(&mut self) {
        if self.hard_halted {
            return;
        }
        let mut state = self.kernel.lock();
        self.arm.halt_handle().clear(HaltReason::RESCHEDULE);

        let Selection::Switch { prev, next } = state.select_next(self.core_index) else {
            return;
        };
        if let Some(prev) = prev {
            if let Some(thread) = state.thread_mut(prev) {
                self.arm.save_context(&mut thread.context);
            }
        }

        if let Some(next) = next {
            let owner = state.switch_in(next).map(|t| t.owner);
            if let Some(owner) = owner.filter(|o| self.current_process != Some(*o)) {
                if let Some(process) = state.process(owner) {
                    self.arm.page_table_changed(Arc::clone(process.space()));
                }
                self.current_process = Some(owner);
            }
            if let Some(thread) = state.thread(next) {
                self.arm.load_context(&thread.context);
            }
        }
        self.arm.clear_exclusive_state();
        state.reap_threads();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backend;
    use crate::kernel::tests::{kernel_with_process, spawn_dormant, ENTRY};
    use crate::kernel::ThreadSvcHandler;
    use crate::tests::asm;
    use crate::thread::ThreadStatus;

    struct Fixture {
        kernel: Arc<Kernel>,
        cpu: Cpu,
        process: ProcessId,
    }

    fn fixture(backend: Backend, program: &[u32]) -> Fixture {
        let (kernel, process) = kernel_with_process();
        let kernel = Arc::new(kernel);
        {
            let state = kernel.lock();
            let space = state.process(process).unwrap().space();
            for (i, word) in program.iter().enumerate() {
                space.write_u32(ENTRY + 4 * i as u64, *word).unwrap();
            }
        }
        let svc: Arc<dyn SvcHandler> = Arc::new(ThreadSvcHandler::new(Arc::clone(&kernel)));
        let cpu = Cpu::new(
            0,
            CoreConfig::default().with_backend(backend),
            Arc::clone(&kernel),
            Arc::new(ExclusiveMonitor::new()),
            svc,
            Arc::new(CpuBarrier::new(NUM_CPU_CORES, false)),
        );
        Fixture {
            kernel,
            cpu,
            process,
        }
    }

    #[test]
    fn thread_runs_to_exit_and_is_reaped() {
        for backend in [Backend::Translator, Backend::Interpreter] {
            let mut f = fixture(
                backend,
                &[asm::movz(0, 5, 0), asm::add_imm(0, 0, 1), asm::svc(0x0A)],
            );
            let id = {
                let mut state = f.kernel.lock();
                let id = spawn_dormant(&mut state, f.process, 0, 30);
                state.start_thread(id).unwrap();
                id
            };

            assert!(f.cpu.run_loop(true));
            let state = f.kernel.lock();
            assert!(state.thread(id).is_none(), "{backend:?}");
            assert!(!state.has_live_threads());
            assert_eq!(f.cpu.arm().reg(0), 6);
        }
    }

    #[test]
    fn switch_in_loads_thread_address_space() {
        let mut f = fixture(Backend::Interpreter, &[asm::b(0)]);
        {
            let mut state = f.kernel.lock();
            let id = spawn_dormant(&mut state, f.process, 0, 30);
            state.start_thread(id).unwrap();
        }
        f.cpu.reschedule();
        let state = f.kernel.lock();
        let space = state.process(f.process).unwrap().space();
        assert!(Arc::ptr_eq(f.cpu.arm().address_space(), space));
        assert_eq!(f.cpu.arm().pc(), ENTRY);
    }

    #[test]
    fn stepping_retires_one_instruction() {
        let mut f = fixture(Backend::Translator, &[asm::nop(), asm::nop(), asm::b(-8)]);
        let id = {
            let mut state = f.kernel.lock();
            let id = spawn_dormant(&mut state, f.process, 0, 30);
            state.start_thread(id).unwrap();
            id
        };
        assert!(f.cpu.run_loop(false));
        assert!(f.cpu.run_loop(false));
        let state = f.kernel.lock();
        assert_eq!(state.thread(id).unwrap().total_ticks, 2);
        assert_eq!(f.cpu.arm().pc(), ENTRY + 8);
    }

    #[test]
    fn breakpoint_hard_halts_core() {
        let mut f = fixture(Backend::Translator, &[asm::nop(), asm::brk(7)]);
        let id = {
            let mut state = f.kernel.lock();
            let id = spawn_dormant(&mut state, f.process, 0, 30);
            state.start_thread(id).unwrap();
            id
        };

        assert!(f.cpu.run_loop(true));
        assert!(f.cpu.is_hard_halted());
        match f.cpu.fault() {
            Some(CpuFault::Breakpoint { imm, context }) => {
                assert_eq!(*imm, 7);
                assert_eq!(context.pc, ENTRY + 4);
            }
            other => panic!("unexpected fault {other:?}"),
        }

        let ticks = f.kernel.lock().thread(id).unwrap().total_ticks;
        assert!(f.cpu.run_loop(true));
        let state = f.kernel.lock();
        let thread = state.thread(id).unwrap();
        assert_eq!(thread.total_ticks, ticks);
        assert_eq!(thread.status, ThreadStatus::Running);
    }

    #[test]
    fn ended_barrier_stops_loop() {
        let mut f = fixture(Backend::Interpreter, &[asm::b(0)]);
        f.cpu.barrier.notify_end();
        assert!(!f.cpu.run_loop(true));
    }
}
