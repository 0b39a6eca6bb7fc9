//! Ownership of all cores and the host threads that drive them.

use super::{Cpu, CpuBarrier};
use crate::arch::ExclusiveMonitor;
use crate::config::{CoreConfig, NUM_CPU_CORES};
use crate::errors::{ConfigError, CpuFault};
use crate::kernel::{Kernel, KernelState, SvcHandler};
use portable_atomic::{AtomicBool, Ordering};
use std::cell::Cell;
use std::io;
use std::panic;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info};

thread_local! {
    static CURRENT_CORE: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Core index the calling host thread is currently driving.
pub fn current_core_index() -> Option<usize> {
    CURRENT_CORE.with(Cell::get)
}

fn set_current_core(core: Option<usize>) {
    CURRENT_CORE.with(|c| c.set(core));
}

/// Ends the barrier if a core thread unwinds, so the others are not left
/// parked on it.
struct EndOnPanic(Arc<CpuBarrier>);

impl Drop for EndOnPanic {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.notify_end();
        }
    }
}

/// Builds the four cores and drives them in single- or multi-core mode.
///
/// In multi-core mode cores 1..4 run on host threads named
/// `cpu-core-{n}` while core 0 runs on whichever thread calls
/// [`run_loop`](Self::run_loop). In single-core mode every core runs on the
/// caller's thread, one after another.
pub struct CpuCoreManager {
    config: CoreConfig,
    kernel: Arc<Kernel>,
    barrier: Arc<CpuBarrier>,
    cpus: Vec<Option<Cpu>>,
    workers: Vec<(usize, JoinHandle<Cpu>)>,
    running: AtomicBool,
}

impl CpuCoreManager {
    pub fn new(
        config: CoreConfig,
        kernel: Arc<Kernel>,
        monitor: Arc<ExclusiveMonitor>,
        svc: Arc<dyn SvcHandler>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let barrier = Arc::new(CpuBarrier::new(NUM_CPU_CORES, config.use_multi_core));
        let cpus = (0..NUM_CPU_CORES)
            .map(|core| {
                Some(Cpu::new(
                    core,
                    config.clone(),
                    Arc::clone(&kernel),
                    Arc::clone(&monitor),
                    Arc::clone(&svc),
                    Arc::clone(&barrier),
                ))
            })
            .collect();
        debug!(
            multi_core = config.use_multi_core,
            backend = ?config.backend,
            "cores created"
        );
        Ok(Self {
            config,
            kernel,
            barrier,
            cpus,
            workers: Vec::new(),
            running: AtomicBool::new(false),
        })
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn barrier(&self) -> &Arc<CpuBarrier> {
        &self.barrier
    }

    pub fn is_multi_core(&self) -> bool {
        self.config.use_multi_core
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Core `index`, unless it is out on a host thread.
    pub fn cpu(&self, index: usize) -> Option<&Cpu> {
        self.cpus.get(index).and_then(Option::as_ref)
    }

    /// Faults of every hard-halted core currently owned by the manager.
    pub fn faults(&self) -> impl Iterator<Item = (usize, &CpuFault)> + '_ {
        self.cpus
            .iter()
            .flatten()
            .filter_map(|cpu| cpu.fault().map(|fault| (cpu.core_index(), fault)))
    }

    /// Start the cores. In multi-core mode this spawns the secondary core
    /// threads and tags the caller as core 0.
    pub fn start(&mut self) -> io::Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if !self.config.use_multi_core {
            info!("cores started in single-core mode");
            return Ok(());
        }

        for core in 1..NUM_CPU_CORES {
            let Some(mut cpu) = self.cpus[core].take() else {
                continue;
            };
            let guard = EndOnPanic(Arc::clone(&self.barrier));
            let spawned = thread::Builder::new()
                .name(format!("cpu-core-{core}"))
                .spawn(move || {
                    let _guard = guard;
                    set_current_core(Some(core));
                    while cpu.run_loop(true) {}
                    debug!(core, "core thread exiting");
                    cpu
                });
            match spawned {
                Ok(handle) => self.workers.push((core, handle)),
                Err(err) => {
                    self.shutdown();
                    return Err(err);
                }
            }
        }
        set_current_core(Some(0));
        info!(cores = NUM_CPU_CORES, "cores started in multi-core mode");
        Ok(())
    }

    /// Run one round. Returns `false` once the cores have been shut down.
    ///
    /// # Panics
    ///
    /// Panics if called before [`start`](Self::start).
    pub fn run_loop(&mut self) -> bool {
        if self.barrier.is_ended() {
            return false;
        }
        assert!(self.is_running(), "cores must be started before running");

        if self.config.use_multi_core {
            return match self.cpus[0].as_mut() {
                Some(cpu) => cpu.run_loop(true),
                None => false,
            };
        }

        let mut alive = true;
        for cpu in self.cpus.iter_mut().flatten() {
            set_current_core(Some(cpu.core_index()));
            alive &= cpu.run_loop(true);
        }
        set_current_core(None);
        alive
    }

    /// Run rounds until `done` holds for the kernel state, the cores shut
    /// down, or `max_rounds` pass. Returns whether `done` was reached.
    pub fn run_until<F>(&mut self, max_rounds: usize, mut done: F) -> bool
    where
        F: FnMut(&KernelState) -> bool,
    {
        for _ in 0..max_rounds {
            if done(&self.kernel.lock()) {
                return true;
            }
            if !self.run_loop() {
                break;
            }
        }
        done(&self.kernel.lock())
    }

    /// Stop every core and join the host threads. Idempotent.
    ///
    /// A panic on a core thread is resumed on the caller.
    pub fn shutdown(&mut self) {
        self.barrier.notify_end();
        self.running.store(false, Ordering::Release);
        for (core, handle) in self.workers.drain(..) {
            match handle.join() {
                Ok(cpu) => self.cpus[core] = Some(cpu),
                Err(payload) => panic::resume_unwind(payload),
            }
        }
        if current_core_index() == Some(0) {
            set_current_core(None);
        }
    }
}

impl Drop for CpuCoreManager {
    fn drop(&mut self) {
        self.barrier.notify_end();
        for (_, handle) in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
