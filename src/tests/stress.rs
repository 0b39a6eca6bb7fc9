//! Multi-core stress scenarios.

#[cfg(test)]
mod stress_tests {
    use crate::arch::{ArmCore, ExclusiveMonitor};
    use crate::config::{Backend, CoreConfig, NUM_CPU_CORES};
    use crate::cpu::{current_core_index, CpuBarrier, CpuCoreManager};
    use crate::kernel::{SvcHandler, ThreadSvcHandler};
    use crate::tests::asm::*;
    use crate::tests::helpers::{Guest, CODE, DATA};
    use crate::tests::{init_tracing, TEST_CONFIG};
    use portable_atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    /// Increment the word at x0 `count` times with LDXR/STXR, then exit.
    fn exclusive_increment(count: u16) -> [u32; 8] {
        [
            movz(2, count, 0),
            ldxr_w(1, 0),
            add_imm(1, 1, 1),
            stxr_w(3, 1, 0),
            cbnz_w(3, -12),
            sub_imm(2, 2, 1),
            cbnz(2, -20),
            svc(0x0A),
        ]
    }

    fn increment_from_every_core(config: CoreConfig) {
        init_tracing();
        let count = TEST_CONFIG.increments_per_core;
        let guest = Guest::new();
        guest.load(CODE, &exclusive_increment(count));
        for core in 0..NUM_CPU_CORES {
            guest.spawn(CODE, 30, core as i32, DATA);
        }

        let mut cores = guest.cores(config);
        cores.start().unwrap();
        let done = cores.run_until(TEST_CONFIG.max_rounds, |state| !state.has_live_threads());
        cores.shutdown();

        assert!(done, "guest threads did not finish");
        assert_eq!(cores.faults().count(), 0);
        assert_eq!(
            guest.read_u32(DATA),
            u32::from(count) * NUM_CPU_CORES as u32
        );
    }

    #[test]
    fn exclusive_increment_across_host_threads() {
        increment_from_every_core(CoreConfig::default().with_multi_core(true));
    }

    #[test]
    fn exclusive_increment_interleaved_on_one_thread() {
        increment_from_every_core(
            CoreConfig::default()
                .with_backend(Backend::Interpreter)
                .with_slice_ticks(7),
        );
    }

    struct CoreTagCheck {
        inner: ThreadSvcHandler,
        calls: AtomicUsize,
        mismatches: AtomicUsize,
    }

    impl SvcHandler for CoreTagCheck {
        fn call_svc(&self, core: usize, arm: &mut dyn ArmCore, number: u32) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if current_core_index() != Some(core) {
                self.mismatches.fetch_add(1, Ordering::SeqCst);
            }
            self.inner.call_svc(core, arm, number);
        }
    }

    #[test]
    fn supervisor_calls_run_on_their_core_thread() {
        init_tracing();
        let guest = Guest::new();
        // Yield 20 times, then exit.
        guest.load(
            CODE,
            &[
                movz(5, 20, 0),
                movz(0, 0, 0),
                svc(0x0B),
                sub_imm(5, 5, 1),
                cbnz(5, -12),
                svc(0x0A),
            ],
        );
        for core in 0..NUM_CPU_CORES {
            guest.spawn(CODE, 30, core as i32, 0);
        }
        let check = Arc::new(CoreTagCheck {
            inner: ThreadSvcHandler::new(Arc::clone(&guest.kernel)),
            calls: AtomicUsize::new(0),
            mismatches: AtomicUsize::new(0),
        });
        let mut cores = CpuCoreManager::new(
            CoreConfig::default().with_multi_core(true),
            Arc::clone(&guest.kernel),
            Arc::new(ExclusiveMonitor::new()),
            Arc::clone(&check) as Arc<dyn SvcHandler>,
        )
        .unwrap();
        cores.start().unwrap();
        assert!(cores.run_until(TEST_CONFIG.max_rounds, |state| !state.has_live_threads()));
        cores.shutdown();

        assert_eq!(check.calls.load(Ordering::SeqCst), NUM_CPU_CORES * 21);
        assert_eq!(check.mismatches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn barrier_keeps_cores_in_lock_step() {
        let rounds = TEST_CONFIG.barrier_rounds;
        let barrier = Arc::new(CpuBarrier::new(NUM_CPU_CORES, true));
        let arrivals = Arc::new(AtomicUsize::new(0));
        let cores: Vec<_> = (0..NUM_CPU_CORES)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let arrivals = Arc::clone(&arrivals);
                thread::spawn(move || {
                    for round in 0..rounds {
                        arrivals.fetch_add(1, Ordering::SeqCst);
                        assert!(barrier.rendezvous());
                        // Nobody can start the next round before all arrive.
                        let seen = arrivals.load(Ordering::SeqCst);
                        assert!(seen >= (round + 1) * NUM_CPU_CORES);
                        assert!(seen <= (round + 2) * NUM_CPU_CORES);
                    }
                })
            })
            .collect();
        for core in cores {
            core.join().unwrap();
        }
        assert_eq!(arrivals.load(Ordering::SeqCst), rounds * NUM_CPU_CORES);
    }

    #[test]
    fn shutdown_releases_cores_parked_mid_run() {
        let guest = Guest::new();
        guest.load(CODE, &[b(0)]);
        guest.spawn(CODE, 30, 1, 0);
        let mut cores = guest.cores(CoreConfig::default().with_multi_core(true));
        cores.start().unwrap();
        for _ in 0..10 {
            assert!(cores.run_loop());
        }
        cores.shutdown();
        assert!(!cores.run_loop());
        assert!(guest.kernel.lock().has_live_threads());
    }
}
