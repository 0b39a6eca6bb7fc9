//! Guest programs driven end to end through the core manager.

#[cfg(test)]
mod lifecycle_tests {
    use crate::config::CoreConfig;
    use crate::errors::KernelError;
    use crate::kernel::{KernelObject, ResetType, SyncObject};
    use crate::tests::asm::*;
    use crate::tests::helpers::{Guest, CODE, DATA};
    use crate::tests::init_tracing;
    use crate::thread::ThreadStatus;
    use crate::time::ns_to_ticks;

    /// `movz rd, #DATA`
    fn data_base(rd: u8) -> u32 {
        movz(rd, (DATA >> 16) as u16, 16)
    }

    #[test]
    fn sleeping_thread_wakes_after_delay() {
        init_tracing();
        let guest = Guest::new();
        guest.load(
            CODE,
            &[
                movz(0, 0x4240, 0),
                movk(0, 0xF, 16),
                svc(0x0B),
                data_base(1),
                movz(2, 1, 0),
                str_x(2, 1, 0),
                svc(0x0A),
            ],
        );
        let id = guest.spawn(CODE, 30, 0, 0);
        let mut cores = guest.cores(CoreConfig::default());
        cores.start().unwrap();

        assert!(cores.run_until(4, |state| {
            state.thread(id).map(|t| t.status) == Some(ThreadStatus::WaitSleep)
        }));
        assert_eq!(guest.read_u64(DATA), 0);

        assert!(cores.run_until(100, |state| !state.has_live_threads()));
        assert_eq!(guest.read_u64(DATA), 1);
        assert!(guest.kernel.time().ticks() >= ns_to_ticks(1_000_000));
    }

    /// Wait on the handles at `DATA` and store x0 and x1 at `DATA + 8` and
    /// `DATA + 16`.
    fn wait_program(count: u16, timeout: u32) -> Vec<u32> {
        let mut program = vec![data_base(1), movz(2, count, 0)];
        if timeout == u32::MAX {
            program.push(movn(3, 0, 0));
        } else {
            program.push(movz(3, timeout as u16, 0));
            program.push(movk(3, (timeout >> 16) as u16, 16));
        }
        program.extend([
            svc(0x18),
            data_base(4),
            str_x(0, 4, 8),
            str_x(1, 4, 16),
            svc(0x0A),
        ]);
        program
    }

    #[test]
    fn event_wakes_waiter_with_signaled_index() {
        init_tracing();
        let guest = Guest::new();
        let (first, second) = {
            let mut state = guest.kernel.lock();
            (
                state.create_event("first", ResetType::OneShot),
                state.create_event("second", ResetType::OneShot),
            )
        };
        let handles = [
            guest.handle(KernelObject::Event(first)),
            guest.handle(KernelObject::Event(second)),
        ];
        for (i, handle) in handles.iter().enumerate() {
            guest.space.write_u32(DATA + 4 * i as u64, *handle).unwrap();
        }
        guest.load(CODE, &wait_program(2, u32::MAX));
        let id = guest.spawn(CODE, 30, 1, 0);
        let mut cores = guest.cores(CoreConfig::default());
        cores.start().unwrap();

        assert!(cores.run_until(4, |state| {
            state.thread(id).map(|t| t.status) == Some(ThreadStatus::WaitSynchAny)
        }));
        guest.kernel.lock().signal_event(second).unwrap();

        assert!(cores.run_until(8, |state| !state.has_live_threads()));
        assert_eq!(guest.read_u64(DATA + 8), 0);
        assert_eq!(guest.read_u64(DATA + 16), 1);
        assert!(!guest.kernel.lock().is_signaled(SyncObject::Event(second)));
    }

    #[test]
    fn timed_out_wait_reports_timeout() {
        init_tracing();
        let guest = Guest::new();
        let event = guest.kernel.lock().create_event("never", ResetType::Sticky);
        let handle = guest.handle(KernelObject::Event(event));
        guest.space.write_u32(DATA, handle).unwrap();
        guest.load(CODE, &wait_program(1, 50_000));
        guest.spawn(CODE, 30, 0, 0);
        let mut cores = guest.cores(CoreConfig::default());
        cores.start().unwrap();

        assert!(cores.run_until(100, |state| !state.has_live_threads()));
        assert_eq!(
            guest.read_u64(DATA + 8),
            u64::from(KernelError::TimedOut.result_code())
        );
        assert!(guest.kernel.time().ticks() >= ns_to_ticks(50_000));
    }

    #[test]
    fn pinned_thread_never_runs_elsewhere() {
        init_tracing();
        let guest = Guest::new();
        // Yield 100 times, then exit.
        guest.load(
            CODE,
            &[
                movz(5, 100, 0),
                movz(0, 0, 0),
                svc(0x0B),
                sub_imm(5, 5, 1),
                cbnz(5, -12),
                svc(0x0A),
            ],
        );
        let pinned = guest.spawn(CODE, 30, 2, 0);
        let floating: Vec<_> = (0..3).map(|_| guest.spawn(CODE, 30, 0, 0)).collect();
        {
            let mut state = guest.kernel.lock();
            for id in &floating {
                state.set_core_and_affinity_mask(*id, 2, 0b1111).unwrap();
            }
        }
        let mut cores = guest.cores(CoreConfig::default());
        cores.start().unwrap();

        let mut rounds = 0;
        loop {
            {
                let state = guest.kernel.lock();
                for core in [0, 1, 3] {
                    assert_ne!(state.current_thread(core), Some(pinned), "core {core}");
                }
                if !state.has_live_threads() {
                    break;
                }
            }
            assert!(cores.run_loop());
            rounds += 1;
            assert!(rounds < 5_000, "threads did not finish");
        }
    }

    #[test]
    fn created_thread_runs_with_its_argument() {
        init_tracing();
        let guest = Guest::new();
        let child = CODE + 0x100;
        // Parent: CreateThread(entry = child, arg = 0x55, prio 20, core 1),
        // StartThread(handle), exit.
        guest.load(
            CODE,
            &[
                movz(1, (child & 0xFFFF) as u16, 0),
                movk(1, (child >> 16) as u16, 16),
                movz(2, 0x55, 0),
                movz(3, 0, 0),
                movz(4, 20, 0),
                movz(5, 1, 0),
                svc(0x08),
                mov_reg(0, 1),
                svc(0x09),
                svc(0x0A),
            ],
        );
        // Child: store x0 and the current core number, exit.
        guest.load(
            child,
            &[
                data_base(6),
                str_x(0, 6, 0),
                svc(0x10),
                str_x(0, 6, 8),
                svc(0x0A),
            ],
        );
        guest.spawn(CODE, 30, 0, 0);
        let mut cores = guest.cores(CoreConfig::default());
        cores.start().unwrap();

        assert!(cores.run_until(50, |state| !state.has_live_threads()));
        assert_eq!(guest.read_u64(DATA), 0x55);
        assert_eq!(guest.read_u64(DATA + 8), 1);
    }

    #[test]
    fn guest_fault_halts_only_its_core() {
        init_tracing();
        let guest = Guest::new();
        let worker = CODE + 0x100;
        guest.load(CODE, &[movz(1, 0x30, 16), ldr_x(0, 1, 0), svc(0x0A)]);
        guest.load(worker, &[data_base(1), movz(2, 9, 0), str_x(2, 1, 0), svc(0x0A)]);
        let faulting = guest.spawn(CODE, 30, 1, 0);
        let healthy = guest.spawn(worker, 30, 3, 0);
        let mut cores = guest.cores(CoreConfig::default());
        cores.start().unwrap();

        assert!(cores.run_until(10, |state| state.thread(healthy).is_none()));
        assert_eq!(guest.read_u64(DATA), 9);

        let faults: Vec<_> = cores.faults().collect();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].0, 1);
        assert_eq!(faults[0].1.context().pc, CODE + 4);
        assert!(cores.cpu(1).unwrap().is_hard_halted());
        assert_eq!(
            guest.kernel.lock().thread(faulting).unwrap().status,
            ThreadStatus::Running
        );
    }
}
