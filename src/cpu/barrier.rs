//! Lock-step rendezvous for the core loops.

use portable_atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Round {
    waiting: usize,
    generation: u64,
}

/// Barrier the cores meet at once per run-loop iteration.
///
/// With `N` participating cores the first `N - 1` callers of
/// [`rendezvous`](Self::rendezvous) block and the `N`th releases them all.
/// [`notify_end`](Self::notify_end) breaks the barrier for good: parked
/// callers wake at once and every later call returns `false` immediately.
/// In single-core mode the barrier never blocks.
#[derive(Debug)]
pub struct CpuBarrier {
    cores: usize,
    multi_core: bool,
    round: Mutex<Round>,
    condvar: Condvar,
    ended: AtomicBool,
}

impl CpuBarrier {
    /// # Panics
    ///
    /// Panics if `cores` is zero.
    pub fn new(cores: usize, multi_core: bool) -> Self {
        assert!(cores > 0, "barrier needs at least one core");
        Self {
            cores,
            multi_core,
            round: Mutex::new(Round::default()),
            condvar: Condvar::new(),
            ended: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Round> {
        // The round counters stay consistent even if a holder panicked.
        self.round.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for the other cores. Returns `false` once the barrier has ended.
    pub fn rendezvous(&self) -> bool {
        if !self.multi_core || self.is_ended() {
            return !self.is_ended();
        }

        let mut round = self.lock();
        if self.is_ended() {
            return false;
        }
        round.waiting += 1;
        if round.waiting == self.cores {
            round.waiting = 0;
            round.generation = round.generation.wrapping_add(1);
            self.condvar.notify_all();
            return true;
        }

        let generation = round.generation;
        while round.generation == generation && !self.is_ended() {
            round = self
                .condvar
                .wait(round)
                .unwrap_or_else(PoisonError::into_inner);
        }
        round.generation != generation
    }

    /// End the barrier and release every parked caller.
    pub fn notify_end(&self) {
        self.ended.store(true, Ordering::Release);
        let _round = self.lock();
        self.condvar.notify_all();
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    pub fn is_multi_core(&self) -> bool {
        self.multi_core
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portable_atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn single_core_never_blocks() {
        let barrier = CpuBarrier::new(4, false);
        assert!(barrier.rendezvous());
        assert!(barrier.rendezvous());
        barrier.notify_end();
        assert!(!barrier.rendezvous());
    }

    #[test]
    fn last_arrival_releases_the_round() {
        let barrier = Arc::new(CpuBarrier::new(4, true));
        let released = Arc::new(AtomicUsize::new(0));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let released = Arc::clone(&released);
                thread::spawn(move || {
                    assert!(barrier.rendezvous());
                    released.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(released.load(Ordering::SeqCst), 0);
        assert!(barrier.rendezvous());
        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(released.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn rounds_repeat() {
        let barrier = Arc::new(CpuBarrier::new(2, true));
        let other = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || (0..100).all(|_| barrier.rendezvous()))
        };
        assert!((0..100).all(|_| barrier.rendezvous()));
        assert!(other.join().unwrap());
    }

    #[test]
    fn end_releases_parked_callers() {
        let barrier = Arc::new(CpuBarrier::new(4, true));
        let parked: Vec<_> = (0..2)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || barrier.rendezvous())
            })
            .collect();
        thread::sleep(Duration::from_millis(50));
        barrier.notify_end();
        for caller in parked {
            assert!(!caller.join().unwrap());
        }
        assert!(!barrier.rendezvous());
        assert!(barrier.is_ended());
    }
}
