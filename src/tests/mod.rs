//! Crate-level scenario tests and shared test tooling.

pub mod helpers;
mod integration;
mod stress;

use tracing_subscriber::EnvFilter;

/// Knobs for the heavier scenarios.
pub struct TestConfig {
    /// LDXR/STXR increments each core performs
    pub increments_per_core: u16,
    /// Round limit before a scenario is declared stuck
    pub max_rounds: usize,
    /// Rendezvous rounds in the barrier stress test
    pub barrier_rounds: usize,
}

pub const TEST_CONFIG: TestConfig = TestConfig {
    increments_per_core: 1000,
    max_rounds: 100_000,
    barrier_rounds: 2_000,
};

/// Route `tracing` output through the test harness. Filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
