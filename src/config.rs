//! Emulation core configuration.
//!
//! [`CoreConfig`] collects the knobs that shape how the cores are driven.
//! It can be built in code with the `with_*` setters or loaded from TOML:
//!
//! ```
//! use guest_smp::config::{Backend, CoreConfig};
//!
//! let config = CoreConfig::from_toml_str(
//!     r#"
//!     use_multi_core = true
//!     slice_ticks = 2000
//!     backend = "translator"
//!     "#,
//! )
//! .unwrap();
//! assert!(config.use_multi_core);
//! assert_eq!(config.backend, Backend::Translator);
//! ```

use crate::errors::ConfigError;
use serde::Deserialize;

/// Number of logical guest cores. Fixed.
pub const NUM_CPU_CORES: usize = 4;

/// Default number of instructions a core retires per lock-step slice.
pub const DEFAULT_SLICE_TICKS: u64 = 10_000;

/// Default number of instructions the interpreter runs per fallback hop.
pub const DEFAULT_FALLBACK_INSTRUCTIONS: usize = 1;

/// Default upper bound on instructions per translated block.
pub const DEFAULT_MAX_BLOCK_INSTRUCTIONS: usize = 64;

/// Which backend executes guest code on each core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Block translator with interpreter fallback
    #[default]
    Translator,
    /// Precise interpreter only
    Interpreter,
}

/// Configuration for the CPU cores and their scheduler loop.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    /// Run secondary cores on their own host threads
    pub use_multi_core: bool,
    /// Tick budget for one slice of one core
    pub slice_ticks: u64,
    /// Instructions executed by the interpreter per fallback round trip
    pub fallback_instructions: usize,
    /// Block size limit for the translator
    pub max_block_instructions: usize,
    /// Backend used for every core
    pub backend: Backend,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            use_multi_core: false,
            slice_ticks: DEFAULT_SLICE_TICKS,
            fallback_instructions: DEFAULT_FALLBACK_INSTRUCTIONS,
            max_block_instructions: DEFAULT_MAX_BLOCK_INSTRUCTIONS,
            backend: Backend::default(),
        }
    }
}

impl CoreConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: CoreConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the run loop cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slice_ticks == 0 {
            return Err(ConfigError::Invalid {
                field: "slice_ticks",
                reason: "must be at least 1".into(),
            });
        }
        if self.fallback_instructions == 0 {
            return Err(ConfigError::Invalid {
                field: "fallback_instructions",
                reason: "must be at least 1".into(),
            });
        }
        if self.max_block_instructions == 0 {
            return Err(ConfigError::Invalid {
                field: "max_block_instructions",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Enable or disable host-parallel execution of secondary cores.
    pub fn with_multi_core(mut self, enabled: bool) -> Self {
        self.use_multi_core = enabled;
        self
    }

    /// Set the per-slice tick budget.
    pub fn with_slice_ticks(mut self, ticks: u64) -> Self {
        self.slice_ticks = ticks;
        self
    }

    /// Set the interpreter fallback width.
    pub fn with_fallback_instructions(mut self, count: usize) -> Self {
        self.fallback_instructions = count;
        self
    }

    /// Set the translator block size limit.
    pub fn with_max_block_instructions(mut self, count: usize) -> Self {
        self.max_block_instructions = count;
        self
    }

    /// Select the backend.
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }
}
