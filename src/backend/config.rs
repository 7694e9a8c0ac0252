//! Tiering configuration.
//!
//! All knobs live in one [`TieringConfig`] loaded from TOML. Every field has a
//! default, so an empty file (or no file at all) yields the stock tiering
//! policy:
//!
//! ```toml
//! interpreter_limit = 4
//! auto_profiling_interpreter_limit = 12
//! profiling_interpreter_limit = 4
//! simple_jit_limit = 80
//! enable_simple_jit = true
//! polymorphic_cache_max_size = 32
//! ```

use std::path::Path;

use serde::Deserialize;

use super::error::ConfigError;

/// Tiering policy and resource limits for one engine
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TieringConfig {
    /// Iterations spent in the plain interpreter
    pub interpreter_limit: u16,

    /// Iterations spent in the auto-profiling interpreter
    pub auto_profiling_interpreter_limit: u16,

    /// Iterations spent in the profiling interpreter
    pub profiling_interpreter_limit: u16,

    /// Iterations spent in SimpleJit code before FullJit is requested
    pub simple_jit_limit: u16,

    /// A SimpleJit budget smaller than this is not worth a compile
    pub min_simple_jit_iterations: u16,

    /// Number of FullJit requests skipped while a FullJit compile is in flight
    pub full_jit_requeue_threshold: u16,

    /// Interpreted iterations of one loop before its body is compiled
    pub loop_interpreter_limit: u32,

    pub enable_auto_profiling: bool,
    pub enable_profiling: bool,
    pub enable_simple_jit: bool,
    pub enable_full_jit: bool,

    /// Initial number of entries in a polymorphic inline cache
    pub polymorphic_cache_min_size: u16,

    /// Polymorphic inline caches never grow past this
    pub polymorphic_cache_max_size: u16,

    /// Calls allowed per bailout before a function entry point is recompiled
    pub calls_to_bailouts_ratio_for_rejit: u32,

    /// Bailouts tolerated from one loop entry point before it is retired
    pub loop_bailouts_before_rejit: u32,

    /// Jitted loop iterations between bailouts that reset the loop bailout count
    pub loop_iterations_between_bailouts: u32,

    /// Constructor cache invalidations before dead unique guards are purged
    pub constructor_cache_invalidation_threshold: u32,

    /// Collections spent in expirable collect mode before unused code expires
    pub expirable_collection_gc_count: u32,

    /// Committed native code size (bytes) that triggers expirable collect mode
    pub expirable_code_size_threshold: usize,

    /// Compile on a background thread; when false work items compile inline
    pub background_compilation: bool,

    /// Capacity of each trace event subscription
    pub event_channel_capacity: usize,

    /// Maximum number of successful compiles per engine
    pub jit_limit: Option<u32>,

    /// Maximum bytes of committed native code
    pub code_heap_capacity: Option<usize>,

    /// Maximum number of live guard registrations in the runtime context
    pub guard_registry_capacity: Option<usize>,

    /// Maximum number of live inline cache entries
    pub inline_cache_capacity: Option<usize>,

    /// Drop the byte code of functions that stop being called
    pub enable_redeferral: bool,

    /// Collections without a call before a function is redeferred
    pub redeferral_inactive_collections: u32,
}

impl Default for TieringConfig {
    fn default() -> Self {
        TieringConfig {
            interpreter_limit: 4,
            auto_profiling_interpreter_limit: 12,
            profiling_interpreter_limit: 4,
            simple_jit_limit: 80,
            min_simple_jit_iterations: 25,
            full_jit_requeue_threshold: 2,
            loop_interpreter_limit: 150,
            enable_auto_profiling: true,
            enable_profiling: true,
            enable_simple_jit: true,
            enable_full_jit: true,
            polymorphic_cache_min_size: 4,
            polymorphic_cache_max_size: 32,
            calls_to_bailouts_ratio_for_rejit: 10,
            loop_bailouts_before_rejit: 2,
            loop_iterations_between_bailouts: 100,
            constructor_cache_invalidation_threshold: 500,
            expirable_collection_gc_count: 20,
            expirable_code_size_threshold: 1 << 20,
            background_compilation: true,
            event_channel_capacity: 1024,
            jit_limit: None,
            code_heap_capacity: None,
            guard_registry_capacity: None,
            inline_cache_capacity: None,
            enable_redeferral: true,
            redeferral_inactive_collections: 5,
        }
    }
}

impl TieringConfig {
    /// Parse a configuration from TOML text and validate it
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: TieringConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Sum of the configured tier budgets
    ///
    /// Disabled tiers contribute nothing.
    pub fn full_jit_threshold(&self) -> u32 {
        let mut sum = self.interpreter_limit as u32;
        if self.enable_auto_profiling {
            sum += self.auto_profiling_interpreter_limit as u32;
        }
        if self.enable_profiling {
            sum += self.profiling_interpreter_limit as u32;
        }
        if self.enable_simple_jit {
            sum += self.simple_jit_limit as u32;
        }
        sum
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.full_jit_threshold() > u16::MAX as u32 {
            return Err(ConfigError::Invalid(format!(
                "tier limits sum to {}, which exceeds {}",
                self.full_jit_threshold(),
                u16::MAX
            )));
        }
        let (min, max) = (
            self.polymorphic_cache_min_size,
            self.polymorphic_cache_max_size,
        );
        if min < 2 || !min.is_power_of_two() || !max.is_power_of_two() || min > max {
            return Err(ConfigError::Invalid(format!(
                "polymorphic cache sizes must be powers of two with 2 <= min <= max (min={}, max={})",
                min, max
            )));
        }
        if self.event_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_channel_capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
