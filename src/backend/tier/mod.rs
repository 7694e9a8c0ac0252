//! Execution tiers and per-function tier availability.
//!
//! ```text
//! Interpreter -> AutoProfilingInterpreter -> ProfilingInterpreter -> SimpleJit -> FullJit
//!  (no profile)   (profiles loops only)      (full profile)         (fast JIT)   (optimizing)
//! ```
//!
//! Every tier but FullJit owns an iteration budget; the budgets are tracked by
//! [`ExecutionStateMachine`].

pub mod state_machine;

pub use state_machine::ExecutionStateMachine;

use super::config::TieringConfig;

/// One rung of the interpreter to JIT ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ExecutionTier {
    Interpreter = 0,
    AutoProfilingInterpreter = 1,
    ProfilingInterpreter = 2,
    SimpleJit = 3,
    FullJit = 4,
}

impl From<u8> for ExecutionTier {
    fn from(v: u8) -> Self {
        match v {
            0 => ExecutionTier::Interpreter,
            1 => ExecutionTier::AutoProfilingInterpreter,
            2 => ExecutionTier::ProfilingInterpreter,
            3 => ExecutionTier::SimpleJit,
            _ => ExecutionTier::FullJit,
        }
    }
}

impl ExecutionTier {
    /// All tiers in promotion order
    pub const ALL: [ExecutionTier; 5] = [
        ExecutionTier::Interpreter,
        ExecutionTier::AutoProfilingInterpreter,
        ExecutionTier::ProfilingInterpreter,
        ExecutionTier::SimpleJit,
        ExecutionTier::FullJit,
    ];

    /// Tiers that carry an iteration budget
    pub const BUDGETED: [ExecutionTier; 4] = [
        ExecutionTier::Interpreter,
        ExecutionTier::AutoProfilingInterpreter,
        ExecutionTier::ProfilingInterpreter,
        ExecutionTier::SimpleJit,
    ];

    pub fn is_interpreter(self) -> bool {
        self < ExecutionTier::SimpleJit
    }

    pub fn is_jit(self) -> bool {
        !self.is_interpreter()
    }

    /// JIT flavour for this tier, if it runs native code
    pub fn jit_tier(self) -> Option<JitTier> {
        match self {
            ExecutionTier::SimpleJit => Some(JitTier::SimpleJit),
            ExecutionTier::FullJit => Some(JitTier::FullJit),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ExecutionTier::Interpreter => "Interpreter",
            ExecutionTier::AutoProfilingInterpreter => "AutoProfilingInterpreter",
            ExecutionTier::ProfilingInterpreter => "ProfilingInterpreter",
            ExecutionTier::SimpleJit => "SimpleJit",
            ExecutionTier::FullJit => "FullJit",
        }
    }
}

/// Which JIT produced an entry point's code
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JitTier {
    SimpleJit,
    FullJit,
}

impl From<JitTier> for ExecutionTier {
    fn from(tier: JitTier) -> Self {
        match tier {
            JitTier::SimpleJit => ExecutionTier::SimpleJit,
            JitTier::FullJit => ExecutionTier::FullJit,
        }
    }
}

/// Tiers a function may use
///
/// Starts from the configuration and narrows per function (for example when
/// SimpleJit fails for it). The plain interpreter is always available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierAvailability {
    pub auto_profiling: bool,
    pub profiling: bool,
    pub simple_jit: bool,
    pub full_jit: bool,
}

impl Default for TierAvailability {
    fn default() -> Self {
        TierAvailability {
            auto_profiling: true,
            profiling: true,
            simple_jit: true,
            full_jit: true,
        }
    }
}

impl TierAvailability {
    pub fn from_config(config: &TieringConfig) -> Self {
        TierAvailability {
            auto_profiling: config.enable_auto_profiling,
            profiling: config.enable_profiling,
            simple_jit: config.enable_simple_jit,
            full_jit: config.enable_full_jit,
        }
    }

    /// Interpreter tiers only
    pub fn interpreted_only() -> Self {
        TierAvailability {
            simple_jit: false,
            full_jit: false,
            ..Default::default()
        }
    }

    pub fn is_enabled(&self, tier: ExecutionTier) -> bool {
        match tier {
            ExecutionTier::Interpreter => true,
            ExecutionTier::AutoProfilingInterpreter => self.auto_profiling,
            ExecutionTier::ProfilingInterpreter => self.profiling,
            ExecutionTier::SimpleJit => self.simple_jit,
            ExecutionTier::FullJit => self.full_jit,
        }
    }

    pub(crate) fn set(&mut self, tier: ExecutionTier, enabled: bool) {
        match tier {
            ExecutionTier::Interpreter => {}
            ExecutionTier::AutoProfilingInterpreter => self.auto_profiling = enabled,
            ExecutionTier::ProfilingInterpreter => self.profiling = enabled,
            ExecutionTier::SimpleJit => self.simple_jit = enabled,
            ExecutionTier::FullJit => self.full_jit = enabled,
        }
    }
}
