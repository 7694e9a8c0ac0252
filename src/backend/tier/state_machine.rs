//! Per-function execution tier state machine.
//!
//! ## Budgets
//!
//! ```text
//!   limits:  [ Interpreter | AutoProfiling | Profiling | SimpleJit ]
//!            \__________________________ ___________________________/
//!                                       v
//!                               full_jit_threshold
//! ```
//!
//! Each budgeted tier has a remaining iteration limit and the limits always sum
//! to `full_jit_threshold`, the number of iterations left before the function
//! asks for FullJit. Committing executed iterations shrinks the current limit
//! and the threshold by the same amount, so the sum is preserved by
//! construction; rescaling operations recompute the threshold from the limits.
//!
//! Transitions only ever move forward. The one way back to `Interpreter` is
//! [`ExecutionStateMachine::reinitialize`], which also clears every counter.

use tracing::{debug, trace};

use super::{ExecutionTier, TierAvailability};
use crate::backend::config::TieringConfig;

/// Tier bookkeeping for one function unit
#[derive(Debug, Clone)]
pub struct ExecutionStateMachine {
    mode: ExecutionTier,
    availability: TierAvailability,

    /// Remaining budget per tier, indexed by `ExecutionTier as usize`
    limits: [u16; 4],
    full_jit_threshold: u16,

    /// Iterations executed in the current tier and not yet committed
    executed: u32,

    /// Iterations committed while profiling data was being collected
    committed_profiled_iterations: u16,

    full_jit_requeue_threshold: u16,
    configured_requeue_threshold: u16,
    min_simple_jit_iterations: u16,

    loop_interpreter_limit: u32,
    configured_loop_interpreter_limit: u32,

    was_called_from_loop: bool,
    has_hot_loop: bool,

    /// Bumped by every full reset
    generation: u32,
}

impl ExecutionStateMachine {
    /// Fresh state machine for the given policy
    pub fn new(config: &TieringConfig, availability: TierAvailability) -> Self {
        let mut machine = ExecutionStateMachine {
            mode: ExecutionTier::Interpreter,
            availability,
            limits: [0; 4],
            full_jit_threshold: 0,
            executed: 0,
            committed_profiled_iterations: 0,
            full_jit_requeue_threshold: 0,
            configured_requeue_threshold: config.full_jit_requeue_threshold,
            min_simple_jit_iterations: config.min_simple_jit_iterations,
            loop_interpreter_limit: config.loop_interpreter_limit,
            configured_loop_interpreter_limit: config.loop_interpreter_limit,
            was_called_from_loop: false,
            has_hot_loop: false,
            generation: 0,
        };
        machine.initialize(config);
        machine
    }

    fn initialize(&mut self, config: &TieringConfig) {
        let enabled = |tier, limit: u16| {
            if self.availability.is_enabled(tier) {
                limit
            } else {
                0
            }
        };
        self.limits = [
            config.interpreter_limit,
            enabled(
                ExecutionTier::AutoProfilingInterpreter,
                config.auto_profiling_interpreter_limit,
            ),
            enabled(
                ExecutionTier::ProfilingInterpreter,
                config.profiling_interpreter_limit,
            ),
            enabled(ExecutionTier::SimpleJit, config.simple_jit_limit),
        ];
        self.full_jit_threshold = self.limits_sum();
        self.mode = ExecutionTier::Interpreter;
        self.executed = 0;
        self.committed_profiled_iterations = 0;
        self.full_jit_requeue_threshold = 0;
        self.configured_requeue_threshold = config.full_jit_requeue_threshold;
        self.min_simple_jit_iterations = config.min_simple_jit_iterations;
        self.loop_interpreter_limit = config.loop_interpreter_limit;
        self.configured_loop_interpreter_limit = config.loop_interpreter_limit;
        self.was_called_from_loop = false;
        self.has_hot_loop = false;

        if self.limits[ExecutionTier::Interpreter as usize] == 0 {
            self.advance();
        }
        self.verify_limits();
    }

    /// Full reset back to the first interpreter tier
    ///
    /// Used by redeferral and expiration. Per-function tier restrictions are
    /// kept; every counter goes back to zero.
    pub fn reinitialize(&mut self, config: &TieringConfig) {
        let from = self.mode;
        self.generation = self.generation.wrapping_add(1);
        self.initialize(config);
        debug!(
            from = from.name(),
            to = self.mode.name(),
            generation = self.generation,
            "execution mode reinitialized"
        );
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn execution_mode(&self) -> ExecutionTier {
        self.mode
    }

    pub fn availability(&self) -> TierAvailability {
        self.availability
    }

    /// Remaining budget of a tier; FullJit has none
    pub fn limit(&self, tier: ExecutionTier) -> u16 {
        match tier {
            ExecutionTier::FullJit => 0,
            tier => self.limits[tier as usize],
        }
    }

    pub fn full_jit_threshold(&self) -> u16 {
        self.full_jit_threshold
    }

    /// Sum of every tier budget; equals [`full_jit_threshold`](Self::full_jit_threshold)
    pub fn limits_sum(&self) -> u16 {
        self.limits.iter().map(|&l| l as u32).sum::<u32>() as u16
    }

    pub fn executed_iterations(&self) -> u32 {
        self.executed
    }

    pub fn committed_profiled_iterations(&self) -> u16 {
        self.committed_profiled_iterations
    }

    pub fn loop_interpreter_limit(&self) -> u32 {
        self.loop_interpreter_limit
    }

    pub fn full_jit_requeue_threshold(&self) -> u16 {
        self.full_jit_requeue_threshold
    }

    pub fn was_called_from_loop(&self) -> bool {
        self.was_called_from_loop
    }

    pub fn has_hot_loop(&self) -> bool {
        self.has_hot_loop
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Assert the sum invariant (debug builds only)
    pub fn verify_limits(&self) {
        debug_assert_eq!(
            self.limits_sum(),
            self.full_jit_threshold,
            "tier limits {:?} do not sum to full JIT threshold {}",
            self.limits,
            self.full_jit_threshold
        );
    }

    // =========================================================================
    // Counting and transitions
    // =========================================================================

    /// Record iterations (calls or loop back edges) run in the current tier
    #[inline]
    pub fn increment_executed(&mut self, iterations: u32) {
        self.executed = self.executed.saturating_add(iterations);
    }

    /// Move `executed` iterations of `tier`'s budget into the past
    fn commit(&mut self, tier: ExecutionTier, executed: u32) {
        if tier == ExecutionTier::FullJit {
            return;
        }
        let limit = &mut self.limits[tier as usize];
        let clamped = executed.min(*limit as u32) as u16;
        *limit -= clamped;
        debug_assert!(self.full_jit_threshold >= clamped);
        self.full_jit_threshold = self.full_jit_threshold.saturating_sub(clamped);
        if matches!(
            tier,
            ExecutionTier::ProfilingInterpreter | ExecutionTier::SimpleJit
        ) {
            self.committed_profiled_iterations =
                self.committed_profiled_iterations.saturating_add(clamped);
        }
        self.verify_limits();
    }

    /// Commit the current tier's executed iterations against its budget
    pub fn commit_executed_iterations(&mut self) {
        let executed = std::mem::take(&mut self.executed);
        self.commit(self.mode, executed);
    }

    /// First enabled tier after the current one with budget left
    fn next_tier(&self) -> Option<ExecutionTier> {
        ExecutionTier::ALL
            .into_iter()
            .filter(|&tier| tier > self.mode && self.availability.is_enabled(tier))
            .find(|&tier| tier == ExecutionTier::FullJit || self.limit(tier) > 0)
    }

    fn advance(&mut self) -> bool {
        match self.next_tier() {
            Some(next) => {
                trace!(from = self.mode.name(), to = next.name(), "execution mode");
                self.mode = next;
                self.executed = 0;
                true
            }
            None => false,
        }
    }

    /// Advance if the current tier's budget is used up
    ///
    /// Returns whether the mode changed.
    pub fn try_transition_to_next_execution_mode(&mut self) -> bool {
        if self.mode == ExecutionTier::FullJit {
            return false;
        }
        if self.executed < self.limit(self.mode) as u32 {
            self.verify_limits();
            return false;
        }
        self.commit_executed_iterations();
        self.advance()
    }

    /// Advance if due and report whether a JIT compile should be requested
    ///
    /// FullJit requests are throttled by the requeue threshold, which
    /// [`on_full_jit_dequeued`](Self::on_full_jit_dequeued) arms.
    pub fn try_transition_to_jit_execution_mode(&mut self) -> bool {
        self.try_transition_to_next_execution_mode();
        match self.mode {
            ExecutionTier::SimpleJit => true,
            ExecutionTier::FullJit => {
                if self.full_jit_requeue_threshold == 0 {
                    true
                } else {
                    self.full_jit_requeue_threshold -= 1;
                    false
                }
            }
            _ => false,
        }
    }

    /// A FullJit work item left the queue without producing code
    pub fn on_full_jit_dequeued(&mut self) {
        self.full_jit_requeue_threshold = self.configured_requeue_threshold;
    }

    /// Interpreter flavour to run when native code is not used
    ///
    /// After a bailout the profiling interpreter is forced so fresh profile
    /// data is gathered before the next compile.
    pub fn interpreter_execution_mode(&self, is_post_bailout: bool) -> ExecutionTier {
        let profiling = self.availability.profiling;
        if is_post_bailout && profiling {
            return ExecutionTier::ProfilingInterpreter;
        }
        match self.mode {
            ExecutionTier::Interpreter
            | ExecutionTier::AutoProfilingInterpreter
            | ExecutionTier::ProfilingInterpreter => self.mode,
            ExecutionTier::SimpleJit | ExecutionTier::FullJit => {
                if profiling {
                    ExecutionTier::ProfilingInterpreter
                } else {
                    ExecutionTier::Interpreter
                }
            }
        }
    }

    /// Force SimpleJit, discarding the remaining interpreter budgets
    pub fn transition_to_simple_jit_execution_mode(&mut self) {
        self.commit_executed_iterations();
        for tier in [
            ExecutionTier::Interpreter,
            ExecutionTier::AutoProfilingInterpreter,
            ExecutionTier::ProfilingInterpreter,
        ] {
            self.limits[tier as usize] = 0;
        }
        self.full_jit_threshold = self.limits_sum();
        self.mode = ExecutionTier::SimpleJit;
        self.verify_limits();
    }

    /// Force FullJit, discarding every remaining budget
    pub fn transition_to_full_jit_execution_mode(&mut self) {
        self.limits = [0; 4];
        self.full_jit_threshold = 0;
        self.executed = 0;
        self.mode = ExecutionTier::FullJit;
        self.verify_limits();
    }

    // =========================================================================
    // Rescaling
    // =========================================================================

    /// Budget of `tier` that cannot be taken away
    fn floor(&self, tier: ExecutionTier) -> u16 {
        if tier == self.mode {
            self.executed.min(self.limit(tier) as u32) as u16
        } else {
            0
        }
    }

    /// Adjustable tiers ordered from the JIT boundary backwards
    fn adjustable_tiers(&self, include_simple_jit: bool) -> impl Iterator<Item = ExecutionTier> + '_ {
        [
            ExecutionTier::SimpleJit,
            ExecutionTier::AutoProfilingInterpreter,
            ExecutionTier::ProfilingInterpreter,
            ExecutionTier::Interpreter,
        ]
        .into_iter()
        .filter(move |&tier| {
            tier >= self.mode
                && self.availability.is_enabled(tier)
                && (include_simple_jit || tier != ExecutionTier::SimpleJit)
        })
    }

    /// Rescale budgets so that FullJit is requested after `new_threshold` iterations
    ///
    /// Growth goes to the tier closest to the JIT boundary. Shrinking takes
    /// from the same order and never drops below the iterations already run in
    /// the current tier. A SimpleJit budget that is skipped, or ends up too
    /// small to be worth a compile, is folded into the latest interpreter tier
    /// still ahead of the current mode.
    pub fn set_full_jit_threshold(&mut self, new_threshold: u16, skip_simple_jit: bool) {
        debug_assert!(self.mode != ExecutionTier::FullJit);
        if self.mode == ExecutionTier::FullJit {
            return;
        }
        let current = self.full_jit_threshold;

        if new_threshold > current {
            let target = self
                .adjustable_tiers(!skip_simple_jit)
                .next()
                .unwrap_or(self.mode);
            if target != ExecutionTier::FullJit {
                self.limits[target as usize] += new_threshold - current;
            }
        } else if new_threshold < current {
            let mut remaining = current - new_threshold;
            let tiers: Vec<_> = self.adjustable_tiers(true).collect();
            for tier in tiers {
                if remaining == 0 {
                    break;
                }
                let reducible = self.limit(tier) - self.floor(tier);
                let take = reducible.min(remaining);
                self.limits[tier as usize] -= take;
                remaining -= take;
            }
        }

        let simple = self.limit(ExecutionTier::SimpleJit);
        if self.mode < ExecutionTier::SimpleJit
            && simple > 0
            && (skip_simple_jit || simple < self.min_simple_jit_iterations)
        {
            let target = [
                ExecutionTier::ProfilingInterpreter,
                ExecutionTier::AutoProfilingInterpreter,
                ExecutionTier::Interpreter,
            ]
            .into_iter()
            .find(|&tier| tier >= self.mode && self.availability.is_enabled(tier))
            .unwrap_or(self.mode);
            self.limits[ExecutionTier::SimpleJit as usize] = 0;
            self.limits[target as usize] += simple;
        }

        self.full_jit_threshold = self.limits_sum();
        self.verify_limits();
        debug!(
            requested = new_threshold,
            threshold = self.full_jit_threshold,
            skip_simple_jit,
            limits = ?self.limits,
            "full JIT threshold rescaled"
        );
    }

    fn shrink_loop_limit(&mut self, old_threshold: u16, profiled_loop_floor: u32) {
        let scaled = if old_threshold == 0 {
            self.loop_interpreter_limit
        } else {
            (self.loop_interpreter_limit as u64 * self.full_jit_threshold as u64
                / old_threshold as u64) as u32
        };
        self.loop_interpreter_limit = scaled
            .max(profiled_loop_floor)
            .min(self.loop_interpreter_limit);
    }

    /// The function is called from a hot loop; halve the road to FullJit
    ///
    /// One-shot. `profiled_loop_floor` is the largest profiled iteration count
    /// among the function's loops; the loop limit never drops below it.
    pub fn set_was_called_from_loop(&mut self, profiled_loop_floor: u32) -> bool {
        if self.was_called_from_loop {
            return false;
        }
        self.was_called_from_loop = true;
        if self.mode == ExecutionTier::FullJit {
            return true;
        }
        self.commit_executed_iterations();
        let old = self.full_jit_threshold;
        if old > 1 {
            self.set_full_jit_threshold(old / 2, true);
            self.shrink_loop_limit(old, profiled_loop_floor);
        }
        true
    }

    /// The function contains a hot loop; request FullJit as soon as possible
    ///
    /// One-shot, same floor rule as [`set_was_called_from_loop`](Self::set_was_called_from_loop).
    pub fn set_has_hot_loop(&mut self, profiled_loop_floor: u32) -> bool {
        if self.has_hot_loop {
            return false;
        }
        self.has_hot_loop = true;
        if self.mode == ExecutionTier::FullJit {
            return true;
        }
        self.commit_executed_iterations();
        let old = self.full_jit_threshold;
        if old > 1 {
            self.set_full_jit_threshold(1, true);
            self.shrink_loop_limit(old, profiled_loop_floor);
        }
        true
    }

    /// Turn a tier off for this function
    ///
    /// The tier's remaining budget moves to the nearest earlier enabled tier
    /// that has not been passed yet. If the current tier is disabled, its
    /// executed iterations are committed, the rest of its budget is dropped and
    /// the machine advances.
    pub fn disable_tier(&mut self, tier: ExecutionTier) {
        if tier == ExecutionTier::Interpreter || !self.availability.is_enabled(tier) {
            return;
        }
        self.availability.set(tier, false);
        if tier == ExecutionTier::FullJit {
            return;
        }

        if tier == self.mode {
            self.commit_executed_iterations();
            self.limits[tier as usize] = 0;
            self.full_jit_threshold = self.limits_sum();
            self.advance();
        } else {
            let budget = std::mem::take(&mut self.limits[tier as usize]);
            let receiver = ExecutionTier::BUDGETED
                .into_iter()
                .rev()
                .filter(|&t| t < tier && t >= self.mode)
                .find(|&t| self.availability.is_enabled(t));
            if let Some(receiver) = receiver {
                self.limits[receiver as usize] += budget;
            }
            self.full_jit_threshold = self.limits_sum();
        }
        self.verify_limits();
        debug!(tier = tier.name(), mode = self.mode.name(), "tier disabled");
    }
}

// =============================================================================
// Tests
// =============================================================================
