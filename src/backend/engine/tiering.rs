//! Call and loop counting that drives functions up the execution tiers.
//!
//! Every interpreted call charges one iteration to the function's
//! [`ExecutionStateMachine`](crate::backend::tier::ExecutionStateMachine).
//! Once a budget runs out the machine advances, and on reaching a JIT tier the
//! default entry point is dispatched. Loops count back edges separately; a loop
//! that reaches the loop interpreter limit gets its own FullJit loop body.

use tracing::{debug, trace};

use super::Engine;
use crate::backend::codegen::JobId;
use crate::backend::entry_point::{CallTarget, EntryPointId, EntryPointState, NativeAddress};
use crate::backend::error::{EngineResult, EntryPointError, ScriptError};
use crate::backend::function::FunctionId;
use crate::backend::guards::TypeRef;
use crate::backend::inline_cache::{CacheLookup, CacheSource, InlineCacheKey};
use crate::backend::tier::{ExecutionTier, JitTier};

impl Engine {
    /// Account one call of `function` and return what the call runs
    ///
    /// A deferred function is parsed first. Installed native code records
    /// the call for expiration. Every call outside FullJit is charged to the
    /// current tier's budget, SimpleJit native code included, and may request
    /// a compile.
    pub fn on_function_call(&mut self, function: FunctionId) -> EngineResult<CallTarget> {
        self.ensure_parsed(function)?;

        let unit = self
            .functions
            .get_mut(function)
            .ok_or(EntryPointError::UnknownFunction)?;
        unit.mark_called();
        let running = [unit.default_entry_point(), unit.simple_jit_entry_point()]
            .into_iter()
            .flatten()
            .find(|&ep| {
                self.entry_points
                    .get(ep)
                    .is_some_and(|ep| ep.native_address().is_some())
            });
        if let Some(ep) = running.and_then(|ep| self.entry_points.get_mut(ep)) {
            ep.record_call();
        }

        let machine = unit.state_machine_mut();
        let from = machine.execution_mode();
        if from != ExecutionTier::FullJit {
            machine.increment_executed(1);
        }
        let wants_jit = machine.try_transition_to_jit_execution_mode();
        let to = machine.execution_mode();
        let enabled = machine.availability().is_enabled(to);
        self.note_tier_change(function, from, "budget exhausted");

        if wants_jit && enabled {
            if let Some(tier) = to.jit_tier() {
                if let Err(err) = self.request_jit(function, tier) {
                    debug!(?function, ?tier, %err, "JIT request dropped");
                }
            }
        }
        Ok(self
            .call_target(function)
            .ok_or(EntryPointError::UnknownFunction)?)
    }

    /// Make sure the default entry point is compiling or compiled at `tier`
    ///
    /// Returns the job if a compile was queued. A function whose default entry
    /// point already runs SimpleJit code gets a fresh default entry point for
    /// FullJit; the SimpleJit one stays callable until that installs.
    pub fn request_jit(&mut self, function: FunctionId, tier: JitTier) -> EngineResult<Option<JobId>> {
        let default = self.function_ref(function)?.default_entry_point();
        let current = default.and_then(|id| {
            self.entry_points
                .get(id)
                .map(|ep| (id, ep.state(), ep.jit_tier()))
        });
        let entry_point = match current {
            None => self.create_entry_point(function)?,
            Some((id, EntryPointState::NotScheduled, _)) => id,
            Some((_, EntryPointState::CodeGenDone, Some(JitTier::SimpleJit)))
                if tier == JitTier::FullJit =>
            {
                self.create_entry_point(function)?
            }
            Some((id, state, installed)) => {
                trace!(?function, entry_point = ?id, %state, ?installed, ?tier, "JIT already requested");
                return Ok(None);
            }
        };
        self.dispatch(entry_point, tier).map(Some)
    }

    /// Count `iterations` back edges of loop `loop_number`
    ///
    /// Returns the native address to jump to when the loop has installed
    /// jitted code. Interpreted iterations past the loop interpreter limit
    /// mark the function as having a hot loop and queue a loop body compile.
    pub fn on_loop_iterations(
        &mut self,
        function: FunctionId,
        loop_number: u32,
        iterations: u32,
    ) -> EngineResult<Option<NativeAddress>> {
        let unit = self
            .functions
            .get_mut(function)
            .ok_or(EntryPointError::UnknownFunction)?;
        let mode = unit.state_machine().execution_mode();
        let limit = unit.state_machine().loop_interpreter_limit();
        let full_jit = unit
            .state_machine()
            .availability()
            .is_enabled(ExecutionTier::FullJit);
        let body = unit.body_mut().ok_or(EntryPointError::NotParsed)?;
        let header = body
            .loop_header_mut(loop_number)
            .ok_or(EntryPointError::UnknownLoop(loop_number))?;

        if let Some(current) = header.current_entry_point() {
            if let Some(ep) = self.entry_points.get_mut(current) {
                if let Some(address) = ep.native_address() {
                    ep.record_loop_iterations(iterations);
                    return Ok(Some(address));
                }
            }
            // Still compiling
            header.interpret_count = header.interpret_count.saturating_add(iterations);
            return Ok(None);
        }

        header.interpret_count = header.interpret_count.saturating_add(iterations);
        if mode == ExecutionTier::ProfilingInterpreter {
            header.profiled_loop_counter = header.profiled_loop_counter.saturating_add(iterations);
        }
        if header.interpret_count < limit || !full_jit {
            return Ok(None);
        }
        header.interpret_count = 0;
        let floor = body.max_profiled_loop_counter();
        unit.state_machine_mut().set_has_hot_loop(floor);
        self.note_tier_change(function, mode, "hot loop");

        debug!(?function, loop_number, "loop body hot");
        let entry_point = self.create_loop_entry_point(function, loop_number)?;
        self.dispatch(entry_point, JitTier::FullJit)?;
        Ok(None)
    }

    /// Count iterations run inside jitted loop code
    pub fn on_jitted_loop_iterations(&mut self, entry_point: EntryPointId, iterations: u32) -> EngineResult<()> {
        self.entry_point_mut(entry_point)?
            .record_loop_iterations(iterations);
        Ok(())
    }

    /// `function` was called from a hot loop; shorten its road to FullJit
    pub fn on_called_from_loop(&mut self, function: FunctionId) -> EngineResult<bool> {
        let unit = self.function_mut(function)?;
        let floor = unit.body().map_or(0, |body| body.max_profiled_loop_counter());
        let from = unit.state_machine().execution_mode();
        let changed = unit.state_machine_mut().set_was_called_from_loop(floor);
        self.note_tier_change(function, from, "called from loop");
        Ok(changed)
    }

    // =========================================================================
    // Inline caches
    // =========================================================================

    /// Record a property access at inline cache `index` of `function`
    pub fn record_inline_cache_access(
        &mut self,
        function: FunctionId,
        index: u32,
        type_ref: TypeRef,
        slot_index: u16,
        source: CacheSource,
    ) -> EngineResult<CacheLookup> {
        let table = self
            .functions
            .get_mut(function)
            .ok_or(EntryPointError::UnknownFunction)?
            .body_mut()
            .ok_or(EntryPointError::NotParsed)?
            .inline_caches_mut();
        let lookup = match table.key(index) {
            InlineCacheKey::Root { .. } => table.record_root_access(
                index,
                type_ref,
                slot_index,
                source,
                &mut self.root,
                &self.runtime,
            ),
            InlineCacheKey::Function { .. } => table.record_access(
                index,
                type_ref,
                slot_index,
                source,
                &self.runtime,
                &self.config,
            ),
        };
        Ok(lookup.map_err(ScriptError::from)?)
    }

    /// Record an is-instance check at inline cache `index` of `function`
    pub fn record_is_inst(
        &mut self,
        function: FunctionId,
        index: u32,
        function_type: TypeRef,
        instance_type: TypeRef,
        result: bool,
    ) -> EngineResult<CacheLookup> {
        let table = self
            .functions
            .get_mut(function)
            .ok_or(EntryPointError::UnknownFunction)?
            .body_mut()
            .ok_or(EntryPointError::NotParsed)?
            .inline_caches_mut();
        let lookup = table.record_is_inst(index, function_type, instance_type, result, &self.runtime);
        Ok(lookup.map_err(ScriptError::from)?)
    }
}
