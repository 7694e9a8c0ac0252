//! Entry point lifecycle: dispatch, install, invalidation and cleanup.
//!
//! ```text
//!  create ─► NotScheduled ─dispatch─► CodeGenPending ─► CodeGenQueued
//!                 ▲                                        │      │
//!                 │ rollback                        record │      │ jit limit
//!                 │                                        ▼      ▼
//!                 └──────────────────────────── CodeGenRecorded  JitCapReached
//!                                                          │
//!                                          install         ▼
//!                                                     CodeGenDone
//!                                                          │ invalidate / expire / retire
//!                                                          ▼
//!                                                   PendingCleanup ─► CleanedUp
//! ```
//!
//! Native code is allocated on the mutator when a completion is recorded, so a
//! completion that arrives for a retired entry point is simply dropped.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::Engine;
use crate::backend::codegen::{CodeGenCompletion, CodeGenOutput, JobId, WorkItem};
use crate::backend::entry_point::{
    CallTarget, CleanupReason, EntryPoint, EntryPointId, EntryPointState, NativeAddress,
    NativeCodeBuffer, RecordedCode, ThunkKind, ThunkSelector,
};
use crate::backend::error::{CodegenError, CodegenResult, EngineResult, EntryPointError};
use crate::backend::function::FunctionId;
use crate::backend::guards::{PropertyGuard, PropertyId, TypeRef};
use crate::backend::inline_cache::{EntryPointPolymorphicInlineCacheInfo, InlineCacheKey};
use crate::backend::offset_map::{NativeThrowMap, SpanCursor};
use crate::backend::tier::{ExecutionTier, JitTier};
use crate::backend::trace::TraceEvent;
use crate::backend::transfer::process_transfer_package;

/// What one checkpoint did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointReport {
    pub installed: Vec<EntryPointId>,
    pub rolled_back: Vec<EntryPointId>,
    pub failed: Vec<(EntryPointId, CleanupReason)>,
    pub stale: usize,
    pub freed: usize,
}

/// Return address of an on-stack frame to redirect into its bailout thunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LazyBailoutPatch {
    pub entry_point: EntryPointId,
    pub return_address: NativeAddress,
    pub bailout_target: NativeAddress,
}

/// Result of charging a bailout to an entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BailoutOutcome {
    /// The entry point was invalidated and a recompile requested
    pub rejit: bool,
    /// Interpreter flavour execution resumes in
    pub resume_tier: ExecutionTier,
}

impl Engine {
    // =========================================================================
    // Creation and dispatch
    // =========================================================================

    /// New default function-level entry point for `function`
    pub fn create_entry_point(&mut self, function: FunctionId) -> EngineResult<EntryPointId> {
        self.function_ref(function)?;
        let config = &self.config;
        let id = self
            .entry_points
            .insert_with(|id| EntryPoint::new_function(id, function, config));
        let unit = self.function_mut(function)?;
        unit.add_entry_point(id);
        unit.set_default_entry_point(Some(id));
        trace!(?function, entry_point = ?id, "entry point created");
        Ok(id)
    }

    /// New entry point for the body of loop `loop_number`
    pub fn create_loop_entry_point(
        &mut self,
        function: FunctionId,
        loop_number: u32,
    ) -> EngineResult<EntryPointId> {
        let body = self
            .function_ref(function)?
            .body()
            .ok_or(EntryPointError::NotParsed)?;
        if body.loop_header(loop_number).is_none() {
            return Err(EntryPointError::UnknownLoop(loop_number).into());
        }
        let id = self
            .entry_points
            .insert_with(|id| EntryPoint::new_loop(id, function, loop_number));
        if let Some(header) = self
            .function_mut(function)?
            .body_mut()
            .and_then(|body| body.loop_header_mut(loop_number))
        {
            header.entry_points.push(id);
        }
        trace!(?function, loop_number, entry_point = ?id, "loop entry point created");
        Ok(id)
    }

    /// Snapshot what the compile needs and queue it
    pub fn dispatch(&mut self, entry_point: EntryPointId, tier: JitTier) -> EngineResult<JobId> {
        let (function, loop_number) = {
            let ep = self.entry_point_ref(entry_point)?;
            (ep.function(), ep.loop_number())
        };
        let job = self.codegen.next_job_id();
        let unit = self.function_ref(function)?;
        let body = unit.body().ok_or(EntryPointError::NotParsed)?;
        let table = body.inline_caches();

        let mut shared_guards = HashMap::new();
        for property in table.properties() {
            match self.runtime.register_shared_property_guard(property) {
                Ok(guard) => {
                    shared_guards.insert(property, guard);
                }
                Err(err) => trace!(%property, %err, "no shared guard for property"),
            }
        }

        let mut polymorphic = EntryPointPolymorphicInlineCacheInfo::new(function);
        for (index, cache) in table.polymorphic_caches() {
            polymorphic.set_polymorphic_inline_cache(
                function,
                index,
                Arc::clone(cache),
                table.utilization(index),
            );
        }
        // FullJit inlines nested functions, so their caches belong to this
        // entry point too.
        if tier == JitTier::FullJit && loop_number.is_none() {
            for &nested in unit.nested() {
                let Some(nested_body) = self.functions.get(nested).and_then(|u| u.body()) else {
                    continue;
                };
                let nested_table = nested_body.inline_caches();
                for (index, cache) in nested_table.polymorphic_caches() {
                    polymorphic.set_polymorphic_inline_cache(
                        nested,
                        index,
                        Arc::clone(cache),
                        nested_table.utilization(index),
                    );
                }
            }
        }

        let mut snapshot: Vec<(PropertyId, PropertyGuard)> = shared_guards
            .iter()
            .map(|(property, guard)| (*property, guard.clone()))
            .collect();
        snapshot.sort_by_key(|(property, _)| *property);

        let item = WorkItem {
            job,
            entry_point,
            function,
            function_name: Arc::clone(unit.name()),
            tier,
            loop_number,
            byte_code: Arc::clone(body.byte_code()),
            statement_count: body.statement_map().len() as u32,
            inline_cache_count: table.len() as u32,
            shared_guards: snapshot,
        };

        let ep = self.entry_point_mut(entry_point)?;
        ep.mark_pending(shared_guards, polymorphic)?;
        ep.mark_queued(job, tier)?;

        if let Err(err) = self.codegen.submit(item) {
            warn!(?entry_point, %err, "compile queue closed");
            self.retire_entry_point(entry_point, CleanupReason::from(&err));
            return Err(EntryPointError::QueueClosed.into());
        }
        self.stats.dispatches += 1;
        debug!(?function, ?entry_point, ?tier, %job, "compile queued");
        self.emit(TraceEvent::CompileQueued {
            entry_point,
            tier,
            job,
        });
        Ok(job)
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Drain finished compiles, install their results and free retired
    /// entry points if outside script
    pub fn checkpoint(&mut self) -> CheckpointReport {
        let completions = self.codegen.drain();
        self.complete_all(completions)
    }

    /// Like [`checkpoint`](Self::checkpoint) but waits for every compile in
    /// flight
    pub fn wait_for_compiles(&mut self) -> CheckpointReport {
        let completions = self.codegen.wait_all();
        self.complete_all(completions)
    }

    fn complete_all(&mut self, completions: Vec<CodeGenCompletion>) -> CheckpointReport {
        let mut report = CheckpointReport::default();
        for completion in completions {
            self.complete(completion, &mut report);
        }
        report.freed = self.process_pending_cleanup();
        report
    }

    fn complete(&mut self, completion: CodeGenCompletion, report: &mut CheckpointReport) {
        let CodeGenCompletion {
            job,
            entry_point,
            tier,
            result,
        } = completion;

        let current = self
            .entry_points
            .get(entry_point)
            .filter(|ep| ep.state() == EntryPointState::CodeGenQueued && ep.job() == Some(job));
        let Some(ep) = current else {
            trace!(?entry_point, %job, "stale completion dropped");
            self.stats.stale_completions += 1;
            report.stale += 1;
            return;
        };
        let function = ep.function();
        self.emit(TraceEvent::CompileFinished {
            entry_point,
            job,
            succeeded: result.is_ok(),
        });

        let result = result.and_then(|output| self.record_output(entry_point, output));
        match result {
            Ok(()) => match self.ensure_is_ready_to_call(entry_point) {
                Ok(true) => report.installed.push(entry_point),
                Ok(false) => report.rolled_back.push(entry_point),
                Err(err) => warn!(?entry_point, %err, "install skipped"),
            },
            Err(CodegenError::ExceedJitLimit) => {
                if let Some(ep) = self.entry_points.get_mut(entry_point) {
                    if let Err(err) = ep.mark_jit_cap_reached() {
                        warn!(?entry_point, %err, "JIT cap state not recorded");
                    }
                }
                if let Some(unit) = self.functions.get_mut(function) {
                    let machine = unit.state_machine_mut();
                    machine.disable_tier(ExecutionTier::SimpleJit);
                    machine.disable_tier(ExecutionTier::FullJit);
                }
                self.stats.jit_cap_reached += 1;
                debug!(?function, ?entry_point, "JIT limit reached");
                report
                    .failed
                    .push((entry_point, CleanupReason::CodeGenFailedExceedJitLimit));
            }
            Err(err) => {
                let reason = CleanupReason::from(&err);
                self.fail_compile(entry_point, function, tier, &err);
                report.failed.push((entry_point, reason));
            }
        }
    }

    /// Commit backend output into native memory and attach it
    fn record_output(&mut self, entry_point: EntryPointId, output: CodeGenOutput) -> CodegenResult<()> {
        let allocation = self.code_allocator.allocate(output.code.len())?;
        let recorded = RecordedCode {
            buffer: NativeCodeBuffer::new(allocation, output.code, output.unwind),
            transfer: output.transfer,
            throw_map: NativeThrowMap::from_entries(output.throw_map),
            lazy_bailout_records: output.lazy_bailout_records,
        };
        self.entry_points
            .get_mut(entry_point)
            .ok_or_else(|| CodegenError::InstallFailure("entry point freed".to_string()))?
            .record(recorded)
            .map_err(|err| CodegenError::InstallFailure(err.to_string()))
    }

    fn fail_compile(
        &mut self,
        entry_point: EntryPointId,
        function: FunctionId,
        tier: JitTier,
        err: &CodegenError,
    ) {
        self.stats.codegen_failures += 1;
        warn!(?function, ?entry_point, ?tier, %err, "code generation failed");
        if let Some(unit) = self.functions.get_mut(function) {
            match tier {
                // SimpleJit is an optimization of the way to FullJit; do not
                // keep retrying it.
                JitTier::SimpleJit => {
                    let from = unit.state_machine().execution_mode();
                    unit.state_machine_mut().disable_tier(ExecutionTier::SimpleJit);
                    self.note_tier_change(function, from, "SimpleJit failed");
                }
                JitTier::FullJit => unit.state_machine_mut().on_full_jit_dequeued(),
            }
        }
        self.retire_entry_point(entry_point, CleanupReason::from(err));
        self.refresh_call_sites(function);
    }

    /// Process the transfer package and install the recorded code
    ///
    /// The package is taken exactly once: later calls return `Ok(false)`
    /// without touching anything. A failed transfer rolls the entry point
    /// back to `NotScheduled`.
    pub fn ensure_is_ready_to_call(&mut self, entry_point: EntryPointId) -> EngineResult<bool> {
        let ep = self
            .entry_points
            .get_mut(entry_point)
            .ok_or(EntryPointError::StaleHandle)?;
        let Some(package) = ep.take_transfer_package() else {
            return Ok(false);
        };
        match process_transfer_package(package, entry_point, ep.shared_guards(), &self.runtime) {
            Ok(guards) => {
                ep.set_transferred_guards(guards);
                let target = ep.install(&self.thunks, &mut self.stats)?;
                self.on_installed(entry_point, target);
                Ok(true)
            }
            Err(err) => {
                let function = ep.function();
                let tier = ep.jit_tier();
                ep.rollback(&self.runtime, &self.code_allocator)?;
                self.stats.rollbacks += 1;
                warn!(?entry_point, %err, "install rolled back");
                if tier == Some(JitTier::FullJit) {
                    if let Some(unit) = self.functions.get_mut(function) {
                        unit.state_machine_mut().on_full_jit_dequeued();
                    }
                }
                self.emit(TraceEvent::Rollback { entry_point });
                self.refresh_call_sites(function);
                Ok(false)
            }
        }
    }

    fn on_installed(&mut self, entry_point: EntryPointId, target: CallTarget) {
        let Some(ep) = self.entry_points.get_mut(entry_point) else {
            return;
        };
        let function = ep.function();
        let is_loop = ep.is_loop();
        let tier = ep.jit_tier();
        let old = ep.take_old_entry_point();
        let address = target.native().unwrap_or(NativeAddress::new(0));
        let size = ep.native_size();
        self.emit(TraceEvent::Installed {
            entry_point,
            address,
            size,
        });

        if !is_loop {
            if let Some(unit) = self.functions.get_mut(function) {
                if tier == Some(JitTier::SimpleJit) {
                    unit.set_simple_jit_entry_point(Some(entry_point));
                }
                unit.set_post_bailout(false);
            }
            self.refresh_call_sites(function);
        }
        if let Some(old) = old {
            self.retire_entry_point(old, CleanupReason::Invalidated);
        }
    }

    // =========================================================================
    // Call targets
    // =========================================================================

    /// What a call of `function` runs right now
    ///
    /// The default entry point if installed, else a still-valid SimpleJit
    /// entry point, else the interpreter or deferred-parse thunk.
    pub fn call_target(&self, function: FunctionId) -> Option<CallTarget> {
        let unit = self.functions.get(function)?;
        let installed = |ep: Option<EntryPointId>| {
            ep.and_then(|ep| self.entry_points.get(ep))
                .filter(|ep| ep.native_address().is_some())
                .map(EntryPoint::call_target)
        };
        Some(
            installed(unit.default_entry_point())
                .or_else(|| installed(unit.simple_jit_entry_point()))
                .unwrap_or_else(|| {
                    let default_state = unit
                        .default_entry_point()
                        .and_then(|ep| self.entry_points.get(ep))
                        .map(|ep| ep.call_target());
                    match default_state {
                        Some(target @ CallTarget::Thunk(ThunkKind::RecompileRequested)) => target,
                        _ => unit.thunk_target(),
                    }
                }),
        )
    }

    /// Point every bound function object type at the current call target
    pub(crate) fn refresh_call_sites(&mut self, function: FunctionId) {
        if let Some(target) = self.call_target(function) {
            if let Some(unit) = self.functions.get_mut(function) {
                unit.redirect_call_sites(target);
            }
        }
    }

    /// Bind a function object type to `function`'s call target
    pub fn bind_function_object_type(&mut self, function: FunctionId, type_ref: TypeRef) -> EngineResult<CallTarget> {
        let target = self
            .call_target(function)
            .ok_or(EntryPointError::UnknownFunction)?;
        self.function_mut(function)?
            .bind_function_object_type(type_ref, target);
        Ok(target)
    }

    /// Attach or detach the profiler and debugger thunks
    ///
    /// Every installed entry point is re-selected and call sites follow.
    pub fn set_thunk_selector(&mut self, selector: ThunkSelector) {
        if self.thunks == selector {
            return;
        }
        self.thunks = selector;
        for handle in self.entry_points.handles() {
            if let Some(ep) = self.entry_points.get_mut(handle) {
                if let Some(address) = ep.native_address() {
                    ep.set_call_target(selector.select(address));
                }
            }
        }
        for function in self.functions.handles() {
            self.refresh_call_sites(function);
        }
        debug!(?selector, "thunk selector changed");
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Stop using `entry_point` and schedule a recompile
    ///
    /// With `prolong_current` the invalidated code stays allocated (frames may
    /// still be running it) until the replacement installs. Returns the
    /// replacement, if one was created or already pending.
    pub fn invalidate(
        &mut self,
        entry_point: EntryPointId,
        prolong_current: bool,
    ) -> EngineResult<Option<EntryPointId>> {
        let ep = self.entry_point_mut(entry_point)?;
        if ep.state().is_retired() {
            return Ok(None);
        }
        drop(ep.take_transfer_package());
        let function = ep.function();
        let tier = ep.jit_tier().unwrap_or(JitTier::FullJit);
        let loop_number = ep.loop_number();

        self.stats.invalidations += 1;
        debug!(?function, ?entry_point, prolong_current, "entry point invalidated");
        self.emit(TraceEvent::Invalidated {
            entry_point,
            prolonged: prolong_current,
        });

        if let Some(loop_number) = loop_number {
            self.retire_entry_point(entry_point, CleanupReason::Invalidated);
            self.reset_loop_header(function, loop_number);
            return Ok(None);
        }

        let unit = self
            .functions
            .get_mut(function)
            .ok_or(EntryPointError::UnknownFunction)?;
        if unit.simple_jit_entry_point() == Some(entry_point) {
            unit.set_simple_jit_entry_point(None);
        }
        let was_default = unit.default_entry_point() == Some(entry_point);
        let pending = unit
            .default_entry_point()
            .filter(|&d| d != entry_point)
            .filter(|&d| {
                self.entry_points
                    .get(d)
                    .is_some_and(|ep| ep.native_address().is_none() && !ep.state().is_retired())
            });

        let replacement = match (pending, was_default) {
            (Some(pending), _) => Some(pending),
            (None, true) => {
                let replacement = self.create_entry_point(function)?;
                let enabled = self
                    .function_ref(function)?
                    .state_machine()
                    .availability()
                    .is_enabled(tier.into());
                if enabled {
                    if let Err(err) = self.dispatch(replacement, tier) {
                        debug!(?replacement, %err, "replacement not dispatched");
                    }
                }
                Some(replacement)
            }
            (None, false) => None,
        };

        let parked = match (prolong_current, replacement) {
            (true, Some(replacement)) => match self.entry_points.get_mut(replacement) {
                Some(rep) if !rep.state().is_retired() => {
                    if let Some(previous) = rep.old_entry_point().filter(|&p| p != entry_point) {
                        self.retire_entry_point(previous, CleanupReason::Invalidated);
                    }
                    if let Some(rep) = self.entry_points.get_mut(replacement) {
                        rep.set_old_entry_point(Some(entry_point));
                    }
                    true
                }
                _ => false,
            },
            _ => false,
        };
        if parked {
            // Still owned through the replacement's old link; no longer
            // reachable from the function.
            if let Some(unit) = self.functions.get_mut(function) {
                unit.remove_entry_point(entry_point);
            }
            if let Some(ep) = self.entry_points.get_mut(entry_point) {
                ep.set_call_target(CallTarget::Thunk(ThunkKind::RecompileRequested));
            }
        } else {
            self.retire_entry_point(entry_point, CleanupReason::Invalidated);
        }
        self.refresh_call_sites(function);
        Ok(replacement)
    }

    pub(super) fn reset_loop_header(&mut self, function: FunctionId, loop_number: u32) {
        if let Some(header) = self
            .functions
            .get_mut(function)
            .and_then(|unit| unit.body_mut())
            .and_then(|body| body.loop_header_mut(loop_number))
        {
            header.interpret_count = 0;
        }
    }

    /// Invalidate guards on `property`
    ///
    /// Entry points registered for lazy bailout are invalidated (prolonged,
    /// since they may be on the stack) and each return address in `frames`
    /// that falls inside one of them gets a patch to its bailout thunk.
    pub fn invalidate_property_guards(
        &mut self,
        property: PropertyId,
        frames: &[NativeAddress],
    ) -> Vec<LazyBailoutPatch> {
        let lazy = self.runtime.invalidate_property_guards(property);
        let mut patches = Vec::new();
        for entry_point in lazy {
            let Some(ep) = self.entry_points.get_mut(entry_point) else {
                continue;
            };
            ep.mark_lazy_bailout();
            for &return_address in frames {
                if let Some(bailout_target) = ep.lazy_bailout_target(return_address) {
                    patches.push(LazyBailoutPatch {
                        entry_point,
                        return_address,
                        bailout_target,
                    });
                }
            }
            self.stats.lazy_bailouts += 1;
            if let Err(err) = self.invalidate(entry_point, true) {
                debug!(?entry_point, %err, "lazy bailout invalidation skipped");
            }
        }
        debug!(%property, patches = patches.len(), "property guards invalidated");
        patches
    }

    /// Clear every proto and store-field inline cache registered for
    /// `property`; returns how many caches were cleared
    pub fn invalidate_proto_caches(&mut self, property: PropertyId) -> usize {
        let mut keys = self.runtime.invalidate_proto_inline_caches(property);
        keys.extend(self.runtime.invalidate_store_field_inline_caches(property));
        let count = keys.len();
        self.clear_inline_caches(keys);
        trace!(%property, count, "proto caches invalidated");
        count
    }

    /// Clear every is-instance cache keyed on `function_type`
    pub fn invalidate_is_inst_caches(&mut self, function_type: TypeRef) -> usize {
        let keys = self.runtime.invalidate_is_inst_inline_caches(function_type);
        let count = keys.len();
        self.clear_inline_caches(keys);
        count
    }

    fn clear_inline_caches(&mut self, keys: Vec<InlineCacheKey>) {
        for key in keys {
            match key {
                InlineCacheKey::Function { function, index } => {
                    if let Some(body) = self.functions.get_mut(function).and_then(|u| u.body_mut()) {
                        body.inline_caches_mut().clear_cache(index);
                    }
                }
                InlineCacheKey::Root { property, kind } => self.root.clear_cache(property, kind),
            }
        }
    }

    /// Drop dead types from every equivalent-type cache
    ///
    /// Guards bound to a dead type are invalidated. Returns the number of
    /// caches that still hold a type.
    pub fn sweep_equivalent_type_caches(&mut self, is_live: &dyn Fn(TypeRef) -> bool) -> usize {
        let mut surviving = 0;
        for entry_point in self.runtime.equivalent_type_cache_entry_points() {
            let Some(ep) = self.entry_points.get_mut(entry_point) else {
                continue;
            };
            for cache in ep.guards_mut().equivalent_type_caches_mut() {
                if cache.clear_unused_types(is_live) {
                    surviving += 1;
                }
            }
        }
        self.runtime.clear_invalidated_unique_guards();
        surviving
    }

    // =========================================================================
    // Bailouts
    // =========================================================================

    /// Charge a bailout from `entry_point`'s code
    ///
    /// Each bailout costs `calls_to_bailouts_ratio_for_rejit + 1` calls; once
    /// the budget is gone the entry point is invalidated (prolonged) and
    /// recompiled.
    pub fn on_bailout(&mut self, entry_point: EntryPointId) -> EngineResult<BailoutOutcome> {
        if self.entry_point_ref(entry_point)?.is_loop() {
            let rejit = self.on_loop_bailout(entry_point)?;
            let function = self.entry_point_ref(entry_point)?.function();
            let resume_tier = self
                .function_ref(function)?
                .state_machine()
                .interpreter_execution_mode(true);
            return Ok(BailoutOutcome { rejit, resume_tier });
        }
        self.stats.bailouts += 1;
        let decrement = self.config.calls_to_bailouts_ratio_for_rejit + 1;
        let ep = self.entry_point_mut(entry_point)?;
        let function = ep.function();
        let rejit = ep.on_bailout(decrement);

        let unit = self.function_mut(function)?;
        unit.set_post_bailout(true);
        let resume_tier = unit.state_machine().interpreter_execution_mode(true);
        if rejit {
            self.stats.bailout_rejits += 1;
            debug!(?function, ?entry_point, "bailouts exhausted call budget, rejitting");
            self.invalidate(entry_point, true)?;
        }
        Ok(BailoutOutcome { rejit, resume_tier })
    }

    /// Charge a bailout from a loop body; returns whether it was retired
    pub fn on_loop_bailout(&mut self, entry_point: EntryPointId) -> EngineResult<bool> {
        self.stats.bailouts += 1;
        let config = &self.config;
        let ep = self
            .entry_points
            .get_mut(entry_point)
            .ok_or(EntryPointError::StaleHandle)?;
        if !ep.on_loop_bailout(config) {
            return Ok(false);
        }
        let function = ep.function();
        let loop_number = ep.loop_number().unwrap_or(0);
        self.stats.loop_retirements += 1;
        debug!(?function, loop_number, ?entry_point, "loop body retired after bailouts");
        self.retire_entry_point(entry_point, CleanupReason::LoopRetired);
        self.reset_loop_header(function, loop_number);
        Ok(true)
    }

    // =========================================================================
    // Native address queries
    // =========================================================================

    /// Entry point whose native code contains `address`
    pub fn entry_point_at(&self, address: NativeAddress) -> Option<EntryPointId> {
        self.entry_points
            .iter()
            .find(|(_, ep)| ep.native_code().is_some_and(|code| code.contains(address)))
            .map(|(id, _)| id)
    }

    /// Function and statement executing at `address`
    pub fn statement_at_native_address(
        &self,
        address: NativeAddress,
        cursor: &mut SpanCursor,
    ) -> Option<(FunctionId, u32)> {
        let entry_point = self.entry_point_at(address)?;
        let ep = self.entry_points.get(entry_point)?;
        let statement = ep.statement_index_from_native_address(address, cursor)?;
        Some((ep.function(), statement))
    }

    // =========================================================================
    // Retirement and deferred free
    // =========================================================================

    /// Detach `entry_point` from its function and queue it for freeing
    ///
    /// A queued compile is cancelled. An entry point parked as the "old" link
    /// of this one is retired with it.
    pub(crate) fn retire_entry_point(&mut self, entry_point: EntryPointId, reason: CleanupReason) {
        let Some(ep) = self.entry_points.get_mut(entry_point) else {
            return;
        };
        if ep.state().is_retired() {
            return;
        }
        if let Some(job) = ep.job() {
            self.codegen.cancel(job);
        }
        let old = ep.take_old_entry_point();
        let function = ep.function();
        if ep.retire().is_err() {
            return;
        }
        if let Some(unit) = self.functions.get_mut(function) {
            unit.remove_entry_point(entry_point);
        }
        self.pending_cleanup.push((entry_point, reason));
        trace!(?entry_point, ?reason, "entry point retired");
        if let Some(old) = old {
            self.retire_entry_point(old, reason);
        }
    }

    /// Free retired entry points if no script is running
    pub fn process_pending_cleanup(&mut self) -> usize {
        if self.script_depth > 0 {
            return 0;
        }
        self.free_pending(|_, _| true)
    }

    pub(crate) fn free_pending(&mut self, select: impl Fn(EntryPointId, CleanupReason) -> bool) -> usize {
        let (freeing, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_cleanup)
            .into_iter()
            .partition(|&(ep, reason)| select(ep, reason));
        self.pending_cleanup = keep;

        let capture = self.capture_cleanup_backtraces;
        let mut freed = 0;
        for (entry_point, reason) in freeing {
            let Some(mut ep) = self.entry_points.remove(entry_point) else {
                continue;
            };
            if ep.cleanup(false, capture, reason, &self.runtime, &self.code_allocator) {
                freed += 1;
                self.stats.cleanups += 1;
                self.emit(TraceEvent::CleanedUp {
                    entry_point,
                    reason,
                });
            }
        }
        if freed > 0 {
            debug!(freed, "retired entry points freed");
        }
        freed
    }

    /// Enter a script frame; deferred frees wait until the outermost frame
    /// leaves
    pub fn enter_script(&mut self) {
        self.script_depth += 1;
    }

    /// Leave a script frame, freeing retired entry points at depth zero
    pub fn leave_script(&mut self) -> usize {
        debug_assert!(self.script_depth > 0, "leave_script without enter_script");
        self.script_depth = self.script_depth.saturating_sub(1);
        self.process_pending_cleanup()
    }

    pub fn script_depth(&self) -> u32 {
        self.script_depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::codegen::{SyntheticBackend, SyntheticOptions};
    use crate::backend::config::TieringConfig;
    use crate::backend::function::ByteCodeOutput;
    use crate::backend::inline_cache::InlineCacheLayout;
    use crate::backend::offset_map::StatementData;

    const P: PropertyId = PropertyId(7);

    fn engine_with(config: TieringConfig, options: SyntheticOptions) -> Engine {
        let config = TieringConfig {
            background_compilation: false,
            ..config
        };
        Engine::new(config, Arc::new(SyntheticBackend::new(options))).unwrap()
    }

    fn engine() -> Engine {
        engine_with(TieringConfig::default(), SyntheticOptions::default())
    }

    fn parsed(engine: &mut Engine) -> FunctionId {
        let f = engine.add_function("f", 0..40);
        let output = ByteCodeOutput {
            byte_code: vec![0x42; 32],
            inline_cache_layout: InlineCacheLayout {
                property: 1,
                ..Default::default()
            },
            inline_cache_properties: vec![P],
            statements: vec![StatementData::new(0, 0), StatementData::new(10, 16)],
            loop_headers: vec![4..20],
            ..Default::default()
        };
        engine.mark_script_complete(f, output).unwrap();
        f
    }

    fn installed(engine: &mut Engine, f: FunctionId, tier: JitTier) -> EntryPointId {
        let ep = engine.create_entry_point(f).unwrap();
        engine.dispatch(ep, tier).unwrap();
        let report = engine.checkpoint();
        assert_eq!(report.installed, vec![ep]);
        ep
    }

    #[test]
    fn test_dispatch_install_round_trip() {
        let mut engine = engine();
        let f = parsed(&mut engine);
        let ep = engine.create_entry_point(f).unwrap();
        assert_eq!(engine.entry_point(ep).unwrap().native_address(), None);

        engine.dispatch(ep, JitTier::FullJit).unwrap();
        assert_eq!(
            engine.entry_point(ep).unwrap().state(),
            EntryPointState::CodeGenQueued
        );
        let report = engine.checkpoint();
        assert_eq!(report.installed, vec![ep]);

        let entry = engine.entry_point(ep).unwrap();
        assert_eq!(entry.state(), EntryPointState::CodeGenDone);
        let address = entry.native_address().unwrap();
        assert_eq!(engine.call_target(f), Some(CallTarget::Native(address)));
        assert_eq!(engine.stats().full_jit_installs, 1);
        // One unique guard per snapshotted property, registered with the runtime
        assert_eq!(engine.runtime().unique_guard_count(P), 1);
    }

    #[test]
    fn test_ensure_is_ready_to_call_is_idempotent() {
        let mut engine = engine();
        let f = parsed(&mut engine);
        let ep = installed(&mut engine, f, JitTier::FullJit);
        assert_eq!(engine.ensure_is_ready_to_call(ep), Ok(false));
        assert_eq!(engine.stats().installs, 1);
        assert_eq!(engine.runtime().unique_guard_count(P), 1);
    }

    #[test]
    fn test_dispatch_requires_byte_code() {
        let mut engine = engine();
        let f = engine.add_function("f", 0..4);
        let ep = engine.create_entry_point(f).unwrap();
        assert_eq!(
            engine.dispatch(ep, JitTier::SimpleJit),
            Err(EntryPointError::NotParsed.into())
        );
    }

    #[test]
    fn test_dispatch_queues_with_fresh_job_ids() {
        let mut engine = engine();
        let f = parsed(&mut engine);
        let a = engine.create_entry_point(f).unwrap();
        let b = engine.create_loop_entry_point(f, 0).unwrap();

        let first = engine.dispatch(a, JitTier::SimpleJit).unwrap();
        let second = engine.dispatch(b, JitTier::FullJit).unwrap();
        assert_ne!(first, second);
        assert_eq!(engine.entry_point(a).unwrap().job(), Some(first));
        assert_eq!(engine.entry_point(b).unwrap().job(), Some(second));
        assert_eq!(engine.checkpoint().installed, vec![a, b]);
    }

    #[test]
    fn test_invalidate_prolonged_keeps_old_until_replacement_installs() {
        let mut engine = engine();
        let f = parsed(&mut engine);
        let ep = installed(&mut engine, f, JitTier::FullJit);
        let live_before = engine.code_allocator().live_allocations();

        let replacement = engine.invalidate(ep, true).unwrap().unwrap();
        assert_ne!(replacement, ep);
        assert_eq!(
            engine.entry_point(replacement).unwrap().old_entry_point(),
            Some(ep)
        );
        // Old code still allocated while the replacement compiles
        assert_eq!(engine.code_allocator().live_allocations(), live_before);
        assert_eq!(
            engine.call_target(f),
            Some(CallTarget::Thunk(ThunkKind::Interpreter))
        );

        let report = engine.checkpoint();
        assert_eq!(report.installed, vec![replacement]);
        assert_eq!(report.freed, 1);
        assert!(engine.entry_point(ep).is_none());
        assert_eq!(engine.code_allocator().live_allocations(), live_before);
        assert_eq!(engine.code_allocator().double_frees(), 0);
    }

    #[test]
    fn test_deferred_free_waits_for_script_exit() {
        let mut engine = engine();
        let f = parsed(&mut engine);
        let ep = installed(&mut engine, f, JitTier::FullJit);

        engine.enter_script();
        engine.invalidate(ep, false).unwrap();
        let report = engine.checkpoint();
        assert_eq!(report.freed, 0);
        assert_eq!(engine.pending_cleanup(), 1);
        assert!(engine.entry_point(ep).is_some());

        assert_eq!(engine.leave_script(), 1);
        assert!(engine.entry_point(ep).is_none());
    }

    #[test]
    fn test_transfer_failure_rolls_back() {
        let config = TieringConfig {
            // The shared guard takes the only slot, so the unique guard fails
            guard_registry_capacity: Some(1),
            ..Default::default()
        };
        let mut engine = engine_with(config, SyntheticOptions::default());
        let f = parsed(&mut engine);
        let ep = engine.create_entry_point(f).unwrap();
        engine.dispatch(ep, JitTier::FullJit).unwrap();
        let report = engine.checkpoint();
        assert_eq!(report.rolled_back, vec![ep]);

        let entry = engine.entry_point(ep).unwrap();
        assert_eq!(entry.state(), EntryPointState::NotScheduled);
        assert_eq!(
            entry.call_target(),
            CallTarget::Thunk(ThunkKind::RecompileRequested)
        );
        assert_eq!(
            engine.call_target(f),
            Some(CallTarget::Thunk(ThunkKind::RecompileRequested))
        );
        assert_eq!(engine.code_allocator().live_allocations(), 0);
        assert_eq!(engine.stats().rollbacks, 1);
    }

    #[test]
    fn test_code_heap_exhaustion_fails_compile() {
        let config = TieringConfig {
            code_heap_capacity: Some(8),
            ..Default::default()
        };
        let mut engine = engine_with(config, SyntheticOptions::default());
        let f = parsed(&mut engine);
        let ep = engine.create_entry_point(f).unwrap();
        engine.dispatch(ep, JitTier::FullJit).unwrap();
        let report = engine.checkpoint();
        assert_eq!(report.failed, vec![(ep, CleanupReason::CodeGenFailedOOM)]);
        assert!(engine.entry_point(ep).is_none());
        assert_eq!(engine.function(f).unwrap().default_entry_point(), None);
    }

    #[test]
    fn test_jit_limit_marks_cap_reached() {
        let config = TieringConfig {
            jit_limit: Some(0),
            ..Default::default()
        };
        let mut engine = engine_with(config, SyntheticOptions::default());
        let f = parsed(&mut engine);
        let ep = engine.create_entry_point(f).unwrap();
        engine.dispatch(ep, JitTier::FullJit).unwrap();
        let report = engine.checkpoint();
        assert_eq!(
            report.failed,
            vec![(ep, CleanupReason::CodeGenFailedExceedJitLimit)]
        );
        let entry = engine.entry_point(ep).unwrap();
        assert_eq!(entry.state(), EntryPointState::JitCapReached);
        assert_eq!(entry.job(), None);
        let availability = engine.function(f).unwrap().state_machine().availability();
        assert!(!availability.is_enabled(ExecutionTier::FullJit));
    }

    #[test]
    fn test_retired_while_queued_drops_completion() {
        let mut engine = engine();
        let f = parsed(&mut engine);
        let ep = engine.create_entry_point(f).unwrap();
        engine.dispatch(ep, JitTier::FullJit).unwrap();
        engine.retire_entry_point(ep, CleanupReason::Invalidated);
        let report = engine.checkpoint();
        assert_eq!(report.stale, 1);
        assert_eq!(report.freed, 1);
        assert_eq!(engine.code_allocator().live_allocations(), 0);
    }

    #[test]
    fn test_bailouts_exhaust_call_budget() {
        let config = TieringConfig {
            calls_to_bailouts_ratio_for_rejit: 3,
            ..Default::default()
        };
        let mut engine = engine_with(config, SyntheticOptions::default());
        let f = parsed(&mut engine);
        let ep = installed(&mut engine, f, JitTier::FullJit);

        // calls_count starts at 2 * (3 + 1) = 8, each bailout costs 4
        let first = engine.on_bailout(ep).unwrap();
        assert!(!first.rejit);
        assert_eq!(first.resume_tier, ExecutionTier::ProfilingInterpreter);
        assert!(engine.function(f).unwrap().is_post_bailout());

        let second = engine.on_bailout(ep).unwrap();
        assert!(second.rejit);
        assert_eq!(engine.stats().bailout_rejits, 1);
        assert_ne!(engine.function(f).unwrap().default_entry_point(), Some(ep));
    }

    #[test]
    fn test_lazy_bailout_patches_frames() {
        let options = SyntheticOptions {
            lazy_bailout: true,
            ..Default::default()
        };
        let mut engine = engine_with(TieringConfig::default(), options);
        let f = parsed(&mut engine);
        let ep = installed(&mut engine, f, JitTier::FullJit);
        let base = engine.entry_point(ep).unwrap().native_address().unwrap();

        // 32 bytes * 8 = 256 bytes over 2 statements: stride 128, return at 64
        let on_stack = base.offset(64);
        let elsewhere = NativeAddress::new(0x10);
        let patches = engine.invalidate_property_guards(P, &[on_stack, elsewhere]);
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].return_address, on_stack);
        assert_eq!(patches[0].bailout_target, base.offset(256));
        assert!(engine.entry_point(ep).unwrap().needs_lazy_bailout());
        assert_eq!(engine.stats().lazy_bailouts, 1);
    }

    #[test]
    fn test_statement_at_native_address() {
        let mut engine = engine();
        let f = parsed(&mut engine);
        let ep = installed(&mut engine, f, JitTier::FullJit);
        let base = engine.entry_point(ep).unwrap().native_address().unwrap();
        let mut cursor = SpanCursor::new();
        assert_eq!(
            engine.statement_at_native_address(base.offset(130), &mut cursor),
            Some((f, 1))
        );
        assert_eq!(engine.entry_point_at(NativeAddress::new(1)), None);
    }

    #[test]
    fn test_thunk_selector_rewraps_installed_code() {
        let mut engine = engine();
        let f = parsed(&mut engine);
        let ep = installed(&mut engine, f, JitTier::FullJit);
        engine.bind_function_object_type(f, TypeRef::new(0x500)).unwrap();
        let native = engine.entry_point(ep).unwrap().native_address().unwrap();

        engine.set_thunk_selector(ThunkSelector {
            profiler_attached: true,
            debugger_attached: false,
        });
        let expected = CallTarget::Wrapped {
            thunk: ThunkKind::Profiler,
            native,
        };
        assert_eq!(engine.call_target(f), Some(expected));
        assert_eq!(
            engine.function(f).unwrap().function_object_types()[0].call_target,
            expected
        );
    }
}
