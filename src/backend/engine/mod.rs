//! Mutator-side orchestration of tiering and compiled code.
//!
//! The [`Engine`] owns every function unit and entry point (in
//! generation-checked arenas), the runtime context with its invalidation
//! registries, the allocators for native code and inline caches, and the
//! background code generator.
//!
//! ```text
//!   on_function_call ──► ExecutionStateMachine ──► request_jit ──► dispatch
//!                                                                    │
//!                                                            NativeCodeGenerator
//!                                                                    │
//!   checkpoint ◄──────────── CodeGenCompletion ◄─────────────────────┘
//!      │
//!      ├─ record (allocate native code)
//!      ├─ ensure_is_ready_to_call (transfer package -> registrations)
//!      └─ install / rollback
//! ```
//!
//! ## Design
//!
//! All mutation goes through `&mut Engine`, so per-function state needs no
//! locks. The only shared state is the [`RuntimeContext`] (read by nothing but
//! the mutator, but built on `DashMap` so registries can be inspected from
//! other threads) and the guard words inside it.
//!
//! Retired entry points are not freed immediately: they move to a
//! deferred-free queue that is drained when the engine is outside script
//! ([`Engine::leave_script`]) or at a [`checkpoint`](Engine::checkpoint).
//!
//! The operations are split by concern:
//!
//! - [`lifecycle`]: entry point creation, dispatch, install, invalidation,
//!   bailouts and deferred cleanup
//! - [`tiering`]: call and loop counting driving the tier state machine
//! - [`expiration`]: expirable collect mode and expiry of unused code
//! - [`redeferral`]: dropping the byte code of inactive functions

pub mod expiration;
pub mod lifecycle;
pub mod redeferral;
pub mod tiering;

pub use expiration::CollectionReport;
pub use lifecycle::{BailoutOutcome, CheckpointReport, LazyBailoutPatch};

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use tracing::{debug, info, trace, warn};

use super::arena::Arena;
use super::codegen::{CodeAllocator, CodegenBackend, NativeCodeGenerator};
use super::config::TieringConfig;
use super::entry_point::{CleanupReason, EntryPoint, EntryPointId, ThunkSelector};
use super::error::{ConfigError, EngineResult, EntryPointError, ScriptError};
use super::function::{
    ByteCodeGenerator, ByteCodeOutput, FunctionBody, FunctionId, FunctionRepresentation,
    FunctionUnit,
};
use super::guards::RuntimeContext;
use super::inline_cache::{CleanupMode, InlineCacheAllocator, InlineCacheTable, RootObject};
use super::offset_map::CompactOffsetMap;
use super::tier::ExecutionTier;
use super::trace::{TraceEvent, TraceSink};

// =============================================================================
// Statistics
// =============================================================================

/// Counters for everything the engine does
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub functions_added: u64,
    pub parses: u64,
    pub deferred_parses: u64,
    pub dispatches: u64,
    pub installs: u64,
    /// Bytes of native code installed over the engine's lifetime
    pub native_code_bytes: u64,
    pub loop_installs: u64,
    pub simple_jit_installs: u64,
    pub full_jit_installs: u64,
    pub rollbacks: u64,
    pub codegen_failures: u64,
    pub jit_cap_reached: u64,
    pub stale_completions: u64,
    pub invalidations: u64,
    pub expirations: u64,
    pub cleanups: u64,
    pub redeferrals: u64,
    pub bailouts: u64,
    pub bailout_rejits: u64,
    pub loop_retirements: u64,
    pub lazy_bailouts: u64,
    pub tier_transitions: u64,
}

impl EngineStats {
    pub const fn new() -> Self {
        EngineStats {
            functions_added: 0,
            parses: 0,
            deferred_parses: 0,
            dispatches: 0,
            installs: 0,
            native_code_bytes: 0,
            loop_installs: 0,
            simple_jit_installs: 0,
            full_jit_installs: 0,
            rollbacks: 0,
            codegen_failures: 0,
            jit_cap_reached: 0,
            stale_completions: 0,
            invalidations: 0,
            expirations: 0,
            cleanups: 0,
            redeferrals: 0,
            bailouts: 0,
            bailout_rejits: 0,
            loop_retirements: 0,
            lazy_bailouts: 0,
            tier_transitions: 0,
        }
    }
}

impl fmt::Display for EngineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "functions:      {} ({} parses, {} deferred)", self.functions_added, self.parses, self.deferred_parses)?;
        writeln!(
            f,
            "installs:       {} ({} SimpleJit, {} FullJit, {} loop; {} bytes)",
            self.installs,
            self.simple_jit_installs,
            self.full_jit_installs,
            self.loop_installs,
            self.native_code_bytes
        )?;
        writeln!(
            f,
            "compiles:       {} dispatched, {} failed, {} rolled back, {} at JIT cap, {} stale",
            self.dispatches, self.codegen_failures, self.rollbacks, self.jit_cap_reached, self.stale_completions
        )?;
        writeln!(
            f,
            "retirements:    {} invalidated, {} expired, {} loops retired, {} cleaned up",
            self.invalidations, self.expirations, self.loop_retirements, self.cleanups
        )?;
        writeln!(
            f,
            "bailouts:       {} ({} rejits, {} lazy)",
            self.bailouts, self.bailout_rejits, self.lazy_bailouts
        )?;
        write!(
            f,
            "tiering:        {} transitions, {} redeferrals",
            self.tier_transitions, self.redeferrals
        )
    }
}

// =============================================================================
// Engine
// =============================================================================

pub struct Engine {
    config: TieringConfig,
    functions: Arena<FunctionUnit>,
    entry_points: Arena<EntryPoint>,
    runtime: Arc<RuntimeContext>,
    root: RootObject,
    cache_allocator: Arc<InlineCacheAllocator>,
    code_allocator: CodeAllocator,
    codegen: NativeCodeGenerator,
    byte_code_generator: Option<Box<dyn ByteCodeGenerator>>,
    events: TraceSink,
    stats: EngineStats,
    /// Retired entry points waiting to be freed outside script
    pending_cleanup: Vec<(EntryPointId, CleanupReason)>,
    script_depth: u32,
    thunks: ThunkSelector,
    expirable: expiration::ExpirableCollectMode,
    capture_cleanup_backtraces: bool,
    is_shut_down: bool,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("functions", &self.functions.len())
            .field("entry_points", &self.entry_points.len())
            .field("codegen", &self.codegen)
            .field("pending_cleanup", &self.pending_cleanup.len())
            .field("script_depth", &self.script_depth)
            .finish()
    }
}

impl Engine {
    /// Validate `config` and start the code generator
    pub fn new(config: TieringConfig, backend: Arc<dyn CodegenBackend>) -> Result<Self, ConfigError> {
        config.validate()?;
        let codegen = NativeCodeGenerator::new(backend, &config)?;
        info!(
            threshold = config.full_jit_threshold(),
            background = codegen.is_background(),
            "engine started"
        );
        Ok(Engine {
            runtime: Arc::new(RuntimeContext::new(&config)),
            root: RootObject::new(),
            cache_allocator: Arc::new(InlineCacheAllocator::new(config.inline_cache_capacity)),
            code_allocator: CodeAllocator::new(config.code_heap_capacity),
            codegen,
            byte_code_generator: None,
            events: TraceSink::new(),
            stats: EngineStats::new(),
            functions: Arena::new(),
            entry_points: Arena::new(),
            pending_cleanup: Vec::new(),
            script_depth: 0,
            thunks: ThunkSelector::default(),
            expirable: expiration::ExpirableCollectMode::default(),
            capture_cleanup_backtraces: false,
            is_shut_down: false,
            config,
        })
    }

    /// Parser used to materialize deferred functions
    pub fn with_byte_code_generator(mut self, generator: Box<dyn ByteCodeGenerator>) -> Self {
        self.byte_code_generator = Some(generator);
        self
    }

    /// Keep a backtrace of where each entry point was cleaned up
    pub fn set_capture_cleanup_backtraces(&mut self, capture: bool) {
        self.capture_cleanup_backtraces = capture;
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn config(&self) -> &TieringConfig {
        &self.config
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn runtime(&self) -> &Arc<RuntimeContext> {
        &self.runtime
    }

    pub fn root_object(&self) -> &RootObject {
        &self.root
    }

    pub fn code_allocator(&self) -> &CodeAllocator {
        &self.code_allocator
    }

    pub fn cache_allocator(&self) -> &Arc<InlineCacheAllocator> {
        &self.cache_allocator
    }

    pub fn function(&self, function: FunctionId) -> Option<&FunctionUnit> {
        self.functions.get(function)
    }

    pub fn functions(&self) -> impl Iterator<Item = (FunctionId, &FunctionUnit)> {
        self.functions.iter()
    }

    pub fn entry_point(&self, entry_point: EntryPointId) -> Option<&EntryPoint> {
        self.entry_points.get(entry_point)
    }

    pub fn entry_point_count(&self) -> usize {
        self.entry_points.len()
    }

    /// Entry points retired but not yet freed
    pub fn pending_cleanup(&self) -> usize {
        self.pending_cleanup.len()
    }

    /// Work items submitted and not yet drained
    pub fn compiles_in_flight(&self) -> usize {
        self.codegen.in_flight()
    }

    pub fn thunk_selector(&self) -> ThunkSelector {
        self.thunks
    }

    /// Current tier of `function`
    pub fn execution_mode(&self, function: FunctionId) -> Option<ExecutionTier> {
        self.functions
            .get(function)
            .map(|unit| unit.state_machine().execution_mode())
    }

    /// Statement map of `function`, shareable with debugger threads
    pub fn statement_map(&self, function: FunctionId) -> Option<Arc<CompactOffsetMap>> {
        self.functions
            .get(function)?
            .body()
            .map(|body| Arc::clone(body.statement_map()))
    }

    /// Receive trace events; a full subscriber loses events instead of
    /// blocking the engine
    pub fn subscribe_events(&mut self, capacity: usize) -> Receiver<TraceEvent> {
        self.events.subscribe(capacity)
    }

    /// Events lost to full subscribers
    pub fn events_dropped(&self) -> u64 {
        self.events.dropped()
    }

    pub(crate) fn emit(&mut self, event: TraceEvent) {
        self.events.emit(event);
    }

    pub(crate) fn function_ref(&self, function: FunctionId) -> Result<&FunctionUnit, EntryPointError> {
        self.functions
            .get(function)
            .ok_or(EntryPointError::UnknownFunction)
    }

    pub(crate) fn function_mut(
        &mut self,
        function: FunctionId,
    ) -> Result<&mut FunctionUnit, EntryPointError> {
        self.functions
            .get_mut(function)
            .ok_or(EntryPointError::UnknownFunction)
    }

    pub(crate) fn entry_point_ref(
        &self,
        entry_point: EntryPointId,
    ) -> Result<&EntryPoint, EntryPointError> {
        self.entry_points
            .get(entry_point)
            .ok_or(EntryPointError::StaleHandle)
    }

    pub(crate) fn entry_point_mut(
        &mut self,
        entry_point: EntryPointId,
    ) -> Result<&mut EntryPoint, EntryPointError> {
        self.entry_points
            .get_mut(entry_point)
            .ok_or(EntryPointError::StaleHandle)
    }

    /// Emit a tier transition if `function` moved away from `from`
    pub(crate) fn note_tier_change(&mut self, function: FunctionId, from: ExecutionTier, reason: &'static str) {
        let Some(to) = self.execution_mode(function) else {
            return;
        };
        if to == from {
            return;
        }
        self.stats.tier_transitions += 1;
        debug!(?function, from = from.name(), to = to.name(), reason, "tier transition");
        self.emit(TraceEvent::TierTransition {
            function,
            from,
            to,
            reason,
        });
    }

    // -------------------------------------------------------------------------
    // Functions
    // -------------------------------------------------------------------------

    /// Register a function known only by name and source span
    pub fn add_function(&mut self, name: &str, source: Range<u32>) -> FunctionId {
        let config = &self.config;
        let id = self
            .functions
            .insert_with(|id| FunctionUnit::deferred(id, name, source, config));
        self.stats.functions_added += 1;
        trace!(function = ?id, name, "function added");
        id
    }

    /// Register a function nested inside `parent`
    pub fn add_nested_function(
        &mut self,
        parent: FunctionId,
        name: &str,
        source: Range<u32>,
    ) -> EngineResult<FunctionId> {
        self.function_ref(parent)?;
        let id = self.add_function(name, source);
        self.function_mut(parent)?.add_nested(id);
        Ok(id)
    }

    /// Attach byte-code generation output to `function`
    ///
    /// Builds the inline cache table (taking root object references) and the
    /// statement map. A body that was already attached is released first.
    pub fn mark_script_complete(
        &mut self,
        function: FunctionId,
        output: ByteCodeOutput,
    ) -> EngineResult<()> {
        self.function_ref(function)?;
        self.release_body(function);

        let table = InlineCacheTable::new(
            function,
            output.inline_cache_layout,
            &output.inline_cache_properties,
            &mut self.root,
            &self.cache_allocator,
        )
        .map_err(ScriptError::from)?;

        let deserialized = output.deserialized;
        let statements = output.statements.len();
        let body = FunctionBody::new(output, table);
        let unit = self.function_mut(function)?;
        unit.set_representation(if deserialized {
            FunctionRepresentation::Deserialized(body)
        } else {
            FunctionRepresentation::Parsed(body)
        });
        let thunk = unit.thunk_target();
        unit.redirect_call_sites(thunk);
        self.stats.parses += 1;
        debug!(?function, statements, deserialized, "script complete");
        Ok(())
    }

    /// Materialize a deferred function through the byte-code generator
    ///
    /// Parse failures surface as [`ScriptError`]s.
    pub fn ensure_parsed(&mut self, function: FunctionId) -> EngineResult<()> {
        let unit = self.function_ref(function)?;
        if !unit.is_deferred() {
            return Ok(());
        }
        let Some(generator) = self.byte_code_generator.as_ref() else {
            return Err(EntryPointError::NotParsed.into());
        };
        let output = generator
            .generate(unit.name(), unit.source())
            .map_err(ScriptError::from)?;
        self.mark_script_complete(function, output)?;
        self.stats.deferred_parses += 1;
        Ok(())
    }

    /// Free the body of `function` along with its inline caches
    pub(crate) fn release_body(&mut self, function: FunctionId) -> bool {
        let Some(unit) = self.functions.get_mut(function) else {
            return false;
        };
        match unit.take_body() {
            Some(mut body) => {
                body.inline_caches_mut()
                    .cleanup(CleanupMode::Normal, &self.runtime, &mut self.root);
                true
            }
            None => false,
        }
    }

    /// Finalize `function`: every entry point is cleaned up at once
    pub fn remove_function(&mut self, function: FunctionId) -> EngineResult<()> {
        let entry_points = self.function_ref(function)?.all_entry_points();
        for entry_point in entry_points {
            self.retire_entry_point(entry_point, CleanupReason::CleanUpForFinalize);
        }
        self.free_pending(|_, reason| reason == CleanupReason::CleanUpForFinalize);
        self.release_body(function);
        self.functions.remove(function);
        for handle in self.functions.handles() {
            if let Some(unit) = self.functions.get_mut(handle) {
                unit.remove_nested(function);
            }
        }
        debug!(?function, "function removed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    /// Tear everything down without freeing or unregistering
    ///
    /// Native code, guards and caches are zeroed in place; the runtime
    /// registries are cleared wholesale. Idempotent.
    pub fn shutdown(&mut self) {
        if self.is_shut_down {
            return;
        }
        self.is_shut_down = true;
        self.codegen.shutdown();

        let capture = self.capture_cleanup_backtraces;
        let mut cleaned = 0;
        for handle in self.entry_points.handles() {
            if let Some(mut entry_point) = self.entry_points.remove(handle) {
                if entry_point.cleanup(
                    true,
                    capture,
                    CleanupReason::Shutdown,
                    &self.runtime,
                    &self.code_allocator,
                ) {
                    cleaned += 1;
                }
            }
        }
        self.pending_cleanup.clear();
        for handle in self.functions.handles() {
            if let Some(body) = self.functions.get_mut(handle).and_then(FunctionUnit::body_mut) {
                body.inline_caches_mut()
                    .cleanup(CleanupMode::Shutdown, &self.runtime, &mut self.root);
            }
        }
        self.root.zero_all();
        self.runtime.shutdown();
        self.stats.cleanups += cleaned;
        info!(entry_points = cleaned, "engine shut down");
        if self.code_allocator.double_frees() + self.cache_allocator.double_frees() > 0 {
            warn!("double frees detected during engine lifetime");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.is_shut_down
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
