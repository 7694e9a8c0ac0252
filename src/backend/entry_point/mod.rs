//! Compiled entry points and their lifecycle.
//!
//! ```text
//!  NotScheduled ──dispatch──► CodeGenPending ──submit──► CodeGenQueued
//!       ▲                                                  │        │
//!       │ rollback                                record   │        │ jit limit
//!       │                                                  ▼        ▼
//!       └──────────────────────────────── CodeGenRecorded    JitCapReached
//!                                                  │
//!                                         install  ▼
//!                                           CodeGenDone
//!
//!  any state ──retire──► PendingCleanup ──cleanup──► CleanedUp
//! ```
//!
//! An entry point is either function-level or loop-level
//! ([`EntryPointKind`]). It owns the native code buffer once a compile is
//! recorded, the transfer package until it is processed, and every guard and
//! cache registration that processing made. [`EntryPoint::cleanup`] gives all
//! of it back.
//!
//! ## Design
//!
//! The native address is only exposed in `CodeGenDone`. Between recording and
//! installation the code exists but its guards are not registered yet, so
//! nothing may call it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use super::arena::Handle;
use super::codegen::{CodeAllocation, CodeAllocator, JobId};
use super::config::TieringConfig;
use super::engine::EngineStats;
use super::error::{CodegenError, EntryPointError};
use super::function::FunctionId;
use super::guards::{PropertyGuard, PropertyId, RuntimeContext};
use super::inline_cache::EntryPointPolymorphicInlineCacheInfo;
use super::offset_map::{NativeThrowMap, SpanCursor};
use super::tier::JitTier;
use super::transfer::{CompilationTransferPackage, TransferredGuards};

/// Handle of an entry point in the engine's arena
pub type EntryPointId = Handle<EntryPoint>;

/// Largest value the bailout rejit counter holds
pub const MAX_CALLS_COUNT: u32 = 255;

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntryPointState {
    NotScheduled = 0,
    CodeGenPending = 1,
    CodeGenQueued = 2,
    CodeGenRecorded = 3,
    CodeGenDone = 4,
    JitCapReached = 5,
    PendingCleanup = 6,
    CleanedUp = 7,
}

impl EntryPointState {
    /// Whether the lifecycle allows `self -> to`
    pub fn can_transition_to(self, to: EntryPointState) -> bool {
        use EntryPointState::*;
        match (self, to) {
            (NotScheduled, CodeGenPending)
            | (CodeGenPending, CodeGenQueued)
            | (CodeGenQueued, CodeGenRecorded)
            | (CodeGenQueued, JitCapReached)
            | (CodeGenRecorded, CodeGenDone)
            | (CodeGenRecorded, NotScheduled) => true,
            (CleanedUp, _) => false,
            (PendingCleanup, CleanedUp) => true,
            (PendingCleanup, _) => false,
            (_, PendingCleanup) | (_, CleanedUp) => true,
            _ => false,
        }
    }

    pub fn is_compiling(self) -> bool {
        matches!(
            self,
            EntryPointState::CodeGenPending | EntryPointState::CodeGenQueued
        )
    }

    pub fn is_retired(self) -> bool {
        matches!(
            self,
            EntryPointState::PendingCleanup | EntryPointState::CleanedUp
        )
    }
}

impl fmt::Display for EntryPointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why an entry point was cleaned up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CleanupReason {
    NotCleanedUp,
    CodeGenFailedOOM,
    CodeGenFailedStackOverflow,
    CodeGenFailedAborted,
    CodeGenFailedExceedJitLimit,
    CodeGenFailedUnknown,
    NativeCodeInstallFailure,
    Invalidated,
    Expired,
    Redeferred,
    LoopRetired,
    CleanUpForFinalize,
    Shutdown,
}

impl From<&CodegenError> for CleanupReason {
    fn from(err: &CodegenError) -> Self {
        match err {
            CodegenError::OutOfMemory => CleanupReason::CodeGenFailedOOM,
            CodegenError::StackOverflow => CleanupReason::CodeGenFailedStackOverflow,
            CodegenError::Aborted => CleanupReason::CodeGenFailedAborted,
            CodegenError::ExceedJitLimit => CleanupReason::CodeGenFailedExceedJitLimit,
            CodegenError::InstallFailure(_) => CleanupReason::NativeCodeInstallFailure,
            CodegenError::Backend(_) => CleanupReason::CodeGenFailedUnknown,
        }
    }
}

// =============================================================================
// Call targets
// =============================================================================

/// Address inside the native code heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NativeAddress(u64);

impl NativeAddress {
    pub const fn new(address: u64) -> Self {
        NativeAddress(address)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn offset(self, bytes: u32) -> Self {
        NativeAddress(self.0 + bytes as u64)
    }
}

impl fmt::Display for NativeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Runtime stubs a call site can point at instead of native code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThunkKind {
    DeferredParse,
    Interpreter,
    Profiler,
    Debugger,
    RecompileRequested,
}

/// What calling a function currently runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallTarget {
    Thunk(ThunkKind),
    Native(NativeAddress),
    /// Native code reached through a profiler or debugger thunk
    Wrapped { thunk: ThunkKind, native: NativeAddress },
}

impl CallTarget {
    pub fn native(self) -> Option<NativeAddress> {
        match self {
            CallTarget::Native(address) | CallTarget::Wrapped { native: address, .. } => {
                Some(address)
            }
            CallTarget::Thunk(_) => None,
        }
    }
}

/// Chooses the exposed call target when code is installed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThunkSelector {
    pub profiler_attached: bool,
    pub debugger_attached: bool,
}

impl ThunkSelector {
    pub fn select(&self, native: NativeAddress) -> CallTarget {
        if self.debugger_attached {
            CallTarget::Wrapped {
                thunk: ThunkKind::Debugger,
                native,
            }
        } else if self.profiler_attached {
            CallTarget::Wrapped {
                thunk: ThunkKind::Profiler,
                native,
            }
        } else {
            CallTarget::Native(native)
        }
    }
}

// =============================================================================
// Native code
// =============================================================================

/// Committed machine code with its unwind data
#[derive(Debug)]
pub struct NativeCodeBuffer {
    allocation: Option<CodeAllocation>,
    address: NativeAddress,
    size: usize,
    code: Box<[u8]>,
    unwind: Box<[u8]>,
}

impl NativeCodeBuffer {
    pub fn new(allocation: CodeAllocation, code: Vec<u8>, unwind: Vec<u8>) -> Self {
        NativeCodeBuffer {
            address: allocation.address(),
            size: allocation.size(),
            allocation: Some(allocation),
            code: code.into_boxed_slice(),
            unwind: unwind.into_boxed_slice(),
        }
    }

    pub fn address(&self) -> NativeAddress {
        self.address
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn unwind(&self) -> &[u8] {
        &self.unwind
    }

    pub fn contains(&self, address: NativeAddress) -> bool {
        let start = self.address.as_u64();
        (start..start + self.size as u64).contains(&address.as_u64())
    }

    fn free(&mut self, allocator: &CodeAllocator) {
        if let Some(allocation) = self.allocation.take() {
            allocator.free(allocation);
        }
    }

    /// Drop contents and give up the allocation without freeing it
    fn zero(&mut self) {
        self.allocation = None;
        self.code = Box::default();
        self.unwind = Box::default();
        self.address = NativeAddress::new(0);
        self.size = 0;
    }
}

/// Return-address to bailout-thunk mapping used by lazy bailout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LazyBailOutRecord {
    /// Offset of a call's return address inside the code
    pub return_offset: u32,
    /// Offset of the bailout thunk to resume at instead
    pub bailout_offset: u32,
}

/// Detached compile result attached to an entry point when recorded
#[derive(Debug)]
pub struct RecordedCode {
    pub buffer: NativeCodeBuffer,
    pub transfer: CompilationTransferPackage,
    pub throw_map: NativeThrowMap,
    pub lazy_bailout_records: Vec<LazyBailOutRecord>,
}

// =============================================================================
// Kinds
// =============================================================================

#[derive(Debug, Clone)]
pub struct FunctionEntryPointData {
    pub function: FunctionId,
    /// Bailout rejit budget: calls add one, bailouts take a batch away
    pub calls_count: u32,
    pub total_calls: u64,
    pub last_scan_calls: u64,
    pub bailout_count: u32,
    /// Entry point this one replaces, kept alive until this one installs
    pub old_entry_point: Option<EntryPointId>,
}

#[derive(Debug, Clone)]
pub struct LoopEntryPointData {
    pub function: FunctionId,
    pub loop_number: u32,
    pub jitted_loop_iterations_since_last_bailout: u32,
    pub total_jitted_loop_iterations: u64,
    pub last_scan_iterations: u64,
    pub bailouts: u32,
}

#[derive(Debug, Clone)]
pub enum EntryPointKind {
    Function(FunctionEntryPointData),
    Loop(LoopEntryPointData),
}

// =============================================================================
// EntryPoint
// =============================================================================

#[derive(Debug)]
pub struct EntryPoint {
    id: EntryPointId,
    kind: EntryPointKind,
    state: EntryPointState,
    jit_tier: Option<JitTier>,
    call_target: CallTarget,
    job: Option<JobId>,
    native: Option<NativeCodeBuffer>,
    transfer_package: Option<CompilationTransferPackage>,
    shared_guards: HashMap<PropertyId, PropertyGuard>,
    guards: TransferredGuards,
    native_throw_map: Option<Arc<NativeThrowMap>>,
    lazy_bailout_records: Vec<LazyBailOutRecord>,
    lazy_bailout_pending: bool,
    polymorphic_caches: Option<EntryPointPolymorphicInlineCacheInfo>,
    cleanup_reason: CleanupReason,
    cleanup_backtrace: Option<String>,
}

impl EntryPoint {
    fn with_kind(id: EntryPointId, kind: EntryPointKind) -> Self {
        EntryPoint {
            id,
            kind,
            state: EntryPointState::NotScheduled,
            jit_tier: None,
            call_target: CallTarget::Thunk(ThunkKind::Interpreter),
            job: None,
            native: None,
            transfer_package: None,
            shared_guards: HashMap::new(),
            guards: TransferredGuards::default(),
            native_throw_map: None,
            lazy_bailout_records: Vec::new(),
            lazy_bailout_pending: false,
            polymorphic_caches: None,
            cleanup_reason: CleanupReason::NotCleanedUp,
            cleanup_backtrace: None,
        }
    }

    pub fn new_function(id: EntryPointId, function: FunctionId, config: &TieringConfig) -> Self {
        let calls_count =
            (2 * (config.calls_to_bailouts_ratio_for_rejit + 1)).min(MAX_CALLS_COUNT);
        Self::with_kind(
            id,
            EntryPointKind::Function(FunctionEntryPointData {
                function,
                calls_count,
                total_calls: 0,
                last_scan_calls: 0,
                bailout_count: 0,
                old_entry_point: None,
            }),
        )
    }

    pub fn new_loop(id: EntryPointId, function: FunctionId, loop_number: u32) -> Self {
        Self::with_kind(
            id,
            EntryPointKind::Loop(LoopEntryPointData {
                function,
                loop_number,
                jitted_loop_iterations_since_last_bailout: 0,
                total_jitted_loop_iterations: 0,
                last_scan_iterations: 0,
                bailouts: 0,
            }),
        )
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn id(&self) -> EntryPointId {
        self.id
    }

    pub fn kind(&self) -> &EntryPointKind {
        &self.kind
    }

    pub fn function(&self) -> FunctionId {
        match &self.kind {
            EntryPointKind::Function(data) => data.function,
            EntryPointKind::Loop(data) => data.function,
        }
    }

    pub fn is_loop(&self) -> bool {
        matches!(self.kind, EntryPointKind::Loop(_))
    }

    pub fn loop_number(&self) -> Option<u32> {
        match &self.kind {
            EntryPointKind::Loop(data) => Some(data.loop_number),
            EntryPointKind::Function(_) => None,
        }
    }

    pub fn state(&self) -> EntryPointState {
        self.state
    }

    pub fn jit_tier(&self) -> Option<JitTier> {
        self.jit_tier
    }

    pub fn call_target(&self) -> CallTarget {
        self.call_target
    }

    pub fn set_call_target(&mut self, target: CallTarget) {
        self.call_target = target;
    }

    pub fn job(&self) -> Option<JobId> {
        self.job
    }

    /// Address of callable code; only once installed
    pub fn native_address(&self) -> Option<NativeAddress> {
        match self.state {
            EntryPointState::CodeGenDone => self.native.as_ref().map(NativeCodeBuffer::address),
            _ => None,
        }
    }

    pub fn native_code(&self) -> Option<&NativeCodeBuffer> {
        self.native.as_ref()
    }

    pub fn native_size(&self) -> usize {
        self.native.as_ref().map_or(0, NativeCodeBuffer::size)
    }

    pub fn has_transfer_package(&self) -> bool {
        self.transfer_package.is_some()
    }

    pub fn shared_guards(&self) -> &HashMap<PropertyId, PropertyGuard> {
        &self.shared_guards
    }

    pub fn guards(&self) -> &TransferredGuards {
        &self.guards
    }

    pub fn guards_mut(&mut self) -> &mut TransferredGuards {
        &mut self.guards
    }

    pub fn native_throw_map(&self) -> Option<&Arc<NativeThrowMap>> {
        self.native_throw_map.as_ref()
    }

    pub fn polymorphic_caches(&self) -> Option<&EntryPointPolymorphicInlineCacheInfo> {
        self.polymorphic_caches.as_ref()
    }

    pub fn cleanup_reason(&self) -> CleanupReason {
        self.cleanup_reason
    }

    pub fn cleanup_backtrace(&self) -> Option<&str> {
        self.cleanup_backtrace.as_deref()
    }

    pub fn old_entry_point(&self) -> Option<EntryPointId> {
        match &self.kind {
            EntryPointKind::Function(data) => data.old_entry_point,
            EntryPointKind::Loop(_) => None,
        }
    }

    pub fn set_old_entry_point(&mut self, old: Option<EntryPointId>) {
        if let EntryPointKind::Function(data) = &mut self.kind {
            data.old_entry_point = old;
        }
    }

    pub fn take_old_entry_point(&mut self) -> Option<EntryPointId> {
        match &mut self.kind {
            EntryPointKind::Function(data) => data.old_entry_point.take(),
            EntryPointKind::Loop(_) => None,
        }
    }

    pub fn calls_count(&self) -> Option<u32> {
        match &self.kind {
            EntryPointKind::Function(data) => Some(data.calls_count),
            EntryPointKind::Loop(_) => None,
        }
    }

    // -------------------------------------------------------------------------
    // Usage
    // -------------------------------------------------------------------------

    /// Count one call of installed code
    pub fn record_call(&mut self) {
        if let EntryPointKind::Function(data) = &mut self.kind {
            data.total_calls += 1;
            data.calls_count = (data.calls_count + 1).min(MAX_CALLS_COUNT);
        }
    }

    /// Count iterations run in jitted loop code
    pub fn record_loop_iterations(&mut self, iterations: u32) {
        if let EntryPointKind::Loop(data) = &mut self.kind {
            data.jitted_loop_iterations_since_last_bailout = data
                .jitted_loop_iterations_since_last_bailout
                .saturating_add(iterations);
            data.total_jitted_loop_iterations += iterations as u64;
        }
    }

    /// Start a new expiration window
    pub fn begin_expiration_scan(&mut self) {
        match &mut self.kind {
            EntryPointKind::Function(data) => data.last_scan_calls = data.total_calls,
            EntryPointKind::Loop(data) => {
                data.last_scan_iterations = data.total_jitted_loop_iterations
            }
        }
    }

    pub fn used_since_last_scan(&self) -> bool {
        match &self.kind {
            EntryPointKind::Function(data) => data.total_calls != data.last_scan_calls,
            EntryPointKind::Loop(data) => {
                data.total_jitted_loop_iterations != data.last_scan_iterations
            }
        }
    }

    /// Charge a bailout from function code; true once a rejit is due
    pub fn on_bailout(&mut self, decrement: u32) -> bool {
        match &mut self.kind {
            EntryPointKind::Function(data) => {
                data.bailout_count += 1;
                data.calls_count = data.calls_count.saturating_sub(decrement);
                data.calls_count == 0
            }
            EntryPointKind::Loop(_) => false,
        }
    }

    /// Charge a bailout from loop code; true once the loop body should be
    /// retired
    pub fn on_loop_bailout(&mut self, config: &TieringConfig) -> bool {
        match &mut self.kind {
            EntryPointKind::Loop(data) => {
                if data.jitted_loop_iterations_since_last_bailout
                    >= config.loop_iterations_between_bailouts
                {
                    data.bailouts = 0;
                }
                data.bailouts += 1;
                data.jitted_loop_iterations_since_last_bailout = 0;
                data.bailouts >= config.loop_bailouts_before_rejit
            }
            EntryPointKind::Function(_) => false,
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    fn transition(&mut self, to: EntryPointState) -> Result<(), EntryPointError> {
        if !self.state.can_transition_to(to) {
            return Err(EntryPointError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        trace!(entry_point = ?self.id, from = %self.state, %to, "entry point transition");
        self.state = to;
        Ok(())
    }

    /// `NotScheduled -> CodeGenPending`, snapshotting what the compile reads
    pub fn mark_pending(
        &mut self,
        shared_guards: HashMap<PropertyId, PropertyGuard>,
        polymorphic_caches: EntryPointPolymorphicInlineCacheInfo,
    ) -> Result<(), EntryPointError> {
        self.transition(EntryPointState::CodeGenPending)?;
        self.shared_guards = shared_guards;
        self.polymorphic_caches = Some(polymorphic_caches);
        Ok(())
    }

    /// `CodeGenPending -> CodeGenQueued`
    pub fn mark_queued(&mut self, job: JobId, tier: JitTier) -> Result<(), EntryPointError> {
        self.transition(EntryPointState::CodeGenQueued)?;
        self.job = Some(job);
        self.jit_tier = Some(tier);
        Ok(())
    }

    /// `CodeGenQueued -> CodeGenRecorded`, attaching the detached result
    pub fn record(&mut self, code: RecordedCode) -> Result<(), EntryPointError> {
        self.transition(EntryPointState::CodeGenRecorded)?;
        self.job = None;
        self.native = Some(code.buffer);
        self.transfer_package = Some(code.transfer);
        self.native_throw_map = Some(Arc::new(code.throw_map));
        self.lazy_bailout_records = code.lazy_bailout_records;
        Ok(())
    }

    /// `CodeGenQueued -> JitCapReached`
    pub fn mark_jit_cap_reached(&mut self) -> Result<(), EntryPointError> {
        self.transition(EntryPointState::JitCapReached)?;
        self.job = None;
        Ok(())
    }

    /// Hand out the transfer package; `None` once taken
    pub fn take_transfer_package(&mut self) -> Option<CompilationTransferPackage> {
        self.transfer_package.take()
    }

    pub fn set_transferred_guards(&mut self, guards: TransferredGuards) {
        self.guards = guards;
    }

    /// `CodeGenRecorded -> CodeGenDone`, exposing the code to callers
    pub fn install(
        &mut self,
        selector: &ThunkSelector,
        stats: &mut EngineStats,
    ) -> Result<CallTarget, EntryPointError> {
        let Some(address) = self.native.as_ref().map(NativeCodeBuffer::address) else {
            return Err(EntryPointError::InvalidTransition {
                from: self.state,
                to: EntryPointState::CodeGenDone,
            });
        };
        self.transition(EntryPointState::CodeGenDone)?;
        self.call_target = selector.select(address);

        stats.installs += 1;
        stats.native_code_bytes += self.native_size() as u64;
        match (self.is_loop(), self.jit_tier) {
            (true, _) => stats.loop_installs += 1,
            (false, Some(JitTier::SimpleJit)) => stats.simple_jit_installs += 1,
            (false, _) => stats.full_jit_installs += 1,
        }
        debug!(entry_point = ?self.id, %address, size = self.native_size(), "entry point installed");
        Ok(self.call_target)
    }

    /// `CodeGenRecorded -> NotScheduled` after a failed install
    pub fn rollback(
        &mut self,
        runtime: &RuntimeContext,
        allocator: &CodeAllocator,
    ) -> Result<(), EntryPointError> {
        self.transition(EntryPointState::NotScheduled)?;
        if let Some(mut native) = self.native.take() {
            native.free(allocator);
        }
        self.guards.unregister(self.id, runtime);
        self.transfer_package = None;
        self.native_throw_map = None;
        self.lazy_bailout_records.clear();
        self.shared_guards.clear();
        self.polymorphic_caches = None;
        self.jit_tier = None;
        self.call_target = CallTarget::Thunk(ThunkKind::RecompileRequested);
        debug!(entry_point = ?self.id, "install rolled back");
        Ok(())
    }

    /// Queue for deferred free
    pub fn retire(&mut self) -> Result<(), EntryPointError> {
        self.transition(EntryPointState::PendingCleanup)
    }

    /// Release everything this entry point owns
    ///
    /// Normal mode unregisters every guard and cache and frees the native
    /// buffer. Shutdown mode zeroes the same state without freeing or
    /// unregistering anything. Returns false if already cleaned up.
    pub fn cleanup(
        &mut self,
        is_shutdown: bool,
        capture_diagnostics: bool,
        reason: CleanupReason,
        runtime: &RuntimeContext,
        allocator: &CodeAllocator,
    ) -> bool {
        if self.state == EntryPointState::CleanedUp {
            return false;
        }
        if is_shutdown {
            if let Some(native) = self.native.as_mut() {
                native.zero();
            }
            self.guards.zero();
            if let Some(caches) = &self.polymorphic_caches {
                caches.zero();
            }
        } else {
            if let Some(native) = self.native.as_mut() {
                native.free(allocator);
            }
            self.guards.unregister(self.id, runtime);
        }
        self.native = None;
        self.transfer_package = None;
        self.native_throw_map = None;
        self.lazy_bailout_records.clear();
        self.shared_guards.clear();
        self.polymorphic_caches = None;
        self.job = None;
        self.call_target = CallTarget::Thunk(ThunkKind::Interpreter);
        self.state = EntryPointState::CleanedUp;
        self.cleanup_reason = reason;
        if capture_diagnostics {
            self.cleanup_backtrace = Some(std::backtrace::Backtrace::force_capture().to_string());
        }
        debug!(entry_point = ?self.id, ?reason, is_shutdown, "entry point cleaned up");
        true
    }

    // -------------------------------------------------------------------------
    // Queries on installed code
    // -------------------------------------------------------------------------

    /// Statement executing at `address`, for exception attribution
    pub fn statement_index_from_native_address(
        &self,
        address: NativeAddress,
        cursor: &mut SpanCursor,
    ) -> Option<u32> {
        let native = self.native.as_ref()?;
        if !native.contains(address) {
            return None;
        }
        let offset = (address.as_u64() - native.address().as_u64()) as u32;
        self.native_throw_map
            .as_ref()?
            .statement_index(offset, cursor)
    }

    /// Bailout thunk to resume at if a frame returns to `return_address`
    pub fn lazy_bailout_target(&self, return_address: NativeAddress) -> Option<NativeAddress> {
        let native = self.native.as_ref()?;
        if !native.contains(return_address) {
            return None;
        }
        let offset = (return_address.as_u64() - native.address().as_u64()) as u32;
        self.lazy_bailout_records
            .iter()
            .find(|record| record.return_offset == offset)
            .map(|record| native.address().offset(record.bailout_offset))
    }

    pub fn mark_lazy_bailout(&mut self) {
        self.lazy_bailout_pending = true;
    }

    pub fn needs_lazy_bailout(&self) -> bool {
        self.lazy_bailout_pending
    }
}

// =============================================================================
// Tests
// =============================================================================
