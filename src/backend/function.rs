//! Function units: the per-function record the tier controller drives.
//!
//! A function starts [`Deferred`](FunctionRepresentation::Deferred): only its
//! name and source span are known. Byte-code generation (or loading from a
//! cache) makes it [`Parsed`](FunctionRepresentation::Parsed) or
//! [`Deserialized`](FunctionRepresentation::Deserialized), both carrying a
//! [`FunctionBody`]. Redeferral drops the body again.
//!
//! The function owns its entry points by handle: at most one default
//! function-level entry point, an optional SimpleJit entry point kept as an
//! expiration fallback, older function-level entry points waiting to be
//! retired, and loop entry points hanging off each [`LoopHeader`].

use std::ops::Range;
use std::sync::Arc;

use super::arena::Handle;
use super::config::TieringConfig;
use super::entry_point::{CallTarget, EntryPointId, ThunkKind};
use super::error::ParseError;
use super::guards::{PropertyId, TypeRef};
use super::inline_cache::{InlineCacheLayout, InlineCacheTable};
use super::offset_map::{CompactOffsetMap, StatementData};
use super::tier::{ExecutionStateMachine, TierAvailability};

/// Handle of a function unit in the engine's arena
pub type FunctionId = Handle<FunctionUnit>;

// =============================================================================
// Byte-code generation interface
// =============================================================================

/// Entry of a function's constant table
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Arc<str>),
}

/// Static facts about a function
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FunctionAttributes {
    pub is_generator: bool,
    pub is_async: bool,
    pub is_class_constructor: bool,
    /// Uses `eval` or similar; its body can never be dropped
    pub dont_redefer: bool,
}

/// Everything byte-code generation produces for one function
#[derive(Debug, Clone, Default)]
pub struct ByteCodeOutput {
    pub byte_code: Vec<u8>,
    pub constants: Vec<Constant>,
    pub inline_cache_layout: InlineCacheLayout,
    /// Property of every property-keyed inline cache slot, in layout order
    pub inline_cache_properties: Vec<PropertyId>,
    pub statements: Vec<StatementData>,
    /// Byte-code span of each loop, in loop number order
    pub loop_headers: Vec<Range<u32>>,
    pub attributes: FunctionAttributes,
    /// Loaded from a byte-code cache rather than parsed
    pub deserialized: bool,
}

/// Parser and byte-code emitter
pub trait ByteCodeGenerator {
    fn generate(&self, name: &str, source: Range<u32>) -> Result<ByteCodeOutput, ParseError>;
}

// =============================================================================
// Body
// =============================================================================

/// Interpreter bookkeeping and compiled loop bodies of one loop
#[derive(Debug, Clone, Default)]
pub struct LoopHeader {
    pub start: u32,
    pub end: u32,
    /// Iterations interpreted since the last loop compile
    pub interpret_count: u32,
    /// Iterations interpreted while profiling
    pub profiled_loop_counter: u32,
    pub is_nested: bool,
    pub is_in_try: bool,
    pub entry_points: Vec<EntryPointId>,
}

impl LoopHeader {
    pub fn new(span: Range<u32>) -> Self {
        LoopHeader {
            start: span.start,
            end: span.end,
            ..Default::default()
        }
    }

    pub fn contains(&self, other: &LoopHeader) -> bool {
        self.start <= other.start && other.end <= self.end && (self.start, self.end) != (other.start, other.end)
    }

    /// Newest loop entry point, the one a back edge jumps to
    pub fn current_entry_point(&self) -> Option<EntryPointId> {
        self.entry_points.last().copied()
    }
}

/// Byte code and everything derived from it
#[derive(Debug)]
pub struct FunctionBody {
    byte_code: Arc<[u8]>,
    constants: Box<[Constant]>,
    attributes: FunctionAttributes,
    inline_caches: InlineCacheTable,
    statement_map: Arc<CompactOffsetMap>,
    loop_headers: Vec<LoopHeader>,
}

impl FunctionBody {
    pub fn new(output: ByteCodeOutput, inline_caches: InlineCacheTable) -> Self {
        let mut loop_headers: Vec<LoopHeader> =
            output.loop_headers.iter().cloned().map(LoopHeader::new).collect();
        let spans: Vec<LoopHeader> = loop_headers.clone();
        for header in &mut loop_headers {
            header.is_nested = spans.iter().any(|outer| outer.contains(header));
        }
        FunctionBody {
            byte_code: output.byte_code.into(),
            constants: output.constants.into_boxed_slice(),
            attributes: output.attributes,
            inline_caches,
            statement_map: Arc::new(CompactOffsetMap::from_statements(output.statements)),
            loop_headers,
        }
    }

    pub fn byte_code(&self) -> &Arc<[u8]> {
        &self.byte_code
    }

    pub fn constants(&self) -> &[Constant] {
        &self.constants
    }

    pub fn attributes(&self) -> FunctionAttributes {
        self.attributes
    }

    pub fn inline_caches(&self) -> &InlineCacheTable {
        &self.inline_caches
    }

    pub fn inline_caches_mut(&mut self) -> &mut InlineCacheTable {
        &mut self.inline_caches
    }

    pub fn statement_map(&self) -> &Arc<CompactOffsetMap> {
        &self.statement_map
    }

    pub fn loop_headers(&self) -> &[LoopHeader] {
        &self.loop_headers
    }

    pub fn loop_header(&self, loop_number: u32) -> Option<&LoopHeader> {
        self.loop_headers.get(loop_number as usize)
    }

    pub fn loop_header_mut(&mut self, loop_number: u32) -> Option<&mut LoopHeader> {
        self.loop_headers.get_mut(loop_number as usize)
    }

    /// Largest profiled iteration count among the loops
    pub fn max_profiled_loop_counter(&self) -> u32 {
        self.loop_headers
            .iter()
            .map(|header| header.profiled_loop_counter)
            .max()
            .unwrap_or(0)
    }
}

/// How much of a function is materialized
#[derive(Debug)]
pub enum FunctionRepresentation {
    Deferred,
    Parsed(FunctionBody),
    Deserialized(FunctionBody),
}

// =============================================================================
// FunctionUnit
// =============================================================================

/// A function object type whose calls go through this function's entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionObjectType {
    pub type_ref: TypeRef,
    pub call_target: CallTarget,
}

#[derive(Debug)]
pub struct FunctionUnit {
    id: FunctionId,
    name: Arc<str>,
    source: Range<u32>,
    representation: FunctionRepresentation,
    state_machine: ExecutionStateMachine,
    default_entry_point: Option<EntryPointId>,
    simple_jit_entry_point: Option<EntryPointId>,
    entry_points: Vec<EntryPointId>,
    nested: Vec<FunctionId>,
    function_object_types: Vec<FunctionObjectType>,
    is_post_bailout: bool,
    inactive_collections: u32,
    called_since_collection: bool,
}

impl FunctionUnit {
    /// Function known only by name and source span
    pub fn deferred(id: FunctionId, name: &str, source: Range<u32>, config: &TieringConfig) -> Self {
        FunctionUnit {
            id,
            name: Arc::from(name),
            source,
            representation: FunctionRepresentation::Deferred,
            state_machine: ExecutionStateMachine::new(config, TierAvailability::from_config(config)),
            default_entry_point: None,
            simple_jit_entry_point: None,
            entry_points: Vec::new(),
            nested: Vec::new(),
            function_object_types: Vec::new(),
            is_post_bailout: false,
            inactive_collections: 0,
            called_since_collection: false,
        }
    }

    pub fn id(&self) -> FunctionId {
        self.id
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn source(&self) -> Range<u32> {
        self.source.clone()
    }

    pub fn representation(&self) -> &FunctionRepresentation {
        &self.representation
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self.representation, FunctionRepresentation::Deferred)
    }

    pub fn body(&self) -> Option<&FunctionBody> {
        match &self.representation {
            FunctionRepresentation::Parsed(body) | FunctionRepresentation::Deserialized(body) => {
                Some(body)
            }
            FunctionRepresentation::Deferred => None,
        }
    }

    pub fn body_mut(&mut self) -> Option<&mut FunctionBody> {
        match &mut self.representation {
            FunctionRepresentation::Parsed(body) | FunctionRepresentation::Deserialized(body) => {
                Some(body)
            }
            FunctionRepresentation::Deferred => None,
        }
    }

    /// Attach a body; returns the previous one, if any
    pub fn set_representation(&mut self, representation: FunctionRepresentation) -> FunctionRepresentation {
        std::mem::replace(&mut self.representation, representation)
    }

    /// Drop the body, returning it so its caches can be released
    pub fn take_body(&mut self) -> Option<FunctionBody> {
        match self.set_representation(FunctionRepresentation::Deferred) {
            FunctionRepresentation::Parsed(body) | FunctionRepresentation::Deserialized(body) => {
                Some(body)
            }
            FunctionRepresentation::Deferred => None,
        }
    }

    pub fn state_machine(&self) -> &ExecutionStateMachine {
        &self.state_machine
    }

    pub fn state_machine_mut(&mut self) -> &mut ExecutionStateMachine {
        &mut self.state_machine
    }

    // -------------------------------------------------------------------------
    // Entry points
    // -------------------------------------------------------------------------

    pub fn default_entry_point(&self) -> Option<EntryPointId> {
        self.default_entry_point
    }

    pub fn set_default_entry_point(&mut self, entry_point: Option<EntryPointId>) {
        self.default_entry_point = entry_point;
    }

    pub fn simple_jit_entry_point(&self) -> Option<EntryPointId> {
        self.simple_jit_entry_point
    }

    pub fn set_simple_jit_entry_point(&mut self, entry_point: Option<EntryPointId>) {
        self.simple_jit_entry_point = entry_point;
    }

    /// Function-level entry points, oldest first
    pub fn entry_points(&self) -> &[EntryPointId] {
        &self.entry_points
    }

    pub fn add_entry_point(&mut self, entry_point: EntryPointId) {
        self.entry_points.push(entry_point);
    }

    /// Forget an entry point everywhere the function references it
    pub fn remove_entry_point(&mut self, entry_point: EntryPointId) {
        self.entry_points.retain(|ep| *ep != entry_point);
        if self.default_entry_point == Some(entry_point) {
            self.default_entry_point = None;
        }
        if self.simple_jit_entry_point == Some(entry_point) {
            self.simple_jit_entry_point = None;
        }
        if let Some(body) = self.body_mut() {
            for header in &mut body.loop_headers {
                header.entry_points.retain(|ep| *ep != entry_point);
            }
        }
    }

    /// Every entry point handle the function owns, loops included
    pub fn all_entry_points(&self) -> Vec<EntryPointId> {
        let mut all = self.entry_points.clone();
        if let Some(body) = self.body() {
            all.extend(body.loop_headers.iter().flat_map(|h| h.entry_points.iter().copied()));
        }
        all
    }

    // -------------------------------------------------------------------------
    // Call sites
    // -------------------------------------------------------------------------

    /// Bind a function object type; it starts at the current call target
    pub fn bind_function_object_type(&mut self, type_ref: TypeRef, call_target: CallTarget) {
        if let Some(existing) = self
            .function_object_types
            .iter_mut()
            .find(|t| t.type_ref == type_ref)
        {
            existing.call_target = call_target;
            return;
        }
        self.function_object_types.push(FunctionObjectType {
            type_ref,
            call_target,
        });
    }

    pub fn function_object_types(&self) -> &[FunctionObjectType] {
        &self.function_object_types
    }

    /// Point every bound function object type at `target`
    pub fn redirect_call_sites(&mut self, target: CallTarget) {
        for object_type in &mut self.function_object_types {
            object_type.call_target = target;
        }
    }

    /// Target a call would take when no entry point is installed
    pub fn thunk_target(&self) -> CallTarget {
        if self.is_deferred() {
            CallTarget::Thunk(ThunkKind::DeferredParse)
        } else {
            CallTarget::Thunk(ThunkKind::Interpreter)
        }
    }

    // -------------------------------------------------------------------------
    // Misc state
    // -------------------------------------------------------------------------

    pub fn nested(&self) -> &[FunctionId] {
        &self.nested
    }

    pub fn add_nested(&mut self, function: FunctionId) {
        if !self.nested.contains(&function) {
            self.nested.push(function);
        }
    }

    pub fn remove_nested(&mut self, function: FunctionId) {
        self.nested.retain(|f| *f != function);
    }

    pub fn is_post_bailout(&self) -> bool {
        self.is_post_bailout
    }

    pub fn set_post_bailout(&mut self, value: bool) {
        self.is_post_bailout = value;
    }

    pub fn mark_called(&mut self) {
        self.called_since_collection = true;
        self.inactive_collections = 0;
    }

    /// Count one collection; returns collections spent without a call
    pub fn age(&mut self) -> u32 {
        if std::mem::take(&mut self.called_since_collection) {
            self.inactive_collections = 0;
        } else {
            self.inactive_collections = self.inactive_collections.saturating_add(1);
        }
        self.inactive_collections
    }

    pub fn inactive_collections(&self) -> u32 {
        self.inactive_collections
    }

    pub fn reset_inactivity(&mut self) {
        self.inactive_collections = 0;
        self.called_since_collection = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::arena::test_handle;
    use crate::backend::inline_cache::{InlineCacheAllocator, RootObject};
    use crate::backend::entry_point::NativeAddress;

    fn body(loops: Vec<Range<u32>>) -> FunctionBody {
        let output = ByteCodeOutput {
            byte_code: vec![1, 2, 3],
            statements: vec![StatementData::new(0, 0), StatementData::new(10, 2)],
            loop_headers: loops,
            ..Default::default()
        };
        let table = InlineCacheTable::new(
            test_handle(0),
            InlineCacheLayout::default(),
            &[],
            &mut RootObject::new(),
            &Arc::new(InlineCacheAllocator::default()),
        )
        .unwrap();
        FunctionBody::new(output, table)
    }

    #[test]
    fn test_deferred_to_parsed_and_back() {
        let config = TieringConfig::default();
        let mut f = FunctionUnit::deferred(test_handle(0), "f", 0..10, &config);
        assert!(f.is_deferred());
        assert_eq!(f.thunk_target(), CallTarget::Thunk(ThunkKind::DeferredParse));

        f.set_representation(FunctionRepresentation::Parsed(body(vec![])));
        assert!(!f.is_deferred());
        assert_eq!(f.body().unwrap().statement_map().len(), 2);
        assert_eq!(f.thunk_target(), CallTarget::Thunk(ThunkKind::Interpreter));

        assert!(f.take_body().is_some());
        assert!(f.is_deferred());
        assert!(f.take_body().is_none());
    }

    #[test]
    fn test_nested_loops() {
        let b = body(vec![0..20, 5..10, 30..40]);
        let nested: Vec<bool> = b.loop_headers().iter().map(|h| h.is_nested).collect();
        assert_eq!(nested, vec![false, true, false]);
    }

    #[test]
    fn test_entry_point_bookkeeping() {
        let config = TieringConfig::default();
        let mut f = FunctionUnit::deferred(test_handle(0), "f", 0..10, &config);
        let (a, b) = (test_handle(1), test_handle(2));
        f.add_entry_point(a);
        f.add_entry_point(b);
        f.set_default_entry_point(Some(b));
        f.set_simple_jit_entry_point(Some(a));
        f.remove_entry_point(b);
        assert_eq!(f.entry_points(), &[a]);
        assert_eq!(f.default_entry_point(), None);
        assert_eq!(f.simple_jit_entry_point(), Some(a));
    }

    #[test]
    fn test_redirect_call_sites() {
        let config = TieringConfig::default();
        let mut f = FunctionUnit::deferred(test_handle(0), "f", 0..10, &config);
        f.bind_function_object_type(TypeRef::new(0x100), f.thunk_target());
        f.bind_function_object_type(TypeRef::new(0x200), f.thunk_target());
        let target = CallTarget::Native(NativeAddress::new(0x4000));
        f.redirect_call_sites(target);
        assert!(f.function_object_types().iter().all(|t| t.call_target == target));
    }

    #[test]
    fn test_aging() {
        let config = TieringConfig::default();
        let mut f = FunctionUnit::deferred(test_handle(0), "f", 0..10, &config);
        assert_eq!(f.age(), 1);
        assert_eq!(f.age(), 2);
        f.mark_called();
        assert_eq!(f.age(), 0);
        assert_eq!(f.age(), 1);
    }
}
