// Backend: tiered execution and compiled-code lifecycle
//
// - `tier`: per-function execution tier state machine
// - `entry_point`: compiled-code entry points and their lifecycle states
// - `transfer`: compilation transfer packages and their registration
// - `inline_cache` / `guards`: caches, guards and the runtime registries
// - `offset_map`: compact statement offset maps
// - `engine`: the mutator-side orchestration tying them together

pub mod arena;
pub mod codegen;
pub mod config;
pub mod engine;
pub mod entry_point;
pub mod error;
pub mod function;
pub mod guards;
pub mod inline_cache;
pub mod offset_map;
pub mod tier;
pub mod trace;
pub mod transfer;

pub use arena::{Arena, Handle};
pub use codegen::{
    CodeAllocator, CodeGenCompletion, CodeGenOutput, CodegenBackend, JobId, NativeCodeGenerator,
    SyntheticBackend, SyntheticOptions, WorkItem,
};
pub use config::TieringConfig;
pub use engine::{
    BailoutOutcome, CheckpointReport, CollectionReport, Engine, EngineStats, LazyBailoutPatch,
};
pub use entry_point::{
    CallTarget, CleanupReason, EntryPoint, EntryPointId, EntryPointKind, EntryPointState,
    NativeAddress, ThunkKind, ThunkSelector,
};
pub use error::{
    CodegenError, CodegenResult, ConfigError, EngineError, EngineResult, EntryPointError,
    ParseError, ScriptError,
};
pub use function::{
    ByteCodeGenerator, ByteCodeOutput, FunctionAttributes, FunctionId, FunctionRepresentation,
    FunctionUnit,
};
pub use guards::{PropertyGuard, PropertyId, RuntimeContext, TypeRef};
pub use inline_cache::{CacheLookup, CacheSource, InlineCacheLayout, InlineCacheTable, RootObject};
pub use offset_map::{CompactOffsetMap, NativeThrowMap, SpanCursor, StatementData};
pub use tier::{ExecutionStateMachine, ExecutionTier, JitTier, TierAvailability};
pub use trace::{TraceEvent, TraceSink};
pub use transfer::{process_transfer_package, CompilationTransferPackage, TransferredGuards};
