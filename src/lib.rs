/// Tierkeeper - tiered execution and compiled-code lifecycle for a script engine
///
/// This library decides when a function moves from the interpreter to
/// SimpleJit and FullJit, and manages the native code that results: entry
/// points, the guards and inline caches their code depends on, invalidation,
/// expiration, redeferral and cleanup.
///
/// # Architecture
///
/// 1. **Tier control** (`backend::tier`)
///    - Per-function execution state machine with iteration budgets
///    - The budgets always sum to the FullJit threshold
///
/// 2. **Entry points** (`backend::entry_point`, `backend::transfer`)
///    - Lifecycle from `NotScheduled` through install to `CleanedUp`
///    - Transfer packages turn backend output into runtime registrations
///
/// 3. **Caches and guards** (`backend::inline_cache`, `backend::guards`)
///    - Monomorphic and polymorphic inline caches, root object caches
///    - Property guards, constructor caches and equivalent-type caches
///
/// 4. **Compact offset maps** (`backend::offset_map`)
///    - Delta-encoded statement maps used for debugging and throw attribution
///
/// 5. **Engine** (`backend::engine`)
///    - Owns everything above and talks to a background code generator
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use tierkeeper::backend::*;
///
/// let config = TieringConfig {
///     background_compilation: false,
///     ..Default::default()
/// };
/// let mut engine = Engine::new(config, Arc::new(SyntheticBackend::default())).unwrap();
///
/// let f = engine.add_function("main", 0..32);
/// let output = ByteCodeOutput {
///     byte_code: vec![0; 16],
///     statements: vec![StatementData::new(0, 0)],
///     ..Default::default()
/// };
/// engine.mark_script_complete(f, output).unwrap();
///
/// for _ in 0..32 {
///     engine.on_function_call(f).unwrap();
///     engine.checkpoint();
/// }
/// assert_eq!(engine.execution_mode(f), Some(ExecutionTier::SimpleJit));
/// assert!(engine.call_target(f).and_then(CallTarget::native).is_some());
/// ```
pub mod backend;

pub use backend::{
    CallTarget, Engine, EngineError, EngineStats, EntryPointState, ExecutionTier, JitTier,
    TieringConfig,
};
