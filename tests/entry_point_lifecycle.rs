//! Entry point lifecycle end to end: compile, install, failure, invalidation,
//! lazy bailout, loop retirement, finalization and shutdown.

mod common;

use common::*;
use tierkeeper::backend::*;

const P: PropertyId = PropertyId(3);

#[test]
fn test_property_change_during_compile_rejects_guards() {
    let backend = ScriptedBackend::new();
    backend.script("f", Script::InvalidateSharedGuards);
    let mut engine = engine(config(), &backend);
    let f = parsed_function(&mut engine, "f", &[P]);

    let target = call(&mut engine, f, 25);
    assert!(target.native().is_some());

    let ep = default_entry_point(&engine, f);
    let entry = engine.entry_point(ep).unwrap();
    assert_eq!(entry.jit_tier(), Some(JitTier::SimpleJit));
    assert_eq!(entry.state(), EntryPointState::CodeGenDone);
    // Code is installed, but the guards it would check never become valid
    assert_eq!(entry.guards().rejected_guards().len(), 1);
    assert!(entry.guards().rejected_guards().iter().all(|g| !g.is_valid()));
    assert_eq!(entry.guards().unique_guards().count(), 0);
    assert_eq!(engine.runtime().unique_guard_count(P), 0);
}

#[test]
fn test_simple_jit_failure_moves_function_to_full_jit() {
    let backend = ScriptedBackend::new();
    backend.script("f", Script::Fail(CodegenError::OutOfMemory));
    let mut engine = engine(config(), &backend);
    let f = parsed_function(&mut engine, "f", &[P]);

    call(&mut engine, f, 25);
    assert_eq!(
        backend.compiled(),
        vec![
            ("f".to_string(), JitTier::SimpleJit),
            ("f".to_string(), JitTier::FullJit)
        ]
    );
    assert_eq!(engine.execution_mode(f), Some(ExecutionTier::FullJit));
    let unit = engine.function(f).unwrap();
    assert!(!unit
        .state_machine()
        .availability()
        .is_enabled(ExecutionTier::SimpleJit));
    assert_eq!(unit.simple_jit_entry_point(), None);

    let ep = default_entry_point(&engine, f);
    assert_eq!(engine.entry_point(ep).unwrap().jit_tier(), Some(JitTier::FullJit));
    assert_eq!(engine.stats().codegen_failures, 1);
    assert_eq!(engine.stats().cleanups, 1);
    assert_eq!(engine.pending_cleanup(), 0);
}

#[test]
fn test_failed_full_jit_is_throttled_then_retried() {
    let backend = ScriptedBackend::new();
    let config = TieringConfig {
        enable_simple_jit: false,
        ..config()
    };
    let mut engine = engine(config, &backend);
    let f = parsed_function(&mut engine, "f", &[]);
    backend.script("f", Script::Fail(CodegenError::Backend("scratch".into())));

    // 20 interpreted calls exhaust the budgets; the FullJit compile fails
    call(&mut engine, f, 20);
    assert_eq!(backend.compiled().len(), 1);
    assert_eq!(engine.call_target(f), Some(CallTarget::Thunk(ThunkKind::Interpreter)));

    // Requeue threshold of 2 skips two requests before retrying
    call(&mut engine, f, 2);
    assert_eq!(backend.compiled().len(), 1);
    call(&mut engine, f, 1);
    assert_eq!(backend.compiled().len(), 2);
    assert!(engine.call_target(f).and_then(CallTarget::native).is_some());
}

#[test]
fn test_lazy_bailout_patches_return_address_and_recompiles() {
    let backend = ScriptedBackend::with_options(SyntheticOptions {
        lazy_bailout: true,
        ..Default::default()
    });
    let mut engine = engine(config(), &backend);
    let f = parsed_function(&mut engine, "f", &[P]);
    call(&mut engine, f, 200);
    assert_eq!(engine.execution_mode(f), Some(ExecutionTier::FullJit));

    let full = default_entry_point(&engine, f);
    let base = engine.entry_point(full).unwrap().native_address().unwrap();
    // 32 bytes of byte code at 8x expansion, 3 statements: stride 85
    let frame = base.offset(85 + 42);
    let patches = engine.invalidate_property_guards(P, &[frame]);
    assert_eq!(
        patches,
        vec![LazyBailoutPatch {
            entry_point: full,
            return_address: frame,
            bailout_target: base.offset(256 + 8),
        }]
    );
    assert!(engine.entry_point(full).unwrap().needs_lazy_bailout());

    // The frame keeps running the old code until the replacement installs
    let replacement = default_entry_point(&engine, f);
    assert_ne!(replacement, full);
    assert_eq!(engine.entry_point(replacement).unwrap().old_entry_point(), Some(full));

    let report = engine.checkpoint();
    assert_eq!(report.installed, vec![replacement]);
    assert!(engine.entry_point(full).is_none());
    assert_eq!(engine.runtime().unique_guard_count(P), 1);
    assert_eq!(engine.code_allocator().double_frees(), 0);
}

#[test]
fn test_loop_body_retires_after_repeated_bailouts() {
    let backend = ScriptedBackend::new();
    let mut engine = engine(config(), &backend);
    let f = parsed_function(&mut engine, "f", &[]);

    assert_eq!(engine.on_loop_iterations(f, 0, 200), Ok(None));
    assert!(engine.function(f).unwrap().state_machine().has_hot_loop());
    engine.checkpoint();
    assert_eq!(engine.stats().loop_installs, 1);

    let address = engine.on_loop_iterations(f, 0, 1).unwrap().unwrap();
    let loop_ep = engine.entry_point_at(address).unwrap();
    assert_eq!(engine.entry_point(loop_ep).unwrap().loop_number(), Some(0));

    let first = engine.on_bailout(loop_ep).unwrap();
    assert!(!first.rejit);
    assert_eq!(first.resume_tier, ExecutionTier::ProfilingInterpreter);
    assert!(engine.on_bailout(loop_ep).unwrap().rejit);
    assert_eq!(engine.stats().loop_retirements, 1);

    engine.checkpoint();
    assert!(engine.entry_point(loop_ep).is_none());
    assert_eq!(engine.on_loop_iterations(f, 0, 1), Ok(None));
}

#[test]
fn test_finalize_frees_every_entry_point() {
    let backend = ScriptedBackend::new();
    let mut engine = engine(config(), &backend);
    let f = parsed_function(&mut engine, "f", &[P]);
    call(&mut engine, f, 200);
    engine.on_loop_iterations(f, 0, 200).unwrap();
    engine.checkpoint();
    // SimpleJit, FullJit and one loop body
    assert_eq!(engine.entry_point_count(), 3);
    assert!(engine.code_allocator().live_allocations() >= 3);

    engine.remove_function(f).unwrap();
    assert_eq!(engine.entry_point_count(), 0);
    assert_eq!(engine.code_allocator().live_allocations(), 0);
    assert_eq!(engine.code_allocator().double_frees(), 0);
    assert_eq!(engine.runtime().unique_guard_count(P), 0);
}

#[test]
fn test_shutdown_zeroes_without_unregistering() {
    let backend = ScriptedBackend::new();
    let mut engine = engine(config(), &backend);
    let f = parsed_function(&mut engine, "f", &[P]);
    let g = parsed_function(&mut engine, "g", &[P]);
    call(&mut engine, f, 200);
    call(&mut engine, g, 25);
    engine
        .record_inline_cache_access(g, 0, TypeRef::new(0x9000), 0, CacheSource::Proto)
        .unwrap();
    assert!(engine.runtime().live_registrations() > 0);

    engine.shutdown();
    assert!(engine.is_shut_down());
    assert_eq!(engine.entry_point_count(), 0);
    assert_eq!(engine.runtime().live_registrations(), 0);
    assert_eq!(engine.code_allocator().double_frees(), 0);
    assert_eq!(engine.cache_allocator().double_frees(), 0);

    // Idempotent, and dropping afterwards is a no-op
    let cleanups = engine.stats().cleanups;
    engine.shutdown();
    assert_eq!(engine.stats().cleanups, cleanups);
}

#[test]
fn test_background_compilation_installs_at_checkpoint() {
    let backend = ScriptedBackend::new();
    let config = TieringConfig {
        background_compilation: true,
        ..Default::default()
    };
    let mut engine = engine(config, &backend);
    let f = parsed_function(&mut engine, "f", &[P]);
    for _ in 0..20 {
        engine.on_function_call(f).unwrap();
    }
    let report = engine.wait_for_compiles();
    assert_eq!(report.installed.len(), 1);
    assert_eq!(engine.compiles_in_flight(), 0);
    assert!(engine.call_target(f).and_then(CallTarget::native).is_some());
    engine.shutdown();
}
