//! Transfer package processing through the engine: install, idempotence,
//! rollback when the guard registry is exhausted, and equivalent-type sweeps.

mod common;

use common::*;
use tierkeeper::backend::*;

const P: PropertyId = PropertyId(20);
const Q: PropertyId = PropertyId(21);
const T1: TypeRef = TypeRef::new(0xa000);

fn limited(capacity: usize) -> TieringConfig {
    TieringConfig {
        guard_registry_capacity: Some(capacity),
        ..config()
    }
}

#[test]
fn test_install_registers_one_unique_guard_per_property() {
    let backend = ScriptedBackend::new();
    let mut engine = engine(config(), &backend);
    let f = parsed_function(&mut engine, "f", &[P, Q]);
    call(&mut engine, f, 20);

    let ep = default_entry_point(&engine, f);
    let entry = engine.entry_point(ep).unwrap();
    assert_eq!(entry.state(), EntryPointState::CodeGenDone);
    // One pinned slot per guarded property plus the terminator
    assert_eq!(entry.guards().pinned_type_refs().len(), 3);
    assert_eq!(entry.guards().pinned_type_refs().last(), Some(&None));
    assert_eq!(entry.guards().unique_guards().count(), 2);
    assert!(entry.guards().rejected_guards().is_empty());
    assert_eq!(engine.runtime().unique_guard_count(P), 1);
    assert_eq!(engine.runtime().unique_guard_count(Q), 1);
    // Two shared guards and two unique guards
    assert_eq!(engine.runtime().live_registrations(), 4);
}

#[test]
fn test_package_is_processed_exactly_once() {
    let backend = ScriptedBackend::new();
    let mut engine = engine(config(), &backend);
    let f = parsed_function(&mut engine, "f", &[P]);
    call(&mut engine, f, 20);

    let ep = default_entry_point(&engine, f);
    let registrations = engine.runtime().live_registrations();
    let installs = engine.stats().installs;

    assert_eq!(engine.ensure_is_ready_to_call(ep), Ok(false));
    assert_eq!(engine.ensure_is_ready_to_call(ep), Ok(false));
    assert_eq!(engine.runtime().live_registrations(), registrations);
    assert_eq!(engine.runtime().unique_guard_count(P), 1);
    assert_eq!(engine.stats().installs, installs);
}

#[test]
fn test_exhausted_registry_rolls_back_install() {
    let backend = ScriptedBackend::new();
    // Room for both shared guards and one unique guard
    let mut engine = engine(limited(3), &backend);
    let f = parsed_function(&mut engine, "f", &[P, Q]);

    for _ in 0..20 {
        engine.on_function_call(f).unwrap();
    }
    let report = engine.checkpoint();
    let ep = default_entry_point(&engine, f);
    assert_eq!(report.rolled_back, vec![ep]);
    assert!(report.installed.is_empty());

    let entry = engine.entry_point(ep).unwrap();
    assert_eq!(entry.state(), EntryPointState::NotScheduled);
    assert_eq!(entry.jit_tier(), None);
    assert_eq!(entry.guards().unique_guards().count(), 0);

    assert_eq!(engine.stats().rollbacks, 1);
    assert_eq!(engine.runtime().unique_guard_count(P), 0);
    assert_eq!(engine.runtime().unique_guard_count(Q), 0);
    assert_eq!(engine.runtime().live_registrations(), 2);
    assert_eq!(engine.code_allocator().live_allocations(), 0);
    assert!(engine.call_target(f).and_then(CallTarget::native).is_none());
}

#[test]
fn test_rollback_unregisters_equivalent_type_entry_point() {
    let backend = ScriptedBackend::with_options(SyntheticOptions {
        lazy_bailout: true,
        ..Default::default()
    });
    backend.script("f", Script::EquivalentType(T1));
    // Shared and unique guard fit; the lazy bailout registration does not
    let mut engine = engine(limited(2), &backend);
    let f = parsed_function(&mut engine, "f", &[P]);

    for _ in 0..20 {
        engine.on_function_call(f).unwrap();
    }
    let report = engine.checkpoint();
    assert_eq!(report.rolled_back.len(), 1);
    assert!(engine.runtime().equivalent_type_cache_entry_points().is_empty());
    assert_eq!(engine.runtime().unique_guard_count(P), 0);
    assert!(engine.runtime().invalidate_property_guards(P).is_empty());
}

#[test]
fn test_equivalent_type_sweep_drops_dead_types() {
    let backend = ScriptedBackend::new();
    backend.script("f", Script::EquivalentType(T1));
    let mut engine = engine(config(), &backend);
    let f = parsed_function(&mut engine, "f", &[]);
    call(&mut engine, f, 20);

    let ep = default_entry_point(&engine, f);
    assert_eq!(engine.runtime().equivalent_type_cache_entry_points(), vec![ep]);
    assert!(engine.runtime().is_type_cached(T1));

    assert_eq!(engine.sweep_equivalent_type_caches(&|_| true), 1);
    let caches = engine.entry_point(ep).unwrap().guards().equivalent_type_caches();
    assert!(caches[0].contains(T1));
    assert!(caches[0].guard().is_valid());

    assert_eq!(engine.sweep_equivalent_type_caches(&|t| t != T1), 0);
    let caches = engine.entry_point(ep).unwrap().guards().equivalent_type_caches();
    assert!(caches[0].is_empty());
    assert!(!caches[0].guard().is_valid());
}

#[test]
fn test_finalize_unregisters_equivalent_type_entry_point() {
    let backend = ScriptedBackend::new();
    backend.script("f", Script::EquivalentType(T1));
    let mut engine = engine(config(), &backend);
    let f = parsed_function(&mut engine, "f", &[P]);
    call(&mut engine, f, 20);
    assert_eq!(engine.runtime().equivalent_type_cache_entry_points().len(), 1);

    engine.remove_function(f).unwrap();
    assert!(engine.runtime().equivalent_type_cache_entry_points().is_empty());
    assert_eq!(engine.runtime().unique_guard_count(P), 0);
}
