// Tiering hot-path benchmarks
//
// 1. Execution state machine: per-call accounting and transition checks
// 2. Engine call path: calls into installed code and the interpreter
// 3. Inline cache lookups: monomorphic hits and polymorphic promotion

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tierkeeper::backend::*;

// ================================================================================================
// Helper Functions
// ================================================================================================

fn inline_config() -> TieringConfig {
    TieringConfig {
        background_compilation: false,
        ..Default::default()
    }
}

fn create_engine() -> Engine {
    Engine::new(inline_config(), Arc::new(SyntheticBackend::default()))
        .expect("default configuration is valid")
}

fn byte_code() -> ByteCodeOutput {
    ByteCodeOutput {
        byte_code: vec![0x5a; 64],
        inline_cache_layout: InlineCacheLayout {
            property: 2,
            ..Default::default()
        },
        inline_cache_properties: vec![PropertyId(1), PropertyId(2)],
        statements: vec![StatementData::new(0, 0), StatementData::new(20, 32)],
        ..Default::default()
    }
}

/// Engine with one function called `warm_up` times
fn create_warm_function(warm_up: usize) -> (Engine, FunctionId) {
    let mut engine = create_engine();
    let f = engine.add_function("f", 0..64);
    engine
        .mark_script_complete(f, byte_code())
        .expect("fresh function parses");
    for _ in 0..warm_up {
        engine.on_function_call(f).expect("call");
        engine.checkpoint();
    }
    (engine, f)
}

// ================================================================================================
// Benchmarks
// ================================================================================================

fn bench_state_machine_walk(c: &mut Criterion) {
    let config = TieringConfig::default();

    c.bench_function("state_machine_walk_to_full_jit", |b| {
        b.iter(|| {
            let mut m = ExecutionStateMachine::new(&config, TierAvailability::from_config(&config));
            let mut requests = 0;
            while m.execution_mode() != ExecutionTier::FullJit {
                m.increment_executed(1);
                if m.try_transition_to_jit_execution_mode() {
                    requests += 1;
                }
            }
            black_box(requests)
        })
    });
}

fn bench_function_call(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_function_call");

    // Interpreter, SimpleJit installed, FullJit installed
    for warm_up in [0usize, 30, 200].iter() {
        let (mut engine, f) = create_warm_function(*warm_up);
        group.bench_with_input(BenchmarkId::from_parameter(warm_up), warm_up, |b, _| {
            b.iter(|| black_box(engine.on_function_call(f)))
        });
    }

    group.finish();
}

fn bench_inline_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("inline_cache_access");

    for types in [1u64, 4, 16].iter() {
        let (mut engine, f) = create_warm_function(0);
        let type_refs: Vec<TypeRef> = (0..*types).map(|t| TypeRef::new(0x1000 + t * 0x40)).collect();
        group.bench_with_input(BenchmarkId::from_parameter(types), &type_refs, |b, type_refs| {
            b.iter(|| {
                for &t in type_refs {
                    black_box(engine.record_inline_cache_access(f, 0, t, 1, CacheSource::Local).ok());
                }
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_state_machine_walk, bench_function_call, bench_inline_cache);
criterion_main!(benches);
