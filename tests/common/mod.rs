//! Shared fixtures for the integration tests
//!
//! - `ScriptedBackend`: the synthetic backend with per-function overrides
//!   for forced failures, invalidation during compile and extra transfer data
//! - Engine and function builders with a fixed byte-code shape

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tierkeeper::backend::guards::EquivalentTypeCache;
use tierkeeper::backend::*;

/// One scripted deviation from a plain synthetic compile
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub enum Script {
    Fail(CodegenError),
    /// Invalidate every shared guard of the work item before compiling,
    /// as if the property changed while the backend was running
    InvalidateSharedGuards,
    /// Add an equivalent-type cache holding `TypeRef` to the package
    EquivalentType(TypeRef),
}

/// Synthetic backend whose behaviour can be scripted per function name
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    inner: SyntheticBackend,
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    compiled: Mutex<Vec<(String, JitTier)>>,
}

#[allow(dead_code)]
impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(ScriptedBackend::default())
    }

    pub fn with_options(options: SyntheticOptions) -> Arc<Self> {
        Arc::new(ScriptedBackend {
            inner: SyntheticBackend::new(options),
            ..Default::default()
        })
    }

    /// Queue `script` for the next compile of `function`
    pub fn script(&self, function: &str, script: Script) {
        self.scripts
            .lock()
            .entry(function.to_string())
            .or_default()
            .push_back(script);
    }

    /// Every work item compiled so far, in order
    pub fn compiled(&self) -> Vec<(String, JitTier)> {
        self.compiled.lock().clone()
    }
}

impl CodegenBackend for ScriptedBackend {
    fn compile(&self, item: &WorkItem) -> CodegenResult<CodeGenOutput> {
        let script = self
            .scripts
            .lock()
            .get_mut(&*item.function_name)
            .and_then(VecDeque::pop_front);
        self.compiled
            .lock()
            .push((item.function_name.to_string(), item.tier));

        match script {
            None => self.inner.compile(item),
            Some(Script::Fail(err)) => Err(err),
            Some(Script::InvalidateSharedGuards) => {
                for (_, guard) in &item.shared_guards {
                    guard.invalidate();
                }
                self.inner.compile(item)
            }
            Some(Script::EquivalentType(type_ref)) => {
                let mut output = self.inner.compile(item)?;
                let mut cache =
                    EquivalentTypeCache::new(PropertyGuard::for_type(PropertyId(0), type_ref), 0);
                cache.add_type(type_ref);
                output.transfer.equivalent_type_guards.push(cache);
                Ok(output)
            }
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Inline compilation, everything else stock
#[allow(dead_code)]
pub fn config() -> TieringConfig {
    TieringConfig {
        background_compilation: false,
        ..Default::default()
    }
}

#[allow(dead_code)]
pub fn engine(config: TieringConfig, backend: &Arc<ScriptedBackend>) -> Engine {
    let backend: Arc<dyn CodegenBackend> = Arc::clone(backend) as Arc<dyn CodegenBackend>;
    Engine::new(config, backend).expect("valid config")
}

/// Byte code with one property cache per entry of `properties` and one loop
#[allow(dead_code)]
pub fn byte_code(properties: &[PropertyId]) -> ByteCodeOutput {
    ByteCodeOutput {
        byte_code: vec![0x5a; 32],
        inline_cache_layout: InlineCacheLayout {
            property: properties.len() as u32,
            ..Default::default()
        },
        inline_cache_properties: properties.to_vec(),
        statements: vec![
            StatementData::new(0, 0),
            StatementData::new(12, 10),
            StatementData::new(30, 22),
        ],
        loop_headers: vec![10..22],
        ..Default::default()
    }
}

/// Add and parse a function named `name`
#[allow(dead_code)]
pub fn parsed_function(engine: &mut Engine, name: &str, properties: &[PropertyId]) -> FunctionId {
    let f = engine.add_function(name, 0..64);
    engine
        .mark_script_complete(f, byte_code(properties))
        .expect("script complete");
    f
}

/// Call `function` `calls` times, draining completions after each call
#[allow(dead_code)]
pub fn call(engine: &mut Engine, function: FunctionId, calls: usize) -> CallTarget {
    let mut target = CallTarget::Thunk(ThunkKind::Interpreter);
    for _ in 0..calls {
        target = engine.on_function_call(function).expect("call");
        engine.checkpoint();
    }
    target
}

/// Default entry point of `function`
#[allow(dead_code)]
pub fn default_entry_point(engine: &Engine, function: FunctionId) -> EntryPointId {
    engine
        .function(function)
        .and_then(FunctionUnit::default_entry_point)
        .expect("default entry point")
}
