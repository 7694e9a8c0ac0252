//! Background native code generation.
//!
//! ```text
//!  mutator                         codegen thread
//!  ───────                         ──────────────
//!  submit(WorkItem) ──jobs──────►  cancelled? ──► jit limit? ──► backend.compile
//!                                                                     │
//!  drain() ◄──────completions────  CodeGenCompletion { job, entry_point, result }
//! ```
//!
//! The worker never sees an entry point, only the [`WorkItem`] snapshot taken
//! at dispatch, and it never blocks on the mutator. Results travel back as
//! messages that the engine drains at its checkpoints.
//!
//! With `background_compilation = false` work items compile on the calling
//! thread and their completions are queued on the same channel, so the engine
//! handles both modes identically.

pub mod code_allocator;
pub mod synthetic;

pub use code_allocator::{CodeAllocation, CodeAllocator};
pub use synthetic::{SyntheticBackend, SyntheticOptions};

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashSet;
use tracing::{debug, trace, warn};

use super::config::TieringConfig;
use super::entry_point::{EntryPointId, LazyBailOutRecord};
use super::error::{CodegenError, CodegenResult};
use super::function::FunctionId;
use super::guards::{PropertyGuard, PropertyId};
use super::tier::JitTier;
use super::transfer::CompilationTransferPackage;

/// Identifier of one submitted work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

/// Everything the backend needs to compile one entry point
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub job: JobId,
    pub entry_point: EntryPointId,
    pub function: FunctionId,
    pub function_name: Arc<str>,
    pub tier: JitTier,
    pub loop_number: Option<u32>,
    pub byte_code: Arc<[u8]>,
    pub statement_count: u32,
    pub inline_cache_count: u32,
    /// Shared guards snapshotted at dispatch
    pub shared_guards: Vec<(PropertyId, PropertyGuard)>,
}

/// Backend output for one work item
#[derive(Debug, Clone, Default)]
pub struct CodeGenOutput {
    pub code: Vec<u8>,
    pub unwind: Vec<u8>,
    pub transfer: CompilationTransferPackage,
    /// `(native offset, statement index)` pairs in native offset order
    pub throw_map: Vec<(u32, u32)>,
    pub lazy_bailout_records: Vec<LazyBailOutRecord>,
}

/// Result message posted by the worker
#[derive(Debug)]
pub struct CodeGenCompletion {
    pub job: JobId,
    pub entry_point: EntryPointId,
    pub tier: JitTier,
    pub result: CodegenResult<CodeGenOutput>,
}

/// Machine code generator
pub trait CodegenBackend: Send + Sync {
    fn compile(&self, item: &WorkItem) -> CodegenResult<CodeGenOutput>;

    fn name(&self) -> &str {
        "backend"
    }
}

/// State shared between the generator and its worker thread
struct WorkerShared {
    backend: Arc<dyn CodegenBackend>,
    cancelled: DashSet<JobId>,
    jit_limit: Option<u32>,
    compiled: AtomicU32,
    shutdown: AtomicBool,
}

impl WorkerShared {
    fn run(&self, item: WorkItem) -> CodeGenCompletion {
        let result = if self.cancelled.remove(&item.job).is_some() {
            trace!(job = %item.job, "work item cancelled before compile");
            Err(CodegenError::Aborted)
        } else if self
            .jit_limit
            .is_some_and(|limit| self.compiled.load(Ordering::Acquire) >= limit)
        {
            Err(CodegenError::ExceedJitLimit)
        } else {
            let result = self.backend.compile(&item);
            if result.is_ok() {
                self.compiled.fetch_add(1, Ordering::AcqRel);
            }
            result
        };
        CodeGenCompletion {
            job: item.job,
            entry_point: item.entry_point,
            tier: item.tier,
            result,
        }
    }
}

fn worker_loop(shared: Arc<WorkerShared>, jobs: Receiver<WorkItem>, done: Sender<CodeGenCompletion>) {
    while let Ok(item) = jobs.recv() {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        let completion = shared.run(item);
        if done.send(completion).is_err() {
            break;
        }
    }
    trace!("codegen worker exiting");
}

/// Owner of the compile queue and its background thread
pub struct NativeCodeGenerator {
    shared: Arc<WorkerShared>,
    jobs: Option<Sender<WorkItem>>,
    completions_tx: Sender<CodeGenCompletion>,
    completions: Receiver<CodeGenCompletion>,
    worker: Option<JoinHandle<()>>,
    next_job: u64,
    in_flight: usize,
}

impl fmt::Debug for NativeCodeGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeCodeGenerator")
            .field("backend", &self.shared.backend.name())
            .field("background", &self.worker.is_some())
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

impl NativeCodeGenerator {
    pub fn new(backend: Arc<dyn CodegenBackend>, config: &TieringConfig) -> io::Result<Self> {
        let shared = Arc::new(WorkerShared {
            backend,
            cancelled: DashSet::new(),
            jit_limit: config.jit_limit,
            compiled: AtomicU32::new(0),
            shutdown: AtomicBool::new(false),
        });
        let (completions_tx, completions) = unbounded();

        let (jobs, worker) = if config.background_compilation {
            let (jobs_tx, jobs_rx) = unbounded();
            let worker_shared = Arc::clone(&shared);
            let done = completions_tx.clone();
            let handle = thread::Builder::new()
                .name("tierkeeper-codegen".to_string())
                .spawn(move || worker_loop(worker_shared, jobs_rx, done))?;
            (Some(jobs_tx), Some(handle))
        } else {
            (None, None)
        };

        debug!(
            backend = shared.backend.name(),
            background = worker.is_some(),
            "native code generator started"
        );
        Ok(NativeCodeGenerator {
            shared,
            jobs,
            completions_tx,
            completions,
            worker,
            next_job: 1,
            in_flight: 0,
        })
    }

    /// Allocate the id for the next work item
    pub fn next_job_id(&mut self) -> JobId {
        let job = JobId(self.next_job);
        self.next_job += 1;
        job
    }

    pub fn is_background(&self) -> bool {
        self.worker.is_some()
    }

    /// Queue a work item; in foreground mode it compiles before returning
    pub fn submit(&mut self, item: WorkItem) -> CodegenResult<()> {
        match &self.jobs {
            Some(jobs) => {
                jobs.send(item).map_err(|_| CodegenError::Aborted)?;
            }
            None => {
                let completion = self.shared.run(item);
                self.completions_tx
                    .send(completion)
                    .map_err(|_| CodegenError::Aborted)?;
            }
        }
        self.in_flight += 1;
        Ok(())
    }

    /// Ask the worker to skip `job` if it has not started it yet
    pub fn cancel(&self, job: JobId) {
        self.shared.cancelled.insert(job);
    }

    /// Completions that have already arrived
    pub fn drain(&mut self) -> Vec<CodeGenCompletion> {
        let drained: Vec<_> = self.completions.try_iter().collect();
        self.in_flight -= drained.len().min(self.in_flight);
        self.forget_cancelled(&drained);
        drained
    }

    /// Block until every submitted item has completed
    pub fn wait_all(&mut self) -> Vec<CodeGenCompletion> {
        let mut drained = Vec::with_capacity(self.in_flight);
        while self.in_flight > 0 {
            match self.completions.recv() {
                Ok(completion) => {
                    self.in_flight -= 1;
                    drained.push(completion);
                }
                Err(_) => {
                    warn!(lost = self.in_flight, "completion channel closed");
                    self.in_flight = 0;
                }
            }
        }
        self.forget_cancelled(&drained);
        drained
    }

    fn forget_cancelled(&self, completions: &[CodeGenCompletion]) {
        for completion in completions {
            self.shared.cancelled.remove(&completion.job);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Successful compiles counted against the JIT limit
    pub fn compiled(&self) -> u32 {
        self.shared.compiled.load(Ordering::Acquire)
    }

    /// Stop the worker; queued items are dropped without completions
    pub fn shutdown(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        drop(self.jobs.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("codegen worker panicked");
            }
        }
        self.in_flight = 0;
    }
}

impl Drop for NativeCodeGenerator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::arena::test_handle;

    fn work_item(generator: &mut NativeCodeGenerator, byte_code: &[u8]) -> WorkItem {
        WorkItem {
            job: generator.next_job_id(),
            entry_point: test_handle(0),
            function: test_handle(0),
            function_name: Arc::from("f"),
            tier: JitTier::FullJit,
            loop_number: None,
            byte_code: Arc::from(byte_code),
            statement_count: 2,
            inline_cache_count: 0,
            shared_guards: Vec::new(),
        }
    }

    fn generator(config: &TieringConfig) -> NativeCodeGenerator {
        NativeCodeGenerator::new(Arc::new(SyntheticBackend::default()), config).unwrap()
    }

    #[test]
    fn test_background_compile_round_trip() {
        let mut gen = generator(&TieringConfig::default());
        assert!(gen.is_background());
        let item = work_item(&mut gen, &[1, 2, 3, 4]);
        let job = item.job;
        gen.submit(item).unwrap();
        let done = gen.wait_all();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].job, job);
        assert!(done[0].result.is_ok());
        assert_eq!(gen.in_flight(), 0);
        assert_eq!(gen.compiled(), 1);
    }

    #[test]
    fn test_foreground_compiles_on_submit() {
        let config = TieringConfig {
            background_compilation: false,
            ..Default::default()
        };
        let mut gen = generator(&config);
        assert!(!gen.is_background());
        let item = work_item(&mut gen, &[0; 8]);
        gen.submit(item).unwrap();
        assert_eq!(gen.drain().len(), 1);
    }

    #[test]
    fn test_cancelled_job_is_aborted() {
        let config = TieringConfig {
            background_compilation: false,
            ..Default::default()
        };
        let mut gen = generator(&config);
        let item = work_item(&mut gen, &[0; 8]);
        gen.cancel(item.job);
        gen.submit(item).unwrap();
        let done = gen.drain();
        assert_eq!(done[0].result.as_ref().err(), Some(&CodegenError::Aborted));
        assert_eq!(gen.compiled(), 0);
    }

    #[test]
    fn test_jit_limit() {
        let config = TieringConfig {
            background_compilation: false,
            jit_limit: Some(1),
            ..Default::default()
        };
        let mut gen = generator(&config);
        for _ in 0..2 {
            let item = work_item(&mut gen, &[0; 8]);
            gen.submit(item).unwrap();
        }
        let done = gen.drain();
        assert!(done[0].result.is_ok());
        assert_eq!(done[1].result.as_ref().err(), Some(&CodegenError::ExceedJitLimit));
    }
}
