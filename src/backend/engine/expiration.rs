//! Expirable collect mode: freeing native code nobody calls any more.
//!
//! ```text
//!   try_enter ──► scan starts (every installed entry point snapshots usage)
//!       │
//!       ├─ on_collection × expirable_collection_gc_count
//!       │
//!       └─► expire every entry point unused since the scan ──► exit
//! ```
//!
//! Entering requires at least `expirable_code_size_threshold` bytes of live
//! native code. An expired default entry point falls back to a still-installed
//! SimpleJit entry point when there is one; otherwise the function starts over
//! from the interpreter with a fresh default entry point.

use tracing::{debug, trace};

use super::Engine;
use crate::backend::entry_point::{CleanupReason, EntryPointId, EntryPointState};
use crate::backend::error::{EngineResult, EntryPointError};
use crate::backend::trace::TraceEvent;

/// Expirable collect mode bookkeeping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpirableCollectMode {
    pub active: bool,
    /// Collections seen since the mode was entered
    pub collections: u32,
}

/// What one collection did to compiled code
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionReport {
    pub redeferred: usize,
    pub expired: usize,
    pub freed: usize,
    pub left_expirable_mode: bool,
}

impl Engine {
    pub fn expirable_collect_mode(&self) -> ExpirableCollectMode {
        self.expirable
    }

    /// Start an expiration scan if enough native code is live
    pub fn try_enter_expirable_collect_mode(&mut self) -> bool {
        if self.expirable.active {
            return true;
        }
        let live = self.code_allocator.live_bytes();
        if live < self.config.expirable_code_size_threshold {
            trace!(live, threshold = self.config.expirable_code_size_threshold, "too little code to expire");
            return false;
        }
        let mut scanned = 0;
        for handle in self.entry_points.handles() {
            if let Some(ep) = self.entry_points.get_mut(handle) {
                if ep.native_address().is_some() {
                    ep.begin_expiration_scan();
                    scanned += 1;
                }
            }
        }
        self.expirable = ExpirableCollectMode {
            active: true,
            collections: 0,
        };
        debug!(live, scanned, "entered expirable collect mode");
        true
    }

    pub fn try_exit_expirable_collect_mode(&mut self) -> bool {
        if !self.expirable.active {
            return false;
        }
        self.expirable = ExpirableCollectMode::default();
        debug!("left expirable collect mode");
        true
    }

    /// Collector hook, run once per garbage collection
    ///
    /// Ages functions for redeferral, counts down expirable collect mode,
    /// purges invalidated unique guards and frees retired entry points when
    /// outside script.
    pub fn on_collection(&mut self) -> CollectionReport {
        let mut report = CollectionReport {
            redeferred: self.redeferral_pass(),
            ..Default::default()
        };
        if self.expirable.active {
            self.expirable.collections += 1;
            if self.expirable.collections >= self.config.expirable_collection_gc_count {
                report.expired = self.expire_unused();
                report.left_expirable_mode = self.try_exit_expirable_collect_mode();
            }
        }
        self.runtime.clear_invalidated_unique_guards();
        report.freed = self.process_pending_cleanup();
        report
    }

    fn expire_unused(&mut self) -> usize {
        let candidates: Vec<EntryPointId> = self
            .entry_points
            .iter()
            .filter(|(_, ep)| ep.native_address().is_some() && !ep.used_since_last_scan())
            .map(|(id, _)| id)
            .collect();
        let mut expired = 0;
        for entry_point in candidates {
            match self.expire(entry_point) {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(err) => debug!(?entry_point, %err, "expiry skipped"),
            }
        }
        expired
    }

    /// Retire `entry_point` if it went unused since the scan
    ///
    /// Returns false without doing anything for code that was called, is not
    /// installed, or is already retired.
    pub fn expire(&mut self, entry_point: EntryPointId) -> EngineResult<bool> {
        let ep = self.entry_point_ref(entry_point)?;
        if ep.used_since_last_scan() || ep.native_address().is_none() || ep.state().is_retired() {
            return Ok(false);
        }
        let function = ep.function();

        if let Some(loop_number) = ep.loop_number() {
            self.retire_entry_point(entry_point, CleanupReason::Expired);
            self.reset_loop_header(function, loop_number);
        } else {
            let unit = self
                .functions
                .get_mut(function)
                .ok_or(EntryPointError::UnknownFunction)?;
            if unit.default_entry_point() == Some(entry_point) {
                let entry_points = &self.entry_points;
                let fallback = unit.simple_jit_entry_point().filter(|&simple| {
                    simple != entry_point
                        && entry_points
                            .get(simple)
                            .is_some_and(|ep| ep.state() == EntryPointState::CodeGenDone)
                });
                match fallback {
                    Some(simple) => {
                        debug!(?function, ?entry_point, fallback = ?simple, "default expired, SimpleJit takes over");
                        unit.set_default_entry_point(Some(simple));
                    }
                    None => {
                        let from = unit.state_machine().execution_mode();
                        unit.state_machine_mut().reinitialize(&self.config);
                        self.note_tier_change(function, from, "expired");
                        self.create_entry_point(function)?;
                    }
                }
            }
            self.retire_entry_point(entry_point, CleanupReason::Expired);
        }

        self.stats.expirations += 1;
        self.emit(TraceEvent::Expired { entry_point });
        self.refresh_call_sites(function);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::codegen::{SyntheticBackend, SyntheticOptions};
    use crate::backend::config::TieringConfig;
    use crate::backend::entry_point::CallTarget;
    use crate::backend::function::{ByteCodeOutput, FunctionId};
    use crate::backend::offset_map::StatementData;
    use crate::backend::tier::{ExecutionTier, JitTier};
    use std::sync::Arc;

    fn engine(threshold: usize) -> Engine {
        let config = TieringConfig {
            background_compilation: false,
            expirable_code_size_threshold: threshold,
            expirable_collection_gc_count: 2,
            enable_redeferral: false,
            ..Default::default()
        };
        Engine::new(config, Arc::new(SyntheticBackend::new(SyntheticOptions::default()))).unwrap()
    }

    fn parsed(engine: &mut Engine) -> FunctionId {
        let f = engine.add_function("f", 0..10);
        let output = ByteCodeOutput {
            byte_code: vec![3; 8],
            statements: vec![StatementData::new(0, 0)],
            ..Default::default()
        };
        engine.mark_script_complete(f, output).unwrap();
        f
    }

    fn run_to_full_jit(engine: &mut Engine, f: FunctionId) {
        for _ in 0..200 {
            engine.on_function_call(f).unwrap();
            engine.checkpoint();
        }
        assert_eq!(engine.execution_mode(f), Some(ExecutionTier::FullJit));
    }

    #[test]
    fn test_enter_requires_code_size() {
        let mut engine = engine(1 << 20);
        let f = parsed(&mut engine);
        run_to_full_jit(&mut engine, f);
        assert!(!engine.try_enter_expirable_collect_mode());
        assert!(!engine.try_exit_expirable_collect_mode());
    }

    #[test]
    fn test_expired_default_falls_back_to_simple_jit() {
        let mut engine = engine(0);
        let f = parsed(&mut engine);
        run_to_full_jit(&mut engine, f);
        let unit = engine.function(f).unwrap();
        let full = unit.default_entry_point().unwrap();
        let simple = unit.simple_jit_entry_point().unwrap();
        assert_ne!(full, simple);

        assert!(engine.try_enter_expirable_collect_mode());
        assert_eq!(engine.expire(full), Ok(true));
        assert_eq!(engine.function(f).unwrap().default_entry_point(), Some(simple));
        let simple_address = engine.entry_point(simple).unwrap().native_address().unwrap();
        assert_eq!(engine.call_target(f), Some(CallTarget::Native(simple_address)));
        assert_eq!(
            engine.entry_point(full).unwrap().state(),
            EntryPointState::PendingCleanup
        );
        assert_eq!(engine.stats().expirations, 1);
    }

    #[test]
    fn test_expired_without_fallback_restarts_tiering() {
        let mut engine = engine(0);
        let f = parsed(&mut engine);
        run_to_full_jit(&mut engine, f);
        assert!(engine.try_enter_expirable_collect_mode());

        // Two collections with no calls expire both entry points
        assert_eq!(engine.on_collection().expired, 0);
        let report = engine.on_collection();
        assert_eq!(report.expired, 2);
        assert!(report.left_expirable_mode);
        assert_eq!(report.freed, 2);

        assert_eq!(engine.execution_mode(f), Some(ExecutionTier::Interpreter));
        let unit = engine.function(f).unwrap();
        let fresh = unit.default_entry_point().unwrap();
        assert_eq!(
            engine.entry_point(fresh).unwrap().state(),
            EntryPointState::NotScheduled
        );
        assert_eq!(unit.simple_jit_entry_point(), None);
        assert_eq!(engine.code_allocator().live_allocations(), 0);
    }

    #[test]
    fn test_used_code_survives() {
        let mut engine = engine(0);
        let f = parsed(&mut engine);
        run_to_full_jit(&mut engine, f);
        let full = engine.function(f).unwrap().default_entry_point().unwrap();
        assert!(engine.try_enter_expirable_collect_mode());
        engine.on_function_call(f).unwrap();
        assert_eq!(engine.expire(full), Ok(false));
        assert_eq!(
            engine.entry_point(full).unwrap().jit_tier(),
            Some(JitTier::FullJit)
        );
    }
}
