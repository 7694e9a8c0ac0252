//! Redeferral: returning inactive functions to their deferred form.
//!
//! A function that goes `redeferral_inactive_collections` collections without
//! a call loses its byte code, inline caches and every entry point, and its
//! call sites go back to the deferred-parse thunk. The next call reparses it
//! and tiering starts over from the interpreter.

use tracing::{debug, trace};

use super::Engine;
use crate::backend::entry_point::CleanupReason;
use crate::backend::error::{EngineResult, EntryPointError};
use crate::backend::function::FunctionId;
use crate::backend::trace::TraceEvent;

impl Engine {
    /// Drop the body of `function` and everything compiled from it
    ///
    /// Refused for deferred functions, for functions marked `dont_redefer`
    /// and while any of its entry points is compiling.
    pub fn redefer_function(&mut self, function: FunctionId) -> EngineResult<bool> {
        let unit = self.function_ref(function)?;
        let Some(body) = unit.body() else {
            return Ok(false);
        };
        if body.attributes().dont_redefer {
            return Ok(false);
        }
        let entry_points = unit.all_entry_points();
        let compiling = entry_points.iter().any(|&ep| {
            self.entry_points
                .get(ep)
                .is_some_and(|ep| ep.state().is_compiling())
        });
        if compiling {
            trace!(?function, "redeferral postponed, compile in flight");
            return Ok(false);
        }
        let from = unit.state_machine().execution_mode();

        for entry_point in entry_points {
            self.retire_entry_point(entry_point, CleanupReason::Redeferred);
        }
        self.release_body(function);

        let config = &self.config;
        let unit = self
            .functions
            .get_mut(function)
            .ok_or(EntryPointError::UnknownFunction)?;
        unit.state_machine_mut().reinitialize(config);
        unit.set_post_bailout(false);
        unit.reset_inactivity();
        self.note_tier_change(function, from, "redeferred");
        self.refresh_call_sites(function);

        self.stats.redeferrals += 1;
        self.emit(TraceEvent::Redeferred { function });
        debug!(?function, "function redeferred");
        Ok(true)
    }

    /// Age every parsed function and redefer the ones inactive for long enough
    ///
    /// Skipped while script is running, since the functions on the stack are
    /// unknown.
    pub fn redeferral_pass(&mut self) -> usize {
        if !self.config.enable_redeferral || self.script_depth > 0 {
            return 0;
        }
        let threshold = self.config.redeferral_inactive_collections;
        let mut candidates = Vec::new();
        for handle in self.functions.handles() {
            let Some(unit) = self.functions.get_mut(handle) else {
                continue;
            };
            if unit.is_deferred() {
                continue;
            }
            if unit.age() >= threshold {
                candidates.push(handle);
            }
        }
        candidates
            .into_iter()
            .filter(|&function| matches!(self.redefer_function(function), Ok(true)))
            .count()
    }
}
