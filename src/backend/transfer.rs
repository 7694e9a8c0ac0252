//! Compilation transfer package processing.
//!
//! The background compiler describes every guard and cache its code depends
//! on in a [`CompilationTransferPackage`]. The mutator turns that description
//! into runtime registrations exactly once, right before the code becomes
//! callable:
//!
//! ```text
//!  package ──take()──► pinned types ──► type guards ──► equivalent caches
//!                                                     ──► constructor caches
//!                                                     ──► lazy bailouts
//!                              every registration ──► TransferLedger
//! ```
//!
//! ## Design
//!
//! A type guard is only registered while the shared guard snapshot taken at
//! dispatch is still valid. If the property was invalidated while the code
//! was compiling, the unique guards are invalidated instead and never
//! registered, so the new code bails out the first time it checks them.
//!
//! Registration can fail (the runtime context is bounded). Every successful
//! step is recorded in a [`TransferLedger`] which is unwound in reverse on
//! failure, leaving the runtime exactly as it was.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::entry_point::EntryPointId;
use super::error::CodegenResult;
use super::guards::{
    ConstructorCache, EquivalentTypeCache, PropertyGuard, PropertyId, RuntimeContext, TypeRef,
};

// =============================================================================
// Package
// =============================================================================

/// Unique guards the compiled code checks for one property
#[derive(Debug, Clone)]
pub struct TypeGuardTransferEntry {
    pub property: PropertyId,
    pub guards: Vec<PropertyGuard>,
}

/// Constructor caches the compiled code relies on for one property
#[derive(Debug, Clone)]
pub struct CtorCacheTransferEntry {
    pub property: PropertyId,
    pub caches: Vec<Arc<ConstructorCache>>,
}

/// Guard and cache data produced by the compiler for one entry point
#[derive(Debug, Clone, Default)]
pub struct CompilationTransferPackage {
    pub pinned_type_refs: Vec<TypeRef>,
    pub property_guards: Vec<TypeGuardTransferEntry>,
    pub ctor_cache_guards: Vec<CtorCacheTransferEntry>,
    pub equivalent_type_guards: Vec<EquivalentTypeCache>,
    pub lazy_bailout_properties: Vec<PropertyId>,
}

impl CompilationTransferPackage {
    pub fn is_empty(&self) -> bool {
        self.pinned_type_refs.is_empty()
            && self.property_guards.is_empty()
            && self.ctor_cache_guards.is_empty()
            && self.equivalent_type_guards.is_empty()
            && self.lazy_bailout_properties.is_empty()
    }

    /// Number of unique type guards across all properties
    pub fn unique_guard_count(&self) -> usize {
        self.property_guards.iter().map(|e| e.guards.len()).sum()
    }

    /// Invalidate every guard the package mentions
    pub fn invalidate_all(&self) {
        for guard in self.property_guards.iter().flat_map(|e| e.guards.iter()) {
            guard.invalidate();
        }
        for cache in &self.equivalent_type_guards {
            cache.guard().invalidate();
        }
    }
}

// =============================================================================
// Transferred state
// =============================================================================

/// Runtime-owned result of processing a package, held by the entry point
#[derive(Debug, Default)]
pub struct TransferredGuards {
    pinned_type_refs: Box<[Option<TypeRef>]>,
    unique_guards: Vec<(PropertyId, PropertyGuard)>,
    rejected_guards: Vec<PropertyGuard>,
    constructor_caches: Vec<(PropertyId, Arc<ConstructorCache>)>,
    equivalent_type_caches: Box<[EquivalentTypeCache]>,
    lazy_bailout_properties: Vec<PropertyId>,
    registered_equivalent_types: bool,
}

impl TransferredGuards {
    /// Pinned types followed by one `None` terminator
    pub fn pinned_type_refs(&self) -> &[Option<TypeRef>] {
        &self.pinned_type_refs
    }

    /// Unique guards registered with the runtime context
    pub fn unique_guards(&self) -> impl Iterator<Item = &PropertyGuard> {
        self.unique_guards.iter().map(|(_, guard)| guard)
    }

    /// Unique guards invalidated at transfer because the property changed
    pub fn rejected_guards(&self) -> &[PropertyGuard] {
        &self.rejected_guards
    }

    pub fn constructor_caches(&self) -> impl Iterator<Item = &Arc<ConstructorCache>> {
        self.constructor_caches.iter().map(|(_, cache)| cache)
    }

    pub fn equivalent_type_caches(&self) -> &[EquivalentTypeCache] {
        &self.equivalent_type_caches
    }

    pub fn equivalent_type_caches_mut(&mut self) -> &mut [EquivalentTypeCache] {
        &mut self.equivalent_type_caches
    }

    pub fn lazy_bailout_properties(&self) -> &[PropertyId] {
        &self.lazy_bailout_properties
    }

    /// Registrations this entry point holds in the runtime context
    pub fn registration_count(&self) -> usize {
        self.unique_guards.len() + self.constructor_caches.len() + self.lazy_bailout_properties.len()
    }

    /// Undo every runtime registration (normal cleanup)
    pub fn unregister(&mut self, entry_point: EntryPointId, runtime: &RuntimeContext) {
        for (property, guard) in self.unique_guards.drain(..) {
            runtime.unregister_unique_property_guard(property, &guard);
        }
        for (property, cache) in self.constructor_caches.drain(..) {
            runtime.unregister_constructor_cache(property, &cache);
        }
        for property in self.lazy_bailout_properties.drain(..) {
            runtime.unregister_lazy_bailout(property, entry_point);
        }
        if self.registered_equivalent_types {
            runtime.unregister_equivalent_type_cache_entry_point(entry_point);
            self.registered_equivalent_types = false;
        }
        self.rejected_guards.clear();
        self.equivalent_type_caches = Box::default();
        self.pinned_type_refs = Box::default();
    }

    /// Forget everything without touching the runtime (shutdown)
    pub fn zero(&mut self) {
        for cache in self.equivalent_type_caches.iter_mut() {
            cache.zero();
        }
        *self = TransferredGuards::default();
    }
}

// =============================================================================
// Ledger
// =============================================================================

#[derive(Debug)]
enum LedgerEntry {
    UniqueGuard(PropertyId, PropertyGuard),
    ConstructorCache(PropertyId, Arc<ConstructorCache>),
    EquivalentTypeEntryPoint,
    LazyBailout(PropertyId),
}

/// Registrations performed so far, for reverse-order rollback
#[derive(Debug, Default)]
pub struct TransferLedger {
    entries: Vec<LedgerEntry>,
}

impl TransferLedger {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Undo every recorded registration, newest first
    pub fn rollback(mut self, entry_point: EntryPointId, runtime: &RuntimeContext) {
        while let Some(entry) = self.entries.pop() {
            match entry {
                LedgerEntry::UniqueGuard(property, guard) => {
                    runtime.unregister_unique_property_guard(property, &guard);
                    guard.invalidate();
                }
                LedgerEntry::ConstructorCache(property, cache) => {
                    runtime.unregister_constructor_cache(property, &cache);
                }
                LedgerEntry::EquivalentTypeEntryPoint => {
                    runtime.unregister_equivalent_type_cache_entry_point(entry_point);
                }
                LedgerEntry::LazyBailout(property) => {
                    runtime.unregister_lazy_bailout(property, entry_point);
                }
            }
        }
    }
}

// =============================================================================
// Processing
// =============================================================================

/// Turn a package into runtime registrations for `entry_point`
///
/// `shared_guards` is the snapshot of shared property guards taken when the
/// work item was dispatched. On error nothing stays registered, every guard in
/// the package is invalidated, and the error is returned.
pub fn process_transfer_package(
    package: CompilationTransferPackage,
    entry_point: EntryPointId,
    shared_guards: &HashMap<PropertyId, PropertyGuard>,
    runtime: &RuntimeContext,
) -> CodegenResult<TransferredGuards> {
    let mut ledger = TransferLedger::default();
    match transfer(&package, entry_point, shared_guards, runtime, &mut ledger) {
        Ok(transferred) => {
            debug!(
                ?entry_point,
                registrations = ledger.len(),
                rejected = transferred.rejected_guards.len(),
                "transfer package processed"
            );
            Ok(transferred)
        }
        Err(err) => {
            warn!(?entry_point, %err, undone = ledger.len(), "transfer package rolled back");
            ledger.rollback(entry_point, runtime);
            package.invalidate_all();
            Err(err)
        }
    }
}

fn transfer(
    package: &CompilationTransferPackage,
    entry_point: EntryPointId,
    shared_guards: &HashMap<PropertyId, PropertyGuard>,
    runtime: &RuntimeContext,
    ledger: &mut TransferLedger,
) -> CodegenResult<TransferredGuards> {
    let mut out = TransferredGuards {
        pinned_type_refs: package
            .pinned_type_refs
            .iter()
            .copied()
            .map(Some)
            .chain(std::iter::once(None))
            .collect(),
        ..Default::default()
    };

    for entry in &package.property_guards {
        let snapshot_valid = shared_guards
            .get(&entry.property)
            .map(PropertyGuard::is_valid)
            .unwrap_or(false);
        if !snapshot_valid {
            trace!(property = %entry.property, count = entry.guards.len(), "type guards rejected");
            for guard in &entry.guards {
                guard.invalidate();
                out.rejected_guards.push(guard.clone());
            }
            continue;
        }
        for guard in &entry.guards {
            runtime.register_unique_property_guard(entry.property, guard)?;
            ledger
                .entries
                .push(LedgerEntry::UniqueGuard(entry.property, guard.clone()));
            out.unique_guards.push((entry.property, guard.clone()));
        }
    }

    if !package.equivalent_type_guards.is_empty() {
        let caches: Box<[EquivalentTypeCache]> = package.equivalent_type_guards.clone().into();
        for type_ref in caches.iter().flat_map(EquivalentTypeCache::types) {
            runtime.mark_type_cached(type_ref);
        }
        runtime.register_equivalent_type_cache_entry_point(entry_point);
        ledger.entries.push(LedgerEntry::EquivalentTypeEntryPoint);
        out.equivalent_type_caches = caches;
        out.registered_equivalent_types = true;
    }

    for entry in &package.ctor_cache_guards {
        for cache in &entry.caches {
            runtime.register_constructor_cache(entry.property, cache)?;
            ledger
                .entries
                .push(LedgerEntry::ConstructorCache(entry.property, Arc::clone(cache)));
            out.constructor_caches
                .push((entry.property, Arc::clone(cache)));
        }
    }

    for &property in &package.lazy_bailout_properties {
        runtime.register_lazy_bailout(property, entry_point)?;
        ledger.entries.push(LedgerEntry::LazyBailout(property));
        out.lazy_bailout_properties.push(property);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::arena::test_handle;
    use crate::backend::config::TieringConfig;
    use crate::backend::error::CodegenError;

    const P: PropertyId = PropertyId(1);
    const Q: PropertyId = PropertyId(2);

    fn package_with_guards() -> (CompilationTransferPackage, Vec<PropertyGuard>) {
        let guards = vec![
            PropertyGuard::for_type(P, TypeRef::new(0x100)),
            PropertyGuard::for_type(P, TypeRef::new(0x200)),
        ];
        let package = CompilationTransferPackage {
            pinned_type_refs: vec![TypeRef::new(0x100), TypeRef::new(0x200)],
            property_guards: vec![TypeGuardTransferEntry {
                property: P,
                guards: guards.clone(),
            }],
            ..Default::default()
        };
        (package, guards)
    }

    #[test]
    fn test_valid_snapshot_registers_guards() {
        let runtime = RuntimeContext::default();
        let shared = runtime.register_shared_property_guard(P).unwrap();
        let snapshot = HashMap::from([(P, shared)]);
        let (package, guards) = package_with_guards();

        let out = process_transfer_package(package, test_handle(0), &snapshot, &runtime).unwrap();
        assert_eq!(out.pinned_type_refs().len(), 3);
        assert_eq!(out.pinned_type_refs()[2], None);
        assert_eq!(out.unique_guards().count(), 2);
        for guard in &guards {
            assert!(guard.is_valid());
            assert!(runtime.is_unique_guard_registered(P, guard));
        }
    }

    #[test]
    fn test_invalidated_snapshot_rejects_guards() {
        let runtime = RuntimeContext::default();
        let shared = runtime.register_shared_property_guard(P).unwrap();
        let snapshot = HashMap::from([(P, shared)]);
        runtime.invalidate_property_guards(P);
        let (package, guards) = package_with_guards();

        let out = process_transfer_package(package, test_handle(0), &snapshot, &runtime).unwrap();
        assert_eq!(out.unique_guards().count(), 0);
        assert_eq!(out.rejected_guards().len(), 2);
        for guard in &guards {
            assert!(!guard.is_valid());
            assert!(!runtime.is_unique_guard_registered(P, guard));
        }
    }

    #[test]
    fn test_missing_snapshot_rejects_guards() {
        let runtime = RuntimeContext::default();
        let (package, guards) = package_with_guards();
        let out =
            process_transfer_package(package, test_handle(0), &HashMap::new(), &runtime).unwrap();
        assert_eq!(out.rejected_guards().len(), 2);
        assert!(guards.iter().all(|g| !g.is_valid()));
        assert_eq!(runtime.live_registrations(), 0);
    }

    #[test]
    fn test_failure_rolls_back_everything() {
        let config = TieringConfig {
            guard_registry_capacity: Some(3),
            ..Default::default()
        };
        let runtime = RuntimeContext::new(&config);
        let shared = runtime.register_shared_property_guard(P).unwrap();
        let snapshot = HashMap::from([(P, shared)]);
        let (mut package, guards) = package_with_guards();
        package.lazy_bailout_properties = vec![Q];

        let ep = test_handle(0);
        let result = process_transfer_package(package, ep, &snapshot, &runtime);
        assert_eq!(result.err(), Some(CodegenError::OutOfMemory));
        assert_eq!(runtime.live_registrations(), 1);
        assert_eq!(runtime.unique_guard_count(P), 0);
        assert!(guards.iter().all(|g| !g.is_valid()));
        assert!(runtime.invalidate_property_guards(Q).is_empty());
    }

    #[test]
    fn test_shared_ctor_cache_survives_other_entry_point_cleanup() {
        let runtime = RuntimeContext::default();
        let ctor = ConstructorCache::new(Q, TypeRef::new(0x500), 1);
        let package = || CompilationTransferPackage {
            ctor_cache_guards: vec![CtorCacheTransferEntry {
                property: Q,
                caches: vec![Arc::clone(&ctor)],
            }],
            ..Default::default()
        };
        let (ep1, ep2) = (test_handle(1), test_handle(2));
        let mut out1 = process_transfer_package(package(), ep1, &HashMap::new(), &runtime).unwrap();
        let _out2 = process_transfer_package(package(), ep2, &HashMap::new(), &runtime).unwrap();
        assert_eq!(runtime.live_registrations(), 2);

        out1.unregister(ep1, &runtime);
        assert_eq!(runtime.live_registrations(), 1);
        assert!(runtime.is_unique_guard_registered(Q, ctor.guard()));

        // ep2 still depends on the cache, so a change to Q must reach it
        runtime.invalidate_property_guards(Q);
        assert!(!ctor.is_valid());
    }

    #[test]
    fn test_rollback_keeps_shared_ctor_cache_of_installed_entry_point() {
        let config = TieringConfig {
            guard_registry_capacity: Some(2),
            ..Default::default()
        };
        let runtime = RuntimeContext::new(&config);
        let ctor = ConstructorCache::new(Q, TypeRef::new(0x500), 1);
        let installed = CompilationTransferPackage {
            ctor_cache_guards: vec![CtorCacheTransferEntry {
                property: Q,
                caches: vec![Arc::clone(&ctor)],
            }],
            ..Default::default()
        };
        let _out = process_transfer_package(installed, test_handle(1), &HashMap::new(), &runtime)
            .unwrap();

        // Second entry point registers the cache, then runs out of room
        let failing = CompilationTransferPackage {
            ctor_cache_guards: vec![CtorCacheTransferEntry {
                property: Q,
                caches: vec![Arc::clone(&ctor)],
            }],
            lazy_bailout_properties: vec![P],
            ..Default::default()
        };
        let result = process_transfer_package(failing, test_handle(2), &HashMap::new(), &runtime);
        assert_eq!(result.err(), Some(CodegenError::OutOfMemory));
        assert_eq!(runtime.unique_guard_count(Q), 1);
        assert!(runtime.is_unique_guard_registered(Q, ctor.guard()));
    }

    #[test]
    fn test_equivalent_caches_and_unregister() {
        let runtime = RuntimeContext::default();
        let mut cache = EquivalentTypeCache::new(PropertyGuard::new(P), 1);
        cache.add_type(TypeRef::new(0x300));
        let ctor = ConstructorCache::new(Q, TypeRef::new(0x400), 2);
        let package = CompilationTransferPackage {
            equivalent_type_guards: vec![cache],
            ctor_cache_guards: vec![CtorCacheTransferEntry {
                property: Q,
                caches: vec![Arc::clone(&ctor)],
            }],
            lazy_bailout_properties: vec![P],
            ..Default::default()
        };
        let ep = test_handle(4);

        let mut out = process_transfer_package(package, ep, &HashMap::new(), &runtime).unwrap();
        assert_eq!(out.equivalent_type_caches().len(), 1);
        assert!(runtime.is_type_cached(TypeRef::new(0x300)));
        assert_eq!(runtime.equivalent_type_cache_entry_points(), vec![ep]);
        assert_eq!(out.registration_count(), 2);
        assert_eq!(runtime.live_registrations(), 2);

        out.unregister(ep, &runtime);
        assert_eq!(runtime.live_registrations(), 0);
        assert!(runtime.equivalent_type_cache_entry_points().is_empty());
        assert_eq!(out.registration_count(), 0);
    }
}
