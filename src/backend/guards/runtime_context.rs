//! Runtime context: the property-keyed invalidation registries.
//!
//! ```text
//!  property_guards:  PropertyId -> PropertyGuardEntry
//!                                   ├── shared_guard   (strong, owned here)
//!                                   ├── unique_guards  (weak, owned by entry points)
//!                                   └── lazy_bailouts  (entry point handles)
//!
//!  proto_caches / store_field_caches / is_inst_caches:  key -> [InlineCacheKey]
//!  equivalent_type_cache_entry_points:                   [EntryPointId]
//! ```
//!
//! One context exists per engine and is handed to every operation that
//! registers or unregisters, so tests never share registry state.
//!
//! ## Concurrency
//!
//! Registries are `DashMap`s; every method touches at most one shard lock of
//! one map at a time and never calls back into the engine while holding it.
//! The background compiler only reads guard words, which are atomics.
//!
//! ## Allocation failure
//!
//! `guard_capacity` bounds the number of live registrations. Exceeding it is
//! reported as [`CodegenError::OutOfMemory`] before anything is modified, so a
//! registration either happens completely or not at all.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, trace};

use super::{ConstructorCache, PropertyGuard, PropertyId, TypeRef, WeakGuard};
use crate::backend::config::TieringConfig;
use crate::backend::entry_point::EntryPointId;
use crate::backend::error::{CodegenError, CodegenResult};
use crate::backend::inline_cache::InlineCacheKey;

/// Registrations for one property
#[derive(Debug, Default)]
pub struct PropertyGuardEntry {
    pub shared_guard: Option<PropertyGuard>,
    pub unique_guards: SmallVec<[WeakGuard; 4]>,
    pub lazy_bailout_entry_points: SmallVec<[EntryPointId; 2]>,
}

impl PropertyGuardEntry {
    fn registration_count(&self) -> usize {
        self.shared_guard.is_some() as usize
            + self.unique_guards.len()
            + self.lazy_bailout_entry_points.len()
    }

    fn is_empty(&self) -> bool {
        self.registration_count() == 0
    }
}

/// Counters exposed for diagnostics
#[derive(Debug, Clone, Default)]
pub struct RuntimeStats {
    pub property_invalidations: u64,
    pub guards_invalidated: u64,
    pub constructor_cache_invalidations: u64,
    pub invalidated_guard_purges: u64,
}

/// Registry of guards and cache invalidation lists for one engine
#[derive(Debug)]
pub struct RuntimeContext {
    property_guards: DashMap<PropertyId, PropertyGuardEntry>,
    proto_caches: DashMap<PropertyId, SmallVec<[InlineCacheKey; 4]>>,
    store_field_caches: DashMap<PropertyId, SmallVec<[InlineCacheKey; 4]>>,
    is_inst_caches: DashMap<TypeRef, SmallVec<[InlineCacheKey; 4]>>,
    equivalent_type_cache_entry_points: Mutex<Vec<EntryPointId>>,
    cached_types: DashSet<TypeRef>,

    live_registrations: AtomicUsize,
    guard_capacity: Option<usize>,
    constructor_cache_invalidation_count: AtomicU32,
    constructor_cache_invalidation_threshold: u32,

    property_invalidations: AtomicU64,
    guards_invalidated: AtomicU64,
    constructor_cache_invalidations: AtomicU64,
    invalidated_guard_purges: AtomicU64,
}

impl Default for RuntimeContext {
    fn default() -> Self {
        RuntimeContext::new(&TieringConfig::default())
    }
}

impl RuntimeContext {
    pub fn new(config: &TieringConfig) -> Self {
        RuntimeContext {
            property_guards: DashMap::new(),
            proto_caches: DashMap::new(),
            store_field_caches: DashMap::new(),
            is_inst_caches: DashMap::new(),
            equivalent_type_cache_entry_points: Mutex::new(Vec::new()),
            cached_types: DashSet::new(),
            live_registrations: AtomicUsize::new(0),
            guard_capacity: config.guard_registry_capacity,
            constructor_cache_invalidation_count: AtomicU32::new(0),
            constructor_cache_invalidation_threshold: config
                .constructor_cache_invalidation_threshold,
            property_invalidations: AtomicU64::new(0),
            guards_invalidated: AtomicU64::new(0),
            constructor_cache_invalidations: AtomicU64::new(0),
            invalidated_guard_purges: AtomicU64::new(0),
        }
    }

    /// Reserve room for one registration or fail without side effects
    fn reserve(&self) -> CodegenResult<()> {
        let reserved = self
            .live_registrations
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| match self
                .guard_capacity
            {
                Some(capacity) if live >= capacity => None,
                _ => Some(live + 1),
            });
        match reserved {
            Ok(_) => Ok(()),
            Err(live) => {
                debug!(live, "guard registry full");
                Err(CodegenError::OutOfMemory)
            }
        }
    }

    fn release(&self, count: usize) {
        if count > 0 {
            self.live_registrations.fetch_sub(count, Ordering::AcqRel);
        }
    }

    /// Number of registrations currently held (guards, lazy bailouts, cache lists)
    pub fn live_registrations(&self) -> usize {
        self.live_registrations.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            property_invalidations: self.property_invalidations.load(Ordering::Relaxed),
            guards_invalidated: self.guards_invalidated.load(Ordering::Relaxed),
            constructor_cache_invalidations: self
                .constructor_cache_invalidations
                .load(Ordering::Relaxed),
            invalidated_guard_purges: self.invalidated_guard_purges.load(Ordering::Relaxed),
        }
    }

    // =========================================================================
    // Property guards
    // =========================================================================

    /// Shared guard for `property`, created on first request
    pub fn register_shared_property_guard(
        &self,
        property: PropertyId,
    ) -> CodegenResult<PropertyGuard> {
        if let Some(entry) = self.property_guards.get(&property) {
            if let Some(guard) = &entry.shared_guard {
                return Ok(guard.clone());
            }
        }
        self.reserve()?;
        let mut entry = self.property_guards.entry(property).or_default();
        if let Some(guard) = entry.shared_guard.clone() {
            drop(entry);
            self.release(1);
            return Ok(guard);
        }
        let guard = PropertyGuard::new(property);
        entry.shared_guard = Some(guard.clone());
        trace!(%property, "shared property guard created");
        Ok(guard)
    }

    pub fn shared_property_guard(&self, property: PropertyId) -> Option<PropertyGuard> {
        self.property_guards
            .get(&property)
            .and_then(|entry| entry.shared_guard.clone())
    }

    /// Subscribe a per-site guard to invalidation of `property`
    pub fn register_unique_property_guard(
        &self,
        property: PropertyId,
        guard: &PropertyGuard,
    ) -> CodegenResult<()> {
        self.reserve()?;
        self.property_guards
            .entry(property)
            .or_default()
            .unique_guards
            .push(guard.downgrade());
        Ok(())
    }

    /// Remove one registration of a per-site guard
    ///
    /// A guard shared by several entry points (a constructor cache) is
    /// registered once per entry point, so only one of its registrations goes.
    /// Dead weak references are pruned on the way.
    pub fn unregister_unique_property_guard(&self, property: PropertyId, guard: &PropertyGuard) {
        let mut removed = 0;
        let mut now_empty = false;
        if let Some(mut entry) = self.property_guards.get_mut(&property) {
            let before = entry.unique_guards.len();
            entry.unique_guards.retain(|weak| weak.is_alive());
            if let Some(index) = entry
                .unique_guards
                .iter()
                .position(|weak| weak.refers_to(guard))
            {
                entry.unique_guards.swap_remove(index);
            }
            removed = before - entry.unique_guards.len();
            now_empty = entry.is_empty();
        }
        if now_empty {
            self.property_guards
                .remove_if(&property, |_, entry| entry.is_empty());
        }
        self.release(removed);
    }

    pub fn register_constructor_cache(
        &self,
        property: PropertyId,
        cache: &ConstructorCache,
    ) -> CodegenResult<()> {
        self.register_unique_property_guard(property, cache.guard())
    }

    pub fn unregister_constructor_cache(&self, property: PropertyId, cache: &ConstructorCache) {
        self.unregister_unique_property_guard(property, cache.guard())
    }

    /// Ask for `entry_point` to be lazily bailed out when `property` changes
    pub fn register_lazy_bailout(
        &self,
        property: PropertyId,
        entry_point: EntryPointId,
    ) -> CodegenResult<()> {
        self.reserve()?;
        let mut entry = self.property_guards.entry(property).or_default();
        if entry.lazy_bailout_entry_points.contains(&entry_point) {
            drop(entry);
            self.release(1);
            return Ok(());
        }
        entry.lazy_bailout_entry_points.push(entry_point);
        Ok(())
    }

    pub fn unregister_lazy_bailout(&self, property: PropertyId, entry_point: EntryPointId) {
        let mut removed = 0;
        if let Some(mut entry) = self.property_guards.get_mut(&property) {
            let before = entry.lazy_bailout_entry_points.len();
            entry
                .lazy_bailout_entry_points
                .retain(|ep| *ep != entry_point);
            removed = before - entry.lazy_bailout_entry_points.len();
        }
        self.property_guards
            .remove_if(&property, |_, entry| entry.is_empty());
        self.release(removed);
    }

    pub fn unique_guard_count(&self, property: PropertyId) -> usize {
        self.property_guards
            .get(&property)
            .map(|entry| entry.unique_guards.iter().filter(|w| w.is_alive()).count())
            .unwrap_or(0)
    }

    pub fn is_unique_guard_registered(&self, property: PropertyId, guard: &PropertyGuard) -> bool {
        self.property_guards
            .get(&property)
            .map(|entry| entry.unique_guards.iter().any(|w| w.refers_to(guard)))
            .unwrap_or(false)
    }

    /// Invalidate everything depending on `property`
    ///
    /// The shared guard and every live unique guard are invalidated and the
    /// entry is dropped. Returns the entry points registered for lazy bailout.
    pub fn invalidate_property_guards(&self, property: PropertyId) -> Vec<EntryPointId> {
        let Some((_, entry)) = self.property_guards.remove(&property) else {
            return Vec::new();
        };
        self.release(entry.registration_count());
        self.property_invalidations.fetch_add(1, Ordering::Relaxed);

        let mut invalidated = 0u64;
        if let Some(shared) = &entry.shared_guard {
            shared.invalidate();
            invalidated += 1;
        }
        for guard in entry.unique_guards.iter().filter_map(WeakGuard::upgrade) {
            guard.invalidate();
            invalidated += 1;
        }
        self.guards_invalidated
            .fetch_add(invalidated, Ordering::Relaxed);
        debug!(
            %property,
            invalidated,
            lazy_bailouts = entry.lazy_bailout_entry_points.len(),
            "property guards invalidated"
        );
        entry.lazy_bailout_entry_points.into_vec()
    }

    /// Invalidate every registered guard; used when the runtime drops all
    /// speculative assumptions at once
    pub fn invalidate_all_property_guards(&self) -> Vec<EntryPointId> {
        let properties: Vec<PropertyId> =
            self.property_guards.iter().map(|entry| *entry.key()).collect();
        let mut entry_points = Vec::new();
        for property in properties {
            entry_points.extend(self.invalidate_property_guards(property));
        }
        entry_points.sort_by_key(|ep| (ep.index(), ep.generation()));
        entry_points.dedup();
        entry_points
    }

    /// Invalidate one constructor cache
    ///
    /// Every `constructor_cache_invalidation_threshold` invalidations the
    /// registry is purged of dead and invalidated unique guards.
    pub fn invalidate_constructor_cache(&self, cache: &ConstructorCache) {
        cache.invalidate();
        self.constructor_cache_invalidations
            .fetch_add(1, Ordering::Relaxed);
        let count = self
            .constructor_cache_invalidation_count
            .fetch_add(1, Ordering::AcqRel)
            + 1;
        if count >= self.constructor_cache_invalidation_threshold {
            self.constructor_cache_invalidation_count
                .store(0, Ordering::Release);
            self.clear_invalidated_unique_guards();
        }
    }

    /// Drop unique guard registrations that are dead or already invalid
    pub fn clear_invalidated_unique_guards(&self) {
        let mut removed = 0;
        self.property_guards.retain(|_, entry| {
            let before = entry.unique_guards.len();
            entry.unique_guards.retain(|weak| {
                weak.upgrade()
                    .map(|guard| guard.is_valid())
                    .unwrap_or(false)
            });
            removed += before - entry.unique_guards.len();
            !entry.is_empty()
        });
        self.release(removed);
        self.invalidated_guard_purges
            .fetch_add(1, Ordering::Relaxed);
        debug!(removed, "invalidated unique guards purged");
    }

    // =========================================================================
    // Equivalent type caches
    // =========================================================================

    pub fn register_equivalent_type_cache_entry_point(&self, entry_point: EntryPointId) {
        let mut list = self.equivalent_type_cache_entry_points.lock();
        if !list.contains(&entry_point) {
            list.push(entry_point);
        }
    }

    pub fn unregister_equivalent_type_cache_entry_point(&self, entry_point: EntryPointId) {
        self.equivalent_type_cache_entry_points
            .lock()
            .retain(|ep| *ep != entry_point);
    }

    pub fn equivalent_type_cache_entry_points(&self) -> Vec<EntryPointId> {
        self.equivalent_type_cache_entry_points.lock().clone()
    }

    /// Record that `type_ref` is referenced from an equivalent-type cache
    pub fn mark_type_cached(&self, type_ref: TypeRef) {
        self.cached_types.insert(type_ref);
    }

    pub fn is_type_cached(&self, type_ref: TypeRef) -> bool {
        self.cached_types.contains(&type_ref)
    }

    // =========================================================================
    // Inline cache invalidation lists
    // =========================================================================

    fn register_in(
        &self,
        map: &DashMap<PropertyId, SmallVec<[InlineCacheKey; 4]>>,
        property: PropertyId,
        key: InlineCacheKey,
    ) -> CodegenResult<()> {
        let mut list = map.entry(property).or_default();
        if list.contains(&key) {
            return Ok(());
        }
        if let Err(err) = self.reserve() {
            drop(list);
            map.remove_if(&property, |_, list| list.is_empty());
            return Err(err);
        }
        list.push(key);
        Ok(())
    }

    fn unregister_in(
        &self,
        map: &DashMap<PropertyId, SmallVec<[InlineCacheKey; 4]>>,
        property: PropertyId,
        key: InlineCacheKey,
    ) -> bool {
        let mut removed = 0;
        if let Some(mut list) = map.get_mut(&property) {
            let before = list.len();
            list.retain(|k| *k != key);
            removed = before - list.len();
        }
        map.remove_if(&property, |_, list| list.is_empty());
        self.release(removed);
        removed > 0
    }

    fn take_list(
        &self,
        map: &DashMap<PropertyId, SmallVec<[InlineCacheKey; 4]>>,
        property: PropertyId,
    ) -> Vec<InlineCacheKey> {
        match map.remove(&property) {
            Some((_, list)) => {
                self.release(list.len());
                list.into_vec()
            }
            None => Vec::new(),
        }
    }

    pub fn register_proto_inline_cache(
        &self,
        property: PropertyId,
        key: InlineCacheKey,
    ) -> CodegenResult<()> {
        self.register_in(&self.proto_caches, property, key)
    }

    pub fn register_store_field_inline_cache(
        &self,
        property: PropertyId,
        key: InlineCacheKey,
    ) -> CodegenResult<()> {
        self.register_in(&self.store_field_caches, property, key)
    }

    pub fn unregister_proto_inline_cache(&self, property: PropertyId, key: InlineCacheKey) -> bool {
        self.unregister_in(&self.proto_caches, property, key)
    }

    pub fn unregister_store_field_inline_cache(
        &self,
        property: PropertyId,
        key: InlineCacheKey,
    ) -> bool {
        self.unregister_in(&self.store_field_caches, property, key)
    }

    /// Detach and return every proto cache registered for `property`
    pub fn invalidate_proto_inline_caches(&self, property: PropertyId) -> Vec<InlineCacheKey> {
        self.take_list(&self.proto_caches, property)
    }

    /// Detach and return every store-field cache registered for `property`
    pub fn invalidate_store_field_inline_caches(
        &self,
        property: PropertyId,
    ) -> Vec<InlineCacheKey> {
        self.take_list(&self.store_field_caches, property)
    }

    pub fn register_is_inst_inline_cache(
        &self,
        function_type: TypeRef,
        key: InlineCacheKey,
    ) -> CodegenResult<()> {
        let mut list = self.is_inst_caches.entry(function_type).or_default();
        if list.contains(&key) {
            return Ok(());
        }
        if let Err(err) = self.reserve() {
            drop(list);
            self.is_inst_caches
                .remove_if(&function_type, |_, list| list.is_empty());
            return Err(err);
        }
        list.push(key);
        Ok(())
    }

    pub fn unregister_is_inst_inline_cache(&self, function_type: TypeRef, key: InlineCacheKey) {
        let mut removed = 0;
        if let Some(mut list) = self.is_inst_caches.get_mut(&function_type) {
            let before = list.len();
            list.retain(|k| *k != key);
            removed = before - list.len();
        }
        self.is_inst_caches
            .remove_if(&function_type, |_, list| list.is_empty());
        self.release(removed);
    }

    /// Detach and return every is-instance cache keyed on `function_type`
    pub fn invalidate_is_inst_inline_caches(&self, function_type: TypeRef) -> Vec<InlineCacheKey> {
        match self.is_inst_caches.remove(&function_type) {
            Some((_, list)) => {
                self.release(list.len());
                list.into_vec()
            }
            None => Vec::new(),
        }
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Drop every registration at once; the engine is going away
    pub fn shutdown(&self) {
        self.property_guards.clear();
        self.proto_caches.clear();
        self.store_field_caches.clear();
        self.is_inst_caches.clear();
        self.equivalent_type_cache_entry_points.lock().clear();
        self.cached_types.clear();
        self.live_registrations.store(0, Ordering::Release);
        debug!("runtime context shut down");
    }
}

// =============================================================================
// Tests
// =============================================================================
