//! Root object caches shared by every function of a script context.
//!
//! Global loads and stores go through caches owned by the root object rather
//! than by the function. Tables take a reference per root slot when they are
//! created and release it when cleaned up; the cache is freed with its last
//! reference.

use std::collections::HashMap;

use tracing::trace;

use super::{CacheLookup, CacheSource, InlineCache, InlineCacheKey, RootCacheKind};
use crate::backend::error::CodegenResult;
use crate::backend::guards::{PropertyId, RuntimeContext, TypeRef};

#[derive(Debug, Default)]
struct RootCacheEntry {
    cache: InlineCache,
    ref_count: u32,
    registered: bool,
}

/// Reference counted caches for global property accesses
#[derive(Debug, Default)]
pub struct RootObject {
    caches: HashMap<(PropertyId, RootCacheKind), RootCacheEntry>,
}

impl RootObject {
    pub fn new() -> Self {
        RootObject::default()
    }

    pub fn add_ref(&mut self, property: PropertyId, kind: RootCacheKind) {
        self.caches.entry((property, kind)).or_default().ref_count += 1;
    }

    /// Drop one reference; returns true when the cache was freed
    pub fn release(&mut self, property: PropertyId, kind: RootCacheKind, runtime: &RuntimeContext) -> bool {
        let Some(entry) = self.caches.get_mut(&(property, kind)) else {
            debug_assert!(false, "root cache {} released without a reference", property);
            return false;
        };
        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            return false;
        }
        if let Some(entry) = self.caches.remove(&(property, kind)) {
            if entry.registered {
                Self::unregister(property, kind, entry.cache.source(), runtime);
            }
        }
        trace!(%property, ?kind, "root cache freed");
        true
    }

    fn unregister(property: PropertyId, kind: RootCacheKind, source: CacheSource, runtime: &RuntimeContext) {
        let key = InlineCacheKey::Root { property, kind };
        match source {
            CacheSource::Proto => {
                runtime.unregister_proto_inline_cache(property, key);
            }
            CacheSource::StoreField => {
                runtime.unregister_store_field_inline_cache(property, key);
            }
            CacheSource::Local | CacheSource::Accessor => {}
        }
    }

    pub fn ref_count(&self, property: PropertyId, kind: RootCacheKind) -> u32 {
        self.caches
            .get(&(property, kind))
            .map(|entry| entry.ref_count)
            .unwrap_or(0)
    }

    pub fn cache(&self, property: PropertyId, kind: RootCacheKind) -> Option<&InlineCache> {
        self.caches.get(&(property, kind)).map(|entry| &entry.cache)
    }

    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }

    /// Record a global access; root caches stay monomorphic
    pub fn record_access(
        &mut self,
        property: PropertyId,
        kind: RootCacheKind,
        type_ref: TypeRef,
        slot_index: u16,
        source: CacheSource,
        runtime: &RuntimeContext,
    ) -> CodegenResult<CacheLookup> {
        let Some(entry) = self.caches.get_mut(&(property, kind)) else {
            return Ok(CacheLookup::Miss);
        };
        if entry.cache.type_ref() == Some(type_ref) {
            return Ok(CacheLookup::Hit);
        }
        if entry.registered {
            Self::unregister(property, kind, entry.cache.source(), runtime);
            entry.registered = false;
        }
        let key = InlineCacheKey::Root { property, kind };
        match source {
            CacheSource::Proto => {
                runtime.register_proto_inline_cache(property, key)?;
                entry.registered = true;
            }
            CacheSource::StoreField => {
                runtime.register_store_field_inline_cache(property, key)?;
                entry.registered = true;
            }
            CacheSource::Local | CacheSource::Accessor => {}
        }
        entry.cache = InlineCache::filled(type_ref, slot_index, source);
        Ok(CacheLookup::Miss)
    }

    /// Forget one cache after its invalidation list was detached
    pub fn clear_cache(&mut self, property: PropertyId, kind: RootCacheKind) {
        if let Some(entry) = self.caches.get_mut(&(property, kind)) {
            entry.cache.clear();
            entry.registered = false;
        }
    }

    /// Shutdown: zero every cache, keep references as they are
    pub fn zero_all(&mut self) {
        for entry in self.caches.values_mut() {
            entry.cache.clear();
            entry.registered = false;
        }
    }
}
