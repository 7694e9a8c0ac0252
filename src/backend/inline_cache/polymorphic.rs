//! Polymorphic inline caches and their per-entry-point ownership records.
//!
//! A polymorphic cache is a power-of-two array of monomorphic entries indexed
//! by a hash of the object type. It starts at the configured minimum size and
//! doubles on collision until the maximum, after which collisions evict.
//!
//! Growth produces a *new* cache; the function's table switches to it while
//! compiled code that captured the old one keeps it alive through its entry
//! point's [`EntryPointPolymorphicInlineCacheInfo`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{CacheAllocation, InlineCache, InlineCacheAllocator};
use crate::backend::error::CodegenResult;
use crate::backend::function::FunctionId;
use crate::backend::guards::TypeRef;

/// Shared handle to a polymorphic cache
pub type PolymorphicCacheRef = Arc<Mutex<PolymorphicInlineCache>>;

/// Outcome of [`PolymorphicInlineCache::insert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolymorphicInsert {
    Inserted,
    /// Slot taken by another type and the cache may still grow
    NeedsGrowth,
    /// Slot taken by another type and the previous entry was replaced
    Evicted,
}

/// Next size after `size`, or `None` once `max` is reached
pub fn next_size(size: usize, max: usize) -> Option<usize> {
    let next = size * 2;
    (next <= max).then_some(next)
}

/// Hash-indexed set of monomorphic caches for one call site
#[derive(Debug)]
pub struct PolymorphicInlineCache {
    entries: Vec<InlineCache>,
    function: FunctionId,
    index: u32,
    max_size: usize,
    allocation: Option<CacheAllocation>,
    allocator: Arc<InlineCacheAllocator>,
}

impl PolymorphicInlineCache {
    pub fn new(
        size: usize,
        max_size: usize,
        function: FunctionId,
        index: u32,
        allocator: &Arc<InlineCacheAllocator>,
    ) -> CodegenResult<Self> {
        debug_assert!(size.is_power_of_two() && size <= max_size);
        let allocation = allocator.allocate(size)?;
        Ok(PolymorphicInlineCache {
            entries: vec![InlineCache::default(); size],
            function,
            index,
            max_size,
            allocation: Some(allocation),
            allocator: Arc::clone(allocator),
        })
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn function(&self) -> FunctionId {
        self.function
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn can_allocate_bigger(&self) -> bool {
        next_size(self.size(), self.max_size).is_some()
    }

    fn slot_for(&self, type_ref: TypeRef) -> usize {
        (type_ref.address() >> 3) as usize & (self.entries.len() - 1)
    }

    pub fn lookup(&self, type_ref: TypeRef) -> Option<&InlineCache> {
        let entry = &self.entries[self.slot_for(type_ref)];
        (entry.type_ref() == Some(type_ref)).then_some(entry)
    }

    /// Store `cache` in its hash slot
    pub fn insert(&mut self, cache: InlineCache) -> PolymorphicInsert {
        let Some(type_ref) = cache.type_ref() else {
            return PolymorphicInsert::Inserted;
        };
        let slot = self.slot_for(type_ref);
        let current = &self.entries[slot];
        if current.is_empty() || current.type_ref() == Some(type_ref) {
            self.entries[slot] = cache;
            return PolymorphicInsert::Inserted;
        }
        if self.can_allocate_bigger() {
            return PolymorphicInsert::NeedsGrowth;
        }
        self.entries[slot] = cache;
        PolymorphicInsert::Evicted
    }

    /// Copy of this cache at the next size, entries rehashed
    ///
    /// Entries that collide in the bigger cache keep the later one.
    pub fn grown(&self) -> CodegenResult<Option<Self>> {
        let Some(size) = next_size(self.size(), self.max_size) else {
            return Ok(None);
        };
        let mut bigger =
            PolymorphicInlineCache::new(size, self.max_size, self.function, self.index, &self.allocator)?;
        for entry in self.entries.iter().filter(|e| !e.is_empty()) {
            if let Some(type_ref) = entry.type_ref() {
                let slot = bigger.slot_for(type_ref);
                bigger.entries[slot] = entry.clone();
            }
        }
        Ok(Some(bigger))
    }

    pub fn entries(&self) -> impl Iterator<Item = &InlineCache> {
        self.entries.iter().filter(|e| !e.is_empty())
    }

    /// Number of distinct types cached
    pub fn occupancy(&self) -> usize {
        self.entries().count()
    }

    /// Forget all types
    pub fn clear(&mut self) {
        for entry in &mut self.entries {
            entry.clear();
        }
    }

    /// Shutdown: clear contents and give up the allocation without freeing it
    pub fn zero(&mut self) {
        self.clear();
        self.allocation = None;
    }

    pub fn is_allocated(&self) -> bool {
        self.allocation.is_some()
    }
}

impl Drop for PolymorphicInlineCache {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            self.allocator.free(allocation);
        }
    }
}

// =============================================================================
// Per-entry-point ownership
// =============================================================================

/// Polymorphic caches of one function captured by compiled code
#[derive(Debug, Clone)]
pub struct PolymorphicInlineCacheInfo {
    function: FunctionId,
    caches: HashMap<u32, PolymorphicCacheRef>,
    utilization: HashMap<u32, u8>,
}

impl PolymorphicInlineCacheInfo {
    pub fn new(function: FunctionId) -> Self {
        PolymorphicInlineCacheInfo {
            function,
            caches: HashMap::new(),
            utilization: HashMap::new(),
        }
    }

    pub fn function(&self) -> FunctionId {
        self.function
    }

    pub fn set(&mut self, index: u32, cache: PolymorphicCacheRef, utilization: u8) {
        self.caches.insert(index, cache);
        self.utilization.insert(index, utilization);
    }

    pub fn cache(&self, index: u32) -> Option<&PolymorphicCacheRef> {
        self.caches.get(&index)
    }

    pub fn utilization(&self, index: u32) -> u8 {
        self.utilization.get(&index).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }

    pub fn holds(&self, cache: &PolymorphicCacheRef) -> bool {
        self.caches.values().any(|c| Arc::ptr_eq(c, cache))
    }

    fn zero(&self) {
        for cache in self.caches.values() {
            cache.lock().zero();
        }
    }
}

/// Polymorphic caches an entry point depends on
///
/// `self_info` covers the entry point's own function; `inlinee_info` has one
/// record per function inlined into it.
#[derive(Debug, Clone)]
pub struct EntryPointPolymorphicInlineCacheInfo {
    self_info: PolymorphicInlineCacheInfo,
    inlinee_info: Vec<PolymorphicInlineCacheInfo>,
}

impl EntryPointPolymorphicInlineCacheInfo {
    pub fn new(function: FunctionId) -> Self {
        EntryPointPolymorphicInlineCacheInfo {
            self_info: PolymorphicInlineCacheInfo::new(function),
            inlinee_info: Vec::new(),
        }
    }

    pub fn self_info(&self) -> &PolymorphicInlineCacheInfo {
        &self.self_info
    }

    pub fn inlinee_info(&self, function: FunctionId) -> Option<&PolymorphicInlineCacheInfo> {
        self.inlinee_info.iter().find(|info| info.function == function)
    }

    pub fn ensure_inlinee_info(&mut self, function: FunctionId) -> &mut PolymorphicInlineCacheInfo {
        if let Some(pos) = self
            .inlinee_info
            .iter()
            .position(|info| info.function == function)
        {
            return &mut self.inlinee_info[pos];
        }
        self.inlinee_info
            .push(PolymorphicInlineCacheInfo::new(function));
        let last = self.inlinee_info.len() - 1;
        &mut self.inlinee_info[last]
    }

    /// Record a cache captured from `function`'s table
    pub fn set_polymorphic_inline_cache(
        &mut self,
        function: FunctionId,
        index: u32,
        cache: PolymorphicCacheRef,
        utilization: u8,
    ) {
        if function == self.self_info.function {
            self.self_info.set(index, cache, utilization);
        } else {
            self.ensure_inlinee_info(function)
                .set(index, cache, utilization);
        }
    }

    pub fn inlinee_functions(&self) -> impl Iterator<Item = FunctionId> + '_ {
        self.inlinee_info.iter().map(|info| info.function)
    }

    pub fn cache_count(&self) -> usize {
        self.self_info.len() + self.inlinee_info.iter().map(|i| i.len()).sum::<usize>()
    }

    pub fn holds(&self, cache: &PolymorphicCacheRef) -> bool {
        self.self_info.holds(cache) || self.inlinee_info.iter().any(|info| info.holds(cache))
    }

    /// Shutdown: zero every referenced cache without freeing
    pub fn zero(&self) {
        self.self_info.zero();
        for info in &self.inlinee_info {
            info.zero();
        }
    }
}
