//! Inline cache tables.
//!
//! Every function unit owns one flat table of cache slots laid out by an
//! [`InlineCacheLayout`]:
//!
//! ```text
//!  0                property          +root_load   +root_load_method  +root_store   +is_inst
//!  ├── plain ───────┼── root load ────┼── root method ─┼── root store ──┼── is-inst ──┤
//! ```
//!
//! Plain slots start monomorphic and are promoted to a
//! [`PolymorphicInlineCache`] on the first miss with a different type. Root
//! slots point into the shared [`RootObject`]; is-instance slots cache the
//! result of one `instanceof` check.
//!
//! Filling a slot from a prototype or for a field store subscribes it to the
//! runtime context's invalidation list for its property, identified by an
//! [`InlineCacheKey`].

pub mod polymorphic;
pub mod root;

pub use polymorphic::{
    EntryPointPolymorphicInlineCacheInfo, PolymorphicCacheRef, PolymorphicInlineCache,
    PolymorphicInlineCacheInfo, PolymorphicInsert,
};
pub use root::RootObject;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use itertools::Itertools;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::config::TieringConfig;
use super::error::{CodegenError, CodegenResult};
use super::function::FunctionId;
use super::guards::{PropertyId, RuntimeContext, TypeRef};

// =============================================================================
// Keys and layout
// =============================================================================

/// Which root object cache a root slot refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootCacheKind {
    Load,
    LoadMethod,
    Store,
}

/// Identity of a cache inside the runtime's invalidation lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InlineCacheKey {
    Function { function: FunctionId, index: u32 },
    Root { property: PropertyId, kind: RootCacheKind },
}

/// What a slot of the table holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InlineCacheKind {
    Property,
    Root(RootCacheKind),
    IsInst,
}

/// Slot counts per cache kind for one function
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InlineCacheLayout {
    pub property: u32,
    pub root_load: u32,
    pub root_load_method: u32,
    pub root_store: u32,
    pub is_inst: u32,
}

impl InlineCacheLayout {
    pub fn root_load_offset(&self) -> u32 {
        self.property
    }

    pub fn root_load_method_offset(&self) -> u32 {
        self.root_load_offset() + self.root_load
    }

    pub fn root_store_offset(&self) -> u32 {
        self.root_load_method_offset() + self.root_load_method
    }

    pub fn is_inst_offset(&self) -> u32 {
        self.root_store_offset() + self.root_store
    }

    /// Slots that are keyed by a property name
    pub fn property_keyed(&self) -> u32 {
        self.is_inst_offset()
    }

    pub fn total(&self) -> u32 {
        self.is_inst_offset() + self.is_inst
    }

    pub fn kind_of(&self, index: u32) -> Option<InlineCacheKind> {
        if index < self.root_load_offset() {
            Some(InlineCacheKind::Property)
        } else if index < self.root_load_method_offset() {
            Some(InlineCacheKind::Root(RootCacheKind::Load))
        } else if index < self.root_store_offset() {
            Some(InlineCacheKind::Root(RootCacheKind::LoadMethod))
        } else if index < self.is_inst_offset() {
            Some(InlineCacheKind::Root(RootCacheKind::Store))
        } else if index < self.total() {
            Some(InlineCacheKind::IsInst)
        } else {
            None
        }
    }
}

// =============================================================================
// Monomorphic caches
// =============================================================================

/// Where a cached property was found
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheSource {
    #[default]
    Local,
    Proto,
    Accessor,
    StoreField,
}

/// One type to slot mapping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InlineCache {
    type_ref: Option<TypeRef>,
    slot_index: u16,
    source: CacheSource,
}

impl InlineCache {
    pub fn filled(type_ref: TypeRef, slot_index: u16, source: CacheSource) -> Self {
        InlineCache {
            type_ref: Some(type_ref),
            slot_index,
            source,
        }
    }

    pub fn type_ref(&self) -> Option<TypeRef> {
        self.type_ref
    }

    pub fn slot_index(&self) -> u16 {
        self.slot_index
    }

    pub fn source(&self) -> CacheSource {
        self.source
    }

    pub fn is_empty(&self) -> bool {
        self.type_ref.is_none()
    }

    pub fn clear(&mut self) {
        *self = InlineCache::default();
    }
}

/// Cached `instanceof` result for one (function type, instance type) pair
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IsInstInlineCache {
    pub function_type: Option<TypeRef>,
    pub instance_type: Option<TypeRef>,
    pub result: bool,
}

impl IsInstInlineCache {
    pub fn lookup(&self, function_type: TypeRef, instance_type: TypeRef) -> Option<bool> {
        (self.function_type == Some(function_type) && self.instance_type == Some(instance_type))
            .then_some(self.result)
    }

    pub fn clear(&mut self) {
        *self = IsInstInlineCache::default();
    }
}

/// Result of recording one access against a cache slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    Hit,
    Miss,
    Promoted,
}

// =============================================================================
// Allocator
// =============================================================================

/// Token for one block handed out by [`InlineCacheAllocator`]
#[derive(Debug)]
pub struct CacheAllocation {
    id: u64,
    entries: usize,
}

impl CacheAllocation {
    pub fn entries(&self) -> usize {
        self.entries
    }
}

/// Accounting allocator for cache storage
///
/// Tracks every live block so frees of unknown blocks are caught.
#[derive(Debug)]
pub struct InlineCacheAllocator {
    live: DashMap<u64, usize>,
    next_id: AtomicU64,
    live_entries: AtomicUsize,
    capacity: Option<usize>,
    allocations: AtomicU64,
    frees: AtomicU64,
    double_frees: AtomicU64,
}

impl Default for InlineCacheAllocator {
    fn default() -> Self {
        InlineCacheAllocator::new(None)
    }
}

impl InlineCacheAllocator {
    /// `capacity` bounds the number of live cache entries
    pub fn new(capacity: Option<usize>) -> Self {
        InlineCacheAllocator {
            live: DashMap::new(),
            next_id: AtomicU64::new(1),
            live_entries: AtomicUsize::new(0),
            capacity,
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            double_frees: AtomicU64::new(0),
        }
    }

    pub fn allocate(&self, entries: usize) -> CodegenResult<CacheAllocation> {
        self.live_entries
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                match self.capacity {
                    Some(capacity) if live + entries > capacity => None,
                    _ => Some(live + entries),
                }
            })
            .map_err(|_| CodegenError::OutOfMemory)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.live.insert(id, entries);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(CacheAllocation { id, entries })
    }

    pub fn free(&self, allocation: CacheAllocation) {
        match self.live.remove(&allocation.id) {
            Some((_, entries)) => {
                self.live_entries.fetch_sub(entries, Ordering::AcqRel);
                self.frees.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.double_frees.fetch_add(1, Ordering::Relaxed);
                warn!(id = allocation.id, "inline cache block freed twice");
                debug_assert!(false, "inline cache block {} freed twice", allocation.id);
            }
        }
    }

    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }

    pub fn live_entries(&self) -> usize {
        self.live_entries.load(Ordering::Acquire)
    }

    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn frees(&self) -> u64 {
        self.frees.load(Ordering::Relaxed)
    }

    pub fn double_frees(&self) -> u64 {
        self.double_frees.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Table
// =============================================================================

/// How [`InlineCacheTable::cleanup`] treats owned storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupMode {
    /// Unregister and free everything
    Normal,
    /// Engine teardown: zero contents, free nothing
    Shutdown,
}

const REGISTERED_PROTO: u8 = 1;
const REGISTERED_STORE_FIELD: u8 = 2;

#[derive(Debug, Clone)]
enum CacheSlot {
    Property {
        property: PropertyId,
        cache: InlineCache,
        registered: u8,
    },
    Root {
        property: PropertyId,
        kind: RootCacheKind,
    },
    IsInst(IsInstInlineCache),
}

/// All inline caches of one function
#[derive(Debug)]
pub struct InlineCacheTable {
    function: FunctionId,
    layout: InlineCacheLayout,
    slots: Vec<CacheSlot>,
    polymorphic: HashMap<u32, PolymorphicCacheRef>,
    utilization: HashMap<u32, u8>,
    allocation: Option<CacheAllocation>,
    allocator: Arc<InlineCacheAllocator>,
    root_released: bool,
}

impl InlineCacheTable {
    /// Allocate a table and take a reference on each root cache it uses
    ///
    /// `properties` names the property of every property-keyed slot, in
    /// layout order.
    pub fn new(
        function: FunctionId,
        layout: InlineCacheLayout,
        properties: &[PropertyId],
        root: &mut RootObject,
        allocator: &Arc<InlineCacheAllocator>,
    ) -> CodegenResult<Self> {
        if properties.len() != layout.property_keyed() as usize {
            return Err(CodegenError::Backend(format!(
                "inline cache layout expects {} property ids, got {}",
                layout.property_keyed(),
                properties.len()
            )));
        }
        let allocation = allocator.allocate(layout.total() as usize)?;

        let mut slots = Vec::with_capacity(layout.total() as usize);
        for (index, &property) in properties.iter().enumerate() {
            match layout.kind_of(index as u32) {
                Some(InlineCacheKind::Root(kind)) => {
                    root.add_ref(property, kind);
                    slots.push(CacheSlot::Root { property, kind });
                }
                _ => slots.push(CacheSlot::Property {
                    property,
                    cache: InlineCache::default(),
                    registered: 0,
                }),
            }
        }
        slots.extend((0..layout.is_inst).map(|_| CacheSlot::IsInst(IsInstInlineCache::default())));

        trace!(?function, total = layout.total(), "inline cache table allocated");
        Ok(InlineCacheTable {
            function,
            layout,
            slots,
            polymorphic: HashMap::new(),
            utilization: HashMap::new(),
            allocation: Some(allocation),
            allocator: Arc::clone(allocator),
            root_released: false,
        })
    }

    pub fn function(&self) -> FunctionId {
        self.function
    }

    pub fn layout(&self) -> InlineCacheLayout {
        self.layout
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn key(&self, index: u32) -> InlineCacheKey {
        match self.slots.get(index as usize) {
            Some(CacheSlot::Root { property, kind }) => InlineCacheKey::Root {
                property: *property,
                kind: *kind,
            },
            _ => InlineCacheKey::Function {
                function: self.function,
                index,
            },
        }
    }

    /// Property a property or root slot is keyed on
    pub fn property(&self, index: u32) -> Option<PropertyId> {
        match self.slots.get(index as usize)? {
            CacheSlot::Property { property, .. } | CacheSlot::Root { property, .. } => {
                Some(*property)
            }
            CacheSlot::IsInst(_) => None,
        }
    }

    /// Distinct properties the table's caches are keyed on
    pub fn properties(&self) -> Vec<PropertyId> {
        (0..self.slots.len() as u32)
            .filter_map(|index| self.property(index))
            .sorted()
            .dedup()
            .collect()
    }

    /// Monomorphic cache of a property slot
    pub fn cache(&self, index: u32) -> Option<&InlineCache> {
        match self.slots.get(index as usize)? {
            CacheSlot::Property { cache, .. } => Some(cache),
            _ => None,
        }
    }

    pub fn is_inst_cache(&self, index: u32) -> Option<&IsInstInlineCache> {
        match self.slots.get(index as usize)? {
            CacheSlot::IsInst(cache) => Some(cache),
            _ => None,
        }
    }

    pub fn polymorphic(&self, index: u32) -> Option<&PolymorphicCacheRef> {
        self.polymorphic.get(&index)
    }

    pub fn polymorphic_caches(&self) -> impl Iterator<Item = (u32, &PolymorphicCacheRef)> {
        self.polymorphic.iter().map(|(index, cache)| (*index, cache))
    }

    pub fn utilization(&self, index: u32) -> u8 {
        self.utilization.get(&index).copied().unwrap_or(0)
    }

    /// Record a property access observed at `index`
    pub fn record_access(
        &mut self,
        index: u32,
        type_ref: TypeRef,
        slot_index: u16,
        source: CacheSource,
        runtime: &RuntimeContext,
        config: &TieringConfig,
    ) -> CodegenResult<CacheLookup> {
        let key = self.key(index);
        let Some(CacheSlot::Property {
            property,
            cache,
            registered,
        }) = self.slots.get_mut(index as usize)
        else {
            return Err(CodegenError::Backend(format!(
                "inline cache {} is not a property cache",
                index
            )));
        };
        let property = *property;
        let filled = InlineCache::filled(type_ref, slot_index, source);

        if let Some(poly) = self.polymorphic.get(&index).cloned() {
            if poly.lock().lookup(type_ref).is_some() {
                return Ok(CacheLookup::Hit);
            }
            let flag = Self::register(runtime, property, key, source)?;
            *registered |= flag;
            let utilization = self.utilization.entry(index).or_insert(0);
            *utilization = utilization.saturating_add(1);
            self.insert_polymorphic(index, poly, filled)?;
            return Ok(CacheLookup::Miss);
        }

        if cache.is_empty() {
            let flag = Self::register(runtime, property, key, source)?;
            *registered |= flag;
            *cache = filled;
            return Ok(CacheLookup::Miss);
        }
        if cache.type_ref() == Some(type_ref) {
            return Ok(CacheLookup::Hit);
        }

        let flag = Self::register(runtime, property, key, source)?;
        *registered |= flag;
        let previous = cache.clone();
        let poly = PolymorphicInlineCache::new(
            config.polymorphic_cache_min_size as usize,
            config.polymorphic_cache_max_size as usize,
            self.function,
            index,
            &self.allocator,
        )?;
        let poly: PolymorphicCacheRef = Arc::new(Mutex::new(poly));
        poly.lock().insert(previous);
        self.utilization.insert(index, 1);
        self.insert_polymorphic(index, poly, filled)?;
        debug!(function = ?self.function, index, "inline cache promoted to polymorphic");
        Ok(CacheLookup::Promoted)
    }

    fn register(
        runtime: &RuntimeContext,
        property: PropertyId,
        key: InlineCacheKey,
        source: CacheSource,
    ) -> CodegenResult<u8> {
        match source {
            CacheSource::Proto => {
                runtime.register_proto_inline_cache(property, key)?;
                Ok(REGISTERED_PROTO)
            }
            CacheSource::StoreField => {
                runtime.register_store_field_inline_cache(property, key)?;
                Ok(REGISTERED_STORE_FIELD)
            }
            CacheSource::Local | CacheSource::Accessor => Ok(0),
        }
    }

    /// Insert into `poly`, replacing it with a bigger copy while it collides
    fn insert_polymorphic(
        &mut self,
        index: u32,
        mut poly: PolymorphicCacheRef,
        cache: InlineCache,
    ) -> CodegenResult<()> {
        loop {
            let outcome = poly.lock().insert(cache.clone());
            match outcome {
                PolymorphicInsert::Inserted | PolymorphicInsert::Evicted => break,
                PolymorphicInsert::NeedsGrowth => {
                    let grown = poly.lock().grown()?;
                    match grown {
                        Some(bigger) => {
                            trace!(index, size = bigger.size(), "polymorphic cache grown");
                            poly = Arc::new(Mutex::new(bigger));
                        }
                        None => break,
                    }
                }
            }
        }
        self.polymorphic.insert(index, poly);
        Ok(())
    }

    /// Record a root object access at a root slot
    pub fn record_root_access(
        &self,
        index: u32,
        type_ref: TypeRef,
        slot_index: u16,
        source: CacheSource,
        root: &mut RootObject,
        runtime: &RuntimeContext,
    ) -> CodegenResult<CacheLookup> {
        match self.slots.get(index as usize) {
            Some(CacheSlot::Root { property, kind }) => {
                root.record_access(*property, *kind, type_ref, slot_index, source, runtime)
            }
            _ => Err(CodegenError::Backend(format!(
                "inline cache {} is not a root cache",
                index
            ))),
        }
    }

    /// Record an `instanceof` result at an is-instance slot
    pub fn record_is_inst(
        &mut self,
        index: u32,
        function_type: TypeRef,
        instance_type: TypeRef,
        result: bool,
        runtime: &RuntimeContext,
    ) -> CodegenResult<CacheLookup> {
        let key = self.key(index);
        let Some(CacheSlot::IsInst(cache)) = self.slots.get_mut(index as usize) else {
            return Err(CodegenError::Backend(format!(
                "inline cache {} is not an is-instance cache",
                index
            )));
        };
        if cache.lookup(function_type, instance_type).is_some() {
            return Ok(CacheLookup::Hit);
        }
        if cache.function_type != Some(function_type) {
            runtime.register_is_inst_inline_cache(function_type, key)?;
            if let Some(old) = cache.function_type {
                runtime.unregister_is_inst_inline_cache(old, key);
            }
        }
        *cache = IsInstInlineCache {
            function_type: Some(function_type),
            instance_type: Some(instance_type),
            result,
        };
        Ok(CacheLookup::Miss)
    }

    /// Forget what one slot cached; its registrations were already detached
    pub fn clear_cache(&mut self, index: u32) {
        match self.slots.get_mut(index as usize) {
            Some(CacheSlot::Property {
                cache, registered, ..
            }) => {
                cache.clear();
                *registered = 0;
            }
            Some(CacheSlot::IsInst(cache)) => cache.clear(),
            Some(CacheSlot::Root { .. }) | None => {}
        }
        if let Some(poly) = self.polymorphic.get(&index) {
            poly.lock().clear();
        }
    }

    /// Release everything the table holds
    pub fn cleanup(&mut self, mode: CleanupMode, runtime: &RuntimeContext, root: &mut RootObject) {
        match mode {
            CleanupMode::Normal => {
                for index in 0..self.slots.len() as u32 {
                    let key = self.key(index);
                    match &mut self.slots[index as usize] {
                        CacheSlot::Property {
                            property,
                            cache,
                            registered,
                        } => {
                            if *registered & REGISTERED_PROTO != 0 {
                                runtime.unregister_proto_inline_cache(*property, key);
                            }
                            if *registered & REGISTERED_STORE_FIELD != 0 {
                                runtime.unregister_store_field_inline_cache(*property, key);
                            }
                            *registered = 0;
                            cache.clear();
                        }
                        CacheSlot::Root { property, kind } => {
                            if !self.root_released {
                                root.release(*property, *kind, runtime);
                            }
                        }
                        CacheSlot::IsInst(cache) => {
                            if let Some(function_type) = cache.function_type {
                                runtime.unregister_is_inst_inline_cache(function_type, key);
                            }
                            cache.clear();
                        }
                    }
                }
                self.root_released = true;
                // Entry points may still hold the polymorphic caches; the last
                // owner frees them.
                self.polymorphic.clear();
                self.utilization.clear();
                if let Some(allocation) = self.allocation.take() {
                    self.allocator.free(allocation);
                }
                debug!(function = ?self.function, "inline cache table freed");
            }
            CleanupMode::Shutdown => {
                for slot in &mut self.slots {
                    match slot {
                        CacheSlot::Property {
                            cache, registered, ..
                        } => {
                            cache.clear();
                            *registered = 0;
                        }
                        CacheSlot::IsInst(cache) => cache.clear(),
                        CacheSlot::Root { .. } => {}
                    }
                }
                for poly in self.polymorphic.values() {
                    poly.lock().zero();
                }
                self.root_released = true;
                self.allocation = None;
            }
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.allocation.is_some()
    }
}

// =============================================================================
// Tests
// =============================================================================
