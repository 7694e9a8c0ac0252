//! Invalidation primitives shared between compiled code and the runtime.
//!
//! - [`PropertyGuard`]: a word that compiled code checks before relying on a
//!   property/type assumption. Invalidating it (storing 0) makes every check
//!   fail and sends execution to a bailout.
//! - [`EquivalentTypeCache`]: a small set of object types known to be
//!   interchangeable for one access, protected by its own guard.
//! - [`ConstructorCache`]: the shape a constructor produces, shared by every
//!   call site using that constructor.
//!
//! Guards are reference counted. The runtime context owns shared guards and
//! only observes unique guards through weak references; entry points keep
//! strong references while their code depends on them.

pub mod runtime_context;

pub use runtime_context::{PropertyGuardEntry, RuntimeContext, RuntimeStats};

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Interned property name
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PropertyId(pub u32);

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "prop#{}", self.0)
    }
}

/// Address of an object type (shape)
///
/// Values up to [`guard_value::INVALIDATED_DURING_SWEEP`] are reserved for
/// guard states and never name a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeRef(u64);

impl TypeRef {
    pub const fn new(address: u64) -> Self {
        TypeRef(address)
    }

    pub const fn address(self) -> u64 {
        self.0
    }
}

/// Reserved guard words
pub mod guard_value {
    pub const INVALIDATED: usize = 0;
    pub const UNINITIALIZED: usize = 1;
    pub const INVALIDATED_DURING_SWEEP: usize = 2;
}

// =============================================================================
// PropertyGuard
// =============================================================================

#[derive(Debug)]
struct GuardCell {
    value: AtomicUsize,
    property: PropertyId,
    index: Option<u32>,
}

/// Shared, invalidatable assumption about one property
#[derive(Debug, Clone)]
pub struct PropertyGuard(Arc<GuardCell>);

impl PropertyGuard {
    /// Shared guard, valid but not yet bound to a type
    pub fn new(property: PropertyId) -> Self {
        Self::with_value(property, guard_value::UNINITIALIZED, None)
    }

    /// Unique guard protecting `type_ref`
    pub fn for_type(property: PropertyId, type_ref: TypeRef) -> Self {
        Self::with_value(property, Self::encode(type_ref), None)
    }

    /// Unique guard referenced from compiled code by slot index
    pub fn indexed(property: PropertyId, type_ref: TypeRef, index: u32) -> Self {
        Self::with_value(property, Self::encode(type_ref), Some(index))
    }

    fn with_value(property: PropertyId, value: usize, index: Option<u32>) -> Self {
        PropertyGuard(Arc::new(GuardCell {
            value: AtomicUsize::new(value),
            property,
            index,
        }))
    }

    fn encode(type_ref: TypeRef) -> usize {
        let value = type_ref.address() as usize;
        debug_assert!(value > guard_value::INVALIDATED_DURING_SWEEP);
        value
    }

    pub fn property(&self) -> PropertyId {
        self.0.property
    }

    pub fn index(&self) -> Option<u32> {
        self.0.index
    }

    #[inline]
    pub fn value(&self) -> usize {
        self.0.value.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        let value = self.value();
        value != guard_value::INVALIDATED && value != guard_value::INVALIDATED_DURING_SWEEP
    }

    /// Type this guard protects, if bound and valid
    pub fn type_ref(&self) -> Option<TypeRef> {
        match self.value() {
            guard_value::INVALIDATED
            | guard_value::UNINITIALIZED
            | guard_value::INVALIDATED_DURING_SWEEP => None,
            value => Some(TypeRef::new(value as u64)),
        }
    }

    pub fn invalidate(&self) {
        self.0
            .value
            .store(guard_value::INVALIDATED, Ordering::Release);
    }

    pub fn invalidate_during_sweep(&self) {
        self.0
            .value
            .store(guard_value::INVALIDATED_DURING_SWEEP, Ordering::Release);
    }

    /// Rebind a still-valid guard to a new type
    pub fn set_value(&self, type_ref: TypeRef) {
        debug_assert!(self.is_valid());
        self.0.value.store(Self::encode(type_ref), Ordering::Release);
    }

    pub fn ptr_eq(&self, other: &PropertyGuard) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn downgrade(&self) -> WeakGuard {
        WeakGuard(Arc::downgrade(&self.0))
    }

    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

/// Non-owning reference to a [`PropertyGuard`]
#[derive(Debug, Clone)]
pub struct WeakGuard(Weak<GuardCell>);

impl WeakGuard {
    pub fn upgrade(&self) -> Option<PropertyGuard> {
        self.0.upgrade().map(PropertyGuard)
    }

    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }

    pub fn refers_to(&self, guard: &PropertyGuard) -> bool {
        std::ptr::eq(self.0.as_ptr(), Arc::as_ptr(&guard.0))
    }
}

// =============================================================================
// EquivalentTypeCache
// =============================================================================

/// Number of types an equivalent-type cache can hold
pub const EQUIVALENT_TYPE_CACHE_SIZE: usize = 8;

/// Types interchangeable for one property access
#[derive(Debug, Clone)]
pub struct EquivalentTypeCache {
    types: [Option<TypeRef>; EQUIVALENT_TYPE_CACHE_SIZE],
    guard: PropertyGuard,
    next_eviction_victim: u8,
    pub obj_type_spec_fld_id: u32,
    pub is_loaded_from_proto: bool,
    pub has_fixed_value: bool,
}

impl EquivalentTypeCache {
    pub fn new(guard: PropertyGuard, obj_type_spec_fld_id: u32) -> Self {
        EquivalentTypeCache {
            types: [None; EQUIVALENT_TYPE_CACHE_SIZE],
            guard,
            next_eviction_victim: 0,
            obj_type_spec_fld_id,
            is_loaded_from_proto: false,
            has_fixed_value: false,
        }
    }

    pub fn guard(&self) -> &PropertyGuard {
        &self.guard
    }

    pub fn contains(&self, type_ref: TypeRef) -> bool {
        self.types.contains(&Some(type_ref))
    }

    /// Add a type, evicting round-robin once full
    pub fn add_type(&mut self, type_ref: TypeRef) {
        if self.contains(type_ref) {
            return;
        }
        if let Some(slot) = self.types.iter_mut().find(|slot| slot.is_none()) {
            *slot = Some(type_ref);
            return;
        }
        let victim = self.next_eviction_victim as usize % EQUIVALENT_TYPE_CACHE_SIZE;
        self.types[victim] = Some(type_ref);
        self.next_eviction_victim = ((victim + 1) % EQUIVALENT_TYPE_CACHE_SIZE) as u8;
    }

    pub fn types(&self) -> impl Iterator<Item = TypeRef> + '_ {
        self.types.iter().flatten().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.types.iter().all(Option::is_none)
    }

    /// Drop types the collector found dead
    ///
    /// Survivors are compacted to the front. If the guard's own type died the
    /// guard is invalidated during sweep. Returns whether any type survived.
    pub fn clear_unused_types(&mut self, is_live: &dyn Fn(TypeRef) -> bool) -> bool {
        let mut survivors = [None; EQUIVALENT_TYPE_CACHE_SIZE];
        let mut count = 0;
        for type_ref in self.types.iter().flatten() {
            if is_live(*type_ref) {
                survivors[count] = Some(*type_ref);
                count += 1;
            }
        }
        self.types = survivors;
        self.next_eviction_victim = 0;

        if let Some(type_ref) = self.guard.type_ref() {
            if !is_live(type_ref) {
                self.guard.invalidate_during_sweep();
            }
        }
        count > 0
    }

    /// Zero the contents without touching the guard's registrations
    pub fn zero(&mut self) {
        self.types = [None; EQUIVALENT_TYPE_CACHE_SIZE];
        self.next_eviction_victim = 0;
    }
}

// =============================================================================
// ConstructorCache
// =============================================================================

/// Shape produced by a constructor, shared by all its call sites
#[derive(Debug)]
pub struct ConstructorCache {
    guard: PropertyGuard,
    pub slot_count: u32,
    pub inline_slot_count: u16,
}

impl ConstructorCache {
    pub fn new(property: PropertyId, type_ref: TypeRef, slot_count: u32) -> Arc<Self> {
        Arc::new(ConstructorCache {
            guard: PropertyGuard::for_type(property, type_ref),
            slot_count,
            inline_slot_count: slot_count.min(u16::MAX as u32) as u16,
        })
    }

    pub fn guard(&self) -> &PropertyGuard {
        &self.guard
    }

    pub fn is_valid(&self) -> bool {
        self.guard.is_valid()
    }

    pub fn invalidate(&self) {
        self.guard.invalidate();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const P: PropertyId = PropertyId(7);

    #[test]
    fn test_guard_states() {
        let shared = PropertyGuard::new(P);
        assert!(shared.is_valid());
        assert_eq!(shared.type_ref(), None);

        shared.set_value(TypeRef::new(0x1000));
        assert_eq!(shared.type_ref(), Some(TypeRef::new(0x1000)));

        shared.invalidate();
        assert!(!shared.is_valid());

        let swept = PropertyGuard::indexed(P, TypeRef::new(0x2000), 3);
        assert_eq!(swept.index(), Some(3));
        swept.invalidate_during_sweep();
        assert!(!swept.is_valid());
        assert_eq!(swept.value(), guard_value::INVALIDATED_DURING_SWEEP);
    }

    #[test]
    fn test_weak_guard() {
        let guard = PropertyGuard::for_type(P, TypeRef::new(0x1000));
        let weak = guard.downgrade();
        assert!(weak.refers_to(&guard));
        assert!(weak.upgrade().unwrap().ptr_eq(&guard));
        drop(guard);
        assert!(!weak.is_alive());
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_equivalent_cache_eviction() {
        let mut cache = EquivalentTypeCache::new(PropertyGuard::new(P), 0);
        for i in 0..EQUIVALENT_TYPE_CACHE_SIZE as u64 {
            cache.add_type(TypeRef::new(0x100 + i));
        }
        cache.add_type(TypeRef::new(0x999));
        assert!(cache.contains(TypeRef::new(0x999)));
        assert!(!cache.contains(TypeRef::new(0x100)));
        assert_eq!(cache.types().count(), EQUIVALENT_TYPE_CACHE_SIZE);
    }

    #[test]
    fn test_clear_unused_types() {
        let guard = PropertyGuard::for_type(P, TypeRef::new(0x100));
        let mut cache = EquivalentTypeCache::new(guard.clone(), 0);
        cache.add_type(TypeRef::new(0x100));
        cache.add_type(TypeRef::new(0x200));

        let survived = cache.clear_unused_types(&|t| t == TypeRef::new(0x200));
        assert!(survived);
        assert_eq!(cache.types().collect::<Vec<_>>(), vec![TypeRef::new(0x200)]);
        assert!(!guard.is_valid());

        assert!(!cache.clear_unused_types(&|_| false));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_constructor_cache_shares_guard() {
        let cache = ConstructorCache::new(P, TypeRef::new(0x4000), 3);
        let other_site = Arc::clone(&cache);
        other_site.invalidate();
        assert!(!cache.is_valid());
    }
}
