//! Generation-checked slot arena.
//!
//! Function units, entry points and their back references are stored in
//! [`Arena`]s and refer to each other through [`Handle`]s. A handle is an
//! index plus the generation of the slot at insertion time; freeing a slot
//! bumps its generation, so any handle that outlives its value resolves to
//! `None` instead of aliasing whatever is allocated in the slot next.
//!
//! Handles are therefore weak references: holding one never keeps a value
//! alive, and the collector (or the engine) can retire a value at any point.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Generation counter for detecting stale handles
pub type Generation = u32;

/// Reserved generation values
pub mod generation {
    use super::Generation;

    /// First generation handed out for a fresh slot
    pub const FIRST: Generation = 1;

    /// Slots reaching this generation are retired instead of reused
    pub const OVERFLOW_GUARD: Generation = u32::MAX - 1;
}

/// Typed, generation-checked index into an [`Arena<T>`]
pub struct Handle<T> {
    index: u32,
    generation: Generation,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: u32, generation: Generation) -> Self {
        Handle {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Slot index, stable for the lifetime of the value
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }
}

/// Handle that was never issued by an arena, for tests that only need identity
#[cfg(test)]
pub(crate) fn test_handle<T>(index: u32) -> Handle<T> {
    Handle::new(index, generation::FIRST)
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

enum Slot<T> {
    Occupied { generation: Generation, value: T },
    Vacant { generation: Generation, next_free: Option<u32> },
}

/// Slab of values addressed by [`Handle`]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub const fn new() -> Self {
        Arena {
            slots: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    /// Insert a value, reusing a vacant slot when possible
    pub fn insert(&mut self, value: T) -> Handle<T> {
        self.insert_with(|_| value)
    }

    /// Insert a value that needs to know its own handle
    pub fn insert_with(&mut self, make: impl FnOnce(Handle<T>) -> T) -> Handle<T> {
        self.len += 1;
        if let Some(index) = self.free_head {
            let slot = &mut self.slots[index as usize];
            let (generation, next_free) = match slot {
                Slot::Vacant {
                    generation,
                    next_free,
                } => (*generation, *next_free),
                Slot::Occupied { .. } => unreachable!("free list points at an occupied slot"),
            };
            self.free_head = next_free;
            let handle = Handle::new(index, generation);
            *slot = Slot::Occupied {
                generation,
                value: make(handle),
            };
            return handle;
        }

        let index = self.slots.len() as u32;
        let handle = Handle::new(index, generation::FIRST);
        self.slots.push(Slot::Occupied {
            generation: generation::FIRST,
            value: make(handle),
        });
        handle
    }

    /// Remove a value; returns `None` for stale handles
    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == handle.generation => {}
            _ => return None,
        }

        let next_generation = handle.generation.saturating_add(1);
        // Exhausted slots are never linked back into the free list.
        let next_free = if next_generation >= generation::OVERFLOW_GUARD {
            None
        } else {
            self.free_head.replace(handle.index)
        };
        let old = std::mem::replace(
            slot,
            Slot::Vacant {
                generation: next_generation,
                next_free,
            },
        );
        self.len -= 1;
        match old {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Vacant { .. } => None,
        }
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        match self.slots.get(handle.index as usize)? {
            Slot::Occupied { generation, value } if *generation == handle.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        match self.slots.get_mut(handle.index as usize)? {
            Slot::Occupied { generation, value } if *generation == handle.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate live values with their handles
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, value } => {
                    Some((Handle::new(index as u32, *generation), value))
                }
                Slot::Vacant { .. } => None,
            })
    }

    /// Handles of all live values
    pub fn handles(&self) -> Vec<Handle<T>> {
        self.iter().map(|(handle, _)| handle).collect()
    }
}

impl<T: fmt::Debug> fmt::Debug for Arena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.remove(a), Some("a"));
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        let mut arena = Arena::new();
        let a = arena.insert(1);
        arena.remove(a);
        let c = arena.insert(3);
        assert_eq!(a.index(), c.index());
        assert_ne!(a, c);
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.get(c), Some(&3));
        assert_eq!(arena.remove(a), None);
    }

    #[test]
    fn test_double_remove_is_none() {
        let mut arena = Arena::new();
        let a = arena.insert(1);
        assert!(arena.remove(a).is_some());
        assert!(arena.remove(a).is_none());
        assert!(arena.is_empty());
    }

    #[test]
    fn test_insert_with_sees_own_handle() {
        let mut arena: Arena<(u32, Generation)> = Arena::new();
        let h = arena.insert_with(|h| (h.index(), h.generation()));
        assert_eq!(arena.get(h), Some(&(h.index(), h.generation())));
    }

    #[test]
    fn test_iter_skips_vacant() {
        let mut arena = Arena::new();
        let handles: Vec<_> = (0..5).map(|i| arena.insert(i)).collect();
        arena.remove(handles[1]);
        arena.remove(handles[3]);
        let live: Vec<i32> = arena.iter().map(|(_, v)| *v).collect();
        assert_eq!(live, vec![0, 2, 4]);
        assert_eq!(arena.handles().len(), 3);
    }
}
