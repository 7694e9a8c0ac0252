//! Native code heap bookkeeping.
//!
//! Compiled code is committed into a bump-allocated address range. The
//! allocator tracks every live block so the engine can report committed code
//! size (which drives expirable collect mode) and so a block freed twice is
//! caught instead of corrupting the accounting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::backend::entry_point::NativeAddress;
use crate::backend::error::{CodegenError, CodegenResult};

/// Base of the synthetic code range
pub const CODE_HEAP_BASE: u64 = 0x7f00_0000_0000;

/// Blocks are aligned to this many bytes
pub const CODE_ALIGNMENT: u64 = 16;

/// One committed block of native code
#[derive(Debug, PartialEq, Eq)]
pub struct CodeAllocation {
    address: NativeAddress,
    size: usize,
}

impl CodeAllocation {
    pub fn address(&self) -> NativeAddress {
        self.address
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn contains(&self, address: NativeAddress) -> bool {
        let start = self.address.as_u64();
        (start..start + self.size as u64).contains(&address.as_u64())
    }
}

#[derive(Debug)]
struct CodeHeap {
    next: u64,
    live: HashMap<u64, usize>,
    live_bytes: usize,
}

/// Allocator for committed native code
#[derive(Debug)]
pub struct CodeAllocator {
    heap: Mutex<CodeHeap>,
    capacity: Option<usize>,
    allocations: AtomicU64,
    frees: AtomicU64,
    double_frees: AtomicU64,
}

impl Default for CodeAllocator {
    fn default() -> Self {
        CodeAllocator::new(None)
    }
}

impl CodeAllocator {
    /// `capacity` bounds the live bytes
    pub fn new(capacity: Option<usize>) -> Self {
        CodeAllocator {
            heap: Mutex::new(CodeHeap {
                next: CODE_HEAP_BASE,
                live: HashMap::new(),
                live_bytes: 0,
            }),
            capacity,
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            double_frees: AtomicU64::new(0),
        }
    }

    pub fn allocate(&self, size: usize) -> CodegenResult<CodeAllocation> {
        let mut heap = self.heap.lock();
        if let Some(capacity) = self.capacity {
            if heap.live_bytes + size > capacity {
                trace!(size, live = heap.live_bytes, capacity, "code heap full");
                return Err(CodegenError::OutOfMemory);
            }
        }
        let address = heap.next;
        let reserved = (size.max(1) as u64).div_ceil(CODE_ALIGNMENT) * CODE_ALIGNMENT;
        heap.next += reserved;
        heap.live.insert(address, size);
        heap.live_bytes += size;
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(CodeAllocation {
            address: NativeAddress::new(address),
            size,
        })
    }

    pub fn free(&self, allocation: CodeAllocation) {
        let mut heap = self.heap.lock();
        match heap.live.remove(&allocation.address.as_u64()) {
            Some(size) => {
                heap.live_bytes -= size;
                self.frees.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                drop(heap);
                self.double_frees.fetch_add(1, Ordering::Relaxed);
                warn!(address = %allocation.address, "native code freed twice");
                debug_assert!(false, "native code at {} freed twice", allocation.address);
            }
        }
    }

    /// Bytes of committed code still live
    pub fn live_bytes(&self) -> usize {
        self.heap.lock().live_bytes
    }

    pub fn live_allocations(&self) -> usize {
        self.heap.lock().live.len()
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_aligned_and_free() {
        let allocator = CodeAllocator::default();
        let a = allocator.allocate(10).unwrap();
        let b = allocator.allocate(20).unwrap();
        assert_eq!(a.address().as_u64(), CODE_HEAP_BASE);
        assert_eq!(b.address().as_u64(), CODE_HEAP_BASE + 16);
        assert!(a.contains(NativeAddress::new(CODE_HEAP_BASE + 9)));
        assert!(!a.contains(NativeAddress::new(CODE_HEAP_BASE + 10)));
        assert_eq!(allocator.live_bytes(), 30);

        allocator.free(a);
        assert_eq!(allocator.live_bytes(), 20);
        assert_eq!(allocator.live_allocations(), 1);
        assert_eq!(allocator.frees(), 1);
    }

    #[test]
    fn test_capacity() {
        let allocator = CodeAllocator::new(Some(64));
        let a = allocator.allocate(60).unwrap();
        assert_eq!(allocator.allocate(8), Err(CodegenError::OutOfMemory));
        allocator.free(a);
        assert!(allocator.allocate(64).is_ok());
        assert_eq!(allocator.double_frees(), 0);
    }
}
