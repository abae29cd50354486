// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Frame Provider Seam
//!
//! This module is the seam between the virtual-memory core and the physical
//! page allocator. The core never talks to the buddy allocator directly; it
//! allocates and frees frames through the [`FrameProvider`] trait and
//! reaches frame contents through the direct map via [`PageAccessor`].
//!
//! # Design
//!
//! - **Opaque allocator**: `allocate(order, address_bits)` returns a frame
//!   or [`INVALID_PADDR`]; the core imposes no policy
//! - **Context argument**: every view, chain and space carries the provider
//!   it was created with, so tests substitute a stub without touching
//!   global state
//! - **Bootstrap singleton**: the kernel installs its allocator once at
//!   boot for code that has no natural context to thread through

use crate::types::{PAddr, INVALID_PADDR};
use crate::vm::layout::PAGE_SIZE;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Once;

/// Interface to the physical page allocator and the direct map
pub trait FrameProvider: Send + Sync {
    /// Allocate `1 << order` contiguous frames
    ///
    /// `address_bits` restricts the physical address width of the result
    /// (DMA-limited devices). Returns [`INVALID_PADDR`] on exhaustion.
    fn allocate(&self, order: u32, address_bits: u32) -> PAddr;

    /// Return `1 << order` frames starting at `paddr` to the allocator
    fn free(&self, paddr: PAddr, order: u32);

    /// Direct-map access to a frame
    ///
    /// The returned pointer stays valid until the frame is freed.
    fn access(&self, paddr: PAddr) -> *mut u8;

    /// The shared all-zero frame
    ///
    /// Mapped read-only wherever a read fault on an unbacked page must
    /// observe zeros. Never freed.
    fn zero_frame(&self) -> PAddr;

    /// Number of frames currently allocated
    fn used_pages(&self) -> usize;

    /// Number of frames still available
    fn free_pages(&self) -> usize;
}

static FRAMES: Once<Arc<dyn FrameProvider>> = Once::new();

/// Install the boot-time frame provider
///
/// Called once during kernel bootstrap, before any view is created without
/// an explicit provider context.
pub fn bootstrap_frames(provider: Arc<dyn FrameProvider>) {
    FRAMES.call_once(|| provider);
}

/// The boot-time frame provider
pub fn frames() -> Arc<dyn FrameProvider> {
    FRAMES
        .get()
        .expect("frame provider is not bootstrapped")
        .clone()
}

/// Accessor for the contents of a single frame
///
/// Thin wrapper over the provider's direct map that keeps the unsafe block
/// in one place.
pub struct PageAccessor {
    ptr: *mut u8,
}

impl PageAccessor {
    /// Access the frame at `paddr`
    pub fn new(provider: &dyn FrameProvider, paddr: PAddr) -> Self {
        assert_ne!(paddr, INVALID_PADDR);
        Self {
            ptr: provider.access(paddr),
        }
    }

    /// The frame as a byte slice
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the provider hands out a PAGE_SIZE direct-map window that
        // lives until the frame is freed.
        unsafe { core::slice::from_raw_parts(self.ptr, PAGE_SIZE) }
    }

    /// The frame as a mutable byte slice
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: see as_slice; the accessor is unique for the write.
        unsafe { core::slice::from_raw_parts_mut(self.ptr, PAGE_SIZE) }
    }

    /// Fill the frame with zeros
    pub fn zero(&mut self) {
        self.as_mut_slice().fill(0);
    }

    /// Copy another frame into this one
    pub fn copy_from(&mut self, other: &PageAccessor) {
        self.as_mut_slice().copy_from_slice(other.as_slice());
    }
}

/// Heap-backed frame provider for hosted builds and tests
///
/// Frames are page-aligned heap blocks; the heap address doubles as the
/// physical address, which makes the direct map the identity.
pub struct HeapFrameArena {
    capacity: usize,
    used: AtomicUsize,
    zero: Once<PAddr>,
}

impl HeapFrameArena {
    /// Create an arena that refuses to exceed `capacity` frames
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            used: AtomicUsize::new(0),
            zero: Once::new(),
        })
    }

    fn layout(order: u32) -> core::alloc::Layout {
        let size = PAGE_SIZE << order;
        core::alloc::Layout::from_size_align(size, size).unwrap()
    }
}

impl FrameProvider for HeapFrameArena {
    fn allocate(&self, order: u32, _address_bits: u32) -> PAddr {
        let count = 1usize << order;
        let mut used = self.used.load(Ordering::Relaxed);
        loop {
            if used + count > self.capacity {
                return INVALID_PADDR;
            }
            match self.used.compare_exchange(
                used,
                used + count,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => used = actual,
            }
        }
        // SAFETY: the layout is non-zero and page-aligned.
        let ptr = unsafe { alloc::alloc::alloc_zeroed(Self::layout(order)) };
        if ptr.is_null() {
            self.used.fetch_sub(count, Ordering::Relaxed);
            return INVALID_PADDR;
        }
        ptr as PAddr
    }

    fn free(&self, paddr: PAddr, order: u32) {
        assert_ne!(paddr, INVALID_PADDR);
        // SAFETY: paddr was returned by allocate with the same order.
        unsafe { alloc::alloc::dealloc(paddr as *mut u8, Self::layout(order)) };
        self.used.fetch_sub(1usize << order, Ordering::Relaxed);
    }

    fn access(&self, paddr: PAddr) -> *mut u8 {
        paddr as *mut u8
    }

    fn zero_frame(&self) -> PAddr {
        *self.zero.call_once(|| {
            let frame = self.allocate(0, 64);
            assert_ne!(frame, INVALID_PADDR, "arena exhausted at bootstrap");
            frame
        })
    }

    fn used_pages(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    fn free_pages(&self) -> usize {
        self.capacity - self.used_pages()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_free() {
        let arena = HeapFrameArena::new(8);
        let frame = arena.allocate(0, 64);
        assert_ne!(frame, INVALID_PADDR);
        assert_eq!(arena.used_pages(), 1);

        arena.free(frame, 0);
        assert_eq!(arena.used_pages(), 0);
        assert_eq!(arena.free_pages(), 8);
    }

    #[test]
    fn test_capacity_is_enforced() {
        let arena = HeapFrameArena::new(2);
        let a = arena.allocate(0, 64);
        let b = arena.allocate(0, 64);
        assert_ne!(a, INVALID_PADDR);
        assert_ne!(b, INVALID_PADDR);
        assert_eq!(arena.allocate(0, 64), INVALID_PADDR);
        arena.free(a, 0);
        arena.free(b, 0);
    }

    #[test]
    fn test_frames_come_back_zeroed() {
        let arena = HeapFrameArena::new(4);
        let frame = arena.allocate(0, 64);
        let accessor = PageAccessor::new(&*arena, frame);
        assert!(accessor.as_slice().iter().all(|&b| b == 0));
        arena.free(frame, 0);
    }

    #[test]
    fn test_higher_order_allocation() {
        let arena = HeapFrameArena::new(8);
        let chunk = arena.allocate(2, 64);
        assert_ne!(chunk, INVALID_PADDR);
        assert_eq!(arena.used_pages(), 4);
        assert_eq!(chunk as usize % (PAGE_SIZE << 2), 0);
        arena.free(chunk, 2);
        assert_eq!(arena.used_pages(), 0);
    }

    #[test]
    fn test_zero_frame_is_stable() {
        let arena = HeapFrameArena::new(4);
        let z0 = arena.zero_frame();
        let z1 = arena.zero_frame();
        assert_eq!(z0, z1);
        assert_eq!(arena.used_pages(), 1);
    }
}
