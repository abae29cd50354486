// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Virtual Memory Subsystem
//!
//! This module provides the architecture-agnostic virtual-memory core: the
//! layout of address spaces, the memory views backing them, the managed
//! page cache driven by user-space pagers, copy-on-write chains, the fault
//! handler and TLB shootdown.
//!
//! # Design Goals
//!
//! 1. **Uniform semantics** - Same rules for mapping, permissions, sharing,
//!    COW and paging regardless of what backs a view
//! 2. **Object-based memory** - Memory is represented as reference-counted
//!    views; slices of views are the currency of mapping
//! 3. **Explicit operations** - No hidden mappings and no kernel-magic
//!    ownership changes; frames move between allocator, view and chain only
//!    through the paths spelled out here
//!
//! # Organization
//!
//! - [`layout`] - Page constants, address range, flag types
//! - [`pmm`] - Frame provider seam over the physical allocator
//! - [`page_table`] - Cross-architecture page-table interface
//! - [`shootdown`] - Cross-CPU invalidation with acknowledgement
//! - [`view`] - Memory views and slices
//! - [`managed`] - Page cache backed by a user-space pager
//! - [`cow`] - Copy-on-write chains
//! - [`holes`] - Free-range tree with the largest-hole aggregate
//! - [`aspace`] - Virtual spaces, mappings, fork and retirement
//! - [`fault`] - Page-fault entry point
//! - [`debug`] - Layout and RSS audits

pub mod aspace;
pub mod cow;
pub mod debug;
pub mod fault;
pub mod holes;
pub mod layout;
pub mod managed;
pub mod page_table;
pub mod pmm;
pub mod shootdown;
pub mod view;

#[cfg(test)]
mod tests;

// Re-exports for convenience
pub use layout::{
    is_page_aligned, page_align_down, page_align_up, CachingMode, MapFlags, MappingFlags,
    PageFlags, PageStatus, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE,
};

pub use aspace::{
    AcquireNode, AddressSpace, Mapping, MappingState, SpaceLockHandle, TouchNode, TouchOutcome,
    VirtualSpace,
};
pub use fault::{handle_page_fault, FaultFlags, FaultNode, FaultOutcome};
pub use managed::{
    create_managed_pair, BackingMemory, FrontalMemory, ManageKind, ManageNode, ManageRequest,
};
pub use page_table::{SoftPageTable, VirtualOperations};
pub use pmm::{bootstrap_frames, frames, FrameProvider, HeapFrameArena, PageAccessor};
pub use shootdown::{RetireNode, ShootNode, ShootdownHub};
pub use view::{
    AllocatedMemory, EvictNode, FetchFlags, FetchRangeNode, HardwareMemory, LockRangeNode,
    MemorySlice, MemoryView, MirroredMemory, PhysicalRange,
};
