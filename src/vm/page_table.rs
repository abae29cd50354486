// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Cross-Architecture Page Table Interface
//!
//! The virtual-memory core does not prescribe a page-table format. It
//! drives the hardware through [`VirtualOperations`], which each
//! architecture implements over its table walker. The contract that
//! matters: between any `unmap_single_page` and the acknowledgement of the
//! shootdown that follows it, no CPU observes the old translation.
//!
//! [`SoftPageTable`] is the software implementation used by hosted builds
//! and tests. It keeps entries in a map, accumulates dirty bits the way a
//! hardware walker would, and routes shootdowns through a [`ShootdownHub`]
//! so tests control acknowledgement timing.

use crate::vm::layout::{is_page_aligned, CachingMode, PageFlags, PageStatus};
use crate::vm::shootdown::{RetireNode, ShootNode, ShootdownHub};
use crate::types::{PAddr, VAddr};
use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

/// Low-level operations a virtual space drives
pub trait VirtualOperations: Send + Sync {
    /// Install a translation for a single page
    ///
    /// Precondition: no prior mapping at `va`.
    fn map_single_page(&self, va: VAddr, pa: PAddr, flags: PageFlags, caching: CachingMode);

    /// Remove the translation for a single page
    ///
    /// Returns the presence and accumulated dirty status of the old entry.
    fn unmap_single_page(&self, va: VAddr) -> PageStatus;

    /// Check whether a translation is installed at `va`
    fn is_mapped(&self, va: VAddr) -> bool;

    /// Invalidate a range on every CPU currently using this space
    fn submit_shootdown(&self, node: ShootNode);

    /// Free the page table
    fn retire(&self, node: RetireNode);
}

struct SoftEntry {
    paddr: PAddr,
    flags: PageFlags,
    caching: CachingMode,
    dirty: bool,
}

/// Software page table for hosted builds and tests
pub struct SoftPageTable {
    entries: Mutex<BTreeMap<VAddr, SoftEntry>>,
    hub: ShootdownHub,
    retired: AtomicBool,
}

impl SoftPageTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            hub: ShootdownHub::new(),
            retired: AtomicBool::new(false),
        }
    }

    /// The shootdown coordinator for this table
    pub fn hub(&self) -> &ShootdownHub {
        &self.hub
    }

    /// Resolve a virtual address to the mapped frame, if any
    pub fn translate(&self, va: VAddr) -> Option<PAddr> {
        self.entries
            .lock()
            .get(&(va & !crate::vm::layout::PAGE_MASK))
            .map(|entry| entry.paddr)
    }

    /// Read back the flags installed for `va`
    pub fn flags_of(&self, va: VAddr) -> Option<PageFlags> {
        self.entries.lock().get(&va).map(|entry| entry.flags)
    }

    /// Read back the caching mode installed for `va`
    pub fn caching_of(&self, va: VAddr) -> Option<CachingMode> {
        self.entries.lock().get(&va).map(|entry| entry.caching)
    }

    /// Raise the dirty bit of a present entry
    ///
    /// Models the table walker observing a store through a writable entry.
    pub fn set_dirty(&self, va: VAddr) {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&(va & !crate::vm::layout::PAGE_MASK))
            .expect("store through an absent translation");
        assert!(
            entry.flags.contains(PageFlags::WRITE),
            "store through a read-only translation"
        );
        entry.dirty = true;
    }

    /// Number of installed entries
    pub fn mapped_pages(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Default for SoftPageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualOperations for SoftPageTable {
    fn map_single_page(&self, va: VAddr, pa: PAddr, flags: PageFlags, caching: CachingMode) {
        assert!(is_page_aligned(va));
        assert!(!self.retired.load(Ordering::Relaxed));
        let mut entries = self.entries.lock();
        let prior = entries.insert(
            va,
            SoftEntry {
                paddr: pa,
                flags,
                caching,
                dirty: false,
            },
        );
        assert!(prior.is_none(), "double map at {va:#x}");
    }

    fn unmap_single_page(&self, va: VAddr) -> PageStatus {
        assert!(is_page_aligned(va));
        match self.entries.lock().remove(&va) {
            Some(entry) => {
                let mut status = PageStatus::PRESENT;
                if entry.dirty {
                    status |= PageStatus::DIRTY;
                }
                status
            }
            None => PageStatus::empty(),
        }
    }

    fn is_mapped(&self, va: VAddr) -> bool {
        self.entries.lock().contains_key(&va)
    }

    fn submit_shootdown(&self, node: ShootNode) {
        self.hub.submit(node);
    }

    fn retire(&self, node: RetireNode) {
        self.retired.store(true, Ordering::Relaxed);
        self.entries.lock().clear();
        node.complete();
    }
}
