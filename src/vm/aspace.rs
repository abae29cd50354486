// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Address Space Management
//!
//! A virtual space owns the layout of one address space: a hole tree of
//! free ranges and a mapping tree of live bindings. Mappings bind slices of
//! memory views at virtual addresses, observe their views for eviction, and
//! resolve faults by locking and fetching pages from the view (or through a
//! copy-on-write chain).
//!
//! # Design
//!
//! - Holes and mappings partition the managed range exactly; a mapping and
//!   a hole never overlap
//! - One mutex per space guards both trees; it is held only for lookups and
//!   tree surgery, never across a suspension point
//! - Every mapping carries an evict mutex so installation and eviction of
//!   the same pages serialize
//! - A zombie mapping stays in the tree until the teardown shootdown
//!   acknowledges; remote CPUs may still touch it until then
//!
//! # Mapping lifecycle
//!
//! ```text
//! null -> active -> zombie -> retired
//! ```

use crate::errors::{Error, Result};
use crate::sync::{Completion, WorkQueue};
use crate::types::{PAddr, VAddr};
use crate::vm::cow::CowChain;
use crate::vm::fault::{FaultFlags, FaultNode, FaultOutcome};
use crate::vm::holes::{AllocationStrategy, HoleTree};
use crate::vm::layout::{
    is_page_aligned, page_align_down, page_align_up, CachingMode, MapFlags, MappingFlags,
    PageFlags, PageStatus, PAGE_MASK, PAGE_SIZE, USER_LOWER, USER_UPPER,
};
use crate::vm::page_table::{SoftPageTable, VirtualOperations};
use crate::vm::pmm::{FrameProvider, PageAccessor};
use crate::vm::shootdown::{RetireNode, ShootNode};
use crate::vm::view::{
    EvictNode, FetchFlags, FetchRangeNode, LockRangeNode, MemorySlice, MemoryView, PhysicalRange,
};
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use log::debug;
use spin::{Mutex, Once};

/// Normalize requested protection bits
///
/// Write implies read and execute implies read; write+execute is preserved
/// as RWX. Pure write and pure execute are promoted accordingly.
fn compile_map_flags(flags: MapFlags) -> MappingFlags {
    let mask = MapFlags::PROT_READ | MapFlags::PROT_WRITE | MapFlags::PROT_EXECUTE;
    let prot = flags & mask;
    let mut out = if prot == mask || prot == MapFlags::PROT_WRITE | MapFlags::PROT_EXECUTE {
        MappingFlags::PROT_READ | MappingFlags::PROT_WRITE | MappingFlags::PROT_EXECUTE
    } else if prot == MapFlags::PROT_READ | MapFlags::PROT_EXECUTE
        || prot == MapFlags::PROT_EXECUTE
    {
        MappingFlags::PROT_READ | MappingFlags::PROT_EXECUTE
    } else if prot == MapFlags::PROT_READ | MapFlags::PROT_WRITE || prot == MapFlags::PROT_WRITE {
        MappingFlags::PROT_READ | MappingFlags::PROT_WRITE
    } else if prot == MapFlags::PROT_READ {
        MappingFlags::PROT_READ
    } else {
        MappingFlags::empty()
    };
    if flags.contains(MapFlags::DONT_REQUIRE_BACKING) {
        out |= MappingFlags::DONT_REQUIRE_BACKING;
    }
    if flags.contains(MapFlags::DROP_AT_FORK) {
        out |= MappingFlags::DROP_AT_FORK;
    } else if flags.contains(MapFlags::SHARE_AT_FORK) {
        out |= MappingFlags::SHARE_AT_FORK;
    } else if flags.contains(MapFlags::COPY_ON_WRITE_AT_FORK) {
        out |= MappingFlags::COPY_ON_WRITE_AT_FORK;
    }
    out
}

// ============================================================================
// Pending request nodes
// ============================================================================

/// Outcome of touching one virtual page
#[derive(Debug, Clone, Copy)]
pub struct TouchOutcome {
    /// The page was already installed by a concurrent resolver
    pub spurious: bool,
}

/// Pending touch of one virtual page
pub struct TouchNode {
    completion: Completion<Result<TouchOutcome>>,
}

impl TouchNode {
    pub fn new(
        queue: &Arc<WorkQueue>,
        func: impl FnOnce(Result<TouchOutcome>) + Send + 'static,
    ) -> Self {
        Self {
            completion: Completion::new(queue, func),
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        self.completion.queue().clone()
    }

    pub fn complete(self, result: Result<TouchOutcome>) {
        self.completion.post(result);
    }
}

/// Pending acquisition of a locked, populated virtual range
pub struct AcquireNode {
    completion: Completion<Result>,
}

impl AcquireNode {
    pub fn new(queue: &Arc<WorkQueue>, func: impl FnOnce(Result) + Send + 'static) -> Self {
        Self {
            completion: Completion::new(queue, func),
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        self.completion.queue().clone()
    }

    pub fn complete(self, result: Result) {
        self.completion.post(result);
    }
}

// ============================================================================
// Mapping
// ============================================================================

/// Lifecycle state of a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MappingState {
    Null = 0,
    Active = 1,
    Zombie = 2,
    Retired = 3,
}

impl MappingState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Null,
            1 => Self::Active,
            2 => Self::Zombie,
            _ => Self::Retired,
        }
    }
}

struct MappingHome {
    owner: Weak<VirtualSpace>,
    address: VAddr,
}

/// A live binding of a slice into a virtual space
pub struct Mapping {
    length: usize,
    slice: Arc<MemorySlice>,
    view: Arc<dyn MemoryView>,
    // Absolute offset into the view, slice offset already applied.
    view_offset: usize,
    flags: AtomicU32,
    state: AtomicU32,
    home: Once<MappingHome>,
    // Serializes page installation against observer eviction.
    evict_mutex: Mutex<()>,
    chain: Mutex<Option<Arc<CowChain>>>,
    self_ref: Weak<Mapping>,
}

impl Mapping {
    fn new(
        length: usize,
        flags: MappingFlags,
        slice: Arc<MemorySlice>,
        view_offset: usize,
    ) -> Arc<Self> {
        assert!(length > 0 && is_page_aligned(length));
        assert!(view_offset >= slice.offset());
        assert!(view_offset + length <= slice.offset() + slice.length());
        let view = slice.view().clone();
        Arc::new_cyclic(|self_ref| Self {
            length,
            slice,
            view,
            view_offset,
            flags: AtomicU32::new(flags.bits()),
            state: AtomicU32::new(MappingState::Null as u32),
            home: Once::new(),
            evict_mutex: Mutex::new(()),
            chain: Mutex::new(None),
            self_ref: self_ref.clone(),
        })
    }

    fn tie(&self, owner: &Arc<VirtualSpace>, address: VAddr) {
        assert!(self.home.get().is_none());
        self.home.call_once(|| MappingHome {
            owner: Arc::downgrade(owner),
            address,
        });
    }

    pub fn address(&self) -> VAddr {
        self.home.get().expect("untied mapping").address
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn flags(&self) -> MappingFlags {
        MappingFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn state(&self) -> MappingState {
        MappingState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn view_offset(&self) -> usize {
        self.view_offset
    }

    pub(crate) fn slice(&self) -> &Arc<MemorySlice> {
        &self.slice
    }

    fn set_state(&self, state: MappingState) {
        self.state.store(state as u32, Ordering::Release);
    }

    fn owner(&self) -> Option<Arc<VirtualSpace>> {
        self.home.get().and_then(|home| home.owner.upgrade())
    }

    fn set_protection(&self, flags: MappingFlags) {
        let mut raw = MappingFlags::from_bits_truncate(self.flags.load(Ordering::Acquire));
        raw.remove(MappingFlags::PERMISSION_MASK);
        raw |= flags & MappingFlags::PERMISSION_MASK;
        self.flags.store(raw.bits(), Ordering::Release);
    }

    fn set_chain(&self, chain: Option<Arc<CowChain>>) {
        *self.chain.lock() = chain;
    }

    fn page_flags(&self) -> PageFlags {
        let flags = self.flags();
        assert!(flags.contains(MappingFlags::PROT_READ));
        let mut out = PageFlags::READ;
        if flags.contains(MappingFlags::PROT_WRITE) {
            out |= PageFlags::WRITE;
        }
        if flags.contains(MappingFlags::PROT_EXECUTE) {
            out |= PageFlags::EXECUTE;
        }
        out
    }

    /// Resolve a mapping-relative offset to its current frame, if resident
    ///
    /// Consults the CoW chain before falling through to the view.
    pub fn resolve_present(&self, offset: usize) -> Option<PhysicalRange> {
        assert!(is_page_aligned(offset) && offset < self.length);
        if let Some(chain) = self.chain.lock().as_ref() {
            if let Some(frame) = chain.resolve(offset) {
                return Some(PhysicalRange {
                    addr: frame,
                    length: PAGE_SIZE,
                    caching: CachingMode::WriteBack,
                });
            }
        }
        let range = self.view.peek_range(self.view_offset + offset);
        range.is_resident().then_some(range)
    }

    /// Whether the frame currently resolved for `offset` belongs to the
    /// chain rather than the view
    fn is_chain_private(&self, offset: usize) -> bool {
        self.chain
            .lock()
            .as_ref()
            .map_or(false, |chain| chain.resolve(offset).is_some())
    }

    /// Install page-table entries for every already-resident page
    ///
    /// Null to active transition; registers as observer of the view.
    fn install(&self) {
        assert_eq!(self.state(), MappingState::Null);
        self.set_state(MappingState::Active);
        self.view.add_observer(self.self_ref.clone());

        let owner = self.owner().expect("installing an untied mapping");
        let mut flags = self.page_flags();
        if self.chain.lock().is_some() {
            // Shared CoW pages stay read-only until a write fault copies.
            flags.remove(PageFlags::WRITE);
        }

        // Synchronize with observe_eviction.
        let _evict = self.evict_mutex.lock();
        for progress in (0..self.length).step_by(PAGE_SIZE) {
            let va = self.address() + progress;
            assert!(!owner.ops().is_mapped(va));
            if let Some(range) = self.resolve_present(progress) {
                owner.ops().map_single_page(va, range.addr, flags, range.caching);
                owner.add_rss(PAGE_SIZE);
            }
        }
    }

    /// Remap every resident page with the current flags
    ///
    /// Used by protect; propagates accumulated dirty bits to the view.
    fn reinstall(&self) {
        assert_eq!(self.state(), MappingState::Active);
        let owner = self.owner().expect("reinstalling an untied mapping");
        let mut flags = self.page_flags();
        if self.chain.lock().is_some() {
            flags.remove(PageFlags::WRITE);
        }

        let _evict = self.evict_mutex.lock();
        for progress in (0..self.length).step_by(PAGE_SIZE) {
            let va = self.address() + progress;
            let status = owner.ops().unmap_single_page(va);
            if !status.contains(PageStatus::PRESENT) {
                continue;
            }
            if status.contains(PageStatus::DIRTY) && !self.is_chain_private(progress) {
                self.view.mark_dirty(self.view_offset + progress, PAGE_SIZE);
            }
            if let Some(range) = self.resolve_present(progress) {
                owner.ops().map_single_page(va, range.addr, flags, range.caching);
            } else {
                owner.sub_rss(PAGE_SIZE);
            }
        }
    }

    /// Remove every page-table entry; active to zombie transition
    fn uninstall(&self) {
        assert_eq!(self.state(), MappingState::Active);
        let owner = self.owner().expect("uninstalling an untied mapping");

        let _evict = self.evict_mutex.lock();
        self.set_state(MappingState::Zombie);
        for progress in (0..self.length).step_by(PAGE_SIZE) {
            let status = owner.ops().unmap_single_page(self.address() + progress);
            if !status.contains(PageStatus::PRESENT) {
                continue;
            }
            if status.contains(PageStatus::DIRTY) && !self.is_chain_private(progress) {
                self.view.mark_dirty(self.view_offset + progress, PAGE_SIZE);
            }
            owner.sub_rss(PAGE_SIZE);
        }
    }

    /// Unmap resident pages but keep the mapping active
    ///
    /// Fork downgrade for CoW branches: the next access refaults through
    /// the chain.
    fn uninstall_for_fork(&self) {
        assert_eq!(self.state(), MappingState::Active);
        let owner = self.owner().expect("downgrading an untied mapping");

        let _evict = self.evict_mutex.lock();
        for progress in (0..self.length).step_by(PAGE_SIZE) {
            let status = owner.ops().unmap_single_page(self.address() + progress);
            if !status.contains(PageStatus::PRESENT) {
                continue;
            }
            if status.contains(PageStatus::DIRTY) && !self.is_chain_private(progress) {
                self.view.mark_dirty(self.view_offset + progress, PAGE_SIZE);
            }
            owner.sub_rss(PAGE_SIZE);
        }
    }

    /// Zombie to retired transition; detaches from the view
    fn retire(&self) {
        assert_eq!(self.state(), MappingState::Zombie);
        let this = self.self_ref.upgrade().expect("retiring a dead mapping");
        self.view.remove_observer(&this);
        self.set_state(MappingState::Retired);
    }

    /// Lock the backing range of `[offset, offset + size)`
    pub fn lock_virtual_range(&self, offset: usize, size: usize, node: LockRangeNode) {
        self.view.lock_range(self.view_offset + offset, size, node);
    }

    /// Release the backing range of `[offset, offset + size)`
    pub fn unlock_virtual_range(&self, offset: usize, size: usize) {
        self.view.unlock_range(self.view_offset + offset, size);
    }

    /// Install the page-table entry resolved for one page
    ///
    /// Tolerates a concurrent resolver having installed the page already;
    /// such touches are idempotent and reported as spurious.
    fn install_page(
        &self,
        offset: usize,
        pa: PAddr,
        caching: CachingMode,
        force_readonly: bool,
    ) -> Result<TouchOutcome> {
        let owner = self.owner().ok_or(Error::Fault)?;
        let _evict = self.evict_mutex.lock();
        if self.state() != MappingState::Active {
            return Err(Error::Fault);
        }
        let va = self.address() + offset;
        let mut flags = self.page_flags();
        if force_readonly {
            flags.remove(PageFlags::WRITE);
        }
        let status = owner.ops().unmap_single_page(va);
        let spurious = status.contains(PageStatus::PRESENT);
        if spurious && status.contains(PageStatus::DIRTY) && !self.is_chain_private(offset) {
            self.view.mark_dirty(self.view_offset + offset, PAGE_SIZE);
        }
        owner.ops().map_single_page(va, pa, flags, caching);
        if !spurious {
            owner.add_rss(PAGE_SIZE);
        }
        Ok(TouchOutcome { spurious })
    }

    /// Bring one page in and install it
    ///
    /// `offset` is mapping-relative and page-aligned. `want_write` selects
    /// the CoW write path that materializes a private page.
    pub fn touch_page(self: &Arc<Self>, offset: usize, want_write: bool, node: TouchNode) {
        assert!(is_page_aligned(offset) && offset < self.length);
        if self.state() != MappingState::Active {
            node.complete(Err(Error::Fault));
            return;
        }
        let chain = self.chain.lock().clone();
        match chain {
            Some(chain) => self.touch_chain_page(chain, offset, want_write, node),
            None => self.touch_view_page(offset, want_write, node),
        }
    }

    fn touch_view_page(self: &Arc<Self>, offset: usize, want_write: bool, node: TouchNode) {
        let queue = node.queue();
        let this = self.clone();
        let view_offset = self.view_offset + offset;
        let fetch_flags = if self.flags().contains(MappingFlags::DONT_REQUIRE_BACKING) {
            FetchFlags::DISALLOW_BACKING
        } else {
            FetchFlags::empty()
        };
        if fetch_flags.contains(FetchFlags::DISALLOW_BACKING)
            && !self.view.peek_range(view_offset).is_resident()
        {
            // Locking the range would ask the pager to populate it, which
            // is exactly what this mapping opts out of. Reads observe the
            // zero frame; writes stay unresolved.
            let outcome = if want_write {
                Err(Error::NoBacking)
            } else {
                match self.owner() {
                    Some(owner) => {
                        let zero = owner.provider().zero_frame();
                        self.install_page(offset, zero, CachingMode::WriteBack, true)
                    }
                    None => Err(Error::Fault),
                }
            };
            node.complete(outcome);
            return;
        }
        self.view.lock_range(
            view_offset,
            PAGE_SIZE,
            LockRangeNode::new(&queue.clone(), move |result| {
                if let Err(error) = result {
                    node.complete(Err(error));
                    return;
                }
                let locked = this.clone();
                this.view.fetch_range(
                    view_offset,
                    fetch_flags,
                    FetchRangeNode::new(&queue, move |result| {
                        let outcome = match result {
                            Ok(range) => {
                                locked.install_page(offset, range.addr, range.caching, false)
                            }
                            Err(Error::NoBacking) if !want_write => {
                                // Reads of an unbacked page observe zeros.
                                match locked.owner() {
                                    Some(owner) => {
                                        let zero = owner.provider().zero_frame();
                                        locked.install_page(
                                            offset,
                                            zero,
                                            CachingMode::WriteBack,
                                            true,
                                        )
                                    }
                                    None => Err(Error::Fault),
                                }
                            }
                            Err(error) => Err(error),
                        };
                        locked.view.unlock_range(view_offset, PAGE_SIZE);
                        node.complete(outcome);
                    }),
                );
            }),
        );
    }

    fn touch_chain_page(
        self: &Arc<Self>,
        chain: Arc<CowChain>,
        offset: usize,
        want_write: bool,
        node: TouchNode,
    ) {
        if want_write {
            // A page already private to this branch is directly writable.
            if let Some(frame) = chain.lookup_local(offset) {
                node.complete(self.install_page(offset, frame, CachingMode::WriteBack, false));
                return;
            }
            // A page shared further down the chain is stolen or copied.
            if let Some(source) = chain.resolve_super(offset) {
                let outcome = match chain.make_private(offset, source) {
                    Some(frame) => {
                        self.install_page(offset, frame, CachingMode::WriteBack, false)
                    }
                    None => Err(Error::NoMemory),
                };
                node.complete(outcome);
                return;
            }
            // The chain misses entirely; the copy source is the view page.
            let queue = node.queue();
            let this = self.clone();
            let view_offset = self.view_offset + offset;
            self.view.lock_range(
                view_offset,
                PAGE_SIZE,
                LockRangeNode::new(&queue.clone(), move |result| {
                    if let Err(error) = result {
                        node.complete(Err(error));
                        return;
                    }
                    let locked = this.clone();
                    let chain = chain.clone();
                    this.view.fetch_range(
                        view_offset,
                        FetchFlags::empty(),
                        FetchRangeNode::new(&queue, move |result| {
                            let outcome = match result {
                                Ok(range) => match chain.make_private(offset, range.addr) {
                                    Some(frame) => locked.install_page(
                                        offset,
                                        frame,
                                        CachingMode::WriteBack,
                                        false,
                                    ),
                                    None => Err(Error::NoMemory),
                                },
                                Err(error) => Err(error),
                            };
                            locked.view.unlock_range(view_offset, PAGE_SIZE);
                            node.complete(outcome);
                        }),
                    );
                }),
            );
        } else {
            // Reads resolve through the chain without copying. A private
            // page may be mapped writable; shared pages stay read-only.
            if let Some(frame) = chain.lookup_local(offset) {
                node.complete(self.install_page(offset, frame, CachingMode::WriteBack, false));
                return;
            }
            if let Some(frame) = chain.resolve_super(offset) {
                node.complete(self.install_page(offset, frame, CachingMode::WriteBack, true));
                return;
            }
            let queue = node.queue();
            let this = self.clone();
            let view_offset = self.view_offset + offset;
            self.view.lock_range(
                view_offset,
                PAGE_SIZE,
                LockRangeNode::new(&queue.clone(), move |result| {
                    if let Err(error) = result {
                        node.complete(Err(error));
                        return;
                    }
                    let locked = this.clone();
                    this.view.fetch_range(
                        view_offset,
                        FetchFlags::empty(),
                        FetchRangeNode::new(&queue, move |result| {
                            let outcome = match result {
                                Ok(range) => locked.install_page(
                                    offset,
                                    range.addr,
                                    range.caching,
                                    true,
                                ),
                                Err(error) => Err(error),
                            };
                            locked.view.unlock_range(view_offset, PAGE_SIZE);
                            node.complete(outcome);
                        }),
                    );
                }),
            );
        }
    }

    /// Touch every page of `[offset, offset + size)` in order
    pub fn populate_range(self: &Arc<Self>, offset: usize, size: usize, node: AcquireNode) {
        assert!(is_page_aligned(offset) && is_page_aligned(size));
        if size == 0 {
            node.complete(Ok(()));
            return;
        }
        let queue = node.queue();
        let this = self.clone();
        self.touch_page(
            offset,
            false,
            TouchNode::new(&queue, move |result| match result {
                Ok(_) => this.populate_range(offset + PAGE_SIZE, size - PAGE_SIZE, node),
                Err(error) => node.complete(Err(error)),
            }),
        );
    }

    /// The view is about to release frames of `[offset, offset + length)`
    ///
    /// Unmaps the intersecting pages and holds the evict node until the
    /// shootdown acknowledges; the view must not free a frame earlier.
    pub fn observe_eviction(self: &Arc<Self>, offset: usize, length: usize, node: &Arc<EvictNode>) {
        if self.state() != MappingState::Active {
            return;
        }
        if offset + length <= self.view_offset || offset >= self.view_offset + self.length {
            return;
        }
        let shoot_begin = offset.max(self.view_offset);
        let shoot_end = (offset + length).min(self.view_offset + self.length);
        let shoot_offset = shoot_begin - self.view_offset;
        let shoot_size = shoot_end - shoot_begin;
        assert!(shoot_size > 0);
        assert!(is_page_aligned(shoot_offset) && is_page_aligned(shoot_size));

        let owner = match self.owner() {
            Some(owner) => owner,
            None => return,
        };
        {
            let _evict = self.evict_mutex.lock();
            for progress in (0..shoot_size).step_by(PAGE_SIZE) {
                let mapping_offset = shoot_offset + progress;
                let status = owner
                    .ops()
                    .unmap_single_page(self.address() + mapping_offset);
                if !status.contains(PageStatus::PRESENT) {
                    continue;
                }
                if status.contains(PageStatus::DIRTY) && !self.is_chain_private(mapping_offset) {
                    self.view
                        .mark_dirty(self.view_offset + mapping_offset, PAGE_SIZE);
                }
                owner.sub_rss(PAGE_SIZE);
            }
        }

        node.retain();
        let node = node.clone();
        let mapping = self.clone();
        let queue = node.queue().clone();
        owner.ops().submit_shootdown(ShootNode::new(
            self.address() + shoot_offset,
            shoot_size,
            Completion::new(&queue, move |()| {
                // The mapping stays alive until the remote CPUs are done.
                let _keep = &mapping;
                node.done();
            }),
        ));
    }
}

// ============================================================================
// Virtual Space
// ============================================================================

struct SpaceInner {
    holes: HoleTree,
    mappings: BTreeMap<VAddr, Arc<Mapping>>,
}

/// Layout and fault handling for one address space
pub struct VirtualSpace {
    ops: Arc<dyn VirtualOperations>,
    provider: Arc<dyn FrameProvider>,
    range: (VAddr, VAddr),
    inner: Mutex<SpaceInner>,
    rss: AtomicUsize,
    self_ref: Weak<VirtualSpace>,
}

impl VirtualSpace {
    /// Space managing the default user range
    pub fn new(ops: Arc<dyn VirtualOperations>, provider: Arc<dyn FrameProvider>) -> Arc<Self> {
        Self::with_range(ops, provider, USER_LOWER, USER_UPPER)
    }

    /// Space managing `[lower, upper)`
    pub fn with_range(
        ops: Arc<dyn VirtualOperations>,
        provider: Arc<dyn FrameProvider>,
        lower: VAddr,
        upper: VAddr,
    ) -> Arc<Self> {
        assert!(is_page_aligned(lower) && is_page_aligned(upper) && lower < upper);
        Arc::new_cyclic(|self_ref| Self {
            ops,
            provider,
            range: (lower, upper),
            inner: Mutex::new(SpaceInner {
                holes: HoleTree::with_range(lower, upper - lower),
                mappings: BTreeMap::new(),
            }),
            rss: AtomicUsize::new(0),
            self_ref: self_ref.clone(),
        })
    }

    pub fn ops(&self) -> &Arc<dyn VirtualOperations> {
        &self.ops
    }

    pub fn provider(&self) -> &Arc<dyn FrameProvider> {
        &self.provider
    }

    /// Bounds of the managed range
    pub fn managed_range(&self) -> (VAddr, VAddr) {
        self.range
    }

    /// Resident set size in bytes
    pub fn rss(&self) -> usize {
        self.rss.load(Ordering::Relaxed)
    }

    fn add_rss(&self, delta: usize) {
        let total = self.rss.fetch_add(delta, Ordering::Relaxed) + delta;
        let pages = total / PAGE_SIZE;
        if pages >= 2 && pages.is_power_of_two() {
            debug!("vm: rss rises above {} KiB", total / 1024);
        }
    }

    fn sub_rss(&self, delta: usize) {
        let prior = self.rss.fetch_sub(delta, Ordering::Relaxed);
        assert!(prior >= delta, "rss underflow");
    }

    fn arc(&self) -> Arc<VirtualSpace> {
        self.self_ref.upgrade().expect("space vanished")
    }

    fn find_mapping(inner: &SpaceInner, address: VAddr) -> Option<Arc<Mapping>> {
        let (_, mapping) = inner.mappings.range(..=address).next_back()?;
        (address < mapping.address() + mapping.length()).then(|| mapping.clone())
    }

    /// The mapping covering `address`, if any
    pub fn get_mapping(&self, address: VAddr) -> Option<Arc<Mapping>> {
        Self::find_mapping(&self.inner.lock(), address)
    }

    /// Map `length` bytes of `slice` starting at `offset`
    ///
    /// `address` is required for fixed placement and ignored otherwise.
    /// Returns the chosen virtual address; already-resident view pages are
    /// installed eagerly, the rest fault in on demand.
    pub fn map(
        &self,
        slice: Arc<MemorySlice>,
        address: Option<VAddr>,
        offset: usize,
        length: usize,
        flags: MapFlags,
    ) -> Result<VAddr> {
        if length == 0 || !is_page_aligned(length) || !is_page_aligned(offset) {
            return Err(Error::IllegalArgs);
        }
        if offset.checked_add(length).map_or(true, |end| end > slice.length()) {
            return Err(Error::BufferTooSmall);
        }
        let mapping_flags = compile_map_flags(flags);
        if !mapping_flags.contains(MappingFlags::PROT_READ) {
            // Inaccessible mappings are not supported.
            return Err(Error::IllegalArgs);
        }

        let mut inner = self.inner.lock();
        let target = if flags.contains(MapFlags::FIXED) {
            let address = address.ok_or(Error::IllegalArgs)?;
            if !is_page_aligned(address) {
                return Err(Error::IllegalArgs);
            }
            inner.holes.allocate_at(address, length)?
        } else {
            let strategy = if flags.contains(MapFlags::PREFER_BOTTOM) {
                AllocationStrategy::Bottom
            } else {
                AllocationStrategy::Top
            };
            inner
                .holes
                .allocate(length, strategy)
                .ok_or(Error::NoMemory)?
        };

        let view_offset = slice.offset() + offset;
        let mapping = Mapping::new(length, mapping_flags, slice, view_offset);
        mapping.tie(&self.arc(), target);
        inner.mappings.insert(target, mapping.clone());
        mapping.install();
        Ok(target)
    }

    /// Change the protection of the mapping covering exactly
    /// `[address, address + length)`
    ///
    /// Every resident page is eagerly remapped with the new flags; the
    /// completion posts once the shootdown for the range acknowledged.
    pub fn protect(
        &self,
        address: VAddr,
        length: usize,
        flags: MapFlags,
        completion: Completion<Result>,
    ) {
        let mapping = {
            let inner = self.inner.lock();
            let mapping = match Self::find_mapping(&inner, address) {
                Some(mapping)
                    if mapping.address() == address && mapping.length() == length =>
                {
                    mapping
                }
                _ => {
                    drop(inner);
                    completion.post(Err(Error::IllegalArgs));
                    return;
                }
            };
            mapping.set_protection(compile_map_flags(flags));
            mapping.reinstall();
            mapping
        };

        let queue = completion.queue().clone();
        self.ops.submit_shootdown(ShootNode::new(
            address,
            length,
            Completion::new(&queue, move |()| {
                let _keep = &mapping;
                completion.post(Ok(()));
            }),
        ));
    }

    /// Unmap the mapping covering exactly `[address, address + length)`
    ///
    /// The mapping turns zombie immediately; the hole reappears and the
    /// mapping retires only after the shootdown acknowledged, because
    /// remote CPUs may still be touching it.
    pub fn unmap(&self, address: VAddr, length: usize, completion: Completion<Result>) {
        let mapping = {
            let inner = self.inner.lock();
            let mapping = match Self::find_mapping(&inner, address) {
                Some(mapping)
                    if mapping.address() == address && mapping.length() == length =>
                {
                    mapping
                }
                _ => {
                    drop(inner);
                    completion.post(Err(Error::IllegalArgs));
                    return;
                }
            };
            mapping.uninstall();
            mapping
        };

        let this = self.arc();
        let queue = completion.queue().clone();
        self.ops.submit_shootdown(ShootNode::new(
            address,
            length,
            Completion::new(&queue, move |()| {
                {
                    let mut inner = this.inner.lock();
                    inner.mappings.remove(&address);
                    inner.holes.release(address, length);
                }
                mapping.retire();
                completion.post(Ok(()));
            }),
        ));
    }

    /// Resolve a fault at `address`
    ///
    /// Completes with `resolved = false` when no mapping covers the address
    /// or the access kind is not permitted; the caller delivers the user
    /// fault. Spurious faults are tolerated and reported.
    pub fn handle_fault(&self, address: VAddr, flags: FaultFlags, node: FaultNode) {
        let mapping = {
            let inner = self.inner.lock();
            match Self::find_mapping(&inner, address) {
                Some(mapping) => mapping,
                None => {
                    drop(inner);
                    node.complete(FaultOutcome::unresolved());
                    return;
                }
            }
        };
        let mapping_flags = mapping.flags();
        if flags.contains(FaultFlags::WRITE) && !mapping_flags.contains(MappingFlags::PROT_WRITE)
        {
            node.complete(FaultOutcome::unresolved());
            return;
        }
        if flags.contains(FaultFlags::EXECUTE)
            && !mapping_flags.contains(MappingFlags::PROT_EXECUTE)
        {
            node.complete(FaultOutcome::unresolved());
            return;
        }

        let fault_offset = page_align_down(address - mapping.address());
        let want_write = flags.contains(FaultFlags::WRITE);
        let queue = node.queue();
        mapping.touch_page(
            fault_offset,
            want_write,
            TouchNode::new(&queue, move |result| match result {
                Ok(outcome) => {
                    if outcome.spurious {
                        debug!("vm: spurious page fault");
                    }
                    node.complete(FaultOutcome {
                        resolved: true,
                        spurious: outcome.spurious,
                    });
                }
                Err(_) => node.complete(FaultOutcome::unresolved()),
            }),
        );
    }

    /// Fork this space into a new one driven by `child_ops`
    ///
    /// Honors each mapping's fork disposition. CoW branches share the
    /// parent's chain below fresh top nodes; the parent's resident pages
    /// are unmapped so both branches refault through the chain. The
    /// completion posts once every downgrade shootdown acknowledged.
    pub fn fork(
        &self,
        child_ops: Arc<dyn VirtualOperations>,
        completion: Completion<Result<Arc<VirtualSpace>>>,
    ) {
        let child = VirtualSpace::with_range(
            child_ops,
            self.provider.clone(),
            self.range.0,
            self.range.1,
        );
        let mut downgraded: Vec<(VAddr, usize)> = Vec::new();
        {
            let inner = self.inner.lock();
            for (&address, mapping) in inner.mappings.iter() {
                if mapping.state() != MappingState::Active {
                    continue;
                }
                let flags = mapping.flags();
                if flags.contains(MappingFlags::DROP_AT_FORK) {
                    continue;
                }
                let branch = Mapping::new(
                    mapping.length(),
                    flags,
                    mapping.slice().clone(),
                    mapping.view_offset(),
                );
                if flags.contains(MappingFlags::COPY_ON_WRITE_AT_FORK) {
                    // Downgrade before restructuring the chain so dirty
                    // propagation still sees the pre-fork layout.
                    mapping.uninstall_for_fork();
                    downgraded.push((address, mapping.length()));

                    let frozen = match mapping.chain.lock().take() {
                        Some(chain) => chain,
                        None => CowChain::new(self.provider.clone(), None),
                    };
                    mapping.set_chain(Some(CowChain::new(
                        self.provider.clone(),
                        Some(frozen.clone()),
                    )));
                    branch.set_chain(Some(CowChain::new(self.provider.clone(), Some(frozen))));
                } else {
                    // Shared branches see the same pages, including any
                    // overrides an earlier fork left in the chain.
                    branch.set_chain(mapping.chain.lock().clone());
                }
                child
                    .adopt_mapping(address, branch)
                    .expect("fresh space rejects parent layout");
            }
        }

        if downgraded.is_empty() {
            completion.post(Ok(child));
            return;
        }
        let queue = completion.queue().clone();
        let remaining = Arc::new(AtomicUsize::new(downgraded.len()));
        let slot = Arc::new(Mutex::new(Some((completion, child))));
        for (address, length) in downgraded {
            let remaining = remaining.clone();
            let slot = slot.clone();
            self.ops.submit_shootdown(ShootNode::new(
                address,
                length,
                Completion::new(&queue, move |()| {
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        let (completion, child) =
                            slot.lock().take().expect("fork completed twice");
                        completion.post(Ok(child));
                    }
                }),
            ));
        }
    }

    fn adopt_mapping(self: &Arc<Self>, address: VAddr, mapping: Arc<Mapping>) -> Result {
        let mut inner = self.inner.lock();
        inner.holes.allocate_at(address, mapping.length())?;
        mapping.tie(self, address);
        inner.mappings.insert(address, mapping.clone());
        mapping.install();
        Ok(())
    }

    /// Tear the space down
    ///
    /// Uninstalls every mapping, retires the page table and completes once
    /// the table is gone; pending touches observe the zombie state and fail
    /// with `Fault`.
    pub fn retire(&self, completion: Completion<Result>) {
        {
            let inner = self.inner.lock();
            for mapping in inner.mappings.values() {
                if mapping.state() == MappingState::Active {
                    mapping.uninstall();
                }
            }
        }
        let this = self.arc();
        let queue = completion.queue().clone();
        self.ops.retire(RetireNode::new(Completion::new(
            &queue,
            move |()| {
                let mappings = {
                    let mut inner = this.inner.lock();
                    core::mem::take(&mut inner.mappings)
                };
                for mapping in mappings.values() {
                    if mapping.state() == MappingState::Zombie {
                        mapping.retire();
                    }
                }
                completion.post(Ok(()));
            },
        )));
    }

    /// Snapshot of the hole layout, for diagnostics
    pub fn hole_ranges(&self) -> Vec<(VAddr, usize)> {
        self.inner.lock().holes.ranges()
    }

    /// Snapshot of the mapping layout, for diagnostics
    pub fn mapping_ranges(&self) -> Vec<(VAddr, usize)> {
        self.inner
            .lock()
            .mappings
            .values()
            .map(|m| (m.address(), m.length()))
            .collect()
    }
}

// ============================================================================
// Address Space
// ============================================================================

/// A virtual space bundled with its software page table
///
/// The kernel proper supplies per-architecture operations instead; hosted
/// builds and the syscall layer use this bundle.
pub struct AddressSpace {
    space: Arc<VirtualSpace>,
    table: Arc<SoftPageTable>,
}

impl AddressSpace {
    pub fn create(provider: Arc<dyn FrameProvider>) -> Arc<Self> {
        let table = Arc::new(SoftPageTable::new());
        let space = VirtualSpace::new(table.clone(), provider);
        Arc::new(Self { space, table })
    }

    pub fn space(&self) -> &Arc<VirtualSpace> {
        &self.space
    }

    pub fn table(&self) -> &Arc<SoftPageTable> {
        &self.table
    }

    /// Fork into a new bundle with a fresh software table
    pub fn fork(&self, completion: Completion<Result<Arc<AddressSpace>>>) {
        let table = Arc::new(SoftPageTable::new());
        let ops: Arc<dyn VirtualOperations> = table.clone();
        let queue = completion.queue().clone();
        self.space.fork(
            ops,
            Completion::new(&queue, move |result: Result<Arc<VirtualSpace>>| {
                completion.post(result.map(|space| Arc::new(AddressSpace { space, table })));
            }),
        );
    }
}

// ============================================================================
// Space Lock Handle
// ============================================================================

/// Locked, populated window into a space for kernel-side access
///
/// Drivers acquire the handle, then resolve physical addresses or copy
/// bytes through the direct map. Translations are only stable while the
/// handle stays acquired.
pub struct SpaceLockHandle {
    mapping: Arc<Mapping>,
    provider: Arc<dyn FrameProvider>,
    address: VAddr,
    length: usize,
    lock_offset: usize,
    lock_size: usize,
    active: AtomicBool,
}

impl SpaceLockHandle {
    pub fn new(space: &Arc<VirtualSpace>, address: VAddr, length: usize) -> Result<Arc<Self>> {
        assert!(length > 0);
        let mapping = space.get_mapping(address).ok_or(Error::Fault)?;
        if address
            .checked_add(length)
            .map_or(true, |end| end > mapping.address() + mapping.length())
        {
            return Err(Error::IllegalArgs);
        }
        let misalign = address & PAGE_MASK;
        let lock_offset = page_align_down(address - mapping.address());
        let lock_size = page_align_up(length + misalign);
        Ok(Arc::new(Self {
            mapping,
            provider: space.provider().clone(),
            address,
            length,
            lock_offset,
            lock_size,
            active: AtomicBool::new(false),
        }))
    }

    /// Lock and populate the window
    pub fn acquire(self: &Arc<Self>, node: AcquireNode) {
        let queue = node.queue();
        let this = self.clone();
        self.mapping.lock_virtual_range(
            self.lock_offset,
            self.lock_size,
            LockRangeNode::new(&queue.clone(), move |result| {
                if let Err(error) = result {
                    node.complete(Err(error));
                    return;
                }
                let locked = this.clone();
                this.mapping.populate_range(
                    this.lock_offset,
                    this.lock_size,
                    AcquireNode::new(&queue, move |result| {
                        if result.is_ok() {
                            locked.active.store(true, Ordering::Release);
                        } else {
                            locked
                                .mapping
                                .unlock_virtual_range(locked.lock_offset, locked.lock_size);
                        }
                        node.complete(result);
                    }),
                );
            }),
        );
    }

    /// Resolve `offset` within the window to a physical address
    pub fn get_physical(&self, offset: usize) -> Option<PAddr> {
        assert!(self.active.load(Ordering::Acquire));
        assert!(offset < self.length);
        let va = self.address + offset;
        let page = page_align_down(va - self.mapping.address());
        let range = self.mapping.resolve_present(page)?;
        Some(range.addr + (va & PAGE_MASK) as PAddr)
    }

    /// Copy bytes out of the window
    pub fn load(&self, offset: usize, buffer: &mut [u8]) {
        assert!(self.active.load(Ordering::Acquire));
        assert!(offset + buffer.len() <= self.length);
        let mut progress = 0;
        while progress < buffer.len() {
            let va = self.address + offset + progress;
            let misalign = va & PAGE_MASK;
            let chunk = (PAGE_SIZE - misalign).min(buffer.len() - progress);
            let page = page_align_down(va - self.mapping.address());
            let range = self
                .mapping
                .resolve_present(page)
                .expect("populated page vanished");
            let accessor = PageAccessor::new(&*self.provider, range.addr);
            buffer[progress..progress + chunk]
                .copy_from_slice(&accessor.as_slice()[misalign..misalign + chunk]);
            progress += chunk;
        }
    }

    /// Copy bytes into the window
    pub fn write(&self, offset: usize, buffer: &[u8]) -> Result {
        assert!(self.active.load(Ordering::Acquire));
        if offset + buffer.len() > self.length {
            return Err(Error::IllegalArgs);
        }
        let mut progress = 0;
        while progress < buffer.len() {
            let va = self.address + offset + progress;
            let misalign = va & PAGE_MASK;
            let chunk = (PAGE_SIZE - misalign).min(buffer.len() - progress);
            let page = page_align_down(va - self.mapping.address());
            let range = self
                .mapping
                .resolve_present(page)
                .ok_or(Error::Fault)?;
            let mut accessor = PageAccessor::new(&*self.provider, range.addr);
            accessor.as_mut_slice()[misalign..misalign + chunk]
                .copy_from_slice(&buffer[progress..progress + chunk]);
            progress += chunk;
        }
        Ok(())
    }
}

impl Drop for SpaceLockHandle {
    fn drop(&mut self) {
        if self.active.load(Ordering::Acquire) {
            self.mapping
                .unlock_virtual_range(self.lock_offset, self.lock_size);
        }
    }
}
