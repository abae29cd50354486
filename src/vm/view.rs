// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Memory Views and Slices
//!
//! A memory view is the page container of the kernel: it owns the physical
//! frames backing a logical, page-aligned region and hands out their
//! addresses to mappings. Views never know where they are mapped; mappings
//! register as observers and are notified before any page changes frame.
//!
//! # Design
//!
//! - **Allocated**: frames come from the physical allocator on first fetch,
//!   optionally as one contiguous chunk
//! - **Hardware**: a fixed physical range (device BARs) with an explicit
//!   caching mode
//! - **Mirrored**: identity window over physical memory for kernel use
//! - **Managed**: the cache-pager pair lives in [`crate::vm::managed`]
//!
//! Observers hold the view strongly; the view holds its observers weakly
//! and prunes expired references whenever it walks the list.

use crate::errors::{Error, Result};
use crate::sync::Completion;
use crate::types::{PAddr, INVALID_PADDR};
use crate::vm::aspace::Mapping;
use crate::vm::layout::{is_page_aligned, CachingMode, PAGE_SIZE};
use crate::vm::managed::ManageNode;
use crate::vm::pmm::{FrameProvider, PageAccessor};
use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::Mutex;

/// Result of peeking or fetching one page of a view
#[derive(Debug, Clone, Copy)]
pub struct PhysicalRange {
    /// Frame address, or [`INVALID_PADDR`] if the page is not resident
    pub addr: PAddr,
    /// Length of the resolved range
    pub length: usize,
    /// Caching mode to install with the page
    pub caching: CachingMode,
}

impl PhysicalRange {
    pub fn absent() -> Self {
        Self {
            addr: INVALID_PADDR,
            length: PAGE_SIZE,
            caching: CachingMode::WriteBack,
        }
    }

    pub fn is_resident(&self) -> bool {
        self.addr != INVALID_PADDR
    }
}

bitflags! {
    /// Flags accepted by `fetch_range`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FetchFlags: u32 {
        /// Fail with `NoBacking` instead of asking the pager to populate a
        /// missing page
        const DISALLOW_BACKING = 1 << 0;
    }
}

/// Pending `lock_range` request
pub struct LockRangeNode {
    completion: Completion<Result>,
}

impl LockRangeNode {
    pub fn new(
        queue: &Arc<crate::sync::WorkQueue>,
        func: impl FnOnce(Result) + Send + 'static,
    ) -> Self {
        Self {
            completion: Completion::new(queue, func),
        }
    }

    pub fn queue(&self) -> Arc<crate::sync::WorkQueue> {
        self.completion.queue().clone()
    }

    pub fn complete(self, result: Result) {
        self.completion.post(result);
    }
}

/// Pending `fetch_range` request
pub struct FetchRangeNode {
    completion: Completion<Result<PhysicalRange>>,
}

impl FetchRangeNode {
    pub fn new(
        queue: &Arc<crate::sync::WorkQueue>,
        func: impl FnOnce(Result<PhysicalRange>) + Send + 'static,
    ) -> Self {
        Self {
            completion: Completion::new(queue, func),
        }
    }

    pub fn queue(&self) -> Arc<crate::sync::WorkQueue> {
        self.completion.queue().clone()
    }

    pub fn complete(self, result: Result<PhysicalRange>) {
        self.completion.post(result);
    }
}

/// The page-container interface
pub trait MemoryView: Send + Sync {
    /// Length of the view in bytes (a multiple of the page size)
    fn length(&self) -> usize;

    /// Non-blocking residency probe for the page at `offset`
    ///
    /// Returns an absent range for pages that are not currently resident.
    fn peek_range(&self, offset: usize) -> PhysicalRange;

    /// Pin `[offset, offset + size)` so that `peek_range` keeps returning
    /// the same frames until the matching `unlock_range`
    ///
    /// For managed views this moves missing pages to `loading` and resolves
    /// once every page is present.
    fn lock_range(&self, offset: usize, size: usize, node: LockRangeNode);

    /// Release a pin taken by `lock_range`
    fn unlock_range(&self, offset: usize, size: usize);

    /// Ensure the page at `offset` is present and return it
    fn fetch_range(&self, offset: usize, flags: FetchFlags, node: FetchRangeNode);

    /// An observer witnessed a write to the given range
    fn mark_dirty(&self, offset: usize, size: usize);

    /// Register a mapping to be notified before pages change frame
    fn add_observer(&self, observer: Weak<Mapping>);

    /// Remove a previously registered mapping
    fn remove_observer(&self, observer: &Arc<Mapping>);

    /// Grow or shrink the view
    ///
    /// Only allocated views support this; shrinking evicts the cut-off tail
    /// through the observer protocol before any frame is freed. `queue`
    /// dispatches the observer shootdown completions.
    fn resize(&self, _new_size: usize, _queue: &Arc<crate::sync::WorkQueue>) -> Result {
        Err(Error::NotSupported)
    }

    /// Park a pager request slot on the view (managed views only)
    fn submit_manage(&self, node: ManageNode) {
        node.complete(Err(Error::NotSupported));
    }

    /// Resolve an outstanding initialize or writeback (managed views only)
    fn complete_load(&self, _offset: usize, _size: usize) -> Result {
        Err(Error::NotSupported)
    }

    /// Hint that `[offset, offset + size)` will be accessed soon
    ///
    /// Managed views start populating the range without a waiter; allocated
    /// views pre-allocate frames. Never suspends.
    fn load_ahead(&self, offset: usize, size: usize) -> Result {
        check_range(offset, size, self.length())
    }
}

impl core::fmt::Debug for dyn MemoryView {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("dyn MemoryView")
    }
}

pub(crate) fn check_range(offset: usize, size: usize, length: usize) -> Result {
    if !is_page_aligned(offset) || !is_page_aligned(size) {
        return Err(Error::IllegalArgs);
    }
    match offset.checked_add(size) {
        Some(end) if end <= length => Ok(()),
        _ => Err(Error::IllegalArgs),
    }
}

// ============================================================================
// Eviction fan-out
// ============================================================================

/// Join node for one eviction announcement
///
/// Every observing mapping that has to unmap pages retains the node and
/// calls `done` once its shootdown acknowledges; the view's continuation
/// runs after the last observer. The continuation is invoked directly from
/// the final `done`, which already executes on a work-queue drain.
pub struct EvictNode {
    pending: core::sync::atomic::AtomicUsize,
    queue: Arc<crate::sync::WorkQueue>,
    on_done: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl EvictNode {
    pub fn new(
        queue: &Arc<crate::sync::WorkQueue>,
        on_done: impl FnOnce() + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            pending: core::sync::atomic::AtomicUsize::new(1),
            queue: queue.clone(),
            on_done: Mutex::new(Some(Box::new(on_done))),
        })
    }

    /// The queue observer shootdowns complete through
    pub fn queue(&self) -> &Arc<crate::sync::WorkQueue> {
        &self.queue
    }

    /// Account for one more outstanding observer
    pub fn retain(&self) {
        self.pending
            .fetch_add(1, core::sync::atomic::Ordering::AcqRel);
    }

    /// Drop one outstanding reference; the last one fires the continuation
    pub fn done(&self) {
        if self
            .pending
            .fetch_sub(1, core::sync::atomic::Ordering::AcqRel)
            == 1
        {
            let on_done = self.on_done.lock().take().expect("evict node fired twice");
            on_done();
        }
    }
}

/// Weak back-references from a view to its observing mappings
pub(crate) struct ObserverList {
    observers: Mutex<Vec<Weak<Mapping>>>,
}

impl ObserverList {
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, observer: Weak<Mapping>) {
        self.observers.lock().push(observer);
    }

    pub fn remove(&self, observer: &Arc<Mapping>) {
        let target = Arc::downgrade(observer);
        self.observers.lock().retain(|w| !w.ptr_eq(&target));
    }

    /// Upgrade all live observers, pruning expired ones
    pub fn collect(&self) -> Vec<Arc<Mapping>> {
        let mut observers = self.observers.lock();
        observers.retain(|w| w.strong_count() > 0);
        observers.iter().filter_map(|w| w.upgrade()).collect()
    }

    /// Announce that `[offset, offset + size)` of the view is going away
    ///
    /// `on_done` runs after every observer has unmapped the range and its
    /// shootdown has acknowledged; only then may the caller free frames.
    pub fn begin_evict(
        &self,
        queue: &Arc<crate::sync::WorkQueue>,
        offset: usize,
        size: usize,
        on_done: impl FnOnce() + Send + 'static,
    ) {
        let node = EvictNode::new(queue, on_done);
        for mapping in self.collect() {
            mapping.observe_eviction(offset, size, &node);
        }
        node.done();
    }
}

// ============================================================================
// Memory Slice
// ============================================================================

/// A window into a view; the transferable unit of mapping
pub struct MemorySlice {
    view: Arc<dyn MemoryView>,
    view_offset: usize,
    length: usize,
}

impl MemorySlice {
    /// Build a slice of `view` covering `[view_offset, view_offset + length)`
    pub fn new(view: Arc<dyn MemoryView>, view_offset: usize, length: usize) -> Result<Arc<Self>> {
        check_range(view_offset, length, view.length())?;
        Ok(Arc::new(Self {
            view,
            view_offset,
            length,
        }))
    }

    /// Slice covering the whole of `view`
    pub fn covering(view: Arc<dyn MemoryView>) -> Arc<Self> {
        let length = view.length();
        Arc::new(Self {
            view,
            view_offset: 0,
            length,
        })
    }

    pub fn view(&self) -> &Arc<dyn MemoryView> {
        &self.view
    }

    pub fn offset(&self) -> usize {
        self.view_offset
    }

    pub fn length(&self) -> usize {
        self.length
    }
}

// ============================================================================
// Allocated Memory
// ============================================================================

struct AllocatedInner {
    pages: Vec<PAddr>,
    length: usize,
}

/// View whose frames come from the physical allocator on demand
pub struct AllocatedMemory {
    provider: Arc<dyn FrameProvider>,
    inner: Mutex<AllocatedInner>,
    observers: ObserverList,
    // Order of the single chunk backing a contiguous view.
    contiguous_order: Option<u32>,
}

impl AllocatedMemory {
    /// Create an on-demand view of `size` bytes
    pub fn new(provider: Arc<dyn FrameProvider>, size: usize) -> Result<Arc<Self>> {
        if size == 0 || !is_page_aligned(size) {
            return Err(Error::IllegalArgs);
        }
        let pages = alloc::vec![INVALID_PADDR; size / PAGE_SIZE];
        Ok(Arc::new(Self {
            provider,
            inner: Mutex::new(AllocatedInner {
                pages,
                length: size,
            }),
            observers: ObserverList::new(),
            contiguous_order: None,
        }))
    }

    /// Create a physically contiguous view of `size` bytes
    pub fn new_contiguous(
        provider: Arc<dyn FrameProvider>,
        size: usize,
        address_bits: u32,
    ) -> Result<Arc<Self>> {
        if size == 0 || !is_page_aligned(size) {
            return Err(Error::IllegalArgs);
        }
        let count = size / PAGE_SIZE;
        let order = count.next_power_of_two().trailing_zeros();
        let chunk = provider.allocate(order, address_bits);
        if chunk == INVALID_PADDR {
            return Err(Error::NoMemory);
        }
        let pages = (0..count)
            .map(|i| chunk + (i * PAGE_SIZE) as PAddr)
            .collect();
        Ok(Arc::new(Self {
            provider,
            inner: Mutex::new(AllocatedInner {
                pages,
                length: size,
            }),
            observers: ObserverList::new(),
            contiguous_order: Some(order),
        }))
    }

    fn ensure_page(&self, index: usize) -> Result<PAddr> {
        let mut inner = self.inner.lock();
        if inner.pages[index] != INVALID_PADDR {
            return Ok(inner.pages[index]);
        }
        let frame = self.provider.allocate(0, 64);
        if frame == INVALID_PADDR {
            return Err(Error::NoMemory);
        }
        PageAccessor::new(&*self.provider, frame).zero();
        inner.pages[index] = frame;
        Ok(frame)
    }

    /// Copy bytes out of the view
    ///
    /// Unallocated pages read as zeros without materializing a frame.
    pub fn read(&self, offset: usize, buffer: &mut [u8]) -> Result {
        if offset.checked_add(buffer.len()).map_or(true, |end| end > self.length()) {
            return Err(Error::IllegalArgs);
        }
        let mut progress = 0;
        while progress < buffer.len() {
            let position = offset + progress;
            let misalign = position & (PAGE_SIZE - 1);
            let chunk = (PAGE_SIZE - misalign).min(buffer.len() - progress);
            let frame = self.inner.lock().pages[position / PAGE_SIZE];
            if frame == INVALID_PADDR {
                buffer[progress..progress + chunk].fill(0);
            } else {
                let accessor = PageAccessor::new(&*self.provider, frame);
                buffer[progress..progress + chunk]
                    .copy_from_slice(&accessor.as_slice()[misalign..misalign + chunk]);
            }
            progress += chunk;
        }
        Ok(())
    }

    /// Copy bytes into the view, allocating pages as needed
    pub fn write(&self, offset: usize, buffer: &[u8]) -> Result {
        if offset.checked_add(buffer.len()).map_or(true, |end| end > self.length()) {
            return Err(Error::IllegalArgs);
        }
        let mut progress = 0;
        while progress < buffer.len() {
            let position = offset + progress;
            let misalign = position & (PAGE_SIZE - 1);
            let chunk = (PAGE_SIZE - misalign).min(buffer.len() - progress);
            let frame = self.ensure_page(position / PAGE_SIZE)?;
            let mut accessor = PageAccessor::new(&*self.provider, frame);
            accessor.as_mut_slice()[misalign..misalign + chunk]
                .copy_from_slice(&buffer[progress..progress + chunk]);
            progress += chunk;
        }
        Ok(())
    }
}

impl MemoryView for AllocatedMemory {
    fn length(&self) -> usize {
        self.inner.lock().length
    }

    fn peek_range(&self, offset: usize) -> PhysicalRange {
        let inner = self.inner.lock();
        assert!(is_page_aligned(offset) && offset < inner.length);
        PhysicalRange {
            addr: inner.pages[offset / PAGE_SIZE],
            length: PAGE_SIZE,
            caching: CachingMode::WriteBack,
        }
    }

    fn lock_range(&self, offset: usize, size: usize, node: LockRangeNode) {
        // Allocated frames never move while the view exists, so the pin is
        // implicit; the node still completes through the queue.
        let result = check_range(offset, size, self.length());
        node.complete(result);
    }

    fn unlock_range(&self, _offset: usize, _size: usize) {}

    fn fetch_range(&self, offset: usize, _flags: FetchFlags, node: FetchRangeNode) {
        if let Err(e) = check_range(offset, PAGE_SIZE, self.length()) {
            node.complete(Err(e));
            return;
        }
        match self.ensure_page(offset / PAGE_SIZE) {
            Ok(addr) => node.complete(Ok(PhysicalRange {
                addr,
                length: PAGE_SIZE,
                caching: CachingMode::WriteBack,
            })),
            Err(e) => node.complete(Err(e)),
        }
    }

    fn mark_dirty(&self, _offset: usize, _size: usize) {
        // Allocated pages have no clean/dirty distinction.
    }

    fn add_observer(&self, observer: Weak<Mapping>) {
        self.observers.add(observer);
    }

    fn remove_observer(&self, observer: &Arc<Mapping>) {
        self.observers.remove(observer);
    }

    fn resize(&self, new_size: usize, queue: &Arc<crate::sync::WorkQueue>) -> Result {
        if !is_page_aligned(new_size) || new_size == 0 {
            return Err(Error::IllegalArgs);
        }
        if self.contiguous_order.is_some() {
            return Err(Error::NotSupported);
        }
        let old_size;
        let tail: Vec<PAddr>;
        {
            let mut inner = self.inner.lock();
            old_size = inner.length;
            if new_size >= old_size {
                inner.pages.resize(new_size / PAGE_SIZE, INVALID_PADDR);
                inner.length = new_size;
                return Ok(());
            }
            inner.length = new_size;
            tail = inner.pages.split_off(new_size / PAGE_SIZE);
        }
        // Shrinking: evict the tail through the observers, then free it.
        let provider = self.provider.clone();
        self.observers
            .begin_evict(queue, new_size, old_size - new_size, move || {
                for frame in tail {
                    if frame != INVALID_PADDR {
                        provider.free(frame, 0);
                    }
                }
            });
        Ok(())
    }

    fn load_ahead(&self, offset: usize, size: usize) -> Result {
        check_range(offset, size, self.length())?;
        for page in (offset..offset + size).step_by(PAGE_SIZE) {
            self.ensure_page(page / PAGE_SIZE)?;
        }
        Ok(())
    }
}

impl Drop for AllocatedMemory {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        match self.contiguous_order {
            Some(order) => {
                if let Some(&chunk) = inner.pages.first() {
                    self.provider.free(chunk, order);
                }
            }
            None => {
                for &frame in &inner.pages {
                    if frame != INVALID_PADDR {
                        self.provider.free(frame, 0);
                    }
                }
            }
        }
    }
}

// ============================================================================
// Hardware Memory
// ============================================================================

/// View over a fixed physical range (device BARs)
pub struct HardwareMemory {
    base: PAddr,
    length: usize,
    caching: CachingMode,
    observers: ObserverList,
}

impl HardwareMemory {
    pub fn new(base: PAddr, length: usize, caching: CachingMode) -> Result<Arc<Self>> {
        if !is_page_aligned(base as usize) || !is_page_aligned(length) || length == 0 {
            return Err(Error::IllegalArgs);
        }
        Ok(Arc::new(Self {
            base,
            length,
            caching,
            observers: ObserverList::new(),
        }))
    }
}

impl MemoryView for HardwareMemory {
    fn length(&self) -> usize {
        self.length
    }

    fn peek_range(&self, offset: usize) -> PhysicalRange {
        assert!(is_page_aligned(offset) && offset < self.length);
        PhysicalRange {
            addr: self.base + offset as PAddr,
            length: PAGE_SIZE,
            caching: self.caching,
        }
    }

    fn lock_range(&self, offset: usize, size: usize, node: LockRangeNode) {
        node.complete(check_range(offset, size, self.length));
    }

    fn unlock_range(&self, _offset: usize, _size: usize) {}

    fn fetch_range(&self, offset: usize, _flags: FetchFlags, node: FetchRangeNode) {
        match check_range(offset, PAGE_SIZE, self.length) {
            Ok(()) => node.complete(Ok(self.peek_range(offset))),
            Err(e) => node.complete(Err(e)),
        }
    }

    fn mark_dirty(&self, _offset: usize, _size: usize) {}

    fn add_observer(&self, observer: Weak<Mapping>) {
        self.observers.add(observer);
    }

    fn remove_observer(&self, observer: &Arc<Mapping>) {
        self.observers.remove(observer);
    }
}

// ============================================================================
// Mirrored Memory
// ============================================================================

/// Identity view over a physical window, for kernel-internal mappings
pub struct MirroredMemory {
    base: PAddr,
    length: usize,
    observers: ObserverList,
}

impl MirroredMemory {
    pub fn new(base: PAddr, length: usize) -> Result<Arc<Self>> {
        if !is_page_aligned(base as usize) || !is_page_aligned(length) || length == 0 {
            return Err(Error::IllegalArgs);
        }
        Ok(Arc::new(Self {
            base,
            length,
            observers: ObserverList::new(),
        }))
    }
}

impl MemoryView for MirroredMemory {
    fn length(&self) -> usize {
        self.length
    }

    fn peek_range(&self, offset: usize) -> PhysicalRange {
        assert!(is_page_aligned(offset) && offset < self.length);
        PhysicalRange {
            addr: self.base + offset as PAddr,
            length: PAGE_SIZE,
            caching: CachingMode::WriteBack,
        }
    }

    fn lock_range(&self, offset: usize, size: usize, node: LockRangeNode) {
        node.complete(check_range(offset, size, self.length));
    }

    fn unlock_range(&self, _offset: usize, _size: usize) {}

    fn fetch_range(&self, offset: usize, _flags: FetchFlags, node: FetchRangeNode) {
        match check_range(offset, PAGE_SIZE, self.length) {
            Ok(()) => node.complete(Ok(self.peek_range(offset))),
            Err(e) => node.complete(Err(e)),
        }
    }

    fn mark_dirty(&self, _offset: usize, _size: usize) {}

    fn add_observer(&self, observer: Weak<Mapping>) {
        self.observers.add(observer);
    }

    fn remove_observer(&self, observer: &Arc<Mapping>) {
        self.observers.remove(observer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::WorkQueue;
    use crate::vm::pmm::HeapFrameArena;
    use core::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_allocated_pages_appear_on_fetch() {
        let arena = HeapFrameArena::new(16);
        let wq = WorkQueue::new();
        let view = AllocatedMemory::new(arena.clone(), 3 * PAGE_SIZE).unwrap();

        assert!(!view.peek_range(PAGE_SIZE).is_resident());
        assert_eq!(arena.used_pages(), 0);

        let got = Arc::new(Mutex::new(None));
        let g = got.clone();
        view.fetch_range(
            PAGE_SIZE,
            FetchFlags::empty(),
            FetchRangeNode::new(&wq, move |r| *g.lock() = Some(r)),
        );
        wq.drain();

        let range = got.lock().take().unwrap().unwrap();
        assert!(range.is_resident());
        assert_eq!(arena.used_pages(), 1);
        assert_eq!(view.peek_range(PAGE_SIZE).addr, range.addr);
        assert!(!view.peek_range(0).is_resident());
    }

    #[test]
    fn test_allocated_frames_freed_on_drop() {
        let arena = HeapFrameArena::new(16);
        let wq = WorkQueue::new();
        let view = AllocatedMemory::new(arena.clone(), 2 * PAGE_SIZE).unwrap();
        view.fetch_range(
            0,
            FetchFlags::empty(),
            FetchRangeNode::new(&wq, |_| {}),
        );
        wq.drain();
        assert_eq!(arena.used_pages(), 1);

        drop(view);
        assert_eq!(arena.used_pages(), 0);
    }

    #[test]
    fn test_contiguous_allocation() {
        let arena = HeapFrameArena::new(16);
        let view = AllocatedMemory::new_contiguous(arena.clone(), 4 * PAGE_SIZE, 64).unwrap();
        let base = view.peek_range(0).addr;
        for page in 0..4 {
            let range = view.peek_range(page * PAGE_SIZE);
            assert_eq!(range.addr, base + (page * PAGE_SIZE) as PAddr);
        }
        drop(view);
        assert_eq!(arena.used_pages(), 0);
    }

    #[test]
    fn test_resize_grow_and_shrink() {
        let arena = HeapFrameArena::new(16);
        let wq = WorkQueue::new();
        let view = AllocatedMemory::new(arena.clone(), 2 * PAGE_SIZE).unwrap();
        view.fetch_range(PAGE_SIZE, FetchFlags::empty(), FetchRangeNode::new(&wq, |_| {}));
        wq.drain();
        assert_eq!(arena.used_pages(), 1);

        view.resize(4 * PAGE_SIZE, &wq).unwrap();
        assert_eq!(view.length(), 4 * PAGE_SIZE);
        assert!(!view.peek_range(3 * PAGE_SIZE).is_resident());

        // Shrinking below the populated page frees its frame; with no
        // observers the eviction completes inline.
        view.resize(PAGE_SIZE, &wq).unwrap();
        wq.drain();
        assert_eq!(view.length(), PAGE_SIZE);
        assert_eq!(arena.used_pages(), 0);
    }

    #[test]
    fn test_allocated_read_write_round_trip() {
        let arena = HeapFrameArena::new(16);
        let view = AllocatedMemory::new(arena.clone(), 2 * PAGE_SIZE).unwrap();

        // Reads of untouched pages see zeros and allocate nothing.
        let mut buffer = [0xffu8; 16];
        view.read(PAGE_SIZE - 8, &mut buffer).unwrap();
        assert_eq!(buffer, [0u8; 16]);
        assert_eq!(arena.used_pages(), 0);

        // A write crossing the page boundary materializes both pages.
        view.write(PAGE_SIZE - 8, b"boundary payload").unwrap();
        assert_eq!(arena.used_pages(), 2);
        view.read(PAGE_SIZE - 8, &mut buffer).unwrap();
        assert_eq!(&buffer, b"boundary payload");

        assert!(view.write(2 * PAGE_SIZE - 4, &[0u8; 8]).is_err());
    }

    #[test]
    fn test_allocated_load_ahead_preallocates() {
        let arena = HeapFrameArena::new(16);
        let view = AllocatedMemory::new(arena.clone(), 3 * PAGE_SIZE).unwrap();
        view.load_ahead(PAGE_SIZE, 2 * PAGE_SIZE).unwrap();
        assert_eq!(arena.used_pages(), 2);
        assert!(view.peek_range(PAGE_SIZE).is_resident());
        assert!(!view.peek_range(0).is_resident());
    }

    #[test]
    fn test_hardware_view_is_always_resident() {
        let wq = WorkQueue::new();
        let view = HardwareMemory::new(0xfee0_0000, 2 * PAGE_SIZE, CachingMode::Uncached).unwrap();
        let range = view.peek_range(PAGE_SIZE);
        assert_eq!(range.addr, 0xfee0_1000);
        assert_eq!(range.caching, CachingMode::Uncached);

        let done = Arc::new(AtomicBool::new(false));
        let d = done.clone();
        view.lock_range(0, PAGE_SIZE, LockRangeNode::new(&wq, move |r| {
            r.unwrap();
            d.store(true, Ordering::Relaxed);
        }));
        wq.drain();
        assert!(done.load(Ordering::Relaxed));
    }

    #[test]
    fn test_slice_bounds() {
        let arena = HeapFrameArena::new(16);
        let view = AllocatedMemory::new(arena, 4 * PAGE_SIZE).unwrap();
        let view: Arc<dyn MemoryView> = view;

        let slice = MemorySlice::new(view.clone(), PAGE_SIZE, 2 * PAGE_SIZE).unwrap();
        assert_eq!(slice.offset(), PAGE_SIZE);
        assert_eq!(slice.length(), 2 * PAGE_SIZE);

        assert!(MemorySlice::new(view.clone(), PAGE_SIZE, 4 * PAGE_SIZE).is_err());
        assert!(MemorySlice::new(view, 17, PAGE_SIZE).is_err());
    }

    #[test]
    fn test_mirrored_view_is_identity() {
        let view = MirroredMemory::new(0x8000_0000, 4 * PAGE_SIZE).unwrap();
        let range = view.peek_range(2 * PAGE_SIZE);
        assert_eq!(range.addr, 0x8000_2000);
        assert_eq!(range.caching, CachingMode::WriteBack);
        assert!(MirroredMemory::new(0x123, PAGE_SIZE).is_err());
    }

    #[test]
    fn test_evict_node_joins() {
        let wq = WorkQueue::new();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        let node = EvictNode::new(&wq, move || f.store(true, Ordering::Relaxed));

        node.retain();
        node.done();
        assert!(!fired.load(Ordering::Relaxed));
        node.done();
        assert!(fired.load(Ordering::Relaxed));
    }
}
