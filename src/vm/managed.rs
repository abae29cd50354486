// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Managed Page Cache
//!
//! A managed view is a page cache whose contents are supplied and written
//! back by a user-space pager. The kernel and the pager see the same cache
//! through two faces:
//!
//! - [`BackingMemory`] is held by the pager. It parks manage-request slots
//!   on the cache, receives `Initialize` and `Writeback` requests through
//!   them, writes page data directly into the cache frames and resolves
//!   requests with `complete_load`.
//! - [`FrontalMemory`] is held by clients. Lock and fetch suspend until the
//!   pager has populated the requested pages.
//!
//! # Page state machine
//!
//! ```text
//! missing -> loading -> present <-> dirty -> evicting -> missing
//! ```
//!
//! Transitions for one page are totally ordered; only `present -> dirty`
//! and `dirty -> present` are observable from mappings. At most one
//! `Initialize` is outstanding per page, and coalesced requests never
//! overlap. A page that is dirtied again while its writeback is in flight
//! gets the writeback re-issued before its frame can be freed.
//!
//! Closing the last backing handle fails every pending lock and fetch with
//! `PagerGone`; killing the pager is the recovery path for a cache whose
//! pager stopped responding.

use crate::errors::{Error, Result};
use crate::sync::Completion;
use crate::types::{PAddr, INVALID_PADDR};
use crate::vm::aspace::Mapping;
use crate::vm::layout::{is_page_aligned, CachingMode, PAGE_SIZE};
use crate::vm::pmm::{FrameProvider, PageAccessor};
use crate::vm::view::{
    check_range, FetchFlags, FetchRangeNode, LockRangeNode, MemorySlice, MemoryView, ObserverList,
    PhysicalRange,
};
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use log::warn;
use spin::Mutex;

/// Kind of work requested from the pager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManageKind {
    /// Populate a missing range
    Initialize,
    /// Flush a dirty range
    Writeback,
}

/// One request delivered to the pager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManageRequest {
    pub kind: ManageKind,
    pub offset: usize,
    pub length: usize,
}

/// Parked manage-request slot
pub struct ManageNode {
    completion: Completion<Result<ManageRequest>>,
}

impl ManageNode {
    pub fn new(
        queue: &Arc<crate::sync::WorkQueue>,
        func: impl FnOnce(Result<ManageRequest>) + Send + 'static,
    ) -> Self {
        Self {
            completion: Completion::new(queue, func),
        }
    }

    pub fn complete(self, result: Result<ManageRequest>) {
        self.completion.post(result);
    }
}

/// Cache state of one logical page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CachePageState {
    Missing,
    Loading,
    Present,
    Dirty,
    Evicting,
}

struct ManagedPage {
    state: CachePageState,
    phys: PAddr,
    lock_count: u32,
    /// A writeback for this page is outstanding at the pager.
    writeback_pending: bool,
    /// The page was dirtied again while its writeback was in flight.
    redirtied: bool,
}

impl ManagedPage {
    fn new() -> Self {
        Self {
            state: CachePageState::Missing,
            phys: INVALID_PADDR,
            lock_count: 0,
            writeback_pending: false,
            redirtied: false,
        }
    }

    fn is_resident(&self) -> bool {
        matches!(self.state, CachePageState::Present | CachePageState::Dirty)
    }
}

struct LockWaiter {
    offset: usize,
    size: usize,
    node: LockRangeNode,
}

struct FetchWaiter {
    offset: usize,
    node: FetchRangeNode,
}

struct EvictionOp {
    id: u64,
    pages: Vec<usize>,
    observers_done: bool,
    completion: Completion<Result>,
}

struct ManagedInner {
    pages: Vec<ManagedPage>,
    submitted: VecDeque<ManageNode>,
    requests: VecDeque<ManageRequest>,
    lock_waiters: Vec<LockWaiter>,
    fetch_waiters: Vec<FetchWaiter>,
    evictions: Vec<EvictionOp>,
    next_eviction_id: u64,
    pager_open: bool,
}

type Deferred = Vec<Box<dyn FnOnce() + Send>>;

/// The shared cache behind a backing/frontal pair
pub struct ManagedSpace {
    provider: Arc<dyn FrameProvider>,
    inner: Mutex<ManagedInner>,
    observers: ObserverList,
    self_ref: Weak<ManagedSpace>,
}

impl ManagedSpace {
    fn new(provider: Arc<dyn FrameProvider>, size: usize) -> Result<Arc<Self>> {
        if size == 0 || !is_page_aligned(size) {
            return Err(Error::IllegalArgs);
        }
        let mut pages = Vec::new();
        pages.resize_with(size / PAGE_SIZE, ManagedPage::new);
        Ok(Arc::new_cyclic(|self_ref| Self {
            provider,
            inner: Mutex::new(ManagedInner {
                pages,
                submitted: VecDeque::new(),
                requests: VecDeque::new(),
                lock_waiters: Vec::new(),
                fetch_waiters: Vec::new(),
                evictions: Vec::new(),
                next_eviction_id: 0,
                pager_open: true,
            }),
            observers: ObserverList::new(),
            self_ref: self_ref.clone(),
        }))
    }

    fn length(&self) -> usize {
        self.inner.lock().pages.len() * PAGE_SIZE
    }

    /// Hand each undelivered request to a parked slot
    fn deliver(inner: &mut ManagedInner, deferred: &mut Deferred) {
        while !inner.requests.is_empty() && !inner.submitted.is_empty() {
            let request = inner.requests.pop_front().unwrap();
            let node = inner.submitted.pop_front().unwrap();
            deferred.push(Box::new(move || node.complete(Ok(request))));
        }
    }

    /// Move a missing page to loading and give it a frame
    fn begin_load(&self, inner: &mut ManagedInner, index: usize) -> Result {
        assert_eq!(inner.pages[index].state, CachePageState::Missing);
        if inner.pages[index].phys == INVALID_PADDR {
            let frame = self.provider.allocate(0, 64);
            if frame == INVALID_PADDR {
                return Err(Error::NoMemory);
            }
            PageAccessor::new(&*self.provider, frame).zero();
            inner.pages[index].phys = frame;
        }
        inner.pages[index].state = CachePageState::Loading;
        Ok(())
    }

    /// Queue coalesced `Initialize` requests for every page of `indices`
    /// that was moved to loading
    fn push_initialize_runs(inner: &mut ManagedInner, indices: &[usize]) {
        let mut run: Option<(usize, usize)> = None;
        for &index in indices {
            match run {
                Some((start, len)) if start + len == index => run = Some((start, len + 1)),
                Some((start, len)) => {
                    inner.requests.push_back(ManageRequest {
                        kind: ManageKind::Initialize,
                        offset: start * PAGE_SIZE,
                        length: len * PAGE_SIZE,
                    });
                    run = Some((index, 1));
                }
                None => run = Some((index, 1)),
            }
        }
        if let Some((start, len)) = run {
            inner.requests.push_back(ManageRequest {
                kind: ManageKind::Initialize,
                offset: start * PAGE_SIZE,
                length: len * PAGE_SIZE,
            });
        }
    }

    /// Complete waiters whose pages arrived and restart loads for waiters
    /// whose pages fell back to missing
    fn service_waiters(&self, inner: &mut ManagedInner, deferred: &mut Deferred) {
        let mut index = 0;
        while index < inner.lock_waiters.len() {
            let first = inner.lock_waiters[index].offset / PAGE_SIZE;
            let count = inner.lock_waiters[index].size / PAGE_SIZE;
            if (first..first + count).all(|p| inner.pages[p].is_resident()) {
                let waiter = inner.lock_waiters.swap_remove(index);
                deferred.push(Box::new(move || waiter.node.complete(Ok(()))));
                continue;
            }
            let mut started = Vec::new();
            let mut failed = None;
            for page in first..first + count {
                if inner.pages[page].state == CachePageState::Missing {
                    match self.begin_load(inner, page) {
                        Ok(()) => started.push(page),
                        Err(e) => {
                            failed = Some(e);
                            break;
                        }
                    }
                }
            }
            Self::push_initialize_runs(inner, &started);
            if let Some(error) = failed {
                let waiter = inner.lock_waiters.swap_remove(index);
                for page in first..first + count {
                    inner.pages[page].lock_count -= 1;
                }
                deferred.push(Box::new(move || waiter.node.complete(Err(error))));
                continue;
            }
            index += 1;
        }

        let mut index = 0;
        while index < inner.fetch_waiters.len() {
            let page = inner.fetch_waiters[index].offset / PAGE_SIZE;
            if inner.pages[page].is_resident() {
                let waiter = inner.fetch_waiters.swap_remove(index);
                let range = PhysicalRange {
                    addr: inner.pages[page].phys,
                    length: PAGE_SIZE,
                    caching: CachingMode::WriteBack,
                };
                deferred.push(Box::new(move || waiter.node.complete(Ok(range))));
                continue;
            }
            if inner.pages[page].state == CachePageState::Missing {
                match self.begin_load(inner, page) {
                    Ok(()) => Self::push_initialize_runs(inner, &[page]),
                    Err(error) => {
                        let waiter = inner.fetch_waiters.swap_remove(index);
                        deferred.push(Box::new(move || waiter.node.complete(Err(error))));
                        continue;
                    }
                }
            }
            index += 1;
        }
    }

    /// Free the frames of every eviction whose writebacks and observers
    /// have both finished
    fn finish_evictions(&self, inner: &mut ManagedInner, deferred: &mut Deferred) {
        let mut index = 0;
        while index < inner.evictions.len() {
            let ready = inner.evictions[index].observers_done
                && inner.evictions[index]
                    .pages
                    .iter()
                    .all(|&p| !inner.pages[p].writeback_pending);
            if !ready {
                index += 1;
                continue;
            }
            let op = inner.evictions.swap_remove(index);
            for &page in &op.pages {
                assert_eq!(inner.pages[page].state, CachePageState::Evicting);
                assert!(!inner.pages[page].redirtied);
                self.provider.free(inner.pages[page].phys, 0);
                inner.pages[page].phys = INVALID_PADDR;
                inner.pages[page].state = CachePageState::Missing;
            }
            deferred.push(Box::new(move || op.completion.post(Ok(()))));
        }
        // Freed pages may unblock waiters that now need a fresh load.
        self.service_waiters(inner, deferred);
        Self::deliver(inner, deferred);
    }

    fn run(deferred: Deferred) {
        for action in deferred {
            action();
        }
    }

    // ------------------------------------------------------------------
    // Frontal face
    // ------------------------------------------------------------------

    fn peek_frontal(&self, offset: usize) -> PhysicalRange {
        let inner = self.inner.lock();
        assert!(is_page_aligned(offset) && offset / PAGE_SIZE < inner.pages.len());
        let page = &inner.pages[offset / PAGE_SIZE];
        if page.is_resident() {
            PhysicalRange {
                addr: page.phys,
                length: PAGE_SIZE,
                caching: CachingMode::WriteBack,
            }
        } else {
            PhysicalRange::absent()
        }
    }

    fn lock_frontal(&self, offset: usize, size: usize, node: LockRangeNode) {
        let mut deferred = Deferred::new();
        {
            let mut inner = self.inner.lock();
            if let Err(e) = check_range(offset, size, inner.pages.len() * PAGE_SIZE) {
                drop(inner);
                node.complete(Err(e));
                return;
            }
            if !inner.pager_open {
                drop(inner);
                node.complete(Err(Error::PagerGone));
                return;
            }
            let first = offset / PAGE_SIZE;
            let count = size / PAGE_SIZE;
            for page in first..first + count {
                inner.pages[page].lock_count += 1;
            }
            inner.lock_waiters.push(LockWaiter { offset, size, node });
            self.service_waiters(&mut inner, &mut deferred);
            Self::deliver(&mut inner, &mut deferred);
        }
        Self::run(deferred);
    }

    fn unlock_frontal(&self, offset: usize, size: usize) {
        let mut inner = self.inner.lock();
        let first = offset / PAGE_SIZE;
        for page in first..first + size / PAGE_SIZE {
            assert!(inner.pages[page].lock_count > 0, "unbalanced unlock");
            inner.pages[page].lock_count -= 1;
        }
    }

    fn fetch_frontal(&self, offset: usize, flags: FetchFlags, node: FetchRangeNode) {
        let mut deferred = Deferred::new();
        {
            let mut inner = self.inner.lock();
            if let Err(e) = check_range(offset, PAGE_SIZE, inner.pages.len() * PAGE_SIZE) {
                drop(inner);
                node.complete(Err(e));
                return;
            }
            let page = offset / PAGE_SIZE;
            if !inner.pages[page].is_resident() {
                if flags.contains(FetchFlags::DISALLOW_BACKING) {
                    drop(inner);
                    node.complete(Err(Error::NoBacking));
                    return;
                }
                if !inner.pager_open {
                    drop(inner);
                    node.complete(Err(Error::PagerGone));
                    return;
                }
            }
            inner.fetch_waiters.push(FetchWaiter { offset, node });
            self.service_waiters(&mut inner, &mut deferred);
            Self::deliver(&mut inner, &mut deferred);
        }
        Self::run(deferred);
    }

    fn mark_dirty(&self, offset: usize, size: usize) {
        let mut deferred = Deferred::new();
        {
            let mut inner = self.inner.lock();
            assert!(is_page_aligned(offset) && is_page_aligned(size));
            let first = offset / PAGE_SIZE;
            for page in first..first + size / PAGE_SIZE {
                match inner.pages[page].state {
                    CachePageState::Present => inner.pages[page].state = CachePageState::Dirty,
                    CachePageState::Dirty => {}
                    CachePageState::Evicting => {
                        // The dirty observation raced with an eviction; the
                        // frame must be written back (again) before it can
                        // be freed.
                        if inner.pages[page].writeback_pending {
                            inner.pages[page].redirtied = true;
                        } else {
                            inner.pages[page].writeback_pending = true;
                            inner.requests.push_back(ManageRequest {
                                kind: ManageKind::Writeback,
                                offset: page * PAGE_SIZE,
                                length: PAGE_SIZE,
                            });
                        }
                    }
                    state => warn!(
                        "managed: dirty observation on page {page} in state {state:?}"
                    ),
                }
            }
            Self::deliver(&mut inner, &mut deferred);
        }
        Self::run(deferred);
    }

    // ------------------------------------------------------------------
    // Backing face
    // ------------------------------------------------------------------

    fn peek_backing(&self, offset: usize) -> PhysicalRange {
        let inner = self.inner.lock();
        assert!(is_page_aligned(offset) && offset / PAGE_SIZE < inner.pages.len());
        PhysicalRange {
            addr: inner.pages[offset / PAGE_SIZE].phys,
            length: PAGE_SIZE,
            caching: CachingMode::WriteBack,
        }
    }

    fn lock_backing(&self, offset: usize, size: usize, node: LockRangeNode) {
        let result = check_range(offset, size, self.length());
        if result.is_ok() {
            let mut inner = self.inner.lock();
            let first = offset / PAGE_SIZE;
            for page in first..first + size / PAGE_SIZE {
                inner.pages[page].lock_count += 1;
            }
        }
        node.complete(result);
    }

    fn fetch_backing(&self, offset: usize, node: FetchRangeNode) {
        let mut inner = self.inner.lock();
        if let Err(e) = check_range(offset, PAGE_SIZE, inner.pages.len() * PAGE_SIZE) {
            drop(inner);
            node.complete(Err(e));
            return;
        }
        let page = offset / PAGE_SIZE;
        if inner.pages[page].phys == INVALID_PADDR {
            let frame = self.provider.allocate(0, 64);
            if frame == INVALID_PADDR {
                drop(inner);
                node.complete(Err(Error::NoMemory));
                return;
            }
            PageAccessor::new(&*self.provider, frame).zero();
            inner.pages[page].phys = frame;
        }
        let range = PhysicalRange {
            addr: inner.pages[page].phys,
            length: PAGE_SIZE,
            caching: CachingMode::WriteBack,
        };
        drop(inner);
        node.complete(Ok(range));
    }

    fn submit_manage(&self, node: ManageNode) {
        let request = {
            let mut inner = self.inner.lock();
            if !inner.pager_open {
                drop(inner);
                node.complete(Err(Error::PagerGone));
                return;
            }
            match inner.requests.pop_front() {
                Some(request) => Some(request),
                None => {
                    inner.submitted.push_back(node);
                    return;
                }
            }
        };
        node.complete(Ok(request.unwrap()));
    }

    fn complete_load(&self, offset: usize, size: usize) -> Result {
        let mut deferred = Deferred::new();
        {
            let mut inner = self.inner.lock();
            check_range(offset, size, inner.pages.len() * PAGE_SIZE)?;
            let first = offset / PAGE_SIZE;
            for page in first..first + size / PAGE_SIZE {
                match inner.pages[page].state {
                    CachePageState::Loading => {
                        inner.pages[page].state = CachePageState::Present;
                    }
                    CachePageState::Evicting if inner.pages[page].writeback_pending => {
                        if inner.pages[page].redirtied {
                            inner.pages[page].redirtied = false;
                            inner.requests.push_back(ManageRequest {
                                kind: ManageKind::Writeback,
                                offset: page * PAGE_SIZE,
                                length: PAGE_SIZE,
                            });
                        } else {
                            inner.pages[page].writeback_pending = false;
                        }
                    }
                    state => warn!("managed: stray completion for page {page} in {state:?}"),
                }
            }
            self.service_waiters(&mut inner, &mut deferred);
            self.finish_evictions(&mut inner, &mut deferred);
        }
        Self::run(deferred);
        Ok(())
    }

    /// Start populating a range without registering a waiter
    fn load_ahead(&self, offset: usize, size: usize) -> Result {
        let mut deferred = Deferred::new();
        let mut failed = None;
        {
            let mut inner = self.inner.lock();
            check_range(offset, size, inner.pages.len() * PAGE_SIZE)?;
            if !inner.pager_open {
                return Err(Error::PagerGone);
            }
            let first = offset / PAGE_SIZE;
            let mut started = Vec::new();
            for page in first..first + size / PAGE_SIZE {
                if inner.pages[page].state == CachePageState::Missing {
                    match self.begin_load(&mut inner, page) {
                        Ok(()) => started.push(page),
                        Err(error) => {
                            failed = Some(error);
                            break;
                        }
                    }
                }
            }
            // Pages that did get a frame still go out to the pager.
            Self::push_initialize_runs(&mut inner, &started);
            Self::deliver(&mut inner, &mut deferred);
        }
        Self::run(deferred);
        match failed {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Begin evicting `[offset, offset + size)`
    ///
    /// Dirty pages are written back first; no frame is freed before its
    /// writeback completed and every observer acknowledged the unmap.
    /// Locked and in-flight pages are skipped.
    fn evict_range(&self, offset: usize, size: usize, completion: Completion<Result>) {
        let queue = completion.queue().clone();
        let mut deferred = Deferred::new();
        let id;
        {
            let mut inner = self.inner.lock();
            if let Err(e) = check_range(offset, size, inner.pages.len() * PAGE_SIZE) {
                drop(inner);
                completion.post(Err(e));
                return;
            }
            let first = offset / PAGE_SIZE;
            let mut pages = Vec::new();
            let mut writeback = Vec::new();
            for page in first..first + size / PAGE_SIZE {
                if inner.pages[page].lock_count > 0 {
                    continue;
                }
                match inner.pages[page].state {
                    CachePageState::Present => {
                        inner.pages[page].state = CachePageState::Evicting;
                        pages.push(page);
                    }
                    CachePageState::Dirty => {
                        inner.pages[page].state = CachePageState::Evicting;
                        inner.pages[page].writeback_pending = true;
                        pages.push(page);
                        writeback.push(page);
                    }
                    _ => {}
                }
            }
            for &page in &writeback {
                inner.requests.push_back(ManageRequest {
                    kind: ManageKind::Writeback,
                    offset: page * PAGE_SIZE,
                    length: PAGE_SIZE,
                });
            }
            if pages.is_empty() {
                drop(inner);
                completion.post(Ok(()));
                return;
            }
            id = inner.next_eviction_id;
            inner.next_eviction_id += 1;
            inner.evictions.push(EvictionOp {
                id,
                pages,
                observers_done: false,
                completion,
            });
            Self::deliver(&mut inner, &mut deferred);
        }
        Self::run(deferred);
        let this = self.self_ref.upgrade().expect("evicting a dead cache");
        self.observers.begin_evict(&queue, offset, size, move || {
            this.eviction_observers_done(id);
        });
    }

    fn eviction_observers_done(&self, id: u64) {
        let mut deferred = Deferred::new();
        {
            let mut inner = self.inner.lock();
            if let Some(op) = inner.evictions.iter_mut().find(|op| op.id == id) {
                op.observers_done = true;
            }
            self.finish_evictions(&mut inner, &mut deferred);
        }
        Self::run(deferred);
    }

    /// Fail everything that depends on the pager
    fn pager_closed(&self) {
        let mut deferred = Deferred::new();
        {
            let mut inner = self.inner.lock();
            inner.pager_open = false;
            inner.requests.clear();
            while let Some(node) = inner.submitted.pop_front() {
                deferred.push(Box::new(move || node.complete(Err(Error::PagerGone))));
            }
            while let Some(waiter) = inner.lock_waiters.pop() {
                let first = waiter.offset / PAGE_SIZE;
                for page in first..first + waiter.size / PAGE_SIZE {
                    inner.pages[page].lock_count -= 1;
                }
                deferred.push(Box::new(move || waiter.node.complete(Err(Error::PagerGone))));
            }
            while let Some(waiter) = inner.fetch_waiters.pop() {
                deferred.push(Box::new(move || waiter.node.complete(Err(Error::PagerGone))));
            }
            for page in 0..inner.pages.len() {
                if inner.pages[page].state == CachePageState::Loading {
                    self.provider.free(inner.pages[page].phys, 0);
                    inner.pages[page].phys = INVALID_PADDR;
                    inner.pages[page].state = CachePageState::Missing;
                }
                inner.pages[page].writeback_pending = false;
                inner.pages[page].redirtied = false;
            }
            self.finish_evictions(&mut inner, &mut deferred);
        }
        Self::run(deferred);
    }
}

impl Drop for ManagedSpace {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for page in &inner.pages {
            if page.phys != INVALID_PADDR {
                self.provider.free(page.phys, 0);
            }
        }
    }
}

/// Create the backing/frontal pair over one cache
pub fn create_managed_pair(
    provider: Arc<dyn FrameProvider>,
    size: usize,
) -> Result<(Arc<BackingMemory>, Arc<FrontalMemory>)> {
    let managed = ManagedSpace::new(provider, size)?;
    Ok((
        Arc::new(BackingMemory {
            managed: managed.clone(),
        }),
        Arc::new(FrontalMemory { managed }),
    ))
}

// ============================================================================
// Backing Memory
// ============================================================================

/// Pager-side face of a managed cache
pub struct BackingMemory {
    managed: Arc<ManagedSpace>,
}

impl BackingMemory {
    /// Request eviction of a range (writeback of dirty pages included)
    pub fn evict_range(&self, offset: usize, size: usize, completion: Completion<Result>) {
        self.managed.evict_range(offset, size, completion);
    }

    /// Request eviction of the whole cache
    pub fn evict_all(&self, completion: Completion<Result>) {
        self.managed.evict_range(0, self.managed.length(), completion);
    }

    /// Slice covering the whole cache, for mapping into the pager
    pub fn as_slice(self: &Arc<Self>) -> Arc<MemorySlice> {
        MemorySlice::covering(self.clone())
    }
}

impl Drop for BackingMemory {
    fn drop(&mut self) {
        self.managed.pager_closed();
    }
}

impl MemoryView for BackingMemory {
    fn length(&self) -> usize {
        self.managed.length()
    }

    fn peek_range(&self, offset: usize) -> PhysicalRange {
        self.managed.peek_backing(offset)
    }

    fn lock_range(&self, offset: usize, size: usize, node: LockRangeNode) {
        self.managed.lock_backing(offset, size, node);
    }

    fn unlock_range(&self, offset: usize, size: usize) {
        self.managed.unlock_frontal(offset, size);
    }

    fn fetch_range(&self, offset: usize, _flags: FetchFlags, node: FetchRangeNode) {
        self.managed.fetch_backing(offset, node);
    }

    fn mark_dirty(&self, _offset: usize, _size: usize) {
        // Pager stores populate the cache; they do not dirty it.
    }

    fn add_observer(&self, observer: Weak<Mapping>) {
        self.managed.observers.add(observer);
    }

    fn remove_observer(&self, observer: &Arc<Mapping>) {
        self.managed.observers.remove(observer);
    }

    fn submit_manage(&self, node: ManageNode) {
        self.managed.submit_manage(node);
    }

    fn complete_load(&self, offset: usize, size: usize) -> Result {
        self.managed.complete_load(offset, size)
    }
}

// ============================================================================
// Frontal Memory
// ============================================================================

/// Client-side face of a managed cache
pub struct FrontalMemory {
    managed: Arc<ManagedSpace>,
}

impl MemoryView for FrontalMemory {
    fn length(&self) -> usize {
        self.managed.length()
    }

    fn peek_range(&self, offset: usize) -> PhysicalRange {
        self.managed.peek_frontal(offset)
    }

    fn lock_range(&self, offset: usize, size: usize, node: LockRangeNode) {
        self.managed.lock_frontal(offset, size, node);
    }

    fn unlock_range(&self, offset: usize, size: usize) {
        self.managed.unlock_frontal(offset, size);
    }

    fn fetch_range(&self, offset: usize, flags: FetchFlags, node: FetchRangeNode) {
        self.managed.fetch_frontal(offset, flags, node);
    }

    fn mark_dirty(&self, offset: usize, size: usize) {
        self.managed.mark_dirty(offset, size);
    }

    fn add_observer(&self, observer: Weak<Mapping>) {
        self.managed.observers.add(observer);
    }

    fn remove_observer(&self, observer: &Arc<Mapping>) {
        self.managed.observers.remove(observer);
    }

    fn complete_load(&self, offset: usize, size: usize) -> Result {
        self.managed.complete_load(offset, size)
    }

    fn load_ahead(&self, offset: usize, size: usize) -> Result {
        self.managed.load_ahead(offset, size)
    }
}
