// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Cross-component scenarios for the virtual-memory core
//!
//! Each test drives several components together the way the kernel does:
//! faults against mapped views, managed caches with a scripted pager,
//! eviction racing shootdowns on a second CPU, and CoW forks.

use crate::errors::Result;
use crate::sync::{Completion, WorkQueue};
use crate::types::VAddr;
use crate::vm::aspace::AddressSpace;
use crate::vm::fault::{FaultFlags, FaultNode, FaultOutcome};
use crate::vm::layout::{MapFlags, PAGE_SIZE};
use crate::vm::managed::{create_managed_pair, ManageKind, ManageNode, ManageRequest};
use crate::vm::pmm::{FrameProvider, HeapFrameArena, PageAccessor};
use crate::vm::view::{AllocatedMemory, LockRangeNode, MemorySlice, MemoryView};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use spin::Mutex;

fn fault(
    aspace: &Arc<AddressSpace>,
    wq: &Arc<WorkQueue>,
    address: VAddr,
    flags: FaultFlags,
) -> FaultOutcome {
    let outcome = Arc::new(Mutex::new(None));
    let o = outcome.clone();
    aspace.space().handle_fault(
        address,
        flags,
        FaultNode::new(wq, move |result| *o.lock() = Some(result)),
    );
    wq.drain();
    let result = outcome.lock().take().expect("fault did not complete");
    result
}

/// Model a user-mode store: raise the PTE dirty bit, then write the byte
/// through the direct map.
fn user_write(aspace: &Arc<AddressSpace>, arena: &Arc<HeapFrameArena>, address: VAddr, value: u8) {
    aspace.table().set_dirty(address);
    let pa = aspace.table().translate(address).expect("page not mapped");
    let mut accessor = PageAccessor::new(&**arena, pa);
    accessor.as_mut_slice()[address % PAGE_SIZE] = value;
}

fn user_read(aspace: &Arc<AddressSpace>, arena: &Arc<HeapFrameArena>, address: VAddr) -> u8 {
    let pa = aspace.table().translate(address).expect("page not mapped");
    PageAccessor::new(&**arena, pa).as_slice()[address % PAGE_SIZE]
}

#[test]
fn test_map_and_fault_in() {
    let arena = HeapFrameArena::new(16);
    let wq = WorkQueue::new();
    let aspace = AddressSpace::create(arena.clone());
    let view = AllocatedMemory::new(arena.clone(), 3 * PAGE_SIZE).unwrap();
    let va = aspace
        .space()
        .map(MemorySlice::covering(view), None, 0, 3 * PAGE_SIZE,
            MapFlags::PROT_READ | MapFlags::PROT_WRITE)
        .unwrap();

    // First access faults a zeroed page in.
    let outcome = fault(&aspace, &wq, va + 4097, FaultFlags::empty());
    assert!(outcome.resolved && !outcome.spurious);
    assert_eq!(aspace.space().rss(), PAGE_SIZE);
    assert_eq!(user_read(&aspace, &arena, va + 4097), 0);

    // The page is installed writable; the store needs no further fault.
    user_write(&aspace, &arena, va + 4097, 7);
    assert_eq!(user_read(&aspace, &arena, va + 4097), 7);
    assert_eq!(aspace.space().rss(), PAGE_SIZE);
    assert_eq!(aspace.table().mapped_pages() * PAGE_SIZE, aspace.space().rss());
}

#[test]
fn test_managed_cache_lock_protocol() {
    let arena = HeapFrameArena::new(16);
    let wq = WorkQueue::new();
    let (backing, frontal) = create_managed_pair(arena, 2 * PAGE_SIZE).unwrap();

    let requests = Arc::new(Mutex::new(Vec::new()));
    let r = requests.clone();
    backing.submit_manage(ManageNode::new(&wq, move |request| {
        r.lock().push(request.unwrap());
    }));

    // The first locker triggers exactly one coalesced initialize.
    let first = Arc::new(AtomicBool::new(false));
    let f = first.clone();
    frontal.lock_range(0, 2 * PAGE_SIZE, LockRangeNode::new(&wq, move |r| {
        r.unwrap();
        f.store(true, Ordering::Relaxed);
    }));
    wq.drain();
    assert_eq!(
        *requests.lock(),
        alloc::vec![ManageRequest {
            kind: ManageKind::Initialize,
            offset: 0,
            length: 2 * PAGE_SIZE,
        }]
    );
    assert!(!first.load(Ordering::Relaxed));

    backing.complete_load(0, 2 * PAGE_SIZE).unwrap();
    wq.drain();
    assert!(first.load(Ordering::Relaxed));

    // A second locker of a present subrange completes with no new request.
    let second = Arc::new(AtomicBool::new(false));
    let s = second.clone();
    frontal.lock_range(0, PAGE_SIZE, LockRangeNode::new(&wq, move |r| {
        r.unwrap();
        s.store(true, Ordering::Relaxed);
    }));
    wq.drain();
    assert!(second.load(Ordering::Relaxed));
    assert_eq!(requests.lock().len(), 1);
}

#[test]
fn test_dirty_writeback_ordering() {
    let arena = HeapFrameArena::new(16);
    let wq = WorkQueue::new();
    let aspace = AddressSpace::create(arena.clone());
    let (backing, frontal) = create_managed_pair(arena.clone(), PAGE_SIZE).unwrap();

    let requests = Arc::new(Mutex::new(Vec::new()));
    let submit_slot = {
        let requests = requests.clone();
        let backing = backing.clone();
        let wq = wq.clone();
        move || {
            let requests = requests.clone();
            backing.submit_manage(ManageNode::new(&wq, move |request| {
                requests.lock().push(request.unwrap());
            }));
        }
    };

    let va = aspace
        .space()
        .map(MemorySlice::covering(frontal.clone()), None, 0, PAGE_SIZE,
            MapFlags::PROT_READ | MapFlags::PROT_WRITE)
        .unwrap();

    // Fault the page in through the pager.
    submit_slot();
    let pending = fault_async(&aspace, &wq, va, FaultFlags::WRITE);
    wq.drain();
    assert_eq!(requests.lock().len(), 1);
    backing.complete_load(0, PAGE_SIZE).unwrap();
    wq.drain();
    assert!(pending.lock().take().unwrap().resolved);

    // User dirties the page; a second CPU also runs this space.
    user_write(&aspace, &arena, va, 42);
    aspace.table().hub().bind_cpu(1);

    let frames_before = arena.used_pages();
    submit_slot();
    let evicted = Arc::new(AtomicBool::new(false));
    let e = evicted.clone();
    backing.evict_range(0, PAGE_SIZE, Completion::new(&wq, move |r: Result| {
        r.unwrap();
        e.store(true, Ordering::Relaxed);
    }));
    wq.drain();

    // The unmap observed the dirty bit, so exactly one writeback went out.
    assert_eq!(requests.lock().len(), 2);
    assert_eq!(requests.lock()[1].kind, ManageKind::Writeback);
    // No frame freed: writeback pending and the remote CPU has not acked.
    assert_eq!(arena.used_pages(), frames_before);
    assert!(!evicted.load(Ordering::Relaxed));

    // Writeback completion alone is not enough.
    backing.complete_load(0, PAGE_SIZE).unwrap();
    wq.drain();
    assert_eq!(arena.used_pages(), frames_before);
    assert!(!evicted.load(Ordering::Relaxed));

    // The remote acknowledgement releases the frame.
    aspace.table().hub().acknowledge(1);
    wq.drain();
    assert!(evicted.load(Ordering::Relaxed));
    assert!(arena.used_pages() < frames_before);
    assert!(!frontal.peek_range(0).is_resident());
    assert_eq!(aspace.space().rss(), 0);
}

fn fault_async(
    aspace: &Arc<AddressSpace>,
    wq: &Arc<WorkQueue>,
    address: VAddr,
    flags: FaultFlags,
) -> Arc<Mutex<Option<FaultOutcome>>> {
    let outcome = Arc::new(Mutex::new(None));
    let o = outcome.clone();
    aspace.space().handle_fault(
        address,
        flags,
        FaultNode::new(wq, move |result| *o.lock() = Some(result)),
    );
    outcome
}

#[test]
fn test_unmap_waits_for_remote_cpu() {
    let arena = HeapFrameArena::new(16);
    let wq = WorkQueue::new();
    let aspace = AddressSpace::create(arena.clone());
    let view = AllocatedMemory::new(arena.clone(), PAGE_SIZE).unwrap();
    let va = aspace
        .space()
        .map(MemorySlice::covering(view), None, 0, PAGE_SIZE,
            MapFlags::PROT_READ | MapFlags::PROT_WRITE)
        .unwrap();
    fault(&aspace, &wq, va, FaultFlags::empty());
    assert_eq!(arena.used_pages(), 1);

    // A second CPU is executing loads from the page.
    aspace.table().hub().bind_cpu(1);

    let done = Arc::new(AtomicBool::new(false));
    let d = done.clone();
    aspace.space().unmap(va, PAGE_SIZE, Completion::new(&wq, move |r: Result| {
        r.unwrap();
        d.store(true, Ordering::Relaxed);
    }));
    wq.drain();

    // The completion must not return and the frame must not be freed
    // before the remote CPU observed the invalidation.
    assert!(!done.load(Ordering::Relaxed));
    assert_eq!(arena.used_pages(), 1);

    aspace.table().hub().acknowledge(1);
    wq.drain();
    assert!(done.load(Ordering::Relaxed));
    // Retirement released the mapping, the slice and the view, so the
    // frame went back to the allocator.
    assert_eq!(arena.used_pages(), 0);
}

#[test]
fn test_cow_fork_isolation() {
    let arena = HeapFrameArena::new(32);
    let wq = WorkQueue::new();
    let parent = AddressSpace::create(arena.clone());
    let view = AllocatedMemory::new(arena.clone(), PAGE_SIZE).unwrap();
    let va = parent
        .space()
        .map(MemorySlice::covering(view), None, 0, PAGE_SIZE,
            MapFlags::PROT_READ | MapFlags::PROT_WRITE | MapFlags::COPY_ON_WRITE_AT_FORK)
        .unwrap();

    // Parent writes before the fork.
    assert!(fault(&parent, &wq, va, FaultFlags::WRITE).resolved);
    user_write(&parent, &arena, va, b'A');

    let forked = Arc::new(Mutex::new(None));
    let f = forked.clone();
    parent.fork(Completion::new(&wq, move |r: Result<Arc<AddressSpace>>| {
        *f.lock() = Some(r.unwrap())
    }));
    wq.drain();
    let child = forked.lock().take().unwrap();

    // The fork downgrade unmapped the parent page.
    assert!(parent.space().rss() == 0);

    // Parent writes after the fork; a private copy materializes.
    assert!(fault(&parent, &wq, va, FaultFlags::WRITE).resolved);
    user_write(&parent, &arena, va, b'B');

    // The child still reads the pre-fork value.
    assert!(fault(&child, &wq, va, FaultFlags::empty()).resolved);
    assert_eq!(user_read(&child, &arena, va), b'A');

    // The child's own write does not disturb the parent.
    assert!(fault(&child, &wq, va, FaultFlags::WRITE).resolved);
    user_write(&child, &arena, va, b'C');
    assert_eq!(user_read(&parent, &arena, va), b'B');
    assert_eq!(user_read(&child, &arena, va), b'C');
}

#[test]
fn test_read_without_backing_observes_zeros() {
    let arena = HeapFrameArena::new(16);
    let wq = WorkQueue::new();
    let aspace = AddressSpace::create(arena.clone());
    let (_backing, frontal) = create_managed_pair(arena.clone(), PAGE_SIZE).unwrap();
    let va = aspace
        .space()
        .map(MemorySlice::covering(frontal), None, 0, PAGE_SIZE,
            MapFlags::PROT_READ | MapFlags::DONT_REQUIRE_BACKING)
        .unwrap();

    // The read fault resolves without any pager request; the zero frame is
    // mapped read-only.
    let outcome = fault(&aspace, &wq, va, FaultFlags::empty());
    assert!(outcome.resolved);
    assert_eq!(user_read(&aspace, &arena, va + 99), 0);
    assert_eq!(
        aspace.table().translate(va),
        Some(arena.zero_frame())
    );
}

#[test]
fn test_lock_pairs_keep_page_resident() {
    let arena = HeapFrameArena::new(16);
    let wq = WorkQueue::new();
    let (backing, frontal) = create_managed_pair(arena, PAGE_SIZE).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let c = counter.clone();
        frontal.lock_range(0, PAGE_SIZE, LockRangeNode::new(&wq, move |r| {
            r.unwrap();
            c.fetch_add(1, Ordering::Relaxed);
        }));
    }
    let taken = Arc::new(Mutex::new(None));
    let t = taken.clone();
    backing.submit_manage(ManageNode::new(&wq, move |r| *t.lock() = Some(r.unwrap())));
    wq.drain();
    backing.complete_load(0, PAGE_SIZE).unwrap();
    wq.drain();
    assert_eq!(counter.load(Ordering::Relaxed), 2);

    // One unlock leaves the page pinned; eviction skips it.
    frontal.unlock_range(0, PAGE_SIZE);
    backing.evict_range(0, PAGE_SIZE, Completion::new(&wq, |r: Result| r.unwrap()));
    wq.drain();
    assert!(frontal.peek_range(0).is_resident());

    // The second unlock releases the pin.
    frontal.unlock_range(0, PAGE_SIZE);
    backing.evict_range(0, PAGE_SIZE, Completion::new(&wq, |r: Result| r.unwrap()));
    wq.drain();
    assert!(!frontal.peek_range(0).is_resident());
}

#[test]
fn test_space_partition_invariant() {
    let arena = HeapFrameArena::new(32);
    let wq = WorkQueue::new();
    let aspace = AddressSpace::create(arena.clone());
    let space = aspace.space();
    let (lower, upper) = {
        let holes = space.hole_ranges();
        assert_eq!(holes.len(), 1);
        (holes[0].0, holes[0].0 + holes[0].1)
    };

    let audit = |space: &Arc<crate::vm::aspace::VirtualSpace>| {
        let mut spans: Vec<(VAddr, usize)> = space.hole_ranges();
        spans.extend(space.mapping_ranges());
        spans.sort_unstable();
        let mut cursor = lower;
        for (address, length) in spans {
            assert_eq!(address, cursor, "gap or overlap at {cursor:#x}");
            cursor = address + length;
        }
        assert_eq!(cursor, upper);
    };

    let mut mapped = Vec::new();
    for i in 0..5 {
        let view = AllocatedMemory::new(arena.clone(), (i + 1) * PAGE_SIZE).unwrap();
        let flags = if i % 2 == 0 {
            MapFlags::PROT_READ | MapFlags::PREFER_BOTTOM
        } else {
            MapFlags::PROT_READ
        };
        let va = space
            .map(MemorySlice::covering(view), None, 0, (i + 1) * PAGE_SIZE, flags)
            .unwrap();
        mapped.push((va, (i + 1) * PAGE_SIZE));
        audit(space);
    }
    for (va, size) in mapped {
        space.unmap(va, size, Completion::new(&wq, |r: Result| r.unwrap()));
        wq.drain();
        audit(space);
    }
    assert_eq!(space.hole_ranges().len(), 1);
}
