// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Memory Syscalls
//!
//! The operation surface the kernel exposes for address spaces and memory
//! objects. Every call validates its handles against the universe's table
//! first; asynchronous operations either take a caller continuation or
//! deliver their completion to an event queue named by handle.

use crate::errors::{Error, Result};
use crate::object::{Descriptor, EventQueue, HandleEvent, HandleTable};
use crate::sync::{Completion, WorkQueue};
use crate::types::{Handle, PAddr, VAddr};
use crate::vm::aspace::{AcquireNode, AddressSpace, SpaceLockHandle};
use crate::vm::layout::{CachingMode, MapFlags, PAGE_MASK, PAGE_SIZE};
use crate::vm::managed::{create_managed_pair, ManageNode};
use crate::vm::pmm::FrameProvider;
use crate::vm::view::{AllocatedMemory, HardwareMemory, LockRangeNode, MemorySlice};
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;

bitflags! {
    /// Flags accepted by `allocate_memory`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Back the view with one physically contiguous chunk
        const CONTIGUOUS = 1 << 0;
        /// Allocate frames lazily on first access
        const ON_DEMAND = 1 << 1;
    }
}

/// The per-process view of the kernel: a handle table, a frame provider
/// and the work queue completions are dispatched on
pub struct Universe {
    provider: Arc<dyn FrameProvider>,
    handles: HandleTable,
    queue: Arc<WorkQueue>,
}

impl Universe {
    pub fn new(provider: Arc<dyn FrameProvider>) -> Arc<Self> {
        Arc::new(Self {
            provider,
            handles: HandleTable::new(),
            queue: WorkQueue::new(),
        })
    }

    /// The queue completions of this universe are posted to
    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    /// Create an empty address space
    pub fn create_space(&self) -> Result<Handle> {
        let space = AddressSpace::create(self.provider.clone());
        Ok(self.handles.attach(Descriptor::Space(space)))
    }

    /// Fork a space, honoring per-mapping fork dispositions
    pub fn fork_space(
        self: &Arc<Self>,
        space: Handle,
        callback: impl FnOnce(Result<Handle>) + Send + 'static,
    ) -> Result {
        let space = self.handles.get_space(space)?;
        let this = self.clone();
        space.fork(Completion::new(&self.queue, move |result: Result<Arc<AddressSpace>>| {
            callback(result.map(|child| this.handles.attach(Descriptor::Space(child))));
        }));
        Ok(())
    }

    /// Allocate an anonymous view
    pub fn allocate_memory(&self, size: usize, flags: AllocFlags) -> Result<Handle> {
        let view = if flags.contains(AllocFlags::CONTIGUOUS) {
            AllocatedMemory::new_contiguous(self.provider.clone(), size, 64)?
        } else {
            AllocatedMemory::new(self.provider.clone(), size)?
        };
        Ok(self.handles.attach(Descriptor::Memory(view)))
    }

    /// Expose a fixed physical range (device BARs) as a view
    pub fn access_physical(
        &self,
        physical: PAddr,
        size: usize,
        caching: CachingMode,
    ) -> Result<Handle> {
        let view = HardwareMemory::new(physical, size, caching)?;
        Ok(self.handles.attach(Descriptor::Memory(view)))
    }

    /// Create a managed cache; the pager keeps `backing`, clients map
    /// `frontal`
    pub fn create_managed_memory(&self, size: usize) -> Result<(Handle, Handle)> {
        let (backing, frontal) = create_managed_pair(self.provider.clone(), size)?;
        let backing = self.handles.attach(Descriptor::Memory(backing));
        let frontal = self.handles.attach(Descriptor::Memory(frontal));
        Ok((backing, frontal))
    }

    /// Grow or shrink an allocated view
    pub fn resize_memory(&self, memory: Handle, new_size: usize) -> Result {
        self.handles.get_memory(memory)?.resize(new_size, &self.queue)
    }

    /// Create a slice of a view
    pub fn create_slice_view(
        &self,
        memory: Handle,
        offset: usize,
        size: usize,
    ) -> Result<Handle> {
        let view = self.handles.get_memory(memory)?;
        let slice = MemorySlice::new(view, offset, size)?;
        Ok(self.handles.attach(Descriptor::Slice(slice)))
    }

    /// Map a slice (or a whole view) into a space
    ///
    /// Returns the chosen virtual address.
    pub fn map_memory(
        &self,
        space: Handle,
        memory: Handle,
        address: Option<VAddr>,
        offset: usize,
        size: usize,
        flags: MapFlags,
    ) -> Result<VAddr> {
        let slice = match self.handles.get(memory)? {
            Descriptor::Slice(slice) => slice,
            Descriptor::Memory(view) => MemorySlice::covering(view),
            _ => return Err(Error::BadDescriptor),
        };
        let space = self.handles.get_space(space)?;
        let flags = if address.is_some() {
            flags | MapFlags::FIXED
        } else if flags.contains(MapFlags::PREFER_BOTTOM) {
            flags
        } else {
            flags | MapFlags::PREFER_TOP
        };
        space.space().map(slice, address, offset, size, flags)
    }

    /// Unmap exactly one mapping; completes via the caller continuation
    pub fn unmap_memory(
        &self,
        space: Handle,
        address: VAddr,
        size: usize,
        callback: impl FnOnce(Result) + Send + 'static,
    ) -> Result {
        let space = self.handles.get_space(space)?;
        space
            .space()
            .unmap(address, size, Completion::new(&self.queue, callback));
        Ok(())
    }

    /// Change the protection of exactly one mapping
    pub fn protect_memory(
        &self,
        space: Handle,
        address: VAddr,
        size: usize,
        flags: MapFlags,
        callback: impl FnOnce(Result) + Send + 'static,
    ) -> Result {
        let space = self.handles.get_space(space)?;
        space
            .space()
            .protect(address, size, flags, Completion::new(&self.queue, callback));
        Ok(())
    }

    /// Park a manage-request slot; the pager's queue receives one
    /// `Initialize` or `Writeback` event per submission
    pub fn submit_manage_memory(
        &self,
        memory: Handle,
        queue: Handle,
        context: usize,
    ) -> Result {
        let view = self.handles.get_memory(memory)?;
        let events = self.handles.get_queue(queue)?;
        view.submit_manage(ManageNode::new(&self.queue, move |result| {
            events.push(HandleEvent::Manage { context, result });
        }));
        Ok(())
    }

    /// Resolve an outstanding initialize or writeback
    pub fn complete_load(&self, memory: Handle, offset: usize, size: usize) -> Result {
        self.handles.get_memory(memory)?.complete_load(offset, size)
    }

    /// Lock a range of a view; completion lands on the event queue
    pub fn submit_lock_memory(
        &self,
        memory: Handle,
        offset: usize,
        size: usize,
        queue: Handle,
        context: usize,
    ) -> Result {
        let view = self.handles.get_memory(memory)?;
        let events = self.handles.get_queue(queue)?;
        view.lock_range(
            offset,
            size,
            LockRangeNode::new(&self.queue, move |status| {
                events.push(HandleEvent::LockResult { context, status });
            }),
        );
        Ok(())
    }

    /// Create an event queue for manage and lock completions
    pub fn create_queue(&self) -> Handle {
        self.handles.attach(Descriptor::Queue(EventQueue::new()))
    }

    /// Resolve a virtual address to its physical address
    ///
    /// Locks and populates the containing page first; the translation is
    /// only guaranteed stable for short-lived DMA setup while no eviction
    /// intervenes.
    pub fn pointer_physical(
        &self,
        space: Handle,
        pointer: VAddr,
        callback: impl FnOnce(Result<PAddr>) + Send + 'static,
    ) -> Result {
        let space = self.handles.get_space(space)?;
        let misalign = pointer & PAGE_MASK;
        let handle = SpaceLockHandle::new(space.space(), pointer - misalign, PAGE_SIZE)?;
        let resolver = handle.clone();
        handle.acquire(AcquireNode::new(&self.queue, move |result| {
            callback(result.and_then(|()| {
                resolver.get_physical(misalign).ok_or(Error::Fault)
            }));
        }));
        Ok(())
    }

    /// Hint that a range of a view is about to be used
    ///
    /// Managed views start populating immediately; the caller is not
    /// notified of completion.
    pub fn loadahead(&self, memory: Handle, offset: usize, size: usize) -> Result {
        self.handles.get_memory(memory)?.load_ahead(offset, size)
    }

    /// Copy bytes out of another space
    ///
    /// Locks and populates the window first, so the copy may suspend on the
    /// space's pager.
    pub fn load_foreign(
        &self,
        space: Handle,
        address: VAddr,
        length: usize,
        callback: impl FnOnce(Result<Vec<u8>>) + Send + 'static,
    ) -> Result {
        let space = self.handles.get_space(space)?;
        let handle = SpaceLockHandle::new(space.space(), address, length)?;
        let reader = handle.clone();
        handle.acquire(AcquireNode::new(&self.queue, move |result| {
            callback(result.map(|()| {
                let mut buffer = alloc::vec![0u8; length];
                reader.load(0, &mut buffer);
                buffer
            }));
        }));
        Ok(())
    }

    /// Copy bytes into another space
    pub fn store_foreign(
        &self,
        space: Handle,
        address: VAddr,
        data: Vec<u8>,
        callback: impl FnOnce(Result) + Send + 'static,
    ) -> Result {
        let space = self.handles.get_space(space)?;
        let handle = SpaceLockHandle::new(space.space(), address, data.len())?;
        let writer = handle.clone();
        handle.acquire(AcquireNode::new(&self.queue, move |result| {
            callback(result.and_then(|()| writer.write(0, &data)));
        }));
        Ok(())
    }

    /// Drop a handle
    ///
    /// Closing the last handle to a backing view makes its pager disappear;
    /// pending lock and fetch requests fail with `PagerGone`.
    pub fn close(&self, handle: Handle) -> Result {
        self.handles.detach(handle).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::layout::PAGE_SIZE;
    use crate::vm::managed::{ManageKind, ManageRequest};
    use crate::vm::pmm::HeapFrameArena;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicBool, Ordering};
    use spin::Mutex;

    fn universe() -> Arc<Universe> {
        Universe::new(HeapFrameArena::new(32))
    }

    #[test]
    fn test_map_unmap_round_trip() {
        let u = universe();
        let space = u.create_space().unwrap();
        let memory = u.allocate_memory(2 * PAGE_SIZE, AllocFlags::ON_DEMAND).unwrap();

        let va = u
            .map_memory(space, memory, None, 0, 2 * PAGE_SIZE,
                MapFlags::PROT_READ | MapFlags::PROT_WRITE)
            .unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let d = done.clone();
        u.unmap_memory(space, va, 2 * PAGE_SIZE, move |r| {
            r.unwrap();
            d.store(true, Ordering::Relaxed);
        })
        .unwrap();
        u.queue().drain();
        assert!(done.load(Ordering::Relaxed));
    }

    #[test]
    fn test_bad_handles_are_rejected() {
        let u = universe();
        let space = u.create_space().unwrap();
        assert_eq!(u.create_slice_view(777, 0, PAGE_SIZE).unwrap_err(), Error::NoDescriptor);
        assert_eq!(
            u.map_memory(space, space, None, 0, PAGE_SIZE, MapFlags::PROT_READ)
                .unwrap_err(),
            Error::BadDescriptor
        );
    }

    #[test]
    fn test_map_beyond_slice_is_buffer_too_small() {
        let u = universe();
        let space = u.create_space().unwrap();
        let memory = u.allocate_memory(2 * PAGE_SIZE, AllocFlags::ON_DEMAND).unwrap();
        let slice = u.create_slice_view(memory, 0, PAGE_SIZE).unwrap();
        assert_eq!(
            u.map_memory(space, slice, None, 0, 2 * PAGE_SIZE, MapFlags::PROT_READ)
                .unwrap_err(),
            Error::BufferTooSmall
        );
    }

    #[test]
    fn test_managed_memory_protocol() {
        let u = universe();
        let (backing, frontal) = u.create_managed_memory(2 * PAGE_SIZE).unwrap();
        let events = u.create_queue();

        u.submit_manage_memory(backing, events, 7).unwrap();
        u.submit_lock_memory(frontal, 0, 2 * PAGE_SIZE, events, 8).unwrap();
        u.queue().drain();

        let queue = u.handles().get_queue(events).unwrap();
        assert_eq!(
            queue.pop(),
            Some(HandleEvent::Manage {
                context: 7,
                result: Ok(ManageRequest {
                    kind: ManageKind::Initialize,
                    offset: 0,
                    length: 2 * PAGE_SIZE,
                }),
            })
        );
        assert!(queue.is_empty());

        u.complete_load(backing, 0, 2 * PAGE_SIZE).unwrap();
        u.queue().drain();
        assert_eq!(
            queue.pop(),
            Some(HandleEvent::LockResult { context: 8, status: Ok(()) })
        );
    }

    #[test]
    fn test_closing_backing_handle_kills_pager() {
        let u = universe();
        let (backing, frontal) = u.create_managed_memory(PAGE_SIZE).unwrap();
        let events = u.create_queue();

        u.submit_lock_memory(frontal, 0, PAGE_SIZE, events, 1).unwrap();
        u.queue().drain();

        u.close(backing).unwrap();
        u.queue().drain();

        let queue = u.handles().get_queue(events).unwrap();
        assert_eq!(
            queue.pop(),
            Some(HandleEvent::LockResult {
                context: 1,
                status: Err(Error::PagerGone),
            })
        );
    }

    #[test]
    fn test_pointer_physical_resolves() {
        let u = universe();
        let space = u.create_space().unwrap();
        let memory = u.allocate_memory(PAGE_SIZE, AllocFlags::ON_DEMAND).unwrap();
        let va = u
            .map_memory(space, memory, None, 0, PAGE_SIZE,
                MapFlags::PROT_READ | MapFlags::PROT_WRITE)
            .unwrap();

        let got = Arc::new(Mutex::new(None));
        let g = got.clone();
        u.pointer_physical(space, va + 123, move |r| *g.lock() = Some(r))
            .unwrap();
        u.queue().drain();

        let pa = got.lock().take().unwrap().unwrap();
        assert_eq!(pa & 0xfff, 123);
    }

    #[test]
    fn test_foreign_access_round_trip() {
        let u = universe();
        let space = u.create_space().unwrap();
        let memory = u.allocate_memory(PAGE_SIZE, AllocFlags::ON_DEMAND).unwrap();
        let va = u
            .map_memory(space, memory, None, 0, PAGE_SIZE,
                MapFlags::PROT_READ | MapFlags::PROT_WRITE)
            .unwrap();

        let stored = Arc::new(AtomicBool::new(false));
        let s = stored.clone();
        u.store_foreign(space, va + 64, b"cross-space bytes".to_vec(), move |r| {
            r.unwrap();
            s.store(true, Ordering::Relaxed);
        })
        .unwrap();
        u.queue().drain();
        assert!(stored.load(Ordering::Relaxed));

        let loaded = Arc::new(Mutex::new(None));
        let l = loaded.clone();
        u.load_foreign(space, va + 64, 17, move |r| *l.lock() = Some(r))
            .unwrap();
        u.queue().drain();
        assert_eq!(
            loaded.lock().take().unwrap().unwrap(),
            b"cross-space bytes".to_vec()
        );
    }

    #[test]
    fn test_loadahead_is_fire_and_forget() {
        let u = universe();
        let (backing, frontal) = u.create_managed_memory(PAGE_SIZE).unwrap();
        let events = u.create_queue();
        u.submit_manage_memory(backing, events, 3).unwrap();

        u.loadahead(frontal, 0, PAGE_SIZE).unwrap();
        u.queue().drain();

        let queue = u.handles().get_queue(events).unwrap();
        match queue.pop() {
            Some(HandleEvent::Manage { context: 3, result }) => {
                let request = result.unwrap();
                assert_eq!(request.kind, ManageKind::Initialize);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_fork_space_copies_layout() {
        let u = universe();
        let space = u.create_space().unwrap();
        let memory = u.allocate_memory(PAGE_SIZE, AllocFlags::ON_DEMAND).unwrap();
        let va = u
            .map_memory(space, memory, None, 0, PAGE_SIZE,
                MapFlags::PROT_READ | MapFlags::SHARE_AT_FORK)
            .unwrap();

        let got = Arc::new(Mutex::new(None));
        let g = got.clone();
        u.fork_space(space, move |r| *g.lock() = Some(r)).unwrap();
        u.queue().drain();

        let child = got.lock().take().unwrap().unwrap();
        let child_space = u.handles().get_space(child).unwrap();
        assert_eq!(child_space.space().mapping_ranges(), alloc::vec![(va, PAGE_SIZE)]);
    }

    #[test]
    fn test_fork_drop_disposition_leaves_hole() {
        let u = universe();
        let space = u.create_space().unwrap();
        let memory = u.allocate_memory(PAGE_SIZE, AllocFlags::ON_DEMAND).unwrap();
        let parent = u.handles().get_space(space).unwrap();
        u.map_memory(space, memory, None, 0, PAGE_SIZE,
            MapFlags::PROT_READ | MapFlags::DROP_AT_FORK)
            .unwrap();

        let got = Arc::new(Mutex::new(None));
        let g = got.clone();
        u.fork_space(space, move |r| *g.lock() = Some(r)).unwrap();
        u.queue().drain();

        let child = got.lock().take().unwrap().unwrap();
        let child_space = u.handles().get_space(child).unwrap();
        assert_eq!(child_space.space().mapping_ranges(), Vec::new());
        // The dropped mapping's range is a hole again in the child, while
        // the parent keeps the mapping.
        assert_eq!(child_space.space().hole_ranges().len(), 1);
        assert_eq!(parent.space().mapping_ranges().len(), 1);
    }
}
