// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Handle Table
//!
//! This module implements the descriptor table behind the memory syscall
//! surface. Handles are dense `u32` capabilities; every syscall validates
//! the handle and the descriptor kind before touching the object.
//!
//! # Design
//!
//! - **Typed rejects**: a missing slot reports `NoDescriptor`, a slot of
//!   the wrong kind reports `BadDescriptor`
//! - **Reference counted**: descriptors hold strong references; closing the
//!   last handle to a backing view is what makes its pager disappear

use crate::errors::{Error, Result};
use crate::types::Handle;
use crate::vm::aspace::AddressSpace;
use crate::vm::managed::ManageRequest;
use crate::vm::view::{MemorySlice, MemoryView};
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use spin::Mutex;

/// Completion event delivered to a user queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleEvent {
    /// A manage request for the pager, or the cache's refusal
    Manage {
        context: usize,
        result: Result<ManageRequest>,
    },
    /// A lock request resolved
    LockResult { context: usize, status: Result },
}

/// Queue of completion events polled by user space
pub struct EventQueue {
    events: Mutex<VecDeque<HandleEvent>>,
}

impl EventQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(VecDeque::new()),
        })
    }

    pub fn push(&self, event: HandleEvent) {
        self.events.lock().push_back(event);
    }

    pub fn pop(&self) -> Option<HandleEvent> {
        self.events.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

/// A kernel object reachable through a handle
#[derive(Clone)]
pub enum Descriptor {
    /// A memory view (allocated, hardware, backing or frontal)
    Memory(Arc<dyn MemoryView>),
    /// A slice of a view
    Slice(Arc<MemorySlice>),
    /// An address space
    Space(Arc<AddressSpace>),
    /// An event queue
    Queue(Arc<EventQueue>),
}

impl core::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Descriptor::Memory(_) => f.write_str("Descriptor::Memory"),
            Descriptor::Slice(_) => f.write_str("Descriptor::Slice"),
            Descriptor::Space(_) => f.write_str("Descriptor::Space"),
            Descriptor::Queue(_) => f.write_str("Descriptor::Queue"),
        }
    }
}

struct TableInner {
    slots: BTreeMap<Handle, Descriptor>,
    next: Handle,
}

/// Per-universe descriptor table
pub struct HandleTable {
    inner: Mutex<TableInner>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                slots: BTreeMap::new(),
                next: 1,
            }),
        }
    }

    /// Attach a descriptor and return its handle
    pub fn attach(&self, descriptor: Descriptor) -> Handle {
        let mut inner = self.inner.lock();
        let handle = inner.next;
        inner.next += 1;
        inner.slots.insert(handle, descriptor);
        handle
    }

    /// Look up a descriptor
    pub fn get(&self, handle: Handle) -> Result<Descriptor> {
        self.inner
            .lock()
            .slots
            .get(&handle)
            .cloned()
            .ok_or(Error::NoDescriptor)
    }

    /// Remove a descriptor, dropping the table's reference
    pub fn detach(&self, handle: Handle) -> Result<Descriptor> {
        self.inner
            .lock()
            .slots
            .remove(&handle)
            .ok_or(Error::NoDescriptor)
    }

    /// Number of live handles
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().slots.is_empty()
    }

    pub fn get_memory(&self, handle: Handle) -> Result<Arc<dyn MemoryView>> {
        match self.get(handle)? {
            Descriptor::Memory(view) => Ok(view),
            _ => Err(Error::BadDescriptor),
        }
    }

    pub fn get_slice(&self, handle: Handle) -> Result<Arc<MemorySlice>> {
        match self.get(handle)? {
            Descriptor::Slice(slice) => Ok(slice),
            _ => Err(Error::BadDescriptor),
        }
    }

    pub fn get_space(&self, handle: Handle) -> Result<Arc<AddressSpace>> {
        match self.get(handle)? {
            Descriptor::Space(space) => Ok(space),
            _ => Err(Error::BadDescriptor),
        }
    }

    pub fn get_queue(&self, handle: Handle) -> Result<Arc<EventQueue>> {
        match self.get(handle)? {
            Descriptor::Queue(queue) => Ok(queue),
            _ => Err(Error::BadDescriptor),
        }
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_and_typed_lookup() {
        let table = HandleTable::new();
        let queue = EventQueue::new();
        let handle = table.attach(Descriptor::Queue(queue));

        assert!(table.get_queue(handle).is_ok());
        assert_eq!(table.get_memory(handle).unwrap_err(), Error::BadDescriptor);
        assert_eq!(table.get(handle + 1).unwrap_err(), Error::NoDescriptor);
    }

    #[test]
    fn test_detach_removes_slot() {
        let table = HandleTable::new();
        let handle = table.attach(Descriptor::Queue(EventQueue::new()));
        assert_eq!(table.len(), 1);

        table.detach(handle).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.detach(handle).unwrap_err(), Error::NoDescriptor);
    }

    #[test]
    fn test_handles_are_not_reused() {
        let table = HandleTable::new();
        let first = table.attach(Descriptor::Queue(EventQueue::new()));
        table.detach(first).unwrap();
        let second = table.attach(Descriptor::Queue(EventQueue::new()));
        assert_ne!(first, second);
    }

    #[test]
    fn test_event_queue_order() {
        let queue = EventQueue::new();
        queue.push(HandleEvent::LockResult {
            context: 1,
            status: Ok(()),
        });
        queue.push(HandleEvent::LockResult {
            context: 2,
            status: Err(Error::PagerGone),
        });
        assert_eq!(queue.len(), 2);
        assert_eq!(
            queue.pop(),
            Some(HandleEvent::LockResult {
                context: 1,
                status: Ok(())
            })
        );
        assert_eq!(
            queue.pop(),
            Some(HandleEvent::LockResult {
                context: 2,
                status: Err(Error::PagerGone)
            })
        );
        assert!(queue.pop().is_none());
    }
}
