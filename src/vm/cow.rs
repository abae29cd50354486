// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Copy-on-Write Chains
//!
//! A CoW chain is a singly linked stack of per-page override tables. Each
//! fork pushes a fresh, empty node on top for both branches; the shared
//! suffix below holds the pages that were private before the fork.
//!
//! Resolution walks from the top node down and falls through to the
//! underlying view on a complete miss. A write fault materializes the page
//! in the faulting branch's top node, either by stealing it from the
//! immediate super node when no other branch observes that node, or by
//! copying.
//!
//! Frames overridden by a node are owned by that node and return to the
//! allocator when the node is destroyed.

use crate::types::{PAddr, INVALID_PADDR};
use crate::vm::pmm::{FrameProvider, PageAccessor};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use spin::Mutex;

/// One node of a copy-on-write chain
pub struct CowChain {
    super_chain: Option<Arc<CowChain>>,
    provider: Arc<dyn FrameProvider>,
    pages: Mutex<BTreeMap<usize, PAddr>>,
}

impl CowChain {
    /// Push a new, empty node on top of `super_chain`
    pub fn new(provider: Arc<dyn FrameProvider>, super_chain: Option<Arc<CowChain>>) -> Arc<Self> {
        Arc::new(Self {
            super_chain,
            provider,
            pages: Mutex::new(BTreeMap::new()),
        })
    }

    /// The node this one shadows
    pub fn super_chain(&self) -> Option<&Arc<CowChain>> {
        self.super_chain.as_ref()
    }

    /// Look up an override in this node only
    pub fn lookup_local(&self, offset: usize) -> Option<PAddr> {
        self.pages.lock().get(&offset).copied()
    }

    /// Resolve an override in this node or any node below it
    pub fn resolve(&self, offset: usize) -> Option<PAddr> {
        if let Some(frame) = self.lookup_local(offset) {
            return Some(frame);
        }
        self.resolve_super(offset)
    }

    /// Resolve an override strictly below this node
    pub fn resolve_super(&self, offset: usize) -> Option<PAddr> {
        let mut node = self.super_chain.as_ref();
        while let Some(chain) = node {
            if let Some(frame) = chain.lookup_local(offset) {
                return Some(frame);
            }
            node = chain.super_chain.as_ref();
        }
        None
    }

    /// Record a private override
    pub fn insert(&self, offset: usize, frame: PAddr) {
        assert_ne!(frame, INVALID_PADDR);
        let prior = self.pages.lock().insert(offset, frame);
        assert!(prior.is_none(), "double override at offset {offset:#x}");
    }

    /// Take the page out of the immediate super node if this node is its
    /// only observer
    ///
    /// Hands frame ownership to the caller without a copy; the caller
    /// inserts it locally.
    pub fn take_from_super(&self, offset: usize) -> Option<PAddr> {
        let super_chain = self.super_chain.as_ref()?;
        if Arc::strong_count(super_chain) != 1 {
            return None;
        }
        super_chain.pages.lock().remove(&offset)
    }

    /// Materialize a private copy of `offset` for a write
    ///
    /// `source` is the frame the read path currently resolves to, from a
    /// lower chain node or from the view. Returns the private frame.
    pub fn make_private(&self, offset: usize, source: PAddr) -> Option<PAddr> {
        if let Some(frame) = self.lookup_local(offset) {
            return Some(frame);
        }
        if let Some(frame) = self.take_from_super(offset) {
            self.insert(offset, frame);
            return Some(frame);
        }
        let frame = self.provider.allocate(0, 64);
        if frame == INVALID_PADDR {
            return None;
        }
        let source_page = PageAccessor::new(&*self.provider, source);
        PageAccessor::new(&*self.provider, frame).copy_from(&source_page);
        self.insert(offset, frame);
        Some(frame)
    }

    /// Number of overrides held by this node
    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }
}

impl Drop for CowChain {
    fn drop(&mut self) {
        for (_, frame) in self.pages.get_mut().iter() {
            assert_ne!(*frame, INVALID_PADDR);
            self.provider.free(*frame, 0);
        }
    }
}
