// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Page Fault Entry
//!
//! The architecture trap handler decodes its fault frame into a virtual
//! address and a [`FaultFlags`] access kind, then hands both to the space
//! of the interrupted thread. Resolution is asynchronous: the handler
//! suspends the thread on a [`FaultNode`] and resumes it from the work
//! queue once the page is installed.
//!
//! # Page Fault Handling Flow
//!
//! ```text
//! 1. Fault trap decodes address and access kind
//! 2. Space lookup finds the covering mapping
//! 3. Permission check against the mapping flags
//! 4. The view (or CoW chain) supplies the page
//! 5. The entry is installed and the thread resumes
//! ```
//!
//! An unresolved outcome is surfaced to user space as a fault observation;
//! the thread stays suspended until a supervisor resumes or kills it.

use crate::sync::{Completion, WorkQueue};
use crate::types::VAddr;
use crate::vm::aspace::VirtualSpace;
use alloc::sync::Arc;
use bitflags::bitflags;

bitflags! {
    /// Access kind of a fault; a read fault carries no bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultFlags: u32 {
        /// Fault on a store
        const WRITE = 1 << 0;
        /// Fault on an instruction fetch
        const EXECUTE = 1 << 1;
    }
}

/// Result of a fault resolution attempt
#[derive(Debug, Clone, Copy)]
pub struct FaultOutcome {
    /// The fault was resolved and the thread may retry the access
    pub resolved: bool,
    /// A concurrent resolver had already installed the page
    pub spurious: bool,
}

impl FaultOutcome {
    pub fn unresolved() -> Self {
        Self {
            resolved: false,
            spurious: false,
        }
    }
}

/// Pending fault resolution
pub struct FaultNode {
    completion: Completion<FaultOutcome>,
}

impl FaultNode {
    pub fn new(
        queue: &Arc<WorkQueue>,
        func: impl FnOnce(FaultOutcome) + Send + 'static,
    ) -> Self {
        Self {
            completion: Completion::new(queue, func),
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        self.completion.queue().clone()
    }

    pub fn complete(self, outcome: FaultOutcome) {
        self.completion.post(outcome);
    }
}

/// Resolve a fault against `space`
pub fn handle_page_fault(
    space: &Arc<VirtualSpace>,
    address: VAddr,
    flags: FaultFlags,
    node: FaultNode,
) {
    space.handle_fault(address, flags, node);
}
