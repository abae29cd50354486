// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! TLB Shootdown
//!
//! Cross-CPU invalidation with explicit acknowledgement. Unmap, protect and
//! eviction all funnel through here: after changing page-table entries, the
//! initiator submits a [`ShootNode`] and continues only once every CPU that
//! currently uses the address space has acknowledged the invalidation.
//!
//! # Design
//!
//! - The initiating CPU invalidates locally and synchronously; only remote
//!   CPUs participate in the acknowledgement protocol
//! - A remote CPU acknowledges from its IPI handler after invalidating its
//!   TLB and executing a memory barrier
//! - The submitter's continuation runs on its work queue once the last
//!   acknowledgement arrives
//!
//! Shootdown completion happens-before the freeing of any frame whose
//! mapping the shootdown targeted; this is the single synchronization point
//! that keeps remote CPUs from reading freed frames.

use crate::sync::Completion;
use crate::types::{CpuId, VAddr};
use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use spin::Mutex;

/// Pending shootdown request
pub struct ShootNode {
    /// Base of the invalidated range
    pub address: VAddr,
    /// Length of the invalidated range
    pub size: usize,
    completion: Completion<()>,
}

impl ShootNode {
    /// Build a node covering `[address, address + size)`
    pub fn new(address: VAddr, size: usize, completion: Completion<()>) -> Self {
        Self {
            address,
            size,
            completion,
        }
    }

    /// Complete the node; the continuation is posted, not called
    pub fn complete(self) {
        self.completion.post(());
    }
}

/// Pending page-table retirement
pub struct RetireNode {
    completion: Completion<()>,
}

impl RetireNode {
    pub fn new(completion: Completion<()>) -> Self {
        Self { completion }
    }

    pub fn complete(self) {
        self.completion.post(());
    }
}

struct PendingShoot {
    waiting: BTreeSet<CpuId>,
    node: ShootNode,
}

struct HubState {
    bound: BTreeSet<CpuId>,
    pending: Vec<PendingShoot>,
}

/// Per-address-space shootdown coordinator
///
/// Tracks which remote CPUs currently have the space's translations loaded
/// and fans invalidations out to them.
pub struct ShootdownHub {
    state: Mutex<HubState>,
}

impl ShootdownHub {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HubState {
                bound: BTreeSet::new(),
                pending: Vec::new(),
            }),
        }
    }

    /// Record that `cpu` started using this space
    pub fn bind_cpu(&self, cpu: CpuId) {
        self.state.lock().bound.insert(cpu);
    }

    /// Record that `cpu` switched away from this space
    ///
    /// An unbound CPU can hold no stale translations, so this also counts
    /// as an acknowledgement of everything it still owed.
    pub fn unbind_cpu(&self, cpu: CpuId) {
        let mut state = self.state.lock();
        state.bound.remove(&cpu);
        Self::ack_locked(&mut state, cpu);
    }

    /// Submit an invalidation
    ///
    /// Completes immediately (by posting) when no remote CPU is bound.
    pub fn submit(&self, node: ShootNode) {
        let mut state = self.state.lock();
        if state.bound.is_empty() {
            drop(state);
            node.complete();
            return;
        }
        let waiting = state.bound.clone();
        state.pending.push(PendingShoot { waiting, node });
    }

    /// Acknowledge every pending invalidation on behalf of `cpu`
    ///
    /// Called from the IPI handler after the local TLB flush and barrier.
    pub fn acknowledge(&self, cpu: CpuId) {
        let mut state = self.state.lock();
        Self::ack_locked(&mut state, cpu);
    }

    fn ack_locked(state: &mut HubState, cpu: CpuId) {
        let mut finished = Vec::new();
        let mut index = 0;
        while index < state.pending.len() {
            state.pending[index].waiting.remove(&cpu);
            if state.pending[index].waiting.is_empty() {
                finished.push(state.pending.swap_remove(index));
            } else {
                index += 1;
            }
        }
        for shoot in finished {
            shoot.node.complete();
        }
    }

    /// Number of invalidations still waiting for acknowledgements
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }
}

impl Default for ShootdownHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::WorkQueue;
    use crate::vm::layout::PAGE_SIZE;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicBool, Ordering};

    fn flag_node(
        wq: &Arc<WorkQueue>,
        address: VAddr,
        size: usize,
    ) -> (ShootNode, Arc<AtomicBool>) {
        let done = Arc::new(AtomicBool::new(false));
        let d = done.clone();
        let node = ShootNode::new(
            address,
            size,
            Completion::new(wq, move |()| d.store(true, Ordering::Relaxed)),
        );
        (node, done)
    }

    #[test]
    fn test_completes_without_remote_cpus() {
        let wq = WorkQueue::new();
        let hub = ShootdownHub::new();
        let (node, done) = flag_node(&wq, 0x1000, 0x1000);

        hub.submit(node);
        assert!(!done.load(Ordering::Relaxed));
        wq.drain();
        assert!(done.load(Ordering::Relaxed));
    }

    #[test]
    fn test_waits_for_every_bound_cpu() {
        let wq = WorkQueue::new();
        let hub = ShootdownHub::new();
        hub.bind_cpu(1);
        hub.bind_cpu(2);

        let (node, done) = flag_node(&wq, 0x1000, 0x1000);
        hub.submit(node);
        wq.drain();
        assert!(!done.load(Ordering::Relaxed));

        hub.acknowledge(1);
        wq.drain();
        assert!(!done.load(Ordering::Relaxed));

        hub.acknowledge(2);
        wq.drain();
        assert!(done.load(Ordering::Relaxed));
        assert_eq!(hub.pending(), 0);
    }

    #[test]
    fn test_unbind_acts_as_acknowledgement() {
        let wq = WorkQueue::new();
        let hub = ShootdownHub::new();
        hub.bind_cpu(3);

        let (node, done) = flag_node(&wq, 0, PAGE_SIZE);
        hub.submit(node);
        hub.unbind_cpu(3);
        wq.drain();
        assert!(done.load(Ordering::Relaxed));
    }
}
