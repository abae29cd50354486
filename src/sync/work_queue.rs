// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Work Queue
//!
//! This module provides the per-thread work queue and the completion
//! protocol used by every suspending operation in the crate.
//!
//! # Design
//!
//! - **Continuation passing**: a suspending operation takes a node that
//!   owns a [`Completion`]; the component finishing the operation posts the
//!   completion instead of calling it on its own stack
//! - **Single dispatcher**: completions only ever run from `drain()`, when
//!   the owning thread returns to its kernel loop
//! - **Order preserving**: posts are observed in program order by the
//!   target queue
//!
//! No component may assume that a completion runs on the same CPU or stack
//! as the poster.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use spin::Mutex;

/// A unit of deferred work
pub type Worklet = Box<dyn FnOnce() + Send>;

/// Per-thread queue of continuations
///
/// Producers on any CPU may post; the owning thread drains.
pub struct WorkQueue {
    queue: Mutex<VecDeque<Worklet>>,
}

impl WorkQueue {
    /// Create a new, empty work queue
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
        })
    }

    /// Enqueue a continuation
    pub fn post(&self, work: impl FnOnce() + Send + 'static) {
        self.queue.lock().push_back(Box::new(work));
    }

    /// Check whether the queue currently holds no work
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Run continuations until the queue is empty
    ///
    /// Continuations may post further work to this queue; the drain keeps
    /// going until nothing is left. Returns the number of continuations run.
    pub fn drain(&self) -> usize {
        let mut ran = 0;
        loop {
            let work = self.queue.lock().pop_front();
            match work {
                Some(work) => {
                    work();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

/// Completion half of a pending-request node
///
/// Owns the continuation and the queue it must be posted to. Completing
/// consumes the node, so every pending operation finishes exactly once.
pub struct Completion<T> {
    queue: Arc<WorkQueue>,
    func: Box<dyn FnOnce(T) + Send>,
}

impl<T: Send + 'static> Completion<T> {
    /// Build a completion targeting `queue`
    pub fn new(queue: &Arc<WorkQueue>, func: impl FnOnce(T) + Send + 'static) -> Self {
        Self {
            queue: queue.clone(),
            func: Box::new(func),
        }
    }

    /// The queue this completion posts to
    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Post the continuation with its result
    pub fn post(self, value: T) {
        let Completion { queue, func } = self;
        queue.post(move || func(value));
    }
}
