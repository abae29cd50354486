// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Kernel Object Layer
//!
//! Resources cross the syscall boundary as handles naming descriptors in a
//! per-universe handle table.

pub mod handle;

pub use handle::{Descriptor, EventQueue, HandleEvent, HandleTable};
