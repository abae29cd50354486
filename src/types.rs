// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Common type aliases used throughout the crate

/// Virtual address type
pub type VAddr = usize;

/// Physical address type
pub type PAddr = u64;

/// Sentinel for "no physical address"
///
/// Returned by `peek_range` for pages that are not currently resident and
/// by the frame provider when allocation fails.
pub const INVALID_PADDR: PAddr = PAddr::MAX;

/// Handle type
pub type Handle = u32;

/// CPU ID type
pub type CpuId = u32;

/// Error code type (negative values indicate errors)
pub type Status = i32;
