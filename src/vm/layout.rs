// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Virtual Address Layout
//!
//! This module defines the page geometry, the managed user range and the
//! flag types shared by the mapping and page-table layers.

use crate::types::VAddr;
use bitflags::bitflags;

/// Page size in bytes
pub const PAGE_SIZE: usize = 4096;

/// Page size shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

/// Mask for the offset within a page
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Lowest address handed out to user mappings
pub const USER_LOWER: VAddr = 0x10_0000;

/// One past the highest address handed out to user mappings
pub const USER_UPPER: VAddr = 0x7fff_fff0_0000;

/// Align an address down to a page boundary
pub const fn page_align_down(addr: usize) -> usize {
    addr & !PAGE_MASK
}

/// Align an address up to a page boundary
pub const fn page_align_up(addr: usize) -> usize {
    (addr + PAGE_MASK) & !PAGE_MASK
}

/// Check if an address is page-aligned
pub const fn is_page_aligned(addr: usize) -> bool {
    addr & PAGE_MASK == 0
}

bitflags! {
    /// Flags accepted by `map` and `protect`
    ///
    /// Carries the requested protection, the placement policy and the fork
    /// disposition of the new mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Readable
        const PROT_READ = 1 << 0;
        /// Writable
        const PROT_WRITE = 1 << 1;
        /// Executable
        const PROT_EXECUTE = 1 << 2;

        /// Map at the given address, which must lie inside a single hole
        const FIXED = 1 << 3;
        /// Allocate at the bottom of the managed range
        const PREFER_BOTTOM = 1 << 4;
        /// Allocate at the top of the managed range
        const PREFER_TOP = 1 << 5;

        /// A read fault on an absent cache page maps the zero frame instead
        /// of triggering a pager request
        const DONT_REQUIRE_BACKING = 1 << 6;

        /// The mapping is not carried into forked spaces
        const DROP_AT_FORK = 1 << 7;
        /// Forked spaces share the mapping
        const SHARE_AT_FORK = 1 << 8;
        /// Forked spaces get a copy-on-write branch of the mapping
        const COPY_ON_WRITE_AT_FORK = 1 << 9;
    }
}

bitflags! {
    /// Normalized per-mapping flags
    ///
    /// Produced from [`MapFlags`] by permission normalization: write implies
    /// read, execute implies read, write+execute is preserved as RWX.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MappingFlags: u32 {
        const PROT_READ = 1 << 0;
        const PROT_WRITE = 1 << 1;
        const PROT_EXECUTE = 1 << 2;
        const DONT_REQUIRE_BACKING = 1 << 3;
        const DROP_AT_FORK = 1 << 4;
        const SHARE_AT_FORK = 1 << 5;
        const COPY_ON_WRITE_AT_FORK = 1 << 6;
    }
}

impl MappingFlags {
    /// The protection bits only
    pub const PERMISSION_MASK: Self = Self::PROT_READ
        .union(Self::PROT_WRITE)
        .union(Self::PROT_EXECUTE);
}

bitflags! {
    /// Page-table entry permissions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

bitflags! {
    /// Status bits returned by `unmap_single_page`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageStatus: u32 {
        /// The entry was present before the unmap
        const PRESENT = 1 << 0;
        /// The entry had accumulated a hardware dirty bit
        const DIRTY = 1 << 1;
    }
}

/// Caching mode installed into the page-table entry for a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachingMode {
    /// Default write-back caching
    WriteBack,
    /// Write-combining (framebuffers and similar streams)
    WriteCombine,
    /// Uncached access (device registers)
    Uncached,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(page_align_down(0x1fff), 0x1000);
        assert_eq!(page_align_up(0x1001), 0x2000);
        assert_eq!(page_align_up(0x1000), 0x1000);
        assert!(is_page_aligned(0x3000));
        assert!(!is_page_aligned(0x3001));
    }

    #[test]
    fn test_permission_mask() {
        let flags = MappingFlags::PROT_READ | MappingFlags::DONT_REQUIRE_BACKING;
        assert_eq!(
            flags & MappingFlags::PERMISSION_MASK,
            MappingFlags::PROT_READ
        );
    }
}
