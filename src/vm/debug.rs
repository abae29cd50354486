// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! VM Debugging Utilities
//!
//! This module provides consistency checks and human-readable dumps for
//! address spaces:
//! - Layout audit: holes and mappings must partition the managed range
//! - RSS audit: the resident set size must equal the installed entries
//! - Space report: one-line-per-range snapshot for the kernel console

use crate::types::VAddr;
use crate::vm::aspace::{AddressSpace, VirtualSpace};
use crate::vm::layout::PAGE_SIZE;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use log::error;

/// Check that holes and mappings partition the managed range exactly
///
/// Logs the first violation found and returns whether the layout is sound.
pub fn verify_layout(space: &VirtualSpace) -> bool {
    let (lower, upper) = space.managed_range();
    let mut spans: Vec<(VAddr, usize, bool)> = space
        .hole_ranges()
        .into_iter()
        .map(|(address, length)| (address, length, true))
        .collect();
    spans.extend(
        space
            .mapping_ranges()
            .into_iter()
            .map(|(address, length)| (address, length, false)),
    );
    spans.sort_unstable();

    let mut cursor = lower;
    for (address, length, _) in &spans {
        if *address != cursor {
            if *address > cursor {
                error!("vm: layout gap at {cursor:#x}..{address:#x}");
            } else {
                error!("vm: layout overlap at {address:#x}");
            }
            return false;
        }
        cursor = address + length;
    }
    if cursor != upper {
        error!("vm: layout ends at {cursor:#x}, expected {upper:#x}");
        return false;
    }
    true
}

/// Check that the space's RSS matches the installed page-table entries
pub fn verify_rss(aspace: &AddressSpace) -> bool {
    let rss = aspace.space().rss();
    let installed = aspace.table().mapped_pages() * PAGE_SIZE;
    if rss != installed {
        error!("vm: rss {rss:#x} disagrees with page table {installed:#x}");
        return false;
    }
    true
}

/// Render a snapshot of the space layout
pub fn space_report(space: &VirtualSpace) -> String {
    let (lower, upper) = space.managed_range();
    let mut report = format!(
        "space {:#x}..{:#x} rss {} KiB\n",
        lower,
        upper,
        space.rss() / 1024
    );
    let mut spans: Vec<(VAddr, usize, &str)> = space
        .hole_ranges()
        .into_iter()
        .map(|(address, length)| (address, length, "hole"))
        .collect();
    spans.extend(
        space
            .mapping_ranges()
            .into_iter()
            .map(|(address, length)| (address, length, "mapping")),
    );
    spans.sort_unstable();
    for (address, length, kind) in spans {
        report.push_str(&format!(
            "  {:#014x}..{:#014x} {}\n",
            address,
            address + length,
            kind
        ));
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::layout::MapFlags;
    use crate::vm::pmm::HeapFrameArena;
    use crate::vm::view::{AllocatedMemory, MemorySlice};

    #[test]
    fn test_fresh_space_passes_audit() {
        let arena = HeapFrameArena::new(8);
        let aspace = AddressSpace::create(arena);
        assert!(verify_layout(aspace.space()));
        assert!(verify_rss(&aspace));
    }

    #[test]
    fn test_report_lists_mappings() {
        let arena = HeapFrameArena::new(8);
        let aspace = AddressSpace::create(arena.clone());
        let view = AllocatedMemory::new(arena, 2 * PAGE_SIZE).unwrap();
        aspace
            .space()
            .map(MemorySlice::covering(view), None, 0, 2 * PAGE_SIZE, MapFlags::PROT_READ)
            .unwrap();

        assert!(verify_layout(aspace.space()));
        let report = space_report(aspace.space());
        assert!(report.contains("mapping"));
        assert!(report.contains("hole"));
    }
}
