//! IOVA guard pages.
//!
//! The NPU prefetches past the end of the buffers it reads. The IOVA
//! allocator hands out addresses top-down and leaves holes between
//! allocations, so a prefetch that runs off one buffer lands on an unmapped
//! page and faults the IOMMU. Before a job runs, every page-aligned hole
//! between a session's buffers (and a fixed margin below the lowest one) is
//! backed by a single zeroed page mapped read-only. The mappings are removed
//! when the [`GuardPages`] set is dropped.

use crate::platform::{DmaAllocator, DmaMemory, IommuDomain, IommuProt};
use rknpu_chip::config::PAGE_SIZE;
use std::ops::Range;
use std::sync::Arc;

/// Address windows that need guard pages, lowest first.
///
/// `ranges` need not be sorted and may overlap. The first window is the
/// `below_pages` margin under the lowest range, present only when that
/// margin does not reach below address zero.
pub fn guard_windows(ranges: &[Range<u64>], below_pages: u64) -> Vec<Range<u64>> {
    let mut sorted: Vec<Range<u64>> = ranges.iter().filter(|r| r.start < r.end).cloned().collect();
    sorted.sort_by_key(|r| r.start);

    let Some(lowest) = sorted.first() else {
        return Vec::new();
    };

    let mut windows = Vec::new();
    let margin = below_pages * PAGE_SIZE;
    if margin > 0 && lowest.start >= margin {
        windows.push(lowest.start - margin..lowest.start);
    }

    let mut covered_to = lowest.end;
    for next in &sorted[1..] {
        let gap_start = page_ceil(covered_to);
        let gap_end = next.start & !(PAGE_SIZE - 1);
        if gap_start < gap_end {
            windows.push(gap_start..gap_end);
        }
        covered_to = covered_to.max(next.end);
    }
    windows
}

fn page_ceil(addr: u64) -> u64 {
    addr.saturating_add(PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Guard pages mapped for one submission. Unmapped on drop.
#[derive(Debug)]
pub struct GuardPages {
    domain: Arc<dyn IommuDomain>,
    /// Zeroed page every guard IOVA points at
    _page: Box<dyn DmaMemory>,
    mapped: Vec<u64>,
}

impl GuardPages {
    /// Map guard pages around `ranges`, at most `max_pages` of them.
    ///
    /// Best effort: returns `None` when there is nothing to guard or the
    /// backing page cannot be allocated, and skips individual pages the
    /// domain refuses to map.
    pub fn map(
        domain: &Arc<dyn IommuDomain>,
        allocator: &dyn DmaAllocator,
        ranges: &[Range<u64>],
        max_pages: usize,
        below_pages: u64,
    ) -> Option<Self> {
        let windows = guard_windows(ranges, below_pages);
        if windows.is_empty() || max_pages == 0 {
            return None;
        }

        #[allow(clippy::cast_possible_truncation)]
        let page = match allocator.alloc_coherent(PAGE_SIZE as usize) {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!("guard page allocation failed, submitting unguarded: {e}");
                return None;
            }
        };
        let phys = page.phys_addr();

        let mut mapped = Vec::new();
        'windows: for (i, window) in windows.iter().enumerate() {
            let mut count = 0usize;
            for iova in window.clone().step_by(PAGE_SIZE as usize) {
                if mapped.len() >= max_pages {
                    break 'windows;
                }
                if domain.map(iova, phys, PAGE_SIZE, IommuProt::READ).is_ok() {
                    mapped.push(iova);
                    count += 1;
                }
            }
            tracing::debug!(
                "submit: guard[{i}] {:#x}-{:#x} ({count}/{} pages)",
                window.start,
                window.end,
                (window.end - window.start) / PAGE_SIZE
            );
        }
        tracing::debug!("submit: total guard pages={} across {} windows", mapped.len(), windows.len());

        Some(Self {
            domain: Arc::clone(domain),
            _page: page,
            mapped,
        })
    }

    /// Number of guard pages currently mapped.
    pub fn len(&self) -> usize {
        self.mapped.len()
    }

    /// Whether no page was mapped.
    pub fn is_empty(&self) -> bool {
        self.mapped.is_empty()
    }
}

impl Drop for GuardPages {
    fn drop(&mut self) {
        for &iova in &self.mapped {
            self.domain.unmap(iova, PAGE_SIZE);
        }
        tracing::debug!("submit: guard unmapped {} pages", self.mapped.len());
    }
}
