//! Host-memory coherent allocator.
//!
//! Page-aligned, zeroed host memory standing in for `dma_alloc_coherent`.
//! Device addresses are handed out top-down from a configurable ceiling,
//! optionally leaving a gap after each allocation, which mirrors how the
//! IOMMU IOVA allocator leaves holes between independently allocated
//! buffers (the holes guard pages exist to fill).
//!
//! Pages can be `mlock`ed so they stay resident, as pinned DMA memory would.

use crate::error::{NpuError, Result};
use crate::platform::{DmaAllocator, DmaMemory};
use crate::sync::lock;
use rknpu_chip::config::PAGE_SIZE;
use rustix::mm::{mlock, munlock};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::Mutex;

/// Coherent allocator over page-aligned host memory.
#[derive(Debug)]
pub struct HostCoherentAllocator {
    /// Next allocation ends at this device address
    cursor: Mutex<u64>,
    /// Lowest device address that may be handed out
    floor: u64,
    /// Unused pages left below each allocation
    gap_pages: u64,
    /// Pin pages with mlock
    lock_pages: bool,
}

impl HostCoherentAllocator {
    /// Allocator handing out device addresses below `iova_top`.
    pub fn new(iova_top: u64) -> Self {
        Self {
            cursor: Mutex::new(iova_top & !(PAGE_SIZE - 1)),
            floor: PAGE_SIZE,
            gap_pages: 0,
            lock_pages: false,
        }
    }

    /// Leave `pages` unmapped pages between consecutive allocations.
    #[must_use]
    pub fn with_gap_pages(mut self, pages: u64) -> Self {
        self.gap_pages = pages;
        self
    }

    /// `mlock` every allocation.
    #[must_use]
    pub fn with_mlock(mut self, lock_pages: bool) -> Self {
        self.lock_pages = lock_pages;
        self
    }

    fn reserve_iova(&self, size: u64) -> Result<u64> {
        let mut cursor = lock(&self.cursor);
        let iova = cursor
            .checked_sub(size)
            .filter(|iova| *iova >= self.floor)
            .ok_or_else(|| NpuError::allocation(format!("IOVA space exhausted for {size:#x} bytes")))?;
        *cursor = iova.saturating_sub(self.gap_pages * PAGE_SIZE);
        Ok(iova)
    }

    /// Hand back the reservation of `size` bytes at `iova` if nothing was
    /// reserved after it.
    fn release_iova(&self, iova: u64, size: u64) {
        let mut cursor = lock(&self.cursor);
        if *cursor == iova.saturating_sub(self.gap_pages * PAGE_SIZE) {
            *cursor = iova + size;
        }
    }
}

impl DmaAllocator for HostCoherentAllocator {
    fn alloc_coherent(&self, size: usize) -> Result<Box<dyn DmaMemory>> {
        // reserve device address space before touching host memory
        let iova = self.reserve_iova(size as u64)?;
        let mut buffer = HostBuffer::new(size, self.lock_pages).map_err(|e| {
            self.release_iova(iova, size as u64);
            e
        })?;
        buffer.iova = iova;
        tracing::debug!("coherent alloc: size={size:#x} iova={:#x}", buffer.iova);
        Ok(Box::new(buffer))
    }
}

/// One page-aligned host allocation.
#[derive(Debug)]
pub struct HostBuffer {
    /// Host address
    ptr: NonNull<u8>,
    layout: Layout,
    /// Device-visible address
    iova: u64,
    locked: bool,
}

// SAFETY: Send - HostBuffer owns its allocation exclusively; the pointer is not
// tied to the allocating thread.
unsafe impl Send for HostBuffer {}

// SAFETY: Sync - all access goes through bounds-checked copies. Concurrent access to
// overlapping bytes has DMA-memory semantics: callers coordinate through the job protocol.
unsafe impl Sync for HostBuffer {}

impl HostBuffer {
    fn new(size: usize, lock_pages: bool) -> Result<Self> {
        if size == 0 {
            return Err(NpuError::invalid_argument("zero-sized coherent allocation"));
        }
        #[allow(clippy::cast_possible_truncation)]
        let layout = Layout::from_size_align(size, PAGE_SIZE as usize)
            .map_err(|e| NpuError::allocation(format!("bad layout for {size:#x} bytes: {e}")))?;

        // SAFETY: alloc_zeroed with a non-zero-size layout (checked above).
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| NpuError::allocation(format!("out of memory for {size:#x} bytes")))?;

        let mut locked = false;
        if lock_pages {
            // SAFETY: ptr/size describe the allocation just made and owned by us.
            match unsafe { mlock(ptr.as_ptr().cast(), size) } {
                Ok(()) => locked = true,
                Err(e) => tracing::warn!("mlock of {size:#x} bytes failed: {e}"),
            }
        }

        Ok(Self {
            ptr,
            layout,
            iova: 0,
            locked,
        })
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.layout.size() => Ok(()),
            _ => Err(NpuError::invalid_argument(format!(
                "access {offset:#x}+{len:#x} outside {:#x}-byte buffer",
                self.layout.size()
            ))),
        }
    }
}

impl DmaMemory for HostBuffer {
    fn dma_addr(&self) -> u64 {
        self.iova
    }

    fn phys_addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    fn size(&self) -> usize {
        self.layout.size()
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check(offset, buf.len())?;
        // SAFETY: range checked against the allocation; buf is a distinct Rust slice.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        // SAFETY: range checked against the allocation; data is a distinct Rust slice.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        if self.locked {
            // SAFETY: same range that was mlocked in new().
            let _ = unsafe { munlock(self.ptr.as_ptr().cast(), self.layout.size()) };
        }
        // SAFETY: ptr was returned by alloc_zeroed with this layout and is freed once.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_grow_downward_with_gaps() {
        let alloc = HostCoherentAllocator::new(0x1_0000_0000).with_gap_pages(2);
        let a = alloc.alloc_coherent(0x2000).unwrap();
        let b = alloc.alloc_coherent(0x1000).unwrap();
        assert_eq!(a.dma_addr(), 0x1_0000_0000 - 0x2000);
        assert_eq!(b.dma_addr(), a.dma_addr() - 2 * PAGE_SIZE - 0x1000);
        assert_eq!(a.phys_addr() % PAGE_SIZE, 0);
    }

    #[test]
    fn memory_is_zeroed_and_bounds_checked() {
        let alloc = HostCoherentAllocator::new(0x1000_0000);
        let mem = alloc.alloc_coherent(0x1000).unwrap();
        let mut buf = [0xffu8; 16];
        mem.read_at(0xff0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);

        mem.write_at(8, &[1, 2, 3]).unwrap();
        mem.read_at(8, &mut buf[..3]).unwrap();
        assert_eq!(&buf[..3], &[1, 2, 3]);

        assert!(mem.write_at(0xfff, &[0, 0]).is_err());
        assert!(mem.read_at(usize::MAX, &mut buf).is_err());
    }

    #[test]
    fn exhausted_iova_space_is_an_allocation_error() {
        let alloc = HostCoherentAllocator::new(3 * PAGE_SIZE);
        alloc.alloc_coherent(0x1000).unwrap();
        alloc.alloc_coherent(0x1000).unwrap();
        assert!(matches!(
            alloc.alloc_coherent(0x1000),
            Err(NpuError::Allocation { .. })
        ));
        // a request that cannot fit never reaches the host allocator
        assert!(matches!(
            alloc.alloc_coherent(usize::MAX),
            Err(NpuError::Allocation { .. })
        ));
    }

    #[test]
    fn failed_host_allocation_returns_its_iova() {
        let alloc = HostCoherentAllocator::new(0x1000_0000).with_gap_pages(2);
        assert!(matches!(
            alloc.alloc_coherent(0),
            Err(NpuError::InvalidArgument { .. })
        ));
        let mem = alloc.alloc_coherent(0x1000).unwrap();
        assert_eq!(mem.dma_addr(), 0x1000_0000 - 0x1000);
    }
}
