//! Platform collaborators.
//!
//! The driver core does not enumerate buses, request clocks or talk to the
//! DMA-BUF subsystem itself. It consumes these narrow interfaces instead,
//! bundled into a [`Platform`] at attach time. [`crate::software`] provides
//! an implementation of every trait for tests and the CLI.

use crate::error::Result;
use crate::mmio::RegisterBank;
use bitflags::bitflags;
use std::fmt;
use std::sync::Arc;

/// A coherent DMA allocation. Released when dropped.
pub trait DmaMemory: Send + Sync + fmt::Debug {
    /// Device-visible address.
    fn dma_addr(&self) -> u64;
    /// Physical address of the backing pages.
    fn phys_addr(&self) -> u64;
    /// Size in bytes.
    fn size(&self) -> usize;
    /// Copy `buf.len()` bytes out of the allocation starting at `offset`.
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()>;
    /// Copy `data` into the allocation starting at `offset`.
    fn write_at(&self, offset: usize, data: &[u8]) -> Result<()>;
}

/// Source of zeroed, page-aligned, device-coherent memory.
pub trait DmaAllocator: Send + Sync + fmt::Debug {
    /// Allocate `size` bytes (already page-aligned by the caller).
    fn alloc_coherent(&self, size: usize) -> Result<Box<dyn DmaMemory>>;
}

/// One device-mapped segment of an imported buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgSegment {
    /// Device address of the segment.
    pub dma_addr: u64,
    /// Length in bytes.
    pub len: u64,
}

/// An externally allocated buffer attached and mapped for the NPU.
///
/// Dropping it unmaps the kernel mapping, unmaps the attachment, detaches
/// and releases the external reference, in that order.
pub trait ImportedBuffer: Send + Sync + fmt::Debug {
    /// Scatter-gather segments as mapped for the device.
    fn segments(&self) -> &[SgSegment];
    /// Copy out of the kernel mapping.
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()>;
    /// Copy into the kernel mapping.
    fn write_at(&self, offset: usize, data: &[u8]) -> Result<()>;
    /// Flush CPU writes so the device observes them.
    fn sync_for_device(&self);
    /// Invalidate CPU caches so device writes become visible.
    fn sync_for_cpu(&self);
}

/// Resolves external buffer handles (DMA-BUF file descriptors).
pub trait BufferImporter: Send + Sync + fmt::Debug {
    /// Attach, map and kernel-map the buffer behind `handle`.
    fn import(&self, handle: u32) -> Result<Box<dyn ImportedBuffer>>;
}

bitflags! {
    /// IOMMU mapping permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IommuProt: u32 {
        /// Device may read.
        const READ = 1 << 0;
        /// Device may write.
        const WRITE = 1 << 1;
    }
}

/// The NPU's IOMMU domain.
pub trait IommuDomain: Send + Sync + fmt::Debug {
    /// Attach the NPU to the domain (programs the page-table base).
    fn attach(&self) -> Result<()>;
    /// Detach the NPU from the domain.
    fn detach(&self);
    /// Map `size` bytes at `iova` to `phys`.
    fn map(&self, iova: u64, phys: u64, size: u64, prot: IommuProt) -> Result<()>;
    /// Unmap `size` bytes at `iova`. Returns the bytes unmapped.
    fn unmap(&self, iova: u64, size: u64) -> u64;
}

/// Clocks and power domains feeding the NPU.
pub trait PowerRail: Send + Sync + fmt::Debug {
    /// Prepare and enable every NPU clock.
    fn enable_clocks(&self) -> Result<()>;
    /// Disable and unprepare every NPU clock.
    fn disable_clocks(&self);
    /// Resume the power domain of `core`.
    fn resume_domain(&self, core: usize) -> Result<()>;
    /// Suspend the power domain of `core`.
    fn suspend_domain(&self, core: usize);
    /// Resume the main device runtime.
    fn resume_main(&self) -> Result<()>;
    /// Suspend the main device runtime.
    fn suspend_main(&self);
    /// Current core clock rate in Hz.
    fn clock_rate(&self) -> u64;
}

/// NPU reset lines.
pub trait ResetControl: Send + Sync + fmt::Debug {
    /// Pulse the soft reset of every core.
    fn soft_reset(&self) -> Result<()>;
}

/// Everything [`Device::attach`](crate::Device::attach) needs from the platform.
#[derive(Debug, Clone)]
pub struct Platform {
    /// One register bank per core, in core order.
    pub banks: Vec<Arc<dyn RegisterBank>>,
    /// Coherent allocator for driver-owned buffers and guard pages.
    pub allocator: Arc<dyn DmaAllocator>,
    /// External buffer importer.
    pub importer: Arc<dyn BufferImporter>,
    /// IOMMU domain, if the NPU sits behind one.
    pub iommu: Option<Arc<dyn IommuDomain>>,
    /// Clocks and power domains.
    pub power: Arc<dyn PowerRail>,
    /// Reset lines.
    pub reset: Arc<dyn ResetControl>,
}
