//! Memory objects.
//!
//! A [`MemoryObject`] is one buffer the NPU can address. It is backed either
//! by driver-owned coherent memory or by an imported external buffer; the
//! [`Backing`] tag makes the two teardown paths mutually exclusive, and
//! dropping the object runs exactly the one that applies.

use crate::error::{NpuError, Result};
use crate::platform::{BufferImporter, DmaAllocator, DmaMemory, ImportedBuffer};
use crate::task::TaskDescriptor;
use bitflags::bitflags;
use rknpu_chip::config::PAGE_SIZE;
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Round `size` up to the page size, or `None` if that overflows.
pub const fn page_align(size: u64) -> Option<u64> {
    match size.checked_add(PAGE_SIZE - 1) {
        Some(end) => Some(end & !(PAGE_SIZE - 1)),
        None => None,
    }
}

/// Identifies a memory object within its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

bitflags! {
    /// Cache synchronisation direction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SyncFlags: u32 {
        /// Flush CPU writes for the device.
        const TO_DEVICE = 1 << 0;
        /// Invalidate so the CPU sees device writes.
        const FROM_DEVICE = 1 << 1;
    }
}

/// Where a buffer's memory comes from.
#[derive(Debug)]
pub enum Backing {
    /// Coherent memory allocated by the driver.
    Owned(Box<dyn DmaMemory>),
    /// External buffer attached and mapped for the device.
    Imported {
        /// The external handle the client passed in
        handle: u32,
        /// Attachment, device mapping and kernel mapping
        buffer: Box<dyn ImportedBuffer>,
    },
}

/// One NPU-addressable buffer.
#[derive(Debug)]
pub struct MemoryObject {
    id: ObjectId,
    handle: u32,
    size: u64,
    dma_addr: u64,
    backing: Backing,
}

/// What a client learns about a newly created buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    /// Owned: a driver counter. Imported: the caller's handle.
    pub handle: u32,
    /// Object identifier used by every later request.
    pub object_id: ObjectId,
    /// Device-visible address.
    pub dma_addr: u64,
    /// Page-aligned size.
    pub size: u64,
}

impl MemoryObject {
    /// Object identifier.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Client-visible handle.
    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// Page-aligned size.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Device-visible address.
    pub fn dma_addr(&self) -> u64 {
        self.dma_addr
    }

    /// Device address range `[dma_addr, dma_addr + size)`.
    pub fn range(&self) -> Range<u64> {
        self.dma_addr..self.dma_addr + self.size
    }

    /// Whether this is an imported buffer.
    pub fn is_imported(&self) -> bool {
        matches!(self.backing, Backing::Imported { .. })
    }

    /// Ownership path.
    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    /// Creation summary.
    pub fn info(&self) -> MemInfo {
        MemInfo {
            handle: self.handle,
            object_id: self.id,
            dma_addr: self.dma_addr,
            size: self.size,
        }
    }

    /// Copy out of the buffer through its kernel mapping.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        match &self.backing {
            Backing::Owned(mem) => mem.read_at(offset, buf),
            Backing::Imported { buffer, .. } => buffer.read_at(offset, buf),
        }
    }

    /// Copy into the buffer through its kernel mapping.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        match &self.backing {
            Backing::Owned(mem) => mem.write_at(offset, data),
            Backing::Imported { buffer, .. } => buffer.write_at(offset, data),
        }
    }

    /// Read task descriptor `index`.
    pub fn read_task(&self, index: u32) -> Result<TaskDescriptor> {
        let mut raw = [0u8; TaskDescriptor::SIZE];
        self.read_at(TaskDescriptor::offset_of(index), &mut raw)?;
        Ok(TaskDescriptor::from_bytes(&raw))
    }

    /// Write task descriptor `index`.
    pub fn write_task(&self, index: u32, task: &TaskDescriptor) -> Result<()> {
        self.write_at(TaskDescriptor::offset_of(index), task.as_bytes())
    }

    /// Write descriptors `tasks` starting at index 0.
    pub fn write_tasks(&self, tasks: &[TaskDescriptor]) -> Result<()> {
        self.write_at(0, bytemuck::cast_slice(tasks))
    }

    /// Overwrite the `int_status` field of descriptor `index`.
    pub fn write_task_status(&self, index: u32, status: u32) -> Result<()> {
        let offset = TaskDescriptor::offset_of(index) + TaskDescriptor::INT_STATUS_OFFSET;
        self.write_at(offset, &status.to_ne_bytes())
    }

    /// Descriptors that fit in the buffer.
    pub fn task_capacity(&self) -> u64 {
        self.size / TaskDescriptor::SIZE as u64
    }

    /// Cache maintenance. A no-op for owned (coherent) memory.
    pub fn sync(&self, flags: SyncFlags) {
        let Backing::Imported { buffer, .. } = &self.backing else {
            return;
        };
        if flags.contains(SyncFlags::TO_DEVICE) {
            buffer.sync_for_device();
            tracing::debug!("mem_sync: TO_DEVICE {} dma={:#x} size={:#x}", self.id, self.dma_addr, self.size);
        }
        if flags.contains(SyncFlags::FROM_DEVICE) {
            buffer.sync_for_cpu();
            tracing::debug!("mem_sync: FROM_DEVICE {} dma={:#x} size={:#x}", self.id, self.dma_addr, self.size);
        }
    }
}

impl Drop for MemoryObject {
    fn drop(&mut self) {
        let path = if self.is_imported() { "imported" } else { "owned" };
        tracing::debug!("mem_destroy: {} {path} dma={:#x} size={:#x}", self.id, self.dma_addr, self.size);
    }
}

/// Creates memory objects for a device.
#[derive(Debug)]
pub struct MemoryManager {
    allocator: Arc<dyn DmaAllocator>,
    importer: Arc<dyn BufferImporter>,
    next_handle: AtomicU32,
    next_id: AtomicU64,
}

impl MemoryManager {
    /// Manager drawing on `allocator` and `importer`.
    pub fn new(allocator: Arc<dyn DmaAllocator>, importer: Arc<dyn BufferImporter>) -> Self {
        Self {
            allocator,
            importer,
            next_handle: AtomicU32::new(1),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate (`external == None`) or import a buffer of at least `size` bytes.
    ///
    /// # Errors
    ///
    /// - [`NpuError::InvalidArgument`] for a zero size
    /// - [`NpuError::Allocation`] if coherent memory is unavailable
    /// - [`NpuError::Import`] if the handle cannot be imported or its
    ///   device mapping is not one contiguous range covering `size`
    pub fn create(&self, size: u64, external: Option<u32>) -> Result<MemoryObject> {
        if size == 0 {
            return Err(NpuError::invalid_argument("buffer size must be non-zero"));
        }
        let aligned =
            page_align(size).ok_or_else(|| NpuError::allocation(format!("size {size:#x} overflows page alignment")))?;
        let id = ObjectId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let object = match external {
            Some(handle) => self.import(id, handle, aligned)?,
            None => {
                let len = usize::try_from(aligned)
                    .map_err(|_| NpuError::allocation(format!("size {aligned:#x} too large")))?;
                let mem = self.allocator.alloc_coherent(len)?;
                let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("mem_create: ALLOC handle={handle} size={aligned:#x} dma={:#x}", mem.dma_addr());
                MemoryObject {
                    id,
                    handle,
                    size: aligned,
                    dma_addr: mem.dma_addr(),
                    backing: Backing::Owned(mem),
                }
            }
        };
        Ok(object)
    }

    fn import(&self, id: ObjectId, handle: u32, aligned: u64) -> Result<MemoryObject> {
        let buffer = self.importer.import(handle)?;
        let segments = buffer.segments();
        let Some(first) = segments.first() else {
            return Err(NpuError::import(format!("handle {handle} has no mapped segments")));
        };

        let mut total = 0u64;
        let mut contiguous = true;
        let mut expected = first.dma_addr;
        for (i, seg) in segments.iter().enumerate() {
            tracing::debug!("mem_create: IMPORT fd={handle} sg[{i}] dma={:#x} len={:#x}", seg.dma_addr, seg.len);
            contiguous &= seg.dma_addr == expected;
            expected = seg.dma_addr + seg.len;
            total += seg.len;
        }
        tracing::debug!(
            "mem_create: IMPORT fd={handle} total_dma_len={total:#x} requested={aligned:#x} dma_base={:#x} nents={}",
            first.dma_addr,
            segments.len()
        );

        if !contiguous {
            tracing::warn!("mem_create: fd={handle} maps to {} discontiguous segments", segments.len());
            return Err(NpuError::import(format!(
                "handle {handle}: multi-segment device mappings are not supported"
            )));
        }
        if total < aligned {
            return Err(NpuError::import(format!(
                "handle {handle}: buffer is {total:#x} bytes, {aligned:#x} requested"
            )));
        }

        Ok(MemoryObject {
            id,
            handle,
            size: aligned,
            dma_addr: first.dma_addr,
            backing: Backing::Imported { handle, buffer },
        })
    }
}
