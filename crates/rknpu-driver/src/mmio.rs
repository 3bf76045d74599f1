//! Memory-mapped register access.
//!
//! [`RegisterBank`] is the seam every component programs hardware through:
//! one bank per core, 32-bit registers at fixed byte offsets.
//! [`MappedRegion`] is the real implementation, mapping a register window
//! from a device file (`/dev/mem`, a UIO node, ...) with rustix.

// Register offsets are bounds-checked; MMIO pointers are naturally aligned
#![allow(clippy::cast_ptr_alignment)]
#![allow(clippy::cast_possible_truncation)]

use crate::error::{NpuError, Result};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsFd;
use std::path::Path;

/// One core's register bank.
pub trait RegisterBank: Send + Sync + fmt::Debug {
    /// Read a 32-bit register.
    fn read32(&self, offset: usize) -> u32;

    /// Write a 32-bit register.
    fn write32(&self, offset: usize, value: u32);
}

/// Mapped register window
pub struct MappedRegion {
    /// Memory-mapped pointer
    ptr: *mut u8,
    /// Size of the mapping
    size: usize,
    /// File offset the window was mapped from
    offset: u64,
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("size", &self.size)
            .field("offset", &format_args!("{:#x}", self.offset))
            .finish()
    }
}

// SAFETY: Send - MappedRegion owns the mapping exclusively. Moving between threads
// doesn't invalidate it (mmap'd memory is process-wide). No thread-local state.
unsafe impl Send for MappedRegion {}

// SAFETY: Sync - All access is bounds-checked volatile 32-bit loads/stores. Register
// writes are serialised by the driver's core-queue lock; volatile reads are idempotent.
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Open `path` read/write and map `size` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or mapped.
    pub fn open(path: impl AsRef<Path>, offset: u64, size: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        Self::map(&file, offset, size)
    }

    /// Map `size` bytes of `file` starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is zero or not a multiple of 4, or if mmap fails.
    pub fn map(file: &File, offset: u64, size: usize) -> Result<Self> {
        if size == 0 || size % 4 != 0 {
            return Err(NpuError::invalid_argument(format!(
                "register window size {size:#x} must be a non-zero multiple of 4"
            )));
        }

        // SAFETY: mmap necessary for MMIO - maps the register window into our address space.
        // Invariants: (1) file is open read/write; (2) size non-zero; (3) ptr valid for size
        // bytes or Err. The mapping is owned by the returned value and unmapped in Drop.
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                offset,
            )
            .map_err(|e| NpuError::Io {
                source: std::io::Error::from(e),
            })?
        };

        tracing::info!("Mapped register window {offset:#x} at {ptr:p}, size={size:#x}");

        Ok(Self {
            ptr: ptr.cast(),
            size,
            offset,
        })
    }

    /// Get region size
    pub const fn size(&self) -> usize {
        self.size
    }

    /// File offset of the window
    pub const fn offset(&self) -> u64 {
        self.offset
    }
}

impl RegisterBank for MappedRegion {
    /// # Panics
    ///
    /// Panics if `offset + 4` exceeds the mapped region size.
    fn read32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.size, "Register offset out of bounds");
        // SAFETY: read_volatile necessary for MMIO - hardware can change value.
        // Invariants: (1) ptr from mmap in map(), valid for self.size; (2) offset+4 <= size;
        // (3) u32 aligned. Caller guarantees: offset in bounds.
        unsafe { std::ptr::read_volatile(self.ptr.add(offset).cast::<u32>()) }
    }

    /// # Panics
    ///
    /// Panics if `offset + 4` exceeds the mapped region size.
    fn write32(&self, offset: usize, value: u32) {
        assert!(offset + 4 <= self.size, "Register offset out of bounds");
        // SAFETY: write_volatile necessary for MMIO - triggers hardware side effects.
        // Invariants: (1) ptr from mmap; (2) offset+4 <= size; (3) u32 aligned.
        unsafe {
            std::ptr::write_volatile(self.ptr.add(offset).cast::<u32>(), value);
        }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: munmap necessary - must unmap region before process ends.
        // Invariants: (1) ptr from mmap in map(), valid for self.size; (2) munmap with
        // ptr+size that was previously mapped; (3) Drop runs at most once; (4) no refs.
        unsafe {
            // Ignore error in Drop (can't propagate, would need to log)
            let _ = munmap(self.ptr.cast(), self.size);
        }
        tracing::debug!("Unmapped register window {:#x}", self.offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom};

    #[test]
    fn file_backed_window_round_trips_registers() {
        let mut file = tempfile::tempfile().unwrap();
        file.set_len(0x1000).unwrap();

        let region = MappedRegion::map(&file, 0, 0x1000).unwrap();
        region.write32(rknpu_chip::regs::PC_DATA_AMOUNT, 0xdead_beef);
        assert_eq!(region.read32(rknpu_chip::regs::PC_DATA_AMOUNT), 0xdead_beef);
        assert_eq!(region.read32(rknpu_chip::regs::VERSION), 0);
        drop(region);

        // MAP_SHARED: the write landed in the file
        let mut word = [0u8; 4];
        file.seek(SeekFrom::Start(0x14)).unwrap();
        file.read_exact(&mut word).unwrap();
        assert_eq!(u32::from_ne_bytes(word), 0xdead_beef);
    }

    #[test]
    fn rejects_unaligned_size() {
        let file = tempfile::tempfile().unwrap();
        assert!(matches!(
            MappedRegion::map(&file, 0, 6),
            Err(NpuError::InvalidArgument { .. })
        ));
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn out_of_bounds_read_panics() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(0x1000).unwrap();
        let region = MappedRegion::map(&file, 0, 0x1000).unwrap();
        let _ = region.read32(0x1000);
    }
}
