//! Task descriptors.
//!
//! The task buffer is an array of 40-byte descriptors written by the
//! userspace runtime. Each one points at a register command stream and
//! carries the interrupt events that signal its completion.

use bytemuck::{Pod, Zeroable};
use rknpu_chip::config::TASK_DESCRIPTOR_SIZE;

/// One hardware task descriptor.
///
/// Field order and widths match the packed layout the runtime writes; the
/// `u64` lands on an 8-byte boundary so `repr(C)` adds no padding.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct TaskDescriptor {
    /// Runtime flags
    pub flags: u32,
    /// Operation index within the model
    pub op_idx: u32,
    /// Engines enabled for this task
    pub enable_mask: u32,
    /// Interrupt events that signal completion
    pub int_mask: u32,
    /// Interrupt events to clear before the task
    pub int_clear: u32,
    /// Final interrupt status, written back by the driver
    pub int_status: u32,
    /// Register config words in the command stream
    pub regcfg_amount: u32,
    /// Offset of the config within the command buffer
    pub regcfg_offset: u32,
    /// Device address of the register command stream
    pub regcmd_addr: u64,
}

const _: () = assert!(std::mem::size_of::<TaskDescriptor>() == TASK_DESCRIPTOR_SIZE);

impl TaskDescriptor {
    /// Descriptor size in bytes.
    pub const SIZE: usize = TASK_DESCRIPTOR_SIZE;

    /// Byte offset of the `int_status` field.
    pub const INT_STATUS_OFFSET: usize = 20;

    /// Decode from the first [`Self::SIZE`] bytes of `bytes`.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is shorter than [`Self::SIZE`].
    pub fn from_bytes(bytes: &[u8]) -> Self {
        bytemuck::pod_read_unaligned(&bytes[..Self::SIZE])
    }

    /// Encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Byte offset of descriptor `index` in a task buffer.
    pub const fn offset_of(index: u32) -> usize {
        index as usize * Self::SIZE
    }
}

impl std::fmt::Display for TaskDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "flags={:#x} op={} en={:#x} imask={:#x} iclr={:#x} ist={:#x} amt={} off={} cmd={:#x}",
            self.flags,
            self.op_idx,
            self.enable_mask,
            self.int_mask,
            self.int_clear,
            self.int_status,
            self.regcfg_amount,
            self.regcfg_offset,
            self.regcmd_addr
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_offsets_match_wire_layout() {
        let t = TaskDescriptor {
            int_status: 0xaabb_ccdd,
            regcmd_addr: 0x1122_3344_5566_7788,
            ..Default::default()
        };
        let bytes = t.as_bytes();
        assert_eq!(bytes.len(), 40);
        let off = TaskDescriptor::INT_STATUS_OFFSET;
        assert_eq!(&bytes[off..off + 4], &0xaabb_ccddu32.to_ne_bytes());
        assert_eq!(&bytes[32..40], &0x1122_3344_5566_7788u64.to_ne_bytes());
    }

    #[test]
    fn decodes_from_unaligned_slice() {
        let t = TaskDescriptor {
            int_mask: 0x300,
            regcfg_amount: 108,
            regcmd_addr: 0xffe0_1000,
            ..Default::default()
        };
        let mut buf = vec![0u8; 1 + TaskDescriptor::SIZE];
        buf[1..].copy_from_slice(t.as_bytes());
        assert_eq!(TaskDescriptor::from_bytes(&buf[1..]), t);
    }
}
