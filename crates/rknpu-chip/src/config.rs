//! Chip configuration constants.
//!
//! Only the RK3588 topology ships today. The values match the platform
//! match data the vendor kernel driver uses for `rockchip,rk3588-rknpu`.

use crate::regs::PC_DATA_EXTRA_AMOUNT;

/// IOMMU / host page size.
pub const PAGE_SIZE: u64 = 4096;

/// Size of one task descriptor in the task buffer.
pub const TASK_DESCRIPTOR_SIZE: usize = 40;

/// Number of per-core task ranges a submission may carry.
pub const MAX_SUBCORE_TASKS: usize = 5;

/// Static description of an NPU variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipConfig {
    /// Marketing name, used in logs.
    pub name: &'static str,
    /// Physical cores (one register bank and one interrupt line each).
    pub num_cores: usize,
    /// Device address width.
    pub dma_mask_bits: u32,
    /// Divisor applied to the command stream word count.
    pub pc_data_amount_scale: u32,
    /// Width of the task-count field in the task control word.
    pub pc_task_number_bits: u32,
    /// Mask for the task counter read back from the task status register.
    pub pc_task_number_mask: u32,
    /// Offset of the PC task status register.
    pub pc_task_status_offset: usize,
    /// Maximum tasks committed per hardware trigger.
    pub max_submit_number: u32,
    /// Bitmask of cores a job may target.
    pub core_mask: u32,
    /// Each core sits in its own power domain.
    pub multiple_power_domains: bool,
}

impl ChipConfig {
    /// RK3588: three cores, 12-bit task counter.
    pub const fn rk3588() -> Self {
        Self {
            name: "RK3588",
            num_cores: 3,
            dma_mask_bits: 40,
            pc_data_amount_scale: 2,
            pc_task_number_bits: 12,
            pc_task_number_mask: 0xfff,
            pc_task_status_offset: 0x3c,
            max_submit_number: (1 << 12) - 1,
            core_mask: 0x7,
            multiple_power_domains: true,
        }
    }

    /// Value for `PC_DATA_AMOUNT` given the first task's register config amount.
    pub const fn data_amount(&self, regcfg_amount: u32) -> u32 {
        let scale = self.pc_data_amount_scale;
        (regcfg_amount + PC_DATA_EXTRA_AMOUNT + scale - 1) / scale - 1
    }

    /// Value for `PC_TASK_CONTROL` committing `task_number` tasks.
    pub const fn task_control(&self, task_number: u32, pingpong: bool) -> u32 {
        let pp = if pingpong { 1 } else { 0 };
        ((0x6 | pp) << self.pc_task_number_bits) | task_number
    }

    /// Hardware triggers needed for `task_number` tasks.
    pub const fn chunks_for(&self, task_number: u32) -> u32 {
        task_number.div_ceil(self.max_submit_number)
    }

    /// Highest usable device address + 1.
    pub const fn dma_limit(&self) -> u64 {
        1 << self.dma_mask_bits
    }
}

impl Default for ChipConfig {
    fn default() -> Self {
        Self::rk3588()
    }
}
