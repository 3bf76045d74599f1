//! Per-core register map for the RK3588 NPU.
//!
//! Every core exposes the same layout in its own MMIO bank. Offsets are
//! byte offsets from the start of the bank; all registers are 32 bits wide.
//!
//! ```text
//! 0x0000 - 0x003c   PC (program counter) block: version, op-enable,
//!                   command stream address/amount, interrupts, task control
//! 0x1000 - 0x1190   CNA   (convolution / neural accelerator)
//! 0x3000 - 0x3020   CORE  (MAC array)
//! 0x4000 - 0x412c   DPU   (data processing unit, incl. LUT)
//! 0x5000 - 0x5050   RDMA
//! 0x6000 - 0x6020   PPU   (pooling)
//! 0x7000 - 0x7020   PPU_RDMA
//! 0x9000 / 0xa000   IOMMU windows (core 0 bank only)
//! 0xf000 - 0xf008   GLOBAL
//! ```

// ── PC block ─────────────────────────────────────────────────────────────────

/// Hardware version word.
pub const VERSION: usize = 0x0000;

/// Hardware version number; only the low 16 bits are meaningful.
pub const VERSION_NUM: usize = 0x0004;

/// Op-enable. Writing `1` then `0` starts the committed command stream.
pub const PC_OP_EN: usize = 0x0008;

/// Command stream address. Writing `1` switches the core into slave mode.
pub const PC_DATA_ADDR: usize = 0x0010;

/// Command stream amount, in units of the chip's data-amount scale.
pub const PC_DATA_AMOUNT: usize = 0x0014;

/// Task control word: `((0x6 | pingpong) << task_number_bits) | task_count`.
pub const PC_TASK_CONTROL: usize = 0x0030;

/// Device address of the task descriptor array.
pub const PC_DMA_BASE_ADDR: usize = 0x0034;

// ── Interrupts ───────────────────────────────────────────────────────────────

/// Interrupt mask: the events that raise the core's interrupt line.
pub const INT_MASK: usize = 0x0020;

/// Interrupt clear (write-one-to-clear).
pub const INT_CLEAR: usize = 0x0024;

/// Masked interrupt status.
pub const INT_STATUS: usize = 0x0028;

/// Raw (unmasked) interrupt status.
pub const INT_RAW_STATUS: usize = 0x002c;

/// Interrupt register bit definitions
pub mod int {
    /// Value written to [`super::INT_CLEAR`] to clear every event.
    pub const CLEAR_ALL: u32 = 0x1ffff;

    /// Event bits come in pairs (one pair per engine group). A completion
    /// may set either bit of a pair, so matching is done per pair.
    pub const PAIRS: [u32; 6] = [0x3, 0xc, 0x30, 0xc0, 0x300, 0xc00];
}

// ── Global ───────────────────────────────────────────────────────────────────

/// Engine enable mask.
pub const ENABLE_MASK: usize = 0xf008;

/// Extra words the PC block fetches beyond a task's register config.
pub const PC_DATA_EXTRA_AMOUNT: u32 = 4;

// ── Engine status ────────────────────────────────────────────────────────────

/// Engine status / stream-pointer registers, sampled on timeout.
pub mod engine {
    /// CNA status.
    pub const CNA_S_STATUS: usize = 0x1000;
    /// CNA stream pointer. Also the stream selector written on multi-core commits.
    pub const CNA_S_POINTER: usize = 0x1004;
    /// CNA clock gating control.
    pub const CNA_CLK_GATE: usize = 0x1090;
    /// CORE status.
    pub const CORE_S_STATUS: usize = 0x3000;
    /// CORE stream pointer. Also the stream selector written on multi-core commits.
    pub const CORE_S_POINTER: usize = 0x3004;
    /// DPU status.
    pub const DPU_S_STATUS: usize = 0x4000;
    /// RDMA status.
    pub const RDMA_S_STATUS: usize = 0x5000;
    /// PPU (write DMA) status.
    pub const WDMA_S_STATUS: usize = 0x6000;
    /// PPU read DMA status.
    pub const WRDMA_S_STATUS: usize = 0x7000;

    /// `(name, status offset)` for every engine; the stream pointer is at `+4`.
    pub const STATUS_PAIRS: [(&str, usize); 6] = [
        ("CNA", CNA_S_STATUS),
        ("CORE", CORE_S_STATUS),
        ("DPU", DPU_S_STATUS),
        ("RDMA", RDMA_S_STATUS),
        ("WDMA", WDMA_S_STATUS),
        ("WRDMA", WRDMA_S_STATUS),
    ];

    /// Stream selector written to [`CNA_S_POINTER`] and [`CORE_S_POINTER`]
    /// before a multi-core commit on `core`.
    pub const fn stream_selector(core: usize) -> u32 {
        // core < 3, so this never overflows
        #[allow(clippy::cast_possible_truncation)]
        let core = core as u32;
        0xe + 0x1000_0000 * core
    }
}

// ── IOMMU ────────────────────────────────────────────────────────────────────

/// IOMMU register windows inside core 0's bank.
///
/// The directory-table-entry register loses its valid bit across a power
/// gate and must be re-asserted after every power-on.
pub mod mmu {
    /// First MMU window.
    pub const MMU0_BASE: usize = 0x9000;
    /// Second MMU window.
    pub const MMU1_BASE: usize = 0xa000;
    /// Both windows, in the order they are checked.
    pub const WINDOWS: [usize; 2] = [MMU0_BASE, MMU1_BASE];

    /// Directory table entry address.
    pub const DTE_ADDR: usize = 0x00;
    /// MMU status.
    pub const STATUS: usize = 0x04;
    /// Last page-fault address.
    pub const PAGE_FAULT_ADDR: usize = 0x0c;
    /// Raw interrupt status.
    pub const INT_RAWSTAT: usize = 0x14;
    /// Interrupt mask.
    pub const INT_MASK: usize = 0x1c;

    /// DTE valid bit.
    pub const DTE_VALID: u32 = 1 << 0;
}

// ── Debug view ───────────────────────────────────────────────────────────────

/// A named, inclusive range of registers shown by the register dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterBlock {
    /// Block name as printed in the dump.
    pub name: &'static str,
    /// First register offset.
    pub start: usize,
    /// Last register offset (inclusive).
    pub end: usize,
}

impl RegisterBlock {
    /// Every register offset in the block.
    pub fn offsets(&self) -> impl Iterator<Item = usize> {
        (self.start..=self.end).step_by(4)
    }
}

/// Blocks rendered by the register dump, in bank order.
pub const DEBUG_BLOCKS: [RegisterBlock; 9] = [
    RegisterBlock { name: "PC", start: 0x0000, end: 0x003c },
    RegisterBlock { name: "CNA", start: 0x1000, end: 0x1190 },
    RegisterBlock { name: "CORE", start: 0x3000, end: 0x3020 },
    RegisterBlock { name: "DPU", start: 0x4000, end: 0x40f0 },
    RegisterBlock { name: "DPU_LUT", start: 0x4100, end: 0x412c },
    RegisterBlock { name: "RDMA", start: 0x5000, end: 0x5050 },
    RegisterBlock { name: "PPU", start: 0x6000, end: 0x6020 },
    RegisterBlock { name: "PPU_RDMA", start: 0x7000, end: 0x7020 },
    RegisterBlock { name: "GLOBAL", start: 0xf000, end: 0xf008 },
];

/// Size of a core's register bank.
pub const BANK_SIZE: usize = 0x10000;
