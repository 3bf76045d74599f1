//! Register diagnostics.
//!
//! Snapshots taken when a job stalls, and the debug register view. The log
//! lines keep a fixed shape because external tooling parses them.

use crate::memory::MemoryObject;
use crate::mmio::RegisterBank;
use rknpu_chip::regs::{self, engine, mmu, DEBUG_BLOCKS};
use rknpu_chip::ChipConfig;
use std::fmt::{self, Write as _};
use std::time::Duration;

/// PC-block state of one core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreSnapshot {
    /// Core index.
    pub core: usize,
    /// Masked interrupt status.
    pub int_status: u32,
    /// Raw interrupt status.
    pub raw_status: u32,
    /// Interrupt mask the job expects.
    pub expected_mask: u32,
    /// Tasks the core reports complete.
    pub task_counter: u32,
    /// Command stream address.
    pub pc_data_addr: u32,
    /// Command stream amount.
    pub pc_data_amount: u32,
    /// Task control word.
    pub task_control: u32,
    /// Descriptor base address.
    pub dma_base: u32,
}

impl CoreSnapshot {
    /// Read the PC block of `bank`.
    pub fn capture(bank: &dyn RegisterBank, chip: &ChipConfig, core: usize, expected_mask: u32) -> Self {
        Self {
            core,
            int_status: bank.read32(regs::INT_STATUS),
            raw_status: bank.read32(regs::INT_RAW_STATUS),
            expected_mask,
            task_counter: task_counter(bank, chip),
            pc_data_addr: bank.read32(regs::PC_DATA_ADDR),
            pc_data_amount: bank.read32(regs::PC_DATA_AMOUNT),
            task_control: bank.read32(regs::PC_TASK_CONTROL),
            dma_base: bank.read32(regs::PC_DMA_BASE_ADDR),
        }
    }
}

impl fmt::Display for CoreSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "core {}: int={:#x} raw={:#x} mask={:#x} tc={} pc_addr={:#x} pc_amt={:#x} task_ctrl={:#x} dma_base={:#x}",
            self.core,
            self.int_status,
            self.raw_status,
            self.expected_mask,
            self.task_counter,
            self.pc_data_addr,
            self.pc_data_amount,
            self.task_control,
            self.dma_base
        )
    }
}

/// One IOMMU register window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmuWindow {
    /// Window base within core 0's bank.
    pub base: usize,
    /// Directory table entry.
    pub dte: u32,
    /// Status.
    pub status: u32,
    /// Last page-fault address.
    pub page_fault: u32,
    /// Raw interrupt status.
    pub raw: u32,
    /// Interrupt mask.
    pub mask: u32,
}

/// Both IOMMU windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IommuSnapshot(pub [MmuWindow; 2]);

impl IommuSnapshot {
    /// Read both windows from core 0's bank.
    pub fn capture(bank0: &dyn RegisterBank) -> Self {
        Self(mmu::WINDOWS.map(|base| MmuWindow {
            base,
            status: bank0.read32(base + mmu::STATUS),
            page_fault: bank0.read32(base + mmu::PAGE_FAULT_ADDR),
            raw: bank0.read32(base + mmu::INT_RAWSTAT),
            mask: bank0.read32(base + mmu::INT_MASK),
            dte: bank0.read32(base + mmu::DTE_ADDR),
        }))
    }
}

impl fmt::Display for IommuSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, w) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_char('\n')?;
            }
            write!(
                f,
                "IOMMU[{:#x}]: DTE={:#x} STATUS={:#x} PG_FAULT={:#x} RAW={:#x} MASK={:#x}",
                w.base, w.dte, w.status, w.page_fault, w.raw, w.mask
            )?;
        }
        Ok(())
    }
}

/// Task counter of `bank`.
pub fn task_counter(bank: &dyn RegisterBank, chip: &ChipConfig) -> u32 {
    bank.read32(chip.pc_task_status_offset) & chip.pc_task_number_mask
}

/// Log the state of a core between wait iterations.
pub(crate) fn log_poll(bank: &dyn RegisterBank, chip: &ChipConfig, wait_count: u32, elapsed: Option<Duration>) {
    tracing::error!(
        "poll[{wait_count}]: task_cnt={} raw={:#x} int={:#x} pc_addr={:#x} pc_amt={} elapsed={}us",
        task_counter(bank, chip),
        bank.read32(regs::INT_RAW_STATUS),
        bank.read32(regs::INT_STATUS),
        bank.read32(regs::PC_DATA_ADDR),
        bank.read32(regs::PC_DATA_AMOUNT),
        elapsed.map_or(0, |e| e.as_micros())
    );
}

/// Log everything known about a core after a job timed out on it.
pub(crate) fn log_timeout(bank: &dyn RegisterBank, task_obj: &MemoryObject, task_start: u32, task_number: u32) {
    tracing::error!("TIMEOUT DIAG: PC registers:");
    for offset in (regs::VERSION..=0x3c).step_by(4) {
        tracing::error!("  [{offset:#04x}]={:#010x}", bank.read32(offset));
    }
    tracing::error!("  [{:#x}]={:#010x}", regs::ENABLE_MASK, bank.read32(regs::ENABLE_MASK));

    tracing::error!("TIMEOUT DIAG: engine status/s_pointer:");
    for (name, status) in engine::STATUS_PAIRS {
        tracing::error!(
            "  {name}: S_STATUS[{status:#x}]={:#010x} S_POINTER[{:#x}]={:#010x}",
            bank.read32(status),
            status + 4,
            bank.read32(status + 4)
        );
    }
    tracing::error!(
        "  CNA_CLK_GATE[{:#x}]={:#010x}",
        engine::CNA_CLK_GATE,
        bank.read32(engine::CNA_CLK_GATE)
    );

    for t in 0..task_number.min(3) {
        match task_obj.read_task(task_start + t) {
            Ok(task) => tracing::error!("  task[{t}] {task}"),
            Err(e) => tracing::error!("  task[{t}] unreadable: {e}"),
        }
    }
}

/// Render every non-zero register of every named block, per core.
pub fn dump_registers(banks: &[std::sync::Arc<dyn RegisterBank>]) -> String {
    let mut out = String::new();
    for (core, bank) in banks.iter().enumerate() {
        let _ = writeln!(out, "## Core {core}");
        for block in &DEBUG_BLOCKS {
            let _ = writeln!(out, "### {} ({:#06x} - {:#06x})", block.name, block.start, block.end);
            for offset in block.offsets() {
                let value = bank.read32(offset);
                if value != 0 {
                    let _ = writeln!(out, "0x{offset:04X} = 0x{value:08X}");
                }
            }
        }
    }
    out
}
