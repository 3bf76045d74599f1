//! Silicon model for the Rockchip RK3588 NPU.
//!
//! This crate has **no dependencies** and **no hardware access**. It models
//! the silicon: per-core register offsets, interrupt bit layout, the IOMMU
//! register windows that live inside core 0's bank, and the chip constants
//! that shape command submission (descriptor limits, task-control encoding).
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`regs`] | Per-core register map: PC block, interrupts, engine status, MMU windows |
//! | [`config`] | [`ChipConfig`]: core count, submit limits, task-control encoding |
//!
//! # Core topology (RK3588)
//!
//! ```text
//!   core 0 ─┐                       one register bank per core,
//!   core 1 ─┼─ PC ─ CNA ─ CORE ─ DPU ─ RDMA ─ PPU ─ PPU_RDMA
//!   core 2 ─┘                       one interrupt line per core
//!
//!   core 0 bank also carries two IOMMU windows at +0x9000 / +0xa000
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod regs;

pub use config::ChipConfig;
