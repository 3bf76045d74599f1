//! Command-submission and memory-management core for the Rockchip RK3588 NPU.
//!
//! The crate drives the NPU's three cores through their register banks: it
//! owns client buffers, queues jobs per core, splits them into hardware
//! commits, matches completion interrupts, and recovers from hung jobs with
//! a soft reset. Everything the host platform provides (register windows,
//! coherent memory, DMA-BUF import, the IOMMU, clocks, reset lines) comes in
//! through the traits in [`platform`].
//!
//! # Data flow
//!
//! ```text
//! Session::create ──► MemoryManager ──► DmaAllocator / BufferImporter
//! Session::submit ──► Device ──► guard pages ──► Scheduler ──► RegisterBank
//!                                                    ▲
//! Device::handle_irq ──► irq ──► Scheduler ──────────┘  (next chunk / wake)
//! ```
//!
//! # Quick start (software NPU)
//!
//! ```no_run
//! use rknpu_driver::software::{synthetic_tasks, SoftwareNpu};
//! use rknpu_driver::{DriverConfig, SubmitRequest};
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let npu = SoftwareNpu::rk3588();
//! let device = npu.attach(DriverConfig::default())?;
//! let _responder = npu.responder(&device, Duration::from_micros(200));
//!
//! let session = device.open_session();
//! let tasks = session.create(16 * 40, None)?;
//! session
//!     .object(tasks.object_id)?
//!     .write_tasks(&synthetic_tasks(16, 0x10_0000))?;
//!
//! let outcome = session.submit(&SubmitRequest::new(tasks.object_id, 0, 16))?;
//! println!("{} tasks in {:?}", outcome.task_counter, outcome.hw_elapsed);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod action;
pub mod config;
mod device;
pub mod diag;
mod error;
pub mod guard;
pub mod host;
pub mod irq;
pub mod job;
pub mod memory;
pub mod mmio;
pub mod platform;
pub mod power;
mod scheduler;
mod session;
pub mod software;
pub mod sync;
pub mod task;

pub use action::Action;
pub use config::DriverConfig;
pub use device::Device;
pub use error::{errno, NpuError, Result};
pub use irq::IrqOutcome;
pub use job::{CoreMask, Job, JobMode, JobState, SubcoreTask, SubmitOutcome, SubmitRequest};
pub use memory::{MemInfo, MemoryObject, ObjectId, SyncFlags};
pub use session::Session;
pub use task::TaskDescriptor;

/// Silicon model (re-exported from rknpu-chip).
pub use rknpu_chip as chip;
