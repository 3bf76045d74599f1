//! The device: aggregate root of one attached NPU.
//!
//! Owns the scheduler, memory manager and power controller, runs the
//! load sampler, and implements the submission path every session goes
//! through.

use crate::action::{driver_version_code, Action};
use crate::config::DriverConfig;
use crate::diag::{self, IommuSnapshot};
use crate::error::{NpuError, Result};
use crate::guard::GuardPages;
use crate::irq::{self, IrqOutcome};
use crate::job::{CoreMask, Job, JobMode, SubmitOutcome, SubmitRequest, MAX_CORES};
use crate::memory::{MemoryManager, MemoryObject, SyncFlags};
use crate::platform::Platform;
use crate::power::{PowerController, PowerSettings};
use crate::scheduler::Scheduler;
use crate::session::Session;
use crate::sync::{lock, StopSignal};
use rknpu_chip::regs;
use rknpu_chip::ChipConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// One attached NPU.
#[derive(Debug)]
pub struct Device {
    chip: ChipConfig,
    config: DriverConfig,
    platform: Platform,
    iommu_enabled: bool,
    scheduler: Scheduler,
    memory: MemoryManager,
    power: PowerController,
    /// References taken through [`Action::PowerOn`]
    cmdline_power: Mutex<usize>,
    reset_lock: Mutex<()>,
    sessions: AtomicUsize,
    sampler_stop: Arc<StopSignal>,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

impl Device {
    /// Bring up an NPU on `platform`.
    ///
    /// Checks that one register bank per core is present, cycles power once
    /// to verify the rails, and starts the load sampler.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::InvalidArgument`] if the bank count does not match
    /// the chip, or the platform error if the initial power cycle fails.
    pub fn attach(chip: ChipConfig, config: DriverConfig, platform: Platform) -> Result<Arc<Self>> {
        if chip.num_cores == 0 || chip.num_cores > MAX_CORES {
            return Err(NpuError::invalid_argument(format!(
                "{} cores not supported (1..={MAX_CORES})",
                chip.num_cores
            )));
        }
        if platform.banks.len() != chip.num_cores {
            return Err(NpuError::invalid_argument(format!(
                "{} needs {} register banks, got {}",
                chip.name,
                chip.num_cores,
                platform.banks.len()
            )));
        }

        let iommu_enabled = config.iommu_enabled && platform.iommu.is_some();
        let power = PowerController::new(
            Arc::clone(&platform.power),
            platform.iommu.clone().filter(|_| iommu_enabled),
            Arc::clone(&platform.banks[0]),
            PowerSettings {
                multiple_domains: chip.multiple_power_domains,
                num_domains: chip.num_cores,
                put_delay: config.power_put_delay,
                iommu_settle: config.iommu_settle,
            },
        );
        power.acquire()?;
        let hw_version = hw_version(platform.banks[0].as_ref());
        power.release();

        let device = Arc::new(Self {
            chip,
            scheduler: Scheduler::new(chip, platform.banks.clone()),
            memory: MemoryManager::new(Arc::clone(&platform.allocator), Arc::clone(&platform.importer)),
            power,
            iommu_enabled,
            cmdline_power: Mutex::new(0),
            reset_lock: Mutex::new(()),
            sessions: AtomicUsize::new(0),
            sampler_stop: Arc::new(StopSignal::new()),
            sampler: Mutex::new(None),
            platform,
            config,
        });
        device.start_sampler();

        tracing::info!(
            "{}: attached, {} cores, hw version {hw_version:#x}, iommu {}",
            chip.name,
            chip.num_cores,
            if iommu_enabled { "on" } else { "off" }
        );
        Ok(device)
    }

    fn start_sampler(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let stop = Arc::clone(&self.sampler_stop);
        let interval = self.config.load_interval;
        let spawned = thread::Builder::new().name("rknpu-load".into()).spawn(move || {
            while !stop.sleep(interval) {
                let Some(device) = weak.upgrade() else {
                    break;
                };
                device.scheduler.sample_load();
            }
        });
        match spawned {
            Ok(handle) => *lock(&self.sampler) = Some(handle),
            Err(e) => tracing::warn!("load sampler not started: {e}"),
        }
    }

    /// Open a client session.
    pub fn open_session(self: &Arc<Self>) -> Session {
        let n = self.sessions.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!("session open ({n} live)");
        Session::new(Arc::clone(self))
    }

    pub(crate) fn session_closed(&self) {
        let n = self.sessions.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        tracing::debug!("session close ({n} live)");
    }

    /// Live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.load(Ordering::Relaxed)
    }

    /// Chip constants.
    pub fn chip(&self) -> &ChipConfig {
        &self.chip
    }

    /// Runtime tunables.
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Whether submissions run behind the IOMMU.
    pub fn iommu_enabled(&self) -> bool {
        self.iommu_enabled
    }

    /// Power controller.
    pub fn power(&self) -> &PowerController {
        &self.power
    }

    pub(crate) fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    /// Interrupt entry for `core`.
    pub fn handle_irq(&self, core: usize) -> IrqOutcome {
        if self.config.bypass_irq_handler {
            return IrqOutcome::Bypassed;
        }
        if core >= self.chip.num_cores {
            tracing::warn!("irq: no core {core}");
            return IrqOutcome::NoJob;
        }
        irq::handle(&self.scheduler, core)
    }

    /// Busy percentage of each core over the last sampling window.
    pub fn core_load(&self) -> Vec<u32> {
        self.scheduler.core_load(self.config.load_interval)
    }

    /// Tasks queued or running per core.
    pub fn queued_tasks(&self) -> Vec<u64> {
        self.scheduler.queued_tasks()
    }

    /// Whether no job is queued or running.
    pub fn is_idle(&self) -> bool {
        self.scheduler.is_idle()
    }

    /// Every non-zero register of every named block, per core.
    pub fn dump_registers(&self) -> String {
        diag::dump_registers(self.scheduler.banks())
    }

    /// Run an auxiliary action.
    ///
    /// # Errors
    ///
    /// Propagates soft-reset and power-on failures.
    pub fn action(&self, action: Action) -> Result<u32> {
        let value = match action {
            Action::GetHwVersion => hw_version(self.scheduler.bank(0)),
            Action::GetDrvVersion => driver_version_code(),
            Action::GetFreq => u32::try_from(self.platform.power.clock_rate()).unwrap_or(u32::MAX),
            Action::ActReset => {
                self.soft_reset()?;
                0
            }
            Action::GetIommuEn => u32::from(self.iommu_enabled),
            Action::SetProcNice(nice) => {
                tracing::debug!("action: nice {nice} ignored");
                0
            }
            Action::GetTotalSramSize | Action::GetFreeSramSize | Action::GetIommuDomainId => 0,
            Action::SetIommuDomainId(id) => {
                tracing::debug!("action: single iommu domain, id {id} ignored");
                0
            }
            Action::PowerOn => {
                let mut count = lock(&self.cmdline_power);
                self.power.acquire()?;
                *count += 1;
                0
            }
            Action::PowerOff => {
                let mut count = lock(&self.cmdline_power);
                if *count > 0 {
                    *count -= 1;
                    self.power.release();
                }
                0
            }
        };
        Ok(value)
    }

    /// Reset every core, aborting whatever is on hardware.
    ///
    /// Queued jobs survive and are dispatched once the reset completes.
    ///
    /// # Errors
    ///
    /// Returns the reset-line error; the scheduler is resumed regardless.
    pub fn soft_reset(&self) -> Result<()> {
        if self.config.bypass_soft_reset {
            tracing::warn!("bypass soft reset");
            return Ok(());
        }
        let _reset = lock(&self.reset_lock);
        tracing::info!("soft reset");
        self.scheduler.begin_reset();

        let result = self.platform.reset.soft_reset();
        if let Err(e) = &result {
            tracing::error!("soft reset failed: {e}");
        }
        if self.iommu_enabled {
            if let Some(domain) = &self.platform.iommu {
                domain.detach();
                if let Err(e) = domain.attach() {
                    tracing::error!("soft reset: iommu re-attach failed: {e}");
                }
            }
        }

        self.scheduler.end_reset();
        result
    }

    /// Submit `request` on behalf of a session owning `objects`.
    pub(crate) fn submit(&self, objects: &[Arc<MemoryObject>], request: &SubmitRequest) -> Result<SubmitOutcome> {
        self.validate(request)?;

        let task_obj = objects
            .iter()
            .find(|obj| obj.id() == request.task_obj)
            .cloned()
            .ok_or_else(|| NpuError::not_found(format!("task buffer {}", request.task_obj)))?;
        let task_base_addr = if request.task_base_addr == 0 {
            tracing::debug!("submit: task_base_addr fallback to {:#x}", task_obj.dma_addr());
            task_obj.dma_addr()
        } else {
            request.task_base_addr
        };
        tracing::debug!(
            "submit: flags={:#x} tasks={} task_base={task_base_addr:#x} core_mask={:#x}",
            request.mode.bits(),
            request.task_number,
            request.core_mask.bits()
        );

        let guard = self.map_guard_pages(objects);
        let imported: Vec<&Arc<MemoryObject>> = objects.iter().filter(|obj| obj.is_imported()).collect();
        for obj in &imported {
            obj.sync(SyncFlags::TO_DEVICE);
        }

        let result = self.scheduler.enqueue(request, task_obj, task_base_addr).and_then(|job| {
            if request.mode.contains(JobMode::NONBLOCK) {
                return Ok(SubmitOutcome {
                    task_counter: 0,
                    hw_elapsed: Duration::ZERO,
                    core_mask: job.core_mask(),
                    job,
                });
            }
            match self.scheduler.wait(&job, self.config.wait_retries) {
                Ok(task_counter) => Ok(SubmitOutcome {
                    task_counter,
                    hw_elapsed: job.hw_elapsed(),
                    core_mask: job.core_mask(),
                    job,
                }),
                Err(e) => {
                    self.abort(&job, &e);
                    Err(e)
                }
            }
        });

        for obj in &imported {
            obj.sync(SyncFlags::FROM_DEVICE);
        }
        drop(guard);
        result
    }

    fn validate(&self, request: &SubmitRequest) -> Result<()> {
        if request.task_number == 0 {
            return Err(NpuError::invalid_argument("task number must be non-zero"));
        }
        let mask = request.core_mask;
        if mask.bits() & !self.chip.core_mask != 0 {
            return Err(NpuError::invalid_argument(format!(
                "core mask {:#x} outside supported {:#x}",
                mask.bits(),
                self.chip.core_mask
            )));
        }
        if !mask.is_supported_combination() {
            return Err(NpuError::invalid_argument(format!(
                "core mask {:#x} is not a runnable combination",
                mask.bits()
            )));
        }
        if !request.mode.contains(JobMode::PC) {
            return Err(NpuError::invalid_argument("only PC mode submissions are supported"));
        }
        Ok(())
    }

    fn map_guard_pages(&self, objects: &[Arc<MemoryObject>]) -> Option<GuardPages> {
        if !self.iommu_enabled || objects.is_empty() {
            return None;
        }
        let domain = self.platform.iommu.as_ref()?;
        let ranges: Vec<_> = objects.iter().map(|obj| obj.range()).collect();
        GuardPages::map(
            domain,
            self.platform.allocator.as_ref(),
            &ranges,
            self.config.guard_max_pages,
            self.config.guard_below_pages,
        )
    }

    /// Tear down a job whose wait failed.
    fn abort(&self, job: &Arc<Job>, err: &NpuError) {
        let timed_out = matches!(err, NpuError::Timeout { .. });
        let reached_hw = self.scheduler.abort(job, !timed_out);

        if timed_out && reached_hw {
            tracing::error!("job {} timeout, flags: {:#x}:", job.id(), job.mode().bits());
            for snap in self.scheduler.snapshot(job) {
                tracing::error!("\t{snap}, elapsed={}us", job.age().as_micros());
            }
            for line in IommuSnapshot::capture(self.scheduler.bank(0)).to_string().lines() {
                tracing::error!("\t{line}");
            }
            if let Err(e) = self.soft_reset() {
                tracing::error!("job {}: recovery reset failed: {e}", job.id());
            }
        } else {
            tracing::error!(
                "job {} abort, flags: {:#x}, err: {err}, elapsed: {}us",
                job.id(),
                job.mode().bits(),
                job.age().as_micros()
            );
        }
        if timed_out {
            self.scheduler.kick(job.core_mask());
        }
    }

    /// Cores the device exposes.
    pub fn core_mask(&self) -> CoreMask {
        CoreMask::from_bits_truncate(self.chip.core_mask)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        debug_assert!(self.scheduler.is_idle(), "device detached with jobs in flight");
        self.sampler_stop.stop();
        if let Some(handle) = lock(&self.sampler).take() {
            // the sampler may hold the last reference for a moment
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        tracing::info!("{}: detached", self.chip.name);
    }
}

fn hw_version(bank0: &dyn crate::mmio::RegisterBank) -> u32 {
    bank0
        .read32(regs::VERSION)
        .wrapping_add(bank0.read32(regs::VERSION_NUM) & 0xffff)
}
