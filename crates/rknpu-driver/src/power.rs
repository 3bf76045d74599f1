//! Power lifecycle.
//!
//! A reference count gates the NPU's clocks and power domains. The first
//! reference powers on; the last one either powers off immediately
//! ([`PowerController::release`]) or arms a grace timer
//! ([`PowerController::release_delayed`]) so back-to-back jobs do not pay
//! for a power cycle each. The pending timer holds one reference of its
//! own, consumed when it fires.
//!
//! The IOMMU forgets its directory table across a power gate, so every
//! power-on re-attaches the domain and forces the DTE valid bit back on.

use crate::error::Result;
use crate::mmio::RegisterBank;
use crate::platform::{IommuDomain, PowerRail};
use crate::sync::lock;
use rknpu_chip::regs::mmu;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Power-related tunables.
#[derive(Debug, Clone, Copy)]
pub struct PowerSettings {
    /// Resume and suspend one domain per core.
    pub multiple_domains: bool,
    /// Number of per-core domains.
    pub num_domains: usize,
    /// Grace period for [`PowerController::release_delayed`]. Zero releases immediately.
    pub put_delay: Duration,
    /// Pause before suspending the domains when the IOMMU is in use.
    pub iommu_settle: Duration,
}

#[derive(Debug, Default)]
struct PowerState {
    refcount: usize,
    powered: bool,
    cycles: u64,
}

#[derive(Debug, Default)]
struct Timer {
    deadline: Option<Instant>,
    stopped: bool,
}

#[derive(Debug)]
struct Shared {
    /// Refcount and rail state. Lock order: `state` before `timer`.
    state: Mutex<PowerState>,
    timer: Mutex<Timer>,
    timer_cond: Condvar,
    rail: Arc<dyn PowerRail>,
    iommu: Option<Arc<dyn IommuDomain>>,
    bank0: Arc<dyn RegisterBank>,
    settings: PowerSettings,
}

/// Reference-counted NPU power.
#[derive(Debug)]
pub struct PowerController {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl PowerController {
    /// Controller for `rail`, starting powered off.
    ///
    /// `iommu` is re-attached after every power-on; `bank0` is core 0's
    /// register bank, which holds the IOMMU windows.
    pub fn new(
        rail: Arc<dyn PowerRail>,
        iommu: Option<Arc<dyn IommuDomain>>,
        bank0: Arc<dyn RegisterBank>,
        settings: PowerSettings,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(PowerState::default()),
            timer: Mutex::new(Timer::default()),
            timer_cond: Condvar::new(),
            rail,
            iommu,
            bank0,
            settings,
        });
        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("rknpu-power-off".into())
                .spawn(move || shared.run_timer())
        };
        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!("power: no delayed power-off worker ({e}), releases will be immediate");
                None
            }
        };
        Self { shared, worker }
    }

    /// Take a power reference, powering on if it is the first.
    ///
    /// # Errors
    ///
    /// Returns the platform error if power-on fails; the reference is not taken.
    pub fn acquire(&self) -> Result<()> {
        let mut state = lock(&self.shared.state);
        state.refcount += 1;
        if state.refcount == 1 && !state.powered {
            if let Err(e) = self.shared.power_on() {
                state.refcount -= 1;
                return Err(e);
            }
            state.powered = true;
            state.cycles += 1;
        }
        Ok(())
    }

    /// Drop a power reference, powering off now if it was the last.
    pub fn release(&self) {
        self.shared.release();
    }

    /// Drop a power reference, powering off after the grace period if it
    /// was the last.
    pub fn release_delayed(&self) {
        if self.shared.settings.put_delay.is_zero() || self.worker.is_none() {
            self.release();
            return;
        }
        let state = lock(&self.shared.state);
        if state.refcount == 1 {
            let mut timer = lock(&self.shared.timer);
            if timer.deadline.is_none() {
                timer.deadline = Some(Instant::now() + self.shared.settings.put_delay);
                self.shared.timer_cond.notify_all();
            }
        } else {
            drop(state);
            self.shared.release();
        }
    }

    /// Scoped reference released with the grace period.
    ///
    /// # Errors
    ///
    /// Returns the platform error if power-on fails.
    pub fn guard(&self) -> Result<PowerGuard<'_>> {
        self.acquire()?;
        Ok(PowerGuard { power: self })
    }

    /// Outstanding references, including a pending grace timer.
    pub fn refcount(&self) -> usize {
        lock(&self.shared.state).refcount
    }

    /// Whether the rails are currently on.
    pub fn is_powered(&self) -> bool {
        lock(&self.shared.state).powered
    }

    /// Completed power-on transitions.
    pub fn power_cycles(&self) -> u64 {
        lock(&self.shared.state).cycles
    }

    /// Whether a delayed power-off is armed.
    pub fn off_pending(&self) -> bool {
        lock(&self.shared.timer).deadline.is_some()
    }
}

impl Drop for PowerController {
    fn drop(&mut self) {
        {
            let mut timer = lock(&self.shared.timer);
            timer.stopped = true;
            timer.deadline = None;
        }
        self.shared.timer_cond.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        let mut state = lock(&self.shared.state);
        if state.powered {
            self.shared.power_off();
            state.powered = false;
            state.refcount = 0;
        }
    }
}

impl Shared {
    fn release(&self) {
        let mut state = lock(&self.state);
        if state.refcount == 0 {
            return;
        }
        state.refcount -= 1;
        if state.refcount == 0 && state.powered {
            self.power_off();
            state.powered = false;
        }
    }

    fn run_timer(&self) {
        let mut timer = lock(&self.timer);
        loop {
            if timer.stopped {
                return;
            }
            let deadline = timer.deadline;
            match deadline {
                None => {
                    timer = self.timer_cond.wait(timer).unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now < deadline {
                        timer = self
                            .timer_cond
                            .wait_timeout(timer, deadline - now)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0;
                        continue;
                    }
                    timer.deadline = None;
                    // never hold the timer while taking the state lock
                    drop(timer);
                    tracing::debug!("power: grace period expired");
                    self.release();
                    timer = lock(&self.timer);
                }
            }
        }
    }

    fn power_on(&self) -> Result<()> {
        let s = &self.settings;
        self.rail.enable_clocks()?;

        let mut resumed = 0;
        if s.multiple_domains {
            for core in 0..s.num_domains {
                if let Err(e) = self.rail.resume_domain(core) {
                    tracing::error!("power_on: npu{core} domain failed: {e}");
                    for prev in (0..resumed).rev() {
                        self.rail.suspend_domain(prev);
                    }
                    self.rail.disable_clocks();
                    return Err(e);
                }
                resumed += 1;
            }
        }

        if let Err(e) = self.rail.resume_main() {
            tracing::error!("power_on: main runtime failed: {e}");
            for prev in (0..resumed).rev() {
                self.rail.suspend_domain(prev);
            }
            self.rail.disable_clocks();
            return Err(e);
        }

        if let Some(domain) = &self.iommu {
            domain.detach();
            if let Err(e) = domain.attach() {
                tracing::error!("power_on: iommu re-attach failed: {e}");
            }
            self.force_dte_valid();
        }
        tracing::info!("NPU powered on");
        Ok(())
    }

    fn force_dte_valid(&self) {
        let [w0, w1] = mmu::WINDOWS;
        let dte0 = self.bank0.read32(w0 + mmu::DTE_ADDR);
        let dte1 = self.bank0.read32(w1 + mmu::DTE_ADDR);
        tracing::debug!("power_on: DTE_CHECK mmu0={dte0:#x} mmu1={dte1:#x}");
        if dte0 != 0 && dte0 & mmu::DTE_VALID == 0 {
            self.bank0.write32(w0 + mmu::DTE_ADDR, dte0 | mmu::DTE_VALID);
            self.bank0.write32(w1 + mmu::DTE_ADDR, dte1 | mmu::DTE_VALID);
            tracing::info!(
                "power_on: DTE_FORCED mmu0={:#x} mmu1={:#x}",
                self.bank0.read32(w0 + mmu::DTE_ADDR),
                self.bank0.read32(w1 + mmu::DTE_ADDR)
            );
        }
    }

    fn power_off(&self) {
        let s = &self.settings;
        self.rail.suspend_main();
        if s.multiple_domains {
            if self.iommu.is_some() && !s.iommu_settle.is_zero() {
                thread::sleep(s.iommu_settle);
            }
            for core in (0..s.num_domains).rev() {
                self.rail.suspend_domain(core);
            }
        }
        self.rail.disable_clocks();
        tracing::info!("NPU powered off");
    }
}

/// A power reference released with the grace period on drop.
#[derive(Debug)]
pub struct PowerGuard<'a> {
    power: &'a PowerController,
}

impl Drop for PowerGuard<'_> {
    fn drop(&mut self) {
        self.power.release_delayed();
    }
}
