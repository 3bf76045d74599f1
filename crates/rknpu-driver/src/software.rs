// SPDX-License-Identifier: AGPL-3.0-only

//! Software (virtual NPU) platform
//!
//! Implements every [`crate::platform`] trait in plain Rust so the whole
//! driver runs without hardware:
//!
//! - [`SimRegisters`]: a register bank that latches commits when `PC_OP_EN`
//!   is pulsed and models the write-to-clear interrupt registers.
//! - [`SimAllocator`] / [`SimImporter`]: host memory with device addresses
//!   and a DMA-BUF registry keyed by file descriptor.
//! - [`SimIommu`], [`SimPower`], [`SimReset`]: bookkeeping stand-ins that
//!   record what the driver asked for.
//! - [`Responder`]: a thread that completes committed work after a latency
//!   and raises the interrupt, as the silicon would.
//!
//! ## Completion model
//!
//! ```text
//! driver: PC_OP_EN=1 ──► SimRegisters latches SimCommit (pending)
//! responder / test: complete_pending()
//!        ├─ task counter  = committed task count
//!        └─ INT_STATUS    = committed INT_MASK
//! responder / test: Device::handle_irq(core)
//! ```
//!
//! Tests drive completions by hand for deterministic interleavings; the
//! CLI and the end-to-end tests use the [`Responder`].

use crate::config::DriverConfig;
use crate::device::Device;
use crate::error::{NpuError, Result};
use crate::host::HostCoherentAllocator;
use crate::irq::IrqOutcome;
use crate::mmio::RegisterBank;
use crate::platform::{
    BufferImporter, DmaAllocator, DmaMemory, ImportedBuffer, IommuDomain, IommuProt, Platform, PowerRail,
    ResetControl, SgSegment,
};
use crate::sync::{lock, StopSignal};
use crate::task::TaskDescriptor;
use rknpu_chip::config::PAGE_SIZE;
use rknpu_chip::regs::{self, int, mmu};
use rknpu_chip::ChipConfig;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

/// One `PC_OP_EN` pulse as the registers stood at that moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimCommit {
    /// `PC_DATA_ADDR`
    pub data_addr: u32,
    /// `PC_DATA_AMOUNT`
    pub data_amount: u32,
    /// `INT_MASK`
    pub int_mask: u32,
    /// `PC_TASK_CONTROL`
    pub task_control: u32,
    /// `PC_DMA_BASE_ADDR`
    pub dma_base: u32,
    /// Task count decoded from the task control word
    pub task_number: u32,
}

#[derive(Debug, Default)]
struct RegState {
    values: HashMap<usize, u32>,
    writes: Vec<(usize, u32)>,
    commits: Vec<SimCommit>,
    pending: Option<SimCommit>,
    stalled: bool,
}

/// Simulated register bank for one core.
#[derive(Debug)]
pub struct SimRegisters {
    state: spin::Mutex<RegState>,
    task_status_offset: usize,
    task_number_mask: u32,
}

impl Default for SimRegisters {
    fn default() -> Self {
        Self::new()
    }
}

impl SimRegisters {
    /// All-zero bank laid out like an RK3588 core.
    pub fn new() -> Self {
        Self::for_chip(&ChipConfig::rk3588())
    }

    /// All-zero bank for `chip`.
    pub fn for_chip(chip: &ChipConfig) -> Self {
        Self {
            state: spin::Mutex::new(RegState::default()),
            task_status_offset: chip.pc_task_status_offset,
            task_number_mask: chip.pc_task_number_mask,
        }
    }

    /// Force a register value without going through write side effects.
    pub fn set(&self, offset: usize, value: u32) {
        self.state.lock().values.insert(offset, value);
    }

    /// Current register value.
    pub fn get(&self, offset: usize) -> u32 {
        self.state.lock().values.get(&offset).copied().unwrap_or(0)
    }

    /// Every write the driver made, oldest first.
    pub fn writes(&self) -> Vec<(usize, u32)> {
        self.state.lock().writes.clone()
    }

    /// Every commit latched so far, oldest first.
    pub fn commits(&self) -> Vec<SimCommit> {
        self.state.lock().commits.clone()
    }

    /// Forget recorded writes and commits.
    pub fn clear_log(&self) {
        let mut state = self.state.lock();
        state.writes.clear();
        state.commits.clear();
    }

    /// Whether a commit is waiting to complete.
    pub fn has_pending(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    /// A stalled core never completes its pending commit.
    pub fn stall(&self, stalled: bool) {
        self.state.lock().stalled = stalled;
    }

    /// Latch `status` into the interrupt registers.
    pub fn raise(&self, status: u32) {
        let mut state = self.state.lock();
        state.values.insert(regs::INT_STATUS, status);
        *state.values.entry(regs::INT_RAW_STATUS).or_insert(0) |= status;
    }

    /// Finish the pending commit: advance the task counter and raise its
    /// interrupt mask. Returns `false` if nothing was pending or the core is
    /// stalled.
    pub fn complete_pending(&self) -> bool {
        let mut state = self.state.lock();
        if state.stalled {
            return false;
        }
        let Some(commit) = state.pending.take() else {
            return false;
        };
        state.values.insert(self.task_status_offset, commit.task_number);
        state.values.insert(regs::INT_STATUS, commit.int_mask);
        *state.values.entry(regs::INT_RAW_STATUS).or_insert(0) |= commit.int_mask;
        true
    }

    /// Drop pending work and interrupt state, as a core reset would.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.pending = None;
        for offset in [regs::INT_STATUS, regs::INT_RAW_STATUS, self.task_status_offset] {
            state.values.remove(&offset);
        }
    }
}

impl RegisterBank for SimRegisters {
    fn read32(&self, offset: usize) -> u32 {
        self.get(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut state = self.state.lock();
        state.writes.push((offset, value));
        match offset {
            regs::INT_CLEAR => {
                for reg in [regs::INT_STATUS, regs::INT_RAW_STATUS] {
                    if let Some(v) = state.values.get_mut(&reg) {
                        *v &= !value;
                    }
                }
            }
            regs::PC_OP_EN if value == 1 => {
                let read = |reg: usize| state.values.get(&reg).copied().unwrap_or(0);
                let task_control = read(regs::PC_TASK_CONTROL);
                let commit = SimCommit {
                    data_addr: read(regs::PC_DATA_ADDR),
                    data_amount: read(regs::PC_DATA_AMOUNT),
                    int_mask: read(regs::INT_MASK),
                    task_control,
                    dma_base: read(regs::PC_DMA_BASE_ADDR),
                    task_number: task_control & self.task_number_mask,
                };
                state.commits.push(commit);
                state.pending = Some(commit);
                state.values.insert(offset, value);
            }
            _ => {
                state.values.insert(offset, value);
            }
        }
    }
}

/// Coherent allocator counting allocations and frees.
#[derive(Debug)]
pub struct SimAllocator {
    inner: HostCoherentAllocator,
    allocs: AtomicUsize,
    frees: Arc<AtomicUsize>,
    fail_next: AtomicBool,
}

impl SimAllocator {
    /// Allocator handing out device addresses below `iova_top`, leaving one
    /// unmapped page between buffers.
    pub fn new(iova_top: u64) -> Self {
        Self {
            inner: HostCoherentAllocator::new(iova_top).with_gap_pages(1),
            allocs: AtomicUsize::new(0),
            frees: Arc::new(AtomicUsize::new(0)),
            fail_next: AtomicBool::new(false),
        }
    }

    /// Make the next allocation fail.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Allocations currently alive.
    pub fn live(&self) -> usize {
        self.allocs.load(Ordering::SeqCst) - self.frees.load(Ordering::SeqCst)
    }

    /// Allocations made so far.
    pub fn allocations(&self) -> usize {
        self.allocs.load(Ordering::SeqCst)
    }
}

impl DmaAllocator for SimAllocator {
    fn alloc_coherent(&self, size: usize) -> Result<Box<dyn DmaMemory>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(NpuError::allocation(format!("injected failure for {size:#x} bytes")));
        }
        let inner = self.inner.alloc_coherent(size)?;
        self.allocs.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountedMemory {
            inner,
            frees: Arc::clone(&self.frees),
        }))
    }
}

#[derive(Debug)]
struct CountedMemory {
    inner: Box<dyn DmaMemory>,
    frees: Arc<AtomicUsize>,
}

impl DmaMemory for CountedMemory {
    fn dma_addr(&self) -> u64 {
        self.inner.dma_addr()
    }

    fn phys_addr(&self) -> u64 {
        self.inner.phys_addr()
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.inner.read_at(offset, buf)
    }

    fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.inner.write_at(offset, data)
    }
}

impl Drop for CountedMemory {
    fn drop(&mut self) {
        self.frees.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct Exported {
    segments: Vec<SgSegment>,
    backing: Arc<dyn DmaMemory>,
}

#[derive(Debug, Default)]
struct ImporterState {
    next_fd: u32,
    /// Next registered buffer ends at this device address
    iova_cursor: u64,
    buffers: HashMap<u32, Exported>,
    imports: HashMap<u32, usize>,
    released: HashMap<u32, usize>,
    device_syncs: HashMap<u32, usize>,
    cpu_syncs: HashMap<u32, usize>,
}

/// DMA-BUF registry standing in for other drivers' exported buffers.
#[derive(Debug)]
pub struct SimImporter {
    state: Arc<Mutex<ImporterState>>,
    backing: HostCoherentAllocator,
}

impl SimImporter {
    /// Registry placing buffers below `iova_top`.
    pub fn new(iova_top: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(ImporterState {
                next_fd: 100,
                iova_cursor: iova_top & !(PAGE_SIZE - 1),
                ..ImporterState::default()
            })),
            backing: HostCoherentAllocator::new(u64::MAX),
        }
    }

    /// Export a fresh contiguous buffer of `size` bytes. Returns its fd.
    ///
    /// # Panics
    ///
    /// Panics if host memory for the buffer cannot be allocated.
    pub fn register(&self, size: u64) -> u32 {
        let len = size.next_multiple_of(PAGE_SIZE);
        let dma = {
            let mut state = lock(&self.state);
            state.iova_cursor -= len + PAGE_SIZE;
            state.iova_cursor
        };
        self.register_segments(&[(dma, len)])
    }

    /// Export a buffer mapped as the given `(dma_addr, len)` segments.
    ///
    /// # Panics
    ///
    /// Panics if `segments` is empty or host memory cannot be allocated.
    pub fn register_segments(&self, segments: &[(u64, u64)]) -> u32 {
        assert!(!segments.is_empty(), "a buffer needs at least one segment");
        let total: u64 = segments.iter().map(|&(_, len)| len).sum();
        let size = usize::try_from(total.next_multiple_of(PAGE_SIZE)).unwrap_or(usize::MAX);
        let backing: Arc<dyn DmaMemory> = Arc::from(
            self.backing
                .alloc_coherent(size)
                .unwrap_or_else(|e| panic!("sim importer: {e}")),
        );

        let mut state = lock(&self.state);
        let fd = state.next_fd;
        state.next_fd += 1;
        state.buffers.insert(
            fd,
            Exported {
                segments: segments
                    .iter()
                    .map(|&(dma_addr, len)| SgSegment { dma_addr, len })
                    .collect(),
                backing,
            },
        );
        debug!("sim importer: fd={fd} segments={}", segments.len());
        fd
    }

    /// Imports of `fd` made so far.
    pub fn imported(&self, fd: u32) -> usize {
        lock(&self.state).imports.get(&fd).copied().unwrap_or(0)
    }

    /// Imports of `fd` released so far.
    pub fn released(&self, fd: u32) -> usize {
        lock(&self.state).released.get(&fd).copied().unwrap_or(0)
    }

    /// Device-direction syncs of `fd`.
    pub fn device_syncs(&self, fd: u32) -> usize {
        lock(&self.state).device_syncs.get(&fd).copied().unwrap_or(0)
    }

    /// CPU-direction syncs of `fd`.
    pub fn cpu_syncs(&self, fd: u32) -> usize {
        lock(&self.state).cpu_syncs.get(&fd).copied().unwrap_or(0)
    }

    /// Copy bytes into the exported buffer, as its producer would.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::NotFound`] for an unknown fd, or the bounds error.
    pub fn write(&self, fd: u32, offset: usize, data: &[u8]) -> Result<()> {
        let backing = self.backing_of(fd)?;
        backing.write_at(offset, data)
    }

    /// Copy bytes out of the exported buffer.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::NotFound`] for an unknown fd, or the bounds error.
    pub fn read(&self, fd: u32, offset: usize, buf: &mut [u8]) -> Result<()> {
        let backing = self.backing_of(fd)?;
        backing.read_at(offset, buf)
    }

    fn backing_of(&self, fd: u32) -> Result<Arc<dyn DmaMemory>> {
        lock(&self.state)
            .buffers
            .get(&fd)
            .map(|b| Arc::clone(&b.backing))
            .ok_or_else(|| NpuError::not_found(format!("fd {fd}")))
    }
}

impl BufferImporter for SimImporter {
    fn import(&self, handle: u32) -> Result<Box<dyn ImportedBuffer>> {
        let mut state = lock(&self.state);
        let Some(exported) = state.buffers.get(&handle) else {
            return Err(NpuError::import(format!("fd {handle} is not an exported buffer")));
        };
        let buffer = SimImportedBuffer {
            fd: handle,
            segments: exported.segments.clone(),
            backing: Arc::clone(&exported.backing),
            state: Arc::clone(&self.state),
        };
        *state.imports.entry(handle).or_insert(0) += 1;
        Ok(Box::new(buffer))
    }
}

#[derive(Debug)]
struct SimImportedBuffer {
    fd: u32,
    segments: Vec<SgSegment>,
    backing: Arc<dyn DmaMemory>,
    state: Arc<Mutex<ImporterState>>,
}

impl ImportedBuffer for SimImportedBuffer {
    fn segments(&self) -> &[SgSegment] {
        &self.segments
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.backing.read_at(offset, buf)
    }

    fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.backing.write_at(offset, data)
    }

    fn sync_for_device(&self) {
        *lock(&self.state).device_syncs.entry(self.fd).or_insert(0) += 1;
    }

    fn sync_for_cpu(&self) {
        *lock(&self.state).cpu_syncs.entry(self.fd).or_insert(0) += 1;
    }
}

impl Drop for SimImportedBuffer {
    fn drop(&mut self) {
        *lock(&self.state).released.entry(self.fd).or_insert(0) += 1;
    }
}

#[derive(Debug, Default)]
struct IommuState {
    /// Mapped page iova -> phys
    pages: BTreeMap<u64, u64>,
    peak: usize,
    attaches: usize,
    detaches: usize,
}

/// IOMMU domain recording page mappings.
#[derive(Debug, Default)]
pub struct SimIommu {
    state: Mutex<IommuState>,
}

impl SimIommu {
    /// Empty domain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pages currently mapped.
    pub fn mapped_pages(&self) -> usize {
        lock(&self.state).pages.len()
    }

    /// Most pages mapped at once.
    pub fn peak_mapped_pages(&self) -> usize {
        lock(&self.state).peak
    }

    /// Whether the page containing `iova` is mapped.
    pub fn is_mapped(&self, iova: u64) -> bool {
        lock(&self.state).pages.contains_key(&(iova & !(PAGE_SIZE - 1)))
    }

    /// Attach calls so far.
    pub fn attach_count(&self) -> usize {
        lock(&self.state).attaches
    }

    /// Detach calls so far.
    pub fn detach_count(&self) -> usize {
        lock(&self.state).detaches
    }
}

impl IommuDomain for SimIommu {
    fn attach(&self) -> Result<()> {
        lock(&self.state).attaches += 1;
        Ok(())
    }

    fn detach(&self) {
        lock(&self.state).detaches += 1;
    }

    fn map(&self, iova: u64, phys: u64, size: u64, _prot: IommuProt) -> Result<()> {
        let mut state = lock(&self.state);
        let pages: Vec<u64> = (iova..iova + size).step_by(PAGE_SIZE as usize).collect();
        if let Some(busy) = pages.iter().find(|page| state.pages.contains_key(page)) {
            return Err(NpuError::allocation(format!("iova {busy:#x} already mapped")));
        }
        for (i, page) in pages.into_iter().enumerate() {
            state.pages.insert(page, phys + i as u64 * PAGE_SIZE);
        }
        state.peak = state.peak.max(state.pages.len());
        Ok(())
    }

    fn unmap(&self, iova: u64, size: u64) -> u64 {
        let mut state = lock(&self.state);
        (iova..iova + size)
            .step_by(PAGE_SIZE as usize)
            .filter(|page| state.pages.remove(page).is_some())
            .count() as u64
            * PAGE_SIZE
    }
}

/// One power-rail transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerEvent {
    /// Clocks enabled
    ClocksOn,
    /// Clocks disabled
    ClocksOff,
    /// Power domain resumed
    DomainOn(usize),
    /// Power domain suspended
    DomainOff(usize),
    /// Main runtime resumed
    MainOn,
    /// Main runtime suspended
    MainOff,
}

/// Power rail logging every transition.
#[derive(Debug)]
pub struct SimPower {
    events: Mutex<Vec<PowerEvent>>,
    fail_domain: Mutex<Option<usize>>,
    clock_rate: u64,
}

impl Default for SimPower {
    fn default() -> Self {
        Self::new()
    }
}

impl SimPower {
    /// Rail clocked at 1 GHz.
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail_domain: Mutex::new(None),
            clock_rate: 1_000_000_000,
        }
    }

    /// Transitions so far, oldest first. Failed resumes are not logged.
    pub fn events(&self) -> Vec<PowerEvent> {
        lock(&self.events).clone()
    }

    /// Make every resume of `domain` fail.
    pub fn fail_domain(&self, domain: usize) {
        *lock(&self.fail_domain) = Some(domain);
    }

    fn log(&self, event: PowerEvent) {
        lock(&self.events).push(event);
    }
}

impl PowerRail for SimPower {
    fn enable_clocks(&self) -> Result<()> {
        self.log(PowerEvent::ClocksOn);
        Ok(())
    }

    fn disable_clocks(&self) {
        self.log(PowerEvent::ClocksOff);
    }

    fn resume_domain(&self, core: usize) -> Result<()> {
        if *lock(&self.fail_domain) == Some(core) {
            return Err(NpuError::device_fault(format!("power domain npu{core} failed to resume")));
        }
        self.log(PowerEvent::DomainOn(core));
        Ok(())
    }

    fn suspend_domain(&self, core: usize) {
        self.log(PowerEvent::DomainOff(core));
    }

    fn resume_main(&self) -> Result<()> {
        self.log(PowerEvent::MainOn);
        Ok(())
    }

    fn suspend_main(&self) {
        self.log(PowerEvent::MainOff);
    }

    fn clock_rate(&self) -> u64 {
        self.clock_rate
    }
}

/// Reset line that clears the simulated cores.
#[derive(Debug)]
pub struct SimReset {
    banks: Vec<Arc<SimRegisters>>,
    count: AtomicUsize,
}

impl SimReset {
    /// Reset line wired to `banks`.
    pub fn new(banks: Vec<Arc<SimRegisters>>) -> Self {
        Self {
            banks,
            count: AtomicUsize::new(0),
        }
    }

    /// Resets pulsed so far.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl ResetControl for SimReset {
    fn soft_reset(&self) -> Result<()> {
        self.count.fetch_add(1, Ordering::SeqCst);
        for bank in &self.banks {
            bank.reset();
        }
        Ok(())
    }
}

/// A complete simulated NPU.
#[derive(Debug)]
pub struct SoftwareNpu {
    /// Chip being simulated
    pub chip: ChipConfig,
    /// One bank per core
    pub regs: Vec<Arc<SimRegisters>>,
    /// Coherent allocator
    pub allocator: Arc<SimAllocator>,
    /// DMA-BUF registry
    pub importer: Arc<SimImporter>,
    /// IOMMU domain
    pub iommu: Arc<SimIommu>,
    /// Clocks and power domains
    pub power: Arc<SimPower>,
    /// Reset line
    pub reset: Arc<SimReset>,
}

impl SoftwareNpu {
    /// Value of the `VERSION` register.
    pub const VERSION: u32 = 0x4650_0000;
    /// Value of the `VERSION_NUM` register.
    pub const VERSION_NUM: u32 = 0x0002_0005;
    /// Hardware version the driver reports: `VERSION + (VERSION_NUM & 0xffff)`.
    pub const HW_VERSION: u32 = Self::VERSION + (Self::VERSION_NUM & 0xffff);
    /// Page-table base programmed in both MMU windows (valid bit clear).
    pub const DTE: u32 = 0x0010_0000;

    /// Simulated RK3588.
    pub fn rk3588() -> Self {
        Self::new(ChipConfig::rk3588())
    }

    /// Simulated `chip`.
    pub fn new(chip: ChipConfig) -> Self {
        let regs: Vec<Arc<SimRegisters>> = (0..chip.num_cores)
            .map(|_| Arc::new(SimRegisters::for_chip(&chip)))
            .collect();
        regs[0].set(regs::VERSION, Self::VERSION);
        regs[0].set(regs::VERSION_NUM, Self::VERSION_NUM);
        for window in mmu::WINDOWS {
            regs[0].set(window + mmu::DTE_ADDR, Self::DTE);
        }
        let top = chip.dma_limit().min(1 << 32);
        Self {
            chip,
            allocator: Arc::new(SimAllocator::new(top)),
            importer: Arc::new(SimImporter::new(top / 2)),
            iommu: Arc::new(SimIommu::new()),
            power: Arc::new(SimPower::new()),
            reset: Arc::new(SimReset::new(regs.clone())),
            regs,
        }
    }

    /// Platform bundle for [`Device::attach`].
    pub fn platform(&self) -> Platform {
        Platform {
            banks: self
                .regs
                .iter()
                .map(|r| Arc::clone(r) as Arc<dyn RegisterBank>)
                .collect(),
            allocator: self.allocator.clone(),
            importer: self.importer.clone(),
            iommu: Some(self.iommu.clone()),
            power: self.power.clone(),
            reset: self.reset.clone(),
        }
    }

    /// Attach a device to this NPU.
    ///
    /// # Errors
    ///
    /// Propagates [`Device::attach`] errors.
    pub fn attach(&self, config: DriverConfig) -> Result<Arc<Device>> {
        Device::attach(self.chip, config, self.platform())
    }

    /// Complete the pending commit on `core` and deliver its interrupt.
    /// Returns `None` if nothing was pending.
    pub fn complete(&self, device: &Device, core: usize) -> Option<IrqOutcome> {
        self.regs[core].complete_pending().then(|| device.handle_irq(core))
    }

    /// Raise `status` on `core` and deliver the interrupt.
    pub fn interrupt(&self, device: &Device, core: usize, status: u32) -> IrqOutcome {
        self.regs[core].raise(status);
        device.handle_irq(core)
    }

    /// Start a responder completing every commit after `latency`.
    pub fn responder(&self, device: &Arc<Device>, latency: Duration) -> Responder {
        Responder::spawn(self.regs.clone(), device, latency)
    }
}

/// Background thread completing committed work.
#[derive(Debug)]
pub struct Responder {
    stop: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl Responder {
    /// Poll `banks` every `latency`, completing pending commits and
    /// delivering their interrupts to `device`.
    pub fn spawn(banks: Vec<Arc<SimRegisters>>, device: &Arc<Device>, latency: Duration) -> Self {
        let stop = Arc::new(StopSignal::new());
        let weak: Weak<Device> = Arc::downgrade(device);
        let signal = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("rknpu-sim".into())
            .spawn(move || {
                while !signal.sleep(latency) {
                    let Some(device) = weak.upgrade() else {
                        break;
                    };
                    for (core, bank) in banks.iter().enumerate() {
                        if bank.complete_pending() {
                            device.handle_irq(core);
                        }
                    }
                }
            })
            .map_err(|e| tracing::warn!("responder not started: {e}"))
            .ok();
        info!("responder started, latency {}us", latency.as_micros());
        Self { stop, handle }
    }

    /// Stop and join the thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// `count` descriptors completing on the last event pair, each pointing at
/// its own 256-byte slice of a command buffer at `regcmd_base`.
pub fn synthetic_tasks(count: u32, regcmd_base: u64) -> Vec<TaskDescriptor> {
    (0..count)
        .map(|i| TaskDescriptor {
            op_idx: i,
            enable_mask: 0xd,
            int_mask: int::PAIRS[4],
            int_clear: int::CLEAR_ALL,
            regcfg_amount: 64,
            regcmd_addr: regcmd_base + u64::from(i) * 0x100,
            ..TaskDescriptor::default()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_en_latches_commit() {
        let bank = SimRegisters::new();
        bank.write32(regs::PC_DATA_ADDR, 0x1000);
        bank.write32(regs::INT_MASK, 0x300);
        bank.write32(regs::PC_TASK_CONTROL, 0x6005);
        bank.write32(regs::PC_OP_EN, 1);
        bank.write32(regs::PC_OP_EN, 0);
        let commits = bank.commits();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].task_number, 5);
        assert_eq!(commits[0].data_addr, 0x1000);

        assert!(bank.complete_pending());
        assert_eq!(bank.get(regs::INT_STATUS), 0x300);
        assert_eq!(bank.get(0x3c), 5);
        assert!(!bank.complete_pending());
    }

    #[test]
    fn int_clear_is_write_to_clear() {
        let bank = SimRegisters::new();
        bank.raise(0x301);
        bank.write32(regs::INT_CLEAR, 0x300);
        assert_eq!(bank.get(regs::INT_STATUS), 0x1);
        bank.write32(regs::INT_CLEAR, int::CLEAR_ALL);
        assert_eq!(bank.get(regs::INT_RAW_STATUS), 0);
    }

    #[test]
    fn stalled_core_never_completes() {
        let bank = SimRegisters::new();
        bank.write32(regs::PC_OP_EN, 1);
        bank.stall(true);
        assert!(!bank.complete_pending());
        assert!(bank.has_pending());
        bank.reset();
        assert!(!bank.has_pending());
    }

    #[test]
    fn iommu_rejects_double_map() {
        let iommu = SimIommu::new();
        iommu.map(0x1000, 0x9000, 0x2000, IommuProt::READ).unwrap();
        assert!(iommu.map(0x2000, 0x9000, 0x1000, IommuProt::READ).is_err());
        assert_eq!(iommu.mapped_pages(), 2);
        assert_eq!(iommu.unmap(0x1000, 0x3000), 0x2000);
        assert_eq!(iommu.mapped_pages(), 0);
    }

    #[test]
    fn allocator_counts_frees() {
        let alloc = SimAllocator::new(1 << 32);
        let a = alloc.alloc_coherent(0x1000).unwrap();
        let _b = alloc.alloc_coherent(0x1000).unwrap();
        drop(a);
        assert_eq!(alloc.allocations(), 2);
        assert_eq!(alloc.live(), 1);
        alloc.fail_next();
        assert!(alloc.alloc_coherent(0x1000).is_err());
        assert!(alloc.alloc_coherent(0x1000).is_ok());
    }

    #[test]
    fn imported_buffers_share_backing_and_count_releases() {
        let importer = SimImporter::new(1 << 31);
        let fd = importer.register(0x1000);
        importer.write(fd, 0, &[7, 8]).unwrap();
        let buf = importer.import(fd).unwrap();
        let mut out = [0u8; 2];
        buf.read_at(0, &mut out).unwrap();
        assert_eq!(out, [7, 8]);
        buf.sync_for_device();
        drop(buf);
        assert_eq!(importer.imported(fd), 1);
        assert_eq!(importer.released(fd), 1);
        assert_eq!(importer.device_syncs(fd), 1);
    }

    #[test]
    fn npu_presets_identity_registers() {
        let npu = SoftwareNpu::rk3588();
        assert_eq!(npu.regs.len(), 3);
        assert_eq!(npu.regs[0].get(regs::VERSION), SoftwareNpu::VERSION);
        assert_eq!(npu.regs[0].get(mmu::MMU1_BASE), SoftwareNpu::DTE);
        assert!(npu.platform().iommu.is_some());
    }

    #[test]
    fn synthetic_tasks_complete_on_one_pair() {
        let tasks = synthetic_tasks(3, 0x10_0000);
        assert_eq!(tasks[2].regcmd_addr, 0x10_0200);
        assert!(tasks.iter().all(|t| t.int_mask == 0x300));
    }
}
