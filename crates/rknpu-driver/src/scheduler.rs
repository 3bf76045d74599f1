//! Job scheduler.
//!
//! Each core has a FIFO todo list and at most one active job. All of it,
//! plus every job's progress and every register write that starts work,
//! sits behind one [`spin::Mutex`] that the interrupt path also takes, so
//! nothing under it may block. Waiters sleep on per-core [`WaitQueue`]s;
//! wakeups decided under the lock are collected and delivered after it is
//! released.
//!
//! ```text
//!  enqueue ──► todo[c] ──try_dispatch──► active[c] ──run_count==0──► commit (all cores)
//!                                            │
//!                              on_interrupt ─┤ more chunks ─► commit next chunk
//!                                            └ last chunk ──► interrupt_count==0 ─► Done, wake
//! ```

use crate::diag::{self, CoreSnapshot};
use crate::error::{NpuError, Result};
use crate::irq::{fuzz_status, IrqOutcome};
use crate::job::{CoreMask, Job, JobMode, JobState, SubmitRequest};
use crate::memory::MemoryObject;
use crate::mmio::RegisterBank;
use crate::sync::WaitQueue;
use rknpu_chip::regs::{self, engine, int};
use rknpu_chip::ChipConfig;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-core queue state.
#[derive(Debug, Default)]
pub(crate) struct SubcoreData {
    todo: VecDeque<Arc<Job>>,
    active: Option<Arc<Job>>,
    /// Tasks queued or running on this core
    task_num: u64,
    busy_time: Duration,
    total_busy_time: Duration,
}

/// The scheduler of one device.
#[derive(Debug)]
pub(crate) struct Scheduler {
    chip: ChipConfig,
    banks: Vec<Arc<dyn RegisterBank>>,
    cores: spin::Mutex<Vec<SubcoreData>>,
    wait_queues: Vec<WaitQueue>,
    resetting: AtomicBool,
    next_job_id: AtomicU64,
}

impl Scheduler {
    pub(crate) fn new(chip: ChipConfig, banks: Vec<Arc<dyn RegisterBank>>) -> Self {
        let n = banks.len();
        Self {
            chip,
            banks,
            cores: spin::Mutex::new((0..n).map(|_| SubcoreData::default()).collect()),
            wait_queues: (0..n).map(|_| WaitQueue::new()).collect(),
            resetting: AtomicBool::new(false),
            next_job_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn chip(&self) -> &ChipConfig {
        &self.chip
    }

    pub(crate) fn bank(&self, core: usize) -> &dyn RegisterBank {
        self.banks[core].as_ref()
    }

    pub(crate) fn banks(&self) -> &[Arc<dyn RegisterBank>] {
        &self.banks
    }

    fn all_cores(&self) -> CoreMask {
        CoreMask::from_bits_truncate(self.chip.core_mask)
    }

    /// Queue a job and start it on any idle participating core.
    ///
    /// Auto masks resolve to the core with the fewest queued tasks (lowest
    /// index on ties) inside the same critical section that queues the job.
    pub(crate) fn enqueue(
        &self,
        request: &SubmitRequest,
        task_obj: Arc<MemoryObject>,
        task_base_addr: u64,
    ) -> Result<Arc<Job>> {
        let mut wakes = CoreMask::empty();
        let job = {
            let mut cores = self.cores.lock();
            // ids follow queue order
            let id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
            let mask = if request.core_mask.is_auto() {
                CoreMask::for_core(least_loaded(&cores))
            } else {
                request.core_mask
            };
            let job = Arc::new(Job::new(id, request, mask, task_obj, task_base_addr)?);

            for core in mask.cores() {
                let sub = &mut cores[core];
                sub.todo.push_back(Arc::clone(&job));
                sub.task_num += u64::from(job.core_tasks(core).task_number);
            }
            tracing::debug!(
                "submit: job {id} mask={:#x} tasks={}+{} base={:#x}",
                mask.bits(),
                request.task_start,
                request.task_number,
                task_base_addr
            );
            for core in mask.cores() {
                self.try_dispatch(&mut cores, core, &mut wakes);
            }
            job
        };
        self.wake(wakes);
        Ok(job)
    }

    /// Start the head of `core`'s todo list if the core is idle.
    ///
    /// Caller holds the core-queue lock.
    fn try_dispatch(&self, cores: &mut [SubcoreData], core: usize, wakes: &mut CoreMask) {
        let mut pending = CoreMask::for_core(core);
        while let Some(c) = pending.cores().next() {
            pending.remove(CoreMask::for_core(c));
            if let Some(freed) = self.dispatch_one(cores, c, wakes) {
                pending |= freed;
            }
        }
    }

    /// One dispatch step on `core`. Returns the cores freed when the
    /// commit failed and the job was torn down.
    fn dispatch_one(&self, cores: &mut [SubcoreData], core: usize, wakes: &mut CoreMask) -> Option<CoreMask> {
        if self.resetting.load(Ordering::Acquire) {
            return None;
        }
        let sub = &mut cores[core];
        if sub.active.is_some() {
            return None;
        }
        let job = loop {
            let job = sub.todo.pop_front()?;
            if !job.is_finished() {
                break job;
            }
            sub.task_num = sub.task_num.saturating_sub(u64::from(job.core_tasks(core).task_number));
            tracing::debug!("dispatch: core={core} skipping finished job {}", job.id());
        };
        sub.active = Some(Arc::clone(&job));
        {
            let now = Instant::now();
            let mut progress = job.progress.lock();
            progress.commit_time = Some(now);
            progress.recorder_time = Some(now);
        }

        if !job.run_count.decrement_and_test() {
            return None;
        }
        for c in job.core_mask().cores() {
            if let Err(e) = self.commit_core(&job, c) {
                tracing::error!("commit: job {} core {c} failed: {e}", job.id());
                self.fail_commit(cores, &job, e, wakes);
                return Some(job.core_mask());
            }
        }
        None
    }

    /// Tear down a job whose commit failed and wake its waiter.
    fn fail_commit(&self, cores: &mut [SubcoreData], job: &Arc<Job>, err: NpuError, wakes: &mut CoreMask) {
        detach(cores, job);
        job.progress.lock().commit_error = Some(err.to_string());
        job.set_state(JobState::Aborted);
        *wakes |= CoreMask::for_core(job.core_mask().wait_core());
    }

    /// Program `core` with the job's next chunk and start it.
    ///
    /// Caller holds the core-queue lock.
    fn commit_core(&self, job: &Job, core: usize) -> Result<()> {
        let bank = self.bank(core);

        // slave mode first
        bank.write32(regs::PC_DATA_ADDR, 1);
        if !job.mode().contains(JobMode::PC) {
            return Err(NpuError::invalid_argument("only PC mode jobs can be committed"));
        }

        let mut progress = job.progress.lock();
        let chunk = job.chunk(core, progress.submit_count[core], self.chip.max_submit_number);
        if chunk.task_number == 0 {
            return Err(NpuError::invalid_argument(format!("core {core} has no tasks left")));
        }
        let task_end = chunk.task_start + chunk.task_number - 1;

        if self.chip.num_cores > 1 {
            let selector = engine::stream_selector(core);
            bank.write32(engine::CNA_S_POINTER, selector);
            bank.write32(engine::CORE_S_POINTER, selector);
        }

        let task_obj = job.task_obj();
        let first = task_obj.read_task(chunk.task_start)?;
        let last = task_obj.read_task(task_end)?;
        let pingpong = job.mode().contains(JobMode::PINGPONG);
        let data_amount = self.chip.data_amount(first.regcfg_amount);
        let task_control = self.chip.task_control(chunk.task_number, pingpong);
        // the registers are 32 bits wide
        #[allow(clippy::cast_possible_truncation)]
        let (regcmd_addr, task_base) = (first.regcmd_addr as u32, job.task_base_addr() as u32);

        tracing::debug!(
            "commit_pc: core={core} task_start={} task_number={} task_end={task_end}",
            chunk.task_start,
            chunk.task_number
        );
        tracing::debug!(
            "commit_pc: REGS: PC_DATA_ADDR={:#x} PC_DATA_AMOUNT={data_amount} INT_MASK={:#x} INT_CLEAR={:#x} TASK_CTRL={task_control:#x} DMA_BASE={:#x}",
            first.regcmd_addr,
            last.int_mask,
            first.int_mask,
            job.task_base_addr()
        );

        bank.write32(regs::PC_DATA_ADDR, regcmd_addr);
        bank.write32(regs::PC_DATA_AMOUNT, data_amount);
        bank.write32(regs::INT_MASK, last.int_mask);
        bank.write32(regs::INT_CLEAR, first.int_mask);
        bank.write32(regs::PC_TASK_CONTROL, task_control);
        bank.write32(regs::PC_DMA_BASE_ADDR, task_base);

        progress.first_task = Some(chunk.task_start);
        progress.last_task = Some(task_end);
        progress.int_mask[core] = last.int_mask;
        drop(progress);

        bank.write32(regs::INT_CLEAR, int::CLEAR_ALL);
        bank.write32(regs::PC_OP_EN, 1);
        bank.write32(regs::PC_OP_EN, 0);
        job.mark_committed();
        Ok(())
    }

    /// Advance the active job of `core` for an interrupt with `status`.
    pub(crate) fn on_interrupt(&self, core: usize, status: u32, raw_status: u32, task_cnt: u32) -> IrqOutcome {
        let bank = self.bank(core);
        let mut wakes = CoreMask::empty();
        let outcome = {
            let mut cores = self.cores.lock();
            let Some(job) = cores[core].active.clone() else {
                bank.write32(regs::INT_CLEAR, int::CLEAR_ALL);
                tracing::debug!("irq: core={core} no job, cleared");
                self.try_dispatch(&mut cores, core, &mut wakes);
                drop(cores);
                self.wake(wakes);
                return IrqOutcome::NoJob;
            };

            let expected = {
                let mut progress = job.progress.lock();
                progress.irq_entry[core] = true;
                progress.int_status[core] = status;
                progress.int_mask[core]
            };
            let fuzzed = fuzz_status(status);
            bank.write32(regs::INT_CLEAR, int::CLEAR_ALL);
            if fuzzed != expected {
                tracing::error!(
                    "invalid irq status: {status:#x}, raw status: {raw_status:#x}, require mask: {expected:#x}, fuzz: {fuzzed:#x}, task counter: {task_cnt:#x}"
                );
                return IrqOutcome::Spurious;
            }
            self.job_done(&mut cores, &job, core, &mut wakes)
        };
        self.wake(wakes);
        outcome
    }

    /// `core` finished a chunk of `job`.
    fn job_done(&self, cores: &mut [SubcoreData], job: &Arc<Job>, core: usize, wakes: &mut CoreMask) -> IrqOutcome {
        let range = job.core_tasks(core);
        let submitted = {
            let mut progress = job.progress.lock();
            progress.submit_count[core] += 1;
            progress.submit_count[core]
        };
        if submitted < self.chip.chunks_for(range.task_number) {
            tracing::debug!("irq: core={core} job {} chunk {submitted} done, committing next", job.id());
            return match self.commit_core(job, core) {
                Ok(()) => IrqOutcome::ChunkCommitted,
                Err(e) => {
                    tracing::error!("commit: job {} core {core} next chunk failed: {e}", job.id());
                    self.fail_commit(cores, job, e, wakes);
                    for c in job.core_mask().cores() {
                        self.try_dispatch(cores, c, wakes);
                    }
                    IrqOutcome::CommitFailed
                }
            };
        }

        let now = Instant::now();
        let sub = &mut cores[core];
        sub.active = None;
        sub.task_num = sub.task_num.saturating_sub(u64::from(range.task_number));
        {
            let mut progress = job.progress.lock();
            if let Some(commit) = progress.commit_time {
                progress.hw_elapsed = now - commit;
            }
            if let Some(recorder) = progress.recorder_time {
                sub.busy_time += now - recorder;
            }
        }

        let outcome = if job.interrupt_count.decrement_and_test() {
            job.set_state(JobState::Done);
            *wakes |= CoreMask::for_core(job.core_mask().wait_core());
            tracing::debug!("irq: core={core} job {} done", job.id());
            IrqOutcome::JobDone
        } else {
            IrqOutcome::CoreDone
        };

        self.try_dispatch(cores, core, wakes);
        outcome
    }

    /// Block until `job` finishes, the device resets, or the retry budget
    /// runs out. Returns the task counter on success.
    pub(crate) fn wait(&self, job: &Arc<Job>, retries: u32) -> Result<u32> {
        let core = job.core_mask().wait_core();
        let timeout = job.timeout();
        let queue = &self.wait_queues[core];

        let mut wait_count = 0;
        let woken = loop {
            let woken = queue.wait_timeout(timeout, || job.is_finished() || self.resetting.load(Ordering::Acquire));
            wait_count += 1;
            if woken || wait_count >= retries {
                break woken;
            }

            let elapsed = {
                let _cores = self.cores.lock();
                job.progress.lock().commit_time.map(|t| t.elapsed())
            };
            let continue_wait = elapsed.map_or(true, |e| e < timeout);
            diag::log_poll(self.bank(core), &self.chip, wait_count, elapsed);
            tracing::error!(
                "job: {}, mask: {:#x}, cores pending: {}, wait_count: {wait_count}, continue wait: {continue_wait}, commit elapse: {}us, timeout: {}us",
                job.id(),
                job.core_mask().bits(),
                job.interrupt_count.remaining(),
                elapsed.map_or(0, |e| e.as_micros()),
                timeout.as_micros()
            );
            if !continue_wait {
                break false;
            }
        };

        let (first_task, last_task, int_status, commit_error) = {
            let progress = job.progress.lock();
            (
                progress.first_task,
                progress.last_task,
                progress.int_status[core],
                progress.commit_error.clone(),
            )
        };
        if let Some(reason) = commit_error {
            return Err(NpuError::invalid_argument(reason));
        }
        let timeout_err = |task_counter| NpuError::Timeout {
            duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            task_counter,
        };

        let Some(last_task) = last_task else {
            tracing::error!("job {} commit failed", job.id());
            return Err(if woken {
                NpuError::device_fault("device reset before the job was committed")
            } else {
                timeout_err(0)
            });
        };

        if let Err(e) = job.task_obj().write_task_status(last_task, int_status) {
            tracing::warn!("job {}: status write-back to task {last_task} failed: {e}", job.id());
        }

        if !woken {
            let bank = self.bank(core);
            let task_counter = diag::task_counter(bank, &self.chip);
            tracing::error!(
                "failed to wait job, task counter: {task_counter}, flags: {:#x}, elapsed: {}us",
                job.mode().bits(),
                job.age().as_micros()
            );
            // the chunk in flight when the wait gave up
            let chunk_start = first_task.unwrap_or(last_task);
            diag::log_timeout(bank, job.task_obj(), chunk_start, last_task.saturating_sub(chunk_start) + 1);
            return Err(timeout_err(task_counter));
        }

        if !job.is_done() {
            return Err(NpuError::device_fault(format!("job {} interrupted by device reset", job.id())));
        }
        Ok(job.task_number())
    }

    /// Remove `job` from every core it is queued or active on.
    ///
    /// Returns whether any chunk reached hardware. With `dispatch`, idle
    /// cores immediately move on to their next job.
    pub(crate) fn abort(&self, job: &Arc<Job>, dispatch: bool) -> bool {
        let mut wakes = CoreMask::empty();
        let reached_hw = {
            let mut cores = self.cores.lock();
            detach(&mut cores, job);
            if !job.is_done() {
                job.set_state(JobState::Aborted);
            }
            let reached_hw = job.progress.lock().last_task.is_some();
            if dispatch {
                for core in job.core_mask().cores() {
                    self.try_dispatch(&mut cores, core, &mut wakes);
                }
            }
            reached_hw
        };
        self.wake(wakes);
        reached_hw
    }

    /// Dispatch on every core of `mask` that is idle.
    pub(crate) fn kick(&self, mask: CoreMask) {
        let mut wakes = CoreMask::empty();
        {
            let mut cores = self.cores.lock();
            let n = cores.len();
            for core in mask.cores().filter(|&c| c < n) {
                self.try_dispatch(&mut cores, core, &mut wakes);
            }
        }
        self.wake(wakes);
    }

    /// Register snapshots of every core of `job`.
    pub(crate) fn snapshot(&self, job: &Job) -> Vec<CoreSnapshot> {
        let masks = job.progress.lock().int_mask;
        job.core_mask()
            .cores()
            .map(|core| CoreSnapshot::capture(self.bank(core), &self.chip, core, masks[core]))
            .collect()
    }

    /// Stop dispatching and wake every waiter.
    pub(crate) fn begin_reset(&self) {
        self.resetting.store(true, Ordering::Release);
        self.wake(self.all_cores());
    }

    /// Abort whatever was on hardware, rebuild the queue counters and
    /// resume dispatching.
    pub(crate) fn end_reset(&self) {
        let mut wakes = self.all_cores();
        {
            let mut cores = self.cores.lock();
            let dropped: Vec<(usize, Arc<Job>)> = cores
                .iter()
                .enumerate()
                .filter_map(|(core, sub)| sub.active.clone().map(|job| (core, job)))
                .collect();
            for (core, job) in &dropped {
                // off every core, including ones still holding it queued
                detach(&mut cores, job);
                if !job.is_done() {
                    job.set_state(JobState::Aborted);
                }
                tracing::warn!("soft reset: core {core} dropped job {}", job.id());
            }
            for (core, sub) in cores.iter_mut().enumerate() {
                sub.task_num = sub
                    .todo
                    .iter()
                    .map(|job| u64::from(job.core_tasks(core).task_number))
                    .sum();
            }
            self.resetting.store(false, Ordering::Release);
            for core in 0..cores.len() {
                self.try_dispatch(&mut cores, core, &mut wakes);
            }
        }
        self.wake(wakes);
    }

    /// Whether a soft reset is in progress.
    pub(crate) fn is_resetting(&self) -> bool {
        self.resetting.load(Ordering::Acquire)
    }

    /// Roll each core's busy time into its last-window total.
    pub(crate) fn sample_load(&self) {
        let now = Instant::now();
        let mut cores = self.cores.lock();
        for sub in cores.iter_mut() {
            if let Some(job) = &sub.active {
                let mut progress = job.progress.lock();
                if let Some(recorder) = progress.recorder_time {
                    sub.busy_time += now - recorder;
                }
                progress.recorder_time = Some(now);
            }
            sub.total_busy_time = std::mem::take(&mut sub.busy_time);
        }
    }

    /// Busy percentage of each core over the last sampling window.
    pub(crate) fn core_load(&self, window: Duration) -> Vec<u32> {
        let cores = self.cores.lock();
        cores
            .iter()
            .map(|sub| {
                let pct = sub.total_busy_time.as_micros() * 100 / window.as_micros().max(1);
                u32::try_from(pct.min(100)).unwrap_or(100)
            })
            .collect()
    }

    /// Tasks queued or running per core.
    pub(crate) fn queued_tasks(&self) -> Vec<u64> {
        self.cores.lock().iter().map(|sub| sub.task_num).collect()
    }

    /// Whether every core is idle with an empty todo list.
    pub(crate) fn is_idle(&self) -> bool {
        self.cores
            .lock()
            .iter()
            .all(|sub| sub.active.is_none() && sub.todo.is_empty())
    }

    fn wake(&self, wakes: CoreMask) {
        for core in wakes.cores().filter(|&c| c < self.wait_queues.len()) {
            self.wait_queues[core].wake_all();
        }
    }
}

/// Drop `job` from every todo list and active slot it occupies.
fn detach(cores: &mut [SubcoreData], job: &Arc<Job>) {
    for core in job.core_mask().cores() {
        let n = u64::from(job.core_tasks(core).task_number);
        let sub = &mut cores[core];
        let queued = sub.todo.len();
        sub.todo.retain(|j| !Arc::ptr_eq(j, job));
        if sub.todo.len() != queued {
            sub.task_num = sub.task_num.saturating_sub(n);
        }
        if sub.active.as_ref().is_some_and(|a| Arc::ptr_eq(a, job)) {
            sub.active = None;
            sub.task_num = sub.task_num.saturating_sub(n);
        }
    }
}

/// Core with the fewest queued tasks, lowest index on ties.
fn least_loaded(cores: &[SubcoreData]) -> usize {
    let mut best = 0;
    for (core, sub) in cores.iter().enumerate().skip(1) {
        if sub.task_num < cores[best].task_num {
            best = core;
        }
    }
    best
}
