//! Jobs: one submission and its per-core progress.

use crate::error::{NpuError, Result};
use crate::memory::{MemoryObject, ObjectId};
use crate::sync::Countdown;
use bitflags::bitflags;
use rknpu_chip::config::MAX_SUBCORE_TASKS;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Most cores a job can span.
pub const MAX_CORES: usize = 3;

/// Default job timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(6000);

bitflags! {
    /// Cores participating in a job. The empty mask means "auto".
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CoreMask: u32 {
        /// Core 0.
        const CORE0 = 1 << 0;
        /// Core 1.
        const CORE1 = 1 << 1;
        /// Core 2.
        const CORE2 = 1 << 2;
    }
}

impl CoreMask {
    /// Let the scheduler pick the least loaded core.
    pub const AUTO: Self = Self::empty();

    /// Mask selecting only `core`.
    pub fn for_core(core: usize) -> Self {
        Self::from_bits_retain(1 << core)
    }

    /// Whether the scheduler should resolve the mask.
    pub fn is_auto(self) -> bool {
        self.is_empty()
    }

    /// Participating core indices, ascending.
    pub fn cores(self) -> impl Iterator<Item = usize> {
        (0..MAX_CORES).filter(move |&core| self.bits() & (1 << core) != 0)
    }

    /// Number of participating cores.
    pub fn count(self) -> usize {
        self.bits().count_ones() as usize
    }

    /// Core whose wait queue a blocking submitter sleeps on: the only core
    /// of a single-core job, core 0 otherwise.
    pub fn wait_core(self) -> usize {
        if self.count() == 1 {
            self.bits().trailing_zeros() as usize
        } else {
            0
        }
    }

    /// Combinations the hardware can run together.
    pub fn is_supported_combination(self) -> bool {
        matches!(self.bits(), 0 | 0b001 | 0b010 | 0b100 | 0b011 | 0b111)
    }
}

bitflags! {
    /// Submission mode flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct JobMode: u32 {
        /// Program-counter mode: the core fetches its own register stream.
        const PC = 1 << 0;
        /// Return once committed instead of waiting for completion.
        const NONBLOCK = 1 << 1;
        /// Ping-pong task buffering.
        const PINGPONG = 1 << 2;
    }
}

/// A task range within the task buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubcoreTask {
    /// First task index.
    pub task_start: u32,
    /// Number of tasks.
    pub task_number: u32,
}

impl SubcoreTask {
    /// Range of `task_number` tasks starting at `task_start`.
    pub const fn new(task_start: u32, task_number: u32) -> Self {
        Self {
            task_start,
            task_number,
        }
    }

    fn end(self) -> u64 {
        u64::from(self.task_start) + u64::from(self.task_number)
    }
}

/// A submission request.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Mode flags. [`JobMode::PC`] is required.
    pub mode: JobMode,
    /// Deadline for each wait iteration.
    pub timeout: Duration,
    /// First task of the job.
    pub task_start: u32,
    /// Tasks in the job.
    pub task_number: u32,
    /// Priority. Recorded; scheduling is FIFO per core.
    pub priority: i32,
    /// Buffer holding the task descriptors.
    pub task_obj: ObjectId,
    /// Device address the core fetches descriptors from; 0 selects the task buffer.
    pub task_base_addr: u64,
    /// Participating cores.
    pub core_mask: CoreMask,
    /// Per-core task ranges. Entry `core` for 1- and 2-core jobs, entry
    /// `core + 2` for 3-core jobs.
    pub subcore_tasks: Option<[SubcoreTask; MAX_SUBCORE_TASKS]>,
}

impl SubmitRequest {
    /// Blocking PC-mode request for `task_number` tasks of `task_obj`.
    pub fn new(task_obj: ObjectId, task_start: u32, task_number: u32) -> Self {
        Self {
            mode: JobMode::PC,
            timeout: DEFAULT_TIMEOUT,
            task_start,
            task_number,
            priority: 0,
            task_obj,
            task_base_addr: 0,
            core_mask: CoreMask::AUTO,
            subcore_tasks: None,
        }
    }

    /// Run on `mask`.
    #[must_use]
    pub fn with_core_mask(mut self, mask: CoreMask) -> Self {
        self.core_mask = mask;
        self
    }

    /// Set the per-iteration wait deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set per-core task ranges.
    #[must_use]
    pub fn with_subcore_tasks(mut self, tasks: [SubcoreTask; MAX_SUBCORE_TASKS]) -> Self {
        self.subcore_tasks = Some(tasks);
        self
    }

    /// Return as soon as the job is queued.
    #[must_use]
    pub fn nonblocking(mut self) -> Self {
        self.mode |= JobMode::NONBLOCK;
        self
    }

    /// Enable ping-pong task buffering.
    #[must_use]
    pub fn pingpong(mut self) -> Self {
        self.mode |= JobMode::PINGPONG;
        self
    }
}

/// Result of a successful submission.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    /// Tasks completed. For a nonblocking submit, 0.
    pub task_counter: u32,
    /// Time from the first commit to the final interrupt.
    pub hw_elapsed: Duration,
    /// Cores the job ran on (auto resolved).
    pub core_mask: CoreMask,
    /// The job, for nonblocking callers to poll.
    pub job: Arc<Job>,
}

/// Job lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JobState {
    /// On one or more todo lists, not yet on hardware.
    Queued = 0,
    /// At least one chunk committed to hardware.
    Committed = 1,
    /// Every participating core delivered its final interrupt.
    Done = 2,
    /// Timed out, cancelled, or cleared by a reset.
    Aborted = 3,
}

impl JobState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Queued,
            1 => Self::Committed,
            2 => Self::Done,
            _ => Self::Aborted,
        }
    }
}

/// Mutable per-core bookkeeping, guarded by the job's own lock.
///
/// Only touched with the core-queue lock held, except by the waiter which
/// reads it after the job has finished.
#[derive(Debug, Default)]
pub(crate) struct JobProgress {
    /// Chunks completed per core
    pub submit_count: [u32; MAX_CORES],
    /// Expected (fuzzed) interrupt status per core
    pub int_mask: [u32; MAX_CORES],
    /// Last interrupt status seen per core
    pub int_status: [u32; MAX_CORES],
    /// An interrupt has been taken for this job on the core
    pub irq_entry: [bool; MAX_CORES],
    pub first_task: Option<u32>,
    pub last_task: Option<u32>,
    /// Set when the job became active on a core
    pub commit_time: Option<Instant>,
    /// Start of the current busy-time accounting window
    pub recorder_time: Option<Instant>,
    pub hw_elapsed: Duration,
    pub commit_error: Option<String>,
}

/// One submitted job.
pub struct Job {
    id: u64,
    core_mask: CoreMask,
    mode: JobMode,
    timeout: Duration,
    priority: i32,
    task_start: u32,
    task_number: u32,
    subcore_tasks: Option<[SubcoreTask; MAX_SUBCORE_TASKS]>,
    task_obj: Arc<MemoryObject>,
    task_base_addr: u64,
    submitted_at: Instant,
    state: AtomicU8,
    /// Cores still to reach dispatch before the job is committed
    pub(crate) run_count: Countdown,
    /// Cores still to deliver their final interrupt
    pub(crate) interrupt_count: Countdown,
    pub(crate) progress: spin::Mutex<JobProgress>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("core_mask", &self.core_mask)
            .field("task_start", &self.task_start)
            .field("task_number", &self.task_number)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Job {
    /// Build a job for a resolved (non-auto) core mask.
    ///
    /// Validates every participating core's task range against the task
    /// buffer.
    pub(crate) fn new(
        id: u64,
        request: &SubmitRequest,
        core_mask: CoreMask,
        task_obj: Arc<MemoryObject>,
        task_base_addr: u64,
    ) -> Result<Self> {
        let use_core_num = core_mask.count();
        let job = Self {
            id,
            core_mask,
            mode: request.mode,
            timeout: request.timeout,
            priority: request.priority,
            task_start: request.task_start,
            task_number: request.task_number,
            subcore_tasks: request.subcore_tasks,
            task_obj,
            task_base_addr,
            submitted_at: Instant::now(),
            state: AtomicU8::new(JobState::Queued as u8),
            run_count: Countdown::new(use_core_num),
            interrupt_count: Countdown::new(use_core_num),
            progress: spin::Mutex::new(JobProgress::default()),
        };

        let capacity = job.task_obj.task_capacity();
        for core in core_mask.cores() {
            let range = job.core_tasks(core);
            if range.task_number == 0 {
                return Err(NpuError::invalid_argument(format!("core {core} has no tasks")));
            }
            if range.end() > capacity {
                return Err(NpuError::invalid_argument(format!(
                    "core {core} tasks {}..{} exceed task buffer capacity {capacity}",
                    range.task_start,
                    range.end()
                )));
            }
        }
        Ok(job)
    }

    /// Job identifier, unique per device.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Participating cores.
    pub fn core_mask(&self) -> CoreMask {
        self.core_mask
    }

    /// Mode flags.
    pub fn mode(&self) -> JobMode {
        self.mode
    }

    /// Per-iteration wait deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Requested priority.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Tasks in the whole job.
    pub fn task_number(&self) -> u32 {
        self.task_number
    }

    /// Buffer holding the descriptors.
    pub fn task_obj(&self) -> &Arc<MemoryObject> {
        &self.task_obj
    }

    /// Device address programmed as the descriptor base.
    pub fn task_base_addr(&self) -> u64 {
        self.task_base_addr
    }

    /// Time since submission.
    pub fn age(&self) -> Duration {
        self.submitted_at.elapsed()
    }

    /// Current state.
    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: JobState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Queued becomes Committed. Any other state is left alone.
    pub(crate) fn mark_committed(&self) {
        let _ = self.state.compare_exchange(
            JobState::Queued as u8,
            JobState::Committed as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Whether the job completed successfully.
    pub fn is_done(&self) -> bool {
        self.state() == JobState::Done
    }

    /// Whether the job reached a terminal state.
    pub fn is_finished(&self) -> bool {
        matches!(self.state(), JobState::Done | JobState::Aborted)
    }

    /// Hardware time from commit to the final interrupt.
    pub fn hw_elapsed(&self) -> Duration {
        self.progress.lock().hw_elapsed
    }

    /// Task range `core` runs.
    pub fn core_tasks(&self, core: usize) -> SubcoreTask {
        let whole = SubcoreTask::new(self.task_start, self.task_number);
        match (&self.subcore_tasks, self.core_mask.count()) {
            (Some(sub), 1 | 2) => sub[core],
            (Some(sub), 3) => sub[core + 2],
            _ => whole,
        }
    }

    /// Task range of chunk `submit_index` on `core`, at most `max` tasks.
    pub(crate) fn chunk(&self, core: usize, submit_index: u32, max: u32) -> SubcoreTask {
        let range = self.core_tasks(core);
        let done = submit_index.saturating_mul(max);
        SubcoreTask::new(
            range.task_start + done,
            range.task_number.saturating_sub(done).min(max),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryManager;
    use crate::software::SoftwareNpu;

    fn task_buffer(npu: &SoftwareNpu, size: u64) -> Arc<MemoryObject> {
        let platform = npu.platform();
        let mm = MemoryManager::new(platform.allocator, platform.importer);
        Arc::new(mm.create(size, None).unwrap())
    }

    #[test]
    fn core_mask_helpers() {
        let m = CoreMask::CORE0 | CoreMask::CORE2;
        assert_eq!(m.cores().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(m.count(), 2);
        assert_eq!(m.wait_core(), 0);
        assert!(!m.is_supported_combination());
        assert_eq!(CoreMask::CORE2.wait_core(), 2);
        assert_eq!(CoreMask::for_core(1), CoreMask::CORE1);
        assert!(CoreMask::AUTO.is_auto());
        assert!(CoreMask::all().is_supported_combination());
    }

    #[test]
    fn chunks_split_at_max() {
        let npu = SoftwareNpu::rk3588();
        // 5000 descriptors need 200000 bytes
        let obj = task_buffer(&npu, 5000 * 40);
        let req = SubmitRequest::new(obj.id(), 0, 5000);
        let job = Job::new(1, &req, CoreMask::CORE0, obj, 0).unwrap();
        assert_eq!(job.chunk(0, 0, 4095), SubcoreTask::new(0, 4095));
        assert_eq!(job.chunk(0, 1, 4095), SubcoreTask::new(4095, 905));
    }

    #[test]
    fn subcore_ranges_select_by_core_count() {
        let npu = SoftwareNpu::rk3588();
        let obj = task_buffer(&npu, 4096);
        let sub = [
            SubcoreTask::new(0, 1),
            SubcoreTask::new(1, 2),
            SubcoreTask::new(3, 3),
            SubcoreTask::new(6, 4),
            SubcoreTask::new(10, 5),
        ];
        let req = SubmitRequest::new(obj.id(), 0, 15).with_subcore_tasks(sub);

        let two = Job::new(1, &req, CoreMask::CORE0 | CoreMask::CORE1, Arc::clone(&obj), 0).unwrap();
        assert_eq!(two.core_tasks(1), sub[1]);

        let three = Job::new(2, &req, CoreMask::all(), obj, 0).unwrap();
        assert_eq!(three.core_tasks(0), sub[2]);
        assert_eq!(three.core_tasks(2), sub[4]);
    }

    #[test]
    fn out_of_range_tasks_rejected() {
        let npu = SoftwareNpu::rk3588();
        let obj = task_buffer(&npu, 4096);
        // 102 descriptors fit in one page
        let req = SubmitRequest::new(obj.id(), 100, 3);
        assert!(matches!(
            Job::new(1, &req, CoreMask::CORE0, obj, 0),
            Err(NpuError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn empty_core_range_rejected() {
        let npu = SoftwareNpu::rk3588();
        let obj = task_buffer(&npu, 4096);
        let req = SubmitRequest::new(obj.id(), 0, 4).with_subcore_tasks([SubcoreTask::default(); 5]);
        assert!(Job::new(1, &req, CoreMask::CORE1, obj, 0).is_err());
    }
}
