//! Scheduling scenarios against the software NPU.

use rknpu_driver::software::{synthetic_tasks, SoftwareNpu};
use rknpu_driver::{
    CoreMask, Device, DriverConfig, IrqOutcome, JobMode, JobState, NpuError, ObjectId, Session, SubmitRequest,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn attach(npu: &SoftwareNpu, config: DriverConfig) -> Arc<Device> {
    npu.attach(config.with_power_put_delay(Duration::ZERO)).unwrap()
}

fn task_buffer(session: &Session, tasks: u32) -> ObjectId {
    let info = session.create(u64::from(tasks) * 40, None).unwrap();
    session
        .object(info.object_id)
        .unwrap()
        .write_tasks(&synthetic_tasks(tasks, 0x10_0000))
        .unwrap();
    info.object_id
}

#[test]
fn auto_mask_picks_lowest_idle_core() {
    let npu = SoftwareNpu::rk3588();
    let device = attach(&npu, DriverConfig::default());
    let session = device.open_session();
    let tasks = task_buffer(&session, 16);

    let first = session.submit(&SubmitRequest::new(tasks, 0, 10).nonblocking()).unwrap();
    assert_eq!(first.core_mask, CoreMask::CORE0);
    assert_eq!(first.task_counter, 0);

    // core 0 now carries 10 tasks; 1 and 2 tie at zero
    let second = session.submit(&SubmitRequest::new(tasks, 0, 4).nonblocking()).unwrap();
    assert_eq!(second.core_mask, CoreMask::CORE1);
    let third = session.submit(&SubmitRequest::new(tasks, 0, 4).nonblocking()).unwrap();
    assert_eq!(third.core_mask, CoreMask::CORE2);
    assert_eq!(device.queued_tasks(), vec![10, 4, 4]);

    for core in 0..3 {
        assert_eq!(npu.complete(&device, core), Some(IrqOutcome::JobDone));
    }
    assert!(first.job.is_done() && second.job.is_done() && third.job.is_done());
    assert!(device.is_idle());
}

#[test]
fn large_job_is_committed_in_two_chunks() {
    let npu = SoftwareNpu::rk3588();
    let device = attach(&npu, DriverConfig::default());
    let session = device.open_session();
    let tasks = task_buffer(&session, 5000);

    let outcome = session
        .submit(&SubmitRequest::new(tasks, 0, 5000).with_core_mask(CoreMask::CORE0).nonblocking())
        .unwrap();

    assert_eq!(npu.regs[0].commits().len(), 1);
    assert_eq!(npu.complete(&device, 0), Some(IrqOutcome::ChunkCommitted));
    assert_eq!(outcome.job.state(), JobState::Committed);
    assert_eq!(npu.complete(&device, 0), Some(IrqOutcome::JobDone));

    let commits = npu.regs[0].commits();
    let sizes: Vec<u32> = commits.iter().map(|c| c.task_number).collect();
    assert_eq!(sizes, vec![4095, 905]);
    // second chunk starts at task 4095
    assert_eq!(commits[1].data_addr, 0x10_0000 + 4095 * 0x100);
    assert!(outcome.job.is_done());
}

#[test]
fn mismatched_interrupt_is_absorbed() {
    let npu = SoftwareNpu::rk3588();
    let device = attach(&npu, DriverConfig::default());
    let session = device.open_session();
    let tasks = task_buffer(&session, 4);

    let outcome = session
        .submit(&SubmitRequest::new(tasks, 0, 4).with_core_mask(CoreMask::CORE0).nonblocking())
        .unwrap();

    assert_eq!(npu.interrupt(&device, 0, 0x1), IrqOutcome::Spurious);
    assert_eq!(outcome.job.state(), JobState::Committed);
    assert_eq!(npu.regs[0].get(rknpu_driver::chip::regs::INT_STATUS), 0);
    assert_eq!(device.queued_tasks()[0], 4);

    // the real completion still lands
    assert_eq!(npu.complete(&device, 0), Some(IrqOutcome::JobDone));
    assert!(outcome.job.is_done());
}

#[test]
fn interrupt_on_other_core_leaves_job_alone() {
    let npu = SoftwareNpu::rk3588();
    let device = attach(&npu, DriverConfig::default());
    let session = device.open_session();
    let tasks = task_buffer(&session, 4);

    let outcome = session
        .submit(&SubmitRequest::new(tasks, 0, 4).with_core_mask(CoreMask::CORE0).nonblocking())
        .unwrap();
    for _ in 0..3 {
        assert_eq!(npu.interrupt(&device, 1, 0x300), IrqOutcome::NoJob);
    }
    assert_eq!(outcome.job.state(), JobState::Committed);
    assert_eq!(npu.complete(&device, 0), Some(IrqOutcome::JobDone));
}

#[test]
fn hung_job_times_out_and_is_removed() {
    let npu = SoftwareNpu::rk3588();
    let device = attach(&npu, DriverConfig::default());
    let session = device.open_session();
    let tasks = task_buffer(&session, 8);
    npu.regs[0].stall(true);

    let start = Instant::now();
    let err = session
        .submit(
            &SubmitRequest::new(tasks, 0, 8)
                .with_core_mask(CoreMask::CORE0)
                .with_timeout(Duration::from_millis(50)),
        )
        .unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, NpuError::Timeout { duration_ms: 50, .. }), "{err}");
    assert_eq!(err.errno(), rknpu_driver::errno::ETIMEDOUT);
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
    // the job reached hardware, so the device was reset
    assert_eq!(npu.reset.count(), 1);
    assert!(!npu.regs[0].has_pending());
    assert!(device.is_idle());
    assert_eq!(device.queued_tasks(), vec![0, 0, 0]);
}

#[test]
fn queued_job_timeout_dequeues_without_reset() {
    let npu = SoftwareNpu::rk3588();
    let device = attach(&npu, DriverConfig::default());
    let session = device.open_session();
    let tasks = task_buffer(&session, 8);

    let head = session
        .submit(&SubmitRequest::new(tasks, 0, 8).with_core_mask(CoreMask::CORE0).nonblocking())
        .unwrap();
    let err = session
        .submit(
            &SubmitRequest::new(tasks, 0, 3)
                .with_core_mask(CoreMask::CORE0)
                .with_timeout(Duration::from_millis(20)),
        )
        .unwrap_err();

    assert!(matches!(err, NpuError::Timeout { task_counter: 0, .. }));
    assert_eq!(npu.reset.count(), 0);
    assert_eq!(device.queued_tasks()[0], 8);
    assert_eq!(head.job.state(), JobState::Committed);

    assert_eq!(npu.complete(&device, 0), Some(IrqOutcome::JobDone));
    assert!(device.is_idle());
    assert_eq!(npu.regs[0].commits().len(), 1);
}

#[test]
fn three_core_job_waits_for_every_core() {
    let npu = SoftwareNpu::rk3588();
    let device = attach(&npu, DriverConfig::default());
    let session = device.open_session();
    let tasks = task_buffer(&session, 16);

    let busy = session
        .submit(&SubmitRequest::new(tasks, 0, 2).with_core_mask(CoreMask::CORE1).nonblocking())
        .unwrap();
    let wide = session
        .submit(&SubmitRequest::new(tasks, 0, 6).with_core_mask(CoreMask::all()).nonblocking())
        .unwrap();

    // cores 0 and 2 picked the job up but nothing is committed until core 1 joins
    assert!(npu.regs[0].commits().is_empty());
    assert!(npu.regs[2].commits().is_empty());

    assert_eq!(npu.complete(&device, 1), Some(IrqOutcome::JobDone));
    assert!(busy.job.is_done());
    for core in 0..3 {
        assert_eq!(npu.regs[core].commits().last().unwrap().task_number, 6);
    }

    assert_eq!(npu.complete(&device, 2), Some(IrqOutcome::CoreDone));
    assert_eq!(npu.complete(&device, 0), Some(IrqOutcome::CoreDone));
    assert!(!wide.job.is_done());
    assert_eq!(npu.complete(&device, 1), Some(IrqOutcome::JobDone));
    assert!(wide.job.is_done());
    assert!(device.is_idle());
}

#[test]
fn single_core_jobs_finish_in_queue_order() {
    let npu = SoftwareNpu::rk3588();
    let device = attach(&npu, DriverConfig::default());
    let session = Arc::new(device.open_session());
    let tasks = task_buffer(&session, 32);

    let handles: Vec<_> = (0..8u32)
        .map(|i| {
            let session = Arc::clone(&session);
            thread::spawn(move || {
                session
                    .submit(
                        &SubmitRequest::new(tasks, i, 1 + i % 3)
                            .with_core_mask(CoreMask::CORE0)
                            .nonblocking(),
                    )
                    .unwrap()
                    .job
            })
        })
        .collect();
    let mut jobs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    jobs.sort_by_key(|job| job.id());

    for (i, job) in jobs.iter().enumerate() {
        assert_eq!(npu.complete(&device, 0), Some(IrqOutcome::JobDone));
        assert!(job.is_done(), "job {} not done after {} completions", job.id(), i + 1);
        assert!(jobs[i + 1..].iter().all(|later| !later.is_done()));
    }
    assert!(device.is_idle());
}

#[test]
fn reset_aborts_running_job_and_resumes_queue() {
    let npu = SoftwareNpu::rk3588();
    let device = attach(&npu, DriverConfig::default());
    let session = device.open_session();
    let tasks = task_buffer(&session, 8);

    let running = session
        .submit(&SubmitRequest::new(tasks, 0, 4).with_core_mask(CoreMask::CORE0).nonblocking())
        .unwrap();
    let queued = session
        .submit(&SubmitRequest::new(tasks, 4, 4).with_core_mask(CoreMask::CORE0).nonblocking())
        .unwrap();

    device.soft_reset().unwrap();
    assert_eq!(running.job.state(), JobState::Aborted);
    assert_eq!(queued.job.state(), JobState::Committed);
    assert_eq!(device.queued_tasks()[0], 4);

    assert_eq!(npu.complete(&device, 0), Some(IrqOutcome::JobDone));
    assert!(queued.job.is_done());
    assert!(device.is_idle());
}

#[test]
fn blocking_jobs_complete_with_responder() {
    let npu = SoftwareNpu::rk3588();
    let device = attach(&npu, DriverConfig::default());
    let responder = npu.responder(&device, Duration::from_micros(200));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let session = device.open_session();
            thread::spawn(move || {
                let tasks = task_buffer(&session, 64);
                for n in [1, 7, 64] {
                    let outcome = session.submit(&SubmitRequest::new(tasks, 0, n)).unwrap();
                    assert_eq!(outcome.task_counter, n);
                    assert!(outcome.job.is_done());
                }
                let all = session
                    .submit(&SubmitRequest::new(tasks, 0, 16).with_core_mask(CoreMask::all()))
                    .unwrap();
                assert_eq!(all.core_mask, CoreMask::all());
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    responder.stop();
    assert!(device.is_idle());
    assert_eq!(device.session_count(), 0);
}

#[test]
fn final_status_is_written_back_to_last_task() {
    let npu = SoftwareNpu::rk3588();
    let device = attach(&npu, DriverConfig::default());
    let _responder = npu.responder(&device, Duration::from_micros(100));
    let session = device.open_session();
    let tasks = task_buffer(&session, 10);

    session
        .submit(&SubmitRequest::new(tasks, 2, 5).with_core_mask(CoreMask::CORE2))
        .unwrap();
    let obj = session.object(tasks).unwrap();
    assert_eq!(obj.read_task(6).unwrap().int_status, 0x300);
    assert_eq!(obj.read_task(5).unwrap().int_status, 0);
}

#[test]
fn invalid_requests_touch_nothing() {
    let npu = SoftwareNpu::rk3588();
    let device = attach(&npu, DriverConfig::default());
    let session = device.open_session();
    let tasks = task_buffer(&session, 4);

    let mut slave = SubmitRequest::new(tasks, 0, 4);
    slave.mode = JobMode::empty();
    let bad = [
        SubmitRequest::new(tasks, 0, 0),
        SubmitRequest::new(tasks, 0, 4).with_core_mask(CoreMask::CORE0 | CoreMask::CORE2),
        SubmitRequest::new(tasks, 0, 4).with_core_mask(CoreMask::from_bits_retain(0x8)),
        SubmitRequest::new(tasks, 100, 4).with_core_mask(CoreMask::CORE0),
        slave,
    ];
    for request in &bad {
        assert!(matches!(
            session.submit(request),
            Err(NpuError::InvalidArgument { .. })
        ));
    }
    assert!(matches!(
        session.submit(&SubmitRequest::new(ObjectId(9999), 0, 1)),
        Err(NpuError::NotFound { .. })
    ));
    assert!(npu.regs.iter().all(|r| r.commits().is_empty()));
    assert!(device.is_idle());
}

#[test]
fn guard_pages_are_capped_and_gone_after_submit() {
    let npu = SoftwareNpu::rk3588();
    let device = attach(&npu, DriverConfig::default().with_guard_max_pages(8));
    let _responder = npu.responder(&device, Duration::from_micros(100));
    let session = device.open_session();
    let tasks = task_buffer(&session, 4);
    for size in [4096, 3 * 4096, 4096] {
        session.create(size, None).unwrap();
    }

    session.submit(&SubmitRequest::new(tasks, 0, 4)).unwrap();
    assert_eq!(npu.iommu.peak_mapped_pages(), 8);
    assert_eq!(npu.iommu.mapped_pages(), 0);

    npu.regs[1].stall(true);
    let err = session.submit(
        &SubmitRequest::new(tasks, 0, 4)
            .with_core_mask(CoreMask::CORE1)
            .with_timeout(Duration::from_millis(20)),
    );
    assert!(err.is_err());
    assert_eq!(npu.iommu.mapped_pages(), 0);
    assert!(npu.iommu.peak_mapped_pages() <= 8);
}

#[test]
fn no_guard_pages_without_iommu() {
    let npu = SoftwareNpu::rk3588();
    let device = attach(&npu, DriverConfig::default().with_iommu(false));
    let _responder = npu.responder(&device, Duration::from_micros(100));
    let session = device.open_session();
    let tasks = task_buffer(&session, 4);
    session.create(4096, None).unwrap();

    session.submit(&SubmitRequest::new(tasks, 0, 4)).unwrap();
    assert_eq!(npu.iommu.peak_mapped_pages(), 0);
    assert_eq!(session.action(rknpu_driver::Action::GetIommuEn).unwrap(), 0);
}

#[test]
fn multi_core_commit_programs_stream_selector() {
    let npu = SoftwareNpu::rk3588();
    let device = attach(&npu, DriverConfig::default());
    let session = device.open_session();
    let tasks = task_buffer(&session, 4);

    session
        .submit(&SubmitRequest::new(tasks, 0, 4).with_core_mask(CoreMask::CORE2).nonblocking())
        .unwrap();
    let writes = npu.regs[2].writes();
    let selector = rknpu_driver::chip::regs::engine::stream_selector(2);
    assert!(writes.contains(&(0x1004, selector)));
    assert!(writes.contains(&(0x3004, selector)));
    assert_eq!(writes.first(), Some(&(rknpu_driver::chip::regs::PC_DATA_ADDR, 1)));
    assert_eq!(npu.complete(&device, 2), Some(IrqOutcome::JobDone));
}

#[test]
fn reset_drops_job_held_at_barrier_from_every_core() {
    let npu = SoftwareNpu::rk3588();
    let device = attach(&npu, DriverConfig::default());
    let session = device.open_session();
    let tasks = task_buffer(&session, 16);

    let busy = session
        .submit(&SubmitRequest::new(tasks, 0, 2).with_core_mask(CoreMask::CORE1).nonblocking())
        .unwrap();
    let pair = CoreMask::CORE0 | CoreMask::CORE1;
    let wide = session
        .submit(&SubmitRequest::new(tasks, 0, 6).with_core_mask(pair).nonblocking())
        .unwrap();
    // core 0 holds the job at the barrier, core 1 still has it queued
    assert!(npu.regs[0].commits().is_empty());
    assert_eq!(device.queued_tasks(), vec![6, 8, 0]);

    device.soft_reset().unwrap();
    assert_eq!(busy.job.state(), JobState::Aborted);
    assert_eq!(wide.job.state(), JobState::Aborted);
    assert!(npu.regs[0].commits().is_empty());
    assert_eq!(npu.regs[1].commits().len(), 1);
    assert!(!npu.regs[0].has_pending() && !npu.regs[1].has_pending());
    assert_eq!(device.queued_tasks(), vec![0, 0, 0]);
    assert!(device.is_idle());

    let next = session
        .submit(&SubmitRequest::new(tasks, 8, 4).with_core_mask(pair).nonblocking())
        .unwrap();
    assert_eq!(npu.regs[0].commits().len(), 1);
    assert_eq!(npu.regs[1].commits().len(), 2);
    assert_eq!(npu.complete(&device, 0), Some(IrqOutcome::CoreDone));
    assert_eq!(npu.complete(&device, 1), Some(IrqOutcome::JobDone));
    assert!(next.job.is_done());
    assert_eq!(wide.job.state(), JobState::Aborted);
    assert!(device.is_idle());
}

#[test]
fn completion_racing_timeout_leaves_device_consistent() {
    let npu = SoftwareNpu::rk3588();
    let device = attach(&npu, DriverConfig::default());
    let session = device.open_session();
    let tasks = task_buffer(&session, 4);

    for i in 0..40u64 {
        let delay = Duration::from_micros(i % 8 * 500);
        let (result, irq) = thread::scope(|s| {
            let completer = s.spawn(|| {
                thread::sleep(delay);
                npu.complete(&device, 0)
            });
            let result = session.submit(
                &SubmitRequest::new(tasks, 0, 4)
                    .with_core_mask(CoreMask::CORE0)
                    .with_timeout(Duration::from_millis(2)),
            );
            (result, completer.join().unwrap())
        });

        match &result {
            Ok(outcome) => {
                assert!(outcome.job.is_done());
                assert_eq!(irq, Some(IrqOutcome::JobDone), "round {i}");
            }
            Err(err) => assert!(matches!(err, NpuError::Timeout { .. }), "round {i}: {err}"),
        }
        assert!(
            matches!(irq, None | Some(IrqOutcome::JobDone | IrqOutcome::NoJob)),
            "round {i}: {irq:?}"
        );
        assert!(!npu.regs[0].has_pending(), "round {i}");
        assert!(device.is_idle(), "round {i}");
        assert_eq!(device.queued_tasks(), vec![0, 0, 0], "round {i}");
    }
}
