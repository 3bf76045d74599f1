//! Buffer ownership and session teardown against the software NPU.

use rknpu_driver::software::{synthetic_tasks, SoftwareNpu};
use rknpu_driver::{CoreMask, Device, DriverConfig, IrqOutcome, NpuError, SubmitRequest, SyncFlags};
use std::sync::Arc;
use std::time::Duration;

fn attach(npu: &SoftwareNpu) -> Arc<Device> {
    npu.attach(DriverConfig::default().with_power_put_delay(Duration::ZERO))
        .unwrap()
}

#[test]
fn disconnect_releases_each_buffer_once() {
    let npu = SoftwareNpu::rk3588();
    let device = attach(&npu);
    let session = device.open_session();

    let fds: Vec<u32> = (0..3).map(|_| npu.importer.register(0x2000)).collect();
    for &fd in &fds {
        let info = session.create(0x2000, Some(fd)).unwrap();
        assert_eq!(info.handle, fd);
    }
    session.create(0x1000, None).unwrap();
    assert_eq!(session.len(), 4);
    assert_eq!(npu.allocator.live(), 1);

    drop(session);

    for &fd in &fds {
        assert_eq!(npu.importer.imported(fd), 1);
        assert_eq!(npu.importer.released(fd), 1);
    }
    assert_eq!(npu.allocator.live(), 0);
    assert_eq!(npu.allocator.allocations(), 1);
}

fn xorshift(state: &mut u64) -> u64 {
    *state ^= *state << 13;
    *state ^= *state >> 7;
    *state ^= *state << 17;
    *state
}

#[test]
fn destroy_order_does_not_matter() {
    for seed in 1..=32u64 {
        let npu = SoftwareNpu::rk3588();
        let device = attach(&npu);
        let session = device.open_session();
        let mut rng = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;

        let mut objects = Vec::new();
        let mut owned = 0;
        for _ in 0..10 {
            let external = (xorshift(&mut rng) % 2 == 1).then(|| npu.importer.register(0x1000));
            owned += usize::from(external.is_none());
            objects.push((session.create(0x1000, external).unwrap().object_id, external));
        }

        // Fisher-Yates
        for i in (1..objects.len()).rev() {
            let j = usize::try_from(xorshift(&mut rng) % (i as u64 + 1)).unwrap();
            objects.swap(i, j);
        }

        for (n, &(id, external)) in objects.iter().enumerate() {
            session.destroy(id).unwrap();
            if let Some(fd) = external {
                assert_eq!(npu.importer.released(fd), 1, "seed {seed}");
            }
            assert_eq!(session.len(), objects.len() - n - 1);
            // objects not yet destroyed are untouched
            for &(_, later) in &objects[n + 1..] {
                if let Some(fd) = later {
                    assert_eq!(npu.importer.released(fd), 0, "seed {seed}");
                }
            }
        }
        assert!(session.is_empty());
        assert_eq!(npu.allocator.allocations(), owned);
        assert_eq!(npu.allocator.live(), 0);

        for (id, _) in objects {
            assert!(matches!(session.destroy(id), Err(NpuError::NotFound { .. })));
        }
    }
}

#[test]
fn owned_sync_is_a_no_op() {
    let npu = SoftwareNpu::rk3588();
    let device = attach(&npu);
    let session = device.open_session();
    let info = session.create(0x1000, None).unwrap();
    let obj = session.object(info.object_id).unwrap();
    obj.write_at(0, &[1, 2, 3, 4]).unwrap();

    for _ in 0..5 {
        session.sync(info.object_id, SyncFlags::TO_DEVICE).unwrap();
        session.sync(info.object_id, SyncFlags::FROM_DEVICE).unwrap();
    }
    let mut back = [0u8; 4];
    obj.read_at(0, &mut back).unwrap();
    assert_eq!(back, [1, 2, 3, 4]);
}

#[test]
fn imported_sync_reaches_the_exporter() {
    let npu = SoftwareNpu::rk3588();
    let device = attach(&npu);
    let session = device.open_session();
    let fd = npu.importer.register(0x1000);
    let info = session.create(0x1000, Some(fd)).unwrap();

    session.sync(info.object_id, SyncFlags::TO_DEVICE).unwrap();
    session
        .sync(info.object_id, SyncFlags::TO_DEVICE | SyncFlags::FROM_DEVICE)
        .unwrap();
    assert_eq!(npu.importer.device_syncs(fd), 2);
    assert_eq!(npu.importer.cpu_syncs(fd), 1);

    // writes through the object land in the exported buffer
    session.object(info.object_id).unwrap().write_at(8, &[0xab]).unwrap();
    let mut byte = [0u8];
    npu.importer.read(fd, 8, &mut byte).unwrap();
    assert_eq!(byte, [0xab]);
}

#[test]
fn submit_syncs_imported_buffers_both_ways() {
    let npu = SoftwareNpu::rk3588();
    let device = attach(&npu);
    let _responder = npu.responder(&device, Duration::from_micros(100));
    let session = device.open_session();

    let fd = npu.importer.register(0x1000);
    session.create(0x1000, Some(fd)).unwrap();
    let tasks = session.create(0x1000, None).unwrap();
    session
        .object(tasks.object_id)
        .unwrap()
        .write_tasks(&synthetic_tasks(4, 0x20_0000))
        .unwrap();

    session.submit(&SubmitRequest::new(tasks.object_id, 0, 4)).unwrap();
    assert_eq!(npu.importer.device_syncs(fd), 1);
    assert_eq!(npu.importer.cpu_syncs(fd), 1);
}

#[test]
fn task_buffer_in_imported_memory() {
    let npu = SoftwareNpu::rk3588();
    let device = attach(&npu);
    let _responder = npu.responder(&device, Duration::from_micros(100));
    let session = device.open_session();

    let fd = npu.importer.register(0x1000);
    let info = session.create(0x1000, Some(fd)).unwrap();
    session
        .object(info.object_id)
        .unwrap()
        .write_tasks(&synthetic_tasks(3, 0x30_0000))
        .unwrap();

    let outcome = session
        .submit(&SubmitRequest::new(info.object_id, 0, 3).with_core_mask(CoreMask::CORE1))
        .unwrap();
    assert_eq!(outcome.task_counter, 3);
    let commit = npu.regs[1].commits()[0];
    assert_eq!(u64::from(commit.dma_base), info.dma_addr);
    assert_eq!(commit.data_addr, 0x30_0000);
}

#[test]
fn destroying_a_busy_task_buffer_defers_release() {
    let npu = SoftwareNpu::rk3588();
    let device = attach(&npu);
    let session = device.open_session();
    let info = session.create(0x1000, None).unwrap();
    session
        .object(info.object_id)
        .unwrap()
        .write_tasks(&synthetic_tasks(2, 0x10_0000))
        .unwrap();

    let outcome = session
        .submit(&SubmitRequest::new(info.object_id, 0, 2).with_core_mask(CoreMask::CORE0).nonblocking())
        .unwrap();
    session.destroy(info.object_id).unwrap();
    assert!(session.is_empty());
    assert_eq!(npu.allocator.live(), 1);

    assert_eq!(npu.complete(&device, 0), Some(IrqOutcome::JobDone));
    drop(outcome);
    assert_eq!(npu.allocator.live(), 0);
}

#[test]
fn buffers_are_private_to_their_session() {
    let npu = SoftwareNpu::rk3588();
    let device = attach(&npu);
    let a = device.open_session();
    let b = device.open_session();
    let info = a.create(0x1000, None).unwrap();

    assert!(matches!(b.object(info.object_id), Err(NpuError::NotFound { .. })));
    assert!(matches!(b.map_offset(info.object_id), Err(NpuError::NotFound { .. })));
    assert!(matches!(
        b.submit(&SubmitRequest::new(info.object_id, 0, 1)),
        Err(NpuError::NotFound { .. })
    ));
    assert_eq!(a.map_offset(info.object_id).unwrap(), info.dma_addr);
}

#[test]
fn failed_allocation_leaves_session_unchanged() {
    let npu = SoftwareNpu::rk3588();
    let device = attach(&npu);
    let session = device.open_session();

    npu.allocator.fail_next();
    let err = session.create(0x1000, None).unwrap_err();
    assert!(matches!(err, NpuError::Allocation { .. }));
    assert_eq!(err.errno(), rknpu_driver::errno::ENOMEM);
    assert!(session.is_empty());

    assert!(matches!(
        session.create(0x1000, Some(12345)),
        Err(NpuError::Import { .. })
    ));
    assert!(matches!(
        session.create(0, None),
        Err(NpuError::InvalidArgument { .. })
    ));
    assert!(session.is_empty());
}

#[test]
fn imported_buffer_smaller_than_request_is_rejected() {
    let npu = SoftwareNpu::rk3588();
    let device = attach(&npu);
    let session = device.open_session();
    let fd = npu.importer.register(0x1000);

    assert!(matches!(
        session.create(0x3000, Some(fd)),
        Err(NpuError::Import { .. })
    ));
    assert_eq!(npu.importer.released(fd), 1);
}
