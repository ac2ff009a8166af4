//! End-to-end submission tests against the software device.

use std::sync::Arc;
use std::time::Duration;

use npu_rs::context::DeviceContext;
use npu_rs::drv::DeviceControl;
use npu_rs::drv::ioctl::SubmitJobArgs;
use npu_rs::drv::soft::SoftDevice;
use npu_rs::memory::{Buffer, CachePolicy, Residency};
use npu_rs::mi::header::{MI_MAGIC, MappedInferenceHeader, RuntimeConfig};
use npu_rs::mi::{NPU_MI_VERSION_MAJOR, NPU_MI_VERSION_MINOR};
use npu_rs::{NpuError, SyncStatus};

fn ctx() -> Arc<DeviceContext> {
    DeviceContext::new(Arc::new(SoftDevice::new())).unwrap()
}

fn host_buffer(ctx: &DeviceContext, size: u64) -> Arc<Buffer> {
    ctx.alloc_buffer(size, Residency::HostVisible, CachePolicy::default())
        .unwrap()
}

fn write_host(buffer: &Buffer, bytes: &[u8]) {
    unsafe {
        buffer.host_slice_mut()[..bytes.len()].copy_from_slice(bytes);
    }
}

fn read_host(buffer: &Buffer, len: usize) -> Vec<u8> {
    unsafe { buffer.host_slice_mut()[..len].to_vec() }
}

#[test]
fn empty_list_submits_and_synchronizes_immediately() {
    let ctx = ctx();
    let queue = ctx.create_queue();

    let mut list = ctx.create_command_list();
    list.close().unwrap();
    assert_eq!(list.partitions().unwrap().total(), 0);
    assert_eq!(list.partitions().unwrap().engine_mask(), 0);

    queue.submit(&mut list, None).unwrap();
    queue.synchronize(Some(Duration::from_secs(1))).unwrap();
}

#[test]
fn copy_moves_bytes_through_the_device() {
    let ctx = ctx();
    let queue = ctx.create_queue();
    let src = host_buffer(&ctx, 4096);
    let dst = host_buffer(&ctx, 4096);

    let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    write_host(&src, &payload);

    let mut list = ctx.create_command_list();
    list.append_copy(src.device_addr(), dst.device_addr(), 4096)
        .unwrap();
    list.close().unwrap();
    queue.submit(&mut list, None).unwrap();
    queue.synchronize(None).unwrap();

    assert_eq!(read_host(&dst, 4096), payload);
}

#[test]
fn barrier_orders_dependent_copies_across_the_job() {
    let ctx = ctx();
    let queue = ctx.create_queue();
    let a = host_buffer(&ctx, 1024);
    let b = host_buffer(&ctx, 1024);
    let c = host_buffer(&ctx, 1024);

    write_host(&a, &[0x5A; 1024]);

    let mut list = ctx.create_command_list();
    list.append_copy(a.device_addr(), b.device_addr(), 1024)
        .unwrap();
    list.append_barrier().unwrap();
    list.append_copy(b.device_addr(), c.device_addr(), 1024)
        .unwrap();
    list.close().unwrap();
    queue.submit(&mut list, None).unwrap();
    queue.synchronize(None).unwrap();

    assert_eq!(read_host(&c, 1024), vec![0x5A; 1024]);
}

#[test]
fn fill_writes_the_pattern() {
    let ctx = ctx();
    let queue = ctx.create_queue();
    let dst = host_buffer(&ctx, 256);

    let mut list = ctx.create_command_list();
    list.append_fill(dst.device_addr(), 256, 0x1122_3344_5566_7788)
        .unwrap();
    list.close().unwrap();
    queue.submit(&mut list, None).unwrap();
    queue.synchronize(None).unwrap();

    let out = read_host(&dst, 16);
    assert_eq!(&out[..8], &0x1122_3344_5566_7788u64.to_le_bytes());
    assert_eq!(&out[8..16], &0x1122_3344_5566_7788u64.to_le_bytes());
}

#[test]
fn misaligned_timestamp_lands_at_the_requested_address() {
    let ctx = ctx();
    let queue = ctx.create_queue();
    let dst = host_buffer(&ctx, 4096);

    let mut list = ctx.create_command_list();
    list.append_timestamp(dst.device_addr() + 12).unwrap();
    list.close().unwrap();
    queue.submit(&mut list, None).unwrap();
    queue.synchronize(None).unwrap();

    let bytes = read_host(&dst, 20);
    let stamp = u64::from_le_bytes(bytes[12..20].try_into().unwrap());
    assert_ne!(stamp, 0);
}

#[test]
fn device_signal_event_is_host_observable() {
    let ctx = ctx();
    let queue = ctx.create_queue();
    let pool = ctx.create_event_pool(8).unwrap();
    let event = pool.create_event(3).unwrap();
    let a = host_buffer(&ctx, 512);
    let b = host_buffer(&ctx, 512);

    let mut list = ctx.create_command_list();
    list.append_copy(a.device_addr(), b.device_addr(), 512)
        .unwrap();
    list.append_signal_event(&event).unwrap();
    list.close().unwrap();

    assert_eq!(event.query_status(), SyncStatus::NotReady);
    queue.submit(&mut list, None).unwrap();
    queue.synchronize(None).unwrap();

    assert_eq!(event.query_status(), SyncStatus::Ready);
    event.host_synchronize(Some(Duration::from_millis(10))).unwrap();
}

#[test]
fn pre_signaled_wait_lets_the_job_run() {
    let ctx = ctx();
    let queue = ctx.create_queue();
    let pool = ctx.create_event_pool(4).unwrap();
    let event = pool.create_event(0).unwrap();
    let a = host_buffer(&ctx, 256);
    let b = host_buffer(&ctx, 256);
    write_host(&a, &[7u8; 256]);

    event.host_signal();

    let mut list = ctx.create_command_list();
    list.append_wait_events(&[&event]).unwrap();
    list.append_copy(a.device_addr(), b.device_addr(), 256)
        .unwrap();
    list.close().unwrap();
    queue.submit(&mut list, None).unwrap();
    queue.synchronize(None).unwrap();

    assert_eq!(read_host(&b, 256), vec![7u8; 256]);
}

#[test]
fn unsatisfiable_wait_aborts_as_device_lost() {
    let ctx = ctx();
    let queue = ctx.create_queue();
    let pool = ctx.create_event_pool(4).unwrap();
    let event = pool.create_event(0).unwrap();

    let mut list = ctx.create_command_list();
    list.append_wait_events(&[&event]).unwrap();
    list.close().unwrap();

    let fence = queue.create_fence();
    queue.submit(&mut list, Some(&fence)).unwrap();

    assert!(matches!(
        queue.synchronize(None),
        Err(NpuError::DeviceLost)
    ));
    // The failure is observable through the fence as well.
    assert!(matches!(fence.query_status(), Err(NpuError::DeviceLost)));
}

#[test]
fn fence_tracks_submission_and_reset() {
    let ctx = ctx();
    let queue = ctx.create_queue();
    let a = host_buffer(&ctx, 128);
    let b = host_buffer(&ctx, 128);

    let fence = queue.create_fence();
    assert_eq!(fence.query_status().unwrap(), SyncStatus::NotReady);

    let mut list = ctx.create_command_list();
    list.append_copy(a.device_addr(), b.device_addr(), 128)
        .unwrap();
    list.close().unwrap();
    queue.submit(&mut list, Some(&fence)).unwrap();

    fence.synchronize(Some(Duration::from_secs(1))).unwrap();
    assert_eq!(fence.query_status().unwrap(), SyncStatus::Ready);

    fence.reset();
    assert_eq!(fence.query_status().unwrap(), SyncStatus::NotReady);
}

#[test]
fn reset_is_refused_until_the_job_retires() {
    let ctx = ctx();
    let queue = ctx.create_queue();
    let a = host_buffer(&ctx, 128);
    let b = host_buffer(&ctx, 128);

    let mut list = ctx.create_command_list();
    list.append_copy(a.device_addr(), b.device_addr(), 128)
        .unwrap();
    list.close().unwrap();
    queue.submit(&mut list, None).unwrap();

    // Completion has not been observed yet; the job is still nominally in
    // flight and reclamation is lazy.
    assert!(matches!(list.reset(), Err(NpuError::InvalidState(_))));

    queue.synchronize(None).unwrap();
    list.reset().unwrap();
    assert_eq!(list.task_count(), 0);
}

#[test]
fn closed_list_admits_exactly_one_submission() {
    let ctx = ctx();
    let queue = ctx.create_queue();
    let a = host_buffer(&ctx, 128);
    let b = host_buffer(&ctx, 128);

    let mut list = ctx.create_command_list();
    list.append_copy(a.device_addr(), b.device_addr(), 128)
        .unwrap();

    // Not closed yet.
    assert!(matches!(
        queue.submit(&mut list, None),
        Err(NpuError::InvalidState(_))
    ));

    list.close().unwrap();
    queue.submit(&mut list, None).unwrap();
    assert!(matches!(
        queue.submit(&mut list, None),
        Err(NpuError::InvalidState(_))
    ));
}

#[test]
fn immediate_list_self_submits_each_operation() {
    let ctx = ctx();
    let queue = ctx.create_queue();
    let a = host_buffer(&ctx, 512);
    let b = host_buffer(&ctx, 512);
    write_host(&a, &[0xAB; 512]);

    let mut list = ctx.create_immediate_list(&queue);
    list.append_copy(a.device_addr(), b.device_addr(), 512)
        .unwrap();
    queue.synchronize(None).unwrap();
    assert_eq!(read_host(&b, 512), vec![0xAB; 512]);

    // Immediate lists reject the deferred close path.
    assert!(matches!(list.close(), Err(NpuError::InvalidState(_))));
}

#[test]
fn context_creation_rejects_firmware_major_mismatch() {
    let future_fw = ((NPU_MI_VERSION_MAJOR + 1) << 16) | NPU_MI_VERSION_MINOR;
    let result = DeviceContext::new(Arc::new(SoftDevice::with_fw_version(future_fw)));
    assert!(matches!(result, Err(NpuError::VersionMismatch { .. })));
}

#[test]
fn header_major_mismatch_is_version_mismatch_not_unknown() {
    // Drive the control interface directly: a header stamped major N+1
    // against firmware built for N must be rejected as a version error.
    let device = SoftDevice::new();

    let mut bo = npu_rs::drv::ioctl::BoCreateArgs {
        size: 4096,
        flags: npu_rs::drv::ioctl::NPU_BO_FLAG_HOST_VISIBLE,
        ..Default::default()
    };
    device.bo_create(&mut bo).unwrap();

    let mut header = MappedInferenceHeader::new(0, RuntimeConfig::default());
    assert_eq!(header.magic, MI_MAGIC);
    header.api_version = ((NPU_MI_VERSION_MAJOR + 1) << 16) | NPU_MI_VERSION_MINOR;

    let ptr = device.bo_map(bo.handle, 4096, bo.mmap_offset).unwrap();
    unsafe {
        std::ptr::copy_nonoverlapping(
            header.as_bytes().as_ptr(),
            ptr,
            header.as_bytes().len(),
        );
    }

    let mut submit = SubmitJobArgs {
        header_handle: bo.handle,
        header_addr: bo.device_addr,
        engine_mask: 0,
        task_count: 0,
        job_id: 0,
    };
    assert!(matches!(
        device.submit_job(&mut submit),
        Err(NpuError::VersionMismatch { .. })
    ));
}

#[test]
fn graph_manifest_runs_with_remapped_barriers() {
    use npu_rs::mi::tasks::CopyTask;
    use npu_rs::mi::TaskRecord;
    use npu_rs::{ManifestTask, TaskManifest};

    let ctx = ctx();
    let queue = ctx.create_queue();
    let a = host_buffer(&ctx, 256);
    let b = host_buffer(&ctx, 256);
    let c = host_buffer(&ctx, 256);
    write_host(&a, &[0x42; 256]);

    let copy = |src: &Buffer, dst: &Buffer, wait: u64, post: u64| ManifestTask {
        record: TaskRecord::Copy(CopyTask {
            src_addr: src.device_addr(),
            dst_addr: dst.device_addr(),
            length: 256,
            row_count: 1,
            ..Default::default()
        }),
        wait_barriers: wait,
        post_barriers: post,
    };

    let manifest = TaskManifest {
        barrier_count: 1,
        init_tasks: Vec::new(),
        exec_tasks: vec![copy(&a, &b, 0, 0b1), copy(&b, &c, 0b1, 0)],
        buffers: vec![
            (a.device_addr(), 256),
            (b.device_addr(), 256),
            (c.device_addr(), 256),
        ],
    };

    let mut list = ctx.create_command_list();
    list.append_graph_execute(&manifest).unwrap();
    list.close().unwrap();
    queue.submit(&mut list, None).unwrap();
    queue.synchronize(None).unwrap();

    assert_eq!(read_host(&c, 256), vec![0x42; 256]);
}

#[test]
fn metric_query_wraps_the_measured_region() {
    let ctx = ctx();
    let queue = ctx.create_queue();
    let pool = ctx.create_event_pool(4).unwrap();
    let event = pool
        .create_event_with_metrics(
            0,
            npu_rs::MetricParams {
                group_mask: 0b11,
                payload_size: 64,
            },
        )
        .unwrap();
    let query_buf = host_buffer(&ctx, 4096);
    let a = host_buffer(&ctx, 256);
    let b = host_buffer(&ctx, 256);

    let mut list = ctx.create_command_list();
    list.append_metric_query_begin(&event, query_buf.device_addr())
        .unwrap();
    list.append_copy(a.device_addr(), b.device_addr(), 256)
        .unwrap();
    list.append_metric_query_end(&event, query_buf.device_addr() + 64)
        .unwrap();
    list.close().unwrap();
    queue.submit(&mut list, None).unwrap();
    queue.synchronize(None).unwrap();

    let bytes = read_host(&query_buf, 128);
    let begin = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
    let end = u64::from_le_bytes(bytes[64..72].try_into().unwrap());
    assert!(begin != 0 && end != 0);
    assert!(end > begin, "end snapshot must observe the measured work");
}
