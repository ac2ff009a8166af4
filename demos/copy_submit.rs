use std::sync::Arc;

use npu_rs::context::DeviceContext;
use npu_rs::drv::soft::SoftDevice;
use npu_rs::memory::{CachePolicy, Residency};
use npu_rs::SyncStatus;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("============================================================");
    println!("              NPU Driver Core - Copy Submission             ");
    println!("============================================================");

    // 1. Context over the software device (swap in NpuDevice::open() on a
    //    machine with the driver loaded).
    let ctx = DeviceContext::new(Arc::new(SoftDevice::new()))?;
    let queue = ctx.create_queue();
    println!("[+] Context {} up", ctx.id());

    // 2. Allocate and seed the buffers.
    let src = ctx.alloc_buffer(4096, Residency::HostVisible, CachePolicy::default())?;
    let dst = ctx.alloc_buffer(4096, Residency::HostVisible, CachePolicy::default())?;
    unsafe {
        for (i, byte) in src.host_slice_mut().iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
    }
    println!(
        "[+] Buffers: src {:#x}, dst {:#x}",
        src.device_addr(),
        dst.device_addr()
    );

    // 3. Encode copy + timestamp + device-side event signal.
    let pool = ctx.create_event_pool(8)?;
    let done = pool.create_event(0)?;

    let mut list = ctx.create_command_list();
    list.append_copy(src.device_addr(), dst.device_addr(), 4096)?;
    list.append_timestamp(dst.device_addr() + 12)?; // misaligned: split path
    list.append_signal_event(&done)?;
    list.close()?;
    println!(
        "[+] List closed: {} task records",
        list.partitions().map(npu_rs::sched::partition::PartitionedTasks::total).unwrap_or(0)
    );

    // 4. Submit and synchronize.
    let job = queue.submit(&mut list, None)?;
    println!("[+] Submitted job {}", job.submission_id());
    queue.synchronize(None)?;

    // 5. Verify.
    let ok = unsafe { src.host_slice_mut()[..4096] == dst.host_slice_mut()[..4096] };
    println!("    Copy intact:   {ok}");
    println!(
        "    Event state:   {:?}",
        matches!(done.query_status(), SyncStatus::Ready)
    );

    ctx.free_buffer(&src)?;
    ctx.free_buffer(&dst)?;
    Ok(())
}
