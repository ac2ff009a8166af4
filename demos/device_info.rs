use std::sync::Arc;

use npu_rs::context::DeviceContext;
use npu_rs::drv::DeviceControl;
use npu_rs::drv::device::NpuDevice;
use npu_rs::drv::ioctl::{
    NPU_PARAM_BARRIER_COUNT, NPU_PARAM_ENGINE_MASK, NPU_PARAM_EVENT_SLOT_COUNT,
    NPU_PARAM_TIMESTAMP_FREQ,
};
use npu_rs::drv::soft::SoftDevice;
use npu_rs::mi::{NPU_MI_VERSION_MAJOR, NPU_MI_VERSION_MINOR};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("============================================================");
    println!("                 NPU Driver Core - Device Info              ");
    println!("============================================================");

    // 1. Open the device; fall back to the software device when the node
    //    is absent.
    let control: Arc<dyn DeviceControl> = match NpuDevice::open() {
        Ok(device) => {
            println!("[+] Opened {}", npu_rs::drv::device::NPU_DEVICE_PATH);
            Arc::new(device)
        }
        Err(e) => {
            println!("[!] Hardware unavailable ({e}); using software device");
            Arc::new(SoftDevice::new())
        }
    };

    // 2. Query the raw parameters.
    println!(
        "    Driver mapped-inference version: {}.{}",
        NPU_MI_VERSION_MAJOR, NPU_MI_VERSION_MINOR
    );
    println!(
        "    Barrier count:    {}",
        control.query_param(NPU_PARAM_BARRIER_COUNT, 0)?
    );
    println!(
        "    Engine mask:      {:#05b}",
        control.query_param(NPU_PARAM_ENGINE_MASK, 0)?
    );
    println!(
        "    Timestamp freq:   {} Hz",
        control.query_param(NPU_PARAM_TIMESTAMP_FREQ, 0)?
    );
    println!(
        "    Event slots:      {}",
        control.query_param(NPU_PARAM_EVENT_SLOT_COUNT, 0)?
    );

    // 3. Bring up a context; this verifies the firmware major version.
    let ctx = DeviceContext::new(control)?;
    println!(
        "[+] Context {} created (firmware {:#x})",
        ctx.id(),
        ctx.fw_version()
    );

    Ok(())
}
