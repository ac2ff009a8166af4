//! Kernel control interface.
//!
//! The driver core depends on exactly five control verbs; everything else
//! the kernel offers is the business of layers above. [`DeviceControl`]
//! is the seam: [`device::NpuDevice`] issues real ioctls against the
//! character device, [`soft::SoftDevice`] services the same verbs entirely
//! in-process for tests and bring-up on machines without the hardware.

pub mod device;
pub mod ioctl;
pub mod soft;

use std::fmt;

use crate::error::NpuResult;
use ioctl::{BoCreateArgs, BoInfoArgs, SubmitJobArgs, WaitJobArgs};

/// The control verbs this core consumes.
///
/// Implementations fill the `out` fields of each argument struct in place,
/// mirroring the kernel calling convention. Failures map 1:1 into the
/// driver error taxonomy.
pub trait DeviceControl: Send + Sync + fmt::Debug {
    /// Allocate a buffer object; fills `handle`, `device_addr`, `mmap_offset`.
    fn bo_create(&self, args: &mut BoCreateArgs) -> NpuResult<()>;

    /// Query a buffer object by handle.
    fn bo_info(&self, args: &mut BoInfoArgs) -> NpuResult<()>;

    /// Release a buffer object.
    fn bo_free(&self, handle: u64) -> NpuResult<()>;

    /// Map a host-visible buffer object into the caller's address space.
    ///
    /// # Safety contract
    /// The returned pointer is valid for `size` bytes until `bo_unmap` (or,
    /// for in-process devices, until `bo_free`).
    fn bo_map(&self, handle: u64, size: usize, mmap_offset: u64) -> NpuResult<*mut u8>;

    /// Unmap a mapping obtained from `bo_map`.
    fn bo_unmap(&self, ptr: *mut u8, size: usize) -> NpuResult<()>;

    /// Submit one job atomically; fills `job_id`.
    fn submit_job(&self, args: &mut SubmitJobArgs) -> NpuResult<()>;

    /// Block (bounded by `timeout_ns`) until the job completes; fills `status`.
    fn wait_job(&self, args: &mut WaitJobArgs) -> NpuResult<()>;

    /// Query a device parameter (`NPU_PARAM_*`).
    fn query_param(&self, param: u32, index: u32) -> NpuResult<u64>;
}
