//! User-mode driver core for a fixed-function neural-processing
//! accelerator.
//!
//! The crate turns logical operations (copies, timestamps, barriers, event
//! signal/wait, graph execution, metric queries) into hardware task
//! descriptors, schedules cross-engine ordering through a fixed pool of
//! counting barriers, submits jobs through the kernel control interface,
//! and tracks completion through host-visible events and fences.
//!
//! Typical flow:
//!
//! ```no_run
//! use std::sync::Arc;
//! use npu_rs::context::DeviceContext;
//! use npu_rs::drv::soft::SoftDevice;
//! use npu_rs::memory::{CachePolicy, Residency};
//!
//! # fn main() -> npu_rs::error::NpuResult<()> {
//! let ctx = DeviceContext::new(Arc::new(SoftDevice::new()))?;
//! let queue = ctx.create_queue();
//!
//! let src = ctx.alloc_buffer(4096, Residency::HostVisible, CachePolicy::default())?;
//! let dst = ctx.alloc_buffer(4096, Residency::HostVisible, CachePolicy::default())?;
//!
//! let mut list = ctx.create_command_list();
//! list.append_copy(src.device_addr(), dst.device_addr(), 4096)?;
//! list.close()?;
//!
//! queue.submit(&mut list, None)?;
//! queue.synchronize(None)?;
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod drv;
pub mod error;
pub mod memory;
pub mod mi;
pub mod sched;
pub mod utils;

pub use context::DeviceContext;
pub use error::{NpuError, NpuResult};
pub use memory::{Buffer, BufferRegistry, CachePolicy, Residency};
pub use mi::{Engine, RuntimeConfig, TaskFamily};
pub use sched::encoder::{CommandList, Copy2d, ListFlavor};
pub use sched::event::{Event, EventPool, Fence, MetricParams, SyncStatus};
pub use sched::job::{JobHandle, JobStatus};
pub use sched::manifest::{ManifestTask, TaskManifest};
pub use sched::queue::CommandQueue;
