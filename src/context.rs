//! The device context: owner of the control handle and the shared pools.
//!
//! Hardware pools (barriers, event slots) are explicit objects whose
//! lifetime is tied to this context — there are no process-wide singletons.
//! Multiple contexts over separate devices coexist without sharing state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::drv::DeviceControl;
use crate::drv::ioctl::NPU_PARAM_FW_API_VERSION;
use crate::error::{NpuError, NpuResult};
use crate::memory::{Buffer, BufferRegistry, CachePolicy, Residency};
use crate::mi::{RuntimeConfig, mi_version, mi_version_major};
use crate::sched::barrier::BarrierPool;
use crate::sched::encoder::CommandList;
use crate::sched::event::EventPool;
use crate::sched::job::JobManager;
use crate::sched::queue::CommandQueue;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

pub struct DeviceContext {
    id: u64,
    control: Arc<dyn DeviceControl>,
    registry: Arc<Mutex<BufferRegistry>>,
    barriers: Arc<Mutex<BarrierPool>>,
    jobs: Arc<JobManager>,
    runtime: RuntimeConfig,
    fw_version: u32,
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("id", &self.id)
            .field("fw_version", &format_args!("{:#x}", self.fw_version))
            .finish_non_exhaustive()
    }
}

impl DeviceContext {
    /// Opens a context over `control` with the default runtime
    /// configuration.
    ///
    /// # Errors
    /// `VersionMismatch` when the firmware's mapped-inference major version
    /// differs from the driver's — caught here once instead of per job.
    pub fn new(control: Arc<dyn DeviceControl>) -> NpuResult<Arc<Self>> {
        Self::with_runtime_config(control, RuntimeConfig::default())
    }

    pub fn with_runtime_config(
        control: Arc<dyn DeviceControl>,
        runtime: RuntimeConfig,
    ) -> NpuResult<Arc<Self>> {
        let fw_version = control.query_param(NPU_PARAM_FW_API_VERSION, 0)? as u32;
        if mi_version_major(fw_version) != mi_version_major(mi_version()) {
            return Err(NpuError::VersionMismatch {
                driver: mi_version(),
                firmware: fw_version,
            });
        }

        let registry = Arc::new(Mutex::new(BufferRegistry::new(control.clone())));
        let barriers = Arc::new(Mutex::new(BarrierPool::new()));
        let jobs = Arc::new(JobManager::new(
            control.clone(),
            registry.clone(),
            barriers.clone(),
        ));

        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        debug!(id, fw_version = format_args!("{fw_version:#x}"), "device context created");
        Ok(Arc::new(Self {
            id,
            control,
            registry,
            barriers,
            jobs,
            runtime,
            fw_version,
        }))
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn control(&self) -> &Arc<dyn DeviceControl> {
        &self.control
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Mutex<BufferRegistry>> {
        &self.registry
    }

    #[must_use]
    pub fn barriers(&self) -> &Arc<Mutex<BarrierPool>> {
        &self.barriers
    }

    #[must_use]
    pub fn jobs(&self) -> &Arc<JobManager> {
        &self.jobs
    }

    #[must_use]
    pub fn runtime_config(&self) -> RuntimeConfig {
        self.runtime
    }

    #[must_use]
    pub fn fw_version(&self) -> u32 {
        self.fw_version
    }

    // ===========================================================================================
    // Convenience constructors
    // ===========================================================================================

    /// Allocates a buffer object through this context's registry.
    pub fn alloc_buffer(
        &self,
        size: u64,
        residency: Residency,
        cache: CachePolicy,
    ) -> NpuResult<Arc<Buffer>> {
        self.registry
            .lock()
            .expect("registry poisoned")
            .alloc(size, residency, cache)
    }

    /// Frees a buffer object. Command lists referencing it will fail their
    /// next close.
    pub fn free_buffer(&self, buffer: &Arc<Buffer>) -> NpuResult<()> {
        self.registry
            .lock()
            .expect("registry poisoned")
            .free(buffer)
    }

    #[must_use]
    pub fn create_queue(self: &Arc<Self>) -> Arc<CommandQueue> {
        CommandQueue::new(self.clone())
    }

    #[must_use]
    pub fn create_command_list(self: &Arc<Self>) -> CommandList {
        CommandList::new(self.clone())
    }

    #[must_use]
    pub fn create_immediate_list(self: &Arc<Self>, queue: &Arc<CommandQueue>) -> CommandList {
        CommandList::new_immediate(self.clone(), queue.clone())
    }

    /// Creates an event pool of `capacity` slots tied to this context.
    pub fn create_event_pool(&self, capacity: usize) -> NpuResult<EventPool> {
        EventPool::new(&self.registry, self.id, capacity)
    }
}
