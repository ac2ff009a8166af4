//! Job packaging, submission, and retirement.
//!
//! A job is one atomic submission: the per-engine descriptor buffers plus a
//! mapped-inference header, issued through a single control call. The
//! manager owns the pending-job table; completion is observed by `wait` or
//! `poll`, and retirement (barrier release, descriptor buffer reclaim) is
//! lazy — it happens on the first call that sees a terminal status.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::drv::DeviceControl;
use crate::drv::ioctl::{
    NPU_JOB_STATUS_ABORTED, NPU_JOB_STATUS_SUCCESS, NPU_PARAM_FW_API_VERSION,
    NPU_TIMEOUT_INFINITE, SubmitJobArgs, WaitJobArgs,
};
use crate::error::{NpuError, NpuResult};
use crate::memory::{Buffer, BufferRegistry, CachePolicy, Residency};
use crate::mi::{MappedInferenceHeader, RuntimeConfig, TaskFamily, mi_version};
use crate::sched::barrier::{BarrierId, BarrierPool};
use crate::sched::event::EventSlotRef;
use crate::sched::partition::{PartitionedTasks, stream_bytes};

/// Kernel-reported completion state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Success,
    Aborted,
    Unknown,
}

impl JobStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// One submitted job. Shared by the queue that issued it and by any fence
/// or event created against it; the last observer to see completion
/// triggers reclamation.
#[derive(Debug)]
pub struct JobRecord {
    submission_id: u64,
    status: Mutex<JobStatus>,
    retired: AtomicBool,
    /// Barriers baked into this job's descriptors; drained at retirement.
    barriers: Mutex<Vec<BarrierId>>,
    /// Descriptor/header buffers owned by the job, freed at retirement.
    owned_bos: Mutex<Vec<Arc<Buffer>>>,
    /// Buffers the job must keep alive but does not own (list scratch).
    pinned: Mutex<Vec<Arc<Buffer>>>,
    /// Event slots referenced by fence tasks; held until retirement so the
    /// slots cannot be recycled under an in-flight job.
    event_refs: Mutex<Vec<EventSlotRef>>,
}

impl JobRecord {
    #[must_use]
    pub fn submission_id(&self) -> u64 {
        self.submission_id
    }

    #[must_use]
    pub fn status(&self) -> JobStatus {
        *self.status.lock().expect("job status poisoned")
    }

    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}

pub type JobHandle = Arc<JobRecord>;

/// Builds, submits, and retires jobs for one device context.
pub struct JobManager {
    control: Arc<dyn DeviceControl>,
    registry: Arc<Mutex<BufferRegistry>>,
    barrier_pool: Arc<Mutex<BarrierPool>>,
    pending: Mutex<Vec<JobHandle>>,
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("pending", &self.pending.lock().map(|p| p.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl JobManager {
    #[must_use]
    pub fn new(
        control: Arc<dyn DeviceControl>,
        registry: Arc<Mutex<BufferRegistry>>,
        barrier_pool: Arc<Mutex<BarrierPool>>,
    ) -> Self {
        Self {
            control,
            registry,
            barrier_pool,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Packages the partitioned tasks into device buffers plus a header and
    /// issues the submission. All-or-nothing: any failure before the
    /// control call returns leaves no job behind, and the control call
    /// itself is a single verb covering every engine.
    ///
    /// On success the barriers in `barriers` transfer to the job.
    pub fn submit(
        &self,
        parts: &PartitionedTasks,
        runtime: RuntimeConfig,
        barriers: &mut Vec<BarrierId>,
        pinned: Vec<Arc<Buffer>>,
        event_refs: Vec<EventSlotRef>,
    ) -> NpuResult<JobHandle> {
        let mut owned = Vec::new();
        let result = self.submit_inner(parts, runtime, &mut owned);
        match result {
            Ok(args) => {
                debug!(
                    job_id = args.job_id,
                    tasks = parts.total(),
                    engines = args.engine_mask,
                    "job submitted"
                );
                let job = Arc::new(JobRecord {
                    submission_id: args.job_id,
                    status: Mutex::new(JobStatus::Pending),
                    retired: AtomicBool::new(false),
                    barriers: Mutex::new(std::mem::take(barriers)),
                    owned_bos: Mutex::new(owned),
                    pinned: Mutex::new(pinned),
                    event_refs: Mutex::new(event_refs),
                });
                self.pending
                    .lock()
                    .expect("pending jobs poisoned")
                    .push(job.clone());
                Ok(job)
            }
            Err(e) => {
                // Unwind the staging buffers; the whole job is treated as
                // not submitted.
                let mut registry = self.registry.lock().expect("registry poisoned");
                for bo in &owned {
                    let _ = registry.free(bo);
                }
                Err(self.enrich_version_error(e))
            }
        }
    }

    fn submit_inner(
        &self,
        parts: &PartitionedTasks,
        runtime: RuntimeConfig,
        owned: &mut Vec<Arc<Buffer>>,
    ) -> NpuResult<SubmitJobArgs> {
        let mut header = MappedInferenceHeader::new(parts.total() as u32, runtime);

        {
            let mut registry = self.registry.lock().expect("registry poisoned");
            for family in TaskFamily::ALL {
                let count = parts.count(family);
                if count == 0 {
                    continue;
                }
                let bytes = stream_bytes(family, count);
                let bo = registry.alloc(
                    bytes as u64,
                    Residency::HostVisible,
                    CachePolicy::WriteCombined,
                )?;
                let image = parts.encode_stream(family, bo.device_addr());
                unsafe {
                    bo.host_slice_mut()[..image.len()].copy_from_slice(&image);
                }
                header.streams[family as usize].address = bo.device_addr();
                header.streams[family as usize].count = count as u32;
                owned.push(bo);
            }

            let header_bo = registry.alloc(
                std::mem::size_of::<MappedInferenceHeader>() as u64,
                Residency::HostVisible,
                CachePolicy::WriteCombined,
            )?;
            unsafe {
                let bytes = header.as_bytes();
                header_bo.host_slice_mut()[..bytes.len()].copy_from_slice(bytes);
            }
            owned.push(header_bo);
        }

        let header_bo = owned.last().expect("header buffer just pushed");
        let mut args = SubmitJobArgs {
            header_handle: header_bo.handle(),
            header_addr: header_bo.device_addr(),
            engine_mask: parts.engine_mask(),
            task_count: parts.total() as u32,
            job_id: 0,
        };
        self.control.submit_job(&mut args)?;
        Ok(args)
    }

    /// Fills the version pair on a mismatch error so callers see both sides.
    fn enrich_version_error(&self, e: NpuError) -> NpuError {
        if let NpuError::VersionMismatch { .. } = e {
            let firmware = self
                .control
                .query_param(NPU_PARAM_FW_API_VERSION, 0)
                .unwrap_or(0) as u32;
            NpuError::VersionMismatch {
                driver: mi_version(),
                firmware,
            }
        } else {
            e
        }
    }

    /// Blocks until the job completes or `timeout` elapses.
    ///
    /// # Errors
    /// `DeviceLost` for an aborted job, `Unknown` for an unclassified
    /// status, `WaitTimeout` when the bound elapses first. Nothing is
    /// retried automatically.
    pub fn wait(&self, job: &JobHandle, timeout: Option<Duration>) -> NpuResult<()> {
        match self.advance(job, timeout)? {
            JobStatus::Success => Ok(()),
            JobStatus::Aborted => Err(NpuError::DeviceLost),
            JobStatus::Unknown => Err(NpuError::Unknown),
            JobStatus::Pending => Err(NpuError::WaitTimeout),
        }
    }

    /// Non-blocking status query; retires the job if it just completed.
    pub fn poll(&self, job: &JobHandle) -> NpuResult<JobStatus> {
        self.advance(job, Some(Duration::ZERO))
    }

    fn advance(&self, job: &JobHandle, timeout: Option<Duration>) -> NpuResult<JobStatus> {
        let current = job.status();
        if current.is_terminal() {
            self.retire(job);
            return Ok(current);
        }

        let mut args = WaitJobArgs {
            job_id: job.submission_id,
            timeout_ns: timeout.map_or(NPU_TIMEOUT_INFINITE, |d| d.as_nanos() as u64),
            status: 0,
            pad: 0,
        };
        match self.control.wait_job(&mut args) {
            Ok(()) => {
                let status = match args.status {
                    NPU_JOB_STATUS_SUCCESS => JobStatus::Success,
                    NPU_JOB_STATUS_ABORTED => JobStatus::Aborted,
                    _ => JobStatus::Unknown,
                };
                *job.status.lock().expect("job status poisoned") = status;
                if status == JobStatus::Aborted {
                    warn!(job_id = job.submission_id, "device reported job abort");
                }
                self.retire(job);
                Ok(status)
            }
            Err(NpuError::WaitTimeout) => Ok(JobStatus::Pending),
            Err(NpuError::DeviceLost) => {
                // The whole context is gone; every pending job aborts with it.
                self.mark_device_lost();
                Ok(JobStatus::Aborted)
            }
            Err(e) => Err(e),
        }
    }

    /// Marks all pending jobs aborted after a device-loss signal so fences
    /// and events observe the failure.
    pub fn mark_device_lost(&self) {
        let jobs: Vec<JobHandle> = self
            .pending
            .lock()
            .expect("pending jobs poisoned")
            .clone();
        for job in jobs {
            let mut status = job.status.lock().expect("job status poisoned");
            if !status.is_terminal() {
                *status = JobStatus::Aborted;
            }
            drop(status);
            self.retire(&job);
        }
    }

    /// Releases barriers and descriptor buffers once the device has
    /// confirmed completion. Idempotent; runs at most once per job.
    fn retire(&self, job: &JobHandle) {
        if job.retired.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(job_id = job.submission_id, "retiring job");

        {
            let mut pool = self.barrier_pool.lock().expect("barrier pool poisoned");
            for id in job.barriers.lock().expect("job barriers poisoned").drain(..) {
                if let Err(e) = pool.release(id) {
                    warn!(barrier = id.index(), error = %e, "barrier release failed");
                }
            }
        }

        {
            let mut registry = self.registry.lock().expect("registry poisoned");
            for bo in job.owned_bos.lock().expect("job buffers poisoned").drain(..) {
                let _ = registry.free(&bo);
            }
        }

        job.pinned.lock().expect("job pins poisoned").clear();
        job.event_refs
            .lock()
            .expect("job event refs poisoned")
            .clear();

        self.pending
            .lock()
            .expect("pending jobs poisoned")
            .retain(|j| !Arc::ptr_eq(j, job));
    }
}
