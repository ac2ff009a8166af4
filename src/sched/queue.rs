//! Caller-facing submission queue.
//!
//! A queue turns a closed command list into a job and tracks what it has
//! submitted so `synchronize` can drain it. Barrier ids are baked into a
//! closed list's descriptors, so each close admits exactly one submission;
//! reset and re-encode the list to run it again.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::context::DeviceContext;
use crate::error::{NpuError, NpuResult};
use crate::sched::encoder::CommandList;
use crate::sched::event::Fence;
use crate::sched::job::JobHandle;

pub struct CommandQueue {
    ctx: Arc<DeviceContext>,
    jobs: Mutex<Vec<JobHandle>>,
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("jobs", &self.jobs.lock().map(|j| j.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl CommandQueue {
    #[must_use]
    pub fn new(ctx: Arc<DeviceContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            jobs: Mutex::new(Vec::new()),
        })
    }

    /// Creates a fence driven by jobs subsequently submitted with it.
    #[must_use]
    pub fn create_fence(&self) -> Fence {
        Fence::new(self.ctx.jobs().clone())
    }

    /// Submits a closed command list as one atomic job.
    ///
    /// # Errors
    /// `InvalidState` if the list is not closed or was already submitted;
    /// submission failures leave the list closed and resubmittable.
    pub fn submit(&self, list: &mut CommandList, fence: Option<&Fence>) -> NpuResult<JobHandle> {
        let pinned = list.scratch_pages();
        let event_refs = list.event_refs.clone();
        let runtime = self.ctx.runtime_config();

        let Some(closed) = list.closed.as_mut() else {
            return Err(NpuError::InvalidState("command list is not closed"));
        };
        if closed.submitted {
            return Err(NpuError::InvalidState(
                "command list was already submitted; reset and re-encode to reuse",
            ));
        }

        let mut barriers = std::mem::take(&mut closed.barriers);
        match self
            .ctx
            .jobs()
            .submit(&closed.parts, runtime, &mut barriers, pinned, event_refs)
        {
            Ok(job) => {
                closed.submitted = true;
                list.jobs.push(Arc::downgrade(&job));
                if let Some(fence) = fence {
                    fence.attach(job.clone());
                }
                self.jobs.lock().expect("queue jobs poisoned").push(job.clone());
                Ok(job)
            }
            Err(e) => {
                // Whole job treated as not submitted; the barriers remain
                // owned by the closed list.
                closed.barriers = barriers;
                Err(e)
            }
        }
    }

    /// Blocks until every job submitted through this queue completes.
    /// Returns immediately when nothing is outstanding.
    pub fn synchronize(&self, timeout: Option<Duration>) -> NpuResult<()> {
        let outstanding: Vec<JobHandle> = self.jobs.lock().expect("queue jobs poisoned").clone();
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        for job in &outstanding {
            let remaining = match deadline {
                None => None,
                Some(d) => Some(
                    d.checked_duration_since(std::time::Instant::now())
                        .ok_or(NpuError::WaitTimeout)?,
                ),
            };
            self.ctx.jobs().wait(job, remaining)?;
        }
        self.jobs
            .lock()
            .expect("queue jobs poisoned")
            .retain(|job| !job.is_retired());
        Ok(())
    }
}
