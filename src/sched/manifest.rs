//! Task manifests from the binary-graph parser.
//!
//! The graph parser hands the core an ordered list of pre-built task
//! records plus the buffers they reference. Barrier references inside a
//! manifest are *manifest-local* indices; the encoder remaps them onto
//! freshly allocated barriers when the manifest is appended, so a graph can
//! be scheduled into any command list without id collisions.

use crate::error::{NpuError, NpuResult};
use crate::mi::TaskRecord;

/// One pre-built task plus its manifest-local barrier dependencies.
#[derive(Debug, Clone)]
pub struct ManifestTask {
    /// Record payload; wait/post masks are ignored and re-derived from the
    /// local indices below during append.
    pub record: TaskRecord,
    /// Bit `i` set: waits on manifest-local barrier `i`.
    pub wait_barriers: u64,
    /// Bit `i` set: posts manifest-local barrier `i`.
    pub post_barriers: u64,
}

/// The schedulable output of the graph parser for one compiled model.
#[derive(Debug, Clone, Default)]
pub struct TaskManifest {
    /// Number of manifest-local barriers referenced by the task lists.
    pub barrier_count: u32,
    /// Tasks run once per graph instance (weight upload, invariant setup).
    pub init_tasks: Vec<ManifestTask>,
    /// Tasks run per inference.
    pub exec_tasks: Vec<ManifestTask>,
    /// Device ranges the tasks reference, re-validated at encode time.
    pub buffers: Vec<(u64, u64)>,
}

impl TaskManifest {
    /// Structural validation: local barrier indices in range, every waited
    /// barrier posted by some task in the same list.
    ///
    /// # Errors
    /// `InvalidArgument` on out-of-range indices or waits with no producer.
    pub fn validate(&self) -> NpuResult<()> {
        if self.barrier_count > 64 {
            return Err(NpuError::InvalidArgument("manifest barrier count"));
        }
        let in_range = if self.barrier_count == 64 {
            u64::MAX
        } else {
            (1u64 << self.barrier_count) - 1
        };
        for list in [&self.init_tasks, &self.exec_tasks] {
            let mut posted = 0u64;
            let mut waited = 0u64;
            for task in list {
                if task.wait_barriers & !in_range != 0 || task.post_barriers & !in_range != 0 {
                    return Err(NpuError::InvalidArgument("manifest barrier index"));
                }
                posted |= task.post_barriers;
                waited |= task.wait_barriers;
            }
            if waited & !posted != 0 {
                return Err(NpuError::InvalidArgument(
                    "manifest waits on a barrier no task posts",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mi::tasks::{CopyTask, InvariantTask};

    fn manifest_task(wait: u64, post: u64) -> ManifestTask {
        ManifestTask {
            record: TaskRecord::Copy(CopyTask {
                length: 4,
                row_count: 1,
                ..Default::default()
            }),
            wait_barriers: wait,
            post_barriers: post,
        }
    }

    #[test]
    fn validate_accepts_balanced_barriers() {
        let manifest = TaskManifest {
            barrier_count: 1,
            init_tasks: vec![ManifestTask {
                record: TaskRecord::Invariant(InvariantTask::default()),
                wait_barriers: 0,
                post_barriers: 0,
            }],
            exec_tasks: vec![manifest_task(0, 0b1), manifest_task(0b1, 0)],
            buffers: Vec::new(),
        };
        manifest.validate().unwrap();
    }

    #[test]
    fn validate_rejects_orphan_wait() {
        let manifest = TaskManifest {
            barrier_count: 2,
            exec_tasks: vec![manifest_task(0b10, 0)],
            ..Default::default()
        };
        assert!(matches!(
            manifest.validate(),
            Err(NpuError::InvalidArgument(_))
        ));
    }

    #[test]
    fn validate_rejects_out_of_range_index() {
        let manifest = TaskManifest {
            barrier_count: 1,
            exec_tasks: vec![manifest_task(0, 0b10)],
            ..Default::default()
        };
        assert!(matches!(
            manifest.validate(),
            Err(NpuError::InvalidArgument(_))
        ));
    }
}
