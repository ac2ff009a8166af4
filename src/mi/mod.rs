//! Mapped-inference binary contract.
//!
//! Everything in this module is wire-visible to firmware: fixed-layout task
//! records, the per-job header, and the constants both sides must agree on.
//! Field layout changes that are not purely additive require a major version
//! bump in [`NPU_MI_VERSION_MAJOR`].

pub mod header;
pub mod tasks;

pub use header::{EngineRef, MappedInferenceHeader, RuntimeConfig};
pub use tasks::{
    CopyFlags, CopyTask, FenceTask, InvariantTask, InvocationTask, KernelRangeTask, TaskRecord,
    TimestampTask, VariantTask,
};

// ===============================================================================================
// Versioning
// ===============================================================================================

pub const NPU_MI_VERSION_MAJOR: u32 = 3;
pub const NPU_MI_VERSION_MINOR: u32 = 2;

/// Packs the driver's mapped-inference version as `major << 16 | minor`.
#[must_use]
pub const fn mi_version() -> u32 {
    (NPU_MI_VERSION_MAJOR << 16) | NPU_MI_VERSION_MINOR
}

#[must_use]
pub const fn mi_version_major(version: u32) -> u32 {
    version >> 16
}

// ===============================================================================================
// Hardware constants
// ===============================================================================================

/// Number of hardware counting barriers per device context.
pub const NPU_BARRIER_COUNT: usize = 32;

/// Device cache-line size. Descriptor buffers must start on this boundary,
/// and the timestamp unit can only target addresses aligned to it.
pub const NPU_CACHE_LINE: u64 = 64;

/// Upper bound on task records in one job, across all engines.
pub const NPU_JOB_TASK_CEILING: usize = 4096;

// ===============================================================================================
// Engines and task families
// ===============================================================================================

/// An independently-dispatching hardware execution queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Engine {
    /// Tensor compute block (invariant/variant feeders and the time unit).
    Compute = 0,
    /// DMA block (copies, fills, fence memory ops).
    Copy = 1,
    /// Programmable kernel cores.
    Shave = 2,
}

impl Engine {
    pub const ALL: [Self; 3] = [Self::Compute, Self::Copy, Self::Shave];

    #[must_use]
    pub const fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

/// One hardware descriptor stream. Each family has its own fixed record
/// layout, its own segment capacity, and a dedicated dispatcher on its
/// engine; records within one family execute strictly in buffer order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskFamily {
    Copy = 0,
    Timestamp = 1,
    Invariant = 2,
    Variant = 3,
    KernelRange = 4,
    KernelInvocation = 5,
    FenceWait = 6,
    FenceSignal = 7,
}

pub const TASK_FAMILY_COUNT: usize = 8;

impl TaskFamily {
    pub const ALL: [Self; TASK_FAMILY_COUNT] = [
        Self::Copy,
        Self::Timestamp,
        Self::Invariant,
        Self::Variant,
        Self::KernelRange,
        Self::KernelInvocation,
        Self::FenceWait,
        Self::FenceSignal,
    ];

    /// The engine whose dispatcher consumes this family's buffer.
    #[must_use]
    pub const fn engine(self) -> Engine {
        match self {
            Self::Invariant | Self::Variant | Self::Timestamp => Engine::Compute,
            Self::Copy | Self::FenceWait | Self::FenceSignal => Engine::Copy,
            Self::KernelRange | Self::KernelInvocation => Engine::Shave,
        }
    }

    /// Hardware-fixed record count per linked segment (powers of two).
    #[must_use]
    pub const fn segment_capacity(self) -> usize {
        match self {
            Self::Copy | Self::Variant => 256,
            Self::Invariant => 32,
            Self::Timestamp
            | Self::KernelRange
            | Self::KernelInvocation
            | Self::FenceWait
            | Self::FenceSignal => 64,
        }
    }

    /// Record size in bytes for this family.
    #[must_use]
    pub const fn record_size(self) -> usize {
        match self {
            Self::Copy => std::mem::size_of::<CopyTask>(),
            Self::Timestamp => std::mem::size_of::<TimestampTask>(),
            Self::Invariant => std::mem::size_of::<InvariantTask>(),
            Self::Variant => std::mem::size_of::<VariantTask>(),
            Self::KernelRange => std::mem::size_of::<KernelRangeTask>(),
            Self::KernelInvocation => std::mem::size_of::<InvocationTask>(),
            Self::FenceWait | Self::FenceSignal => std::mem::size_of::<FenceTask>(),
        }
    }
}
