//! Fixed-layout task records.
//!
//! Layouts are hardware-mandated: sizes and field offsets are frozen per
//! mapped-inference major version, asserted at compile time below. All
//! records share the same scheduling preamble — a wait barrier mask, a post
//! barrier mask, and a start-after/clean-after scheduling barrier pair used
//! by the dispatcher as a prefetch hint (`0` = none, otherwise physical
//! barrier id + 1).

use bitflags::bitflags;

use crate::mi::{Engine, TaskFamily};

bitflags! {
    /// Flag bits of a copy descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CopyFlags: u32 {
        /// Strided 2D transfer; `row_count`/strides are honored.
        const TWO_D = 1 << 0;
        /// Fill: `src_addr` carries the 64-bit pattern instead of an address.
        const FILL = 1 << 1;
        /// Route through the inline decompression unit.
        const DECODE = 1 << 2;
        /// Stamp the destination with the watermark tag on completion.
        const WATERMARK = 1 << 3;
    }
}

// ===============================================================================================
// Record layouts
// ===============================================================================================

/// DMA copy/fill descriptor. 80 bytes; segment bases are cache-line aligned.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct CopyTask {
    pub wait_mask: u64,
    pub post_mask: u64,
    /// Source device address, or the fill pattern when `FILL` is set.
    pub src_addr: u64,
    pub dst_addr: u64,
    /// Bytes per row (total bytes for a 1D transfer).
    pub length: u32,
    /// Number of rows; 1 for 1D.
    pub row_count: u32,
    pub src_stride: u32,
    pub dst_stride: u32,
    pub flags: u32,
    pub start_after: u32,
    pub clean_after: u32,
    pub reserved0: u32,
    pub reserved1: [u64; 2],
}

/// Timestamp write. The time unit can only target cache-line aligned
/// addresses; the encoder splits misaligned requests.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct TimestampTask {
    pub wait_mask: u64,
    pub post_mask: u64,
    pub dst_addr: u64,
    /// Low byte: counter select (see `TS_MODE_*`). High 24 bits: metric
    /// group mask for the perf-counter modes.
    pub mode: u32,
    pub start_after: u32,
    pub clean_after: u32,
    pub reserved0: u32,
}

pub const TS_MODE_CLOCK: u32 = 0;
pub const TS_MODE_METRIC_BEGIN: u32 = 1;
pub const TS_MODE_METRIC_END: u32 = 2;

/// Packs a timestamp `mode` word from a counter select and metric group mask.
#[must_use]
pub const fn ts_mode(select: u32, metric_group_mask: u32) -> u32 {
    (select & 0xFF) | (metric_group_mask << 8)
}

/// Per-layer compute configuration (weights, activations, output tensor).
/// Variants reference their invariant by buffer index.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct InvariantTask {
    pub wait_mask: u64,
    pub post_mask: u64,
    pub config_addr: u64,
    pub weights_addr: u64,
    pub activation_addr: u64,
    pub output_addr: u64,
    pub variant_count: u32,
    pub start_after: u32,
    pub clean_after: u32,
    pub reserved0: u32,
}

/// One workload slice of an invariant. Ordered after its invariant by the
/// `invariant_index` linkage; no barrier is needed for that edge.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct VariantTask {
    pub wait_mask: u64,
    pub post_mask: u64,
    pub invariant_index: u32,
    pub workload_offset: u32,
    pub workload_size: u32,
    pub output_offset: u32,
    pub cluster: u32,
    pub start_after: u32,
    pub clean_after: u32,
    pub reserved0: u32,
}

/// Kernel code range registration for the shave cores.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct KernelRangeTask {
    pub wait_mask: u64,
    pub post_mask: u64,
    pub text_addr: u64,
    pub data_addr: u64,
    pub text_size: u32,
    pub data_size: u32,
    pub start_after: u32,
    pub clean_after: u32,
}

/// One kernel invocation against a previously registered range.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct InvocationTask {
    pub wait_mask: u64,
    pub post_mask: u64,
    pub args_addr: u64,
    pub perf_packet_addr: u64,
    pub range_index: u32,
    pub invocation_index: u32,
    pub tile: u32,
    pub start_after: u32,
    pub clean_after: u32,
    pub reserved0: u32,
}

/// Fence memory op executed by the DMA block: wait until, or store, a
/// 64-bit value at `fence_addr`. Event signal/wait and device-side resets
/// all encode to this record.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct FenceTask {
    pub wait_mask: u64,
    pub post_mask: u64,
    pub fence_addr: u64,
    pub value: u64,
    pub start_after: u32,
    pub clean_after: u32,
}

// Wire sizes are part of the firmware contract.
const _: () = assert!(std::mem::size_of::<CopyTask>() == 80);
const _: () = assert!(std::mem::size_of::<TimestampTask>() == 40);
const _: () = assert!(std::mem::size_of::<InvariantTask>() == 64);
const _: () = assert!(std::mem::size_of::<VariantTask>() == 48);
const _: () = assert!(std::mem::size_of::<KernelRangeTask>() == 48);
const _: () = assert!(std::mem::size_of::<InvocationTask>() == 56);
const _: () = assert!(std::mem::size_of::<FenceTask>() == 40);
const _: () = assert!(std::mem::align_of::<CopyTask>() == 8);

// ===============================================================================================
// TaskRecord
// ===============================================================================================

/// One encoded, hardware-dispatchable task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRecord {
    Copy(CopyTask),
    Timestamp(TimestampTask),
    Invariant(InvariantTask),
    Variant(VariantTask),
    KernelRange(KernelRangeTask),
    KernelInvocation(InvocationTask),
    FenceWait(FenceTask),
    FenceSignal(FenceTask),
}

impl TaskRecord {
    #[must_use]
    pub const fn family(&self) -> TaskFamily {
        match self {
            Self::Copy(_) => TaskFamily::Copy,
            Self::Timestamp(_) => TaskFamily::Timestamp,
            Self::Invariant(_) => TaskFamily::Invariant,
            Self::Variant(_) => TaskFamily::Variant,
            Self::KernelRange(_) => TaskFamily::KernelRange,
            Self::KernelInvocation(_) => TaskFamily::KernelInvocation,
            Self::FenceWait(_) => TaskFamily::FenceWait,
            Self::FenceSignal(_) => TaskFamily::FenceSignal,
        }
    }

    #[must_use]
    pub const fn engine(&self) -> Engine {
        self.family().engine()
    }

    #[must_use]
    pub const fn wait_mask(&self) -> u64 {
        match self {
            Self::Copy(t) => t.wait_mask,
            Self::Timestamp(t) => t.wait_mask,
            Self::Invariant(t) => t.wait_mask,
            Self::Variant(t) => t.wait_mask,
            Self::KernelRange(t) => t.wait_mask,
            Self::KernelInvocation(t) => t.wait_mask,
            Self::FenceWait(t) | Self::FenceSignal(t) => t.wait_mask,
        }
    }

    #[must_use]
    pub const fn post_mask(&self) -> u64 {
        match self {
            Self::Copy(t) => t.post_mask,
            Self::Timestamp(t) => t.post_mask,
            Self::Invariant(t) => t.post_mask,
            Self::Variant(t) => t.post_mask,
            Self::KernelRange(t) => t.post_mask,
            Self::KernelInvocation(t) => t.post_mask,
            Self::FenceWait(t) | Self::FenceSignal(t) => t.post_mask,
        }
    }

    pub fn set_masks(&mut self, wait_mask: u64, post_mask: u64) {
        let (start_after, clean_after) = schedule_pair(wait_mask, post_mask);
        match self {
            Self::Copy(t) => {
                (t.wait_mask, t.post_mask) = (wait_mask, post_mask);
                (t.start_after, t.clean_after) = (start_after, clean_after);
            }
            Self::Timestamp(t) => {
                (t.wait_mask, t.post_mask) = (wait_mask, post_mask);
                (t.start_after, t.clean_after) = (start_after, clean_after);
            }
            Self::Invariant(t) => {
                (t.wait_mask, t.post_mask) = (wait_mask, post_mask);
                (t.start_after, t.clean_after) = (start_after, clean_after);
            }
            Self::Variant(t) => {
                (t.wait_mask, t.post_mask) = (wait_mask, post_mask);
                (t.start_after, t.clean_after) = (start_after, clean_after);
            }
            Self::KernelRange(t) => {
                (t.wait_mask, t.post_mask) = (wait_mask, post_mask);
                (t.start_after, t.clean_after) = (start_after, clean_after);
            }
            Self::KernelInvocation(t) => {
                (t.wait_mask, t.post_mask) = (wait_mask, post_mask);
                (t.start_after, t.clean_after) = (start_after, clean_after);
            }
            Self::FenceWait(t) | Self::FenceSignal(t) => {
                (t.wait_mask, t.post_mask) = (wait_mask, post_mask);
                (t.start_after, t.clean_after) = (start_after, clean_after);
            }
        }
    }

    /// Appends the record's wire bytes to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::Copy(t) => out.extend_from_slice(as_bytes(t)),
            Self::Timestamp(t) => out.extend_from_slice(as_bytes(t)),
            Self::Invariant(t) => out.extend_from_slice(as_bytes(t)),
            Self::Variant(t) => out.extend_from_slice(as_bytes(t)),
            Self::KernelRange(t) => out.extend_from_slice(as_bytes(t)),
            Self::KernelInvocation(t) => out.extend_from_slice(as_bytes(t)),
            Self::FenceWait(t) | Self::FenceSignal(t) => out.extend_from_slice(as_bytes(t)),
        }
    }
}

/// Scheduling barrier pair from the final masks: lowest waited id and lowest
/// posted id, biased by one so that 0 means "none".
const fn schedule_pair(wait_mask: u64, post_mask: u64) -> (u32, u32) {
    let start_after = if wait_mask == 0 {
        0
    } else {
        wait_mask.trailing_zeros() + 1
    };
    let clean_after = if post_mask == 0 {
        0
    } else {
        post_mask.trailing_zeros() + 1
    };
    (start_after, clean_after)
}

/// Views a `#[repr(C)]` record as its wire bytes.
///
/// # Safety (internal)
/// Every record type above is plain-old-data with explicit reserved fields
/// covering all padding, so reading the full object representation is sound.
fn as_bytes<T: Copy>(value: &T) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(std::ptr::from_ref(value).cast::<u8>(), std::mem::size_of::<T>())
    }
}

/// Reads one record of type `T` from `bytes` at `offset`.
///
/// Used by software execution and diagnostics when walking descriptor
/// buffers that came back from device memory.
///
/// # Panics
/// Panics if `bytes` is too short; descriptor buffers are always sized in
/// whole records.
#[must_use]
pub fn read_record<T: Copy>(bytes: &[u8], offset: usize) -> T {
    let size = std::mem::size_of::<T>();
    assert!(offset + size <= bytes.len(), "truncated descriptor buffer");
    unsafe { std::ptr::read_unaligned(bytes.as_ptr().add(offset).cast::<T>()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_descriptor_is_80_bytes() {
        // Frozen by the firmware contract; a failure here means the mapped
        // inference major version must be bumped.
        assert_eq!(std::mem::size_of::<CopyTask>(), 80);
    }

    #[test]
    fn schedule_pair_biases_by_one() {
        assert_eq!(schedule_pair(0, 0), (0, 0));
        assert_eq!(schedule_pair(0b100, 0b1), (3, 1));
    }

    #[test]
    fn record_roundtrips_through_bytes() {
        let task = CopyTask {
            wait_mask: 0b10,
            post_mask: 0b100,
            src_addr: 0x1000,
            dst_addr: 0x2000,
            length: 128,
            row_count: 1,
            flags: CopyFlags::DECODE.bits(),
            ..Default::default()
        };
        let mut buf = Vec::new();
        TaskRecord::Copy(task).encode_into(&mut buf);
        assert_eq!(buf.len(), 80);
        let back: CopyTask = read_record(&buf, 0);
        assert_eq!(back, task);
    }

    #[test]
    fn families_map_to_their_engines() {
        assert_eq!(TaskFamily::Copy.engine(), Engine::Copy);
        assert_eq!(TaskFamily::Timestamp.engine(), Engine::Compute);
        assert_eq!(TaskFamily::FenceSignal.engine(), Engine::Copy);
        assert_eq!(TaskFamily::KernelInvocation.engine(), Engine::Shave);
    }
}
