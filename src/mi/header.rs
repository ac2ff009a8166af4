//! The mapped-inference header: the versioned record firmware reads first.

use crate::mi::{TASK_FAMILY_COUNT, mi_version};

/// `'NPMI'` little-endian.
pub const MI_MAGIC: u32 = 0x494D_504E;

/// Reference to one descriptor stream: device address of the first segment
/// plus the total record count across all linked segments. Address 0 with
/// count 0 marks a stream the hardware must skip.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct EngineRef {
    pub address: u64,
    pub count: u32,
    pub reserved: u32,
}

/// Runtime-configuration block consumed by the execution runtime.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct RuntimeConfig {
    /// Entry point of the on-device execution runtime; 0 selects the
    /// firmware-resident default.
    pub runtime_entry: u64,
    /// Performance-counter mode for the whole job.
    pub perf_counter_mode: u32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct MappedInferenceHeader {
    pub magic: u32,
    /// `major << 16 | minor`. Firmware rejects a major mismatch.
    pub api_version: u32,
    /// Total task records in this job, all streams summed.
    pub task_total: u32,
    pub reserved0: u32,
    /// Indexed by `TaskFamily as usize`.
    pub streams: [EngineRef; TASK_FAMILY_COUNT],
    pub runtime: RuntimeConfig,
}

const _: () = assert!(std::mem::size_of::<EngineRef>() == 16);
const _: () = assert!(std::mem::size_of::<RuntimeConfig>() == 16);
const _: () = assert!(std::mem::size_of::<MappedInferenceHeader>() == 160);

impl MappedInferenceHeader {
    #[must_use]
    pub fn new(task_total: u32, runtime: RuntimeConfig) -> Self {
        Self {
            magic: MI_MAGIC,
            api_version: mi_version(),
            task_total,
            reserved0: 0,
            streams: [EngineRef::default(); TASK_FAMILY_COUNT],
            runtime,
        }
    }

    /// Wire bytes of the header.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        // All fields are plain integers with explicit reserved padding.
        unsafe {
            std::slice::from_raw_parts(
                std::ptr::from_ref(self).cast::<u8>(),
                std::mem::size_of::<Self>(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mi::{NPU_MI_VERSION_MAJOR, mi_version_major};

    #[test]
    fn header_is_160_bytes() {
        assert_eq!(std::mem::size_of::<MappedInferenceHeader>(), 160);
    }

    #[test]
    fn new_header_carries_driver_version() {
        let hdr = MappedInferenceHeader::new(0, RuntimeConfig::default());
        assert_eq!(hdr.magic, MI_MAGIC);
        assert_eq!(mi_version_major(hdr.api_version), NPU_MI_VERSION_MAJOR);
    }
}
