//! Per-engine task buffers.
//!
//! Encoded records are grouped by descriptor stream and stored as singly
//! linked lists of fixed-capacity segments, each independently fetchable by
//! the hardware dispatcher. The split halves of one logical operation may
//! land in different streams; their barrier masks travel with the records,
//! so relative order survives partitioning.

use crate::error::{NpuError, NpuResult};
use crate::mi::{
    Engine, NPU_CACHE_LINE, NPU_JOB_TASK_CEILING, TASK_FAMILY_COUNT, TaskFamily, TaskRecord,
};
use crate::utils::align_up;

/// On-device segment header. One cache line so the first record behind it
/// starts cache-line aligned.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct SegmentHeader {
    /// Device address of the next segment; 0 terminates the list.
    pub next: u64,
    /// Records stored in this segment.
    pub count: u32,
    pub reserved: [u32; 13],
}

const _: () = assert!(std::mem::size_of::<SegmentHeader>() == NPU_CACHE_LINE as usize);

pub const SEGMENT_HEADER_SIZE: usize = std::mem::size_of::<SegmentHeader>();

/// Byte stride of one segment of `family`, including its header, rounded to
/// the cache line as the hardware fetcher requires.
#[must_use]
pub fn segment_stride(family: TaskFamily) -> usize {
    let payload = family.segment_capacity() * family.record_size();
    align_up((SEGMENT_HEADER_SIZE + payload) as u64, NPU_CACHE_LINE) as usize
}

/// Total device bytes needed to hold `count` records of `family`.
#[must_use]
pub fn stream_bytes(family: TaskFamily, count: usize) -> usize {
    let segments = count.div_ceil(family.segment_capacity());
    segments * segment_stride(family)
}

/// Encoded tasks grouped by descriptor stream, ready for device placement.
#[derive(Debug, Default)]
pub struct PartitionedTasks {
    streams: [Vec<TaskRecord>; TASK_FAMILY_COUNT],
}

impl PartitionedTasks {
    /// Groups `tasks` by stream, preserving per-stream append order.
    ///
    /// # Errors
    /// `ResourceExhausted` when the per-job task ceiling is exceeded. The
    /// ceiling is reported, never silently truncated.
    pub fn partition(tasks: impl IntoIterator<Item = TaskRecord>) -> NpuResult<Self> {
        let mut out = Self::default();
        let mut total = 0usize;
        for task in tasks {
            total += 1;
            if total > NPU_JOB_TASK_CEILING {
                return Err(NpuError::ResourceExhausted("per-job task ceiling"));
            }
            out.streams[task.family() as usize].push(task);
        }
        Ok(out)
    }

    #[must_use]
    pub fn stream(&self, family: TaskFamily) -> &[TaskRecord] {
        &self.streams[family as usize]
    }

    #[must_use]
    pub fn count(&self, family: TaskFamily) -> usize {
        self.streams[family as usize].len()
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.streams.iter().map(Vec::len).sum()
    }

    /// Engines that have at least one task to dispatch.
    #[must_use]
    pub fn engine_mask(&self) -> u32 {
        let mut mask = 0;
        for family in TaskFamily::ALL {
            if !self.streams[family as usize].is_empty() {
                mask |= family.engine().bit();
            }
        }
        mask
    }

    #[must_use]
    pub fn engines(&self) -> Vec<Engine> {
        Engine::ALL
            .into_iter()
            .filter(|e| self.engine_mask() & e.bit() != 0)
            .collect()
    }

    /// Encodes one stream into its device image at `base_addr`: linked
    /// segments of hardware-fixed capacity, headers chaining by device
    /// address.
    #[must_use]
    pub fn encode_stream(&self, family: TaskFamily, base_addr: u64) -> Vec<u8> {
        let records = self.stream(family);
        let capacity = family.segment_capacity();
        let stride = segment_stride(family);
        let segments = records.len().div_ceil(capacity).max(1);

        let mut image = vec![0u8; segments * stride];
        for (seg_idx, chunk) in records.chunks(capacity).enumerate() {
            let seg_base = seg_idx * stride;
            let next = if (seg_idx + 1) * capacity < records.len() {
                base_addr + ((seg_idx + 1) * stride) as u64
            } else {
                0
            };
            let header = SegmentHeader {
                next,
                count: chunk.len() as u32,
                reserved: [0; 13],
            };
            image[seg_base..seg_base + 8].copy_from_slice(&header.next.to_le_bytes());
            image[seg_base + 8..seg_base + 12].copy_from_slice(&header.count.to_le_bytes());

            let mut payload = Vec::with_capacity(chunk.len() * family.record_size());
            for record in chunk {
                record.encode_into(&mut payload);
            }
            let start = seg_base + SEGMENT_HEADER_SIZE;
            image[start..start + payload.len()].copy_from_slice(&payload);
        }
        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mi::tasks::{CopyTask, read_record};

    fn copy_task(n: u64) -> TaskRecord {
        TaskRecord::Copy(CopyTask {
            src_addr: n,
            dst_addr: n + 1,
            length: 4,
            row_count: 1,
            ..Default::default()
        })
    }

    #[test]
    fn overflow_links_a_second_segment() {
        let parts = PartitionedTasks::partition((0u64..257).map(copy_task)).unwrap();
        assert_eq!(parts.count(TaskFamily::Copy), 257);

        let base = 0x10000;
        let image = parts.encode_stream(TaskFamily::Copy, base);
        let stride = segment_stride(TaskFamily::Copy);
        assert_eq!(image.len(), 2 * stride);

        // First header chains to the second segment; second terminates.
        let next0 = u64::from_le_bytes(image[0..8].try_into().unwrap());
        let count0 = u32::from_le_bytes(image[8..12].try_into().unwrap());
        assert_eq!(next0, base + stride as u64);
        assert_eq!(count0, 256);

        let next1 = u64::from_le_bytes(image[stride..stride + 8].try_into().unwrap());
        let count1 = u32::from_le_bytes(image[stride + 8..stride + 12].try_into().unwrap());
        assert_eq!(next1, 0);
        assert_eq!(count1, 1);

        // The 257th record is the first of segment 2, in append order.
        let rec: CopyTask = read_record(&image, stride + SEGMENT_HEADER_SIZE);
        assert_eq!(rec.src_addr, 256);
    }

    #[test]
    fn ceiling_is_reported_not_truncated() {
        let result =
            PartitionedTasks::partition((0..=NPU_JOB_TASK_CEILING as u64).map(copy_task));
        assert!(matches!(result, Err(NpuError::ResourceExhausted(_))));
    }

    #[test]
    fn engine_mask_covers_only_populated_engines() {
        let parts = PartitionedTasks::partition([copy_task(0)]).unwrap();
        assert_eq!(parts.engine_mask(), Engine::Copy.bit());
        assert_eq!(parts.engines(), vec![Engine::Copy]);
    }

    #[test]
    fn segment_bases_stay_cache_line_aligned() {
        for family in TaskFamily::ALL {
            assert_eq!(segment_stride(family) % NPU_CACHE_LINE as usize, 0);
        }
    }
}
