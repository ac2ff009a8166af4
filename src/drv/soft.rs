//! In-process software device.
//!
//! Services the same five control verbs as the kernel driver, backing
//! buffer objects with host memory and retiring submitted jobs with a
//! small interpreter that honors barrier order across the descriptor
//! streams. Used by the test suite and for bring-up on machines without
//! the device node.
//!
//! Jobs retire synchronously at submission: fence waits must be
//! satisfiable from memory as it is at submit time, and an unsatisfiable
//! wait or a barrier cycle retires the job as aborted — the same signal a
//! hung job produces on hardware.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tracing::{debug, trace};

use crate::drv::DeviceControl;
use crate::drv::ioctl::{
    BoCreateArgs, BoInfoArgs, NPU_BO_FLAG_HOST_VISIBLE, NPU_JOB_STATUS_ABORTED,
    NPU_JOB_STATUS_SUCCESS, NPU_PARAM_BARRIER_COUNT, NPU_PARAM_ENGINE_MASK,
    NPU_PARAM_EVENT_SLOT_COUNT, NPU_PARAM_FW_API_VERSION, NPU_PARAM_TIMESTAMP_FREQ,
    SubmitJobArgs, WaitJobArgs,
};
use crate::error::{NpuError, NpuResult};
use crate::mi::header::MI_MAGIC;
use crate::mi::tasks::{
    CopyFlags, CopyTask, FenceTask, InvariantTask, InvocationTask, KernelRangeTask, TimestampTask,
    VariantTask, read_record,
};
use crate::mi::{
    MappedInferenceHeader, NPU_BARRIER_COUNT, TASK_FAMILY_COUNT, TaskFamily, TaskRecord,
    mi_version, mi_version_major,
};
use crate::sched::partition::SEGMENT_HEADER_SIZE;
use crate::utils::align_up;

const SOFT_ADDR_BASE: u64 = 0x1000_0000;
const SOFT_GUARD: u64 = 4096;

struct SoftBo {
    size: u64,
    flags: u32,
    device_addr: u64,
    mem: Box<[u8]>,
}

#[derive(Default)]
struct SoftState {
    next_handle: u64,
    next_addr: u64,
    bos: HashMap<u64, SoftBo>,
    jobs: HashMap<u64, u32>,
    next_job: u64,
    ts_counter: u64,
}

/// Software implementation of the device control interface.
pub struct SoftDevice {
    fw_version: u32,
    state: Mutex<SoftState>,
}

impl std::fmt::Debug for SoftDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftDevice")
            .field("fw_version", &format_args!("{:#x}", self.fw_version))
            .finish_non_exhaustive()
    }
}

impl Default for SoftDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftDevice {
    #[must_use]
    pub fn new() -> Self {
        Self::with_fw_version(mi_version())
    }

    /// A device whose firmware reports `fw_version`, for exercising the
    /// version-mismatch path.
    #[must_use]
    pub fn with_fw_version(fw_version: u32) -> Self {
        Self {
            fw_version,
            state: Mutex::new(SoftState {
                next_addr: SOFT_ADDR_BASE,
                ..Default::default()
            }),
        }
    }
}

impl SoftState {
    fn resolve(&self, addr: u64, len: u64) -> Option<(u64, usize)> {
        for (&handle, bo) in &self.bos {
            let end = bo.device_addr + bo.size;
            if addr >= bo.device_addr && addr + len <= end {
                return Some((handle, (addr - bo.device_addr) as usize));
            }
        }
        None
    }

    fn read_bytes(&self, addr: u64, len: u64) -> Option<Vec<u8>> {
        let (handle, offset) = self.resolve(addr, len)?;
        let bo = &self.bos[&handle];
        Some(bo.mem[offset..offset + len as usize].to_vec())
    }

    fn write_bytes(&mut self, addr: u64, bytes: &[u8]) -> Option<()> {
        let (handle, offset) = self.resolve(addr, bytes.len() as u64)?;
        let bo = self.bos.get_mut(&handle)?;
        bo.mem[offset..offset + bytes.len()].copy_from_slice(bytes);
        Some(())
    }

    fn read_u64(&self, addr: u64) -> Option<u64> {
        let bytes = self.read_bytes(addr, 8)?;
        Some(u64::from_le_bytes(bytes.try_into().ok()?))
    }

    // =======================================================================================
    // Job interpretation
    // =======================================================================================

    fn decode_stream(&self, family: TaskFamily, base: u64, total: u32) -> Option<Vec<TaskRecord>> {
        let mut records = Vec::with_capacity(total as usize);
        let mut segment = base;
        let mut hops = 0usize;
        while segment != 0 && records.len() < total as usize {
            // A chain longer than the record total is corrupt (or cyclic).
            hops += 1;
            if hops > total as usize + 1 {
                return None;
            }
            let header = self.read_bytes(segment, SEGMENT_HEADER_SIZE as u64)?;
            let next = u64::from_le_bytes(header[0..8].try_into().ok()?);
            let count = u32::from_le_bytes(header[8..12].try_into().ok()?);
            if count as usize > family.segment_capacity() {
                return None;
            }
            let payload_len = (count as usize * family.record_size()) as u64;
            let payload = self.read_bytes(segment + SEGMENT_HEADER_SIZE as u64, payload_len)?;
            for i in 0..count as usize {
                let offset = i * family.record_size();
                records.push(decode_record(family, &payload, offset));
            }
            segment = next;
        }
        (records.len() == total as usize).then_some(records)
    }

    fn execute(&mut self, header_addr: u64) -> u32 {
        let Some(header_bytes) =
            self.read_bytes(header_addr, std::mem::size_of::<MappedInferenceHeader>() as u64)
        else {
            return NPU_JOB_STATUS_ABORTED;
        };
        let header: MappedInferenceHeader = read_record(&header_bytes, 0);

        let mut queues: [VecDeque<TaskRecord>; TASK_FAMILY_COUNT] = Default::default();
        for family in TaskFamily::ALL {
            let stream = header.streams[family as usize];
            if stream.count == 0 {
                continue;
            }
            match self.decode_stream(family, stream.address, stream.count) {
                Some(records) => queues[family as usize] = records.into(),
                None => return NPU_JOB_STATUS_ABORTED,
            }
        }

        // Hardware counters: one producer decrement per completed post.
        let mut remaining = [0u32; 64];
        for queue in &queues {
            for task in queue {
                let mut post = task.post_mask();
                while post != 0 {
                    let bit = post.trailing_zeros() as usize;
                    remaining[bit] += 1;
                    post &= post - 1;
                }
            }
        }

        loop {
            let mut progressed = false;
            for queue in &mut queues {
                while let Some(task) = queue.front().copied() {
                    if !self.barriers_clear(task.wait_mask(), &remaining) {
                        break;
                    }
                    if let TaskRecord::FenceWait(fence) = &task
                        && self.read_u64(fence.fence_addr) != Some(fence.value)
                    {
                        break;
                    }
                    if !self.run_task(&task) {
                        return NPU_JOB_STATUS_ABORTED;
                    }
                    let mut post = task.post_mask();
                    while post != 0 {
                        let bit = post.trailing_zeros() as usize;
                        remaining[bit] = remaining[bit].saturating_sub(1);
                        post &= post - 1;
                    }
                    queue.pop_front();
                    progressed = true;
                }
            }
            if queues.iter().all(VecDeque::is_empty) {
                return NPU_JOB_STATUS_SUCCESS;
            }
            if !progressed {
                // Barrier cycle or unsatisfiable fence wait.
                return NPU_JOB_STATUS_ABORTED;
            }
        }
    }

    fn barriers_clear(&self, wait_mask: u64, remaining: &[u32; 64]) -> bool {
        let mut mask = wait_mask;
        while mask != 0 {
            let bit = mask.trailing_zeros() as usize;
            if remaining[bit] != 0 {
                return false;
            }
            mask &= mask - 1;
        }
        true
    }

    fn run_task(&mut self, task: &TaskRecord) -> bool {
        trace!(?task, "soft-retiring task");
        match task {
            TaskRecord::Copy(copy) => self.run_copy(copy),
            TaskRecord::Timestamp(ts) => {
                self.ts_counter += 1;
                let stamp = self.ts_counter;
                self.write_bytes(ts.dst_addr, &stamp.to_le_bytes()).is_some()
            }
            TaskRecord::FenceSignal(fence) => self
                .write_bytes(fence.fence_addr, &fence.value.to_le_bytes())
                .is_some(),
            // Satisfiability was checked before dispatch.
            TaskRecord::FenceWait(_) => true,
            // Compute and kernel work has no observable host side effect
            // here; barrier accounting is the contract under test.
            TaskRecord::Invariant(_)
            | TaskRecord::Variant(_)
            | TaskRecord::KernelRange(_)
            | TaskRecord::KernelInvocation(_) => true,
        }
    }

    fn run_copy(&mut self, copy: &CopyTask) -> bool {
        let flags = CopyFlags::from_bits_truncate(copy.flags);
        let rows = if flags.contains(CopyFlags::TWO_D) {
            copy.row_count.max(1)
        } else {
            1
        };
        for row in 0..u64::from(rows) {
            let dst = copy.dst_addr + row * u64::from(copy.dst_stride);
            let row_bytes = if flags.contains(CopyFlags::FILL) {
                copy.src_addr
                    .to_le_bytes()
                    .iter()
                    .copied()
                    .cycle()
                    .take(copy.length as usize)
                    .collect()
            } else {
                let src = copy.src_addr + row * u64::from(copy.src_stride);
                match self.read_bytes(src, u64::from(copy.length)) {
                    Some(bytes) => bytes,
                    None => return false,
                }
            };
            if self.write_bytes(dst, &row_bytes).is_none() {
                return false;
            }
        }
        true
    }
}

fn decode_record(family: TaskFamily, bytes: &[u8], offset: usize) -> TaskRecord {
    match family {
        TaskFamily::Copy => TaskRecord::Copy(read_record::<CopyTask>(bytes, offset)),
        TaskFamily::Timestamp => TaskRecord::Timestamp(read_record::<TimestampTask>(bytes, offset)),
        TaskFamily::Invariant => TaskRecord::Invariant(read_record::<InvariantTask>(bytes, offset)),
        TaskFamily::Variant => TaskRecord::Variant(read_record::<VariantTask>(bytes, offset)),
        TaskFamily::KernelRange => {
            TaskRecord::KernelRange(read_record::<KernelRangeTask>(bytes, offset))
        }
        TaskFamily::KernelInvocation => {
            TaskRecord::KernelInvocation(read_record::<InvocationTask>(bytes, offset))
        }
        TaskFamily::FenceWait => TaskRecord::FenceWait(read_record::<FenceTask>(bytes, offset)),
        TaskFamily::FenceSignal => TaskRecord::FenceSignal(read_record::<FenceTask>(bytes, offset)),
    }
}

impl DeviceControl for SoftDevice {
    fn bo_create(&self, args: &mut BoCreateArgs) -> NpuResult<()> {
        if args.size == 0 {
            return Err(NpuError::from_errno(libc::EINVAL));
        }
        let mut state = self.state.lock().expect("soft state poisoned");
        let handle = state.next_handle + 1;
        state.next_handle = handle;

        let device_addr = align_up(state.next_addr, 4096);
        state.next_addr = device_addr + align_up(args.size, 4096) + SOFT_GUARD;

        state.bos.insert(
            handle,
            SoftBo {
                size: args.size,
                flags: args.flags,
                device_addr,
                mem: vec![0u8; args.size as usize].into_boxed_slice(),
            },
        );
        args.handle = handle;
        args.device_addr = device_addr;
        args.mmap_offset = handle << 12;
        Ok(())
    }

    fn bo_info(&self, args: &mut BoInfoArgs) -> NpuResult<()> {
        let state = self.state.lock().expect("soft state poisoned");
        let bo = state
            .bos
            .get(&args.handle)
            .ok_or_else(|| NpuError::from_errno(libc::EINVAL))?;
        args.size = bo.size;
        args.device_addr = bo.device_addr;
        args.mmap_offset = args.handle << 12;
        args.flags = bo.flags;
        Ok(())
    }

    fn bo_free(&self, handle: u64) -> NpuResult<()> {
        let mut state = self.state.lock().expect("soft state poisoned");
        state
            .bos
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| NpuError::from_errno(libc::EINVAL))
    }

    fn bo_map(&self, handle: u64, size: usize, _mmap_offset: u64) -> NpuResult<*mut u8> {
        let mut state = self.state.lock().expect("soft state poisoned");
        let bo = state
            .bos
            .get_mut(&handle)
            .ok_or_else(|| NpuError::from_errno(libc::EINVAL))?;
        if bo.flags & NPU_BO_FLAG_HOST_VISIBLE == 0 || size as u64 > bo.size {
            return Err(NpuError::from_errno(libc::EINVAL));
        }
        // The boxed slice's heap storage is stable for the buffer's
        // lifetime even as the map rehashes.
        Ok(bo.mem.as_mut_ptr())
    }

    fn bo_unmap(&self, _ptr: *mut u8, _size: usize) -> NpuResult<()> {
        Ok(())
    }

    fn submit_job(&self, args: &mut SubmitJobArgs) -> NpuResult<()> {
        let mut state = self.state.lock().expect("soft state poisoned");

        let header_bytes = state
            .read_bytes(
                args.header_addr,
                std::mem::size_of::<MappedInferenceHeader>() as u64,
            )
            .ok_or_else(|| NpuError::from_errno(libc::EINVAL))?;
        let header: MappedInferenceHeader = read_record(&header_bytes, 0);
        if header.magic != MI_MAGIC {
            return Err(NpuError::from_errno(libc::EINVAL));
        }
        if mi_version_major(header.api_version) != mi_version_major(self.fw_version) {
            return Err(NpuError::from_errno(libc::EPROTO));
        }

        let status = if args.task_count == 0 {
            NPU_JOB_STATUS_SUCCESS
        } else {
            state.execute(args.header_addr)
        };

        let job_id = state.next_job + 1;
        state.next_job = job_id;
        state.jobs.insert(job_id, status);
        args.job_id = job_id;
        debug!(job_id, status, tasks = args.task_count, "soft job retired");
        Ok(())
    }

    fn wait_job(&self, args: &mut WaitJobArgs) -> NpuResult<()> {
        let state = self.state.lock().expect("soft state poisoned");
        let status = state
            .jobs
            .get(&args.job_id)
            .ok_or_else(|| NpuError::from_errno(libc::EINVAL))?;
        args.status = *status;
        Ok(())
    }

    fn query_param(&self, param: u32, _index: u32) -> NpuResult<u64> {
        match param {
            NPU_PARAM_FW_API_VERSION => Ok(u64::from(self.fw_version)),
            NPU_PARAM_BARRIER_COUNT => Ok(NPU_BARRIER_COUNT as u64),
            NPU_PARAM_ENGINE_MASK => Ok(0b111),
            NPU_PARAM_TIMESTAMP_FREQ => Ok(1_000_000_000),
            NPU_PARAM_EVENT_SLOT_COUNT => Ok(64),
            _ => Err(NpuError::from_errno(libc::EINVAL)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bo_addresses_do_not_overlap() {
        let dev = SoftDevice::new();
        let mut a = BoCreateArgs {
            size: 4096,
            flags: NPU_BO_FLAG_HOST_VISIBLE,
            ..Default::default()
        };
        let mut b = a;
        dev.bo_create(&mut a).unwrap();
        dev.bo_create(&mut b).unwrap();
        assert_ne!(a.handle, b.handle);
        assert!(b.device_addr >= a.device_addr + 4096);
    }

    #[test]
    fn device_local_bo_cannot_be_mapped() {
        let dev = SoftDevice::new();
        let mut args = BoCreateArgs {
            size: 4096,
            flags: 0,
            ..Default::default()
        };
        dev.bo_create(&mut args).unwrap();
        assert!(matches!(
            dev.bo_map(args.handle, 4096, args.mmap_offset),
            Err(NpuError::InvalidArgument(_))
        ));
    }

    #[test]
    fn unknown_job_wait_is_invalid() {
        let dev = SoftDevice::new();
        let mut args = WaitJobArgs {
            job_id: 42,
            ..Default::default()
        };
        assert!(matches!(
            dev.wait_job(&mut args),
            Err(NpuError::InvalidArgument(_))
        ));
    }
}
