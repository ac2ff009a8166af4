//! The command encoder.
//!
//! A command list accumulates logical operations, resolves each into one or
//! more task records, and expresses every cross-stream dependency as a
//! barrier edge. Barriers are virtual while the list is open; `close()`
//! maps them onto physical ids (lowest free first, so identical append
//! sequences against a quiesced pool re-encode to identical bytes),
//! computes the final producer/consumer counts, and partitions the records
//! into per-engine buffers.
//!
//! Two flavors share this one encoding path: a deferred list is closed and
//! submitted explicitly through a queue; an immediate list self-submits
//! after every logical operation.

use std::sync::{Arc, Weak};

use tracing::debug;

use crate::context::DeviceContext;
use crate::error::{NpuError, NpuResult};
use crate::memory::Buffer;
use crate::mi::tasks::{
    CopyFlags, CopyTask, FenceTask, TS_MODE_CLOCK, TS_MODE_METRIC_BEGIN, TS_MODE_METRIC_END,
    TimestampTask, ts_mode,
};
use crate::mi::{NPU_CACHE_LINE, TaskRecord};
use crate::sched::barrier::BarrierId;
use crate::sched::event::{EVENT_SIGNALED, EVENT_UNSIGNALED, Event, EventSlotRef};
use crate::sched::job::JobRecord;
use crate::sched::manifest::TaskManifest;
use crate::sched::partition::PartitionedTasks;
use crate::sched::queue::CommandQueue;

/// Encoding trigger of a command list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFlavor {
    /// Explicit `close()` + queue submission by the caller.
    Deferred,
    /// Self-submits after each logical operation.
    Immediate,
}

/// A strided 2D copy description.
#[derive(Debug, Clone, Copy)]
pub struct Copy2d {
    pub src: u64,
    pub dst: u64,
    pub row_bytes: u32,
    pub rows: u32,
    pub src_stride: u32,
    pub dst_stride: u32,
    pub flags: CopyFlags,
}

/// One not-yet-closed task: payload plus virtual barrier masks.
#[derive(Debug, Clone, Copy)]
struct Pending {
    record: TaskRecord,
    wait_virt: u64,
    post_virt: u64,
}

/// Scratch slots for split operations (one cache line each), carved from
/// per-list pages. Pages are retained across `reset()` so a re-encoded
/// list reproduces the same scratch addresses.
#[derive(Debug, Default)]
struct ScratchArena {
    pages: Vec<Arc<Buffer>>,
    next_slot: usize,
}

const SCRATCH_PAGE_BYTES: u64 = 4096;
const SCRATCH_SLOTS_PER_PAGE: usize = (SCRATCH_PAGE_BYTES / NPU_CACHE_LINE) as usize;

impl ScratchArena {
    fn alloc_slot(&mut self, ctx: &DeviceContext) -> NpuResult<u64> {
        let page_idx = self.next_slot / SCRATCH_SLOTS_PER_PAGE;
        if page_idx == self.pages.len() {
            let bo = ctx.registry().lock().expect("registry poisoned").alloc(
                SCRATCH_PAGE_BYTES,
                crate::memory::Residency::DeviceLocal,
                crate::memory::CachePolicy::default(),
            )?;
            self.pages.push(bo);
        }
        let slot_in_page = self.next_slot % SCRATCH_SLOTS_PER_PAGE;
        let addr = self.pages[page_idx].device_addr() + (slot_in_page as u64) * NPU_CACHE_LINE;
        self.next_slot += 1;
        Ok(addr)
    }

    fn reset(&mut self) {
        self.next_slot = 0;
    }
}

/// Artifacts of a successful `close()`.
#[derive(Debug)]
pub(crate) struct ClosedList {
    pub(crate) parts: PartitionedTasks,
    pub(crate) barriers: Vec<BarrierId>,
    pub(crate) submitted: bool,
}

/// The command list: the accumulator that turns logical operations into
/// hardware task records.
///
/// Not safe for concurrent encoding from multiple threads; build separate
/// lists per thread instead. The shared barrier/event pools behind the
/// device context are internally synchronized.
pub struct CommandList {
    ctx: Arc<DeviceContext>,
    flavor: ListFlavor,
    immediate_queue: Option<Arc<CommandQueue>>,

    open: bool,
    tasks: Vec<Pending>,
    virt_count: u32,
    /// Virtual mask every newly appended task must wait on.
    pending_wait: u64,
    /// Index of the first task after the last synchronization point.
    open_start: usize,

    scratch: ScratchArena,
    pub(crate) event_refs: Vec<EventSlotRef>,
    buffer_refs: Vec<(u64, u64)>,

    pub(crate) closed: Option<ClosedList>,
    pub(crate) jobs: Vec<Weak<JobRecord>>,
}

impl std::fmt::Debug for CommandList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandList")
            .field("flavor", &self.flavor)
            .field("tasks", &self.tasks.len())
            .field("open", &self.open)
            .finish_non_exhaustive()
    }
}

impl CommandList {
    /// Creates a deferred command list.
    #[must_use]
    pub fn new(ctx: Arc<DeviceContext>) -> Self {
        Self::with_flavor(ctx, ListFlavor::Deferred, None)
    }

    /// Creates an immediate command list that self-submits each logical
    /// operation through `queue`.
    #[must_use]
    pub fn new_immediate(ctx: Arc<DeviceContext>, queue: Arc<CommandQueue>) -> Self {
        Self::with_flavor(ctx, ListFlavor::Immediate, Some(queue))
    }

    fn with_flavor(
        ctx: Arc<DeviceContext>,
        flavor: ListFlavor,
        immediate_queue: Option<Arc<CommandQueue>>,
    ) -> Self {
        Self {
            ctx,
            flavor,
            immediate_queue,
            open: true,
            tasks: Vec::new(),
            virt_count: 0,
            pending_wait: 0,
            open_start: 0,
            scratch: ScratchArena::default(),
            event_refs: Vec::new(),
            buffer_refs: Vec::new(),
            closed: None,
            jobs: Vec::new(),
        }
    }

    #[must_use]
    pub fn flavor(&self) -> ListFlavor {
        self.flavor
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    /// Task records accumulated so far (encoded count, not logical ops).
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Partitioned streams of a closed list.
    #[must_use]
    pub fn partitions(&self) -> Option<&PartitionedTasks> {
        self.closed.as_ref().map(|c| &c.parts)
    }

    // ===========================================================================================
    // Validation helpers
    // ===========================================================================================

    fn ensure_open(&self) -> NpuResult<()> {
        if !self.open || self.closed.is_some() {
            return Err(NpuError::InvalidState(
                "command list is not available for encoding",
            ));
        }
        Ok(())
    }

    /// Validates a device range against the registry's range index and
    /// records it for re-validation at close time.
    fn check_range(&mut self, addr: u64, len: u64) -> NpuResult<()> {
        if addr == 0 {
            return Err(NpuError::InvalidArgument("null device address"));
        }
        if len == 0 {
            return Err(NpuError::InvalidArgument("zero-length range"));
        }
        if !self
            .ctx
            .registry()
            .lock()
            .expect("registry poisoned")
            .covers(addr, len)
        {
            return Err(NpuError::InvalidArgument(
                "range is not backed by a live buffer object",
            ));
        }
        self.buffer_refs.push((addr, len));
        Ok(())
    }

    fn check_event(&self, event: &Event) -> NpuResult<()> {
        if event.context_id() != self.ctx.id() {
            return Err(NpuError::InvalidArgument(
                "event belongs to another device context",
            ));
        }
        Ok(())
    }

    // ===========================================================================================
    // Sync-point machinery
    // ===========================================================================================

    fn new_virt(&mut self) -> NpuResult<u64> {
        if self.virt_count == 64 {
            return Err(NpuError::ResourceExhausted("synchronization points"));
        }
        let bit = 1u64 << self.virt_count;
        self.virt_count += 1;
        Ok(bit)
    }

    /// Gates everything appended after this point on everything appended
    /// since the previous point. A point with no open producers collapses
    /// to nothing — the previous gate still covers it.
    fn sync_point(&mut self) -> NpuResult<()> {
        if self.tasks.len() == self.open_start {
            return Ok(());
        }
        let bit = self.new_virt()?;
        for pending in &mut self.tasks[self.open_start..] {
            pending.post_virt |= bit;
        }
        self.pending_wait = bit;
        self.open_start = self.tasks.len();
        Ok(())
    }

    fn push(&mut self, record: TaskRecord, extra_wait: u64, post: u64) {
        self.tasks.push(Pending {
            record,
            wait_virt: self.pending_wait | extra_wait,
            post_virt: post,
        });
    }

    /// Push with fully explicit masks (manifest import controls its roots).
    fn push_raw(&mut self, record: TaskRecord, wait_virt: u64, post_virt: u64) {
        self.tasks.push(Pending {
            record,
            wait_virt,
            post_virt,
        });
    }

    // ===========================================================================================
    // Logical operations
    // ===========================================================================================

    /// 1D copy of `len` bytes.
    pub fn append_copy(&mut self, src: u64, dst: u64, len: u64) -> NpuResult<()> {
        self.ensure_open()?;
        if len > u64::from(u32::MAX) {
            return Err(NpuError::InvalidArgument("copy length"));
        }
        self.check_range(src, len)?;
        self.check_range(dst, len)?;
        self.push(
            TaskRecord::Copy(CopyTask {
                src_addr: src,
                dst_addr: dst,
                length: len as u32,
                row_count: 1,
                ..Default::default()
            }),
            0,
            0,
        );
        self.maybe_flush()
    }

    /// Strided 2D copy.
    pub fn append_copy_2d(&mut self, desc: &Copy2d) -> NpuResult<()> {
        self.ensure_open()?;
        if desc.rows == 0 || desc.row_bytes == 0 {
            return Err(NpuError::InvalidArgument("2D copy extent"));
        }
        if desc.src_stride < desc.row_bytes || desc.dst_stride < desc.row_bytes {
            return Err(NpuError::InvalidArgument("2D copy stride"));
        }
        let src_span =
            u64::from(desc.rows - 1) * u64::from(desc.src_stride) + u64::from(desc.row_bytes);
        let dst_span =
            u64::from(desc.rows - 1) * u64::from(desc.dst_stride) + u64::from(desc.row_bytes);
        self.check_range(desc.src, src_span)?;
        self.check_range(desc.dst, dst_span)?;
        self.push(
            TaskRecord::Copy(CopyTask {
                src_addr: desc.src,
                dst_addr: desc.dst,
                length: desc.row_bytes,
                row_count: desc.rows,
                src_stride: desc.src_stride,
                dst_stride: desc.dst_stride,
                flags: (desc.flags | CopyFlags::TWO_D).bits(),
                ..Default::default()
            }),
            0,
            0,
        );
        self.maybe_flush()
    }

    /// Fills `len` bytes at `dst` with a repeating 64-bit pattern.
    pub fn append_fill(&mut self, dst: u64, len: u64, pattern: u64) -> NpuResult<()> {
        self.ensure_open()?;
        if len > u64::from(u32::MAX) || len % 8 != 0 {
            return Err(NpuError::InvalidArgument("fill length"));
        }
        self.check_range(dst, len)?;
        self.push(
            TaskRecord::Copy(CopyTask {
                src_addr: pattern,
                dst_addr: dst,
                length: len as u32,
                row_count: 1,
                flags: CopyFlags::FILL.bits(),
                ..Default::default()
            }),
            0,
            0,
        );
        self.maybe_flush()
    }

    /// Writes the device timestamp counter to `dst` (8 bytes).
    ///
    /// The time unit only targets cache-line aligned addresses. A
    /// misaligned destination is split into an aligned write to an
    /// internal scratch slot plus a copy, the copy gated on the write's
    /// barrier, so the pair stays ordered across its two engines.
    pub fn append_timestamp(&mut self, dst: u64) -> NpuResult<()> {
        self.ensure_open()?;
        self.check_range(dst, 8)?;

        if dst % NPU_CACHE_LINE == 0 {
            self.push(
                TaskRecord::Timestamp(TimestampTask {
                    dst_addr: dst,
                    mode: ts_mode(TS_MODE_CLOCK, 0),
                    ..Default::default()
                }),
                0,
                0,
            );
        } else {
            let scratch = self.scratch.alloc_slot(&self.ctx)?;
            let link = self.new_virt()?;
            self.push(
                TaskRecord::Timestamp(TimestampTask {
                    dst_addr: scratch,
                    mode: ts_mode(TS_MODE_CLOCK, 0),
                    ..Default::default()
                }),
                0,
                link,
            );
            self.push(
                TaskRecord::Copy(CopyTask {
                    src_addr: scratch,
                    dst_addr: dst,
                    length: 8,
                    row_count: 1,
                    ..Default::default()
                }),
                link,
                0,
            );
        }
        self.maybe_flush()
    }

    /// Explicit synchronization point: everything appended later executes
    /// after everything appended earlier, across all engines.
    pub fn append_barrier(&mut self) -> NpuResult<()> {
        self.ensure_open()?;
        self.sync_point()?;
        self.maybe_flush()
    }

    /// Signals `event` from the device once all prior work completes.
    pub fn append_signal_event(&mut self, event: &Event) -> NpuResult<()> {
        self.ensure_open()?;
        self.check_event(event)?;
        self.sync_point()?;
        self.push(
            TaskRecord::FenceSignal(FenceTask {
                fence_addr: event.device_addr(),
                value: EVENT_SIGNALED,
                ..Default::default()
            }),
            0,
            0,
        );
        self.event_refs.push(event.slot_ref());
        self.maybe_flush()
    }

    /// Blocks subsequently appended work until every event is signaled.
    pub fn append_wait_events(&mut self, events: &[&Event]) -> NpuResult<()> {
        self.ensure_open()?;
        if events.is_empty() {
            return Err(NpuError::InvalidArgument("empty event wait list"));
        }
        for event in events {
            self.check_event(event)?;
        }
        for event in events {
            self.push(
                TaskRecord::FenceWait(FenceTask {
                    fence_addr: event.device_addr(),
                    value: EVENT_SIGNALED,
                    ..Default::default()
                }),
                0,
                0,
            );
            self.event_refs.push(event.slot_ref());
        }
        self.sync_point()?;
        self.maybe_flush()
    }

    /// Device-side event reset, ordered after all prior work.
    pub fn append_reset_event(&mut self, event: &Event) -> NpuResult<()> {
        self.ensure_open()?;
        self.check_event(event)?;
        self.sync_point()?;
        self.push(
            TaskRecord::FenceSignal(FenceTask {
                fence_addr: event.device_addr(),
                value: EVENT_UNSIGNALED,
                ..Default::default()
            }),
            0,
            0,
        );
        self.event_refs.push(event.slot_ref());
        self.maybe_flush()
    }

    /// Opens a metric query: snapshots the counters selected by the
    /// event's metric group mask into `dst`.
    pub fn append_metric_query_begin(&mut self, event: &Event, dst: u64) -> NpuResult<()> {
        self.append_metric_query(event, dst, TS_MODE_METRIC_BEGIN)
    }

    /// Closes a metric query; ordered after all prior work so the payload
    /// reflects it.
    pub fn append_metric_query_end(&mut self, event: &Event, dst: u64) -> NpuResult<()> {
        self.ensure_open()?;
        self.sync_point()?;
        self.append_metric_query(event, dst, TS_MODE_METRIC_END)
    }

    fn append_metric_query(&mut self, event: &Event, dst: u64, select: u32) -> NpuResult<()> {
        self.ensure_open()?;
        self.check_event(event)?;
        let Some(metrics) = event.metrics() else {
            return Err(NpuError::InvalidArgument("event has no metric parameters"));
        };
        if dst % NPU_CACHE_LINE != 0 {
            return Err(NpuError::InvalidArgument("metric payload alignment"));
        }
        self.check_range(dst, u64::from(metrics.payload_size.max(8)))?;
        self.push(
            TaskRecord::Timestamp(TimestampTask {
                dst_addr: dst,
                mode: ts_mode(select, metrics.group_mask),
                ..Default::default()
            }),
            0,
            0,
        );
        self.event_refs.push(event.slot_ref());
        self.maybe_flush()
    }

    /// Appends a graph's one-time initialization tasks.
    pub fn append_graph_init(&mut self, manifest: &TaskManifest) -> NpuResult<()> {
        self.append_manifest(manifest, true)
    }

    /// Appends a graph's per-inference execution tasks.
    pub fn append_graph_execute(&mut self, manifest: &TaskManifest) -> NpuResult<()> {
        self.append_manifest(manifest, false)
    }

    fn append_manifest(&mut self, manifest: &TaskManifest, init: bool) -> NpuResult<()> {
        self.ensure_open()?;
        manifest.validate()?;
        for &(addr, len) in &manifest.buffers {
            self.check_range(addr, len)?;
        }

        let tasks = if init {
            &manifest.init_tasks
        } else {
            &manifest.exec_tasks
        };

        // Manifest-local barrier indices map onto fresh virtual barriers;
        // the allocator hands out the physical ids at close like for any
        // internally generated dependency.
        let mut map: Vec<Option<u64>> = vec![None; manifest.barrier_count as usize];
        let incoming = self.pending_wait;
        for task in tasks {
            let wait = self.map_manifest_mask(task.wait_barriers, &mut map)?;
            let post = self.map_manifest_mask(task.post_barriers, &mut map)?;
            // Roots of the graph inherit the list's current gate.
            let wait = if wait == 0 { incoming } else { wait };
            self.push_raw(task.record, wait, post);
        }
        self.maybe_flush()
    }

    fn map_manifest_mask(&mut self, local: u64, map: &mut [Option<u64>]) -> NpuResult<u64> {
        let mut out = 0u64;
        for i in 0..64 {
            if local >> i & 1 == 1 {
                let slot = &mut map[i];
                let bit = match *slot {
                    Some(bit) => bit,
                    None => {
                        let bit = self.new_virt()?;
                        *slot = Some(bit);
                        bit
                    }
                };
                out |= bit;
            }
        }
        Ok(out)
    }

    // ===========================================================================================
    // Close / reset
    // ===========================================================================================

    /// Closes the list: re-validates buffer references, fixes barrier
    /// producer/consumer counts, assigns physical barriers, and partitions
    /// the records into per-engine buffers. Idempotent; appending
    /// afterwards fails until `reset()`.
    ///
    /// # Errors
    /// `InvalidState` for an immediate list; `InvalidArgument` if a
    /// referenced buffer was freed since append; `ResourceExhausted` when
    /// the barrier pool or task ceiling cannot cover the list.
    pub fn close(&mut self) -> NpuResult<()> {
        if self.flavor == ListFlavor::Immediate {
            return Err(NpuError::InvalidState(
                "immediate command list cannot be closed",
            ));
        }
        self.close_internal()
    }

    fn close_internal(&mut self) -> NpuResult<()> {
        if self.closed.is_some() {
            return Ok(());
        }

        // Every referenced range must still be live; freed buffers turn
        // into a synchronous error here, never a device fault later.
        {
            let registry = self.ctx.registry().lock().expect("registry poisoned");
            for &(addr, len) in &self.buffer_refs {
                if !registry.covers(addr, len) {
                    return Err(NpuError::InvalidArgument(
                        "command list references a freed buffer",
                    ));
                }
            }
        }

        // Producer/consumer counts are computed once, here, so the hardware
        // counters start at the exact expected value.
        let n = self.virt_count as usize;
        let mut producers = vec![0u32; n];
        let mut consumers = vec![0u32; n];
        for pending in &self.tasks {
            for i in 0..n {
                let bit = 1u64 << i;
                if pending.post_virt & bit != 0 {
                    producers[i] += 1;
                }
                if pending.wait_virt & bit != 0 {
                    consumers[i] += 1;
                }
            }
        }

        let mut assigned: Vec<BarrierId> = Vec::new();
        let mut phys: Vec<Option<BarrierId>> = vec![None; n];
        {
            let mut pool = self.ctx.barriers().lock().expect("barrier pool poisoned");
            for i in 0..n {
                if producers[i] == 0 && consumers[i] == 0 {
                    continue;
                }
                match pool.assign(producers[i], consumers[i]) {
                    Ok(id) => {
                        phys[i] = Some(id);
                        assigned.push(id);
                    }
                    Err(e) => {
                        for id in assigned {
                            let _ = pool.release(id);
                        }
                        return Err(e);
                    }
                }
            }
        }

        let map_mask = |virt: u64| -> u64 {
            let mut mask = 0u64;
            for (i, id) in phys.iter().enumerate() {
                if virt >> i & 1 == 1
                    && let Some(id) = id
                {
                    mask |= id.bit();
                }
            }
            mask
        };

        let records: Vec<TaskRecord> = self
            .tasks
            .iter()
            .map(|p| {
                let mut record = p.record;
                record.set_masks(map_mask(p.wait_virt), map_mask(p.post_virt));
                record
            })
            .collect();

        let parts = match PartitionedTasks::partition(records) {
            Ok(parts) => parts,
            Err(e) => {
                let mut pool = self.ctx.barriers().lock().expect("barrier pool poisoned");
                for id in assigned {
                    let _ = pool.release(id);
                }
                return Err(e);
            }
        };

        debug!(
            tasks = parts.total(),
            barriers = assigned.len(),
            "command list closed"
        );
        self.closed = Some(ClosedList {
            parts,
            barriers: assigned,
            submitted: false,
        });
        self.open = false;
        Ok(())
    }

    /// True while a job built from this list has not retired.
    #[must_use]
    pub fn has_inflight_job(&self) -> bool {
        self.jobs
            .iter()
            .any(|weak| weak.upgrade().is_some_and(|job| !job.is_retired()))
    }

    /// Discards all accumulated task records and recycles the scratch
    /// slots, returning the list to the open state.
    ///
    /// # Errors
    /// `InvalidState` while a job built from this list is still in flight.
    pub fn reset(&mut self) -> NpuResult<()> {
        if self.has_inflight_job() {
            return Err(NpuError::InvalidState(
                "command list has a job still in flight",
            ));
        }
        if let Some(closed) = self.closed.take() {
            // Closed but never submitted: the physical barriers are still
            // ours to give back.
            let mut pool = self.ctx.barriers().lock().expect("barrier pool poisoned");
            for id in closed.barriers {
                let _ = pool.release(id);
            }
        }
        self.tasks.clear();
        self.virt_count = 0;
        self.pending_wait = 0;
        self.open_start = 0;
        self.scratch.reset();
        self.event_refs.clear();
        self.buffer_refs.clear();
        self.jobs.clear();
        self.open = true;
        Ok(())
    }

    /// Clones of the scratch pages, pinned by jobs so the device can read
    /// split-operation slots while the caller reuses the list.
    pub(crate) fn scratch_pages(&self) -> Vec<Arc<Buffer>> {
        self.scratch.pages.clone()
    }

    fn maybe_flush(&mut self) -> NpuResult<()> {
        if self.flavor != ListFlavor::Immediate || self.tasks.is_empty() {
            return Ok(());
        }
        let queue = self
            .immediate_queue
            .clone()
            .ok_or(NpuError::InvalidState("immediate list has no queue"))?;
        let result = self.close_internal().and_then(|()| {
            queue.submit(self, None)?;
            Ok(())
        });

        // Fresh accumulation state either way: on success the job pinned
        // what it needs; on failure the operation is discarded whole.
        // Scratch pages stay with this list, so keep the slot cursor
        // advancing instead of recycling under the device.
        if let Some(closed) = self.closed.take()
            && !closed.submitted
        {
            let mut pool = self.ctx.barriers().lock().expect("barrier pool poisoned");
            for id in closed.barriers {
                let _ = pool.release(id);
            }
        }
        self.open = true;
        self.tasks.clear();
        self.virt_count = 0;
        self.pending_wait = 0;
        self.open_start = 0;
        self.event_refs.clear();
        self.buffer_refs.clear();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drv::soft::SoftDevice;
    use crate::memory::{CachePolicy, Residency};
    use crate::mi::{NPU_BARRIER_COUNT, TaskFamily};

    fn test_ctx() -> Arc<DeviceContext> {
        DeviceContext::new(Arc::new(SoftDevice::new())).unwrap()
    }

    fn buffer(ctx: &DeviceContext, size: u64) -> Arc<Buffer> {
        ctx.alloc_buffer(size, Residency::HostVisible, CachePolicy::default())
            .unwrap()
    }

    #[test]
    fn three_copies_one_barrier_inserts_one_sync_point() {
        let ctx = test_ctx();
        let a = buffer(&ctx, 4096);
        let b = buffer(&ctx, 4096);

        let mut list = ctx.create_command_list();
        for offset in [0u64, 256, 512] {
            list.append_copy(a.device_addr() + offset, b.device_addr() + offset, 128)
                .unwrap();
        }
        list.append_barrier().unwrap();
        list.close().unwrap();

        let parts = list.partitions().unwrap();
        let copies = parts.stream(TaskFamily::Copy);
        assert_eq!(copies.len(), 3);

        // The copies are independent: nothing waits, and all three post the
        // single synchronization barrier.
        let post = copies[0].post_mask();
        assert_ne!(post, 0);
        for copy in copies {
            assert_eq!(copy.wait_mask(), 0);
            assert_eq!(copy.post_mask(), post);
        }
        assert_eq!(post.count_ones(), 1);

        // Exactly one barrier was taken from the pool.
        assert_eq!(
            ctx.barriers().lock().unwrap().available(),
            NPU_BARRIER_COUNT - 1
        );
    }

    #[test]
    fn misaligned_timestamp_splits_with_causal_order() {
        let ctx = test_ctx();
        let dst = buffer(&ctx, 4096);

        let mut list = ctx.create_command_list();
        list.append_timestamp(dst.device_addr() + 4).unwrap();
        list.close().unwrap();

        let parts = list.partitions().unwrap();
        let stamps = parts.stream(TaskFamily::Timestamp);
        let copies = parts.stream(TaskFamily::Copy);
        assert_eq!(stamps.len(), 1);
        assert_eq!(copies.len(), 1);

        // The aligned scratch write happens-before the copy into place.
        let TaskRecord::Timestamp(ts) = stamps[0] else {
            unreachable!()
        };
        assert_eq!(ts.dst_addr % NPU_CACHE_LINE, 0);
        assert_ne!(stamps[0].post_mask(), 0);
        assert_eq!(copies[0].wait_mask() & stamps[0].post_mask(), stamps[0].post_mask());
    }

    #[test]
    fn aligned_timestamp_is_a_single_record() {
        let ctx = test_ctx();
        let dst = buffer(&ctx, 4096);

        let mut list = ctx.create_command_list();
        list.append_timestamp(dst.device_addr()).unwrap();
        list.close().unwrap();

        let parts = list.partitions().unwrap();
        assert_eq!(parts.stream(TaskFamily::Timestamp).len(), 1);
        assert_eq!(parts.stream(TaskFamily::Copy).len(), 0);
    }

    #[test]
    fn reset_then_identical_appends_reencode_identically() {
        let ctx = test_ctx();
        let a = buffer(&ctx, 4096);
        let b = buffer(&ctx, 4096);
        let base = 0x4000_0000u64;

        let encode = |list: &mut CommandList| {
            list.append_copy(a.device_addr(), b.device_addr(), 512).unwrap();
            list.append_timestamp(b.device_addr() + 4).unwrap();
            list.append_barrier().unwrap();
            list.append_copy(b.device_addr(), a.device_addr(), 512).unwrap();
            list.close().unwrap();
            let parts = list.partitions().unwrap();
            TaskFamily::ALL
                .map(|family| parts.encode_stream(family, base))
                .concat()
        };

        let mut list = ctx.create_command_list();
        let first = encode(&mut list);

        list.reset().unwrap();
        assert_eq!(list.task_count(), 0);
        assert!(!list.is_closed());

        let second = encode(&mut list);
        assert_eq!(first, second);
    }

    #[test]
    fn append_after_close_is_not_available() {
        let ctx = test_ctx();
        let a = buffer(&ctx, 4096);
        let mut list = ctx.create_command_list();
        list.close().unwrap();
        // Second close is a no-op.
        list.close().unwrap();
        assert!(matches!(
            list.append_copy(a.device_addr(), a.device_addr() + 2048, 16),
            Err(NpuError::InvalidState(_))
        ));
    }

    #[test]
    fn barrier_pool_exhaustion_is_reported_at_close() {
        let ctx = test_ctx();
        let a = buffer(&ctx, 1 << 16);

        let mut list = ctx.create_command_list();
        for i in 0..=crate::mi::NPU_BARRIER_COUNT as u64 {
            list.append_copy(a.device_addr() + i * 16, a.device_addr() + 32768 + i * 16, 16)
                .unwrap();
            list.append_barrier().unwrap();
        }
        assert!(matches!(
            list.close(),
            Err(NpuError::ResourceExhausted(_))
        ));

        // The failed close released everything it had taken.
        assert_eq!(
            ctx.barriers().lock().unwrap().available(),
            NPU_BARRIER_COUNT
        );
    }

    #[test]
    fn freed_buffer_reference_fails_close() {
        let ctx = test_ctx();
        let a = buffer(&ctx, 4096);
        let b = buffer(&ctx, 4096);

        let mut list = ctx.create_command_list();
        list.append_copy(a.device_addr(), b.device_addr(), 4096).unwrap();
        ctx.free_buffer(&b).unwrap();
        assert!(matches!(
            list.close(),
            Err(NpuError::InvalidArgument(_))
        ));
    }

    #[test]
    fn unregistered_range_fails_at_append() {
        let ctx = test_ctx();
        let a = buffer(&ctx, 4096);
        let mut list = ctx.create_command_list();
        assert!(matches!(
            list.append_copy(0xDEAD_0000, a.device_addr(), 64),
            Err(NpuError::InvalidArgument(_))
        ));
        assert!(matches!(
            list.append_copy(a.device_addr(), a.device_addr() + 2048, 0),
            Err(NpuError::InvalidArgument(_))
        ));
    }

    #[test]
    fn event_from_another_context_is_rejected() {
        let ctx_a = test_ctx();
        let ctx_b = test_ctx();
        let pool_b = ctx_b.create_event_pool(4).unwrap();
        let event_b = pool_b.create_event(0).unwrap();

        let mut list = ctx_a.create_command_list();
        assert!(matches!(
            list.append_signal_event(&event_b),
            Err(NpuError::InvalidArgument(_))
        ));
    }

    #[test]
    fn barrier_conservation_holds_after_close() {
        let ctx = test_ctx();
        let a = buffer(&ctx, 1 << 16);

        let mut list = ctx.create_command_list();
        list.append_copy(a.device_addr(), a.device_addr() + 4096, 1024).unwrap();
        list.append_timestamp(a.device_addr() + 8192 + 4).unwrap();
        list.append_barrier().unwrap();
        list.append_copy(a.device_addr() + 4096, a.device_addr() + 12288, 1024)
            .unwrap();
        list.close().unwrap();

        let parts = list.partitions().unwrap();
        let pool = ctx.barriers().lock().unwrap();
        let closed = list.closed.as_ref().unwrap();
        for id in &closed.barriers {
            let (producers, consumers) = pool.counts(*id).unwrap();
            let mut posts = 0;
            let mut waits = 0;
            for family in TaskFamily::ALL {
                for record in parts.stream(family) {
                    if record.post_mask() & id.bit() != 0 {
                        posts += 1;
                    }
                    if record.wait_mask() & id.bit() != 0 {
                        waits += 1;
                    }
                }
            }
            assert_eq!(producers, posts);
            assert_eq!(consumers, waits);
        }
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        if self.has_inflight_job() {
            // The job pinned the scratch pages; nothing here is safe to
            // free early.
            tracing::warn!("command list dropped with a job still in flight");
            return;
        }
        if let Some(closed) = self.closed.take()
            && !closed.submitted
            && let Ok(mut pool) = self.ctx.barriers().lock()
        {
            for id in closed.barriers {
                let _ = pool.release(id);
            }
        }
        if let Ok(mut registry) = self.ctx.registry().lock() {
            for page in self.scratch.pages.drain(..) {
                let _ = registry.free(&page);
            }
        }
    }
}
