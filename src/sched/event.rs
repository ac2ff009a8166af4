//! Events and fences.
//!
//! Events are slots of a host/device-shared counter array: one cache line
//! per slot, signalable from the host or by a device fence task. Fences
//! wrap job completion only — same state machine, no host-signal path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::error::{NpuError, NpuResult};
use crate::memory::{Buffer, BufferRegistry, CachePolicy, Residency};
use crate::mi::NPU_CACHE_LINE;
use crate::sched::job::{JobHandle, JobManager, JobStatus};

pub const EVENT_UNSIGNALED: u64 = 0;
pub const EVENT_SIGNALED: u64 = 1;

/// Bytes per event slot; one cache line keeps device stores from
/// interfering across slots.
pub const EVENT_SLOT_SIZE: u64 = NPU_CACHE_LINE;

/// Observable state of an event or fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    NotReady,
    Ready,
}

/// Metric-tracking parameters attached to an event used with the
/// metric-query operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricParams {
    /// Hardware metric groups to sample.
    pub group_mask: u32,
    /// Bytes the device writes per query payload.
    pub payload_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    InUse,
}

struct PoolShared {
    ctx_id: u64,
    capacity: usize,
    registry: Arc<Mutex<BufferRegistry>>,
    bo: Arc<Buffer>,
    slots: Mutex<Vec<SlotState>>,
}

unsafe impl Send for PoolShared {}
unsafe impl Sync for PoolShared {}

impl Drop for PoolShared {
    fn drop(&mut self) {
        // Last event/job reference is gone; the counter array can go too.
        if let Ok(mut registry) = self.registry.lock() {
            let _ = registry.free(&self.bo);
        }
    }
}

impl PoolShared {
    fn slot_atomic(&self, index: usize) -> &AtomicU64 {
        debug_assert!(index < self.capacity);
        // Slots are 64-byte spaced 8-byte aligned words inside the pool's
        // host mapping, which lives as long as this struct.
        unsafe {
            &*self
                .bo
                .host_ptr()
                .add(index * EVENT_SLOT_SIZE as usize)
                .cast::<AtomicU64>()
        }
    }

    fn slot_device_addr(&self, index: usize) -> u64 {
        self.bo.device_addr() + index as u64 * EVENT_SLOT_SIZE
    }
}

/// Keeps an event slot reserved. Jobs hold clones for every slot their
/// fence tasks touch, so a destroyed event's slot is not recycled until the
/// last in-flight reference drops.
#[derive(Clone)]
pub struct EventSlotRef {
    guard: Arc<SlotGuard>,
}

impl std::fmt::Debug for EventSlotRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSlotRef")
            .field("index", &self.guard.index)
            .finish()
    }
}

struct SlotGuard {
    pool: Arc<PoolShared>,
    index: usize,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut slots = self.pool.slots.lock().expect("event slots poisoned");
        slots[self.index] = SlotState::Free;
    }
}

/// Fixed-capacity pool of event slots backed by one host-visible buffer.
pub struct EventPool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for EventPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPool")
            .field("capacity", &self.shared.capacity)
            .finish_non_exhaustive()
    }
}

impl EventPool {
    /// Allocates the slot array.
    ///
    /// # Errors
    /// `InvalidArgument` for a zero capacity; allocation failures propagate.
    pub fn new(
        registry: &Arc<Mutex<BufferRegistry>>,
        ctx_id: u64,
        capacity: usize,
    ) -> NpuResult<Self> {
        if capacity == 0 || capacity > 1024 {
            return Err(NpuError::InvalidArgument("event pool capacity"));
        }
        let bo = registry.lock().expect("registry poisoned").alloc(
            capacity as u64 * EVENT_SLOT_SIZE,
            Residency::HostVisible,
            CachePolicy::Uncached,
        )?;
        Ok(Self {
            shared: Arc::new(PoolShared {
                ctx_id,
                capacity,
                registry: registry.clone(),
                bo,
                slots: Mutex::new(vec![SlotState::Free; capacity]),
            }),
        })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Creates an event over the slot at `index`.
    ///
    /// # Errors
    /// `InvalidArgument` when the index is out of range or the slot is
    /// still reserved (including by an in-flight job holding a reference
    /// to a destroyed event).
    pub fn create_event(&self, index: usize) -> NpuResult<Event> {
        self.create_event_inner(index, None)
    }

    /// Creates an event carrying metric-tracking parameters.
    pub fn create_event_with_metrics(
        &self,
        index: usize,
        metrics: MetricParams,
    ) -> NpuResult<Event> {
        self.create_event_inner(index, Some(metrics))
    }

    fn create_event_inner(&self, index: usize, metrics: Option<MetricParams>) -> NpuResult<Event> {
        if index >= self.shared.capacity {
            return Err(NpuError::InvalidArgument("event index out of range"));
        }
        {
            let mut slots = self.shared.slots.lock().expect("event slots poisoned");
            if slots[index] != SlotState::Free {
                return Err(NpuError::InvalidArgument("event slot in use"));
            }
            slots[index] = SlotState::InUse;
        }

        let slot = EventSlotRef {
            guard: Arc::new(SlotGuard {
                pool: self.shared.clone(),
                index,
            }),
        };
        self.shared
            .slot_atomic(index)
            .store(EVENT_UNSIGNALED, Ordering::Release);

        Ok(Event { slot, metrics })
    }
}

/// A handle over one slot of the shared counter array.
///
/// State machine: `Unsignaled -(host signal | device fence task)->
/// Signaled -(reset)-> Unsignaled`. Dropping the event releases its slot
/// once no in-flight job still references it.
pub struct Event {
    slot: EventSlotRef,
    metrics: Option<MetricParams>,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("index", &self.index())
            .field("metrics", &self.metrics)
            .finish()
    }
}

impl Event {
    #[must_use]
    pub fn index(&self) -> usize {
        self.slot.guard.index
    }

    /// Device address of the slot; fence tasks target this.
    #[must_use]
    pub fn device_addr(&self) -> u64 {
        self.slot.guard.pool.slot_device_addr(self.slot.guard.index)
    }

    #[must_use]
    pub fn metrics(&self) -> Option<MetricParams> {
        self.metrics
    }

    #[must_use]
    pub(crate) fn context_id(&self) -> u64 {
        self.slot.guard.pool.ctx_id
    }

    #[must_use]
    pub(crate) fn slot_ref(&self) -> EventSlotRef {
        self.slot.clone()
    }

    fn atomic(&self) -> &AtomicU64 {
        self.slot.guard.pool.slot_atomic(self.slot.guard.index)
    }

    /// Signals from the host, independent of any job. Idempotent.
    pub fn host_signal(&self) {
        self.atomic().store(EVENT_SIGNALED, Ordering::Release);
    }

    /// Never blocks.
    #[must_use]
    pub fn query_status(&self) -> SyncStatus {
        if self.atomic().load(Ordering::Acquire) == EVENT_SIGNALED {
            SyncStatus::Ready
        } else {
            SyncStatus::NotReady
        }
    }

    /// Blocks until signaled or `timeout` elapses. A zero timeout
    /// degenerates to a single status query; `None` waits forever.
    ///
    /// # Errors
    /// `WaitTimeout` when the bound elapses first.
    pub fn host_synchronize(&self, timeout: Option<Duration>) -> NpuResult<()> {
        if self.query_status() == SyncStatus::Ready {
            return Ok(());
        }
        if timeout == Some(Duration::ZERO) {
            return Err(NpuError::WaitTimeout);
        }

        // Spin briefly for low-latency signals, then back off to sleeping;
        // device completion interrupts land well above the spin window.
        let start = Instant::now();
        let spin_for = Duration::from_micros(20);
        loop {
            if self.query_status() == SyncStatus::Ready {
                return Ok(());
            }
            if let Some(limit) = timeout
                && start.elapsed() >= limit
            {
                return Err(NpuError::WaitTimeout);
            }
            if start.elapsed() < spin_for {
                std::hint::spin_loop();
            } else {
                std::thread::sleep(Duration::from_micros(50));
            }
        }
    }

    /// Forces the unsignaled state. Idempotent; jobs already submitted
    /// against the event are unaffected and may leave it unsignaled if no
    /// later device task signals it again.
    pub fn reset(&self) {
        self.atomic().store(EVENT_UNSIGNALED, Ordering::Release);
    }
}

/// Host-observable wrapper over the completion of the jobs submitted with
/// it. Driven only by job completion; there is no host-signal path.
pub struct Fence {
    manager: Arc<JobManager>,
    jobs: Mutex<Vec<JobHandle>>,
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("jobs", &self.jobs.lock().map(|j| j.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl Fence {
    #[must_use]
    pub(crate) fn new(manager: Arc<JobManager>) -> Self {
        Self {
            manager,
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn attach(&self, job: JobHandle) {
        self.jobs.lock().expect("fence jobs poisoned").push(job);
    }

    /// Non-blocking status query. A fence with no submitted jobs (fresh or
    /// just reset) is not ready.
    ///
    /// # Errors
    /// `DeviceLost` if any attached job aborted; `Unknown` for an
    /// unclassified device status.
    pub fn query_status(&self) -> NpuResult<SyncStatus> {
        let jobs = self.jobs.lock().expect("fence jobs poisoned").clone();
        if jobs.is_empty() {
            return Ok(SyncStatus::NotReady);
        }
        for job in &jobs {
            match self.manager.poll(job)? {
                JobStatus::Success => {}
                JobStatus::Pending => return Ok(SyncStatus::NotReady),
                JobStatus::Aborted => return Err(NpuError::DeviceLost),
                JobStatus::Unknown => return Err(NpuError::Unknown),
            }
        }
        Ok(SyncStatus::Ready)
    }

    /// Blocks until every attached job completes or `timeout` elapses.
    ///
    /// # Errors
    /// `WaitTimeout` for a fence with no submitted jobs; it can never
    /// become ready.
    pub fn synchronize(&self, timeout: Option<Duration>) -> NpuResult<()> {
        let jobs = self.jobs.lock().expect("fence jobs poisoned").clone();
        if jobs.is_empty() {
            return Err(NpuError::WaitTimeout);
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        for job in &jobs {
            let remaining = match deadline {
                None => None,
                Some(d) => Some(
                    d.checked_duration_since(Instant::now())
                        .ok_or(NpuError::WaitTimeout)?,
                ),
            };
            self.manager.wait(job, remaining)?;
        }
        Ok(())
    }

    /// Detaches completed-or-not jobs and returns the fence to not-ready.
    pub fn reset(&self) {
        self.jobs.lock().expect("fence jobs poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drv::soft::SoftDevice;

    fn test_pool(capacity: usize) -> EventPool {
        let registry = Arc::new(Mutex::new(BufferRegistry::new(Arc::new(SoftDevice::new()))));
        EventPool::new(&registry, 7, capacity).unwrap()
    }

    #[test]
    fn event_round_trip() {
        let pool = test_pool(4);
        let event = pool.create_event(0).unwrap();

        assert_eq!(event.query_status(), SyncStatus::NotReady);
        event.host_signal();
        assert_eq!(event.query_status(), SyncStatus::Ready);
        event.host_signal(); // idempotent
        assert_eq!(event.query_status(), SyncStatus::Ready);

        event.reset();
        assert_eq!(event.query_status(), SyncStatus::NotReady);
        event.reset(); // idempotent
        assert_eq!(event.query_status(), SyncStatus::NotReady);
    }

    #[test]
    fn explicit_index_collision_is_rejected() {
        let pool = test_pool(2);
        let _a = pool.create_event(1).unwrap();
        assert!(matches!(
            pool.create_event(1),
            Err(NpuError::InvalidArgument(_))
        ));
        assert!(matches!(
            pool.create_event(2),
            Err(NpuError::InvalidArgument(_))
        ));
    }

    #[test]
    fn slot_reuse_waits_for_last_reference() {
        let pool = test_pool(1);
        let event = pool.create_event(0).unwrap();
        let in_flight = event.slot_ref(); // as a job would hold it
        drop(event);

        // Slot still pinned by the in-flight reference.
        assert!(matches!(
            pool.create_event(0),
            Err(NpuError::InvalidArgument(_))
        ));

        drop(in_flight);
        assert!(pool.create_event(0).is_ok());
    }

    #[test]
    fn zero_timeout_synchronize_is_a_query() {
        let pool = test_pool(1);
        let event = pool.create_event(0).unwrap();
        assert!(matches!(
            event.host_synchronize(Some(Duration::ZERO)),
            Err(NpuError::WaitTimeout)
        ));
        event.host_signal();
        event.host_synchronize(Some(Duration::ZERO)).unwrap();
    }
}
