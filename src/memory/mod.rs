//! Buffer objects and the device-VA range index.
//!
//! The registry is the owner of every device-mapped region the core
//! touches. Tasks reference buffer objects by device address only; the
//! range index makes those references checkable so a freed buffer can be
//! rejected at encode time instead of faulting on the device.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::warn;

use crate::drv::DeviceControl;
use crate::drv::ioctl::{
    BoCreateArgs, NPU_BO_FLAG_DEVICE_LOCAL, NPU_BO_FLAG_HOST_VISIBLE, NPU_BO_FLAG_SHARED,
    NPU_BO_FLAG_UNCACHED, NPU_BO_FLAG_WRITE_COMBINED,
};
use crate::error::{NpuError, NpuResult};

/// Residency class of a buffer object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    HostVisible,
    DeviceLocal,
    Shared,
}

/// Cache policy for host-visible mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    #[default]
    Cached,
    Uncached,
    WriteCombined,
}

const fn bo_flags(residency: Residency, cache: CachePolicy) -> u32 {
    let mut flags = match residency {
        Residency::HostVisible => NPU_BO_FLAG_HOST_VISIBLE,
        Residency::DeviceLocal => NPU_BO_FLAG_DEVICE_LOCAL,
        Residency::Shared => NPU_BO_FLAG_HOST_VISIBLE | NPU_BO_FLAG_SHARED,
    };
    match cache {
        CachePolicy::Cached => {}
        CachePolicy::Uncached => flags |= NPU_BO_FLAG_UNCACHED,
        CachePolicy::WriteCombined => flags |= NPU_BO_FLAG_WRITE_COMBINED,
    }
    flags
}

/// A device-mapped memory region with a stable device virtual address.
#[derive(Debug)]
pub struct Buffer {
    handle: u64,
    device_addr: u64,
    size: u64,
    host_ptr: *mut u8,
    residency: Residency,
    cache: CachePolicy,
}

unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    #[must_use]
    pub fn handle(&self) -> u64 {
        self.handle
    }

    #[must_use]
    pub fn device_addr(&self) -> u64 {
        self.device_addr
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn residency(&self) -> Residency {
        self.residency
    }

    #[must_use]
    pub fn cache_policy(&self) -> CachePolicy {
        self.cache
    }

    /// Host pointer for host-visible buffers; null for device-local ones.
    #[must_use]
    pub fn host_ptr(&self) -> *mut u8 {
        self.host_ptr
    }

    /// Host view of the mapping.
    ///
    /// # Safety
    /// The caller must not hold the slice across `BufferRegistry::free` of
    /// this buffer, and must not alias device writes to the same bytes.
    #[must_use]
    pub unsafe fn host_slice_mut(&self) -> &mut [u8] {
        debug_assert!(!self.host_ptr.is_null());
        unsafe { std::slice::from_raw_parts_mut(self.host_ptr, self.size as usize) }
    }
}

struct RangeEntry {
    size: u64,
    handle: u64,
}

/// Owns buffer objects and the findable device-VA range index.
pub struct BufferRegistry {
    control: Arc<dyn DeviceControl>,
    // Start address -> extent; used to find the range containing an address.
    ranges: BTreeMap<u64, RangeEntry>,
    buffers: HashMap<u64, Arc<Buffer>>,
}

impl std::fmt::Debug for BufferRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferRegistry")
            .field("buffers", &self.buffers.len())
            .finish_non_exhaustive()
    }
}

impl BufferRegistry {
    #[must_use]
    pub fn new(control: Arc<dyn DeviceControl>) -> Self {
        Self {
            control,
            ranges: BTreeMap::new(),
            buffers: HashMap::new(),
        }
    }

    /// Allocates and maps a buffer object.
    ///
    /// # Errors
    /// `InvalidArgument` for a zero size; control-interface failures map
    /// 1:1 into the driver taxonomy.
    pub fn alloc(
        &mut self,
        size: u64,
        residency: Residency,
        cache: CachePolicy,
    ) -> NpuResult<Arc<Buffer>> {
        if size == 0 {
            return Err(NpuError::InvalidArgument("buffer size must be non-zero"));
        }

        let mut args = BoCreateArgs {
            size,
            flags: bo_flags(residency, cache),
            ..Default::default()
        };
        self.control.bo_create(&mut args)?;

        let host_ptr = if matches!(residency, Residency::HostVisible | Residency::Shared) {
            self.control
                .bo_map(args.handle, size as usize, args.mmap_offset)
                .inspect_err(|_| {
                    // Creation succeeded but the mapping failed; give the
                    // handle back before reporting.
                    let _ = self.control.bo_free(args.handle);
                })?
        } else {
            std::ptr::null_mut()
        };

        let buffer = Arc::new(Buffer {
            handle: args.handle,
            device_addr: args.device_addr,
            size,
            host_ptr,
            residency,
            cache,
        });

        self.ranges.insert(
            args.device_addr,
            RangeEntry {
                size,
                handle: args.handle,
            },
        );
        self.buffers.insert(args.handle, buffer.clone());
        Ok(buffer)
    }

    /// Frees a buffer object and drops it from the range index.
    ///
    /// Command lists re-validate their references at close time, so a
    /// buffer freed between append and close turns into a synchronous
    /// encode error rather than a device fault.
    ///
    /// # Errors
    /// `InvalidArgument` if the buffer is not (or no longer) registered.
    pub fn free(&mut self, buffer: &Arc<Buffer>) -> NpuResult<()> {
        let Some(owned) = self.buffers.remove(&buffer.handle) else {
            return Err(NpuError::InvalidArgument("buffer not registered"));
        };
        self.ranges.remove(&owned.device_addr);

        if !owned.host_ptr.is_null()
            && let Err(e) = self.control.bo_unmap(owned.host_ptr, owned.size as usize)
        {
            warn!(handle = owned.handle, error = %e, "buffer unmap failed");
        }
        self.control.bo_free(owned.handle)
    }

    /// Finds the registered buffer whose range contains `[addr, addr+len)`.
    #[must_use]
    pub fn find_range(&self, addr: u64, len: u64) -> Option<&Arc<Buffer>> {
        let (&start, entry) = self.ranges.range(..=addr).next_back()?;
        let end = start.checked_add(entry.size)?;
        let req_end = addr.checked_add(len)?;
        if addr >= start && req_end <= end {
            self.buffers.get(&entry.handle)
        } else {
            None
        }
    }

    /// True if `[addr, addr+len)` lies inside one live buffer object.
    #[must_use]
    pub fn covers(&self, addr: u64, len: u64) -> bool {
        self.find_range(addr, len).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drv::soft::SoftDevice;

    fn registry() -> BufferRegistry {
        BufferRegistry::new(Arc::new(SoftDevice::new()))
    }

    #[test]
    fn range_index_finds_containing_buffer() {
        let mut reg = registry();
        let buf = reg
            .alloc(4096, Residency::HostVisible, CachePolicy::default())
            .unwrap();
        let base = buf.device_addr();

        assert!(reg.covers(base, 4096));
        assert!(reg.covers(base + 100, 8));
        assert!(!reg.covers(base + 4090, 8));
        assert!(!reg.covers(base.wrapping_sub(1), 1));
    }

    #[test]
    fn freed_buffer_leaves_the_index() {
        let mut reg = registry();
        let buf = reg
            .alloc(4096, Residency::HostVisible, CachePolicy::default())
            .unwrap();
        let base = buf.device_addr();
        reg.free(&buf).unwrap();

        assert!(!reg.covers(base, 1));
        assert!(matches!(
            reg.free(&buf),
            Err(NpuError::InvalidArgument(_))
        ));
    }

    #[test]
    fn zero_size_is_rejected() {
        let mut reg = registry();
        assert!(matches!(
            reg.alloc(0, Residency::DeviceLocal, CachePolicy::default()),
            Err(NpuError::InvalidArgument(_))
        ));
    }
}
