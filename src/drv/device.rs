use crate::drv::DeviceControl;
use crate::drv::ioctl::{
    BoCreateArgs, BoFreeArgs, BoInfoArgs, NPU_IOC_BO_CREATE, NPU_IOC_BO_FREE, NPU_IOC_BO_INFO,
    NPU_IOC_QUERY_PARAM, NPU_IOC_SUBMIT_JOB, NPU_IOC_WAIT_JOB, NPU_PARAM_FW_API_VERSION,
    QueryParamArgs, SubmitJobArgs, WaitJobArgs,
};
use crate::error::{NpuError, NpuResult};
use crate::mi::{mi_version, mi_version_major};
use std::fs::{File, OpenOptions};
use std::os::fd::RawFd;
use std::os::unix::io::AsRawFd;
use std::ptr;
use std::sync::Arc;

pub const NPU_DEVICE_PATH: &str = "/dev/npu0";

/// A handle to the NPU kernel driver character device.
///
/// Wraps the file descriptor in an `Arc`, so it is cheap to clone and share
/// across objects (jobs, buffer objects, event pools) that need to persist
/// beyond the initial context.
#[derive(Clone, Debug)]
pub struct NpuDevice {
    pub file: Arc<File>,
}

impl NpuDevice {
    /// Opens the NPU driver device.
    ///
    /// # Errors
    /// Returns an error if the device node cannot be opened (driver not
    /// loaded, permissions).
    pub fn open() -> NpuResult<Self> {
        Self::open_path(NPU_DEVICE_PATH)
    }

    pub fn open_path(path: &str) -> NpuResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        Ok(Self {
            file: Arc::new(file),
        })
    }

    /// Generic unsafe helper to execute an IOCTL.
    ///
    /// # Safety
    /// The caller must ensure that `arg` points to valid memory appropriate
    /// for the specific `cmd`.
    unsafe fn ioctl<T>(&self, cmd: u32, arg: &mut T) -> NpuResult<()> {
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), cmd as _, arg as *mut T) };
        if ret < 0 {
            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EIO);
            return Err(NpuError::from_errno(errno));
        }
        Ok(())
    }

    /// Checks that the firmware's mapped-inference major version matches the
    /// driver's before any job is built against it.
    pub fn check_fw_version(&self) -> NpuResult<u32> {
        let fw = self.query_param(NPU_PARAM_FW_API_VERSION, 0)? as u32;
        if mi_version_major(fw) != mi_version_major(mi_version()) {
            return Err(NpuError::VersionMismatch {
                driver: mi_version(),
                firmware: fw,
            });
        }
        Ok(fw)
    }
}

impl DeviceControl for NpuDevice {
    fn bo_create(&self, args: &mut BoCreateArgs) -> NpuResult<()> {
        unsafe { self.ioctl(NPU_IOC_BO_CREATE, args) }
    }

    fn bo_info(&self, args: &mut BoInfoArgs) -> NpuResult<()> {
        unsafe { self.ioctl(NPU_IOC_BO_INFO, args) }
    }

    fn bo_free(&self, handle: u64) -> NpuResult<()> {
        let mut args = BoFreeArgs { handle };
        unsafe { self.ioctl(NPU_IOC_BO_FREE, &mut args) }
    }

    fn bo_map(&self, _handle: u64, size: usize, mmap_offset: u64) -> NpuResult<*mut u8> {
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.file.as_raw_fd(),
                mmap_offset as libc::off_t,
            )
        };
        if addr == libc::MAP_FAILED {
            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EIO);
            return Err(NpuError::from_errno(errno));
        }
        Ok(addr.cast::<u8>())
    }

    fn bo_unmap(&self, ptr: *mut u8, size: usize) -> NpuResult<()> {
        let ret = unsafe { libc::munmap(ptr.cast::<libc::c_void>(), size) };
        if ret < 0 {
            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EIO);
            return Err(NpuError::from_errno(errno));
        }
        Ok(())
    }

    fn submit_job(&self, args: &mut SubmitJobArgs) -> NpuResult<()> {
        unsafe { self.ioctl(NPU_IOC_SUBMIT_JOB, args) }
    }

    fn wait_job(&self, args: &mut WaitJobArgs) -> NpuResult<()> {
        unsafe { self.ioctl(NPU_IOC_WAIT_JOB, args) }
    }

    fn query_param(&self, param: u32, index: u32) -> NpuResult<u64> {
        let mut args = QueryParamArgs {
            param,
            index,
            value: 0,
        };
        unsafe {
            self.ioctl(NPU_IOC_QUERY_PARAM, &mut args)?;
        }
        Ok(args.value)
    }
}

impl AsRawFd for NpuDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}
