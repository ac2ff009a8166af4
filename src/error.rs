use thiserror::Error;

#[derive(Error, Debug)]
pub enum NpuError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    #[error("Device lost")]
    DeviceLost,

    #[error("Mapped-inference version mismatch (driver {driver:#x}, firmware {firmware:#x})")]
    VersionMismatch { driver: u32, firmware: u32 },

    #[error("Operation timed out")]
    WaitTimeout,

    #[error("Unknown device error")]
    Unknown,
}

// A convenient alias
pub type NpuResult<T> = Result<T, NpuError>;

impl NpuError {
    /// Maps a raw errno from a control call into the driver taxonomy.
    ///
    /// The control interface reports exactly one errno per failed verb, so
    /// the mapping is 1:1 and loses nothing a caller could act on.
    #[must_use]
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EINVAL => Self::InvalidArgument("rejected by device control interface"),
            libc::EBUSY => Self::InvalidState("device control interface busy"),
            libc::ENOSPC | libc::ENOMEM => {
                Self::ResourceExhausted("device control interface allocation failed")
            }
            libc::ENODEV | libc::EIO => Self::DeviceLost,
            libc::EPROTO => Self::VersionMismatch {
                driver: 0,
                firmware: 0,
            },
            libc::ETIMEDOUT => Self::WaitTimeout,
            _ => Self::Unknown,
        }
    }
}
