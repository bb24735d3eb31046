use core::fmt;

/// Errors surfaced by the mirror engine and its device adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskError {
    /// A transfer to or from a physical device failed or came up short.
    Io,
    /// Both replicas of a logical sector failed checksum verification.
    Corrupt { sector: u64 },
    /// A replica cannot hold the data and checksum regions of the layout.
    TooSmall {
        replica: usize,
        required: u64,
        actual: u64,
    },
    /// A request buffer is not a whole number of sectors.
    Unaligned { len: usize },
}

impl fmt::Display for DiskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskError::Io => write!(f, "physical device i/o error"),
            DiskError::Corrupt { sector } => {
                write!(f, "sector {} is corrupt on both replicas", sector)
            }
            DiskError::TooSmall {
                replica,
                required,
                actual,
            } => write!(
                f,
                "replica {} holds {} sectors but the layout needs {}",
                replica, actual, required
            ),
            DiskError::Unaligned { len } => {
                write!(f, "request length {} is not a multiple of the sector size", len)
            }
        }
    }
}

impl core::error::Error for DiskError {}

pub type Result<T> = core::result::Result<T, DiskError>;
