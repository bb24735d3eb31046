use crate::error::Result;

/// Trait for one physical replica underneath a mirrored volume.
///
/// Transfers are whole sectors: `buf.len()` must be a non-zero multiple of
/// [`SECTOR_SIZE`](crate::SECTOR_SIZE) and the span must lie inside the
/// device. A short transfer is an error, never a partial success.
pub trait BlockDevice: Send + Sync {
    /// Total sectors the device can address.
    fn num_sectors(&self) -> u64;
    /// Read the sectors starting at `sector` into `buf`.
    fn read_at(&self, sector: u64, buf: &mut [u8]) -> Result<()>;
    /// Write `buf` to the sectors starting at `sector`.
    fn write_at(&self, sector: u64, buf: &[u8]) -> Result<()>;
}
