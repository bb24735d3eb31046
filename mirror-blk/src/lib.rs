//! A mirrored (two-replica) logical block device with per-sector integrity
//! checksums, isolated from any particular host or front end.
//!
//! Consumers implement [`BlockDevice`] for their physical replicas and drive
//! a [`MirrorVolume`]; everything else (the checksum codec, the on-disk
//! layout and the read-repair logic) lives here.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod block_dev;
mod checksum;
mod error;
mod layout;
mod mirror;

/// Bytes per sector, the unit of addressing, transfer and checksumming.
pub const SECTOR_SIZE: usize = 512;
/// Bytes of one stored checksum, a little-endian CRC-32.
pub const CHECKSUM_SIZE: usize = core::mem::size_of::<u32>();
/// Checksums packed into one sector of the checksum region.
pub const CHECKSUMS_PER_SECTOR: usize = SECTOR_SIZE / CHECKSUM_SIZE;
/// Seed of the checksum codec. Part of the on-disk format.
pub const CRC_SEED: u32 = 0;

pub use block_dev::BlockDevice;
pub use checksum::{sector_crc, verify_sector};
pub use error::{DiskError, Result};
pub use layout::{ChecksumLocation, DiskLayout, SectorGroup};
pub use mirror::MirrorVolume;
