//! The mirror engine: replicated sector i/o with read-time verification.
//!
//! Reads fetch the requested span and its checksum sector from both replicas,
//! verify each sector against its stored CRC and serve replica 0 whenever it
//! is valid. A sector that fails on exactly one replica is served from the
//! other and rewritten in place (data and checksum slot) on the failed one; a
//! sector invalid on both fails the whole request before any repair reaches
//! the devices. Writes go to both replicas and then refresh the covering
//! checksum sectors.
//!
//! All buffers live for one request only. The engine keeps no state between
//! requests besides the device handles, so a single caller at a time (or an
//! external queue such as the host dispatcher) is the only serialization it
//! needs.

use alloc::{sync::Arc, vec};
use core::cmp::min;

use log::{error, info, warn};

use crate::{
    block_dev::BlockDevice,
    checksum::{sector_crc, verify_sector},
    error::{DiskError, Result},
    layout::{DiskLayout, SectorGroup},
    CHECKSUM_SIZE, SECTOR_SIZE,
};

/// Sectors zeroed per transfer while formatting.
const FORMAT_CHUNK_SECTORS: usize = 128;

/// A mirrored logical disk over two physical replicas.
pub struct MirrorVolume {
    replicas: [Arc<dyn BlockDevice>; 2],
    layout: DiskLayout,
}

impl MirrorVolume {
    /// Assemble a volume from two already-formatted replicas. Each must hold
    /// at least `layout.total_sectors()` sectors.
    pub fn open(replicas: [Arc<dyn BlockDevice>; 2], layout: DiskLayout) -> Result<Self> {
        let required = layout.total_sectors();
        for (replica, dev) in replicas.iter().enumerate() {
            let actual = dev.num_sectors();
            if actual < required {
                return Err(DiskError::TooSmall {
                    replica,
                    required,
                    actual,
                });
            }
        }
        info!(
            "mirror volume opened: {} data + {} checksum sectors per replica",
            layout.data_sectors(),
            layout.checksum_sectors()
        );
        Ok(Self { replicas, layout })
    }

    /// Zero the data region of both replicas and store the matching
    /// checksums, leaving every sector readable.
    pub fn format(replicas: [Arc<dyn BlockDevice>; 2], layout: DiskLayout) -> Result<Self> {
        let volume = Self::open(replicas, layout)?;
        let zeros = vec![0u8; FORMAT_CHUNK_SECTORS * SECTOR_SIZE];
        let mut sector = 0;
        while sector < layout.data_sectors() {
            let count = min(
                FORMAT_CHUNK_SECTORS as u64,
                layout.data_sectors() - sector,
            ) as usize;
            for dev in &volume.replicas {
                dev.write_at(sector, &zeros[..count * SECTOR_SIZE])?;
            }
            sector += count as u64;
        }
        // Every slot covers an all-zero sector, slack slots included.
        let zero_crc = sector_crc(&zeros[..SECTOR_SIZE]);
        let mut pattern = [0u8; SECTOR_SIZE];
        for slot in pattern.chunks_exact_mut(CHECKSUM_SIZE) {
            slot.copy_from_slice(&zero_crc.to_le_bytes());
        }
        for offset in 0..layout.checksum_sectors() {
            for dev in &volume.replicas {
                dev.write_at(layout.data_sectors() + offset, &pattern)?;
            }
        }
        info!("mirror volume formatted: {} data sectors", layout.data_sectors());
        Ok(volume)
    }

    /// Geometry this volume was opened with.
    pub fn layout(&self) -> &DiskLayout {
        &self.layout
    }

    /// Read whole sectors starting at `first` into `buf`, verifying every
    /// sector and repairing single-replica damage on the way.
    pub fn read_sectors(&self, first: u64, buf: &mut [u8]) -> Result<()> {
        let count = self.request_sectors(first, buf.len())?;
        for group in self.layout.checksum_groups(first, count) {
            let offset = (group.first - first) as usize * SECTOR_SIZE;
            self.read_group(&group, &mut buf[offset..offset + group.count * SECTOR_SIZE])?;
        }
        Ok(())
    }

    /// Write whole sectors starting at `first` to both replicas and refresh
    /// their checksums.
    pub fn write_sectors(&self, first: u64, buf: &[u8]) -> Result<()> {
        let count = self.request_sectors(first, buf.len())?;
        for group in self.layout.checksum_groups(first, count) {
            let offset = (group.first - first) as usize * SECTOR_SIZE;
            self.write_group(&group, &buf[offset..offset + group.count * SECTOR_SIZE])?;
        }
        Ok(())
    }

    /// Validate one request against the layout. Misaligned buffers are a
    /// caller error reported in-band; addressing past the data region is a
    /// contract violation.
    fn request_sectors(&self, first: u64, len: usize) -> Result<usize> {
        if len % SECTOR_SIZE != 0 {
            return Err(DiskError::Unaligned { len });
        }
        let count = len / SECTOR_SIZE;
        assert!(
            self.layout.contains_range(first, count),
            "{} sectors at {} beyond the {}-sector data region",
            count,
            first,
            self.layout.data_sectors()
        );
        Ok(count)
    }

    fn read_group(&self, group: &SectorGroup, out: &mut [u8]) -> Result<()> {
        let span = group.count * SECTOR_SIZE;
        let mut data = [vec![0u8; span], vec![0u8; span]];
        let mut csums = [vec![0u8; SECTOR_SIZE], vec![0u8; SECTOR_SIZE]];
        let mut readable = [true; 2];
        for replica in 0..2 {
            let dev = &self.replicas[replica];
            if dev.read_at(group.first, &mut data[replica]).is_err()
                || dev.read_at(group.checksum_sector, &mut csums[replica]).is_err()
            {
                warn!(
                    "replica {}: read failed for sectors {}..{}",
                    replica,
                    group.first,
                    group.first + group.count as u64
                );
                readable[replica] = false;
            }
        }
        if readable == [false, false] {
            error!(
                "sectors {}..{}: both replicas unreadable",
                group.first,
                group.first + group.count as u64
            );
            return Err(DiskError::Io);
        }
        // An unreadable replica holds garbage buffers. Seed its checksum
        // sector from the healthy side so a repair flush cannot clobber the
        // 127 slots the request does not cover.
        if !readable[0] {
            csums[0] = csums[1].clone();
        }
        if !readable[1] {
            csums[1] = csums[0].clone();
        }

        let mut repaired = [false; 2];
        for i in 0..group.count {
            let sector = group.first + i as u64;
            let slot = self.layout.checksum_location(sector).index;
            let offset = i * SECTOR_SIZE;
            let valid = [0usize, 1].map(|replica| {
                readable[replica]
                    && verify_sector(
                        &data[replica][offset..offset + SECTOR_SIZE],
                        checksum_slot(&csums[replica], slot),
                    )
            });
            // Replica 0 serves whenever it is valid.
            let good = match valid {
                [true, _] => 0,
                [false, true] => 1,
                [false, false] => {
                    error!("sector {}: both replicas invalid", sector);
                    return Err(DiskError::Corrupt { sector });
                }
            };
            let out_block = &mut out[offset..offset + SECTOR_SIZE];
            out_block.copy_from_slice(&data[good][offset..offset + SECTOR_SIZE]);
            let bad = 1 - good;
            if !valid[bad] {
                warn!(
                    "sector {}: replica {} invalid, repairing from replica {}",
                    sector, bad, good
                );
                data[bad][offset..offset + SECTOR_SIZE].copy_from_slice(out_block);
                let good_slot = checksum_slot(&csums[good], slot);
                set_checksum_slot(&mut csums[bad], slot, good_slot);
                repaired[bad] = true;
            }
        }

        // Flush repairs only after the whole group verified single-failure;
        // the served data is already safe, so a failed flush is logged and
        // the read still succeeds.
        for replica in 0..2 {
            if repaired[replica] {
                let dev = &self.replicas[replica];
                if dev.write_at(group.first, &data[replica]).is_err()
                    || dev.write_at(group.checksum_sector, &csums[replica]).is_err()
                {
                    error!(
                        "replica {}: repair write failed for sectors {}..{}",
                        replica,
                        group.first,
                        group.first + group.count as u64
                    );
                }
            }
        }
        Ok(())
    }

    fn write_group(&self, group: &SectorGroup, data: &[u8]) -> Result<()> {
        for dev in &self.replicas {
            dev.write_at(group.first, data)?;
        }
        // Merge the fresh checksums into the covering sector. Replica 0 is
        // the base for the slots the request leaves alone.
        let mut csum = vec![0u8; SECTOR_SIZE];
        self.replicas[0].read_at(group.checksum_sector, &mut csum)?;
        for i in 0..group.count {
            let slot = self.layout.checksum_location(group.first + i as u64).index;
            let crc = sector_crc(&data[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
            set_checksum_slot(&mut csum, slot, crc);
        }
        for dev in &self.replicas {
            dev.write_at(group.checksum_sector, &csum)?;
        }
        Ok(())
    }
}

/// Stored checksum at `index` of a checksum-region sector.
fn checksum_slot(csum_sector: &[u8], index: usize) -> u32 {
    let offset = index * CHECKSUM_SIZE;
    let mut bytes = [0u8; CHECKSUM_SIZE];
    bytes.copy_from_slice(&csum_sector[offset..offset + CHECKSUM_SIZE]);
    u32::from_le_bytes(bytes)
}

fn set_checksum_slot(csum_sector: &mut [u8], index: usize, value: u32) {
    let offset = index * CHECKSUM_SIZE;
    csum_sector[offset..offset + CHECKSUM_SIZE].copy_from_slice(&value.to_le_bytes());
}
