//! On-disk geometry of a mirrored volume.
//!
//! Both replicas carry the same image: data sectors `[0, N)` followed by a
//! checksum region packing one 4-byte little-endian CRC per data sector, 128
//! to a sector, in logical-sector order. The region holds
//! `ceil(N / 128)` sectors; slack slots in the last one are never addressed.

use core::cmp::min;

use crate::CHECKSUMS_PER_SECTOR;

/// Where the checksum of one logical sector lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumLocation {
    /// Physical sector (inside the checksum region) holding the slot.
    pub sector: u64,
    /// Slot index within that sector.
    pub index: usize,
}

/// A maximal run of consecutive request sectors covered by one checksum
/// sector. Handling requests group by group bounds checksum i/o to one
/// sector read and one sector write per 128 data sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorGroup {
    /// First logical sector of the group.
    pub first: u64,
    /// Sectors in the group, at most [`CHECKSUMS_PER_SECTOR`].
    pub count: usize,
    /// The checksum-region sector covering every sector of the group.
    pub checksum_sector: u64,
}

/// Geometry of a volume with a fixed number of data sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskLayout {
    data_sectors: u64,
}

impl DiskLayout {
    /// Layout for a logical disk of `data_sectors` sectors.
    pub fn new(data_sectors: u64) -> Self {
        assert!(data_sectors > 0, "a volume needs at least one data sector");
        Self { data_sectors }
    }

    /// Sectors addressable by the logical disk.
    pub fn data_sectors(&self) -> u64 {
        self.data_sectors
    }

    /// Sectors reserved after the data region for checksums.
    pub fn checksum_sectors(&self) -> u64 {
        self.data_sectors.div_ceil(CHECKSUMS_PER_SECTOR as u64)
    }

    /// Sectors each replica must provide: data region plus checksum region.
    pub fn total_sectors(&self) -> u64 {
        self.data_sectors + self.checksum_sectors()
    }

    /// Whether `count` sectors starting at `first` fit in the data region.
    pub fn contains_range(&self, first: u64, count: usize) -> bool {
        match first.checked_add(count as u64) {
            Some(end) => end <= self.data_sectors,
            None => false,
        }
    }

    /// Checksum slot of logical sector `sector`.
    pub fn checksum_location(&self, sector: u64) -> ChecksumLocation {
        assert!(
            sector < self.data_sectors,
            "sector {} beyond the {}-sector data region",
            sector,
            self.data_sectors
        );
        ChecksumLocation {
            sector: self.data_sectors + sector / CHECKSUMS_PER_SECTOR as u64,
            index: (sector % CHECKSUMS_PER_SECTOR as u64) as usize,
        }
    }

    /// Split a request into [`SectorGroup`]s at checksum-sector boundaries,
    /// in ascending order. An empty request yields no groups.
    pub fn checksum_groups(&self, first: u64, count: usize) -> impl Iterator<Item = SectorGroup> {
        assert!(
            self.contains_range(first, count),
            "{} sectors at {} beyond the {}-sector data region",
            count,
            first,
            self.data_sectors
        );
        Groups {
            layout: *self,
            next: first,
            end: first + count as u64,
        }
    }
}

struct Groups {
    layout: DiskLayout,
    next: u64,
    end: u64,
}

impl Iterator for Groups {
    type Item = SectorGroup;

    fn next(&mut self) -> Option<SectorGroup> {
        if self.next >= self.end {
            return None;
        }
        let location = self.layout.checksum_location(self.next);
        // The group runs to the next slot-128 boundary or the request end,
        // whichever comes first.
        let boundary = self.next - location.index as u64 + CHECKSUMS_PER_SECTOR as u64;
        let end = min(boundary, self.end);
        let group = SectorGroup {
            first: self.next,
            count: (end - self.next) as usize,
            checksum_sector: location.sector,
        };
        self.next = end;
        Some(group)
    }
}
