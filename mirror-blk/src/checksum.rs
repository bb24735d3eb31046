//! The per-sector checksum codec.
//!
//! Every data sector is covered by a CRC-32 (IEEE polynomial) of its 512
//! bytes, seeded with [`CRC_SEED`]. The polynomial, the seed and the
//! little-endian slot encoding in the checksum region together form the
//! on-disk format; changing any of them invalidates existing volumes.

use crc::crc32;

use crate::{CRC_SEED, SECTOR_SIZE};

/// Checksum of one full sector.
pub fn sector_crc(block: &[u8]) -> u32 {
    assert_eq!(block.len(), SECTOR_SIZE);
    crc32::update(CRC_SEED, &crc32::IEEE_TABLE, block)
}

/// Whether `block` still matches the checksum stored for it.
pub fn verify_sector(block: &[u8], stored: u32) -> bool {
    sector_crc(block) == stored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_is_deterministic() {
        let sector = [0x5au8; SECTOR_SIZE];
        assert_eq!(sector_crc(&sector), sector_crc(&sector));
    }

    #[test]
    fn crc_sees_every_byte() {
        let mut sector = [0u8; SECTOR_SIZE];
        let baseline = sector_crc(&sector);
        for i in [0, 1, 255, 256, SECTOR_SIZE - 1] {
            sector[i] ^= 0x01;
            assert_ne!(sector_crc(&sector), baseline, "flip at byte {}", i);
            sector[i] ^= 0x01;
        }
        assert_eq!(sector_crc(&sector), baseline);
    }

    #[test]
    fn verify_accepts_matching_and_rejects_stale() {
        let mut sector = [0u8; SECTOR_SIZE];
        sector[17] = 0xaa;
        let crc = sector_crc(&sector);
        assert!(verify_sector(&sector, crc));
        sector[17] = 0xab;
        assert!(!verify_sector(&sector, crc));
    }

    #[test]
    fn one_shot_matches_incremental_update() {
        let mut sector = [0u8; SECTOR_SIZE];
        for (i, byte) in sector.iter_mut().enumerate() {
            *byte = i as u8;
        }
        let partial = crc32::update(CRC_SEED, &crc32::IEEE_TABLE, &sector[..100]);
        let full = crc32::update(partial, &crc32::IEEE_TABLE, &sector[100..]);
        assert_eq!(full, sector_crc(&sector));
    }
}
