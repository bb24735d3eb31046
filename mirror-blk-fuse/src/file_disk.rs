//! Disk-image files as physical replicas.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use log::error;
use mirror_blk::{BlockDevice, DiskError, SECTOR_SIZE};

/// One replica backed by a regular file, addressed in whole sectors.
#[derive(Debug)]
pub struct FileDisk {
    file: Mutex<File>,
    num_sectors: u64,
}

impl FileDisk {
    /// Open an existing image holding a whole number of sectors.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len % SECTOR_SIZE as u64 != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "{}: {} bytes is not a whole number of sectors",
                    path.display(),
                    len
                ),
            ));
        }
        Ok(Self {
            file: Mutex::new(file),
            num_sectors: len / SECTOR_SIZE as u64,
        })
    }

    /// Create an image of exactly `sectors` sectors, truncating any old one.
    pub fn create(path: &Path, sectors: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(sectors * SECTOR_SIZE as u64)?;
        Ok(Self {
            file: Mutex::new(file),
            num_sectors: sectors,
        })
    }
}

impl BlockDevice for FileDisk {
    fn num_sectors(&self) -> u64 {
        self.num_sectors
    }

    fn read_at(&self, sector: u64, buf: &mut [u8]) -> mirror_blk::Result<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(sector * SECTOR_SIZE as u64))
            .and_then(|_| file.read_exact(buf))
            .map_err(|err| {
                error!("image read at sector {} failed: {}", sector, err);
                DiskError::Io
            })
    }

    fn write_at(&self, sector: u64, buf: &[u8]) -> mirror_blk::Result<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(sector * SECTOR_SIZE as u64))
            .and_then(|_| file.write_all(buf))
            .map_err(|err| {
                error!("image write at sector {} failed: {}", sector, err);
                DiskError::Io
            })
    }
}
