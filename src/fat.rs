//! Disk boundary for a FAT filesystem layer: sector transfers, status and
//! the control channel, expressed over the SD card state machine.

use bitflags::bitflags;
use log::warn;

use crate::bus::{SectorRead, SectorWrite, Sdio, SECTOR_SIZE};
use crate::disk::Disk;
use crate::error::DiskError;

bitflags! {
    /// Drive status reported to the filesystem layer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DiskStatus: u8 {
        const NOINIT = 0x01;
    }
}

/// Control requests from the filesystem layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ioctl {
    /// Finish pending writes.
    Sync,
    SectorCount,
    SectorSize,
    BlockSize,
}

/// Physical drive as the filesystem layer sees it.
pub struct FatDisk<B> {
    disk: Disk<B>,
    status: DiskStatus,
}

impl<B: Sdio + SectorRead + SectorWrite> FatDisk<B> {
    pub fn new(disk: Disk<B>) -> Self {
        FatDisk { disk, status: DiskStatus::NOINIT }
    }

    pub fn status(&self) -> DiskStatus {
        self.status
    }

    pub fn disk_mut(&mut self) -> &mut Disk<B> {
        &mut self.disk
    }

    pub fn free(self) -> Disk<B> {
        self.disk
    }

    /// Bring up the card. On failure the drive stays flagged uninitialized
    /// and sector transfers keep getting refused.
    pub fn initialize(&mut self) -> DiskStatus {
        match self.disk.init() {
            Ok(()) => self.status = DiskStatus::empty(),
            Err(error) => {
                warn!("card initialization failed: {:?}", error);
                self.status = DiskStatus::NOINIT;
            }
        }
        self.status
    }

    /// Read `buffer.len() / 512` sectors starting at `sector`.
    pub fn read(&mut self, buffer: &mut [u8], sector: u32) -> Result<(), DiskError> {
        if self.status.contains(DiskStatus::NOINIT) {
            return Err(DiskError::Init);
        }
        self.disk.read_to_ram(sector, buffer)
    }

    /// Write `buffer.len() / 512` sectors starting at `sector`.
    pub fn write(&mut self, buffer: &[u8], sector: u32) -> Result<(), DiskError> {
        if self.status.contains(DiskStatus::NOINIT) {
            return Err(DiskError::Init);
        }
        self.disk.write(sector, buffer)
    }

    /// Control channel. The medium size is not known to the card driver, so
    /// `SectorCount` answers zero and sizing stays with the volume record.
    pub fn ioctl(&mut self, request: Ioctl) -> Result<u32, DiskError> {
        match request {
            Ioctl::Sync => self.disk.close().map(|()| 0),
            Ioctl::SectorCount => Ok(0),
            Ioctl::SectorSize | Ioctl::BlockSize => Ok(SECTOR_SIZE as u32),
        }
    }
}

/// Timestamp for directory entries, in the packed FAT format. There is no
/// clock on the cartridge, so every entry reads 2018-01-01.
pub fn fat_time() -> u32 {
    (2018 - 1980) << 25 | 1 << 21 | 1 << 16
}
