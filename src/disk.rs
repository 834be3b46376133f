//! SD card protocol state machine: identification, session tracking and the
//! sector transfer entry points.

use bit_field::BitField;
use log::debug;

use crate::bus::{SectorRead, SectorWrite, Sdio, Speed, WriteFault, SECTOR_SIZE};
use crate::crc::crc7;
use crate::error::DiskError;

pub const CMD0_GO_IDLE: u8 = 0x40;
pub const CMD2_ALL_SEND_CID: u8 = 0x42;
pub const CMD3_SEND_RELATIVE_ADDR: u8 = 0x43;
pub const CMD6_SWITCH_FUNC: u8 = 0x46;
pub const CMD7_SELECT_CARD: u8 = 0x47;
pub const CMD8_SEND_IF_COND: u8 = 0x48;
pub const CMD9_SEND_CSD: u8 = 0x49;
pub const CMD12_STOP_TRANSMISSION: u8 = 0x4C;
pub const CMD18_READ_MULTIPLE_BLOCK: u8 = 0x52;
pub const CMD25_WRITE_MULTIPLE_BLOCK: u8 = 0x59;
pub const CMD41_SD_SEND_OP_COND: u8 = 0x69;
pub const CMD55_APP_CMD: u8 = 0x77;

/// 1-bit polls on the command line for a response start bit.
pub const CMD_TIMEOUT: u32 = 2048;
/// ACMD41 rounds before the card is declared dead.
pub const ACMD41_TIMEOUT: u32 = 1024;
/// 2-bit polls for the data lines to idle after CMD12.
pub const CLOSE_IDLE_TIMEOUT: u32 = 65535;

/// ACMD41 argument: HCS plus the 3.0-3.4V window.
const OCR_ARG: u32 = 0x4030_0000;
/// CMD8 argument: 2.7-3.6V range, check pattern 0xAA.
const IF_COND_ARG: u32 = 0x1AA;

/// Open transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Idle,
    Reading,
    Writing,
}

/// Card generation and addressing mode learned during identification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CardType(u8);

impl CardType {
    /// Replied to CMD8, so version 2.0 or later.
    pub fn v2(self) -> bool {
        self.0.get_bit(1)
    }

    /// High capacity: transfer arguments are block numbers, not byte offsets.
    pub fn high_capacity(self) -> bool {
        self.0.get_bit(0)
    }

    fn set_v2(&mut self) {
        self.0.set_bit(1, true);
    }

    fn set_high_capacity(&mut self) {
        self.0.set_bit(0, true);
    }
}

/// SD card over the SDIO serial lines.
///
/// Multi-sector sessions stay open between calls: a read at the sector where
/// the previous read ended continues the running CMD18 without touching the
/// command line, which is what makes sequential throughput viable on this
/// interface.
pub struct Disk<B> {
    bus: B,
    mode: Mode,
    /// Next sector the open session will transfer.
    address: u32,
    card_type: CardType,
    /// Last response, R2 registers included.
    response: [u8; 17],
}

impl<B: Sdio + SectorRead + SectorWrite> Disk<B> {
    pub fn new(bus: B) -> Self {
        Disk { bus, mode: Mode::Idle, address: 0, card_type: CardType::default(), response: [0; 17] }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn card_type(&self) -> CardType {
        self.card_type
    }

    /// Sector the open session is positioned at.
    pub fn tracked_address(&self) -> u32 {
        self.address
    }

    pub fn response(&self) -> &[u8; 17] {
        &self.response
    }

    /// The underlying bus. The card is left alone between transfers, so the
    /// bus can serve other traffic, the host link included.
    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn free(self) -> B {
        self.bus
    }

    /// Identify and select the card, then switch it to high speed.
    pub fn init(&mut self) -> Result<(), DiskError> {
        self.card_type = CardType::default();
        self.mode = Mode::Idle;

        self.bus.set_speed(Speed::Low);
        self.bus.set_bit_length(8);

        for _ in 0..40 {
            self.bus.cmd_write(0xFF);
        }
        let _ = self.command(CMD0_GO_IDLE, 0); // no reply in idle state
        for _ in 0..40 {
            self.bus.cmd_write(0xFF);
        }

        if self.command(CMD8_SEND_IF_COND, IF_COND_ARG).is_ok() {
            self.card_type.set_v2();
        }

        if self.card_type.v2() {
            let mut ready = false;
            for _ in 0..ACMD41_TIMEOUT {
                self.command(CMD55_APP_CMD, 0).map_err(|_| DiskError::Init)?;
                if self.response[3] & 1 != 1 {
                    continue;
                }
                let _ = self.command(CMD41_SD_SEND_OP_COND, OCR_ARG);
                if self.response[1] & 0x80 == 0 {
                    continue;
                }
                ready = true;
                break;
            }
            if !ready {
                return Err(DiskError::Init);
            }
        } else {
            let mut ready = false;
            for _ in 0..ACMD41_TIMEOUT {
                self.command(CMD55_APP_CMD, 0).map_err(|_| DiskError::Init)?;
                self.command(CMD41_SD_SEND_OP_COND, OCR_ARG).map_err(|_| DiskError::Init)?;
                if self.response[1] >= 1 {
                    ready = true;
                    break;
                }
            }
            if !ready {
                return Err(DiskError::Init);
            }
        }

        if self.response[1] & 0x40 != 0 && self.card_type.v2() {
            self.card_type.set_high_capacity();
        }

        self.command(CMD2_ALL_SEND_CID, 0).map_err(|_| DiskError::Init)?;
        self.command(CMD3_SEND_RELATIVE_ADDR, 0).map_err(|_| DiskError::Init)?;

        // Deselect times out without a reply, which leaves the R6 from CMD3
        // in the buffer. The published RCA is read out of it afterwards.
        let _ = self.command(CMD7_SELECT_CARD, 0);
        let rca = u32::from_be_bytes([
            self.response[1],
            self.response[2],
            self.response[3],
            self.response[4],
        ]);

        self.command(CMD9_SEND_CSD, rca).map_err(|_| DiskError::Init)?;
        self.command(CMD7_SELECT_CARD, rca).map_err(|_| DiskError::Init)?;
        self.command(CMD55_APP_CMD, rca).map_err(|_| DiskError::Init)?;
        self.command(CMD6_SWITCH_FUNC, 0x02).map_err(|_| DiskError::Init)?;

        self.bus.set_speed(Speed::High);
        debug!(
            "card ready, v2: {}, high capacity: {}",
            self.card_type.v2(),
            self.card_type.high_capacity()
        );
        Ok(())
    }

    /// Send a command frame and read back its response.
    ///
    /// CMD18 returns immediately: its reply races the first data block, so
    /// the caller collects both from the data path.
    pub fn command(&mut self, cmd: u8, arg: u32) -> Result<(), DiskError> {
        let mut frame = [0u8; 5];
        frame[0] = cmd;
        frame[1..5].copy_from_slice(&arg.to_be_bytes());
        let crc = crc7(&frame) | 1;

        self.bus.set_bit_length(8);
        self.bus.cmd_write(0xFF);
        for &byte in frame.iter() {
            self.bus.cmd_write(byte);
        }
        self.bus.cmd_write(crc);

        if cmd == CMD18_READ_MULTIPLE_BLOCK {
            return Ok(());
        }
        self.read_response(cmd)
    }

    fn read_response(&mut self, cmd: u8) -> Result<(), DiskError> {
        let length = if cmd == CMD2_ALL_SEND_CID || cmd == CMD9_SEND_CSD { 17 } else { 6 };

        self.response[0] = self.bus.cmd_read();
        self.bus.set_bit_length(1);

        // Start bit plus the transmission bit, both zero.
        let mut polls = 0u32;
        while self.response[0] & 0xC0 != 0 {
            if polls == CMD_TIMEOUT {
                return Err(DiskError::CommandTimeout);
            }
            self.response[0] = self.bus.cmd_read();
            polls += 1;
        }

        self.bus.set_bit_length(8);
        for index in 1..length {
            self.response[index] = self.bus.cmd_read();
        }
        Ok(())
    }

    /// Position a multi-block read at `lba`, reusing the open session when it
    /// is already there.
    pub fn open_read(&mut self, lba: u32) -> Result<(), DiskError> {
        if self.mode == Mode::Reading && lba == self.address {
            return Ok(());
        }
        let _ = self.close();

        self.address = lba;
        let arg = if self.card_type.high_capacity() { lba } else { lba * SECTOR_SIZE as u32 };
        self.command(CMD18_READ_MULTIPLE_BLOCK, arg).map_err(|_| DiskError::ReadCommand)?;

        self.mode = Mode::Reading;
        Ok(())
    }

    /// Position a multi-block write at `lba`, reusing the open session when
    /// it is already there.
    pub fn open_write(&mut self, lba: u32) -> Result<(), DiskError> {
        if self.mode == Mode::Writing && lba == self.address {
            return Ok(());
        }
        let _ = self.close();

        self.address = lba;
        let arg = if self.card_type.high_capacity() { lba } else { lba * SECTOR_SIZE as u32 };
        self.command(CMD25_WRITE_MULTIPLE_BLOCK, arg).map_err(|_| DiskError::WriteCommand)?;

        self.mode = Mode::Writing;
        Ok(())
    }

    /// Stop the open transfer and wait out the data lines.
    pub fn close(&mut self) -> Result<(), DiskError> {
        if self.mode == Mode::Idle {
            return Ok(());
        }
        self.mode = Mode::Idle;
        self.command(CMD12_STOP_TRANSMISSION, 0)?;

        self.bus.set_bit_length(1);
        for _ in 0..3 {
            self.bus.dat_read();
        }
        self.bus.set_bit_length(2);
        for _ in 0..CLOSE_IDLE_TIMEOUT {
            if self.bus.dat_read() == 0xFF {
                break;
            }
        }
        Ok(())
    }

    /// Read `dst.len() / 512` sectors starting at `lba` into RAM.
    pub fn read_to_ram(&mut self, lba: u32, dst: &mut [u8]) -> Result<(), DiskError> {
        self.open_read(lba)?;
        self.address += (dst.len() / SECTOR_SIZE) as u32;
        self.bus.read_sectors(dst).map_err(|_| DiskError::ReadIo)
    }

    /// Stream `sectors` sectors starting at `lba` into cartridge address
    /// space without passing through RAM.
    pub fn read_to_rom(&mut self, lba: u32, cart_address: u32, sectors: u16) -> Result<(), DiskError> {
        self.open_read(lba)?;
        self.address += sectors as u32;
        self.bus.read_sectors_dma(cart_address, sectors).map_err(|_| DiskError::ReadIo)
    }

    /// Write `src.len() / 512` sectors starting at `lba`.
    pub fn write(&mut self, lba: u32, src: &[u8]) -> Result<(), DiskError> {
        self.open_write(lba)?;
        self.address += (src.len() / SECTOR_SIZE) as u32;
        self.bus.write_sectors(src).map_err(|fault| match fault {
            WriteFault::Busy => DiskError::WriteIo,
            WriteFault::Crc => DiskError::WriteCrc,
            WriteFault::Token | WriteFault::Idle => DiskError::WriteProtocol,
        })
    }
}
