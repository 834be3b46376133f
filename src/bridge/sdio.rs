use crate::bus::{ReadFault, SectorRead, SectorWrite, Sdio, Speed, WriteFault, SECTOR_SIZE};
use crate::crc::crc16_quad;
use crate::pi::PiDma;
use crate::regs::{self, DmaStatus};

use super::Bridge;

/// Data-line polls for the read start token.
pub const DATA_TOKEN_TIMEOUT: u32 = 65535;
/// Polls for the card to present a data-response token after a block.
pub const WRITE_BUSY_TIMEOUT: u32 = 1024;
/// Polls for the card to release the busy line after a written block.
pub const WRITE_IDLE_TIMEOUT: u32 = 65535;

impl<D: PiDma> Bridge<D> {
    /// Settle the open bus shared by the SDIO serial registers.
    ///
    /// Switching between the command/data read/write registers needs a dummy
    /// probe access before real traffic: zero bit length, one `0xFFFF` write
    /// to the register about to be used, then the caller's configuration
    /// restored. Skipped when the register matches the previous access.
    fn sd_switch_mode(&mut self, reg: u16) {
        if self.sd_mode == Some(reg) {
            return;
        }
        self.sd_mode = Some(reg);

        let cfg = self.sd_cfg;
        self.set_bit_length(0);
        self.reg_write(reg, 0xFFFF);
        self.sd_cfg = cfg;
        self.reg_write(regs::REG_SD_STATUS, cfg as u32);
    }

    /// Wait for the SDIO shifter. The hardware always resolves; the bound
    /// only exists to fail loudly in harnesses.
    fn sd_busy(&mut self) {
        let mut spins = 0u32;
        while self.reg_read(regs::REG_SD_STATUS) & regs::SD_STA_BUSY != 0 {
            spins += 1;
            debug_assert!(spins < 10_000_000, "sdio shifter never went idle");
        }
    }
}

impl<D: PiDma> Sdio for Bridge<D> {
    fn set_speed(&mut self, speed: Speed) {
        match speed {
            Speed::Low => self.sd_cfg &= !regs::SD_CFG_SPD,
            Speed::High => self.sd_cfg |= regs::SD_CFG_SPD,
        }
        self.reg_write(regs::REG_SD_STATUS, self.sd_cfg as u32);
    }

    fn set_bit_length(&mut self, bits: u8) {
        self.sd_cfg = self.sd_cfg & !regs::SD_CFG_BITLEN | bits as u16 & regs::SD_CFG_BITLEN;
        self.reg_write(regs::REG_SD_STATUS, self.sd_cfg as u32);
    }

    fn cmd_write(&mut self, value: u8) {
        self.sd_switch_mode(regs::REG_SD_CMD_WR);
        self.reg_write(regs::REG_SD_CMD_WR, value as u32);
        self.sd_busy();
    }

    fn cmd_read(&mut self) -> u8 {
        self.sd_switch_mode(regs::REG_SD_CMD_RD);
        self.reg_write(regs::REG_SD_CMD_RD, 0xFFFF);
        self.sd_busy();
        self.reg_read(regs::REG_SD_CMD_RD) as u8
    }

    fn dat_write(&mut self, value: u8) {
        self.sd_switch_mode(regs::REG_SD_DAT_WR);
        self.reg_write(regs::REG_SD_DAT_WR, 0x00FF | (value as u32) << 8);
    }

    fn dat_read(&mut self) -> u8 {
        self.sd_switch_mode(regs::REG_SD_DAT_RD);
        self.reg_write(regs::REG_SD_DAT_RD, 0xFFFF);
        self.reg_read(regs::REG_SD_DAT_RD) as u8
    }
}

impl<D: PiDma> SectorRead for Bridge<D> {
    fn read_sectors(&mut self, dst: &mut [u8]) -> Result<(), ReadFault> {
        for sector in dst.chunks_exact_mut(SECTOR_SIZE) {
            self.set_bit_length(1);
            let mut polls = 0u32;
            while self.dat_read() != 0xF0 {
                polls += 1;
                if polls == DATA_TOKEN_TIMEOUT {
                    return Err(ReadFault::Token);
                }
            }

            self.set_bit_length(4);
            self.sd_switch_mode(regs::REG_SD_DAT_RD);
            self.dma.read(sector, regs::reg_address(regs::REG_SDIO_ARD));

            let mut crc = [0u8; 8];
            self.dma.read(&mut crc, regs::reg_address(regs::REG_SDIO_ARD)); // not checked
        }
        Ok(())
    }

    fn read_sectors_dma(&mut self, dst: u32, sectors: u16) -> Result<(), ReadFault> {
        self.reg_write(regs::REG_DMA_ADDR, dst);
        self.reg_write(regs::REG_DMA_LEN, sectors as u32);
        self.sd_switch_mode(regs::REG_SD_DAT_RD);

        let mut status = DmaStatus::BUSY;
        while status.contains(DmaStatus::BUSY) {
            status = DmaStatus::from_bits_truncate(self.reg_read(regs::REG_DMA_STA));
        }
        if status.contains(DmaStatus::ERROR) {
            return Err(ReadFault::Dma);
        }
        Ok(())
    }
}

impl<D: PiDma> SectorWrite for Bridge<D> {
    fn write_sectors(&mut self, src: &[u8]) -> Result<(), WriteFault> {
        for sector in src.chunks_exact(SECTOR_SIZE) {
            let crc = crc16_quad(sector);

            self.set_bit_length(2);
            self.dat_write(0xFF);
            self.dat_write(0xF0);

            self.set_bit_length(4);
            self.dma.write(sector, regs::reg_address(regs::REG_SDIO_ARD));
            self.dma.write(&crc, regs::reg_address(regs::REG_SDIO_ARD));

            self.set_bit_length(1);
            self.dat_write(0xFF);

            let mut polls = 0u32;
            loop {
                if self.dat_read() & 1 == 0 {
                    break;
                }
                if polls == WRITE_BUSY_TIMEOUT {
                    return Err(WriteFault::Busy);
                }
                polls += 1;
            }

            let mut token = 0u8;
            for _ in 0..3 {
                token = token << 1 | self.dat_read() & 1;
            }
            match token & 7 {
                0b010 => {}
                0b101 => return Err(WriteFault::Crc),
                _ => return Err(WriteFault::Token),
            }

            let mut polls = 0u32;
            while self.dat_read() != 0xFF {
                if polls == WRITE_IDLE_TIMEOUT {
                    return Err(WriteFault::Idle);
                }
                polls += 1;
            }
        }
        Ok(())
    }
}
