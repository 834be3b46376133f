//! Register-level model of the cartridge FPGA and an attached SD card, close
//! enough that the driver stack cannot tell it from hardware: sliding shift
//! registers on the serial lines, the tail-addressed USB FIFO window and the
//! sector DMA engine.

#![allow(dead_code)]

use std::collections::VecDeque;

use cart_bridge::bus::SECTOR_SIZE;
use cart_bridge::crc::{crc16_quad, crc7};
use cart_bridge::pi::PiDma;
use cart_bridge::regs;

pub const ROM_BASE: u32 = 0x1000_0000;
const ROM_SIZE: usize = 4 << 20;

/// Word the driver captures as the card address: the R6 payload left in the
/// response buffer by CMD3.
pub const RCA_WORD: u32 = 0xABCD_0520;

/// Reference content of a card sector that was never written.
pub fn block(lba: u32) -> [u8; SECTOR_SIZE] {
    let mut block = [0u8; SECTOR_SIZE];
    for (index, byte) in block.iter_mut().enumerate() {
        *byte = (lba.wrapping_mul(31) as u8).wrapping_add(index as u8);
    }
    block
}

/// SD card behind the SDIO serial lines.
///
/// The command line is modeled as a bit stream and the four data lines as a
/// nibble stream; reads shift into 8-bit sliding registers the way the FPGA
/// shifter does, so response framing reaches the driver bit-exact.
pub struct Card {
    pub v2: bool,
    pub hc: bool,
    /// ACMD41 rounds answered not-ready before the card comes up.
    pub acmd41_not_ready: u32,
    /// No card in the slot: every command goes unanswered.
    pub mute: bool,
    /// Data-response token presented after a written block.
    pub write_token: u8,
    /// Swallow written blocks without presenting a data response.
    pub write_stall: bool,

    pub commands: Vec<(u8, u32)>,
    /// 1-bit shifts performed on the command line.
    pub cmd_polls_1bit: u32,
    /// Blocks written to the card, in order.
    pub blocks: Vec<(u32, [u8; SECTOR_SIZE])>,

    frame: Vec<u8>,
    cmd_bits: VecDeque<bool>,
    cmd_shift: u8,
    dat_nibbles: VecDeque<u8>,
    dat_shift: u8,

    reading: bool,
    read_lba: u32,
    read_buf: Vec<u8>,
    read_served: usize,

    writing: bool,
    write_lba: u32,
    write_buf: Vec<u8>,
}

impl Card {
    pub fn new() -> Self {
        Card {
            v2: true,
            hc: true,
            acmd41_not_ready: 0,
            mute: false,
            write_token: 0b010,
            write_stall: false,
            commands: Vec::new(),
            cmd_polls_1bit: 0,
            blocks: Vec::new(),
            frame: Vec::new(),
            cmd_bits: VecDeque::new(),
            cmd_shift: 0xFF,
            dat_nibbles: VecDeque::new(),
            dat_shift: 0xFF,
            reading: false,
            read_lba: 0,
            read_buf: Vec::new(),
            read_served: 0,
            writing: false,
            write_lba: 0,
            write_buf: Vec::new(),
        }
    }

    pub fn legacy() -> Self {
        Card { v2: false, hc: false, ..Card::new() }
    }

    /// Current content of a block, written or pristine.
    pub fn block_content(&self, lba: u32) -> [u8; SECTOR_SIZE] {
        for (stored, data) in self.blocks.iter().rev() {
            if *stored == lba {
                return *data;
            }
        }
        block(lba)
    }

    fn lba_from_arg(&self, arg: u32) -> u32 {
        if self.hc {
            arg
        } else {
            arg / SECTOR_SIZE as u32
        }
    }

    /// Stage a response: idle lead-in, then the bytes MSB-first.
    fn respond(&mut self, bytes: &[u8]) {
        for _ in 0..8 {
            self.cmd_bits.push_back(true);
        }
        for &byte in bytes {
            for bit in (0..8).rev() {
                self.cmd_bits.push_back(byte >> bit & 1 != 0);
            }
        }
    }

    fn command(&mut self, cmd: u8, arg: u32) {
        self.commands.push((cmd, arg));
        if self.mute {
            return;
        }
        match cmd {
            // CMD0: no reply in idle state
            0x40 => {}
            // CMD8, version 2.0 cards only
            0x48 => {
                if self.v2 {
                    self.respond(&[0x08, 0x00, 0x00, 0x01, 0xAA, 0xFF]);
                }
            }
            // CMD55: card status with the app-command bit
            0x77 => self.respond(&[0x37, 0x00, 0x00, 0x01, 0x20, 0xFF]),
            // ACMD41: OCR, ready and capacity in the top byte
            0x69 => {
                let ocr = if self.acmd41_not_ready > 0 {
                    self.acmd41_not_ready -= 1;
                    0x00
                } else if self.hc {
                    0xC0
                } else {
                    0x80
                };
                self.respond(&[0x3F, ocr, 0xFF, 0x80, 0x00, 0xFF]);
            }
            // CMD2: CID, 17 byte response
            0x42 => self.respond(&[
                0x3F, 0x03, 0x53, 0x44, 0x53, 0x49, 0x4D, 0x30, 0x31, 0x80, 0x00, 0x00, 0x12,
                0x00, 0xC5, 0x7F, 0xFF,
            ]),
            // CMD3: R6 with the published card address
            0x43 => self.respond(&[0x03, 0xAB, 0xCD, 0x05, 0x20, 0xFF]),
            // CMD7: select answers, deselect stays silent
            0x47 => {
                if arg != 0 {
                    self.respond(&[0x07, 0x00, 0x00, 0x07, 0x00, 0xFF]);
                }
            }
            // CMD9: CSD, 17 byte response
            0x49 => self.respond(&[
                0x3F, 0x40, 0x0E, 0x00, 0x32, 0x5B, 0x59, 0x00, 0x00, 0x3B, 0x37, 0x7F, 0x80,
                0x0A, 0x40, 0x40, 0xFF,
            ]),
            // CMD6: switch function
            0x46 => self.respond(&[0x06, 0x00, 0x00, 0x00, 0x00, 0xFF]),
            // CMD12: stop, then busy on the data lines
            0x4C => {
                self.respond(&[0x0C, 0x00, 0x00, 0x01, 0x00, 0xFF]);
                self.reading = false;
                self.writing = false;
                self.read_buf.clear();
                self.read_served = 0;
                self.write_buf.clear();
                self.dat_nibbles.clear();
                self.dat_nibbles.push_back(0x0);
                self.dat_nibbles.push_back(0x0);
            }
            // CMD18: reply races the first block, so none is staged
            0x52 => {
                self.reading = true;
                self.read_lba = self.lba_from_arg(arg);
                self.read_buf.clear();
                self.read_served = 0;
                self.dat_nibbles.clear();
                self.stage_read_token();
            }
            // CMD25
            0x59 => {
                self.writing = true;
                self.write_lba = self.lba_from_arg(arg);
                self.write_buf.clear();
                self.respond(&[0x19, 0x00, 0x00, 0x07, 0x00, 0xFF]);
            }
            _ => {}
        }
    }

    fn stage_read_token(&mut self) {
        self.dat_nibbles.push_back(0xF);
        self.dat_nibbles.push_back(0x0);
    }

    /// One byte clocked out on the command line by the host.
    pub fn cmd_byte(&mut self, byte: u8) {
        if self.frame.is_empty() && byte == 0xFF {
            return;
        }
        self.frame.push(byte);
        if self.frame.len() == 6 {
            assert_eq!(self.frame[5], crc7(&self.frame[..5]) | 1, "bad command crc");
            let cmd = self.frame[0];
            let arg =
                u32::from_be_bytes([self.frame[1], self.frame[2], self.frame[3], self.frame[4]]);
            self.frame.clear();
            self.command(cmd, arg);
        }
    }

    /// Shift `bits` bits in from the command line.
    pub fn cmd_shift_in(&mut self, bits: u16) -> u8 {
        if bits == 1 {
            self.cmd_polls_1bit += 1;
        }
        for _ in 0..bits {
            let bit = self.cmd_bits.pop_front().unwrap_or(true);
            self.cmd_shift = self.cmd_shift << 1 | bit as u8;
        }
        self.cmd_shift
    }

    /// Shift `count` nibbles in from the data lines.
    pub fn dat_shift_in(&mut self, count: u16) -> u8 {
        for _ in 0..count {
            let nibble = self.dat_nibbles.pop_front().unwrap_or(0xF);
            self.dat_shift = self.dat_shift << 4 | nibble;
        }
        self.dat_shift
    }

    /// Serve part of the current read block through the aligned data window.
    pub fn ard_read(&mut self, dst: &mut [u8]) {
        assert!(self.reading, "data read without an open read session");
        if self.read_buf.is_empty() {
            let data = self.block_content(self.read_lba);
            self.read_buf.extend_from_slice(&data);
            self.read_buf.extend_from_slice(&crc16_quad(&data));
            self.read_served = 0;
        }
        dst.copy_from_slice(&self.read_buf[self.read_served..self.read_served + dst.len()]);
        self.read_served += dst.len();
        if self.read_served == SECTOR_SIZE + 8 {
            self.read_buf.clear();
            self.read_served = 0;
            self.read_lba += 1;
            self.stage_read_token();
        }
    }

    /// One whole block for the DMA engine, token handled by the hardware.
    pub fn take_sector(&mut self) -> [u8; SECTOR_SIZE] {
        assert!(self.reading, "dma read without an open read session");
        self.dat_nibbles.clear();
        let data = self.block_content(self.read_lba);
        self.read_lba += 1;
        self.stage_read_token();
        data
    }

    /// Accept part of a written block through the aligned data window.
    pub fn ard_write(&mut self, src: &[u8]) {
        assert!(self.writing, "data write without an open write session");
        self.write_buf.extend_from_slice(src);
        if self.write_buf.len() == SECTOR_SIZE + 8 {
            let mut data = [0u8; SECTOR_SIZE];
            data.copy_from_slice(&self.write_buf[..SECTOR_SIZE]);
            assert_eq!(&self.write_buf[SECTOR_SIZE..], &crc16_quad(&data)[..], "bad data crc");
            self.write_buf.clear();
            self.blocks.push((self.write_lba, data));
            self.write_lba += 1;

            if !self.write_stall {
                // start bit, three token bits on the first line, then busy
                self.dat_nibbles.push_back(0xE);
                for bit in (0..3).rev() {
                    self.dat_nibbles.push_back(0xE | self.write_token >> bit & 1);
                }
                self.dat_nibbles.push_back(0x0);
            }
        }
    }
}

/// The FPGA register file with an attached [`Card`] and USB endpoint.
pub struct Fpga {
    pub card: Card,
    /// Bus transactions performed, reads and writes both.
    pub ops: u64,
    pub unlocked: bool,
    pub sys_cfg: u32,
    pub sd_cfg: u16,
    /// Settling probes observed on the SDIO serial registers, in order.
    pub probes: Vec<u16>,
    /// Fail the next hardware DMA transfer.
    pub dma_error: bool,

    /// Bytes queued by the host, not yet fetched by the cartridge.
    pub host_tx: VecDeque<u8>,
    /// Bytes the host received from the cartridge.
    pub host_rx: Vec<u8>,
    /// Host side of the USB channel is up.
    pub powered: bool,
    /// FIFO window base addresses of issued read transfers.
    pub rd_windows: Vec<u16>,
    /// FIFO window base addresses of issued write transfers.
    pub wr_windows: Vec<u16>,
    /// In-flight transfers cancelled by a NOP control write.
    pub nop_cancels: u32,

    mem: Vec<u8>,
    cmd_latch: u8,
    dat_latch: u8,
    dma_addr: u32,
    dma_len: u32,
    dma_pending: bool,
    window: [u8; SECTOR_SIZE],
    active: bool,
}

impl Fpga {
    pub fn new(card: Card) -> Self {
        Fpga {
            card,
            ops: 0,
            unlocked: false,
            sys_cfg: 0,
            sd_cfg: 0,
            probes: Vec::new(),
            dma_error: false,
            host_tx: VecDeque::new(),
            host_rx: Vec::new(),
            powered: true,
            rd_windows: Vec::new(),
            wr_windows: Vec::new(),
            nop_cancels: 0,
            mem: vec![0; ROM_SIZE],
            cmd_latch: 0xFF,
            dat_latch: 0xFF,
            dma_addr: 0,
            dma_len: 0,
            dma_pending: false,
            window: [0; SECTOR_SIZE],
            active: false,
        }
    }

    pub fn rom(&self, address: u32, len: usize) -> &[u8] {
        let offset = (address - ROM_BASE) as usize;
        &self.mem[offset..offset + len]
    }

    fn reg_read(&mut self, reg: u16) -> u32 {
        match reg {
            regs::REG_USB_CFG => {
                let mut status = regs::UsbStatus::empty();
                if self.powered {
                    status |= regs::UsbStatus::PWR;
                }
                if self.host_tx.is_empty() {
                    status |= regs::UsbStatus::RXF;
                }
                if self.active {
                    status |= regs::UsbStatus::ACT;
                }
                status.bits()
            }
            regs::REG_SD_STATUS => self.sd_cfg as u32,
            regs::REG_SD_CMD_RD => self.cmd_latch as u32,
            regs::REG_SD_DAT_RD => self.dat_latch as u32,
            regs::REG_DMA_STA => self.dma_status(),
            _ => 0,
        }
    }

    fn reg_write(&mut self, reg: u16, value: u32) {
        match reg {
            regs::REG_KEY => {
                if value == regs::KEY_UNLOCK {
                    self.unlocked = true;
                }
            }
            regs::REG_SYS_CFG => self.sys_cfg = value,
            regs::REG_USB_CFG => self.usb_command(value),
            regs::REG_SD_STATUS => self.sd_cfg = value as u16,
            regs::REG_DMA_ADDR => self.dma_addr = value,
            regs::REG_DMA_LEN => {
                self.dma_len = value;
                self.dma_pending = true;
            }
            regs::REG_SD_CMD_RD | regs::REG_SD_CMD_WR | regs::REG_SD_DAT_RD
            | regs::REG_SD_DAT_WR => self.sd_serial(reg, value),
            _ => {}
        }
    }

    fn sd_serial(&mut self, reg: u16, value: u32) {
        let bits = self.sd_cfg & regs::SD_CFG_BITLEN;
        if bits == 0 {
            self.probes.push(reg);
            return;
        }
        match reg {
            regs::REG_SD_CMD_WR => {
                // frames go out a byte at a time; narrower writes only clock
                // idle bits between frames
                if bits == 8 {
                    self.card.cmd_byte(value as u8);
                }
            }
            regs::REG_SD_CMD_RD => self.cmd_latch = self.card.cmd_shift_in(bits),
            regs::REG_SD_DAT_RD => self.dat_latch = self.card.dat_shift_in(bits),
            // host-driven tokens on the data lines, nothing to model
            regs::REG_SD_DAT_WR => {}
            _ => unreachable!(),
        }
    }

    fn dma_status(&mut self) -> u32 {
        if !self.dma_pending {
            return 0;
        }
        self.dma_pending = false;
        if self.dma_error {
            return regs::DmaStatus::ERROR.bits();
        }
        let mut address = self.dma_addr;
        for _ in 0..self.dma_len {
            let sector = self.card.take_sector();
            let offset = (address - ROM_BASE) as usize;
            self.mem[offset..offset + SECTOR_SIZE].copy_from_slice(&sector);
            address += SECTOR_SIZE as u32;
        }
        0
    }

    fn usb_command(&mut self, value: u32) {
        let command = value & !0x1FF;
        let offset = (value & 0x1FF) as usize;
        match command {
            regs::USB_CMD_RD => {
                self.rd_windows.push(offset as u16);
                if self.host_tx.len() >= SECTOR_SIZE - offset {
                    for slot in self.window[offset..].iter_mut() {
                        *slot = self.host_tx.pop_front().unwrap();
                    }
                    self.active = false;
                } else {
                    self.active = true;
                }
            }
            regs::USB_CMD_WR => {
                self.wr_windows.push(offset as u16);
                self.host_rx.extend_from_slice(&self.window[offset..]);
                self.active = false;
            }
            regs::USB_CMD_RD_NOP | regs::USB_CMD_WR_NOP => {
                if self.active {
                    self.nop_cancels += 1;
                }
                self.active = false;
            }
            _ => {}
        }
    }
}

impl PiDma for Fpga {
    fn read(&mut self, dst: &mut [u8], pi_address: u32) {
        self.ops += 1;
        if pi_address & 0xFFFF_0000 == regs::REG_BASE {
            let reg = (pi_address & 0xFFFF) as u16;
            match reg {
                0x0400..=0x05FF => {
                    let offset = (reg - regs::REG_USB_DAT) as usize;
                    dst.copy_from_slice(&self.window[offset..offset + dst.len()]);
                }
                regs::REG_SDIO_ARD => self.card.ard_read(dst),
                _ => {
                    assert_eq!(dst.len(), 4, "register reads are one word");
                    let value = self.reg_read(reg);
                    dst.copy_from_slice(&value.to_be_bytes());
                }
            }
        } else {
            let offset = (pi_address - ROM_BASE) as usize;
            dst.copy_from_slice(&self.mem[offset..offset + dst.len()]);
        }
    }

    fn write(&mut self, src: &[u8], pi_address: u32) {
        self.ops += 1;
        if pi_address & 0xFFFF_0000 == regs::REG_BASE {
            let reg = (pi_address & 0xFFFF) as u16;
            match reg {
                0x0400..=0x05FF => {
                    let offset = (reg - regs::REG_USB_DAT) as usize;
                    self.window[offset..offset + src.len()].copy_from_slice(src);
                }
                regs::REG_SDIO_ARD => self.card.ard_write(src),
                _ => {
                    assert_eq!(src.len(), 4, "register writes are one word");
                    let mut bytes = [0u8; 4];
                    bytes.copy_from_slice(src);
                    self.reg_write(reg, u32::from_be_bytes(bytes));
                }
            }
        } else {
            let offset = (pi_address - ROM_BASE) as usize;
            self.mem[offset..offset + src.len()].copy_from_slice(src);
        }
    }
}
