//! Register map of the cartridge FPGA.
//!
//! Offsets are within the peripheral window at [`REG_BASE`]. Every offset here
//! is fixed by the FPGA bitstream and must not change.

use bitflags::bitflags;

pub const REG_BASE: u32 = 0x1F80_0000;

/// Full bus address of a register.
pub const fn reg_address(reg: u16) -> u32 {
    REG_BASE | reg as u32
}

pub const REG_USB_CFG: u16 = 0x0004;
/// 512 byte USB FIFO window.
pub const REG_USB_DAT: u16 = 0x0400;

pub const REG_SYS_CFG: u16 = 0x8000;
pub const REG_KEY: u16 = 0x8004;
/// DMA status on read, DMA cartridge address on write.
pub const REG_DMA_STA: u16 = 0x8008;
pub const REG_DMA_ADDR: u16 = 0x8008;
pub const REG_DMA_LEN: u16 = 0x800C;

/// SDIO sub-block. The four serial-line registers share a physically open bus
/// and need a settling access when switching between them.
pub const REG_SDIO: u16 = 0x8020;
pub const REG_SD_CMD_RD: u16 = REG_SDIO + 0x00 * 4;
pub const REG_SD_CMD_WR: u16 = REG_SDIO + 0x01 * 4;
pub const REG_SD_DAT_RD: u16 = REG_SDIO + 0x02 * 4;
pub const REG_SD_DAT_WR: u16 = REG_SDIO + 0x03 * 4;
pub const REG_SD_STATUS: u16 = REG_SDIO + 0x04 * 4;
/// Aligned SDIO data window, 4-bit wide transfers.
pub const REG_SDIO_ARD: u16 = 0x8200;

/// Written to [`REG_KEY`] to unlock the register file.
pub const KEY_UNLOCK: u32 = 0xAA55;

/// Bit length field of the SDIO status register: bits shifted per access.
pub const SD_CFG_BITLEN: u16 = 0x000F;
/// Clock speed select, set for high speed.
pub const SD_CFG_SPD: u16 = 0x0010;
/// SDIO shifter busy.
pub const SD_STA_BUSY: u32 = 0x0080;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DmaStatus: u32 {
        const BUSY = 0x0001;
        const ERROR = 0x0002;
        const LOCK = 0x0080;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbStatus: u32 {
        /// Transfer in progress.
        const ACT = 0x0200;
        /// Receive FIFO empty.
        const RXF = 0x0400;
        /// Transmit FIFO full.
        const TXE = 0x0800;
        /// Host side channel powered.
        const PWR = 0x1000;
        const BSY = 0x2000;
    }
}

const USB_LE_CFG: u32 = 0x8000;
const USB_LE_CTR: u32 = 0x4000;
const USB_CFG_RD: u32 = 0x0400;
const USB_CFG_WR: u32 = 0x0000;
const USB_CFG_ACT: u32 = 0x0200;

/// Read direction, no transfer: cancels USB activity.
pub const USB_CMD_RD_NOP: u32 = USB_LE_CFG | USB_LE_CTR | USB_CFG_RD;
pub const USB_CMD_RD: u32 = USB_LE_CFG | USB_LE_CTR | USB_CFG_RD | USB_CFG_ACT;
pub const USB_CMD_WR_NOP: u32 = USB_LE_CFG | USB_LE_CTR | USB_CFG_WR;
pub const USB_CMD_WR: u32 = USB_LE_CFG | USB_LE_CTR | USB_CFG_WR | USB_CFG_ACT;
