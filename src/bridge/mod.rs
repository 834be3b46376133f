//! Register-level access to the cartridge FPGA: USB link and SDIO primitives
//! layered on the peripheral DMA port.

mod sdio;
mod usb;

pub use sdio::{DATA_TOKEN_TIMEOUT, WRITE_BUSY_TIMEOUT, WRITE_IDLE_TIMEOUT};
pub use usb::USB_TIMEOUT;

use crate::pi::PiDma;
use crate::regs;

/// Driver context for the FPGA register file.
///
/// Owns the DMA port together with the SDIO status-shadow register and the
/// record of which SDIO serial register was addressed last; all register
/// state lives here, nothing is process global.
pub struct Bridge<D> {
    dma: D,
    /// Shadow of the SDIO status register: bit length and speed.
    sd_cfg: u16,
    /// Last addressed SDIO serial register; drives the open-bus settling
    /// sequence when the next access goes elsewhere.
    sd_mode: Option<u16>,
}

impl<D: PiDma> Bridge<D> {
    pub fn new(dma: D) -> Self {
        Bridge { dma, sd_cfg: 0, sd_mode: None }
    }

    /// Unlock the register file and put the USB link and the SDIO block into
    /// a known state. Also the hard re-initialization path.
    pub fn init(&mut self) {
        self.reg_write(regs::REG_KEY, regs::KEY_UNLOCK);
        self.reg_write(regs::REG_SYS_CFG, 0);

        self.usb_flush();

        self.sd_cfg = 0;
        self.sd_mode = None;
        self.reg_write(regs::REG_SD_STATUS, 0);
    }

    pub fn reg_write(&mut self, reg: u16, value: u32) {
        self.dma.write(&value.to_be_bytes(), regs::reg_address(reg));
    }

    pub fn reg_read(&mut self, reg: u16) -> u32 {
        let mut bytes = [0u8; 4];
        self.dma.read(&mut bytes, regs::reg_address(reg));
        u32::from_be_bytes(bytes)
    }

    /// Raw copy into cartridge address space.
    pub fn mem_write(&mut self, src: &[u8], address: u32) {
        self.dma.write(src, address);
    }

    /// Raw copy out of cartridge address space.
    pub fn mem_read(&mut self, dst: &mut [u8], address: u32) {
        self.dma.read(dst, address);
    }

    pub fn dma_mut(&mut self) -> &mut D {
        &mut self.dma
    }

    pub fn free(self) -> D {
        self.dma
    }
}
