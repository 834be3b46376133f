use log::warn;

use crate::bus::SECTOR_SIZE;
use crate::error::UsbError;
use crate::pi::PiDma;
use crate::regs::{self, UsbStatus};

use super::Bridge;

/// Status polls before an in-flight USB transfer is declared stuck.
pub const USB_TIMEOUT: u32 = 8192;

impl<D: PiDma> Bridge<D> {
    /// Host data is waiting and the channel is powered.
    pub fn usb_can_read(&mut self) -> bool {
        let status = UsbStatus::from_bits_truncate(self.reg_read(regs::REG_USB_CFG));
        status & (UsbStatus::PWR | UsbStatus::RXF) == UsbStatus::PWR
    }

    /// Transmit FIFO has room and the channel is powered.
    pub fn usb_can_write(&mut self) -> bool {
        let status = UsbStatus::from_bits_truncate(self.reg_read(regs::REG_USB_CFG));
        status & (UsbStatus::PWR | UsbStatus::TXE) == UsbStatus::PWR
    }

    fn usb_busy(&mut self) -> Result<(), UsbError> {
        for _ in 0..USB_TIMEOUT {
            if self.reg_read(regs::REG_USB_CFG) & UsbStatus::ACT.bits() == 0 {
                return Ok(());
            }
        }
        self.reg_write(regs::REG_USB_CFG, regs::USB_CMD_RD_NOP);
        warn!("usb transfer stuck, cancelled");
        Err(UsbError::Timeout)
    }

    /// Receive `dst.len()` bytes from the host in chunks of up to 512.
    ///
    /// A short chunk occupies the tail of the FIFO window: the window address
    /// is `512 - chunk`, and the FPGA keeps receiving until its buffer
    /// address reaches 512.
    pub fn usb_read(&mut self, dst: &mut [u8]) -> Result<(), UsbError> {
        let mut offset = 0;
        let mut remain = dst.len();

        while remain > 0 {
            let chunk = remain.min(SECTOR_SIZE);
            let window = (SECTOR_SIZE - chunk) as u16;

            self.reg_write(regs::REG_USB_CFG, regs::USB_CMD_RD | window as u32);
            self.usb_busy()?;
            self.dma
                .read(&mut dst[offset..offset + chunk], regs::reg_address(regs::REG_USB_DAT + window));

            offset += chunk;
            remain -= chunk;
        }
        Ok(())
    }

    /// Send `src.len()` bytes to the host in chunks of up to 512.
    pub fn usb_write(&mut self, src: &[u8]) -> Result<(), UsbError> {
        self.reg_write(regs::REG_USB_CFG, regs::USB_CMD_WR_NOP);

        let mut offset = 0;
        let mut remain = src.len();

        while remain > 0 {
            let chunk = remain.min(SECTOR_SIZE);
            let window = (SECTOR_SIZE - chunk) as u16;

            self.dma
                .write(&src[offset..offset + chunk], regs::reg_address(regs::REG_USB_DAT + window));
            // fixed 512 stride, matches the host tool; only the final chunk
            // may be short
            offset += SECTOR_SIZE;

            self.reg_write(regs::REG_USB_CFG, regs::USB_CMD_WR | window as u32);
            self.usb_busy()?;

            remain -= chunk;
        }
        Ok(())
    }

    /// Request a full 512-byte block from the host and return immediately.
    ///
    /// Lets the caller overlap host latency with processing: issue the next
    /// [`usb_read_start`](Self::usb_read_start) before consuming the previous
    /// block through [`usb_read_end`](Self::usb_read_end).
    pub fn usb_read_start(&mut self) {
        self.reg_write(regs::REG_USB_CFG, regs::USB_CMD_RD);
    }

    /// Wait for a started block request and copy it out of the FIFO window.
    pub fn usb_read_end(&mut self, dst: &mut [u8; SECTOR_SIZE]) -> Result<(), UsbError> {
        self.usb_busy()?;
        self.dma.read(dst, regs::reg_address(regs::REG_USB_DAT));
        Ok(())
    }

    /// Cancel any USB activity and drain stale host data.
    pub fn usb_flush(&mut self) {
        self.reg_write(regs::REG_USB_CFG, regs::USB_CMD_RD_NOP);

        let mut sink = [0u8; SECTOR_SIZE];
        while self.usb_can_read() {
            if self.usb_read(&mut sink).is_err() {
                break;
            }
        }
    }
}
