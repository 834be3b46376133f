//! Peripheral-interface DMA port.
//!
//! Every register access in this crate is a bus DMA transaction, not a plain
//! load/store: the CPU programs the PI engine with a RAM address, a cartridge
//! address and a length, then spins until the transfer completes.

/// Low level DMA engine seam.
///
/// Implementations must serialize transfers themselves: wait for any prior
/// transaction before programming a new one, and keep interrupts off for the
/// program-and-wait sequence so a reentrant access cannot corrupt the one in
/// flight. A stalled bus is fatal and is handled by the caller's own timeout
/// logic; this layer never retries.
pub trait PiDma {
    /// Copy `dst.len()` bytes from `pi_address` into RAM.
    fn read(&mut self, dst: &mut [u8], pi_address: u32);

    /// Copy `src` to `pi_address`.
    fn write(&mut self, src: &[u8], pi_address: u32);
}

impl<D: PiDma + ?Sized> PiDma for &mut D {
    fn read(&mut self, dst: &mut [u8], pi_address: u32) {
        (**self).read(dst, pi_address)
    }

    fn write(&mut self, src: &[u8], pi_address: u32) {
        (**self).write(src, pi_address)
    }
}

#[cfg(target_arch = "mips")]
pub use self::hw::PiPort;

#[cfg(target_arch = "mips")]
mod hw {
    use core::ptr::{read_volatile, write_volatile};

    use super::PiDma;

    const PI_RAM_ADDR: *mut u32 = 0xA460_0000 as *mut u32;
    const PI_CART_ADDR: *mut u32 = 0xA460_0004 as *mut u32;
    const PI_RD_LEN: *mut u32 = 0xA460_0008 as *mut u32;
    const PI_WR_LEN: *mut u32 = 0xA460_000C as *mut u32;
    const PI_STATUS: *mut u32 = 0xA460_0010 as *mut u32;

    const PI_STATUS_BUSY: u32 = 0x3;
    const PI_STATUS_CLEAR: u32 = 0x3;

    extern "C" {
        fn data_cache_hit_writeback(addr: *const u8, len: usize);
        fn data_cache_hit_writeback_invalidate(addr: *mut u8, len: usize);
        fn disable_interrupts();
        fn enable_interrupts();
    }

    /// The console's PI DMA engine.
    pub struct PiPort;

    impl PiPort {
        fn wait_dma() {
            unsafe { while read_volatile(PI_STATUS) & PI_STATUS_BUSY != 0 {} }
        }
    }

    impl PiDma for PiPort {
        fn read(&mut self, dst: &mut [u8], pi_address: u32) {
            let pi_address = pi_address & 0x1FFF_FFFF;
            unsafe {
                data_cache_hit_writeback_invalidate(dst.as_mut_ptr(), dst.len());
                disable_interrupts();
                Self::wait_dma();
                write_volatile(PI_STATUS, PI_STATUS_CLEAR);
                write_volatile(PI_RAM_ADDR, dst.as_mut_ptr() as u32);
                write_volatile(PI_CART_ADDR, pi_address);
                write_volatile(PI_WR_LEN, dst.len() as u32 - 1);
                Self::wait_dma();
                enable_interrupts();
            }
        }

        fn write(&mut self, src: &[u8], pi_address: u32) {
            let pi_address = pi_address & 0x1FFF_FFFF;
            unsafe {
                data_cache_hit_writeback(src.as_ptr(), src.len());
                disable_interrupts();
                Self::wait_dma();
                write_volatile(PI_STATUS, PI_STATUS_CLEAR);
                write_volatile(PI_RAM_ADDR, src.as_ptr() as u32);
                write_volatile(PI_CART_ADDR, pi_address);
                write_volatile(PI_RD_LEN, src.len() as u32 - 1);
                Self::wait_dma();
                enable_interrupts();
            }
        }
    }
}
