//! Protocol-facing seam between the SD card state machine and the register
//! level bridge.

pub const SECTOR_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speed {
    /// Mandatory for the whole card identification phase.
    Low,
    High,
}

/// Data stage fault of a sector read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFault {
    /// No start token within the poll bound.
    Token,
    /// The hardware DMA engine flagged an error.
    Dma,
}

/// Data stage fault of a sector write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFault {
    /// Card never presented a data-response token.
    Busy,
    /// Data-response token reported a CRC mismatch.
    Crc,
    /// Unexpected data-response token.
    Token,
    /// Card never reported not-busy after the block.
    Idle,
}

/// Serial-line primitives of the SDIO block.
pub trait Sdio {
    fn set_speed(&mut self, speed: Speed);

    /// Select how many bits one register access clocks: 1, 2, 4 or 8.
    fn set_bit_length(&mut self, bits: u8);

    /// Clock one unit out on the command line.
    fn cmd_write(&mut self, value: u8);

    /// Clock one unit in from the command line.
    fn cmd_read(&mut self) -> u8;

    /// Clock one unit out on the data lines.
    fn dat_write(&mut self, value: u8);

    /// Clock one unit in from the data lines.
    fn dat_read(&mut self) -> u8;
}

/// Sustained multi-sector transfer out of an open read session.
pub trait SectorRead {
    /// Receive `dst.len() / 512` sectors into RAM. `dst` must be a multiple
    /// of the sector size.
    fn read_sectors(&mut self, dst: &mut [u8]) -> Result<(), ReadFault>;

    /// Stream `sectors` sectors straight into cartridge address space through
    /// the hardware DMA engine.
    fn read_sectors_dma(&mut self, dst: u32, sectors: u16) -> Result<(), ReadFault>;
}

/// Sustained multi-sector transfer into an open write session.
pub trait SectorWrite {
    /// Send `src.len() / 512` sectors. `src` must be a multiple of the sector
    /// size.
    fn write_sectors(&mut self, src: &[u8]) -> Result<(), WriteFault>;
}
