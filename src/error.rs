/// USB link failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbError {
    /// The FPGA never finished the requested transfer; the request was
    /// cancelled with a NOP control write.
    Timeout,
}

/// Errors surfaced by the SD card protocol layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskError {
    /// Card initialization sequence failed.
    Init,
    /// No response start marker within the poll bound.
    CommandTimeout,
    /// Opening a read session failed.
    ReadCommand,
    /// Data stage of a read failed.
    ReadIo,
    /// Opening a write session failed.
    WriteCommand,
    /// Data stage of a write failed.
    WriteIo,
    /// The card rejected a written block with a CRC status token.
    WriteCrc,
    /// Unexpected data-response token or the card never released the line.
    WriteProtocol,
}
