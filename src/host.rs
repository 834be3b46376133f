//! Host command channel over the USB link.
//!
//! The host tool drives the cartridge with fixed 16 byte frames: a `cmd`
//! marker, an opcode and up to three big-endian words of payload. Payload
//! data for memory writes follows as raw 512 byte blocks.

use log::debug;

use crate::bridge::Bridge;
use crate::bus::SECTOR_SIZE;
use crate::error::UsbError;
use crate::pi::PiDma;

pub const FRAME_SIZE: usize = 16;

const MARKER: &[u8; 3] = b"cmd";

const OP_PROBE: u8 = b't';
const OP_START: u8 = b's';
const OP_FILL: u8 = b'c';
const OP_WRITE: u8 = b'W';

/// Parsed host command frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Presence check while the host scans for the device.
    Probe,
    /// Leave the service loop and start the program at `address`.
    Start { address: u32 },
    /// Pattern-fill `sectors` sectors of cartridge memory.
    Fill { address: u32, sectors: u32, value: u32 },
    /// Receive `sectors` sectors of host data into cartridge memory.
    Write { address: u32, sectors: u32 },
}

impl Command {
    /// Decode one frame. Anything without the marker or with an unknown
    /// opcode is noise on the serial channel and yields `None`.
    pub fn parse(frame: &[u8; FRAME_SIZE]) -> Option<Command> {
        if &frame[..3] != MARKER {
            return None;
        }
        let address = be32(&frame[4..8]);
        match frame[3] {
            OP_PROBE => Some(Command::Probe),
            OP_START => Some(Command::Start { address }),
            OP_FILL => {
                Some(Command::Fill { address, sectors: be32(&frame[8..12]), value: be32(&frame[12..16]) })
            }
            OP_WRITE => Some(Command::Write { address, sectors: be32(&frame[8..12]) }),
            _ => None,
        }
    }
}

/// Request to hand control to a freshly loaded program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Boot {
    pub address: u32,
}

fn be32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Poll the USB link once and execute a pending host command.
///
/// Returns a [`Boot`] request when the host asked to start a program; the
/// caller owns the decision to leave its service loop.
pub fn service<D: PiDma>(bridge: &mut Bridge<D>) -> Result<Option<Boot>, UsbError> {
    if !bridge.usb_can_read() {
        return Ok(None);
    }

    let mut frame = [0u8; FRAME_SIZE];
    bridge.usb_read(&mut frame)?;

    let command = match Command::parse(&frame) {
        Some(command) => command,
        None => return Ok(None),
    };
    debug!("host command: {:?}", command);

    match command {
        Command::Probe => {
            respond(bridge, 0)?;
            Ok(None)
        }
        Command::Start { address } => Ok(Some(Boot { address })),
        Command::Fill { address, sectors, value } => {
            fill(bridge, address, sectors, value);
            Ok(None)
        }
        Command::Write { address, sectors } => {
            rom_write(bridge, address, sectors)?;
            Ok(None)
        }
    }
}

/// Acknowledge a host command with a `cmdr` frame carrying `status`.
fn respond<D: PiDma>(bridge: &mut Bridge<D>, status: u8) -> Result<(), UsbError> {
    let mut frame = [0u8; FRAME_SIZE];
    frame[..3].copy_from_slice(MARKER);
    frame[3] = b'r';
    frame[4] = status;
    bridge.usb_write(&frame)
}

/// Fill cartridge memory with a repeating 32 bit pattern, one sector at a
/// time. Used to pad short program images up to a checksummable size.
fn fill<D: PiDma>(bridge: &mut Bridge<D>, mut address: u32, sectors: u32, value: u32) {
    let mut pattern = [0u8; SECTOR_SIZE];
    for word in pattern.chunks_exact_mut(4) {
        word.copy_from_slice(&value.to_be_bytes());
    }

    for _ in 0..sectors {
        bridge.mem_write(&pattern, address);
        address += SECTOR_SIZE as u32;
    }
}

/// Stream host data into cartridge memory, overlapping USB receive of the
/// next block with the memory write of the previous one.
fn rom_write<D: PiDma>(bridge: &mut Bridge<D>, mut address: u32, sectors: u32) -> Result<(), UsbError> {
    if sectors == 0 {
        return Ok(());
    }

    let mut block = [0u8; SECTOR_SIZE];
    bridge.usb_read_start();

    for remain in (0..sectors).rev() {
        bridge.usb_read_end(&mut block)?;
        if remain != 0 {
            bridge.usb_read_start();
        }
        bridge.mem_write(&block, address);
        address += SECTOR_SIZE as u32;
    }
    Ok(())
}
