//! Driver stack for an FPGA game-cartridge bridge: register-level bus
//! primitives, a bit-banged SD card protocol with 4-bit data framing, and a
//! chunked USB link used to stream data from a host PC into cartridge memory.

#![cfg_attr(not(test), no_std)]

pub mod bridge;
pub mod bus;
pub mod crc;
pub mod disk;
pub mod error;
pub mod fat;
pub mod host;
pub mod pi;
pub mod regs;
