//! Modbus RTU protocol support
//!
//! Only the subset the relay boards speak: read coils (0x01), write single
//! coil (0x05), write multiple coils (0x0F), and the vendor timed-pulse
//! extension of 0x05. Frame building and parsing live in [`frame`]; size
//! limits and register constants in [`constants`].

pub mod constants;
pub mod frame;

pub use frame::{
    crc16, decode, decode_coil_status, encode_read_coils, encode_timed_pulse,
    encode_write_multiple_coils, encode_write_single_coil, FunctionCode, RtuFrame,
};

/// Human-readable description for a Modbus exception code
pub fn exception_description(exception_code: u8) -> &'static str {
    match exception_code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Slave Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Slave Device Busy",
        0x07 => "Negative Acknowledge",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}
