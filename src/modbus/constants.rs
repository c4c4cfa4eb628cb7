//! Modbus RTU constants for the relay boards
//!
//! Size limits follow the official specification: the RS-485 ADU is capped at
//! 256 bytes, leaving 253 bytes of PDU after the slave address and CRC.

/// Maximum PDU size per the Modbus specification
/// RS485 ADU (256 bytes) - Slave Address (1 byte) - CRC (2 bytes) = 253 bytes
pub const MAX_PDU_SIZE: usize = 253;

/// Minimum RTU frame: slave address + function code + CRC
pub const MIN_RTU_FRAME_LEN: usize = 4;

/// Receive buffer size; generous margin over the largest frame we ever read
pub const RESPONSE_BUFFER_SIZE: usize = 256;

/// Maximum number of coils for a single write-multiple-coils request
///
/// Request PDU: FC(1) + start(2) + quantity(2) + byte count(1) + ceil(N/8)
/// bytes of coil data ≤ 253, and the Modbus specification caps N at 0x7B0.
pub const MAX_WRITE_COILS: usize = 1968;

/// Maximum number of coils for a single read-coils request
pub const MAX_READ_COILS: usize = 2000;

/// Base register of the vendor timed-pulse extension. Writing a tick count
/// here with function 0x05 makes the board firmware energize the coil and
/// revert it on its own after the duration elapses.
pub const PULSE_REGISTER_BASE: u16 = 0x0200;

/// Duration unit of the timed-pulse register, in milliseconds
pub const PULSE_TICK_MS: u64 = 100;

/// Echo response length for write single coil / write multiple coils
/// (slave + FC + address + value-or-quantity + CRC)
pub const WRITE_ECHO_LEN: usize = 8;

/// Exception response length (slave + FC|0x80 + code + CRC)
pub const EXCEPTION_RESPONSE_LEN: usize = 5;

/// Expected response length for a read-coils request of `count` coils
/// (slave + FC + byte count + data + CRC)
pub const fn read_coils_response_len(count: u16) -> usize {
    5 + (count as usize).div_ceil(8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_coil_limit_fits_pdu() {
        let request_pdu = 1 + 2 + 2 + 1 + MAX_WRITE_COILS.div_ceil(8);
        assert!(request_pdu <= MAX_PDU_SIZE);
    }

    #[test]
    fn test_read_coils_response_len() {
        assert_eq!(read_coils_response_len(1), 6);
        assert_eq!(read_coils_response_len(8), 6);
        assert_eq!(read_coils_response_len(9), 7);
        assert_eq!(read_coils_response_len(16), 7);
    }

    #[test]
    fn test_pulse_register_window() {
        // Sixteen per-coil pulse registers must not collide with coil space
        assert!(PULSE_REGISTER_BASE >= 0x0100);
    }
}
