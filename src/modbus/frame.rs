//! RTU frame building and parsing
//!
//! An RTU frame is `[board(1)] [function(1)] [payload] [CRC16-LE(2)]`, CRC
//! computed over everything before it. Encoders return complete wire-ready
//! byte vectors; [`decode`] validates length and CRC before exposing the
//! payload, and surfaces exception responses as typed errors.

use tracing::trace;

use super::constants::{MAX_WRITE_COILS, MIN_RTU_FRAME_LEN, PULSE_REGISTER_BASE};
use crate::error::{RelayError, Result};

/// Modbus function codes used by the relay boards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    /// Read coil status (0x01)
    ReadCoils = 0x01,
    /// Write single coil (0x05); also carries the vendor timed-pulse command
    WriteSingleCoil = 0x05,
    /// Write multiple coils (0x0F)
    WriteMultipleCoils = 0x0F,
}

impl FunctionCode {
    /// Wire value of the function code
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Parse a wire function code
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::ReadCoils),
            0x05 => Some(Self::WriteSingleCoil),
            0x0F => Some(Self::WriteMultipleCoils),
            _ => None,
        }
    }
}

/// A validated RTU frame
///
/// Immutable once built; `crc` is always the CRC of `board` + `function` +
/// `payload` as they appeared on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtuFrame {
    /// Slave address of the relay board
    pub board: u8,
    /// Function code
    pub function: FunctionCode,
    /// PDU data after the function code
    pub payload: Vec<u8>,
    /// CRC carried by the frame (little-endian on the wire)
    pub crc: u16,
}

/// Calculate the Modbus RTU CRC-16 (poly 0xA001, init 0xFFFF)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;

    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc >>= 1;
                crc ^= 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }

    crc
}

/// Append the CRC and finish a frame
fn seal(mut frame: Vec<u8>) -> Vec<u8> {
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    trace!(
        frame = %frame.iter().map(|b| format!("{b:02X}")).collect::<Vec<_>>().join(" "),
        "Built RTU frame"
    );
    frame
}

/// Build a write-single-coil frame. `coil` is 1-indexed; the wire address is
/// `coil − 1`. The value is 0xFF00 for ON, 0x0000 for OFF.
pub fn encode_write_single_coil(board: u8, coil: u8, on: bool) -> Vec<u8> {
    let address = u16::from(coil.saturating_sub(1));
    let mut frame = Vec::with_capacity(8);
    frame.push(board);
    frame.push(FunctionCode::WriteSingleCoil.code());
    frame.extend_from_slice(&address.to_be_bytes());
    frame.push(if on { 0xFF } else { 0x00 });
    frame.push(0x00);
    seal(frame)
}

/// Build a vendor timed-pulse frame: function 0x05 against the per-coil
/// pulse register, value = duration in 100 ms ticks. Board firmware
/// energizes the coil and reverts it on its own after the duration.
pub fn encode_timed_pulse(board: u8, coil: u8, duration_ticks: u16) -> Vec<u8> {
    let register = PULSE_REGISTER_BASE + u16::from(coil.saturating_sub(1));
    let mut frame = Vec::with_capacity(8);
    frame.push(board);
    frame.push(FunctionCode::WriteSingleCoil.code());
    frame.extend_from_slice(&register.to_be_bytes());
    frame.extend_from_slice(&duration_ticks.to_be_bytes());
    seal(frame)
}

/// Build a write-multiple-coils frame for a run of coils starting at the
/// 1-indexed `start_coil`. Coil states are packed LSB-first per the Modbus
/// specification.
pub fn encode_write_multiple_coils(board: u8, start_coil: u8, states: &[bool]) -> Result<Vec<u8>> {
    if states.is_empty() || states.len() > MAX_WRITE_COILS {
        return Err(RelayError::MalformedFrame(format!(
            "Invalid coil count for write multiple coils: {}",
            states.len()
        )));
    }

    let address = u16::from(start_coil.saturating_sub(1));
    let quantity = states.len() as u16;
    let byte_count = states.len().div_ceil(8) as u8;

    let mut frame = Vec::with_capacity(7 + byte_count as usize + 2);
    frame.push(board);
    frame.push(FunctionCode::WriteMultipleCoils.code());
    frame.extend_from_slice(&address.to_be_bytes());
    frame.extend_from_slice(&quantity.to_be_bytes());
    frame.push(byte_count);

    let mut current_byte = 0u8;
    let mut bit_index = 0;
    for &state in states {
        if state {
            current_byte |= 1 << bit_index;
        }
        bit_index += 1;
        if bit_index == 8 {
            frame.push(current_byte);
            current_byte = 0;
            bit_index = 0;
        }
    }
    if bit_index > 0 {
        frame.push(current_byte);
    }

    Ok(seal(frame))
}

/// Build a read-coils frame for `count` coils starting at the 1-indexed
/// `start_coil`.
pub fn encode_read_coils(board: u8, start_coil: u8, count: u16) -> Vec<u8> {
    let address = u16::from(start_coil.saturating_sub(1));
    let mut frame = Vec::with_capacity(8);
    frame.push(board);
    frame.push(FunctionCode::ReadCoils.code());
    frame.extend_from_slice(&address.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    seal(frame)
}

/// Parse and validate a received RTU frame.
///
/// Checks minimum length and CRC before anything else, then surfaces
/// exception responses (function | 0x80) as [`RelayError::Exception`].
pub fn decode(data: &[u8]) -> Result<RtuFrame> {
    if data.len() < MIN_RTU_FRAME_LEN {
        return Err(RelayError::MalformedFrame(format!(
            "RTU frame too short: {} bytes",
            data.len()
        )));
    }

    let body = &data[..data.len() - 2];
    let received_crc = u16::from_le_bytes([data[data.len() - 2], data[data.len() - 1]]);
    let calculated_crc = crc16(body);
    if received_crc != calculated_crc {
        return Err(RelayError::CrcMismatch {
            expected: calculated_crc,
            actual: received_crc,
        });
    }

    let board = data[0];
    let raw_function = data[1];

    if raw_function & 0x80 != 0 {
        let code = if body.len() > 2 { body[2] } else { 0 };
        return Err(RelayError::Exception {
            function: raw_function & 0x7F,
            code,
        });
    }

    let function = FunctionCode::from_code(raw_function).ok_or_else(|| {
        RelayError::MalformedFrame(format!("Unsupported function code: {raw_function:02X}"))
    })?;

    Ok(RtuFrame {
        board,
        function,
        payload: body[2..].to_vec(),
        crc: received_crc,
    })
}

/// Extract coil states from a read-coils response frame.
///
/// The payload is `[byte count] [packed bits…]`, LSB-first. Returns exactly
/// `count` booleans, or a framing error when the response is truncated.
pub fn decode_coil_status(frame: &RtuFrame, count: u16) -> Result<Vec<bool>> {
    if frame.function != FunctionCode::ReadCoils {
        return Err(RelayError::MalformedFrame(format!(
            "Expected read-coils response, got function {:02X}",
            frame.function.code()
        )));
    }
    if frame.payload.is_empty() {
        return Err(RelayError::MalformedFrame(
            "Read-coils response missing byte count".to_string(),
        ));
    }

    let byte_count = frame.payload[0] as usize;
    let expected_bytes = (count as usize).div_ceil(8);
    let data = &frame.payload[1..];
    if byte_count != expected_bytes || data.len() < expected_bytes {
        return Err(RelayError::MalformedFrame(format!(
            "Read-coils byte count mismatch: declared {byte_count}, expected {expected_bytes}, got {}",
            data.len()
        )));
    }

    let mut states = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let byte = data[i / 8];
        states.push((byte >> (i % 8)) & 0x01 != 0);
    }
    Ok(states)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_known_value() {
        // Standard reference vector for 01 03 00 00 00 01
        let data = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        assert_eq!(crc16(&data), 0x0A84);
    }

    #[test]
    fn test_crc16_empty_data() {
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn test_encode_write_single_coil_on_byte_exact() {
        // Canonical published example: board 1, coil 1, ON
        let frame = encode_write_single_coil(1, 1, true);
        assert_eq!(frame, vec![0x01, 0x05, 0x00, 0x00, 0xFF, 0x00, 0x8C, 0x3A]);
    }

    #[test]
    fn test_encode_write_single_coil_off() {
        let frame = encode_write_single_coil(1, 1, false);
        assert_eq!(frame, vec![0x01, 0x05, 0x00, 0x00, 0x00, 0x00, 0xCD, 0xCA]);
    }

    #[test]
    fn test_encode_write_single_coil_addressing() {
        // Coil 16 on board 3 → wire address 0x000F
        let frame = encode_write_single_coil(3, 16, true);
        assert_eq!(&frame[..6], &[0x03, 0x05, 0x00, 0x0F, 0xFF, 0x00]);
    }

    #[test]
    fn test_encode_timed_pulse() {
        // 500 ms = 5 ticks at coil 1 → register 0x0200 value 0x0005
        let frame = encode_timed_pulse(1, 1, 5);
        assert_eq!(&frame[..6], &[0x01, 0x05, 0x02, 0x00, 0x00, 0x05]);
        // CRC is polynomial-correct for that body
        let crc = crc16(&frame[..6]);
        assert_eq!(&frame[6..], &crc.to_le_bytes());

        // Coil 4 → register 0x0203
        let frame = encode_timed_pulse(1, 4, 5);
        assert_eq!(&frame[2..4], &[0x02, 0x03]);
    }

    #[test]
    fn test_encode_write_multiple_coils() {
        // Single coil at start 1: quantity 1, one data byte
        let frame = encode_write_multiple_coils(1, 1, &[true]).expect("valid coil run");
        assert_eq!(
            &frame[..7],
            &[0x01, 0x0F, 0x00, 0x00, 0x00, 0x01, 0x01]
        );
        assert_eq!(frame[7], 0x01);

        // Ten coils pack into two bytes, LSB-first
        let states = [
            true, false, true, true, false, false, true, true, // 0xCD
            true, false, // 0x01
        ];
        let frame = encode_write_multiple_coils(2, 1, &states).expect("valid coil run");
        assert_eq!(frame[6], 2); // byte count
        assert_eq!(frame[7], 0xCD);
        assert_eq!(frame[8], 0x01);
    }

    #[test]
    fn test_encode_write_multiple_coils_empty_is_error() {
        assert!(encode_write_multiple_coils(1, 1, &[]).is_err());
    }

    #[test]
    fn test_encode_read_coils() {
        let frame = encode_read_coils(1, 1, 1);
        assert_eq!(&frame[..6], &[0x01, 0x01, 0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_decode_round_trip() {
        let wire = encode_write_single_coil(2, 7, true);
        let frame = decode(&wire).expect("round trip should decode");
        assert_eq!(frame.board, 2);
        assert_eq!(frame.function, FunctionCode::WriteSingleCoil);
        assert_eq!(frame.payload, vec![0x00, 0x06, 0xFF, 0x00]);
        assert_eq!(frame.crc, crc16(&wire[..6]));
    }

    #[test]
    fn test_decode_detects_single_byte_corruption() {
        let wire = encode_write_single_coil(1, 1, true);
        for i in 0..wire.len() {
            let mut corrupted = wire.clone();
            corrupted[i] ^= 0x40;
            let result = decode(&corrupted);
            // Flipping any byte, CRC bytes included, must fail validation
            assert!(
                matches!(result, Err(RelayError::CrcMismatch { .. })),
                "byte {i} corruption went undetected"
            );
        }
    }

    #[test]
    fn test_decode_too_short() {
        assert!(matches!(
            decode(&[0x01, 0x05, 0xAB]),
            Err(RelayError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_decode_exception_response() {
        // 0x85 = write single coil with error bit, exception 0x02
        let mut wire = vec![0x01, 0x85, 0x02];
        let crc = crc16(&wire);
        wire.extend_from_slice(&crc.to_le_bytes());

        match decode(&wire) {
            Err(RelayError::Exception { function, code }) => {
                assert_eq!(function, 0x05);
                assert_eq!(code, 0x02);
            },
            other => panic!("expected exception error, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_unsupported_function() {
        let mut wire = vec![0x01, 0x03, 0x02, 0x00, 0x0A];
        let crc = crc16(&wire);
        wire.extend_from_slice(&crc.to_le_bytes());
        assert!(matches!(
            decode(&wire),
            Err(RelayError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_decode_coil_status() {
        // Response: byte count 1, bits 11001101 → coil 1 on, coil 2 off...
        let mut wire = vec![0x01, 0x01, 0x01, 0xCD];
        let crc = crc16(&wire);
        wire.extend_from_slice(&crc.to_le_bytes());

        let frame = decode(&wire).expect("valid read-coils response");
        let states = decode_coil_status(&frame, 8).expect("coil status");
        assert_eq!(
            states,
            vec![true, false, true, true, false, false, true, true]
        );

        // Asking for a single coil reads the LSB
        let states = decode_coil_status(&frame, 1).expect("coil status");
        assert_eq!(states, vec![true]);
    }

    #[test]
    fn test_decode_coil_status_truncated() {
        // Declares 2 data bytes but carries only one
        let mut wire = vec![0x01, 0x01, 0x02, 0xCD];
        let crc = crc16(&wire);
        wire.extend_from_slice(&crc.to_le_bytes());

        let frame = decode(&wire).expect("CRC is valid");
        assert!(decode_coil_status(&frame, 9).is_err());
    }

    #[test]
    fn test_decode_coil_status_wrong_function() {
        let wire = encode_write_single_coil(1, 1, true);
        let frame = decode(&wire).expect("valid frame");
        assert!(decode_coil_status(&frame, 1).is_err());
    }

    #[test]
    fn test_max_pdu_respected() {
        use crate::modbus::constants::MAX_PDU_SIZE;

        let states = vec![true; MAX_WRITE_COILS];
        let frame = encode_write_multiple_coils(1, 1, &states).expect("at the limit");
        assert!(frame.len() <= 1 + MAX_PDU_SIZE + 2);
        assert!(encode_write_multiple_coils(1, 1, &vec![true; MAX_WRITE_COILS + 1]).is_err());
    }
}
