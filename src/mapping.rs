//! Locker id to board/coil address translation
//!
//! Each 16-relay board on the RS-485 bus owns a contiguous block of sixteen
//! lockers. The mapping is a pure function of the locker id: boards are
//! 1-indexed Modbus slave addresses, coils are 1-indexed within a board.
//! Nothing here is cached; the address is recomputed on every call.

use crate::error::{RelayError, Result};

/// Number of relay coils per board
pub const COILS_PER_BOARD: u32 = 16;

/// Physical address of a locker's relay coil
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockerAddress {
    /// Logical locker id this address was derived from
    pub locker_id: u32,
    /// Modbus slave address of the relay board (1-indexed)
    pub board: u8,
    /// Coil index within the board (1-indexed, 1..=16)
    pub coil: u8,
}

/// Map a logical locker id onto its relay board and coil.
///
/// `board = ceil(id / 16)`, `coil = ((id − 1) mod 16) + 1`. Fails with
/// [`RelayError::InvalidLockerId`] for id 0 and for ids whose board address
/// would not fit a Modbus slave id.
pub fn map_locker(locker_id: u32) -> Result<LockerAddress> {
    if locker_id == 0 {
        return Err(RelayError::InvalidLockerId(locker_id));
    }

    let board = locker_id.div_ceil(COILS_PER_BOARD);
    // Modbus slave addresses are 1..=247
    if board > 247 {
        return Err(RelayError::InvalidLockerId(locker_id));
    }
    let coil = ((locker_id - 1) % COILS_PER_BOARD) + 1;

    Ok(LockerAddress {
        locker_id,
        board: board as u8,
        coil: coil as u8,
    })
}
