//! The RTM2 recovery/termination work area.
//!
//! When a task abends, the recovery/termination manager captures its state
//! into this work area, anchored off the TCB. For a failed thread these are
//! the most authoritative registers available anywhere in the dump.

use lewalk_dump::{AddrMode, AddressSpace, ReadError};

use crate::RegisterSet;

/// Offset of the low halves of the error-time general registers.
pub const RTM2EREG: u64 = 0x60;

/// Offset of the high halves of the 64-bit error-time registers.
pub const RTM2G64H: u64 = 0xA0;

/// Offset of the error-time PSW.
pub const RTM2APSW: u64 = 0xE8;

/// Extracts the error-time register snapshot from an RTM2 work area.
///
/// The low register halves are always present; in 64-bit mode the high
/// halves live in a separate array and are folded in here.
pub fn registers(
    space: &AddressSpace,
    mode: AddrMode,
    rtm2: u64,
) -> Result<RegisterSet, ReadError> {
    let mut regs = RegisterSet::new();
    for r in 0..16 {
        let low = u64::from(space.read_u32(rtm2 + RTM2EREG + r as u64 * 4)?);
        let high = if mode.is_64bit() {
            u64::from(space.read_u32(rtm2 + RTM2G64H + r as u64 * 4)?)
        } else {
            0
        };
        regs.set_gpr(r, (high << 32) | low);
    }
    regs.set_psw(space.read_u64(rtm2 + RTM2APSW)?);
    Ok(regs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_high_halves_in_64_bit_mode() {
        let mut space = AddressSpace::new();
        let mut bytes = vec![0u8; 0x100];
        bytes[RTM2EREG as usize..RTM2EREG as usize + 4].copy_from_slice(&0x00FF_1000u32.to_be_bytes());
        bytes[RTM2G64H as usize..RTM2G64H as usize + 4].copy_from_slice(&0x0000_0001u32.to_be_bytes());
        bytes[RTM2APSW as usize..RTM2APSW as usize + 8]
            .copy_from_slice(&0x0000_0001_2345_6788u64.to_be_bytes());
        space.map(0x8000, bytes);

        let regs = registers(&space, AddrMode::Bits64, 0x8000).unwrap();
        assert_eq!(regs.gpr(0), 0x0000_0001_00FF_1000);
        assert_eq!(regs.psw(), 0x0000_0001_2345_6788);

        let regs = registers(&space, AddrMode::Bits32, 0x8000).unwrap();
        assert_eq!(regs.gpr(0), 0x00FF_1000);
    }
}
