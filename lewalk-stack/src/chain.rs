//! The backward-chain step: one frame to its caller's frame.
//!
//! This is the kernel both the validator and the outward walk share. It is a
//! pure function of one frame's bytes (plus, for transition frames, the
//! transition record they point at); it never consults the thread context.

use lewalk_dump::{AddrMode, AddressSpace, ReadError};

use crate::layout::{self, ceedsa, hepv};
use crate::StackFormat;

/// Call type nibble: BASR, a 2-byte register-indirect call.
const HPCL_BASR_CALL: u32 = 0;

/// Call type nibble: BRAS, a 4-byte short relative call.
const HPCL_BRAS_CALL: u32 = 1;

/// Call type nibble: BRASL, a 6-byte long relative call.
const HPCL_BRASL_CALL: u32 = 3;

/// Computes the parent frame of `frame`, together with the parent's format.
///
/// For an up-format frame the parent is the back-chain word, unless that
/// word is the transition sentinel, in which case the embedded transition
/// record says where the chain continues and a down-to-up record switches
/// the format. For a down-format frame a zero saved-R7 marks a transition
/// frame whose parent comes from its transition record; otherwise the
/// parent is found by adding the owning routine's frame size — read from
/// the word before its entry point — to the frame address, or by following
/// the dedicated back-chain slot when the routine allocated stack
/// dynamically.
///
/// A read failure means the chain ran into storage the dump did not
/// capture; the caller treats that the same as a provably broken chain. A
/// parent address of zero means the chain cannot be followed further.
pub fn previous_frame(
    space: &AddressSpace,
    mode: AddrMode,
    frame: u64,
    format: StackFormat,
) -> Result<(u64, StackFormat), ReadError> {
    match format {
        StackFormat::Up => {
            let bkc = space.read_u32(frame + ceedsa::BKC)?;
            if bkc == layout::UP_TRANSITION_SENTINEL {
                let tran = mode.strip(u64::from(space.read_u32(frame + ceedsa::TRAN)?));
                let lay = layout::transition(mode);
                let kind = space.read_u32(tran + lay.kind)?;
                if kind == layout::TRAN_DOWN_TO_UP {
                    let prev = mode.strip(space.read_word(mode, tran + lay.prev)?);
                    return Ok((prev, StackFormat::Down));
                }
            }
            Ok((mode.strip(u64::from(bkc)), StackFormat::Up))
        }
        StackFormat::Down => {
            let dsa = layout::dsahp(mode);
            let r7 = mode.strip(space.read_word(mode, frame + dsa.r7)?);
            if r7 == 0 {
                // Transition frame.
                let tran = mode.strip(space.read_word(mode, frame + dsa.tran)?);
                let lay = layout::transition(mode);
                let kind = space.read_u32(tran + lay.kind)?;
                let prev = mode.strip(space.read_word(mode, tran + lay.prev)?);
                let format = if kind == layout::TRAN_UP_TO_DOWN {
                    StackFormat::Up
                } else {
                    StackFormat::Down
                };
                return Ok((prev, format));
            }
            let entry = match entry_point_from_call_site(space, mode, frame, r7)? {
                Some(entry) => entry,
                None => return Ok((0, StackFormat::Down)),
            };
            let size_word = space.read_u32(entry - hepv::ENTRY_POINT + hepv::FRAME_SIZE)?;
            let prev = if size_word & layout::FRAME_FLAG_ALLOCA != 0 {
                mode.strip(space.read_word(mode, frame + dsa.bkc)?)
            } else {
                frame + u64::from(size_word & layout::FRAME_SIZE_MASK)
            };
            Ok((prev, StackFormat::Down))
        }
    }
}

/// Recovers a down-format routine's entry point from the bytes around its
/// call site.
///
/// `return_point` is the saved return address: it points just past the call
/// instruction, at the descriptor word whose 4-bit call-type field says how
/// the call was encoded. A BASR call went through the address saved in the
/// frame's R6 slot; the relative forms encode a signed halfword-scaled
/// displacement ending just before the descriptor. The computed entry point
/// only counts if the entry eyecatcher sits sixteen bytes before it.
///
/// Returns `Ok(None)` for an unrecognized call type or a missing
/// eyecatcher.
pub fn entry_point_from_call_site(
    space: &AddressSpace,
    mode: AddrMode,
    frame: u64,
    return_point: u64,
) -> Result<Option<u64>, ReadError> {
    let descriptor = space.read_u32(return_point)?;
    let call_type = (descriptor >> 16) & 0xF;
    let entry = match call_type {
        HPCL_BASR_CALL => {
            let dsa = layout::dsahp(mode);
            space.read_word(mode, frame + dsa.r6)?
        }
        HPCL_BRAS_CALL => {
            let offset = i64::from(space.read_i16(return_point.wrapping_sub(2))?) * 2;
            return_point.wrapping_sub(4).wrapping_add(offset as u64)
        }
        HPCL_BRASL_CALL => {
            let offset = i64::from(space.read_i32(return_point.wrapping_sub(4))?) * 2;
            return_point.wrapping_sub(6).wrapping_add(offset as u64)
        }
        _ => {
            tracing::trace!(call_type, "unrecognized call type at return point");
            return Ok(None);
        }
    };
    let entry = mode.strip(entry);
    if entry < hepv::ENTRY_POINT {
        return Ok(None);
    }
    if space.read_u64(entry - hepv::ENTRY_POINT)? != layout::ENTRY_EYECATCHER {
        tracing::trace!(entry, "no entry eyecatcher before computed entry point");
        return Ok(None);
    }
    Ok(Some(entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lewalk_dump::AddressSpace;

    const MODE: AddrMode = AddrMode::Bits32;

    #[test]
    fn transition_frame_uses_its_record_not_arithmetic() {
        let mut bytes = vec![0u8; 0x1000];
        // Zero saved R7 marks the transition; the record lives at +0x900.
        bytes[0x830..0x834].copy_from_slice(&0x0004_0900u32.to_be_bytes());
        bytes[0x900..0x904].copy_from_slice(&layout::TRAN_UP_TO_DOWN.to_be_bytes());
        bytes[0x908..0x90C].copy_from_slice(&0x0001_2340u32.to_be_bytes());
        let mut space = AddressSpace::new();
        space.map(0x40000, bytes);

        let (prev, format) = previous_frame(&space, MODE, 0x40000, StackFormat::Down).unwrap();
        assert_eq!(prev, 0x0001_2340);
        assert_eq!(format, StackFormat::Up);
    }

    #[test]
    fn down_to_up_transition_switches_format() {
        let mut bytes = vec![0u8; 0x1000];
        bytes[0x04..0x08].copy_from_slice(&layout::UP_TRANSITION_SENTINEL.to_be_bytes());
        bytes[0x28..0x2C].copy_from_slice(&0x0004_0800u32.to_be_bytes());
        bytes[0x800..0x804].copy_from_slice(&layout::TRAN_DOWN_TO_UP.to_be_bytes());
        bytes[0x808..0x80C].copy_from_slice(&0x0007_7000u32.to_be_bytes());
        let mut space = AddressSpace::new();
        space.map(0x40000, bytes);

        let (prev, format) = previous_frame(&space, MODE, 0x40000, StackFormat::Up).unwrap();
        assert_eq!(prev, 0x0007_7000);
        assert_eq!(format, StackFormat::Down);
    }

    #[test]
    fn up_frame_follows_raw_back_chain() {
        let mut bytes = vec![0u8; 0x100];
        bytes[0x04..0x08].copy_from_slice(&0x8004_4000u32.to_be_bytes());
        let mut space = AddressSpace::new();
        space.map(0x40000, bytes);

        let (prev, format) = previous_frame(&space, MODE, 0x40000, StackFormat::Up).unwrap();
        // The AMODE bit is stripped from the chained address.
        assert_eq!(prev, 0x0004_4000);
        assert_eq!(format, StackFormat::Up);
    }

    #[test]
    fn down_frame_adds_masked_frame_size() {
        let entry: u64 = 0x20100;
        let ret: u64 = 0x20180;
        let mut code = vec![0u8; 0x1000];
        let base = (entry - 0x10 - 0x20000) as usize;
        code[base..base + 8].copy_from_slice(&layout::ENTRY_EYECATCHER.to_be_bytes());
        // Frame size 0x1000 with the alloca bit clear.
        code[base + 0xC..base + 0x10].copy_from_slice(&0x0000_1000u32.to_be_bytes());
        // BASR descriptor at the return point.
        code[(ret - 0x20000) as usize..(ret - 0x20000) as usize + 4]
            .copy_from_slice(&0x4700_0000u32.to_be_bytes());
        let mut frame = vec![0u8; 0x1100];
        frame[0x808..0x80C].copy_from_slice(&(entry as u32).to_be_bytes());
        frame[0x80C..0x810].copy_from_slice(&(ret as u32).to_be_bytes());
        let mut space = AddressSpace::new();
        space.map(0x20000, code);
        space.map(0x40000, frame);

        let (prev, format) = previous_frame(&space, MODE, 0x40000, StackFormat::Down).unwrap();
        assert_eq!(prev, 0x41000);
        assert_eq!(format, StackFormat::Down);
    }

    #[test]
    fn alloca_frames_use_the_saved_back_chain() {
        let entry: u64 = 0x20100;
        let ret: u64 = 0x20180;
        let mut code = vec![0u8; 0x1000];
        let base = (entry - 0x10 - 0x20000) as usize;
        code[base..base + 8].copy_from_slice(&layout::ENTRY_EYECATCHER.to_be_bytes());
        code[base + 0xC..base + 0x10]
            .copy_from_slice(&(0x0000_1000u32 | layout::FRAME_FLAG_ALLOCA).to_be_bytes());
        code[(ret - 0x20000) as usize..(ret - 0x20000) as usize + 4]
            .copy_from_slice(&0x4700_0000u32.to_be_bytes());
        let mut frame = vec![0u8; 0x1100];
        frame[0x808..0x80C].copy_from_slice(&(entry as u32).to_be_bytes());
        frame[0x80C..0x810].copy_from_slice(&(ret as u32).to_be_bytes());
        frame[0x834..0x838].copy_from_slice(&0x0004_8000u32.to_be_bytes());
        let mut space = AddressSpace::new();
        space.map(0x20000, code);
        space.map(0x40000, frame);

        let (prev, _) = previous_frame(&space, MODE, 0x40000, StackFormat::Down).unwrap();
        assert_eq!(prev, 0x0004_8000);
    }

    #[test]
    fn relative_calls_recover_the_entry_point() {
        // BRAS: entry = ret - 4 + offset * 2, with the eyecatcher in place.
        let entry: u64 = 0x20100;
        let ret: u64 = 0x20180;
        let offset = ((entry as i64 - (ret as i64 - 4)) / 2) as i16;
        let mut code = vec![0u8; 0x1000];
        let base = (entry - 0x10 - 0x20000) as usize;
        code[base..base + 8].copy_from_slice(&layout::ENTRY_EYECATCHER.to_be_bytes());
        let r = (ret - 0x20000) as usize;
        code[r..r + 4].copy_from_slice(&0x4701_0000u32.to_be_bytes());
        code[r - 2..r].copy_from_slice(&offset.to_be_bytes());
        let mut space = AddressSpace::new();
        space.map(0x20000, code);

        let found = entry_point_from_call_site(&space, MODE, 0x40000, ret).unwrap();
        assert_eq!(found, Some(entry));
    }

    #[test]
    fn missing_eyecatcher_rejects_the_entry_point() {
        let ret: u64 = 0x20180;
        let mut code = vec![0u8; 0x1000];
        let r = (ret - 0x20000) as usize;
        code[r..r + 4].copy_from_slice(&0x4701_0000u32.to_be_bytes());
        // Displacement points at readable storage with no eyecatcher.
        code[r - 2..r].copy_from_slice(&(-0x40i16).to_be_bytes());
        let mut space = AddressSpace::new();
        space.map(0x20000, code);

        let found = entry_point_from_call_site(&space, MODE, 0x40000, ret).unwrap();
        assert_eq!(found, None);
    }

    #[test]
    fn unknown_call_type_yields_no_entry() {
        let mut code = vec![0u8; 0x100];
        code[0x80..0x84].copy_from_slice(&0x4702_0000u32.to_be_bytes());
        let mut space = AddressSpace::new();
        space.map(0x20000, code);
        let found = entry_point_from_call_site(&space, MODE, 0x40000, 0x20080).unwrap();
        assert_eq!(found, None);
    }
}
