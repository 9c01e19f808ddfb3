//! Deciding whether a candidate frame pointer lies on a thread's real
//! backward chain.

use lewalk_dump::{AddressSpace, ReadError};

use crate::caa::Caa;
use crate::chain;
use crate::layout::{self, ceedsa};
use crate::StackFormat;

/// Hard cap on validation steps. Loop detection already guarantees
/// termination; this bounds the damage if it ever stops doing so.
const MAX_STEPS: usize = 8192;

/// The bounds of the live down-stack segment, captured while resolving
/// registers.
///
/// The validator needs these for exactly one heuristic: recognizing that an
/// allegedly up-format candidate has wandered into the live down stack,
/// which happens when an up-format routine made a no-stack call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackBounds {
    /// The stack floor, the lowest usable address of the segment.
    pub floor: u64,
    /// The bottom-of-stack address, numerically the top of the segment.
    pub top: u64,
}

impl StackBounds {
    fn contains(&self, address: u64) -> bool {
        address >= self.floor && address < self.top
    }
}

/// The validator's verdict on a candidate frame pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Validation {
    /// The chain reaches the thread's dummy frame (or an equally convincing
    /// anchor); the candidate is on the real stack.
    Valid,
    /// The candidate was validated under the wrong format; retry at the
    /// redirected pointer instead.
    Warning {
        /// The down-stack pointer found in the frame the walk stopped at.
        pointer: u64,
        /// The format to retry under.
        format: StackFormat,
    },
    /// The chain is provably broken: it hits zero or a linkage-stack
    /// sentinel, runs into uncaptured storage, or loops.
    Error,
}

/// Walks the backward chain from `pointer` to decide whether it plausibly
/// lies on the thread's real stack.
///
/// In 64-bit mode the decision is a bounds check against the live stack
/// segment recorded in the library anchor. In 32-bit mode an up-format
/// candidate inside the HCOM is accepted on the spot; everything else is
/// decided by walking the chain with [`previous_frame`](chain::previous_frame)
/// until one of the terminal conditions hits:
///
/// - the dummy frame, a format transition, or an up-format parent whose
///   next-available-byte points back at the current frame — the candidate
///   is good;
/// - a zero or linkage-stack back pointer, a failed read, or a cycle
///   (detected tortoise-and-hare) — the candidate is bad;
/// - a step into the live down-stack segment while validating an up-format
///   candidate on a down-direction thread — the candidate was a no-stack
///   call and the caller should retry at the redirected pointer.
pub fn validate_candidate(
    space: &AddressSpace,
    caa: &Caa,
    bounds: Option<StackBounds>,
    pointer: u64,
    format: StackFormat,
) -> Validation {
    tracing::trace!(pointer, %format, "validating candidate frame pointer");
    if caa.mode().is_64bit() {
        return validate_64(space, caa, pointer);
    }
    let mode = caa.mode();
    if format == StackFormat::Up {
        // A candidate inside the HCOM is an error-handling frame; take it.
        let hcom = match caa.errcm(space) {
            Ok(hcom) => hcom,
            Err(_) => return Validation::Error,
        };
        if pointer >= hcom && pointer < hcom + layout::hcom(mode).len && pointer & 7 == 0 {
            tracing::trace!(pointer, "up-format candidate is inside the HCOM");
            return Validation::Valid;
        }
    }

    let ddsa = caa.dummy_frame();
    let direction = caa.stack_direction();
    let mut fast = (pointer, format);
    let mut slow = (pointer, format);
    let mut advance_slow = false;
    for _ in 0..MAX_STEPS {
        let (prev, prev_format) = match chain::previous_frame(space, mode, fast.0, fast.1) {
            Ok(step) => step,
            Err(_) => return Validation::Error,
        };
        // An up-format candidate sitting in the live down segment means the
        // registers were captured during a no-stack call; the real chain
        // continues from the down-stack register slot of this frame.
        if direction == StackFormat::Down
            && format == StackFormat::Up
            && bounds.map_or(false, |b| b.contains(fast.0))
        {
            let redirected = match space.read_u32(fast.0 + ceedsa::R4) {
                Ok(word) => mode.strip(u64::from(word)),
                Err(_) => return Validation::Error,
            };
            tracing::trace!(redirected, "candidate is a no-stack call, switching stacks");
            return Validation::Warning {
                pointer: redirected,
                format: StackFormat::Down,
            };
        }
        if prev == 0 || prev == layout::F1SA {
            tracing::trace!(frame = fast.0, "chain ends before the dummy frame");
            return Validation::Error;
        }
        if prev == ddsa {
            return Validation::Valid;
        }
        if prev_format != format {
            // Transitions are trusted anchors.
            return Validation::Valid;
        }
        if prev_format == StackFormat::Up {
            let nab = match space.read_u32(prev + ceedsa::NAB) {
                Ok(word) => mode.strip(u64::from(word)),
                Err(_) => return Validation::Error,
            };
            if nab == fast.0 {
                return Validation::Valid;
            }
        }
        fast = (prev, prev_format);
        if advance_slow {
            slow = match chain::previous_frame(space, mode, slow.0, slow.1) {
                Ok(step) => step,
                Err(_) => return Validation::Error,
            };
        }
        advance_slow = !advance_slow;
        if fast.0 == slow.0 {
            tracing::trace!(frame = fast.0, "loop detected in frame chain");
            return Validation::Error;
        }
    }
    Validation::Error
}

/// 64-bit validation: a bounds check against the live stack segment, no
/// walk.
fn validate_64(space: &AddressSpace, caa: &Caa, pointer: u64) -> Validation {
    let Some(laa) = caa.laa() else {
        return Validation::Error;
    };
    let checked = (|| -> Result<bool, ReadError> {
        let sanc = space.read_u64(laa + layout::laa::SANC)?;
        let top = space.read_u64(sanc + layout::sanc::BOS)?;
        let stack = space.read_u64(sanc + layout::sanc::STACK)?;
        let user_stack = space.read_u64(sanc + layout::sanc::USER_STACK)?;
        let floor = if stack == user_stack {
            space.read_u64(sanc + layout::sanc::USER_FLOOR)?
        } else {
            space.read_u64(laa + layout::laa::STACKFLOOR)?
        };
        tracing::trace!(pointer, floor, top, "64-bit segment bounds check");
        Ok(pointer < top && pointer + 0x800 >= floor && pointer & 0xF == 0)
    })();
    match checked {
        Ok(true) => Validation::Valid,
        _ => Validation::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lewalk_dump::{AddrMode, AddressSpace};
    use proptest::prelude::*;

    const FRAMES: u64 = 0x40000;
    const DDSA: u64 = 0x50000;

    fn stub_caa(mode: AddrMode, direction: StackFormat, laa: Option<u64>) -> Caa {
        crate::caa::test_stub(0x10000, mode, direction, DDSA, laa)
    }

    /// An address space with a zeroed CAA area and a frame area whose
    /// up-format back chains are given per frame (0x100 bytes apart).
    fn up_chain(links: &[u32]) -> AddressSpace {
        let mut frames = vec![0u8; 0x4000];
        for (i, &link) in links.iter().enumerate() {
            let at = i * 0x100 + 4;
            frames[at..at + 4].copy_from_slice(&link.to_be_bytes());
        }
        let mut space = AddressSpace::new();
        space.map(0x10000, vec![0u8; 0x400]);
        space.map(FRAMES, frames);
        space
    }

    fn frame(i: u32) -> u32 {
        (FRAMES as u32) + i * 0x100
    }

    #[test]
    fn chain_reaching_the_dummy_frame_is_valid() {
        let space = up_chain(&[frame(1), frame(2), DDSA as u32]);
        let caa = stub_caa(AddrMode::Bits32, StackFormat::Up, None);
        let verdict = validate_candidate(&space, &caa, None, FRAMES, StackFormat::Up);
        assert_eq!(verdict, Validation::Valid);
    }

    #[test]
    fn zero_back_pointer_is_an_error() {
        let space = up_chain(&[frame(1), 0]);
        let caa = stub_caa(AddrMode::Bits32, StackFormat::Up, None);
        let verdict = validate_candidate(&space, &caa, None, FRAMES, StackFormat::Up);
        assert_eq!(verdict, Validation::Error);
    }

    #[test]
    fn linkage_stack_sentinel_is_an_error() {
        let space = up_chain(&[frame(1), layout::F1SA as u32]);
        let caa = stub_caa(AddrMode::Bits32, StackFormat::Up, None);
        let verdict = validate_candidate(&space, &caa, None, FRAMES, StackFormat::Up);
        assert_eq!(verdict, Validation::Error);
    }

    #[test]
    fn cycles_of_any_period_are_errors() {
        for cycle in [
            vec![frame(0)],
            vec![frame(1), frame(0)],
            vec![frame(1), frame(2), frame(3), frame(1)],
            vec![frame(1), frame(2), frame(3), frame(4), frame(2)],
        ] {
            let space = up_chain(&cycle);
            let caa = stub_caa(AddrMode::Bits32, StackFormat::Up, None);
            let verdict = validate_candidate(&space, &caa, None, FRAMES, StackFormat::Up);
            assert_eq!(verdict, Validation::Error, "cycle {cycle:x?}");
        }
    }

    #[test]
    fn unreadable_chain_is_an_error() {
        let space = up_chain(&[0x7F00_0000]);
        let caa = stub_caa(AddrMode::Bits32, StackFormat::Up, None);
        let verdict = validate_candidate(&space, &caa, None, FRAMES, StackFormat::Up);
        assert_eq!(verdict, Validation::Error);
    }

    #[test]
    fn nab_backpointer_anchors_the_chain() {
        // The parent's next-available-byte points back at the candidate.
        let mut frames = vec![0u8; 0x4000];
        frames[4..8].copy_from_slice(&frame(1).to_be_bytes());
        let nab_at = 0x100 + ceedsa::NAB as usize;
        frames[nab_at..nab_at + 4].copy_from_slice(&(FRAMES as u32).to_be_bytes());
        // The parent chains onward to junk; the NAB check must win first.
        frames[0x104..0x108].copy_from_slice(&frame(2).to_be_bytes());
        let mut space = AddressSpace::new();
        space.map(0x10000, vec![0u8; 0x400]);
        space.map(FRAMES, frames);
        let caa = stub_caa(AddrMode::Bits32, StackFormat::Up, None);
        let verdict = validate_candidate(&space, &caa, None, FRAMES, StackFormat::Up);
        assert_eq!(verdict, Validation::Valid);
    }

    #[test]
    fn no_stack_call_redirects_to_the_down_stack() {
        let mut frames = vec![0u8; 0x4000];
        // An up-format frame inside the live down segment; its register 4
        // slot holds the real down-stack pointer.
        let r4_at = ceedsa::R4 as usize;
        frames[r4_at..r4_at + 4].copy_from_slice(&0x8004_2000u32.to_be_bytes());
        let mut space = AddressSpace::new();
        space.map(0x10000, vec![0u8; 0x400]);
        space.map(FRAMES, frames);
        let caa = stub_caa(AddrMode::Bits32, StackFormat::Down, None);
        let bounds = StackBounds {
            floor: FRAMES,
            top: FRAMES + 0x8000,
        };
        let verdict = validate_candidate(&space, &caa, Some(bounds), FRAMES, StackFormat::Up);
        assert_eq!(
            verdict,
            Validation::Warning {
                pointer: 0x0004_2000,
                format: StackFormat::Down,
            }
        );
    }

    #[test]
    fn sixty_four_bit_candidates_are_bounds_checked() {
        const LAA: u64 = 0x7000;
        const SANC: u64 = 0x7800;
        let mut anchor = vec![0u8; 0x1000];
        let put = |bytes: &mut Vec<u8>, at: u64, value: u64| {
            let at = at as usize;
            bytes[at..at + 8].copy_from_slice(&value.to_be_bytes());
        };
        put(&mut anchor, layout::laa::SANC, SANC);
        put(&mut anchor, SANC - LAA + layout::sanc::BOS, 0x9_0000);
        put(&mut anchor, SANC - LAA + layout::sanc::STACK, 0x1234);
        put(&mut anchor, SANC - LAA + layout::sanc::USER_STACK, 0x1234);
        put(&mut anchor, SANC - LAA + layout::sanc::USER_FLOOR, 0x8_0000);
        let mut space = AddressSpace::new();
        space.map(LAA, anchor);
        let caa = stub_caa(AddrMode::Bits64, StackFormat::Down, Some(LAA));

        let verdict = validate_candidate(&space, &caa, None, 0x8_8000, StackFormat::Down);
        assert_eq!(verdict, Validation::Valid);
        // Below the floor by more than the slack.
        let verdict = validate_candidate(&space, &caa, None, 0x6_0000, StackFormat::Down);
        assert_eq!(verdict, Validation::Error);
        // Misaligned.
        let verdict = validate_candidate(&space, &caa, None, 0x8_8004, StackFormat::Down);
        assert_eq!(verdict, Validation::Error);
    }

    proptest! {
        /// No chain, however corrupted, may hang the validator.
        #[test]
        fn walk_always_terminates(links in prop::collection::vec(0u32..40, 1..32)) {
            let links: Vec<u32> = links.iter().map(|&i| frame(i)).collect();
            let space = up_chain(&links);
            let caa = stub_caa(AddrMode::Bits32, StackFormat::Up, None);
            let verdict = validate_candidate(&space, &caa, None, FRAMES, StackFormat::Up);
            let verdict_is_variant = matches!(
                verdict,
                Validation::Valid | Validation::Warning { .. } | Validation::Error
            );
            prop_assert!(verdict_is_variant);
        }
    }
}
