//! Finding a register snapshot trustworthy enough to start a walk from.
//!
//! A dump records thread registers in several places of very different
//! quality, and for any given thread most of them are stale, empty, or
//! describe a system routine instead of the application. The resolver tries
//! the sources in decreasing order of trust and takes the first candidate
//! whose frame pointer survives chain validation.

use std::fmt;

use lewalk_dump::{AddressSpace, ReadError};
use lewalk_mvs::{rtm2, RegisterSet, ThreadControlBlock, LSED1BAKR, LSED1PC};

use crate::caa::Caa;
use crate::chain;
use crate::layout;
use crate::validate::{validate_candidate, StackBounds, Validation};
use crate::StackFormat;

/// How many chained frames the save-area scan fallback must produce before
/// its unvalidated registers are accepted anyway.
const SCAN_MIN_DEPTH: usize = 3;

/// Where a register snapshot was found.
///
/// The sources are listed in the order the resolver tries them; a snapshot
/// tagged with a later source exists because every earlier source failed
/// for the thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum RegisterSource {
    /// The recovery/termination work area of an abended thread.
    RecoveryWorkArea,
    /// The kernel's register-capture service.
    KernelService,
    /// A hardware linkage stack entry.
    LinkageStack,
    /// The registers saved in the TCB itself.
    ControlBlock,
    /// The 64-bit save-stack pointer recorded across a no-stack call; no
    /// actual register snapshot accompanies it.
    SaveStack,
    /// The user save area, accepted on chain depth alone.
    SaveAreaScan,
}

impl fmt::Display for RegisterSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegisterSource::RecoveryWorkArea => "recovery work area",
            RegisterSource::KernelService => "kernel register capture",
            RegisterSource::LinkageStack => "linkage stack",
            RegisterSource::ControlBlock => "thread control block",
            RegisterSource::SaveStack => "no-stack save slot",
            RegisterSource::SaveAreaScan => "user save area scan",
        };
        f.write_str(name)
    }
}

/// A validated starting point for a stack walk.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ResolvedRegisters {
    /// The register snapshot, absent for [`RegisterSource::SaveStack`].
    pub registers: Option<RegisterSet>,
    /// The stack format of the topmost frame.
    pub format: StackFormat,
    /// The validated frame pointer of the topmost frame.
    pub frame_pointer: u64,
    /// Where the snapshot came from.
    pub source: RegisterSource,
    /// True when the snapshot describes a failed (abended) thread.
    pub failing: bool,
}

/// Finds a trustworthy register snapshot and top-of-stack frame pointer for
/// the thread.
///
/// Returns `None` when every source is exhausted, meaning the thread's
/// stack is unavailable; the caller reports "no stack" and moves on.
#[tracing::instrument(level = "trace", name = "resolve_registers", skip_all)]
pub fn resolve_registers<T: ThreadControlBlock + ?Sized>(
    space: &AddressSpace,
    tcb: &T,
    caa: &Caa,
) -> Option<ResolvedRegisters> {
    let mode = caa.mode();
    let direction = caa.stack_direction();

    // The validator's no-stack heuristic needs the live down-segment
    // bounds. Failing to read them disqualifies the recovery work area but
    // nothing else, matching the reference behavior.
    let mut recovery_usable = true;
    let mut bounds = None;
    if direction == StackFormat::Down && !mode.is_64bit() {
        match segment_bounds(space, caa) {
            Ok(found) => bounds = Some(found),
            Err(e) => {
                tracing::trace!(error = %e, "cannot read down-stack segment bounds");
                recovery_usable = false;
            }
        }
    }
    let failed = tcb.completion_code().map_or(false, |code| code != 0);

    if recovery_usable {
        if let Some(found) = from_recovery_area(space, tcb, caa, bounds) {
            return Some(found);
        }
    }
    if let Some(regs) = tcb.kernel_registers() {
        if let Some((frame_pointer, format)) = registers_valid(space, caa, bounds, &regs) {
            tracing::debug!(frame_pointer, "kernel capture registers validated");
            return Some(ResolvedRegisters {
                registers: Some(regs),
                format,
                frame_pointer,
                source: RegisterSource::KernelService,
                failing: failed,
            });
        }
    }
    if let Some(found) = from_linkage_stack(space, tcb, caa, bounds, failed) {
        return Some(found);
    }
    if let Some(regs) = tcb.saved_registers() {
        if let Some((frame_pointer, format)) = registers_valid(space, caa, bounds, &regs) {
            tracing::debug!(frame_pointer, "TCB-resident registers validated");
            return Some(ResolvedRegisters {
                registers: Some(regs),
                format,
                frame_pointer,
                source: RegisterSource::ControlBlock,
                failing: failed,
            });
        }
    }
    if mode.is_64bit() {
        if let Some(found) = from_save_stack(space, caa, bounds) {
            return Some(found);
        }
    }
    if let Some(found) = from_save_area_scan(space, tcb, caa, bounds, failed) {
        return Some(found);
    }
    tracing::debug!(caa = caa.address(), "no trustworthy register set found");
    None
}

/// The bounds of the live down-stack segment: storage manager block →
/// bottom-of-stack → stack floor.
fn segment_bounds(space: &AddressSpace, caa: &Caa) -> Result<StackBounds, ReadError> {
    let mode = caa.mode();
    let smcb = caa.smcb(space)?;
    let top = mode.strip(space.read_word(mode, smcb + layout::SMCB_DSBOS)?);
    let floor = mode.strip(space.read_word(mode, top + layout::STKH_STACKFLOOR)?);
    Ok(StackBounds { floor, top })
}

/// Shared validation: pick the frame-pointer register the assumed format
/// dictates and run the chain validator over it.
///
/// When the down-direction candidate fails, the alternate register is tried
/// once as an up-format candidate; that attempt is only believed if the
/// validator's no-stack redirect fires and the redirected pointer then
/// validates cleanly.
fn registers_valid(
    space: &AddressSpace,
    caa: &Caa,
    bounds: Option<StackBounds>,
    regs: &RegisterSet,
) -> Option<(u64, StackFormat)> {
    let mode = caa.mode();
    let direction = caa.stack_direction();
    let (pointer, format) = match direction {
        StackFormat::Down => (regs.gpr_as_address(4, mode), StackFormat::Down),
        StackFormat::Up => (regs.gpr_as_address(13, mode), StackFormat::Up),
    };
    if validate_candidate(space, caa, bounds, pointer, format) == Validation::Valid {
        return Some((pointer, format));
    }
    if direction == StackFormat::Down {
        let pointer = regs.gpr_as_address(13, mode);
        if let Validation::Warning { pointer, format } =
            validate_candidate(space, caa, bounds, pointer, StackFormat::Up)
        {
            if validate_candidate(space, caa, bounds, pointer, format) == Validation::Valid {
                tracing::trace!(pointer, "redirected no-stack candidate validated");
                return Some((pointer, format));
            }
        }
    }
    tracing::trace!("candidate frame pointer rejected");
    None
}

fn from_recovery_area<T: ThreadControlBlock + ?Sized>(
    space: &AddressSpace,
    tcb: &T,
    caa: &Caa,
    bounds: Option<StackBounds>,
) -> Option<ResolvedRegisters> {
    let rtwa = tcb.rtwa().ok()?;
    if rtwa == 0 {
        tracing::trace!("no recovery work area for this thread");
        return None;
    }
    let regs = rtm2::registers(space, caa.mode(), rtwa).ok()?;
    let (frame_pointer, format) = registers_valid(space, caa, bounds, &regs)?;
    tracing::debug!(frame_pointer, "recovery work area registers validated");
    Some(ResolvedRegisters {
        registers: Some(regs),
        format,
        frame_pointer,
        source: RegisterSource::RecoveryWorkArea,
        // These are by definition the registers of a failing thread.
        failing: true,
    })
}

fn from_linkage_stack<T: ThreadControlBlock + ?Sized>(
    space: &AddressSpace,
    tcb: &T,
    caa: &Caa,
    bounds: Option<StackBounds>,
    failed: bool,
) -> Option<ResolvedRegisters> {
    let entries = match tcb.linkage_stack() {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(error = %e, "cannot read linkage stack");
            return None;
        }
    };
    if entries.is_empty() {
        tracing::trace!("empty linkage stack");
        return None;
    }
    for lse in &entries {
        if lse.pasn() != space.asid() {
            tracing::trace!(pasn = lse.pasn(), "linkage stack entry for another address space");
            continue;
        }
        let mut regs = RegisterSet::new();
        if lse.is_z_architecture() && matches!(lse.entry_type(), LSED1PC | LSED1BAKR) {
            regs.set_psw(lse.psw());
            for r in 0..16 {
                regs.set_gpr(r, lse.gpr(r));
            }
        } else {
            regs.set_psw(lse.legacy_psw());
            for r in 0..16 {
                regs.set_gpr(r, u64::from(lse.legacy_gpr(r)));
            }
        }
        if let Some((frame_pointer, format)) = registers_valid(space, caa, bounds, &regs) {
            tracing::debug!(frame_pointer, "linkage stack registers validated");
            return Some(ResolvedRegisters {
                registers: Some(regs),
                format,
                frame_pointer,
                source: RegisterSource::LinkageStack,
                failing: failed,
            });
        }
    }
    None
}

/// The 64-bit no-stack fallback: the register 4 value saved in the library
/// control area across an OS_NOSTACK call. There is no register snapshot to
/// go with it.
fn from_save_stack(
    space: &AddressSpace,
    caa: &Caa,
    bounds: Option<StackBounds>,
) -> Option<ResolvedRegisters> {
    let laa = caa.laa()?;
    let frame_pointer = (|| -> Result<u64, ReadError> {
        let lca = space.read_u64(laa + layout::laa::LCA)?;
        space.read_u64(lca + layout::lca::SAVSTACK)
    })()
    .ok()?;
    if validate_candidate(space, caa, bounds, frame_pointer, StackFormat::Down)
        != Validation::Valid
    {
        return None;
    }
    tracing::debug!(frame_pointer, "save-stack pointer validated");
    Some(ResolvedRegisters {
        registers: None,
        format: StackFormat::Down,
        frame_pointer,
        source: RegisterSource::SaveStack,
        failing: false,
    })
}

/// The last-ditch save-area scan: registers from the user save area, taken
/// on faith if their chain runs deep enough.
fn from_save_area_scan<T: ThreadControlBlock + ?Sized>(
    space: &AddressSpace,
    tcb: &T,
    caa: &Caa,
    bounds: Option<StackBounds>,
    failed: bool,
) -> Option<ResolvedRegisters> {
    let regs = tcb.usta_registers()?;
    if let Some((frame_pointer, format)) = registers_valid(space, caa, bounds, &regs) {
        tracing::debug!(frame_pointer, "save area registers validated");
        return Some(ResolvedRegisters {
            registers: Some(regs),
            format,
            frame_pointer,
            source: RegisterSource::SaveAreaScan,
            failing: failed,
        });
    }
    // More than three chained frames is probably better than nothing.
    let mode = caa.mode();
    let direction = caa.stack_direction();
    let frame_pointer = match direction {
        StackFormat::Down => regs.gpr_as_address(4, mode),
        StackFormat::Up => regs.gpr_as_address(13, mode),
    };
    let mut cursor = (frame_pointer, direction);
    for _ in 0..=SCAN_MIN_DEPTH {
        let (prev, format) = chain::previous_frame(space, mode, cursor.0, cursor.1).ok()?;
        if prev == 0 || prev == layout::F1SA {
            return None;
        }
        cursor = (prev, format);
    }
    tracing::debug!(frame_pointer, "accepting save area registers on chain depth");
    Some(ResolvedRegisters {
        registers: Some(regs),
        format: direction,
        frame_pointer,
        source: RegisterSource::SaveAreaScan,
        failing: failed,
    })
}
