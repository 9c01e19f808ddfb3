//! Per-frame traceback: entry point, routine name, and call site.
//!
//! Given a frame address and format, this module recovers everything a
//! human wants to know about the frame: where its routine starts, what the
//! routine is called, and the exact address its caller called it from.
//! Name resolution degrades to nothing rather than failing the frame;
//! states the traceback algorithm defines but does not handle surface as
//! [`TraceErrorKind::UnimplementedBranch`](crate::TraceErrorKind) so they
//! are never silently wrong.

use lewalk_dump::{AddrMode, AddressSpace, ReadError};
use lewalk_mvs::RegisterSet;

use crate::caa::Caa;
use crate::chain;
use crate::layout::{self, ceedsa, hepv, oepv, ppa1, ppa1h, sfxm};
use crate::{StackFormat, TraceError};

/// The BASSM 14,15 instruction the AMODE-switch glue calls through.
const BASSM_14_15: u16 = 0x0CEF;

/// The "L 14,x(13)" instruction following the BASSM in the glue.
const L_14_DSAMODE: u32 = 0x58E0_D06C;

/// Masked signature the dispatcher plants in its own up-stack frame.
const DISPATCHER_SIG: u32 = 0x0808_CEE0;
const DISPATCHER_SIG_MASK: u32 = 0xFFFF_FFF0;

/// Bound on condition-block chain walks. A condition represents a signal
/// that occurred; real chains hold zero or one entry per frame, so the
/// limit is generous.
const MAX_CIB_CHAIN: usize = 256;

/// Bound on exit-block chain walks.
const MAX_SFXM_CHAIN: usize = 256;

/// How far backward the scanning name lookup searches for an entry point.
const NAME_SCAN_BYTES: u64 = 0x1000;

/// One reconstructed native call frame (DSA).
///
/// A frame's format is fixed at construction. The parent address and format
/// describe the link to the caller's frame; a format change across that
/// link means the call crossed between the two stacks, and
/// [`is_transition`](StackFrame::is_transition) reports whether this frame
/// itself is the transition record's owner. Only the topmost frame of a
/// thread carries a register snapshot.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct StackFrame {
    address: u64,
    format: StackFormat,
    is_transition: bool,
    parent_address: u64,
    parent_format: StackFormat,
    call_site: Option<u64>,
    entry_point: u64,
    name: Option<String>,
    registers: Option<RegisterSet>,
    parent_index: Option<usize>,
    child_index: Option<usize>,
}

impl StackFrame {
    /// Builds the frame at `address`, resolving its parent link, entry
    /// point, name, and call site.
    ///
    /// `registers` should be the resolved snapshot for the topmost frame
    /// and `None` for every other frame. A read failure is returned as a
    /// [`TraceErrorKind::Read`](crate::TraceErrorKind) error, which walkers
    /// treat as the end of the usable chain.
    #[tracing::instrument(level = "trace", name = "StackFrame::build", skip(space, caa, registers))]
    pub fn build(
        space: &AddressSpace,
        caa: &Caa,
        address: u64,
        format: StackFormat,
        registers: Option<RegisterSet>,
    ) -> Result<StackFrame, TraceError> {
        let mode = caa.mode();
        let is_transition = verify_transition(space, mode, address, format)?;
        let (parent_address, parent_format) = chain::previous_frame(space, mode, address, format)?;
        tracing::trace!(parent_address, %parent_format, is_transition, "resolved parent link");
        let parent_cib = find_cib(space, caa, parent_address);
        let parent_sfxm = find_sfxm(space, caa, parent_address, parent_format)?;

        let mut frame = StackFrame {
            address,
            format,
            is_transition,
            parent_address,
            parent_format,
            call_site: None,
            entry_point: 0,
            name: None,
            registers,
            parent_index: None,
            child_index: None,
        };
        match format {
            StackFormat::Down => build_down(space, caa, &mut frame, parent_cib, parent_sfxm)?,
            StackFormat::Up => build_up(space, caa, &mut frame, parent_cib, parent_sfxm)?,
        }
        Ok(frame)
    }

    /// The address of the frame.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// The calling convention the frame belongs to.
    pub fn format(&self) -> StackFormat {
        self.format
    }

    /// True if this frame marks a crossing between the two stacks.
    pub fn is_transition(&self) -> bool {
        self.is_transition
    }

    /// The address of the caller's frame; zero if the chain ends here.
    pub fn parent_address(&self) -> u64 {
        self.parent_address
    }

    /// The calling convention of the caller's frame.
    pub fn parent_format(&self) -> StackFormat {
        self.parent_format
    }

    /// The address of the instruction in the caller that called this
    /// routine, when it could be determined.
    pub fn call_site(&self) -> Option<u64> {
        self.call_site
    }

    /// The entry point of the routine owning the frame; zero if unknown.
    pub fn entry_point(&self) -> u64 {
        self.entry_point
    }

    /// The name of the routine owning the frame.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The register snapshot, present only on the topmost frame.
    pub fn registers(&self) -> Option<&RegisterSet> {
        self.registers.as_ref()
    }

    /// The index of the caller's frame in the owning
    /// [`Backtrace`](crate::Backtrace) arena.
    pub fn parent_index(&self) -> Option<usize> {
        self.parent_index
    }

    /// The index of the called frame in the owning
    /// [`Backtrace`](crate::Backtrace) arena.
    pub fn child_index(&self) -> Option<usize> {
        self.child_index
    }

    pub(crate) fn set_parent_index(&mut self, index: Option<usize>) {
        self.parent_index = index;
    }

    pub(crate) fn set_child_index(&mut self, index: Option<usize>) {
        self.child_index = index;
    }
}

/// Decides whether the frame is a transition frame by inspecting its
/// transition record, if it points at one.
fn verify_transition(
    space: &AddressSpace,
    mode: AddrMode,
    address: u64,
    format: StackFormat,
) -> Result<bool, ReadError> {
    let lay = layout::transition(mode);
    match format {
        StackFormat::Up => {
            let bkc = space.read_u32(address + ceedsa::BKC)?;
            if bkc == layout::UP_TRANSITION_SENTINEL {
                let tran = mode.strip(u64::from(space.read_u32(address + ceedsa::TRAN)?));
                let kind = space.read_u32(tran + lay.kind)?;
                return Ok((1..=layout::TRAN_KIND_MAX).contains(&kind));
            }
        }
        StackFormat::Down => {
            let dsa = layout::dsahp(mode);
            let r7 = space.read_word(mode, address + dsa.r7)?;
            if r7 == 0 {
                let tran = mode.strip(space.read_word(mode, address + dsa.tran)?);
                let kind = space.read_u32(tran + lay.kind)?;
                return Ok((1..=layout::TRAN_KIND_MAX).contains(&kind));
            }
        }
    }
    Ok(false)
}

/// Traceback for a down-format frame.
fn build_down(
    space: &AddressSpace,
    caa: &Caa,
    frame: &mut StackFrame,
    parent_cib: Option<u64>,
    parent_sfxm: Option<u64>,
) -> Result<(), TraceError> {
    let info = entry_info(space, caa, frame.address);
    frame.entry_point = info.entry;
    let Some(ppa1_addr) = info.ppa1 else {
        // No PPA1 means the code is not CEL enabled, which should never
        // occur on the down stack.
        frame.entry_point = 0;
        return Ok(());
    };
    frame.call_site = calling_address(
        space,
        caa,
        frame.parent_address,
        frame.parent_format,
        Some(ChildFrame {
            address: frame.address,
            format: frame.format,
            transition: frame.is_transition,
        }),
        parent_cib,
        parent_sfxm,
    )?;
    frame.name = name_pointer(space, caa, ppa1_addr).and_then(|at| read_name(space, at));
    tracing::trace!(entry = frame.entry_point, name = frame.name.as_deref(), "down frame resolved");
    Ok(())
}

/// Traceback for an up-format frame.
fn build_up(
    space: &AddressSpace,
    caa: &Caa,
    frame: &mut StackFrame,
    parent_cib: Option<u64>,
    parent_sfxm: Option<u64>,
) -> Result<(), TraceError> {
    let mode = caa.mode();
    let mut entry;
    if frame.is_transition {
        // The entry point survives in the transition record.
        let tran = mode.strip(u64::from(space.read_u32(frame.address + ceedsa::TRAN)?));
        entry = mode.strip(space.read_word(mode, tran + layout::transition(mode).ep)?);
    } else {
        let sig = space.read_u32(frame.address + ceedsa::HDSP_SIG)?;
        if sig & DISPATCHER_SIG_MASK == DISPATCHER_SIG {
            // The dispatcher calls subroutines through CODENUM, so the saved
            // entry register does not identify this routine.
            return Err(TraceError::unimplemented("dispatcher-owned up-stack frame"));
        }
        entry = mode.strip(u64::from(space.read_u32(frame.parent_address + ceedsa::R15)?));
    }
    // The entry address only counts if the dump actually captured it.
    if space.read_u64(entry).is_err() {
        tracing::trace!(entry, "entry address not captured, resetting");
        entry = 0;
    }

    let mut vector = entry;
    let mut cel_enabled = false;
    if entry != 0 {
        let eyecatch = space.read_u32(vector + oepv::EYECATCH).unwrap_or(0);
        let name_offs = eyecatch >> 24;
        if (name_offs == 0 || name_offs == 1) && eyecatch & 0x00FF_FFFF == oepv::EYE {
            cel_enabled = ppa1_signature(space, vector) == Some(ppa1::EYE);
        } else if let Some(relocated) = wrapped_vector(space, vector)? {
            vector = relocated;
            cel_enabled = true;
        }
    }
    let v2 = cel_enabled && space.read_u8(vector + oepv::NAME_OFFS).ok() == Some(1);

    frame.call_site = calling_address(
        space,
        caa,
        frame.parent_address,
        frame.parent_format,
        Some(ChildFrame {
            address: frame.address,
            format: frame.format,
            transition: frame.is_transition,
        }),
        parent_cib,
        parent_sfxm,
    )?;

    if cel_enabled {
        let nmo = ppa1_name_offset(space, vector)?;
        if nmo == 0 {
            return Err(TraceError::unimplemented("zero PPA1 name offset"));
        }
        let ppa1_addr = vector + u64::from(space.read_u32(vector + oepv::PPA1_OFFSET)?);
        let scale = if v2 { 2 } else { 1 };
        frame.name = read_name(space, ppa1_addr + u64::from(nmo) * scale);
    }
    frame.entry_point = entry;
    tracing::trace!(entry, cel_enabled, name = frame.name.as_deref(), "up frame resolved");
    Ok(())
}

/// Reads the PPA1 signature byte behind an entry point vector.
fn ppa1_signature(space: &AddressSpace, vector: u64) -> Option<u8> {
    let offset = space.read_u32(vector + oepv::PPA1_OFFSET).ok()?;
    space.read_u8(vector + u64::from(offset) + ppa1::SIG).ok()
}

/// Reads the PPA1 offset-to-name byte behind an entry point vector.
fn ppa1_name_offset(space: &AddressSpace, vector: u64) -> Result<u8, ReadError> {
    let offset = space.read_u32(vector + oepv::PPA1_OFFSET)?;
    space.read_u8(vector + u64::from(offset) + ppa1::NMO)
}

/// Checks whether the module is a wrapped transfer vector: a `BR x(15)`
/// at the old entry point, with the real vector planted just before the
/// branch target. Returns the relocated vector when its PPA1 validates.
fn wrapped_vector(space: &AddressSpace, vector: u64) -> Result<Option<u64>, TraceError> {
    let old = match space.read_u32(vector + oepv::OLDEP) {
        Ok(word) => word,
        Err(_) => return Ok(None),
    };
    if old >> 12 != 0x47F0F {
        return Ok(None);
    }
    let displacement = u64::from(old & 0xFFF);
    let relocated = (vector + displacement).wrapping_sub(oepv::LEN);
    match space.read_u32(relocated + oepv::OLDEP) {
        Ok(0) => {}
        _ => return Ok(None),
    }
    let eyecatch = match space.read_u32(relocated + oepv::EYECATCH) {
        Ok(word) => word,
        Err(_) => return Ok(None),
    };
    if eyecatch & 0x00FF_FFFF != oepv::EYE {
        return Ok(None);
    }
    if ppa1_signature(space, relocated) == Some(ppa1::EYE) {
        tracing::trace!(relocated, "found wrapped transfer vector");
        Ok(Some(relocated))
    } else {
        Err(TraceError::unimplemented(
            "wrapped transfer vector without a CEL signature",
        ))
    }
}

/// Entry point and PPA1 of the routine owning a down-format frame.
struct EntryInfo {
    entry: u64,
    ppa1: Option<u64>,
}

/// Locates a down-format routine's entry point and PPA1 from its frame.
///
/// Verification is inherent in the lookup: a frame that fails it simply
/// comes back without a PPA1, marking the code as not CEL enabled.
fn entry_info(space: &AddressSpace, caa: &Caa, address: u64) -> EntryInfo {
    let mode = caa.mode();
    let dsa = layout::dsahp(mode);
    let mut info = EntryInfo { entry: 0, ppa1: None };
    let result = (|| -> Result<(), ReadError> {
        let r7 = mode.strip(space.read_word(mode, address + dsa.r7)?);
        info.entry = if r7 == 0 {
            // Transitional frame: the owner's entry was saved in register 6.
            mode.strip(space.read_word(mode, address + dsa.r6)?)
        } else {
            chain::entry_point_from_call_site(space, mode, address, r7)?.unwrap_or(0)
        };
        let prefix = info.entry.wrapping_sub(hepv::ENTRY_POINT);
        let ppa1_off = space.read_u32(prefix + hepv::PPA1_OFFSET)?;
        info.ppa1 = Some(prefix + u64::from(ppa1_off));
        Ok(())
    })();
    if let Err(e) = result {
        tracing::trace!(error = %e, frame = address, "incomplete entry info for down frame");
    }
    info
}

/// Resolves the pointer to a down-format routine's name within its PPA1.
///
/// The PPA1 optional areas between the fixed header and the name have
/// data-dependent sizes; their combined length is looked up in the
/// name-offset table anchored in the region control block, falling back to
/// stepping over the areas one flag bit at a time when the table is not in
/// the dump.
fn name_pointer(space: &AddressSpace, caa: &Caa, ppa1_addr: u64) -> Option<u64> {
    let mode = caa.mode();
    let after_header = ppa1_addr + ppa1h::LEN;
    let resolved = (|| -> Result<u64, ReadError> {
        let rcb = caa.rcb(space)?;
        let table = mode.strip(space.read_word(mode, rcb + layout::rcb(mode).ppa1tabl)?);
        let flag3 = space.read_u8(ppa1_addr + ppa1h::FLAG3)?;
        match space.read_u8(table + u64::from(flag3)) {
            Ok(offset) => Ok(after_header + u64::from(offset)),
            Err(_) => {
                // The table may sit in uncaptured low storage; walk the
                // optional areas by hand instead.
                let mut at = after_header;
                for bit in [0x80u8, 0x40, 0x20, 0x10, 0x08, 0x04, 0x02] {
                    if flag3 & bit != 0 {
                        at += 4;
                    }
                }
                if flag3 & 0x01 != 0 {
                    at += 8;
                }
                Ok(at)
            }
        }
    })();
    match resolved {
        Ok(at) => Some(at),
        Err(e) => {
            tracing::trace!(error = %e, ppa1 = ppa1_addr, "cannot locate name in PPA1");
            None
        }
    }
}

/// Reads and sanity-checks a routine name.
fn read_name(space: &AddressSpace, at: u64) -> Option<String> {
    match space.read_ebcdic_string(at) {
        Ok(name) if is_valid_name(&name) => Some(name),
        Ok(_) => {
            tracing::debug!(at, "entry name failed the printable check");
            None
        }
        Err(e) => {
            tracing::trace!(error = %e, at, "cannot read entry name");
            None
        }
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| (' '..='~').contains(&c))
}

/// The frame whose return state identifies the call, when the call site of
/// its parent is being resolved.
struct ChildFrame {
    address: u64,
    format: StackFormat,
    transition: bool,
}

/// Determines the address from which `frame` transferred control into its
/// child.
///
/// Preference order: a matching condition information block holds the
/// interrupted address verbatim; a matching exit control block is a known
/// unimplemented branch; otherwise the raw return-address slot is
/// adjusted — AMODE masking, the mode-switch glue substitution, and
/// finally the length of the decoded call instruction — to land exactly on
/// the call.
fn calling_address(
    space: &AddressSpace,
    caa: &Caa,
    frame: u64,
    format: StackFormat,
    child: Option<ChildFrame>,
    cib: Option<u64>,
    sfxm: Option<u64>,
) -> Result<Option<u64>, TraceError> {
    let mode = caa.mode();
    if let Some(cib) = cib {
        let stored = mode.strip(space.read_word(mode, cib + layout::cib(mode).int_addr)?);
        tracing::trace!(stored, "call site from condition information block");
        return Ok(Some(stored));
    }
    if sfxm.is_some() {
        return Err(TraceError::unimplemented("exit control block call site"));
    }

    let mut next = match format {
        StackFormat::Up => u64::from(space.read_u32(frame + ceedsa::R14)?),
        StackFormat::Down => {
            // The return address lives in the callee's frame.
            let Some(child) = child else {
                return Ok(None);
            };
            let lay = layout::transition(mode);
            let dsa = layout::dsahp(mode);
            match (child.format, child.transition) {
                (StackFormat::Up, true) => {
                    let tran = mode.strip(u64::from(space.read_u32(child.address + ceedsa::TRAN)?));
                    space.read_word(mode, tran + lay.retaddr)?
                }
                (StackFormat::Down, true) => {
                    let tran = mode.strip(space.read_word(mode, child.address + dsa.tran)?);
                    space.read_word(mode, tran + lay.retaddr)?
                }
                _ => space.read_word(mode, child.address + dsa.r7)?,
            }
        }
    };
    if next == 0 {
        tracing::trace!("no return address, cannot resolve call site");
        return Ok(None);
    }
    if !mode.is_64bit() {
        if format == StackFormat::Up && next & 0x8000_0000 == 0 {
            // AMODE 24: the high byte is garbage.
            next &= 0x00FF_FFFF;
        } else {
            next &= 0x7FFF_FFFF;
        }
    }

    match format {
        StackFormat::Up => {
            if next == caa.edb(space)?.ceeosigr(space)? {
                return Err(TraceError::unimplemented("up-stack signal glue return"));
            }
            // AMODE-switch glue returns through BASSM/L 14; the true return
            // address was parked in the caller's DSAMODE slot.
            if space.read_u16(next.wrapping_sub(2)).ok() == Some(BASSM_14_15)
                && space.read_u32(next).ok() == Some(L_14_DSAMODE)
            {
                if let Ok(parked) = space.read_u32(frame + ceedsa::MODE) {
                    next = u64::from(parked);
                    if !mode.is_64bit() {
                        if next & 0x8000_0000 == 0 {
                            next &= 0x00FF_FFFF;
                        } else {
                            next &= 0x7FFF_FFFF;
                        }
                    }
                }
            }
            // A BALR-type call instruction is two bytes long.
            Ok(Some(next.wrapping_sub(2)))
        }
        StackFormat::Down => {
            let rcb = caa.rcb(space)?;
            let osigx = mode.strip(space.read_word(mode, rcb + layout::rcb(mode).ceeosigx)?);
            if next == osigx {
                return Err(TraceError::unimplemented("down-stack signal glue return"));
            }
            // The descriptor NOP after the call encodes how long the call
            // instruction was.
            let descriptor = match space.read_u32(next) {
                Ok(word) => word,
                Err(e) => {
                    tracing::trace!(error = %e, next, "descriptor not captured");
                    return Ok(None);
                }
            };
            let expected = if mode.is_64bit() { 0x070 } else { 0x470 };
            if descriptor >> 20 != expected {
                tracing::trace!(descriptor, "no descriptor NOP at return point");
                return Ok(None);
            }
            let length = match (descriptor >> 16) & 0xF {
                0 => 2,
                1 => 4,
                3 => 6,
                other => {
                    tracing::trace!(call_type = other, "unrecognized call type");
                    return Ok(None);
                }
            };
            Ok(Some(next - length))
        }
    }
}

/// Scans the condition-block chain for the entry belonging to `frame`.
fn find_cib(space: &AddressSpace, caa: &Caa, frame: u64) -> Option<u64> {
    let mode = caa.mode();
    let header_lay = layout::cibh(mode);
    let cib_lay = layout::cib(mode);
    let hcom = caa.errcm(space).ok()?;
    let mut cursor = mode.strip(space.read_word(mode, hcom + layout::hcom(mode).cibh).ok()?);
    let mut previous = 0u64;
    let mut cib = 0u64;
    let mut count = 0usize;
    while cursor != 0 && cursor != previous && count < MAX_CIB_CHAIN {
        let in_use = space.read_u8(cursor + header_lay.in_use).ok()? != 0;
        cib = mode.strip(space.read_word(mode, cursor + header_lay.cib).ok()?);
        let owner = mode.strip(space.read_word(mode, cib + cib_lay.sv1).ok()?);
        if in_use && owner == frame {
            break;
        }
        previous = cursor;
        cursor = mode.strip(space.read_word(mode, cursor + header_lay.back).ok()?);
        count += 1;
    }
    if cursor == 0 || cursor == previous || count >= MAX_CIB_CHAIN {
        None
    } else {
        tracing::trace!(cib, frame, "found condition information block");
        Some(cib)
    }
}

/// Scans the exit-block chain for the entry belonging to `frame`.
fn find_sfxm(
    space: &AddressSpace,
    caa: &Caa,
    frame: u64,
    format: StackFormat,
) -> Result<Option<u64>, ReadError> {
    let mode = caa.mode();
    let hcom = caa.errcm(space)?;
    let head = mode.strip(space.read_word(mode, hcom + layout::hcom(mode).exit_stk)?);
    match format {
        StackFormat::Up => {
            // An up-stack block starts with NOPRs and a BALR; a down-stack
            // block starts with the XPLINK entry marker. Keep the last
            // matching block.
            let mut found = None;
            let mut cursor = head;
            let mut count = 0usize;
            while cursor != 0 && count < MAX_SFXM_CHAIN {
                let eyecatch = space.read_u64(cursor + sfxm::CODE_EYECATCH)?;
                if eyecatch >> 8 != sfxm::ENTRY_SIG {
                    let owner = mode.strip(space.read_word(mode, cursor + sfxm::PARM_SF)?);
                    let bkc = mode.strip(u64::from(space.read_u32(owner + ceedsa::BKC)?));
                    if bkc == frame {
                        found = Some(cursor);
                    }
                }
                cursor = mode.strip(space.read_word(mode, cursor + sfxm::NEXT)?);
                count += 1;
            }
            Ok(found)
        }
        StackFormat::Down => {
            let r7 = mode.strip(space.read_word(mode, frame + layout::dsahp(mode).r7)?);
            let mut cursor = head;
            let mut count = 0usize;
            while cursor != 0 && count < MAX_SFXM_CHAIN {
                if cursor + sfxm::CODE_RETURN_PT == r7 {
                    // Several blocks can stack up for one routine; walk to
                    // the last one, recognized by its saved register 7 no
                    // longer pointing at the next block's return point.
                    let mut current = cursor;
                    let mut next = mode.strip(space.read_word(mode, current + sfxm::NEXT)?);
                    let mut inner = 0usize;
                    while inner < MAX_SFXM_CHAIN
                        && next + sfxm::CODE_RETURN_PT
                            == mode.strip(space.read_word(mode, current + sfxm::SAVE_R7)?)
                    {
                        current = next;
                        next = mode.strip(space.read_word(mode, current + sfxm::NEXT)?);
                        inner += 1;
                    }
                    tracing::trace!(sfxm = current, frame, "found exit control block");
                    return Ok(Some(current));
                }
                cursor = match space.read_word(mode, cursor + sfxm::NEXT) {
                    Ok(word) => mode.strip(word),
                    Err(_) => {
                        tracing::trace!(cursor, "broken exit block chain");
                        0
                    }
                };
                count += 1;
            }
            Ok(None)
        }
    }
}

/// Best-effort lookup of the routine name for an entry point address,
/// memoized on the image.
///
/// This is the standalone flavor used to prettify addresses the walk
/// produced, independent of any frame. It recognizes the up-format entry
/// vector, a bare PPA1, the old load-module prologue that embeds the name
/// after a branch, and the down-format entry prefix. With `scan` set, it
/// searches backward word by word for up to 4 KB until one of those
/// matches.
pub fn entry_point_name(
    space: &AddressSpace,
    mode: AddrMode,
    entry: u64,
    scan: bool,
) -> Option<String> {
    if let Some(cached) = space.cached_name(entry) {
        return cached;
    }
    let mut name = None;
    if scan {
        let mask = if mode.is_64bit() {
            0xFFFF_FFFF_FFFF_FFFC
        } else {
            0x7FFF_FFFC
        };
        let mut address = (entry + 4) & mask;
        for _ in 0..NAME_SCAN_BYTES / 4 {
            if let Ok(Some(found)) = name_at(space, mode, address) {
                name = Some(found);
                break;
            }
            address = address.wrapping_sub(4);
        }
    } else {
        name = name_at(space, mode, entry).ok().flatten();
    }
    let name = name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty());
    space.cache_name(entry, name.clone());
    name
}

/// Tries to read a routine name assuming `entry` is an entry point.
fn name_at(space: &AddressSpace, mode: AddrMode, entry: u64) -> Result<Option<String>, ReadError> {
    let eye = space.read_u32(entry + oepv::EYECATCH)?;
    let name = if eye == 0x00C3_C5C5 || eye == 0x01C3_C5C5 {
        // Up-format entry vector; a leading 1 selects the doubled offset
        // encoding.
        let ppa1_addr = entry + u64::from(space.read_u32(entry + oepv::PPA1_OFFSET)?);
        let mut offset = u64::from(space.read_u8(ppa1_addr + ppa1::NMO)?);
        if eye == 0x01C3_C5C5 {
            offset *= 2;
        }
        space.read_ebcdic_string(ppa1_addr + offset).ok()
    } else if eye & 0x00FF_0000 == 0x00CE_0000 {
        // A bare PPA1 with the name offset in its first byte.
        space.read_ebcdic_string(entry + u64::from(eye >> 24)).ok()
    } else if space.read_u32(entry)? & 0xFFFF_F000 == 0x47F0_F000 {
        // Old-style prologue: a branch over a length-prefixed name.
        let len = u64::from(space.read_u8(entry + 4)?);
        space.read_ebcdic(entry + 5, len).ok()
    } else {
        let prefix = entry.wrapping_sub(hepv::ENTRY_POINT);
        if space.read_u64(prefix + hepv::EYECATCH)? == layout::ENTRY_EYECATCHER {
            let ppa1_addr = prefix + u64::from(space.read_u32(prefix + hepv::PPA1_OFFSET)?);
            let flag3 = space.read_u8(ppa1_addr + ppa1h::FLAG3)?;
            let flag4 = space.read_u8(ppa1_addr + ppa1h::FLAG4)?;
            let mut at = ppa1_addr + ppa1h::LEN;
            for bit in [0x80u8, 0x40, 0x20, 0x10, 0x08, 0x04, 0x02] {
                if flag3 & bit != 0 {
                    at += 4;
                }
            }
            if flag3 & 0x01 != 0 {
                at += 8;
            }
            if flag4 & 0x01 != 0 {
                space.read_ebcdic_string(at).ok()
            } else {
                None
            }
        } else {
            None
        }
    };
    Ok(name.filter(|n| is_valid_name(n)))
}
