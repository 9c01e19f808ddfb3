//! Byte layouts of the LE control blocks.
//!
//! Everything in this module is a table of fixed field offsets over
//! untrusted dump bytes; there is no logic here. Blocks that changed shape
//! between releases or between bitness modes get one table per variant,
//! selected by the caller. Pointer-sized fields are read with
//! [`AddressSpace::read_word`](lewalk_dump::AddressSpace::read_word) at the
//! mode that selected the table.

use lewalk_dump::AddrMode;

/// First eyecatcher word of a CAA, "CEEC" in EBCDIC, at CAA − 0x18.
pub const CAA_EYE1: u32 = 0xC3C5_C5C3;

/// Second eyecatcher halfword of a CAA, "AA" in EBCDIC, in the top half of
/// the word at CAA − 0x14.
pub const CAA_EYE2: u32 = 0xC1C1_0000;

/// Back-chain sentinel marking a linkage-stack crossing.
pub const F1SA: u64 = 0xE6F1_E2C1;

/// Back-chain sentinel marking a transition record in an up-format frame.
pub const UP_TRANSITION_SENTINEL: u32 = 0xFFFF_FFFF;

/// Transition record type: call crossed from the up stack to the down stack.
pub const TRAN_UP_TO_DOWN: u32 = 2;

/// Transition record type: call crossed from the down stack to the up stack.
pub const TRAN_DOWN_TO_UP: u32 = 3;

/// Highest transition record type in use; greater values mean the record is
/// not a transition record at all.
pub const TRAN_KIND_MAX: u32 = 6;

/// The doubleword eyecatcher preceding a down-format entry point.
pub const ENTRY_EYECATCHER: u64 = 0x00C3_00C5_00C5_00F1;

/// Dynamic-stack-allocation flag in the frame-size word of an entry prefix.
pub const FRAME_FLAG_ALLOCA: u32 = 0x0000_0001;

/// Mask extracting the frame length from the frame-size word.
pub const FRAME_SIZE_MASK: u32 = 0xFFFF_FFF0;

/// Offset of the library anchor pointer in the extended TCB.
pub const STCB_LAA: u64 = 0x1A8;

/// Offset of the legacy CAA pointer in the TCB itself.
pub const TCB_CAA_PTR: u64 = 0x60;

/// Field offsets of the CAA, per bitness and release generation.
#[derive(Clone, Copy, Debug)]
pub struct CaaLayout {
    /// CEL level identifier (fullword).
    pub level: u64,
    /// Stack direction flag (byte); only meaningful at level 13 and up.
    pub stack_direction: u64,
    /// Storage manager control block pointer.
    pub smcb: u64,
    /// Region control block pointer.
    pub rcb: u64,
    /// Thread value block anchor.
    pub vba: u64,
    /// Dummy DSA address, the bottom-of-stack sentinel.
    pub ddsa: u64,
    /// Enclave data block pointer.
    pub edb: u64,
    /// Error-handling control block (HCOM) pointer.
    pub errcm: u64,
    /// pthread id (doubleword).
    pub thdid: u64,
}

/// 32-bit CAA, releases before 11.
pub const CAA_32: CaaLayout = CaaLayout {
    level: 0x2F8,
    stack_direction: 0x2FC,
    smcb: 0x2C4,
    rcb: 0x2C8,
    vba: 0x2CC,
    ddsa: 0x2D4,
    edb: 0x2D8,
    errcm: 0x2DC,
    thdid: 0x2E0,
};

/// 32-bit CAA, release 11 and up.
pub const CAA_32_R11: CaaLayout = CaaLayout {
    level: 0x308,
    stack_direction: 0x30C,
    smcb: 0x2D4,
    rcb: 0x2D8,
    vba: 0x2DC,
    ddsa: 0x2E4,
    edb: 0x2E8,
    errcm: 0x2EC,
    thdid: 0x2F0,
};

/// 64-bit CAA, releases before 11.
pub const CAA_64: CaaLayout = CaaLayout {
    level: 0x578,
    stack_direction: 0x57C,
    smcb: 0x4C0,
    rcb: 0x4C8,
    vba: 0x4D0,
    ddsa: 0x4E0,
    edb: 0x4E8,
    errcm: 0x4F0,
    thdid: 0x4F8,
};

/// 64-bit CAA, release 11 and up.
pub const CAA_64_R11: CaaLayout = CaaLayout {
    level: 0x598,
    stack_direction: 0x59C,
    smcb: 0x4E0,
    rcb: 0x4E8,
    vba: 0x4F0,
    ddsa: 0x500,
    edb: 0x508,
    errcm: 0x510,
    thdid: 0x518,
};

/// Selects the CAA layout for a bitness and product release.
pub fn caa_layout(mode: AddrMode, release: Option<u32>) -> &'static CaaLayout {
    let modern = release.map_or(false, |r| r >= 11);
    match (mode, modern) {
        (AddrMode::Bits32, false) => &CAA_32,
        (AddrMode::Bits32, true) => &CAA_32_R11,
        (AddrMode::Bits64, false) => &CAA_64,
        (AddrMode::Bits64, true) => &CAA_64_R11,
    }
}

/// Field offsets within an up-format (standard linkage) save area.
///
/// These are the classic 18-word save area slots plus the LE extensions;
/// all fields are fullwords regardless of mode, since the up stack only
/// exists in 31-bit processes.
pub mod ceedsa {
    /// Back chain to the caller's save area.
    pub const BKC: u64 = 0x04;
    /// Saved return address (register 14).
    pub const R14: u64 = 0x0C;
    /// Saved entry address (register 15).
    pub const R15: u64 = 0x10;
    /// Saved register 4, the down-stack pointer during a no-stack call.
    pub const R4: u64 = 0x24;
    /// Transition record pointer, overlaying the register 5 slot.
    pub const TRAN: u64 = 0x28;
    /// Dispatcher signature word.
    pub const HDSP_SIG: u64 = 0x48;
    /// Next-available-byte pointer.
    pub const NAB: u64 = 0x4C;
    /// Return address saved by the AMODE-switch glue.
    pub const MODE: u64 = 0x60;
}

/// Field offsets within a down-format (XPLINK) save area.
#[derive(Clone, Copy, Debug)]
pub struct DsahpLayout {
    /// Saved register 4, the caller's stack pointer.
    pub r4: u64,
    /// Saved register 6, the entry address on a BASR-style call.
    pub r6: u64,
    /// Saved register 7, the return address; zero marks a transition frame.
    pub r7: u64,
    /// Transition record pointer.
    pub tran: u64,
    /// Back-chain slot used when the frame did dynamic stack allocation.
    pub bkc: u64,
}

/// 31-bit XPLINK save area: fullword slots above the 2 KB stack bias.
pub const DSAHP_32: DsahpLayout = DsahpLayout {
    r4: 0x800,
    r6: 0x808,
    r7: 0x80C,
    tran: 0x830,
    bkc: 0x834,
};

/// 64-bit XPLINK save area: doubleword slots above the 2 KB stack bias.
pub const DSAHP_64: DsahpLayout = DsahpLayout {
    r4: 0x800,
    r6: 0x810,
    r7: 0x818,
    tran: 0x860,
    bkc: 0x868,
};

/// Selects the down-format save area layout for a mode.
pub fn dsahp(mode: AddrMode) -> &'static DsahpLayout {
    match mode {
        AddrMode::Bits32 => &DSAHP_32,
        AddrMode::Bits64 => &DSAHP_64,
    }
}

/// Field offsets within a stack transition record.
#[derive(Clone, Copy, Debug)]
pub struct TransitionLayout {
    /// Transition type (fullword).
    pub kind: u64,
    /// The frame on the far side of the transition.
    pub prev: u64,
    /// Entry point of the routine owning the transition.
    pub ep: u64,
    /// Return address across the transition.
    pub retaddr: u64,
}

/// 31-bit transition record.
pub const TRAN_32: TransitionLayout = TransitionLayout {
    kind: 0x00,
    prev: 0x08,
    ep: 0x0C,
    retaddr: 0x10,
};

/// 64-bit transition record.
pub const TRAN_64: TransitionLayout = TransitionLayout {
    kind: 0x00,
    prev: 0x08,
    ep: 0x10,
    retaddr: 0x18,
};

/// Selects the transition record layout for a mode.
pub fn transition(mode: AddrMode) -> &'static TransitionLayout {
    match mode {
        AddrMode::Bits32 => &TRAN_32,
        AddrMode::Bits64 => &TRAN_64,
    }
}

/// Field offsets within the HCOM, the error-handling control block.
#[derive(Clone, Copy, Debug)]
pub struct HcomLayout {
    /// Head of the condition information block header chain.
    pub cibh: u64,
    /// Head of the stack-frame exit control block chain.
    pub exit_stk: u64,
    /// Total length of the HCOM record.
    pub len: u64,
}

/// 31-bit HCOM.
pub const HCOM_32: HcomLayout = HcomLayout {
    cibh: 0x10,
    exit_stk: 0x14,
    len: 0x2C8,
};

/// 64-bit HCOM.
pub const HCOM_64: HcomLayout = HcomLayout {
    cibh: 0x20,
    exit_stk: 0x28,
    len: 0x4D0,
};

/// Selects the HCOM layout for a mode.
pub fn hcom(mode: AddrMode) -> &'static HcomLayout {
    match mode {
        AddrMode::Bits32 => &HCOM_32,
        AddrMode::Bits64 => &HCOM_64,
    }
}

/// Field offsets within a condition information block header.
#[derive(Clone, Copy, Debug)]
pub struct CibhLayout {
    /// In-use flag (byte).
    pub in_use: u64,
    /// Pointer to the condition information block proper.
    pub cib: u64,
    /// Previous header in the chain.
    pub back: u64,
}

/// 31-bit CIB header.
pub const CIBH_32: CibhLayout = CibhLayout {
    in_use: 0x08,
    cib: 0x0C,
    back: 0x10,
};

/// 64-bit CIB header.
pub const CIBH_64: CibhLayout = CibhLayout {
    in_use: 0x08,
    cib: 0x10,
    back: 0x18,
};

/// Selects the CIB header layout for a mode.
pub fn cibh(mode: AddrMode) -> &'static CibhLayout {
    match mode {
        AddrMode::Bits32 => &CIBH_32,
        AddrMode::Bits64 => &CIBH_64,
    }
}

/// Field offsets within a condition information block.
#[derive(Clone, Copy, Debug)]
pub struct CibLayout {
    /// The frame that owned the condition.
    pub sv1: u64,
    /// The interrupted instruction address.
    pub int_addr: u64,
}

/// 31-bit CIB.
pub const CIB_32: CibLayout = CibLayout {
    sv1: 0x20,
    int_addr: 0x24,
};

/// 64-bit CIB.
pub const CIB_64: CibLayout = CibLayout {
    sv1: 0x30,
    int_addr: 0x38,
};

/// Selects the CIB layout for a mode.
pub fn cib(mode: AddrMode) -> &'static CibLayout {
    match mode {
        AddrMode::Bits32 => &CIB_32,
        AddrMode::Bits64 => &CIB_64,
    }
}

/// Field offsets within the region control block.
#[derive(Clone, Copy, Debug)]
pub struct RcbLayout {
    /// Pointer to the PPA1 name-offset table.
    pub ppa1tabl: u64,
    /// Entry point of the down-stack signal glue routine.
    pub ceeosigx: u64,
}

/// 31-bit RCB.
pub const RCB_32: RcbLayout = RcbLayout {
    ppa1tabl: 0x40,
    ceeosigx: 0x44,
};

/// 64-bit RCB.
pub const RCB_64: RcbLayout = RcbLayout {
    ppa1tabl: 0x70,
    ceeosigx: 0x78,
};

/// Selects the RCB layout for a mode.
pub fn rcb(mode: AddrMode) -> &'static RcbLayout {
    match mode {
        AddrMode::Bits32 => &RCB_32,
        AddrMode::Bits64 => &RCB_64,
    }
}

/// Field offsets within the enclave data block.
#[derive(Clone, Copy, Debug)]
pub struct EdbLayout {
    /// Entry point of the up-stack signal glue routine.
    pub ceeosigr: u64,
    /// Key data block anchor.
    pub dba: u64,
}

/// 31-bit EDB.
pub const EDB_32: EdbLayout = EdbLayout {
    ceeosigr: 0x30,
    dba: 0x34,
};

/// 64-bit EDB.
pub const EDB_64: EdbLayout = EdbLayout {
    ceeosigr: 0x50,
    dba: 0x58,
};

/// Selects the EDB layout for a mode.
pub fn edb(mode: AddrMode) -> &'static EdbLayout {
    match mode {
        AddrMode::Bits32 => &EDB_32,
        AddrMode::Bits64 => &EDB_64,
    }
}

/// Offset of the down-stack bottom pointer in the storage manager control
/// block.
pub const SMCB_DSBOS: u64 = 0x18;

/// Offset of the stack floor in a stack segment header.
pub const STKH_STACKFLOOR: u64 = 0x08;

/// Field offsets within the 64-bit library anchor area.
pub mod laa {
    /// Library control area pointer.
    pub const LCA: u64 = 0x48;
    /// Storage anchor pointer.
    pub const SANC: u64 = 0x50;
    /// Stack floor of the active segment.
    pub const STACKFLOOR: u64 = 0x58;
}

/// Field offsets within the 64-bit library control area.
pub mod lca {
    /// CAA pointer.
    pub const CAA: u64 = 0x08;
    /// Register 4 saved across a no-stack call.
    pub const SAVSTACK: u64 = 0x10;
}

/// Field offsets within the 64-bit storage anchor.
pub mod sanc {
    /// Bottom of the active stack segment.
    pub const BOS: u64 = 0x10;
    /// Active stack.
    pub const STACK: u64 = 0x18;
    /// User stack.
    pub const USER_STACK: u64 = 0x20;
    /// Floor of the user stack.
    pub const USER_FLOOR: u64 = 0x28;
}

/// Field offsets within a stack-frame exit control block (SFXM).
pub mod sfxm {
    /// Code eyecatcher doubleword.
    pub const CODE_EYECATCH: u64 = 0x00;
    /// Offset of the return point within the block's glue code.
    pub const CODE_RETURN_PT: u64 = 0x10;
    /// Next block in the chain.
    pub const NEXT: u64 = 0x30;
    /// Saved register 7.
    pub const SAVE_R7: u64 = 0x40;
    /// The up-stack frame the block was planted for.
    pub const PARM_SF: u64 = 0x48;
    /// The entry-marker signature distinguishing down-stack blocks, compared
    /// against the eyecatcher shifted right by one byte.
    pub const ENTRY_SIG: u64 = 0x00C3_00C5_00C5_00;
}

/// Field offsets within an up-format entry point vector.
pub mod oepv {
    /// The pre-CEL entry word, a branch instruction in wrapped transfer
    /// vectors.
    pub const OLDEP: u64 = 0x00;
    /// Eyecatcher word: a name-offset byte followed by "CEE".
    pub const EYECATCH: u64 = 0x04;
    /// The name-offset byte of the eyecatcher word.
    pub const NAME_OFFS: u64 = 0x04;
    /// Offset from the vector to the PPA1.
    pub const PPA1_OFFSET: u64 = 0x0C;
    /// Total vector length.
    pub const LEN: u64 = 0x14;
    /// The "CEE" portion of the eyecatcher word.
    pub const EYE: u32 = 0x00C3_C5C5;
}

/// Field offsets within an up-format PPA1.
pub mod ppa1 {
    /// Offset-to-name byte.
    pub const NMO: u64 = 0x00;
    /// Signature byte, 0xCE for CEL-enabled code.
    pub const SIG: u64 = 0x03;
    /// The signature value.
    pub const EYE: u8 = 0xCE;
}

/// Field offsets within a down-format PPA1 header.
pub mod ppa1h {
    /// Offset from the PPA1 to the PPA2.
    pub const PPA2_OFF: u64 = 0x04;
    /// Optional-area flags byte.
    pub const FLAG3: u64 = 0x0A;
    /// Name-presence flags byte.
    pub const FLAG4: u64 = 0x0B;
    /// Fixed header length; the optional areas and the name follow.
    pub const LEN: u64 = 0x14;
}

/// Field offsets within a down-format entry prefix, the block immediately
/// before an XPLINK entry point.
pub mod hepv {
    /// Eyecatcher doubleword, [`ENTRY_EYECATCHER`](super::ENTRY_EYECATCHER).
    pub const EYECATCH: u64 = 0x00;
    /// Offset from the prefix to the PPA1.
    pub const PPA1_OFFSET: u64 = 0x08;
    /// Frame-size and flags word.
    pub const FRAME_SIZE: u64 = 0x0C;
    /// Offset of the entry point itself, i.e. the prefix length.
    pub const ENTRY_POINT: u64 = 0x10;
}
