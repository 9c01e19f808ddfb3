//! Register resolution strategy order and validation retries.

mod common;

use common::{write_caa32, z_linkage_entry, MockTcb, SpaceBuilder};
use lewalk_mvs::{rtm2, RegisterSet, LSED1PC};
use lewalk_stack::{layout, resolve_registers, Caa, RegisterSource, StackFormat};

const CAA: u64 = 0x10000;
const HCOM: u64 = 0x12000;
const RTWA: u64 = 0x13000;
const FRAMES: u64 = 0x4_0000;
const DDSA: u64 = 0x4_3000;

fn frame(i: u64) -> u64 {
    FRAMES + i * 0x100
}

/// A 32-bit up-direction thread whose frames chain from `frame(0)` through
/// `depth - 1` frames to the dummy frame.
fn up_space(depth: u64) -> SpaceBuilder {
    let mut b = SpaceBuilder::new();
    b.segment(0x1000, 0x200)
        .segment(0xF000, 0x3000)
        .segment(HCOM, 0x800)
        .segment(RTWA, 0x100)
        .segment(FRAMES, 0x10000)
        .u32(0x1000, 0x1100)
        .u32(0x1120, CAA as u32);
    write_caa32(&mut b, CAA, 3, 0, DDSA as u32);
    b.u32(CAA + layout::CAA_32.errcm, HCOM as u32);
    for i in 0..depth {
        let next = if i + 1 == depth { DDSA } else { frame(i + 1) };
        b.u32(frame(i) + 4, next as u32);
    }
    b
}

fn locate(space: &lewalk_dump::AddressSpace) -> (Caa, MockTcb) {
    let mut tcb = MockTcb::at(0x9000);
    tcb.celap = Some(0x1000);
    let caa = Caa::locate(space, &tcb).expect("CAA should validate");
    (caa, tcb)
}

fn regs_r13(r13: u64, psw: u64) -> RegisterSet {
    let mut regs = RegisterSet::new();
    regs.set_gpr(13, r13);
    regs.set_psw(psw);
    regs
}

#[test]
fn recovery_work_area_wins_over_later_sources() {
    let mut b = up_space(3);
    // Error-time registers: register 13 at the top frame.
    b.u32(RTWA + rtm2::RTM2EREG + 13 * 4, frame(0) as u32)
        .u64(RTWA + rtm2::RTM2APSW, 0x8002_4680);
    let space = b.build();
    let (caa, mut tcb) = locate(&space);
    tcb.rtwa = Some(RTWA);
    // A perfectly good kernel capture that must never be consulted.
    tcb.kernel = Some(regs_r13(frame(0), 0x8009_9990));

    let resolved = resolve_registers(&space, &tcb, &caa).expect("registers should resolve");
    assert_eq!(resolved.source, RegisterSource::RecoveryWorkArea);
    assert_eq!(resolved.frame_pointer, frame(0));
    assert_eq!(resolved.format, StackFormat::Up);
    assert!(resolved.failing);
    assert_eq!(resolved.registers.unwrap().psw(), 0x8002_4680);
}

#[test]
fn kernel_capture_is_the_second_resort() {
    let space = up_space(3).build();
    let (caa, mut tcb) = locate(&space);
    tcb.kernel = Some(regs_r13(frame(0), 0x8009_9990));

    let resolved = resolve_registers(&space, &tcb, &caa).expect("registers should resolve");
    assert_eq!(resolved.source, RegisterSource::KernelService);
    assert!(!resolved.failing);
}

#[test]
fn linkage_stack_entries_match_on_address_space() {
    let mut b = up_space(3);
    b.asid(0x2A);
    let space = b.build();
    let (caa, mut tcb) = locate(&space);
    tcb.linkage = vec![
        // Wrong address space; must be skipped.
        z_linkage_entry(0x17, LSED1PC, &[(13, frame(0))]),
        z_linkage_entry(0x2A, LSED1PC, &[(13, frame(0))]),
    ];

    let resolved = resolve_registers(&space, &tcb, &caa).expect("registers should resolve");
    assert_eq!(resolved.source, RegisterSource::LinkageStack);
    assert_eq!(resolved.frame_pointer, frame(0));
}

#[test]
fn tcb_resident_registers_are_the_fourth_resort() {
    let space = up_space(3).build();
    let (caa, mut tcb) = locate(&space);
    tcb.saved = Some(regs_r13(frame(0), 0));

    let resolved = resolve_registers(&space, &tcb, &caa).expect("registers should resolve");
    assert_eq!(resolved.source, RegisterSource::ControlBlock);
}

#[test]
fn invalid_candidates_fall_through_to_the_next_source() {
    let space = up_space(3).build();
    let (caa, mut tcb) = locate(&space);
    // Kernel registers point into unmapped storage; the TCB copy is good.
    tcb.kernel = Some(regs_r13(0x9_0000, 0));
    tcb.saved = Some(regs_r13(frame(0), 0));

    let resolved = resolve_registers(&space, &tcb, &caa).expect("registers should resolve");
    assert_eq!(resolved.source, RegisterSource::ControlBlock);
}

#[test]
fn no_stack_call_is_rescued_by_one_warning_retry() {
    const SMCB: u64 = 0x11000;
    const SEG_TOP: u64 = 0x3_0000;
    const UP_FRAME: u64 = 0x2_0100;
    const DOWN_FRAME: u64 = 0x2_8000;
    const TRAN: u64 = 0x2_8900;

    let mut b = SpaceBuilder::new();
    b.segment(0x1000, 0x200)
        .segment(0xF000, 0x3000)
        .segment(HCOM, 0x800)
        .segment(RTWA, 0x100)
        .segment(0x2_0000, 0x10000)
        .segment(SEG_TOP, 0x100)
        .u32(0x1000, 0x1100)
        .u32(0x1120, CAA as u32);
    // Down-direction thread at level 13.
    write_caa32(&mut b, CAA, 13, 1, 0x5_0000);
    b.u32(CAA + layout::CAA_32.errcm, HCOM as u32)
        .u32(CAA + layout::CAA_32.smcb, SMCB as u32)
        // Live down segment: floor 0x20000, top 0x30000.
        .u32(SMCB + layout::SMCB_DSBOS, SEG_TOP as u32)
        .u32(SEG_TOP + layout::STKH_STACKFLOOR, 0x2_0000)
        // The up frame the registers claim as register 13; its register 4
        // slot carries the real down-stack pointer.
        .u32(UP_FRAME + layout::ceedsa::R4, DOWN_FRAME as u32)
        // The down frame is a transition frame chaining to the dummy frame.
        .u32(DOWN_FRAME + layout::DSAHP_32.tran as u64, TRAN as u32)
        .u32(TRAN, layout::TRAN_UP_TO_DOWN)
        .u32(TRAN + 0x08, 0x5_0000)
        // Error-time registers: register 4 is junk, register 13 points into
        // the live down segment.
        .u32(RTWA + rtm2::RTM2EREG + 4 * 4, 0x9_0000)
        .u32(RTWA + rtm2::RTM2EREG + 13 * 4, UP_FRAME as u32);
    let space = b.build();
    let (caa, mut tcb) = locate(&space);
    assert_eq!(caa.stack_direction(), StackFormat::Down);
    tcb.rtwa = Some(RTWA);

    let resolved = resolve_registers(&space, &tcb, &caa).expect("registers should resolve");
    assert_eq!(resolved.source, RegisterSource::RecoveryWorkArea);
    assert_eq!(resolved.format, StackFormat::Down);
    assert_eq!(resolved.frame_pointer, DOWN_FRAME);
}

#[test]
fn save_area_scan_accepts_unvalidated_registers_on_depth() {
    // Five chained frames, but the chain dies before the dummy frame, so
    // standard validation rejects it.
    let mut b = up_space(5);
    b.u32(frame(4) + 4, 0);
    let space = b.build();
    let (caa, mut tcb) = locate(&space);
    tcb.usta = Some(regs_r13(frame(0), 0));

    let resolved = resolve_registers(&space, &tcb, &caa).expect("registers should resolve");
    assert_eq!(resolved.source, RegisterSource::SaveAreaScan);
    assert_eq!(resolved.frame_pointer, frame(0));
}

#[test]
fn exhausting_every_source_reports_no_stack() {
    let space = up_space(3).build();
    let (caa, tcb) = locate(&space);
    assert!(resolve_registers(&space, &tcb, &caa).is_none());
}
