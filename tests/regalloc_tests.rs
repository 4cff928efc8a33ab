//! Register allocator properties: capacity, validity, idempotence.

use reef::error::CompileError;
use reef::til::alloc::allocate;
use reef::til::cfg::Cfg;
use reef::til::liveness::{LiveSets, Liveness};
use reef::til::{add, li, Instr, InstrKind, Reg, SpecialReg};

/// `n` virtual registers that are all live at the same time.
fn clique(n: u32) -> Vec<Instr> {
    let mut instrs: Vec<Instr> = (0..n).map(|v| li(Reg::Virtual(v), v as i32)).collect();
    for v in 0..n {
        instrs.push(add(
            Reg::Special(SpecialReg::TmuD),
            Reg::Virtual(v),
            Reg::Virtual((v + 1) % n),
        ));
    }
    instrs.push(Instr::new(InstrKind::End));
    instrs
}

fn assigned_regs(instrs: &[Instr]) -> Vec<Reg> {
    instrs
        .iter()
        .filter_map(|i| match i.kind {
            InstrKind::LoadImm { dest, .. } => Some(dest),
            _ => None,
        })
        .collect()
}

#[test]
fn test_32_mutually_live_vregs_fit_one_file() {
    let mut instrs = clique(32);
    let cfg = Cfg::build(&instrs).unwrap();
    allocate(&cfg, &mut instrs, 32, 32, false).unwrap();
    let regs = assigned_regs(&instrs);
    assert!(regs.iter().all(|r| matches!(r, Reg::A(_))));
}

#[test]
fn test_33rd_vreg_overflows_into_file_b_on_vc4() {
    let mut instrs = clique(33);
    let cfg = Cfg::build(&instrs).unwrap();
    allocate(&cfg, &mut instrs, 33, 32, true).unwrap();
    let regs = assigned_regs(&instrs);
    assert!(regs.iter().any(|r| matches!(r, Reg::B(_))));
}

#[test]
fn test_33rd_vreg_is_fatal_on_a_single_file() {
    let mut instrs = clique(33);
    let cfg = Cfg::build(&instrs).unwrap();
    let err = allocate(&cfg, &mut instrs, 33, 32, false).unwrap_err();
    match err {
        CompileError::RegisterPressure {
            vreg,
            instr,
            mnemonic,
        } => {
            assert_eq!(vreg, 32);
            assert_eq!(instr, 32);
            assert!(mnemonic.contains("v32"), "diagnostic: {}", mnemonic);
        }
        other => panic!("expected RegisterPressure, got {:?}", other),
    }
}

#[test]
fn test_no_interfering_pair_shares_a_register() {
    let mut instrs = clique(40);
    let cfg = Cfg::build(&instrs).unwrap();

    let live = Liveness::compute(&cfg, &instrs);
    let sets = LiveSets::build(40, &instrs, &cfg, &live);

    allocate(&cfg, &mut instrs, 40, 32, true).unwrap();
    let regs = assigned_regs(&instrs);
    for v in 0..40u32 {
        for &n in sets.neighbours(v) {
            assert_ne!(
                regs[v as usize], regs[n as usize],
                "v{} and v{} interfere but share {:?}",
                v, n, regs[v as usize]
            );
        }
    }
}

#[test]
fn test_reallocation_is_a_no_op() {
    let mut instrs = clique(20);
    let cfg = Cfg::build(&instrs).unwrap();
    allocate(&cfg, &mut instrs, 20, 32, true).unwrap();
    let once = instrs.clone();
    allocate(&cfg, &mut instrs, 20, 32, true).unwrap();
    assert_eq!(once, instrs);
}

#[test]
fn test_no_virtual_register_survives_allocation() {
    let mut instrs = clique(10);
    let cfg = Cfg::build(&instrs).unwrap();
    allocate(&cfg, &mut instrs, 10, 32, false).unwrap();
    for instr in &instrs {
        let mut probe = instr.clone();
        let clean = std::cell::Cell::new(true);
        probe.map_regs(&|r| {
            if r.is_virtual() {
                clean.set(false);
            }
            r
        });
        assert!(clean.get(), "virtual register in `{}`", instr.mnemonic());
    }
}
