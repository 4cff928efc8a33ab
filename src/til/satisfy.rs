//! Operand-constraint peephole.
//!
//! The TIL deliberately allows ALU instructions that read two operands
//! from the same physical register file; the hardware does not. This pass
//! runs after allocation and restores encodability by routing one operand
//! through accumulator 0. The inserted moves are unconditional and never
//! touch flags, so they are safe between a flag-setting instruction and
//! its conditional consumer.

use super::{mov, AluOp, Instr, InstrKind, Reg, RegOrImm, SpecialReg, ACC0};

/// Register file a vc4 register reads through, if any. Special registers
/// with a fixed read port count against that port; the uniform stream is
/// readable through either.
fn file_of(r: Reg) -> Option<char> {
    match r {
        Reg::A(_) => Some('a'),
        Reg::B(_) => Some('b'),
        Reg::Special(SpecialReg::ElemNum | SpecialReg::VpmRead) => Some('a'),
        Reg::Special(SpecialReg::QpuNum) => Some('b'),
        _ => None,
    }
}

/// Resolve vc4 operand conflicts: two reads from one register file, and
/// a small immediate (which occupies the file-B read port) paired with a
/// file-B register.
pub fn satisfy_vc4(instrs: &mut Vec<Instr>) {
    let mut i = 0;
    while i < instrs.len() {
        let fix = match &instrs[i].kind {
            InstrKind::Alu {
                src_a, op, src_b, ..
            } if *op != AluOp::Nop => conflict_vc4(*src_a, *src_b),
            _ => None,
        };
        if let Some(victim) = fix {
            let (src_a, src_b) = match &mut instrs[i].kind {
                InstrKind::Alu { src_a, src_b, .. } => (src_a, src_b),
                _ => unreachable!(),
            };
            let moved = if victim == 0 { *src_a } else { *src_b };
            if victim == 0 {
                *src_a = RegOrImm::Reg(ACC0);
            } else {
                *src_b = RegOrImm::Reg(ACC0);
            }
            instrs.insert(i, mov(ACC0, moved).comment("operand through accumulator"));
            i += 1; // skip the inserted move
        }
        i += 1;
    }
}

/// Which operand (0 = a, 1 = b) must move to an accumulator, if any.
fn conflict_vc4(src_a: RegOrImm, src_b: RegOrImm) -> Option<usize> {
    match (src_a, src_b) {
        (RegOrImm::Reg(a), RegOrImm::Reg(b)) => {
            match (file_of(a), file_of(b)) {
                // Same file, same register is one read port — fine.
                (Some(fa), Some(fb)) if fa == fb && a != b => Some(0),
                _ => None,
            }
        }
        // A small immediate rides the file-B read port.
        (RegOrImm::Reg(a), RegOrImm::Imm(_)) if file_of(a) == Some('b') => Some(0),
        (RegOrImm::Imm(_), RegOrImm::Reg(b)) if file_of(b) == Some('b') => Some(1),
        _ => None,
    }
}

/// v3d has one register file and reads it through two ports, so file
/// duplication is legal; only the immediate slot needs normalizing.
/// An immediate in the A slot moves to B, or through the accumulator
/// when both slots carry one.
pub fn satisfy_v3d(instrs: &mut Vec<Instr>) {
    let mut i = 0;
    while i < instrs.len() {
        let fix = match &instrs[i].kind {
            InstrKind::Alu {
                src_a: RegOrImm::Imm(_),
                op,
                src_b,
                ..
            } if *op != AluOp::Nop => match src_b {
                RegOrImm::Imm(_) => Some(FixV3d::ThroughAcc),
                RegOrImm::Reg(_) => Some(FixV3d::Swap),
            },
            _ => None,
        };
        match fix {
            Some(FixV3d::Swap) => {
                if let InstrKind::Alu {
                    src_a, op, src_b, ..
                } = &mut instrs[i].kind
                {
                    if commutes(*op) {
                        std::mem::swap(src_a, src_b);
                    } else {
                        let moved = *src_a;
                        *src_a = RegOrImm::Reg(ACC0);
                        instrs.insert(i, mov(ACC0, moved));
                        i += 1;
                    }
                }
            }
            Some(FixV3d::ThroughAcc) => {
                if let InstrKind::Alu { src_a, .. } = &mut instrs[i].kind {
                    let moved = *src_a;
                    *src_a = RegOrImm::Reg(ACC0);
                    instrs.insert(i, mov(ACC0, moved));
                    i += 1;
                }
            }
            None => {}
        }
        i += 1;
    }
}

enum FixV3d {
    Swap,
    ThroughAcc,
}

fn commutes(op: AluOp) -> bool {
    matches!(
        op,
        AluOp::Add
            | AluOp::Min
            | AluOp::Max
            | AluOp::Bor
            | AluOp::Band
            | AluOp::Bxor
            | AluOp::FAdd
            | AluOp::FMin
            | AluOp::FMax
            | AluOp::Mul24
            | AluOp::FMul
    )
}

// ─── Tests ────────────────────────────────────────────────────────
