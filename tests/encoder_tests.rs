//! Encoder round-trips and branch-offset resolution.

use reef::til::link::{insert_branch_delays, link};
use reef::til::{
    add, alu, branch, jump, label, li, mov, sub, AluOp, AssignCond, BranchCond, Flag, Instr,
    InstrKind, Label, Reg, SpecialReg,
};
use reef::{v3d, vc4};

fn representative_vc4() -> Vec<InstrKind> {
    vec![
        InstrKind::Nop,
        li(Reg::A(0), 0x1234_5678).kind,
        li(Reg::B(31), -1).pushz().kind,
        mov(Reg::A(1), Reg::Special(SpecialReg::UniformRead)).kind,
        mov(Reg::A(2), Reg::Special(SpecialReg::ElemNum)).kind,
        mov(Reg::Acc(1), Reg::Special(SpecialReg::QpuNum)).kind,
        add(Reg::A(3), Reg::A(1), Reg::B(2)).kind,
        sub(Reg::None, Reg::A(3), 7).pushz().kind,
        mov(Reg::A(4), 1).cond(AssignCond::Flag(Flag::Zc)).kind,
        alu(Reg::Acc(0), Reg::A(1), AluOp::FMul, Reg::B(1)).kind,
        alu(Reg::A(5), Reg::Acc(0), AluOp::Shl, 2).kind,
        mov(Reg::Special(SpecialReg::VpmWrite), Reg::A(3)).kind,
        mov(Reg::Special(SpecialReg::DmaStoreAddr), Reg::A(1)).kind,
        mov(Reg::A(6), Reg::Special(SpecialReg::VpmRead)).kind,
        mov(Reg::Special(SpecialReg::SfuRecip), Reg::Acc(0)).kind,
        InstrKind::DmaLoadWait,
        InstrKind::DmaStoreWait,
        InstrKind::SemaInc(7),
        InstrKind::SemaDec(2),
        InstrKind::Br {
            cond: BranchCond::Always,
            target: 10,
        },
        InstrKind::Br {
            cond: BranchCond::Any(Flag::Zc),
            target: -3,
        },
    ]
}

fn representative_v3d() -> Vec<InstrKind> {
    vec![
        InstrKind::Nop,
        InstrKind::Thrsw,
        li(Reg::A(7), i32::MAX).kind,
        mov(Reg::A(1), Reg::Special(SpecialReg::UniformRead)).kind,
        alu(Reg::A(2), Reg::None, AluOp::TIdx, Reg::None).kind,
        alu(Reg::A(3), Reg::None, AluOp::EIdx, Reg::None).kind,
        add(Reg::A(4), Reg::A(1), Reg::A(2)).kind,
        sub(Reg::None, Reg::A(4), 8).pushn().kind,
        mov(Reg::A(5), 1).cond(AssignCond::Flag(Flag::Ns)).kind,
        alu(Reg::A(6), Reg::A(4), AluOp::FMul, Reg::A(5)).kind,
        mov(Reg::Special(SpecialReg::TmuD), Reg::A(4)).kind,
        mov(Reg::Special(SpecialReg::TmuA), Reg::A(1)).kind,
        mov(Reg::Special(SpecialReg::Tmu0S), Reg::A(1)).kind,
        InstrKind::TmuWait,
        InstrKind::Tmu0ToAcc4,
        mov(Reg::A(8), Reg::Acc(4)).kind,
        mov(Reg::Special(SpecialReg::SfuSin), Reg::Acc(4)).kind,
        InstrKind::Br {
            cond: BranchCond::All(Flag::Zc),
            target: 12,
        },
    ]
}

#[test]
fn test_vc4_roundtrip() {
    for kind in representative_vc4() {
        let word = vc4::encode::encode(&kind).unwrap();
        assert_eq!(vc4::encode::decode(word), Some(kind.clone()), "{:?}", kind);
    }
}

#[test]
fn test_v3d_roundtrip() {
    for kind in representative_v3d() {
        let word = v3d::encode::encode(&kind).unwrap();
        assert_eq!(v3d::encode::decode(word), Some(kind.clone()), "{:?}", kind);
    }
}

#[test]
fn test_forward_branch_over_seven_instructions() {
    // brl; 7 instructions (delay slots included); target label.
    let mut instrs = vec![jump(Label(0))];
    for v in 0..4 {
        instrs.push(li(Reg::A(v), v as i32));
    }
    instrs.push(label(Label(0)));
    instrs.push(Instr::new(InstrKind::End));

    insert_branch_delays(&mut instrs);
    let linked = link(&instrs).unwrap();

    // 3 delay slots + 4 instructions = a span of 7.
    match linked[0].kind {
        InstrKind::Br { target, .. } => assert_eq!(target, 7 - 3),
        ref other => panic!("expected a linked branch, got {:?}", other),
    }
}

#[test]
fn test_linked_words_encode_on_both_platforms() {
    let instrs = vec![
        mov(Reg::A(0), Reg::Special(SpecialReg::UniformRead)),
        label(Label(0)),
        sub(Reg::A(0), Reg::A(0), 1).pushz(),
        branch(BranchCond::Any(Flag::Zc), Label(0)),
        Instr::new(InstrKind::End),
    ];
    let vc4_words = vc4::encode::encode_program(&instrs).unwrap();
    let v3d_words = v3d::encode::encode_program(&instrs).unwrap();
    // Branch + 3 delay nops + end expansion on both platforms.
    assert!(vc4_words.len() >= 8);
    assert!(v3d_words.len() >= 13);
}

#[test]
fn test_v3d_end_signature_order() {
    let words = v3d::encode::encode_program(&[Instr::new(InstrKind::End)]).unwrap();
    let thrsw: Vec<bool> = words.iter().map(|w| (w >> 53) & 1 != 0).collect();
    assert_eq!(
        thrsw,
        [true, true, false, false, false, true, false, false]
    );
}
