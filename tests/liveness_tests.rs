//! Dataflow analysis properties over hand-crafted and lowered code.

use reef::ast::VarId;
use reef::til::cfg::Cfg;
use reef::til::liveness::{LiveSet, LiveSets, Liveness};
use reef::til::{
    add, branch, label, li, mov, sub, BranchCond, Flag, Instr, InstrKind, Label, Reg, SpecialReg,
};

/// v1 = 1; v2 = 2; v3 = v1 + v2; store v3.
fn straight_line() -> Vec<Instr> {
    vec![
        li(Reg::Virtual(1), 1),
        li(Reg::Virtual(2), 2),
        add(Reg::Virtual(3), Reg::Virtual(1), Reg::Virtual(2)),
        mov(Reg::Special(SpecialReg::TmuD), Reg::Virtual(3)),
        Instr::new(InstrKind::End),
    ]
}

fn analyse(instrs: &[Instr]) -> (Cfg, Liveness) {
    let cfg = Cfg::build(instrs).unwrap();
    let live = Liveness::compute(&cfg, instrs);
    (cfg, live)
}

#[test]
fn test_live_in_sets_of_the_reference_chain() {
    let instrs = straight_line();
    let (_, live) = analyse(&instrs);

    let set = |i: usize| live.live_in(i).iter().copied().collect::<Vec<VarId>>();
    assert_eq!(set(0), Vec::<VarId>::new());
    assert_eq!(set(1), vec![1]);
    assert_eq!(set(2), vec![1, 2]);
    assert_eq!(set(3), vec![3]);
}

#[test]
fn test_fixed_point_is_stable_across_a_loop() {
    // v0 counts down; v1 is live around the back edge.
    let instrs = vec![
        li(Reg::Virtual(0), 10),
        li(Reg::Virtual(1), 3),
        label(Label(0)),
        sub(Reg::Virtual(0), Reg::Virtual(0), Reg::Virtual(1)).pushz(),
        branch(BranchCond::Any(Flag::Zc), Label(0)),
        Instr::new(InstrKind::End),
    ];
    let (cfg, live) = analyse(&instrs);

    for i in (0..instrs.len()).rev() {
        let mut expect = LiveSet::new();
        for &s in cfg.successors(i) {
            expect.extend(live.live_in(s).iter().copied());
        }
        for d in &live.use_def(i).defs {
            expect.remove(d);
        }
        expect.extend(live.use_def(i).uses.iter().copied());
        assert_eq!(&expect, live.live_in(i), "instruction {}", i);
    }
    // v1 is live throughout the loop body.
    assert!(live.live_in(3).contains(&1));
}

#[test]
fn test_cfg_successors_are_valid() {
    let instrs = vec![
        li(Reg::Virtual(0), 1),
        branch(BranchCond::All(Flag::Zs), Label(1)),
        li(Reg::Virtual(0), 2),
        label(Label(1)),
        Instr::new(InstrKind::End),
    ];
    let cfg = Cfg::build(&instrs).unwrap();
    for i in 0..cfg.len() {
        for &s in cfg.successors(i) {
            assert!(s < instrs.len());
        }
    }
    // Conditional branch: target plus fall-through.
    assert_eq!(cfg.successors(1), &[3, 2]);
}

#[test]
fn test_interference_graph_is_symmetric() {
    let instrs = straight_line();
    let (cfg, live) = analyse(&instrs);
    let sets = LiveSets::build(4, &instrs, &cfg, &live);

    for v in 0..4u32 {
        for &n in sets.neighbours(v) {
            assert!(
                sets.neighbours(n).contains(&v),
                "edge ({}, {}) has no mirror",
                v,
                n
            );
        }
    }
}

#[test]
fn test_simultaneously_live_vregs_interfere() {
    let instrs = straight_line();
    let (cfg, live) = analyse(&instrs);
    let sets = LiveSets::build(4, &instrs, &cfg, &live);

    assert!(sets.neighbours(1).contains(&2));
    // v3 is defined while nothing else is live out.
    assert!(!sets.neighbours(3).contains(&1));
}
