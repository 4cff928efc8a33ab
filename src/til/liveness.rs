//! Liveness analysis and the interference graph.
//!
//! Standard backward dataflow over the CFG: `live_in(i) = use(i) ∪
//! (live_out(i) \ def(i))`, iterated to a fixed point with reverse
//! sweeps. Only virtual registers participate; immediates, accumulators
//! and special registers contribute nothing.

use std::collections::BTreeSet;

use log::debug;

use super::cfg::Cfg;
use super::{AssignCond, Instr, InstrKind, Reg, RegId, RegOrImm};
use crate::ast::VarId;

/// Sorted sparse set of virtual register ids.
pub type LiveSet = BTreeSet<VarId>;

// ─── Use/def extraction ───────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub struct UseDef {
    pub uses: Vec<VarId>,
    pub defs: Vec<VarId>,
}

/// Extract the used and defined virtual registers of one instruction.
///
/// A conditionally assigned destination is also a use: the unwritten
/// lanes keep their old value, so the old value must be live.
pub fn use_def(instr: &Instr) -> UseDef {
    let mut ud = UseDef::default();
    let mut operand = |o: &RegOrImm, uses: &mut Vec<VarId>| {
        if let RegOrImm::Reg(Reg::Virtual(v)) = o {
            if !uses.contains(v) {
                uses.push(*v);
            }
        }
    };
    match &instr.kind {
        InstrKind::LoadImm { cond, dest, .. } => {
            if let Reg::Virtual(v) = dest {
                ud.defs.push(*v);
                if matches!(cond, AssignCond::Flag(_)) {
                    ud.uses.push(*v);
                }
            }
        }
        InstrKind::Alu {
            cond,
            dest,
            src_a,
            src_b,
            ..
        } => {
            operand(src_a, &mut ud.uses);
            operand(src_b, &mut ud.uses);
            if let Reg::Virtual(v) = dest {
                ud.defs.push(*v);
                if matches!(cond, AssignCond::Flag(_)) && !ud.uses.contains(v) {
                    ud.uses.push(*v);
                }
            }
        }
        _ => {}
    }
    ud
}

// ─── Liveness ─────────────────────────────────────────────────────

pub struct Liveness {
    live_in: Vec<LiveSet>,
    use_defs: Vec<UseDef>,
}

impl Liveness {
    pub fn compute(cfg: &Cfg, instrs: &[Instr]) -> Liveness {
        let n = instrs.len();
        let use_defs: Vec<UseDef> = instrs.iter().map(use_def).collect();
        let mut live_in: Vec<LiveSet> = vec![LiveSet::new(); n];

        let mut sweeps = 0;
        loop {
            sweeps += 1;
            let mut changed = false;
            for i in (0..n).rev() {
                let mut set = LiveSet::new();
                for &s in cfg.successors(i) {
                    set.extend(live_in[s].iter().copied());
                }
                for d in &use_defs[i].defs {
                    set.remove(d);
                }
                set.extend(use_defs[i].uses.iter().copied());
                if set != live_in[i] {
                    live_in[i] = set;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        debug!("liveness: {} instructions, converged in {} sweeps", n, sweeps);

        Liveness { live_in, use_defs }
    }

    pub fn len(&self) -> usize {
        self.live_in.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live_in.is_empty()
    }

    pub fn live_in(&self, i: usize) -> &LiveSet {
        &self.live_in[i]
    }

    pub fn use_def(&self, i: usize) -> &UseDef {
        &self.use_defs[i]
    }

    /// `live_out(i)` is the union of the live-in sets of the successors.
    pub fn live_out(&self, cfg: &Cfg, i: usize) -> LiveSet {
        let mut out = LiveSet::new();
        for &s in cfg.successors(i) {
            out.extend(self.live_in[s].iter().copied());
        }
        out
    }
}

// ─── Interference graph ───────────────────────────────────────────

/// For each virtual register, the set of registers ever live at the same
/// time: the live-out set of every instruction forms a clique, and every
/// register defined at an instruction interferes with everything live
/// out of it.
pub struct LiveSets {
    sets: Vec<LiveSet>,
}

impl LiveSets {
    pub fn build(num_vars: usize, instrs: &[Instr], cfg: &Cfg, live: &Liveness) -> LiveSets {
        let mut sets = vec![LiveSet::new(); num_vars];

        for i in 0..instrs.len() {
            let live_out = live.live_out(cfg, i);
            for &rx in &live_out {
                for &ry in &live_out {
                    if rx != ry {
                        sets[rx as usize].insert(ry);
                    }
                }
                for &rd in &live.use_def(i).defs {
                    if rd != rx {
                        sets[rx as usize].insert(rd);
                        sets[rd as usize].insert(rx);
                    }
                }
            }
        }

        LiveSets { sets }
    }

    pub fn num_vars(&self) -> usize {
        self.sets.len()
    }

    pub fn neighbours(&self, v: VarId) -> &LiveSet {
        &self.sets[v as usize]
    }

    /// The registers of one file still legal for `v`: start from all
    /// free, knock out anything an interfering neighbour already holds.
    pub fn possible_registers(
        &self,
        v: VarId,
        alloc: &[Reg],
        file: RegFile,
        num_regs: u8,
    ) -> Vec<bool> {
        let mut possible = vec![true; num_regs as usize];
        for &n in self.neighbours(v) {
            match (file, alloc[n as usize]) {
                (RegFile::A, Reg::A(id)) | (RegFile::B, Reg::B(id)) => {
                    possible[id as usize] = false;
                }
                _ => {}
            }
        }
        possible
    }

    /// Lowest-numbered free register, if any.
    pub fn choose_register(possible: &[bool]) -> Option<RegId> {
        possible.iter().position(|&free| free).map(|i| i as RegId)
    }
}

/// Physical register file selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegFile {
    A,
    B,
}

// ─── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::til::{add, li, mov, AssignCond, Flag, Instr, InstrKind, Reg, SpecialReg};

    /// The hand-crafted scenario: v1 = 1; v2 = 2; v3 = v1 + v2; store v3.
    fn scenario() -> Vec<Instr> {
        vec![
            li(Reg::Virtual(1), 1),
            li(Reg::Virtual(2), 2),
            add(Reg::Virtual(3), Reg::Virtual(1), Reg::Virtual(2)),
            mov(Reg::Special(SpecialReg::TmuD), Reg::Virtual(3)),
            Instr::new(InstrKind::End),
        ]
    }

    #[test]
    fn test_liveness_scenario() {
        let instrs = scenario();
        let cfg = Cfg::build(&instrs).unwrap();
        let live = Liveness::compute(&cfg, &instrs);

        assert!(live.live_in(0).is_empty());
        assert_eq!(live.live_in(1).iter().copied().collect::<Vec<_>>(), [1]);
        assert_eq!(live.live_in(2).iter().copied().collect::<Vec<_>>(), [1, 2]);
        assert_eq!(live.live_in(3).iter().copied().collect::<Vec<_>>(), [3]);
    }

    #[test]
    fn test_fixed_point_is_stable() {
        let instrs = scenario();
        let cfg = Cfg::build(&instrs).unwrap();
        let live = Liveness::compute(&cfg, &instrs);

        // One more application of the dataflow equations changes nothing.
        for i in (0..instrs.len()).rev() {
            let mut set = LiveSet::new();
            for &s in cfg.successors(i) {
                set.extend(live.live_in(s).iter().copied());
            }
            for d in &live.use_def(i).defs {
                set.remove(d);
            }
            set.extend(live.use_def(i).uses.iter().copied());
            assert_eq!(&set, live.live_in(i));
        }
    }

    #[test]
    fn test_interference_symmetry() {
        let instrs = scenario();
        let cfg = Cfg::build(&instrs).unwrap();
        let live = Liveness::compute(&cfg, &instrs);
        let sets = LiveSets::build(4, &instrs, &cfg, &live);

        for v in 0..sets.num_vars() as VarId {
            for &n in sets.neighbours(v) {
                assert!(
                    sets.neighbours(n).contains(&v),
                    "edge ({}, {}) missing its mirror",
                    v,
                    n
                );
            }
        }
        assert!(sets.neighbours(1).contains(&2));
        assert!(sets.neighbours(2).contains(&1));
    }

    #[test]
    fn test_conditional_dest_is_also_a_use() {
        let i = mov(Reg::Virtual(5), 1).cond(AssignCond::Flag(Flag::Zc));
        let ud = use_def(&i);
        assert_eq!(ud.defs, [5]);
        assert!(ud.uses.contains(&5));
    }

    #[test]
    fn test_specials_do_not_contribute() {
        let i = mov(Reg::Virtual(0), Reg::Special(SpecialReg::UniformRead));
        let ud = use_def(&i);
        assert_eq!(ud.defs, [0]);
        assert!(ud.uses.is_empty());
    }

    #[test]
    fn test_possible_registers_excludes_neighbour_assignments() {
        let instrs = scenario();
        let cfg = Cfg::build(&instrs).unwrap();
        let live = Liveness::compute(&cfg, &instrs);
        let sets = LiveSets::build(4, &instrs, &cfg, &live);

        let mut alloc = vec![Reg::None; 4];
        alloc[1] = Reg::A(0);
        let possible = sets.possible_registers(2, &alloc, RegFile::A, 32);
        assert!(!possible[0]);
        assert_eq!(LiveSets::choose_register(&possible), Some(1));
    }
}
