//! v3d back-end: VideoCore VI lowering, allocation and encoding.
//!
//! v3d does all general loads and stores through the TMU and derives the
//! per-QPU id from the thread index at runtime. Register allocation uses
//! file A only; exhausting it is fatal.

pub mod encode;

use crate::ast::Stmt;
use crate::error::CompileError;
use crate::platform::Platform;
use crate::til::cfg::Cfg;
use crate::til::translate::{
    init_insert_index, set_mask_flags, SourceTranslate, TranslateCtx, MASK_COND,
};
use crate::til::{
    add, alloc, alu, band, branch, label, li, mov, satisfy, shl, AluOp, AssignCond, BranchCond,
    Flag, Instr, InstrKind, Reg, RegOrImm, SpecialReg, ACC0, ACC1, ACC4,
};

pub struct V3d;

impl SourceTranslate for V3d {
    fn platform(&self) -> Platform {
        Platform::V3d
    }

    /// v3d has no QPU-id register; the dispatch prepends the QPU count
    /// as a hidden first uniform and the init block branches on it.
    fn prelude(
        &self,
        seq: &mut Vec<Instr>,
        ctx: &mut TranslateCtx,
    ) -> Result<(), CompileError> {
        let qpus = ctx.fresh_var()?;
        seq.push(
            mov(qpus, Reg::Special(SpecialReg::UniformRead)).comment("load uniform 'qpus'"),
        );
        ctx.num_qpus_var = qpus.virtual_id();
        Ok(())
    }

    fn stmt(
        &self,
        _seq: &mut Vec<Instr>,
        _s: &Stmt,
        _ctx: &mut TranslateCtx,
    ) -> Result<bool, CompileError> {
        Ok(false)
    }

    /// TMU store: data to `tmud`, addresses to `tmua`, then `tmuwt`.
    /// A mask turns both writes into per-lane conditional moves; the TMU
    /// writes only the lanes whose address was delivered.
    fn deref_var_var(
        &self,
        seq: &mut Vec<Instr>,
        data: RegOrImm,
        addr: Reg,
        mask: Option<Reg>,
        _ctx: &mut TranslateCtx,
    ) -> Result<(), CompileError> {
        let cond = match mask {
            None => AssignCond::Always,
            Some(m) => {
                set_mask_flags(seq, m);
                MASK_COND
            }
        };
        seq.push(
            mov(Reg::Special(SpecialReg::TmuD), data)
                .cond(cond)
                .comment("store request"),
        );
        seq.push(mov(Reg::Special(SpecialReg::TmuA), addr).cond(cond));
        seq.push(Instr::new(InstrKind::TmuWait));
        Ok(())
    }

    /// TMU load. The two NOP slots between the address write and the
    /// receive are load-bearing; no later pass may touch them.
    fn varassign_deref_var(
        &self,
        seq: &mut Vec<Instr>,
        dest: Reg,
        addr: Reg,
        cond: AssignCond,
        _ctx: &mut TranslateCtx,
    ) -> Result<(), CompileError> {
        seq.push(
            mov(Reg::Special(SpecialReg::Tmu0S), addr)
                .cond(cond)
                .comment("load request"),
        );
        seq.push(Instr::nop());
        seq.push(Instr::nop());
        seq.push(Instr::new(InstrKind::Tmu0ToAcc4));
        seq.push(mov(dest, ACC4).cond(cond));
        Ok(())
    }

    /// Derive the QPU id (`me = (tidx >> 2) & 0xF` when dispatched on 8
    /// QPUs, else 0), compute `offset = 4 * (elem + 16 * me)` and add it
    /// to every uniform pointer. A TMU-read enable sequence follows the
    /// init block.
    fn add_init(
        &self,
        instrs: &mut Vec<Instr>,
        ctx: &mut TranslateCtx,
    ) -> Result<(), CompileError> {
        let at = init_insert_index(instrs)?;
        let qpus = ctx.num_qpus_var.ok_or_else(|| {
            CompileError::Internal("v3d init block without the qpus uniform".to_string())
        })?;
        let me = ctx.fresh_var()?;
        let endif = ctx.fresh_label();

        let mut init = Vec::new();
        init.push(li(me, 0).header("Set QPU id: me = (tidx >> 2) & 0xF when 8 QPUs"));
        init.push(sub_imm(Reg::Virtual(qpus), 8).pushz());
        init.push(branch(BranchCond::All(Flag::Zc), endif));
        init.push(alu(ACC0, Reg::None, AluOp::TIdx, Reg::None));
        init.push(alu(ACC0, ACC0, AluOp::Shr, RegOrImm::from(2)));
        init.push(band(me, ACC0, 15));
        init.push(label(endif));

        init.push(
            shl(ACC1, me, 4).header("offset = 4 * (elem_num + 16 * qpu_num)"),
        );
        init.push(alu(ACC0, Reg::None, AluOp::EIdx, Reg::None));
        init.push(add(ACC1, ACC1, ACC0));
        init.push(shl(ACC0, ACC1, 2));
        for &v in &ctx.uniform_ptrs {
            init.push(add(Reg::Virtual(v), Reg::Virtual(v), ACC0));
        }
        instrs.splice(at..at, init);

        // Thread switch before the body enables the deep TMU request
        // queue; keep it glued to the end of the init block.
        let end = instrs
            .iter()
            .position(|i| matches!(i.kind, InstrKind::InitEnd))
            .ok_or_else(|| CompileError::Internal("missing init-end marker".to_string()))?;
        instrs.splice(
            end + 1..end + 1,
            vec![
                Instr::new(InstrKind::Thrsw).header("Enable TMU reads"),
                Instr::nop(),
                Instr::nop(),
            ],
        );
        Ok(())
    }

    fn reg_alloc(
        &self,
        cfg: &Cfg,
        instrs: &mut [Instr],
        num_vars: usize,
    ) -> Result<(), CompileError> {
        alloc::allocate(cfg, instrs, num_vars, Platform::V3d.regfile_size(), false)
    }

    fn satisfy(&self, instrs: &mut Vec<Instr>) {
        satisfy::satisfy_v3d(instrs);
    }

    fn encode(&self, instrs: &[Instr]) -> Result<Vec<u64>, CompileError> {
        encode::encode_program(instrs)
    }
}

/// `dest - imm` discarding the result; only the flags matter.
fn sub_imm(src: Reg, imm: i32) -> Instr {
    alu(Reg::None, src, AluOp::Sub, imm)
}

// ─── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_request_shape() {
        let mut seq = Vec::new();
        let mut ctx = TranslateCtx::new(Platform::V3d, 2);
        V3d.deref_var_var(
            &mut seq,
            Reg::Virtual(0).into(),
            Reg::Virtual(1),
            None,
            &mut ctx,
        )
        .unwrap();
        assert_eq!(seq.len(), 3);
        assert!(matches!(seq[2].kind, InstrKind::TmuWait));
    }

    #[test]
    fn test_load_keeps_two_delay_slots() {
        let mut seq = Vec::new();
        let mut ctx = TranslateCtx::new(Platform::V3d, 2);
        V3d.varassign_deref_var(
            &mut seq,
            Reg::Virtual(0),
            Reg::Virtual(1),
            AssignCond::Always,
            &mut ctx,
        )
        .unwrap();
        assert!(matches!(seq[1].kind, InstrKind::Nop));
        assert!(matches!(seq[2].kind, InstrKind::Nop));
        assert!(matches!(seq[3].kind, InstrKind::Tmu0ToAcc4));
    }

    #[test]
    fn test_masked_store_conditions_both_writes() {
        let mut seq = Vec::new();
        let mut ctx = TranslateCtx::new(Platform::V3d, 3);
        V3d.deref_var_var(
            &mut seq,
            Reg::Virtual(0).into(),
            Reg::Virtual(1),
            Some(Reg::Virtual(2)),
            &mut ctx,
        )
        .unwrap();
        let conditional = seq
            .iter()
            .filter(|i| matches!(i.kind, InstrKind::Alu { cond: MASK_COND, .. }))
            .count();
        assert_eq!(conditional, 2);
    }

    #[test]
    fn test_init_block_branches_on_qpu_count() {
        let mut instrs = vec![
            mov(Reg::Virtual(0), Reg::Special(SpecialReg::UniformRead)),
            mov(Reg::Virtual(1), Reg::Special(SpecialReg::UniformRead)),
            Instr::new(InstrKind::InitBegin),
            Instr::new(InstrKind::InitEnd),
            Instr::new(InstrKind::End),
        ];
        let mut ctx = TranslateCtx::new(Platform::V3d, 2);
        ctx.num_qpus_var = Some(0);
        ctx.uniform_ptrs.push(1);
        V3d.add_init(&mut instrs, &mut ctx).unwrap();

        assert!(instrs
            .iter()
            .any(|i| matches!(i.kind, InstrKind::Brl { .. })));
        assert!(instrs
            .iter()
            .any(|i| matches!(i.kind, InstrKind::Thrsw)));
        // The prologue stays CFG-buildable.
        assert!(Cfg::build(&instrs).is_ok());
    }
}
