//! vc4 back-end: VideoCore IV lowering, allocation and encoding.
//!
//! vc4 moves data between main memory and the QPU through the VPM and
//! the DMA controller; there is no general-purpose TMU path. Register
//! allocation may spread across both register files A and B.

pub mod dma;
pub mod encode;

use crate::ast::Stmt;
use crate::error::CompileError;
use crate::platform::Platform;
use crate::til::cfg::Cfg;
use crate::til::translate::{
    init_insert_index, set_mask_flags, SourceTranslate, TranslateCtx, MASK_COND,
};
use crate::til::{
    add, alloc, li, mov, satisfy, shl, AssignCond, Instr, InstrKind, Reg, RegOrImm, SpecialReg,
    ACC0, ACC1,
};

pub struct Vc4;

/// VPM row used as the staging area for every transfer.
const STAGE_ROW: u32 = 0;

fn wr_setup() -> Reg {
    Reg::Special(SpecialReg::WrSetup)
}

fn rd_setup() -> Reg {
    Reg::Special(SpecialReg::RdSetup)
}

/// DMA-load a full row at `addr` and read it into `dest`.
fn load_row(seq: &mut Vec<Instr>, dest: Reg, addr: Reg, cond: AssignCond) {
    seq.push(
        li(rd_setup(), dma::dma_load_setup(16, 1, STAGE_ROW)).comment("load request"),
    );
    seq.push(mov(Reg::Special(SpecialReg::DmaLoadAddr), addr));
    seq.push(Instr::new(InstrKind::DmaLoadWait));
    seq.push(li(rd_setup(), dma::vpm_read_setup(1, 1, STAGE_ROW)));
    seq.push(mov(dest, Reg::Special(SpecialReg::VpmRead)).cond(cond));
}

/// Write `data` into the staging row and DMA-store it to `addr`.
fn store_row(seq: &mut Vec<Instr>, data: RegOrImm, addr: Reg) {
    seq.push(li(wr_setup(), dma::vpm_write_setup(1, STAGE_ROW)).comment("store request"));
    seq.push(mov(Reg::Special(SpecialReg::VpmWrite), data));
    seq.push(li(wr_setup(), dma::dma_store_setup(1, 16, STAGE_ROW)));
    seq.push(mov(Reg::Special(SpecialReg::DmaStoreAddr), addr));
    seq.push(Instr::new(InstrKind::DmaStoreWait));
}

impl SourceTranslate for Vc4 {
    fn platform(&self) -> Platform {
        Platform::Vc4
    }

    fn stmt(
        &self,
        seq: &mut Vec<Instr>,
        s: &Stmt,
        _ctx: &mut TranslateCtx,
    ) -> Result<bool, CompileError> {
        match s {
            Stmt::SemaInc(id) => {
                seq.push(Instr::new(InstrKind::SemaInc(*id)));
                Ok(true)
            }
            Stmt::SemaDec(id) => {
                seq.push(Instr::new(InstrKind::SemaDec(*id)));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn deref_var_var(
        &self,
        seq: &mut Vec<Instr>,
        data: RegOrImm,
        addr: Reg,
        mask: Option<Reg>,
        ctx: &mut TranslateCtx,
    ) -> Result<(), CompileError> {
        match mask {
            None => store_row(seq, data, addr),
            // A DMA store always writes the full row, so a masked store
            // is load-merge-store: fetch the old row, overwrite the
            // enabled lanes, write the row back.
            Some(m) => {
                let merged = ctx.fresh_var()?;
                load_row(seq, merged, addr, AssignCond::Always);
                set_mask_flags(seq, m);
                seq.push(mov(merged, data).cond(MASK_COND));
                store_row(seq, merged.into(), addr);
            }
        }
        Ok(())
    }

    fn varassign_deref_var(
        &self,
        seq: &mut Vec<Instr>,
        dest: Reg,
        addr: Reg,
        cond: AssignCond,
        _ctx: &mut TranslateCtx,
    ) -> Result<(), CompileError> {
        load_row(seq, dest, addr, cond);
        Ok(())
    }

    /// offset = 4 * (elem_num + 16 * qpu_num), added to every uniform
    /// pointer. The QPU id comes straight off the `qpu_num` special.
    fn add_init(
        &self,
        instrs: &mut Vec<Instr>,
        ctx: &mut TranslateCtx,
    ) -> Result<(), CompileError> {
        let at = init_insert_index(instrs)?;

        let mut init = Vec::new();
        init.push(
            mov(ACC1, Reg::Special(SpecialReg::QpuNum))
                .header("Per-QPU uniform pointer offset\noffset = 4 * (elem_num + 16 * qpu_num)"),
        );
        init.push(shl(ACC1, ACC1, 4));
        init.push(add(ACC1, ACC1, Reg::Special(SpecialReg::ElemNum)));
        init.push(shl(ACC0, ACC1, 2));
        for &v in &ctx.uniform_ptrs {
            init.push(add(Reg::Virtual(v), Reg::Virtual(v), ACC0));
        }

        instrs.splice(at..at, init);
        Ok(())
    }

    fn reg_alloc(
        &self,
        cfg: &Cfg,
        instrs: &mut [Instr],
        num_vars: usize,
    ) -> Result<(), CompileError> {
        alloc::allocate(cfg, instrs, num_vars, Platform::Vc4.regfile_size(), true)
    }

    fn satisfy(&self, instrs: &mut Vec<Instr>) {
        satisfy::satisfy_vc4(instrs);
    }

    fn encode(&self, instrs: &[Instr]) -> Result<Vec<u64>, CompileError> {
        encode::encode_program(instrs)
    }
}

// ─── Tests ────────────────────────────────────────────────────────
