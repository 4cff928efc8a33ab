//! Frontend lowering: source AST to TIL.
//!
//! A single deterministic walk of the statement sequence, left-to-right
//! and depth-first through expressions. Expression lowering returns the
//! operand holding the result; statement lowering emits a deterministic
//! instruction prefix per statement kind.
//!
//! The walk is parameterized by a [`SourceTranslate`] implementation: the
//! platform claims its exclusive statements, supplies the pointer
//! load/store sequences, owns register allocation, and encodes the final
//! instruction stream.
//!
//! `Where` lowers through 16-lane masks: the boolean expression becomes a
//! 0/1 vector, nesting ANDs the vectors, and assignments under a mask
//! become flag-tested conditional moves.

use log::trace;

use crate::ast::{BExpr, BaseType, CmpId, Cond, Expr, OpId, Stmt, Var, VarId};
use crate::error::CompileError;
use crate::platform::{Platform, MAX_VREGS};

use super::cfg::Cfg;
use super::{
    alu, band, branch, bxor, jump, label, li, lif, mov, AluOp, AssignCond, BranchCond, Flag,
    Instr, InstrKind, Label, Reg, RegOrImm, SmallImm, SpecialReg, ACC4,
};

// ─── Platform hook set ────────────────────────────────────────────

/// The callback set a platform back-end provides to the shared frontend.
pub trait SourceTranslate {
    fn platform(&self) -> Platform;

    /// Emit hidden leading uniforms (v3d loads the QPU count here).
    fn prelude(
        &self,
        _seq: &mut Vec<Instr>,
        _ctx: &mut TranslateCtx,
    ) -> Result<(), CompileError> {
        Ok(())
    }

    /// Claim a platform-exclusive statement. Returns `true` when handled.
    fn stmt(
        &self,
        seq: &mut Vec<Instr>,
        s: &Stmt,
        ctx: &mut TranslateCtx,
    ) -> Result<bool, CompileError>;

    /// Pointer store: `*addr = data`, optionally under a lane mask.
    fn deref_var_var(
        &self,
        seq: &mut Vec<Instr>,
        data: RegOrImm,
        addr: Reg,
        mask: Option<Reg>,
        ctx: &mut TranslateCtx,
    ) -> Result<(), CompileError>;

    /// Pointer load: `dest = *addr`, with a per-lane write condition.
    fn varassign_deref_var(
        &self,
        seq: &mut Vec<Instr>,
        dest: Reg,
        addr: Reg,
        cond: AssignCond,
        ctx: &mut TranslateCtx,
    ) -> Result<(), CompileError>;

    /// Write the init-block prologue between the `InitBegin`/`InitEnd`
    /// markers: derive the per-QPU id and offset every uniform pointer.
    fn add_init(&self, instrs: &mut Vec<Instr>, ctx: &mut TranslateCtx)
        -> Result<(), CompileError>;

    /// Liveness, interference, coloring and rewrite.
    fn reg_alloc(
        &self,
        cfg: &Cfg,
        instrs: &mut [Instr],
        num_vars: usize,
    ) -> Result<(), CompileError>;

    /// Post-allocation operand-constraint peephole.
    fn satisfy(&self, instrs: &mut Vec<Instr>);

    /// Delay-slot scheduling, label linking and binary encoding.
    fn encode(&self, instrs: &[Instr]) -> Result<Vec<u64>, CompileError>;
}

/// Back-end factory.
pub fn create_translate(platform: Platform) -> Box<dyn SourceTranslate> {
    match platform {
        Platform::Vc4 => Box::new(crate::vc4::Vc4),
        Platform::V3d => Box::new(crate::v3d::V3d),
    }
}

// ─── Translation context ──────────────────────────────────────────

/// Mutable state threaded through lowering and the back-end passes.
#[derive(Debug)]
pub struct TranslateCtx {
    platform: Platform,
    next_var: u32,
    next_label: u32,
    /// Virtual registers holding uniform pointers; the init block adds
    /// the per-QPU offset to each.
    pub uniform_ptrs: Vec<VarId>,
    /// v3d: the vreg holding the hidden QPU-count uniform.
    pub num_qpus_var: Option<VarId>,
    current_stmt: String,
}

impl TranslateCtx {
    pub fn new(platform: Platform, num_vars: u32) -> Self {
        Self {
            platform,
            next_var: num_vars,
            next_label: 0,
            uniform_ptrs: Vec::new(),
            num_qpus_var: None,
            current_stmt: String::new(),
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn fresh_var(&mut self) -> Result<Reg, CompileError> {
        if self.next_var as usize >= MAX_VREGS {
            return Err(CompileError::VregSaturation {
                limit: MAX_VREGS,
                stmt: self.current_stmt.clone(),
            });
        }
        let v = self.next_var;
        self.next_var += 1;
        Ok(Reg::Virtual(v))
    }

    pub fn fresh_label(&mut self) -> Label {
        let l = self.next_label;
        self.next_label += 1;
        Label(l)
    }

    pub fn num_vars(&self) -> usize {
        self.next_var as usize
    }
}

/// Index of the `InitBegin` marker; the back-end inserts its prologue
/// right after it.
pub fn init_insert_index(instrs: &[Instr]) -> Result<usize, CompileError> {
    instrs
        .iter()
        .position(|i| matches!(i.kind, InstrKind::InitBegin))
        .map(|i| i + 1)
        .ok_or_else(|| CompileError::Internal("missing init-begin marker".to_string()))
}

/// Set the Z flags from a mask vector: Z is set exactly on the lanes
/// where the mask is false.
pub fn set_mask_flags(seq: &mut Vec<Instr>, mask: Reg) {
    seq.push(mov(Reg::None, mask).pushz());
}

/// Lanes where the mask is true have Z clear.
pub const MASK_COND: AssignCond = AssignCond::Flag(Flag::Zc);

// ─── Kernel source ────────────────────────────────────────────────

/// Kinds of kernel parameter; the order of declaration is the order of
/// the uniform tape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    IntPtr,
    FloatPtr,
    Int,
    Float,
}

impl ParamKind {
    pub fn is_ptr(self) -> bool {
        matches!(self, ParamKind::IntPtr | ParamKind::FloatPtr)
    }
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub kind: ParamKind,
    pub var: VarId,
}

/// A complete kernel as produced by the DSL builder.
pub struct KernelSrc {
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    pub num_vars: u32,
}

// ─── Entry point ──────────────────────────────────────────────────

/// Lower a kernel to the TIL. Returns the instruction list plus the
/// context the remaining passes need.
pub fn translate(
    src: &KernelSrc,
    plat: &dyn SourceTranslate,
) -> Result<(Vec<Instr>, TranslateCtx), CompileError> {
    let mut ctx = TranslateCtx::new(plat.platform(), src.num_vars);
    let mut tr = Translator {
        plat,
        ctx: &mut ctx,
        seq: Vec::new(),
    };

    plat.prelude(&mut tr.seq, tr.ctx)?;

    for param in &src.params {
        let instr = mov(Reg::Virtual(param.var), Reg::Special(SpecialReg::UniformRead))
            .comment(format!("load uniform '{}'", param.name));
        tr.seq.push(instr);
        if param.kind.is_ptr() {
            tr.ctx.uniform_ptrs.push(param.var);
        }
    }
    tr.seq.push(Instr::new(InstrKind::InitBegin));
    tr.seq.push(Instr::new(InstrKind::InitEnd));

    for s in &src.body {
        tr.stmt(s, None)?;
    }
    tr.seq.push(Instr::new(InstrKind::End));

    let seq = tr.seq;
    trace!("lowered kernel:\n{}", super::mnemonics(&seq, true));
    Ok((seq, ctx))
}

// ─── The walk ─────────────────────────────────────────────────────

struct Translator<'a> {
    plat: &'a dyn SourceTranslate,
    ctx: &'a mut TranslateCtx,
    seq: Vec<Instr>,
}

impl Translator<'_> {
    fn stmt(&mut self, s: &Stmt, mask: Option<Reg>) -> Result<(), CompileError> {
        self.ctx.current_stmt = s.describe();
        if self.plat.stmt(&mut self.seq, s, self.ctx)? {
            return Ok(());
        }

        match s {
            Stmt::Assign { lhs, rhs } => self.assign(*lhs, rhs, mask),
            Stmt::LoadRequest { dest, addr } => self.load_request(*dest, addr, mask),
            Stmt::StoreRequest { data, addr } => {
                let data = self.expr(data.as_ref())?;
                let addr = self.expr_to_reg(addr.as_ref())?;
                self.plat
                    .deref_var_var(&mut self.seq, data, addr, mask, self.ctx)
            }
            Stmt::Where {
                cond,
                then_body,
                else_body,
            } => self.where_stmt(cond, then_body, else_body, mask),
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                self.reject_under_mask(mask, "If")?;
                self.if_stmt(cond, then_body, else_body)
            }
            Stmt::While { cond, body } => {
                self.reject_under_mask(mask, "While")?;
                self.while_stmt(cond, body)
            }
            // Claimed by the vc4 back-end; reaching here means v3d.
            Stmt::SemaInc(_) | Stmt::SemaDec(_) => Err(CompileError::Unsupported {
                construct: "semaphore intrinsic".to_string(),
                platform: self.ctx.platform(),
            }),
        }
    }

    fn reject_under_mask(&self, mask: Option<Reg>, what: &str) -> Result<(), CompileError> {
        if mask.is_some() {
            return Err(CompileError::Unsupported {
                construct: format!("{} inside Where", what),
                platform: self.ctx.platform(),
            });
        }
        Ok(())
    }

    // ── Assignments ───────────────────────────────────────────────

    fn assign(&mut self, lhs: Var, rhs: &Expr, mask: Option<Reg>) -> Result<(), CompileError> {
        let dest = self.var_reg(lhs)?;
        if let Expr::Deref(addr) = rhs {
            return self.deref_into(dest, &**addr, mask);
        }
        match mask {
            None => self.expr_into(dest, rhs),
            Some(m) => {
                let r = self.expr(rhs)?;
                set_mask_flags(&mut self.seq, m);
                self.seq.push(mov(dest, r).cond(MASK_COND));
                Ok(())
            }
        }
    }

    fn load_request(
        &mut self,
        dest: Var,
        addr: &Expr,
        mask: Option<Reg>,
    ) -> Result<(), CompileError> {
        let dest = self.var_reg(dest)?;
        self.deref_into(dest, addr, mask)
    }

    fn deref_into(
        &mut self,
        dest: Reg,
        addr: &Expr,
        mask: Option<Reg>,
    ) -> Result<(), CompileError> {
        let addr = self.expr_to_reg(addr)?;
        let cond = match mask {
            None => AssignCond::Always,
            Some(m) => {
                set_mask_flags(&mut self.seq, m);
                MASK_COND
            }
        };
        self.plat
            .varassign_deref_var(&mut self.seq, dest, addr, cond, self.ctx)
    }

    fn var_reg(&mut self, v: Var) -> Result<Reg, CompileError> {
        match v {
            Var::Standard(id) => Ok(Reg::Virtual(id)),
            Var::QpuNum | Var::ElemNum => Err(CompileError::TypeMismatch(format!(
                "cannot assign to read-only variable {}",
                v
            ))),
        }
    }

    // ── Masked blocks ─────────────────────────────────────────────

    fn where_stmt(
        &mut self,
        cond: &BExpr,
        then_body: &[Stmt],
        else_body: &[Stmt],
        enclosing: Option<Reg>,
    ) -> Result<(), CompileError> {
        let m = self.bexpr_mask(cond)?;

        let then_mask = self.combine_mask(enclosing, m)?;
        for s in then_body {
            self.stmt(s, Some(then_mask))?;
        }

        if !else_body.is_empty() {
            let not_m = self.ctx.fresh_var()?;
            self.seq.push(bxor(not_m, m, 1));
            let else_mask = self.combine_mask(enclosing, not_m)?;
            for s in else_body {
                self.stmt(s, Some(else_mask))?;
            }
        }
        Ok(())
    }

    /// Nested `Where` masks AND together.
    fn combine_mask(&mut self, enclosing: Option<Reg>, m: Reg) -> Result<Reg, CompileError> {
        match enclosing {
            None => Ok(m),
            Some(e) => {
                let t = self.ctx.fresh_var()?;
                self.seq.push(band(t, e, m));
                Ok(t)
            }
        }
    }

    // ── Structured control flow ───────────────────────────────────

    /// Evaluate a branch condition: mask, flags, then the lane reduction.
    fn branch_cond(&mut self, cond: &Cond) -> Result<BranchCond, CompileError> {
        let m = self.bexpr_mask(cond.bexpr())?;
        set_mask_flags(&mut self.seq, m);
        Ok(match cond {
            Cond::Any(_) => BranchCond::Any(Flag::Zc),
            Cond::All(_) => BranchCond::All(Flag::Zc),
        })
    }

    fn if_stmt(
        &mut self,
        cond: &Cond,
        then_body: &[Stmt],
        else_body: &[Stmt],
    ) -> Result<(), CompileError> {
        let else_label = self.ctx.fresh_label();
        let bc = self.branch_cond(cond)?;
        self.seq.push(branch(bc.negate(), else_label));

        for s in then_body {
            self.stmt(s, None)?;
        }

        if else_body.is_empty() {
            self.seq.push(label(else_label));
        } else {
            let end_label = self.ctx.fresh_label();
            self.seq.push(jump(end_label));
            self.seq.push(label(else_label));
            for s in else_body {
                self.stmt(s, None)?;
            }
            self.seq.push(label(end_label));
        }
        Ok(())
    }

    /// Entry-guarded, bottom-tested loop: the back-branch re-evaluates
    /// the condition after the body, the guard preserves while semantics.
    fn while_stmt(&mut self, cond: &Cond, body: &[Stmt]) -> Result<(), CompileError> {
        let top_label = self.ctx.fresh_label();
        let end_label = self.ctx.fresh_label();

        let bc = self.branch_cond(cond)?;
        self.seq.push(branch(bc.negate(), end_label));
        self.seq.push(label(top_label));

        for s in body {
            self.stmt(s, None)?;
        }

        let bc = self.branch_cond(cond)?;
        self.seq.push(branch(bc, top_label));
        self.seq.push(label(end_label));
        Ok(())
    }

    // ── Expressions ───────────────────────────────────────────────

    /// Lower an expression to an operand, materializing into a fresh
    /// virtual register where needed.
    fn expr(&mut self, e: &Expr) -> Result<RegOrImm, CompileError> {
        match e {
            Expr::Var(Var::Standard(id)) => Ok(Reg::Virtual(*id).into()),
            Expr::IntLit(i) if SmallImm::encodable(*i) => Ok(RegOrImm::Imm(SmallImm(*i))),
            _ => {
                let t = self.ctx.fresh_var()?;
                self.expr_into(t, e)?;
                Ok(t.into())
            }
        }
    }

    fn expr_to_reg(&mut self, e: &Expr) -> Result<Reg, CompileError> {
        match self.expr(e)? {
            RegOrImm::Reg(r) => Ok(r),
            RegOrImm::Imm(imm) => {
                let t = self.ctx.fresh_var()?;
                self.seq.push(li(t, imm.0));
                Ok(t)
            }
        }
    }

    /// Lower an expression directly into `dest`.
    fn expr_into(&mut self, dest: Reg, e: &Expr) -> Result<(), CompileError> {
        match e {
            Expr::Var(v) => self.var_into(dest, *v),
            Expr::IntLit(i) => {
                self.seq.push(li(dest, *i));
                Ok(())
            }
            Expr::FloatLit(x) => {
                self.seq.push(lif(dest, *x));
                Ok(())
            }
            Expr::Apply { lhs, op, rhs } => {
                let alu_op = alu_op_for(op.id, op.ty)?;
                let a = self.expr(lhs)?;
                let b = self.expr(rhs)?;
                // Two immediates cannot share the one immediate slot.
                let a = if matches!((a, b), (RegOrImm::Imm(_), RegOrImm::Imm(_))) {
                    let t = self.ctx.fresh_var()?;
                    self.expr_into(t, lhs)?;
                    t.into()
                } else {
                    a
                };
                self.seq.push(alu(dest, a, alu_op, b));
                Ok(())
            }
            Expr::Unary { op, expr } => {
                if op.is_sfu() {
                    let x = self.expr(expr)?;
                    return self.sfu_into(dest, sfu_reg(op.id)?, x);
                }
                let alu_op = alu_op_for(op.id, op.ty)?;
                let x = self.expr(expr)?;
                self.seq.push(alu(dest, x, alu_op, x));
                Ok(())
            }
            Expr::Deref(addr) => {
                let addr = self.expr_to_reg(addr)?;
                self.plat.varassign_deref_var(
                    &mut self.seq,
                    dest,
                    addr,
                    AssignCond::Always,
                    self.ctx,
                )
            }
        }
    }

    fn var_into(&mut self, dest: Reg, v: Var) -> Result<(), CompileError> {
        match (v, self.ctx.platform()) {
            (Var::Standard(id), _) => {
                self.seq.push(mov(dest, Reg::Virtual(id)));
                Ok(())
            }
            (Var::ElemNum, Platform::Vc4) => {
                self.seq.push(mov(dest, Reg::Special(SpecialReg::ElemNum)));
                Ok(())
            }
            (Var::ElemNum, Platform::V3d) => {
                self.seq.push(alu(dest, Reg::None, AluOp::EIdx, Reg::None));
                Ok(())
            }
            (Var::QpuNum, Platform::Vc4) => {
                self.seq.push(mov(dest, Reg::Special(SpecialReg::QpuNum)));
                Ok(())
            }
            (Var::QpuNum, Platform::V3d) => {
                // me = (tidx >> 2) & 0xF
                self.seq.push(alu(dest, Reg::None, AluOp::TIdx, Reg::None));
                self.seq.push(alu(dest, dest, AluOp::Shr, 2));
                self.seq.push(band(dest, dest, 15));
                Ok(())
            }
        }
    }

    /// SFU call: operand to the function register, two slots, ACC4 out.
    fn sfu_into(
        &mut self,
        dest: Reg,
        sfu: SpecialReg,
        x: RegOrImm,
    ) -> Result<(), CompileError> {
        self.seq
            .push(mov(Reg::Special(sfu), x).comment(format!("sfu {}", sfu.name())));
        self.seq.push(Instr::nop());
        self.seq.push(Instr::nop());
        self.seq.push(mov(dest, ACC4));
        Ok(())
    }

    // ── Boolean expressions to masks ──────────────────────────────

    /// Lower a boolean expression to a fresh 0/1 mask vector.
    fn bexpr_mask(&mut self, b: &BExpr) -> Result<Reg, CompileError> {
        match b {
            BExpr::Cmp(c) => {
                // Comparisons reduce to the sign/zero flags of a
                // subtraction; > and <= swap the operand order.
                let (flag, swapped) = match c.op.id {
                    CmpId::Eq => (Flag::Zs, false),
                    CmpId::Neq => (Flag::Zc, false),
                    CmpId::Lt => (Flag::Ns, false),
                    CmpId::Ge => (Flag::Nc, false),
                    CmpId::Gt => (Flag::Ns, true),
                    CmpId::Le => (Flag::Nc, true),
                };
                let (lhs, rhs) = if swapped {
                    (&c.rhs, &c.lhs)
                } else {
                    (&c.lhs, &c.rhs)
                };
                let a = self.expr(lhs)?;
                let b2 = self.expr(rhs)?;
                let a = if matches!((a, b2), (RegOrImm::Imm(_), RegOrImm::Imm(_))) {
                    let t = self.ctx.fresh_var()?;
                    self.expr_into(t, lhs)?;
                    t.into()
                } else {
                    a
                };
                let op = if c.op.ty.is_float() {
                    AluOp::FSub
                } else {
                    AluOp::Sub
                };
                let cmp = alu(Reg::None, a, op, b2);
                let cmp = match flag {
                    Flag::Zs | Flag::Zc => cmp.pushz(),
                    Flag::Ns | Flag::Nc => cmp.pushn(),
                };
                self.seq.push(cmp);

                let m = self.ctx.fresh_var()?;
                self.seq.push(li(m, 0));
                self.seq.push(li(m, 1).cond(AssignCond::Flag(flag)));
                Ok(m)
            }
            BExpr::Not(x) => {
                let mx = self.bexpr_mask(x)?;
                let m = self.ctx.fresh_var()?;
                self.seq.push(bxor(m, mx, 1));
                Ok(m)
            }
            BExpr::And(x, y) => {
                let mx = self.bexpr_mask(x)?;
                let my = self.bexpr_mask(y)?;
                let m = self.ctx.fresh_var()?;
                self.seq.push(band(m, mx, my));
                Ok(m)
            }
            BExpr::Or(x, y) => {
                let mx = self.bexpr_mask(x)?;
                let my = self.bexpr_mask(y)?;
                let m = self.ctx.fresh_var()?;
                self.seq.push(super::bor(m, mx, my));
                Ok(m)
            }
        }
    }
}

// ─── Operator mapping ─────────────────────────────────────────────

fn alu_op_for(op: OpId, ty: BaseType) -> Result<AluOp, CompileError> {
    let float = ty.is_float();
    let int_only = |alu: AluOp| -> Result<AluOp, CompileError> {
        if float {
            Err(CompileError::TypeMismatch(format!(
                "integer operator `{:?}` applied to float operands",
                op
            )))
        } else {
            Ok(alu)
        }
    };
    match op {
        OpId::Add => Ok(if float { AluOp::FAdd } else { AluOp::Add }),
        OpId::Sub => Ok(if float { AluOp::FSub } else { AluOp::Sub }),
        OpId::Mul => Ok(if float { AluOp::FMul } else { AluOp::Mul24 }),
        OpId::Min => Ok(if float { AluOp::FMin } else { AluOp::Min }),
        OpId::Max => Ok(if float { AluOp::FMax } else { AluOp::Max }),
        OpId::Shl => int_only(AluOp::Shl),
        OpId::Shr => int_only(AluOp::Asr),
        OpId::Ushr => int_only(AluOp::Shr),
        OpId::Ror => int_only(AluOp::Ror),
        OpId::Bor => int_only(AluOp::Bor),
        OpId::Band => int_only(AluOp::Band),
        OpId::Bxor => int_only(AluOp::Bxor),
        OpId::Bnot => int_only(AluOp::Bnot),
        OpId::ItoF => Ok(AluOp::ItoF),
        OpId::FtoI => Ok(AluOp::FtoI),
        OpId::Recip | OpId::RecipSqrt | OpId::Exp | OpId::Log | OpId::Sin => Err(
            CompileError::Internal(format!("SFU operator {:?} in ALU position", op)),
        ),
    }
}

fn sfu_reg(op: OpId) -> Result<SpecialReg, CompileError> {
    match op {
        OpId::Recip => Ok(SpecialReg::SfuRecip),
        OpId::RecipSqrt => Ok(SpecialReg::SfuRecipSqrt),
        OpId::Exp => Ok(SpecialReg::SfuExp),
        OpId::Log => Ok(SpecialReg::SfuLog),
        OpId::Sin => Ok(SpecialReg::SfuSin),
        _ => Err(CompileError::Internal(format!(
            "operator {:?} is not SFU-routed",
            op
        ))),
    }
}

// ─── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::rc::Rc;

    use crate::ast::{CExpr, CmpOp, Op};

    fn src(body: Vec<Stmt>, num_vars: u32) -> KernelSrc {
        KernelSrc {
            params: vec![],
            body,
            num_vars,
        }
    }

    fn int_var(id: VarId) -> Rc<Expr> {
        Rc::new(Expr::Var(Var::Standard(id)))
    }

    fn lower(body: Vec<Stmt>, num_vars: u32) -> Vec<Instr> {
        let plat = create_translate(Platform::V3d);
        translate(&src(body, num_vars), &*plat).unwrap().0
    }

    #[test]
    fn test_labels_unique_after_lowering() {
        let cond = Cond::Any(BExpr::Cmp(CExpr {
            lhs: int_var(0),
            op: CmpOp::new(CmpId::Neq, BaseType::Int32),
            rhs: int_var(1),
        }));
        let body = vec![Stmt::While {
            cond: cond.clone(),
            body: vec![Stmt::If {
                cond,
                then_body: vec![Stmt::Assign {
                    lhs: Var::Standard(0),
                    rhs: int_var(1),
                }],
                else_body: vec![],
            }],
        }];
        let instrs = lower(body, 2);

        let mut seen = HashSet::new();
        let mut referenced = HashSet::new();
        for i in &instrs {
            if let InstrKind::Label(l) = i.kind {
                assert!(seen.insert(l), "label {} defined twice", l);
            }
            if let Some(l) = i.branch_label() {
                referenced.insert(l);
            }
        }
        for l in referenced {
            assert!(seen.contains(&l), "label {} referenced but never defined", l);
        }
    }

    #[test]
    fn test_while_is_entry_guarded() {
        let cond = Cond::All(BExpr::Cmp(CExpr {
            lhs: int_var(0),
            op: CmpOp::new(CmpId::Lt, BaseType::Int32),
            rhs: int_var(1),
        }));
        let instrs = lower(vec![Stmt::While { cond, body: vec![] }], 2);

        let branches: Vec<_> = instrs
            .iter()
            .filter_map(|i| match i.kind {
                InstrKind::Brl { cond, .. } => Some(cond),
                _ => None,
            })
            .collect();
        // Guard branch (negated) plus the bottom-test back-branch.
        assert_eq!(branches.len(), 2);
        assert_eq!(branches[0], BranchCond::All(Flag::Zc).negate());
        assert_eq!(branches[1], BranchCond::All(Flag::Zc));
    }

    #[test]
    fn test_where_assignment_is_conditional() {
        let cond = BExpr::Cmp(CExpr {
            lhs: int_var(0),
            op: CmpOp::new(CmpId::Gt, BaseType::Int32),
            rhs: int_var(1),
        });
        let body = vec![Stmt::Where {
            cond,
            then_body: vec![Stmt::Assign {
                lhs: Var::Standard(0),
                rhs: Rc::new(Expr::Apply {
                    lhs: int_var(0),
                    op: Op::new(OpId::Sub, BaseType::Int32),
                    rhs: int_var(1),
                }),
            }],
            else_body: vec![],
        }];
        let instrs = lower(body, 2);
        assert!(instrs.iter().any(|i| matches!(
            i.kind,
            InstrKind::Alu {
                cond: MASK_COND,
                dest: Reg::Virtual(0),
                ..
            }
        )));
    }

    #[test]
    fn test_semaphore_rejected_on_v3d() {
        let plat = create_translate(Platform::V3d);
        let err = translate(&src(vec![Stmt::SemaInc(1)], 0), &*plat).unwrap_err();
        assert!(matches!(err, CompileError::Unsupported { .. }));
    }

    #[test]
    fn test_float_operands_reject_integer_ops() {
        let body = vec![Stmt::Assign {
            lhs: Var::Standard(0),
            rhs: Rc::new(Expr::Apply {
                lhs: Rc::new(Expr::FloatLit(1.0)),
                op: Op::new(OpId::Band, BaseType::Float),
                rhs: Rc::new(Expr::FloatLit(2.0)),
            }),
        }];
        let plat = create_translate(Platform::V3d);
        let err = translate(&src(body, 1), &*plat).unwrap_err();
        assert!(matches!(err, CompileError::TypeMismatch(_)));
    }

    #[test]
    fn test_sfu_sequence_shape() {
        let body = vec![Stmt::Assign {
            lhs: Var::Standard(0),
            rhs: Rc::new(Expr::Unary {
                op: Op::new(OpId::Recip, BaseType::Float),
                expr: Rc::new(Expr::FloatLit(2.0)),
            }),
        }];
        let instrs = lower(body, 1);
        let sfu_write = instrs
            .iter()
            .position(|i| {
                matches!(
                    i.kind,
                    InstrKind::Alu {
                        dest: Reg::Special(SpecialReg::SfuRecip),
                        ..
                    }
                )
            })
            .expect("sfu write");
        // Two waiting slots, then the ACC4 read.
        assert!(matches!(instrs[sfu_write + 1].kind, InstrKind::Nop));
        assert!(matches!(instrs[sfu_write + 2].kind, InstrKind::Nop));
        assert!(matches!(
            instrs[sfu_write + 3].kind,
            InstrKind::Alu {
                src_a: RegOrImm::Reg(ACC4),
                ..
            }
        ));
    }
}
