//! TIL — the target instruction list.
//!
//! The TIL sits between a strict and a relaxed definition of the QPU
//! target language: it can express constructs with no direct hardware
//! mapping (virtual registers, symbolic labels, two operands from the same
//! register file) so that compilation can proceed incrementally. Each pass
//! transforms away one class of relaxed construct; by encode time only
//! strictly encodable instructions remain.

pub mod alloc;
pub mod cfg;
pub mod link;
pub mod liveness;
pub mod satisfy;
pub mod translate;

use std::fmt;

use crate::ast::VarId;

// ─── Registers ────────────────────────────────────────────────────

pub type RegId = u8;
pub type InstrId = usize;

/// Hardware registers addressable outside the general register files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialReg {
    /// Pops the next value off the uniform stream when read.
    UniformRead,
    /// Lane index 0..15 (read).
    ElemNum,
    /// QPU id (read; vc4 only — v3d derives it from `tidx`).
    QpuNum,
    // vc4 VPM/DMA
    RdSetup,
    WrSetup,
    DmaLoadAddr,
    DmaStoreAddr,
    VpmRead,
    VpmWrite,
    // v3d TMU
    Tmu0S,
    TmuD,
    TmuA,
    // SFU function inputs; results arrive in ACC4 two slots later
    SfuRecip,
    SfuRecipSqrt,
    SfuExp,
    SfuLog,
    SfuSin,
}

impl SpecialReg {
    pub fn name(self) -> &'static str {
        match self {
            SpecialReg::UniformRead => "unif",
            SpecialReg::ElemNum => "elem_num",
            SpecialReg::QpuNum => "qpu_num",
            SpecialReg::RdSetup => "rd_setup",
            SpecialReg::WrSetup => "wr_setup",
            SpecialReg::DmaLoadAddr => "dma_ld_addr",
            SpecialReg::DmaStoreAddr => "dma_st_addr",
            SpecialReg::VpmRead => "vpm_read",
            SpecialReg::VpmWrite => "vpm_write",
            SpecialReg::Tmu0S => "tmu0_s",
            SpecialReg::TmuD => "tmud",
            SpecialReg::TmuA => "tmua",
            SpecialReg::SfuRecip => "sfu_recip",
            SpecialReg::SfuRecipSqrt => "sfu_recipsqrt",
            SpecialReg::SfuExp => "sfu_exp",
            SpecialReg::SfuLog => "sfu_log",
            SpecialReg::SfuSin => "sfu_sin",
        }
    }
}

/// A register operand or destination.
///
/// `Virtual` exists only between frontend lowering and register
/// allocation; the allocator rewrites every occurrence to `A` or `B`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    Virtual(VarId),
    A(RegId),
    B(RegId),
    Acc(RegId),
    Special(SpecialReg),
    /// Write-discard destination.
    None,
}

impl Reg {
    pub fn is_virtual(self) -> bool {
        matches!(self, Reg::Virtual(_))
    }

    pub fn virtual_id(self) -> Option<VarId> {
        match self {
            Reg::Virtual(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reg::Virtual(v) => write!(f, "v{}", v),
            Reg::A(r) => write!(f, "ra{}", r),
            Reg::B(r) => write!(f, "rb{}", r),
            Reg::Acc(r) => write!(f, "r{}", r),
            Reg::Special(s) => write!(f, "{}", s.name()),
            Reg::None => write!(f, "_"),
        }
    }
}

pub const ACC0: Reg = Reg::Acc(0);
pub const ACC1: Reg = Reg::Acc(1);
pub const ACC2: Reg = Reg::Acc(2);
pub const ACC3: Reg = Reg::Acc(3);
pub const ACC4: Reg = Reg::Acc(4);

// ─── Immediates and operands ──────────────────────────────────────

/// Full-width immediate for `LoadImm`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Imm {
    Int(i32),
    Float(f32),
}

/// Small immediate usable directly as an ALU operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SmallImm(pub i32);

impl SmallImm {
    /// The encodable range shared by both platforms.
    pub fn encodable(val: i32) -> bool {
        (-16..=15).contains(&val)
    }
}

/// An ALU source operand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegOrImm {
    Reg(Reg),
    Imm(SmallImm),
}

impl RegOrImm {
    pub fn reg(self) -> Option<Reg> {
        match self {
            RegOrImm::Reg(r) => Some(r),
            RegOrImm::Imm(_) => None,
        }
    }
}

impl From<Reg> for RegOrImm {
    fn from(r: Reg) -> Self {
        RegOrImm::Reg(r)
    }
}

impl From<i32> for RegOrImm {
    fn from(v: i32) -> Self {
        debug_assert!(SmallImm::encodable(v));
        RegOrImm::Imm(SmallImm(v))
    }
}

impl fmt::Display for RegOrImm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegOrImm::Reg(r) => write!(f, "{}", r),
            RegOrImm::Imm(i) => write!(f, "{}", i.0),
        }
    }
}

// ─── ALU operations ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Nop,
    // Integer add-unit ops
    Add,
    Sub,
    Min,
    Max,
    Shl,
    /// Logical (zero-filling) shift right.
    Shr,
    /// Arithmetic shift right.
    Asr,
    Ror,
    Bor,
    Band,
    Bxor,
    Bnot,
    ItoF,
    FtoI,
    // Float add-unit ops
    FAdd,
    FSub,
    FMin,
    FMax,
    // Mul-unit ops
    Mul24,
    FMul,
    // v3d-only sources
    TIdx,
    EIdx,
}

impl AluOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            AluOp::Nop => "nop",
            AluOp::Add => "add",
            AluOp::Sub => "sub",
            AluOp::Min => "min",
            AluOp::Max => "max",
            AluOp::Shl => "shl",
            AluOp::Shr => "shr",
            AluOp::Asr => "asr",
            AluOp::Ror => "ror",
            AluOp::Bor => "or",
            AluOp::Band => "and",
            AluOp::Bxor => "xor",
            AluOp::Bnot => "not",
            AluOp::ItoF => "itof",
            AluOp::FtoI => "ftoi",
            AluOp::FAdd => "fadd",
            AluOp::FSub => "fsub",
            AluOp::FMin => "fmin",
            AluOp::FMax => "fmax",
            AluOp::Mul24 => "mul24",
            AluOp::FMul => "fmul",
            AluOp::TIdx => "tidx",
            AluOp::EIdx => "eidx",
        }
    }

    /// Ops issued on the mul ALU; everything else goes to the add ALU.
    pub fn is_mul_unit(self) -> bool {
        matches!(self, AluOp::Mul24 | AluOp::FMul)
    }
}

// ─── Condition codes ──────────────────────────────────────────────

/// Which flag bank an instruction updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetCond {
    None,
    Z,
    N,
    C,
}

/// Per-lane flag test for conditional assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    Zs,
    Zc,
    Ns,
    Nc,
}

impl Flag {
    pub fn name(self) -> &'static str {
        match self {
            Flag::Zs => "ifz",
            Flag::Zc => "ifnz",
            Flag::Ns => "ifn",
            Flag::Nc => "ifnn",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignCond {
    Never,
    Always,
    Flag(Flag),
}

impl AssignCond {
    pub fn is_always(self) -> bool {
        self == AssignCond::Always
    }
}

/// Branch condition: a flag reduced across all 16 lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchCond {
    Always,
    All(Flag),
    Any(Flag),
}

impl BranchCond {
    /// The condition that is true exactly when `self` is false.
    pub fn negate(self) -> BranchCond {
        let flip = |f: Flag| match f {
            Flag::Zs => Flag::Zc,
            Flag::Zc => Flag::Zs,
            Flag::Ns => Flag::Nc,
            Flag::Nc => Flag::Ns,
        };
        match self {
            BranchCond::Always => BranchCond::Always,
            BranchCond::All(f) => BranchCond::Any(flip(f)),
            BranchCond::Any(f) => BranchCond::All(flip(f)),
        }
    }

    pub fn name(self) -> String {
        match self {
            BranchCond::Always => String::new(),
            BranchCond::All(f) => format!(".all{}", flag_suffix(f)),
            BranchCond::Any(f) => format!(".any{}", flag_suffix(f)),
        }
    }
}

fn flag_suffix(f: Flag) -> &'static str {
    match f {
        Flag::Zs => "zs",
        Flag::Zc => "zc",
        Flag::Ns => "ns",
        Flag::Nc => "nc",
    }
}

// ─── Labels ───────────────────────────────────────────────────────

/// Symbolic branch target, resolved to an instruction offset by the
/// link pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

// ─── Instructions ─────────────────────────────────────────────────

/// The instruction tag set.
#[derive(Debug, Clone, PartialEq)]
pub enum InstrKind {
    LoadImm {
        set_cond: SetCond,
        cond: AssignCond,
        dest: Reg,
        imm: Imm,
    },
    Alu {
        set_cond: SetCond,
        cond: AssignCond,
        dest: Reg,
        src_a: RegOrImm,
        op: AluOp,
        src_b: RegOrImm,
    },
    /// Branch to a resolved instruction offset (post-link only).
    Br { cond: BranchCond, target: i32 },
    /// Branch to a symbolic label (pre-link only).
    Brl { cond: BranchCond, label: Label },
    /// Label definition. Zero-width: stripped by the link pass.
    Label(Label),
    Nop,
    /// Nop carrying the thread-switch signal.
    Thrsw,
    /// Program end.
    End,
    // vc4 only
    DmaLoadWait,
    DmaStoreWait,
    SemaInc(u8),
    SemaDec(u8),
    // v3d only
    /// Wait for outstanding TMU writes (`tmuwt`).
    TmuWait,
    /// Receive an outstanding TMU read into accumulator 4.
    Tmu0ToAcc4,
    // Markers delimiting the back-end init block. Zero-width.
    InitBegin,
    InitEnd,
}

/// A target instruction: a tag plus dump-only header/comment texts.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Instr {
    pub kind: InstrKind,
    header: Option<String>,
    comment: Option<String>,
}

impl Default for InstrKind {
    fn default() -> Self {
        InstrKind::Nop
    }
}

impl From<InstrKind> for Instr {
    fn from(kind: InstrKind) -> Self {
        Instr {
            kind,
            header: None,
            comment: None,
        }
    }
}

impl Instr {
    pub fn new(kind: InstrKind) -> Self {
        kind.into()
    }

    pub fn nop() -> Self {
        InstrKind::Nop.into()
    }

    /// Attach a block header printed above the instruction in dumps.
    pub fn header(mut self, text: impl Into<String>) -> Self {
        self.header = Some(text.into());
        self
    }

    /// Attach a trailing per-instruction comment.
    pub fn comment(mut self, text: impl Into<String>) -> Self {
        self.comment = Some(text.into());
        self
    }

    /// Override the assignment condition (LoadImm and Alu only).
    pub fn cond(mut self, c: AssignCond) -> Self {
        match &mut self.kind {
            InstrKind::LoadImm { cond, .. } | InstrKind::Alu { cond, .. } => *cond = c,
            _ => debug_assert!(false, "cond() on non-assignment instruction"),
        }
        self
    }

    /// Request Z-flag update (LoadImm and Alu only).
    pub fn pushz(mut self) -> Self {
        match &mut self.kind {
            InstrKind::LoadImm { set_cond, .. } | InstrKind::Alu { set_cond, .. } => {
                *set_cond = SetCond::Z
            }
            _ => debug_assert!(false, "pushz() on non-assignment instruction"),
        }
        self
    }

    /// Request N-flag update (LoadImm and Alu only).
    pub fn pushn(mut self) -> Self {
        match &mut self.kind {
            InstrKind::LoadImm { set_cond, .. } | InstrKind::Alu { set_cond, .. } => {
                *set_cond = SetCond::N
            }
            _ => debug_assert!(false, "pushn() on non-assignment instruction"),
        }
        self
    }

    pub fn is_label(&self) -> bool {
        matches!(self.kind, InstrKind::Label(_))
    }

    /// Zero-width pseudo instructions stripped by the link pass.
    pub fn is_zero_width(&self) -> bool {
        matches!(
            self.kind,
            InstrKind::Label(_) | InstrKind::InitBegin | InstrKind::InitEnd
        )
    }

    pub fn branch_label(&self) -> Option<Label> {
        match self.kind {
            InstrKind::Brl { label, .. } => Some(label),
            _ => None,
        }
    }

    /// True for the uniform-load instructions emitted at kernel entry.
    pub fn is_uniform_load(&self) -> bool {
        matches!(
            self.kind,
            InstrKind::Alu {
                src_a: RegOrImm::Reg(Reg::Special(SpecialReg::UniformRead)),
                ..
            }
        )
    }

    /// Apply `f` to every register slot (destination and sources).
    pub fn map_regs(&mut self, f: &impl Fn(Reg) -> Reg) {
        let map_operand = |o: &mut RegOrImm| {
            if let RegOrImm::Reg(r) = o {
                *r = f(*r);
            }
        };
        match &mut self.kind {
            InstrKind::LoadImm { dest, .. } => *dest = f(*dest),
            InstrKind::Alu {
                dest, src_a, src_b, ..
            } => {
                *dest = f(*dest);
                map_operand(src_a);
                map_operand(src_b);
            }
            _ => {}
        }
    }

    /// Mnemonic without comments.
    pub fn mnemonic(&self) -> String {
        self.mnemonic_with(false)
    }

    pub fn mnemonic_with(&self, comments: bool) -> String {
        let mut line = match &self.kind {
            InstrKind::LoadImm {
                set_cond,
                cond,
                dest,
                imm,
            } => {
                let imm = match imm {
                    Imm::Int(i) => format!("{}", i),
                    Imm::Float(x) => format!("{:?}", x),
                };
                format!(
                    "li{}{} {}, {}",
                    cond_suffix(*cond),
                    setf_suffix(*set_cond),
                    dest,
                    imm
                )
            }
            InstrKind::Alu {
                set_cond,
                cond,
                dest,
                src_a,
                op,
                src_b,
            } => {
                // `or x, y, y` is the canonical move
                if *op == AluOp::Bor && src_a == src_b {
                    format!(
                        "mov{}{} {}, {}",
                        cond_suffix(*cond),
                        setf_suffix(*set_cond),
                        dest,
                        src_a
                    )
                } else {
                    format!(
                        "{}{}{} {}, {}, {}",
                        op.mnemonic(),
                        cond_suffix(*cond),
                        setf_suffix(*set_cond),
                        dest,
                        src_a,
                        src_b
                    )
                }
            }
            InstrKind::Br { cond, target } => format!("br{} {:+}", cond.name(), target),
            InstrKind::Brl { cond, label } => format!("brl{} {}", cond.name(), label),
            InstrKind::Label(l) => format!("{}:", l),
            InstrKind::Nop => "nop".to_string(),
            InstrKind::Thrsw => "nop.thrsw".to_string(),
            InstrKind::End => "end".to_string(),
            InstrKind::DmaLoadWait => "dma_ld_wait".to_string(),
            InstrKind::DmaStoreWait => "dma_st_wait".to_string(),
            InstrKind::SemaInc(id) => format!("sinc {}", id),
            InstrKind::SemaDec(id) => format!("sdec {}", id),
            InstrKind::TmuWait => "tmuwt".to_string(),
            InstrKind::Tmu0ToAcc4 => "ldtmu r4".to_string(),
            InstrKind::InitBegin => "# init".to_string(),
            InstrKind::InitEnd => "# end init".to_string(),
        };
        if comments {
            if let Some(c) = &self.comment {
                line = format!("{:<40}# {}", line, c);
            }
            if let Some(h) = &self.header {
                let hdr: String = h
                    .lines()
                    .map(|l| format!("# {}\n", l))
                    .collect();
                line = format!("\n{}{}", hdr, line);
            }
        }
        line
    }
}

fn cond_suffix(c: AssignCond) -> String {
    match c {
        AssignCond::Always => String::new(),
        AssignCond::Never => ".never".to_string(),
        AssignCond::Flag(f) => format!(".{}", f.name()),
    }
}

fn setf_suffix(s: SetCond) -> &'static str {
    match s {
        SetCond::None => "",
        SetCond::Z => ".pushz",
        SetCond::N => ".pushn",
        SetCond::C => ".pushc",
    }
}

/// Dump a whole instruction list, one line per instruction, prefixed
/// with its index.
pub fn mnemonics(instrs: &[Instr], comments: bool) -> String {
    let mut out = String::new();
    for (i, instr) in instrs.iter().enumerate() {
        out.push_str(&format!("{:4}: {}\n", i, instr.mnemonic_with(comments)));
    }
    out
}

// ─── Instruction constructors ─────────────────────────────────────
//
// The helpers below are the vocabulary the frontend and the back-ends
// build code with.

pub fn mov(dest: Reg, src: impl Into<RegOrImm>) -> Instr {
    let src = src.into();
    InstrKind::Alu {
        set_cond: SetCond::None,
        cond: AssignCond::Always,
        dest,
        src_a: src,
        op: AluOp::Bor,
        src_b: src,
    }
    .into()
}

pub fn alu(dest: Reg, src_a: impl Into<RegOrImm>, op: AluOp, src_b: impl Into<RegOrImm>) -> Instr {
    InstrKind::Alu {
        set_cond: SetCond::None,
        cond: AssignCond::Always,
        dest,
        src_a: src_a.into(),
        op,
        src_b: src_b.into(),
    }
    .into()
}

pub fn add(dest: Reg, src_a: impl Into<RegOrImm>, src_b: impl Into<RegOrImm>) -> Instr {
    alu(dest, src_a, AluOp::Add, src_b)
}

pub fn sub(dest: Reg, src_a: impl Into<RegOrImm>, src_b: impl Into<RegOrImm>) -> Instr {
    alu(dest, src_a, AluOp::Sub, src_b)
}

pub fn shl(dest: Reg, src_a: impl Into<RegOrImm>, src_b: impl Into<RegOrImm>) -> Instr {
    alu(dest, src_a, AluOp::Shl, src_b)
}

pub fn shr(dest: Reg, src_a: impl Into<RegOrImm>, src_b: impl Into<RegOrImm>) -> Instr {
    alu(dest, src_a, AluOp::Shr, src_b)
}

pub fn band(dest: Reg, src_a: impl Into<RegOrImm>, src_b: impl Into<RegOrImm>) -> Instr {
    alu(dest, src_a, AluOp::Band, src_b)
}

pub fn bor(dest: Reg, src_a: impl Into<RegOrImm>, src_b: impl Into<RegOrImm>) -> Instr {
    alu(dest, src_a, AluOp::Bor, src_b)
}

pub fn bxor(dest: Reg, src_a: impl Into<RegOrImm>, src_b: impl Into<RegOrImm>) -> Instr {
    alu(dest, src_a, AluOp::Bxor, src_b)
}

pub fn li(dest: Reg, val: i32) -> Instr {
    InstrKind::LoadImm {
        set_cond: SetCond::None,
        cond: AssignCond::Always,
        dest,
        imm: Imm::Int(val),
    }
    .into()
}

pub fn lif(dest: Reg, val: f32) -> Instr {
    InstrKind::LoadImm {
        set_cond: SetCond::None,
        cond: AssignCond::Always,
        dest,
        imm: Imm::Float(val),
    }
    .into()
}

pub fn branch(cond: BranchCond, label: Label) -> Instr {
    InstrKind::Brl { cond, label }.into()
}

pub fn jump(label: Label) -> Instr {
    branch(BranchCond::Always, label)
}

pub fn label(l: Label) -> Instr {
    InstrKind::Label(l).into()
}

// ─── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mnemonics() {
        assert_eq!(mov(Reg::Virtual(3), Reg::Acc(0)).mnemonic(), "mov v3, r0");
        assert_eq!(
            sub(ACC0, Reg::Virtual(1), Reg::Virtual(2)).pushz().mnemonic(),
            "sub.pushz r0, v1, v2"
        );
        assert_eq!(li(Reg::A(7), 42).mnemonic(), "li ra7, 42");
        assert_eq!(
            jump(Label(2)).mnemonic(),
            "brl L2"
        );
        assert_eq!(
            branch(BranchCond::All(Flag::Zc), Label(0)).mnemonic(),
            "brl.allzc L0"
        );
    }

    #[test]
    fn test_cond_mov_mnemonic() {
        let i = mov(Reg::Virtual(0), 1).cond(AssignCond::Flag(Flag::Zc));
        assert_eq!(i.mnemonic(), "mov.ifnz v0, 1");
    }

    #[test]
    fn test_branch_cond_negate() {
        assert_eq!(
            BranchCond::Any(Flag::Zc).negate(),
            BranchCond::All(Flag::Zs)
        );
        assert_eq!(
            BranchCond::All(Flag::Ns).negate(),
            BranchCond::Any(Flag::Nc)
        );
        assert_eq!(BranchCond::Always.negate(), BranchCond::Always);
    }

    #[test]
    fn test_small_imm_range() {
        assert!(SmallImm::encodable(0));
        assert!(SmallImm::encodable(15));
        assert!(SmallImm::encodable(-16));
        assert!(!SmallImm::encodable(16));
        assert!(!SmallImm::encodable(-17));
    }

    #[test]
    fn test_map_regs_rewrites_all_slots() {
        let mut i = add(Reg::Virtual(1), Reg::Virtual(2), Reg::Virtual(1));
        i.map_regs(&|r| match r {
            Reg::Virtual(v) => Reg::A(v as RegId),
            other => other,
        });
        assert_eq!(i, add(Reg::A(1), Reg::A(2), Reg::A(1)));
    }

    #[test]
    fn test_uniform_load_detection() {
        let i = mov(Reg::Virtual(0), Reg::Special(SpecialReg::UniformRead));
        assert!(i.is_uniform_load());
        assert!(!mov(Reg::Virtual(0), Reg::Acc(1)).is_uniform_load());
    }

    #[test]
    fn test_comment_roundtrip_ignored_by_eq_on_kind() {
        let a = Instr::nop().comment("store request");
        assert_eq!(a.kind, InstrKind::Nop);
    }
}
