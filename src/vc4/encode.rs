//! vc4 instruction encoder.
//!
//! Produces the 64-bit VideoCore IV instruction words. The field layout
//! and the opcode/condition/register tables in this file are the single
//! point of truth for the vc4 ISA as this compiler uses it; `decode`
//! inverts `encode` for every instruction kind the back-end emits.
//!
//! ALU word layout:
//! ```text
//! [63:60] sig   [59:57] unpack  [56] pm  [55:52] pack
//! [51:49] cond_add  [48:46] cond_mul  [45] sf  [44] ws
//! [43:38] waddr_add [37:32] waddr_mul
//! [31:29] op_mul    [28:24] op_add
//! [23:18] raddr_a   [17:12] raddr_b
//! [11:9] add_a  [8:6] add_b  [5:3] mul_a  [2:0] mul_b
//! ```

use crate::error::CompileError;
use crate::til::{
    link, AluOp, AssignCond, BranchCond, Flag, Imm, Instr, InstrKind, Reg, RegOrImm, SetCond,
    SmallImm, SpecialReg,
};

// ─── Signalling bits ──────────────────────────────────────────────

const SIG_NONE: u64 = 0x1;
const SIG_THREND: u64 = 0x3;
const SIG_SMALL_IMM: u64 = 0xD;
const SIG_LOAD_IMM: u64 = 0xE;
const SIG_BRANCH: u64 = 0xF;

// [59:57] variants under SIG_LOAD_IMM
const LI_32BIT: u64 = 0b000;
const LI_SEMAPHORE: u64 = 0b100;

const WADDR_NOP: u64 = 39;
const RADDR_NOP: u64 = 39;
const MUX_A: u64 = 6;
const MUX_B: u64 = 7;

// ─── Tables ───────────────────────────────────────────────────────

fn add_opcode(op: AluOp) -> Option<u64> {
    Some(match op {
        AluOp::Nop => 0,
        AluOp::FAdd => 1,
        AluOp::FSub => 2,
        AluOp::FMin => 3,
        AluOp::FMax => 4,
        AluOp::FtoI => 7,
        AluOp::ItoF => 8,
        AluOp::Add => 12,
        AluOp::Sub => 13,
        AluOp::Shr => 14,
        AluOp::Asr => 15,
        AluOp::Ror => 16,
        AluOp::Shl => 17,
        AluOp::Min => 18,
        AluOp::Max => 19,
        AluOp::Band => 20,
        AluOp::Bor => 21,
        AluOp::Bxor => 22,
        AluOp::Bnot => 23,
        _ => return None,
    })
}

fn add_opcode_inv(code: u64) -> Option<AluOp> {
    Some(match code {
        0 => AluOp::Nop,
        1 => AluOp::FAdd,
        2 => AluOp::FSub,
        3 => AluOp::FMin,
        4 => AluOp::FMax,
        7 => AluOp::FtoI,
        8 => AluOp::ItoF,
        12 => AluOp::Add,
        13 => AluOp::Sub,
        14 => AluOp::Shr,
        15 => AluOp::Asr,
        16 => AluOp::Ror,
        17 => AluOp::Shl,
        18 => AluOp::Min,
        19 => AluOp::Max,
        20 => AluOp::Band,
        21 => AluOp::Bor,
        22 => AluOp::Bxor,
        23 => AluOp::Bnot,
        _ => return None,
    })
}

fn mul_opcode(op: AluOp) -> Option<u64> {
    Some(match op {
        AluOp::FMul => 1,
        AluOp::Mul24 => 2,
        _ => return None,
    })
}

fn assign_cond_code(c: AssignCond) -> u64 {
    match c {
        AssignCond::Never => 0,
        AssignCond::Always => 1,
        AssignCond::Flag(Flag::Zs) => 2,
        AssignCond::Flag(Flag::Zc) => 3,
        AssignCond::Flag(Flag::Ns) => 4,
        AssignCond::Flag(Flag::Nc) => 5,
    }
}

fn assign_cond_inv(code: u64) -> Option<AssignCond> {
    Some(match code {
        0 => AssignCond::Never,
        1 => AssignCond::Always,
        2 => AssignCond::Flag(Flag::Zs),
        3 => AssignCond::Flag(Flag::Zc),
        4 => AssignCond::Flag(Flag::Ns),
        5 => AssignCond::Flag(Flag::Nc),
        _ => return None,
    })
}

fn branch_cond_code(c: BranchCond) -> u64 {
    match c {
        BranchCond::All(Flag::Zs) => 0,
        BranchCond::All(Flag::Zc) => 1,
        BranchCond::Any(Flag::Zs) => 2,
        BranchCond::Any(Flag::Zc) => 3,
        BranchCond::All(Flag::Ns) => 4,
        BranchCond::All(Flag::Nc) => 5,
        BranchCond::Any(Flag::Ns) => 6,
        BranchCond::Any(Flag::Nc) => 7,
        BranchCond::Always => 15,
    }
}

fn branch_cond_inv(code: u64) -> Option<BranchCond> {
    Some(match code {
        0 => BranchCond::All(Flag::Zs),
        1 => BranchCond::All(Flag::Zc),
        2 => BranchCond::Any(Flag::Zs),
        3 => BranchCond::Any(Flag::Zc),
        4 => BranchCond::All(Flag::Ns),
        5 => BranchCond::All(Flag::Nc),
        6 => BranchCond::Any(Flag::Ns),
        7 => BranchCond::Any(Flag::Nc),
        15 => BranchCond::Always,
        _ => return None,
    })
}

/// Destination register → (waddr, file-B space?).
fn waddr_of(dest: Reg) -> Result<(u64, bool), CompileError> {
    Ok(match dest {
        Reg::A(r) if r < 32 => (r as u64, false),
        Reg::B(r) if r < 32 => (r as u64, true),
        Reg::Acc(n) if n < 4 => (32 + n as u64, false),
        Reg::None => (WADDR_NOP, false),
        Reg::Special(s) => match s {
            SpecialReg::VpmWrite => (44, false),
            SpecialReg::RdSetup => (45, false),
            SpecialReg::WrSetup => (45, true),
            SpecialReg::DmaLoadAddr => (46, false),
            SpecialReg::DmaStoreAddr => (46, true),
            SpecialReg::SfuRecip => (48, false),
            SpecialReg::SfuRecipSqrt => (49, false),
            SpecialReg::SfuExp => (50, false),
            SpecialReg::SfuLog => (51, false),
            SpecialReg::SfuSin => (52, false),
            other => {
                return Err(CompileError::Internal(format!(
                    "register {} is not writable on vc4",
                    other.name()
                )))
            }
        },
        other => {
            return Err(CompileError::Internal(format!(
                "unencodable vc4 destination {}",
                other
            )))
        }
    })
}

fn waddr_inv(waddr: u64, file_b: bool) -> Option<Reg> {
    Some(match (waddr, file_b) {
        (w, false) if w < 32 => Reg::A(w as u8),
        (w, true) if w < 32 => Reg::B(w as u8),
        (w, _) if (32..36).contains(&w) => Reg::Acc((w - 32) as u8),
        (39, _) => Reg::None,
        (44, _) => Reg::Special(SpecialReg::VpmWrite),
        (45, false) => Reg::Special(SpecialReg::RdSetup),
        (45, true) => Reg::Special(SpecialReg::WrSetup),
        (46, false) => Reg::Special(SpecialReg::DmaLoadAddr),
        (46, true) => Reg::Special(SpecialReg::DmaStoreAddr),
        (48, _) => Reg::Special(SpecialReg::SfuRecip),
        (49, _) => Reg::Special(SpecialReg::SfuRecipSqrt),
        (50, _) => Reg::Special(SpecialReg::SfuExp),
        (51, _) => Reg::Special(SpecialReg::SfuLog),
        (52, _) => Reg::Special(SpecialReg::SfuSin),
        _ => return None,
    })
}

// ─── Read-port assignment ─────────────────────────────────────────

#[derive(Default)]
struct ReadPorts {
    raddr_a: Option<u64>,
    raddr_b: Option<u64>,
    small_imm: Option<u64>,
}

impl ReadPorts {
    fn claim_a(&mut self, raddr: u64) -> Result<u64, CompileError> {
        match self.raddr_a {
            None => {
                self.raddr_a = Some(raddr);
                Ok(MUX_A)
            }
            Some(r) if r == raddr => Ok(MUX_A),
            Some(_) => Err(CompileError::Internal(
                "two distinct file-A reads in one instruction".to_string(),
            )),
        }
    }

    fn claim_b(&mut self, raddr: u64) -> Result<u64, CompileError> {
        if self.small_imm.is_some() {
            return Err(CompileError::Internal(
                "file-B read conflicts with small immediate".to_string(),
            ));
        }
        match self.raddr_b {
            None => {
                self.raddr_b = Some(raddr);
                Ok(MUX_B)
            }
            Some(r) if r == raddr => Ok(MUX_B),
            Some(_) => Err(CompileError::Internal(
                "two distinct file-B reads in one instruction".to_string(),
            )),
        }
    }

    fn operand(&mut self, o: RegOrImm) -> Result<u64, CompileError> {
        match o {
            RegOrImm::Reg(Reg::A(r)) if r < 32 => self.claim_a(r as u64),
            RegOrImm::Reg(Reg::B(r)) if r < 32 => self.claim_b(r as u64),
            RegOrImm::Reg(Reg::Acc(n)) if n < 6 => Ok(n as u64),
            RegOrImm::Reg(Reg::Special(s)) => match s {
                SpecialReg::UniformRead => self.claim_a(32).or_else(|_| self.claim_b(32)),
                SpecialReg::ElemNum => self.claim_a(38),
                SpecialReg::QpuNum => self.claim_b(38),
                SpecialReg::VpmRead => self.claim_a(48),
                other => Err(CompileError::Internal(format!(
                    "register {} is not readable on vc4",
                    other.name()
                ))),
            },
            RegOrImm::Reg(Reg::None) => Ok(0),
            RegOrImm::Imm(SmallImm(v)) => {
                let code = if (0..=15).contains(&v) {
                    v as u64
                } else if (-16..=-1).contains(&v) {
                    (v + 32) as u64
                } else {
                    return Err(CompileError::Internal(format!(
                        "unencodable small immediate {}",
                        v
                    )));
                };
                if self.raddr_b.is_some() {
                    return Err(CompileError::Internal(
                        "small immediate conflicts with file-B read".to_string(),
                    ));
                }
                match self.small_imm {
                    Some(c) if c != code => Err(CompileError::Internal(
                        "two distinct small immediates in one instruction".to_string(),
                    )),
                    _ => {
                        self.small_imm = Some(code);
                        Ok(MUX_B)
                    }
                }
            }
            RegOrImm::Reg(other) => Err(CompileError::Internal(format!(
                "unencodable vc4 operand {}",
                other
            ))),
        }
    }
}

fn read_operand(mux: u64, raddr_a: u64, raddr_b: u64, small_imm: bool) -> Option<RegOrImm> {
    Some(match mux {
        0..=5 => RegOrImm::Reg(Reg::Acc(mux as u8)),
        MUX_A => match raddr_a {
            r if r < 32 => RegOrImm::Reg(Reg::A(r as u8)),
            32 => RegOrImm::Reg(Reg::Special(SpecialReg::UniformRead)),
            38 => RegOrImm::Reg(Reg::Special(SpecialReg::ElemNum)),
            48 => RegOrImm::Reg(Reg::Special(SpecialReg::VpmRead)),
            _ => return None,
        },
        MUX_B => {
            if small_imm {
                let v = if raddr_b < 16 {
                    raddr_b as i32
                } else {
                    raddr_b as i32 - 32
                };
                RegOrImm::Imm(SmallImm(v))
            } else {
                match raddr_b {
                    r if r < 32 => RegOrImm::Reg(Reg::B(r as u8)),
                    32 => RegOrImm::Reg(Reg::Special(SpecialReg::UniformRead)),
                    38 => RegOrImm::Reg(Reg::Special(SpecialReg::QpuNum)),
                    _ => return None,
                }
            }
        }
        _ => return None,
    })
}

// ─── Encoding ─────────────────────────────────────────────────────

/// Encode a whole instruction list: schedule the branch delay slots,
/// link labels, then map every instruction to its word(s).
pub fn encode_program(instrs: &[Instr]) -> Result<Vec<u64>, CompileError> {
    let mut list = instrs.to_vec();
    link::insert_branch_delays(&mut list);
    let linked = link::link(&list)?;

    let mut words = Vec::new();
    for instr in &linked {
        match instr.kind {
            // Program end: thread-end signal plus two drain slots.
            InstrKind::End => {
                words.push(nop_word(SIG_THREND));
                words.push(nop_word(SIG_NONE));
                words.push(nop_word(SIG_NONE));
            }
            _ => words.push(encode(&instr.kind)?),
        }
    }
    log::debug!("vc4 encode: {} instructions -> {} words", instrs.len(), words.len());
    Ok(words)
}

fn nop_word(sig: u64) -> u64 {
    (sig << 60)
        | (assign_cond_code(AssignCond::Never) << 49)
        | (assign_cond_code(AssignCond::Never) << 46)
        | (WADDR_NOP << 38)
        | (WADDR_NOP << 32)
        | (RADDR_NOP << 18)
        | (RADDR_NOP << 12)
}

/// Encode a single (post-link) instruction.
pub fn encode(kind: &InstrKind) -> Result<u64, CompileError> {
    match kind {
        InstrKind::Nop => Ok(nop_word(SIG_NONE)),
        InstrKind::Alu {
            set_cond,
            cond,
            dest,
            src_a,
            op,
            src_b,
        } => encode_alu(*set_cond, *cond, *dest, *src_a, *op, *src_b),
        InstrKind::LoadImm {
            set_cond,
            cond,
            dest,
            imm,
        } => {
            let (waddr, file_b) = waddr_of(*dest)?;
            let bits = match imm {
                Imm::Int(i) => *i as u32 as u64,
                Imm::Float(x) => x.to_bits() as u64,
            };
            Ok((SIG_LOAD_IMM << 60)
                | (LI_32BIT << 57)
                | (assign_cond_code(*cond) << 49)
                | (assign_cond_code(AssignCond::Never) << 46)
                | (((*set_cond != SetCond::None) as u64) << 45)
                | ((file_b as u64) << 44)
                | (waddr << 38)
                | (WADDR_NOP << 32)
                | bits)
        }
        InstrKind::Br { cond, target } => {
            let bytes = (*target * 8) as u32 as u64;
            Ok((SIG_BRANCH << 60)
                | (branch_cond_code(*cond) << 52)
                | (1 << 51) // pc-relative
                | (WADDR_NOP << 38)
                | (WADDR_NOP << 32)
                | bytes)
        }
        InstrKind::SemaInc(id) => Ok(sema_word(*id, false)),
        InstrKind::SemaDec(id) => Ok(sema_word(*id, true)),
        // Reading a DMA wait register stalls until the transfer completes;
        // the result is discarded.
        InstrKind::DmaLoadWait => Ok(wait_word(true)),
        InstrKind::DmaStoreWait => Ok(wait_word(false)),
        InstrKind::Brl { .. } | InstrKind::Label(_) => Err(CompileError::Internal(
            "unlinked label construct reached the vc4 encoder".to_string(),
        )),
        InstrKind::End | InstrKind::InitBegin | InstrKind::InitEnd => Err(
            CompileError::Internal("marker reached vc4 single-instruction encoder".to_string()),
        ),
        InstrKind::Thrsw | InstrKind::TmuWait | InstrKind::Tmu0ToAcc4 => {
            Err(CompileError::Internal(format!(
                "v3d-only instruction {:?} in vc4 stream",
                kind
            )))
        }
    }
}

/// A parked read of `vpm_ld_wait` (file A) or `vpm_st_wait` (file B).
fn wait_word(load: bool) -> u64 {
    let (raddr_a, raddr_b) = if load { (50, RADDR_NOP) } else { (RADDR_NOP, 50) };
    (SIG_NONE << 60)
        | (assign_cond_code(AssignCond::Never) << 49)
        | (assign_cond_code(AssignCond::Never) << 46)
        | (WADDR_NOP << 38)
        | (WADDR_NOP << 32)
        | (raddr_a << 18)
        | (raddr_b << 12)
}

fn sema_word(id: u8, down: bool) -> u64 {
    (SIG_LOAD_IMM << 60)
        | (LI_SEMAPHORE << 57)
        | (assign_cond_code(AssignCond::Never) << 49)
        | (assign_cond_code(AssignCond::Never) << 46)
        | (WADDR_NOP << 38)
        | (WADDR_NOP << 32)
        | ((down as u64) << 4)
        | (id as u64 & 0xf)
}

fn encode_alu(
    set_cond: SetCond,
    cond: AssignCond,
    dest: Reg,
    src_a: RegOrImm,
    op: AluOp,
    src_b: RegOrImm,
) -> Result<u64, CompileError> {
    let (waddr, dest_file_b) = waddr_of(dest)?;
    let mut ports = ReadPorts::default();
    let mux_a = ports.operand(src_a)?;
    let mux_b = ports.operand(src_b)?;

    let mut word: u64;
    let ws;
    if let Some(mul_op) = mul_opcode(op) {
        // Mul ALU active; add ALU parked on nop. ws=0 points the mul
        // write port at file B, so a file-A destination sets it.
        ws = !dest_file_b && !matches!(dest, Reg::Acc(_) | Reg::None | Reg::Special(_));
        word = (mul_op << 29)
            | (assign_cond_code(AssignCond::Never) << 49)
            | (assign_cond_code(cond) << 46)
            | (WADDR_NOP << 38)
            | (waddr << 32)
            | (mux_a << 3)
            | mux_b;
    } else {
        let add_op = add_opcode(op).ok_or_else(|| {
            CompileError::Internal(format!("no vc4 add-ALU opcode for {:?}", op))
        })?;
        ws = dest_file_b;
        word = (add_op << 24)
            | (assign_cond_code(cond) << 49)
            | (assign_cond_code(AssignCond::Never) << 46)
            | (waddr << 38)
            | (WADDR_NOP << 32)
            | (mux_a << 9)
            | (mux_b << 6);
    }

    let sig = if ports.small_imm.is_some() {
        SIG_SMALL_IMM
    } else {
        SIG_NONE
    };
    let raddr_b = ports.small_imm.or(ports.raddr_b).unwrap_or(RADDR_NOP);
    word |= (sig << 60)
        | (((set_cond != SetCond::None) as u64) << 45)
        | ((ws as u64) << 44)
        | (ports.raddr_a.unwrap_or(RADDR_NOP) << 18)
        | (raddr_b << 12);
    Ok(word)
}

// ─── Decoding ─────────────────────────────────────────────────────

/// Invert `encode` for the instruction kinds the back-end emits.
/// The set-flags bank is reported as `Z` (vc4 has a single sf bit).
pub fn decode(word: u64) -> Option<InstrKind> {
    let sig = word >> 60;
    match sig {
        SIG_BRANCH => {
            let cond = branch_cond_inv((word >> 52) & 0xf)?;
            let bytes = word as u32 as i32;
            Some(InstrKind::Br {
                cond,
                target: bytes / 8,
            })
        }
        SIG_LOAD_IMM => {
            match (word >> 57) & 0x7 {
                LI_SEMAPHORE => {
                    let id = (word & 0xf) as u8;
                    if (word >> 4) & 1 == 1 {
                        Some(InstrKind::SemaDec(id))
                    } else {
                        Some(InstrKind::SemaInc(id))
                    }
                }
                LI_32BIT => {
                    let cond = assign_cond_inv((word >> 49) & 0x7)?;
                    let dest = waddr_inv((word >> 38) & 0x3f, (word >> 44) & 1 == 1)?;
                    let sf = (word >> 45) & 1 == 1;
                    Some(InstrKind::LoadImm {
                        set_cond: if sf { SetCond::Z } else { SetCond::None },
                        cond,
                        dest,
                        imm: Imm::Int(word as u32 as i32),
                    })
                }
                _ => None,
            }
        }
        SIG_NONE | SIG_SMALL_IMM | SIG_THREND => {
            let raddr_a = (word >> 18) & 0x3f;
            let raddr_b = (word >> 12) & 0x3f;
            // DMA waits are parked reads of the wait registers.
            if raddr_a == 50 {
                return Some(InstrKind::DmaLoadWait);
            }
            if raddr_b == 50 {
                return Some(InstrKind::DmaStoreWait);
            }
            let small = sig == SIG_SMALL_IMM;
            let sf = (word >> 45) & 1 == 1;
            let ws = (word >> 44) & 1 == 1;
            let op_mul = (word >> 29) & 0x7;
            let op_add = (word >> 24) & 0x1f;

            if op_mul != 0 {
                let op = match op_mul {
                    1 => AluOp::FMul,
                    2 => AluOp::Mul24,
                    _ => return None,
                };
                let cond = assign_cond_inv((word >> 46) & 0x7)?;
                let dest = waddr_inv((word >> 32) & 0x3f, !ws)?;
                let src_a = read_operand((word >> 3) & 0x7, raddr_a, raddr_b, small)?;
                let src_b = read_operand(word & 0x7, raddr_a, raddr_b, small)?;
                return Some(InstrKind::Alu {
                    set_cond: if sf { SetCond::Z } else { SetCond::None },
                    cond,
                    dest,
                    src_a,
                    op,
                    src_b,
                });
            }

            let cond = assign_cond_inv((word >> 49) & 0x7)?;
            let dest = waddr_inv((word >> 38) & 0x3f, ws)?;
            let op = add_opcode_inv(op_add)?;
            if op == AluOp::Nop && dest == Reg::None {
                return Some(InstrKind::Nop);
            }
            let src_a = read_operand((word >> 9) & 0x7, raddr_a, raddr_b, small)?;
            let src_b = read_operand((word >> 6) & 0x7, raddr_a, raddr_b, small)?;
            Some(InstrKind::Alu {
                set_cond: if sf { SetCond::Z } else { SetCond::None },
                cond,
                dest,
                src_a,
                op,
                src_b,
            })
        }
        _ => None,
    }
}

// ─── Tests ────────────────────────────────────────────────────────
