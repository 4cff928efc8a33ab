//! v3d instruction encoder.
//!
//! Produces the 64-bit VideoCore VI instruction words. The tables here
//! are the single point of truth for the v3d encoding as this compiler
//! uses it; `decode` inverts `encode` for every emitted kind.
//!
//! ALU word layout:
//! ```text
//! [63:58] op_mul (63 = branch word, 62 = load-immediate word)
//! [57:53] sig    (thrsw, ldunif, ldtmu, smimm)
//! [52:50] setf   [49:46] cond
//! [45] ma (magic write)  [43:38] waddr
//! [31:24] op_add
//! [23:18] raddr_a  [17:12] raddr_b
//! [11:6] add muxes  [5:0] mul muxes
//! ```

use crate::error::CompileError;
use crate::til::{
    link, AluOp, AssignCond, BranchCond, Flag, Imm, Instr, InstrKind, Reg, RegOrImm, SetCond,
    SmallImm, SpecialReg,
};

// ─── Word classes ─────────────────────────────────────────────────

const OPM_BRANCH: u64 = 63;
const OPM_LOAD_IMM: u64 = 62;

// Signal bits, [57:53].
const SIG_THRSW: u64 = 1 << 0;
const SIG_LDUNIF: u64 = 1 << 1;
const SIG_LDTMU: u64 = 1 << 2;
const SIG_SMIMM: u64 = 1 << 3;

const WADDR_NOP: u64 = 39;
const RADDR_NOP: u64 = 39;
const RADDR_UNIF: u64 = 32;
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
        AluOp::TIdx => 30,
        AluOp::EIdx => 31,
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
        30 => AluOp::TIdx,
        31 => AluOp::EIdx,
        _ => return None,
    })
}

/// `tmuwt` occupies an add-ALU opcode of its own.
const OP_TMUWT: u64 = 33;

fn mul_opcode(op: AluOp) -> Option<u64> {
    Some(match op {
        AluOp::FMul => 1,
        AluOp::Mul24 => 2,
        _ => return None,
    })
}

fn set_cond_code(s: SetCond) -> u64 {
    match s {
        SetCond::None => 0,
        SetCond::Z => 1,
        SetCond::N => 2,
        SetCond::C => 3,
    }
}

fn set_cond_inv(code: u64) -> Option<SetCond> {
    Some(match code {
        0 => SetCond::None,
        1 => SetCond::Z,
        2 => SetCond::N,
        3 => SetCond::C,
        _ => return None,
    })
}

fn assign_cond_code(c: AssignCond) -> u64 {
    match c {
        AssignCond::Always => 0,
        AssignCond::Never => 1,
        AssignCond::Flag(Flag::Zs) => 2,
        AssignCond::Flag(Flag::Zc) => 3,
        AssignCond::Flag(Flag::Ns) => 4,
        AssignCond::Flag(Flag::Nc) => 5,
    }
}

fn assign_cond_inv(code: u64) -> Option<AssignCond> {
    Some(match code {
        0 => AssignCond::Always,
        1 => AssignCond::Never,
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

/// Destination → (magic bit, waddr).
fn waddr_of(dest: Reg) -> Result<(bool, u64), CompileError> {
    Ok(match dest {
        Reg::A(r) if r < 32 => (false, r as u64),
        Reg::Acc(n) if n < 6 => (true, 32 + n as u64),
        Reg::None => (true, WADDR_NOP),
        Reg::Special(s) => (
            true,
            match s {
                SpecialReg::TmuD => 40,
                SpecialReg::TmuA => 41,
                SpecialReg::Tmu0S => 42,
                SpecialReg::SfuRecip => 52,
                SpecialReg::SfuRecipSqrt => 53,
                SpecialReg::SfuExp => 54,
                SpecialReg::SfuLog => 55,
                SpecialReg::SfuSin => 56,
                other => {
                    return Err(CompileError::Internal(format!(
                        "register {} is not writable on v3d",
                        other.name()
                    )))
                }
            },
        ),
        other => {
            return Err(CompileError::Internal(format!(
                "unencodable v3d destination {}",
                other
            )))
        }
    })
}

fn waddr_inv(magic: bool, waddr: u64) -> Option<Reg> {
    Some(match (magic, waddr) {
        (false, w) if w < 32 => Reg::A(w as u8),
        (true, w) if (32..38).contains(&w) => Reg::Acc((w - 32) as u8),
        (true, 39) => Reg::None,
        (true, 40) => Reg::Special(SpecialReg::TmuD),
        (true, 41) => Reg::Special(SpecialReg::TmuA),
        (true, 42) => Reg::Special(SpecialReg::Tmu0S),
        (true, 52) => Reg::Special(SpecialReg::SfuRecip),
        (true, 53) => Reg::Special(SpecialReg::SfuRecipSqrt),
        (true, 54) => Reg::Special(SpecialReg::SfuExp),
        (true, 55) => Reg::Special(SpecialReg::SfuLog),
        (true, 56) => Reg::Special(SpecialReg::SfuSin),
        _ => return None,
    })
}

// ─── Read-port assignment ─────────────────────────────────────────

#[derive(Default)]
struct ReadPorts {
    raddr_a: Option<u64>,
    raddr_b: Option<u64>,
    small_imm: Option<u64>,
    ldunif: bool,
}

impl ReadPorts {
    fn operand(&mut self, o: RegOrImm) -> Result<u64, CompileError> {
        match o {
            RegOrImm::Reg(Reg::A(r)) if r < 32 => self.claim(r as u64),
            RegOrImm::Reg(Reg::Acc(n)) if n < 6 => Ok(n as u64),
            RegOrImm::Reg(Reg::Special(SpecialReg::UniformRead)) => {
                self.ldunif = true;
                self.claim(RADDR_UNIF)
            }
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
                match (self.raddr_b, self.small_imm) {
                    (Some(_), _) => Err(CompileError::Internal(
                        "small immediate conflicts with the B read port".to_string(),
                    )),
                    (None, Some(c)) if c != code => Err(CompileError::Internal(
                        "two distinct small immediates in one instruction".to_string(),
                    )),
                    _ => {
                        self.small_imm = Some(code);
                        Ok(MUX_B)
                    }
                }
            }
            RegOrImm::Reg(other) => Err(CompileError::Internal(format!(
                "unencodable v3d operand {}",
                other
            ))),
        }
    }

    /// Both read ports index the one register file.
    fn claim(&mut self, raddr: u64) -> Result<u64, CompileError> {
        match self.raddr_a {
            None => {
                self.raddr_a = Some(raddr);
                return Ok(MUX_A);
            }
            Some(r) if r == raddr => return Ok(MUX_A),
            Some(_) => {}
        }
        if self.small_imm.is_some() {
            return Err(CompileError::Internal(
                "B read port taken by a small immediate".to_string(),
            ));
        }
        match self.raddr_b {
            None => {
                self.raddr_b = Some(raddr);
                Ok(MUX_B)
            }
            Some(r) if r == raddr => Ok(MUX_B),
            Some(_) => Err(CompileError::Internal(
                "three distinct register reads in one instruction".to_string(),
            )),
        }
    }
}

fn read_operand(mux: u64, raddr_a: u64, raddr_b: u64, small_imm: bool) -> Option<RegOrImm> {
    let regfile = |raddr: u64| -> Option<RegOrImm> {
        Some(match raddr {
            r if r < 32 => RegOrImm::Reg(Reg::A(r as u8)),
            RADDR_UNIF => RegOrImm::Reg(Reg::Special(SpecialReg::UniformRead)),
            _ => return None,
        })
    };
    match mux {
        0..=5 => Some(RegOrImm::Reg(Reg::Acc(mux as u8))),
        MUX_A => regfile(raddr_a),
        MUX_B => {
            if small_imm {
                let v = if raddr_b < 16 {
                    raddr_b as i32
                } else {
                    raddr_b as i32 - 32
                };
                Some(RegOrImm::Imm(SmallImm(v)))
            } else {
                regfile(raddr_b)
            }
        }
        _ => None,
    }
}

// ─── Encoding ─────────────────────────────────────────────────────

/// Encode a whole instruction list: schedule branch delays, link labels,
/// then map to words. `End` expands to the terminal signature
/// `nop.thrsw ×2, nop ×3, nop.thrsw, nop ×2`.
pub fn encode_program(instrs: &[Instr]) -> Result<Vec<u64>, CompileError> {
    let mut list = instrs.to_vec();
    link::insert_branch_delays(&mut list);
    let linked = link::link(&list)?;

    let mut words = Vec::new();
    for instr in &linked {
        match instr.kind {
            InstrKind::End => {
                words.push(nop_word(SIG_THRSW));
                words.push(nop_word(SIG_THRSW));
                words.push(nop_word(0));
                words.push(nop_word(0));
                words.push(nop_word(0));
                words.push(nop_word(SIG_THRSW));
                words.push(nop_word(0));
                words.push(nop_word(0));
            }
            _ => words.push(encode(&instr.kind)?),
        }
    }
    log::debug!("v3d encode: {} instructions -> {} words", instrs.len(), words.len());
    Ok(words)
}

fn nop_word(sig: u64) -> u64 {
    (sig << 53)
        | (assign_cond_code(AssignCond::Never) << 46)
        | (1 << 45)
        | (WADDR_NOP << 38)
        | (RADDR_NOP << 18)
        | (RADDR_NOP << 12)
}

/// Encode a single (post-link) instruction.
pub fn encode(kind: &InstrKind) -> Result<u64, CompileError> {
    match kind {
        InstrKind::Nop => Ok(nop_word(0)),
        InstrKind::Thrsw => Ok(nop_word(SIG_THRSW)),
        InstrKind::Tmu0ToAcc4 => {
            // Receive into r4, signalled through ldtmu.
            let (magic, waddr) = waddr_of(Reg::Acc(4))?;
            Ok((SIG_LDTMU << 53)
                | (assign_cond_code(AssignCond::Always) << 46)
                | ((magic as u64) << 45)
                | (waddr << 38)
                | (RADDR_NOP << 18)
                | (RADDR_NOP << 12))
        }
        InstrKind::TmuWait => Ok((assign_cond_code(AssignCond::Never) << 46)
            | (1 << 45)
            | (WADDR_NOP << 38)
            | (OP_TMUWT << 24)
            | (RADDR_NOP << 18)
            | (RADDR_NOP << 12)),
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
            let (magic, waddr) = waddr_of(*dest)?;
            let bits = match imm {
                Imm::Int(i) => *i as u32 as u64,
                Imm::Float(x) => x.to_bits() as u64,
            };
            Ok((OPM_LOAD_IMM << 58)
                | (set_cond_code(*set_cond) << 50)
                | (assign_cond_code(*cond) << 46)
                | ((magic as u64) << 45)
                | (waddr << 38)
                | bits)
        }
        InstrKind::Br { cond, target } => Ok((OPM_BRANCH << 58)
            | (branch_cond_code(*cond) << 46)
            | ((*target * 8) as u32 as u64)),
        InstrKind::Brl { .. } | InstrKind::Label(_) => Err(CompileError::Internal(
            "unlinked label construct reached the v3d encoder".to_string(),
        )),
        InstrKind::End | InstrKind::InitBegin | InstrKind::InitEnd => Err(
            CompileError::Internal("marker reached v3d single-instruction encoder".to_string()),
        ),
        InstrKind::DmaLoadWait
        | InstrKind::DmaStoreWait
        | InstrKind::SemaInc(_)
        | InstrKind::SemaDec(_) => Err(CompileError::Internal(format!(
            "vc4-only instruction {:?} in v3d stream",
            kind
        ))),
    }
}

fn encode_alu(
    set_cond: SetCond,
    cond: AssignCond,
    dest: Reg,
    src_a: RegOrImm,
    op: AluOp,
    src_b: RegOrImm,
) -> Result<u64, CompileError> {
    let (magic, waddr) = waddr_of(dest)?;
    let mut ports = ReadPorts::default();
    // tidx/eidx read hardware state, not the register ports.
    let sourceless = matches!(op, AluOp::TIdx | AluOp::EIdx);
    let (mux_a, mux_b) = if sourceless {
        (0, 0)
    } else {
        (ports.operand(src_a)?, ports.operand(src_b)?)
    };

    let mut word = (set_cond_code(set_cond) << 50)
        | (assign_cond_code(cond) << 46)
        | ((magic as u64) << 45)
        | (waddr << 38);

    if let Some(mul_op) = mul_opcode(op) {
        word |= (mul_op << 58) | (mux_a << 3) | mux_b;
    } else {
        let add_op = add_opcode(op).ok_or_else(|| {
            CompileError::Internal(format!("no v3d add-ALU opcode for {:?}", op))
        })?;
        word |= (add_op << 24) | (mux_a << 9) | (mux_b << 6);
    }

    let mut sig = 0;
    if ports.small_imm.is_some() {
        sig |= SIG_SMIMM;
    }
    if ports.ldunif {
        sig |= SIG_LDUNIF;
    }
    let raddr_b = ports.small_imm.or(ports.raddr_b).unwrap_or(RADDR_NOP);
    word |= (sig << 53)
        | (ports.raddr_a.unwrap_or(RADDR_NOP) << 18)
        | (raddr_b << 12);
    Ok(word)
}

// ─── Decoding ─────────────────────────────────────────────────────

/// Invert `encode` for the instruction kinds the back-end emits.
pub fn decode(word: u64) -> Option<InstrKind> {
    let op_mul = word >> 58;
    match op_mul {
        OPM_BRANCH => {
            let cond = branch_cond_inv((word >> 46) & 0xf)?;
            Some(InstrKind::Br {
                cond,
                target: (word as u32 as i32) / 8,
            })
        }
        OPM_LOAD_IMM => Some(InstrKind::LoadImm {
            set_cond: set_cond_inv((word >> 50) & 0x7)?,
            cond: assign_cond_inv((word >> 46) & 0xf)?,
            dest: waddr_inv((word >> 45) & 1 == 1, (word >> 38) & 0x3f)?,
            imm: Imm::Int(word as u32 as i32),
        }),
        _ => {
            let sig = (word >> 53) & 0x1f;
            let set_cond = set_cond_inv((word >> 50) & 0x7)?;
            let cond = assign_cond_inv((word >> 46) & 0xf)?;
            let magic = (word >> 45) & 1 == 1;
            let waddr = (word >> 38) & 0x3f;
            let op_add = (word >> 24) & 0xff;
            let raddr_a = (word >> 18) & 0x3f;
            let raddr_b = (word >> 12) & 0x3f;
            let small = sig & SIG_SMIMM != 0;

            if sig & SIG_LDTMU != 0 {
                return Some(InstrKind::Tmu0ToAcc4);
            }
            if op_add == OP_TMUWT {
                return Some(InstrKind::TmuWait);
            }

            let dest = waddr_inv(magic, waddr)?;
            if op_mul != 0 {
                let op = match op_mul {
                    1 => AluOp::FMul,
                    2 => AluOp::Mul24,
                    _ => return None,
                };
                let src_a = read_operand((word >> 3) & 0x7, raddr_a, raddr_b, small)?;
                let src_b = read_operand(word & 0x7, raddr_a, raddr_b, small)?;
                return Some(InstrKind::Alu {
                    set_cond,
                    cond,
                    dest,
                    src_a,
                    op,
                    src_b,
                });
            }

            let op = add_opcode_inv(op_add)?;
            if op == AluOp::Nop && dest == Reg::None {
                return Some(if sig & SIG_THRSW != 0 {
                    InstrKind::Thrsw
                } else {
                    InstrKind::Nop
                });
            }
            if matches!(op, AluOp::TIdx | AluOp::EIdx) {
                return Some(InstrKind::Alu {
                    set_cond,
                    cond,
                    dest,
                    src_a: RegOrImm::Reg(Reg::None),
                    op,
                    src_b: RegOrImm::Reg(Reg::None),
                });
            }
            let src_a = read_operand((word >> 9) & 0x7, raddr_a, raddr_b, small)?;
            let src_b = read_operand((word >> 6) & 0x7, raddr_a, raddr_b, small)?;
            Some(InstrKind::Alu {
                set_cond,
                cond,
                dest,
                src_a,
                op,
                src_b,
            })
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────
