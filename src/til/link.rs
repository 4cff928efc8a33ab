//! Branch-delay scheduling and label resolution.
//!
//! Both VideoCore generations execute three delay slots after a branch.
//! The link step first pads every branch with explicit NOPs, then strips
//! the zero-width pseudo instructions (labels, init markers) and rewrites
//! every `Brl` into a `Br` whose immediate is
//! `target_index − source_index − delay_slots`.

use std::collections::HashMap;

use super::{Instr, InstrKind};
use crate::error::CompileError;
use crate::platform::BRANCH_DELAY_SLOTS;

/// Insert the delay-slot NOPs after every branch.
pub fn insert_branch_delays(instrs: &mut Vec<Instr>) {
    let mut i = 0;
    while i < instrs.len() {
        if matches!(instrs[i].kind, InstrKind::Brl { .. } | InstrKind::Br { .. }) {
            for _ in 0..BRANCH_DELAY_SLOTS {
                instrs.insert(i + 1, Instr::nop().comment("branch delay slot"));
            }
            i += BRANCH_DELAY_SLOTS;
        }
        i += 1;
    }
}

/// Strip zero-width pseudo instructions and resolve every label branch
/// into an immediate-offset branch.
pub fn link(instrs: &[Instr]) -> Result<Vec<Instr>, CompileError> {
    // Zero-width entries resolve to the index of the next real instruction.
    let mut labels: HashMap<u32, i32> = HashMap::new();
    let mut out: Vec<Instr> = Vec::with_capacity(instrs.len());
    for instr in instrs {
        match instr.kind {
            InstrKind::Label(l) => {
                if labels.insert(l.0, out.len() as i32).is_some() {
                    return Err(CompileError::Internal(format!(
                        "label {} defined more than once",
                        l
                    )));
                }
            }
            InstrKind::InitBegin | InstrKind::InitEnd => {}
            _ => out.push(instr.clone()),
        }
    }

    for (i, instr) in out.iter_mut().enumerate() {
        if let InstrKind::Brl { cond, label } = instr.kind {
            let target = *labels.get(&label.0).ok_or_else(|| {
                CompileError::Internal(format!("branch to undefined label {}", label))
            })?;
            instr.kind = InstrKind::Br {
                cond,
                target: target - i as i32 - BRANCH_DELAY_SLOTS as i32,
            };
        }
    }
    Ok(out)
}

// ─── Tests ────────────────────────────────────────────────────────
