//! Control-flow graph construction over the TIL.
//!
//! One forward pass: labels are resolved into an index table first, then
//! every instruction gets its successor set. The graph is immutable for
//! the duration of liveness and allocation; any structural rewrite of the
//! instruction list requires rebuilding it.

use std::collections::HashMap;

use super::{Instr, InstrId, InstrKind};
use crate::error::CompileError;

/// Successor sets, one per instruction. At most two entries each.
pub struct Cfg {
    succs: Vec<Vec<InstrId>>,
}

impl Cfg {
    pub fn build(instrs: &[Instr]) -> Result<Cfg, CompileError> {
        let mut label_index: HashMap<u32, InstrId> = HashMap::new();
        for (i, instr) in instrs.iter().enumerate() {
            if let InstrKind::Label(l) = instr.kind {
                if label_index.insert(l.0, i).is_some() {
                    return Err(CompileError::Internal(format!(
                        "label {} defined more than once",
                        l
                    )));
                }
            }
        }

        let n = instrs.len();
        let mut succs = Vec::with_capacity(n);
        for (i, instr) in instrs.iter().enumerate() {
            let fallthrough = i + 1 < n;
            let set = match &instr.kind {
                InstrKind::Brl { cond, label } => {
                    let target = *label_index.get(&label.0).ok_or_else(|| {
                        CompileError::Internal(format!("branch to undefined label {}", label))
                    })?;
                    if cond == &super::BranchCond::Always {
                        vec![target]
                    } else if fallthrough {
                        vec![target, i + 1]
                    } else {
                        vec![target]
                    }
                }
                InstrKind::Br { .. } => {
                    return Err(CompileError::Internal(
                        "resolved branch in pre-link instruction list".to_string(),
                    ))
                }
                InstrKind::End => Vec::new(),
                _ if fallthrough => vec![i + 1],
                _ => Vec::new(),
            };
            succs.push(set);
        }
        Ok(Cfg { succs })
    }

    pub fn successors(&self, i: InstrId) -> &[InstrId] {
        &self.succs[i]
    }

    pub fn len(&self) -> usize {
        self.succs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.succs.is_empty()
    }
}

// ─── Tests ────────────────────────────────────────────────────────
