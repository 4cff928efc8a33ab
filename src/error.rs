//! Compiler and runtime error types.

use thiserror::Error;

use crate::platform::Platform;

/// A fatal compile error. No artifact is produced when any of these is
/// returned; there is no partial emission.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    /// Mismatched operand base types in a source expression.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// A platform-exclusive construct used on the wrong platform.
    #[error("{construct} is not available on {platform}")]
    Unsupported {
        construct: String,
        platform: Platform,
    },

    /// The allocator exhausted the register file(s).
    #[error("register allocation failed for v{vreg} at target instruction {instr}: {mnemonic}")]
    RegisterPressure {
        vreg: u32,
        instr: usize,
        mnemonic: String,
    },

    /// The frontend ran out of virtual registers.
    #[error("virtual register limit ({limit}) exceeded while lowering `{stmt}`")]
    VregSaturation { limit: usize, stmt: String },

    /// Malformed target code: broken label, operand-class violation.
    /// Cannot occur on a well-formed source AST.
    #[error("internal compiler error: {0}")]
    Internal(String),
}

/// A runtime (dispatch) failure, surfaced unmodified to the caller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RunError {
    /// The kernel did not reach its end instruction within the cycle budget.
    #[error("kernel did not terminate within {max_cycles} cycles")]
    Timeout { max_cycles: usize },

    /// Emulated device fault (bad address, unbound argument, ...).
    #[error("device fault: {0}")]
    Fault(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_line_diagnostics() {
        let e = CompileError::RegisterPressure {
            vreg: 33,
            instr: 7,
            mnemonic: "add v33, v1, v2".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("v33"));
        assert!(msg.contains("instruction 7"));
        assert!(!msg.contains('\n'));
    }

    #[test]
    fn test_unsupported_names_platform() {
        let e = CompileError::Unsupported {
            construct: "semaphore increment".into(),
            platform: Platform::V3d,
        };
        assert_eq!(e.to_string(), "semaphore increment is not available on v3d");
    }
}
