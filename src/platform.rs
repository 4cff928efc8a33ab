//! Target platform selection and the hardware constants that differ
//! between VideoCore generations.

use std::fmt;
use std::str::FromStr;

/// Number of SIMD lanes in a QPU vector.
pub const NUM_LANES: usize = 16;

/// Branch delay slots on both VideoCore generations.
pub const BRANCH_DELAY_SLOTS: usize = 3;

/// Ceiling on virtual registers per compilation. Exceeding it is a
/// frontend diagnostic, not an allocator failure.
pub const MAX_VREGS: usize = 1024;

/// A VideoCore GPU generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    /// VideoCore IV (Raspberry Pi 1-3). Two register files, VPM/DMA transfers.
    Vc4,
    /// VideoCore VI (Raspberry Pi 4). Single register file, TMU transfers.
    V3d,
}

impl Platform {
    /// Slots per physical register file.
    pub fn regfile_size(self) -> u8 {
        32
    }

    /// vc4 has a second register file the allocator may fall back to.
    pub fn has_regfile_b(self) -> bool {
        matches!(self, Platform::Vc4)
    }

    pub fn name(self) -> &'static str {
        match self {
            Platform::Vc4 => "vc4",
            Platform::V3d => "v3d",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vc4" => Ok(Platform::Vc4),
            "v3d" => Ok(Platform::V3d),
            _ => Err(format!("unknown platform '{}' (expected vc4 or v3d)", s)),
        }
    }
}
