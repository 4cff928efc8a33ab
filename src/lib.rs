//! Reef — an embedded kernel compiler for the Broadcom VideoCore QPUs.
//!
//! Kernels are written as ordinary Rust code through value-typed
//! expression builders; `compile` lowers the resulting AST through the
//! target instruction list, runs liveness analysis and graph-coloring
//! register allocation, applies the platform rewrites, and encodes the
//! 64-bit instruction stream for the vc4 (Pi 1-3) or v3d (Pi 4) GPU.
//! The built-in emulator executes the compiled target code on any host.

pub mod ast;
pub mod dsl;
pub mod emu;
pub mod error;
pub mod kernel;
pub mod platform;
pub mod til;
pub mod v3d;
pub mod vc4;

pub use emu::{BufferObject, SharedArray};
pub use error::{CompileError, RunError};
pub use kernel::{compile, Kernel, KernelArg};
pub use platform::Platform;
