//! The compile pipeline driver and the host-side kernel handle.
//!
//! `compile` runs the fixed pass list: DSL construction → frontend
//! lowering → init block → CFG → liveness/allocation → operand peephole
//! → encoding. Either every pass succeeds and a `Kernel` is produced, or
//! the first error aborts the compilation with no artifact.

use log::debug;

use crate::dsl::KernelBuilder;
use crate::emu::{ArrayElem, BufferObject, SharedArray};
use crate::error::{CompileError, RunError};
use crate::platform::Platform;
use crate::til::cfg::Cfg;
use crate::til::translate::{create_translate, translate, Param, ParamKind};
use crate::til::{self, Instr};

/// An argument bound to a kernel uniform.
pub enum KernelArg {
    /// A shared-array device address.
    Ptr { addr: u32, bo: BufferObject },
    Int(i32),
    Float(f32),
}

impl<T: ArrayElem> From<&SharedArray<T>> for KernelArg {
    fn from(arr: &SharedArray<T>) -> Self {
        KernelArg::Ptr {
            addr: arr.addr(),
            bo: arr.buffer().clone(),
        }
    }
}

impl From<i32> for KernelArg {
    fn from(v: i32) -> Self {
        KernelArg::Int(v)
    }
}

impl From<f32> for KernelArg {
    fn from(v: f32) -> Self {
        KernelArg::Float(v)
    }
}

/// A compiled kernel: the final target code, its encoded form, and the
/// uniform binding state.
pub struct Kernel {
    platform: Platform,
    target: Vec<Instr>,
    code: Vec<u64>,
    params: Vec<Param>,
    uniforms: Option<Vec<u32>>,
    bo: Option<BufferObject>,
}

/// Build the kernel described by `f` and run the full pipeline for
/// `platform`.
pub fn compile(platform: Platform, f: impl FnOnce()) -> Result<Kernel, CompileError> {
    KernelBuilder::begin();
    f();
    let src = KernelBuilder::end()?;

    let plat = create_translate(platform);
    let (mut instrs, mut ctx) = translate(&src, &*plat)?;
    plat.add_init(&mut instrs, &mut ctx)?;

    let cfg = Cfg::build(&instrs)?;
    plat.reg_alloc(&cfg, &mut instrs, ctx.num_vars())?;
    plat.satisfy(&mut instrs);

    let code = plat.encode(&instrs)?;
    debug!(
        "compiled {} kernel: {} instructions, {} words, {} uniforms",
        platform,
        instrs.len(),
        code.len(),
        src.params.len()
    );

    Ok(Kernel {
        platform,
        target: instrs,
        code,
        params: src.params,
        uniforms: None,
        bo: None,
    })
}

impl Kernel {
    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Bind shared-buffer arguments and scalars, in declaration order.
    pub fn load(&mut self, args: &[KernelArg]) -> Result<&mut Self, RunError> {
        if args.len() != self.params.len() {
            return Err(RunError::Fault(format!(
                "kernel takes {} arguments, {} supplied",
                self.params.len(),
                args.len()
            )));
        }
        let mut uniforms = Vec::with_capacity(args.len());
        let mut bo: Option<BufferObject> = None;
        for (param, arg) in self.params.iter().zip(args) {
            let value = match (param.kind, arg) {
                (ParamKind::IntPtr | ParamKind::FloatPtr, KernelArg::Ptr { addr, bo: b }) => {
                    match &bo {
                        None => bo = Some(b.clone()),
                        Some(existing) if existing.same_heap(b) => {}
                        Some(_) => {
                            return Err(RunError::Fault(
                                "all kernel arrays must share one buffer object".to_string(),
                            ))
                        }
                    }
                    *addr
                }
                (ParamKind::Int, KernelArg::Int(v)) => *v as u32,
                (ParamKind::Float, KernelArg::Float(v)) => v.to_bits(),
                _ => {
                    return Err(RunError::Fault(format!(
                        "argument for '{}' does not match its declaration",
                        param.name
                    )))
                }
            };
            uniforms.push(value);
        }
        self.uniforms = Some(uniforms);
        self.bo = bo;
        Ok(self)
    }

    /// Dispatch on the emulated device across `num_qpus` QPU instances.
    pub fn call(&mut self, num_qpus: u8, max_cycles: usize) -> Result<(), RunError> {
        if num_qpus != 1 && num_qpus != 8 {
            return Err(RunError::Fault(format!(
                "num_qpus must be 1 or 8, got {}",
                num_qpus
            )));
        }
        if self.uniforms.is_none() {
            return Err(RunError::Fault("kernel arguments not loaded".to_string()));
        }
        let tape = self.uniform_tape(num_qpus);
        let dummy;
        let bo = match &self.bo {
            Some(bo) => bo,
            None => {
                dummy = BufferObject::new(4);
                &dummy
            }
        };
        for qpu in 0..num_qpus {
            crate::emu::run(&self.target, &tape, qpu, bo, max_cycles)?;
        }
        Ok(())
    }

    /// The uniform tape in dispatch order. v3d prepends the hidden QPU
    /// count consumed by the init block.
    pub fn uniform_tape(&self, num_qpus: u8) -> Vec<u32> {
        let bound = self.uniforms.clone().unwrap_or_default();
        match self.platform {
            Platform::V3d => std::iter::once(num_qpus as u32).chain(bound).collect(),
            Platform::Vc4 => bound,
        }
    }

    /// The encoded 64-bit little-endian instruction stream.
    pub fn encoded(&self) -> &[u64] {
        &self.code
    }

    /// The full dispatch image: little-endian instruction words followed
    /// by the uniform tape.
    pub fn emit(&self, num_qpus: u8) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.code.len() * 8);
        for word in &self.code {
            out.extend_from_slice(&word.to_le_bytes());
        }
        for value in self.uniform_tape(num_qpus) {
            out.extend_from_slice(&value.to_le_bytes());
        }
        out
    }

    /// The final target code, pre-link, with labels intact.
    pub fn target(&self) -> &[Instr] {
        &self.target
    }

    /// Mnemonic dump with headers and comments.
    pub fn dump(&self) -> String {
        til::mnemonics(&self.target, true)
    }
}

// ─── Tests ────────────────────────────────────────────────────────
