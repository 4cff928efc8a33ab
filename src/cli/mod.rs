//! Command-line settings harness and the built-in demo kernels.

use clap::{Parser, ValueEnum};
use log::info;

use reef::dsl::lang::*;
use reef::{compile, BufferObject, Kernel, KernelArg, Platform, SharedArray};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PlatformArg {
    Vc4,
    V3d,
    /// Compile for vc4, execute on the emulator.
    Emu,
}

impl PlatformArg {
    fn platform(self) -> Platform {
        match self {
            PlatformArg::Vc4 | PlatformArg::Emu => Platform::Vc4,
            PlatformArg::V3d => Platform::V3d,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RunMode {
    Default,
    Interpreter,
    Emulator,
    Qpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Demo {
    /// Elementwise Euclidean GCD over 16 lanes.
    Gcd,
    /// 1024-element float dot product with per-QPU partial sums.
    Dotprod,
    /// Masked pointer store: lanes 0..7 written, 8..15 untouched.
    Mask,
}

#[derive(Parser)]
#[command(name = "reef", version, about = "QPU kernel compiler for VideoCore vc4 and v3d")]
pub struct Settings {
    /// Demo kernel to compile and run.
    #[arg(value_enum)]
    pub kernel: Demo,

    #[arg(long, value_enum, default_value_t = PlatformArg::Emu)]
    pub platform: PlatformArg,

    #[arg(long = "num-qpus", default_value_t = 1)]
    pub num_qpus: u8,

    /// Print the target-code mnemonics after compilation.
    #[arg(long)]
    pub dump_target: bool,

    #[arg(long, value_enum, default_value_t = RunMode::Default)]
    pub run: RunMode,
}

const MAX_CYCLES: usize = 2_000_000;

pub fn run(settings: &Settings) -> Result<(), String> {
    if settings.run == RunMode::Qpu {
        return Err("QPU dispatch requires a VideoCore device driver".to_string());
    }
    let platform = settings.platform.platform();
    info!("compiling {:?} for {}", settings.kernel, platform);

    match settings.kernel {
        Demo::Gcd => demo_gcd(settings, platform),
        Demo::Dotprod => demo_dotprod(settings, platform),
        Demo::Mask => demo_mask(settings, platform),
    }
}

fn finish(settings: &Settings, k: &mut Kernel, args: &[KernelArg]) -> Result<(), String> {
    if settings.dump_target {
        print!("{}", k.dump());
    }
    k.load(args).map_err(|e| e.to_string())?;
    k.call(settings.num_qpus, MAX_CYCLES)
        .map_err(|e| e.to_string())?;
    Ok(())
}

// ─── Demo kernels ─────────────────────────────────────────────────

/// The kernel from the front page: per-lane Euclidean GCD.
pub fn gcd_kernel() {
    let p = uniform_int_ptr("p");
    let q = uniform_int_ptr("q");
    let r = uniform_int_ptr("r");

    let a = Int::new(p.load());
    let b = Int::new(q.load());
    while_(any(a.ne(&b)), || {
        where_(a.gt(&b), || a.assign(&a - &b));
        where_(a.lt(&b), || b.assign(&b - &a));
    });
    r.store(&a);
}

fn demo_gcd(settings: &Settings, platform: Platform) -> Result<(), String> {
    let mut k = compile(platform, gcd_kernel).map_err(|e| e.to_string())?;

    let bo = BufferObject::new(1 << 12);
    let a = SharedArray::<i32>::new(&bo, 16);
    let b = SharedArray::<i32>::new(&bo, 16);
    let r = SharedArray::<i32>::new(&bo, 16);
    for i in 0..16 {
        a.set(i, 100 + (i as i32 * 37) % 100);
        b.set(i, 100 + (i as i32 * 61 + 13) % 100);
    }

    finish(settings, &mut k, &[(&a).into(), (&b).into(), (&r).into()])?;
    for i in 0..16 {
        println!("gcd({}, {}) = {}", a.get(i), b.get(i), r.get(i));
    }
    Ok(())
}

/// Dot product over two float buffers; each lane of each QPU
/// accumulates a strided slice, the host sums the partial results.
pub fn dotprod_kernel(n: i32, num_qpus: i32) {
    let p = uniform_float_ptr("p");
    let q = uniform_float_ptr("q");
    let r = uniform_float_ptr("r");

    let sum = Float::new(0.0);
    let i = Int::new(0);
    let stride = 16 * num_qpus;
    for_(
        any(i.lt(n / stride)),
        || i.assign(&i + 1),
        || {
            sum.assign(&sum + p.load() * q.load());
            p.advance(stride);
            q.advance(stride);
        },
    );
    r.store(&sum);
}

fn demo_dotprod(settings: &Settings, platform: Platform) -> Result<(), String> {
    let n = 1024;
    let qpus = settings.num_qpus as i32;
    let mut k = compile(platform, || dotprod_kernel(n, qpus)).map_err(|e| e.to_string())?;

    let bo = BufferObject::new(1 << 16);
    let p = SharedArray::<f32>::new(&bo, n as usize);
    let q = SharedArray::<f32>::new(&bo, n as usize);
    let r = SharedArray::<f32>::new(&bo, 16 * settings.num_qpus as usize);
    for i in 0..n as usize {
        p.set(i, (i as f32).sin());
        q.set(i, 1.0 / (1.0 + i as f32));
    }
    r.fill(0.0);

    finish(settings, &mut k, &[(&p).into(), (&q).into(), (&r).into()])?;

    let gpu: f32 = r.to_vec().iter().sum();
    let cpu: f32 = (0..n as usize).map(|i| p.get(i) * q.get(i)).sum();
    println!("dot product: gpu = {:.6}, cpu = {:.6}", gpu, cpu);
    Ok(())
}

/// Masked store: only the lanes with index < 8 write.
pub fn mask_kernel() {
    let p = uniform_int_ptr("p");
    let i = Int::new(index());
    where_(i.lt(8), || p.store(&i));
}

fn demo_mask(settings: &Settings, platform: Platform) -> Result<(), String> {
    let mut k = compile(platform, mask_kernel).map_err(|e| e.to_string())?;

    let bo = BufferObject::new(1 << 10);
    let p = SharedArray::<i32>::new(&bo, 16);
    p.fill(-1);

    finish(settings, &mut k, &[(&p).into()])?;
    println!("{:?}", p.to_vec());
    Ok(())
}
