//! End-to-end: compile kernels and execute them on the emulated device.

use reef::dsl::lang::*;
use reef::til::{InstrKind, Reg, RegOrImm};
use reef::{compile, BufferObject, CompileError, Platform, SharedArray};

const MAX_CYCLES: usize = 2_000_000;

fn gcd(mut a: i32, mut b: i32) -> i32 {
    while a != b {
        if a > b {
            a -= b;
        } else {
            b -= a;
        }
    }
    a
}

fn gcd_kernel() {
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

#[test]
fn test_gcd_on_both_platforms() {
    for platform in [Platform::Vc4, Platform::V3d] {
        let mut k = compile(platform, gcd_kernel).unwrap();

        let bo = BufferObject::new(1 << 12);
        let a = SharedArray::<i32>::new(&bo, 16);
        let b = SharedArray::<i32>::new(&bo, 16);
        let r = SharedArray::<i32>::new(&bo, 16);
        for i in 0..16 {
            a.set(i, 100 + (i as i32 * 37) % 100);
            b.set(i, 100 + (i as i32 * 61 + 13) % 100);
        }

        k.load(&[(&a).into(), (&b).into(), (&r).into()]).unwrap();
        k.call(1, MAX_CYCLES).unwrap();

        for i in 0..16 {
            assert_eq!(
                r.get(i),
                gcd(a.get(i), b.get(i)),
                "{} lane {}: gcd({}, {})",
                platform,
                i,
                a.get(i),
                b.get(i)
            );
        }
    }
}

#[test]
fn test_masked_pointer_store() {
    for platform in [Platform::Vc4, Platform::V3d] {
        let mut k = compile(platform, || {
            let p = uniform_int_ptr("p");
            let i = Int::new(index());
            where_(i.lt(8), || p.store(&i));
        })
        .unwrap();

        let bo = BufferObject::new(1 << 10);
        let p = SharedArray::<i32>::new(&bo, 16);
        p.fill(-1);

        k.load(&[(&p).into()]).unwrap();
        k.call(1, MAX_CYCLES).unwrap();

        for i in 0..16 {
            let expect = if i < 8 { i as i32 } else { -1 };
            assert_eq!(p.get(i), expect, "{} lane {}", platform, i);
        }
    }
}

fn dotprod_kernel(n: i32, num_qpus: i32) {
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

fn run_dotprod(platform: Platform, num_qpus: u8) {
    let n = 1024usize;
    let mut k = compile(platform, || dotprod_kernel(n as i32, num_qpus as i32)).unwrap();

    let bo = BufferObject::new(1 << 16);
    let p = SharedArray::<f32>::new(&bo, n);
    let q = SharedArray::<f32>::new(&bo, n);
    let r = SharedArray::<f32>::new(&bo, 16 * num_qpus as usize);
    for i in 0..n {
        p.set(i, ((i % 97) as f32) * 0.25 - 10.0);
        q.set(i, 1.0 / (1.0 + i as f32));
    }
    r.fill(0.0);

    k.load(&[(&p).into(), (&q).into(), (&r).into()]).unwrap();
    k.call(num_qpus, MAX_CYCLES).unwrap();

    let gpu: f64 = r.to_vec().iter().map(|&x| x as f64).sum();
    let cpu: f64 = (0..n).map(|i| (p.get(i) * q.get(i)) as f64).sum();
    let rel = (gpu - cpu).abs() / cpu.abs().max(1e-9);
    assert!(
        rel < 1e-3,
        "{} x{}: gpu {} vs cpu {} (rel {})",
        platform,
        num_qpus,
        gpu,
        cpu,
        rel
    );
}

#[test]
fn test_dot_product_single_qpu() {
    run_dotprod(Platform::Vc4, 1);
    run_dotprod(Platform::V3d, 1);
}

#[test]
fn test_dot_product_eight_qpus_have_disjoint_offsets() {
    run_dotprod(Platform::Vc4, 8);
    run_dotprod(Platform::V3d, 8);
}

#[test]
fn test_conversions_and_sfu() {
    let mut k = compile(Platform::V3d, || {
        let p = uniform_float_ptr("p");
        let r = uniform_float_ptr("r");
        let x = Float::new(p.load());
        r.store(recip(&x));
    })
    .unwrap();

    let bo = BufferObject::new(1 << 10);
    let p = SharedArray::<f32>::new(&bo, 16);
    let r = SharedArray::<f32>::new(&bo, 16);
    for i in 0..16 {
        p.set(i, (i + 1) as f32);
    }

    k.load(&[(&p).into(), (&r).into()]).unwrap();
    k.call(1, MAX_CYCLES).unwrap();
    for i in 0..16 {
        let expect = 1.0 / (i + 1) as f32;
        assert!((r.get(i) - expect).abs() < 1e-6, "lane {}", i);
    }
}

#[test]
fn test_if_else_takes_one_side() {
    let mut k = compile(Platform::V3d, || {
        let p = uniform_int_ptr("p");
        let n = uniform_int("n");
        let out = Int::new(0);
        if_else(
            all(n.gt(0)),
            || out.assign(1),
            || out.assign(2),
        );
        p.store(&out);
    })
    .unwrap();

    let bo = BufferObject::new(1 << 10);
    let p = SharedArray::<i32>::new(&bo, 16);

    k.load(&[(&p).into(), reef::KernelArg::Int(5)]).unwrap();
    k.call(1, MAX_CYCLES).unwrap();
    assert!(p.to_vec().iter().all(|&x| x == 1));

    k.load(&[(&p).into(), reef::KernelArg::Int(-5)]).unwrap();
    k.call(1, MAX_CYCLES).unwrap();
    assert!(p.to_vec().iter().all(|&x| x == 2));
}

#[test]
fn test_while_body_skipped_when_condition_false() {
    let mut k = compile(Platform::Vc4, || {
        let p = uniform_int_ptr("p");
        let x = Int::new(7);
        // 7 == 7 on every lane, so `any(x != 7)` is false on entry.
        while_(any(x.ne(7)), || x.assign(0));
        p.store(&x);
    })
    .unwrap();

    let bo = BufferObject::new(1 << 10);
    let p = SharedArray::<i32>::new(&bo, 16);
    k.load(&[(&p).into()]).unwrap();
    k.call(1, MAX_CYCLES).unwrap();
    assert!(p.to_vec().iter().all(|&x| x == 7));
}

#[test]
fn test_nested_where_ands_the_masks() {
    let mut k = compile(Platform::V3d, || {
        let p = uniform_int_ptr("p");
        let i = Int::new(index());
        let out = Int::new(0);
        where_(i.ge(4), || {
            where_(i.lt(12), || out.assign(1));
        });
        p.store(&out);
    })
    .unwrap();

    let bo = BufferObject::new(1 << 10);
    let p = SharedArray::<i32>::new(&bo, 16);
    k.load(&[(&p).into()]).unwrap();
    k.call(1, MAX_CYCLES).unwrap();
    for (i, &x) in p.to_vec().iter().enumerate() {
        assert_eq!(x, if (4..12).contains(&i) { 1 } else { 0 }, "lane {}", i);
    }
}

#[test]
fn test_semaphores_compile_on_vc4_only() {
    let build = || {
        let p = uniform_int_ptr("p");
        sema_inc(1);
        let i = Int::new(index());
        p.store(&i);
        sema_dec(1);
    };
    assert!(compile(Platform::Vc4, build).is_ok());
    assert!(matches!(
        compile(Platform::V3d, build),
        Err(CompileError::Unsupported { .. })
    ));
}

#[test]
fn test_no_virtual_registers_in_final_target() {
    let k = compile(Platform::V3d, gcd_kernel).unwrap();
    for instr in k.target() {
        let mut probe = instr.clone();
        let clean = std::cell::Cell::new(true);
        probe.map_regs(&|r| {
            if r.is_virtual() {
                clean.set(false);
            }
            r
        });
        assert!(clean.get(), "virtual register in `{}`", instr.mnemonic());
    }
}

#[test]
fn test_vc4_operand_files_differ_after_peephole() {
    let k = compile(Platform::Vc4, gcd_kernel).unwrap();
    for instr in k.target() {
        if let InstrKind::Alu { src_a, src_b, .. } = &instr.kind {
            if let (RegOrImm::Reg(a), RegOrImm::Reg(b)) = (src_a, src_b) {
                let same_file = matches!((a, b), (Reg::A(_), Reg::A(_)) | (Reg::B(_), Reg::B(_)));
                assert!(
                    !same_file || a == b,
                    "same-file operands in `{}`",
                    instr.mnemonic()
                );
            }
        }
    }
}
