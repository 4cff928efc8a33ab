//! End-to-end compilation benchmark: DSL construction through encoding.

use criterion::{criterion_group, criterion_main, Criterion};

use reef::dsl::lang::*;
use reef::{compile, Platform};

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

fn bench_compile(c: &mut Criterion) {
    c.bench_function("compile_gcd_vc4", |b| {
        b.iter(|| compile(Platform::Vc4, gcd_kernel).unwrap())
    });
    c.bench_function("compile_gcd_v3d", |b| {
        b.iter(|| compile(Platform::V3d, gcd_kernel).unwrap())
    });
}

criterion_group!(benches, bench_compile);
criterion_main!(benches);
