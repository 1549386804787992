//! Benchmarks for argument binding and native calls

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use extern_bind::ffi::FfiSignature;
use extern_bind::{CallArgs, CallSignature, FfiType, FfiValue, Param};

/// Benchmark argument binding for varying parameter counts
fn bench_bind_args(c: &mut Criterion) {
    let mut group = c.benchmark_group("bind_args");

    for &size in &[1usize, 4, 8] {
        let signature = create_signature(size);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_function(format!("{}_positional", size), |b| {
            b.iter(|| {
                let args = CallArgs::positional((0..size).map(|i| FfiValue::Int(i as i64)));
                black_box(signature.bind_args(args, false))
            })
        });

        group.bench_function(format!("{}_defaults_and_keyword", size), |b| {
            b.iter(|| {
                let args = CallArgs::new().arg(1).kwarg("p0", 7);
                black_box(signature.bind_args(args, false))
            })
        });
    }

    group.finish();
}

/// Benchmark C signature parsing
fn bench_parse_signature(c: &mut Criterion) {
    c.bench_function("parse_signature", |b| {
        b.iter(|| {
            black_box(FfiSignature::parse(black_box(
                "unsigned long strtoul(const char* s, void* end, int base)",
            )))
        })
    });
}

/// Benchmark a full call through libc
#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn bench_native_call(c: &mut Criterion) {
    use extern_bind::{bind, ExternDecl};

    let abs = bind("libc.so.6")
        .build(ExternDecl::from_c_signature("int abs(int x)").unwrap())
        .unwrap();

    c.bench_function("call_abs", |b| {
        b.iter(|| black_box(abs.invoke([FfiValue::Int(black_box(-42))])))
    });
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn bench_native_call(_c: &mut Criterion) {}

/// Signature with one required parameter followed by defaults
fn create_signature(size: usize) -> CallSignature {
    let params: Vec<Param> = (0..size)
        .map(|i| {
            let param = Param::new(format!("p{}", i), FfiType::I64);
            if i == 0 {
                param
            } else {
                param.with_default(i as i64)
            }
        })
        .collect();
    CallSignature::from_params(&params).unwrap()
}

criterion_group!(
    benches,
    bench_bind_args,
    bench_parse_signature,
    bench_native_call,
);
criterion_main!(benches);
