//! Benchmarks for buffer encoding, shader synthesis and the CPU executor.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kernelfall_gpu::codegen::wgsl::synthesize_body;
use kernelfall_gpu::functions::FunctionRegistry;
use kernelfall_gpu::{BufferCodec, Dimensions, Gpu, KernelBody, KernelConfig, NdArray};
use std::sync::Arc;

fn ramp(n: usize) -> NdArray {
    NdArray::from_vec((0..n).map(|i| i as f32 * 0.25).collect::<Vec<f32>>())
}

fn matmul() -> KernelBody {
    KernelBody::build(|k| {
        let a = k.array("a");
        let b = k.array("b");
        let size = k.int("size");
        let x = k.thread_x();
        let y = k.thread_y();
        let sum = k.var(0.0);
        k.for_range(0.0, size, |k, i| {
            k.assign(sum, sum + a.at([y.clone(), i.clone()]) * b.at([i, x.clone()]));
        });
        k.ret(sum);
    })
}

fn bench_encode_decode(c: &mut Criterion) {
    let codec = BufferCodec::default();
    let mut group = c.benchmark_group("codec");
    for n in [1_024usize, 65_536, 1_048_576] {
        let array = ramp(n);
        group.bench_with_input(BenchmarkId::new("encode", n), &array, |b, array| {
            b.iter(|| codec.encode(black_box(array)).unwrap())
        });
        let encoded = codec.encode(&array).unwrap();
        group.bench_with_input(BenchmarkId::new("decode", n), &encoded, |b, encoded| {
            b.iter(|| codec.decode(black_box(encoded), &[n]).unwrap())
        });
    }
    group.finish();
}

fn bench_synthesis(c: &mut Criterion) {
    let body = Arc::new(matmul());
    let registry = FunctionRegistry::new();
    let functions = registry.snapshot(&body.calls());
    let dims = Dimensions::new(&[64, 64]).unwrap();
    c.bench_function("synthesize_matmul", |b| {
        b.iter(|| synthesize_body(black_box(&body), &dims, &functions).unwrap())
    });
}

fn bench_cpu_matmul(c: &mut Criterion) {
    let gpu = Gpu::cpu_only();
    let mut group = c.benchmark_group("cpu_matmul");
    for size in [16u32, 32, 64] {
        let kernel = gpu
            .compile(matmul(), &KernelConfig::new().dimensions(vec![size, size]))
            .unwrap();
        let n = size as usize;
        let a = NdArray::new(vec![n, n], vec![1.0f32; n * n].into()).unwrap();
        let args = [a.clone().into(), a.into(), (size as f64).into()];
        group.bench_with_input(BenchmarkId::from_parameter(size), &args, |b, args| {
            b.iter(|| kernel.run(black_box(args)).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode_decode, bench_synthesis, bench_cpu_matmul);
criterion_main!(benches);
