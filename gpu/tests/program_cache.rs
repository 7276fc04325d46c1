use std::sync::Arc;
use std::thread;

use kernelfall_gpu::{
    Expr, FunctionDefinition, Gpu, KernelBody, KernelConfig, KernelError, SoftwareDevice,
    ValueType,
};

fn software_gpu() -> (Gpu, SoftwareDevice) {
    kernelfall_gpu::logging::init_test();
    let device = SoftwareDevice::new();
    (Gpu::builder().software(device.clone()).build(), device)
}

fn scaled() -> KernelBody {
    KernelBody::build(|k| {
        let a = k.array("a");
        let s = k.float("s");
        let x = k.thread_x();
        k.ret(a.at([x]) * s);
    })
}

fn calls_f() -> KernelBody {
    KernelBody::build(|k| {
        let x = k.thread_x();
        k.ret(Expr::call("f", vec![x]));
    })
}

fn unary(f: impl FnOnce(Expr) -> Expr) -> KernelBody {
    KernelBody::build(|k| {
        let v = k.float("v");
        k.ret(f(v.value()));
    })
}

#[test]
fn test_recompiling_the_same_kernel_reuses_the_program() {
    let (gpu, device) = software_gpu();
    let config = KernelConfig::new().dimensions(vec![8]);
    let first = gpu.compile(scaled(), &config).unwrap();
    let second = gpu.compile(scaled(), &config).unwrap();
    assert_eq!(first.signature(), second.signature());
    assert_eq!(device.programs_built(), 1);

    let stats = gpu.cache_stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.compiles, 1);
}

#[test]
fn test_dimensions_are_part_of_the_signature() {
    let (gpu, device) = software_gpu();
    let a = gpu
        .compile(scaled(), &KernelConfig::new().dimensions(vec![8]))
        .unwrap();
    let b = gpu
        .compile(scaled(), &KernelConfig::new().dimensions(vec![4, 2]))
        .unwrap();
    assert_eq!(a.id(), b.id());
    assert_ne!(a.signature(), b.signature());
    assert_eq!(device.programs_built(), 2);
}

#[test]
fn test_concurrent_compiles_build_once() {
    let (gpu, device) = software_gpu();
    let gpu = Arc::new(gpu);
    let config = KernelConfig::new().dimensions(vec![16]);
    thread::scope(|scope| {
        for _ in 0..8 {
            let gpu = Arc::clone(&gpu);
            let config = config.clone();
            scope.spawn(move || {
                let kernel = gpu.compile(scaled(), &config).unwrap();
                let out = kernel
                    .run(&[vec![1.0f32; 16].into(), 2.0f32.into()])
                    .unwrap();
                assert_eq!(out.to_vec(), vec![2.0; 16]);
            });
        }
    });
    assert_eq!(device.programs_built(), 1);
    assert_eq!(gpu.cache_stats().compiles, 1);
}

#[test]
fn test_redefined_function_is_picked_up() {
    let (gpu, device) = software_gpu();
    gpu.add_function("f", unary(|v| v.clone() * v), None, None)
        .unwrap();
    let kernel = gpu
        .compile(calls_f(), &KernelConfig::new().dimensions(vec![3]))
        .unwrap();
    assert_eq!(kernel.run(&[]).unwrap().to_vec(), vec![0.0, 1.0, 4.0]);

    gpu.add_function("f", unary(|v| v + 10.0), None, None)
        .unwrap();
    assert_eq!(kernel.run(&[]).unwrap().to_vec(), vec![10.0, 11.0, 12.0]);
    assert_eq!(device.programs_built(), 2);
    assert_eq!(gpu.cache_stats().invalidations, 1);
}

#[test]
fn test_helpers_can_call_helpers() {
    let (gpu, _) = software_gpu();
    gpu.add_function("half", unary(|v| v * 0.5), None, None)
        .unwrap()
        .add_function(
            "f",
            unary(|v| Expr::call("half", vec![v]) + 1.0),
            None,
            None,
        )
        .unwrap();
    let kernel = gpu
        .compile(calls_f(), &KernelConfig::new().dimensions(vec![3]))
        .unwrap();
    assert_eq!(kernel.run(&[]).unwrap().to_vec(), vec![1.0, 1.5, 2.0]);
}

#[test]
fn test_strict_registry_rejects_signature_changes() {
    kernelfall_gpu::logging::init_test();
    let gpu = Gpu::builder()
        .software(SoftwareDevice::new())
        .strict_functions()
        .build();
    gpu.register(FunctionDefinition::new("f", unary(|v| v * 2.0)))
        .unwrap();
    gpu.register(FunctionDefinition::new("f", unary(|v| v * 3.0)))
        .unwrap();

    let conflicting = FunctionDefinition::new("f", unary(|v| v * 4.0))
        .with_param_types(vec![ValueType::Int]);
    let err = gpu.register(conflicting).unwrap_err();
    assert!(matches!(err, KernelError::FunctionRedefinitionConflict { .. }));
}

#[test]
fn test_builtin_names_are_reserved() {
    let (gpu, _) = software_gpu();
    let err = gpu
        .add_function("round", unary(|v| v), None, None)
        .unwrap_err();
    assert!(matches!(err, KernelError::InvalidArgument(_)));
}

#[test]
fn test_bounded_cache_evicts_oldest() {
    kernelfall_gpu::logging::init_test();
    let device = SoftwareDevice::new();
    let gpu = Gpu::builder()
        .software(device.clone())
        .cache_capacity(1)
        .build();
    let first = KernelConfig::new().dimensions(vec![8]);
    let second = KernelConfig::new().dimensions(vec![4]);
    gpu.compile(scaled(), &first).unwrap();
    gpu.compile(scaled(), &second).unwrap();
    gpu.compile(scaled(), &first).unwrap();
    assert_eq!(device.programs_built(), 3);
    assert!(gpu.cache_stats().evictions >= 1);
}
