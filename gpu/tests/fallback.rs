use kernelfall_gpu::{
    Arg, Backend, ExecutionMode, Expr, FaultPlan, FunctionBody, Gpu, KernelBody, KernelConfig,
    KernelError, SoftwareDevice,
};

fn doubled() -> KernelBody {
    KernelBody::build(|k| {
        let a = k.param("a");
        let x = k.thread_x();
        k.ret(a.at([x]) * 2.0);
    })
}

fn input() -> Vec<Arg> {
    vec![vec![1.0f32, 2.0, 3.0, 4.0].into()]
}

fn config(mode: ExecutionMode) -> KernelConfig {
    KernelConfig::new().dimensions(vec![4]).mode(mode)
}

fn faulty(faults: FaultPlan) -> (Gpu, SoftwareDevice) {
    kernelfall_gpu::logging::init_test();
    let device = SoftwareDevice::new();
    device.set_faults(faults);
    (Gpu::builder().software(device.clone()).build(), device)
}

#[test]
fn test_compile_fault_is_fatal_in_gpu_mode() {
    let (gpu, _) = faulty(FaultPlan {
        compile: true,
        ..FaultPlan::default()
    });
    let err = gpu.compile(doubled(), &config(ExecutionMode::Gpu)).unwrap_err();
    assert!(matches!(err, KernelError::CompilationFailed(_)));
}

#[test]
fn test_compile_fault_falls_back_in_auto_mode() {
    let (gpu, device) = faulty(FaultPlan {
        compile: true,
        ..FaultPlan::default()
    });
    let kernel = gpu.compile(doubled(), &config(ExecutionMode::Auto)).unwrap();
    assert_eq!(kernel.backend(), Backend::Cpu);
    assert_eq!(kernel.run(&input()).unwrap().to_vec(), vec![2.0, 4.0, 6.0, 8.0]);
    assert_eq!(device.programs_built(), 0);
    assert_eq!(gpu.cache_stats().failures, 1);
}

#[test]
fn test_lost_context_during_run() {
    let (gpu, device) = faulty(FaultPlan::default());
    let auto = gpu.compile(doubled(), &config(ExecutionMode::Auto)).unwrap();
    let forced = gpu.compile(doubled(), &config(ExecutionMode::Gpu)).unwrap();
    assert_eq!(auto.backend(), Backend::Gpu);
    assert_eq!(device.programs_built(), 1);

    device.lose_context();
    assert_eq!(auto.run(&input()).unwrap().to_vec(), vec![2.0, 4.0, 6.0, 8.0]);
    assert_eq!(auto.backend(), Backend::Cpu);

    let err = forced.run(&input()).unwrap_err();
    assert!(matches!(err, KernelError::ExecutionFailed(_)));
    assert_eq!(forced.backend(), Backend::Gpu);

    device.restore_context();
    assert_eq!(forced.run(&input()).unwrap().to_vec(), vec![2.0, 4.0, 6.0, 8.0]);
    assert_eq!(auto.backend(), Backend::Cpu);

    // the restored context is tried again on the next call
    let dispatches = device.dispatch_count();
    assert_eq!(auto.run(&input()).unwrap().to_vec(), vec![2.0, 4.0, 6.0, 8.0]);
    assert_eq!(auto.backend(), Backend::Gpu);
    assert_eq!(device.dispatch_count(), dispatches + 1);
}

#[test]
fn test_readback_fault_falls_back() {
    let (gpu, device) = faulty(FaultPlan::default());
    let kernel = gpu.compile(doubled(), &config(ExecutionMode::Auto)).unwrap();
    device.set_faults(FaultPlan {
        readback: true,
        ..FaultPlan::default()
    });
    assert_eq!(kernel.run(&input()).unwrap().to_vec(), vec![2.0, 4.0, 6.0, 8.0]);
    assert_eq!(kernel.backend(), Backend::Cpu);
}

#[test]
fn test_bad_arguments_never_fall_back() {
    let (gpu, _) = faulty(FaultPlan::default());
    let kernel = gpu.compile(doubled(), &config(ExecutionMode::Auto)).unwrap();
    let err = kernel.run(&[Arg::Scalar(3.0)]).unwrap_err();
    assert!(matches!(err, KernelError::InvalidArgument(_)));
    assert_eq!(kernel.backend(), Backend::Gpu);
}

#[test]
fn test_native_function_runs_on_cpu() {
    let (gpu, device) = faulty(FaultPlan::default());
    gpu.add_function(
        "triple",
        FunctionBody::native(1, |args: &[f64]| args[0] * 3.0),
        None,
        None,
    )
    .unwrap();
    let body = KernelBody::build(|k| {
        let a = k.param("a");
        let x = k.thread_x();
        k.ret(Expr::call("triple", vec![a.at([x])]));
    });

    let err = gpu.compile(body.clone(), &config(ExecutionMode::Gpu)).unwrap_err();
    assert!(matches!(err, KernelError::CompilationFailed(_)));

    let kernel = gpu.compile(body, &config(ExecutionMode::Auto)).unwrap();
    assert_eq!(kernel.backend(), Backend::Cpu);
    assert_eq!(kernel.run(&input()).unwrap().to_vec(), vec![3.0, 6.0, 9.0, 12.0]);
    assert_eq!(device.programs_built(), 0);
}

#[test]
fn test_redefined_helper_moves_kernel_back_to_gpu() {
    let (gpu, device) = faulty(FaultPlan::default());
    gpu.add_function(
        "triple",
        FunctionBody::native(1, |args: &[f64]| args[0] * 3.0),
        None,
        None,
    )
    .unwrap();
    let body = KernelBody::build(|k| {
        let a = k.param("a");
        let x = k.thread_x();
        k.ret(Expr::call("triple", vec![a.at([x])]));
    });
    let kernel = gpu.compile(body, &config(ExecutionMode::Auto)).unwrap();
    assert_eq!(kernel.backend(), Backend::Cpu);
    assert_eq!(kernel.run(&input()).unwrap().to_vec(), vec![3.0, 6.0, 9.0, 12.0]);
    assert_eq!(device.programs_built(), 0);

    let triple = KernelBody::build(|k| {
        let v = k.param("v");
        k.ret(v * 3.0);
    });
    gpu.add_function("triple", triple, None, None).unwrap();
    assert_eq!(kernel.run(&input()).unwrap().to_vec(), vec![3.0, 6.0, 9.0, 12.0]);
    assert_eq!(kernel.backend(), Backend::Gpu);
    assert_eq!(device.programs_built(), 1);
}

#[test]
fn test_unchanged_failure_is_not_retried() {
    let (gpu, device) = faulty(FaultPlan {
        compile: true,
        ..FaultPlan::default()
    });
    let kernel = gpu.compile(doubled(), &config(ExecutionMode::Auto)).unwrap();
    device.set_faults(FaultPlan::default());
    for _ in 0..3 {
        assert_eq!(kernel.run(&input()).unwrap().to_vec(), vec![2.0, 4.0, 6.0, 8.0]);
    }
    assert_eq!(kernel.backend(), Backend::Cpu);
    assert_eq!(device.programs_built(), 0);
    assert_eq!(gpu.cache_stats().failures, 1);
}

#[test]
fn test_unknown_function_reports_on_cpu() {
    let (gpu, _) = faulty(FaultPlan::default());
    let body = KernelBody::build(|k| {
        let x = k.thread_x();
        k.ret(Expr::call("missing", vec![x]));
    });
    let kernel = gpu.compile(body, &config(ExecutionMode::Auto)).unwrap();
    assert_eq!(kernel.backend(), Backend::Cpu);
    let err = kernel.run(&[]).unwrap_err();
    assert!(matches!(err, KernelError::Interpreter(_)));
}

#[test]
fn test_forced_gpu_without_device() {
    let gpu = Gpu::cpu_only();
    let err = gpu.compile(doubled(), &config(ExecutionMode::Gpu)).unwrap_err();
    assert!(matches!(err, KernelError::CompilationFailed(_)));

    let kernel = gpu.compile(doubled(), &config(ExecutionMode::Auto)).unwrap();
    assert_eq!(kernel.backend(), Backend::Cpu);
}
