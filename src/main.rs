//! Kernelfall - GPU kernels with transparent CPU fallback
//!
//! # Usage
//!
//! ```bash
//! # Run a demo kernel on the best available backend
//! kernelfall run scale
//!
//! # Force a backend and a thread grid
//! kernelfall run matmul --mode cpu --dimensions 32,32
//!
//! # Read options from a TOML file and print the generated shader
//! kernelfall run polyfill --config kernel.toml --show-shader
//!
//! # Show backend and cache information
//! kernelfall info
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use kernelfall_gpu::{
    logging, Arg, BodyBuilder, ExecutionMode, Expr, Gpu, KernelBody, KernelConfig, KernelOutput,
    NdArray, SoftwareDevice,
};
use std::path::PathBuf;
use std::process;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "kernelfall")]
#[command(version = "0.1.0")]
#[command(about = "Kernelfall - GPU compute kernels with CPU fallback", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and run a demo kernel
    Run {
        /// Which kernel to run
        #[arg(value_enum)]
        demo: Demo,

        /// Execution mode: auto, gpu or cpu
        #[arg(short, long)]
        mode: Option<ExecutionMode>,

        /// Thread grid, comma separated x,y,z
        #[arg(short, long, value_delimiter = ',')]
        dimensions: Option<Vec<u32>>,

        /// TOML file with `dimensions` and `mode`
        #[arg(long)]
        config: Option<PathBuf>,

        /// Use the host-emulated device instead of probing for an adapter
        #[arg(long)]
        software: bool,

        /// Print the generated WGSL
        #[arg(long)]
        show_shader: bool,

        /// Enable verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show available backends
    Info,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Demo {
    /// Multiply every element by a scalar
    Scale,
    /// Element-wise sum of two arrays
    Add,
    /// Square matrix product
    Matmul,
    /// Helper functions and built-in polyfills
    Polyfill,
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { demo, mode, dimensions, config, software, show_shader, verbose } => {
            if verbose {
                logging::init_with_level(log::LevelFilter::Debug);
            } else {
                logging::init_from_env();
            }
            run_demo(demo, mode, dimensions, config, software, show_shader)
        }
        Commands::Info => {
            show_info();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn load_config(
    path: Option<PathBuf>,
    mode: Option<ExecutionMode>,
    dimensions: Option<Vec<u32>>,
) -> Result<KernelConfig, String> {
    let mut config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
            KernelConfig::from_toml_str(&text).map_err(|e| e.to_string())?
        }
        None => KernelConfig::new(),
    };
    if let Some(mode) = mode {
        config = config.mode(mode);
    }
    if let Some(dims) = dimensions {
        config = config.dimensions(dims);
    }
    Ok(config)
}

/// Kernel body plus arguments sized for `dims` (`[x, y, z]`).
fn demo_kernel(gpu: &Gpu, demo: Demo, dims: &[u32]) -> Result<(KernelBody, Vec<Arg>), String> {
    let x_len = dims.first().copied().unwrap_or(1) as usize;
    let shape: Vec<usize> = dims.iter().rev().map(|&d| d as usize).collect();
    let numel: usize = shape.iter().product();
    let ramp = |scale: f32| {
        NdArray::new(
            shape.clone(),
            (0..numel).map(|i| i as f32 * scale).collect::<Vec<f32>>().into(),
        )
        .map_err(|e| e.to_string())
    };
    let thread_index = |k: &mut BodyBuilder| {
        let axes = [k.thread_z(), k.thread_y(), k.thread_x()];
        axes[3 - dims.len()..].to_vec()
    };

    match demo {
        Demo::Scale => {
            let body = KernelBody::build(|k| {
                let a = k.array("a");
                let s = k.float("s");
                let idx = thread_index(k);
                k.ret(a.at(idx) * s);
            });
            Ok((body, vec![ramp(1.0)?.into(), Arg::Scalar(2.0)]))
        }
        Demo::Add => {
            let body = KernelBody::build(|k| {
                let a = k.array("a");
                let b = k.array("b");
                let idx = thread_index(k);
                k.ret(a.at(idx.clone()) + b.at(idx));
            });
            Ok((body, vec![ramp(1.0)?.into(), ramp(0.5)?.into()]))
        }
        Demo::Matmul => {
            if dims.len() != 2 || dims[0] != dims[1] {
                return Err("matmul needs square 2-D dimensions, e.g. --dimensions 16,16".into());
            }
            let body = KernelBody::build(|k| {
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
            });
            Ok((
                body,
                vec![ramp(0.01)?.into(), ramp(0.02)?.into(), (x_len as f64).into()],
            ))
        }
        Demo::Polyfill => {
            let smooth = KernelBody::build(|k| {
                let v = k.float("v");
                k.ret(Expr::call("clamp01", vec![v.value() * v.value() * (3.0 - 2.0 * v)]));
            });
            gpu.add_function("smoothstep01", smooth, None, None)
                .map_err(|e| e.to_string())?;
            let body = KernelBody::build(|k| {
                let a = k.array("a");
                let idx = thread_index(k);
                let t = k.var(a.at(idx) / numel as f64);
                k.ret(Expr::call("smoothstep01", vec![t.get()]) + Expr::call("log10", vec![t + 1.0]));
            });
            Ok((body, vec![ramp(1.0)?.into()]))
        }
    }
}

fn run_demo(
    demo: Demo,
    mode: Option<ExecutionMode>,
    dimensions: Option<Vec<u32>>,
    config: Option<PathBuf>,
    software: bool,
    show_shader: bool,
) -> Result<(), String> {
    let config = load_config(config, mode, dimensions)?;
    let dims = config.resolved_dimensions().map_err(|e| e.to_string())?;
    let gpu = if software {
        Gpu::builder().software(SoftwareDevice::new()).build()
    } else {
        Gpu::new()
    };
    println!("Running {:?} on {} [{}]...", demo, gpu.backend_name(), config.mode);

    let (body, args) = demo_kernel(&gpu, demo, dims.axes())?;

    let start = Instant::now();
    let kernel = gpu.compile(body, &config).map_err(|e| e.to_string())?;
    let compile_time = start.elapsed();

    if show_shader {
        match kernel.shader_source() {
            Ok(source) => println!("\n{}\n", source),
            Err(e) => println!("(no shader: {})", e),
        }
    }

    let start = Instant::now();
    let output = kernel.run(&args).map_err(|e| e.to_string())?;
    let run_time = start.elapsed();

    match &output {
        KernelOutput::Scalar(v) => println!("Result: {}", v),
        KernelOutput::Array(array) => {
            let values = array.to_f32_vec();
            let preview: Vec<String> = values.iter().take(8).map(|v| format!("{:.4}", v)).collect();
            println!(
                "Result: shape {:?} [{}{}]",
                array.shape(),
                preview.join(", "),
                if values.len() > 8 { ", ..." } else { "" }
            );
        }
    }

    let stats = gpu.cache_stats();
    println!("Backend:  {:?}", kernel.backend());
    println!("Compile:  {:.2?}", compile_time);
    println!("Run:      {:.2?}", run_time);
    println!("Programs: {} compiled, {} cache hit(s)", stats.compiles, stats.hits);
    Ok(())
}

fn show_info() {
    println!("Kernelfall v0.1.0");
    println!("Data-parallel kernels compiled to WGSL with CPU fallback\n");

    println!("Backends:");
    #[cfg(feature = "webgpu-backend")]
    {
        if kernelfall_gpu::NativeContext::is_available() {
            println!("  ✓ wgpu (adapter found)");
        } else {
            println!("  ✗ wgpu (no adapter)");
        }
    }
    #[cfg(not(feature = "webgpu-backend"))]
    println!("  ✗ wgpu (not enabled, build with --features webgpu-backend)");
    println!("  ✓ software device (--software)");
    println!("  ✓ CPU executor");

    println!("\nExamples:");
    println!("  kernelfall run scale --dimensions 8");
    println!("  kernelfall run matmul --dimensions 16,16 --mode gpu --software");
}
