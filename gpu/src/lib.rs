//! Kernelfall GPU compute.
//!
//! Compiles data-parallel kernels written against the [`kernel_ir`] builder
//! into WGSL compute shaders and runs them on a GPU, falling back to a CPU
//! interpreter when no device is available or the device path fails.
//!
//! ```no_run
//! use kernelfall_gpu::{Gpu, KernelBody, KernelConfig};
//!
//! let gpu = Gpu::new();
//! let body = KernelBody::build(|k| {
//!     let a = k.param("a");
//!     let x = k.thread_x();
//!     k.ret(a.at([x]) * 2.0);
//! });
//! let kernel = gpu.compile(body, &KernelConfig::new().dimensions(vec![4])).unwrap();
//! let out = kernel.run(&[vec![1.0f32, 2.0, 3.0, 4.0].into()]).unwrap();
//! assert_eq!(out.to_vec(), vec![2.0, 4.0, 6.0, 8.0]);
//! ```
//!
//! # Backends
//!
//! - `wgpu` (feature `webgpu-backend`): Vulkan, Metal, DX12 through wgpu.
//! - `software`: host-emulated device that honours the same binding ABI;
//!   used by tests and machines without an adapter.
//! - CPU executor: tree-walking interpreter over the same kernel body.

pub mod array;
pub mod backend;
pub mod buffer;
pub mod codegen;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod functions;
pub mod interpreter;
pub mod kernel_cache;
pub mod kernel_ir;
pub mod logging;
pub mod platform;
pub mod software;

#[cfg(feature = "webgpu-backend")]
pub mod wgpu_backend;

pub use array::{Arg, ArrayData, DType, NdArray};
pub use backend::NativeContext;
pub use buffer::{BufferCodec, EncodedBuffer, TextureSize};
pub use config::{Dimensions, ExecutionMode, KernelConfig};
pub use dispatcher::{Backend, Gpu, GpuBuilder, Kernel, KernelOutput};
pub use error::{KernelError, Result};
pub use functions::{FunctionBody, FunctionDefinition, FunctionRegistry, Registration};
pub use interpreter::{CpuExecutor, InterpreterError};
pub use kernel_cache::CacheStats;
pub use kernel_ir::{Axis, BodyBuilder, Expr, KernelBody, ValueType};
pub use platform::Endianness;
pub use software::{FaultPlan, SoftwareDevice};
