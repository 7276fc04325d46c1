//! Kernel dispatcher: the public entry point.
//!
//! [`Gpu::compile`] validates a body, resolves its configuration and, unless
//! the CPU was requested, builds the GPU program eagerly. [`Kernel::run`]
//! executes on whichever backend the kernel currently uses. In `Auto` mode a
//! GPU compile or execution failure switches the kernel to the CPU executor
//! until its signature changes (a helper it calls is redefined), at which
//! point the GPU is tried again; in `Gpu` mode the failure is returned.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::array::{Arg, ArrayData, NdArray};
use crate::backend::NativeContext;
use crate::buffer::{BufferCodec, EncodedBuffer};
use crate::codegen::wgsl::WgslSynthesizer;
use crate::codegen::{ShaderSynthesizer, SynthesisRequest};
use crate::config::{Dimensions, ExecutionMode, KernelConfig};
use crate::device::GpuExecutor;
use crate::error::{KernelError, Result};
use crate::functions::{FunctionBody, FunctionDefinition, FunctionRegistry, Registration};
use crate::interpreter::CpuExecutor;
use crate::kernel_cache::{self, CacheStats, CompiledProgram, ProgramCache, Signature};
use crate::kernel_ir::{KernelBody, ValueType};
use crate::platform::Endianness;
use crate::software::SoftwareDevice;

/// Where a kernel currently runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Gpu,
    Cpu,
}

/// Result of one kernel call.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelOutput {
    /// The output had exactly one element.
    Scalar(f32),
    Array(NdArray),
}

impl KernelOutput {
    fn from_array(array: NdArray) -> Self {
        if array.numel() == 1 {
            if let Some(v) = array.data().get_f64(0) {
                return KernelOutput::Scalar(v as f32);
            }
        }
        KernelOutput::Array(array)
    }

    pub fn as_scalar(&self) -> Option<f32> {
        match self {
            KernelOutput::Scalar(v) => Some(*v),
            KernelOutput::Array(_) => None,
        }
    }

    pub fn as_array(&self) -> Option<&NdArray> {
        match self {
            KernelOutput::Array(a) => Some(a),
            KernelOutput::Scalar(_) => None,
        }
    }

    pub fn into_array(self) -> Option<NdArray> {
        match self {
            KernelOutput::Array(a) => Some(a),
            KernelOutput::Scalar(_) => None,
        }
    }

    /// All output values, row-major.
    pub fn to_vec(&self) -> Vec<f32> {
        match self {
            KernelOutput::Scalar(v) => vec![*v],
            KernelOutput::Array(a) => a.to_f32_vec(),
        }
    }
}

/// Backend choice plus, after a fallback, the signature and device
/// generation the GPU failed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Gpu,
    /// `Cpu` mode, or no device attached.
    Pinned,
    Fallback { failed: Signature, generation: u64 },
}

#[derive(Clone)]
struct GpuPath {
    executor: Arc<GpuExecutor>,
    synthesizer: Arc<dyn ShaderSynthesizer>,
}

/// Builder for [`Gpu`].
#[derive(Default)]
pub struct GpuBuilder {
    context: Option<NativeContext>,
    cpu_only: bool,
    registry: Option<Arc<FunctionRegistry>>,
    synthesizer: Option<Arc<dyn ShaderSynthesizer>>,
    cache_capacity: Option<usize>,
    endianness: Option<Endianness>,
}

impl GpuBuilder {
    /// Use `context` instead of probing for a device.
    pub fn context(mut self, context: NativeContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Use the host-emulated device.
    pub fn software(self, device: SoftwareDevice) -> Self {
        self.context(NativeContext::software(device))
    }

    /// Never touch a device; every kernel runs on the CPU executor.
    pub fn cpu_only(mut self) -> Self {
        self.cpu_only = true;
        self
    }

    pub fn registry(mut self, registry: Arc<FunctionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Refuse function redefinitions that change a signature.
    pub fn strict_functions(self) -> Self {
        self.registry(Arc::new(FunctionRegistry::strict()))
    }

    pub fn synthesizer(mut self, synthesizer: Arc<dyn ShaderSynthesizer>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = Some(capacity);
        self
    }

    pub fn endianness(mut self, endianness: Endianness) -> Self {
        self.endianness = Some(endianness);
        self
    }

    pub fn build(self) -> Gpu {
        let codec = BufferCodec::new(self.endianness.unwrap_or_else(Endianness::system));
        let context = if self.cpu_only {
            None
        } else {
            self.context.or_else(|| {
                let probed = NativeContext::new();
                if probed.is_none() {
                    log::info!("no GPU adapter found; kernels will run on the CPU executor");
                }
                probed
            })
        };
        let context = context.and_then(|ctx| match ctx.attach_host(codec.endianness()) {
            Ok(()) => Some(ctx),
            Err(err) => {
                log::warn!("{err}; kernels will run on the CPU executor");
                None
            }
        });
        let gpu = context.map(|ctx| GpuPath {
            executor: Arc::new(GpuExecutor::new(ctx, codec)),
            synthesizer: self
                .synthesizer
                .unwrap_or_else(|| Arc::new(WgslSynthesizer)),
        });
        let cache = match self.cache_capacity {
            Some(capacity) => ProgramCache::with_capacity(capacity),
            None => ProgramCache::new(),
        };
        Gpu {
            registry: self
                .registry
                .unwrap_or_else(|| Arc::new(FunctionRegistry::new())),
            cache: Arc::new(cache),
            gpu,
            codec,
        }
    }
}

/// Compiles kernels and owns the state they share: the function registry,
/// the program cache, and the GPU executor.
pub struct Gpu {
    registry: Arc<FunctionRegistry>,
    cache: Arc<ProgramCache>,
    gpu: Option<GpuPath>,
    codec: BufferCodec,
}

impl Default for Gpu {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Gpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gpu")
            .field("backend", &self.backend_name())
            .field("cache", &self.cache.stats())
            .finish()
    }
}

impl Gpu {
    /// Probe for the best available device.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> GpuBuilder {
        GpuBuilder::default()
    }

    pub fn with_context(context: NativeContext) -> Self {
        Self::builder().context(context).build()
    }

    pub fn cpu_only() -> Self {
        Self::builder().cpu_only().build()
    }

    /// `"wgpu"`, `"software"`, or `"cpu"` when no device is attached.
    pub fn backend_name(&self) -> &'static str {
        self.gpu
            .as_ref()
            .map_or("cpu", |g| g.executor.backend_name())
    }

    pub fn has_device(&self) -> bool {
        self.gpu.is_some()
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn codec(&self) -> &BufferCodec {
        &self.codec
    }

    /// Register a helper function; replacing an existing one drops every
    /// cached program built with it.
    pub fn add_function(
        &self,
        name: &str,
        body: impl Into<FunctionBody>,
        param_types: Option<Vec<ValueType>>,
        return_type: Option<ValueType>,
    ) -> Result<&Self> {
        let outcome = self
            .registry
            .add_function(name, body, param_types, return_type)?;
        self.after_registration(name, outcome);
        Ok(self)
    }

    pub fn register(&self, def: FunctionDefinition) -> Result<&Self> {
        let name = def.name().to_string();
        let outcome = self.registry.register(def)?;
        self.after_registration(&name, outcome);
        Ok(self)
    }

    fn after_registration(&self, name: &str, outcome: Registration) {
        if outcome == Registration::Replaced {
            self.cache.invalidate_function(name);
        }
    }

    /// Build a callable kernel from `body`.
    pub fn compile(&self, body: KernelBody, config: &KernelConfig) -> Result<Kernel> {
        let dimensions = config.resolved_dimensions()?;
        let types = body.inferred_types();
        body.validate(&types)?;

        let kernel = Kernel {
            body_hash: body.structural_hash(),
            calls: body.calls(),
            body: Arc::new(body),
            types,
            dimensions,
            mode: config.mode,
            registry: Arc::clone(&self.registry),
            cache: Arc::clone(&self.cache),
            gpu: self.gpu.clone(),
            codec: self.codec,
            route: RwLock::new(Route::Pinned),
        };

        if config.mode == ExecutionMode::Cpu {
            log::debug!("kernel {:016x} pinned to the CPU executor", kernel.body_hash);
            return Ok(kernel);
        }
        let signature = kernel.signature();
        match kernel.program() {
            Ok(program) => {
                log::debug!(
                    "kernel {:016x} compiled as program {:016x}",
                    kernel.body_hash,
                    program.signature()
                );
                *kernel.route.write() = Route::Gpu;
            }
            Err(err) if config.mode.allows_fallback() && err.is_fallback_eligible() => {
                log::warn!(
                    "kernel {:016x}: GPU compilation failed ({err}); using the CPU executor",
                    kernel.body_hash
                );
                if let Some(generation) = kernel.device_generation() {
                    *kernel.route.write() = Route::Fallback {
                        failed: signature,
                        generation,
                    };
                }
            }
            Err(err) => return Err(err),
        }
        Ok(kernel)
    }

    /// Copy a device-layout buffer back into a host array of its recorded
    /// shape and element type, through an identity kernel.
    pub fn texture_to_array(&self, buffer: &EncodedBuffer) -> Result<NdArray> {
        let shape = buffer.shape().to_vec();
        let source = self.codec.decode(buffer, &shape)?;
        let dims = shape
            .iter()
            .rev()
            .map(|&d| {
                u32::try_from(d).map_err(|_| KernelError::invalid("array axis exceeds u32"))
            })
            .collect::<Result<Vec<u32>>>()?;
        let rank = shape.len();
        let copy = KernelBody::build(|k| {
            let texture = k.array("texture");
            let axes = [k.thread_z(), k.thread_y(), k.thread_x()];
            k.ret(texture.at(axes[3 - rank..].to_vec()));
        });
        let kernel = self.compile(copy, &KernelConfig::new().dimensions(dims))?;
        let words = kernel.run(&[Arg::Array(source)])?.to_vec();
        NdArray::new(shape, ArrayData::from_f32_words(buffer.dtype(), &words))
    }
}

/// A compiled kernel, callable with positional arguments.
pub struct Kernel {
    body: Arc<KernelBody>,
    body_hash: u64,
    calls: BTreeSet<String>,
    types: Vec<ValueType>,
    dimensions: Dimensions,
    mode: ExecutionMode,
    registry: Arc<FunctionRegistry>,
    cache: Arc<ProgramCache>,
    gpu: Option<GpuPath>,
    codec: BufferCodec,
    route: RwLock<Route>,
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("id", &format_args!("{:016x}", self.body_hash))
            .field("params", &self.types)
            .field("dimensions", &self.dimensions.axes())
            .field("mode", &self.mode)
            .field("backend", &self.backend())
            .finish()
    }
}

impl Kernel {
    pub fn backend(&self) -> Backend {
        match *self.route.read() {
            Route::Gpu => Backend::Gpu,
            Route::Pinned | Route::Fallback { .. } => Backend::Cpu,
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn dimensions(&self) -> &Dimensions {
        &self.dimensions
    }

    pub fn param_types(&self) -> &[ValueType] {
        &self.types
    }

    /// Structural identity of the body.
    pub fn id(&self) -> u64 {
        self.body_hash
    }

    /// Cache signature under the current function definitions.
    pub fn signature(&self) -> Signature {
        let functions = self.registry.snapshot(&self.calls);
        kernel_cache::signature(self.body_hash, &self.types, &self.dimensions, &functions)
    }

    /// WGSL text of the current program. Fails when the kernel has no GPU
    /// program to show.
    pub fn shader_source(&self) -> Result<String> {
        if self.mode == ExecutionMode::Cpu {
            return Err(KernelError::invalid("kernel is pinned to the CPU executor"));
        }
        self.program().map(|p| p.source().to_string())
    }

    /// Run the kernel. Arguments are matched positionally to parameters.
    pub fn run(&self, args: &[Arg]) -> Result<KernelOutput> {
        self.check_args(args)?;
        let route = *self.route.read();
        let signature = match route {
            Route::Pinned => return self.run_cpu(args),
            Route::Gpu => self.signature(),
            Route::Fallback { failed, generation } => {
                let signature = self.signature();
                if signature == failed && self.device_generation() == Some(generation) {
                    return self.run_cpu(args);
                }
                log::debug!(
                    "kernel {:016x}: signature or device changed since the GPU failed; retrying",
                    self.body_hash
                );
                signature
            }
        };
        match self.run_gpu(args) {
            Ok(out) => {
                if route != Route::Gpu {
                    log::info!("kernel {:016x} is back on the GPU", self.body_hash);
                    *self.route.write() = Route::Gpu;
                }
                Ok(out)
            }
            Err(err) if self.mode.allows_fallback() && err.is_fallback_eligible() => {
                log::warn!(
                    "kernel {:016x}: GPU execution failed ({err}); falling back to the CPU executor",
                    self.body_hash
                );
                if let Some(generation) = self.device_generation() {
                    *self.route.write() = Route::Fallback {
                        failed: signature,
                        generation,
                    };
                }
                self.run_cpu(args)
            }
            Err(err) => Err(err),
        }
    }

    fn device_generation(&self) -> Option<u64> {
        self.gpu.as_ref().map(|path| path.executor.generation())
    }

    fn check_args(&self, args: &[Arg]) -> Result<()> {
        if args.len() != self.types.len() {
            return Err(KernelError::invalid(format!(
                "kernel takes {} argument(s), {} given",
                self.types.len(),
                args.len()
            )));
        }
        for (i, (ty, arg)) in self.types.iter().zip(args).enumerate() {
            match (ty, arg) {
                (ValueType::FloatArray, Arg::Array(a)) if a.numel() == 0 => {
                    return Err(KernelError::invalid(format!("argument {i} is an empty array")));
                }
                (ValueType::FloatArray, Arg::Array(_)) => {}
                (ValueType::Float | ValueType::Int, Arg::Scalar(_)) => {}
                (ty, arg) => {
                    return Err(KernelError::invalid(format!(
                        "argument {i} is {} but the parameter is {}",
                        arg.kind(),
                        ty.name()
                    )));
                }
            }
        }
        Ok(())
    }

    /// The program for the current signature, compiling on a cache miss.
    fn program(&self) -> Result<Arc<CompiledProgram>> {
        let path = self
            .gpu
            .as_ref()
            .ok_or_else(|| KernelError::compilation("no GPU context available"))?;
        let functions = self.registry.snapshot(&self.calls);
        let signature =
            kernel_cache::signature(self.body_hash, &self.types, &self.dimensions, &functions);
        self.cache.get_or_compile(signature, || {
            let source = path.synthesizer.synthesize(&SynthesisRequest {
                body: &self.body,
                param_types: &self.types,
                dimensions: &self.dimensions,
                functions: &functions,
            })?;
            path.executor.compile(signature, source, functions.names())
        })
    }

    fn run_gpu(&self, args: &[Arg]) -> Result<KernelOutput> {
        let path = self
            .gpu
            .as_ref()
            .ok_or_else(|| KernelError::execution("no GPU context available"))?;
        let program = self.program()?;
        let manifest = program.manifest();

        let mut inputs = Vec::with_capacity(manifest.array_params().len());
        for &param in manifest.array_params() {
            match &args[param] {
                Arg::Array(array) => inputs.push(self.codec.encode(array)?),
                Arg::Scalar(_) => {
                    return Err(KernelError::invalid(format!("argument {param} must be an array")))
                }
            }
        }
        let scalars: Vec<f32> = manifest
            .scalar_params()
            .iter()
            .map(|&param| match &args[param] {
                Arg::Scalar(v) => *v as f32,
                Arg::Array(_) => 0.0,
            })
            .collect();

        let shape = self.dimensions.output_shape();
        let encoded = path
            .executor
            .run(&program, &inputs, &scalars, shape.clone())?;
        let array = self.codec.decode(&encoded, &shape)?;
        Ok(KernelOutput::from_array(array))
    }

    fn run_cpu(&self, args: &[Arg]) -> Result<KernelOutput> {
        let functions = self.registry.snapshot(&self.calls);
        let array = CpuExecutor::new(&self.body, &self.types, &functions).run(&self.dimensions, args)?;
        Ok(KernelOutput::from_array(array))
    }
}
