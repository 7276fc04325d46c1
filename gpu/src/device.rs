//! GPU executor: owns the device context and runs programs on it.
//!
//! All device work goes through one `Mutex<NativeContext>`, so a program's
//! upload, dispatch, and readback are never interleaved with another
//! kernel's on the same context.

use parking_lot::Mutex;

use crate::array::DType;
use crate::backend::{NativeBuffer, NativeContext};
use crate::buffer::{to_device_bytes, BufferCodec, EncodedBuffer, TextureSize};
use crate::codegen::{BindingRole, ShaderSource};
use crate::error::{KernelError, Result};
use crate::kernel_cache::{CompiledProgram, Signature};

pub struct GpuExecutor {
    context: Mutex<NativeContext>,
    codec: BufferCodec,
    backend: &'static str,
}

impl std::fmt::Debug for GpuExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuExecutor")
            .field("backend", &self.backend)
            .finish()
    }
}

impl GpuExecutor {
    pub fn new(context: NativeContext, codec: BufferCodec) -> Self {
        let backend = context.backend_name();
        log::info!("gpu executor using the {backend} backend");
        GpuExecutor {
            context: Mutex::new(context),
            codec,
            backend,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend
    }

    pub fn generation(&self) -> u64 {
        self.context.lock().generation()
    }

    pub fn codec(&self) -> &BufferCodec {
        &self.codec
    }

    /// Build `source` into a program for this device.
    pub fn compile(
        &self,
        signature: Signature,
        source: ShaderSource,
        functions: Vec<String>,
    ) -> Result<CompiledProgram> {
        let native = self.context.lock().compile(&source)?;
        log::debug!(
            "built {} program {signature:016x} ({} binding(s))",
            native.backend_name(),
            source.manifest.bindings().len()
        );
        Ok(CompiledProgram::new(
            signature,
            native,
            source.manifest,
            source.text,
            functions,
        ))
    }

    /// Upload `inputs` and `scalars`, dispatch, and read back the output.
    ///
    /// `inputs` are the encoded array arguments in manifest order; `scalars`
    /// the scalar arguments in manifest order.
    pub fn run(
        &self,
        program: &CompiledProgram,
        inputs: &[EncodedBuffer],
        scalars: &[f32],
        output_shape: Vec<usize>,
    ) -> Result<EncodedBuffer> {
        let manifest = program.manifest();
        if inputs.len() != manifest.array_params().len() {
            return Err(KernelError::execution(format!(
                "program takes {} array input(s), got {}",
                manifest.array_params().len(),
                inputs.len()
            )));
        }
        if scalars.len() != manifest.scalar_params().len() {
            return Err(KernelError::execution(format!(
                "program takes {} scalar(s), got {}",
                manifest.scalar_params().len(),
                scalars.len()
            )));
        }
        let output_texture = TextureSize::for_elements(manifest.output_len())?;
        let order = self.codec.endianness();

        let mut scalar_words = scalars.to_vec();
        if scalar_words.is_empty() {
            scalar_words.push(0.0);
        }
        let mut shape_words: Vec<u32> = Vec::with_capacity(inputs.len() * 3);
        for input in inputs {
            if input.bytes().len() != input.texture().byte_size() {
                return Err(KernelError::execution("encoded buffer does not match its texture"));
            }
            for d in input.dims3() {
                let d = u32::try_from(d)
                    .map_err(|_| KernelError::execution("array axis exceeds the device limit"))?;
                shape_words.push(d);
            }
        }
        if shape_words.is_empty() {
            shape_words.push(0);
        }

        let ctx = self.context.lock();
        let mut buffers: Vec<NativeBuffer> = Vec::with_capacity(manifest.bindings().len());
        let mut next_input = inputs.iter();
        for binding in manifest.bindings() {
            let buffer = match binding.role {
                BindingRole::Scalars => ctx.buffer_from_bytes(&to_device_bytes(&scalar_words, order))?,
                BindingRole::Shapes => ctx.buffer_from_bytes(&to_device_bytes(&shape_words, order))?,
                BindingRole::Input { .. } => {
                    let input = next_input
                        .next()
                        .ok_or_else(|| KernelError::execution("missing input buffer"))?;
                    ctx.buffer_from_bytes(input.bytes())?
                }
                BindingRole::Result => ctx.allocate_buffer(output_texture.byte_size())?,
            };
            buffers.push(buffer);
        }
        let bound: Vec<&NativeBuffer> = buffers.iter().collect();
        ctx.dispatch(program.native(), &bound, manifest.workgroups())?;

        let result = bound
            .last()
            .ok_or_else(|| KernelError::execution("program has no result binding"))?;
        let bytes = ctx.read_bytes(result, output_texture.byte_size())?;
        drop(ctx);

        log::trace!(
            "program {:016x} produced {} element(s)",
            program.signature(),
            manifest.output_len()
        );
        EncodedBuffer::from_device_bytes(bytes, output_shape, DType::F32)
    }
}
