//! Backend abstraction: thin enum dispatch layer over wgpu and the
//! host-emulated device.
//!
//! `NativeContext`, `NativeBuffer`, and `NativeProgram` wrap the
//! backend-specific types. Buffers and programs may only be used with the
//! context kind that created them.

#[cfg(feature = "webgpu-backend")]
use crate::wgpu_backend::{
    buffer_ops::WgpuBuffer, compile::WgpuCompiledKernel, device_init::WgpuContext,
};

use crate::codegen::ShaderSource;
use crate::error::{KernelError, Result};
use crate::platform::Endianness;
use crate::software::{SoftwareBuffer, SoftwareDevice, SoftwareProgram};

pub enum NativeContext {
    #[cfg(feature = "webgpu-backend")]
    Wgpu(WgpuContext),
    Software(SoftwareDevice),
}

impl NativeContext {
    /// Open a hardware device, or `None` when no adapter is usable.
    pub fn new() -> Option<Self> {
        #[cfg(feature = "webgpu-backend")]
        return WgpuContext::new().map(NativeContext::Wgpu);
        #[cfg(not(feature = "webgpu-backend"))]
        None
    }

    /// Probe for an adapter without opening a device.
    pub fn is_available() -> bool {
        #[cfg(feature = "webgpu-backend")]
        return WgpuContext::is_available();
        #[cfg(not(feature = "webgpu-backend"))]
        false
    }

    pub fn software(device: SoftwareDevice) -> Self {
        NativeContext::Software(device)
    }

    /// Changes when a lost context is restored. A lost wgpu device never
    /// comes back, so its generation is fixed.
    pub fn generation(&self) -> u64 {
        match self {
            #[cfg(feature = "webgpu-backend")]
            NativeContext::Wgpu(_) => 0,
            NativeContext::Software(device) => device.generation(),
        }
    }

    /// Tell the device which byte order the host codec writes. Hardware
    /// reads little-endian words only, so it accepts the real host order alone.
    pub fn attach_host(&self, order: Endianness) -> Result<()> {
        match self {
            #[cfg(feature = "webgpu-backend")]
            NativeContext::Wgpu(_) if order != Endianness::system() => Err(KernelError::config(
                format!("wgpu devices need the host byte order, not {order:?}"),
            )),
            #[cfg(feature = "webgpu-backend")]
            NativeContext::Wgpu(_) => Ok(()),
            NativeContext::Software(device) => {
                device.attach_host(order);
                Ok(())
            }
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            #[cfg(feature = "webgpu-backend")]
            NativeContext::Wgpu(_) => "wgpu",
            NativeContext::Software(_) => "software",
        }
    }

    /// Build a program from synthesized shader source.
    pub fn compile(&self, source: &ShaderSource) -> Result<NativeProgram> {
        match self {
            #[cfg(feature = "webgpu-backend")]
            NativeContext::Wgpu(ctx) => {
                crate::wgpu_backend::compile::compile_wgsl(ctx, &source.text, &source.entry_point)
                    .map(NativeProgram::Wgpu)
            }
            NativeContext::Software(device) => device.compile(source).map(NativeProgram::Software),
        }
    }

    /// Allocate a zeroed buffer of the given byte size.
    pub fn allocate_buffer(&self, byte_size: usize) -> Result<NativeBuffer> {
        match self {
            #[cfg(feature = "webgpu-backend")]
            NativeContext::Wgpu(ctx) => WgpuBuffer::allocate(ctx, byte_size).map(NativeBuffer::Wgpu),
            NativeContext::Software(device) => {
                device.allocate(byte_size).map(NativeBuffer::Software)
            }
        }
    }

    /// Create a buffer holding a copy of `bytes`.
    pub fn buffer_from_bytes(&self, bytes: &[u8]) -> Result<NativeBuffer> {
        match self {
            #[cfg(feature = "webgpu-backend")]
            NativeContext::Wgpu(ctx) => WgpuBuffer::from_bytes(ctx, bytes).map(NativeBuffer::Wgpu),
            NativeContext::Software(device) => {
                device.buffer_from_bytes(bytes).map(NativeBuffer::Software)
            }
        }
    }

    /// Run `program` with `buffers` bound in manifest order and wait for it.
    pub fn dispatch(
        &self,
        program: &NativeProgram,
        buffers: &[&NativeBuffer],
        workgroups: [u32; 2],
    ) -> Result<()> {
        match (self, program) {
            #[cfg(feature = "webgpu-backend")]
            (NativeContext::Wgpu(ctx), NativeProgram::Wgpu(kernel)) => {
                let bufs = buffers
                    .iter()
                    .map(|b| match b {
                        NativeBuffer::Wgpu(buf) => Ok(buf),
                        _ => Err(mismatch()),
                    })
                    .collect::<Result<Vec<_>>>()?;
                crate::wgpu_backend::dispatch::dispatch_workgroups(ctx, kernel, &bufs, workgroups)
            }
            (NativeContext::Software(device), NativeProgram::Software(program)) => {
                let bufs = buffers
                    .iter()
                    .map(|b| match b {
                        NativeBuffer::Software(buf) => Ok(buf),
                        #[allow(unreachable_patterns)]
                        _ => Err(mismatch()),
                    })
                    .collect::<Result<Vec<_>>>()?;
                device.dispatch(program, &bufs, workgroups)
            }
            #[allow(unreachable_patterns)]
            _ => Err(mismatch()),
        }
    }

    /// Read the first `byte_size` bytes of a buffer back to the host.
    pub fn read_bytes(&self, buffer: &NativeBuffer, byte_size: usize) -> Result<Vec<u8>> {
        match (self, buffer) {
            #[cfg(feature = "webgpu-backend")]
            (NativeContext::Wgpu(ctx), NativeBuffer::Wgpu(buf)) => buf.read_to_vec(ctx, byte_size),
            (NativeContext::Software(device), NativeBuffer::Software(buf)) => {
                device.read(buf, byte_size)
            }
            #[allow(unreachable_patterns)]
            _ => Err(mismatch()),
        }
    }
}

fn mismatch() -> KernelError {
    KernelError::execution("resource belongs to a different backend")
}

pub enum NativeBuffer {
    #[cfg(feature = "webgpu-backend")]
    Wgpu(WgpuBuffer),
    Software(SoftwareBuffer),
}

impl NativeBuffer {
    pub fn byte_size(&self) -> usize {
        match self {
            #[cfg(feature = "webgpu-backend")]
            NativeBuffer::Wgpu(buf) => buf.byte_size(),
            NativeBuffer::Software(buf) => buf.byte_size(),
        }
    }
}

pub enum NativeProgram {
    #[cfg(feature = "webgpu-backend")]
    Wgpu(WgpuCompiledKernel),
    Software(SoftwareProgram),
}

impl NativeProgram {
    pub fn backend_name(&self) -> &'static str {
        match self {
            #[cfg(feature = "webgpu-backend")]
            NativeProgram::Wgpu(_) => "wgpu",
            NativeProgram::Software(_) => "software",
        }
    }
}
