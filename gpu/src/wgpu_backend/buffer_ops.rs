//! Storage buffers: upload, allocation and staged readback.

use wgpu::util::DeviceExt;

use crate::error::{KernelError, Result};

use super::device_init::WgpuContext;

const STORAGE: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
    .union(wgpu::BufferUsages::COPY_SRC)
    .union(wgpu::BufferUsages::COPY_DST);

pub struct WgpuBuffer {
    pub(crate) buffer: wgpu::Buffer,
    byte_size: usize,
}

impl WgpuBuffer {
    pub fn from_bytes(ctx: &WgpuContext, bytes: &[u8]) -> Result<Self> {
        ctx.ensure_alive()?;
        if bytes.is_empty() {
            return Err(KernelError::execution("cannot upload an empty buffer"));
        }
        let buffer = super::scoped(&ctx.device, || {
            ctx.device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("kernelfall_input"),
                    contents: bytes,
                    usage: STORAGE,
                })
        })
        .map_err(|e| KernelError::execution(format!("upload of {} byte(s) failed: {e}", bytes.len())))?;
        log::trace!("uploaded {} byte(s)", bytes.len());
        Ok(WgpuBuffer {
            buffer,
            byte_size: bytes.len(),
        })
    }

    /// Zero-initialised storage buffer.
    pub fn allocate(ctx: &WgpuContext, byte_size: usize) -> Result<Self> {
        ctx.ensure_alive()?;
        if byte_size == 0 {
            return Err(KernelError::execution("cannot allocate an empty buffer"));
        }
        let buffer = super::scoped(&ctx.device, || {
            ctx.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("kernelfall_result"),
                size: byte_size as u64,
                usage: STORAGE,
                mapped_at_creation: false,
            })
        })
        .map_err(|e| KernelError::execution(format!("allocation of {byte_size} byte(s) failed: {e}")))?;
        Ok(WgpuBuffer { buffer, byte_size })
    }

    /// Copy the first `byte_size` bytes into a mappable buffer and read them.
    pub fn read_to_vec(&self, ctx: &WgpuContext, byte_size: usize) -> Result<Vec<u8>> {
        ctx.ensure_alive()?;
        let len = byte_size.min(self.byte_size) as u64;
        let staging = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("kernelfall_staging"),
            size: len,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("kernelfall_readback"),
            });
        encoder.copy_buffer_to_buffer(&self.buffer, 0, &staging, 0, len);
        ctx.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |mapped| {
            let _ = tx.send(mapped);
        });
        ctx.device.poll(wgpu::Maintain::Wait);

        let mapped = rx
            .recv()
            .map_err(|_| KernelError::execution("readback was never signalled"))?;
        mapped.map_err(|e| KernelError::execution(format!("readback failed: {e}")))?;
        let bytes = slice.get_mapped_range().to_vec();
        staging.unmap();
        ctx.ensure_alive()?;
        Ok(bytes)
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }
}
