//! Bind, dispatch, and wait.

use crate::error::{KernelError, Result};

use super::buffer_ops::WgpuBuffer;
use super::compile::WgpuCompiledKernel;
use super::device_init::WgpuContext;

/// Dispatch a compiled compute kernel with explicit workgroup counts and
/// wait for it to finish.
pub fn dispatch_workgroups(
    ctx: &WgpuContext,
    kernel: &WgpuCompiledKernel,
    buffers: &[&WgpuBuffer],
    workgroups: [u32; 2],
) -> Result<()> {
    ctx.ensure_alive()?;
    let device = &ctx.device;
    super::scoped(device, || {
        let bind_group = bind_buffers(device, &kernel.bind_group_layout, buffers);
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("kernelfall_dispatch"),
        });

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("kernelfall_compute_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&kernel.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(workgroups[0], workgroups[1], 1);
        }

        ctx.queue.submit(std::iter::once(encoder.finish()));
    })
    .map_err(|e| KernelError::execution(e.to_string()))?;

    ctx.device.poll(wgpu::Maintain::Wait);
    ctx.ensure_alive()
}

fn bind_buffers(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    buffers: &[&WgpuBuffer],
) -> wgpu::BindGroup {
    let entries: Vec<wgpu::BindGroupEntry> = buffers
        .iter()
        .zip(0u32..)
        .map(|(buf, binding)| wgpu::BindGroupEntry {
            binding,
            resource: buf.buffer.as_entire_binding(),
        })
        .collect();
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("kernelfall_bindings"),
        layout,
        entries: &entries,
    })
}
