//! WGSL shader compilation: WGSL source to wgpu::ComputePipeline

use crate::error::{KernelError, Result};

use super::device_init::WgpuContext;

/// A compiled wgpu compute kernel ready for dispatch.
pub struct WgpuCompiledKernel {
    pub pipeline: wgpu::ComputePipeline,
    pub bind_group_layout: wgpu::BindGroupLayout,
}

/// Compile WGSL source code into a compute pipeline.
///
/// The bind group layout is auto-derived from the shader, so every binding
/// the shader declares must be statically used by the entry point.
pub fn compile_wgsl(ctx: &WgpuContext, source: &str, entry_point: &str) -> Result<WgpuCompiledKernel> {
    if ctx.is_lost() {
        return Err(KernelError::compilation(format!(
            "wgpu device '{}' is lost",
            ctx.adapter_name
        )));
    }
    let device = &ctx.device;
    let pipeline = super::scoped(device, || {
        let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("kernelfall_shader"),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("kernelfall_pipeline"),
            layout: None,
            module: &shader_module,
            entry_point: Some(entry_point),
            compilation_options: Default::default(),
            cache: None,
        })
    })
    .map_err(|e| KernelError::compilation(e.to_string()))?;

    let bind_group_layout = pipeline.get_bind_group_layout(0);

    Ok(WgpuCompiledKernel {
        pipeline,
        bind_group_layout,
    })
}
