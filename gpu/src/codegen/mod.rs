//! Shader synthesis.
//!
//! Translates a validated kernel body plus the helper functions it reaches
//! into shader source for one target language. The buffer ABI every
//! synthesizer follows is described by [`BufferManifest`]:
//!
//! | binding | contents                                          |
//! |---------|---------------------------------------------------|
//! | 0       | `scalars: array<f32>`, one word per scalar param  |
//! | 1       | `shapes: array<u32>`, `(dz, dy, dx)` per array    |
//! | 2..     | one `array<f32>` per array param, in param order  |
//! | last    | `result: array<f32>`, one word per output element |
//!
//! Scalars and shapes are runtime inputs, so one compiled program serves
//! every argument value and every input shape.

pub mod wgsl;

use std::sync::Arc;

use crate::config::Dimensions;
use crate::error::Result;
use crate::functions::FunctionSnapshot;
use crate::kernel_ir::{KernelBody, ValueType};

/// Largest workgroup count along one dispatch axis.
pub const MAX_WORKGROUPS_PER_AXIS: u32 = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingRole {
    Scalars,
    Shapes,
    /// Array argument for kernel parameter `param`.
    Input { param: usize },
    Result,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingDesc {
    pub binding: u32,
    pub name: String,
    pub role: BindingRole,
    pub read_only: bool,
}

/// Buffer layout and launch shape of one compiled program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferManifest {
    bindings: Vec<BindingDesc>,
    scalar_params: Vec<usize>,
    array_params: Vec<usize>,
    output_len: usize,
    workgroup_size: u32,
    workgroups: [u32; 2],
}

impl BufferManifest {
    pub fn for_kernel(types: &[ValueType], dims: &Dimensions, workgroup_size: u32) -> Self {
        let scalar_params: Vec<usize> = (0..types.len()).filter(|&i| !types[i].is_array()).collect();
        let array_params: Vec<usize> = (0..types.len()).filter(|&i| types[i].is_array()).collect();

        let mut bindings = vec![
            BindingDesc {
                binding: 0,
                name: "scalars".into(),
                role: BindingRole::Scalars,
                read_only: true,
            },
            BindingDesc {
                binding: 1,
                name: "shapes".into(),
                role: BindingRole::Shapes,
                read_only: true,
            },
        ];
        for (slot, &param) in array_params.iter().enumerate() {
            bindings.push(BindingDesc {
                binding: 2 + slot as u32,
                name: format!("in{slot}"),
                role: BindingRole::Input { param },
                read_only: true,
            });
        }
        bindings.push(BindingDesc {
            binding: bindings.len() as u32,
            name: "result".into(),
            role: BindingRole::Result,
            read_only: false,
        });

        let output_len = dims.total();
        let groups = output_len.div_ceil(workgroup_size as usize).max(1);
        let groups_x = groups.min(MAX_WORKGROUPS_PER_AXIS as usize);
        let groups_y = groups.div_ceil(groups_x);

        BufferManifest {
            bindings,
            scalar_params,
            array_params,
            output_len,
            workgroup_size,
            workgroups: [groups_x as u32, groups_y as u32],
        }
    }

    pub fn bindings(&self) -> &[BindingDesc] {
        &self.bindings
    }

    /// Kernel parameter indices passed through the `scalars` buffer.
    pub fn scalar_params(&self) -> &[usize] {
        &self.scalar_params
    }

    /// Kernel parameter indices bound to input buffers, in binding order.
    pub fn array_params(&self) -> &[usize] {
        &self.array_params
    }

    pub fn output_len(&self) -> usize {
        self.output_len
    }

    pub fn workgroup_size(&self) -> u32 {
        self.workgroup_size
    }

    /// Workgroup counts `(x, y)`; `y > 1` only for very large outputs.
    pub fn workgroups(&self) -> [u32; 2] {
        self.workgroups
    }

    /// Threads per dispatch row; the linear element id is
    /// `gid.x + gid.y * row_stride`.
    pub fn row_stride(&self) -> u32 {
        self.workgroups[0] * self.workgroup_size
    }
}

/// What the synthesizer needs to know about one kernel.
pub struct SynthesisRequest<'a> {
    pub body: &'a Arc<KernelBody>,
    pub param_types: &'a [ValueType],
    pub dimensions: &'a Dimensions,
    pub functions: &'a FunctionSnapshot,
}

/// Host-side copy of everything a compiled program was built from.
#[derive(Debug)]
pub struct ProgramSnapshot {
    pub body: Arc<KernelBody>,
    pub param_types: Vec<ValueType>,
    pub dimensions: Dimensions,
    pub functions: FunctionSnapshot,
}

#[derive(Debug, Clone)]
pub struct ShaderSource {
    pub text: String,
    pub entry_point: String,
    pub manifest: BufferManifest,
    pub program: Arc<ProgramSnapshot>,
}

/// A shader-language back end.
pub trait ShaderSynthesizer: Send + Sync {
    fn name(&self) -> &str;

    /// Produce shader source, or `CompilationFailed` when the body cannot be
    /// expressed in the target language.
    fn synthesize(&self, request: &SynthesisRequest<'_>) -> Result<ShaderSource>;
}
