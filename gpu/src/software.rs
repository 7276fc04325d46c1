//! Host-emulated device.
//!
//! Behaves like a real backend from the executor's point of view: programs
//! are built from [`ShaderSource`], buffers hold little-endian bytes, and a
//! dispatch reads its inputs through the binding ABI and writes the result
//! buffer. The work itself is done by evaluating the program snapshot that
//! travels with the shader. Faults can be injected to exercise the
//! dispatcher's fallback path.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::{from_device_bytes, to_device_bytes};
use crate::codegen::{BufferManifest, ProgramSnapshot, ShaderSource};
use crate::error::{KernelError, Result};
use crate::interpreter::{ArrayView, ExecutionContext, Interpreter, Value};
use crate::kernel_ir::ValueType;
use crate::platform::Endianness;

/// Failures the device should report on its next operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultPlan {
    pub compile: bool,
    pub dispatch: bool,
    pub readback: bool,
}

#[derive(Default)]
struct DeviceState {
    faults: Mutex<FaultPlan>,
    host_order: Mutex<Option<Endianness>>,
    lost: AtomicBool,
    restores: AtomicUsize,
    programs_built: AtomicUsize,
    dispatches: AtomicUsize,
    bytes_uploaded: AtomicUsize,
}

/// Cloneable handle; clones share one device.
#[derive(Clone, Default)]
pub struct SoftwareDevice {
    state: Arc<DeviceState>,
}

impl std::fmt::Debug for SoftwareDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareDevice")
            .field("faults", &*self.state.faults.lock())
            .field("lost", &self.is_lost())
            .field("programs_built", &self.programs_built())
            .field("dispatches", &self.dispatch_count())
            .finish()
    }
}

pub struct SoftwareBuffer {
    bytes: Mutex<Vec<u8>>,
}

impl SoftwareBuffer {
    pub fn byte_size(&self) -> usize {
        self.bytes.lock().len()
    }
}

#[derive(Debug)]
pub struct SoftwareProgram {
    snapshot: Arc<ProgramSnapshot>,
    manifest: BufferManifest,
}

impl SoftwareProgram {
    pub fn manifest(&self) -> &BufferManifest {
        &self.manifest
    }

    #[cfg(test)]
    pub(crate) fn placeholder() -> Self {
        use crate::config::Dimensions;
        use crate::functions::FunctionSnapshot;
        use crate::kernel_ir::KernelBody;

        let dimensions = Dimensions::new(&[1]).unwrap();
        SoftwareProgram {
            manifest: BufferManifest::for_kernel(&[], &dimensions, 256),
            snapshot: Arc::new(ProgramSnapshot {
                body: Arc::new(KernelBody::build(|k| k.ret(0.0))),
                param_types: Vec::new(),
                dimensions,
                functions: FunctionSnapshot::default(),
            }),
        }
    }
}

impl SoftwareDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_faults(&self, faults: FaultPlan) {
        *self.state.faults.lock() = faults;
    }

    pub fn faults(&self) -> FaultPlan {
        *self.state.faults.lock()
    }

    /// Byte order of the host this device is attached to. Uploaded words
    /// are read, and result words written, in the order this host's codec uses.
    pub fn attach_host(&self, order: Endianness) {
        *self.state.host_order.lock() = Some(order);
    }

    pub fn host_order(&self) -> Endianness {
        self.state.host_order.lock().unwrap_or_else(Endianness::system)
    }

    /// Every later operation fails until [`restore_context`](Self::restore_context).
    pub fn lose_context(&self) {
        log::warn!("software device: context lost");
        self.state.lost.store(true, Ordering::SeqCst);
    }

    pub fn restore_context(&self) {
        if self.state.lost.swap(false, Ordering::SeqCst) {
            self.state.restores.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Bumped each time a lost context comes back.
    pub fn generation(&self) -> u64 {
        self.state.restores.load(Ordering::SeqCst) as u64
    }

    pub fn is_lost(&self) -> bool {
        self.state.lost.load(Ordering::SeqCst)
    }

    /// Programs built so far (cache misses that reached the device).
    pub fn programs_built(&self) -> usize {
        self.state.programs_built.load(Ordering::SeqCst)
    }

    pub fn dispatch_count(&self) -> usize {
        self.state.dispatches.load(Ordering::SeqCst)
    }

    pub fn bytes_uploaded(&self) -> usize {
        self.state.bytes_uploaded.load(Ordering::SeqCst)
    }

    fn check_alive(&self) -> Result<()> {
        if self.is_lost() {
            return Err(KernelError::execution("software device context lost"));
        }
        Ok(())
    }

    pub fn compile(&self, source: &ShaderSource) -> Result<SoftwareProgram> {
        if self.is_lost() {
            return Err(KernelError::compilation("software device context lost"));
        }
        if self.faults().compile {
            return Err(KernelError::compilation("injected compile fault"));
        }
        let entry = format!("fn {}(", source.entry_point);
        if !source.text.contains(&entry) {
            return Err(KernelError::compilation(format!(
                "entry point '{}' not found in shader",
                source.entry_point
            )));
        }
        self.state.programs_built.fetch_add(1, Ordering::SeqCst);
        Ok(SoftwareProgram {
            snapshot: Arc::clone(&source.program),
            manifest: source.manifest.clone(),
        })
    }

    pub fn buffer_from_bytes(&self, bytes: &[u8]) -> Result<SoftwareBuffer> {
        self.check_alive()?;
        if bytes.is_empty() {
            return Err(KernelError::execution("cannot upload an empty buffer"));
        }
        self.state
            .bytes_uploaded
            .fetch_add(bytes.len(), Ordering::SeqCst);
        Ok(SoftwareBuffer {
            bytes: Mutex::new(bytes.to_vec()),
        })
    }

    pub fn allocate(&self, byte_size: usize) -> Result<SoftwareBuffer> {
        self.check_alive()?;
        if byte_size == 0 {
            return Err(KernelError::execution("cannot allocate an empty buffer"));
        }
        Ok(SoftwareBuffer {
            bytes: Mutex::new(vec![0u8; byte_size]),
        })
    }

    pub fn dispatch(
        &self,
        program: &SoftwareProgram,
        buffers: &[&SoftwareBuffer],
        workgroups: [u32; 2],
    ) -> Result<()> {
        self.check_alive()?;
        if self.faults().dispatch {
            return Err(KernelError::execution("injected dispatch fault"));
        }
        let manifest = &program.manifest;
        if buffers.len() != manifest.bindings().len() {
            return Err(KernelError::execution(format!(
                "program expects {} binding(s), got {}",
                manifest.bindings().len(),
                buffers.len()
            )));
        }
        let order = self.host_order();
        let words = |buf: &SoftwareBuffer| from_device_bytes::<f32>(&buf.bytes.lock(), order);

        let scalars = words(buffers[0])?;
        let shapes: Vec<u32> = from_device_bytes(&buffers[1].bytes.lock(), order)?;
        let mut inputs = Vec::with_capacity(manifest.array_params().len());
        for slot in 0..manifest.array_params().len() {
            inputs.push(words(buffers[2 + slot])?);
        }

        let snapshot = &program.snapshot;
        let mut args = Vec::with_capacity(snapshot.param_types.len());
        let (mut next_scalar, mut next_array) = (0usize, 0usize);
        for ty in &snapshot.param_types {
            let value = match ty {
                ValueType::FloatArray => {
                    let base = next_array * 3;
                    let dims = shapes
                        .get(base..base + 3)
                        .ok_or_else(|| KernelError::execution("shape buffer too short"))?;
                    let view = ArrayView::from_words(
                        &inputs[next_array],
                        [dims[0] as usize, dims[1] as usize, dims[2] as usize],
                    );
                    next_array += 1;
                    Value::Array(view)
                }
                scalar => {
                    let word = scalars.get(next_scalar).copied().ok_or_else(|| {
                        KernelError::execution("scalar buffer too short")
                    })? as f64;
                    next_scalar += 1;
                    Value::Scalar(if *scalar == ValueType::Int {
                        word.trunc()
                    } else {
                        word
                    })
                }
            };
            args.push(value);
        }

        let result_buffer = buffers[buffers.len() - 1];
        let capacity = result_buffer.byte_size() / std::mem::size_of::<f32>();
        let threads = workgroups[0] as usize * workgroups[1] as usize * manifest.workgroup_size() as usize;
        let count = manifest.output_len().min(threads).min(capacity);
        let xyz = snapshot.dimensions.xyz();

        let mut out = vec![0.0f32; capacity];
        for (id, slot) in out.iter_mut().enumerate().take(count) {
            let ctx = ExecutionContext::for_linear(id, xyz);
            let value = Interpreter::new(&snapshot.functions, ctx)
                .evaluate(&snapshot.body, &args)
                .map_err(|e| KernelError::execution(format!("device fault: {e}")))?;
            *slot = value as f32;
        }
        *result_buffer.bytes.lock() = to_device_bytes(&out, order);
        self.state.dispatches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn read(&self, buffer: &SoftwareBuffer, byte_size: usize) -> Result<Vec<u8>> {
        self.check_alive()?;
        if self.faults().readback {
            return Err(KernelError::execution("injected readback fault"));
        }
        let bytes = buffer.bytes.lock();
        Ok(bytes[..byte_size.min(bytes.len())].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::wgsl::synthesize_body;
    use crate::config::Dimensions;
    use crate::functions::FunctionSnapshot;
    use crate::kernel_ir::KernelBody;

    fn doubling_source() -> ShaderSource {
        let body = Arc::new(KernelBody::build(|k| {
            let a = k.param("a");
            let x = k.thread_x();
            k.ret(a.at([x]) * 2.0);
        }));
        synthesize_body(
            &body,
            &Dimensions::new(&[4]).unwrap(),
            &FunctionSnapshot::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_dispatch_evaluates_program() {
        let device = SoftwareDevice::new();
        let order = Endianness::system();
        let program = device.compile(&doubling_source()).unwrap();
        let scalars = device.buffer_from_bytes(&to_device_bytes(&[0.0f32], order)).unwrap();
        let shapes = device
            .buffer_from_bytes(&to_device_bytes(&[1u32, 1, 4], order))
            .unwrap();
        let input = device
            .buffer_from_bytes(&to_device_bytes(&[1.0f32, 2.0, 3.0, 4.0], order))
            .unwrap();
        let result = device.allocate(16).unwrap();
        device
            .dispatch(&program, &[&scalars, &shapes, &input, &result], [1, 1])
            .unwrap();
        let bytes = device.read(&result, 16).unwrap();
        let out: Vec<f32> = from_device_bytes(&bytes, order).unwrap();
        assert_eq!(out, vec![2.0, 4.0, 6.0, 8.0]);
        assert_eq!(device.programs_built(), 1);
        assert_eq!(device.dispatch_count(), 1);
    }

    #[test]
    fn test_injected_faults() {
        let device = SoftwareDevice::new();
        device.set_faults(FaultPlan {
            compile: true,
            ..FaultPlan::default()
        });
        let err = device.compile(&doubling_source()).unwrap_err();
        assert!(matches!(err, KernelError::CompilationFailed(_)));
        assert_eq!(device.programs_built(), 0);
    }

    #[test]
    fn test_lost_context_fails_everything() {
        let device = SoftwareDevice::new();
        let handle = device.clone();
        handle.lose_context();
        assert!(device.allocate(4).is_err());
        assert!(device.compile(&doubling_source()).is_err());
        handle.restore_context();
        assert!(device.allocate(4).is_ok());
    }

    #[test]
    fn test_binding_count_is_checked() {
        let device = SoftwareDevice::new();
        let program = device.compile(&doubling_source()).unwrap();
        let only = device.allocate(16).unwrap();
        let err = device.dispatch(&program, &[&only], [1, 1]).unwrap_err();
        assert!(matches!(err, KernelError::ExecutionFailed(_)));
    }
}
