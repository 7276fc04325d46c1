//! wgpu device, pipelines and buffers behind `NativeContext`.

pub mod buffer_ops;
pub mod compile;
pub mod device_init;
pub mod dispatch;

/// Run `f` inside validation and out-of-memory error scopes, turning any
/// captured device error into `Err`.
pub(crate) fn scoped<T>(
    device: &wgpu::Device,
    f: impl FnOnce() -> T,
) -> Result<T, wgpu::Error> {
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let value = f();
    let validation = pollster::block_on(device.pop_error_scope());
    let oom = pollster::block_on(device.pop_error_scope());
    match validation.or(oom) {
        Some(err) => Err(err),
        None => Ok(value),
    }
}
