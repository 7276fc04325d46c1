//! Adapter probing and device creation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{KernelError, Result};

/// Device, queue and loss flag for one wgpu adapter.
pub struct WgpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_name: String,
    lost: Arc<AtomicBool>,
}

fn probe_adapter() -> Option<wgpu::Adapter> {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    }))
}

impl WgpuContext {
    /// Open the highest-performance adapter, if there is one.
    pub fn new() -> Option<Self> {
        let adapter = probe_adapter()?;
        let info = adapter.get_info();
        let request = adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("kernelfall"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
                ..Default::default()
            },
            None,
        );
        let (device, queue) = match pollster::block_on(request) {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("adapter '{}' refused a device: {e}", info.name);
                return None;
            }
        };

        device.on_uncaptured_error(Box::new(|err: wgpu::Error| {
            log::error!("uncaptured wgpu error: {err}");
        }));
        let lost = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&lost);
        device.set_device_lost_callback(move |reason, message| {
            log::warn!("wgpu device lost ({reason:?}): {message}");
            flag.store(true, Ordering::SeqCst);
        });

        log::info!("wgpu adapter '{}' ({:?})", info.name, info.backend);
        Some(WgpuContext {
            device,
            queue,
            adapter_name: info.name,
            lost,
        })
    }

    pub fn is_available() -> bool {
        probe_adapter().is_some()
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// `Err(ExecutionFailed)` once the device has been lost.
    pub(crate) fn ensure_alive(&self) -> Result<()> {
        if self.is_lost() {
            return Err(KernelError::execution(format!(
                "wgpu device '{}' is lost",
                self.adapter_name
            )));
        }
        Ok(())
    }
}
