use lumen_core::device::Device;

/// Source of the accelerator inventory.
///
/// Probing happens once per run, before any stage is launched. An
/// implementation that cannot reach the driver reports no devices.
pub trait DeviceProbe: Send + Sync {
    fn devices(&self) -> Vec<Device>;
}

/// Fixed inventory, for CPU-only hosts and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    devices: Vec<Device>,
}

impl StaticProbe {
    pub fn new(devices: Vec<Device>) -> Self {
        Self { devices }
    }

    pub fn cpu_only() -> Self {
        Self::default()
    }
}

impl DeviceProbe for StaticProbe {
    fn devices(&self) -> Vec<Device> {
        self.devices.clone()
    }
}
