//! NVML-based device discovery.
//!
//! [`NvmlProbe`] wraps the NVIDIA Management Library to enumerate GPUs
//! and read the memory, temperature and utilization figures the device
//! selector scores.
//!
//! NVML initialisation is **gracefully optional**: without NVIDIA drivers
//! the probe logs a warning and reports zero devices, so the pipeline
//! falls back to CPU.

use lumen_core::device::Device;
use lumen_pipeline::probe::DeviceProbe;
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::Nvml;

/// Raw NVML readings for one device, before conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceReadings {
    pub index: u32,
    pub name: String,
    pub memory_total: u64,
    pub memory_free: u64,
    /// Not every board exposes a temperature sensor.
    pub temperature_celsius: Option<u32>,
    pub utilization_percent: Option<u32>,
}

impl From<DeviceReadings> for Device {
    fn from(r: DeviceReadings) -> Self {
        Device {
            id: r.index,
            name: r.name,
            memory_total: r.memory_total,
            memory_free: r.memory_free.min(r.memory_total),
            temperature_celsius: r.temperature_celsius.map(f64::from),
            utilization_percent: r.utilization_percent.map(|u| f64::from(u.min(100))),
        }
    }
}

pub struct NvmlProbe {
    /// `None` when NVML could not be initialised (no drivers / no GPU).
    nvml: Option<Nvml>,
}

impl Default for NvmlProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl NvmlProbe {
    /// Attempt to initialise NVML.
    pub fn new() -> Self {
        let nvml = match Nvml::init() {
            Ok(nvml) => {
                tracing::info!("NVML initialised successfully");
                Some(nvml)
            }
            Err(e) => {
                tracing::warn!(error = %e, "NVML unavailable -- rendering will use the CPU");
                None
            }
        };
        Self { nvml }
    }

    /// Number of GPUs visible to NVML, or 0 if NVML is unavailable.
    pub fn gpu_count(&self) -> u32 {
        self.nvml
            .as_ref()
            .and_then(|nvml| nvml.device_count().ok())
            .unwrap_or(0)
    }

    /// Read every GPU on the host.
    ///
    /// A device whose memory cannot be read is skipped; missing
    /// temperature or utilization only leaves that field empty.
    pub fn collect(&self) -> Vec<DeviceReadings> {
        let Some(nvml) = self.nvml.as_ref() else {
            return Vec::new();
        };

        let device_count = match nvml.device_count() {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, "Failed to query GPU device count");
                return Vec::new();
            }
        };

        let mut readings = Vec::with_capacity(device_count as usize);
        for idx in 0..device_count {
            match read_device(nvml, idx) {
                Ok(r) => readings.push(r),
                Err(e) => {
                    tracing::warn!(gpu_index = idx, error = %e, "Skipping GPU -- query failed");
                }
            }
        }
        readings
    }
}

fn read_device(nvml: &Nvml, idx: u32) -> Result<DeviceReadings, nvml_wrapper::error::NvmlError> {
    let device = nvml.device_by_index(idx)?;
    let memory = device.memory_info()?;
    let name = device.name().unwrap_or_else(|_| format!("GPU {idx}"));

    Ok(DeviceReadings {
        index: idx,
        name,
        memory_total: memory.total,
        memory_free: memory.free,
        temperature_celsius: device.temperature(TemperatureSensor::Gpu).ok(),
        utilization_percent: device.utilization_rates().ok().map(|u| u.gpu),
    })
}

impl DeviceProbe for NvmlProbe {
    fn devices(&self) -> Vec<Device> {
        let devices: Vec<Device> = self.collect().into_iter().map(Device::from).collect();
        for d in &devices {
            tracing::debug!(
                device = d.id,
                name = %d.name,
                memory_free = d.memory_free,
                memory_total = d.memory_total,
                temperature = ?d.temperature_celsius,
                utilization = ?d.utilization_percent,
                "Probed GPU"
            );
        }
        devices
    }
}
