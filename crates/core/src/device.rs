//! Compute device scoring and selection.
//!
//! Pure logic over a point-in-time device snapshot. Probing hardware is the
//! caller's job; nothing here touches a driver.

use serde::{Deserialize, Serialize};

use crate::config::DevicePreference;
use crate::error::CoreError;
use crate::threshold_validation::validate_unit_interval;
use crate::types::DeviceId;

/// Weight of the free-memory score in the total score.
pub const MEMORY_WEIGHT: f64 = 0.6;
/// Weight of the temperature score in the total score.
pub const TEMPERATURE_WEIGHT: f64 = 0.2;
/// Weight of the utilization score in the total score.
pub const UTILIZATION_WEIGHT: f64 = 0.2;
/// Temperature (Celsius) at which the temperature score reaches zero.
pub const TEMPERATURE_CEILING_CELSIUS: f64 = 85.0;
/// Default usable fraction of a device's free memory.
pub const DEFAULT_MEMORY_THRESHOLD: f64 = 0.8;

/// Read-only snapshot of one compute device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    /// Bytes.
    pub memory_total: u64,
    /// Bytes, `<= memory_total`.
    pub memory_free: u64,
    pub temperature_celsius: Option<f64>,
    /// Percent, 0-100.
    pub utilization_percent: Option<f64>,
}

impl Device {
    pub fn memory_used(&self) -> u64 {
        self.memory_total.saturating_sub(self.memory_free)
    }
}

/// Score a single device. Higher is better.
///
/// `0.6 * memory + 0.2 * temperature + 0.2 * utilization`, each sub-score
/// on a 0-100 scale. Unknown temperature or utilization contributes 0.
pub fn score_device(device: &Device) -> f64 {
    let memory_score = if device.memory_total == 0 {
        0.0
    } else {
        let used_ratio = device.memory_used() as f64 / device.memory_total as f64;
        (1.0 - used_ratio) * 100.0
    };

    let temp_score = device
        .temperature_celsius
        .map(|t| {
            ((TEMPERATURE_CEILING_CELSIUS - t) / TEMPERATURE_CEILING_CELSIUS * 100.0).max(0.0)
        })
        .unwrap_or(0.0);

    let util_score = device
        .utilization_percent
        .map(|u| 100.0 - u)
        .unwrap_or(0.0);

    MEMORY_WEIGHT * memory_score + TEMPERATURE_WEIGHT * temp_score + UTILIZATION_WEIGHT * util_score
}

/// Device selection policy parameterised by the usable memory fraction.
#[derive(Debug, Clone, Copy)]
pub struct DeviceSelector {
    memory_threshold: f64,
}

impl Default for DeviceSelector {
    fn default() -> Self {
        Self {
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
        }
    }
}

impl DeviceSelector {
    /// Create a selector. `memory_threshold` must lie in `(0, 1]`.
    pub fn new(memory_threshold: f64) -> Result<Self, CoreError> {
        validate_unit_interval(memory_threshold, "memory_threshold")?;
        Ok(Self { memory_threshold })
    }

    pub fn memory_threshold(&self) -> f64 {
        self.memory_threshold
    }

    /// Return the id of the highest-scoring device, or `None` (use CPU)
    /// when the snapshot is empty.
    ///
    /// Ties are broken in favour of the lowest device id.
    pub fn select_best_device(&self, devices: &[Device]) -> Option<DeviceId> {
        let mut best: Option<(DeviceId, f64)> = None;
        for device in devices {
            let score = score_device(device);
            best = match best {
                Some((id, best_score))
                    if best_score > score || (best_score == score && id < device.id) =>
                {
                    Some((id, best_score))
                }
                _ => Some((device.id, score)),
            };
        }
        best.map(|(id, _)| id)
    }

    /// `true` iff `required` bytes fit in the usable share of the device's
    /// free memory.
    pub fn check_memory_available(&self, required: u64, device: &Device) -> bool {
        required as f64 <= device.memory_free as f64 * self.memory_threshold
    }
}

/// Resolve a configured preference against a device snapshot.
///
/// A specific device id that the probe did not report is a configuration
/// error, not a silent fallback to CPU.
pub fn resolve_device(
    preference: DevicePreference,
    devices: &[Device],
    selector: &DeviceSelector,
) -> Result<Option<DeviceId>, CoreError> {
    match preference {
        DevicePreference::Auto => Ok(selector.select_best_device(devices)),
        DevicePreference::Cpu => Ok(None),
        DevicePreference::Device(id) => {
            if devices.iter().any(|d| d.id == id) {
                Ok(Some(id))
            } else {
                Err(CoreError::Configuration(format!(
                    "device {id} is not present (found {} device(s))",
                    devices.len()
                )))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn make_device(id: DeviceId, free_ratio: f64, temp: Option<f64>, util: Option<f64>) -> Device {
        let total = 10 * GIB;
        Device {
            id,
            name: format!("GPU {id}"),
            memory_total: total,
            memory_free: (total as f64 * free_ratio) as u64,
            temperature_celsius: temp,
            utilization_percent: util,
        }
    }

    #[test]
    fn empty_snapshot_selects_cpu() {
        assert_eq!(DeviceSelector::default().select_best_device(&[]), None);
    }

    #[test]
    fn cool_idle_device_beats_hot_busy_device() {
        let a = make_device(0, 0.9, Some(40.0), Some(10.0));
        let b = make_device(1, 0.3, Some(80.0), Some(90.0));
        let selector = DeviceSelector::default();
        assert_eq!(selector.select_best_device(&[b.clone(), a.clone()]), Some(0));
        assert!(score_device(&a) > score_device(&b));
    }

    #[test]
    fn score_matches_weighted_formula() {
        let d = make_device(0, 0.5, Some(42.5), Some(25.0));
        // memory 50, temp 50, util 75
        let expected = 0.6 * 50.0 + 0.2 * 50.0 + 0.2 * 75.0;
        assert!((score_device(&d) - expected).abs() < 1e-6);
    }

    #[test]
    fn unknown_sensors_contribute_zero() {
        let d = make_device(0, 1.0, None, None);
        assert!((score_device(&d) - 60.0).abs() < 1e-6);
    }

    #[test]
    fn temperature_above_ceiling_clamps_to_zero() {
        let d = make_device(0, 0.0, Some(95.0), None);
        assert_eq!(score_device(&d), 0.0);
    }

    #[test]
    fn zero_total_memory_does_not_divide_by_zero() {
        let d = Device {
            memory_total: 0,
            memory_free: 0,
            ..make_device(0, 0.0, None, None)
        };
        assert_eq!(score_device(&d), 0.0);
    }

    #[test]
    fn ties_prefer_lowest_id() {
        let d2 = make_device(2, 0.5, Some(50.0), Some(50.0));
        let d1 = make_device(1, 0.5, Some(50.0), Some(50.0));
        let d3 = make_device(3, 0.5, Some(50.0), Some(50.0));
        let selector = DeviceSelector::default();
        assert_eq!(selector.select_best_device(&[d2, d3, d1]), Some(1));
    }

    #[test]
    fn memory_check_applies_threshold() {
        let selector = DeviceSelector::new(0.5).expect("valid threshold");
        let d = Device {
            memory_free: 8 * GIB,
            ..make_device(0, 1.0, None, None)
        };
        assert!(selector.check_memory_available(4 * GIB, &d));
        assert!(!selector.check_memory_available(4 * GIB + 1, &d));
    }

    #[test]
    fn threshold_outside_unit_interval_is_rejected() {
        assert!(DeviceSelector::new(0.0).is_err());
        assert!(DeviceSelector::new(1.5).is_err());
        assert!(DeviceSelector::new(1.0).is_ok());
    }

    #[test]
    fn resolve_specific_device() {
        let devices = vec![make_device(0, 0.5, None, None), make_device(1, 0.5, None, None)];
        let selector = DeviceSelector::default();
        assert_eq!(
            resolve_device(DevicePreference::Device(1), &devices, &selector).expect("resolve"),
            Some(1)
        );
        assert_matches!(
            resolve_device(DevicePreference::Device(5), &devices, &selector),
            Err(CoreError::Configuration(_))
        );
    }

    #[test]
    fn resolve_cpu_ignores_devices() {
        let devices = vec![make_device(0, 1.0, Some(30.0), Some(0.0))];
        let selector = DeviceSelector::default();
        assert_eq!(
            resolve_device(DevicePreference::Cpu, &devices, &selector).expect("resolve"),
            None
        );
    }
}
