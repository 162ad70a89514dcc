/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Identifier of a compute device as reported by the device probe.
pub type DeviceId = u32;

/// Sentinel used in logs and JSON payloads for "CPU / no device".
pub const CPU_DEVICE_ID: i64 = -1;

/// A frame number as printed by the renderer (absolute, not run-relative).
pub type FrameNumber = u32;
