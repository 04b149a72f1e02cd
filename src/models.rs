use serde::{Deserialize, Serialize};

pub const ACTION_NEW_DEVICE: &str = "action_new_device";
pub const ACTION_SCAN_STOPPED: &str = "action_scan_stopped";

/// Plugin configuration, read from `plugins.scan-bluetooth` in `tauri.conf.json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Overrides the platform scan timeout. `0` disables the timeout.
    pub scan_timeout_secs: Option<u64>,
}

/// A discovered device as handed to the application layer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceRecord {
    pub name: String,
    pub address: String,
}

impl DeviceRecord {
    /// Builds the record for a host-reported device.
    /// Devices without a name are named after their address; with `tag_le`
    /// Low-Energy devices get a `-LE` suffix.
    pub fn from_raw(raw: RawDevice, tag_le: bool) -> Self {
        let mut name = raw.name.unwrap_or_else(|| raw.address.clone());
        if tag_le && raw.kind == DeviceKind::Le && !name.contains("-LE") {
            name.push_str("-LE");
        }
        Self {
            name,
            address: raw.address,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceKind {
    Classic,
    Le,
    Dual,
    #[default]
    Unknown,
}

/// A device as reported by the host, before any naming rules apply.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDevice {
    #[serde(default)]
    pub name: Option<String>,
    pub address: String,
    #[serde(default)]
    pub kind: DeviceKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RadioState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl From<btleplug::api::CentralState> for RadioState {
    fn from(state: btleplug::api::CentralState) -> Self {
        match state {
            btleplug::api::CentralState::PoweredOn => RadioState::PoweredOn,
            btleplug::api::CentralState::PoweredOff => RadioState::PoweredOff,
            btleplug::api::CentralState::Unknown => RadioState::Unknown,
        }
    }
}

/// Events streamed to the application while a scan session is open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ScanEvent {
    #[serde(rename = "action_new_device")]
    NewDevice(DeviceRecord),
    #[serde(rename = "action_scan_stopped")]
    ScanStopped,
}

impl ScanEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ScanEvent::NewDevice(_) => ACTION_NEW_DEVICE,
            ScanEvent::ScanStopped => ACTION_SCAN_STOPPED,
        }
    }
}
