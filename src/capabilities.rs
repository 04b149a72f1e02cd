use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::Config;

/// Fixed self-stop applied to scans on Apple platforms.
pub const APPLE_SCAN_TIMEOUT: Duration = Duration::from_secs(15);

/// Runtime permissions the host may have to grant before a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Permission {
    #[serde(rename = "android.permission.ACCESS_FINE_LOCATION")]
    AccessFineLocation,
    #[serde(rename = "android.permission.BLUETOOTH")]
    Bluetooth,
    #[serde(rename = "android.permission.BLUETOOTH_ADMIN")]
    BluetoothAdmin,
    #[serde(rename = "android.permission.BLUETOOTH_SCAN")]
    BluetoothScan,
    #[serde(rename = "android.permission.BLUETOOTH_CONNECT")]
    BluetoothConnect,
}

/// What a platform requires and allows around a scan.
///
/// Selected once per host, so the precondition chain stays a single
/// implementation regardless of OS or API level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub permissions: Vec<Permission>,
    /// The host can ask the user to switch the radio on.
    pub can_prompt_enable: bool,
    /// Discovery needs the location service switched on.
    pub location_gate: bool,
    /// Append `-LE` to names of Low-Energy devices.
    pub tag_le_names: bool,
    pub scan_timeout: Option<Duration>,
}

impl Capabilities {
    pub fn android(api_level: u32) -> Self {
        // Android 12 split the scan permissions from location.
        let (permissions, location_gate) = if api_level >= 31 {
            (
                vec![Permission::BluetoothScan, Permission::BluetoothConnect],
                false,
            )
        } else {
            (
                vec![
                    Permission::AccessFineLocation,
                    Permission::Bluetooth,
                    Permission::BluetoothAdmin,
                ],
                true,
            )
        };
        Self {
            permissions,
            can_prompt_enable: true,
            location_gate,
            tag_le_names: api_level >= 18,
            scan_timeout: None,
        }
    }

    pub fn apple() -> Self {
        Self {
            permissions: vec![],
            can_prompt_enable: false,
            location_gate: false,
            tag_le_names: false,
            scan_timeout: Some(APPLE_SCAN_TIMEOUT),
        }
    }

    pub fn desktop() -> Self {
        Self {
            scan_timeout: None,
            ..Self::apple()
        }
    }

    pub fn with_config(mut self, config: &Config) -> Self {
        if let Some(secs) = config.scan_timeout_secs {
            self.scan_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        self
    }
}
