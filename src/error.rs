use serde::{ser::SerializeStruct, Serialize, Serializer};

use thiserror::Error;
#[derive(Debug, Error)]
pub enum Error {
    #[error("Bluetooth adapter is missing, Bluetooth is not supported on this device")]
    NoBluetooth,

    #[error("Bluetooth is disabled")]
    BluetoothDisabled,

    #[error("Bluetooth is powered off")]
    BluetoothOff,

    #[error("Permission must be granted")]
    NoPermission,

    #[error("Gps need to be turned on to scan BT devices")]
    NoGps,

    #[error("Another permission or radio request is still pending")]
    Busy,

    #[error("Bridge not initialized")]
    NotInitialized,

    #[error("Pending request was interrupted before the host answered")]
    Interrupted,

    #[error("Discovery receiver is not registered")]
    ReceiverNotRegistered,

    #[error("Host cannot show the {0} prompt")]
    PromptUnsupported(&'static str),

    #[error("Btleplug error: {0}")]
    Btleplug(#[from] btleplug::Error),

    #[cfg(mobile)]
    #[error(transparent)]
    PluginInvoke(#[from] tauri::plugin::mobile::PluginInvokeError),
}

impl Error {
    /// Stable code surfaced to the application layer.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NoBluetooth => "error_no_bt",
            Error::BluetoothDisabled => "error_bluetooth_disabled",
            Error::BluetoothOff => "error_bt_off",
            Error::NoPermission => "error_no_permission",
            Error::NoGps => "error_no_gps",
            Error::Busy => "error_busy",
            Error::NotInitialized => "error_not_initialized",
            Error::Interrupted => "error_interrupted",
            Error::ReceiverNotRegistered => "error_receiver_not_registered",
            Error::PromptUnsupported(_) => "error_prompt_unsupported",
            Error::Btleplug(_) => "error_platform",
            #[cfg(mobile)]
            Error::PluginInvoke(_) => "error_platform",
        }
    }

    /// Whether the user can fix the condition and call again.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::BluetoothDisabled
                | Error::BluetoothOff
                | Error::NoPermission
                | Error::NoGps
                | Error::Busy
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("Error", 2)?;
        state.serialize_field("code", self.code())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}
