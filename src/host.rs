use async_trait::async_trait;
use serde::Serialize;

use crate::bridge::BridgeCallbacks;
use crate::capabilities::{Capabilities, Permission};
use crate::error::Result;
use crate::models::{RadioState, RawDevice};

pub const REQUEST_ENABLE_BLUETOOTH: i32 = 7338;
pub const REQUEST_PERMISSIONS: i32 = 242346;
pub const REQUEST_LOCATION: i32 = 1001;

/// A user-facing request the host shows on behalf of the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "permissions", rename_all = "camelCase")]
pub enum Prompt {
    EnableRadio,
    Permissions(Vec<Permission>),
    LocationService,
}

impl Prompt {
    pub fn request_code(&self) -> i32 {
        match self {
            Prompt::EnableRadio => REQUEST_ENABLE_BLUETOOTH,
            Prompt::Permissions(_) => REQUEST_PERMISSIONS,
            Prompt::LocationService => REQUEST_LOCATION,
        }
    }

    pub(crate) fn label(&self) -> &'static str {
        match self {
            Prompt::EnableRadio => "enable radio",
            Prompt::Permissions(_) => "permissions",
            Prompt::LocationService => "location service",
        }
    }
}

/// The OS collaborators the bridge drives.
///
/// Prompts and discovery are fire-and-forget on the host side: answers,
/// discovered devices and discovery completion come back through the
/// [`BridgeCallbacks`] handed to [`HostContext::request`] and
/// [`HostContext::register_receiver`].
#[async_trait]
pub trait HostContext: Send + Sync {
    /// Permission set and prompt flows of this platform.
    fn capabilities(&self) -> Capabilities;

    async fn radio_state(&self) -> Result<RadioState>;

    async fn permission_granted(&self, permission: Permission) -> Result<bool>;

    async fn location_enabled(&self) -> Result<bool>;

    /// Shows `prompt`. The host answers with
    /// [`BridgeCallbacks::activity_result`] or
    /// [`BridgeCallbacks::permissions_result`] using the prompt's request code.
    async fn request(&self, prompt: Prompt, callbacks: BridgeCallbacks) -> Result<()>;

    fn register_receiver(&self, callbacks: BridgeCallbacks) -> Result<()>;

    /// Fails with [`crate::Error::ReceiverNotRegistered`] when nothing is registered.
    fn unregister_receiver(&self) -> Result<()>;

    async fn is_discovering(&self) -> Result<bool>;

    async fn start_discovery(&self) -> Result<()>;

    async fn cancel_discovery(&self) -> Result<()>;

    /// Devices the OS already knows about without scanning.
    async fn bonded_devices(&self) -> Result<Vec<RawDevice>>;
}
